//! Controller agent: the relay peer running on a robot controller.
//!
//! # Routes
//!
//! | Route             | Handling                                            |
//! |-------------------|-----------------------------------------------------|
//! | `sensor`          | subscription changes for the sending peer           |
//! | `wallaby_control` | run / stop / disconnect / reboot / shutdown         |
//! | `hostname`        | `{"set": name}`, then re-announce under the new name|
//! | `processes`       | host process list piped back to the sender          |
//! | `sync`            | [`Responder`] over the programs folder              |
//! | `peers`           | roster pushes, used to drop departed subscribers    |
//!
//! # Session Lifecycle
//!
//! ```text
//! on_connect ──▶ subscribe + peers, spawn poll loop and folder watch
//!     │
//!     ▼
//! on_message (one at a time)
//!     │
//!     ▼
//! on_disconnect ──▶ kill program, cancel session tasks,
//!                   clear sensor state, record last stop time
//!     │
//!     ▼
//! on_stop ──▶ pending reboot / shutdown, after the session closed
//! ```

pub mod process;
pub mod sensor;
pub mod source;
pub mod system;

use std::collections::BTreeSet;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use fl0w_core::{Channel, ControllerConfig, PeerId};
use fl0w_protocol::{
    parse_hostname_set, routes, std_stream, ControlCommand, Envelope, InterestOp, PeersRequest,
    Roster, SensorRequest, SubscribeRequest, SyncMessage,
};
use fl0w_sync::{now_secs, FolderWatcher, IgnoreSet, Responder, SyncFolder};
use serde_json::Value;
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::client::{Flow, RelayAgent, RelayLink};
use crate::error::Result;

pub use process::{ProcessController, ProcessOutput, ProcessState};
pub use sensor::{SensorEngine, SubscriptionTable};
pub use source::{SensorSource, SyntheticSource};
pub use system::{HostSystem, SystemActions};

pub struct ControllerAgent {
    config: ControllerConfig,
    system: Arc<dyn SystemActions>,
    sensors: SensorEngine,
    process: ProcessController,
    responder: Arc<Mutex<Responder>>,
    /// Cancels the poll loop and folder watch of the current session
    session: Mutex<Option<CancellationToken>>,
    /// Power action requested over the relay, run once the client stops
    pending_power: Mutex<Option<PowerAction>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PowerAction {
    Reboot,
    Shutdown,
}

impl ControllerAgent {
    /// Opens the programs folder (created if missing) for syncing.
    pub fn new(
        config: ControllerConfig,
        system: Arc<dyn SystemActions>,
        source: Arc<dyn SensorSource>,
    ) -> Result<Self> {
        let folder = SyncFolder::open(&config.programs_path, IgnoreSet::default())?;
        let process = ProcessController::new(folder.root(), config.output_unbuffer.clone());

        Ok(Self {
            system,
            sensors: SensorEngine::new(source),
            process,
            responder: Arc::new(Mutex::new(Responder::new(folder))),
            session: Mutex::new(None),
            pending_power: Mutex::new(None),
            config,
        })
    }

    pub fn process(&self) -> &ProcessController {
        &self.process
    }

    pub fn sensors(&self) -> &SensorEngine {
        &self.sensors
    }

    pub fn responder(&self) -> Arc<Mutex<Responder>> {
        Arc::clone(&self.responder)
    }

    pub async fn programs_root(&self) -> PathBuf {
        self.responder.lock().await.folder().root().to_path_buf()
    }

    fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.config.poll_interval_ms.max(1))
    }

    async fn announce(&self, link: &RelayLink, name: &str) -> Result<()> {
        link.send_route(
            routes::SUBSCRIBE,
            SubscribeRequest::to_value(Channel::Controller, name),
        )
        .await
    }

    // ------------------------------------------------------------------------
    // Route handlers
    // ------------------------------------------------------------------------

    async fn on_roster(&self, data: &Value) {
        let Ok(roster) = serde_json::from_value::<Roster>(data.clone()) else {
            debug!("Ignoring malformed roster");
            return;
        };
        // Only peers in the current roster keep their subscriptions.
        let present: BTreeSet<PeerId> = roster.into_keys().collect();
        self.sensors.retain_peers(|id| present.contains(id)).await;
    }

    async fn on_control(&self, command: ControlCommand, from: PeerId, link: &RelayLink) -> Flow {
        info!(peer_id = %from, command = ?command, "Control command");

        match command {
            ControlCommand::Run(program) => {
                self.start_program(&program, from, link).await;
                Flow::Continue
            }
            ControlCommand::Stop => {
                if !self.process.stop().await {
                    info!(peer_id = %from, "Stop requested while idle");
                }
                Flow::Continue
            }
            ControlCommand::Disconnect => {
                self.process.stop().await;
                Flow::Stop
            }
            ControlCommand::Reboot => self.request_power(PowerAction::Reboot).await,
            ControlCommand::Shutdown => self.request_power(PowerAction::Shutdown).await,
        }
    }

    async fn request_power(&self, action: PowerAction) -> Flow {
        self.process.stop().await;
        *self.pending_power.lock().await = Some(action);
        Flow::Stop
    }

    async fn start_program(&self, program: &str, from: PeerId, link: &RelayLink) {
        let (tx, rx) = mpsc::unbounded_channel();

        match self.process.run(program, tx).await {
            Ok(()) => {
                tokio::spawn(forward_output(rx, link.clone(), from));
            }
            Err(e) => {
                warn!(peer_id = %from, program = %program, error = %e, "Run rejected");
                if link
                    .pipe(routes::STD_STREAM, std_stream::error(e.to_string()), from)
                    .await
                    .is_err()
                {
                    debug!("Relay link closed before run rejection was sent");
                }
            }
        }
    }

    async fn on_hostname(&self, data: &Value, link: &RelayLink) {
        let Some(name) = parse_hostname_set(data) else {
            return;
        };
        match self.system.set_hostname(&name).await {
            Ok(()) => {
                info!(hostname = %name, "Hostname changed");
                if let Err(e) = self.announce(link, &name).await {
                    debug!(error = %e, "Failed to re-announce after hostname change");
                }
            }
            Err(e) => warn!(hostname = %name, error = %e, "Failed to set hostname"),
        }
    }

    async fn on_sync(&self, data: &Value, from: PeerId, link: &RelayLink) {
        let Some(message) = SyncMessage::parse(data) else {
            debug!(peer_id = %from, "Ignoring malformed sync message");
            return;
        };

        let replies = self.responder.lock().await.handle(message);
        for reply in replies {
            debug!(peer_id = %from, kind = reply.kind(), "Sync reply");
            if link.pipe(routes::SYNC, reply.to_value(), from.clone()).await.is_err() {
                return;
            }
        }
    }
}

#[async_trait]
impl RelayAgent for ControllerAgent {
    async fn on_connect(&self, link: RelayLink) -> Result<()> {
        let name = self.system.hostname();
        self.announce(&link, &name).await?;
        link.send_route(
            routes::PEERS,
            PeersRequest::to_value(InterestOp::Subscribe, &[Channel::Editor, Channel::Web]),
        )
        .await?;
        info!(name = %name, "Controller announced");

        let session = CancellationToken::new();
        if let Some(previous) = self.session.lock().await.replace(session.clone()) {
            previous.cancel();
        }

        tokio::spawn(self.sensors.clone().run_poll_loop(
            self.poll_interval(),
            link.clone(),
            session.clone(),
        ));

        let root = self.programs_root().await;
        match FolderWatcher::spawn(&root) {
            Ok((watcher, events)) => {
                tokio::spawn(watch_programs(
                    watcher,
                    events,
                    Arc::clone(&self.responder),
                    link,
                    session,
                ));
            }
            Err(e) => warn!(error = %e, "Programs folder not watched, local edits will not sync"),
        }

        Ok(())
    }

    async fn on_message(&self, envelope: Envelope, link: &RelayLink) -> Flow {
        let Envelope {
            route, data, from, ..
        } = envelope;

        if route == routes::PEERS {
            self.on_roster(&data).await;
            return Flow::Continue;
        }

        let Some(from) = from else {
            debug!(route = %route, "Ignoring message without sender");
            return Flow::Continue;
        };

        match route.as_str() {
            routes::SENSOR => {
                self.sensors.apply(&from, &SensorRequest::parse(&data)).await;
            }
            routes::WALLABY_CONTROL => {
                if let Some(command) = ControlCommand::parse(&data) {
                    return self.on_control(command, from, link).await;
                }
            }
            routes::HOSTNAME => self.on_hostname(&data, link).await,
            routes::PROCESSES => {
                let lines = self.system.processes();
                if link.pipe(routes::PROCESSES, Value::from(lines), from).await.is_err() {
                    debug!("Relay link closed before process list was sent");
                }
            }
            routes::SYNC => self.on_sync(&data, from, link).await,
            other => debug!(route = %other, "Ignoring unhandled route"),
        }

        Flow::Continue
    }

    async fn on_disconnect(&self) {
        if let Some(session) = self.session.lock().await.take() {
            session.cancel();
        }
        if self.process.stop().await {
            info!("Killed running program on relay disconnect");
        }
        self.sensors.clear().await;
        self.responder.lock().await.mark_stopped(now_secs());
    }

    async fn on_stop(&self) {
        let Some(action) = self.pending_power.lock().await.take() else {
            return;
        };
        info!(action = ?action, "Relay session closed, running power action");
        let result = match action {
            PowerAction::Reboot => self.system.reboot().await,
            PowerAction::Shutdown => self.system.shutdown().await,
        };
        if let Err(e) = result {
            warn!(action = ?action, error = %e, "Power action failed");
        }
    }
}

/// Pipes program output to the peer that started it.
async fn forward_output(
    mut output: mpsc::UnboundedReceiver<ProcessOutput>,
    link: RelayLink,
    to: PeerId,
) {
    while let Some(item) = output.recv().await {
        let data = match item {
            ProcessOutput::Line(line) => std_stream::line(line),
            ProcessOutput::Exited(code) => std_stream::return_code(code),
        };
        if link.pipe(routes::STD_STREAM, data, to.clone()).await.is_err() {
            debug!(peer_id = %to, "Relay link closed, dropping program output");
            return;
        }
    }
}

/// Broadcasts local edits in the programs folder to every editor.
async fn watch_programs(
    _watcher: FolderWatcher,
    mut events: mpsc::UnboundedReceiver<PathBuf>,
    responder: Arc<Mutex<Responder>>,
    link: RelayLink,
    cancel: CancellationToken,
) {
    loop {
        let path = tokio::select! {
            _ = cancel.cancelled() => break,
            path = events.recv() => match path {
                Some(path) => path,
                None => break,
            },
        };

        let message = responder.lock().await.local_change(&path);
        if let Some(message) = message {
            debug!(path = %path.display(), kind = message.kind(), "Broadcasting local change");
            if link
                .broadcast(routes::SYNC, message.to_value(), Channel::Editor)
                .await
                .is_err()
            {
                break;
            }
        }
    }
    debug!("Programs folder watch stopped");
}
