//! Controller and editor agents talking through a real relay.
//!
//! Tests may use `.unwrap()` and `.expect()`.

use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use fl0w_agent::controller::{HostSystem, SyntheticSource};
use fl0w_agent::{ClientConfig, ControllerAgent, EditorAgent, RelayClient};
use fl0w_core::{Channel, ControllerConfig, EditorConfig, PeerId};
use fl0w_protocol::{routes, Envelope, InterestOp, PeersRequest, SubscribeRequest};
use fl0wd::registry::spawn_registry;
use fl0wd::server::RelayServer;
use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::time::{sleep, timeout, Instant};
use tokio_util::sync::CancellationToken;

// ============================================================================
// Constants
// ============================================================================

/// Upper bound for anything to propagate through relay, agents and watchers
const SETTLE_TIMEOUT: Duration = Duration::from_secs(5);

const POLL_STEP: Duration = Duration::from_millis(50);

// ============================================================================
// Test Helpers
// ============================================================================

struct Fleet {
    address: String,
    cancel_token: CancellationToken,
    controller: Arc<ControllerAgent>,
    editor_folder: PathBuf,
    _dirs: Vec<tempfile::TempDir>,
}

impl Fleet {
    /// Relay plus one controller and one editor, the editor folder seeded first.
    async fn spawn(seed: &[(&str, &str)]) -> Self {
        let cancel_token = CancellationToken::new();
        let server = RelayServer::bind("127.0.0.1:0", spawn_registry(), cancel_token.clone())
            .await
            .expect("bind relay");
        let address = server.local_addr().unwrap().to_string();
        tokio::spawn(async move {
            let _ = server.run().await;
        });

        let controller_dir = tempfile::tempdir().unwrap();
        let controller = Arc::new(
            ControllerAgent::new(
                ControllerConfig {
                    server_address: address.clone(),
                    output_unbuffer: String::new(),
                    programs_path: controller_dir.path().join("programs"),
                    poll_interval_ms: 50,
                    ..ControllerConfig::default()
                },
                Arc::new(HostSystem),
                Arc::new(SyntheticSource),
            )
            .unwrap(),
        );

        let editor_dir = tempfile::tempdir().unwrap();
        for (path, content) in seed {
            let full = editor_dir.path().join(path);
            fs::create_dir_all(full.parent().unwrap()).unwrap();
            fs::write(full, content).unwrap();
        }
        let editor = Arc::new(
            EditorAgent::new(&EditorConfig {
                server_address: address.clone(),
                folder: editor_dir.path().to_path_buf(),
                ..EditorConfig::default()
            })
            .unwrap(),
        );
        let editor_folder = editor.folder_root().await;

        spawn_client(&address, &cancel_token, Arc::clone(&controller));
        // Controller first so the editor finds it on its first roster.
        sleep(Duration::from_millis(200)).await;
        spawn_client(&address, &cancel_token, editor);

        Self {
            address,
            cancel_token,
            controller,
            editor_folder,
            _dirs: vec![controller_dir, editor_dir],
        }
    }

    async fn programs_root(&self) -> PathBuf {
        self.controller.programs_root().await
    }

    fn shutdown(self) {
        self.cancel_token.cancel();
    }
}

fn spawn_client<A>(address: &str, cancel_token: &CancellationToken, agent: Arc<A>)
where
    A: fl0w_agent::RelayAgent + 'static,
{
    let client = RelayClient::new(ClientConfig::new(address), cancel_token.clone());
    tokio::spawn(async move {
        let _ = client.run(agent.as_ref()).await;
    });
}

async fn wait_for_file(path: &Path, expected: &str) {
    let deadline = Instant::now() + SETTLE_TIMEOUT;
    loop {
        if fs::read_to_string(path).ok().as_deref() == Some(expected) {
            return;
        }
        assert!(
            Instant::now() < deadline,
            "{} never reached expected content",
            path.display()
        );
        sleep(POLL_STEP).await;
    }
}

/// Bare relay peer standing in for a web observer.
struct Observer {
    reader: BufReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
}

impl Observer {
    async fn connect(address: &str) -> Self {
        let stream = TcpStream::connect(address).await.unwrap();
        let (reader, writer) = stream.into_split();
        let mut observer = Self {
            reader: BufReader::new(reader),
            writer,
        };
        observer
            .send(Envelope::send(
                routes::SUBSCRIBE,
                SubscribeRequest::to_value(Channel::Web, "observer"),
            ))
            .await;
        observer
    }

    async fn send(&mut self, envelope: Envelope) {
        let line = envelope.encode().unwrap();
        self.writer.write_all(line.as_bytes()).await.unwrap();
        self.writer.write_all(b"\n").await.unwrap();
    }

    async fn recv_route(&mut self, route: &str) -> Envelope {
        loop {
            let mut line = String::new();
            timeout(SETTLE_TIMEOUT, self.reader.read_line(&mut line))
                .await
                .expect("timed out waiting for message")
                .unwrap();
            let envelope = Envelope::decode(&line).unwrap();
            if envelope.route == route {
                return envelope;
            }
        }
    }

    async fn controller_id(&mut self) -> PeerId {
        self.send(Envelope::send(
            routes::PEERS,
            PeersRequest::to_value(InterestOp::Snapshot, &[Channel::Controller]),
        ))
        .await;
        let roster = self.recv_route(routes::PEERS).await;
        let id = roster
            .data
            .as_object()
            .and_then(|map| map.keys().next().cloned())
            .expect("a controller in the roster");
        PeerId::new(id)
    }
}

// ============================================================================
// Sync
// ============================================================================

#[tokio::test]
async fn test_editor_tree_reaches_controller_on_connect() {
    let fleet = Fleet::spawn(&[("demo/main.c", "int main() { return 0; }")]).await;

    let target = fleet.programs_root().await.join("demo").join("main.c");
    wait_for_file(&target, "int main() { return 0; }").await;

    fleet.shutdown();
}

#[tokio::test]
async fn test_editor_edits_follow_after_session_start() {
    let fleet = Fleet::spawn(&[("seed.txt", "seed")]).await;
    let programs = fleet.programs_root().await;
    wait_for_file(&programs.join("seed.txt"), "seed").await;

    fs::write(fleet.editor_folder.join("later.c"), "// later").unwrap();
    wait_for_file(&programs.join("later.c"), "// later").await;

    fleet.shutdown();
}

#[tokio::test]
async fn test_controller_edits_reach_editor() {
    let fleet = Fleet::spawn(&[("seed.txt", "seed")]).await;
    let programs = fleet.programs_root().await;
    wait_for_file(&programs.join("seed.txt"), "seed").await;

    fs::write(programs.join("from_bot.c"), "// bot").unwrap();
    wait_for_file(&fleet.editor_folder.join("from_bot.c"), "// bot").await;

    fleet.shutdown();
}

// ============================================================================
// Controller routes through the relay
// ============================================================================

#[tokio::test]
async fn test_sensor_readings_are_piped_to_subscriber() {
    let fleet = Fleet::spawn(&[]).await;
    let mut observer = Observer::connect(&fleet.address).await;
    let controller = observer.controller_id().await;

    observer
        .send(Envelope::pipe(
            routes::SENSOR,
            json!({"subscribe": {"analog": [3]}}),
            controller.clone(),
        ))
        .await;

    let reading = observer.recv_route(routes::SENSOR).await;
    assert_eq!(reading.from, Some(controller));
    let value = reading.data["analog"]["3"].as_i64().unwrap();
    assert!((0..=4095).contains(&value));
    assert_eq!(reading.data["digital"], json!({}));

    fleet.shutdown();
}

#[tokio::test]
async fn test_run_streams_output_through_relay() {
    let fleet = Fleet::spawn(&[]).await;
    let program_dir = fleet.programs_root().await.join("echo_ok");
    fs::create_dir_all(&program_dir).unwrap();
    let binary = program_dir.join("botball_user_program");
    fs::write(&binary, "#!/bin/sh\necho ok\n").unwrap();
    fs::set_permissions(&binary, fs::Permissions::from_mode(0o755)).unwrap();

    let mut observer = Observer::connect(&fleet.address).await;
    let controller = observer.controller_id().await;
    observer
        .send(Envelope::pipe(
            routes::WALLABY_CONTROL,
            json!({"run": "echo_ok"}),
            controller,
        ))
        .await;

    let line = observer.recv_route(routes::STD_STREAM).await;
    assert_eq!(line.data, Value::String("ok".to_string()));
    let done = observer.recv_route(routes::STD_STREAM).await;
    assert_eq!(done.data, json!({"return_code": 0}));

    fleet.shutdown();
}
