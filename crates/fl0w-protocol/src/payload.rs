//! Route payloads.
//!
//! Inbound payloads are parsed leniently: anything missing an expected key
//! or failing a type/range check is dropped without an error reply.

use std::collections::BTreeMap;

use fl0w_core::{Channel, PeerId, Port, SensorMode};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

// ============================================================================
// subscribe
// ============================================================================

/// `{"channel": int, "name": string}`, both keys optional.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SubscribeRequest {
    pub channel: Option<Channel>,
    pub name: Option<String>,
}

impl SubscribeRequest {
    /// Parses the payload; returns `None` if it is not a mapping.
    pub fn parse(data: &Value) -> Option<Self> {
        let obj = data.as_object()?;
        Some(Self {
            channel: obj.get("channel").and_then(Channel::from_value),
            name: obj.get("name").and_then(Value::as_str).map(str::to_string),
        })
    }

    /// Builds the payload an agent sends to identify itself.
    pub fn to_value(channel: Channel, name: &str) -> Value {
        json!({ "channel": channel.tag(), "name": name })
    }
}

// ============================================================================
// peers
// ============================================================================

/// Operation on an observer's Interest Set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InterestOp {
    /// Add channels and push a roster for them
    Subscribe,
    /// Remove channels, no reply
    Unsubscribe,
    /// One-shot roster for the given channels, nothing persisted
    Snapshot,
}

impl InterestOp {
    /// Processing order for a request carrying several keys.
    pub const ORDER: [InterestOp; 3] = [
        InterestOp::Subscribe,
        InterestOp::Unsubscribe,
        InterestOp::Snapshot,
    ];

    /// Payload key for this operation.
    pub fn key(self) -> &'static str {
        match self {
            Self::Subscribe => "subscribe",
            Self::Unsubscribe => "unsubscribe",
            Self::Snapshot => "channels",
        }
    }

    /// Whether this operation replies with a roster.
    pub fn pushes_roster(self) -> bool {
        !matches!(self, Self::Unsubscribe)
    }
}

/// Parsed `peers` request: each present key with its valid channels.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PeersRequest {
    pub ops: Vec<(InterestOp, Vec<Channel>)>,
}

impl PeersRequest {
    pub fn parse(data: &Value) -> Self {
        let mut ops = Vec::new();
        let Some(obj) = data.as_object() else {
            return Self { ops };
        };

        for op in InterestOp::ORDER {
            if let Some(list) = obj.get(op.key()).and_then(Value::as_array) {
                let mut channels: Vec<Channel> = Vec::new();
                for channel in list.iter().filter_map(Channel::from_value) {
                    if !channels.contains(&channel) {
                        channels.push(channel);
                    }
                }
                ops.push((op, channels));
            }
        }

        Self { ops }
    }

    /// Builds a request payload with a single operation.
    pub fn to_value(op: InterestOp, channels: &[Channel]) -> Value {
        let tags: Vec<Value> = channels.iter().map(|c| Value::from(c.tag())).collect();
        let mut obj = serde_json::Map::new();
        obj.insert(op.key().to_string(), Value::Array(tags));
        Value::Object(obj)
    }
}

/// One roster entry: `{"name", "address", "port", "channel"}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RosterEntry {
    pub name: String,
    pub address: String,
    pub port: u16,
    pub channel: Channel,
}

/// Peers visible to an observer, keyed by peer ID.
pub type Roster = BTreeMap<PeerId, RosterEntry>;

// ============================================================================
// sensor
// ============================================================================

/// Direction of a sensor subscription change.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriptionOp {
    Subscribe,
    Unsubscribe,
}

impl SubscriptionOp {
    pub const ALL: [SubscriptionOp; 2] = [SubscriptionOp::Subscribe, SubscriptionOp::Unsubscribe];

    pub fn key(self) -> &'static str {
        match self {
            Self::Subscribe => "subscribe",
            Self::Unsubscribe => "unsubscribe",
        }
    }
}

/// `{"subscribe": {"analog": [int], "digital": [int]}}` / `{"unsubscribe": {...}}`.
///
/// Non-integer and out-of-range ports are dropped silently.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SensorRequest {
    pub changes: Vec<(SubscriptionOp, SensorMode, Port)>,
}

impl SensorRequest {
    pub fn parse(data: &Value) -> Self {
        let mut changes = Vec::new();
        let Some(obj) = data.as_object() else {
            return Self { changes };
        };

        for op in SubscriptionOp::ALL {
            let Some(modes) = obj.get(op.key()).and_then(Value::as_object) else {
                continue;
            };
            for mode in SensorMode::ALL {
                let Some(ports) = modes.get(mode.key()).and_then(Value::as_array) else {
                    continue;
                };
                for port in ports.iter().filter_map(Value::as_i64) {
                    if let Some(port) = mode.validate_port(port) {
                        changes.push((op, mode, port));
                    }
                }
            }
        }

        Self { changes }
    }
}

/// One tick's readings for one subscriber.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SensorReadings {
    pub analog: BTreeMap<Port, i32>,
    pub digital: BTreeMap<Port, i32>,
}

impl SensorReadings {
    /// Records a value under its mode.
    pub fn insert(&mut self, mode: SensorMode, port: Port, value: i32) {
        match mode {
            SensorMode::Analog => self.analog.insert(port, value),
            SensorMode::Digital => self.digital.insert(port, value),
        };
    }

    pub fn is_empty(&self) -> bool {
        self.analog.is_empty() && self.digital.is_empty()
    }
}

// ============================================================================
// wallaby_control / std_stream
// ============================================================================

/// Controller command: a bare string or `{"run": program_name}`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlCommand {
    Disconnect,
    Reboot,
    Shutdown,
    Stop,
    Run(String),
}

impl ControlCommand {
    pub fn parse(data: &Value) -> Option<Self> {
        match data {
            Value::String(s) => match s.as_str() {
                "disconnect" => Some(Self::Disconnect),
                "reboot" => Some(Self::Reboot),
                "shutdown" => Some(Self::Shutdown),
                "stop" => Some(Self::Stop),
                _ => None,
            },
            Value::Object(obj) => obj
                .get("run")
                .and_then(Value::as_str)
                .map(|program| Self::Run(program.to_string())),
            _ => None,
        }
    }

    pub fn to_value(&self) -> Value {
        match self {
            Self::Disconnect => json!("disconnect"),
            Self::Reboot => json!("reboot"),
            Self::Shutdown => json!("shutdown"),
            Self::Stop => json!("stop"),
            Self::Run(program) => json!({ "run": program }),
        }
    }
}

/// Builders for `std_stream` payloads.
pub mod std_stream {
    use serde_json::{json, Value};

    /// One output line.
    pub fn line(text: impl Into<String>) -> Value {
        Value::String(text.into())
    }

    /// Final message after the program exits.
    pub fn return_code(code: i32) -> Value {
        json!({ "return_code": code })
    }

    /// A rejected request (e.g. "already running").
    pub fn error(message: impl Into<String>) -> Value {
        json!({ "error": message.into() })
    }
}

// ============================================================================
// hostname / info / whoami
// ============================================================================

/// `{"set": string}` on the `hostname` route.
pub fn parse_hostname_set(data: &Value) -> Option<String> {
    data.as_object()?
        .get("set")?
        .as_str()
        .map(str::to_string)
        .filter(|name| !name.trim().is_empty())
}

/// Reply to `info`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InfoReply {
    pub routes: Vec<String>,
}

/// Reply to `whoami`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WhoAmIReply {
    pub id: PeerId,
    pub user: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_subscribe_request_lenient() {
        let req = SubscribeRequest::parse(&json!({"channel": 2, "name": "bot"})).unwrap();
        assert_eq!(req.channel, Some(Channel::Controller));
        assert_eq!(req.name.as_deref(), Some("bot"));

        let req = SubscribeRequest::parse(&json!({"channel": 9})).unwrap();
        assert_eq!(req.channel, None);
        assert_eq!(req.name, None);

        assert!(SubscribeRequest::parse(&json!("editor")).is_none());
    }

    #[test]
    fn test_peers_request_order_and_filtering() {
        let req = PeersRequest::parse(&json!({
            "channels": [3],
            "subscribe": [1, 2, 2, 7, "x"],
            "unsubscribe": [1]
        }));
        assert_eq!(
            req.ops,
            vec![
                (InterestOp::Subscribe, vec![Channel::Editor, Channel::Controller]),
                (InterestOp::Unsubscribe, vec![Channel::Editor]),
                (InterestOp::Snapshot, vec![Channel::Web]),
            ]
        );
    }

    #[test]
    fn test_peers_request_ignores_non_lists() {
        let req = PeersRequest::parse(&json!({"subscribe": 2}));
        assert!(req.ops.is_empty());
        assert!(PeersRequest::parse(&json!([1, 2])).ops.is_empty());
    }

    #[test]
    fn test_roster_serialization_shape() {
        let mut roster = Roster::new();
        roster.insert(
            PeerId::new("peer-2"),
            RosterEntry {
                name: "bot".to_string(),
                address: "10.0.0.2".to_string(),
                port: 5000,
                channel: Channel::Controller,
            },
        );
        let value = serde_json::to_value(&roster).unwrap();
        assert_eq!(
            value,
            json!({"peer-2": {"name": "bot", "address": "10.0.0.2", "port": 5000, "channel": 2}})
        );
    }

    #[test]
    fn test_sensor_request_validation() {
        let req = SensorRequest::parse(&json!({
            "subscribe": {"analog": [0, 5, 6, "3"], "digital": [9, 10]},
            "unsubscribe": {"analog": [1]}
        }));
        assert_eq!(
            req.changes,
            vec![
                (SubscriptionOp::Subscribe, SensorMode::Analog, 0),
                (SubscriptionOp::Subscribe, SensorMode::Analog, 5),
                (SubscriptionOp::Subscribe, SensorMode::Digital, 9),
                (SubscriptionOp::Unsubscribe, SensorMode::Analog, 1),
            ]
        );
    }

    #[test]
    fn test_sensor_readings_shape() {
        let mut readings = SensorReadings::default();
        readings.insert(SensorMode::Analog, 3, 1200);
        let value = serde_json::to_value(&readings).unwrap();
        assert_eq!(value, json!({"analog": {"3": 1200}, "digital": {}}));
    }

    #[test]
    fn test_control_command_parse() {
        assert_eq!(ControlCommand::parse(&json!("stop")), Some(ControlCommand::Stop));
        assert_eq!(
            ControlCommand::parse(&json!({"run": "drive"})),
            Some(ControlCommand::Run("drive".to_string()))
        );
        assert_eq!(ControlCommand::parse(&json!("explode")), None);
        assert_eq!(ControlCommand::parse(&json!({"run": 3})), None);

        let cmd = ControlCommand::Run("x".to_string());
        assert_eq!(ControlCommand::parse(&cmd.to_value()), Some(cmd));
    }

    #[test]
    fn test_hostname_set() {
        assert_eq!(parse_hostname_set(&json!({"set": "bot-3"})).as_deref(), Some("bot-3"));
        assert_eq!(parse_hostname_set(&json!({"set": "  "})), None);
        assert_eq!(parse_hostname_set(&json!({"get": "x"})), None);
    }

    #[test]
    fn test_std_stream_builders() {
        assert_eq!(std_stream::line("ok"), json!("ok"));
        assert_eq!(std_stream::return_code(0), json!({"return_code": 0}));
    }
}
