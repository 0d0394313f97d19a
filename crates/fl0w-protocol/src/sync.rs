//! Directory synchronization messages carried on the `sync` route.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Listing entry: modification time and content hash.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ListedFile {
    /// Seconds since epoch, fractional
    pub mtime: f64,
    /// 128-bit digest as lowercase hex
    pub hash: String,
}

/// File transfer entry: base64 content and modification time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileContent {
    pub content: String,
    pub mtime: f64,
}

/// One sync message. Serialized externally tagged, e.g. `{"del": ["a.c"]}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncMessage {
    /// Full listing of the sender's tree
    List(BTreeMap<String, ListedFile>),
    /// Files to write
    Add(BTreeMap<String, FileContent>),
    /// Paths to delete
    Del(Vec<String>),
    /// Paths the sender wants an `add` for
    Req(Vec<String>),
    /// Per-file failures while applying a previous message
    Err(BTreeMap<String, String>),
}

impl SyncMessage {
    /// Parses a payload, returning `None` for anything malformed.
    pub fn parse(data: &Value) -> Option<Self> {
        serde_json::from_value(data.clone()).ok()
    }

    /// Converts to a JSON payload.
    pub fn to_value(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }

    /// Short name used in logs.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::List(_) => "list",
            Self::Add(_) => "add",
            Self::Del(_) => "del",
            Self::Req(_) => "req",
            Self::Err(_) => "err",
        }
    }
}
