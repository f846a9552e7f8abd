//! Berth core types shared by the mirror, the change streams and the scheduler.

#![forbid(unsafe_code)]

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::Value;

pub mod doc;
mod ranking;

pub use ranking::{Ranking, Rankings};

/// Cluster resource types mirrored by the scheduler.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "lowercase")]
pub enum ResourceKind {
    Pods,
    Nodes,
    Services,
    ReplicationControllers,
}

impl ResourceKind {
    /// Root documents created in the mirror before any event is processed.
    pub const ALL: [ResourceKind; 4] = [
        ResourceKind::Pods,
        ResourceKind::Nodes,
        ResourceKind::ReplicationControllers,
        ResourceKind::Services,
    ];

    /// Plural resource name; doubles as the mirror root key.
    pub fn as_str(&self) -> &'static str {
        match self {
            ResourceKind::Pods => "pods",
            ResourceKind::Nodes => "nodes",
            ResourceKind::Services => "services",
            ResourceKind::ReplicationControllers => "replicationcontrollers",
        }
    }
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { f.write_str(self.as_str()) }
}

impl FromStr for ResourceKind {
    type Err = UnknownResource;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pods" => Ok(ResourceKind::Pods),
            "nodes" => Ok(ResourceKind::Nodes),
            "services" => Ok(ResourceKind::Services),
            "replicationcontrollers" => Ok(ResourceKind::ReplicationControllers),
            other => Err(UnknownResource(other.to_string())),
        }
    }
}

#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
#[error("unknown resource type: {0}")]
pub struct UnknownResource(pub String);

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum EventKind {
    Added,
    Modified,
    Deleted,
}

/// One item produced by a change stream.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum ChangeEvent {
    /// Full current set of a resource type, sent when a stream (re)starts.
    Resync(Vec<Value>),
    Incremental { kind: EventKind, doc: Value },
    /// The stream reported an error; it keeps running.
    Fault(String),
}

impl ChangeEvent {
    pub fn added(doc: Value) -> Self { ChangeEvent::Incremental { kind: EventKind::Added, doc } }
    pub fn modified(doc: Value) -> Self { ChangeEvent::Incremental { kind: EventKind::Modified, doc } }
    pub fn deleted(doc: Value) -> Self { ChangeEvent::Incremental { kind: EventKind::Deleted, doc } }

    /// Short label for logs.
    pub fn payload_type(&self) -> &'static str {
        match self {
            ChangeEvent::Resync(_) => "resync",
            ChangeEvent::Incremental { kind: EventKind::Added, .. } => "added",
            ChangeEvent::Incremental { kind: EventKind::Modified, .. } => "modified",
            ChangeEvent::Incremental { kind: EventKind::Deleted, .. } => "deleted",
            ChangeEvent::Fault(_) => "fault",
        }
    }
}

/// A document is missing one of its identity fields.
#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum ObjectError {
    #[error("malformed object: missing {field}: {doc}")]
    Malformed { field: &'static str, doc: String },
}

impl ObjectError {
    pub fn missing(field: &'static str, doc: &Value) -> Self {
        let mut rendered = doc.to_string();
        if rendered.len() > 256 {
            let mut cut = 256;
            while !rendered.is_char_boundary(cut) {
                cut -= 1;
            }
            rendered.truncate(cut);
            rendered.push_str("...");
        }
        ObjectError::Malformed { field, doc: rendered }
    }
}

pub mod prelude {
    pub use super::{doc, ChangeEvent, EventKind, ObjectError, Ranking, Rankings, ResourceKind};
}
