//! Node tree model shared by comparison and persistence.
//!
//! A [`Node`] is rebuilt on every comparison request; only derived hash facts
//! survive across requests (see [`crate::known_hashes`]). Status and action
//! are carried on the wire as small integers.

use std::collections::HashMap;
use std::fmt;

use serde::{Deserialize, Serialize};

/// Node id → node.
pub type NodeMap = HashMap<String, Node>;

/// Comparison outcome for a single node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub enum NodeStatus {
    #[default]
    Equal = 0,
    New = 1,
    Updated = 2,
    Deleted = 3,
    Unknown = 4,
}

impl From<NodeStatus> for u8 {
    fn from(status: NodeStatus) -> u8 {
        status as u8
    }
}

impl TryFrom<u8> for NodeStatus {
    type Error = String;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(NodeStatus::Equal),
            1 => Ok(NodeStatus::New),
            2 => Ok(NodeStatus::Updated),
            3 => Ok(NodeStatus::Deleted),
            4 => Ok(NodeStatus::Unknown),
            other => Err(format!("invalid node status {other}")),
        }
    }
}

impl fmt::Display for NodeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NodeStatus::Equal => write!(f, "Equal"),
            NodeStatus::New => write!(f, "New"),
            NodeStatus::Updated => write!(f, "Updated"),
            NodeStatus::Deleted => write!(f, "Deleted"),
            NodeStatus::Unknown => write!(f, "Unknown"),
        }
    }
}

/// What the caller wants done with a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub enum NodeAction {
    #[default]
    Ignore = 0,
    Copy = 1,
    Update = 2,
    Delete = 3,
}

impl From<NodeAction> for u8 {
    fn from(action: NodeAction) -> u8 {
        action as u8
    }
}

impl TryFrom<u8> for NodeAction {
    type Error = String;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(NodeAction::Ignore),
            1 => Ok(NodeAction::Copy),
            2 => Ok(NodeAction::Update),
            3 => Ok(NodeAction::Delete),
            other => Err(format!("invalid node action {other}")),
        }
    }
}

impl fmt::Display for NodeAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NodeAction::Ignore => write!(f, "Ignore"),
            NodeAction::Copy => write!(f, "Copy"),
            NodeAction::Update => write!(f, "Update"),
            NodeAction::Delete => write!(f, "Delete"),
        }
    }
}

/// File as known to the destination.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct DestinationFile {
    /// Destination file id; 0 when the destination has no file yet.
    pub id: i64,
    pub file_size: i64,
    pub hash: String,
    pub hash_type: String,
    pub storage_identifier: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Attributes {
    pub url: String,
    /// Hash reported by the external source; empty when the file vanished there.
    pub remote_hash: String,
    pub remote_hash_type: String,
    pub remote_file_size: i64,
    pub is_file: bool,
    pub destination_file: DestinationFile,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Node {
    pub id: String,
    pub name: String,
    pub path: String,
    pub status: NodeStatus,
    pub action: NodeAction,
    pub attributes: Attributes,
}

impl Node {
    /// A file node whose name and parent path are derived from a `/`-separated id.
    #[must_use]
    pub fn file(id: impl Into<String>) -> Self {
        let id = id.into();
        let (path, name) = match id.rsplit_once('/') {
            Some((path, name)) => (path.to_string(), name.to_string()),
            None => (String::new(), id.clone()),
        };
        Self {
            id,
            name,
            path,
            attributes: Attributes {
                is_file: true,
                ..Default::default()
            },
            ..Default::default()
        }
    }

    #[must_use]
    pub fn with_remote(mut self, hash: impl Into<String>, hash_type: impl Into<String>) -> Self {
        self.attributes.remote_hash = hash.into();
        self.attributes.remote_hash_type = hash_type.into();
        self
    }

    #[must_use]
    pub fn with_remote_size(mut self, size: i64) -> Self {
        self.attributes.remote_file_size = size;
        self
    }

    #[must_use]
    pub fn with_destination(mut self, hash: impl Into<String>, hash_type: impl Into<String>) -> Self {
        self.attributes.destination_file.hash = hash.into();
        self.attributes.destination_file.hash_type = hash_type.into();
        self
    }

    #[must_use]
    pub fn with_destination_id(mut self, id: i64) -> Self {
        self.attributes.destination_file.id = id;
        self
    }

    #[must_use]
    pub fn with_action(mut self, action: NodeAction) -> Self {
        self.action = action;
        self
    }

    #[inline]
    #[must_use]
    pub fn is_file(&self) -> bool {
        self.attributes.is_file
    }
}
