//! Public types for the sync engine coordinator.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::tree::Node;

/// Overall state of a dataset as reported to pollers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub enum DatasetStatus {
    /// Differences exist and nothing is running
    #[default]
    New = 0,
    /// A write or rehash job is in flight
    Updating = 1,
    /// Destination matches the source
    Finished = 2,
}

impl From<DatasetStatus> for u8 {
    fn from(status: DatasetStatus) -> u8 {
        status as u8
    }
}

impl TryFrom<u8> for DatasetStatus {
    type Error = String;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Self::New),
            1 => Ok(Self::Updating),
            2 => Ok(Self::Finished),
            other => Err(format!("invalid dataset status {other}")),
        }
    }
}

impl fmt::Display for DatasetStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::New => write!(f, "New"),
            Self::Updating => write!(f, "Updating"),
            Self::Finished => write!(f, "Finished"),
        }
    }
}

/// Result of comparing one dataset.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CompareResponse {
    pub id: String,
    pub status: DatasetStatus,
    /// File nodes with their status, sorted by id.
    pub data: Vec<Node>,
    pub url: String,
}

/// A compare result parked for a poller under its correlation key.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CachedResponse {
    pub key: String,
    pub ready: bool,
    #[serde(rename = "res")]
    pub response: CompareResponse,
    #[serde(rename = "err")]
    pub error_message: String,
}

/// Outcome of a compute job, parked under `Job.key`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CachedComputeResponse {
    pub key: String,
    pub ready: bool,
    /// Console output of the script(s)
    #[serde(rename = "res")]
    pub console_out: String,
    /// Generated metadata document (`ddi-cdi` jobs only)
    #[serde(rename = "ddiCdi", skip_serializing_if = "String::is_empty")]
    pub ddi_cdi: String,
    #[serde(rename = "err")]
    pub error_message: String,
}

/// What the worker did with a popped job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobOutcome {
    /// All work done; lock released
    Finished,
    /// Pushed back for another pass; lock kept
    Requeued,
    /// Abandoned after a terminal error or the error cap; lock released
    Failed,
}

impl JobOutcome {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Finished => "finished",
            Self::Requeued => "requeued",
            Self::Failed => "failed",
        }
    }
}

impl fmt::Display for JobOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_is_integer_on_the_wire() {
        let res = CompareResponse {
            id: "doi:1".into(),
            status: DatasetStatus::Updating,
            ..Default::default()
        };
        let json = serde_json::to_value(&res).unwrap();
        assert_eq!(json["status"], 1);
        assert!(serde_json::from_str::<DatasetStatus>("7").is_err());
    }

    #[test]
    fn test_cached_compute_response_shape() {
        let res = CachedComputeResponse {
            key: "k".into(),
            ready: true,
            console_out: "ok".into(),
            ..Default::default()
        };
        let json = serde_json::to_value(&res).unwrap();
        assert_eq!(json["res"], "ok");
        assert!(json.get("ddiCdi").is_none());
    }
}
