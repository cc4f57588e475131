use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Lifecycle operation a client may request on a VM.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "lowercase")]
pub enum Operation {
    Status,
    Start,
    Stop,
    Suspend,
    Resume,
}

impl Operation {
    /// Every supported operation, in the order they are documented.
    pub const ALL: [Operation; 5] = [
        Operation::Status,
        Operation::Start,
        Operation::Stop,
        Operation::Suspend,
        Operation::Resume,
    ];

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Operation::Status => "status",
            Operation::Start => "start",
            Operation::Stop => "stop",
            Operation::Suspend => "suspend",
            Operation::Resume => "resume",
        }
    }

    /// Past-tense verb used in human-readable success messages.
    #[must_use]
    pub fn past_tense(self) -> &'static str {
        match self {
            Operation::Status => "checked",
            Operation::Start => "started",
            Operation::Stop => "stopped",
            Operation::Suspend => "suspended",
            Operation::Resume => "resumed",
        }
    }

    /// True for operations that change the VM's power state.
    #[must_use]
    pub fn is_mutating(self) -> bool {
        !matches!(self, Operation::Status)
    }

    /// Comma-separated list of valid operation names, for error messages.
    #[must_use]
    pub fn valid_names() -> String {
        Self::ALL
            .iter()
            .map(|op| op.as_str())
            .collect::<Vec<_>>()
            .join(", ")
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Returned when an operation name is not one of [`Operation::ALL`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("Invalid operation: {0}. Valid operations are: {valid}", valid = Operation::valid_names())]
pub struct UnknownOperation(pub String);

impl FromStr for Operation {
    type Err = UnknownOperation;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|op| op.as_str() == s)
            .ok_or_else(|| UnknownOperation(s.to_string()))
    }
}

/// Status column of an audit row.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum AuditStatus {
    #[serde(rename = "started")]
    Started,
    #[serde(rename = "denied")]
    Denied,
    #[serde(rename = "failed-no-zone")]
    FailedNoZone,
    #[serde(rename = "completed")]
    Completed,
    #[serde(rename = "failed")]
    Failed,
    #[serde(rename = "error")]
    Error,
}

impl AuditStatus {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            AuditStatus::Started => "started",
            AuditStatus::Denied => "denied",
            AuditStatus::FailedNoZone => "failed-no-zone",
            AuditStatus::Completed => "completed",
            AuditStatus::Failed => "failed",
            AuditStatus::Error => "error",
        }
    }

    /// Every status except `Started` ends an invocation.
    #[must_use]
    pub fn is_terminal(self) -> bool {
        !matches!(self, AuditStatus::Started)
    }
}

impl fmt::Display for AuditStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One lifecycle transition of one operation invocation.
///
/// Rows are append-only: a record is never edited after being written.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct OperationRecord {
    pub timestamp: DateTime<Utc>,
    /// Canonical VM name.
    pub vm_name: String,
    pub operation: Operation,
    pub client_ip: String,
    pub zone: Option<String>,
    pub status: AuditStatus,
    /// Display alias shown to humans; `None` when it equals `vm_name`.
    pub vanity_name: Option<String>,
}

/// Kind of a progress event delivered to a streaming subscriber.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum EventKind {
    Info,
    Progress,
    Status,
    Success,
    Error,
    Denied,
}

impl EventKind {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            EventKind::Info => "info",
            EventKind::Progress => "progress",
            EventKind::Status => "status",
            EventKind::Success => "success",
            EventKind::Error => "error",
            EventKind::Denied => "denied",
        }
    }

    /// Terminal kinds end a stream; exactly one is delivered per operation.
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, EventKind::Success | EventKind::Error | EventKind::Denied)
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Event {
    pub kind: EventKind,
    pub payload: String,
    pub timestamp: DateTime<Utc>,
}

impl Event {
    #[must_use]
    pub fn new(kind: EventKind, payload: impl Into<String>) -> Self {
        Self {
            kind,
            payload: payload.into(),
            timestamp: Utc::now(),
        }
    }
}

/// A VM instance as seen by one directory refresh sweep.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct VmRecord {
    pub name: String,
    pub zone: String,
    pub status: String,
    pub project: String,
    pub last_seen: DateTime<Utc>,
}
