//! Typed executor errors.
//!
//! `Display` carries the raw, unredacted detail for server-side logs.
//! [`OperationError::client_message`] is the only text a client ever sees.

use thiserror::Error;
use vmgate_common::{AuditStatus, Operation};

use crate::policy::AllowedVm;
use crate::sanitize::{Sanitized, sanitize};

/// Coarse classification of a failed operation, mapped to response codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    Authorization,
    NotFound,
    Failure,
}

impl ErrorClass {
    #[must_use]
    pub fn http_status(self) -> u16 {
        match self {
            ErrorClass::Authorization => 403,
            ErrorClass::NotFound => 404,
            ErrorClass::Failure => 500,
        }
    }
}

/// The first failing step of an operation.
#[derive(Debug, Clone, Error)]
pub enum OperationError {
    #[error(
        "Operation '{operation}' is not allowed for VM '{vm}'. Only allowed for: {}",
        render_allowed(.allowed)
    )]
    Denied {
        operation: Operation,
        vm: String,
        allowed: Vec<AllowedVm>,
    },

    #[error("VM {vm} not found in any zone. Please specify a zone parameter.")]
    ZoneNotResolved { vm: String },

    #[error("external tool failed for {vm}: {raw}")]
    ExternalTool { vm: String, raw: String },

    #[error("unparseable output for {vm}: {raw}")]
    Parse { vm: String, raw: String },

    #[error("uncaught fault for {vm}: {raw}")]
    Fault { vm: String, raw: String },
}

impl OperationError {
    /// The audit status recorded as this invocation's terminal row.
    #[must_use]
    pub fn audit_status(&self) -> AuditStatus {
        match self {
            OperationError::Denied { .. } => AuditStatus::Denied,
            OperationError::ZoneNotResolved { .. } => AuditStatus::FailedNoZone,
            OperationError::ExternalTool { .. } => AuditStatus::Failed,
            OperationError::Parse { .. } | OperationError::Fault { .. } => AuditStatus::Error,
        }
    }

    #[must_use]
    pub fn class(&self) -> ErrorClass {
        self.client_view().class
    }

    /// Client-safe message. Tool, parse and fault text is always sanitized.
    #[must_use]
    pub fn client_message(&self) -> String {
        self.client_view().message
    }

    fn client_view(&self) -> Sanitized {
        match self {
            OperationError::Denied { .. } => Sanitized {
                message: self.to_string(),
                class: ErrorClass::Authorization,
            },
            OperationError::ZoneNotResolved { .. } => Sanitized {
                message: self.to_string(),
                class: ErrorClass::NotFound,
            },
            OperationError::ExternalTool { vm, raw }
            | OperationError::Parse { vm, raw }
            | OperationError::Fault { vm, raw } => sanitize(raw, vm),
        }
    }
}

fn render_allowed(allowed: &[AllowedVm]) -> String {
    allowed
        .iter()
        .map(|a| {
            if a.alias == a.name {
                a.name.clone()
            } else {
                format!("{} ({})", a.name, a.alias)
            }
        })
        .collect::<Vec<_>>()
        .join(", ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sanitize::{GENERIC_MESSAGE, PERMISSION_MESSAGE};

    #[test]
    fn denial_lists_allow_list_with_aliases() {
        let err = OperationError::Denied {
            operation: Operation::Suspend,
            vm: "otherhost".into(),
            allowed: vec![
                AllowedVm {
                    name: "guedfocnlq03".into(),
                    alias: "nlq.ibi.systems".into(),
                },
                AllowedVm {
                    name: "guedfocwqa82".into(),
                    alias: "guedfocwqa82".into(),
                },
            ],
        };
        assert_eq!(
            err.client_message(),
            "Operation 'suspend' is not allowed for VM 'otherhost'. \
             Only allowed for: guedfocnlq03 (nlq.ibi.systems), guedfocwqa82"
        );
        assert_eq!(err.class(), ErrorClass::Authorization);
        assert_eq!(err.audit_status(), AuditStatus::Denied);
    }

    #[test]
    fn no_zone_is_not_found_class() {
        let err = OperationError::ZoneNotResolved {
            vm: "ghost".into(),
        };
        assert_eq!(
            err.client_message(),
            "VM ghost not found in any zone. Please specify a zone parameter."
        );
        assert_eq!(err.class().http_status(), 404);
        assert_eq!(err.audit_status(), AuditStatus::FailedNoZone);
    }

    #[test]
    fn tool_failure_never_echoes_raw_text() {
        let err = OperationError::ExternalTool {
            vm: "vm1".into(),
            raw: "ERROR: quota exceeded for project secret-project".into(),
        };
        assert_eq!(err.client_message(), GENERIC_MESSAGE);
        assert!(err.to_string().contains("secret-project"));
        assert_eq!(err.audit_status(), AuditStatus::Failed);
        assert_eq!(err.class().http_status(), 500);
    }

    #[test]
    fn tool_failure_can_be_reclassified_as_not_found() {
        let err = OperationError::ExternalTool {
            vm: "vm1".into(),
            raw: "HTTPError 404: instances/vm1 was not found".into(),
        };
        assert_eq!(err.class(), ErrorClass::NotFound);
    }

    #[test]
    fn faults_and_parse_failures_record_error() {
        let fault = OperationError::Fault {
            vm: "vm1".into(),
            raw: "permission denied spawning gcloud".into(),
        };
        assert_eq!(fault.audit_status(), AuditStatus::Error);
        assert_eq!(fault.client_message(), PERMISSION_MESSAGE);
        let parse = OperationError::Parse {
            vm: "vm1".into(),
            raw: String::new(),
        };
        assert_eq!(parse.audit_status(), AuditStatus::Error);
        assert_eq!(parse.client_message(), GENERIC_MESSAGE);
    }
}
