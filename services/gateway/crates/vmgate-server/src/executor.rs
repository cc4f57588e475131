//! Drives one lifecycle operation on one VM to exactly one terminal outcome.
//!
//! Both delivery modes share [`OperationExecutor::run`]: the steps return
//! `Result<Completion, OperationError>`, and the driver turns the first failure
//! (or a panic) into the single terminal event and the single terminal audit
//! row.

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use chrono::Utc;
use futures::{FutureExt, StreamExt};
use serde::Serialize;
use tracing::{debug, error, info, warn};
use vmgate_common::{AuditStatus, EventKind, Operation, OperationRecord};

use crate::audit::AuditSink;
use crate::command_runner::StreamingCommand;
use crate::directory::VmDirectory;
use crate::error::OperationError;
use crate::gcloud::CloudCli;
use crate::names::NameResolver;
use crate::policy::AuthorizationPolicy;
use crate::progress::{EventSink, ProgressStream};

/// Field value used when describe output leaves a column out.
pub const UNKNOWN: &str = "unknown";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OperationRequest {
    /// Raw identifier as sent by the client.
    pub vm: String,
    pub operation: Operation,
    pub zone: Option<String>,
    pub client: String,
}

/// Structured result of a `status` operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct VmStatus {
    pub name: String,
    /// `None` when the alias equals the name.
    pub vanity_name: Option<String>,
    pub status: String,
    pub machine_type: String,
    pub ip_address: String,
    pub zone: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Completion {
    Status(VmStatus),
    Lifecycle {
        operation: Operation,
        vm: String,
        alias: String,
    },
}

impl Completion {
    /// Message carried by the terminal `success` event.
    #[must_use]
    pub fn summary(&self) -> String {
        match self {
            Completion::Status(s) => format!(
                "VM {} is {} ({}, IP: {})",
                s.name, s.status, s.machine_type, s.ip_address
            ),
            Completion::Lifecycle {
                operation,
                vm,
                alias,
            } => format!("Successfully completed {operation} operation on VM {vm} ({alias})"),
        }
    }

    /// Shorter past-tense message used by single-response mode.
    #[must_use]
    pub fn message(&self) -> String {
        match self {
            Completion::Status(_) => self.summary(),
            Completion::Lifecycle {
                operation,
                vm,
                alias,
            } => format!("VM {vm} ({alias}) {} successfully.", operation.past_tense()),
        }
    }
}

/// Terminal result of one invocation.
#[derive(Debug, Clone)]
pub struct Outcome {
    pub canonical: String,
    pub display_alias: String,
    pub result: Result<Completion, OperationError>,
}

/// Canonical identity of one invocation, fixed before any step runs.
struct Invocation<'a> {
    request: &'a OperationRequest,
    canonical: String,
    alias: String,
}

impl Invocation<'_> {
    fn vanity(&self) -> Option<String> {
        (self.alias != self.canonical).then(|| self.alias.clone())
    }
}

pub struct OperationExecutor {
    names: NameResolver,
    policy: AuthorizationPolicy,
    directory: Arc<VmDirectory>,
    cli: Arc<dyn CloudCli>,
    audit: Arc<dyn AuditSink>,
}

impl std::fmt::Debug for OperationExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OperationExecutor")
            .field("names", &self.names)
            .field("policy", &self.policy)
            .finish_non_exhaustive()
    }
}

impl OperationExecutor {
    #[must_use]
    pub fn new(
        names: NameResolver,
        policy: AuthorizationPolicy,
        directory: Arc<VmDirectory>,
        cli: Arc<dyn CloudCli>,
        audit: Arc<dyn AuditSink>,
    ) -> Self {
        Self {
            names,
            policy,
            directory,
            cli,
            audit,
        }
    }

    #[must_use]
    pub fn names(&self) -> &NameResolver {
        &self.names
    }

    #[must_use]
    pub fn policy(&self) -> &AuthorizationPolicy {
        &self.policy
    }

    /// Single-response mode: run to completion and return the outcome.
    ///
    /// The run lives on its own task, so dropping the returned future (a
    /// client hanging up) neither kills the external command nor loses the
    /// terminal audit row.
    pub async fn execute(self: &Arc<Self>, request: OperationRequest) -> Outcome {
        let raw = request.vm.clone();
        let executor = Arc::clone(self);
        let task = tokio::spawn(async move { executor.run(&request, EventSink::discard()).await });
        match task.await {
            Ok(outcome) => outcome,
            Err(e) => {
                let canonical = self.names.canonicalize(raw.trim());
                error!(vm = %canonical, error = %e, "operation task ended abnormally");
                Outcome {
                    display_alias: self.names.display_alias(&canonical),
                    result: Err(OperationError::Fault {
                        vm: canonical.clone(),
                        raw: e.to_string(),
                    }),
                    canonical,
                }
            }
        }
    }

    /// Streaming mode: run on a detached task and return the event stream.
    ///
    /// The operation runs to completion even if the subscriber goes away,
    /// so its terminal audit row is always written.
    #[must_use]
    pub fn stream(self: &Arc<Self>, request: OperationRequest) -> ProgressStream {
        let (sink, stream) = EventSink::channel();
        let executor = Arc::clone(self);
        tokio::spawn(async move {
            executor.run(&request, sink).await;
        });
        stream
    }

    async fn run(&self, request: &OperationRequest, sink: EventSink) -> Outcome {
        let canonical = self.names.canonicalize(request.vm.trim());
        let alias = self.names.display_alias(&canonical);
        let inv = Invocation {
            request,
            canonical,
            alias,
        };
        info!(
            vm = %inv.canonical,
            raw = %request.vm,
            operation = %request.operation,
            client = %request.client,
            "operation requested"
        );

        let mut zone = None;
        let result = AssertUnwindSafe(self.steps(&inv, &mut zone, &sink))
            .catch_unwind()
            .await
            .unwrap_or_else(|panic| {
                Err(OperationError::Fault {
                    vm: inv.canonical.clone(),
                    raw: panic_message(panic.as_ref()),
                })
            });

        let status = match &result {
            Ok(completion) => {
                info!(vm = %inv.canonical, operation = %request.operation, "operation completed");
                sink.finish(EventKind::Success, completion.summary());
                AuditStatus::Completed
            }
            Err(err) => {
                match err {
                    OperationError::Denied { .. } | OperationError::ZoneNotResolved { .. } => {
                        warn!(vm = %inv.canonical, operation = %request.operation, client = %request.client, "{err}");
                    }
                    _ => error!(vm = %inv.canonical, operation = %request.operation, "{err}"),
                }
                let kind = if matches!(err, OperationError::Denied { .. }) {
                    EventKind::Denied
                } else {
                    EventKind::Error
                };
                sink.finish(kind, err.client_message());
                err.audit_status()
            }
        };
        self.record(&inv, zone.as_deref(), status).await;

        Outcome {
            canonical: inv.canonical,
            display_alias: inv.alias,
            result,
        }
    }

    async fn steps(
        &self,
        inv: &Invocation<'_>,
        zone_out: &mut Option<String>,
        sink: &EventSink,
    ) -> Result<Completion, OperationError> {
        let operation = inv.request.operation;
        self.authorize(inv)?;
        let zone = self.resolve_zone(inv)?;
        *zone_out = Some(zone.clone());

        self.record(inv, Some(zone.as_str()), AuditStatus::Started).await;

        if operation.is_mutating() {
            self.lifecycle(inv, &zone, sink).await
        } else {
            self.describe(inv, &zone, sink).await
        }
    }

    fn authorize(&self, inv: &Invocation<'_>) -> Result<(), OperationError> {
        let operation = inv.request.operation;
        if self.policy.is_allowed(&inv.canonical, operation) {
            return Ok(());
        }
        Err(OperationError::Denied {
            operation,
            vm: inv.canonical.clone(),
            allowed: self.policy.allowed_with_aliases(&self.names),
        })
    }

    fn resolve_zone(&self, inv: &Invocation<'_>) -> Result<String, OperationError> {
        let supplied = inv
            .request
            .zone
            .as_deref()
            .map(str::trim)
            .filter(|z| !z.is_empty());
        if let Some(zone) = supplied {
            return Ok(zone.to_string());
        }
        let zone = self
            .directory
            .lookup(&inv.canonical)
            .ok_or_else(|| OperationError::ZoneNotResolved {
                vm: inv.canonical.clone(),
            })?;
        debug!(vm = %inv.canonical, zone = %zone, "zone resolved from directory");
        Ok(zone)
    }

    async fn describe(
        &self,
        inv: &Invocation<'_>,
        zone: &str,
        sink: &EventSink,
    ) -> Result<Completion, OperationError> {
        sink.emit(
            EventKind::Info,
            format!("Checking status of VM {} in zone {zone}", inv.canonical),
        );
        let output = self
            .cli
            .describe(&inv.canonical, zone)
            .await
            .map_err(|e| fault(inv, &e))?;
        if !output.status.success() {
            return Err(OperationError::ExternalTool {
                vm: inv.canonical.clone(),
                raw: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        let (status, machine_type, ip_address) =
            parse_describe(&stdout).ok_or_else(|| OperationError::Parse {
                vm: inv.canonical.clone(),
                raw: stdout.trim().to_string(),
            })?;
        let vm_status = VmStatus {
            name: inv.canonical.clone(),
            vanity_name: inv.vanity(),
            status,
            machine_type,
            ip_address,
            zone: zone.to_string(),
        };
        let payload = serde_json::to_string(&vm_status).map_err(|e| OperationError::Fault {
            vm: inv.canonical.clone(),
            raw: e.to_string(),
        })?;
        sink.emit(EventKind::Status, payload);
        Ok(Completion::Status(vm_status))
    }

    async fn lifecycle(
        &self,
        inv: &Invocation<'_>,
        zone: &str,
        sink: &EventSink,
    ) -> Result<Completion, OperationError> {
        let operation = inv.request.operation;
        sink.emit(
            EventKind::Info,
            format!("Executing {operation} on VM {} in zone {zone}", inv.canonical),
        );
        let StreamingCommand { mut lines, exit } = self
            .cli
            .lifecycle(operation, &inv.canonical, zone)
            .map_err(|e| fault(inv, &e))?;

        // Always drained, even with no subscriber, so the child never blocks
        // on a full pipe.
        let mut detached = false;
        while let Some(line) = lines.next().await {
            let line = line.trim_end();
            if line.is_empty() {
                continue;
            }
            debug!(vm = %inv.canonical, line, "tool output");
            if !detached && sink.is_closed() {
                detached = true;
                info!(vm = %inv.canonical, %operation, "subscriber disconnected; command keeps running");
            }
            sink.emit(EventKind::Progress, line);
        }

        let exit = exit.await.map_err(|e| fault(inv, &e))?;
        if !exit.success() {
            let raw = match (exit.stderr.trim(), exit.code) {
                ("", Some(code)) => format!("exited with code {code}"),
                ("", None) => "terminated by signal".to_string(),
                (stderr, _) => stderr.to_string(),
            };
            return Err(OperationError::ExternalTool {
                vm: inv.canonical.clone(),
                raw,
            });
        }
        Ok(Completion::Lifecycle {
            operation,
            vm: inv.canonical.clone(),
            alias: inv.alias.clone(),
        })
    }

    async fn record(&self, inv: &Invocation<'_>, zone: Option<&str>, status: AuditStatus) {
        let record = OperationRecord {
            timestamp: Utc::now(),
            vm_name: inv.canonical.clone(),
            operation: inv.request.operation,
            client_ip: inv.request.client.clone(),
            zone: zone.map(String::from),
            status,
            vanity_name: inv.vanity(),
        };
        if let Err(e) = self.audit.append(&record).await {
            warn!(vm = %inv.canonical, status = %status, error = %e, "failed to write audit row");
        }
    }
}

fn fault(inv: &Invocation<'_>, err: &anyhow::Error) -> OperationError {
    OperationError::Fault {
        vm: inv.canonical.clone(),
        raw: format!("{err:#}"),
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "panic with non-string payload".to_string()
    }
}

/// Parse the first describe record into `(status, machine type, address)`.
///
/// Missing trailing columns become [`UNKNOWN`]; a record without a status is
/// unusable.
#[must_use]
pub fn parse_describe(stdout: &str) -> Option<(String, String, String)> {
    let line = stdout.lines().map(str::trim).find(|l| !l.is_empty())?;
    let mut fields = line.split(',').map(str::trim);
    let status = fields.next().filter(|f| !f.is_empty())?.to_string();
    let mut next = || {
        fields
            .next()
            .filter(|f| !f.is_empty())
            .unwrap_or(UNKNOWN)
            .to_string()
    };
    let machine_type = next();
    let ip_address = next();
    Some((status, machine_type, ip_address))
}
