//! Cloud CLI abstraction. Test doubles stand in for every `gcloud` command.

use std::process::Output;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use vmgate_common::{GatewayConfig, Operation};

use crate::command_runner::{CommandRunner, StreamingCommand};

/// One row of an instance listing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstanceListing {
    pub name: String,
    pub status: String,
}

/// The operations the gateway needs from the cloud provider's CLI.
///
/// The production implementation shells out to `gcloud`; every argument is
/// passed as its own argv entry, never through a shell.
#[async_trait]
pub trait CloudCli: Send + Sync {
    /// Zones whose names start with one of `regions`.
    ///
    /// # Errors
    ///
    /// Returns an error if the command fails or exits non-zero.
    async fn list_zones(&self, regions: &[String]) -> Result<Vec<String>>;

    /// Instances living in `zone`.
    ///
    /// # Errors
    ///
    /// Returns an error if the command fails or exits non-zero.
    async fn list_instances(&self, zone: &str) -> Result<Vec<InstanceListing>>;

    /// The project the CLI operates on.
    ///
    /// # Errors
    ///
    /// Returns an error if the project cannot be determined.
    async fn current_project(&self) -> Result<String>;

    /// Run the describe command for one instance, returning raw output.
    ///
    /// Stdout is one CSV record: `status,machine type,network address`.
    ///
    /// # Errors
    ///
    /// Returns an error if the command cannot be spawned or times out.
    async fn describe(&self, name: &str, zone: &str) -> Result<Output>;

    /// Spawn a start/stop/suspend/resume command with streamed output.
    ///
    /// # Errors
    ///
    /// Returns an error for `status` or if the command cannot be spawned.
    fn lifecycle(&self, operation: Operation, name: &str, zone: &str)
    -> Result<StreamingCommand>;
}

/// Timeouts applied to the three classes of `gcloud` invocation.
#[derive(Debug, Clone, Copy)]
pub struct CliTimeouts {
    pub discovery: Duration,
    pub describe: Duration,
    pub lifecycle: Duration,
}

/// Production implementation. Shells out to the `gcloud` binary.
pub struct GcloudCli<R> {
    program: String,
    project: Option<String>,
    timeouts: CliTimeouts,
    runner: Arc<R>,
}

impl<R> std::fmt::Debug for GcloudCli<R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GcloudCli")
            .field("program", &self.program)
            .field("project", &self.project)
            .finish_non_exhaustive()
    }
}

impl<R: CommandRunner> GcloudCli<R> {
    #[must_use]
    pub fn new(
        program: impl Into<String>,
        project: Option<String>,
        timeouts: CliTimeouts,
        runner: Arc<R>,
    ) -> Self {
        Self {
            program: program.into(),
            project,
            timeouts,
            runner,
        }
    }

    #[must_use]
    pub fn from_config(config: &GatewayConfig, runner: Arc<R>) -> Self {
        Self::new(
            config.gcloud_bin.clone(),
            config.project.clone(),
            CliTimeouts {
                discovery: config.discovery_timeout(),
                describe: config.describe_timeout(),
                lifecycle: config.lifecycle_timeout(),
            },
            runner,
        )
    }

    fn args(&self, base: &[&str]) -> Vec<String> {
        let mut args: Vec<String> = base.iter().map(|s| (*s).to_string()).collect();
        if let Some(project) = &self.project {
            args.push(format!("--project={project}"));
        }
        args
    }

    async fn run_checked(&self, args: &[String], timeout: Duration) -> Result<String> {
        tracing::debug!(program = %self.program, ?args, "running cloud CLI");
        let output = self.runner.run(&self.program, args, timeout).await?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            anyhow::bail!(
                "{} {} failed: {}",
                self.program,
                args.join(" "),
                stderr.trim()
            );
        }
        String::from_utf8(output.stdout).context("cloud CLI output was not valid UTF-8")
    }
}

#[must_use]
pub fn zone_filter(regions: &[String]) -> Option<String> {
    let prefixes: Vec<&str> = regions
        .iter()
        .map(|r| r.trim())
        .filter(|r| !r.is_empty())
        .collect();
    if prefixes.is_empty() {
        return None;
    }
    Some(format!("--filter=name~'^({})'", prefixes.join("|")))
}

fn non_empty_lines(text: &str) -> impl Iterator<Item = &str> {
    text.lines().map(str::trim).filter(|l| !l.is_empty())
}

#[async_trait]
impl<R: CommandRunner + 'static> CloudCli for GcloudCli<R> {
    async fn list_zones(&self, regions: &[String]) -> Result<Vec<String>> {
        let mut args = self.args(&["compute", "zones", "list", "--format=value(name)"]);
        if let Some(filter) = zone_filter(regions) {
            args.push(filter);
        }
        let stdout = self.run_checked(&args, self.timeouts.discovery).await?;
        Ok(non_empty_lines(&stdout).map(String::from).collect())
    }

    async fn list_instances(&self, zone: &str) -> Result<Vec<InstanceListing>> {
        let zones = format!("--zones={zone}");
        let args = self.args(&[
            "compute",
            "instances",
            "list",
            zones.as_str(),
            "--format=csv[no-heading](name,status)",
        ]);
        let stdout = self.run_checked(&args, self.timeouts.discovery).await?;
        Ok(non_empty_lines(&stdout)
            .map(|line| {
                let (name, status) = line.split_once(',').unwrap_or((line, ""));
                InstanceListing {
                    name: name.trim().to_string(),
                    status: status.trim().to_string(),
                }
            })
            .filter(|i| !i.name.is_empty())
            .collect())
    }

    async fn current_project(&self) -> Result<String> {
        if let Some(project) = &self.project {
            return Ok(project.clone());
        }
        let args: Vec<String> = ["config", "get-value", "project"]
            .iter()
            .map(|s| (*s).to_string())
            .collect();
        let stdout = self.run_checked(&args, self.timeouts.discovery).await?;
        let project = stdout.trim();
        anyhow::ensure!(!project.is_empty(), "no active project configured");
        Ok(project.to_string())
    }

    async fn describe(&self, name: &str, zone: &str) -> Result<Output> {
        let args = self.args(&[
            "compute",
            "instances",
            "describe",
            name,
            "--zone",
            zone,
            "--format=csv[no-heading](status,machineType.basename(),networkInterfaces[0].networkIP)",
        ]);
        self.runner
            .run(&self.program, &args, self.timeouts.describe)
            .await
            .with_context(|| format!("describing {name}"))
    }

    fn lifecycle(
        &self,
        operation: Operation,
        name: &str,
        zone: &str,
    ) -> Result<StreamingCommand> {
        anyhow::ensure!(
            operation.is_mutating(),
            "{operation} is not a lifecycle command"
        );
        let args = self.args(&[
            "compute",
            "instances",
            operation.as_str(),
            name,
            "--zone",
            zone,
        ]);
        tracing::debug!(program = %self.program, ?args, "spawning lifecycle command");
        self.runner
            .spawn_streaming(&self.program, &args, self.timeouts.lifecycle)
    }
}

#[cfg(all(test, unix))]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::os::unix::process::ExitStatusExt;
    use std::process::ExitStatus;
    use std::sync::Mutex;

    use futures::{FutureExt, StreamExt};

    use super::*;
    use crate::command_runner::ProcessExit;

    /// Records every argv and answers with a canned output.
    struct RecordingRunner {
        calls: Mutex<Vec<Vec<String>>>,
        exit_code: i32,
        stdout: &'static str,
        stderr: &'static str,
    }

    impl RecordingRunner {
        fn ok(stdout: &'static str) -> Arc<Self> {
            Arc::new(Self {
                calls: Mutex::new(Vec::new()),
                exit_code: 0,
                stdout,
                stderr: "",
            })
        }

        fn failing(stderr: &'static str) -> Arc<Self> {
            Arc::new(Self {
                calls: Mutex::new(Vec::new()),
                exit_code: 1,
                stdout: "",
                stderr,
            })
        }

        fn calls(&self) -> Vec<Vec<String>> {
            self.calls.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl CommandRunner for RecordingRunner {
        async fn run(&self, program: &str, args: &[String], _: Duration) -> Result<Output> {
            let mut argv = vec![program.to_string()];
            argv.extend_from_slice(args);
            self.calls.lock().unwrap().push(argv);
            Ok(Output {
                status: ExitStatus::from_raw(self.exit_code << 8),
                stdout: self.stdout.as_bytes().to_vec(),
                stderr: self.stderr.as_bytes().to_vec(),
            })
        }

        fn spawn_streaming(
            &self,
            program: &str,
            args: &[String],
            _: Duration,
        ) -> Result<StreamingCommand> {
            let mut argv = vec![program.to_string()];
            argv.extend_from_slice(args);
            self.calls.lock().unwrap().push(argv);
            Ok(StreamingCommand {
                lines: futures::stream::iter(vec!["Stopping...".to_string()]).boxed(),
                exit: async {
                    Ok(ProcessExit {
                        code: Some(0),
                        stderr: String::new(),
                    })
                }
                .boxed(),
            })
        }
    }

    fn timeouts() -> CliTimeouts {
        CliTimeouts {
            discovery: Duration::from_secs(1),
            describe: Duration::from_secs(1),
            lifecycle: Duration::from_secs(1),
        }
    }

    fn cli(runner: Arc<RecordingRunner>, project: Option<&str>) -> GcloudCli<RecordingRunner> {
        GcloudCli::new("gcloud", project.map(String::from), timeouts(), runner)
    }

    #[test]
    fn zone_filter_joins_region_prefixes() {
        let regions = vec!["us-".to_string(), "asia-".to_string()];
        assert_eq!(
            zone_filter(&regions).as_deref(),
            Some("--filter=name~'^(us-|asia-)'")
        );
        assert_eq!(zone_filter(&[]), None);
        assert_eq!(zone_filter(&[" ".to_string()]), None);
    }

    #[tokio::test]
    async fn list_zones_parses_one_zone_per_line() {
        let runner = RecordingRunner::ok("us-east4-a\n\nasia-east1-b\n");
        let zones = cli(runner.clone(), None)
            .list_zones(&["us-".to_string(), "asia-".to_string()])
            .await
            .unwrap();
        assert_eq!(zones, vec!["us-east4-a", "asia-east1-b"]);
        assert_eq!(
            runner.calls()[0],
            vec![
                "gcloud",
                "compute",
                "zones",
                "list",
                "--format=value(name)",
                "--filter=name~'^(us-|asia-)'"
            ]
        );
    }

    #[tokio::test]
    async fn list_instances_parses_csv_rows() {
        let runner = RecordingRunner::ok("guedfocnlq03,RUNNING\nbuildbox,TERMINATED\n");
        let instances = cli(runner.clone(), Some("acme-prod"))
            .list_instances("us-east4-a")
            .await
            .unwrap();
        assert_eq!(
            instances,
            vec![
                InstanceListing {
                    name: "guedfocnlq03".into(),
                    status: "RUNNING".into()
                },
                InstanceListing {
                    name: "buildbox".into(),
                    status: "TERMINATED".into()
                },
            ]
        );
        let argv = &runner.calls()[0];
        assert!(argv.contains(&"--zones=us-east4-a".to_string()));
        assert_eq!(argv.last().unwrap(), "--project=acme-prod");
    }

    #[tokio::test]
    async fn nonzero_exit_becomes_error_with_stderr() {
        let runner = RecordingRunner::failing("ERROR: permission denied");
        let err = cli(runner, None).list_zones(&[]).await.unwrap_err();
        assert!(err.to_string().contains("permission denied"), "{err}");
    }

    #[tokio::test]
    async fn configured_project_skips_discovery() {
        let runner = RecordingRunner::ok("ignored\n");
        let project = cli(runner.clone(), Some("acme-prod"))
            .current_project()
            .await
            .unwrap();
        assert_eq!(project, "acme-prod");
        assert!(runner.calls().is_empty());
    }

    #[tokio::test]
    async fn empty_project_value_is_an_error() {
        let runner = RecordingRunner::ok("\n");
        assert!(cli(runner, None).current_project().await.is_err());
    }

    #[tokio::test]
    async fn describe_returns_raw_output_even_on_failure() {
        let runner = RecordingRunner::failing("HTTPError 404: was not found");
        let out = cli(runner.clone(), None)
            .describe("guedfocnlq03", "us-east4-a")
            .await
            .unwrap();
        assert!(!out.status.success());
        let argv = &runner.calls()[0];
        assert_eq!(&argv[1..6], ["compute", "instances", "describe", "guedfocnlq03", "--zone"]);
    }

    #[tokio::test]
    async fn lifecycle_builds_operation_command() {
        let runner = RecordingRunner::ok("");
        let cmd = cli(runner.clone(), None)
            .lifecycle(Operation::Suspend, "guedfocnlq03", "us-east4-a")
            .unwrap();
        assert!(cmd.exit.now_or_never().is_some());
        assert_eq!(
            runner.calls()[0],
            vec![
                "gcloud",
                "compute",
                "instances",
                "suspend",
                "guedfocnlq03",
                "--zone",
                "us-east4-a"
            ]
        );
    }

    #[test]
    fn lifecycle_rejects_status() {
        let runner = RecordingRunner::ok("");
        assert!(
            cli(runner, None)
                .lifecycle(Operation::Status, "vm", "zone")
                .is_err()
        );
    }
}
