//! External process execution with deadlines.
//!
//! `TokioCommandRunner` is the production implementation. It reads stdout and
//! stderr concurrently with `wait()` so a chatty child cannot fill a pipe and
//! deadlock, and it kills the child when the deadline passes.

use std::process::{Output, Stdio};
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use futures::future::BoxFuture;
use futures::stream::BoxStream;
use futures::{FutureExt, StreamExt};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, BufReader};
use tokio::time::Instant;

/// How a finished process ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessExit {
    /// `None` when the process was terminated by a signal.
    pub code: Option<i32>,
    pub stderr: String,
}

impl ProcessExit {
    #[must_use]
    pub fn success(&self) -> bool {
        self.code == Some(0)
    }
}

/// A running process whose stdout is consumed line by line.
///
/// Drain `lines` to the end, then await `exit`. Lines arrive in the order the
/// process wrote them.
pub struct StreamingCommand {
    pub lines: BoxStream<'static, String>,
    pub exit: BoxFuture<'static, Result<ProcessExit>>,
}

impl std::fmt::Debug for StreamingCommand {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamingCommand").finish_non_exhaustive()
    }
}

/// Abstracts process execution so the cloud CLI wrapper can be tested
/// without spawning anything.
#[async_trait]
pub trait CommandRunner: Send + Sync {
    /// Run a program to completion and capture its output.
    ///
    /// # Errors
    ///
    /// Returns an error if the process cannot be spawned or exceeds `timeout`.
    /// On timeout the child is killed, not left orphaned.
    async fn run(&self, program: &str, args: &[String], timeout: Duration) -> Result<Output>;

    /// Spawn a program and stream its stdout lines as they are produced.
    ///
    /// # Errors
    ///
    /// Returns an error if the process cannot be spawned.
    fn spawn_streaming(
        &self,
        program: &str,
        args: &[String],
        timeout: Duration,
    ) -> Result<StreamingCommand>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct TokioCommandRunner;

#[async_trait]
impl CommandRunner for TokioCommandRunner {
    async fn run(&self, program: &str, args: &[String], timeout: Duration) -> Result<Output> {
        let mut child = tokio::process::Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .with_context(|| format!("failed to spawn {program}"))?;

        let stdout_handle = child.stdout.take();
        let stderr_handle = child.stderr.take();

        tokio::select! {
            result = async {
                let (status, stdout, stderr) = tokio::join!(
                    child.wait(),
                    read_all(stdout_handle),
                    read_all(stderr_handle),
                );
                Ok(Output {
                    status: status.with_context(|| format!("waiting for {program}"))?,
                    stdout,
                    stderr,
                })
            } => result,
            () = tokio::time::sleep(timeout) => {
                let _ = child.kill().await;
                anyhow::bail!("{program} timed out after {}s", timeout.as_secs())
            }
        }
    }

    fn spawn_streaming(
        &self,
        program: &str,
        args: &[String],
        timeout: Duration,
    ) -> Result<StreamingCommand> {
        let deadline = Instant::now() + timeout;
        let mut child = tokio::process::Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .with_context(|| format!("failed to spawn {program}"))?;

        let stdout = child
            .stdout
            .take()
            .with_context(|| format!("stdout of {program} was not captured"))?;
        let stderr_task = tokio::spawn(read_all(child.stderr.take()));

        let name = program.to_string();
        let lines = async_stream::stream! {
            let mut reader = BufReader::new(stdout).lines();
            loop {
                match tokio::time::timeout_at(deadline, reader.next_line()).await {
                    Ok(Ok(Some(line))) => yield line,
                    Ok(Ok(None)) => break,
                    Ok(Err(e)) => {
                        tracing::warn!(program = %name, error = %e, "stopped reading stdout");
                        break;
                    }
                    Err(_) => break,
                }
            }
        }
        .boxed();

        let program = program.to_string();
        let exit = async move {
            let status = tokio::select! {
                status = child.wait() => status.with_context(|| format!("waiting for {program}"))?,
                () = tokio::time::sleep_until(deadline) => {
                    let _ = child.kill().await;
                    anyhow::bail!("{program} timed out after {}s", timeout.as_secs())
                }
            };
            let stderr = stderr_task.await.unwrap_or_default();
            Ok(ProcessExit {
                code: status.code(),
                stderr: String::from_utf8_lossy(&stderr).into_owned(),
            })
        }
        .boxed();

        Ok(StreamingCommand { lines, exit })
    }
}

async fn read_all<R: AsyncRead + Unpin>(handle: Option<R>) -> Vec<u8> {
    let mut buf = Vec::new();
    if let Some(mut h) = handle {
        let _ = h.read_to_end(&mut buf).await;
    }
    buf
}
