//! Background refresh of the directory, run under a supervisor.
//!
//! The refresh loop waits for whichever comes first: the refresh timer, a
//! refresh request from a lookup, or cancellation. Attempts are separated by
//! [`COOLDOWN`]. A panic inside one attempt is logged and the loop carries on;
//! a panic in the loop itself is caught by [`supervise`], which restarts it
//! with backoff.

use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::VmDirectory;

/// Wait used once the directory is past 75% of its max age.
pub const SHORT_INTERVAL: Duration = Duration::from_secs(60);

/// Minimum gap between two refresh attempts.
pub const COOLDOWN: Duration = Duration::from_secs(30);

/// Time until the next timer-driven refresh.
///
/// A directory that was never filled, or has used up 75% of `max_age`, is
/// retried after [`SHORT_INTERVAL`] instead of waiting out the full period.
#[must_use]
pub fn next_delay(age: Option<Duration>, max_age: Duration) -> Duration {
    match age {
        Some(age) if age.saturating_mul(4) < max_age.saturating_mul(3) => max_age - age,
        _ => SHORT_INTERVAL,
    }
}

/// Backoff between restarts of a failed supervised task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RestartPolicy {
    pub initial: Duration,
    pub max: Duration,
    /// A run lasting at least this long resets the backoff to `initial`.
    pub stable_after: Duration,
}

impl Default for RestartPolicy {
    fn default() -> Self {
        Self {
            initial: Duration::from_secs(60),
            max: Duration::from_secs(600),
            stable_after: Duration::from_secs(600),
        }
    }
}

impl RestartPolicy {
    #[must_use]
    pub fn next(&self, current: Duration) -> Duration {
        current.saturating_mul(2).min(self.max)
    }
}

/// Run `factory()` as a task, restarting it with backoff whenever it panics.
///
/// Returns once the task completes normally or `cancel` fires while waiting
/// to restart.
pub async fn supervise<F, Fut>(
    name: &'static str,
    policy: RestartPolicy,
    cancel: CancellationToken,
    mut factory: F,
) where
    F: FnMut() -> Fut,
    Fut: Future<Output = ()> + Send + 'static,
{
    let mut backoff = policy.initial;
    loop {
        let started = Instant::now();
        info!(task = name, "starting supervised task");
        let err = match tokio::spawn(factory()).await {
            Ok(()) => {
                info!(task = name, "supervised task finished");
                return;
            }
            Err(e) if e.is_cancelled() => return,
            Err(e) => e,
        };

        if started.elapsed() >= policy.stable_after {
            backoff = policy.initial;
        }
        error!(
            task = name,
            error = %err,
            backoff_secs = backoff.as_secs(),
            "supervised task failed; restarting"
        );
        tokio::select! {
            () = cancel.cancelled() => return,
            () = tokio::time::sleep(backoff) => {}
        }
        backoff = policy.next(backoff);
    }
}

/// Owns the background refresher. Dropping it leaves the task running;
/// call [`RefresherHandle::shutdown`] to stop it.
#[derive(Debug)]
pub struct RefresherHandle {
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

impl RefresherHandle {
    /// Signal the refresher to stop and wait for it. An in-flight refresh is
    /// abandoned.
    pub async fn shutdown(self) {
        self.cancel.cancel();
        if let Err(e) = self.task.await {
            warn!(error = %e, "refresher task ended abnormally");
        }
        info!("directory refresher stopped");
    }
}

#[must_use]
pub fn spawn_refresher(directory: Arc<VmDirectory>, policy: RestartPolicy) -> RefresherHandle {
    let cancel = CancellationToken::new();
    let loop_cancel = cancel.clone();
    let task = tokio::spawn(supervise(
        "directory-refresher",
        policy,
        cancel.clone(),
        move || refresh_loop(directory.clone(), loop_cancel.clone()),
    ));
    RefresherHandle { cancel, task }
}

async fn refresh_loop(directory: Arc<VmDirectory>, cancel: CancellationToken) {
    loop {
        let delay = next_delay(directory.age(), directory.max_age());
        debug!(delay_secs = delay.as_secs(), "next directory refresh scheduled");
        tokio::select! {
            () = cancel.cancelled() => return,
            () = tokio::time::sleep(delay) => debug!("refresh timer fired"),
            () = directory.refresh_requested() => debug!("refresh requested by lookup"),
        }

        tokio::select! {
            () = cancel.cancelled() => return,
            result = AssertUnwindSafe(directory.refresh()).catch_unwind() => match result {
                Ok(outcome) => debug!(?outcome, "refresh attempt finished"),
                Err(_) => error!("refresh attempt panicked; keeping previous directory"),
            },
        }

        tokio::select! {
            () = cancel.cancelled() => return,
            () = tokio::time::sleep(COOLDOWN) => {}
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use anyhow::Result;
    use async_trait::async_trait;
    use vmgate_common::Operation;

    use super::super::snapshot::SnapshotStore;
    use super::super::tests::{FakeDiscovery, seed, settings};
    use super::*;
    use crate::command_runner::StreamingCommand;
    use crate::gcloud::{CloudCli, InstanceListing};

    const HOUR: Duration = Duration::from_secs(3600);

    /// Zone listing panics on the first call; every call time is recorded.
    #[derive(Default)]
    struct FlakyZones {
        calls: Mutex<Vec<Instant>>,
    }

    impl FlakyZones {
        fn calls(&self) -> Vec<Instant> {
            self.calls.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl CloudCli for FlakyZones {
        async fn list_zones(&self, _: &[String]) -> Result<Vec<String>> {
            let n = {
                let mut calls = self.calls.lock().unwrap();
                calls.push(Instant::now());
                calls.len()
            };
            assert!(n > 1, "zone listing blew up");
            Ok(vec!["us-east1-b".into()])
        }

        async fn list_instances(&self, _: &str) -> Result<Vec<InstanceListing>> {
            Ok(vec![InstanceListing {
                name: "vm1".into(),
                status: "RUNNING".into(),
            }])
        }

        async fn current_project(&self) -> Result<String> {
            Ok("acme-prod".into())
        }

        async fn describe(&self, _: &str, _: &str) -> Result<std::process::Output> {
            anyhow::bail!("describe not expected")
        }

        fn lifecycle(&self, _: Operation, _: &str, _: &str) -> Result<StreamingCommand> {
            anyhow::bail!("lifecycle not expected")
        }
    }

    #[test]
    fn fresh_directory_waits_out_remaining_age() {
        assert_eq!(
            next_delay(Some(Duration::from_secs(600)), HOUR),
            Duration::from_secs(3000)
        );
        assert_eq!(next_delay(Some(Duration::ZERO), HOUR), HOUR);
    }

    #[test]
    fn past_three_quarters_uses_short_interval() {
        assert_eq!(next_delay(Some(Duration::from_secs(2700)), HOUR), SHORT_INTERVAL);
        assert_eq!(next_delay(Some(Duration::from_secs(9000)), HOUR), SHORT_INTERVAL);
        assert_eq!(next_delay(None, HOUR), SHORT_INTERVAL);
    }

    #[test]
    fn backoff_doubles_up_to_cap() {
        let policy = RestartPolicy::default();
        let mut backoff = policy.initial;
        let mut seen = Vec::new();
        for _ in 0..5 {
            seen.push(backoff.as_secs());
            backoff = policy.next(backoff);
        }
        assert_eq!(seen, vec![60, 120, 240, 480, 600]);
    }

    #[tokio::test(start_paused = true)]
    async fn supervisor_restarts_panicking_task_with_backoff() {
        let attempts = Arc::new(AtomicUsize::new(0));
        let counter = attempts.clone();
        let start = Instant::now();
        let policy = RestartPolicy {
            initial: Duration::from_secs(1),
            max: Duration::from_secs(4),
            stable_after: Duration::from_secs(100),
        };
        supervise("test", policy, CancellationToken::new(), move || {
            let n = counter.fetch_add(1, Ordering::SeqCst);
            async move {
                assert!(n >= 3, "attempt {n} fails");
            }
        })
        .await;
        assert_eq!(attempts.load(Ordering::SeqCst), 4);
        // 1s + 2s + 4s of backoff.
        assert!(start.elapsed() >= Duration::from_secs(7));
    }

    #[tokio::test(start_paused = true)]
    async fn supervisor_stops_when_cancelled_during_backoff() {
        let attempts = Arc::new(AtomicUsize::new(0));
        let counter = attempts.clone();
        let cancel = CancellationToken::new();
        cancel.cancel();
        supervise("test", RestartPolicy::default(), cancel, move || {
            let n = counter.fetch_add(1, Ordering::SeqCst);
            async move {
                assert!(n > 100, "attempt {n} fails");
            }
        })
        .await;
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn lookup_request_wakes_refresher() {
        let tmp = tempfile::tempdir().unwrap();
        let cli = Arc::new(FakeDiscovery::with(&[("vm1", "us-east1-b")]));
        let dir = Arc::new(VmDirectory::new(
            cli.clone(),
            SnapshotStore::new(tmp.path().join("vm_cache.json")),
            settings(),
        ));
        seed(&dir, &[("vm1", "us-east1-b")], chrono::Duration::minutes(1));
        let handle = spawn_refresher(dir.clone(), RestartPolicy::default());

        dir.request_refresh();
        for _ in 0..50 {
            if cli.zone_calls.load(Ordering::SeqCst) > 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(cli.zone_calls.load(Ordering::SeqCst), 1);
        handle.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn timer_refreshes_before_max_age() {
        let tmp = tempfile::tempdir().unwrap();
        let cli = Arc::new(FakeDiscovery::with(&[("vm1", "us-east1-b")]));
        let dir = Arc::new(VmDirectory::new(
            cli.clone(),
            SnapshotStore::new(tmp.path().join("vm_cache.json")),
            settings(),
        ));
        seed(&dir, &[("vm1", "us-east1-b")], chrono::Duration::minutes(1));
        let handle = spawn_refresher(dir.clone(), RestartPolicy::default());

        tokio::time::sleep(Duration::from_secs(30 * 60)).await;
        assert_eq!(cli.zone_calls.load(Ordering::SeqCst), 0);
        tokio::time::sleep(HOUR).await;
        assert!(cli.zone_calls.load(Ordering::SeqCst) >= 1);
        handle.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn panicking_attempt_is_survived_and_retried_after_cooldown() {
        let tmp = tempfile::tempdir().unwrap();
        let cli = Arc::new(FlakyZones::default());
        let dir = Arc::new(VmDirectory::new(
            cli.clone(),
            SnapshotStore::new(tmp.path().join("vm_cache.json")),
            settings(),
        ));
        seed(&dir, &[("vm1", "us-east1-b")], chrono::Duration::minutes(1));
        // A supervisor restart would wait an hour, so a quick second attempt
        // proves the loop itself kept running.
        let policy = RestartPolicy {
            initial: HOUR,
            max: HOUR,
            stable_after: HOUR,
        };
        let handle = spawn_refresher(dir.clone(), policy);

        dir.request_refresh();
        for _ in 0..100 {
            if !cli.calls().is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(cli.calls().len(), 1);
        // Asked again right away; the cooldown still applies.
        dir.request_refresh();

        for _ in 0..100 {
            if cli.calls().len() >= 2 {
                break;
            }
            tokio::time::sleep(Duration::from_secs(1)).await;
        }
        let calls = cli.calls();
        assert_eq!(calls.len(), 2);
        let gap = calls[1] - calls[0];
        assert!(gap >= COOLDOWN, "second attempt after {gap:?}");
        assert!(gap < COOLDOWN + Duration::from_secs(5), "second attempt after {gap:?}");
        assert_eq!(dir.lookup("vm1").as_deref(), Some("us-east1-b"));
        handle.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_is_prompt_while_idle() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = Arc::new(VmDirectory::new(
            Arc::new(FakeDiscovery::default()),
            SnapshotStore::new(tmp.path().join("vm_cache.json")),
            settings(),
        ));
        seed(&dir, &[("vm1", "z1")], chrono::Duration::minutes(1));
        let handle = spawn_refresher(dir, RestartPolicy::default());
        tokio::task::yield_now().await;
        let start = Instant::now();
        handle.shutdown().await;
        assert!(start.elapsed() < Duration::from_secs(1));
    }
}
