//! VM name → zone directory.
//!
//! Lookups are served from memory under a single short-lived lock. Refreshes
//! do all external calls outside the lock and then swap the whole mapping in
//! one step, so a lookup never sees a half-built directory.

pub mod scheduler;
pub mod snapshot;

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::StreamExt;
use serde::Serialize;
use tokio::sync::Notify;
use vmgate_common::{GatewayConfig, VmRecord};

use crate::gcloud::{CloudCli, InstanceListing};
use scheduler::RefresherHandle;
use snapshot::{Snapshot, SnapshotStore};

/// A miss also triggers a refresh once the directory is older than this.
pub const MISS_REFRESH_AGE: Duration = Duration::from_secs(30 * 60);

/// Recorded when the project cannot be determined.
const UNKNOWN_PROJECT: &str = "unknown";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Phase {
    Uninitialized,
    Loading,
    Ready,
    Refreshing,
    Flushed,
    Stopped,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefreshOutcome {
    Applied { vms: usize, zones: usize },
    /// The sweep found nothing; the previous mapping was kept.
    Discarded,
    /// Another refresh was in flight; this request was folded into it.
    AlreadyRunning,
}

/// Snapshot of the directory's health, rendered by the health endpoint.
#[derive(Debug, Clone, Serialize)]
pub struct DirectoryStatus {
    pub phase: Phase,
    pub last_update: Option<DateTime<Utc>>,
    pub age_secs: Option<u64>,
    pub max_age_secs: u64,
    pub stale: bool,
    pub vm_count: usize,
}

#[derive(Debug, Clone)]
pub struct DirectorySettings {
    pub max_age: Duration,
    pub target_regions: Vec<String>,
    pub fallback_zones: Vec<String>,
    pub scan_concurrency: usize,
}

impl DirectorySettings {
    #[must_use]
    pub fn from_config(config: &GatewayConfig) -> Self {
        Self {
            max_age: config.cache_max_age(),
            target_regions: config.target_regions.clone(),
            fallback_zones: config.fallback_zones.clone(),
            scan_concurrency: config.scan_concurrency.max(1),
        }
    }
}

#[derive(Debug, Default)]
struct DirectoryState {
    /// Original-case and lowercased keys both present.
    mapping: BTreeMap<String, String>,
    last_update: Option<DateTime<Utc>>,
}

impl DirectoryState {
    fn age(&self, now: DateTime<Utc>) -> Option<Duration> {
        self.last_update
            .map(|t| (now - t).to_std().unwrap_or_default())
    }
}

#[derive(Debug)]
struct Inner {
    state: DirectoryState,
    phase: Phase,
}

pub struct VmDirectory {
    cli: Arc<dyn CloudCli>,
    store: SnapshotStore,
    settings: DirectorySettings,
    inner: Mutex<Inner>,
    /// Held for the duration of one refresh; `try_lock` coalesces callers.
    refresh_gate: tokio::sync::Mutex<()>,
    wake: Notify,
}

impl std::fmt::Debug for VmDirectory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VmDirectory")
            .field("store", &self.store)
            .field("settings", &self.settings)
            .finish_non_exhaustive()
    }
}

impl VmDirectory {
    #[must_use]
    pub fn new(cli: Arc<dyn CloudCli>, store: SnapshotStore, settings: DirectorySettings) -> Self {
        Self {
            cli,
            store,
            settings,
            inner: Mutex::new(Inner {
                state: DirectoryState::default(),
                phase: Phase::Uninitialized,
            }),
            refresh_gate: tokio::sync::Mutex::new(()),
            wake: Notify::new(),
        }
    }

    #[must_use]
    pub fn from_config(config: &GatewayConfig, cli: Arc<dyn CloudCli>) -> Self {
        Self::new(
            cli,
            SnapshotStore::new(config.snapshot_path.clone()),
            DirectorySettings::from_config(config),
        )
    }

    #[must_use]
    pub fn max_age(&self) -> Duration {
        self.settings.max_age
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn set_phase(&self, phase: Phase) {
        self.lock().phase = phase;
    }

    /// Load a fresh snapshot or, failing that, run a full refresh. The
    /// directory is `Ready` afterwards even if discovery found nothing.
    pub async fn initialize(&self) {
        self.set_phase(Phase::Loading);
        match self.store.load_fresh(self.settings.max_age).await {
            Ok(Some(snap)) => {
                tracing::info!(
                    path = %self.store.path().display(),
                    entries = snap.mapping.len(),
                    timestamp = %snap.timestamp,
                    "loaded directory snapshot"
                );
                let mut inner = self.lock();
                inner.state = DirectoryState {
                    mapping: snap.mapping,
                    last_update: Some(snap.timestamp),
                };
            }
            Ok(None) => {
                tracing::info!("no fresh snapshot; running initial discovery");
                self.refresh().await;
            }
            Err(e) => {
                tracing::warn!(error = %e, "snapshot unreadable; running initial discovery");
                self.refresh().await;
            }
        }
        self.set_phase(Phase::Ready);
    }

    /// Zone of `name`, or `None` when no entry matches.
    ///
    /// Matching is exact, then case-insensitive, then by substring in either
    /// direction. Substring ties go to the shortest key, then the
    /// lexicographically smallest. A stale directory still answers but asks
    /// the background refresher to run.
    pub fn lookup(&self, name: &str) -> Option<String> {
        if name.is_empty() {
            return None;
        }
        let now = Utc::now();
        let (found, age, empty) = {
            let inner = self.lock();
            let state = &inner.state;
            (
                find_zone(&state.mapping, name),
                state.age(now),
                state.mapping.is_empty(),
            )
        };

        let stale = age.is_none_or(|a| a > self.settings.max_age);
        let miss_needs_refresh =
            found.is_none() && (empty || age.is_none_or(|a| a > MISS_REFRESH_AGE));
        if stale || miss_needs_refresh {
            tracing::debug!(vm = name, stale, hit = found.is_some(), "requesting refresh");
            self.request_refresh();
        }
        found
    }

    /// Wake the background refresher. Repeated requests before it runs
    /// collapse into one.
    pub fn request_refresh(&self) {
        self.wake.notify_one();
    }

    pub(crate) async fn refresh_requested(&self) {
        self.wake.notified().await;
    }

    pub(crate) fn age(&self) -> Option<Duration> {
        self.lock().state.age(Utc::now())
    }

    /// Rebuild the directory from a full discovery sweep.
    ///
    /// At most one refresh runs at a time. Zone and instance listing failures
    /// are logged and skipped; they never fail the refresh.
    pub async fn refresh(&self) -> RefreshOutcome {
        let Ok(_gate) = self.refresh_gate.try_lock() else {
            tracing::debug!("refresh already in progress");
            return RefreshOutcome::AlreadyRunning;
        };

        let started = std::time::Instant::now();
        let (records, zones_scanned) = self.sweep().await;
        if records.is_empty() {
            tracing::warn!(
                zones = zones_scanned,
                "discovery found no instances; keeping previous directory"
            );
            return RefreshOutcome::Discarded;
        }

        let snapshot = Snapshot {
            mapping: build_mapping(&records),
            timestamp: Utc::now(),
        };
        {
            let mut inner = self.lock();
            inner.state = DirectoryState {
                mapping: snapshot.mapping.clone(),
                last_update: Some(snapshot.timestamp),
            };
        }
        tracing::info!(
            vms = records.len(),
            zones = zones_scanned,
            elapsed_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX),
            "directory refreshed"
        );

        if let Err(e) = self.store.save(&snapshot).await {
            tracing::warn!(error = %e, "failed to persist directory snapshot");
        }
        RefreshOutcome::Applied {
            vms: records.len(),
            zones: zones_scanned,
        }
    }

    async fn sweep(&self) -> (Vec<VmRecord>, usize) {
        let zones = self.target_zones().await;
        let project = match self.cli.current_project().await {
            Ok(p) => p,
            Err(e) => {
                tracing::warn!(error = %e, "could not determine project");
                UNKNOWN_PROJECT.to_string()
            }
        };

        let listings: Vec<(String, Vec<InstanceListing>)> =
            futures::stream::iter(zones.iter().cloned())
                .map(|zone| {
                    let cli = Arc::clone(&self.cli);
                    async move {
                        let result = cli.list_instances(&zone).await;
                        (zone, result)
                    }
                })
                .buffer_unordered(self.settings.scan_concurrency)
                .filter_map(|(zone, result)| {
                    let kept = match result {
                        Ok(instances) => Some((zone, instances)),
                        Err(e) => {
                            tracing::warn!(zone = %zone, error = %e, "skipping zone");
                            None
                        }
                    };
                    futures::future::ready(kept)
                })
                .collect()
                .await;

        let now = Utc::now();
        let mut by_name: BTreeMap<String, VmRecord> = BTreeMap::new();
        for (zone, instances) in listings {
            for instance in instances {
                let record = VmRecord {
                    name: instance.name,
                    zone: zone.clone(),
                    status: instance.status,
                    project: project.clone(),
                    last_seen: now,
                };
                match by_name.get(&record.name) {
                    Some(existing) if existing.zone <= record.zone => {
                        tracing::warn!(vm = %record.name, kept = %existing.zone, ignored = %record.zone, "VM listed in several zones");
                    }
                    Some(existing) => {
                        tracing::warn!(vm = %record.name, kept = %record.zone, ignored = %existing.zone, "VM listed in several zones");
                        by_name.insert(record.name.clone(), record);
                    }
                    None => {
                        by_name.insert(record.name.clone(), record);
                    }
                }
            }
        }
        (by_name.into_values().collect(), zones.len())
    }

    async fn target_zones(&self) -> Vec<String> {
        match self.cli.list_zones(&self.settings.target_regions).await {
            Ok(zones) if !zones.is_empty() => zones,
            Ok(_) => {
                tracing::warn!("zone listing was empty; using fallback zones");
                self.settings.fallback_zones.clone()
            }
            Err(e) => {
                tracing::warn!(error = %e, "zone listing failed; using fallback zones");
                self.settings.fallback_zones.clone()
            }
        }
    }

    /// Persist the current directory with its original timestamp. An empty
    /// directory is never written.
    pub async fn flush(&self) {
        let snapshot = {
            let inner = self.lock();
            match inner.state.last_update {
                Some(timestamp) if !inner.state.mapping.is_empty() => Some(Snapshot {
                    mapping: inner.state.mapping.clone(),
                    timestamp,
                }),
                _ => None,
            }
        };
        match snapshot {
            Some(snap) => match self.store.save(&snap).await {
                Ok(()) => tracing::info!(entries = snap.mapping.len(), "flushed directory snapshot"),
                Err(e) => tracing::warn!(error = %e, "failed to flush directory snapshot"),
            },
            None => tracing::debug!("directory empty; nothing to flush"),
        }
        self.set_phase(Phase::Flushed);
    }

    /// Stop the background refresher, then flush.
    pub async fn shutdown(&self, refresher: RefresherHandle) {
        refresher.shutdown().await;
        self.flush().await;
        self.set_phase(Phase::Stopped);
    }

    #[must_use]
    pub fn status(&self) -> DirectoryStatus {
        let now = Utc::now();
        // Read before taking `inner`; the two locks are never held together.
        let refreshing = self.refresh_gate.try_lock().is_err();
        let inner = self.lock();
        let age = inner.state.age(now);
        let phase = if inner.phase == Phase::Ready && refreshing {
            Phase::Refreshing
        } else {
            inner.phase
        };
        DirectoryStatus {
            phase,
            last_update: inner.state.last_update,
            age_secs: age.map(|a| a.as_secs()),
            max_age_secs: self.settings.max_age.as_secs(),
            stale: age.is_none_or(|a| a > self.settings.max_age),
            vm_count: inner
                .state
                .mapping
                .keys()
                .map(|k| k.to_lowercase())
                .collect::<BTreeSet<_>>()
                .len(),
        }
    }
}

fn build_mapping(records: &[VmRecord]) -> BTreeMap<String, String> {
    let mut mapping = BTreeMap::new();
    for record in records {
        mapping.insert(record.name.clone(), record.zone.clone());
    }
    // Lowercased keys never shadow a real name that is already lowercase.
    for record in records {
        mapping
            .entry(record.name.to_lowercase())
            .or_insert_with(|| record.zone.clone());
    }
    mapping
}

fn find_zone(mapping: &BTreeMap<String, String>, name: &str) -> Option<String> {
    if let Some(zone) = mapping.get(name) {
        return Some(zone.clone());
    }
    let lower = name.to_lowercase();
    if let Some(zone) = mapping.get(&lower) {
        return Some(zone.clone());
    }
    // Every key has a lowercased twin, so comparing against `lower` is
    // enough for a case-insensitive substring match.
    mapping
        .iter()
        .filter(|(key, _)| key.contains(lower.as_str()) || lower.contains(key.as_str()))
        .min_by(|(a, _), (b, _)| a.len().cmp(&b.len()).then_with(|| a.cmp(b)))
        .map(|(_, zone)| zone.clone())
}
