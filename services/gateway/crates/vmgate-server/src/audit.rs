//! Append-only audit trail of operation lifecycle transitions.
//!
//! One CSV file per calendar month (UTC):
//! `<audit_dir>/<YYYY>/operations_<YYYY>_<MM>.csv`.

use std::fs::OpenOptions;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Datelike, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use vmgate_common::OperationRecord;

/// Written for a row with no resolved zone.
pub const UNKNOWN_ZONE: &str = "unknown";

/// One audit row as stored on disk.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditEntry {
    pub timestamp: String,
    pub vm_name: String,
    pub operation: String,
    pub client_ip: String,
    pub zone: String,
    pub status: String,
    pub vanity_name: String,
}

impl From<&OperationRecord> for AuditEntry {
    fn from(r: &OperationRecord) -> Self {
        Self {
            timestamp: r.timestamp.to_rfc3339_opts(SecondsFormat::Secs, true),
            vm_name: r.vm_name.clone(),
            operation: r.operation.to_string(),
            client_ip: r.client_ip.clone(),
            zone: r.zone.clone().unwrap_or_else(|| UNKNOWN_ZONE.to_string()),
            status: r.status.to_string(),
            vanity_name: r.vanity_name.clone().unwrap_or_else(|| r.vm_name.clone()),
        }
    }
}

#[async_trait]
pub trait AuditSink: Send + Sync {
    /// Append one row. Rows already written are never touched.
    ///
    /// # Errors
    ///
    /// Returns an error if the row could not be persisted.
    async fn append(&self, record: &OperationRecord) -> Result<()>;

    /// Up to `limit` rows from the newest period, newest first.
    ///
    /// # Errors
    ///
    /// Returns an error if the audit files cannot be read.
    async fn recent(&self, limit: usize) -> Result<Vec<AuditEntry>>;
}

/// Monthly CSV files under a base directory.
#[derive(Debug)]
pub struct CsvAuditLog {
    base: PathBuf,
    /// Serializes appends so concurrent rows never interleave.
    write_lock: tokio::sync::Mutex<()>,
}

impl CsvAuditLog {
    #[must_use]
    pub fn new(base: impl Into<PathBuf>) -> Self {
        Self {
            base: base.into(),
            write_lock: tokio::sync::Mutex::new(()),
        }
    }

    #[must_use]
    pub fn path_for(&self, at: DateTime<Utc>) -> PathBuf {
        let year = at.year();
        self.base
            .join(year.to_string())
            .join(format!("operations_{year}_{:02}.csv", at.month()))
    }
}

#[async_trait]
impl AuditSink for CsvAuditLog {
    async fn append(&self, record: &OperationRecord) -> Result<()> {
        let path = self.path_for(record.timestamp);
        let entry = AuditEntry::from(record);
        let _guard = self.write_lock.lock().await;
        tokio::task::spawn_blocking(move || append_sync(&path, &entry))
            .await
            .context("audit append task panicked")?
    }

    async fn recent(&self, limit: usize) -> Result<Vec<AuditEntry>> {
        let base = self.base.clone();
        tokio::task::spawn_blocking(move || recent_sync(&base, limit))
            .await
            .context("audit read task panicked")?
    }
}

fn append_sync(path: &Path, entry: &AuditEntry) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("creating audit directory {}", parent.display()))?;
    }
    let file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .with_context(|| format!("opening audit file {}", path.display()))?;
    let is_new = file.metadata().map(|m| m.len() == 0).unwrap_or(false);
    let mut writer = csv::WriterBuilder::new()
        .has_headers(is_new)
        .from_writer(file);
    writer
        .serialize(entry)
        .with_context(|| format!("writing audit row to {}", path.display()))?;
    writer
        .flush()
        .with_context(|| format!("flushing {}", path.display()))?;
    Ok(())
}

/// Largest entry of `dir` accepted by `keep`, compared by file name.
fn newest_entry(dir: &Path, keep: impl Fn(&str, bool) -> bool) -> Result<Option<PathBuf>> {
    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => {
            return Err(e).with_context(|| format!("listing {}", dir.display()));
        }
    };
    let mut best: Option<(String, PathBuf)> = None;
    for entry in entries {
        let entry = entry.with_context(|| format!("listing {}", dir.display()))?;
        let name = entry.file_name().to_string_lossy().into_owned();
        let is_dir = entry.file_type().map(|t| t.is_dir()).unwrap_or(false);
        if keep(&name, is_dir) && best.as_ref().is_none_or(|(b, _)| name > *b) {
            best = Some((name, entry.path()));
        }
    }
    Ok(best.map(|(_, path)| path))
}

fn recent_sync(base: &Path, limit: usize) -> Result<Vec<AuditEntry>> {
    let year_dir = newest_entry(base, |name, is_dir| {
        is_dir && name.len() == 4 && name.bytes().all(|b| b.is_ascii_digit())
    })?;
    let Some(year_dir) = year_dir else {
        return Ok(Vec::new());
    };
    let file = newest_entry(&year_dir, |name, is_dir| {
        !is_dir && name.starts_with("operations_") && name.ends_with(".csv")
    })?;
    let Some(file) = file else {
        return Ok(Vec::new());
    };

    let mut reader = csv::Reader::from_path(&file)
        .with_context(|| format!("opening {}", file.display()))?;
    let mut rows = Vec::new();
    for row in reader.deserialize::<AuditEntry>() {
        match row {
            Ok(entry) => rows.push(entry),
            Err(e) => tracing::warn!(file = %file.display(), error = %e, "skipping malformed audit row"),
        }
    }
    rows.reverse();
    rows.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
    rows.truncate(limit);
    Ok(rows)
}
