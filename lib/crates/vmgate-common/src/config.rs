use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::types::Operation;

/// Errors found while validating a [`GatewayConfig`].
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("invalid vanity entry '{0}': expected '<vanity-prefix>=<real-name>'")]
    InvalidVanityEntry(String),

    #[error("cache max age must be greater than zero")]
    ZeroMaxAge,

    #[error("scan concurrency must be greater than zero")]
    ZeroScanConcurrency,

    #[error("domain suffixes must not be empty strings")]
    EmptyDomainSuffix,

    #[error("{name} timeout must be greater than zero")]
    ZeroTimeout { name: &'static str },
}

/// One row of the vanity table: names starting with `vanity` resolve to `real`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct VanityEntry {
    pub vanity: String,
    pub real: String,
}

impl VanityEntry {
    #[must_use]
    pub fn new(vanity: impl Into<String>, real: impl Into<String>) -> Self {
        Self {
            vanity: vanity.into(),
            real: real.into(),
        }
    }
}

impl FromStr for VanityEntry {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (vanity, real) = s
            .split_once('=')
            .ok_or_else(|| ConfigError::InvalidVanityEntry(s.to_string()))?;
        let (vanity, real) = (vanity.trim(), real.trim());
        if vanity.is_empty() || real.is_empty() {
            return Err(ConfigError::InvalidVanityEntry(s.to_string()));
        }
        Ok(Self::new(vanity, real))
    }
}

impl TryFrom<String> for VanityEntry {
    type Error = ConfigError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<VanityEntry> for String {
    fn from(entry: VanityEntry) -> Self {
        format!("{}={}", entry.vanity, entry.real)
    }
}

/// Gateway configuration, loaded from `VMGATE_*` environment variables via `envy`.
///
/// Every field has a default, so an empty environment yields a working
/// configuration. List values are comma-separated.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    /// Socket address the HTTP server binds to.
    #[serde(default = "default_listen_addr")]
    pub listen_addr: SocketAddr,

    /// Canonical VM names on which restricted operations are permitted.
    #[serde(default = "default_allowed_vms")]
    pub allowed_vms: Vec<String>,

    /// Operations that require the VM to be on the allow-list.
    #[serde(default = "default_restricted_operations")]
    pub restricted_operations: Vec<Operation>,

    /// Ordered vanity table; the first matching prefix wins.
    #[serde(default = "default_vanity_names")]
    pub vanity_names: Vec<VanityEntry>,

    /// Domain suffixes stripped from client-supplied names.
    #[serde(default = "default_domain_suffixes")]
    pub domain_suffixes: Vec<String>,

    /// Domain appended to a vanity prefix to build a display alias.
    #[serde(default = "default_display_domain")]
    pub display_domain: String,

    #[serde(default = "default_cache_max_age_secs")]
    pub cache_max_age_secs: u64,

    /// Where the directory snapshot is persisted.
    #[serde(default = "default_snapshot_path")]
    pub snapshot_path: PathBuf,

    /// Root directory of the monthly audit CSV files.
    #[serde(default = "default_audit_dir")]
    pub audit_dir: PathBuf,

    /// Path or name of the `gcloud` executable.
    #[serde(default = "default_gcloud_bin")]
    pub gcloud_bin: String,

    /// Cloud project; discovered from the CLI's active configuration when unset.
    #[serde(default)]
    pub project: Option<String>,

    /// Zone-name prefixes scanned during a directory refresh.
    #[serde(default = "default_target_regions")]
    pub target_regions: Vec<String>,

    /// Zones scanned when zone discovery fails.
    #[serde(default = "default_fallback_zones")]
    pub fallback_zones: Vec<String>,

    /// Maximum number of zones listed concurrently.
    #[serde(default = "default_scan_concurrency")]
    pub scan_concurrency: usize,

    #[serde(default = "default_describe_timeout_secs")]
    pub describe_timeout_secs: u64,

    #[serde(default = "default_lifecycle_timeout_secs")]
    pub lifecycle_timeout_secs: u64,

    #[serde(default = "default_discovery_timeout_secs")]
    pub discovery_timeout_secs: u64,
}

fn default_listen_addr() -> SocketAddr {
    SocketAddr::from(([0, 0, 0, 0], 8000))
}

fn default_allowed_vms() -> Vec<String> {
    vec![
        "guedfocnlq03".to_string(),
        "guedfocdsml01".to_string(),
        "guedfocwqa82".to_string(),
    ]
}

fn default_restricted_operations() -> Vec<Operation> {
    vec![Operation::Stop, Operation::Suspend]
}

fn default_vanity_names() -> Vec<VanityEntry> {
    vec![
        VanityEntry::new("nlq", "guedfocnlq03"),
        VanityEntry::new("py-server", "guedfocdsml01"),
    ]
}

fn default_domain_suffixes() -> Vec<String> {
    vec![
        ".dev.tibco.com".to_string(),
        ".ibi.systems".to_string(),
        ".tibco.com".to_string(),
    ]
}

fn default_display_domain() -> String {
    ".ibi.systems".to_string()
}

fn default_cache_max_age_secs() -> u64 {
    3600
}

fn default_snapshot_path() -> PathBuf {
    PathBuf::from("vm_cache.json")
}

fn default_audit_dir() -> PathBuf {
    PathBuf::from("logs").join("operations")
}

fn default_gcloud_bin() -> String {
    "gcloud".to_string()
}

fn default_target_regions() -> Vec<String> {
    vec!["us-".to_string(), "asia-".to_string()]
}

fn default_fallback_zones() -> Vec<String> {
    [
        "us-central1-a",
        "us-central1-b",
        "us-east1-b",
        "asia-east1-a",
        "asia-southeast1-a",
    ]
    .into_iter()
    .map(String::from)
    .collect()
}

fn default_scan_concurrency() -> usize {
    4
}

fn default_describe_timeout_secs() -> u64 {
    60
}

fn default_lifecycle_timeout_secs() -> u64 {
    900
}

fn default_discovery_timeout_secs() -> u64 {
    120
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            listen_addr: default_listen_addr(),
            allowed_vms: default_allowed_vms(),
            restricted_operations: default_restricted_operations(),
            vanity_names: default_vanity_names(),
            domain_suffixes: default_domain_suffixes(),
            display_domain: default_display_domain(),
            cache_max_age_secs: default_cache_max_age_secs(),
            snapshot_path: default_snapshot_path(),
            audit_dir: default_audit_dir(),
            gcloud_bin: default_gcloud_bin(),
            project: None,
            target_regions: default_target_regions(),
            fallback_zones: default_fallback_zones(),
            scan_concurrency: default_scan_concurrency(),
            describe_timeout_secs: default_describe_timeout_secs(),
            lifecycle_timeout_secs: default_lifecycle_timeout_secs(),
            discovery_timeout_secs: default_discovery_timeout_secs(),
        }
    }
}

impl GatewayConfig {
    /// Check cross-field constraints that serde defaults cannot express.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.cache_max_age_secs == 0 {
            return Err(ConfigError::ZeroMaxAge);
        }
        if self.scan_concurrency == 0 {
            return Err(ConfigError::ZeroScanConcurrency);
        }
        if self.domain_suffixes.iter().any(|s| s.trim().is_empty()) {
            return Err(ConfigError::EmptyDomainSuffix);
        }
        for (name, secs) in [
            ("describe", self.describe_timeout_secs),
            ("lifecycle", self.lifecycle_timeout_secs),
            ("discovery", self.discovery_timeout_secs),
        ] {
            if secs == 0 {
                return Err(ConfigError::ZeroTimeout { name });
            }
        }
        Ok(())
    }

    #[must_use]
    pub fn cache_max_age(&self) -> Duration {
        Duration::from_secs(self.cache_max_age_secs)
    }

    #[must_use]
    pub fn describe_timeout(&self) -> Duration {
        Duration::from_secs(self.describe_timeout_secs)
    }

    #[must_use]
    pub fn lifecycle_timeout(&self) -> Duration {
        Duration::from_secs(self.lifecycle_timeout_secs)
    }

    #[must_use]
    pub fn discovery_timeout(&self) -> Duration {
        Duration::from_secs(self.discovery_timeout_secs)
    }

    #[must_use]
    pub fn is_restricted(&self, operation: Operation) -> bool {
        self.restricted_operations.contains(&operation)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn from_pairs(pairs: &[(&str, &str)]) -> Result<GatewayConfig, envy::Error> {
        envy::prefixed("VMGATE_").from_iter(
            pairs
                .iter()
                .map(|(k, v)| ((*k).to_string(), (*v).to_string())),
        )
    }

    #[test]
    fn empty_environment_yields_defaults() {
        let cfg = from_pairs(&[]).unwrap();
        assert_eq!(cfg.listen_addr, "0.0.0.0:8000".parse::<SocketAddr>().unwrap());
        assert_eq!(cfg.allowed_vms, default_allowed_vms());
        assert_eq!(
            cfg.restricted_operations,
            vec![Operation::Stop, Operation::Suspend]
        );
        assert_eq!(cfg.cache_max_age(), Duration::from_secs(3600));
        assert!(cfg.project.is_none());
        cfg.validate().unwrap();
    }

    #[test]
    fn comma_separated_lists_are_split() {
        let cfg = from_pairs(&[
            ("VMGATE_ALLOWED_VMS", "alpha,beta"),
            ("VMGATE_RESTRICTED_OPERATIONS", "stop,suspend,resume"),
            ("VMGATE_VANITY_NAMES", "web=guedfocweb01,db=guedfocdb02"),
        ])
        .unwrap();
        assert_eq!(cfg.allowed_vms, vec!["alpha", "beta"]);
        assert!(cfg.is_restricted(Operation::Resume));
        assert!(!cfg.is_restricted(Operation::Start));
        assert_eq!(
            cfg.vanity_names,
            vec![
                VanityEntry::new("web", "guedfocweb01"),
                VanityEntry::new("db", "guedfocdb02"),
            ]
        );
    }

    #[test]
    fn malformed_vanity_entry_is_rejected() {
        assert!(from_pairs(&[("VMGATE_VANITY_NAMES", "nlq")]).is_err());
        assert!(from_pairs(&[("VMGATE_VANITY_NAMES", "=guedfocnlq03")]).is_err());
        assert_eq!(
            "nlq=".parse::<VanityEntry>(),
            Err(ConfigError::InvalidVanityEntry("nlq=".to_string()))
        );
    }

    #[test]
    fn unknown_restricted_operation_is_rejected() {
        assert!(from_pairs(&[("VMGATE_RESTRICTED_OPERATIONS", "reboot")]).is_err());
    }

    #[test]
    fn validate_rejects_zero_values() {
        let cfg = GatewayConfig {
            cache_max_age_secs: 0,
            ..GatewayConfig::default()
        };
        assert_eq!(cfg.validate(), Err(ConfigError::ZeroMaxAge));

        let cfg = GatewayConfig {
            scan_concurrency: 0,
            ..GatewayConfig::default()
        };
        assert_eq!(cfg.validate(), Err(ConfigError::ZeroScanConcurrency));

        let cfg = GatewayConfig {
            lifecycle_timeout_secs: 0,
            ..GatewayConfig::default()
        };
        assert_eq!(
            cfg.validate(),
            Err(ConfigError::ZeroTimeout { name: "lifecycle" })
        );
    }

    #[test]
    fn validate_rejects_blank_domain_suffix() {
        let cfg = GatewayConfig {
            domain_suffixes: vec![".tibco.com".to_string(), " ".to_string()],
            ..GatewayConfig::default()
        };
        assert_eq!(cfg.validate(), Err(ConfigError::EmptyDomainSuffix));
    }

    #[test]
    fn vanity_entry_round_trips_through_its_string_form() {
        let entry = VanityEntry::new("py-server", "guedfocdsml01");
        let json = serde_json::to_string(&entry).unwrap();
        assert_eq!(json, "\"py-server=guedfocdsml01\"");
        let back: VanityEntry = serde_json::from_str(&json).unwrap();
        assert_eq!(back, entry);
    }
}
