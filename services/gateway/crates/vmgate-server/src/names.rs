//! Client-supplied VM identifiers → canonical resource names, and back to
//! human-facing display aliases.
//!
//! Pure functions only; the tables come from [`GatewayConfig`] at startup.

use vmgate_common::{GatewayConfig, VanityEntry};

#[derive(Debug, Clone)]
pub struct NameResolver {
    /// Sorted longest first so the longest matching suffix is stripped.
    suffixes: Vec<String>,
    vanity: Vec<VanityEntry>,
    display_domain: String,
}

impl NameResolver {
    #[must_use]
    pub fn new(suffixes: &[String], vanity: &[VanityEntry], display_domain: &str) -> Self {
        let mut suffixes: Vec<String> = suffixes
            .iter()
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect();
        suffixes.sort_by(|a, b| b.len().cmp(&a.len()).then_with(|| a.cmp(b)));
        Self {
            suffixes,
            vanity: vanity.to_vec(),
            display_domain: display_domain.to_string(),
        }
    }

    #[must_use]
    pub fn from_config(config: &GatewayConfig) -> Self {
        Self::new(
            &config.domain_suffixes,
            &config.vanity_names,
            &config.display_domain,
        )
    }

    /// Resolve a raw identifier to its canonical VM name.
    ///
    /// Known real names pass through untouched, which keeps the function
    /// idempotent even when a real name happens to start with a vanity prefix.
    #[must_use]
    pub fn canonicalize(&self, raw: &str) -> String {
        if raw.is_empty() || self.is_real_name(raw) {
            return raw.to_string();
        }
        let base = self.strip_suffixes(raw);
        if self.is_real_name(base) {
            return base.to_string();
        }
        if let Some(entry) = self.vanity_for(base) {
            tracing::debug!(raw, real = %entry.real, "mapped vanity name");
            return entry.real.clone();
        }
        base.to_string()
    }

    /// Human-facing alias for a name, e.g. `guedfocnlq03` → `nlq.ibi.systems`.
    ///
    /// Returns the input unchanged when no vanity entry covers it.
    #[must_use]
    pub fn display_alias(&self, name: &str) -> String {
        let base = self.strip_suffixes(name);
        self.vanity
            .iter()
            .find(|e| base == e.real || base.starts_with(e.vanity.as_str()))
            .map_or_else(
                || name.to_string(),
                |e| format!("{}{}", e.vanity, self.display_domain),
            )
    }

    fn is_real_name(&self, name: &str) -> bool {
        self.vanity.iter().any(|e| e.real == name)
    }

    fn vanity_for(&self, name: &str) -> Option<&VanityEntry> {
        self.vanity
            .iter()
            .find(|e| name.starts_with(e.vanity.as_str()))
    }

    /// Strip known suffixes until none matches. A suffix is never stripped
    /// when it is the whole name.
    fn strip_suffixes<'a>(&self, mut name: &'a str) -> &'a str {
        loop {
            let current = name;
            let stripped = self.suffixes.iter().find_map(|s| {
                current
                    .strip_suffix(s.as_str())
                    .filter(|rest| !rest.is_empty())
            });
            match stripped {
                Some(rest) => name = rest,
                None => return name,
            }
        }
    }
}
