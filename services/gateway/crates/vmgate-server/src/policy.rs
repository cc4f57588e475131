//! Which operations may run on which VMs.

use std::collections::BTreeSet;

use vmgate_common::{GatewayConfig, Operation};

use crate::names::NameResolver;

/// Pure allow/deny decision over `{canonical name, operation}`.
#[derive(Debug, Clone)]
pub struct AuthorizationPolicy {
    restricted: BTreeSet<Operation>,
    /// Kept in configuration order for rendering.
    allowed: Vec<String>,
}

/// An allow-list entry paired with its display alias.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct AllowedVm {
    pub name: String,
    pub alias: String,
}

impl AuthorizationPolicy {
    #[must_use]
    pub fn new(restricted: &[Operation], allowed: &[String]) -> Self {
        Self {
            restricted: restricted.iter().copied().collect(),
            allowed: allowed
                .iter()
                .map(|vm| vm.trim().to_string())
                .filter(|vm| !vm.is_empty())
                .collect(),
        }
    }

    #[must_use]
    pub fn from_config(config: &GatewayConfig) -> Self {
        Self::new(&config.restricted_operations, &config.allowed_vms)
    }

    /// Non-restricted operations are always allowed; restricted ones only
    /// for allow-listed canonical names.
    #[must_use]
    pub fn is_allowed(&self, canonical: &str, operation: Operation) -> bool {
        !self.is_restricted(operation) || self.allowed.iter().any(|vm| vm == canonical)
    }

    #[must_use]
    pub fn is_restricted(&self, operation: Operation) -> bool {
        self.restricted.contains(&operation)
    }

    /// The allow-list with each entry's display alias, for denial messages.
    #[must_use]
    pub fn allowed_with_aliases(&self, names: &NameResolver) -> Vec<AllowedVm> {
        self.allowed
            .iter()
            .map(|vm| AllowedVm {
                name: vm.clone(),
                alias: names.display_alias(vm),
            })
            .collect()
    }
}
