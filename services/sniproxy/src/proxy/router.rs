//! Routing table and routing decisions.
//!
//! The table is built once from configuration, before the listener accepts
//! anything, and is read-only afterwards. It runs in one of two modes:
//! - allow-list: exact, case-sensitive hostname match only (no wildcards)
//! - allow-all: built from an empty target list, every hostname resolves to
//!   itself on [`DEFAULT_PORT`]

use std::collections::HashMap;

use tracing::debug;

use super::target::{BackendTarget, DEFAULT_PORT};

/// Hostname to backend mapping.
#[derive(Debug, Clone, Default)]
pub struct RoutingTable {
    /// Targets in configuration order.
    targets: Vec<BackendTarget>,
    /// Lookup by hostname. Last registration wins.
    by_host: HashMap<String, BackendTarget>,
}

impl RoutingTable {
    /// Build a table from configured targets. An empty list means allow-all.
    pub fn new(targets: Vec<BackendTarget>) -> Self {
        let mut by_host = HashMap::with_capacity(targets.len());
        for target in &targets {
            if let Some(previous) = by_host.insert(target.host().to_string(), target.clone()) {
                debug!(
                    hostname = %target.host(),
                    replaced = %previous,
                    target = %target,
                    "Duplicate hostname in routing table, last entry wins"
                );
            }
        }
        Self { targets, by_host }
    }

    /// A table that accepts every hostname.
    pub fn allow_all() -> Self {
        Self::new(Vec::new())
    }

    pub fn is_allow_all(&self) -> bool {
        self.targets.is_empty()
    }

    /// Resolve a hostname to its backend.
    ///
    /// Lookups are case-sensitive; callers wanting case-insensitive routing
    /// pass the result of [`normalize_hostname`]. In allow-all mode no
    /// validation of the hostname is done.
    pub fn resolve(&self, hostname: &str) -> Option<BackendTarget> {
        if self.is_allow_all() {
            return Some(BackendTarget::new(hostname, DEFAULT_PORT));
        }
        self.by_host.get(hostname).cloned()
    }

    /// Configured targets in configuration order.
    pub fn targets(&self) -> &[BackendTarget] {
        &self.targets
    }

    /// Number of distinct hostnames.
    pub fn len(&self) -> usize {
        self.by_host.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_host.is_empty()
    }
}

/// Normalize a hostname for matching.
///
/// - Convert to lowercase
/// - Trim trailing dot
pub fn normalize_hostname(hostname: &str) -> String {
    hostname.to_lowercase().trim_end_matches('.').to_string()
}
