// Copyright 2026 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Tunables for the coherence protocol, loadable from TOML.

use serde::Deserialize;

use crate::DsmError;

/// Protocol configuration. All fields carry conservative defaults; unknown
/// keys in a TOML document are rejected.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DsmConfig {
    /// Pages considered for prefetch after a fault (the window following
    /// the faulting address).
    pub prefetch_window: usize,
    /// Offset in pages from the faulting address to the start of the
    /// window. 0 includes the faulting page itself; the default 1 starts
    /// at the page immediately following it.
    pub prefetch_skip: usize,
    /// Prefetch every Nth fault. 1 = every fault, 0 disables prefetch.
    pub prefetch_cadence: u32,
    /// Number of hash buckets in the fault coordination table.
    pub fault_buckets: usize,
    /// Upper bound on in-flight fault handles per process context.
    /// Exhaustion surfaces as a retryable error rather than an abort.
    pub max_fault_handles: usize,
    /// Bound on follower re-wait / retry-queue spins before a warning is
    /// logged. A safety valve, not a correctness dependency.
    pub retry_limit: u32,
    /// Wake primary-queue waiters one at a time instead of all at once.
    /// Serializes follower re-checks for diagnosis; slower.
    pub sequential_wake: bool,
    /// Worker threads per in-process transport endpoint.
    pub worker_threads: usize,
}

impl Default for DsmConfig {
    fn default() -> Self {
        Self {
            prefetch_window: 10,
            prefetch_skip: 1,
            prefetch_cadence: 1,
            fault_buckets: 31,
            max_fault_handles: 1024,
            retry_limit: 16,
            sequential_wake: false,
            worker_threads: 2,
        }
    }
}

impl DsmConfig {
    /// Parses a configuration from a TOML document.
    pub fn from_toml_str(doc: &str) -> Result<Self, DsmError> {
        let cfg: Self = toml::from_str(doc).map_err(|e| DsmError::Config(e.to_string()))?;
        cfg.validate()?;
        Ok(cfg)
    }

    fn validate(&self) -> Result<(), DsmError> {
        if self.fault_buckets == 0 {
            return Err(DsmError::Config("fault_buckets must be non-zero".into()));
        }
        if self.max_fault_handles == 0 {
            return Err(DsmError::Config("max_fault_handles must be non-zero".into()));
        }
        if self.worker_threads == 0 {
            return Err(DsmError::Config("worker_threads must be non-zero".into()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::DsmConfig;

    #[test]
    fn defaults_are_stable() {
        let cfg = DsmConfig::default();
        assert_eq!(cfg.prefetch_window, 10);
        assert_eq!(cfg.prefetch_skip, 1);
        assert_eq!(cfg.prefetch_cadence, 1);
        assert_eq!(cfg.fault_buckets, 31);
    }

    #[test]
    fn toml_overrides_and_rejects_unknown_keys() {
        let cfg = DsmConfig::from_toml_str("prefetch_window = 4\nfault_buckets = 7\n")
            .expect("valid config");
        assert_eq!(cfg.prefetch_window, 4);
        assert_eq!(cfg.fault_buckets, 7);

        assert!(DsmConfig::from_toml_str("page_sizes = 8192\n").is_err());
        assert!(DsmConfig::from_toml_str("fault_buckets = 0\n").is_err());
    }
}
