//! Cache Configuration
//!
//! All knobs are fixed when a node is constructed. Nothing here is mutated at runtime,
//! so every component reads the same values for the whole life of the node.

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::error::{CacheError, CacheResult};

pub const DEFAULT_PARTITIONS: u32 = 256;
pub const DEFAULT_BACKUPS: usize = 1;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Fixed number of partitions the keyspace is split into.
    pub partitions: u32,
    /// Number of backup copies kept besides the primary.
    pub backups: usize,
    /// Default lifetime of a transaction before it is marked rollback-only.
    pub tx_timeout: Duration,
    /// Maximum wait for a single key lock.
    pub lock_timeout: Duration,
    /// Idle time after which an orphaned transaction is forcibly resolved.
    pub salvage_timeout: Duration,
    /// How often the sweeper looks for timed-out and orphaned transactions.
    pub sweep_interval: Duration,
    /// Upper bound a node waits for peers during a single exchange.
    pub exchange_timeout: Duration,
    /// Timeout of a single request/response round trip between nodes.
    pub network_timeout: Duration,
    /// When disabled, MOVING partitions are owned right after the exchange.
    pub preload_enabled: bool,
    /// Verify node2part / part2node symmetry after every topology mutation.
    pub consistency_check: bool,
    pub one_phase_commit: bool,
    pub near_cache_enabled: bool,
    /// Write committed entries through to the configured store.
    pub write_through: bool,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            partitions: DEFAULT_PARTITIONS,
            backups: DEFAULT_BACKUPS,
            tx_timeout: Duration::from_secs(10),
            lock_timeout: Duration::from_secs(5),
            salvage_timeout: Duration::from_secs(10),
            sweep_interval: Duration::from_millis(500),
            exchange_timeout: Duration::from_secs(10),
            network_timeout: Duration::from_secs(3),
            preload_enabled: true,
            consistency_check: true,
            one_phase_commit: true,
            near_cache_enabled: true,
            write_through: true,
        }
    }
}

impl CacheConfig {
    pub fn with_partitions(mut self, partitions: u32) -> Self {
        self.partitions = partitions;
        self
    }

    pub fn with_backups(mut self, backups: usize) -> Self {
        self.backups = backups;
        self
    }

    pub fn with_tx_timeout(mut self, timeout: Duration) -> Self {
        self.tx_timeout = timeout;
        self
    }

    pub fn with_lock_timeout(mut self, timeout: Duration) -> Self {
        self.lock_timeout = timeout;
        self
    }

    pub fn with_salvage_timeout(mut self, timeout: Duration) -> Self {
        self.salvage_timeout = timeout;
        self
    }

    pub fn with_sweep_interval(mut self, interval: Duration) -> Self {
        self.sweep_interval = interval;
        self
    }

    pub fn with_exchange_timeout(mut self, timeout: Duration) -> Self {
        self.exchange_timeout = timeout;
        self
    }

    pub fn with_network_timeout(mut self, timeout: Duration) -> Self {
        self.network_timeout = timeout;
        self
    }

    pub fn with_preload(mut self, enabled: bool) -> Self {
        self.preload_enabled = enabled;
        self
    }

    pub fn with_consistency_check(mut self, enabled: bool) -> Self {
        self.consistency_check = enabled;
        self
    }

    pub fn with_one_phase_commit(mut self, enabled: bool) -> Self {
        self.one_phase_commit = enabled;
        self
    }

    pub fn with_near_cache(mut self, enabled: bool) -> Self {
        self.near_cache_enabled = enabled;
        self
    }

    pub fn with_write_through(mut self, enabled: bool) -> Self {
        self.write_through = enabled;
        self
    }

    /// Rejects settings a node cannot run with.
    pub fn validate(&self) -> CacheResult<()> {
        if self.partitions == 0 {
            return Err(CacheError::Config("partition count must be at least 1".to_string()));
        }
        if self.sweep_interval.is_zero() {
            return Err(CacheError::Config("sweep interval must be positive".to_string()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let cfg = CacheConfig::default();

        assert_eq!(cfg.partitions, 256);
        assert_eq!(cfg.backups, 1);
        assert_eq!(cfg.salvage_timeout, Duration::from_secs(10));
        assert!(cfg.preload_enabled);
        assert!(cfg.consistency_check);
    }

    #[test]
    fn test_builder_overrides() {
        let cfg = CacheConfig::default()
            .with_partitions(64)
            .with_backups(2)
            .with_preload(false);

        assert_eq!(cfg.partitions, 64);
        assert_eq!(cfg.backups, 2);
        assert!(!cfg.preload_enabled);
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn test_zero_partitions_rejected() {
        let err = CacheConfig::default().with_partitions(0).validate().unwrap_err();
        assert!(matches!(err, CacheError::Config(_)));

        let err = CacheConfig::default()
            .with_sweep_interval(Duration::ZERO)
            .validate()
            .unwrap_err();
        assert!(matches!(err, CacheError::Config(_)));
    }
}
