use std::time::Duration;

use crate::error::{EngineError, Result};

const DEFAULT_CHUNK_SIZE: usize = 64;
const DEFAULT_STEAL_THRESHOLD: f64 = 0.5;

/// Configuration for one engine node.
///
/// Addresses are `host:port` of coordination store instances. The local
/// store address doubles as this node's identity in broadcast messages.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// This node's own store instance (chunk queue, steal markers, universe).
    pub local_addr: String,
    /// Store instance where the computation marks items "updated".
    pub updates_addr: String,
    /// Store instances of upstream producers feeding new items.
    pub upstream_addrs: Vec<String>,
    /// Every participating node, including this one.
    pub fleet_addrs: Vec<String>,
    /// Maximum number of items handed out per chunk claim.
    pub chunk_size: usize,
    /// Enables the progress listener and the work-stealing phase.
    pub work_stealing: bool,
    /// Minimum completion gap before a lagging peer is stolen from.
    pub steal_threshold: f64,
    /// Bound on the stealee's wait for stealers to finish.
    /// Zero blocks forever, matching the upstream protocol.
    pub pop_timeout: Duration,
    /// Bound on waiting for the progress listener to acknowledge shutdown.
    pub shutdown_wait: Duration,
    /// Interval between stall warnings while blocked on peers.
    pub stall_log_interval: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self::new("127.0.0.1:6379")
    }
}

impl EngineConfig {
    /// Single-node configuration with the given local store address.
    pub fn new(local_addr: impl Into<String>) -> Self {
        let local_addr = local_addr.into();
        Self {
            updates_addr: local_addr.clone(),
            fleet_addrs: vec![local_addr.clone()],
            local_addr,
            upstream_addrs: Vec::new(),
            chunk_size: DEFAULT_CHUNK_SIZE,
            work_stealing: true,
            steal_threshold: DEFAULT_STEAL_THRESHOLD,
            pop_timeout: Duration::ZERO,
            shutdown_wait: Duration::from_secs(5),
            stall_log_interval: Duration::from_secs(30),
        }
    }

    pub fn with_updates(mut self, addr: impl Into<String>) -> Self {
        self.updates_addr = addr.into();
        self
    }

    pub fn with_upstream(mut self, addr: impl Into<String>) -> Self {
        self.upstream_addrs.push(addr.into());
        self
    }

    /// Replace fleet membership. Must include the local address.
    pub fn with_fleet(mut self, addrs: Vec<String>) -> Self {
        self.fleet_addrs = addrs;
        self
    }

    pub fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = chunk_size;
        self
    }

    pub fn with_work_stealing(mut self, enabled: bool) -> Self {
        self.work_stealing = enabled;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.chunk_size == 0 {
            return Err(EngineError::Config("chunk_size must be positive".into()));
        }
        if !self.fleet_addrs.contains(&self.local_addr) {
            return Err(EngineError::Config(format!(
                "fleet does not include local node {}",
                self.local_addr
            )));
        }
        if !(0.0..=1.0).contains(&self.steal_threshold) {
            return Err(EngineError::Config(format!(
                "steal_threshold {} outside [0, 1]",
                self.steal_threshold
            )));
        }
        Ok(())
    }

    /// Fleet members other than this node.
    pub fn peer_addrs(&self) -> impl Iterator<Item = &str> {
        self.fleet_addrs
            .iter()
            .filter(|a| **a != self.local_addr)
            .map(String::as_str)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config() {
        let cfg = EngineConfig::default();
        assert_eq!(cfg.local_addr, "127.0.0.1:6379");
        assert_eq!(cfg.updates_addr, cfg.local_addr);
        assert_eq!(cfg.fleet_addrs, vec![cfg.local_addr.clone()]);
        assert!(cfg.upstream_addrs.is_empty());
        assert_eq!(cfg.chunk_size, DEFAULT_CHUNK_SIZE);
        assert!(cfg.work_stealing);
        assert_eq!(cfg.pop_timeout, Duration::ZERO);
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn builder_helpers() {
        let cfg = EngineConfig::new("10.0.0.1:7001")
            .with_updates("10.0.0.9:7000")
            .with_upstream("10.0.0.5:7002")
            .with_upstream("10.0.0.6:7002")
            .with_fleet(vec!["10.0.0.1:7001".into(), "10.0.0.2:7001".into()])
            .with_chunk_size(16)
            .with_work_stealing(false);
        assert_eq!(cfg.updates_addr, "10.0.0.9:7000");
        assert_eq!(cfg.upstream_addrs.len(), 2);
        assert_eq!(cfg.chunk_size, 16);
        assert!(!cfg.work_stealing);
        assert!(cfg.validate().is_ok());
        assert_eq!(cfg.peer_addrs().collect::<Vec<_>>(), vec!["10.0.0.2:7001"]);
    }

    #[test]
    fn validate_rejects_zero_chunk_size() {
        let cfg = EngineConfig::default().with_chunk_size(0);
        assert!(matches!(cfg.validate(), Err(EngineError::Config(_))));
    }

    #[test]
    fn validate_rejects_fleet_without_local_node() {
        let cfg = EngineConfig::new("10.0.0.1:7001").with_fleet(vec!["10.0.0.2:7001".into()]);
        assert!(matches!(cfg.validate(), Err(EngineError::Config(_))));
    }

    #[test]
    fn validate_rejects_bad_threshold() {
        let mut cfg = EngineConfig::default();
        cfg.steal_threshold = 1.5;
        assert!(matches!(cfg.validate(), Err(EngineError::Config(_))));
    }
}
