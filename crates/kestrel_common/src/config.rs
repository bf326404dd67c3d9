use serde::{Deserialize, Serialize};

/// Top-level coordinator configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoreConfig {
    /// Number of virtual buckets in the upstream source.
    pub num_vbuckets: usize,
    #[serde(default)]
    pub snapshot: SnapshotConfig,
    #[serde(default)]
    pub scan: ScanConfig,
    #[serde(default)]
    pub metadata: MetadataConfig,
    #[serde(default)]
    pub cluster: ClusterConfig,
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            num_vbuckets: 1024,
            snapshot: SnapshotConfig::default(),
            scan: ScanConfig::default(),
            metadata: MetadataConfig::default(),
            cluster: ClusterConfig::default(),
        }
    }
}

/// Snapshot creation and notification settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotConfig {
    /// Number of concurrent snapshot workers per flush. Values below 1 fall
    /// back to 10000, one worker per supportable index.
    pub num_workers: i64,
    /// Capacity of each per-shard notification queue; oldest entries are
    /// dropped on overflow.
    pub notify_queue_len: usize,
    /// Number of sharded snapshot request channels.
    pub num_request_shards: usize,
}

impl Default for SnapshotConfig {
    fn default() -> Self {
        Self {
            num_workers: 4,
            notify_queue_len: 64,
            num_request_shards: 4,
        }
    }
}

impl SnapshotConfig {
    /// Effective worker count, preserving the historical `<= 0` fallback.
    pub fn effective_workers(&self) -> usize {
        if self.num_workers < 1 {
            10000
        } else {
            self.num_workers as usize
        }
    }
}

/// Scan-path settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScanConfig {
    /// Scan timeout in milliseconds; 0 disables the deadline.
    pub timeout_ms: u64,
    /// Retries when fetching current seqnos for session consistency.
    pub getseqnos_retries: u32,
    /// Enable the fast-count rewrite for eligible COUNT queries.
    pub enable_fast_count: bool,
}

impl Default for ScanConfig {
    fn default() -> Self {
        Self {
            timeout_ms: 120_000,
            getseqnos_retries: 30,
            enable_fast_count: true,
        }
    }
}

/// Local metadata persistence settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetadataConfig {
    /// When an external metadata manager is present, the local instance-map
    /// file is not maintained.
    pub enable_manager: bool,
    pub data_dir: String,
}

impl Default for MetadataConfig {
    fn default() -> Self {
        Self {
            enable_manager: true,
            data_dir: "./data".into(),
        }
    }
}

/// Cluster-management and failover-log adapter settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterConfig {
    pub cluster_addr: String,
    pub username: String,
    pub password: String,
    /// Rebalance progress poll interval.
    pub rebalance_poll_secs: u64,
    /// Deadline after which a pending rebalance is reported timed out.
    pub rebalance_timeout_secs: u64,
    /// Failover log fetch retries during restart-ts validation.
    pub failover_log_retries: u32,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            cluster_addr: "127.0.0.1:8091".into(),
            username: String::new(),
            password: String::new(),
            rebalance_poll_secs: 5,
            rebalance_timeout_secs: 1800,
            failover_log_retries: 10,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_worker_fallback_preserved() {
        let mut cfg = SnapshotConfig::default();
        cfg.num_workers = 0;
        assert_eq!(cfg.effective_workers(), 10000);
        cfg.num_workers = -3;
        assert_eq!(cfg.effective_workers(), 10000);
        cfg.num_workers = 8;
        assert_eq!(cfg.effective_workers(), 8);
    }

    #[test]
    fn test_defaults_roundtrip_through_json() {
        let cfg = CoreConfig::default();
        let s = serde_json::to_string(&cfg).unwrap();
        let back: CoreConfig = serde_json::from_str(&s).unwrap();
        assert_eq!(back.num_vbuckets, 1024);
        assert_eq!(back.cluster.rebalance_poll_secs, 5);
        assert_eq!(back.cluster.rebalance_timeout_secs, 1800);
        assert_eq!(back.cluster.failover_log_retries, 10);
    }

    #[test]
    fn test_partial_config_fills_defaults() {
        let cfg: CoreConfig = serde_json::from_str(r#"{"num_vbuckets": 64}"#).unwrap();
        assert_eq!(cfg.num_vbuckets, 64);
        assert_eq!(cfg.snapshot.num_workers, 4);
        assert!(cfg.scan.enable_fast_count);
    }
}
