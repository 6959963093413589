//! Operator configuration
//!
//! Loaded once at startup from an optional YAML file (camelCase keys, every
//! field defaulted) and overridden by command-line flags in the binary. The
//! reconciler only ever reads it.

use std::path::Path;
use std::time::Duration;

use serde::Deserialize;

use crate::Error;

/// Full operator configuration
#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct StewardConfig {
    /// How long a node may stay unreachable before it is considered dead
    #[serde(with = "humantime_serde")]
    pub node_unreachable_toleration: Duration,

    /// Never purge if fewer ready control-plane nodes would remain
    pub min_ready_master_nodes: u32,

    /// Never purge if fewer ready worker nodes would remain
    pub min_ready_worker_nodes: u32,

    /// Purge nodes that have been unreachable longer than the toleration
    pub purge_dead_nodes: bool,

    /// Force-delete terminating pods stuck on dead nodes
    pub clear_dead_nodes: bool,

    /// Manage Rook storage node membership and pool replication
    pub maintain_storage: bool,

    /// Lower bound for pool replication
    pub min_ceph_pool_replication: u32,

    /// Upper bound for pool replication
    pub max_ceph_pool_replication: u32,

    /// Time between reconcile ticks
    #[serde(with = "humantime_serde")]
    pub reconcile_interval: Duration,

    /// Every Nth tick is a full reconcile
    pub full_reconcile_every: u64,

    /// Rotate certificates on full reconciles
    pub rotate_certs: bool,

    /// Minimum time between two certificate rotation sweeps
    #[serde(with = "humantime_serde")]
    pub rotate_certs_check_interval: Duration,

    /// Certificates expiring within this window are rotated
    #[serde(with = "humantime_serde")]
    pub rotate_certs_ttl: Duration,

    /// Keep the per-node internal load balancer config in sync
    pub internal_load_balancer: bool,

    /// Approve pending kubelet serving CSRs
    pub approve_kubelet_csrs: bool,

    /// Namespace for marker records and host task pods
    pub namespace: String,

    /// Image used for host task pods
    pub host_task_image: String,

    /// Interval between host task status polls
    #[serde(with = "humantime_serde")]
    pub task_poll_interval: Duration,

    /// Pause between consecutive nodes of a host task batch
    #[serde(with = "humantime_serde")]
    pub task_node_delay: Duration,

    /// Rook resource names
    pub rook: RookConfig,
}

/// Names of the Rook resources steward manages
#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct RookConfig {
    /// Rook operator namespace
    pub namespace: String,
    /// CephCluster name
    pub cluster: String,
    /// CephBlockPool name
    pub block_pool: String,
    /// CephFilesystem name
    pub filesystem: String,
    /// CephObjectStore name
    pub object_store: String,
    /// CephBlockPool resource backing the device health metrics pool
    pub health_pool: String,
    /// Ceph pool name of the device health metrics pool
    pub health_ceph_pool: String,
}

impl Default for RookConfig {
    fn default() -> Self {
        Self {
            namespace: "rook-ceph".to_string(),
            cluster: "rook-ceph".to_string(),
            block_pool: "replicapool".to_string(),
            filesystem: "rook-shared-fs".to_string(),
            object_store: "rook-ceph-store".to_string(),
            health_pool: "device-health-metrics".to_string(),
            health_ceph_pool: "device_health_metrics".to_string(),
        }
    }
}

impl Default for StewardConfig {
    fn default() -> Self {
        Self {
            node_unreachable_toleration: Duration::from_secs(60 * 60),
            min_ready_master_nodes: 2,
            min_ready_worker_nodes: 0,
            purge_dead_nodes: false,
            clear_dead_nodes: false,
            maintain_storage: false,
            min_ceph_pool_replication: 1,
            max_ceph_pool_replication: 3,
            reconcile_interval: Duration::from_secs(60),
            full_reconcile_every: 60,
            rotate_certs: true,
            rotate_certs_check_interval: Duration::from_secs(24 * 60 * 60),
            rotate_certs_ttl: Duration::from_secs(30 * 24 * 60 * 60),
            internal_load_balancer: false,
            approve_kubelet_csrs: false,
            namespace: "kube-system".to_string(),
            host_task_image: "ghcr.io/steward/steward:latest".to_string(),
            task_poll_interval: Duration::from_secs(2),
            task_node_delay: Duration::from_secs(5),
            rook: RookConfig::default(),
        }
    }
}

impl StewardConfig {
    /// Load configuration from a YAML file and validate it
    pub fn from_file(path: &Path) -> Result<Self, Error> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| Error::config(format!("failed to read {}: {}", path.display(), e)))?;
        Self::from_yaml(&content)
    }

    /// Parse configuration from YAML and validate it
    pub fn from_yaml(content: &str) -> Result<Self, Error> {
        let config: Self = serde_yaml::from_str(content)
            .map_err(|e| Error::config(format!("invalid config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Reject settings the reconciler cannot act on
    pub fn validate(&self) -> Result<(), Error> {
        if self.min_ceph_pool_replication == 0 {
            return Err(Error::config("minCephPoolReplication must be at least 1"));
        }
        if self.min_ceph_pool_replication > self.max_ceph_pool_replication {
            return Err(Error::config(format!(
                "minCephPoolReplication ({}) exceeds maxCephPoolReplication ({})",
                self.min_ceph_pool_replication, self.max_ceph_pool_replication
            )));
        }
        if self.full_reconcile_every == 0 {
            return Err(Error::config("fullReconcileEvery must be at least 1"));
        }
        if self.reconcile_interval.is_zero() {
            return Err(Error::config("reconcileInterval must be non-zero"));
        }
        if self.namespace.is_empty() {
            return Err(Error::config("namespace must not be empty"));
        }
        Ok(())
    }
}
