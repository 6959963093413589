//! Steward - self-managing cluster operator
//!
//! Steward keeps a running Kubernetes cluster consistent with a handful of
//! operational invariants without any consensus protocol of its own. The API
//! server is the only source of truth; every decision is re-derived from it on
//! each tick.
//!
//! # Architecture
//!
//! A [`poller::Poller`] lists nodes on a fixed interval and hands the snapshot
//! to the [`reconciler::Reconciler`], which runs one tick at a time:
//! - dead nodes are purged through [`purge`] when minimum ready counts allow it
//! - storage replication follows the ready node count through [`storage`]
//! - certificates and the internal load balancer are maintained on every host
//!   through [`task`], gated by the idempotency markers in [`marker`]
//!
//! # Modules
//!
//! - [`node`] - Pure node classification (ready, master, dead)
//! - [`marker`] - Per-kind idempotency records stored in ConfigMaps
//! - [`task`] - Node-pinned privileged pods ("host tasks")
//! - [`purge`] - Ordered teardown of a departed node
//! - [`storage`] - Rook/Ceph replication and storage node membership
//! - [`reconciler`] - The per-tick control loop and its sub-flows
//! - [`poller`] - Fixed-interval driver for the reconciler
//! - [`suspension`] - Shared registry for pausing sub-flows
//! - [`gateway`] - Trait seams over the Kubernetes API
//! - [`config`] - Operator configuration
//! - [`telemetry`] - Logging setup
//! - [`error`] - Error types

#![deny(missing_docs)]

pub mod config;
pub mod error;
pub mod gateway;
pub mod marker;
pub mod node;
pub mod poller;
pub mod purge;
pub mod reconciler;
pub mod storage;
pub mod suspension;
pub mod task;
pub mod telemetry;

pub use error::Error;

/// Result type alias using our custom Error type
pub type Result<T> = std::result::Result<T, Error>;

// =============================================================================
// Shared constants
// =============================================================================

/// Name steward writes as its `managed-by` label value and as the field
/// manager of the CSR approval patch
pub const FIELD_MANAGER: &str = "steward";

/// Label marking resources created by steward
pub const MANAGED_BY_LABEL: &str = "app.kubernetes.io/managed-by";

/// Label carrying the host task kind, used for sweeps
pub const TASK_KIND_LABEL: &str = "steward.io/task";

/// Well-known hostname label set by the kubelet
pub const HOSTNAME_LABEL: &str = "kubernetes.io/hostname";

/// Role label carried by control-plane nodes
pub const CONTROL_PLANE_LABEL: &str = "node-role.kubernetes.io/control-plane";

/// Legacy role label carried by control-plane nodes on older clusters
pub const LEGACY_MASTER_LABEL: &str = "node-role.kubernetes.io/master";

/// Namespace holding kubeadm and etcd resources
pub const KUBE_SYSTEM_NAMESPACE: &str = "kube-system";
