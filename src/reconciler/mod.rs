//! Reconciler
//!
//! One tick takes a node snapshot and walks it through every enabled
//! sub-flow: dead node purge and stuck pod clearing per node, then storage,
//! certificate rotation, the internal load balancer and CSR approval for the
//! cluster as a whole.
//!
//! Ticks are serialized by a single async mutex. A tick that arrives while
//! another is running waits for it rather than being dropped, so every full
//! reconcile requested by the poller eventually runs.
//!
//! Sub-flows are independent: one failing does not prevent the others from
//! running, and the tick reports everything that failed as one aggregate
//! error.

mod certs;
mod csr;
mod lb;

pub use certs::{control_plane_task, CertRotation, CertificateAuthority};
pub use csr::{should_approve, CsrApprover, APPROVAL_REASON, KUBELET_SERVING_SIGNER};
pub use lb::{lb_fingerprint, lb_task, LoadBalancerSync};

use std::sync::Arc;

use chrono::{DateTime, Utc};
use k8s_openapi::api::core::v1::{Node, Pod};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::config::StewardConfig;
use crate::gateway::Gateway;
use crate::marker::MarkerStore;
use crate::node::{is_dead, is_ready, node_name, ready_counts, ReadyCounts};
use crate::purge::Purger;
use crate::storage::ReplicationController;
use crate::suspension::{Subsystem, Suspensions};
use crate::task::TaskRunner;
use crate::Error;

/// Extra time past a pod's grace period before it counts as stuck
const STUCK_POD_SLACK_SECS: i64 = 30;

/// Whether a terminating pod has outlived its grace period
pub fn is_stuck_terminating(pod: &Pod, now: DateTime<Utc>) -> bool {
    let Some(deleted) = pod.metadata.deletion_timestamp.as_ref() else {
        return false;
    };
    let grace = pod
        .metadata
        .deletion_grace_period_seconds
        .unwrap_or(0)
        .saturating_add(STUCK_POD_SLACK_SECS);
    chrono::Duration::try_seconds(grace)
        .and_then(|wait| deleted.0.checked_add_signed(wait))
        .is_some_and(|deadline| deadline < now)
}

/// Per-tick control loop
///
/// Use [`ReconcilerBuilder`] to construct instances:
///
/// ```ignore
/// let reconciler = Reconciler::builder(gateway, config)
///     .suspensions(suspensions.clone())
///     .authority(Arc::new(RegistryCertificate::new(client)))
///     .build();
/// ```
pub struct Reconciler {
    gateway: Gateway,
    config: StewardConfig,
    purger: Purger,
    replication: ReplicationController,
    certs: CertRotation,
    lb: LoadBalancerSync,
    csrs: CsrApprover,
    suspensions: Arc<Suspensions>,
    lock: Mutex<()>,
}

impl Reconciler {
    /// Create a builder for constructing a Reconciler
    pub fn builder(gateway: Gateway, config: StewardConfig) -> ReconcilerBuilder {
        ReconcilerBuilder::new(gateway, config)
    }

    /// Suspension registry consulted by every sub-flow
    pub fn suspensions(&self) -> &Arc<Suspensions> {
        &self.suspensions
    }

    fn enabled(&self, subsystem: Subsystem, configured: bool) -> bool {
        if !configured {
            return false;
        }
        if self.suspensions.is_suspended(subsystem) {
            debug!(%subsystem, "sub-flow suspended, skipping");
            return false;
        }
        true
    }

    /// Run one tick over a node snapshot.
    ///
    /// Counts used by the purge guard are computed once from `nodes` and not
    /// refreshed after a purge in the same tick.
    #[instrument(skip(self, cancel, nodes), fields(nodes = nodes.len()))]
    pub async fn reconcile(
        &self,
        cancel: &CancellationToken,
        nodes: &[Node],
        full: bool,
    ) -> Result<(), Error> {
        let _guard = self.lock.lock().await;
        let now = Utc::now();
        let counts = ready_counts(nodes);
        debug!(
            masters = counts.masters,
            workers = counts.workers,
            "ready node counts"
        );

        let mut errors = Vec::new();

        for node in nodes {
            if let Err(e) = self.reconcile_node(node, counts, now).await {
                errors.push(e);
            }
        }

        if self.enabled(Subsystem::Storage, self.config.maintain_storage) {
            if let Err(e) = self.reconcile_storage(nodes, counts, full).await {
                errors.push(e);
            }
        }

        if full && self.enabled(Subsystem::CertRotation, self.config.rotate_certs) {
            if cancel.is_cancelled() {
                return Err(Error::Cancelled);
            }
            if let Err(e) = self.certs.run(cancel, nodes).await {
                errors.push(e);
            }
        }

        if self.enabled(
            Subsystem::InternalLoadBalancer,
            self.config.internal_load_balancer,
        ) {
            if cancel.is_cancelled() {
                return Err(Error::Cancelled);
            }
            if let Err(e) = self.lb.run(cancel, nodes).await {
                errors.push(e);
            }
        }

        if self.enabled(Subsystem::CsrApproval, self.config.approve_kubelet_csrs) {
            if let Err(e) = self.csrs.approve_pending().await {
                errors.push(e);
            }
        }

        if errors.iter().any(Error::is_cancelled) {
            return Err(Error::Cancelled);
        }
        Error::collect(errors)
    }

    async fn reconcile_node(
        &self,
        node: &Node,
        counts: ReadyCounts,
        now: DateTime<Utc>,
    ) -> Result<(), Error> {
        if !is_dead(node, self.config.node_unreachable_toleration, now) {
            return Ok(());
        }
        let name = node_name(node);
        debug!(node = %name, "node is dead");

        let mut errors = Vec::new();

        if self.enabled(Subsystem::ClearDeadPods, self.config.clear_dead_nodes) {
            if let Err(e) = self.clear_dead_pods(name, now).await {
                errors.push(e);
            }
        }

        if self.enabled(Subsystem::Purge, self.config.purge_dead_nodes) {
            if let Err(e) = self.maybe_purge(node, counts).await {
                errors.push(e);
            }
        }

        Error::collect(errors)
    }

    /// Purge `node` unless doing so would leave fewer ready nodes of its
    /// class than configured.
    ///
    /// Returns whether the purge ran. A guard violation is logged and is not
    /// an error.
    pub async fn maybe_purge(&self, node: &Node, counts: ReadyCounts) -> Result<bool, Error> {
        let name = node_name(node);
        let (min_masters, min_workers) = (
            self.config.min_ready_master_nodes,
            self.config.min_ready_worker_nodes,
        );
        if !counts.allows_removal(node, min_masters, min_workers) {
            info!(
                node = %name,
                ready_masters = counts.masters,
                ready_workers = counts.workers,
                min_masters,
                min_workers,
                "not purging node: too few ready nodes would remain"
            );
            return Ok(false);
        }
        self.purger.purge(name).await?;
        Ok(true)
    }

    async fn clear_dead_pods(&self, node: &str, now: DateTime<Utc>) -> Result<(), Error> {
        let pods = self.gateway.pods.list_pods_on_node(node).await?;
        for pod in pods.iter().filter(|p| is_stuck_terminating(p, now)) {
            let (Some(ns), Some(name)) = (
                pod.metadata.namespace.as_deref(),
                pod.metadata.name.as_deref(),
            ) else {
                continue;
            };
            self.gateway.pods.force_delete_pod(ns, name).await?;
            info!(node, namespace = ns, pod = name, "force deleted pod stuck on dead node");
        }
        Ok(())
    }

    async fn reconcile_storage(
        &self,
        nodes: &[Node],
        counts: ReadyCounts,
        full: bool,
    ) -> Result<(), Error> {
        let ready: Vec<String> = nodes
            .iter()
            .filter(|n| is_ready(n))
            .map(|n| node_name(n).to_string())
            .collect();

        let mut errors = Vec::new();
        if let Err(e) = self.replication.ensure_storage_nodes(&ready).await {
            warn!(error = %e, "failed to update storage nodes");
            errors.push(e);
        }
        if let Err(e) = self
            .replication
            .adjust(
                counts.total(),
                self.config.min_ceph_pool_replication,
                self.config.max_ceph_pool_replication,
                full,
            )
            .await
        {
            errors.push(e);
        }
        Error::collect(errors)
    }
}

/// Builder for constructing [`Reconciler`] instances
pub struct ReconcilerBuilder {
    gateway: Gateway,
    config: StewardConfig,
    suspensions: Option<Arc<Suspensions>>,
    authorities: Vec<Arc<dyn CertificateAuthority>>,
}

impl ReconcilerBuilder {
    fn new(gateway: Gateway, config: StewardConfig) -> Self {
        Self {
            gateway,
            config,
            suspensions: None,
            authorities: Vec::new(),
        }
    }

    /// Share a suspension registry with other components
    pub fn suspensions(mut self, suspensions: Arc<Suspensions>) -> Self {
        self.suspensions = Some(suspensions);
        self
    }

    /// Register a certificate rotated on full reconciles
    pub fn authority(mut self, authority: Arc<dyn CertificateAuthority>) -> Self {
        self.authorities.push(authority);
        self
    }

    /// Build the Reconciler
    pub fn build(self) -> Reconciler {
        let config = self.config;
        let gateway = self.gateway;

        let markers = MarkerStore::new(gateway.records.clone(), config.namespace.clone());
        let tasks = TaskRunner::new(gateway.pods.clone(), &config);

        Reconciler {
            purger: Purger::new(gateway.clone(), &config),
            replication: ReplicationController::new(gateway.storage.clone(), &config),
            certs: CertRotation::new(
                markers.clone(),
                tasks.clone(),
                self.authorities,
                config.rotate_certs_check_interval,
                config.rotate_certs_ttl,
            ),
            lb: LoadBalancerSync::new(markers, tasks),
            csrs: CsrApprover::new(gateway.csrs.clone()),
            suspensions: self.suspensions.unwrap_or_default(),
            lock: Mutex::new(()),
            gateway,
            config,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::testing::MockGateway;
    use crate::gateway::CsrApi;
    use crate::node::fixtures::{node, with_taint};
    use crate::node::TAINT_UNREACHABLE;
    use async_trait::async_trait;
    use k8s_openapi::api::certificates::v1::CertificateSigningRequest;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, Time};
    use mockall::predicate::eq;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    fn dead(name: &str, master: bool) -> Node {
        let added = Utc::now() - chrono::Duration::hours(2);
        with_taint(node(name, master), TAINT_UNREACHABLE, Some(added))
    }

    fn purge_config() -> StewardConfig {
        StewardConfig {
            purge_dead_nodes: true,
            rotate_certs: false,
            ..Default::default()
        }
    }

    fn terminating(name: &str, deleted_secs_ago: i64, grace: i64) -> Pod {
        Pod {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                namespace: Some("default".to_string()),
                deletion_timestamp: Some(Time(
                    Utc::now() - chrono::Duration::seconds(deleted_secs_ago),
                )),
                deletion_grace_period_seconds: Some(grace),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    #[test]
    fn test_stuck_terminating() {
        let now = Utc::now();
        assert!(is_stuck_terminating(&terminating("a", 120, 30), now));
        assert!(!is_stuck_terminating(&terminating("b", 40, 30), now));
        assert!(!is_stuck_terminating(&Pod::default(), now));
    }

    #[test]
    fn test_huge_grace_period_never_stuck() {
        let now = Utc::now();
        assert!(!is_stuck_terminating(&terminating("a", 120, i64::MAX), now));
        assert!(!is_stuck_terminating(&terminating("b", 120, i64::MAX - 10), now));
    }

    /// Story: a ready master with only the minimum number of ready masters
    ///
    /// Removing it would leave the control plane below quorum policy, so the
    /// purge is skipped and nothing is touched.
    #[tokio::test]
    async fn story_purge_guard_protects_last_masters() {
        let mut gw = MockGateway::new();
        gw.nodes.expect_get_node().never();
        gw.nodes.expect_delete_node().never();

        let reconciler = Reconciler::builder(gw.build(), purge_config()).build();
        let counts = ReadyCounts {
            masters: 2,
            workers: 3,
        };

        let purged = reconciler
            .maybe_purge(&node("m1", true), counts)
            .await
            .unwrap();
        assert!(!purged);
    }

    #[tokio::test]
    async fn test_dead_master_skipped_below_minimum() {
        let mut gw = MockGateway::new();
        gw.nodes.expect_get_node().never();
        gw.nodes.expect_delete_node().never();

        let reconciler = Reconciler::builder(gw.build(), purge_config()).build();
        // one ready master left, minimum is two
        let nodes = vec![dead("m1", true), node("m2", true), node("w1", false)];
        reconciler
            .reconcile(&CancellationToken::new(), &nodes, false)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_dead_worker_is_purged() {
        let mut gw = MockGateway::new();
        gw.nodes
            .expect_get_node()
            .with(eq("w9"))
            .times(1)
            .returning(|_| Ok(Some(dead("w9", false))));
        gw.deployments
            .expect_list_deployments()
            .returning(|| Ok(vec![]));
        gw.nodes
            .expect_delete_node()
            .with(eq("w9"))
            .times(1)
            .returning(|_| Ok(()));

        let reconciler = Reconciler::builder(gw.build(), purge_config()).build();
        let nodes = vec![
            node("m1", true),
            node("m2", true),
            node("w1", false),
            dead("w9", false),
        ];
        reconciler
            .reconcile(&CancellationToken::new(), &nodes, false)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_recently_unreachable_node_is_left_alone() {
        let mut gw = MockGateway::new();
        gw.nodes.expect_get_node().never();

        let reconciler = Reconciler::builder(gw.build(), purge_config()).build();
        let fresh = with_taint(
            node("w9", false),
            TAINT_UNREACHABLE,
            Some(Utc::now() - chrono::Duration::minutes(5)),
        );
        reconciler
            .reconcile(
                &CancellationToken::new(),
                &[node("m1", true), node("m2", true), fresh],
                false,
            )
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_suspended_purge_is_skipped() {
        let mut gw = MockGateway::new();
        gw.nodes.expect_get_node().never();

        let suspensions = Arc::new(Suspensions::new());
        suspensions.suspend(Subsystem::Purge);
        let reconciler = Reconciler::builder(gw.build(), purge_config())
            .suspensions(suspensions)
            .build();

        let nodes = vec![node("m1", true), node("m2", true), dead("w9", false)];
        reconciler
            .reconcile(&CancellationToken::new(), &nodes, false)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_stuck_pods_on_dead_node_are_force_deleted() {
        let mut gw = MockGateway::new();
        gw.pods
            .expect_list_pods_on_node()
            .with(eq("w9"))
            .returning(|_| Ok(vec![terminating("stuck", 600, 30), terminating("fresh", 5, 30)]));
        gw.pods
            .expect_force_delete_pod()
            .with(eq("default"), eq("stuck"))
            .times(1)
            .returning(|_, _| Ok(()));

        let config = StewardConfig {
            clear_dead_nodes: true,
            rotate_certs: false,
            ..Default::default()
        };
        let reconciler = Reconciler::builder(gw.build(), config).build();
        reconciler
            .reconcile(&CancellationToken::new(), &[dead("w9", false)], false)
            .await
            .unwrap();
    }

    /// Story: storage and CSR approval both fail in one tick
    ///
    /// Neither failure hides the other; the tick reports both.
    #[tokio::test]
    async fn story_sub_flow_errors_are_aggregated() {
        let mut gw = MockGateway::new();
        gw.storage
            .expect_storage_nodes()
            .returning(|| Err(Error::storage("cluster unreachable")));
        gw.storage.expect_replication_size().returning(|_| Ok(None));
        gw.csrs
            .expect_list_csrs()
            .returning(|| Err(Error::not_found("CertificateSigningRequest", "list")));

        let config = StewardConfig {
            maintain_storage: true,
            approve_kubelet_csrs: true,
            rotate_certs: false,
            ..Default::default()
        };
        let reconciler = Reconciler::builder(gw.build(), config).build();

        let err = reconciler
            .reconcile(&CancellationToken::new(), &[node("m1", true)], false)
            .await
            .unwrap_err();
        match err {
            Error::Aggregate(errors) => assert_eq!(errors.len(), 2),
            other => panic!("Expected Aggregate, got {other}"),
        }
    }

    #[tokio::test]
    async fn test_cert_rotation_only_on_full_ticks() {
        let mut gw = MockGateway::new();
        gw.records.expect_get_config_map().never();

        let config = StewardConfig {
            rotate_certs: true,
            ..Default::default()
        };
        let reconciler = Reconciler::builder(gw.build(), config).build();
        reconciler
            .reconcile(&CancellationToken::new(), &[node("m1", true)], false)
            .await
            .unwrap();
    }

    /// CSR gateway that records how many calls overlap
    #[derive(Default)]
    struct SlowCsrs {
        active: AtomicU32,
        peak: AtomicU32,
    }

    #[async_trait]
    impl CsrApi for SlowCsrs {
        async fn list_csrs(&self) -> Result<Vec<CertificateSigningRequest>, Error> {
            let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(20)).await;
            self.active.fetch_sub(1, Ordering::SeqCst);
            Ok(vec![])
        }

        async fn approve_csr(&self, _: &str, _: &str, _: &str) -> Result<(), Error> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_ticks_never_overlap() {
        let csrs = Arc::new(SlowCsrs::default());
        let mut gateway = MockGateway::new().build();
        gateway.csrs = csrs.clone() as Arc<dyn CsrApi>;

        let config = StewardConfig {
            approve_kubelet_csrs: true,
            rotate_certs: false,
            ..Default::default()
        };
        let reconciler = Reconciler::builder(gateway, config).build();
        let cancel = CancellationToken::new();
        let nodes = [node("m1", true)];

        let (a, b) = tokio::join!(
            reconciler.reconcile(&cancel, &nodes, false),
            reconciler.reconcile(&cancel, &nodes, true),
        );
        a.unwrap();
        b.unwrap();
        assert_eq!(csrs.peak.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_nothing_enabled_touches_nothing() {
        let gw = MockGateway::new();
        let config = StewardConfig {
            rotate_certs: false,
            ..Default::default()
        };
        let reconciler = Reconciler::builder(gw.build(), config).build();
        reconciler
            .reconcile(
                &CancellationToken::new(),
                &[node("m1", true), dead("w1", false)],
                true,
            )
            .await
            .unwrap();
    }
}
