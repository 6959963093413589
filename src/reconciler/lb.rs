//! Internal load balancer sync
//!
//! Every node runs a local HAProxy in front of the API servers and points its
//! kubeconfigs at it. When the set of nodes, their roles, their readiness or
//! their addresses change, each ready node regenerates that config through a
//! host task. Readiness is part of the fingerprint so a node skipped while
//! unready is picked up again once it recovers.

use k8s_openapi::api::core::v1::Node;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument};

use crate::marker::{fingerprint, MarkerStore, UPDATE_INTERNAL_LB};
use crate::node::{internal_ip, is_master, is_ready, node_name};
use crate::task::{BatchMode, HostTask, TaskRunner};
use crate::Error;

/// Fingerprint of the facts the load balancer config and its rollout depend on
pub fn lb_fingerprint(nodes: &[Node]) -> String {
    fingerprint(nodes.iter().map(|n| {
        format!(
            "{},{},{},{}",
            node_name(n),
            is_master(n),
            is_ready(n),
            internal_ip(n).unwrap_or_default()
        )
    }))
}

/// Host task regenerating the load balancer config for `masters`
pub fn lb_task(masters: &[String]) -> HostTask {
    HostTask::new(
        UPDATE_INTERNAL_LB,
        [
            "update-internal-lb".to_string(),
            "--backends".to_string(),
            masters.join(","),
        ],
    )
    .mount("/etc/haproxy")
    .mount("/etc/kubernetes")
}

/// Targets in rollout order: ready masters by name, then ready workers by name
fn rollout_order(nodes: &[Node]) -> Vec<String> {
    let mut ready: Vec<&Node> = nodes.iter().filter(|n| is_ready(n)).collect();
    ready.sort_by(|a, b| {
        is_master(b)
            .cmp(&is_master(a))
            .then_with(|| node_name(a).cmp(node_name(b)))
    });
    ready.into_iter().map(|n| node_name(n).to_string()).collect()
}

/// Runs the load balancer host task when the node set changes
#[derive(Clone)]
pub struct LoadBalancerSync {
    markers: MarkerStore,
    tasks: TaskRunner,
}

impl LoadBalancerSync {
    /// Create a sync flow
    pub fn new(markers: MarkerStore, tasks: TaskRunner) -> Self {
        Self { markers, tasks }
    }

    /// Update every node if the fingerprint changed; true if it ran
    #[instrument(skip(self, cancel, nodes))]
    pub async fn run(&self, cancel: &CancellationToken, nodes: &[Node]) -> Result<bool, Error> {
        let current = lb_fingerprint(nodes);

        let mut masters: Vec<String> = nodes
            .iter()
            .filter(|n| is_master(n))
            .filter_map(internal_ip)
            .map(str::to_string)
            .collect();
        masters.sort();
        let task = lb_task(&masters);
        let targets = rollout_order(nodes);

        let changed = self
            .markers
            .has_changed(UPDATE_INTERNAL_LB, &current, || async {
                info!(nodes = targets.len(), backends = masters.len(), "updating internal load balancer");
                self.tasks
                    .run_on_nodes(cancel, &targets, &task, BatchMode::ContinueOnError)
                    .await
            })
            .await?;

        if !changed {
            debug!("internal load balancer up to date");
        }
        Ok(changed)
    }
}
