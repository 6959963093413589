//! Node classification
//!
//! Pure functions over a node's taints and role labels. Downstream safety
//! checks (purge minimums, replication factor) depend on these matching taint
//! keys exactly, so there is no prefix or substring matching anywhere here.

use std::time::Duration;

use chrono::{DateTime, Utc};
use k8s_openapi::api::core::v1::Node;

use crate::{CONTROL_PLANE_LABEL, LEGACY_MASTER_LABEL};

/// Taint set by the node lifecycle controller when the kubelet stops reporting
pub const TAINT_UNREACHABLE: &str = "node.kubernetes.io/unreachable";

/// Taint keys that mark a node as not ready, regardless of value or effect
pub const NOT_READY_TAINTS: [&str; 4] = [
    "node.kubernetes.io/not-ready",
    TAINT_UNREACHABLE,
    "node.kubernetes.io/network-unavailable",
    "node.kubernetes.io/unschedulable",
];

/// Ready node counts partitioned by role
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ReadyCounts {
    /// Ready control-plane nodes
    pub masters: u32,
    /// Ready worker nodes
    pub workers: u32,
}

impl ReadyCounts {
    /// Total ready nodes
    pub fn total(&self) -> u32 {
        self.masters + self.workers
    }

    /// Whether removing `node` keeps both classes at or above their minimums.
    ///
    /// Evaluated against this snapshot only. A node that is not ready does not
    /// count toward either class, so removing it never lowers the counts.
    pub fn allows_removal(&self, node: &Node, min_masters: u32, min_workers: u32) -> bool {
        let (mut masters, mut workers) = (self.masters, self.workers);
        if is_ready(node) {
            if is_master(node) {
                masters = masters.saturating_sub(1);
            } else {
                workers = workers.saturating_sub(1);
            }
        }
        if is_master(node) {
            masters >= min_masters
        } else {
            workers >= min_workers
        }
    }
}

/// Name of the node, or an empty string for nameless objects
pub fn node_name(node: &Node) -> &str {
    node.metadata.name.as_deref().unwrap_or_default()
}

fn taint_keys(node: &Node) -> impl Iterator<Item = &str> {
    node.spec
        .as_ref()
        .and_then(|s| s.taints.as_ref())
        .into_iter()
        .flatten()
        .map(|t| t.key.as_str())
}

/// Whether the node carries none of the not-ready taints
pub fn is_ready(node: &Node) -> bool {
    !taint_keys(node).any(|key| NOT_READY_TAINTS.contains(&key))
}

/// Whether the node carries a control-plane role label (value ignored)
pub fn is_master(node: &Node) -> bool {
    node.metadata
        .labels
        .as_ref()
        .map(|l| l.contains_key(CONTROL_PLANE_LABEL) || l.contains_key(LEGACY_MASTER_LABEL))
        .unwrap_or(false)
}

/// Count ready nodes by role
pub fn ready_counts(nodes: &[Node]) -> ReadyCounts {
    nodes
        .iter()
        .filter(|n| is_ready(n))
        .fold(ReadyCounts::default(), |mut counts, n| {
            if is_master(n) {
                counts.masters += 1;
            } else {
                counts.workers += 1;
            }
            counts
        })
}

/// Whether the node has been unreachable for strictly longer than `toleration`.
///
/// A taint without an added time (or with the zero time) never counts. At
/// exactly `toleration` the node is not yet dead.
pub fn is_dead(node: &Node, toleration: Duration, now: DateTime<Utc>) -> bool {
    let Ok(toleration) = chrono::Duration::from_std(toleration) else {
        return false;
    };
    node.spec
        .as_ref()
        .and_then(|s| s.taints.as_ref())
        .into_iter()
        .flatten()
        .filter(|t| t.key == TAINT_UNREACHABLE)
        .filter_map(|t| t.time_added.as_ref())
        .map(|added| added.0)
        .filter(|added| added.timestamp() > 0)
        .any(|added| now - added > toleration)
}

/// First InternalIP address reported for the node
pub fn internal_ip(node: &Node) -> Option<&str> {
    node.status
        .as_ref()
        .and_then(|s| s.addresses.as_ref())
        .and_then(|addrs| addrs.iter().find(|a| a.type_ == "InternalIP"))
        .map(|a| a.address.as_str())
}

#[cfg(test)]
pub(crate) mod fixtures {
    //! Node builders shared by tests across the crate

    use std::collections::BTreeMap;

    use chrono::{DateTime, Utc};
    use k8s_openapi::api::core::v1::{Node, NodeAddress, NodeSpec, NodeStatus, Taint};
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, Time};

    use crate::CONTROL_PLANE_LABEL;

    pub fn node(name: &str, master: bool) -> Node {
        let mut labels = BTreeMap::new();
        labels.insert("kubernetes.io/hostname".to_string(), name.to_string());
        if master {
            labels.insert(CONTROL_PLANE_LABEL.to_string(), String::new());
        }
        Node {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                labels: Some(labels),
                ..Default::default()
            },
            spec: Some(NodeSpec::default()),
            status: None,
        }
    }

    pub fn with_ip(mut node: Node, ip: &str) -> Node {
        node.status = Some(NodeStatus {
            addresses: Some(vec![
                NodeAddress {
                    type_: "Hostname".to_string(),
                    address: node.metadata.name.clone().unwrap_or_default(),
                },
                NodeAddress {
                    type_: "InternalIP".to_string(),
                    address: ip.to_string(),
                },
            ]),
            ..Default::default()
        });
        node
    }

    pub fn with_taint(mut node: Node, key: &str, added: Option<DateTime<Utc>>) -> Node {
        let spec = node.spec.get_or_insert_with(Default::default);
        spec.taints.get_or_insert_with(Vec::new).push(Taint {
            key: key.to_string(),
            effect: "NoExecute".to_string(),
            time_added: added.map(Time),
            value: None,
        });
        node
    }
}
