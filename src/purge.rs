//! Node purge protocol
//!
//! Removing a departed node means unwinding every place the cluster still
//! remembers it, in a fixed order:
//!
//! 1. resolve the node record (a missing record is fine, it may already be gone)
//! 2. storage: drop it from the Ceph node list, delete and purge its OSDs
//! 3. kubeadm: drop its API endpoint from `ClusterStatus`
//! 4. etcd: remove the member whose peer URL points at its address
//! 5. workloads: re-pin deployments that selected it by hostname
//! 6. delete the node record
//!
//! Any unrecoverable error stops the purge where it is. Nothing is rolled back;
//! every step is idempotent, so the next tick simply retries from the top.

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::{ConfigMap, Node};
use serde_yaml::Value;
use tracing::{debug, info, instrument, warn};

use crate::config::StewardConfig;
use crate::error::PurgeStep;
use crate::gateway::kube_impl::url_host;
use crate::gateway::Gateway;
use crate::node::{internal_ip, is_master};
use crate::{Error, CONTROL_PLANE_LABEL, HOSTNAME_LABEL, KUBE_SYSTEM_NAMESPACE};

const KUBEADM_CONFIG: &str = "kubeadm-config";
const CLUSTER_STATUS_KEY: &str = "ClusterStatus";
const ETCD_CLIENT_PORT: u16 = 2379;

/// What is known about a node while it is being purged
#[derive(Clone, Debug, Default, PartialEq)]
pub struct PurgeTask {
    /// Node name
    pub name: String,
    /// Node record, `None` if it no longer exists
    pub node: Option<Node>,
    /// Whether the storage cleanup step applies
    pub storage: bool,
    /// Whether the node may have been a control-plane member
    pub maybe_master: bool,
    /// Address the node served the API on, once resolved
    pub address: Option<String>,
}

/// Outcome of removing one node from the kubeadm API endpoint list
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct EndpointRemoval {
    /// Advertise address of the removed entry
    pub address: Option<String>,
    /// Advertise addresses of the entries that remain
    pub remaining: Vec<String>,
    /// Rewritten `ClusterStatus` document, `None` if nothing changed
    pub updated: Option<String>,
}

/// Remove `node` from the `apiEndpoints` map of a kubeadm `ClusterStatus`
/// document
pub fn remove_api_endpoint(cluster_status: &str, node: &str) -> Result<EndpointRemoval, Error> {
    let mut doc: Value = serde_yaml::from_str(cluster_status)
        .map_err(|e| Error::serialization(format!("ClusterStatus: {}", e)))?;

    let Some(endpoints) = doc.get_mut("apiEndpoints").and_then(Value::as_mapping_mut) else {
        return Ok(EndpointRemoval::default());
    };

    let removed = endpoints.remove(&Value::String(node.to_string()));
    let address = removed
        .as_ref()
        .and_then(|e| e.get("advertiseAddress"))
        .and_then(Value::as_str)
        .map(str::to_string);
    let remaining = endpoints
        .values()
        .filter_map(|e| e.get("advertiseAddress").and_then(Value::as_str))
        .map(str::to_string)
        .collect();

    let updated = match removed {
        Some(_) => Some(
            serde_yaml::to_string(&doc)
                .map_err(|e| Error::serialization(format!("ClusterStatus: {}", e)))?,
        ),
        None => None,
    };

    Ok(EndpointRemoval {
        address,
        remaining,
        updated,
    })
}

fn etcd_endpoint(address: &str) -> String {
    if address.contains(':') {
        format!("https://[{}]:{}", address, ETCD_CLIENT_PORT)
    } else {
        format!("https://{}:{}", address, ETCD_CLIENT_PORT)
    }
}

/// Runs the purge protocol against the gateway
#[derive(Clone)]
pub struct Purger {
    gateway: Gateway,
    maintain_storage: bool,
}

impl Purger {
    /// Create a purger; storage cleanup follows `config.maintain_storage`
    pub fn new(gateway: Gateway, config: &StewardConfig) -> Self {
        Self {
            gateway,
            maintain_storage: config.maintain_storage,
        }
    }

    /// Purge a node by name
    #[instrument(skip(self))]
    pub async fn purge(&self, name: &str) -> Result<PurgeTask, Error> {
        info!("purging node");

        let node = self
            .gateway
            .nodes
            .get_node(name)
            .await
            .map_err(|e| Error::purge(name, PurgeStep::Resolve, e))?;
        if node.is_none() {
            info!("node record already gone");
        }

        let mut task = PurgeTask {
            name: name.to_string(),
            maybe_master: node.as_ref().map(is_master).unwrap_or(true),
            storage: self.maintain_storage,
            node,
            address: None,
        };

        if task.storage {
            self.purge_storage(name)
                .await
                .map_err(|e| Error::purge(name, PurgeStep::Storage, e))?;
        }

        if task.maybe_master {
            let removal = self
                .deregister_api_endpoint(name)
                .await
                .map_err(|e| Error::purge(name, PurgeStep::Registration, e))?;

            task.address = removal
                .address
                .or_else(|| task.node.as_ref().and_then(internal_ip).map(str::to_string));

            if let Some(address) = task.address.clone() {
                self.remove_etcd_member(&address, &removal.remaining)
                    .await
                    .map_err(|e| Error::purge(name, PurgeStep::Consensus, e))?;
            } else {
                warn!("no address known for node, skipping etcd member removal");
            }
        }

        self.repin_workloads(name)
            .await
            .map_err(|e| Error::purge(name, PurgeStep::Workloads, e))?;

        if task.node.is_some() {
            self.gateway
                .nodes
                .delete_node(name)
                .await
                .map_err(|e| Error::purge(name, PurgeStep::DeleteNode, e))?;
        }

        info!("node purged");
        Ok(task)
    }

    async fn purge_storage(&self, name: &str) -> Result<(), Error> {
        let storage = &self.gateway.storage;

        if let Some(nodes) = storage.storage_nodes().await? {
            if nodes.iter().any(|n| n == name) {
                let keep = nodes.into_iter().filter(|n| n != name).collect();
                storage.set_storage_nodes(keep).await?;
                info!("removed node from storage cluster");
            }
        }

        let osds = storage.osd_deployments_on_node(name).await?;
        for osd in &osds {
            storage.delete_deployment(&osd.name).await?;
            debug!(deployment = %osd.name, "deleted OSD deployment");
        }

        for id in osds.iter().filter_map(|o| o.osd_id.as_deref()) {
            let down = vec![
                "ceph".to_string(),
                "osd".to_string(),
                "down".to_string(),
                format!("osd.{}", id),
            ];
            if let Err(e) = storage.tools_exec(down).await {
                debug!(osd = %id, error = %e, "marking OSD down failed, continuing");
            }

            let purge = ["ceph", "osd", "purge", id, "--yes-i-really-mean-it"]
                .into_iter()
                .map(str::to_string)
                .collect();
            storage.tools_exec(purge).await?;
            info!(osd = %id, "purged OSD");
        }
        Ok(())
    }

    async fn deregister_api_endpoint(&self, name: &str) -> Result<EndpointRemoval, Error> {
        let records = &self.gateway.records;
        let Some(mut cm) = records
            .get_config_map(KUBE_SYSTEM_NAMESPACE, KUBEADM_CONFIG)
            .await?
        else {
            debug!("no kubeadm-config, skipping endpoint removal");
            return Ok(EndpointRemoval::default());
        };
        let Some(status) = cm.data.as_ref().and_then(|d| d.get(CLUSTER_STATUS_KEY)) else {
            return Ok(EndpointRemoval::default());
        };

        let mut removal = remove_api_endpoint(status, name)?;
        if let Some(updated) = removal.updated.take() {
            set_data(&mut cm, CLUSTER_STATUS_KEY, updated);
            records
                .replace_config_map(KUBE_SYSTEM_NAMESPACE, &cm)
                .await?;
            info!(address = ?removal.address, "removed API endpoint from kubeadm ClusterStatus");
        }
        Ok(removal)
    }

    async fn remove_etcd_member(&self, address: &str, remaining: &[String]) -> Result<(), Error> {
        let endpoints: Vec<String> = remaining
            .iter()
            .filter(|a| a.as_str() != address)
            .map(|a| etcd_endpoint(a))
            .collect();

        let members = self.gateway.etcd.list_members(&endpoints).await?;
        let member = members
            .iter()
            .find(|m| m.peer_urls.iter().any(|u| url_host(u) == Some(address)));

        match member {
            Some(member) => {
                self.gateway
                    .etcd
                    .remove_member(&endpoints, member.id)
                    .await?;
                info!(member = %member.name, id = member.id, "removed etcd member");
            }
            None => info!(address, "no etcd member with this peer address"),
        }
        Ok(())
    }

    async fn repin_workloads(&self, name: &str) -> Result<(), Error> {
        let deployments = self.gateway.deployments.list_deployments().await?;
        let pinned = deployments.iter().filter(|d| {
            d.spec
                .as_ref()
                .and_then(|s| s.template.spec.as_ref())
                .and_then(|s| s.node_selector.as_ref())
                .and_then(|s| s.get(HOSTNAME_LABEL))
                .map(|n| n == name)
                .unwrap_or(false)
        });

        for deployment in pinned {
            let (Some(ns), Some(dn)) = (
                deployment.metadata.namespace.as_deref(),
                deployment.metadata.name.as_deref(),
            ) else {
                continue;
            };
            let selector = BTreeMap::from([(CONTROL_PLANE_LABEL.to_string(), String::new())]);
            self.gateway
                .deployments
                .replace_node_selector(ns, dn, selector)
                .await?;
            info!(namespace = ns, deployment = dn, "re-pinned deployment to control plane");
        }
        Ok(())
    }
}

fn set_data(cm: &mut ConfigMap, key: &str, value: String) {
    cm.data
        .get_or_insert_with(BTreeMap::new)
        .insert(key.to_string(), value);
}
