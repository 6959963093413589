//! Control-plane gateway
//!
//! Every read and write steward makes goes through the traits in this module.
//! They are deliberately narrow: each method is one API call (or one exec into
//! a well-known pod), so the orchestration code above them stays testable with
//! mocks and the ordering of remote calls is observable.
//!
//! Production implementations backed by a kube client live in [`kube_impl`].

pub mod kube_impl;

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::certificates::v1::CertificateSigningRequest;
use k8s_openapi::api::core::v1::{ConfigMap, Node, Pod};
use serde::Deserialize;

#[cfg(test)]
use mockall::automock;

use crate::config::StewardConfig;
use crate::Error;

/// Node record access
#[cfg_attr(test, automock)]
#[async_trait]
pub trait NodeApi: Send + Sync {
    /// List every node in the cluster
    async fn list_nodes(&self) -> Result<Vec<Node>, Error>;

    /// Get a node by name, `None` if it does not exist
    async fn get_node(&self, name: &str) -> Result<Option<Node>, Error>;

    /// Delete a node record. Deleting a missing node succeeds.
    async fn delete_node(&self, name: &str) -> Result<(), Error>;
}

/// Small key-value records (ConfigMaps)
#[cfg_attr(test, automock)]
#[async_trait]
pub trait RecordApi: Send + Sync {
    /// Get a ConfigMap, `None` if it does not exist
    async fn get_config_map(&self, namespace: &str, name: &str)
        -> Result<Option<ConfigMap>, Error>;

    /// Create a ConfigMap
    async fn create_config_map(&self, namespace: &str, cm: &ConfigMap) -> Result<(), Error>;

    /// Replace an existing ConfigMap. The resource version on `cm` is honored.
    async fn replace_config_map(&self, namespace: &str, cm: &ConfigMap) -> Result<(), Error>;
}

/// Pod operations used by host tasks and dead node cleanup
#[cfg_attr(test, automock)]
#[async_trait]
pub trait PodApi: Send + Sync {
    /// Create a pod and return it as stored (with its generated name)
    async fn create_pod(&self, namespace: &str, pod: &Pod) -> Result<Pod, Error>;

    /// Get a pod, `None` if it does not exist
    async fn get_pod(&self, namespace: &str, name: &str) -> Result<Option<Pod>, Error>;

    /// Delete every pod matching a label selector
    async fn delete_pods(&self, namespace: &str, label_selector: &str) -> Result<(), Error>;

    /// Fetch the full log of a pod's only container
    async fn pod_logs(&self, namespace: &str, name: &str) -> Result<String, Error>;

    /// List pods in all namespaces scheduled to a node
    async fn list_pods_on_node(&self, node: &str) -> Result<Vec<Pod>, Error>;

    /// Delete a pod immediately (grace period zero)
    async fn force_delete_pod(&self, namespace: &str, name: &str) -> Result<(), Error>;
}

/// Deployment operations
#[cfg_attr(test, automock)]
#[async_trait]
pub trait DeploymentApi: Send + Sync {
    /// List deployments in all namespaces
    async fn list_deployments(&self) -> Result<Vec<Deployment>, Error>;

    /// Replace the pod template node selector of a deployment
    async fn replace_node_selector(
        &self,
        namespace: &str,
        name: &str,
        selector: BTreeMap<String, String>,
    ) -> Result<(), Error>;
}

/// Rook resource kinds that carry a replicated size
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum StorageKind {
    /// CephBlockPool
    BlockPool,
    /// CephFilesystem
    Filesystem,
    /// CephObjectStore
    ObjectStore,
}

impl StorageKind {
    /// Kubernetes kind name
    pub fn kind(&self) -> &'static str {
        match self {
            StorageKind::BlockPool => "CephBlockPool",
            StorageKind::Filesystem => "CephFilesystem",
            StorageKind::ObjectStore => "CephObjectStore",
        }
    }

    /// Plural resource name
    pub fn plural(&self) -> &'static str {
        match self {
            StorageKind::BlockPool => "cephblockpools",
            StorageKind::Filesystem => "cephfilesystems",
            StorageKind::ObjectStore => "cephobjectstores",
        }
    }
}

/// One replicated size field on one Rook resource
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ReplicatedField {
    /// Resource kind
    pub kind: StorageKind,
    /// Resource name in the Rook namespace
    pub name: String,
    /// JSON pointer to the size field (e.g. `/spec/replicated/size`)
    pub size_pointer: String,
}

/// An OSD deployment scheduled to a node
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct OsdDeployment {
    /// Deployment name
    pub name: String,
    /// Value of the `ceph-osd-id` label, if set
    pub osd_id: Option<String>,
}

/// Rook/Ceph storage administration
#[cfg_attr(test, automock)]
#[async_trait]
pub trait StorageApi: Send + Sync {
    /// Node names listed in the CephCluster storage spec.
    ///
    /// `None` when the cluster does not exist or uses all nodes.
    async fn storage_nodes(&self) -> Result<Option<Vec<String>>, Error>;

    /// Rewrite the CephCluster storage node list, keeping per-node settings
    /// of entries that remain
    async fn set_storage_nodes(&self, names: Vec<String>) -> Result<(), Error>;

    /// OSD deployments scheduled to a node
    async fn osd_deployments_on_node(&self, node: &str) -> Result<Vec<OsdDeployment>, Error>;

    /// Delete a deployment in the Rook namespace. Missing deployments succeed.
    async fn delete_deployment(&self, name: &str) -> Result<(), Error>;

    /// Current replicated size, `None` if the resource or its size field does not exist
    async fn replication_size(&self, field: &ReplicatedField) -> Result<Option<u32>, Error>;

    /// Update the declared replicated size
    async fn set_replication_size(&self, field: &ReplicatedField, size: u32)
        -> Result<(), Error>;

    /// Run a command in the Ceph tools pod and return its stdout.
    ///
    /// Non-zero exit is an [`Error::Storage`] carrying stderr.
    async fn tools_exec(&self, args: Vec<String>) -> Result<String, Error>;
}

/// One etcd cluster member as reported by `member list`
#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
pub struct EtcdMember {
    /// Member ID
    #[serde(rename = "ID")]
    pub id: u64,
    /// Member name (empty for unstarted members)
    #[serde(default)]
    pub name: String,
    /// Peer URLs
    #[serde(rename = "peerURLs", default)]
    pub peer_urls: Vec<String>,
    /// Client URLs
    #[serde(rename = "clientURLs", default)]
    pub client_urls: Vec<String>,
}

/// etcd membership
#[cfg_attr(test, automock)]
#[async_trait]
pub trait EtcdApi: Send + Sync {
    /// List members through the given client endpoints
    async fn list_members(&self, endpoints: &[String]) -> Result<Vec<EtcdMember>, Error>;

    /// Remove a member through the given client endpoints
    async fn remove_member(&self, endpoints: &[String], id: u64) -> Result<(), Error>;
}

/// Certificate signing requests
#[cfg_attr(test, automock)]
#[async_trait]
pub trait CsrApi: Send + Sync {
    /// List all CSRs
    async fn list_csrs(&self) -> Result<Vec<CertificateSigningRequest>, Error>;

    /// Approve a CSR
    async fn approve_csr(&self, name: &str, reason: &str, message: &str) -> Result<(), Error>;
}

/// Bundle of gateway seams shared by every component
#[derive(Clone)]
pub struct Gateway {
    /// Node records
    pub nodes: Arc<dyn NodeApi>,
    /// ConfigMap records
    pub records: Arc<dyn RecordApi>,
    /// Pods
    pub pods: Arc<dyn PodApi>,
    /// Deployments
    pub deployments: Arc<dyn DeploymentApi>,
    /// Rook/Ceph storage
    pub storage: Arc<dyn StorageApi>,
    /// etcd membership
    pub etcd: Arc<dyn EtcdApi>,
    /// Certificate signing requests
    pub csrs: Arc<dyn CsrApi>,
}

impl Gateway {
    /// Build a gateway backed by the Kubernetes API
    pub fn from_client(client: kube::Client, config: &StewardConfig) -> Self {
        use self::kube_impl::{
            KubeCsrs, KubeDeployments, KubeEtcd, KubeNodes, KubePods, KubeRecords, KubeStorage,
        };

        Self {
            nodes: Arc::new(KubeNodes::new(client.clone())),
            records: Arc::new(KubeRecords::new(client.clone())),
            pods: Arc::new(KubePods::new(client.clone())),
            deployments: Arc::new(KubeDeployments::new(client.clone())),
            storage: Arc::new(KubeStorage::new(client.clone(), config.rook.clone())),
            etcd: Arc::new(KubeEtcd::new(client.clone())),
            csrs: Arc::new(KubeCsrs::new(client)),
        }
    }
}

#[cfg(test)]
pub(crate) mod testing {
    //! Test doubles: a gateway assembled from mocks, and an in-memory record store

    use std::collections::HashMap;

    use parking_lot::Mutex;

    use super::*;

    /// ConfigMaps kept in memory, keyed by (namespace, name)
    #[derive(Default)]
    pub struct InMemoryRecords {
        pub maps: Mutex<HashMap<(String, String), ConfigMap>>,
        pub writes: Mutex<u32>,
    }

    impl InMemoryRecords {
        pub fn value(&self, namespace: &str, name: &str, key: &str) -> Option<String> {
            self.maps
                .lock()
                .get(&(namespace.to_string(), name.to_string()))
                .and_then(|cm| cm.data.as_ref())
                .and_then(|d| d.get(key).cloned())
        }

        pub fn insert(&self, namespace: &str, cm: ConfigMap) {
            let name = cm.metadata.name.clone().unwrap_or_default();
            self.maps.lock().insert((namespace.to_string(), name), cm);
        }

        pub fn write_count(&self) -> u32 {
            *self.writes.lock()
        }
    }

    #[async_trait]
    impl RecordApi for InMemoryRecords {
        async fn get_config_map(
            &self,
            namespace: &str,
            name: &str,
        ) -> Result<Option<ConfigMap>, Error> {
            Ok(self
                .maps
                .lock()
                .get(&(namespace.to_string(), name.to_string()))
                .cloned())
        }

        async fn create_config_map(&self, namespace: &str, cm: &ConfigMap) -> Result<(), Error> {
            let name = cm.metadata.name.clone().unwrap_or_default();
            let mut maps = self.maps.lock();
            let key = (namespace.to_string(), name.clone());
            if maps.contains_key(&key) {
                return Err(Error::storage(format!("configmap {} already exists", name)));
            }
            maps.insert(key, cm.clone());
            *self.writes.lock() += 1;
            Ok(())
        }

        async fn replace_config_map(&self, namespace: &str, cm: &ConfigMap) -> Result<(), Error> {
            let name = cm.metadata.name.clone().unwrap_or_default();
            let mut maps = self.maps.lock();
            let key = (namespace.to_string(), name.clone());
            if !maps.contains_key(&key) {
                return Err(Error::not_found("ConfigMap", name));
            }
            maps.insert(key, cm.clone());
            *self.writes.lock() += 1;
            Ok(())
        }
    }

    pub struct MockGateway {
        pub nodes: MockNodeApi,
        pub records: MockRecordApi,
        pub pods: MockPodApi,
        pub deployments: MockDeploymentApi,
        pub storage: MockStorageApi,
        pub etcd: MockEtcdApi,
        pub csrs: MockCsrApi,
    }

    impl MockGateway {
        pub fn new() -> Self {
            Self {
                nodes: MockNodeApi::new(),
                records: MockRecordApi::new(),
                pods: MockPodApi::new(),
                deployments: MockDeploymentApi::new(),
                storage: MockStorageApi::new(),
                etcd: MockEtcdApi::new(),
                csrs: MockCsrApi::new(),
            }
        }

        pub fn build(self) -> Gateway {
            Gateway {
                nodes: Arc::new(self.nodes),
                records: Arc::new(self.records),
                pods: Arc::new(self.pods),
                deployments: Arc::new(self.deployments),
                storage: Arc::new(self.storage),
                etcd: Arc::new(self.etcd),
                csrs: Arc::new(self.csrs),
            }
        }
    }
}
