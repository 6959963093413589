//! Gateway implementations backed by the Kubernetes API

use std::collections::{BTreeMap, BTreeSet};

use async_trait::async_trait;
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::certificates::v1::CertificateSigningRequest;
use k8s_openapi::api::core::v1::{ConfigMap, Node, Pod};
use kube::api::{
    Api, ApiResource, AttachParams, DeleteParams, DynamicObject, GroupVersionKind, ListParams,
    LogParams, Patch, PatchParams, PostParams,
};
use kube::Client;
use serde::Deserialize;
use tokio::io::{AsyncRead, AsyncReadExt};
use tracing::{debug, trace};

use super::{
    CsrApi, DeploymentApi, EtcdApi, EtcdMember, NodeApi, OsdDeployment, PodApi, RecordApi,
    ReplicatedField, StorageApi, StorageKind,
};
use crate::config::RookConfig;
use crate::storage::declared_size;
use crate::{Error, FIELD_MANAGER, HOSTNAME_LABEL, KUBE_SYSTEM_NAMESPACE};

/// Treat a 404 from a delete as success
fn ignore_not_found<T>(result: Result<T, kube::Error>) -> Result<(), Error> {
    match result {
        Ok(_) => Ok(()),
        Err(kube::Error::Api(e)) if e.code == 404 => Ok(()),
        Err(e) => Err(e.into()),
    }
}

/// Captured output of a command run inside a pod
struct ExecOutput {
    stdout: String,
    stderr: String,
    success: bool,
    message: Option<String>,
}

async fn read_stream(reader: Option<impl AsyncRead + Unpin>) -> String {
    let mut buf = String::new();
    if let Some(mut reader) = reader {
        if let Err(e) = reader.read_to_string(&mut buf).await {
            trace!(error = %e, "exec stream closed early");
        }
    }
    buf
}

/// Run a command in a pod and wait for it to exit
async fn exec_capture(
    pods: &Api<Pod>,
    pod: &str,
    container: Option<&str>,
    command: Vec<String>,
) -> Result<ExecOutput, Error> {
    let mut params = AttachParams::default().stdout(true).stderr(true);
    if let Some(container) = container {
        params = params.container(container);
    }

    let mut attached = pods.exec(pod, command, &params).await?;
    let stdout = attached.stdout();
    let stderr = attached.stderr();
    let status = attached.take_status();

    let (stdout, stderr) = tokio::join!(read_stream(stdout), read_stream(stderr));
    let status = match status {
        Some(status) => status.await,
        None => None,
    };
    attached
        .join()
        .await
        .map_err(|e| Error::exec(pod, e.to_string()))?;

    let success = status
        .as_ref()
        .and_then(|s| s.status.as_deref())
        .map(|s| s == "Success")
        .unwrap_or(false);
    let message = status.and_then(|s| s.message);

    Ok(ExecOutput {
        stdout,
        stderr,
        success,
        message,
    })
}

/// First running pod matching a label selector
async fn running_pod(pods: &Api<Pod>, label_selector: &str) -> Result<Option<Pod>, Error> {
    let list = pods.list(&ListParams::default().labels(label_selector)).await?;
    Ok(list.items.into_iter().find(|p| {
        p.metadata.deletion_timestamp.is_none()
            && p.status.as_ref().and_then(|s| s.phase.as_deref()) == Some("Running")
    }))
}

// =============================================================================
// Nodes
// =============================================================================

/// Node records via the core API
pub struct KubeNodes {
    client: Client,
}

impl KubeNodes {
    /// Create a new KubeNodes
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl NodeApi for KubeNodes {
    async fn list_nodes(&self) -> Result<Vec<Node>, Error> {
        let api: Api<Node> = Api::all(self.client.clone());
        Ok(api.list(&ListParams::default()).await?.items)
    }

    async fn get_node(&self, name: &str) -> Result<Option<Node>, Error> {
        let api: Api<Node> = Api::all(self.client.clone());
        Ok(api.get_opt(name).await?)
    }

    async fn delete_node(&self, name: &str) -> Result<(), Error> {
        let api: Api<Node> = Api::all(self.client.clone());
        ignore_not_found(api.delete(name, &DeleteParams::default()).await)
    }
}

// =============================================================================
// Records
// =============================================================================

/// ConfigMap records via the core API
pub struct KubeRecords {
    client: Client,
}

impl KubeRecords {
    /// Create a new KubeRecords
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl RecordApi for KubeRecords {
    async fn get_config_map(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<ConfigMap>, Error> {
        let api: Api<ConfigMap> = Api::namespaced(self.client.clone(), namespace);
        Ok(api.get_opt(name).await?)
    }

    async fn create_config_map(&self, namespace: &str, cm: &ConfigMap) -> Result<(), Error> {
        let api: Api<ConfigMap> = Api::namespaced(self.client.clone(), namespace);
        api.create(&PostParams::default(), cm).await?;
        Ok(())
    }

    async fn replace_config_map(&self, namespace: &str, cm: &ConfigMap) -> Result<(), Error> {
        let api: Api<ConfigMap> = Api::namespaced(self.client.clone(), namespace);
        let name = cm
            .metadata
            .name
            .as_deref()
            .ok_or_else(|| Error::serialization("ConfigMap has no name"))?;
        api.replace(name, &PostParams::default(), cm).await?;
        Ok(())
    }
}

// =============================================================================
// Pods
// =============================================================================

/// Pod operations via the core API
pub struct KubePods {
    client: Client,
}

impl KubePods {
    /// Create a new KubePods
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl PodApi for KubePods {
    async fn create_pod(&self, namespace: &str, pod: &Pod) -> Result<Pod, Error> {
        let api: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
        Ok(api.create(&PostParams::default(), pod).await?)
    }

    async fn get_pod(&self, namespace: &str, name: &str) -> Result<Option<Pod>, Error> {
        let api: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
        Ok(api.get_opt(name).await?)
    }

    async fn delete_pods(&self, namespace: &str, label_selector: &str) -> Result<(), Error> {
        let api: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
        api.delete_collection(
            &DeleteParams::background(),
            &ListParams::default().labels(label_selector),
        )
        .await?;
        Ok(())
    }

    async fn pod_logs(&self, namespace: &str, name: &str) -> Result<String, Error> {
        let api: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
        Ok(api.logs(name, &LogParams::default()).await?)
    }

    async fn list_pods_on_node(&self, node: &str) -> Result<Vec<Pod>, Error> {
        let api: Api<Pod> = Api::all(self.client.clone());
        let params = ListParams::default().fields(&format!("spec.nodeName={}", node));
        Ok(api.list(&params).await?.items)
    }

    async fn force_delete_pod(&self, namespace: &str, name: &str) -> Result<(), Error> {
        let api: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
        let params = DeleteParams {
            grace_period_seconds: Some(0),
            ..DeleteParams::default()
        };
        ignore_not_found(api.delete(name, &params).await)
    }
}

// =============================================================================
// Deployments
// =============================================================================

/// Deployment operations via the apps API
pub struct KubeDeployments {
    client: Client,
}

impl KubeDeployments {
    /// Create a new KubeDeployments
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl DeploymentApi for KubeDeployments {
    async fn list_deployments(&self) -> Result<Vec<Deployment>, Error> {
        let api: Api<Deployment> = Api::all(self.client.clone());
        Ok(api.list(&ListParams::default()).await?.items)
    }

    async fn replace_node_selector(
        &self,
        namespace: &str,
        name: &str,
        selector: BTreeMap<String, String>,
    ) -> Result<(), Error> {
        let api: Api<Deployment> = Api::namespaced(self.client.clone(), namespace);
        let mut deployment = api.get(name).await?;
        let pod_spec = deployment
            .spec
            .as_mut()
            .and_then(|s| s.template.spec.as_mut())
            .ok_or_else(|| Error::serialization(format!("deployment {} has no pod spec", name)))?;
        pod_spec.node_selector = Some(selector);
        api.replace(name, &PostParams::default(), &deployment).await?;
        Ok(())
    }
}

// =============================================================================
// Storage
// =============================================================================

const ROOK_GROUP: &str = "ceph.rook.io";
const ROOK_VERSION: &str = "v1";
const OSD_APP_SELECTOR: &str = "app=rook-ceph-osd";
const OSD_ID_LABEL: &str = "ceph-osd-id";
const OSD_HOST_LABELS: [&str; 2] = ["topology-location-host", "failure-domain"];
const TOOLS_SELECTOR: &str = "app=rook-ceph-tools";

/// Rook/Ceph administration via Rook CRDs and the tools pod
pub struct KubeStorage {
    client: Client,
    rook: RookConfig,
}

impl KubeStorage {
    /// Create a new KubeStorage
    pub fn new(client: Client, rook: RookConfig) -> Self {
        Self { client, rook }
    }

    fn rook_api(&self, kind: &str, plural: &str) -> Api<DynamicObject> {
        let gvk = GroupVersionKind::gvk(ROOK_GROUP, ROOK_VERSION, kind);
        let resource = ApiResource::from_gvk_with_plural(&gvk, plural);
        Api::namespaced_with(self.client.clone(), &self.rook.namespace, &resource)
    }

    fn cluster_api(&self) -> Api<DynamicObject> {
        self.rook_api("CephCluster", "cephclusters")
    }

    fn field_api(&self, kind: StorageKind) -> Api<DynamicObject> {
        self.rook_api(kind.kind(), kind.plural())
    }
}

/// Whether a node selector or OSD label set pins a deployment to `node`
fn osd_on_node(deployment: &Deployment, node: &str) -> bool {
    let labels = deployment.metadata.labels.as_ref();
    let labelled = OSD_HOST_LABELS.iter().any(|key| {
        labels
            .and_then(|l| l.get(*key))
            .map(|v| v == node)
            .unwrap_or(false)
    });
    let selected = deployment
        .spec
        .as_ref()
        .and_then(|s| s.template.spec.as_ref())
        .and_then(|s| s.node_selector.as_ref())
        .and_then(|s| s.get(HOSTNAME_LABEL))
        .map(|v| v == node)
        .unwrap_or(false);
    labelled || selected
}

#[async_trait]
impl StorageApi for KubeStorage {
    async fn storage_nodes(&self) -> Result<Option<Vec<String>>, Error> {
        let Some(cluster) = self.cluster_api().get_opt(&self.rook.cluster).await? else {
            return Ok(None);
        };
        let storage = &cluster.data["spec"]["storage"];
        if storage["useAllNodes"].as_bool().unwrap_or(false) {
            return Ok(None);
        }
        let names = storage["nodes"]
            .as_array()
            .into_iter()
            .flatten()
            .filter_map(|n| n["name"].as_str().map(str::to_string))
            .collect();
        Ok(Some(names))
    }

    async fn set_storage_nodes(&self, names: Vec<String>) -> Result<(), Error> {
        let api = self.cluster_api();
        let mut cluster = api.get(&self.rook.cluster).await?;

        let wanted: BTreeSet<&str> = names.iter().map(String::as_str).collect();
        let existing: Vec<serde_json::Value> = cluster.data["spec"]["storage"]["nodes"]
            .as_array()
            .cloned()
            .unwrap_or_default();
        let mut nodes: Vec<serde_json::Value> = existing
            .into_iter()
            .filter(|n| n["name"].as_str().map(|s| wanted.contains(s)).unwrap_or(false))
            .collect();
        for name in &names {
            if !nodes.iter().any(|n| n["name"].as_str() == Some(name.as_str())) {
                nodes.push(serde_json::json!({ "name": name }));
            }
        }

        let storage = cluster
            .data
            .pointer_mut("/spec/storage")
            .and_then(|s| s.as_object_mut())
            .ok_or_else(|| Error::storage("CephCluster has no spec.storage"))?;
        storage.insert("nodes".to_string(), serde_json::Value::Array(nodes));

        api.replace(&self.rook.cluster, &PostParams::default(), &cluster)
            .await?;
        Ok(())
    }

    async fn osd_deployments_on_node(&self, node: &str) -> Result<Vec<OsdDeployment>, Error> {
        let api: Api<Deployment> = Api::namespaced(self.client.clone(), &self.rook.namespace);
        let list = api
            .list(&ListParams::default().labels(OSD_APP_SELECTOR))
            .await?;
        Ok(list
            .items
            .iter()
            .filter(|d| osd_on_node(d, node))
            .map(|d| OsdDeployment {
                name: d.metadata.name.clone().unwrap_or_default(),
                osd_id: d
                    .metadata
                    .labels
                    .as_ref()
                    .and_then(|l| l.get(OSD_ID_LABEL))
                    .cloned(),
            })
            .collect())
    }

    async fn delete_deployment(&self, name: &str) -> Result<(), Error> {
        let api: Api<Deployment> = Api::namespaced(self.client.clone(), &self.rook.namespace);
        ignore_not_found(api.delete(name, &DeleteParams::default()).await)
    }

    async fn replication_size(&self, field: &ReplicatedField) -> Result<Option<u32>, Error> {
        let Some(obj) = self.field_api(field.kind).get_opt(&field.name).await? else {
            return Ok(None);
        };
        declared_size(&obj.data, &field.size_pointer)
    }

    async fn set_replication_size(
        &self,
        field: &ReplicatedField,
        size: u32,
    ) -> Result<(), Error> {
        let api = self.field_api(field.kind);
        let mut obj = api.get(&field.name).await?;
        let slot = obj.data.pointer_mut(&field.size_pointer).ok_or_else(|| {
            Error::storage(format!(
                "{} {} has no field {}",
                field.kind.kind(),
                field.name,
                field.size_pointer
            ))
        })?;
        *slot = serde_json::Value::from(size);
        api.replace(&field.name, &PostParams::default(), &obj).await?;
        Ok(())
    }

    async fn tools_exec(&self, args: Vec<String>) -> Result<String, Error> {
        let pods: Api<Pod> = Api::namespaced(self.client.clone(), &self.rook.namespace);
        let pod = running_pod(&pods, TOOLS_SELECTOR)
            .await?
            .and_then(|p| p.metadata.name)
            .ok_or_else(|| Error::not_found("Pod", TOOLS_SELECTOR))?;

        debug!(pod = %pod, command = %args.join(" "), "running ceph tools command");
        let output = exec_capture(&pods, &pod, None, args).await?;
        if output.success {
            Ok(output.stdout)
        } else {
            let detail = if output.stderr.trim().is_empty() {
                output.message.unwrap_or_default()
            } else {
                output.stderr
            };
            Err(Error::storage(detail.trim().to_string()))
        }
    }
}

// =============================================================================
// etcd
// =============================================================================

const ETCD_SELECTOR: &str = "component=etcd";
const ETCD_CONTAINER: &str = "etcd";
const ETCD_PKI: &str = "/etc/kubernetes/pki/etcd";

#[derive(Deserialize)]
struct MemberList {
    #[serde(default)]
    members: Vec<EtcdMember>,
}

/// etcd membership via `etcdctl` in a running etcd static pod
pub struct KubeEtcd {
    client: Client,
}

impl KubeEtcd {
    /// Create a new KubeEtcd
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    async fn etcdctl(&self, endpoints: &[String], args: &[&str]) -> Result<String, Error> {
        let pods: Api<Pod> = Api::namespaced(self.client.clone(), KUBE_SYSTEM_NAMESPACE);
        let list = pods
            .list(&ListParams::default().labels(ETCD_SELECTOR))
            .await?;

        let pod = choose_etcd_pod(&list.items, endpoints)
            .ok_or_else(|| Error::etcd("no ready etcd pod"))?;

        let mut command = vec![
            "etcdctl".to_string(),
            format!("--cacert={}/ca.crt", ETCD_PKI),
            format!("--cert={}/peer.crt", ETCD_PKI),
            format!("--key={}/peer.key", ETCD_PKI),
        ];
        // Without endpoints etcdctl talks to the member in the chosen pod
        if !endpoints.is_empty() {
            command.push(format!("--endpoints={}", endpoints.join(",")));
        }
        command.extend(args.iter().map(|a| a.to_string()));

        let output = exec_capture(&pods, &pod, Some(ETCD_CONTAINER), command).await?;
        if output.success {
            Ok(output.stdout)
        } else {
            Err(Error::etcd(output.stderr.trim().to_string()))
        }
    }
}

/// Pod to run `etcdctl` in.
///
/// Only running pods with a true Ready condition qualify: a pod on an
/// unreachable node keeps its Running phase but loses readiness, and exec
/// through its kubelet would fail. Among those, a pod whose pod or host IP is
/// one of `endpoints` is preferred.
pub(crate) fn choose_etcd_pod(pods: &[Pod], endpoints: &[String]) -> Option<String> {
    let ready: Vec<&Pod> = pods
        .iter()
        .filter(|p| {
            let Some(status) = p.status.as_ref() else {
                return false;
            };
            status.phase.as_deref() == Some("Running")
                && status
                    .conditions
                    .iter()
                    .flatten()
                    .any(|c| c.type_ == "Ready" && c.status == "True")
        })
        .collect();

    let on_endpoint = |pod: &&Pod| {
        pod.status.as_ref().is_some_and(|s| {
            [s.pod_ip.as_deref(), s.host_ip.as_deref()]
                .into_iter()
                .flatten()
                .any(|ip| endpoints.iter().any(|e| url_host(e) == Some(ip)))
        })
    };

    ready
        .iter()
        .copied()
        .find(on_endpoint)
        .or_else(|| ready.first().copied())
        .and_then(|p| p.metadata.name.clone())
}

/// Host part of a URL such as `https://10.0.0.1:2379`
pub(crate) fn url_host(url: &str) -> Option<&str> {
    let rest = url.split_once("://").map(|(_, r)| r).unwrap_or(url);
    let authority = rest.split('/').next()?;
    if let Some(bracketed) = authority.strip_prefix('[') {
        return bracketed.split(']').next();
    }
    authority.rsplit_once(':').map(|(h, _)| h).or(Some(authority))
}

#[async_trait]
impl EtcdApi for KubeEtcd {
    async fn list_members(&self, endpoints: &[String]) -> Result<Vec<EtcdMember>, Error> {
        let out = self.etcdctl(endpoints, &["member", "list", "-w", "json"]).await?;
        let list: MemberList = serde_json::from_str(&out)
            .map_err(|e| Error::serialization(format!("etcd member list: {}", e)))?;
        Ok(list.members)
    }

    async fn remove_member(&self, endpoints: &[String], id: u64) -> Result<(), Error> {
        let id = format!("{:x}", id);
        self.etcdctl(endpoints, &["member", "remove", &id]).await?;
        Ok(())
    }
}

// =============================================================================
// CSRs
// =============================================================================

/// CSR operations via the certificates API
pub struct KubeCsrs {
    client: Client,
}

impl KubeCsrs {
    /// Create a new KubeCsrs
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl CsrApi for KubeCsrs {
    async fn list_csrs(&self) -> Result<Vec<CertificateSigningRequest>, Error> {
        let api: Api<CertificateSigningRequest> = Api::all(self.client.clone());
        Ok(api.list(&ListParams::default()).await?.items)
    }

    async fn approve_csr(&self, name: &str, reason: &str, message: &str) -> Result<(), Error> {
        let api: Api<CertificateSigningRequest> = Api::all(self.client.clone());
        let patch = serde_json::json!({
            "status": {
                "conditions": [{
                    "type": "Approved",
                    "status": "True",
                    "reason": reason,
                    "message": message,
                    "lastUpdateTime": chrono::Utc::now().to_rfc3339(),
                }]
            }
        });
        api.patch_approval(name, &PatchParams::apply(FIELD_MANAGER), &Patch::Merge(&patch))
            .await?;
        Ok(())
    }
}
