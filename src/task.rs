//! Host tasks
//!
//! Some operations only make sense on the target host's filesystem: rotating
//! kubeadm certificates, regenerating the load balancer config, rewriting
//! kubeconfigs. Steward runs those as short-lived privileged pods pinned to one
//! node by hostname, polls them to a terminal phase, and reads their logs.
//!
//! The task's stdout is a contract: lines starting with `Error` are failures,
//! lines starting with `Rotated` or `Restarting` confirm an action, everything
//! else is incidental. [`classify_line`] is the only place that contract is
//! interpreted.
//!
//! Batches run node by node, never concurrently. Each node may restart a
//! shared endpoint (the API server), so the next node waits until load
//! balancers have had time to see the previous one healthy again.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use k8s_openapi::api::core::v1::{
    Container, HostPathVolumeSource, Pod, PodSpec, SecurityContext, Toleration, Volume,
    VolumeMount,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use crate::config::StewardConfig;
use crate::gateway::PodApi;
use crate::{
    Error, CONTROL_PLANE_LABEL, FIELD_MANAGER, HOSTNAME_LABEL, LEGACY_MASTER_LABEL,
    MANAGED_BY_LABEL, TASK_KIND_LABEL,
};

const TASK_CONTAINER: &str = "task";

/// Severity of one line of host task output
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Severity {
    /// The task reports a failure
    Error,
    /// The task confirms an action it took
    Info,
    /// Incidental output
    Debug,
}

/// Output prefixes with meaning, checked in order
pub const LOG_PREFIXES: [(&str, Severity); 3] = [
    ("Error", Severity::Error),
    ("Rotated", Severity::Info),
    ("Restarting", Severity::Info),
];

/// Classify one line of host task output by its prefix
pub fn classify_line(line: &str) -> Severity {
    LOG_PREFIXES
        .iter()
        .find(|(prefix, _)| line.starts_with(prefix))
        .map(|(_, severity)| *severity)
        .unwrap_or(Severity::Debug)
}

/// Log every line at its severity and return the error lines
fn report_output(node: &str, kind: &str, logs: &str) -> Vec<String> {
    let mut errors = Vec::new();
    for line in logs.lines().filter(|l| !l.trim().is_empty()) {
        match classify_line(line) {
            Severity::Error => {
                error!(node, kind, "{}", line);
                errors.push(line.to_string());
            }
            Severity::Info => info!(node, kind, "{}", line),
            Severity::Debug => debug!(node, kind, "{}", line),
        }
    }
    errors
}

/// A host path mounted into a task pod
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct HostMount {
    /// Path on the node
    pub host_path: String,
    /// Path inside the container
    pub mount_path: String,
}

/// What to run on each node
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct HostTask {
    /// Task kind; pods are labelled and swept by it
    pub kind: String,
    /// Command and arguments
    pub command: Vec<String>,
    /// Host paths to mount
    pub mounts: Vec<HostMount>,
}

impl HostTask {
    /// Create a task of `kind` running `command`
    pub fn new<I, S>(kind: impl Into<String>, command: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            kind: kind.into(),
            command: command.into_iter().map(Into::into).collect(),
            mounts: Vec::new(),
        }
    }

    /// Mount `host_path` at the same path inside the container
    pub fn mount(mut self, host_path: impl Into<String>) -> Self {
        let host_path = host_path.into();
        self.mounts.push(HostMount {
            mount_path: host_path.clone(),
            host_path,
        });
        self
    }
}

/// How a batch reacts to a failing node
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum BatchMode {
    /// Stop at the first failure; remaining nodes are not attempted
    #[default]
    AllOrNothing,
    /// Attempt every node and report all failures together
    ContinueOnError,
}

/// Runs host tasks through the pod gateway
#[derive(Clone)]
pub struct TaskRunner {
    pods: Arc<dyn PodApi>,
    namespace: String,
    image: String,
    poll_interval: Duration,
    node_delay: Duration,
}

impl TaskRunner {
    /// Create a runner using the task settings from `config`
    pub fn new(pods: Arc<dyn PodApi>, config: &StewardConfig) -> Self {
        Self {
            pods,
            namespace: config.namespace.clone(),
            image: config.host_task_image.clone(),
            poll_interval: config.task_poll_interval,
            node_delay: config.task_node_delay,
        }
    }

    fn selector(kind: &str) -> String {
        format!("{}={}", TASK_KIND_LABEL, kind)
    }

    /// Delete every pod of a task kind
    pub async fn sweep(&self, kind: &str) -> Result<(), Error> {
        debug!(kind, "sweeping task pods");
        self.pods
            .delete_pods(&self.namespace, &Self::selector(kind))
            .await
    }

    /// Build the pod running `task` on `node`
    pub fn build_pod(&self, node: &str, task: &HostTask) -> Pod {
        let labels = BTreeMap::from([
            (MANAGED_BY_LABEL.to_string(), FIELD_MANAGER.to_string()),
            (TASK_KIND_LABEL.to_string(), task.kind.clone()),
        ]);

        let (volumes, mounts): (Vec<_>, Vec<_>) = task
            .mounts
            .iter()
            .enumerate()
            .map(|(i, m)| {
                let name = format!("host-{}", i);
                (
                    Volume {
                        name: name.clone(),
                        host_path: Some(HostPathVolumeSource {
                            path: m.host_path.clone(),
                            type_: None,
                        }),
                        ..Default::default()
                    },
                    VolumeMount {
                        name,
                        mount_path: m.mount_path.clone(),
                        ..Default::default()
                    },
                )
            })
            .unzip();

        let tolerations = [CONTROL_PLANE_LABEL, LEGACY_MASTER_LABEL]
            .into_iter()
            .map(|key| Toleration {
                key: Some(key.to_string()),
                operator: Some("Exists".to_string()),
                effect: Some("NoSchedule".to_string()),
                ..Default::default()
            })
            .collect();

        Pod {
            metadata: ObjectMeta {
                generate_name: Some(format!("{}-{}-", task.kind, node)),
                namespace: Some(self.namespace.clone()),
                labels: Some(labels),
                ..Default::default()
            },
            spec: Some(PodSpec {
                node_selector: Some(BTreeMap::from([(
                    HOSTNAME_LABEL.to_string(),
                    node.to_string(),
                )])),
                tolerations: Some(tolerations),
                restart_policy: Some("Never".to_string()),
                containers: vec![Container {
                    name: TASK_CONTAINER.to_string(),
                    image: Some(self.image.clone()),
                    command: Some(task.command.clone()),
                    security_context: Some(SecurityContext {
                        privileged: Some(true),
                        ..Default::default()
                    }),
                    volume_mounts: Some(mounts),
                    ..Default::default()
                }],
                volumes: Some(volumes),
                ..Default::default()
            }),
            status: None,
        }
    }

    /// Run `task` on one node and wait for it to finish.
    ///
    /// Previous pods of the same kind are swept first. A failed pod is left in
    /// place and its error output returned in [`Error::TaskFailed`].
    /// Cancellation stops polling with [`Error::Cancelled`]; the pod is not
    /// deleted.
    #[instrument(skip(self, cancel, task), fields(kind = %task.kind))]
    pub async fn run_on_node(
        &self,
        cancel: &CancellationToken,
        node: &str,
        task: &HostTask,
    ) -> Result<(), Error> {
        self.sweep(&task.kind).await?;

        let created = self
            .pods
            .create_pod(&self.namespace, &self.build_pod(node, task))
            .await?;
        let name = created
            .metadata
            .name
            .ok_or_else(|| Error::serialization("created task pod has no name"))?;
        info!(pod = %name, "task pod created");

        let phase = loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    warn!(pod = %name, "task wait cancelled");
                    return Err(Error::Cancelled);
                }
                _ = tokio::time::sleep(self.poll_interval) => {}
            }

            let pod = self
                .pods
                .get_pod(&self.namespace, &name)
                .await?
                .ok_or_else(|| Error::TaskFailed {
                    node: node.to_string(),
                    kind: task.kind.clone(),
                    output: format!("pod {} disappeared", name),
                })?;
            match pod.status.and_then(|s| s.phase).as_deref() {
                Some("Succeeded") => break TaskPhase::Succeeded,
                Some("Failed") => break TaskPhase::Failed,
                phase => debug!(pod = %name, ?phase, "task pod not finished"),
            }
        };

        let logs = match self.pods.pod_logs(&self.namespace, &name).await {
            Ok(logs) => logs,
            Err(e) => {
                warn!(pod = %name, error = %e, "failed to fetch task logs");
                String::new()
            }
        };
        let errors = report_output(node, &task.kind, &logs);

        match phase {
            TaskPhase::Succeeded => Ok(()),
            TaskPhase::Failed => Err(Error::TaskFailed {
                node: node.to_string(),
                kind: task.kind.clone(),
                output: if errors.is_empty() {
                    format!("pod {} failed", name)
                } else {
                    errors.join("\n")
                },
            }),
        }
    }

    /// Run `task` on each node in order, then sweep.
    ///
    /// With [`BatchMode::AllOrNothing`] the first failure stops the batch.
    /// The sweep after the batch runs whether or not it succeeded.
    pub async fn run_on_nodes(
        &self,
        cancel: &CancellationToken,
        nodes: &[String],
        task: &HostTask,
        mode: BatchMode,
    ) -> Result<(), Error> {
        let result = self.run_batch(cancel, nodes, task, mode).await;

        if let Err(e) = self.sweep(&task.kind).await {
            warn!(kind = %task.kind, error = %e, "failed to sweep task pods after batch");
            if result.is_ok() {
                return Err(e);
            }
        }
        result
    }

    async fn run_batch(
        &self,
        cancel: &CancellationToken,
        nodes: &[String],
        task: &HostTask,
        mode: BatchMode,
    ) -> Result<(), Error> {
        let mut errors = Vec::new();

        for (i, node) in nodes.iter().enumerate() {
            if i > 0 && !self.node_delay.is_zero() {
                tokio::select! {
                    _ = cancel.cancelled() => return Err(Error::Cancelled),
                    _ = tokio::time::sleep(self.node_delay) => {}
                }
            }

            match self.run_on_node(cancel, node, task).await {
                Ok(()) => info!(node = %node, kind = %task.kind, "task completed"),
                Err(Error::Cancelled) => return Err(Error::Cancelled),
                Err(e) if mode == BatchMode::ContinueOnError => {
                    warn!(node = %node, kind = %task.kind, error = %e, "task failed, continuing");
                    errors.push(e);
                }
                Err(e) => return Err(e),
            }
        }

        Error::collect(errors)
    }
}

enum TaskPhase {
    Succeeded,
    Failed,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::MockPodApi;
    use k8s_openapi::api::core::v1::PodStatus;
    use parking_lot::Mutex;

    fn runner(pods: MockPodApi) -> TaskRunner {
        let config = StewardConfig {
            task_poll_interval: Duration::from_millis(1),
            task_node_delay: Duration::ZERO,
            ..Default::default()
        };
        TaskRunner::new(Arc::new(pods), &config)
    }

    fn pod_with_phase(name: &str, phase: &str) -> Pod {
        Pod {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                ..Default::default()
            },
            spec: None,
            status: Some(PodStatus {
                phase: Some(phase.to_string()),
                ..Default::default()
            }),
        }
    }

    fn target_node(pod: &Pod) -> String {
        pod.spec
            .as_ref()
            .and_then(|s| s.node_selector.as_ref())
            .and_then(|s| s.get(HOSTNAME_LABEL))
            .cloned()
            .unwrap_or_default()
    }

    fn rotate() -> HostTask {
        HostTask::new("rotate-certs", ["rotate-certs", "--ttl", "720h"]).mount("/etc/kubernetes")
    }

    #[test]
    fn test_classify_line_prefix_table() {
        assert_eq!(classify_line("Error: cert expired"), Severity::Error);
        assert_eq!(classify_line("Rotated apiserver cert"), Severity::Info);
        assert_eq!(classify_line("Restarting kube-apiserver"), Severity::Info);
        assert_eq!(classify_line("checking certs"), Severity::Debug);
        // prefixes are case sensitive and anchored at the start
        assert_eq!(classify_line("error: lowercase"), Severity::Debug);
        assert_eq!(classify_line("  Error indented"), Severity::Debug);
    }

    #[test]
    fn test_report_output_returns_error_lines() {
        let errors = report_output(
            "n1",
            "rotate-certs",
            "Rotated apiserver\nnoise\nError: etcd cert\n\nError: kubelet\n",
        );
        assert_eq!(errors, vec!["Error: etcd cert", "Error: kubelet"]);
    }

    #[test]
    fn test_build_pod_pins_and_privileges() {
        let pod = runner(MockPodApi::new()).build_pod("node-1", &rotate());

        assert_eq!(target_node(&pod), "node-1");
        assert_eq!(
            pod.metadata.generate_name.as_deref(),
            Some("rotate-certs-node-1-")
        );
        let labels = pod.metadata.labels.unwrap();
        assert_eq!(labels.get(TASK_KIND_LABEL).unwrap(), "rotate-certs");

        let spec = pod.spec.unwrap();
        assert_eq!(spec.restart_policy.as_deref(), Some("Never"));
        let tolerated: Vec<_> = spec
            .tolerations
            .unwrap()
            .into_iter()
            .filter_map(|t| t.key)
            .collect();
        assert!(tolerated.contains(&CONTROL_PLANE_LABEL.to_string()));

        let container = &spec.containers[0];
        assert_eq!(
            container.security_context.as_ref().unwrap().privileged,
            Some(true)
        );
        assert_eq!(
            container.volume_mounts.as_ref().unwrap()[0].mount_path,
            "/etc/kubernetes"
        );
        assert_eq!(
            spec.volumes.unwrap()[0].host_path.as_ref().unwrap().path,
            "/etc/kubernetes"
        );
    }

    #[tokio::test]
    async fn test_single_node_success() {
        let mut pods = MockPodApi::new();
        pods.expect_delete_pods()
            .withf(|_, sel| sel == "steward.io/task=rotate-certs")
            .times(1)
            .returning(|_, _| Ok(()));
        pods.expect_create_pod()
            .times(1)
            .returning(|_, _| Ok(pod_with_phase("rotate-certs-n1-abcde", "Pending")));
        let polls = Arc::new(Mutex::new(0));
        let p = polls.clone();
        pods.expect_get_pod().returning(move |_, name| {
            let mut n = p.lock();
            *n += 1;
            let phase = if *n < 3 { "Running" } else { "Succeeded" };
            Ok(Some(pod_with_phase(name, phase)))
        });
        pods.expect_pod_logs()
            .returning(|_, _| Ok("Rotated apiserver\n".to_string()));

        let cancel = CancellationToken::new();
        runner(pods)
            .run_on_node(&cancel, "n1", &rotate())
            .await
            .unwrap();
        assert_eq!(*polls.lock(), 3);
    }

    #[tokio::test]
    async fn test_failed_task_surfaces_error_lines() {
        let mut pods = MockPodApi::new();
        pods.expect_delete_pods().returning(|_, _| Ok(()));
        pods.expect_create_pod()
            .returning(|_, _| Ok(pod_with_phase("t-1", "Pending")));
        pods.expect_get_pod()
            .returning(|_, name| Ok(Some(pod_with_phase(name, "Failed"))));
        pods.expect_pod_logs()
            .returning(|_, _| Ok("checking\nError: kubeadm certs renew failed\n".to_string()));

        let err = runner(pods)
            .run_on_node(&CancellationToken::new(), "n1", &rotate())
            .await
            .unwrap_err();
        match err {
            Error::TaskFailed { node, output, .. } => {
                assert_eq!(node, "n1");
                assert_eq!(output, "Error: kubeadm certs renew failed");
            }
            other => panic!("Expected TaskFailed, got {other}"),
        }
    }

    #[tokio::test]
    async fn test_vanished_pod_is_a_failure() {
        let mut pods = MockPodApi::new();
        pods.expect_delete_pods().returning(|_, _| Ok(()));
        pods.expect_create_pod()
            .returning(|_, _| Ok(pod_with_phase("t-1", "Pending")));
        pods.expect_get_pod().returning(|_, _| Ok(None));
        pods.expect_pod_logs().never();

        let err = runner(pods)
            .run_on_node(&CancellationToken::new(), "n1", &rotate())
            .await
            .unwrap_err();
        assert!(err.to_string().contains("disappeared"));
    }

    #[tokio::test]
    async fn test_cancellation_stops_polling() {
        let mut pods = MockPodApi::new();
        pods.expect_delete_pods().returning(|_, _| Ok(()));
        pods.expect_create_pod()
            .returning(|_, _| Ok(pod_with_phase("t-1", "Pending")));
        pods.expect_get_pod()
            .returning(|_, name| Ok(Some(pod_with_phase(name, "Running"))));

        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            trigger.cancel();
        });

        let err = runner(pods)
            .run_on_node(&cancel, "n1", &rotate())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Cancelled));
    }

    /// Story: node 2 of 3 fails during a rotation batch
    ///
    /// The batch stops at node 2 so node 3 keeps its working control plane,
    /// and no task pods are left behind once the batch returns.
    #[tokio::test]
    async fn story_batch_stops_at_first_failure_and_sweeps() {
        let calls = Arc::new(Mutex::new(Vec::<String>::new()));

        let mut pods = MockPodApi::new();
        let c = calls.clone();
        pods.expect_delete_pods().returning(move |_, _| {
            c.lock().push("sweep".to_string());
            Ok(())
        });
        let c = calls.clone();
        pods.expect_create_pod().returning(move |_, pod| {
            let node = target_node(pod);
            c.lock().push(format!("create {}", node));
            Ok(pod_with_phase(&format!("rotate-certs-{}-x", node), "Pending"))
        });
        pods.expect_get_pod().returning(|_, name| {
            let phase = if name.contains("-n2-") { "Failed" } else { "Succeeded" };
            Ok(Some(pod_with_phase(name, phase)))
        });
        pods.expect_pod_logs().returning(|_, name| {
            Ok(if name.contains("-n2-") {
                "Error: apiserver did not come back".to_string()
            } else {
                "Rotated apiserver".to_string()
            })
        });

        let nodes = vec!["n1".to_string(), "n2".to_string(), "n3".to_string()];
        let err = runner(pods)
            .run_on_nodes(&CancellationToken::new(), &nodes, &rotate(), BatchMode::AllOrNothing)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::TaskFailed { ref node, .. } if node == "n2"));

        let calls = calls.lock();
        let created: Vec<_> = calls.iter().filter(|c| c.starts_with("create")).collect();
        assert_eq!(created, vec!["create n1", "create n2"]);
        assert_eq!(calls.last().map(String::as_str), Some("sweep"));
    }

    #[tokio::test]
    async fn test_continue_on_error_attempts_every_node() {
        let created = Arc::new(Mutex::new(Vec::<String>::new()));

        let mut pods = MockPodApi::new();
        pods.expect_delete_pods().returning(|_, _| Ok(()));
        let c = created.clone();
        pods.expect_create_pod().returning(move |_, pod| {
            let node = target_node(pod);
            c.lock().push(node.clone());
            Ok(pod_with_phase(&format!("lb-{}-x", node), "Pending"))
        });
        pods.expect_get_pod().returning(|_, name| {
            let phase = if name.contains("-n1-") { "Failed" } else { "Succeeded" };
            Ok(Some(pod_with_phase(name, phase)))
        });
        pods.expect_pod_logs().returning(|_, _| Ok(String::new()));

        let nodes = vec!["n1".to_string(), "n2".to_string(), "n3".to_string()];
        let err = runner(pods)
            .run_on_nodes(
                &CancellationToken::new(),
                &nodes,
                &HostTask::new("lb", ["true"]),
                BatchMode::ContinueOnError,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, Error::TaskFailed { .. }));
        assert_eq!(*created.lock(), vec!["n1", "n2", "n3"]);
    }
}
