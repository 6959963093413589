//! Certificate rotation
//!
//! Control-plane certificates live on each master's disk, so they are renewed
//! by a host task run on the masters one at a time. Other certificates (an
//! in-cluster registry, a proxy) are reached through [`CertificateAuthority`]
//! implementations registered with the reconciler.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::Node;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

#[cfg(test)]
use mockall::automock;

use crate::marker::{MarkerStore, ROTATE_CERTS};
use crate::node::{is_master, is_ready, node_name};
use crate::task::{BatchMode, HostTask, TaskRunner};
use crate::Error;

/// A certificate steward can renew without touching a host
#[cfg_attr(test, automock)]
#[async_trait]
pub trait CertificateAuthority: Send + Sync {
    /// Name used in logs
    fn name(&self) -> String;

    /// Renew the certificate if it expires within `ttl`; true if renewed
    async fn rotate_if_needed(&self, ttl: Duration) -> Result<bool, Error>;
}

/// The host task renewing kubeadm-managed certificates on one master
pub fn control_plane_task(ttl: Duration) -> HostTask {
    HostTask::new(
        ROTATE_CERTS,
        [
            "rotate-certs".to_string(),
            "--ttl".to_string(),
            format!("{}s", ttl.as_secs()),
        ],
    )
    .mount("/etc/kubernetes")
}

/// Rotates every managed certificate when the rotation marker is due
#[derive(Clone)]
pub struct CertRotation {
    markers: MarkerStore,
    tasks: TaskRunner,
    authorities: Vec<Arc<dyn CertificateAuthority>>,
    check_interval: Duration,
    ttl: Duration,
}

impl CertRotation {
    /// Create a rotation flow
    pub fn new(
        markers: MarkerStore,
        tasks: TaskRunner,
        authorities: Vec<Arc<dyn CertificateAuthority>>,
        check_interval: Duration,
        ttl: Duration,
    ) -> Self {
        Self {
            markers,
            tasks,
            authorities,
            check_interval,
            ttl,
        }
    }

    /// Rotate certificates if the check interval has elapsed.
    ///
    /// Returns false when the marker was not due. Authority failures do not
    /// stop the other authorities; the control-plane batch stops at its first
    /// failing master. Authorities are skipped once `cancel` has fired.
    #[instrument(skip(self, cancel, nodes))]
    pub async fn run(&self, cancel: &CancellationToken, nodes: &[Node]) -> Result<bool, Error> {
        if !self
            .markers
            .is_due(ROTATE_CERTS, self.check_interval, false)
            .await?
        {
            debug!("certificate rotation not due");
            return Ok(false);
        }

        let mut masters: Vec<String> = nodes
            .iter()
            .filter(|n| is_master(n) && is_ready(n))
            .map(|n| node_name(n).to_string())
            .collect();
        masters.sort();

        let mut errors = Vec::new();

        info!(masters = masters.len(), "rotating control-plane certificates");
        if let Err(e) = self
            .tasks
            .run_on_nodes(
                cancel,
                &masters,
                &control_plane_task(self.ttl),
                BatchMode::AllOrNothing,
            )
            .await
        {
            errors.push(e);
        }
        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }

        for authority in &self.authorities {
            match authority.rotate_if_needed(self.ttl).await {
                Ok(true) => info!(authority = %authority.name(), "certificate rotated"),
                Ok(false) => debug!(authority = %authority.name(), "certificate still valid"),
                Err(e) => {
                    warn!(authority = %authority.name(), error = %e, "certificate rotation failed");
                    errors.push(e);
                }
            }
        }

        Error::collect(errors).map(|_| true)
    }
}
