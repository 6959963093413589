//! Kubelet serving certificate approval

use std::sync::Arc;

use k8s_openapi::api::certificates::v1::CertificateSigningRequest;
use tracing::{info, instrument, warn};

use crate::gateway::CsrApi;
use crate::Error;

/// Signer used by kubelets requesting serving certificates
pub const KUBELET_SERVING_SIGNER: &str = "kubernetes.io/kubelet-serving";

/// Reason recorded on approvals
pub const APPROVAL_REASON: &str = "StewardApprove";

const NODE_USER_PREFIX: &str = "system:node:";

/// Whether a CSR is a pending kubelet serving request from a node identity
pub fn should_approve(csr: &CertificateSigningRequest) -> bool {
    let spec = &csr.spec;
    if spec.signer_name != KUBELET_SERVING_SIGNER {
        return false;
    }
    if !spec
        .username
        .as_deref()
        .map(|u| u.starts_with(NODE_USER_PREFIX))
        .unwrap_or(false)
    {
        return false;
    }
    let decided = csr
        .status
        .as_ref()
        .and_then(|s| s.conditions.as_ref())
        .map(|conds| {
            conds
                .iter()
                .any(|c| c.type_ == "Approved" || c.type_ == "Denied")
        })
        .unwrap_or(false);
    !decided
}

/// Approves pending kubelet serving CSRs
#[derive(Clone)]
pub struct CsrApprover {
    csrs: Arc<dyn CsrApi>,
}

impl CsrApprover {
    /// Create an approver
    pub fn new(csrs: Arc<dyn CsrApi>) -> Self {
        Self { csrs }
    }

    /// Approve every eligible CSR, returning how many were approved
    #[instrument(skip(self))]
    pub async fn approve_pending(&self) -> Result<usize, Error> {
        let csrs = self.csrs.list_csrs().await?;
        let mut approved = 0;
        let mut errors = Vec::new();

        for csr in csrs.iter().filter(|c| should_approve(c)) {
            let Some(name) = csr.metadata.name.as_deref() else {
                continue;
            };
            let user = csr.spec.username.as_deref().unwrap_or_default();
            match self
                .csrs
                .approve_csr(name, APPROVAL_REASON, "Auto-approving kubelet serving certificate")
                .await
            {
                Ok(()) => {
                    info!(csr = name, user, "approved kubelet serving certificate");
                    approved += 1;
                }
                Err(e) => {
                    warn!(csr = name, error = %e, "failed to approve CSR");
                    errors.push(e);
                }
            }
        }

        Error::collect(errors).map(|_| approved)
    }
}
