//! Idempotency markers
//!
//! Expensive cluster-wide tasks (certificate rotation sweeps, load balancer
//! regeneration) must not run on every tick. Each task kind owns one ConfigMap
//! `steward-task-<kind>` that records either when the task was last attempted
//! or a fingerprint of the state it last applied. Records are created lazily
//! and never deleted.
//!
//! Records are read and then conditionally written without a precondition.
//! Only the reconciler's own serialized tick loop writes them, so no external
//! writer races are assumed; running two operator instances at once is not
//! covered.

use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use k8s_openapi::api::core::v1::ConfigMap;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use tracing::{debug, info, warn};

use crate::gateway::RecordApi;
use crate::{Error, MANAGED_BY_LABEL};

/// Data key holding the RFC3339 time of the last attempt
pub const LAST_ATTEMPTED_KEY: &str = "lastAttempted";

/// Data key holding the fingerprint of the last applied state
pub const LAST_APPLIED_KEY: &str = "lastApplied";

/// Marker kind for certificate rotation sweeps
pub const ROTATE_CERTS: &str = "rotate-certs";

/// Marker kind for internal load balancer updates
pub const UPDATE_INTERNAL_LB: &str = "update-internal-lb";

/// Name of the record backing a marker kind
pub fn record_name(kind: &str) -> String {
    format!("steward-task-{}", kind)
}

/// Order-independent fingerprint of a set of facts: sorted, then joined
pub fn fingerprint<I, S>(parts: I) -> String
where
    I: IntoIterator<Item = S>,
    S: Into<String>,
{
    let mut parts: Vec<String> = parts.into_iter().map(Into::into).collect();
    parts.sort();
    parts.join(";")
}

/// Reads and writes idempotency markers through the record gateway
#[derive(Clone)]
pub struct MarkerStore {
    records: Arc<dyn RecordApi>,
    namespace: String,
}

impl MarkerStore {
    /// Create a store keeping its records in `namespace`
    pub fn new(records: Arc<dyn RecordApi>, namespace: impl Into<String>) -> Self {
        Self {
            records,
            namespace: namespace.into(),
        }
    }

    fn new_record(kind: &str, key: &str, value: String) -> ConfigMap {
        ConfigMap {
            metadata: ObjectMeta {
                name: Some(record_name(kind)),
                labels: Some(BTreeMap::from([(
                    MANAGED_BY_LABEL.to_string(),
                    crate::FIELD_MANAGER.to_string(),
                )])),
                ..Default::default()
            },
            data: Some(BTreeMap::from([(key.to_string(), value)])),
            ..Default::default()
        }
    }

    /// Whether an interval-gated task is due now; see [`MarkerStore::is_due_at`]
    pub async fn is_due(&self, kind: &str, interval: Duration, force: bool) -> Result<bool, Error> {
        self.is_due_at(kind, interval, force, Utc::now()).await
    }

    /// Whether an interval-gated task is due at `now`.
    ///
    /// The first call for a kind creates the record and returns true. Later
    /// calls return false while `now - last < interval` unless `force` is set;
    /// otherwise the record is stamped with `now` and true is returned. A
    /// record with a missing or unparsable timestamp is due.
    pub async fn is_due_at(
        &self,
        kind: &str,
        interval: Duration,
        force: bool,
        now: DateTime<Utc>,
    ) -> Result<bool, Error> {
        let name = record_name(kind);
        let stamp = now.to_rfc3339();

        let Some(mut record) = self.records.get_config_map(&self.namespace, &name).await? else {
            info!(kind, "creating task marker");
            self.records
                .create_config_map(
                    &self.namespace,
                    &Self::new_record(kind, LAST_ATTEMPTED_KEY, stamp),
                )
                .await?;
            return Ok(true);
        };

        let last = record
            .data
            .as_ref()
            .and_then(|d| d.get(LAST_ATTEMPTED_KEY))
            .and_then(|v| match DateTime::parse_from_rfc3339(v) {
                Ok(t) => Some(t.with_timezone(&Utc)),
                Err(e) => {
                    warn!(kind, value = %v, error = %e, "unparsable task marker, treating as due");
                    None
                }
            });

        if !force {
            if let (Some(last), Ok(interval)) = (last, chrono::Duration::from_std(interval)) {
                if now - last < interval {
                    debug!(kind, last = %last, "task not due");
                    return Ok(false);
                }
            }
        }

        record
            .data
            .get_or_insert_with(BTreeMap::new)
            .insert(LAST_ATTEMPTED_KEY.to_string(), stamp);
        self.records
            .replace_config_map(&self.namespace, &record)
            .await?;
        Ok(true)
    }

    /// Run `action` when `fingerprint` differs from the last applied one.
    ///
    /// The first call for a kind records an empty baseline and returns false
    /// without running `action`, so only divergence from a previously observed
    /// state triggers work. When the fingerprint changed, `action` runs and the
    /// new fingerprint is persisted only if it succeeds; a failed action is
    /// retried on the next call.
    pub async fn has_changed<F, Fut>(
        &self,
        kind: &str,
        fingerprint: &str,
        action: F,
    ) -> Result<bool, Error>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<(), Error>>,
    {
        let name = record_name(kind);

        let Some(mut record) = self.records.get_config_map(&self.namespace, &name).await? else {
            info!(kind, "creating task marker baseline");
            self.records
                .create_config_map(
                    &self.namespace,
                    &Self::new_record(kind, LAST_APPLIED_KEY, String::new()),
                )
                .await?;
            return Ok(false);
        };

        let stored = record
            .data
            .as_ref()
            .and_then(|d| d.get(LAST_APPLIED_KEY))
            .map(String::as_str)
            .unwrap_or_default();
        if stored == fingerprint {
            return Ok(false);
        }

        info!(kind, "desired state changed");
        action().await?;

        record
            .data
            .get_or_insert_with(BTreeMap::new)
            .insert(LAST_APPLIED_KEY.to_string(), fingerprint.to_string());
        self.records
            .replace_config_map(&self.namespace, &record)
            .await?;
        Ok(true)
    }
}
