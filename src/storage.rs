//! Rook/Ceph replication controller
//!
//! Pool replication follows the number of ready nodes, bounded by the
//! configured minimum and maximum. Each managed Rook resource is compared
//! before it is written, so a steady cluster sees no writes at all; a full
//! reconcile rewrites every target and re-applies the pool settings directly
//! through the Ceph tools pod in case Rook missed them.

use std::sync::Arc;

use tracing::{debug, info, instrument, warn};

use crate::config::{RookConfig, StewardConfig};
use crate::gateway::{ReplicatedField, StorageApi, StorageKind};
use crate::Error;

/// Replication factor for `ready` nodes within `[min, max]`
pub fn replication_factor(ready: u32, min: u32, max: u32) -> u32 {
    ready.max(min).min(max)
}

/// Ceph `min_size` for a replication factor
pub fn min_size(factor: u32) -> u32 {
    if factor <= 1 {
        1
    } else {
        2
    }
}

/// Replicated size declared at `pointer` in a Rook resource body.
///
/// `None` when the resource has no such field, as with an erasure-coded data
/// pool; those resources are not managed by replication.
pub fn declared_size(data: &serde_json::Value, pointer: &str) -> Result<Option<u32>, Error> {
    let Some(value) = data.pointer(pointer) else {
        return Ok(None);
    };
    let size = value
        .as_u64()
        .ok_or_else(|| Error::serialization(format!("{} is not a size: {}", pointer, value)))?;
    u32::try_from(size)
        .map(Some)
        .map_err(|_| Error::serialization(format!("{} out of range: {}", pointer, size)))
}

/// A Ceph pool backing a Rook resource
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CephPool {
    /// Pool name as Ceph knows it
    pub name: String,
    /// Whether a missing pool is expected on some clusters
    pub optional: bool,
}

impl CephPool {
    fn required(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            optional: false,
        }
    }

    fn optional(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            optional: true,
        }
    }
}

/// One replicated size field and the Ceph pools it governs
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ReplicationTarget {
    /// Size field on the Rook resource
    pub field: ReplicatedField,
    /// Pools to set directly when the field changes
    pub pools: Vec<CephPool>,
}

fn field(kind: StorageKind, name: &str, pointer: &str) -> ReplicatedField {
    ReplicatedField {
        kind,
        name: name.to_string(),
        size_pointer: pointer.to_string(),
    }
}

/// Every replication target steward manages for a Rook installation
pub fn managed_targets(rook: &RookConfig) -> Vec<ReplicationTarget> {
    let fs = &rook.filesystem;
    let store = &rook.object_store;
    let rgw = |suffix: &str| format!("{}.rgw.{}", store, suffix);

    vec![
        ReplicationTarget {
            field: field(StorageKind::BlockPool, &rook.block_pool, "/spec/replicated/size"),
            pools: vec![CephPool::required(rook.block_pool.clone())],
        },
        ReplicationTarget {
            field: field(
                StorageKind::Filesystem,
                fs,
                "/spec/metadataPool/replicated/size",
            ),
            pools: vec![CephPool::required(format!("{}-metadata", fs))],
        },
        ReplicationTarget {
            field: field(
                StorageKind::Filesystem,
                fs,
                "/spec/dataPools/0/replicated/size",
            ),
            pools: vec![CephPool::required(format!("{}-data0", fs))],
        },
        ReplicationTarget {
            field: field(
                StorageKind::ObjectStore,
                store,
                "/spec/metadataPool/replicated/size",
            ),
            pools: vec![
                CephPool::required(".rgw.root"),
                CephPool::required(rgw("control")),
                CephPool::required(rgw("meta")),
                CephPool::required(rgw("log")),
                CephPool::required(rgw("buckets.index")),
                CephPool::optional(rgw("buckets.non-ec")),
            ],
        },
        ReplicationTarget {
            field: field(
                StorageKind::ObjectStore,
                store,
                "/spec/dataPool/replicated/size",
            ),
            pools: vec![CephPool::required(rgw("buckets.data"))],
        },
        ReplicationTarget {
            field: field(StorageKind::BlockPool, &rook.health_pool, "/spec/replicated/size"),
            pools: vec![CephPool::optional(rook.health_ceph_pool.clone())],
        },
    ]
}

fn is_enoent(err: &Error) -> bool {
    match err {
        Error::StorageNotFound { .. } => true,
        Error::Storage { message } => message.contains("ENOENT"),
        _ => false,
    }
}

/// Keeps Rook replication and storage node membership in line with the cluster
#[derive(Clone)]
pub struct ReplicationController {
    storage: Arc<dyn StorageApi>,
    targets: Vec<ReplicationTarget>,
}

impl ReplicationController {
    /// Create a controller managing the Rook resources named in `config`
    pub fn new(storage: Arc<dyn StorageApi>, config: &StewardConfig) -> Self {
        Self {
            storage,
            targets: managed_targets(&config.rook),
        }
    }

    /// Bring every target to `clamp(ready, min, max)`.
    ///
    /// Targets whose resource does not exist are skipped. A target is written
    /// only when its size differs, or on every target when `full` is set.
    /// Failures on one target do not stop the others.
    #[instrument(skip(self))]
    pub async fn adjust(&self, ready: u32, min: u32, max: u32, full: bool) -> Result<u32, Error> {
        let factor = replication_factor(ready, min, max);
        let mut errors = Vec::new();

        for target in &self.targets {
            if let Err(e) = self.adjust_target(target, factor, full).await {
                warn!(
                    kind = target.field.kind.kind(),
                    name = %target.field.name,
                    error = %e,
                    "failed to adjust replication"
                );
                errors.push(e);
            }
        }

        Error::collect(errors).map(|_| factor)
    }

    async fn adjust_target(
        &self,
        target: &ReplicationTarget,
        factor: u32,
        full: bool,
    ) -> Result<(), Error> {
        let field = &target.field;
        let Some(current) = self.storage.replication_size(field).await? else {
            debug!(kind = field.kind.kind(), name = %field.name, "resource or size field absent, skipping");
            return Ok(());
        };
        if current == factor && !full {
            return Ok(());
        }

        if current != factor {
            info!(
                kind = field.kind.kind(),
                name = %field.name,
                pointer = %field.size_pointer,
                from = current,
                to = factor,
                "changing replication"
            );
            match self.storage.set_replication_size(field, factor).await {
                Ok(()) => {}
                Err(e) if e.is_not_found() => {
                    debug!(kind = field.kind.kind(), name = %field.name, "resource deleted, skipping");
                    return Ok(());
                }
                Err(e) => return Err(e),
            }
        }

        for pool in &target.pools {
            self.set_pool(pool, factor).await?;
        }
        Ok(())
    }

    async fn set_pool(&self, pool: &CephPool, factor: u32) -> Result<(), Error> {
        for (key, value) in [("size", factor), ("min_size", min_size(factor))] {
            let args = vec![
                "ceph".to_string(),
                "osd".to_string(),
                "pool".to_string(),
                "set".to_string(),
                pool.name.clone(),
                key.to_string(),
                value.to_string(),
            ];
            match self.storage.tools_exec(args).await {
                Ok(_) => {}
                Err(e) if is_enoent(&e) && pool.optional => {
                    debug!(pool = %pool.name, "optional pool does not exist");
                    return Ok(());
                }
                Err(e) if is_enoent(&e) => {
                    return Err(Error::StorageNotFound {
                        pool: pool.name.clone(),
                    })
                }
                Err(e) => return Err(e),
            }
        }
        debug!(pool = %pool.name, size = factor, "pool replication set");
        Ok(())
    }

    /// Add ready nodes missing from the storage cluster's node list.
    ///
    /// Does nothing when the cluster uses all nodes or does not exist.
    #[instrument(skip(self, ready))]
    pub async fn ensure_storage_nodes(&self, ready: &[String]) -> Result<(), Error> {
        let Some(mut nodes) = self.storage.storage_nodes().await? else {
            return Ok(());
        };

        let mut missing: Vec<String> = ready
            .iter()
            .filter(|name| !nodes.contains(name))
            .cloned()
            .collect();
        if missing.is_empty() {
            return Ok(());
        }
        missing.sort();

        info!(nodes = ?missing, "adding nodes to storage cluster");
        nodes.extend(missing);
        self.storage.set_storage_nodes(nodes).await
    }
}
