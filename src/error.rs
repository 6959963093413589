//! Error types for the steward operator
//!
//! Errors carry enough context (node, task kind, purge step) to tell which
//! part of a reconcile tick failed. Nothing here is fatal to the process: the
//! poller logs whatever a tick returns and tries again on the next one.

use thiserror::Error;

/// Main error type for steward operations
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// Kubernetes API error
    #[error("kubernetes error: {source}")]
    Kube {
        /// The underlying kube-rs error
        #[from]
        source: kube::Error,
    },

    /// A resource that was required to exist is missing
    #[error("{kind} {name} not found")]
    NotFound {
        /// Resource kind (e.g. "Pod", "CephCluster")
        kind: String,
        /// Resource name
        name: String,
    },

    /// A host task reached the Failed phase
    #[error("task {kind} failed on node {node}: {output}")]
    TaskFailed {
        /// Node the task was pinned to
        node: String,
        /// Task kind label
        kind: String,
        /// Error lines captured from the task log
        output: String,
    },

    /// Storage administration failure
    #[error("storage error: {message}")]
    Storage {
        /// Description of what failed
        message: String,
    },

    /// The storage tools reported that a pool does not exist
    #[error("storage pool {pool} does not exist")]
    StorageNotFound {
        /// Ceph pool name
        pool: String,
    },

    /// etcd membership failure
    #[error("etcd error: {message}")]
    Etcd {
        /// Description of what failed
        message: String,
    },

    /// A purge step failed
    #[error("purge node {node} [{step}]: {message}")]
    Purge {
        /// Node being purged
        node: String,
        /// Step of the purge protocol that failed
        step: PurgeStep,
        /// Description of what failed
        message: String,
    },

    /// Running a command inside a pod failed to start or complete
    #[error("exec in pod {pod}: {message}")]
    Exec {
        /// Pod the command was run in
        pod: String,
        /// Description of what failed
        message: String,
    },

    /// Serialization/deserialization error
    #[error("serialization error: {message}")]
    Serialization {
        /// Description of what failed
        message: String,
    },

    /// Invalid configuration
    #[error("config error: {message}")]
    Config {
        /// Description of what is invalid
        message: String,
    },

    /// The operation was cancelled before it completed
    #[error("operation cancelled")]
    Cancelled,

    /// Several independent sub-flows failed in the same tick
    #[error("{} errors: {}", .0.len(), join_errors(.0))]
    Aggregate(Vec<Error>),
}

/// Steps of the node purge protocol, used to label purge errors
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PurgeStep {
    /// Looking up the node record
    Resolve,
    /// Removing the node from the storage cluster
    Storage,
    /// Removing the node from kubeadm cluster status
    Registration,
    /// Removing the node's etcd member
    Consensus,
    /// Re-pointing workloads pinned to the node
    Workloads,
    /// Deleting the node record
    DeleteNode,
}

impl std::fmt::Display for PurgeStep {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            PurgeStep::Resolve => "resolve",
            PurgeStep::Storage => "storage",
            PurgeStep::Registration => "registration",
            PurgeStep::Consensus => "consensus",
            PurgeStep::Workloads => "workloads",
            PurgeStep::DeleteNode => "delete-node",
        };
        f.write_str(s)
    }
}

fn join_errors(errors: &[Error]) -> String {
    errors
        .iter()
        .map(|e| e.to_string())
        .collect::<Vec<_>>()
        .join("; ")
}

impl Error {
    /// Create a not-found error
    pub fn not_found(kind: impl Into<String>, name: impl Into<String>) -> Self {
        Self::NotFound {
            kind: kind.into(),
            name: name.into(),
        }
    }

    /// Create a storage error with the given message
    pub fn storage(msg: impl Into<String>) -> Self {
        Self::Storage {
            message: msg.into(),
        }
    }

    /// Create an etcd error with the given message
    pub fn etcd(msg: impl Into<String>) -> Self {
        Self::Etcd {
            message: msg.into(),
        }
    }

    /// Create an exec error for the given pod
    pub fn exec(pod: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Exec {
            pod: pod.into(),
            message: msg.into(),
        }
    }

    /// Create a serialization error with the given message
    pub fn serialization(msg: impl Into<String>) -> Self {
        Self::Serialization {
            message: msg.into(),
        }
    }

    /// Create a config error with the given message
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config {
            message: msg.into(),
        }
    }

    /// Wrap an error with the purge step that produced it
    pub fn purge(node: impl Into<String>, step: PurgeStep, source: impl std::fmt::Display) -> Self {
        Self::Purge {
            node: node.into(),
            step,
            message: source.to_string(),
        }
    }

    /// Collapse a list of errors: none is Ok, one is returned as-is, more are aggregated
    pub fn collect(mut errors: Vec<Error>) -> Result<(), Error> {
        match errors.len() {
            0 => Ok(()),
            1 => Err(errors.remove(0)),
            _ => Err(Error::Aggregate(errors)),
        }
    }

    /// Whether this error, or any error aggregated inside it, is a cancellation
    pub fn is_cancelled(&self) -> bool {
        match self {
            Error::Cancelled => true,
            Error::Aggregate(errors) => errors.iter().any(Error::is_cancelled),
            _ => false,
        }
    }

    /// Whether this error is a Kubernetes 404
    pub fn is_not_found(&self) -> bool {
        match self {
            Error::Kube {
                source: kube::Error::Api(resp),
            } => resp.code == 404,
            Error::NotFound { .. } => true,
            _ => false,
        }
    }
}
