use crate::cache::key::ResourceKey;
use std::time::Duration;
use thiserror::Error;

/// Every failure the controller can produce.
///
/// Per-key variants (`MissingName`, `InvalidKey`, `CacheLookup`, `Reconcile`,
/// `Panicked`) are handled by the retry policy and never stop the process.
/// `SyncTimeout` is the only error that aborts `Controller::run`.
#[derive(Debug, Error)]
pub enum ControllerError {
    #[error("object has no metadata.name, cannot derive a resource key")]
    MissingName,

    #[error("malformed resource key {0:?}")]
    InvalidKey(String),

    #[error("fetching object with key {key} from store failed: {reason}")]
    CacheLookup { key: ResourceKey, reason: String },

    #[error("reconciling {key} failed: {reason}")]
    Reconcile { key: ResourceKey, reason: String },

    #[error("reconciler panicked while processing {key}: {message}")]
    Panicked { key: ResourceKey, message: String },

    #[error("timed out after {0:?} waiting for caches to sync")]
    SyncTimeout(Duration),

    #[error("watch stream failed: {0}")]
    Watch(#[from] kube::runtime::watcher::Error),

    #[error(transparent)]
    Kube(#[from] kube::Error),

    #[error("failed to load kubeconfig: {0}")]
    Kubeconfig(String),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub type Result<T, E = ControllerError> = std::result::Result<T, E>;
