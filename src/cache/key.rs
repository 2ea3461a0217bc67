use crate::errors::{ControllerError, Result};
use kube::Resource;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

/// Identity of a watched object: `namespace/name`, or just `name` for
/// cluster-scoped objects.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ResourceKey(String);

impl ResourceKey {
    pub fn new(namespace: Option<&str>, name: &str) -> Self {
        match namespace {
            Some(ns) if !ns.is_empty() => ResourceKey(format!("{}/{}", ns, name)),
            _ => ResourceKey(name.to_string()),
        }
    }

    /// Splits the key back into its namespace and name.
    pub fn split(&self) -> (Option<&str>, &str) {
        match self.0.split_once('/') {
            Some((ns, name)) => (Some(ns), name),
            None => (None, self.0.as_str()),
        }
    }

    pub fn namespace(&self) -> Option<&str> {
        self.split().0
    }

    pub fn name(&self) -> &str {
        self.split().1
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ResourceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for ResourceKey {
    type Err = ControllerError;

    fn from_str(s: &str) -> Result<Self> {
        let parts: Vec<&str> = s.split('/').collect();
        match parts.as_slice() {
            [name] if !name.is_empty() => Ok(ResourceKey::new(None, name)),
            [ns, name] if !ns.is_empty() && !name.is_empty() => {
                Ok(ResourceKey::new(Some(ns), name))
            }
            _ => Err(ControllerError::InvalidKey(s.to_string())),
        }
    }
}

/// Derives the key of a live object from its metadata.
pub fn meta_namespace_key<K: Resource>(obj: &K) -> Result<ResourceKey> {
    let meta = obj.meta();
    match meta.name.as_deref() {
        Some(name) if !name.is_empty() => Ok(ResourceKey::new(meta.namespace.as_deref(), name)),
        _ => Err(ControllerError::MissingName),
    }
}

/// The payload of a delete notification.
///
/// A delete that was seen on the watch carries the final object. A delete
/// that was only inferred from a relist (the object vanished while the watch
/// was down) carries the key it was cached under and the last state we knew.
#[derive(Debug, Clone)]
pub enum DeletedObject<K> {
    Live(Arc<K>),
    FinalStateUnknown { key: ResourceKey, last_known: Arc<K> },
}

impl<K> DeletedObject<K> {
    pub fn object(&self) -> &Arc<K> {
        match self {
            DeletedObject::Live(obj) => obj,
            DeletedObject::FinalStateUnknown { last_known, .. } => last_known,
        }
    }
}

/// Key extraction that tolerates tombstones.
pub fn deletion_handling_key<K: Resource>(deleted: &DeletedObject<K>) -> Result<ResourceKey> {
    match deleted {
        DeletedObject::FinalStateUnknown { key, .. } => Ok(key.clone()),
        DeletedObject::Live(obj) => meta_namespace_key(obj.as_ref()),
    }
}
