use crate::cache::key::ResourceKey;
use crate::cache::Indexer;
use crate::errors::ControllerError;
use async_trait::async_trait;
use dashmap::DashMap;
use kube::Resource;
use std::io::Write;
use std::sync::{Arc, Mutex};
use tracing::{debug, info};

/// The corrective action run for a key.
///
/// Implementations read current state from the cache by key and must be
/// idempotent: they can be called again for a state they already handled,
/// and for keys that no longer (or never did) exist. Retries are not their
/// concern, they only report success or failure.
#[async_trait]
pub trait Reconciler: Send + Sync {
    async fn reconcile(&self, key: &ResourceKey) -> Result<(), ControllerError>;
}

/// Prints a line for every change it observes.
pub struct ChangePrinter<K> {
    kind: String,
    indexer: Arc<dyn Indexer<K>>,
    out: Mutex<Box<dyn Write + Send>>,
    /// Last resourceVersion reported per key.
    reported: DashMap<ResourceKey, String>,
}

impl<K> ChangePrinter<K>
where
    K: Resource<DynamicType = ()>,
{
    pub fn new(indexer: Arc<dyn Indexer<K>>, out: Box<dyn Write + Send>) -> Self {
        Self {
            kind: K::kind(&()).to_string(),
            indexer,
            out: Mutex::new(out),
            reported: DashMap::new(),
        }
    }

    pub fn stdout(indexer: Arc<dyn Indexer<K>>) -> Self {
        Self::new(indexer, Box::new(std::io::stdout()))
    }
}

impl<K> ChangePrinter<K> {
    fn print(&self, key: &ResourceKey, line: &str) -> Result<(), ControllerError> {
        let mut out = self.out.lock().map_err(|_| ControllerError::Reconcile {
            key: key.clone(),
            reason: "output writer poisoned".to_string(),
        })?;
        writeln!(out, "{}", line)
            .and_then(|_| out.flush())
            .map_err(|e| ControllerError::Reconcile {
                key: key.clone(),
                reason: e.to_string(),
            })
    }
}

#[async_trait]
impl<K> Reconciler for ChangePrinter<K>
where
    K: Resource + Send + Sync,
{
    async fn reconcile(&self, key: &ResourceKey) -> Result<(), ControllerError> {
        let cached = self.indexer.get_by_key(key).map_err(|e| match e {
            e @ ControllerError::CacheLookup { .. } => e,
            other => ControllerError::CacheLookup {
                key: key.clone(),
                reason: other.to_string(),
            },
        })?;
        let Some(obj) = cached else {
            // Deleted, or never seen. Either way there is nothing left to
            // compare against next time.
            self.reported.remove(key);
            info!("[Ingress Monitor] {} {} is gone", self.kind, key);
            return self.print(key, &format!("{} {} does not exist anymore", self.kind, key));
        };

        let version = obj.meta().resource_version.clone();
        if let Some(version) = &version {
            if self.reported.get(key).is_some_and(|seen| seen.value() == version) {
                debug!(
                    "[Ingress Monitor] {} at resourceVersion {} already reported",
                    key, version
                );
                return Ok(());
            }
        }

        self.print(
            key,
            &format!("Something changed in {} {}", self.kind.to_lowercase(), key),
        )?;
        match version {
            Some(version) => {
                self.reported.insert(key.clone(), version);
            }
            None => {
                self.reported.remove(key);
            }
        }
        Ok(())
    }
}
