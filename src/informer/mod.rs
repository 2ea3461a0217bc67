pub mod kubernetes;

use crate::cache::key::{meta_namespace_key, DeletedObject, ResourceKey};
use crate::cache::{Indexer, Store};
use crate::errors::ControllerError;
use futures::stream::BoxStream;
use futures::StreamExt;
use kube::Resource;
use std::sync::Arc;
use tokio::sync::mpsc::UnboundedSender;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// What the remote side tells us.
#[derive(Debug, Clone)]
pub enum WatchEvent<K> {
    /// A complete listing of the watched scope. Sent first, and again
    /// whenever the watch has to be re-established.
    Listed(Vec<K>),
    /// An object was created or modified.
    Applied(K),
    /// An object was removed; carries its final state.
    Deleted(K),
}

pub type EventStream<K> = BoxStream<'static, Result<WatchEvent<K>, ControllerError>>;

/// A change that has already been applied to the cache.
#[derive(Debug, Clone)]
pub enum Notification<K> {
    Added(Arc<K>),
    Updated { old: Arc<K>, new: Arc<K> },
    Deleted(DeletedObject<K>),
}

/// Keeps a `Store` in step with an `EventStream` and reports every change it
/// applies on a channel.
pub struct Informer<K> {
    events: EventStream<K>,
    store: Arc<Store<K>>,
    notifications: UnboundedSender<Notification<K>>,
}

impl<K> Informer<K>
where
    K: Resource + Send + Sync + 'static,
{
    pub fn new(
        events: EventStream<K>,
        store: Arc<Store<K>>,
        notifications: UnboundedSender<Notification<K>>,
    ) -> Self {
        Self {
            events,
            store,
            notifications,
        }
    }

    /// Applies events until `stop` fires or the stream ends.
    pub async fn run(mut self, stop: CancellationToken) {
        info!("[Informer] Starting watch");
        loop {
            let event = tokio::select! {
                _ = stop.cancelled() => break,
                event = self.events.next() => event,
            };
            match event {
                Some(Ok(event)) => self.apply(event),
                Some(Err(e)) => {
                    warn!("[Informer] Watch error, waiting for the stream to recover: {}", e)
                }
                None => {
                    warn!("[Informer] Watch stream ended");
                    break;
                }
            }
        }
        info!("[Informer] Stopped watch");
    }

    fn apply(&self, event: WatchEvent<K>) {
        match event {
            WatchEvent::Listed(objects) => self.apply_listing(objects),
            WatchEvent::Applied(obj) => {
                let Some(key) = key_or_warn(&obj) else { return };
                let new = Arc::new(obj);
                match self.store.upsert(key, new.clone()) {
                    Some(old) => self.notify(Notification::Updated { old, new }),
                    None => self.notify(Notification::Added(new)),
                }
            }
            WatchEvent::Deleted(obj) => {
                let Some(key) = key_or_warn(&obj) else { return };
                self.store.remove(&key);
                self.notify(Notification::Deleted(DeletedObject::Live(Arc::new(obj))));
            }
        }
    }

    fn apply_listing(&self, objects: Vec<K>) {
        let listed: Vec<(ResourceKey, Arc<K>)> = objects
            .into_iter()
            .filter_map(|obj| key_or_warn(&obj).map(|key| (key, Arc::new(obj))))
            .collect();
        let count = listed.len();

        let replaced = self.store.replace(listed);
        for (_, old, new) in replaced.upserted {
            match old {
                Some(old) => self.notify(Notification::Updated { old, new }),
                None => self.notify(Notification::Added(new)),
            }
        }
        for (key, last_known) in replaced.removed {
            debug!("[Informer] {} vanished while the watch was down", key);
            self.notify(Notification::Deleted(DeletedObject::FinalStateUnknown {
                key,
                last_known,
            }));
        }

        if !self.store.has_synced() {
            info!("[Informer] Initial listing applied, {} objects cached", count);
        }
        self.store.mark_synced();
    }

    fn notify(&self, notification: Notification<K>) {
        if self.notifications.send(notification).is_err() {
            debug!("[Informer] Router is gone, dropping notification");
        }
    }
}

fn key_or_warn<K: Resource>(obj: &K) -> Option<ResourceKey> {
    match meta_namespace_key(obj) {
        Ok(key) => Some(key),
        Err(e) => {
            warn!("[Informer] Skipping object without a usable key: {}", e);
            None
        }
    }
}
