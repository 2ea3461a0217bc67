use crate::cache::key::{deletion_handling_key, meta_namespace_key};
use crate::informer::Notification;
use crate::queue::WorkQueue;
use kube::Resource;
use std::sync::Arc;
use tokio::sync::mpsc::UnboundedReceiver;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Turns one notification into a queued key.
///
/// Updates are keyed off the new object and never diffed: any change means
/// "look at this key again". Notifications without a usable key are dropped,
/// there is nothing to retry them with.
pub fn route<K: Resource>(notification: &Notification<K>, queue: &WorkQueue) {
    let (kind, key) = match notification {
        Notification::Added(obj) => ("add", meta_namespace_key(obj.as_ref())),
        Notification::Updated { new, .. } => ("update", meta_namespace_key(new.as_ref())),
        Notification::Deleted(deleted) => ("delete", deletion_handling_key(deleted)),
    };
    match key {
        Ok(key) => {
            debug!("[Router] {} {}", kind, key);
            queue.add(key);
        }
        Err(e) => warn!("[Router] Dropping {} notification: {}", kind, e),
    }
}

/// Routes notifications until the channel closes or `stop` fires.
pub async fn run<K: Resource>(
    mut notifications: UnboundedReceiver<Notification<K>>,
    queue: Arc<WorkQueue>,
    stop: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = stop.cancelled() => break,
            notification = notifications.recv() => match notification {
                Some(notification) => route(&notification, &queue),
                None => break,
            },
        }
    }
    debug!("[Router] Stopped");
}
