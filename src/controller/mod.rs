pub mod retry;

use crate::cache::{Indexer, Store};
use crate::config::Settings;
use crate::errors::ControllerError;
use crate::informer::{EventStream, Informer};
use crate::queue::rate_limiter::{default_controller_rate_limiter, RateLimiter};
use crate::queue::WorkQueue;
use crate::reconcile::Reconciler;
use crate::router;
use futures::FutureExt;
use kube::Resource;
use retry::{ErrorSink, RetryOutcome, RetryPolicy, TracingErrorSink};
use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::unbounded_channel;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

const SYNC_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Wires the informer, router, work queue and workers together.
///
/// Build it, hand `indexer()` to the reconciler, then `run` it.
pub struct Controller<K> {
    events: EventStream<K>,
    store: Arc<Store<K>>,
    queue: Arc<WorkQueue>,
    retry: RetryPolicy,
    error_sink: Arc<dyn ErrorSink>,
    sync_timeout: Duration,
}

impl<K> Controller<K>
where
    K: Resource + Send + Sync + 'static,
{
    pub fn new(events: EventStream<K>, settings: &Settings) -> Self {
        let rate_limiter = default_controller_rate_limiter(
            settings.base_delay(),
            settings.max_delay(),
            settings.qps,
            settings.burst,
        );
        Self::with_rate_limiter(events, settings, Box::new(rate_limiter))
    }

    pub fn with_rate_limiter(
        events: EventStream<K>,
        settings: &Settings,
        rate_limiter: Box<dyn RateLimiter>,
    ) -> Self {
        Self {
            events,
            store: Arc::new(Store::new()),
            queue: WorkQueue::new(rate_limiter),
            retry: RetryPolicy::new(settings.max_retries),
            error_sink: Arc::new(TracingErrorSink),
            sync_timeout: settings.sync_timeout(),
        }
    }

    pub fn with_error_sink(mut self, error_sink: Arc<dyn ErrorSink>) -> Self {
        self.error_sink = error_sink;
        self
    }

    pub fn indexer(&self) -> Arc<dyn Indexer<K>> {
        self.store.clone()
    }

    pub fn queue(&self) -> Arc<WorkQueue> {
        self.queue.clone()
    }

    /// Starts the watch, waits for the first full listing, then runs
    /// `workers` reconcile loops until `stop` fires.
    ///
    /// Returns once every worker has drained and exited. Fails only if the
    /// cache does not sync within the configured timeout, in which case no
    /// worker is ever started.
    pub async fn run(
        self,
        reconciler: Arc<dyn Reconciler>,
        workers: usize,
        stop: CancellationToken,
    ) -> Result<(), ControllerError> {
        info!("[Ingress Monitor] Starting controller");

        let watch_stop = stop.child_token();
        let (tx, rx) = unbounded_channel();
        let informer = Informer::new(self.events, self.store.clone(), tx);
        let informer_task = tokio::spawn(informer.run(watch_stop.clone()));
        let router_task = tokio::spawn(router::run(rx, self.queue.clone(), watch_stop.clone()));
        let background = [informer_task, router_task];

        let synced = tokio::select! {
            _ = stop.cancelled() => None,
            result = wait_for_cache_sync::<K, _>(self.store.as_ref(), self.sync_timeout) => Some(result),
        };
        match synced {
            Some(Ok(())) => {}
            Some(Err(e)) => {
                error!("[Ingress Monitor] {}", e);
                shut_down(&self.queue, &watch_stop, Vec::new(), background).await;
                return Err(e);
            }
            None => {
                info!("[Ingress Monitor] Stopped before caches synced");
                shut_down(&self.queue, &watch_stop, Vec::new(), background).await;
                return Ok(());
            }
        }

        let workers = workers.max(1);
        info!("[Ingress Monitor] Caches synced, starting {} workers", workers);
        let handles = (0..workers)
            .map(|id| {
                let worker = Worker {
                    id,
                    queue: self.queue.clone(),
                    reconciler: reconciler.clone(),
                    retry: self.retry,
                    error_sink: self.error_sink.clone(),
                };
                tokio::spawn(worker.run())
            })
            .collect();

        stop.cancelled().await;
        info!("[Ingress Monitor] Stopping controller");
        shut_down(&self.queue, &watch_stop, handles, background).await;
        info!("[Ingress Monitor] All workers stopped");
        Ok(())
    }
}

/// Polls `has_synced` until it is true or `timeout` elapses.
pub async fn wait_for_cache_sync<K, I>(indexer: &I, timeout: Duration) -> Result<(), ControllerError>
where
    I: Indexer<K> + ?Sized,
{
    let poll = async {
        let mut ticker = tokio::time::interval(SYNC_POLL_INTERVAL);
        loop {
            ticker.tick().await;
            if indexer.has_synced() {
                return;
            }
        }
    };
    tokio::time::timeout(timeout, poll)
        .await
        .map_err(|_| ControllerError::SyncTimeout(timeout))
}

async fn shut_down(
    queue: &WorkQueue,
    watch_stop: &CancellationToken,
    workers: Vec<JoinHandle<()>>,
    background: [JoinHandle<()>; 2],
) {
    queue.shut_down();
    for (id, handle) in workers.into_iter().enumerate() {
        if let Err(e) = handle.await {
            error!("[Ingress Monitor] Worker {} exited abnormally: {}", id, e);
        }
    }
    watch_stop.cancel();
    for handle in background {
        if let Err(e) = handle.await {
            error!("[Ingress Monitor] Background task exited abnormally: {}", e);
        }
    }
}

struct Worker {
    id: usize,
    queue: Arc<WorkQueue>,
    reconciler: Arc<dyn Reconciler>,
    retry: RetryPolicy,
    error_sink: Arc<dyn ErrorSink>,
}

impl Worker {
    async fn run(self) {
        debug!("[Ingress Monitor] Worker {} started", self.id);
        while self.process_next_item().await {}
        debug!("[Ingress Monitor] Worker {} terminated", self.id);
    }

    /// Handles one key. Returns false once the queue has shut down.
    async fn process_next_item(&self) -> bool {
        let Some(key) = self.queue.get().await else {
            return false;
        };

        let result = AssertUnwindSafe(self.reconciler.reconcile(&key))
            .catch_unwind()
            .await
            .unwrap_or_else(|panic| {
                Err(ControllerError::Panicked {
                    key: key.clone(),
                    message: panic_message(panic.as_ref()),
                })
            });

        let outcome = self
            .retry
            .handle(&self.queue, &key, result, self.error_sink.as_ref());
        // Only now may another worker pick the key up.
        self.queue.done(&key);
        match outcome {
            RetryOutcome::Forgotten => debug!("[Ingress Monitor] Worker {} synced {}", self.id, key),
            RetryOutcome::Requeued { attempt } => debug!(
                "[Ingress Monitor] Worker {} requeued {} after attempt {}",
                self.id, key, attempt
            ),
            RetryOutcome::Dropped => debug!("[Ingress Monitor] Worker {} dropped {}", self.id, key),
        }
        true
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::retry::tests::RecordingSink;
    use super::*;
    use crate::cache::key::ResourceKey;
    use crate::informer::WatchEvent;
    use crate::reconcile::tests::SharedBuffer;
    use crate::reconcile::ChangePrinter;
    use async_trait::async_trait;
    use dashmap::DashMap;
    use futures::channel::mpsc;
    use futures::StreamExt;
    use k8s_openapi::api::networking::v1::Ingress;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
    use std::collections::HashSet;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::Mutex;

    type Events = mpsc::UnboundedSender<Result<WatchEvent<Ingress>, ControllerError>>;

    fn ingress(ns: &str, name: &str, version: &str) -> Ingress {
        Ingress {
            metadata: ObjectMeta {
                namespace: Some(ns.to_string()),
                name: Some(name.to_string()),
                resource_version: Some(version.to_string()),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    fn key(s: &str) -> ResourceKey {
        s.parse().unwrap()
    }

    fn settings() -> Settings {
        Settings {
            sync_timeout_secs: 5,
            ..Settings::default()
        }
    }

    fn controller() -> (Events, Controller<Ingress>) {
        let (events, rx) = mpsc::unbounded();
        (events, Controller::new(rx.boxed(), &settings()))
    }

    async fn eventually(mut condition: impl FnMut() -> bool) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while !condition() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("condition not reached in time");
    }

    /// Fails every attempt while `failing` is set, and records overlapping
    /// attempts on the same key.
    #[derive(Default)]
    struct Flaky {
        failing: AtomicBool,
        attempts: DashMap<ResourceKey, usize>,
        in_flight: Mutex<HashSet<ResourceKey>>,
        overlaps: AtomicUsize,
    }

    impl Flaky {
        fn attempts(&self, key: &ResourceKey) -> usize {
            self.attempts.get(key).map(|n| *n).unwrap_or(0)
        }
    }

    #[async_trait]
    impl Reconciler for Flaky {
        async fn reconcile(&self, key: &ResourceKey) -> Result<(), ControllerError> {
            if !self.in_flight.lock().unwrap().insert(key.clone()) {
                self.overlaps.fetch_add(1, Ordering::SeqCst);
            }
            *self.attempts.entry(key.clone()).or_insert(0) += 1;
            tokio::time::sleep(Duration::from_millis(1)).await;
            self.in_flight.lock().unwrap().remove(key);

            if self.failing.load(Ordering::SeqCst) {
                Err(ControllerError::Reconcile {
                    key: key.clone(),
                    reason: "upstream unavailable".to_string(),
                })
            } else {
                Ok(())
            }
        }
    }

    #[tokio::test]
    async fn test_add_then_delete_is_reported() {
        let (events, controller) = controller();
        let buffer = SharedBuffer::default();
        let printer = Arc::new(ChangePrinter::new(
            controller.indexer(),
            Box::new(buffer.clone()),
        ));
        let indexer = controller.indexer();
        let queue = controller.queue();
        let stop = CancellationToken::new();
        let run = tokio::spawn(controller.run(printer, 2, stop.clone()));

        events.unbounded_send(Ok(WatchEvent::Listed(vec![]))).unwrap();
        events
            .unbounded_send(Ok(WatchEvent::Applied(ingress("ns", "a", "1"))))
            .unwrap();
        eventually(|| buffer.lines().len() == 1).await;
        assert_eq!(buffer.lines()[0], "Something changed in ingress ns/a");
        assert!(indexer.get_by_key(&key("ns/a")).unwrap().is_some());
        assert_eq!(queue.num_requeues(&key("ns/a")), 0);

        events
            .unbounded_send(Ok(WatchEvent::Deleted(ingress("ns", "a", "1"))))
            .unwrap();
        eventually(|| buffer.lines().len() == 2).await;
        assert_eq!(buffer.lines()[1], "Ingress ns/a does not exist anymore");
        assert!(indexer.get_by_key(&key("ns/a")).unwrap().is_none());

        stop.cancel();
        run.await.unwrap().unwrap();
        // Exactly one absent-branch run for the one delete.
        assert_eq!(buffer.lines().len(), 2);
    }

    #[tokio::test]
    async fn test_persistent_failure_is_dropped_then_recovers() {
        let (events, controller) = controller();
        let sink = Arc::new(RecordingSink::default());
        let controller = controller.with_error_sink(sink.clone());
        let flaky = Arc::new(Flaky::default());
        flaky.failing.store(true, Ordering::SeqCst);
        let queue = controller.queue();
        let stop = CancellationToken::new();
        let run = tokio::spawn(controller.run(flaky.clone(), 1, stop.clone()));
        let b = key("ns/b");

        events.unbounded_send(Ok(WatchEvent::Listed(vec![]))).unwrap();
        events
            .unbounded_send(Ok(WatchEvent::Applied(ingress("ns", "b", "1"))))
            .unwrap();

        eventually(|| sink.count(&b) == 1).await;
        assert_eq!(flaky.attempts(&b), 5);
        assert_eq!(queue.num_requeues(&b), 0);

        // Dropped means dropped: nothing comes back on its own.
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(flaky.attempts(&b), 5);
        assert_eq!(sink.count(&b), 1);
        assert!(queue.is_empty());

        // A new change brings the key back with a clean slate.
        flaky.failing.store(false, Ordering::SeqCst);
        events
            .unbounded_send(Ok(WatchEvent::Applied(ingress("ns", "b", "2"))))
            .unwrap();
        eventually(|| flaky.attempts(&b) == 6).await;
        eventually(|| queue.is_empty()).await;
        assert_eq!(queue.num_requeues(&b), 0);
        assert_eq!(sink.count(&b), 1);

        stop.cancel();
        run.await.unwrap().unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_unreachable_store_times_out() {
        let flaky = Arc::new(Flaky::default());
        let controller: Controller<Ingress> =
            Controller::new(futures::stream::pending().boxed(), &settings());
        let result = controller
            .run(flaky.clone(), 2, CancellationToken::new())
            .await;

        assert!(matches!(result, Err(ControllerError::SyncTimeout(_))));
        assert!(flaky.attempts.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_before_sync_is_clean() {
        let flaky = Arc::new(Flaky::default());
        let controller: Controller<Ingress> =
            Controller::new(futures::stream::pending().boxed(), &settings());
        let stop = CancellationToken::new();
        let run = tokio::spawn(controller.run(flaky.clone(), 2, stop.clone()));
        tokio::time::sleep(Duration::from_secs(1)).await;
        stop.cancel();
        assert!(run.await.unwrap().is_ok());
        assert!(flaky.attempts.is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_never_two_workers_on_one_key() {
        let (events, controller) = controller();
        let flaky = Arc::new(Flaky::default());
        let queue = controller.queue();
        let stop = CancellationToken::new();
        let run = tokio::spawn(controller.run(flaky.clone(), 4, stop.clone()));

        events.unbounded_send(Ok(WatchEvent::Listed(vec![]))).unwrap();
        for version in 0..50 {
            for name in ["a", "b", "c"] {
                events
                    .unbounded_send(Ok(WatchEvent::Applied(ingress(
                        "ns",
                        name,
                        &version.to_string(),
                    ))))
                    .unwrap();
            }
            tokio::task::yield_now().await;
        }

        eventually(|| {
            ["ns/a", "ns/b", "ns/c"]
                .iter()
                .all(|k| flaky.attempts(&key(k)) > 0)
        })
        .await;
        stop.cancel();
        run.await.unwrap().unwrap();

        assert_eq!(flaky.overlaps.load(Ordering::SeqCst), 0);
        assert!(queue.is_empty());
    }

    struct PanicsOnce {
        panicked: AtomicBool,
        successes: AtomicUsize,
    }

    #[async_trait]
    impl Reconciler for PanicsOnce {
        async fn reconcile(&self, _key: &ResourceKey) -> Result<(), ControllerError> {
            if !self.panicked.swap(true, Ordering::SeqCst) {
                panic!("first attempt explodes");
            }
            self.successes.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_panicking_reconcile_is_retried() {
        let (events, controller) = controller();
        let sink = Arc::new(RecordingSink::default());
        let controller = controller.with_error_sink(sink.clone());
        let reconciler = Arc::new(PanicsOnce {
            panicked: AtomicBool::new(false),
            successes: AtomicUsize::new(0),
        });
        let stop = CancellationToken::new();
        let run = tokio::spawn(controller.run(reconciler.clone(), 1, stop.clone()));

        events
            .unbounded_send(Ok(WatchEvent::Listed(vec![ingress("ns", "p", "1")])))
            .unwrap();
        eventually(|| reconciler.successes.load(Ordering::SeqCst) == 1).await;
        assert_eq!(sink.count(&key("ns/p")), 0);

        stop.cancel();
        run.await.unwrap().unwrap();
    }

    #[test]
    fn test_panic_message() {
        assert_eq!(panic_message(&"static"), "static");
        assert_eq!(panic_message(&String::from("owned")), "owned");
        assert_eq!(panic_message(&42u8), "unknown panic");
    }
}
