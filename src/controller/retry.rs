use crate::cache::key::ResourceKey;
use crate::errors::ControllerError;
use crate::queue::WorkQueue;
use std::sync::Arc;
use tracing::{error, info};

/// Receives errors for keys the controller has given up on.
pub trait ErrorSink: Send + Sync {
    fn report(&self, key: &ResourceKey, err: &ControllerError);
}

/// Logs dropped keys at error level.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingErrorSink;

impl ErrorSink for TracingErrorSink {
    fn report(&self, key: &ResourceKey, err: &ControllerError) {
        error!("[Ingress Monitor] Giving up on {}: {}", key, err);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryOutcome {
    /// Success; backoff history cleared.
    Forgotten,
    /// Failure number `attempt`, scheduled again with backoff.
    Requeued { attempt: u32 },
    /// Too many failures in a row; reported and left alone until the next
    /// change notification for the key.
    Dropped,
}

/// Decides what happens to a key after a reconcile attempt.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    max_retries: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self { max_retries: 5 }
    }
}

impl RetryPolicy {
    pub fn new(max_retries: u32) -> Self {
        Self { max_retries }
    }

    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }

    pub fn handle(
        &self,
        queue: &Arc<WorkQueue>,
        key: &ResourceKey,
        result: Result<(), ControllerError>,
        sink: &dyn ErrorSink,
    ) -> RetryOutcome {
        let err = match result {
            Ok(()) => {
                queue.forget(key);
                return RetryOutcome::Forgotten;
            }
            Err(err) => err,
        };

        let attempt = queue.num_requeues(key).saturating_add(1);
        if attempt < self.max_retries {
            info!("[Ingress Monitor] Error syncing ingress {}: {}", key, err);
            queue.add_rate_limited(key.clone());
            return RetryOutcome::Requeued { attempt };
        }

        queue.forget(key);
        sink.report(key, &err);
        info!(
            "[Ingress Monitor] Dropping ingress {} out of the queue after {} attempts: {}",
            key, attempt, err
        );
        RetryOutcome::Dropped
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::queue::rate_limiter::ItemExponentialFailureRateLimiter;
    use std::sync::Mutex;
    use std::time::Duration;

    /// Collects every report for later inspection.
    #[derive(Default)]
    pub(crate) struct RecordingSink(pub Mutex<Vec<(ResourceKey, String)>>);

    impl RecordingSink {
        pub(crate) fn count(&self, key: &ResourceKey) -> usize {
            self.0.lock().unwrap().iter().filter(|(k, _)| k == key).count()
        }
    }

    impl ErrorSink for RecordingSink {
        fn report(&self, key: &ResourceKey, err: &ControllerError) {
            self.0.lock().unwrap().push((key.clone(), err.to_string()));
        }
    }

    fn failure(key: &ResourceKey) -> Result<(), ControllerError> {
        Err(ControllerError::Reconcile {
            key: key.clone(),
            reason: "boom".to_string(),
        })
    }

    fn queue() -> Arc<WorkQueue> {
        WorkQueue::new(Box::new(ItemExponentialFailureRateLimiter::new(
            Duration::from_millis(5),
            Duration::from_secs(1000),
        )))
    }

    #[tokio::test(start_paused = true)]
    async fn test_success_forgets() {
        let q = queue();
        let sink = RecordingSink::default();
        let key: ResourceKey = "ns/a".parse().unwrap();
        let policy = RetryPolicy::default();

        policy.handle(&q, &key, failure(&key), &sink);
        policy.handle(&q, &key, failure(&key), &sink);
        assert_eq!(q.num_requeues(&key), 2);

        assert_eq!(policy.handle(&q, &key, Ok(()), &sink), RetryOutcome::Forgotten);
        assert_eq!(q.num_requeues(&key), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_drops_after_five_consecutive_failures() {
        let q = queue();
        let sink = RecordingSink::default();
        let key: ResourceKey = "ns/b".parse().unwrap();
        let policy = RetryPolicy::default();

        for i in 1..5 {
            let outcome = policy.handle(&q, &key, failure(&key), &sink);
            assert_eq!(outcome, RetryOutcome::Requeued { attempt: i });
            assert_eq!(q.num_requeues(&key), i);
        }
        assert_eq!(sink.count(&key), 0);

        assert_eq!(policy.handle(&q, &key, failure(&key), &sink), RetryOutcome::Dropped);
        assert_eq!(q.num_requeues(&key), 0);
        assert_eq!(sink.count(&key), 1);

        // A fresh failure episode starts counting from scratch.
        assert_eq!(
            policy.handle(&q, &key, failure(&key), &sink),
            RetryOutcome::Requeued { attempt: 1 }
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_requeued_key_arrives_after_backoff() {
        let q = queue();
        let sink = RecordingSink::default();
        let key: ResourceKey = "ns/c".parse().unwrap();
        let policy = RetryPolicy::default();

        policy.handle(&q, &key, failure(&key), &sink);
        policy.handle(&q, &key, failure(&key), &sink);
        // Second failure waits 10ms.
        tokio::time::sleep(Duration::from_millis(6)).await;
        assert_eq!(q.len(), 1);
        assert_eq!(q.get().await, Some(key.clone()));
        q.done(&key);
        tokio::time::sleep(Duration::from_millis(6)).await;
        assert_eq!(q.len(), 1);
    }
}
