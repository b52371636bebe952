//! Durable retry queue for critical stop operations.
//!
//! Entries are persisted before `enqueue` returns and replayed in enqueue
//! order on startup. Each failed attempt reschedules the entry with
//! jittered exponential backoff; past the per-operation attempt limit the
//! entry moves to the dead-letter list for human attention.

use crate::application::backoff::jittered_backoff;
use crate::domain::errors::EngineResult;
use crate::infrastructure::persistence::store::{RetryEntry, RetryOperation, StateStore};
use anyhow::Result;
use async_trait::async_trait;
use chrono::{Duration as ChronoDuration, Utc};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{error, info, warn};
use uuid::Uuid;

/// Executes a replayed operation. Implemented by the stop-replace layer.
#[async_trait]
pub trait RetryExecutor: Send + Sync {
    async fn execute(
        &self,
        operation: RetryOperation,
        payload: &serde_json::Value,
    ) -> EngineResult<()>;
}

#[derive(Debug, Clone)]
pub struct RetryQueueConfig {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub jitter_frac: f64,
    pub poll_interval: Duration,
}

impl Default for RetryQueueConfig {
    fn default() -> Self {
        Self {
            max_attempts: 10,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            jitter_frac: 0.2,
            poll_interval: Duration::from_millis(500),
        }
    }
}

pub struct RetryQueue {
    store: Arc<StateStore>,
    config: RetryQueueConfig,
}

impl RetryQueue {
    pub fn new(store: Arc<StateStore>, config: RetryQueueConfig) -> Self {
        Self { store, config }
    }

    /// Persists the entry and returns its identifier. The entry is durable
    /// once this returns.
    pub async fn enqueue(
        &self,
        operation: RetryOperation,
        payload: serde_json::Value,
    ) -> Result<String> {
        let entry = RetryEntry {
            id: Uuid::new_v4().to_string(),
            operation,
            payload,
            attempt_count: 0,
            next_attempt_at: Utc::now(),
            dead_letter: false,
        };
        self.store.append_retry_entry(&entry).await?;
        info!("Retry queue: enqueued {:?} as {}", operation, entry.id);
        Ok(entry.id)
    }

    /// Drives the queue until shutdown. Backoff sleeps abort immediately on
    /// shutdown; a partially processed entry stays persisted for next start.
    pub async fn run(&self, executor: Arc<dyn RetryExecutor>, mut shutdown: watch::Receiver<bool>) {
        info!(
            "Retry queue started (max {} attempts per entry)",
            self.config.max_attempts
        );
        loop {
            tokio::select! {
                _ = tokio::time::sleep(self.config.poll_interval) => {
                    self.drain_due(&executor).await;
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("Retry queue stopping");
                        return;
                    }
                }
            }
        }
    }

    /// Attempts every due entry, oldest first.
    pub async fn drain_due(&self, executor: &Arc<dyn RetryExecutor>) {
        let now = Utc::now();
        for entry in self.store.retry_entries().await {
            if entry.next_attempt_at > now {
                continue;
            }
            self.attempt(executor, entry).await;
        }
    }

    async fn attempt(&self, executor: &Arc<dyn RetryExecutor>, mut entry: RetryEntry) {
        match executor.execute(entry.operation, &entry.payload).await {
            Ok(()) => {
                info!(
                    "Retry queue: {:?} {} succeeded on attempt {}",
                    entry.operation,
                    entry.id,
                    entry.attempt_count + 1
                );
                if let Err(e) = self.store.remove_retry_entry(&entry.id).await {
                    error!("Retry queue: failed to remove {}: {:#}", entry.id, e);
                }
            }
            Err(e) => {
                entry.attempt_count += 1;
                if entry.attempt_count >= self.config.max_attempts {
                    entry.dead_letter = true;
                    error!(
                        "Retry queue: {:?} {} exhausted after {} attempts, dead-lettering: {}",
                        entry.operation, entry.id, entry.attempt_count, e
                    );
                } else {
                    let delay = jittered_backoff(
                        self.config.base_delay,
                        self.config.max_delay,
                        entry.attempt_count - 1,
                        self.config.jitter_frac,
                    );
                    entry.next_attempt_at = Utc::now()
                        + ChronoDuration::from_std(delay)
                            .unwrap_or_else(|_| ChronoDuration::seconds(30));
                    warn!(
                        "Retry queue: {:?} {} failed (attempt {}), next in {:.1}s: {}",
                        entry.operation,
                        entry.id,
                        entry.attempt_count,
                        delay.as_secs_f64(),
                        e
                    );
                }
                if let Err(e) = self.store.update_retry_entry(&entry).await {
                    error!("Retry queue: failed to persist {}: {:#}", entry.id, e);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::errors::EngineError;
    use std::sync::Mutex;

    struct ScriptedExecutor {
        /// Outcomes popped front-first; `true` succeeds.
        script: Mutex<Vec<bool>>,
        seen: Mutex<Vec<(RetryOperation, serde_json::Value)>>,
    }

    impl ScriptedExecutor {
        fn new(script: Vec<bool>) -> Arc<Self> {
            Arc::new(Self {
                script: Mutex::new(script),
                seen: Mutex::new(Vec::new()),
            })
        }
    }

    #[async_trait]
    impl RetryExecutor for ScriptedExecutor {
        async fn execute(
            &self,
            operation: RetryOperation,
            payload: &serde_json::Value,
        ) -> EngineResult<()> {
            self.seen.lock().unwrap().push((operation, payload.clone()));
            let mut script = self.script.lock().unwrap();
            let ok = if script.is_empty() { true } else { script.remove(0) };
            if ok {
                Ok(())
            } else {
                Err(EngineError::transient("scripted failure"))
            }
        }
    }

    async fn queue_with_store() -> (RetryQueue, Arc<StateStore>, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(StateStore::open(dir.path().join("state.json")).await.unwrap());
        let config = RetryQueueConfig {
            base_delay: Duration::from_millis(10),
            max_delay: Duration::from_millis(50),
            jitter_frac: 0.0,
            ..RetryQueueConfig::default()
        };
        (RetryQueue::new(store.clone(), config), store, dir)
    }

    #[tokio::test]
    async fn test_success_removes_entry() {
        let (queue, store, _dir) = queue_with_store().await;
        queue
            .enqueue(RetryOperation::PlaceStop, serde_json::json!({"p": 1}))
            .await
            .unwrap();

        let executor = ScriptedExecutor::new(vec![true]);
        queue.drain_due(&(executor.clone() as Arc<dyn RetryExecutor>)).await;

        assert!(store.retry_entries().await.is_empty());
        assert_eq!(executor.seen.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_failure_reschedules_with_backoff() {
        let (queue, store, _dir) = queue_with_store().await;
        queue
            .enqueue(RetryOperation::CancelStop, serde_json::Value::Null)
            .await
            .unwrap();

        let executor = ScriptedExecutor::new(vec![false]);
        queue.drain_due(&(executor as Arc<dyn RetryExecutor>)).await;

        let entries = store.retry_entries().await;
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].attempt_count, 1);
        assert!(entries[0].next_attempt_at > Utc::now());
    }

    #[tokio::test]
    async fn test_exhaustion_dead_letters() {
        let (queue, store, _dir) = queue_with_store().await;
        let queue = RetryQueue::new(
            store.clone(),
            RetryQueueConfig {
                max_attempts: 2,
                base_delay: Duration::from_millis(0),
                jitter_frac: 0.0,
                ..RetryQueueConfig::default()
            },
        );
        queue
            .enqueue(RetryOperation::PlaceStop, serde_json::Value::Null)
            .await
            .unwrap();

        let executor = ScriptedExecutor::new(vec![false, false, false]);
        let executor: Arc<dyn RetryExecutor> = executor;
        queue.drain_due(&executor).await;
        queue.drain_due(&executor).await;

        assert!(store.retry_entries().await.is_empty());
        assert_eq!(store.dead_letters().await.len(), 1);
    }

    #[tokio::test]
    async fn test_entries_attempted_in_enqueue_order() {
        let (queue, _store, _dir) = queue_with_store().await;
        queue
            .enqueue(RetryOperation::PlaceStop, serde_json::json!(1))
            .await
            .unwrap();
        queue
            .enqueue(RetryOperation::CancelStop, serde_json::json!(2))
            .await
            .unwrap();

        let executor = ScriptedExecutor::new(vec![true, true]);
        queue.drain_due(&(executor.clone() as Arc<dyn RetryExecutor>)).await;

        let seen = executor.seen.lock().unwrap();
        assert_eq!(seen[0].1, serde_json::json!(1));
        assert_eq!(seen[1].1, serde_json::json!(2));
    }
}
