// ABOUTME: Persistence executor that applies a flushed batch to the durable store.
// ABOUTME: Runs entries concurrently, re-enqueues failures after jittered delays, and dead-letters exhausted ones.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex as StdMutex, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::future::join_all;
use rand::Rng;
use tokio::sync::Mutex;

use crate::config::StorageConfig;
use crate::durable::{DurableStore, StoreError};
use crate::queue::{Batch, Operation, PendingEntry, WriteBackQueue};

/// How failed operations are retried.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub min_delay: Duration,
    pub max_delay: Duration,
    /// Total attempts, including the first, before dead-lettering.
    pub max_attempts: u32,
}

impl RetryPolicy {
    pub fn from_config(config: &StorageConfig) -> Self {
        Self {
            min_delay: config.retry_min,
            max_delay: config.retry_max.max(config.retry_min),
            max_attempts: config.max_attempts.max(1),
        }
    }

    /// A uniformly random delay in [min_delay, max_delay].
    pub fn jitter(&self) -> Duration {
        let min = self.min_delay.as_millis() as u64;
        let max = self.max_delay.as_millis() as u64;
        Duration::from_millis(rand::thread_rng().gen_range(min..=max))
    }
}

/// An operation that failed on every allowed attempt.
#[derive(Debug, Clone)]
pub struct DeadLetter {
    pub key: String,
    pub op: Operation,
    pub attempts: u32,
    pub error: String,
    pub failed_at: DateTime<Utc>,
}

/// Outcome counts for one flushed batch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FlushReport {
    pub attempted: usize,
    pub persisted: usize,
    pub retried: usize,
    pub dead_lettered: usize,
}

impl FlushReport {
    pub fn absorb(&mut self, other: FlushReport) {
        self.attempted += other.attempted;
        self.persisted += other.persisted;
        self.retried += other.retried;
        self.dead_lettered += other.dead_lettered;
    }
}

enum Outcome {
    Persisted,
    Retried,
    DeadLettered,
}

/// Apply a single operation to the durable store.
///
/// Updates fall back to an upsert when no row matched, which happens when the
/// original insert is itself still waiting on a retry.
pub async fn apply(store: &dyn DurableStore, op: &Operation) -> Result<(), StoreError> {
    match op {
        Operation::Insert(row) | Operation::Upsert(row) => store.insert_or_upsert(row).await,
        Operation::Update(row) => {
            let fields = row.mutable_columns()?;
            if !store.update_partial(row.kind(), row.id(), &fields).await? {
                tracing::debug!(kind = %row.kind(), id = row.id(), "update matched no row, upserting");
                store.insert_or_upsert(row).await?;
            }
            Ok(())
        }
        Operation::Delete { kind, id } => store.delete(*kind, id).await,
    }
}

/// Drains batches into the durable store. Cloning shares the store, queue,
/// and dead-letter list.
#[derive(Clone)]
pub struct PersistenceExecutor {
    store: Arc<dyn DurableStore>,
    queue: Arc<Mutex<WriteBackQueue>>,
    policy: RetryPolicy,
    dead_letters: Arc<Mutex<Vec<DeadLetter>>>,
    retries_in_flight: Arc<AtomicUsize>,
    /// Operations handed to the store whose outcome is not known yet.
    in_flight: Arc<StdMutex<HashMap<String, (Operation, u32)>>>,
}

impl PersistenceExecutor {
    pub fn new(
        store: Arc<dyn DurableStore>,
        queue: Arc<Mutex<WriteBackQueue>>,
        policy: RetryPolicy,
    ) -> Self {
        Self {
            store,
            queue,
            policy,
            dead_letters: Arc::new(Mutex::new(Vec::new())),
            retries_in_flight: Arc::new(AtomicUsize::new(0)),
            in_flight: Arc::new(StdMutex::new(HashMap::new())),
        }
    }

    /// Apply every entry of the batch concurrently. One entry failing never
    /// affects the others.
    pub async fn execute(&self, batch: Batch) -> FlushReport {
        let mut report = FlushReport {
            attempted: batch.len(),
            ..Default::default()
        };

        {
            let mut in_flight = self.in_flight();
            for (key, entry) in &batch {
                in_flight.insert(key.clone(), (entry.op.clone(), entry.attempts));
            }
        }

        let outcomes = join_all(
            batch
                .into_iter()
                .map(|(key, entry)| self.execute_one(key, entry)),
        )
        .await;

        for outcome in outcomes {
            match outcome {
                Outcome::Persisted => report.persisted += 1,
                Outcome::Retried => report.retried += 1,
                Outcome::DeadLettered => report.dead_lettered += 1,
            }
        }
        report
    }

    async fn execute_one(&self, key: String, entry: PendingEntry) -> Outcome {
        let result = apply(self.store.as_ref(), &entry.op).await;
        self.in_flight().remove(&key);
        let err = match result {
            Ok(()) => return Outcome::Persisted,
            Err(err) => err,
        };

        let attempts = entry.attempts + 1;
        if attempts >= self.policy.max_attempts {
            tracing::error!(
                key = %key,
                op = entry.op.name(),
                attempts,
                error = %err,
                "persistence failed on final attempt, dead-lettering"
            );
            self.dead_letters.lock().await.push(DeadLetter {
                key,
                op: entry.op,
                attempts,
                error: err.to_string(),
                failed_at: Utc::now(),
            });
            return Outcome::DeadLettered;
        }

        let delay = self.policy.jitter();
        tracing::warn!(
            key = %key,
            op = entry.op.name(),
            attempt = attempts,
            retry_in_ms = delay.as_millis() as u64,
            error = %err,
            "persistence failed, scheduling retry"
        );
        self.schedule_retry(key, entry.op, attempts, delay).await;
        Outcome::Retried
    }

    async fn schedule_retry(&self, key: String, op: Operation, attempts: u32, delay: Duration) {
        let ticket = self.queue.lock().await.mark_retrying(&key);
        let queue = Arc::clone(&self.queue);
        let in_flight = Arc::clone(&self.retries_in_flight);
        in_flight.fetch_add(1, Ordering::SeqCst);

        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            queue.lock().await.requeue(key, op, attempts, ticket);
            in_flight.fetch_sub(1, Ordering::SeqCst);
        });
    }

    /// Give up on everything still in flight plus `leftover`, recording each
    /// operation as a dead letter. Used when shutdown runs out of time; an
    /// abandoned write may still land if its store call was already running.
    pub async fn abandon(&self, leftover: Batch, reason: &str) -> usize {
        let mut abandoned: Vec<(String, Operation, u32)> = self
            .in_flight()
            .drain()
            .map(|(key, (op, attempts))| (key, op, attempts))
            .collect();
        abandoned.extend(
            leftover
                .into_iter()
                .map(|(key, entry)| (key, entry.op, entry.attempts)),
        );

        let count = abandoned.len();
        let mut dead_letters = self.dead_letters.lock().await;
        for (key, op, attempts) in abandoned {
            tracing::error!(key = %key, op = op.name(), attempts, reason, "write abandoned");
            dead_letters.push(DeadLetter {
                key,
                op,
                attempts,
                error: reason.to_string(),
                failed_at: Utc::now(),
            });
        }
        count
    }

    fn in_flight(&self) -> std::sync::MutexGuard<'_, HashMap<String, (Operation, u32)>> {
        self.in_flight.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Retries sleeping out their jitter delay and not yet back in the queue.
    pub fn retries_in_flight(&self) -> usize {
        self.retries_in_flight.load(Ordering::SeqCst)
    }

    pub async fn dead_letters(&self) -> Vec<DeadLetter> {
        self.dead_letters.lock().await.clone()
    }
}
