// ABOUTME: Write-back queue of pending durable operations, one slot per deduplication key.
// ABOUTME: Coalesces repeated writes (last write wins) and decides when a flush is due by size or age.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use insightdeck_core::EntityKind;

use crate::codec::EntityRow;

/// A single durable-store operation.
#[derive(Debug, Clone, PartialEq)]
pub enum Operation {
    Insert(EntityRow),
    Upsert(EntityRow),
    /// Partial update. Carries the full encoded row; only its mutable
    /// columns are written.
    Update(EntityRow),
    Delete { kind: EntityKind, id: String },
}

impl Operation {
    pub fn name(&self) -> &'static str {
        match self {
            Operation::Insert(_) => "insert",
            Operation::Upsert(_) => "upsert",
            Operation::Update(_) => "update",
            Operation::Delete { .. } => "delete",
        }
    }

    pub fn kind(&self) -> EntityKind {
        match self {
            Operation::Insert(row) | Operation::Upsert(row) | Operation::Update(row) => row.kind(),
            Operation::Delete { kind, .. } => *kind,
        }
    }

    /// Durable id of the affected row.
    pub fn id(&self) -> &str {
        match self {
            Operation::Insert(row) | Operation::Upsert(row) | Operation::Update(row) => row.id(),
            Operation::Delete { id, .. } => id,
        }
    }

    /// Deduplication key for this operation's entity.
    pub fn key(&self) -> String {
        dedupe_key(self.kind(), self.id())
    }

    /// Fold a newer operation for the same key into this pending one.
    ///
    /// The newer operation wins, except that an update arriving while an
    /// insert or upsert is still pending keeps the insert kind: the row may
    /// not exist in the durable store yet.
    fn coalesce(self, newer: Operation) -> Operation {
        match (self, newer) {
            (Operation::Insert(_), Operation::Update(row)) => Operation::Insert(row),
            (Operation::Upsert(_), Operation::Update(row)) => Operation::Upsert(row),
            (_, newer) => newer,
        }
    }
}

/// Deduplication key for an entity: one pending slot per entity.
pub fn dedupe_key(kind: EntityKind, id: &str) -> String {
    format!("{}-{}", kind.as_str(), id)
}

/// A queued operation awaiting flush.
#[derive(Debug, Clone)]
pub struct PendingEntry {
    pub op: Operation,
    /// When this key entered the current batch. Coalescing keeps the
    /// original time so a frequently rewritten key still ages out.
    pub enqueued_at: Instant,
    /// Failed attempts so far.
    pub attempts: u32,
}

/// A batch handed to the persistence executor.
pub type Batch = Vec<(String, PendingEntry)>;

/// A retry waiting out its delay. `superseded` is set once a newer write for
/// the same key is enqueued, after which the retry must not be requeued.
#[derive(Debug, Clone, Copy)]
struct RetrySlot {
    ticket: u64,
    superseded: bool,
}

/// Pending operations keyed by deduplication key.
///
/// Coalescing policy: enqueuing a key that is already pending replaces its
/// operation, so only the latest state per key is guaranteed to reach the
/// durable store. Intermediate states may never be written. Memory is bounded
/// by the number of distinct keys touched between flushes.
#[derive(Debug)]
pub struct WriteBackQueue {
    pending: HashMap<String, PendingEntry>,
    retrying: HashMap<String, RetrySlot>,
    next_ticket: u64,
    batch_size: usize,
    max_delay: Duration,
    coalesced: u64,
}

impl WriteBackQueue {
    pub fn new(batch_size: usize, max_delay: Duration) -> Self {
        Self {
            pending: HashMap::new(),
            retrying: HashMap::new(),
            next_ticket: 0,
            batch_size,
            max_delay,
            coalesced: 0,
        }
    }

    /// Queue an operation, replacing any pending operation for the same key.
    /// Returns true when the size trigger has been reached.
    pub fn enqueue(&mut self, key: String, op: Operation) -> bool {
        let now = Instant::now();
        if let Some(slot) = self.retrying.get_mut(&key) {
            slot.superseded = true;
        }
        match self.pending.remove(&key) {
            Some(existing) => {
                self.coalesced += 1;
                tracing::trace!(key = %key, from = existing.op.name(), to = op.name(), "coalesced pending write");
                self.pending.insert(
                    key,
                    PendingEntry {
                        op: existing.op.coalesce(op),
                        enqueued_at: existing.enqueued_at,
                        attempts: 0,
                    },
                );
            }
            None => {
                self.pending.insert(
                    key,
                    PendingEntry {
                        op,
                        enqueued_at: now,
                        attempts: 0,
                    },
                );
            }
        }
        self.size_trigger()
    }

    /// Record that a failed operation for this key will be retried. The
    /// returned ticket must be passed to `requeue`. A write already pending
    /// for the key supersedes the retry straight away.
    pub fn mark_retrying(&mut self, key: &str) -> u64 {
        self.next_ticket += 1;
        self.retrying.insert(
            key.to_string(),
            RetrySlot {
                ticket: self.next_ticket,
                superseded: self.pending.contains_key(key),
            },
        );
        self.next_ticket
    }

    /// Put a failed operation back for another attempt. The retry is dropped
    /// if a newer write for the key was enqueued since `mark_retrying`, even
    /// if that write has already been flushed, or if a later retry for the
    /// same key replaced this ticket. Returns true if the retry was queued.
    pub fn requeue(&mut self, key: String, op: Operation, attempts: u32, ticket: u64) -> bool {
        if self.retrying.get(&key).map(|slot| slot.ticket) != Some(ticket) {
            tracing::debug!(key = %key, "retry replaced by a later one, dropping");
            return false;
        }
        let superseded = self
            .retrying
            .remove(&key)
            .is_some_and(|slot| slot.superseded);
        if superseded || self.pending.contains_key(&key) {
            tracing::debug!(key = %key, "newer write enqueued, dropping stale retry");
            return false;
        }

        self.pending.insert(
            key,
            PendingEntry {
                op,
                enqueued_at: Instant::now(),
                attempts,
            },
        );
        true
    }

    pub fn size_trigger(&self) -> bool {
        self.pending.len() >= self.batch_size
    }

    /// True if any pending entry has waited at least max_delay.
    pub fn age_trigger(&self, now: Instant) -> bool {
        self.pending
            .values()
            .any(|entry| now.saturating_duration_since(entry.enqueued_at) >= self.max_delay)
    }

    pub fn is_due(&self, now: Instant) -> bool {
        !self.pending.is_empty() && (self.size_trigger() || self.age_trigger(now))
    }

    /// Swap out everything pending. Writes queued afterwards start a new batch.
    pub fn take_batch(&mut self) -> Batch {
        std::mem::take(&mut self.pending).into_iter().collect()
    }

    pub fn get(&self, key: &str) -> Option<&PendingEntry> {
        self.pending.get(key)
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// How many enqueues replaced an already-pending operation.
    pub fn coalesced_count(&self) -> u64 {
        self.coalesced
    }
}
