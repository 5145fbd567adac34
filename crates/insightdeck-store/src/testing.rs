// ABOUTME: In-memory DurableStore with failure injection, for tests of the hybrid storage layer.
// ABOUTME: Can fail writes or bulk reads per entity kind and can hold writes behind a gate to simulate a stuck store.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use insightdeck_core::EntityKind;
use serde_json::{Map, Value};
use tokio::sync::watch;

use crate::codec::EntityRow;
use crate::durable::{DurableStore, RowScan, StoreError};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// A durable store that lives in process memory.
///
/// Every write first waits on the write gate (open by default), then consumes
/// one injected failure for its kind if any are armed.
pub struct MemoryStore {
    tables: Mutex<HashMap<EntityKind, BTreeMap<String, EntityRow>>>,
    write_failures: Mutex<HashMap<EntityKind, u32>>,
    failing_reads: Mutex<HashSet<EntityKind>>,
    gate: watch::Sender<bool>,
    writes: AtomicUsize,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        let (gate, _) = watch::channel(false);
        Self {
            tables: Mutex::new(HashMap::new()),
            write_failures: Mutex::new(HashMap::new()),
            failing_reads: Mutex::new(HashSet::new()),
            gate,
            writes: AtomicUsize::new(0),
        }
    }

    /// Make the next `count` writes for this kind fail.
    pub fn fail_next_writes(&self, kind: EntityKind, count: u32) {
        lock(&self.write_failures).insert(kind, count);
    }

    /// Make every `select_all` for this kind fail until cleared.
    pub fn fail_reads(&self, kind: EntityKind) {
        lock(&self.failing_reads).insert(kind);
    }

    pub fn clear_read_failures(&self) {
        lock(&self.failing_reads).clear();
    }

    /// Hold all writes until `release_writes` is called.
    pub fn block_writes(&self) {
        self.gate.send_replace(true);
    }

    pub fn release_writes(&self) {
        self.gate.send_replace(false);
    }

    /// Successful writes so far.
    pub fn write_count(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }

    /// Place a row directly, bypassing the gate and failure injection.
    pub fn seed(&self, row: EntityRow) {
        lock(&self.tables)
            .entry(row.kind())
            .or_default()
            .insert(row.id().to_string(), row);
    }

    pub fn rows(&self, kind: EntityKind) -> Vec<EntityRow> {
        lock(&self.tables)
            .get(&kind)
            .map(|table| table.values().cloned().collect())
            .unwrap_or_default()
    }

    pub fn row(&self, kind: EntityKind, id: &str) -> Option<EntityRow> {
        lock(&self.tables).get(&kind).and_then(|table| table.get(id).cloned())
    }

    async fn before_write(&self, kind: EntityKind) -> Result<(), StoreError> {
        let mut gate = self.gate.subscribe();
        let _ = gate.wait_for(|blocked| !*blocked).await;

        let mut failures = lock(&self.write_failures);
        if let Some(remaining) = failures.get_mut(&kind)
            && *remaining > 0
        {
            *remaining -= 1;
            return Err(StoreError::Unavailable(format!("injected {kind} write failure")));
        }
        Ok(())
    }

    fn after_write(&self) {
        self.writes.fetch_add(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl DurableStore for MemoryStore {
    async fn insert_or_upsert(&self, row: &EntityRow) -> Result<(), StoreError> {
        self.before_write(row.kind()).await?;
        self.seed(row.clone());
        self.after_write();
        Ok(())
    }

    async fn update_partial(
        &self,
        kind: EntityKind,
        id: &str,
        fields: &Map<String, Value>,
    ) -> Result<bool, StoreError> {
        self.before_write(kind).await?;
        let mut tables = lock(&self.tables);
        let Some(existing) = tables.get_mut(&kind).and_then(|table| table.get_mut(id)) else {
            return Ok(false);
        };

        let mut columns = existing.to_columns()?;
        for (column, value) in fields {
            columns.insert(column.clone(), value.clone());
        }
        *existing = EntityRow::from_columns(kind, columns)?;
        drop(tables);

        self.after_write();
        Ok(true)
    }

    async fn delete(&self, kind: EntityKind, id: &str) -> Result<(), StoreError> {
        self.before_write(kind).await?;
        if let Some(table) = lock(&self.tables).get_mut(&kind) {
            table.remove(id);
        }
        self.after_write();
        Ok(())
    }

    async fn select_all(&self, kind: EntityKind) -> Result<RowScan, StoreError> {
        if lock(&self.failing_reads).contains(&kind) {
            return Err(StoreError::Unavailable(format!("injected {kind} read failure")));
        }
        Ok(RowScan {
            rows: self.rows(kind),
            skipped: 0,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::RowCodec;
    use insightdeck_core::{NewUser, User};
    use std::sync::Arc;
    use std::time::Duration;

    #[tokio::test]
    async fn injected_failures_are_consumed() {
        let store = MemoryStore::new();
        let row = User::new(NewUser::default()).encode();
        store.fail_next_writes(EntityKind::User, 1);

        assert!(store.insert_or_upsert(&row).await.is_err());
        assert!(store.insert_or_upsert(&row).await.is_ok());
        assert_eq!(store.write_count(), 1);
    }

    #[tokio::test]
    async fn gate_holds_writes_until_released() {
        let store = Arc::new(MemoryStore::new());
        let row = User::new(NewUser::default()).encode();
        store.block_writes();

        let writer = {
            let store = Arc::clone(&store);
            let row = row.clone();
            tokio::spawn(async move { store.insert_or_upsert(&row).await })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(store.rows(EntityKind::User).is_empty());

        store.release_writes();
        writer.await.unwrap().unwrap();
        assert_eq!(store.rows(EntityKind::User), vec![row]);
    }

    #[tokio::test]
    async fn failing_reads_error_until_cleared() {
        let store = MemoryStore::new();
        store.fail_reads(EntityKind::Project);

        assert!(store.select_all(EntityKind::Project).await.is_err());
        assert!(store.select_all(EntityKind::User).await.is_ok());

        store.clear_read_failures();
        assert!(store.select_all(EntityKind::Project).await.is_ok());
    }
}
