// ABOUTME: The DurableStore trait: the four primitives persistence and hydration need per entity kind.
// ABOUTME: Any relational or document store that can upsert, patch, delete, and scan rows can back the cache.

use async_trait::async_trait;
use insightdeck_core::EntityKind;
use serde_json::{Map, Value};
use thiserror::Error;

use crate::codec::EntityRow;

/// Errors raised by a durable store backend.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("unknown column {column} for table {table}")]
    UnknownColumn { table: &'static str, column: String },

    #[error("blocking store task failed: {0}")]
    Task(#[from] tokio::task::JoinError),

    #[error("store connection lock poisoned")]
    Poisoned,

    #[error("store unavailable: {0}")]
    Unavailable(String),
}

/// The result of scanning one kind: every row that mapped onto the row
/// struct, plus a count of the ones that did not.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RowScan {
    pub rows: Vec<EntityRow>,
    pub skipped: usize,
}

/// Backing store for the hybrid storage layer.
#[async_trait]
pub trait DurableStore: Send + Sync {
    /// Insert the row, or replace every column of an existing row with the same id.
    async fn insert_or_upsert(&self, row: &EntityRow) -> Result<(), StoreError>;

    /// Set the given columns on the row with this id. Returns false when no
    /// row matched.
    async fn update_partial(
        &self,
        kind: EntityKind,
        id: &str,
        fields: &Map<String, Value>,
    ) -> Result<bool, StoreError>;

    /// Delete the row with this id. Deleting a missing row is not an error.
    async fn delete(&self, kind: EntityKind, id: &str) -> Result<(), StoreError>;

    /// Read every row of one kind. A row that cannot be mapped is counted in
    /// `skipped`; only a failure of the read itself is an error.
    async fn select_all(&self, kind: EntityKind) -> Result<RowScan, StoreError>;
}
