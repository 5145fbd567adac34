// ABOUTME: Hybrid storage layer for InsightDeck: an in-memory entity cache with write-back persistence.
// ABOUTME: Provides the codec, cache, queue, executor, hydration, SQLite backend, and the HybridStorage API.

pub mod cache;
pub mod codec;
pub mod config;
pub mod durable;
pub mod error;
pub mod executor;
pub mod hydrate;
pub mod queue;
pub mod sqlite;
pub mod storage;
pub mod testing;

pub use cache::{CacheCounts, EntityCache};
pub use codec::{CodecError, EntityRow, RowCodec};
pub use config::{ConfigError, StorageConfig};
pub use durable::{DurableStore, RowScan, StoreError};
pub use error::StorageError;
pub use executor::{DeadLetter, FlushReport, RetryPolicy};
pub use hydrate::HydrationReport;
pub use queue::{Operation, WriteBackQueue};
pub use sqlite::SqliteStore;
pub use storage::HybridStorage;
