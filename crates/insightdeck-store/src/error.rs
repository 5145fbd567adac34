// ABOUTME: Errors returned to callers of the public storage API.
// ABOUTME: Persistence failures never surface here; they are retried and logged by the executor.

use insightdeck_core::EntityKind;
use thiserror::Error;
use ulid::Ulid;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum StorageError {
    #[error("{kind} not found: {id}")]
    NotFound { kind: EntityKind, id: Ulid },

    #[error("email already in use: {0}")]
    EmailTaken(String),
}
