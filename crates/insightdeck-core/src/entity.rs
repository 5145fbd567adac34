// ABOUTME: Shared identity for all cached aggregates: the EntityKind tag and the Entity trait.
// ABOUTME: Storage layers use these to key caches, queues, and durable tables without knowing concrete types.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// The independent aggregates managed by storage. Each kind maps to its own
/// cache table and its own durable table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    User,
    Project,
    EnterpriseInquiry,
    GuidedAnalysisOrder,
}

impl EntityKind {
    /// All kinds, in hydration order.
    pub const ALL: [EntityKind; 4] = [
        EntityKind::User,
        EntityKind::Project,
        EntityKind::EnterpriseInquiry,
        EntityKind::GuidedAnalysisOrder,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            EntityKind::User => "user",
            EntityKind::Project => "project",
            EntityKind::EnterpriseInquiry => "enterprise_inquiry",
            EntityKind::GuidedAnalysisOrder => "guided_analysis_order",
        }
    }
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An aggregate that can live in the entity cache.
pub trait Entity: Clone + Send + Sync + 'static {
    const KIND: EntityKind;

    fn id(&self) -> Ulid;

    fn created_at(&self) -> DateTime<Utc>;
}
