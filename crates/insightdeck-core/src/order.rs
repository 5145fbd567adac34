// ABOUTME: Defines GuidedAnalysisOrder, an append-only purchase of analyst-guided work on a project.
// ABOUTME: Orders reference a user and project loosely; nothing enforces that either still exists.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use ulid::Ulid;

use crate::entity::{Entity, EntityKind};

/// Status assigned to orders that have not been picked up by an analyst.
pub const DEFAULT_ORDER_STATUS: &str = "pending";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GuidedAnalysisOrder {
    pub id: Ulid,
    pub user_id: Option<Ulid>,
    pub project_id: Option<Ulid>,
    pub questions: Vec<String>,
    pub status: String,
    pub amount_cents: i64,
    pub payment_reference: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl GuidedAnalysisOrder {
    pub fn new(input: NewGuidedAnalysisOrder) -> Self {
        Self {
            id: Ulid::new(),
            user_id: input.user_id,
            project_id: input.project_id,
            questions: input.questions,
            status: DEFAULT_ORDER_STATUS.to_string(),
            amount_cents: input.amount_cents,
            payment_reference: input.payment_reference,
            created_at: Utc::now(),
        }
    }
}

impl Entity for GuidedAnalysisOrder {
    const KIND: EntityKind = EntityKind::GuidedAnalysisOrder;

    fn id(&self) -> Ulid {
        self.id
    }

    fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NewGuidedAnalysisOrder {
    pub user_id: Option<Ulid>,
    pub project_id: Option<Ulid>,
    pub questions: Vec<String>,
    pub amount_cents: i64,
    pub payment_reference: Option<String>,
}
