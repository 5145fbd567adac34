// ABOUTME: Defines EnterpriseInquiry, an append-only record of a sales contact request.
// ABOUTME: Inquiries are created and listed, never updated or deleted.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use ulid::Ulid;

use crate::entity::{Entity, EntityKind};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnterpriseInquiry {
    pub id: Ulid,
    pub company_name: String,
    pub contact_name: String,
    pub email: String,
    pub phone: Option<String>,
    pub company_size: Option<String>,
    pub message: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl EnterpriseInquiry {
    pub fn new(input: NewEnterpriseInquiry) -> Self {
        Self {
            id: Ulid::new(),
            company_name: input.company_name,
            contact_name: input.contact_name,
            email: input.email,
            phone: input.phone,
            company_size: input.company_size,
            message: input.message,
            created_at: Utc::now(),
        }
    }
}

impl Entity for EnterpriseInquiry {
    const KIND: EntityKind = EntityKind::EnterpriseInquiry;

    fn id(&self) -> Ulid {
        self.id
    }

    fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NewEnterpriseInquiry {
    pub company_name: String,
    pub contact_name: String,
    pub email: String,
    pub phone: Option<String>,
    pub company_size: Option<String>,
    pub message: Option<String>,
}
