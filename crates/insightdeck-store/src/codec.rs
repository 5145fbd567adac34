// ABOUTME: Bidirectional mapping between cached entities and durable row shapes.
// ABOUTME: Handles column renames, null-defaulting on decode, and packing nested documents into JSON text.

use std::collections::BTreeMap;

use chrono::{DateTime, SecondsFormat, Utc};
use insightdeck_core::order::DEFAULT_ORDER_STATUS;
use insightdeck_core::user::DEFAULT_SUBSCRIPTION_TIER;
use insightdeck_core::{
    EnterpriseInquiry, EntityKind, GuidedAnalysisOrder, Project, ProjectStatus, User,
};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;
use ulid::Ulid;

/// Errors that can occur when decoding a durable row into an entity.
#[derive(Debug, Error)]
pub enum CodecError {
    #[error("invalid id in column {column}: {value}")]
    InvalidId { column: &'static str, value: String },

    #[error("invalid timestamp in column {column}: {value}")]
    InvalidTimestamp { column: &'static str, value: String },

    #[error("invalid json in column {column}: {source}")]
    InvalidJson {
        column: &'static str,
        source: serde_json::Error,
    },

    #[error("invalid value in column {column}: {value}")]
    InvalidValue { column: &'static str, value: String },

    #[error("expected a {expected} row, got a {got} row")]
    WrongKind { expected: EntityKind, got: EntityKind },
}

/// Durable shape of a user.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserRow {
    pub id: String,
    pub email: Option<String>,
    pub first_name: Option<String>,
    pub last_name: Option<String>,
    pub profile_image_url: Option<String>,
    pub hashed_password: Option<String>,
    pub subscription_tier: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

/// Durable shape of a project. Nested documents are JSON text.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProjectRow {
    pub id: String,
    pub user_id: Option<String>,
    pub name: String,
    pub file_name: Option<String>,
    pub record_count: Option<i64>,
    pub status: Option<String>,
    pub schema_json: Option<String>,
    pub questions_json: Option<String>,
    pub insights_json: Option<String>,
    pub data_snapshot_json: Option<String>,
    pub analysis_json: Option<String>,
    pub visualizations_json: Option<String>,
    pub is_anonymized: Option<i64>,
    pub created_at: String,
    pub updated_at: String,
}

/// Durable shape of an enterprise inquiry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InquiryRow {
    pub id: String,
    pub company_name: String,
    pub contact_name: String,
    pub contact_email: String,
    pub phone: Option<String>,
    pub company_size: Option<String>,
    pub message: Option<String>,
    pub created_at: String,
}

/// Durable shape of a guided-analysis order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderRow {
    pub id: String,
    pub user_id: Option<String>,
    pub project_id: Option<String>,
    pub questions_json: Option<String>,
    pub status: Option<String>,
    pub amount_cents: Option<i64>,
    pub payment_reference: Option<String>,
    pub created_at: String,
}

/// A row of any durable table. This is the payload carried by the write-back
/// queue and returned by bulk reads.
#[derive(Debug, Clone, PartialEq)]
pub enum EntityRow {
    User(UserRow),
    Project(ProjectRow),
    Inquiry(InquiryRow),
    Order(OrderRow),
}

/// Columns that are never touched by a partial update.
const IMMUTABLE_COLUMNS: [&str; 2] = ["id", "created_at"];

impl EntityRow {
    pub fn kind(&self) -> EntityKind {
        match self {
            EntityRow::User(_) => EntityKind::User,
            EntityRow::Project(_) => EntityKind::Project,
            EntityRow::Inquiry(_) => EntityKind::EnterpriseInquiry,
            EntityRow::Order(_) => EntityKind::GuidedAnalysisOrder,
        }
    }

    pub fn id(&self) -> &str {
        match self {
            EntityRow::User(row) => &row.id,
            EntityRow::Project(row) => &row.id,
            EntityRow::Inquiry(row) => &row.id,
            EntityRow::Order(row) => &row.id,
        }
    }

    /// All columns of the row keyed by durable column name.
    pub fn to_columns(&self) -> Result<Map<String, Value>, serde_json::Error> {
        let value = match self {
            EntityRow::User(row) => serde_json::to_value(row)?,
            EntityRow::Project(row) => serde_json::to_value(row)?,
            EntityRow::Inquiry(row) => serde_json::to_value(row)?,
            EntityRow::Order(row) => serde_json::to_value(row)?,
        };
        match value {
            Value::Object(map) => Ok(map),
            _ => Ok(Map::new()),
        }
    }

    /// The columns a partial update writes: everything except the identity
    /// and creation time.
    pub fn mutable_columns(&self) -> Result<Map<String, Value>, serde_json::Error> {
        let mut columns = self.to_columns()?;
        for column in IMMUTABLE_COLUMNS {
            columns.remove(column);
        }
        Ok(columns)
    }

    /// Rebuild a typed row of the given kind from named columns.
    pub fn from_columns(
        kind: EntityKind,
        columns: Map<String, Value>,
    ) -> Result<Self, serde_json::Error> {
        let value = Value::Object(columns);
        Ok(match kind {
            EntityKind::User => EntityRow::User(serde_json::from_value(value)?),
            EntityKind::Project => EntityRow::Project(serde_json::from_value(value)?),
            EntityKind::EnterpriseInquiry => EntityRow::Inquiry(serde_json::from_value(value)?),
            EntityKind::GuidedAnalysisOrder => EntityRow::Order(serde_json::from_value(value)?),
        })
    }
}

/// Conversion between a cached entity and its durable row.
pub trait RowCodec: Sized {
    fn encode(&self) -> EntityRow;

    fn decode(row: EntityRow) -> Result<Self, CodecError>;
}

fn encode_time(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::AutoSi, true)
}

fn decode_time(column: &'static str, value: &str) -> Result<DateTime<Utc>, CodecError> {
    DateTime::parse_from_rfc3339(value)
        .map(|ts| ts.with_timezone(&Utc))
        .map_err(|_| CodecError::InvalidTimestamp {
            column,
            value: value.to_string(),
        })
}

fn decode_id(column: &'static str, value: &str) -> Result<Ulid, CodecError> {
    value.parse::<Ulid>().map_err(|_| CodecError::InvalidId {
        column,
        value: value.to_string(),
    })
}

fn decode_optional_id(column: &'static str, value: Option<&str>) -> Result<Option<Ulid>, CodecError> {
    value.map(|v| decode_id(column, v)).transpose()
}

// Serializing maps, vectors, and JSON values to a string cannot fail.
fn pack<T: Serialize>(value: &T) -> String {
    serde_json::to_string(value).unwrap_or_else(|_| "null".to_string())
}

fn unpack<T: DeserializeOwned + Default>(
    column: &'static str,
    value: Option<&str>,
) -> Result<T, CodecError> {
    match value {
        None => Ok(T::default()),
        Some(text) => {
            serde_json::from_str(text).map_err(|source| CodecError::InvalidJson { column, source })
        }
    }
}

fn wrong_kind(expected: EntityKind, row: &EntityRow) -> CodecError {
    CodecError::WrongKind {
        expected,
        got: row.kind(),
    }
}

impl RowCodec for User {
    fn encode(&self) -> EntityRow {
        EntityRow::User(UserRow {
            id: self.id.to_string(),
            email: self.email.clone(),
            first_name: self.first_name.clone(),
            last_name: self.last_name.clone(),
            profile_image_url: self.profile_image_url.clone(),
            hashed_password: self.password_hash.clone(),
            subscription_tier: Some(self.subscription_tier.clone()),
            created_at: encode_time(&self.created_at),
            updated_at: encode_time(&self.updated_at),
        })
    }

    fn decode(row: EntityRow) -> Result<Self, CodecError> {
        let EntityRow::User(row) = row else {
            return Err(wrong_kind(EntityKind::User, &row));
        };
        Ok(User {
            id: decode_id("id", &row.id)?,
            email: row.email,
            first_name: row.first_name,
            last_name: row.last_name,
            profile_image_url: row.profile_image_url,
            password_hash: row.hashed_password,
            subscription_tier: row
                .subscription_tier
                .unwrap_or_else(|| DEFAULT_SUBSCRIPTION_TIER.to_string()),
            created_at: decode_time("created_at", &row.created_at)?,
            updated_at: decode_time("updated_at", &row.updated_at)?,
        })
    }
}

impl RowCodec for Project {
    fn encode(&self) -> EntityRow {
        EntityRow::Project(ProjectRow {
            id: self.id.to_string(),
            user_id: self.owner_id.map(|id| id.to_string()),
            name: self.name.clone(),
            file_name: self.file_name.clone(),
            record_count: Some(self.record_count),
            status: Some(self.status.as_str().to_string()),
            schema_json: Some(pack(&self.schema)),
            questions_json: Some(pack(&self.questions)),
            insights_json: Some(pack(&self.insights)),
            data_snapshot_json: Some(pack(&self.data_snapshot)),
            analysis_json: self.analysis_results.as_ref().map(pack),
            visualizations_json: Some(pack(&self.visualizations)),
            is_anonymized: Some(i64::from(self.anonymized)),
            created_at: encode_time(&self.created_at),
            updated_at: encode_time(&self.updated_at),
        })
    }

    fn decode(row: EntityRow) -> Result<Self, CodecError> {
        let EntityRow::Project(row) = row else {
            return Err(wrong_kind(EntityKind::Project, &row));
        };

        let status = match row.status.as_deref() {
            None => ProjectStatus::default(),
            Some(s) => s.parse().map_err(|_| CodecError::InvalidValue {
                column: "status",
                value: s.to_string(),
            })?,
        };
        let analysis_results = match row.analysis_json.as_deref() {
            None => None,
            Some(text) => Some(
                serde_json::from_str::<Value>(text).map_err(|source| CodecError::InvalidJson {
                    column: "analysis_json",
                    source,
                })?,
            ),
        };

        Ok(Project {
            id: decode_id("id", &row.id)?,
            owner_id: decode_optional_id("user_id", row.user_id.as_deref())?,
            name: row.name,
            file_name: row.file_name,
            record_count: row.record_count.unwrap_or(0),
            status,
            schema: unpack::<BTreeMap<String, String>>("schema_json", row.schema_json.as_deref())?,
            questions: unpack("questions_json", row.questions_json.as_deref())?,
            insights: unpack("insights_json", row.insights_json.as_deref())?,
            data_snapshot: unpack("data_snapshot_json", row.data_snapshot_json.as_deref())?,
            analysis_results,
            visualizations: unpack("visualizations_json", row.visualizations_json.as_deref())?,
            anonymized: row.is_anonymized.unwrap_or(0) != 0,
            created_at: decode_time("created_at", &row.created_at)?,
            updated_at: decode_time("updated_at", &row.updated_at)?,
        })
    }
}

impl RowCodec for EnterpriseInquiry {
    fn encode(&self) -> EntityRow {
        EntityRow::Inquiry(InquiryRow {
            id: self.id.to_string(),
            company_name: self.company_name.clone(),
            contact_name: self.contact_name.clone(),
            contact_email: self.email.clone(),
            phone: self.phone.clone(),
            company_size: self.company_size.clone(),
            message: self.message.clone(),
            created_at: encode_time(&self.created_at),
        })
    }

    fn decode(row: EntityRow) -> Result<Self, CodecError> {
        let EntityRow::Inquiry(row) = row else {
            return Err(wrong_kind(EntityKind::EnterpriseInquiry, &row));
        };
        Ok(EnterpriseInquiry {
            id: decode_id("id", &row.id)?,
            company_name: row.company_name,
            contact_name: row.contact_name,
            email: row.contact_email,
            phone: row.phone,
            company_size: row.company_size,
            message: row.message,
            created_at: decode_time("created_at", &row.created_at)?,
        })
    }
}

impl RowCodec for GuidedAnalysisOrder {
    fn encode(&self) -> EntityRow {
        EntityRow::Order(OrderRow {
            id: self.id.to_string(),
            user_id: self.user_id.map(|id| id.to_string()),
            project_id: self.project_id.map(|id| id.to_string()),
            questions_json: Some(pack(&self.questions)),
            status: Some(self.status.clone()),
            amount_cents: Some(self.amount_cents),
            payment_reference: self.payment_reference.clone(),
            created_at: encode_time(&self.created_at),
        })
    }

    fn decode(row: EntityRow) -> Result<Self, CodecError> {
        let EntityRow::Order(row) = row else {
            return Err(wrong_kind(EntityKind::GuidedAnalysisOrder, &row));
        };
        Ok(GuidedAnalysisOrder {
            id: decode_id("id", &row.id)?,
            user_id: decode_optional_id("user_id", row.user_id.as_deref())?,
            project_id: decode_optional_id("project_id", row.project_id.as_deref())?,
            questions: unpack("questions_json", row.questions_json.as_deref())?,
            status: row.status.unwrap_or_else(|| DEFAULT_ORDER_STATUS.to_string()),
            amount_cents: row.amount_cents.unwrap_or(0),
            payment_reference: row.payment_reference,
            created_at: decode_time("created_at", &row.created_at)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use insightdeck_core::{
        NewEnterpriseInquiry, NewGuidedAnalysisOrder, NewProject, NewUser, ProjectUpdate,
    };
    use serde_json::json;

    fn full_user() -> User {
        User::new(NewUser {
            email: Some("ada@example.com".to_string()),
            first_name: Some("Ada".to_string()),
            last_name: Some("Lovelace".to_string()),
            profile_image_url: Some("https://img.example.com/ada.png".to_string()),
            password_hash: Some("$argon2id$v=19$abc".to_string()),
            subscription_tier: Some("pro".to_string()),
        })
    }

    fn full_project(owner: Ulid) -> Project {
        let mut project = Project::new(NewProject {
            owner_id: Some(owner),
            name: "Quarterly Sales".to_string(),
            file_name: Some("sales.csv".to_string()),
            record_count: 1200,
            status: Some(ProjectStatus::Processing),
            schema: BTreeMap::from([
                ("region".to_string(), "string".to_string()),
                ("revenue".to_string(), "float".to_string()),
            ]),
            questions: vec!["Which region is growing?".to_string()],
            insights: BTreeMap::from([(
                "Which region is growing?".to_string(),
                "EMEA leads growth.".to_string(),
            )]),
            data_snapshot: vec![json!({"region": "EMEA", "revenue": 10.5})],
        });
        project.apply(ProjectUpdate {
            analysis_results: Some(json!({"anova": {"f": 4.2, "p": 0.01}})),
            visualizations: Some(vec![json!({"type": "bar", "x": "region"})]),
            anonymized: Some(true),
            ..Default::default()
        });
        project
    }

    #[test]
    fn user_round_trip_preserves_every_field() {
        let user = full_user();
        let decoded = User::decode(user.encode()).unwrap();
        assert_eq!(decoded, user);
    }

    #[test]
    fn user_encode_renames_password_column() {
        let user = full_user();
        let EntityRow::User(row) = user.encode() else {
            panic!("expected user row");
        };
        assert_eq!(row.hashed_password.as_deref(), Some("$argon2id$v=19$abc"));
        assert_eq!(row.id, user.id.to_string());
    }

    #[test]
    fn user_decode_defaults_missing_tier() {
        let user = full_user();
        let EntityRow::User(mut row) = user.encode() else {
            panic!("expected user row");
        };
        row.subscription_tier = None;

        let decoded = User::decode(EntityRow::User(row)).unwrap();
        assert_eq!(decoded.subscription_tier, "free");
    }

    #[test]
    fn project_round_trip_preserves_nested_documents() {
        let project = full_project(Ulid::new());
        let decoded = Project::decode(project.encode()).unwrap();
        assert_eq!(decoded, project);
    }

    #[test]
    fn project_round_trip_without_owner_or_results() {
        let project = Project::new(NewProject {
            name: "Anonymous upload".to_string(),
            ..Default::default()
        });
        let decoded = Project::decode(project.encode()).unwrap();
        assert_eq!(decoded, project);
        assert!(decoded.analysis_results.is_none());
    }

    #[test]
    fn project_record_count_is_stored_unclamped() {
        let mut project = full_project(Ulid::new());
        project.record_count = i64::MAX;
        let EntityRow::Project(row) = project.encode() else {
            panic!("expected project row");
        };
        assert_eq!(row.record_count, Some(i64::MAX));
        assert_eq!(Project::decode(EntityRow::Project(row)).unwrap(), project);
    }

    #[test]
    fn project_decode_defaults_null_columns() {
        let project = full_project(Ulid::new());
        let EntityRow::Project(mut row) = project.encode() else {
            panic!("expected project row");
        };
        row.status = None;
        row.record_count = None;
        row.schema_json = None;
        row.questions_json = None;
        row.insights_json = None;
        row.data_snapshot_json = None;
        row.visualizations_json = None;
        row.is_anonymized = None;

        let decoded = Project::decode(EntityRow::Project(row)).unwrap();
        assert_eq!(decoded.status, ProjectStatus::Active);
        assert_eq!(decoded.record_count, 0);
        assert!(decoded.schema.is_empty());
        assert!(decoded.questions.is_empty());
        assert!(decoded.insights.is_empty());
        assert!(decoded.data_snapshot.is_empty());
        assert!(decoded.visualizations.is_empty());
        assert!(!decoded.anonymized);
    }

    #[test]
    fn project_decode_rejects_unknown_status_and_bad_json() {
        let project = full_project(Ulid::new());
        let EntityRow::Project(row) = project.encode() else {
            panic!("expected project row");
        };

        let mut bad_status = row.clone();
        bad_status.status = Some("exploded".to_string());
        let err = Project::decode(EntityRow::Project(bad_status)).unwrap_err();
        assert!(matches!(err, CodecError::InvalidValue { column: "status", .. }));

        let mut bad_json = row;
        bad_json.schema_json = Some("{not json".to_string());
        let err = Project::decode(EntityRow::Project(bad_json)).unwrap_err();
        assert!(matches!(err, CodecError::InvalidJson { column: "schema_json", .. }));
    }

    #[test]
    fn inquiry_and_order_round_trip() {
        let inquiry = EnterpriseInquiry::new(NewEnterpriseInquiry {
            company_name: "Acme".to_string(),
            contact_name: "Wile E.".to_string(),
            email: "wile@acme.test".to_string(),
            phone: Some("+1 555 0100".to_string()),
            company_size: Some("200-500".to_string()),
            message: Some("We need SSO".to_string()),
        });
        assert_eq!(EnterpriseInquiry::decode(inquiry.encode()).unwrap(), inquiry);

        let order = GuidedAnalysisOrder::new(NewGuidedAnalysisOrder {
            user_id: Some(Ulid::new()),
            project_id: Some(Ulid::new()),
            questions: vec!["What drives churn?".to_string()],
            amount_cents: 9900,
            payment_reference: Some("pi_123".to_string()),
        });
        assert_eq!(GuidedAnalysisOrder::decode(order.encode()).unwrap(), order);
    }

    #[test]
    fn decode_rejects_bad_ids_timestamps_and_wrong_kind() {
        let user = full_user();
        let EntityRow::User(row) = user.encode() else {
            panic!("expected user row");
        };

        let mut bad_id = row.clone();
        bad_id.id = "not-a-ulid".to_string();
        assert!(matches!(
            User::decode(EntityRow::User(bad_id)),
            Err(CodecError::InvalidId { column: "id", .. })
        ));

        let mut bad_time = row;
        bad_time.created_at = "yesterday".to_string();
        assert!(matches!(
            User::decode(EntityRow::User(bad_time)),
            Err(CodecError::InvalidTimestamp { column: "created_at", .. })
        ));

        let project = full_project(user.id);
        assert!(matches!(
            User::decode(project.encode()),
            Err(CodecError::WrongKind { .. })
        ));
    }

    #[test]
    fn mutable_columns_exclude_identity_and_creation_time() {
        let row = full_user().encode();
        let columns = row.mutable_columns().unwrap();

        assert!(!columns.contains_key("id"));
        assert!(!columns.contains_key("created_at"));
        assert!(columns.contains_key("hashed_password"));
        assert!(columns.contains_key("updated_at"));
    }

    #[test]
    fn columns_rebuild_the_same_row() {
        let row = full_project(Ulid::new()).encode();
        let columns = row.to_columns().unwrap();
        let rebuilt = EntityRow::from_columns(EntityKind::Project, columns).unwrap();
        assert_eq!(rebuilt, row);
    }
}
