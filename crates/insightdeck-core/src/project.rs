// ABOUTME: Defines the Project aggregate: an uploaded dataset with its inferred schema and analysis output.
// ABOUTME: Nested documents (schema, insights, snapshot, results) are held as typed maps and JSON values.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use ulid::Ulid;

use crate::entity::{Entity, EntityKind};

/// Lifecycle state of a project.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProjectStatus {
    Processing,
    #[default]
    Active,
    Archived,
    Failed,
}

impl ProjectStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProjectStatus::Processing => "processing",
            ProjectStatus::Active => "active",
            ProjectStatus::Archived => "archived",
            ProjectStatus::Failed => "failed",
        }
    }
}

impl fmt::Display for ProjectStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Returned when a status string is not one of the known lifecycle states.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown project status: {0}")]
pub struct UnknownStatus(pub String);

impl FromStr for ProjectStatus {
    type Err = UnknownStatus;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "processing" => Ok(ProjectStatus::Processing),
            "active" => Ok(ProjectStatus::Active),
            "archived" => Ok(ProjectStatus::Archived),
            "failed" => Ok(ProjectStatus::Failed),
            other => Err(UnknownStatus(other.to_string())),
        }
    }
}

/// An uploaded dataset owned (optionally) by a user, together with everything
/// derived from it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Project {
    pub id: Ulid,
    pub owner_id: Option<Ulid>,
    pub name: String,
    pub file_name: Option<String>,
    pub record_count: i64,
    pub status: ProjectStatus,
    /// Column name to inferred type ("integer", "float", "datetime", "string").
    pub schema: BTreeMap<String, String>,
    pub questions: Vec<String>,
    /// Business question to generated insight text.
    pub insights: BTreeMap<String, String>,
    /// A small sample of the uploaded records.
    pub data_snapshot: Vec<Value>,
    pub analysis_results: Option<Value>,
    pub visualizations: Vec<Value>,
    pub anonymized: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Project {
    /// Build a new project from create input with a fresh ULID and timestamps.
    pub fn new(input: NewProject) -> Self {
        let now = Utc::now();
        Self {
            id: Ulid::new(),
            owner_id: input.owner_id,
            name: input.name,
            file_name: input.file_name,
            record_count: input.record_count,
            status: input.status.unwrap_or_default(),
            schema: input.schema,
            questions: input.questions,
            insights: input.insights,
            data_snapshot: input.data_snapshot,
            analysis_results: None,
            visualizations: Vec::new(),
            anonymized: false,
            created_at: now,
            updated_at: now,
        }
    }

    /// Merge a patch into this project and bump updated_at.
    pub fn apply(&mut self, update: ProjectUpdate) {
        if let Some(name) = update.name {
            self.name = name;
        }
        if let Some(owner_id) = update.owner_id {
            self.owner_id = Some(owner_id);
        }
        if let Some(status) = update.status {
            self.status = status;
        }
        if let Some(count) = update.record_count {
            self.record_count = count;
        }
        if let Some(schema) = update.schema {
            self.schema = schema;
        }
        if let Some(questions) = update.questions {
            self.questions = questions;
        }
        if let Some(insights) = update.insights {
            self.insights = insights;
        }
        if let Some(snapshot) = update.data_snapshot {
            self.data_snapshot = snapshot;
        }
        if let Some(results) = update.analysis_results {
            self.analysis_results = Some(results);
        }
        if let Some(visualizations) = update.visualizations {
            self.visualizations = visualizations;
        }
        if let Some(anonymized) = update.anonymized {
            self.anonymized = anonymized;
        }
        self.updated_at = Utc::now();
    }
}

impl Entity for Project {
    const KIND: EntityKind = EntityKind::Project;

    fn id(&self) -> Ulid {
        self.id
    }

    fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }
}

/// Input for creating a project after an upload has been parsed.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NewProject {
    pub owner_id: Option<Ulid>,
    pub name: String,
    pub file_name: Option<String>,
    pub record_count: i64,
    pub status: Option<ProjectStatus>,
    pub schema: BTreeMap<String, String>,
    pub questions: Vec<String>,
    pub insights: BTreeMap<String, String>,
    pub data_snapshot: Vec<Value>,
}

/// Partial update for a project. None leaves the field unchanged.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProjectUpdate {
    pub name: Option<String>,
    pub owner_id: Option<Ulid>,
    pub status: Option<ProjectStatus>,
    pub record_count: Option<i64>,
    pub schema: Option<BTreeMap<String, String>>,
    pub questions: Option<Vec<String>>,
    pub insights: Option<BTreeMap<String, String>>,
    pub data_snapshot: Option<Vec<Value>>,
    pub analysis_results: Option<Value>,
    pub visualizations: Option<Vec<Value>>,
    pub anonymized: Option<bool>,
}
