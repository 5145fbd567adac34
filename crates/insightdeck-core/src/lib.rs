// ABOUTME: Core library for InsightDeck, containing the domain entities persisted by storage.
// ABOUTME: Defines users, projects, enterprise inquiries, guided-analysis orders, and their inputs.

pub mod entity;
pub mod inquiry;
pub mod order;
pub mod project;
pub mod user;

pub use entity::{Entity, EntityKind};
pub use inquiry::{EnterpriseInquiry, NewEnterpriseInquiry};
pub use order::{GuidedAnalysisOrder, NewGuidedAnalysisOrder};
pub use project::{NewProject, Project, ProjectStatus, ProjectUpdate};
pub use user::{NewUser, UpsertUser, User, UserUpdate, email_index_key, normalize_email};
