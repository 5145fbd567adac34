// ABOUTME: Defines the User aggregate plus its create, patch, and identity-provider upsert inputs.
// ABOUTME: Email is the secondary lookup key; normalize_email defines how it is matched.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use ulid::Ulid;

use crate::entity::{Entity, EntityKind};

/// Subscription tier assigned to users that have never purchased a plan.
pub const DEFAULT_SUBSCRIPTION_TIER: &str = "free";

/// A registered account.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct User {
    pub id: Ulid,
    pub email: Option<String>,
    pub first_name: Option<String>,
    pub last_name: Option<String>,
    pub profile_image_url: Option<String>,
    pub password_hash: Option<String>,
    pub subscription_tier: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl User {
    /// Build a new user from create input. Generates a fresh ULID and sets
    /// both timestamps to now.
    pub fn new(input: NewUser) -> Self {
        let now = Utc::now();
        Self {
            id: Ulid::new(),
            email: input.email,
            first_name: input.first_name,
            last_name: input.last_name,
            profile_image_url: input.profile_image_url,
            password_hash: input.password_hash,
            subscription_tier: input
                .subscription_tier
                .unwrap_or_else(|| DEFAULT_SUBSCRIPTION_TIER.to_string()),
            created_at: now,
            updated_at: now,
        }
    }

    /// Merge a patch into this user. Only fields that are Some are changed;
    /// updated_at is always bumped.
    pub fn apply(&mut self, update: UserUpdate) {
        if let Some(email) = update.email {
            self.email = Some(email);
        }
        if let Some(first_name) = update.first_name {
            self.first_name = Some(first_name);
        }
        if let Some(last_name) = update.last_name {
            self.last_name = Some(last_name);
        }
        if let Some(url) = update.profile_image_url {
            self.profile_image_url = Some(url);
        }
        if let Some(hash) = update.password_hash {
            self.password_hash = Some(hash);
        }
        if let Some(tier) = update.subscription_tier {
            self.subscription_tier = tier;
        }
        self.updated_at = Utc::now();
    }

    /// Merge identity-provider profile data into this user. Credentials,
    /// tier, and created_at are left alone.
    pub fn apply_upsert(&mut self, upsert: UpsertUser) {
        self.email = upsert.email;
        self.first_name = upsert.first_name;
        self.last_name = upsert.last_name;
        self.profile_image_url = upsert.profile_image_url;
        self.updated_at = Utc::now();
    }

    /// The normalized email used as the secondary index key. Blank emails
    /// have no key.
    pub fn email_key(&self) -> Option<String> {
        self.email.as_deref().and_then(email_index_key)
    }
}

impl Entity for User {
    const KIND: EntityKind = EntityKind::User;

    fn id(&self) -> Ulid {
        self.id
    }

    fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }
}

/// Emails are matched case-insensitively, ignoring surrounding whitespace.
pub fn normalize_email(email: &str) -> String {
    email.trim().to_lowercase()
}

/// The email index key, or None when the email is blank after normalizing.
pub fn email_index_key(email: &str) -> Option<String> {
    let key = normalize_email(email);
    (!key.is_empty()).then_some(key)
}

/// Input for creating a user.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NewUser {
    pub email: Option<String>,
    pub first_name: Option<String>,
    pub last_name: Option<String>,
    pub profile_image_url: Option<String>,
    pub password_hash: Option<String>,
    pub subscription_tier: Option<String>,
}

/// Partial update for a user. None leaves the field unchanged.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UserUpdate {
    pub email: Option<String>,
    pub first_name: Option<String>,
    pub last_name: Option<String>,
    pub profile_image_url: Option<String>,
    pub password_hash: Option<String>,
    pub subscription_tier: Option<String>,
}

/// Profile data delivered by an identity provider on login. The id is the
/// provider-assigned identity mapped onto a ULID.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpsertUser {
    pub id: Ulid,
    pub email: Option<String>,
    pub first_name: Option<String>,
    pub last_name: Option<String>,
    pub profile_image_url: Option<String>,
}

impl From<UpsertUser> for User {
    fn from(upsert: UpsertUser) -> Self {
        let now = Utc::now();
        Self {
            id: upsert.id,
            email: upsert.email,
            first_name: upsert.first_name,
            last_name: upsert.last_name,
            profile_image_url: upsert.profile_image_url,
            password_hash: None,
            subscription_tier: DEFAULT_SUBSCRIPTION_TIER.to_string(),
            created_at: now,
            updated_at: now,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_user_defaults_tier_and_timestamps() {
        let user = User::new(NewUser {
            email: Some("a@x.com".to_string()),
            ..Default::default()
        });

        assert_eq!(user.subscription_tier, "free");
        assert_eq!(user.created_at, user.updated_at);
        assert!(user.password_hash.is_none());
    }

    #[test]
    fn apply_only_touches_given_fields() {
        let mut user = User::new(NewUser {
            email: Some("a@x.com".to_string()),
            first_name: Some("Ada".to_string()),
            ..Default::default()
        });
        let before = user.updated_at;

        user.apply(UserUpdate {
            last_name: Some("Lovelace".to_string()),
            ..Default::default()
        });

        assert_eq!(user.first_name.as_deref(), Some("Ada"));
        assert_eq!(user.last_name.as_deref(), Some("Lovelace"));
        assert_eq!(user.email.as_deref(), Some("a@x.com"));
        assert!(user.updated_at >= before);
    }

    #[test]
    fn apply_upsert_keeps_credentials_and_tier() {
        let mut user = User::new(NewUser {
            email: Some("old@x.com".to_string()),
            password_hash: Some("hash".to_string()),
            subscription_tier: Some("pro".to_string()),
            ..Default::default()
        });
        let created = user.created_at;

        user.apply_upsert(UpsertUser {
            id: user.id,
            email: Some("new@x.com".to_string()),
            first_name: Some("Grace".to_string()),
            last_name: None,
            profile_image_url: None,
        });

        assert_eq!(user.email.as_deref(), Some("new@x.com"));
        assert_eq!(user.password_hash.as_deref(), Some("hash"));
        assert_eq!(user.subscription_tier, "pro");
        assert_eq!(user.created_at, created);
    }

    #[test]
    fn email_key_is_normalized() {
        let user = User::new(NewUser {
            email: Some("  Ada@Example.COM ".to_string()),
            ..Default::default()
        });
        assert_eq!(user.email_key().as_deref(), Some("ada@example.com"));
    }

    #[test]
    fn blank_email_has_no_key() {
        for email in ["", "   ", "\t"] {
            let user = User::new(NewUser {
                email: Some(email.to_string()),
                ..Default::default()
            });
            assert_eq!(user.email_key(), None, "{email:?}");
        }
    }
}
