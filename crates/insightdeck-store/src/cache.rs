// ABOUTME: In-memory entity cache holding the authoritative logical state for every entity kind.
// ABOUTME: Primary-key tables per kind plus the email secondary index for users; no I/O, no errors.

use std::collections::HashMap;

use insightdeck_core::{
    EnterpriseInquiry, Entity, GuidedAnalysisOrder, Project, User, email_index_key,
};
use ulid::Ulid;

/// A primary-key table for one entity kind.
#[derive(Debug)]
pub struct Table<T: Entity> {
    rows: HashMap<Ulid, T>,
}

impl<T: Entity> Default for Table<T> {
    fn default() -> Self {
        Self {
            rows: HashMap::new(),
        }
    }
}

impl<T: Entity> Table<T> {
    pub fn get(&self, id: &Ulid) -> Option<&T> {
        self.rows.get(id)
    }

    pub fn get_mut(&mut self, id: &Ulid) -> Option<&mut T> {
        self.rows.get_mut(id)
    }

    pub fn contains(&self, id: &Ulid) -> bool {
        self.rows.contains_key(id)
    }

    /// Insert or replace, returning the previous value.
    pub fn put(&mut self, entity: T) -> Option<T> {
        self.rows.insert(entity.id(), entity)
    }

    pub fn remove(&mut self, id: &Ulid) -> Option<T> {
        self.rows.remove(id)
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Entities matching the filter, newest first.
    pub fn list_where(&self, mut keep: impl FnMut(&T) -> bool) -> Vec<T> {
        let mut out: Vec<T> = self.rows.values().filter(|e| keep(e)).cloned().collect();
        out.sort_by(|a, b| {
            b.created_at()
                .cmp(&a.created_at())
                .then_with(|| b.id().cmp(&a.id()))
        });
        out
    }

    /// All entities, newest first.
    pub fn list(&self) -> Vec<T> {
        self.list_where(|_| true)
    }
}

/// The per-process cache. Callers wrap it in a single lock so that every
/// method here, which updates the primary table and any secondary index
/// together, is observed atomically.
#[derive(Debug, Default)]
pub struct EntityCache {
    users: Table<User>,
    users_by_email: HashMap<String, Ulid>,
    pub projects: Table<Project>,
    pub inquiries: Table<EnterpriseInquiry>,
    pub orders: Table<GuidedAnalysisOrder>,
}

impl EntityCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn user(&self, id: &Ulid) -> Option<&User> {
        self.users.get(id)
    }

    pub fn users(&self) -> &Table<User> {
        &self.users
    }

    pub fn user_by_email(&self, email: &str) -> Option<&User> {
        self.email_owner(email).and_then(|id| self.users.get(&id))
    }

    /// The id of the user owning this email, if any.
    pub fn email_owner(&self, email: &str) -> Option<Ulid> {
        let key = email_index_key(email)?;
        self.users_by_email.get(&key).copied()
    }

    /// Insert or replace a user, keeping the email index in step with the
    /// primary table. A previous email for the same user is unindexed.
    pub fn put_user(&mut self, user: User) -> Option<User> {
        let new_key = user.email_key();
        let id = user.id;
        let previous = self.users.put(user);

        if let Some(old_key) = previous.as_ref().and_then(User::email_key)
            && Some(&old_key) != new_key.as_ref()
            && self.users_by_email.get(&old_key) == Some(&id)
        {
            self.users_by_email.remove(&old_key);
        }
        if let Some(key) = new_key {
            self.users_by_email.insert(key, id);
        }

        previous
    }

    pub fn remove_user(&mut self, id: &Ulid) -> Option<User> {
        let removed = self.users.remove(id)?;
        if let Some(key) = removed.email_key()
            && self.users_by_email.get(&key) == Some(id)
        {
            self.users_by_email.remove(&key);
        }
        Some(removed)
    }

    /// Entity counts per kind, for logging.
    pub fn counts(&self) -> CacheCounts {
        CacheCounts {
            users: self.users.len(),
            projects: self.projects.len(),
            inquiries: self.inquiries.len(),
            orders: self.orders.len(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheCounts {
    pub users: usize,
    pub projects: usize,
    pub inquiries: usize,
    pub orders: usize,
}
