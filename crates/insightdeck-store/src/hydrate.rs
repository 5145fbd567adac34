// ABOUTME: Startup hydration: loads every durable row into the entity cache before traffic is served.
// ABOUTME: A failed bulk read skips that kind and a row that fails to decode is skipped; hydration always completes.

use chrono::Utc;
use insightdeck_core::{EnterpriseInquiry, Entity, EntityKind, GuidedAnalysisOrder, Project, User};

use crate::cache::EntityCache;
use crate::codec::RowCodec;
use crate::durable::DurableStore;

/// What hydration loaded and what it had to skip.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HydrationReport {
    pub users: usize,
    pub projects: usize,
    pub inquiries: usize,
    pub orders: usize,
    /// Rows that failed to decode and were left out of the cache.
    pub skipped_rows: usize,
    /// Users whose email was already held by an older user. Their email was
    /// cleared in the cache and the correction queued.
    pub email_conflicts: usize,
    /// Kinds whose bulk read failed; treated as having zero rows.
    pub failed_kinds: Vec<EntityKind>,
}

impl HydrationReport {
    pub fn total(&self) -> usize {
        self.users + self.projects + self.inquiries + self.orders
    }

    /// True when nothing was skipped or corrected.
    pub fn is_complete(&self) -> bool {
        self.skipped_rows == 0 && self.email_conflicts == 0 && self.failed_kinds.is_empty()
    }
}

/// Decoded entities read from the durable store, not yet in the cache.
#[derive(Debug, Default)]
pub struct Hydrated {
    users: Vec<User>,
    projects: Vec<Project>,
    inquiries: Vec<EnterpriseInquiry>,
    orders: Vec<GuidedAnalysisOrder>,
    skipped_rows: usize,
    failed_kinds: Vec<EntityKind>,
}

impl Hydrated {
    /// Read and decode every kind. Each kind is read independently.
    pub async fn load(store: &dyn DurableStore) -> Self {
        let mut skipped_rows = 0;
        let mut failed_kinds = Vec::new();
        let users = load_kind(store, &mut skipped_rows, &mut failed_kinds).await;
        let projects = load_kind(store, &mut skipped_rows, &mut failed_kinds).await;
        let inquiries = load_kind(store, &mut skipped_rows, &mut failed_kinds).await;
        let orders = load_kind(store, &mut skipped_rows, &mut failed_kinds).await;
        Self {
            users,
            projects,
            inquiries,
            orders,
            skipped_rows,
            failed_kinds,
        }
    }

    /// Insert everything into the cache, rebuilding secondary indexes.
    ///
    /// When several durable users share an email the oldest keeps it and the
    /// others lose it. Those corrected users are returned so the caller can
    /// persist the change.
    pub fn install(self, cache: &mut EntityCache) -> (HydrationReport, Vec<User>) {
        let mut report = HydrationReport {
            users: self.users.len(),
            projects: self.projects.len(),
            inquiries: self.inquiries.len(),
            orders: self.orders.len(),
            skipped_rows: self.skipped_rows,
            email_conflicts: 0,
            failed_kinds: self.failed_kinds,
        };

        let mut users = self.users;
        users.sort_by(|a, b| (a.created_at, a.id).cmp(&(b.created_at, b.id)));
        let mut corrected = Vec::new();
        for mut user in users {
            if let Some(email) = user.email.as_deref()
                && let Some(owner) = cache.email_owner(email)
                && owner != user.id
            {
                tracing::warn!(email = %email, kept_by = %owner, cleared_on = %user.id, "duplicate email in durable store, clearing it on the newer user");
                user.email = None;
                user.updated_at = Utc::now();
                corrected.push(user.clone());
                report.email_conflicts += 1;
            }
            cache.put_user(user);
        }
        for project in self.projects {
            cache.projects.put(project);
        }
        for inquiry in self.inquiries {
            cache.inquiries.put(inquiry);
        }
        for order in self.orders {
            cache.orders.put(order);
        }

        (report, corrected)
    }
}

async fn load_kind<T: Entity + RowCodec>(
    store: &dyn DurableStore,
    skipped_rows: &mut usize,
    failed_kinds: &mut Vec<EntityKind>,
) -> Vec<T> {
    let rows = match store.select_all(T::KIND).await {
        Ok(scan) => {
            *skipped_rows += scan.skipped;
            scan.rows
        }
        Err(err) => {
            tracing::warn!(kind = %T::KIND, error = %err, "bulk read failed during hydration, continuing without this kind");
            failed_kinds.push(T::KIND);
            return Vec::new();
        }
    };

    let mut entities = Vec::with_capacity(rows.len());
    for row in rows {
        let id = row.id().to_string();
        match T::decode(row) {
            Ok(entity) => entities.push(entity),
            Err(err) => {
                tracing::warn!(kind = %T::KIND, id = %id, error = %err, "skipping row that failed to decode");
                *skipped_rows += 1;
            }
        }
    }

    tracing::debug!(kind = %T::KIND, count = entities.len(), "hydrated kind");
    entities
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::EntityRow;
    use crate::testing::MemoryStore;
    use insightdeck_core::{NewEnterpriseInquiry, NewProject, NewUser};

    fn user(email: &str) -> User {
        User::new(NewUser {
            email: Some(email.to_string()),
            ..Default::default()
        })
    }

    #[tokio::test]
    async fn hydrate_loads_all_kinds_and_rebuilds_email_index() {
        let store = MemoryStore::new();
        let u = user("a@x.com");
        let p = Project::new(NewProject {
            owner_id: Some(u.id),
            name: "Sales".to_string(),
            ..Default::default()
        });
        let i = EnterpriseInquiry::new(NewEnterpriseInquiry {
            company_name: "Acme".to_string(),
            contact_name: "Road Runner".to_string(),
            email: "rr@acme.test".to_string(),
            ..Default::default()
        });
        store.seed(u.encode());
        store.seed(p.encode());
        store.seed(i.encode());

        let mut cache = EntityCache::new();
        let (report, _) = Hydrated::load(&store).await.install(&mut cache);

        assert!(report.is_complete());
        assert_eq!(report.total(), 3);
        assert_eq!(cache.user(&u.id), Some(&u));
        assert_eq!(cache.user_by_email("a@x.com").map(|found| found.id), Some(u.id));
        assert_eq!(cache.projects.get(&p.id), Some(&p));
        assert_eq!(cache.inquiries.get(&i.id), Some(&i));
    }

    #[tokio::test]
    async fn failed_kind_is_skipped_and_others_load() {
        let store = MemoryStore::new();
        let u = user("b@x.com");
        let p = Project::new(NewProject {
            name: "Lost".to_string(),
            ..Default::default()
        });
        store.seed(u.encode());
        store.seed(p.encode());
        store.fail_reads(EntityKind::Project);

        let mut cache = EntityCache::new();
        let (report, _) = Hydrated::load(&store).await.install(&mut cache);

        assert_eq!(report.failed_kinds, vec![EntityKind::Project]);
        assert_eq!(report.users, 1);
        assert_eq!(report.projects, 0);
        assert!(cache.user(&u.id).is_some());
        assert!(cache.projects.get(&p.id).is_none());
    }

    #[tokio::test]
    async fn undecodable_row_is_skipped() {
        let store = MemoryStore::new();
        let good = user("c@x.com");
        let EntityRow::User(mut bad) = user("d@x.com").encode() else {
            panic!("expected user row");
        };
        bad.created_at = "not a timestamp".to_string();
        store.seed(good.encode());
        store.seed(EntityRow::User(bad));

        let mut cache = EntityCache::new();
        let (report, _) = Hydrated::load(&store).await.install(&mut cache);

        assert_eq!(report.users, 1);
        assert_eq!(report.skipped_rows, 1);
        assert!(!report.is_complete());
        assert!(cache.user_by_email("c@x.com").is_some());
        assert!(cache.user_by_email("d@x.com").is_none());
    }

    #[tokio::test]
    async fn duplicate_emails_keep_the_oldest_owner() {
        let store = MemoryStore::new();
        let mut older = user("dup@x.com");
        older.created_at -= chrono::Duration::seconds(60);
        let newer = user("DUP@x.com ");
        let other = user("solo@x.com");
        store.seed(newer.encode());
        store.seed(older.encode());
        store.seed(other.encode());

        let mut cache = EntityCache::new();
        let (report, corrected) = Hydrated::load(&store).await.install(&mut cache);

        assert_eq!(report.users, 3);
        assert_eq!(report.email_conflicts, 1);
        assert!(!report.is_complete());
        assert_eq!(corrected.len(), 1);
        assert_eq!(corrected[0].id, newer.id);
        assert_eq!(corrected[0].email, None);

        assert_eq!(cache.user_by_email("dup@x.com").map(|u| u.id), Some(older.id));
        assert_eq!(cache.user(&newer.id).and_then(|u| u.email.clone()), None);
        for cached in cache.users().list() {
            if let Some(email) = cached.email.as_deref() {
                assert_eq!(cache.user_by_email(email).map(|u| u.id), Some(cached.id));
            }
        }
    }
}
