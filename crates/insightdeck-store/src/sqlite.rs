// ABOUTME: SQLite-backed DurableStore with one table per entity kind.
// ABOUTME: Provides upsert, partial update, delete, and full-scan reads, run on the blocking thread pool.

use std::path::Path;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use insightdeck_core::EntityKind;
use rusqlite::types::Value as SqlValue;
use rusqlite::{Connection, params, params_from_iter};
use serde_json::{Map, Number, Value};

use crate::codec::EntityRow;
use crate::durable::{DurableStore, RowScan, StoreError};

// Email uniqueness is enforced by the cache. Writes in one batch run
// concurrently, so a UNIQUE constraint here could reject a row whose previous
// owner's email change has not landed yet.

/// Table name and column list for one entity kind. Column order matches the
/// CREATE TABLE statements below and is the whitelist for partial updates.
struct TableDef {
    name: &'static str,
    columns: &'static [&'static str],
}

static USERS: TableDef = TableDef {
    name: "users",
    columns: &[
        "id",
        "email",
        "first_name",
        "last_name",
        "profile_image_url",
        "hashed_password",
        "subscription_tier",
        "created_at",
        "updated_at",
    ],
};

static PROJECTS: TableDef = TableDef {
    name: "projects",
    columns: &[
        "id",
        "user_id",
        "name",
        "file_name",
        "record_count",
        "status",
        "schema_json",
        "questions_json",
        "insights_json",
        "data_snapshot_json",
        "analysis_json",
        "visualizations_json",
        "is_anonymized",
        "created_at",
        "updated_at",
    ],
};

static INQUIRIES: TableDef = TableDef {
    name: "enterprise_inquiries",
    columns: &[
        "id",
        "company_name",
        "contact_name",
        "contact_email",
        "phone",
        "company_size",
        "message",
        "created_at",
    ],
};

static ORDERS: TableDef = TableDef {
    name: "guided_analysis_orders",
    columns: &[
        "id",
        "user_id",
        "project_id",
        "questions_json",
        "status",
        "amount_cents",
        "payment_reference",
        "created_at",
    ],
};

fn table(kind: EntityKind) -> &'static TableDef {
    match kind {
        EntityKind::User => &USERS,
        EntityKind::Project => &PROJECTS,
        EntityKind::EnterpriseInquiry => &INQUIRIES,
        EntityKind::GuidedAnalysisOrder => &ORDERS,
    }
}

fn to_sql(value: &Value) -> SqlValue {
    match value {
        Value::Null => SqlValue::Null,
        Value::Bool(b) => SqlValue::Integer(i64::from(*b)),
        Value::Number(n) => match (n.as_i64(), n.as_f64()) {
            (Some(i), _) => SqlValue::Integer(i),
            (None, Some(f)) => SqlValue::Real(f),
            (None, None) => SqlValue::Text(n.to_string()),
        },
        Value::String(s) => SqlValue::Text(s.clone()),
        other => SqlValue::Text(other.to_string()),
    }
}

fn from_sql(value: SqlValue) -> Value {
    match value {
        SqlValue::Null => Value::Null,
        SqlValue::Integer(i) => Value::from(i),
        SqlValue::Real(f) => Number::from_f64(f).map(Value::Number).unwrap_or(Value::Null),
        SqlValue::Text(s) => Value::String(s),
        SqlValue::Blob(b) => Value::String(String::from_utf8_lossy(&b).into_owned()),
    }
}

/// A SQLite database holding the durable copy of every cached entity.
/// The connection is shared behind a mutex and only touched from
/// `spawn_blocking` tasks.
pub struct SqliteStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteStore {
    /// Open or create a database at the given path and ensure the schema exists.
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        let conn = Connection::open(path)?;
        conn.execute_batch("PRAGMA journal_mode=WAL;")?;
        Self::with_connection(conn)
    }

    /// Open a private in-memory database. Used by tests.
    pub fn open_in_memory() -> Result<Self, StoreError> {
        Self::with_connection(Connection::open_in_memory()?)
    }

    fn with_connection(conn: Connection) -> Result<Self, StoreError> {
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS users (
                id TEXT PRIMARY KEY,
                email TEXT,
                first_name TEXT,
                last_name TEXT,
                profile_image_url TEXT,
                hashed_password TEXT,
                subscription_tier TEXT,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS users_email ON users (email);

            CREATE TABLE IF NOT EXISTS projects (
                id TEXT PRIMARY KEY,
                user_id TEXT,
                name TEXT NOT NULL,
                file_name TEXT,
                record_count INTEGER,
                status TEXT,
                schema_json TEXT,
                questions_json TEXT,
                insights_json TEXT,
                data_snapshot_json TEXT,
                analysis_json TEXT,
                visualizations_json TEXT,
                is_anonymized INTEGER,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS enterprise_inquiries (
                id TEXT PRIMARY KEY,
                company_name TEXT NOT NULL,
                contact_name TEXT NOT NULL,
                contact_email TEXT NOT NULL,
                phone TEXT,
                company_size TEXT,
                message TEXT,
                created_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS guided_analysis_orders (
                id TEXT PRIMARY KEY,
                user_id TEXT,
                project_id TEXT,
                questions_json TEXT,
                status TEXT,
                amount_cents INTEGER,
                payment_reference TEXT,
                created_at TEXT NOT NULL
            );",
        )?;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Run a closure against the connection on the blocking thread pool.
    async fn run<T, F>(&self, f: F) -> Result<T, StoreError>
    where
        T: Send + 'static,
        F: FnOnce(&Connection) -> Result<T, StoreError> + Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let guard = conn.lock().map_err(|_| StoreError::Poisoned)?;
            f(&guard)
        })
        .await?
    }
}

fn upsert_row(conn: &Connection, def: &TableDef, columns: &Map<String, Value>) -> Result<(), StoreError> {
    let placeholders: Vec<String> = (1..=def.columns.len()).map(|i| format!("?{i}")).collect();
    let assignments: Vec<String> = def
        .columns
        .iter()
        .filter(|c| **c != "id")
        .map(|c| format!("{c} = excluded.{c}"))
        .collect();
    let sql = format!(
        "INSERT INTO {} ({}) VALUES ({}) ON CONFLICT(id) DO UPDATE SET {}",
        def.name,
        def.columns.join(", "),
        placeholders.join(", "),
        assignments.join(", "),
    );

    let values: Vec<SqlValue> = def
        .columns
        .iter()
        .map(|c| columns.get(*c).map(to_sql).unwrap_or(SqlValue::Null))
        .collect();
    conn.execute(&sql, params_from_iter(values))?;
    Ok(())
}

fn update_columns(
    conn: &Connection,
    def: &TableDef,
    id: &str,
    fields: &Map<String, Value>,
) -> Result<bool, StoreError> {
    for column in fields.keys() {
        if column == "id" || !def.columns.contains(&column.as_str()) {
            return Err(StoreError::UnknownColumn {
                table: def.name,
                column: column.clone(),
            });
        }
    }

    if fields.is_empty() {
        let exists = conn.query_row(
            &format!("SELECT EXISTS(SELECT 1 FROM {} WHERE id = ?1)", def.name),
            params![id],
            |row| row.get::<_, bool>(0),
        )?;
        return Ok(exists);
    }

    let assignments: Vec<String> = fields
        .keys()
        .enumerate()
        .map(|(i, c)| format!("{c} = ?{}", i + 1))
        .collect();
    let sql = format!(
        "UPDATE {} SET {} WHERE id = ?{}",
        def.name,
        assignments.join(", "),
        fields.len() + 1,
    );

    let mut values: Vec<SqlValue> = fields.values().map(to_sql).collect();
    values.push(SqlValue::Text(id.to_string()));
    let changed = conn.execute(&sql, params_from_iter(values))?;
    Ok(changed > 0)
}

fn select_rows(conn: &Connection, kind: EntityKind) -> Result<RowScan, StoreError> {
    let def = table(kind);
    let mut stmt = conn.prepare(&format!(
        "SELECT {} FROM {}",
        def.columns.join(", "),
        def.name
    ))?;

    let raw = stmt.query_map([], |row| {
        let mut columns = Map::new();
        for (i, name) in def.columns.iter().enumerate() {
            let value: SqlValue = row.get(i)?;
            columns.insert((*name).to_string(), from_sql(value));
        }
        Ok(columns)
    })?;

    let mut scan = RowScan::default();
    for columns in raw {
        let columns = columns?;
        let id = columns
            .get("id")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        match EntityRow::from_columns(kind, columns) {
            Ok(row) => scan.rows.push(row),
            Err(err) => {
                tracing::warn!(table = def.name, id = %id, error = %err, "skipping row that does not match the schema");
                scan.skipped += 1;
            }
        }
    }
    Ok(scan)
}

#[async_trait]
impl DurableStore for SqliteStore {
    async fn insert_or_upsert(&self, row: &EntityRow) -> Result<(), StoreError> {
        let def = table(row.kind());
        let columns = row.to_columns()?;
        self.run(move |conn| upsert_row(conn, def, &columns)).await
    }

    async fn update_partial(
        &self,
        kind: EntityKind,
        id: &str,
        fields: &Map<String, Value>,
    ) -> Result<bool, StoreError> {
        let def = table(kind);
        let id = id.to_string();
        let fields = fields.clone();
        self.run(move |conn| update_columns(conn, def, &id, &fields)).await
    }

    async fn delete(&self, kind: EntityKind, id: &str) -> Result<(), StoreError> {
        let def = table(kind);
        let id = id.to_string();
        self.run(move |conn| {
            conn.execute(
                &format!("DELETE FROM {} WHERE id = ?1", def.name),
                params![id],
            )?;
            Ok(())
        })
        .await
    }

    async fn select_all(&self, kind: EntityKind) -> Result<RowScan, StoreError> {
        self.run(move |conn| select_rows(conn, kind)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::RowCodec;
    use insightdeck_core::{NewProject, NewUser, Project, User, UserUpdate};
    use serde_json::json;
    use std::collections::BTreeMap;
    use tempfile::TempDir;

    fn make_user(email: &str) -> User {
        User::new(NewUser {
            email: Some(email.to_string()),
            first_name: Some("Test".to_string()),
            ..Default::default()
        })
    }

    #[tokio::test]
    async fn sqlite_user_upsert_and_select() {
        let store = SqliteStore::open_in_memory().unwrap();
        let user = make_user("a@x.com");
        store.insert_or_upsert(&user.encode()).await.unwrap();

        let rows = store.select_all(EntityKind::User).await.unwrap().rows;
        assert_eq!(rows.len(), 1);
        assert_eq!(User::decode(rows[0].clone()).unwrap(), user);

        // Upsert with a changed name replaces the row
        let mut updated = user.clone();
        updated.apply(UserUpdate {
            last_name: Some("Changed".to_string()),
            ..Default::default()
        });
        store.insert_or_upsert(&updated.encode()).await.unwrap();

        let rows = store.select_all(EntityKind::User).await.unwrap().rows;
        assert_eq!(rows.len(), 1);
        assert_eq!(User::decode(rows[0].clone()).unwrap(), updated);
    }

    #[tokio::test]
    async fn sqlite_project_round_trip_with_nested_json() {
        let store = SqliteStore::open_in_memory().unwrap();
        let project = Project::new(NewProject {
            owner_id: Some(ulid::Ulid::new()),
            name: "Survey".to_string(),
            record_count: 7,
            schema: BTreeMap::from([("age".to_string(), "integer".to_string())]),
            data_snapshot: vec![json!({"age": 31, "score": 0.75})],
            ..Default::default()
        });
        store.insert_or_upsert(&project.encode()).await.unwrap();

        let rows = store.select_all(EntityKind::Project).await.unwrap().rows;
        assert_eq!(Project::decode(rows[0].clone()).unwrap(), project);
    }

    #[tokio::test]
    async fn sqlite_partial_update_reports_matches() {
        let store = SqliteStore::open_in_memory().unwrap();
        let mut user = make_user("b@x.com");

        // No row yet
        let matched = store
            .update_partial(EntityKind::User, &user.id.to_string(), &user.encode().mutable_columns().unwrap())
            .await
            .unwrap();
        assert!(!matched);

        store.insert_or_upsert(&user.encode()).await.unwrap();
        user.apply(UserUpdate {
            first_name: Some("Patched".to_string()),
            ..Default::default()
        });
        let matched = store
            .update_partial(EntityKind::User, &user.id.to_string(), &user.encode().mutable_columns().unwrap())
            .await
            .unwrap();
        assert!(matched);

        let rows = store.select_all(EntityKind::User).await.unwrap().rows;
        assert_eq!(User::decode(rows[0].clone()).unwrap(), user);
    }

    #[tokio::test]
    async fn sqlite_partial_update_rejects_unknown_columns() {
        let store = SqliteStore::open_in_memory().unwrap();
        let mut fields = Map::new();
        fields.insert("email; DROP TABLE users".to_string(), json!("x"));

        let err = store
            .update_partial(EntityKind::User, "01ARZ3NDEKTSV4RRFFQ69G5FAV", &fields)
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::UnknownColumn { table: "users", .. }));
    }

    #[tokio::test]
    async fn sqlite_delete_is_idempotent() {
        let store = SqliteStore::open_in_memory().unwrap();
        let user = make_user("c@x.com");
        store.insert_or_upsert(&user.encode()).await.unwrap();

        store.delete(EntityKind::User, &user.id.to_string()).await.unwrap();
        store.delete(EntityKind::User, &user.id.to_string()).await.unwrap();

        assert!(store.select_all(EntityKind::User).await.unwrap().rows.is_empty());
    }

    #[tokio::test]
    async fn sqlite_persists_across_reopen() {
        let dir = TempDir::new().unwrap();
        let db_path = dir.path().join("insightdeck.db");
        let user = make_user("d@x.com");

        {
            let store = SqliteStore::open(&db_path).unwrap();
            store.insert_or_upsert(&user.encode()).await.unwrap();
        }

        let store = SqliteStore::open(&db_path).unwrap();
        let rows = store.select_all(EntityKind::User).await.unwrap().rows;
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].id(), user.id.to_string());
    }

    #[tokio::test]
    async fn sqlite_bad_row_is_skipped_and_neighbours_load() {
        let store = SqliteStore::open_in_memory().unwrap();
        let good = Project::new(NewProject {
            name: "Good".to_string(),
            ..Default::default()
        });
        let bad = Project::new(NewProject {
            name: "Bad".to_string(),
            ..Default::default()
        });
        store.insert_or_upsert(&good.encode()).await.unwrap();
        store.insert_or_upsert(&bad.encode()).await.unwrap();

        // Text in an integer column cannot be mapped onto ProjectRow
        let mut fields = Map::new();
        fields.insert("is_anonymized".to_string(), json!("yes"));
        let matched = store
            .update_partial(EntityKind::Project, &bad.id.to_string(), &fields)
            .await
            .unwrap();
        assert!(matched);

        let scan = store.select_all(EntityKind::Project).await.unwrap();
        assert_eq!(scan.skipped, 1);
        assert_eq!(scan.rows.len(), 1);
        assert_eq!(Project::decode(scan.rows[0].clone()).unwrap(), good);
    }

    #[tokio::test]
    async fn sqlite_missing_table_fails_the_kind() {
        let store = SqliteStore::open_in_memory().unwrap();
        store
            .conn
            .lock()
            .unwrap()
            .execute_batch("DROP TABLE projects;")
            .unwrap();

        let err = store.select_all(EntityKind::Project).await.unwrap_err();
        assert!(matches!(err, StoreError::Sqlite(_)));
        assert!(store.select_all(EntityKind::User).await.is_ok());
    }
}
