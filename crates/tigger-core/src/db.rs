//! Async SQLite-backed persistence for projects, users, auth, schemes,
//! annotations, features, models, logs, tokens, and generations.
//!
//! Mirrors the shape of `db.py`'s `DatabaseManager`: one connection, one
//! table per entity, short-lived transactions per call. Every write opens
//! and commits inside its own `Connection::call` closure.

use std::path::Path;

use chrono::{DateTime, Utc};
use rusqlite::OptionalExtension;
use tokio_rusqlite::Connection;
use uuid::Uuid;

use crate::types::*;

pub struct Db {
    conn: Connection,
}

/// A row from the shared `models` table, before the caller narrows it into
/// a `QuickModel` or `LanguageModel` by `model_kind`.
#[derive(Debug, Clone)]
pub struct ModelRow {
    pub project_slug: Slug,
    pub name: String,
    pub model_kind: String,
    pub scheme: String,
    pub user: String,
    pub status: String,
    pub hyperparameters: serde_json::Value,
    pub metrics: ModelMetrics,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, thiserror::Error)]
pub enum DbError {
    #[error("not found: {0}")]
    NotFound(String),
    #[error("already exists: {0}")]
    AlreadyExists(String),
    #[error(transparent)]
    Sqlite(#[from] tokio_rusqlite::Error),
}

fn enum_to_sql<T: serde::Serialize>(val: &T) -> String {
    let s = serde_json::to_string(val).expect("serialize enum");
    s.trim_matches('"').to_string()
}

fn enum_from_sql<T: serde::de::DeserializeOwned>(raw: &str) -> T {
    let quoted = format!("\"{}\"", raw);
    serde_json::from_str(&quoted).expect("deserialize enum")
}

fn parse_rfc3339(s: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(s)
        .expect("valid timestamp")
        .with_timezone(&Utc)
}

impl Db {
    pub async fn new(path: impl AsRef<Path>) -> Result<Self, DbError> {
        let conn = Connection::open(path.as_ref()).await?;
        let db = Self { conn };
        db.init_schema().await?;
        Ok(db)
    }

    pub async fn new_in_memory() -> Result<Self, DbError> {
        let conn = Connection::open_in_memory().await?;
        let db = Self { conn };
        db.init_schema().await?;
        Ok(db)
    }

    async fn init_schema(&self) -> Result<(), DbError> {
        self.conn
            .call(|conn| {
                conn.execute_batch(
                    "
                    PRAGMA journal_mode=WAL;
                    PRAGMA synchronous=NORMAL;
                    PRAGMA foreign_keys=ON;
                    PRAGMA busy_timeout=5000;

                    CREATE TABLE IF NOT EXISTS projects (
                        slug        TEXT PRIMARY KEY,
                        created_by  TEXT NOT NULL,
                        created_at  TEXT NOT NULL,
                        params      TEXT NOT NULL
                    );

                    CREATE TABLE IF NOT EXISTS users (
                        user_name      TEXT PRIMARY KEY,
                        password_hash  TEXT NOT NULL,
                        role           TEXT NOT NULL,
                        created_by     TEXT,
                        mail           TEXT,
                        created_at     TEXT NOT NULL,
                        deactivated_at TEXT
                    );

                    CREATE TABLE IF NOT EXISTS auths (
                        user         TEXT NOT NULL,
                        project_slug TEXT NOT NULL,
                        status       TEXT NOT NULL,
                        PRIMARY KEY (user, project_slug)
                    );

                    CREATE TABLE IF NOT EXISTS schemes (
                        project_slug TEXT NOT NULL,
                        name         TEXT NOT NULL,
                        kind         TEXT NOT NULL,
                        labels       TEXT NOT NULL,
                        codebook     TEXT,
                        PRIMARY KEY (project_slug, name)
                    );

                    CREATE TABLE IF NOT EXISTS annotations (
                        id           TEXT PRIMARY KEY,
                        timestamp    TEXT NOT NULL,
                        dataset      TEXT NOT NULL,
                        user         TEXT NOT NULL,
                        project_slug TEXT NOT NULL,
                        element_id   TEXT NOT NULL,
                        scheme       TEXT NOT NULL,
                        annotation   TEXT,
                        comment      TEXT NOT NULL
                    );

                    CREATE INDEX IF NOT EXISTS idx_annotations_lookup
                        ON annotations(project_slug, scheme, element_id, user, timestamp);

                    CREATE TABLE IF NOT EXISTS features (
                        project_slug TEXT NOT NULL,
                        name         TEXT NOT NULL,
                        kind         TEXT NOT NULL,
                        owner        TEXT NOT NULL,
                        parameters   TEXT NOT NULL,
                        columns      TEXT NOT NULL,
                        PRIMARY KEY (project_slug, name)
                    );

                    CREATE TABLE IF NOT EXISTS models (
                        project_slug     TEXT NOT NULL,
                        name             TEXT NOT NULL,
                        model_kind       TEXT NOT NULL, -- 'quick' | 'language'
                        scheme           TEXT NOT NULL,
                        user             TEXT NOT NULL,
                        status           TEXT NOT NULL,
                        hyperparameters  TEXT NOT NULL,
                        metrics          TEXT NOT NULL,
                        created_at       TEXT NOT NULL,
                        PRIMARY KEY (project_slug, name)
                    );

                    CREATE TABLE IF NOT EXISTS logs (
                        id           TEXT PRIMARY KEY,
                        time         TEXT NOT NULL,
                        user         TEXT NOT NULL,
                        project_slug TEXT,
                        action       TEXT NOT NULL
                    );

                    CREATE INDEX IF NOT EXISTS idx_logs_time ON logs(time);
                    CREATE INDEX IF NOT EXISTS idx_logs_user ON logs(user);

                    CREATE TABLE IF NOT EXISTS tokens (
                        token  TEXT PRIMARY KEY,
                        status TEXT NOT NULL,
                        time   TEXT NOT NULL
                    );

                    CREATE TABLE IF NOT EXISTS generations (
                        id           TEXT PRIMARY KEY,
                        time         TEXT NOT NULL,
                        user         TEXT NOT NULL,
                        project_slug TEXT NOT NULL,
                        element_id   TEXT NOT NULL,
                        prompt_name  TEXT NOT NULL,
                        answer       TEXT NOT NULL
                    );
                    ",
                )?;
                Ok(())
            })
            .await?;
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Projects
    // -----------------------------------------------------------------------

    pub async fn add_project(&self, project: &Project) -> Result<(), DbError> {
        let slug = project.slug.clone();
        let created_by = project.created_by.clone();
        let created_at = project.created_at.to_rfc3339();
        let params = serde_json::to_string(&project.params).expect("serialize params");

        self.conn
            .call(move |conn| {
                conn.execute(
                    "INSERT INTO projects (slug, created_by, created_at, params) VALUES (?1,?2,?3,?4)",
                    rusqlite::params![slug, created_by, created_at, params],
                )?;
                Ok(())
            })
            .await
            .map_err(|e| map_unique(e, "project"))?;
        Ok(())
    }

    pub async fn get_project(&self, slug: &str) -> Result<Option<Project>, DbError> {
        let slug = slug.to_string();
        let row = self
            .conn
            .call(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT slug, created_by, created_at, params FROM projects WHERE slug = ?1",
                )?;
                let mut rows = stmt.query(rusqlite::params![slug])?;
                match rows.next()? {
                    Some(row) => Ok(Some((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, String>(3)?,
                    ))),
                    None => Ok(None),
                }
            })
            .await?;
        Ok(row.map(|(slug, created_by, created_at, params)| Project {
            slug,
            created_by,
            created_at: parse_rfc3339(&created_at),
            params: serde_json::from_str(&params).expect("valid params json"),
        }))
    }

    pub async fn list_projects(&self) -> Result<Vec<Slug>, DbError> {
        Ok(self
            .conn
            .call(|conn| {
                let mut stmt = conn.prepare("SELECT slug FROM projects ORDER BY slug")?;
                let out = stmt
                    .query_map([], |r| r.get::<_, String>(0))?
                    .filter_map(Result::ok)
                    .collect();
                Ok(out)
            })
            .await?)
    }

    /// Cascades deletions across every per-project table.
    pub async fn delete_project(&self, slug: &str) -> Result<(), DbError> {
        let slug = slug.to_string();
        self.conn
            .call(move |conn| {
                let tx = conn.transaction()?;
                for table in [
                    "auths", "schemes", "annotations", "features", "models", "generations",
                ] {
                    tx.execute(
                        &format!("DELETE FROM {table} WHERE project_slug = ?1"),
                        rusqlite::params![slug],
                    )?;
                }
                tx.execute("DELETE FROM logs WHERE project_slug = ?1", rusqlite::params![slug])?;
                tx.execute("DELETE FROM projects WHERE slug = ?1", rusqlite::params![slug])?;
                tx.commit()?;
                Ok(())
            })
            .await?;
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Users
    // -----------------------------------------------------------------------

    pub async fn add_user(&self, user: &User) -> Result<(), DbError> {
        let u = user.clone();
        self.conn
            .call(move |conn| {
                conn.execute(
                    "INSERT INTO users (user_name, password_hash, role, created_by, mail, created_at, deactivated_at)
                     VALUES (?1,?2,?3,?4,?5,?6,?7)",
                    rusqlite::params![
                        u.user_name,
                        u.password_hash,
                        u.role,
                        u.created_by,
                        u.mail,
                        u.created_at.to_rfc3339(),
                        u.deactivated_at.map(|d| d.to_rfc3339()),
                    ],
                )?;
                Ok(())
            })
            .await
            .map_err(|e| map_unique(e, "user"))?;
        Ok(())
    }

    pub async fn get_user(&self, user_name: &str) -> Result<Option<User>, DbError> {
        let user_name = user_name.to_string();
        Ok(self
            .conn
            .call(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT user_name, password_hash, role, created_by, mail, created_at, deactivated_at
                     FROM users WHERE user_name = ?1",
                )?;
                let mut rows = stmt.query(rusqlite::params![user_name])?;
                match rows.next()? {
                    Some(row) => Ok(Some(row_to_user(row)?)),
                    None => Ok(None),
                }
            })
            .await?)
    }

    pub async fn delete_user(&self, user_name: &str) -> Result<(), DbError> {
        let user_name = user_name.to_string();
        self.conn
            .call(move |conn| {
                conn.execute("DELETE FROM users WHERE user_name = ?1", rusqlite::params![user_name])?;
                Ok(())
            })
            .await?;
        Ok(())
    }

    pub async fn change_password(&self, user_name: &str, password_hash: &str) -> Result<(), DbError> {
        let user_name = user_name.to_string();
        let password_hash = password_hash.to_string();
        self.conn
            .call(move |conn| {
                conn.execute(
                    "UPDATE users SET password_hash = ?2 WHERE user_name = ?1",
                    rusqlite::params![user_name, password_hash],
                )?;
                Ok(())
            })
            .await?;
        Ok(())
    }

    pub async fn get_users_created_by(&self, user_name: &str) -> Result<Vec<User>, DbError> {
        let user_name = user_name.to_string();
        Ok(self
            .conn
            .call(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT user_name, password_hash, role, created_by, mail, created_at, deactivated_at
                     FROM users WHERE created_by = ?1",
                )?;
                let mut rows = stmt.query(rusqlite::params![user_name])?;
                let mut out = Vec::new();
                while let Some(row) = rows.next()? {
                    out.push(row_to_user(row)?);
                }
                Ok(out)
            })
            .await?)
    }

    // -----------------------------------------------------------------------
    // Auth
    // -----------------------------------------------------------------------

    pub async fn add_auth(&self, auth: &Auth) -> Result<(), DbError> {
        let a = auth.clone();
        let status = enum_to_sql(&a.status);
        self.conn
            .call(move |conn| {
                conn.execute(
                    "INSERT INTO auths (user, project_slug, status) VALUES (?1,?2,?3)
                     ON CONFLICT(user, project_slug) DO UPDATE SET status=excluded.status",
                    rusqlite::params![a.user, a.project_slug, status],
                )?;
                Ok(())
            })
            .await?;
        Ok(())
    }

    pub async fn delete_auth(&self, user: &str, project_slug: &str) -> Result<(), DbError> {
        let (user, project_slug) = (user.to_string(), project_slug.to_string());
        self.conn
            .call(move |conn| {
                conn.execute(
                    "DELETE FROM auths WHERE user = ?1 AND project_slug = ?2",
                    rusqlite::params![user, project_slug],
                )?;
                Ok(())
            })
            .await?;
        Ok(())
    }

    pub async fn get_project_auth(&self, project_slug: &str) -> Result<Vec<Auth>, DbError> {
        let project_slug = project_slug.to_string();
        Ok(self
            .conn
            .call(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT user, project_slug, status FROM auths WHERE project_slug = ?1",
                )?;
                let mut rows = stmt.query(rusqlite::params![project_slug])?;
                let mut out = Vec::new();
                while let Some(row) = rows.next()? {
                    out.push(row_to_auth(row)?);
                }
                Ok(out)
            })
            .await?)
    }

    pub async fn get_user_auth(&self, user: &str, project_slug: &str) -> Result<Option<Auth>, DbError> {
        let (user, project_slug) = (user.to_string(), project_slug.to_string());
        Ok(self
            .conn
            .call(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT user, project_slug, status FROM auths WHERE user = ?1 AND project_slug = ?2",
                )?;
                let mut rows = stmt.query(rusqlite::params![user, project_slug])?;
                match rows.next()? {
                    Some(row) => Ok(Some(row_to_auth(row)?)),
                    None => Ok(None),
                }
            })
            .await?)
    }

    pub async fn get_user_projects(&self, user: &str) -> Result<Vec<Slug>, DbError> {
        let user = user.to_string();
        Ok(self
            .conn
            .call(move |conn| {
                let mut stmt = conn.prepare("SELECT project_slug FROM auths WHERE user = ?1")?;
                let out = stmt
                    .query_map(rusqlite::params![user], |r| r.get::<_, String>(0))?
                    .filter_map(Result::ok)
                    .collect();
                Ok(out)
            })
            .await?)
    }

    // -----------------------------------------------------------------------
    // Schemes
    // -----------------------------------------------------------------------

    pub async fn add_scheme(&self, scheme: &Scheme) -> Result<(), DbError> {
        let s = scheme.clone();
        let kind = enum_to_sql(&s.kind);
        let labels = serde_json::to_string(&s.labels).expect("serialize labels");
        self.conn
            .call(move |conn| {
                conn.execute(
                    "INSERT INTO schemes (project_slug, name, kind, labels, codebook) VALUES (?1,?2,?3,?4,?5)",
                    rusqlite::params![s.project_slug, s.name, kind, labels, s.codebook],
                )?;
                Ok(())
            })
            .await
            .map_err(|e| map_unique(e, "scheme"))?;
        Ok(())
    }

    pub async fn get_scheme(&self, project_slug: &str, name: &str) -> Result<Option<Scheme>, DbError> {
        let (project_slug, name) = (project_slug.to_string(), name.to_string());
        Ok(self
            .conn
            .call(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT project_slug, name, kind, labels, codebook FROM schemes
                     WHERE project_slug = ?1 AND name = ?2",
                )?;
                let mut rows = stmt.query(rusqlite::params![project_slug, name])?;
                match rows.next()? {
                    Some(row) => Ok(Some(row_to_scheme(row)?)),
                    None => Ok(None),
                }
            })
            .await?)
    }

    pub async fn list_schemes(&self, project_slug: &str) -> Result<Vec<Scheme>, DbError> {
        let project_slug = project_slug.to_string();
        Ok(self
            .conn
            .call(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT project_slug, name, kind, labels, codebook FROM schemes WHERE project_slug = ?1",
                )?;
                let mut rows = stmt.query(rusqlite::params![project_slug])?;
                let mut out = Vec::new();
                while let Some(row) = rows.next()? {
                    out.push(row_to_scheme(row)?);
                }
                Ok(out)
            })
            .await?)
    }

    pub async fn update_scheme_labels(&self, project_slug: &str, name: &str, labels: &[String]) -> Result<(), DbError> {
        let (project_slug, name) = (project_slug.to_string(), name.to_string());
        let labels = serde_json::to_string(labels).expect("serialize labels");
        self.conn
            .call(move |conn| {
                conn.execute(
                    "UPDATE schemes SET labels = ?3 WHERE project_slug = ?1 AND name = ?2",
                    rusqlite::params![project_slug, name, labels],
                )?;
                Ok(())
            })
            .await?;
        Ok(())
    }

    /// Removes the scheme row; annotation history is retained (queryable for
    /// audit) per spec.md §4.3 — deletion here never touches `annotations`.
    pub async fn delete_scheme(&self, project_slug: &str, name: &str) -> Result<(), DbError> {
        let (project_slug, name) = (project_slug.to_string(), name.to_string());
        self.conn
            .call(move |conn| {
                conn.execute(
                    "DELETE FROM schemes WHERE project_slug = ?1 AND name = ?2",
                    rusqlite::params![project_slug, name],
                )?;
                Ok(())
            })
            .await?;
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Annotations
    // -----------------------------------------------------------------------

    pub async fn append_annotation(&self, ann: &Annotation) -> Result<(), DbError> {
        let a = ann.clone();
        let dataset = enum_to_sql(&a.dataset);
        self.conn
            .call(move |conn| {
                conn.execute(
                    "INSERT INTO annotations (id, timestamp, dataset, user, project_slug, element_id, scheme, annotation, comment)
                     VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9)",
                    rusqlite::params![
                        a.id.to_string(),
                        a.timestamp.to_rfc3339(),
                        dataset,
                        a.user,
                        a.project_slug,
                        a.element_id,
                        a.scheme,
                        a.annotation,
                        a.comment,
                    ],
                )?;
                Ok(())
            })
            .await?;
        Ok(())
    }

    /// Latest annotation per element for `scheme` within `datasets`, one row
    /// per (element_id, user) — the current label is the max-timestamp row.
    pub async fn latest_per_element(
        &self,
        project_slug: &str,
        scheme: &str,
        datasets: &[DatasetPartition],
    ) -> Result<Vec<Annotation>, DbError> {
        let (project_slug, scheme) = (project_slug.to_string(), scheme.to_string());
        let dataset_filters: Vec<String> = datasets.iter().map(enum_to_sql).collect();
        Ok(self
            .conn
            .call(move |conn| {
                let placeholders = dataset_filters
                    .iter()
                    .map(|_| "?")
                    .collect::<Vec<_>>()
                    .join(",");
                let sql = format!(
                    "SELECT a.id, a.timestamp, a.dataset, a.user, a.project_slug, a.element_id, a.scheme, a.annotation, a.comment
                     FROM annotations a
                     INNER JOIN (
                        SELECT element_id, user, MAX(timestamp) AS max_ts
                        FROM annotations
                        WHERE project_slug = ? AND scheme = ? AND dataset IN ({placeholders})
                        GROUP BY element_id, user
                     ) latest
                     ON a.element_id = latest.element_id AND a.user = latest.user AND a.timestamp = latest.max_ts
                     WHERE a.project_slug = ? AND a.scheme = ?"
                );
                let mut params: Vec<&dyn rusqlite::ToSql> = vec![&project_slug, &scheme];
                for d in &dataset_filters {
                    params.push(d);
                }
                params.push(&project_slug);
                params.push(&scheme);
                let mut stmt = conn.prepare(&sql)?;
                let mut rows = stmt.query(params.as_slice())?;
                let mut out = Vec::new();
                while let Some(row) = rows.next()? {
                    out.push(row_to_annotation(row)?);
                }
                Ok(out)
            })
            .await?)
    }

    pub async fn history(&self, project_slug: &str, element_id: &str, scheme: &str, limit: i64) -> Result<Vec<Annotation>, DbError> {
        let (project_slug, element_id, scheme) = (project_slug.to_string(), element_id.to_string(), scheme.to_string());
        Ok(self
            .conn
            .call(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT id, timestamp, dataset, user, project_slug, element_id, scheme, annotation, comment
                     FROM annotations WHERE project_slug = ?1 AND element_id = ?2 AND scheme = ?3
                     ORDER BY timestamp DESC LIMIT ?4",
                )?;
                let mut rows = stmt.query(rusqlite::params![project_slug, element_id, scheme, limit])?;
                let mut out = Vec::new();
                while let Some(row) = rows.next()? {
                    out.push(row_to_annotation(row)?);
                }
                Ok(out)
            })
            .await?)
    }

    pub async fn distinct_users(&self, project_slug: &str, scheme: &str) -> Result<Vec<String>, DbError> {
        let (project_slug, scheme) = (project_slug.to_string(), scheme.to_string());
        Ok(self
            .conn
            .call(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT DISTINCT user FROM annotations WHERE project_slug = ?1 AND scheme = ?2",
                )?;
                let out = stmt
                    .query_map(rusqlite::params![project_slug, scheme], |r| r.get::<_, String>(0))?
                    .filter_map(Result::ok)
                    .collect();
                Ok(out)
            })
            .await?)
    }

    pub async fn recent_ids(&self, project_slug: &str, scheme: &str, user: Option<&str>, limit: i64) -> Result<Vec<String>, DbError> {
        let (project_slug, scheme) = (project_slug.to_string(), scheme.to_string());
        let user = user.map(|u| u.to_string());
        Ok(self
            .conn
            .call(move |conn| {
                let (sql, params): (&str, Vec<&dyn rusqlite::ToSql>) = match &user {
                    Some(u) => (
                        "SELECT element_id FROM annotations WHERE project_slug = ?1 AND scheme = ?2 AND user = ?3
                         ORDER BY timestamp DESC LIMIT ?4",
                        vec![&project_slug, &scheme, u, &limit],
                    ),
                    None => (
                        "SELECT element_id FROM annotations WHERE project_slug = ?1 AND scheme = ?2
                         ORDER BY timestamp DESC LIMIT ?3",
                        vec![&project_slug, &scheme, &limit],
                    ),
                };
                let mut stmt = conn.prepare(sql)?;
                let out = stmt
                    .query_map(params.as_slice(), |r| r.get::<_, String>(0))?
                    .filter_map(Result::ok)
                    .collect();
                Ok(out)
            })
            .await?)
    }

    /// For each element labeled by >=2 users with >=2 distinct non-null
    /// labels, returns (element_id, {user -> label}).
    pub async fn reconciliation_table(&self, project_slug: &str, scheme: &str) -> Result<Vec<(String, Vec<(String, String)>)>, DbError> {
        let latest = self.latest_per_element(project_slug, scheme, &[DatasetPartition::Train, DatasetPartition::Valid, DatasetPartition::Test]).await?;
        use std::collections::HashMap;
        let mut by_element: HashMap<String, Vec<(String, String)>> = HashMap::new();
        for a in latest {
            if let Some(label) = a.annotation {
                by_element.entry(a.element_id).or_default().push((a.user, label));
            }
        }
        Ok(by_element
            .into_iter()
            .filter(|(_, labels)| {
                let distinct: std::collections::HashSet<&str> = labels.iter().map(|(_, l)| l.as_str()).collect();
                labels.len() >= 2 && distinct.len() >= 2
            })
            .collect())
    }

    // -----------------------------------------------------------------------
    // Features
    // -----------------------------------------------------------------------

    pub async fn add_feature(&self, feature: &Feature) -> Result<(), DbError> {
        let f = feature.clone();
        let kind = enum_to_sql(&f.kind);
        let parameters = f.parameters.to_string();
        let columns = serde_json::to_string(&f.columns).expect("serialize columns");
        self.conn
            .call(move |conn| {
                conn.execute(
                    "INSERT INTO features (project_slug, name, kind, owner, parameters, columns) VALUES (?1,?2,?3,?4,?5,?6)",
                    rusqlite::params![f.project_slug, f.name, kind, f.owner, parameters, columns],
                )?;
                Ok(())
            })
            .await
            .map_err(|e| map_unique(e, "feature"))?;
        Ok(())
    }

    pub async fn delete_feature(&self, project_slug: &str, name: &str) -> Result<(), DbError> {
        let (project_slug, name) = (project_slug.to_string(), name.to_string());
        self.conn
            .call(move |conn| {
                conn.execute(
                    "DELETE FROM features WHERE project_slug = ?1 AND name = ?2",
                    rusqlite::params![project_slug, name],
                )?;
                Ok(())
            })
            .await?;
        Ok(())
    }

    pub async fn get_feature(&self, project_slug: &str, name: &str) -> Result<Option<Feature>, DbError> {
        let (project_slug, name) = (project_slug.to_string(), name.to_string());
        Ok(self
            .conn
            .call(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT project_slug, name, kind, owner, parameters, columns FROM features
                     WHERE project_slug = ?1 AND name = ?2",
                )?;
                let mut rows = stmt.query(rusqlite::params![project_slug, name])?;
                match rows.next()? {
                    Some(row) => Ok(Some(row_to_feature(row)?)),
                    None => Ok(None),
                }
            })
            .await?)
    }

    pub async fn list_features(&self, project_slug: &str) -> Result<Vec<Feature>, DbError> {
        let project_slug = project_slug.to_string();
        Ok(self
            .conn
            .call(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT project_slug, name, kind, owner, parameters, columns FROM features WHERE project_slug = ?1",
                )?;
                let mut rows = stmt.query(rusqlite::params![project_slug])?;
                let mut out = Vec::new();
                while let Some(row) = rows.next()? {
                    out.push(row_to_feature(row)?);
                }
                Ok(out)
            })
            .await?)
    }

    // -----------------------------------------------------------------------
    // Models (quick + language share one table, distinguished by model_kind)
    // -----------------------------------------------------------------------

    pub async fn add_model(
        &self,
        project_slug: &str,
        name: &str,
        model_kind: &str,
        scheme: &str,
        user: &str,
        status: &str,
        hyperparameters: &serde_json::Value,
    ) -> Result<(), DbError> {
        let (project_slug, name, model_kind, scheme, user, status) = (
            project_slug.to_string(),
            name.to_string(),
            model_kind.to_string(),
            scheme.to_string(),
            user.to_string(),
            status.to_string(),
        );
        let hyperparameters = hyperparameters.to_string();
        let metrics = serde_json::to_string(&ModelMetrics::default()).expect("serialize metrics");
        let created_at = Utc::now().to_rfc3339();
        self.conn
            .call(move |conn| {
                conn.execute(
                    "INSERT INTO models (project_slug, name, model_kind, scheme, user, status, hyperparameters, metrics, created_at)
                     VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9)",
                    rusqlite::params![project_slug, name, model_kind, scheme, user, status, hyperparameters, metrics, created_at],
                )?;
                Ok(())
            })
            .await
            .map_err(|e| map_unique(e, "model"))?;
        Ok(())
    }

    pub async fn set_model_status(&self, project_slug: &str, name: &str, status: &str) -> Result<(), DbError> {
        let (project_slug, name, status) = (project_slug.to_string(), name.to_string(), status.to_string());
        self.conn
            .call(move |conn| {
                conn.execute(
                    "UPDATE models SET status = ?3 WHERE project_slug = ?1 AND name = ?2",
                    rusqlite::params![project_slug, name, status],
                )?;
                Ok(())
            })
            .await?;
        Ok(())
    }

    pub async fn rename_model(&self, project_slug: &str, old_name: &str, new_name: &str) -> Result<(), DbError> {
        let (project_slug, old_name, new_name) = (project_slug.to_string(), old_name.to_string(), new_name.to_string());
        self.conn
            .call(move |conn| {
                let exists: i64 = conn.query_row(
                    "SELECT COUNT(*) FROM models WHERE project_slug = ?1 AND name = ?2",
                    rusqlite::params![project_slug, new_name],
                    |r| r.get(0),
                )?;
                if exists > 0 {
                    return Err(tokio_rusqlite::Error::Rusqlite(rusqlite::Error::SqliteFailure(
                        rusqlite::ffi::Error::new(rusqlite::ffi::SQLITE_CONSTRAINT),
                        Some("model name already exists".into()),
                    )));
                }
                conn.execute(
                    "UPDATE models SET name = ?3 WHERE project_slug = ?1 AND name = ?2",
                    rusqlite::params![project_slug, old_name, new_name],
                )?;
                Ok(())
            })
            .await
            .map_err(|e| map_unique(e, "model"))?;
        Ok(())
    }

    pub async fn list_trained_models(&self, project_slug: &str, model_kind: &str) -> Result<Vec<String>, DbError> {
        let (project_slug, model_kind) = (project_slug.to_string(), model_kind.to_string());
        Ok(self
            .conn
            .call(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT name FROM models WHERE project_slug = ?1 AND model_kind = ?2 AND status = 'trained'",
                )?;
                let out = stmt
                    .query_map(rusqlite::params![project_slug, model_kind], |r| r.get::<_, String>(0))?
                    .filter_map(Result::ok)
                    .collect();
                Ok(out)
            })
            .await?)
    }

    pub async fn get_model(&self, project_slug: &str, name: &str) -> Result<Option<ModelRow>, DbError> {
        let (project_slug, name) = (project_slug.to_string(), name.to_string());
        Ok(self
            .conn
            .call(move |conn| {
                Ok(conn
                    .query_row(
                        "SELECT project_slug, name, model_kind, scheme, user, status, hyperparameters, metrics, created_at
                     FROM models WHERE project_slug = ?1 AND name = ?2",
                        rusqlite::params![project_slug, name],
                        row_to_model,
                    )
                    .optional()?)
            })
            .await?)
    }

    pub async fn list_models(&self, project_slug: &str, model_kind: &str) -> Result<Vec<ModelRow>, DbError> {
        let (project_slug, model_kind) = (project_slug.to_string(), model_kind.to_string());
        Ok(self
            .conn
            .call(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT project_slug, name, model_kind, scheme, user, status, hyperparameters, metrics, created_at
                     FROM models WHERE project_slug = ?1 AND model_kind = ?2",
                )?;
                let out = stmt
                    .query_map(rusqlite::params![project_slug, model_kind], row_to_model)?
                    .filter_map(Result::ok)
                    .collect();
                Ok(out)
            })
            .await?)
    }

    pub async fn update_model_metrics(&self, project_slug: &str, name: &str, metrics: &ModelMetrics) -> Result<(), DbError> {
        let (project_slug, name) = (project_slug.to_string(), name.to_string());
        let metrics = serde_json::to_string(metrics).expect("serialize metrics");
        self.conn
            .call(move |conn| {
                conn.execute(
                    "UPDATE models SET metrics = ?3 WHERE project_slug = ?1 AND name = ?2",
                    rusqlite::params![project_slug, name, metrics],
                )?;
                Ok(())
            })
            .await?;
        Ok(())
    }

    pub async fn delete_model(&self, project_slug: &str, name: &str) -> Result<(), DbError> {
        let (project_slug, name) = (project_slug.to_string(), name.to_string());
        self.conn
            .call(move |conn| {
                conn.execute("DELETE FROM models WHERE project_slug = ?1 AND name = ?2", rusqlite::params![project_slug, name])?;
                Ok(())
            })
            .await?;
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Logs
    // -----------------------------------------------------------------------

    pub async fn add_log(&self, entry: &LogEntry) -> Result<(), DbError> {
        let e = entry.clone();
        self.conn
            .call(move |conn| {
                conn.execute(
                    "INSERT INTO logs (id, time, user, project_slug, action) VALUES (?1,?2,?3,?4,?5)",
                    rusqlite::params![e.id.to_string(), e.time.to_rfc3339(), e.user, e.project_slug, e.action],
                )?;
                Ok(())
            })
            .await?;
        Ok(())
    }

    pub async fn get_logs(&self, user: &str, project_slug: Option<&str>, limit: i64) -> Result<Vec<LogEntry>, DbError> {
        let user = user.to_string();
        let project_slug = project_slug.map(|s| s.to_string());
        Ok(self
            .conn
            .call(move |conn| {
                let (sql, params): (&str, Vec<&dyn rusqlite::ToSql>) = match &project_slug {
                    Some(p) => (
                        "SELECT id, time, user, project_slug, action FROM logs WHERE user = ?1 AND project_slug = ?2 ORDER BY time DESC LIMIT ?3",
                        vec![&user, p, &limit],
                    ),
                    None => (
                        "SELECT id, time, user, project_slug, action FROM logs WHERE user = ?1 ORDER BY time DESC LIMIT ?2",
                        vec![&user, &limit],
                    ),
                };
                let mut stmt = conn.prepare(sql)?;
                let mut rows = stmt.query(params.as_slice())?;
                let mut out = Vec::new();
                while let Some(row) = rows.next()? {
                    out.push(row_to_log(row)?);
                }
                Ok(out)
            })
            .await?)
    }

    /// Users with a log entry in the last `timespan_secs` seconds (default
    /// active-user window from spec.md §5 is 300s).
    pub async fn get_current_users(&self, timespan_secs: i64) -> Result<Vec<String>, DbError> {
        let cutoff = (Utc::now() - chrono::Duration::seconds(timespan_secs)).to_rfc3339();
        Ok(self
            .conn
            .call(move |conn| {
                let mut stmt = conn.prepare("SELECT DISTINCT user FROM logs WHERE time > ?1")?;
                let out = stmt
                    .query_map(rusqlite::params![cutoff], |r| r.get::<_, String>(0))?
                    .filter_map(Result::ok)
                    .collect();
                Ok(out)
            })
            .await?)
    }

    pub async fn get_distinct_users(&self, project_slug: &str, timespan_secs: Option<i64>) -> Result<Vec<String>, DbError> {
        let project_slug = project_slug.to_string();
        let cutoff = timespan_secs.map(|t| (Utc::now() - chrono::Duration::seconds(t)).to_rfc3339());
        Ok(self
            .conn
            .call(move |conn| {
                let (sql, params): (&str, Vec<&dyn rusqlite::ToSql>) = match &cutoff {
                    Some(c) => (
                        "SELECT DISTINCT user FROM logs WHERE project_slug = ?1 AND time > ?2",
                        vec![&project_slug, c],
                    ),
                    None => (
                        "SELECT DISTINCT user FROM logs WHERE project_slug = ?1",
                        vec![&project_slug],
                    ),
                };
                let mut stmt = conn.prepare(sql)?;
                let out = stmt
                    .query_map(params.as_slice(), |r| r.get::<_, String>(0))?
                    .filter_map(Result::ok)
                    .collect();
                Ok(out)
            })
            .await?)
    }

    // -----------------------------------------------------------------------
    // Tokens
    // -----------------------------------------------------------------------

    pub async fn add_token(&self, token: &str, status: TokenStatus) -> Result<(), DbError> {
        let token = token.to_string();
        let status = enum_to_sql(&status);
        let time = Utc::now().to_rfc3339();
        self.conn
            .call(move |conn| {
                conn.execute(
                    "INSERT INTO tokens (token, status, time) VALUES (?1,?2,?3)
                     ON CONFLICT(token) DO UPDATE SET status=excluded.status",
                    rusqlite::params![token, status, time],
                )?;
                Ok(())
            })
            .await?;
        Ok(())
    }

    pub async fn get_token_status(&self, token: &str) -> Result<Option<TokenStatus>, DbError> {
        let token = token.to_string();
        Ok(self
            .conn
            .call(move |conn| {
                let mut stmt = conn.prepare("SELECT status FROM tokens WHERE token = ?1")?;
                let mut rows = stmt.query(rusqlite::params![token])?;
                match rows.next()? {
                    Some(row) => Ok(Some(enum_from_sql(&row.get::<_, String>(0)?))),
                    None => Ok(None),
                }
            })
            .await?)
    }

    pub async fn revoke_token(&self, token: &str) -> Result<(), DbError> {
        self.add_token(token, TokenStatus::Revoked).await
    }

    // -----------------------------------------------------------------------
    // Generations
    // -----------------------------------------------------------------------

    pub async fn add_generated(&self, generation: &Generation) -> Result<(), DbError> {
        let g = generation.clone();
        self.conn
            .call(move |conn| {
                conn.execute(
                    "INSERT INTO generations (id, time, user, project_slug, element_id, prompt_name, answer)
                     VALUES (?1,?2,?3,?4,?5,?6,?7)",
                    rusqlite::params![
                        g.id.to_string(),
                        g.time.to_rfc3339(),
                        g.user,
                        g.project_slug,
                        g.element_id,
                        g.prompt_name,
                        g.answer,
                    ],
                )?;
                Ok(())
            })
            .await?;
        Ok(())
    }

    pub async fn get_generated(&self, project_slug: &str, user: &str, n_elements: i64) -> Result<Vec<Generation>, DbError> {
        let (project_slug, user) = (project_slug.to_string(), user.to_string());
        Ok(self
            .conn
            .call(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT id, time, user, project_slug, element_id, prompt_name, answer
                     FROM generations WHERE project_slug = ?1 AND user = ?2 ORDER BY time DESC LIMIT ?3",
                )?;
                let mut rows = stmt.query(rusqlite::params![project_slug, user, n_elements])?;
                let mut out = Vec::new();
                while let Some(row) = rows.next()? {
                    out.push(row_to_generation(row)?);
                }
                Ok(out)
            })
            .await?)
    }
}

fn map_unique(err: tokio_rusqlite::Error, entity: &str) -> DbError {
    if let tokio_rusqlite::Error::Rusqlite(rusqlite::Error::SqliteFailure(e, _)) = &err {
        if e.code == rusqlite::ErrorCode::ConstraintViolation {
            return DbError::AlreadyExists(entity.to_string());
        }
    }
    DbError::Sqlite(err)
}

// ---------------------------------------------------------------------------
// Row mapping helpers
// ---------------------------------------------------------------------------

fn row_to_model(row: &rusqlite::Row<'_>) -> rusqlite::Result<ModelRow> {
    let hyperparameters: String = row.get(6)?;
    let metrics: String = row.get(7)?;
    let created_at: String = row.get(8)?;
    Ok(ModelRow {
        project_slug: row.get(0)?,
        name: row.get(1)?,
        model_kind: row.get(2)?,
        scheme: row.get(3)?,
        user: row.get(4)?,
        status: row.get(5)?,
        hyperparameters: serde_json::from_str(&hyperparameters).expect("valid hyperparameters json"),
        metrics: serde_json::from_str(&metrics).expect("valid metrics json"),
        created_at: parse_rfc3339(&created_at),
    })
}

fn row_to_user(row: &rusqlite::Row<'_>) -> rusqlite::Result<User> {
    let created_at: String = row.get(5)?;
    let deactivated_at: Option<String> = row.get(6)?;
    Ok(User {
        user_name: row.get(0)?,
        password_hash: row.get(1)?,
        role: row.get(2)?,
        created_by: row.get(3)?,
        mail: row.get(4)?,
        created_at: parse_rfc3339(&created_at),
        deactivated_at: deactivated_at.map(|s| parse_rfc3339(&s)),
    })
}

fn row_to_auth(row: &rusqlite::Row<'_>) -> rusqlite::Result<Auth> {
    let status: String = row.get(2)?;
    Ok(Auth {
        user: row.get(0)?,
        project_slug: row.get(1)?,
        status: enum_from_sql(&status),
    })
}

fn row_to_scheme(row: &rusqlite::Row<'_>) -> rusqlite::Result<Scheme> {
    let kind: String = row.get(2)?;
    let labels: String = row.get(3)?;
    Ok(Scheme {
        project_slug: row.get(0)?,
        name: row.get(1)?,
        kind: enum_from_sql(&kind),
        labels: serde_json::from_str(&labels).expect("valid labels json"),
        codebook: row.get(4)?,
    })
}

fn row_to_annotation(row: &rusqlite::Row<'_>) -> rusqlite::Result<Annotation> {
    let id: String = row.get(0)?;
    let timestamp: String = row.get(1)?;
    let dataset: String = row.get(2)?;
    Ok(Annotation {
        id: Uuid::parse_str(&id).expect("valid uuid"),
        timestamp: parse_rfc3339(&timestamp),
        dataset: enum_from_sql(&dataset),
        user: row.get(3)?,
        project_slug: row.get(4)?,
        element_id: row.get(5)?,
        scheme: row.get(6)?,
        annotation: row.get(7)?,
        comment: row.get(8)?,
    })
}

fn row_to_feature(row: &rusqlite::Row<'_>) -> rusqlite::Result<Feature> {
    let kind: String = row.get(2)?;
    let parameters: String = row.get(4)?;
    let columns: String = row.get(5)?;
    Ok(Feature {
        project_slug: row.get(0)?,
        name: row.get(1)?,
        kind: enum_from_sql(&kind),
        owner: row.get(3)?,
        parameters: serde_json::from_str(&parameters).expect("valid parameters json"),
        columns: serde_json::from_str(&columns).expect("valid columns json"),
    })
}

fn row_to_log(row: &rusqlite::Row<'_>) -> rusqlite::Result<LogEntry> {
    let id: String = row.get(0)?;
    let time: String = row.get(1)?;
    Ok(LogEntry {
        id: Uuid::parse_str(&id).expect("valid uuid"),
        time: parse_rfc3339(&time),
        user: row.get(2)?,
        project_slug: row.get(3)?,
        action: row.get(4)?,
    })
}

fn row_to_generation(row: &rusqlite::Row<'_>) -> rusqlite::Result<Generation> {
    let id: String = row.get(0)?;
    let time: String = row.get(1)?;
    Ok(Generation {
        id: Uuid::parse_str(&id).expect("valid uuid"),
        time: parse_rfc3339(&time),
        user: row.get(2)?,
        project_slug: row.get(3)?,
        element_id: row.get(4)?,
        prompt_name: row.get(5)?,
        answer: row.get(6)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_project(slug: &str) -> Project {
        Project {
            slug: slug.to_string(),
            created_by: "root".into(),
            created_at: Utc::now(),
            params: ProjectParams {
                col_text: "text".into(),
                cols_context: vec![],
                n_train: 80,
                n_test: 20,
                col_label: None,
            },
        }
    }

    #[tokio::test]
    async fn add_and_get_project_roundtrips() {
        let db = Db::new_in_memory().await.unwrap();
        db.add_project(&test_project("demo")).await.unwrap();
        let got = db.get_project("demo").await.unwrap().unwrap();
        assert_eq!(got.slug, "demo");
        assert_eq!(got.params.n_train, 80);
    }

    #[tokio::test]
    async fn duplicate_project_is_already_exists() {
        let db = Db::new_in_memory().await.unwrap();
        db.add_project(&test_project("demo")).await.unwrap();
        let err = db.add_project(&test_project("demo")).await.unwrap_err();
        assert!(matches!(err, DbError::AlreadyExists(_)));
    }

    #[tokio::test]
    async fn delete_project_cascades() {
        let db = Db::new_in_memory().await.unwrap();
        db.add_project(&test_project("demo")).await.unwrap();
        db.add_scheme(&Scheme::new("demo".into(), "default", SchemeKind::Multiclass, vec!["a".into(), "b".into()]))
            .await
            .unwrap();
        db.delete_project("demo").await.unwrap();
        assert!(db.get_project("demo").await.unwrap().is_none());
        assert!(db.list_schemes("demo").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn annotation_monotonicity_latest_wins() {
        let db = Db::new_in_memory().await.unwrap();
        db.add_project(&test_project("demo")).await.unwrap();
        db.add_scheme(&Scheme::new("demo".into(), "default", SchemeKind::Multiclass, vec!["a".into(), "b".into()]))
            .await
            .unwrap();

        db.append_annotation(&Annotation::new("demo".into(), "e1", "default", Some("a".into()), "u1", DatasetPartition::Train, ""))
            .await
            .unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(2)).await;
        db.append_annotation(&Annotation::new("demo".into(), "e1", "default", Some("b".into()), "u1", DatasetPartition::Train, ""))
            .await
            .unwrap();

        let latest = db.latest_per_element("demo", "default", &[DatasetPartition::Train]).await.unwrap();
        assert_eq!(latest.len(), 1);
        assert_eq!(latest[0].annotation.as_deref(), Some("b"));
    }

    #[tokio::test]
    async fn delete_scheme_retains_annotation_history() {
        let db = Db::new_in_memory().await.unwrap();
        db.add_project(&test_project("demo")).await.unwrap();
        db.add_scheme(&Scheme::new("demo".into(), "default", SchemeKind::Multiclass, vec!["a".into()]))
            .await
            .unwrap();
        db.append_annotation(&Annotation::new("demo".into(), "e1", "default", Some("a".into()), "u1", DatasetPartition::Train, ""))
            .await
            .unwrap();

        db.delete_scheme("demo", "default").await.unwrap();

        assert!(db.get_scheme("demo", "default").await.unwrap().is_none());
        let history = db.history("demo", "e1", "default", 10).await.unwrap();
        assert_eq!(history.len(), 1);
    }

    #[tokio::test]
    async fn reconciliation_requires_two_distinct_labels() {
        let db = Db::new_in_memory().await.unwrap();
        db.add_project(&test_project("demo")).await.unwrap();
        db.add_scheme(&Scheme::new("demo".into(), "default", SchemeKind::Multiclass, vec!["a".into(), "b".into()]))
            .await
            .unwrap();
        db.append_annotation(&Annotation::new("demo".into(), "e1", "default", Some("a".into()), "u1", DatasetPartition::Train, ""))
            .await
            .unwrap();
        db.append_annotation(&Annotation::new("demo".into(), "e1", "default", Some("b".into()), "u2", DatasetPartition::Train, ""))
            .await
            .unwrap();
        db.append_annotation(&Annotation::new("demo".into(), "e2", "default", Some("a".into()), "u1", DatasetPartition::Train, ""))
            .await
            .unwrap();

        let table = db.reconciliation_table("demo", "default").await.unwrap();
        assert_eq!(table.len(), 1);
        assert_eq!(table[0].0, "e1");
    }

    #[tokio::test]
    async fn rename_model_rejects_collision() {
        let db = Db::new_in_memory().await.unwrap();
        db.add_project(&test_project("demo")).await.unwrap();
        db.add_model("demo", "m1", "quick", "default", "u1", "trained", &serde_json::json!({})).await.unwrap();
        db.add_model("demo", "m2", "quick", "default", "u1", "trained", &serde_json::json!({})).await.unwrap();
        let err = db.rename_model("demo", "m1", "m2").await.unwrap_err();
        assert!(matches!(err, DbError::AlreadyExists(_)));
    }
}
