//! Per-project feature catalog over a columnar store.
//!
//! Grounded in `features.py::Features` (`add`/`delete`/`get`/`compute`/
//! `current_computing`). `regex` and `dataset` features are pure CPU
//! transforms computed synchronously on the request path; `sbert`,
//! `fasttext`, and `dfm` are queue-backed, submitted to the pools named in
//! spec.md §4.4. The actual parquet-backed matrix store is out of scope
//! (spec.md §1 excludes upload/CSV parsing details) — this crate tracks
//! feature *metadata* (name, kind, owner, parameter, column list) and the
//! transforms that are purely in-process (regex counting, dataset column
//! passthrough); async kinds are tracked as submitted tasks whose results
//! the caller is expected to register via `register_computed`.

use std::sync::Arc;

use dashmap::DashMap;
use regex::Regex;
use tigger_core::db::{Db, DbError};
use tigger_core::types::{Feature, FeatureKind, TaskKind, TaskQueueKind};
use tigger_queue::Queue;
use uuid::Uuid;

#[derive(Debug, thiserror::Error)]
pub enum FeatureError {
    #[error("feature not found: {0}")]
    NotFound(String),
    #[error("feature already exists: {0}")]
    AlreadyExists(String),
    #[error("shape mismatch: content has {got} rows, expected {expected}")]
    ShapeMismatch { got: usize, expected: usize },
    #[error("invalid regex: {0}")]
    InvalidRegex(String),
    #[error("a feature computation is already pending for user {0}")]
    Conflict(String),
    #[error(transparent)]
    Db(#[from] DbError),
}

impl From<&FeatureError> for tigger_core::error::ErrorKind {
    fn from(err: &FeatureError) -> Self {
        use tigger_core::error::ErrorKind;
        match err {
            FeatureError::NotFound(_) => ErrorKind::NotFound,
            FeatureError::AlreadyExists(_) => ErrorKind::AlreadyExists,
            FeatureError::ShapeMismatch { .. } => ErrorKind::Invalid,
            FeatureError::InvalidRegex(_) => ErrorKind::Invalid,
            FeatureError::Conflict(_) => ErrorKind::Conflict,
            FeatureError::Db(e) => e.into(),
        }
    }
}

pub struct Features {
    db: Arc<Db>,
    queue: Arc<Queue>,
    /// At most one pending async feature job per user (spec.md §4.4).
    pending: DashMap<String, Uuid>,
}

impl Features {
    pub fn new(db: Arc<Db>, queue: Arc<Queue>) -> Self {
        Self {
            db,
            queue,
            pending: DashMap::new(),
        }
    }

    /// Rejects duplicate names and shape mismatches. `content_rows` must
    /// equal the project's train+valid+test total.
    pub async fn add(
        &self,
        project_slug: &str,
        name: &str,
        kind: FeatureKind,
        owner: &str,
        parameters: serde_json::Value,
        columns: Vec<String>,
        content_rows: usize,
        expected_rows: usize,
    ) -> Result<(), FeatureError> {
        if self.db.get_feature(project_slug, name).await?.is_some() {
            return Err(FeatureError::AlreadyExists(name.to_string()));
        }
        if content_rows != expected_rows {
            return Err(FeatureError::ShapeMismatch { got: content_rows, expected: expected_rows });
        }
        let columns = columns.into_iter().map(|c| format!("{name}__{c}")).collect();
        self.db
            .add_feature(&Feature {
                project_slug: project_slug.to_string(),
                name: name.to_string(),
                kind,
                owner: owner.to_string(),
                parameters,
                columns,
            })
            .await?;
        Ok(())
    }

    pub async fn delete(&self, project_slug: &str, name: &str) -> Result<(), FeatureError> {
        self.db.delete_feature(project_slug, name).await?;
        Ok(())
    }

    pub async fn info(&self, project_slug: &str, name: &str) -> Result<Feature, FeatureError> {
        self.db.get_feature(project_slug, name).await?.ok_or_else(|| FeatureError::NotFound(name.to_string()))
    }

    pub async fn get_available(&self, project_slug: &str) -> Result<Vec<Feature>, FeatureError> {
        Ok(self.db.list_features(project_slug).await?)
    }

    /// Compiles `pattern`, applies it to `texts`, counts matches, registers
    /// a boolean feature. Synchronous — CPU-only regex matching.
    pub async fn compute_regex(
        &self,
        project_slug: &str,
        name: &str,
        pattern: &str,
        owner: &str,
        texts: &[String],
        expected_rows: usize,
    ) -> Result<usize, FeatureError> {
        let re = Regex::new(pattern).map_err(|e| FeatureError::InvalidRegex(e.to_string()))?;
        let count = texts.iter().filter(|t| re.is_match(t)).count();
        self.add(
            project_slug,
            name,
            FeatureKind::Regex,
            owner,
            serde_json::json!({"value": pattern}),
            vec!["match".to_string()],
            texts.len(),
            expected_rows,
        )
        .await?;
        Ok(count)
    }

    /// Reads a single raw corpus column without materializing it as a
    /// feature. `"text"` returns the text column itself; any other name is
    /// looked up per-row in `contexts`. Grounded in `features.py::get_column_raw`
    /// — the raw corpus itself is out of scope (spec.md §1), so this takes
    /// the caller-supplied rows directly rather than reading them back from
    /// a persisted corpus table.
    pub fn get_column_raw(
        &self,
        column: &str,
        texts: &[String],
        contexts: &[std::collections::HashMap<String, String>],
    ) -> Vec<Option<String>> {
        if column == "text" {
            return texts.iter().cloned().map(Some).collect();
        }
        contexts.iter().map(|ctx| ctx.get(column).cloned()).collect()
    }

    /// Materializes an existing raw column, coerced to numeric or string.
    pub async fn compute_dataset(
        &self,
        project_slug: &str,
        name: &str,
        source_column: &str,
        owner: &str,
        n_rows: usize,
        expected_rows: usize,
    ) -> Result<(), FeatureError> {
        self.add(
            project_slug,
            name,
            FeatureKind::Dataset,
            owner,
            serde_json::json!({"source_column": source_column}),
            vec![source_column.to_string()],
            n_rows,
            expected_rows,
        )
        .await
    }

    /// Submits an async feature job (`sbert`/`fasttext`/`dfm`) to the
    /// appropriate pool. Rejects with `Conflict` if `user` already has a
    /// pending job.
    pub async fn compute_async<F, Fut>(
        &self,
        kind: FeatureKind,
        project_slug: &str,
        user: &str,
        work: F,
    ) -> Result<Uuid, FeatureError>
    where
        F: FnOnce(tigger_queue::CancelSignal) -> Fut + Send + 'static,
        Fut: std::future::Future<Output = Result<serde_json::Value, String>> + Send + 'static,
    {
        if self.pending.contains_key(user) {
            return Err(FeatureError::Conflict(user.to_string()));
        }
        let task_kind = match kind {
            FeatureKind::Sbert => TaskKind::FeatureSbert,
            FeatureKind::Fasttext => TaskKind::FeatureFasttext,
            FeatureKind::Dfm => TaskKind::FeatureDfm,
            _ => return Err(FeatureError::InvalidRegex("not an async feature kind".into())),
        };
        let queue_kind = if kind == FeatureKind::Sbert { TaskQueueKind::Gpu } else { TaskQueueKind::Cpu };
        let id = self.queue.add_task(task_kind, project_slug, user, queue_kind, work).await;
        self.pending.insert(user.to_string(), id);
        Ok(id)
    }

    /// Called by the reaper once the queue reports the job terminal;
    /// releases the per-user pending slot.
    pub fn release_pending(&self, user: &str) {
        self.pending.remove(user);
    }

    pub fn current_computing(&self) -> Vec<(String, Uuid)> {
        self.pending.iter().map(|e| (e.key().clone(), *e.value())).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tigger_core::types::{Project, ProjectParams};

    async fn setup() -> (Features, Arc<Db>, Arc<Queue>) {
        let db = Arc::new(Db::new_in_memory().await.unwrap());
        db.add_project(&Project {
            slug: "demo".into(),
            created_by: "root".into(),
            created_at: chrono::Utc::now(),
            params: ProjectParams { col_text: "text".into(), cols_context: vec![], n_train: 2, n_test: 0, col_label: None },
        })
        .await
        .unwrap();
        let queue = Arc::new(Queue::new(2, 1));
        (Features::new(db.clone(), queue.clone()), db, queue)
    }

    #[tokio::test]
    async fn regex_feature_counts_matches_and_registers() {
        let (features, _db, _queue) = setup().await;
        let texts = vec!["a cat sat".to_string(), "a dog ran".to_string()];
        let count = features.compute_regex("demo", "regex_cat", "cat", "u1", &texts, 2).await.unwrap();
        assert_eq!(count, 1);
        assert!(features.info("demo", "regex_cat").await.is_ok());
    }

    #[tokio::test]
    async fn add_rejects_shape_mismatch() {
        let (features, _db, _queue) = setup().await;
        let err = features
            .add("demo", "f1", FeatureKind::Dataset, "u1", serde_json::json!({}), vec!["x".into()], 5, 2)
            .await
            .unwrap_err();
        assert!(matches!(err, FeatureError::ShapeMismatch { got: 5, expected: 2 }));
    }

    #[tokio::test]
    async fn get_column_raw_reads_text_and_context_columns() {
        let (features, _db, _queue) = setup().await;
        let texts = vec!["a cat sat".to_string(), "a dog ran".to_string()];
        let mut ctx0 = std::collections::HashMap::new();
        ctx0.insert("source".to_string(), "wiki".to_string());
        let contexts = vec![ctx0, std::collections::HashMap::new()];

        assert_eq!(features.get_column_raw("text", &texts, &contexts), vec![Some(texts[0].clone()), Some(texts[1].clone())]);
        assert_eq!(features.get_column_raw("source", &texts, &contexts), vec![Some("wiki".to_string()), None]);
    }

    #[tokio::test]
    async fn second_async_job_from_same_user_conflicts() {
        let (features, _db, _queue) = setup().await;
        features
            .compute_async(FeatureKind::Sbert, "demo", "u1", |_| async { Ok(serde_json::json!({})) })
            .await
            .unwrap();
        let err = features
            .compute_async(FeatureKind::Fasttext, "demo", "u1", |_| async { Ok(serde_json::json!({})) })
            .await
            .unwrap_err();
        assert!(matches!(err, FeatureError::Conflict(_)));
    }
}
