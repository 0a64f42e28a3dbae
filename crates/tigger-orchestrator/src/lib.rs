//! Process-wide orchestrator: the LRU-capped table of loaded projects,
//! project creation/deletion, cross-cutting process control, and the
//! append-only audit log.
//!
//! Grounded in `server.py::Server` (`get_project`, `create_project`,
//! `delete_project`, `stop_user_processes`, `log_action`) and, for the
//! cache shape, `at-core::session_store::SessionStore`'s
//! `Mutex<LruCache<..>>` pattern. Unlike that store, eviction here is safe
//! without flushing anything to disk: every component service already
//! indexes by project slug against the shared database and queue, so a
//! `Project` handle is a cheap grouping of `Arc` clones, not the owner of
//! per-project state.

use std::collections::HashSet;
use std::num::NonZeroUsize;
use std::sync::Arc;

use chrono::Utc;
use lru::LruCache;
use tigger_core::db::{Db, DbError};
use tigger_core::types::{DatasetPartition, LogEntry, Project as ProjectRecord, ProjectParams, SchemeKind, TaskKind};
use tigger_features::{FeatureError, Features};
use tigger_languagemodels::LanguageModels;
use tigger_project::{CorpusRow, Project};
use tigger_quickmodels::QuickModels;
use tigger_queue::Queue;
use tigger_schemes::{SchemeError, Schemes};
use tokio::sync::Mutex;
use uuid::Uuid;

#[derive(Debug, thiserror::Error)]
pub enum OrchestratorError {
    #[error("project not found: {0}")]
    NotFound(String),
    #[error("project already exists: {0}")]
    AlreadyExists(String),
    #[error("not enough unlabeled rows to build a test set of {requested}: only {available} available")]
    InsufficientTestData { requested: usize, available: usize },
    #[error(transparent)]
    Db(#[from] DbError),
    #[error(transparent)]
    Scheme(#[from] SchemeError),
    #[error(transparent)]
    Feature(#[from] FeatureError),
}

impl From<&OrchestratorError> for tigger_core::error::ErrorKind {
    fn from(err: &OrchestratorError) -> Self {
        use tigger_core::error::ErrorKind;
        match err {
            OrchestratorError::NotFound(_) => ErrorKind::NotFound,
            OrchestratorError::AlreadyExists(_) => ErrorKind::AlreadyExists,
            OrchestratorError::InsufficientTestData { .. } => ErrorKind::Invalid,
            OrchestratorError::Db(e) => e.into(),
            OrchestratorError::Scheme(e) => e.into(),
            OrchestratorError::Feature(e) => e.into(),
        }
    }
}

/// One row of the uploaded corpus, before it's split into train/test.
#[derive(Debug, Clone)]
pub struct SourceRow {
    pub element_id: String,
    pub text: String,
    pub context: std::collections::HashMap<String, String>,
    pub label: Option<String>,
}

pub struct CreateProjectRequest {
    pub slug: String,
    pub col_text: String,
    pub cols_context: Vec<String>,
    pub col_label: Option<String>,
    pub n_test: usize,
    pub rows: Vec<SourceRow>,
}

pub struct Orchestrator {
    db: Arc<Db>,
    queue: Arc<Queue>,
    schemes: Arc<Schemes>,
    features: Arc<Features>,
    quickmodels: Arc<QuickModels>,
    languagemodels: Arc<LanguageModels>,
    loaded: Mutex<LruCache<String, Arc<Project>>>,
}

impl Orchestrator {
    pub fn new(
        db: Arc<Db>,
        queue: Arc<Queue>,
        schemes: Arc<Schemes>,
        features: Arc<Features>,
        quickmodels: Arc<QuickModels>,
        languagemodels: Arc<LanguageModels>,
        max_loaded_projects: usize,
    ) -> Self {
        let capacity = NonZeroUsize::new(max_loaded_projects.max(1)).expect("capacity is non-zero");
        Self {
            db,
            queue,
            schemes,
            features,
            quickmodels,
            languagemodels,
            loaded: Mutex::new(LruCache::new(capacity)),
        }
    }

    /// Loads the project on a cache miss; evicts the least-recently-used
    /// entry on overflow. The eviction never touches the database or
    /// in-flight tasks.
    pub async fn get_project(&self, slug: &str) -> Result<Arc<Project>, OrchestratorError> {
        {
            let mut cache = self.loaded.lock().await;
            if let Some(p) = cache.get(slug) {
                return Ok(p.clone());
            }
        }

        self.db.get_project(slug).await?.ok_or_else(|| OrchestratorError::NotFound(slug.to_string()))?;

        let project = Arc::new(Project::new(
            slug,
            self.db.clone(),
            self.schemes.clone(),
            self.features.clone(),
            self.quickmodels.clone(),
            self.languagemodels.clone(),
        ));
        self.loaded.lock().await.put(slug.to_string(), project.clone());
        Ok(project)
    }

    /// Validates slug uniqueness, splits the corpus into train/test by
    /// drawing the test set exclusively from rows with no label (erroring
    /// if there aren't `n_test` of them), registers a `dataset` feature over
    /// the raw text column, and — when a label column was supplied — creates
    /// a default scheme and replays train-partition labels as annotations
    /// attributed to `user`. Test-partition rows keep a null current label,
    /// since they're held out for evaluation.
    pub async fn create_project(&self, req: CreateProjectRequest, user: &str) -> Result<(), OrchestratorError> {
        if self.db.get_project(&req.slug).await?.is_some() {
            return Err(OrchestratorError::AlreadyExists(req.slug));
        }

        let (train, test) = partition_corpus(&req.rows, req.n_test)?;
        let n_total = req.rows.len();

        self.db
            .add_project(&ProjectRecord {
                slug: req.slug.clone(),
                created_by: user.to_string(),
                created_at: Utc::now(),
                params: ProjectParams {
                    col_text: req.col_text.clone(),
                    cols_context: req.cols_context.clone(),
                    n_train: train.len(),
                    n_test: test.len(),
                    col_label: req.col_label.clone(),
                },
            })
            .await?;

        self.features
            .compute_dataset(&req.slug, "dataset", &req.col_text, user, n_total, n_total)
            .await?;

        if req.col_label.is_some() {
            let mut labels: Vec<String> = req.rows.iter().filter_map(|r| r.label.clone()).collect();
            labels.sort();
            labels.dedup();
            if !labels.is_empty() {
                self.schemes.add_scheme(&req.slug, "default", SchemeKind::Multiclass, labels).await?;
                for row in train.iter() {
                    if let Some(label) = req.rows.iter().find(|r| r.element_id == row.element_id).and_then(|r| r.label.clone()) {
                        self.schemes
                            .push_annotation(&req.slug, &row.element_id, "default", Some(&label), user, row.dataset, "initial import")
                            .await?;
                    }
                }
            }
        }

        self.log_action(user, "create_project", Some(&req.slug)).await?;
        Ok(())
    }

    /// Cascades DB deletions (see `Db::delete_project`) and evicts the
    /// in-memory handle. Does not remove any on-disk corpus directory: the
    /// corpus store itself is out of scope (spec.md §1).
    pub async fn delete_project(&self, slug: &str) -> Result<(), OrchestratorError> {
        self.db.delete_project(slug).await?;
        self.loaded.lock().await.pop(slug);
        Ok(())
    }

    pub async fn stop_user_processes(&self, kinds: &[TaskKind], user: &str) -> usize {
        self.queue.stop_user_processes(kinds, user).await
    }

    pub async fn log_action(&self, user: &str, action: &str, project: Option<&str>) -> Result<(), OrchestratorError> {
        self.db
            .add_log(&LogEntry {
                id: Uuid::new_v4(),
                time: Utc::now(),
                user: user.to_string(),
                project_slug: project.map(|s| s.to_string()),
                action: action.to_string(),
            })
            .await?;
        Ok(())
    }
}

/// Splits rows into (train, test). The test set is drawn exclusively from
/// rows with no label — labeled rows are never held out, since the current
/// label on a test-partition row would otherwise leak into what's supposed
/// to be an unlabeled evaluation set. Errors if fewer than `n_test`
/// unlabeled rows exist.
fn partition_corpus(rows: &[SourceRow], n_test: usize) -> Result<(Vec<CorpusRow>, Vec<CorpusRow>), OrchestratorError> {
    let unlabeled: usize = rows.iter().filter(|r| r.label.is_none()).count();
    if unlabeled < n_test {
        return Err(OrchestratorError::InsufficientTestData { requested: n_test, available: unlabeled });
    }

    let mut test_ids: HashSet<String> = HashSet::new();
    for row in rows.iter().filter(|r| r.label.is_none()) {
        if test_ids.len() >= n_test {
            break;
        }
        test_ids.insert(row.element_id.clone());
    }

    let mut train = Vec::new();
    let mut test = Vec::new();
    for row in rows {
        let dataset = if test_ids.contains(&row.element_id) { DatasetPartition::Test } else { DatasetPartition::Train };
        let corpus_row = CorpusRow { element_id: row.element_id.clone(), text: row.text.clone(), context: row.context.clone(), dataset };
        if dataset == DatasetPartition::Test {
            test.push(corpus_row);
        } else {
            train.push(corpus_row);
        }
    }
    Ok((train, test))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tigger_core::db::Db as CoreDb;

    async fn setup() -> Orchestrator {
        let db = Arc::new(CoreDb::new_in_memory().await.unwrap());
        let queue = Arc::new(Queue::new(2, 1));
        let schemes = Arc::new(Schemes::new(db.clone()));
        let features = Arc::new(Features::new(db.clone(), queue.clone()));
        let dir = tempfile::tempdir().unwrap();
        let quickmodels = Arc::new(QuickModels::new(db.clone(), queue.clone(), dir.into_path()));
        let languagemodels = Arc::new(LanguageModels::new(db.clone(), queue.clone(), features.clone()));
        Orchestrator::new(db, queue, schemes, features, quickmodels, languagemodels, 2)
    }

    fn rows() -> Vec<SourceRow> {
        (0..10)
            .map(|i| SourceRow {
                element_id: format!("e{i}"),
                text: format!("text {i}"),
                context: Default::default(),
                label: if i < 6 { Some(if i % 2 == 0 { "pos".to_string() } else { "neg".to_string() }) } else { None },
            })
            .collect()
    }

    #[tokio::test]
    async fn create_project_rejects_slug_collision() {
        let orch = setup().await;
        let req = CreateProjectRequest { slug: "demo".into(), col_text: "text".into(), cols_context: vec![], col_label: Some("label".into()), n_test: 2, rows: rows() };
        orch.create_project(req, "alice").await.unwrap();

        let req2 = CreateProjectRequest { slug: "demo".into(), col_text: "text".into(), cols_context: vec![], col_label: None, n_test: 1, rows: rows() };
        let err = orch.create_project(req2, "alice").await.unwrap_err();
        assert!(matches!(err, OrchestratorError::AlreadyExists(_)));
    }

    #[tokio::test]
    async fn create_project_draws_test_set_from_unlabeled_rows_only() {
        let orch = setup().await;
        let req = CreateProjectRequest { slug: "demo".into(), col_text: "text".into(), cols_context: vec![], col_label: Some("label".into()), n_test: 3, rows: rows() };
        orch.create_project(req, "alice").await.unwrap();

        let stored = orch.db.get_project("demo").await.unwrap().unwrap();
        assert_eq!(stored.params.n_test, 3);
        assert_eq!(stored.params.n_train, 7);
    }

    #[tokio::test]
    async fn create_project_replays_labels_as_annotations() {
        let orch = setup().await;
        let req = CreateProjectRequest { slug: "demo".into(), col_text: "text".into(), cols_context: vec![], col_label: Some("label".into()), n_test: 2, rows: rows() };
        orch.create_project(req, "alice").await.unwrap();

        let data = orch.schemes.get_scheme_data("demo", "default", &[DatasetPartition::Train, DatasetPartition::Test]).await.unwrap();
        assert_eq!(data.len(), 6);
        assert!(data.iter().all(|a| a.dataset == DatasetPartition::Train));
    }

    #[tokio::test]
    async fn create_project_errors_when_not_enough_unlabeled_rows_for_test() {
        let orch = setup().await;
        let all_labeled: Vec<SourceRow> = rows().into_iter().map(|mut r| { r.label.get_or_insert_with(|| "pos".to_string()); r }).collect();
        let req = CreateProjectRequest { slug: "demo".into(), col_text: "text".into(), cols_context: vec![], col_label: Some("label".into()), n_test: 20, rows: all_labeled };
        let err = orch.create_project(req, "alice").await.unwrap_err();
        assert!(matches!(err, OrchestratorError::InsufficientTestData { requested: 20, available: 0 }));
    }

    #[tokio::test]
    async fn get_project_evicts_lru_entry_over_capacity() {
        let orch = setup().await;
        for slug in ["p1", "p2", "p3"] {
            let req = CreateProjectRequest { slug: slug.into(), col_text: "text".into(), cols_context: vec![], col_label: None, n_test: 0, rows: vec![] };
            orch.create_project(req, "alice").await.unwrap();
        }
        orch.get_project("p1").await.unwrap();
        orch.get_project("p2").await.unwrap();
        orch.get_project("p3").await.unwrap(); // evicts p1 (capacity 2)

        assert_eq!(orch.loaded.lock().await.len(), 2);
        assert!(!orch.loaded.lock().await.contains("p1"));
    }

    #[tokio::test]
    async fn delete_project_evicts_and_cascades() {
        let orch = setup().await;
        let req = CreateProjectRequest { slug: "demo".into(), col_text: "text".into(), cols_context: vec![], col_label: None, n_test: 0, rows: vec![] };
        orch.create_project(req, "alice").await.unwrap();
        orch.get_project("demo").await.unwrap();

        orch.delete_project("demo").await.unwrap();
        assert!(orch.db.get_project("demo").await.unwrap().is_none());
        assert!(!orch.loaded.lock().await.contains("demo"));
    }
}
