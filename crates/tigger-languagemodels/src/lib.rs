//! Fine-tuned language model lifecycle: train/predict/test/rename/delete,
//! status transitions, and predict-output registration as a feature.
//!
//! Grounded in `server.py`'s bert endpoints and `db.py`'s model rows shared
//! with QuickModels. The fine-tuning inner loop itself (the transformer
//! training step, tokenization, GPU scheduling internals) is out of scope
//! (spec.md §1 Non-goals) — callers supply it as a `work` closure, the same
//! shape `tigger-features` uses for its async feature kinds. This crate's
//! contract is exactly spec.md §4.6's: launch the task, move the status
//! machine, and register a completed predict job's output as a new feature
//! named after the model, with columns `label_0, label_1, ...` over the
//! scheme's label order.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tigger_core::db::{Db, DbError, ModelRow};
use tigger_core::types::{FeatureKind, LanguageModelStatus, TaskKind, TaskQueueKind};
use tigger_features::{FeatureError, Features};
use tigger_queue::Queue;
use uuid::Uuid;

#[derive(Debug, thiserror::Error)]
pub enum LanguageModelError {
    #[error("model not found: {0}")]
    NotFound(String),
    #[error("model already exists: {0}")]
    AlreadyExists(String),
    #[error("model {0} is not eligible for prediction (status must be trained)")]
    NotPredictEligible(String),
    #[error("invalid status transition for {0}: {1:?} -> {2:?}")]
    InvalidTransition(String, LanguageModelStatus, LanguageModelStatus),
    #[error(transparent)]
    Db(#[from] DbError),
    #[error(transparent)]
    Feature(#[from] FeatureError),
}

impl From<&LanguageModelError> for tigger_core::error::ErrorKind {
    fn from(err: &LanguageModelError) -> Self {
        use tigger_core::error::ErrorKind;
        match err {
            LanguageModelError::NotFound(_) => ErrorKind::NotFound,
            LanguageModelError::AlreadyExists(_) => ErrorKind::AlreadyExists,
            LanguageModelError::NotPredictEligible(_) => ErrorKind::Unavailable,
            LanguageModelError::InvalidTransition(..) => ErrorKind::Invalid,
            LanguageModelError::Db(e) => e.into(),
            LanguageModelError::Feature(e) => e.into(),
        }
    }
}

/// One row of predict output: the element it scores, the argmax label, and
/// the full per-label probability map (keys are scheme label names).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PredictedRow {
    pub element_id: String,
    pub label: String,
    pub proba: std::collections::HashMap<String, f64>,
}

pub struct LanguageModels {
    db: Arc<Db>,
    queue: Arc<Queue>,
    features: Arc<Features>,
}

impl LanguageModels {
    pub fn new(db: Arc<Db>, queue: Arc<Queue>, features: Arc<Features>) -> Self {
        Self { db, queue, features }
    }

    fn status_of(row: &ModelRow) -> LanguageModelStatus {
        serde_json::from_value(serde_json::Value::String(row.status.clone())).expect("valid status")
    }

    /// Registers the model `queued`, then submits training to the GPU pool.
    /// `work` returns the metrics to persist on success.
    pub async fn train<F, Fut>(
        &self,
        project_slug: &str,
        name: &str,
        scheme: &str,
        user: &str,
        base_model: &str,
        work: F,
    ) -> Result<Uuid, LanguageModelError>
    where
        F: FnOnce(tigger_queue::CancelSignal) -> Fut + Send + 'static,
        Fut: std::future::Future<Output = Result<serde_json::Value, String>> + Send + 'static,
    {
        if self.db.get_model(project_slug, name).await?.is_some() {
            return Err(LanguageModelError::AlreadyExists(name.to_string()));
        }
        self.db
            .add_model(
                project_slug,
                name,
                "language",
                scheme,
                user,
                "queued",
                &serde_json::json!({"base_model": base_model}),
            )
            .await?;

        let db = self.db.clone();
        let project = project_slug.to_string();
        let name_owned = name.to_string();
        let id = self
            .queue
            .add_task(TaskKind::LanguageModelTrain, project_slug, user, TaskQueueKind::Gpu, move |cancel| async move {
                let _ = db.set_model_status(&project, &name_owned, "training").await;
                let result = work(cancel).await;
                match &result {
                    Ok(metrics) => {
                        let mut m = tigger_core::types::ModelMetrics::default();
                        m.train = Some(metrics.clone());
                        let _ = db.update_model_metrics(&project, &name_owned, &m).await;
                        let _ = db.set_model_status(&project, &name_owned, "trained").await;
                    }
                    Err(_) => {
                        let _ = db.set_model_status(&project, &name_owned, "failed").await;
                    }
                }
                result
            })
            .await;
        Ok(id)
    }

    /// Requeues a failed model for another training attempt.
    pub async fn retry(&self, project_slug: &str, name: &str) -> Result<(), LanguageModelError> {
        let row = self.require_model(project_slug, name).await?;
        let current = Self::status_of(&row);
        if !current.can_transition_to(&LanguageModelStatus::Queued) {
            return Err(LanguageModelError::InvalidTransition(name.to_string(), current, LanguageModelStatus::Queued));
        }
        self.db.set_model_status(project_slug, name, "queued").await?;
        Ok(())
    }

    /// Runs inference via `work`, then — on success — registers the output
    /// as a feature named after the model with `label_i` columns over
    /// `label_order`, via `Features::add`.
    #[allow(clippy::too_many_arguments)]
    pub async fn predict<F, Fut>(
        &self,
        project_slug: &str,
        name: &str,
        user: &str,
        label_order: Vec<String>,
        expected_rows: usize,
        work: F,
    ) -> Result<Uuid, LanguageModelError>
    where
        F: FnOnce(tigger_queue::CancelSignal) -> Fut + Send + 'static,
        Fut: std::future::Future<Output = Result<Vec<PredictedRow>, String>> + Send + 'static,
    {
        let row = self.require_model(project_slug, name).await?;
        let status = Self::status_of(&row);
        if !status.is_predict_eligible() {
            return Err(LanguageModelError::NotPredictEligible(name.to_string()));
        }

        let features = self.features.clone();
        let project = project_slug.to_string();
        let name_owned = name.to_string();
        let user_owned = user.to_string();
        let id = self
            .queue
            .add_task(TaskKind::LanguageModelPredict, project_slug, user, TaskQueueKind::Gpu, move |cancel| async move {
                let rows = work(cancel).await?;
                let columns: Vec<String> = (0..label_order.len()).map(|i| format!("label_{i}")).collect();
                features
                    .add(
                        &project,
                        &name_owned,
                        FeatureKind::LanguageModelPrediction,
                        &user_owned,
                        serde_json::json!({"labels": label_order}),
                        columns,
                        rows.len(),
                        expected_rows,
                    )
                    .await
                    .map_err(|e| e.to_string())?;
                Ok(serde_json::to_value(&rows).unwrap_or_default())
            })
            .await;
        Ok(id)
    }

    /// Scores a held-out set and persists per-partition metrics, without
    /// registering a feature (that's `predict`'s job).
    pub async fn test<F, Fut>(&self, project_slug: &str, name: &str, user: &str, work: F) -> Result<Uuid, LanguageModelError>
    where
        F: FnOnce(tigger_queue::CancelSignal) -> Fut + Send + 'static,
        Fut: std::future::Future<Output = Result<serde_json::Value, String>> + Send + 'static,
    {
        let row = self.require_model(project_slug, name).await?;
        let status = Self::status_of(&row);
        if !status.is_predict_eligible() {
            return Err(LanguageModelError::NotPredictEligible(name.to_string()));
        }
        let db = self.db.clone();
        let project = project_slug.to_string();
        let name_owned = name.to_string();
        let id = self
            .queue
            .add_task(TaskKind::LanguageModelTest, project_slug, user, TaskQueueKind::Gpu, move |cancel| async move {
                let metrics = work(cancel).await?;
                let mut m = db.get_model(&project, &name_owned).await.map_err(|e| e.to_string())?.map(|r| r.metrics).unwrap_or_default();
                m.test = Some(metrics);
                db.update_model_metrics(&project, &name_owned, &m).await.map_err(|e| e.to_string())?;
                Ok(serde_json::json!({}))
            })
            .await;
        Ok(id)
    }

    pub async fn rename(&self, project_slug: &str, old_name: &str, new_name: &str) -> Result<(), LanguageModelError> {
        self.db.rename_model(project_slug, old_name, new_name).await?;
        Ok(())
    }

    pub async fn delete(&self, project_slug: &str, name: &str) -> Result<(), LanguageModelError> {
        self.db.delete_model(project_slug, name).await?;
        Ok(())
    }

    pub async fn list(&self, project_slug: &str) -> Result<Vec<ModelRow>, LanguageModelError> {
        Ok(self.db.list_models(project_slug, "language").await?)
    }

    pub async fn get_informations(&self, project_slug: &str, name: &str) -> Result<ModelRow, LanguageModelError> {
        self.require_model(project_slug, name).await
    }

    async fn require_model(&self, project_slug: &str, name: &str) -> Result<ModelRow, LanguageModelError> {
        self.db.get_model(project_slug, name).await?.ok_or_else(|| LanguageModelError::NotFound(name.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tigger_core::types::{Project, ProjectParams};

    async fn setup() -> (LanguageModels, Arc<Db>, Arc<Queue>) {
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
        let features = Arc::new(Features::new(db.clone(), queue.clone()));
        (LanguageModels::new(db.clone(), queue.clone(), features), db, queue)
    }

    #[tokio::test]
    async fn train_moves_status_to_trained_on_success() {
        let (lm, db, queue) = setup().await;
        let id = lm.train("demo", "bert1", "default", "alice", "camembert-base", |_| async { Ok(serde_json::json!({"loss": 0.1})) }).await.unwrap();
        let outcome = queue.outcomes().recv_async().await.unwrap();
        assert_eq!(outcome.unique_id, id);

        let row = db.get_model("demo", "bert1").await.unwrap().unwrap();
        assert_eq!(row.status, "trained");
    }

    #[tokio::test]
    async fn predict_rejected_before_training_completes() {
        let (lm, _db, _queue) = setup().await;
        lm.train("demo", "bert1", "default", "alice", "camembert-base", |_| async { Ok(serde_json::json!({})) }).await.unwrap();
        // status is "training" (not yet reaped to "trained") until the outcome is drained.
        let err = lm
            .predict("demo", "bert1", "alice", vec!["pos".into(), "neg".into()], 2, |_| async { Ok(vec![]) })
            .await
            .unwrap_err();
        assert!(matches!(err, LanguageModelError::NotPredictEligible(_)));
    }

    #[tokio::test]
    async fn predict_registers_output_as_feature() {
        let (lm, db, queue) = setup().await;
        lm.train("demo", "bert1", "default", "alice", "camembert-base", |_| async { Ok(serde_json::json!({})) }).await.unwrap();
        let _ = queue.outcomes().recv_async().await.unwrap();

        lm.predict("demo", "bert1", "alice", vec!["pos".into(), "neg".into()], 1, |_| async {
            let mut proba = std::collections::HashMap::new();
            proba.insert("pos".to_string(), 0.9);
            proba.insert("neg".to_string(), 0.1);
            Ok(vec![PredictedRow { element_id: "e1".into(), label: "pos".into(), proba }])
        })
        .await
        .unwrap();
        let outcome = queue.outcomes().recv_async().await.unwrap();
        assert!(outcome.result.is_ok());

        let feature = db.get_feature("demo", "bert1").await.unwrap().unwrap();
        assert_eq!(feature.columns, vec!["bert1__label_0".to_string(), "bert1__label_1".to_string()]);
    }
}
