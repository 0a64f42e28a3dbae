//! Domain types shared across the ActiveTigger core crates: projects,
//! dataset partitions, schemes, annotations, features, models, tasks, and
//! users/auth. These are the closed sum types and aggregate records that
//! every other crate in the workspace builds on.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Projects
// ---------------------------------------------------------------------------

/// A project's unique, URL-safe identifier (lowercased, hyphenated).
pub type Slug = String;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Project {
    pub slug: Slug,
    pub created_by: String,
    pub created_at: DateTime<Utc>,
    pub params: ProjectParams,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProjectParams {
    pub col_text: String,
    pub cols_context: Vec<String>,
    pub n_train: usize,
    pub n_test: usize,
    pub col_label: Option<String>,
}

/// One of {train, valid, test, external, all}. `All` is the union of the
/// original corpus including rows not placed in any split.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DatasetPartition {
    Train,
    Valid,
    Test,
    External,
    All,
}

impl DatasetPartition {
    pub fn as_str(&self) -> &'static str {
        match self {
            DatasetPartition::Train => "train",
            DatasetPartition::Valid => "valid",
            DatasetPartition::Test => "test",
            DatasetPartition::External => "external",
            DatasetPartition::All => "all",
        }
    }
}

// ---------------------------------------------------------------------------
// Schemes & Annotations
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SchemeKind {
    Multiclass,
    Multilabel,
    Hierarchical,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Scheme {
    pub project_slug: Slug,
    pub name: String,
    pub kind: SchemeKind,
    pub labels: Vec<String>,
    pub codebook: Option<String>,
}

impl Scheme {
    pub fn new(project_slug: Slug, name: impl Into<String>, kind: SchemeKind, labels: Vec<String>) -> Self {
        Self {
            project_slug,
            name: name.into(),
            kind,
            labels,
            codebook: None,
        }
    }

    pub fn has_label(&self, label: &str) -> bool {
        self.labels.iter().any(|l| l == label)
    }
}

/// Append-only annotation record. The current label of an element within
/// (scheme, user) is the record with the largest timestamp — there is no
/// separate "current label" table.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Annotation {
    pub id: Uuid,
    pub timestamp: DateTime<Utc>,
    pub dataset: DatasetPartition,
    pub user: String,
    pub project_slug: Slug,
    pub element_id: String,
    pub scheme: String,
    /// `None` represents a cleared label; history is never rewritten.
    pub annotation: Option<String>,
    pub comment: String,
}

impl Annotation {
    pub fn new(
        project_slug: Slug,
        element_id: impl Into<String>,
        scheme: impl Into<String>,
        annotation: Option<String>,
        user: impl Into<String>,
        dataset: DatasetPartition,
        comment: impl Into<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            timestamp: Utc::now(),
            dataset,
            user: user.into(),
            project_slug,
            element_id: element_id.into(),
            scheme: scheme.into(),
            annotation,
            comment: comment.into(),
        }
    }
}

// ---------------------------------------------------------------------------
// Features
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FeatureKind {
    Sbert,
    Fasttext,
    Dfm,
    Regex,
    Dataset,
    /// Registered by the LanguageModels lifecycle once a predict job
    /// completes; columns are `label_0, label_1, ...` over the scheme's
    /// label order (spec.md §4.6).
    LanguageModelPrediction,
}

impl FeatureKind {
    /// `sbert`/`fasttext`/`dfm` are queue-backed; `regex`/`dataset` run
    /// synchronously on the request path; `language_model_prediction` is
    /// registered after the fact, once a predict task has already produced
    /// its output.
    pub fn is_async(&self) -> bool {
        matches!(self, FeatureKind::Sbert | FeatureKind::Fasttext | FeatureKind::Dfm)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Feature {
    pub project_slug: Slug,
    pub name: String,
    pub kind: FeatureKind,
    pub owner: String,
    pub parameters: serde_json::Value,
    pub columns: Vec<String>,
}

impl Feature {
    /// Columns are namespaced `name__…` to avoid collisions across features.
    pub fn column_name(&self, suffix: &str) -> String {
        format!("{}__{}", self.name, suffix)
    }
}

// ---------------------------------------------------------------------------
// QuickModels
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QuickModelKind {
    Liblinear,
    Lasso,
    Knn,
    Randomforest,
    MultiNaivebayes,
}

impl QuickModelKind {
    /// Naive Bayes forces `dfm` features and disables standardization.
    pub fn forces_dfm(&self) -> bool {
        matches!(self, QuickModelKind::MultiNaivebayes)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum QuickModelHyperparameters {
    Liblinear { cost: f64 },
    Lasso { c: f64 },
    Knn { n_neighbors: usize },
    Randomforest { n_estimators: usize, max_features: Option<usize> },
    MultiNaivebayes { alpha: f64, fit_prior: bool, class_prior: Option<Vec<f64>> },
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ModelMetrics {
    pub train: Option<serde_json::Value>,
    pub valid: Option<serde_json::Value>,
    pub test: Option<serde_json::Value>,
    pub cv10: Option<serde_json::Value>,
    pub outofsample: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QuickModel {
    pub project_slug: Slug,
    pub name: String,
    pub scheme: String,
    pub user: String,
    pub hyperparameters: QuickModelHyperparameters,
    pub standardize: bool,
    pub metrics: ModelMetrics,
    pub created_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// LanguageModels
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LanguageModelStatus {
    Queued,
    Training,
    Trained,
    Failed,
}

impl LanguageModelStatus {
    pub fn can_transition_to(&self, target: &LanguageModelStatus) -> bool {
        use LanguageModelStatus::*;
        matches!(
            (self, target),
            (Queued, Training) | (Training, Trained) | (Training, Failed) | (Failed, Queued)
        )
    }

    /// Only `trained` models are predict-eligible.
    pub fn is_predict_eligible(&self) -> bool {
        matches!(self, LanguageModelStatus::Trained)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LanguageModel {
    pub project_slug: Slug,
    pub name: String,
    pub scheme: String,
    pub user: String,
    pub base_model: String,
    pub status: LanguageModelStatus,
    pub metrics: ModelMetrics,
    pub created_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Queue / Tasks
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskQueueKind {
    Cpu,
    Gpu,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    Pending,
    Running,
    Done,
    Failed,
    Cancelled,
}

impl TaskState {
    /// Transitions are monotonic: no state is ever revisited.
    pub fn can_transition_to(&self, target: &TaskState) -> bool {
        use TaskState::*;
        matches!(
            (self, target),
            (Pending, Running)
                | (Pending, Cancelled)
                | (Running, Done)
                | (Running, Failed)
                | (Running, Cancelled)
        )
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskState::Done | TaskState::Failed | TaskState::Cancelled)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskKind {
    FeatureSbert,
    FeatureFasttext,
    FeatureDfm,
    QuickModelTrain,
    LanguageModelTrain,
    LanguageModelPredict,
    LanguageModelTest,
}

#[derive(Debug, Clone)]
pub struct TaskRecord {
    pub unique_id: Uuid,
    pub kind: TaskKind,
    pub project_slug: Slug,
    pub user: String,
    pub queue: TaskQueueKind,
    pub submitted_at: DateTime<Utc>,
    pub state: TaskState,
}

// ---------------------------------------------------------------------------
// Users / Auth
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthStatus {
    Manager,
    Annotator,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct User {
    pub user_name: String,
    pub password_hash: String,
    pub role: String,
    pub created_by: Option<String>,
    pub mail: Option<String>,
    pub created_at: DateTime<Utc>,
    pub deactivated_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Auth {
    pub user: String,
    pub project_slug: Slug,
    pub status: AuthStatus,
}

// ---------------------------------------------------------------------------
// Logs, tokens, generations
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogEntry {
    pub id: Uuid,
    pub time: DateTime<Utc>,
    pub user: String,
    pub project_slug: Option<Slug>,
    pub action: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TokenStatus {
    Valid,
    Revoked,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenRecord {
    pub token: String,
    pub status: TokenStatus,
    pub time: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Generation {
    pub id: Uuid,
    pub time: DateTime<Utc>,
    pub user: String,
    pub project_slug: Slug,
    pub element_id: String,
    pub prompt_name: String,
    pub answer: String,
}

// ---------------------------------------------------------------------------
// Selection policy
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SampleFilter {
    Untagged,
    Tagged,
    All,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SelectionMode {
    Deterministic,
    Random,
    Maxprob,
    Active,
    Test,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn task_state_transitions_are_monotonic() {
        assert!(TaskState::Pending.can_transition_to(&TaskState::Running));
        assert!(!TaskState::Done.can_transition_to(&TaskState::Running));
        assert!(TaskState::Running.can_transition_to(&TaskState::Cancelled));
        assert!(TaskState::Done.is_terminal());
    }

    #[test]
    fn language_model_only_trained_is_predict_eligible() {
        assert!(!LanguageModelStatus::Training.is_predict_eligible());
        assert!(LanguageModelStatus::Trained.is_predict_eligible());
        assert!(LanguageModelStatus::Queued.can_transition_to(&LanguageModelStatus::Training));
        assert!(!LanguageModelStatus::Trained.can_transition_to(&LanguageModelStatus::Queued));
    }

    #[test]
    fn feature_column_name_is_namespaced() {
        let f = Feature {
            project_slug: "p".into(),
            name: "bert1".into(),
            kind: FeatureKind::Sbert,
            owner: "alice".into(),
            parameters: serde_json::json!({}),
            columns: vec![],
        };
        assert_eq!(f.column_name("0"), "bert1__0");
    }

    #[test]
    fn scheme_has_label() {
        let s = Scheme::new("p".into(), "default", SchemeKind::Multiclass, vec!["a".into(), "b".into()]);
        assert!(s.has_label("a"));
        assert!(!s.has_label("c"));
    }
}
