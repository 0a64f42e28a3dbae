//! The project aggregate: wires schemes, features, and models together and
//! implements the active-learning element-selection policy.
//!
//! Grounded in `project.py::Project` and `server.py::next_element`. Loading
//! the raw corpus (upload/CSV parsing) is out of scope (spec.md §1); the
//! caller supplies `CorpusRow`s — this crate owns the filter pipeline,
//! selection-mode dispatch, and the indicator/history/limit shaping of the
//! returned element.

use std::collections::HashMap;

use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use regex::Regex;
use tigger_core::types::{Annotation, DatasetPartition, SampleFilter, SelectionMode};
use tigger_quickmodels::PredictionRow;

#[derive(Debug, thiserror::Error)]
pub enum ProjectError {
    #[error("no element available after filtering")]
    NoElementAvailable,
    #[error("invalid filter regex: {0}")]
    InvalidFilter(String),
    #[error("selection mode {0:?} requires a quick model prediction")]
    MissingPredictions(SelectionMode),
    #[error("selection mode maxprob requires a tag")]
    MissingTag,
}

impl From<&ProjectError> for tigger_core::error::ErrorKind {
    fn from(err: &ProjectError) -> Self {
        use tigger_core::error::ErrorKind;
        match err {
            ProjectError::NoElementAvailable => ErrorKind::NotFound,
            ProjectError::InvalidFilter(_) => ErrorKind::Invalid,
            ProjectError::MissingPredictions(_) => ErrorKind::Unavailable,
            ProjectError::MissingTag => ErrorKind::Invalid,
        }
    }
}

/// One row of the (out-of-scope-to-persist) raw corpus: identity, text,
/// context columns, and the partition it was assigned to at project creation.
#[derive(Debug, Clone)]
pub struct CorpusRow {
    pub element_id: String,
    pub text: String,
    pub context: HashMap<String, String>,
    pub dataset: DatasetPartition,
}

/// A 2-D projection coordinate (e.g. UMAP/t-SNE), kept per user, per
/// element — used only by the optional `frame` sub-filter.
pub type ProjectionMap = HashMap<String, (f64, f64)>;

pub struct NextElementRequest<'a> {
    pub corpus: &'a [CorpusRow],
    pub current_labels: &'a HashMap<String, Option<String>>,
    pub scheme: &'a str,
    pub selection: SelectionMode,
    pub sample: SampleFilter,
    pub user: &'a str,
    pub tag: Option<&'a str>,
    pub history: &'a [String],
    pub frame: Option<[f64; 4]>,
    pub filter: Option<&'a str>,
    pub projections: Option<&'a ProjectionMap>,
    pub predictions: Option<&'a HashMap<String, PredictionRow>>,
    pub seed: u64,
    pub limit: usize,
}

#[derive(Debug, Clone)]
pub struct NextElement {
    pub element_id: String,
    pub text: String,
    pub context: HashMap<String, String>,
    pub selection_mode: SelectionMode,
    pub indicator: String,
    pub current_prediction: Option<PredictionRow>,
    pub history: Vec<Annotation>,
    pub limit: usize,
}

/// Filters `req.corpus` down to candidates, then dispatches to the
/// selection mode. Pure function over caller-supplied state — no DB access
/// — so the `Project` aggregate can thread in DB-backed history separately.
pub fn select_next_element(req: &NextElementRequest) -> Result<(String, String), ProjectError> {
    let mut candidates: Vec<&CorpusRow> = req.corpus.iter().collect();

    if req.selection == SelectionMode::Test {
        candidates.retain(|row| row.dataset == DatasetPartition::Test && req.current_labels.get(&row.element_id).cloned().flatten().is_none());
    } else {
        candidates.retain(|row| match req.sample {
            SampleFilter::Untagged => req.current_labels.get(&row.element_id).cloned().flatten().is_none(),
            SampleFilter::Tagged => req.current_labels.get(&row.element_id).cloned().flatten().is_some(),
            SampleFilter::All => true,
        });
    }

    if let Some(pattern) = req.filter {
        let (regex_src, against_context) = match pattern.strip_prefix("CONTEXT=") {
            Some(rest) => (rest, true),
            None => (pattern, false),
        };
        let re = Regex::new(regex_src).map_err(|e| ProjectError::InvalidFilter(e.to_string()))?;
        candidates.retain(|row| {
            if against_context {
                let joined = row.context.values().cloned().collect::<Vec<_>>().join(" ");
                re.is_match(&joined)
            } else {
                re.is_match(&row.text)
            }
        });
    }

    if let (Some(frame), Some(projections)) = (req.frame, req.projections) {
        let [xmin, xmax, ymin, ymax] = frame;
        candidates.retain(|row| match projections.get(&row.element_id) {
            Some(&(x, y)) => x >= xmin && x <= xmax && y >= ymin && y <= ymax,
            None => false,
        });
    }

    candidates.retain(|row| !req.history.contains(&row.element_id));

    if candidates.is_empty() {
        return Err(ProjectError::NoElementAvailable);
    }

    match req.selection {
        SelectionMode::Deterministic => {
            let row = candidates[0];
            Ok((row.element_id.clone(), "deterministic order".to_string()))
        }
        SelectionMode::Random | SelectionMode::Test => {
            let mut rng = StdRng::seed_from_u64(req.seed);
            let row = candidates.choose(&mut rng).expect("non-empty candidates");
            Ok((row.element_id.clone(), "random sample".to_string()))
        }
        SelectionMode::Maxprob => {
            let tag = req.tag.ok_or(ProjectError::MissingTag)?;
            let predictions = req.predictions.ok_or(ProjectError::MissingPredictions(SelectionMode::Maxprob))?;
            let best = candidates
                .iter()
                .filter_map(|row| predictions.get(&row.element_id).map(|p| (row, p.proba.get(tag).copied().unwrap_or(0.0))))
                .max_by(|a, b| a.1.partial_cmp(&b.1).unwrap());
            match best {
                Some((row, proba)) => Ok((row.element_id.clone(), format!("probability: {proba:.2}"))),
                None => Err(ProjectError::MissingPredictions(SelectionMode::Maxprob)),
            }
        }
        SelectionMode::Active => {
            let predictions = req.predictions.ok_or(ProjectError::MissingPredictions(SelectionMode::Active))?;
            let best = candidates
                .iter()
                .filter_map(|row| predictions.get(&row.element_id).map(|p| (row, p.entropy)))
                .max_by(|a, b| a.1.partial_cmp(&b.1).unwrap());
            match best {
                Some((row, entropy)) => Ok((row.element_id.clone(), format!("entropy: {entropy:.2}"))),
                None => Err(ProjectError::MissingPredictions(SelectionMode::Active)),
            }
        }
    }
}

/// Shapes the selected candidate into the returned element: text, context,
/// current prediction, and annotation history.
pub fn build_next_element(
    req: &NextElementRequest,
    element_id: String,
    indicator: String,
    history: Vec<Annotation>,
) -> Result<NextElement, ProjectError> {
    let row = req.corpus.iter().find(|r| r.element_id == element_id).ok_or(ProjectError::NoElementAvailable)?;
    Ok(NextElement {
        element_id: element_id.clone(),
        text: row.text.clone(),
        context: row.context.clone(),
        selection_mode: req.selection,
        indicator,
        current_prediction: req.predictions.and_then(|p| p.get(&element_id)).cloned(),
        history,
        limit: req.limit,
    })
}

/// The in-memory, per-project aggregate `Orchestrator::get_project` loads
/// and evicts. Thin: it owns no storage of its own beyond the corpus/
/// projection caches that don't fit the in-scope persistence layer, and
/// delegates everything else to the component services.
pub struct Project {
    pub slug: String,
    pub db: std::sync::Arc<tigger_core::db::Db>,
    pub schemes: std::sync::Arc<tigger_schemes::Schemes>,
    pub features: std::sync::Arc<tigger_features::Features>,
    pub quickmodels: std::sync::Arc<tigger_quickmodels::QuickModels>,
    pub languagemodels: std::sync::Arc<tigger_languagemodels::LanguageModels>,
}

impl Project {
    pub fn new(
        slug: impl Into<String>,
        db: std::sync::Arc<tigger_core::db::Db>,
        schemes: std::sync::Arc<tigger_schemes::Schemes>,
        features: std::sync::Arc<tigger_features::Features>,
        quickmodels: std::sync::Arc<tigger_quickmodels::QuickModels>,
        languagemodels: std::sync::Arc<tigger_languagemodels::LanguageModels>,
    ) -> Self {
        Self { slug: slug.into(), db, schemes, features, quickmodels, languagemodels }
    }

    /// Builds the current-label map from annotation history, filters +
    /// selects a candidate, then fetches its per-element annotation
    /// history before handing back the shaped `NextElement`.
    pub async fn next_element(&self, req: NextElementRequestOwned) -> Result<NextElement, ProjectError> {
        let request = NextElementRequest {
            corpus: &req.corpus,
            current_labels: &req.current_labels,
            scheme: &req.scheme,
            selection: req.selection,
            sample: req.sample,
            user: &req.user,
            tag: req.tag.as_deref(),
            history: &req.history,
            frame: req.frame,
            filter: req.filter.as_deref(),
            projections: req.projections.as_ref(),
            predictions: req.predictions.as_ref(),
            seed: req.seed,
            limit: req.limit,
        };
        let (element_id, indicator) = select_next_element(&request)?;
        let history = self.db.history(&self.slug, &element_id, &req.scheme, 20).await.unwrap_or_default();
        build_next_element(&request, element_id, indicator, history)
    }
}

/// Owned counterpart of `NextElementRequest`, since the async `Project`
/// method needs to hold its inputs across an `.await` point.
pub struct NextElementRequestOwned {
    pub corpus: Vec<CorpusRow>,
    pub current_labels: HashMap<String, Option<String>>,
    pub scheme: String,
    pub selection: SelectionMode,
    pub sample: SampleFilter,
    pub user: String,
    pub tag: Option<String>,
    pub history: Vec<String>,
    pub frame: Option<[f64; 4]>,
    pub filter: Option<String>,
    pub projections: Option<ProjectionMap>,
    pub predictions: Option<HashMap<String, PredictionRow>>,
    pub seed: u64,
    pub limit: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn corpus() -> Vec<CorpusRow> {
        vec![
            CorpusRow { element_id: "e1".into(), text: "a cat sat".into(), context: HashMap::new(), dataset: DatasetPartition::Train },
            CorpusRow { element_id: "e2".into(), text: "a dog ran".into(), context: HashMap::new(), dataset: DatasetPartition::Train },
            CorpusRow { element_id: "e3".into(), text: "a bird flew".into(), context: HashMap::new(), dataset: DatasetPartition::Test },
        ]
    }

    fn base_request<'a>(corpus: &'a [CorpusRow], labels: &'a HashMap<String, Option<String>>) -> NextElementRequest<'a> {
        NextElementRequest {
            corpus,
            current_labels: labels,
            scheme: "default",
            selection: SelectionMode::Deterministic,
            sample: SampleFilter::Untagged,
            user: "alice",
            tag: None,
            history: &[],
            frame: None,
            filter: None,
            projections: None,
            predictions: None,
            seed: 42,
            limit: 10,
        }
    }

    #[test]
    fn deterministic_picks_first_untagged() {
        let corpus = corpus();
        let mut labels = HashMap::new();
        labels.insert("e1".to_string(), Some("pos".to_string()));
        let req = base_request(&corpus, &labels);
        let (id, _) = select_next_element(&req).unwrap();
        assert_eq!(id, "e2");
    }

    #[test]
    fn empty_candidates_raise_no_element_available() {
        let corpus = corpus();
        let mut labels = HashMap::new();
        for row in &corpus {
            labels.insert(row.element_id.clone(), Some("pos".to_string()));
        }
        let req = base_request(&corpus, &labels);
        assert!(matches!(select_next_element(&req), Err(ProjectError::NoElementAvailable)));
    }

    #[test]
    fn regex_filter_narrows_candidates() {
        let corpus = corpus();
        let labels = HashMap::new();
        let mut req = base_request(&corpus, &labels);
        req.filter = Some("bird");
        req.sample = SampleFilter::All;
        let (id, _) = select_next_element(&req).unwrap();
        assert_eq!(id, "e3");
    }

    #[test]
    fn test_mode_only_considers_test_partition_with_null_label() {
        let corpus = corpus();
        let labels = HashMap::new();
        let mut req = base_request(&corpus, &labels);
        req.selection = SelectionMode::Test;
        let (id, _) = select_next_element(&req).unwrap();
        assert_eq!(id, "e3");
    }

    #[test]
    fn maxprob_requires_tag() {
        let corpus = corpus();
        let labels = HashMap::new();
        let mut req = base_request(&corpus, &labels);
        req.selection = SelectionMode::Maxprob;
        req.sample = SampleFilter::All;
        assert!(matches!(select_next_element(&req), Err(ProjectError::MissingTag)));
    }

    #[test]
    fn maxprob_picks_highest_probability_for_tag() {
        let corpus = corpus();
        let labels = HashMap::new();
        let mut predictions = HashMap::new();
        let mut p1 = HashMap::new();
        p1.insert("pos".to_string(), 0.2);
        predictions.insert("e1".to_string(), PredictionRow { label: "neg".into(), proba: p1, entropy: 0.5 });
        let mut p2 = HashMap::new();
        p2.insert("pos".to_string(), 0.9);
        predictions.insert("e2".to_string(), PredictionRow { label: "pos".into(), proba: p2, entropy: 0.1 });

        let mut req = base_request(&corpus, &labels);
        req.sample = SampleFilter::All;
        req.selection = SelectionMode::Maxprob;
        req.tag = Some("pos");
        req.predictions = Some(&predictions);
        let (id, indicator) = select_next_element(&req).unwrap();
        assert_eq!(id, "e2");
        assert!(indicator.contains("0.90"));
    }

    #[test]
    fn history_excludes_recently_seen_elements() {
        let corpus = corpus();
        let labels = HashMap::new();
        let history = vec!["e1".to_string(), "e2".to_string()];
        let mut req = base_request(&corpus, &labels);
        req.sample = SampleFilter::All;
        req.history = &history;
        let (id, _) = select_next_element(&req).unwrap();
        assert_eq!(id, "e3");
    }

    #[tokio::test]
    async fn project_next_element_wires_scheme_history_through() {
        use std::sync::Arc;
        use tigger_core::db::Db;
        use tigger_core::types::{Project as ProjectRecord, ProjectParams, SchemeKind};
        use tigger_features::Features;
        use tigger_languagemodels::LanguageModels;
        use tigger_quickmodels::QuickModels;
        use tigger_queue::Queue;
        use tigger_schemes::Schemes;

        let db = Arc::new(Db::new_in_memory().await.unwrap());
        db.add_project(&ProjectRecord {
            slug: "demo".into(),
            created_by: "root".into(),
            created_at: chrono::Utc::now(),
            params: ProjectParams { col_text: "text".into(), cols_context: vec![], n_train: 2, n_test: 1, col_label: None },
        })
        .await
        .unwrap();

        let schemes = Arc::new(Schemes::new(db.clone()));
        schemes.add_scheme("demo", "default", SchemeKind::Multiclass, vec!["pos".into(), "neg".into()]).await.unwrap();
        schemes.push_annotation("demo", "e1", "default", Some("pos"), "alice", DatasetPartition::Train, "").await.unwrap();

        let queue = Arc::new(Queue::new(1, 1));
        let features = Arc::new(Features::new(db.clone(), queue.clone()));
        let dir = tempfile::tempdir().unwrap();
        let quickmodels = Arc::new(QuickModels::new(db.clone(), queue.clone(), dir.into_path()));
        let languagemodels = Arc::new(LanguageModels::new(db.clone(), queue.clone(), features.clone()));

        let project = Project::new("demo", db.clone(), schemes, features, quickmodels, languagemodels);

        let mut current_labels = HashMap::new();
        current_labels.insert("e1".to_string(), Some("pos".to_string()));

        let req = NextElementRequestOwned {
            corpus: corpus(),
            current_labels,
            scheme: "default".to_string(),
            selection: SelectionMode::Deterministic,
            sample: SampleFilter::Untagged,
            user: "alice".to_string(),
            tag: None,
            history: vec![],
            frame: None,
            filter: None,
            projections: None,
            predictions: None,
            seed: 1,
            limit: 10,
        };
        let next = project.next_element(req).await.unwrap();
        assert_eq!(next.element_id, "e2");
        assert!(next.history.is_empty());
    }
}
