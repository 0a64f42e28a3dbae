//! Quick statistical model lifecycle: liblinear/lasso/knn/randomforest/
//! multi_naivebayes training, prediction, and metrics.
//!
//! Grounded in `quickmodels.py` (`compute_quickmodel`, `add`, `training`,
//! `get_prediction`, `export_prediction`, `get_informations`) and
//! `project.py::fit_simplemodel`. Building (X, Y) from the feature matrix
//! and the latest annotations — the join, the missing-row drop, the
//! partition split — is the `Project` aggregate's job (spec.md §4.7); this
//! crate receives already-assembled numeric rows and owns fit, predict,
//! metrics, uniqueness, and on-disk persistence of the fitted artifact.
//! There is no liblinear/libsvm binding in the dependency stack the
//! teacher or the rest of the pack carries, so each kind is a small,
//! from-scratch numeric routine rather than a wrapped C library. The
//! linear/logistic routine (`liblinear`, `lasso`) stores its weights on
//! `ndarray::{Array1, Array2}` and updates them with the
//! dot-product/`mapv_inplace` idiom from `knhk-neural::model::DenseLayer`
//! rather than nested `Vec<f64>` loops — see DESIGN.md for the rest of
//! the tradeoff this accepts (knn/forest/naive-bayes stay on plain slices,
//! since their update rules don't reduce to matrix algebra).

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use dashmap::DashMap;
use ndarray::{Array1, Array2};
use rand::seq::SliceRandom;
use rand::Rng;
use serde::{Deserialize, Serialize};
use tigger_core::db::{Db, DbError, ModelRow};
use tigger_core::types::{ModelMetrics, QuickModelHyperparameters, QuickModelKind, TaskKind, TaskQueueKind};
use tigger_queue::Queue;
use uuid::Uuid;

#[derive(Debug, thiserror::Error)]
pub enum QuickModelError {
    #[error("model not found: {0}")]
    NotFound(String),
    #[error("model already exists: {0}")]
    AlreadyExists(String),
    #[error("training set is empty")]
    EmptyTrainingSet,
    #[error("model is not trained yet: {0}")]
    NotTrained(String),
    #[error("feature row width does not match the fitted model")]
    ShapeMismatch,
    #[error("export format not supported: {0}")]
    UnsupportedFormat(String),
    #[error(transparent)]
    Db(#[from] DbError),
    #[error("{0}")]
    Io(String),
}

impl From<&QuickModelError> for tigger_core::error::ErrorKind {
    fn from(err: &QuickModelError) -> Self {
        use tigger_core::error::ErrorKind;
        match err {
            QuickModelError::NotFound(_) => ErrorKind::NotFound,
            QuickModelError::AlreadyExists(_) => ErrorKind::AlreadyExists,
            QuickModelError::EmptyTrainingSet => ErrorKind::Invalid,
            QuickModelError::NotTrained(_) => ErrorKind::Unavailable,
            QuickModelError::ShapeMismatch => ErrorKind::Invalid,
            QuickModelError::UnsupportedFormat(_) => ErrorKind::Invalid,
            QuickModelError::Db(e) => e.into(),
            QuickModelError::Io(_) => ErrorKind::Internal,
        }
    }
}

/// One training example: a dense feature row plus its ground-truth label.
#[derive(Debug, Clone)]
pub struct LabeledRow {
    pub features: Vec<f64>,
    pub label: String,
}

/// A model prediction: argmax label, the full per-class distribution, and
/// its Shannon entropy (the active-learning loop's uncertainty signal).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PredictionRow {
    pub label: String,
    pub proba: HashMap<String, f64>,
    pub entropy: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Artifact {
    label_vocab: Vec<String>,
    standardize: Option<(Vec<f64>, Vec<f64>)>,
    params: FittedParams,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
enum FittedParams {
    Linear { weights: Array2<f64>, bias: Array1<f64> },
    Knn { train_x: Vec<Vec<f64>>, train_y: Vec<usize>, k: usize },
    Forest { stumps: Vec<Stump> },
    NaiveBayes { log_prior: Vec<f64>, log_likelihood: Vec<Vec<f64>> },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Stump {
    feature: usize,
    threshold: f64,
    left_label: usize,
    right_label: usize,
}

pub struct QuickModels {
    db: Arc<Db>,
    queue: Arc<Queue>,
    base_dir: PathBuf,
    artifacts: Arc<DashMap<(String, String), Arc<Artifact>>>,
}

impl QuickModels {
    pub fn new(db: Arc<Db>, queue: Arc<Queue>, base_dir: PathBuf) -> Self {
        Self { db, queue, base_dir, artifacts: Arc::new(DashMap::new()) }
    }

    fn artifact_path(&self, project_slug: &str, name: &str) -> PathBuf {
        self.base_dir.join("quickmodels").join(project_slug).join(format!("{name}.json"))
    }

    /// Submits training to the CPU pool. Fails fast on a name collision
    /// unless `retrain` is set, in which case the prior model is replaced.
    #[allow(clippy::too_many_arguments)]
    pub async fn train(
        &self,
        project_slug: &str,
        name: &str,
        scheme: &str,
        user: &str,
        hyperparameters: QuickModelHyperparameters,
        standardize: bool,
        compute_cv10: bool,
        train_rows: Vec<LabeledRow>,
        valid_rows: Vec<LabeledRow>,
        test_rows: Vec<LabeledRow>,
        retrain: bool,
    ) -> Result<Uuid, QuickModelError> {
        if train_rows.is_empty() {
            return Err(QuickModelError::EmptyTrainingSet);
        }
        let exists = self.db.get_model(project_slug, name).await?.is_some();
        if exists && !retrain {
            return Err(QuickModelError::AlreadyExists(name.to_string()));
        }
        if exists {
            self.db.delete_model(project_slug, name).await?;
        }

        let kind = hyperparameters_kind(&hyperparameters);
        // multi_naivebayes forces dfm features and disables standardization.
        let standardize = standardize && !kind.forces_dfm();

        self.db
            .add_model(project_slug, name, "quick", scheme, user, "training", &serde_json::to_value(&hyperparameters).expect("serialize hyperparameters"))
            .await?;

        let db = self.db.clone();
        let artifacts = self.artifacts.clone();
        let base_dir = self.base_dir.clone();
        let project = project_slug.to_string();
        let name_owned = name.to_string();

        let id = self
            .queue
            .add_task(TaskKind::QuickModelTrain, project_slug, user, TaskQueueKind::Cpu, move |_cancel| async move {
                let outcome = fit_and_evaluate(&hyperparameters, standardize, compute_cv10, &train_rows, &valid_rows, &test_rows);
                match outcome {
                    Ok((artifact, metrics)) => {
                        let path = base_dir.join("quickmodels").join(&project).join(format!("{name_owned}.json"));
                        if let Some(parent) = path.parent() {
                            let _ = tokio::fs::create_dir_all(parent).await;
                        }
                        let bytes = serde_json::to_vec_pretty(&artifact).map_err(|e| e.to_string())?;
                        tokio::fs::write(&path, bytes).await.map_err(|e| e.to_string())?;
                        artifacts.insert((project.clone(), name_owned.clone()), Arc::new(artifact));
                        db.update_model_metrics(&project, &name_owned, &metrics).await.map_err(|e| e.to_string())?;
                        db.set_model_status(&project, &name_owned, "trained").await.map_err(|e| e.to_string())?;
                        Ok(serde_json::to_value(&metrics).unwrap_or_default())
                    }
                    Err(msg) => {
                        let _ = db.set_model_status(&project, &name_owned, "failed").await;
                        Err(msg)
                    }
                }
            })
            .await;
        Ok(id)
    }

    /// Loads the fitted artifact (from the in-memory cache, or disk on a
    /// cold restart) and runs inference on `rows`.
    pub async fn predict(&self, project_slug: &str, name: &str, rows: &[Vec<f64>]) -> Result<Vec<PredictionRow>, QuickModelError> {
        let model = self.db.get_model(project_slug, name).await?.ok_or_else(|| QuickModelError::NotFound(name.to_string()))?;
        if model.status != "trained" {
            return Err(QuickModelError::NotTrained(name.to_string()));
        }
        let artifact = self.load_artifact(project_slug, name).await?;
        rows.iter().map(|row| predict_row(&artifact, row)).collect()
    }

    async fn load_artifact(&self, project_slug: &str, name: &str) -> Result<Arc<Artifact>, QuickModelError> {
        let key = (project_slug.to_string(), name.to_string());
        if let Some(a) = self.artifacts.get(&key) {
            return Ok(a.clone());
        }
        let path = self.artifact_path(project_slug, name);
        let bytes = tokio::fs::read(&path).await.map_err(|e| QuickModelError::Io(e.to_string()))?;
        let artifact: Artifact = serde_json::from_slice(&bytes).map_err(|e| QuickModelError::Io(e.to_string()))?;
        let artifact = Arc::new(artifact);
        self.artifacts.insert(key, artifact.clone());
        Ok(artifact)
    }

    pub async fn delete(&self, project_slug: &str, name: &str) -> Result<(), QuickModelError> {
        self.db.delete_model(project_slug, name).await?;
        self.artifacts.remove(&(project_slug.to_string(), name.to_string()));
        let _ = tokio::fs::remove_file(self.artifact_path(project_slug, name)).await;
        Ok(())
    }

    pub async fn rename(&self, project_slug: &str, old_name: &str, new_name: &str) -> Result<(), QuickModelError> {
        self.db.rename_model(project_slug, old_name, new_name).await?;
        if let Some((_, artifact)) = self.artifacts.remove(&(project_slug.to_string(), old_name.to_string())) {
            self.artifacts.insert((project_slug.to_string(), new_name.to_string()), artifact);
        }
        let old_path = self.artifact_path(project_slug, old_name);
        let new_path = self.artifact_path(project_slug, new_name);
        let _ = tokio::fs::rename(&old_path, &new_path).await;
        Ok(())
    }

    pub async fn list(&self, project_slug: &str) -> Result<Vec<ModelRow>, QuickModelError> {
        Ok(self.db.list_models(project_slug, "quick").await?)
    }

    /// Hyperparameters + metrics for display, per `quickmodels.py::get_informations`.
    pub async fn get_informations(&self, project_slug: &str, name: &str) -> Result<ModelRow, QuickModelError> {
        self.db.get_model(project_slug, name).await?.ok_or_else(|| QuickModelError::NotFound(name.to_string()))
    }

    /// Serializes a prediction table to bytes. Only `csv` is supported —
    /// xlsx/parquet writers aren't in the dependency stack.
    pub fn export_prediction(&self, predictions: &[(String, PredictionRow)], format: &str) -> Result<Vec<u8>, QuickModelError> {
        if format != "csv" {
            return Err(QuickModelError::UnsupportedFormat(format.to_string()));
        }
        let mut labels: Vec<&str> = predictions
            .first()
            .map(|(_, p)| p.proba.keys().map(|s| s.as_str()).collect())
            .unwrap_or_default();
        labels.sort_unstable();

        let mut out = String::from("element_id,prediction,entropy");
        for l in &labels {
            out.push_str(&format!(",proba_{l}"));
        }
        out.push('\n');
        for (id, p) in predictions {
            out.push_str(&format!("{id},{},{}", p.label, p.entropy));
            for l in &labels {
                out.push_str(&format!(",{}", p.proba.get(*l).copied().unwrap_or(0.0)));
            }
            out.push('\n');
        }
        Ok(out.into_bytes())
    }
}

fn hyperparameters_kind(hp: &QuickModelHyperparameters) -> QuickModelKind {
    match hp {
        QuickModelHyperparameters::Liblinear { .. } => QuickModelKind::Liblinear,
        QuickModelHyperparameters::Lasso { .. } => QuickModelKind::Lasso,
        QuickModelHyperparameters::Knn { .. } => QuickModelKind::Knn,
        QuickModelHyperparameters::Randomforest { .. } => QuickModelKind::Randomforest,
        QuickModelHyperparameters::MultiNaivebayes { .. } => QuickModelKind::MultiNaivebayes,
    }
}

// ---------------------------------------------------------------------------
// Training / evaluation
// ---------------------------------------------------------------------------

fn fit_and_evaluate(
    hp: &QuickModelHyperparameters,
    standardize: bool,
    compute_cv10: bool,
    train_rows: &[LabeledRow],
    valid_rows: &[LabeledRow],
    test_rows: &[LabeledRow],
) -> Result<(Artifact, ModelMetrics), String> {
    let label_vocab = label_vocabulary(train_rows);
    if label_vocab.len() < 2 {
        return Err("training set needs at least two distinct labels".to_string());
    }
    let (x, y) = encode_rows(train_rows, &label_vocab);

    let scaling = if standardize { Some(fit_scaler(&x)) } else { None };
    let x_scaled = scaling.as_ref().map(|(m, s)| apply_scaler(&x, m, s)).unwrap_or_else(|| x.clone());

    let params = fit(hp, &x_scaled, &y, label_vocab.len())?;
    let artifact = Artifact { label_vocab: label_vocab.clone(), standardize: scaling.clone(), params };

    let train_preds = bulk_predict(&artifact, &x)?;
    let train_metrics = classification_metrics(&y, &train_preds, label_vocab.len());

    let cv10 = if compute_cv10 { Some(cross_validate(hp, standardize, &x, &y, label_vocab.len())?) } else { None };

    let valid_metrics = eval_partition(&artifact, valid_rows, &label_vocab)?;
    let test_metrics = eval_partition(&artifact, test_rows, &label_vocab)?;

    Ok((
        artifact,
        ModelMetrics {
            train: Some(train_metrics),
            valid: valid_metrics,
            test: test_metrics,
            cv10,
            outofsample: None,
        },
    ))
}

fn eval_partition(artifact: &Artifact, rows: &[LabeledRow], label_vocab: &[String]) -> Result<Option<serde_json::Value>, String> {
    if rows.is_empty() {
        return Ok(None);
    }
    let (x, y) = encode_rows(rows, label_vocab);
    let preds = bulk_predict(artifact, &x)?;
    Ok(Some(classification_metrics(&y, &preds, label_vocab.len())))
}

fn label_vocabulary(rows: &[LabeledRow]) -> Vec<String> {
    let mut labels: Vec<String> = rows.iter().map(|r| r.label.clone()).collect();
    labels.sort();
    labels.dedup();
    labels
}

fn encode_rows(rows: &[LabeledRow], label_vocab: &[String]) -> (Vec<Vec<f64>>, Vec<usize>) {
    let x = rows.iter().map(|r| r.features.clone()).collect();
    let y = rows
        .iter()
        .map(|r| label_vocab.iter().position(|l| l == &r.label).unwrap_or(0))
        .collect();
    (x, y)
}

fn fit_scaler(x: &[Vec<f64>]) -> (Vec<f64>, Vec<f64>) {
    let n_features = x[0].len();
    let n = x.len() as f64;
    let mut mean = vec![0.0; n_features];
    for row in x {
        for (m, v) in mean.iter_mut().zip(row.iter()) {
            *m += v / n;
        }
    }
    let mut std = vec![0.0; n_features];
    for row in x {
        for (s, (v, m)) in std.iter_mut().zip(row.iter().zip(mean.iter())) {
            *s += (v - m).powi(2) / n;
        }
    }
    for s in std.iter_mut() {
        *s = s.sqrt().max(1e-9);
    }
    (mean, std)
}

fn apply_scaler(x: &[Vec<f64>], mean: &[f64], std: &[f64]) -> Vec<Vec<f64>> {
    x.iter()
        .map(|row| row.iter().zip(mean.iter()).zip(std.iter()).map(|((v, m), s)| (v - m) / s).collect())
        .collect()
}

fn fit(hp: &QuickModelHyperparameters, x: &[Vec<f64>], y: &[usize], n_classes: usize) -> Result<FittedParams, String> {
    if x.is_empty() || x[0].is_empty() {
        return Err("training matrix has no columns".to_string());
    }
    match hp {
        QuickModelHyperparameters::Liblinear { cost } => {
            let (weights, bias) = fit_logistic_ovr(x, y, n_classes, 1.0 / cost.max(1e-6), 0.0);
            Ok(FittedParams::Linear { weights, bias })
        }
        QuickModelHyperparameters::Lasso { c } => {
            let (weights, bias) = fit_logistic_ovr(x, y, n_classes, 0.0, 1.0 / c.max(1e-6));
            Ok(FittedParams::Linear { weights, bias })
        }
        QuickModelHyperparameters::Knn { n_neighbors } => Ok(FittedParams::Knn {
            train_x: x.to_vec(),
            train_y: y.to_vec(),
            k: (*n_neighbors).max(1).min(x.len()),
        }),
        QuickModelHyperparameters::Randomforest { n_estimators, max_features } => {
            Ok(FittedParams::Forest { stumps: fit_random_forest(x, y, n_classes, *n_estimators, *max_features) })
        }
        QuickModelHyperparameters::MultiNaivebayes { alpha, fit_prior, class_prior } => {
            let (log_prior, log_likelihood) = fit_naive_bayes(x, y, n_classes, *alpha, *fit_prior, class_prior.as_deref());
            Ok(FittedParams::NaiveBayes { log_prior, log_likelihood })
        }
    }
}

fn sigmoid(z: f64) -> f64 {
    1.0 / (1.0 + (-z).exp())
}

/// One-vs-rest logistic regression via batch gradient descent. `l2`/`l1`
/// select liblinear- (ridge) vs. lasso-style (soft-thresholded) penalties.
/// Weights live in an `(n_classes, n_features)` matrix; each class's row
/// is updated with the forward/gradient idiom a dense layer uses: a
/// `dot` for the linear pass, `mapv_inplace` for the elementwise
/// activation and soft-threshold, `-=` for the step.
fn fit_logistic_ovr(x: &[Vec<f64>], y: &[usize], n_classes: usize, l2: f64, l1: f64) -> (Array2<f64>, Array1<f64>) {
    let n_features = x[0].len();
    let n = x.len();
    let lr = 0.2;
    let epochs = 300;

    let x_mat = Array2::from_shape_fn((n, n_features), |(i, j)| x[i][j]);
    let x_mat_t = x_mat.t();

    let mut weights = Array2::<f64>::zeros((n_classes, n_features));
    let mut bias = Array1::<f64>::zeros(n_classes);

    for c in 0..n_classes {
        let targets = Array1::from_shape_fn(n, |i| if y[i] == c { 1.0 } else { 0.0 });
        let mut w = weights.row(c).to_owned();
        let mut b = bias[c];

        for _ in 0..epochs {
            let mut z = x_mat.dot(&w) + b;
            z.mapv_inplace(sigmoid);
            let err = z - &targets;

            let mut grad_w = x_mat_t.dot(&err);
            grad_w /= n as f64;
            let grad_b = err.sum() / n as f64;

            let reg = &w * l2;
            w -= &((&grad_w + &reg) * lr);
            if l1 > 0.0 {
                let thresh = lr * l1;
                w.mapv_inplace(|wi| soft_threshold(wi, thresh));
            }
            b -= lr * grad_b;
        }

        weights.row_mut(c).assign(&w);
        bias[c] = b;
    }
    (weights, bias)
}

fn soft_threshold(w: f64, thresh: f64) -> f64 {
    if w > thresh {
        w - thresh
    } else if w < -thresh {
        w + thresh
    } else {
        0.0
    }
}

fn fit_random_forest(x: &[Vec<f64>], y: &[usize], n_classes: usize, n_estimators: usize, max_features: Option<usize>) -> Vec<Stump> {
    let n_features = x[0].len();
    let subset_size = max_features.unwrap_or_else(|| (n_features as f64).sqrt().ceil() as usize).clamp(1, n_features);
    let mut rng = rand::thread_rng();
    (0..n_estimators.max(1))
        .map(|_| {
            let indices: Vec<usize> = (0..x.len()).map(|_| rng.gen_range(0..x.len())).collect();
            let bag_x: Vec<&Vec<f64>> = indices.iter().map(|&i| &x[i]).collect();
            let bag_y: Vec<usize> = indices.iter().map(|&i| y[i]).collect();
            let mut feature_pool: Vec<usize> = (0..n_features).collect();
            feature_pool.shuffle(&mut rng);
            let candidates = &feature_pool[..subset_size];
            best_stump(&bag_x, &bag_y, n_classes, candidates)
        })
        .collect()
}

fn best_stump(x: &[&Vec<f64>], y: &[usize], n_classes: usize, candidate_features: &[usize]) -> Stump {
    let mut best = Stump { feature: candidate_features[0], threshold: 0.0, left_label: 0, right_label: 0 };
    let mut best_gini = f64::MAX;

    for &feature in candidate_features {
        let mut values: Vec<f64> = x.iter().map(|row| row[feature]).collect();
        values.sort_by(|a, b| a.partial_cmp(b).unwrap());
        values.dedup();
        for window in values.windows(2) {
            let threshold = (window[0] + window[1]) / 2.0;
            let (left_counts, right_counts) = split_counts(x, y, feature, threshold, n_classes);
            let gini = weighted_gini(&left_counts, &right_counts);
            if gini < best_gini {
                best_gini = gini;
                best = Stump {
                    feature,
                    threshold,
                    left_label: argmax_count(&left_counts),
                    right_label: argmax_count(&right_counts),
                };
            }
        }
    }
    best
}

fn split_counts(x: &[&Vec<f64>], y: &[usize], feature: usize, threshold: f64, n_classes: usize) -> (Vec<usize>, Vec<usize>) {
    let mut left = vec![0usize; n_classes];
    let mut right = vec![0usize; n_classes];
    for (row, &label) in x.iter().zip(y.iter()) {
        if row[feature] <= threshold {
            left[label] += 1;
        } else {
            right[label] += 1;
        }
    }
    (left, right)
}

fn gini(counts: &[usize]) -> f64 {
    let total: usize = counts.iter().sum();
    if total == 0 {
        return 0.0;
    }
    let total = total as f64;
    1.0 - counts.iter().map(|&c| (c as f64 / total).powi(2)).sum::<f64>()
}

fn weighted_gini(left: &[usize], right: &[usize]) -> f64 {
    let n_left: usize = left.iter().sum();
    let n_right: usize = right.iter().sum();
    let n = (n_left + n_right).max(1) as f64;
    (n_left as f64 / n) * gini(left) + (n_right as f64 / n) * gini(right)
}

fn argmax_count(counts: &[usize]) -> usize {
    counts.iter().enumerate().max_by_key(|(_, &c)| c).map(|(i, _)| i).unwrap_or(0)
}

fn fit_naive_bayes(x: &[Vec<f64>], y: &[usize], n_classes: usize, alpha: f64, fit_prior: bool, class_prior: Option<&[f64]>) -> (Vec<f64>, Vec<Vec<f64>>) {
    let n_features = x[0].len();
    let mut feature_count = vec![vec![0.0; n_features]; n_classes];
    let mut class_count = vec![0.0; n_classes];
    for (row, &label) in x.iter().zip(y.iter()) {
        class_count[label] += 1.0;
        for (f, v) in row.iter().enumerate() {
            feature_count[label][f] += v.max(0.0);
        }
    }
    let log_prior: Vec<f64> = if let Some(cp) = class_prior {
        cp.iter().map(|p| p.max(1e-9).ln()).collect()
    } else if fit_prior {
        let n = x.len() as f64;
        class_count.iter().map(|c| ((c + 1e-9) / n).ln()).collect()
    } else {
        vec![(1.0 / n_classes as f64).ln(); n_classes]
    };
    let log_likelihood = feature_count
        .iter()
        .map(|counts| {
            let total: f64 = counts.iter().sum::<f64>() + alpha * n_features as f64;
            counts.iter().map(|c| ((c + alpha) / total).ln()).collect()
        })
        .collect();
    (log_prior, log_likelihood)
}

// ---------------------------------------------------------------------------
// Prediction
// ---------------------------------------------------------------------------

fn predict_row(artifact: &Artifact, raw_row: &[f64]) -> Result<PredictionRow, QuickModelError> {
    let row = match &artifact.standardize {
        Some((mean, std)) => {
            if raw_row.len() != mean.len() {
                return Err(QuickModelError::ShapeMismatch);
            }
            raw_row.iter().zip(mean.iter()).zip(std.iter()).map(|((v, m), s)| (v - m) / s).collect::<Vec<_>>()
        }
        None => raw_row.to_vec(),
    };

    let proba = class_probabilities(&artifact.params, &row)?;
    let argmax = proba.iter().enumerate().max_by(|a, b| a.1.partial_cmp(b.1).unwrap()).map(|(i, _)| i).unwrap_or(0);
    let entropy = -proba.iter().filter(|&&p| p > 0.0).map(|p| p * p.ln()).sum::<f64>();

    let proba_map = artifact.label_vocab.iter().cloned().zip(proba.iter().copied()).collect();
    Ok(PredictionRow { label: artifact.label_vocab[argmax].clone(), proba: proba_map, entropy })
}

fn class_probabilities(params: &FittedParams, row: &[f64]) -> Result<Vec<f64>, QuickModelError> {
    match params {
        FittedParams::Linear { weights, bias } => {
            if row.len() != weights.ncols() {
                return Err(QuickModelError::ShapeMismatch);
            }
            let row = Array1::from_vec(row.to_vec());
            let logits = weights.dot(&row) + bias;
            Ok(softmax(logits.as_slice().expect("contiguous logits")))
        }
        FittedParams::Knn { train_x, train_y, k } => {
            if row.len() != train_x[0].len() {
                return Err(QuickModelError::ShapeMismatch);
            }
            let n_classes = *train_y.iter().max().unwrap_or(&0) + 1;
            let mut distances: Vec<(f64, usize)> = train_x
                .iter()
                .zip(train_y.iter())
                .map(|(tx, &ty)| (euclidean(row, tx), ty))
                .collect();
            distances.sort_by(|a, b| a.0.partial_cmp(&b.0).unwrap());
            let mut counts = vec![0.0; n_classes];
            for (_, label) in distances.into_iter().take(*k) {
                counts[label] += 1.0;
            }
            let total: f64 = counts.iter().sum::<f64>().max(1.0);
            Ok(counts.into_iter().map(|c| c / total).collect())
        }
        FittedParams::Forest { stumps } => {
            let n_classes = stumps.iter().flat_map(|s| [s.left_label, s.right_label]).max().unwrap_or(0) + 1;
            let mut votes = vec![0.0; n_classes];
            for stump in stumps {
                if row.len() <= stump.feature {
                    return Err(QuickModelError::ShapeMismatch);
                }
                let label = if row[stump.feature] <= stump.threshold { stump.left_label } else { stump.right_label };
                votes[label] += 1.0;
            }
            let total: f64 = votes.iter().sum::<f64>().max(1.0);
            Ok(votes.into_iter().map(|v| v / total).collect())
        }
        FittedParams::NaiveBayes { log_prior, log_likelihood } => {
            if row.len() != log_likelihood[0].len() {
                return Err(QuickModelError::ShapeMismatch);
            }
            let logits: Vec<f64> = log_prior
                .iter()
                .zip(log_likelihood.iter())
                .map(|(prior, ll)| prior + row.iter().zip(ll.iter()).map(|(v, l)| v.max(0.0) * l).sum::<f64>())
                .collect();
            Ok(softmax(&logits))
        }
    }
}

fn softmax(logits: &[f64]) -> Vec<f64> {
    let max = logits.iter().cloned().fold(f64::MIN, f64::max);
    let exps: Vec<f64> = logits.iter().map(|l| (l - max).exp()).collect();
    let sum: f64 = exps.iter().sum::<f64>().max(1e-12);
    exps.into_iter().map(|e| e / sum).collect()
}

fn euclidean(a: &[f64], b: &[f64]) -> f64 {
    a.iter().zip(b.iter()).map(|(x, y)| (x - y).powi(2)).sum::<f64>().sqrt()
}

fn bulk_predict(artifact: &Artifact, x: &[Vec<f64>]) -> Result<Vec<usize>, String> {
    x.iter()
        .map(|row| class_probabilities(&artifact.params, row).map(|p| p.iter().enumerate().max_by(|a, b| a.1.partial_cmp(b.1).unwrap()).map(|(i, _)| i).unwrap_or(0)))
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| e.to_string())
}

fn classification_metrics(y_true: &[usize], y_pred: &[usize], n_classes: usize) -> serde_json::Value {
    let n = y_true.len().max(1) as f64;
    let correct = y_true.iter().zip(y_pred.iter()).filter(|(a, b)| a == b).count();
    let accuracy = correct as f64 / n;

    let mut f1s = Vec::with_capacity(n_classes);
    for c in 0..n_classes {
        let tp = y_true.iter().zip(y_pred.iter()).filter(|(&t, &p)| t == c && p == c).count() as f64;
        let fp = y_true.iter().zip(y_pred.iter()).filter(|(&t, &p)| t != c && p == c).count() as f64;
        let fn_ = y_true.iter().zip(y_pred.iter()).filter(|(&t, &p)| t == c && p != c).count() as f64;
        let precision = if tp + fp > 0.0 { tp / (tp + fp) } else { 0.0 };
        let recall = if tp + fn_ > 0.0 { tp / (tp + fn_) } else { 0.0 };
        let f1 = if precision + recall > 0.0 { 2.0 * precision * recall / (precision + recall) } else { 0.0 };
        f1s.push(f1);
    }
    let f1_macro = f1s.iter().sum::<f64>() / f1s.len().max(1) as f64;

    serde_json::json!({"accuracy": accuracy, "f1_macro": f1_macro, "n": y_true.len()})
}

fn cross_validate(hp: &QuickModelHyperparameters, standardize: bool, x: &[Vec<f64>], y: &[usize], n_classes: usize) -> Result<serde_json::Value, String> {
    let k = 10.min(x.len()).max(2);
    let fold_size = (x.len() + k - 1) / k;
    let mut accuracies = Vec::with_capacity(k);
    let mut f1s = Vec::with_capacity(k);

    for fold in 0..k {
        let start = fold * fold_size;
        let end = (start + fold_size).min(x.len());
        if start >= end {
            continue;
        }
        let test_x = &x[start..end];
        let test_y = &y[start..end];
        let train_x: Vec<Vec<f64>> = x[..start].iter().chain(x[end..].iter()).cloned().collect();
        let train_y: Vec<usize> = y[..start].iter().chain(y[end..].iter()).cloned().collect();
        if train_x.is_empty() {
            continue;
        }

        let scaling = if standardize { Some(fit_scaler(&train_x)) } else { None };
        let train_x_scaled = scaling.as_ref().map(|(m, s)| apply_scaler(&train_x, m, s)).unwrap_or_else(|| train_x.clone());
        let test_x_scaled = scaling.as_ref().map(|(m, s)| apply_scaler(test_x, m, s)).unwrap_or_else(|| test_x.to_vec());

        let params = fit(hp, &train_x_scaled, &train_y, n_classes)?;
        let artifact = Artifact { label_vocab: vec![], standardize: None, params };
        let preds = bulk_predict(&artifact, &test_x_scaled)?;
        let metrics = classification_metrics(test_y, &preds, n_classes);
        accuracies.push(metrics["accuracy"].as_f64().unwrap_or(0.0));
        f1s.push(metrics["f1_macro"].as_f64().unwrap_or(0.0));
    }

    let mean = |v: &[f64]| v.iter().sum::<f64>() / v.len().max(1) as f64;
    Ok(serde_json::json!({"accuracy": mean(&accuracies), "f1_macro": mean(&f1s), "folds": accuracies.len()}))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tigger_core::types::{Project, ProjectParams};

    fn xor_rows() -> Vec<LabeledRow> {
        vec![
            LabeledRow { features: vec![0.0, 0.0], label: "neg".into() },
            LabeledRow { features: vec![1.0, 1.0], label: "neg".into() },
            LabeledRow { features: vec![0.0, 1.0], label: "pos".into() },
            LabeledRow { features: vec![1.0, 0.0], label: "pos".into() },
            LabeledRow { features: vec![0.1, 0.9], label: "pos".into() },
            LabeledRow { features: vec![0.9, 0.1], label: "pos".into() },
            LabeledRow { features: vec![0.05, 0.05], label: "neg".into() },
            LabeledRow { features: vec![0.95, 0.95], label: "neg".into() },
        ]
    }

    async fn setup() -> (QuickModels, Arc<Db>, Arc<Queue>) {
        let db = Arc::new(Db::new_in_memory().await.unwrap());
        db.add_project(&Project {
            slug: "demo".into(),
            created_by: "root".into(),
            created_at: chrono::Utc::now(),
            params: ProjectParams { col_text: "text".into(), cols_context: vec![], n_train: 8, n_test: 0, col_label: None },
        })
        .await
        .unwrap();
        let queue = Arc::new(Queue::new(2, 1));
        let dir = tempfile::tempdir().unwrap();
        (QuickModels::new(db.clone(), queue.clone(), dir.into_path()), db, queue)
    }

    #[tokio::test]
    async fn knn_trains_and_predicts() {
        let (qm, _db, queue) = setup().await;
        let id = qm
            .train("demo", "m1", "default", "alice", QuickModelHyperparameters::Knn { n_neighbors: 3 }, false, false, xor_rows(), vec![], vec![], false)
            .await
            .unwrap();
        let outcome = queue.outcomes().recv_async().await.unwrap();
        assert_eq!(outcome.unique_id, id);
        assert!(outcome.result.is_ok());

        let preds = qm.predict("demo", "m1", &[vec![0.0, 1.0]]).await.unwrap();
        assert_eq!(preds[0].label, "pos");
    }

    #[tokio::test]
    async fn naive_bayes_forces_standardize_off() {
        let (qm, _db, queue) = setup().await;
        qm.train(
            "demo",
            "nb",
            "default",
            "alice",
            QuickModelHyperparameters::MultiNaivebayes { alpha: 1.0, fit_prior: true, class_prior: None },
            true,
            false,
            xor_rows(),
            vec![],
            vec![],
            false,
        )
        .await
        .unwrap();
        let outcome = queue.outcomes().recv_async().await.unwrap();
        assert!(outcome.result.is_ok());
    }

    #[tokio::test]
    async fn train_rejects_name_collision_unless_retrain() {
        let (qm, _db, queue) = setup().await;
        qm.train("demo", "m1", "default", "alice", QuickModelHyperparameters::Liblinear { cost: 1.0 }, true, false, xor_rows(), vec![], vec![], false)
            .await
            .unwrap();
        let _ = queue.outcomes().recv_async().await.unwrap();

        let err = qm
            .train("demo", "m1", "default", "alice", QuickModelHyperparameters::Liblinear { cost: 1.0 }, true, false, xor_rows(), vec![], vec![], false)
            .await
            .unwrap_err();
        assert!(matches!(err, QuickModelError::AlreadyExists(_)));

        qm.train("demo", "m1", "default", "alice", QuickModelHyperparameters::Liblinear { cost: 1.0 }, true, false, xor_rows(), vec![], vec![], true)
            .await
            .unwrap();
        let _ = queue.outcomes().recv_async().await.unwrap();
    }

    #[test]
    fn entropy_is_zero_for_confident_prediction() {
        let artifact = Artifact {
            label_vocab: vec!["a".into(), "b".into()],
            standardize: None,
            params: FittedParams::NaiveBayes { log_prior: vec![0.0, (1e-9_f64).ln()], log_likelihood: vec![vec![0.0], vec![(1e-9_f64).ln()]] },
        };
        let pred = predict_row(&artifact, &[1.0]).unwrap();
        assert_eq!(pred.label, "a");
        assert!(pred.entropy < 0.01);
    }
}
