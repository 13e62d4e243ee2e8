//! Offline trainer: class-balanced logistic regression over labeled suspects.
//!
//! Joins the effective labels with persisted suspect evidence, fits by
//! gradient descent on the contract feature vector, reports holdout metrics,
//! and writes the versioned model artifact the ranker loads on next start.

use crate::model::{sigmoid, LinearModel};
use faultline_core::features::{Evidence, MODEL_FEATURES};
use faultline_core::{PipelineError, PipelineResult};
use faultline_storage::ChangeCatalog;
use ndarray::{Array1, Array2};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use std::path::PathBuf;
use tracing::info;

/// Minimum labeled rows before training is worthwhile.
const MIN_TRAINING_ROWS: usize = 10;

/// Held-out fraction for the evaluation split.
const TEST_FRACTION: f64 = 0.2;

#[derive(Debug, Clone)]
pub struct TrainOptions {
    pub artifact_path: PathBuf,
    pub epochs: usize,
    pub learning_rate: f64,
    pub seed: u64,
}

impl Default for TrainOptions {
    fn default() -> Self {
        Self {
            artifact_path: PathBuf::from("models/ranker.v1.json"),
            epochs: 500,
            learning_rate: 0.1,
            seed: 42,
        }
    }
}

/// Holdout metrics and split sizes from one training run.
#[derive(Debug, Clone)]
pub struct TrainReport {
    pub rows: usize,
    pub train_size: usize,
    pub test_size: usize,
    pub precision: f64,
    pub recall: f64,
    pub f1: f64,
    pub roc_auc: Option<f64>,
    pub artifact_path: PathBuf,
}

/// Train from the catalog's labeled suspects and write the artifact.
pub async fn train(
    catalog: &dyn ChangeCatalog,
    options: &TrainOptions,
) -> PipelineResult<TrainReport> {
    let rows = catalog.training_rows().await?;
    if rows.len() < MIN_TRAINING_ROWS {
        return Err(PipelineError::Validation(format!(
            "only {} labeled examples found; need at least {MIN_TRAINING_ROWS} for training",
            rows.len()
        )));
    }

    let samples: Vec<(Vec<f64>, f64)> = rows
        .iter()
        .map(|(evidence, label)| {
            (
                Evidence::from_json(evidence).model_vector(),
                f64::from(*label),
            )
        })
        .collect();

    let (train_idx, test_idx) = stratified_split(&samples, options.seed);
    info!(
        rows = samples.len(),
        train = train_idx.len(),
        test = test_idx.len(),
        "Training ranking model"
    );

    let dim = MODEL_FEATURES.len();
    let x_train = matrix(&samples, &train_idx, dim);
    let y_train = Array1::from(
        train_idx
            .iter()
            .map(|&i| samples[i].1)
            .collect::<Vec<f64>>(),
    );

    let (weights, bias) = fit_logistic(
        &x_train,
        &y_train,
        options.epochs,
        options.learning_rate,
    );

    let model = LinearModel::from_parameters(weights.to_vec(), bias, 1)?;

    // Holdout evaluation.
    let mut predictions = Vec::with_capacity(test_idx.len());
    for &i in &test_idx {
        let x = Array1::from(samples[i].0.clone());
        predictions.push((model.probability(&x), samples[i].1));
    }
    let (precision, recall, f1) = classification_metrics(&predictions);
    let roc_auc = roc_auc(&predictions);

    info!(
        precision = precision,
        recall = recall,
        f1 = f1,
        roc_auc = ?roc_auc,
        "Holdout metrics"
    );

    model.save(&options.artifact_path)?;

    Ok(TrainReport {
        rows: samples.len(),
        train_size: train_idx.len(),
        test_size: test_idx.len(),
        precision,
        recall,
        f1,
        roc_auc,
        artifact_path: options.artifact_path.clone(),
    })
}

/// 80/20 split preserving the class ratio on both sides.
fn stratified_split(samples: &[(Vec<f64>, f64)], seed: u64) -> (Vec<usize>, Vec<usize>) {
    let mut rng = StdRng::seed_from_u64(seed);
    let mut positives: Vec<usize> = Vec::new();
    let mut negatives: Vec<usize> = Vec::new();
    for (i, (_, label)) in samples.iter().enumerate() {
        if *label >= 0.5 {
            positives.push(i);
        } else {
            negatives.push(i);
        }
    }
    positives.shuffle(&mut rng);
    negatives.shuffle(&mut rng);

    let mut train = Vec::new();
    let mut test = Vec::new();
    for class in [positives, negatives] {
        let test_count = ((class.len() as f64) * TEST_FRACTION).round() as usize;
        // Never empty the train side of a non-empty class.
        let test_count = test_count.min(class.len().saturating_sub(1));
        test.extend_from_slice(&class[..test_count]);
        train.extend_from_slice(&class[test_count..]);
    }
    (train, test)
}

fn matrix(samples: &[(Vec<f64>, f64)], idx: &[usize], dim: usize) -> Array2<f64> {
    let mut x = Array2::zeros((idx.len(), dim));
    for (row, &i) in idx.iter().enumerate() {
        for (col, value) in samples[i].0.iter().enumerate() {
            x[[row, col]] = *value;
        }
    }
    x
}

/// Batch gradient descent with inverse-frequency class weights.
fn fit_logistic(
    x: &Array2<f64>,
    y: &Array1<f64>,
    epochs: usize,
    learning_rate: f64,
) -> (Array1<f64>, f64) {
    let n = x.nrows() as f64;
    let positives = y.sum();
    let negatives = n - positives;
    // w_c = n / (2 * n_c), the balanced weighting.
    let pos_weight = if positives > 0.0 { n / (2.0 * positives) } else { 0.0 };
    let neg_weight = if negatives > 0.0 { n / (2.0 * negatives) } else { 0.0 };

    let mut weights = Array1::<f64>::zeros(x.ncols());
    let mut bias = 0.0f64;

    for _ in 0..epochs {
        let z = x.dot(&weights) + bias;
        let residual: Array1<f64> = z
            .iter()
            .zip(y.iter())
            .map(|(&zi, &yi)| {
                let class_weight = if yi >= 0.5 { pos_weight } else { neg_weight };
                class_weight * (sigmoid(zi) - yi)
            })
            .collect();

        let grad_w = x.t().dot(&residual) / n;
        let grad_b = residual.sum() / n;

        let step = grad_w.mapv(|g| g * learning_rate);
        weights -= &step;
        bias -= learning_rate * grad_b;
    }

    (weights, bias)
}

/// Precision/recall/F1 at a 0.5 threshold over (probability, label) pairs.
fn classification_metrics(predictions: &[(f64, f64)]) -> (f64, f64, f64) {
    let mut tp = 0.0;
    let mut fp = 0.0;
    let mut fn_ = 0.0;
    for &(prob, label) in predictions {
        let predicted = prob >= 0.5;
        let actual = label >= 0.5;
        match (predicted, actual) {
            (true, true) => tp += 1.0,
            (true, false) => fp += 1.0,
            (false, true) => fn_ += 1.0,
            (false, false) => {}
        }
    }
    let precision = if tp + fp > 0.0 { tp / (tp + fp) } else { 0.0 };
    let recall = if tp + fn_ > 0.0 { tp / (tp + fn_) } else { 0.0 };
    let f1 = if precision + recall > 0.0 {
        2.0 * precision * recall / (precision + recall)
    } else {
        0.0
    };
    (precision, recall, f1)
}

/// Rank-based ROC-AUC (Mann–Whitney) with average ranks for ties. `None`
/// when the holdout is single-class.
fn roc_auc(predictions: &[(f64, f64)]) -> Option<f64> {
    let n_pos = predictions.iter().filter(|(_, y)| *y >= 0.5).count();
    let n_neg = predictions.len() - n_pos;
    if n_pos == 0 || n_neg == 0 {
        return None;
    }

    let mut sorted: Vec<(f64, f64)> = predictions.to_vec();
    sorted.sort_by(|a, b| a.0.partial_cmp(&b.0).unwrap_or(std::cmp::Ordering::Equal));

    // Average ranks over tied scores.
    let mut ranks = vec![0.0f64; sorted.len()];
    let mut i = 0;
    while i < sorted.len() {
        let mut j = i;
        while j + 1 < sorted.len() && sorted[j + 1].0 == sorted[i].0 {
            j += 1;
        }
        let avg_rank = (i + j) as f64 / 2.0 + 1.0;
        for rank in ranks.iter_mut().take(j + 1).skip(i) {
            *rank = avg_rank;
        }
        i = j + 1;
    }

    let rank_sum_pos: f64 = sorted
        .iter()
        .zip(ranks.iter())
        .filter(|((_, y), _)| *y >= 0.5)
        .map(|(_, rank)| *rank)
        .sum();

    let auc = (rank_sum_pos - (n_pos * (n_pos + 1)) as f64 / 2.0) / (n_pos * n_neg) as f64;
    Some(auc)
}
