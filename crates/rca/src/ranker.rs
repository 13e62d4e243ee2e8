//! Suspect ranking: heuristic formula or learned linear model.
//!
//! Both modes share one contract — candidates in, the same candidates out
//! with `score` and a gapless `rank` starting at 1, ordered by score
//! descending with a deterministic (type, key) tie-break.

use crate::model::LinearModel;
use faultline_core::features::Evidence;
use faultline_core::types::Candidate;
use faultline_core::PipelineError;
use ndarray::Array1;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};
use tracing::{info, warn};

/// A candidate with its evidence, score, and final rank.
#[derive(Debug, Clone)]
pub struct RankedSuspect {
    pub candidate: Candidate,
    pub evidence: Evidence,
    pub score: f64,
    pub rank: i32,
}

/// Ranker with a hot-swappable model. Missing or rejected artifacts fall
/// back to heuristic scoring.
pub struct Ranker {
    artifact_path: Option<PathBuf>,
    model: RwLock<Option<Arc<LinearModel>>>,
}

impl Ranker {
    /// Load the artifact at `path` if present and valid; otherwise start in
    /// heuristic mode.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let model = load_or_fallback(&path);
        Self {
            artifact_path: Some(path),
            model: RwLock::new(model),
        }
    }

    /// A ranker that always uses the heuristic formula.
    pub fn heuristic() -> Self {
        Self {
            artifact_path: None,
            model: RwLock::new(None),
        }
    }

    /// Re-read the artifact, atomically swapping the shared model pointer.
    pub fn reload(&self) {
        if let Some(path) = &self.artifact_path {
            let model = load_or_fallback(path);
            *self.model.write().expect("model lock poisoned") = model;
        }
    }

    pub fn is_learned(&self) -> bool {
        self.model.read().expect("model lock poisoned").is_some()
    }

    pub fn mode(&self) -> &'static str {
        if self.is_learned() {
            "learned"
        } else {
            "heuristic"
        }
    }

    /// Score and rank candidates. Higher score = more suspect.
    pub fn rank(&self, candidates: Vec<(Candidate, Evidence)>) -> Vec<RankedSuspect> {
        let model = self.model.read().expect("model lock poisoned").clone();

        let mut scored: Vec<RankedSuspect> = candidates
            .into_iter()
            .map(|(candidate, evidence)| {
                let score = match &model {
                    Some(model) => {
                        let x = Array1::from(evidence.model_vector());
                        model.probability(&x)
                    }
                    None => heuristic_score(&evidence),
                };
                RankedSuspect {
                    candidate,
                    evidence,
                    score,
                    rank: 0,
                }
            })
            .collect();

        scored.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.candidate.suspect_type.cmp(&b.candidate.suspect_type))
                .then_with(|| a.candidate.suspect_key.cmp(&b.candidate.suspect_key))
        });

        for (i, suspect) in scored.iter_mut().enumerate() {
            suspect.rank = (i + 1) as i32;
        }
        metrics::counter!("ranker.candidates").increment(scored.len() as u64);
        scored
    }
}

fn load_or_fallback(path: &Path) -> Option<Arc<LinearModel>> {
    match LinearModel::load(path) {
        Ok(model) => Some(Arc::new(model)),
        Err(PipelineError::Contract(msg)) => {
            warn!(path = %path.display(), error = %msg, "Model rejected, using heuristic ranking");
            None
        }
        Err(PipelineError::Io(e)) if e.kind() == std::io::ErrorKind::NotFound => {
            info!(path = %path.display(), "No model artifact found, using heuristic ranking");
            None
        }
        Err(e) => {
            warn!(path = %path.display(), error = %e, "Failed to load model, using heuristic ranking");
            None
        }
    }
}

/// The heuristic scoring formula.
pub fn heuristic_score(evidence: &Evidence) -> f64 {
    let mut score = 0.0;

    let is_before = evidence.get("is_before_incident");
    score += 3.0 * is_before;

    if is_before > 0.0 {
        let minutes_before = evidence.get("minutes_before_incident");
        score += 2.0 * (-minutes_before.abs() / 30.0).exp();
    }

    score += 2.5 * evidence.get("max_metric_delta").min(1.0);
    score += 2.0 * (evidence.get("error_log_delta") / 10.0).clamp(0.0, 1.0);
    score += 1.5 * evidence.get("new_error_signature");
    score += 1.0 * evidence.get("diff_keyword_hit");

    score
}
