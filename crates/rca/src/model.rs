//! Linear ranking model and its on-disk artifact.
//!
//! The artifact is JSON: `{version, feature_names, weights, bias}`. At load
//! the feature-name list must equal the extractor's contract order
//! elementwise, otherwise the model is rejected and the ranker stays in
//! heuristic mode.

use faultline_core::features::MODEL_FEATURES;
use faultline_core::{PipelineError, PipelineResult};
use ndarray::Array1;
use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::info;

#[derive(Debug, Serialize, Deserialize)]
struct ModelArtifact {
    version: u32,
    feature_names: Vec<String>,
    weights: Vec<f64>,
    bias: f64,
}

/// A trained binary linear classifier producing calibrated probabilities.
#[derive(Debug, Clone)]
pub struct LinearModel {
    weights: Array1<f64>,
    bias: f64,
    feature_names: Vec<String>,
    version: u32,
}

impl LinearModel {
    /// Build a model over the contract feature order.
    pub fn from_parameters(weights: Vec<f64>, bias: f64, version: u32) -> PipelineResult<Self> {
        if weights.len() != MODEL_FEATURES.len() {
            return Err(PipelineError::Contract(format!(
                "model has {} weights, expected {}",
                weights.len(),
                MODEL_FEATURES.len()
            )));
        }
        Ok(Self {
            weights: Array1::from(weights),
            bias,
            feature_names: MODEL_FEATURES.iter().map(|s| s.to_string()).collect(),
            version,
        })
    }

    /// Load and validate an artifact.
    pub fn load(path: &Path) -> PipelineResult<Self> {
        let raw = std::fs::read_to_string(path)?;
        let artifact: ModelArtifact = serde_json::from_str(&raw)?;

        let order_matches = artifact.feature_names.len() == MODEL_FEATURES.len()
            && artifact
                .feature_names
                .iter()
                .zip(MODEL_FEATURES.iter())
                .all(|(a, b)| a.as_str() == *b);
        if !order_matches {
            return Err(PipelineError::Contract(format!(
                "model feature order mismatch: artifact has {:?}",
                artifact.feature_names
            )));
        }
        if artifact.weights.len() != artifact.feature_names.len() {
            return Err(PipelineError::Contract(format!(
                "model has {} weights for {} features",
                artifact.weights.len(),
                artifact.feature_names.len()
            )));
        }

        info!(path = %path.display(), version = artifact.version, "Loaded ranking model");
        Ok(Self {
            weights: Array1::from(artifact.weights),
            bias: artifact.bias,
            feature_names: artifact.feature_names,
            version: artifact.version,
        })
    }

    /// Serialize to the artifact path, creating parent directories.
    pub fn save(&self, path: &Path) -> PipelineResult<()> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let artifact = ModelArtifact {
            version: self.version,
            feature_names: self.feature_names.clone(),
            weights: self.weights.to_vec(),
            bias: self.bias,
        };
        std::fs::write(path, serde_json::to_string_pretty(&artifact)?)?;
        info!(path = %path.display(), version = self.version, "Model artifact written");
        Ok(())
    }

    /// Probability of the positive class for one feature vector.
    pub fn probability(&self, features: &Array1<f64>) -> f64 {
        sigmoid(self.weights.dot(features) + self.bias)
    }

    pub fn feature_names(&self) -> &[String] {
        &self.feature_names
    }

    pub fn version(&self) -> u32 {
        self.version
    }
}

pub(crate) fn sigmoid(x: f64) -> f64 {
    1.0 / (1.0 + (-x).exp())
}
