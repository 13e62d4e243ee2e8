//! The evidence feature contract shared by the extractor, ranker, and trainer.
//!
//! The model vector order below is load-bearing: the trainer serializes it
//! into the artifact and the learned ranker refuses an artifact whose
//! feature-name list differs elementwise. The persisted evidence map carries
//! one extra key, `diff_length`, for human inspection only.

use serde_json::Value;

/// Feature names consumed by the linear model, in contract order.
pub const MODEL_FEATURES: [&str; 11] = [
    "is_before_incident",
    "time_proximity_score",
    "minutes_before_incident",
    "metric_delta_count",
    "max_metric_delta",
    "avg_metric_delta",
    "error_log_delta",
    "new_error_signature",
    "diff_keyword_hit",
    "diff_keyword_count",
    "service_incident_rate_30d",
];

/// Evidence-only feature, excluded from the model vector.
pub const DIFF_LENGTH: &str = "diff_length";

/// An insertion-ordered feature map attached to a candidate.
///
/// Missing names read as 0.0 everywhere, so a fail-soft extractor block that
/// never ran is indistinguishable from one that produced zeros.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Evidence {
    pairs: Vec<(String, f64)>,
}

impl Evidence {
    pub fn new() -> Self {
        Self { pairs: Vec::new() }
    }

    /// Set a feature value, replacing any prior value for the same name.
    pub fn set(&mut self, name: &str, value: f64) {
        if let Some(entry) = self.pairs.iter_mut().find(|(n, _)| n == name) {
            entry.1 = value;
        } else {
            self.pairs.push((name.to_string(), value));
        }
    }

    /// Read a feature value; absent names are 0.0.
    pub fn get(&self, name: &str) -> f64 {
        self.pairs
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| *v)
            .unwrap_or(0.0)
    }

    pub fn is_empty(&self) -> bool {
        self.pairs.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, f64)> {
        self.pairs.iter().map(|(n, v)| (n.as_str(), *v))
    }

    /// The model input vector, in [`MODEL_FEATURES`] order.
    pub fn model_vector(&self) -> Vec<f64> {
        MODEL_FEATURES.iter().map(|name| self.get(name)).collect()
    }

    /// Serialize to the on-disk key→value form.
    pub fn to_json(&self) -> Value {
        let mut map = serde_json::Map::new();
        for (name, value) in &self.pairs {
            map.insert(name.clone(), Value::from(*value));
        }
        Value::Object(map)
    }

    /// Rebuild from the on-disk form. Non-numeric values are skipped.
    pub fn from_json(value: &Value) -> Self {
        let mut evidence = Evidence::new();
        if let Value::Object(map) = value {
            for name in MODEL_FEATURES.iter().chain(std::iter::once(&DIFF_LENGTH)) {
                if let Some(v) = map.get(*name).and_then(Value::as_f64) {
                    evidence.set(name, v);
                }
            }
        }
        evidence
    }
}
