use serde::Deserialize;
use std::collections::HashMap;
use std::path::Path;
use thiserror::Error;

use crate::normalize::normalize_text;

#[derive(Debug, Error)]
pub enum ClassifierError {
    #[error("Invalid model: {0}")]
    InvalidModel(String),
    #[error("Model file error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Model decode error: {0}")]
    Decode(#[from] serde_json::Error),
    #[error("Prediction failed: {0}")]
    Prediction(String),
}

#[derive(Debug, Clone, PartialEq)]
pub struct Prediction {
    /// `categoria|subcategoria` or just `categoria`.
    pub label: String,
    /// Probability of the winning class, in [0, 1].
    pub confidence: f64,
}

impl Prediction {
    pub fn split_label(&self) -> (String, String) {
        match self.label.split_once('|') {
            Some((cat, sub)) => (cat.trim().to_string(), sub.trim().to_string()),
            None => (self.label.trim().to_string(), String::new()),
        }
    }
}

/// Abstraction over a trained text classifier.
pub trait Classifier: Send + Sync {
    fn predict(&self, text: &str) -> Result<Prediction, ClassifierError>;
}

// ── Mock (tests and wiring without a trained artifact) ────────────────────────

/// Returns a fixed prediction, or a fixed error when constructed with
/// [`MockClassifier::failing`].
pub struct MockClassifier {
    outcome: Result<Prediction, String>,
}

impl MockClassifier {
    pub fn new(label: &str, confidence: f64) -> Self {
        Self {
            outcome: Ok(Prediction {
                label: label.to_string(),
                confidence,
            }),
        }
    }

    pub fn failing(message: &str) -> Self {
        Self {
            outcome: Err(message.to_string()),
        }
    }
}

impl Classifier for MockClassifier {
    fn predict(&self, _text: &str) -> Result<Prediction, ClassifierError> {
        self.outcome
            .clone()
            .map_err(ClassifierError::Prediction)
    }
}

// ── Multinomial naive Bayes over normalized tokens ────────────────────────────

/// JSON artifact produced by the offline trainer:
///
/// ```json
/// {
///   "labels": ["alimentacion|restaurantes", "transporte"],
///   "log_priors": [-0.69, -0.69],
///   "token_log_likelihoods": { "sushi": [-1.2, -6.0] },
///   "unknown_log_likelihoods": [-7.0, -7.0]
/// }
/// ```
#[derive(Debug, Clone, Deserialize)]
pub struct NaiveBayesModel {
    labels: Vec<String>,
    log_priors: Vec<f64>,
    token_log_likelihoods: HashMap<String, Vec<f64>>,
    unknown_log_likelihoods: Vec<f64>,
}

impl NaiveBayesModel {
    pub fn from_json(json: &str) -> Result<Self, ClassifierError> {
        let model: NaiveBayesModel = serde_json::from_str(json)?;
        model.validate()?;
        Ok(model)
    }

    pub fn load(path: &Path) -> Result<Self, ClassifierError> {
        let json = std::fs::read_to_string(path)?;
        Self::from_json(&json)
    }

    fn validate(&self) -> Result<(), ClassifierError> {
        let n = self.labels.len();
        if n == 0 {
            return Err(ClassifierError::InvalidModel("no labels".into()));
        }
        if self.log_priors.len() != n || self.unknown_log_likelihoods.len() != n {
            return Err(ClassifierError::InvalidModel(format!(
                "expected {n} priors and unknown likelihoods"
            )));
        }
        if let Some((token, _)) = self
            .token_log_likelihoods
            .iter()
            .find(|(_, v)| v.len() != n)
        {
            return Err(ClassifierError::InvalidModel(format!(
                "token '{token}' has wrong arity"
            )));
        }
        Ok(())
    }
}

impl Classifier for NaiveBayesModel {
    fn predict(&self, text: &str) -> Result<Prediction, ClassifierError> {
        let mut scores = self.log_priors.clone();
        for token in normalize_text(text).split_whitespace() {
            let row = self
                .token_log_likelihoods
                .get(token)
                .unwrap_or(&self.unknown_log_likelihoods);
            for (score, ll) in scores.iter_mut().zip(row) {
                *score += ll;
            }
        }

        // Softmax with max subtraction for numerical stability.
        let max = scores.iter().copied().fold(f64::NEG_INFINITY, f64::max);
        if !max.is_finite() {
            return Err(ClassifierError::Prediction("non-finite scores".into()));
        }
        let exp: Vec<f64> = scores.iter().map(|s| (s - max).exp()).collect();
        let total: f64 = exp.iter().sum();
        let (best, best_exp) = exp
            .iter()
            .enumerate()
            .max_by(|a, b| a.1.partial_cmp(b.1).unwrap_or(std::cmp::Ordering::Equal))
            .ok_or_else(|| ClassifierError::Prediction("empty model".into()))?;

        Ok(Prediction {
            label: self.labels[best].clone(),
            confidence: best_exp / total,
        })
    }
}
