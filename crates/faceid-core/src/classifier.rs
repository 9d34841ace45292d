//! Classifier abstraction shared by training, persistence and verification.

use crate::dataset::DatasetSplit;
use ndarray::ArrayView2;
use serde::{Deserialize, Serialize};
use std::path::Path;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ClassifierError {
    #[error("invalid training data: {0}")]
    InvalidData(String),
    #[error("training failed: {0}")]
    Training(String),
    #[error("failed to save model weights to {path}: {reason}")]
    Save { path: String, reason: String },
    #[error("failed to load model weights from {path}: {reason}")]
    Load { path: String, reason: String },
    #[error("input shape {actual:?} does not match model input {expected:?}")]
    Shape {
        expected: (usize, usize),
        actual: (usize, usize),
    },
}

/// Losses and accuracies recorded for one epoch.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EpochMetrics {
    pub epoch: usize,
    pub train_loss: f64,
    pub val_loss: f64,
    pub val_accuracy: f64,
    pub learning_rate: f64,
}

/// Summary of a training run, persisted alongside the weights.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TrainingReport {
    pub epochs_run: usize,
    pub best_epoch: usize,
    pub best_val_loss: f64,
    /// Validation accuracy of the restored (best) model.
    pub val_accuracy: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub test_accuracy: Option<f64>,
    #[serde(default)]
    pub history: Vec<EpochMetrics>,
}

/// Class-probability vector for one input.
#[derive(Debug, Clone, PartialEq)]
pub struct Prediction {
    pub probabilities: Vec<f32>,
}

impl Prediction {
    pub fn new(probabilities: Vec<f32>) -> Self {
        Self { probabilities }
    }

    /// `(argmax, max probability)`. Ties resolve to the lowest index.
    pub fn top(&self) -> Option<(usize, f32)> {
        self.probabilities
            .iter()
            .copied()
            .enumerate()
            .fold(None, |best, (i, p)| match best {
                Some((_, bp)) if bp >= p => best,
                _ => Some((i, p)),
            })
    }
}

/// A trainer producing [`TrainedModel`]s.
pub trait Classifier: Send {
    type Model: TrainedModel;

    /// Train on `split.train`, selecting the best epoch on `split.validation`.
    fn fit(&self, split: &DatasetSplit) -> Result<(Self::Model, TrainingReport), ClassifierError>;

    /// Restore weights previously written by [`TrainedModel::save`].
    fn load(&self, weights: &Path, num_classes: usize) -> Result<Self::Model, ClassifierError>;
}

/// A trained network ready for inference.
pub trait TrainedModel: Send {
    fn num_classes(&self) -> usize;

    /// Class probabilities for one preprocessed `size x size` raster in [0, 1].
    fn predict(&self, face: ArrayView2<'_, f32>) -> Result<Prediction, ClassifierError>;

    fn save(&self, weights: &Path) -> Result<(), ClassifierError>;
}
