//! Probe verification: extract the probe face, classify it against the
//! user's model, and apply the model-layer confidence gate.

use crate::classifier::{Classifier, ClassifierError, Prediction, TrainedModel};
use crate::dataset::{DatasetBuilder, DatasetError};
use crate::extractor::{ExtractError, FaceExtractor};
use crate::store::{ModelStore, StoreError};
use crate::user::UserId;
use serde::{Deserialize, Serialize};
use std::path::Path;
use thiserror::Error;

pub const NO_FACE_ERROR: &str = "no face";
pub const NO_FACE_MESSAGE: &str = "No face detected in the image.";
pub const UNCERTAIN_MESSAGE: &str = "Model is not confident enough to classify the image.";

#[derive(Error, Debug)]
pub enum VerifyError {
    #[error("no model for user {0}")]
    ModelNotFound(String),
    #[error(transparent)]
    Extract(#[from] ExtractError),
    #[error(transparent)]
    Dataset(#[from] DatasetError),
    #[error(transparent)]
    Store(StoreError),
    #[error(transparent)]
    Classifier(#[from] ClassifierError),
    #[error("model produced no probabilities")]
    EmptyPrediction,
}

impl From<StoreError> for VerifyError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::ModelNotFound(user) => VerifyError::ModelNotFound(user),
            other => VerifyError::Store(other),
        }
    }
}

/// Outcome of one verification call. Never persisted.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct VerificationResult {
    pub success: bool,
    pub message: String,
    pub confidence: f32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub predicted_class: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl VerificationResult {
    pub fn no_face() -> Self {
        Self {
            success: false,
            message: NO_FACE_MESSAGE.to_string(),
            confidence: 0.0,
            predicted_class: None,
            error: Some(NO_FACE_ERROR.to_string()),
        }
    }

    pub fn uncertain(predicted_class: &str, confidence: f32) -> Self {
        Self {
            success: false,
            message: UNCERTAIN_MESSAGE.to_string(),
            confidence,
            predicted_class: Some(predicted_class.to_string()),
            error: None,
        }
    }

    pub fn matched(predicted_class: &str, confidence: f32) -> Self {
        Self {
            success: true,
            message: format!("Image matches the class {predicted_class} with confidence {confidence:.2}"),
            confidence,
            predicted_class: Some(predicted_class.to_string()),
            error: None,
        }
    }

    /// Caller-layer gate: a successful match naming `user` strictly above
    /// `accept_threshold`.
    pub fn accepts(&self, user: &UserId, accept_threshold: f32) -> bool {
        self.success
            && self.predicted_class.as_deref() == Some(user.as_str())
            && self.confidence > accept_threshold
    }
}

/// Model-layer gate over a prediction.
pub fn decide(
    prediction: &Prediction,
    classes: &[String],
    model_threshold: f32,
) -> Result<VerificationResult, VerifyError> {
    let (index, confidence) = prediction.top().ok_or(VerifyError::EmptyPrediction)?;
    let class = classes
        .get(index)
        .map(String::as_str)
        .ok_or(VerifyError::EmptyPrediction)?;
    if confidence < model_threshold {
        Ok(VerificationResult::uncertain(class, confidence))
    } else {
        Ok(VerificationResult::matched(class, confidence))
    }
}

/// Runs probe images through extraction, the stored model and the gate.
pub struct Verifier<'a, C: Classifier> {
    pub extractor: &'a mut FaceExtractor,
    pub builder: &'a DatasetBuilder,
    pub store: &'a ModelStore,
    pub classifier: &'a C,
    pub model_threshold: f32,
}

impl<C: Classifier> Verifier<'_, C> {
    /// Verify `probe` against `user`'s model. The probe crop is written to
    /// `probe_dir` as `face.jpg`.
    pub fn verify(
        &mut self,
        user: &UserId,
        probe: &Path,
        probe_dir: &Path,
    ) -> Result<VerificationResult, VerifyError> {
        if !self.store.exists(user) {
            return Err(VerifyError::ModelNotFound(user.to_string()));
        }

        let Some(face_path) = self.extractor.extract_image_file(probe, probe_dir)? else {
            tracing::info!(user = %user, "verification: no face in probe");
            return Ok(VerificationResult::no_face());
        };

        let face = self.builder.load_face(&face_path)?;
        let (model, manifest) = self.store.load(self.classifier, user)?;
        let prediction = model.predict(face.view())?;
        let result = decide(&prediction, &manifest.classes, self.model_threshold)?;

        tracing::info!(
            user = %user,
            predicted = ?result.predicted_class,
            confidence = result.confidence,
            success = result.success,
            "verification complete"
        );
        Ok(result)
    }
}
