//! faceid-core: per-user face enrollment and verification.
//!
//! Extracts faces from an enrollment video with a Haar cascade, trains a
//! small CNN per user against a shared "unknown" class, and verifies probe
//! images against that model behind a two-level confidence gate.

#![recursion_limit = "256"]

pub mod augment;
pub mod classifier;
pub mod cnn;
pub mod config;
pub mod dataset;
pub mod detector;
pub mod enrollment;
pub mod extractor;
pub mod schedule;
pub mod store;
pub mod user;
pub mod verifier;

pub use classifier::{Classifier, ClassifierError, Prediction, TrainedModel, TrainingReport};
pub use cnn::CnnClassifier;
pub use config::Config;
pub use dataset::{DatasetBuilder, DatasetSource, DatasetSplit, LabeledDataset};
pub use detector::{DetectionParams, FaceDetector, FaceRect};
pub use enrollment::{EnrollError, Enrollment, EnrollmentService, Response};
pub use extractor::{ExtractError, ExtractionMode, FaceExtractor};
pub use store::{ArtifactManifest, ModelStore};
pub use user::UserId;
pub use verifier::{VerificationResult, Verifier, VerifyError};
