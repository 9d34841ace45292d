//! Enrollment and verification flows, and the status/body responses the
//! upload boundary returns for them.

use crate::classifier::{Classifier, ClassifierError};
use crate::config::Config;
use crate::dataset::{DatasetBuilder, DatasetError, DatasetSource};
use crate::detector::{DetectorError, FaceDetector};
use crate::extractor::{ExtractError, ExtractionMode, FaceExtractor};
use crate::store::{ArtifactManifest, ModelStore, StoreError};
use crate::user::{secure_filename, InvalidUserId, UserId};
use crate::verifier::{VerificationResult, Verifier, VerifyError};
use faceid_media::VideoOpener;
use serde::Serialize;
use serde_json::json;
use std::path::{Path, PathBuf};
use thiserror::Error;

pub const MISSING_VIDEO_FIELDS: &str = "User ID and video file are required";
pub const LOW_QUALITY_VIDEO: &str =
    "The video quality is not good enough, please provide a better/longer video.";
pub const VIDEO_PROCESSED: &str = "Video uploaded and processed successfully";
pub const VIDEO_FAILED: &str = "Video could not be uploaded";
pub const MISSING_IMAGE_FIELDS: &str = "User ID and image file are required";
pub const IMAGE_ACCEPTED: &str = "Redirect to Home";
pub const IMAGE_FAILED: &str = "Image could not be uploaded or processed";

const STATUS_OK: u16 = 200;
const STATUS_BAD_REQUEST: u16 = 400;

#[derive(Error, Debug)]
pub enum EnrollError {
    #[error(transparent)]
    InvalidUser(#[from] InvalidUserId),
    #[error("user id {0:?} names the negative class")]
    ReservedUser(String),
    #[error("only {found} faces extracted, need at least {required}")]
    InsufficientFaces { found: usize, required: usize },
    #[error(transparent)]
    Detector(#[from] DetectorError),
    #[error(transparent)]
    Extract(#[from] ExtractError),
    #[error(transparent)]
    Dataset(#[from] DatasetError),
    #[error(transparent)]
    Classifier(#[from] ClassifierError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Verify(#[from] VerifyError),
    #[error("I/O error at {path}: {source}")]
    Io {
        path: String,
        source: std::io::Error,
    },
}

/// Status code and JSON body of a boundary call.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Response {
    pub status: u16,
    pub body: serde_json::Value,
}

impl Response {
    fn ok(body: serde_json::Value) -> Self {
        Self {
            status: STATUS_OK,
            body,
        }
    }

    fn bad_request(body: serde_json::Value) -> Self {
        Self {
            status: STATUS_BAD_REQUEST,
            body,
        }
    }

    fn error(message: &str) -> Self {
        Self::bad_request(json!({ "error": message }))
    }

    pub fn is_success(&self) -> bool {
        self.status == STATUS_OK
    }
}

/// Result of a successful enrollment.
#[derive(Debug, Clone)]
pub struct Enrollment {
    pub faces: usize,
    pub faces_dir: PathBuf,
    pub manifest: ArtifactManifest,
}

/// Owns the pipeline components and runs enrollment and verification.
///
/// Every operation takes `&mut self`; callers sharing a service serialise
/// through it.
pub struct EnrollmentService<C: Classifier> {
    config: Config,
    extractor: FaceExtractor,
    opener: Box<dyn VideoOpener>,
    classifier: C,
    builder: DatasetBuilder,
    store: ModelStore,
}

#[cfg(feature = "opencv")]
impl EnrollmentService<crate::cnn::CnnClassifier> {
    /// Production wiring: Haar cascade, OpenCV video decoding and the CNN.
    pub fn with_opencv(config: Config) -> Result<Self, EnrollError> {
        let detector = crate::detector::CascadeDetector::load(&config.extraction.cascade_path)?;
        let classifier =
            crate::cnn::CnnClassifier::new(config.training.clone(), config.dataset.clone());
        Ok(Self::new(
            config,
            Box::new(detector),
            Box::new(faceid_media::OpenCvOpener),
            classifier,
        ))
    }
}

impl<C: Classifier> EnrollmentService<C> {
    pub fn new(
        config: Config,
        detector: Box<dyn FaceDetector>,
        opener: Box<dyn VideoOpener>,
        classifier: C,
    ) -> Self {
        let extractor = FaceExtractor::new(detector, &config.extraction);
        let builder = DatasetBuilder::new(&config.dataset);
        let store = ModelStore::new(config.storage.models_dir());
        Self {
            config,
            extractor,
            opener,
            classifier,
            builder,
            store,
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn store(&self) -> &ModelStore {
        &self.store
    }

    /// Validate a raw id; the negative-class name is not a user.
    pub fn parse_user(&self, raw: &str) -> Result<UserId, EnrollError> {
        let user = UserId::parse(raw)?;
        if user.as_str() == self.config.storage.unknown_class {
            return Err(EnrollError::ReservedUser(raw.to_string()));
        }
        Ok(user)
    }

    /// Run the extractor directly (no enrollment side effects).
    pub fn extract(
        &mut self,
        source: &Path,
        output_dir: &Path,
        mode: ExtractionMode,
    ) -> Result<usize, EnrollError> {
        Ok(self
            .extractor
            .extract_faces(self.opener.as_ref(), source, output_dir, mode)?)
    }

    /// Replace `user`'s face crops with those of `video` and train a model.
    ///
    /// An unreadable video counts as zero faces.
    pub fn enroll(&mut self, user: &UserId, video: &Path) -> Result<Enrollment, EnrollError> {
        let faces_dir = self.config.storage.user_faces_dir(user.as_str());
        if faces_dir.exists() {
            std::fs::remove_dir_all(&faces_dir).map_err(|source| EnrollError::Io {
                path: faces_dir.display().to_string(),
                source,
            })?;
        }

        let extraction = &self.config.extraction;
        let mode = ExtractionMode::Video {
            sampling_rate: extraction.sampling_rate,
            max_faces: extraction.max_faces,
        };
        let required = extraction.min_enroll_faces;

        let faces = match self
            .extractor
            .extract_faces(self.opener.as_ref(), video, &faces_dir, mode)
        {
            Ok(n) => n,
            Err(ExtractError::InvalidSource(reason)) => {
                tracing::warn!(user = %user, video = %video.display(), %reason, "unreadable enrollment video");
                0
            }
            Err(e) => return Err(e.into()),
        };

        if faces < required {
            tracing::info!(user = %user, faces, required, "enrollment rejected: too few faces");
            return Err(EnrollError::InsufficientFaces {
                found: faces,
                required,
            });
        }

        let manifest = self.train_user(user)?;
        tracing::info!(user = %user, faces, "enrollment complete");
        Ok(Enrollment {
            faces,
            faces_dir,
            manifest,
        })
    }

    /// Train `user`'s model from the crops already in `faces/{user}`.
    pub fn train_user(&mut self, user: &UserId) -> Result<ArtifactManifest, EnrollError> {
        let source = DatasetSource::UserVsUnknown {
            user_dir: self.config.storage.user_faces_dir(user.as_str()),
            unknown_dir: self.config.storage.unknown_dir(),
        };
        self.train(user, &source)
    }

    /// Train one model over every identity under `root`, stored as `name`.
    pub fn train_corpus(&mut self, root: &Path, name: &UserId) -> Result<ArtifactManifest, EnrollError> {
        let source = DatasetSource::Corpus {
            root: root.to_path_buf(),
        };
        self.train(name, &source)
    }

    fn train(&mut self, user: &UserId, source: &DatasetSource) -> Result<ArtifactManifest, EnrollError> {
        let ds = &self.config.dataset;
        let dataset = self.builder.build(source)?;
        let split = dataset.split(ds.validation_fraction, ds.test_fraction, ds.split_seed)?;
        let (model, report) = self.classifier.fit(&split)?;
        Ok(self.store.save(user, &model, &split.classes, &report)?)
    }

    /// Verify a probe image against `user`'s model (model-layer gate only).
    pub fn verify(&mut self, user: &UserId, probe: &Path) -> Result<VerificationResult, EnrollError> {
        let probe_dir = self.config.storage.probe_dir(user.as_str());
        let mut verifier = Verifier {
            extractor: &mut self.extractor,
            builder: &self.builder,
            store: &self.store,
            classifier: &self.classifier,
            model_threshold: self.config.verification.model_threshold,
        };
        Ok(verifier.verify(user, probe, &probe_dir)?)
    }

    /// Store an uploaded enrollment video as `uploads/{user}.mp4` and enroll.
    pub fn upload_video(&mut self, user_id: Option<&str>, video: Option<&Path>) -> Response {
        let (Some(raw), Some(video)) = (user_id.filter(|u| !u.is_empty()), video) else {
            return Response::error(MISSING_VIDEO_FIELDS);
        };
        let user = match self.parse_user(raw) {
            Ok(user) => user,
            Err(e) => {
                tracing::warn!(user = raw, error = %e, "rejected user id");
                return Response::error(MISSING_VIDEO_FIELDS);
            }
        };

        let stored = match self.store_upload(video, &secure_filename(&format!("{user}.mp4"))) {
            Ok(path) => path,
            Err(e) => {
                tracing::error!(user = %user, error = %e, "failed to store upload");
                return Response::error(VIDEO_FAILED);
            }
        };

        match self.enroll(&user, &stored) {
            Ok(enrollment) => Response::ok(json!({
                "message": VIDEO_PROCESSED,
                "videoUrl": stored.display().to_string(),
                "facesUrl": enrollment.faces_dir.display().to_string(),
            })),
            Err(EnrollError::InsufficientFaces { .. }) => Response::error(LOW_QUALITY_VIDEO),
            Err(e) => {
                tracing::error!(user = %user, error = %e, "enrollment failed");
                Response::error(VIDEO_FAILED)
            }
        }
    }

    /// Store an uploaded probe under its sanitised name and verify it with
    /// both gates.
    pub fn upload_image(&mut self, user_id: Option<&str>, image: Option<&Path>) -> Response {
        let (Some(raw), Some(image)) = (user_id.filter(|u| !u.is_empty()), image) else {
            return Response::error(MISSING_IMAGE_FIELDS);
        };
        let user = match self.parse_user(raw) {
            Ok(user) => user,
            Err(e) => {
                tracing::warn!(user = raw, error = %e, "rejected user id");
                return Response::error(MISSING_IMAGE_FIELDS);
            }
        };

        let upload_name = image
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let stored = match self.store_upload(image, &secure_filename(&upload_name)) {
            Ok(path) => path,
            Err(e) => {
                tracing::error!(user = %user, error = %e, "failed to store upload");
                return Response::error(IMAGE_FAILED);
            }
        };

        let result = match self.verify(&user, &stored) {
            Ok(result) => result,
            Err(e) => {
                tracing::error!(user = %user, error = %e, "verification failed");
                return Response::error(IMAGE_FAILED);
            }
        };

        if result.accepts(&user, self.config.verification.accept_threshold) {
            tracing::info!(user = %user, confidence = result.confidence, "verification accepted");
            return Response::ok(json!({ "message": IMAGE_ACCEPTED, "success": true }));
        }

        tracing::info!(user = %user, confidence = result.confidence, "verification rejected");
        match serde_json::to_value(&result) {
            Ok(body) => Response::bad_request(body),
            Err(_) => Response::error(IMAGE_FAILED),
        }
    }

    /// Copy an upload into `uploads/` under `filename`.
    fn store_upload(&self, source: &Path, filename: &str) -> Result<PathBuf, EnrollError> {
        let dir = self.config.storage.uploads_dir();
        let io_err = |path: &Path, err: std::io::Error| EnrollError::Io {
            path: path.display().to_string(),
            source: err,
        };
        std::fs::create_dir_all(&dir).map_err(|e| io_err(&dir, e))?;
        let target = dir.join(filename);
        if source != target.as_path() {
            std::fs::copy(source, &target).map_err(|e| io_err(source, e))?;
        }
        Ok(target)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detector::FaceRect;
    use crate::extractor::tests::{FixedDetector, SyntheticOpener};
    use crate::store::tests::FixedClassifier;
    use image::{GrayImage, Luma};

    struct Harness {
        _dir: tempfile::TempDir,
        root: PathBuf,
        video: PathBuf,
        probe: PathBuf,
    }

    fn harness() -> Harness {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().to_path_buf();

        let unknown = root.join("faces").join("unknown");
        std::fs::create_dir_all(&unknown).unwrap();
        for i in 0..4 {
            GrayImage::from_pixel(64, 64, Luma([30]))
                .save(unknown.join(format!("u_{i}.png")))
                .unwrap();
        }

        let incoming = root.join("incoming");
        std::fs::create_dir_all(&incoming).unwrap();
        let video = incoming.join("enroll.webm");
        std::fs::write(&video, b"stub video").unwrap();
        let probe = incoming.join("my selfie.png");
        image::RgbImage::from_pixel(96, 96, image::Rgb([120, 120, 120]))
            .save(&probe)
            .unwrap();

        Harness {
            _dir: dir,
            root,
            video,
            probe,
        }
    }

    /// 300 frames at 30 fps: a 10 s clip, sampled at stride 3.
    fn service(
        root: &Path,
        faces_per_frame: usize,
        probabilities: Vec<f32>,
    ) -> EnrollmentService<FixedClassifier> {
        let mut config = Config::default();
        config.storage.data_dir = root.to_path_buf();
        let faces = vec![FaceRect::new(4, 4, 72, 72); faces_per_frame];
        EnrollmentService::new(
            config,
            Box::new(FixedDetector::new(faces)),
            Box::new(SyntheticOpener {
                fps: 30.0,
                total: 300,
            }),
            FixedClassifier { probabilities },
        )
    }

    #[test]
    fn test_upload_video_missing_fields() {
        let h = harness();
        let mut svc = service(&h.root, 3, vec![0.9, 0.1]);
        for response in [
            svc.upload_video(None, Some(&h.video)),
            svc.upload_video(Some(""), Some(&h.video)),
            svc.upload_video(Some("alice"), None),
        ] {
            assert_eq!(response.status, 400);
            assert_eq!(response.body["error"], MISSING_VIDEO_FIELDS);
        }
    }

    #[test]
    fn test_upload_video_rejects_unsafe_ids() {
        let h = harness();
        let mut svc = service(&h.root, 3, vec![0.9, 0.1]);
        for raw in ["../etc", "unknown", "probes"] {
            let response = svc.upload_video(Some(raw), Some(&h.video));
            assert_eq!(response.body["error"], MISSING_VIDEO_FIELDS, "{raw}");
        }
    }

    #[test]
    fn test_upload_video_too_few_faces() {
        let h = harness();
        // 100 sampled frames x 2 faces = 200 < 249.
        let mut svc = service(&h.root, 2, vec![0.9, 0.1]);
        let response = svc.upload_video(Some("alice"), Some(&h.video));

        assert_eq!(response.status, 400);
        assert_eq!(response.body["error"], LOW_QUALITY_VIDEO);
        assert!(h.root.join("uploads").join("alice.mp4").exists());
        assert!(!svc.store().exists(&UserId::parse("alice").unwrap()));
    }

    #[test]
    fn test_upload_video_success() {
        let h = harness();
        let mut svc = service(&h.root, 3, vec![0.9, 0.1]);
        let response = svc.upload_video(Some("alice"), Some(&h.video));

        assert_eq!(response.status, 200, "{:?}", response.body);
        assert_eq!(response.body["message"], VIDEO_PROCESSED);
        let video_url = response.body["videoUrl"].as_str().unwrap();
        assert!(video_url.ends_with("alice.mp4"));
        let faces_url = response.body["facesUrl"].as_str().unwrap();
        assert_eq!(std::fs::read_dir(faces_url).unwrap().count(), 250);
        assert!(svc.store().exists(&UserId::parse("alice").unwrap()));
    }

    #[test]
    fn test_reenroll_replaces_faces() {
        let h = harness();
        let faces_dir = h.root.join("faces").join("alice");
        std::fs::create_dir_all(&faces_dir).unwrap();
        std::fs::write(faces_dir.join("stale.jpg"), b"old").unwrap();

        let mut svc = service(&h.root, 3, vec![0.9, 0.1]);
        let alice = UserId::parse("alice").unwrap();
        let enrollment = svc.enroll(&alice, &h.video).unwrap();
        assert_eq!(enrollment.faces, 250);
        assert!(!faces_dir.join("stale.jpg").exists());
        assert_eq!(enrollment.manifest.classes, vec!["alice", "unknown"]);
    }

    #[test]
    fn test_enroll_unreadable_video_counts_as_zero() {
        let h = harness();
        let mut svc = service(&h.root, 3, vec![0.9, 0.1]);
        let alice = UserId::parse("alice").unwrap();
        let result = svc.enroll(&alice, &h.root.join("missing.mp4"));
        assert!(matches!(
            result,
            Err(EnrollError::InsufficientFaces { found: 0, required: 249 })
        ));
    }

    #[test]
    fn test_upload_image_missing_fields() {
        let h = harness();
        let mut svc = service(&h.root, 1, vec![0.95, 0.05]);
        let response = svc.upload_image(Some("alice"), None);
        assert_eq!(response.status, 400);
        assert_eq!(response.body["error"], MISSING_IMAGE_FIELDS);
    }

    #[test]
    fn test_upload_image_without_model() {
        let h = harness();
        let mut svc = service(&h.root, 1, vec![0.95, 0.05]);
        let response = svc.upload_image(Some("alice"), Some(&h.probe));
        assert_eq!(response.status, 400);
        assert_eq!(response.body["error"], IMAGE_FAILED);
    }

    #[test]
    fn test_upload_image_accepts_confident_match() {
        let h = harness();
        let mut svc = service(&h.root, 3, vec![0.95, 0.05]);
        svc.upload_video(Some("alice"), Some(&h.video));

        let response = svc.upload_image(Some("alice"), Some(&h.probe));
        assert_eq!(response.status, 200, "{:?}", response.body);
        assert_eq!(response.body["message"], IMAGE_ACCEPTED);
        assert_eq!(response.body["success"], true);
        assert!(h.root.join("uploads").join("my_selfie.png").exists());
        assert!(h
            .root
            .join("faces")
            .join("probes")
            .join("alice")
            .join("face.jpg")
            .exists());
    }

    #[test]
    fn test_upload_image_rejects_between_thresholds() {
        let h = harness();
        let mut svc = service(&h.root, 3, vec![0.85, 0.15]);
        svc.upload_video(Some("alice"), Some(&h.video));

        let response = svc.upload_image(Some("alice"), Some(&h.probe));
        assert_eq!(response.status, 400);
        assert_eq!(response.body["success"], true);
        assert_eq!(
            response.body["message"],
            "Image matches the class alice with confidence 0.85"
        );
    }

    #[test]
    fn test_upload_image_no_face() {
        let h = harness();
        let mut svc = service(&h.root, 3, vec![0.95, 0.05]);
        svc.upload_video(Some("alice"), Some(&h.video));

        let mut config = svc.config().clone();
        config.storage.data_dir = h.root.clone();
        let mut blind = EnrollmentService::new(
            config,
            Box::new(FixedDetector::new(vec![])),
            Box::new(SyntheticOpener { fps: 30.0, total: 0 }),
            FixedClassifier {
                probabilities: vec![0.95, 0.05],
            },
        );
        let response = blind.upload_image(Some("alice"), Some(&h.probe));
        assert_eq!(response.status, 400);
        assert_eq!(response.body["error"], "no face");
        assert_eq!(response.body["success"], false);
    }

    #[test]
    fn test_upload_image_undecodable_is_no_face() {
        let h = harness();
        let mut svc = service(&h.root, 3, vec![0.95, 0.05]);
        svc.upload_video(Some("alice"), Some(&h.video));

        let bad = h.root.join("broken.jpg");
        std::fs::write(&bad, b"garbage").unwrap();
        let response = svc.upload_image(Some("alice"), Some(&bad));
        assert_eq!(response.status, 400);
        assert_eq!(response.body["error"], "no face");
        assert_eq!(response.body["success"], false);
    }

    #[test]
    fn test_train_corpus() {
        let h = harness();
        let corpus = h.root.join("corpus");
        for (name, n) in [("bob", 3), ("carol", 2), ("solo", 1)] {
            let dir = corpus.join(name);
            std::fs::create_dir_all(&dir).unwrap();
            for i in 0..n {
                GrayImage::from_pixel(64, 64, Luma([90]))
                    .save(dir.join(format!("{i}.png")))
                    .unwrap();
            }
        }
        let mut svc = service(&h.root, 1, vec![0.5, 0.5]);
        let name = UserId::parse("team").unwrap();
        let manifest = svc.train_corpus(&corpus, &name).unwrap();
        assert_eq!(manifest.classes, vec!["bob", "carol"]);
        assert!(svc.store().exists(&name));
    }
}
