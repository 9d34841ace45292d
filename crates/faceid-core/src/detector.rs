//! Haar-cascade face detection.
//!
//! The [`FaceDetector`] trait keeps the extraction pipeline independent of
//! OpenCV; [`CascadeDetector`] is the production implementation (behind the
//! `opencv` feature).

use image::GrayImage;
use serde::{Deserialize, Serialize};
use thiserror::Error;

// --- Named constants (no magic numbers) ---
const CASCADE_SCALE_FACTOR: f64 = 1.1;
const CASCADE_MIN_SIZE: u32 = 64;
const VIDEO_MIN_NEIGHBORS: i32 = 15;
const IMAGE_MIN_NEIGHBORS: i32 = 10;

#[derive(Error, Debug)]
pub enum DetectorError {
    #[error("cascade file not found: {0}")]
    CascadeNotFound(String),
    #[error("failed to load cascade: {0}")]
    LoadFailed(String),
    #[error("detection failed: {0}")]
    DetectionFailed(String),
}

/// Cascade detector parameters.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DetectionParams {
    /// Image pyramid reduction per scale step.
    pub scale_factor: f64,
    /// Neighbouring candidates a detection needs to be retained.
    pub min_neighbors: i32,
    /// Smallest face (square side, pixels) reported.
    pub min_size: u32,
}

impl DetectionParams {
    /// Batch extraction from enrollment videos.
    pub const VIDEO: Self = Self {
        scale_factor: CASCADE_SCALE_FACTOR,
        min_neighbors: VIDEO_MIN_NEIGHBORS,
        min_size: CASCADE_MIN_SIZE,
    };

    /// Single probe images.
    pub const IMAGE: Self = Self {
        scale_factor: CASCADE_SCALE_FACTOR,
        min_neighbors: IMAGE_MIN_NEIGHBORS,
        min_size: CASCADE_MIN_SIZE,
    };
}

/// Axis-aligned face rectangle in frame pixel coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FaceRect {
    pub x: i32,
    pub y: i32,
    pub width: i32,
    pub height: i32,
}

impl FaceRect {
    pub fn new(x: i32, y: i32, width: i32, height: i32) -> Self {
        Self {
            x,
            y,
            width,
            height,
        }
    }
}

/// Locates faces in a grayscale frame.
///
/// Results are returned in the detector's native order; callers that keep
/// only one face take the first.
pub trait FaceDetector: Send {
    fn detect(
        &mut self,
        gray: &GrayImage,
        params: &DetectionParams,
    ) -> Result<Vec<FaceRect>, DetectorError>;
}

#[cfg(feature = "opencv")]
pub use self::cascade::CascadeDetector;

#[cfg(feature = "opencv")]
mod cascade {
    use super::{DetectionParams, DetectorError, FaceDetector, FaceRect};
    use image::GrayImage;
    use opencv::core::{Mat, Rect, Scalar, Size, Vector, CV_8UC1};
    use opencv::objdetect;
    use opencv::prelude::*;
    use std::path::Path;

    /// OpenCV `CascadeClassifier` (e.g. `haarcascade_frontalface_default.xml`).
    pub struct CascadeDetector {
        classifier: objdetect::CascadeClassifier,
    }

    impl CascadeDetector {
        /// Load a cascade XML from the given path.
        pub fn load(cascade_path: &Path) -> Result<Self, DetectorError> {
            let path = cascade_path.to_string_lossy().into_owned();
            if !cascade_path.exists() {
                return Err(DetectorError::CascadeNotFound(path));
            }

            let classifier = objdetect::CascadeClassifier::new(&path)
                .map_err(|e| DetectorError::LoadFailed(format!("{path}: {e}")))?;
            let empty = classifier
                .empty()
                .map_err(|e| DetectorError::LoadFailed(format!("{path}: {e}")))?;
            if empty {
                return Err(DetectorError::LoadFailed(format!("{path}: cascade is empty")));
            }

            tracing::info!(path = %path, "loaded face cascade");
            Ok(Self { classifier })
        }

        fn to_mat(gray: &GrayImage) -> opencv::Result<Mat> {
            let (width, height) = gray.dimensions();
            let mut mat = Mat::new_rows_cols_with_default(
                height as i32,
                width as i32,
                CV_8UC1,
                Scalar::all(0.0),
            )?;
            mat.data_bytes_mut()?.copy_from_slice(gray.as_raw());
            Ok(mat)
        }
    }

    impl FaceDetector for CascadeDetector {
        fn detect(
            &mut self,
            gray: &GrayImage,
            params: &DetectionParams,
        ) -> Result<Vec<FaceRect>, DetectorError> {
            let mat = Self::to_mat(gray).map_err(|e| DetectorError::DetectionFailed(e.to_string()))?;
            let min = params.min_size as i32;

            let mut faces = Vector::<Rect>::new();
            self.classifier
                .detect_multi_scale(
                    &mat,
                    &mut faces,
                    params.scale_factor,
                    params.min_neighbors,
                    objdetect::CASCADE_SCALE_IMAGE,
                    Size::new(min, min),
                    Size::new(0, 0),
                )
                .map_err(|e| DetectorError::DetectionFailed(e.to_string()))?;

            Ok(faces
                .iter()
                .map(|r| FaceRect::new(r.x, r.y, r.width, r.height))
                .collect())
        }
    }
}
