//! Face extraction from enrollment videos and probe images.
//!
//! Videos are decimated with a fixed frame-index stride, every face found in
//! a sampled frame is saved as `face_NNNN.jpg` until the cap is reached.
//! Single images keep only the first face, saved as `face.jpg`.

use crate::config::ExtractionConfig;
use crate::detector::{DetectionParams, FaceDetector, FaceRect};
use faceid_media::{load_image, Frame, FrameSource, MediaError, VideoOpener};
use std::path::{Path, PathBuf};
use thiserror::Error;

/// File name of the single crop written in image mode.
pub const SINGLE_FACE_FILENAME: &str = "face.jpg";

#[derive(Error, Debug)]
pub enum ExtractError {
    #[error("invalid source: {0}")]
    InvalidSource(String),
    #[error("sampling rate must be greater than zero, got {0}")]
    InvalidSamplingRate(f64),
    #[error("failed to create output directory {path}: {source}")]
    OutputDir {
        path: String,
        source: std::io::Error,
    },
}

impl From<MediaError> for ExtractError {
    fn from(e: MediaError) -> Self {
        ExtractError::InvalidSource(e.to_string())
    }
}

/// What to extract from a source.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ExtractionMode {
    /// Every face of every sampled frame, up to `max_faces`.
    Video { sampling_rate: f64, max_faces: usize },
    /// The first face of a single still image.
    Image,
}

/// Frame-index stride that approximates `sampling_rate` frames per second.
///
/// `max(1, floor(native_fps / sampling_rate))`.
pub fn sampling_stride(native_fps: f64, sampling_rate: f64) -> usize {
    let stride = (native_fps / sampling_rate).floor();
    if stride.is_finite() && stride >= 1.0 {
        stride as usize
    } else {
        1
    }
}

/// Zero-padded crop file name for the `index`-th face of a video run.
pub fn face_filename(index: usize) -> String {
    format!("face_{index:04}.jpg")
}

/// Runs a [`FaceDetector`] over videos and images and saves the crops.
pub struct FaceExtractor {
    detector: Box<dyn FaceDetector>,
    video_params: DetectionParams,
    image_params: DetectionParams,
}

impl FaceExtractor {
    pub fn new(detector: Box<dyn FaceDetector>, config: &ExtractionConfig) -> Self {
        Self {
            detector,
            video_params: config.video_detection,
            image_params: config.image_detection,
        }
    }

    /// Extract from `source` into `output_dir` and return the number of
    /// faces saved (0 or 1 in image mode).
    pub fn extract_faces(
        &mut self,
        opener: &dyn VideoOpener,
        source: &Path,
        output_dir: &Path,
        mode: ExtractionMode,
    ) -> Result<usize, ExtractError> {
        match mode {
            ExtractionMode::Video {
                sampling_rate,
                max_faces,
            } => self.extract_video_file(opener, source, output_dir, sampling_rate, max_faces),
            ExtractionMode::Image => Ok(self
                .extract_image_file(source, output_dir)?
                .map_or(0, |_| 1)),
        }
    }

    /// Open a video file and extract from it; see [`Self::extract_video`].
    pub fn extract_video_file(
        &mut self,
        opener: &dyn VideoOpener,
        video_path: &Path,
        output_dir: &Path,
        sampling_rate: f64,
        max_faces: usize,
    ) -> Result<usize, ExtractError> {
        if !(sampling_rate > 0.0) {
            return Err(ExtractError::InvalidSamplingRate(sampling_rate));
        }
        let mut source = opener.open(video_path)?;
        self.extract_video(source.as_mut(), output_dir, sampling_rate, max_faces)
    }

    /// Save every face of every sampled frame until `max_faces` is reached.
    ///
    /// Frames `0, stride, 2*stride, …` are sampled. Existing files in
    /// `output_dir` are never removed; numbering restarts at `face_0000`.
    pub fn extract_video(
        &mut self,
        source: &mut dyn FrameSource,
        output_dir: &Path,
        sampling_rate: f64,
        max_faces: usize,
    ) -> Result<usize, ExtractError> {
        if !(sampling_rate > 0.0) {
            return Err(ExtractError::InvalidSamplingRate(sampling_rate));
        }
        let fps = source.fps();
        if !(fps > 0.0) {
            return Err(ExtractError::InvalidSource(format!("invalid frame rate {fps}")));
        }
        create_output_dir(output_dir)?;

        let stride = sampling_stride(fps, sampling_rate);
        tracing::debug!(fps, sampling_rate, stride, "video sampling stride");

        let mut face_count = 0usize;
        let mut frame_index = 0usize;
        let mut sampled = 0usize;

        while face_count < max_faces {
            let frame = match source.next_frame() {
                Ok(Some(frame)) => frame,
                Ok(None) => break,
                Err(e) => {
                    tracing::warn!(frame = frame_index, error = %e, "frame decode failed; ending stream");
                    break;
                }
            };

            if frame_index % stride == 0 {
                sampled += 1;
                for rect in self.detect(&frame, self.video_params) {
                    let path = output_dir.join(face_filename(face_count));
                    if !save_crop(&frame, &rect, &path) {
                        continue;
                    }
                    face_count += 1;
                    if face_count >= max_faces {
                        break;
                    }
                }
            }

            frame_index += 1;
        }

        tracing::info!(
            faces = face_count,
            frames_read = frame_index,
            frames_sampled = sampled,
            output = %output_dir.display(),
            "extracted faces from video"
        );
        Ok(face_count)
    }

    /// Load an image file and extract its first face; see [`Self::extract_image`].
    ///
    /// An image that cannot be read or decoded yields no face, like an
    /// image without one.
    pub fn extract_image_file(
        &mut self,
        image_path: &Path,
        output_dir: &Path,
    ) -> Result<Option<PathBuf>, ExtractError> {
        let frame = match load_image(image_path) {
            Ok(frame) => frame,
            Err(e) => {
                tracing::warn!(image = %image_path.display(), error = %e, "unreadable image");
                create_output_dir(output_dir)?;
                return Ok(None);
            }
        };
        self.extract_image(&frame, output_dir)
    }

    /// Save the first detected face as `face.jpg`.
    ///
    /// `Ok(None)` means no face was found; nothing is written in that case.
    pub fn extract_image(
        &mut self,
        frame: &Frame,
        output_dir: &Path,
    ) -> Result<Option<PathBuf>, ExtractError> {
        create_output_dir(output_dir)?;

        let faces = self.detect(frame, self.image_params);
        let Some(rect) = faces.first() else {
            tracing::info!("no face detected");
            return Ok(None);
        };

        let path = output_dir.join(SINGLE_FACE_FILENAME);
        if !save_crop(frame, rect, &path) {
            return Ok(None);
        }
        tracing::info!(path = %path.display(), "extracted face");
        Ok(Some(path))
    }

    /// Detector failures are logged and treated as "no faces".
    fn detect(&mut self, frame: &Frame, params: DetectionParams) -> Vec<FaceRect> {
        let gray = frame.grayscale();
        match self.detector.detect(&gray, &params) {
            Ok(faces) => faces,
            Err(e) => {
                tracing::warn!(frame = frame.index, error = %e, "face detection failed");
                Vec::new()
            }
        }
    }
}

fn create_output_dir(dir: &Path) -> Result<(), ExtractError> {
    std::fs::create_dir_all(dir).map_err(|source| ExtractError::OutputDir {
        path: dir.display().to_string(),
        source,
    })
}

/// Write the crop of `rect` from the colour frame. Failures are logged.
fn save_crop(frame: &Frame, rect: &FaceRect, path: &Path) -> bool {
    let Some(crop) = frame.crop(rect.x, rect.y, rect.width, rect.height) else {
        tracing::warn!(frame = frame.index, ?rect, "face rectangle outside frame");
        return false;
    };
    match crop.save(path) {
        Ok(()) => true,
        Err(e) => {
            tracing::warn!(path = %path.display(), error = %e, "failed to write face crop");
            false
        }
    }
}
