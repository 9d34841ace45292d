//! Video and still-image sources.
//!
//! Videos are decoded with OpenCV's `VideoCapture` (behind the `opencv`
//! feature); still images are decoded with the `image` crate.

use crate::frame::{Frame, FrameError};
use std::path::Path;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum MediaError {
    #[error("file not found: {0}")]
    NotFound(String),
    #[error("could not open video: {0}")]
    OpenFailed(String),
    #[error("invalid frame rate {fps} for video {path}")]
    InvalidFrameRate { path: String, fps: f64 },
    #[error("frame decode failed: {0}")]
    DecodeFailed(String),
    #[error("image decode failed: {0}")]
    Image(#[from] image::ImageError),
    #[error(transparent)]
    Frame(#[from] FrameError),
}

/// A stream of decoded frames with a known native frame rate.
///
/// Dropping the source releases the underlying decoder.
pub trait FrameSource: Send {
    /// Native frame rate reported by the container.
    fn fps(&self) -> f64;

    /// Decode the next frame; `Ok(None)` marks the end of the stream.
    fn next_frame(&mut self) -> Result<Option<Frame>, MediaError>;
}

/// Opens video files as [`FrameSource`]s.
pub trait VideoOpener: Send + Sync {
    fn open(&self, path: &Path) -> Result<Box<dyn FrameSource>, MediaError>;
}

/// Load a still image from disk as an RGB frame.
pub fn load_image(path: &Path) -> Result<Frame, MediaError> {
    if !path.exists() {
        return Err(MediaError::NotFound(path.display().to_string()));
    }
    let rgb = image::open(path)?.to_rgb8();
    Ok(Frame::from_image(rgb, 0))
}

#[cfg(feature = "opencv")]
pub use self::opencv_backend::{OpenCvOpener, VideoFile};

#[cfg(feature = "opencv")]
mod opencv_backend {
    use super::{FrameSource, MediaError, VideoOpener};
    use crate::frame::{swap_red_blue, Frame};
    use opencv::core::{Mat, CV_8UC3};
    use opencv::prelude::*;
    use opencv::videoio;
    use std::path::Path;

    /// A video file opened through OpenCV's `VideoCapture`.
    pub struct VideoFile {
        capture: videoio::VideoCapture,
        fps: f64,
        next_index: u64,
        path: String,
    }

    impl VideoFile {
        /// Open a video and read its native frame rate.
        ///
        /// Fails if the container cannot be opened or reports a
        /// non-positive frame rate.
        pub fn open(path: &Path) -> Result<Self, MediaError> {
            let path_str = path.to_string_lossy().into_owned();
            if !path.exists() {
                return Err(MediaError::NotFound(path_str));
            }

            let capture = videoio::VideoCapture::from_file(&path_str, videoio::CAP_ANY)
                .map_err(|e| MediaError::OpenFailed(format!("{path_str}: {e}")))?;
            let opened = capture
                .is_opened()
                .map_err(|e| MediaError::OpenFailed(format!("{path_str}: {e}")))?;
            if !opened {
                return Err(MediaError::OpenFailed(path_str));
            }

            let fps = capture
                .get(videoio::CAP_PROP_FPS)
                .map_err(|e| MediaError::OpenFailed(format!("{path_str}: {e}")))?;
            // `capture` is dropped (and released) on this early return.
            if fps.is_nan() || fps <= 0.0 {
                return Err(MediaError::InvalidFrameRate {
                    path: path_str,
                    fps,
                });
            }

            tracing::info!(path = %path_str, fps, "opened video");

            Ok(Self {
                capture,
                fps,
                next_index: 0,
                path: path_str,
            })
        }
    }

    impl FrameSource for VideoFile {
        fn fps(&self) -> f64 {
            self.fps
        }

        fn next_frame(&mut self) -> Result<Option<Frame>, MediaError> {
            let mut mat = Mat::default();
            let ok = self
                .capture
                .read(&mut mat)
                .map_err(|e| MediaError::DecodeFailed(format!("{}: {e}", self.path)))?;
            if !ok || mat.empty() {
                return Ok(None);
            }

            if mat.typ() != CV_8UC3 {
                return Err(MediaError::DecodeFailed(format!(
                    "{}: unsupported pixel type {} (need 8-bit BGR)",
                    self.path,
                    mat.typ()
                )));
            }

            if !mat.is_continuous() {
                mat = mat
                    .try_clone()
                    .map_err(|e| MediaError::DecodeFailed(e.to_string()))?;
            }

            let mut data = mat
                .data_bytes()
                .map_err(|e| MediaError::DecodeFailed(e.to_string()))?
                .to_vec();
            swap_red_blue(&mut data);

            let frame = Frame::new(data, mat.cols() as u32, mat.rows() as u32, self.next_index)?;
            self.next_index += 1;
            Ok(Some(frame))
        }
    }

    impl Drop for VideoFile {
        fn drop(&mut self) {
            if let Err(e) = self.capture.release() {
                tracing::warn!(path = %self.path, error = %e, "failed to release video");
            } else {
                tracing::debug!(path = %self.path, frames = self.next_index, "video released");
            }
        }
    }

    /// Default [`VideoOpener`] backed by [`VideoFile`].
    #[derive(Debug, Default, Clone, Copy)]
    pub struct OpenCvOpener;

    impl VideoOpener for OpenCvOpener {
        fn open(&self, path: &Path) -> Result<Box<dyn FrameSource>, MediaError> {
            Ok(Box::new(VideoFile::open(path)?))
        }
    }
}
