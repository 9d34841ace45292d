//! faceid-media: media access for the enrollment pipeline.
//!
//! Decodes videos into RGB frames (OpenCV `VideoCapture`) and loads still
//! images, exposing both through the [`FrameSource`] abstraction so the
//! extraction pipeline never touches a codec directly.

pub mod frame;
pub mod video;

pub use frame::{Frame, FrameError};
pub use video::{load_image, FrameSource, MediaError, VideoOpener};

#[cfg(feature = "opencv")]
pub use video::{OpenCvOpener, VideoFile};
