//! Frame type and pixel helpers for colour conversion and cropping.

use image::{GrayImage, RgbImage};

/// A decoded colour frame.
#[derive(Clone)]
pub struct Frame {
    /// Packed RGB8 pixel data (width * height * 3 bytes).
    pub data: Vec<u8>,
    pub width: u32,
    pub height: u32,
    /// Zero-based position in the decode stream (0 for still images).
    pub index: u64,
}

impl Frame {
    /// Wrap packed RGB8 data, validating its length.
    pub fn new(data: Vec<u8>, width: u32, height: u32, index: u64) -> Result<Self, FrameError> {
        let expected = (width as usize) * (height as usize) * 3;
        if data.len() != expected {
            return Err(FrameError::InvalidLength {
                expected,
                actual: data.len(),
            });
        }
        Ok(Self {
            data,
            width,
            height,
            index,
        })
    }

    pub fn from_image(image: RgbImage, index: u64) -> Self {
        let (width, height) = image.dimensions();
        Self {
            data: image.into_raw(),
            width,
            height,
            index,
        }
    }

    /// Grayscale copy of the frame, for detection.
    pub fn grayscale(&self) -> GrayImage {
        let gray = rgb_to_grayscale(&self.data);
        // Length is guaranteed by construction: one byte per RGB triple.
        GrayImage::from_raw(self.width, self.height, gray)
            .unwrap_or_else(|| GrayImage::new(self.width, self.height))
    }

    /// Cut a rectangle out of the original colour frame.
    ///
    /// The rectangle is clamped to the frame; a rectangle entirely outside
    /// the frame yields `None`.
    pub fn crop(&self, x: i32, y: i32, width: i32, height: i32) -> Option<RgbImage> {
        let x0 = x.max(0) as u32;
        let y0 = y.max(0) as u32;
        let x1 = (x.saturating_add(width)).clamp(0, self.width as i32) as u32;
        let y1 = (y.saturating_add(height)).clamp(0, self.height as i32) as u32;
        if x1 <= x0 || y1 <= y0 {
            return None;
        }

        let out_w = x1 - x0;
        let out_h = y1 - y0;
        let stride = self.width as usize * 3;
        let mut out = Vec::with_capacity((out_w * out_h * 3) as usize);
        for row in y0..y1 {
            let start = row as usize * stride + x0 as usize * 3;
            out.extend_from_slice(&self.data[start..start + out_w as usize * 3]);
        }
        RgbImage::from_raw(out_w, out_h, out)
    }
}

/// Convert packed RGB8 to 8-bit luma with ITU-R BT.601 weights.
///
/// These are the weights the Haar cascades were trained against, so the
/// detector sees the same intensities it would from OpenCV's own
/// `COLOR_BGR2GRAY`.
pub fn rgb_to_grayscale(rgb: &[u8]) -> Vec<u8> {
    rgb.chunks_exact(3)
        .map(|px| {
            let y = 0.299 * px[0] as f32 + 0.587 * px[1] as f32 + 0.114 * px[2] as f32;
            y.round().clamp(0.0, 255.0) as u8
        })
        .collect()
}

/// Swap the first and third channel of every packed pixel in place.
///
/// Turns OpenCV's native BGR layout into RGB (and back).
pub fn swap_red_blue(pixels: &mut [u8]) {
    for px in pixels.chunks_exact_mut(3) {
        px.swap(0, 2);
    }
}

#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("invalid RGB length: expected {expected}, got {actual}")]
    InvalidLength { expected: usize, actual: usize },
}

#[cfg(test)]
mod tests {
    use super::*;

    fn solid(width: u32, height: u32, rgb: [u8; 3]) -> Frame {
        let data = rgb.iter().copied().cycle().take((width * height * 3) as usize).collect();
        Frame::new(data, width, height, 0).unwrap()
    }

    #[test]
    fn test_new_rejects_short_buffer() {
        let result = Frame::new(vec![0u8; 10], 2, 2, 0);
        assert!(matches!(
            result,
            Err(FrameError::InvalidLength { expected: 12, actual: 10 })
        ));
    }

    #[test]
    fn test_grayscale_weights() {
        let gray = rgb_to_grayscale(&[255, 0, 0, 0, 255, 0, 0, 0, 255, 255, 255, 255]);
        assert_eq!(gray, vec![76, 150, 29, 255]);
    }

    #[test]
    fn test_grayscale_dimensions() {
        let frame = solid(8, 4, [10, 20, 30]);
        let gray = frame.grayscale();
        assert_eq!(gray.dimensions(), (8, 4));
    }

    #[test]
    fn test_swap_red_blue() {
        let mut px = vec![1, 2, 3, 4, 5, 6];
        swap_red_blue(&mut px);
        assert_eq!(px, vec![3, 2, 1, 6, 5, 4]);
    }

    #[test]
    fn test_crop_keeps_original_colour() {
        let frame = solid(10, 10, [200, 100, 50]);
        let crop = frame.crop(2, 3, 4, 4).unwrap();
        assert_eq!(crop.dimensions(), (4, 4));
        assert_eq!(crop.get_pixel(0, 0).0, [200, 100, 50]);
    }

    #[test]
    fn test_crop_selects_region() {
        // 4x1 frame with distinct pixels: crop the middle two.
        let data = vec![0, 0, 0, 1, 1, 1, 2, 2, 2, 3, 3, 3];
        let frame = Frame::new(data, 4, 1, 0).unwrap();
        let crop = frame.crop(1, 0, 2, 1).unwrap();
        assert_eq!(crop.into_raw(), vec![1, 1, 1, 2, 2, 2]);
    }

    #[test]
    fn test_crop_clamps_to_frame() {
        let frame = solid(10, 10, [0, 0, 0]);
        let crop = frame.crop(8, 8, 5, 5).unwrap();
        assert_eq!(crop.dimensions(), (2, 2));
    }

    #[test]
    fn test_crop_outside_frame() {
        let frame = solid(10, 10, [0, 0, 0]);
        assert!(frame.crop(20, 20, 5, 5).is_none());
    }
}
