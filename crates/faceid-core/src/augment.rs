//! Training-time augmentation and mini-batching.
//!
//! Geometry (shift, rotation, zoom, flip) is applied as one inverse affine
//! map with nearest-neighbour sampling and edge replication; photometric
//! jitter (brightness, contrast) follows, clamped back to [0, 1].

use crate::dataset::Partition;
use ndarray::{Array2, Array3, ArrayView2, Axis};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};

/// Ranges of the random transforms.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AugmentParams {
    /// Max shift as a fraction of width/height.
    pub shift: f32,
    /// Max rotation in degrees, either direction.
    pub rotation_degrees: f32,
    /// Zoom factor is drawn from `[1 - zoom, 1 + zoom]` per axis.
    pub zoom: f32,
    pub horizontal_flip: bool,
    /// Additive brightness offset drawn from `[-brightness, brightness]`.
    pub brightness: f32,
    /// Contrast factor range around the image mean.
    pub contrast: (f32, f32),
}

impl Default for AugmentParams {
    fn default() -> Self {
        Self {
            shift: 0.2,
            rotation_degrees: 30.0,
            zoom: 0.2,
            horizontal_flip: true,
            brightness: 0.2,
            contrast: (0.5, 0.7),
        }
    }
}

pub struct Augmenter {
    params: AugmentParams,
    rng: StdRng,
}

impl Augmenter {
    pub fn new(params: AugmentParams, seed: u64) -> Self {
        Self {
            params,
            rng: StdRng::seed_from_u64(seed),
        }
    }

    /// A randomly transformed copy of `image`, same shape, values in [0, 1].
    pub fn augment(&mut self, image: ArrayView2<'_, f32>) -> Array2<f32> {
        let (h, w) = image.dim();
        if h == 0 || w == 0 {
            return image.to_owned();
        }
        let p = self.params;

        let angle = self.symmetric(p.rotation_degrees).to_radians();
        let zoom_x = 1.0 + self.symmetric(p.zoom);
        let zoom_y = 1.0 + self.symmetric(p.zoom);
        let shift_x = self.symmetric(p.shift) * w as f32;
        let shift_y = self.symmetric(p.shift) * h as f32;
        let flip = p.horizontal_flip && self.rng.gen_bool(0.5);
        let brightness = self.symmetric(p.brightness);
        let contrast = if p.contrast.1 > p.contrast.0 {
            self.rng.gen_range(p.contrast.0..=p.contrast.1)
        } else {
            p.contrast.0
        };

        let (sin, cos) = angle.sin_cos();
        let cy = (h as f32 - 1.0) / 2.0;
        let cx = (w as f32 - 1.0) / 2.0;
        let max_x = (w - 1) as f32;
        let max_y = (h - 1) as f32;

        let mut out = Array2::from_shape_fn((h, w), |(r, c)| {
            let dx = c as f32 - cx - shift_x;
            let dy = r as f32 - cy - shift_y;
            let mut sx = (cos * dx + sin * dy) / zoom_x + cx;
            let sy = (-sin * dx + cos * dy) / zoom_y + cy;
            if flip {
                sx = max_x - sx;
            }
            let sx = sx.round().clamp(0.0, max_x) as usize;
            let sy = sy.round().clamp(0.0, max_y) as usize;
            image[[sy, sx]]
        });

        let mean = out.mean().unwrap_or(0.0);
        out.mapv_inplace(|v| ((v - mean) * contrast + mean + brightness).clamp(0.0, 1.0));
        out
    }

    fn symmetric(&mut self, range: f32) -> f32 {
        if range > 0.0 {
            self.rng.gen_range(-range..=range)
        } else {
            0.0
        }
    }
}

/// One mini-batch.
#[derive(Debug, Clone)]
pub struct Batch {
    /// `(batch, size, size)`.
    pub images: Array3<f32>,
    pub labels: Vec<usize>,
}

/// Produces shuffled (and optionally augmented) mini-batches of a partition.
pub struct BatchGenerator<'a> {
    partition: &'a Partition,
    batch_size: usize,
    augmenter: Option<Augmenter>,
    rng: StdRng,
}

impl<'a> BatchGenerator<'a> {
    pub fn new(partition: &'a Partition, batch_size: usize, augment: bool, seed: u64) -> Self {
        Self {
            partition,
            batch_size: batch_size.max(1),
            augmenter: augment.then(|| Augmenter::new(AugmentParams::default(), seed ^ 0x5eed)),
            rng: StdRng::seed_from_u64(seed),
        }
    }

    /// Batches for one epoch. Order is reshuffled on every call and the
    /// trailing partial batch is kept.
    pub fn epoch(&mut self) -> Vec<Batch> {
        let mut order: Vec<usize> = (0..self.partition.len()).collect();
        order.shuffle(&mut self.rng);

        order
            .chunks(self.batch_size)
            .map(|indices| {
                let mut images = self.partition.images.select(Axis(0), indices);
                if let Some(augmenter) = self.augmenter.as_mut() {
                    for mut image in images.outer_iter_mut() {
                        let augmented = augmenter.augment(image.view());
                        image.assign(&augmented);
                    }
                }
                Batch {
                    images,
                    labels: indices.iter().map(|&i| self.partition.labels[i]).collect(),
                }
            })
            .collect()
    }
}

/// Fixed-order batches without augmentation, for evaluation.
pub fn sequential_batches(partition: &Partition, batch_size: usize) -> Vec<Batch> {
    let order: Vec<usize> = (0..partition.len()).collect();
    order
        .chunks(batch_size.max(1))
        .map(|indices| Batch {
            images: partition.images.select(Axis(0), indices),
            labels: indices.iter().map(|&i| partition.labels[i]).collect(),
        })
        .collect()
}
