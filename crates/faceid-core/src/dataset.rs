//! Labeled face datasets: directory loading, label encoding and the
//! stratified train/validation/test split.

use crate::config::DatasetConfig;
use faceid_media::frame::rgb_to_grayscale;
use image::imageops::{self, FilterType};
use ndarray::{Array2, Array3, Axis};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Image file extensions picked up when scanning a class directory.
const IMAGE_EXTENSIONS: [&str; 3] = ["jpg", "jpeg", "png"];

/// Smallest number of samples a class needs to appear in both partitions.
const MIN_SAMPLES_PER_CLASS: usize = 2;

#[derive(Error, Debug)]
pub enum DatasetError {
    #[error("directory not found: {0}")]
    MissingDirectory(String),
    #[error("insufficient data: {0}")]
    InsufficientData(String),
    #[error("failed to read {path}: {source}")]
    Io {
        path: String,
        source: std::io::Error,
    },
    #[error("failed to decode image {path}: {source}")]
    Image {
        path: String,
        source: image::ImageError,
    },
    #[error("dataset shape error: {0}")]
    Shape(#[from] ndarray::ShapeError),
}

/// Where the classes of a training run come from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DatasetSource {
    /// One enrolled user against the shared negative class.
    UserVsUnknown {
        user_dir: PathBuf,
        unknown_dir: PathBuf,
    },
    /// Every subdirectory of `root` is one identity.
    Corpus { root: PathBuf },
}

/// Images with integer labels; `classes[label]` is the class name.
#[derive(Debug, Clone)]
pub struct LabeledDataset {
    /// `(n, size, size)` grayscale rasters in [0, 1].
    pub images: Array3<f32>,
    pub labels: Vec<usize>,
    pub classes: Vec<String>,
}

/// One side of a split.
#[derive(Debug, Clone)]
pub struct Partition {
    pub images: Array3<f32>,
    pub labels: Vec<usize>,
}

impl Partition {
    pub fn len(&self) -> usize {
        self.labels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }
}

#[derive(Debug, Clone)]
pub struct DatasetSplit {
    pub classes: Vec<String>,
    pub train: Partition,
    pub validation: Partition,
    pub test: Option<Partition>,
}

impl LabeledDataset {
    pub fn len(&self) -> usize {
        self.labels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }

    /// Per-class sample counts, indexed by label.
    pub fn class_counts(&self) -> Vec<usize> {
        let mut counts = vec![0; self.classes.len()];
        for &label in &self.labels {
            counts[label] += 1;
        }
        counts
    }

    /// Stratified split driven by `seed`.
    ///
    /// Every class contributes at least one sample to validation (and to
    /// test when `test_fraction > 0` and the class is large enough) and
    /// always keeps at least one training sample.
    pub fn split(
        &self,
        validation_fraction: f32,
        test_fraction: f32,
        seed: u64,
    ) -> Result<DatasetSplit, DatasetError> {
        if self.classes.len() < 2 {
            return Err(DatasetError::InsufficientData(format!(
                "need at least two classes, found {}",
                self.classes.len()
            )));
        }
        let counts = self.class_counts();
        if let Some(label) = counts.iter().position(|&n| n < MIN_SAMPLES_PER_CLASS) {
            return Err(DatasetError::InsufficientData(format!(
                "class '{}' has {} sample(s), need at least {MIN_SAMPLES_PER_CLASS}",
                self.classes[label], counts[label]
            )));
        }
        if !(validation_fraction > 0.0) || validation_fraction + test_fraction >= 1.0 {
            return Err(DatasetError::InsufficientData(format!(
                "invalid split fractions: validation {validation_fraction}, test {test_fraction}"
            )));
        }

        let mut rng = StdRng::seed_from_u64(seed);
        let mut train_idx = Vec::new();
        let mut val_idx = Vec::new();
        let mut test_idx = Vec::new();

        for label in 0..self.classes.len() {
            let mut members: Vec<usize> = (0..self.len())
                .filter(|&i| self.labels[i] == label)
                .collect();
            members.shuffle(&mut rng);

            let n = members.len();
            let (n_val, n_test) = holdout_sizes(n, validation_fraction, test_fraction);

            val_idx.extend_from_slice(&members[..n_val]);
            test_idx.extend_from_slice(&members[n_val..n_val + n_test]);
            train_idx.extend_from_slice(&members[n_val + n_test..]);
        }

        let test = if test_fraction > 0.0 && !test_idx.is_empty() {
            Some(self.partition(&test_idx))
        } else {
            None
        };

        Ok(DatasetSplit {
            classes: self.classes.clone(),
            train: self.partition(&train_idx),
            validation: self.partition(&val_idx),
            test,
        })
    }

    fn partition(&self, indices: &[usize]) -> Partition {
        Partition {
            images: self.images.select(Axis(0), indices),
            labels: indices.iter().map(|&i| self.labels[i]).collect(),
        }
    }
}

/// `(validation, test)` sample counts for a class of `n` samples.
fn holdout_sizes(n: usize, validation_fraction: f32, test_fraction: f32) -> (usize, usize) {
    let max_holdout = n.saturating_sub(1);
    let n_val = ((n as f32 * validation_fraction).round() as usize).max(1);
    let n_test = if test_fraction > 0.0 {
        ((n as f32 * test_fraction).round() as usize).max(1)
    } else {
        0
    };

    let n_val = n_val.min(max_holdout);
    let n_test = n_test.min(max_holdout - n_val);
    (n_val, n_test)
}

/// Loads face directories into a [`LabeledDataset`].
#[derive(Debug, Clone)]
pub struct DatasetBuilder {
    image_size: u32,
}

impl DatasetBuilder {
    pub fn new(config: &DatasetConfig) -> Self {
        Self {
            image_size: config.image_size,
        }
    }

    pub fn image_size(&self) -> u32 {
        self.image_size
    }

    /// Load one face crop as a `size x size` grayscale raster in [0, 1].
    ///
    /// Luma uses the BT.601 weights of [`rgb_to_grayscale`], the same
    /// conversion the detector sees. Resampling is nearest-neighbour, so
    /// converting after the resize picks the same pixels.
    pub fn load_face(&self, path: &Path) -> Result<Array2<f32>, DatasetError> {
        let rgb = image::open(path)
            .map_err(|source| DatasetError::Image {
                path: path.display().to_string(),
                source,
            })?
            .to_rgb8();
        let resized = imageops::resize(&rgb, self.image_size, self.image_size, FilterType::Nearest);
        let size = self.image_size as usize;
        let pixels = rgb_to_grayscale(resized.as_raw())
            .into_iter()
            .map(|p| p as f32 / 255.0)
            .collect();
        Ok(Array2::from_shape_vec((size, size), pixels)?)
    }

    pub fn build(&self, source: &DatasetSource) -> Result<LabeledDataset, DatasetError> {
        let classes = match source {
            DatasetSource::UserVsUnknown {
                user_dir,
                unknown_dir,
            } => {
                require_dir(user_dir)?;
                require_dir(unknown_dir)?;
                vec![
                    (class_name(user_dir), list_images(user_dir)?),
                    (class_name(unknown_dir), list_images(unknown_dir)?),
                ]
            }
            DatasetSource::Corpus { root } => self.corpus_classes(root)?,
        };
        self.load_classes(classes)
    }

    /// Subdirectories of `root` in name order, dropping identities too
    /// small to split.
    fn corpus_classes(&self, root: &Path) -> Result<Vec<(String, Vec<PathBuf>)>, DatasetError> {
        require_dir(root)?;
        let mut dirs = read_dir_sorted(root)?;
        dirs.retain(|p| p.is_dir());

        let mut classes = Vec::new();
        for dir in dirs {
            let images = list_images(&dir)?;
            let name = class_name(&dir);
            if images.len() < MIN_SAMPLES_PER_CLASS {
                tracing::warn!(class = %name, images = images.len(), "skipping identity with too few images");
                continue;
            }
            classes.push((name, images));
        }
        Ok(classes)
    }

    /// Decode every image and encode labels in first-seen order.
    fn load_classes(
        &self,
        classes: Vec<(String, Vec<PathBuf>)>,
    ) -> Result<LabeledDataset, DatasetError> {
        let size = self.image_size as usize;
        let mut index: BTreeMap<String, usize> = BTreeMap::new();
        let mut names = Vec::new();
        let mut labels = Vec::new();
        let mut pixels = Vec::new();

        for (name, files) in classes {
            for file in files {
                let face = self.load_face(&file)?;
                let next = names.len();
                let label = *index.entry(name.clone()).or_insert_with(|| {
                    names.push(name.clone());
                    next
                });
                pixels.extend(face.iter().copied());
                labels.push(label);
            }
        }

        let images = Array3::from_shape_vec((labels.len(), size, size), pixels)?;
        let dataset = LabeledDataset {
            images,
            labels,
            classes: names,
        };
        tracing::info!(
            samples = dataset.len(),
            classes = ?dataset.classes,
            counts = ?dataset.class_counts(),
            "loaded dataset"
        );
        Ok(dataset)
    }
}

fn require_dir(dir: &Path) -> Result<(), DatasetError> {
    if dir.is_dir() {
        Ok(())
    } else {
        Err(DatasetError::MissingDirectory(dir.display().to_string()))
    }
}

fn class_name(dir: &Path) -> String {
    dir.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| dir.display().to_string())
}

fn read_dir_sorted(dir: &Path) -> Result<Vec<PathBuf>, DatasetError> {
    let io_err = |source| DatasetError::Io {
        path: dir.display().to_string(),
        source,
    };
    let mut entries = Vec::new();
    for entry in std::fs::read_dir(dir).map_err(io_err)? {
        entries.push(entry.map_err(io_err)?.path());
    }
    entries.sort();
    Ok(entries)
}

/// Image files directly inside `dir`, in name order.
fn list_images(dir: &Path) -> Result<Vec<PathBuf>, DatasetError> {
    let mut files = read_dir_sorted(dir)?;
    files.retain(|p| {
        p.is_file()
            && p.extension()
                .and_then(|e| e.to_str())
                .is_some_and(|e| IMAGE_EXTENSIONS.contains(&e))
    });
    Ok(files)
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{GrayImage, Luma};
    use rstest::rstest;

    fn write_faces(dir: &Path, count: usize, value: u8) {
        std::fs::create_dir_all(dir).unwrap();
        for i in 0..count {
            GrayImage::from_pixel(64, 64, Luma([value]))
                .save(dir.join(format!("face_{i:04}.png")))
                .unwrap();
        }
    }

    fn builder() -> DatasetBuilder {
        DatasetBuilder::new(&DatasetConfig::default())
    }

    fn user_vs_unknown(root: &Path) -> DatasetSource {
        DatasetSource::UserVsUnknown {
            user_dir: root.join("alice"),
            unknown_dir: root.join("unknown"),
        }
    }

    #[test]
    fn test_load_face_normalises() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("crop.png");
        image::RgbImage::from_pixel(64, 64, image::Rgb([255, 255, 255]))
            .save(&path)
            .unwrap();

        let face = builder().load_face(&path).unwrap();
        assert_eq!(face.dim(), (64, 64));
        assert!(face.iter().all(|&v| (0.0..=1.0).contains(&v)));
        assert!(face.iter().all(|&v| (v - 1.0).abs() < 1e-6));
    }

    #[test]
    fn test_load_face_uses_detector_luma() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("red.png");
        image::RgbImage::from_pixel(64, 64, image::Rgb([255, 0, 0]))
            .save(&path)
            .unwrap();

        let face = builder().load_face(&path).unwrap();
        let frame = faceid_media::load_image(&path).unwrap();
        let detector_luma = frame.grayscale().get_pixel(0, 0).0[0];
        assert_eq!(detector_luma, 76);
        assert!((face[[0, 0]] - detector_luma as f32 / 255.0).abs() < 1e-6);
    }

    #[test]
    fn test_extracted_crop_reloads_normalised() {
        use crate::config::ExtractionConfig;
        use crate::detector::FaceRect;
        use crate::extractor::tests::FixedDetector;
        use crate::extractor::FaceExtractor;
        use faceid_media::Frame;

        let dir = tempfile::tempdir().unwrap();
        let pixels: Vec<u8> = (0..96 * 96 * 3).map(|i| (i % 251) as u8).collect();
        let frame = Frame::new(pixels, 96, 96, 0).unwrap();
        let mut extractor = FaceExtractor::new(
            Box::new(FixedDetector::new(vec![FaceRect::new(8, 8, 64, 64)])),
            &ExtractionConfig::default(),
        );

        let crop = extractor.extract_image(&frame, dir.path()).unwrap().unwrap();
        assert_eq!(crop.extension().and_then(|e| e.to_str()), Some("jpg"));

        let face = builder().load_face(&crop).unwrap();
        assert_eq!(face.dim(), (64, 64));
        assert!(face.iter().all(|&v| (0.0..=1.0).contains(&v)));
    }

    #[test]
    fn test_load_face_resizes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("big.png");
        GrayImage::from_pixel(150, 120, Luma([51])).save(&path).unwrap();

        let face = builder().load_face(&path).unwrap();
        assert_eq!(face.dim(), (64, 64));
        assert!((face[[10, 10]] - 0.2).abs() < 1e-6);
    }

    #[test]
    fn test_build_user_first_then_unknown() {
        let dir = tempfile::tempdir().unwrap();
        write_faces(&dir.path().join("alice"), 3, 200);
        write_faces(&dir.path().join("unknown"), 4, 10);

        let ds = builder().build(&user_vs_unknown(dir.path())).unwrap();
        assert_eq!(ds.classes, vec!["alice", "unknown"]);
        assert_eq!(ds.labels, vec![0, 0, 0, 1, 1, 1, 1]);
        assert_eq!(ds.images.dim(), (7, 64, 64));
        assert!(ds.images[[0, 0, 0]] > ds.images[[6, 0, 0]]);
    }

    #[test]
    fn test_build_ignores_other_extensions() {
        let dir = tempfile::tempdir().unwrap();
        write_faces(&dir.path().join("alice"), 2, 200);
        write_faces(&dir.path().join("unknown"), 2, 10);
        std::fs::write(dir.path().join("alice").join("notes.txt"), b"x").unwrap();
        std::fs::write(dir.path().join("alice").join("FACE.JPG"), b"x").unwrap();

        let ds = builder().build(&user_vs_unknown(dir.path())).unwrap();
        assert_eq!(ds.len(), 4);
    }

    #[test]
    fn test_build_missing_directory() {
        let dir = tempfile::tempdir().unwrap();
        write_faces(&dir.path().join("alice"), 2, 200);
        let result = builder().build(&user_vs_unknown(dir.path()));
        assert!(matches!(result, Err(DatasetError::MissingDirectory(_))));
    }

    #[test]
    fn test_build_rejects_corrupt_image() {
        let dir = tempfile::tempdir().unwrap();
        write_faces(&dir.path().join("alice"), 2, 200);
        write_faces(&dir.path().join("unknown"), 2, 10);
        std::fs::write(dir.path().join("unknown").join("zz.jpg"), b"garbage").unwrap();
        let result = builder().build(&user_vs_unknown(dir.path()));
        assert!(matches!(result, Err(DatasetError::Image { .. })));
    }

    #[test]
    fn test_corpus_drops_singletons() {
        let dir = tempfile::tempdir().unwrap();
        write_faces(&dir.path().join("bob"), 3, 100);
        write_faces(&dir.path().join("carol"), 1, 150);
        write_faces(&dir.path().join("dave"), 2, 50);
        std::fs::write(dir.path().join("README"), b"x").unwrap();

        let ds = builder()
            .build(&DatasetSource::Corpus {
                root: dir.path().to_path_buf(),
            })
            .unwrap();
        assert_eq!(ds.classes, vec!["bob", "dave"]);
        assert_eq!(ds.class_counts(), vec![3, 2]);
    }

    #[test]
    fn test_split_is_stratified_and_disjoint() {
        let dir = tempfile::tempdir().unwrap();
        write_faces(&dir.path().join("alice"), 10, 200);
        write_faces(&dir.path().join("unknown"), 20, 10);
        let ds = builder().build(&user_vs_unknown(dir.path())).unwrap();

        let split = ds.split(0.2, 0.0, 42).unwrap();
        assert_eq!(split.train.len() + split.validation.len(), 30);
        assert_eq!(split.validation.labels.iter().filter(|&&l| l == 0).count(), 2);
        assert_eq!(split.validation.labels.iter().filter(|&&l| l == 1).count(), 4);
        assert!(split.test.is_none());
        assert_eq!(split.train.images.dim(), (24, 64, 64));
    }

    #[test]
    fn test_split_with_test_partition() {
        let dir = tempfile::tempdir().unwrap();
        write_faces(&dir.path().join("alice"), 10, 200);
        write_faces(&dir.path().join("unknown"), 10, 10);
        let ds = builder().build(&user_vs_unknown(dir.path())).unwrap();

        let split = ds.split(0.2, 0.2, 7).unwrap();
        let test = split.test.unwrap();
        assert_eq!(test.len(), 4);
        assert_eq!(split.validation.len(), 4);
        assert_eq!(split.train.len(), 12);
    }

    #[test]
    fn test_split_is_repeatable() {
        let images = Array3::from_shape_fn((12, 2, 2), |(i, _, _)| i as f32);
        let labels = (0..12).map(|i| i % 2).collect();
        let ds = LabeledDataset {
            images,
            labels,
            classes: vec!["a".into(), "b".into()],
        };
        let a = ds.split(0.25, 0.0, 3).unwrap();
        let b = ds.split(0.25, 0.0, 3).unwrap();
        assert_eq!(a.validation.images, b.validation.images);
        assert_eq!(a.train.labels, b.train.labels);
    }

    #[rstest]
    #[case(vec![1, 5], "class 'a'")]
    #[case(vec![5], "two classes")]
    #[case(vec![], "two classes")]
    fn test_split_insufficient_data(#[case] counts: Vec<usize>, #[case] needle: &str) {
        let total: usize = counts.iter().sum();
        let labels: Vec<usize> = counts
            .iter()
            .enumerate()
            .flat_map(|(l, &n)| std::iter::repeat(l).take(n))
            .collect();
        let classes = (0..counts.len())
            .map(|i| ((b'a' + i as u8) as char).to_string())
            .collect();
        let ds = LabeledDataset {
            images: Array3::zeros((total, 2, 2)),
            labels,
            classes,
        };
        match ds.split(0.2, 0.0, 0) {
            Err(DatasetError::InsufficientData(msg)) => assert!(msg.contains(needle), "{msg}"),
            other => panic!("expected InsufficientData, got {other:?}"),
        }
    }

    #[rstest]
    #[case(2, 0.2, 0.0, (1, 0))]
    #[case(10, 0.2, 0.0, (2, 0))]
    #[case(2, 0.2, 0.2, (1, 0))]
    #[case(3, 0.2, 0.2, (1, 1))]
    #[case(250, 0.2, 0.1, (50, 25))]
    fn test_holdout_sizes(
        #[case] n: usize,
        #[case] val: f32,
        #[case] test: f32,
        #[case] expected: (usize, usize),
    ) {
        assert_eq!(holdout_sizes(n, val, test), expected);
    }
}
