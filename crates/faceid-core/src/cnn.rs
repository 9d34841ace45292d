//! Convolutional face classifier on the `burn` ndarray backend.
//!
//! Three conv blocks (32, 64, 128 filters; two same-padded convolutions
//! with ReLU and batch-norm, 2x2 max-pool, dropout each), a 256-unit dense
//! layer with dropout, and a linear head whose softmax gives the class
//! probabilities.

use crate::augment::{sequential_batches, Batch, BatchGenerator};
use crate::classifier::{
    Classifier, ClassifierError, EpochMetrics, Prediction, TrainedModel, TrainingReport,
};
use crate::config::{DatasetConfig, TrainingConfig};
use crate::dataset::{DatasetSplit, Partition};
use crate::schedule::{EarlyStopping, PlateauScheduler, Progress};
use burn::backend::ndarray::NdArrayDevice;
use burn::backend::{Autodiff, NdArray};
use burn::module::AutodiffModule;
use burn::nn::conv::{Conv2d, Conv2dConfig};
use burn::nn::loss::CrossEntropyLossConfig;
use burn::nn::pool::{MaxPool2d, MaxPool2dConfig};
use burn::nn::{
    BatchNorm, BatchNormConfig, Dropout, DropoutConfig, Linear, LinearConfig, PaddingConfig2d,
};
use burn::optim::decay::WeightDecayConfig;
use burn::optim::{AdamConfig, GradientsParams, Optimizer};
use burn::prelude::*;
use burn::record::{BinFileRecorder, FullPrecisionSettings};
use burn::tensor::activation::{relu, softmax};
use burn::tensor::ElementConversion;
use ndarray::ArrayView2;
use std::path::Path;

pub type InferenceBackend = NdArray<f32>;
pub type TrainingBackend = Autodiff<InferenceBackend>;

/// Filters per conv block.
const CONV_CHANNELS: [usize; 3] = [32, 64, 128];
const POOL_SIZE: usize = 2;

type WeightsRecorder = BinFileRecorder<FullPrecisionSettings>;

#[derive(Module, Debug)]
pub struct ConvBlock<B: Backend> {
    conv1: Conv2d<B>,
    norm1: BatchNorm<B, 2>,
    conv2: Conv2d<B>,
    norm2: BatchNorm<B, 2>,
    pool: MaxPool2d,
    dropout: Dropout,
}

impl<B: Backend> ConvBlock<B> {
    fn new(
        in_channels: usize,
        out_channels: usize,
        kernel: usize,
        dropout: f64,
        device: &B::Device,
    ) -> Self {
        let conv = |input| {
            Conv2dConfig::new([input, out_channels], [kernel, kernel])
                .with_padding(PaddingConfig2d::Same)
                .init(device)
        };
        Self {
            conv1: conv(in_channels),
            norm1: BatchNormConfig::new(out_channels).init(device),
            conv2: conv(out_channels),
            norm2: BatchNormConfig::new(out_channels).init(device),
            pool: MaxPool2dConfig::new([POOL_SIZE, POOL_SIZE])
                .with_strides([POOL_SIZE, POOL_SIZE])
                .init(),
            dropout: DropoutConfig::new(dropout).init(),
        }
    }

    fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        let x = self.norm1.forward(relu(self.conv1.forward(x)));
        let x = self.norm2.forward(relu(self.conv2.forward(x)));
        self.dropout.forward(self.pool.forward(x))
    }
}

#[derive(Module, Debug)]
pub struct FaceCnn<B: Backend> {
    blocks: Vec<ConvBlock<B>>,
    dense: Linear<B>,
    dense_dropout: Dropout,
    head: Linear<B>,
}

impl<B: Backend> FaceCnn<B> {
    pub fn new(
        training: &TrainingConfig,
        image_size: usize,
        num_classes: usize,
        device: &B::Device,
    ) -> Self {
        let mut blocks = Vec::with_capacity(CONV_CHANNELS.len());
        let mut in_channels = 1;
        let mut side = image_size;
        for &out_channels in &CONV_CHANNELS {
            blocks.push(ConvBlock::new(
                in_channels,
                out_channels,
                training.kernel_size,
                training.conv_dropout,
                device,
            ));
            in_channels = out_channels;
            side /= POOL_SIZE;
        }
        let flattened = in_channels * side * side;

        Self {
            blocks,
            dense: LinearConfig::new(flattened, training.dense_units).init(device),
            dense_dropout: DropoutConfig::new(training.dense_dropout).init(),
            head: LinearConfig::new(training.dense_units, num_classes).init(device),
        }
    }

    /// `[batch, 1, size, size]` -> logits `[batch, classes]`.
    pub fn forward(&self, images: Tensor<B, 4>) -> Tensor<B, 2> {
        let mut x = images;
        for block in &self.blocks {
            x = block.forward(x);
        }
        let [batch, channels, height, width] = x.dims();
        let x = x.reshape([batch, channels * height * width]);
        let x = self.dense_dropout.forward(relu(self.dense.forward(x)));
        self.head.forward(x)
    }
}

/// Trains [`FaceCnn`] models with Adam, early stopping and plateau decay.
#[derive(Debug, Clone)]
pub struct CnnClassifier {
    training: TrainingConfig,
    dataset: DatasetConfig,
    device: NdArrayDevice,
}

impl CnnClassifier {
    pub fn new(training: TrainingConfig, dataset: DatasetConfig) -> Self {
        Self {
            training,
            dataset,
            device: NdArrayDevice::default(),
        }
    }

    fn image_size(&self) -> usize {
        self.dataset.image_size as usize
    }

    fn check_input(&self, split: &DatasetSplit) -> Result<(), ClassifierError> {
        let min_side = POOL_SIZE.pow(CONV_CHANNELS.len() as u32);
        if self.image_size() < min_side {
            return Err(ClassifierError::InvalidData(format!(
                "image size {} is smaller than {min_side}",
                self.image_size()
            )));
        }
        if split.classes.len() < 2 {
            return Err(ClassifierError::InvalidData("need at least two classes".into()));
        }
        if split.train.is_empty() || split.validation.is_empty() {
            return Err(ClassifierError::InvalidData(
                "train and validation partitions must be non-empty".into(),
            ));
        }
        let (_, h, w) = split.train.images.dim();
        if (h, w) != (self.image_size(), self.image_size()) {
            return Err(ClassifierError::Shape {
                expected: (self.image_size(), self.image_size()),
                actual: (h, w),
            });
        }
        Ok(())
    }

    fn images_tensor<B: Backend>(&self, batch: &Batch, device: &B::Device) -> Tensor<B, 4> {
        let (n, h, w) = batch.images.dim();
        let values: Vec<f32> = batch.images.iter().copied().collect();
        Tensor::from_data(TensorData::new(values, [n, 1, h, w]), device)
    }

    fn labels_tensor<B: Backend>(&self, batch: &Batch, device: &B::Device) -> Tensor<B, 1, Int> {
        let labels: Vec<i64> = batch.labels.iter().map(|&l| l as i64).collect();
        Tensor::from_data(TensorData::new(labels, [batch.labels.len()]), device)
    }

    /// Mean loss and accuracy of `model` over `partition`.
    fn evaluate(&self, model: &FaceCnn<InferenceBackend>, partition: &Partition) -> (f64, f64) {
        let loss_fn = CrossEntropyLossConfig::new().init(&self.device);
        let mut loss_sum = 0.0;
        let mut correct = 0usize;

        for batch in sequential_batches(partition, self.dataset.batch_size) {
            let n = batch.labels.len();
            let logits = model.forward(self.images_tensor(&batch, &self.device));
            let targets = self.labels_tensor(&batch, &self.device);

            let predicted = logits.clone().argmax(1).into_data();
            correct += predicted
                .iter::<i64>()
                .zip(&batch.labels)
                .filter(|(p, l)| *p == **l as i64)
                .count();

            let loss: f64 = loss_fn.forward(logits, targets).into_scalar().elem();
            loss_sum += loss * n as f64;
        }

        let total = partition.len().max(1) as f64;
        (loss_sum / total, correct as f64 / total)
    }
}

impl Classifier for CnnClassifier {
    type Model = CnnModel;

    fn fit(&self, split: &DatasetSplit) -> Result<(CnnModel, TrainingReport), ClassifierError> {
        self.check_input(split)?;
        let num_classes = split.classes.len();
        let t = &self.training;

        TrainingBackend::seed(self.dataset.split_seed);
        let mut model: FaceCnn<TrainingBackend> =
            FaceCnn::new(t, self.image_size(), num_classes, &self.device);
        let mut optim = AdamConfig::new()
            .with_weight_decay(Some(WeightDecayConfig::new(t.weight_decay)))
            .init::<TrainingBackend, FaceCnn<TrainingBackend>>();
        let loss_fn = CrossEntropyLossConfig::new().init(&self.device);

        let mut batches = BatchGenerator::new(
            &split.train,
            self.dataset.batch_size,
            self.dataset.augment,
            self.dataset.split_seed,
        );
        let mut stopping = EarlyStopping::new(t.early_stopping_patience);
        let mut scheduler = PlateauScheduler::new(
            t.learning_rate,
            t.lr_factor,
            t.lr_patience,
            t.min_learning_rate,
        );
        let mut best: Option<FaceCnn<InferenceBackend>> = None;
        let mut history = Vec::new();

        tracing::info!(
            classes = num_classes,
            train = split.train.len(),
            validation = split.validation.len(),
            epochs = t.epochs,
            "training classifier"
        );

        for epoch in 0..t.epochs {
            let lr = scheduler.lr();
            let mut train_loss_sum = 0.0;

            for batch in batches.epoch() {
                let n = batch.labels.len();
                let logits = model.forward(self.images_tensor(&batch, &self.device));
                let loss = loss_fn.forward(logits, self.labels_tensor(&batch, &self.device));
                let batch_loss: f64 = loss.clone().into_scalar().elem();
                if !batch_loss.is_finite() {
                    return Err(ClassifierError::Training(format!(
                        "loss diverged at epoch {epoch}"
                    )));
                }
                train_loss_sum += batch_loss * n as f64;

                let grads = GradientsParams::from_grads(loss.backward(), &model);
                model = optim.step(lr, model, grads);
            }

            let snapshot = model.valid();
            let (val_loss, val_accuracy) = self.evaluate(&snapshot, &split.validation);
            let metrics = EpochMetrics {
                epoch,
                train_loss: train_loss_sum / split.train.len() as f64,
                val_loss,
                val_accuracy,
                learning_rate: lr,
            };
            tracing::info!(
                epoch,
                train_loss = metrics.train_loss,
                val_loss,
                val_accuracy,
                lr,
                "epoch complete"
            );
            history.push(metrics);

            scheduler.step(val_loss);
            match stopping.update(epoch, val_loss) {
                Progress::Improved => best = Some(snapshot),
                Progress::Stalled => {}
                Progress::Stop => {
                    tracing::info!(epoch, best_epoch = stopping.best_epoch(), "early stopping");
                    break;
                }
            }
        }

        let network = best.unwrap_or_else(|| model.valid());
        let (_, val_accuracy) = self.evaluate(&network, &split.validation);
        let test_accuracy = split
            .test
            .as_ref()
            .map(|test| self.evaluate(&network, test).1);

        let report = TrainingReport {
            epochs_run: history.len(),
            best_epoch: stopping.best_epoch(),
            best_val_loss: stopping.best_loss(),
            val_accuracy,
            test_accuracy,
            history,
        };
        tracing::info!(
            epochs_run = report.epochs_run,
            best_epoch = report.best_epoch,
            val_accuracy,
            ?test_accuracy,
            "training finished"
        );

        Ok((
            CnnModel {
                network,
                num_classes,
                image_size: self.image_size(),
                device: self.device,
            },
            report,
        ))
    }

    fn load(&self, weights: &Path, num_classes: usize) -> Result<CnnModel, ClassifierError> {
        let network: FaceCnn<InferenceBackend> =
            FaceCnn::new(&self.training, self.image_size(), num_classes, &self.device);
        let network = network
            .load_file(weights.to_path_buf(), &WeightsRecorder::new(), &self.device)
            .map_err(|e| ClassifierError::Load {
                path: weights.display().to_string(),
                reason: format!("{e:?}"),
            })?;
        tracing::debug!(path = %weights.display(), num_classes, "loaded classifier weights");
        Ok(CnnModel {
            network,
            num_classes,
            image_size: self.image_size(),
            device: self.device,
        })
    }
}

/// A trained [`FaceCnn`] in inference mode.
#[derive(Debug)]
pub struct CnnModel {
    network: FaceCnn<InferenceBackend>,
    num_classes: usize,
    image_size: usize,
    device: NdArrayDevice,
}

impl TrainedModel for CnnModel {
    fn num_classes(&self) -> usize {
        self.num_classes
    }

    fn predict(&self, face: ArrayView2<'_, f32>) -> Result<Prediction, ClassifierError> {
        let (h, w) = face.dim();
        if (h, w) != (self.image_size, self.image_size) {
            return Err(ClassifierError::Shape {
                expected: (self.image_size, self.image_size),
                actual: (h, w),
            });
        }
        let values: Vec<f32> = face.iter().copied().collect();
        let input = Tensor::<InferenceBackend, 4>::from_data(
            TensorData::new(values, [1, 1, h, w]),
            &self.device,
        );
        let probabilities = softmax(self.network.forward(input), 1)
            .into_data()
            .iter::<f32>()
            .collect();
        Ok(Prediction::new(probabilities))
    }

    fn save(&self, weights: &Path) -> Result<(), ClassifierError> {
        self.network
            .clone()
            .save_file(weights.to_path_buf(), &WeightsRecorder::new())
            .map_err(|e| ClassifierError::Save {
                path: weights.display().to_string(),
                reason: format!("{e:?}"),
            })
    }
}
