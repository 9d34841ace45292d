//! Epoch-level training controls: early stopping and learning-rate decay on
//! validation-loss plateaus.

/// Minimum decrease in validation loss that counts as an improvement.
const IMPROVEMENT_DELTA: f64 = 1e-4;

/// Outcome of feeding one epoch's validation loss to [`EarlyStopping`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Progress {
    /// New best loss; the caller should snapshot the model.
    Improved,
    /// No improvement, patience not yet exhausted.
    Stalled,
    /// Patience exhausted; training should stop and restore the best model.
    Stop,
}

/// Stops training after `patience` epochs without improvement.
#[derive(Debug, Clone)]
pub struct EarlyStopping {
    patience: usize,
    best: f64,
    best_epoch: usize,
    wait: usize,
}

impl EarlyStopping {
    pub fn new(patience: usize) -> Self {
        Self {
            patience,
            best: f64::INFINITY,
            best_epoch: 0,
            wait: 0,
        }
    }

    pub fn update(&mut self, epoch: usize, val_loss: f64) -> Progress {
        if val_loss < self.best {
            self.best = val_loss;
            self.best_epoch = epoch;
            self.wait = 0;
            return Progress::Improved;
        }
        self.wait += 1;
        if self.wait >= self.patience {
            Progress::Stop
        } else {
            Progress::Stalled
        }
    }

    pub fn best_loss(&self) -> f64 {
        self.best
    }

    pub fn best_epoch(&self) -> usize {
        self.best_epoch
    }
}

/// Multiplies the learning rate by `factor` after `patience` epochs without
/// improvement, never going below `min_lr`.
#[derive(Debug, Clone)]
pub struct PlateauScheduler {
    lr: f64,
    factor: f64,
    patience: usize,
    min_lr: f64,
    best: f64,
    wait: usize,
}

impl PlateauScheduler {
    pub fn new(initial_lr: f64, factor: f64, patience: usize, min_lr: f64) -> Self {
        Self {
            lr: initial_lr,
            factor,
            patience,
            min_lr,
            best: f64::INFINITY,
            wait: 0,
        }
    }

    pub fn lr(&self) -> f64 {
        self.lr
    }

    /// Record one epoch's validation loss and return the learning rate for
    /// the next epoch.
    pub fn step(&mut self, val_loss: f64) -> f64 {
        if val_loss < self.best - IMPROVEMENT_DELTA {
            self.best = val_loss;
            self.wait = 0;
            return self.lr;
        }

        self.wait += 1;
        if self.wait >= self.patience {
            let reduced = (self.lr * self.factor).max(self.min_lr);
            if reduced < self.lr {
                tracing::info!(from = self.lr, to = reduced, "reducing learning rate");
                self.lr = reduced;
            }
            self.wait = 0;
        }
        self.lr
    }
}
