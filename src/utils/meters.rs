//! Running averages for the console progress line.
//!
//! Meters are reporting-only state. Nothing resets them implicitly; each
//! `train` call builds a fresh [`TrainMeters`].

use serde::{Deserialize, Serialize};

/// Running mean and last value of a scalar observation
#[derive(Debug, Clone, Default)]
pub struct AverageMeter {
    val: f64,
    sum: f64,
    count: usize,
}

impl AverageMeter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record `val` observed over `n` samples
    pub fn update(&mut self, val: f64, n: usize) {
        self.val = val;
        self.sum += val * n as f64;
        self.count += n;
    }

    pub fn reset(&mut self) {
        *self = Self::default();
    }

    /// Last recorded value
    pub fn val(&self) -> f64 {
        self.val
    }

    /// Mean over everything recorded since the last reset
    pub fn avg(&self) -> f64 {
        if self.count == 0 {
            return 0.0;
        }
        self.sum / self.count as f64
    }

    pub fn count(&self) -> usize {
        self.count
    }
}

/// The five meters tracked by both trainers
#[derive(Debug, Clone, Default)]
pub struct TrainMeters {
    pub batch_time: AverageMeter,
    pub data_time: AverageMeter,
    pub loss_ce: AverageMeter,
    pub loss_tri: AverageMeter,
    pub precision: AverageMeter,
}

impl TrainMeters {
    pub fn new() -> Self {
        Self::default()
    }

    /// Diagnostic line: smoothed value in parentheses after the last value
    pub fn progress_line(&self, epoch: usize, iteration: usize, total: usize) -> String {
        format!(
            "Epoch: [{}][{}/{}]\tTime {:.3} ({:.3})\tData {:.3} ({:.3})\tLoss_ce {:.3} ({:.3})\tLoss_tr {:.3} ({:.3})\tPrec {:.2}% ({:.2}%)",
            epoch,
            iteration,
            total,
            self.batch_time.val(),
            self.batch_time.avg(),
            self.data_time.val(),
            self.data_time.avg(),
            self.loss_ce.val(),
            self.loss_ce.avg(),
            self.loss_tri.val(),
            self.loss_tri.avg(),
            self.precision.val() * 100.0,
            self.precision.avg() * 100.0,
        )
    }

    pub fn summary(&self, epoch: usize, iterations: usize) -> EpochSummary {
        EpochSummary {
            epoch,
            iterations,
            loss_ce: self.loss_ce.avg(),
            loss_tri: self.loss_tri.avg(),
            precision: self.precision.avg(),
            batch_time: self.batch_time.avg(),
            data_time: self.data_time.avg(),
        }
    }
}

/// Averages of one `train` call
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EpochSummary {
    pub epoch: usize,
    pub iterations: usize,
    pub loss_ce: f64,
    pub loss_tri: f64,
    pub precision: f64,
    pub batch_time: f64,
    pub data_time: f64,
}
