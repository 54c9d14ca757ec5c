//! Logging Module
//!
//! Structured logging through the `tracing` crate, plus a small phase logger
//! used by the training pipeline to report epoch boundaries.

use std::time::Instant;

use tracing::Level;
use tracing_subscriber::FmtSubscriber;

use super::error::{Result, UdaError};
use super::format_duration;

/// Logging configuration
#[derive(Debug, Clone)]
pub struct LogConfig {
    /// Minimum log level to display
    pub level: LogLevel,
    /// Whether to include target (module path)
    pub include_target: bool,
    /// Whether to include thread IDs
    pub include_thread_ids: bool,
    /// Whether to use ANSI colors
    pub ansi_colors: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: LogLevel::Info,
            include_target: false,
            include_thread_ids: false,
            ansi_colors: true,
        }
    }
}

impl LogConfig {
    /// Verbose logging for debugging
    pub fn verbose() -> Self {
        Self {
            level: LogLevel::Debug,
            include_target: true,
            include_thread_ids: true,
            ansi_colors: true,
        }
    }

    /// Errors only
    pub fn quiet() -> Self {
        Self {
            level: LogLevel::Error,
            include_target: false,
            include_thread_ids: false,
            ansi_colors: true,
        }
    }
}

/// Log level enum
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

impl LogLevel {
    /// Convert to tracing Level
    pub fn to_tracing_level(&self) -> Level {
        match self {
            LogLevel::Trace => Level::TRACE,
            LogLevel::Debug => Level::DEBUG,
            LogLevel::Info => Level::INFO,
            LogLevel::Warn => Level::WARN,
            LogLevel::Error => Level::ERROR,
        }
    }

    /// Parse a level name, falling back to `Info` for anything unknown
    pub fn parse(s: &str) -> Self {
        match s.to_lowercase().as_str() {
            "trace" => LogLevel::Trace,
            "debug" => LogLevel::Debug,
            "info" => LogLevel::Info,
            "warn" | "warning" => LogLevel::Warn,
            "error" => LogLevel::Error,
            _ => LogLevel::Info,
        }
    }
}

impl std::fmt::Display for LogLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LogLevel::Trace => write!(f, "TRACE"),
            LogLevel::Debug => write!(f, "DEBUG"),
            LogLevel::Info => write!(f, "INFO"),
            LogLevel::Warn => write!(f, "WARN"),
            LogLevel::Error => write!(f, "ERROR"),
        }
    }
}

/// Install the global tracing subscriber
pub fn init_logging(config: &LogConfig) -> Result<()> {
    let subscriber = FmtSubscriber::builder()
        .with_max_level(config.level.to_tracing_level())
        .with_ansi(config.ansi_colors)
        .with_target(config.include_target)
        .with_thread_ids(config.include_thread_ids)
        .compact()
        .finish();

    tracing::subscriber::set_global_default(subscriber)
        .map_err(|e| UdaError::Config(format!("Failed to initialize logging: {}", e)))?;

    Ok(())
}

/// Epoch-level progress for one training phase (warm-up or adaptation)
pub struct PhaseLogger {
    phase: String,
    epoch: usize,
    total_epochs: usize,
    epoch_start: Instant,
    phase_start: Instant,
}

impl PhaseLogger {
    pub fn new(phase: &str, total_epochs: usize) -> Self {
        Self {
            phase: phase.to_string(),
            epoch: 0,
            total_epochs,
            epoch_start: Instant::now(),
            phase_start: Instant::now(),
        }
    }

    /// Log start of an epoch
    pub fn start_epoch(&mut self, epoch: usize) {
        self.epoch = epoch;
        self.epoch_start = Instant::now();

        tracing::info!("[{}] epoch {}/{} started", self.phase, epoch + 1, self.total_epochs);
    }

    /// Log end of an epoch with its averaged losses and precision
    pub fn end_epoch(&self, loss_ce: f64, loss_tri: f64, precision: f64) {
        let epoch_time = self.epoch_start.elapsed().as_secs_f64();
        let elapsed = self.phase_start.elapsed().as_secs_f64();
        let remaining = self.total_epochs.saturating_sub(self.epoch + 1);
        let eta = remaining as f64 * elapsed / (self.epoch + 1) as f64;

        tracing::info!(
            "[{}] epoch {}/{} done in {} | Loss_ce {:.3} | Loss_tri {:.3} | Prec {:.2}% | ETA {}",
            self.phase,
            self.epoch + 1,
            self.total_epochs,
            format_duration(epoch_time),
            loss_ce,
            loss_tri,
            precision * 100.0,
            format_duration(eta)
        );
    }

    /// Log phase completion
    pub fn finish(&self) {
        tracing::info!(
            "[{}] finished {} epochs in {}",
            self.phase,
            self.total_epochs,
            format_duration(self.phase_start.elapsed().as_secs_f64())
        );
    }
}
