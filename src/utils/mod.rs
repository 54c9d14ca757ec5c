//! Utilities module for logging, metrics, and error handling
//!
//! This module provides:
//! - Structured logging with tracing
//! - Running-average meters for the progress line
//! - Top-k accuracy against (pseudo-)labels
//! - The crate error type

pub mod error;
pub mod logging;
pub mod meters;
pub mod metrics;

// Re-export main types for convenience
pub use error::{Result, UdaError};
pub use logging::init_logging;
pub use meters::{AverageMeter, EpochSummary, TrainMeters};
pub use metrics::{top1_accuracy, topk_accuracy};

/// Format a duration in a human-readable way
pub fn format_duration(seconds: f64) -> String {
    if seconds < 60.0 {
        format!("{:.1}s", seconds)
    } else if seconds < 3600.0 {
        let minutes = (seconds / 60.0).floor();
        let secs = seconds % 60.0;
        format!("{}m {:.0}s", minutes as u32, secs)
    } else {
        let hours = (seconds / 3600.0).floor();
        let minutes = ((seconds % 3600.0) / 60.0).floor();
        format!("{}h {}m", hours as u32, minutes as u32)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_duration() {
        assert_eq!(format_duration(30.5), "30.5s");
        assert_eq!(format_duration(90.0), "1m 30s");
        assert_eq!(format_duration(3661.0), "1h 1m");
    }
}
