/// Utility functions and helpers for the polling loop
///
/// This module contains timing and metrics for controller ticks, hex
/// formatting helpers and small validation functions.

use std::time::{Duration, Instant};
use log::{debug, warn};
use crate::error::{PlugwiseError, PlugwiseResult};

/// Timing of controller ticks
#[derive(Debug, Clone, Default)]
pub struct TickMetrics {
    pub total_ticks: u64,
    /// Ticks that ran past their period
    pub overruns: u64,
    pub total_duration: Duration,
    pub min_duration: Option<Duration>,
    pub max_duration: Option<Duration>,
    pub avg_duration: Duration,
}

impl TickMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one tick and whether it fit in its period
    pub fn record(&mut self, duration: Duration, period: Duration) {
        self.total_ticks += 1;
        self.total_duration += duration;
        if duration > period {
            self.overruns += 1;
        }

        self.min_duration = Some(
            self.min_duration.map_or(duration, |min| min.min(duration))
        );
        self.max_duration = Some(
            self.max_duration.map_or(duration, |max| max.max(duration))
        );
        self.avg_duration = self.total_duration / self.total_ticks as u32;
    }

    /// Share of ticks that fit in their period, as percentage
    pub fn on_time_rate(&self) -> f64 {
        if self.total_ticks == 0 {
            return 0.0;
        }
        ((self.total_ticks - self.overruns) as f64 / self.total_ticks as f64) * 100.0
    }

    pub fn reset(&mut self) {
        *self = Self::default();
    }
}

/// Timer for measuring operation duration
pub struct OperationTimer {
    start: Instant,
    operation_name: String,
}

impl OperationTimer {
    pub fn start(operation_name: &str) -> Self {
        Self {
            start: Instant::now(),
            operation_name: operation_name.to_string(),
        }
    }

    /// Stop the timer, warning when it ran past `budget`
    pub fn stop(self, budget: Duration) -> Duration {
        let duration = self.start.elapsed();
        if duration > budget {
            warn!("⏱️ {} took {:?}, budget {:?}", self.operation_name, duration, budget);
        } else {
            debug!("{} completed in {:?}", self.operation_name, duration);
        }
        duration
    }
}

/// Data validation utilities
pub mod validation {
    use super::*;

    /// Log intervals are sent as 16-bit minute counts
    pub fn validate_log_interval(minutes: u32) -> PlugwiseResult<u16> {
        match u16::try_from(minutes) {
            Ok(m) if m > 0 => Ok(m),
            _ => Err(PlugwiseError::value(format!(
                "log interval must be 1-65535 minutes, got {}",
                minutes
            ))),
        }
    }
}

/// Formatting and display utilities
pub mod format {
    use super::*;

    /// Format byte array as spaced hex
    pub fn bytes_to_hex(bytes: &[u8]) -> String {
        bytes.iter()
            .map(|b| format!("{:02X}", b))
            .collect::<Vec<_>>()
            .join(" ")
    }

    /// Parse hex text, ignoring whitespace
    pub fn hex_to_bytes(text: &str) -> PlugwiseResult<Vec<u8>> {
        let compact: String = text.chars().filter(|c| !c.is_whitespace()).collect();
        hex::decode(compact).map_err(|e| PlugwiseError::protocol(format!("invalid hex: {}", e)))
    }

    /// Format duration in a human-readable way
    pub fn format_duration(duration: Duration) -> String {
        let millis = duration.as_millis();
        if millis < 1000 {
            format!("{}ms", millis)
        } else if millis < 60_000 {
            format!("{:.2}s", duration.as_secs_f64())
        } else {
            let mins = millis / 60_000;
            let secs = (millis % 60_000) as f64 / 1000.0;
            format!("{}m {:.1}s", mins, secs)
        }
    }

    /// Format tick metrics as a table
    pub fn format_metrics(metrics: &TickMetrics) -> String {
        format!(
            "Tick Metrics:\n\
             ├─ Ticks: {}\n\
             ├─ On time: {:.1}%\n\
             ├─ Overruns: {}\n\
             ├─ Average Duration: {}\n\
             ├─ Min Duration: {}\n\
             └─ Max Duration: {}",
            metrics.total_ticks,
            metrics.on_time_rate(),
            metrics.overruns,
            format_duration(metrics.avg_duration),
            metrics.min_duration.map_or("N/A".to_string(), format_duration),
            metrics.max_duration.map_or("N/A".to_string(), format_duration),
        )
    }
}

/// Logging utilities
pub mod logging {
    /// Initialize simple logger for testing
    pub fn init_test_logger() {
        let _ = env_logger::builder()
            .filter_level(log::LevelFilter::Debug)
            .is_test(true)
            .try_init();
    }
}
