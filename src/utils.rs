//! Utility functions
//!
//! Common helper functions used throughout the project.

use std::time::{Duration, Instant};

use log::info;

use crate::errors::MarkDupError;

/// Format a duration into (minutes, seconds) tuple
///
/// Useful for printing elapsed time in human-readable format.
#[inline]
pub fn format_duration(dur: Duration) -> (u64, u64) {
    let secs = dur.as_secs();
    (secs / 60, secs % 60)
}

/// Format duration as a human-readable string
#[inline]
pub fn format_duration_verbose(dur: Duration) -> String {
    let secs = dur.as_secs();
    if secs >= 60 {
        format!("{} min {} sec", secs / 60, secs % 60)
    } else {
        format!("{:.1} sec", dur.as_secs_f64())
    }
}

/// Parse a byte size such as `512M`, `2G` or `1048576`.
///
/// Suffixes K, M and G (case-insensitive, optional trailing `B`) are powers
/// of 1024.
pub fn parse_memory_size(s: &str) -> Result<usize, MarkDupError> {
    let invalid = |reason: &str| MarkDupError::InvalidParameter {
        parameter: "max-memory".to_string(),
        reason: format!("'{s}': {reason}"),
    };

    let trimmed = s.trim();
    let upper = trimmed.to_ascii_uppercase();
    let upper = upper.strip_suffix('B').unwrap_or(&upper);
    let (digits, multiplier) = match upper.chars().last() {
        Some('K') => (&upper[..upper.len() - 1], 1usize << 10),
        Some('M') => (&upper[..upper.len() - 1], 1 << 20),
        Some('G') => (&upper[..upper.len() - 1], 1 << 30),
        _ => (upper, 1),
    };
    let value: usize = digits
        .trim()
        .parse()
        .map_err(|_| invalid("expected a number with an optional K/M/G suffix"))?;
    value
        .checked_mul(multiplier)
        .ok_or_else(|| invalid("too large"))
}

/// Logs a line every `interval` records with the running total and the
/// time since the logger was created.
pub struct ProgressLogger {
    noun: &'static str,
    verb: &'static str,
    interval: u64,
    count: u64,
    start: Instant,
}

impl ProgressLogger {
    pub fn new(noun: &'static str, verb: &'static str) -> Self {
        Self {
            noun,
            verb,
            interval: 1_000_000,
            count: 0,
            start: Instant::now(),
        }
    }

    pub fn with_interval(mut self, interval: u64) -> Self {
        self.interval = interval.max(1);
        self
    }

    /// Count one record; returns `true` when a progress line was logged.
    pub fn record(&mut self) -> bool {
        self.count += 1;
        if self.count.is_multiple_of(self.interval) {
            info!(
                "{} {} {} in {}",
                self.verb,
                self.count,
                self.noun,
                format_duration_verbose(self.start.elapsed())
            );
            true
        } else {
            false
        }
    }

    pub fn count(&self) -> u64 {
        self.count
    }

    pub fn log_final(&self) {
        info!(
            "{} {} {} in total ({})",
            self.verb,
            self.count,
            self.noun,
            format_duration_verbose(self.start.elapsed())
        );
    }
}
