//! Pacing and retry math.
//!
//! Pure functions of `(bytes, elapsed, limit)` and `(attempt, policy)` so the
//! arithmetic is unit-testable without touching a disk or a clock.

use std::time::Duration;

/// Upper bound on any retry delay.
const MAX_RETRY_DELAY_SECS: f64 = 10.0;

/// Retry policy for failed transfer attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RetryPolicy {
    /// `min(0.5 * 2^attempt, 10)` seconds
    #[default]
    Exponential,
    /// `min(1.0 * attempt, 10)` seconds
    Linear,
    /// Fail immediately
    None,
}

impl RetryPolicy {
    /// Canonical lowercase name.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Exponential => "exponential",
            Self::Linear => "linear",
            Self::None => "none",
        }
    }

    /// Parse a stored name; unknown values fall back to exponential.
    #[must_use]
    pub fn parse(value: &str) -> Self {
        match value {
            "linear" => Self::Linear,
            "none" => Self::None,
            _ => Self::Exponential,
        }
    }
}

impl std::fmt::Display for RetryPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Delay before retry number `attempt` (1-based).
#[must_use]
pub fn retry_delay(attempt: u32, policy: RetryPolicy) -> Duration {
    let seconds = match policy {
        RetryPolicy::Exponential => (0.5 * f64::from(attempt).exp2()).min(MAX_RETRY_DELAY_SECS),
        RetryPolicy::Linear => (1.0 * f64::from(attempt)).min(MAX_RETRY_DELAY_SECS),
        RetryPolicy::None => 0.0,
    };
    Duration::from_secs_f64(seconds)
}

/// How long a worker must sleep so that `bytes_copied` over `elapsed` stays
/// under `max_bandwidth` bytes/second. `None` when no pacing is needed.
#[must_use]
pub fn pacing_delay(
    bytes_copied: u64,
    elapsed: Duration,
    max_bandwidth: Option<u64>,
) -> Option<Duration> {
    let limit = max_bandwidth.filter(|l| *l > 0)?;
    let expected = bytes_copied as f64 / limit as f64;
    let actual = elapsed.as_secs_f64();
    if expected > actual {
        Some(Duration::from_secs_f64(expected - actual))
    } else {
        None
    }
}

/// Parse a bandwidth setting string into bytes/second.
///
/// `""` and `"unlimited"` mean no limit; otherwise the numeric prefix is
/// scaled by a `KB/s`, `MB/s`, or `GB/s` suffix. Unrecognized strings also
/// mean no limit.
#[must_use]
pub fn parse_bandwidth(value: &str) -> Option<u64> {
    if value.is_empty() || value == "unlimited" {
        return None;
    }
    let cleaned: String = value.chars().filter(|c| !c.is_whitespace()).collect();
    for (suffix, scale) in [
        ("KB/s", 1024u64),
        ("MB/s", 1024 * 1024),
        ("GB/s", 1024 * 1024 * 1024),
    ] {
        if let Some(number) = cleaned.strip_suffix(suffix) {
            let parsed: f64 = number.parse().ok()?;
            return Some((parsed * scale as f64) as u64);
        }
    }
    None
}
