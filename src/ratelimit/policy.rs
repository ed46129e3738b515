//! Rate policies and their textual `"<quota>/<period>"` form.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use crate::error::{Result, ThrottleError};

/// Canonical period units accepted in a rate string.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TimeWindow {
    /// Per-second rate limiting
    Second,
    /// Per-minute rate limiting
    Minute,
    /// Per-hour rate limiting
    Hour,
    /// Per-day rate limiting
    Day,
}

impl TimeWindow {
    /// Get the duration of this time window.
    pub fn duration(&self) -> Duration {
        match self {
            TimeWindow::Second => Duration::from_secs(1),
            TimeWindow::Minute => Duration::from_secs(60),
            TimeWindow::Hour => Duration::from_secs(3600),
            TimeWindow::Day => Duration::from_secs(86400),
        }
    }

    /// Resolve a period such as `"m"`, `"min"` or `"day"`.
    ///
    /// Only the first character is significant, so `"minute"` and `"m"` are
    /// the same unit.
    pub fn from_period(period: &str) -> Option<Self> {
        match period.chars().next()? {
            's' => Some(TimeWindow::Second),
            'm' => Some(TimeWindow::Minute),
            'h' => Some(TimeWindow::Hour),
            'd' => Some(TimeWindow::Day),
            _ => None,
        }
    }

    /// Short suffix used when rendering a policy.
    pub fn suffix(&self) -> &'static str {
        match self {
            TimeWindow::Second => "s",
            TimeWindow::Minute => "m",
            TimeWindow::Hour => "h",
            TimeWindow::Day => "d",
        }
    }
}

/// An immutable, validated rate: at most `quota` admissions per sliding `window`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RatePolicy {
    quota: u32,
    window: Duration,
}

impl RatePolicy {
    /// Create a policy, rejecting a zero quota or an empty window.
    pub fn new(quota: u32, window: Duration) -> Result<Self> {
        if quota == 0 {
            return Err(ThrottleError::InvalidConfiguration(
                "quota must be greater than zero".to_string(),
            ));
        }
        if window.is_zero() {
            return Err(ThrottleError::InvalidConfiguration(
                "window must be greater than zero".to_string(),
            ));
        }
        Ok(Self { quota, window })
    }

    /// Create a policy over one of the canonical windows.
    pub fn per(quota: u32, window: TimeWindow) -> Result<Self> {
        Self::new(quota, window.duration())
    }

    /// Create a policy from a window expressed in (possibly fractional) seconds.
    pub fn from_secs_f64(quota: u32, window_secs: f64) -> Result<Self> {
        if !window_secs.is_finite() || window_secs <= 0.0 {
            return Err(ThrottleError::InvalidConfiguration(format!(
                "window must be a positive number of seconds, got {}",
                window_secs
            )));
        }
        Self::new(quota, Duration::from_secs_f64(window_secs))
    }

    /// Maximum number of admitted requests per window.
    pub fn quota(&self) -> u32 {
        self.quota
    }

    /// Length of the sliding window.
    pub fn window(&self) -> Duration {
        self.window
    }

    /// Window length in seconds, the unit timestamps are expressed in.
    pub fn window_secs(&self) -> f64 {
        self.window.as_secs_f64()
    }
}

impl FromStr for RatePolicy {
    type Err = ThrottleError;

    /// Parse `"<quota>/<period>"`, e.g. `"10/m"` or `"1000/day"`.
    fn from_str(rate: &str) -> Result<Self> {
        let invalid = |reason: &str| {
            ThrottleError::InvalidConfiguration(format!("invalid rate '{}': {}", rate, reason))
        };

        let (num, period) = rate
            .trim()
            .split_once('/')
            .ok_or_else(|| invalid("expected '<quota>/<period>'"))?;

        let quota: i64 = num
            .trim()
            .parse()
            .map_err(|_| invalid("quota is not an integer"))?;
        if quota <= 0 {
            return Err(invalid("quota must be greater than zero"));
        }
        let quota = u32::try_from(quota).map_err(|_| invalid("quota is too large"))?;

        let window = TimeWindow::from_period(period.trim())
            .ok_or_else(|| invalid("period must start with one of s, m, h, d"))?;

        Self::per(quota, window)
    }
}

impl fmt::Display for RatePolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let canonical = [
            TimeWindow::Second,
            TimeWindow::Minute,
            TimeWindow::Hour,
            TimeWindow::Day,
        ]
        .into_iter()
        .find(|w| w.duration() == self.window);

        match canonical {
            Some(window) => write!(f, "{}/{}", self.quota, window.suffix()),
            None => write!(f, "{}/{}s", self.quota, self.window.as_secs_f64()),
        }
    }
}
