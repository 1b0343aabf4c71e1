//! Retry backoff curves.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Upper bound on any computed retry wait (one hour).
pub const MAX_BACKOFF_MS: u64 = 60 * 60 * 1000;

/// How the retry wait grows across attempts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Backoff {
    /// Same wait before every retry.
    #[default]
    Constant,
    /// Wait grows by the base amount with each attempt.
    Linear,
    /// Wait doubles with each attempt.
    Exponential,
}

impl Backoff {
    /// Wait before the next run, given the base wait and how many runs have
    /// already been attempted. Saturating, capped at [`MAX_BACKOFF_MS`].
    pub fn delay(&self, base_ms: u64, attempts: u32) -> Duration {
        let n = u64::from(attempts.max(1));
        let ms = match self {
            Backoff::Constant => base_ms,
            Backoff::Linear => base_ms.saturating_mul(n),
            Backoff::Exponential => {
                let shift = (n - 1).min(32) as u32;
                base_ms.saturating_mul(1u64 << shift)
            }
        };
        Duration::from_millis(ms.min(MAX_BACKOFF_MS))
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Backoff::Constant => "constant",
            Backoff::Linear => "linear",
            Backoff::Exponential => "exponential",
        }
    }
}

impl std::fmt::Display for Backoff {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn constant_ignores_attempts() {
        assert_eq!(Backoff::Constant.delay(500, 1), Duration::from_millis(500));
        assert_eq!(Backoff::Constant.delay(500, 9), Duration::from_millis(500));
    }

    #[test]
    fn linear_grows_by_base() {
        assert_eq!(Backoff::Linear.delay(200, 1), Duration::from_millis(200));
        assert_eq!(Backoff::Linear.delay(200, 3), Duration::from_millis(600));
    }

    #[test]
    fn exponential_doubles() {
        assert_eq!(
            Backoff::Exponential.delay(100, 1),
            Duration::from_millis(100)
        );
        assert_eq!(
            Backoff::Exponential.delay(100, 4),
            Duration::from_millis(800)
        );
    }

    #[test]
    fn all_curves_respect_the_cap() {
        for curve in [Backoff::Constant, Backoff::Linear, Backoff::Exponential] {
            let d = curve.delay(u64::MAX, 40);
            assert_eq!(d, Duration::from_millis(MAX_BACKOFF_MS));
        }
    }

    #[test]
    fn zero_attempts_treated_as_first() {
        assert_eq!(
            Backoff::Exponential.delay(100, 0),
            Duration::from_millis(100)
        );
    }
}
