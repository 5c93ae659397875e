//! Retry/backoff engine.
//!
//! Pure functions only: given the attempt that just failed and the job's
//! policy, decide whether to retry and when.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// Shape of the delay curve.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum BackoffKind {
    /// Same delay before every retry.
    Fixed,
    /// `delay * 2^(attempt - 1)`.
    #[default]
    Exponential,
}

impl BackoffKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Fixed => "fixed",
            Self::Exponential => "exponential",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "fixed" => Some(Self::Fixed),
            "exponential" => Some(Self::Exponential),
            _ => None,
        }
    }
}

/// Backoff policy stored with each job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BackoffPolicy {
    pub kind: BackoffKind,
    #[serde(rename = "delay_ms", with = "duration_ms")]
    pub delay: Duration,
}

impl BackoffPolicy {
    pub fn fixed(delay: Duration) -> Self {
        Self {
            kind: BackoffKind::Fixed,
            delay,
        }
    }

    pub fn exponential(base: Duration) -> Self {
        Self {
            kind: BackoffKind::Exponential,
            delay: base,
        }
    }
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self::exponential(Duration::from_millis(2_000))
    }
}

const NANOS_PER_SEC: u128 = 1_000_000_000;

/// Delay before retrying after `attempt` (1-based, the attempt that just
/// failed). Attempt 0 is treated as 1. Exponential delays are exact up to
/// `Duration::MAX` and saturate there.
pub fn delay(attempt: u32, policy: &BackoffPolicy) -> Duration {
    match policy.kind {
        BackoffKind::Fixed => policy.delay,
        BackoffKind::Exponential if policy.delay.is_zero() => Duration::ZERO,
        BackoffKind::Exponential => 1_u128
            .checked_shl(attempt.saturating_sub(1))
            .and_then(|factor| policy.delay.as_nanos().checked_mul(factor))
            .and_then(|nanos| {
                let secs = u64::try_from(nanos / NANOS_PER_SEC).ok()?;
                Some(Duration::new(secs, (nanos % NANOS_PER_SEC) as u32))
            })
            .unwrap_or(Duration::MAX),
    }
}

/// Wall-clock time of the next attempt. Saturates instead of overflowing.
pub fn next_attempt_at(now: DateTime<Utc>, attempt: u32, policy: &BackoffPolicy) -> DateTime<Utc> {
    chrono::Duration::from_std(delay(attempt, policy))
        .ok()
        .and_then(|d| now.checked_add_signed(d))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

/// What to do with a job whose processor just failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    Retry {
        delay: Duration,
        at: DateTime<Utc>,
    },
    /// Attempts exhausted.
    DeadLetter,
}

impl RetryDecision {
    pub fn decide(
        attempts_made: u32,
        max_attempts: u32,
        policy: &BackoffPolicy,
        now: DateTime<Utc>,
    ) -> Self {
        if attempts_made >= max_attempts {
            return Self::DeadLetter;
        }
        Self::Retry {
            delay: delay(attempts_made, policy),
            at: next_attempt_at(now, attempts_made, policy),
        }
    }

    pub fn will_retry(&self) -> bool {
        matches!(self, Self::Retry { .. })
    }
}

mod duration_ms {
    use super::*;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        u64::deserialize(d).map(Duration::from_millis)
    }
}
