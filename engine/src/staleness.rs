//! Age of cached reads, for display only.
//!
//! Staleness never invalidates anything: a days-old entry is still served.
//! The band is a coarse trust signal for the UI.

use crate::Timestamp;
use serde::{Deserialize, Serialize};

const MINUTE: u64 = 60 * 1000;
const HOUR: u64 = 60 * MINUTE;
const DAY: u64 = 24 * HOUR;

/// Upper bound (exclusive) of the `Fresh` band.
pub const FRESH_WINDOW_MS: u64 = 5 * MINUTE;

/// Coarse age band.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Freshness {
    /// Under five minutes old
    Fresh,
    /// Under an hour old
    Minutes,
    /// Under a day old
    Hours,
    /// A day or older
    Days,
}

impl Freshness {
    pub fn from_age(age_ms: u64) -> Self {
        match age_ms {
            a if a < FRESH_WINDOW_MS => Freshness::Fresh,
            a if a < HOUR => Freshness::Minutes,
            a if a < DAY => Freshness::Hours,
            _ => Freshness::Days,
        }
    }
}

impl std::fmt::Display for Freshness {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Freshness::Fresh => write!(f, "fresh"),
            Freshness::Minutes => write!(f, "minutes old"),
            Freshness::Hours => write!(f, "hours old"),
            Freshness::Days => write!(f, "days old"),
        }
    }
}

/// Age of a cached entry at a point in time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Staleness {
    pub age_ms: u64,
    pub band: Freshness,
}

impl Staleness {
    /// Age of something captured at `cached_at`, seen at `now`.
    ///
    /// A capture time in the future (clock skew) counts as age zero.
    pub fn between(cached_at: Timestamp, now: Timestamp) -> Self {
        let age_ms = now.saturating_sub(cached_at);
        Self {
            age_ms,
            band: Freshness::from_age(age_ms),
        }
    }

    /// Staleness of data that was just fetched.
    pub fn fresh() -> Self {
        Self::between(0, 0)
    }

    /// Human-readable age, e.g. "3 hours old".
    pub fn describe(&self) -> String {
        let (n, unit) = match self.band {
            Freshness::Fresh => return "just now".to_string(),
            Freshness::Minutes => (self.age_ms / MINUTE, "minute"),
            Freshness::Hours => (self.age_ms / HOUR, "hour"),
            Freshness::Days => (self.age_ms / DAY, "day"),
        };
        let plural = if n == 1 { "" } else { "s" };
        format!("{n} {unit}{plural} old")
    }
}
