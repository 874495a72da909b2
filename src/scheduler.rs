//! Poll cadence
//!
//! Decides how long to wait before polling an account again. Accounts that
//! recently produced webmentions are polled often; quiet ones back off.

use std::time::Duration;

use chrono::{DateTime, Utc};
use rand::Rng;

use crate::config::PollingConfig;
use crate::data::AccountRecord;

/// A send within this window keeps the account on the fast interval
const RECENT_SEND_WINDOW_DAYS: i64 = 7;
/// A send within this window keeps the account on 10x the fast interval
const STALE_SEND_WINDOW_DAYS: i64 = 30;

/// Poll intervals for one deployment
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Cadence {
    pub fast: Duration,
    pub slow: Duration,
    /// Fast polling is guaranteed for this long after signup
    pub grace_period: Duration,
}

impl Default for Cadence {
    fn default() -> Self {
        Self::from(&PollingConfig::default())
    }
}

impl From<&PollingConfig> for Cadence {
    fn from(config: &PollingConfig) -> Self {
        Self {
            fast: Duration::from_secs(config.fast_interval_seconds),
            slow: Duration::from_secs(config.slow_interval_seconds),
            grace_period: Duration::from_secs(config.grace_period_seconds),
        }
    }
}

fn elapsed_within(since: DateTime<Utc>, now: DateTime<Utc>, window: chrono::Duration) -> bool {
    now - since < window
}

/// How long until `account` should be polled again, measured from `now`.
pub fn next_poll_due(account: &AccountRecord, now: DateTime<Utc>, cadence: &Cadence) -> Duration {
    let grace = chrono::Duration::seconds(cadence.grace_period.as_secs() as i64);
    if elapsed_within(account.created_at, now, grace) {
        return cadence.fast;
    }

    let Some(last_sent) = account.last_webmention_sent else {
        return cadence.slow;
    };
    if elapsed_within(last_sent, now, chrono::Duration::days(RECENT_SEND_WINDOW_DAYS)) {
        cadence.fast
    } else if elapsed_within(last_sent, now, chrono::Duration::days(STALE_SEND_WINDOW_DAYS)) {
        cadence.fast * 10
    } else {
        cadence.slow
    }
}

/// Scale `delay` by a uniform random factor within +/- `percent`.
///
/// Spreads polls for accounts that were created or last sent together.
pub fn with_jitter<R: Rng + ?Sized>(delay: Duration, percent: u8, rng: &mut R) -> Duration {
    if percent == 0 {
        return delay;
    }
    let spread = f64::from(percent.min(100)) / 100.0;
    let factor = rng.gen_range((1.0 - spread)..=(1.0 + spread));
    delay.mul_f64(factor)
}
