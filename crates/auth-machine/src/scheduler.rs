//! Refresh decision and backoff policy.
//!
//! Everything here is pure and takes `now` explicitly so the timing rules
//! can be tested without sleeping.

use crate::context::SessionContext;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use std::time::Duration;

/// Refresh this many seconds before the access token expires.
pub const TOKEN_REFRESH_MARGIN_SECONDS: i64 = 300;
/// Give up retrying a failing refresh after this many attempts.
pub const REFRESH_TOKEN_MAX_ATTEMPTS: u32 = 5;
/// Base delay of the exponential backoff, in milliseconds.
pub const RETRY_BASE_DELAY_MS: u64 = 5_000;
/// Interval of the scheduler tick while signed in, in milliseconds.
pub const REFRESH_TICK_MS: u64 = 1_000;

/// Exponential backoff policy: `base * 2^(attempts - 1)`, bounded by a
/// maximum attempt count. One policy instance serves the bootstrap retry,
/// the scheduled-refresh retry, and the import retry delay.
#[derive(Debug, Clone, Copy)]
pub struct Backoff {
    base: Duration,
    max_attempts: u32,
}

impl Backoff {
    pub const fn new(base_ms: u64, max_attempts: u32) -> Self {
        Self {
            base: Duration::from_millis(base_ms),
            max_attempts,
        }
    }

    /// The standard policy shared by refresh and import retries.
    pub const fn standard() -> Self {
        Self::new(RETRY_BASE_DELAY_MS, REFRESH_TOKEN_MAX_ATTEMPTS)
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Delay to wait before attempt number `attempts + 1`, given `attempts`
    /// failures so far. The first retry waits the base delay.
    pub fn delay_for_attempt(&self, attempts: u32) -> Duration {
        let exponent = attempts.saturating_sub(1).min(16);
        self.base * 2u32.pow(exponent)
    }

    /// True once the attempt counter has passed the ceiling.
    pub fn exhausted(&self, attempts: u32) -> bool {
        attempts > self.max_attempts
    }

    /// True once the backoff delay for `attempts` failures has elapsed since
    /// `last_attempt`. Flips true at exactly the boundary.
    pub fn elapsed(&self, attempts: u32, last_attempt: DateTime<Utc>, now: DateTime<Utc>) -> bool {
        let delay = ChronoDuration::from_std(self.delay_for_attempt(attempts))
            .unwrap_or(ChronoDuration::MAX);
        now - last_attempt >= delay
    }
}

/// Decide whether the access token must be refreshed now.
///
/// Rules, in order:
/// 1. Without a known expiry there is nothing to decide on.
/// 2. After a failed attempt, backoff governs exclusively: stop entirely
///    once the attempt ceiling is passed, otherwise wait out the delay.
/// 3. An expiry already in the past (device slept) refreshes immediately.
/// 4. A caller-supplied refresh interval elapsed since the timer started.
/// 5. Remaining lifetime is inside the margin. The margin shrinks for
///    short-lived tokens so it never exceeds half the token's own lifetime.
pub fn should_refresh(
    ctx: &SessionContext,
    refresh_interval: Option<Duration>,
    now: DateTime<Utc>,
) -> bool {
    let expires_at = match ctx.access_token.expires_at {
        Some(expires_at) => expires_at,
        None => return false,
    };

    if let Some(last_attempt) = ctx.refresh_timer.last_attempt {
        let backoff = Backoff::standard();
        if backoff.exhausted(ctx.refresh_timer.attempts) {
            return false;
        }
        return backoff.elapsed(ctx.refresh_timer.attempts, last_attempt, now);
    }

    if expires_at <= now {
        return true;
    }

    if let (Some(interval), Some(started_at)) = (refresh_interval, ctx.refresh_timer.started_at) {
        let interval = ChronoDuration::from_std(interval).unwrap_or(ChronoDuration::MAX);
        if now - started_at >= interval {
            return true;
        }
    }

    let margin_seconds = match ctx.access_token.expires_in_seconds {
        Some(expires_in) => TOKEN_REFRESH_MARGIN_SECONDS.min(expires_in / 2),
        None => TOKEN_REFRESH_MARGIN_SECONDS,
    };
    expires_at - now <= ChronoDuration::seconds(margin_seconds)
}
