// crates/elspeth-orchestrator/src/retry.rs
// ============================================================================
// Module: ELSPETH Retry & Rate Limiting
// Description: Exponential backoff with jitter for capacity-limited calls,
//              and a token-bucket rate limiter for outbound external calls
//              (§5 "Cancellation & Timeouts", "Shared-Resource Policy").
// ============================================================================

use std::sync::Mutex;
use std::time::Duration;
use std::time::Instant;

use crate::config::RateLimitConfig;
use crate::config::RetryConfig;

/// Computes the delay before the `attempt`-th retry (0-indexed: the
/// first retry is `attempt == 0`), per `config`'s exponential backoff
/// with jitter (§5: "capacity errors... retryable with exponential
/// backoff and jitter").
///
/// The jitter source is a process-local atomic counter rather than a
/// `rand`-crate generator: the workspace has no dependency on one, and
/// retry jitter only needs to avoid synchronized retry storms, not
/// cryptographic unpredictability.
#[must_use]
pub fn backoff_delay(config: &RetryConfig, attempt: u32) -> Duration {
    let base_ms = config.initial_delay_ms as f64 * config.exponential_base.powi(attempt as i32);
    let capped_ms = base_ms.min(config.max_delay_ms as f64);
    let jitter_fraction = next_jitter_fraction();
    let jittered_ms = capped_ms * (1.0 - config.jitter + 2.0 * config.jitter * jitter_fraction);
    Duration::from_millis(jittered_ms.max(0.0).round() as u64)
}

/// Returns a value in `[0.0, 1.0)` derived from a process-local atomic
/// counter, used to jitter retry delays without pulling in a
/// dedicated randomness crate. Grounded on the same non-cryptographic,
/// std-only entropy idiom `elspeth-store-sqlite` uses for minting
/// internal ids.
fn next_jitter_fraction() -> f64 {
    use std::sync::atomic::AtomicU64;
    use std::sync::atomic::Ordering;
    static COUNTER: AtomicU64 = AtomicU64::new(0);
    let next = COUNTER.fetch_add(1, Ordering::Relaxed);
    // A multiplicative-congruential step decorrelates successive
    // counter values better than using `next` directly, which would
    // otherwise jitter every call in lockstep by a fixed increment.
    let scrambled = next.wrapping_mul(0x9E37_79B9_7F4A_7C15).wrapping_add(1);
    (scrambled >> 11) as f64 / (1u64 << 53) as f64
}

/// Whether a retryable error should still be retried given how long
/// the caller has already spent retrying (§5: "`max_capacity_retry_seconds`
/// bounds total retry time for a single capacity-limited call").
#[must_use]
pub fn within_retry_budget(config: &RetryConfig, elapsed: Duration) -> bool {
    elapsed.as_secs() < config.max_capacity_retry_seconds
}

/// A simple token-bucket limiter governing outbound external calls
/// (§5: "Rate limiter governs outbound external calls per service;
/// workers cooperatively back off rather than failing outright").
pub struct RateLimiter {
    config: RateLimitConfig,
    state: Mutex<BucketState>,
}

struct BucketState {
    tokens: f64,
    last_refill: Instant,
}

impl RateLimiter {
    /// Builds a limiter starting with a full burst allowance.
    #[must_use]
    pub fn new(config: RateLimitConfig) -> Self {
        let tokens = f64::from(config.burst);
        Self { config, state: Mutex::new(BucketState { tokens, last_refill: Instant::now() }) }
    }

    /// Attempts to take one token immediately. Returns `Some(Duration::ZERO)`
    /// if a token was available, or `Some(wait)` naming how long the
    /// caller should cooperatively sleep before its next attempt.
    pub fn try_acquire(&self) -> AcquireOutcome {
        let mut state = self.state.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        let now = Instant::now();
        let elapsed = now.duration_since(state.last_refill).as_secs_f64();
        state.tokens = (state.tokens + elapsed * self.config.requests_per_second).min(f64::from(self.config.burst));
        state.last_refill = now;

        if state.tokens >= 1.0 {
            state.tokens -= 1.0;
            AcquireOutcome::Acquired
        } else {
            let deficit = 1.0 - state.tokens;
            let wait_secs = deficit / self.config.requests_per_second.max(f64::MIN_POSITIVE);
            AcquireOutcome::Backoff(Duration::from_secs_f64(wait_secs))
        }
    }
}

/// Result of a non-blocking [`RateLimiter::try_acquire`] call.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum AcquireOutcome {
    /// A token was taken; the caller may proceed immediately.
    Acquired,
    /// No token was available; the caller should sleep for the given
    /// duration before retrying.
    Backoff(Duration),
}

#[cfg(test)]
#[allow(clippy::unwrap_used, reason = "Test-only panic-based assertions are permitted.")]
mod tests {
    use super::*;

    fn retry_config() -> RetryConfig {
        RetryConfig {
            initial_delay_ms: 100,
            max_delay_ms: 1_000,
            exponential_base: 2.0,
            jitter: 0.1,
            max_capacity_retry_seconds: 5,
        }
    }

    #[test]
    fn backoff_delay_grows_with_attempt_and_respects_cap() {
        let config = retry_config();
        let first = backoff_delay(&config, 0);
        let third = backoff_delay(&config, 3);
        assert!(first.as_millis() >= 90 && first.as_millis() <= 110);
        assert!(third.as_millis() <= 1_100);
    }

    #[test]
    fn within_retry_budget_respects_seconds_bound() {
        let config = retry_config();
        assert!(within_retry_budget(&config, Duration::from_secs(1)));
        assert!(!within_retry_budget(&config, Duration::from_secs(6)));
    }

    #[test]
    fn rate_limiter_exhausts_burst_then_backs_off() {
        let limiter = RateLimiter::new(RateLimitConfig { requests_per_second: 1.0, burst: 2 });
        assert_eq!(limiter.try_acquire(), AcquireOutcome::Acquired);
        assert_eq!(limiter.try_acquire(), AcquireOutcome::Acquired);
        match limiter.try_acquire() {
            AcquireOutcome::Backoff(_) => {}
            AcquireOutcome::Acquired => panic!("expected backoff after burst exhausted"),
        }
    }
}
