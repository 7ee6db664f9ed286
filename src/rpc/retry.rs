//! Capped exponential backoff with jitter.

use rand::Rng;
use std::time::Duration;

/// Delay before retry number `attempt` (0-based).
///
/// The base delay is `unit * 2^attempt`, capped at `cap`, and a random
/// fraction of it is subtracted so concurrent clients do not retry in
/// lockstep.
pub fn backoff(unit: Duration, cap: Duration, attempt: u32) -> Duration {
    let jitter: f64 = rand::thread_rng().gen_range(0.0..1.0);
    backoff_with_jitter(unit, cap, attempt, jitter)
}

/// Deterministic form of [`backoff`]. `jitter` is clamped to `[0, 1]`.
pub fn backoff_with_jitter(unit: Duration, cap: Duration, attempt: u32, jitter: f64) -> Duration {
    let factor = 1u32.checked_shl(attempt).unwrap_or(u32::MAX);
    let base = unit.saturating_mul(factor).min(cap);
    base.mul_f64(1.0 - jitter.clamp(0.0, 1.0))
}
