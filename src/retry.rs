//! Backoff helpers shared by the discovery watcher reconnect loop (§4.5),
//! the election campaign jitter (§4.6), and `call_rpc`'s retry-on-`NOT_ACTIVE`
//! loop (§4.7).

use rand::Rng;
use std::time::Duration;

/// Bounded exponential backoff with full jitter, parameterized exactly as
/// §4.5 describes for the watch reconnect loop: `initial_delay`,
/// `multiplier`, `max_delay`, and an attempt counter the caller owns.
#[derive(Clone, Copy, Debug)]
pub struct BackoffPolicy {
    pub initial_delay: Duration,
    pub multiplier: f64,
    pub max_delay: Duration,
    pub max_attempts: Option<u32>,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_millis(100),
            multiplier: 2.0,
            max_delay: Duration::from_secs(30),
            max_attempts: None,
        }
    }
}

impl BackoffPolicy {
    /// The (unjittered) delay before `attempt` (0-indexed), capped at
    /// `max_delay`.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let factor = self.multiplier.powi(attempt as i32);
        let millis = (self.initial_delay.as_millis() as f64 * factor).min(self.max_delay.as_millis() as f64);
        Duration::from_millis(millis.max(0.0) as u64)
    }

    /// `delay_for_attempt` with full jitter: a uniformly random duration in
    /// `[0, delay_for_attempt(attempt)]`. Full jitter (as opposed to
    /// half-jitter or no jitter) avoids synchronized retry storms across
    /// every instance racing the same reconnect.
    pub fn jittered_delay_for_attempt(&self, attempt: u32) -> Duration {
        let cap = self.delay_for_attempt(attempt);
        if cap.is_zero() {
            return cap;
        }
        let millis = rand::thread_rng().gen_range(0..=cap.as_millis() as u64);
        Duration::from_millis(millis)
    }

    /// Whether `attempt` (0-indexed, about to be made) still fits within
    /// `max_attempts`.
    pub fn attempt_allowed(&self, attempt: u32) -> bool {
        match self.max_attempts {
            Some(max) => attempt < max,
            None => true,
        }
    }
}

/// Deterministic spread-window jitter used to de-synchronize campaign
/// attempts across instances of the same group (§4.6 step 2: "Sleep a small
/// randomized backoff (proportional to hash of instance_id modulo a spread
/// window)"). Unlike [`BackoffPolicy`], this is intentionally a pure
/// function of `instance_id` plus the spread window — not random — so the
/// same instance always lands in the same slot relative to its peers,
/// which is what actually breaks the thundering herd (every instance
/// picking an independent random delay does *not* guarantee spread; hashing
/// the stable instance id does).
pub fn campaign_jitter(instance_id: &str, spread: Duration) -> Duration {
    use std::collections::hash_map::DefaultHasher;
    use std::hash::{Hash, Hasher};

    let mut hasher = DefaultHasher::new();
    instance_id.hash(&mut hasher);
    let bucket = hasher.finish() % (spread.as_millis().max(1) as u64);
    Duration::from_millis(bucket)
}
