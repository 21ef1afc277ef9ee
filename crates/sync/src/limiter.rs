//! Per-key retry limiter used by worker tasks to back off failing
//! synchronizations.

use std::sync::Mutex;
use std::time::Duration;

use argus_core::ObjectKey;
use rustc_hash::FxHashMap;

/// Once a key exhausts its retries it is deprioritized, not dropped: the
/// delay is long enough to never fire in practice, but the item stays
/// retryable.
const DEPRIORITIZED: Duration = Duration::from_secs(1000 * 3600);

pub struct RetryLimiter {
    base_delay: Duration,
    max_retries: u32,
    counts: Mutex<FxHashMap<ObjectKey, u32>>,
}

impl RetryLimiter {
    pub fn new(base_delay: Duration, max_retries: u32) -> Self {
        Self { base_delay, max_retries, counts: Mutex::new(FxHashMap::default()) }
    }

    /// Record one more failure for the key and return how long to wait
    /// before retrying it.
    pub fn when(&self, key: &ObjectKey) -> Duration {
        let mut counts = self.counts.lock().unwrap();
        let n = counts.entry(key.clone()).or_insert(0);
        *n += 1;
        if *n > self.max_retries {
            DEPRIORITIZED
        } else {
            self.base_delay
        }
    }

    /// Reset the key's counter after a success.
    pub fn forget(&self, key: &ObjectKey) {
        self.counts.lock().unwrap().remove(key);
    }

    pub fn retries(&self, key: &ObjectKey) -> u32 {
        self.counts.lock().unwrap().get(key).copied().unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fixed_backoff_then_deprioritized() {
        let limiter = RetryLimiter::new(Duration::from_millis(100), 3);
        let key = ObjectKey::parse("default/x");
        for _ in 0..3 {
            assert_eq!(limiter.when(&key), Duration::from_millis(100));
        }
        // Fourth consecutive failure: effectively unbounded.
        assert_eq!(limiter.when(&key), DEPRIORITIZED);
        assert_eq!(limiter.retries(&key), 4);

        limiter.forget(&key);
        assert_eq!(limiter.retries(&key), 0);
        assert_eq!(limiter.when(&key), Duration::from_millis(100));
    }

    #[test]
    fn keys_are_independent() {
        let limiter = RetryLimiter::new(Duration::from_millis(50), 1);
        let a = ObjectKey::parse("ns/a");
        let b = ObjectKey::parse("ns/b");
        assert_eq!(limiter.when(&a), Duration::from_millis(50));
        assert_eq!(limiter.when(&a), DEPRIORITIZED);
        assert_eq!(limiter.when(&b), Duration::from_millis(50));
    }
}
