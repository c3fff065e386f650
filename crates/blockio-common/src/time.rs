//! Wall-clock timestamps in microseconds
//!
//! Timestamps are stored in atomics by the timeout scanner, so they are
//! plain `u64` microseconds rather than `Instant`s. Zero means "not set".

use std::time::Duration;

/// Current wall-clock time in microseconds since the Unix epoch
#[must_use]
pub fn now_usec() -> u64 {
    u64::try_from(chrono::Utc::now().timestamp_micros()).unwrap_or(0)
}

/// Microseconds elapsed since `since_usec`, saturating at zero
#[must_use]
pub fn elapsed_since(since_usec: u64) -> Duration {
    Duration::from_micros(now_usec().saturating_sub(since_usec))
}

/// Whether a timestamp taken at `since_usec` is older than `timeout`
#[must_use]
pub fn is_expired(since_usec: u64, timeout: Duration) -> bool {
    since_usec != 0 && elapsed_since(since_usec) > timeout
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_now_is_monotone_enough() {
        let a = now_usec();
        let b = now_usec();
        assert!(a > 0);
        assert!(b >= a);
    }

    #[test]
    fn test_expiry() {
        let now = now_usec();
        assert!(!is_expired(0, Duration::ZERO));
        assert!(!is_expired(now, Duration::from_secs(30)));
        assert!(is_expired(now - 31_000_000, Duration::from_secs(30)));
    }
}
