//! Retry classification for remote model calls. Only errors matching one of
//! the configured substrings are worth another attempt; everything else is
//! permanent.

use std::time::Duration;

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    /// Linear backoff: sleep `base_delay * attempt` between attempts.
    pub base_delay: Duration,
    pub retryable: Vec<String>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_secs(2),
            retryable: [
                "connection reset",
                "connection refused",
                "timeout",
                "timed out",
                "eof",
                "broken pipe",
                "http2",
                "stream error",
                "502",
                "503",
                "504",
            ]
            .iter()
            .map(|s| s.to_string())
            .collect(),
        }
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, base_delay: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            base_delay,
            ..Default::default()
        }
    }

    pub fn is_transient(&self, error_text: &str) -> bool {
        let lower = error_text.to_ascii_lowercase();
        self.retryable.iter().any(|pat| lower.contains(pat))
    }

    pub fn delay_for(&self, attempt: u32) -> Duration {
        self.base_delay * attempt.max(1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_transient_errors() {
        let policy = RetryPolicy::default();
        assert!(policy.is_transient("error sending request: Connection reset by peer"));
        assert!(policy.is_transient("operation timed out"));
        assert!(policy.is_transient("unexpected EOF during chunk"));
        assert!(policy.is_transient("http2 error: stream error received"));
        assert!(policy.is_transient("upstream returned 503"));
        assert!(!policy.is_transient("model api 401: invalid api key"));
        assert!(!policy.is_transient("model api 400: bad request"));
    }

    #[test]
    fn linear_backoff() {
        let policy = RetryPolicy::new(3, Duration::from_millis(100));
        assert_eq!(policy.delay_for(1), Duration::from_millis(100));
        assert_eq!(policy.delay_for(2), Duration::from_millis(200));
        assert_eq!(policy.delay_for(3), Duration::from_millis(300));
    }
}
