//! Error classification and the retry decision table.
//!
//! Two independent gates control when a polled item becomes eligible again:
//! `next_retry_at` consumes an attempt, `skip_until` does not. Skip-until is
//! the back-pressure mechanism for external-service outages, so a single
//! dependency being down cannot exhaust the fleet's retry budgets.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Classified error kinds recognised by the retry policy.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// An upstream call timed out.
    NetworkTimeout,
    /// An upstream connection was refused.
    NetworkRefused,
    /// An upstream applied rate limiting.
    RateLimited,
    /// Cached credentials were rejected; a refresh should fix it.
    AuthStale,
    /// A referenced resource (release, torrent, job) no longer exists.
    NotFound,
    /// An upstream reported a temporary outage.
    ServiceUnavailable,
    /// Download or encode progress stopped advancing.
    Stalled,
    /// The local disk is full.
    DiskFull,
    /// No encoder is currently available in the pool.
    EncoderUnavailable,
    /// A produced artifact failed validation.
    Validation,
    /// Anything the classifier could not recognise.
    Unknown,
}

impl ErrorKind {
    /// Machine-friendly label recorded in error history and metrics.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::NetworkTimeout => "network_timeout",
            Self::NetworkRefused => "network_refused",
            Self::RateLimited => "rate_limited",
            Self::AuthStale => "auth_stale",
            Self::NotFound => "not_found",
            Self::ServiceUnavailable => "service_unavailable",
            Self::Stalled => "stalled",
            Self::DiskFull => "disk_full",
            Self::EncoderUnavailable => "encoder_unavailable",
            Self::Validation => "validation",
            Self::Unknown => "unknown",
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error raised by a stage worker and routed through the orchestrator.
#[derive(Debug, Clone)]
pub struct StageError {
    /// Classified kind; drives the retry decision.
    pub kind: ErrorKind,
    /// Human-readable message recorded in the item's error history.
    pub message: String,
    /// External service the error is attributable to, when the worker knows.
    /// A supplied tag biases the policy toward skip-until.
    pub service: Option<String>,
    /// Server-provided retry-after hint (rate limiting).
    pub retry_after: Option<Duration>,
}

impl StageError {
    /// Construct an error with an explicit kind.
    #[must_use]
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            service: None,
            retry_after: None,
        }
    }

    /// Construct an error attributable to a specific external service.
    #[must_use]
    pub fn for_service(
        kind: ErrorKind,
        message: impl Into<String>,
        service: impl Into<String>,
    ) -> Self {
        Self {
            kind,
            message: message.into(),
            service: Some(service.into()),
            retry_after: None,
        }
    }

    /// Classify an untyped error by the shape of its message.
    #[must_use]
    pub fn from_message(message: impl Into<String>) -> Self {
        let message = message.into();
        let kind = classify_message(&message);
        Self {
            kind,
            message,
            service: None,
            retry_after: None,
        }
    }

    /// Attach a server-provided retry-after hint.
    #[must_use]
    pub fn with_retry_after(mut self, delay: Duration) -> Self {
        self.retry_after = Some(delay);
        self
    }
}

impl std::fmt::Display for StageError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)
    }
}

impl std::error::Error for StageError {}

/// Derive an [`ErrorKind`] from the shape of an error message.
#[must_use]
pub fn classify_message(message: &str) -> ErrorKind {
    let lower = message.to_ascii_lowercase();
    if lower.contains("timed out") || lower.contains("timeout") {
        ErrorKind::NetworkTimeout
    } else if lower.contains("connection refused") || lower.contains("refused") {
        ErrorKind::NetworkRefused
    } else if lower.contains("429") || lower.contains("rate limit") || lower.contains("too many requests") {
        ErrorKind::RateLimited
    } else if lower.contains("401") || lower.contains("403") || lower.contains("unauthorized") || lower.contains("forbidden") {
        ErrorKind::AuthStale
    } else if lower.contains("no encoder") || lower.contains("encoder unavailable") {
        ErrorKind::EncoderUnavailable
    } else if lower.contains("503") || lower.contains("502") || lower.contains("unavailable") || lower.contains("bad gateway") {
        ErrorKind::ServiceUnavailable
    } else if lower.contains("404") || lower.contains("not found") {
        ErrorKind::NotFound
    } else if lower.contains("stall") {
        ErrorKind::Stalled
    } else if lower.contains("no space") || lower.contains("disk full") {
        ErrorKind::DiskFull
    } else if lower.contains("validation") {
        ErrorKind::Validation
    } else {
        ErrorKind::Unknown
    }
}

/// Outcome of a retry-policy decision.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryDecision {
    /// Whether the item should be retried at all.
    pub should_retry: bool,
    /// Retry via `skip_until` (no attempt consumed) instead of `next_retry_at`.
    pub use_skip_until: bool,
    /// Delay before the item becomes eligible again.
    pub delay: Duration,
    /// Human-readable rationale recorded in logs.
    pub reason: String,
}

impl RetryDecision {
    fn terminal(reason: impl Into<String>) -> Self {
        Self {
            should_retry: false,
            use_skip_until: false,
            delay: Duration::ZERO,
            reason: reason.into(),
        }
    }

    fn skip(delay: Duration, reason: impl Into<String>) -> Self {
        Self {
            should_retry: true,
            use_skip_until: true,
            delay,
            reason: reason.into(),
        }
    }

    fn retry(delay: Duration, reason: impl Into<String>) -> Self {
        Self {
            should_retry: true,
            use_skip_until: false,
            delay,
            reason: reason.into(),
        }
    }
}

/// Decision-table driven retry policy.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Base delay for network backoff (doubled per attempt).
    pub network_base: Duration,
    /// Cap applied to network and unknown backoff.
    pub network_cap: Duration,
    /// Skip delay for outages without a retry-after hint.
    pub outage_delay: Duration,
    /// Delay applied to stalled transfers and encodes.
    pub stall_delay: Duration,
    /// Base delay for not-found backoff (doubled per attempt).
    pub not_found_base: Duration,
    /// Cap applied to not-found backoff.
    pub not_found_cap: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            network_base: Duration::from_secs(60),
            network_cap: Duration::from_secs(60 * 60),
            outage_delay: Duration::from_secs(5 * 60),
            stall_delay: Duration::from_secs(30),
            not_found_base: Duration::from_secs(5 * 60),
            not_found_cap: Duration::from_secs(6 * 60 * 60),
        }
    }
}

impl RetryPolicy {
    /// Classify `error` against the decision table.
    ///
    /// `attempts` is the item's consumed-slot counter before this error;
    /// attempt-consuming paths turn terminal once the budget is exhausted.
    /// Skip-until paths never consume attempts and therefore ignore the cap.
    #[must_use]
    pub fn decide(&self, error: &StageError, attempts: u32, max_attempts: u32) -> RetryDecision {
        match error.kind {
            ErrorKind::DiskFull | ErrorKind::Validation => {
                RetryDecision::terminal(format!("{} is not retryable", error.kind))
            }
            ErrorKind::RateLimited => {
                let delay = error.retry_after.unwrap_or(self.outage_delay);
                RetryDecision::skip(delay, "rate limited; backing off without consuming attempts")
            }
            ErrorKind::ServiceUnavailable => RetryDecision::skip(
                self.outage_delay,
                "service outage; backing off without consuming attempts",
            ),
            ErrorKind::EncoderUnavailable => RetryDecision::skip(
                self.outage_delay,
                "no encoder available; backing off without consuming attempts",
            ),
            ErrorKind::NetworkTimeout | ErrorKind::NetworkRefused => {
                let delay = backoff(self.network_base, attempts, self.network_cap);
                if let Some(service) = &error.service {
                    RetryDecision::skip(delay, format!("{service} unreachable; skipping without attempt"))
                } else {
                    self.attempting(attempts, max_attempts, delay, "transient network failure")
                }
            }
            ErrorKind::AuthStale => self.attempting(
                attempts,
                max_attempts,
                Duration::ZERO,
                "stale credentials; immediate retry after auth refresh",
            ),
            ErrorKind::Stalled => {
                self.attempting(attempts, max_attempts, self.stall_delay, "progress stalled")
            }
            ErrorKind::NotFound => {
                let delay = backoff(self.not_found_base, attempts, self.not_found_cap);
                self.attempting(attempts, max_attempts, delay, "resource missing upstream")
            }
            ErrorKind::Unknown => {
                let delay = backoff(self.network_base, attempts, self.network_cap);
                self.attempting(attempts, max_attempts, delay, "unclassified failure")
            }
        }
    }

    fn attempting(
        &self,
        attempts: u32,
        max_attempts: u32,
        delay: Duration,
        reason: &str,
    ) -> RetryDecision {
        if attempts >= max_attempts {
            RetryDecision::terminal(format!("{reason}; retry budget exhausted"))
        } else {
            RetryDecision::retry(delay, reason)
        }
    }
}

/// Exponential backoff: `min(base * 2^attempts, cap)`.
#[must_use]
pub fn backoff(base: Duration, attempts: u32, cap: Duration) -> Duration {
    let factor = 1_u32.checked_shl(attempts.min(31)).unwrap_or(u32::MAX);
    base.checked_mul(factor).map_or(cap, |delay| delay.min(cap))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_and_caps() {
        let base = Duration::from_secs(60);
        let cap = Duration::from_secs(3_600);
        assert_eq!(backoff(base, 0, cap), Duration::from_secs(60));
        assert_eq!(backoff(base, 1, cap), Duration::from_secs(120));
        assert_eq!(backoff(base, 3, cap), Duration::from_secs(480));
        assert_eq!(backoff(base, 10, cap), cap);
        assert_eq!(backoff(base, 31, cap), cap);
    }

    #[test]
    fn service_tagged_network_errors_skip_without_attempt() {
        let policy = RetryPolicy::default();
        let error = StageError::for_service(ErrorKind::NetworkTimeout, "request timed out", "indexer");
        let decision = policy.decide(&error, 4, 5);
        assert!(decision.should_retry);
        assert!(decision.use_skip_until);
    }

    #[test]
    fn untagged_network_errors_consume_attempts() {
        let policy = RetryPolicy::default();
        let error = StageError::new(ErrorKind::NetworkTimeout, "request timed out");
        let decision = policy.decide(&error, 2, 5);
        assert!(decision.should_retry);
        assert!(!decision.use_skip_until);
        assert_eq!(decision.delay, Duration::from_secs(240));
    }

    #[test]
    fn exhausted_budget_turns_terminal() {
        let policy = RetryPolicy::default();
        let error = StageError::new(ErrorKind::Stalled, "download stalled for 10 minutes");
        let decision = policy.decide(&error, 5, 5);
        assert!(!decision.should_retry);
    }

    #[test]
    fn skip_paths_ignore_the_attempt_budget() {
        let policy = RetryPolicy::default();
        let error = StageError::for_service(
            ErrorKind::EncoderUnavailable,
            "no encoder available",
            "encoder",
        );
        let decision = policy.decide(&error, 99, 5);
        assert!(decision.should_retry);
        assert!(decision.use_skip_until);
        assert_eq!(decision.delay, Duration::from_secs(300));
    }

    #[test]
    fn rate_limit_honours_retry_after() {
        let policy = RetryPolicy::default();
        let error = StageError::new(ErrorKind::RateLimited, "429 too many requests")
            .with_retry_after(Duration::from_secs(17));
        let decision = policy.decide(&error, 0, 5);
        assert!(decision.use_skip_until);
        assert_eq!(decision.delay, Duration::from_secs(17));
    }

    #[test]
    fn disk_full_and_validation_are_terminal() {
        let policy = RetryPolicy::default();
        for kind in [ErrorKind::DiskFull, ErrorKind::Validation] {
            let decision = policy.decide(&StageError::new(kind, "boom"), 0, 5);
            assert!(!decision.should_retry, "{kind} must be terminal");
        }
    }

    #[test]
    fn auth_stale_retries_immediately() {
        let policy = RetryPolicy::default();
        let decision = policy.decide(&StageError::new(ErrorKind::AuthStale, "401"), 1, 5);
        assert!(decision.should_retry);
        assert!(!decision.use_skip_until);
        assert_eq!(decision.delay, Duration::ZERO);
    }

    #[test]
    fn message_classification_covers_common_shapes() {
        assert_eq!(classify_message("request timed out"), ErrorKind::NetworkTimeout);
        assert_eq!(classify_message("connection refused"), ErrorKind::NetworkRefused);
        assert_eq!(classify_message("HTTP 429 Too Many Requests"), ErrorKind::RateLimited);
        assert_eq!(classify_message("401 Unauthorized"), ErrorKind::AuthStale);
        assert_eq!(classify_message("503 Service Unavailable"), ErrorKind::ServiceUnavailable);
        assert_eq!(classify_message("release not found"), ErrorKind::NotFound);
        assert_eq!(classify_message("download stalled"), ErrorKind::Stalled);
        assert_eq!(classify_message("no space left on device"), ErrorKind::DiskFull);
        assert_eq!(classify_message("no encoder available"), ErrorKind::EncoderUnavailable);
        assert_eq!(classify_message("mysterious"), ErrorKind::Unknown);
    }
}
