//! Retry with exponential backoff.
//!
//! The executor separates failures that are worth retrying (network hiccups,
//! timeouts) from permanent ones (bad input, size limits), so that permanent
//! failures don't burn the attempt budget and the user's time.
//!
//! Errors are classified via [`ClassifyError`] first. Only when the error has
//! no structured category (e.g. free-form stderr of an external program),
//! its [`ClassifyError::retry_message`] is matched against
//! [`RetryPolicy::retryable_errors`].

use crate::observability::metrics::RETRY_ATTEMPTS_TOTAL;
use crate::prelude::*;
use lazy_regex::Regex;
use std::future::Future;
use std::time::Duration;

/// Substrings that signal a transient network-level failure
const DEFAULT_RETRYABLE_SUBSTRINGS: &[&str] = &[
    "Network request",
    "ETIMEDOUT",
    "ECONNRESET",
    "ECONNREFUSED",
    "socket hang up",
    "getaddrinfo",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Transience {
    /// Retrying may help
    Transient,

    /// Retrying will never help
    Permanent,
}

pub(crate) trait ClassifyError: std::error::Error {
    /// Returns [`None`] if the error carries no structured information about
    /// its nature. In this case the error message is matched against the
    /// patterns of the retry policy.
    fn transience(&self) -> Option<Transience> {
        None
    }

    /// The text matched against the patterns when [`Self::transience`] is
    /// [`None`]. It must not include the input of the operation (URLs,
    /// paths), otherwise the input decides whether the error is retried.
    fn retry_message(&self) -> String {
        self.display_chain().to_string()
    }
}

#[derive(Debug, Clone)]
pub(crate) enum RetryPattern {
    Substring(String),
    Regex(Regex),
}

impl RetryPattern {
    pub(crate) fn substring(substring: impl Into<String>) -> Self {
        Self::Substring(substring.into())
    }

    pub(crate) fn is_match(&self, message: &str) -> bool {
        match self {
            Self::Substring(substring) => message.contains(substring.as_str()),
            Self::Regex(regex) => regex.is_match(message),
        }
    }
}

impl From<&str> for RetryPattern {
    fn from(substring: &str) -> Self {
        Self::substring(substring)
    }
}

impl From<Regex> for RetryPattern {
    fn from(regex: Regex) -> Self {
        Self::Regex(regex)
    }
}

#[derive(Debug, Clone)]
pub(crate) struct RetryPolicy {
    /// Human-readable name of the operation for logs and metrics
    pub(crate) name: &'static str,

    /// Total number of invocations of the operation, including the first one.
    /// Must be at least 1.
    pub(crate) max_attempts: u32,

    pub(crate) initial_delay: Duration,
    pub(crate) max_delay: Duration,

    /// Multiplier applied to the delay after each failed attempt. Must be > 1.
    pub(crate) backoff_factor: f64,

    pub(crate) retryable_errors: Vec<RetryPattern>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            name: "operation",
            max_attempts: 3,
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(10),
            backoff_factor: 2.0,
            retryable_errors: DEFAULT_RETRYABLE_SUBSTRINGS
                .iter()
                .copied()
                .map(RetryPattern::substring)
                .collect(),
        }
    }
}

impl RetryPolicy {
    pub(crate) fn named(name: &'static str) -> Self {
        Self {
            name,
            ..Default::default()
        }
    }

    pub(crate) fn max_attempts(mut self, max_attempts: u32) -> Self {
        assert_ne!(max_attempts, 0, "BUG: retry policy must allow at least one attempt");
        self.max_attempts = max_attempts;
        self
    }

    pub(crate) fn delays(mut self, initial: Duration, max: Duration) -> Self {
        assert!(
            initial <= max,
            "BUG: initial delay {initial:?} is greater than max delay {max:?}"
        );
        self.initial_delay = initial;
        self.max_delay = max;
        self
    }

    #[cfg(test)]
    pub(crate) fn backoff_factor(mut self, factor: f64) -> Self {
        assert!(factor > 1.0, "BUG: backoff factor must be > 1, got {factor}");
        self.backoff_factor = factor;
        self
    }

    /// Adds more patterns on top of the existing ones.
    pub(crate) fn retryable_errors(
        mut self,
        patterns: impl IntoIterator<Item = impl Into<RetryPattern>>,
    ) -> Self {
        self.retryable_errors
            .extend(patterns.into_iter().map(Into::into));
        self
    }

    pub(crate) fn is_retryable<E: ClassifyError>(&self, err: &E) -> bool {
        match err.transience() {
            Some(Transience::Transient) => true,
            Some(Transience::Permanent) => false,
            None => self.matches_message(&err.retry_message()),
        }
    }

    fn matches_message(&self, message: &str) -> bool {
        self.retryable_errors
            .iter()
            .any(|pattern| pattern.is_match(message))
    }

    fn next_delay(&self, delay: Duration) -> Duration {
        Duration::try_from_secs_f64(delay.as_secs_f64() * self.backoff_factor)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }
}

/// Invokes `operation` until it succeeds, fails with a non-retryable error,
/// or the attempts budget of the `policy` is exhausted. In the latter two
/// cases the last error is returned as is.
pub(crate) async fn with_retry<T, E, Fut>(
    policy: &RetryPolicy,
    mut operation: impl FnMut() -> Fut,
) -> Result<T, E>
where
    Fut: Future<Output = Result<T, E>>,
    E: ClassifyError + 'static,
{
    let mut delay = policy.initial_delay;
    let mut attempt = 1;

    loop {
        let err = match operation().await {
            Ok(output) => {
                if attempt > 1 {
                    info!(attempt, op = policy.name, "Operation succeeded after a retry");
                }
                return Ok(output);
            }
            Err(err) => err,
        };

        if !policy.is_retryable(&err) {
            if attempt > 1 {
                warn!(
                    attempt,
                    op = policy.name,
                    err = tracing_err(&err),
                    "Operation failed with a non-retryable error after a retry"
                );
            }
            return Err(err);
        }

        if attempt >= policy.max_attempts {
            warn!(
                attempt,
                op = policy.name,
                err = tracing_err(&err),
                "Giving up retrying the operation"
            );
            return Err(err);
        }

        warn!(
            attempt,
            op = policy.name,
            delay = tracing_duration(delay),
            err = tracing_err(&err),
            "Sleeping before the next attempt",
        );

        metrics::increment_counter!(RETRY_ATTEMPTS_TOTAL, "op" => policy.name);

        tokio::time::sleep(delay).await;

        delay = policy.next_delay(delay);
        attempt += 1;
    }
}

/// Classification of the errors from the OS. Some kinds are ambiguous, so
/// they get [`None`].
pub(crate) fn io_transience(err: &std::io::Error) -> Option<Transience> {
    use std::io::ErrorKind::*;
    match err.kind() {
        TimedOut | ConnectionReset | ConnectionRefused | ConnectionAborted | BrokenPipe
        | Interrupted | WouldBlock | UnexpectedEof => Some(Transience::Transient),
        NotFound | PermissionDenied | InvalidInput | InvalidData | AlreadyExists
        | Unsupported => Some(Transience::Permanent),
        _ => None,
    }
}

impl ClassifyError for teloxide::RequestError {
    fn transience(&self) -> Option<Transience> {
        use teloxide::RequestError::*;
        match self {
            Network(_) | RetryAfter(_) => Some(Transience::Transient),
            Io(err) => io_transience(err),
            _ => Some(Transience::Permanent),
        }
    }
}
