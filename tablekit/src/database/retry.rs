use rand::Rng;
use std::time::Duration;
use tokio::time::sleep;
use tracing::warn;

use crate::config::RetryConfig;
use crate::errors::{Code, Status, TableError};
use crate::metrics;

/// Codes that are safe to retry for idempotent operations.
pub const IDEMPOTENT_RETRY_CODES: [Code; 3] =
    [Code::DeadlineExceeded, Code::Unavailable, Code::Aborted];

/// Transient connection resets that the transport reports as `Internal`.
pub const RETRYABLE_INTERNAL_ERR_MSGS: [&str; 4] = [
    "stream terminated by RST_STREAM",
    "Received Rst stream",
    "RST_STREAM closed stream",
    "Received RST_STREAM",
];

pub fn is_idempotent_retry_code(code: Code) -> bool {
    IDEMPOTENT_RETRY_CODES.contains(&code)
}

/// Whether the client may retry `status` on its own, without server guidance.
pub fn is_retryable(status: &Status) -> bool {
    is_idempotent_retry_code(status.code())
        || (status.code() == Code::Internal
            && RETRYABLE_INTERNAL_ERR_MSGS
                .iter()
                .any(|msg| status.message().contains(msg)))
}

/// Exponential backoff with full jitter: each pause is drawn uniformly from
/// `[1ns, current]`, then `current` grows by `multiplier` up to `max`.
#[derive(Debug, Clone)]
pub struct Backoff {
    initial: Duration,
    max: Duration,
    multiplier: f64,
    current: Duration,
}

impl Backoff {
    pub fn new(initial: Duration, max: Duration, multiplier: f64) -> Self {
        Self {
            initial,
            max,
            multiplier,
            current: initial,
        }
    }

    pub fn current(&self) -> Duration {
        self.current
    }

    pub fn pause(&mut self) -> Duration {
        let ceiling = (self.current.as_nanos() as u64).max(1);
        let pause = Duration::from_nanos(rand::thread_rng().gen_range(1..=ceiling));
        let grown = (self.current.as_nanos() as f64 * self.multiplier) as u64;
        self.current = Duration::from_nanos(grown).min(self.max);
        pause
    }

    /// Start over from the initial delay.
    pub fn reset(&mut self) {
        self.current = self.initial;
    }
}

/// Per-call retry state. Create one per top-level operation.
#[derive(Debug, Clone)]
pub struct Retryer {
    backoff: Backoff,
    honor_retry_info: bool,
    was_last_delay_from_retry_info: bool,
    max_attempts: Option<u32>,
    attempts: u32,
}

impl Retryer {
    pub fn new(config: &RetryConfig) -> Self {
        Self {
            backoff: Backoff::new(
                config.initial_backoff(),
                config.max_backoff(),
                config.multiplier,
            ),
            honor_retry_info: config.honor_retry_info,
            was_last_delay_from_retry_info: false,
            max_attempts: config.max_attempts,
            attempts: 0,
        }
    }

    /// Record a failed attempt and decide whether to try again.
    ///
    /// Returns the delay before the next attempt, or `None` to give up.
    pub fn retry(&mut self, status: &Status) -> Option<Duration> {
        self.attempts += 1;
        if let Some(max) = self.max_attempts {
            if self.attempts >= max {
                return None;
            }
        }

        if self.honor_retry_info {
            if let Some(delay) = status.retry_delay() {
                self.was_last_delay_from_retry_info = true;
                return Some(delay);
            }
            // Guidance stopped: don't resume a backoff that never ran.
            if self.was_last_delay_from_retry_info {
                self.backoff.reset();
            }
            self.was_last_delay_from_retry_info = false;
        }

        if is_retryable(status) {
            Some(self.backoff.pause())
        } else {
            None
        }
    }

    /// Failed attempts seen so far.
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn backoff(&self) -> &Backoff {
        &self.backoff
    }
}

/// Wait out the retry delay for `status`, or surface it as the call's error.
pub(crate) async fn backoff_or_fail(
    retryer: &mut Retryer,
    operation: &str,
    status: Status,
) -> Result<(), TableError> {
    match retryer.retry(&status) {
        Some(delay) => {
            warn!(
                "{} failed (attempt {}): {}, retrying in {:?}",
                operation,
                retryer.attempts(),
                status,
                delay
            );
            metrics::record_retry(operation);
            sleep(delay).await;
            Ok(())
        }
        None => Err(TableError::Status(status)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn retryer() -> Retryer {
        Retryer::new(&RetryConfig::default())
    }

    #[test]
    fn test_idempotent_codes_are_retried() {
        let mut r = retryer();
        for code in IDEMPOTENT_RETRY_CODES {
            let delay = r.retry(&Status::new(code, "transient")).unwrap();
            assert!(delay > Duration::ZERO);
        }
    }

    #[test]
    fn test_other_codes_are_not_retried() {
        let mut r = retryer();
        for code in [
            Code::InvalidArgument,
            Code::NotFound,
            Code::PermissionDenied,
            Code::FailedPrecondition,
            Code::Internal,
        ] {
            assert_eq!(r.retry(&Status::new(code, "boom")), None);
        }
    }

    #[test]
    fn test_rst_stream_internal_errors_are_retried() {
        let mut r = retryer();
        for msg in RETRYABLE_INTERNAL_ERR_MSGS {
            let status = Status::new(Code::Internal, format!("transport: {msg} with error 2"));
            assert!(r.retry(&status).is_some(), "{msg} should be retryable");
        }
        let status = Status::new(Code::Unknown, "stream terminated by RST_STREAM");
        assert_eq!(r.retry(&status), None);
    }

    #[test]
    fn test_backoff_pause_is_jittered_and_capped() {
        let mut b = Backoff::new(Duration::from_millis(100), Duration::from_millis(150), 2.0);
        let first = b.pause();
        assert!(first <= Duration::from_millis(100));
        assert_eq!(b.current(), Duration::from_millis(150));
        b.pause();
        assert_eq!(b.current(), Duration::from_millis(150));
        b.reset();
        assert_eq!(b.current(), Duration::from_millis(100));
    }

    #[test]
    fn test_server_retry_delay_is_used_verbatim() {
        let mut r = retryer();
        let status = Status::new(Code::ResourceExhausted, "slow down")
            .with_retry_delay(Duration::from_secs(3));
        assert_eq!(r.retry(&status), Some(Duration::from_secs(3)));
    }

    #[test]
    fn test_retry_info_ignored_when_disabled() {
        let config = RetryConfig {
            honor_retry_info: false,
            ..RetryConfig::default()
        };
        let mut r = Retryer::new(&config);
        let status = Status::new(Code::ResourceExhausted, "slow down")
            .with_retry_delay(Duration::from_secs(3));
        assert_eq!(r.retry(&status), None);
    }

    #[test]
    fn test_backoff_resets_when_server_guidance_stops() {
        let mut r = retryer();
        let unavailable = Status::new(Code::Unavailable, "unavailable");
        r.retry(&unavailable);
        r.retry(&unavailable);
        assert!(r.backoff().current() > Duration::from_millis(140));

        let guided = unavailable.clone().with_retry_delay(Duration::from_millis(500));
        assert_eq!(r.retry(&guided), Some(Duration::from_millis(500)));

        let pause = r.retry(&unavailable).unwrap();
        assert!(pause <= Duration::from_millis(100));
        let current = r.backoff().current();
        assert!(current >= Duration::from_millis(119) && current <= Duration::from_millis(121));
    }

    #[test]
    fn test_max_attempts_stops_retrying() {
        let config = RetryConfig {
            max_attempts: Some(3),
            ..RetryConfig::default()
        };
        let mut r = Retryer::new(&config);
        let status = Status::new(Code::Unavailable, "unavailable");
        assert!(r.retry(&status).is_some());
        assert!(r.retry(&status).is_some());
        assert_eq!(r.retry(&status), None);
        assert_eq!(r.attempts(), 3);
    }
}
