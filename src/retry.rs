//! Bounded exponential backoff for network transport

use crate::error::{AutoCodesignError, Result};
use crate::log::Logger;
use std::future::Future;
use std::time::Duration;

pub const MAX_RETRY_ATTEMPTS: u32 = 3;
pub const RETRY_BASE_DELAY_MS: u64 = 1000;

/// Failure of a single attempt, tagged with whether another attempt may succeed.
#[derive(Debug)]
pub struct AttemptError {
    pub error: AutoCodesignError,
    pub retryable: bool,
}

impl AttemptError {
    pub fn transient(error: impl Into<AutoCodesignError>) -> Self {
        Self {
            error: error.into(),
            retryable: true,
        }
    }

    pub fn permanent(error: impl Into<AutoCodesignError>) -> Self {
        Self {
            error: error.into(),
            retryable: false,
        }
    }
}

impl From<reqwest::Error> for AttemptError {
    fn from(e: reqwest::Error) -> Self {
        Self {
            retryable: is_retryable(&e),
            error: AutoCodesignError::Http(e),
        }
    }
}

impl From<AutoCodesignError> for AttemptError {
    fn from(error: AutoCodesignError) -> Self {
        Self::permanent(error)
    }
}

/// Rate limiting and server-side failures are worth another attempt.
#[must_use]
pub fn is_transient_status(status: u16) -> bool {
    status == 429 || (500..600).contains(&status)
}

/// Timeouts, refused connections and transient statuses are worth another attempt.
#[must_use]
pub fn is_retryable(e: &reqwest::Error) -> bool {
    e.is_timeout() || e.is_connect() || e.status().is_some_and(|s| is_transient_status(s.as_u16()))
}

/// Runs `op` up to [`MAX_RETRY_ATTEMPTS`] times, doubling the delay between attempts.
pub async fn with_retry<T, F, Fut>(what: &str, logger: &Logger, mut op: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = std::result::Result<T, AttemptError>>,
{
    let mut last_error = None;

    for attempt in 1..=MAX_RETRY_ATTEMPTS {
        if attempt > 1 {
            let delay = RETRY_BASE_DELAY_MS * 2u64.pow(attempt - 2);
            logger.debug(format!(
                "Retry {attempt}/{MAX_RETRY_ATTEMPTS} of {what} after {delay}ms"
            ));
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }

        match op().await {
            Ok(value) => return Ok(value),
            Err(e) if e.retryable => {
                logger.warn(format!("Transient error during {what}: {}", e.error));
                last_error = Some(e.error);
            }
            Err(e) => return Err(e.error),
        }
    }

    Err(last_error.unwrap_or_else(|| {
        AutoCodesignError::PortalOperation(format!(
            "{what} failed after {MAX_RETRY_ATTEMPTS} attempts"
        ))
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test(start_paused = true)]
    async fn transient_failures_are_retried() {
        let calls = &AtomicU32::new(0);
        let value = with_retry("lookup", &Logger::default(), || async move {
            if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                Err(AttemptError::transient(AutoCodesignError::PortalOperation(
                    "HTTP 503".to_string(),
                )))
            } else {
                Ok(7)
            }
        })
        .await
        .unwrap();
        assert_eq!(value, 7);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_retries_surface_the_last_error() {
        let calls = &AtomicU32::new(0);
        let err = with_retry::<(), _, _>("lookup", &Logger::default(), || async move {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(AttemptError::transient(AutoCodesignError::PortalOperation(
                "HTTP 500".to_string(),
            )))
        })
        .await
        .unwrap_err();
        assert!(err.to_string().contains("HTTP 500"));
        assert_eq!(calls.load(Ordering::SeqCst), MAX_RETRY_ATTEMPTS);
    }

    #[tokio::test]
    async fn permanent_failures_are_not_retried() {
        let calls = &AtomicU32::new(0);
        let result = with_retry::<(), _, _>("create", &Logger::default(), || async move {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(AttemptError::permanent(AutoCodesignError::PortalOperation(
                "HTTP 409".to_string(),
            )))
        })
        .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn transient_statuses() {
        assert!(is_transient_status(429));
        assert!(is_transient_status(503));
        assert!(!is_transient_status(404));
    }
}
