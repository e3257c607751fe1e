//! AWS client plumbing
//!
//! Everything that touches the AWS SDK goes through this module's retry and
//! error-classification helpers. Provider error codes are mapped to a small
//! closed set of kinds at this boundary so the rest of the crate never
//! matches on exception-name strings.

pub mod credentials;
pub mod events;

use std::future::Future;
use std::time::Duration;

use aws_smithy_runtime_api::client::result::SdkError;
use aws_smithy_types::error::metadata::ProvideErrorMetadata;

/// Maximum retries for a throttled call
const RETRY_MAX_ATTEMPTS: u32 = 8;

/// Backoff cap
const RETRY_MAX_DELAY: Duration = Duration::from_secs(5);

/// Classified cloud error kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    AlreadyExists,
    AccessDenied,
    Throttled,
    NotFound,
    Other,
}

/// Maps a provider error code to a kind
pub fn classify_code(code: Option<&str>) -> ErrorKind {
    match code {
        Some(
            "EntityAlreadyExists"
            | "EntityAlreadyExistsException"
            | "ResourceConflictException"
            | "ResourceAlreadyExistsException"
            | "ConflictException",
        ) => ErrorKind::AlreadyExists,
        Some("AccessDenied" | "AccessDeniedException" | "UnauthorizedOperation") => {
            ErrorKind::AccessDenied
        }
        Some(
            "Throttling"
            | "ThrottlingException"
            | "TooManyRequestsException"
            | "RequestLimitExceeded"
            | "OperationAbortedException",
        ) => ErrorKind::Throttled,
        Some(
            "NoSuchEntity" | "NoSuchEntityException" | "ResourceNotFoundException" | "NotFound",
        ) => ErrorKind::NotFound,
        _ => ErrorKind::Other,
    }
}

/// Classifies an SDK error, treating transport-level failures as transient
pub fn classify<E, R>(err: &SdkError<E, R>) -> ErrorKind
where
    E: ProvideErrorMetadata,
{
    match err {
        SdkError::TimeoutError(_) | SdkError::DispatchFailure(_) => ErrorKind::Throttled,
        _ => classify_code(err.code()),
    }
}

/// Exponential backoff for the nth retry, capped
pub fn backoff_delay(attempt: u32) -> Duration {
    let millis = 100.0 * 1.5_f64.powi(attempt as i32);
    Duration::from_millis(millis as u64).min(RETRY_MAX_DELAY)
}

/// Runs a cloud call, retrying only throttled-class failures
///
/// Every attempt gets to run; there is no token bucket that could starve a
/// caller under contention. Non-transient errors return immediately.
pub async fn retry<T, E, R, F, Fut>(operation: &'static str, mut call: F) -> Result<T, SdkError<E, R>>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, SdkError<E, R>>>,
    E: ProvideErrorMetadata,
{
    let mut attempt = 0u32;
    loop {
        match call().await {
            Ok(value) => return Ok(value),
            Err(err) if classify(&err) == ErrorKind::Throttled && attempt < RETRY_MAX_ATTEMPTS => {
                attempt += 1;
                let delay = backoff_delay(attempt);
                tracing::debug!(
                    operation,
                    attempt,
                    code = ?err.code(),
                    "throttled, retrying in {:?}",
                    delay
                );
                tokio::time::sleep(delay).await;
            }
            Err(err) => return Err(err),
        }
    }
}

/// Polls `check` until it yields a value or the budget runs out
///
/// The bounded wait is how runner-creation races are resolved; a distributed
/// lock would be heavier than the contention warrants.
pub async fn poll_until<T, E, F, Fut>(
    budget: Duration,
    interval: Duration,
    mut check: F,
) -> Result<Option<T>, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<Option<T>, E>>,
{
    let deadline = tokio::time::Instant::now() + budget;
    loop {
        if let Some(value) = check().await? {
            return Ok(Some(value));
        }
        if tokio::time::Instant::now() + interval > deadline {
            return Ok(None);
        }
        tokio::time::sleep(interval).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use aws_sdk_iam::operation::create_role::CreateRoleError;

    #[test]
    fn test_classify_code() {
        assert_eq!(
            classify_code(Some("EntityAlreadyExists")),
            ErrorKind::AlreadyExists
        );
        assert_eq!(
            classify_code(Some("ResourceConflictException")),
            ErrorKind::AlreadyExists
        );
        assert_eq!(classify_code(Some("ThrottlingException")), ErrorKind::Throttled);
        assert_eq!(classify_code(Some("AccessDenied")), ErrorKind::AccessDenied);
        assert_eq!(classify_code(Some("NoSuchEntity")), ErrorKind::NotFound);
        assert_eq!(classify_code(Some("ValidationError")), ErrorKind::Other);
        assert_eq!(classify_code(None), ErrorKind::Other);
    }

    #[test]
    fn test_backoff_delay_caps() {
        assert!(backoff_delay(1) < backoff_delay(2));
        assert_eq!(backoff_delay(30), RETRY_MAX_DELAY);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_exhausts_attempts_on_transport_timeouts() {
        let mut calls = 0u32;
        let result: Result<(), _> = retry("test.op", || {
            calls += 1;
            async {
                Err(SdkError::<
                    CreateRoleError,
                    aws_smithy_runtime_api::client::orchestrator::HttpResponse,
                >::timeout_error("slow network"))
            }
        })
        .await;
        assert!(result.is_err());
        // transport timeouts are transient, so every attempt was used
        assert_eq!(calls, RETRY_MAX_ATTEMPTS + 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_poll_until_returns_first_value() {
        let mut calls = 0u32;
        let found = poll_until(Duration::from_secs(120), Duration::from_secs(5), || {
            calls += 1;
            let ready = calls == 3;
            async move { Ok::<_, sqlx::Error>(ready.then_some(42)) }
        })
        .await
        .unwrap();
        assert_eq!(found, Some(42));
        assert_eq!(calls, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_poll_until_exhausts_budget() {
        let mut calls = 0u32;
        let found = poll_until(Duration::from_secs(120), Duration::from_secs(5), || {
            calls += 1;
            async { Ok::<Option<u32>, sqlx::Error>(None) }
        })
        .await
        .unwrap();
        assert_eq!(found, None);
        // 120s budget at a 5s interval: the first check is free, then one
        // check per sleep until the next sleep would pass the deadline
        assert_eq!(calls, 25);
    }
}
