//! Deadline and cancellation policy for component handlers.

use crate::status::{ErrorKind, ForestError};
use std::future::Future;
use std::time::Duration;

/// Budget for one handler invocation; an overrun cancels the handler's
/// context and leaves the message for redelivery.
pub(crate) const DEFAULT_HANDLER_DEADLINE: Duration = Duration::from_secs(10);

/// Deadline on outbound HTTP calls.
pub(crate) const DEFAULT_HTTP_DEADLINE: Duration = Duration::from_secs(5);

/// Deadline on LLM asks.
pub(crate) const DEFAULT_ASK_DEADLINE: Duration = Duration::from_secs(30);

/// Runs a handler future under `deadline`. Overruns surface as
/// [`ErrorKind::Cancelled`] so callers can no-ack for retry.
pub(crate) async fn run_with_deadline<F, T>(
    component: &str,
    deadline: Duration,
    future: F,
) -> Result<T, ForestError>
where
    F: Future<Output = T>,
{
    tokio::time::timeout(deadline, future)
        .await
        .map_err(|_| {
            ForestError::fail_with_kind(
                ErrorKind::Cancelled,
                format!("handler in {component:?} exceeded {deadline:?}"),
            )
        })
}

#[cfg(test)]
mod tests {
    use super::run_with_deadline;
    use crate::status::ErrorKind;
    use std::time::Duration;

    #[tokio::test]
    async fn fast_handlers_complete() {
        let result = run_with_deadline("t", Duration::from_secs(1), async { 7 }).await;
        assert_eq!(result.unwrap(), 7);
    }

    #[tokio::test]
    async fn overruns_are_cancelled() {
        let result = run_with_deadline("t", Duration::from_millis(20), async {
            tokio::time::sleep(Duration::from_secs(5)).await;
        })
        .await;
        assert_eq!(result.unwrap_err().kind(), ErrorKind::Cancelled);
    }
}
