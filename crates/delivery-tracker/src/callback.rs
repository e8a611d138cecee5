//! Retry callback contract.
//!
//! A retry callback re-attempts delivery of one event. The tracker invokes it
//! from a retry task after the backoff delay and records the outcome on the
//! event.

use crate::event::EventPayload;
use async_trait::async_trait;
use std::future::Future;
use std::marker::PhantomData;

/// Result of one retry attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryOutcome {
    /// The event was handed to the transport again.
    Delivered,
    /// The attempt failed; the reason lands in the event's `retry_errors`.
    Failed(String),
}

impl RetryOutcome {
    pub fn is_delivered(&self) -> bool {
        matches!(self, Self::Delivered)
    }
}

impl From<bool> for RetryOutcome {
    fn from(delivered: bool) -> Self {
        if delivered {
            Self::Delivered
        } else {
            Self::Failed("retry callback reported failure".to_string())
        }
    }
}

/// Re-delivers a tracked event.
#[async_trait]
pub trait RetryCallback: Send + Sync {
    async fn retry(&self, event_id: &str, event_type: &str, payload: &EventPayload)
        -> RetryOutcome;
}

/// Adapter turning an async closure into a [`RetryCallback`].
pub struct FnRetryCallback<F, Fut> {
    f: F,
    _marker: PhantomData<fn() -> Fut>,
}

/// Wrap `f(event_id, event_type, payload)` as a retry callback.
///
/// ```ignore
/// let callback = retry_fn(|event_id, _event_type, _payload| async move {
///     resend(&event_id).await.into()
/// });
/// ```
pub fn retry_fn<F, Fut>(f: F) -> FnRetryCallback<F, Fut>
where
    F: Fn(String, String, EventPayload) -> Fut + Send + Sync,
    Fut: Future<Output = RetryOutcome> + Send,
{
    FnRetryCallback {
        f,
        _marker: PhantomData,
    }
}

#[async_trait]
impl<F, Fut> RetryCallback for FnRetryCallback<F, Fut>
where
    F: Fn(String, String, EventPayload) -> Fut + Send + Sync,
    Fut: Future<Output = RetryOutcome> + Send,
{
    async fn retry(
        &self,
        event_id: &str,
        event_type: &str,
        payload: &EventPayload,
    ) -> RetryOutcome {
        (self.f)(
            event_id.to_string(),
            event_type.to_string(),
            payload.clone(),
        )
        .await
    }
}
