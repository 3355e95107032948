//! Async utilities shared by the ES Guard monitor.
//!
//! Provides the `OrCancelExt` trait for making futures cancellable
//! with tokio's `CancellationToken`, and [`KeyedTimers`], a set of
//! replaceable one-shot timers addressed by key.

mod keyed_timers;

use async_trait::async_trait;
use std::future::Future;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

pub use keyed_timers::KeyedTimers;

/// Error returned when a future is cancelled.
#[derive(Debug, PartialEq, Eq)]
pub enum CancelErr {
    Cancelled,
}

/// Extension trait for making futures cancellable.
///
/// Allows any future to race against a `CancellationToken`, returning
/// `Err(CancelErr::Cancelled)` if the token is cancelled before the
/// future completes.
#[async_trait]
pub trait OrCancelExt: Sized {
    type Output;

    /// Race this future against the cancellation token.
    ///
    /// Returns `Ok(output)` if the future completes first, or
    /// `Err(CancelErr::Cancelled)` if the token is cancelled.
    async fn or_cancel(self, token: &CancellationToken) -> Result<Self::Output, CancelErr>;
}

#[async_trait]
impl<F> OrCancelExt for F
where
    F: Future + Send,
    F::Output: Send,
{
    type Output = F::Output;

    async fn or_cancel(self, token: &CancellationToken) -> Result<Self::Output, CancelErr> {
        tokio::select! {
            _ = token.cancelled() => Err(CancelErr::Cancelled),
            res = self => Ok(res),
        }
    }
}

/// Sleep for `delay` unless `token` is cancelled first.
///
/// Returns `true` when the full delay elapsed.
pub async fn sleep_or_cancel(delay: Duration, token: &CancellationToken) -> bool {
    tokio::time::sleep(delay).or_cancel(token).await.is_ok()
}
