//! Cancellable one-shot timers feeding events back into the protocol
//! loop.

use std::future::Future;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

/// Handle to a scheduled one-shot. Dropping the handle does not cancel
/// the timer; only [`TimerHandle::cancel`] does.
#[derive(Debug)]
pub struct TimerHandle {
    token: CancellationToken,
}

impl TimerHandle {
    /// Run `on_fire` after `delay` unless cancelled first.
    pub fn spawn<F>(delay: Duration, on_fire: F) -> Self
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let token = CancellationToken::new();
        let fire = token.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = fire.cancelled() => {}
                _ = tokio::time::sleep(delay) => on_fire.await,
            }
        });
        Self { token }
    }

    /// Cancel the timer. Idempotent; a no-op once the timer has fired.
    pub fn cancel(&self) {
        self.token.cancel();
    }
}
