//! Task handles for event subscriptions and delayed work

use std::future::Future;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// A running event pump. The pump stops when the subscription is
/// unsubscribed or dropped.
pub struct Subscription {
    cancel_token: CancellationToken,
    handle: JoinHandle<()>,
}

impl Subscription {
    /// Spawns `pump`, handing it the token it must watch for cancellation
    pub fn spawn<F, Fut>(pump: F) -> Self
    where
        F: FnOnce(CancellationToken) -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let cancel_token = CancellationToken::new();
        let handle = tokio::spawn(pump(cancel_token.clone()));
        Self { cancel_token, handle }
    }

    pub fn unsubscribe(self) {
        self.cancel_token.cancel();
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.cancel_token.cancel();
    }
}

/// Runs a future once after a delay unless cancelled first
pub struct DelayedTask {
    cancel_token: CancellationToken,
}

impl DelayedTask {
    pub fn schedule<Fut>(delay: Duration, task: Fut) -> Self
    where
        Fut: Future<Output = ()> + Send + 'static,
    {
        let cancel_token = CancellationToken::new();
        let token_for_task = cancel_token.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = token_for_task.cancelled() => {}
                _ = tokio::time::sleep(delay) => task.await,
            }
        });
        Self { cancel_token }
    }

    pub fn cancel(self) {
        self.cancel_token.cancel();
    }
}

impl Drop for DelayedTask {
    fn drop(&mut self) {
        self.cancel_token.cancel();
    }
}
