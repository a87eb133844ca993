use std::fmt;
use std::sync::{Arc, OnceLock};

use tokio::sync::watch;

use super::result::AckResult;
use crate::utils::error::PublishError;

/// Single-assignment result of an asynchronous publish.
///
/// Clones share the same cell. The first `set_result`/`set_error` wins and
/// every reader observes that outcome; later calls are no-ops.
#[derive(Clone)]
pub struct PublishFuture {
    inner: Arc<Inner>,
}

struct Inner {
    outcome: OnceLock<Result<AckResult, PublishError>>,
    done: watch::Sender<bool>,
}

impl PublishFuture {
    pub fn new() -> Self {
        let (done, _) = watch::channel(false);
        Self {
            inner: Arc::new(Inner {
                outcome: OnceLock::new(),
                done,
            }),
        }
    }

    /// Returns `true` if this call resolved the future.
    pub fn set_result(&self, result: AckResult) -> bool {
        self.resolve(Ok(result))
    }

    /// Returns `true` if this call resolved the future.
    pub fn set_error(&self, err: PublishError) -> bool {
        self.resolve(Err(err))
    }

    fn resolve(&self, outcome: Result<AckResult, PublishError>) -> bool {
        if self.inner.outcome.set(outcome).is_err() {
            return false;
        }
        self.inner.done.send_replace(true);
        true
    }

    pub fn is_done(&self) -> bool {
        self.inner.outcome.get().is_some()
    }

    /// The outcome, if resolved.
    pub fn result(&self) -> Option<Result<AckResult, PublishError>> {
        self.inner.outcome.get().cloned()
    }

    pub fn err(&self) -> Option<PublishError> {
        match self.inner.outcome.get() {
            Some(Err(e)) => Some(e.clone()),
            _ => None,
        }
    }

    /// Fail with `Cancelled` unless already resolved.
    pub fn cancel(&self) -> bool {
        self.set_error(PublishError::Cancelled)
    }

    /// Waits for the outcome.
    pub async fn wait(&self) -> Result<AckResult, PublishError> {
        let mut done = self.inner.done.subscribe();
        // the sender lives in `inner`, so `wait_for` cannot see a closed channel
        let _ = done.wait_for(|d| *d).await;
        self.inner
            .outcome
            .get()
            .cloned()
            .unwrap_or(Err(PublishError::Closed))
    }
}

impl Default for PublishFuture {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for PublishFuture {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PublishFuture")
            .field("outcome", &self.inner.outcome.get())
            .finish()
    }
}
