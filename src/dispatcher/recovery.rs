use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use super::state::DispatcherState;
use crate::messaging::OrderedPublisher;
use crate::utils::backoff::ExponentialBackoff;
use crate::utils::error::{PublishError, WatcherError};
use crate::watcher::{EventSource, WatcherState};

#[derive(Debug, Default)]
struct Status {
    recovering: bool,
    last_failure: Option<DateTime<Utc>>,
    failures: u32,
}

/// Restores a dispatcher after a publish failure.
///
/// The first failure stops the event source, resets the publisher and
/// rewinds the dispatcher state to the last checkpoint, then restarts the
/// source in the background with exponential backoff. Failures reported
/// while a recovery is in progress are folded into it.
pub struct Recovery {
    name: String,
    publisher: Arc<OrderedPublisher>,
    source: Arc<dyn EventSource>,
    state: Arc<DispatcherState>,
    backoff: ExponentialBackoff,
    status: Mutex<Status>,
    cancel: Mutex<CancellationToken>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl Recovery {
    pub fn new(
        name: impl Into<String>,
        publisher: Arc<OrderedPublisher>,
        source: Arc<dyn EventSource>,
        state: Arc<DispatcherState>,
        backoff: ExponentialBackoff,
    ) -> Self {
        Self {
            name: name.into(),
            publisher,
            source,
            state,
            backoff,
            status: Mutex::new(Status::default()),
            cancel: Mutex::new(CancellationToken::new()),
            task: Mutex::new(None),
        }
    }

    pub async fn handle_error(self: &Arc<Self>, seq_num: u64, err: PublishError) {
        let failures = {
            let mut status = self.status.lock();
            if status.recovering {
                return;
            }
            status.recovering = true;
            status.failures += 1;
            status.last_failure = Some(Utc::now());
            status.failures
        };
        error!(
            dispatcher = %self.name,
            seq_num,
            failures,
            error = %err,
            "publish failed, starting recovery"
        );

        self.source.stop().await;
        self.publisher.reset().await;
        let checkpoint = match self.source.get_checkpoint() {
            Ok(checkpoint) => checkpoint,
            Err(e) => {
                warn!(dispatcher = %self.name, error = %e, "failed to read checkpoint, rewinding to the last known one");
                self.state.stats().last_checkpoint_seq_num
            }
        };
        self.state.reset(checkpoint);

        let cancel = self.cancel.lock().clone();
        let this = self.clone();
        let task = tokio::spawn(async move { this.restart_loop(failures, cancel).await });
        if let Some(previous) = self.task.lock().replace(task) {
            previous.abort();
        }
    }

    async fn restart_loop(&self, mut attempts: u32, cancel: CancellationToken) {
        loop {
            if !self.backoff.wait(attempts, &cancel).await {
                break;
            }
            match self.source.start().await {
                Ok(()) => {
                    info!(dispatcher = %self.name, attempts, "recovered, event source restarted");
                    self.reset();
                    return;
                }
                Err(WatcherError::AlreadyRunning(_))
                    if self.source.stats().state == WatcherState::Running =>
                {
                    info!(dispatcher = %self.name, "event source already running");
                    self.reset();
                    return;
                }
                Err(e) => {
                    attempts += 1;
                    let mut status = self.status.lock();
                    status.failures = status.failures.max(attempts);
                    status.last_failure = Some(Utc::now());
                    drop(status);
                    warn!(dispatcher = %self.name, attempts, error = %e, "failed to restart event source");
                }
            }
        }
        self.status.lock().recovering = false;
    }

    /// Clears failure tracking and makes a stopped recovery usable again.
    pub fn reset(&self) {
        *self.status.lock() = Status::default();
        let mut cancel = self.cancel.lock();
        if cancel.is_cancelled() {
            *cancel = CancellationToken::new();
        }
    }

    /// Interrupts an in-progress recovery without waiting for it. Until
    /// `reset`, any later recovery gives up before restarting the source.
    pub fn cancel(&self) {
        self.cancel.lock().cancel();
    }

    /// Interrupts an in-progress recovery and waits for it to exit.
    pub async fn stop(&self) {
        self.cancel();
        let task = self.task.lock().take();
        if let Some(task) = task {
            let _ = task.await;
        }
        self.status.lock().recovering = false;
    }

    /// `(recovering, last_failure, failures)`
    pub fn state(&self) -> (bool, Option<DateTime<Utc>>, u32) {
        let status = self.status.lock();
        (status.recovering, status.last_failure, status.failures)
    }
}
