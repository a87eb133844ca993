use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{Event, EventHandler, EventSource, EventStore, WatcherState, WatcherStats};
use crate::utils::backoff::ExponentialBackoff;
use crate::utils::error::WatcherError;

/// Where iteration begins when no checkpoint has been stored yet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum EventIterator {
    /// From the first event.
    #[default]
    TrimHorizon,
    /// Only events stored after start.
    Latest,
    /// Events with a sequence number greater than this.
    AfterSequence(u64),
}

/// What to do when the handler fails an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RetryStrategy {
    /// Retry the same event with backoff until it succeeds or the watcher stops.
    #[default]
    Block,
    /// Log and move on.
    Skip,
}

#[derive(Debug, Clone)]
pub struct WatcherConfig {
    pub id: String,
    /// Object types to deliver. Empty means all.
    pub object_types: Vec<String>,
    pub initial_event_iterator: EventIterator,
    pub retry_strategy: RetryStrategy,
    pub retry_backoff: ExponentialBackoff,
    pub batch_size: usize,
    pub poll_interval: Duration,
}

impl WatcherConfig {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            ..Default::default()
        }
    }
}

impl Default for WatcherConfig {
    fn default() -> Self {
        Self {
            id: String::new(),
            object_types: Vec::new(),
            initial_event_iterator: EventIterator::TrimHorizon,
            retry_strategy: RetryStrategy::Block,
            retry_backoff: ExponentialBackoff::new(
                Duration::from_millis(100),
                Duration::from_secs(5),
            ),
            batch_size: 100,
            poll_interval: Duration::from_millis(100),
        }
    }
}

struct Inner {
    config: WatcherConfig,
    store: Arc<dyn EventStore>,
    handler: RwLock<Option<Arc<dyn EventHandler>>>,
    state: Mutex<WatcherState>,
    last_processed: AtomicU64,
    last_checkpoint: AtomicU64,
}

/// `EventSource` over an `EventStore`.
pub struct Watcher {
    inner: Arc<Inner>,
    run: Mutex<Option<(CancellationToken, JoinHandle<()>)>>,
}

impl Watcher {
    pub fn new(store: Arc<dyn EventStore>, config: WatcherConfig) -> Self {
        let last_checkpoint = store
            .get_checkpoint(&config.id)
            .ok()
            .flatten()
            .unwrap_or(0);
        Self {
            inner: Arc::new(Inner {
                config,
                store,
                handler: RwLock::new(None),
                state: Mutex::new(WatcherState::Idle),
                last_processed: AtomicU64::new(0),
                last_checkpoint: AtomicU64::new(last_checkpoint),
            }),
            run: Mutex::new(None),
        }
    }

    fn starting_seq(&self) -> Result<u64, WatcherError> {
        let inner = &self.inner;
        if let Some(checkpoint) = inner.store.get_checkpoint(&inner.config.id)? {
            return Ok(checkpoint);
        }
        Ok(match inner.config.initial_event_iterator {
            EventIterator::TrimHorizon => 0,
            EventIterator::Latest => inner.store.latest_seq_num()?,
            EventIterator::AfterSequence(seq) => seq,
        })
    }
}

#[async_trait]
impl EventSource for Watcher {
    fn id(&self) -> &str {
        &self.inner.config.id
    }

    fn set_handler(&self, handler: Arc<dyn EventHandler>) -> Result<(), WatcherError> {
        let mut slot = self.inner.handler.write();
        if slot.is_some() {
            return Err(WatcherError::HandlerExists(self.inner.config.id.clone()));
        }
        *slot = Some(handler);
        Ok(())
    }

    async fn start(&self) -> Result<(), WatcherError> {
        let id = self.inner.config.id.clone();
        let Some(handler) = self.inner.handler.read().clone() else {
            return Err(WatcherError::NoHandler(id));
        };
        if matches!(
            *self.inner.state.lock(),
            WatcherState::Running | WatcherState::Stopping
        ) {
            return Err(WatcherError::AlreadyRunning(id));
        }
        let after = self.starting_seq()?;

        let mut run = self.run.lock();
        {
            let mut state = self.inner.state.lock();
            if matches!(*state, WatcherState::Running | WatcherState::Stopping) {
                return Err(WatcherError::AlreadyRunning(id));
            }
            *state = WatcherState::Running;
        }
        self.inner.last_processed.store(after, Ordering::SeqCst);
        let cancel = CancellationToken::new();
        let task = tokio::spawn(run_loop(self.inner.clone(), handler, after, cancel.clone()));
        *run = Some((cancel, task));
        info!(watcher = %id, after, "watcher started");
        Ok(())
    }

    async fn stop(&self) {
        let run = self.run.lock().take();
        let Some((cancel, task)) = run else {
            return;
        };
        *self.inner.state.lock() = WatcherState::Stopping;
        cancel.cancel();
        let _ = task.await;
        *self.inner.state.lock() = WatcherState::Stopped;
        debug!(watcher = %self.inner.config.id, "watcher stopped");
    }

    fn stats(&self) -> WatcherStats {
        WatcherStats {
            id: self.inner.config.id.clone(),
            state: *self.inner.state.lock(),
            last_processed_seq_num: self.inner.last_processed.load(Ordering::SeqCst),
            last_checkpoint: self.inner.last_checkpoint.load(Ordering::SeqCst),
        }
    }

    fn get_checkpoint(&self) -> Result<u64, WatcherError> {
        Ok(self
            .inner
            .store
            .get_checkpoint(&self.inner.config.id)?
            .unwrap_or(0))
    }

    fn checkpoint(&self, seq_num: u64) -> Result<(), WatcherError> {
        self.inner.store.checkpoint(&self.inner.config.id, seq_num)?;
        self.inner.last_checkpoint.store(seq_num, Ordering::SeqCst);
        Ok(())
    }
}

impl Drop for Watcher {
    fn drop(&mut self) {
        if let Some((cancel, _)) = self.run.lock().take() {
            cancel.cancel();
        }
    }
}

async fn run_loop(
    inner: Arc<Inner>,
    handler: Arc<dyn EventHandler>,
    mut after: u64,
    cancel: CancellationToken,
) {
    let notify = inner.store.notifier();
    'outer: while !cancel.is_cancelled() {
        let notified = notify.notified();
        let events = match inner.store.get_events(after, inner.config.batch_size) {
            Ok(events) => events,
            Err(e) => {
                warn!(watcher = %inner.config.id, error = %e, "failed to read events");
                Vec::new()
            }
        };

        if events.is_empty() {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = notified => {}
                _ = tokio::time::sleep(inner.config.poll_interval) => {}
            }
            continue;
        }

        for event in events {
            let seq_num = event.seq_num;
            if inner.accepts(&event) && !inner.deliver(&handler, event, &cancel).await {
                break 'outer;
            }
            after = seq_num;
            inner.last_processed.store(seq_num, Ordering::SeqCst);
        }
    }
}

impl Inner {
    fn accepts(&self, event: &Event) -> bool {
        self.config.object_types.is_empty()
            || self.config.object_types.iter().any(|t| *t == event.object_type)
    }

    /// Returns `false` if the watcher was stopped before the event was handled.
    async fn deliver(
        &self,
        handler: &Arc<dyn EventHandler>,
        event: Event,
        cancel: &CancellationToken,
    ) -> bool {
        let mut attempts = 0u32;
        loop {
            if cancel.is_cancelled() {
                return false;
            }
            let seq_num = event.seq_num;
            match handler.handle_event(event.clone()).await {
                Ok(()) => return true,
                Err(e) if self.config.retry_strategy == RetryStrategy::Skip => {
                    warn!(watcher = %self.config.id, seq_num, error = %e, "skipping failed event");
                    return true;
                }
                Err(e) => {
                    attempts += 1;
                    debug!(watcher = %self.config.id, seq_num, attempts, error = %e, "retrying event");
                    if !self.config.retry_backoff.wait(attempts, cancel).await {
                        return false;
                    }
                }
            }
        }
    }
}
