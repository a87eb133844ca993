//! The `dispatcher` module drains an `EventSource` through an
//! `OrderedPublisher`.
//!
//! Every event moves through four stages: observed (read from the source),
//! pending (handed to the publisher), acknowledged (its publish future
//! resolved successfully) and checkpointed (durably recorded). Because the
//! publisher sends in order, an ack for sequence `N` acknowledges every
//! pending sequence up to `N`.
//!
//! A publish failure hands control to `Recovery`, which rewinds to the last
//! checkpoint and restarts the source. Events since that checkpoint are
//! delivered again, so receivers must tolerate duplicates.

mod config;
mod handler;
mod recovery;
mod state;

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::messaging::OrderedPublisher;
use crate::utils::backoff::ExponentialBackoff;
use crate::utils::error::{ProtocolError, WatcherError};
use crate::watcher::EventSource;

pub use config::DispatcherConfig;
pub use handler::MessageCreator;
pub use recovery::Recovery;
pub use state::{DispatcherState, DispatcherStats, PendingMessage};

use handler::DispatchHandler;

struct Running {
    cancel: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
}

struct Shared {
    name: String,
    config: DispatcherConfig,
    source: Arc<dyn EventSource>,
    state: Arc<DispatcherState>,
    recovery: Arc<Recovery>,
}

pub struct Dispatcher {
    shared: Arc<Shared>,
    running: tokio::sync::Mutex<Option<Running>>,
    active: AtomicBool,
}

impl Dispatcher {
    /// Installs the dispatcher as the source's event handler.
    pub fn new(
        name: impl Into<String>,
        publisher: Arc<OrderedPublisher>,
        source: Arc<dyn EventSource>,
        creator: Arc<dyn MessageCreator>,
        config: DispatcherConfig,
    ) -> Result<Self, ProtocolError> {
        config.validate()?;
        let name = name.into();
        let state = Arc::new(DispatcherState::new());

        source.set_handler(Arc::new(DispatchHandler {
            name: name.clone(),
            creator,
            publisher: publisher.clone(),
            state: state.clone(),
        }))?;

        let recovery = Arc::new(Recovery::new(
            name.clone(),
            publisher,
            source.clone(),
            state.clone(),
            ExponentialBackoff::new(config.base_retry_interval, config.max_retry_interval),
        ));

        Ok(Self {
            shared: Arc::new(Shared {
                name,
                config,
                source,
                state,
                recovery,
            }),
            running: tokio::sync::Mutex::new(None),
            active: AtomicBool::new(false),
        })
    }

    pub fn name(&self) -> &str {
        &self.shared.name
    }

    pub fn stats(&self) -> DispatcherStats {
        self.shared.state.stats()
    }

    pub fn recovery(&self) -> &Recovery {
        &self.shared.recovery
    }

    pub async fn start(&self) -> Result<(), ProtocolError> {
        let mut running = self.running.lock().await;
        if running.is_some() {
            return Err(ProtocolError::AlreadyRunning(format!(
                "dispatcher {}",
                self.shared.name
            )));
        }

        let shared = &self.shared;
        let checkpoint = shared.source.get_checkpoint()?;
        shared.state.reset(checkpoint);
        shared.recovery.reset();
        shared.source.start().await?;

        let cancel = CancellationToken::new();
        let mut tasks = vec![
            tokio::spawn(process_loop(shared.clone(), cancel.clone())),
            tokio::spawn(stall_loop(shared.clone(), cancel.clone())),
        ];
        if let Some(interval) = shared.config.checkpoint_interval {
            tasks.push(tokio::spawn(checkpoint_loop(shared.clone(), interval, cancel.clone())));
        }
        *running = Some(Running { cancel, tasks });
        self.active.store(true, Ordering::SeqCst);

        info!(dispatcher = %shared.name, checkpoint, "dispatcher started");
        Ok(())
    }

    /// Stops the background loops, any recovery in progress and the source,
    /// then records a final checkpoint. Idempotent.
    pub async fn stop(&self) {
        let mut running = self.running.lock().await;
        let Some(Running { cancel, tasks }) = running.take() else {
            return;
        };
        self.active.store(false, Ordering::SeqCst);
        cancel.cancel();
        for task in tasks {
            let _ = task.await;
        }

        let shared = &self.shared;
        shared.recovery.stop().await;
        shared.source.stop().await;
        if shared.config.checkpoint_interval.is_some() {
            if let Err(e) = shared.checkpoint_progress().await {
                warn!(dispatcher = %shared.name, error = %e, "failed to store final checkpoint");
            }
        }
        info!(dispatcher = %shared.name, "dispatcher stopped");
    }

    pub fn is_running(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }
}

impl Drop for Dispatcher {
    fn drop(&mut self) {
        self.shared.recovery.cancel();
        if let Ok(mut running) = self.running.try_lock() {
            if let Some(running) = running.take() {
                running.cancel.cancel();
            }
        }
    }
}

impl Shared {
    async fn process_results(&self) {
        for message in self.state.resolved_prefix() {
            match message.future.result() {
                Some(Ok(_)) => self.state.update_last_acked(message.seq_num),
                Some(Err(err)) => {
                    self.recovery.handle_error(message.seq_num, err).await;
                    return;
                }
                None => return,
            }
        }
    }

    async fn checkpoint_progress(&self) -> Result<(), WatcherError> {
        let Some(target) = self.state.checkpoint_target() else {
            return Ok(());
        };
        let source = self.source.clone();
        let stored = tokio::time::timeout(
            self.config.checkpoint_timeout,
            tokio::task::spawn_blocking(move || source.checkpoint(target)),
        )
        .await;
        match stored {
            Ok(Ok(result)) => result?,
            Ok(Err(e)) => return Err(WatcherError::Handler(format!("checkpoint task failed: {e}"))),
            Err(_) => return Err(WatcherError::Handler("checkpoint timed out".into())),
        }
        self.state.update_last_checkpoint(target);
        debug!(dispatcher = %self.name, seq_num = target, "checkpoint stored");
        Ok(())
    }
}

async fn process_loop(shared: Arc<Shared>, cancel: CancellationToken) {
    let mut ticker = tokio::time::interval(shared.config.process_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => shared.process_results().await,
        }
    }
}

async fn checkpoint_loop(
    shared: Arc<Shared>,
    interval: std::time::Duration,
    cancel: CancellationToken,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {
                if let Err(e) = shared.checkpoint_progress().await {
                    error!(dispatcher = %shared.name, error = %e, "failed to checkpoint");
                }
            }
        }
    }
}

async fn stall_loop(shared: Arc<Shared>, cancel: CancellationToken) {
    let mut ticker = tokio::time::interval(shared.config.stall_check_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {
                let stalled = shared.state.stalled(Instant::now(), shared.config.stall_timeout);
                if let Some(oldest) = stalled.first() {
                    warn!(
                        dispatcher = %shared.name,
                        stalled = stalled.len(),
                        oldest_seq_num = oldest,
                        "messages stalled waiting for ack"
                    );
                }
            }
        }
    }
}

#[cfg(test)]
mod tests;
