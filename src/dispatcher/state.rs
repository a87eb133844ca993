use std::collections::VecDeque;
use std::time::Duration;

use parking_lot::RwLock;
use tokio::time::Instant;

use crate::messaging::PublishFuture;

/// A message handed to the publisher and not yet acknowledged.
#[derive(Debug, Clone)]
pub struct PendingMessage {
    pub seq_num: u64,
    pub publish_time: Instant,
    pub future: PublishFuture,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatcherStats {
    pub last_acked_seq_num: u64,
    pub last_observed_seq_num: u64,
    pub last_checkpoint_seq_num: u64,
    pub pending: usize,
}

#[derive(Debug, Default)]
struct Counters {
    last_acked: u64,
    last_observed: u64,
    last_checkpoint: u64,
    pending: VecDeque<PendingMessage>,
}

/// Sequence bookkeeping shared by the event handler, the result processor,
/// the checkpoint loop and recovery.
///
/// `last_checkpoint <= last_acked <= last_observed` holds at all times and
/// `pending` is kept in sequence order.
#[derive(Debug, Default)]
pub struct DispatcherState {
    inner: RwLock<Counters>,
}

impl DispatcherState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stats(&self) -> DispatcherStats {
        let s = self.inner.read();
        DispatcherStats {
            last_acked_seq_num: s.last_acked,
            last_observed_seq_num: s.last_observed,
            last_checkpoint_seq_num: s.last_checkpoint,
            pending: s.pending.len(),
        }
    }

    pub fn update_last_observed(&self, seq_num: u64) {
        let mut s = self.inner.write();
        s.last_observed = s.last_observed.max(seq_num);
    }

    pub fn add_pending(&self, message: PendingMessage) {
        let mut s = self.inner.write();
        s.last_observed = s.last_observed.max(message.seq_num);
        s.pending.push_back(message);
    }

    /// Records a successful ack for `seq_num`. Since publishing is ordered,
    /// everything pending up to and including it is acknowledged too.
    pub fn update_last_acked(&self, seq_num: u64) {
        let mut s = self.inner.write();
        s.last_acked = s.last_acked.max(seq_num);
        while s.pending.front().is_some_and(|m| m.seq_num <= seq_num) {
            s.pending.pop_front();
        }
        s.last_observed = s.last_observed.max(s.last_acked);
    }

    /// The leading pending messages whose futures have resolved, in order.
    pub fn resolved_prefix(&self) -> Vec<PendingMessage> {
        self.inner
            .read()
            .pending
            .iter()
            .take_while(|m| m.future.is_done())
            .cloned()
            .collect()
    }

    /// The sequence number worth checkpointing, if it advances past the last
    /// checkpoint: everything observed when nothing is pending, otherwise the
    /// last ack.
    pub fn checkpoint_target(&self) -> Option<u64> {
        let s = self.inner.read();
        let target = if s.pending.is_empty() {
            s.last_observed
        } else {
            s.last_acked
        };
        (target > s.last_checkpoint).then_some(target)
    }

    pub fn update_last_checkpoint(&self, seq_num: u64) {
        let mut s = self.inner.write();
        s.last_checkpoint = s.last_checkpoint.max(seq_num);
        s.last_acked = s.last_acked.max(s.last_checkpoint);
        s.last_observed = s.last_observed.max(s.last_checkpoint);
    }

    /// Pending messages published longer than `timeout` ago.
    pub fn stalled(&self, now: Instant, timeout: Duration) -> Vec<u64> {
        self.inner
            .read()
            .pending
            .iter()
            .filter(|m| now.saturating_duration_since(m.publish_time) > timeout)
            .map(|m| m.seq_num)
            .collect()
    }

    /// Drops everything not yet durable and restarts bookkeeping at
    /// `checkpoint`.
    pub fn reset(&self, checkpoint: u64) {
        let mut s = self.inner.write();
        s.pending.clear();
        s.last_checkpoint = checkpoint;
        s.last_acked = checkpoint;
        s.last_observed = checkpoint;
    }
}
