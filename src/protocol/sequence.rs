use std::sync::atomic::{AtomicU64, Ordering};

use crate::envelope::Message;
use crate::messaging::ProcessingNotifier;

/// Highest sequence number processed from a remote stream.
#[derive(Debug, Default)]
pub struct SequenceTracker {
    last_seq_num: AtomicU64,
}

impl SequenceTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_last_seq_num(seq_num: u64) -> Self {
        Self {
            last_seq_num: AtomicU64::new(seq_num),
        }
    }

    /// Overrides the tracked value, moving it backwards if told to.
    pub fn update_last_seq_num(&self, seq_num: u64) {
        self.last_seq_num.store(seq_num, Ordering::SeqCst);
    }

    pub fn last_seq_num(&self) -> u64 {
        self.last_seq_num.load(Ordering::SeqCst)
    }
}

impl ProcessingNotifier for SequenceTracker {
    fn on_processed(&self, message: &Message) {
        let seq_num = message.seq_num();
        if seq_num > 0 {
            self.last_seq_num.fetch_max(seq_num, Ordering::SeqCst);
        }
    }
}
