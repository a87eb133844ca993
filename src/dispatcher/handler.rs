use std::sync::Arc;

use async_trait::async_trait;
use tokio::time::Instant;
use tracing::trace;

use super::state::{DispatcherState, PendingMessage};
use crate::envelope::{KEY_EVENT_TIME, KEY_SEQ_NUM, KEY_SOURCE, Message};
use crate::messaging::{OrderedPublisher, PublishRequest};
use crate::utils::error::{ProtocolError, WatcherError};
use crate::watcher::{Event, EventHandler};

/// Turns a stored event into the message to send, or `None` to skip it.
pub trait MessageCreator: Send + Sync {
    fn create_message(&self, event: &Event) -> Result<Option<Message>, ProtocolError>;
}

impl<F> MessageCreator for F
where
    F: Fn(&Event) -> Result<Option<Message>, ProtocolError> + Send + Sync,
{
    fn create_message(&self, event: &Event) -> Result<Option<Message>, ProtocolError> {
        (self)(event)
    }
}

/// Feeds watcher events to the ordered publisher and records them as pending.
pub(crate) struct DispatchHandler {
    pub(crate) name: String,
    pub(crate) creator: Arc<dyn MessageCreator>,
    pub(crate) publisher: Arc<OrderedPublisher>,
    pub(crate) state: Arc<DispatcherState>,
}

impl DispatchHandler {
    fn enrich(&self, message: &mut Message, event: &Event) {
        message.metadata.set_u64(KEY_SEQ_NUM, event.seq_num);
        message.metadata.set_time(KEY_EVENT_TIME, event.timestamp);
        if !message.metadata.has(KEY_SOURCE) {
            message.metadata.set(KEY_SOURCE, self.name.as_str());
        }
    }
}

#[async_trait]
impl EventHandler for DispatchHandler {
    async fn handle_event(&self, event: Event) -> Result<(), WatcherError> {
        let message = self
            .creator
            .create_message(&event)
            .map_err(|e| WatcherError::Handler(format!("failed to create message: {e}")))?;

        let Some(mut message) = message else {
            trace!(dispatcher = %self.name, seq_num = event.seq_num, "no message for event");
            self.state.update_last_observed(event.seq_num);
            return Ok(());
        };
        self.enrich(&mut message, &event);

        let future = self
            .publisher
            .publish_async(PublishRequest::new(message))
            .map_err(|e| WatcherError::Handler(format!("failed to publish message: {e}")))?;

        self.state.add_pending(PendingMessage {
            seq_num: event.seq_num,
            publish_time: Instant::now(),
            future,
        });
        Ok(())
    }
}
