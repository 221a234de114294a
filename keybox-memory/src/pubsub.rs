use std::collections::HashSet;

use bytes::Bytes;
use tokio::sync::broadcast::{self, error::RecvError};
use tracing::warn;

/// A message delivered to a [`MemorySubscriber`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemoryMessage {
    /// Channel the message was published on.
    pub channel: String,
    /// Raw message body.
    pub payload: Bytes,
}

/// Receives messages published through any database of the same connector.
///
/// Only channels passed to [`subscribe`](Self::subscribe) are delivered.
#[derive(Debug)]
pub struct MemorySubscriber {
    receiver: broadcast::Receiver<MemoryMessage>,
    channels: HashSet<String>,
}

impl MemorySubscriber {
    pub(crate) fn new(receiver: broadcast::Receiver<MemoryMessage>) -> Self {
        Self {
            receiver,
            channels: HashSet::new(),
        }
    }

    /// Starts delivering messages published on `channel`.
    pub fn subscribe(&mut self, channel: impl Into<String>) {
        self.channels.insert(channel.into());
    }

    /// Stops delivering messages published on `channel`.
    pub fn unsubscribe(&mut self, channel: &str) {
        self.channels.remove(channel);
    }

    /// Waits for the next message on a subscribed channel.
    ///
    /// Returns `None` once the connector and all its stores are dropped.
    pub async fn next_message(&mut self) -> Option<MemoryMessage> {
        loop {
            match self.receiver.recv().await {
                Ok(message) if self.channels.contains(&message.channel) => return Some(message),
                Ok(_) => continue,
                Err(RecvError::Lagged(skipped)) => {
                    warn!(skipped, "Subscriber lagged behind publishers");
                }
                Err(RecvError::Closed) => return None,
            }
        }
    }
}
