use crate::chat::Message;
use crate::entity::Role;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Mutex;
use tokio::sync::broadcast;

/// Event delivered on a conversation's channel.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum ChannelEvent {
    /// A new message was appended to the conversation.
    Message(Message),

    /// A participant started or stopped composing. Ephemeral, never stored.
    Typing {
        #[serde(rename = "conversationId")]
        conversation_id: String,
        role: Role,
        typing: bool,
    },
}

impl ChannelEvent {
    pub fn name(&self) -> &'static str {
        match self {
            ChannelEvent::Message(_) => "message",
            ChannelEvent::Typing { .. } => "typing",
        }
    }
}

/// Per-conversation delivery channels over tokio broadcast.
///
/// Each subscriber holds its own receiver and sees every event published
/// while subscribed exactly once; dropping the receiver unsubscribes
/// immediately. A slow or failing subscriber only lags its own receiver,
/// it never affects other subscribers or the publisher.
#[derive(Debug, Default)]
pub struct ChannelRegistry {
    channels: Mutex<HashMap<String, broadcast::Sender<ChannelEvent>>>,
}

const CHANNEL_CAPACITY: usize = 64;

impl ChannelRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self, conversation_id: &str) -> broadcast::Receiver<ChannelEvent> {
        let mut channels = self.channels.lock().unwrap();
        channels
            .entry(conversation_id.to_string())
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0)
            .subscribe()
    }

    /// Fire-and-forget: a conversation with no live subscribers is not an
    /// error, the event is simply dropped.
    pub fn publish(&self, conversation_id: &str, event: ChannelEvent) {
        let mut channels = self.channels.lock().unwrap();
        if let Some(tx) = channels.get(conversation_id) {
            if tx.receiver_count() == 0 {
                channels.remove(conversation_id);
                return;
            }
            let _ = tx.send(event);
        }
    }

    #[cfg(test)]
    pub fn channel_count(&self) -> usize {
        self.channels.lock().unwrap().len()
    }
}
