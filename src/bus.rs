use crate::chat::Message;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use tokio::sync::broadcast;

/// Outward-facing notifications for whatever presents the conversation.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum Event {
    /// A chatbot appended a reply to one of its histories.
    MessageProduced { history_id: String, message: Message },

    /// Audio for `message` is ready at `audio_path`.
    SpeechProduced {
        history_id: String,
        message: Message,
        audio_path: PathBuf,
    },

    /// The chatbot started or stopped having background work in flight.
    BusyStateChanged { chatbot_id: String, busy: bool },

    /// User-visible hint, e.g. a completion that failed.
    Notification {
        level: NotificationLevel,
        message: String,
        chatbot_id: Option<String>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NotificationLevel {
    Info,
    Warning,
    Error,
}

pub struct EventBus {
    tx: broadcast::Sender<Event>,
}

impl EventBus {
    pub fn new() -> Self {
        let (tx, _rx) = broadcast::channel(256);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.tx.subscribe()
    }

    pub fn publish(&self, event: Event) {
        // We ignore the error if there are no receivers
        let _ = self.tx.send(event);
    }

    pub fn notify(&self, level: NotificationLevel, message: impl Into<String>, chatbot_id: Option<&str>) {
        self.publish(Event::Notification {
            level,
            message: message.into(),
            chatbot_id: chatbot_id.map(str::to_string),
        });
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}
