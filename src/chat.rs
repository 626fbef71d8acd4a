use crate::entity::derive_id;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;

/// A single line of conversation, either typed by the user or produced by a chatbot.
///
/// Two messages are equal when their ids are equal. Ordering inside a history is
/// by timestamp, see [`Message::cmp_by_time`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub id: String,
    pub chatbot_id: String,
    pub text: String,
    pub timestamp: DateTime<Utc>,
    pub is_user: bool,
    pub sender: String,
}

impl Message {
    pub fn new(
        chatbot_id: impl Into<String>,
        text: impl Into<String>,
        timestamp: DateTime<Utc>,
        is_user: bool,
        sender: impl Into<String>,
    ) -> Self {
        let chatbot_id = chatbot_id.into();
        let text = text.into();
        let id = derive_id(
            "ME",
            &[
                &chatbot_id,
                &timestamp.to_rfc3339_opts(chrono::SecondsFormat::Nanos, true),
                if is_user { "user" } else { "bot" },
                &text,
            ],
        );
        Self {
            id,
            chatbot_id,
            text,
            timestamp,
            is_user,
            sender: sender.into(),
        }
    }

    pub fn user(chatbot_id: impl Into<String>, text: impl Into<String>, sender: impl Into<String>) -> Self {
        Self::new(chatbot_id, text, Utc::now(), true, sender)
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    /// Replaces every field except the id.
    pub fn update(&mut self, other: &Message) {
        self.chatbot_id = other.chatbot_id.clone();
        self.text = other.text.clone();
        self.timestamp = other.timestamp;
        self.is_user = other.is_user;
        self.sender = other.sender.clone();
    }

    pub fn cmp_by_time(&self, other: &Message) -> Ordering {
        self.timestamp.cmp(&other.timestamp)
    }
}

impl PartialEq for Message {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for Message {}

/// One conversation thread. Messages are kept sorted by timestamp, oldest first.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct History {
    pub id: String,
    #[serde(default)]
    pub memory: String,
    #[serde(default)]
    messages: Vec<Message>,
}

impl History {
    /// Creates an empty history. The creation time feeds the id so that two
    /// empty histories of the same chatbot do not collide.
    pub fn new(chatbot_id: &str, created_at: DateTime<Utc>) -> Self {
        let id = derive_id(
            "HD",
            &[
                chatbot_id,
                &created_at.to_rfc3339_opts(chrono::SecondsFormat::Nanos, true),
            ],
        );
        Self {
            id,
            memory: String::new(),
            messages: Vec::new(),
        }
    }

    pub fn with_messages(id: impl Into<String>, messages: Vec<Message>) -> Self {
        let mut history = Self {
            id: id.into(),
            memory: String::new(),
            messages: Vec::with_capacity(messages.len()),
        };
        for message in messages {
            history.append(message);
        }
        history
    }

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn contains(&self, message_id: &str) -> bool {
        self.messages.iter().any(|m| m.id == message_id)
    }

    pub fn get(&self, message_id: &str) -> Option<&Message> {
        self.messages.iter().find(|m| m.id == message_id)
    }

    pub fn latest(&self) -> Option<&Message> {
        self.messages.last()
    }

    /// The last `n` messages, oldest first.
    pub fn latest_n(&self, n: usize) -> &[Message] {
        let start = self.messages.len().saturating_sub(n);
        &self.messages[start..]
    }

    /// Ordered insert. A message with the same timestamp as existing ones goes after them.
    /// Returns `false` and leaves the history untouched if a message with the same id
    /// is already present.
    pub fn append(&mut self, message: Message) -> bool {
        if self.contains(&message.id) {
            return false;
        }
        let idx = self
            .messages
            .partition_point(|m| m.timestamp <= message.timestamp);
        self.messages.insert(idx, message);
        true
    }

    pub fn remove(&mut self, message_id: &str) -> Option<Message> {
        let idx = self.messages.iter().position(|m| m.id == message_id)?;
        Some(self.messages.remove(idx))
    }

    /// Drops every message strictly newer than `message_id`. Returns the removed messages,
    /// or `None` if the message is not part of this history.
    pub fn truncate_after(&mut self, message_id: &str) -> Option<Vec<Message>> {
        let anchor = self.get(message_id)?.timestamp;
        let keep = self.messages.partition_point(|m| m.timestamp <= anchor);
        Some(self.messages.split_off(keep))
    }

    /// Merges `other` into this history by message id: messages missing from `other`
    /// are dropped, known ones are updated in place, new ones are inserted.
    pub fn update(&mut self, other: &History) {
        self.memory = other.memory.clone();
        self.messages.retain(|m| other.contains(&m.id));
        for incoming in &other.messages {
            match self.messages.iter_mut().find(|m| m.id == incoming.id) {
                Some(existing) => existing.update(incoming),
                None => self.messages.push(incoming.clone()),
            }
        }
        // updates may have moved timestamps
        self.messages.sort_by(Message::cmp_by_time);
    }
}

impl PartialEq for History {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id && self.memory == other.memory && self.messages == other.messages
    }
}

/// All histories of one chatbot, in insertion order.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct HistoryCollection {
    histories: Vec<History>,
}

impl HistoryCollection {
    pub fn new(histories: Vec<History>) -> Self {
        let mut collection = Self::default();
        for history in histories {
            collection.insert(history);
        }
        collection
    }

    pub fn iter(&self) -> impl Iterator<Item = &History> {
        self.histories.iter()
    }

    pub fn len(&self) -> usize {
        self.histories.len()
    }

    pub fn is_empty(&self) -> bool {
        self.histories.is_empty()
    }

    pub fn contains(&self, history_id: &str) -> bool {
        self.histories.iter().any(|h| h.id == history_id)
    }

    pub fn get(&self, history_id: &str) -> Option<&History> {
        self.histories.iter().find(|h| h.id == history_id)
    }

    pub fn get_mut(&mut self, history_id: &str) -> Option<&mut History> {
        self.histories.iter_mut().find(|h| h.id == history_id)
    }

    /// Inserts or replaces by id.
    pub fn insert(&mut self, history: History) {
        match self.get_mut(&history.id) {
            Some(existing) => *existing = history,
            None => self.histories.push(history),
        }
    }

    pub fn remove(&mut self, history_id: &str) -> Option<History> {
        let idx = self.histories.iter().position(|h| h.id == history_id)?;
        Some(self.histories.remove(idx))
    }

    /// The history whose newest message is the most recent. Empty histories lose
    /// against any non-empty one.
    pub fn latest(&self) -> Option<&History> {
        self.histories
            .iter()
            .max_by_key(|h| h.latest().map(|m| m.timestamp))
    }

    pub fn last_modified(&self) -> Option<DateTime<Utc>> {
        self.histories
            .iter()
            .filter_map(|h| h.latest().map(|m| m.timestamp))
            .max()
    }

    pub fn non_empty_count(&self) -> usize {
        self.histories.iter().filter(|h| !h.is_empty()).count()
    }

    pub fn update(&mut self, other: &HistoryCollection) {
        self.histories.retain(|h| other.contains(&h.id));
        for incoming in &other.histories {
            match self.get_mut(&incoming.id) {
                Some(existing) => existing.update(incoming),
                None => self.histories.push(incoming.clone()),
            }
        }
    }
}

/// Removes `(...)` and full-width `（...）` annotations, the way stage directions
/// are written in roleplay replies. An opening bracket without a close is kept.
pub fn strip_annotations(text: &str) -> String {
    let chars: Vec<char> = text.chars().collect();
    let mut out = String::with_capacity(text.len());
    let mut i = 0;
    while i < chars.len() {
        let close = match chars[i] {
            '(' => Some(')'),
            '（' => Some('）'),
            _ => None,
        };
        if let Some(close) = close {
            if let Some(offset) = chars[i + 1..].iter().position(|&c| c == close) {
                i += offset + 2;
                continue;
            }
        }
        out.push(chars[i]);
        i += 1;
    }
    out
}
