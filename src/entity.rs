use crate::chat::{History, HistoryCollection};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::cmp::Ordering;
use std::fmt;

/// Deterministic identifier: `prefix` followed by the first 16 hex digits of the
/// SHA-256 of `parts`. Same content, same id. Only meant for deduplication.
pub fn derive_id(prefix: &str, parts: &[&str]) -> String {
    let mut hasher = Sha256::new();
    for (i, part) in parts.iter().enumerate() {
        if i > 0 {
            hasher.update([0x1f]);
        }
        hasher.update(part.as_bytes());
    }
    let digest = hex::encode(hasher.finalize());
    format!("{}{}", prefix, &digest[..16].to_uppercase())
}

/// The persona a chatbot plays.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ChatbotProfile {
    pub name: String,
    #[serde(default)]
    pub avatar: String,
    #[serde(default)]
    pub personality: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub greeting: String,
    #[serde(default)]
    pub system_prompt: String,
}

impl ChatbotProfile {
    pub fn new(name: impl Into<String>, system_prompt: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            system_prompt: system_prompt.into(),
            ..Default::default()
        }
    }

    pub fn update(&mut self, other: &ChatbotProfile) {
        self.clone_from(other);
    }
}

/// Sampling parameters handed to the completion provider as-is.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerationParams {
    pub model: String,
    pub temperature: f32,
    pub top_p: f32,
    pub frequency_penalty: f32,
    pub presence_penalty: f32,
    pub max_tokens: u32,
}

impl Default for GenerationParams {
    fn default() -> Self {
        Self {
            model: "gpt-3.5-turbo".to_string(),
            temperature: 0.8,
            top_p: 1.0,
            frequency_penalty: 0.0,
            presence_penalty: 0.0,
            max_tokens: 512,
        }
    }
}

impl GenerationParams {
    pub fn update(&mut self, other: &GenerationParams) {
        self.clone_from(other);
    }
}

/// Everything that makes up one chatbot: persona, sampling parameters and conversations.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatbotData {
    pub id: String,
    pub profile: ChatbotProfile,
    #[serde(default)]
    pub params: GenerationParams,
    #[serde(default)]
    pub histories: HistoryCollection,
}

impl ChatbotData {
    /// Builds a chatbot with one empty history. The id is derived from the
    /// profile and parameters.
    pub fn new(profile: ChatbotProfile, params: GenerationParams) -> Self {
        let profile_json = serde_json::to_string(&profile).unwrap_or_default();
        let params_json = serde_json::to_string(&params).unwrap_or_default();
        let id = derive_id("CB", &[&params_json, &profile_json]);
        let histories = HistoryCollection::new(vec![History::new(&id, Utc::now())]);
        Self {
            id,
            profile,
            params,
            histories,
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    pub fn last_modified(&self) -> Option<DateTime<Utc>> {
        self.histories.last_modified()
    }

    /// "Most active first": more non-empty histories first, then the most recent
    /// message first. Chatbots without any message sort last.
    pub fn activity_cmp(&self, other: &ChatbotData) -> Ordering {
        other
            .histories
            .non_empty_count()
            .cmp(&self.histories.non_empty_count())
            .then_with(|| other.last_modified().cmp(&self.last_modified()))
    }

    pub fn update(&mut self, other: &ChatbotData) {
        self.params.update(&other.params);
        self.profile.update(&other.profile);
        self.histories.update(&other.histories);
    }
}

/// Owning list of chatbots, unique by id.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ChatbotDataList {
    items: Vec<ChatbotData>,
}

impl ChatbotDataList {
    pub fn new(items: Vec<ChatbotData>) -> Self {
        let mut list = Self::default();
        for item in items {
            list.push(item);
        }
        list
    }

    pub fn iter(&self) -> impl Iterator<Item = &ChatbotData> {
        self.items.iter()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.items.iter().any(|c| c.id == id)
    }

    pub fn get(&self, id: &str) -> Option<&ChatbotData> {
        self.items.iter().find(|c| c.id == id)
    }

    pub fn get_mut(&mut self, id: &str) -> Option<&mut ChatbotData> {
        self.items.iter_mut().find(|c| c.id == id)
    }

    /// Appends, or replaces the entry that already carries this id.
    pub fn push(&mut self, data: ChatbotData) {
        match self.get_mut(&data.id) {
            Some(existing) => *existing = data,
            None => self.items.push(data),
        }
    }

    pub fn remove(&mut self, id: &str) -> Option<ChatbotData> {
        let idx = self.items.iter().position(|c| c.id == id)?;
        Some(self.items.remove(idx))
    }

    pub fn sort_by_activity(&mut self) {
        self.items.sort_by(ChatbotData::activity_cmp);
    }

    /// Diff-based merge: entries absent from `incoming` are removed, unknown ones
    /// are appended and known ones are updated in place.
    pub fn update(&mut self, incoming: &ChatbotDataList) {
        self.items.retain(|c| incoming.contains(&c.id));
        for item in &incoming.items {
            match self.get_mut(&item.id) {
                Some(existing) => existing.update(item),
                None => self.items.push(item.clone()),
            }
        }
    }
}

impl IntoIterator for ChatbotDataList {
    type Item = ChatbotData;
    type IntoIter = std::vec::IntoIter<ChatbotData>;

    fn into_iter(self) -> Self::IntoIter {
        self.items.into_iter()
    }
}

impl fmt::Display for ChatbotData {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.profile.name, self.id)
    }
}
