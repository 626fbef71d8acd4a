use anyhow::Result;
use futures::future::join_all;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::watch;
use tracing::info;

use crate::bus::{EventBus, NotificationLevel};
use crate::chat::Message;
use crate::config::AppConfig;
use crate::entity::{ChatbotData, ChatbotDataList};
use crate::error::ChatbotError;
use crate::orchestrator::{ChatbotOrchestrator, PipelineContext, RetryPolicy};
use crate::provider::ProviderSet;

/// Owns every live chatbot orchestrator. All of them publish onto the same bus,
/// which is where front-ends pick up replies, audio and busy state.
pub struct OrchestratorRegistry {
    event_bus: Arc<EventBus>,
    context: watch::Sender<Arc<PipelineContext>>,
    retry: RetryPolicy,
    orchestrators: Mutex<HashMap<String, Arc<ChatbotOrchestrator>>>,
}

fn build_context(config: &AppConfig) -> Result<PipelineContext> {
    Ok(PipelineContext {
        providers: ProviderSet::from_config(config)?,
        speech_language: config.speech_language.clone(),
        audio_dir: config.audio_dir.clone(),
    })
}

impl OrchestratorRegistry {
    pub fn new(config: &AppConfig, event_bus: Arc<EventBus>) -> Result<Self> {
        Ok(Self::with_context(
            build_context(config)?,
            event_bus,
            RetryPolicy::default(),
        ))
    }

    pub fn with_context(context: PipelineContext, event_bus: Arc<EventBus>, retry: RetryPolicy) -> Self {
        let (context, _) = watch::channel(Arc::new(context));
        Self {
            event_bus,
            context,
            retry,
            orchestrators: Mutex::new(HashMap::new()),
        }
    }

    /// Starts an orchestrator for `data`. One already running under the same id
    /// is stopped and replaced.
    pub async fn create(&self, data: ChatbotData) -> Arc<ChatbotOrchestrator> {
        let id = data.id.clone();
        let orchestrator = ChatbotOrchestrator::new(
            data,
            self.event_bus.clone(),
            self.context.subscribe(),
            self.retry,
        );

        // Scope the lock so it is dropped before awaiting
        let previous = {
            let mut orchestrators = self.orchestrators.lock().unwrap();
            orchestrators.insert(id.clone(), orchestrator.clone())
        };
        if let Some(previous) = previous {
            previous.stop_generate().await;
            info!("Replaced chatbot {}", id);
        } else {
            info!("Created chatbot {}", id);
        }
        orchestrator
    }

    pub async fn delete(&self, id: &str) -> Result<ChatbotData, ChatbotError> {
        let removed = {
            let mut orchestrators = self.orchestrators.lock().unwrap();
            orchestrators.remove(id)
        };
        let orchestrator = removed.ok_or_else(|| ChatbotError::ChatbotNotFound(id.to_string()))?;
        orchestrator.stop_generate().await;
        info!("Deleted chatbot {}", id);
        Ok(orchestrator.snapshot().await)
    }

    pub fn get(&self, id: &str) -> Result<Arc<ChatbotOrchestrator>, ChatbotError> {
        let orchestrators = self.orchestrators.lock().unwrap();
        orchestrators
            .get(id)
            .cloned()
            .ok_or_else(|| ChatbotError::ChatbotNotFound(id.to_string()))
    }

    pub fn ids(&self) -> Vec<String> {
        let orchestrators = self.orchestrators.lock().unwrap();
        let mut ids: Vec<String> = orchestrators.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Records the user's message and asks its chatbot for a reply.
    pub async fn receive_message(&self, history_id: &str, message: Message, speak: bool) -> Result<(), ChatbotError> {
        let orchestrator = self.get(&message.chatbot_id)?;
        orchestrator.append_message(history_id, message).await?;
        orchestrator.receive_message(history_id, speak).await
    }

    pub async fn speak(&self, history_id: &str, message: Message) -> Result<(), ChatbotError> {
        let orchestrator = self.get(&message.chatbot_id)?;
        orchestrator.speak_it(history_id, message).await
    }

    pub async fn resend(&self, chatbot_id: &str, history_id: &str, message_id: &str, speak: bool) -> Result<(), ChatbotError> {
        self.get(chatbot_id)?.resend(history_id, message_id, speak).await
    }

    pub async fn stop(&self, id: &str) -> Result<(), ChatbotError> {
        self.get(id)?.stop_generate().await;
        Ok(())
    }

    pub async fn stop_all(&self) {
        let orchestrators = self.all();
        join_all(orchestrators.iter().map(|o| o.stop_generate())).await;
    }

    /// Swaps in providers built from `config`. Running tasks finish with the
    /// providers they started with.
    pub fn reconfigure(&self, config: &AppConfig) -> Result<()> {
        let context = build_context(config)?;
        self.context.send_replace(Arc::new(context));
        info!("Providers reconfigured");
        self.event_bus
            .notify(NotificationLevel::Info, "Settings applied", None);
        Ok(())
    }

    pub async fn snapshot(&self) -> ChatbotDataList {
        let orchestrators = self.all();
        let data = join_all(orchestrators.iter().map(|o| o.snapshot())).await;
        let mut list = ChatbotDataList::new(data);
        list.sort_by_activity();
        list
    }

    fn all(&self) -> Vec<Arc<ChatbotOrchestrator>> {
        let orchestrators = self.orchestrators.lock().unwrap();
        orchestrators.values().cloned().collect()
    }
}
