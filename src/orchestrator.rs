//! One chatbot's pipeline: completion, then optionally translation and speech.
//!
//! Every stage runs as its own tokio task registered with the chatbot's
//! [`TaskRegistry`]. A new message cancels whatever is still running before the
//! next completion starts, and a stage only commits its result after checking
//! its cancellation token while holding the chatbot's data lock. Cancelling also
//! takes that lock, so "check, then append" cannot interleave with a stop.

use crate::bus::{Event, EventBus, NotificationLevel};
use crate::chat::{strip_annotations, History, Message};
use crate::entity::ChatbotData;
use crate::error::{ChatbotError, ProviderError, Result};
use crate::provider::{ProviderResult, ProviderSet, SpeechOutput};
use crate::tasks::{Stage, TaskGuard, TaskRegistry};
use chrono::Utc;
use std::fmt;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Messages sent to the completion provider as conversation context.
const COMPLETION_WINDOW: usize = 10;
/// Messages passed to the speech provider as surrounding context.
const SPEECH_CONTEXT_WINDOW: usize = 5;

/// Providers and speech settings shared by every orchestrator. Replaced as a
/// whole on reconfiguration; tasks keep the instance they started with.
pub struct PipelineContext {
    pub providers: ProviderSet,
    pub speech_language: String,
    pub audio_dir: PathBuf,
}

#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    /// Total attempts for transient failures, first call included.
    pub max_attempts: u32,
    /// Extra attempts allowed for unparsable responses.
    pub malformed_retries: u32,
    pub backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            malformed_retries: 1,
            backoff: Duration::from_secs(2),
        }
    }
}

enum StageOutcome<T> {
    Done(T),
    Cancelled,
}

/// Why the speech sub-pipeline gave up. All of them are silent to the user.
#[derive(Debug)]
enum SpeakAbort {
    Cancelled,
    /// The speech service answered without audio.
    NoAudio,
    Failed(ProviderError),
    Artifact(std::io::Error),
}

impl fmt::Display for SpeakAbort {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SpeakAbort::Cancelled => f.write_str("cancelled"),
            SpeakAbort::NoAudio => f.write_str("speech service returned no audio"),
            SpeakAbort::Failed(e) => write!(f, "{}", e),
            SpeakAbort::Artifact(e) => write!(f, "could not store audio: {}", e),
        }
    }
}

/// What gets voiced: the text to speak, the recent conversation, and the
/// untranslated original.
struct SpeechRequest {
    text: String,
    context: String,
    raw_text: String,
}

pub struct ChatbotOrchestrator {
    chatbot_id: String,
    data: Mutex<ChatbotData>,
    tasks: TaskRegistry,
    context: watch::Receiver<Arc<PipelineContext>>,
    bus: Arc<EventBus>,
    retry: RetryPolicy,
}

impl ChatbotOrchestrator {
    pub fn new(
        data: ChatbotData,
        bus: Arc<EventBus>,
        context: watch::Receiver<Arc<PipelineContext>>,
        retry: RetryPolicy,
    ) -> Arc<Self> {
        let chatbot_id = data.id.clone();
        let status_bus = bus.clone();
        let status_id = chatbot_id.clone();
        let tasks = TaskRegistry::new(move |busy| {
            status_bus.publish(Event::BusyStateChanged {
                chatbot_id: status_id.clone(),
                busy,
            });
        });

        Arc::new(Self {
            chatbot_id,
            data: Mutex::new(data),
            tasks,
            context,
            bus,
            retry,
        })
    }

    pub fn chatbot_id(&self) -> &str {
        &self.chatbot_id
    }

    pub fn is_busy(&self) -> bool {
        self.tasks.is_busy()
    }

    pub async fn snapshot(&self) -> ChatbotData {
        self.data.lock().await.clone()
    }

    /// Merges edited profile, parameters or histories into the live data.
    pub async fn update_data(&self, incoming: &ChatbotData) {
        self.data.lock().await.update(incoming);
    }

    pub async fn create_history(&self) -> String {
        let history = History::new(&self.chatbot_id, Utc::now());
        let id = history.id.clone();
        self.data.lock().await.histories.insert(history);
        id
    }

    /// Inserts a message into a history, keeping it sorted. Re-adding a message
    /// that is already there is a no-op.
    pub async fn append_message(&self, history_id: &str, message: Message) -> Result<()> {
        let mut data = self.data.lock().await;
        let history = data
            .histories
            .get_mut(history_id)
            .ok_or_else(|| ChatbotError::HistoryNotFound(history_id.to_string()))?;
        history.append(message);
        Ok(())
    }

    pub async fn delete_message(&self, history_id: &str, message_id: &str) -> Result<Message> {
        let mut data = self.data.lock().await;
        let history = data
            .histories
            .get_mut(history_id)
            .ok_or_else(|| ChatbotError::HistoryNotFound(history_id.to_string()))?;
        history
            .remove(message_id)
            .ok_or_else(|| ChatbotError::MessageNotFound(message_id.to_string()))
    }

    /// Cancels the running pipeline and starts a new completion for `history_id`.
    pub async fn receive_message(self: &Arc<Self>, history_id: &str, also_speak: bool) -> Result<()> {
        let token = CancellationToken::new();
        let guard = {
            let data = self.data.lock().await;
            if !data.histories.contains(history_id) {
                return Err(ChatbotError::HistoryNotFound(history_id.to_string()));
            }
            self.tasks.cancel_all();
            self.tasks.register(Stage::Completion, token.clone())
        };

        let this = self.clone();
        let history_id = history_id.to_string();
        tokio::spawn(async move {
            this.completion_stage(history_id, also_speak, token, guard)
                .await;
        });
        Ok(())
    }

    /// Drops every message after `message_id` and asks for a fresh reply.
    pub async fn resend(self: &Arc<Self>, history_id: &str, message_id: &str, also_speak: bool) -> Result<()> {
        {
            let mut data = self.data.lock().await;
            self.tasks.cancel_all();
            let history = data
                .histories
                .get_mut(history_id)
                .ok_or_else(|| ChatbotError::HistoryNotFound(history_id.to_string()))?;
            let dropped = history
                .truncate_after(message_id)
                .ok_or_else(|| ChatbotError::MessageNotFound(message_id.to_string()))?;
            debug!(chatbot = %self.chatbot_id, dropped = dropped.len(), "truncated history for resend");
        }
        self.receive_message(history_id, also_speak).await
    }

    /// Voices an existing message, e.g. to replay it.
    pub async fn speak_it(self: &Arc<Self>, history_id: &str, message: Message) -> Result<()> {
        let data = self.data.lock().await;
        let history = data
            .histories
            .get(history_id)
            .ok_or_else(|| ChatbotError::HistoryNotFound(history_id.to_string()))?;
        let context = speech_context(history);
        self.spawn_speak(history_id.to_string(), message, context, &CancellationToken::new());
        Ok(())
    }

    /// Cancels everything in flight without starting new work.
    pub async fn stop_generate(&self) {
        let _data = self.data.lock().await;
        if self.tasks.is_busy() {
            info!(chatbot = %self.chatbot_id, stages = ?self.tasks.stages(), "stopping");
        }
        self.tasks.cancel_all();
    }

    fn current_context(&self) -> Arc<PipelineContext> {
        self.context.borrow().clone()
    }

    async fn completion_stage(
        self: Arc<Self>,
        history_id: String,
        also_speak: bool,
        token: CancellationToken,
        _guard: TaskGuard,
    ) {
        let ctx = self.current_context();
        let request = {
            let data = self.data.lock().await;
            data.histories.get(&history_id).map(|history| {
                (
                    data.profile.system_prompt.clone(),
                    data.profile.name.clone(),
                    history.latest_n(COMPLETION_WINDOW).to_vec(),
                    data.params.clone(),
                )
            })
        };
        let Some((system_prompt, sender, recent, params)) = request else {
            warn!(chatbot = %self.chatbot_id, history = %history_id, "history vanished before completion");
            return;
        };

        let completion = ctx.providers.completion.clone();
        let outcome = self
            .run_stage(Stage::Completion, &token, || {
                completion.complete(&system_prompt, &recent, &params)
            })
            .await;

        let reply = match outcome {
            Ok(StageOutcome::Done(reply)) => reply,
            Ok(StageOutcome::Cancelled) => {
                debug!(chatbot = %self.chatbot_id, "completion cancelled, result discarded");
                return;
            }
            Err(e) => {
                error!(chatbot = %self.chatbot_id, "completion failed: {}", e);
                self.bus.notify(
                    NotificationLevel::Error,
                    format!("{} failed to reply: {}", sender, e),
                    Some(&self.chatbot_id),
                );
                return;
            }
        };

        let message = Message::new(self.chatbot_id.clone(), reply, Utc::now(), false, sender);
        let mut data = self.data.lock().await;
        if token.is_cancelled() {
            debug!(chatbot = %self.chatbot_id, "completion cancelled before commit");
            return;
        }
        let Some(history) = data.histories.get_mut(&history_id) else {
            warn!(chatbot = %self.chatbot_id, history = %history_id, "history vanished before commit");
            return;
        };
        history.append(message.clone());
        info!(chatbot = %self.chatbot_id, history = %history_id, message_id = %message.id, "reply appended");

        self.bus.publish(Event::MessageProduced {
            history_id: history_id.clone(),
            message: message.clone(),
        });

        if also_speak {
            let context = speech_context(history);
            // registered before our own guard drops, so the chatbot never reads as idle in between
            self.spawn_speak(history_id, message, context, &token);
        }
    }

    /// Entry of the speech sub-pipeline. Decides whether translation is needed
    /// and registers the first stage; never blocks.
    fn spawn_speak(
        self: &Arc<Self>,
        history_id: String,
        message: Message,
        context: String,
        parent: &CancellationToken,
    ) {
        let ctx = self.current_context();
        if ctx.providers.speech.is_none() {
            debug!(chatbot = %self.chatbot_id, "no speech provider, skipping speech");
            return;
        }
        let token = parent.child_token();

        let detected = ctx.providers.detector.detect(&message.text);
        if detected.as_deref() == Some(ctx.speech_language.as_str()) {
            let request = SpeechRequest {
                text: strip_annotations(&message.text).trim().to_string(),
                context,
                raw_text: message.text.clone(),
            };
            self.spawn_speech(history_id, message, request, ctx, token);
            return;
        }

        debug!(
            chatbot = %self.chatbot_id,
            detected = detected.as_deref().unwrap_or("unknown"),
            target = %ctx.speech_language,
            "translating before speech"
        );
        let guard = self.tasks.register(Stage::Translation, token.clone());
        let this = self.clone();
        tokio::spawn(async move {
            this.translation_stage(history_id, message, context, ctx, token, guard)
                .await;
        });
    }

    async fn translation_stage(
        self: Arc<Self>,
        history_id: String,
        message: Message,
        context: String,
        ctx: Arc<PipelineContext>,
        token: CancellationToken,
        _guard: TaskGuard,
    ) {
        let Some(translator) = ctx.providers.translation.clone() else {
            self.abort_speech(&message, SpeakAbort::Failed(ProviderError::NotConfigured("translation")));
            return;
        };

        let outcome = self
            .run_stage(Stage::Translation, &token, || translator.translate(&message.text))
            .await;
        let translated = match outcome {
            Ok(StageOutcome::Done(text)) => text,
            Ok(StageOutcome::Cancelled) => return self.abort_speech(&message, SpeakAbort::Cancelled),
            Err(e) => return self.abort_speech(&message, SpeakAbort::Failed(e)),
        };

        let request = SpeechRequest {
            text: translated,
            context,
            raw_text: message.text.clone(),
        };
        let next = token.child_token();
        self.spawn_speech(history_id, message, request, ctx, next);
    }

    fn spawn_speech(
        self: &Arc<Self>,
        history_id: String,
        message: Message,
        request: SpeechRequest,
        ctx: Arc<PipelineContext>,
        token: CancellationToken,
    ) {
        if token.is_cancelled() {
            return self.abort_speech(&message, SpeakAbort::Cancelled);
        }
        let guard = self.tasks.register(Stage::Speech, token.clone());
        let this = self.clone();
        tokio::spawn(async move {
            this.speech_stage(history_id, message, request, ctx, token, guard)
                .await;
        });
    }

    async fn speech_stage(
        self: Arc<Self>,
        history_id: String,
        message: Message,
        request: SpeechRequest,
        ctx: Arc<PipelineContext>,
        token: CancellationToken,
        _guard: TaskGuard,
    ) {
        let Some(speaker) = ctx.providers.speech.clone() else {
            return self.abort_speech(&message, SpeakAbort::Failed(ProviderError::NotConfigured("speech")));
        };

        let outcome = self
            .run_stage(Stage::Speech, &token, || {
                speaker.synthesize(&request.text, &request.context, &request.raw_text)
            })
            .await;
        let output = match outcome {
            Ok(StageOutcome::Done(Some(output))) => output,
            Ok(StageOutcome::Done(None)) => return self.abort_speech(&message, SpeakAbort::NoAudio),
            Ok(StageOutcome::Cancelled) => return self.abort_speech(&message, SpeakAbort::Cancelled),
            Err(e) => return self.abort_speech(&message, SpeakAbort::Failed(e)),
        };

        let audio_path = match store_artifact(&output, &ctx.audio_dir, &message.id).await {
            Ok(path) => path,
            Err(e) => return self.abort_speech(&message, SpeakAbort::Artifact(e)),
        };
        if token.is_cancelled() {
            return self.abort_speech(&message, SpeakAbort::Cancelled);
        }

        info!(chatbot = %self.chatbot_id, message_id = %message.id, voice = %output.voice, "speech ready");
        self.bus.publish(Event::SpeechProduced {
            history_id,
            message,
            audio_path,
        });
    }

    fn abort_speech(&self, message: &Message, reason: SpeakAbort) {
        match reason {
            SpeakAbort::Cancelled => debug!(chatbot = %self.chatbot_id, message_id = %message.id, "speech {}", reason),
            SpeakAbort::NoAudio => info!(chatbot = %self.chatbot_id, message_id = %message.id, "speech skipped: {}", reason),
            SpeakAbort::Failed(_) | SpeakAbort::Artifact(_) => {
                warn!(chatbot = %self.chatbot_id, message_id = %message.id, "speech failed: {}", reason)
            }
        }
    }

    /// Runs one provider call with the retry policy. Cancellation is checked
    /// before each attempt, after each call and during backoff; a cancelled
    /// stage reports [`StageOutcome::Cancelled`] even if the call failed.
    async fn run_stage<T, F, Fut>(
        &self,
        stage: Stage,
        token: &CancellationToken,
        mut call: F,
    ) -> ProviderResult<StageOutcome<T>>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = ProviderResult<T>>,
    {
        let mut attempt = 0;
        let mut malformed = 0;
        loop {
            if token.is_cancelled() {
                return Ok(StageOutcome::Cancelled);
            }
            attempt += 1;
            let result = call().await;
            if token.is_cancelled() {
                return Ok(StageOutcome::Cancelled);
            }
            match result {
                Ok(value) => return Ok(StageOutcome::Done(value)),
                Err(e) if e.is_malformed() && malformed < self.retry.malformed_retries => {
                    malformed += 1;
                    warn!(chatbot = %self.chatbot_id, %stage, "{}, retrying...", e);
                }
                Err(e) if e.is_transient() && attempt < self.retry.max_attempts => {
                    warn!(chatbot = %self.chatbot_id, %stage, attempt, "{}, retrying...", e);
                    if stage == Stage::Completion {
                        self.bus.notify(
                            NotificationLevel::Warning,
                            format!("{}, retrying...", e),
                            Some(&self.chatbot_id),
                        );
                    }
                }
                Err(e) => return Err(e),
            }

            tokio::select! {
                _ = token.cancelled() => return Ok(StageOutcome::Cancelled),
                _ = tokio::time::sleep(self.retry.backoff) => {}
            }
        }
    }
}

/// The last few messages without stage directions, one per line.
fn speech_context(history: &History) -> String {
    history
        .latest_n(SPEECH_CONTEXT_WINDOW)
        .iter()
        .map(|m| strip_annotations(&m.text).trim().to_string())
        .collect::<Vec<_>>()
        .join("\n")
}

/// Moves the synthesized file to `<dir>/<message id>.<ext>`.
async fn store_artifact(output: &SpeechOutput, dir: &Path, message_id: &str) -> std::io::Result<PathBuf> {
    let ext = output
        .audio_path
        .extension()
        .and_then(|e| e.to_str())
        .unwrap_or("wav");
    tokio::fs::create_dir_all(dir).await?;
    let target = dir.join(format!("{}.{}", message_id, ext));
    if tokio::fs::rename(&output.audio_path, &target).await.is_err() {
        // rename fails across filesystems
        tokio::fs::copy(&output.audio_path, &target).await?;
        tokio::fs::remove_file(&output.audio_path).await?;
    }
    Ok(target)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entity::{ChatbotProfile, GenerationParams};
    use crate::provider::{
        CompletionProvider, LanguageDetector, SpeechProvider, TranslationProvider,
    };
    use async_trait::async_trait;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::Mutex as StdMutex;
    use tokio::sync::{broadcast, oneshot};

    /// Replies with queued results; a `Gate` reply waits for the test to release it.
    enum Reply {
        Now(ProviderResult<String>),
        Gate(oneshot::Receiver<ProviderResult<String>>),
    }

    #[derive(Default)]
    struct FakeCompletion {
        replies: StdMutex<VecDeque<Reply>>,
        calls: AtomicUsize,
    }

    impl FakeCompletion {
        fn push(&self, reply: ProviderResult<String>) {
            self.replies.lock().unwrap().push_back(Reply::Now(reply));
        }

        fn gate(&self) -> oneshot::Sender<ProviderResult<String>> {
            let (tx, rx) = oneshot::channel();
            self.replies.lock().unwrap().push_back(Reply::Gate(rx));
            tx
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl CompletionProvider for FakeCompletion {
        async fn complete(&self, _: &str, _: &[Message], _: &GenerationParams) -> ProviderResult<String> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let reply = self.replies.lock().unwrap().pop_front();
            match reply {
                Some(Reply::Now(result)) => result,
                Some(Reply::Gate(rx)) => rx
                    .await
                    .unwrap_or_else(|_| Err(ProviderError::transient("fake", "gate dropped"))),
                None => Err(ProviderError::permanent("fake", "no scripted reply")),
            }
        }
    }

    fn hold(slot: &StdMutex<Option<oneshot::Receiver<()>>>) -> oneshot::Sender<()> {
        let (tx, rx) = oneshot::channel();
        *slot.lock().unwrap() = Some(rx);
        tx
    }

    async fn wait_if_held(slot: &StdMutex<Option<oneshot::Receiver<()>>>) {
        let held = slot.lock().unwrap().take();
        if let Some(rx) = held {
            let _ = rx.await;
        }
    }

    #[derive(Default)]
    struct FakeTranslator {
        inputs: StdMutex<Vec<String>>,
        failing: AtomicBool,
        held: StdMutex<Option<oneshot::Receiver<()>>>,
    }

    #[async_trait]
    impl TranslationProvider for FakeTranslator {
        async fn translate(&self, text: &str) -> ProviderResult<String> {
            self.inputs.lock().unwrap().push(text.to_string());
            wait_if_held(&self.held).await;
            if self.failing.load(Ordering::SeqCst) {
                return Err(ProviderError::permanent("fake", "quota exceeded"));
            }
            Ok(format!("[ja] {}", text))
        }
    }

    /// Writes a small file per request, or declines when `soft_fail` is set.
    struct FakeSpeaker {
        dir: PathBuf,
        soft_fail: bool,
        requests: StdMutex<Vec<(String, String, String)>>,
        held: StdMutex<Option<oneshot::Receiver<()>>>,
    }

    #[async_trait]
    impl SpeechProvider for FakeSpeaker {
        async fn synthesize(&self, text: &str, context: &str, raw: &str) -> ProviderResult<Option<SpeechOutput>> {
            let n = {
                let mut requests = self.requests.lock().unwrap();
                requests.push((text.to_string(), context.to_string(), raw.to_string()));
                requests.len()
            };
            wait_if_held(&self.held).await;
            if self.soft_fail {
                return Ok(None);
            }
            let audio_path = self.dir.join(format!("tmp-{}.wav", n));
            std::fs::write(&audio_path, b"wav").unwrap();
            Ok(Some(SpeechOutput {
                audio_path,
                voice: "test".into(),
            }))
        }
    }

    struct FixedLanguage(&'static str);

    impl LanguageDetector for FixedLanguage {
        fn detect(&self, _: &str) -> Option<String> {
            Some(self.0.to_string())
        }
    }

    struct Harness {
        orchestrator: Arc<ChatbotOrchestrator>,
        completion: Arc<FakeCompletion>,
        translator: Arc<FakeTranslator>,
        speaker: Arc<FakeSpeaker>,
        events: broadcast::Receiver<Event>,
        history_id: String,
        audio_dir: PathBuf,
        _tmp: tempfile::TempDir,
    }

    fn harness(language: &'static str, soft_fail_speech: bool) -> Harness {
        let tmp = tempfile::tempdir().unwrap();
        let completion = Arc::new(FakeCompletion::default());
        let translator = Arc::new(FakeTranslator::default());
        let speaker = Arc::new(FakeSpeaker {
            dir: tmp.path().to_path_buf(),
            soft_fail: soft_fail_speech,
            requests: StdMutex::new(Vec::new()),
            held: StdMutex::new(None),
        });
        let audio_dir = tmp.path().join("sounds");
        let providers = ProviderSet::new(completion.clone())
            .with_translation(translator.clone())
            .with_speech(speaker.clone())
            .with_detector(Arc::new(FixedLanguage(language)));
        let (_tx, rx) = watch::channel(Arc::new(PipelineContext {
            providers,
            speech_language: "ja".into(),
            audio_dir: audio_dir.clone(),
        }));

        let data = ChatbotData::new(
            ChatbotProfile::new("Nene", "You are Nene."),
            GenerationParams::default(),
        )
        .with_id("CB1");
        let history_id = data.histories.iter().next().unwrap().id.clone();
        let bus = Arc::new(EventBus::new());
        let events = bus.subscribe();
        let retry = RetryPolicy {
            backoff: Duration::from_millis(1),
            ..RetryPolicy::default()
        };
        let orchestrator = ChatbotOrchestrator::new(data, bus, rx, retry);

        Harness {
            orchestrator,
            completion,
            translator,
            speaker,
            events,
            history_id,
            audio_dir,
            _tmp: tmp,
        }
    }

    /// Collects events until the chatbot reports idle.
    async fn until_idle(events: &mut broadcast::Receiver<Event>) -> Vec<Event> {
        let mut seen = Vec::new();
        loop {
            let event = tokio::time::timeout(Duration::from_secs(5), events.recv())
                .await
                .expect("timed out waiting for idle")
                .unwrap();
            let idle = matches!(event, Event::BusyStateChanged { busy: false, .. });
            seen.push(event);
            if idle {
                return seen;
            }
        }
    }

    fn produced(events: &[Event]) -> Vec<&Message> {
        events
            .iter()
            .filter_map(|e| match e {
                Event::MessageProduced { message, .. } => Some(message),
                _ => None,
            })
            .collect()
    }

    fn spoken(events: &[Event]) -> Vec<(&Message, &PathBuf)> {
        events
            .iter()
            .filter_map(|e| match e {
                Event::SpeechProduced { message, audio_path, .. } => Some((message, audio_path)),
                _ => None,
            })
            .collect()
    }

    async fn history_len(h: &Harness) -> usize {
        h.orchestrator.snapshot().await.histories.get(&h.history_id).unwrap().len()
    }

    async fn eventually(condition: impl Fn() -> bool) {
        for _ in 0..500 {
            if condition() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("condition never held");
    }

    async fn wait_for_calls(completion: &FakeCompletion, n: usize) {
        eventually(|| completion.calls() >= n).await;
    }

    #[tokio::test]
    async fn reply_is_appended_and_announced_once() {
        let mut h = harness("ja", false);
        h.completion.push(Ok("Hello".into()));

        h.orchestrator.receive_message(&h.history_id, false).await.unwrap();
        let events = until_idle(&mut h.events).await;

        let messages = produced(&events);
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].text, "Hello");
        assert!(!messages[0].is_user);
        assert_eq!(messages[0].sender, "Nene");
        assert_eq!(history_len(&h).await, 1);
        assert!(spoken(&events).is_empty());
    }

    #[tokio::test]
    async fn same_language_skips_translation() {
        let mut h = harness("ja", false);
        h.completion.push(Ok("こんにちは (smiles) 元気？".into()));

        h.orchestrator.receive_message(&h.history_id, true).await.unwrap();
        let events = until_idle(&mut h.events).await;

        assert!(h.translator.inputs.lock().unwrap().is_empty());
        let requests = h.speaker.requests.lock().unwrap().clone();
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].0, "こんにちは  元気？");
        assert_eq!(requests[0].2, "こんにちは (smiles) 元気？");

        let speech = spoken(&events);
        assert_eq!(speech.len(), 1);
        let (message, path) = speech[0];
        assert_eq!(*path, h.audio_dir.join(format!("{}.wav", message.id)));
        assert!(path.exists());

        // completion and speech count as one busy period
        let flips: Vec<bool> = events
            .iter()
            .filter_map(|e| match e {
                Event::BusyStateChanged { busy, .. } => Some(*busy),
                _ => None,
            })
            .collect();
        assert_eq!(flips, vec![true, false]);
    }

    #[tokio::test]
    async fn other_language_is_translated_with_context() {
        let mut h = harness("en", false);
        let user = Message::user("CB1", "How are you? (nervous)", "Me");
        h.orchestrator.append_message(&h.history_id, user).await.unwrap();
        h.completion.push(Ok("Fine (grins)".into()));

        h.orchestrator.receive_message(&h.history_id, true).await.unwrap();
        let events = until_idle(&mut h.events).await;

        assert_eq!(*h.translator.inputs.lock().unwrap(), vec!["Fine (grins)".to_string()]);
        let requests = h.speaker.requests.lock().unwrap().clone();
        assert_eq!(requests.len(), 1);
        let (text, context, raw) = &requests[0];
        assert_eq!(text, "[ja] Fine (grins)");
        assert_eq!(context, "How are you?\nFine");
        assert_eq!(raw, "Fine (grins)");
        assert_eq!(spoken(&events).len(), 1);
    }

    #[tokio::test]
    async fn stop_before_reply_discards_it() {
        let mut h = harness("ja", false);
        let gate = h.completion.gate();

        h.orchestrator.receive_message(&h.history_id, true).await.unwrap();
        wait_for_calls(&h.completion, 1).await;
        h.orchestrator.stop_generate().await;
        gate.send(Ok("too late".into())).unwrap();

        let events = until_idle(&mut h.events).await;
        assert!(produced(&events).is_empty());
        assert!(spoken(&events).is_empty());
        assert_eq!(history_len(&h).await, 0);
    }

    #[tokio::test]
    async fn new_message_supersedes_pipeline_in_flight() {
        let mut h = harness("ja", false);
        let first = h.completion.gate();
        h.completion.push(Ok("second".into()));

        h.orchestrator.receive_message(&h.history_id, false).await.unwrap();
        wait_for_calls(&h.completion, 1).await;
        h.orchestrator.receive_message(&h.history_id, false).await.unwrap();
        wait_for_calls(&h.completion, 2).await;
        first.send(Ok("first".into())).unwrap();

        // wait for both tasks to finish
        let mut events = Vec::new();
        while h.orchestrator.is_busy() || events.is_empty() {
            events.extend(until_idle(&mut h.events).await);
        }

        let messages = produced(&events);
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].text, "second");
        assert_eq!(history_len(&h).await, 1);
    }

    #[tokio::test]
    async fn transient_failure_is_retried() {
        let mut h = harness("ja", false);
        h.completion.push(Err(ProviderError::transient("fake", "connection refused")));
        h.completion.push(Ok("recovered".into()));

        h.orchestrator.receive_message(&h.history_id, false).await.unwrap();
        let events = until_idle(&mut h.events).await;

        assert_eq!(h.completion.calls(), 2);
        assert_eq!(produced(&events)[0].text, "recovered");
    }

    #[tokio::test]
    async fn malformed_response_is_retried_once() {
        let mut h = harness("ja", false);
        h.completion.push(Err(ProviderError::malformed("fake", "bad json")));
        h.completion.push(Err(ProviderError::malformed("fake", "bad json")));
        h.completion.push(Ok("never reached".into()));

        h.orchestrator.receive_message(&h.history_id, false).await.unwrap();
        let events = until_idle(&mut h.events).await;

        assert_eq!(h.completion.calls(), 2);
        assert!(produced(&events).is_empty());
    }

    #[tokio::test]
    async fn permanent_failure_is_reported_without_append() {
        let mut h = harness("ja", false);
        h.completion.push(Err(ProviderError::permanent("fake", "invalid api key")));

        h.orchestrator.receive_message(&h.history_id, false).await.unwrap();
        let events = until_idle(&mut h.events).await;

        assert_eq!(h.completion.calls(), 1);
        assert!(produced(&events).is_empty());
        assert!(events.iter().any(|e| matches!(
            e,
            Event::Notification { level: NotificationLevel::Error, .. }
        )));
        assert_eq!(history_len(&h).await, 0);
    }

    #[tokio::test]
    async fn speech_soft_failure_keeps_text() {
        let mut h = harness("ja", true);
        h.completion.push(Ok("はい".into()));

        h.orchestrator.receive_message(&h.history_id, true).await.unwrap();
        let events = until_idle(&mut h.events).await;

        assert_eq!(produced(&events).len(), 1);
        assert!(spoken(&events).is_empty());
        assert_eq!(h.speaker.requests.lock().unwrap().len(), 1);
        assert_eq!(history_len(&h).await, 1);
    }

    #[tokio::test]
    async fn speak_it_replays_existing_message() {
        let mut h = harness("ja", false);
        let message = Message::new("CB1", "またね", Utc::now(), false, "Nene");
        h.orchestrator
            .append_message(&h.history_id, message.clone())
            .await
            .unwrap();

        h.orchestrator.speak_it(&h.history_id, message.clone()).await.unwrap();
        let events = until_idle(&mut h.events).await;

        let speech = spoken(&events);
        assert_eq!(speech.len(), 1);
        assert_eq!(*speech[0].0, message);
        assert_eq!(h.completion.calls(), 0);
    }

    #[tokio::test]
    async fn unknown_history_is_not_found() {
        let h = harness("ja", false);
        let err = h.orchestrator.receive_message("HDmissing", false).await.unwrap_err();
        assert!(matches!(err, ChatbotError::HistoryNotFound(_)));
        assert!(!h.orchestrator.is_busy());
    }

    #[tokio::test]
    async fn resend_truncates_then_replies() {
        let mut h = harness("ja", false);
        let base = Utc::now();
        let question = Message::new("CB1", "question", base, true, "Me");
        let old_answer = Message::new("CB1", "old answer", base + chrono::Duration::seconds(1), false, "Nene");
        h.orchestrator.append_message(&h.history_id, question.clone()).await.unwrap();
        h.orchestrator.append_message(&h.history_id, old_answer.clone()).await.unwrap();
        h.completion.push(Ok("new answer".into()));

        h.orchestrator.resend(&h.history_id, &question.id, false).await.unwrap();
        until_idle(&mut h.events).await;

        let data = h.orchestrator.snapshot().await;
        let texts: Vec<_> = data
            .histories
            .get(&h.history_id)
            .unwrap()
            .messages()
            .iter()
            .map(|m| m.text.clone())
            .collect();
        assert_eq!(texts, ["question", "new answer"]);
    }

    #[tokio::test]
    async fn appending_same_message_twice_is_noop() {
        let h = harness("ja", false);
        let message = Message::user("CB1", "hi", "Me");
        h.orchestrator.append_message(&h.history_id, message.clone()).await.unwrap();
        h.orchestrator.append_message(&h.history_id, message).await.unwrap();
        assert_eq!(history_len(&h).await, 1);
    }

    #[tokio::test]
    async fn delete_and_update_edit_live_data() {
        let h = harness("ja", false);
        let message = Message::user("CB1", "typo", "Me");
        h.orchestrator.append_message(&h.history_id, message.clone()).await.unwrap();

        let removed = h.orchestrator.delete_message(&h.history_id, &message.id).await.unwrap();
        assert_eq!(removed, message);
        let err = h.orchestrator.delete_message(&h.history_id, &message.id).await.unwrap_err();
        assert!(matches!(err, ChatbotError::MessageNotFound(_)));

        let mut edited = h.orchestrator.snapshot().await;
        edited.profile.system_prompt = "Be brief.".into();
        h.orchestrator.update_data(&edited).await;
        assert_eq!(h.orchestrator.snapshot().await.profile.system_prompt, "Be brief.");
    }

    #[tokio::test]
    async fn translation_failure_skips_speech() {
        let mut h = harness("en", false);
        h.translator.failing.store(true, Ordering::SeqCst);
        h.completion.push(Ok("Fine".into()));

        h.orchestrator.receive_message(&h.history_id, true).await.unwrap();
        let events = until_idle(&mut h.events).await;

        assert_eq!(h.translator.inputs.lock().unwrap().len(), 1);
        assert!(h.speaker.requests.lock().unwrap().is_empty());
        assert!(spoken(&events).is_empty());
        assert_eq!(produced(&events).len(), 1);
        // speech problems never reach the user
        assert!(!events.iter().any(|e| matches!(e, Event::Notification { .. })));
    }

    #[tokio::test]
    async fn stop_during_translation_skips_speech() {
        let mut h = harness("en", false);
        let release = hold(&h.translator.held);
        h.completion.push(Ok("Fine".into()));

        h.orchestrator.receive_message(&h.history_id, true).await.unwrap();
        let translator = h.translator.clone();
        eventually(|| translator.inputs.lock().unwrap().len() == 1).await;
        h.orchestrator.stop_generate().await;
        release.send(()).unwrap();

        let events = until_idle(&mut h.events).await;
        assert_eq!(produced(&events).len(), 1);
        assert!(h.speaker.requests.lock().unwrap().is_empty());
        assert!(spoken(&events).is_empty());
    }

    #[tokio::test]
    async fn stop_during_speech_discards_audio() {
        let mut h = harness("ja", false);
        let release = hold(&h.speaker.held);
        h.completion.push(Ok("はい".into()));

        h.orchestrator.receive_message(&h.history_id, true).await.unwrap();
        let speaker = h.speaker.clone();
        eventually(|| speaker.requests.lock().unwrap().len() == 1).await;
        assert!(h.orchestrator.is_busy());
        h.orchestrator.stop_generate().await;
        release.send(()).unwrap();

        let events = until_idle(&mut h.events).await;
        assert_eq!(produced(&events).len(), 1);
        assert!(spoken(&events).is_empty());
        assert!(!h.audio_dir.exists());
    }
}
