//! Capability providers: completion, translation, speech synthesis and language detection.
//!
//! The orchestrator only sees the traits. Concrete adapters are picked once from
//! [`AppConfig`] by [`ProviderSet::from_config`].

pub mod completion;
pub mod language;
pub mod speech;
pub mod translate;

use crate::chat::Message;
use crate::config::{AppConfig, SpeechConfig, TranslatorConfig};
use crate::entity::GenerationParams;
use crate::error::ProviderError;
use async_trait::async_trait;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

pub type ProviderResult<T> = std::result::Result<T, ProviderError>;

#[async_trait]
pub trait CompletionProvider: Send + Sync {
    /// Produces the assistant's next reply. `messages` is oldest first.
    async fn complete(
        &self,
        system_prompt: &str,
        messages: &[Message],
        params: &GenerationParams,
    ) -> ProviderResult<String>;
}

#[async_trait]
pub trait TranslationProvider: Send + Sync {
    async fn translate(&self, text: &str) -> ProviderResult<String>;
}

/// Audio produced by a [`SpeechProvider`].
#[derive(Debug, Clone, PartialEq)]
pub struct SpeechOutput {
    pub audio_path: PathBuf,
    /// Which voice or emotion preset the server used.
    pub voice: String,
}

#[async_trait]
pub trait SpeechProvider: Send + Sync {
    /// `Ok(None)` means the service declined without raising an error
    /// (e.g. it answered with a non-success status).
    async fn synthesize(
        &self,
        text: &str,
        context: &str,
        raw_text: &str,
    ) -> ProviderResult<Option<SpeechOutput>>;
}

pub trait LanguageDetector: Send + Sync {
    /// ISO 639-1 code, or `None` when the text gives nothing to go on.
    fn detect(&self, text: &str) -> Option<String>;
}

/// Completion provider used when no API key is configured.
struct Unconfigured;

#[async_trait]
impl CompletionProvider for Unconfigured {
    async fn complete(&self, _: &str, _: &[Message], _: &GenerationParams) -> ProviderResult<String> {
        Err(ProviderError::NotConfigured("completion"))
    }
}

/// The providers in effect at one point in time. Never mutated: reconfiguration
/// builds a new set and swaps it in.
#[derive(Clone)]
pub struct ProviderSet {
    pub completion: Arc<dyn CompletionProvider>,
    pub translation: Option<Arc<dyn TranslationProvider>>,
    pub speech: Option<Arc<dyn SpeechProvider>>,
    pub detector: Arc<dyn LanguageDetector>,
}

impl ProviderSet {
    pub fn new(completion: Arc<dyn CompletionProvider>) -> Self {
        Self {
            completion,
            translation: None,
            speech: None,
            detector: Arc::new(language::ScriptDetector),
        }
    }

    pub fn with_translation(mut self, translation: Arc<dyn TranslationProvider>) -> Self {
        self.translation = Some(translation);
        self
    }

    pub fn with_speech(mut self, speech: Arc<dyn SpeechProvider>) -> Self {
        self.speech = Some(speech);
        self
    }

    pub fn with_detector(mut self, detector: Arc<dyn LanguageDetector>) -> Self {
        self.detector = detector;
        self
    }

    pub fn from_config(config: &AppConfig) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(120))
            .connect_timeout(Duration::from_secs(10))
            .build()?;

        let completion: Arc<dyn CompletionProvider> = if config.completion.api_key.is_empty() {
            Arc::new(Unconfigured)
        } else {
            Arc::new(
                completion::OpenAiCompletion::new(client.clone(), &config.completion.api_key)
                    .with_base_url(&config.completion.base_url),
            )
        };
        let mut set = Self::new(completion);

        let target = config.speech_language.as_str();
        set.translation = config.translator.as_ref().map(|translator| {
            let provider: Arc<dyn TranslationProvider> = match translator {
                TranslatorConfig::Google { api_key } => {
                    Arc::new(translate::GoogleTranslator::new(client.clone(), api_key, target))
                }
                TranslatorConfig::Deepl { api_key } => {
                    Arc::new(translate::DeeplTranslator::new(client.clone(), api_key, target))
                }
                TranslatorConfig::Youdao { app_id, app_key } => Arc::new(
                    translate::YoudaoTranslator::new(client.clone(), app_id, app_key, target),
                ),
                TranslatorConfig::Baidu { app_id, app_key } => Arc::new(
                    translate::BaiduTranslator::new(client.clone(), app_id, app_key, target),
                ),
                TranslatorConfig::Openai { model } => Arc::new(translate::OpenAiTranslator::new(
                    completion::OpenAiCompletion::new(client.clone(), &config.completion.api_key)
                        .with_base_url(&config.completion.base_url),
                    model,
                    target,
                )),
            };
            provider
        });

        set.speech = config.speech.as_ref().map(|speech| {
            let provider: Arc<dyn SpeechProvider> = match speech {
                SpeechConfig::VitsSimpleApi { speaker_id, .. } => Arc::new(speech::VitsSimpleApi::new(
                    client.clone(),
                    speech.base_url(),
                    *speaker_id,
                    target,
                    config.audio_dir.clone(),
                )),
            };
            provider
        });

        Ok(set)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn missing_api_key_yields_unconfigured_completion() {
        let set = ProviderSet::from_config(&AppConfig::default()).unwrap();
        let err = set
            .completion
            .complete("", &[], &GenerationParams::default())
            .await
            .unwrap_err();
        assert!(matches!(err, ProviderError::NotConfigured("completion")));
        assert!(set.translation.is_none());
        assert!(set.speech.is_none());
    }

    #[test]
    fn configured_capabilities_are_built() {
        let config = AppConfig {
            translator: Some(TranslatorConfig::Google {
                api_key: "k".into(),
            }),
            speech: Some(SpeechConfig::VitsSimpleApi {
                address: "localhost".into(),
                port: 23456,
                speaker_id: 0,
            }),
            ..AppConfig::default()
        };
        let set = ProviderSet::from_config(&config).unwrap();
        assert!(set.translation.is_some());
        assert!(set.speech.is_some());
    }
}
