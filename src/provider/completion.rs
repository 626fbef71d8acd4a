use super::{CompletionProvider, ProviderResult};
use crate::chat::Message;
use crate::entity::GenerationParams;
use crate::error::ProviderError;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::debug;

const PROVIDER: &str = "openai";

/// Client for any server exposing the OpenAI `/chat/completions` endpoint.
#[derive(Clone)]
pub struct OpenAiCompletion {
    client: reqwest::Client,
    api_key: String,
    base_url: String,
}

#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<WireMessage<'a>>,
    temperature: f32,
    top_p: f32,
    frequency_penalty: f32,
    presence_penalty: f32,
    max_tokens: u32,
}

#[derive(Debug, Serialize)]
struct WireMessage<'a> {
    role: &'static str,
    content: &'a str,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    choices: Vec<Choice>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: ChoiceMessage,
}

#[derive(Debug, Deserialize)]
struct ChoiceMessage {
    content: Option<String>,
}

impl OpenAiCompletion {
    pub fn new(client: reqwest::Client, api_key: &str) -> Self {
        Self {
            client,
            api_key: api_key.to_string(),
            base_url: "https://api.openai.com/v1".to_string(),
        }
    }

    pub fn with_base_url(mut self, base_url: &str) -> Self {
        self.base_url = base_url.trim_end_matches('/').to_string();
        self
    }

    /// Sends an already assembled conversation. Shared with the translator that
    /// rides on the same endpoint.
    pub(crate) async fn chat(
        &self,
        system_prompt: &str,
        turns: &[(bool, &str)],
        params: &GenerationParams,
    ) -> ProviderResult<String> {
        let mut messages = Vec::with_capacity(turns.len() + 1);
        if !system_prompt.is_empty() {
            messages.push(WireMessage {
                role: "system",
                content: system_prompt,
            });
        }
        messages.extend(turns.iter().map(|(is_user, content)| WireMessage {
            role: if *is_user { "user" } else { "assistant" },
            content: *content,
        }));

        let body = ChatRequest {
            model: &params.model,
            messages,
            temperature: params.temperature,
            top_p: params.top_p,
            frequency_penalty: params.frequency_penalty,
            presence_penalty: params.presence_penalty,
            max_tokens: params.max_tokens,
        };

        let url = format!("{}/chat/completions", self.base_url);
        debug!("-> POST {} ({} messages)", url, body.messages.len());

        let response = self
            .client
            .post(&url)
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| ProviderError::from_reqwest(PROVIDER, e))?;

        let status = response.status();
        let text = response
            .text()
            .await
            .map_err(|e| ProviderError::from_reqwest(PROVIDER, e))?;
        if !status.is_success() {
            return Err(ProviderError::from_status(PROVIDER, status, &text));
        }

        let parsed: ChatResponse =
            serde_json::from_str(&text).map_err(|e| ProviderError::malformed(PROVIDER, e))?;
        parsed
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .ok_or_else(|| ProviderError::malformed(PROVIDER, "response has no message content"))
    }
}

#[async_trait]
impl CompletionProvider for OpenAiCompletion {
    async fn complete(
        &self,
        system_prompt: &str,
        messages: &[Message],
        params: &GenerationParams,
    ) -> ProviderResult<String> {
        let turns: Vec<(bool, &str)> = messages
            .iter()
            .map(|m| (m.is_user, m.text.as_str()))
            .collect();
        self.chat(system_prompt, &turns, params).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wiremock::matchers::{body_partial_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn adapter(server: &MockServer) -> OpenAiCompletion {
        OpenAiCompletion::new(reqwest::Client::new(), "test-key").with_base_url(&server.uri())
    }

    fn history() -> Vec<Message> {
        vec![
            Message::user("CB1", "Hi", "Me"),
            Message::new("CB1", "Hello!", chrono::Utc::now(), false, "Nene"),
        ]
    }

    #[tokio::test]
    async fn sends_system_prompt_history_and_params() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .and(header("authorization", "Bearer test-key"))
            .and(body_partial_json(json!({
                "model": "gpt-3.5-turbo",
                "max_tokens": 512,
                "messages": [
                    {"role": "system", "content": "You are Nene."},
                    {"role": "user", "content": "Hi"},
                    {"role": "assistant", "content": "Hello!"}
                ]
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "choices": [{"index": 0, "message": {"role": "assistant", "content": "How are you?"}}]
            })))
            .expect(1)
            .mount(&server)
            .await;

        let reply = adapter(&server)
            .complete("You are Nene.", &history(), &GenerationParams::default())
            .await
            .unwrap();
        assert_eq!(reply, "How are you?");
    }

    #[tokio::test]
    async fn auth_failure_is_permanent() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(401).set_body_string("bad key"))
            .mount(&server)
            .await;

        let err = adapter(&server)
            .complete("", &history(), &GenerationParams::default())
            .await
            .unwrap_err();
        assert!(matches!(err, ProviderError::Permanent { .. }), "{err}");
    }

    #[tokio::test]
    async fn rate_limit_is_transient() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(429))
            .mount(&server)
            .await;

        let err = adapter(&server)
            .complete("", &history(), &GenerationParams::default())
            .await
            .unwrap_err();
        assert!(err.is_transient());
    }

    #[tokio::test]
    async fn garbage_body_is_malformed() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_string("not json"))
            .mount(&server)
            .await;

        let err = adapter(&server)
            .complete("", &history(), &GenerationParams::default())
            .await
            .unwrap_err();
        assert!(err.is_malformed());
    }
}
