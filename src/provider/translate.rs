//! Translation adapters. Each one translates into a fixed target language chosen
//! at configuration time.

use super::completion::OpenAiCompletion;
use super::{ProviderResult, TranslationProvider};
use crate::chat::strip_annotations;
use crate::entity::GenerationParams;
use crate::error::ProviderError;
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use md5::Md5;
use sha2::{Digest, Sha256};
use tracing::debug;

/// Reads the body, maps non-success statuses and decodes JSON.
async fn read_json<T: DeserializeOwned>(
    provider: &str,
    response: Result<reqwest::Response, reqwest::Error>,
) -> ProviderResult<T> {
    let response = response.map_err(|e| ProviderError::from_reqwest(provider, e))?;
    let status = response.status();
    let text = response
        .text()
        .await
        .map_err(|e| ProviderError::from_reqwest(provider, e))?;
    if !status.is_success() {
        return Err(ProviderError::from_status(provider, status, &text));
    }
    serde_json::from_str(&text).map_err(|e| ProviderError::malformed(provider, e))
}

// --- Google Cloud Translation v2 ---

pub struct GoogleTranslator {
    client: reqwest::Client,
    api_key: String,
    target: String,
    endpoint: String,
}

#[derive(Deserialize)]
struct GoogleResponse {
    data: GoogleData,
}

#[derive(Deserialize)]
struct GoogleData {
    translations: Vec<GoogleTranslation>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct GoogleTranslation {
    translated_text: String,
}

impl GoogleTranslator {
    pub fn new(client: reqwest::Client, api_key: &str, target: &str) -> Self {
        Self {
            client,
            api_key: api_key.to_string(),
            target: target.to_string(),
            endpoint: "https://translation.googleapis.com/language/translate/v2".to_string(),
        }
    }

    pub fn with_endpoint(mut self, endpoint: &str) -> Self {
        self.endpoint = endpoint.to_string();
        self
    }
}

#[async_trait]
impl TranslationProvider for GoogleTranslator {
    async fn translate(&self, text: &str) -> ProviderResult<String> {
        let response = self
            .client
            .get(&self.endpoint)
            .query(&[
                ("key", self.api_key.as_str()),
                ("q", text),
                ("target", self.target.as_str()),
                ("format", "text"),
                ("model", "base"),
            ])
            .send()
            .await;
        let parsed: GoogleResponse = read_json("google", response).await?;
        parsed
            .data
            .translations
            .into_iter()
            .next()
            .map(|t| t.translated_text)
            .ok_or_else(|| ProviderError::malformed("google", "no translations"))
    }
}

// --- DeepL ---

pub struct DeeplTranslator {
    client: reqwest::Client,
    api_key: String,
    target: String,
    endpoint: String,
}

#[derive(Deserialize)]
struct DeeplResponse {
    translations: Vec<DeeplTranslation>,
}

#[derive(Deserialize)]
struct DeeplTranslation {
    text: String,
}

impl DeeplTranslator {
    pub fn new(client: reqwest::Client, api_key: &str, target: &str) -> Self {
        // Free-tier keys end in ":fx" and live on a separate host
        let endpoint = if api_key.ends_with(":fx") {
            "https://api-free.deepl.com/v2/translate"
        } else {
            "https://api.deepl.com/v2/translate"
        };
        Self {
            client,
            api_key: api_key.to_string(),
            target: target.to_uppercase(),
            endpoint: endpoint.to_string(),
        }
    }

    pub fn with_endpoint(mut self, endpoint: &str) -> Self {
        self.endpoint = endpoint.to_string();
        self
    }
}

#[async_trait]
impl TranslationProvider for DeeplTranslator {
    async fn translate(&self, text: &str) -> ProviderResult<String> {
        let response = self
            .client
            .post(&self.endpoint)
            .header("Authorization", format!("DeepL-Auth-Key {}", self.api_key))
            .form(&[("text", text), ("target_lang", self.target.as_str())])
            .send()
            .await;
        let parsed: DeeplResponse = read_json("deepl", response).await?;
        parsed
            .translations
            .into_iter()
            .next()
            .map(|t| t.text)
            .ok_or_else(|| ProviderError::malformed("deepl", "no translations"))
    }
}

// --- Youdao ---

pub struct YoudaoTranslator {
    client: reqwest::Client,
    app_id: String,
    app_key: String,
    target: String,
    endpoint: String,
}

#[derive(Deserialize)]
struct YoudaoResponse {
    #[serde(rename = "errorCode")]
    error_code: String,
    #[serde(default)]
    translation: Vec<String>,
}

impl YoudaoTranslator {
    pub fn new(client: reqwest::Client, app_id: &str, app_key: &str, target: &str) -> Self {
        Self {
            client,
            app_id: app_id.to_string(),
            app_key: app_key.to_string(),
            target: target.to_string(),
            endpoint: "https://openapi.youdao.com/api".to_string(),
        }
    }

    pub fn with_endpoint(mut self, endpoint: &str) -> Self {
        self.endpoint = endpoint.to_string();
        self
    }

    /// v3 signature: sha256(appId + input + salt + curtime + appKey), where input is
    /// the text itself up to 20 chars, otherwise first 10 + char count + last 10.
    fn sign(&self, text: &str, salt: &str, curtime: &str) -> String {
        let chars: Vec<char> = text.chars().collect();
        let input = if chars.len() > 20 {
            let head: String = chars[..10].iter().collect();
            let tail: String = chars[chars.len() - 10..].iter().collect();
            format!("{}{}{}", head, chars.len(), tail)
        } else {
            text.to_string()
        };
        let digest = Sha256::digest(
            format!("{}{}{}{}{}", self.app_id, input, salt, curtime, self.app_key).as_bytes(),
        );
        hex::encode(digest)
    }
}

#[async_trait]
impl TranslationProvider for YoudaoTranslator {
    async fn translate(&self, text: &str) -> ProviderResult<String> {
        let salt = uuid::Uuid::new_v4().simple().to_string();
        let curtime = chrono::Utc::now().timestamp().to_string();
        let sign = self.sign(text, &salt, &curtime);
        let response = self
            .client
            .get(&self.endpoint)
            .query(&[
                ("q", text),
                ("from", "auto"),
                ("to", self.target.as_str()),
                ("appKey", self.app_id.as_str()),
                ("salt", salt.as_str()),
                ("sign", sign.as_str()),
                ("signType", "v3"),
                ("curtime", curtime.as_str()),
            ])
            .send()
            .await;
        let parsed: YoudaoResponse = read_json("youdao", response).await?;
        if parsed.error_code != "0" {
            return Err(ProviderError::permanent(
                "youdao",
                format!("error code {}", parsed.error_code),
            ));
        }
        parsed
            .translation
            .into_iter()
            .next()
            .ok_or_else(|| ProviderError::malformed("youdao", "no translation"))
    }
}

// --- Baidu ---

pub struct BaiduTranslator {
    client: reqwest::Client,
    app_id: String,
    app_key: String,
    target: String,
    endpoint: String,
}

#[derive(Deserialize)]
struct BaiduResponse {
    error_code: Option<String>,
    error_msg: Option<String>,
    #[serde(default)]
    trans_result: Vec<BaiduTranslation>,
}

#[derive(Deserialize)]
struct BaiduTranslation {
    dst: String,
}

/// Baidu uses its own codes for a handful of languages.
fn baidu_language(iso: &str) -> &str {
    match iso {
        "ja" => "jp",
        "ko" => "kor",
        "fr" => "fra",
        "es" => "spa",
        "ar" => "ara",
        "vi" => "vie",
        other => other,
    }
}

impl BaiduTranslator {
    pub fn new(client: reqwest::Client, app_id: &str, app_key: &str, target: &str) -> Self {
        Self {
            client,
            app_id: app_id.to_string(),
            app_key: app_key.to_string(),
            target: baidu_language(target).to_string(),
            endpoint: "https://fanyi-api.baidu.com/api/trans/vip/translate".to_string(),
        }
    }

    pub fn with_endpoint(mut self, endpoint: &str) -> Self {
        self.endpoint = endpoint.to_string();
        self
    }

    /// md5(appid + q + salt + key), lowercase hex.
    fn sign(&self, text: &str, salt: &str) -> String {
        let digest = Md5::digest(format!("{}{}{}{}", self.app_id, text, salt, self.app_key).as_bytes());
        hex::encode(digest)
    }
}

#[async_trait]
impl TranslationProvider for BaiduTranslator {
    async fn translate(&self, text: &str) -> ProviderResult<String> {
        let salt = chrono::Utc::now().timestamp_millis().to_string();
        let sign = self.sign(text, &salt);
        let response = self
            .client
            .post(&self.endpoint)
            .form(&[
                ("q", text),
                ("from", "auto"),
                ("to", self.target.as_str()),
                ("appid", self.app_id.as_str()),
                ("salt", salt.as_str()),
                ("sign", sign.as_str()),
            ])
            .send()
            .await;
        let parsed: BaiduResponse = read_json("baidu", response).await?;
        if let Some(code) = parsed.error_code.filter(|c| c != "52000") {
            let message = format!("error {}: {}", code, parsed.error_msg.unwrap_or_default());
            // 52001 timeout, 52002 server error, 54003 rate limited
            return Err(match code.as_str() {
                "52001" | "52002" | "54003" => ProviderError::transient("baidu", message),
                _ => ProviderError::permanent("baidu", message),
            });
        }
        let lines: Vec<String> = parsed.trans_result.into_iter().map(|t| t.dst).collect();
        if lines.is_empty() {
            return Err(ProviderError::malformed("baidu", "no trans_result"));
        }
        // one entry per input line
        Ok(lines.join("\n"))
    }
}

// --- Completion model used as a translator ---

pub struct OpenAiTranslator {
    completion: OpenAiCompletion,
    params: GenerationParams,
    target: String,
}

impl OpenAiTranslator {
    pub fn new(completion: OpenAiCompletion, model: &str, target: &str) -> Self {
        Self {
            completion,
            params: GenerationParams {
                model: model.to_string(),
                ..GenerationParams::default()
            },
            target: target.to_string(),
        }
    }
}

#[async_trait]
impl TranslationProvider for OpenAiTranslator {
    async fn translate(&self, text: &str) -> ProviderResult<String> {
        let system = format!(
            "Translate everything the user sends into the language with ISO 639-1 code '{}'. \
             Keep the speaker's tone natural and conversational. \
             Reply with the translation only.",
            self.target
        );
        debug!("translating {} chars via completion model", text.len());
        let translated = self
            .completion
            .chat(&system, &[(true, text)], &self.params)
            .await?;
        Ok(strip_annotations(&translated).trim().to_string())
    }
}
