use super::{ProviderResult, SpeechOutput, SpeechProvider};
use crate::error::ProviderError;
use async_trait::async_trait;
use reqwest::multipart::Form;
use std::path::PathBuf;
use tracing::{debug, warn};

const PROVIDER: &str = "vits-simple-api";

/// Client for a vits-simple-api server (`POST /voice/vits`, multipart form).
pub struct VitsSimpleApi {
    client: reqwest::Client,
    base_url: String,
    speaker_id: u32,
    lang: String,
    out_dir: PathBuf,
}

impl VitsSimpleApi {
    pub fn new(
        client: reqwest::Client,
        base_url: String,
        speaker_id: u32,
        lang: &str,
        out_dir: PathBuf,
    ) -> Self {
        Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            speaker_id,
            lang: lang.to_string(),
            out_dir,
        }
    }
}

/// Pulls `filename=...` out of a Content-Disposition header.
fn disposition_filename(header: &str) -> Option<String> {
    let (_, rest) = header.split_once("filename=")?;
    let name = rest.split(';').next()?.trim().trim_matches('"');
    // only keep the last path component the server hands us
    let name = name.rsplit(['/', '\\']).next()?;
    (!name.is_empty()).then(|| name.to_string())
}

#[async_trait]
impl SpeechProvider for VitsSimpleApi {
    async fn synthesize(
        &self,
        text: &str,
        context: &str,
        raw_text: &str,
    ) -> ProviderResult<Option<SpeechOutput>> {
        debug!(
            context_chars = context.len(),
            raw_chars = raw_text.len(),
            "requesting speech for {} chars",
            text.len()
        );
        // context and raw_text let the server pick a delivery; plain vits ignores them
        let form = Form::new()
            .text("text", text.to_string())
            .text("context", context.to_string())
            .text("raw_text", raw_text.to_string())
            .text("id", self.speaker_id.to_string())
            .text("format", "wav")
            .text("lang", self.lang.clone())
            .text("length", "1")
            .text("noise", "0.667")
            .text("noisew", "0.8")
            .text("max", "50");

        let url = format!("{}/voice/vits", self.base_url);
        let response = self
            .client
            .post(&url)
            .multipart(form)
            .send()
            .await
            .map_err(|e| ProviderError::from_reqwest(PROVIDER, e))?;

        if !response.status().is_success() {
            warn!("[{}] status code {}, please check the server", PROVIDER, response.status());
            return Ok(None);
        }

        let file_name = response
            .headers()
            .get(reqwest::header::CONTENT_DISPOSITION)
            .and_then(|v| v.to_str().ok())
            .and_then(disposition_filename)
            .unwrap_or_else(|| format!("{}.wav", uuid::Uuid::new_v4().simple()));
        let bytes = response
            .bytes()
            .await
            .map_err(|e| ProviderError::from_reqwest(PROVIDER, e))?;

        tokio::fs::create_dir_all(&self.out_dir)
            .await
            .map_err(|e| ProviderError::permanent(PROVIDER, format!("create audio dir: {e}")))?;
        let audio_path = self.out_dir.join(file_name);
        tokio::fs::write(&audio_path, &bytes)
            .await
            .map_err(|e| ProviderError::permanent(PROVIDER, format!("write audio: {e}")))?;

        Ok(Some(SpeechOutput {
            audio_path,
            voice: format!("vits:{}", self.speaker_id),
        }))
    }
}
