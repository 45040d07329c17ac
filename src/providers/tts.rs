//! OpenAI-compatible speech synthesis backend (`/audio/speech`).

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use reqwest::Client as HttpClient;
use serde_json::json;

use super::errors::ProviderError;
use super::traits::{ProviderFactory, ProviderHandle, TtsProvider};
use super::types::{
    AudioData, AudioStream, ConfigField, FieldType, ProviderDescriptor, ProviderFamily, TtsRequest,
};

const REQUEST_TIMEOUT_SECS: u64 = 60;

pub const KIND: &str = "openai_tts";

pub fn descriptor() -> ProviderDescriptor {
    ProviderDescriptor {
        kind: KIND.to_string(),
        family: ProviderFamily::Tts,
        display_name: "OpenAI-compatible speech".to_string(),
        fields: vec![
            ConfigField::new("base_url", FieldType::String, "API base URL")
                .with_default(json!("https://api.openai.com/v1")),
            ConfigField::new("api_key", FieldType::Secret, "Bearer token"),
            ConfigField::new("model", FieldType::String, "Speech model")
                .with_default(json!("tts-1")),
            ConfigField::new("voice", FieldType::String, "Default voice")
                .with_default(json!("alloy")),
            ConfigField::new("format", FieldType::String, "mp3, opus, aac, flac, wav or pcm")
                .with_default(json!("mp3")),
        ],
    }
}

pub fn factory() -> ProviderFactory {
    Arc::new(|config: &serde_json::Value| -> Result<ProviderHandle, ProviderError> {
        let provider = OpenAiTtsProvider::from_config(config)?;
        Ok(ProviderHandle::Tts(Arc::new(provider)))
    })
}

pub struct OpenAiTtsProvider {
    http: HttpClient,
    base_url: String,
    api_key: Option<String>,
    model: String,
    voice: String,
    format: String,
}

impl OpenAiTtsProvider {
    pub fn from_config(config: &serde_json::Value) -> Result<Self, ProviderError> {
        let text = |key: &str, default: &str| {
            config
                .get(key)
                .and_then(|v| v.as_str())
                .filter(|s| !s.is_empty())
                .unwrap_or(default)
                .to_string()
        };
        let base_url = text("base_url", "https://api.openai.com/v1")
            .trim_end_matches('/')
            .to_string();

        let http = HttpClient::builder()
            .timeout(Duration::from_secs(REQUEST_TIMEOUT_SECS))
            .build()
            .map_err(|e| ProviderError::ConnectionFailed {
                endpoint: base_url.clone(),
                reason: format!("failed to build HTTP client: {e}"),
            })?;

        Ok(Self {
            http,
            api_key: config
                .get("api_key")
                .and_then(|v| v.as_str())
                .filter(|k| !k.is_empty())
                .map(String::from),
            model: text("model", "tts-1"),
            voice: text("voice", "alloy"),
            format: text("format", "mp3"),
            base_url,
        })
    }

    fn mime_type(&self) -> &'static str {
        mime_for_format(&self.format)
    }

    async fn send(&self, request: &TtsRequest) -> Result<reqwest::Response, ProviderError> {
        let url = format!("{}/audio/speech", self.base_url);
        let mut body = json!({
            "model": self.model,
            "input": request.text,
            "voice": request.voice.as_deref().unwrap_or(&self.voice),
            "response_format": self.format,
        });
        if let Some(speed) = request.speed {
            body["speed"] = json!(speed);
        }

        tracing::debug!(url = %url, chars = request.text.chars().count(), "TTS request");

        let mut builder = self.http.post(&url).json(&body);
        if let Some(key) = &self.api_key {
            builder = builder.bearer_auth(key);
        }
        let response = builder
            .send()
            .await
            .map_err(|e| ProviderError::from_reqwest(&url, e, REQUEST_TIMEOUT_SECS))?;

        let status = response.status();
        if !status.is_success() {
            return Err(ProviderError::HttpError {
                status: status.as_u16(),
                body: response.text().await.unwrap_or_default(),
            });
        }
        Ok(response)
    }
}

fn mime_for_format(format: &str) -> &'static str {
    match format {
        "opus" => "audio/ogg",
        "aac" => "audio/aac",
        "flac" => "audio/flac",
        "wav" => "audio/wav",
        "pcm" => "audio/L16",
        _ => "audio/mpeg",
    }
}

#[async_trait]
impl TtsProvider for OpenAiTtsProvider {
    async fn synthesize(&self, request: TtsRequest) -> Result<AudioData, ProviderError> {
        let response = self.send(&request).await?;
        let bytes = response
            .bytes()
            .await
            .map_err(|e| ProviderError::StreamError {
                reason: format!("failed to read audio body: {e}"),
            })?;
        Ok(AudioData {
            bytes: bytes.to_vec(),
            mime_type: self.mime_type().to_string(),
        })
    }

    async fn synthesize_stream(&self, request: TtsRequest) -> Result<AudioStream, ProviderError> {
        let response = self.send(&request).await?;
        let mime = self.mime_type().to_string();
        let stream = response.bytes_stream().map(move |chunk| {
            chunk
                .map(|bytes| AudioData {
                    bytes: bytes.to_vec(),
                    mime_type: mime.clone(),
                })
                .map_err(|e| ProviderError::StreamError {
                    reason: format!("audio stream read error: {e}"),
                })
        });
        Ok(Box::pin(stream))
    }
}
