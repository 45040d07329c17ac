//! OpenAI-compatible chat completions backend.
//!
//! Works against any endpoint that speaks `/chat/completions` (OpenAI,
//! Ollama, llama.cpp server, vLLM, LM Studio).

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client as HttpClient;
use serde_json::json;

use super::errors::ProviderError;
use super::streaming::{parse_chat_response, parse_sse_stream};
use super::traits::{LlmProvider, ProviderFactory, ProviderHandle};
use super::types::{
    ChatMessage, ChatRequest, ChatResponse, ChatStream, ConfigField, FieldType,
    ProviderDescriptor, ProviderFamily, Role,
};

// ─── Constants ──────────────────────────────────────────────────────────────

const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

const REQUEST_TIMEOUT_SECS: u64 = 60;

/// Streams stay open while the model works through long contexts.
const STREAM_REQUEST_TIMEOUT_SECS: u64 = 180;

pub const KIND: &str = "openai";

// ─── Descriptor ─────────────────────────────────────────────────────────────

pub fn descriptor() -> ProviderDescriptor {
    ProviderDescriptor {
        kind: KIND.to_string(),
        family: ProviderFamily::Llm,
        display_name: "OpenAI-compatible chat".to_string(),
        fields: vec![
            ConfigField::new("base_url", FieldType::String, "API base URL")
                .with_default(json!("https://api.openai.com/v1")),
            ConfigField::new("api_key", FieldType::Secret, "Bearer token (optional for local servers)"),
            ConfigField::new("model", FieldType::String, "Model name").required(),
            ConfigField::new("temperature", FieldType::Number, "Sampling temperature")
                .with_default(json!(0.7)),
            ConfigField::new("max_tokens", FieldType::Number, "Completion token limit"),
            ConfigField::new("stream", FieldType::Boolean, "Stream replies to the client")
                .with_default(json!(true)),
        ],
    }
}

pub fn factory() -> ProviderFactory {
    std::sync::Arc::new(|config: &serde_json::Value| -> Result<ProviderHandle, ProviderError> {
        let provider = OpenAiProvider::from_config(config)?;
        Ok(ProviderHandle::Llm(std::sync::Arc::new(provider)))
    })
}

// ─── Provider ───────────────────────────────────────────────────────────────

pub struct OpenAiProvider {
    http: HttpClient,
    http_stream: HttpClient,
    base_url: String,
    api_key: Option<String>,
    model: String,
    temperature: f64,
    max_tokens: Option<u64>,
}

impl OpenAiProvider {
    /// Build from a config object already resolved against [`descriptor`].
    pub fn from_config(config: &serde_json::Value) -> Result<Self, ProviderError> {
        let base_url = config
            .get("base_url")
            .and_then(|v| v.as_str())
            .unwrap_or("https://api.openai.com/v1")
            .trim_end_matches('/')
            .to_string();
        let model = config
            .get("model")
            .and_then(|v| v.as_str())
            .filter(|m| !m.is_empty())
            .ok_or_else(|| ProviderError::InvalidConfig {
                instance_id: KIND.to_string(),
                reason: "missing 'model'".into(),
            })?
            .to_string();
        let api_key = config
            .get("api_key")
            .and_then(|v| v.as_str())
            .filter(|k| !k.is_empty())
            .map(String::from);

        let build = |timeout_secs: u64| {
            HttpClient::builder()
                .connect_timeout(CONNECT_TIMEOUT)
                .timeout(Duration::from_secs(timeout_secs))
                .build()
                .map_err(|e| ProviderError::ConnectionFailed {
                    endpoint: base_url.clone(),
                    reason: format!("failed to build HTTP client: {e}"),
                })
        };

        Ok(Self {
            http: build(REQUEST_TIMEOUT_SECS)?,
            http_stream: build(STREAM_REQUEST_TIMEOUT_SECS)?,
            api_key,
            model,
            temperature: config.get("temperature").and_then(|v| v.as_f64()).unwrap_or(0.7),
            max_tokens: config.get("max_tokens").and_then(|v| v.as_u64()),
            base_url,
        })
    }

    fn endpoint(&self) -> String {
        format!("{}/chat/completions", self.base_url)
    }

    fn request_body(&self, request: &ChatRequest, stream: bool) -> serde_json::Value {
        let mut messages = Vec::with_capacity(request.messages.len() + 1);
        if let Some(prompt) = request.system_prompt.as_deref().filter(|p| !p.is_empty()) {
            messages.push(json!({"role": "system", "content": prompt}));
        }
        messages.extend(request.messages.iter().map(wire_message));

        let mut body = json!({
            "model": self.model,
            "messages": messages,
            "temperature": self.temperature,
            "stream": stream,
        });
        if let Some(max) = self.max_tokens {
            body["max_tokens"] = json!(max);
        }
        if !request.tools.is_empty() {
            body["tools"] = json!(request.tools);
            body["tool_choice"] = json!(request.tool_choice.as_str());
        }
        if stream {
            body["stream_options"] = json!({"include_usage": true});
        }
        body
    }

    async fn send(
        &self,
        client: &HttpClient,
        body: &serde_json::Value,
        timeout_secs: u64,
    ) -> Result<reqwest::Response, ProviderError> {
        let url = self.endpoint();

        tracing::info!(
            url = %url,
            model = %self.model,
            message_count = body["messages"].as_array().map(|m| m.len()).unwrap_or(0),
            tool_count = body["tools"].as_array().map(|t| t.len()).unwrap_or(0),
            stream = body["stream"].as_bool().unwrap_or(false),
            "LLM request"
        );

        let mut builder = client.post(&url).json(body);
        if let Some(key) = &self.api_key {
            builder = builder.bearer_auth(key);
        }

        let response = builder
            .send()
            .await
            .map_err(|e| ProviderError::from_reqwest(&url, e, timeout_secs))?;

        let status = response.status();
        if !status.is_success() {
            let body_text = response.text().await.unwrap_or_default();
            return Err(ProviderError::HttpError {
                status: status.as_u16(),
                body: body_text,
            });
        }
        Ok(response)
    }
}

/// Convert a neutral message into the OpenAI wire shape.
fn wire_message(message: &ChatMessage) -> serde_json::Value {
    let content = message.content.clone().unwrap_or_default();
    let mut wire = if message.role == Role::User && !message.images.is_empty() {
        let mut parts = vec![json!({"type": "text", "text": content})];
        parts.extend(
            message
                .images
                .iter()
                .map(|url| json!({"type": "image_url", "image_url": {"url": url}})),
        );
        json!({"role": "user", "content": parts})
    } else {
        json!({"role": message.role.as_str(), "content": content})
    };

    if !message.tool_calls.is_empty() {
        wire["tool_calls"] = message
            .tool_calls
            .iter()
            .map(|call| {
                json!({
                    "id": call.id,
                    "type": "function",
                    "function": {"name": call.name, "arguments": call.arguments},
                })
            })
            .collect();
    }
    if let Some(id) = &message.tool_call_id {
        wire["tool_call_id"] = json!(id);
    }
    wire
}

#[async_trait]
impl LlmProvider for OpenAiProvider {
    async fn chat(&self, request: ChatRequest) -> Result<ChatResponse, ProviderError> {
        let body = self.request_body(&request, false);
        let response = self.send(&self.http, &body, REQUEST_TIMEOUT_SECS).await?;
        let text = response
            .text()
            .await
            .map_err(|e| ProviderError::MalformedResponse {
                reason: format!("failed to read response body: {e}"),
            })?;
        parse_chat_response(&text)
    }

    async fn chat_stream(&self, request: ChatRequest) -> Result<ChatStream, ProviderError> {
        let body = self.request_body(&request, true);
        let response = self
            .send(&self.http_stream, &body, STREAM_REQUEST_TIMEOUT_SECS)
            .await?;
        Ok(parse_sse_stream(response.bytes_stream()))
    }
}

// ─── Tests ──────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::providers::types::{resolve_config, ToolCallRequest, ToolChoice};

    fn provider() -> OpenAiProvider {
        let config = resolve_config(
            &descriptor().fields,
            &json!({"base_url": "http://localhost:11434/v1/", "model": "qwen2.5"}),
        )
        .unwrap();
        OpenAiProvider::from_config(&config).unwrap()
    }

    #[test]
    fn test_from_config_trims_base_url() {
        let p = provider();
        assert_eq!(p.endpoint(), "http://localhost:11434/v1/chat/completions");
        assert!(p.api_key.is_none());
    }

    #[test]
    fn test_from_config_requires_model() {
        assert!(OpenAiProvider::from_config(&json!({"base_url": "http://x"})).is_err());
    }

    #[test]
    fn test_request_body_shapes_history() {
        let request = ChatRequest {
            messages: vec![
                ChatMessage::user("what's the weather?"),
                ChatMessage::assistant_tool_calls(
                    None,
                    vec![ToolCallRequest {
                        id: "call_1".into(),
                        name: "get_weather".into(),
                        arguments: "{\"city\":\"Paris\"}".into(),
                    }],
                ),
                ChatMessage::tool_result("call_1", "sunny"),
            ],
            system_prompt: Some("You are a desk pet.".into()),
            tools: vec![json!({"type": "function", "function": {"name": "get_weather"}})],
            tool_choice: ToolChoice::Auto,
        };

        let body = provider().request_body(&request, true);
        let messages = body["messages"].as_array().unwrap();
        assert_eq!(messages.len(), 4);
        assert_eq!(messages[0]["role"], "system");
        assert_eq!(messages[2]["content"], "");
        assert_eq!(messages[2]["tool_calls"][0]["function"]["name"], "get_weather");
        assert_eq!(messages[3]["tool_call_id"], "call_1");
        assert_eq!(body["tool_choice"], "auto");
        assert_eq!(body["stream_options"]["include_usage"], true);
    }

    #[test]
    fn test_user_images_become_content_parts() {
        let mut msg = ChatMessage::user("look");
        msg.images.push("data:image/png;base64,AAAA".into());
        let wire = wire_message(&msg);
        let parts = wire["content"].as_array().unwrap();
        assert_eq!(parts.len(), 2);
        assert_eq!(parts[1]["image_url"]["url"], "data:image/png;base64,AAAA");
    }

    #[test]
    fn test_no_tools_omits_tool_choice() {
        let body = provider().request_body(&ChatRequest::default(), false);
        assert!(body.get("tools").is_none());
        assert!(body.get("tool_choice").is_none());
    }
}
