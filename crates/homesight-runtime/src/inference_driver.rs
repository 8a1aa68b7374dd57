//! [`OpenAiBackend`] – OpenAI-compatible inference backend.
//!
//! Talks to any model server exposing `/v1/chat/completions` (Ollama,
//! llama.cpp server, vLLM, ...). One instance serves one lane of the
//! [`InferenceGateway`][homesight_kernel::InferenceGateway]: a vision model
//! for perception and a text model for planning.
//!
//! Frames travel as base64 `data:` URLs inside an `image_url` content part;
//! a response schema, when the request carries one, is forwarded as a
//! `json_schema` `response_format`.
//!
//! # Example
//!
//! ```rust,no_run
//! use homesight_runtime::inference_driver::OpenAiBackend;
//! use homesight_types::Backend;
//!
//! let vision = OpenAiBackend::new(Backend::Vision, "http://localhost:11434", "llava");
//! ```

use async_trait::async_trait;
use base64::{Engine as _, engine::general_purpose::STANDARD};
use homesight_kernel::{InferenceBackend, InferenceRequest};
use homesight_types::{Backend, HomeError};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

// ─────────────────────────────────────────────────────────────────────────────
// Error type
// ─────────────────────────────────────────────────────────────────────────────

/// Errors raised while talking to the model server.
#[derive(Error, Debug)]
pub enum InferenceDriverError {
    /// The HTTP request to the model server failed.
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
    /// The response from the model server could not be understood.
    #[error("Unexpected response format: {0}")]
    BadResponse(String),
}

impl InferenceDriverError {
    fn into_home_error(self, backend: Backend) -> HomeError {
        HomeError::InferenceBackend {
            backend,
            details: self.to_string(),
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Wire shapes (OpenAI-compatible)
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
enum Role {
    System,
    User,
}

#[derive(Debug, Serialize)]
#[serde(untagged)]
enum Content {
    Text(String),
    Parts(Vec<ContentPart>),
}

#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ContentPart {
    Text { text: String },
    ImageUrl { image_url: ImageUrl },
}

#[derive(Debug, Serialize)]
struct ImageUrl {
    url: String,
}

#[derive(Debug, Serialize)]
struct Message {
    role: Role,
    content: Content,
}

#[derive(Debug, Serialize)]
struct JsonSchemaFormat {
    name: &'static str,
    schema: serde_json::Value,
}

/// `response_format` field that constrains the reply to a JSON Schema.
#[derive(Debug, Serialize)]
struct ResponseFormat {
    #[serde(rename = "type")]
    kind: &'static str,
    json_schema: JsonSchemaFormat,
}

#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<Message>,
    stream: bool,
    max_tokens: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    response_format: Option<ResponseFormat>,
}

#[derive(Deserialize)]
struct ChatResponse {
    choices: Vec<Choice>,
}

#[derive(Deserialize)]
struct Choice {
    message: ReplyMessage,
}

#[derive(Deserialize)]
struct ReplyMessage {
    #[serde(default)]
    content: Option<String>,
}

// ─────────────────────────────────────────────────────────────────────────────
// OpenAiBackend
// ─────────────────────────────────────────────────────────────────────────────

/// An async client for one OpenAI-compatible chat-completions endpoint.
///
/// The per-call timeout is enforced by the gateway, not here.
pub struct OpenAiBackend {
    backend: Backend,
    base_url: String,
    model: String,
    api_key: Option<String>,
    client: reqwest::Client,
}

impl OpenAiBackend {
    /// `base_url` without the `/v1` suffix, e.g. `"http://localhost:11434"`.
    pub fn new(backend: Backend, base_url: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            backend,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            model: model.into(),
            api_key: None,
            client: reqwest::Client::new(),
        }
    }

    /// Send `Authorization: Bearer <key>` with every call.
    pub fn with_api_key(mut self, api_key: impl Into<String>) -> Self {
        self.api_key = Some(api_key.into());
        self
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    fn build_body<'a>(&'a self, request: &InferenceRequest) -> ChatRequest<'a> {
        let mut messages = Vec::with_capacity(2);
        if !request.system.is_empty() {
            messages.push(Message {
                role: Role::System,
                content: Content::Text(request.system.clone()),
            });
        }
        let user = match &request.image {
            Some(image) => Content::Parts(vec![
                ContentPart::Text {
                    text: request.prompt.clone(),
                },
                ContentPart::ImageUrl {
                    image_url: ImageUrl {
                        url: data_url(image),
                    },
                },
            ]),
            None => Content::Text(request.prompt.clone()),
        };
        messages.push(Message {
            role: Role::User,
            content: user,
        });

        ChatRequest {
            model: &self.model,
            messages,
            stream: false,
            max_tokens: request.max_tokens,
            response_format: request.response_schema.clone().map(|schema| ResponseFormat {
                kind: "json_schema",
                json_schema: JsonSchemaFormat {
                    name: "home_action",
                    schema,
                },
            }),
        }
    }

    async fn complete(&self, request: &InferenceRequest) -> Result<String, InferenceDriverError> {
        let url = format!("{}/v1/chat/completions", self.base_url);
        let body = self.build_body(request);

        let mut call = self.client.post(&url).json(&body);
        if let Some(key) = &self.api_key {
            call = call.bearer_auth(key);
        }
        let response: ChatResponse = call.send().await?.error_for_status()?.json().await?;

        let text = response
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .ok_or_else(|| InferenceDriverError::BadResponse("empty choices array".into()))?;
        debug!(backend = %self.backend, model = %self.model, chars = text.len(), "completion received");
        Ok(text)
    }
}

#[async_trait]
impl InferenceBackend for OpenAiBackend {
    async fn infer(&self, request: &InferenceRequest) -> Result<String, HomeError> {
        self.complete(request)
            .await
            .map_err(|e| e.into_home_error(self.backend))
    }
}

/// JPEG is assumed; vision servers sniff the actual bytes anyway.
fn data_url(image: &[u8]) -> String {
    format!("data:image/jpeg;base64,{}", STANDARD.encode(image))
}

#[cfg(test)]
mod tests {
    use super::*;
    use homesight_types::{CycleKey, SessionId};
    use serde_json::{Value, json};
    use std::sync::Arc;

    fn request() -> InferenceRequest {
        InferenceRequest::new(CycleKey::new(SessionId::new("porch"), 0, 1), "describe")
    }

    fn body_json(backend: &OpenAiBackend, request: &InferenceRequest) -> Value {
        serde_json::to_value(backend.build_body(request)).unwrap()
    }

    #[test]
    fn text_request_has_plain_content_and_no_response_format() {
        let backend = OpenAiBackend::new(Backend::Planning, "http://localhost:11434/", "llama3");
        let body = body_json(&backend, &request().with_system("be brief"));
        assert_eq!(body["model"], "llama3");
        assert_eq!(body["stream"], false);
        assert_eq!(body["messages"][0]["role"], "system");
        assert_eq!(body["messages"][1]["content"], "describe");
        assert!(body.get("response_format").is_none());
        assert_eq!(backend.base_url, "http://localhost:11434");
    }

    #[test]
    fn image_is_sent_as_base64_data_url_part() {
        let backend = OpenAiBackend::new(Backend::Vision, "http://localhost:11434", "llava");
        let image: Arc<[u8]> = Arc::from(&b"jpeg"[..]);
        let body = body_json(&backend, &request().with_image(image));
        // No system prompt, so the user message comes first.
        let parts = &body["messages"][0]["content"];
        assert_eq!(parts[0], json!({"type": "text", "text": "describe"}));
        assert_eq!(parts[1]["type"], "image_url");
        assert_eq!(parts[1]["image_url"]["url"], "data:image/jpeg;base64,anBlZw==");
    }

    #[test]
    fn response_schema_becomes_json_schema_format() {
        let backend = OpenAiBackend::new(Backend::Planning, "http://localhost:11434", "llama3");
        let schema = json!({"type": "object"});
        let body = body_json(&backend, &request().with_schema(schema.clone()).with_max_tokens(64));
        assert_eq!(body["max_tokens"], 64);
        assert_eq!(body["response_format"]["type"], "json_schema");
        assert_eq!(body["response_format"]["json_schema"]["schema"], schema);
    }

    #[test]
    fn driver_errors_map_to_backend_errors() {
        let err = InferenceDriverError::BadResponse("no choices".into()).into_home_error(Backend::Vision);
        assert!(matches!(
            err,
            HomeError::InferenceBackend { backend: Backend::Vision, ref details } if details.contains("no choices")
        ));
        assert!(err.is_inference_failure());
    }

    #[test]
    fn reply_without_content_is_tolerated_by_the_decoder() {
        let reply: ChatResponse =
            serde_json::from_str(r#"{"choices": [{"message": {"role": "assistant"}}]}"#).unwrap();
        assert!(reply.choices[0].message.content.is_none());
    }
}
