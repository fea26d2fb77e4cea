use async_trait::async_trait;
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};

use crate::Result;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: "system".to_string(),
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: "user".to_string(),
            content: content.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct Usage {
    #[serde(default)]
    pub prompt_tokens: u32,
    #[serde(default)]
    pub completion_tokens: u32,
}

#[derive(Debug, Clone)]
pub struct ChatResponse {
    pub content: String,
    pub usage: Usage,
    pub model: String,
    pub finish_reason: Option<String>,
}

/// Per-call knobs. `json_response` asks the endpoint for a JSON-object
/// response format; the caller still parses defensively since not every
/// deployment honors it.
#[derive(Debug, Clone, Default)]
pub struct ChatOptions {
    pub temperature: Option<f32>,
    pub max_tokens: Option<u32>,
    pub json_response: bool,
}

impl ChatOptions {
    pub fn json(max_tokens: u32) -> Self {
        Self {
            temperature: None,
            max_tokens: Some(max_tokens),
            json_response: true,
        }
    }
}

/// One incremental piece of a streamed completion.
#[derive(Debug, Clone)]
pub struct StreamChunk {
    pub content: String,
    pub finish_reason: Option<String>,
}

pub type ChunkStream = BoxStream<'static, Result<StreamChunk>>;

/// Seam between the pipeline and a model endpoint. The pipeline is written
/// against this trait; production wires in the OpenAI-compatible HTTP
/// implementation, tests wire in a scripted mock.
#[async_trait]
pub trait LlmProvider: Send + Sync {
    async fn chat(&self, messages: &[ChatMessage], options: &ChatOptions) -> Result<ChatResponse>;

    async fn chat_stream(
        &self,
        messages: &[ChatMessage],
        options: &ChatOptions,
    ) -> Result<ChunkStream>;

    /// Batch text embedding. One vector per input, dimension fixed per
    /// deployment.
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>>;

    fn provider_name(&self) -> &str;

    fn model(&self) -> &str;
}
