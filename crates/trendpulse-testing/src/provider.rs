use std::collections::VecDeque;
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::Mutex;

use async_trait::async_trait;
use trendpulse_llm::{
    ChatMessage, ChatOptions, ChatResponse, ChunkStream, Error, LlmProvider, Result, StreamChunk,
    Usage,
};

enum ChatScript {
    Content(String),
    Failure(String),
}

enum EmbedScript {
    Batch(Vec<Vec<f32>>),
    Failure(String),
}

/// Scripted chat/embedding provider for tests.
///
/// Chat responses are consumed in push order; an exhausted script fails the
/// call, which exercises the pipeline's defensive fallbacks. Embeddings are
/// either scripted batches or, when a fallback dimension is set, derived
/// deterministically from the text (identical texts embed identically,
/// different texts land far apart).
pub struct MockProvider {
    model: String,
    chat_script: Mutex<VecDeque<ChatScript>>,
    embed_script: Mutex<VecDeque<EmbedScript>>,
    embed_fallback_dim: Option<usize>,
    chat_calls: Mutex<Vec<Vec<ChatMessage>>>,
    embed_calls: Mutex<Vec<Vec<String>>>,
}

impl MockProvider {
    pub fn new() -> Self {
        Self {
            model: "mock-model".to_string(),
            chat_script: Mutex::new(VecDeque::new()),
            embed_script: Mutex::new(VecDeque::new()),
            embed_fallback_dim: None,
            chat_calls: Mutex::new(Vec::new()),
            embed_calls: Mutex::new(Vec::new()),
        }
    }

    /// Derive embeddings from text when no batch is scripted.
    pub fn with_embed_dim(mut self, dim: usize) -> Self {
        self.embed_fallback_dim = Some(dim);
        self
    }

    pub fn push_chat(&self, content: impl Into<String>) {
        self.chat_script
            .lock()
            .unwrap()
            .push_back(ChatScript::Content(content.into()));
    }

    pub fn push_chat_json(&self, value: serde_json::Value) {
        self.push_chat(value.to_string());
    }

    pub fn push_chat_failure(&self, message: impl Into<String>) {
        self.chat_script
            .lock()
            .unwrap()
            .push_back(ChatScript::Failure(message.into()));
    }

    pub fn push_embed_batch(&self, vectors: Vec<Vec<f32>>) {
        self.embed_script
            .lock()
            .unwrap()
            .push_back(EmbedScript::Batch(vectors));
    }

    pub fn push_embed_failure(&self, message: impl Into<String>) {
        self.embed_script
            .lock()
            .unwrap()
            .push_back(EmbedScript::Failure(message.into()));
    }

    pub fn chat_call_count(&self) -> usize {
        self.chat_calls.lock().unwrap().len()
    }

    pub fn embed_call_count(&self) -> usize {
        self.embed_calls.lock().unwrap().len()
    }

    /// Prompts of every chat call, flattened to user content.
    pub fn chat_prompts(&self) -> Vec<String> {
        self.chat_calls
            .lock()
            .unwrap()
            .iter()
            .map(|messages| {
                messages
                    .iter()
                    .map(|m| m.content.clone())
                    .collect::<Vec<_>>()
                    .join("\n")
            })
            .collect()
    }

    fn fallback_vector(&self, text: &str, dim: usize) -> Vec<f32> {
        let mut hasher = DefaultHasher::new();
        text.hash(&mut hasher);
        let seed = hasher.finish();

        // Deterministic pseudo-random unit vector per distinct text.
        let mut state = seed.max(1);
        let mut vector: Vec<f32> = (0..dim)
            .map(|_| {
                state = state.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
                ((state >> 33) as f32 / u32::MAX as f32) - 0.5
            })
            .collect();
        let norm = vector.iter().map(|v| v * v).sum::<f32>().sqrt();
        if norm > 0.0 {
            for v in &mut vector {
                *v /= norm;
            }
        }
        vector
    }
}

impl Default for MockProvider {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl LlmProvider for MockProvider {
    async fn chat(&self, messages: &[ChatMessage], _options: &ChatOptions) -> Result<ChatResponse> {
        self.chat_calls.lock().unwrap().push(messages.to_vec());

        let script = self.chat_script.lock().unwrap().pop_front();
        match script {
            Some(ChatScript::Content(content)) => Ok(ChatResponse {
                content,
                usage: Usage {
                    prompt_tokens: 100,
                    completion_tokens: 50,
                },
                model: self.model.clone(),
                finish_reason: Some("stop".to_string()),
            }),
            Some(ChatScript::Failure(message)) => Err(Error::Api {
                status: 503,
                body: message,
            }),
            None => Err(Error::MalformedResponse(
                "mock chat script exhausted".to_string(),
            )),
        }
    }

    async fn chat_stream(
        &self,
        messages: &[ChatMessage],
        options: &ChatOptions,
    ) -> Result<ChunkStream> {
        let response = self.chat(messages, options).await?;
        let chunks = vec![
            Ok(StreamChunk {
                content: response.content,
                finish_reason: None,
            }),
            Ok(StreamChunk {
                content: String::new(),
                finish_reason: Some("stop".to_string()),
            }),
        ];
        Ok(Box::pin(futures::stream::iter(chunks)))
    }

    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        self.embed_calls.lock().unwrap().push(texts.to_vec());

        let script = self.embed_script.lock().unwrap().pop_front();
        match script {
            Some(EmbedScript::Batch(vectors)) => Ok(vectors),
            Some(EmbedScript::Failure(message)) => Err(Error::Api {
                status: 503,
                body: message,
            }),
            None => match self.embed_fallback_dim {
                Some(dim) => Ok(texts.iter().map(|t| self.fallback_vector(t, dim)).collect()),
                None => Err(Error::MalformedResponse(
                    "mock embed script exhausted".to_string(),
                )),
            },
        }
    }

    fn provider_name(&self) -> &str {
        "mock"
    }

    fn model(&self) -> &str {
        &self.model
    }
}
