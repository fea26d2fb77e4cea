use std::collections::VecDeque;
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use serde::Deserialize;
use serde_json::json;
use tracing::{debug, warn};

use crate::provider::{
    ChatMessage, ChatOptions, ChatResponse, ChunkStream, LlmProvider, StreamChunk, Usage,
};
use crate::retry::RetryPolicy;
use crate::{Error, Result};

/// Client for any endpoint speaking the OpenAI chat/embeddings wire format
/// (vLLM, Ollama, LM Studio, the hosted originals, ...).
pub struct OpenAiCompatibleProvider {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
    model: String,
    temperature: f32,
    max_tokens: u32,
    retry: RetryPolicy,
}

impl OpenAiCompatibleProvider {
    pub fn new(base_url: impl Into<String>, api_key: impl Into<String>, model: impl Into<String>) -> Self {
        Self::with_timeout(base_url, api_key, model, Duration::from_secs(60))
    }

    pub fn with_timeout(
        base_url: impl Into<String>,
        api_key: impl Into<String>,
        model: impl Into<String>,
        timeout: Duration,
    ) -> Self {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .expect("reqwest client");
        Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key: api_key.into(),
            model: model.into(),
            temperature: 0.3,
            max_tokens: 2048,
            retry: RetryPolicy::default(),
        }
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_defaults(mut self, temperature: f32, max_tokens: u32) -> Self {
        self.temperature = temperature;
        self.max_tokens = max_tokens;
        self
    }

    fn chat_payload(&self, messages: &[ChatMessage], options: &ChatOptions, stream: bool) -> serde_json::Value {
        let mut payload = json!({
            "model": self.model,
            "messages": messages,
            "temperature": options.temperature.unwrap_or(self.temperature),
            "max_tokens": options.max_tokens.unwrap_or(self.max_tokens),
        });
        if options.json_response {
            payload["response_format"] = json!({"type": "json_object"});
        }
        if stream {
            payload["stream"] = json!(true);
        }
        payload
    }

    async fn post_json(&self, url: &str, payload: &serde_json::Value) -> Result<serde_json::Value> {
        let mut attempt = 0u32;
        loop {
            let result = self.post_json_once(url, payload).await;
            match result {
                Ok(value) => return Ok(value),
                Err(err) if self.retry.should_retry(&err, attempt) => {
                    attempt += 1;
                    let delay = self.retry.delay_for(attempt);
                    warn!(
                        url,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "transient endpoint failure, backing off"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(err) => return Err(err),
            }
        }
    }

    async fn post_json_once(&self, url: &str, payload: &serde_json::Value) -> Result<serde_json::Value> {
        let response = self
            .client
            .post(url)
            .bearer_auth(&self.api_key)
            .json(payload)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(Error::Api {
                status: status.as_u16(),
                body,
            });
        }

        Ok(response.json().await?)
    }
}

#[derive(Debug, Deserialize)]
struct ChatCompletionBody {
    #[serde(default)]
    model: Option<String>,
    choices: Vec<ChatChoice>,
    #[serde(default)]
    usage: Option<Usage>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatChoiceMessage,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ChatChoiceMessage {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct EmbeddingBody {
    data: Vec<EmbeddingDatum>,
}

#[derive(Debug, Deserialize)]
struct EmbeddingDatum {
    embedding: Vec<f32>,
}

#[async_trait]
impl LlmProvider for OpenAiCompatibleProvider {
    async fn chat(&self, messages: &[ChatMessage], options: &ChatOptions) -> Result<ChatResponse> {
        let url = format!("{}/chat/completions", self.base_url);
        let payload = self.chat_payload(messages, options, false);
        let value = self.post_json(&url, &payload).await?;

        let body: ChatCompletionBody = serde_json::from_value(value)
            .map_err(|e| Error::MalformedResponse(format!("chat completion: {}", e)))?;
        let choice = body
            .choices
            .into_iter()
            .next()
            .ok_or_else(|| Error::MalformedResponse("chat completion had no choices".into()))?;

        let usage = body.usage.unwrap_or_default();
        debug!(
            model = %self.model,
            prompt_tokens = usage.prompt_tokens,
            completion_tokens = usage.completion_tokens,
            "chat completion finished"
        );

        Ok(ChatResponse {
            content: choice.message.content.unwrap_or_default(),
            usage,
            model: body.model.unwrap_or_else(|| self.model.clone()),
            finish_reason: choice.finish_reason,
        })
    }

    async fn chat_stream(
        &self,
        messages: &[ChatMessage],
        options: &ChatOptions,
    ) -> Result<ChunkStream> {
        let url = format!("{}/chat/completions", self.base_url);
        let payload = self.chat_payload(messages, options, true);

        let response = self
            .client
            .post(&url)
            .bearer_auth(&self.api_key)
            .json(&payload)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(Error::Api {
                status: status.as_u16(),
                body,
            });
        }

        let bytes = response.bytes_stream().map(|result| result.map(|b| b.to_vec()));
        let state = SseState {
            bytes: Box::pin(bytes),
            buffer: String::new(),
            pending: VecDeque::new(),
            done: false,
        };

        let stream = futures::stream::unfold(state, |mut state| async move {
            loop {
                if let Some(chunk) = state.pending.pop_front() {
                    return Some((Ok(chunk), state));
                }
                if state.done {
                    return None;
                }
                match state.bytes.next().await {
                    Some(Ok(bytes)) => {
                        state.buffer.push_str(&String::from_utf8_lossy(&bytes));
                        drain_lines(&mut state);
                    }
                    Some(Err(err)) => {
                        state.done = true;
                        return Some((Err(Error::Stream(err.to_string())), state));
                    }
                    None => {
                        state.done = true;
                        let leftover = std::mem::take(&mut state.buffer);
                        if let SseEvent::Chunk(chunk) = parse_sse_line(&leftover) {
                            state.pending.push_back(chunk);
                        }
                    }
                }
            }
        });

        Ok(Box::pin(stream))
    }

    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let url = format!("{}/embeddings", self.base_url);
        let payload = json!({
            "model": self.model,
            "input": texts,
        });
        let value = self.post_json(&url, &payload).await?;

        let body: EmbeddingBody = serde_json::from_value(value)
            .map_err(|e| Error::MalformedResponse(format!("embeddings: {}", e)))?;
        if body.data.len() != texts.len() {
            return Err(Error::MalformedResponse(format!(
                "asked for {} embeddings, got {}",
                texts.len(),
                body.data.len()
            )));
        }
        Ok(body.data.into_iter().map(|d| d.embedding).collect())
    }

    fn provider_name(&self) -> &str {
        "openai_compatible"
    }

    fn model(&self) -> &str {
        &self.model
    }
}

struct SseState {
    bytes: futures::stream::BoxStream<'static, reqwest::Result<Vec<u8>>>,
    buffer: String,
    pending: VecDeque<StreamChunk>,
    done: bool,
}

fn drain_lines(state: &mut SseState) {
    while let Some(pos) = state.buffer.find('\n') {
        let line: String = state.buffer.drain(..=pos).collect();
        match parse_sse_line(line.trim_end()) {
            SseEvent::Chunk(chunk) => state.pending.push_back(chunk),
            SseEvent::Done => state.done = true,
            SseEvent::Skip => {}
        }
    }
}

enum SseEvent {
    Chunk(StreamChunk),
    Done,
    Skip,
}

/// One SSE line from a streamed completion: `data: {json}` frames carry
/// deltas, `data: [DONE]` terminates, everything else (blank lines,
/// comments) is skipped.
fn parse_sse_line(line: &str) -> SseEvent {
    let line = line.trim();
    if line.is_empty() || line.starts_with(':') {
        return SseEvent::Skip;
    }
    let data = line.strip_prefix("data:").map(str::trim).unwrap_or(line);
    if data == "[DONE]" {
        return SseEvent::Done;
    }

    let value: serde_json::Value = match serde_json::from_str(data) {
        Ok(v) => v,
        Err(_) => return SseEvent::Skip,
    };
    let choice = match value.get("choices").and_then(|c| c.get(0)) {
        Some(c) => c,
        None => return SseEvent::Skip,
    };
    let content = choice
        .pointer("/delta/content")
        .and_then(|v| v.as_str())
        .unwrap_or_default()
        .to_string();
    let finish_reason = choice
        .get("finish_reason")
        .and_then(|v| v.as_str())
        .map(str::to_string);

    if content.is_empty() && finish_reason.is_none() {
        return SseEvent::Skip;
    }
    SseEvent::Chunk(StreamChunk {
        content,
        finish_reason,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{body_partial_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn chat_body(content: &str) -> serde_json::Value {
        json!({
            "model": "qwen3-32b",
            "choices": [{
                "message": {"role": "assistant", "content": content},
                "finish_reason": "stop"
            }],
            "usage": {"prompt_tokens": 120, "completion_tokens": 30}
        })
    }

    #[test]
    fn test_parse_sse_line_variants() {
        assert!(matches!(parse_sse_line(""), SseEvent::Skip));
        assert!(matches!(parse_sse_line(": keepalive"), SseEvent::Skip));
        assert!(matches!(parse_sse_line("data: [DONE]"), SseEvent::Done));
        assert!(matches!(parse_sse_line("data: not json"), SseEvent::Skip));

        let chunk = parse_sse_line(
            r#"data: {"choices":[{"delta":{"content":"你好"},"finish_reason":null}]}"#,
        );
        match chunk {
            SseEvent::Chunk(c) => {
                assert_eq!(c.content, "你好");
                assert!(c.finish_reason.is_none());
            }
            _ => panic!("expected chunk"),
        }

        let end = parse_sse_line(r#"data: {"choices":[{"delta":{},"finish_reason":"stop"}]}"#);
        match end {
            SseEvent::Chunk(c) => {
                assert!(c.content.is_empty());
                assert_eq!(c.finish_reason.as_deref(), Some("stop"));
            }
            _ => panic!("expected terminal chunk"),
        }
    }

    #[tokio::test]
    async fn test_chat_parses_content_and_usage() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/chat/completions"))
            .respond_with(ResponseTemplate::new(200).set_body_json(chat_body("{\"ok\":true}")))
            .mount(&server)
            .await;

        let provider = OpenAiCompatibleProvider::new(
            format!("{}/v1", server.uri()),
            "test-key",
            "qwen3-32b",
        );
        let response = provider
            .chat(&[ChatMessage::user("hello")], &ChatOptions::default())
            .await
            .unwrap();

        assert_eq!(response.content, "{\"ok\":true}");
        assert_eq!(response.usage.prompt_tokens, 120);
        assert_eq!(response.usage.completion_tokens, 30);
        assert_eq!(response.finish_reason.as_deref(), Some("stop"));
    }

    #[tokio::test]
    async fn test_chat_requests_json_mode() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/chat/completions"))
            .and(body_partial_json(
                json!({"response_format": {"type": "json_object"}}),
            ))
            .respond_with(ResponseTemplate::new(200).set_body_json(chat_body("{}")))
            .expect(1)
            .mount(&server)
            .await;

        let provider = OpenAiCompatibleProvider::new(
            format!("{}/v1", server.uri()),
            "test-key",
            "qwen3-32b",
        );
        provider
            .chat(&[ChatMessage::user("hello")], &ChatOptions::json(300))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_retries_on_5xx_then_succeeds() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/chat/completions"))
            .respond_with(ResponseTemplate::new(503))
            .up_to_n_times(2)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/v1/chat/completions"))
            .respond_with(ResponseTemplate::new(200).set_body_json(chat_body("ok")))
            .mount(&server)
            .await;

        let provider = OpenAiCompatibleProvider::new(
            format!("{}/v1", server.uri()),
            "test-key",
            "qwen3-32b",
        )
        .with_retry(RetryPolicy {
            max_retries: 3,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(5),
        });

        let response = provider
            .chat(&[ChatMessage::user("hello")], &ChatOptions::default())
            .await
            .unwrap();
        assert_eq!(response.content, "ok");
    }

    #[tokio::test]
    async fn test_gives_up_after_retry_budget() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/chat/completions"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;

        let provider = OpenAiCompatibleProvider::new(
            format!("{}/v1", server.uri()),
            "test-key",
            "qwen3-32b",
        )
        .with_retry(RetryPolicy {
            max_retries: 2,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(5),
        });

        let err = provider
            .chat(&[ChatMessage::user("hello")], &ChatOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Api { status: 500, .. }));
    }

    #[tokio::test]
    async fn test_embed_batches() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/embeddings"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "data": [
                    {"embedding": [0.1, 0.2]},
                    {"embedding": [0.3, 0.4]}
                ]
            })))
            .mount(&server)
            .await;

        let provider = OpenAiCompatibleProvider::new(
            format!("{}/v1", server.uri()),
            "test-key",
            "embed-v2",
        );
        let vectors = provider
            .embed(&["a".to_string(), "b".to_string()])
            .await
            .unwrap();
        assert_eq!(vectors, vec![vec![0.1, 0.2], vec![0.3, 0.4]]);
    }

    #[tokio::test]
    async fn test_embed_count_mismatch_is_malformed() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/embeddings"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "data": [{"embedding": [0.1]}]
            })))
            .mount(&server)
            .await;

        let provider = OpenAiCompatibleProvider::new(
            format!("{}/v1", server.uri()),
            "test-key",
            "embed-v2",
        );
        let err = provider
            .embed(&["a".to_string(), "b".to_string()])
            .await
            .unwrap_err();
        assert!(matches!(err, Error::MalformedResponse(_)));
    }
}
