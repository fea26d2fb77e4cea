// LLM and embedding access for the pipeline, plus token accounting.
// Stages depend on the LlmProvider trait; the OpenAI-compatible client is
// the production implementation.

mod error;
mod openai;
mod provider;
mod retry;
mod tokens;

pub use error::{Error, Result};
pub use openai::OpenAiCompatibleProvider;
pub use provider::{
    ChatMessage, ChatOptions, ChatResponse, ChunkStream, LlmProvider, StreamChunk, Usage,
};
pub use retry::RetryPolicy;
pub use tokens::{ContextChunk, ContextStats, TokenAccountant, estimate_tokens};
