use std::collections::HashMap;

use tracing::debug;

use trendpulse_types::model_limits::{DEFAULT_SAFETY_MARGIN, context_limit_for};

use crate::provider::ChatMessage;

// NOTE: Estimation heuristic
//
// No tokenizer ships with the pipeline; counts are a conservative estimate of
// 2 chars per token over Unicode scalar values. CJK text runs ~1.5 chars per
// token and Latin text ~4, so 2 keeps both under the budget. The estimate is
// only ever used to stay BELOW a limit, never to bill.

/// Per-message serialization overhead (role tags etc.) and the list
/// terminator, in estimated tokens.
const PER_MESSAGE_OVERHEAD: usize = 4;
const MESSAGES_TERMINATOR: usize = 3;

/// A retrieval chunk to pack into a context budget.
#[derive(Debug, Clone, PartialEq)]
pub struct ContextChunk {
    pub content: String,
    pub label: Option<String>,
}

impl ContextChunk {
    pub fn new(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            label: None,
        }
    }
}

/// Stats of one context optimization pass, logged by the caller.
#[derive(Debug, Clone)]
pub struct ContextStats {
    pub context_limit: u32,
    pub safety_margin: u32,
    pub system_tokens: usize,
    pub query_tokens: usize,
    pub max_completion_tokens: u32,
    pub available_context_tokens: usize,
    pub used_context_tokens: usize,
    pub original_chunks: usize,
    pub kept_chunks: usize,
}

/// Token counting and truncation against one model's context window.
#[derive(Debug, Clone)]
pub struct TokenAccountant {
    model: String,
    context_limit: u32,
    safety_margin: u32,
}

impl TokenAccountant {
    pub fn new(model: impl Into<String>, limits: &HashMap<String, u32>) -> Self {
        let model = model.into();
        let context_limit = context_limit_for(limits, &model);
        Self {
            model,
            context_limit,
            safety_margin: DEFAULT_SAFETY_MARGIN,
        }
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    pub fn context_limit(&self) -> u32 {
        self.context_limit
    }

    /// Estimated token count for a text.
    pub fn count(&self, text: &str) -> usize {
        estimate_tokens(text)
    }

    /// Estimated token count for a message list, including per-message
    /// overhead.
    pub fn count_messages(&self, messages: &[ChatMessage]) -> usize {
        messages
            .iter()
            .map(|m| PER_MESSAGE_OVERHEAD + estimate_tokens(&m.content))
            .sum::<usize>()
            + MESSAGES_TERMINATOR
    }

    /// Truncate to at most `max_tokens`, keeping the head (or the tail) and
    /// marking the cut with an ellipsis.
    pub fn truncate(&self, text: &str, max_tokens: usize, keep_start: bool) -> String {
        if estimate_tokens(text) <= max_tokens {
            return text.to_string();
        }

        let chars: Vec<char> = text.chars().collect();
        let ratio = max_tokens as f64 / estimate_tokens(text) as f64;
        let mut keep = ((chars.len() as f64) * ratio * 0.9) as usize;

        loop {
            let candidate: String = if keep_start {
                chars[..keep.min(chars.len())].iter().collect()
            } else {
                chars[chars.len().saturating_sub(keep)..].iter().collect()
            };
            let marked = if keep_start {
                format!("{}...", candidate)
            } else {
                format!("...{}", candidate)
            };
            // The ellipsis counts against the budget too.
            if estimate_tokens(&marked) <= max_tokens || keep == 0 {
                return marked;
            }
            keep = (keep as f64 * 0.9) as usize;
        }
    }

    /// Greedily pack chunks under `max_tokens`, truncating the last one that
    /// partially fits. Returns the kept chunks and the tokens they use.
    pub fn truncate_chunks(
        &self,
        chunks: &[ContextChunk],
        max_tokens: usize,
    ) -> (Vec<ContextChunk>, usize) {
        let mut kept = Vec::new();
        let mut used = 0usize;

        for chunk in chunks {
            let chunk_tokens = estimate_tokens(&chunk.content);
            if used + chunk_tokens <= max_tokens {
                kept.push(chunk.clone());
                used += chunk_tokens;
            } else if used < max_tokens {
                let remaining = max_tokens - used;
                let truncated = self.truncate(&chunk.content, remaining, true);
                used += estimate_tokens(&truncated);
                kept.push(ContextChunk {
                    content: truncated,
                    label: chunk.label.clone(),
                });
                break;
            } else {
                break;
            }
        }

        (kept, used)
    }

    /// Tokens left for retrieval context after the fixed parts of a prompt
    /// are accounted for.
    pub fn available_context(
        &self,
        system_prompt: &str,
        query: &str,
        max_completion_tokens: u32,
    ) -> usize {
        let used = estimate_tokens(system_prompt) + estimate_tokens(query);
        (self.context_limit as usize)
            .saturating_sub(self.safety_margin as usize)
            .saturating_sub(used)
            .saturating_sub(max_completion_tokens as usize)
    }

    /// Fit retrieval chunks into the window for one query. Truncation is
    /// silent; the optimization itself is logged.
    pub fn optimize_context(
        &self,
        query: &str,
        chunks: &[ContextChunk],
        system_prompt: &str,
        max_completion_tokens: u32,
    ) -> (Vec<ContextChunk>, ContextStats) {
        let available = self.available_context(system_prompt, query, max_completion_tokens);
        let (kept, used) = self.truncate_chunks(chunks, available);

        let stats = ContextStats {
            context_limit: self.context_limit,
            safety_margin: self.safety_margin,
            system_tokens: estimate_tokens(system_prompt),
            query_tokens: estimate_tokens(query),
            max_completion_tokens,
            available_context_tokens: available,
            used_context_tokens: used,
            original_chunks: chunks.len(),
            kept_chunks: kept.len(),
        };
        debug!(
            model = %self.model,
            available = stats.available_context_tokens,
            used = stats.used_context_tokens,
            original_chunks = stats.original_chunks,
            kept_chunks = stats.kept_chunks,
            "context optimization"
        );
        (kept, stats)
    }
}

/// Conservative token estimate: 2 Unicode chars per token.
pub fn estimate_tokens(text: &str) -> usize {
    text.chars().count() / 2
}

#[cfg(test)]
mod tests {
    use super::*;
    use trendpulse_types::model_limits::default_context_limits;

    fn accountant() -> TokenAccountant {
        TokenAccountant::new("qwen3-32b", &default_context_limits())
    }

    #[test]
    fn test_estimate_counts_chars_not_bytes() {
        // 10 CJK chars are 30 bytes but only 5 estimated tokens.
        assert_eq!(estimate_tokens("地震救援进展通报会议"), 5);
        assert_eq!(estimate_tokens("abcd"), 2);
        assert_eq!(estimate_tokens(""), 0);
    }

    #[test]
    fn test_count_messages_includes_overhead() {
        let acc = accountant();
        let messages = vec![ChatMessage::system("ab"), ChatMessage::user("cdef")];
        // 4 + 1 + 4 + 2 + 3
        assert_eq!(acc.count_messages(&messages), 14);
    }

    #[test]
    fn test_truncate_keeps_head() {
        let acc = accountant();
        let text = "0123456789".repeat(20);
        let out = acc.truncate(&text, 10, true);
        assert!(out.ends_with("..."));
        assert!(estimate_tokens(&out) <= 12);
        assert!(out.starts_with("01234"));
    }

    #[test]
    fn test_truncate_keeps_tail() {
        let acc = accountant();
        let text = "0123456789".repeat(20);
        let out = acc.truncate(&text, 10, false);
        assert!(out.starts_with("..."));
        assert!(out.ends_with("89"));
    }

    #[test]
    fn test_truncate_noop_when_under_limit() {
        let acc = accountant();
        assert_eq!(acc.truncate("short", 100, true), "short");
    }

    #[test]
    fn test_truncate_chunks_packs_greedily() {
        let acc = accountant();
        let chunks = vec![
            ContextChunk::new("a".repeat(20)), // 10 tokens
            ContextChunk::new("b".repeat(20)), // 10 tokens
            ContextChunk::new("c".repeat(20)), // 10 tokens
        ];
        let (kept, used) = acc.truncate_chunks(&chunks, 25);
        assert_eq!(kept.len(), 3);
        assert!(used <= 25);
        // First two intact, third truncated.
        assert_eq!(kept[0].content.len(), 20);
        assert_eq!(kept[1].content.len(), 20);
        assert!(kept[2].content.ends_with("..."));
    }

    #[test]
    fn test_available_context_subtracts_everything() {
        let acc = accountant();
        let available = acc.available_context(&"s".repeat(200), &"q".repeat(100), 1000);
        // 32000 - 2000 - 100 - 50 - 1000
        assert_eq!(available, 28_850);
    }

    #[test]
    fn test_optimize_context_reports_stats() {
        let acc = accountant();
        let chunks: Vec<ContextChunk> = (0..4)
            .map(|i| ContextChunk::new(format!("{}", i).repeat(2000)))
            .collect();
        let (kept, stats) = acc.optimize_context("query", &chunks, "system", 30_000);

        assert!(stats.available_context_tokens < 2000);
        assert!(kept.len() < chunks.len());
        assert!(stats.used_context_tokens <= stats.available_context_tokens);
        assert_eq!(stats.original_chunks, 4);
        assert_eq!(stats.kept_chunks, kept.len());
    }
}
