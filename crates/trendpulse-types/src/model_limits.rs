use std::collections::HashMap;

/// Fallback context limit for models not in the table.
pub const DEFAULT_CONTEXT_LIMIT: u32 = 32_000;

/// Tokens reserved for system prompt overhead and slack when budgeting
/// context.
pub const DEFAULT_SAFETY_MARGIN: u32 = 2_000;

/// Built-in context-window sizes (total tokens) for the models the pipeline
/// is deployed against. Deployments can extend or override this via config.
pub fn default_context_limits() -> HashMap<String, u32> {
    let mut limits = HashMap::new();
    limits.insert("qwen3-32b".to_string(), 32_000);
    limits.insert("qwen2-72b".to_string(), 32_000);
    limits.insert("gpt-4".to_string(), 8_192);
    limits.insert("gpt-4-32k".to_string(), 32_768);
    limits.insert("gpt-4o".to_string(), 128_000);
    limits.insert("gpt-4o-mini".to_string(), 128_000);
    limits.insert("gpt-3.5-turbo".to_string(), 16_385);
    limits
}

/// Resolve a model's context limit, falling back to the conservative default.
pub fn context_limit_for(limits: &HashMap<String, u32>, model: &str) -> u32 {
    limits.get(model).copied().unwrap_or(DEFAULT_CONTEXT_LIMIT)
}
