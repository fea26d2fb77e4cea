use std::collections::HashMap;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use trendpulse_engine::EngineSettings;
use trendpulse_types::DEFAULT_UTC_OFFSET_HOURS;
use trendpulse_types::model_limits::default_context_limits;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DataConfig {
    /// Relational store location.
    pub db_path: PathBuf,
    /// Derived vector index location.
    pub vector_path: PathBuf,
}

impl Default for DataConfig {
    fn default() -> Self {
        Self {
            db_path: PathBuf::from("./data/trendpulse.db"),
            vector_path: PathBuf::from("./data/vectors.db"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IngestConfig {
    pub enabled_platforms: Vec<String>,
    pub fetch_limit_per_platform: usize,
    pub fetch_concurrency: usize,
    pub fetch_timeout_seconds: u64,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            enabled_platforms: ["weibo", "zhihu", "toutiao", "sina", "netease", "baidu", "hupu"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
            fetch_limit_per_platform: 30,
            fetch_concurrency: 4,
            fetch_timeout_seconds: 10,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HeatConfig {
    /// Relative trust in each platform's heat signal.
    pub platform_weights: HashMap<String, f64>,
}

impl Default for HeatConfig {
    fn default() -> Self {
        let mut platform_weights = HashMap::new();
        platform_weights.insert("weibo".to_string(), 1.2);
        platform_weights.insert("zhihu".to_string(), 1.1);
        platform_weights.insert("baidu".to_string(), 1.1);
        platform_weights.insert("toutiao".to_string(), 1.0);
        platform_weights.insert("netease".to_string(), 0.9);
        platform_weights.insert("sina".to_string(), 0.8);
        platform_weights.insert("hupu".to_string(), 0.8);
        Self { platform_weights }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MergeConfig {
    pub period_vector_threshold: f64,
    pub period_title_threshold: f64,
    pub period_min_occurrence: usize,
    pub global_topk_candidates: usize,
    pub global_similarity_threshold: f64,
    pub global_confidence_threshold: f64,
    pub global_active_window_days: i64,
    pub global_batch_max: usize,
    pub classifier_rule_threshold: f64,
    pub soft_deadline_secs: u64,
    pub summary_concurrency: usize,
}

impl Default for MergeConfig {
    fn default() -> Self {
        let engine = EngineSettings::default();
        Self {
            period_vector_threshold: engine.period.vector_threshold,
            period_title_threshold: engine.period.title_threshold,
            period_min_occurrence: engine.period.min_occurrence,
            global_topk_candidates: engine.global.top_k,
            global_similarity_threshold: engine.global.similarity_threshold,
            global_confidence_threshold: engine.global.confidence_threshold,
            global_active_window_days: engine.global.active_window_days,
            global_batch_max: engine.global.batch_max,
            classifier_rule_threshold: engine.classify.rule_threshold,
            soft_deadline_secs: engine.global.soft_deadline_secs,
            summary_concurrency: engine.global.summary_concurrency,
        }
    }
}

/// Per-task prompt/completion budgets, in estimated tokens.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TokenBudgetConfig {
    pub period_prompt: usize,
    pub period_completion: u32,
    pub relation_prompt: usize,
    pub relation_completion: u32,
    pub classify_prompt: usize,
    pub classify_completion: u32,
    pub summary_prompt: usize,
    pub summary_completion: u32,
}

impl Default for TokenBudgetConfig {
    fn default() -> Self {
        let engine = EngineSettings::default();
        Self {
            period_prompt: engine.period.max_prompt_tokens,
            period_completion: engine.period.max_completion_tokens,
            relation_prompt: engine.global.max_prompt_tokens,
            relation_completion: engine.global.max_completion_tokens,
            classify_prompt: engine.classify.max_prompt_tokens,
            classify_completion: engine.classify.max_completion_tokens,
            summary_prompt: engine.summary.max_prompt_tokens,
            summary_completion: engine.summary.max_completion_tokens,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LlmConfig {
    pub base_url: String,
    pub api_key: String,
    pub model: String,
    pub temperature: f32,
    pub max_tokens: u32,
    pub timeout_seconds: u64,
    pub max_retries: u32,
    /// Context-limit overrides merged over the built-in table.
    pub context_limits: HashMap<String, u32>,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:8000/v1".to_string(),
            api_key: "sk-xxx".to_string(),
            model: "qwen3-32b".to_string(),
            temperature: 0.3,
            max_tokens: 2048,
            timeout_seconds: 60,
            max_retries: 3,
            context_limits: HashMap::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EmbeddingConfig {
    pub base_url: String,
    pub api_key: String,
    pub model: String,
    pub dimension: usize,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:8000/v1".to_string(),
            api_key: "sk-xxx".to_string(),
            model: "Qwen3-Embedding-8B".to_string(),
            dimension: 4096,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ScheduleConfig {
    /// Local hours at which ingestion fans out.
    pub ingest_hours: Vec<u32>,
    /// Local hours whose windows get merged (period at :15, global at :30).
    pub merge_hours: Vec<u32>,
    pub period_merge_minute: u32,
    pub global_merge_minute: u32,
    /// Local hour of the daily category-metrics recompute.
    pub metrics_hour: u32,
    pub metrics_window_days: i64,
    pub utc_offset_hours: i32,
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self {
            ingest_hours: vec![8, 10, 12, 14, 16, 18, 20, 22],
            merge_hours: vec![12, 18, 22],
            period_merge_minute: 15,
            global_merge_minute: 30,
            metrics_hour: 1,
            metrics_window_days: 365,
            utc_offset_hours: DEFAULT_UTC_OFFSET_HOURS,
        }
    }
}

/// Whole-process configuration, loaded from TOML. Every section has usable
/// defaults so a missing file means a dev-default deployment.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub data: DataConfig,
    pub ingest: IngestConfig,
    pub heat: HeatConfig,
    pub merge: MergeConfig,
    pub tokens: TokenBudgetConfig,
    pub llm: LlmConfig,
    pub embedding: EmbeddingConfig,
    pub schedule: ScheduleConfig,
}

impl Config {
    pub fn load_from(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("reading config {}", path.display()))?;
        let config: Config = toml::from_str(&content)
            .with_context(|| format!("parsing config {}", path.display()))?;
        Ok(config)
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Map the flat config onto the engine's settings structs.
    pub fn engine_settings(&self) -> EngineSettings {
        let mut settings = EngineSettings::default();
        settings.period.vector_threshold = self.merge.period_vector_threshold;
        settings.period.title_threshold = self.merge.period_title_threshold;
        settings.period.min_occurrence = self.merge.period_min_occurrence;
        settings.period.soft_deadline_secs = self.merge.soft_deadline_secs;
        settings.period.max_prompt_tokens = self.tokens.period_prompt;
        settings.period.max_completion_tokens = self.tokens.period_completion;
        settings.global.top_k = self.merge.global_topk_candidates;
        settings.global.similarity_threshold = self.merge.global_similarity_threshold;
        settings.global.confidence_threshold = self.merge.global_confidence_threshold;
        settings.global.active_window_days = self.merge.global_active_window_days;
        settings.global.batch_max = self.merge.global_batch_max;
        settings.global.soft_deadline_secs = self.merge.soft_deadline_secs;
        settings.global.summary_concurrency = self.merge.summary_concurrency;
        settings.global.max_prompt_tokens = self.tokens.relation_prompt;
        settings.global.max_completion_tokens = self.tokens.relation_completion;
        settings.classify.rule_threshold = self.merge.classifier_rule_threshold;
        settings.classify.max_prompt_tokens = self.tokens.classify_prompt;
        settings.classify.max_completion_tokens = self.tokens.classify_completion;
        settings.summary.max_prompt_tokens = self.tokens.summary_prompt;
        settings.summary.max_completion_tokens = self.tokens.summary_completion;
        settings.embedding_dimension = self.embedding.dimension;
        settings.utc_offset_hours = self.schedule.utc_offset_hours;
        settings
    }

    /// Built-in context-limit table with config overrides on top.
    pub fn context_limits(&self) -> HashMap<String, u32> {
        let mut limits = default_context_limits();
        for (model, limit) in &self.llm.context_limits {
            limits.insert(model.clone(), *limit);
        }
        limits
    }
}
