use trendpulse_types::DEFAULT_UTC_OFFSET_HOURS;

/// Stage 1 knobs.
#[derive(Debug, Clone)]
pub struct PeriodMergeSettings {
    /// Cosine similarity gate for candidate clustering.
    pub vector_threshold: f64,
    /// Title bigram-Jaccard gate, applied on top of the vector gate.
    pub title_threshold: f64,
    /// Clusters smaller than this are discarded as single-occurrence noise.
    pub min_occurrence: usize,
    /// Same-event confirmations below this confidence split the cluster.
    pub confirm_confidence: f64,
    /// Soft deadline for one run, in seconds. Unconfirmed clusters stay
    /// pending for the next schedule.
    pub soft_deadline_secs: u64,
    pub max_prompt_tokens: usize,
    pub max_completion_tokens: u32,
    pub max_title_tokens: usize,
    pub max_item_summary_tokens: usize,
}

impl Default for PeriodMergeSettings {
    fn default() -> Self {
        Self {
            vector_threshold: 0.85,
            title_threshold: 0.6,
            min_occurrence: 2,
            confirm_confidence: 0.8,
            soft_deadline_secs: 900,
            max_prompt_tokens: 2000,
            max_completion_tokens: 300,
            max_title_tokens: 80,
            max_item_summary_tokens: 150,
        }
    }
}

/// Stage 2 knobs.
#[derive(Debug, Clone)]
pub struct GlobalMergeSettings {
    /// Candidates fetched per cluster (hard-capped at 3).
    pub top_k: usize,
    /// Candidates below this cosine similarity are dropped before the LLM
    /// ever sees them.
    pub similarity_threshold: f64,
    /// Merge decisions below this confidence create a new topic instead.
    pub confidence_threshold: f64,
    /// Only topics active within this many days are merge candidates.
    pub active_window_days: i64,
    /// Clusters processed per run; the rest wait for the next schedule.
    pub batch_max: usize,
    /// Soft deadline for one run, in seconds.
    pub soft_deadline_secs: u64,
    /// Fan-out width for end-of-run full-summary generation.
    pub summary_concurrency: usize,
    pub max_prompt_tokens: usize,
    pub max_completion_tokens: u32,
    pub max_candidate_tokens: usize,
}

impl Default for GlobalMergeSettings {
    fn default() -> Self {
        Self {
            top_k: 3,
            similarity_threshold: 0.5,
            confidence_threshold: 0.75,
            active_window_days: 180,
            batch_max: 200,
            soft_deadline_secs: 900,
            summary_concurrency: 5,
            max_prompt_tokens: 2500,
            max_completion_tokens: 300,
            max_candidate_tokens: 200,
        }
    }
}

/// Classifier knobs.
#[derive(Debug, Clone)]
pub struct ClassifySettings {
    /// Rule-pass acceptance threshold on the max-normalized score.
    pub rule_threshold: f64,
    pub max_prompt_tokens: usize,
    pub max_completion_tokens: u32,
}

impl Default for ClassifySettings {
    fn default() -> Self {
        Self {
            rule_threshold: 0.6,
            max_prompt_tokens: 1500,
            max_completion_tokens: 300,
        }
    }
}

/// Summarizer knobs.
#[derive(Debug, Clone)]
pub struct SummarySettings {
    /// Incremental updates need at least this many new nodes...
    pub min_nodes_for_update: usize,
    /// ...and at least this many hours since the last summary.
    pub update_interval_hours: i64,
    /// Key-node selection cap for full summaries.
    pub max_context_nodes: usize,
    pub max_prompt_tokens: usize,
    pub max_completion_tokens: u32,
}

impl Default for SummarySettings {
    fn default() -> Self {
        Self {
            min_nodes_for_update: 3,
            update_interval_hours: 6,
            max_context_nodes: 15,
            max_prompt_tokens: 4000,
            max_completion_tokens: 1000,
        }
    }
}

/// Everything the pipeline stages read. Runtime builds this from the loaded
/// config; tests use the defaults.
#[derive(Debug, Clone)]
pub struct EngineSettings {
    pub period: PeriodMergeSettings,
    pub global: GlobalMergeSettings,
    pub classify: ClassifySettings,
    pub summary: SummarySettings,
    /// Fixed per deployment by the embedding model; only the degraded
    /// random-vector path needs to know it up front.
    pub embedding_dimension: usize,
    pub utc_offset_hours: i32,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            period: PeriodMergeSettings::default(),
            global: GlobalMergeSettings::default(),
            classify: ClassifySettings::default(),
            summary: SummarySettings::default(),
            embedding_dimension: 4096,
            utc_offset_hours: DEFAULT_UTC_OFFSET_HOURS,
        }
    }
}
