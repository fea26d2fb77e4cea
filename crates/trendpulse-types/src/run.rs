use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RunStatus {
    Running,
    Success,
    Failed,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Running => "running",
            RunStatus::Success => "success",
            RunStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "running" => Ok(RunStatus::Running),
            "success" => Ok(RunStatus::Success),
            "failed" => Ok(RunStatus::Failed),
            other => Err(Error::Parse(format!("unknown run status '{}'", other))),
        }
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Pipeline stage names as recorded on audit rows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Stage {
    PeriodMerge,
    GlobalMerge,
    CategoryMetrics,
}

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::PeriodMerge => "period_merge",
            Stage::GlobalMerge => "global_merge",
            Stage::CategoryMetrics => "category_metrics",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Short random run id with a stage prefix, e.g. `period_merge_3fa9c1d204b7`.
pub fn new_run_id(prefix: &str) -> String {
    let hex = Uuid::new_v4().simple().to_string();
    format!("{}_{}", prefix, &hex[..12])
}

/// Audit record for one stage invocation. Written at start (`running`) and
/// finalized on completion or error; the result blob carries stage-specific
/// counters and any skipped-cluster incidents.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineRun {
    pub run_id: String,
    pub stage: String,
    pub status: RunStatus,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub duration_ms: Option<i64>,
    pub input_count: i64,
    pub output_count: i64,
    pub success_count: i64,
    pub failed_count: i64,
    pub results: Option<serde_json::Value>,
    pub error_summary: Option<String>,
}

impl PipelineRun {
    pub fn start(stage: Stage) -> Self {
        Self {
            run_id: new_run_id(stage.as_str()),
            stage: stage.as_str().to_string(),
            status: RunStatus::Running,
            started_at: Utc::now(),
            ended_at: None,
            duration_ms: None,
            input_count: 0,
            output_count: 0,
            success_count: 0,
            failed_count: 0,
            results: None,
            error_summary: None,
        }
    }

    pub fn finish(&mut self, status: RunStatus) {
        let ended = Utc::now();
        self.duration_ms = Some((ended - self.started_at).num_milliseconds());
        self.ended_at = Some(ended);
        self.status = status;
    }
}

/// Audit record for one ingestion fan-out across platforms.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IngestRun {
    pub run_id: String,
    pub status: RunStatus,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub duration_ms: Option<i64>,
    pub total_platforms: i64,
    pub success_platforms: i64,
    pub failed_platforms: i64,
    pub total_items: i64,
    pub success_items: i64,
    pub failed_items: i64,
    pub platform_results: Option<serde_json::Value>,
    pub error_summary: Option<String>,
}

impl IngestRun {
    pub fn start(total_platforms: i64) -> Self {
        Self {
            run_id: new_run_id("ingest"),
            status: RunStatus::Running,
            started_at: Utc::now(),
            ended_at: None,
            duration_ms: None,
            total_platforms,
            success_platforms: 0,
            failed_platforms: 0,
            total_items: 0,
            success_items: 0,
            failed_items: 0,
            platform_results: None,
            error_summary: None,
        }
    }

    pub fn finish(&mut self, status: RunStatus) {
        let ended = Utc::now();
        self.duration_ms = Some((ended - self.started_at).num_milliseconds());
        self.ended_at = Some(ended);
        self.status = status;
    }
}

/// Kind of an LLM call made by the pipeline, as recorded in the judgement log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum JudgementKind {
    PeriodMerge,
    Relation,
    Classify,
    SummaryFull,
    SummaryIncremental,
}

impl JudgementKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            JudgementKind::PeriodMerge => "period_merge",
            JudgementKind::Relation => "relation",
            JudgementKind::Classify => "classify",
            JudgementKind::SummaryFull => "summary_full",
            JudgementKind::SummaryIncremental => "summary_incremental",
        }
    }
}

/// One row per LLM call: the request/response pair, token usage and latency.
/// Malformed model output is recorded here raw before any fallback parsing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Judgement {
    pub id: i64,
    pub kind: String,
    pub status: String,
    pub request: serde_json::Value,
    pub response: Option<serde_json::Value>,
    pub error_message: Option<String>,
    pub latency_ms: Option<i64>,
    pub tokens_prompt: Option<i64>,
    pub tokens_completion: Option<i64>,
    pub provider: String,
    pub model: String,
    pub created_at: DateTime<Utc>,
}
