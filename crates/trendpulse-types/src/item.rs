use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Merge-pipeline status of a source item. Transitions are monotonic:
/// `PendingPeriod -> {PendingGlobal, Discarded} -> Merged`; an item is never
/// moved backward, which is what makes both stages safe to replay.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MergeStatus {
    PendingPeriod,
    PendingGlobal,
    Merged,
    Discarded,
}

impl MergeStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            MergeStatus::PendingPeriod => "pending_period_merge",
            MergeStatus::PendingGlobal => "pending_global_merge",
            MergeStatus::Merged => "merged",
            MergeStatus::Discarded => "discarded",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "pending_period_merge" => Ok(MergeStatus::PendingPeriod),
            "pending_global_merge" => Ok(MergeStatus::PendingGlobal),
            "merged" => Ok(MergeStatus::Merged),
            "discarded" => Ok(MergeStatus::Discarded),
            other => Err(Error::Parse(format!("unknown merge status '{}'", other))),
        }
    }

    /// Whether the state machine permits moving from `self` to `next`.
    pub fn can_advance_to(&self, next: MergeStatus) -> bool {
        matches!(
            (self, next),
            (MergeStatus::PendingPeriod, MergeStatus::PendingGlobal)
                | (MergeStatus::PendingPeriod, MergeStatus::Discarded)
                | (MergeStatus::PendingGlobal, MergeStatus::Merged)
        )
    }
}

impl fmt::Display for MergeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Free-form interaction counters as reported by a platform (reposts,
/// comments, likes, views, favorites, anything else). Unknown keys are kept
/// verbatim.
pub type Interactions = BTreeMap<String, i64>;

/// Sum of the interaction counters the pipeline ranks by.
pub fn total_interactions(interactions: &Interactions) -> i64 {
    ["repost", "comment", "like", "view", "favorite"]
        .iter()
        .filter_map(|k| interactions.get(*k))
        .sum()
}

/// One crawled row. `dedup_key` is `platform:urlHash:runId` and is unique per
/// run, not per URL: the same URL across runs yields distinct rows so that
/// heat can be tracked longitudinally. Stage 1 carries the dedup burden.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceItem {
    pub id: i64,
    pub platform: String,
    pub title: String,
    pub summary: Option<String>,
    pub url: String,
    pub url_hash: String,
    pub dedup_key: String,
    pub published_at: Option<DateTime<Utc>>,
    pub fetched_at: DateTime<Utc>,
    pub interactions: Option<Interactions>,
    pub raw_heat: Option<f64>,
    pub normalized_heat: Option<f64>,
    pub window: String,
    pub cluster_id: Option<String>,
    pub occurrence_count: i64,
    pub status: MergeStatus,
    pub embedding_id: Option<i64>,
    pub run_id: Option<String>,
}

impl SourceItem {
    /// Text used for embedding and clustering: title plus summary.
    pub fn embed_text(&self) -> String {
        match &self.summary {
            Some(s) if !s.is_empty() => format!("{} {}", self.title, s),
            _ => self.title.clone(),
        }
    }
}

/// A record as handed over by a platform scraper. The core stores what it
/// receives and does no platform-specific parsing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScrapedRecord {
    pub platform: String,
    pub title: String,
    pub url: String,
    pub summary: Option<String>,
    pub published_at: Option<DateTime<Utc>>,
    pub interactions: Option<Interactions>,
    pub raw_heat: Option<f64>,
}
