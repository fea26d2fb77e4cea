use std::fmt;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

use crate::{Error, Result, WindowSlot};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TopicStatus {
    Active,
    Ended,
}

impl TopicStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TopicStatus::Active => "active",
            TopicStatus::Ended => "ended",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "active" => Ok(TopicStatus::Active),
            "ended" => Ok(TopicStatus::Ended),
            other => Err(Error::Parse(format!("unknown topic status '{}'", other))),
        }
    }
}

impl fmt::Display for TopicStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The three fixed topic categories.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Category {
    Entertainment,
    CurrentAffairs,
    SportsEsports,
}

impl Category {
    pub const ALL: [Category; 3] = [
        Category::Entertainment,
        Category::CurrentAffairs,
        Category::SportsEsports,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Category::Entertainment => "entertainment",
            Category::CurrentAffairs => "current_affairs",
            Category::SportsEsports => "sports_esports",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "entertainment" => Ok(Category::Entertainment),
            "current_affairs" => Ok(Category::CurrentAffairs),
            "sports_esports" => Ok(Category::SportsEsports),
            other => Err(Error::Parse(format!("unknown category '{}'", other))),
        }
    }
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How a topic's category was assigned.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CategoryMethod {
    Rule,
    Llm,
    Default,
    Manual,
}

impl CategoryMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            CategoryMethod::Rule => "rule",
            CategoryMethod::Llm => "llm",
            CategoryMethod::Default => "default",
            CategoryMethod::Manual => "manual",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "rule" => Ok(CategoryMethod::Rule),
            "llm" => Ok(CategoryMethod::Llm),
            "default" => Ok(CategoryMethod::Default),
            "manual" => Ok(CategoryMethod::Manual),
            other => Err(Error::Parse(format!("unknown category method '{}'", other))),
        }
    }
}

/// A persistent event accumulating clusters from multiple windows over days
/// or weeks. Created by Stage 2 when a cluster has no satisfactory candidate;
/// mutated only by Stage 2 (attachment) or by the classifier/summarizer
/// (derived fields); never deleted by the core.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Topic {
    pub id: i64,
    pub title_key: String,
    pub first_seen: DateTime<Utc>,
    pub last_active: DateTime<Utc>,
    pub status: TopicStatus,
    pub intensity_total: i64,
    pub interaction_total: Option<i64>,
    pub current_heat_normalized: Option<f64>,
    pub heat_percentage: Option<f64>,
    pub summary_id: Option<i64>,
    pub category: Option<Category>,
    pub category_confidence: Option<f64>,
    pub category_method: Option<CategoryMethod>,
    pub category_updated_at: Option<DateTime<Utc>>,
}

impl Topic {
    pub fn duration_hours(&self) -> f64 {
        (self.last_active - self.first_seen).num_seconds() as f64 / 3600.0
    }
}

/// Link from a topic to one source item. `(topic_id, source_item_id)` is
/// unique; rows are created at attachment and never updated.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TopicNode {
    pub id: i64,
    pub topic_id: i64,
    pub source_item_id: i64,
    pub appended_at: DateTime<Utc>,
}

/// Per-(topic, date, window-slot) heat snapshot. Replay overwrites heat and
/// count rather than summing, since Stage 2 recomputes them from the full
/// cluster.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeriodHeat {
    pub id: i64,
    pub topic_id: i64,
    pub date: NaiveDate,
    pub slot: WindowSlot,
    pub heat_normalized: f64,
    pub heat_percentage: f64,
    pub source_count: i64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_category_round_trip() {
        for cat in Category::ALL {
            assert_eq!(Category::parse(cat.as_str()).unwrap(), cat);
        }
        assert!(Category::parse("tech").is_err());
    }

    #[test]
    fn test_duration_hours() {
        use chrono::TimeZone;
        let topic = Topic {
            id: 1,
            title_key: "t".into(),
            first_seen: Utc.with_ymd_and_hms(2025, 11, 7, 8, 0, 0).unwrap(),
            last_active: Utc.with_ymd_and_hms(2025, 11, 7, 20, 30, 0).unwrap(),
            status: TopicStatus::Active,
            intensity_total: 0,
            interaction_total: None,
            current_heat_normalized: None,
            heat_percentage: None,
            summary_id: None,
            category: None,
            category_confidence: None,
            category_method: None,
            category_updated_at: None,
        };
        assert!((topic.duration_hours() - 12.5).abs() < 1e-9);
    }
}
