use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SummaryMethod {
    Full,
    Incremental,
    Placeholder,
}

impl SummaryMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            SummaryMethod::Full => "full",
            SummaryMethod::Incremental => "incremental",
            SummaryMethod::Placeholder => "placeholder",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "full" => Ok(SummaryMethod::Full),
            "incremental" => Ok(SummaryMethod::Incremental),
            "placeholder" => Ok(SummaryMethod::Placeholder),
            other => Err(Error::Parse(format!("unknown summary method '{}'", other))),
        }
    }
}

impl fmt::Display for SummaryMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One summary generation. A topic's `summary_id` points at the latest row;
/// older rows are retained as history. The latest summary is the topic's
/// retrieval surrogate: its embedding, not the raw nodes', is what Stage 2
/// searches.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Summary {
    pub id: i64,
    pub topic_id: i64,
    pub content: String,
    pub method: SummaryMethod,
    pub generated_at: DateTime<Utc>,
    pub provider: String,
    pub model: String,
}
