// Domain types shared across the trendpulse workspace.
// Schemas only; storage and pipeline behavior live in the sibling crates.

mod embedding;
mod error;
mod item;
pub mod model_limits;
mod run;
mod summary;
mod topic;
mod window;

pub use embedding::{EmbeddingRecord, ObjectType, vector_key};
pub use error::{Error, Result};
pub use item::{Interactions, MergeStatus, ScrapedRecord, SourceItem, total_interactions};
pub use run::{
    IngestRun, Judgement, JudgementKind, PipelineRun, RunStatus, Stage, new_run_id,
};
pub use summary::{Summary, SummaryMethod};
pub use topic::{Category, CategoryMethod, PeriodHeat, Topic, TopicNode, TopicStatus};
pub use window::{DEFAULT_UTC_OFFSET_HOURS, Window, WindowSlot};
