// Process-level wiring for trendpulse: configuration, ingestion fan-out,
// the daily scheduler, and per-stage entry points shared by the CLI.

pub mod config;
pub mod ingest;
pub mod metrics;
pub mod pipeline;
pub mod scheduler;

pub use config::Config;
pub use ingest::{IngestReport, PlatformFetcher, run_ingestion};
pub use metrics::recompute_category_metrics;
pub use pipeline::{
    build_accountant, build_services, run_global_stage, run_ingest_stage, run_metrics_stage,
    run_period_stage,
};
pub use scheduler::{Scheduler, StageLocks, Trigger, next_trigger};
