use anyhow::{Context, Result};
use chrono::{Duration, Utc};
use serde_json::json;
use tracing::{info, warn};

use trendpulse_store::Store;
use trendpulse_store::queries::metrics::{self, CategoryMetrics};
use trendpulse_store::queries::{run, topic};
use trendpulse_types::{Category, PipelineRun, RunStatus, Stage};

/// Daily recompute of per-category aggregates over a rolling window: topic
/// count, mean echo duration and intensity sum. Rows are replaced wholesale.
pub fn recompute_category_metrics(store: &Store, window_days: i64) -> Result<Vec<CategoryMetrics>> {
    let mut record = PipelineRun::start(Stage::CategoryMetrics);
    run::upsert_pipeline_run(&store.conn(), &record).context("recording metrics start")?;

    match compute(store, window_days) {
        Ok(all) => {
            record.input_count = all.iter().map(|m| m.topic_count).sum();
            record.output_count = all.len() as i64;
            record.success_count = all.len() as i64;
            record.results = Some(json!({
                "window_days": window_days,
                "categories": all
                    .iter()
                    .map(|m| json!({
                        "category": m.category.as_str(),
                        "topic_count": m.topic_count,
                        "avg_duration_hours": m.avg_duration_hours,
                        "intensity_sum": m.intensity_sum,
                    }))
                    .collect::<Vec<_>>(),
            }));
            record.finish(RunStatus::Success);
            run::upsert_pipeline_run(&store.conn(), &record)?;
            info!(window_days, categories = all.len(), "category metrics recomputed");
            Ok(all)
        }
        Err(err) => {
            record.error_summary = Some(err.to_string());
            record.finish(RunStatus::Failed);
            if let Err(persist_err) = run::upsert_pipeline_run(&store.conn(), &record) {
                warn!(error = %persist_err, "failed to finalize metrics run");
            }
            Err(err)
        }
    }
}

fn compute(store: &Store, window_days: i64) -> Result<Vec<CategoryMetrics>> {
    let now = Utc::now();
    let since = now - Duration::days(window_days);
    let mut all = Vec::with_capacity(Category::ALL.len());

    for category in Category::ALL {
        let topics = topic::list_since(&store.conn(), category, since)?;

        let topic_count = topics.len() as i64;
        let intensity_sum: i64 = topics.iter().map(|t| t.intensity_total).sum();
        let avg_duration_hours = if topics.is_empty() {
            0.0
        } else {
            topics.iter().map(|t| t.duration_hours()).sum::<f64>() / topics.len() as f64
        };

        let entry = CategoryMetrics {
            category,
            topic_count,
            avg_duration_hours,
            intensity_sum,
            window_days,
            computed_at: now,
        };
        metrics::upsert(&store.conn(), &entry)?;
        all.push(entry);
    }

    Ok(all)
}
