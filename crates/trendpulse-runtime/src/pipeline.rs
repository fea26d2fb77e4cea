use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tracing::info;

use trendpulse_engine::{
    GlobalMergeReport, PeriodMergeReport, Services, normalize_window_heat, run_global_merge,
    run_period_merge,
};
use trendpulse_llm::{OpenAiCompatibleProvider, RetryPolicy, TokenAccountant};
use trendpulse_store::Store;
use trendpulse_store::queries::metrics::CategoryMetrics;
use trendpulse_types::Window;
use trendpulse_vector::VectorIndex;

use crate::config::Config;
use crate::ingest::{IngestReport, PlatformFetcher, run_ingestion};
use crate::metrics::recompute_category_metrics;

/// Open stores and endpoint clients per the config. Called once per stage
/// invocation; connections are cheap and short-lived runs keep replay simple.
pub fn build_services(config: &Config) -> Result<Services> {
    let store = Store::open(&config.data.db_path)
        .with_context(|| format!("opening store {}", config.data.db_path.display()))?;
    let vector = VectorIndex::open(&config.data.vector_path)
        .with_context(|| format!("opening vector index {}", config.data.vector_path.display()))?;

    let retry = RetryPolicy {
        max_retries: config.llm.max_retries,
        ..RetryPolicy::default()
    };
    let chat = Arc::new(
        OpenAiCompatibleProvider::with_timeout(
            &config.llm.base_url,
            &config.llm.api_key,
            &config.llm.model,
            Duration::from_secs(config.llm.timeout_seconds),
        )
        .with_retry(retry)
        .with_defaults(config.llm.temperature, config.llm.max_tokens),
    );
    let embedder = Arc::new(
        OpenAiCompatibleProvider::with_timeout(
            &config.embedding.base_url,
            &config.embedding.api_key,
            &config.embedding.model,
            Duration::from_secs(config.llm.timeout_seconds),
        )
        .with_retry(retry),
    );

    Ok(Services::new(store, vector, chat, embedder))
}

pub fn build_accountant(config: &Config) -> TokenAccountant {
    TokenAccountant::new(&config.llm.model, &config.context_limits())
}

fn resolve_window(config: &Config, window: Option<Window>) -> Window {
    window.unwrap_or_else(|| Window::current(config.schedule.utc_offset_hours))
}

/// Heat normalization followed by Stage 1 for one window (the current one by
/// default).
pub async fn run_period_stage(
    config: &Config,
    window: Option<Window>,
) -> Result<PeriodMergeReport> {
    let window = resolve_window(config, window);
    let services = build_services(config)?;
    let settings = config.engine_settings();
    let accountant = build_accountant(config);

    let heat = normalize_window_heat(&services.store, &window, &config.heat.platform_weights)?;
    info!(window = %window, items = heat.total_items, "heat normalized");

    run_period_merge(&services, &settings, &accountant, &window).await
}

/// Stage 2 for one window (the current one by default).
pub async fn run_global_stage(
    config: &Config,
    window: Option<Window>,
) -> Result<GlobalMergeReport> {
    let window = resolve_window(config, window);
    let services = build_services(config)?;
    let settings = config.engine_settings();
    let accountant = build_accountant(config);

    run_global_merge(&services, &settings, &accountant, &window).await
}

/// Ingestion fan-out over the registered fetchers, tagged with the current
/// window.
pub async fn run_ingest_stage(
    config: &Config,
    fetchers: &[Arc<dyn PlatformFetcher>],
) -> Result<IngestReport> {
    let window = Window::current(config.schedule.utc_offset_hours);
    let store = Store::open(&config.data.db_path)?;
    run_ingestion(
        &store,
        fetchers,
        config.ingest.fetch_limit_per_platform,
        config.ingest.fetch_concurrency,
        &window,
    )
    .await
}

pub fn run_metrics_stage(config: &Config) -> Result<Vec<CategoryMetrics>> {
    let store = Store::open(&config.data.db_path)?;
    recompute_category_metrics(&store, config.schedule.metrics_window_days)
}
