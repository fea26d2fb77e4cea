use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use futures::future::join_all;
use serde_json::json;
use sha2::{Digest, Sha256};
use tokio::sync::Semaphore;
use tracing::{info, warn};

use trendpulse_store::Store;
use trendpulse_store::queries::item::{self, NewSourceItem};
use trendpulse_store::queries::run;
use trendpulse_types::{IngestRun, RunStatus, ScrapedRecord, Window};

/// The scraper contract. One implementation per platform, living outside the
/// core; the core stores whatever records it is handed and does no
/// platform-specific parsing.
#[async_trait]
pub trait PlatformFetcher: Send + Sync {
    fn platform(&self) -> &str;

    async fn fetch_hot_list(&self, limit: usize) -> Result<Vec<ScrapedRecord>>;
}

#[derive(Debug, Clone)]
pub struct IngestReport {
    pub run_id: String,
    pub status: RunStatus,
    pub total_items: usize,
    pub new_items: usize,
    pub duplicate_items: usize,
    pub success_platforms: usize,
    pub failed_platforms: usize,
}

/// Fan ingestion out across platforms with bounded concurrency, then persist
/// everything under the current window tag. The per-run dedup key
/// (`platform:urlhash:runId`) deliberately lets the same URL reappear in
/// later runs; only repeats within this run are dropped.
pub async fn run_ingestion(
    store: &Store,
    fetchers: &[Arc<dyn PlatformFetcher>],
    limit: usize,
    concurrency: usize,
    window: &Window,
) -> Result<IngestReport> {
    let mut record = IngestRun::start(fetchers.len() as i64);
    let run_id = record.run_id.clone();
    run::upsert_ingest_run(&store.conn(), &record).context("recording ingest start")?;

    info!(run_id = %run_id, platforms = fetchers.len(), window = %window, "ingestion started");

    let semaphore = Arc::new(Semaphore::new(concurrency.max(1)));
    let mut tasks = Vec::with_capacity(fetchers.len());
    for fetcher in fetchers {
        let fetcher = fetcher.clone();
        let semaphore = semaphore.clone();
        tasks.push(tokio::spawn(async move {
            let _permit = semaphore.acquire_owned().await.expect("semaphore closed");
            let platform = fetcher.platform().to_string();
            let result = fetcher.fetch_hot_list(limit).await;
            (platform, result)
        }));
    }

    let mut platform_results = Vec::new();
    let mut total_items = 0usize;
    let mut new_items = 0usize;
    let mut duplicates = 0usize;
    let mut success_platforms = 0usize;
    let mut failed_platforms = 0usize;

    for joined in join_all(tasks).await {
        let (platform, result) = match joined {
            Ok(pair) => pair,
            Err(err) => {
                warn!(error = %err, "fetch task panicked");
                failed_platforms += 1;
                continue;
            }
        };

        match result {
            Ok(records) => {
                let fetched = records.len();
                let mut stored = 0usize;
                let mut skipped = 0usize;

                for scraped in records {
                    match persist_record(store, &run_id, window, &scraped)? {
                        true => stored += 1,
                        false => skipped += 1,
                    }
                }

                total_items += fetched;
                new_items += stored;
                duplicates += skipped;
                success_platforms += 1;
                platform_results.push(json!({
                    "platform": platform,
                    "status": "success",
                    "total": fetched,
                    "stored": stored,
                    "duplicates": skipped,
                }));
                info!(%platform, fetched, stored, "platform ingested");
            }
            Err(err) => {
                failed_platforms += 1;
                platform_results.push(json!({
                    "platform": platform,
                    "status": "failed",
                    "error": err.to_string(),
                }));
                warn!(%platform, error = %err, "platform fetch failed");
            }
        }
    }

    record.total_items = total_items as i64;
    record.success_items = new_items as i64;
    record.failed_items = (total_items - new_items) as i64;
    record.success_platforms = success_platforms as i64;
    record.failed_platforms = failed_platforms as i64;
    record.platform_results = Some(json!(platform_results));
    let status = if success_platforms == 0 && failed_platforms > 0 {
        RunStatus::Failed
    } else {
        RunStatus::Success
    };
    record.finish(status);
    run::upsert_ingest_run(&store.conn(), &record).context("finalizing ingest run")?;

    info!(
        run_id = %run_id,
        total_items,
        new_items,
        duplicates,
        success_platforms,
        failed_platforms,
        "ingestion finished"
    );

    Ok(IngestReport {
        run_id,
        status,
        total_items,
        new_items,
        duplicate_items: duplicates,
        success_platforms,
        failed_platforms,
    })
}

/// Store one scraped record; `false` means its dedup key already existed in
/// this run.
fn persist_record(
    store: &Store,
    run_id: &str,
    window: &Window,
    scraped: &ScrapedRecord,
) -> Result<bool> {
    let url_hash = short_hash(&scraped.url);
    let dedup_key = format!("{}:{}:{}", scraped.platform, url_hash, run_id);

    if item::dedup_key_exists(&store.conn(), &dedup_key)? {
        return Ok(false);
    }

    item::insert(
        &store.conn(),
        &NewSourceItem {
            platform: scraped.platform.clone(),
            title: scraped.title.clone(),
            summary: scraped.summary.clone(),
            url: scraped.url.clone(),
            url_hash,
            dedup_key,
            published_at: scraped.published_at,
            fetched_at: Utc::now(),
            interactions: scraped.interactions.clone(),
            raw_heat: scraped.raw_heat,
            window: *window,
            run_id: Some(run_id.to_string()),
        },
    )?;
    Ok(true)
}

fn short_hash(url: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(url.as_bytes());
    let digest = hasher.finalize();
    digest[..8].iter().map(|b| format!("{:02x}", b)).collect()
}
