use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::EnvFilter;

use trendpulse_runtime::scheduler::Scheduler;
use trendpulse_runtime::{Config, run_global_stage, run_metrics_stage, run_period_stage};
use trendpulse_store::Store;
use trendpulse_store::queries::run;
use trendpulse_types::{Stage, Window};

#[derive(Parser)]
#[command(name = "trendpulse", version, about = "Cross-platform hot-topic tracking pipeline")]
struct Cli {
    /// Config file location
    #[arg(long, global = true, default_value = "trendpulse.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Write a default config file
    Init,
    /// Run the scheduler until interrupted
    Serve,
    /// Run heat normalization plus the period merge for a window
    MergePeriod {
        /// Window like 2025-11-07_AM (defaults to the current one)
        #[arg(long)]
        window: Option<String>,
    },
    /// Run the global merge for a window
    MergeGlobal {
        /// Window like 2025-11-07_AM (defaults to the current one)
        #[arg(long)]
        window: Option<String>,
    },
    /// Recompute per-category metrics
    RecomputeMetrics,
    /// Show recent stage runs
    Status {
        #[arg(long, default_value_t = 5)]
        limit: usize,
    },
}

fn parse_window(raw: Option<String>) -> Result<Option<Window>> {
    raw.map(|s| Window::parse(&s).context("invalid window, expected YYYY-MM-DD_{AM|PM|EVE}"))
        .transpose()
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Command::Init => {
            if cli.config.exists() {
                anyhow::bail!("{} already exists", cli.config.display());
            }
            Config::default().save_to(&cli.config)?;
            println!("wrote {}", cli.config.display());
        }
        Command::Serve => {
            let config = Config::load_from(&cli.config)?;
            info!(config = %cli.config.display(), "starting scheduler");
            let scheduler = Scheduler::new(config);
            scheduler
                .run_until(async {
                    let _ = tokio::signal::ctrl_c().await;
                })
                .await;
        }
        Command::MergePeriod { window } => {
            let config = Config::load_from(&cli.config)?;
            let report = run_period_stage(&config, parse_window(window)?).await?;
            println!(
                "period merge {}: input={} kept={} dropped={} clusters={}",
                report.run_id,
                report.input_items,
                report.kept_items,
                report.dropped_items,
                report.cluster_count
            );
        }
        Command::MergeGlobal { window } => {
            let config = Config::load_from(&cli.config)?;
            let report = run_global_stage(&config, parse_window(window)?).await?;
            println!(
                "global merge {}: clusters={} merged={} created={} skipped={}",
                report.run_id,
                report.processed_clusters,
                report.merge_count,
                report.new_count,
                report.skipped_clusters
            );
        }
        Command::RecomputeMetrics => {
            let config = Config::load_from(&cli.config)?;
            let all = run_metrics_stage(&config)?;
            for m in all {
                println!(
                    "{}: topics={} avg_duration_h={:.1} intensity={}",
                    m.category, m.topic_count, m.avg_duration_hours, m.intensity_sum
                );
            }
        }
        Command::Status { limit } => {
            let config = Config::load_from(&cli.config)?;
            let store = Store::open(&config.data.db_path)?;
            for stage in [Stage::PeriodMerge, Stage::GlobalMerge, Stage::CategoryMetrics] {
                let runs = run::list_pipeline_runs(&store.conn(), stage.as_str(), limit)?;
                println!("{} ({} runs)", stage, runs.len());
                for r in runs {
                    println!(
                        "  {} {} started={} in={} out={} {}",
                        r.run_id,
                        r.status,
                        r.started_at.format("%Y-%m-%d %H:%M:%S"),
                        r.input_count,
                        r.output_count,
                        r.error_summary.unwrap_or_default()
                    );
                }
            }
        }
    }

    Ok(())
}
