use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use chrono::Utc;
use rand::Rng;
use serde_json::json;
use tracing::{info, warn};
use uuid::Uuid;

use trendpulse_llm::{ChatMessage, ChatOptions, TokenAccountant};
use trendpulse_store::queries::judgement::{self, NewJudgement};
use trendpulse_store::queries::{embedding, item, run};
use trendpulse_types::{
    JudgementKind, MergeStatus, ObjectType, PipelineRun, RunStatus, SourceItem, Stage, Window,
    vector_key,
};
use trendpulse_vector::Metadata;

use crate::cluster::greedy_cluster;
use crate::parse::{confidence_from, parse_llm_json};
use crate::services::Services;
use crate::settings::EngineSettings;

#[derive(Debug, Clone)]
pub struct PeriodMergeReport {
    pub run_id: String,
    pub status: RunStatus,
    pub input_items: usize,
    pub kept_items: usize,
    pub dropped_items: usize,
    pub cluster_count: usize,
}

/// Stage 1: de-noise one window.
///
/// Embeds every pending item, clusters by cosine + title gate, confirms
/// multi-item clusters with the LLM, then keeps clusters of at least
/// `min_occurrence` items (status `pending_global_merge`) and discards the
/// rest. Embedding and LLM failures degrade (random vectors, singleton
/// split); only store failures fail the run.
pub async fn run_period_merge(
    services: &Services,
    settings: &EngineSettings,
    accountant: &TokenAccountant,
    window: &Window,
) -> Result<PeriodMergeReport> {
    let mut run = PipelineRun::start(Stage::PeriodMerge);
    run::upsert_pipeline_run(&services.store.conn(), &run)
        .context("recording period merge start")?;

    match execute(services, settings, accountant, window, &mut run).await {
        Ok(report) => Ok(report),
        Err(err) => {
            run.error_summary = Some(err.to_string());
            run.finish(RunStatus::Failed);
            if let Err(persist_err) = run::upsert_pipeline_run(&services.store.conn(), &run) {
                warn!(error = %persist_err, "failed to finalize failed period merge run");
            }
            Err(err)
        }
    }
}

async fn execute(
    services: &Services,
    settings: &EngineSettings,
    accountant: &TokenAccountant,
    window: &Window,
    run: &mut PipelineRun,
) -> Result<PeriodMergeReport> {
    let items = item::list_by_window_status(&services.store.conn(), window, MergeStatus::PendingPeriod)
        .context("loading pending items")?;

    if items.is_empty() {
        run.results = Some(json!({"status": "no_data", "window": window.to_string(), "input_items": 0}));
        run.finish(RunStatus::Success);
        run::upsert_pipeline_run(&services.store.conn(), run)?;
        info!(window = %window, "period merge: nothing pending");
        return Ok(PeriodMergeReport {
            run_id: run.run_id.clone(),
            status: RunStatus::Success,
            input_items: 0,
            kept_items: 0,
            dropped_items: 0,
            cluster_count: 0,
        });
    }

    info!(window = %window, items = items.len(), "period merge started");

    let started = Instant::now();
    let deadline = Duration::from_secs(settings.period.soft_deadline_secs);
    let vectors = vectorize_items(services, settings, &items).await?;

    let titles: Vec<&str> = items.iter().map(|it| it.title.as_str()).collect();
    let candidates = greedy_cluster(
        &vectors,
        &titles,
        settings.period.vector_threshold,
        settings.period.title_threshold,
    );
    info!(candidate_groups = candidates.len(), "vector clustering finished");

    let (confirmed, deferred) =
        confirm_clusters(services, settings, accountant, &items, candidates, started, deadline)
            .await;
    info!(
        clusters = confirmed.len(),
        deferred, "LLM confirmation finished"
    );

    let mut kept = 0usize;
    let mut dropped = 0usize;
    let mut incidents: Vec<String> = Vec::new();
    let mut cluster_stats = Vec::new();

    for group in &confirmed {
        let cluster_id = new_cluster_id();
        let occurrence = group.len() as i64;
        let next = if group.len() >= settings.period.min_occurrence {
            MergeStatus::PendingGlobal
        } else {
            MergeStatus::Discarded
        };

        for &idx in group {
            let item_id = items[idx].id;
            match item::assign_cluster(&services.store.conn(), item_id, &cluster_id, occurrence, next) {
                Ok(()) => match next {
                    MergeStatus::PendingGlobal => kept += 1,
                    _ => dropped += 1,
                },
                Err(trendpulse_store::Error::InvalidTransition { item_id, from, to }) => {
                    warn!(item_id, %from, %to, "skipping item with out-of-order status");
                    incidents.push(format!("item {}: {} -> {}", item_id, from, to));
                }
                Err(err) => return Err(err).context("assigning cluster"),
            }
        }

        let heats: Vec<f64> = group
            .iter()
            .filter_map(|&idx| items[idx].normalized_heat)
            .collect();
        cluster_stats.push(json!({
            "cluster_id": cluster_id,
            "size": group.len(),
            "kept": next == MergeStatus::PendingGlobal,
            "avg_heat": if heats.is_empty() { 0.0 } else { heats.iter().sum::<f64>() / heats.len() as f64 },
            "max_heat": heats.iter().copied().fold(0.0f64, f64::max),
        }));
    }

    run.input_count = items.len() as i64;
    run.output_count = kept as i64;
    run.success_count = kept as i64;
    run.failed_count = dropped as i64;
    run.results = Some(json!({
        "status": "success",
        "window": window.to_string(),
        "input_items": items.len(),
        "kept_items": kept,
        "dropped_items": dropped,
        "merge_groups": confirmed.len(),
        "keep_rate": kept as f64 / items.len() as f64,
        "clusters": cluster_stats,
        "skipped_items": incidents,
        "deferred_clusters": deferred,
        "partial": deferred > 0,
    }));
    run.finish(RunStatus::Success);
    run::upsert_pipeline_run(&services.store.conn(), run)?;

    info!(
        window = %window,
        input = items.len(),
        kept,
        dropped,
        "period merge finished"
    );

    Ok(PeriodMergeReport {
        run_id: run.run_id.clone(),
        status: RunStatus::Success,
        input_items: items.len(),
        kept_items: kept,
        dropped_items: dropped,
        cluster_count: confirmed.len(),
    })
}

/// Batch-embed the window's items. Vectors are persisted to the embeddings
/// table and mirrored into the search index; when the endpoint is down,
/// random unit vectors (dev/test quality) keep the stage moving and are
/// recorded as such.
async fn vectorize_items(
    services: &Services,
    settings: &EngineSettings,
    items: &[SourceItem],
) -> Result<Vec<Vec<f32>>> {
    let texts: Vec<String> = items.iter().map(|it| it.embed_text()).collect();

    match services.embedder.embed(&texts).await {
        Ok(vectors) => {
            let now = Utc::now();
            let mut ids = Vec::with_capacity(items.len());
            let mut metadatas = Vec::with_capacity(items.len());
            let mut documents = Vec::with_capacity(items.len());

            for (it, vector) in items.iter().zip(vectors.iter()) {
                let embedding_id = embedding::insert(
                    &services.store.conn(),
                    ObjectType::SourceItem,
                    it.id,
                    services.embedder.provider_name(),
                    services.embedder.model(),
                    vector,
                    now,
                )?;
                item::set_embedding_id(&services.store.conn(), it.id, embedding_id)?;

                let mut metadata = Metadata::new();
                metadata.insert("object_type".into(), json!("source_item"));
                metadata.insert("object_id".into(), json!(it.id));
                metadata.insert("platform".into(), json!(it.platform));
                metadata.insert(
                    "title".into(),
                    json!(it.title.chars().take(200).collect::<String>()),
                );
                ids.push(vector_key(ObjectType::SourceItem, it.id));
                metadatas.push(metadata);
                documents.push(it.embed_text().chars().take(500).collect::<String>());
            }

            if let Err(err) = services.vector.upsert(&ids, &vectors, &metadatas, Some(&documents)) {
                warn!(error = %err, "vector index sync failed, continuing on embeddings table");
            }
            Ok(vectors)
        }
        Err(err) => {
            warn!(error = %err, "embedding endpoint failed, degrading to random vectors");
            let now = Utc::now();
            let mut vectors = Vec::with_capacity(items.len());
            for it in items {
                let vector = random_unit_vector(settings.embedding_dimension);
                embedding::insert(
                    &services.store.conn(),
                    ObjectType::SourceItem,
                    it.id,
                    "random",
                    "random",
                    &vector,
                    now,
                )?;
                vectors.push(vector);
            }
            Ok(vectors)
        }
    }
}

/// Ask the LLM whether each multi-item candidate cluster reports one event.
/// Confirmed clusters survive; everything else (including every failure
/// mode) splits into singletons. On deadline expiry, the unconfirmed
/// remainder is deferred: those items keep their pending status and the next
/// schedule picks them up.
async fn confirm_clusters(
    services: &Services,
    settings: &EngineSettings,
    accountant: &TokenAccountant,
    items: &[SourceItem],
    candidates: Vec<Vec<usize>>,
    started: Instant,
    deadline: Duration,
) -> (Vec<Vec<usize>>, usize) {
    let mut confirmed = Vec::new();
    let mut deferred = 0usize;

    for group in candidates {
        if group.len() < 2 {
            confirmed.push(group);
            continue;
        }
        if started.elapsed() >= deadline {
            warn!("soft deadline reached, deferring remaining clusters");
            deferred += 1;
            continue;
        }

        match judge_same_event(services, settings, accountant, items, &group).await {
            Some(true) => confirmed.push(group),
            _ => {
                for idx in group {
                    confirmed.push(vec![idx]);
                }
            }
        }
    }

    (confirmed, deferred)
}

async fn judge_same_event(
    services: &Services,
    settings: &EngineSettings,
    accountant: &TokenAccountant,
    items: &[SourceItem],
    group: &[usize],
) -> Option<bool> {
    let mut lines = Vec::new();
    for (pos, &idx) in group.iter().enumerate() {
        let it = &items[idx];
        let title = accountant.truncate(&it.title, settings.period.max_title_tokens, true);
        let summary = match &it.summary {
            Some(s) if !s.is_empty() => {
                accountant.truncate(s, settings.period.max_item_summary_tokens, true)
            }
            _ => "无".to_string(),
        };
        lines.push(format!(
            "[Item {}] 标题: {}  摘要: {}  平台: {}  时间: {}",
            pos + 1,
            title,
            summary,
            it.platform,
            it.fetched_at.format("%H:%M")
        ));
    }

    let mut prompt = format!(
        r#"判断以下新闻条目是否为同一事件的不同报道（半日内采集）：

{}

要求输出 JSON 格式：
{{
  "is_same_event": true/false,
  "confidence": 0.0-1.0,
  "reason": "判断理由"
}}
"#,
        lines.join("\n")
    );

    let prompt_tokens = accountant.count(&prompt);
    if prompt_tokens > settings.period.max_prompt_tokens {
        warn!(prompt_tokens, "same-event prompt over budget, truncating");
        prompt = accountant.truncate(&prompt, settings.period.max_prompt_tokens, true);
    }

    let messages = [
        ChatMessage::system("你是专业的新闻事件分析助手，擅长判断不同新闻是否报道同一事件。"),
        ChatMessage::user(&prompt),
    ];
    let options = ChatOptions::json(settings.period.max_completion_tokens);

    let request = json!({
        "items": group.iter().map(|&idx| json!({"id": items[idx].id, "title": items[idx].title})).collect::<Vec<_>>(),
    });

    match services.chat.chat(&messages, &options).await {
        Ok(response) => {
            let parsed = parse_llm_json(&response.content);
            let (is_same, confidence) = match &parsed {
                Some(value) => (
                    value
                        .get("is_same_event")
                        .and_then(|v| v.as_bool())
                        .unwrap_or(false),
                    confidence_from(value, 0.0),
                ),
                None => (false, 0.0),
            };

            let record = judgement::insert(
                &services.store.conn(),
                &NewJudgement::success(
                    JudgementKind::PeriodMerge,
                    request,
                    parsed.unwrap_or_else(|| json!({"raw": response.content})),
                    services.chat.provider_name(),
                    services.chat.model(),
                )
                .with_usage(
                    response.usage.prompt_tokens as i64,
                    response.usage.completion_tokens as i64,
                ),
            );
            if let Err(err) = record {
                warn!(error = %err, "judgement log write failed");
            }

            Some(is_same && confidence >= settings.period.confirm_confidence)
        }
        Err(err) => {
            warn!(error = %err, "same-event confirmation failed, splitting cluster");
            let record = judgement::insert(
                &services.store.conn(),
                &NewJudgement::failure(
                    JudgementKind::PeriodMerge,
                    request,
                    &err.to_string(),
                    services.chat.provider_name(),
                    services.chat.model(),
                ),
            );
            if let Err(err) = record {
                warn!(error = %err, "judgement log write failed");
            }
            None
        }
    }
}

fn new_cluster_id() -> String {
    let hex = Uuid::new_v4().simple().to_string();
    format!("clu_{}", &hex[..8])
}

fn random_unit_vector(dim: usize) -> Vec<f32> {
    let mut rng = rand::thread_rng();
    let mut vector: Vec<f32> = (0..dim).map(|_| rng.r#gen::<f32>() - 0.5).collect();
    let norm = vector.iter().map(|v| v * v).sum::<f32>().sqrt();
    if norm > 0.0 {
        for v in &mut vector {
            *v /= norm;
        }
    }
    vector
}
