use std::collections::BTreeMap;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use chrono::Utc;
use futures::future::join_all;
use serde_json::json;
use tracing::{info, warn};

use trendpulse_llm::{ChatMessage, ChatOptions, TokenAccountant};
use trendpulse_store::queries::judgement::{self, NewJudgement};
use trendpulse_store::queries::{heat, item, node, run, topic};
use trendpulse_types::{
    JudgementKind, MergeStatus, ObjectType, PipelineRun, RunStatus, SourceItem, Stage, Topic,
    Window, vector_key,
};
use trendpulse_vector::Metadata;

use crate::classify;
use crate::parse::{confidence_from, parse_llm_json};
use crate::services::Services;
use crate::settings::EngineSettings;
use crate::summarize;

#[derive(Debug, Clone)]
pub struct GlobalMergeReport {
    pub run_id: String,
    pub status: RunStatus,
    pub input_clusters: usize,
    pub processed_clusters: usize,
    pub merge_count: usize,
    pub new_count: usize,
    pub skipped_clusters: usize,
}

struct Cluster {
    cluster_id: String,
    items: Vec<SourceItem>,
}

impl Cluster {
    /// Deterministic representative: the lowest item id.
    fn representative(&self) -> &SourceItem {
        &self.items[0]
    }

    fn mean_heat(&self) -> f64 {
        if self.items.is_empty() {
            return 0.0;
        }
        self.items
            .iter()
            .map(|it| it.normalized_heat.unwrap_or(0.0))
            .sum::<f64>()
            / self.items.len() as f64
    }
}

struct CandidateTopic {
    topic: Topic,
    similarity: Option<f64>,
}

enum Applied {
    Merged(i64),
    Created(i64),
    Skipped(String),
}

/// Stage 2: attach each surviving cluster to an existing topic or seed a new
/// one.
///
/// Clusters are processed sequentially (concurrent writes to one topic are
/// not worth the locks), each one's apply step inside its own transaction.
/// Full summaries for freshly created topics are batched at the end with
/// bounded concurrency.
pub async fn run_global_merge(
    services: &Services,
    settings: &EngineSettings,
    accountant: &TokenAccountant,
    window: &Window,
) -> Result<GlobalMergeReport> {
    let mut run = PipelineRun::start(Stage::GlobalMerge);
    run::upsert_pipeline_run(&services.store.conn(), &run)
        .context("recording global merge start")?;

    match execute(services, settings, accountant, window, &mut run).await {
        Ok(report) => Ok(report),
        Err(err) => {
            run.error_summary = Some(err.to_string());
            run.finish(RunStatus::Failed);
            if let Err(persist_err) = run::upsert_pipeline_run(&services.store.conn(), &run) {
                warn!(error = %persist_err, "failed to finalize failed global merge run");
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
) -> Result<GlobalMergeReport> {
    let started = Instant::now();
    let clusters = load_clusters(services, window)?;

    if clusters.is_empty() {
        run.results = Some(json!({"status": "no_data", "window": window.to_string(), "input_clusters": 0}));
        run.finish(RunStatus::Success);
        run::upsert_pipeline_run(&services.store.conn(), run)?;
        info!(window = %window, "global merge: nothing pending");
        return Ok(GlobalMergeReport {
            run_id: run.run_id.clone(),
            status: RunStatus::Success,
            input_clusters: 0,
            processed_clusters: 0,
            merge_count: 0,
            new_count: 0,
            skipped_clusters: 0,
        });
    }

    let input_clusters = clusters.len();
    let batch: Vec<Cluster> = if clusters.len() > settings.global.batch_max {
        warn!(
            clusters = clusters.len(),
            batch_max = settings.global.batch_max,
            "cluster backlog over batch cap, deferring the rest to the next run"
        );
        clusters
            .into_iter()
            .take(settings.global.batch_max)
            .collect()
    } else {
        clusters
    };

    info!(window = %window, clusters = batch.len(), "global merge started");

    let deadline = Duration::from_secs(settings.global.soft_deadline_secs);
    let mut merge_count = 0usize;
    let mut new_count = 0usize;
    let mut processed = 0usize;
    let mut skipped: Vec<String> = Vec::new();
    let mut new_topics: Vec<i64> = Vec::new();
    let mut partial = false;

    for cluster in &batch {
        if started.elapsed() >= deadline {
            warn!(
                processed,
                remaining = batch.len() - processed,
                "soft deadline reached, stopping early"
            );
            partial = true;
            break;
        }

        processed += 1;
        match process_cluster(services, settings, accountant, window, cluster).await? {
            Applied::Merged(topic_id) => {
                merge_count += 1;
                info!(cluster_id = %cluster.cluster_id, topic_id, "cluster merged into topic");
            }
            Applied::Created(topic_id) => {
                new_count += 1;
                new_topics.push(topic_id);
                info!(cluster_id = %cluster.cluster_id, topic_id, "cluster seeded new topic");
            }
            Applied::Skipped(reason) => {
                warn!(cluster_id = %cluster.cluster_id, %reason, "cluster skipped");
                skipped.push(format!("{}: {}", cluster.cluster_id, reason));
            }
        }
    }

    if !new_topics.is_empty() {
        info!(topics = new_topics.len(), "generating full summaries for new topics");
        batch_generate_summaries(services, settings, accountant, &new_topics).await;
    }

    let duration_seconds = started.elapsed().as_secs_f64();
    run.input_count = input_clusters as i64;
    run.output_count = (merge_count + new_count) as i64;
    run.success_count = (merge_count + new_count) as i64;
    run.failed_count = skipped.len() as i64;
    run.results = Some(json!({
        "status": "success",
        "window": window.to_string(),
        "input_clusters": input_clusters,
        "processed_clusters": processed,
        "merge_count": merge_count,
        "new_count": new_count,
        "merge_rate": if processed > 0 { merge_count as f64 / processed as f64 } else { 0.0 },
        "duration_seconds": duration_seconds,
        "partial": partial,
        "skipped_clusters": skipped,
    }));
    run.finish(RunStatus::Success);
    run::upsert_pipeline_run(&services.store.conn(), run)?;

    info!(
        window = %window,
        merge_count,
        new_count,
        skipped = skipped.len(),
        duration_seconds,
        "global merge finished"
    );

    Ok(GlobalMergeReport {
        run_id: run.run_id.clone(),
        status: RunStatus::Success,
        input_clusters,
        processed_clusters: processed,
        merge_count,
        new_count,
        skipped_clusters: skipped.len(),
    })
}

/// Pending clusters of a window, keyed by cluster id, items ordered by id so
/// the representative is deterministic.
fn load_clusters(services: &Services, window: &Window) -> Result<Vec<Cluster>> {
    let items = item::list_by_window_status(&services.store.conn(), window, MergeStatus::PendingGlobal)
        .context("loading pending clusters")?;

    let mut groups: BTreeMap<String, Vec<SourceItem>> = BTreeMap::new();
    for it in items {
        let key = it
            .cluster_id
            .clone()
            .unwrap_or_else(|| format!("orphan_{}", it.id));
        groups.entry(key).or_default().push(it);
    }

    let mut clusters: Vec<Cluster> = groups
        .into_iter()
        .map(|(cluster_id, mut items)| {
            items.sort_by_key(|it| it.id);
            Cluster { cluster_id, items }
        })
        .collect();
    clusters.sort_by_key(|c| c.representative().id);
    Ok(clusters)
}

async fn process_cluster(
    services: &Services,
    settings: &EngineSettings,
    accountant: &TokenAccountant,
    window: &Window,
    cluster: &Cluster,
) -> Result<Applied> {
    let candidates = retrieve_candidates(services, settings, cluster.representative()).await?;

    let target = if candidates.is_empty() {
        None
    } else {
        judge_relation(services, settings, accountant, window, cluster, &candidates).await
    };

    match target {
        Some(topic_id) => {
            merge_into_topic(services, settings, accountant, window, cluster, topic_id).await
        }
        None => create_topic(services, settings, accountant, window, cluster).await,
    }
}

/// Candidate topics for a cluster: nearest topic-summary vectors, threshold-
/// filtered, deduplicated by topic, checked live against the relational
/// store. A dead index (error or zero hits) falls back to the most recently
/// active topics; hits that merely fail the similarity bar do not.
async fn retrieve_candidates(
    services: &Services,
    settings: &EngineSettings,
    representative: &SourceItem,
) -> Result<Vec<CandidateTopic>> {
    let top_k = settings.global.top_k.min(3);
    let active_since = Utc::now() - chrono::Duration::days(settings.global.active_window_days);

    let query = match lookup_item_vector(services, representative)? {
        Some(vector) => vector,
        None => {
            warn!(item_id = representative.id, "representative has no vector, seeding new topic");
            return Ok(Vec::new());
        }
    };

    let mut filter = Metadata::new();
    filter.insert("object_type".into(), json!("topic_summary"));

    let hits = match services.vector.search(&query, top_k * 2, Some(&filter)) {
        Ok(hits) => hits,
        Err(err) => {
            warn!(error = %err, "vector search failed, falling back to recent topics");
            return recent_topic_fallback(services, active_since, top_k);
        }
    };
    if hits.is_empty() {
        return recent_topic_fallback(services, active_since, top_k);
    }

    let mut candidates = Vec::new();
    let mut seen = std::collections::HashSet::new();
    for hit in hits {
        let similarity = 1.0 - hit.distance as f64;
        if similarity < settings.global.similarity_threshold {
            continue;
        }
        let topic_id = match hit.metadata.get("topic_id").and_then(|v| v.as_i64()) {
            Some(id) => id,
            None => continue,
        };
        if !seen.insert(topic_id) {
            continue;
        }
        if let Some(topic) =
            topic::get_active_candidate(&services.store.conn(), topic_id, active_since)?
        {
            candidates.push(CandidateTopic {
                topic,
                similarity: Some(similarity),
            });
            if candidates.len() >= top_k {
                break;
            }
        }
    }
    Ok(candidates)
}

fn lookup_item_vector(services: &Services, it: &SourceItem) -> Result<Option<Vec<f32>>> {
    match services.vector.get(&vector_key(ObjectType::SourceItem, it.id)) {
        Ok(Some(vector)) => return Ok(Some(vector)),
        Ok(None) => {}
        Err(err) => {
            warn!(error = %err, item_id = it.id, "vector index lookup failed, trying embeddings table");
        }
    }
    // The embeddings table is authoritative; the index is only a copy.
    Ok(
        trendpulse_store::queries::embedding::latest_for_object(
            &services.store.conn(),
            ObjectType::SourceItem,
            it.id,
        )?
        .map(|record| record.vector),
    )
}

fn recent_topic_fallback(
    services: &Services,
    active_since: chrono::DateTime<Utc>,
    top_k: usize,
) -> Result<Vec<CandidateTopic>> {
    let topics = topic::list_recent_active(&services.store.conn(), active_since, top_k)?;
    Ok(topics
        .into_iter()
        .map(|topic| CandidateTopic {
            topic,
            similarity: None,
        })
        .collect())
}

/// Ask the model whether the cluster extends one of the candidates. Returns
/// the accepted target topic id, or `None` for "start a new topic" --
/// including every failure mode, which is the conservative answer.
async fn judge_relation(
    services: &Services,
    settings: &EngineSettings,
    accountant: &TokenAccountant,
    window: &Window,
    cluster: &Cluster,
    candidates: &[CandidateTopic],
) -> Option<i64> {
    let representative = cluster.representative();

    let title = accountant.truncate(&representative.title, 80, true);
    let summary = match &representative.summary {
        Some(s) if !s.is_empty() => accountant.truncate(s, 150, true),
        _ => "无".to_string(),
    };
    let event_desc = format!(
        "标题: {}\n摘要: {}\n平台: {}\n日期: {} {}",
        title,
        summary,
        representative.platform,
        window.date.format("%Y-%m-%d"),
        window.slot
    );

    let mut candidate_blocks = Vec::new();
    for (i, candidate) in candidates.iter().enumerate() {
        let cand_title = accountant.truncate(
            &candidate.topic.title_key,
            settings.global.max_candidate_tokens,
            true,
        );
        candidate_blocks.push(format!(
            "【候选主题 {}】\n主题ID: {}\n标题: {}\n最后活跃: {}\n持续时长: {:.1} 小时",
            i + 1,
            candidate.topic.id,
            cand_title,
            candidate.topic.last_active.format("%Y-%m-%d %H:%M"),
            candidate.topic.duration_hours()
        ));
    }

    let mut prompt = format!(
        r#"判断新事件是否为已有主题的新进展：

【新事件】
{}

{}

要求输出 JSON 格式：
{{
  "decision": "merge" 或 "new",
  "target_topic_id": 上述候选主题的真实主题ID（数字）,
  "confidence": 0.0-1.0,
  "reason": "判断理由"
}}

判断标准：
1. 如果新事件是某个候选主题的后续进展、新报道，则选择 "merge"
2. 如果新事件与所有候选主题都无关，则选择 "new"
3. 主题一致性强
"#,
        event_desc,
        candidate_blocks.join("\n")
    );

    let prompt_tokens = accountant.count(&prompt);
    if prompt_tokens > settings.global.max_prompt_tokens {
        warn!(prompt_tokens, "relation prompt over budget, truncating");
        prompt = accountant.truncate(&prompt, settings.global.max_prompt_tokens, true);
    }

    let messages = [
        ChatMessage::system("你是专业的新闻事件分析助手，擅长判断事件之间的关联性。"),
        ChatMessage::user(&prompt),
    ];
    let options = ChatOptions::json(settings.global.max_completion_tokens);

    let candidate_ids: Vec<i64> = candidates.iter().map(|c| c.topic.id).collect();
    let request = json!({
        "item_id": representative.id,
        "cluster_id": cluster.cluster_id,
        "candidates": candidate_ids,
    });

    match services.chat.chat(&messages, &options).await {
        Ok(response) => {
            let parsed = parse_llm_json(&response.content);
            let (decision, resolved, confidence) = match &parsed {
                Some(value) => (
                    value
                        .get("decision")
                        .and_then(|v| v.as_str())
                        .unwrap_or("new")
                        .to_string(),
                    resolve_target_topic_id(value.get("target_topic_id"), &candidate_ids),
                    confidence_from(value, 0.0),
                ),
                None => ("new".to_string(), None, 0.0),
            };

            let record = judgement::insert(
                &services.store.conn(),
                &NewJudgement::success(
                    JudgementKind::Relation,
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

            if decision == "merge" && confidence >= settings.global.confidence_threshold {
                resolved
            } else {
                None
            }
        }
        Err(err) => {
            warn!(error = %err, "relation judgement failed, seeding new topic");
            let record = judgement::insert(
                &services.store.conn(),
                &NewJudgement::failure(
                    JudgementKind::Relation,
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

/// Map whatever the model put in `target_topic_id` onto a real candidate:
/// the raw id, a 1-based index into the candidate list, or the first number
/// inside a string.
fn resolve_target_topic_id(
    raw: Option<&serde_json::Value>,
    candidate_ids: &[i64],
) -> Option<i64> {
    let raw = raw?;

    let numeric: Option<i64> = if let Some(n) = raw.as_i64() {
        Some(n)
    } else if let Some(f) = raw.as_f64() {
        Some(f as i64)
    } else if let Some(s) = raw.as_str() {
        let digits: String = {
            let start = s.find(|c: char| c.is_ascii_digit())?;
            s[start..]
                .chars()
                .take_while(|c| c.is_ascii_digit())
                .collect()
        };
        digits.parse().ok()
    } else {
        None
    };

    let value = numeric?;
    if candidate_ids.contains(&value) {
        return Some(value);
    }
    if value >= 1 && (value as usize) <= candidate_ids.len() {
        return Some(candidate_ids[value as usize - 1]);
    }
    None
}

async fn merge_into_topic(
    services: &Services,
    settings: &EngineSettings,
    accountant: &TokenAccountant,
    window: &Window,
    cluster: &Cluster,
    topic_id: i64,
) -> Result<Applied> {
    let existing = topic::get(&services.store.conn(), topic_id)?;
    let Some(_) = existing else {
        warn!(topic_id, "accepted merge target no longer exists, seeding new topic");
        return create_topic_without_llm(services, window, cluster).await;
    };

    let last_active = cluster
        .items
        .iter()
        .map(|it| it.fetched_at)
        .max()
        .unwrap_or_else(Utc::now);
    let mean_heat = cluster.mean_heat();
    let appended_at = Utc::now();

    let applied = services.store.with_tx(|conn| {
        for it in &cluster.items {
            item::advance_status(conn, it.id, MergeStatus::Merged)?;
            node::insert(conn, topic_id, it.id, appended_at)?;
        }
        topic::record_attachment(conn, topic_id, last_active, cluster.items.len() as i64, mean_heat)?;
        heat::upsert(
            conn,
            topic_id,
            window.date,
            window.slot,
            mean_heat,
            cluster.items.len() as i64,
        )?;
        Ok(())
    });

    if let Err(err) = applied {
        return Ok(Applied::Skipped(err.to_string()));
    }

    let topic = topic::get(&services.store.conn(), topic_id)?
        .context("merged topic disappeared mid-run")?;

    // Repair a missing summary vector before anything else queries it.
    let representative_text = cluster.representative().summary.clone();
    if let Err(err) =
        summarize::ensure_summary_vector(services, &topic, representative_text.as_deref()).await
    {
        warn!(topic_id, error = %err, "summary vector repair failed");
    }

    // Incremental summary runs inline; its failure never unwinds the merge.
    let new_nodes = node::list_with_items(
        &services.store.conn(),
        topic_id,
        true,
        Some(cluster.items.len()),
    )?;
    if let Err(err) = summarize::generate_or_update(
        services,
        &settings.summary,
        accountant,
        &topic,
        &new_nodes,
    )
    .await
    {
        warn!(topic_id, error = %err, "incremental summary failed");
    }

    Ok(Applied::Merged(topic_id))
}

async fn create_topic(
    services: &Services,
    settings: &EngineSettings,
    accountant: &TokenAccountant,
    window: &Window,
    cluster: &Cluster,
) -> Result<Applied> {
    let applied = create_topic_without_llm(services, window, cluster).await?;

    if let Applied::Created(topic_id) = &applied {
        let topic_id = *topic_id;
        let fetched = topic::get(&services.store.conn(), topic_id)?;
        if let Some(topic) = fetched {
            // Classification failure must not unwind topic creation.
            if let Err(err) =
                classify::classify_topic(services, &settings.classify, accountant, &topic).await
            {
                warn!(topic_id, error = %err, "classification failed");
            }
        }
    }
    Ok(applied)
}

async fn create_topic_without_llm(
    services: &Services,
    window: &Window,
    cluster: &Cluster,
) -> Result<Applied> {
    let representative = cluster.representative();
    let first_seen = cluster
        .items
        .iter()
        .map(|it| it.fetched_at)
        .min()
        .unwrap_or_else(Utc::now);
    let last_active = cluster
        .items
        .iter()
        .map(|it| it.fetched_at)
        .max()
        .unwrap_or_else(Utc::now);
    let mean_heat = cluster.mean_heat();
    let title_key = representative.title.clone();
    let appended_at = Utc::now();

    let created = services.store.with_tx(|conn| {
        let topic_id = topic::insert(
            conn,
            &topic::NewTopic {
                title_key: title_key.clone(),
                first_seen,
                last_active,
                intensity_total: cluster.items.len() as i64,
                current_heat_normalized: Some(mean_heat),
            },
        )?;
        for it in &cluster.items {
            item::advance_status(conn, it.id, MergeStatus::Merged)?;
            node::insert(conn, topic_id, it.id, appended_at)?;
        }
        heat::upsert(
            conn,
            topic_id,
            window.date,
            window.slot,
            mean_heat,
            cluster.items.len() as i64,
        )?;
        Ok(topic_id)
    });

    let topic_id = match created {
        Ok(id) => id,
        Err(err) => return Ok(Applied::Skipped(err.to_string())),
    };

    // Placeholder summary + embedding immediately, so a cluster later in
    // this same run can already retrieve the topic.
    let fetched = topic::get(&services.store.conn(), topic_id)?;
    if let Some(topic) = fetched {
        let representative_text = representative.summary.clone();
        if let Err(err) =
            summarize::ensure_summary_vector(services, &topic, representative_text.as_deref()).await
        {
            warn!(topic_id, error = %err, "placeholder summary vector failed");
        }
    }

    Ok(Applied::Created(topic_id))
}

/// Full summaries for the run's new topics, fanned out at bounded
/// concurrency. Each task opens its own store and index connections so one
/// task's failure or lock never poisons a peer; an unreopenable (in-memory)
/// store degrades to sequential generation.
async fn batch_generate_summaries(
    services: &Services,
    settings: &EngineSettings,
    accountant: &TokenAccountant,
    topic_ids: &[i64],
) {
    let width = settings.global.summary_concurrency.max(1);

    let reopenable = services.store.path().is_some();
    if !reopenable {
        for &topic_id in topic_ids {
            if let Err(err) =
                summarize::generate_full_summary(services, &settings.summary, accountant, topic_id)
                    .await
            {
                warn!(topic_id, error = %err, "full summary failed");
            }
        }
        return;
    }

    for chunk in topic_ids.chunks(width) {
        let mut tasks = Vec::with_capacity(chunk.len());
        for &topic_id in chunk {
            let store = match services.store.reopen() {
                Ok(store) => store,
                Err(err) => {
                    warn!(topic_id, error = %err, "could not open summary store connection");
                    continue;
                }
            };
            let vector = match services.vector.reopen() {
                Ok(vector) => vector,
                Err(err) => {
                    warn!(topic_id, error = %err, "could not open summary index connection");
                    continue;
                }
            };
            let chat = services.chat.clone();
            let embedder = services.embedder.clone();
            let summary_settings = settings.summary.clone();
            let accountant = accountant.clone();

            tasks.push(tokio::spawn(async move {
                let services = Services::new(store, vector, chat, embedder);
                let result = summarize::generate_full_summary(
                    &services,
                    &summary_settings,
                    &accountant,
                    topic_id,
                )
                .await;
                (topic_id, result)
            }));
        }

        for joined in join_all(tasks).await {
            match joined {
                Ok((topic_id, Ok(summary))) => {
                    info!(topic_id, method = %summary.method, "summary generated");
                }
                Ok((topic_id, Err(err))) => {
                    warn!(topic_id, error = %err, "full summary failed");
                }
                Err(err) => {
                    warn!(error = %err, "summary task panicked");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolver_accepts_raw_id() {
        let ids = vec![101, 205, 309];
        let raw = json!(205);
        assert_eq!(resolve_target_topic_id(Some(&raw), &ids), Some(205));
    }

    #[test]
    fn test_resolver_accepts_one_based_index() {
        let ids = vec![101, 205, 309];
        assert_eq!(resolve_target_topic_id(Some(&json!(2)), &ids), Some(205));
        assert_eq!(resolve_target_topic_id(Some(&json!(3)), &ids), Some(309));
    }

    #[test]
    fn test_resolver_accepts_float_and_string() {
        let ids = vec![101, 205, 309];
        assert_eq!(resolve_target_topic_id(Some(&json!(1.0)), &ids), Some(101));
        assert_eq!(
            resolve_target_topic_id(Some(&json!("候选主题 2")), &ids),
            Some(205)
        );
        assert_eq!(
            resolve_target_topic_id(Some(&json!("205")), &ids),
            Some(205)
        );
    }

    #[test]
    fn test_resolver_rejects_unknown() {
        let ids = vec![101, 205, 309];
        assert_eq!(resolve_target_topic_id(Some(&json!(999)), &ids), None);
        assert_eq!(resolve_target_topic_id(Some(&json!("no digits")), &ids), None);
        assert_eq!(resolve_target_topic_id(Some(&json!(null)), &ids), None);
        assert_eq!(resolve_target_topic_id(None, &ids), None);
        assert_eq!(resolve_target_topic_id(Some(&json!(0)), &ids), None);
    }
}
