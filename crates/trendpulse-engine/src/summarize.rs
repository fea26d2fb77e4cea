use anyhow::{Context, Result};
use chrono::{Duration, Utc};
use serde_json::json;
use tracing::{info, warn};

use trendpulse_llm::{ChatMessage, ChatOptions, TokenAccountant};
use trendpulse_store::queries::judgement::{self, NewJudgement};
use trendpulse_store::queries::node::{self, NodeWithItem};
use trendpulse_store::queries::{embedding, summary, topic};
use trendpulse_types::{
    Interactions, JudgementKind, ObjectType, Summary, SummaryMethod, Topic, total_interactions,
    vector_key,
};
use trendpulse_vector::Metadata;

use crate::services::Services;
use crate::settings::SummarySettings;
use crate::parse::parse_llm_json;

// The latest summary is a topic's retrieval surrogate: Stage 2 searches
// topic-summary vectors, never raw node vectors. Everything here therefore
// ends by re-embedding, and topics must never sit without a summary vector
// for long -- that is what the placeholder path is for.

/// Make sure the topic is retrievable: its latest summary must have an
/// embedding row and an index entry. Creates a placeholder summary (title
/// plus the representative item's text) when the topic has none at all.
pub async fn ensure_summary_vector(
    services: &Services,
    topic: &Topic,
    representative_text: Option<&str>,
) -> Result<()> {
    let latest = summary::latest_for_topic(&services.store.conn(), topic.id)?;

    match latest {
        Some(existing) => {
            if embedding::exists_for_object(
                &services.store.conn(),
                ObjectType::TopicSummary,
                existing.id,
            )? {
                return Ok(());
            }
            embed_summary(services, &existing).await
        }
        None => {
            create_placeholder(services, topic, representative_text)
                .await
                .map(|_| ())
        }
    }
}

/// Write a placeholder row so the topic is retrievable before its real
/// summary lands, and point the topic at it.
pub async fn create_placeholder(
    services: &Services,
    topic: &Topic,
    representative_text: Option<&str>,
) -> Result<Summary> {
    let content = match representative_text {
        Some(text) if !text.is_empty() => format!("{}：{}", topic.title_key, text),
        _ => format!("事件「{}」的摘要正在生成中", topic.title_key),
    };

    let id = summary::insert(
        &services.store.conn(),
        topic.id,
        &content,
        SummaryMethod::Placeholder,
        Utc::now(),
        "system",
        "",
    )?;
    topic::set_summary_id(&services.store.conn(), topic.id, id)?;

    let placeholder = summary::get(&services.store.conn(), id)?
        .context("placeholder summary disappeared after insert")?;
    if let Err(err) = embed_summary(services, &placeholder).await {
        warn!(topic_id = topic.id, error = %err, "placeholder embedding failed");
    }
    Ok(placeholder)
}

/// Full summary from scratch: key-node selection, one LLM call, robust
/// parsing, persistence, re-embedding.
pub async fn generate_full_summary(
    services: &Services,
    settings: &SummarySettings,
    accountant: &TokenAccountant,
    topic_id: i64,
) -> Result<Summary> {
    let topic = topic::get(&services.store.conn(), topic_id)?
        .with_context(|| format!("topic {} not found", topic_id))?;

    let all_nodes = node::list_with_items(&services.store.conn(), topic.id, false, None)?;
    if all_nodes.is_empty() {
        warn!(topic_id, "no nodes attached, writing placeholder summary");
        return create_placeholder(services, &topic, None).await;
    }

    let key_nodes = select_key_nodes(&all_nodes, settings.max_context_nodes);
    let platforms = node::distinct_platforms(&services.store.conn(), topic.id)?;

    let mut prompt = build_full_prompt(&topic, &key_nodes, &platforms, all_nodes.len());
    let prompt_tokens = accountant.count(&prompt);
    if prompt_tokens > settings.max_prompt_tokens {
        warn!(
            topic_id,
            prompt_tokens, "full summary prompt over budget, truncating"
        );
        prompt = accountant.truncate(&prompt, settings.max_prompt_tokens, true);
    }

    let options = ChatOptions {
        temperature: Some(0.3),
        max_tokens: Some(settings.max_completion_tokens),
        json_response: false,
    };
    let response = match services.chat.chat(&[ChatMessage::user(&prompt)], &options).await {
        Ok(response) => response,
        Err(err) => {
            warn!(topic_id, error = %err, "full summary generation failed");
            judgement::insert(
                &services.store.conn(),
                &NewJudgement::failure(
                    JudgementKind::SummaryFull,
                    json!({"topic_id": topic.id}),
                    &err.to_string(),
                    services.chat.provider_name(),
                    services.chat.model(),
                ),
            )?;
            // Leave an existing summary alone; only a summary-less topic
            // falls back to a placeholder.
            let existing = summary::latest_for_topic(&services.store.conn(), topic.id)?;
            return match existing {
                Some(existing) => Ok(existing),
                None => create_placeholder(services, &topic, None).await,
            };
        }
    };

    let (content, key_points) = parse_summary_response(&response.content);

    let id = summary::insert(
        &services.store.conn(),
        topic.id,
        &content,
        SummaryMethod::Full,
        Utc::now(),
        services.chat.provider_name(),
        services.chat.model(),
    )?;
    topic::set_summary_id(&services.store.conn(), topic.id, id)?;

    judgement::insert(
        &services.store.conn(),
        &NewJudgement::success(
            JudgementKind::SummaryFull,
            json!({"topic_id": topic.id, "key_nodes": key_nodes.len()}),
            json!({"summary_id": id, "key_points": key_points}),
            services.chat.provider_name(),
            services.chat.model(),
        )
        .with_usage(
            response.usage.prompt_tokens as i64,
            response.usage.completion_tokens as i64,
        ),
    )?;

    let saved = summary::get(&services.store.conn(), id)?
        .context("summary disappeared after insert")?;
    if let Err(err) = embed_summary(services, &saved).await {
        warn!(topic_id, error = %err, "summary embedding failed");
    }

    info!(topic_id, summary_id = id, "full summary generated");
    Ok(saved)
}

/// Incremental update: current summary plus the newest attached nodes. `None`
/// when the gate rejects the update or the model says nothing changed.
pub async fn generate_incremental_summary(
    services: &Services,
    settings: &SummarySettings,
    accountant: &TokenAccountant,
    topic: &Topic,
    current: &Summary,
    new_nodes: &[NodeWithItem],
) -> Result<Option<Summary>> {
    if new_nodes.len() < settings.min_nodes_for_update {
        return Ok(None);
    }
    if Utc::now() - current.generated_at < Duration::hours(settings.update_interval_hours) {
        return Ok(None);
    }

    // Only the newest handful of nodes feed the update.
    let mut recent: Vec<&NodeWithItem> = new_nodes.iter().collect();
    recent.sort_by(|a, b| b.node.appended_at.cmp(&a.node.appended_at));
    recent.truncate(5);

    let mut prompt = build_incremental_prompt(&current.content, &recent);
    let prompt_tokens = accountant.count(&prompt);
    if prompt_tokens > settings.max_prompt_tokens {
        warn!(
            topic_id = topic.id,
            prompt_tokens, "incremental summary prompt over budget, truncating"
        );
        prompt = accountant.truncate(&prompt, settings.max_prompt_tokens, true);
    }

    let options = ChatOptions {
        temperature: Some(0.3),
        max_tokens: Some(settings.max_completion_tokens),
        json_response: false,
    };
    let response = match services.chat.chat(&[ChatMessage::user(&prompt)], &options).await {
        Ok(response) => response,
        Err(err) => {
            warn!(topic_id = topic.id, error = %err, "incremental summary failed");
            judgement::insert(
                &services.store.conn(),
                &NewJudgement::failure(
                    JudgementKind::SummaryIncremental,
                    json!({"topic_id": topic.id, "new_nodes": new_nodes.len()}),
                    &err.to_string(),
                    services.chat.provider_name(),
                    services.chat.model(),
                ),
            )?;
            return Ok(None);
        }
    };

    let update = parse_incremental_response(&response.content);
    if !update.needs_update {
        info!(topic_id = topic.id, "model kept the existing summary");
        return Ok(None);
    }

    let id = summary::insert(
        &services.store.conn(),
        topic.id,
        &update.updated_summary,
        SummaryMethod::Incremental,
        Utc::now(),
        services.chat.provider_name(),
        services.chat.model(),
    )?;
    topic::set_summary_id(&services.store.conn(), topic.id, id)?;

    judgement::insert(
        &services.store.conn(),
        &NewJudgement::success(
            JudgementKind::SummaryIncremental,
            json!({"topic_id": topic.id, "new_nodes": new_nodes.len()}),
            json!({
                "summary_id": id,
                "new_key_points": update.new_key_points,
                "change_reason": update.change_reason,
            }),
            services.chat.provider_name(),
            services.chat.model(),
        )
        .with_usage(
            response.usage.prompt_tokens as i64,
            response.usage.completion_tokens as i64,
        ),
    )?;

    let saved = summary::get(&services.store.conn(), id)?
        .context("summary disappeared after insert")?;
    if let Err(err) = embed_summary(services, &saved).await {
        warn!(topic_id = topic.id, error = %err, "summary embedding failed");
    }

    info!(topic_id = topic.id, summary_id = id, "incremental summary written");
    Ok(Some(saved))
}

/// First summary is full, later ones incremental.
pub async fn generate_or_update(
    services: &Services,
    settings: &SummarySettings,
    accountant: &TokenAccountant,
    topic: &Topic,
    new_nodes: &[NodeWithItem],
) -> Result<Option<Summary>> {
    let latest = summary::latest_for_topic(&services.store.conn(), topic.id)?;
    match latest {
        None => generate_full_summary(services, settings, accountant, topic.id)
            .await
            .map(Some),
        Some(current) if current.method == SummaryMethod::Placeholder => {
            generate_full_summary(services, settings, accountant, topic.id)
                .await
                .map(Some)
        }
        Some(current) => {
            generate_incremental_summary(services, settings, accountant, topic, &current, new_nodes)
                .await
        }
    }
}

/// Embed a summary's content and store it in both the authoritative table
/// and the search index.
pub async fn embed_summary(services: &Services, summary: &Summary) -> Result<()> {
    let vectors = services
        .embedder
        .embed(&[summary.content.clone()])
        .await
        .context("embedding summary content")?;
    let vector = vectors
        .into_iter()
        .next()
        .context("embedding endpoint returned no vector")?;

    embedding::insert(
        &services.store.conn(),
        ObjectType::TopicSummary,
        summary.id,
        services.embedder.provider_name(),
        services.embedder.model(),
        &vector,
        Utc::now(),
    )?;

    let mut metadata = Metadata::new();
    metadata.insert("object_type".into(), json!("topic_summary"));
    metadata.insert("object_id".into(), json!(summary.id));
    metadata.insert("topic_id".into(), json!(summary.topic_id));
    metadata.insert("generated_at".into(), json!(summary.generated_at.to_rfc3339()));

    services
        .vector
        .upsert(
            &[vector_key(ObjectType::TopicSummary, summary.id)],
            &[vector],
            &[metadata],
            Some(&[summary.content.chars().take(500).collect::<String>()]),
        )
        .context("indexing summary vector")?;
    Ok(())
}

/// Key-node selection for full summaries: the earliest node, the two with
/// the most interactions, and the five newest, deduplicated, in
/// chronological order, capped.
pub fn select_key_nodes(nodes: &[NodeWithItem], max_nodes: usize) -> Vec<NodeWithItem> {
    if nodes.is_empty() {
        return Vec::new();
    }

    let mut picked: Vec<&NodeWithItem> = Vec::new();
    let mut seen = std::collections::HashSet::new();

    let earliest = nodes
        .iter()
        .min_by_key(|n| (n.node.appended_at, n.node.id))
        .unwrap();
    picked.push(earliest);
    seen.insert(earliest.node.id);

    let mut with_interactions: Vec<&NodeWithItem> = nodes
        .iter()
        .filter(|n| n.item.interactions.is_some())
        .collect();
    with_interactions.sort_by_key(|n| {
        std::cmp::Reverse(
            n.item
                .interactions
                .as_ref()
                .map(total_interactions)
                .unwrap_or(0),
        )
    });
    for n in with_interactions.into_iter().take(2) {
        if seen.insert(n.node.id) {
            picked.push(n);
        }
    }

    let mut newest: Vec<&NodeWithItem> = nodes.iter().collect();
    newest.sort_by(|a, b| b.node.appended_at.cmp(&a.node.appended_at));
    for n in newest.into_iter().take(5) {
        if seen.insert(n.node.id) {
            picked.push(n);
        }
    }

    picked.sort_by_key(|n| (n.node.appended_at, n.node.id));
    picked.truncate(max_nodes);
    picked.into_iter().cloned().collect()
}

fn format_interactions(interactions: &Interactions) -> String {
    let mut parts = Vec::new();
    if let Some(v) = interactions.get("repost") {
        parts.push(format!("转发{}", v));
    }
    if let Some(v) = interactions.get("comment") {
        parts.push(format!("评论{}", v));
    }
    if let Some(v) = interactions.get("like") {
        parts.push(format!("点赞{}", v));
    }
    parts.join(", ")
}

fn node_time(n: &NodeWithItem) -> String {
    n.item
        .published_at
        .unwrap_or(n.item.fetched_at)
        .format("%Y-%m-%d %H:%M")
        .to_string()
}

fn build_full_prompt(
    topic: &Topic,
    key_nodes: &[NodeWithItem],
    platforms: &[String],
    node_count: usize,
) -> String {
    let mut node_lines = Vec::new();
    for (i, n) in key_nodes.iter().enumerate() {
        node_lines.push(format!(
            "{}. [{}] {}\n   标题: {}",
            i + 1,
            n.item.platform,
            node_time(n),
            n.item.title
        ));
        if let Some(summary) = &n.item.summary {
            node_lines.push(format!(
                "   摘要: {}",
                summary.chars().take(150).collect::<String>()
            ));
        }
        if let Some(interactions) = &n.item.interactions {
            let formatted = format_interactions(interactions);
            if !formatted.is_empty() {
                node_lines.push(format!("   互动: {}", formatted));
            }
        }
    }

    format!(
        r#"请为以下热点事件生成结构化摘要。

【事件基本信息】
- 标题: {}
- 首次发现: {}
- 最后活跃: {}
- 涉及平台: {}
- 节点总数: {}

【关键节点】（按时间顺序，已筛选关键信息）
{}

要求：
1. 概述事件的核心内容（150-300字）
2. 提炼3-5个关键要点
3. 如果有重要进展，按时间顺序说明
4. 保持客观中立，不做主观评价

重要：直接返回JSON格式，不要包含任何思维过程或其他文本。
输出格式：
{{
  "summary": "事件概述（150-300字）",
  "key_points": [
    "要点1：事件起因或背景",
    "要点2：主要内容或进展",
    "要点3：当前状态或影响"
  ]
}}
"#,
        topic.title_key,
        topic.first_seen.format("%Y-%m-%d %H:%M"),
        topic.last_active.format("%Y-%m-%d %H:%M"),
        platforms.join(", "),
        node_count,
        node_lines.join("\n")
    )
}

fn build_incremental_prompt(current_summary: &str, new_nodes: &[&NodeWithItem]) -> String {
    let mut node_lines = Vec::new();
    for (i, n) in new_nodes.iter().enumerate() {
        node_lines.push(format!(
            "{}. [{}] {}\n   {}",
            i + 1,
            n.item.platform,
            node_time(n),
            n.item.title
        ));
        if let Some(summary) = &n.item.summary {
            node_lines.push(format!("   {}", summary.chars().take(150).collect::<String>()));
        }
    }

    format!(
        r#"请基于当前摘要和新增进展，更新事件摘要。

【当前摘要】
{}

【新增进展】（{}条新节点）
{}

请分析新增内容，判断是否需要更新摘要。

更新原则：
1. 如果新节点只是重复旧信息，保持原摘要不变
2. 如果有重要新进展或转折，更新摘要并添加新要点
3. 保持摘要简洁（150-300字）
4. 保留历史摘要的连贯性

重要：直接返回JSON格式，不要包含任何思维过程或其他文本。
输出格式：
{{
  "needs_update": true,
  "updated_summary": "更新后的摘要（如果needs_update=true）",
  "new_key_points": ["新增要点1", "新增要点2"],
  "change_reason": "说明为什么需要更新（或为什么不需要）"
}}
"#,
        current_summary,
        new_nodes.len(),
        node_lines.join("\n")
    )
}

/// Full-summary response: JSON with a `summary` field, or the raw text
/// clipped to 500 chars as a last resort.
fn parse_summary_response(content: &str) -> (String, Vec<String>) {
    if let Some(value) = parse_llm_json(content) {
        if let Some(summary) = value.get("summary").and_then(|v| v.as_str()) {
            let key_points = value
                .get("key_points")
                .and_then(|v| v.as_array())
                .map(|arr| {
                    arr.iter()
                        .filter_map(|p| p.as_str().map(str::to_string))
                        .collect()
                })
                .unwrap_or_default();
            return (summary.to_string(), key_points);
        }
    }

    let fallback = crate::parse::strip_think_tags(content);
    (fallback.chars().take(500).collect(), Vec::new())
}

struct IncrementalUpdate {
    needs_update: bool,
    updated_summary: String,
    new_key_points: Vec<String>,
    change_reason: String,
}

fn parse_incremental_response(content: &str) -> IncrementalUpdate {
    if let Some(value) = parse_llm_json(content) {
        let needs_update = value
            .get("needs_update")
            .and_then(|v| v.as_bool())
            .unwrap_or(true);
        let updated_summary = value
            .get("updated_summary")
            .and_then(|v| v.as_str())
            .unwrap_or_default()
            .to_string();
        // A model that claims an update but produced no text did not update.
        let needs_update = needs_update && !updated_summary.is_empty();
        return IncrementalUpdate {
            needs_update,
            updated_summary,
            new_key_points: value
                .get("new_key_points")
                .and_then(|v| v.as_array())
                .map(|arr| {
                    arr.iter()
                        .filter_map(|p| p.as_str().map(str::to_string))
                        .collect()
                })
                .unwrap_or_default(),
            change_reason: value
                .get("change_reason")
                .and_then(|v| v.as_str())
                .unwrap_or_default()
                .to_string(),
        };
    }

    let fallback = crate::parse::strip_think_tags(content);
    IncrementalUpdate {
        needs_update: !fallback.is_empty(),
        updated_summary: fallback.chars().take(500).collect(),
        new_key_points: Vec::new(),
        change_reason: "parsed from raw text".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use trendpulse_types::{MergeStatus, SourceItem, TopicNode};

    fn node(id: i64, appended_min: u32, interactions: Option<&[(&str, i64)]>) -> NodeWithItem {
        let appended = Utc
            .with_ymd_and_hms(2025, 11, 7, 8, appended_min, 0)
            .unwrap();
        NodeWithItem {
            node: TopicNode {
                id,
                topic_id: 1,
                source_item_id: id,
                appended_at: appended,
            },
            item: SourceItem {
                id,
                platform: "weibo".into(),
                title: format!("title {}", id),
                summary: Some("摘要".into()),
                url: String::new(),
                url_hash: String::new(),
                dedup_key: String::new(),
                published_at: None,
                fetched_at: appended,
                interactions: interactions.map(|pairs| {
                    pairs
                        .iter()
                        .map(|(k, v)| (k.to_string(), *v))
                        .collect::<Interactions>()
                }),
                raw_heat: None,
                normalized_heat: None,
                window: "2025-11-07_AM".into(),
                cluster_id: None,
                occurrence_count: 1,
                status: MergeStatus::Merged,
                embedding_id: None,
                run_id: None,
            },
        }
    }

    #[test]
    fn test_select_key_nodes_combines_earliest_peak_newest() {
        let nodes: Vec<NodeWithItem> = vec![
            node(1, 0, None),                         // earliest
            node(2, 5, Some(&[("like", 10)])),
            node(3, 10, Some(&[("like", 9000)])),     // peak
            node(4, 15, None),
            node(5, 20, None),
            node(6, 25, None),
            node(7, 30, None),
            node(8, 35, None),
            node(9, 40, None),                        // newest run: 5..9
        ];

        let picked = select_key_nodes(&nodes, 15);
        let ids: Vec<i64> = picked.iter().map(|n| n.node.id).collect();
        // earliest (1), peaks (3 then 2), newest five (5..9), chronological.
        assert_eq!(ids, vec![1, 2, 3, 5, 6, 7, 8, 9]);
    }

    #[test]
    fn test_select_key_nodes_caps_total() {
        let nodes: Vec<NodeWithItem> = (0..30).map(|i| node(i, i as u32, None)).collect();
        let picked = select_key_nodes(&nodes, 4);
        assert_eq!(picked.len(), 4);
    }

    #[test]
    fn test_parse_summary_response_json() {
        let (summary, points) = parse_summary_response(
            r#"{"summary": "事件概述。", "key_points": ["一", "二"]}"#,
        );
        assert_eq!(summary, "事件概述。");
        assert_eq!(points, vec!["一", "二"]);
    }

    #[test]
    fn test_parse_summary_response_raw_fallback() {
        let long = "纯文本回复。".repeat(200);
        let (summary, points) = parse_summary_response(&long);
        assert_eq!(summary.chars().count(), 500);
        assert!(points.is_empty());
    }

    #[test]
    fn test_parse_incremental_no_update() {
        let update = parse_incremental_response(
            r#"{"needs_update": false, "updated_summary": "", "change_reason": "重复信息"}"#,
        );
        assert!(!update.needs_update);
    }

    #[test]
    fn test_parse_incremental_update_without_text_is_no_update() {
        let update =
            parse_incremental_response(r#"{"needs_update": true, "updated_summary": ""}"#);
        assert!(!update.needs_update);
    }

    #[test]
    fn test_parse_incremental_with_think_block() {
        let content = "<think>新增内容有实质进展</think>{\"needs_update\": true, \"updated_summary\": \"更新后的摘要\", \"change_reason\": \"新进展\"}";
        let update = parse_incremental_response(content);
        assert!(update.needs_update);
        assert_eq!(update.updated_summary, "更新后的摘要");
    }
}
