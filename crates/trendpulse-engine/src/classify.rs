use anyhow::Result;
use chrono::Utc;
use serde_json::json;
use tracing::{info, warn};

use trendpulse_llm::{ChatMessage, ChatOptions, TokenAccountant};
use trendpulse_store::queries::judgement::{self, NewJudgement};
use trendpulse_store::queries::node::{self, NodeWithItem};
use trendpulse_store::queries::topic;
use trendpulse_types::{Category, CategoryMethod, JudgementKind, Topic};

use crate::parse::{confidence_from, parse_llm_json};
use crate::services::Services;
use crate::settings::ClassifySettings;

const STRONG_WEIGHT: f64 = 0.15;
const MEDIUM_WEIGHT: f64 = 0.05;
/// Best rule score below this means the rules saw nothing; default label.
const RULE_FLOOR: f64 = 0.2;

const ENTERTAINMENT_STRONG: &[&str] = &[
    "明星", "娱乐", "八卦", "绯闻", "爆料", "综艺", "电影", "电视剧", "演员", "歌手", "偶像",
    "爱豆", "粉丝", "娱乐圈", "影视", "节目", "出轨", "离婚", "恋情", "结婚", "生子", "颁奖",
    "首映", "热播",
];
const ENTERTAINMENT_MEDIUM: &[&str] = &[
    "导演", "编剧", "制作人", "经纪人", "造型师", "剧组", "片场", "首播", "上映", "票房",
    "收视率", "口碑", "评分", "豆瓣",
];
const CURRENT_AFFAIRS_STRONG: &[&str] = &[
    "政策", "法规", "政府", "国务院", "发改委", "司法", "法院", "检察", "公安", "警方", "事故",
    "案件", "民生", "舆情", "公共", "社会", "财经", "经济", "股市", "央行", "监管", "治理",
    "改革", "疫情",
];
const CURRENT_AFFAIRS_MEDIUM: &[&str] = &[
    "会议", "通知", "公告", "声明", "调查", "处理", "整治", "专项", "民众", "市民", "居民",
    "群众", "网友", "热议", "关注", "讨论",
];
const SPORTS_ESPORTS_STRONG: &[&str] = &[
    "比赛", "联赛", "世界杯", "总决赛", "季后赛", "决赛", "半决赛", "球队", "球员", "教练",
    "俱乐部", "战队", "电竞", "赛事", "夺冠", "冠军", "亚军", "金牌", "银牌", "铜牌",
    "破纪录", "MVP",
];
const SPORTS_ESPORTS_MEDIUM: &[&str] = &[
    "足球", "篮球", "网球", "羽毛球", "乒乓球", "游泳", "田径", "体操", "LOL", "DOTA",
    "王者荣耀", "吃鸡", "CS", "转会", "签约", "续约",
];

fn keyword_tables(category: Category) -> (&'static [&'static str], &'static [&'static str]) {
    match category {
        Category::Entertainment => (ENTERTAINMENT_STRONG, ENTERTAINMENT_MEDIUM),
        Category::CurrentAffairs => (CURRENT_AFFAIRS_STRONG, CURRENT_AFFAIRS_MEDIUM),
        Category::SportsEsports => (SPORTS_ESPORTS_STRONG, SPORTS_ESPORTS_MEDIUM),
    }
}

/// Per-platform category nudges: a platform's audience skews what its hot
/// list means.
fn platform_bias(platform: &str, category: Category) -> f64 {
    match (platform, category) {
        ("hupu", Category::SportsEsports) => 0.3,
        _ => 0.0,
    }
}

/// Rule pass over a topic's combined text: keyword weights plus platform
/// bias, normalized by the best score.
pub fn rule_based_classification(text: &str, platforms: &[String]) -> (Category, f64) {
    let mut scores: Vec<(Category, f64)> = Category::ALL
        .iter()
        .map(|&category| {
            let (strong, medium) = keyword_tables(category);
            let mut score = 0.0;
            for keyword in strong {
                if text.contains(keyword) {
                    score += STRONG_WEIGHT;
                }
            }
            for keyword in medium {
                if text.contains(keyword) {
                    score += MEDIUM_WEIGHT;
                }
            }
            for platform in platforms {
                score += platform_bias(platform, category);
            }
            (category, score)
        })
        .collect();

    let max_score = scores
        .iter()
        .map(|(_, s)| *s)
        .fold(0.0f64, f64::max);
    if max_score > 0.0 {
        for (_, score) in &mut scores {
            *score = (*score / max_score).min(1.0);
        }
    }

    let (best, confidence) = scores
        .into_iter()
        .max_by(|a, b| a.1.total_cmp(&b.1))
        .unwrap();

    if confidence < RULE_FLOOR {
        return (Category::CurrentAffairs, confidence);
    }
    (best, confidence)
}

/// Classify a topic and write the result back. Rule-first; the LLM only runs
/// when the rules are unsure, and its own failure degrades to the default
/// label rather than failing the caller.
pub async fn classify_topic(
    services: &Services,
    settings: &ClassifySettings,
    accountant: &TokenAccountant,
    topic: &Topic,
) -> Result<(Category, f64, CategoryMethod)> {
    let nodes = node::list_with_items(&services.store.conn(), topic.id, true, Some(20))?;

    let (category, confidence, method) = if nodes.is_empty() {
        (Category::CurrentAffairs, 0.3, CategoryMethod::Default)
    } else {
        let mut texts = Vec::new();
        let mut platforms = Vec::new();
        for n in &nodes {
            texts.push(n.item.title.clone());
            if let Some(summary) = &n.item.summary {
                texts.push(summary.clone());
            }
            if !platforms.contains(&n.item.platform) {
                platforms.push(n.item.platform.clone());
            }
        }
        let combined = texts.join(" ");

        let (rule_category, rule_confidence) = rule_based_classification(&combined, &platforms);
        if rule_confidence >= settings.rule_threshold {
            (rule_category, rule_confidence, CategoryMethod::Rule)
        } else {
            llm_classification(services, settings, accountant, topic, &nodes, &platforms).await
        }
    };

    topic::set_category(
        &services.store.conn(),
        topic.id,
        category,
        confidence,
        method,
        Utc::now(),
    )?;
    info!(
        topic_id = topic.id,
        category = %category,
        confidence,
        method = method.as_str(),
        "topic classified"
    );
    Ok((category, confidence, method))
}

async fn llm_classification(
    services: &Services,
    settings: &ClassifySettings,
    accountant: &TokenAccountant,
    topic: &Topic,
    nodes: &[NodeWithItem],
    platforms: &[String],
) -> (Category, f64, CategoryMethod) {
    let mut prompt = build_prompt(topic, nodes, platforms, accountant);
    let prompt_tokens = accountant.count(&prompt);
    if prompt_tokens > settings.max_prompt_tokens {
        warn!(
            topic_id = topic.id,
            prompt_tokens, "classification prompt over budget, truncating"
        );
        prompt = accountant.truncate(&prompt, settings.max_prompt_tokens, true);
    }

    let options = ChatOptions {
        temperature: Some(0.2),
        max_tokens: Some(settings.max_completion_tokens),
        json_response: true,
    };

    match services.chat.chat(&[ChatMessage::user(&prompt)], &options).await {
        Ok(response) => {
            let parsed = parse_response(&response.content);
            let record = judgement::insert(
                &services.store.conn(),
                &NewJudgement::success(
                    JudgementKind::Classify,
                    json!({"topic_id": topic.id}),
                    json!({
                        "category": parsed.0.as_str(),
                        "confidence": parsed.1,
                        "raw": response.content,
                    }),
                    services.chat.provider_name(),
                    services.chat.model(),
                )
                .with_usage(
                    response.usage.prompt_tokens as i64,
                    response.usage.completion_tokens as i64,
                ),
            );
            if let Err(err) = record {
                warn!(topic_id = topic.id, error = %err, "judgement log write failed");
            }
            (parsed.0, parsed.1, CategoryMethod::Llm)
        }
        Err(err) => {
            warn!(topic_id = topic.id, error = %err, "LLM classification failed, using default");
            let record = judgement::insert(
                &services.store.conn(),
                &NewJudgement::failure(
                    JudgementKind::Classify,
                    json!({"topic_id": topic.id}),
                    &err.to_string(),
                    services.chat.provider_name(),
                    services.chat.model(),
                ),
            );
            if let Err(err) = record {
                warn!(topic_id = topic.id, error = %err, "judgement log write failed");
            }
            (Category::CurrentAffairs, 0.3, CategoryMethod::Default)
        }
    }
}

fn build_prompt(
    topic: &Topic,
    nodes: &[NodeWithItem],
    platforms: &[String],
    accountant: &TokenAccountant,
) -> String {
    let mut node_lines = Vec::new();
    for (i, n) in nodes.iter().take(5).enumerate() {
        let title = accountant.truncate(&n.item.title, 50, true);
        node_lines.push(format!("{}. [{}] {}", i + 1, n.item.platform, title));
        if let Some(summary) = &n.item.summary {
            node_lines.push(format!("   摘要: {}", accountant.truncate(summary, 80, true)));
        }
    }

    let duration = {
        let hours = topic.duration_hours();
        let days = (hours / 24.0) as i64;
        if days > 0 {
            format!("{}天{}小时", days, (hours as i64) % 24)
        } else {
            format!("{}小时", hours as i64)
        }
    };

    format!(
        r#"请对以下热点事件进行分类，从三个类别中选择一个：

【分类定义】
1. entertainment（娱乐八卦类）：明星、影视、综艺、娱乐圈八卦、粉丝文化等
2. current_affairs（社会时事类）：政策法规、社会事件、民生新闻、经济财经、公共事务等
3. sports_esports（体育电竞类）：体育赛事、电竞比赛、球队球员、体育新闻等

【事件信息】
主题标题: {}
持续时长: {}
来源平台数: {}

【关键内容】（按时间顺序）
{}

请分析事件的主要内容和性质，输出JSON格式：
{{
  "category": "entertainment | current_affairs | sports_esports",
  "confidence": 0.0-1.0,
  "reason": "分类理由（简明扼要）"
}}

注意：
1. confidence应反映分类的确定性（0.0-1.0）
2. 如果事件涉及多个领域，选择最主要的一个
3. reason应说明为什么选择这个分类
"#,
        topic.title_key,
        duration,
        platforms.len(),
        node_lines.join("\n")
    )
}

/// Parse the model's category answer; anything unusable falls back to a
/// keyword scan of the raw text.
fn parse_response(content: &str) -> (Category, f64) {
    if let Some(value) = parse_llm_json(content) {
        if let Some(raw) = value.get("category").and_then(|v| v.as_str()) {
            if let Ok(category) = Category::parse(raw) {
                return (category, confidence_from(&value, 0.5));
            }
        }
    }

    let lower = content.to_lowercase();
    let category = if lower.contains("entertainment") {
        Category::Entertainment
    } else if lower.contains("sports") || lower.contains("esports") {
        Category::SportsEsports
    } else {
        Category::CurrentAffairs
    };
    (category, 0.5)
}
