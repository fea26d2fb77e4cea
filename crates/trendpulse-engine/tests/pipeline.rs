//! End-to-end pipeline scenarios: heat normalization -> period merge ->
//! global merge against a scripted provider.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{Duration, Utc};
use serde_json::json;

use trendpulse_engine::{
    EngineSettings, Services, normalize_window_heat, run_global_merge, run_period_merge,
};
use trendpulse_llm::TokenAccountant;
use trendpulse_store::Store;
use trendpulse_store::queries::{embedding, heat, item, judgement, node, summary, topic};
use trendpulse_testing::{ItemSpec, MockProvider, seed_items, test_window};
use trendpulse_types::{
    JudgementKind, MergeStatus, ObjectType, RunStatus, SummaryMethod, Window, vector_key,
};
use trendpulse_vector::{Metadata, VectorIndex};

const DIM: usize = 8;

fn unit(axis: usize) -> Vec<f32> {
    let mut v = vec![0.0; DIM];
    v[axis] = 1.0;
    v
}

fn accountant() -> TokenAccountant {
    TokenAccountant::new(
        "qwen3-32b",
        &trendpulse_types::model_limits::default_context_limits(),
    )
}

fn settings() -> EngineSettings {
    EngineSettings {
        embedding_dimension: DIM,
        ..EngineSettings::default()
    }
}

struct Fixture {
    services: Services,
    chat: Arc<MockProvider>,
    embedder: Arc<MockProvider>,
    window: Window,
}

fn fixture() -> Fixture {
    let chat = Arc::new(MockProvider::new());
    let embedder = Arc::new(MockProvider::new().with_embed_dim(DIM));
    let services = Services::new(
        Store::open_in_memory().unwrap(),
        VectorIndex::open_in_memory().unwrap(),
        chat.clone(),
        embedder.clone(),
    );
    Fixture {
        services,
        chat,
        embedder,
        window: test_window(),
    }
}

fn topic_count(store: &Store) -> i64 {
    store
        .conn()
        .query_row("SELECT COUNT(*) FROM topics", [], |row| row.get(0))
        .unwrap()
}

// Scenario: a lone item on one platform is normalized to the whole window's
// heat, then discarded as single-occurrence noise. No topic appears.
#[tokio::test]
async fn lone_item_is_discarded() {
    let f = fixture();
    let ids = seed_items(
        &f.services.store,
        &f.window,
        &[ItemSpec::new("weibo", "孤立热搜条目一则").heat(100.0)],
    );

    normalize_window_heat(&f.services.store, &f.window, &HashMap::new()).unwrap();
    let report = run_period_merge(&f.services, &settings(), &accountant(), &f.window)
        .await
        .unwrap();

    assert_eq!(report.status, RunStatus::Success);
    assert_eq!(report.input_items, 1);
    assert_eq!(report.kept_items, 0);
    assert_eq!(report.dropped_items, 1);

    let it = item::get(&f.services.store.conn(), ids[0]).unwrap().unwrap();
    assert_eq!(it.normalized_heat, Some(1.0));
    assert_eq!(it.status, MergeStatus::Discarded);
    assert_eq!(it.occurrence_count, 1);
    assert!(it.cluster_id.is_some());

    // Singleton clusters never reach the LLM.
    assert_eq!(f.chat.chat_call_count(), 0);
    assert_eq!(topic_count(&f.services.store), 0);
}

// Scenario: three near-identical headlines across platforms cluster, survive
// confirmation, and seed exactly one topic with three nodes and one period
// heat row.
#[tokio::test]
async fn cross_platform_cluster_creates_topic() {
    let f = fixture();
    let base = Utc::now() - Duration::hours(3);
    seed_items(
        &f.services.store,
        &f.window,
        &[
            ItemSpec::new("weibo", "勇士队总决赛夺冠")
                .heat(100.0)
                .fetched_at(base),
            ItemSpec::new("zhihu", "勇士队总决赛夺冠引热议")
                .heat(80.0)
                .fetched_at(base + Duration::hours(1)),
            ItemSpec::new("toutiao", "勇士队总决赛夺冠了")
                .heat(60.0)
                .fetched_at(base + Duration::hours(2)),
        ],
    );

    f.embedder
        .push_embed_batch(vec![unit(0), unit(0), unit(0)]);
    f.chat.push_chat_json(json!({
        "is_same_event": true,
        "confidence": 0.95,
        "reason": "同一赛事的不同报道"
    }));
    f.chat.push_chat_json(json!({
        "summary": "勇士队在总决赛中夺冠，多平台热议。",
        "key_points": ["夺冠", "热议", "多平台报道"]
    }));

    normalize_window_heat(&f.services.store, &f.window, &HashMap::new()).unwrap();
    let stage1 = run_period_merge(&f.services, &settings(), &accountant(), &f.window)
        .await
        .unwrap();
    assert_eq!(stage1.kept_items, 3);
    assert_eq!(stage1.dropped_items, 0);

    let stage2 = run_global_merge(&f.services, &settings(), &accountant(), &f.window)
        .await
        .unwrap();
    assert_eq!(stage2.input_clusters, 1);
    assert_eq!(stage2.new_count, 1);
    assert_eq!(stage2.merge_count, 0);

    assert_eq!(topic_count(&f.services.store), 1);
    let t = topic::get(&f.services.store.conn(), 1).unwrap().unwrap();
    assert_eq!(t.title_key, "勇士队总决赛夺冠");
    assert_eq!(t.intensity_total, 3);
    assert!(t.first_seen <= t.last_active);
    assert_eq!(node::count_for_topic(&f.services.store.conn(), t.id).unwrap(), 3);

    // Every merged item carries exactly one node.
    for it in item::list_by_cluster(
        &f.services.store.conn(),
        &item::get(&f.services.store.conn(), 1)
            .unwrap()
            .unwrap()
            .cluster_id
            .unwrap(),
    )
    .unwrap()
    {
        assert_eq!(it.status, MergeStatus::Merged);
        assert_eq!(node::count_for_item(&f.services.store.conn(), it.id).unwrap(), 1);
    }

    let heats = heat::list_for_topic(&f.services.store.conn(), t.id).unwrap();
    assert_eq!(heats.len(), 1);
    assert_eq!(heats[0].source_count, 3);
    assert!((heats[0].heat_normalized - 1.0 / 3.0).abs() < 1e-9);

    // The full summary landed and is retrievable as a topic-summary vector.
    let latest = summary::latest_for_topic(&f.services.store.conn(), t.id)
        .unwrap()
        .unwrap();
    assert_eq!(latest.method, SummaryMethod::Full);
    assert!(
        f.services
            .vector
            .get(&vector_key(ObjectType::TopicSummary, latest.id))
            .unwrap()
            .is_some()
    );

    // Rule-based classification, no extra LLM traffic: one confirm call plus
    // one summary call.
    assert_eq!(f.chat.chat_call_count(), 2);
    let prompts = f.chat.chat_prompts();
    assert!(prompts[0].contains("勇士队总决赛夺冠"));
    assert!(prompts[0].contains("is_same_event"));
    let classified = topic::get(&f.services.store.conn(), t.id).unwrap().unwrap();
    assert_eq!(
        classified.category,
        Some(trendpulse_types::Category::SportsEsports)
    );
}

// Scenario: a new cluster lands close to an existing topic's summary vector;
// the model approves the merge and the topic absorbs the cluster.
#[tokio::test]
async fn extension_merges_into_existing_topic() {
    let f = fixture();
    let now = Utc::now();

    let topic_id = topic::insert(
        &f.services.store.conn(),
        &topic::NewTopic {
            title_key: "某地地震救援进展".to_string(),
            first_seen: now - Duration::days(3),
            last_active: now - Duration::days(2),
            intensity_total: 5,
            current_heat_normalized: Some(0.2),
        },
    )
    .unwrap();
    let summary_id = summary::insert(
        &f.services.store.conn(),
        topic_id,
        "某地发生地震，救援持续推进。",
        SummaryMethod::Full,
        now - Duration::days(2),
        "mock",
        "mock-model",
    )
    .unwrap();
    topic::set_summary_id(&f.services.store.conn(), topic_id, summary_id).unwrap();
    embedding::insert(
        &f.services.store.conn(),
        ObjectType::TopicSummary,
        summary_id,
        "mock",
        "mock-model",
        &unit(0),
        now - Duration::days(2),
    )
    .unwrap();
    let mut metadata = Metadata::new();
    metadata.insert("object_type".into(), json!("topic_summary"));
    metadata.insert("object_id".into(), json!(summary_id));
    metadata.insert("topic_id".into(), json!(topic_id));
    f.services
        .vector
        .upsert(
            &[vector_key(ObjectType::TopicSummary, summary_id)],
            &[unit(0)],
            &[metadata],
            None,
        )
        .unwrap();

    let item_ids = seed_items(
        &f.services.store,
        &f.window,
        &[
            ItemSpec::new("weibo", "地震救援最新进展")
                .heat(90.0)
                .fetched_at(now),
            ItemSpec::new("netease", "地震救援最新进展通报")
                .heat(70.0)
                .fetched_at(now - Duration::minutes(30)),
        ],
    );
    for &id in &item_ids {
        item::set_normalized_heat(&f.services.store.conn(), id, 0.5).unwrap();
        item::assign_cluster(
            &f.services.store.conn(),
            id,
            "clu_quake01",
            2,
            MergeStatus::PendingGlobal,
        )
        .unwrap();
    }
    // Representative vector lives only in the authoritative embeddings
    // table; retrieval must fall through to it.
    embedding::insert(
        &f.services.store.conn(),
        ObjectType::SourceItem,
        item_ids[0],
        "mock",
        "mock-model",
        &unit(0),
        now,
    )
    .unwrap();

    f.chat.push_chat_json(json!({
        "decision": "merge",
        "target_topic_id": topic_id,
        "confidence": 0.8,
        "reason": "同一地震事件的后续报道"
    }));

    let report = run_global_merge(&f.services, &settings(), &accountant(), &f.window)
        .await
        .unwrap();
    assert_eq!(report.merge_count, 1);
    assert_eq!(report.new_count, 0);

    let t = topic::get(&f.services.store.conn(), topic_id).unwrap().unwrap();
    assert_eq!(t.intensity_total, 7);
    // Timestamps round-trip at microsecond precision.
    assert!((t.last_active - now).num_milliseconds().abs() < 5);
    assert!(t.last_active > now - Duration::days(1));
    assert_eq!(node::count_for_topic(&f.services.store.conn(), topic_id).unwrap(), 2);

    for &id in &item_ids {
        let it = item::get(&f.services.store.conn(), id).unwrap().unwrap();
        assert_eq!(it.status, MergeStatus::Merged);
    }

    let heats = heat::list_for_topic(&f.services.store.conn(), topic_id).unwrap();
    assert_eq!(heats.len(), 1);
    assert_eq!(heats[0].source_count, 2);

    // One relation call; the incremental summary gate (< 3 new nodes) kept
    // the summarizer quiet.
    assert_eq!(f.chat.chat_call_count(), 1);
    assert_eq!(
        judgement::count_by_kind(&f.services.store.conn(), JudgementKind::Relation).unwrap(),
        1
    );
}

// Scenario: the confirmation call fails outright; the cluster splits into
// singletons, everything is discarded, and the run still records success.
#[tokio::test]
async fn llm_failure_splits_cluster_defensively() {
    let f = fixture();
    seed_items(
        &f.services.store,
        &f.window,
        &[
            ItemSpec::new("weibo", "同一事件报道甲").heat(10.0),
            ItemSpec::new("zhihu", "同一事件报道乙").heat(20.0),
            ItemSpec::new("sina", "同一事件报道丙").heat(30.0),
            ItemSpec::new("hupu", "同一事件报道丁").heat(40.0),
        ],
    );
    f.embedder
        .push_embed_batch(vec![unit(1), unit(1), unit(1), unit(1)]);
    f.chat.push_chat_failure("timeout after 60s");

    normalize_window_heat(&f.services.store, &f.window, &HashMap::new()).unwrap();
    let report = run_period_merge(&f.services, &settings(), &accountant(), &f.window)
        .await
        .unwrap();

    assert_eq!(report.status, RunStatus::Success);
    assert_eq!(report.kept_items, 0);
    assert_eq!(report.dropped_items, 4);
    assert_eq!(report.cluster_count, 4);

    let discarded =
        item::list_by_window_status(&f.services.store.conn(), &f.window, MergeStatus::PendingPeriod)
            .unwrap();
    assert!(discarded.is_empty());
    assert_eq!(topic_count(&f.services.store), 0);

    // The failed call is still on the judgement log.
    assert_eq!(
        judgement::count_by_kind(&f.services.store.conn(), JudgementKind::PeriodMerge).unwrap(),
        1
    );
}

// Scenario: the nearest topic-summary vector is below the similarity bar, so
// no candidate survives and a topic is created without consulting the model.
#[tokio::test]
async fn dissimilar_candidate_creates_new_topic_without_llm() {
    let f = fixture();
    let now = Utc::now();

    let old_topic = topic::insert(
        &f.services.store.conn(),
        &topic::NewTopic {
            title_key: "无关旧话题".to_string(),
            first_seen: now - Duration::days(5),
            last_active: now - Duration::days(1),
            intensity_total: 4,
            current_heat_normalized: None,
        },
    )
    .unwrap();
    let old_summary = summary::insert(
        &f.services.store.conn(),
        old_topic,
        "无关话题摘要",
        SummaryMethod::Full,
        now - Duration::days(1),
        "mock",
        "mock-model",
    )
    .unwrap();
    let mut metadata = Metadata::new();
    metadata.insert("object_type".into(), json!("topic_summary"));
    metadata.insert("object_id".into(), json!(old_summary));
    metadata.insert("topic_id".into(), json!(old_topic));
    f.services
        .vector
        .upsert(
            &[vector_key(ObjectType::TopicSummary, old_summary)],
            &[unit(1)],
            &[metadata],
            None,
        )
        .unwrap();

    let item_ids = seed_items(
        &f.services.store,
        &f.window,
        &[
            ItemSpec::new("weibo", "球队比赛夺冠冠军").heat(50.0).fetched_at(now),
            ItemSpec::new("zhihu", "球队比赛夺冠冠军之夜").heat(40.0).fetched_at(now),
        ],
    );
    for &id in &item_ids {
        item::set_normalized_heat(&f.services.store.conn(), id, 0.5).unwrap();
        item::assign_cluster(
            &f.services.store.conn(),
            id,
            "clu_final02",
            2,
            MergeStatus::PendingGlobal,
        )
        .unwrap();
    }
    // Orthogonal to the lone topic-summary vector: similarity 0 < 0.5.
    embedding::insert(
        &f.services.store.conn(),
        ObjectType::SourceItem,
        item_ids[0],
        "mock",
        "mock-model",
        &unit(0),
        now,
    )
    .unwrap();

    let report = run_global_merge(&f.services, &settings(), &accountant(), &f.window)
        .await
        .unwrap();
    assert_eq!(report.new_count, 1);
    assert_eq!(report.merge_count, 0);
    assert_eq!(topic_count(&f.services.store), 2);

    // No relation judgement was ever attempted.
    assert_eq!(
        judgement::count_by_kind(&f.services.store.conn(), JudgementKind::Relation).unwrap(),
        0
    );

    // The old topic is untouched.
    let untouched = topic::get(&f.services.store.conn(), old_topic).unwrap().unwrap();
    assert_eq!(untouched.intensity_total, 4);
}

// Scenario: replaying both stages over a fully processed window does nothing.
#[tokio::test]
async fn replay_is_a_noop() {
    let f = fixture();
    let base = Utc::now() - Duration::hours(2);
    seed_items(
        &f.services.store,
        &f.window,
        &[
            ItemSpec::new("weibo", "勇士队总决赛夺冠")
                .heat(100.0)
                .fetched_at(base),
            ItemSpec::new("zhihu", "勇士队总决赛夺冠引热议")
                .heat(80.0)
                .fetched_at(base + Duration::hours(1)),
        ],
    );
    f.embedder.push_embed_batch(vec![unit(0), unit(0)]);
    f.chat.push_chat_json(json!({
        "is_same_event": true,
        "confidence": 0.9,
        "reason": "同一事件"
    }));
    f.chat.push_chat_json(json!({
        "summary": "总决赛夺冠相关讨论。",
        "key_points": ["夺冠"]
    }));

    normalize_window_heat(&f.services.store, &f.window, &HashMap::new()).unwrap();
    run_period_merge(&f.services, &settings(), &accountant(), &f.window)
        .await
        .unwrap();
    run_global_merge(&f.services, &settings(), &accountant(), &f.window)
        .await
        .unwrap();

    let intensity_before: i64 = f
        .services
        .store
        .conn()
        .query_row("SELECT intensity_total FROM topics WHERE id = 1", [], |row| row.get(0))
        .unwrap();
    let embeds_before = f.embedder.embed_call_count();

    // Stage 1 replay: nothing pending, no model traffic.
    let stage1 = run_period_merge(&f.services, &settings(), &accountant(), &f.window)
        .await
        .unwrap();
    assert_eq!(stage1.input_items, 0);
    assert_eq!(f.embedder.embed_call_count(), embeds_before);

    // Stage 2 replay: zero clusters, zero new topics, counters unchanged.
    let stage2 = run_global_merge(&f.services, &settings(), &accountant(), &f.window)
        .await
        .unwrap();
    assert_eq!(stage2.input_clusters, 0);
    assert_eq!(stage2.new_count, 0);
    assert_eq!(topic_count(&f.services.store), 1);

    let intensity_after: i64 = f
        .services
        .store
        .conn()
        .query_row("SELECT intensity_total FROM topics WHERE id = 1", [], |row| row.get(0))
        .unwrap();
    assert_eq!(intensity_before, intensity_after);
    assert_eq!(node::count_for_topic(&f.services.store.conn(), 1).unwrap(), 2);
}

// Scenario: an empty window succeeds with zero input and no model calls.
#[tokio::test]
async fn empty_window_short_circuits() {
    let f = fixture();

    let stage1 = run_period_merge(&f.services, &settings(), &accountant(), &f.window)
        .await
        .unwrap();
    assert_eq!(stage1.status, RunStatus::Success);
    assert_eq!(stage1.input_items, 0);

    let stage2 = run_global_merge(&f.services, &settings(), &accountant(), &f.window)
        .await
        .unwrap();
    assert_eq!(stage2.input_clusters, 0);

    assert_eq!(f.chat.chat_call_count(), 0);
    assert_eq!(f.embedder.embed_call_count(), 0);
}

// Degraded embedding: the endpoint errors, random vectors keep the stage
// alive, and everything lands as singletons.
#[tokio::test]
async fn embedding_failure_degrades_to_random_vectors() {
    let f = fixture();
    seed_items(
        &f.services.store,
        &f.window,
        &[
            ItemSpec::new("weibo", "标题甲").heat(10.0),
            ItemSpec::new("zhihu", "标题乙").heat(20.0),
        ],
    );
    f.embedder.push_embed_failure("connect refused");

    normalize_window_heat(&f.services.store, &f.window, &HashMap::new()).unwrap();
    let report = run_period_merge(&f.services, &settings(), &accountant(), &f.window)
        .await
        .unwrap();

    assert_eq!(report.status, RunStatus::Success);
    // Random unit vectors land nowhere near the cosine gate.
    assert_eq!(report.dropped_items, 2);

    // The degraded vectors still hit the authoritative embeddings table.
    for id in [1i64, 2] {
        let record = embedding::latest_for_object(
            &f.services.store.conn(),
            ObjectType::SourceItem,
            id,
        )
        .unwrap()
        .unwrap();
        assert_eq!(record.provider, "random");
        assert_eq!(record.vector.len(), DIM);
    }
}

// Two clusters in one run: the first topic's placeholder vector is live
// before the second cluster retrieves, and the end-of-run summary fan-out
// runs over independent store connections (file-backed).
#[tokio::test]
async fn batched_summaries_use_independent_connections() {
    let dir = tempfile::TempDir::new().unwrap();
    let chat = Arc::new(MockProvider::new());
    let embedder = Arc::new(MockProvider::new().with_embed_dim(DIM));
    let services = Services::new(
        Store::open(&dir.path().join("store.db")).unwrap(),
        VectorIndex::open(&dir.path().join("vectors.db")).unwrap(),
        chat.clone(),
        embedder.clone(),
    );
    let window = test_window();

    seed_items(
        &services.store,
        &window,
        &[
            ItemSpec::new("weibo", "勇士队总决赛夺冠").heat(100.0),
            ItemSpec::new("zhihu", "勇士队总决赛夺冠引热议").heat(90.0),
            ItemSpec::new("netease", "某市发布新政策公告").heat(70.0),
            ItemSpec::new("sina", "某市发布新政策公告解读").heat(60.0),
        ],
    );

    // Stage 1 batch, then the two placeholder embeddings in cluster order;
    // the concurrent summary embeds fall back to derived vectors.
    embedder.push_embed_batch(vec![unit(0), unit(0), unit(1), unit(1)]);
    embedder.push_embed_batch(vec![unit(0)]);
    embedder.push_embed_batch(vec![unit(1)]);

    chat.push_chat_json(json!({"is_same_event": true, "confidence": 0.9, "reason": "同一事件"}));
    chat.push_chat_json(json!({"is_same_event": true, "confidence": 0.9, "reason": "同一事件"}));
    // Concurrent full summaries; either topic may take either reply.
    chat.push_chat_json(json!({"summary": "事件摘要一。", "key_points": ["一"]}));
    chat.push_chat_json(json!({"summary": "事件摘要二。", "key_points": ["二"]}));

    normalize_window_heat(&services.store, &window, &HashMap::new()).unwrap();
    run_period_merge(&services, &settings(), &accountant(), &window)
        .await
        .unwrap();
    let report = run_global_merge(&services, &settings(), &accountant(), &window)
        .await
        .unwrap();

    assert_eq!(report.new_count, 2);
    assert_eq!(report.merge_count, 0);
    // The second cluster saw the first topic's placeholder vector but sat
    // below the similarity bar, so no relation call fired.
    assert_eq!(
        judgement::count_by_kind(&services.store.conn(), JudgementKind::Relation).unwrap(),
        0
    );

    for topic_id in [1i64, 2] {
        let latest = summary::latest_for_topic(&services.store.conn(), topic_id)
            .unwrap()
            .unwrap();
        assert_eq!(latest.method, SummaryMethod::Full);
        assert!(
            services
                .vector
                .get(&vector_key(ObjectType::TopicSummary, latest.id))
                .unwrap()
                .is_some()
        );
        // Placeholder history is retained under the full summary.
        assert_eq!(
            summary::count_for_topic(&services.store.conn(), topic_id).unwrap(),
            2
        );
    }
}

// Window-level heat invariant after Stage 1: everything has left the pending
// state and the normalized heat still sums to one.
#[tokio::test]
async fn window_heat_invariant_after_stage1() {
    let f = fixture();
    seed_items(
        &f.services.store,
        &f.window,
        &[
            ItemSpec::new("weibo", "热搜一").heat(500.0),
            ItemSpec::new("weibo", "热搜二").heat(100.0),
            ItemSpec::new("zhihu", "问答一").heat(90.0),
            ItemSpec::new("sina", "新闻一"),
        ],
    );

    normalize_window_heat(&f.services.store, &f.window, &HashMap::new()).unwrap();
    run_period_merge(&f.services, &settings(), &accountant(), &f.window)
        .await
        .unwrap();

    // All items have left pending_period_merge; their heat sums to 1.
    let mut total = 0.0f64;
    for status in [MergeStatus::PendingGlobal, MergeStatus::Discarded] {
        for it in
            item::list_by_window_status(&f.services.store.conn(), &f.window, status).unwrap()
        {
            total += it.normalized_heat.unwrap_or(0.0);
        }
    }
    assert!((total - 1.0).abs() < 1e-9, "window heat total = {}", total);
}
