use rusqlite::Connection;

use crate::Result;

// Schema version (increment when changing table definitions)
pub const SCHEMA_VERSION: i32 = 1;

// NOTE: Storage design
//
// The relational store is the source of truth for status transitions. Every
// stage coupling lives on the source_items row (the status column), not in a
// queue: each stage is a pure function of the store's current state, which is
// what makes crash recovery a matter of re-triggering the stage.
//
// Timestamps are RFC 3339 TEXT. Vectors are JSON arrays on the embeddings
// table (authoritative copy); the searchable vector index is a separate,
// derived database and can be rebuilt from embeddings.

pub fn init_schema(conn: &Connection) -> Result<()> {
    let current_version: i32 = conn.query_row("PRAGMA user_version", [], |row| row.get(0))?;

    if current_version != 0 && current_version != SCHEMA_VERSION {
        drop_all_tables(conn)?;
    }

    conn.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS source_items (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            platform TEXT NOT NULL,
            title TEXT NOT NULL,
            summary TEXT,
            url TEXT NOT NULL,
            url_hash TEXT NOT NULL,
            dedup_key TEXT NOT NULL UNIQUE,
            published_at TEXT,
            fetched_at TEXT NOT NULL,
            interactions TEXT,
            raw_heat REAL,
            normalized_heat REAL,
            "window" TEXT NOT NULL,
            cluster_id TEXT,
            occurrence_count INTEGER NOT NULL DEFAULT 1,
            status TEXT NOT NULL DEFAULT 'pending_period_merge',
            embedding_id INTEGER,
            run_id TEXT
        );

        CREATE TABLE IF NOT EXISTS topics (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            title_key TEXT NOT NULL,
            first_seen TEXT NOT NULL,
            last_active TEXT NOT NULL,
            status TEXT NOT NULL DEFAULT 'active',
            intensity_total INTEGER NOT NULL DEFAULT 0,
            interaction_total INTEGER,
            current_heat_normalized REAL,
            heat_percentage REAL,
            summary_id INTEGER,
            category TEXT,
            category_confidence REAL,
            category_method TEXT,
            category_updated_at TEXT
        );

        CREATE TABLE IF NOT EXISTS topic_nodes (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            topic_id INTEGER NOT NULL,
            source_item_id INTEGER NOT NULL,
            appended_at TEXT NOT NULL,
            UNIQUE (topic_id, source_item_id),
            FOREIGN KEY (topic_id) REFERENCES topics(id),
            FOREIGN KEY (source_item_id) REFERENCES source_items(id)
        );

        CREATE TABLE IF NOT EXISTS topic_period_heat (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            topic_id INTEGER NOT NULL,
            date TEXT NOT NULL,
            window_slot TEXT NOT NULL,
            heat_normalized REAL NOT NULL,
            heat_percentage REAL NOT NULL,
            source_count INTEGER NOT NULL DEFAULT 0,
            UNIQUE (topic_id, date, window_slot),
            FOREIGN KEY (topic_id) REFERENCES topics(id)
        );

        CREATE TABLE IF NOT EXISTS summaries (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            topic_id INTEGER NOT NULL,
            content TEXT NOT NULL,
            method TEXT NOT NULL,
            generated_at TEXT NOT NULL,
            provider TEXT NOT NULL,
            model TEXT NOT NULL,
            FOREIGN KEY (topic_id) REFERENCES topics(id)
        );

        CREATE TABLE IF NOT EXISTS embeddings (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            object_type TEXT NOT NULL,
            object_id INTEGER NOT NULL,
            provider TEXT NOT NULL,
            model TEXT NOT NULL,
            vector TEXT NOT NULL,
            created_at TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS pipeline_runs (
            run_id TEXT PRIMARY KEY,
            stage TEXT NOT NULL,
            status TEXT NOT NULL DEFAULT 'running',
            started_at TEXT NOT NULL,
            ended_at TEXT,
            duration_ms INTEGER,
            input_count INTEGER NOT NULL DEFAULT 0,
            output_count INTEGER NOT NULL DEFAULT 0,
            success_count INTEGER NOT NULL DEFAULT 0,
            failed_count INTEGER NOT NULL DEFAULT 0,
            results TEXT,
            error_summary TEXT
        );

        CREATE TABLE IF NOT EXISTS ingest_runs (
            run_id TEXT PRIMARY KEY,
            status TEXT NOT NULL DEFAULT 'running',
            started_at TEXT NOT NULL,
            ended_at TEXT,
            duration_ms INTEGER,
            total_platforms INTEGER NOT NULL DEFAULT 0,
            success_platforms INTEGER NOT NULL DEFAULT 0,
            failed_platforms INTEGER NOT NULL DEFAULT 0,
            total_items INTEGER NOT NULL DEFAULT 0,
            success_items INTEGER NOT NULL DEFAULT 0,
            failed_items INTEGER NOT NULL DEFAULT 0,
            platform_results TEXT,
            error_summary TEXT
        );

        CREATE TABLE IF NOT EXISTS judgements (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            kind TEXT NOT NULL,
            status TEXT NOT NULL,
            request TEXT NOT NULL,
            response TEXT,
            error_message TEXT,
            latency_ms INTEGER,
            tokens_prompt INTEGER,
            tokens_completion INTEGER,
            provider TEXT NOT NULL,
            model TEXT NOT NULL,
            created_at TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS category_metrics (
            category TEXT PRIMARY KEY,
            topic_count INTEGER NOT NULL DEFAULT 0,
            avg_duration_hours REAL NOT NULL DEFAULT 0,
            intensity_sum INTEGER NOT NULL DEFAULT 0,
            window_days INTEGER NOT NULL DEFAULT 0,
            computed_at TEXT NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_items_window_status ON source_items("window", status);
        CREATE INDEX IF NOT EXISTS idx_items_cluster ON source_items(cluster_id);
        CREATE INDEX IF NOT EXISTS idx_items_platform_fetched ON source_items(platform, fetched_at);
        CREATE INDEX IF NOT EXISTS idx_topics_status_active ON topics(status, last_active DESC);
        CREATE INDEX IF NOT EXISTS idx_topics_category ON topics(category, status);
        CREATE INDEX IF NOT EXISTS idx_nodes_topic ON topic_nodes(topic_id, appended_at);
        CREATE INDEX IF NOT EXISTS idx_heat_topic ON topic_period_heat(topic_id, date);
        CREATE INDEX IF NOT EXISTS idx_summaries_topic ON summaries(topic_id, generated_at DESC);
        CREATE INDEX IF NOT EXISTS idx_embeddings_object ON embeddings(object_type, object_id);
        CREATE INDEX IF NOT EXISTS idx_runs_stage ON pipeline_runs(stage, started_at);
        CREATE INDEX IF NOT EXISTS idx_judgements_kind ON judgements(kind, created_at);
        "#,
    )?;

    conn.execute(&format!("PRAGMA user_version = {}", SCHEMA_VERSION), [])?;

    Ok(())
}

fn drop_all_tables(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        r#"
        DROP TABLE IF EXISTS category_metrics;
        DROP TABLE IF EXISTS judgements;
        DROP TABLE IF EXISTS ingest_runs;
        DROP TABLE IF EXISTS pipeline_runs;
        DROP TABLE IF EXISTS embeddings;
        DROP TABLE IF EXISTS summaries;
        DROP TABLE IF EXISTS topic_period_heat;
        DROP TABLE IF EXISTS topic_nodes;
        DROP TABLE IF EXISTS topics;
        DROP TABLE IF EXISTS source_items;
        "#,
    )?;
    Ok(())
}
