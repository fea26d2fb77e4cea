use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension, Row, params};
use trendpulse_types::{Interactions, MergeStatus, SourceItem, Window};

use super::{opt_ts, parse_opt_ts, parse_ts, ts};
use crate::{Error, Result};

/// Insert payload for a freshly crawled item. Status starts at
/// `pending_period_merge`; the merge stages own every later transition.
#[derive(Debug, Clone)]
pub struct NewSourceItem {
    pub platform: String,
    pub title: String,
    pub summary: Option<String>,
    pub url: String,
    pub url_hash: String,
    pub dedup_key: String,
    pub published_at: Option<DateTime<Utc>>,
    pub fetched_at: DateTime<Utc>,
    pub interactions: Option<Interactions>,
    pub raw_heat: Option<f64>,
    pub window: Window,
    pub run_id: Option<String>,
}

fn decode_row(row: &Row<'_>) -> Result<SourceItem> {
    let published_at_raw: Option<String> = row.get(7).map_err(Error::from)?;
    let fetched_at_raw: String = row.get(8).map_err(Error::from)?;
    let interactions_raw: Option<String> = row.get(9).map_err(Error::from)?;
    let status_raw: String = row.get(15).map_err(Error::from)?;

    let interactions: Option<Interactions> = interactions_raw
        .map(|raw| serde_json::from_str(&raw))
        .transpose()?;

    Ok(SourceItem {
        id: row.get(0).map_err(Error::from)?,
        platform: row.get(1).map_err(Error::from)?,
        title: row.get(2).map_err(Error::from)?,
        summary: row.get(3).map_err(Error::from)?,
        url: row.get(4).map_err(Error::from)?,
        url_hash: row.get(5).map_err(Error::from)?,
        dedup_key: row.get(6).map_err(Error::from)?,
        published_at: parse_opt_ts(published_at_raw)?,
        fetched_at: parse_ts(&fetched_at_raw)?,
        interactions,
        raw_heat: row.get(10).map_err(Error::from)?,
        normalized_heat: row.get(11).map_err(Error::from)?,
        window: row.get(12).map_err(Error::from)?,
        cluster_id: row.get(13).map_err(Error::from)?,
        occurrence_count: row.get(14).map_err(Error::from)?,
        status: MergeStatus::parse(&status_raw)?,
        embedding_id: row.get(16).map_err(Error::from)?,
        run_id: row.get(17).map_err(Error::from)?,
    })
}

const COLUMNS: &str = r#"id, platform, title, summary, url, url_hash, dedup_key,
    published_at, fetched_at, interactions, raw_heat, normalized_heat,
    "window", cluster_id, occurrence_count, status, embedding_id, run_id"#;

pub fn insert(conn: &Connection, item: &NewSourceItem) -> Result<i64> {
    let interactions_json = item
        .interactions
        .as_ref()
        .map(serde_json::to_string)
        .transpose()?;

    conn.execute(
        r#"
        INSERT INTO source_items
            (platform, title, summary, url, url_hash, dedup_key,
             published_at, fetched_at, interactions, raw_heat,
             "window", run_id)
        VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)
        "#,
        params![
            &item.platform,
            &item.title,
            &item.summary,
            &item.url,
            &item.url_hash,
            &item.dedup_key,
            opt_ts(&item.published_at),
            ts(&item.fetched_at),
            interactions_json,
            item.raw_heat,
            item.window.to_string(),
            &item.run_id,
        ],
    )?;

    Ok(conn.last_insert_rowid())
}

pub fn dedup_key_exists(conn: &Connection, dedup_key: &str) -> Result<bool> {
    let count: i64 = conn.query_row(
        "SELECT COUNT(*) FROM source_items WHERE dedup_key = ?1",
        [dedup_key],
        |row| row.get(0),
    )?;
    Ok(count > 0)
}

pub fn get(conn: &Connection, id: i64) -> Result<Option<SourceItem>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {} FROM source_items WHERE id = ?1",
        COLUMNS
    ))?;
    let mut rows = stmt.query([id])?;
    match rows.next()? {
        Some(row) => Ok(Some(decode_row(row)?)),
        None => Ok(None),
    }
}

pub fn list_by_window_status(
    conn: &Connection,
    window: &Window,
    status: MergeStatus,
) -> Result<Vec<SourceItem>> {
    let mut stmt = conn.prepare(&format!(
        r#"
        SELECT {}
        FROM source_items
        WHERE "window" = ?1 AND status = ?2
        ORDER BY id
        "#,
        COLUMNS
    ))?;

    let mut rows = stmt.query(params![window.to_string(), status.as_str()])?;
    let mut items = Vec::new();
    while let Some(row) = rows.next()? {
        items.push(decode_row(row)?);
    }
    Ok(items)
}

pub fn list_by_cluster(conn: &Connection, cluster_id: &str) -> Result<Vec<SourceItem>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {} FROM source_items WHERE cluster_id = ?1 ORDER BY id",
        COLUMNS
    ))?;
    let mut rows = stmt.query([cluster_id])?;
    let mut items = Vec::new();
    while let Some(row) = rows.next()? {
        items.push(decode_row(row)?);
    }
    Ok(items)
}

pub fn set_normalized_heat(conn: &Connection, id: i64, heat: f64) -> Result<()> {
    conn.execute(
        "UPDATE source_items SET normalized_heat = ?2 WHERE id = ?1",
        params![id, heat],
    )?;
    Ok(())
}

pub fn set_embedding_id(conn: &Connection, id: i64, embedding_id: i64) -> Result<()> {
    conn.execute(
        "UPDATE source_items SET embedding_id = ?2 WHERE id = ?1",
        params![id, embedding_id],
    )?;
    Ok(())
}

fn current_status(conn: &Connection, id: i64) -> Result<MergeStatus> {
    let raw: Option<String> = conn
        .query_row("SELECT status FROM source_items WHERE id = ?1", [id], |row| {
            row.get(0)
        })
        .optional()?;
    let raw = raw.ok_or_else(|| Error::Query(format!("source item {} not found", id)))?;
    Ok(MergeStatus::parse(&raw)?)
}

/// Advance an item through the monotonic state machine. A transition the
/// machine does not permit is rejected without touching the row.
pub fn advance_status(conn: &Connection, id: i64, next: MergeStatus) -> Result<()> {
    let current = current_status(conn, id)?;
    if !current.can_advance_to(next) {
        return Err(Error::InvalidTransition {
            item_id: id,
            from: current.as_str().to_string(),
            to: next.as_str().to_string(),
        });
    }
    conn.execute(
        "UPDATE source_items SET status = ?2 WHERE id = ?1",
        params![id, next.as_str()],
    )?;
    Ok(())
}

/// Leave `pending_period_merge`: record the final cluster id and occurrence
/// count, and flip to `pending_global_merge` or `discarded` in one step.
pub fn assign_cluster(
    conn: &Connection,
    id: i64,
    cluster_id: &str,
    occurrence_count: i64,
    next: MergeStatus,
) -> Result<()> {
    let current = current_status(conn, id)?;
    if !current.can_advance_to(next) {
        return Err(Error::InvalidTransition {
            item_id: id,
            from: current.as_str().to_string(),
            to: next.as_str().to_string(),
        });
    }
    conn.execute(
        r#"
        UPDATE source_items
        SET cluster_id = ?2, occurrence_count = ?3, status = ?4
        WHERE id = ?1
        "#,
        params![id, cluster_id, occurrence_count, next.as_str()],
    )?;
    Ok(())
}

pub fn count_by_window_status(
    conn: &Connection,
    window: &Window,
    status: MergeStatus,
) -> Result<i64> {
    let count: i64 = conn.query_row(
        r#"SELECT COUNT(*) FROM source_items WHERE "window" = ?1 AND status = ?2"#,
        params![window.to_string(), status.as_str()],
        |row| row.get(0),
    )?;
    Ok(count)
}
