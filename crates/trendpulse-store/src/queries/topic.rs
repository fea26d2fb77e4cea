use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension, Row, params};
use trendpulse_types::{Category, CategoryMethod, Topic, TopicStatus};

use super::{parse_opt_ts, parse_ts, ts};
use crate::{Error, Result};

/// Insert payload for a topic seeded by Stage 2.
#[derive(Debug, Clone)]
pub struct NewTopic {
    pub title_key: String,
    pub first_seen: DateTime<Utc>,
    pub last_active: DateTime<Utc>,
    pub intensity_total: i64,
    pub current_heat_normalized: Option<f64>,
}

const COLUMNS: &str = "id, title_key, first_seen, last_active, status, intensity_total,
    interaction_total, current_heat_normalized, heat_percentage, summary_id,
    category, category_confidence, category_method, category_updated_at";

fn decode_row(row: &Row<'_>) -> Result<Topic> {
    let first_seen_raw: String = row.get(2).map_err(Error::from)?;
    let last_active_raw: String = row.get(3).map_err(Error::from)?;
    let status_raw: String = row.get(4).map_err(Error::from)?;
    let category_raw: Option<String> = row.get(10).map_err(Error::from)?;
    let method_raw: Option<String> = row.get(12).map_err(Error::from)?;
    let category_updated_raw: Option<String> = row.get(13).map_err(Error::from)?;

    Ok(Topic {
        id: row.get(0).map_err(Error::from)?,
        title_key: row.get(1).map_err(Error::from)?,
        first_seen: parse_ts(&first_seen_raw)?,
        last_active: parse_ts(&last_active_raw)?,
        status: TopicStatus::parse(&status_raw)?,
        intensity_total: row.get(5).map_err(Error::from)?,
        interaction_total: row.get(6).map_err(Error::from)?,
        current_heat_normalized: row.get(7).map_err(Error::from)?,
        heat_percentage: row.get(8).map_err(Error::from)?,
        summary_id: row.get(9).map_err(Error::from)?,
        category: category_raw.map(|c| Category::parse(&c)).transpose()?,
        category_confidence: row.get(11).map_err(Error::from)?,
        category_method: method_raw.map(|m| CategoryMethod::parse(&m)).transpose()?,
        category_updated_at: parse_opt_ts(category_updated_raw)?,
    })
}

pub fn insert(conn: &Connection, topic: &NewTopic) -> Result<i64> {
    conn.execute(
        r#"
        INSERT INTO topics
            (title_key, first_seen, last_active, status, intensity_total,
             current_heat_normalized)
        VALUES (?1, ?2, ?3, 'active', ?4, ?5)
        "#,
        params![
            &topic.title_key,
            ts(&topic.first_seen),
            ts(&topic.last_active),
            topic.intensity_total,
            topic.current_heat_normalized,
        ],
    )?;
    Ok(conn.last_insert_rowid())
}

pub fn get(conn: &Connection, id: i64) -> Result<Option<Topic>> {
    let mut stmt = conn.prepare(&format!("SELECT {} FROM topics WHERE id = ?1", COLUMNS))?;
    let mut rows = stmt.query([id])?;
    match rows.next()? {
        Some(row) => Ok(Some(decode_row(row)?)),
        None => Ok(None),
    }
}

/// An active topic eligible as a merge candidate: fetched by id, but only if
/// it is still active and was active since the cutoff.
pub fn get_active_candidate(
    conn: &Connection,
    id: i64,
    active_since: DateTime<Utc>,
) -> Result<Option<Topic>> {
    let mut stmt = conn.prepare(&format!(
        r#"
        SELECT {}
        FROM topics
        WHERE id = ?1 AND status = 'active' AND last_active >= ?2
        "#,
        COLUMNS
    ))?;
    let mut rows = stmt.query(params![id, ts(&active_since)])?;
    match rows.next()? {
        Some(row) => Ok(Some(decode_row(row)?)),
        None => Ok(None),
    }
}

/// Fallback candidate retrieval when the vector index is unavailable or
/// empty: the most recently active topics inside the cutoff.
pub fn list_recent_active(
    conn: &Connection,
    active_since: DateTime<Utc>,
    limit: usize,
) -> Result<Vec<Topic>> {
    let mut stmt = conn.prepare(&format!(
        r#"
        SELECT {}
        FROM topics
        WHERE status = 'active' AND last_active >= ?1
        ORDER BY last_active DESC
        LIMIT ?2
        "#,
        COLUMNS
    ))?;
    let mut rows = stmt.query(params![ts(&active_since), limit as i64])?;
    let mut topics = Vec::new();
    while let Some(row) = rows.next()? {
        topics.push(decode_row(row)?);
    }
    Ok(topics)
}

/// Topics first seen inside the metrics window, optionally restricted to one
/// category.
pub fn list_since(
    conn: &Connection,
    category: Category,
    since: DateTime<Utc>,
) -> Result<Vec<Topic>> {
    let mut stmt = conn.prepare(&format!(
        r#"
        SELECT {}
        FROM topics
        WHERE category = ?1 AND first_seen >= ?2
        "#,
        COLUMNS
    ))?;
    let mut rows = stmt.query(params![category.as_str(), ts(&since)])?;
    let mut topics = Vec::new();
    while let Some(row) = rows.next()? {
        topics.push(decode_row(row)?);
    }
    Ok(topics)
}

/// Stage 2 attachment bookkeeping: push `last_active` forward (never
/// backward), add the cluster size to the intensity counter, and overwrite
/// the current-window heat fields.
pub fn record_attachment(
    conn: &Connection,
    id: i64,
    last_active: DateTime<Utc>,
    added_intensity: i64,
    heat_normalized: f64,
) -> Result<()> {
    conn.execute(
        r#"
        UPDATE topics
        SET last_active = MAX(last_active, ?2),
            intensity_total = intensity_total + ?3,
            current_heat_normalized = ?4,
            heat_percentage = ?5
        WHERE id = ?1
        "#,
        params![
            id,
            ts(&last_active),
            added_intensity,
            heat_normalized,
            heat_normalized * 100.0
        ],
    )?;
    Ok(())
}

pub fn set_summary_id(conn: &Connection, id: i64, summary_id: i64) -> Result<()> {
    conn.execute(
        "UPDATE topics SET summary_id = ?2 WHERE id = ?1",
        params![id, summary_id],
    )?;
    Ok(())
}

pub fn set_category(
    conn: &Connection,
    id: i64,
    category: Category,
    confidence: f64,
    method: CategoryMethod,
    updated_at: DateTime<Utc>,
) -> Result<()> {
    conn.execute(
        r#"
        UPDATE topics
        SET category = ?2, category_confidence = ?3, category_method = ?4,
            category_updated_at = ?5
        WHERE id = ?1
        "#,
        params![
            id,
            category.as_str(),
            confidence,
            method.as_str(),
            ts(&updated_at)
        ],
    )?;
    Ok(())
}

pub fn summary_id(conn: &Connection, id: i64) -> Result<Option<i64>> {
    let value: Option<Option<i64>> = conn
        .query_row("SELECT summary_id FROM topics WHERE id = ?1", [id], |row| {
            row.get(0)
        })
        .optional()?;
    Ok(value.flatten())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Store;
    use chrono::{Duration, TimeZone};

    fn sample(title: &str, last_active: DateTime<Utc>) -> NewTopic {
        NewTopic {
            title_key: title.to_string(),
            first_seen: last_active - Duration::hours(2),
            last_active,
            intensity_total: 3,
            current_heat_normalized: Some(0.4),
        }
    }

    #[test]
    fn test_insert_and_get() -> Result<()> {
        let store = Store::open_in_memory()?;
        let now = Utc::now();
        let id = insert(&store.conn(), &sample("quake coverage", now))?;

        let topic = get(&store.conn(), id)?.unwrap();
        assert_eq!(topic.title_key, "quake coverage");
        assert_eq!(topic.status, TopicStatus::Active);
        assert_eq!(topic.intensity_total, 3);
        assert!(topic.first_seen <= topic.last_active);
        Ok(())
    }

    #[test]
    fn test_record_attachment_never_moves_last_active_backward() -> Result<()> {
        let store = Store::open_in_memory()?;
        let now = Utc.with_ymd_and_hms(2025, 11, 7, 12, 0, 0).unwrap();
        let id = insert(&store.conn(), &sample("t", now))?;

        // An older cluster replayed against the topic must not rewind it.
        record_attachment(&store.conn(), id, now - Duration::hours(5), 2, 0.1)?;

        let topic = get(&store.conn(), id)?.unwrap();
        assert_eq!(topic.last_active, now);
        assert_eq!(topic.intensity_total, 5);
        assert_eq!(topic.current_heat_normalized, Some(0.1));
        Ok(())
    }

    #[test]
    fn test_list_recent_active_orders_and_limits() -> Result<()> {
        let store = Store::open_in_memory()?;
        let base = Utc.with_ymd_and_hms(2025, 11, 7, 12, 0, 0).unwrap();
        for i in 0..5 {
            insert(
                &store.conn(),
                &sample(&format!("t{}", i), base + Duration::hours(i)),
            )?;
        }

        let topics = list_recent_active(&store.conn(), base - Duration::days(1), 3)?;
        assert_eq!(topics.len(), 3);
        assert_eq!(topics[0].title_key, "t4");
        assert_eq!(topics[2].title_key, "t2");
        Ok(())
    }

    #[test]
    fn test_get_active_candidate_applies_cutoff() -> Result<()> {
        let store = Store::open_in_memory()?;
        let now = Utc::now();
        let stale = insert(&store.conn(), &sample("stale", now - Duration::days(200)))?;
        let fresh = insert(&store.conn(), &sample("fresh", now - Duration::days(2)))?;

        let cutoff = now - Duration::days(180);
        assert!(get_active_candidate(&store.conn(), stale, cutoff)?.is_none());
        assert!(get_active_candidate(&store.conn(), fresh, cutoff)?.is_some());
        Ok(())
    }

    #[test]
    fn test_set_category() -> Result<()> {
        let store = Store::open_in_memory()?;
        let id = insert(&store.conn(), &sample("t", Utc::now()))?;
        set_category(
            &store.conn(),
            id,
            Category::SportsEsports,
            0.8,
            CategoryMethod::Rule,
            Utc::now(),
        )?;
        let topic = get(&store.conn(), id)?.unwrap();
        assert_eq!(topic.category, Some(Category::SportsEsports));
        assert_eq!(topic.category_method, Some(CategoryMethod::Rule));
        Ok(())
    }
}
