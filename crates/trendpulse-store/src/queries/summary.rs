use chrono::{DateTime, Utc};
use rusqlite::{Connection, Row, params};
use trendpulse_types::{Summary, SummaryMethod};

use super::{parse_ts, ts};
use crate::{Error, Result};

fn decode_row(row: &Row<'_>) -> Result<Summary> {
    let method_raw: String = row.get(3).map_err(Error::from)?;
    let generated_raw: String = row.get(4).map_err(Error::from)?;
    Ok(Summary {
        id: row.get(0).map_err(Error::from)?,
        topic_id: row.get(1).map_err(Error::from)?,
        content: row.get(2).map_err(Error::from)?,
        method: SummaryMethod::parse(&method_raw)?,
        generated_at: parse_ts(&generated_raw)?,
        provider: row.get(5).map_err(Error::from)?,
        model: row.get(6).map_err(Error::from)?,
    })
}

const COLUMNS: &str = "id, topic_id, content, method, generated_at, provider, model";

pub fn insert(
    conn: &Connection,
    topic_id: i64,
    content: &str,
    method: SummaryMethod,
    generated_at: DateTime<Utc>,
    provider: &str,
    model: &str,
) -> Result<i64> {
    conn.execute(
        r#"
        INSERT INTO summaries (topic_id, content, method, generated_at, provider, model)
        VALUES (?1, ?2, ?3, ?4, ?5, ?6)
        "#,
        params![
            topic_id,
            content,
            method.as_str(),
            ts(&generated_at),
            provider,
            model
        ],
    )?;
    Ok(conn.last_insert_rowid())
}

pub fn get(conn: &Connection, id: i64) -> Result<Option<Summary>> {
    let mut stmt = conn.prepare(&format!("SELECT {} FROM summaries WHERE id = ?1", COLUMNS))?;
    let mut rows = stmt.query([id])?;
    match rows.next()? {
        Some(row) => Ok(Some(decode_row(row)?)),
        None => Ok(None),
    }
}

/// The newest summary row of a topic, regardless of method. Older rows are
/// history and never deleted by the core.
pub fn latest_for_topic(conn: &Connection, topic_id: i64) -> Result<Option<Summary>> {
    let mut stmt = conn.prepare(&format!(
        r#"
        SELECT {}
        FROM summaries
        WHERE topic_id = ?1
        ORDER BY generated_at DESC, id DESC
        LIMIT 1
        "#,
        COLUMNS
    ))?;
    let mut rows = stmt.query([topic_id])?;
    match rows.next()? {
        Some(row) => Ok(Some(decode_row(row)?)),
        None => Ok(None),
    }
}

pub fn count_for_topic(conn: &Connection, topic_id: i64) -> Result<i64> {
    let count: i64 = conn.query_row(
        "SELECT COUNT(*) FROM summaries WHERE topic_id = ?1",
        [topic_id],
        |row| row.get(0),
    )?;
    Ok(count)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Store;
    use crate::queries::topic;
    use chrono::Duration;

    #[test]
    fn test_latest_wins_and_history_is_kept() -> Result<()> {
        let store = Store::open_in_memory()?;
        let topic_id = topic::insert(
            &store.conn(),
            &topic::NewTopic {
                title_key: "t".into(),
                first_seen: Utc::now(),
                last_active: Utc::now(),
                intensity_total: 1,
                current_heat_normalized: None,
            },
        )?;

        let t0 = Utc::now();
        insert(
            &store.conn(),
            topic_id,
            "first",
            SummaryMethod::Placeholder,
            t0,
            "system",
            "",
        )?;
        insert(
            &store.conn(),
            topic_id,
            "second",
            SummaryMethod::Full,
            t0 + Duration::minutes(5),
            "openai_compatible",
            "qwen3-32b",
        )?;

        let latest = latest_for_topic(&store.conn(), topic_id)?.unwrap();
        assert_eq!(latest.content, "second");
        assert_eq!(latest.method, SummaryMethod::Full);
        assert_eq!(count_for_topic(&store.conn(), topic_id)?, 2);
        Ok(())
    }
}
