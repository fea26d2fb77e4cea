use chrono::NaiveDate;
use rusqlite::{Connection, Row, params};
use trendpulse_types::{PeriodHeat, WindowSlot};

use super::{date_str, parse_date};
use crate::{Error, Result};

fn decode_row(row: &Row<'_>) -> Result<PeriodHeat> {
    let date_raw: String = row.get(2).map_err(Error::from)?;
    let slot_raw: String = row.get(3).map_err(Error::from)?;
    Ok(PeriodHeat {
        id: row.get(0).map_err(Error::from)?,
        topic_id: row.get(1).map_err(Error::from)?,
        date: parse_date(&date_raw)?,
        slot: WindowSlot::parse(&slot_raw)?,
        heat_normalized: row.get(4).map_err(Error::from)?,
        heat_percentage: row.get(5).map_err(Error::from)?,
        source_count: row.get(6).map_err(Error::from)?,
    })
}

/// Upsert the heat snapshot for one (topic, date, slot). Replay overwrites
/// heat and count; Stage 2 recomputes both from the full cluster, so the last
/// write for a tuple is the correct one.
pub fn upsert(
    conn: &Connection,
    topic_id: i64,
    date: NaiveDate,
    slot: WindowSlot,
    heat_normalized: f64,
    source_count: i64,
) -> Result<()> {
    conn.execute(
        r#"
        INSERT INTO topic_period_heat
            (topic_id, date, window_slot, heat_normalized, heat_percentage, source_count)
        VALUES (?1, ?2, ?3, ?4, ?5, ?6)
        ON CONFLICT(topic_id, date, window_slot) DO UPDATE SET
            heat_normalized = ?4,
            heat_percentage = ?5,
            source_count = ?6
        "#,
        params![
            topic_id,
            date_str(&date),
            slot.as_str(),
            heat_normalized,
            heat_normalized * 100.0,
            source_count
        ],
    )?;
    Ok(())
}

pub fn list_for_topic(conn: &Connection, topic_id: i64) -> Result<Vec<PeriodHeat>> {
    let mut stmt = conn.prepare(
        r#"
        SELECT id, topic_id, date, window_slot, heat_normalized, heat_percentage, source_count
        FROM topic_period_heat
        WHERE topic_id = ?1
        ORDER BY date, window_slot
        "#,
    )?;
    let mut rows = stmt.query([topic_id])?;
    let mut heats = Vec::new();
    while let Some(row) = rows.next()? {
        heats.push(decode_row(row)?);
    }
    Ok(heats)
}
