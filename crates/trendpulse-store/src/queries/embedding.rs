use chrono::{DateTime, Utc};
use rusqlite::{Connection, Row, params};
use trendpulse_types::{EmbeddingRecord, ObjectType};

use super::ts;
use crate::{Error, Result};

fn decode_row(row: &Row<'_>) -> Result<EmbeddingRecord> {
    let object_type_raw: String = row.get(1).map_err(Error::from)?;
    let vector_raw: String = row.get(5).map_err(Error::from)?;
    Ok(EmbeddingRecord {
        id: row.get(0).map_err(Error::from)?,
        object_type: ObjectType::parse(&object_type_raw)?,
        object_id: row.get(2).map_err(Error::from)?,
        provider: row.get(3).map_err(Error::from)?,
        model: row.get(4).map_err(Error::from)?,
        vector: serde_json::from_str(&vector_raw)?,
    })
}

pub fn insert(
    conn: &Connection,
    object_type: ObjectType,
    object_id: i64,
    provider: &str,
    model: &str,
    vector: &[f32],
    created_at: DateTime<Utc>,
) -> Result<i64> {
    let vector_json = serde_json::to_string(vector)?;
    conn.execute(
        r#"
        INSERT INTO embeddings (object_type, object_id, provider, model, vector, created_at)
        VALUES (?1, ?2, ?3, ?4, ?5, ?6)
        "#,
        params![
            object_type.as_str(),
            object_id,
            provider,
            model,
            vector_json,
            ts(&created_at)
        ],
    )?;
    Ok(conn.last_insert_rowid())
}

/// The newest embedding for an object. Re-embedding writes a new row; readers
/// always want the latest.
pub fn latest_for_object(
    conn: &Connection,
    object_type: ObjectType,
    object_id: i64,
) -> Result<Option<EmbeddingRecord>> {
    let mut stmt = conn.prepare(
        r#"
        SELECT id, object_type, object_id, provider, model, vector
        FROM embeddings
        WHERE object_type = ?1 AND object_id = ?2
        ORDER BY created_at DESC, id DESC
        LIMIT 1
        "#,
    )?;
    let mut rows = stmt.query(params![object_type.as_str(), object_id])?;
    match rows.next()? {
        Some(row) => Ok(Some(decode_row(row)?)),
        None => Ok(None),
    }
}

pub fn exists_for_object(
    conn: &Connection,
    object_type: ObjectType,
    object_id: i64,
) -> Result<bool> {
    let count: i64 = conn.query_row(
        "SELECT COUNT(*) FROM embeddings WHERE object_type = ?1 AND object_id = ?2",
        params![object_type.as_str(), object_id],
        |row| row.get(0),
    )?;
    Ok(count > 0)
}
