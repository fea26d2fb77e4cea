use chrono::{DateTime, Utc};
use rusqlite::{Connection, params};
use trendpulse_types::Category;

use super::{parse_ts, ts};
use crate::{Error, Result};

/// Per-category aggregate, recomputed daily over a rolling window.
#[derive(Debug, Clone, PartialEq)]
pub struct CategoryMetrics {
    pub category: Category,
    pub topic_count: i64,
    pub avg_duration_hours: f64,
    pub intensity_sum: i64,
    pub window_days: i64,
    pub computed_at: DateTime<Utc>,
}

/// Replace a category's aggregate row. The recompute job writes all three
/// categories every run, so stale rows never linger.
pub fn upsert(conn: &Connection, metrics: &CategoryMetrics) -> Result<()> {
    conn.execute(
        r#"
        INSERT INTO category_metrics
            (category, topic_count, avg_duration_hours, intensity_sum, window_days, computed_at)
        VALUES (?1, ?2, ?3, ?4, ?5, ?6)
        ON CONFLICT(category) DO UPDATE SET
            topic_count = ?2,
            avg_duration_hours = ?3,
            intensity_sum = ?4,
            window_days = ?5,
            computed_at = ?6
        "#,
        params![
            metrics.category.as_str(),
            metrics.topic_count,
            metrics.avg_duration_hours,
            metrics.intensity_sum,
            metrics.window_days,
            ts(&metrics.computed_at),
        ],
    )?;
    Ok(())
}

pub fn list(conn: &Connection) -> Result<Vec<CategoryMetrics>> {
    let mut stmt = conn.prepare(
        r#"
        SELECT category, topic_count, avg_duration_hours, intensity_sum, window_days, computed_at
        FROM category_metrics
        ORDER BY category
        "#,
    )?;
    let mut rows = stmt.query([])?;
    let mut all = Vec::new();
    while let Some(row) = rows.next()? {
        let category_raw: String = row.get(0).map_err(Error::from)?;
        let computed_raw: String = row.get(5).map_err(Error::from)?;
        all.push(CategoryMetrics {
            category: Category::parse(&category_raw)?,
            topic_count: row.get(1).map_err(Error::from)?,
            avg_duration_hours: row.get(2).map_err(Error::from)?,
            intensity_sum: row.get(3).map_err(Error::from)?,
            window_days: row.get(4).map_err(Error::from)?,
            computed_at: parse_ts(&computed_raw)?,
        });
    }
    Ok(all)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Store;

    #[test]
    fn test_upsert_replaces() -> Result<()> {
        let store = Store::open_in_memory()?;
        let mut m = CategoryMetrics {
            category: Category::Entertainment,
            topic_count: 10,
            avg_duration_hours: 6.5,
            intensity_sum: 80,
            window_days: 365,
            computed_at: Utc::now(),
        };
        upsert(&store.conn(), &m)?;
        m.topic_count = 12;
        upsert(&store.conn(), &m)?;

        let all = list(&store.conn())?;
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].topic_count, 12);
        Ok(())
    }
}
