use chrono::{DateTime, Utc};
use rusqlite::{Connection, params};
use trendpulse_types::{SourceItem, TopicNode};

use super::{parse_ts, ts};
use crate::{Error, Result};

/// Attach one source item to a topic. Idempotent on (topic, item): a replayed
/// attachment is ignored rather than duplicated.
pub fn insert(
    conn: &Connection,
    topic_id: i64,
    source_item_id: i64,
    appended_at: DateTime<Utc>,
) -> Result<()> {
    conn.execute(
        r#"
        INSERT INTO topic_nodes (topic_id, source_item_id, appended_at)
        VALUES (?1, ?2, ?3)
        ON CONFLICT(topic_id, source_item_id) DO NOTHING
        "#,
        params![topic_id, source_item_id, ts(&appended_at)],
    )?;
    Ok(())
}

pub fn count_for_topic(conn: &Connection, topic_id: i64) -> Result<i64> {
    let count: i64 = conn.query_row(
        "SELECT COUNT(*) FROM topic_nodes WHERE topic_id = ?1",
        [topic_id],
        |row| row.get(0),
    )?;
    Ok(count)
}

pub fn count_for_item(conn: &Connection, source_item_id: i64) -> Result<i64> {
    let count: i64 = conn.query_row(
        "SELECT COUNT(*) FROM topic_nodes WHERE source_item_id = ?1",
        [source_item_id],
        |row| row.get(0),
    )?;
    Ok(count)
}

pub fn distinct_platforms(conn: &Connection, topic_id: i64) -> Result<Vec<String>> {
    let mut stmt = conn.prepare(
        r#"
        SELECT DISTINCT s.platform
        FROM topic_nodes n
        JOIN source_items s ON s.id = n.source_item_id
        WHERE n.topic_id = ?1
        ORDER BY s.platform
        "#,
    )?;
    let platforms = stmt
        .query_map([topic_id], |row| row.get(0))?
        .collect::<std::result::Result<Vec<String>, rusqlite::Error>>()?;
    Ok(platforms)
}

/// A node joined with its source item, the unit the summarizer and the
/// classifier consume.
#[derive(Debug, Clone)]
pub struct NodeWithItem {
    pub node: TopicNode,
    pub item: SourceItem,
}

/// All nodes of a topic with their items, oldest first. `limit` of `None`
/// returns everything.
pub fn list_with_items(
    conn: &Connection,
    topic_id: i64,
    newest_first: bool,
    limit: Option<usize>,
) -> Result<Vec<NodeWithItem>> {
    let order = if newest_first { "DESC" } else { "ASC" };
    let limit_clause = limit
        .map(|l| format!("LIMIT {}", l))
        .unwrap_or_default();

    let query = format!(
        r#"
        SELECT n.id, n.topic_id, n.source_item_id, n.appended_at,
               s.id, s.platform, s.title, s.summary, s.url, s.url_hash,
               s.dedup_key, s.published_at, s.fetched_at, s.interactions,
               s.raw_heat, s.normalized_heat, s."window", s.cluster_id,
               s.occurrence_count, s.status, s.embedding_id, s.run_id
        FROM topic_nodes n
        JOIN source_items s ON s.id = n.source_item_id
        WHERE n.topic_id = ?1
        ORDER BY n.appended_at {}, n.id {}
        {}
        "#,
        order, order, limit_clause
    );

    let mut stmt = conn.prepare(&query)?;
    let mut rows = stmt.query([topic_id])?;
    let mut nodes = Vec::new();
    while let Some(row) = rows.next()? {
        let appended_raw: String = row.get(3).map_err(Error::from)?;
        let published_raw: Option<String> = row.get(11).map_err(Error::from)?;
        let fetched_raw: String = row.get(12).map_err(Error::from)?;
        let interactions_raw: Option<String> = row.get(13).map_err(Error::from)?;
        let status_raw: String = row.get(19).map_err(Error::from)?;

        nodes.push(NodeWithItem {
            node: TopicNode {
                id: row.get(0).map_err(Error::from)?,
                topic_id: row.get(1).map_err(Error::from)?,
                source_item_id: row.get(2).map_err(Error::from)?,
                appended_at: parse_ts(&appended_raw)?,
            },
            item: SourceItem {
                id: row.get(4).map_err(Error::from)?,
                platform: row.get(5).map_err(Error::from)?,
                title: row.get(6).map_err(Error::from)?,
                summary: row.get(7).map_err(Error::from)?,
                url: row.get(8).map_err(Error::from)?,
                url_hash: row.get(9).map_err(Error::from)?,
                dedup_key: row.get(10).map_err(Error::from)?,
                published_at: published_raw.map(|v| parse_ts(&v)).transpose()?,
                fetched_at: parse_ts(&fetched_raw)?,
                interactions: interactions_raw
                    .map(|raw| serde_json::from_str(&raw))
                    .transpose()?,
                raw_heat: row.get(14).map_err(Error::from)?,
                normalized_heat: row.get(15).map_err(Error::from)?,
                window: row.get(16).map_err(Error::from)?,
                cluster_id: row.get(17).map_err(Error::from)?,
                occurrence_count: row.get(18).map_err(Error::from)?,
                status: trendpulse_types::MergeStatus::parse(&status_raw)?,
                embedding_id: row.get(20).map_err(Error::from)?,
                run_id: row.get(21).map_err(Error::from)?,
            },
        });
    }
    Ok(nodes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Store;
    use crate::queries::{item, topic};
    use chrono::Duration;
    use trendpulse_types::{Window, WindowSlot};

    fn seed(store: &Store) -> Result<(i64, i64)> {
        let w = Window::new(
            chrono::NaiveDate::from_ymd_opt(2025, 11, 7).unwrap(),
            WindowSlot::Am,
        );
        let item_id = item::insert(
            &store.conn(),
            &item::NewSourceItem {
                platform: "zhihu".into(),
                title: "t".into(),
                summary: None,
                url: "https://example.com/1".into(),
                url_hash: "h1".into(),
                dedup_key: "zhihu:h1:run1".into(),
                published_at: None,
                fetched_at: Utc::now(),
                interactions: None,
                raw_heat: None,
                window: w,
                run_id: None,
            },
        )?;
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
        Ok((topic_id, item_id))
    }

    #[test]
    fn test_insert_is_idempotent() -> Result<()> {
        let store = Store::open_in_memory()?;
        let (topic_id, item_id) = seed(&store)?;

        insert(&store.conn(), topic_id, item_id, Utc::now())?;
        insert(&store.conn(), topic_id, item_id, Utc::now() + Duration::seconds(5))?;

        assert_eq!(count_for_topic(&store.conn(), topic_id)?, 1);
        assert_eq!(count_for_item(&store.conn(), item_id)?, 1);
        Ok(())
    }

    #[test]
    fn test_list_with_items_joins_and_orders() -> Result<()> {
        let store = Store::open_in_memory()?;
        let (topic_id, item_id) = seed(&store)?;
        insert(&store.conn(), topic_id, item_id, Utc::now())?;

        let nodes = list_with_items(&store.conn(), topic_id, false, None)?;
        assert_eq!(nodes.len(), 1);
        assert_eq!(nodes[0].item.platform, "zhihu");
        assert_eq!(nodes[0].node.topic_id, topic_id);

        assert_eq!(distinct_platforms(&store.conn(), topic_id)?, vec!["zhihu"]);
        Ok(())
    }
}
