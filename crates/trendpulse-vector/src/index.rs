use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use rusqlite::{Connection, OptionalExtension, params};

use crate::{Error, Result};

// NOTE: Index design
//
// The index is a derived copy of the relational embeddings table: losing it
// costs a rebuild, never data. Search is a brute-force cosine scan over the
// metadata-filtered candidate set, which is the right trade at this scale --
// the long-lived entries are one vector per topic (its latest summary), not
// one per crawled item, so the scan set stays small by construction.

/// Metadata attached to an entry; values are compared by equality when
/// filtering.
pub type Metadata = BTreeMap<String, serde_json::Value>;

/// One search hit, distance ascending (distance = 1 - cosine).
#[derive(Debug, Clone)]
pub struct SearchHit {
    pub id: String,
    pub distance: f32,
    pub metadata: Metadata,
}

/// Keyed vector collection persisted in its own SQLite database. The
/// connection sits behind a mutex so async stages can hold the index across
/// await points.
pub struct VectorIndex {
    conn: Mutex<Connection>,
    path: Option<PathBuf>,
}

impl VectorIndex {
    pub fn open(db_path: &Path) -> Result<Self> {
        if let Some(parent) = db_path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let conn = Connection::open(db_path)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "busy_timeout", 5000)?;
        init_schema(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
            path: Some(db_path.to_path_buf()),
        })
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        init_schema(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
            path: None,
        })
    }

    /// A fresh connection to the same index file.
    pub fn reopen(&self) -> Result<Self> {
        match &self.path {
            Some(path) => Self::open(path),
            None => Err(Error::Input(
                "cannot reopen an in-memory vector index".to_string(),
            )),
        }
    }

    /// Insert or replace entries by id. Idempotent: upserting the same id
    /// twice leaves one entry.
    pub fn upsert(
        &self,
        ids: &[String],
        vectors: &[Vec<f32>],
        metadatas: &[Metadata],
        documents: Option<&[String]>,
    ) -> Result<()> {
        if ids.len() != vectors.len() || ids.len() != metadatas.len() {
            return Err(Error::Input(format!(
                "mismatched upsert lengths: {} ids, {} vectors, {} metadatas",
                ids.len(),
                vectors.len(),
                metadatas.len()
            )));
        }
        if let Some(docs) = documents {
            if docs.len() != ids.len() {
                return Err(Error::Input(format!(
                    "mismatched upsert lengths: {} ids, {} documents",
                    ids.len(),
                    docs.len()
                )));
            }
        }

        let conn = self.lock();
        for (i, id) in ids.iter().enumerate() {
            let vector_json = serde_json::to_string(&vectors[i])?;
            let metadata_json = serde_json::to_string(&metadatas[i])?;
            let document = documents.map(|docs| docs[i].as_str());
            conn.execute(
                r#"
                INSERT INTO entries (id, vector, metadata, document)
                VALUES (?1, ?2, ?3, ?4)
                ON CONFLICT(id) DO UPDATE SET
                    vector = ?2,
                    metadata = ?3,
                    document = COALESCE(?4, document)
                "#,
                params![id, vector_json, metadata_json, document],
            )?;
        }
        Ok(())
    }

    /// Top-K nearest entries by cosine distance, optionally restricted to
    /// entries whose metadata matches every `(key, value)` pair in `filter`.
    pub fn search(
        &self,
        query: &[f32],
        top_k: usize,
        filter: Option<&Metadata>,
    ) -> Result<Vec<SearchHit>> {
        if query.is_empty() {
            return Err(Error::Input("empty query vector".to_string()));
        }

        let conn = self.lock();
        let mut stmt = conn.prepare("SELECT id, vector, metadata FROM entries")?;
        let mut rows = stmt.query([])?;

        let mut hits: Vec<SearchHit> = Vec::new();
        while let Some(row) = rows.next()? {
            let id: String = row.get(0)?;
            let vector_raw: String = row.get(1)?;
            let metadata_raw: String = row.get(2)?;

            let metadata: Metadata = serde_json::from_str(&metadata_raw)?;
            if let Some(filter) = filter {
                if !matches_filter(&metadata, filter) {
                    continue;
                }
            }

            let vector: Vec<f32> = serde_json::from_str(&vector_raw)?;
            if vector.len() != query.len() {
                // Dimension drift (e.g. model change); such entries can never
                // match the query space, skip them.
                continue;
            }

            let distance = 1.0 - cosine_similarity(query, &vector);
            hits.push(SearchHit {
                id,
                distance,
                metadata,
            });
        }

        hits.sort_by(|a, b| a.distance.total_cmp(&b.distance));
        hits.truncate(top_k);
        Ok(hits)
    }

    pub fn delete_by_ids(&self, ids: &[String]) -> Result<()> {
        let conn = self.lock();
        for id in ids {
            conn.execute("DELETE FROM entries WHERE id = ?1", [id])?;
        }
        Ok(())
    }

    pub fn get(&self, id: &str) -> Result<Option<Vec<f32>>> {
        let raw: Option<String> = self
            .lock()
            .query_row("SELECT vector FROM entries WHERE id = ?1", [id], |row| {
                row.get(0)
            })
            .optional()?;
        raw.map(|v| serde_json::from_str(&v).map_err(Error::from))
            .transpose()
    }

    pub fn count(&self) -> Result<i64> {
        let count: i64 = self
            .lock()
            .query_row("SELECT COUNT(*) FROM entries", [], |row| row.get(0))?;
        Ok(count)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Connection> {
        self.conn.lock().expect("vector index connection poisoned")
    }
}

fn init_schema(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS entries (
            id TEXT PRIMARY KEY,
            vector TEXT NOT NULL,
            metadata TEXT NOT NULL,
            document TEXT
        );
        "#,
    )?;
    Ok(())
}

fn matches_filter(metadata: &Metadata, filter: &Metadata) -> bool {
    filter
        .iter()
        .all(|(key, value)| metadata.get(key) == Some(value))
}

/// Cosine similarity; 0.0 when either vector has zero norm.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    let mut dot = 0.0f32;
    let mut norm_a = 0.0f32;
    let mut norm_b = 0.0f32;
    for (x, y) in a.iter().zip(b.iter()) {
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }
    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    dot / (norm_a.sqrt() * norm_b.sqrt())
}
