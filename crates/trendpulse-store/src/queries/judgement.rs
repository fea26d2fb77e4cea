use chrono::{DateTime, Utc};
use rusqlite::{Connection, params};
use trendpulse_types::{Judgement, JudgementKind};

use super::{parse_ts, ts};
use crate::{Error, Result};

/// Insert payload for one LLM call record.
#[derive(Debug, Clone)]
pub struct NewJudgement {
    pub kind: JudgementKind,
    pub status: String,
    pub request: serde_json::Value,
    pub response: Option<serde_json::Value>,
    pub error_message: Option<String>,
    pub latency_ms: Option<i64>,
    pub tokens_prompt: Option<i64>,
    pub tokens_completion: Option<i64>,
    pub provider: String,
    pub model: String,
    pub created_at: DateTime<Utc>,
}

impl NewJudgement {
    pub fn success(
        kind: JudgementKind,
        request: serde_json::Value,
        response: serde_json::Value,
        provider: &str,
        model: &str,
    ) -> Self {
        Self {
            kind,
            status: "success".to_string(),
            request,
            response: Some(response),
            error_message: None,
            latency_ms: None,
            tokens_prompt: None,
            tokens_completion: None,
            provider: provider.to_string(),
            model: model.to_string(),
            created_at: Utc::now(),
        }
    }

    pub fn failure(
        kind: JudgementKind,
        request: serde_json::Value,
        error: &str,
        provider: &str,
        model: &str,
    ) -> Self {
        Self {
            kind,
            status: "failed".to_string(),
            request,
            response: None,
            error_message: Some(error.to_string()),
            latency_ms: None,
            tokens_prompt: None,
            tokens_completion: None,
            provider: provider.to_string(),
            model: model.to_string(),
            created_at: Utc::now(),
        }
    }

    pub fn with_usage(mut self, prompt: i64, completion: i64) -> Self {
        self.tokens_prompt = Some(prompt);
        self.tokens_completion = Some(completion);
        self
    }

    pub fn with_latency(mut self, latency_ms: i64) -> Self {
        self.latency_ms = Some(latency_ms);
        self
    }
}

pub fn insert(conn: &Connection, judgement: &NewJudgement) -> Result<i64> {
    conn.execute(
        r#"
        INSERT INTO judgements
            (kind, status, request, response, error_message, latency_ms,
             tokens_prompt, tokens_completion, provider, model, created_at)
        VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)
        "#,
        params![
            judgement.kind.as_str(),
            &judgement.status,
            serde_json::to_string(&judgement.request)?,
            judgement
                .response
                .as_ref()
                .map(serde_json::to_string)
                .transpose()?,
            &judgement.error_message,
            judgement.latency_ms,
            judgement.tokens_prompt,
            judgement.tokens_completion,
            &judgement.provider,
            &judgement.model,
            ts(&judgement.created_at),
        ],
    )?;
    Ok(conn.last_insert_rowid())
}

pub fn count_by_kind(conn: &Connection, kind: JudgementKind) -> Result<i64> {
    let count: i64 = conn.query_row(
        "SELECT COUNT(*) FROM judgements WHERE kind = ?1",
        [kind.as_str()],
        |row| row.get(0),
    )?;
    Ok(count)
}

/// Newest calls first; the ops view into what the models were actually asked
/// and what they answered.
pub fn list_recent(conn: &Connection, limit: usize) -> Result<Vec<Judgement>> {
    let mut stmt = conn.prepare(
        r#"
        SELECT id, kind, status, request, response, error_message, latency_ms,
               tokens_prompt, tokens_completion, provider, model, created_at
        FROM judgements
        ORDER BY created_at DESC, id DESC
        LIMIT ?1
        "#,
    )?;
    let mut rows = stmt.query([limit as i64])?;
    let mut all = Vec::new();
    while let Some(row) = rows.next()? {
        let request_raw: String = row.get(3).map_err(Error::from)?;
        let response_raw: Option<String> = row.get(4).map_err(Error::from)?;
        let created_raw: String = row.get(11).map_err(Error::from)?;
        all.push(Judgement {
            id: row.get(0).map_err(Error::from)?,
            kind: row.get(1).map_err(Error::from)?,
            status: row.get(2).map_err(Error::from)?,
            request: serde_json::from_str(&request_raw)?,
            response: response_raw.map(|raw| serde_json::from_str(&raw)).transpose()?,
            error_message: row.get(5).map_err(Error::from)?,
            latency_ms: row.get(6).map_err(Error::from)?,
            tokens_prompt: row.get(7).map_err(Error::from)?,
            tokens_completion: row.get(8).map_err(Error::from)?,
            provider: row.get(9).map_err(Error::from)?,
            model: row.get(10).map_err(Error::from)?,
            created_at: parse_ts(&created_raw)?,
        });
    }
    Ok(all)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Store;

    #[test]
    fn test_insert_and_count() -> Result<()> {
        let store = Store::open_in_memory()?;

        insert(
            &store.conn(),
            &NewJudgement::success(
                JudgementKind::PeriodMerge,
                serde_json::json!({"items": [1, 2]}),
                serde_json::json!({"is_same_event": true, "confidence": 0.9}),
                "openai_compatible",
                "qwen3-32b",
            )
            .with_usage(850, 120),
        )?;
        insert(
            &store.conn(),
            &NewJudgement::failure(
                JudgementKind::Relation,
                serde_json::json!({"item_id": 3}),
                "timeout after 60s",
                "openai_compatible",
                "qwen3-32b",
            ),
        )?;

        assert_eq!(count_by_kind(&store.conn(), JudgementKind::PeriodMerge)?, 1);
        assert_eq!(count_by_kind(&store.conn(), JudgementKind::Relation)?, 1);
        assert_eq!(count_by_kind(&store.conn(), JudgementKind::Classify)?, 0);

        let recent = list_recent(&store.conn(), 10)?;
        assert_eq!(recent.len(), 2);
        assert_eq!(recent[0].kind, "relation");
        assert_eq!(recent[0].status, "failed");
        assert_eq!(
            recent[0].error_message.as_deref(),
            Some("timeout after 60s")
        );
        assert_eq!(recent[1].tokens_prompt, Some(850));
        assert_eq!(recent[1].response.as_ref().unwrap()["confidence"], 0.9);
        Ok(())
    }
}
