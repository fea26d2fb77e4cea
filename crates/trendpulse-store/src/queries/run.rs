use rusqlite::{Connection, Row, params};
use trendpulse_types::{IngestRun, PipelineRun, RunStatus};

use super::{opt_ts, parse_opt_ts, parse_ts, ts};
use crate::{Error, Result};

fn decode_pipeline_row(row: &Row<'_>) -> Result<PipelineRun> {
    let status_raw: String = row.get(2).map_err(Error::from)?;
    let started_raw: String = row.get(3).map_err(Error::from)?;
    let ended_raw: Option<String> = row.get(4).map_err(Error::from)?;
    let results_raw: Option<String> = row.get(10).map_err(Error::from)?;
    Ok(PipelineRun {
        run_id: row.get(0).map_err(Error::from)?,
        stage: row.get(1).map_err(Error::from)?,
        status: RunStatus::parse(&status_raw)?,
        started_at: parse_ts(&started_raw)?,
        ended_at: parse_opt_ts(ended_raw)?,
        duration_ms: row.get(5).map_err(Error::from)?,
        input_count: row.get(6).map_err(Error::from)?,
        output_count: row.get(7).map_err(Error::from)?,
        success_count: row.get(8).map_err(Error::from)?,
        failed_count: row.get(9).map_err(Error::from)?,
        results: results_raw.map(|raw| serde_json::from_str(&raw)).transpose()?,
        error_summary: row.get(11).map_err(Error::from)?,
    })
}

/// Write the run row at stage start, or replace it wholesale on
/// finalization. The run_id is the natural key for both.
pub fn upsert_pipeline_run(conn: &Connection, run: &PipelineRun) -> Result<()> {
    let results_json = run.results.as_ref().map(serde_json::to_string).transpose()?;
    conn.execute(
        r#"
        INSERT INTO pipeline_runs
            (run_id, stage, status, started_at, ended_at, duration_ms,
             input_count, output_count, success_count, failed_count,
             results, error_summary)
        VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)
        ON CONFLICT(run_id) DO UPDATE SET
            status = ?3,
            ended_at = ?5,
            duration_ms = ?6,
            input_count = ?7,
            output_count = ?8,
            success_count = ?9,
            failed_count = ?10,
            results = ?11,
            error_summary = ?12
        "#,
        params![
            &run.run_id,
            &run.stage,
            run.status.as_str(),
            ts(&run.started_at),
            opt_ts(&run.ended_at),
            run.duration_ms,
            run.input_count,
            run.output_count,
            run.success_count,
            run.failed_count,
            results_json,
            &run.error_summary,
        ],
    )?;
    Ok(())
}

pub fn get_pipeline_run(conn: &Connection, run_id: &str) -> Result<Option<PipelineRun>> {
    let mut stmt = conn.prepare(
        r#"
        SELECT run_id, stage, status, started_at, ended_at, duration_ms,
               input_count, output_count, success_count, failed_count,
               results, error_summary
        FROM pipeline_runs
        WHERE run_id = ?1
        "#,
    )?;
    let mut rows = stmt.query([run_id])?;
    match rows.next()? {
        Some(row) => Ok(Some(decode_pipeline_row(row)?)),
        None => Ok(None),
    }
}

pub fn list_pipeline_runs(conn: &Connection, stage: &str, limit: usize) -> Result<Vec<PipelineRun>> {
    let mut stmt = conn.prepare(
        r#"
        SELECT run_id, stage, status, started_at, ended_at, duration_ms,
               input_count, output_count, success_count, failed_count,
               results, error_summary
        FROM pipeline_runs
        WHERE stage = ?1
        ORDER BY started_at DESC
        LIMIT ?2
        "#,
    )?;
    let mut rows = stmt.query(params![stage, limit as i64])?;
    let mut runs = Vec::new();
    while let Some(row) = rows.next()? {
        runs.push(decode_pipeline_row(row)?);
    }
    Ok(runs)
}

pub fn upsert_ingest_run(conn: &Connection, run: &IngestRun) -> Result<()> {
    let results_json = run
        .platform_results
        .as_ref()
        .map(serde_json::to_string)
        .transpose()?;
    conn.execute(
        r#"
        INSERT INTO ingest_runs
            (run_id, status, started_at, ended_at, duration_ms,
             total_platforms, success_platforms, failed_platforms,
             total_items, success_items, failed_items,
             platform_results, error_summary)
        VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)
        ON CONFLICT(run_id) DO UPDATE SET
            status = ?2,
            ended_at = ?4,
            duration_ms = ?5,
            total_platforms = ?6,
            success_platforms = ?7,
            failed_platforms = ?8,
            total_items = ?9,
            success_items = ?10,
            failed_items = ?11,
            platform_results = ?12,
            error_summary = ?13
        "#,
        params![
            &run.run_id,
            run.status.as_str(),
            ts(&run.started_at),
            opt_ts(&run.ended_at),
            run.duration_ms,
            run.total_platforms,
            run.success_platforms,
            run.failed_platforms,
            run.total_items,
            run.success_items,
            run.failed_items,
            results_json,
            &run.error_summary,
        ],
    )?;
    Ok(())
}

pub fn get_ingest_run(conn: &Connection, run_id: &str) -> Result<Option<IngestRun>> {
    let mut stmt = conn.prepare(
        r#"
        SELECT run_id, status, started_at, ended_at, duration_ms,
               total_platforms, success_platforms, failed_platforms,
               total_items, success_items, failed_items,
               platform_results, error_summary
        FROM ingest_runs
        WHERE run_id = ?1
        "#,
    )?;
    let mut rows = stmt.query([run_id])?;
    match rows.next()? {
        Some(row) => {
            let status_raw: String = row.get(1).map_err(Error::from)?;
            let started_raw: String = row.get(2).map_err(Error::from)?;
            let ended_raw: Option<String> = row.get(3).map_err(Error::from)?;
            let results_raw: Option<String> = row.get(11).map_err(Error::from)?;
            Ok(Some(IngestRun {
                run_id: row.get(0).map_err(Error::from)?,
                status: RunStatus::parse(&status_raw)?,
                started_at: parse_ts(&started_raw)?,
                ended_at: parse_opt_ts(ended_raw)?,
                duration_ms: row.get(4).map_err(Error::from)?,
                total_platforms: row.get(5).map_err(Error::from)?,
                success_platforms: row.get(6).map_err(Error::from)?,
                failed_platforms: row.get(7).map_err(Error::from)?,
                total_items: row.get(8).map_err(Error::from)?,
                success_items: row.get(9).map_err(Error::from)?,
                failed_items: row.get(10).map_err(Error::from)?,
                platform_results: results_raw
                    .map(|raw| serde_json::from_str(&raw))
                    .transpose()?,
                error_summary: row.get(12).map_err(Error::from)?,
            }))
        }
        None => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Store;
    use trendpulse_types::Stage;

    #[test]
    fn test_pipeline_run_lifecycle() -> Result<()> {
        let store = Store::open_in_memory()?;
        let mut run = PipelineRun::start(Stage::PeriodMerge);
        upsert_pipeline_run(&store.conn(), &run)?;

        let loaded = get_pipeline_run(&store.conn(), &run.run_id)?.unwrap();
        assert_eq!(loaded.status, RunStatus::Running);

        run.input_count = 12;
        run.output_count = 9;
        run.results = Some(serde_json::json!({"kept_items": 9, "dropped_items": 3}));
        run.finish(RunStatus::Success);
        upsert_pipeline_run(&store.conn(), &run)?;

        let loaded = get_pipeline_run(&store.conn(), &run.run_id)?.unwrap();
        assert_eq!(loaded.status, RunStatus::Success);
        assert_eq!(loaded.input_count, 12);
        assert_eq!(loaded.results.unwrap()["kept_items"], 9);

        let listed = list_pipeline_runs(&store.conn(), Stage::PeriodMerge.as_str(), 10)?;
        assert_eq!(listed.len(), 1);
        Ok(())
    }

    #[test]
    fn test_ingest_run_round_trip() -> Result<()> {
        let store = Store::open_in_memory()?;
        let mut run = IngestRun::start(7);
        run.total_items = 100;
        run.success_items = 95;
        run.failed_items = 5;
        run.platform_results = Some(serde_json::json!([{"platform": "weibo", "total": 30}]));
        run.finish(RunStatus::Success);
        upsert_ingest_run(&store.conn(), &run)?;

        let loaded = get_ingest_run(&store.conn(), &run.run_id)?.unwrap();
        assert_eq!(loaded.total_platforms, 7);
        assert_eq!(loaded.success_items, 95);
        assert_eq!(loaded.status, RunStatus::Success);
        Ok(())
    }
}
