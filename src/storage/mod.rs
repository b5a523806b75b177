//! SQLite storage layer -- schema and run history.

pub mod schema;

use std::path::Path;

use anyhow::Result;
use r2d2::Pool as R2D2Pool;
use r2d2_sqlite::SqliteConnectionManager;
use serde::Serialize;

use crate::batch::BatchSummary;
use crate::experiment::RunResult;

/// Connection Pool type
pub type Pool = R2D2Pool<SqliteConnectionManager>;

/// Open (or create) the SQLite database and return a connection pool.
pub fn open_pool(path: &Path) -> Result<Pool> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)?;
    }

    let manager = SqliteConnectionManager::file(path).with_init(|c| {
        c.execute_batch(
            "PRAGMA journal_mode = WAL;
                 PRAGMA synchronous = NORMAL;
                 PRAGMA temp_store = MEMORY;
                 PRAGMA foreign_keys = ON;
                 PRAGMA busy_timeout = 5000;",
        )
    });

    let pool = R2D2Pool::new(manager)?;

    // Create tables on a single connection
    let conn = pool.get()?;
    schema::init(&conn)?;

    Ok(pool)
}

/// Record one run result. Returns the row id.
pub fn save_run(pool: &Pool, batch_id: Option<&str>, r: &RunResult) -> Result<i64> {
    let conn = pool.get()?;
    let d = r.descriptor.as_ref();

    conn.execute(
        "INSERT INTO runs (batch_id, name, status, final_state, interface, duration_secs, parallel,
                           transfer_size, throughput_mbps, retransmits, counter_samples, flow_records,
                           truncated_flows, failure_stage, failure_kind, failure_message,
                           started_at, finished_at, elapsed_secs, result_path)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18, ?19, ?20)",
        rusqlite::params![
            batch_id,
            r.name,
            r.status.as_str(),
            r.final_state.to_string(),
            d.map(|d| d.interface.clone()),
            d.map(|d| d.duration.as_secs() as i64),
            d.map(|d| d.parallel),
            d.and_then(|d| d.transfer_size.clone()),
            r.load.as_ref().map(|l| l.throughput_mbps()),
            r.load.as_ref().and_then(|l| l.retransmits).map(|v| v as i64),
            r.counters.records as i64,
            r.flows.records as i64,
            r.truncated_flows as i64,
            r.failure.as_ref().map(|f| format!("{:?}", f.stage).to_lowercase()),
            r.failure.as_ref().map(|f| f.kind.clone()),
            r.failure.as_ref().map(|f| f.message.clone()),
            r.started_at.to_rfc3339(),
            r.finished_at.to_rfc3339(),
            r.elapsed_secs,
            r.artifacts.result.as_ref().map(|p| p.display().to_string()),
        ],
    )?;

    Ok(conn.last_insert_rowid())
}

/// Record the batch totals.
pub fn save_batch(pool: &Pool, s: &BatchSummary) -> Result<()> {
    let conn = pool.get()?;
    conn.execute(
        "INSERT OR REPLACE INTO batches (id, input, output_dir, total, succeeded, failed, started_at, finished_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
        rusqlite::params![
            s.batch_id,
            s.input.display().to_string(),
            s.output_dir.display().to_string(),
            s.total as i64,
            s.succeeded as i64,
            s.failed as i64,
            s.started_at.to_rfc3339(),
            s.finished_at.to_rfc3339(),
        ],
    )?;
    Ok(())
}

/// One row of run history.
#[derive(Debug, Clone, Serialize)]
pub struct RunRow {
    pub id: i64,
    pub batch_id: Option<String>,
    pub name: String,
    pub status: String,
    pub interface: Option<String>,
    pub duration_secs: Option<i64>,
    pub parallel: Option<i64>,
    pub throughput_mbps: Option<f64>,
    pub failure: Option<String>,
    pub started_at: String,
    pub elapsed_secs: f64,
    pub result_path: Option<String>,
}

/// Most recent runs first.
pub fn list_runs(pool: &Pool, limit: usize) -> Result<Vec<RunRow>> {
    let conn = pool.get()?;
    let mut stmt = conn.prepare(
        "SELECT id, batch_id, name, status, interface, duration_secs, parallel, throughput_mbps,
                failure_message, started_at, elapsed_secs, result_path
         FROM runs ORDER BY started_at DESC, id DESC LIMIT ?1",
    )?;

    let rows = stmt
        .query_map([limit as i64], |row| {
            Ok(RunRow {
                id: row.get(0)?,
                batch_id: row.get(1)?,
                name: row.get(2)?,
                status: row.get(3)?,
                interface: row.get(4)?,
                duration_secs: row.get(5)?,
                parallel: row.get(6)?,
                throughput_mbps: row.get(7)?,
                failure: row.get(8)?,
                started_at: row.get(9)?,
                elapsed_secs: row.get(10)?,
                result_path: row.get(11)?,
            })
        })?
        .collect::<rusqlite::Result<Vec<_>>>()?;

    Ok(rows)
}
