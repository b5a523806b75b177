//! Database schema.

use anyhow::Result;
use rusqlite::Connection;

/// Create the results tables if they do not exist.
pub fn init(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS batches (
            id TEXT PRIMARY KEY,
            input TEXT NOT NULL,
            output_dir TEXT NOT NULL,
            total INTEGER NOT NULL,
            succeeded INTEGER NOT NULL,
            failed INTEGER NOT NULL,
            started_at TEXT NOT NULL,
            finished_at TEXT NOT NULL,
            created_at TEXT NOT NULL DEFAULT (datetime('now'))
        );

        CREATE TABLE IF NOT EXISTS runs (
            id INTEGER PRIMARY KEY,
            batch_id TEXT,
            name TEXT NOT NULL,
            status TEXT NOT NULL,
            final_state TEXT NOT NULL,
            interface TEXT,
            duration_secs INTEGER,
            parallel INTEGER,
            transfer_size TEXT,
            throughput_mbps REAL,
            retransmits INTEGER,
            counter_samples INTEGER NOT NULL DEFAULT 0,
            flow_records INTEGER NOT NULL DEFAULT 0,
            truncated_flows INTEGER NOT NULL DEFAULT 0,
            failure_stage TEXT,
            failure_kind TEXT,
            failure_message TEXT,
            started_at TEXT NOT NULL,
            finished_at TEXT NOT NULL,
            elapsed_secs REAL NOT NULL,
            result_path TEXT,
            created_at TEXT NOT NULL DEFAULT (datetime('now'))
        );

        CREATE INDEX IF NOT EXISTS idx_runs_started ON runs(started_at);
        CREATE INDEX IF NOT EXISTS idx_runs_batch ON runs(batch_id);",
    )?;

    Ok(())
}
