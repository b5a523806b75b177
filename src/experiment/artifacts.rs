//! Per-run artifact writers.
//!
//! Files produced in a run directory:
//!
//! | file | content |
//! |---|---|
//! | `counters.csv` | one row per counter sample |
//! | `flows.csv` | one row per flow record |
//! | `load.json` | raw load-generator output |
//! | `result.json` | the run result |
//! | `run.log` | human-readable lifecycle log |

use std::fs::File;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, SecondsFormat, Utc};
use csv::Writer;
use serde::Serialize;

use super::result::{RunFailure, RunResult};
use crate::monitor::{CounterSample, FlowRecord};

pub const COUNTERS_FILE: &str = "counters.csv";
pub const FLOWS_FILE: &str = "flows.csv";
pub const LOAD_FILE: &str = "load.json";
pub const RESULT_FILE: &str = "result.json";
pub const LOG_FILE: &str = "run.log";

pub(crate) fn ts(t: &DateTime<Utc>) -> String {
    t.to_rfc3339_opts(SecondsFormat::Millis, true)
}

pub fn ensure_dir(dir: &Path) -> Result<()> {
    std::fs::create_dir_all(dir)
        .with_context(|| format!("failed to create run directory {}", dir.display()))
}

/// Write counter samples as CSV.
pub fn write_counters(path: &Path, samples: &[CounterSample]) -> Result<()> {
    let file = File::create(path).with_context(|| format!("failed to create {}", path.display()))?;
    let mut wtr = Writer::from_writer(file);

    wtr.write_record([
        "timestamp",
        "elapsed_ms",
        "bytes_sent",
        "bytes_recv",
        "packets_sent",
        "packets_recv",
        "errin",
        "errout",
        "dropin",
        "dropout",
    ])?;

    for s in samples {
        let c = &s.counters;
        wtr.write_record([
            ts(&s.timestamp),
            s.elapsed_ms.to_string(),
            c.bytes_sent.to_string(),
            c.bytes_recv.to_string(),
            c.packets_sent.to_string(),
            c.packets_recv.to_string(),
            c.errin.to_string(),
            c.errout.to_string(),
            c.dropin.to_string(),
            c.dropout.to_string(),
        ])?;
    }

    wtr.flush()?;
    Ok(())
}

/// Write flow records as CSV. Open-at-stop flows have empty `end` and
/// `duration_secs` columns.
pub fn write_flows(path: &Path, records: &[FlowRecord]) -> Result<()> {
    let file = File::create(path).with_context(|| format!("failed to create {}", path.display()))?;
    let mut wtr = Writer::from_writer(file);

    wtr.write_record([
        "protocol",
        "local_addr",
        "local_port",
        "remote_addr",
        "remote_port",
        "start",
        "end",
        "duration_secs",
        "truncated",
        "preexisting",
    ])?;

    for r in records {
        wtr.write_record([
            r.key.protocol.to_string(),
            r.key.local.addr.clone(),
            r.key.local.port.to_string(),
            r.key.remote.addr.clone(),
            r.key.remote.port.to_string(),
            ts(&r.start),
            r.end.as_ref().map(ts).unwrap_or_default(),
            r.duration_secs.map(|d| format!("{:.3}", d)).unwrap_or_default(),
            r.truncated.to_string(),
            r.preexisting.to_string(),
        ])?;
    }

    wtr.flush()?;
    Ok(())
}

pub fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let body = serde_json::to_string_pretty(value)?;
    std::fs::write(path, body + "\n").with_context(|| format!("failed to write {}", path.display()))
}

pub fn write_text(path: &Path, text: &str) -> Result<()> {
    std::fs::write(path, text).with_context(|| format!("failed to write {}", path.display()))
}

/// Human-readable lifecycle log, buffered for the life of one run and
/// written once at the end.
#[derive(Debug, Default)]
pub struct RunLog {
    lines: Vec<String>,
}

impl RunLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, at: DateTime<Utc>, message: impl AsRef<str>) {
        self.lines.push(format!("{} {}", ts(&at), message.as_ref()));
    }

    pub fn write(&self, path: &Path) -> Result<()> {
        let mut body = self.lines.join("\n");
        body.push('\n');
        write_text(path, &body)
    }
}

/// Failed result for a descriptor that never reached the orchestrator. Its
/// result and log are written best-effort into `dir`.
pub fn record_rejected(name: &str, dir: PathBuf, failure: RunFailure) -> RunResult {
    let mut result = RunResult::rejected(name, dir.clone(), failure);
    if ensure_dir(&dir).is_err() {
        return result;
    }

    let mut log = RunLog::new();
    log.record(result.started_at, format!("run '{}' not started", name));
    if let Some(f) = &result.failure {
        log.record(result.finished_at, format!("rejected: {}", f));
    }
    if log.write(&dir.join(LOG_FILE)).is_ok() {
        result.artifacts.log = Some(dir.join(LOG_FILE));
    }
    result.artifacts.result = Some(dir.join(RESULT_FILE));
    if write_json(&dir.join(RESULT_FILE), &result).is_err() {
        result.artifacts.result = None;
    }
    result
}
