//! Batch runner.
//!
//! Runs every descriptor in a directory (or every row of a CSV plan) one
//! after another through the orchestrator, never concurrently: runs share
//! the interface under test. A failed or invalid descriptor becomes a failed
//! result and the batch moves on.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::experiment::artifacts;
use crate::experiment::descriptor::extension;
use crate::experiment::{
    DescriptorError, FailureStage, Orchestrator, RawDescriptor, RunDescriptor, RunFailure,
    RunResult, RunStatus,
};
use crate::experiment::result::RunArtifacts;
use crate::storage::{self, Pool};

pub const SUMMARY_JSON: &str = "summary.json";
pub const SUMMARY_CSV: &str = "summary.csv";

/// One descriptor found in the batch input, validated or not.
#[derive(Debug)]
pub struct BatchItem {
    pub label: String,
    /// Where this item's result and log go. Unique within a batch.
    pub dir: PathBuf,
    pub descriptor: Result<RunDescriptor, DescriptorError>,
}

impl BatchItem {
    fn new(label: String, descriptor: Result<RunDescriptor, DescriptorError>, output_dir: &Path) -> Self {
        let dir = match &descriptor {
            Ok(d) => d.output_dir.clone(),
            Err(_) => output_dir.join(&label),
        };
        Self { label, dir, descriptor }
    }
}

/// Per-run row of the batch summary.
#[derive(Debug, Clone, Serialize)]
pub struct BatchEntry {
    pub name: String,
    pub status: RunStatus,
    pub elapsed_secs: f64,
    pub throughput_mbps: Option<f64>,
    pub counter_samples: usize,
    pub flow_records: usize,
    pub truncated_flows: usize,
    pub failure: Option<String>,
    pub artifacts: RunArtifacts,
}

impl From<&RunResult> for BatchEntry {
    fn from(r: &RunResult) -> Self {
        Self {
            name: r.name.clone(),
            status: r.status,
            elapsed_secs: r.elapsed_secs,
            throughput_mbps: r.load.as_ref().map(|l| l.throughput_mbps()),
            counter_samples: r.counters.records,
            flow_records: r.flows.records,
            truncated_flows: r.truncated_flows,
            failure: r.failure.as_ref().map(|f| f.to_string()),
            artifacts: r.artifacts.clone(),
        }
    }
}

/// Outcome of one batch invocation. Written once, never mutated after.
#[derive(Debug, Clone, Serialize)]
pub struct BatchSummary {
    pub batch_id: String,
    pub input: PathBuf,
    pub output_dir: PathBuf,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub total: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub runs: Vec<BatchEntry>,
}

impl BatchSummary {
    pub fn all_succeeded(&self) -> bool {
        self.failed == 0
    }
}

pub struct BatchRunner {
    orchestrator: Orchestrator,
    cooldown: Duration,
    store: Option<Pool>,
}

impl BatchRunner {
    pub fn new(orchestrator: Orchestrator, cooldown: Duration) -> Self {
        Self {
            orchestrator,
            cooldown,
            store: None,
        }
    }

    /// Record every run and the batch itself in the results datastore.
    pub fn with_store(mut self, pool: Pool) -> Self {
        self.store = Some(pool);
        self
    }

    /// Process every descriptor under `input`, writing run directories and
    /// the summary files under `output_dir`.
    ///
    /// Errors only when the input cannot be enumerated or the summary cannot
    /// be written; run failures are reported in the summary.
    pub async fn run(&self, input: &Path, output_dir: &Path, cancel: &CancellationToken) -> Result<BatchSummary> {
        let items = discover(input, output_dir)?;
        if items.is_empty() {
            bail!("no run descriptors found in {}", input.display());
        }
        std::fs::create_dir_all(output_dir)
            .with_context(|| format!("failed to create batch output directory {}", output_dir.display()))?;

        let batch_id = uuid::Uuid::new_v4().to_string();
        let started_at = Utc::now();
        info!(batch = %batch_id, runs = items.len(), input = %input.display(), "batch started");

        let total = items.len();
        let mut entries = Vec::with_capacity(total);

        for (idx, item) in items.into_iter().enumerate() {
            let ran_load = item.descriptor.is_ok() && !cancel.is_cancelled();
            let result = match item.descriptor {
                Ok(d) if !cancel.is_cancelled() => {
                    info!(batch = %batch_id, run = %d.name, position = idx + 1, total, "starting run");
                    self.orchestrator.run(&d, cancel).await
                }
                Ok(d) => artifacts::record_rejected(
                    &d.name,
                    d.output_dir.clone(),
                    RunFailure::new(FailureStage::Startup, "cancelled", "batch cancelled before this run started"),
                ),
                Err(e) => {
                    warn!(batch = %batch_id, descriptor = %item.label, error = %e, "invalid run descriptor");
                    artifacts::record_rejected(
                        &item.label,
                        item.dir,
                        RunFailure::new(FailureStage::Descriptor, "invalid", e.to_string()),
                    )
                }
            };

            match &result.failure {
                None => info!(batch = %batch_id, run = %result.name, "run succeeded"),
                Some(f) => warn!(batch = %batch_id, run = %result.name, failure = %f, "run failed"),
            }

            if let Some(pool) = &self.store {
                if let Err(e) = storage::save_run(pool, Some(&batch_id), &result) {
                    warn!(run = %result.name, error = %e, "failed to record run in datastore");
                }
            }

            entries.push(BatchEntry::from(&result));

            let last = idx + 1 == total;
            if ran_load && !last && !self.cooldown.is_zero() {
                info!(cooldown_secs = self.cooldown.as_secs(), "cooling down before next run");
                tokio::select! {
                    _ = cancel.cancelled() => {}
                    _ = tokio::time::sleep(self.cooldown) => {}
                }
            }
        }

        let succeeded = entries.iter().filter(|e| e.status == RunStatus::Success).count();
        let summary = BatchSummary {
            batch_id,
            input: input.to_path_buf(),
            output_dir: output_dir.to_path_buf(),
            started_at,
            finished_at: Utc::now(),
            total,
            succeeded,
            failed: total - succeeded,
            runs: entries,
        };

        write_summary(output_dir, &summary)?;
        if let Some(pool) = &self.store {
            if let Err(e) = storage::save_batch(pool, &summary) {
                warn!(batch = %summary.batch_id, error = %e, "failed to record batch in datastore");
            }
        }

        info!(
            batch = %summary.batch_id,
            total = summary.total,
            succeeded = summary.succeeded,
            failed = summary.failed,
            "batch finished"
        );
        Ok(summary)
    }
}

/// Enumerate the descriptors in `input`: a directory of `*.toml`/`*.json`
/// files (sorted by file name), a CSV plan, or a single descriptor file.
pub fn discover(input: &Path, output_dir: &Path) -> Result<Vec<BatchItem>> {
    let mut items = Vec::new();

    if input.is_dir() {
        let mut paths: Vec<PathBuf> = std::fs::read_dir(input)
            .with_context(|| format!("failed to read descriptor directory {}", input.display()))?
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|p| p.is_file() && matches!(extension(p).as_deref(), Some("toml") | Some("json")))
            .collect();
        paths.sort();

        for path in paths {
            let label = stem(&path);
            let descriptor = RawDescriptor::from_file(&path).and_then(|raw| raw.validate(&label, output_dir));
            items.push(BatchItem::new(label, descriptor, output_dir));
        }
    } else if extension(input).as_deref() == Some("csv") {
        let plan = stem(input);
        let rows = RawDescriptor::from_csv(input).with_context(|| format!("failed to read {}", input.display()))?;
        for (i, row) in rows.into_iter().enumerate() {
            let label = format!("{}-{:03}", plan, i + 1);
            let descriptor = row.and_then(|raw| raw.validate(&label, output_dir));
            items.push(BatchItem::new(label, descriptor, output_dir));
        }
    } else if input.is_file() {
        let label = stem(input);
        let descriptor = RawDescriptor::from_file(input).and_then(|raw| raw.validate(&label, output_dir));
        items.push(BatchItem::new(label, descriptor, output_dir));
    } else {
        bail!("batch input {} does not exist", input.display());
    }

    assign_dirs(&mut items);
    Ok(items)
}

/// Give every item its own directory. Valid descriptors claim theirs first,
/// in order; a later valid descriptor with a taken directory is rejected.
/// Rejected items whose directory is taken move to `<label>.rejected`.
fn assign_dirs(items: &mut [BatchItem]) {
    let mut taken = HashSet::new();
    for item in items.iter_mut() {
        if let Ok(d) = &item.descriptor {
            if !taken.insert(d.output_dir.clone()) {
                item.descriptor = Err(DescriptorError::Invalid {
                    field: "name",
                    reason: format!("output directory {} already used by an earlier run", d.output_dir.display()),
                });
            }
        }
    }

    for item in items.iter_mut().filter(|i| i.descriptor.is_err()) {
        if taken.contains(&item.dir) {
            let parent = item.dir.parent().map(Path::to_path_buf).unwrap_or_default();
            let mut candidate = parent.join(format!("{}.rejected", item.label));
            let mut n = 2;
            while taken.contains(&candidate) {
                candidate = parent.join(format!("{}.rejected-{}", item.label, n));
                n += 1;
            }
            item.dir = candidate;
        }
        taken.insert(item.dir.clone());
    }
}

fn stem(path: &Path) -> String {
    path.file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "run".to_string())
}

/// Write `summary.json` and `summary.csv`.
pub fn write_summary(dir: &Path, summary: &BatchSummary) -> Result<()> {
    artifacts::write_json(&dir.join(SUMMARY_JSON), summary)?;

    let path = dir.join(SUMMARY_CSV);
    let mut wtr = csv::Writer::from_path(&path).with_context(|| format!("failed to create {}", path.display()))?;
    wtr.write_record([
        "name",
        "status",
        "elapsed_secs",
        "throughput_mbps",
        "counter_samples",
        "flow_records",
        "truncated_flows",
        "failure",
        "run_dir",
        "result_path",
    ])?;
    for e in &summary.runs {
        wtr.write_record([
            e.name.clone(),
            e.status.as_str().to_string(),
            format!("{:.3}", e.elapsed_secs),
            e.throughput_mbps.map(|t| format!("{:.2}", t)).unwrap_or_default(),
            e.counter_samples.to_string(),
            e.flow_records.to_string(),
            e.truncated_flows.to_string(),
            e.failure.clone().unwrap_or_default(),
            e.artifacts.dir.display().to_string(),
            e.artifacts
                .result
                .as_ref()
                .map(|p| p.display().to_string())
                .unwrap_or_default(),
        ])?;
    }
    wtr.flush()?;
    Ok(())
}

/// Console table for the end of a batch.
pub fn render_table(summary: &BatchSummary) -> String {
    let name_width = summary
        .runs
        .iter()
        .map(|e| e.name.len())
        .max()
        .unwrap_or(4)
        .max(4);

    let mut out = format!(
        "{:<w$}  {:<7}  {:>8}  {:>10}  {:>7}  {:>5}  {}\n",
        "NAME",
        "STATUS",
        "TIME",
        "MBPS",
        "SAMPLES",
        "FLOWS",
        "FAILURE",
        w = name_width
    );
    for e in &summary.runs {
        out.push_str(&format!(
            "{:<w$}  {:<7}  {:>7.1}s  {:>10}  {:>7}  {:>5}  {}\n",
            e.name,
            e.status.as_str(),
            e.elapsed_secs,
            e.throughput_mbps.map(|t| format!("{:.1}", t)).unwrap_or_else(|| "-".to_string()),
            e.counter_samples,
            e.flow_records,
            e.failure.as_deref().unwrap_or(""),
            w = name_width
        ));
    }
    out.push_str(&format!(
        "\n{} run(s): {} succeeded, {} failed\n",
        summary.total, summary.succeeded, summary.failed
    ));
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write(dir: &Path, name: &str, body: &str) {
        std::fs::write(dir.join(name), body).unwrap();
    }

    #[test]
    fn test_discover_directory_sorted_and_filtered() {
        let input = tempfile::TempDir::new().unwrap();
        let out = tempfile::TempDir::new().unwrap();
        write(input.path(), "02-big.json", r#"{"duration_secs": 10, "interface": "eth0", "parallel": 8}"#);
        write(input.path(), "01-small.toml", "duration_secs = 5\ninterface = \"lo\"\n");
        write(input.path(), "03-broken.toml", "duration_secs = \n");
        write(input.path(), "README.md", "not a descriptor");

        let items = discover(input.path(), out.path()).unwrap();
        let labels: Vec<&str> = items.iter().map(|i| i.label.as_str()).collect();
        assert_eq!(labels, ["01-small", "02-big", "03-broken"]);

        let small = items[0].descriptor.as_ref().unwrap();
        assert_eq!(small.output_dir, out.path().join("01-small"));
        assert_eq!(items[1].descriptor.as_ref().unwrap().parallel, 8);
        assert!(matches!(items[2].descriptor, Err(DescriptorError::Parse { .. })));
    }

    #[test]
    fn test_discover_csv_plan() {
        let input = tempfile::TempDir::new().unwrap();
        let out = tempfile::TempDir::new().unwrap();
        let plan = input.path().join("plan.csv");
        std::fs::write(
            &plan,
            "duration_secs,parallel,interface\n5,1,lo\n5,129,lo\n",
        )
        .unwrap();

        let items = discover(&plan, out.path()).unwrap();
        assert_eq!(items.len(), 2);
        assert_eq!(items[0].label, "plan-001");
        assert_eq!(items[0].descriptor.as_ref().unwrap().name, "plan-001");
        assert!(matches!(
            items[1].descriptor,
            Err(DescriptorError::Invalid { field: "parallel", .. })
        ));
    }

    #[test]
    fn test_duplicate_names_rejected() {
        let input = tempfile::TempDir::new().unwrap();
        let out = tempfile::TempDir::new().unwrap();
        write(input.path(), "a.toml", "name = \"same\"\nduration_secs = 1\ninterface = \"lo\"\n");
        write(input.path(), "b.toml", "name = \"same\"\nduration_secs = 1\ninterface = \"lo\"\n");

        let items = discover(input.path(), out.path()).unwrap();
        assert!(items[0].descriptor.is_ok());
        assert!(matches!(
            items[1].descriptor,
            Err(DescriptorError::Invalid { field: "name", .. })
        ));
    }

    #[test]
    fn test_rejected_item_never_shares_a_valid_run_directory() {
        let input = tempfile::TempDir::new().unwrap();
        let out = tempfile::TempDir::new().unwrap();
        write(input.path(), "a.toml", "name = \"b\"\nduration_secs = 1\ninterface = \"lo\"\n");
        write(input.path(), "b.toml", "duration_secs = 1\n");
        write(input.path(), "c.toml", "name = \"b\"\nduration_secs = 1\ninterface = \"lo\"\n");

        let items = discover(input.path(), out.path()).unwrap();
        assert_eq!(items[0].dir, out.path().join("b"));
        assert!(items[1].descriptor.is_err());
        assert_eq!(items[1].dir, out.path().join("b.rejected"));
        assert!(items[2].descriptor.is_err());
        assert_eq!(items[2].dir, out.path().join("c.rejected"));
    }

    #[test]
    fn test_missing_input_errors() {
        let out = tempfile::TempDir::new().unwrap();
        assert!(discover(Path::new("/nonexistent/batch"), out.path()).is_err());
    }

    #[test]
    fn test_render_table() {
        let summary = BatchSummary {
            batch_id: "b".to_string(),
            input: PathBuf::from("in"),
            output_dir: PathBuf::from("out"),
            started_at: Utc::now(),
            finished_at: Utc::now(),
            total: 1,
            succeeded: 0,
            failed: 1,
            runs: vec![BatchEntry {
                name: "exp-long-name".to_string(),
                status: RunStatus::Failure,
                elapsed_secs: 12.34,
                throughput_mbps: None,
                counter_samples: 12,
                flow_records: 3,
                truncated_flows: 1,
                failure: Some("Load/timeout: load generator did not finish within 20s".to_string()),
                artifacts: RunArtifacts::default(),
            }],
        };
        let table = render_table(&summary);
        assert!(table.starts_with("NAME         "));
        assert!(table.contains("exp-long-name  failure     12.3s"));
        assert!(table.contains("1 run(s): 0 succeeded, 1 failed"));
    }
}
