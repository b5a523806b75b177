//! Run outcome types.

use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::Serialize;

use super::descriptor::RunDescriptor;
use crate::throughput::LoadSummary;

/// Orchestrator state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    Idle,
    Starting,
    Running,
    Stopping,
    Completed,
    Failed,
}

impl std::fmt::Display for RunState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            RunState::Idle => "idle",
            RunState::Starting => "starting",
            RunState::Running => "running",
            RunState::Stopping => "stopping",
            RunState::Completed => "completed",
            RunState::Failed => "failed",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Success,
    Failure,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Success => "success",
            RunStatus::Failure => "failure",
        }
    }
}

/// Where in the run a failure happened.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureStage {
    Descriptor,
    Startup,
    Load,
    Artifacts,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RunFailure {
    pub stage: FailureStage,
    /// Finer tag within the stage, e.g. `timeout` for a load failure.
    pub kind: String,
    pub message: String,
}

impl RunFailure {
    pub fn new(stage: FailureStage, kind: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            stage,
            kind: kind.into(),
            message: message.into(),
        }
    }
}

impl std::fmt::Display for RunFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}/{}: {}", self.stage, self.kind, self.message)
    }
}

/// Paths of the files a run produced. `None` means not written.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RunArtifacts {
    pub dir: PathBuf,
    pub counters: Option<PathBuf>,
    pub flows: Option<PathBuf>,
    pub load_output: Option<PathBuf>,
    pub result: Option<PathBuf>,
    pub log: Option<PathBuf>,
}

/// Per-sampler bookkeeping kept with the result.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SamplerStats {
    pub records: usize,
    pub failed_reads: u64,
    pub became_unhealthy: bool,
}

/// Aggregate outcome of one run. Exists for every descriptor processed.
#[derive(Debug, Clone, Serialize)]
pub struct RunResult {
    pub name: String,
    pub status: RunStatus,
    pub final_state: RunState,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub elapsed_secs: f64,
    pub load_started_at: Option<DateTime<Utc>>,
    pub load_finished_at: Option<DateTime<Utc>>,
    /// `None` when the descriptor itself was invalid.
    pub descriptor: Option<RunDescriptor>,
    pub load: Option<LoadSummary>,
    pub failure: Option<RunFailure>,
    pub counters: SamplerStats,
    pub flows: SamplerStats,
    pub truncated_flows: usize,
    pub artifacts: RunArtifacts,
}

impl RunResult {
    /// Result for a descriptor that never reached the orchestrator.
    pub fn rejected(name: impl Into<String>, dir: PathBuf, failure: RunFailure) -> Self {
        let now = Utc::now();
        Self {
            name: name.into(),
            status: RunStatus::Failure,
            final_state: RunState::Failed,
            started_at: now,
            finished_at: now,
            elapsed_secs: 0.0,
            load_started_at: None,
            load_finished_at: None,
            descriptor: None,
            load: None,
            failure: Some(failure),
            counters: SamplerStats::default(),
            flows: SamplerStats::default(),
            truncated_flows: 0,
            artifacts: RunArtifacts {
                dir,
                ..Default::default()
            },
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == RunStatus::Success
    }
}
