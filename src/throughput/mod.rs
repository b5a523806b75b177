//! Load generation: the iperf3 driver, its output model, and formatting.

pub mod driver;
pub mod iperf;
pub mod report;

use thiserror::Error;

pub use driver::{IdleLoad, Iperf3Driver, LoadGenerator, LoadRun};
pub use iperf::LoadSummary;

#[derive(Debug, Error)]
pub enum LoadError {
    #[error("failed to launch {program}: {reason}")]
    Spawn { program: String, reason: String },

    #[error("load generator exited with code {}: {stderr}", .code.map(|c| c.to_string()).unwrap_or_else(|| "none".to_string()))]
    Exit { code: Option<i32>, stderr: String },

    #[error("load generator did not finish within {limit_secs}s")]
    Timeout { limit_secs: u64 },

    #[error("load generator output could not be parsed: {0}")]
    Parse(String),

    #[error("load generator cancelled")]
    Cancelled,
}

impl LoadError {
    /// Short machine-readable tag recorded with failed runs.
    pub fn kind(&self) -> &'static str {
        match self {
            LoadError::Spawn { .. } => "spawn",
            LoadError::Exit { .. } => "exit",
            LoadError::Timeout { .. } => "timeout",
            LoadError::Parse(_) => "parse",
            LoadError::Cancelled => "cancelled",
        }
    }
}
