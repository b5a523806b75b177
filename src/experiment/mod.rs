//! One experiment run: descriptor, clock, orchestration and artifacts.

pub mod artifacts;
pub mod clock;
pub mod descriptor;
pub mod orchestrator;
pub mod result;

pub use descriptor::{DescriptorError, RawDescriptor, Role, RunDescriptor};
pub use orchestrator::Orchestrator;
pub use result::{FailureStage, RunFailure, RunResult, RunState, RunStatus};
