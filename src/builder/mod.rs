//! The environment builder: per-instance refinement loop, batch worker
//! pool, input loading and results collection.

pub mod config;
pub mod input;
pub mod orchestrator;
pub mod progress;
pub mod recorder;
pub mod results;
pub mod state;
pub mod worker_pool;

pub use config::{AgentSettings, Backend, BuilderConfig, LlmSettings, PoolSettings, SandboxSettings};
pub use input::{load_instances, parse_instances, InputRecord};
pub use orchestrator::{retarget_dockerfile, Orchestrator};
pub use progress::{ProgressCounters, ProgressMonitor, ProgressSnapshot};
pub use recorder::{RoundClose, RoundRecorder};
pub use results::{BatchSummary, InstanceStatus, ResultsWriter};
pub use state::{
    BuilderState, Failure, FailureKind, InstanceOutcome, RoundRecord, ValidationSummary,
};
pub use worker_pool::run_batch;
