pub mod config;
pub mod error;
pub mod evaluator;
pub mod executor;
pub mod lock;
pub mod matrix;
pub mod notify;
pub mod orchestrator;
pub mod report;
pub mod scoring;
pub mod store;
pub mod task;

pub use config::OrchestratorConfig;
pub use error::SubmitError;
pub use lock::{AcquireOutcome, ExecutionLock, LockStatus};
pub use orchestrator::{Orchestrator, PipelineStatus, QueueState, SubmitReceipt};
pub use task::{Task, TaskConfig, TaskStatus};
