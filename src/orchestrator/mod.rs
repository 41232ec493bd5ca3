pub mod observer;
pub mod pipeline;
pub mod runner;
pub mod summary;

pub use observer::{ChannelObserver, LogObserver, RunEvent, RunObserver};
pub use pipeline::{ExecuteOptions, Orchestrator, ResumePoint, fail_run};
pub use runner::{RetryPolicy, StageOutcome, StageRunner};
