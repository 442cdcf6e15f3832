//! Orchestrator: sequences one engine cycle, fans out parallel
//! extractions and dispatches under bounded concurrency, retries
//! transient failures, and schedules cycles with a force-run override.

mod cycle;
mod engine;
mod retry;

pub use cycle::{run_cycle, run_cycle_guarded, CycleConfig, CycleOutcome, CycleReport, ExtractionSource};
pub use engine::{publish_stopped, Engine};
pub use retry::{with_retry, Attempted};
