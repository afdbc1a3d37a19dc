//! Pipeline execution.
//!
//! | Module         | Purpose                                               |
//! |----------------|-------------------------------------------------------|
//! | `retry`        | Bounded sequential attempts per unit                  |
//! | `executor`     | Runs one stage: agent fan-out, synthesis, final review |
//! | `orchestrator` | Validates inputs, builds the run, sequences stages    |

pub mod executor;
pub mod orchestrator;
pub mod retry;

pub use executor::{RunContext, StageExecutor, StageOutcome};
pub use orchestrator::{EventSink, RunEvent, RunInputs, RunOrchestrator, RunPhase};
pub use retry::{DEFAULT_RETRY_THRESHOLD, RetryPolicy};
