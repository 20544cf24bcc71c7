//! Gradient Common - toolbox acquisition and diagnostic orchestration.
//!
//! A toolbox is an xz tar holding a nix package store, a proot binary and a
//! playbook. Diagnostics from the playbook are resolved to store binaries,
//! run concurrently inside the sandbox, and summarized once all have finished.

pub mod bundle;
pub mod config;
pub mod error;
pub mod executor;
pub mod extract;
pub mod fetch;
pub mod orchestrator;
pub mod pack;
pub mod platform;
pub mod playbook;
pub mod resolver;
pub mod runner;
pub mod sandbox;
pub mod snapshot;
pub mod summarize;

pub use bundle::Bundle;
pub use config::RunnerConfig;
pub use error::{ExecError, SummaryError, ToolboxError};
pub use executor::{CapturedOutput, ExecutionResult, Executor};
pub use orchestrator::{Effect, Message, Orchestrator, Prepared, RunOutcome, UserInput};
pub use playbook::{DiagnosticSpec, Playbook};
pub use resolver::{CommandResolver, ResolvedCommand};
pub use runner::{prepare, prepare_cancellable, Frontend, Headless, RunReport, Runner};
pub use snapshot::{Phase, RunStatus, Snapshot, SummaryState};
pub use summarize::{SummaryPair, Summarizer};
