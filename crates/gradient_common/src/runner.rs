//! Runner - drives the orchestrator with real tasks.
//!
//! One loop owns the [`Orchestrator`] and an unbounded channel. Acquisition
//! runs on the blocking pool, each diagnostic and the summary call are tokio
//! tasks, and a ticker feeds the progress indicator. Every task reports back
//! through the channel; nothing else touches run state. A task that dies
//! without reporting is turned into a failed result so the run still ends.
//!
//! Teardown stops the ticker, aborts running tasks (which kills their process
//! groups), cancels an unfinished acquisition and waits for it, then removes
//! the working directory.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::{Id, JoinError, JoinHandle, JoinSet};
use tracing::{debug, error, info, warn};

use crate::bundle::Bundle;
use crate::config::RunnerConfig;
use crate::error::{ExecError, SummaryError, ToolboxError};
use crate::executor::{ExecutionResult, Executor};
use crate::orchestrator::{Effect, Message, Orchestrator, Prepared, RunOutcome};
use crate::resolver::CommandResolver;
use crate::snapshot::Snapshot;
use crate::summarize::Summarizer;

/// Receives a fresh snapshot after every processed message
pub trait Frontend {
    fn render(&mut self, snapshot: &Snapshot);
}

/// Frontend that draws nothing
pub struct Headless;

impl Frontend for Headless {
    fn render(&mut self, _snapshot: &Snapshot) {}
}

/// Fetch, unpack and resolve a toolbox. Blocking.
pub fn prepare(locator: &str, default_timeout: Duration) -> Result<Prepared, ToolboxError> {
    prepare_cancellable(locator, default_timeout, Arc::new(AtomicBool::new(false)))
}

pub fn prepare_cancellable(
    locator: &str,
    default_timeout: Duration,
    cancel: Arc<AtomicBool>,
) -> Result<Prepared, ToolboxError> {
    let bundle = Bundle::acquire_cancellable(locator, cancel)?;
    let commands = CommandResolver::new(default_timeout).resolve(&bundle)?;
    Ok(Prepared { bundle, commands })
}

/// What a spawned task was for, so its loss can be reported
enum TaskKind {
    Diagnostic { index: usize, description: String },
    Summary,
}

#[derive(Debug)]
pub struct RunReport {
    pub outcome: RunOutcome,
    pub snapshot: Snapshot,
}

pub struct Runner {
    locator: String,
    config: RunnerConfig,
    summarizer: Option<Arc<dyn Summarizer>>,
    exit_when_done: bool,
    cancel: Arc<AtomicBool>,
    tx: mpsc::UnboundedSender<Message>,
    rx: mpsc::UnboundedReceiver<Message>,
}

impl Runner {
    pub fn new(
        locator: impl Into<String>,
        config: RunnerConfig,
        summarizer: Option<Arc<dyn Summarizer>>,
    ) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            locator: locator.into(),
            config,
            summarizer,
            exit_when_done: false,
            cancel: Arc::new(AtomicBool::new(false)),
            tx,
            rx,
        }
    }

    /// Return as soon as Done is reached instead of waiting for Quit
    pub fn exit_when_done(mut self, exit: bool) -> Self {
        self.exit_when_done = exit;
        self
    }

    /// Channel for frontends to inject user input
    pub fn sender(&self) -> mpsc::UnboundedSender<Message> {
        self.tx.clone()
    }

    pub async fn run(mut self, frontend: &mut dyn Frontend) -> RunReport {
        let provider = self.summarizer.as_ref().map(|s| s.name().to_string());
        let mut machine = Orchestrator::new(provider, self.exit_when_done);
        let mut tasks: JoinSet<()> = JoinSet::new();
        let mut kinds: HashMap<Id, TaskKind> = HashMap::new();

        info!(locator = %self.locator, "Acquiring toolbox");
        let acquisition = self.spawn_acquisition();
        let ticker = self.spawn_ticker();

        let outcome = loop {
            frontend.render(&machine.snapshot());

            let message = tokio::select! {
                received = self.rx.recv() => match received {
                    Some(message) => message,
                    // Unreachable while we hold a sender
                    None => break RunOutcome::Aborted,
                },
                Some(joined) = tasks.join_next_with_id() => {
                    match lost_task(joined, &mut kinds) {
                        Some(message) => message,
                        None => continue,
                    }
                }
            };

            let mut exit = None;
            for effect in machine.update(message) {
                match effect {
                    Effect::Launch { cwd, commands } => {
                        let executor = Executor::new(
                            cwd,
                            self.config.max_output_lines,
                            self.config.kill_grace(),
                        );
                        for command in commands {
                            let kind = TaskKind::Diagnostic {
                                index: command.index,
                                description: command.description().to_string(),
                            };
                            let executor = executor.clone();
                            let tx = self.tx.clone();
                            let handle = tasks.spawn(async move {
                                let result = executor.run(&command).await;
                                let _ = tx.send(Message::ExecutionDone(result));
                            });
                            kinds.insert(handle.id(), kind);
                        }
                    }
                    Effect::Summarize {
                        instruction,
                        pairs,
                    } => match self.summarizer.clone() {
                        Some(summarizer) => {
                            let tx = self.tx.clone();
                            let handle = tasks.spawn(async move {
                                let result = summarizer.summarize(&instruction, &pairs).await;
                                let _ = tx.send(Message::SummaryDone(result));
                            });
                            kinds.insert(handle.id(), TaskKind::Summary);
                        }
                        None => error!("Summary requested without a summarizer"),
                    },
                    Effect::Exit(outcome) => exit = Some(outcome),
                }
            }

            if let Some(outcome) = exit {
                break outcome;
            }
        };

        let snapshot = machine.snapshot();
        frontend.render(&snapshot);

        ticker.abort();
        tasks.shutdown().await;

        self.cancel.store(true, Ordering::Relaxed);
        if let Err(e) = acquisition.await {
            debug!("Acquisition task ended abnormally: {}", e);
        }
        // A toolbox that finished unpacking after the loop stopped listening
        while let Ok(message) = self.rx.try_recv() {
            if let Message::BundleReady(prepared) = message {
                discard(prepared.bundle);
            }
        }
        if let Some(bundle) = machine.take_bundle() {
            discard(bundle);
        }

        info!(?outcome, "Run finished");
        RunReport { outcome, snapshot }
    }

    fn spawn_acquisition(&self) -> JoinHandle<()> {
        let locator = self.locator.clone();
        let default_timeout = self.config.default_timeout();
        let cancel = self.cancel.clone();
        let tx = self.tx.clone();

        tokio::spawn(async move {
            let joined = tokio::task::spawn_blocking(move || {
                prepare_cancellable(&locator, default_timeout, cancel)
            })
            .await;
            let message = match joined {
                Ok(Ok(prepared)) => Message::BundleReady(prepared),
                Ok(Err(e)) => Message::BundleFailed(e),
                Err(e) => Message::BundleFailed(ToolboxError::extraction("acquisition task", e)),
            };
            if tx.send(message).is_err() {
                debug!("Runner gone before toolbox was ready");
            }
        })
    }

    fn spawn_ticker(&self) -> tokio::task::JoinHandle<()> {
        let tx = self.tx.clone();
        let period = self.config.tick_interval();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                interval.tick().await;
                if tx.send(Message::Tick).is_err() {
                    break;
                }
            }
        })
    }
}

fn discard(bundle: Bundle) {
    if let Err(e) = bundle.cleanup() {
        warn!("Toolbox cleanup failed: {}", e);
    }
}

/// Message standing in for a task that ended without reporting
fn lost_task(
    joined: Result<(Id, ()), JoinError>,
    kinds: &mut HashMap<Id, TaskKind>,
) -> Option<Message> {
    let (id, reason) = match joined {
        Ok((id, ())) => {
            kinds.remove(&id);
            return None;
        }
        Err(e) => (e.id(), e.to_string()),
    };

    match kinds.remove(&id)? {
        TaskKind::Diagnostic { index, description } => {
            error!(index, "Diagnostic task died: {}", reason);
            Some(Message::ExecutionDone(ExecutionResult {
                index,
                duration: Duration::ZERO,
                outcome: Err(ExecError::CommandFailed {
                    description,
                    exit: format!("task died: {}", reason),
                    output: String::new(),
                }),
            }))
        }
        TaskKind::Summary => {
            error!("Summary task died: {}", reason);
            Some(Message::SummaryDone(Err(SummaryError::TaskFailed(reason))))
        }
    }
}
