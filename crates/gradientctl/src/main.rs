//! Gradient Control - runs a diagnostic playbook from a downloaded toolbox.
//!
//! The toolbox for the host platform is fetched, unpacked into a temporary
//! directory, its diagnostics run concurrently in a proot sandbox, and the
//! results are summarized by an LLM when credentials are available.

mod display;
mod logging;
mod terminal;

use anyhow::{bail, Context, Result};
use clap::Parser;
use gradient_common::resolver::find_by_description;
use gradient_common::summarize::summarizer_from_env;
use gradient_common::{
    platform, prepare, Executor, Headless, Prepared, RunOutcome, Runner, RunnerConfig,
};
use std::io::IsTerminal;
use std::path::PathBuf;
use std::time::Instant;
use tracing::info;

#[derive(Parser, Debug)]
#[command(name = "gradientctl")]
#[command(about = "Run diagnostic playbooks using a gradient engineer toolbox", long_about = None)]
#[command(version)]
struct Cli {
    /// Playbook to run (defaults to the 60-second check for this OS)
    playbook: Option<String>,

    /// Toolbox repository URL or path (e.g. file:///home/user/toolboxes/)
    #[arg(long)]
    toolbox_repo: Option<String>,

    /// Config file (default: $GRADIENT_CONFIG or <config dir>/gradient/config.toml)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Default per-diagnostic timeout in seconds
    #[arg(long, value_parser = clap::value_parser!(u64).range(1..))]
    timeout: Option<u64>,

    /// No interactive screen; print a report when done
    #[arg(long)]
    plain: bool,

    /// Print the final snapshot as JSON
    #[arg(long, conflicts_with_all = ["list", "run"])]
    json: bool,

    /// Run only the diagnostic with this description and print its output
    #[arg(long, value_name = "DESCRIPTION", conflicts_with = "list")]
    run: Option<String>,

    /// Print the resolved diagnostics and exit
    #[arg(long)]
    list: bool,

    /// Log file for interactive runs
    #[arg(long)]
    log_file: Option<PathBuf>,
}

impl Cli {
    fn interactive(&self) -> bool {
        !(self.plain || self.json || self.list || self.run.is_some())
            && std::io::stdout().is_terminal()
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let interactive = cli.interactive();
    if interactive || cli.log_file.is_some() {
        let path = cli.log_file.clone().unwrap_or_else(logging::default_log_path);
        logging::init_file(&path)?;
    } else {
        logging::init_stderr();
    }

    let mut config = RunnerConfig::load(cli.config.as_deref())?;
    if let Some(repo) = &cli.toolbox_repo {
        config.toolbox_repo = repo.clone();
    }
    if let Some(secs) = cli.timeout {
        config.default_timeout_secs = secs;
    }

    let playbook = cli
        .playbook
        .clone()
        .unwrap_or_else(|| platform::default_playbook().to_string());
    let locator = platform::toolbox_locator(&config.toolbox_repo, &playbook);
    info!(
        "gradientctl v{} starting: {}",
        env!("CARGO_PKG_VERSION"),
        locator
    );

    if cli.list {
        return list(&locator, &config).await;
    }
    if let Some(description) = &cli.run {
        return run_one(&locator, &config, description).await;
    }

    let summarizer = summarizer_from_env(config.summary_timeout());
    let started = Instant::now();

    let report = if interactive {
        let runner = Runner::new(locator, config, summarizer);
        let mut frontend = terminal::Interactive::start(runner.sender())?;
        let report = runner.run(&mut frontend).await;
        drop(frontend);
        report
    } else {
        Runner::new(locator, config, summarizer)
            .exit_when_done(true)
            .run(&mut Headless)
            .await
    };

    if cli.json {
        println!("{}", serde_json::to_string_pretty(&report.snapshot)?);
    } else {
        // Interactive runs also leave the final view on the normal screen
        print!("{}", display::report(&report.snapshot));
    }
    info!("Finished in {:.1}s", started.elapsed().as_secs_f32());

    if report.outcome == RunOutcome::Aborted {
        std::process::exit(1);
    }
    Ok(())
}

async fn acquire(locator: &str, config: &RunnerConfig) -> Result<Prepared> {
    let locator = locator.to_string();
    let timeout = config.default_timeout();
    let prepared = tokio::task::spawn_blocking(move || prepare(&locator, timeout))
        .await
        .context("Toolbox acquisition task failed")??;
    Ok(prepared)
}

async fn list(locator: &str, config: &RunnerConfig) -> Result<()> {
    let prepared = acquire(locator, config).await?;
    println!("Playbook {}", prepared.bundle.playbook().id);
    for command in &prepared.commands {
        println!(
            "{:>3}  {:<40} {}",
            command.index + 1,
            command.description(),
            command.invocation.as_deref().unwrap_or("-")
        );
    }
    prepared.bundle.cleanup()?;
    Ok(())
}

async fn run_one(locator: &str, config: &RunnerConfig, description: &str) -> Result<()> {
    let prepared = acquire(locator, config).await?;

    let Some(command) = find_by_description(&prepared.commands, description) else {
        let known: Vec<&str> = prepared.commands.iter().map(|c| c.description()).collect();
        let _ = prepared.bundle.cleanup();
        bail!(
            "No diagnostic named '{}'. Available: {}",
            description,
            known.join(", ")
        );
    };

    let timeout = command.timeout;
    let executor = Executor::new(
        prepared.bundle.root(),
        config.max_output_lines,
        config.kill_grace(),
    );
    let result = executor.run(command).await;
    println!("{}", result.output());
    prepared.bundle.cleanup()?;

    match result.outcome {
        Ok(captured) if captured.timed_out => {
            eprintln!("(timed out after {}s)", timeout.as_secs());
            Ok(())
        }
        Ok(_) => Ok(()),
        Err(e) => Err(e.into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_zero_timeout_is_rejected() {
        assert!(Cli::try_parse_from(["gradientctl", "--timeout", "0"]).is_err());
        let cli = Cli::try_parse_from(["gradientctl", "--timeout", "7"]).unwrap();
        assert_eq!(cli.timeout, Some(7));
    }
}
