//! Supervised dispatch CLI.
//!
//! `warden dispatch` runs one task on a target under the off-rails detector,
//! `warden wait` blocks until a dispatched task finishes, and `warden status`
//! prints a single snapshot.

use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, bail};
use clap::{Args, Parser, Subcommand};
use serde_json::json;

use warden::cancel::{CancelCause, CancelToken, TriggerKind};
use warden::core::types::{RemoteState, RemoteStatus, RepoRef};
use warden::dispatch::{DispatchContext, DispatchRequest, DispatchResult, DispatchSinks, run_dispatch};
use warden::exit_codes;
use warden::io::config::{DEFAULT_CONFIG_PATH, WardenConfig, load_config};
use warden::io::credentials::Credentials;
use warden::io::probes::RemoteLayout;
use warden::logging;
use warden::offrails::round_secs;
use warden::stream::StreamMode;
use warden::wait::{WaitOptions, WaitProgress, poll_status, wait_for_completion};

#[derive(Parser)]
#[command(
    name = "warden",
    version,
    about = "Dispatch long-running tasks to remote workers and supervise them"
)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run a task on a target and supervise it until it finishes.
    ///
    /// Exit codes: 0 success (including off-rails runs that left a completion
    /// marker or new commits), 1 failure, 2 worker blocked, 4 stopped off-rails
    /// with no work. Any other worker exit code is forwarded; a worker exit of
    /// 2, 4 or 130 is reported as 1 so it cannot be mistaken for those.
    Dispatch(DispatchArgs),
    /// Block until the task on a target completes, blocks, or the wait times out.
    ///
    /// Exit codes: 0 completed, 2 blocked, 1 timed out or failed.
    Wait(WaitArgs),
    /// Print the current status of a target once.
    Status(StatusArgs),
}

#[derive(Args)]
struct DispatchArgs {
    /// Target name.
    target: String,
    /// Task description handed to the worker.
    task: String,
    /// Repository to work on (owner/repo).
    #[arg(long)]
    repo: String,
    /// Max wall-clock time for the session, before the grace period.
    #[arg(long, value_parser = humantime::parse_duration)]
    timeout: Option<Duration>,
    /// Abort if the worker is silent this long (0 disables the abort).
    #[arg(long, value_parser = humantime::parse_duration)]
    no_output_timeout: Option<Duration>,
    /// Iteration cap for the remote loop.
    #[arg(long)]
    max_iterations: Option<u32>,
    /// Check preconditions only; change nothing on the target.
    #[arg(long)]
    dry_run: bool,
    /// Emit worker events as raw JSON lines instead of narration.
    #[arg(long)]
    json: bool,
    #[arg(long)]
    config: Option<PathBuf>,
}

#[derive(Args)]
struct WaitArgs {
    target: String,
    /// Overall wait budget.
    #[arg(long, value_parser = humantime::parse_duration)]
    timeout: Option<Duration>,
    #[arg(long, value_parser = humantime::parse_duration)]
    poll_interval: Option<Duration>,
    #[arg(long)]
    json: bool,
    #[arg(long)]
    config: Option<PathBuf>,
}

#[derive(Args)]
struct StatusArgs {
    target: String,
    #[arg(long)]
    json: bool,
    #[arg(long)]
    config: Option<PathBuf>,
}

fn main() {
    logging::init();
    match run() {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            eprintln!("{:#}", err);
            std::process::exit(exit_codes::FAILURE);
        }
    }
}

fn run() -> Result<i32> {
    let cli = Cli::parse();
    let cancel = CancelToken::new();
    install_interrupt_handler(&cancel)?;
    match cli.command {
        Command::Dispatch(args) => cmd_dispatch(args, cancel),
        Command::Wait(args) => cmd_wait(args, &cancel),
        Command::Status(args) => cmd_status(args),
    }
}

fn install_interrupt_handler(cancel: &CancelToken) -> Result<()> {
    let token = cancel.clone();
    ctrlc::set_handler(move || {
        let cause = CancelCause::new(TriggerKind::Interrupted, "received interrupt");
        if token.cancel(cause) {
            eprintln!("\ninterrupt received, stopping...");
        } else {
            std::process::exit(exit_codes::INTERRUPTED);
        }
    })
    .context("install interrupt handler")
}

fn load(path: Option<&Path>) -> Result<WardenConfig> {
    load_config(path.unwrap_or(Path::new(DEFAULT_CONFIG_PATH)))
}

fn cmd_dispatch(args: DispatchArgs, cancel: CancelToken) -> Result<i32> {
    let config = load(args.config.as_deref())?;
    let transport = config.transport()?;
    let credentials = Credentials::collect(&config.credentials.required, |name| {
        std::env::var(name).ok()
    });
    let repo: RepoRef = args.repo.parse()?;
    let max_iterations = args
        .max_iterations
        .unwrap_or(config.dispatch.max_iterations);
    if max_iterations == 0 {
        bail!("--max-iterations must be > 0");
    }

    let mut offrails = config.offrails_config();
    if let Some(silence_abort) = args.no_output_timeout {
        offrails.silence_abort = silence_abort;
    }

    let request = DispatchRequest {
        target: args.target,
        task: args.task,
        repo,
        timeout: args
            .timeout
            .unwrap_or(Duration::from_secs(config.dispatch.timeout_secs)),
        max_iterations,
        dry_run: args.dry_run,
        mode: if args.json {
            StreamMode::Machine
        } else {
            StreamMode::Narrate
        },
    };
    let ctx = DispatchContext {
        remote: &transport,
        config: &config,
        credentials: &credentials,
        offrails,
        cancel,
    };
    let sinks = DispatchSinks {
        stdout: Box::new(io::stdout()),
        stderr: Box::new(io::stderr()),
        alerts: Box::new(io::stderr()),
    };

    let result = run_dispatch(&ctx, &request, sinks)?;
    if args.json {
        print_json(&dispatch_summary(&request.target, &result))?;
    }
    Ok(result.exit_code())
}

fn dispatch_summary(target: &str, result: &DispatchResult) -> serde_json::Value {
    match result {
        DispatchResult::Ready(run) => json!({
            "type": "dispatch_result",
            "target": target,
            "outcome": "ready",
            "exit_code": exit_codes::OK,
            "timeout_secs": run.timeout.as_secs(),
            "grace_secs": run.grace.as_secs(),
        }),
        DispatchResult::Completed { run, outcome } => json!({
            "type": "dispatch_result",
            "target": target,
            "outcome": outcome.as_str(),
            "exit_code": outcome.exit_code(),
            "message": outcome.to_string(),
            "started_at": run.started_at.to_rfc3339(),
        }),
    }
}

fn cmd_wait(args: WaitArgs, cancel: &CancelToken) -> Result<i32> {
    let config = load(args.config.as_deref())?;
    let transport = config.transport()?;
    let layout = RemoteLayout::from_config(&config.dispatch);
    let mut options = WaitOptions::from_config(&config.wait);
    if let Some(timeout) = args.timeout {
        options.timeout = timeout;
    }
    if let Some(interval) = args.poll_interval {
        if interval.is_zero() {
            bail!("--poll-interval must be > 0");
        }
        options.poll_interval = interval;
    }

    let json = args.json;
    let status = wait_for_completion(
        &transport,
        &args.target,
        &layout,
        &options,
        cancel,
        |progress| match progress {
            WaitProgress::Polled(status) if !json => {
                eprintln!("{}: {}", status.target, status.state.as_str());
            }
            WaitProgress::Polled(_) => {}
            WaitProgress::ProbeFailed { attempt, error } => {
                eprintln!("status probe failed (attempt {attempt}): {error:#}");
            }
        },
    )?;

    print_status(&status, json)?;
    Ok(match status.state {
        RemoteState::Completed => exit_codes::OK,
        RemoteState::Blocked => exit_codes::BLOCKED,
        _ => exit_codes::FAILURE,
    })
}

fn cmd_status(args: StatusArgs) -> Result<i32> {
    let config = load(args.config.as_deref())?;
    let transport = config.transport()?;
    let layout = RemoteLayout::from_config(&config.dispatch);
    warden::core::types::validate_target(&args.target)?;
    let status = poll_status(
        &transport,
        &args.target,
        &layout,
        Duration::from_secs(config.wait.probe_timeout_secs),
    )?;
    print_status(&status, args.json)?;
    Ok(exit_codes::OK)
}

fn print_status(status: &RemoteStatus, json: bool) -> Result<()> {
    if json {
        return print_json(&serde_json::to_value(status).context("serialize status")?);
    }
    let mut out = io::stdout().lock();
    writeln!(out, "{}: {}", status.target, status.state.as_str())?;
    if !status.task.is_empty() {
        writeln!(out, "  task: {}", status.task)?;
    }
    if !status.repo.is_empty() {
        writeln!(out, "  repo: {}", status.repo)?;
    }
    if let Some(runtime) = status.runtime {
        writeln!(out, "  runtime: {}", round_secs(runtime))?;
    }
    if let Some(reason) = &status.blocked_reason {
        writeln!(out, "  blocked: {reason}")?;
    }
    if let Some(url) = &status.result_url {
        writeln!(out, "  result: {url}")?;
    }
    if let Some(error) = &status.error {
        writeln!(out, "  error: {error}")?;
    }
    Ok(())
}

fn print_json(value: &serde_json::Value) -> Result<()> {
    let mut out = io::stdout().lock();
    serde_json::to_writer(&mut out, value).context("write json")?;
    writeln!(out)?;
    Ok(())
}
