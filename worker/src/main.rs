//! Autonomous code-change worker CLI.
//!
//! Runs live in a file store under `.worker/store`. `enqueue` adds a task,
//! `poll` drives runs to `awaiting_approval`, and `approve`/`reject` record the
//! human decision that the polling worker acts on next.

use std::fs;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::thread;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use chrono::Utc;
use clap::{Parser, Subcommand};
use rand::Rng;
use rand::distributions::Alphanumeric;
use serde::Serialize;
use serde_json::json;
use tracing::{info, warn};

use worker::core::diff::{FileDiff, parse_unified_diff};
use worker::core::patch_policy::{ValidationReport, validate_patch};
use worker::core::risk::{RiskAssessment, assess_risk};
use worker::core::types::Run;
use worker::exit_codes;
use worker::io::approval::{approve_run, cancel_run, reject_run};
use worker::io::config::{DEFAULT_CONFIG_PATH, WorkerConfig, load_config, write_config};
use worker::io::file_store::FileStore;
use worker::io::process::ProcessRunner;
use worker::io::proposer::CommandProposer;
use worker::io::store::Store;
use worker::io::transport::{RetryPolicy, with_retry};
use worker::logging;
use worker::orchestrator::{Orchestrator, OrchestratorConfig, TickOutcome};

#[derive(Parser)]
#[command(name = "worker", version, about = "Autonomous code-change worker")]
struct Cli {
    /// Repository root the worker operates on.
    #[arg(long, global = true, default_value = ".")]
    repo: PathBuf,
    /// Config file; defaults to `.worker/config.toml` under the repository.
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Write a default config file if missing.
    Init {
        /// Overwrite an existing config.
        #[arg(short, long)]
        force: bool,
    },
    /// Queue a new run and print its id.
    Enqueue {
        #[arg(long)]
        task: String,
    },
    /// Claim and drive runs until interrupted.
    Poll {
        /// Perform a single tick and exit.
        #[arg(long)]
        once: bool,
    },
    /// Claim and process one specific queued run.
    Run { id: String },
    /// Print a run record as JSON.
    Status {
        id: String,
        /// Include the run's event log.
        #[arg(long)]
        events: bool,
    },
    /// Approve every patch of a run awaiting approval.
    Approve {
        id: String,
        #[arg(long)]
        by: String,
    },
    /// Reject a run awaiting approval.
    Reject {
        id: String,
        #[arg(long)]
        by: String,
        #[arg(long)]
        reason: Option<String>,
    },
    /// Cancel a run that has not finished.
    Cancel { id: String },
    /// Validate and risk-score a diff file (`-` for stdin) without storing it.
    Check {
        diff: PathBuf,
        /// Task description used for risk keywords.
        #[arg(long, default_value = "")]
        task: String,
    },
}

fn main() {
    logging::init();
    match run() {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            eprintln!("{err:#}");
            std::process::exit(exit_codes::INVALID);
        }
    }
}

fn run() -> Result<i32> {
    let cli = Cli::parse();
    let config_path = cli
        .config
        .clone()
        .unwrap_or_else(|| cli.repo.join(DEFAULT_CONFIG_PATH));
    if let Command::Init { force } = cli.command {
        return cmd_init(&config_path, force);
    }
    let cfg = load_config(&config_path)?;

    match cli.command {
        Command::Init { .. } => Ok(exit_codes::OK),
        Command::Enqueue { task } => cmd_enqueue(&cli.repo, &cfg, &task),
        Command::Poll { once } => cmd_poll(&cli.repo, &cfg, once),
        Command::Run { id } => cmd_run(&cli.repo, &cfg, &id),
        Command::Status { id, events } => cmd_status(&cli.repo, &cfg, &id, events),
        Command::Approve { id, by } => {
            let store = open_store(&cli.repo, &cfg)?;
            let run = approve_run(&store, &RetryPolicy::from(&cfg.retry), &id, &by, Utc::now())?;
            print_json(&run)?;
            Ok(exit_codes::OK)
        }
        Command::Reject { id, by, reason } => {
            let store = open_store(&cli.repo, &cfg)?;
            let run = reject_run(
                &store,
                &RetryPolicy::from(&cfg.retry),
                &id,
                &by,
                reason.as_deref(),
                Utc::now(),
            )?;
            print_json(&run)?;
            Ok(exit_codes::OK)
        }
        Command::Cancel { id } => {
            let store = open_store(&cli.repo, &cfg)?;
            let from = cancel_run(&store, &RetryPolicy::from(&cfg.retry), &id)?;
            println!("{id} cancelled (was {from})");
            Ok(exit_codes::OK)
        }
        Command::Check { diff, task } => cmd_check(&cli.repo, &cfg, &diff, &task),
    }
}

fn cmd_init(config_path: &Path, force: bool) -> Result<i32> {
    if config_path.exists() && !force {
        println!("{} already exists", config_path.display());
        return Ok(exit_codes::OK);
    }
    write_config(config_path, &WorkerConfig::default())?;
    println!("wrote {}", config_path.display());
    Ok(exit_codes::OK)
}

fn cmd_enqueue(repo: &Path, cfg: &WorkerConfig, task: &str) -> Result<i32> {
    if task.trim().is_empty() {
        bail!("task must not be empty");
    }
    let store = open_store(repo, cfg)?;
    let run = Run::queued(format!("run-{}", random_suffix(12)), task, Utc::now());
    let id = run.id.clone();
    with_retry(&RetryPolicy::from(&cfg.retry), "insert_run", || {
        store.insert_run(run.clone())
    })?;
    println!("{id}");
    Ok(exit_codes::OK)
}

fn cmd_poll(repo: &Path, cfg: &WorkerConfig, once: bool) -> Result<i32> {
    let orchestrator = build_orchestrator(repo, cfg)?;
    let interval = Duration::from_millis(cfg.worker.poll_interval_ms);
    info!(interval_ms = cfg.worker.poll_interval_ms, "polling");
    loop {
        match orchestrator.tick() {
            Ok(TickOutcome::Processed { run_id, status })
            | Ok(TickOutcome::Advanced { run_id, status }) => {
                println!("{run_id} {status}");
                if once {
                    return Ok(exit_codes::OK);
                }
                continue;
            }
            Ok(_) if once => return Ok(exit_codes::IDLE),
            Ok(_) => {}
            Err(err) if once => return Err(err),
            Err(err) => warn!(err = %format!("{err:#}"), "tick failed"),
        }
        thread::sleep(interval);
    }
}

fn cmd_run(repo: &Path, cfg: &WorkerConfig, id: &str) -> Result<i32> {
    let orchestrator = build_orchestrator(repo, cfg)?;
    match orchestrator.claim_and_process(id)? {
        TickOutcome::Processed { run_id, status } => {
            println!("{run_id} {status}");
            Ok(exit_codes::OK)
        }
        TickOutcome::NotFound { run_id } => bail!("run {run_id} not found"),
        _ => bail!("run {id} is not queued"),
    }
}

fn cmd_status(repo: &Path, cfg: &WorkerConfig, id: &str, events: bool) -> Result<i32> {
    let store = open_store(repo, cfg)?;
    let run = store.get_run(id)?;
    if events {
        let log = store.events(id)?;
        let patches = store.patches_for_run(id)?;
        print_json(&json!({ "run": run, "patches": patches, "events": log }))?;
    } else {
        print_json(&run)?;
    }
    Ok(exit_codes::OK)
}

#[derive(Debug, Serialize)]
struct CheckReport {
    valid: bool,
    files: Vec<String>,
    validation: ValidationReport,
    risk: Option<RiskAssessment>,
}

fn cmd_check(repo: &Path, cfg: &WorkerConfig, diff: &Path, task: &str) -> Result<i32> {
    let text = if diff == Path::new("-") {
        let mut buf = String::new();
        std::io::stdin()
            .read_to_string(&mut buf)
            .context("read diff from stdin")?;
        buf
    } else {
        fs::read_to_string(diff).with_context(|| format!("read {}", diff.display()))?
    };
    let report = check_diff(repo, cfg, &text, task)?;
    print_json(&report)?;
    Ok(if report.valid {
        exit_codes::OK
    } else {
        exit_codes::REJECTED
    })
}

fn check_diff(repo: &Path, cfg: &WorkerConfig, text: &str, task: &str) -> Result<CheckReport> {
    let files = parse_unified_diff(text).context("parse diff")?;
    let validation = validate_patch(&files, repo, &cfg.patch);
    let valid = validation.is_valid();
    let risk = valid.then(|| {
        let changes: Vec<_> = files.iter().map(FileDiff::to_file_change).collect();
        assess_risk(&changes, task, &cfg.risk)
    });
    Ok(CheckReport {
        valid,
        files: files.iter().map(|file| file.path().to_string()).collect(),
        validation,
        risk,
    })
}

fn open_store(repo: &Path, cfg: &WorkerConfig) -> Result<FileStore> {
    let dir = cfg.store_dir(repo);
    FileStore::open(&dir, cfg.store.lock_timeout())
        .with_context(|| format!("open store {}", dir.display()))
}

fn build_orchestrator(
    repo: &Path,
    cfg: &WorkerConfig,
) -> Result<Orchestrator<FileStore, ProcessRunner, CommandProposer>> {
    let store = open_store(repo, cfg)?;
    let proposer = CommandProposer::from_config(&cfg.proposer, repo)?;
    let worker_id = if cfg.worker.id.is_empty() {
        format!("worker-{}", random_suffix(8))
    } else {
        cfg.worker.id.clone()
    };
    info!(worker_id = %worker_id, repo = %repo.display(), "worker starting");
    let config = OrchestratorConfig::from_worker_config(cfg, repo, &worker_id);
    Ok(Orchestrator::new(store, ProcessRunner, proposer, config))
}

fn random_suffix(len: usize) -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(len)
        .map(char::from)
        .map(|c| c.to_ascii_lowercase())
        .collect()
}

/// Print `value` as pretty JSON on stdout.
fn print_json<T: Serialize>(value: &T) -> Result<()> {
    let payload = serde_json::to_string_pretty(value).context("serialize json")?;
    println!("{payload}");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use worker::test_support::{DiffBuilder, TempRepo};

    #[test]
    fn parse_poll_once_with_global_repo() {
        let cli = Cli::parse_from(["worker", "poll", "--once", "--repo", "/tmp/r"]);
        assert!(matches!(cli.command, Command::Poll { once: true }));
        assert_eq!(cli.repo, PathBuf::from("/tmp/r"));
    }

    #[test]
    fn parse_reject_with_reason() {
        let cli = Cli::parse_from(["worker", "reject", "run-1", "--by", "bob", "--reason", "no"]);
        match cli.command {
            Command::Reject { id, by, reason } => {
                assert_eq!(id, "run-1");
                assert_eq!(by, "bob");
                assert_eq!(reason.as_deref(), Some("no"));
            }
            _ => panic!("expected reject"),
        }
    }

    #[test]
    fn parse_enqueue_task_flag() {
        let cli = Cli::parse_from(["worker", "enqueue", "--task", "fix it"]);
        assert!(matches!(cli.command, Command::Enqueue { task } if task == "fix it"));
    }

    #[test]
    fn approve_requires_approver() {
        assert!(Cli::try_parse_from(["worker", "approve", "run-1"]).is_err());
    }

    #[test]
    fn check_scores_valid_diff_and_rejects_secrets() {
        let repo = TempRepo::new();
        let cfg = WorkerConfig::default();
        let ok = DiffBuilder::new().added_file("src/a.ts", &["x"]).build();
        let report = check_diff(repo.path(), &cfg, &ok, "add a").expect("check");
        assert!(report.valid);
        assert!(report.risk.is_some());
        assert_eq!(report.files, vec!["src/a.ts".to_string()]);

        let bad = DiffBuilder::new().added_file(".env", &["SECRET=1"]).build();
        let report = check_diff(repo.path(), &cfg, &bad, "").expect("check");
        assert!(!report.valid);
        assert!(report.risk.is_none());
    }

    #[test]
    fn random_suffix_is_lowercase_alphanumeric() {
        let suffix = random_suffix(12);
        assert_eq!(suffix.len(), 12);
        assert!(
            suffix
                .chars()
                .all(|c| c.is_ascii_digit() || c.is_ascii_lowercase())
        );
    }
}
