//! Verification pipeline: detect commands, run them in order, stream logs.

use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use chrono::Utc;
use serde_json::{Value, json};
use tracing::{info, instrument, warn};

use crate::core::types::{
    EventType, NewEvent, VerificationCommand, VerificationStatus, VerificationSummary,
};
use crate::core::verification::{
    DetectedCommand, detect_commands, explicit_commands, manifest_scripts,
};
use crate::io::config::VerificationConfig;
use crate::io::process::{CommandResult, CommandRunner, CommandSpec, StreamSettings};
use crate::io::store::Store;
use crate::io::transport::EventSink;

/// Work out which commands verify `repo_root`.
///
/// Explicit `verification.commands` win over manifest detection. An empty
/// result is returned as-is; callers decide what zero commands means.
pub fn detect_for_repo(repo_root: &Path, cfg: &VerificationConfig) -> Result<Vec<DetectedCommand>> {
    if !cfg.commands.is_empty() {
        return Ok(explicit_commands(&cfg.commands));
    }

    let manifest_path = repo_root.join("package.json");
    let scripts = if manifest_path.exists() {
        let contents = fs::read_to_string(&manifest_path)
            .with_context(|| format!("read {}", manifest_path.display()))?;
        let manifest: Value = serde_json::from_str(&contents)
            .with_context(|| format!("parse {}", manifest_path.display()))?;
        manifest_scripts(&manifest)
    } else {
        Default::default()
    };
    let has_tsconfig = repo_root.join("tsconfig.json").exists();
    Ok(detect_commands(&scripts, has_tsconfig, &cfg.package_manager))
}

pub struct VerificationPipeline<'a, S: Store + ?Sized, R: CommandRunner + ?Sized> {
    pub sink: EventSink<'a, S>,
    pub runner: &'a R,
    pub settings: StreamSettings,
    pub repo_root: &'a Path,
}

impl<S: Store + ?Sized, R: CommandRunner + ?Sized> VerificationPipeline<'_, S, R> {
    /// Run every command sequentially. A failing command does not skip the rest.
    #[instrument(skip_all, fields(run_id = %run_id, commands = commands.len()))]
    pub fn run(&self, run_id: &str, commands: &[DetectedCommand]) -> VerificationSummary {
        let names: Vec<String> = commands.iter().map(DetectedCommand::display).collect();
        self.sink
            .emit(
                run_id,
                NewEvent::new(EventType::VerificationStarted, json!({ "commands": names })),
            )
            .ignore_failure("verification progress is telemetry");

        let mut sealed = Vec::with_capacity(commands.len());
        for (index, detected) in commands.iter().enumerate() {
            sealed.push(self.run_one(run_id, index, detected));
        }

        let summary = VerificationSummary::from_commands(sealed);
        info!(passed = summary.passed, "verification finished");
        self.sink
            .emit(
                run_id,
                NewEvent::new(
                    EventType::VerificationCompleted,
                    json!({ "passed": summary.passed, "command_count": summary.commands.len() }),
                ),
            )
            .ignore_failure("verification progress is telemetry");
        summary
    }

    fn run_one(&self, run_id: &str, index: usize, detected: &DetectedCommand) -> VerificationCommand {
        let command = detected.display();
        self.sink
            .emit(
                run_id,
                NewEvent::new(
                    EventType::CommandStarted,
                    json!({ "index": index, "command": command }),
                ),
            )
            .ignore_failure("command progress is telemetry");

        let spec = CommandSpec::new(&detected.program, detected.args.clone(), self.repo_root);
        let mut on_chunk = |chunk: &str| {
            self.sink
                .emit(
                    run_id,
                    NewEvent::new(
                        EventType::LogChunk,
                        json!({ "index": index, "command": command, "chunk": chunk }),
                    ),
                )
                .ignore_failure("log chunks are telemetry");
        };
        let started_at = Utc::now();
        let result = match self.runner.run_streaming(&spec, &self.settings, &mut on_chunk) {
            Ok(result) => result,
            Err(err) => {
                warn!(err = %format!("{err:#}"), command = %command, "command runner failed");
                CommandResult {
                    exit_code: 1,
                    logs: vec![format!("command runner failed: {err:#}")],
                    timed_out: false,
                    truncated_bytes: 0,
                    started_at,
                    finished_at: Utc::now(),
                }
            }
        };

        let status = if result.success() {
            VerificationStatus::Passed
        } else {
            VerificationStatus::Failed
        };
        self.sink
            .emit(
                run_id,
                NewEvent::new(
                    EventType::CommandFinished,
                    json!({
                        "index": index,
                        "command": command,
                        "exit_code": result.exit_code,
                        "timed_out": result.timed_out,
                        "status": status,
                    }),
                ),
            )
            .ignore_failure("command progress is telemetry");

        VerificationCommand {
            command,
            status,
            started_at: Some(result.started_at),
            finished_at: Some(result.finished_at),
            exit_code: Some(result.exit_code),
            logs: result.logs,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::Run;
    use crate::core::verification::CommandRole;
    use crate::io::memory_store::MemoryStore;
    use crate::io::transport::RetryPolicy;
    use crate::test_support::{ScriptedRunner, ScriptedStep};
    use std::time::Duration;

    fn settings() -> StreamSettings {
        StreamSettings {
            timeout: Duration::from_secs(5),
            flush_interval: Duration::from_millis(100),
            chunk_bytes: 1024,
            output_limit_bytes: 10_000,
        }
    }

    fn command(program: &str) -> DetectedCommand {
        DetectedCommand {
            role: CommandRole::Custom,
            program: program.to_string(),
            args: Vec::new(),
        }
    }

    #[test]
    fn failing_typecheck_does_not_skip_tests() {
        let temp = tempfile::tempdir().expect("tempdir");
        let store = MemoryStore::new();
        store.insert_run(Run::queued("r1", "t", Utc::now())).expect("insert");
        let runner = ScriptedRunner::new(vec![
            ScriptedStep::exit(2, &["error TS2322\n"]),
            ScriptedStep::exit(0, &["ok\n"]),
        ]);
        let pipeline = VerificationPipeline {
            sink: EventSink::new(&store, RetryPolicy::immediate(1)),
            runner: &runner,
            settings: settings(),
            repo_root: temp.path(),
        };
        let summary = pipeline.run("r1", &[command("typecheck"), command("test")]);
        assert!(!summary.passed);
        assert_eq!(summary.commands.len(), 2);
        assert_eq!(summary.commands[0].status, VerificationStatus::Failed);
        assert_eq!(summary.commands[1].status, VerificationStatus::Passed);
        assert_eq!(runner.calls().len(), 2);

        let kinds: Vec<EventType> = store
            .events("r1")
            .expect("events")
            .iter()
            .map(|e| e.event_type)
            .collect();
        assert_eq!(
            kinds,
            vec![
                EventType::VerificationStarted,
                EventType::CommandStarted,
                EventType::LogChunk,
                EventType::CommandFinished,
                EventType::CommandStarted,
                EventType::LogChunk,
                EventType::CommandFinished,
                EventType::VerificationCompleted,
            ]
        );
    }

    #[test]
    fn zero_commands_do_not_pass() {
        let temp = tempfile::tempdir().expect("tempdir");
        let store = MemoryStore::new();
        store.insert_run(Run::queued("r1", "t", Utc::now())).expect("insert");
        let runner = ScriptedRunner::new(Vec::new());
        let pipeline = VerificationPipeline {
            sink: EventSink::new(&store, RetryPolicy::immediate(1)),
            runner: &runner,
            settings: settings(),
            repo_root: temp.path(),
        };
        let summary = pipeline.run("r1", &[]);
        assert!(!summary.passed);
        assert!(summary.commands.is_empty());
    }

    #[test]
    fn event_store_outage_does_not_fail_verification() {
        let temp = tempfile::tempdir().expect("tempdir");
        let runner = ScriptedRunner::new(vec![ScriptedStep::exit(0, &["fine\n"])]);
        // No run inserted: every append fails with not-found.
        let store = MemoryStore::new();
        let pipeline = VerificationPipeline {
            sink: EventSink::new(&store, RetryPolicy::immediate(1)),
            runner: &runner,
            settings: settings(),
            repo_root: temp.path(),
        };
        let summary = pipeline.run("missing", &[command("test")]);
        assert!(summary.passed);
    }

    #[test]
    fn detection_reads_package_json_and_tsconfig() {
        let temp = tempfile::tempdir().expect("tempdir");
        fs::write(
            temp.path().join("package.json"),
            r#"{"scripts": {"test": "vitest"}}"#,
        )
        .expect("write");
        fs::write(temp.path().join("tsconfig.json"), "{}").expect("write");
        let detected =
            detect_for_repo(temp.path(), &VerificationConfig::default()).expect("detect");
        let shown: Vec<String> = detected.iter().map(DetectedCommand::display).collect();
        assert_eq!(shown, vec!["npx tsc --noEmit", "npm run test -- --run"]);
    }

    #[test]
    fn explicit_commands_override_detection() {
        let temp = tempfile::tempdir().expect("tempdir");
        fs::write(
            temp.path().join("package.json"),
            r#"{"scripts": {"test": "jest"}}"#,
        )
        .expect("write");
        let cfg = VerificationConfig {
            commands: vec![vec!["make".to_string(), "check".to_string()]],
            ..VerificationConfig::default()
        };
        let detected = detect_for_repo(temp.path(), &cfg).expect("detect");
        assert_eq!(detected.len(), 1);
        assert_eq!(detected[0].display(), "make check");
    }

    #[test]
    fn empty_repo_detects_nothing() {
        let temp = tempfile::tempdir().expect("tempdir");
        let detected =
            detect_for_repo(temp.path(), &VerificationConfig::default()).expect("detect");
        assert!(detected.is_empty());
    }
}
