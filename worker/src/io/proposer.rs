//! Patch proposal seam.
//!
//! The worker never generates code itself. A [`Proposer`] turns the task plus
//! gathered context into a unified diff; [`CommandProposer`] delegates that to
//! an external command speaking JSON over stdin/stdout.

use std::path::{Path, PathBuf};
use std::process::Command;
use std::time::Duration;

use anyhow::{Context, Result, anyhow, bail};
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument};

use crate::core::types::{VerificationSummary, truncate_chars};
use crate::io::config::ProposerConfig;
use crate::io::process::{NON_INTERACTIVE_ENV, run_command_with_timeout};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProposalRequest {
    pub run_id: String,
    pub task: String,
    /// Plain-text digest of the context tool results.
    pub context: String,
    pub verification: VerificationSummary,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Proposal {
    pub summary: String,
    pub diff: String,
    #[serde(default)]
    pub reasoning: String,
}

pub trait Proposer: Send + Sync {
    fn propose(&self, request: &ProposalRequest) -> Result<Proposal>;
}

#[derive(Debug, Clone)]
pub struct CommandProposer {
    command: Vec<String>,
    cwd: PathBuf,
    timeout: Duration,
    output_limit_bytes: usize,
}

impl CommandProposer {
    pub fn from_config(cfg: &ProposerConfig, cwd: &Path) -> Result<Self> {
        if cfg.command.is_empty() {
            bail!("proposer.command is not configured");
        }
        Ok(Self {
            command: cfg.command.clone(),
            cwd: cwd.to_path_buf(),
            timeout: Duration::from_secs(cfg.timeout_secs),
            output_limit_bytes: cfg.output_limit_bytes,
        })
    }
}

impl Proposer for CommandProposer {
    #[instrument(skip_all, fields(run_id = %request.run_id, program = %self.command[0]))]
    fn propose(&self, request: &ProposalRequest) -> Result<Proposal> {
        let (program, args) = self
            .command
            .split_first()
            .ok_or_else(|| anyhow!("proposer.command is empty"))?;
        let mut cmd = Command::new(program);
        cmd.args(args).current_dir(&self.cwd);
        for (key, value) in NON_INTERACTIVE_ENV {
            cmd.env(key, value);
        }

        let input = serde_json::to_vec(request).context("serialize proposal request")?;
        let output = run_command_with_timeout(cmd, Some(input), self.timeout, self.output_limit_bytes)
            .context("run proposer")?;

        if output.timed_out {
            bail!(
                "proposer timed out after {}s",
                self.timeout.as_secs()
            );
        }
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            bail!(
                "proposer exited with code {}: {}",
                output.status.code().unwrap_or(1),
                truncate_chars(stderr.trim(), 500)
            );
        }
        if output.stdout_truncated > 0 {
            bail!(
                "proposal output exceeded {} bytes",
                self.output_limit_bytes
            );
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        let proposal = parse_proposal(&stdout)?;
        debug!(diff_bytes = proposal.diff.len(), "proposal received");
        Ok(proposal)
    }
}

/// Parse proposal JSON, accepting log noise before a final JSON line.
pub fn parse_proposal(stdout: &str) -> Result<Proposal> {
    let trimmed = stdout.trim();
    let proposal: Proposal = match serde_json::from_str(trimmed) {
        Ok(proposal) => proposal,
        Err(full_err) => {
            let last = trimmed.lines().rev().find(|line| !line.trim().is_empty());
            match last.map(serde_json::from_str::<Proposal>) {
                Some(Ok(proposal)) => proposal,
                _ => return Err(anyhow!(full_err).context("parse proposal json")),
            }
        }
    };
    if proposal.diff.trim().is_empty() {
        bail!("proposal contains an empty diff");
    }
    Ok(proposal)
}
