//! Worker configuration stored under `.worker/config.toml`.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};

use crate::core::patch_policy::PatchConstraints;
use crate::core::risk::RiskThresholds;

/// Default config location relative to the repository root.
pub const DEFAULT_CONFIG_PATH: &str = ".worker/config.toml";

/// Worker configuration (TOML).
///
/// Every section defaults independently, so a file containing only
/// `[proposer]` is valid.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(default)]
pub struct WorkerConfig {
    pub worker: WorkerSection,
    pub store: StoreConfig,
    pub command: CommandConfig,
    pub verification: VerificationConfig,
    pub patch: PatchConstraints,
    pub risk: RiskThresholds,
    pub retry: RetryConfig,
    pub proposer: ProposerConfig,
    pub context: ContextConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct WorkerSection {
    /// Identity recorded on claimed runs. Empty means "generate one".
    pub id: String,
    pub poll_interval_ms: u64,
}

impl Default for WorkerSection {
    fn default() -> Self {
        Self {
            id: String::new(),
            poll_interval_ms: 2_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct StoreConfig {
    /// Store directory; relative paths resolve against the repository root.
    pub dir: PathBuf,
    /// How long a mutation waits for the store lock before giving up.
    pub lock_timeout_ms: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            dir: PathBuf::from(".worker/store"),
            lock_timeout_ms: 10_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct CommandConfig {
    /// Hard wall-clock limit per verification command.
    pub timeout_secs: u64,
    pub flush_interval_ms: u64,
    pub chunk_bytes: usize,
    /// Cap on log bytes kept on the sealed command record.
    pub output_limit_bytes: usize,
}

impl Default for CommandConfig {
    fn default() -> Self {
        Self {
            timeout_secs: 10 * 60,
            flush_interval_ms: 100,
            chunk_bytes: 1024,
            output_limit_bytes: 100_000,
        }
    }
}

impl StoreConfig {
    pub fn lock_timeout(&self) -> Duration {
        Duration::from_millis(self.lock_timeout_ms)
    }
}

impl CommandConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn flush_interval(&self) -> Duration {
        Duration::from_millis(self.flush_interval_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct VerificationConfig {
    /// `npm`, `pnpm`, `yarn` or `bun`.
    pub package_manager: String,
    /// Explicit argv lists. When non-empty, manifest detection is skipped.
    pub commands: Vec<Vec<String>>,
}

impl Default for VerificationConfig {
    fn default() -> Self {
        Self {
            package_manager: "npm".to_string(),
            commands: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub base_delay_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 200,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ProposerConfig {
    /// Command that reads a proposal request on stdin and prints a proposal.
    pub command: Vec<String>,
    pub timeout_secs: u64,
    pub output_limit_bytes: usize,
}

impl Default for ProposerConfig {
    fn default() -> Self {
        Self {
            command: Vec::new(),
            timeout_secs: 5 * 60,
            output_limit_bytes: 1_000_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ContextConfig {
    pub file_pattern: String,
    pub max_search_terms: usize,
    pub max_open_files: usize,
    pub max_listed_files: usize,
}

impl Default for ContextConfig {
    fn default() -> Self {
        Self {
            file_pattern: "**/*".to_string(),
            max_search_terms: 3,
            max_open_files: 3,
            max_listed_files: 200,
        }
    }
}

impl WorkerConfig {
    pub fn validate(&self) -> Result<()> {
        if self.worker.poll_interval_ms == 0 {
            return Err(anyhow!("worker.poll_interval_ms must be > 0"));
        }
        if self.store.lock_timeout_ms == 0 {
            return Err(anyhow!("store.lock_timeout_ms must be > 0"));
        }
        if self.command.timeout_secs == 0 {
            return Err(anyhow!("command.timeout_secs must be > 0"));
        }
        if self.command.flush_interval_ms == 0 {
            return Err(anyhow!("command.flush_interval_ms must be > 0"));
        }
        if self.command.chunk_bytes == 0 {
            return Err(anyhow!("command.chunk_bytes must be > 0"));
        }
        if self.command.output_limit_bytes == 0 {
            return Err(anyhow!("command.output_limit_bytes must be > 0"));
        }
        if self
            .verification
            .commands
            .iter()
            .any(|argv| argv.first().is_none_or(|program| program.trim().is_empty()))
        {
            return Err(anyhow!(
                "verification.commands entries must be non-empty arrays"
            ));
        }
        if self.patch.max_files == 0 || self.patch.max_total_lines == 0 {
            return Err(anyhow!("patch limits must be > 0"));
        }
        if self.retry.max_attempts == 0 {
            return Err(anyhow!("retry.max_attempts must be > 0"));
        }
        if !self.proposer.command.is_empty() && self.proposer.command[0].trim().is_empty() {
            return Err(anyhow!("proposer.command must start with a program"));
        }
        if self.proposer.timeout_secs == 0 {
            return Err(anyhow!("proposer.timeout_secs must be > 0"));
        }
        if self.proposer.output_limit_bytes == 0 {
            return Err(anyhow!("proposer.output_limit_bytes must be > 0"));
        }
        Ok(())
    }

    /// Store directory resolved against `repo_root`.
    pub fn store_dir(&self, repo_root: &Path) -> PathBuf {
        if self.store.dir.is_absolute() {
            self.store.dir.clone()
        } else {
            repo_root.join(&self.store.dir)
        }
    }
}

/// Load config from a TOML file.
///
/// If the file is missing, returns `WorkerConfig::default()`.
pub fn load_config(path: &Path) -> Result<WorkerConfig> {
    if !path.exists() {
        let cfg = WorkerConfig::default();
        cfg.validate()?;
        return Ok(cfg);
    }
    let contents = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let cfg: WorkerConfig =
        toml::from_str(&contents).with_context(|| format!("parse {}", path.display()))?;
    cfg.validate()
        .with_context(|| format!("validate {}", path.display()))?;
    Ok(cfg)
}

/// Atomically write config to disk (temp file + rename).
pub fn write_config(path: &Path, cfg: &WorkerConfig) -> Result<()> {
    cfg.validate()?;
    let mut buf = toml::to_string_pretty(cfg).context("serialize config toml")?;
    buf.push('\n');
    write_atomic(path, buf.as_bytes())
}

/// Write `contents` next to `path` and rename it into place.
pub fn write_atomic(path: &Path, contents: &[u8]) -> Result<()> {
    let parent = path
        .parent()
        .with_context(|| format!("path missing parent {}", path.display()))?;
    fs::create_dir_all(parent).with_context(|| format!("create directory {}", parent.display()))?;
    let file_name = path
        .file_name()
        .with_context(|| format!("path missing file name {}", path.display()))?;
    let mut tmp_name = file_name.to_os_string();
    tmp_name.push(".tmp");
    let tmp_path = parent.join(tmp_name);
    fs::write(&tmp_path, contents)
        .with_context(|| format!("write temp file {}", tmp_path.display()))?;
    fs::rename(&tmp_path, path).with_context(|| format!("replace {}", path.display()))?;
    Ok(())
}
