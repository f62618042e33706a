//! Child process execution with timeouts, bounded output and log streaming.

use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::sync::mpsc::{self, RecvTimeoutError, Sender};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Context, Result, anyhow};
use chrono::{DateTime, Utc};
use tracing::{debug, error, instrument, warn};
use wait_timeout::ChildExt;

use crate::core::chunker::LogChunker;
use crate::io::config::CommandConfig;

/// Environment applied to every verification command.
pub const NON_INTERACTIVE_ENV: [(&str, &str); 3] =
    [("NO_COLOR", "1"), ("FORCE_COLOR", "0"), ("CI", "true")];

/// How long to keep draining output after killing a timed-out child.
const KILL_DRAIN_GRACE: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandSpec {
    pub program: String,
    pub args: Vec<String>,
    pub cwd: PathBuf,
    pub env: Vec<(String, String)>,
}

impl CommandSpec {
    pub fn new(program: impl Into<String>, args: Vec<String>, cwd: &Path) -> Self {
        Self {
            program: program.into(),
            args,
            cwd: cwd.to_path_buf(),
            env: NON_INTERACTIVE_ENV
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        }
    }

    pub fn display(&self) -> String {
        std::iter::once(self.program.as_str())
            .chain(self.args.iter().map(String::as_str))
            .collect::<Vec<_>>()
            .join(" ")
    }

    fn to_command(&self) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args).current_dir(&self.cwd);
        for (key, value) in &self.env {
            cmd.env(key, value);
        }
        cmd
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamSettings {
    pub timeout: Duration,
    pub flush_interval: Duration,
    pub chunk_bytes: usize,
    pub output_limit_bytes: usize,
}

impl From<&CommandConfig> for StreamSettings {
    fn from(cfg: &CommandConfig) -> Self {
        Self {
            timeout: cfg.timeout(),
            flush_interval: cfg.flush_interval(),
            chunk_bytes: cfg.chunk_bytes,
            output_limit_bytes: cfg.output_limit_bytes,
        }
    }
}

/// Sealed outcome of a streamed command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandResult {
    /// Unknown exit codes (signals, kills) are reported as 1.
    pub exit_code: i32,
    /// Stored log lines, capped by `output_limit_bytes`.
    pub logs: Vec<String>,
    pub timed_out: bool,
    pub truncated_bytes: usize,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

impl CommandResult {
    pub fn success(&self) -> bool {
        self.exit_code == 0 && !self.timed_out
    }

    /// A synthetic failure for a command that could not be started.
    pub fn launch_failure(spec: &CommandSpec, err: &std::io::Error, at: DateTime<Utc>) -> Self {
        Self {
            exit_code: 1,
            logs: vec![format!("failed to launch {}: {err}", spec.display())],
            timed_out: false,
            truncated_bytes: 0,
            started_at: at,
            finished_at: at,
        }
    }
}

/// Execution seam for verification commands.
pub trait CommandRunner: Send + Sync {
    /// Run `spec` to completion, calling `on_chunk` for each flushed chunk of
    /// merged stdout/stderr.
    fn run_streaming(
        &self,
        spec: &CommandSpec,
        settings: &StreamSettings,
        on_chunk: &mut dyn FnMut(&str),
    ) -> Result<CommandResult>;
}

/// Runs real child processes.
#[derive(Debug, Default, Clone, Copy)]
pub struct ProcessRunner;

impl CommandRunner for ProcessRunner {
    fn run_streaming(
        &self,
        spec: &CommandSpec,
        settings: &StreamSettings,
        on_chunk: &mut dyn FnMut(&str),
    ) -> Result<CommandResult> {
        run_streaming(spec, settings, on_chunk)
    }
}

/// Run a command with stdout and stderr merged into one chunked stream.
///
/// Chunks are flushed every `flush_interval` or as soon as `chunk_bytes` are
/// buffered. The child is killed once `timeout` elapses.
#[instrument(skip_all, fields(command = %spec.display(), timeout_secs = settings.timeout.as_secs()))]
pub fn run_streaming(
    spec: &CommandSpec,
    settings: &StreamSettings,
    on_chunk: &mut dyn FnMut(&str),
) -> Result<CommandResult> {
    let started_at = Utc::now();
    let started = Instant::now();
    let deadline = started + settings.timeout;

    let mut cmd = spec.to_command();
    cmd.stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());

    debug!("spawning child process");
    let mut child = match cmd.spawn() {
        Ok(child) => child,
        Err(err) => {
            error!(err = %err, "failed to spawn command");
            return Ok(CommandResult::launch_failure(spec, &err, started_at));
        }
    };

    let (tx, rx) = mpsc::channel::<Vec<u8>>();
    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| anyhow!("stdout was not piped"))?;
    let stderr = child
        .stderr
        .take()
        .ok_or_else(|| anyhow!("stderr was not piped"))?;
    spawn_forwarder(stdout, tx.clone());
    spawn_forwarder(stderr, tx);

    let mut chunker = LogChunker::new(settings.chunk_bytes);
    let mut captured = BoundedBuffer::new(settings.output_limit_bytes);
    let mut next_flush = Instant::now() + settings.flush_interval;
    let mut killed_at: Option<Instant> = None;

    loop {
        let now = Instant::now();
        if killed_at.is_none() && now >= deadline {
            warn!(
                timeout_secs = settings.timeout.as_secs(),
                "command timed out, killing"
            );
            kill(&mut child)?;
            killed_at = Some(now);
        }
        let hard_stop = killed_at.map_or(deadline, |at| at + KILL_DRAIN_GRACE);
        let wake = next_flush.min(hard_stop);

        match rx.recv_timeout(wake.saturating_duration_since(now)) {
            Ok(bytes) => {
                captured.push(&bytes);
                chunker.push(&bytes);
                for chunk in chunker.drain_full() {
                    on_chunk(&chunk);
                }
            }
            Err(RecvTimeoutError::Timeout) => {
                if killed_at.is_some() && Instant::now() >= hard_stop {
                    debug!("output still open after kill; giving up on drain");
                    break;
                }
            }
            Err(RecvTimeoutError::Disconnected) => break,
        }

        if Instant::now() >= next_flush {
            for chunk in chunker.flush_interval() {
                on_chunk(&chunk);
            }
            next_flush = Instant::now() + settings.flush_interval;
        }
    }

    for chunk in chunker.finish() {
        on_chunk(&chunk);
    }

    let status = match killed_at {
        Some(_) => child.wait().context("wait command after kill")?,
        None => wait_until(&mut child, deadline, &mut killed_at)?,
    };
    let timed_out = killed_at.is_some();

    let (mut logs, truncated_bytes) = captured.into_lines();
    if truncated_bytes > 0 {
        warn!(truncated_bytes, "output truncated");
        logs.push(format!("[output truncated {truncated_bytes} bytes]"));
    }
    if timed_out {
        logs.push(format!(
            "[command timed out after {}s]",
            settings.timeout.as_secs()
        ));
    }

    let exit_code = if timed_out { 1 } else { exit_code(status) };
    debug!(exit_code, timed_out, "command finished");
    Ok(CommandResult {
        exit_code,
        logs,
        timed_out,
        truncated_bytes,
        started_at,
        finished_at: Utc::now(),
    })
}

fn wait_until(
    child: &mut Child,
    deadline: Instant,
    killed_at: &mut Option<Instant>,
) -> Result<ExitStatus> {
    let remaining = deadline.saturating_duration_since(Instant::now());
    match child.wait_timeout(remaining).context("wait for command")? {
        Some(status) => Ok(status),
        None => {
            warn!("command outlived its output streams, killing");
            kill(child)?;
            *killed_at = Some(Instant::now());
            child.wait().context("wait command after kill")
        }
    }
}

fn kill(child: &mut Child) -> Result<()> {
    match child.kill() {
        Ok(()) => Ok(()),
        // Already exited between the deadline check and the kill.
        Err(err) if err.kind() == std::io::ErrorKind::InvalidInput => Ok(()),
        Err(err) => Err(err).context("kill command"),
    }
}

fn exit_code(status: ExitStatus) -> i32 {
    status.code().unwrap_or(1)
}

fn spawn_forwarder<R: Read + Send + 'static>(mut reader: R, tx: Sender<Vec<u8>>) {
    thread::spawn(move || {
        let mut buf = [0u8; 8192];
        loop {
            match reader.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => {
                    if tx.send(buf[..n].to_vec()).is_err() {
                        break;
                    }
                }
                Err(err) if err.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(err) => {
                    debug!(err = %err, "output reader stopped");
                    break;
                }
            }
        }
    });
}

/// Keeps the first `limit` bytes and counts the rest.
#[derive(Debug)]
struct BoundedBuffer {
    buf: Vec<u8>,
    limit: usize,
    truncated: usize,
}

impl BoundedBuffer {
    fn new(limit: usize) -> Self {
        Self {
            buf: Vec::new(),
            limit,
            truncated: 0,
        }
    }

    fn push(&mut self, bytes: &[u8]) {
        let remaining = self.limit.saturating_sub(self.buf.len());
        let keep = bytes.len().min(remaining);
        self.buf.extend_from_slice(&bytes[..keep]);
        self.truncated += bytes.len() - keep;
    }

    fn into_lines(self) -> (Vec<String>, usize) {
        let text = String::from_utf8_lossy(&self.buf);
        (text.lines().map(str::to_string).collect(), self.truncated)
    }
}

/// Captured output of a non-streaming command.
#[derive(Debug)]
pub struct CommandOutput {
    pub status: ExitStatus,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    pub stdout_truncated: usize,
    pub stderr_truncated: usize,
    pub timed_out: bool,
}

/// Run a command with a timeout and capture stdout/stderr without risking pipe deadlocks.
///
/// Output is read concurrently while the child runs, and stdin is written from
/// its own thread. `output_limit_bytes` bounds the stdout/stderr kept in memory
/// (bytes beyond it are discarded while still draining the pipe).
#[instrument(skip_all, fields(timeout_secs = timeout.as_secs(), output_limit_bytes))]
pub fn run_command_with_timeout(
    mut cmd: Command,
    stdin: Option<Vec<u8>>,
    timeout: Duration,
    output_limit_bytes: usize,
) -> Result<CommandOutput> {
    if stdin.is_some() {
        cmd.stdin(Stdio::piped());
    } else {
        cmd.stdin(Stdio::null());
    }
    cmd.stdout(Stdio::piped()).stderr(Stdio::piped());

    debug!("spawning child process");
    let mut child = match cmd.spawn() {
        Ok(c) => c,
        Err(e) => {
            error!(err = %e, "failed to spawn command");
            return Err(e).context("spawn command");
        }
    };

    let stdin_handle = match stdin {
        Some(input) => {
            let mut child_stdin = child
                .stdin
                .take()
                .ok_or_else(|| anyhow!("stdin was not piped"))?;
            Some(thread::spawn(move || {
                // A child that exits without reading stdin closes the pipe.
                if let Err(err) = child_stdin.write_all(&input) {
                    debug!(err = %err, "stdin write stopped early");
                }
            }))
        }
        None => None,
    };

    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| anyhow!("stdout was not piped"))?;
    let stderr = child
        .stderr
        .take()
        .ok_or_else(|| anyhow!("stderr was not piped"))?;

    let stdout_handle = thread::spawn(move || read_stream_limited(stdout, output_limit_bytes));
    let stderr_handle = thread::spawn(move || read_stream_limited(stderr, output_limit_bytes));

    let mut timed_out = false;
    let status = match child.wait_timeout(timeout).context("wait for command")? {
        Some(status) => status,
        None => {
            warn!(
                timeout_secs = timeout.as_secs(),
                "command timed out, killing"
            );
            timed_out = true;
            kill(&mut child)?;
            child.wait().context("wait command after kill")?
        }
    };

    if let Some(handle) = stdin_handle
        && handle.join().is_err()
    {
        warn!("stdin writer thread panicked");
    }
    let (stdout, stdout_truncated) = join_output(stdout_handle).context("join stdout")?;
    let (stderr, stderr_truncated) = join_output(stderr_handle).context("join stderr")?;

    if stdout_truncated > 0 || stderr_truncated > 0 {
        warn!(stdout_truncated, stderr_truncated, "output truncated");
    }

    debug!(exit_code = ?status.code(), timed_out, "command finished");
    Ok(CommandOutput {
        status,
        stdout,
        stderr,
        stdout_truncated,
        stderr_truncated,
        timed_out,
    })
}

fn join_output(handle: thread::JoinHandle<Result<(Vec<u8>, usize)>>) -> Result<(Vec<u8>, usize)> {
    match handle.join() {
        Ok(result) => result,
        Err(_) => Err(anyhow!("output reader thread panicked")),
    }
}

fn read_stream_limited<R: Read>(mut reader: R, limit: usize) -> Result<(Vec<u8>, usize)> {
    let mut buf = BoundedBuffer::new(limit);
    let mut chunk = [0u8; 8192];

    loop {
        let n = reader.read(&mut chunk).context("read output")?;
        if n == 0 {
            break;
        }
        buf.push(&chunk[..n]);
    }

    Ok((buf.buf, buf.truncated))
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    fn settings() -> StreamSettings {
        StreamSettings {
            timeout: Duration::from_secs(10),
            flush_interval: Duration::from_millis(100),
            chunk_bytes: 1024,
            output_limit_bytes: 100_000,
        }
    }

    fn sh(script: &str, cwd: &Path) -> CommandSpec {
        CommandSpec::new("sh", vec!["-c".to_string(), script.to_string()], cwd)
    }

    #[test]
    fn merges_stdout_and_stderr_and_reports_exit_code() {
        let temp = tempfile::tempdir().expect("tempdir");
        let mut chunks = Vec::new();
        let result = run_streaming(
            &sh("echo out; echo err 1>&2; exit 3", temp.path()),
            &settings(),
            &mut |chunk| chunks.push(chunk.to_string()),
        )
        .expect("run");
        assert_eq!(result.exit_code, 3);
        assert!(!result.success());
        let joined = chunks.concat();
        assert!(joined.contains("out\n") && joined.contains("err\n"));
        assert_eq!(result.logs.len(), 2);
    }

    #[test]
    fn applies_non_interactive_env() {
        let temp = tempfile::tempdir().expect("tempdir");
        let mut chunks = Vec::new();
        let result = run_streaming(
            &sh("echo \"$CI $NO_COLOR $FORCE_COLOR\"", temp.path()),
            &settings(),
            &mut |chunk| chunks.push(chunk.to_string()),
        )
        .expect("run");
        assert!(result.success());
        assert_eq!(chunks.concat(), "true 1 0\n");
    }

    #[test]
    fn long_single_line_streams_in_bounded_chunks() {
        let temp = tempfile::tempdir().expect("tempdir");
        let mut chunks = Vec::new();
        let result = run_streaming(
            &sh(
                "head -c 153600 /dev/zero | tr '\\0' 'x'",
                temp.path(),
            ),
            &settings(),
            &mut |chunk| chunks.push(chunk.to_string()),
        )
        .expect("run");
        assert!(result.success());
        assert!(chunks.iter().all(|chunk| chunk.len() <= 1024));
        let joined = chunks.concat();
        assert_eq!(joined.len(), 153_600);
        assert!(joined.bytes().all(|b| b == b'x'));
    }

    #[test]
    fn stored_logs_are_capped_with_notice() {
        let temp = tempfile::tempdir().expect("tempdir");
        let mut streamed = 0usize;
        let result = run_streaming(
            &sh("for i in 1 2 3 4 5 6 7 8 9 10; do echo 0123456789; done", temp.path()),
            &StreamSettings {
                output_limit_bytes: 22,
                ..settings()
            },
            &mut |chunk| streamed += chunk.len(),
        )
        .expect("run");
        assert_eq!(streamed, 110);
        assert_eq!(result.truncated_bytes, 88);
        assert_eq!(
            result.logs,
            vec![
                "0123456789".to_string(),
                "0123456789".to_string(),
                "[output truncated 88 bytes]".to_string(),
            ]
        );
    }

    #[test]
    fn timeout_kills_and_fails() {
        let temp = tempfile::tempdir().expect("tempdir");
        let started = Instant::now();
        let result = run_streaming(
            &sh("sleep 30", temp.path()),
            &StreamSettings {
                timeout: Duration::from_millis(300),
                ..settings()
            },
            &mut |_| {},
        )
        .expect("run");
        assert!(result.timed_out);
        assert_eq!(result.exit_code, 1);
        assert!(started.elapsed() < Duration::from_secs(10));
    }

    #[test]
    fn launch_failure_is_synthetic_result() {
        let temp = tempfile::tempdir().expect("tempdir");
        let spec = CommandSpec::new("definitely-not-a-real-binary-xyz", Vec::new(), temp.path());
        let result = run_streaming(&spec, &settings(), &mut |_| {}).expect("run");
        assert_eq!(result.exit_code, 1);
        assert_eq!(result.logs.len(), 1);
        assert!(result.logs[0].starts_with("failed to launch definitely-not-a-real-binary-xyz"));
    }

    #[test]
    fn captured_run_passes_stdin() {
        let mut cmd = Command::new("cat");
        cmd.stdin(Stdio::null());
        let output = run_command_with_timeout(
            cmd,
            Some(b"hello".to_vec()),
            Duration::from_secs(10),
            1024,
        )
        .expect("run");
        assert!(output.status.success());
        assert_eq!(output.stdout, b"hello");
        assert!(!output.timed_out);
    }
}
