use std::fmt;
use std::os::unix::process::ExitStatusExt;
use std::path::Path;
use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tokio::sync::{mpsc, watch};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Cancellation — a watch-channel token pair
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Held by whoever may cancel a deployment (the cancel registry).
#[derive(Debug)]
pub struct CancelHandle {
    tx: watch::Sender<bool>,
}

impl CancelHandle {
    pub fn cancel(&self) {
        let _ = self.tx.send(true);
    }
}

/// Threaded into every subprocess invocation of a pipeline run so that
/// cancellation terminates in-flight work, not just a status flag.
#[derive(Debug, Clone)]
pub struct CancelToken {
    rx: Option<watch::Receiver<bool>>,
}

pub fn cancel_pair() -> (CancelHandle, CancelToken) {
    let (tx, rx) = watch::channel(false);
    (CancelHandle { tx }, CancelToken { rx: Some(rx) })
}

impl CancelToken {
    /// A token that never fires, for callers outside a cancellable run.
    pub fn none() -> Self {
        Self { rx: None }
    }

    pub fn is_cancelled(&self) -> bool {
        match &self.rx {
            Some(rx) => *rx.borrow(),
            None => false,
        }
    }

    /// Resolves when the handle fires. Pends forever for a `none()` token
    /// or when the handle is dropped without cancelling.
    pub async fn cancelled(&mut self) {
        match &mut self.rx {
            Some(rx) => {
                if *rx.borrow() {
                    return;
                }
                loop {
                    if rx.changed().await.is_err() {
                        futures_util::future::pending::<()>().await;
                    }
                    if *rx.borrow() {
                        return;
                    }
                }
            }
            None => futures_util::future::pending::<()>().await,
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// CommandError — structured subprocess failure
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Every failed subprocess reduces to this: exit code, signal, whether the
/// process group was killed (timeout or cancellation), and captured stderr.
#[derive(Debug, Clone)]
pub struct CommandError {
    pub command: String,
    pub exit_code: Option<i32>,
    pub signal: Option<i32>,
    pub killed: bool,
    pub stderr: String,
}

impl fmt::Display for CommandError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.killed {
            write!(f, "command '{}' was killed before completing", self.command)
        } else if let Some(code) = self.exit_code {
            write!(f, "command '{}' exited with code {}", self.command, code)
        } else if let Some(signal) = self.signal {
            write!(
                f,
                "command '{}' was terminated by signal {}",
                self.command, signal
            )
        } else {
            write!(
                f,
                "command '{}' failed to start: {}",
                self.command, self.stderr
            )
        }
    }
}

impl std::error::Error for CommandError {}

impl CommandError {
    fn spawn_failure(command: &str, err: std::io::Error) -> Self {
        Self {
            command: command.to_string(),
            exit_code: None,
            signal: None,
            killed: false,
            stderr: err.to_string(),
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// CommandOutput / LogLine
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone)]
pub struct CommandOutput {
    pub stdout: String,
    pub stderr: String,
    /// Both streams in arrival order, capped at the configured byte limit.
    pub combined: String,
    pub truncated: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamKind {
    Stdout,
    Stderr,
}

impl StreamKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Stdout => "stdout",
            Self::Stderr => "stderr",
        }
    }
}

/// One line of live subprocess output, forwarded to an optional sink as it
/// is produced so a log viewer can tail an in-progress step.
#[derive(Debug, Clone)]
pub struct LogLine {
    pub stream: StreamKind,
    pub line: String,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// CommandRunner
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Runs a shell command in its own process group with a timeout and an
/// output cap. Every shell-level side effect of the engine (clone, build,
/// permission fix, container start) goes through here, so every other
/// component's failure semantics reduce to `CommandError`.
#[derive(Debug, Clone)]
pub struct CommandRunner {
    max_output_bytes: usize,
}

const TRUNCATION_MARKER: &str = "[output truncated]";

impl CommandRunner {
    pub fn new(max_output_bytes: usize) -> Self {
        Self { max_output_bytes }
    }

    pub async fn run(
        &self,
        command: &str,
        cwd: &Path,
        timeout: Duration,
        cancel: CancelToken,
    ) -> Result<CommandOutput, CommandError> {
        self.run_with_sink(command, cwd, timeout, cancel, None).await
    }

    /// Like `run`, but forwards every output line to `sink` as it arrives.
    /// Sink delivery is best-effort; a closed sink does not fail the command.
    pub async fn run_with_sink(
        &self,
        command: &str,
        cwd: &Path,
        timeout: Duration,
        mut cancel: CancelToken,
        sink: Option<mpsc::Sender<LogLine>>,
    ) -> Result<CommandOutput, CommandError> {
        let mut cmd = Command::new("sh");
        cmd.arg("-c")
            .arg(command)
            .current_dir(cwd)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        // Detach into a fresh process group so a kill reaches the whole
        // subprocess tree, not just the shell.
        unsafe {
            cmd.pre_exec(|| {
                libc::setpgid(0, 0);
                Ok(())
            });
        }

        let mut child = cmd
            .spawn()
            .map_err(|err| CommandError::spawn_failure(command, err))?;
        let pid = child.id();

        let (tx, mut rx) = mpsc::channel::<LogLine>(64);
        if let Some(stdout) = child.stdout.take() {
            spawn_line_reader(stdout, StreamKind::Stdout, tx.clone());
        }
        if let Some(stderr) = child.stderr.take() {
            spawn_line_reader(stderr, StreamKind::Stderr, tx.clone());
        }
        drop(tx);

        let mut capture = Capture::new(self.max_output_bytes);
        let mut killed = false;
        let mut exit_status: Option<ExitStatus> = None;
        let mut readers_done = false;

        let timeout_fut = tokio::time::sleep(timeout);
        tokio::pin!(timeout_fut);

        while !(readers_done && exit_status.is_some()) {
            tokio::select! {
                maybe_line = rx.recv(), if !readers_done => {
                    match maybe_line {
                        Some(log_line) => {
                            if let Some(sink) = &sink {
                                let _ = sink.send(log_line.clone()).await;
                            }
                            capture.push(log_line);
                        }
                        None => readers_done = true,
                    }
                }
                status = child.wait(), if exit_status.is_none() => {
                    let status = status
                        .map_err(|err| CommandError::spawn_failure(command, err))?;
                    exit_status = Some(status);
                }
                _ = &mut timeout_fut, if !killed => {
                    tracing::warn!(command = %command, timeout = ?timeout, "command timed out, killing process group");
                    kill_process_group(pid);
                    killed = true;
                }
                _ = cancel.cancelled(), if !killed => {
                    tracing::info!(command = %command, "command cancelled, killing process group");
                    kill_process_group(pid);
                    killed = true;
                }
            }
        }

        let status = exit_status.ok_or_else(|| CommandError {
            command: command.to_string(),
            exit_code: None,
            signal: None,
            killed,
            stderr: capture.stderr.clone(),
        })?;

        if killed {
            return Err(CommandError {
                command: command.to_string(),
                exit_code: status.code(),
                signal: status.signal(),
                killed: true,
                stderr: capture.stderr,
            });
        }

        if !status.success() {
            return Err(CommandError {
                command: command.to_string(),
                exit_code: status.code(),
                signal: status.signal(),
                killed: false,
                stderr: capture.stderr,
            });
        }

        Ok(CommandOutput {
            stdout: capture.stdout,
            stderr: capture.stderr,
            combined: capture.combined,
            truncated: capture.truncated,
        })
    }
}

fn spawn_line_reader<R>(reader: R, stream: StreamKind, tx: mpsc::Sender<LogLine>)
where
    R: tokio::io::AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut lines = BufReader::new(reader).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            if tx.send(LogLine { stream, line }).await.is_err() {
                break;
            }
        }
    });
}

fn kill_process_group(pid: Option<u32>) {
    if let Some(pid) = pid {
        unsafe {
            libc::killpg(pid as libc::pid_t, libc::SIGKILL);
        }
    }
}

/// Accumulates capped output. Lines past the cap are dropped (the reader
/// keeps draining the pipes so the child never blocks on a full buffer).
struct Capture {
    max_bytes: usize,
    captured: usize,
    truncated: bool,
    stdout: String,
    stderr: String,
    combined: String,
}

impl Capture {
    fn new(max_bytes: usize) -> Self {
        Self {
            max_bytes,
            captured: 0,
            truncated: false,
            stdout: String::new(),
            stderr: String::new(),
            combined: String::new(),
        }
    }

    fn push(&mut self, log_line: LogLine) {
        if self.truncated {
            return;
        }
        let bytes = log_line.line.len() + 1;
        if self.captured + bytes > self.max_bytes {
            self.truncated = true;
            self.combined.push_str(TRUNCATION_MARKER);
            self.combined.push('\n');
            return;
        }
        self.captured += bytes;
        let target = match log_line.stream {
            StreamKind::Stdout => &mut self.stdout,
            StreamKind::Stderr => &mut self.stderr,
        };
        target.push_str(&log_line.line);
        target.push('\n');
        self.combined.push_str(&log_line.line);
        self.combined.push('\n');
    }
}
