use crate::error::{KeeperError, Result};
use async_trait::async_trait;
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Default grace period between SIGTERM and SIGKILL for a cancelled command
pub const DEFAULT_STOP_TIMEOUT: Duration = Duration::from_secs(60);

/// How long output is still read after the command exits
///
/// Processes left behind by the command may hold the pipes open.
pub const OUTPUT_DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

/// Description of a single external command invocation
#[derive(Debug, Clone)]
pub struct CommandSpec {
    name: String,
    program: OsString,
    args: Vec<OsString>,
    cwd: Option<PathBuf>,
    capture_stdout: bool,
    cancel: Option<CancellationToken>,
}

impl CommandSpec {
    /// Create a command. `name` labels the forwarded output lines.
    pub fn new(name: impl Into<String>, program: impl Into<OsString>) -> Self {
        Self {
            name: name.into(),
            program: program.into(),
            args: Vec::new(),
            cwd: None,
            capture_stdout: false,
            cancel: None,
        }
    }

    pub fn arg(mut self, arg: impl Into<OsString>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<OsString>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn current_dir(mut self, dir: impl AsRef<Path>) -> Self {
        self.cwd = Some(dir.as_ref().to_path_buf());
        self
    }

    /// Keep stdout lines in the returned output in addition to logging them
    pub fn capture_stdout(mut self) -> Self {
        self.capture_stdout = true;
        self
    }

    /// Terminate the child when `token` is cancelled
    pub fn cancel_on(mut self, token: CancellationToken) -> Self {
        self.cancel = Some(token);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn program(&self) -> &OsString {
        &self.program
    }

    pub fn arguments(&self) -> &[OsString] {
        &self.args
    }

    pub fn cwd(&self) -> Option<&Path> {
        self.cwd.as_deref()
    }

    pub fn captures_stdout(&self) -> bool {
        self.capture_stdout
    }

    pub fn cancel_token(&self) -> Option<&CancellationToken> {
        self.cancel.as_ref()
    }

    /// Program and arguments joined with spaces, for logs and test assertions
    pub fn command_line(&self) -> String {
        std::iter::once(&self.program)
            .chain(self.args.iter())
            .map(|part| part.to_string_lossy().into_owned())
            .collect::<Vec<_>>()
            .join(" ")
    }
}

/// Result of a command that exited successfully
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    /// Exit code, `None` when the process was ended by a signal
    pub exit_code: Option<i32>,
    /// Captured stdout, only filled when capture was requested
    pub stdout: String,
}

impl CommandOutput {
    pub fn with_stdout(stdout: impl Into<String>) -> Self {
        Self {
            exit_code: Some(0),
            stdout: stdout.into(),
        }
    }
}

/// Executes external commands on behalf of the supervised tasks
#[async_trait]
pub trait Runner: Send + Sync {
    /// Run `command` to completion.
    ///
    /// Fails when the command cannot be started, its output cannot be
    /// attached, it was cancelled, or it exited with a non-zero status.
    async fn run(&self, command: &CommandSpec) -> Result<CommandOutput>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Stream {
    Stdout,
    Stderr,
}

impl std::fmt::Display for Stream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Stream::Stdout => write!(f, "stdout"),
            Stream::Stderr => write!(f, "stderr"),
        }
    }
}

/// Runner backed by real child processes
#[derive(Debug, Clone)]
pub struct ProcessRunner {
    stop_timeout: Duration,
}

impl ProcessRunner {
    pub fn new(stop_timeout: Duration) -> Self {
        Self { stop_timeout }
    }

    pub fn stop_timeout(&self) -> Duration {
        self.stop_timeout
    }

    /// Ask the child's process group to stop, escalating to SIGKILL after
    /// the stop timeout
    async fn terminate(&self, child: &mut Child, name: &str) -> Result<ExitStatus> {
        if let Some(pid) = child.id() {
            info!("Stopping '{}' (PID: {}) with SIGTERM", name, pid);
            signal_group(pid, GroupSignal::Terminate)
                .map_err(|e| KeeperError::StopError(name.to_string(), e))?;

            match tokio::time::timeout(self.stop_timeout, child.wait()).await {
                Ok(status) => return Ok(status?),
                Err(_) => {
                    warn!(
                        "'{}' did not exit within {:?}, sending SIGKILL",
                        name, self.stop_timeout
                    );
                    signal_group(pid, GroupSignal::Kill)
                        .map_err(|e| KeeperError::StopError(name.to_string(), e))?;
                }
            }
        }

        // kill() is a no-op for a child that has already been reaped
        let _ = child.kill().await;
        Ok(child.wait().await?)
    }
}

impl Default for ProcessRunner {
    fn default() -> Self {
        Self::new(DEFAULT_STOP_TIMEOUT)
    }
}

#[async_trait]
impl Runner for ProcessRunner {
    async fn run(&self, spec: &CommandSpec) -> Result<CommandOutput> {
        let name = spec.name().to_string();
        debug!("Running '{}': {}", name, spec.command_line());

        let mut command = Command::new(spec.program());
        command
            .args(spec.arguments())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        // Own process group: terminal signals do not reach the child directly,
        // and cancellation can stop everything the child started.
        #[cfg(unix)]
        command.process_group(0);

        if let Some(cwd) = spec.cwd() {
            command.current_dir(cwd);
        }

        let mut child = command.spawn().map_err(|source| KeeperError::Spawn {
            name: name.clone(),
            source,
        })?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| KeeperError::Pipe(name.clone()))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| KeeperError::Pipe(name.clone()))?;

        let drain = CancellationToken::new();
        let stdout_task = tokio::spawn(forward_lines(
            name.clone(),
            Stream::Stdout,
            stdout,
            spec.captures_stdout(),
            drain.clone(),
        ));
        let stderr_task = tokio::spawn(forward_lines(
            name.clone(),
            Stream::Stderr,
            stderr,
            false,
            drain.clone(),
        ));

        let mut cancelled = false;
        let status = match spec.cancel_token() {
            Some(token) => {
                tokio::select! {
                    status = child.wait() => status?,
                    _ = token.cancelled() => {
                        cancelled = true;
                        self.terminate(&mut child, &name).await?
                    }
                }
            }
            None => child.wait().await?,
        };

        // Readers end at EOF, or when told to stop once the drain timeout passes
        let readers = async { (stdout_task.await, stderr_task.await) };
        tokio::pin!(readers);
        let (stdout_result, stderr_result) =
            match tokio::time::timeout(OUTPUT_DRAIN_TIMEOUT, &mut readers).await {
                Ok(joined) => joined,
                Err(_) => {
                    warn!(
                        "Output of '{}' still open {:?} after exit, detaching",
                        name, OUTPUT_DRAIN_TIMEOUT
                    );
                    drain.cancel();
                    readers.await
                }
            };
        let captured = stdout_result
            .map_err(|e| KeeperError::Internal(format!("stdout reader for '{}': {}", name, e)))?;
        stderr_result
            .map_err(|e| KeeperError::Internal(format!("stderr reader for '{}': {}", name, e)))?;

        if cancelled {
            info!("'{}' stopped after cancellation ({})", name, status);
            return Err(KeeperError::Cancelled(name));
        }

        if !status.success() {
            warn!("Command '{}' exited with {}", name, status);
            return Err(KeeperError::CommandFailed {
                name,
                status: status.to_string(),
            });
        }

        Ok(CommandOutput {
            exit_code: status.code(),
            stdout: captured,
        })
    }
}

/// Forward each line of `reader` to the log until EOF or `drain` fires,
/// returning captured text
async fn forward_lines<R>(
    name: String,
    stream: Stream,
    reader: R,
    capture: bool,
    drain: CancellationToken,
) -> String
where
    R: AsyncRead + Unpin,
{
    let mut reader = BufReader::new(reader);
    let mut buf = Vec::new();
    let mut captured = String::new();

    loop {
        buf.clear();
        let read = tokio::select! {
            biased;
            _ = drain.cancelled() => break,
            read = reader.read_until(b'\n', &mut buf) => read,
        };
        match read {
            Ok(0) => break,
            Ok(_) => {
                let line = String::from_utf8_lossy(&buf);
                let line = line.trim_end_matches(['\n', '\r']);
                info!("{} {}: {}", name, stream, line);
                if capture {
                    captured.push_str(line);
                    captured.push('\n');
                }
            }
            Err(e) => {
                debug!("Stopped reading {} of '{}': {}", stream, name, e);
                break;
            }
        }
    }

    captured
}

#[derive(Debug, Clone, Copy)]
enum GroupSignal {
    Terminate,
    Kill,
}

#[cfg(unix)]
fn signal_group(pid: u32, signal: GroupSignal) -> std::result::Result<(), String> {
    use nix::sys::signal::{killpg, Signal};
    use nix::unistd::Pid;

    let signal = match signal {
        GroupSignal::Terminate => Signal::SIGTERM,
        GroupSignal::Kill => Signal::SIGKILL,
    };
    let pid = i32::try_from(pid).map_err(|_| format!("PID {} out of range", pid))?;
    match killpg(Pid::from_raw(pid), signal) {
        Ok(()) | Err(nix::errno::Errno::ESRCH) => Ok(()),
        Err(e) => Err(format!("Failed to send {:?}: {}", signal, e)),
    }
}

#[cfg(not(unix))]
fn signal_group(_pid: u32, _signal: GroupSignal) -> std::result::Result<(), String> {
    // No process groups; terminate() falls through to kill()
    Ok(())
}
