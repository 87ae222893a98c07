use anyhow::{Context, Result};
use async_trait::async_trait;
use std::process::Stdio;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout as tokio_timeout, Duration};
use tracing::{debug, error, info, warn};

use crate::commands::timeout::{TimeoutPhase, TimeoutStrategy, TimeoutTracker};

/// Error text reported when a command exceeds its timeout
pub const TIMEOUT_MESSAGE: &str = "Command timed out";

/// How long to keep draining pipes after the process has exited or been killed
const OUTPUT_GRACE: Duration = Duration::from_secs(2);

/// Outcome of a single management-tool invocation
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandResult {
    /// True iff the process exited with status 0 before the timeout
    pub succeeded: bool,
    pub stdout: String,
    pub stderr: Option<String>,
    pub exit_code: Option<i32>,
    pub timed_out: bool,
}

impl CommandResult {
    pub fn success(stdout: impl Into<String>) -> Self {
        Self {
            succeeded: true,
            stdout: stdout.into(),
            exit_code: Some(0),
            ..Self::default()
        }
    }

    pub fn failure(error: impl Into<String>) -> Self {
        Self {
            succeeded: false,
            stderr: Some(error.into()),
            ..Self::default()
        }
    }

    pub fn timeout() -> Self {
        Self {
            timed_out: true,
            ..Self::failure(TIMEOUT_MESSAGE)
        }
    }

    /// Best diagnostic for a failed command: stderr, else stdout, else the exit code.
    pub fn error_text(&self) -> String {
        if let Some(stderr) = self.stderr.as_deref().filter(|s| !s.is_empty()) {
            return stderr.to_string();
        }
        if !self.stdout.is_empty() {
            return self.stdout.clone();
        }
        match self.exit_code {
            Some(code) => format!("Command failed with exit code {}", code),
            None => "Command failed".to_string(),
        }
    }
}

/// Narrow seam between VM operations and the process that performs them.
#[async_trait]
pub trait CommandRunner: Send + Sync {
    /// Run a fully rendered script. Never fails: every failure mode is folded
    /// into the returned [`CommandResult`].
    async fn execute(&self, script: &str) -> CommandResult;
}

/// Runs scripts through an interpreter process with timeout enforcement.
///
/// The script is handed to the interpreter as a single argument after
/// `base_args`; no outer shell is involved.
#[derive(Debug, Clone)]
pub struct CommandExecutor {
    program: String,
    base_args: Vec<String>,
    strategy: TimeoutStrategy,
}

impl CommandExecutor {
    pub fn new(program: impl Into<String>, base_args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            base_args,
            strategy: TimeoutStrategy::default(),
        }
    }

    /// Non-interactive PowerShell (`pwsh -NoProfile ... -Command <script>`)
    pub fn powershell(path: &str, execution_policy: &str) -> Self {
        let base_args = [
            "-NoProfile",
            "-NonInteractive",
            "-ExecutionPolicy",
            execution_policy,
            "-Command",
        ]
        .iter()
        .map(|s| s.to_string())
        .collect();
        Self::new(path, base_args)
    }

    pub fn with_strategy(mut self, strategy: TimeoutStrategy) -> Self {
        self.strategy = strategy;
        self
    }

    pub fn program(&self) -> &str {
        &self.program
    }

    pub fn strategy(&self) -> &TimeoutStrategy {
        &self.strategy
    }

    async fn run(&self, script: &str) -> Result<CommandResult> {
        info!("Executing command: {}", script);

        let tracker = TimeoutTracker::new(self.strategy.clone());

        let mut command = Command::new(&self.program);
        command
            .args(&self.base_args)
            .arg(script)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        // Own process group so a timeout can take down anything the tool forked
        #[cfg(unix)]
        command.process_group(0);

        let mut child = command
            .spawn()
            .with_context(|| format!("failed to spawn {}", self.program))?;
        debug!("Spawned process with PID: {:?}", child.id());

        let stdout = child.stdout.take().context("failed to capture stdout")?;
        let stderr = child.stderr.take().context("failed to capture stderr")?;
        let mut stdout_task = tokio::spawn(read_stream(stdout));
        let mut stderr_task = tokio::spawn(read_stream(stderr));

        let mut last_phase = TimeoutPhase::Normal;
        let status = loop {
            let current_phase = tracker.current_phase();

            if current_phase != last_phase {
                let elapsed = tracker.elapsed().as_secs();
                warn!(
                    "Command entered phase {:?} after {}s (limit {}s)",
                    current_phase,
                    elapsed,
                    self.strategy.timeout_secs
                );
                last_phase = current_phase;
            }

            match current_phase {
                TimeoutPhase::Normal | TimeoutPhase::Warning => {
                    let wait_for = tracker.time_to_next_phase().unwrap_or_default();
                    tokio::select! {
                        result = child.wait() => {
                            break Some(result.context("failed to wait for command")?);
                        }
                        _ = sleep(wait_for) => {}
                    }
                }
                TimeoutPhase::ForceKill => {
                    error!("Command timed out after {}s, killing it", self.strategy.timeout_secs);
                    terminate(&mut child).await;
                    break None;
                }
            }
        };

        let stdout = collect_output("stdout", &mut stdout_task)
            .await
            .unwrap_or_default();
        let stderr = collect_output("stderr", &mut stderr_task)
            .await
            .unwrap_or_default();

        let result = match status {
            None => CommandResult::timeout(),
            Some(status) if status.success() => CommandResult::success(stdout),
            Some(status) => CommandResult {
                succeeded: false,
                stdout,
                stderr: Some(stderr).filter(|s| !s.is_empty()),
                exit_code: status.code(),
                timed_out: false,
            },
        };

        debug!(
            succeeded = result.succeeded,
            exit_code = ?result.exit_code,
            "Command finished"
        );
        Ok(result)
    }
}

#[async_trait]
impl CommandRunner for CommandExecutor {
    async fn execute(&self, script: &str) -> CommandResult {
        match self.run(script).await {
            Ok(result) => result,
            Err(e) => {
                error!("Error executing command: {:#}", e);
                CommandResult::failure(format!("{:#}", e))
            }
        }
    }
}

async fn read_stream<R: AsyncRead + Unpin>(mut reader: R) -> String {
    let mut buf = Vec::new();
    if let Err(e) = reader.read_to_end(&mut buf).await {
        debug!("stopped reading command output: {}", e);
    }
    String::from_utf8_lossy(&buf).trim().to_string()
}

/// Wait up to `OUTPUT_GRACE` for a reader task. `None` when the pipe was
/// still held open (usually by a grandchild) and its output is discarded.
async fn collect_output(stream: &str, task: &mut JoinHandle<String>) -> Option<String> {
    match tokio_timeout(OUTPUT_GRACE, &mut *task).await {
        Ok(Ok(output)) => Some(output),
        Ok(Err(e)) => {
            debug!("{} reader failed: {}", stream, e);
            None
        }
        Err(_) => {
            warn!(
                "{} still open {}s after the command ended, discarding its output",
                stream,
                OUTPUT_GRACE.as_secs()
            );
            task.abort();
            None
        }
    }
}

/// Kill the process group (Unix) and the child itself, then reap it.
async fn terminate(child: &mut Child) {
    #[cfg(unix)]
    {
        use nix::sys::signal::{killpg, Signal};
        use nix::unistd::Pid;

        if let Some(pid) = child.id() {
            debug!("Sending SIGKILL to process group {}", pid);
            if let Err(e) = killpg(Pid::from_raw(pid as i32), Signal::SIGKILL) {
                debug!("killpg failed: {}", e);
            }
        }
    }

    if let Err(e) = child.kill().await {
        debug!("kill failed, reaping instead: {}", e);
        let _ = tokio_timeout(OUTPUT_GRACE, child.wait()).await;
    }
}
