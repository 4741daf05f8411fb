//! Supervised transcoder processes.
//!
//! [`TranscoderProcess`] owns exactly one child. Its stderr is drained by a
//! background task into the log so the child never blocks on a full pipe,
//! and the child is killed if the handle is dropped without a clean exit.

use std::path::Path;
use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, ChildStderr, ChildStdout, Command};
use tokio::task::JoinHandle;

use crate::command::program_name;
use crate::{Error, Result};

/// What to do with the child's standard output.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StdoutMode {
    /// Capture stdout so it can be relayed.
    Piped,
    /// The child writes its output elsewhere; stdout goes to the null device.
    Discard,
}

/// How a [`TranscoderProcess::terminate`] call ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Termination {
    /// The process had already exited before termination was requested.
    AlreadyExited(ExitStatus),
    /// The process exited within the grace period after the stop request.
    Graceful(ExitStatus),
    /// The process had to be killed.
    Forced(ExitStatus),
}

impl Termination {
    pub fn status(&self) -> ExitStatus {
        match self {
            Self::AlreadyExited(s) | Self::Graceful(s) | Self::Forced(s) => *s,
        }
    }
}

/// Handle to a running external transcoder.
#[derive(Debug)]
pub struct TranscoderProcess {
    child: Child,
    program: String,
    pid: Option<u32>,
    stdout: Option<ChildStdout>,
    stderr_task: Option<JoinHandle<()>>,
}

impl TranscoderProcess {
    /// Start `binary` with `args`.
    ///
    /// Must be called from within a Tokio runtime; the stderr drain runs as a
    /// spawned task.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Launch`] when the OS refuses to start the process
    /// (missing binary, permission denied, resource exhaustion).
    pub fn launch(binary: &Path, args: &[String], stdout: StdoutMode) -> Result<Self> {
        let program = program_name(binary);

        let mut cmd = Command::new(binary);
        cmd.args(args)
            .stdin(Stdio::null())
            .stdout(match stdout {
                StdoutMode::Piped => Stdio::piped(),
                StdoutMode::Discard => Stdio::null(),
            })
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = cmd.spawn().map_err(|e| Error::launch(program.clone(), e))?;
        let pid = child.id();

        let stderr_task = child
            .stderr
            .take()
            .map(|stderr| tokio::spawn(drain_stderr(stderr, program.clone(), pid)));
        let stdout = child.stdout.take();

        tracing::info!(tool = %program, pid = ?pid, "Launched transcoder");

        Ok(Self {
            child,
            program,
            pid,
            stdout,
            stderr_task,
        })
    }

    /// OS process id, if the process has not been reaped yet.
    pub fn id(&self) -> Option<u32> {
        self.pid
    }

    pub fn program(&self) -> &str {
        &self.program
    }

    /// Take the captured stdout. Returns `None` for [`StdoutMode::Discard`]
    /// or when already taken.
    pub fn take_stdout(&mut self) -> Option<ChildStdout> {
        self.stdout.take()
    }

    /// Non-blocking exit check.
    pub fn try_exit(&mut self) -> Result<Option<ExitStatus>> {
        Ok(self.child.try_wait()?)
    }

    /// Wait for the process to exit on its own.
    pub async fn wait(&mut self) -> Result<ExitStatus> {
        let status = self.child.wait().await?;
        self.log_exit(status);
        Ok(status)
    }

    /// Ask the process to stop, escalating to a kill after `grace`.
    ///
    /// Safe to call on a process that has already exited.
    pub async fn terminate(&mut self, grace: Duration) -> Result<Termination> {
        if let Some(status) = self.child.try_wait()? {
            return Ok(Termination::AlreadyExited(status));
        }

        if self.request_stop() {
            match tokio::time::timeout(grace, self.child.wait()).await {
                Ok(status) => {
                    let status = status?;
                    self.log_exit(status);
                    return Ok(Termination::Graceful(status));
                }
                Err(_) => {
                    tracing::warn!(
                        tool = %self.program,
                        pid = ?self.pid,
                        grace_ms = grace.as_millis() as u64,
                        "Transcoder ignored stop request, killing"
                    );
                }
            }
        }

        if let Err(e) = self.child.start_kill() {
            // Lost a race with a natural exit.
            if let Some(status) = self.child.try_wait()? {
                return Ok(Termination::Graceful(status));
            }
            return Err(Error::Io(e));
        }

        let status = self.child.wait().await?;
        self.log_exit(status);
        Ok(Termination::Forced(status))
    }

    #[cfg(unix)]
    fn request_stop(&self) -> bool {
        use nix::sys::signal::{kill, Signal};
        use nix::unistd::Pid;

        let Some(pid) = self.pid.and_then(|p| i32::try_from(p).ok()) else {
            return false;
        };

        match kill(Pid::from_raw(pid), Signal::SIGTERM) {
            Ok(()) => true,
            Err(e) => {
                tracing::debug!(tool = %self.program, pid, error = %e, "SIGTERM failed");
                false
            }
        }
    }

    #[cfg(not(unix))]
    fn request_stop(&self) -> bool {
        false
    }

    fn log_exit(&self, status: ExitStatus) {
        tracing::info!(
            tool = %self.program,
            pid = ?self.pid,
            code = ?status.code(),
            "Transcoder exited"
        );
    }
}

impl Drop for TranscoderProcess {
    fn drop(&mut self) {
        // The pipe closes with the child; the task ends on its own unless the
        // child left the write end to a grandchild.
        if let Some(task) = self.stderr_task.take() {
            if let Ok(None) = self.child.try_wait() {
                task.abort();
            }
        }
    }
}

async fn drain_stderr(stderr: ChildStderr, program: String, pid: Option<u32>) {
    let mut reader = BufReader::new(stderr);
    let mut line = Vec::with_capacity(256);

    loop {
        line.clear();
        match reader.read_until(b'\n', &mut line).await {
            Ok(0) => break,
            Ok(_) => {
                let text = String::from_utf8_lossy(&line);
                let text = text.trim_end();
                if !text.is_empty() {
                    tracing::debug!(tool = %program, pid = ?pid, "{}", text);
                }
            }
            Err(e) => {
                tracing::debug!(tool = %program, pid = ?pid, error = %e, "stderr read failed");
                break;
            }
        }
    }
}
