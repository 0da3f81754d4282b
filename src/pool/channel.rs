//! Spawns a worker subprocess and exchanges protocol messages over its stdio.
//!
//! The channel owns the child process. Stdin carries coordinator messages,
//! stdout carries worker messages, one JSON object per line; stderr is
//! inherited so worker logs reach the host's logging setup unchanged.

use std::process::Stdio;
use std::time::Duration;

use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::time::timeout;
use tracing::{debug, warn};

use crate::pool::worker_pool::WorkerPoolConfig;
use crate::protocol::{CoordinatorMessage, WorkerMessage, METHOD_ENV, WORKER_ID_ENV};

/// Grace period between closing a worker's stdin and killing it.
const TERMINATE_GRACE: Duration = Duration::from_secs(5);

/// Errors on the coordinator side of a worker IPC link.
#[derive(Debug, Error)]
pub enum ChannelError {
    /// The worker program could not be started.
    #[error("Failed to spawn worker process: {0}")]
    SpawnFailed(String),

    /// The worker closed its side of the link (usually by exiting).
    #[error("Worker disconnected (exit code {exit_code:?}, signal {signal:?})")]
    Disconnected {
        exit_code: Option<i32>,
        signal: Option<i32>,
    },

    /// I/O failure on the link itself.
    #[error("I/O error on worker link: {0}")]
    Io(#[from] std::io::Error),

    /// The worker sent something that is not a protocol message.
    #[error("Malformed message from worker: {0}")]
    Decode(#[from] serde_json::Error),
}

/// Bidirectional message link to one live worker subprocess.
pub struct WorkerChannel {
    child: Child,
    stdin: ChildStdin,
    reader: BufReader<ChildStdout>,
}

impl WorkerChannel {
    /// Spawns the configured worker program and wires up its stdio.
    ///
    /// The method name and worker index travel via environment variables;
    /// the worker validates the method before requesting any work.
    pub async fn spawn(config: &WorkerPoolConfig, worker_id: usize) -> Result<Self, ChannelError> {
        let mut command = Command::new(&config.worker_program);
        command
            .args(&config.worker_args)
            .env(METHOD_ENV, &config.method)
            .env(WORKER_ID_ENV, worker_id.to_string())
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit());

        let mut child = command
            .spawn()
            .map_err(|e| ChannelError::SpawnFailed(e.to_string()))?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| ChannelError::SpawnFailed("failed to capture stdin".to_string()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| ChannelError::SpawnFailed("failed to capture stdout".to_string()))?;

        debug!(
            worker = worker_id,
            pid = child.id(),
            program = %config.worker_program.display(),
            "Spawned worker subprocess"
        );

        Ok(Self {
            child,
            stdin,
            reader: BufReader::new(stdout),
        })
    }

    /// Sends one message, newline-terminated and flushed.
    pub async fn send(&mut self, message: &CoordinatorMessage) -> Result<(), ChannelError> {
        let mut line = serde_json::to_string(message)?;
        line.push('\n');
        self.stdin.write_all(line.as_bytes()).await?;
        self.stdin.flush().await?;
        Ok(())
    }

    /// Receives the next message from the worker.
    ///
    /// EOF means the worker exited; the returned `Disconnected` error
    /// carries the exit code and, on Unix, the terminating signal.
    pub async fn recv(&mut self) -> Result<WorkerMessage, ChannelError> {
        let mut line = String::new();
        let bytes_read = self.reader.read_line(&mut line).await?;
        if bytes_read == 0 {
            let (exit_code, signal) = self.wait_exit().await;
            return Err(ChannelError::Disconnected { exit_code, signal });
        }
        Ok(serde_json::from_str(line.trim_end())?)
    }

    /// Closes stdin so the worker sees EOF and exits on its own, then waits
    /// briefly before resorting to a kill.
    pub async fn terminate(mut self) {
        if let Err(e) = self.stdin.shutdown().await {
            debug!(error = %e, "Failed to close worker stdin");
        }
        match timeout(TERMINATE_GRACE, self.child.wait()).await {
            Ok(Ok(status)) => debug!(?status, "Worker exited after stdin close"),
            Ok(Err(e)) => warn!(error = %e, "Failed to reap worker process"),
            Err(_) => {
                warn!("Worker did not exit after stdin close, killing");
                if let Err(e) = self.child.kill().await {
                    warn!(error = %e, "Failed to kill worker process");
                }
            }
        }
    }

    pub fn pid(&self) -> Option<u32> {
        self.child.id()
    }

    async fn wait_exit(&mut self) -> (Option<i32>, Option<i32>) {
        // EOF almost always means the process is already gone; the timeout
        // guards against a worker that closed stdout but lingers.
        match timeout(TERMINATE_GRACE, self.child.wait()).await {
            Ok(Ok(status)) => exit_details(&status),
            Ok(Err(e)) => {
                warn!(error = %e, "Failed to reap worker after EOF");
                (None, None)
            }
            Err(_) => {
                let _ = self.child.start_kill();
                (None, None)
            }
        }
    }
}

impl Drop for WorkerChannel {
    fn drop(&mut self) {
        // Cannot await in drop; start the kill and let the runtime reap it.
        let _ = self.child.start_kill();
    }
}

fn exit_details(status: &std::process::ExitStatus) -> (Option<i32>, Option<i32>) {
    #[cfg(unix)]
    let signal = {
        use std::os::unix::process::ExitStatusExt;
        status.signal()
    };
    #[cfg(not(unix))]
    let signal = None;

    (status.code(), signal)
}
