//! Shell-based command execution on the host.

use async_trait::async_trait;
use gantry_core::ports::{CommandOutput, CommandRequest, CommandRunner};
use gantry_core::{Error, Result};
use std::process::Stdio;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tracing::{debug, info, warn};

/// Output line from command execution.
#[derive(Debug, Clone)]
pub struct OutputLine {
    pub label: String,
    pub stream: OutputStream,
    pub content: String,
    pub line_number: u32,
    pub timestamp: chrono::DateTime<chrono::Utc>,
}

/// Output stream type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputStream {
    Stdout,
    Stderr,
}

/// Runs commands through `sh -c` on the local machine.
///
/// Every agent served by this runner is the local host; the agent id only
/// shows up in logs.
#[derive(Debug, Clone)]
pub struct ShellRunner {
    shell: String,
    output_tx: Option<mpsc::Sender<OutputLine>>,
}

impl ShellRunner {
    pub fn new() -> Self {
        Self {
            shell: "sh".to_string(),
            output_tx: None,
        }
    }

    pub fn with_shell(mut self, shell: impl Into<String>) -> Self {
        self.shell = shell.into();
        self
    }

    /// Forward command output to a channel instead of only logging it.
    pub fn with_output(mut self, output_tx: mpsc::Sender<OutputLine>) -> Self {
        self.output_tx = Some(output_tx);
        self
    }

    fn stream_lines<R>(
        &self,
        reader: R,
        stream: OutputStream,
        label: String,
    ) -> tokio::task::JoinHandle<()>
    where
        R: AsyncRead + Unpin + Send + 'static,
    {
        let mut tx = self.output_tx.clone();
        tokio::spawn(async move {
            let mut lines = BufReader::new(reader).lines();
            let mut line_number = 0u32;

            // Keep draining after the receiver goes away so the child never
            // blocks on a full pipe.
            while let Ok(Some(content)) = lines.next_line().await {
                line_number += 1;
                debug!(target: "gantry::output", job = %label, ?stream, "{}", content);
                if let Some(sender) = &tx {
                    let line = OutputLine {
                        label: label.clone(),
                        stream,
                        content,
                        line_number,
                        timestamp: chrono::Utc::now(),
                    };
                    if sender.send(line).await.is_err() {
                        tx = None;
                    }
                }
            }
        })
    }
}

impl Default for ShellRunner {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CommandRunner for ShellRunner {
    async fn execute(&self, request: &CommandRequest) -> Result<CommandOutput> {
        let start = std::time::Instant::now();

        info!(
            agent = %request.agent,
            job = %request.label,
            command = %request.command,
            "Executing shell command"
        );

        let mut cmd = Command::new(&self.shell);
        cmd.arg("-c")
            .arg(&request.command)
            .envs(&request.env)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = &request.working_dir {
            cmd.current_dir(dir);
        }

        let mut child = cmd
            .spawn()
            .map_err(|e| Error::Spawn(format!("{}: {}", request.command, e)))?;

        let stdout_handle = child
            .stdout
            .take()
            .map(|out| self.stream_lines(out, OutputStream::Stdout, request.label.clone()));
        let stderr_handle = child
            .stderr
            .take()
            .map(|err| self.stream_lines(err, OutputStream::Stderr, request.label.clone()));

        let (exit_code, timed_out) = match timeout(request.timeout, child.wait()).await {
            Ok(Ok(status)) => (status.code(), false),
            Ok(Err(e)) => {
                return Err(Error::Internal(format!("failed to wait for process: {}", e)));
            }
            Err(_) => {
                warn!(
                    job = %request.label,
                    timeout_secs = request.timeout.as_secs(),
                    "Command timed out, killing process"
                );
                let _ = child.kill().await;
                (None, true)
            }
        };

        if let Some(handle) = stdout_handle {
            let _ = handle.await;
        }
        if let Some(handle) = stderr_handle {
            let _ = handle.await;
        }

        let duration = start.elapsed();
        debug!(?exit_code, timed_out, duration_ms = duration.as_millis() as u64, "Command completed");

        Ok(CommandOutput {
            exit_code,
            duration,
            timed_out,
        })
    }
}
