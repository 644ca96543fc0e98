//! # External Process Runner
//!
//! Runs the speech-to-text engine (and the optional audio converter) as a
//! child process and collects its output in memory.
//!
//! ## Execution Rules:
//! - Arguments go straight to `execve`; no shell is involved
//! - stdout and stderr are captured fully (engine output is a few hundred KB at most)
//! - Cancellation kills the child and reaps it before returning
//! - Cancellation also stops waiting on pipes a background grandchild keeps open
//! - A child whose owner is dropped mid-run is killed (`kill_on_drop`)

use std::fmt;
use std::future::Future;
use std::io;
use std::path::Path;
use std::process::Stdio;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Captured result of one process execution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessOutcome {
    /// Exit status; -1 when the process was terminated by a signal
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
}

impl ProcessOutcome {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

/// Why a process run produced no [`ProcessOutcome`].
#[derive(Debug)]
pub enum RunError {
    /// The executable could not be started (missing, not executable, ...)
    Spawn { program: String, source: io::Error },
    /// Waiting on the child or reading its pipes failed
    Io { program: String, source: io::Error },
    /// The cancellation token fired; the child (if any) was killed
    Cancelled,
}

impl fmt::Display for RunError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RunError::Spawn { program, source } => {
                write!(f, "Failed to start '{}': {}", program, source)
            }
            RunError::Io { program, source } => {
                write!(f, "I/O error while running '{}': {}", program, source)
            }
            RunError::Cancelled => write!(f, "Process run cancelled"),
        }
    }
}

impl std::error::Error for RunError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            RunError::Spawn { source, .. } | RunError::Io { source, .. } => Some(source),
            RunError::Cancelled => None,
        }
    }
}

/// Something that can execute a program with arguments.
///
/// The production implementation is [`CommandRunner`]; tests substitute
/// scripted runners to drive the pipeline deterministically.
pub trait ProcessRunner: Send + Sync {
    fn run(
        &self,
        program: &Path,
        args: &[String],
        cancel: &CancellationToken,
    ) -> impl Future<Output = Result<ProcessOutcome, RunError>> + Send;
}

/// Runs processes with `tokio::process`.
#[derive(Debug, Clone, Copy, Default)]
pub struct CommandRunner;

impl ProcessRunner for CommandRunner {
    async fn run(
        &self,
        program: &Path,
        args: &[String],
        cancel: &CancellationToken,
    ) -> Result<ProcessOutcome, RunError> {
        let program_name = program.display().to_string();

        if cancel.is_cancelled() {
            return Err(RunError::Cancelled);
        }

        tracing::debug!(program = %program_name, ?args, "Spawning process");

        let mut child = Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| RunError::Spawn {
                program: program_name.clone(),
                source,
            })?;

        let mut stdout = child.stdout.take().map(drain);
        let mut stderr = child.stderr.take().map(drain);

        // The pipes can outlive the child when it leaves a background process
        // holding them open, so cancellation has to cover the reads as well.
        tokio::select! {
            outcome = finish(&mut child, &mut stdout, &mut stderr, &program_name) => outcome,
            _ = cancel.cancelled() => {
                if let Ok(None) = child.try_wait() {
                    tracing::info!(program = %program_name, pid = ?child.id(), "Cancellation requested, killing process");
                    if let Err(e) = child.kill().await {
                        tracing::warn!(program = %program_name, error = %e, "Failed to kill process");
                    }
                } else {
                    tracing::info!(program = %program_name, "Cancellation requested while reading output");
                }
                abort(stdout);
                abort(stderr);
                Err(RunError::Cancelled)
            }
        }
    }
}

type Reader = JoinHandle<io::Result<Vec<u8>>>;

/// Waits for the child to exit and both pipes to reach end of file.
async fn finish(
    child: &mut Child,
    stdout: &mut Option<Reader>,
    stderr: &mut Option<Reader>,
    program: &str,
) -> Result<ProcessOutcome, RunError> {
    let status = child.wait().await.map_err(|source| RunError::Io {
        program: program.to_string(),
        source,
    })?;

    let stdout = collect(stdout, program).await?;
    let stderr = collect(stderr, program).await?;
    let exit_code = status.code().unwrap_or(-1);

    tracing::debug!(
        program = %program,
        exit_code,
        stdout_bytes = stdout.len(),
        stderr_bytes = stderr.len(),
        "Process exited"
    );

    Ok(ProcessOutcome {
        exit_code,
        stdout,
        stderr,
    })
}

fn drain<R>(mut pipe: R) -> Reader
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut buf = Vec::new();
        pipe.read_to_end(&mut buf).await?;
        Ok(buf)
    })
}

fn abort(reader: Option<Reader>) {
    if let Some(handle) = reader {
        handle.abort();
    }
}

async fn collect(reader: &mut Option<Reader>, program: &str) -> Result<String, RunError> {
    let Some(handle) = reader.as_mut() else {
        return Ok(String::new());
    };

    let bytes = handle
        .await
        .map_err(|e| io::Error::new(io::ErrorKind::Other, e))
        .and_then(|read| read)
        .map_err(|source| RunError::Io {
            program: program.to_string(),
            source,
        })?;

    Ok(String::from_utf8_lossy(&bytes).into_owned())
}
