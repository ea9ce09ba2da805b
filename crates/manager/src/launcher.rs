//! Starting job processes and waiting for them to exit.
//!
//! Every command runs in its own `datasource-launcher` process so a crashing
//! or leaking handler cannot take the manager down with it.

use std::collections::VecDeque;
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tracing::{debug, info, warn};

use crate::error::LaunchError;
use crate::protocol::JobSpec;

/// How a job process ended.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct JobOutcome {
    pub pid: Option<u32>,
    /// `None` when the process was killed by a signal.
    pub exit_code: Option<i32>,
    pub signal: Option<i32>,
    /// Last lines the process wrote to stderr, oldest first.
    pub stderr_tail: Vec<String>,
}

impl JobOutcome {
    fn from_status(pid: Option<u32>, status: ExitStatus, stderr_tail: Vec<String>) -> Self {
        #[cfg(unix)]
        let signal = std::os::unix::process::ExitStatusExt::signal(&status);
        #[cfg(not(unix))]
        let signal = None;

        Self {
            pid,
            exit_code: status.code(),
            signal,
            stderr_tail,
        }
    }

    pub fn success(&self) -> bool {
        self.exit_code == Some(0)
    }

    /// One-line cause followed by the captured stderr tail.
    pub fn failure_summary(&self) -> String {
        let cause = match (self.exit_code, self.signal) {
            (Some(code), _) => format!("job exited with code {code}"),
            (None, Some(signal)) => format!("job killed by signal {signal}"),
            (None, None) => "job terminated abnormally".to_string(),
        };
        if self.stderr_tail.is_empty() {
            cause
        } else {
            format!("{cause}\n{}", self.stderr_tail.join("\n"))
        }
    }
}

/// Runs a validated job to completion.
#[async_trait]
pub trait JobLauncher: Send + Sync {
    /// Start the job and wait for it to finish. An `Err` means the job never
    /// ran; a job that ran and failed is an `Ok` with a failed outcome.
    async fn launch(&self, job: &JobSpec) -> Result<JobOutcome, LaunchError>;
}

/// Launches jobs as `datasource-launcher` child processes.
#[derive(Debug, Clone)]
pub struct ProcessLauncher {
    program: PathBuf,
    bus_frontend: String,
    settle_ms: u64,
    stderr_tail_lines: usize,
}

impl ProcessLauncher {
    /// `bus_frontend` is handed to each child so its progress reaches the
    /// same broker the manager listens on.
    pub fn new(program: impl Into<PathBuf>, bus_frontend: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            bus_frontend: bus_frontend.into(),
            settle_ms: 300,
            stderr_tail_lines: 20,
        }
    }

    pub fn settle_ms(mut self, settle_ms: u64) -> Self {
        self.settle_ms = settle_ms;
        self
    }

    pub fn stderr_tail_lines(mut self, lines: usize) -> Self {
        self.stderr_tail_lines = lines;
        self
    }

    pub fn program(&self) -> &PathBuf {
        &self.program
    }

    fn command(&self, job: &JobSpec) -> Result<Command, LaunchError> {
        let params = serde_json::to_string(&job.params)?;

        let mut cmd = Command::new(&self.program);
        cmd.arg("--datasource")
            .arg(&job.datasource)
            .arg("--params")
            .arg(params)
            .arg("--progress-channel")
            .arg(&job.progress_channel)
            .arg("--bus-frontend")
            .arg(&self.bus_frontend)
            .arg("--settle-ms")
            .arg(self.settle_ms.to_string())
            .arg("--request-id")
            .arg(job.request_id.to_string())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        Ok(cmd)
    }
}

#[async_trait]
impl JobLauncher for ProcessLauncher {
    async fn launch(&self, job: &JobSpec) -> Result<JobOutcome, LaunchError> {
        let mut child = self.command(job)?.spawn().map_err(|source| LaunchError::Spawn {
            program: self.program.display().to_string(),
            source,
        })?;
        let pid = child.id();
        let request_id = job.request_id;
        info!(%request_id, datasource = %job.datasource, pid, "job process started");

        let stdout_relay = child.stdout.take().map(|stdout| {
            tokio::spawn(relay_lines(stdout, move |line| info!(%request_id, pid, "{line}")))
        });

        let tail_cap = self.stderr_tail_lines;
        let stderr_relay = child.stderr.take().map(|stderr| {
            tokio::spawn(async move {
                let mut tail = VecDeque::with_capacity(tail_cap);
                relay_lines(stderr, |line| {
                    info!(%request_id, pid, "{line}");
                    if tail_cap > 0 {
                        if tail.len() == tail_cap {
                            tail.pop_front();
                        }
                        tail.push_back(line);
                    }
                })
                .await;
                tail
            })
        });

        let status = child.wait().await.map_err(LaunchError::Wait)?;

        if let Some(relay) = stdout_relay {
            let _ = relay.await;
        }
        let stderr_tail = match stderr_relay {
            Some(relay) => relay.await.map(Vec::from).unwrap_or_else(|e| {
                warn!(%request_id, error = %e, "stderr relay failed");
                Vec::new()
            }),
            None => Vec::new(),
        };

        let outcome = JobOutcome::from_status(pid, status, stderr_tail);
        debug!(%request_id, pid, exit_code = ?outcome.exit_code, signal = ?outcome.signal, "job process exited");
        Ok(outcome)
    }
}

/// Hand every line of a child's output to `on_line` until EOF.
///
/// Invalid UTF-8 is replaced rather than ending the relay. The pipe is read
/// to the end even after an error, since closing it early kills the child
/// on its next write.
async fn relay_lines<R>(reader: R, mut on_line: impl FnMut(String))
where
    R: AsyncRead + Unpin,
{
    let mut reader = BufReader::new(reader);
    let mut buf = Vec::new();
    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf).await {
            Ok(0) => break,
            Ok(_) => {
                let line = String::from_utf8_lossy(&buf);
                on_line(line.trim_end_matches(['\n', '\r']).to_string());
            }
            Err(e) => {
                warn!(error = %e, "unreadable job output, discarding the rest");
                let _ = tokio::io::copy(&mut reader, &mut tokio::io::sink()).await;
                break;
            }
        }
    }
}
