//! External stage process execution.
//!
//! A [`ProcessRunner`] launches one [`StageCommand`], streams both of its
//! output pipes into the job log line by line, and turns the exit status into
//! a [`StageOutcome`] or a [`JobError::StageFailed`].

use std::fmt;
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::cancellation::{kill_group, terminate, CancellationRegistry};
use super::error::{JobError, Result};
use super::job::JobUpdate;
use super::store::JobStore;

/// Default time a cancelled stage gets to exit after SIGTERM.
pub const DEFAULT_KILL_GRACE: Duration = Duration::from_secs(10);

/// One external command: program, ordered arguments, working directory and
/// extra environment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StageCommand {
    pub program: String,
    pub args: Vec<String>,
    pub cwd: Option<PathBuf>,
    pub env: Vec<(String, String)>,
}

impl StageCommand {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            cwd: None,
            env: Vec::new(),
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn current_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.cwd = Some(dir.into());
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    fn to_command(&self) -> Command {
        let mut command = Command::new(&self.program);
        command
            .args(&self.args)
            .envs(self.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(cwd) = &self.cwd {
            command.current_dir(cwd);
        }
        // Own process group, so cancellation reaches the stage's children.
        #[cfg(unix)]
        command.process_group(0);
        command
    }
}

impl fmt::Display for StageCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.program)?;
        for arg in &self.args {
            write!(f, " {}", arg)?;
        }
        Ok(())
    }
}

/// How a stage ended when it did not fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StageOutcome {
    /// Exited with status zero
    Completed,
    /// Cancellation was observed; the exit status is irrelevant
    Canceled,
}

#[derive(Debug, Clone, Copy)]
enum StreamTag {
    Stdout,
    Stderr,
}

impl StreamTag {
    fn as_str(&self) -> &'static str {
        match self {
            StreamTag::Stdout => "stdout",
            StreamTag::Stderr => "stderr",
        }
    }
}

/// Runs stage commands for jobs, logging their output into the job store.
pub struct ProcessRunner {
    store: Arc<dyn JobStore>,
    registry: Arc<CancellationRegistry>,
    kill_grace: Duration,
}

impl ProcessRunner {
    pub fn new(
        store: Arc<dyn JobStore>,
        registry: Arc<CancellationRegistry>,
        kill_grace: Duration,
    ) -> Self {
        Self {
            store,
            registry,
            kill_grace,
        }
    }

    /// Run one stage to completion or cancellation.
    ///
    /// The live process is visible to the registry from launch until it has
    /// exited. Output still buffered when cancellation is observed is dropped.
    pub async fn run(
        &self,
        job_id: Uuid,
        stage: &StageCommand,
        token: &CancellationToken,
    ) -> Result<StageOutcome> {
        if token.is_cancelled() {
            return Ok(StageOutcome::Canceled);
        }

        let command_line = stage.to_string();
        let mut child = stage
            .to_command()
            .spawn()
            .map_err(|source| JobError::Spawn {
                command: command_line.clone(),
                source,
            })?;

        let pid = child.id();
        let _live = self.registry.track_process(job_id, pid);
        info!(job_id = %job_id, pid = ?pid, command = %command_line, "stage started");

        let stdout = child.stdout.take();
        let stderr = child.stderr.take();
        let (out, err) = tokio::join!(
            self.drain(job_id, stdout, StreamTag::Stdout, token),
            self.drain(job_id, stderr, StreamTag::Stderr, token),
        );

        let status = tokio::select! {
            status = child.wait() => status?,
            _ = token.cancelled() => self.stop(job_id, &mut child).await?,
        };

        if token.is_cancelled() {
            info!(job_id = %job_id, status = %status, "stage stopped by cancellation");
            return Ok(StageOutcome::Canceled);
        }
        out?;
        err?;

        if status.success() {
            info!(job_id = %job_id, command = %command_line, "stage finished");
            Ok(StageOutcome::Completed)
        } else {
            warn!(job_id = %job_id, status = %status, command = %command_line, "stage failed");
            Err(JobError::StageFailed {
                code: status.code(),
                command: command_line,
            })
        }
    }

    /// Append each non-empty line of one pipe to the job log until EOF or
    /// until cancellation is observed.
    async fn drain<R>(
        &self,
        job_id: Uuid,
        pipe: Option<R>,
        tag: StreamTag,
        token: &CancellationToken,
    ) -> Result<()>
    where
        R: AsyncRead + Unpin,
    {
        let Some(pipe) = pipe else {
            return Ok(());
        };
        let mut reader = BufReader::new(pipe);
        let mut buf = Vec::new();

        loop {
            if token.is_cancelled() {
                debug!(job_id = %job_id, stream = tag.as_str(), "drain stopped by cancellation");
                return Ok(());
            }

            buf.clear();
            let read = tokio::select! {
                read = reader.read_until(b'\n', &mut buf) => read?,
                _ = token.cancelled() => continue,
            };
            if read == 0 {
                return Ok(());
            }

            let text = String::from_utf8_lossy(&buf);
            let line = text.trim_end();
            if line.is_empty() {
                continue;
            }
            self.store
                .update(job_id, JobUpdate::log(format!("[{}] {}", tag.as_str(), line)))
                .await?;
        }
    }

    /// SIGTERM, then SIGKILL once the grace period runs out.
    async fn stop(&self, job_id: Uuid, child: &mut Child) -> Result<ExitStatus> {
        let signalled = child.id().is_some_and(terminate);
        if !signalled && !cfg!(unix) {
            if let Err(e) = child.start_kill() {
                debug!(job_id = %job_id, error = %e, "stage already gone");
            }
        }

        match tokio::time::timeout(self.kill_grace, child.wait()).await {
            Ok(status) => Ok(status?),
            Err(_) => {
                warn!(
                    job_id = %job_id,
                    grace_secs = self.kill_grace.as_secs_f64(),
                    "stage ignored termination, killing"
                );
                if let Some(pid) = child.id() {
                    kill_group(pid);
                }
                if let Err(e) = child.start_kill() {
                    debug!(job_id = %job_id, error = %e, "stage already gone");
                }
                Ok(child.wait().await?)
            }
        }
    }
}
