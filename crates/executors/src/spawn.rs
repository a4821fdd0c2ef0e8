use std::{collections::HashMap, path::PathBuf, process::Stdio, time::Duration};

use command_group::{AsyncCommandGroup, AsyncGroupChild};
use nix::{
    sys::signal::{Signal, killpg},
    unistd::Pid,
};
use thiserror::Error;
use tokio::{
    io::{AsyncBufReadExt, AsyncWriteExt, BufReader},
    process::Command,
    sync::mpsc,
};

#[derive(Debug, Error)]
pub enum SpawnError {
    #[error("Executable '{0}' not found on PATH")]
    BinaryNotFound(String),
    #[error("Working directory '{0}' does not exist")]
    WorkingDirMissing(PathBuf),
    #[error("Command line is empty")]
    EmptyCommand,
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LineSource {
    Stdout,
    Stderr,
}

/// One line of child output, tagged with the stream it arrived on.
#[derive(Debug, Clone)]
pub struct OutputLine {
    pub source: LineSource,
    pub content: String,
}

/// Everything needed to launch an agent process.
#[derive(Debug, Clone)]
pub struct SpawnSpec {
    pub command: String,
    pub args: Vec<String>,
    pub cwd: PathBuf,
    pub env: HashMap<String, String>,
    /// Written to the child's stdin, which is then closed.
    pub stdin_payload: Option<String>,
}

impl SpawnSpec {
    /// Build a spec from a configured command line ("claude-planner --json"),
    /// splitting it shell-style.
    pub fn from_command_line(
        command_line: &str,
        cwd: PathBuf,
        env: HashMap<String, String>,
        stdin_payload: Option<String>,
    ) -> Result<Self, SpawnError> {
        let mut parts = shlex::split(command_line)
            .unwrap_or_default()
            .into_iter();
        let command = parts.next().ok_or(SpawnError::EmptyCommand)?;
        Ok(Self {
            command,
            args: parts.collect(),
            cwd,
            env,
            stdin_payload,
        })
    }
}

/// A spawned child process group. Output lines from both streams are merged
/// into one channel in arrival order; the receiver side drives the log
/// pipeline's shared line counter.
pub struct SpawnedChild {
    child: AsyncGroupChild,
    pid: u32,
    output: Option<mpsc::Receiver<OutputLine>>,
}

impl std::fmt::Debug for SpawnedChild {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SpawnedChild")
            .field("pid", &self.pid)
            .field("output", &self.output)
            .finish()
    }
}

/// Channel depth between the stream readers and the pipeline. Deep enough
/// that a chatty agent is not immediately backpressured by a slow writer.
const OUTPUT_CHANNEL_DEPTH: usize = 1024;

impl SpawnedChild {
    pub fn pid(&self) -> u32 {
        self.pid
    }

    /// Take the merged output receiver; yields `None` after both streams
    /// close. Can only be taken once.
    pub fn take_output(&mut self) -> Option<mpsc::Receiver<OutputLine>> {
        self.output.take()
    }

    pub async fn wait(&mut self) -> std::io::Result<std::process::ExitStatus> {
        self.child.wait().await
    }

    /// Polite SIGTERM to the process group, escalating to SIGKILL after
    /// `grace`. Safe to call repeatedly; signalling a reaped group is a
    /// no-op.
    pub async fn terminate(&mut self, grace: Duration) -> std::io::Result<std::process::ExitStatus> {
        // ESRCH means the group is already gone, which is fine
        let _ = killpg(Pid::from_raw(self.pid as i32), Signal::SIGTERM);
        let waited = tokio::time::timeout(grace, self.child.wait()).await;
        match waited {
            Ok(status) => status,
            Err(_) => {
                tracing::warn!(pid = self.pid, "grace period expired, sending SIGKILL");
                self.kill().await
            }
        }
    }

    /// Forceful SIGKILL to the whole group.
    pub async fn kill(&mut self) -> std::io::Result<std::process::ExitStatus> {
        self.child.kill().await?;
        self.child.wait().await
    }
}

/// Launch `spec` in its own process group with piped stdio.
///
/// Spawn failures (missing binary, missing cwd) are terminal; the caller
/// maps them to a failed execution without retry.
pub async fn spawn(spec: &SpawnSpec) -> Result<SpawnedChild, SpawnError> {
    let program = which::which(&spec.command)
        .map_err(|_| SpawnError::BinaryNotFound(spec.command.clone()))?;
    if !spec.cwd.is_dir() {
        return Err(SpawnError::WorkingDirMissing(spec.cwd.clone()));
    }

    let mut cmd = Command::new(program);
    cmd.args(&spec.args)
        .current_dir(&spec.cwd)
        .envs(&spec.env)
        .stdin(if spec.stdin_payload.is_some() {
            Stdio::piped()
        } else {
            Stdio::null()
        })
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let mut child = cmd.group_spawn()?;
    let pid = child.id().unwrap_or_default();

    if let Some(payload) = spec.stdin_payload.clone()
        && let Some(mut stdin) = child.inner().stdin.take()
    {
        // written from a task so a child that never reads stdin cannot
        // stall the spawn call
        tokio::spawn(async move {
            if let Err(e) = stdin.write_all(payload.as_bytes()).await {
                tracing::debug!("failed to write agent stdin payload: {e}");
                return;
            }
            let _ = stdin.shutdown().await;
        });
    }

    let (tx, rx) = mpsc::channel(OUTPUT_CHANNEL_DEPTH);

    if let Some(stdout) = child.inner().stdout.take() {
        let tx = tx.clone();
        tokio::spawn(async move {
            let mut lines = BufReader::new(stdout).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                if tx
                    .send(OutputLine {
                        source: LineSource::Stdout,
                        content: line,
                    })
                    .await
                    .is_err()
                {
                    break;
                }
            }
        });
    }
    if let Some(stderr) = child.inner().stderr.take() {
        let tx = tx.clone();
        tokio::spawn(async move {
            let mut lines = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                if tx
                    .send(OutputLine {
                        source: LineSource::Stderr,
                        content: line,
                    })
                    .await
                    .is_err()
                {
                    break;
                }
            }
        });
    }
    drop(tx);

    Ok(SpawnedChild {
        child,
        pid,
        output: Some(rx),
    })
}
