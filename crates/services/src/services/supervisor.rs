use std::{sync::Arc, time::Duration};

use autodev_db::{
    DbService,
    models::execution_process::{ExecutionProcess, ProcessStatus},
};
use autodev_executors::{
    sampler::ProcessSampler,
    spawn::{OutputLine, SpawnError, SpawnSpec, spawn},
};
use dashmap::DashMap;
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum SupervisorError {
    #[error(transparent)]
    Spawn(#[from] SpawnError),
    #[error(transparent)]
    Database(#[from] sqlx::Error),
}

/// How a supervised process ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessOutcome {
    /// Normal exit; non-zero codes are data for the dispatcher, not errors.
    Exited { code: i64 },
    /// Wall-clock limit expired; the group was terminated.
    TimedOut,
    /// Memory cap breached; the group was terminated.
    OomKilled,
    /// Cancellation requested through the supervisor.
    Cancelled,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ProcessLimits {
    pub wall_clock: Option<Duration>,
    pub memory_bytes: Option<u64>,
}

/// Handle returned to the dispatcher for one supervised child.
pub struct SupervisedProcess {
    pub process_id: Uuid,
    pub execution_id: Uuid,
    pub pid: u32,
    output: Option<mpsc::Receiver<OutputLine>>,
    done: watch::Receiver<Option<ProcessOutcome>>,
}

impl SupervisedProcess {
    /// Merged stdout/stderr line stream; can only be taken once.
    pub fn take_output(&mut self) -> Option<mpsc::Receiver<OutputLine>> {
        self.output.take()
    }

    /// Resolves once the child is fully reaped and its Process row is
    /// final; no output or resource sample is written after this returns.
    pub async fn wait(&mut self) -> ProcessOutcome {
        loop {
            if let Some(outcome) = *self.done.borrow() {
                return outcome;
            }
            if self.done.changed().await.is_err() {
                // supervision task died; report as cancelled rather than hang
                return ProcessOutcome::Cancelled;
            }
        }
    }
}

struct RunningEntry {
    cancel: CancellationToken,
    done: watch::Receiver<Option<ProcessOutcome>>,
}

/// Launches agent children, tracks their Process rows, samples CPU/RSS and
/// enforces wall-clock/memory caps. One supervision task per child owns the
/// handle; cancellation arrives via token so nothing contends on the child.
pub struct ProcessSupervisor {
    db: DbService,
    grace_period: Duration,
    sample_interval: Duration,
    running: DashMap<Uuid, RunningEntry>,
}

impl ProcessSupervisor {
    pub fn new(db: DbService, grace_period: Duration, sample_interval: Duration) -> Self {
        Self {
            db,
            grace_period,
            sample_interval,
            running: DashMap::new(),
        }
    }

    /// Spawn `spec` under supervision for `execution_id`.
    ///
    /// The Process row is written (status=starting) before the spawn so a
    /// crash mid-launch stays visible. Spawn failures finalize the row as
    /// `error` and are not retried.
    pub async fn spawn_supervised(
        &self,
        execution_id: Uuid,
        spec: SpawnSpec,
        limits: ProcessLimits,
    ) -> Result<SupervisedProcess, SupervisorError> {
        let process_id = Uuid::new_v4();
        ExecutionProcess::create(
            &self.db.pool,
            process_id,
            execution_id,
            &spec.command,
            &spec.args,
            &spec.cwd.display().to_string(),
            &spec.env,
        )
        .await?;

        let mut child = match spawn(&spec).await {
            Ok(child) => child,
            Err(e) => {
                ExecutionProcess::finish(&self.db.pool, process_id, ProcessStatus::Error, None)
                    .await?;
                return Err(e.into());
            }
        };
        let pid = child.pid();
        ExecutionProcess::mark_running(&self.db.pool, process_id, pid as i64).await?;

        let output = child.take_output();
        let cancel = CancellationToken::new();
        let oom = CancellationToken::new();
        let (done_tx, done_rx) = watch::channel(None);

        // resource sampler; also the memory-cap tripwire
        let sampler_db = self.db.clone();
        let sampler_oom = oom.clone();
        let sample_interval = self.sample_interval;
        let memory_limit = limits.memory_bytes;
        let sampler_task = tokio::spawn(async move {
            let mut sampler = ProcessSampler::new();
            let mut ticker = tokio::time::interval(sample_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            // the first tick fires immediately; skip it so cpu deltas exist
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(sample) = sampler.sample(pid) else {
                    break;
                };
                if let Err(e) = ExecutionProcess::update_resources(
                    &sampler_db.pool,
                    process_id,
                    sample.cpu_percent as f64,
                    sample.memory_bytes as i64,
                )
                .await
                {
                    tracing::warn!("failed to record resource sample: {e}");
                }
                if let Some(limit) = memory_limit
                    && sample.memory_bytes > limit
                {
                    tracing::warn!(
                        pid,
                        rss = sample.memory_bytes,
                        limit,
                        "memory cap breached"
                    );
                    sampler_oom.cancel();
                    break;
                }
            }
        });

        let db = self.db.clone();
        let grace = self.grace_period;
        // "unlimited" is a month; nothing should run that long anyway
        let wall_clock = limits
            .wall_clock
            .unwrap_or(Duration::from_secs(30 * 24 * 3600));
        let task_cancel = cancel.clone();
        tokio::spawn(async move {
            // pick the wake reason first; the child is only touched again
            // once the wait future is dropped
            enum Wake {
                Exited(std::io::Result<std::process::ExitStatus>),
                TimedOut,
                Oom,
                Cancelled,
            }
            let wake = tokio::select! {
                status = child.wait() => Wake::Exited(status),
                _ = tokio::time::sleep(wall_clock) => Wake::TimedOut,
                _ = oom.cancelled() => Wake::Oom,
                _ = task_cancel.cancelled() => Wake::Cancelled,
            };
            let outcome = match wake {
                Wake::Exited(Ok(status)) => ProcessOutcome::Exited {
                    code: status.code().map(i64::from).unwrap_or(-1),
                },
                Wake::Exited(Err(e)) => {
                    tracing::error!(pid, "wait failed: {e}");
                    ProcessOutcome::Exited { code: -1 }
                }
                Wake::TimedOut => {
                    tracing::warn!(pid, "wall clock expired, terminating");
                    let _ = child.terminate(grace).await;
                    ProcessOutcome::TimedOut
                }
                Wake::Oom => {
                    let _ = child.terminate(grace).await;
                    ProcessOutcome::OomKilled
                }
                Wake::Cancelled => {
                    let _ = child.terminate(grace).await;
                    ProcessOutcome::Cancelled
                }
            };

            // stop sampling before the row goes terminal
            sampler_task.abort();

            let (status, exit_code) = match outcome {
                ProcessOutcome::Exited { code } => (ProcessStatus::Stopped, Some(code)),
                ProcessOutcome::TimedOut | ProcessOutcome::OomKilled | ProcessOutcome::Cancelled => {
                    (ProcessStatus::Killed, None)
                }
            };
            if let Err(e) = ExecutionProcess::finish(&db.pool, process_id, status, exit_code).await
            {
                tracing::error!("failed to finalize process row {process_id}: {e}");
            }
            let _ = done_tx.send(Some(outcome));
        });

        self.running.insert(
            execution_id,
            RunningEntry {
                cancel,
                done: done_rx.clone(),
            },
        );

        Ok(SupervisedProcess {
            process_id,
            execution_id,
            pid,
            output,
            done: done_rx,
        })
    }

    /// Request graceful cancellation of an execution's process. Returns
    /// false when nothing is running (already finished: a no-op).
    pub fn cancel(&self, execution_id: Uuid) -> bool {
        match self.running.get(&execution_id) {
            Some(entry) => {
                entry.cancel.cancel();
                true
            }
            None => false,
        }
    }

    pub fn is_running(&self, execution_id: Uuid) -> bool {
        self.running.contains_key(&execution_id)
    }

    /// Drop the registry entry once the dispatcher has fully finalized the
    /// execution.
    pub fn release(&self, execution_id: Uuid) {
        self.running.remove(&execution_id);
    }

    /// Cancel everything and wait up to `timeout` for supervision tasks to
    /// finish. Used by graceful shutdown.
    pub async fn shutdown(&self, timeout: Duration) {
        let entries: Vec<(Uuid, watch::Receiver<Option<ProcessOutcome>>)> = self
            .running
            .iter()
            .map(|e| (*e.key(), e.value().done.clone()))
            .collect();
        for entry in self.running.iter() {
            entry.value().cancel.cancel();
        }
        let drain = async {
            for (execution_id, mut done) in entries {
                while done.borrow().is_none() {
                    if done.changed().await.is_err() {
                        break;
                    }
                }
                tracing::debug!(%execution_id, "supervised process drained");
            }
        };
        if tokio::time::timeout(timeout, drain).await.is_err() {
            tracing::warn!("supervisor shutdown timed out; abandoning stragglers");
        }
    }
}

pub type SharedSupervisor = Arc<ProcessSupervisor>;
