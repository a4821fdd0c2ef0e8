use std::{collections::VecDeque, sync::Arc, time::Duration};

use autodev_db::{
    DbService,
    models::execution_log::{ExecutionLog, LogEntry, LogLevel, LogSource},
};
use autodev_executors::{
    protocol::{AgentEvent, parse_agent_line},
    spawn::{LineSource, OutputLine},
};
use chrono::Utc;
use tokio::sync::{Notify, mpsc};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::events::{EventBus, topics};

/// Soft cap on buffered-but-unwritten lines per execution before shedding.
pub const BUFFER_SOFT_LIMIT: usize = 10_000;

/// How many trailing stderr lines to keep for failure summaries.
const STDERR_TAIL_LINES: usize = 20;

#[derive(Debug, Clone, Copy)]
pub struct LogPipelineConfig {
    pub batch_size: usize,
    pub batch_interval: Duration,
    pub buffer_soft_limit: usize,
}

impl Default for LogPipelineConfig {
    fn default() -> Self {
        Self {
            batch_size: 100,
            batch_interval: Duration::from_millis(250),
            buffer_soft_limit: BUFFER_SOFT_LIMIT,
        }
    }
}

/// What a finished pipeline run hands back to the dispatcher.
#[derive(Debug, Clone, Default)]
pub struct PipelineSummary {
    pub lines_total: i64,
    pub lines_dropped: u64,
    /// Trailing stderr, used as the failure message for a failed agent.
    pub stderr_tail: Vec<String>,
    /// Last plan envelope seen on stdout, if any.
    pub plan: Option<autodev_executors::protocol::PlanOutput>,
}

/// Default level classifier: stderr is warn, "error" anywhere makes it
/// error, "debug" makes it debug, the rest is info.
pub fn classify_line(source: LineSource, content: &str) -> LogLevel {
    let lower = content.to_lowercase();
    if lower.contains("error") {
        LogLevel::Error
    } else if source == LineSource::Stderr {
        LogLevel::Warn
    } else if lower.contains("debug") {
        LogLevel::Debug
    } else {
        LogLevel::Info
    }
}

/// Turns a supervised child's merged output stream into durable,
/// deduplicated, broadcast ExecutionLog rows.
///
/// Collector and writer are separate workers: the collector numbers and
/// classifies lines into an in-memory buffer, the writer drains batches
/// into the upsert and publishes `execution_log.created`. When the writer
/// falls behind the soft cap, debug lines shed first, then info; error
/// lines never shed.
pub struct LogPipeline {
    db: DbService,
    events: Arc<EventBus>,
    config: LogPipelineConfig,
}

struct Shared {
    buffer: std::sync::Mutex<VecDeque<LogEntry>>,
    notify: Notify,
}

impl LogPipeline {
    pub fn new(db: DbService, events: Arc<EventBus>, config: LogPipelineConfig) -> Self {
        Self { db, events, config }
    }

    /// Attach to one execution's output. The returned handle resolves with
    /// a [`PipelineSummary`] after the stream closes and the buffer drains.
    ///
    /// `progress_tx` receives structured agent tokens as they stream by.
    pub fn spawn(
        &self,
        execution_id: Uuid,
        mut output: mpsc::Receiver<OutputLine>,
        progress_tx: Option<mpsc::UnboundedSender<AgentEvent>>,
    ) -> tokio::task::JoinHandle<PipelineSummary> {
        let db = self.db.clone();
        let events = self.events.clone();
        let config = self.config;

        tokio::spawn(async move {
            let shared = Arc::new(Shared {
                buffer: std::sync::Mutex::new(VecDeque::new()),
                notify: Notify::new(),
            });
            let collector_done = CancellationToken::new();

            // writer: drain batches on size or interval, upsert, broadcast
            let writer = {
                let shared = shared.clone();
                let done = collector_done.clone();
                let db = db.clone();
                let events = events.clone();
                tokio::spawn(async move {
                    loop {
                        let batch: Vec<LogEntry> = {
                            let mut buffer = shared.buffer.lock().unwrap_or_else(|e| e.into_inner());
                            let take = buffer.len().min(config.batch_size);
                            buffer.drain(..take).collect()
                        };

                        if batch.is_empty() {
                            if done.is_cancelled() {
                                break;
                            }
                            tokio::select! {
                                _ = shared.notify.notified() => {}
                                _ = tokio::time::sleep(config.batch_interval) => {}
                                _ = done.cancelled() => {}
                            }
                            continue;
                        }

                        if let Err(e) = ExecutionLog::batch_upsert(&db.pool, &batch).await {
                            tracing::error!("log batch upsert failed for {execution_id}: {e}");
                            continue;
                        }
                        events.publish(
                            topics::EXECUTION_LOG_CREATED,
                            "execution_log.created",
                            serde_json::json!({
                                "execution_id": execution_id,
                                "logs": batch,
                            }),
                        );

                        if batch.len() < config.batch_size {
                            // partially full batch: pace the next drain
                            tokio::select! {
                                _ = shared.notify.notified() => {}
                                _ = tokio::time::sleep(config.batch_interval) => {}
                            }
                        }
                    }
                })
            };

            // collector: number, classify, parse structured tokens, shed
            let mut line_no: i64 = 0;
            let mut dropped: u64 = 0;
            let mut stderr_tail: VecDeque<String> = VecDeque::with_capacity(STDERR_TAIL_LINES);
            let mut plan = None;

            while let Some(line) = output.recv().await {
                if line.source == LineSource::Stderr {
                    if stderr_tail.len() == STDERR_TAIL_LINES {
                        stderr_tail.pop_front();
                    }
                    stderr_tail.push_back(line.content.clone());
                }
                if line.source == LineSource::Stdout
                    && let Some(event) = parse_agent_line(&line.content)
                {
                    if let AgentEvent::Plan(p) = &event {
                        plan = Some(p.clone());
                    }
                    if let Some(tx) = &progress_tx {
                        let _ = tx.send(event);
                    }
                }

                line_no += 1;
                let entry = LogEntry {
                    execution_id,
                    line: line_no,
                    level: classify_line(line.source, &line.content),
                    source: match line.source {
                        LineSource::Stdout => LogSource::Stdout,
                        LineSource::Stderr => LogSource::Stderr,
                    },
                    message: line.content,
                    metadata: None,
                    logged_at: Utc::now(),
                };

                {
                    let mut buffer = shared.buffer.lock().unwrap_or_else(|e| e.into_inner());
                    buffer.push_back(entry);
                    if buffer.len() > config.buffer_soft_limit {
                        let shed = shed_lines(&mut buffer);
                        if shed > 0 {
                            dropped += shed;
                            line_no += 1;
                            buffer.push_back(LogEntry {
                                execution_id,
                                line: line_no,
                                level: LogLevel::Error,
                                source: LogSource::System,
                                message: format!(
                                    "log buffer overflow: dropped {shed} buffered lines"
                                ),
                                metadata: None,
                                logged_at: Utc::now(),
                            });
                        }
                    }
                }
                shared.notify.notify_one();
            }

            // stream closed: let the writer drain what's left
            collector_done.cancel();
            shared.notify.notify_one();
            let _ = writer.await;

            PipelineSummary {
                lines_total: line_no,
                lines_dropped: dropped,
                stderr_tail: stderr_tail.into_iter().collect(),
                plan,
            }
        })
    }
}

/// Drop debug lines first, then info. Warn and error always survive.
fn shed_lines(buffer: &mut VecDeque<LogEntry>) -> u64 {
    let before = buffer.len();
    buffer.retain(|e| e.level != LogLevel::Debug);
    if buffer.len() == before {
        buffer.retain(|e| e.level != LogLevel::Info);
    }
    (before - buffer.len()) as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifier_follows_the_substring_rules() {
        assert_eq!(
            classify_line(LineSource::Stdout, "compiling autodev v0.4.2"),
            LogLevel::Info
        );
        assert_eq!(
            classify_line(LineSource::Stderr, "warning: unused import"),
            LogLevel::Warn
        );
        assert_eq!(
            classify_line(LineSource::Stdout, "ERROR: cannot open file"),
            LogLevel::Error
        );
        assert_eq!(
            classify_line(LineSource::Stderr, "error[E0308]: mismatched types"),
            LogLevel::Error
        );
        assert_eq!(
            classify_line(LineSource::Stdout, "debug: cache miss"),
            LogLevel::Debug
        );
    }

    #[test]
    fn shedding_spares_warn_and_error() {
        let mut buffer: VecDeque<LogEntry> = (0..10)
            .map(|i| LogEntry {
                execution_id: Uuid::new_v4(),
                line: i,
                level: match i % 4 {
                    0 => LogLevel::Debug,
                    1 => LogLevel::Info,
                    2 => LogLevel::Warn,
                    _ => LogLevel::Error,
                },
                source: LogSource::Stdout,
                message: String::new(),
                metadata: None,
                logged_at: Utc::now(),
            })
            .collect();

        // first pass drops only debug
        let shed = shed_lines(&mut buffer);
        assert_eq!(shed, 3);
        assert!(buffer.iter().all(|e| e.level != LogLevel::Debug));

        // second pass falls through to info
        let shed = shed_lines(&mut buffer);
        assert_eq!(shed, 3);
        assert!(
            buffer
                .iter()
                .all(|e| matches!(e.level, LogLevel::Warn | LogLevel::Error))
        );
    }
}
