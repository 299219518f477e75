use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use async_trait::async_trait;
use faultline_analysis::AnalysisError;
use faultline_config::PipelineConfig;
use faultline_core::unix_timestamp_millis;
use faultline_infer::InferError;
use faultline_store::{
    COUNTER_QUARANTINED, ClaimRequest, PartitionAssignment, QueueMessage, QueueName, SqliteStore,
    StoreError,
};
use tokio::sync::watch;
use tokio::time::sleep;
use tracing::{debug, error, info, warn};

/// What the worker does with a message after its handler returns.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ItemOutcome {
    Ack,
    /// Transient failure: make the message visible again after `delay_ms`.
    Retry { delay_ms: i64, reason: String },
    /// Malformed input: counted and acknowledged, since redelivery cannot help.
    Quarantine { reason: String },
    /// Persistent or invariant failure: moved to the dead-letter table with its payload.
    DeadLetter { reason: String },
}

/// Per-item failure classes shared by the stage handlers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StageFailure {
    Transient(String),
    Malformed(String),
    Invariant(String),
}

impl StageFailure {
    pub fn into_outcome(self, retry_delay_ms: i64) -> ItemOutcome {
        match self {
            Self::Transient(reason) => ItemOutcome::Retry {
                delay_ms: retry_delay_ms,
                reason,
            },
            Self::Malformed(reason) => ItemOutcome::Quarantine { reason },
            Self::Invariant(reason) => ItemOutcome::DeadLetter { reason },
        }
    }
}

impl From<StoreError> for StageFailure {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NamespaceMismatch { .. } => Self::Invariant(err.to_string()),
            other => Self::Transient(other.to_string()),
        }
    }
}

impl From<AnalysisError> for StageFailure {
    fn from(err: AnalysisError) -> Self {
        match err {
            AnalysisError::Invariant(message) => Self::Invariant(message),
            AnalysisError::EmptyVector => Self::Malformed(err.to_string()),
            AnalysisError::Store(store) => store.into(),
            other => Self::Transient(other.to_string()),
        }
    }
}

impl From<InferError> for StageFailure {
    fn from(err: InferError) -> Self {
        Self::Transient(err.to_string())
    }
}

impl From<serde_json::Error> for StageFailure {
    fn from(err: serde_json::Error) -> Self {
        Self::Transient(format!("failed to encode queue payload: {err}"))
    }
}

#[async_trait]
pub trait StageHandler: Send + Sync {
    fn name(&self) -> &'static str;

    /// Processes one message. Must never panic on bad input; every failure maps to an outcome.
    async fn handle(&self, message: &QueueMessage, now: i64) -> ItemOutcome;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct BatchSummary {
    pub claimed: usize,
    pub acked: usize,
    pub retried: usize,
    pub quarantined: usize,
    pub dead_lettered: usize,
    pub abandoned: usize,
}

/// Competing consumer for one queue and one slice of its partitions.
pub struct StageWorker {
    store: Arc<SqliteStore>,
    handler: Arc<dyn StageHandler>,
    queue: QueueName,
    assignment: PartitionAssignment,
    consumer: String,
    batch_size: usize,
    visibility_ms: i64,
    max_attempts: u32,
    poll_interval: Duration,
    shutdown: watch::Receiver<bool>,
}

impl StageWorker {
    pub fn new(
        store: Arc<SqliteStore>,
        handler: Arc<dyn StageHandler>,
        queue: QueueName,
        assignment: PartitionAssignment,
        pipeline: &PipelineConfig,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        Self {
            consumer: format!(
                "{}-{}-of-{}",
                queue.as_str(),
                assignment.consumer_index,
                assignment.consumer_count
            ),
            store,
            handler,
            queue,
            assignment,
            batch_size: pipeline.batch_size.max(1) as usize,
            visibility_ms: (pipeline.visibility_timeout_secs as i64).saturating_mul(1_000),
            max_attempts: pipeline.max_delivery_attempts,
            poll_interval: Duration::from_millis(pipeline.poll_interval_ms.max(1)),
            shutdown,
        }
    }

    pub fn consumer(&self) -> &str {
        &self.consumer
    }

    /// Claims one batch at `now` and settles every message in it. Each item is handled
    /// and settled at `now` plus the time already spent on the batch. Once shutdown is
    /// signalled, the unprocessed rest of the batch is abandoned so it is redelivered promptly.
    pub async fn run_batch(&self, now: i64) -> Result<BatchSummary> {
        let messages = self
            .store
            .claim_batch(
                &ClaimRequest {
                    queue: self.queue,
                    assignment: self.assignment,
                    consumer: &self.consumer,
                    limit: self.batch_size,
                    visibility_ms: self.visibility_ms,
                    max_attempts: self.max_attempts,
                },
                now,
            )
            .with_context(|| format!("failed to claim from queue {}", self.queue))?;

        let mut summary = BatchSummary {
            claimed: messages.len(),
            ..BatchSummary::default()
        };

        let started = Instant::now();
        for (index, message) in messages.iter().enumerate() {
            let item_now = elapsed_since(now, started);
            if *self.shutdown.borrow() {
                let remaining = messages[index..]
                    .iter()
                    .map(|message| message.message_id)
                    .collect::<Vec<_>>();
                self.store
                    .abandon(&remaining, item_now)
                    .context("failed to abandon claimed messages")?;
                summary.abandoned += remaining.len();
                break;
            }

            let outcome = self.handler.handle(message, item_now).await;
            let settled_at = elapsed_since(now, started);
            self.settle(message, outcome, settled_at, &mut summary)?;
        }

        Ok(summary)
    }

    fn settle(
        &self,
        message: &QueueMessage,
        outcome: ItemOutcome,
        now: i64,
        summary: &mut BatchSummary,
    ) -> Result<()> {
        match outcome {
            ItemOutcome::Ack => {
                self.store
                    .ack(&[message.message_id])
                    .context("failed to ack message")?;
                summary.acked += 1;
            }
            ItemOutcome::Retry { delay_ms, reason } => {
                warn!(
                    queue = self.queue.as_str(),
                    partition = message.partition,
                    partition_key = %message.partition_key,
                    attempts = message.attempts,
                    error = %reason,
                    "item failed, scheduled for redelivery"
                );
                self.store
                    .release(message.message_id, delay_ms, now)
                    .context("failed to release message")?;
                summary.retried += 1;
            }
            ItemOutcome::Quarantine { reason } => {
                warn!(
                    queue = self.queue.as_str(),
                    partition_key = %message.partition_key,
                    error = %reason,
                    "malformed item quarantined"
                );
                self.store
                    .increment_counter(COUNTER_QUARANTINED, 1)
                    .context("failed to count quarantined item")?;
                self.store
                    .ack(&[message.message_id])
                    .context("failed to ack quarantined message")?;
                summary.quarantined += 1;
            }
            ItemOutcome::DeadLetter { reason } => {
                error!(
                    queue = self.queue.as_str(),
                    partition_key = %message.partition_key,
                    attempts = message.attempts,
                    error = %reason,
                    "item dead-lettered"
                );
                self.store
                    .dead_letter(message.message_id, &reason, now)
                    .context("failed to dead-letter message")?;
                summary.dead_lettered += 1;
            }
        }
        Ok(())
    }

    /// Claims until shutdown. Errors are logged per batch; the worker itself keeps going.
    pub async fn run(self) {
        let mut shutdown = self.shutdown.clone();
        info!(
            queue = self.queue.as_str(),
            consumer = %self.consumer,
            handler = self.handler.name(),
            "stage worker started"
        );

        loop {
            if *shutdown.borrow() {
                break;
            }

            let idle = match self.run_batch(unix_timestamp_millis()).await {
                Ok(summary) => {
                    if summary.claimed > 0 {
                        debug!(
                            queue = self.queue.as_str(),
                            claimed = summary.claimed,
                            acked = summary.acked,
                            retried = summary.retried,
                            "batch settled"
                        );
                    }
                    summary.claimed == 0
                }
                Err(err) => {
                    warn!(
                        queue = self.queue.as_str(),
                        consumer = %self.consumer,
                        error = %format!("{err:#}"),
                        "stage batch failed"
                    );
                    true
                }
            };

            if idle {
                tokio::select! {
                    changed = shutdown.changed() => {
                        if changed.is_err() {
                            break;
                        }
                    }
                    _ = sleep(self.poll_interval) => {}
                }
            }
        }

        info!(queue = self.queue.as_str(), consumer = %self.consumer, "stage worker stopped");
    }
}

fn elapsed_since(now: i64, started: Instant) -> i64 {
    let elapsed = i64::try_from(started.elapsed().as_millis()).unwrap_or(i64::MAX);
    now.saturating_add(elapsed)
}

/// Exponential backoff `base << attempt`, capped at `max`.
pub fn backoff_delay(base_ms: u64, max_ms: u64, attempt: usize) -> Duration {
    let shift = attempt.min(20) as u32;
    Duration::from_millis(base_ms.saturating_mul(1u64 << shift).min(max_ms))
}

/// Redelivery delay after a transient failure on delivery `attempts` (1-based):
/// `transient_retry_delay_secs`, doubling per attempt up to `transient_retry_max_secs`.
pub fn redelivery_delay_ms(pipeline: &PipelineConfig, attempts: u32) -> i64 {
    let base_ms = pipeline.transient_retry_delay_secs.saturating_mul(1_000);
    let max_ms = pipeline
        .transient_retry_max_secs
        .saturating_mul(1_000)
        .max(base_ms);
    let delay = backoff_delay(base_ms, max_ms, attempts.saturating_sub(1) as usize);
    i64::try_from(delay.as_millis()).unwrap_or(i64::MAX)
}
