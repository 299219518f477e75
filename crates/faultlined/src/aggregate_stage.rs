use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use faultline_config::FaultlineConfig;
use faultline_core::{LogEntry, unix_timestamp_millis};
use faultline_store::{
    COUNTER_QUARANTINED, ClaimRequest, NewQueueMessage, PartitionAssignment, QueueName,
    SqliteStore,
};
use tokio::sync::watch;
use tokio::time::sleep;
use tracing::{debug, info, warn};

use crate::aggregator::{FlushedIssue, IssueAggregator};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct AggregateSummary {
    pub claimed: usize,
    pub observed: usize,
    pub quarantined: usize,
    pub flushed: usize,
}

/// Logs-queue consumer that feeds an [`IssueAggregator`] and emits flushed issues.
///
/// Log messages stay claimed (unacknowledged) while their issue is open; the sweep
/// keeps their leases alive and acks them only after the issue is enqueued.
pub struct AggregatorWorker {
    store: Arc<SqliteStore>,
    state: Mutex<IssueAggregator>,
    assignment: PartitionAssignment,
    consumer: String,
    partitions: u32,
    batch_size: usize,
    visibility_ms: i64,
    max_attempts: u32,
    poll_interval: Duration,
    sweep_interval: Duration,
}

impl AggregatorWorker {
    pub fn new(
        store: Arc<SqliteStore>,
        config: &FaultlineConfig,
        assignment: PartitionAssignment,
    ) -> Self {
        Self {
            store,
            state: Mutex::new(IssueAggregator::from_config(&config.aggregator)),
            consumer: format!(
                "aggregator-{}-of-{}",
                assignment.consumer_index, assignment.consumer_count
            ),
            assignment,
            partitions: config.pipeline.partitions.max(1),
            batch_size: config.pipeline.batch_size.max(1) as usize,
            visibility_ms: (config.pipeline.visibility_timeout_secs as i64).saturating_mul(1_000),
            max_attempts: config.pipeline.max_delivery_attempts,
            poll_interval: Duration::from_millis(config.pipeline.poll_interval_ms.max(1)),
            sweep_interval: Duration::from_millis(config.aggregator.sweep_interval_ms.max(1)),
        }
    }

    fn lock(&self) -> Result<MutexGuard<'_, IssueAggregator>> {
        self.state
            .lock()
            .map_err(|_| anyhow!("aggregator state lock poisoned"))
    }

    pub fn open_issues(&self) -> Result<usize> {
        Ok(self.lock()?.open_issues())
    }

    /// Claims one batch of log lines and folds them into open issues.
    pub fn poll_once(&self, now: i64) -> Result<AggregateSummary> {
        let messages = self
            .store
            .claim_batch(
                &ClaimRequest {
                    queue: QueueName::Logs,
                    assignment: self.assignment,
                    consumer: &self.consumer,
                    limit: self.batch_size,
                    visibility_ms: self.visibility_ms,
                    max_attempts: self.max_attempts,
                },
                now,
            )
            .context("failed to claim log lines")?;

        let mut summary = AggregateSummary {
            claimed: messages.len(),
            ..AggregateSummary::default()
        };
        let mut flushed = Vec::new();
        let mut malformed = Vec::new();
        {
            let mut state = self.lock()?;
            for message in &messages {
                match serde_json::from_str::<LogEntry>(&message.payload) {
                    Ok(entry) => {
                        flushed.extend(state.observe(entry, Some(message.message_id), now));
                        summary.observed += 1;
                    }
                    Err(err) => malformed.push((message.message_id, err.to_string())),
                }
            }
        }

        if !malformed.is_empty() {
            for (message_id, reason) in &malformed {
                warn!(
                    queue = QueueName::Logs.as_str(),
                    message_id,
                    error = %reason,
                    "malformed log entry quarantined"
                );
            }
            self.store
                .increment_counter(COUNTER_QUARANTINED, malformed.len() as i64)
                .context("failed to count quarantined log entries")?;
            let ids = malformed.iter().map(|(id, _)| *id).collect::<Vec<_>>();
            self.store
                .ack(&ids)
                .context("failed to ack quarantined log entries")?;
            summary.quarantined = malformed.len();
        }

        summary.flushed = self.emit(flushed, now)?;
        Ok(summary)
    }

    /// Flushes expired issues and extends the leases of lines still held.
    pub fn sweep_once(&self, now: i64) -> Result<usize> {
        let (flushed, held) = {
            let mut state = self.lock()?;
            let flushed = state.sweep(now);
            (flushed, state.held_message_ids())
        };

        self.store
            .extend_lease(&held, self.visibility_ms, now)
            .context("failed to extend leases of held log lines")?;
        self.emit(flushed, now)
    }

    fn emit(&self, flushed: Vec<FlushedIssue>, now: i64) -> Result<usize> {
        if flushed.is_empty() {
            return Ok(0);
        }

        let messages = flushed
            .iter()
            .map(|flushed| {
                serde_json::to_string(&flushed.issue).map(|payload| {
                    NewQueueMessage::new(
                        QueueName::Issues,
                        flushed.issue.issue_key.clone(),
                        payload,
                        self.partitions,
                    )
                })
            })
            .collect::<Result<Vec<_>, _>>()
            .context("failed to encode flushed issue")?;
        self.store
            .enqueue_batch(&messages, now)
            .context("failed to enqueue flushed issues")?;

        let acked = flushed
            .iter()
            .flat_map(|flushed| flushed.message_ids.iter().copied())
            .collect::<Vec<_>>();
        self.store
            .ack(&acked)
            .context("failed to ack log lines of flushed issues")?;

        for flushed in &flushed {
            debug!(
                issue_key = %flushed.issue.issue_key,
                issue_id = %flushed.issue.issue_id,
                lines = flushed.issue.member_lines.len(),
                "issue flushed"
            );
        }
        Ok(flushed.len())
    }

    /// Returns held lines to the queue without flushing; they are redelivered on restart.
    pub fn abandon_held(&self, now: i64) -> Result<usize> {
        let held = self.lock()?.abandon_all();
        self.store
            .abandon(&held, now)
            .context("failed to abandon held log lines")?;
        Ok(held.len())
    }

    /// Claim loop and sweep loop run as separate tasks, so timeout detection never waits
    /// on ingestion. The state lock is never held across an await point.
    pub async fn run(self: Arc<Self>, shutdown: watch::Receiver<bool>) {
        info!(consumer = %self.consumer, "aggregator started");

        let sweeper = {
            let worker = self.clone();
            let shutdown = shutdown.clone();
            tokio::spawn(async move { worker.sweep_loop(shutdown).await })
        };
        self.claim_loop(shutdown).await;
        if let Err(err) = sweeper.await {
            warn!(error = %err, "aggregator sweep task ended abnormally");
        }

        match self.abandon_held(unix_timestamp_millis()) {
            Ok(abandoned) => info!(consumer = %self.consumer, abandoned, "aggregator stopped"),
            Err(err) => warn!(error = %format!("{err:#}"), "failed to release held log lines"),
        }
    }

    async fn claim_loop(&self, mut shutdown: watch::Receiver<bool>) {
        loop {
            if *shutdown.borrow() {
                break;
            }

            let idle = match self.poll_once(unix_timestamp_millis()) {
                Ok(summary) => summary.claimed == 0,
                Err(err) => {
                    warn!(
                        consumer = %self.consumer,
                        error = %format!("{err:#}"),
                        "aggregator poll failed"
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
    }

    async fn sweep_loop(&self, mut shutdown: watch::Receiver<bool>) {
        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
                _ = sleep(self.sweep_interval) => {
                    if let Err(err) = self.sweep_once(unix_timestamp_millis()) {
                        warn!(
                            consumer = %self.consumer,
                            error = %format!("{err:#}"),
                            "aggregator sweep failed"
                        );
                    }
                }
            }
        }
    }
}
