use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;

use anyhow::{Context, Result};
use faultline_config::load_workspace_config;
use faultline_core::{CoreError, IngestRecord, IssueKey, ProducerPayload, unix_timestamp_millis};
use faultline_store::{COUNTER_QUARANTINED, NewQueueMessage, QueueName, SqliteStore};
use faultline_template::build_log_entry;
use serde_json::Value;
use thiserror::Error;
use tracing::{info, warn};

use crate::cli::IngestArgs;

const ENQUEUE_CHUNK: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct IngestSummary {
    pub accepted: usize,
    pub malformed: usize,
}

#[derive(Debug, Error)]
pub enum IngestLineError {
    #[error("invalid JSON: {0}")]
    Json(serde_json::Error),
    #[error(transparent)]
    Record(CoreError),
}

/// One JSON line: a tagged producer payload (has a `producer` field) or a plain
/// `{source, text, timestamp}` record.
pub fn parse_ingest_line(line: &str) -> Result<IngestRecord, IngestLineError> {
    let value = serde_json::from_str::<Value>(line).map_err(IngestLineError::Json)?;
    let record = if value.get("producer").is_some() {
        serde_json::from_value::<ProducerPayload>(value)
            .map_err(IngestLineError::Json)?
            .into_record()
    } else {
        serde_json::from_value::<IngestRecord>(value)
            .map_err(IngestLineError::Json)?
            .validated()
    };
    record.map_err(IngestLineError::Record)
}

/// Reads JSON lines and enqueues one LogEntry per valid line, routed by issue key so
/// every line of an issue lands on the same aggregator partition.
pub fn ingest_reader(
    store: &SqliteStore,
    reader: impl BufRead,
    partitions: u32,
    now: i64,
) -> Result<IngestSummary> {
    let mut summary = IngestSummary::default();
    let mut pending = Vec::with_capacity(ENQUEUE_CHUNK);

    for (index, line) in reader.lines().enumerate() {
        let line = line.with_context(|| format!("failed to read input line {}", index + 1))?;
        if line.trim().is_empty() {
            continue;
        }

        let record = match parse_ingest_line(&line) {
            Ok(record) => record,
            Err(err) => {
                warn!(line = index + 1, error = %err, "malformed ingest line skipped");
                summary.malformed += 1;
                continue;
            }
        };

        let entry = build_log_entry(&record, now).observed_at(now, index as u64);
        let partition_key = IssueKey::from_entry(&entry).as_key();
        let payload = serde_json::to_string(&entry).context("failed to encode log entry")?;
        pending.push(NewQueueMessage::new(
            QueueName::Logs,
            partition_key,
            payload,
            partitions,
        ));
        summary.accepted += 1;

        if pending.len() >= ENQUEUE_CHUNK {
            store
                .enqueue_batch(&pending, now)
                .context("failed to enqueue log entries")?;
            pending.clear();
        }
    }

    if !pending.is_empty() {
        store
            .enqueue_batch(&pending, now)
            .context("failed to enqueue log entries")?;
    }
    if summary.malformed > 0 {
        store
            .increment_counter(COUNTER_QUARANTINED, summary.malformed as i64)
            .context("failed to count malformed ingest lines")?;
    }
    Ok(summary)
}

pub fn run_ingest_command(workspace: &Path, args: IngestArgs) -> Result<()> {
    let config = load_workspace_config(workspace).context("failed to load workspace config")?;
    let store = SqliteStore::open(workspace).context("failed to initialize local store")?;
    let partitions = config.pipeline.partitions.max(1);
    let now = unix_timestamp_millis();

    let summary = match &args.file {
        Some(path) => {
            let file = File::open(path)
                .with_context(|| format!("failed to open {}", path.display()))?;
            ingest_reader(&store, BufReader::new(file), partitions, now)?
        }
        None => ingest_reader(&store, std::io::stdin().lock(), partitions, now)?,
    };

    info!(
        accepted = summary.accepted,
        malformed = summary.malformed,
        "ingest finished"
    );
    println!(
        "ingested {} line(s), skipped {} malformed",
        summary.accepted, summary.malformed
    );
    Ok(())
}
