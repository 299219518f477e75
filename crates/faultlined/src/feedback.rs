use std::io::Write;
use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use faultline_analysis::PrototypeImprover;
use faultline_config::load_workspace_config;
use faultline_core::{stable_id, unix_timestamp_millis};
use faultline_store::{FeedbackRecord, SqliteStore, open_vector_store};
use tracing::info;

use crate::cli::{DeadLettersArgs, FeedbackArgs};

/// Records negative feedback against the prototype behind `alert_id`. Repeated
/// feedback for one alert replaces the earlier category.
pub fn record_alert_feedback(
    store: &SqliteStore,
    alert_id: &str,
    category: Option<&str>,
    now: i64,
) -> Result<FeedbackRecord> {
    let alert_id = alert_id.trim();
    let Some(alert) = store
        .get_alert(alert_id)
        .with_context(|| format!("failed to load alert {alert_id}"))?
    else {
        bail!("alert {alert_id} not found");
    };

    let record = FeedbackRecord {
        feedback_id: stable_id(&["feedback", &alert.alert_id]),
        alert_id: alert.alert_id,
        prototype_id: alert.prototype_id,
        namespace: alert.namespace,
        category: category
            .map(|category| category.trim().to_ascii_lowercase())
            .filter(|category| !category.is_empty()),
        created_at: now,
    };
    store
        .record_feedback(&record)
        .context("failed to record feedback")?;
    Ok(record)
}

pub fn run_feedback_command(workspace: &Path, args: FeedbackArgs) -> Result<()> {
    let store = SqliteStore::open(workspace).context("failed to initialize local store")?;
    let record = record_alert_feedback(
        &store,
        &args.alert_id,
        args.category.as_deref(),
        unix_timestamp_millis(),
    )?;

    info!(
        alert_id = %record.alert_id,
        prototype_id = record.prototype_id.as_deref().unwrap_or("-"),
        "feedback recorded"
    );
    let value = serde_json::json!({
        "feedback_id": record.feedback_id,
        "alert_id": record.alert_id,
        "prototype_id": record.prototype_id,
        "namespace": record.namespace,
        "category": record.category,
    });
    write_json_to_stdout(&value)
}

pub async fn run_improve_command(workspace: &Path) -> Result<()> {
    let config = load_workspace_config(workspace).context("failed to load workspace config")?;
    let store =
        Arc::new(SqliteStore::open(workspace).context("failed to initialize local store")?);
    let vectors = open_vector_store(workspace, store.clone())
        .await
        .context("failed to open vector store")?;
    let improver = PrototypeImprover::new(store, vectors, config.clustering, config.improver);
    let report = improver
        .improve(unix_timestamp_millis())
        .await
        .context("prototype improvement failed")?;

    let value = serde_json::to_value(report).context("failed to serialize refinement report")?;
    write_json_to_stdout(&value)
}

pub fn run_dead_letters_command(workspace: &Path, args: DeadLettersArgs) -> Result<()> {
    let store = SqliteStore::open(workspace).context("failed to initialize local store")?;
    let records = store
        .list_dead_letters(args.queue, args.limit)
        .with_context(|| format!("failed to list dead letters of {}", args.queue))?;

    let mut out = std::io::stdout();
    writeln!(
        &mut out,
        "original_id\tattempts\tdead_lettered_at\tpartition_key\treason"
    )
    .context("write header")?;
    for record in records {
        writeln!(
            &mut out,
            "{}\t{}\t{}\t{}\t{}",
            record.original_id,
            record.attempts,
            record.dead_lettered_at,
            record.partition_key,
            record.reason
        )
        .context("write row")?;
    }
    Ok(())
}

pub(crate) fn write_json_to_stdout(value: &serde_json::Value) -> Result<()> {
    let mut out = std::io::stdout();
    serde_json::to_writer_pretty(&mut out, value).context("failed to serialize JSON output")?;
    writeln!(&mut out).context("failed to write trailing newline")?;
    Ok(())
}
