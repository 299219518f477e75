use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use faultline_analysis::{DriftMonitor, MetricsTracker, PrototypeImprover, QualityReport};
use faultline_core::{Namespace, unix_timestamp_millis};
use faultline_store::{PruneSummary, SqliteStore, VectorKind, VectorStore};
use tokio::sync::watch;
use tokio::time::sleep;
use tracing::{debug, info, warn};

const RESTART_BACKOFF_INITIAL: Duration = Duration::from_secs(5);
const RESTART_BACKOFF_MAX: Duration = Duration::from_secs(300);

/// Work driven by [`run_periodic`].
#[async_trait]
pub trait PeriodicJob: Send + 'static {
    async fn run_once(&mut self, now: i64) -> Result<()>;
}

/// Runs `job` every `interval` until shutdown. A failed run is retried sooner, starting
/// at five seconds and doubling up to five minutes, then the normal interval resumes.
pub async fn run_periodic<J: PeriodicJob>(
    name: &'static str,
    interval: Duration,
    mut shutdown: watch::Receiver<bool>,
    mut job: J,
) {
    info!(job = name, interval_secs = interval.as_secs(), "periodic job scheduled");
    let mut backoff = RESTART_BACKOFF_INITIAL;
    let mut delay = interval;

    loop {
        tokio::select! {
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
                continue;
            }
            _ = sleep(delay) => {}
        }

        match job.run_once(unix_timestamp_millis()).await {
            Ok(()) => {
                backoff = RESTART_BACKOFF_INITIAL;
                delay = interval;
            }
            Err(err) => {
                warn!(
                    job = name,
                    error = %format!("{err:#}"),
                    retry_in_secs = backoff.as_secs(),
                    "periodic job failed"
                );
                delay = backoff;
                backoff = (backoff * 2).min(RESTART_BACKOFF_MAX);
            }
        }
    }

    info!(job = name, "periodic job stopped");
}

#[async_trait]
impl PeriodicJob for PrototypeImprover {
    async fn run_once(&mut self, now: i64) -> Result<()> {
        self.improve(now).await?;
        Ok(())
    }
}

/// One drift evaluation: report every namespace, persist, warn on new dips, then
/// drop expired alerts and history older than the retention window.
pub struct DriftJob {
    tracker: MetricsTracker,
    monitor: DriftMonitor,
    store: Arc<SqliteStore>,
    vectors: Arc<dyn VectorStore>,
}

impl DriftJob {
    pub fn new(
        tracker: MetricsTracker,
        store: Arc<SqliteStore>,
        vectors: Arc<dyn VectorStore>,
    ) -> Self {
        Self {
            tracker,
            monitor: DriftMonitor::new(),
            store,
            vectors,
        }
    }

    pub async fn evaluate(&mut self, now: i64) -> Result<Vec<QualityReport>> {
        let window_secs = self.tracker.config().window_secs;
        let reports = self.tracker.report_all(window_secs, now)?;
        for report in &reports {
            self.tracker.persist(report)?;
            self.monitor.observe(report);
        }

        self.prune(now).await?;
        Ok(reports)
    }

    /// Alerts and dedup records go at their own expiry. Assignment events, idempotency
    /// records, finished enrichment states and raw-log vectors go once they are older
    /// than `event_retention_secs`.
    pub async fn prune(&self, now: i64) -> Result<PruneSummary> {
        let retention_ms =
            (self.tracker.config().event_retention_secs as i64).saturating_mul(1_000);
        let history_before = now.saturating_sub(retention_ms);

        let events = self.tracker.prune(now)?;
        let summary = self.store.prune_expired(now, history_before)?;
        for key in self.store.list_namespaces()? {
            let Some(namespace) = Namespace::from_key(&key) else {
                warn!(namespace = %key, "skipping vector pruning for unreadable namespace");
                continue;
            };
            self.vectors
                .prune_vectors(&namespace, VectorKind::Log, history_before)
                .await?;
        }

        if events > 0 || summary.total() > 0 {
            debug!(
                events,
                alerts = summary.alerts,
                dedup = summary.dedup_records,
                requests = summary.enrichment_requests,
                idempotency = summary.idempotency_records,
                drift_reports = summary.drift_reports,
                "retention pass pruned rows"
            );
        }
        Ok(summary)
    }
}

#[async_trait]
impl PeriodicJob for DriftJob {
    async fn run_once(&mut self, now: i64) -> Result<()> {
        self.evaluate(now).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use faultline_analysis::{AssignmentInput, ClusteringEngine};
    use faultline_config::{ClusteringConfig, DriftConfig};
    use faultline_core::{Alert, EmbeddingMode, OsClass, SourceRef};
    use faultline_store::{EnrichmentWrite, SqliteVectorStore, VectorRecord};
    use tempfile::tempdir;

    use super::*;

    const DAY_MS: i64 = 24 * 3_600 * 1_000;

    #[tokio::test]
    async fn drift_job_expires_alerts_and_old_log_vectors() {
        let temp = tempdir().expect("tempdir");
        let store = Arc::new(SqliteStore::open(temp.path()).expect("open store"));
        let vectors: Arc<dyn VectorStore> = Arc::new(SqliteVectorStore::new(store.clone()));
        let namespace = Namespace::new(OsClass::Linux, "mock", "mock-2", 2);

        store
            .record_enrichment(EnrichmentWrite {
                alert: Alert {
                    alert_id: "alert-1".to_owned(),
                    source_ref: SourceRef::Prototype {
                        prototype_id: "proto-1".to_owned(),
                    },
                    prototype_id: Some("proto-1".to_owned()),
                    namespace: namespace.key(),
                    classification: "disk".to_owned(),
                    confidence: 0.8,
                    rationale: "i/o error".to_owned(),
                    generated_at: 0,
                    ttl_secs: 86_400,
                },
                dedup_key: "dedup-1".to_owned(),
                dedup_ttl_secs: 3_600,
                alert_partitions: 4,
                prototype_update: None,
                request_id: None,
                now: 0,
            })
            .expect("record alert");

        let mut drift = DriftJob::new(
            MetricsTracker::new(
                store.clone(),
                DriftConfig {
                    event_retention_secs: 7 * 24 * 3_600,
                    ..DriftConfig::default()
                },
            ),
            store.clone(),
            vectors.clone(),
        );

        let early = drift.prune(3_600_000).await.expect("prune after dedup ttl");
        assert_eq!(early.dedup_records, 1);
        assert!(store.get_alert("alert-1").expect("get alert").is_some());

        drift.evaluate(DAY_MS).await.expect("evaluate after alert ttl");
        assert!(store.get_alert("alert-1").expect("get alert").is_none());

        let engine = ClusteringEngine::new(store.clone(), ClusteringConfig::default());
        engine
            .assign(AssignmentInput {
                namespace: &namespace,
                idempotency_key: "line:1",
                example_id: "line:1",
                text: "kernel: I/O error",
                vector: vec![1.0, 0.0],
                embedding_mode: EmbeddingMode::Templated,
                now: DAY_MS,
            })
            .expect("assign");
        for (id, updated_at) in [("old", DAY_MS), ("fresh", 9 * DAY_MS)] {
            vectors
                .upsert_vectors(
                    &namespace,
                    VectorKind::Log,
                    &[VectorRecord {
                        id: id.to_owned(),
                        prototype_id: None,
                        text: id.to_owned(),
                        embedding: vec![1.0, 0.0],
                        updated_at,
                    }],
                )
                .await
                .expect("upsert vector");
        }

        drift.prune(9 * DAY_MS).await.expect("prune history");
        assert_eq!(
            vectors
                .count_vectors(&namespace, VectorKind::Log)
                .await
                .expect("count"),
            1
        );
    }
}
