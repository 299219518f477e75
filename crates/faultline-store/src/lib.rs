use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use faultline_config::{ConfigError, faultline_dir};
use faultline_core::{
    Alert, ClusterPrototype, EmbeddingMode, Namespace, OsClass, PrototypeId, SourceRef, Template,
};
use rusqlite::{Connection, OptionalExtension, TransactionBehavior, params};
use thiserror::Error;

mod prototypes;
mod queue;
pub mod vector;

pub use queue::{
    ClaimRequest, DeadLetterRecord, NewQueueMessage, PartitionAssignment, QueueMessage, QueueName,
};
pub use vector::{
    LanceVectorStore, SqliteVectorStore, VectorKind, VectorRecord, VectorRetag,
    VectorSearchResult, VectorStore, open_vector_store,
};

pub const COUNTER_QUARANTINED: &str = "quarantined";
pub const COUNTER_DEAD_LETTERED: &str = "dead_lettered";
pub const COUNTER_UNENRICHED: &str = "unenriched";
pub const COUNTER_ALERTS_SUPPRESSED: &str = "alerts_suppressed";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("config error: {0}")]
    Config(#[from] ConfigError),
    #[error("lancedb error: {0}")]
    LanceDb(String),
    #[error("namespace mismatch: expected {expected}, got {actual}")]
    NamespaceMismatch { expected: String, actual: String },
    #[error("version conflict on prototype {prototype_id}")]
    VersionConflict { prototype_id: PrototypeId },
    #[error("unknown prototype {0}")]
    UnknownPrototype(PrototypeId),
    #[error("invalid stored value: {0}")]
    InvalidValue(String),
    #[error("store connection lock poisoned")]
    LockPoisoned,
}

/// Outcome recorded for an idempotency key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AssignmentRecord {
    pub prototype_id: PrototypeId,
    pub is_new: bool,
}

/// A prototype mutation proposed by the clustering engine.
#[derive(Debug, Clone, PartialEq)]
pub enum PrototypeWrite {
    Create(ClusterPrototype),
    /// Replaces centroid/examples and increments `member_count` by one, only if the
    /// stored version still equals `expected_version`.
    Update {
        prototype_id: PrototypeId,
        expected_version: i64,
        centroid: Vec<f32>,
        examples: Vec<String>,
    },
}

impl PrototypeWrite {
    pub fn prototype_id(&self) -> &str {
        match self {
            Self::Create(prototype) => &prototype.prototype_id,
            Self::Update { prototype_id, .. } => prototype_id,
        }
    }
}

/// One row of the assignment log. Feeds drift metrics, improver samples, and
/// enrichment context.
#[derive(Debug, Clone, PartialEq)]
pub struct AssignmentEvent {
    pub event_id: i64,
    pub namespace: String,
    pub prototype_id: PrototypeId,
    pub is_new: bool,
    pub example_id: String,
    pub text: String,
    pub vector: Vec<f32>,
    pub created_at: i64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct AssignmentCommit {
    pub idempotency_key: String,
    pub namespace: String,
    pub write: PrototypeWrite,
    pub example_id: String,
    pub text: String,
    pub vector: Vec<f32>,
    pub now: i64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommittedAssignment {
    pub prototype_id: PrototypeId,
    pub is_new: bool,
    pub member_count: u64,
    /// True when the idempotency key had already been recorded and nothing was written.
    pub replayed: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PrototypeNeighbor {
    pub prototype: ClusterPrototype,
    pub distance: f32,
}

/// Near-duplicate merge: `loser` is superseded by `survivor`.
#[derive(Debug, Clone, PartialEq)]
pub struct PrototypeMerge {
    pub survivor_id: PrototypeId,
    pub survivor_expected_version: i64,
    pub loser_id: PrototypeId,
    pub loser_expected_version: i64,
    pub centroid: Vec<f32>,
    pub examples: Vec<String>,
}

/// Split of a feedback-flagged prototype into tighter children.
#[derive(Debug, Clone, PartialEq)]
pub struct PrototypeSplit {
    pub parent_id: PrototypeId,
    pub parent_expected_version: i64,
    pub children: Vec<ClusterPrototype>,
    /// `(event_id, child prototype_id)` pairs moving logged members to their child.
    pub reassignments: Vec<(i64, PrototypeId)>,
}

impl PrototypeSplit {
    /// Child the superseded parent points at: the largest, then the smallest id.
    pub fn heir(&self) -> Option<&ClusterPrototype> {
        self.children.iter().max_by(|left, right| {
            left.member_count
                .cmp(&right.member_count)
                .then_with(|| right.prototype_id.cmp(&left.prototype_id))
        })
    }
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct RefinementCommit {
    pub merges: Vec<PrototypeMerge>,
    pub splits: Vec<PrototypeSplit>,
    pub processed_feedback_ids: Vec<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct FeedbackRecord {
    pub feedback_id: String,
    pub alert_id: String,
    pub prototype_id: Option<PrototypeId>,
    pub namespace: String,
    pub category: Option<String>,
    pub created_at: i64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ClassificationUpdate {
    pub prototype_id: PrototypeId,
    pub category: String,
    pub confidence: f32,
    pub classified_member_count: u64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct EnrichmentWrite {
    pub alert: Alert,
    pub dedup_key: String,
    pub dedup_ttl_secs: u64,
    pub alert_partitions: u32,
    pub prototype_update: Option<ClassificationUpdate>,
    pub request_id: Option<String>,
    pub now: i64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EnrichmentOutcome {
    Emitted,
    /// The deterministic alert id was already written by an earlier delivery.
    Duplicate,
    /// A live dedup record for the same key suppressed emission.
    Suppressed { existing_alert_id: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TemplateUpsert {
    pub template_id: String,
    pub is_new: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DriftReportRecord {
    pub namespace: String,
    pub window_secs: u64,
    pub generated_at: i64,
    pub report_json: String,
}

/// Rows removed by one retention pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PruneSummary {
    pub alerts: usize,
    pub dedup_records: usize,
    pub enrichment_requests: usize,
    pub idempotency_records: usize,
    pub drift_reports: usize,
}

impl PruneSummary {
    pub fn total(&self) -> usize {
        self.alerts
            + self.dedup_records
            + self.enrichment_requests
            + self.idempotency_records
            + self.drift_reports
    }
}

/// Assignment path seam. The clustering engine only needs these reads and the
/// single transactional commit.
pub trait PrototypeStore: Send + Sync {
    fn nearest_prototypes(
        &self,
        namespace: &Namespace,
        vector: &[f32],
        limit: usize,
    ) -> Result<Vec<PrototypeNeighbor>, StoreError>;
    fn get_prototype(&self, prototype_id: &str) -> Result<Option<ClusterPrototype>, StoreError>;
    fn lookup_assignment(
        &self,
        idempotency_key: &str,
    ) -> Result<Option<AssignmentRecord>, StoreError>;
    fn commit_assignment(
        &self,
        commit: AssignmentCommit,
    ) -> Result<CommittedAssignment, StoreError>;
}

/// Refinement path seam: what the prototype improver plans from and commits through.
pub trait RefinementStore: Send + Sync {
    fn list_feedback(&self, limit: usize) -> Result<Vec<FeedbackRecord>, StoreError>;
    fn resolve_live_prototype(
        &self,
        prototype_id: &str,
    ) -> Result<Option<ClusterPrototype>, StoreError>;
    fn list_namespaces(&self) -> Result<Vec<String>, StoreError>;
    fn list_prototypes(
        &self,
        namespace: &str,
        live_only: bool,
    ) -> Result<Vec<ClusterPrototype>, StoreError>;
    fn events_for_prototype(
        &self,
        prototype_id: &str,
        limit: usize,
    ) -> Result<Vec<AssignmentEvent>, StoreError>;
    fn apply_refinement(&self, commit: &RefinementCommit, now: i64) -> Result<(), StoreError>;
}

pub struct SqliteStore {
    conn: Mutex<Connection>,
    faultline_dir: PathBuf,
}

impl SqliteStore {
    pub fn open(workspace_root: impl AsRef<Path>) -> Result<Self, StoreError> {
        let faultline_dir = faultline_dir(workspace_root);
        let sqlite_path = faultline_dir.join("meta.sqlite");

        fs::create_dir_all(&faultline_dir)?;

        let conn = Connection::open(sqlite_path)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.busy_timeout(Duration::from_secs(5))?;
        run_migrations(&conn)?;

        Ok(Self {
            conn: Mutex::new(conn),
            faultline_dir,
        })
    }

    pub fn faultline_dir(&self) -> &Path {
        &self.faultline_dir
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>, StoreError> {
        self.conn.lock().map_err(|_| StoreError::LockPoisoned)
    }

    /// Runs `body` inside an IMMEDIATE transaction; any error rolls everything back.
    fn with_immediate_tx<T>(
        &self,
        body: impl FnOnce(&rusqlite::Transaction<'_>) -> Result<T, StoreError>,
    ) -> Result<T, StoreError> {
        let mut conn = self.lock()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let value = body(&tx)?;
        tx.commit()?;
        Ok(value)
    }

    /// Records a template for its namespace; `is_new` is true only on first sight.
    pub fn upsert_template(&self, template: &Template) -> Result<TemplateUpsert, StoreError> {
        let conn = self.lock()?;
        let inserted = conn.execute(
            r#"
            INSERT OR IGNORE INTO templates (
                template_id, namespace, os_class, template_text, created_at, last_seen_at, occurrences
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?5, 1)
            "#,
            params![
                template.template_id,
                template.namespace,
                template.os_class.as_str(),
                template.template_text,
                template.created_at,
            ],
        )?;
        if inserted == 0 {
            conn.execute(
                r#"
                UPDATE templates
                SET occurrences = occurrences + 1,
                    last_seen_at = MAX(last_seen_at, ?2)
                WHERE template_id = ?1
                "#,
                params![template.template_id, template.created_at],
            )?;
        }

        Ok(TemplateUpsert {
            template_id: template.template_id.clone(),
            is_new: inserted > 0,
        })
    }

    pub fn get_template(&self, template_id: &str) -> Result<Option<Template>, StoreError> {
        let conn = self.lock()?;
        let row = conn
            .query_row(
                r#"
                SELECT template_id, namespace, os_class, template_text, created_at
                FROM templates
                WHERE template_id = ?1
                "#,
                params![template_id],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, String>(3)?,
                        row.get::<_, i64>(4)?,
                    ))
                },
            )
            .optional()?;

        Ok(row.map(
            |(template_id, namespace, os_class, template_text, created_at)| Template {
                template_id,
                namespace,
                os_class: os_class.parse().unwrap_or(OsClass::Unknown),
                template_text,
                created_at,
            },
        ))
    }

    pub fn count_templates(&self, namespace: &str) -> Result<u64, StoreError> {
        let conn = self.lock()?;
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM templates WHERE namespace = ?1",
            params![namespace],
            |row| row.get(0),
        )?;
        Ok(count.max(0) as u64)
    }

    /// Atomic counter increment; returns the new value.
    pub fn increment_counter(&self, name: &str, delta: i64) -> Result<i64, StoreError> {
        let conn = self.lock()?;
        increment_counter_in(&conn, name, delta)
    }

    pub fn counter_value(&self, name: &str) -> Result<i64, StoreError> {
        let conn = self.lock()?;
        let value = conn
            .query_row(
                "SELECT value FROM counters WHERE name = ?1",
                params![name],
                |row| row.get::<_, i64>(0),
            )
            .optional()?;
        Ok(value.unwrap_or(0))
    }

    /// Claims an enrichment request id. Returns false when the same request is
    /// already pending or finished, which keeps significance triggers from firing twice.
    pub fn try_begin_enrichment(
        &self,
        request_id: &str,
        source: &SourceRef,
        now: i64,
    ) -> Result<bool, StoreError> {
        let conn = self.lock()?;
        let inserted = conn.execute(
            r#"
            INSERT OR IGNORE INTO enrichment_requests (
                request_id, source_kind, source_id, state, reason, updated_at
            ) VALUES (?1, ?2, ?3, 'pending', NULL, ?4)
            "#,
            params![request_id, source.kind(), source.id(), now],
        )?;
        Ok(inserted > 0)
    }

    /// Terminal failure path for enrichment: the item is kept, never silently dropped.
    pub fn mark_unenriched(
        &self,
        request_id: &str,
        source: &SourceRef,
        reason: &str,
        now: i64,
    ) -> Result<(), StoreError> {
        let conn = self.lock()?;
        conn.execute(
            r#"
            INSERT INTO enrichment_requests (
                request_id, source_kind, source_id, state, reason, updated_at
            ) VALUES (?1, ?2, ?3, 'unenriched', ?4, ?5)
            ON CONFLICT(request_id) DO UPDATE SET
                state = 'unenriched',
                reason = excluded.reason,
                updated_at = excluded.updated_at
            "#,
            params![request_id, source.kind(), source.id(), reason, now],
        )?;
        increment_counter_in(&conn, COUNTER_UNENRICHED, 1)?;
        Ok(())
    }

    pub fn enrichment_state(&self, request_id: &str) -> Result<Option<String>, StoreError> {
        let conn = self.lock()?;
        let state = conn
            .query_row(
                "SELECT state FROM enrichment_requests WHERE request_id = ?1",
                params![request_id],
                |row| row.get::<_, String>(0),
            )
            .optional()?;
        Ok(state)
    }

    /// Writes the alert, its dedup record, the alerts-queue message, and the
    /// prototype classification in one transaction.
    pub fn record_enrichment(
        &self,
        write: EnrichmentWrite,
    ) -> Result<EnrichmentOutcome, StoreError> {
        self.with_immediate_tx(|tx| {
            let EnrichmentWrite {
                alert,
                dedup_key,
                dedup_ttl_secs,
                alert_partitions,
                prototype_update,
                request_id,
                now,
            } = write;

            let exists = tx
                .query_row(
                    "SELECT 1 FROM alerts WHERE alert_id = ?1",
                    params![alert.alert_id],
                    |row| row.get::<_, i64>(0),
                )
                .optional()?
                .is_some();

            let outcome = if exists {
                EnrichmentOutcome::Duplicate
            } else {
                let live_dedup = tx
                    .query_row(
                        "SELECT alert_id FROM alert_dedup WHERE dedup_key = ?1 AND expires_at > ?2",
                        params![dedup_key, now],
                        |row| row.get::<_, String>(0),
                    )
                    .optional()?;

                match live_dedup {
                    Some(existing_alert_id) => {
                        increment_counter_in(tx, COUNTER_ALERTS_SUPPRESSED, 1)?;
                        EnrichmentOutcome::Suppressed { existing_alert_id }
                    }
                    None => {
                        insert_alert(tx, &alert)?;
                        let dedup_expires_at =
                            now.saturating_add((dedup_ttl_secs as i64).saturating_mul(1_000));
                        tx.execute(
                            r#"
                            INSERT INTO alert_dedup (dedup_key, alert_id, expires_at)
                            VALUES (?1, ?2, ?3)
                            ON CONFLICT(dedup_key) DO UPDATE SET
                                alert_id = excluded.alert_id,
                                expires_at = excluded.expires_at
                            "#,
                            params![dedup_key, alert.alert_id, dedup_expires_at],
                        )?;
                        let payload = serde_json::to_string(&alert)?;
                        let partition_key = alert
                            .prototype_id
                            .clone()
                            .unwrap_or_else(|| alert.source_ref.id().to_owned());
                        queue::insert_message(
                            tx,
                            &NewQueueMessage::new(
                                QueueName::Alerts,
                                partition_key,
                                payload,
                                alert_partitions,
                            ),
                            now,
                        )?;
                        EnrichmentOutcome::Emitted
                    }
                }
            };

            if let Some(update) = prototype_update {
                tx.execute(
                    r#"
                    UPDATE prototypes
                    SET last_classification = ?2,
                        confidence = ?3,
                        classified_member_count = ?4,
                        updated_at = MAX(updated_at, ?5)
                    WHERE prototype_id = ?1
                      AND classified_member_count < ?4
                    "#,
                    params![
                        update.prototype_id,
                        update.category,
                        f64::from(update.confidence),
                        update.classified_member_count as i64,
                        now,
                    ],
                )?;
            }

            if let Some(request_id) = request_id {
                tx.execute(
                    "UPDATE enrichment_requests SET state = 'done', updated_at = ?2 WHERE request_id = ?1",
                    params![request_id, now],
                )?;
            }

            Ok(outcome)
        })
    }

    pub fn get_alert(&self, alert_id: &str) -> Result<Option<Alert>, StoreError> {
        let conn = self.lock()?;
        let payload = conn
            .query_row(
                "SELECT payload_json FROM alerts WHERE alert_id = ?1",
                params![alert_id],
                |row| row.get::<_, String>(0),
            )
            .optional()?;
        payload
            .map(|payload| serde_json::from_str(&payload).map_err(StoreError::from))
            .transpose()
    }

    pub fn list_recent_alerts(&self, limit: u32) -> Result<Vec<Alert>, StoreError> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            r#"
            SELECT payload_json
            FROM alerts
            ORDER BY generated_at DESC, alert_id ASC
            LIMIT ?1
            "#,
        )?;
        let rows = stmt.query_map(params![i64::from(limit.clamp(1, 1_000))], |row| {
            row.get::<_, String>(0)
        })?;
        let payloads = rows.collect::<Result<Vec<_>, _>>()?;
        payloads
            .iter()
            .map(|payload| serde_json::from_str(payload).map_err(StoreError::from))
            .collect()
    }

    /// Deletes alerts and dedup records past their expiry, plus finished enrichment
    /// states, idempotency records and drift reports written before `history_before`.
    pub fn prune_expired(&self, now: i64, history_before: i64) -> Result<PruneSummary, StoreError> {
        self.with_immediate_tx(|tx| {
            Ok(PruneSummary {
                alerts: tx.execute("DELETE FROM alerts WHERE expires_at <= ?1", params![now])?,
                dedup_records: tx.execute(
                    "DELETE FROM alert_dedup WHERE expires_at <= ?1",
                    params![now],
                )?,
                enrichment_requests: tx.execute(
                    "DELETE FROM enrichment_requests WHERE state != 'pending' AND updated_at < ?1",
                    params![history_before],
                )?,
                idempotency_records: tx.execute(
                    "DELETE FROM assignment_idempotency WHERE created_at < ?1",
                    params![history_before],
                )?,
                drift_reports: tx.execute(
                    r#"
                    DELETE FROM drift_reports
                    WHERE generated_at < ?1
                      AND id NOT IN (SELECT MAX(id) FROM drift_reports GROUP BY namespace)
                    "#,
                    params![history_before],
                )?,
            })
        })
    }

    pub fn record_feedback(&self, record: &FeedbackRecord) -> Result<(), StoreError> {
        let conn = self.lock()?;
        conn.execute(
            r#"
            INSERT INTO feedback (feedback_id, alert_id, prototype_id, namespace, category, created_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6)
            ON CONFLICT(feedback_id) DO UPDATE SET
                category = excluded.category,
                created_at = excluded.created_at
            "#,
            params![
                record.feedback_id,
                record.alert_id,
                record.prototype_id,
                record.namespace,
                record.category,
                record.created_at,
            ],
        )?;
        Ok(())
    }

    pub fn list_feedback(&self, limit: usize) -> Result<Vec<FeedbackRecord>, StoreError> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            r#"
            SELECT feedback_id, alert_id, prototype_id, namespace, category, created_at
            FROM feedback
            ORDER BY created_at ASC, feedback_id ASC
            LIMIT ?1
            "#,
        )?;
        let rows = stmt.query_map(params![limit.clamp(1, 10_000) as i64], |row| {
            Ok(FeedbackRecord {
                feedback_id: row.get(0)?,
                alert_id: row.get(1)?,
                prototype_id: row.get(2)?,
                namespace: row.get(3)?,
                category: row.get(4)?,
                created_at: row.get(5)?,
            })
        })?;
        let records = rows.collect::<Result<Vec<_>, _>>()?;
        Ok(records)
    }

    pub fn insert_drift_report(&self, record: &DriftReportRecord) -> Result<(), StoreError> {
        let conn = self.lock()?;
        conn.execute(
            r#"
            INSERT INTO drift_reports (namespace, window_secs, generated_at, report_json)
            VALUES (?1, ?2, ?3, ?4)
            "#,
            params![
                record.namespace,
                record.window_secs as i64,
                record.generated_at,
                record.report_json,
            ],
        )?;
        Ok(())
    }

    /// Most recent report per namespace.
    pub fn latest_drift_reports(&self) -> Result<Vec<DriftReportRecord>, StoreError> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            r#"
            SELECT namespace, window_secs, generated_at, report_json
            FROM drift_reports
            WHERE id IN (SELECT MAX(id) FROM drift_reports GROUP BY namespace)
            ORDER BY namespace ASC
            "#,
        )?;
        let rows = stmt.query_map([], |row| {
            Ok(DriftReportRecord {
                namespace: row.get(0)?,
                window_secs: row.get::<_, i64>(1)?.max(0) as u64,
                generated_at: row.get(2)?,
                report_json: row.get(3)?,
            })
        })?;
        let records = rows.collect::<Result<Vec<_>, _>>()?;
        Ok(records)
    }
}

pub(crate) fn increment_counter_in(
    conn: &Connection,
    name: &str,
    delta: i64,
) -> Result<i64, StoreError> {
    conn.execute(
        r#"
        INSERT INTO counters (name, value) VALUES (?1, ?2)
        ON CONFLICT(name) DO UPDATE SET value = value + excluded.value
        "#,
        params![name, delta],
    )?;
    let value = conn.query_row(
        "SELECT value FROM counters WHERE name = ?1",
        params![name],
        |row| row.get::<_, i64>(0),
    )?;
    Ok(value)
}

fn insert_alert(conn: &Connection, alert: &Alert) -> Result<(), StoreError> {
    conn.execute(
        r#"
        INSERT INTO alerts (
            alert_id, source_kind, source_id, prototype_id, namespace, classification,
            confidence, generated_at, expires_at, payload_json
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
        "#,
        params![
            alert.alert_id,
            alert.source_ref.kind(),
            alert.source_ref.id(),
            alert.prototype_id,
            alert.namespace,
            alert.classification,
            f64::from(alert.confidence),
            alert.generated_at,
            alert.expires_at(),
            serde_json::to_string(alert)?,
        ],
    )?;
    Ok(())
}

pub(crate) fn mode_from_sql(value: &str) -> Result<EmbeddingMode, StoreError> {
    value.parse().map_err(StoreError::InvalidValue)
}

fn run_migrations(conn: &Connection) -> Result<(), StoreError> {
    conn.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS templates (
            template_id TEXT PRIMARY KEY,
            namespace TEXT NOT NULL,
            os_class TEXT NOT NULL,
            template_text TEXT NOT NULL,
            created_at INTEGER NOT NULL,
            last_seen_at INTEGER NOT NULL,
            occurrences INTEGER NOT NULL DEFAULT 1
        );
        CREATE INDEX IF NOT EXISTS idx_templates_namespace ON templates(namespace);

        CREATE TABLE IF NOT EXISTS prototypes (
            prototype_id TEXT PRIMARY KEY,
            namespace TEXT NOT NULL,
            centroid_json TEXT NOT NULL,
            member_count INTEGER NOT NULL,
            last_classification TEXT,
            confidence REAL,
            classified_member_count INTEGER NOT NULL DEFAULT 0,
            examples_json TEXT NOT NULL,
            embedding_mode TEXT NOT NULL,
            version INTEGER NOT NULL DEFAULT 0,
            superseded_by TEXT,
            superseded_reason TEXT,
            created_at INTEGER NOT NULL,
            updated_at INTEGER NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_prototypes_namespace_live
            ON prototypes(namespace, superseded_by);

        CREATE TABLE IF NOT EXISTS assignment_idempotency (
            idempotency_key TEXT PRIMARY KEY,
            prototype_id TEXT NOT NULL,
            is_new INTEGER NOT NULL,
            created_at INTEGER NOT NULL
        );

        CREATE TABLE IF NOT EXISTS assignment_events (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            namespace TEXT NOT NULL,
            prototype_id TEXT NOT NULL,
            is_new INTEGER NOT NULL,
            example_id TEXT NOT NULL,
            idempotency_key TEXT NOT NULL DEFAULT '',
            text TEXT NOT NULL,
            vector_json TEXT NOT NULL,
            created_at INTEGER NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_assignment_events_namespace_time
            ON assignment_events(namespace, created_at);
        CREATE INDEX IF NOT EXISTS idx_assignment_events_prototype
            ON assignment_events(prototype_id);

        CREATE TABLE IF NOT EXISTS alerts (
            alert_id TEXT PRIMARY KEY,
            source_kind TEXT NOT NULL,
            source_id TEXT NOT NULL,
            prototype_id TEXT,
            namespace TEXT NOT NULL,
            classification TEXT NOT NULL,
            confidence REAL NOT NULL,
            generated_at INTEGER NOT NULL,
            expires_at INTEGER NOT NULL,
            payload_json TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS alert_dedup (
            dedup_key TEXT PRIMARY KEY,
            alert_id TEXT NOT NULL,
            expires_at INTEGER NOT NULL
        );

        CREATE TABLE IF NOT EXISTS feedback (
            feedback_id TEXT PRIMARY KEY,
            alert_id TEXT NOT NULL,
            prototype_id TEXT,
            namespace TEXT NOT NULL,
            category TEXT,
            created_at INTEGER NOT NULL
        );

        CREATE TABLE IF NOT EXISTS enrichment_requests (
            request_id TEXT PRIMARY KEY,
            source_kind TEXT NOT NULL,
            source_id TEXT NOT NULL,
            state TEXT NOT NULL,
            reason TEXT,
            updated_at INTEGER NOT NULL
        );

        CREATE TABLE IF NOT EXISTS counters (
            name TEXT PRIMARY KEY,
            value INTEGER NOT NULL
        );

        CREATE TABLE IF NOT EXISTS drift_reports (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            namespace TEXT NOT NULL,
            window_secs INTEGER NOT NULL,
            generated_at INTEGER NOT NULL,
            report_json TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS queue_messages (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            queue TEXT NOT NULL,
            partition_no INTEGER NOT NULL,
            partition_key TEXT NOT NULL,
            payload TEXT NOT NULL,
            attempts INTEGER NOT NULL DEFAULT 0,
            enqueued_at INTEGER NOT NULL,
            visible_at INTEGER NOT NULL,
            claimed_by TEXT
        );
        CREATE INDEX IF NOT EXISTS idx_queue_messages_due
            ON queue_messages(queue, visible_at, id);

        CREATE TABLE IF NOT EXISTS dead_letters (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            original_id INTEGER NOT NULL,
            queue TEXT NOT NULL,
            partition_key TEXT NOT NULL,
            payload TEXT NOT NULL,
            attempts INTEGER NOT NULL,
            reason TEXT NOT NULL,
            dead_lettered_at INTEGER NOT NULL
        );

        CREATE TABLE IF NOT EXISTS vectors (
            namespace TEXT NOT NULL,
            kind TEXT NOT NULL,
            id TEXT NOT NULL,
            prototype_id TEXT,
            text TEXT NOT NULL,
            embedding_json TEXT NOT NULL,
            updated_at INTEGER NOT NULL,
            PRIMARY KEY (namespace, kind, id)
        );
        "#,
    )?;

    add_column_if_missing(
        conn,
        "assignment_events",
        "idempotency_key",
        "TEXT NOT NULL DEFAULT ''",
    )?;

    Ok(())
}

fn add_column_if_missing(
    conn: &Connection,
    table: &str,
    column: &str,
    definition: &str,
) -> Result<(), StoreError> {
    let mut stmt = conn.prepare(&format!("PRAGMA table_info({table})"))?;
    let columns = stmt
        .query_map([], |row| row.get::<_, String>(1))?
        .collect::<Result<Vec<_>, _>>()?;
    if !columns.iter().any(|name| name == column) {
        conn.execute_batch(&format!(
            "ALTER TABLE {table} ADD COLUMN {column} {definition}"
        ))?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use faultline_core::{Classification, template_id_for};
    use tempfile::tempdir;

    use super::*;

    fn template(text: &str, at: i64) -> Template {
        Template {
            template_id: template_id_for("linux|mock|m|4", text),
            namespace: "linux|mock|m|4".to_owned(),
            os_class: OsClass::Linux,
            template_text: text.to_owned(),
            created_at: at,
        }
    }

    fn alert(alert_id: &str, classification: &Classification, at: i64) -> Alert {
        Alert {
            alert_id: alert_id.to_owned(),
            source_ref: SourceRef::Issue {
                issue_id: format!("issue-{alert_id}"),
            },
            prototype_id: None,
            namespace: "linux|mock|m|4".to_owned(),
            classification: classification.category.clone(),
            confidence: classification.confidence,
            rationale: classification.rationale.clone(),
            generated_at: at,
            ttl_secs: 60,
        }
    }

    fn write(alert: Alert, dedup_key: &str, now: i64) -> EnrichmentWrite {
        EnrichmentWrite {
            alert,
            dedup_key: dedup_key.to_owned(),
            dedup_ttl_secs: 10,
            alert_partitions: 4,
            prototype_update: None,
            request_id: None,
            now,
        }
    }

    #[test]
    fn store_creates_layout_and_reopens() {
        let temp = tempdir().expect("tempdir");
        let store = SqliteStore::open(temp.path()).expect("open store");
        assert!(store.faultline_dir().join("meta.sqlite").exists());

        let first = store
            .upsert_template(&template("kernel: disk <*> error", 10))
            .expect("first upsert");
        assert!(first.is_new);
        let second = store
            .upsert_template(&template("kernel: disk <*> error", 20))
            .expect("second upsert");
        assert!(!second.is_new);
        drop(store);

        let reopened = SqliteStore::open(temp.path()).expect("reopen store");
        let loaded = reopened
            .get_template(&first.template_id)
            .expect("get template")
            .expect("template exists");
        assert_eq!(loaded.template_text, "kernel: disk <*> error");
        assert_eq!(loaded.created_at, 10);
        assert_eq!(
            reopened
                .count_templates("linux|mock|m|4")
                .expect("count templates"),
            1
        );
    }

    #[test]
    fn counters_increment_atomically() {
        let temp = tempdir().expect("tempdir");
        let store = SqliteStore::open(temp.path()).expect("open store");
        assert_eq!(store.counter_value(COUNTER_QUARANTINED).expect("read"), 0);
        store
            .increment_counter(COUNTER_QUARANTINED, 1)
            .expect("increment");
        let value = store
            .increment_counter(COUNTER_QUARANTINED, 2)
            .expect("increment");
        assert_eq!(value, 3);
    }

    #[test]
    fn enrichment_write_dedups_and_detects_redelivery() {
        let temp = tempdir().expect("tempdir");
        let store = SqliteStore::open(temp.path()).expect("open store");
        let classification = Classification {
            category: "disk".to_owned(),
            confidence: 0.9,
            rationale: "io errors".to_owned(),
        };

        let first = store
            .record_enrichment(write(alert("a-1", &classification, 1_000), "dedup", 1_000))
            .expect("first write");
        assert_eq!(first, EnrichmentOutcome::Emitted);

        let redelivered = store
            .record_enrichment(write(alert("a-1", &classification, 1_000), "dedup", 1_500))
            .expect("redelivery");
        assert_eq!(redelivered, EnrichmentOutcome::Duplicate);

        let suppressed = store
            .record_enrichment(write(alert("a-2", &classification, 2_000), "dedup", 2_000))
            .expect("suppressed write");
        assert_eq!(
            suppressed,
            EnrichmentOutcome::Suppressed {
                existing_alert_id: "a-1".to_owned()
            }
        );
        assert!(store.get_alert("a-2").expect("get alert").is_none());

        let after_ttl = store
            .record_enrichment(write(alert("a-3", &classification, 20_000), "dedup", 20_000))
            .expect("after ttl");
        assert_eq!(after_ttl, EnrichmentOutcome::Emitted);

        assert_eq!(store.queue_depth(QueueName::Alerts).expect("depth"), 2);
        let loaded = store
            .get_alert("a-1")
            .expect("get alert")
            .expect("alert exists");
        assert_eq!(loaded.classification, "disk");
        assert_eq!(
            store
                .counter_value(COUNTER_ALERTS_SUPPRESSED)
                .expect("counter"),
            1
        );
    }

    #[test]
    fn enrichment_requests_gate_duplicates_and_record_failures() {
        let temp = tempdir().expect("tempdir");
        let store = SqliteStore::open(temp.path()).expect("open store");
        let source = SourceRef::Prototype {
            prototype_id: "p-1".to_owned(),
        };

        assert!(store.try_begin_enrichment("req-1", &source, 1).expect("begin"));
        assert!(!store.try_begin_enrichment("req-1", &source, 2).expect("begin again"));

        store
            .mark_unenriched("req-1", &source, "classifier timeout", 3)
            .expect("mark unenriched");
        assert_eq!(
            store.enrichment_state("req-1").expect("state").as_deref(),
            Some("unenriched")
        );
        assert_eq!(store.counter_value(COUNTER_UNENRICHED).expect("counter"), 1);
    }

    #[test]
    fn expired_alerts_and_old_history_are_pruned() {
        let temp = tempdir().expect("tempdir");
        let store = SqliteStore::open(temp.path()).expect("open store");
        let classification = Classification {
            category: "disk".to_owned(),
            confidence: 0.9,
            rationale: "io errors".to_owned(),
        };
        let source = SourceRef::Issue {
            issue_id: "issue-a-1".to_owned(),
        };
        assert!(store.try_begin_enrichment("req-1", &source, 1_000).expect("begin"));
        assert!(store.try_begin_enrichment("req-2", &source, 1_000).expect("begin"));
        let mut finished = write(alert("a-1", &classification, 1_000), "dedup", 1_000);
        finished.request_id = Some("req-1".to_owned());
        store.record_enrichment(finished).expect("write alert");
        for at in [1, 2] {
            store
                .insert_drift_report(&DriftReportRecord {
                    namespace: "a".to_owned(),
                    window_secs: 60,
                    generated_at: at,
                    report_json: "{}".to_owned(),
                })
                .expect("insert report");
        }

        let dedup_only = store.prune_expired(12_000, 0).expect("first prune");
        assert_eq!(
            dedup_only,
            PruneSummary {
                dedup_records: 1,
                ..PruneSummary::default()
            }
        );
        assert!(store.get_alert("a-1").expect("get alert").is_some());

        let later = store.prune_expired(61_000, 5_000).expect("second prune");
        assert_eq!(later.alerts, 1);
        assert_eq!(later.enrichment_requests, 1);
        assert_eq!(later.drift_reports, 1);
        assert_eq!(later.total(), 3);
        assert!(store.get_alert("a-1").expect("get alert").is_none());
        assert_eq!(store.enrichment_state("req-1").expect("state"), None);
        assert_eq!(
            store.enrichment_state("req-2").expect("state").as_deref(),
            Some("pending")
        );
        assert_eq!(store.latest_drift_reports().expect("latest").len(), 1);
    }

    #[test]
    fn latest_drift_reports_returns_one_row_per_namespace() {
        let temp = tempdir().expect("tempdir");
        let store = SqliteStore::open(temp.path()).expect("open store");
        for (namespace, at) in [("a", 1), ("a", 2), ("b", 3)] {
            store
                .insert_drift_report(&DriftReportRecord {
                    namespace: namespace.to_owned(),
                    window_secs: 60,
                    generated_at: at,
                    report_json: format!("{{\"at\":{at}}}"),
                })
                .expect("insert report");
        }

        let latest = store.latest_drift_reports().expect("latest");
        assert_eq!(latest.len(), 2);
        assert_eq!(latest[0].namespace, "a");
        assert_eq!(latest[0].generated_at, 2);
        assert_eq!(latest[1].namespace, "b");
    }
}
