use faultline_core::vector::cosine_distance;
use faultline_core::{ClusterPrototype, Namespace};
use rusqlite::{Connection, OptionalExtension, Row, params};

use crate::{
    AssignmentCommit, AssignmentEvent, AssignmentRecord, CommittedAssignment, FeedbackRecord,
    PrototypeNeighbor, PrototypeStore, PrototypeWrite, RefinementCommit, RefinementStore,
    SqliteStore, StoreError, mode_from_sql,
};

const PROTOTYPE_COLUMNS: &str = r#"
    prototype_id, namespace, centroid_json, member_count, last_classification, confidence,
    classified_member_count, examples_json, embedding_mode, version, superseded_by,
    created_at, updated_at
"#;

type PrototypeRow = (
    String,
    String,
    String,
    i64,
    Option<String>,
    Option<f64>,
    i64,
    String,
    String,
    i64,
    Option<String>,
    i64,
    i64,
);

fn read_prototype_row(row: &Row<'_>) -> rusqlite::Result<PrototypeRow> {
    Ok((
        row.get(0)?,
        row.get(1)?,
        row.get(2)?,
        row.get(3)?,
        row.get(4)?,
        row.get(5)?,
        row.get(6)?,
        row.get(7)?,
        row.get(8)?,
        row.get(9)?,
        row.get(10)?,
        row.get(11)?,
        row.get(12)?,
    ))
}

fn prototype_from_row(row: PrototypeRow) -> Result<ClusterPrototype, StoreError> {
    let (
        prototype_id,
        namespace,
        centroid_json,
        member_count,
        last_classification,
        confidence,
        classified_member_count,
        examples_json,
        embedding_mode,
        version,
        superseded_by,
        created_at,
        updated_at,
    ) = row;

    Ok(ClusterPrototype {
        prototype_id,
        namespace,
        centroid: serde_json::from_str(&centroid_json)?,
        member_count: member_count.max(0) as u64,
        last_classification,
        confidence: confidence.map(|value| value as f32),
        classified_member_count: classified_member_count.max(0) as u64,
        examples: serde_json::from_str(&examples_json)?,
        embedding_mode: mode_from_sql(&embedding_mode)?,
        version,
        superseded_by,
        created_at,
        updated_at,
    })
}

fn load_prototype(
    conn: &Connection,
    prototype_id: &str,
) -> Result<Option<ClusterPrototype>, StoreError> {
    let row = conn
        .query_row(
            &format!("SELECT {PROTOTYPE_COLUMNS} FROM prototypes WHERE prototype_id = ?1"),
            params![prototype_id],
            read_prototype_row,
        )
        .optional()?;
    row.map(prototype_from_row).transpose()
}

fn insert_prototype(conn: &Connection, prototype: &ClusterPrototype) -> Result<(), StoreError> {
    conn.execute(
        r#"
        INSERT INTO prototypes (
            prototype_id, namespace, centroid_json, member_count, last_classification, confidence,
            classified_member_count, examples_json, embedding_mode, version, superseded_by,
            superseded_reason, created_at, updated_at
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, NULL, NULL, ?11, ?12)
        "#,
        params![
            prototype.prototype_id,
            prototype.namespace,
            serde_json::to_string(&prototype.centroid)?,
            prototype.member_count as i64,
            prototype.last_classification,
            prototype.confidence.map(f64::from),
            prototype.classified_member_count as i64,
            serde_json::to_string(&prototype.examples)?,
            prototype.embedding_mode.as_str(),
            prototype.version,
            prototype.created_at,
            prototype.updated_at,
        ],
    )?;
    Ok(())
}

fn check_dimension(namespace: &Namespace, vector_len: usize) -> Result<(), StoreError> {
    if vector_len != namespace.dim {
        return Err(StoreError::NamespaceMismatch {
            expected: namespace.key(),
            actual: format!("vector of dimension {vector_len}"),
        });
    }
    Ok(())
}

impl SqliteStore {
    /// Live and superseded prototypes of a namespace, ordered by id.
    pub fn list_prototypes(
        &self,
        namespace: &str,
        live_only: bool,
    ) -> Result<Vec<ClusterPrototype>, StoreError> {
        let conn = self.lock()?;
        let sql = if live_only {
            format!(
                "SELECT {PROTOTYPE_COLUMNS} FROM prototypes WHERE namespace = ?1 AND superseded_by IS NULL ORDER BY prototype_id"
            )
        } else {
            format!(
                "SELECT {PROTOTYPE_COLUMNS} FROM prototypes WHERE namespace = ?1 ORDER BY prototype_id"
            )
        };
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(params![namespace], read_prototype_row)?;
        let rows = rows.collect::<Result<Vec<_>, _>>()?;
        rows.into_iter().map(prototype_from_row).collect()
    }

    pub fn list_namespaces(&self) -> Result<Vec<String>, StoreError> {
        let conn = self.lock()?;
        let mut stmt =
            conn.prepare("SELECT DISTINCT namespace FROM prototypes ORDER BY namespace")?;
        let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;
        let namespaces = rows.collect::<Result<Vec<_>, _>>()?;
        Ok(namespaces)
    }

    /// Follows `superseded_by` links to the prototype currently holding the members.
    pub fn resolve_live_prototype(
        &self,
        prototype_id: &str,
    ) -> Result<Option<ClusterPrototype>, StoreError> {
        let conn = self.lock()?;
        let mut current = load_prototype(&conn, prototype_id)?;
        for _ in 0..32 {
            let next = match &current {
                Some(prototype) => prototype.superseded_by.clone(),
                None => return Ok(None),
            };
            match next {
                Some(next) => current = load_prototype(&conn, &next)?,
                None => return Ok(current),
            }
        }
        Ok(None)
    }

    /// `(total, new)` assignments recorded for a namespace since `since` (ms).
    pub fn assignment_counts(&self, namespace: &str, since: i64) -> Result<(u64, u64), StoreError> {
        let conn = self.lock()?;
        let (total, new): (i64, i64) = conn.query_row(
            r#"
            SELECT COUNT(*), COALESCE(SUM(is_new), 0)
            FROM assignment_events
            WHERE namespace = ?1 AND created_at >= ?2
            "#,
            params![namespace, since],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )?;
        Ok((total.max(0) as u64, new.max(0) as u64))
    }

    /// Most recent assignment events of a namespace, newest first.
    pub fn sample_assignment_events(
        &self,
        namespace: &str,
        since: i64,
        limit: usize,
    ) -> Result<Vec<AssignmentEvent>, StoreError> {
        self.query_events(
            r#"
            SELECT id, namespace, prototype_id, is_new, example_id, text, vector_json, created_at
            FROM assignment_events
            WHERE namespace = ?1 AND created_at >= ?2
            ORDER BY id DESC
            LIMIT ?3
            "#,
            params![namespace, since, limit.clamp(1, 100_000) as i64],
        )
    }

    /// Logged members of one prototype, oldest first.
    pub fn events_for_prototype(
        &self,
        prototype_id: &str,
        limit: usize,
    ) -> Result<Vec<AssignmentEvent>, StoreError> {
        self.query_events(
            r#"
            SELECT id, namespace, prototype_id, is_new, example_id, text, vector_json, created_at
            FROM assignment_events
            WHERE prototype_id = ?1
            ORDER BY id ASC
            LIMIT ?2
            "#,
            params![prototype_id, limit.clamp(1, 100_000) as i64],
        )
    }

    fn query_events(
        &self,
        sql: &str,
        params: impl rusqlite::Params,
    ) -> Result<Vec<AssignmentEvent>, StoreError> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(sql)?;
        let rows = stmt.query_map(params, |row| {
            Ok((
                row.get::<_, i64>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, i64>(3)?,
                row.get::<_, String>(4)?,
                row.get::<_, String>(5)?,
                row.get::<_, String>(6)?,
                row.get::<_, i64>(7)?,
            ))
        })?;
        let rows = rows.collect::<Result<Vec<_>, _>>()?;

        rows.into_iter()
            .map(
                |(event_id, namespace, prototype_id, is_new, example_id, text, vector_json, created_at)| {
                    Ok(AssignmentEvent {
                        event_id,
                        namespace,
                        prototype_id,
                        is_new: is_new != 0,
                        example_id,
                        text,
                        vector: serde_json::from_str(&vector_json)?,
                        created_at,
                    })
                },
            )
            .collect()
    }

    pub fn prune_assignment_events(&self, before: i64) -> Result<usize, StoreError> {
        let conn = self.lock()?;
        let deleted = conn.execute(
            "DELETE FROM assignment_events WHERE created_at < ?1",
            params![before],
        )?;
        Ok(deleted)
    }

    /// Applies every merge and split of one improver pass, then deletes the processed
    /// feedback. Any version conflict rolls the whole refinement back.
    pub fn apply_refinement(&self, commit: &RefinementCommit, now: i64) -> Result<(), StoreError> {
        self.with_immediate_tx(|tx| {
            for merge in &commit.merges {
                let loser = load_prototype(tx, &merge.loser_id)?
                    .ok_or_else(|| StoreError::UnknownPrototype(merge.loser_id.clone()))?;
                if loser.version != merge.loser_expected_version || !loser.is_live() {
                    return Err(StoreError::VersionConflict {
                        prototype_id: merge.loser_id.clone(),
                    });
                }

                let updated = tx.execute(
                    r#"
                    UPDATE prototypes
                    SET centroid_json = ?3,
                        member_count = member_count + ?4,
                        examples_json = ?5,
                        version = version + 1,
                        updated_at = ?6
                    WHERE prototype_id = ?1 AND version = ?2 AND superseded_by IS NULL
                    "#,
                    params![
                        merge.survivor_id,
                        merge.survivor_expected_version,
                        serde_json::to_string(&merge.centroid)?,
                        loser.member_count as i64,
                        serde_json::to_string(&merge.examples)?,
                        now,
                    ],
                )?;
                if updated == 0 {
                    return Err(StoreError::VersionConflict {
                        prototype_id: merge.survivor_id.clone(),
                    });
                }

                supersede(tx, &merge.loser_id, merge.loser_expected_version, &merge.survivor_id, "merge", now)?;
                tx.execute(
                    "UPDATE assignment_events SET prototype_id = ?2 WHERE prototype_id = ?1",
                    params![merge.loser_id, merge.survivor_id],
                )?;
                tx.execute(
                    "UPDATE assignment_idempotency SET prototype_id = ?2 WHERE prototype_id = ?1",
                    params![merge.loser_id, merge.survivor_id],
                )?;
            }

            for split in &commit.splits {
                let Some(heir) = split.heir().map(|child| child.prototype_id.clone()) else {
                    continue;
                };

                for child in &split.children {
                    insert_prototype(tx, child)?;
                }
                supersede(tx, &split.parent_id, split.parent_expected_version, &heir, "split", now)?;
                for (event_id, child_id) in &split.reassignments {
                    tx.execute(
                        "UPDATE assignment_events SET prototype_id = ?2 WHERE id = ?1",
                        params![event_id, child_id],
                    )?;
                    tx.execute(
                        r#"
                        UPDATE assignment_idempotency SET prototype_id = ?2
                        WHERE idempotency_key = (
                            SELECT idempotency_key FROM assignment_events WHERE id = ?1
                        )
                        "#,
                        params![event_id, child_id],
                    )?;
                }
            }

            for feedback_id in &commit.processed_feedback_ids {
                tx.execute(
                    "DELETE FROM feedback WHERE feedback_id = ?1",
                    params![feedback_id],
                )?;
            }

            Ok(())
        })
    }
}

fn supersede(
    conn: &Connection,
    prototype_id: &str,
    expected_version: i64,
    superseded_by: &str,
    reason: &str,
    now: i64,
) -> Result<(), StoreError> {
    let updated = conn.execute(
        r#"
        UPDATE prototypes
        SET superseded_by = ?3,
            superseded_reason = ?4,
            version = version + 1,
            updated_at = ?5
        WHERE prototype_id = ?1 AND version = ?2 AND superseded_by IS NULL
        "#,
        params![prototype_id, expected_version, superseded_by, reason, now],
    )?;
    if updated == 0 {
        return Err(StoreError::VersionConflict {
            prototype_id: prototype_id.to_owned(),
        });
    }
    Ok(())
}

impl RefinementStore for SqliteStore {
    fn list_feedback(&self, limit: usize) -> Result<Vec<FeedbackRecord>, StoreError> {
        SqliteStore::list_feedback(self, limit)
    }

    fn resolve_live_prototype(
        &self,
        prototype_id: &str,
    ) -> Result<Option<ClusterPrototype>, StoreError> {
        SqliteStore::resolve_live_prototype(self, prototype_id)
    }

    fn list_namespaces(&self) -> Result<Vec<String>, StoreError> {
        SqliteStore::list_namespaces(self)
    }

    fn list_prototypes(
        &self,
        namespace: &str,
        live_only: bool,
    ) -> Result<Vec<ClusterPrototype>, StoreError> {
        SqliteStore::list_prototypes(self, namespace, live_only)
    }

    fn events_for_prototype(
        &self,
        prototype_id: &str,
        limit: usize,
    ) -> Result<Vec<AssignmentEvent>, StoreError> {
        SqliteStore::events_for_prototype(self, prototype_id, limit)
    }

    fn apply_refinement(&self, commit: &RefinementCommit, now: i64) -> Result<(), StoreError> {
        SqliteStore::apply_refinement(self, commit, now)
    }
}

impl PrototypeStore for SqliteStore {
    fn nearest_prototypes(
        &self,
        namespace: &Namespace,
        vector: &[f32],
        limit: usize,
    ) -> Result<Vec<PrototypeNeighbor>, StoreError> {
        check_dimension(namespace, vector.len())?;
        let key = namespace.key();
        let prototypes = self.list_prototypes(&key, true)?;

        let mut neighbors = Vec::with_capacity(prototypes.len());
        for prototype in prototypes {
            if prototype.centroid.len() != namespace.dim {
                return Err(StoreError::NamespaceMismatch {
                    expected: key,
                    actual: format!(
                        "prototype {} with centroid dimension {}",
                        prototype.prototype_id,
                        prototype.centroid.len()
                    ),
                });
            }
            let distance = cosine_distance(vector, &prototype.centroid);
            neighbors.push(PrototypeNeighbor {
                prototype,
                distance,
            });
        }

        neighbors.sort_by(|left, right| {
            left.distance
                .partial_cmp(&right.distance)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| right.prototype.member_count.cmp(&left.prototype.member_count))
                .then_with(|| left.prototype.prototype_id.cmp(&right.prototype.prototype_id))
        });
        neighbors.truncate(limit.max(1));
        Ok(neighbors)
    }

    fn get_prototype(&self, prototype_id: &str) -> Result<Option<ClusterPrototype>, StoreError> {
        let conn = self.lock()?;
        load_prototype(&conn, prototype_id)
    }

    fn lookup_assignment(
        &self,
        idempotency_key: &str,
    ) -> Result<Option<AssignmentRecord>, StoreError> {
        let conn = self.lock()?;
        lookup_assignment_in(&conn, idempotency_key)
    }

    fn commit_assignment(
        &self,
        commit: AssignmentCommit,
    ) -> Result<CommittedAssignment, StoreError> {
        self.with_immediate_tx(|tx| {
            if let Some(existing) = lookup_assignment_in(tx, &commit.idempotency_key)? {
                let member_count = load_prototype(tx, &existing.prototype_id)?
                    .map(|prototype| prototype.member_count)
                    .unwrap_or(0);
                return Ok(CommittedAssignment {
                    prototype_id: existing.prototype_id,
                    is_new: existing.is_new,
                    member_count,
                    replayed: true,
                });
            }

            let is_new = matches!(commit.write, PrototypeWrite::Create(_));
            match &commit.write {
                PrototypeWrite::Create(prototype) => {
                    if prototype.namespace != commit.namespace {
                        return Err(StoreError::NamespaceMismatch {
                            expected: commit.namespace.clone(),
                            actual: prototype.namespace.clone(),
                        });
                    }
                    insert_prototype(tx, prototype)?;
                }
                PrototypeWrite::Update {
                    prototype_id,
                    expected_version,
                    centroid,
                    examples,
                } => {
                    let updated = tx.execute(
                        r#"
                        UPDATE prototypes
                        SET centroid_json = ?4,
                            member_count = member_count + 1,
                            examples_json = ?5,
                            version = version + 1,
                            updated_at = MAX(updated_at, ?6)
                        WHERE prototype_id = ?1
                          AND namespace = ?2
                          AND version = ?3
                          AND superseded_by IS NULL
                        "#,
                        params![
                            prototype_id,
                            commit.namespace,
                            expected_version,
                            serde_json::to_string(centroid)?,
                            serde_json::to_string(examples)?,
                            commit.now,
                        ],
                    )?;
                    if updated == 0 {
                        return Err(StoreError::VersionConflict {
                            prototype_id: prototype_id.clone(),
                        });
                    }
                }
            }

            let prototype_id = commit.write.prototype_id().to_owned();
            tx.execute(
                r#"
                INSERT INTO assignment_idempotency (idempotency_key, prototype_id, is_new, created_at)
                VALUES (?1, ?2, ?3, ?4)
                "#,
                params![commit.idempotency_key, prototype_id, is_new as i64, commit.now],
            )?;
            tx.execute(
                r#"
                INSERT INTO assignment_events (
                    namespace, prototype_id, is_new, example_id, idempotency_key, text,
                    vector_json, created_at
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
                "#,
                params![
                    commit.namespace,
                    prototype_id,
                    is_new as i64,
                    commit.example_id,
                    commit.idempotency_key,
                    commit.text,
                    serde_json::to_string(&commit.vector)?,
                    commit.now,
                ],
            )?;

            let member_count = tx.query_row(
                "SELECT member_count FROM prototypes WHERE prototype_id = ?1",
                params![prototype_id],
                |row| row.get::<_, i64>(0),
            )?;

            Ok(CommittedAssignment {
                prototype_id,
                is_new,
                member_count: member_count.max(0) as u64,
                replayed: false,
            })
        })
    }
}

fn lookup_assignment_in(
    conn: &Connection,
    idempotency_key: &str,
) -> Result<Option<AssignmentRecord>, StoreError> {
    let row = conn
        .query_row(
            "SELECT prototype_id, is_new FROM assignment_idempotency WHERE idempotency_key = ?1",
            params![idempotency_key],
            |row| Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?)),
        )
        .optional()?;
    Ok(row.map(|(prototype_id, is_new)| AssignmentRecord {
        prototype_id,
        is_new: is_new != 0,
    }))
}
