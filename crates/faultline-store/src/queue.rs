//! Durable, partitioned, at-least-once queues backed by the store's SQLite database.
//!
//! A message is invisible while claimed; if it is not acked before `visible_at`
//! it is redelivered. Every claim counts as one delivery attempt.

use std::fmt;

use faultline_core::partition_for;
use rusqlite::{Connection, params};

use crate::{COUNTER_DEAD_LETTERED, SqliteStore, StoreError, increment_counter_in};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum QueueName {
    Logs,
    Issues,
    Enrich,
    EnrichRetry,
    Alerts,
}

impl QueueName {
    pub const ALL: [QueueName; 5] = [
        Self::Logs,
        Self::Issues,
        Self::Enrich,
        Self::EnrichRetry,
        Self::Alerts,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Logs => "logs",
            Self::Issues => "issues",
            Self::Enrich => "enrich",
            Self::EnrichRetry => "enrich_retry",
            Self::Alerts => "alerts",
        }
    }
}

impl std::str::FromStr for QueueName {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim() {
            "logs" => Ok(Self::Logs),
            "issues" => Ok(Self::Issues),
            "enrich" => Ok(Self::Enrich),
            "enrich_retry" | "enrich-retry" => Ok(Self::EnrichRetry),
            "alerts" => Ok(Self::Alerts),
            other => Err(format!(
                "invalid queue '{other}', expected one of: logs, issues, enrich, enrich_retry, alerts"
            )),
        }
    }
}

impl fmt::Display for QueueName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewQueueMessage {
    pub queue: QueueName,
    pub partition_key: String,
    pub payload: String,
    pub partitions: u32,
    pub delay_ms: i64,
}

impl NewQueueMessage {
    pub fn new(
        queue: QueueName,
        partition_key: impl Into<String>,
        payload: impl Into<String>,
        partitions: u32,
    ) -> Self {
        Self {
            queue,
            partition_key: partition_key.into(),
            payload: payload.into(),
            partitions,
            delay_ms: 0,
        }
    }

    pub fn delayed(mut self, delay_ms: i64) -> Self {
        self.delay_ms = delay_ms.max(0);
        self
    }

    pub fn partition(&self) -> u32 {
        partition_for(&self.partition_key, self.partitions)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueMessage {
    pub message_id: i64,
    pub queue: QueueName,
    pub partition: u32,
    pub partition_key: String,
    pub payload: String,
    /// Deliveries so far, including this one.
    pub attempts: u32,
    pub enqueued_at: i64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeadLetterRecord {
    pub original_id: i64,
    pub queue: String,
    pub partition_key: String,
    pub payload: String,
    pub attempts: u32,
    pub reason: String,
    pub dead_lettered_at: i64,
}

/// Which partitions a consumer owns: those with `partition % consumer_count == consumer_index`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PartitionAssignment {
    pub consumer_index: u32,
    pub consumer_count: u32,
}

impl PartitionAssignment {
    pub fn new(consumer_index: u32, consumer_count: u32) -> Self {
        let consumer_count = consumer_count.max(1);
        Self {
            consumer_index: consumer_index % consumer_count,
            consumer_count,
        }
    }

    pub fn single() -> Self {
        Self::new(0, 1)
    }

    pub fn owns(&self, partition: u32) -> bool {
        partition % self.consumer_count == self.consumer_index
    }
}

#[derive(Debug, Clone, Copy)]
pub struct ClaimRequest<'a> {
    pub queue: QueueName,
    pub assignment: PartitionAssignment,
    pub consumer: &'a str,
    pub limit: usize,
    pub visibility_ms: i64,
    pub max_attempts: u32,
}

pub(crate) fn insert_message(
    conn: &Connection,
    message: &NewQueueMessage,
    now: i64,
) -> Result<i64, StoreError> {
    conn.execute(
        r#"
        INSERT INTO queue_messages (
            queue, partition_no, partition_key, payload, attempts, enqueued_at, visible_at, claimed_by
        ) VALUES (?1, ?2, ?3, ?4, 0, ?5, ?6, NULL)
        "#,
        params![
            message.queue.as_str(),
            i64::from(message.partition()),
            message.partition_key,
            message.payload,
            now,
            now.saturating_add(message.delay_ms),
        ],
    )?;
    Ok(conn.last_insert_rowid())
}

fn move_to_dead_letters(
    conn: &Connection,
    message_id: i64,
    reason: &str,
    now: i64,
) -> Result<bool, StoreError> {
    let moved = conn.execute(
        r#"
        INSERT INTO dead_letters (
            original_id, queue, partition_key, payload, attempts, reason, dead_lettered_at
        )
        SELECT id, queue, partition_key, payload, attempts, ?2, ?3
        FROM queue_messages
        WHERE id = ?1
        "#,
        params![message_id, reason, now],
    )?;
    conn.execute("DELETE FROM queue_messages WHERE id = ?1", params![message_id])?;
    if moved > 0 {
        increment_counter_in(conn, COUNTER_DEAD_LETTERED, 1)?;
    }
    Ok(moved > 0)
}

impl SqliteStore {
    pub fn enqueue(&self, message: &NewQueueMessage, now: i64) -> Result<i64, StoreError> {
        let conn = self.lock()?;
        insert_message(&conn, message, now)
    }

    /// Enqueues all messages in one transaction.
    pub fn enqueue_batch(&self, messages: &[NewQueueMessage], now: i64) -> Result<(), StoreError> {
        self.with_immediate_tx(|tx| {
            for message in messages {
                insert_message(tx, message, now)?;
            }
            Ok(())
        })
    }

    /// Claims up to `limit` due messages from owned partitions in enqueue order.
    /// Messages that already used `max_attempts` deliveries are dead-lettered instead.
    pub fn claim_batch(
        &self,
        request: &ClaimRequest<'_>,
        now: i64,
    ) -> Result<Vec<QueueMessage>, StoreError> {
        let ClaimRequest {
            queue,
            assignment,
            consumer,
            limit,
            visibility_ms,
            max_attempts,
        } = *request;
        self.with_immediate_tx(|tx| {
            let candidates = {
                let mut stmt = tx.prepare(
                    r#"
                    SELECT id, partition_no, partition_key, payload, attempts, enqueued_at
                    FROM queue_messages
                    WHERE queue = ?1
                      AND visible_at <= ?2
                      AND (partition_no % ?3) = ?4
                    ORDER BY id ASC
                    LIMIT ?5
                    "#,
                )?;
                let rows = stmt.query_map(
                    params![
                        queue.as_str(),
                        now,
                        i64::from(assignment.consumer_count),
                        i64::from(assignment.consumer_index),
                        limit.clamp(1, 10_000) as i64,
                    ],
                    |row| {
                        Ok((
                            row.get::<_, i64>(0)?,
                            row.get::<_, i64>(1)?,
                            row.get::<_, String>(2)?,
                            row.get::<_, String>(3)?,
                            row.get::<_, i64>(4)?,
                            row.get::<_, i64>(5)?,
                        ))
                    },
                )?;
                rows.collect::<Result<Vec<_>, _>>()?
            };

            let mut claimed = Vec::with_capacity(candidates.len());
            for (message_id, partition, partition_key, payload, attempts, enqueued_at) in candidates
            {
                let attempts = attempts.max(0) as u32;
                if attempts >= max_attempts.max(1) {
                    move_to_dead_letters(
                        tx,
                        message_id,
                        &format!("exceeded {max_attempts} delivery attempts"),
                        now,
                    )?;
                    tracing::error!(
                        queue = queue.as_str(),
                        partition_key = %partition_key,
                        attempts,
                        "message dead-lettered after repeated redelivery"
                    );
                    continue;
                }

                tx.execute(
                    r#"
                    UPDATE queue_messages
                    SET attempts = attempts + 1,
                        visible_at = ?2,
                        claimed_by = ?3
                    WHERE id = ?1
                    "#,
                    params![message_id, now.saturating_add(visibility_ms.max(1)), consumer],
                )?;
                claimed.push(QueueMessage {
                    message_id,
                    queue,
                    partition: partition.max(0) as u32,
                    partition_key,
                    payload,
                    attempts: attempts + 1,
                    enqueued_at,
                });
            }

            Ok(claimed)
        })
    }

    pub fn ack(&self, message_ids: &[i64]) -> Result<(), StoreError> {
        if message_ids.is_empty() {
            return Ok(());
        }
        self.with_immediate_tx(|tx| {
            for message_id in message_ids {
                tx.execute("DELETE FROM queue_messages WHERE id = ?1", params![message_id])?;
            }
            Ok(())
        })
    }

    /// Makes a claimed message visible again after `delay_ms`; the attempt stays counted.
    pub fn release(&self, message_id: i64, delay_ms: i64, now: i64) -> Result<(), StoreError> {
        let conn = self.lock()?;
        conn.execute(
            "UPDATE queue_messages SET visible_at = ?2, claimed_by = NULL WHERE id = ?1",
            params![message_id, now.saturating_add(delay_ms.max(0))],
        )?;
        Ok(())
    }

    /// Returns claimed-but-unprocessed messages (shutdown); the attempt is refunded.
    pub fn abandon(&self, message_ids: &[i64], now: i64) -> Result<(), StoreError> {
        if message_ids.is_empty() {
            return Ok(());
        }
        self.with_immediate_tx(|tx| {
            for message_id in message_ids {
                tx.execute(
                    r#"
                    UPDATE queue_messages
                    SET visible_at = ?2,
                        claimed_by = NULL,
                        attempts = MAX(attempts - 1, 0)
                    WHERE id = ?1
                    "#,
                    params![message_id, now],
                )?;
            }
            Ok(())
        })
    }

    /// Pushes the visibility deadline of held messages forward.
    pub fn extend_lease(
        &self,
        message_ids: &[i64],
        visibility_ms: i64,
        now: i64,
    ) -> Result<(), StoreError> {
        if message_ids.is_empty() {
            return Ok(());
        }
        self.with_immediate_tx(|tx| {
            let visible_at = now.saturating_add(visibility_ms.max(1));
            for message_id in message_ids {
                tx.execute(
                    "UPDATE queue_messages SET visible_at = MAX(visible_at, ?2) WHERE id = ?1",
                    params![message_id, visible_at],
                )?;
            }
            Ok(())
        })
    }

    pub fn dead_letter(&self, message_id: i64, reason: &str, now: i64) -> Result<bool, StoreError> {
        self.with_immediate_tx(|tx| move_to_dead_letters(tx, message_id, reason, now))
    }

    pub fn queue_depth(&self, queue: QueueName) -> Result<u64, StoreError> {
        let conn = self.lock()?;
        let depth: i64 = conn.query_row(
            "SELECT COUNT(*) FROM queue_messages WHERE queue = ?1",
            params![queue.as_str()],
            |row| row.get(0),
        )?;
        Ok(depth.max(0) as u64)
    }

    pub fn dead_letter_count(&self, queue: QueueName) -> Result<u64, StoreError> {
        let conn = self.lock()?;
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM dead_letters WHERE queue = ?1",
            params![queue.as_str()],
            |row| row.get(0),
        )?;
        Ok(count.max(0) as u64)
    }

    pub fn list_dead_letters(
        &self,
        queue: QueueName,
        limit: u32,
    ) -> Result<Vec<DeadLetterRecord>, StoreError> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            r#"
            SELECT original_id, queue, partition_key, payload, attempts, reason, dead_lettered_at
            FROM dead_letters
            WHERE queue = ?1
            ORDER BY id ASC
            LIMIT ?2
            "#,
        )?;
        let rows = stmt.query_map(
            params![queue.as_str(), i64::from(limit.clamp(1, 10_000))],
            |row| {
                Ok(DeadLetterRecord {
                    original_id: row.get(0)?,
                    queue: row.get(1)?,
                    partition_key: row.get(2)?,
                    payload: row.get(3)?,
                    attempts: row.get::<_, i64>(4)?.max(0) as u32,
                    reason: row.get(5)?,
                    dead_lettered_at: row.get(6)?,
                })
            },
        )?;
        let records = rows.collect::<Result<Vec<_>, _>>()?;
        Ok(records)
    }
}
