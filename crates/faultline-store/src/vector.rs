//! Namespaced vector storage for raw-log and template embeddings.
//!
//! Each `(kind, namespace)` pair is its own vector space. A query or record whose
//! dimension differs from the namespace is rejected, never coerced.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use arrow_array::types::Float32Type;
use arrow_array::{
    Array, ArrayRef, FixedSizeListArray, Float32Array, Float64Array, Int64Array, RecordBatch,
    RecordBatchIterator, StringArray,
};
use arrow_schema::{DataType, Field, Schema, SchemaRef};
use async_trait::async_trait;
use faultline_config::{EmbeddingVectorBackend, faultline_dir, load_workspace_config};
use faultline_core::Namespace;
use faultline_core::vector::cosine_similarity;
use futures::TryStreamExt;
use lancedb::query::{ExecutableQuery, QueryBase, Select};
use lancedb::{Connection as LanceConnection, DistanceType, Error as LanceError, Table, connect};
use rusqlite::params;

use crate::{SqliteStore, StoreError};

const LOG_TABLE_PREFIX: &str = "log_vectors_";
const TEMPLATE_TABLE_PREFIX: &str = "template_vectors_";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum VectorKind {
    Log,
    Template,
}

impl VectorKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Log => "log",
            Self::Template => "template",
        }
    }

    fn table_prefix(self) -> &'static str {
        match self {
            Self::Log => LOG_TABLE_PREFIX,
            Self::Template => TEMPLATE_TABLE_PREFIX,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct VectorRecord {
    pub id: String,
    pub prototype_id: Option<String>,
    pub text: String,
    pub embedding: Vec<f32>,
    pub updated_at: i64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct VectorSearchResult {
    pub id: String,
    pub prototype_id: Option<String>,
    pub text: String,
    pub score: f32,
}

/// Moves member vectors from one prototype to another after a merge or split.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VectorRetag {
    pub from_prototype: String,
    pub to_prototype: String,
    /// Restricts the move to these vector ids. Empty moves every vector still on
    /// `from_prototype`.
    pub ids: Vec<String>,
}

#[async_trait]
pub trait VectorStore: Send + Sync {
    async fn upsert_vectors(
        &self,
        namespace: &Namespace,
        kind: VectorKind,
        records: &[VectorRecord],
    ) -> Result<(), StoreError>;
    /// Nearest vectors by cosine similarity, optionally restricted to one prototype's members.
    async fn search_nearest(
        &self,
        namespace: &Namespace,
        kind: VectorKind,
        query: &[f32],
        limit: u32,
        prototype_id: Option<&str>,
    ) -> Result<Vec<VectorSearchResult>, StoreError>;
    async fn count_vectors(&self, namespace: &Namespace, kind: VectorKind)
    -> Result<u64, StoreError>;
    /// Applies `retags` in order.
    async fn retag_vectors(
        &self,
        namespace: &Namespace,
        kind: VectorKind,
        retags: &[VectorRetag],
    ) -> Result<(), StoreError>;
    /// Drops vectors last written before `before` (unix ms).
    async fn prune_vectors(
        &self,
        namespace: &Namespace,
        kind: VectorKind,
        before: i64,
    ) -> Result<(), StoreError>;
}

pub async fn open_vector_store(
    workspace_root: impl AsRef<Path>,
    store: Arc<SqliteStore>,
) -> Result<Arc<dyn VectorStore>, StoreError> {
    let workspace_root = workspace_root.as_ref();
    let config = load_workspace_config(workspace_root)?;

    match config.embeddings.vector_backend {
        EmbeddingVectorBackend::Sqlite => Ok(Arc::new(SqliteVectorStore::new(store))),
        EmbeddingVectorBackend::Lancedb => {
            Ok(Arc::new(LanceVectorStore::open(workspace_root).await?))
        }
    }
}

fn check_dimension(namespace: &Namespace, len: usize) -> Result<(), StoreError> {
    if len != namespace.dim {
        return Err(StoreError::NamespaceMismatch {
            expected: namespace.key(),
            actual: format!("vector of dimension {len}"),
        });
    }
    Ok(())
}

fn sort_and_truncate(rows: &mut Vec<VectorSearchResult>, limit: usize) {
    rows.sort_by(|left, right| {
        right
            .score
            .partial_cmp(&left.score)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| left.id.cmp(&right.id))
    });
    rows.truncate(limit);
}

impl SqliteStore {
    fn upsert_vector_rows(
        &self,
        namespace_key: &str,
        kind: VectorKind,
        records: &[VectorRecord],
    ) -> Result<(), StoreError> {
        self.with_immediate_tx(|tx| {
            for record in records {
                tx.execute(
                    r#"
                    INSERT INTO vectors (namespace, kind, id, prototype_id, text, embedding_json, updated_at)
                    VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
                    ON CONFLICT(namespace, kind, id) DO UPDATE SET
                        prototype_id = excluded.prototype_id,
                        text = excluded.text,
                        embedding_json = excluded.embedding_json,
                        updated_at = excluded.updated_at
                    "#,
                    params![
                        namespace_key,
                        kind.as_str(),
                        record.id,
                        record.prototype_id,
                        record.text,
                        serde_json::to_string(&record.embedding)?,
                        record.updated_at,
                    ],
                )?;
            }
            Ok(())
        })
    }

    fn load_vector_rows(
        &self,
        namespace_key: &str,
        kind: VectorKind,
        prototype_id: Option<&str>,
    ) -> Result<Vec<VectorRecord>, StoreError> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            r#"
            SELECT id, prototype_id, text, embedding_json, updated_at
            FROM vectors
            WHERE namespace = ?1
              AND kind = ?2
              AND (?3 IS NULL OR prototype_id = ?3)
            "#,
        )?;
        let rows = stmt.query_map(params![namespace_key, kind.as_str(), prototype_id], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, Option<String>>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, String>(3)?,
                row.get::<_, i64>(4)?,
            ))
        })?;
        let rows = rows.collect::<Result<Vec<_>, _>>()?;

        let mut records = Vec::with_capacity(rows.len());
        for (id, prototype_id, text, embedding_json, updated_at) in rows {
            records.push(VectorRecord {
                id,
                prototype_id,
                text,
                embedding: serde_json::from_str(&embedding_json)?,
                updated_at,
            });
        }
        Ok(records)
    }

    fn retag_vector_rows(
        &self,
        namespace_key: &str,
        kind: VectorKind,
        retags: &[VectorRetag],
    ) -> Result<(), StoreError> {
        self.with_immediate_tx(|tx| {
            for retag in retags {
                if retag.ids.is_empty() {
                    tx.execute(
                        r#"
                        UPDATE vectors SET prototype_id = ?4
                        WHERE namespace = ?1 AND kind = ?2 AND prototype_id = ?3
                        "#,
                        params![
                            namespace_key,
                            kind.as_str(),
                            retag.from_prototype,
                            retag.to_prototype
                        ],
                    )?;
                    continue;
                }
                for id in &retag.ids {
                    tx.execute(
                        r#"
                        UPDATE vectors SET prototype_id = ?5
                        WHERE namespace = ?1 AND kind = ?2 AND id = ?3 AND prototype_id = ?4
                        "#,
                        params![
                            namespace_key,
                            kind.as_str(),
                            id,
                            retag.from_prototype,
                            retag.to_prototype
                        ],
                    )?;
                }
            }
            Ok(())
        })
    }

    fn prune_vector_rows(
        &self,
        namespace_key: &str,
        kind: VectorKind,
        before: i64,
    ) -> Result<usize, StoreError> {
        let conn = self.lock()?;
        let deleted = conn.execute(
            "DELETE FROM vectors WHERE namespace = ?1 AND kind = ?2 AND updated_at < ?3",
            params![namespace_key, kind.as_str(), before],
        )?;
        Ok(deleted)
    }

    fn count_vector_rows(&self, namespace_key: &str, kind: VectorKind) -> Result<u64, StoreError> {
        let conn = self.lock()?;
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM vectors WHERE namespace = ?1 AND kind = ?2",
            params![namespace_key, kind.as_str()],
            |row| row.get(0),
        )?;
        Ok(count.max(0) as u64)
    }
}

/// Brute-force cosine search over rows in the shared SQLite database.
pub struct SqliteVectorStore {
    store: Arc<SqliteStore>,
}

impl SqliteVectorStore {
    pub fn new(store: Arc<SqliteStore>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl VectorStore for SqliteVectorStore {
    async fn upsert_vectors(
        &self,
        namespace: &Namespace,
        kind: VectorKind,
        records: &[VectorRecord],
    ) -> Result<(), StoreError> {
        for record in records {
            check_dimension(namespace, record.embedding.len())?;
        }
        self.store
            .upsert_vector_rows(&namespace.key(), kind, records)
    }

    async fn search_nearest(
        &self,
        namespace: &Namespace,
        kind: VectorKind,
        query: &[f32],
        limit: u32,
        prototype_id: Option<&str>,
    ) -> Result<Vec<VectorSearchResult>, StoreError> {
        check_dimension(namespace, query.len())?;
        let limit = limit.clamp(1, 100) as usize;
        let key = namespace.key();

        let mut rows = Vec::new();
        for record in self.store.load_vector_rows(&key, kind, prototype_id)? {
            if record.embedding.len() != query.len() {
                return Err(StoreError::NamespaceMismatch {
                    expected: key,
                    actual: format!(
                        "stored vector {} of dimension {}",
                        record.id,
                        record.embedding.len()
                    ),
                });
            }
            rows.push(VectorSearchResult {
                score: cosine_similarity(query, &record.embedding),
                id: record.id,
                prototype_id: record.prototype_id,
                text: record.text,
            });
        }

        sort_and_truncate(&mut rows, limit);
        Ok(rows)
    }

    async fn count_vectors(
        &self,
        namespace: &Namespace,
        kind: VectorKind,
    ) -> Result<u64, StoreError> {
        self.store.count_vector_rows(&namespace.key(), kind)
    }

    async fn retag_vectors(
        &self,
        namespace: &Namespace,
        kind: VectorKind,
        retags: &[VectorRetag],
    ) -> Result<(), StoreError> {
        self.store
            .retag_vector_rows(&namespace.key(), kind, retags)
    }

    async fn prune_vectors(
        &self,
        namespace: &Namespace,
        kind: VectorKind,
        before: i64,
    ) -> Result<(), StoreError> {
        self.store
            .prune_vector_rows(&namespace.key(), kind, before)
            .map(|_| ())
    }
}

pub struct LanceVectorStore {
    vectors_dir: PathBuf,
}

impl LanceVectorStore {
    pub async fn open(workspace_root: impl AsRef<Path>) -> Result<Self, StoreError> {
        let vectors_dir = faultline_dir(workspace_root).join("vectors");
        fs::create_dir_all(&vectors_dir)?;
        Ok(Self { vectors_dir })
    }

    async fn connect(&self) -> Result<LanceConnection, StoreError> {
        connect(self.vectors_dir.to_string_lossy().as_ref())
            .execute()
            .await
            .map_err(map_lancedb_err)
    }

    async fn open_existing(
        &self,
        kind: VectorKind,
        namespace: &Namespace,
    ) -> Result<Option<Table>, StoreError> {
        let connection = self.connect().await?;
        match connection
            .open_table(&table_name_for(kind, namespace))
            .execute()
            .await
        {
            Ok(table) => Ok(Some(table)),
            Err(LanceError::TableNotFound { .. }) => Ok(None),
            Err(err) => Err(map_lancedb_err(err)),
        }
    }
}

#[async_trait]
impl VectorStore for LanceVectorStore {
    async fn upsert_vectors(
        &self,
        namespace: &Namespace,
        kind: VectorKind,
        records: &[VectorRecord],
    ) -> Result<(), StoreError> {
        if records.is_empty() {
            return Ok(());
        }
        for record in records {
            check_dimension(namespace, record.embedding.len())?;
        }

        let table_name = table_name_for(kind, namespace);
        let connection = self.connect().await?;
        let table = match connection.open_table(&table_name).execute().await {
            Ok(table) => table,
            Err(LanceError::TableNotFound { .. }) => {
                let (schema, batch) = record_batch(records, namespace.dim as i32)?;
                let reader = RecordBatchIterator::new(vec![Ok(batch)].into_iter(), schema);
                connection
                    .create_table(&table_name, Box::new(reader))
                    .execute()
                    .await
                    .map_err(map_lancedb_err)?;
                return Ok(());
            }
            Err(err) => return Err(map_lancedb_err(err)),
        };

        let (schema, batch) = record_batch(records, namespace.dim as i32)?;
        let reader = RecordBatchIterator::new(vec![Ok(batch)].into_iter(), schema);
        let mut merge = table.merge_insert(&["id"]);
        merge
            .when_matched_update_all(None)
            .when_not_matched_insert_all();
        merge
            .execute(Box::new(reader))
            .await
            .map_err(map_lancedb_err)?;
        Ok(())
    }

    async fn search_nearest(
        &self,
        namespace: &Namespace,
        kind: VectorKind,
        query: &[f32],
        limit: u32,
        prototype_id: Option<&str>,
    ) -> Result<Vec<VectorSearchResult>, StoreError> {
        check_dimension(namespace, query.len())?;
        let limit = limit.clamp(1, 100) as usize;
        let table_name = table_name_for(kind, namespace);
        let connection = self.connect().await?;
        let table = match connection.open_table(&table_name).execute().await {
            Ok(table) => table,
            Err(LanceError::TableNotFound { .. }) => return Ok(Vec::new()),
            Err(err) => return Err(map_lancedb_err(err)),
        };

        let mut query = table
            .query()
            .select(Select::columns(&["id", "prototype_id", "text", "_distance"]))
            .nearest_to(query)
            .map_err(map_lancedb_err)?
            .distance_type(DistanceType::Cosine)
            .limit(limit);
        if let Some(prototype_id) = prototype_id {
            query = query.only_if(format!(
                "prototype_id = '{}'",
                escape_sql_string(prototype_id)
            ));
        }

        let batches = query
            .execute()
            .await
            .map_err(map_lancedb_err)?
            .try_collect::<Vec<_>>()
            .await
            .map_err(map_lancedb_err)?;

        let mut rows = Vec::new();
        for batch in batches {
            let distances = batch
                .column_by_name("_distance")
                .ok_or_else(|| StoreError::LanceDb("missing _distance column".to_owned()))?;
            for idx in 0..batch.num_rows() {
                let distance = distance_at(distances, idx)?;
                rows.push(VectorSearchResult {
                    id: string_at(&batch, "id", idx)?,
                    prototype_id: optional_string_at(&batch, "prototype_id", idx)?,
                    text: string_at(&batch, "text", idx)?,
                    score: 1.0 - distance,
                });
            }
        }

        sort_and_truncate(&mut rows, limit);
        Ok(rows)
    }

    async fn count_vectors(
        &self,
        namespace: &Namespace,
        kind: VectorKind,
    ) -> Result<u64, StoreError> {
        let connection = self.connect().await?;
        let table = match connection
            .open_table(&table_name_for(kind, namespace))
            .execute()
            .await
        {
            Ok(table) => table,
            Err(LanceError::TableNotFound { .. }) => return Ok(0),
            Err(err) => return Err(map_lancedb_err(err)),
        };
        let count = table.count_rows(None).await.map_err(map_lancedb_err)?;
        Ok(count as u64)
    }

    async fn retag_vectors(
        &self,
        namespace: &Namespace,
        kind: VectorKind,
        retags: &[VectorRetag],
    ) -> Result<(), StoreError> {
        if retags.is_empty() {
            return Ok(());
        }
        let Some(table) = self.open_existing(kind, namespace).await? else {
            return Ok(());
        };

        for retag in retags {
            let mut predicate = format!(
                "prototype_id = '{}'",
                escape_sql_string(&retag.from_prototype)
            );
            if !retag.ids.is_empty() {
                let ids = retag
                    .ids
                    .iter()
                    .map(|id| format!("'{}'", escape_sql_string(id)))
                    .collect::<Vec<_>>()
                    .join(", ");
                predicate.push_str(&format!(" AND id IN ({ids})"));
            }
            table
                .update()
                .only_if(predicate)
                .column(
                    "prototype_id",
                    format!("'{}'", escape_sql_string(&retag.to_prototype)),
                )
                .execute()
                .await
                .map_err(map_lancedb_err)?;
        }
        Ok(())
    }

    async fn prune_vectors(
        &self,
        namespace: &Namespace,
        kind: VectorKind,
        before: i64,
    ) -> Result<(), StoreError> {
        let Some(table) = self.open_existing(kind, namespace).await? else {
            return Ok(());
        };
        let predicate = format!("updated_at < {before}");
        table
            .delete(predicate.as_str())
            .await
            .map_err(map_lancedb_err)?;
        Ok(())
    }
}

fn map_lancedb_err(err: LanceError) -> StoreError {
    StoreError::LanceDb(err.to_string())
}

fn vector_schema(embedding_dim: i32) -> SchemaRef {
    Arc::new(Schema::new(vec![
        Field::new("id", DataType::Utf8, false),
        Field::new("prototype_id", DataType::Utf8, true),
        Field::new("text", DataType::Utf8, false),
        Field::new(
            "embedding",
            DataType::FixedSizeList(
                Arc::new(Field::new("item", DataType::Float32, true)),
                embedding_dim,
            ),
            true,
        ),
        Field::new("updated_at", DataType::Int64, false),
    ]))
}

fn record_batch(
    records: &[VectorRecord],
    embedding_dim: i32,
) -> Result<(SchemaRef, RecordBatch), StoreError> {
    if embedding_dim <= 0 {
        return Err(StoreError::LanceDb(
            "embedding cannot be empty for LanceDB upsert".to_owned(),
        ));
    }

    let schema = vector_schema(embedding_dim);
    let embedding = FixedSizeListArray::from_iter_primitive::<Float32Type, _, _>(
        records.iter().map(|record| {
            Some(
                record
                    .embedding
                    .iter()
                    .copied()
                    .map(Some)
                    .collect::<Vec<Option<f32>>>(),
            )
        }),
        embedding_dim,
    );

    let columns: Vec<ArrayRef> = vec![
        Arc::new(StringArray::from(
            records
                .iter()
                .map(|record| record.id.clone())
                .collect::<Vec<_>>(),
        )),
        Arc::new(StringArray::from(
            records
                .iter()
                .map(|record| record.prototype_id.clone())
                .collect::<Vec<_>>(),
        )),
        Arc::new(StringArray::from(
            records
                .iter()
                .map(|record| record.text.clone())
                .collect::<Vec<_>>(),
        )),
        Arc::new(embedding),
        Arc::new(Int64Array::from(
            records
                .iter()
                .map(|record| record.updated_at)
                .collect::<Vec<_>>(),
        )),
    ];
    let batch = RecordBatch::try_new(schema.clone(), columns)
        .map_err(|err| StoreError::LanceDb(err.to_string()))?;
    Ok((schema, batch))
}

fn table_name_for(kind: VectorKind, namespace: &Namespace) -> String {
    format!(
        "{}{}_{}_{}_{}",
        kind.table_prefix(),
        namespace.dim,
        namespace.os_class.as_str(),
        sanitize_for_table_name(&namespace.provider),
        sanitize_for_table_name(&namespace.model)
    )
}

fn sanitize_for_table_name(value: &str) -> String {
    let mut output = String::with_capacity(value.len().min(64));
    for ch in value.chars() {
        if ch.is_ascii_alphanumeric() {
            output.push(ch.to_ascii_lowercase());
        } else {
            output.push('_');
        }
        if output.len() >= 48 {
            break;
        }
    }
    while output.contains("__") {
        output = output.replace("__", "_");
    }
    output.trim_matches('_').chars().take(48).collect::<String>()
}

fn distance_at(column: &ArrayRef, index: usize) -> Result<f32, StoreError> {
    if let Some(values) = column.as_any().downcast_ref::<Float32Array>() {
        if values.is_null(index) {
            return Err(StoreError::LanceDb("null distance value".to_owned()));
        }
        return Ok(values.value(index));
    }
    if let Some(values) = column.as_any().downcast_ref::<Float64Array>() {
        if values.is_null(index) {
            return Err(StoreError::LanceDb("null distance value".to_owned()));
        }
        return Ok(values.value(index) as f32);
    }

    Err(StoreError::LanceDb(format!(
        "unsupported _distance type: {:?}",
        column.data_type()
    )))
}

fn string_column<'a>(
    batch: &'a RecordBatch,
    column_name: &str,
) -> Result<&'a StringArray, StoreError> {
    batch
        .column_by_name(column_name)
        .ok_or_else(|| StoreError::LanceDb(format!("missing column {column_name}")))?
        .as_any()
        .downcast_ref::<StringArray>()
        .ok_or_else(|| StoreError::LanceDb(format!("column {column_name} is not Utf8")))
}

fn string_at(batch: &RecordBatch, column_name: &str, row: usize) -> Result<String, StoreError> {
    let array = string_column(batch, column_name)?;
    if array.is_null(row) {
        return Err(StoreError::LanceDb(format!(
            "column {column_name} has null at row {row}"
        )));
    }
    Ok(array.value(row).to_owned())
}

fn optional_string_at(
    batch: &RecordBatch,
    column_name: &str,
    row: usize,
) -> Result<Option<String>, StoreError> {
    let array = string_column(batch, column_name)?;
    if array.is_null(row) {
        return Ok(None);
    }
    Ok(Some(array.value(row).to_owned()))
}

fn escape_sql_string(value: &str) -> String {
    value.replace('\'', "''")
}
