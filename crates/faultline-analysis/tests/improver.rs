use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use faultline_analysis::{AssignmentInput, ClusteringEngine, MetricsTracker, PrototypeImprover};
use faultline_config::{ClusteringConfig, DriftConfig, ImproverConfig};
use faultline_core::{ClusterPrototype, EmbeddingMode, Namespace, OsClass};
use faultline_store::{
    AssignmentEvent, FeedbackRecord, PrototypeStore, RefinementCommit, RefinementStore,
    SqliteStore, SqliteVectorStore, StoreError, VectorKind, VectorRecord, VectorStore,
};
use tempfile::tempdir;

fn namespace(dim: usize) -> Namespace {
    Namespace::new(OsClass::Linux, "test", format!("unit-{dim}"), dim)
}

fn angle(degrees: f32) -> Vec<f32> {
    let radians = degrees.to_radians();
    vec![radians.cos(), radians.sin()]
}

fn feed(
    engine: &ClusteringEngine,
    namespace: &Namespace,
    key: &str,
    text: &str,
    vector: Vec<f32>,
    now: i64,
) -> Result<String, Box<dyn std::error::Error>> {
    let assignment = engine.assign(AssignmentInput {
        namespace,
        idempotency_key: key,
        example_id: key,
        text,
        vector,
        embedding_mode: EmbeddingMode::Templated,
        now,
    })?;
    Ok(assignment.prototype_id)
}

/// Assigns like `feed` and stores the log vector tagged with its prototype, the
/// way the cluster stage does.
async fn feed_with_vector(
    engine: &ClusteringEngine,
    vectors: &dyn VectorStore,
    namespace: &Namespace,
    key: &str,
    text: &str,
    vector: Vec<f32>,
    now: i64,
) -> Result<String, Box<dyn std::error::Error>> {
    let prototype_id = feed(engine, namespace, key, text, vector.clone(), now)?;
    vectors
        .upsert_vectors(
            namespace,
            VectorKind::Log,
            &[VectorRecord {
                id: key.to_owned(),
                prototype_id: Some(prototype_id.clone()),
                text: text.to_owned(),
                embedding: vector,
                updated_at: now,
            }],
        )
        .await?;
    Ok(prototype_id)
}

async fn member_ids(
    vectors: &dyn VectorStore,
    namespace: &Namespace,
    prototype_id: &str,
) -> Result<Vec<String>, Box<dyn std::error::Error>> {
    let mut ids = vectors
        .search_nearest(namespace, VectorKind::Log, &angle(0.0), 50, Some(prototype_id))
        .await?
        .into_iter()
        .map(|row| row.id)
        .collect::<Vec<_>>();
    ids.sort();
    Ok(ids)
}

fn improver(
    store: &Arc<SqliteStore>,
    clustering: ClusteringConfig,
    config: ImproverConfig,
) -> (PrototypeImprover, Arc<dyn VectorStore>) {
    let vectors: Arc<dyn VectorStore> = Arc::new(SqliteVectorStore::new(store.clone()));
    (
        PrototypeImprover::new(store.clone(), vectors.clone(), clustering, config),
        vectors,
    )
}

#[tokio::test]
async fn near_duplicate_prototypes_merge_into_the_larger_one()
-> Result<(), Box<dyn std::error::Error>> {
    let temp = tempdir()?;
    let store = Arc::new(SqliteStore::open(temp.path())?);
    let clustering = ClusteringConfig {
        distance_threshold: 0.0001,
        ..ClusteringConfig::default()
    };
    let engine = ClusteringEngine::new(store.clone(), clustering.clone());
    let (improver, vectors) = improver(&store, clustering, ImproverConfig::default());
    let vectors = vectors.as_ref();
    let ns = namespace(2);

    let big = feed_with_vector(&engine, vectors, &ns, "line:1", "a", angle(0.0), 10).await?;
    assert_eq!(
        feed_with_vector(&engine, vectors, &ns, "line:2", "a", angle(0.0), 11).await?,
        big
    );
    let small = feed_with_vector(&engine, vectors, &ns, "line:3", "b", angle(3.0), 12).await?;
    let distinct = feed_with_vector(&engine, vectors, &ns, "line:4", "c", angle(90.0), 13).await?;
    assert_ne!(big, small);

    let report = improver.improve(100).await?;

    assert_eq!(report.merges.len(), 1);
    assert_eq!(report.merges[0].survivor_id, big);
    assert_eq!(report.merges[0].loser_id, small);
    assert!(report.splits.is_empty());

    let live = store.list_prototypes(&ns.key(), true)?;
    let live_ids = live
        .iter()
        .map(|prototype| prototype.prototype_id.clone())
        .collect::<Vec<_>>();
    assert_eq!(live.len(), 2);
    assert!(live_ids.contains(&big) && live_ids.contains(&distinct));

    let survivor = store.get_prototype(&big)?.expect("survivor");
    assert_eq!(survivor.member_count, 3);
    assert_eq!(
        store
            .resolve_live_prototype(&small)?
            .map(|prototype| prototype.prototype_id),
        Some(big.clone())
    );
    assert_eq!(store.events_for_prototype(&big, 10)?.len(), 3);
    assert_eq!(
        member_ids(vectors, &ns, &big).await?,
        vec!["line:1", "line:2", "line:3"]
    );
    assert!(member_ids(vectors, &ns, &small).await?.is_empty());
    assert_eq!(member_ids(vectors, &ns, &distinct).await?, vec!["line:4"]);

    let second = improver.improve(200).await?;
    assert!(second.is_noop());
    Ok(())
}

#[tokio::test]
async fn feedback_splits_a_mixed_prototype_and_is_cleared()
-> Result<(), Box<dyn std::error::Error>> {
    let temp = tempdir()?;
    let store = Arc::new(SqliteStore::open(temp.path())?);
    let clustering = ClusteringConfig {
        distance_threshold: 0.5,
        ..ClusteringConfig::default()
    };
    let engine = ClusteringEngine::new(store.clone(), clustering.clone());
    let (improver, vectors) = improver(
        &store,
        clustering,
        ImproverConfig {
            split_factor: 0.2,
            min_subcluster_size: 2,
            ..ImproverConfig::default()
        },
    );
    let vectors = vectors.as_ref();
    let ns = namespace(2);

    let mut prototype_id = String::new();
    for index in 0..3 {
        prototype_id = feed_with_vector(
            &engine,
            vectors,
            &ns,
            &format!("line:net-{index}"),
            "eth0: link down",
            angle(index as f32),
            10 + index,
        )
        .await?;
    }
    for index in 0..3 {
        let joined = feed_with_vector(
            &engine,
            vectors,
            &ns,
            &format!("line:raid-{index}"),
            "md0: raid degraded",
            angle(40.0 + index as f32),
            20 + index,
        )
        .await?;
        assert_eq!(joined, prototype_id);
    }

    store.record_feedback(&FeedbackRecord {
        feedback_id: "fb-1".to_owned(),
        alert_id: "alert-1".to_owned(),
        prototype_id: Some(prototype_id.clone()),
        namespace: ns.key(),
        category: Some("raid".to_owned()),
        created_at: 50,
    })?;

    let report = improver.improve(100).await?;

    assert_eq!(report.feedback_processed, 1);
    assert_eq!(report.splits.len(), 1);
    let split = &report.splits[0];
    assert_eq!(split.parent_id, prototype_id);
    assert_eq!(split.children.len(), 2);
    let mut labels = split.labels.iter().flatten().cloned().collect::<Vec<_>>();
    labels.sort();
    assert_eq!(labels, vec!["network".to_owned(), "raid".to_owned()]);

    let parent = store.get_prototype(&prototype_id)?.expect("parent kept");
    assert!(parent.superseded_by.is_some());
    let children = store.list_prototypes(&ns.key(), true)?;
    assert_eq!(children.len(), 2);
    assert_eq!(
        children.iter().map(|child| child.member_count).sum::<u64>(),
        6
    );
    for child in &children {
        assert_eq!(store.events_for_prototype(&child.prototype_id, 10)?.len(), 3);
        let members = member_ids(vectors, &ns, &child.prototype_id).await?;
        assert_eq!(members.len(), 3);
        let family = if members[0].starts_with("line:net") {
            "line:net"
        } else {
            "line:raid"
        };
        assert!(members.iter().all(|id| id.starts_with(family)));

        let replay = engine.assign(AssignmentInput {
            namespace: &ns,
            idempotency_key: &members[0],
            example_id: &members[0],
            text: "replayed",
            vector: angle(0.0),
            embedding_mode: EmbeddingMode::Templated,
            now: 300,
        })?;
        assert!(replay.replayed);
        assert_eq!(replay.prototype_id, child.prototype_id);
    }
    assert!(member_ids(vectors, &ns, &prototype_id).await?.is_empty());
    assert!(store.list_feedback(10)?.is_empty());
    Ok(())
}

/// Lands one assignment on the store right before the first refinement commit.
struct RacingRefinementStore {
    inner: Arc<SqliteStore>,
    engine: ClusteringEngine,
    namespace: Namespace,
    raced: AtomicBool,
}

impl RefinementStore for RacingRefinementStore {
    fn list_feedback(&self, limit: usize) -> Result<Vec<FeedbackRecord>, StoreError> {
        self.inner.list_feedback(limit)
    }

    fn resolve_live_prototype(
        &self,
        prototype_id: &str,
    ) -> Result<Option<ClusterPrototype>, StoreError> {
        self.inner.resolve_live_prototype(prototype_id)
    }

    fn list_namespaces(&self) -> Result<Vec<String>, StoreError> {
        self.inner.list_namespaces()
    }

    fn list_prototypes(
        &self,
        namespace: &str,
        live_only: bool,
    ) -> Result<Vec<ClusterPrototype>, StoreError> {
        self.inner.list_prototypes(namespace, live_only)
    }

    fn events_for_prototype(
        &self,
        prototype_id: &str,
        limit: usize,
    ) -> Result<Vec<AssignmentEvent>, StoreError> {
        self.inner.events_for_prototype(prototype_id, limit)
    }

    fn apply_refinement(&self, commit: &RefinementCommit, now: i64) -> Result<(), StoreError> {
        if !self.raced.swap(true, Ordering::SeqCst) {
            self.engine
                .assign(AssignmentInput {
                    namespace: &self.namespace,
                    idempotency_key: "line:late",
                    example_id: "line:late",
                    text: "a",
                    vector: angle(0.0),
                    embedding_mode: EmbeddingMode::Templated,
                    now,
                })
                .map_err(|err| StoreError::InvalidValue(err.to_string()))?;
        }
        self.inner.apply_refinement(commit, now)
    }
}

#[tokio::test]
async fn refinement_replans_after_a_concurrent_assignment()
-> Result<(), Box<dyn std::error::Error>> {
    let temp = tempdir()?;
    let store = Arc::new(SqliteStore::open(temp.path())?);
    let clustering = ClusteringConfig {
        distance_threshold: 0.0001,
        ..ClusteringConfig::default()
    };
    let engine = ClusteringEngine::new(store.clone(), clustering.clone());
    let ns = namespace(2);

    let big = feed(&engine, &ns, "line:1", "a", angle(0.0), 10)?;
    feed(&engine, &ns, "line:2", "a", angle(0.0), 11)?;
    let small = feed(&engine, &ns, "line:3", "b", angle(3.0), 12)?;

    let racing = Arc::new(RacingRefinementStore {
        inner: store.clone(),
        engine: ClusteringEngine::new(store.clone(), clustering.clone()),
        namespace: ns.clone(),
        raced: AtomicBool::new(false),
    });
    let vectors: Arc<dyn VectorStore> = Arc::new(SqliteVectorStore::new(store.clone()));
    let improver =
        PrototypeImprover::new(racing, vectors, clustering, ImproverConfig::default());

    let report = improver.improve(100).await?;
    assert_eq!(report.replans, 1);
    assert_eq!(report.merges.len(), 1);
    assert_eq!(report.merges[0].survivor_id, big);
    assert_eq!(report.merges[0].loser_id, small);

    let survivor = store.get_prototype(&big)?.expect("survivor");
    assert_eq!(survivor.member_count, 4);
    assert!(!store.get_prototype(&small)?.expect("loser kept").is_live());
    Ok(())
}

#[test]
fn mostly_novel_stream_reports_high_new_cluster_rate() -> Result<(), Box<dyn std::error::Error>> {
    let temp = tempdir()?;
    let store = Arc::new(SqliteStore::open(temp.path())?);
    let engine = ClusteringEngine::new(
        store.clone(),
        ClusteringConfig {
            distance_threshold: 0.05,
            ..ClusteringConfig::default()
        },
    );
    let dim = 16;
    let ns = namespace(dim);
    let basis = |axis: usize| {
        let mut vector = vec![0.0f32; dim];
        vector[axis] = 1.0;
        vector
    };

    let mut novel = 0usize;
    for index in 0..20usize {
        let vector = if index % 5 == 4 {
            basis(index / 5)
        } else {
            novel += 1;
            basis(novel - 1)
        };
        feed(&engine, &ns, &format!("issue:{index}"), "text", vector, 1_000_000)?;
    }

    let tracker = MetricsTracker::new(
        store.clone(),
        DriftConfig {
            min_assignments: 10,
            ..DriftConfig::default()
        },
    );
    let report = tracker.report(&ns.key(), 60, 1_000_500)?;

    assert_eq!(report.assignments, 20);
    assert_eq!(report.new_prototypes, 16);
    assert!((report.new_cluster_rate - 0.8).abs() < 0.05);
    assert!(report.high_drift);
    assert_eq!(report.live_prototypes, 16);

    tracker.persist(&report)?;
    let latest = store.latest_drift_reports()?;
    assert_eq!(latest.len(), 1);
    assert_eq!(latest[0].namespace, ns.key());

    let stale = tracker.report(&ns.key(), 60, 1_000_000 + 61_000)?;
    assert_eq!(stale.assignments, 0);
    assert_eq!(stale.new_cluster_rate, 0.0);
    assert!(!stale.high_drift);
    Ok(())
}
