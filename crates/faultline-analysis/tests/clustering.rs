use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use faultline_analysis::{AnalysisError, AssignmentInput, ClusteringEngine};
use faultline_config::ClusteringConfig;
use faultline_core::{ClusterPrototype, EmbeddingMode, Namespace, OsClass};
use faultline_store::{
    AssignmentCommit, AssignmentRecord, CommittedAssignment, PrototypeNeighbor, PrototypeStore,
    PrototypeWrite, SqliteStore, StoreError,
};
use faultline_template::embedding_text_for_free_text;
use tempfile::tempdir;

fn namespace(dim: usize) -> Namespace {
    Namespace::new(OsClass::Linux, "test", format!("bytes-{dim}"), dim)
}

fn config(distance_threshold: f32) -> ClusteringConfig {
    ClusteringConfig {
        distance_threshold,
        ..ClusteringConfig::default()
    }
}

fn angle(degrees: f32) -> Vec<f32> {
    let radians = degrees.to_radians();
    vec![radians.cos(), radians.sin()]
}

/// Byte-bucket embedding: deterministic and sensitive to every character.
fn byte_embedding(text: &str) -> Vec<f32> {
    let mut vector = vec![0.0f32; 8];
    for byte in text.bytes() {
        vector[usize::from(byte) % 8] += 1.0;
    }
    vector
}

fn assign(
    engine: &ClusteringEngine,
    namespace: &Namespace,
    key: &str,
    vector: Vec<f32>,
) -> Result<faultline_analysis::Assignment, AnalysisError> {
    engine.assign(AssignmentInput {
        namespace,
        idempotency_key: key,
        example_id: key,
        text: key,
        vector,
        embedding_mode: EmbeddingMode::Templated,
        now: 1_000,
    })
}

#[test]
fn same_idempotency_key_never_creates_two_prototypes() -> Result<(), Box<dyn std::error::Error>> {
    let temp = tempdir()?;
    let store = Arc::new(SqliteStore::open(temp.path())?);
    let engine = ClusteringEngine::new(store.clone(), config(0.25));
    let ns = namespace(2);

    let first = assign(&engine, &ns, "issue:1", angle(10.0))?;
    let second = assign(&engine, &ns, "issue:1", angle(10.0))?;

    assert!(first.is_new);
    assert!(!first.replayed);
    assert!(second.replayed);
    assert_eq!(first.prototype_id, second.prototype_id);
    assert_eq!(store.list_prototypes(&ns.key(), true)?.len(), 1);
    assert_eq!(store.assignment_counts(&ns.key(), 0)?, (1, 1));
    Ok(())
}

#[test]
fn nearby_candidates_join_and_far_ones_create() -> Result<(), Box<dyn std::error::Error>> {
    let temp = tempdir()?;
    let store = Arc::new(SqliteStore::open(temp.path())?);
    let engine = ClusteringEngine::new(store.clone(), config(0.25));
    let ns = namespace(2);

    let seed = assign(&engine, &ns, "line:a", angle(0.0))?;
    let joined = assign(&engine, &ns, "line:b", angle(10.0))?;
    let distant = assign(&engine, &ns, "line:c", angle(90.0))?;

    assert_eq!(joined.prototype_id, seed.prototype_id);
    assert!(!joined.is_new);
    assert_eq!(joined.member_count, 2);
    assert!(joined.distance.is_some_and(|distance| distance < 0.02));
    assert!(distant.is_new);

    let prototype = store
        .get_prototype(&seed.prototype_id)?
        .expect("seed prototype");
    assert_eq!(prototype.member_count, 2);
    assert_eq!(prototype.version, 1);
    assert_eq!(prototype.examples, vec!["line:a".to_owned(), "line:b".to_owned()]);
    let expected = angle(5.0);
    assert!((prototype.centroid[0] - expected[0]).abs() < 1e-4);
    assert!((prototype.centroid[1] - expected[1]).abs() < 1e-4);
    Ok(())
}

#[test]
fn raising_the_threshold_never_lowers_the_existing_assignment_rate()
-> Result<(), Box<dyn std::error::Error>> {
    let stream = [0.0f32, 120.0, 240.0, 1.0, 121.0, 241.0, 2.0, 122.0, 242.0, 0.5];
    let thresholds = [0.000_01f32, 0.01, 0.5, 2.0];

    let mut existing_rates = Vec::new();
    for threshold in thresholds {
        let temp = tempdir()?;
        let store = Arc::new(SqliteStore::open(temp.path())?);
        let engine = ClusteringEngine::new(store, config(threshold));
        let ns = namespace(2);

        let mut existing = 0usize;
        for (index, degrees) in stream.iter().enumerate() {
            let assignment = assign(&engine, &ns, &format!("line:{index}"), angle(*degrees))?;
            if !assignment.is_new {
                existing += 1;
            }
        }
        existing_rates.push(existing as f32 / stream.len() as f32);
    }

    for pair in existing_rates.windows(2) {
        assert!(pair[0] <= pair[1], "rates {existing_rates:?}");
    }
    assert!((existing_rates[2] - 0.7).abs() < 1e-6);
    assert!((existing_rates[3] - 0.9).abs() < 1e-6);
    Ok(())
}

#[test]
fn templated_mode_groups_lines_that_raw_mode_separates() -> Result<(), Box<dyn std::error::Error>>
{
    let lines = [
        "Temperature sensor CPU1 reading 45°C",
        "Temperature sensor CPU1 reading 95°C",
    ];
    assert_eq!(
        embedding_text_for_free_text(EmbeddingMode::Templated, lines[0]),
        "Temperature sensor <*> reading <*>°C"
    );

    let mut prototypes_per_mode = Vec::new();
    for mode in [EmbeddingMode::Templated, EmbeddingMode::Raw] {
        let temp = tempdir()?;
        let store = Arc::new(SqliteStore::open(temp.path())?);
        let engine = ClusteringEngine::new(store.clone(), config(0.001));
        let ns = namespace(8);

        for (index, line) in lines.iter().enumerate() {
            let text = embedding_text_for_free_text(mode, line);
            engine.assign(AssignmentInput {
                namespace: &ns,
                idempotency_key: &format!("line:{index}"),
                example_id: &format!("entry-{index}"),
                text: &text,
                vector: byte_embedding(&text),
                embedding_mode: mode,
                now: 1_000,
            })?;
        }
        let prototypes = store.list_prototypes(&ns.key(), true)?;
        assert!(prototypes.iter().all(|prototype| prototype.embedding_mode == mode));
        prototypes_per_mode.push(prototypes.len());
    }

    assert_eq!(prototypes_per_mode, vec![1, 2]);
    Ok(())
}

#[test]
fn dimension_mismatch_is_an_invariant_violation() -> Result<(), Box<dyn std::error::Error>> {
    let temp = tempdir()?;
    let store = Arc::new(SqliteStore::open(temp.path())?);
    let engine = ClusteringEngine::new(store.clone(), config(0.25));

    let err = assign(&engine, &namespace(3), "line:x", angle(0.0)).expect_err("dim mismatch");
    assert!(matches!(err, AnalysisError::Invariant(_)));

    let err = assign(&engine, &namespace(2), "line:y", vec![0.0, 0.0]).expect_err("zero vector");
    assert!(matches!(err, AnalysisError::EmptyVector));
    assert!(store.list_namespaces()?.is_empty());
    Ok(())
}

struct FailingCommitStore {
    inner: Arc<SqliteStore>,
    write_before_failing: bool,
}

impl PrototypeStore for FailingCommitStore {
    fn nearest_prototypes(
        &self,
        namespace: &Namespace,
        vector: &[f32],
        limit: usize,
    ) -> Result<Vec<PrototypeNeighbor>, StoreError> {
        self.inner.nearest_prototypes(namespace, vector, limit)
    }

    fn get_prototype(&self, prototype_id: &str) -> Result<Option<ClusterPrototype>, StoreError> {
        self.inner.get_prototype(prototype_id)
    }

    fn lookup_assignment(
        &self,
        idempotency_key: &str,
    ) -> Result<Option<AssignmentRecord>, StoreError> {
        self.inner.lookup_assignment(idempotency_key)
    }

    fn commit_assignment(
        &self,
        commit: AssignmentCommit,
    ) -> Result<CommittedAssignment, StoreError> {
        if self.write_before_failing {
            self.inner.commit_assignment(commit)?;
        }
        Err(StoreError::InvalidValue("simulated store failure".to_owned()))
    }
}

#[test]
fn failed_commit_leaves_no_orphan_and_retry_is_idempotent()
-> Result<(), Box<dyn std::error::Error>> {
    let temp = tempdir()?;
    let store = Arc::new(SqliteStore::open(temp.path())?);
    let ns = namespace(2);

    let failing = ClusteringEngine::new(
        Arc::new(FailingCommitStore {
            inner: store.clone(),
            write_before_failing: false,
        }),
        config(0.25),
    );
    assert!(assign(&failing, &ns, "issue:9", angle(0.0)).is_err());
    assert!(store.list_prototypes(&ns.key(), false)?.is_empty());
    assert!(store.lookup_assignment("issue:9")?.is_none());

    let lost_ack = ClusteringEngine::new(
        Arc::new(FailingCommitStore {
            inner: store.clone(),
            write_before_failing: true,
        }),
        config(0.25),
    );
    assert!(assign(&lost_ack, &ns, "issue:9", angle(0.0)).is_err());

    let healthy = ClusteringEngine::new(store.clone(), config(0.25));
    let retried = assign(&healthy, &ns, "issue:9", angle(0.0))?;
    assert!(retried.replayed);
    assert!(retried.is_new);
    assert_eq!(store.list_prototypes(&ns.key(), false)?.len(), 1);
    assert_eq!(store.assignment_counts(&ns.key(), 0)?, (1, 1));
    Ok(())
}

struct RacingStore {
    inner: Arc<SqliteStore>,
    raced: AtomicBool,
}

impl PrototypeStore for RacingStore {
    fn nearest_prototypes(
        &self,
        namespace: &Namespace,
        vector: &[f32],
        limit: usize,
    ) -> Result<Vec<PrototypeNeighbor>, StoreError> {
        self.inner.nearest_prototypes(namespace, vector, limit)
    }

    fn get_prototype(&self, prototype_id: &str) -> Result<Option<ClusterPrototype>, StoreError> {
        self.inner.get_prototype(prototype_id)
    }

    fn lookup_assignment(
        &self,
        idempotency_key: &str,
    ) -> Result<Option<AssignmentRecord>, StoreError> {
        self.inner.lookup_assignment(idempotency_key)
    }

    fn commit_assignment(
        &self,
        commit: AssignmentCommit,
    ) -> Result<CommittedAssignment, StoreError> {
        if let PrototypeWrite::Update { prototype_id, .. } = &commit.write
            && !self.raced.swap(true, Ordering::SeqCst)
        {
            let current = self
                .inner
                .get_prototype(prototype_id)?
                .expect("raced prototype exists");
            self.inner.commit_assignment(AssignmentCommit {
                idempotency_key: format!("{}:competitor", commit.idempotency_key),
                namespace: commit.namespace.clone(),
                write: PrototypeWrite::Update {
                    prototype_id: prototype_id.clone(),
                    expected_version: current.version,
                    centroid: current.centroid.clone(),
                    examples: current.examples.clone(),
                },
                example_id: "competitor".to_owned(),
                text: "competitor".to_owned(),
                vector: current.centroid.clone(),
                now: commit.now,
            })?;
        }
        self.inner.commit_assignment(commit)
    }
}

#[test]
fn version_conflict_rereads_and_retries() -> Result<(), Box<dyn std::error::Error>> {
    let temp = tempdir()?;
    let store = Arc::new(SqliteStore::open(temp.path())?);
    let ns = namespace(2);
    let seed = assign(
        &ClusteringEngine::new(store.clone(), config(0.25)),
        &ns,
        "line:seed",
        angle(0.0),
    )?;

    let engine = ClusteringEngine::new(
        Arc::new(RacingStore {
            inner: store.clone(),
            raced: AtomicBool::new(false),
        }),
        config(0.25),
    );
    let assignment = assign(&engine, &ns, "line:late", angle(5.0))?;

    assert_eq!(assignment.prototype_id, seed.prototype_id);
    assert_eq!(assignment.member_count, 3);
    let prototype = store.get_prototype(&seed.prototype_id)?.expect("seed");
    assert_eq!(prototype.version, 2);

    let no_retries = ClusteringEngine::new(
        Arc::new(RacingStore {
            inner: store.clone(),
            raced: AtomicBool::new(false),
        }),
        ClusteringConfig {
            cas_retries: 0,
            ..config(0.25)
        },
    );
    let err = assign(&no_retries, &ns, "line:unlucky", angle(3.0)).expect_err("conflict");
    assert!(matches!(
        err,
        AnalysisError::Store(StoreError::VersionConflict { .. })
    ));
    assert!(store.lookup_assignment("line:unlucky")?.is_none());
    Ok(())
}
