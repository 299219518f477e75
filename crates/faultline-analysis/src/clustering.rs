use std::sync::Arc;

use faultline_config::ClusteringConfig;
use faultline_core::vector::{moving_centroid, normalize_vector};
use faultline_core::{ClusterPrototype, EmbeddingMode, Namespace, PrototypeId, prototype_id_for};
use faultline_store::{
    AssignmentCommit, PrototypeNeighbor, PrototypeStore, PrototypeWrite, StoreError,
};
use tracing::debug;

use crate::AnalysisError;

#[derive(Debug, Clone, PartialEq)]
pub struct AssignmentInput<'a> {
    pub namespace: &'a Namespace,
    /// Derived from the input (`issue:<id>` or `line:<id>`) so redelivery replays.
    pub idempotency_key: &'a str,
    pub example_id: &'a str,
    pub text: &'a str,
    pub vector: Vec<f32>,
    pub embedding_mode: EmbeddingMode,
    pub now: i64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Assignment {
    pub prototype_id: PrototypeId,
    pub is_new: bool,
    pub member_count: u64,
    /// Distance to the chosen prototype; `None` for new prototypes and replays.
    pub distance: Option<f32>,
    pub replayed: bool,
    /// The unit-length vector that was assigned.
    pub vector: Vec<f32>,
}

pub struct ClusteringEngine {
    store: Arc<dyn PrototypeStore>,
    config: ClusteringConfig,
}

impl ClusteringEngine {
    pub fn new(store: Arc<dyn PrototypeStore>, config: ClusteringConfig) -> Self {
        Self { store, config }
    }

    pub fn config(&self) -> &ClusteringConfig {
        &self.config
    }

    /// Assigns one candidate to its nearest prototype within the namespace, or
    /// creates a new prototype when nothing lies within `distance_threshold`.
    ///
    /// The prototype write, the idempotency record, and the assignment event commit
    /// together. A version conflict re-reads the neighbours and retries up to
    /// `cas_retries` times before surfacing [`StoreError::VersionConflict`].
    pub fn assign(&self, input: AssignmentInput<'_>) -> Result<Assignment, AnalysisError> {
        let namespace = input.namespace;
        if input.vector.len() != namespace.dim {
            return Err(AnalysisError::Invariant(format!(
                "vector of dimension {} cannot be assigned in namespace {}",
                input.vector.len(),
                namespace.key()
            )));
        }
        let vector = normalize_vector(input.vector.clone()).ok_or(AnalysisError::EmptyVector)?;

        if let Some(existing) = self.store.lookup_assignment(input.idempotency_key)? {
            let member_count = self
                .store
                .get_prototype(&existing.prototype_id)?
                .map(|prototype| prototype.member_count)
                .unwrap_or(0);
            return Ok(Assignment {
                prototype_id: existing.prototype_id,
                is_new: existing.is_new,
                member_count,
                distance: None,
                replayed: true,
                vector,
            });
        }

        let namespace_key = namespace.key();
        let mut attempt = 0usize;
        loop {
            let neighbors = self.store.nearest_prototypes(
                namespace,
                &vector,
                self.config.neighbors.max(1),
            )?;
            let chosen = select_nearest(&neighbors, self.config.tie_epsilon)
                .filter(|neighbor| neighbor.distance <= self.config.distance_threshold);

            let (write, distance) = match chosen {
                Some(neighbor) => (
                    self.update_write(&neighbor.prototype, &vector, input.example_id),
                    Some(neighbor.distance),
                ),
                None => (
                    PrototypeWrite::Create(self.new_prototype(&input, &namespace_key, &vector)),
                    None,
                ),
            };

            let commit = AssignmentCommit {
                idempotency_key: input.idempotency_key.to_owned(),
                namespace: namespace_key.clone(),
                write,
                example_id: input.example_id.to_owned(),
                text: input.text.to_owned(),
                vector: vector.clone(),
                now: input.now,
            };

            match self.store.commit_assignment(commit) {
                Ok(committed) => {
                    return Ok(Assignment {
                        prototype_id: committed.prototype_id,
                        is_new: committed.is_new,
                        member_count: committed.member_count,
                        distance: if committed.replayed { None } else { distance },
                        replayed: committed.replayed,
                        vector,
                    });
                }
                Err(StoreError::VersionConflict { prototype_id })
                    if attempt < self.config.cas_retries =>
                {
                    attempt += 1;
                    debug!(
                        prototype_id = %prototype_id,
                        attempt,
                        namespace = %namespace_key,
                        "prototype changed underneath assignment, retrying"
                    );
                }
                Err(err) => return Err(err.into()),
            }
        }
    }

    fn update_write(
        &self,
        prototype: &ClusterPrototype,
        vector: &[f32],
        example_id: &str,
    ) -> PrototypeWrite {
        let weight = prototype.member_count.min(self.config.centroid_max_weight.max(1));
        let centroid = moving_centroid(&prototype.centroid, vector, weight);

        let mut examples = prototype.examples.clone();
        if examples.len() < self.config.max_examples
            && !examples.iter().any(|existing| existing == example_id)
        {
            examples.push(example_id.to_owned());
        }

        PrototypeWrite::Update {
            prototype_id: prototype.prototype_id.clone(),
            expected_version: prototype.version,
            centroid,
            examples,
        }
    }

    fn new_prototype(
        &self,
        input: &AssignmentInput<'_>,
        namespace_key: &str,
        vector: &[f32],
    ) -> ClusterPrototype {
        ClusterPrototype {
            prototype_id: prototype_id_for(namespace_key, input.idempotency_key),
            namespace: namespace_key.to_owned(),
            centroid: vector.to_vec(),
            member_count: 1,
            last_classification: None,
            confidence: None,
            classified_member_count: 0,
            examples: vec![input.example_id.to_owned()],
            embedding_mode: input.embedding_mode,
            version: 0,
            superseded_by: None,
            created_at: input.now,
            updated_at: input.now,
        }
    }
}

/// Nearest neighbour with ties broken by larger `member_count`, then smaller id.
/// Distances within `tie_epsilon` of the closest count as equal.
pub fn select_nearest(
    neighbors: &[PrototypeNeighbor],
    tie_epsilon: f32,
) -> Option<&PrototypeNeighbor> {
    let closest = neighbors
        .iter()
        .map(|neighbor| neighbor.distance)
        .fold(f32::INFINITY, f32::min);

    neighbors
        .iter()
        .filter(|neighbor| neighbor.distance <= closest + tie_epsilon.max(0.0))
        .min_by(|left, right| {
            right
                .prototype
                .member_count
                .cmp(&left.prototype.member_count)
                .then_with(|| left.prototype.prototype_id.cmp(&right.prototype.prototype_id))
        })
}
