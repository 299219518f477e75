use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::Arc;

use faultline_config::{ClusteringConfig, ImproverConfig};
use faultline_core::vector::{cosine_distance, mean_vector, weighted_merge};
use faultline_core::{ClusterPrototype, Namespace, majority_label, stable_id};
use faultline_store::{
    AssignmentEvent, PrototypeMerge, PrototypeSplit, RefinementCommit, RefinementStore,
    StoreError, VectorKind, VectorRetag, VectorStore,
};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::AnalysisError;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct RefinementReport {
    pub generated_at: i64,
    pub namespaces_scanned: usize,
    pub prototypes_scanned: usize,
    pub merges: Vec<MergeEntry>,
    pub splits: Vec<SplitEntry>,
    pub feedback_processed: usize,
    /// Flagged prototypes whose sample did not separate into enough sub-clusters.
    pub splits_skipped: usize,
    /// Plans discarded because an assignment changed a prototype before commit.
    #[serde(default)]
    pub replans: usize,
}

impl RefinementReport {
    pub fn is_noop(&self) -> bool {
        self.merges.is_empty() && self.splits.is_empty() && self.feedback_processed == 0
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MergeEntry {
    pub survivor_id: String,
    pub loser_id: String,
    pub distance: f32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SplitEntry {
    pub parent_id: String,
    pub children: Vec<String>,
    pub labels: Vec<Option<String>>,
}

struct RefinementPlan {
    report: RefinementReport,
    commit: RefinementCommit,
    /// Log-vector moves per namespace key, applied once the commit lands.
    retags: BTreeMap<String, Vec<VectorRetag>>,
}

/// Periodic batch refinement of the prototype set.
pub struct PrototypeImprover {
    store: Arc<dyn RefinementStore>,
    vectors: Arc<dyn VectorStore>,
    clustering: ClusteringConfig,
    config: ImproverConfig,
}

impl PrototypeImprover {
    pub fn new(
        store: Arc<dyn RefinementStore>,
        vectors: Arc<dyn VectorStore>,
        clustering: ClusteringConfig,
        config: ImproverConfig,
    ) -> Self {
        Self {
            store,
            vectors,
            clustering,
            config,
        }
    }

    pub fn config(&self) -> &ImproverConfig {
        &self.config
    }

    /// One refinement pass. Merges near-duplicate live prototypes, splits prototypes
    /// flagged by negative feedback, and commits everything in one transaction that
    /// also clears the consumed feedback. Member log vectors then follow their new
    /// prototypes.
    ///
    /// A version conflict means an assignment touched a planned prototype; the pass
    /// is replanned from fresh state up to `cas_retries` times before the conflict
    /// surfaces and the feedback stays in place for the next run.
    pub async fn improve(&self, now: i64) -> Result<RefinementReport, AnalysisError> {
        let mut attempt = 0usize;
        let plan = loop {
            let mut plan = self.plan(now)?;
            plan.report.replans = attempt;
            if plan.report.is_noop() {
                return Ok(plan.report);
            }

            match self.store.apply_refinement(&plan.commit, now) {
                Ok(()) => break plan,
                Err(StoreError::VersionConflict { prototype_id })
                    if attempt < self.clustering.cas_retries =>
                {
                    attempt += 1;
                    debug!(
                        prototype_id = %prototype_id,
                        attempt,
                        "prototype changed underneath refinement, replanning"
                    );
                }
                Err(err) => return Err(err.into()),
            }
        };

        for (namespace_key, retags) in &plan.retags {
            let namespace = Namespace::from_key(namespace_key).ok_or_else(|| {
                AnalysisError::Invariant(format!("unreadable namespace key {namespace_key}"))
            })?;
            self.vectors
                .retag_vectors(&namespace, VectorKind::Log, retags)
                .await?;
        }

        info!(
            merges = plan.report.merges.len(),
            splits = plan.report.splits.len(),
            feedback = plan.report.feedback_processed,
            replans = plan.report.replans,
            "prototype refinement applied"
        );
        Ok(plan.report)
    }

    fn plan(&self, now: i64) -> Result<RefinementPlan, AnalysisError> {
        let feedback = self.store.list_feedback(self.config.feedback_batch.max(1))?;
        let mut flagged = BTreeSet::new();
        for record in &feedback {
            let Some(prototype_id) = record.prototype_id.as_deref() else {
                continue;
            };
            if let Some(live) = self.store.resolve_live_prototype(prototype_id)? {
                flagged.insert(live.prototype_id);
            }
        }

        let mut report = RefinementReport {
            generated_at: now,
            feedback_processed: feedback.len(),
            ..RefinementReport::default()
        };
        let mut commit = RefinementCommit {
            processed_feedback_ids: feedback
                .iter()
                .map(|record| record.feedback_id.clone())
                .collect(),
            ..RefinementCommit::default()
        };
        let mut retags = BTreeMap::<String, Vec<VectorRetag>>::new();

        for namespace in self.store.list_namespaces()? {
            let live = self.store.list_prototypes(&namespace, true)?;
            report.namespaces_scanned += 1;
            report.prototypes_scanned += live.len();

            let mut touched = HashSet::new();
            for (merge, distance) in self.plan_merges(&live) {
                touched.insert(merge.survivor_id.clone());
                touched.insert(merge.loser_id.clone());
                report.merges.push(MergeEntry {
                    survivor_id: merge.survivor_id.clone(),
                    loser_id: merge.loser_id.clone(),
                    distance,
                });
                retags.entry(namespace.clone()).or_default().push(VectorRetag {
                    from_prototype: merge.loser_id.clone(),
                    to_prototype: merge.survivor_id.clone(),
                    ids: Vec::new(),
                });
                commit.merges.push(merge);
            }

            for prototype in live
                .iter()
                .filter(|prototype| flagged.contains(&prototype.prototype_id))
                .filter(|prototype| !touched.contains(&prototype.prototype_id))
            {
                let events = self
                    .store
                    .events_for_prototype(&prototype.prototype_id, self.config.sample_size)?;
                match self.plan_split(prototype, &events) {
                    Some((split, labels)) => {
                        report.splits.push(SplitEntry {
                            parent_id: split.parent_id.clone(),
                            children: split
                                .children
                                .iter()
                                .map(|child| child.prototype_id.clone())
                                .collect(),
                            labels,
                        });
                        retags
                            .entry(namespace.clone())
                            .or_default()
                            .extend(split_retags(&split, &events));
                        commit.splits.push(split);
                    }
                    None => {
                        debug!(
                            prototype_id = %prototype.prototype_id,
                            sampled = events.len(),
                            "flagged prototype did not separate into sub-clusters"
                        );
                        report.splits_skipped += 1;
                    }
                }
            }
        }

        Ok(RefinementPlan {
            report,
            commit,
            retags,
        })
    }

    /// Greedy closest-pair merging; each prototype takes part in at most one merge
    /// per pass so every expected version stays valid.
    fn plan_merges(&self, live: &[ClusterPrototype]) -> Vec<(PrototypeMerge, f32)> {
        let mut pairs = Vec::new();
        for (index, left) in live.iter().enumerate() {
            for right in &live[index + 1..] {
                if left.centroid.len() != right.centroid.len() {
                    continue;
                }
                let distance = cosine_distance(&left.centroid, &right.centroid);
                if distance <= self.config.merge_threshold {
                    pairs.push((distance, left, right));
                }
            }
        }
        pairs.sort_by(|a, b| {
            a.0.total_cmp(&b.0)
                .then_with(|| a.1.prototype_id.cmp(&b.1.prototype_id))
                .then_with(|| a.2.prototype_id.cmp(&b.2.prototype_id))
        });

        let mut used = HashSet::new();
        let mut merges = Vec::new();
        for (distance, left, right) in pairs {
            if used.contains(&left.prototype_id) || used.contains(&right.prototype_id) {
                continue;
            }
            used.insert(left.prototype_id.clone());
            used.insert(right.prototype_id.clone());

            let left_wins = left.member_count > right.member_count
                || (left.member_count == right.member_count
                    && left.prototype_id <= right.prototype_id);
            let (survivor, loser) = if left_wins { (left, right) } else { (right, left) };

            let mut examples = survivor.examples.clone();
            for example in &loser.examples {
                if examples.len() >= self.clustering.max_examples {
                    break;
                }
                if !examples.contains(example) {
                    examples.push(example.clone());
                }
            }

            merges.push((
                PrototypeMerge {
                    survivor_id: survivor.prototype_id.clone(),
                    survivor_expected_version: survivor.version,
                    loser_id: loser.prototype_id.clone(),
                    loser_expected_version: loser.version,
                    centroid: weighted_merge(
                        &survivor.centroid,
                        survivor.member_count,
                        &loser.centroid,
                        loser.member_count,
                    ),
                    examples,
                },
                distance,
            ));
        }
        merges
    }

    /// Single-pass sub-clustering of a prototype's logged members at a threshold
    /// tighter than assignment. Needs at least two groups of `min_subcluster_size`.
    fn plan_split(
        &self,
        parent: &ClusterPrototype,
        events: &[AssignmentEvent],
    ) -> Option<(PrototypeSplit, Vec<Option<String>>)> {
        let min_size = self.config.min_subcluster_size.max(1);
        if events.len() < min_size * 2 {
            return None;
        }
        let threshold =
            (self.clustering.distance_threshold * self.config.split_factor).max(f32::EPSILON);

        let mut groups: Vec<SubCluster<'_>> = Vec::new();
        for event in events {
            if event.vector.len() != parent.centroid.len() {
                continue;
            }
            let nearest = nearest_group(&groups, &event.vector);
            match nearest {
                Some((index, distance)) if distance <= threshold => groups[index].push(event),
                _ => groups.push(SubCluster::new(event)),
            }
        }

        let (mut kept, stragglers): (Vec<_>, Vec<_>) =
            groups.into_iter().partition(|group| group.members.len() >= min_size);
        if kept.len() < 2 {
            return None;
        }
        for event in stragglers.into_iter().flat_map(|group| group.members) {
            if let Some((index, _)) = nearest_group(&kept, &event.vector) {
                kept[index].push(event);
            }
        }
        kept.sort_by(|left, right| right.members.len().cmp(&left.members.len()));

        let sampled = kept.iter().map(|group| group.members.len() as u64).sum::<u64>();
        let total_members = parent.member_count.max(sampled);
        let mut assigned_members = 0u64;
        let mut children = Vec::with_capacity(kept.len());
        let mut labels = Vec::with_capacity(kept.len());
        let mut reassignments = Vec::new();

        for (index, group) in kept.iter().enumerate() {
            let member_count = if index + 1 == kept.len() {
                total_members - assigned_members
            } else {
                (total_members * group.members.len() as u64 / sampled.max(1)).max(1)
            };
            assigned_members += member_count;

            let child_id = stable_id(&[
                "split",
                &parent.prototype_id,
                &parent.version.to_string(),
                &index.to_string(),
            ]);
            let label = majority_label(group.members.iter().map(|event| event.text.as_str()));
            let created_at = group
                .members
                .iter()
                .map(|event| event.created_at)
                .min()
                .unwrap_or(parent.updated_at);

            children.push(ClusterPrototype {
                prototype_id: child_id.clone(),
                namespace: parent.namespace.clone(),
                centroid: group.centroid.clone(),
                member_count,
                last_classification: label.clone(),
                confidence: None,
                classified_member_count: 0,
                examples: group
                    .members
                    .iter()
                    .take(self.clustering.max_examples)
                    .map(|event| event.example_id.clone())
                    .collect(),
                embedding_mode: parent.embedding_mode,
                version: 0,
                superseded_by: None,
                created_at,
                updated_at: created_at,
            });
            labels.push(label);
            reassignments.extend(
                group
                    .members
                    .iter()
                    .map(|event| (event.event_id, child_id.clone())),
            );
        }

        Some((
            PrototypeSplit {
                parent_id: parent.prototype_id.clone(),
                parent_expected_version: parent.version,
                children,
                reassignments,
            },
            labels,
        ))
    }
}

struct SubCluster<'a> {
    centroid: Vec<f32>,
    members: Vec<&'a AssignmentEvent>,
}

impl<'a> SubCluster<'a> {
    fn new(event: &'a AssignmentEvent) -> Self {
        Self {
            centroid: event.vector.clone(),
            members: vec![event],
        }
    }

    fn push(&mut self, event: &'a AssignmentEvent) {
        self.members.push(event);
        let vectors = self
            .members
            .iter()
            .map(|member| member.vector.as_slice())
            .collect::<Vec<_>>();
        if let Some(centroid) = mean_vector(&vectors) {
            self.centroid = centroid;
        }
    }
}

/// Sampled members move to their child; whatever else still points at the parent
/// goes to the heir, matching where the superseded parent now resolves.
fn split_retags(split: &PrototypeSplit, events: &[AssignmentEvent]) -> Vec<VectorRetag> {
    let examples = events
        .iter()
        .map(|event| (event.event_id, event.example_id.as_str()))
        .collect::<HashMap<_, _>>();
    let mut by_child = BTreeMap::<&str, Vec<String>>::new();
    for (event_id, child_id) in &split.reassignments {
        if let Some(example_id) = examples.get(event_id) {
            by_child
                .entry(child_id.as_str())
                .or_default()
                .push((*example_id).to_owned());
        }
    }

    let mut retags = by_child
        .into_iter()
        .map(|(child_id, ids)| VectorRetag {
            from_prototype: split.parent_id.clone(),
            to_prototype: child_id.to_owned(),
            ids,
        })
        .collect::<Vec<_>>();
    if let Some(heir) = split.heir() {
        retags.push(VectorRetag {
            from_prototype: split.parent_id.clone(),
            to_prototype: heir.prototype_id.clone(),
            ids: Vec::new(),
        });
    }
    retags
}

fn nearest_group(groups: &[SubCluster<'_>], vector: &[f32]) -> Option<(usize, f32)> {
    groups
        .iter()
        .enumerate()
        .map(|(index, group)| (index, cosine_distance(&group.centroid, vector)))
        .min_by(|left, right| left.1.total_cmp(&right.1))
}
