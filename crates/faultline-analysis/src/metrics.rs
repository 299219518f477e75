use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use faultline_config::DriftConfig;
use faultline_core::vector::{cosine_distance, mean_vector};
use faultline_store::{AssignmentEvent, DriftReportRecord, SqliteStore};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::AnalysisError;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct QualityScores {
    /// Mean distance of sampled members to their cluster's sample centroid.
    pub cohesion: f32,
    /// Mean pairwise distance between cluster centroids.
    pub separation: f32,
    /// Approximate silhouette over the sample, in `[-1, 1]`.
    pub silhouette: f32,
    pub clusters: usize,
    pub sampled: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QualityReport {
    pub namespace: String,
    pub window_secs: u64,
    pub generated_at: i64,
    pub assignments: u64,
    pub new_prototypes: u64,
    pub new_cluster_rate: f32,
    pub live_prototypes: usize,
    #[serde(flatten)]
    pub scores: QualityScores,
    pub high_drift: bool,
    pub low_quality: bool,
}

impl QualityReport {
    pub fn needs_attention(&self) -> bool {
        self.high_drift || self.low_quality
    }
}

/// Per-namespace cluster quality and drift over a sliding window.
pub struct MetricsTracker {
    store: Arc<SqliteStore>,
    config: DriftConfig,
}

impl MetricsTracker {
    pub fn new(store: Arc<SqliteStore>, config: DriftConfig) -> Self {
        Self { store, config }
    }

    pub fn config(&self) -> &DriftConfig {
        &self.config
    }

    pub fn report(
        &self,
        namespace: &str,
        window_secs: u64,
        now: i64,
    ) -> Result<QualityReport, AnalysisError> {
        let since = now.saturating_sub((window_secs as i64).saturating_mul(1000));
        let (assignments, new_prototypes) = self.store.assignment_counts(namespace, since)?;
        let events =
            self.store
                .sample_assignment_events(namespace, since, self.config.sample_cap.max(1))?;
        let live_prototypes = self.store.list_prototypes(namespace, true)?.len();
        let scores = quality_scores(&events);

        let new_cluster_rate = if assignments == 0 {
            0.0
        } else {
            new_prototypes as f32 / assignments as f32
        };
        let enough = assignments >= self.config.min_assignments;

        Ok(QualityReport {
            namespace: namespace.to_owned(),
            window_secs,
            generated_at: now,
            assignments,
            new_prototypes,
            new_cluster_rate,
            live_prototypes,
            high_drift: enough && new_cluster_rate > self.config.high_drift_rate,
            low_quality: enough
                && scores.clusters >= 2
                && scores.silhouette < self.config.min_silhouette,
            scores,
        })
    }

    /// Reports for every namespace that has prototypes, ordered by namespace key.
    pub fn report_all(
        &self,
        window_secs: u64,
        now: i64,
    ) -> Result<Vec<QualityReport>, AnalysisError> {
        self.store
            .list_namespaces()?
            .iter()
            .map(|namespace| self.report(namespace, window_secs, now))
            .collect()
    }

    pub fn persist(&self, report: &QualityReport) -> Result<(), AnalysisError> {
        self.store.insert_drift_report(&DriftReportRecord {
            namespace: report.namespace.clone(),
            window_secs: report.window_secs,
            generated_at: report.generated_at,
            report_json: serde_json::to_string(report)?,
        })?;
        Ok(())
    }

    /// Drops assignment events older than the retention window.
    pub fn prune(&self, now: i64) -> Result<usize, AnalysisError> {
        let horizon = (self.config.event_retention_secs as i64).saturating_mul(1000);
        Ok(self.store.prune_assignment_events(now.saturating_sub(horizon))?)
    }
}

pub fn quality_scores(events: &[AssignmentEvent]) -> QualityScores {
    let mut clusters = BTreeMap::<&str, Vec<&[f32]>>::new();
    for event in events {
        if event.vector.is_empty() {
            continue;
        }
        clusters
            .entry(event.prototype_id.as_str())
            .or_default()
            .push(event.vector.as_slice());
    }

    let centroids = clusters
        .iter()
        .filter_map(|(id, members)| mean_vector(members).map(|centroid| (*id, centroid)))
        .collect::<HashMap<_, _>>();

    let mut distance_sum = 0.0f32;
    let mut sampled = 0usize;
    for (id, members) in &clusters {
        let Some(centroid) = centroids.get(id) else {
            continue;
        };
        for member in members {
            distance_sum += cosine_distance(member, centroid);
            sampled += 1;
        }
    }
    let cohesion = if sampled == 0 {
        0.0
    } else {
        distance_sum / sampled as f32
    };

    let centroid_list = centroids.values().collect::<Vec<_>>();
    let separation = if centroid_list.len() < 2 {
        1.0
    } else {
        let mut sum = 0.0f32;
        let mut pairs = 0usize;
        for (index, left) in centroid_list.iter().enumerate() {
            for right in &centroid_list[index + 1..] {
                sum += cosine_distance(left, right);
                pairs += 1;
            }
        }
        sum / pairs as f32
    };

    QualityScores {
        cohesion,
        separation,
        silhouette: silhouette(&clusters),
        clusters: clusters.len(),
        sampled,
    }
}

/// Mean silhouette; singleton members score 0. Zero when fewer than two clusters.
fn silhouette(clusters: &BTreeMap<&str, Vec<&[f32]>>) -> f32 {
    if clusters.len() < 2 {
        return 0.0;
    }

    let groups = clusters.values().collect::<Vec<_>>();
    let mut total = 0.0f32;
    let mut count = 0usize;
    for (group_index, group) in groups.iter().enumerate() {
        for (member_index, member) in group.iter().enumerate() {
            count += 1;
            if group.len() < 2 {
                continue;
            }
            let intra = group
                .iter()
                .enumerate()
                .filter(|(other_index, _)| *other_index != member_index)
                .map(|(_, other)| cosine_distance(member, other))
                .sum::<f32>()
                / (group.len() - 1) as f32;
            let nearest_other = groups
                .iter()
                .enumerate()
                .filter(|(other_group, _)| *other_group != group_index)
                .map(|(_, other)| {
                    other
                        .iter()
                        .map(|vector| cosine_distance(member, vector))
                        .sum::<f32>()
                        / other.len() as f32
                })
                .fold(f32::INFINITY, f32::min);
            let scale = intra.max(nearest_other);
            if scale > f32::EPSILON {
                total += (nearest_other - intra) / scale;
            }
        }
    }

    if count == 0 {
        0.0
    } else {
        total / count as f32
    }
}

/// Rolling drift advisories, one warning per namespace per dip.
#[derive(Debug, Default)]
pub struct DriftMonitor {
    warned_for_current_dip: HashMap<String, bool>,
}

impl DriftMonitor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns true when this report starts a new dip and a warning was emitted.
    pub fn observe(&mut self, report: &QualityReport) -> bool {
        let warned = self
            .warned_for_current_dip
            .entry(report.namespace.clone())
            .or_insert(false);

        if !report.needs_attention() {
            *warned = false;
            return false;
        }
        if *warned {
            return false;
        }

        *warned = true;
        warn!(
            namespace = %report.namespace,
            new_cluster_rate = report.new_cluster_rate,
            silhouette = report.scores.silhouette,
            assignments = report.assignments,
            high_drift = report.high_drift,
            low_quality = report.low_quality,
            "cluster drift detected (new-cluster rate {:.2}, silhouette {:.2})",
            report.new_cluster_rate,
            report.scores.silhouette
        );
        true
    }
}
