use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use faultline_analysis::AssignmentInput;
use faultline_config::{EmbeddingMode, FlushEnrichment, Granularity};
use faultline_core::{
    Issue, LogEntry, Namespace, PrototypeId, SourceRef, Template, detect_failure_signal,
    stable_id, template_id_for,
};
use faultline_store::{PrototypeStore, QueueMessage, QueueName, VectorKind, VectorRecord};
use faultline_template::{embedding_text, entry_template, issue_text};
use tracing::{debug, warn};

use crate::enrich_stage::{EnrichRequest, EnrichTrigger};
use crate::runtime::PipelineContext;
use crate::worker::{ItemOutcome, StageFailure, StageHandler};

/// One unit assigned to a prototype: the whole issue or a single line.
#[derive(Debug, Clone)]
struct Candidate {
    idempotency_key: String,
    example_id: String,
    text: String,
}

#[derive(Debug, Clone)]
struct Assigned {
    namespace: Namespace,
    prototype_id: PrototypeId,
    replayed: bool,
}

/// Issues-queue handler: embeds, assigns to prototypes, records templates and
/// vectors, then enqueues whatever enrichment the flush or the prototype growth calls for.
pub struct ClusterStage {
    ctx: Arc<PipelineContext>,
}

impl ClusterStage {
    pub fn new(ctx: Arc<PipelineContext>) -> Self {
        Self { ctx }
    }

    fn candidates(&self, issue: &Issue) -> Vec<Candidate> {
        let mode = self.ctx.embedding_mode();
        match self.ctx.engine.config().granularity {
            Granularity::Issue => vec![Candidate {
                idempotency_key: format!("issue:{}", issue.issue_id),
                example_id: issue.issue_id.clone(),
                text: issue_text(mode, issue, self.ctx.config.aggregator.max_lines_for_text),
            }],
            Granularity::Line => issue
                .member_lines
                .iter()
                .map(|entry| Candidate {
                    idempotency_key: format!("line:{}", entry.id),
                    example_id: entry.id.clone(),
                    text: embedding_text(mode, entry),
                })
                .collect(),
        }
    }

    async fn process(
        &self,
        issue: &Issue,
        redelivery: bool,
        now: i64,
    ) -> Result<usize, StageFailure> {
        let mut assigned = HashMap::new();
        for candidate in self.candidates(issue) {
            let vector = self
                .ctx
                .embed(&candidate.text)
                .await
                .map_err(|err| StageFailure::Transient(format!("{err:#}")))?;
            if vector.is_empty() {
                return Err(StageFailure::Malformed(format!(
                    "empty embedding for {}",
                    candidate.example_id
                )));
            }

            let namespace = self.ctx.namespace(issue.os_class, vector.len());
            let assignment = self.ctx.engine.assign(AssignmentInput {
                namespace: &namespace,
                idempotency_key: &candidate.idempotency_key,
                example_id: &candidate.example_id,
                text: &candidate.text,
                vector,
                embedding_mode: self.ctx.embedding_mode(),
                now,
            })?;
            debug!(
                example_id = %candidate.example_id,
                prototype_id = %assignment.prototype_id,
                is_new = assignment.is_new,
                replayed = assignment.replayed,
                "candidate assigned"
            );

            self.ctx
                .vectors
                .upsert_vectors(
                    &namespace,
                    VectorKind::Log,
                    &[VectorRecord {
                        id: candidate.example_id.clone(),
                        prototype_id: Some(assignment.prototype_id.clone()),
                        text: candidate.text.clone(),
                        embedding: assignment.vector,
                        updated_at: now,
                    }],
                )
                .await?;

            assigned.insert(
                candidate.example_id,
                Assigned {
                    namespace,
                    prototype_id: assignment.prototype_id,
                    replayed: assignment.replayed,
                },
            );
        }

        let Some(anchor) = self.anchor(issue, &assigned) else {
            return Ok(0);
        };
        self.record_templates(issue, &anchor.namespace, now).await?;

        let redelivery = redelivery || assigned.values().any(|assigned| assigned.replayed);
        let mut requests = self.flush_requests(issue, &assigned, &anchor, now);
        requests.extend(self.significance_requests(issue, &assigned, now)?);
        self.enqueue_requests(requests, redelivery, now)
    }

    /// Assignment used for issue-level properties: the issue itself, or its first line.
    fn anchor(&self, issue: &Issue, assigned: &HashMap<String, Assigned>) -> Option<Assigned> {
        assigned.get(&issue.issue_id).cloned().or_else(|| {
            issue
                .member_lines
                .iter()
                .find_map(|entry| assigned.get(&entry.id).cloned())
        })
    }

    fn assignment_for<'a>(
        issue: &Issue,
        entry: &LogEntry,
        assigned: &'a HashMap<String, Assigned>,
    ) -> Option<&'a Assigned> {
        assigned
            .get(&entry.id)
            .or_else(|| assigned.get(&issue.issue_id))
    }

    async fn record_templates(
        &self,
        issue: &Issue,
        namespace: &Namespace,
        now: i64,
    ) -> Result<(), StageFailure> {
        let namespace_key = namespace.key();
        let mut templates = BTreeMap::new();
        for entry in &issue.member_lines {
            let text = entry_template(entry);
            templates
                .entry(template_id_for(&namespace_key, &text))
                .or_insert(text);
        }

        for (template_id, template_text) in templates {
            if self.ctx.store.get_template(&template_id)?.is_none() {
                self.embed_template(namespace, &template_id, &template_text, now)
                    .await?;
            }
            self.ctx.store.upsert_template(&Template {
                template_id,
                namespace: namespace_key.clone(),
                os_class: issue.os_class,
                template_text,
                created_at: now,
            })?;
        }
        Ok(())
    }

    async fn embed_template(
        &self,
        namespace: &Namespace,
        template_id: &str,
        template_text: &str,
        now: i64,
    ) -> Result<(), StageFailure> {
        let vector = self
            .ctx
            .embed(template_text)
            .await
            .map_err(|err| StageFailure::Transient(format!("{err:#}")))?;
        if vector.len() != namespace.dim {
            warn!(
                template_id,
                expected = namespace.dim,
                actual = vector.len(),
                "template embedding skipped: dimension differs from namespace"
            );
            return Ok(());
        }

        self.ctx
            .vectors
            .upsert_vectors(
                namespace,
                VectorKind::Template,
                &[VectorRecord {
                    id: template_id.to_owned(),
                    prototype_id: None,
                    text: template_text.to_owned(),
                    embedding: vector,
                    updated_at: now,
                }],
            )
            .await?;
        Ok(())
    }

    fn flush_requests(
        &self,
        issue: &Issue,
        assigned: &HashMap<String, Assigned>,
        anchor: &Assigned,
        now: i64,
    ) -> Vec<EnrichRequest> {
        let enrichment = &self.ctx.config.enrichment;
        let wants = |text: &str| match enrichment.on_flush {
            FlushEnrichment::None => false,
            FlushEnrichment::Signal => detect_failure_signal(text).has_signal,
            FlushEnrichment::All => true,
        };
        let max_lines = self.ctx.config.aggregator.max_lines_for_text;

        match enrichment.granularity {
            Granularity::Issue => {
                let text = issue
                    .raw_lines()
                    .take(max_lines.max(1))
                    .collect::<Vec<_>>()
                    .join("\n");
                if !wants(&text) {
                    return Vec::new();
                }
                let source_ref = SourceRef::Issue {
                    issue_id: issue.issue_id.clone(),
                };
                vec![EnrichRequest {
                    request_id: stable_id(&["flush", source_ref.kind(), source_ref.id()]),
                    trigger: EnrichTrigger::Flush,
                    source_ref,
                    prototype_id: Some(anchor.prototype_id.clone()),
                    namespace: anchor.namespace.key(),
                    os_class: issue.os_class,
                    text,
                    representative: issue_text(EmbeddingMode::Templated, issue, max_lines),
                    classified_member_count: 0,
                    requeues: 0,
                    requested_at: now,
                }]
            }
            Granularity::Line => issue
                .member_lines
                .iter()
                .filter(|entry| wants(&entry.raw_text))
                .filter_map(|entry| {
                    let assigned = Self::assignment_for(issue, entry, assigned)?;
                    let source_ref = SourceRef::Line {
                        entry_id: entry.id.clone(),
                    };
                    Some(EnrichRequest {
                        request_id: stable_id(&["flush", source_ref.kind(), source_ref.id()]),
                        trigger: EnrichTrigger::Flush,
                        source_ref,
                        prototype_id: Some(assigned.prototype_id.clone()),
                        namespace: assigned.namespace.key(),
                        os_class: issue.os_class,
                        text: entry.raw_text.clone(),
                        representative: entry_template(entry),
                        classified_member_count: 0,
                        requeues: 0,
                        requested_at: now,
                    })
                })
                .collect(),
        }
    }

    /// One request per touched prototype whose growth since its last classification
    /// reached the threshold. The request id carries the classification generation.
    fn significance_requests(
        &self,
        issue: &Issue,
        assigned: &HashMap<String, Assigned>,
        now: i64,
    ) -> Result<Vec<EnrichRequest>, StageFailure> {
        let threshold = self.ctx.config.enrichment.significance_threshold;
        if threshold == 0 {
            return Ok(Vec::new());
        }

        let mut touched = BTreeMap::new();
        for assigned in assigned.values() {
            touched
                .entry(assigned.prototype_id.clone())
                .or_insert_with(|| assigned.namespace.key());
        }

        let mut requests = Vec::new();
        for (prototype_id, namespace) in touched {
            let Some(prototype) = self.ctx.store.get_prototype(&prototype_id)? else {
                continue;
            };
            if !prototype.is_live() || prototype.members_since_classification() < threshold {
                continue;
            }

            let generation = prototype.classified_member_count.to_string();
            requests.push(EnrichRequest {
                request_id: stable_id(&["significance", &prototype_id, &generation]),
                trigger: EnrichTrigger::Significance,
                source_ref: SourceRef::Prototype {
                    prototype_id: prototype_id.clone(),
                },
                prototype_id: Some(prototype_id.clone()),
                namespace,
                os_class: issue.os_class,
                text: issue_text(
                    self.ctx.embedding_mode(),
                    issue,
                    self.ctx.config.aggregator.max_lines_for_text,
                ),
                representative: prototype_id,
                classified_member_count: prototype.member_count,
                requeues: 0,
                requested_at: now,
            });
        }
        Ok(requests)
    }

    /// A request is enqueued when its id is claimed here, or when this is a redelivery
    /// and the earlier claim never reached the queue.
    fn enqueue_requests(
        &self,
        requests: Vec<EnrichRequest>,
        redelivery: bool,
        now: i64,
    ) -> Result<usize, StageFailure> {
        let mut messages = Vec::new();
        for request in requests {
            let claimed = self.ctx.store.try_begin_enrichment(
                &request.request_id,
                &request.source_ref,
                now,
            )?;
            let resend = !claimed
                && redelivery
                && self.ctx.store.enrichment_state(&request.request_id)?.as_deref()
                    == Some("pending");
            if claimed || resend {
                messages.push(request.to_message(QueueName::Enrich, self.ctx.partitions())?);
            }
        }

        if !messages.is_empty() {
            self.ctx.store.enqueue_batch(&messages, now)?;
        }
        Ok(messages.len())
    }
}

#[async_trait]
impl StageHandler for ClusterStage {
    fn name(&self) -> &'static str {
        "cluster"
    }

    async fn handle(&self, message: &QueueMessage, now: i64) -> ItemOutcome {
        let issue = match serde_json::from_str::<Issue>(&message.payload) {
            Ok(issue) => issue,
            Err(err) => {
                return ItemOutcome::Quarantine {
                    reason: format!("invalid issue payload: {err}"),
                };
            }
        };
        if issue.member_lines.is_empty() {
            return ItemOutcome::Quarantine {
                reason: format!("issue {} has no member lines", issue.issue_id),
            };
        }

        match self.process(&issue, message.attempts > 1, now).await {
            Ok(enqueued) => {
                debug!(
                    issue_id = %issue.issue_id,
                    lines = issue.member_lines.len(),
                    enrichment_requests = enqueued,
                    "issue clustered"
                );
                ItemOutcome::Ack
            }
            Err(failure) => failure.into_outcome(self.ctx.retry_delay_ms(message.attempts)),
        }
    }
}

