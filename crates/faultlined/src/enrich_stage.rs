use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use faultline_core::{
    Alert, Classification, Namespace, OsClass, PrototypeId, SourceRef, alert_dedup_key, stable_id,
};
use faultline_infer::{ClassificationContext, ClassificationRequest};
use faultline_store::{
    ClassificationUpdate, EnrichmentOutcome, EnrichmentWrite, NewQueueMessage, QueueMessage,
    QueueName, VectorKind, VectorSearchResult,
};
use faultline_template::embedding_text_for_free_text;
use serde::{Deserialize, Serialize};
use tokio::time::{sleep, timeout};
use tracing::{debug, info, warn};

use crate::runtime::PipelineContext;
use crate::worker::{ItemOutcome, StageFailure, StageHandler, backoff_delay};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EnrichTrigger {
    /// An issue or line was flushed by the aggregator.
    Flush,
    /// A prototype grew past the significance threshold since its last classification.
    Significance,
}

impl EnrichTrigger {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Flush => "flush",
            Self::Significance => "significance",
        }
    }
}

/// Payload of the `enrich` and `enrich_retry` queues.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnrichRequest {
    pub request_id: String,
    pub trigger: EnrichTrigger,
    pub source_ref: SourceRef,
    pub prototype_id: Option<PrototypeId>,
    /// Namespace key of the vectors this item was assigned in.
    pub namespace: String,
    pub os_class: OsClass,
    pub text: String,
    /// Template text (or prototype id) used for the dedup key.
    pub representative: String,
    /// Member count the classification will be recorded against (significance only).
    #[serde(default)]
    pub classified_member_count: u64,
    #[serde(default)]
    pub requeues: u32,
    pub requested_at: i64,
}

impl EnrichRequest {
    /// Deterministic, so a redelivered request writes the same alert once.
    pub fn alert_id(&self) -> String {
        stable_id(&["alert", &self.request_id])
    }

    pub fn partition_key(&self) -> &str {
        self.prototype_id
            .as_deref()
            .unwrap_or_else(|| self.source_ref.id())
    }

    pub fn to_message(
        &self,
        queue: QueueName,
        partitions: u32,
    ) -> Result<NewQueueMessage, serde_json::Error> {
        Ok(NewQueueMessage::new(
            queue,
            self.partition_key(),
            serde_json::to_string(self)?,
            partitions,
        ))
    }
}

enum Enrichment {
    Classified(Classification),
    Exhausted(String),
}

/// Handler for both enrichment queues. `queue` only changes how the item is logged;
/// requeued items go through the same attempt loop.
pub struct EnrichStage {
    ctx: Arc<PipelineContext>,
    queue: QueueName,
}

impl EnrichStage {
    pub fn new(ctx: Arc<PipelineContext>, queue: QueueName) -> Self {
        Self { ctx, queue }
    }

    fn is_stale(&self, request: &EnrichRequest) -> Result<bool, StageFailure> {
        let state = self.ctx.store.enrichment_state(&request.request_id)?;
        if matches!(state.as_deref(), Some("done") | Some("unenriched")) {
            return Ok(true);
        }
        Ok(self.ctx.store.get_alert(&request.alert_id())?.is_some())
    }

    async fn process(
        &self,
        request: &EnrichRequest,
        namespace: &Namespace,
        now: i64,
    ) -> Result<ItemOutcome, StageFailure> {
        if self.is_stale(request)? {
            debug!(request_id = %request.request_id, "enrichment already settled");
            return Ok(ItemOutcome::Ack);
        }

        match self.classify_with_retries(request, namespace).await? {
            Enrichment::Classified(classification) => {
                self.emit(request, classification, now)?;
                Ok(ItemOutcome::Ack)
            }
            Enrichment::Exhausted(reason) => self.exhausted(request, reason, now),
        }
    }

    /// Bounded in-stage attempts with exponential backoff. Only transient failures
    /// are retried here; anything else ends the loop.
    async fn classify_with_retries(
        &self,
        request: &EnrichRequest,
        namespace: &Namespace,
    ) -> Result<Enrichment, StageFailure> {
        let config = &self.ctx.config.enrichment;
        let attempts = config.max_attempts.max(1);
        let limit = Duration::from_secs(config.attempt_timeout_secs.max(1));
        let mut last_error = String::new();

        for attempt in 0..attempts {
            if attempt > 0 {
                sleep(backoff_delay(
                    config.backoff_base_ms,
                    config.backoff_max_ms,
                    attempt - 1,
                ))
                .await;
            }

            match timeout(limit, self.attempt(request, namespace)).await {
                Ok(Ok(classification)) => return Ok(Enrichment::Classified(classification)),
                Ok(Err(StageFailure::Transient(reason))) => last_error = reason,
                Ok(Err(other)) => return Err(other),
                Err(_) => {
                    last_error =
                        format!("enrichment attempt timed out after {}s", limit.as_secs())
                }
            }
            warn!(
                queue = self.queue.as_str(),
                request_id = %request.request_id,
                attempt = attempt + 1,
                max_attempts = attempts,
                error = %last_error,
                "enrichment attempt failed"
            );
        }

        Ok(Enrichment::Exhausted(last_error))
    }

    async fn attempt(
        &self,
        request: &EnrichRequest,
        namespace: &Namespace,
    ) -> Result<Classification, StageFailure> {
        let context = self.retrieve_context(request, namespace).await?;
        let classification = self
            .ctx
            .classifier
            .classify(&ClassificationRequest {
                os_class: request.os_class,
                text: request.text.clone(),
                context,
            })
            .await?;
        Ok(classification)
    }

    async fn embed_in(&self, namespace: &Namespace, text: &str) -> Result<Vec<f32>, StageFailure> {
        let vector = self
            .ctx
            .embed(&embedding_text_for_free_text(self.ctx.embedding_mode(), text))
            .await
            .map_err(|err| StageFailure::Transient(format!("{err:#}")))?;
        if vector.len() != namespace.dim {
            return Err(StageFailure::Invariant(format!(
                "embedding of dimension {} cannot query namespace {}",
                vector.len(),
                namespace.key()
            )));
        }
        Ok(vector)
    }

    /// Nearest templates for the item itself, then HyDE: each hypothetical document is
    /// embedded and used to query historical lines. Hits are merged by id.
    async fn retrieve_context(
        &self,
        request: &EnrichRequest,
        namespace: &Namespace,
    ) -> Result<ClassificationContext, StageFailure> {
        let config = &self.ctx.config.enrichment;
        let query = self.embed_in(namespace, &request.text).await?;

        let templates = self
            .ctx
            .vectors
            .search_nearest(
                namespace,
                VectorKind::Template,
                &query,
                config.context_templates,
                None,
            )
            .await?
            .into_iter()
            .map(|hit| hit.text)
            .collect::<Vec<_>>();

        let hypotheses = match self
            .ctx
            .classifier
            .hypothesize(&request.text, config.hypotheses)
            .await
        {
            Ok(hypotheses) => hypotheses,
            Err(err) => {
                warn!(
                    request_id = %request.request_id,
                    error = %err,
                    "hypothesis generation failed, querying with the item text"
                );
                Vec::new()
            }
        };

        let mut queries = Vec::with_capacity(hypotheses.len().max(1));
        for hypothesis in &hypotheses {
            queries.push(self.embed_in(namespace, hypothesis).await?);
        }
        if queries.is_empty() {
            queries.push(query);
        }

        let members_of = match request.trigger {
            EnrichTrigger::Significance => request.prototype_id.as_deref(),
            EnrichTrigger::Flush => None,
        };
        let mut merged: HashMap<String, VectorSearchResult> = HashMap::new();
        for query in &queries {
            let hits = self
                .ctx
                .vectors
                .search_nearest(
                    namespace,
                    VectorKind::Log,
                    query,
                    config.context_logs,
                    members_of,
                )
                .await?;
            for hit in hits {
                if hit.id == request.source_ref.id() {
                    continue;
                }
                match merged.get(&hit.id) {
                    Some(existing) if existing.score >= hit.score => {}
                    _ => {
                        merged.insert(hit.id.clone(), hit);
                    }
                }
            }
        }

        let mut related = merged.into_values().collect::<Vec<_>>();
        related.sort_by(|left, right| {
            right
                .score
                .total_cmp(&left.score)
                .then_with(|| left.id.cmp(&right.id))
        });
        related.truncate(config.context_logs as usize);

        Ok(ClassificationContext {
            templates,
            related_logs: related.into_iter().map(|hit| hit.text).collect(),
        })
    }

    fn emit(
        &self,
        request: &EnrichRequest,
        classification: Classification,
        now: i64,
    ) -> Result<(), StageFailure> {
        let config = &self.ctx.config.enrichment;
        let dedup_key = alert_dedup_key(
            &request.namespace,
            &classification.category,
            request.source_ref.kind(),
            &request.representative,
        );
        let prototype_update = match request.trigger {
            EnrichTrigger::Significance => {
                request
                    .prototype_id
                    .clone()
                    .map(|prototype_id| ClassificationUpdate {
                        prototype_id,
                        category: classification.category.clone(),
                        confidence: classification.confidence,
                        classified_member_count: request.classified_member_count,
                    })
            }
            EnrichTrigger::Flush => None,
        };
        let alert = Alert {
            alert_id: request.alert_id(),
            source_ref: request.source_ref.clone(),
            prototype_id: request.prototype_id.clone(),
            namespace: request.namespace.clone(),
            classification: classification.category,
            confidence: classification.confidence,
            rationale: classification.rationale,
            generated_at: now,
            ttl_secs: config.alert_ttl_secs,
        };
        let alert_id = alert.alert_id.clone();

        let outcome = self.ctx.store.record_enrichment(EnrichmentWrite {
            alert,
            dedup_key,
            dedup_ttl_secs: config.dedup_ttl_secs,
            alert_partitions: self.ctx.partitions(),
            prototype_update,
            request_id: Some(request.request_id.clone()),
            now,
        })?;

        match outcome {
            EnrichmentOutcome::Emitted => info!(
                alert_id = %alert_id,
                trigger = request.trigger.as_str(),
                source = request.source_ref.kind(),
                source_id = %request.source_ref.id(),
                "alert emitted"
            ),
            EnrichmentOutcome::Duplicate => {
                debug!(alert_id = %alert_id, "alert already written by an earlier delivery")
            }
            EnrichmentOutcome::Suppressed { existing_alert_id } => debug!(
                alert_id = %alert_id,
                existing_alert_id = %existing_alert_id,
                "alert suppressed by live dedup record"
            ),
        }
        Ok(())
    }

    /// Requeue on the delayed retry class until `max_requeues`, then record the item
    /// as unenriched and dead-letter it.
    fn exhausted(
        &self,
        request: &EnrichRequest,
        reason: String,
        now: i64,
    ) -> Result<ItemOutcome, StageFailure> {
        let config = &self.ctx.config.enrichment;
        if request.requeues < config.max_requeues {
            let mut requeued = request.clone();
            requeued.requeues += 1;
            let delay_ms = (config.requeue_delay_secs as i64).saturating_mul(1_000);
            let message = requeued
                .to_message(QueueName::EnrichRetry, self.ctx.partitions())?
                .delayed(delay_ms);
            self.ctx.store.enqueue(&message, now)?;
            warn!(
                request_id = %request.request_id,
                requeues = requeued.requeues,
                delay_secs = config.requeue_delay_secs,
                error = %reason,
                "enrichment attempts exhausted, requeued"
            );
            return Ok(ItemOutcome::Ack);
        }

        self.ctx.store.mark_unenriched(
            &request.request_id,
            &request.source_ref,
            &reason,
            now,
        )?;
        Ok(ItemOutcome::DeadLetter {
            reason: format!(
                "enrichment failed after {} requeues: {reason}",
                request.requeues
            ),
        })
    }
}

#[async_trait]
impl StageHandler for EnrichStage {
    fn name(&self) -> &'static str {
        "enrich"
    }

    async fn handle(&self, message: &QueueMessage, now: i64) -> ItemOutcome {
        let request = match serde_json::from_str::<EnrichRequest>(&message.payload) {
            Ok(request) => request,
            Err(err) => {
                return ItemOutcome::Quarantine {
                    reason: format!("invalid enrichment request: {err}"),
                };
            }
        };
        let Some(namespace) = Namespace::from_key(&request.namespace) else {
            return ItemOutcome::Quarantine {
                reason: format!("invalid namespace key '{}'", request.namespace),
            };
        };
        if !self.ctx.owns_namespace(&namespace) {
            return ItemOutcome::DeadLetter {
                reason: format!(
                    "namespace {} was embedded by {}, loaded model is {}/{}",
                    namespace.key(),
                    namespace.embedding_signature(),
                    self.ctx.embedding_provider_name,
                    self.ctx.embedding_model_name
                ),
            };
        }

        match self.process(&request, &namespace, now).await {
            Ok(outcome) => outcome,
            Err(failure) => failure.into_outcome(self.ctx.retry_delay_ms(message.attempts)),
        }
    }
}
