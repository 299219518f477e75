use std::io::Cursor;
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use faultline_config::{FaultlineConfig, Granularity};
use faultline_core::{Classification, OsClass, SourceRef};
use faultline_infer::{
    ClassificationProvider, ClassificationRequest, EmbeddingProvider, InferError,
    LoadedClassificationProvider, LoadedEmbeddingProvider, MockClassifier, MockEmbeddingProvider,
};
use faultline_store::{
    COUNTER_QUARANTINED, COUNTER_UNENRICHED, NewQueueMessage, PartitionAssignment, PrototypeStore,
    QueueName, SqliteStore, SqliteVectorStore, VectorKind, VectorStore,
};
use faultlined::aggregate_stage::AggregatorWorker;
use faultlined::cluster_stage::ClusterStage;
use faultlined::enrich_stage::{EnrichRequest, EnrichStage, EnrichTrigger};
use faultlined::ingest::ingest_reader;
use faultlined::runtime::PipelineContext;
use faultlined::worker::{StageHandler, StageWorker};
use serde_json::json;
use tempfile::tempdir;
use tokio::sync::watch;

const NAMESPACE: &str = "linux|mock|mock-64d|64";
const PARTITIONS: u32 = 4;

struct FailingClassifier;

#[async_trait]
impl ClassificationProvider for FailingClassifier {
    async fn classify(
        &self,
        _request: &ClassificationRequest,
    ) -> Result<Classification, InferError> {
        Err(InferError::InvalidResponse("service unavailable".to_owned()))
    }

    async fn hypothesize(&self, _text: &str, _count: usize) -> Result<Vec<String>, InferError> {
        Ok(Vec::new())
    }
}

struct UnreachableEmbedder;

#[async_trait]
impl EmbeddingProvider for UnreachableEmbedder {
    async fn embed_text(&self, _text: &str) -> Result<Vec<f32>, InferError> {
        Err(InferError::InvalidResponse("connection refused".to_owned()))
    }
}

fn test_config() -> FaultlineConfig {
    let mut config = FaultlineConfig::default();
    config.pipeline.partitions = PARTITIONS;
    config.pipeline.workers_per_stage = 1;
    config.enrichment.backoff_base_ms = 1;
    config.enrichment.backoff_max_ms = 2;
    config
}

fn pipeline(
    workspace: &Path,
    config: FaultlineConfig,
    classifier: Box<dyn ClassificationProvider>,
) -> Result<Arc<PipelineContext>, Box<dyn std::error::Error>> {
    pipeline_with_embedder(workspace, config, Box::new(MockEmbeddingProvider), classifier)
}

fn pipeline_with_embedder(
    workspace: &Path,
    config: FaultlineConfig,
    embedder: Box<dyn EmbeddingProvider>,
    classifier: Box<dyn ClassificationProvider>,
) -> Result<Arc<PipelineContext>, Box<dyn std::error::Error>> {
    let store = Arc::new(SqliteStore::open(workspace)?);
    let vectors: Arc<dyn VectorStore> = Arc::new(SqliteVectorStore::new(store.clone()));
    Ok(Arc::new(PipelineContext::with_providers(
        workspace.to_path_buf(),
        config,
        store,
        vectors,
        LoadedEmbeddingProvider {
            provider: embedder,
            provider_name: "mock".to_owned(),
            model_name: "mock-64d".to_owned(),
        },
        LoadedClassificationProvider {
            provider: classifier,
            provider_name: "mock".to_owned(),
            model_name: "mock".to_owned(),
        },
    )))
}

fn worker(
    ctx: &Arc<PipelineContext>,
    handler: Arc<dyn StageHandler>,
    queue: QueueName,
    shutdown: &watch::Receiver<bool>,
) -> StageWorker {
    StageWorker::new(
        ctx.store.clone(),
        handler,
        queue,
        PartitionAssignment::single(),
        &ctx.config.pipeline,
        shutdown.clone(),
    )
}

fn ingest(
    ctx: &PipelineContext,
    lines: &[(&str, &str, i64)],
    now: i64,
) -> Result<usize, Box<dyn std::error::Error>> {
    let input = lines
        .iter()
        .map(|(source, text, timestamp)| {
            json!({"source": source, "text": text, "timestamp": timestamp}).to_string()
        })
        .collect::<Vec<_>>()
        .join("\n");
    let summary = ingest_reader(&ctx.store, Cursor::new(input), PARTITIONS, now)?;
    Ok(summary.accepted)
}

#[tokio::test]
async fn disk_errors_flow_from_lines_to_one_alert() -> Result<(), Box<dyn std::error::Error>> {
    let temp = tempdir()?;
    let ctx = pipeline(temp.path(), test_config(), Box::new(MockClassifier))?;
    let (_shutdown_tx, shutdown) = watch::channel(false);

    let accepted = ingest(
        &ctx,
        &[
            ("linux-node-1", "Mar  3 10:00:00 node1 kernel[42]: sd 0:0:0:0: I/O error sector 100", 0),
            ("linux-node-1", "Mar  3 10:00:05 node1 kernel[42]: sd 0:0:0:0: I/O error sector 200", 5_000),
            ("linux-node-1", "Mar  3 10:00:10 node1 kernel[42]: sd 0:0:0:0: I/O error sector 300", 10_000),
        ],
        0,
    )?;
    assert_eq!(accepted, 3);

    let aggregator = AggregatorWorker::new(ctx.store.clone(), &ctx.config, PartitionAssignment::single());
    let polled = aggregator.poll_once(1_000)?;
    assert_eq!(polled.claimed, 3);
    assert_eq!(polled.flushed, 0);
    assert_eq!(aggregator.open_issues()?, 1);

    assert_eq!(aggregator.sweep_once(15_999)?, 0);
    assert_eq!(aggregator.sweep_once(16_000)?, 1);
    assert_eq!(ctx.store.queue_depth(QueueName::Logs)?, 0);
    assert_eq!(ctx.store.queue_depth(QueueName::Issues)?, 1);

    let cluster = worker(&ctx, Arc::new(ClusterStage::new(ctx.clone())), QueueName::Issues, &shutdown);
    let clustered = cluster.run_batch(17_000).await?;
    assert_eq!(clustered.acked, 1);
    assert_eq!(ctx.store.queue_depth(QueueName::Enrich)?, 1);

    let prototypes = ctx.store.list_prototypes(NAMESPACE, true)?;
    assert_eq!(prototypes.len(), 1);
    assert_eq!(prototypes[0].member_count, 1);
    assert_eq!(ctx.store.count_templates(NAMESPACE)?, 1);

    let namespace = ctx.namespace(OsClass::Linux, 64);
    assert_eq!(ctx.vectors.count_vectors(&namespace, VectorKind::Log).await?, 1);
    assert_eq!(ctx.vectors.count_vectors(&namespace, VectorKind::Template).await?, 1);

    let enrich = worker(
        &ctx,
        Arc::new(EnrichStage::new(ctx.clone(), QueueName::Enrich)),
        QueueName::Enrich,
        &shutdown,
    );
    let enriched = enrich.run_batch(18_000).await?;
    assert_eq!(enriched.acked, 1);

    let alerts = ctx.store.list_recent_alerts(10)?;
    assert_eq!(alerts.len(), 1);
    assert_eq!(alerts[0].classification, "disk");
    assert_eq!(alerts[0].namespace, NAMESPACE);
    assert_eq!(alerts[0].prototype_id.as_deref(), Some(prototypes[0].prototype_id.as_str()));
    assert!(matches!(alerts[0].source_ref, SourceRef::Issue { .. }));
    assert_eq!(ctx.store.queue_depth(QueueName::Alerts)?, 1);

    assert_eq!(cluster.run_batch(19_000).await?.claimed, 0);
    assert_eq!(enrich.run_batch(19_000).await?.claimed, 0);
    Ok(())
}

#[tokio::test]
async fn readings_that_differ_only_in_values_share_a_prototype()
-> Result<(), Box<dyn std::error::Error>> {
    let temp = tempdir()?;
    let mut config = test_config();
    config.enrichment.significance_threshold = 2;
    let ctx = pipeline(temp.path(), config, Box::new(MockClassifier))?;
    let (_shutdown_tx, shutdown) = watch::channel(false);

    ingest(
        &ctx,
        &[
            ("linux-node-2", "Mar  3 10:00:00 node2 ipmid[311]: Temperature sensor CPU1 reading 45°C", 0),
            ("linux-node-3", "Mar  3 10:00:01 node3 ipmid[311]: Temperature sensor CPU1 reading 95°C", 1_000),
        ],
        0,
    )?;

    let aggregator = AggregatorWorker::new(ctx.store.clone(), &ctx.config, PartitionAssignment::single());
    aggregator.poll_once(1_000)?;
    assert_eq!(aggregator.sweep_once(16_000)?, 2);

    let cluster = worker(&ctx, Arc::new(ClusterStage::new(ctx.clone())), QueueName::Issues, &shutdown);
    assert_eq!(cluster.run_batch(17_000).await?.acked, 2);

    let prototypes = ctx.store.list_prototypes(NAMESPACE, true)?;
    assert_eq!(prototypes.len(), 1);
    assert_eq!(prototypes[0].member_count, 2);
    assert_eq!(ctx.store.count_templates(NAMESPACE)?, 1);
    assert_eq!(ctx.store.queue_depth(QueueName::Enrich)?, 1);

    let enrich = worker(
        &ctx,
        Arc::new(EnrichStage::new(ctx.clone(), QueueName::Enrich)),
        QueueName::Enrich,
        &shutdown,
    );
    assert_eq!(enrich.run_batch(18_000).await?.acked, 1);

    let alerts = ctx.store.list_recent_alerts(10)?;
    assert_eq!(alerts.len(), 1);
    assert!(matches!(alerts[0].source_ref, SourceRef::Prototype { .. }));

    let prototype = ctx
        .store
        .get_prototype(&prototypes[0].prototype_id)?
        .ok_or("prototype missing")?;
    assert_eq!(prototype.classified_member_count, 2);
    assert_eq!(prototype.last_classification.as_deref(), Some("unknown"));
    assert_eq!(prototype.members_since_classification(), 0);
    Ok(())
}

#[tokio::test]
async fn repeated_identical_lines_each_count_as_members()
-> Result<(), Box<dyn std::error::Error>> {
    let temp = tempdir()?;
    let mut config = test_config();
    config.clustering.granularity = Granularity::Line;
    let ctx = pipeline(temp.path(), config, Box::new(MockClassifier))?;
    let (_shutdown_tx, shutdown) = watch::channel(false);

    let line = json!({
        "source": "linux-node-1",
        "text": "Mar  3 10:00:00 node1 kernel[42]: sd 0:0:0:0: I/O error",
    })
    .to_string();
    let input = [line.as_str(), line.as_str(), line.as_str()].join("\n");
    let summary = ingest_reader(&ctx.store, Cursor::new(input), PARTITIONS, 0)?;
    assert_eq!(summary.accepted, 3);

    let aggregator = AggregatorWorker::new(ctx.store.clone(), &ctx.config, PartitionAssignment::single());
    assert_eq!(aggregator.poll_once(1_000)?.observed, 3);
    assert_eq!(aggregator.sweep_once(16_000)?, 1);

    let cluster = worker(&ctx, Arc::new(ClusterStage::new(ctx.clone())), QueueName::Issues, &shutdown);
    assert_eq!(cluster.run_batch(17_000).await?.acked, 1);

    let prototypes = ctx.store.list_prototypes(NAMESPACE, true)?;
    assert_eq!(prototypes.len(), 1);
    assert_eq!(prototypes[0].member_count, 3);
    Ok(())
}

#[tokio::test]
async fn failed_enrichment_is_requeued_then_dead_lettered()
-> Result<(), Box<dyn std::error::Error>> {
    let temp = tempdir()?;
    let mut config = test_config();
    config.enrichment.max_attempts = 2;
    config.enrichment.max_requeues = 1;
    config.enrichment.requeue_delay_secs = 60;
    let ctx = pipeline(temp.path(), config, Box::new(FailingClassifier))?;
    let (_shutdown_tx, shutdown) = watch::channel(false);

    ingest(
        &ctx,
        &[("linux-node-1", "Mar  3 10:00:00 node1 kernel[42]: sd 0:0:0:0: I/O error", 0)],
        0,
    )?;
    let aggregator = AggregatorWorker::new(ctx.store.clone(), &ctx.config, PartitionAssignment::single());
    aggregator.poll_once(1_000)?;
    aggregator.sweep_once(16_000)?;
    let cluster = worker(&ctx, Arc::new(ClusterStage::new(ctx.clone())), QueueName::Issues, &shutdown);
    cluster.run_batch(17_000).await?;

    let enrich = worker(
        &ctx,
        Arc::new(EnrichStage::new(ctx.clone(), QueueName::Enrich)),
        QueueName::Enrich,
        &shutdown,
    );
    let first = enrich.run_batch(18_000).await?;
    assert_eq!(first.acked, 1);
    assert_eq!(ctx.store.queue_depth(QueueName::Enrich)?, 0);
    assert_eq!(ctx.store.queue_depth(QueueName::EnrichRetry)?, 1);

    let retry = worker(
        &ctx,
        Arc::new(EnrichStage::new(ctx.clone(), QueueName::EnrichRetry)),
        QueueName::EnrichRetry,
        &shutdown,
    );
    assert_eq!(retry.run_batch(18_500).await?.claimed, 0);

    let second = retry.run_batch(79_000).await?;
    assert_eq!(second.dead_lettered, 1);
    assert_eq!(ctx.store.queue_depth(QueueName::EnrichRetry)?, 0);
    assert_eq!(ctx.store.dead_letter_count(QueueName::EnrichRetry)?, 1);
    assert_eq!(ctx.store.counter_value(COUNTER_UNENRICHED)?, 1);
    assert!(ctx.store.list_recent_alerts(10)?.is_empty());

    let dead = ctx.store.list_dead_letters(QueueName::EnrichRetry, 10)?;
    assert!(dead[0].reason.contains("service unavailable"));
    let request: EnrichRequest = serde_json::from_str(&dead[0].payload)?;
    assert_eq!(request.requeues, 1);
    assert_eq!(
        ctx.store.enrichment_state(&request.request_id)?.as_deref(),
        Some("unenriched")
    );
    Ok(())
}

#[tokio::test]
async fn embedding_outages_back_off_between_redeliveries()
-> Result<(), Box<dyn std::error::Error>> {
    let temp = tempdir()?;
    let mut config = test_config();
    config.pipeline.transient_retry_delay_secs = 5;
    config.pipeline.transient_retry_max_secs = 60;
    let ctx = pipeline_with_embedder(
        temp.path(),
        config,
        Box::new(UnreachableEmbedder),
        Box::new(MockClassifier),
    )?;
    let (_shutdown_tx, shutdown) = watch::channel(false);

    ingest(
        &ctx,
        &[("linux-node-1", "Mar  3 10:00:00 node1 kernel[42]: sd 0:0:0:0: I/O error", 0)],
        0,
    )?;
    let aggregator = AggregatorWorker::new(ctx.store.clone(), &ctx.config, PartitionAssignment::single());
    aggregator.poll_once(1_000)?;
    assert_eq!(aggregator.sweep_once(16_000)?, 1);

    let cluster = worker(&ctx, Arc::new(ClusterStage::new(ctx.clone())), QueueName::Issues, &shutdown);
    assert_eq!(cluster.run_batch(17_000).await?.retried, 1);

    // First redelivery waits 5s.
    assert_eq!(cluster.run_batch(21_500).await?.claimed, 0);
    assert_eq!(cluster.run_batch(23_000).await?.retried, 1);

    // Second waits 10s.
    assert_eq!(cluster.run_batch(32_000).await?.claimed, 0);
    assert_eq!(cluster.run_batch(33_500).await?.retried, 1);

    // Third waits 20s.
    assert_eq!(cluster.run_batch(52_000).await?.claimed, 0);
    assert_eq!(cluster.run_batch(54_000).await?.retried, 1);

    assert_eq!(ctx.store.queue_depth(QueueName::Issues)?, 1);
    assert!(ctx.store.list_prototypes(NAMESPACE, true)?.is_empty());
    Ok(())
}

#[tokio::test]
async fn bad_items_are_quarantined_or_dead_lettered_without_stopping_the_stage()
-> Result<(), Box<dyn std::error::Error>> {
    let temp = tempdir()?;
    let ctx = pipeline(temp.path(), test_config(), Box::new(MockClassifier))?;
    let (_shutdown_tx, shutdown) = watch::channel(false);

    ctx.store.enqueue_batch(
        &[
            NewQueueMessage::new(QueueName::Issues, "k1", "{not an issue", PARTITIONS),
            NewQueueMessage::new(QueueName::Logs, "k2", "[]", PARTITIONS),
        ],
        0,
    )?;

    let foreign = EnrichRequest {
        request_id: "req-foreign".to_owned(),
        trigger: EnrichTrigger::Flush,
        source_ref: SourceRef::Line {
            entry_id: "line-1".to_owned(),
        },
        prototype_id: None,
        namespace: "linux|qwen3_local|other-model|1024".to_owned(),
        os_class: OsClass::Linux,
        text: "kernel: I/O error".to_owned(),
        representative: "kernel: I/O error".to_owned(),
        classified_member_count: 0,
        requeues: 0,
        requested_at: 0,
    };
    ctx.store
        .enqueue(&foreign.to_message(QueueName::Enrich, PARTITIONS)?, 0)?;

    let aggregator = AggregatorWorker::new(ctx.store.clone(), &ctx.config, PartitionAssignment::single());
    let polled = aggregator.poll_once(1_000)?;
    assert_eq!(polled.quarantined, 1);

    let cluster = worker(&ctx, Arc::new(ClusterStage::new(ctx.clone())), QueueName::Issues, &shutdown);
    assert_eq!(cluster.run_batch(1_000).await?.quarantined, 1);

    let enrich = worker(
        &ctx,
        Arc::new(EnrichStage::new(ctx.clone(), QueueName::Enrich)),
        QueueName::Enrich,
        &shutdown,
    );
    assert_eq!(enrich.run_batch(1_000).await?.dead_lettered, 1);

    assert_eq!(ctx.store.counter_value(COUNTER_QUARANTINED)?, 2);
    assert_eq!(ctx.store.dead_letter_count(QueueName::Enrich)?, 1);
    for queue in [QueueName::Logs, QueueName::Issues, QueueName::Enrich] {
        assert_eq!(ctx.store.queue_depth(queue)?, 0);
    }
    Ok(())
}

#[tokio::test]
async fn shutdown_returns_held_lines_to_the_queue() -> Result<(), Box<dyn std::error::Error>> {
    let temp = tempdir()?;
    let ctx = pipeline(temp.path(), test_config(), Box::new(MockClassifier))?;

    ingest(
        &ctx,
        &[("linux-node-1", "Mar  3 10:00:00 node1 kernel[42]: sd 0:0:0:0: I/O error", 0)],
        0,
    )?;
    let aggregator = AggregatorWorker::new(ctx.store.clone(), &ctx.config, PartitionAssignment::single());
    assert_eq!(aggregator.poll_once(1_000)?.observed, 1);
    assert_eq!(aggregator.abandon_held(2_000)?, 1);
    assert_eq!(ctx.store.queue_depth(QueueName::Issues)?, 0);

    let restarted = AggregatorWorker::new(ctx.store.clone(), &ctx.config, PartitionAssignment::single());
    assert_eq!(restarted.poll_once(2_000)?.observed, 1);
    assert_eq!(restarted.sweep_once(17_000)?, 1);
    Ok(())
}
