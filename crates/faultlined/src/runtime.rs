use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use faultline_analysis::{ClusteringEngine, MetricsTracker, PrototypeImprover};
use faultline_config::{EmbeddingMode, FaultlineConfig, load_workspace_config};
use faultline_core::{Namespace, OsClass};
use faultline_infer::{
    ClassificationProvider, EmbeddingProvider, EmbeddingProviderOverrides,
    LoadedClassificationProvider, LoadedEmbeddingProvider, ProviderOverrides,
    load_classification_provider, load_embedding_provider,
};
use faultline_store::{PartitionAssignment, QueueName, SqliteStore, VectorStore, open_vector_store};
use tokio::sync::watch;
use tokio::task::JoinSet;
use tokio::time::timeout;
use tracing::{info, warn};

use crate::aggregate_stage::AggregatorWorker;
use crate::cluster_stage::ClusterStage;
use crate::enrich_stage::EnrichStage;
use crate::query::{QueryState, serve_query_api};
use crate::timers::{DriftJob, run_periodic};
use crate::worker::{StageHandler, StageWorker, redelivery_delay_ms};

/// Everything a stage needs, built once at startup and shared by handle.
pub struct PipelineContext {
    pub workspace: PathBuf,
    pub config: FaultlineConfig,
    pub store: Arc<SqliteStore>,
    pub vectors: Arc<dyn VectorStore>,
    pub embedder: Arc<dyn EmbeddingProvider>,
    pub embedding_provider_name: String,
    pub embedding_model_name: String,
    pub classifier: Arc<dyn ClassificationProvider>,
    pub classifier_name: String,
    pub engine: ClusteringEngine,
}

impl PipelineContext {
    pub async fn open(
        workspace: &Path,
        overrides: ProviderOverrides,
        embedding_overrides: EmbeddingProviderOverrides,
    ) -> Result<Self> {
        let config =
            load_workspace_config(workspace).context("failed to load workspace config")?;
        let store =
            Arc::new(SqliteStore::open(workspace).context("failed to initialize local store")?);
        let vectors = open_vector_store(workspace, store.clone())
            .await
            .context("failed to initialize vector store")?;
        let embedding = load_embedding_provider(workspace, embedding_overrides)
            .context("failed to load embedding provider")?;
        let classification = load_classification_provider(workspace, overrides)
            .context("failed to load classification provider")?;

        Ok(Self::with_providers(
            workspace.to_path_buf(),
            config,
            store,
            vectors,
            embedding,
            classification,
        ))
    }

    pub fn with_providers(
        workspace: PathBuf,
        config: FaultlineConfig,
        store: Arc<SqliteStore>,
        vectors: Arc<dyn VectorStore>,
        embedding: LoadedEmbeddingProvider,
        classification: LoadedClassificationProvider,
    ) -> Self {
        let engine = ClusteringEngine::new(store.clone(), config.clustering.clone());
        Self {
            workspace,
            store,
            vectors,
            embedder: Arc::from(embedding.provider),
            embedding_provider_name: embedding.provider_name,
            embedding_model_name: embedding.model_name,
            classifier: Arc::from(classification.provider),
            classifier_name: format!(
                "{}/{}",
                classification.provider_name, classification.model_name
            ),
            engine,
            config,
        }
    }

    pub fn embedding_mode(&self) -> EmbeddingMode {
        self.config.embeddings.mode
    }

    pub fn partitions(&self) -> u32 {
        self.config.pipeline.partitions.max(1)
    }

    /// Redelivery delay for a transient failure on delivery `attempts`.
    pub fn retry_delay_ms(&self, attempts: u32) -> i64 {
        redelivery_delay_ms(&self.config.pipeline, attempts)
    }

    pub fn namespace(&self, os_class: OsClass, dim: usize) -> Namespace {
        Namespace::new(
            os_class,
            &self.embedding_provider_name,
            &self.embedding_model_name,
            dim,
        )
    }

    /// True when vectors in `namespace` were produced by the loaded embedding model.
    pub fn owns_namespace(&self, namespace: &Namespace) -> bool {
        namespace.provider == self.embedding_provider_name
            && namespace.model == self.embedding_model_name
    }

    /// Embedding call bounded by the enrichment attempt timeout.
    pub async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        let limit = Duration::from_secs(self.config.enrichment.attempt_timeout_secs.max(1));
        timeout(limit, self.embedder.embed_text(text))
            .await
            .map_err(|_| anyhow!("embedding request timed out after {}s", limit.as_secs()))?
            .context("embedding request failed")
    }
}

/// The explicit set of long-lived workers. Nothing here is global; tasks receive handles.
pub struct PipelineRuntime {
    ctx: Arc<PipelineContext>,
}

impl PipelineRuntime {
    pub fn new(ctx: Arc<PipelineContext>) -> Self {
        Self { ctx }
    }

    pub fn context(&self) -> &Arc<PipelineContext> {
        &self.ctx
    }

    pub fn spawn(&self, shutdown: watch::Receiver<bool>) -> JoinSet<()> {
        let mut tasks = JoinSet::new();
        let config = &self.ctx.config;
        let workers = config.pipeline.workers_per_stage.max(1);

        let cluster: Arc<dyn StageHandler> = Arc::new(ClusterStage::new(self.ctx.clone()));
        let enrich: Arc<dyn StageHandler> =
            Arc::new(EnrichStage::new(self.ctx.clone(), QueueName::Enrich));
        let enrich_retry: Arc<dyn StageHandler> =
            Arc::new(EnrichStage::new(self.ctx.clone(), QueueName::EnrichRetry));

        for index in 0..workers {
            let assignment = PartitionAssignment::new(index, workers);

            let aggregator = Arc::new(AggregatorWorker::new(
                self.ctx.store.clone(),
                config,
                assignment,
            ));
            tasks.spawn(aggregator.run(shutdown.clone()));

            for (queue, handler) in [
                (QueueName::Issues, cluster.clone()),
                (QueueName::Enrich, enrich.clone()),
                (QueueName::EnrichRetry, enrich_retry.clone()),
            ] {
                let worker = StageWorker::new(
                    self.ctx.store.clone(),
                    handler,
                    queue,
                    assignment,
                    &config.pipeline,
                    shutdown.clone(),
                );
                tasks.spawn(worker.run());
            }
        }

        if config.improver.enabled {
            let improver = PrototypeImprover::new(
                self.ctx.store.clone(),
                self.ctx.vectors.clone(),
                config.clustering.clone(),
                config.improver.clone(),
            );
            tasks.spawn(run_periodic(
                "prototype_improver",
                Duration::from_secs(config.improver.interval_secs.max(1)),
                shutdown.clone(),
                improver,
            ));
        }

        let drift = DriftJob::new(
            MetricsTracker::new(self.ctx.store.clone(), config.drift.clone()),
            self.ctx.store.clone(),
            self.ctx.vectors.clone(),
        );
        tasks.spawn(run_periodic(
            "drift_tracker",
            Duration::from_secs(config.drift.interval_secs.max(1)),
            shutdown,
            drift,
        ));

        tasks
    }
}

/// `faultlined run`: all stages plus the optional read-only query API, until ctrl-c.
pub async fn run_daemon(
    workspace: &Path,
    overrides: ProviderOverrides,
    query_addr: Option<SocketAddr>,
) -> Result<()> {
    let ctx = Arc::new(
        PipelineContext::open(workspace, overrides, EmbeddingProviderOverrides::default()).await?,
    );
    info!(
        workspace = %workspace.display(),
        classifier = %ctx.classifier_name,
        embeddings = %format!("{}/{}", ctx.embedding_provider_name, ctx.embedding_model_name),
        mode = ctx.embedding_mode().as_str(),
        partitions = ctx.partitions(),
        workers_per_stage = ctx.config.pipeline.workers_per_stage,
        "pipeline starting"
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let runtime = PipelineRuntime::new(ctx.clone());
    let mut tasks = runtime.spawn(shutdown_rx.clone());

    if let Some(addr) = query_addr {
        let state = QueryState::new(ctx.store.clone(), ctx.config.drift.clone());
        let shutdown = shutdown_rx.clone();
        tasks.spawn(async move {
            if let Err(err) = serve_query_api(addr, state, shutdown).await {
                warn!(error = %format!("{err:#}"), "query API stopped");
            }
        });
    }

    tokio::signal::ctrl_c()
        .await
        .context("failed to install ctrl-c handler")?;
    info!("shutdown requested, finishing in-flight items");
    shutdown_tx
        .send(true)
        .map_err(|_| anyhow!("all workers exited before shutdown"))?;

    while let Some(joined) = tasks.join_next().await {
        if let Err(err) = joined {
            warn!(error = %err, "pipeline task ended abnormally");
        }
    }
    info!("pipeline stopped");
    Ok(())
}
