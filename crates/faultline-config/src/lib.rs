use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const FAULTLINE_DIR_NAME: &str = ".faultline";
pub const CONFIG_FILE_NAME: &str = "config.toml";
pub const DEFAULT_GEMINI_API_KEY_ENV: &str = "GEMINI_API_KEY";
pub const DEFAULT_QWEN_ENDPOINT: &str = "http://127.0.0.1:11434/api/generate";
pub const DEFAULT_QWEN_MODEL: &str = "qwen3:0.6b";
pub const DEFAULT_QWEN_EMBEDDING_ENDPOINT: &str = "http://127.0.0.1:11434/api/embeddings";
pub const DEFAULT_QWEN_EMBEDDING_MODEL: &str = "qwen3-embedding:0.6b";
pub const DEFAULT_DISTANCE_THRESHOLD: f32 = 0.25;
pub const DEFAULT_MERGE_THRESHOLD: f32 = 0.08;
pub const DEFAULT_INACTIVITY_SECS: u64 = 15;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum InferenceProviderKind {
    #[default]
    Auto,
    Mock,
    Gemini,
    Qwen3Local,
}

impl InferenceProviderKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Auto => "auto",
            Self::Mock => "mock",
            Self::Gemini => "gemini",
            Self::Qwen3Local => "qwen3_local",
        }
    }
}

impl std::str::FromStr for InferenceProviderKind {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim() {
            "auto" => Ok(Self::Auto),
            "mock" => Ok(Self::Mock),
            "gemini" => Ok(Self::Gemini),
            "qwen3_local" => Ok(Self::Qwen3Local),
            other => Err(format!(
                "invalid provider '{other}', expected one of: auto, mock, gemini, qwen3_local"
            )),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum EmbeddingProviderKind {
    #[default]
    Mock,
    Qwen3Local,
}

impl EmbeddingProviderKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Mock => "mock",
            Self::Qwen3Local => "qwen3_local",
        }
    }
}

impl std::str::FromStr for EmbeddingProviderKind {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim() {
            "mock" => Ok(Self::Mock),
            "qwen3_local" => Ok(Self::Qwen3Local),
            other => Err(format!(
                "invalid embedding provider '{other}', expected one of: mock, qwen3_local"
            )),
        }
    }
}

/// Which text is embedded for a candidate: the canonical template or the raw line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum EmbeddingMode {
    #[default]
    Templated,
    Raw,
}

impl EmbeddingMode {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Templated => "templated",
            Self::Raw => "raw",
        }
    }
}

impl std::str::FromStr for EmbeddingMode {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim() {
            "templated" | "template" => Ok(Self::Templated),
            "raw" | "semantic" => Ok(Self::Raw),
            other => Err(format!(
                "invalid embedding mode '{other}', expected one of: templated, raw"
            )),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum EmbeddingVectorBackend {
    #[default]
    Sqlite,
    Lancedb,
}

impl EmbeddingVectorBackend {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Sqlite => "sqlite",
            Self::Lancedb => "lancedb",
        }
    }
}

/// Unit of work for clustering and for flush-triggered enrichment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Granularity {
    #[default]
    Issue,
    Line,
}

impl Granularity {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Issue => "issue",
            Self::Line => "line",
        }
    }
}

impl std::str::FromStr for Granularity {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim() {
            "issue" => Ok(Self::Issue),
            "line" => Ok(Self::Line),
            other => Err(format!(
                "invalid granularity '{other}', expected one of: issue, line"
            )),
        }
    }
}

/// Which flushed issues are sent to enrichment directly, independent of prototype significance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum FlushEnrichment {
    None,
    #[default]
    Signal,
    All,
}

impl FlushEnrichment {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::None => "none",
            Self::Signal => "signal",
            Self::All => "all",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct FaultlineConfig {
    #[serde(default)]
    pub inference: InferenceConfig,
    #[serde(default)]
    pub embeddings: EmbeddingsConfig,
    #[serde(default)]
    pub pipeline: PipelineConfig,
    #[serde(default)]
    pub aggregator: AggregatorConfig,
    #[serde(default)]
    pub clustering: ClusteringConfig,
    #[serde(default)]
    pub enrichment: EnrichmentConfig,
    #[serde(default)]
    pub improver: ImproverConfig,
    #[serde(default)]
    pub drift: DriftConfig,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InferenceConfig {
    #[serde(default)]
    pub provider: InferenceProviderKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub endpoint: Option<String>,
    #[serde(default = "default_api_key_env")]
    pub api_key_env: String,
}

impl Default for InferenceConfig {
    fn default() -> Self {
        Self {
            provider: InferenceProviderKind::Auto,
            model: None,
            endpoint: None,
            api_key_env: default_api_key_env(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct EmbeddingsConfig {
    #[serde(default)]
    pub provider: EmbeddingProviderKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub endpoint: Option<String>,
    #[serde(default)]
    pub mode: EmbeddingMode,
    #[serde(default)]
    pub vector_backend: EmbeddingVectorBackend,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PipelineConfig {
    #[serde(default = "default_partitions")]
    pub partitions: u32,
    #[serde(default = "default_workers_per_stage")]
    pub workers_per_stage: u32,
    #[serde(default = "default_batch_size")]
    pub batch_size: u32,
    #[serde(default = "default_visibility_timeout_secs")]
    pub visibility_timeout_secs: u64,
    #[serde(default = "default_max_delivery_attempts")]
    pub max_delivery_attempts: u32,
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    #[serde(default = "default_retry_delay_secs")]
    pub transient_retry_delay_secs: u64,
    /// Cap on the redelivery delay, which doubles per delivery attempt.
    #[serde(default = "default_retry_max_secs")]
    pub transient_retry_max_secs: u64,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            partitions: default_partitions(),
            workers_per_stage: default_workers_per_stage(),
            batch_size: default_batch_size(),
            visibility_timeout_secs: default_visibility_timeout_secs(),
            max_delivery_attempts: default_max_delivery_attempts(),
            poll_interval_ms: default_poll_interval_ms(),
            transient_retry_delay_secs: default_retry_delay_secs(),
            transient_retry_max_secs: default_retry_max_secs(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AggregatorConfig {
    #[serde(default = "default_inactivity_secs")]
    pub inactivity_secs: u64,
    #[serde(default = "default_sweep_interval_ms")]
    pub sweep_interval_ms: u64,
    #[serde(default = "default_max_lines_per_issue")]
    pub max_lines_per_issue: usize,
    #[serde(default = "default_max_lines_for_text")]
    pub max_lines_for_text: usize,
}

impl Default for AggregatorConfig {
    fn default() -> Self {
        Self {
            inactivity_secs: default_inactivity_secs(),
            sweep_interval_ms: default_sweep_interval_ms(),
            max_lines_per_issue: default_max_lines_per_issue(),
            max_lines_for_text: default_max_lines_for_text(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClusteringConfig {
    #[serde(default = "default_distance_threshold")]
    pub distance_threshold: f32,
    #[serde(default = "default_neighbors")]
    pub neighbors: usize,
    #[serde(default = "default_tie_epsilon")]
    pub tie_epsilon: f32,
    #[serde(default = "default_max_examples")]
    pub max_examples: usize,
    #[serde(default = "default_centroid_max_weight")]
    pub centroid_max_weight: u64,
    #[serde(default = "default_cas_retries")]
    pub cas_retries: usize,
    #[serde(default)]
    pub granularity: Granularity,
}

impl Default for ClusteringConfig {
    fn default() -> Self {
        Self {
            distance_threshold: default_distance_threshold(),
            neighbors: default_neighbors(),
            tie_epsilon: default_tie_epsilon(),
            max_examples: default_max_examples(),
            centroid_max_weight: default_centroid_max_weight(),
            cas_retries: default_cas_retries(),
            granularity: Granularity::Issue,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnrichmentConfig {
    #[serde(default = "default_significance_threshold")]
    pub significance_threshold: u64,
    #[serde(default)]
    pub on_flush: FlushEnrichment,
    #[serde(default)]
    pub granularity: Granularity,
    #[serde(default = "default_enrichment_max_attempts")]
    pub max_attempts: usize,
    #[serde(default = "default_attempt_timeout_secs")]
    pub attempt_timeout_secs: u64,
    #[serde(default = "default_backoff_base_ms")]
    pub backoff_base_ms: u64,
    #[serde(default = "default_backoff_max_ms")]
    pub backoff_max_ms: u64,
    #[serde(default = "default_requeue_delay_secs")]
    pub requeue_delay_secs: u64,
    #[serde(default = "default_max_requeues")]
    pub max_requeues: u32,
    #[serde(default = "default_dedup_ttl_secs")]
    pub dedup_ttl_secs: u64,
    #[serde(default = "default_alert_ttl_secs")]
    pub alert_ttl_secs: u64,
    #[serde(default = "default_context_templates")]
    pub context_templates: u32,
    #[serde(default = "default_context_logs")]
    pub context_logs: u32,
    #[serde(default = "default_hypotheses")]
    pub hypotheses: usize,
}

impl Default for EnrichmentConfig {
    fn default() -> Self {
        Self {
            significance_threshold: default_significance_threshold(),
            on_flush: FlushEnrichment::Signal,
            granularity: Granularity::Issue,
            max_attempts: default_enrichment_max_attempts(),
            attempt_timeout_secs: default_attempt_timeout_secs(),
            backoff_base_ms: default_backoff_base_ms(),
            backoff_max_ms: default_backoff_max_ms(),
            requeue_delay_secs: default_requeue_delay_secs(),
            max_requeues: default_max_requeues(),
            dedup_ttl_secs: default_dedup_ttl_secs(),
            alert_ttl_secs: default_alert_ttl_secs(),
            context_templates: default_context_templates(),
            context_logs: default_context_logs(),
            hypotheses: default_hypotheses(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImproverConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_improver_interval_secs")]
    pub interval_secs: u64,
    #[serde(default = "default_merge_threshold")]
    pub merge_threshold: f32,
    #[serde(default = "default_split_factor")]
    pub split_factor: f32,
    #[serde(default = "default_min_subcluster_size")]
    pub min_subcluster_size: usize,
    #[serde(default = "default_sample_size")]
    pub sample_size: usize,
    #[serde(default = "default_feedback_batch")]
    pub feedback_batch: usize,
}

impl Default for ImproverConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_secs: default_improver_interval_secs(),
            merge_threshold: default_merge_threshold(),
            split_factor: default_split_factor(),
            min_subcluster_size: default_min_subcluster_size(),
            sample_size: default_sample_size(),
            feedback_batch: default_feedback_batch(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DriftConfig {
    #[serde(default = "default_drift_interval_secs")]
    pub interval_secs: u64,
    #[serde(default = "default_drift_window_secs")]
    pub window_secs: u64,
    #[serde(default = "default_high_drift_rate")]
    pub high_drift_rate: f32,
    #[serde(default = "default_min_silhouette")]
    pub min_silhouette: f32,
    #[serde(default = "default_min_assignments")]
    pub min_assignments: u64,
    #[serde(default = "default_sample_cap")]
    pub sample_cap: usize,
    #[serde(default = "default_event_retention_secs")]
    pub event_retention_secs: u64,
}

impl Default for DriftConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_drift_interval_secs(),
            window_secs: default_drift_window_secs(),
            high_drift_rate: default_high_drift_rate(),
            min_silhouette: default_min_silhouette(),
            min_assignments: default_min_assignments(),
            sample_cap: default_sample_cap(),
            event_retention_secs: default_event_retention_secs(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigWarning {
    pub code: &'static str,
    pub message: String,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse config TOML: {0}")]
    TomlParse(#[from] toml::de::Error),
    #[error("failed to serialize config TOML: {0}")]
    TomlSerialize(#[from] toml::ser::Error),
}

pub fn faultline_dir(workspace_root: impl AsRef<Path>) -> PathBuf {
    workspace_root.as_ref().join(FAULTLINE_DIR_NAME)
}

pub fn config_path(workspace_root: impl AsRef<Path>) -> PathBuf {
    faultline_dir(workspace_root).join(CONFIG_FILE_NAME)
}

pub fn load_workspace_config(
    workspace_root: impl AsRef<Path>,
) -> Result<FaultlineConfig, ConfigError> {
    let path = config_path(workspace_root);
    if !path.exists() {
        return Ok(FaultlineConfig::default());
    }

    let raw = fs::read_to_string(path)?;
    let parsed: FaultlineConfig = toml::from_str(&raw)?;
    Ok(normalize_config(parsed))
}

pub fn ensure_workspace_config(
    workspace_root: impl AsRef<Path>,
) -> Result<FaultlineConfig, ConfigError> {
    let workspace_root = workspace_root.as_ref();
    fs::create_dir_all(faultline_dir(workspace_root))?;

    let path = config_path(workspace_root);
    if path.exists() {
        return load_workspace_config(workspace_root);
    }

    let config = FaultlineConfig::default();
    let content = toml::to_string_pretty(&config)?;
    fs::write(path, content)?;

    Ok(config)
}

/// Advisory checks only; a config that produces warnings is still usable.
pub fn validate_config(config: &FaultlineConfig) -> Vec<ConfigWarning> {
    let mut warnings = Vec::new();

    if config.improver.merge_threshold >= config.clustering.distance_threshold {
        warnings.push(ConfigWarning {
            code: "merge_threshold_not_tighter",
            message: format!(
                "improver.merge_threshold ({:.3}) should be below clustering.distance_threshold ({:.3}); merges will absorb prototypes that assignment keeps apart",
                config.improver.merge_threshold, config.clustering.distance_threshold
            ),
        });
    }

    if config.improver.split_factor >= 1.0 {
        warnings.push(ConfigWarning {
            code: "split_factor_not_tighter",
            message: format!(
                "improver.split_factor ({:.2}) should be below 1.0 so sub-clusters are tighter than the parent",
                config.improver.split_factor
            ),
        });
    }

    let enrichment_budget_secs = config
        .enrichment
        .attempt_timeout_secs
        .saturating_mul(config.enrichment.max_attempts as u64);
    if config.pipeline.visibility_timeout_secs <= enrichment_budget_secs {
        warnings.push(ConfigWarning {
            code: "visibility_shorter_than_enrichment",
            message: format!(
                "pipeline.visibility_timeout_secs ({}) does not cover enrichment attempts ({}s); items may be redelivered while still in flight",
                config.pipeline.visibility_timeout_secs, enrichment_budget_secs
            ),
        });
    }

    if config.aggregator.inactivity_secs.saturating_mul(1_000) < config.aggregator.sweep_interval_ms
    {
        warnings.push(ConfigWarning {
            code: "sweep_slower_than_inactivity",
            message: format!(
                "aggregator.sweep_interval_ms ({}) exceeds the inactivity window; issues will flush late",
                config.aggregator.sweep_interval_ms
            ),
        });
    }

    if config.drift.window_secs < config.drift.interval_secs {
        warnings.push(ConfigWarning {
            code: "drift_window_gaps",
            message: "drift.window_secs is shorter than drift.interval_secs; some assignments are never evaluated".to_owned(),
        });
    }

    warnings
}

fn default_api_key_env() -> String {
    DEFAULT_GEMINI_API_KEY_ENV.to_owned()
}

fn default_true() -> bool {
    true
}

fn default_partitions() -> u32 {
    16
}

fn default_workers_per_stage() -> u32 {
    2
}

fn default_batch_size() -> u32 {
    64
}

fn default_visibility_timeout_secs() -> u64 {
    300
}

fn default_max_delivery_attempts() -> u32 {
    8
}

fn default_poll_interval_ms() -> u64 {
    250
}

fn default_retry_delay_secs() -> u64 {
    5
}

fn default_retry_max_secs() -> u64 {
    300
}

fn default_inactivity_secs() -> u64 {
    DEFAULT_INACTIVITY_SECS
}

fn default_sweep_interval_ms() -> u64 {
    1_000
}

fn default_max_lines_per_issue() -> usize {
    200
}

fn default_max_lines_for_text() -> usize {
    20
}

fn default_distance_threshold() -> f32 {
    DEFAULT_DISTANCE_THRESHOLD
}

fn default_neighbors() -> usize {
    3
}

fn default_tie_epsilon() -> f32 {
    1e-6
}

fn default_max_examples() -> usize {
    8
}

fn default_centroid_max_weight() -> u64 {
    1_000
}

fn default_cas_retries() -> usize {
    5
}

fn default_significance_threshold() -> u64 {
    25
}

fn default_enrichment_max_attempts() -> usize {
    3
}

fn default_attempt_timeout_secs() -> u64 {
    30
}

fn default_backoff_base_ms() -> u64 {
    200
}

fn default_backoff_max_ms() -> u64 {
    2_000
}

fn default_requeue_delay_secs() -> u64 {
    60
}

fn default_max_requeues() -> u32 {
    5
}

fn default_dedup_ttl_secs() -> u64 {
    3_600
}

fn default_alert_ttl_secs() -> u64 {
    86_400
}

fn default_context_templates() -> u32 {
    8
}

fn default_context_logs() -> u32 {
    10
}

fn default_hypotheses() -> usize {
    3
}

fn default_improver_interval_secs() -> u64 {
    300
}

fn default_merge_threshold() -> f32 {
    DEFAULT_MERGE_THRESHOLD
}

fn default_split_factor() -> f32 {
    0.5
}

fn default_min_subcluster_size() -> usize {
    3
}

fn default_sample_size() -> usize {
    500
}

fn default_feedback_batch() -> usize {
    100
}

fn default_drift_interval_secs() -> u64 {
    60
}

fn default_drift_window_secs() -> u64 {
    3_600
}

fn default_high_drift_rate() -> f32 {
    0.5
}

fn default_min_silhouette() -> f32 {
    0.1
}

fn default_min_assignments() -> u64 {
    20
}

fn default_sample_cap() -> usize {
    400
}

fn default_event_retention_secs() -> u64 {
    7 * 24 * 3_600
}

fn normalize_optional(input: Option<String>) -> Option<String> {
    input
        .map(|value| value.trim().to_owned())
        .filter(|value| !value.is_empty())
}

fn normalize_config(mut config: FaultlineConfig) -> FaultlineConfig {
    config.inference.model = normalize_optional(config.inference.model.take());
    config.inference.endpoint = normalize_optional(config.inference.endpoint.take());
    config.embeddings.model = normalize_optional(config.embeddings.model.take());
    config.embeddings.endpoint = normalize_optional(config.embeddings.endpoint.take());

    let api_key_env = config.inference.api_key_env.trim();
    if api_key_env.is_empty() {
        config.inference.api_key_env = default_api_key_env();
    } else {
        config.inference.api_key_env = api_key_env.to_owned();
    }

    config.pipeline.partitions = config.pipeline.partitions.clamp(1, 1_024);
    config.pipeline.workers_per_stage = config
        .pipeline
        .workers_per_stage
        .clamp(1, config.pipeline.partitions);
    config.pipeline.batch_size = config.pipeline.batch_size.clamp(1, 1_000);
    config.pipeline.visibility_timeout_secs = config.pipeline.visibility_timeout_secs.max(1);
    config.pipeline.max_delivery_attempts = config.pipeline.max_delivery_attempts.max(1);
    config.pipeline.poll_interval_ms = config.pipeline.poll_interval_ms.max(10);
    config.pipeline.transient_retry_max_secs = config
        .pipeline
        .transient_retry_max_secs
        .max(config.pipeline.transient_retry_delay_secs);

    config.aggregator.inactivity_secs = config.aggregator.inactivity_secs.max(1);
    config.aggregator.sweep_interval_ms = config.aggregator.sweep_interval_ms.max(10);
    config.aggregator.max_lines_per_issue = config.aggregator.max_lines_per_issue.max(1);
    config.aggregator.max_lines_for_text = config.aggregator.max_lines_for_text.max(1);

    config.clustering.distance_threshold = clamp_finite(
        config.clustering.distance_threshold,
        0.0,
        2.0,
        DEFAULT_DISTANCE_THRESHOLD,
    );
    config.clustering.neighbors = config.clustering.neighbors.clamp(1, 50);
    config.clustering.tie_epsilon = clamp_finite(config.clustering.tie_epsilon, 0.0, 0.1, 1e-6);
    config.clustering.max_examples = config.clustering.max_examples.max(1);
    config.clustering.centroid_max_weight = config.clustering.centroid_max_weight.max(1);
    config.clustering.cas_retries = config.clustering.cas_retries.max(1);

    config.enrichment.significance_threshold = config.enrichment.significance_threshold.max(1);
    config.enrichment.max_attempts = config.enrichment.max_attempts.max(1);
    config.enrichment.attempt_timeout_secs = config.enrichment.attempt_timeout_secs.max(1);
    config.enrichment.backoff_max_ms = config
        .enrichment
        .backoff_max_ms
        .max(config.enrichment.backoff_base_ms);
    config.enrichment.context_templates = config.enrichment.context_templates.clamp(1, 100);
    config.enrichment.context_logs = config.enrichment.context_logs.clamp(1, 100);
    config.enrichment.hypotheses = config.enrichment.hypotheses.clamp(1, 10);

    config.improver.interval_secs = config.improver.interval_secs.max(1);
    config.improver.merge_threshold = clamp_finite(
        config.improver.merge_threshold,
        0.0,
        2.0,
        DEFAULT_MERGE_THRESHOLD,
    );
    config.improver.split_factor = clamp_finite(config.improver.split_factor, 0.05, 1.0, 0.5);
    config.improver.min_subcluster_size = config.improver.min_subcluster_size.max(1);
    config.improver.sample_size = config.improver.sample_size.max(1);
    config.improver.feedback_batch = config.improver.feedback_batch.max(1);

    config.drift.interval_secs = config.drift.interval_secs.max(1);
    config.drift.window_secs = config.drift.window_secs.max(1);
    config.drift.high_drift_rate = clamp_finite(config.drift.high_drift_rate, 0.0, 1.0, 0.5);
    config.drift.min_silhouette = clamp_finite(config.drift.min_silhouette, -1.0, 1.0, 0.1);
    config.drift.sample_cap = config.drift.sample_cap.max(2);

    config
}

fn clamp_finite(value: f32, min: f32, max: f32, fallback: f32) -> f32 {
    if value.is_finite() {
        value.clamp(min, max)
    } else {
        fallback
    }
}

#[cfg(test)]
mod tests {
    use std::fs;

    use tempfile::tempdir;

    use super::*;

    #[test]
    fn ensure_workspace_config_creates_default_file() {
        let temp = tempdir().expect("tempdir");
        let workspace = temp.path();

        let config = ensure_workspace_config(workspace).expect("ensure config");

        assert_eq!(config.inference.provider, InferenceProviderKind::Auto);
        assert_eq!(config.inference.api_key_env, DEFAULT_GEMINI_API_KEY_ENV);
        assert_eq!(config.embeddings.mode, EmbeddingMode::Templated);
        assert_eq!(config.clustering.distance_threshold, DEFAULT_DISTANCE_THRESHOLD);
        assert!(config_path(workspace).exists());

        let content = fs::read_to_string(config_path(workspace)).expect("read config file");
        assert!(content.contains("[inference]"));
        assert!(content.contains("[clustering]"));
        assert!(content.contains("provider = \"auto\""));
    }

    #[test]
    fn load_workspace_config_parses_and_normalizes_values() {
        let temp = tempdir().expect("tempdir");
        let workspace = temp.path();
        fs::create_dir_all(faultline_dir(workspace)).expect("create .faultline");

        let raw = r#"
[inference]
provider = "qwen3_local"
model = "  qwen3:4b  "
api_key_env = "   "

[embeddings]
provider = "qwen3_local"
mode = "raw"
vector_backend = "lancedb"

[clustering]
distance_threshold = 7.5
neighbors = 0
granularity = "line"

[enrichment]
on_flush = "all"
"#;
        fs::write(config_path(workspace), raw).expect("write config");

        let config = load_workspace_config(workspace).expect("load config");

        assert_eq!(config.inference.provider, InferenceProviderKind::Qwen3Local);
        assert_eq!(config.inference.model.as_deref(), Some("qwen3:4b"));
        assert_eq!(config.inference.api_key_env, DEFAULT_GEMINI_API_KEY_ENV);
        assert_eq!(config.embeddings.provider, EmbeddingProviderKind::Qwen3Local);
        assert_eq!(config.embeddings.mode, EmbeddingMode::Raw);
        assert_eq!(
            config.embeddings.vector_backend,
            EmbeddingVectorBackend::Lancedb
        );
        assert_eq!(config.clustering.distance_threshold, 2.0);
        assert_eq!(config.clustering.neighbors, 1);
        assert_eq!(config.clustering.granularity, Granularity::Line);
        assert_eq!(config.enrichment.on_flush, FlushEnrichment::All);
        assert_eq!(
            config.aggregator.inactivity_secs,
            DEFAULT_INACTIVITY_SECS
        );
    }

    #[test]
    fn validate_config_flags_merge_threshold_looser_than_assignment() {
        let mut config = FaultlineConfig::default();
        assert!(validate_config(&config).is_empty());

        config.improver.merge_threshold = 0.4;
        let warnings = validate_config(&config);
        assert_eq!(warnings.len(), 1);
        assert_eq!(warnings[0].code, "merge_threshold_not_tighter");
    }

    #[test]
    fn embedding_mode_parses_aliases() {
        assert_eq!("semantic".parse::<EmbeddingMode>(), Ok(EmbeddingMode::Raw));
        assert_eq!(
            "template".parse::<EmbeddingMode>(),
            Ok(EmbeddingMode::Templated)
        );
        assert!("vector".parse::<EmbeddingMode>().is_err());
    }
}
