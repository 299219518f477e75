use std::env;
use std::path::Path;

use async_trait::async_trait;
use faultline_config::{
    DEFAULT_GEMINI_API_KEY_ENV, DEFAULT_QWEN_EMBEDDING_ENDPOINT, DEFAULT_QWEN_EMBEDDING_MODEL,
    DEFAULT_QWEN_ENDPOINT, DEFAULT_QWEN_MODEL, EmbeddingProviderKind, InferenceProviderKind,
    ensure_workspace_config,
};
use faultline_core::{Classification, CoreError, Namespace, OsClass, detect_failure_signal};
use serde::Deserialize;
use serde_json::{Value, json};
use thiserror::Error;

pub const GEMINI_API_KEY_ENV: &str = DEFAULT_GEMINI_API_KEY_ENV;
pub const MOCK_EMBEDDING_DIM: usize = 64;
const GEMINI_API_BASE: &str = "https://generativelanguage.googleapis.com/v1beta";
const GEMINI_DEFAULT_MODEL: &str = "gemini-2.0-flash";
const PARSE_VALIDATION_RETRIES: usize = 2;
const MAX_HYPOTHESES: usize = 8;
const MOCK_UNKNOWN_CATEGORY: &str = "unknown";
const MOCK_UNKNOWN_CONFIDENCE: f32 = 0.2;
const MOCK_SIGNAL_BASE_CONFIDENCE: f32 = 0.55;

/// Retrieved neighbours handed to the classifier alongside the item text.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ClassificationContext {
    pub templates: Vec<String>,
    pub related_logs: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClassificationRequest {
    pub os_class: OsClass,
    pub text: String,
    pub context: ClassificationContext,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ProviderOverrides {
    pub provider: Option<InferenceProviderKind>,
    pub model: Option<String>,
    pub endpoint: Option<String>,
    pub api_key_env: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct EmbeddingProviderOverrides {
    pub provider: Option<EmbeddingProviderKind>,
    pub model: Option<String>,
    pub endpoint: Option<String>,
}

pub struct LoadedClassificationProvider {
    pub provider: Box<dyn ClassificationProvider>,
    pub provider_name: String,
    pub model_name: String,
}

pub struct LoadedEmbeddingProvider {
    pub provider: Box<dyn EmbeddingProvider>,
    pub provider_name: String,
    pub model_name: String,
}

impl LoadedEmbeddingProvider {
    /// Vector space produced by this provider for one OS class.
    pub fn namespace(&self, os_class: OsClass, dim: usize) -> Namespace {
        Namespace::new(os_class, &self.provider_name, &self.model_name, dim)
    }
}

#[derive(Debug, Error)]
pub enum InferError {
    #[error("missing Gemini API key in {0}")]
    MissingApiKey(String),
    #[error("config load failed: {0}")]
    Config(#[from] faultline_config::ConfigError),
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("response decoding failed: {0}")]
    Json(#[from] serde_json::Error),
    #[error("invalid model response: {0}")]
    InvalidResponse(String),
    #[error("classification rejected: {0}")]
    Validation(#[from] CoreError),
    #[error("failed to parse or validate model output after retries: {0}")]
    ParseValidationExhausted(String),
    #[error("invalid embedding response: {0}")]
    InvalidEmbeddingResponse(String),
}

#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    async fn embed_text(&self, text: &str) -> Result<Vec<f32>, InferError>;
}

#[async_trait]
pub trait ClassificationProvider: Send + Sync {
    async fn classify(
        &self,
        request: &ClassificationRequest,
    ) -> Result<Classification, InferError>;

    /// Up to `count` hypothetical log documents describing the failure behind `text`.
    async fn hypothesize(&self, text: &str, count: usize) -> Result<Vec<String>, InferError>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct MockEmbeddingProvider;

#[async_trait]
impl EmbeddingProvider for MockEmbeddingProvider {
    async fn embed_text(&self, text: &str) -> Result<Vec<f32>, InferError> {
        Ok(mock_embedding_for_text(text))
    }
}

/// Offline classifier driven by the keyword failure rules.
#[derive(Debug, Default, Clone, Copy)]
pub struct MockClassifier;

#[async_trait]
impl ClassificationProvider for MockClassifier {
    async fn classify(
        &self,
        request: &ClassificationRequest,
    ) -> Result<Classification, InferError> {
        let signal = detect_failure_signal(&request.text);
        let classification = if signal.has_signal {
            Classification {
                category: signal.label.clone(),
                confidence: (MOCK_SIGNAL_BASE_CONFIDENCE + signal.score).min(0.95),
                rationale: format!("matched {}", signal.evidence.join(", ")),
            }
        } else {
            Classification {
                category: MOCK_UNKNOWN_CATEGORY.to_owned(),
                confidence: MOCK_UNKNOWN_CONFIDENCE,
                rationale: "no failure keywords matched".to_owned(),
            }
        };

        Ok(classification.validated()?)
    }

    async fn hypothesize(&self, text: &str, count: usize) -> Result<Vec<String>, InferError> {
        let text = text.trim();
        if count == 0 || text.is_empty() {
            return Ok(Vec::new());
        }

        let signal = detect_failure_signal(text);
        let mut candidates = vec![text.to_owned()];
        if signal.has_signal {
            candidates.push(format!("{} failure reported: {text}", signal.label));
            for evidence in &signal.evidence {
                candidates.push(format!("{} error: {evidence} detected", signal.label));
            }
        }

        Ok(clean_hypotheses(candidates, count))
    }
}

#[derive(Debug, Clone)]
pub struct GeminiClassifier {
    client: reqwest::Client,
    api_key: String,
    model: String,
    api_base: String,
}

impl GeminiClassifier {
    pub fn from_env_key(api_key_env: &str, model: Option<String>) -> Result<Self, InferError> {
        let api_key = read_env_non_empty(api_key_env)
            .ok_or_else(|| InferError::MissingApiKey(api_key_env.to_owned()))?;

        Ok(Self::new(api_key, resolve_gemini_model(model)))
    }

    pub fn new(api_key: String, model: String) -> Self {
        Self {
            client: reqwest::Client::new(),
            api_key,
            model,
            api_base: GEMINI_API_BASE.to_owned(),
        }
    }

    fn endpoint_url(&self) -> String {
        format!(
            "{}/models/{}:generateContent?key={}",
            self.api_base, self.model, self.api_key
        )
    }

    async fn request_candidate_json(&self, prompt: &str) -> Result<String, InferError> {
        let body = json!({
            "contents": [
                {
                    "parts": [
                        {
                            "text": prompt
                        }
                    ]
                }
            ],
            "generationConfig": {
                "responseMimeType": "application/json",
                "temperature": 0.0
            }
        });

        let response_value: Value = self
            .client
            .post(self.endpoint_url())
            .json(&body)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;

        extract_gemini_text_part(&response_value).map(|text| text.to_owned())
    }
}

#[async_trait]
impl ClassificationProvider for GeminiClassifier {
    async fn classify(
        &self,
        request: &ClassificationRequest,
    ) -> Result<Classification, InferError> {
        let prompt = build_classification_prompt(request);
        run_parse_validation_retries(
            PARSE_VALIDATION_RETRIES,
            || async { self.request_candidate_json(&prompt).await },
            parse_and_validate_classification,
        )
        .await
    }

    async fn hypothesize(&self, text: &str, count: usize) -> Result<Vec<String>, InferError> {
        if count == 0 {
            return Ok(Vec::new());
        }
        let prompt = build_hypothesis_prompt(text, count);
        let hypotheses = run_parse_validation_retries(
            PARSE_VALIDATION_RETRIES,
            || async { self.request_candidate_json(&prompt).await },
            parse_hypotheses,
        )
        .await?;
        Ok(clean_hypotheses(hypotheses, count))
    }
}

/// Ollama-style `/api/generate` classifier.
#[derive(Debug, Clone)]
pub struct Qwen3LocalClassifier {
    client: reqwest::Client,
    endpoint: String,
    model: String,
}

impl Qwen3LocalClassifier {
    pub fn new(endpoint: Option<String>, model: Option<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            endpoint: normalize_optional(endpoint)
                .unwrap_or_else(|| DEFAULT_QWEN_ENDPOINT.to_owned()),
            model: normalize_optional(model).unwrap_or_else(|| DEFAULT_QWEN_MODEL.to_owned()),
        }
    }

    async fn request_candidate_json(&self, prompt: &str) -> Result<String, InferError> {
        let body = json!({
            "model": self.model,
            "prompt": prompt,
            "stream": false,
            "format": "json"
        });

        let response_value: Value = self
            .client
            .post(&self.endpoint)
            .json(&body)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;

        extract_local_text_part(&response_value)
    }
}

#[async_trait]
impl ClassificationProvider for Qwen3LocalClassifier {
    async fn classify(
        &self,
        request: &ClassificationRequest,
    ) -> Result<Classification, InferError> {
        let prompt = build_classification_prompt(request);
        run_parse_validation_retries(
            PARSE_VALIDATION_RETRIES,
            || async { self.request_candidate_json(&prompt).await },
            parse_and_validate_classification,
        )
        .await
    }

    async fn hypothesize(&self, text: &str, count: usize) -> Result<Vec<String>, InferError> {
        if count == 0 {
            return Ok(Vec::new());
        }
        let prompt = build_hypothesis_prompt(text, count);
        let hypotheses = run_parse_validation_retries(
            PARSE_VALIDATION_RETRIES,
            || async { self.request_candidate_json(&prompt).await },
            parse_hypotheses,
        )
        .await?;
        Ok(clean_hypotheses(hypotheses, count))
    }
}

#[derive(Debug, Clone)]
pub struct Qwen3LocalEmbeddingProvider {
    client: reqwest::Client,
    endpoint: String,
    model: String,
}

impl Qwen3LocalEmbeddingProvider {
    pub fn new(endpoint: Option<String>, model: Option<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            endpoint: normalize_optional(endpoint)
                .unwrap_or_else(|| DEFAULT_QWEN_EMBEDDING_ENDPOINT.to_owned()),
            model: normalize_optional(model)
                .unwrap_or_else(|| DEFAULT_QWEN_EMBEDDING_MODEL.to_owned()),
        }
    }

    async fn request_embedding(&self, text: &str) -> Result<Vec<f32>, InferError> {
        let body = json!({
            "model": self.model,
            "prompt": text
        });

        let response_value: Value = self
            .client
            .post(&self.endpoint)
            .json(&body)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;

        extract_embedding_vector(&response_value)
    }
}

#[async_trait]
impl EmbeddingProvider for Qwen3LocalEmbeddingProvider {
    async fn embed_text(&self, text: &str) -> Result<Vec<f32>, InferError> {
        self.request_embedding(text).await
    }
}

pub fn load_classification_provider(
    workspace_root: impl AsRef<Path>,
    overrides: ProviderOverrides,
) -> Result<LoadedClassificationProvider, InferError> {
    let config = ensure_workspace_config(workspace_root)?;

    let selected_provider = overrides.provider.unwrap_or(config.inference.provider);
    let selected_model = first_non_empty(overrides.model, config.inference.model);
    let selected_endpoint = first_non_empty(overrides.endpoint, config.inference.endpoint);
    let selected_api_key_env =
        first_non_empty(overrides.api_key_env, Some(config.inference.api_key_env))
            .unwrap_or_else(|| DEFAULT_GEMINI_API_KEY_ENV.to_owned());

    let loaded = match selected_provider {
        InferenceProviderKind::Auto => match read_env_non_empty(&selected_api_key_env) {
            Some(api_key) => {
                let model = resolve_gemini_model(selected_model);
                LoadedClassificationProvider {
                    provider: Box::new(GeminiClassifier::new(api_key, model.clone())),
                    provider_name: InferenceProviderKind::Gemini.as_str().to_owned(),
                    model_name: model,
                }
            }
            None => mock_classifier(),
        },
        InferenceProviderKind::Mock => mock_classifier(),
        InferenceProviderKind::Gemini => {
            let provider = GeminiClassifier::from_env_key(&selected_api_key_env, selected_model)?;
            LoadedClassificationProvider {
                model_name: provider.model.clone(),
                provider: Box::new(provider),
                provider_name: InferenceProviderKind::Gemini.as_str().to_owned(),
            }
        }
        InferenceProviderKind::Qwen3Local => {
            let provider = Qwen3LocalClassifier::new(selected_endpoint, selected_model);
            LoadedClassificationProvider {
                model_name: provider.model.clone(),
                provider: Box::new(provider),
                provider_name: InferenceProviderKind::Qwen3Local.as_str().to_owned(),
            }
        }
    };

    tracing::debug!(
        provider = %loaded.provider_name,
        model = %loaded.model_name,
        "classification provider loaded"
    );
    Ok(loaded)
}

pub fn load_embedding_provider(
    workspace_root: impl AsRef<Path>,
    overrides: EmbeddingProviderOverrides,
) -> Result<LoadedEmbeddingProvider, InferError> {
    let config = ensure_workspace_config(workspace_root)?;

    let selected_provider = overrides.provider.unwrap_or(config.embeddings.provider);
    let selected_model = first_non_empty(overrides.model, config.embeddings.model);
    let selected_endpoint = first_non_empty(overrides.endpoint, config.embeddings.endpoint);

    let loaded = match selected_provider {
        EmbeddingProviderKind::Mock => LoadedEmbeddingProvider {
            provider: Box::new(MockEmbeddingProvider),
            provider_name: EmbeddingProviderKind::Mock.as_str().to_owned(),
            model_name: format!("mock-{MOCK_EMBEDDING_DIM}d"),
        },
        EmbeddingProviderKind::Qwen3Local => {
            let provider = Qwen3LocalEmbeddingProvider::new(selected_endpoint, selected_model);
            LoadedEmbeddingProvider {
                model_name: provider.model.clone(),
                provider: Box::new(provider),
                provider_name: EmbeddingProviderKind::Qwen3Local.as_str().to_owned(),
            }
        }
    };

    tracing::debug!(
        provider = %loaded.provider_name,
        model = %loaded.model_name,
        "embedding provider loaded"
    );
    Ok(loaded)
}

fn mock_classifier() -> LoadedClassificationProvider {
    LoadedClassificationProvider {
        provider: Box::new(MockClassifier),
        provider_name: InferenceProviderKind::Mock.as_str().to_owned(),
        model_name: "mock".to_owned(),
    }
}

fn build_classification_prompt(request: &ClassificationRequest) -> String {
    let templates = bullet_list(&request.context.templates);
    let related_logs = bullet_list(&request.context.related_logs);
    format!(
        "You are classifying the root cause of an operational failure seen in {os} logs. \
Respond with STRICT JSON only (no markdown, no prose) and exactly these fields: \
category (short lowercase string such as disk, raid, nvme, thermal, memory, power, cpu, network, software or unknown), \
confidence (number in [0.0,1.0]), rationale (one sentence). Do not add any extra keys.\n\n\
Known templates for similar events:\n{templates}\n\nRelated historical log lines:\n{related_logs}\n\n\
Event to classify:\n{text}",
        os = request.os_class.as_str(),
        text = request.text,
    )
}

fn build_hypothesis_prompt(text: &str, count: usize) -> String {
    format!(
        "Write {count} short hypothetical log lines that a system would emit while experiencing \
the same underlying failure as the event below. Respond with STRICT JSON only in the form \
{{\"hypotheses\": [\"...\"]}}.\n\nEvent:\n{text}"
    )
}

fn bullet_list(items: &[String]) -> String {
    if items.is_empty() {
        return "- (none)".to_owned();
    }
    items
        .iter()
        .map(|item| format!("- {item}"))
        .collect::<Vec<_>>()
        .join("\n")
}

async fn run_parse_validation_retries<T, F, Fut>(
    retries: usize,
    mut candidate_json_loader: F,
    parse: fn(&str) -> Result<T, String>,
) -> Result<T, InferError>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<String, InferError>>,
{
    let mut last_error = String::from("unknown parse/validation failure");

    for attempt in 0..=retries {
        let candidate_json = candidate_json_loader().await?;

        match parse(&candidate_json) {
            Ok(value) => return Ok(value),
            Err(message) => {
                tracing::debug!(attempt, error = %message, "model output rejected");
                last_error = message;
            }
        }
    }

    Err(InferError::ParseValidationExhausted(last_error))
}

fn parse_and_validate_classification(candidate_json: &str) -> Result<Classification, String> {
    let normalized = normalize_candidate_json(candidate_json);

    let classification: Classification =
        serde_json::from_str(&normalized).map_err(|err| format!("json parse error: {err}"))?;

    classification
        .validated()
        .map_err(|err| format!("classification validation error: {err}"))
}

#[derive(Deserialize)]
#[serde(untagged)]
enum HypothesesPayload {
    Wrapped { hypotheses: Vec<String> },
    Bare(Vec<String>),
}

fn parse_hypotheses(candidate_json: &str) -> Result<Vec<String>, String> {
    let normalized = normalize_candidate_json(candidate_json);
    let payload: HypothesesPayload =
        serde_json::from_str(&normalized).map_err(|err| format!("json parse error: {err}"))?;
    let hypotheses = match payload {
        HypothesesPayload::Wrapped { hypotheses } | HypothesesPayload::Bare(hypotheses) => {
            hypotheses
        }
    };

    if hypotheses.iter().all(|item| item.trim().is_empty()) {
        return Err("no hypotheses returned".to_owned());
    }
    Ok(hypotheses)
}

fn clean_hypotheses(candidates: Vec<String>, count: usize) -> Vec<String> {
    let limit = count.min(MAX_HYPOTHESES);
    let mut cleaned: Vec<String> = Vec::with_capacity(limit);
    for candidate in candidates {
        let candidate = candidate.trim();
        if candidate.is_empty() || cleaned.iter().any(|existing| existing == candidate) {
            continue;
        }
        cleaned.push(candidate.to_owned());
        if cleaned.len() == limit {
            break;
        }
    }
    cleaned
}

fn extract_gemini_text_part(response: &Value) -> Result<&str, InferError> {
    response
        .get("candidates")
        .and_then(Value::as_array)
        .and_then(|candidates| candidates.first())
        .and_then(|candidate| candidate.get("content"))
        .and_then(|content| content.get("parts"))
        .and_then(Value::as_array)
        .and_then(|parts| parts.first())
        .and_then(|part| part.get("text"))
        .and_then(Value::as_str)
        .ok_or_else(|| {
            InferError::InvalidResponse("missing candidates[0].content.parts[0].text".to_owned())
        })
}

fn extract_local_text_part(response: &Value) -> Result<String, InferError> {
    if let Some(text) = value_to_candidate_json(response) {
        return Ok(text);
    }

    let candidate_paths = [
        "/response",
        "/text",
        "/output",
        "/message/content",
        "/choices/0/text",
        "/choices/0/message/content",
        "/data/output",
    ];

    for path in candidate_paths {
        if let Some(value) = response.pointer(path)
            && let Some(text) = value_to_candidate_json(value)
        {
            return Ok(text);
        }
    }

    Err(InferError::InvalidResponse(
        "missing local model text/JSON response body".to_owned(),
    ))
}

fn extract_embedding_vector(response: &Value) -> Result<Vec<f32>, InferError> {
    if let Some(vector) = value_to_embedding_vector(response) {
        return Ok(vector);
    }

    let candidate_paths = [
        "/embedding",
        "/data/0/embedding",
        "/embeddings/0",
        "/embeddings/0/embedding",
        "/vector",
    ];

    for path in candidate_paths {
        if let Some(value) = response.pointer(path)
            && let Some(vector) = value_to_embedding_vector(value)
        {
            return Ok(vector);
        }
    }

    Err(InferError::InvalidEmbeddingResponse(
        "missing embedding vector in local model response body".to_owned(),
    ))
}

fn value_to_embedding_vector(value: &Value) -> Option<Vec<f32>> {
    let values = value.as_array()?;
    if values.is_empty() {
        return None;
    }

    let mut embedding = Vec::with_capacity(values.len());
    for item in values {
        let number = item.as_f64()?;
        if !number.is_finite() {
            return None;
        }
        embedding.push(number as f32);
    }

    normalize_embedding(embedding)
}

fn value_to_candidate_json(value: &Value) -> Option<String> {
    if let Some(text) = value.as_str() {
        return Some(text.to_owned());
    }

    if looks_like_model_payload(value) {
        return Some(value.to_string());
    }

    None
}

fn looks_like_model_payload(value: &Value) -> bool {
    let Some(obj) = value.as_object() else {
        return false;
    };

    (obj.contains_key("category") && obj.contains_key("confidence"))
        || obj.contains_key("hypotheses")
}

fn normalize_candidate_json(candidate_json: &str) -> String {
    let trimmed = candidate_json.trim();

    if !trimmed.starts_with("```") {
        return trimmed.to_owned();
    }

    let mut lines = trimmed.lines();
    let _fence_line = lines.next();

    let mut body: Vec<&str> = lines.collect();
    if body.last().is_some_and(|line| line.trim() == "```") {
        body.pop();
    }

    body.join("\n").trim().to_owned()
}

fn normalize_optional(value: Option<String>) -> Option<String> {
    value
        .map(|value| value.trim().to_owned())
        .filter(|value| !value.is_empty())
}

fn mock_embedding_for_text(text: &str) -> Vec<f32> {
    let mut embedding = vec![0.0f32; MOCK_EMBEDDING_DIM];
    let mut saw_token = false;

    for token in tokenize_for_embedding(text) {
        saw_token = true;
        let normalized = token.to_ascii_lowercase();
        let hash = fnv1a_64(normalized.as_bytes());
        let index = (hash as usize) % MOCK_EMBEDDING_DIM;
        let sign = if ((hash >> 8) & 1) == 0 { 1.0 } else { -1.0 };
        embedding[index] += sign;
    }

    if !saw_token {
        return embedding;
    }

    normalize_embedding(embedding).unwrap_or_else(|| vec![0.0f32; MOCK_EMBEDDING_DIM])
}

fn tokenize_for_embedding(text: &str) -> impl Iterator<Item = &str> {
    text.split(|ch: char| !ch.is_ascii_alphanumeric())
        .filter(|token| !token.is_empty())
}

fn fnv1a_64(bytes: &[u8]) -> u64 {
    let mut hash = 0xcbf29ce484222325u64;
    for byte in bytes {
        hash ^= u64::from(*byte);
        hash = hash.wrapping_mul(0x100000001b3);
    }
    hash
}

fn normalize_embedding(mut embedding: Vec<f32>) -> Option<Vec<f32>> {
    let norm_sq = embedding
        .iter()
        .map(|value| value * value)
        .fold(0.0f32, |acc, value| acc + value);
    if norm_sq <= f32::EPSILON {
        return None;
    }

    let norm = norm_sq.sqrt();
    for value in &mut embedding {
        *value /= norm;
    }

    Some(embedding)
}

fn resolve_gemini_model(model: Option<String>) -> String {
    normalize_optional(model).unwrap_or_else(|| GEMINI_DEFAULT_MODEL.to_owned())
}

fn first_non_empty(left: Option<String>, right: Option<String>) -> Option<String> {
    normalize_optional(left).or_else(|| normalize_optional(right))
}

fn read_env_non_empty(name: &str) -> Option<String> {
    env::var(name)
        .ok()
        .map(|value| value.trim().to_owned())
        .filter(|value| !value.is_empty())
}
