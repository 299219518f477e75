use std::collections::BTreeMap;
use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use thiserror::Error;

mod producer;
mod signals;
pub mod vector;

pub use faultline_config::EmbeddingMode;
pub use producer::{IngestRecord, ProducerPayload};
pub use signals::{FailureSignal, detect_failure_signal, majority_label};

pub type PrototypeId = String;

pub const FIELD_OS_CLASS: &str = "os_class";
pub const FIELD_HOST: &str = "host";
pub const FIELD_COMPONENT: &str = "component";
pub const FIELD_PID: &str = "pid";
pub const FIELD_CONTENT: &str = "content";
pub const FIELD_TEMPLATE: &str = "template";
pub const NO_PID: &str = "nopid";
pub const UNKNOWN_COMPONENT: &str = "unknown";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CoreError {
    #[error("invalid classification: {0}")]
    InvalidClassification(String),
    #[error("invalid ingest record: {0}")]
    InvalidRecord(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Ord, PartialOrd)]
#[serde(rename_all = "snake_case")]
pub enum OsClass {
    Linux,
    Macos,
    Windows,
    Unknown,
}

impl OsClass {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Linux => "linux",
            Self::Macos => "macos",
            Self::Windows => "windows",
            Self::Unknown => "unknown",
        }
    }

    /// Infers the OS class from a producer source name such as `linux.log` or `mac-host-3`.
    pub fn from_source_name(source: &str) -> Self {
        let lowered = source.trim().to_ascii_lowercase();
        if lowered.contains("linux") {
            Self::Linux
        } else if lowered.contains("mac") || lowered.contains("osx") || lowered.contains("darwin")
        {
            Self::Macos
        } else if lowered.contains("windows") || lowered.starts_with("win") {
            Self::Windows
        } else {
            Self::Unknown
        }
    }
}

impl std::str::FromStr for OsClass {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim() {
            "linux" => Ok(Self::Linux),
            "macos" | "mac" | "osx" => Ok(Self::Macos),
            "windows" | "win" => Ok(Self::Windows),
            "unknown" => Ok(Self::Unknown),
            other => Err(format!(
                "invalid os class '{other}', expected one of: linux, macos, windows, unknown"
            )),
        }
    }
}

impl fmt::Display for OsClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEntry {
    pub id: String,
    pub source_id: String,
    pub raw_text: String,
    pub timestamp: i64,
    #[serde(default)]
    pub parsed_fields: BTreeMap<String, String>,
}

impl LogEntry {
    pub fn new(
        source_id: impl Into<String>,
        raw_text: impl Into<String>,
        timestamp: i64,
        parsed_fields: BTreeMap<String, String>,
    ) -> Self {
        let source_id = source_id.into();
        let raw_text = raw_text.into();
        Self {
            id: log_entry_id(&source_id, timestamp, &raw_text),
            source_id,
            raw_text,
            timestamp,
            parsed_fields,
        }
    }

    /// Binds the id to one ingest observation, so identical lines seen in the same
    /// run (or within one timestamp) stay distinct members.
    pub fn observed_at(mut self, received_at: i64, sequence: u64) -> Self {
        self.id = stable_id(&[
            &self.id,
            "observed",
            &received_at.to_string(),
            &sequence.to_string(),
        ]);
        self
    }

    pub fn field(&self, name: &str) -> Option<&str> {
        self.parsed_fields
            .get(name)
            .map(String::as_str)
            .filter(|value| !value.is_empty())
    }

    pub fn os_class(&self) -> OsClass {
        self.field(FIELD_OS_CLASS)
            .and_then(|value| value.parse().ok())
            .unwrap_or_else(|| OsClass::from_source_name(&self.source_id))
    }

    pub fn component(&self) -> &str {
        self.field(FIELD_COMPONENT).unwrap_or(UNKNOWN_COMPONENT)
    }

    pub fn pid(&self) -> Option<&str> {
        self.field(FIELD_PID)
    }

    pub fn template(&self) -> Option<&str> {
        self.field(FIELD_TEMPLATE)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct IssueKey {
    pub source_id: String,
    pub component: String,
    pub pid: Option<String>,
}

impl IssueKey {
    pub fn from_entry(entry: &LogEntry) -> Self {
        Self {
            source_id: entry.source_id.trim().to_owned(),
            component: entry.component().trim().to_ascii_lowercase(),
            pid: entry.pid().map(str::to_owned),
        }
    }

    pub fn as_key(&self) -> String {
        format!(
            "{}|{}|{}",
            self.source_id,
            self.component,
            self.pid.as_deref().unwrap_or(NO_PID)
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IssueState {
    Open,
    Flushed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Issue {
    pub issue_id: String,
    pub issue_key: String,
    pub source_id: String,
    pub os_class: OsClass,
    pub member_lines: Vec<LogEntry>,
    pub opened_at: i64,
    pub last_seen_at: i64,
    pub state: IssueState,
}

impl Issue {
    pub fn raw_lines(&self) -> impl Iterator<Item = &str> {
        self.member_lines.iter().map(|entry| entry.raw_text.as_str())
    }
}

/// Identity of a vector space: vectors from different namespaces are never compared.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Namespace {
    pub os_class: OsClass,
    pub provider: String,
    pub model: String,
    pub dim: usize,
}

impl Namespace {
    pub fn new(
        os_class: OsClass,
        provider: impl Into<String>,
        model: impl Into<String>,
        dim: usize,
    ) -> Self {
        Self {
            os_class,
            provider: provider.into().trim().to_owned(),
            model: model.into().trim().to_owned(),
            dim,
        }
    }

    pub fn key(&self) -> String {
        format!(
            "{}|{}|{}|{}",
            self.os_class.as_str(),
            self.provider,
            self.model,
            self.dim
        )
    }

    pub fn embedding_signature(&self) -> String {
        format!("{}/{}@{}", self.provider, self.model, self.dim)
    }

    pub fn from_key(key: &str) -> Option<Self> {
        let mut parts = key.splitn(4, '|');
        let os_class = parts.next()?.parse().ok()?;
        let provider = parts.next()?;
        let model = parts.next()?;
        let dim = parts.next()?.parse().ok()?;
        Some(Self::new(os_class, provider, model, dim))
    }
}

impl fmt::Display for Namespace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.key())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Template {
    pub template_id: String,
    pub namespace: String,
    pub os_class: OsClass,
    pub template_text: String,
    pub created_at: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClusterPrototype {
    pub prototype_id: PrototypeId,
    pub namespace: String,
    pub centroid: Vec<f32>,
    pub member_count: u64,
    pub last_classification: Option<String>,
    pub confidence: Option<f32>,
    pub classified_member_count: u64,
    pub examples: Vec<String>,
    pub embedding_mode: EmbeddingMode,
    pub version: i64,
    pub superseded_by: Option<PrototypeId>,
    pub created_at: i64,
    pub updated_at: i64,
}

impl ClusterPrototype {
    pub fn is_live(&self) -> bool {
        self.superseded_by.is_none()
    }

    pub fn members_since_classification(&self) -> u64 {
        self.member_count
            .saturating_sub(self.classified_member_count)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Classification {
    pub category: String,
    pub confidence: f32,
    #[serde(default)]
    pub rationale: String,
}

impl Classification {
    /// Normalizes the category and rejects anything outside the response contract.
    pub fn validated(mut self) -> Result<Self, CoreError> {
        self.category = self.category.trim().to_ascii_lowercase();
        if self.category.is_empty() {
            return Err(CoreError::InvalidClassification(
                "category must not be empty".to_owned(),
            ));
        }
        if !self.confidence.is_finite() || !(0.0..=1.0).contains(&self.confidence) {
            return Err(CoreError::InvalidClassification(format!(
                "confidence {} is outside [0, 1]",
                self.confidence
            )));
        }
        self.rationale = self.rationale.trim().to_owned();
        Ok(self)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SourceRef {
    Prototype { prototype_id: PrototypeId },
    Issue { issue_id: String },
    Line { entry_id: String },
}

impl SourceRef {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Prototype { .. } => "prototype",
            Self::Issue { .. } => "issue",
            Self::Line { .. } => "line",
        }
    }

    pub fn id(&self) -> &str {
        match self {
            Self::Prototype { prototype_id } => prototype_id,
            Self::Issue { issue_id } => issue_id,
            Self::Line { entry_id } => entry_id,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Alert {
    #[serde(rename = "id")]
    pub alert_id: String,
    pub source_ref: SourceRef,
    pub prototype_id: Option<PrototypeId>,
    pub namespace: String,
    pub classification: String,
    pub confidence: f32,
    pub rationale: String,
    pub generated_at: i64,
    pub ttl_secs: u64,
}

impl Alert {
    pub fn expires_at(&self) -> i64 {
        self.generated_at
            .saturating_add((self.ttl_secs as i64).saturating_mul(1_000))
    }
}

pub fn stable_id(parts: &[&str]) -> String {
    let mut hasher = blake3::Hasher::new();
    for (index, part) in parts.iter().enumerate() {
        if index > 0 {
            hasher.update(b"\n");
        }
        hasher.update(part.as_bytes());
    }
    hasher.finalize().to_hex().to_string()
}

pub fn log_entry_id(source_id: &str, timestamp: i64, raw_text: &str) -> String {
    stable_id(&[source_id.trim(), &timestamp.to_string(), raw_text])
}

pub fn issue_id_for(issue_key: &str, first_entry_id: &str) -> String {
    stable_id(&["issue", issue_key, first_entry_id])
}

pub fn prototype_id_for(namespace_key: &str, idempotency_key: &str) -> PrototypeId {
    stable_id(&["prototype", namespace_key, idempotency_key])
}

pub fn template_id_for(namespace_key: &str, template_text: &str) -> String {
    stable_id(&["template", namespace_key, template_text])
}

/// Key under which functionally identical alerts are suppressed while a dedup record is live.
pub fn alert_dedup_key(
    namespace_key: &str,
    category: &str,
    source_kind: &str,
    representative_text: &str,
) -> String {
    stable_id(&[
        "dedup",
        namespace_key,
        category,
        source_kind,
        representative_text,
    ])
}

/// Stable partition for a routing key; every stage routes one key to the same partition.
pub fn partition_for(partition_key: &str, partitions: u32) -> u32 {
    let hash = blake3::hash(partition_key.as_bytes());
    let mut prefix = [0u8; 8];
    prefix.copy_from_slice(&hash.as_bytes()[..8]);
    (u64::from_le_bytes(prefix) % u64::from(partitions.max(1))) as u32
}

pub fn unix_timestamp_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|duration| duration.as_millis() as i64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry_with_fields(source: &str, component: &str, pid: Option<&str>) -> LogEntry {
        let mut fields = BTreeMap::new();
        fields.insert(FIELD_COMPONENT.to_owned(), component.to_owned());
        if let Some(pid) = pid {
            fields.insert(FIELD_PID.to_owned(), pid.to_owned());
        }
        LogEntry::new(source, "line", 1_000, fields)
    }

    #[test]
    fn os_class_is_inferred_from_source_names() {
        assert_eq!(OsClass::from_source_name("linux.log"), OsClass::Linux);
        assert_eq!(OsClass::from_source_name("mac.log"), OsClass::Macos);
        assert_eq!(OsClass::from_source_name("Windows_CBS"), OsClass::Windows);
        assert_eq!(OsClass::from_source_name("switch-7"), OsClass::Unknown);
    }

    #[test]
    fn issue_key_lowercases_component_and_marks_missing_pid() {
        let with_pid = IssueKey::from_entry(&entry_with_fields("linux.log", "SSHD", Some("42")));
        assert_eq!(with_pid.as_key(), "linux.log|sshd|42");

        let without_pid = IssueKey::from_entry(&entry_with_fields("linux.log", "kernel", None));
        assert_eq!(without_pid.as_key(), "linux.log|kernel|nopid");
    }

    #[test]
    fn log_entry_ids_are_deterministic() {
        let first = LogEntry::new("linux.log", "disk error", 5, BTreeMap::new());
        let second = LogEntry::new("linux.log", "disk error", 5, BTreeMap::new());
        let later = LogEntry::new("linux.log", "disk error", 6, BTreeMap::new());
        assert_eq!(first.id, second.id);
        assert_ne!(first.id, later.id);
    }

    #[test]
    fn observed_entries_with_identical_text_get_distinct_ids() {
        let base = LogEntry::new("linux.log", "disk error", 5, BTreeMap::new());
        let first = base.clone().observed_at(1_000, 0);
        let second = base.clone().observed_at(1_000, 1);
        let replayed = base.observed_at(1_000, 0);
        assert_ne!(first.id, second.id);
        assert_eq!(first.id, replayed.id);
    }

    #[test]
    fn namespace_key_round_trips_and_separates_models() {
        let namespace = Namespace::new(OsClass::Linux, "mock", "mock", 64);
        assert_eq!(namespace.key(), "linux|mock|mock|64");
        assert_eq!(Namespace::from_key(&namespace.key()), Some(namespace.clone()));

        let other_model = Namespace::new(OsClass::Linux, "mock", "mock-v2", 64);
        assert_ne!(namespace.key(), other_model.key());
    }

    #[test]
    fn classification_validation_rejects_out_of_range_confidence() {
        let valid = Classification {
            category: "  Disk ".to_owned(),
            confidence: 0.8,
            rationale: " smart errors ".to_owned(),
        }
        .validated()
        .expect("valid classification");
        assert_eq!(valid.category, "disk");
        assert_eq!(valid.rationale, "smart errors");

        let too_confident = Classification {
            category: "disk".to_owned(),
            confidence: 1.5,
            rationale: String::new(),
        };
        assert!(too_confident.validated().is_err());

        let empty = Classification {
            category: " ".to_owned(),
            confidence: 0.5,
            rationale: String::new(),
        };
        assert!(empty.validated().is_err());
    }

    #[test]
    fn partition_for_is_stable_and_in_range() {
        let first = partition_for("linux.log|sshd|42", 16);
        let second = partition_for("linux.log|sshd|42", 16);
        assert_eq!(first, second);
        assert!(first < 16);
        assert_eq!(partition_for("anything", 0), 0);
    }

    #[test]
    fn alert_serializes_id_field_for_alert_boundary() {
        let alert = Alert {
            alert_id: "a-1".to_owned(),
            source_ref: SourceRef::Prototype {
                prototype_id: "p-1".to_owned(),
            },
            prototype_id: Some("p-1".to_owned()),
            namespace: "linux|mock|mock|64".to_owned(),
            classification: "disk".to_owned(),
            confidence: 0.9,
            rationale: "bad sectors".to_owned(),
            generated_at: 10_000,
            ttl_secs: 60,
        };
        let value = serde_json::to_value(&alert).expect("serialize alert");
        assert_eq!(value["id"], "a-1");
        assert_eq!(value["source_ref"]["kind"], "prototype");
        assert_eq!(alert.expires_at(), 70_000);
    }
}
