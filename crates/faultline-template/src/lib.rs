//! Line parsing and templating.
//!
//! `normalize` is deterministic: the same raw text always produces the same template,
//! which is what lets templated-mode clustering group lines that differ only in values.

use std::collections::BTreeMap;
use std::sync::OnceLock;

use faultline_core::{
    EmbeddingMode, FIELD_COMPONENT, FIELD_CONTENT, FIELD_HOST, FIELD_OS_CLASS, FIELD_PID,
    FIELD_TEMPLATE, IngestRecord, Issue, LogEntry, OsClass, UNKNOWN_COMPONENT,
};
use regex::Regex;

mod parse;

pub use parse::{ParsedLine, parse_line};

pub const WILDCARD: &str = "<*>";
pub const FIELD_LEVEL: &str = "level";

/// Pattern classes, most specific first. Alternation is leftmost-first, so at any
/// position the earlier class wins.
const VARIABLE_PATTERNS: &[&str] = &[
    r"\d{4}-\d{2}-\d{2}[T ]\d{2}:\d{2}:\d{2}(?:[.,]\d+)?(?:Z|[+-]\d{2}:?\d{2})?",
    r"\b(?:[0-9A-Fa-f]{2}[:-]){5}[0-9A-Fa-f]{2}\b",
    r"\b[0-9a-fA-F]{8}(?:-[0-9a-fA-F]{4}){3}-[0-9a-fA-F]{12}\b",
    r"\b(?:\d{1,3}\.){3}\d{1,3}(?::\d{1,5})?\b",
    r"\b\d{1,2}:\d{2}:\d{2}(?:\.\d+)?\b",
    r"\b(?:[0-9A-Fa-f]{1,4}:){2,7}[0-9A-Fa-f]{1,4}\b",
    r"\b0[xX][0-9A-Fa-f]+\b",
    r"\b\d+(?:\.\d+){1,3}\b",
    r"\b[A-Za-z_]*\d[A-Za-z0-9_]*\b",
];

fn variable_re() -> &'static Regex {
    static VARIABLE_RE: OnceLock<Regex> = OnceLock::new();
    VARIABLE_RE.get_or_init(|| {
        let alternation = VARIABLE_PATTERNS
            .iter()
            .map(|pattern| format!("(?:{pattern})"))
            .collect::<Vec<_>>()
            .join("|");
        Regex::new(&alternation).expect("valid variable regex")
    })
}

fn repeated_wildcard_re() -> &'static Regex {
    static REPEATED_WILDCARD_RE: OnceLock<Regex> = OnceLock::new();
    REPEATED_WILDCARD_RE.get_or_init(|| {
        Regex::new(r"<\*>(?:\s*<\*>)+").expect("valid repeated wildcard regex")
    })
}

/// Replaces variable spans with [`WILDCARD`] and returns the template plus the
/// extracted values in order of appearance.
pub fn normalize(raw_text: &str) -> (String, Vec<String>) {
    let mut variables = Vec::new();
    let masked = variable_re().replace_all(raw_text, |captures: &regex::Captures<'_>| {
        variables.push(captures[0].to_owned());
        WILDCARD
    });
    let collapsed = repeated_wildcard_re().replace_all(&masked, WILDCARD);
    let template = collapsed.split_whitespace().collect::<Vec<_>>().join(" ");
    (template, variables)
}

/// Canonical template text stored per namespace. Pids are volatile and never part of it.
pub fn render_template_text(component: &str, template: &str) -> String {
    if template.is_empty() {
        component.to_owned()
    } else {
        format!("{component}: {template}")
    }
}

/// Builds the immutable LogEntry for an ingest record, with parsed and templated fields.
pub fn build_log_entry(record: &IngestRecord, received_at: i64) -> LogEntry {
    let os_class = OsClass::from_source_name(&record.source);
    let parsed = parse_line(os_class, &record.text);
    let (template, _) = normalize(&parsed.content);

    let mut fields = BTreeMap::new();
    fields.insert(FIELD_OS_CLASS.to_owned(), os_class.as_str().to_owned());
    fields.insert(FIELD_COMPONENT.to_owned(), parsed.component.clone());
    fields.insert(FIELD_CONTENT.to_owned(), parsed.content.clone());
    fields.insert(
        FIELD_TEMPLATE.to_owned(),
        render_template_text(&parsed.component, &template),
    );
    if let Some(pid) = parsed.pid {
        fields.insert(FIELD_PID.to_owned(), pid);
    }
    if let Some(host) = parsed.host {
        fields.insert(FIELD_HOST.to_owned(), host);
    }
    if let Some(level) = parsed.level {
        fields.insert(FIELD_LEVEL.to_owned(), level);
    }

    LogEntry::new(
        record.source.as_str(),
        record.text.as_str(),
        record.timestamp.unwrap_or(received_at),
        fields,
    )
}

pub fn entry_template(entry: &LogEntry) -> String {
    match entry.template() {
        Some(template) => template.to_owned(),
        None => {
            let content = entry.field(FIELD_CONTENT).unwrap_or(&entry.raw_text);
            let (template, _) = normalize(content);
            let component = entry
                .field(FIELD_COMPONENT)
                .unwrap_or(UNKNOWN_COMPONENT);
            render_template_text(component, &template)
        }
    }
}

/// Text embedded for a single line under the configured mode.
pub fn embedding_text(mode: EmbeddingMode, entry: &LogEntry) -> String {
    match mode {
        EmbeddingMode::Templated => entry_template(entry),
        EmbeddingMode::Raw => entry.raw_text.clone(),
    }
}

/// Text embedded for free-form text (hypotheses, operator queries) under the configured mode.
pub fn embedding_text_for_free_text(mode: EmbeddingMode, text: &str) -> String {
    match mode {
        EmbeddingMode::Templated => normalize(text).0,
        EmbeddingMode::Raw => text.trim().to_owned(),
    }
}

/// Issue summary: distinct templates in arrival order (templated) or the leading raw lines.
pub fn issue_text(mode: EmbeddingMode, issue: &Issue, max_lines: usize) -> String {
    let max_lines = max_lines.max(1);
    match mode {
        EmbeddingMode::Templated => {
            let mut seen = Vec::<String>::new();
            for entry in &issue.member_lines {
                let template = entry_template(entry);
                if !seen.contains(&template) {
                    seen.push(template);
                }
                if seen.len() >= max_lines {
                    break;
                }
            }
            seen.join("\n")
        }
        EmbeddingMode::Raw => issue
            .raw_lines()
            .take(max_lines)
            .collect::<Vec<_>>()
            .join("\n"),
    }
}
