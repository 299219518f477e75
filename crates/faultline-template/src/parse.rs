use std::sync::OnceLock;

use faultline_core::{OsClass, UNKNOWN_COMPONENT};
use regex::Regex;

/// Structured view of one raw line. `content` is the message body after any
/// timestamp/host/component prefix.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedLine {
    pub os_class: OsClass,
    pub host: Option<String>,
    pub component: String,
    pub pid: Option<String>,
    pub level: Option<String>,
    pub content: String,
}

fn syslog_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^(\w{3})\s+(\d{1,2})\s+(\d{2}:\d{2}:\d{2})\s+(\S+)\s+([^\[\s][^\[]*?)\[(\d+)\]:\s*(.*)$")
            .expect("valid syslog regex")
    })
}

fn syslog_no_pid_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^(\w{3})\s+(\d{1,2})\s+(\d{2}:\d{2}:\d{2})\s+(\S+)\s+([^\s:\[]+):\s*(.*)$")
            .expect("valid syslog regex")
    })
}

fn windows_cbs_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^(\d{4}-\d{2}-\d{2})\s+(\d{2}:\d{2}:\d{2}),\s+(\w+)\s+(\S+)\s+(.*)$")
            .expect("valid windows cbs regex")
    })
}

fn bracketed_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^([^\s\[]+)\[([^\]]+)\]:\s*(.*)$").expect("valid bracketed regex")
    })
}

fn component_colon_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^([^\s:\[]+):\s+(.*)$").expect("valid component regex"))
}

fn level_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?i)\b(info|debug|warn|warning|error|critical|alert)\b")
            .expect("valid level regex")
    })
}

/// Parses the known shapes in order: BSD syslog (with and without pid), Windows CBS,
/// `component[pid]: body`, `component: body`. Anything else keeps the whole line as
/// content under the unknown component.
pub fn parse_line(os_class: OsClass, line: &str) -> ParsedLine {
    let line = line.trim();

    if let Some(caps) = syslog_re().captures(line) {
        return ParsedLine {
            os_class,
            host: Some(caps[4].to_owned()),
            component: caps[5].trim().to_owned(),
            pid: Some(caps[6].to_owned()),
            level: detect_level(&caps[7]),
            content: caps[7].trim().to_owned(),
        };
    }

    if let Some(caps) = syslog_no_pid_re().captures(line) {
        return ParsedLine {
            os_class,
            host: Some(caps[4].to_owned()),
            component: caps[5].to_owned(),
            pid: None,
            level: detect_level(&caps[6]),
            content: caps[6].trim().to_owned(),
        };
    }

    if let Some(caps) = windows_cbs_re().captures(line) {
        return ParsedLine {
            os_class,
            host: None,
            component: caps[4].to_owned(),
            pid: None,
            level: Some(caps[3].to_ascii_uppercase()),
            content: caps[5].trim().to_owned(),
        };
    }

    if let Some(caps) = bracketed_re().captures(line) {
        return ParsedLine {
            os_class,
            host: None,
            component: caps[1].to_owned(),
            pid: Some(caps[2].to_owned()),
            level: detect_level(&caps[3]),
            content: caps[3].trim().to_owned(),
        };
    }

    if let Some(caps) = component_colon_re().captures(line) {
        return ParsedLine {
            os_class,
            host: None,
            component: caps[1].to_owned(),
            pid: None,
            level: detect_level(&caps[2]),
            content: caps[2].trim().to_owned(),
        };
    }

    ParsedLine {
        os_class,
        host: None,
        component: UNKNOWN_COMPONENT.to_owned(),
        pid: None,
        level: detect_level(line),
        content: line.to_owned(),
    }
}

fn detect_level(text: &str) -> Option<String> {
    level_re()
        .find(text)
        .map(|found| match found.as_str().to_ascii_uppercase().as_str() {
            "WARNING" => "WARN".to_owned(),
            other => other.to_owned(),
        })
}
