use std::collections::BTreeMap;
use std::sync::OnceLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

const SCORE_PER_LABEL: f32 = 0.2;
const UNKNOWN_LABEL: &str = "unknown";

/// Cheap keyword screen for hardware failure families.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailureSignal {
    pub has_signal: bool,
    pub label: String,
    pub labels: Vec<String>,
    pub score: f32,
    pub evidence: Vec<String>,
}

pub fn detect_failure_signal(text: &str) -> FailureSignal {
    let mut labels = Vec::new();
    let mut evidence = Vec::new();

    for (label, pattern) in failure_rules() {
        if let Some(found) = pattern.find(text) {
            labels.push((*label).to_owned());
            evidence.push(found.as_str().to_ascii_lowercase());
        }
    }

    let score = if labels.is_empty() {
        0.0
    } else {
        (SCORE_PER_LABEL * labels.len() as f32).min(1.0)
    };

    FailureSignal {
        has_signal: !labels.is_empty(),
        label: labels
            .first()
            .cloned()
            .unwrap_or_else(|| UNKNOWN_LABEL.to_owned()),
        labels,
        score,
        evidence,
    }
}

/// Most common first-matching label across texts; ties resolve alphabetically.
pub fn majority_label<'a>(texts: impl IntoIterator<Item = &'a str>) -> Option<String> {
    let mut counts = BTreeMap::<String, usize>::new();
    for text in texts {
        let signal = detect_failure_signal(text);
        if signal.has_signal {
            *counts.entry(signal.label).or_default() += 1;
        }
    }

    counts
        .into_iter()
        .fold(None::<(String, usize)>, |best, (label, count)| match best {
            Some((_, best_count)) if best_count >= count => best,
            _ => Some((label, count)),
        })
        .map(|(label, _)| label)
}

fn failure_rules() -> &'static [(&'static str, Regex)] {
    static RULES: OnceLock<Vec<(&'static str, Regex)>> = OnceLock::new();
    RULES.get_or_init(|| {
        [
            (
                "disk",
                r"(?i)\b(smart|reallocated|bad sector|io error|i/o error|seek error|read error|write error|fsck|filesystem error|disk failure|block error)\b",
            ),
            (
                "raid",
                r"(?i)\b(raid degraded|mdadm|array degraded|rebuild failed|missing member)\b",
            ),
            (
                "nvme",
                r"(?i)\b(nvme fatal|nvme error|pcie? error|pcie bus error)\b",
            ),
            (
                "thermal",
                r"(?i)\b(overheat|thermal throttle|temperature limit|over temperature)\b",
            ),
            (
                "memory",
                r"(?i)\b(ecc error|corrected error|uncorrectable|memtest|oom killer)\b",
            ),
            (
                "power",
                r"(?i)\b(psu|power loss|brownout|undervoltage|overvoltage)\b",
            ),
            (
                "cpu",
                r"(?i)\b(mce|machine check|cpu stall|soft lockup|hard lockup)\b",
            ),
            (
                "network",
                r"(?i)\b(link down|carrier lost|nic failure|packet loss|rx/tx error)\b",
            ),
        ]
        .into_iter()
        .map(|(label, pattern)| (label, Regex::new(pattern).expect("valid failure rule regex")))
        .collect()
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn detects_labels_in_rule_order_with_capped_score() {
        let signal = detect_failure_signal("md0: RAID degraded after I/O error on sdb");
        assert!(signal.has_signal);
        assert_eq!(signal.label, "disk");
        assert_eq!(signal.labels, vec!["disk".to_owned(), "raid".to_owned()]);
        assert!((signal.score - 0.4).abs() < 1e-6);
        assert!(signal.evidence.contains(&"raid degraded".to_owned()));
    }

    #[test]
    fn quiet_lines_report_unknown_without_signal() {
        let signal = detect_failure_signal("session opened for user root");
        assert!(!signal.has_signal);
        assert_eq!(signal.label, "unknown");
        assert_eq!(signal.score, 0.0);
    }

    #[test]
    fn majority_label_prefers_most_frequent_family() {
        let label = majority_label([
            "eth0: link down",
            "eth0: carrier lost",
            "CPU0: machine check event",
            "session opened",
        ]);
        assert_eq!(label.as_deref(), Some("network"));
        assert_eq!(majority_label(["all quiet"]), None);
    }
}
