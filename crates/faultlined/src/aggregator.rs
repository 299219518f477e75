use std::collections::{BTreeSet, HashMap, HashSet};

use faultline_config::AggregatorConfig;
use faultline_core::{Issue, IssueKey, IssueState, LogEntry, issue_id_for};

/// An issue that left the OPEN state, with the queue messages that carried its lines.
#[derive(Debug, Clone, PartialEq)]
pub struct FlushedIssue {
    pub issue: Issue,
    /// Acknowledged only after the issue itself is enqueued downstream.
    pub message_ids: Vec<i64>,
}

#[derive(Debug)]
struct OpenIssue {
    issue: Issue,
    message_ids: Vec<i64>,
    deadline: i64,
}

/// Per-key `NONE -> OPEN -> FLUSHED` state machine with an inactivity window.
///
/// Time is passed in explicitly (milliseconds). Deadlines are kept in an ordered
/// set so a sweep only touches expired keys and never scans the open map.
#[derive(Debug)]
pub struct IssueAggregator {
    inactivity_ms: i64,
    max_lines: usize,
    open: HashMap<String, OpenIssue>,
    deadlines: BTreeSet<(i64, String)>,
    held: HashSet<i64>,
}

impl IssueAggregator {
    pub fn new(inactivity_ms: i64, max_lines: usize) -> Self {
        Self {
            inactivity_ms: inactivity_ms.max(0),
            max_lines: max_lines.max(1),
            open: HashMap::new(),
            deadlines: BTreeSet::new(),
            held: HashSet::new(),
        }
    }

    pub fn from_config(config: &AggregatorConfig) -> Self {
        Self::new(
            (config.inactivity_secs as i64).saturating_mul(1_000),
            config.max_lines_per_issue,
        )
    }

    pub fn open_issues(&self) -> usize {
        self.open.len()
    }

    pub fn holds(&self, message_id: i64) -> bool {
        self.held.contains(&message_id)
    }

    pub fn held_message_ids(&self) -> Vec<i64> {
        let mut ids = self.held.iter().copied().collect::<Vec<_>>();
        ids.sort_unstable();
        ids
    }

    /// Appends a line to its key's open issue, opening one when needed.
    ///
    /// Returns the issues this call closed: a same-key issue whose window already
    /// ran out before the sweep noticed, and the current issue when it reached
    /// `max_lines`. A message id that is already held is a redelivery and is ignored.
    pub fn observe(
        &mut self,
        entry: LogEntry,
        message_id: Option<i64>,
        now: i64,
    ) -> Vec<FlushedIssue> {
        if let Some(message_id) = message_id
            && !self.held.insert(message_id)
        {
            return Vec::new();
        }

        let key = IssueKey::from_entry(&entry).as_key();
        let mut flushed = Vec::new();
        if self
            .open
            .get(&key)
            .is_some_and(|open| open.deadline <= now)
        {
            flushed.extend(self.flush(&key));
        }

        let deadline = now.saturating_add(self.inactivity_ms);
        match self.open.get_mut(&key) {
            Some(open) => {
                self.deadlines.remove(&(open.deadline, key.clone()));
                open.deadline = deadline;
                open.issue.last_seen_at = now;
                open.issue.member_lines.push(entry);
                open.message_ids.extend(message_id);
            }
            None => {
                let issue = Issue {
                    issue_id: issue_id_for(&key, &entry.id),
                    issue_key: key.clone(),
                    source_id: entry.source_id.clone(),
                    os_class: entry.os_class(),
                    member_lines: vec![entry],
                    opened_at: now,
                    last_seen_at: now,
                    state: IssueState::Open,
                };
                self.open.insert(
                    key.clone(),
                    OpenIssue {
                        issue,
                        message_ids: message_id.into_iter().collect(),
                        deadline,
                    },
                );
            }
        }
        self.deadlines.insert((deadline, key.clone()));

        if self
            .open
            .get(&key)
            .is_some_and(|open| open.issue.member_lines.len() >= self.max_lines)
        {
            flushed.extend(self.flush(&key));
        }
        flushed
    }

    /// Flushes every issue whose inactivity deadline is at or before `now`.
    pub fn sweep(&mut self, now: i64) -> Vec<FlushedIssue> {
        let expired = self
            .deadlines
            .iter()
            .take_while(|(deadline, _)| *deadline <= now)
            .map(|(_, key)| key.clone())
            .collect::<Vec<_>>();

        expired.iter().filter_map(|key| self.flush(key)).collect()
    }

    /// External flush of one key; the key's state is deleted.
    pub fn flush(&mut self, issue_key: &str) -> Option<FlushedIssue> {
        let mut open = self.open.remove(issue_key)?;
        self.deadlines.remove(&(open.deadline, issue_key.to_owned()));
        for message_id in &open.message_ids {
            self.held.remove(message_id);
        }
        open.issue.state = IssueState::Flushed;
        Some(FlushedIssue {
            issue: open.issue,
            message_ids: open.message_ids,
        })
    }

    /// Drops all open state without emitting anything and returns the held message ids.
    pub fn abandon_all(&mut self) -> Vec<i64> {
        let ids = self.held_message_ids();
        self.open.clear();
        self.deadlines.clear();
        self.held.clear();
        ids
    }
}
