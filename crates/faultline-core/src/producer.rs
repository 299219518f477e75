use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::CoreError;

/// The normalized record every producer hands to the logs queue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IngestRecord {
    pub source: String,
    pub text: String,
    #[serde(default)]
    pub timestamp: Option<i64>,
}

impl IngestRecord {
    pub fn validated(mut self) -> Result<Self, CoreError> {
        self.source = self.source.trim().to_owned();
        if self.source.is_empty() {
            return Err(CoreError::InvalidRecord("source must not be empty".to_owned()));
        }
        if self.text.trim().is_empty() {
            return Err(CoreError::InvalidRecord("text must not be empty".to_owned()));
        }
        if self.text.contains('\n') {
            self.text = self.text.split_whitespace().collect::<Vec<_>>().join(" ");
        }
        Ok(self)
    }
}

/// Producer-specific payloads, reduced to one text line at the ingestion boundary.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "producer", rename_all = "snake_case")]
pub enum ProducerPayload {
    FileTail {
        source: String,
        line: String,
        #[serde(default)]
        timestamp: Option<i64>,
    },
    SnmpTrap {
        agent: String,
        trap_oid: String,
        #[serde(default)]
        varbinds: BTreeMap<String, String>,
        #[serde(default)]
        timestamp: Option<i64>,
    },
    RedfishEvent {
        host: String,
        message_id: String,
        message: String,
        #[serde(default)]
        severity: Option<String>,
        #[serde(default)]
        component: Option<String>,
        #[serde(default)]
        timestamp: Option<i64>,
    },
    NetworkAlert {
        tool: String,
        target: String,
        summary: String,
        #[serde(default)]
        timestamp: Option<i64>,
    },
    Generic {
        source: String,
        text: String,
        #[serde(default)]
        timestamp: Option<i64>,
    },
}

impl ProducerPayload {
    pub fn into_record(self) -> Result<IngestRecord, CoreError> {
        let record = match self {
            Self::FileTail {
                source,
                line,
                timestamp,
            } => IngestRecord {
                source,
                text: line,
                timestamp,
            },
            Self::SnmpTrap {
                agent,
                trap_oid,
                varbinds,
                timestamp,
            } => {
                let bindings = varbinds
                    .iter()
                    .map(|(oid, value)| format!("{oid}={value}"))
                    .collect::<Vec<_>>()
                    .join(" ");
                IngestRecord {
                    source: format!("snmp:{agent}"),
                    text: format!("snmptrapd[{agent}]: trap {trap_oid} {bindings}")
                        .trim_end()
                        .to_owned(),
                    timestamp,
                }
            }
            Self::RedfishEvent {
                host,
                message_id,
                message,
                severity,
                component,
                timestamp,
            } => {
                let component = component.unwrap_or_else(|| "redfish".to_owned());
                let severity = severity.unwrap_or_else(|| "OK".to_owned());
                IngestRecord {
                    source: format!("redfish:{host}"),
                    text: format!("{component}[{message_id}]: {severity} {message}"),
                    timestamp,
                }
            }
            Self::NetworkAlert {
                tool,
                target,
                summary,
                timestamp,
            } => IngestRecord {
                source: format!("{tool}:{target}"),
                text: format!("{tool}: {target} {summary}"),
                timestamp,
            },
            Self::Generic {
                source,
                text,
                timestamp,
            } => IngestRecord {
                source,
                text,
                timestamp,
            },
        };

        record.validated()
    }
}
