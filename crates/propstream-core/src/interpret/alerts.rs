//! Alerts interpreter
//!
//! Alerts are keyed by id. Records without an id get a synthetic one so they
//! can still be shown; those ids are unique only with high probability.

use std::collections::HashSet;
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use super::{
    as_record, bulk_items, classify, extract_id, first_present, first_string, is_bulk,
    number_value, parse_timestamp, unwrap_key, Pattern, Rule,
};
use crate::protocol::Envelope;

/// Title used when the record carries none
pub const DEFAULT_TITLE: &str = "Realtime alert";

const ID_FIELDS: &[&str] = &["id", "alertId", "key", "uid", "identifier"];
const BULK_FIELDS: &[&str] = &["items", "alerts"];
const WRAPPER: &str = "alert";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BulkVerb {
    Set,
    UpsertMany,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SingleVerb {
    Clear,
    Remove,
    Upsert,
}

const BULK_RULES: &[Rule<BulkVerb>] = &[Rule {
    patterns: &[
        Pattern::Contains("snapshot"),
        Pattern::Word("set"),
        Pattern::Contains("replace"),
    ],
    verb: BulkVerb::Set,
}];

const SINGLE_RULES: &[Rule<SingleVerb>] = &[
    Rule {
        patterns: &[Pattern::Contains("clear"), Pattern::Contains("reset")],
        verb: SingleVerb::Clear,
    },
    Rule {
        patterns: &[
            Pattern::Contains("resolve"),
            Pattern::Contains("dismiss"),
            Pattern::Contains("delete"),
            Pattern::Contains("remove"),
            Pattern::Contains("acknowledge"),
        ],
        verb: SingleVerb::Remove,
    },
];

/// Alert severity, ordered from least to most urgent
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    #[default]
    Info,
    Success,
    Warning,
    Error,
}

impl Severity {
    /// Map a keyword or numeric score to a severity
    ///
    /// Scores: `>= 90` error, `>= 60` warning, `>= 30` success, else info.
    /// Anything unrecognized is info.
    pub fn from_value(value: Option<&Value>) -> Self {
        let Some(value) = value else {
            return Severity::Info;
        };

        if let Some(keyword) = value.as_str() {
            match keyword.trim().to_lowercase().as_str() {
                "success" | "ok" | "positive" | "resolved" => return Severity::Success,
                "warning" | "warn" | "caution" => return Severity::Warning,
                "error" | "danger" | "critical" | "high" => return Severity::Error,
                "info" | "informational" | "notice" => return Severity::Info,
                _ => {}
            }
        }

        match number_value(Some(value)) {
            Some(score) if score >= 90.0 => Severity::Error,
            Some(score) if score >= 60.0 => Severity::Warning,
            Some(score) if score >= 30.0 => Severity::Success,
            _ => Severity::Info,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Info => "info",
            Severity::Success => "success",
            Severity::Warning => "warning",
            Severity::Error => "error",
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A user-facing alert
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AlertItem {
    pub id: String,
    pub title: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub severity: Severity,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
    /// Epoch milliseconds
    pub received_at: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Map<String, Value>>,
}

impl AlertItem {
    /// Build from a loosely-typed record; only non-records are rejected
    pub fn from_value(value: &Value, envelope: &Envelope) -> Option<Self> {
        let value = unwrap_key(value, WRAPPER);
        let record = as_record(value)?;

        let id = extract_id(value, ID_FIELDS)
            .unwrap_or_else(|| synthetic_id(envelope.received_at.timestamp_millis()));
        let title = first_string(record, &["title", "message", "headline"])
            .unwrap_or(DEFAULT_TITLE)
            .to_string();
        let description =
            first_string(record, &["description", "details", "summary"]).map(str::to_string);
        let severity =
            Severity::from_value(first_present(record, &["severity", "level", "priority", "tone"]));
        let source = first_string(record, &["source", "category"]).map(str::to_string);
        let received_at = parse_timestamp(first_present(record, &["timestamp", "sentAt", "createdAt"]))
            .unwrap_or_else(|| envelope.received_at.timestamp_millis());

        Some(Self {
            id,
            title,
            description,
            severity,
            source,
            received_at,
            metadata: record.get("metadata").and_then(Value::as_object).cloned(),
        })
    }
}

fn synthetic_id(millis: i64) -> String {
    format!("alert-{}-{:x}", millis, rand::random::<u64>())
}

/// Alert mutation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum AlertAction {
    Upsert { alert: AlertItem },
    UpsertMany { alerts: Vec<AlertItem> },
    Set { alerts: Vec<AlertItem> },
    Remove { id: String },
    Clear,
}

impl AlertAction {
    pub fn kind(&self) -> &'static str {
        match self {
            AlertAction::Upsert { .. } => "upsert",
            AlertAction::UpsertMany { .. } => "upsertMany",
            AlertAction::Set { .. } => "set",
            AlertAction::Remove { .. } => "remove",
            AlertAction::Clear => "clear",
        }
    }

    pub fn describe(&self) -> String {
        match self {
            AlertAction::Upsert { alert } => {
                format!("upsert {} [{}] {}", alert.id, alert.severity, alert.title)
            }
            AlertAction::UpsertMany { alerts } => format!("upsertMany {} alerts", alerts.len()),
            AlertAction::Set { alerts } => format!("set {} alerts", alerts.len()),
            AlertAction::Remove { id } => format!("remove {id}"),
            AlertAction::Clear => "clear".to_string(),
        }
    }
}

/// Classify an `alerts` envelope
pub fn interpret(envelope: &Envelope) -> Option<AlertAction> {
    let payload = &envelope.payload;

    if is_bulk(payload, BULK_FIELDS) {
        let alerts: Vec<AlertItem> = bulk_items(payload, BULK_FIELDS)?
            .iter()
            .filter_map(|item| AlertItem::from_value(item, envelope))
            .collect();
        if alerts.is_empty() {
            return None;
        }
        return Some(match classify(&envelope.event, BULK_RULES, BulkVerb::UpsertMany) {
            BulkVerb::Set => AlertAction::Set { alerts },
            BulkVerb::UpsertMany => AlertAction::UpsertMany { alerts },
        });
    }

    match classify(&envelope.event, SINGLE_RULES, SingleVerb::Upsert) {
        SingleVerb::Clear => Some(AlertAction::Clear),
        SingleVerb::Remove => {
            extract_id(unwrap_key(payload, WRAPPER), ID_FIELDS).map(|id| AlertAction::Remove { id })
        }
        SingleVerb::Upsert => AlertItem::from_value(payload, envelope).map(|alert| AlertAction::Upsert { alert }),
    }
}

/// Decides which alerts should raise a user notification
///
/// Each alert id notifies at most once until it is removed or the set is
/// cleared. Snapshots mark their alerts as seen without notifying.
#[derive(Debug, Default, Clone)]
pub struct AlertNotifier {
    seen: HashSet<String>,
}

impl AlertNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed an action; returns the alerts that are new to the user
    pub fn observe<'a>(&mut self, action: &'a AlertAction) -> Vec<&'a AlertItem> {
        match action {
            AlertAction::Clear => {
                self.seen.clear();
                Vec::new()
            }
            AlertAction::Set { alerts } => {
                self.seen.extend(alerts.iter().map(|alert| alert.id.clone()));
                Vec::new()
            }
            AlertAction::Remove { id } => {
                self.seen.remove(id);
                Vec::new()
            }
            AlertAction::Upsert { alert } => self.fresh(std::slice::from_ref(alert)),
            AlertAction::UpsertMany { alerts } => self.fresh(alerts),
        }
    }

    fn fresh<'a>(&mut self, alerts: &'a [AlertItem]) -> Vec<&'a AlertItem> {
        alerts
            .iter()
            .filter(|alert| self.seen.insert(alert.id.clone()))
            .collect()
    }

    pub fn is_seen(&self, id: &str) -> bool {
        self.seen.contains(id)
    }

    pub fn reset(&mut self) {
        self.seen.clear();
    }
}
