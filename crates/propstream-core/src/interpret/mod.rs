//! Domain Interpreters
//!
//! Pure classifiers that turn loosely-typed envelopes into idempotent domain
//! actions. The server publishes no event catalog, so classification is
//! keyword based: each domain keeps an ordered table of event-name patterns
//! and the first match decides the verb.

pub mod alerts;
pub mod dashboard;
pub mod events;
pub mod pipeline;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::debug;

use crate::protocol::Envelope;

pub use alerts::{AlertAction, AlertItem, AlertNotifier, Severity};
pub use dashboard::{DashboardAction, DashboardSummary, Timeframe};
pub use events::Invalidation;
pub use pipeline::{Opportunity, PipelineAction};

pub const PIPELINE_CHANNEL: &str = "pipeline";
pub const DASHBOARDS_CHANNEL: &str = "dashboards";
pub const ALERTS_CHANNEL: &str = crate::router::ALERTS_CHANNEL;
pub const EVENTS_CHANNEL: &str = crate::router::EVENTS_CHANNEL;

/// An interpreted mutation, tagged with the domain it applies to
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "domain", content = "action", rename_all = "camelCase")]
pub enum DomainAction {
    Pipeline(PipelineAction),
    Dashboard(DashboardAction),
    Alert(AlertAction),
    Invalidate(Invalidation),
}

impl DomainAction {
    pub fn domain(&self) -> &'static str {
        match self {
            DomainAction::Pipeline(_) => "pipeline",
            DomainAction::Dashboard(_) => "dashboard",
            DomainAction::Alert(_) => "alert",
            DomainAction::Invalidate(_) => "invalidate",
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            DomainAction::Pipeline(action) => action.kind(),
            DomainAction::Dashboard(action) => action.kind(),
            DomainAction::Alert(action) => action.kind(),
            DomainAction::Invalidate(invalidation) => invalidation.kind(),
        }
    }

    /// One-line human readable description
    pub fn describe(&self) -> String {
        match self {
            DomainAction::Pipeline(action) => format!("pipeline {}", action.describe()),
            DomainAction::Dashboard(action) => format!("dashboard {}", action.describe()),
            DomainAction::Alert(action) => format!("alert {}", action.describe()),
            DomainAction::Invalidate(invalidation) => {
                format!("invalidate {}", invalidation.describe())
            }
        }
    }
}

/// Route an envelope to the interpreter for its channel
///
/// Channels without an interpreter, and payloads an interpreter does not
/// recognize, yield `None`.
pub fn interpret(envelope: &Envelope) -> Option<DomainAction> {
    let action = match envelope.channel_key().as_str() {
        PIPELINE_CHANNEL => pipeline::interpret(envelope).map(DomainAction::Pipeline),
        DASHBOARDS_CHANNEL => dashboard::interpret(envelope).map(DomainAction::Dashboard),
        ALERTS_CHANNEL => alerts::interpret(envelope).map(DomainAction::Alert),
        EVENTS_CHANNEL => events::interpret(envelope).map(DomainAction::Invalidate),
        _ => return None,
    };

    if action.is_none() {
        debug!(
            "No action for {}/{}: unrecognized payload",
            envelope.channel, envelope.event
        );
    }
    action
}

/// How a keyword is matched against a lowercased event name
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Pattern {
    /// Anywhere in the name
    Contains(&'static str),
    /// As a whole word between `.`, `_`, `-`, `:`, `/` or whitespace
    Word(&'static str),
}

impl Pattern {
    fn matches(&self, event: &str) -> bool {
        match self {
            Pattern::Contains(needle) => event.contains(needle),
            Pattern::Word(word) => event
                .split(|c: char| !c.is_alphanumeric())
                .any(|token| token == *word),
        }
    }
}

/// One row of a classification table
pub(crate) struct Rule<V> {
    pub patterns: &'static [Pattern],
    pub verb: V,
}

/// First rule with a matching pattern wins
pub(crate) fn classify<V: Copy>(event: &str, rules: &[Rule<V>], default: V) -> V {
    let event = event.to_lowercase();
    rules
        .iter()
        .find(|rule| rule.patterns.iter().any(|p| p.matches(&event)))
        .map_or(default, |rule| rule.verb)
}

pub(crate) fn as_record(value: &Value) -> Option<&Map<String, Value>> {
    value.as_object()
}

/// Non-blank string value
pub(crate) fn non_blank_str(value: Option<&Value>) -> Option<&str> {
    value
        .and_then(Value::as_str)
        .filter(|s| !s.trim().is_empty())
}

/// First non-blank string among `keys`, in order
pub(crate) fn first_string<'a>(record: &'a Map<String, Value>, keys: &[&str]) -> Option<&'a str> {
    keys.iter().find_map(|key| non_blank_str(record.get(*key)))
}

/// First non-null value among `keys`, in order
pub(crate) fn first_present<'a>(record: &'a Map<String, Value>, keys: &[&str]) -> Option<&'a Value> {
    keys.iter()
        .find_map(|key| record.get(*key).filter(|v| !v.is_null()))
}

/// Identifier from a bare string or from the first matching record field
pub(crate) fn extract_id(value: &Value, candidates: &[&str]) -> Option<String> {
    if let Some(id) = non_blank_str(Some(value)) {
        return Some(id.to_string());
    }
    as_record(value)
        .and_then(|record| first_string(record, candidates))
        .map(str::to_string)
}

/// Follow a `{key: {...}}` wrapper, if present
pub(crate) fn unwrap_key<'a>(value: &'a Value, key: &str) -> &'a Value {
    match as_record(value).and_then(|record| record.get(key)) {
        Some(inner) => unwrap_key(inner, key),
        None => value,
    }
}

/// Truthiness as loosely-typed producers use it
pub(crate) fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().map_or(false, |f| f != 0.0 && !f.is_nan()),
        Value::String(s) => !s.is_empty(),
        Value::Array(_) | Value::Object(_) => true,
    }
}

/// Whether the payload is a bulk payload for the given collection fields
pub(crate) fn is_bulk(value: &Value, fields: &[&str]) -> bool {
    match value {
        Value::Array(_) => true,
        Value::Object(record) => fields
            .iter()
            .any(|field| record.get(*field).map_or(false, is_truthy)),
        _ => false,
    }
}

/// Items of a bulk payload: the array itself, or the first array field
pub(crate) fn bulk_items<'a>(value: &'a Value, fields: &[&str]) -> Option<&'a Vec<Value>> {
    match value {
        Value::Array(items) => Some(items),
        Value::Object(record) => fields
            .iter()
            .find_map(|field| record.get(*field).and_then(Value::as_array)),
        _ => None,
    }
}

/// Number or numeric string
pub(crate) fn number_value(value: Option<&Value>) -> Option<f64> {
    let number = match value? {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    };
    number.filter(|n| n.is_finite())
}

/// Epoch milliseconds from a number, numeric string, RFC 3339 or plain date
pub(crate) fn parse_timestamp(value: Option<&Value>) -> Option<i64> {
    match value? {
        Value::Number(n) => n.as_f64().filter(|f| f.is_finite()).map(|f| f.round() as i64),
        Value::String(s) => {
            let s = s.trim();
            if let Ok(parsed) = DateTime::parse_from_rfc3339(s) {
                return Some(parsed.with_timezone(&Utc).timestamp_millis());
            }
            if let Ok(millis) = s.parse::<f64>() {
                return millis.is_finite().then(|| millis.round() as i64);
            }
            NaiveDate::parse_from_str(s, "%Y-%m-%d")
                .ok()
                .and_then(|date| date.and_hms_opt(0, 0, 0))
                .map(|dt| dt.and_utc().timestamp_millis())
        }
        _ => None,
    }
}

/// Fields of `record` not listed in `known`
pub(crate) fn extra_fields(record: &Map<String, Value>, known: &[&str]) -> Map<String, Value> {
    record
        .iter()
        .filter(|(key, _)| !known.contains(&key.as_str()))
        .map(|(key, value)| (key.clone(), value.clone()))
        .collect()
}
