//! Dashboard interpreter
//!
//! Dashboard summaries are keyed by scope (a portfolio, a region, `global`).

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use super::{
    as_record, bulk_items, classify, extra_fields, first_string, is_bulk, non_blank_str,
    unwrap_key, Pattern, Rule,
};
use crate::protocol::Envelope;

const SCOPE_FIELDS: &[&str] = &["scope", "id", "key", "portfolioId"];
const BULK_FIELDS: &[&str] = &["items"];
const WRAPPER: &str = "summary";

const KNOWN_FIELDS: &[&str] = &[
    "scope",
    "timeframe",
    "updatedAt",
    "metrics",
    "breakdowns",
    "highlights",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Verb {
    Clear,
    Set,
}

const RULES: &[Rule<Verb>] = &[Rule {
    patterns: &[
        Pattern::Contains("clear"),
        Pattern::Contains("reset"),
        Pattern::Contains("remove"),
    ],
    verb: Verb::Clear,
}];

/// Reporting window of a dashboard summary
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Timeframe {
    #[serde(rename = "7d")]
    Week,
    #[serde(rename = "30d")]
    Month,
    #[serde(rename = "90d")]
    Quarter,
    #[serde(rename = "180d")]
    HalfYear,
}

impl Timeframe {
    pub fn as_str(&self) -> &'static str {
        match self {
            Timeframe::Week => "7d",
            Timeframe::Month => "30d",
            Timeframe::Quarter => "90d",
            Timeframe::HalfYear => "180d",
        }
    }

    /// Accepts `7d`/`30d`/`90d`/`180d` in any case, or a bare day count
    pub fn parse(value: &Value) -> Option<Self> {
        let days = match value {
            Value::String(s) => {
                let lowered = s.trim().to_lowercase();
                let days = lowered.strip_suffix('d').unwrap_or(lowered.as_str()).trim();
                days.parse::<f64>().ok()?
            }
            Value::Number(n) => n.as_f64()?,
            _ => return None,
        };
        [
            (7.0, Timeframe::Week),
            (30.0, Timeframe::Month),
            (90.0, Timeframe::Quarter),
            (180.0, Timeframe::HalfYear),
        ]
        .into_iter()
        .find(|(count, _)| *count == days)
        .map(|(_, timeframe)| timeframe)
    }
}

impl fmt::Display for Timeframe {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Aggregated dashboard figures for one scope
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DashboardSummary {
    pub scope: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timeframe: Option<Timeframe>,
    pub updated_at: String,
    pub metrics: Vec<Value>,
    pub breakdowns: Vec<Value>,
    pub highlights: Vec<Value>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl DashboardSummary {
    /// Build from a loosely-typed record; `None` when no scope can be found
    pub fn from_value(value: &Value, envelope: &Envelope) -> Option<Self> {
        let value = unwrap_key(value, WRAPPER);
        let record = as_record(value)?;
        let scope = extract_scope(value)?;

        let updated_at = first_string(record, &["updatedAt", "refreshedAt"])
            .map(str::to_string)
            .unwrap_or_else(|| envelope.received_at.to_rfc3339());
        let list = |key: &str| {
            record
                .get(key)
                .and_then(Value::as_array)
                .cloned()
                .unwrap_or_default()
        };

        Some(Self {
            scope,
            timeframe: record.get("timeframe").and_then(Timeframe::parse),
            updated_at,
            metrics: list("metrics"),
            breakdowns: list("breakdowns"),
            highlights: list("highlights"),
            extra: extra_fields(record, KNOWN_FIELDS),
        })
    }
}

/// Dashboard mutation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum DashboardAction {
    Set {
        summary: DashboardSummary,
    },
    SetMany {
        summaries: Vec<DashboardSummary>,
    },
    /// Clear one scope, or every scope when `scope` is absent
    Clear {
        #[serde(skip_serializing_if = "Option::is_none")]
        scope: Option<String>,
    },
}

impl DashboardAction {
    pub fn kind(&self) -> &'static str {
        match self {
            DashboardAction::Set { .. } => "set",
            DashboardAction::SetMany { .. } => "setMany",
            DashboardAction::Clear { .. } => "clear",
        }
    }

    pub fn describe(&self) -> String {
        match self {
            DashboardAction::Set { summary } => format!("set {}", summary.scope),
            DashboardAction::SetMany { summaries } => {
                format!("setMany {} summaries", summaries.len())
            }
            DashboardAction::Clear { scope: Some(scope) } => format!("clear {scope}"),
            DashboardAction::Clear { scope: None } => "clear all".to_string(),
        }
    }
}

/// Scope from a bare string or the first matching record field
pub fn extract_scope(value: &Value) -> Option<String> {
    if let Some(scope) = non_blank_str(Some(value)) {
        return Some(scope.to_string());
    }
    as_record(value)
        .and_then(|record| first_string(record, SCOPE_FIELDS))
        .map(str::to_string)
}

/// Classify a `dashboards` envelope
pub fn interpret(envelope: &Envelope) -> Option<DashboardAction> {
    let payload = &envelope.payload;

    if is_bulk(payload, BULK_FIELDS) {
        let summaries: Vec<DashboardSummary> = bulk_items(payload, BULK_FIELDS)?
            .iter()
            .filter_map(|item| DashboardSummary::from_value(item, envelope))
            .collect();
        if summaries.is_empty() {
            return None;
        }
        return Some(DashboardAction::SetMany { summaries });
    }

    match classify(&envelope.event, RULES, Verb::Set) {
        Verb::Clear => Some(DashboardAction::Clear {
            scope: extract_scope(unwrap_key(payload, WRAPPER)),
        }),
        Verb::Set => {
            DashboardSummary::from_value(payload, envelope).map(|summary| DashboardAction::Set { summary })
        }
    }
}
