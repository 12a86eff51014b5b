//! Pipeline interpreter
//!
//! Opportunities are keyed by id. Bulk payloads either replace the whole
//! pipeline (snapshot style events) or upsert each entry.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use super::{
    as_record, bulk_items, classify, extra_fields, extract_id, first_string, is_bulk,
    non_blank_str, number_value, unwrap_key, Pattern, Rule,
};
use crate::protocol::Envelope;

/// Stage assigned to opportunities that do not report one
pub const DEFAULT_STAGE: &str = "unassigned";

const ID_FIELDS: &[&str] = &["id", "opportunityId", "key", "uid", "identifier"];
const BULK_FIELDS: &[&str] = &["opportunities", "items"];
const WRAPPER: &str = "opportunity";

const KNOWN_FIELDS: &[&str] = &[
    "id",
    "name",
    "stage",
    "region",
    "createdAt",
    "updatedAt",
    "valuation",
    "probability",
    "metadata",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BulkVerb {
    Replace,
    UpsertMany,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SingleVerb {
    Remove,
    Upsert,
}

const BULK_RULES: &[Rule<BulkVerb>] = &[Rule {
    patterns: &[
        Pattern::Contains("snapshot"),
        Pattern::Contains("replace"),
        Pattern::Contains("reset"),
        Pattern::Word("set"),
    ],
    verb: BulkVerb::Replace,
}];

const SINGLE_RULES: &[Rule<SingleVerb>] = &[Rule {
    patterns: &[
        Pattern::Contains("delete"),
        Pattern::Contains("remove"),
        Pattern::Contains("close"),
        Pattern::Contains("archive"),
    ],
    verb: SingleVerb::Remove,
}];

/// A pipeline opportunity as reported by the server
///
/// Unknown fields are preserved in `extra`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Opportunity {
    pub id: String,
    pub name: String,
    pub stage: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub region: Option<String>,
    pub created_at: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub valuation: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub probability: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Map<String, Value>>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Opportunity {
    /// Build from a loosely-typed record; `None` when no id can be found
    pub fn from_value(value: &Value, envelope: &Envelope) -> Option<Self> {
        let value = unwrap_key(value, WRAPPER);
        let record = as_record(value)?;
        let id = extract_id(value, ID_FIELDS)?;

        let name = first_string(record, &["name", "title"])
            .map(str::to_string)
            .unwrap_or_else(|| id.clone());
        let stage = first_string(record, &["stage", "status", "phase"])
            .unwrap_or(DEFAULT_STAGE)
            .to_string();
        let created_at = first_string(record, &["createdAt", "timestamp"])
            .map(str::to_string)
            .unwrap_or_else(|| envelope.received_at.to_rfc3339());

        Some(Self {
            name,
            stage,
            region: non_blank_str(record.get("region")).map(str::to_string),
            created_at,
            updated_at: non_blank_str(record.get("updatedAt")).map(str::to_string),
            valuation: number_value(record.get("valuation")),
            probability: number_value(record.get("probability")),
            metadata: record.get("metadata").and_then(Value::as_object).cloned(),
            extra: extra_fields(record, KNOWN_FIELDS),
            id,
        })
    }
}

/// Pipeline mutation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum PipelineAction {
    Upsert { opportunity: Opportunity },
    UpsertMany { opportunities: Vec<Opportunity> },
    Replace { opportunities: Vec<Opportunity> },
    Remove { id: String },
}

impl PipelineAction {
    pub fn kind(&self) -> &'static str {
        match self {
            PipelineAction::Upsert { .. } => "upsert",
            PipelineAction::UpsertMany { .. } => "upsertMany",
            PipelineAction::Replace { .. } => "replace",
            PipelineAction::Remove { .. } => "remove",
        }
    }

    pub fn describe(&self) -> String {
        match self {
            PipelineAction::Upsert { opportunity } => {
                format!("upsert {} ({})", opportunity.id, opportunity.stage)
            }
            PipelineAction::UpsertMany { opportunities } => {
                format!("upsertMany {} opportunities", opportunities.len())
            }
            PipelineAction::Replace { opportunities } => {
                format!("replace {} opportunities", opportunities.len())
            }
            PipelineAction::Remove { id } => format!("remove {id}"),
        }
    }
}

/// Classify a `pipeline` envelope
pub fn interpret(envelope: &Envelope) -> Option<PipelineAction> {
    let payload = &envelope.payload;

    if is_bulk(payload, BULK_FIELDS) {
        let opportunities: Vec<Opportunity> = bulk_items(payload, BULK_FIELDS)?
            .iter()
            .filter_map(|item| Opportunity::from_value(item, envelope))
            .collect();
        if opportunities.is_empty() {
            return None;
        }
        return Some(match classify(&envelope.event, BULK_RULES, BulkVerb::UpsertMany) {
            BulkVerb::Replace => PipelineAction::Replace { opportunities },
            BulkVerb::UpsertMany => PipelineAction::UpsertMany { opportunities },
        });
    }

    match classify(&envelope.event, SINGLE_RULES, SingleVerb::Upsert) {
        SingleVerb::Remove => {
            extract_id(unwrap_key(payload, WRAPPER), ID_FIELDS).map(|id| PipelineAction::Remove { id })
        }
        SingleVerb::Upsert => {
            Opportunity::from_value(payload, envelope).map(|opportunity| PipelineAction::Upsert { opportunity })
        }
    }
}
