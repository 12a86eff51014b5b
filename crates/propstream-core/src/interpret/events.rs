//! Events interpreter
//!
//! The `events` channel tells clients that server-side data changed and any
//! cached reads should be refreshed.

use serde::{Deserialize, Serialize};

use super::dashboard::extract_scope;
use crate::protocol::Envelope;

/// Cached data that should be refetched
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum Invalidation {
    Pipeline,
    /// One dashboard scope, or every dashboard when `scope` is absent
    Dashboard {
        #[serde(skip_serializing_if = "Option::is_none")]
        scope: Option<String>,
    },
    Portfolio,
}

impl Invalidation {
    pub fn kind(&self) -> &'static str {
        match self {
            Invalidation::Pipeline => "pipeline",
            Invalidation::Dashboard { .. } => "dashboard",
            Invalidation::Portfolio => "portfolio",
        }
    }

    pub fn describe(&self) -> String {
        match self {
            Invalidation::Dashboard { scope: Some(scope) } => format!("dashboard {scope}"),
            Invalidation::Dashboard { scope: None } => "dashboard (all)".to_string(),
            other => other.kind().to_string(),
        }
    }
}

/// Classify an `events` envelope by its event name
pub fn interpret(envelope: &Envelope) -> Option<Invalidation> {
    let event = envelope.event_key();

    if event.contains("pipeline") {
        Some(Invalidation::Pipeline)
    } else if event.contains("dashboard") {
        Some(Invalidation::Dashboard {
            scope: extract_scope(&envelope.payload),
        })
    } else if event.contains("portfolio") {
        Some(Invalidation::Portfolio)
    } else {
        None
    }
}
