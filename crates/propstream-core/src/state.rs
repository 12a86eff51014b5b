//! Reference state store
//!
//! [`SyncedState`] applies domain actions the way a client store would:
//! opportunities and alerts keyed by id, dashboard summaries keyed by scope.
//! Every action is idempotent, so applying the same action twice leaves the
//! collections unchanged.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::Serialize;

use crate::interpret::{
    AlertAction, AlertItem, DashboardAction, DashboardSummary, DomainAction, Invalidation,
    Opportunity, PipelineAction,
};
use crate::sink::ActionSink;

/// In-memory view of the synced domains
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SyncedState {
    pub opportunities: BTreeMap<String, Opportunity>,
    pub dashboards: BTreeMap<String, DashboardSummary>,
    pub alerts: BTreeMap<String, AlertItem>,
    /// Invalidation notices received (not idempotent; a counter)
    pub invalidations: u64,
    /// Actions applied
    pub applied: u64,
}

impl SyncedState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn apply(&mut self, action: &DomainAction) {
        self.applied += 1;
        match action {
            DomainAction::Pipeline(action) => self.apply_pipeline(action),
            DomainAction::Dashboard(action) => self.apply_dashboard(action),
            DomainAction::Alert(action) => self.apply_alert(action),
            DomainAction::Invalidate(invalidation) => self.apply_invalidation(invalidation),
        }
    }

    fn apply_pipeline(&mut self, action: &PipelineAction) {
        match action {
            PipelineAction::Upsert { opportunity } => {
                self.opportunities
                    .insert(opportunity.id.clone(), opportunity.clone());
            }
            PipelineAction::UpsertMany { opportunities } => {
                for opportunity in opportunities {
                    self.opportunities
                        .insert(opportunity.id.clone(), opportunity.clone());
                }
            }
            PipelineAction::Replace { opportunities } => {
                self.opportunities = opportunities
                    .iter()
                    .map(|o| (o.id.clone(), o.clone()))
                    .collect();
            }
            PipelineAction::Remove { id } => {
                self.opportunities.remove(id);
            }
        }
    }

    fn apply_dashboard(&mut self, action: &DashboardAction) {
        match action {
            DashboardAction::Set { summary } => {
                self.dashboards.insert(summary.scope.clone(), summary.clone());
            }
            DashboardAction::SetMany { summaries } => {
                for summary in summaries {
                    self.dashboards.insert(summary.scope.clone(), summary.clone());
                }
            }
            DashboardAction::Clear { scope: Some(scope) } => {
                self.dashboards.remove(scope);
            }
            DashboardAction::Clear { scope: None } => self.dashboards.clear(),
        }
    }

    fn apply_alert(&mut self, action: &AlertAction) {
        match action {
            AlertAction::Upsert { alert } => {
                self.alerts.insert(alert.id.clone(), alert.clone());
            }
            AlertAction::UpsertMany { alerts } => {
                for alert in alerts {
                    self.alerts.insert(alert.id.clone(), alert.clone());
                }
            }
            AlertAction::Set { alerts } => {
                self.alerts = alerts.iter().map(|a| (a.id.clone(), a.clone())).collect();
            }
            AlertAction::Remove { id } => {
                self.alerts.remove(id);
            }
            AlertAction::Clear => self.alerts.clear(),
        }
    }

    fn apply_invalidation(&mut self, _invalidation: &Invalidation) {
        self.invalidations += 1;
    }

    pub fn summary(&self) -> StateSummary {
        StateSummary {
            opportunities: self.opportunities.len(),
            dashboards: self.dashboards.len(),
            alerts: self.alerts.len(),
            invalidations: self.invalidations,
            applied: self.applied,
        }
    }
}

/// Counts for display
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct StateSummary {
    pub opportunities: usize,
    pub dashboards: usize,
    pub alerts: usize,
    pub invalidations: u64,
    pub applied: u64,
}

impl fmt::Display for StateSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} opportunities, {} dashboards, {} alerts, {} invalidations ({} actions applied)",
            self.opportunities, self.dashboards, self.alerts, self.invalidations, self.applied
        )
    }
}

/// Sink that applies every action to a shared [`SyncedState`]
#[derive(Debug, Clone, Default)]
pub struct StateSink {
    state: Arc<Mutex<SyncedState>>,
}

impl StateSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Copy of the current state
    pub fn snapshot(&self) -> SyncedState {
        self.state.lock().clone()
    }

    pub fn summary(&self) -> StateSummary {
        self.state.lock().summary()
    }
}

#[async_trait]
impl ActionSink for StateSink {
    async fn emit(&self, action: &DomainAction) -> Result<(), String> {
        self.state.lock().apply(action);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::interpret::interpret;
    use crate::protocol::Envelope;
    use serde_json::json;

    fn action(channel: &str, event: &str, payload: serde_json::Value) -> DomainAction {
        interpret(&Envelope::new(channel, event, payload)).unwrap()
    }

    #[test]
    fn test_actions_are_idempotent() {
        let actions = vec![
            action("pipeline", "snapshot", json!([{"id": "o1"}, {"id": "o2"}])),
            action("pipeline", "opportunity.updated", json!({"id": "o3", "stage": "offer"})),
            action("pipeline", "opportunity.deleted", json!({"id": "o1"})),
            action("dashboards", "summary", json!({"scope": "pf-1"})),
            action("dashboards", "dashboard.clear", json!({"scope": "pf-9"})),
            action("alerts", "alerts.set", json!([{"id": "a1"}, {"id": "a2"}])),
            action("alerts", "alert.dismissed", json!({"id": "a2"})),
        ];

        let mut once = SyncedState::new();
        let mut twice = SyncedState::new();
        for action in &actions {
            once.apply(action);
            twice.apply(action);
            twice.apply(action);
        }

        assert_eq!(once.opportunities, twice.opportunities);
        assert_eq!(once.dashboards, twice.dashboards);
        assert_eq!(once.alerts, twice.alerts);

        let ids: Vec<_> = once.opportunities.keys().cloned().collect();
        assert_eq!(ids, vec!["o2", "o3"]);
        assert_eq!(once.dashboards.len(), 1);
        assert_eq!(once.alerts.keys().collect::<Vec<_>>(), vec!["a1"]);
        assert_eq!(twice.applied, 14);
    }

    #[test]
    fn test_replace_and_clear() {
        let mut state = SyncedState::new();
        state.apply(&action("pipeline", "batch", json!({"items": [{"id": "o1"}, {"id": "o2"}]})));
        state.apply(&action("pipeline", "pipeline.reset", json!({"items": [{"id": "o9"}]})));
        assert_eq!(state.opportunities.keys().collect::<Vec<_>>(), vec!["o9"]);

        state.apply(&action("dashboards", "summaries", json!([{"scope": "a"}, {"scope": "b"}])));
        state.apply(&action("dashboards", "dashboard.reset", serde_json::Value::Null));
        assert!(state.dashboards.is_empty());

        state.apply(&action("alerts", "alert.created", json!({"id": "a1"})));
        state.apply(&action("alerts", "alerts.clear", serde_json::Value::Null));
        assert!(state.alerts.is_empty());
    }

    #[tokio::test]
    async fn test_state_sink() {
        let sink = StateSink::new();
        sink.emit(&action("events", "portfolio.changed", serde_json::Value::Null))
            .await
            .unwrap();
        sink.emit(&action("alerts", "alert.created", json!({"id": "a1"})))
            .await
            .unwrap();

        let summary = sink.summary();
        assert_eq!(summary.alerts, 1);
        assert_eq!(summary.invalidations, 1);
        assert_eq!(
            summary.to_string(),
            "0 opportunities, 0 dashboards, 1 alerts, 1 invalidations (2 actions applied)"
        );
        assert_eq!(sink.snapshot().alerts.len(), 1);
    }
}
