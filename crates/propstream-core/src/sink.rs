//! Action Sink Trait
//!
//! This module provides the ActionSink trait for decoupling action delivery
//! from whatever consumes it. Implementations can feed a state store, write
//! to stdout (CLI), forward into a channel, or discard.

use std::panic::AssertUnwindSafe;

use async_trait::async_trait;
use futures_util::FutureExt;
use tokio::sync::mpsc;
use tracing::{error, warn};

use crate::interpret::DomainAction;

/// Receives every interpreted action, in frame order
///
/// The connection manager awaits `emit` inline in the link's reader task, so
/// a slow sink delays the next frame.
#[async_trait]
pub trait ActionSink: Send + Sync {
    async fn emit(&self, action: &DomainAction) -> Result<(), String>;
}

/// No-op sink for tests or clients that only use subscriptions
#[derive(Debug, Default, Clone)]
pub struct NoOpActionSink;

#[async_trait]
impl ActionSink for NoOpActionSink {
    async fn emit(&self, _action: &DomainAction) -> Result<(), String> {
        Ok(())
    }
}

/// Stdout sink for CLI mode - prints actions to console
#[derive(Debug, Default, Clone)]
pub struct StdoutActionSink {
    /// Whether to print in JSON format
    pub json_output: bool,
}

impl StdoutActionSink {
    pub fn new(json_output: bool) -> Self {
        Self { json_output }
    }
}

#[async_trait]
impl ActionSink for StdoutActionSink {
    async fn emit(&self, action: &DomainAction) -> Result<(), String> {
        if self.json_output {
            let line = serde_json::to_string(action).map_err(|e| e.to_string())?;
            println!(r#"{{"type":"action","action":{line}}}"#);
        } else {
            println!("[action] {}", action.describe());
        }
        Ok(())
    }
}

/// Forwards actions into a tokio channel
#[derive(Debug, Clone)]
pub struct ChannelSink {
    tx: mpsc::UnboundedSender<DomainAction>,
}

impl ChannelSink {
    pub fn new(tx: mpsc::UnboundedSender<DomainAction>) -> Self {
        Self { tx }
    }

    /// Create a sink together with its receiving end
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<DomainAction>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self::new(tx), rx)
    }
}

#[async_trait]
impl ActionSink for ChannelSink {
    async fn emit(&self, action: &DomainAction) -> Result<(), String> {
        self.tx
            .send(action.clone())
            .map_err(|_| "action receiver dropped".to_string())
    }
}

/// Emit one action, logging instead of propagating sink errors and panics
pub(crate) async fn emit_isolated(sink: &dyn ActionSink, action: &DomainAction) {
    match AssertUnwindSafe(sink.emit(action)).catch_unwind().await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => warn!("Action sink failed on {}: {}", action.describe(), e),
        Err(_) => error!("Action sink panicked on {}", action.describe()),
    }
}
