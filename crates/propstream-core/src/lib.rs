//! PropStream Core Library
//!
//! Realtime synchronization core for the PropStream cockpit. This crate
//! keeps one persistent link to the realtime endpoint, routes incoming
//! messages to channel subscribers, and turns loosely-typed server events
//! into idempotent domain actions.
//!
//! # Modules
//!
//! - [`connection`] - Connection manager: lifecycle, tokens, reconnect backoff
//! - [`router`] - Channel pub/sub registry with wildcard delivery
//! - [`protocol`] - Envelope types and the tolerant frame normalizer
//! - [`interpret`] - Domain interpreters (pipeline, dashboards, alerts, events)
//! - [`sink`] - Action sink trait and stock sinks
//! - [`state`] - Reference state store applying domain actions
//! - [`transport`] - Connector trait and the WebSocket connector
//! - [`config`] - Connection options and backoff configuration
//! - [`endpoint`] - Endpoint resolution and token injection
//! - [`token`] - Access token sources
//! - [`error`] - Error types

pub mod config;
pub mod connection;
pub mod endpoint;
pub mod error;
pub mod interpret;
pub mod protocol;
pub mod router;
pub mod sink;
pub mod state;
pub mod token;
pub mod transport;

// Re-export commonly used types
pub use config::{BackoffConfig, ConnectOptions, ConnectionHooks};
pub use connection::{ConnectionHandle, ConnectionState, RealtimeClient, RealtimeClientBuilder};
pub use error::{RealtimeError, Result};
pub use interpret::{
    interpret, AlertAction, AlertItem, AlertNotifier, DashboardAction, DashboardSummary,
    DomainAction, Invalidation, Opportunity, PipelineAction, Severity, Timeframe,
};
pub use protocol::{parse, Decoded, Envelope, OutboundMessage};
pub use router::{ChannelRouter, SubscriptionHandle, WILDCARD_CHANNEL};
pub use sink::{ActionSink, ChannelSink, NoOpActionSink, StdoutActionSink};
pub use state::{StateSink, StateSummary, SyncedState};
pub use token::{TokenProvider, TokenSource};
pub use transport::{CloseInfo, Connector, Frame, Link, Outgoing, TransportEvent};

#[cfg(feature = "websocket")]
pub use transport::WebSocketConnector;
