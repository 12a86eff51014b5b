//! Connection configuration
//!
//! [`ConnectOptions`] collects everything a `connect` call recognizes, with
//! defaults from [`defaults`]. Collaborator hooks live in
//! [`ConnectionHooks`].

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::connection::ConnectionHandle;
use crate::error::RealtimeError;
use crate::token::TokenSource;
use crate::transport::CloseInfo;

/// Default configuration values
pub mod defaults {
    /// Delay before the first reconnect attempt (milliseconds)
    pub const INITIAL_DELAY_MS: u64 = 1000;

    /// Upper bound for any reconnect delay (milliseconds)
    pub const MAX_DELAY_MS: u64 = 15_000;

    /// Growth factor between consecutive reconnect delays
    pub const MULTIPLIER: f64 = 1.8;

    /// Whether dropped links reconnect automatically
    pub const AUTO_RECONNECT: bool = true;
}

/// Exponential backoff parameters
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct BackoffConfig {
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
    pub multiplier: f64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial_delay_ms: defaults::INITIAL_DELAY_MS,
            max_delay_ms: defaults::MAX_DELAY_MS,
            multiplier: defaults::MULTIPLIER,
        }
    }
}

impl BackoffConfig {
    /// Delay before reconnect attempt `attempt` (1-based)
    ///
    /// `min(initial * multiplier^(attempt - 1), max)`
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(i32::MAX as u32) as i32;
        let raw = self.initial_delay_ms as f64 * self.multiplier.powi(exponent);
        let max = self.max_delay_ms as f64;
        let millis = if raw.is_finite() { raw.min(max) } else { max };
        Duration::from_millis(millis.max(0.0).round() as u64)
    }

    pub fn initial_delay(&self) -> Duration {
        Duration::from_millis(self.initial_delay_ms)
    }

    pub fn max_delay(&self) -> Duration {
        Duration::from_millis(self.max_delay_ms)
    }
}

pub type OpenHook = Arc<dyn Fn(&ConnectionHandle) + Send + Sync>;
pub type CloseHook = Arc<dyn Fn(&CloseInfo) + Send + Sync>;
pub type ErrorHook = Arc<dyn Fn(&RealtimeError) + Send + Sync>;

/// Lifecycle callbacks supplied by the collaborator
#[derive(Clone, Default)]
pub struct ConnectionHooks {
    pub on_open: Option<OpenHook>,
    pub on_close: Option<CloseHook>,
    pub on_error: Option<ErrorHook>,
}

impl fmt::Debug for ConnectionHooks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionHooks")
            .field("on_open", &self.on_open.is_some())
            .field("on_close", &self.on_close.is_some())
            .field("on_error", &self.on_error.is_some())
            .finish()
    }
}

/// Options recognized by `connect`
#[derive(Debug, Clone)]
pub struct ConnectOptions {
    /// Explicit endpoint; wins over every other source
    pub url: Option<String>,
    /// Application origin used to derive an endpoint (e.g. `https://app.example.com`)
    pub origin: Option<String>,
    pub token: TokenSource,
    pub protocols: Vec<String>,
    pub auto_reconnect: bool,
    /// Stop scheduling reconnects after this many consecutive attempts
    pub max_reconnect_attempts: Option<u32>,
    pub backoff: BackoffConfig,
    /// Send an application-level ping at this interval while open; zero disables it
    pub heartbeat_interval: Option<Duration>,
    pub hooks: ConnectionHooks,
}

impl Default for ConnectOptions {
    fn default() -> Self {
        Self {
            url: None,
            origin: None,
            token: TokenSource::None,
            protocols: Vec::new(),
            auto_reconnect: defaults::AUTO_RECONNECT,
            max_reconnect_attempts: None,
            backoff: BackoffConfig::default(),
            heartbeat_interval: None,
            hooks: ConnectionHooks::default(),
        }
    }
}

impl ConnectOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_url(mut self, url: impl Into<String>) -> Self {
        self.url = Some(url.into());
        self
    }

    pub fn with_origin(mut self, origin: impl Into<String>) -> Self {
        self.origin = Some(origin.into());
        self
    }

    pub fn with_token(mut self, token: TokenSource) -> Self {
        self.token = token;
        self
    }

    pub fn with_protocols<I, S>(mut self, protocols: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.protocols = protocols.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_auto_reconnect(mut self, enabled: bool) -> Self {
        self.auto_reconnect = enabled;
        self
    }

    pub fn with_max_reconnect_attempts(mut self, attempts: u32) -> Self {
        self.max_reconnect_attempts = Some(attempts);
        self
    }

    pub fn with_backoff(mut self, backoff: BackoffConfig) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn with_heartbeat(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = Some(interval);
        self
    }

    pub fn on_open<F>(mut self, hook: F) -> Self
    where
        F: Fn(&ConnectionHandle) + Send + Sync + 'static,
    {
        self.hooks.on_open = Some(Arc::new(hook));
        self
    }

    pub fn on_close<F>(mut self, hook: F) -> Self
    where
        F: Fn(&CloseInfo) + Send + Sync + 'static,
    {
        self.hooks.on_close = Some(Arc::new(hook));
        self
    }

    pub fn on_error<F>(mut self, hook: F) -> Self
    where
        F: Fn(&RealtimeError) + Send + Sync + 'static,
    {
        self.hooks.on_error = Some(Arc::new(hook));
        self
    }
}
