//! Connection Manager
//!
//! [`RealtimeClient`] owns the single realtime link. It resolves the token
//! and endpoint on every attempt, shares one in-flight attempt between
//! concurrent `connect` callers, and schedules reconnects with exponential
//! backoff after the link drops.
//!
//! Each open link gets a reader task that processes frames one at a time:
//! normalize, fan out through the [`ChannelRouter`], interpret, then hand the
//! action to the [`ActionSink`]. Links carry an increasing id, and events
//! from a link that is no longer the active one are ignored.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Weak};
use std::time::Duration;

use chrono::Utc;
use futures_util::future::{BoxFuture, Shared};
use futures_util::{FutureExt, SinkExt, StreamExt};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use serde_json::json;
use tokio::sync::mpsc;
use tokio::task::{AbortHandle, JoinHandle};
use tokio::time::{Instant, Interval, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::config::ConnectOptions;
use crate::endpoint::{build_target, endpoint_from_env, origin_from_env, redact, resolve_endpoint};
use crate::error::{RealtimeError, Result};
use crate::interpret::interpret;
use crate::protocol::{self, Envelope, OutboundMessage, GLOBAL_CHANNEL};
use crate::router::{ChannelRouter, SubscriptionHandle};
use crate::sink::{emit_isolated, ActionSink, NoOpActionSink};
use crate::transport::{CloseInfo, Connector, Frame, Link, Outgoing, TransportEvent};

/// Lifecycle state of the realtime link
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    /// No link and nothing scheduled
    #[default]
    Disconnected,
    /// A caller-initiated attempt is in flight
    Connecting,
    Open,
    /// Waiting for, or running, an automatic reconnect attempt
    Reconnecting,
    /// Torn down by `disconnect`
    Closed,
}

/// Identifies one open link
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionHandle {
    id: u64,
    endpoint: String,
}

impl ConnectionHandle {
    /// Link id, increasing for every link opened by a client
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Endpoint of the link, without the token
    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }
}

type ConnectFuture = Shared<BoxFuture<'static, Result<ConnectionHandle>>>;

struct PendingAttempt {
    future: ConnectFuture,
    abort: AbortHandle,
}

struct ActiveLink {
    handle: ConnectionHandle,
    outgoing: mpsc::UnboundedSender<Outgoing>,
}

#[derive(Default)]
struct ConnectionCore {
    state: ConnectionState,
    options: Option<Arc<ConnectOptions>>,
    active: Option<ActiveLink>,
    pending: Option<PendingAttempt>,
    reconnect_timer: Option<JoinHandle<()>>,
    attempts: u32,
    manual_disconnect: bool,
    next_link_id: u64,
    /// Bumped by `disconnect`; attempts and timers from an older epoch are stale
    epoch: u64,
}

impl ConnectionCore {
    fn cancel_timer(&mut self) {
        if let Some(timer) = self.reconnect_timer.take() {
            timer.abort();
        }
    }

    fn is_active(&self, link_id: u64) -> bool {
        self.active
            .as_ref()
            .map_or(false, |active| active.handle.id == link_id)
    }
}

impl Drop for ConnectionCore {
    fn drop(&mut self) {
        self.cancel_timer();
        if let Some(pending) = self.pending.take() {
            pending.abort.abort();
        }
    }
}

struct Inner {
    connector: Arc<dyn Connector>,
    router: ChannelRouter,
    sink: RwLock<Arc<dyn ActionSink>>,
    core: Mutex<ConnectionCore>,
}

/// Builder for [`RealtimeClient`]
pub struct RealtimeClientBuilder {
    connector: Arc<dyn Connector>,
    router: Option<ChannelRouter>,
    sink: Option<Arc<dyn ActionSink>>,
}

impl RealtimeClientBuilder {
    /// Use an existing router, e.g. one shared with other components
    pub fn router(mut self, router: ChannelRouter) -> Self {
        self.router = Some(router);
        self
    }

    pub fn sink(mut self, sink: impl ActionSink + 'static) -> Self {
        self.sink = Some(Arc::new(sink));
        self
    }

    pub fn shared_sink(mut self, sink: Arc<dyn ActionSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    pub fn build(self) -> RealtimeClient {
        RealtimeClient {
            inner: Arc::new(Inner {
                connector: self.connector,
                router: self.router.unwrap_or_default(),
                sink: RwLock::new(self.sink.unwrap_or_else(|| Arc::new(NoOpActionSink))),
                core: Mutex::new(ConnectionCore::default()),
            }),
        }
    }
}

/// Realtime connection manager
///
/// Cheap to clone; clones share the same link, router and sink.
#[derive(Clone)]
pub struct RealtimeClient {
    inner: Arc<Inner>,
}

impl RealtimeClient {
    pub fn builder(connector: impl Connector) -> RealtimeClientBuilder {
        RealtimeClientBuilder {
            connector: Arc::new(connector),
            router: None,
            sink: None,
        }
    }

    /// Client with a fresh router and a no-op sink
    pub fn new(connector: impl Connector) -> Self {
        Self::builder(connector).build()
    }

    /// Client backed by the WebSocket connector
    #[cfg(feature = "websocket")]
    pub fn websocket() -> RealtimeClientBuilder {
        Self::builder(crate::transport::WebSocketConnector::new())
    }

    /// Open the link, or join the one that is open or opening
    ///
    /// Clears the manual-disconnect flag and cancels any pending reconnect
    /// timer. When a link is already open or an attempt is in flight, the new
    /// options are ignored.
    pub async fn connect(&self, options: ConnectOptions) -> Result<ConnectionHandle> {
        let attempt = {
            let mut core = self.inner.core.lock();
            core.manual_disconnect = false;
            core.cancel_timer();

            if let Some(active) = &core.active {
                return Ok(active.handle.clone());
            }

            let in_flight = core.pending.as_ref().map(|pending| pending.future.clone());
            match in_flight {
                Some(future) => future,
                None => {
                    let options = Arc::new(options);
                    core.options = Some(options.clone());
                    core.state = ConnectionState::Connecting;
                    self.inner.start_attempt(&mut core, options)
                }
            }
        };
        attempt.await
    }

    /// Tear down the link and stop reconnecting
    ///
    /// Sends a close frame with `code` (1000 when `None`) and `reason` on the
    /// open link, abandons any in-flight attempt, and cancels the reconnect
    /// timer. Safe to call repeatedly, and before any `connect`.
    pub fn disconnect(&self, code: impl Into<Option<u16>>, reason: impl Into<String>) {
        let close = CloseInfo::new(code.into().unwrap_or(CloseInfo::NORMAL), reason);

        let mut core = self.inner.core.lock();
        core.manual_disconnect = true;
        core.cancel_timer();
        if let Some(pending) = core.pending.take() {
            debug!("Abandoning in-flight connect attempt");
            pending.abort.abort();
        }
        core.epoch += 1;
        core.attempts = 0;
        core.state = ConnectionState::Closed;

        if let Some(active) = core.active.take() {
            info!("Closing realtime link #{} ({})", active.handle.id, close);
            if active.outgoing.send(Outgoing::Close(close)).is_err() {
                debug!("Link #{} already finished", active.handle.id);
            }
        }
    }

    /// True only while a link is open
    pub fn is_connected(&self) -> bool {
        let core = self.inner.core.lock();
        core.state == ConnectionState::Open && core.active.is_some()
    }

    pub fn state(&self) -> ConnectionState {
        self.inner.core.lock().state
    }

    /// Handle of the open link, if any
    pub fn handle(&self) -> Option<ConnectionHandle> {
        self.inner
            .core
            .lock()
            .active
            .as_ref()
            .map(|active| active.handle.clone())
    }

    /// Queue a message on the open link
    ///
    /// Returns `false` when no link is open or the message cannot be encoded.
    pub fn send(&self, message: &OutboundMessage) -> bool {
        let frame = match message.to_frame() {
            Ok(frame) => frame,
            Err(e) => {
                warn!("Failed to encode message for '{}': {}", message.channel, e);
                return false;
            }
        };

        let core = self.inner.core.lock();
        match &core.active {
            Some(active) if core.state == ConnectionState::Open => {
                active.outgoing.send(Outgoing::Frame(frame)).is_ok()
            }
            _ => false,
        }
    }

    pub fn router(&self) -> &ChannelRouter {
        &self.inner.router
    }

    pub fn subscribe<F>(&self, channel: &str, listener: F) -> SubscriptionHandle
    where
        F: Fn(&Envelope) + Send + Sync + 'static,
    {
        self.inner.router.subscribe(channel, listener)
    }

    pub fn subscribe_filtered<I, S, F>(&self, channel: &str, events: I, listener: F) -> SubscriptionHandle
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
        F: Fn(&Envelope) + Send + Sync + 'static,
    {
        self.inner.router.subscribe_filtered(channel, events, listener)
    }

    pub fn subscribe_all<F>(&self, listener: F) -> SubscriptionHandle
    where
        F: Fn(&Envelope) + Send + Sync + 'static,
    {
        self.inner.router.subscribe_all(listener)
    }

    pub fn subscribe_all_filtered<I, S, F>(&self, events: I, listener: F) -> SubscriptionHandle
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
        F: Fn(&Envelope) + Send + Sync + 'static,
    {
        self.inner.router.subscribe_all_filtered(events, listener)
    }

    pub fn subscribe_alerts<F>(&self, listener: F) -> SubscriptionHandle
    where
        F: Fn(&Envelope) + Send + Sync + 'static,
    {
        self.inner.router.subscribe_alerts(listener)
    }

    pub fn subscribe_alerts_filtered<I, S, F>(&self, events: I, listener: F) -> SubscriptionHandle
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
        F: Fn(&Envelope) + Send + Sync + 'static,
    {
        self.inner.router.subscribe_alerts_filtered(events, listener)
    }

    pub fn subscribe_events<F>(&self, listener: F) -> SubscriptionHandle
    where
        F: Fn(&Envelope) + Send + Sync + 'static,
    {
        self.inner.router.subscribe_events(listener)
    }

    pub fn subscribe_events_filtered<I, S, F>(&self, events: I, listener: F) -> SubscriptionHandle
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
        F: Fn(&Envelope) + Send + Sync + 'static,
    {
        self.inner.router.subscribe_events_filtered(events, listener)
    }

    /// Replace the action sink; takes effect from the next action
    pub fn set_sink(&self, sink: impl ActionSink + 'static) {
        self.set_shared_sink(Arc::new(sink));
    }

    pub fn set_shared_sink(&self, sink: Arc<dyn ActionSink>) {
        *self.inner.sink.write() = sink;
    }

    /// Drop the registered sink; actions are discarded until a new one is set
    pub fn clear_sink(&self) {
        self.set_shared_sink(Arc::new(NoOpActionSink));
    }
}

impl Inner {
    /// Spawn an attempt and record it as the in-flight one
    fn start_attempt(self: &Arc<Self>, core: &mut ConnectionCore, options: Arc<ConnectOptions>) -> ConnectFuture {
        let epoch = core.epoch;
        let task = tokio::spawn(Arc::clone(self).establish(options, epoch));
        let abort = task.abort_handle();

        let future = task
            .map(|joined| match joined {
                Ok(result) => result,
                Err(e) if e.is_cancelled() => Err(RealtimeError::Aborted),
                Err(e) => Err(RealtimeError::Internal(format!("connect task failed: {e}"))),
            })
            .boxed()
            .shared();

        core.pending = Some(PendingAttempt {
            future: future.clone(),
            abort,
        });
        future
    }

    async fn establish(self: Arc<Self>, options: Arc<ConnectOptions>, epoch: u64) -> Result<ConnectionHandle> {
        let opened = self.open_link(&options).await;

        let mut core = self.core.lock();
        if core.epoch != epoch {
            debug!("Dropping connect result superseded by disconnect");
            return Err(RealtimeError::Aborted);
        }
        core.pending = None;

        let (link, endpoint) = match opened {
            Ok(opened) => opened,
            Err(e) => {
                if core.state != ConnectionState::Reconnecting {
                    core.state = ConnectionState::Disconnected;
                }
                drop(core);
                warn!("Realtime connect failed: {}", e);
                if let Some(hook) = &options.hooks.on_error {
                    run_hook("on_error", || hook(&e));
                }
                return Err(e);
            }
        };

        core.next_link_id += 1;
        let handle = ConnectionHandle {
            id: core.next_link_id,
            endpoint,
        };
        let (outgoing_tx, outgoing_rx) = mpsc::unbounded_channel();
        core.active = Some(ActiveLink {
            handle: handle.clone(),
            outgoing: outgoing_tx,
        });
        core.state = ConnectionState::Open;
        core.attempts = 0;
        drop(core);

        info!("Realtime link #{} open: {}", handle.id, handle.endpoint);
        tokio::spawn(drive(
            Arc::downgrade(&self),
            link,
            outgoing_rx,
            handle.id,
            options.heartbeat_interval,
        ));

        if let Some(hook) = &options.hooks.on_open {
            run_hook("on_open", || hook(&handle));
        }
        Ok(handle)
    }

    async fn open_link(&self, options: &ConnectOptions) -> Result<(Link, String)> {
        let token = options.token.resolve().await?;

        let env_endpoint = endpoint_from_env();
        let origin = options.origin.clone().or_else(origin_from_env);
        let endpoint = resolve_endpoint(
            options.url.as_deref(),
            env_endpoint.as_deref(),
            origin.as_deref(),
        );
        let target = build_target(&endpoint, origin.as_deref(), token.as_deref())?;
        let redacted = redact(&target);

        debug!("Opening realtime link to {}", redacted);
        let link = self.connector.open(&target, &options.protocols).await?;
        Ok((link, redacted))
    }

    async fn handle_frame(&self, link_id: u64, frame: &Frame) {
        if !self.core.lock().is_active(link_id) {
            debug!("Ignoring frame from superseded link #{}", link_id);
            return;
        }

        let decoded = protocol::parse(frame);
        if !decoded.is_recognized() {
            debug!("Unstructured frame routed to '{}'", GLOBAL_CHANNEL);
        }
        let envelope = decoded.into_envelope();

        self.router.publish(&envelope);

        if let Some(action) = interpret(&envelope) {
            let sink = self.sink.read().clone();
            emit_isolated(sink.as_ref(), &action).await;
        }
    }

    fn handle_closed(self: &Arc<Self>, link_id: u64, close: CloseInfo) {
        let hooks = {
            let mut core = self.core.lock();
            if !core.is_active(link_id) {
                debug!("Ignoring close of superseded link #{} ({})", link_id, close);
                return;
            }
            core.active = None;

            let options = core.options.clone();
            let auto_reconnect = options.as_ref().map_or(false, |o| o.auto_reconnect);
            if !core.manual_disconnect && auto_reconnect {
                self.schedule_reconnect(&mut core);
            } else {
                core.state = ConnectionState::Disconnected;
            }
            options.map(|o| o.hooks.clone())
        };

        info!("Realtime link #{} closed: {}", link_id, close);
        if let Some(hook) = hooks.as_ref().and_then(|h| h.on_close.as_ref()) {
            run_hook("on_close", || hook(&close));
        }
    }

    /// Arm the reconnect timer for the next attempt, unless capped
    fn schedule_reconnect(self: &Arc<Self>, core: &mut ConnectionCore) {
        if core.manual_disconnect {
            return;
        }
        let Some(options) = core.options.clone() else {
            return;
        };

        if let Some(max) = options.max_reconnect_attempts {
            if core.attempts >= max {
                warn!("Giving up after {} reconnect attempts", core.attempts);
                core.state = ConnectionState::Disconnected;
                return;
            }
        }

        let attempt = core.attempts.saturating_add(1);
        let delay = options.backoff.delay_for(attempt);
        core.attempts = attempt;
        core.state = ConnectionState::Reconnecting;

        info!(
            "Reconnecting in {}ms (attempt {})",
            delay.as_millis(),
            attempt
        );

        let epoch = core.epoch;
        let inner = Arc::downgrade(self);
        core.cancel_timer();
        core.reconnect_timer = Some(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if let Some(inner) = inner.upgrade() {
                inner.reconnect(epoch).await;
            }
        }));
    }

    async fn reconnect(self: Arc<Self>, epoch: u64) {
        let attempt = {
            let mut core = self.core.lock();
            // The timer is this task; forget it without aborting.
            core.reconnect_timer = None;
            if core.manual_disconnect || core.epoch != epoch || core.active.is_some() {
                return;
            }
            let in_flight = core.pending.as_ref().map(|pending| pending.future.clone());
            match in_flight {
                Some(future) => future,
                None => {
                    let Some(options) = core.options.clone() else {
                        return;
                    };
                    self.start_attempt(&mut core, options)
                }
            }
        };

        match attempt.await {
            Ok(handle) => info!("Reconnected as link #{}", handle.id),
            Err(RealtimeError::Aborted) => {}
            Err(e) => {
                debug!("Reconnect attempt failed: {}", e);
                let mut core = self.core.lock();
                if core.epoch == epoch && core.active.is_none() && core.pending.is_none() {
                    self.schedule_reconnect(&mut core);
                }
            }
        }
    }
}

/// Reader task for one link
///
/// Runs until the peer closes, the transport fails, or `disconnect` sends a
/// close command, then reports the close to the manager.
async fn drive(
    inner: Weak<Inner>,
    link: Link,
    mut outgoing: mpsc::UnboundedReceiver<Outgoing>,
    link_id: u64,
    heartbeat: Option<Duration>,
) {
    let Link { mut sink, mut events } = link;
    // A zero period means no heartbeat
    let mut heartbeat = heartbeat.filter(|period| !period.is_zero()).map(|period| {
        let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker
    });
    let mut closed_by_us = false;

    let close = loop {
        tokio::select! {
            event = events.next() => match event {
                Some(Ok(TransportEvent::Frame(frame))) => {
                    let Some(inner) = inner.upgrade() else {
                        break CloseInfo::abnormal();
                    };
                    inner.handle_frame(link_id, &frame).await;
                }
                Some(Ok(TransportEvent::Closed(info))) => break info,
                Some(Err(e)) => {
                    warn!("Realtime link #{} failed: {}", link_id, e);
                    break CloseInfo::new(CloseInfo::ABNORMAL, e.to_string());
                }
                None => break CloseInfo::abnormal(),
            },
            command = outgoing.recv() => match command {
                Some(Outgoing::Close(info)) => {
                    if let Err(e) = sink.send(Outgoing::Close(info.clone())).await {
                        debug!("Close frame not delivered on link #{}: {}", link_id, e);
                    }
                    closed_by_us = true;
                    break info;
                }
                Some(command) => {
                    if let Err(e) = sink.send(command).await {
                        warn!("Write failed on link #{}: {}", link_id, e);
                        break CloseInfo::new(CloseInfo::ABNORMAL, e.to_string());
                    }
                }
                // Client dropped
                None => {
                    closed_by_us = true;
                    break CloseInfo::normal("");
                }
            },
            _ = next_tick(&mut heartbeat) => {
                match ping_message().to_frame() {
                    Ok(frame) => {
                        if let Err(e) = sink.send(Outgoing::Frame(frame)).await {
                            warn!("Heartbeat failed on link #{}: {}", link_id, e);
                            break CloseInfo::new(CloseInfo::ABNORMAL, e.to_string());
                        }
                    }
                    Err(e) => error!("Failed to encode heartbeat: {}", e),
                }
            }
        }
    };

    if let Err(e) = sink.close().await {
        debug!("Closing link #{} sink: {}", link_id, e);
    }

    if closed_by_us {
        debug!("Link #{} closed locally ({})", link_id, close);
    }
    if let Some(inner) = inner.upgrade() {
        inner.handle_closed(link_id, close);
    }
}

async fn next_tick(heartbeat: &mut Option<Interval>) {
    match heartbeat {
        Some(ticker) => {
            ticker.tick().await;
        }
        None => std::future::pending::<()>().await,
    }
}

fn ping_message() -> OutboundMessage {
    OutboundMessage::new(GLOBAL_CHANNEL)
        .with_event("ping")
        .with_data(json!({ "timestamp": Utc::now().timestamp_millis() }))
}

fn run_hook(name: &str, hook: impl FnOnce()) {
    if catch_unwind(AssertUnwindSafe(hook)).is_err() {
        error!("Connection {} hook panicked", name);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BackoffConfig;
    use crate::interpret::DomainAction;
    use crate::sink::ChannelSink;
    use crate::token::TokenSource;
    use crate::transport::EventStream;
    use async_trait::async_trait;
    use futures_util::{sink, stream};
    use serde_json::Value;
    use std::collections::VecDeque;
    use url::Url;

    const URL: &str = "ws://test.local/realtime";

    #[derive(Debug, Clone, Copy, PartialEq)]
    enum Behavior {
        Accept,
        Refuse,
    }

    /// Server side of an in-memory link
    struct ServerLink {
        events: mpsc::UnboundedSender<Result<TransportEvent>>,
        received: mpsc::UnboundedReceiver<Outgoing>,
    }

    impl ServerLink {
        fn push_text(&self, text: &str) {
            self.events
                .send(Ok(TransportEvent::Frame(Frame::Text(text.to_string()))))
                .unwrap();
        }

        fn close(&self, code: u16) {
            let _ = self
                .events
                .send(Ok(TransportEvent::Closed(CloseInfo::new(code, "server"))));
        }
    }

    #[derive(Default)]
    struct MockState {
        script: VecDeque<Behavior>,
        opened: Vec<(Url, Instant)>,
        links: Vec<Option<ServerLink>>,
    }

    #[derive(Clone, Default)]
    struct MockConnector {
        state: Arc<Mutex<MockState>>,
    }

    impl MockConnector {
        fn scripted(behaviors: &[Behavior]) -> Self {
            let connector = Self::default();
            connector.state.lock().script = behaviors.iter().copied().collect();
            connector
        }

        fn open_count(&self) -> usize {
            self.state.lock().opened.len()
        }

        fn opened_url(&self, index: usize) -> String {
            self.state.lock().opened[index].0.to_string()
        }

        fn opened_at(&self, index: usize) -> Instant {
            self.state.lock().opened[index].1
        }

        fn take_link(&self, index: usize) -> ServerLink {
            self.state.lock().links[index].take().unwrap()
        }
    }

    #[async_trait]
    impl Connector for MockConnector {
        async fn open(&self, url: &Url, _protocols: &[String]) -> Result<Link> {
            let behavior = {
                let mut state = self.state.lock();
                state.opened.push((url.clone(), Instant::now()));
                state.script.pop_front().unwrap_or(Behavior::Accept)
            };
            if behavior == Behavior::Refuse {
                self.state.lock().links.push(None);
                return Err(RealtimeError::Transport("connection refused".to_string()));
            }

            let (event_tx, event_rx) = mpsc::unbounded_channel();
            let (out_tx, out_rx) = mpsc::unbounded_channel::<Outgoing>();

            let events: EventStream = stream::unfold(event_rx, |mut rx| async move {
                rx.recv().await.map(|event| (event, rx))
            })
            .boxed();
            let sink = sink::unfold(out_tx, |tx, item: Outgoing| async move {
                tx.send(item)
                    .map_err(|_| RealtimeError::Transport("server gone".to_string()))?;
                Ok::<_, RealtimeError>(tx)
            });

            self.state.lock().links.push(Some(ServerLink {
                events: event_tx,
                received: out_rx,
            }));
            Ok(Link::new(Box::pin(sink), events))
        }
    }

    fn options() -> ConnectOptions {
        ConnectOptions::new().with_url(URL)
    }

    async fn settle() {
        tokio::time::sleep(Duration::from_millis(1)).await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_appends_token() {
        let connector = MockConnector::default();
        let client = RealtimeClient::new(connector.clone());

        let handle = client
            .connect(options().with_token(TokenSource::from_static("abc")))
            .await
            .unwrap();

        assert_eq!(connector.opened_url(0), "ws://test.local/realtime?token=abc");
        assert_eq!(handle.endpoint(), URL);
        assert!(client.is_connected());
        assert_eq!(client.state(), ConnectionState::Open);
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_connects_share_one_link() {
        let connector = MockConnector::default();
        let client = RealtimeClient::new(connector.clone());

        let (a, b) = tokio::join!(client.connect(options()), client.connect(options()));
        let a = a.unwrap();
        assert_eq!(a, b.unwrap());

        let c = client.connect(options()).await.unwrap();
        assert_eq!(a, c);
        assert_eq!(connector.open_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_disconnect_before_connect() {
        let connector = MockConnector::default();
        let client = RealtimeClient::new(connector.clone());

        client.disconnect(None::<u16>, "");
        client.disconnect(None::<u16>, "");
        assert_eq!(client.state(), ConnectionState::Closed);
        assert!(!client.is_connected());

        client.connect(options()).await.unwrap();
        assert!(client.is_connected());
    }

    #[tokio::test(start_paused = true)]
    async fn test_pre_open_failure_is_not_retried() {
        let connector = MockConnector::scripted(&[Behavior::Refuse]);
        let client = RealtimeClient::new(connector.clone());
        let errors = Arc::new(Mutex::new(Vec::new()));
        let seen = errors.clone();

        let err = client
            .connect(options().on_error(move |e| seen.lock().push(e.clone())))
            .await
            .unwrap_err();
        assert!(matches!(err, RealtimeError::Transport(_)));

        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(connector.open_count(), 1);
        assert_eq!(client.state(), ConnectionState::Disconnected);
        assert_eq!(errors.lock().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_token_provider_failure() {
        let connector = MockConnector::default();
        let client = RealtimeClient::new(connector.clone());

        let token = TokenSource::from_async(|| async { Err("refresh failed".to_string()) });
        let err = client.connect(options().with_token(token)).await.unwrap_err();

        assert_eq!(err, RealtimeError::Token("refresh failed".to_string()));
        assert_eq!(connector.open_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_disconnect_abandons_in_flight_attempt() {
        let connector = MockConnector::default();
        let client = RealtimeClient::new(connector.clone());
        let slow_token = TokenSource::from_async(|| async {
            tokio::time::sleep(Duration::from_secs(10)).await;
            Ok(Some("late".to_string()))
        });

        let pending = {
            let client = client.clone();
            tokio::spawn(async move { client.connect(options().with_token(slow_token)).await })
        };
        settle().await;
        assert_eq!(client.state(), ConnectionState::Connecting);

        client.disconnect(None::<u16>, "logout");
        assert_eq!(pending.await.unwrap(), Err(RealtimeError::Aborted));

        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(connector.open_count(), 0);
        assert_eq!(client.state(), ConnectionState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_frames_flow_through_router_and_sink_in_order() {
        let connector = MockConnector::default();
        let (sink, mut actions) = ChannelSink::channel();
        let client = RealtimeClient::builder(connector.clone()).sink(sink).build();

        let events = Arc::new(Mutex::new(Vec::new()));
        let seen = events.clone();
        let _all = client.subscribe_all(move |envelope| seen.lock().push(envelope.event.clone()));

        client.connect(options()).await.unwrap();
        let server = connector.take_link(0);
        server.push_text(r#"{"channel":"pipeline","event":"opportunity.updated","data":{"id":"o1"}}"#);
        server.push_text(r#"{"channel":"Pipeline","event":"opportunity.deleted","data":{"id":"o1"}}"#);
        server.push_text("not json");

        let first = actions.recv().await.unwrap();
        let second = actions.recv().await.unwrap();
        assert_eq!(first.describe(), "pipeline upsert o1 (unassigned)");
        assert_eq!(second.describe(), "pipeline remove o1");

        settle().await;
        assert_eq!(
            *events.lock(),
            vec!["opportunity.updated", "opportunity.deleted", "message"]
        );
        assert!(actions.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_sink_can_be_swapped_and_cleared() {
        let connector = MockConnector::default();
        let (first_sink, mut first) = ChannelSink::channel();
        let (second_sink, mut second) = ChannelSink::channel();
        let client = RealtimeClient::builder(connector.clone()).sink(first_sink).build();

        client.connect(options()).await.unwrap();
        let server = connector.take_link(0);
        let alert = r#"{"channel":"alerts","event":"alert.created","data":{"id":"a1"}}"#;

        server.push_text(alert);
        assert!(matches!(first.recv().await, Some(DomainAction::Alert(_))));

        client.set_sink(second_sink);
        server.push_text(alert);
        assert!(matches!(second.recv().await, Some(DomainAction::Alert(_))));

        client.clear_sink();
        server.push_text(alert);
        settle().await;
        assert!(first.try_recv().is_err());
        assert!(second.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_send() {
        let connector = MockConnector::default();
        let client = RealtimeClient::new(connector.clone());
        let message = OutboundMessage::new("pipeline").with_data(json!({"id": "o1"}));

        assert!(!client.send(&message));

        client.connect(options()).await.unwrap();
        let mut server = connector.take_link(0);
        assert!(client.send(&message));

        let Some(Outgoing::Frame(Frame::Text(body))) = server.received.recv().await else {
            panic!("expected a text frame");
        };
        let value: Value = serde_json::from_str(&body).unwrap();
        assert_eq!(
            value,
            json!({"channel": "pipeline", "event": "message", "data": {"id": "o1"}})
        );

        client.disconnect(None::<u16>, "");
        assert!(!client.send(&message));
    }

    #[tokio::test(start_paused = true)]
    async fn test_disconnect_sends_close_and_ignores_late_close() {
        let connector = MockConnector::default();
        let client = RealtimeClient::new(connector.clone());
        let closes = Arc::new(Mutex::new(0usize));
        let counter = closes.clone();

        client
            .connect(options().on_close(move |_| *counter.lock() += 1))
            .await
            .unwrap();
        let mut server = connector.take_link(0);

        client.disconnect(4000, "auth-logout");
        assert_eq!(
            server.received.recv().await,
            Some(Outgoing::Close(CloseInfo::new(4000, "auth-logout")))
        );

        server.close(1000);
        tokio::time::sleep(Duration::from_secs(60)).await;

        assert_eq!(connector.open_count(), 1);
        assert_eq!(client.state(), ConnectionState::Closed);
        assert!(!client.is_connected());
        assert_eq!(*closes.lock(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_auto_reconnect_after_drop() {
        let connector = MockConnector::default();
        let client = RealtimeClient::new(connector.clone());
        let closes = Arc::new(Mutex::new(Vec::new()));
        let seen = closes.clone();

        let first = client
            .connect(options().on_close(move |info| seen.lock().push(info.code)))
            .await
            .unwrap();

        let dropped_at = Instant::now();
        drop(connector.take_link(0));
        settle().await;
        assert_eq!(client.state(), ConnectionState::Reconnecting);
        assert_eq!(*closes.lock(), vec![CloseInfo::ABNORMAL]);

        tokio::time::sleep(Duration::from_secs(20)).await;
        assert_eq!(connector.open_count(), 2);

        let delay = connector.opened_at(1) - dropped_at;
        assert!(delay >= Duration::from_millis(1000), "{delay:?}");
        assert!(delay <= Duration::from_millis(15_000), "{delay:?}");

        let second = client.handle().unwrap();
        assert!(client.is_connected());
        assert!(second.id() > first.id());
    }

    #[tokio::test(start_paused = true)]
    async fn test_reconnect_backoff_and_attempt_cap() {
        use Behavior::*;
        let connector = MockConnector::scripted(&[Accept, Refuse, Refuse, Refuse, Refuse]);
        let client = RealtimeClient::new(connector.clone());

        client
            .connect(options().with_max_reconnect_attempts(3))
            .await
            .unwrap();
        let server = connector.take_link(0);
        server.close(1001);

        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(connector.open_count(), 4);
        assert_eq!(client.state(), ConnectionState::Disconnected);

        let gaps: Vec<u128> = (1..4)
            .map(|i| (connector.opened_at(i) - connector.opened_at(i - 1)).as_millis())
            .collect();
        // First gap includes the time from open to the server close
        assert!(gaps[0] >= 1000);
        assert_eq!(&gaps[1..], &[1800, 3240]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_attempt_counter_resets_after_open() {
        use Behavior::*;
        let connector = MockConnector::scripted(&[Accept, Refuse, Accept, Accept]);
        let client = RealtimeClient::new(connector.clone());
        let backoff = BackoffConfig {
            initial_delay_ms: 500,
            max_delay_ms: 10_000,
            multiplier: 2.0,
        };

        client.connect(options().with_backoff(backoff)).await.unwrap();
        drop(connector.take_link(0));

        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(connector.open_count(), 3);
        assert_eq!(
            (connector.opened_at(2) - connector.opened_at(1)).as_millis(),
            1000
        );

        let dropped_at = Instant::now();
        drop(connector.take_link(2));
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(connector.open_count(), 4);
        assert_eq!((connector.opened_at(3) - dropped_at).as_millis(), 500);
    }

    #[tokio::test(start_paused = true)]
    async fn test_no_reconnect_when_disabled() {
        let connector = MockConnector::default();
        let client = RealtimeClient::new(connector.clone());

        client
            .connect(options().with_auto_reconnect(false))
            .await
            .unwrap();
        connector.take_link(0).close(1011);

        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(connector.open_count(), 1);
        assert_eq!(client.state(), ConnectionState::Disconnected);
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_cancels_pending_reconnect() {
        let connector = MockConnector::default();
        let client = RealtimeClient::new(connector.clone());

        client.connect(options()).await.unwrap();
        drop(connector.take_link(0));
        settle().await;
        assert_eq!(client.state(), ConnectionState::Reconnecting);

        client.connect(options()).await.unwrap();
        assert_eq!(connector.open_count(), 2);

        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(connector.open_count(), 2);
        assert!(client.is_connected());
    }

    #[tokio::test(start_paused = true)]
    async fn test_heartbeat() {
        let connector = MockConnector::default();
        let client = RealtimeClient::new(connector.clone());

        client
            .connect(options().with_heartbeat(Duration::from_secs(30)))
            .await
            .unwrap();
        let mut server = connector.take_link(0);

        tokio::time::sleep(Duration::from_secs(31)).await;
        let Ok(Outgoing::Frame(Frame::Text(body))) = server.received.try_recv() else {
            panic!("expected a heartbeat frame");
        };
        let value: Value = serde_json::from_str(&body).unwrap();
        assert_eq!(value["channel"], "global");
        assert_eq!(value["event"], "ping");
        assert!(value["data"]["timestamp"].is_i64());
    }

    #[tokio::test(start_paused = true)]
    async fn test_zero_heartbeat_is_disabled() {
        let connector = MockConnector::default();
        let (sink, mut actions) = ChannelSink::channel();
        let client = RealtimeClient::builder(connector.clone()).sink(sink).build();

        client
            .connect(options().with_heartbeat(Duration::ZERO))
            .await
            .unwrap();
        let mut server = connector.take_link(0);
        server.push_text(r#"{"channel":"alerts","event":"alert.created","data":{"id":"a1"}}"#);

        assert!(matches!(actions.recv().await, Some(DomainAction::Alert(_))));
        tokio::time::sleep(Duration::from_secs(60)).await;
        assert!(server.received.try_recv().is_err());

        server.close(1001);
        settle().await;
        assert_eq!(client.state(), ConnectionState::Reconnecting);
    }

    #[tokio::test(start_paused = true)]
    async fn test_disconnect_cancels_pending_reconnect() {
        let connector = MockConnector::default();
        let client = RealtimeClient::new(connector.clone());

        client.connect(options()).await.unwrap();
        drop(connector.take_link(0));
        settle().await;
        assert_eq!(client.state(), ConnectionState::Reconnecting);

        client.disconnect(None::<u16>, "logout");
        tokio::time::sleep(Duration::from_secs(120)).await;

        assert_eq!(connector.open_count(), 1);
        assert_eq!(client.state(), ConnectionState::Closed);
        assert!(!client.is_connected());
    }

    #[tokio::test(start_paused = true)]
    async fn test_reconnect_uses_fresh_token() {
        let connector = MockConnector::default();
        let client = RealtimeClient::new(connector.clone());
        let issued = Arc::new(Mutex::new(0usize));
        let counter = issued.clone();
        let token = TokenSource::from_fn(move || {
            let mut count = counter.lock();
            let token = format!("token-{}", *count);
            *count += 1;
            Some(token)
        });

        client.connect(options().with_token(token)).await.unwrap();
        drop(connector.take_link(0));
        tokio::time::sleep(Duration::from_secs(20)).await;

        assert_eq!(connector.open_count(), 2);
        assert!(connector.opened_url(0).ends_with("?token=token-0"));
        assert!(connector.opened_url(1).ends_with("?token=token-1"));
        assert_eq!(*issued.lock(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_filtered_subscriptions() {
        let connector = MockConnector::default();
        let client = RealtimeClient::new(connector.clone());
        let seen = Arc::new(Mutex::new(Vec::new()));

        let log = seen.clone();
        let _alerts = client.subscribe_alerts_filtered(["alert.created"], move |envelope| {
            log.lock().push(format!("alerts:{}", envelope.event))
        });
        let log = seen.clone();
        let _events = client.subscribe_events_filtered(["pipeline.changed"], move |envelope| {
            log.lock().push(format!("events:{}", envelope.event))
        });
        let log = seen.clone();
        let _all = client.subscribe_all_filtered(["ping"], move |envelope| {
            log.lock().push(format!("all:{}", envelope.event))
        });

        client.connect(options()).await.unwrap();
        let server = connector.take_link(0);
        server.push_text(r#"{"channel":"alerts","event":"alert.created","data":{"id":"a1"}}"#);
        server.push_text(r#"{"channel":"alerts","event":"alert.dismissed","data":{"id":"a1"}}"#);
        server.push_text(r#"{"channel":"events","event":"pipeline.changed"}"#);
        server.push_text(r#"{"channel":"events","event":"portfolio.changed"}"#);
        server.push_text(r#"{"channel":"global","event":"ping"}"#);
        settle().await;

        assert_eq!(
            *seen.lock(),
            vec!["alerts:alert.created", "events:pipeline.changed", "all:ping"]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_panicking_hook_is_contained() {
        let connector = MockConnector::default();
        let client = RealtimeClient::new(connector.clone());

        let handle = client
            .connect(options().on_open(|_| panic!("hook bug")))
            .await
            .unwrap();
        assert_eq!(handle.id(), 1);
        assert!(client.is_connected());
    }
}
