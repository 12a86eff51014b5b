//! Live watch mode
//!
//! Keeps one realtime link open, prints every interpreted action, and
//! optionally echoes raw envelopes for selected channels. New alerts are
//! surfaced once through an [`AlertNotifier`].

use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use propstream_core::{
    ActionSink, AlertNotifier, BackoffConfig, CloseInfo, ConnectOptions, ConnectionState,
    DomainAction, Envelope, RealtimeClient, StateSink, StdoutActionSink, SubscriptionHandle,
    WILDCARD_CHANNEL,
};
use serde_json::json;

use crate::{EndpointArgs, OutputFormat};

/// How often the watch loop checks whether reconnects gave up
const STATE_POLL: Duration = Duration::from_millis(500);

#[derive(clap::Args, Debug)]
pub struct WatchArgs {
    #[command(flatten)]
    endpoint: EndpointArgs,

    /// Echo raw envelopes for this channel; repeatable
    #[arg(short, long = "channel", default_value = WILDCARD_CHANNEL)]
    channels: Vec<String>,

    /// Only echo these event names; repeatable
    #[arg(short, long = "event")]
    events: Vec<String>,

    /// Output format: text or json
    #[arg(short, long, value_enum, default_value = "text")]
    format: OutputFormat,

    /// Stop after this many consecutive failed reconnects
    #[arg(long)]
    max_reconnect_attempts: Option<u32>,

    /// First reconnect delay in milliseconds
    #[arg(long, default_value_t = propstream_core::config::defaults::INITIAL_DELAY_MS)]
    initial_delay_ms: u64,

    /// Reconnect delay ceiling in milliseconds
    #[arg(long, default_value_t = propstream_core::config::defaults::MAX_DELAY_MS)]
    max_delay_ms: u64,

    /// Growth factor between reconnect delays
    #[arg(long, default_value_t = propstream_core::config::defaults::MULTIPLIER)]
    multiplier: f64,

    /// Send a ping every N seconds while connected
    #[arg(long)]
    heartbeat_secs: Option<u64>,

    /// Exit instead of reconnecting when the link drops
    #[arg(long)]
    no_reconnect: bool,

    /// Print a state summary on exit
    #[arg(long)]
    summary: bool,
}

impl WatchArgs {
    fn connect_options(&self) -> ConnectOptions {
        let mut options = self
            .endpoint
            .options()
            .with_auto_reconnect(!self.no_reconnect)
            .with_backoff(BackoffConfig {
                initial_delay_ms: self.initial_delay_ms,
                max_delay_ms: self.max_delay_ms,
                multiplier: self.multiplier,
            })
            .on_open(|handle| tracing::info!("Link #{} open", handle.id()))
            .on_close(|close| tracing::warn!("Link closed ({})", close))
            .on_error(|e| tracing::error!("Realtime error: {}", e));

        if let Some(max) = self.max_reconnect_attempts {
            options = options.with_max_reconnect_attempts(max);
        }
        if let Some(secs) = self.heartbeat_secs.filter(|secs| *secs > 0) {
            options = options.with_heartbeat(Duration::from_secs(secs));
        }
        options
    }
}

/// Sink that prints actions, keeps a state store, and flags new alerts
struct WatchSink {
    stdout: StdoutActionSink,
    state: StateSink,
    notifier: Mutex<AlertNotifier>,
}

impl WatchSink {
    fn new(json_output: bool, state: StateSink) -> Self {
        Self {
            stdout: StdoutActionSink::new(json_output),
            state,
            notifier: Mutex::new(AlertNotifier::new()),
        }
    }

    fn notify(&self, action: &DomainAction) {
        let DomainAction::Alert(alert_action) = action else {
            return;
        };
        let mut notifier = self.notifier.lock();
        for alert in notifier.observe(alert_action) {
            if self.stdout.json_output {
                println!("{}", json!({"type": "notification", "alert": alert}));
            } else {
                println!("[{}] {}", alert.severity, alert.title);
            }
        }
    }
}

#[async_trait]
impl ActionSink for WatchSink {
    async fn emit(&self, action: &DomainAction) -> Result<(), String> {
        self.state.emit(action).await?;
        self.stdout.emit(action).await?;
        self.notify(action);
        Ok(())
    }
}

fn print_envelope(envelope: &Envelope, json_output: bool) {
    if json_output {
        println!("{}", json!({"type": "envelope", "envelope": envelope}));
    } else {
        println!("[{}:{}] {}", envelope.channel, envelope.event, envelope.payload);
    }
}

fn echo_channels(client: &RealtimeClient, args: &WatchArgs) -> Vec<SubscriptionHandle> {
    let json_output = matches!(args.format, OutputFormat::Json);
    args.channels
        .iter()
        .map(|channel| {
            let listener = move |envelope: &Envelope| print_envelope(envelope, json_output);
            if args.events.is_empty() {
                client.subscribe(channel, listener)
            } else {
                client.subscribe_filtered(channel, &args.events, listener)
            }
        })
        .collect()
}

pub async fn run(args: WatchArgs) -> Result<(), String> {
    let state = StateSink::new();
    let json_output = matches!(args.format, OutputFormat::Json);

    let client = RealtimeClient::websocket()
        .sink(WatchSink::new(json_output, state.clone()))
        .build();
    let subscriptions = echo_channels(&client, &args);

    let handle = client
        .connect(args.connect_options())
        .await
        .map_err(|e| e.to_string())?;
    tracing::info!("Watching {} (Ctrl-C to stop)", handle.endpoint());

    let mut poll = tokio::time::interval(STATE_POLL);
    let outcome = loop {
        tokio::select! {
            signal = tokio::signal::ctrl_c() => {
                if let Err(e) = signal {
                    tracing::warn!("Failed to listen for Ctrl-C: {}", e);
                }
                client.disconnect(CloseInfo::NORMAL, "cli-exit");
                break Ok(());
            }
            _ = poll.tick() => {
                if client.state() == ConnectionState::Disconnected {
                    break Err("realtime link lost".to_string());
                }
            }
        }
    };

    for subscription in &subscriptions {
        subscription.unsubscribe();
    }
    if args.summary {
        let summary = state.summary();
        if json_output {
            println!("{}", json!({"type": "summary", "summary": summary}));
        } else {
            println!("{summary}");
        }
    }
    outcome
}
