//! One-shot publish
//!
//! Opens a link without reconnects, queues one message, then closes the link
//! with a normal close.

use std::time::Duration;

use propstream_core::{CloseInfo, OutboundMessage, RealtimeClient};
use serde_json::Value;

use crate::EndpointArgs;

/// Time allowed for the writer to flush before closing
const FLUSH_GRACE: Duration = Duration::from_millis(200);

#[derive(clap::Args, Debug)]
pub struct SendArgs {
    #[command(flatten)]
    endpoint: EndpointArgs,

    /// Target channel
    #[arg(short, long)]
    channel: String,

    /// Event name
    #[arg(short, long)]
    event: Option<String>,

    /// JSON payload
    #[arg(short, long)]
    data: Option<String>,
}

fn build_message(args: &SendArgs) -> Result<OutboundMessage, String> {
    let mut message = OutboundMessage::new(args.channel.clone());
    if let Some(event) = &args.event {
        message = message.with_event(event.clone());
    }
    if let Some(data) = &args.data {
        let value: Value =
            serde_json::from_str(data).map_err(|e| format!("--data is not valid JSON: {e}"))?;
        message = message.with_data(value);
    }
    Ok(message)
}

pub async fn run(args: SendArgs) -> Result<(), String> {
    let message = build_message(&args)?;

    let client = RealtimeClient::websocket().build();
    let options = args.endpoint.options().with_auto_reconnect(false);
    let handle = client.connect(options).await.map_err(|e| e.to_string())?;
    tracing::info!("Connected to {}", handle.endpoint());

    let sent = client.send(&message);
    if sent {
        tokio::time::sleep(FLUSH_GRACE).await;
    }
    client.disconnect(CloseInfo::NORMAL, "cli-send");

    if sent {
        println!("sent to '{}'", message.channel);
        Ok(())
    } else {
        Err(format!("link closed before the message to '{}' was queued", message.channel))
    }
}
