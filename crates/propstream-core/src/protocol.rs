//! Realtime Protocol Types
//!
//! Envelope and outbound message types, plus the tolerant frame normalizer.
//!
//! The server does not publish a schema for its frames. The normalizer
//! accepts whatever arrives and degrades to defaults instead of failing:
//! every frame produces an [`Envelope`], tagged as [`Decoded::Recognized`]
//! when it carried a structured record and [`Decoded::Fallback`] otherwise.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::transport::Frame;

/// Channel assigned to frames that do not name one
pub const GLOBAL_CHANNEL: &str = "global";

/// Event assigned to frames that do not name one
pub const DEFAULT_EVENT: &str = "message";

/// A normalized message extracted from one transport frame
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Envelope {
    /// Logical topic, compared case-insensitively
    pub channel: String,
    /// Event name, compared case-insensitively
    pub event: String,
    /// Free-form payload
    pub payload: Value,
    /// When the frame was received
    pub received_at: DateTime<Utc>,
}

impl Envelope {
    /// Create an envelope stamped with the current time
    pub fn new(channel: impl Into<String>, event: impl Into<String>, payload: Value) -> Self {
        Self {
            channel: channel.into(),
            event: event.into(),
            payload,
            received_at: Utc::now(),
        }
    }

    /// Lowercased channel name used for routing
    pub fn channel_key(&self) -> String {
        self.channel.to_lowercase()
    }

    /// Lowercased event name used for filtering and classification
    pub fn event_key(&self) -> String {
        self.event.to_lowercase()
    }

    /// Case-insensitive channel comparison
    pub fn is_channel(&self, name: &str) -> bool {
        self.channel_key() == name.to_lowercase()
    }
}

/// Outcome of normalizing a frame
#[derive(Debug, Clone, PartialEq)]
pub enum Decoded {
    /// The frame decoded to a JSON object and its fields were read
    Recognized(Envelope),
    /// The frame was not a JSON object; defaults were applied
    Fallback(Envelope),
}

impl Decoded {
    pub fn envelope(&self) -> &Envelope {
        match self {
            Decoded::Recognized(envelope) | Decoded::Fallback(envelope) => envelope,
        }
    }

    pub fn into_envelope(self) -> Envelope {
        match self {
            Decoded::Recognized(envelope) | Decoded::Fallback(envelope) => envelope,
        }
    }

    pub fn is_recognized(&self) -> bool {
        matches!(self, Decoded::Recognized(_))
    }
}

/// Normalize a raw transport frame into an envelope
///
/// Text frames are decoded as JSON. Binary frames holding valid UTF-8 are
/// treated exactly like text; anything else becomes a fallback envelope with
/// a lossy string payload.
pub fn parse(frame: &Frame) -> Decoded {
    let received_at = Utc::now();
    match frame {
        Frame::Text(text) => decode_text(text, received_at),
        Frame::Binary(bytes) => match std::str::from_utf8(bytes) {
            Ok(text) => decode_text(text, received_at),
            Err(_) => Decoded::Fallback(Envelope {
                channel: GLOBAL_CHANNEL.to_string(),
                event: DEFAULT_EVENT.to_string(),
                payload: Value::String(String::from_utf8_lossy(bytes).into_owned()),
                received_at,
            }),
        },
    }
}

fn decode_text(text: &str, received_at: DateTime<Utc>) -> Decoded {
    let fallback = |payload: Value| {
        Decoded::Fallback(Envelope {
            channel: GLOBAL_CHANNEL.to_string(),
            event: DEFAULT_EVENT.to_string(),
            payload,
            received_at,
        })
    };

    match serde_json::from_str::<Value>(text) {
        Ok(Value::Object(record)) => Decoded::Recognized(from_record(record, received_at)),
        Ok(other) => fallback(other),
        Err(_) => fallback(Value::String(text.to_string())),
    }
}

fn from_record(mut record: Map<String, Value>, received_at: DateTime<Utc>) -> Envelope {
    let channel = non_blank(record.get("channel")).unwrap_or(GLOBAL_CHANNEL).to_string();
    let event = non_blank(record.get("event"))
        .or_else(|| non_blank(record.get("type")))
        .unwrap_or(DEFAULT_EVENT)
        .to_string();

    // Key presence decides, even when the value is null.
    let payload = if let Some(payload) = record.remove("payload") {
        payload
    } else if let Some(data) = record.remove("data") {
        data
    } else {
        Value::Object(record)
    };

    Envelope {
        channel,
        event,
        payload,
        received_at,
    }
}

fn non_blank(value: Option<&Value>) -> Option<&str> {
    value
        .and_then(Value::as_str)
        .filter(|s| !s.trim().is_empty())
}

/// A message sent to the server
#[derive(Debug, Clone, PartialEq)]
pub struct OutboundMessage {
    pub channel: String,
    pub event: Option<String>,
    pub data: Option<Value>,
}

/// Wire shape of an outbound frame
#[derive(Serialize)]
struct WireMessage<'a> {
    channel: &'a str,
    event: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    data: Option<&'a Value>,
}

impl OutboundMessage {
    pub fn new(channel: impl Into<String>) -> Self {
        Self {
            channel: channel.into(),
            event: None,
            data: None,
        }
    }

    pub fn with_event(mut self, event: impl Into<String>) -> Self {
        self.event = Some(event.into());
        self
    }

    pub fn with_data(mut self, data: Value) -> Self {
        self.data = Some(data);
        self
    }

    /// Serialize to a `{channel, event, data}` text frame
    pub fn to_frame(&self) -> serde_json::Result<Frame> {
        let wire = WireMessage {
            channel: &self.channel,
            event: self.event.as_deref().unwrap_or(DEFAULT_EVENT),
            data: self.data.as_ref(),
        };
        Ok(Frame::Text(serde_json::to_string(&wire)?))
    }
}
