//! Transport types for the realtime link
//!
//! The connection manager never touches sockets directly. It asks a
//! [`Connector`] for a [`Link`]: a sink of outgoing commands and a stream of
//! incoming transport events. The default connector speaks WebSocket through
//! `tokio-tungstenite` (feature `websocket`); tests plug in an in-memory one.

use std::fmt;
use std::pin::Pin;

use async_trait::async_trait;
use futures_util::stream::BoxStream;
use futures_util::Sink;
use serde::{Deserialize, Serialize};
use url::Url;

use crate::error::{RealtimeError, Result};

/// A data frame carried by the transport
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Text(String),
    Binary(Vec<u8>),
}

/// Close code and reason reported when a link ends
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CloseInfo {
    pub code: u16,
    pub reason: String,
}

impl CloseInfo {
    /// Normal closure
    pub const NORMAL: u16 = 1000;
    /// No status code was present in the close frame
    pub const NO_STATUS: u16 = 1005;
    /// The link dropped without a close frame
    pub const ABNORMAL: u16 = 1006;

    pub fn new(code: u16, reason: impl Into<String>) -> Self {
        Self {
            code,
            reason: reason.into(),
        }
    }

    pub fn normal(reason: impl Into<String>) -> Self {
        Self::new(Self::NORMAL, reason)
    }

    pub fn abnormal() -> Self {
        Self::new(Self::ABNORMAL, "")
    }
}

impl fmt::Display for CloseInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.reason.is_empty() {
            write!(f, "code {}", self.code)
        } else {
            write!(f, "code {} ({})", self.code, self.reason)
        }
    }
}

/// Something that happened on an open link
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    /// A data frame arrived
    Frame(Frame),
    /// The peer closed the link
    Closed(CloseInfo),
}

/// Command written to an open link
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outgoing {
    Frame(Frame),
    Close(CloseInfo),
}

/// Writing half of a link
pub type OutgoingSink = Pin<Box<dyn Sink<Outgoing, Error = RealtimeError> + Send>>;

/// Reading half of a link
pub type EventStream = BoxStream<'static, Result<TransportEvent>>;

/// An open, handshaken transport link
pub struct Link {
    pub sink: OutgoingSink,
    pub events: EventStream,
}

impl Link {
    pub fn new(sink: OutgoingSink, events: EventStream) -> Self {
        Self { sink, events }
    }
}

impl fmt::Debug for Link {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Link").finish_non_exhaustive()
    }
}

/// Opens physical links
///
/// `open` resolves only once the handshake has completed. Any failure before
/// that point is reported as an error and the manager does not retry it on
/// its own.
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    async fn open(&self, url: &Url, protocols: &[String]) -> Result<Link>;
}

#[cfg(feature = "websocket")]
pub use websocket::WebSocketConnector;

#[cfg(feature = "websocket")]
mod websocket {
    use std::borrow::Cow;

    use async_trait::async_trait;
    use futures_util::{future, SinkExt, StreamExt};
    use tokio_tungstenite::connect_async;
    use tokio_tungstenite::tungstenite::client::IntoClientRequest;
    use tokio_tungstenite::tungstenite::error::ProtocolError;
    use tokio_tungstenite::tungstenite::http::HeaderValue;
    use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
    use tokio_tungstenite::tungstenite::protocol::CloseFrame;
    use tokio_tungstenite::tungstenite::{self, Message};
    use tracing::debug;
    use url::Url;

    use super::{CloseInfo, Connector, Frame, Link, Outgoing, TransportEvent};
    use crate::error::{RealtimeError, Result};

    /// WebSocket connector backed by tokio-tungstenite
    #[derive(Debug, Default, Clone, Copy)]
    pub struct WebSocketConnector;

    impl WebSocketConnector {
        pub fn new() -> Self {
            Self
        }
    }

    #[async_trait]
    impl Connector for WebSocketConnector {
        async fn open(&self, url: &Url, protocols: &[String]) -> Result<Link> {
            let mut request = url.as_str().into_client_request()?;
            if !protocols.is_empty() {
                let value = HeaderValue::from_str(&protocols.join(", "))
                    .map_err(|e| RealtimeError::InvalidEndpoint(format!("invalid protocol list: {e}")))?;
                request.headers_mut().insert("Sec-WebSocket-Protocol", value);
            }

            let (stream, response) = connect_async(request).await.map_err(handshake_error)?;
            debug!(
                "WebSocket handshake complete, status: {:?}",
                response.status()
            );

            let (write, read) = stream.split();
            let sink = write
                .sink_map_err(RealtimeError::from)
                .with(|outgoing: Outgoing| future::ready(Ok::<_, RealtimeError>(to_message(outgoing))));
            let events = read
                .filter_map(|message| future::ready(from_message(message)))
                .boxed();

            Ok(Link::new(Box::pin(sink), events))
        }
    }

    /// Map a handshake failure; a peer that hangs up mid-handshake closed before open
    fn handshake_error(err: tungstenite::Error) -> RealtimeError {
        match err {
            tungstenite::Error::ConnectionClosed
            | tungstenite::Error::AlreadyClosed
            | tungstenite::Error::Protocol(ProtocolError::ResetWithoutClosingHandshake)
            | tungstenite::Error::Protocol(ProtocolError::HandshakeIncomplete) => {
                RealtimeError::ClosedBeforeOpen {
                    code: CloseInfo::ABNORMAL,
                }
            }
            other => RealtimeError::from(other),
        }
    }

    fn to_message(outgoing: Outgoing) -> Message {
        match outgoing {
            Outgoing::Frame(Frame::Text(text)) => Message::Text(text),
            Outgoing::Frame(Frame::Binary(bytes)) => Message::Binary(bytes),
            Outgoing::Close(info) => Message::Close(Some(CloseFrame {
                code: CloseCode::from(info.code),
                reason: Cow::Owned(info.reason),
            })),
        }
    }

    fn from_message(
        message: std::result::Result<Message, tungstenite::Error>,
    ) -> Option<Result<TransportEvent>> {
        match message {
            Ok(Message::Text(text)) => Some(Ok(TransportEvent::Frame(Frame::Text(text)))),
            Ok(Message::Binary(bytes)) => Some(Ok(TransportEvent::Frame(Frame::Binary(bytes)))),
            Ok(Message::Close(frame)) => {
                let info = frame
                    .map(|f| CloseInfo::new(u16::from(f.code), f.reason.into_owned()))
                    .unwrap_or_else(|| CloseInfo::new(CloseInfo::NO_STATUS, ""));
                Some(Ok(TransportEvent::Closed(info)))
            }
            // Pongs are queued by tungstenite itself
            Ok(Message::Ping(_)) | Ok(Message::Pong(_)) | Ok(Message::Frame(_)) => None,
            Err(e) => Some(Err(RealtimeError::from(e))),
        }
    }

}
