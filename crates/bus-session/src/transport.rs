//! Transport abstraction over the wire connection.
//!
//! The session only needs connect / send / receive / close; everything else
//! (TLS, headers, websocket details) stays behind this boundary so tests
//! can inject scripted transports.

use crate::auth::Credentials;
use crate::error::{SessionError, SessionResult};
use async_trait::async_trait;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::header::{AUTHORIZATION, COOKIE};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::debug;
use url::Url;

/// A frame as seen by the session, transport details stripped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportFrame {
    /// A text frame carrying JSON.
    Text(String),
    /// The peer closed the connection.
    Close { code: Option<u16>, reason: String },
}

/// Write half of an open connection.
#[async_trait]
pub trait FrameSink: Send {
    /// Sends a text frame.
    async fn send(&mut self, text: String) -> SessionResult<()>;

    /// Closes the connection cleanly.
    async fn close(&mut self) -> SessionResult<()>;
}

/// Read half of an open connection.
#[async_trait]
pub trait FrameStream: Send {
    /// Receives the next frame. `None` means the stream ended without a
    /// close frame (treated as an abnormal close by the session).
    async fn next(&mut self) -> Option<SessionResult<TransportFrame>>;
}

/// Connects to one endpoint candidate.
#[async_trait]
pub trait BusTransport: Send + Sync {
    /// Opens a connection, returning the two halves.
    async fn connect(
        &self,
        url: &Url,
        credentials: &Credentials,
    ) -> SessionResult<(Box<dyn FrameSink>, Box<dyn FrameStream>)>;
}

/// Production websocket transport.
#[derive(Debug, Default)]
pub struct WebSocketTransport;

impl WebSocketTransport {
    /// Creates the websocket transport.
    pub fn new() -> Self {
        Self
    }
}

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

struct WsSink {
    write: SplitSink<WsStream, Message>,
}

struct WsSource {
    read: SplitStream<WsStream>,
}

#[async_trait]
impl BusTransport for WebSocketTransport {
    async fn connect(
        &self,
        url: &Url,
        credentials: &Credentials,
    ) -> SessionResult<(Box<dyn FrameSink>, Box<dyn FrameStream>)> {
        let mut request = url
            .as_str()
            .into_client_request()
            .map_err(|e| SessionError::Connection(e.to_string()))?;

        if let Some(token) = &credentials.bearer_token {
            request.headers_mut().insert(
                AUTHORIZATION,
                format!("Bearer {token}")
                    .parse()
                    .map_err(|_| SessionError::Auth("invalid bearer token".to_string()))?,
            );
        }
        if let Some(cookie) = &credentials.session_cookie {
            request.headers_mut().insert(
                COOKIE,
                cookie
                    .parse()
                    .map_err(|_| SessionError::Auth("invalid session cookie".to_string()))?,
            );
        }

        debug!(url = %url, "Opening websocket connection");
        let (ws_stream, _) = connect_async(request).await?;
        let (write, read) = ws_stream.split();

        Ok((Box::new(WsSink { write }), Box::new(WsSource { read })))
    }
}

#[async_trait]
impl FrameSink for WsSink {
    async fn send(&mut self, text: String) -> SessionResult<()> {
        self.write.send(Message::Text(text.into())).await?;
        Ok(())
    }

    async fn close(&mut self) -> SessionResult<()> {
        self.write.send(Message::Close(None)).await?;
        Ok(())
    }
}

#[async_trait]
impl FrameStream for WsSource {
    async fn next(&mut self) -> Option<SessionResult<TransportFrame>> {
        loop {
            let msg = self.read.next().await?;
            match msg {
                Ok(Message::Text(text)) => {
                    return Some(Ok(TransportFrame::Text(text.to_string())))
                }
                Ok(Message::Close(frame)) => {
                    let (code, reason) = match frame {
                        Some(f) => (Some(u16::from(f.code)), f.reason.to_string()),
                        None => (None, String::new()),
                    };
                    return Some(Ok(TransportFrame::Close { code, reason }));
                }
                // Pings are answered by the protocol layer; binary frames
                // are not part of this bus protocol.
                Ok(_) => continue,
                Err(e) => return Some(Err(e.into())),
            }
        }
    }
}
