use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, tungstenite::Message};

use super::{Connector, FrameTransport};
use crate::error::EclaError;

/// Resource path the daemon serves ECLA connections on
pub const DEFAULT_RESOURCE_PATH: &str = "/ws/ecla";

/// Opens WebSocket transports at `ws://<addr><path>`
#[derive(Debug, Clone)]
pub struct WebSocketConnector {
    scheme: String,
    path: String,
}

impl WebSocketConnector {
    pub fn new() -> Self {
        Self {
            scheme: "ws".to_string(),
            path: DEFAULT_RESOURCE_PATH.to_string(),
        }
    }

    /// Use `wss` instead of `ws`
    pub fn with_tls(mut self, enabled: bool) -> Self {
        self.scheme = if enabled { "wss" } else { "ws" }.to_string();
        self
    }

    pub fn with_path<S: Into<String>>(mut self, path: S) -> Self {
        self.path = path.into();
        self
    }

    /// Build the endpoint URL for a `host:port` address
    pub fn endpoint(&self, addr: &str) -> Result<url::Url, EclaError> {
        let mut url = url::Url::parse(&format!("{}://{}", self.scheme, addr))
            .map_err(|e| EclaError::transport_open(addr, format!("invalid address: {}", e)))?;
        url.set_path(&self.path);
        Ok(url)
    }
}

impl Default for WebSocketConnector {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Connector for WebSocketConnector {
    async fn open(&self, addr: &str) -> Result<Box<dyn FrameTransport>, EclaError> {
        let url = self.endpoint(addr)?;
        tracing::debug!("connecting to {}", url);

        let (stream, _response) = tokio_tungstenite::connect_async(url.as_str())
            .await
            .map_err(|e| EclaError::transport_open(addr, e))?;

        Ok(Box::new(WebSocketTransport::new(stream)))
    }
}

/// WebSocket backed [`FrameTransport`]
///
/// Keepalive frames are never originated; incoming ping/pong frames are
/// skipped by `read_frame`.
pub struct WebSocketTransport<S = MaybeTlsStream<TcpStream>> {
    stream: WebSocketStream<S>,
}

impl<S> WebSocketTransport<S>
where
    S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin,
{
    pub fn new(stream: WebSocketStream<S>) -> Self {
        Self { stream }
    }
}

#[async_trait]
impl<S> FrameTransport for WebSocketTransport<S>
where
    S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin + Send + 'static,
{
    async fn read_frame(&mut self) -> Result<String, EclaError> {
        loop {
            match self.stream.next().await {
                Some(Ok(Message::Text(text))) => return Ok(text.to_string()),
                Some(Ok(Message::Binary(data))) => match binary_text(&data) {
                    Some(text) => return Ok(text),
                    None => continue,
                },
                Some(Ok(Message::Close(frame))) => {
                    let reason = frame
                        .map(|f| format!("closed by peer (code {})", u16::from(f.code)))
                        .unwrap_or_else(|| "closed by peer".to_string());
                    return Err(EclaError::frame_read(reason));
                }
                Some(Ok(Message::Ping(_))) | Some(Ok(Message::Pong(_))) | Some(Ok(Message::Frame(_))) => {
                    continue;
                }
                Some(Err(e)) => return Err(EclaError::frame_read(e)),
                None => return Err(EclaError::frame_read("stream ended")),
            }
        }
    }

    async fn write_frame(&mut self, frame: String) -> Result<(), EclaError> {
        self.stream
            .send(Message::Text(frame.into()))
            .await
            .map_err(EclaError::frame_write)
    }

    async fn close(&mut self) -> Result<(), EclaError> {
        let frame = CloseFrame {
            code: CloseCode::Normal,
            reason: "".into(),
        };
        self.stream
            .send(Message::Close(Some(frame)))
            .await
            .map_err(EclaError::frame_write)
    }
}

/// Text carried in a binary frame; `None` when it is not valid UTF-8
fn binary_text(data: &[u8]) -> Option<String> {
    match String::from_utf8(data.to_vec()) {
        Ok(text) => Some(text),
        Err(e) => {
            tracing::warn!("dropping binary frame that is not UTF-8: {}", e);
            None
        }
    }
}
