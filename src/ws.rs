//! WebSocket transport wrapper.
//!
//! Thin wrapper around `tokio-tungstenite` providing type-isolated
//! reader/writer halves. The rest of the crate goes through this module
//! rather than touching `tokio-tungstenite` directly, so transport-level
//! concerns (TLS, frame coalescing, future keepalive tuning) stay in one
//! place.
//!
//! The protocol interleaves JSON text frames with raw binary frames in both
//! directions, so unlike a typical chat-style wrapper this one exposes
//! binary sends as a first-class operation.

use crate::error::{ClientError, Result};
use futures_util::{SinkExt, StreamExt};
use tokio_tungstenite::tungstenite;

/// Concrete WebSocket stream type (avoids repeating the generic everywhere).
type WsStream = tokio_tungstenite::WebSocketStream<
    tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>,
>;

/// Received WebSocket message, reduced to what the protocol uses.
#[derive(Debug)]
pub enum WsMessage {
    /// UTF-8 text frame (JSON request/reply envelopes).
    Text(String),
    /// Binary frame (memory data, file chunks).
    Binary(Vec<u8>),
    /// Close frame; the transport is gone.
    Close,
}

/// Write half of a WebSocket connection.
#[derive(Debug)]
pub struct WsWriter {
    sink: futures_util::stream::SplitSink<WsStream, tungstenite::Message>,
}

impl WsWriter {
    /// Send a UTF-8 text frame.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError::Connection`] if the send fails.
    pub async fn send_text(&mut self, text: &str) -> Result<()> {
        self.sink
            .send(tungstenite::Message::Text(text.to_string()))
            .await
            .map_err(|e| ClientError::Connection(format!("WebSocket send failed: {e}")))
    }

    /// Send a raw binary frame.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError::Connection`] if the send fails.
    pub async fn send_binary(&mut self, data: Vec<u8>) -> Result<()> {
        self.sink
            .send(tungstenite::Message::Binary(data))
            .await
            .map_err(|e| ClientError::Connection(format!("WebSocket binary send failed: {e}")))
    }

    /// Flush pending writes and close the sink.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError::Connection`] if closing fails.
    pub async fn close(&mut self) -> Result<()> {
        self.sink
            .close()
            .await
            .map_err(|e| ClientError::Connection(format!("WebSocket close failed: {e}")))
    }
}

/// Read half of a WebSocket connection.
#[derive(Debug)]
pub struct WsReader {
    stream: futures_util::stream::SplitStream<WsStream>,
}

impl WsReader {
    /// Receive the next message, returning `None` when the stream ends.
    ///
    /// Ping/pong and raw `Frame` variants are handled or skipped internally;
    /// callers only ever see text, binary, or close.
    pub async fn recv(&mut self) -> Option<Result<WsMessage>> {
        loop {
            match self.stream.next().await {
                Some(Ok(tungstenite::Message::Text(text))) => {
                    return Some(Ok(WsMessage::Text(text)));
                }
                Some(Ok(tungstenite::Message::Binary(data))) => {
                    return Some(Ok(WsMessage::Binary(data)));
                }
                Some(Ok(tungstenite::Message::Close(_))) => {
                    return Some(Ok(WsMessage::Close));
                }
                Some(Ok(tungstenite::Message::Ping(_) | tungstenite::Message::Pong(_))) => {
                    // tungstenite answers pings at the protocol level
                    continue;
                }
                Some(Ok(tungstenite::Message::Frame(_))) => continue,
                Some(Err(e)) => {
                    return Some(Err(ClientError::Connection(format!(
                        "WebSocket read error: {e}"
                    ))));
                }
                None => return None,
            }
        }
    }
}

/// Connect to a WebSocket URL.
///
/// Returns split (writer, reader) halves so the receive loop can own the
/// reader while request-issuing operations share the writer.
///
/// # Errors
///
/// Returns [`ClientError::Connection`] if the URL is invalid or the
/// handshake fails.
pub async fn connect(url: &str) -> Result<(WsWriter, WsReader)> {
    let (ws_stream, _response) = tokio_tungstenite::connect_async(url)
        .await
        .map_err(|e| ClientError::Connection(format!("WebSocket connect to {url} failed: {e}")))?;

    let (sink, stream) = ws_stream.split();

    Ok((WsWriter { sink }, WsReader { stream }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn connect_invalid_url_returns_error() {
        let result = connect("not-a-url").await;
        assert!(matches!(result, Err(ClientError::Connection(_))));
    }

    #[tokio::test]
    async fn connect_unreachable_host_returns_error() {
        let result = connect("ws://127.0.0.1:1/").await;
        assert!(matches!(result, Err(ClientError::Connection(_))));
    }
}
