//! WebSocket transport carrying chat lines in text frames

use super::{Transport, MAX_LINE_LENGTH};
use crate::error::{TransportError, TransportResult};
use async_trait::async_trait;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

struct FrameReader {
    stream: SplitStream<WsStream>,
    // One frame may carry several lines
    pending: VecDeque<String>,
}

impl FrameReader {
    fn buffer_lines(&mut self, text: &str) {
        self.pending.extend(split_lines(text));
    }
}

/// Split a text frame into lines, dropping terminators and blank lines
fn split_lines(text: &str) -> impl Iterator<Item = String> + '_ {
    text.split('\n')
        .map(|line| line.trim_end_matches('\r'))
        .filter(|line| !line.is_empty())
        .map(str::to_owned)
}

/// Line transport over a WebSocket (`ws://` or `wss://`)
pub struct WebSocketTransport {
    url: String,
    reader: Mutex<Option<FrameReader>>,
    writer: Mutex<Option<SplitSink<WsStream, Message>>>,
    alive: AtomicBool,
}

impl WebSocketTransport {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            reader: Mutex::new(None),
            writer: Mutex::new(None),
            alive: AtomicBool::new(false),
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    fn mark_dead(&self) {
        self.alive.store(false, Ordering::SeqCst);
    }
}

impl std::fmt::Debug for WebSocketTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WebSocketTransport")
            .field("url", &self.url)
            .field("alive", &self.is_alive())
            .finish()
    }
}

#[async_trait]
impl Transport for WebSocketTransport {
    async fn connect(&self, cancel: &CancellationToken) -> TransportResult<()> {
        debug!(url = %self.url, "Opening WebSocket connection");

        let (stream, _response) = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(TransportError::Cancelled),
            result = connect_async(self.url.as_str()) => result.map_err(|e| match e {
                tungstenite::Error::Url(e) => TransportError::InvalidUrl(format!("{}: {e}", self.url)),
                other => TransportError::connect(other),
            })?,
        };

        let (sink, stream) = stream.split();
        *self.reader.lock().await = Some(FrameReader {
            stream,
            pending: VecDeque::new(),
        });
        *self.writer.lock().await = Some(sink);
        self.alive.store(true, Ordering::SeqCst);

        info!(url = %self.url, "WebSocket connection established");
        Ok(())
    }

    async fn send_line(&self, line: &str) -> TransportResult<()> {
        let mut guard = self.writer.lock().await;
        let writer = guard.as_mut().ok_or(TransportError::NotConnected)?;

        writer
            .send(Message::text(line.to_owned()))
            .await
            .map_err(|e| {
                self.mark_dead();
                TransportError::send(e)
            })
    }

    async fn read_line(&self) -> TransportResult<Option<String>> {
        let mut guard = self.reader.lock().await;
        let reader = guard.as_mut().ok_or(TransportError::NotConnected)?;

        loop {
            if let Some(line) = reader.pending.pop_front() {
                return Ok(Some(line));
            }

            let frame = match reader.stream.next().await {
                Some(Ok(frame)) => frame,
                Some(Err(e)) => {
                    self.mark_dead();
                    return Err(TransportError::read(e));
                }
                None => {
                    self.mark_dead();
                    return Ok(None);
                }
            };

            match &frame {
                Message::Close(close_frame) => {
                    debug!(url = %self.url, frame = ?close_frame, "Peer sent close frame");
                    self.mark_dead();
                    return Ok(None);
                }
                Message::Text(_) | Message::Binary(_) => match frame.to_text() {
                    Ok(text) if text.len() > MAX_LINE_LENGTH => {
                        warn!(url = %self.url, len = text.len(), "Dropping oversized frame");
                    }
                    Ok(text) => reader.buffer_lines(text),
                    Err(e) => warn!(url = %self.url, error = %e, "Dropping non-UTF-8 frame"),
                },
                // Pings are answered by tungstenite itself
                _ => {}
            }
        }
    }

    async fn close(&self) -> TransportResult<()> {
        self.mark_dead();

        let writer = self.writer.lock().await.take();
        if let Ok(mut reader) = self.reader.try_lock() {
            reader.take();
        }

        if let Some(mut writer) = writer {
            writer
                .close()
                .await
                .map_err(|e| TransportError::CloseFailed(Box::new(e)))?;
        }
        debug!(url = %self.url, "WebSocket connection closed");
        Ok(())
    }

    fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_split_lines() {
        let lines: Vec<String> =
            split_lines(":tmi PRIVMSG #c :hi\r\nPING :tmi\r\n\r\n").collect();
        assert_eq!(lines, vec![":tmi PRIVMSG #c :hi", "PING :tmi"]);

        let lines: Vec<String> = split_lines("single").collect();
        assert_eq!(lines, vec!["single"]);

        assert_eq!(split_lines("").count(), 0);
    }

    #[tokio::test]
    async fn test_operations_before_connect_fail() {
        let transport = WebSocketTransport::new("ws://127.0.0.1:1/");
        assert!(!transport.is_alive());
        assert!(matches!(
            transport.send_line("PING").await,
            Err(TransportError::NotConnected)
        ));
        assert!(transport.close().await.is_ok());
    }

    #[tokio::test]
    async fn test_malformed_url_is_invalid_url() {
        // No port and no ws/wss default to fall back on
        let transport = WebSocketTransport::new("ftp://127.0.0.1/");
        let result = transport.connect(&CancellationToken::new()).await;
        assert!(matches!(result, Err(TransportError::InvalidUrl(_))));
    }

    #[tokio::test]
    async fn test_connect_refused_is_error() {
        // Port 1 on loopback is not listening
        let transport = WebSocketTransport::new("ws://127.0.0.1:1/");
        let result = transport.connect(&CancellationToken::new()).await;
        assert!(matches!(result, Err(TransportError::ConnectFailed(_))));
        assert!(!transport.is_alive());
    }
}
