//! Raw TCP transport framed as CRLF-terminated lines

use super::{Transport, MAX_LINE_LENGTH};
use crate::error::{TransportError, TransportResult};
use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio_util::codec::{FramedRead, FramedWrite, LinesCodec};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

type LineReader = FramedRead<OwnedReadHalf, LinesCodec>;
type LineWriter = FramedWrite<OwnedWriteHalf, LinesCodec>;

/// Line transport over a plain `TcpStream`
///
/// Inbound lines may end in `\n` or `\r\n`; outbound lines always end in `\r\n`.
pub struct TcpTransport {
    addr: String,
    reader: Mutex<Option<LineReader>>,
    writer: Mutex<Option<LineWriter>>,
    alive: AtomicBool,
}

impl TcpTransport {
    pub fn new(addr: impl Into<String>) -> Self {
        Self {
            addr: addr.into(),
            reader: Mutex::new(None),
            writer: Mutex::new(None),
            alive: AtomicBool::new(false),
        }
    }

    pub fn addr(&self) -> &str {
        &self.addr
    }

    fn mark_dead(&self) {
        self.alive.store(false, Ordering::SeqCst);
    }
}

impl std::fmt::Debug for TcpTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TcpTransport")
            .field("addr", &self.addr)
            .field("alive", &self.is_alive())
            .finish()
    }
}

#[async_trait]
impl Transport for TcpTransport {
    async fn connect(&self, cancel: &CancellationToken) -> TransportResult<()> {
        debug!(addr = %self.addr, "Opening TCP connection");

        let stream = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(TransportError::Cancelled),
            result = TcpStream::connect(&self.addr) => result.map_err(TransportError::connect)?,
        };
        if let Err(e) = stream.set_nodelay(true) {
            warn!(addr = %self.addr, error = %e, "Failed to set TCP_NODELAY");
        }

        let (read_half, write_half) = stream.into_split();
        *self.reader.lock().await = Some(FramedRead::new(
            read_half,
            LinesCodec::new_with_max_length(MAX_LINE_LENGTH),
        ));
        *self.writer.lock().await = Some(FramedWrite::new(write_half, LinesCodec::new()));
        self.alive.store(true, Ordering::SeqCst);

        info!(addr = %self.addr, "TCP connection established");
        Ok(())
    }

    async fn send_line(&self, line: &str) -> TransportResult<()> {
        let mut guard = self.writer.lock().await;
        let writer = guard.as_mut().ok_or(TransportError::NotConnected)?;

        // LinesCodec appends the '\n'
        writer.send(format!("{line}\r")).await.map_err(|e| {
            self.mark_dead();
            TransportError::send(e)
        })
    }

    async fn read_line(&self) -> TransportResult<Option<String>> {
        let mut guard = self.reader.lock().await;
        let reader = guard.as_mut().ok_or(TransportError::NotConnected)?;

        match reader.next().await {
            Some(Ok(line)) => Ok(Some(line)),
            Some(Err(e)) => {
                self.mark_dead();
                Err(TransportError::read(e))
            }
            None => {
                debug!(addr = %self.addr, "Peer closed TCP connection");
                self.mark_dead();
                Ok(None)
            }
        }
    }

    async fn close(&self) -> TransportResult<()> {
        self.mark_dead();

        let writer = self.writer.lock().await.take();
        // A reader still held elsewhere is released when this instance drops
        if let Ok(mut reader) = self.reader.try_lock() {
            reader.take();
        }

        if let Some(mut writer) = writer {
            SinkExt::<String>::close(&mut writer)
                .await
                .map_err(|e| TransportError::CloseFailed(Box::new(e)))?;
        }
        debug!(addr = %self.addr, "TCP connection closed");
        Ok(())
    }

    fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }
}
