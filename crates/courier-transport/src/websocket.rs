//! WebSocket-backed message sink.
//!
//! Each upgraded connection gets a dedicated writer task that owns the write
//! half of the socket and drains a bounded command channel. Senders suspend
//! on a full channel instead of blocking the socket, and a send that cannot
//! find buffer space within the timeout reports backpressure so callers can
//! retry later.

use async_trait::async_trait;
use axum::extract::ws::{CloseFrame, Message, WebSocket};
use courier_core::sink::{MessageSink, SinkError};
use futures_util::stream::SplitSink;
use futures_util::SinkExt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tracing::debug;

/// Writer task tuning.
#[derive(Debug, Clone)]
pub struct WebSocketSinkConfig {
    /// Frames buffered per connection before sends start waiting.
    pub outbound_buffer: usize,
    /// How long a send may wait for buffer space before reporting
    /// backpressure.
    pub send_timeout: Duration,
}

impl Default for WebSocketSinkConfig {
    fn default() -> Self {
        Self {
            outbound_buffer: 64,
            send_timeout: Duration::from_secs(5),
        }
    }
}

enum WriterCommand {
    Frame(String),
    Close(u16, String),
}

/// Sink half of an upgraded WebSocket connection.
///
/// Dropping every clone of the sink ends the writer task, which closes the
/// socket.
pub struct WebSocketSink {
    commands: mpsc::Sender<WriterCommand>,
    open: Arc<AtomicBool>,
    send_timeout: Duration,
}

impl WebSocketSink {
    /// Spawn the writer task over the write half of an upgraded socket.
    #[must_use]
    pub fn spawn(writer: SplitSink<WebSocket, Message>, config: &WebSocketSinkConfig) -> Self {
        let (commands, receiver) = mpsc::channel(config.outbound_buffer.max(1));
        let open = Arc::new(AtomicBool::new(true));
        tokio::spawn(run_writer(writer, receiver, Arc::clone(&open)));
        Self {
            commands,
            open,
            send_timeout: config.send_timeout,
        }
    }
}

#[async_trait]
impl MessageSink for WebSocketSink {
    async fn send(&self, frame: &str) -> Result<(), SinkError> {
        if !self.open.load(Ordering::SeqCst) {
            return Err(SinkError::Closed);
        }
        let command = WriterCommand::Frame(frame.to_string());
        match timeout(self.send_timeout, self.commands.send(command)).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(_)) => {
                self.open.store(false, Ordering::SeqCst);
                Err(SinkError::Closed)
            }
            Err(_) => Err(SinkError::Backpressure),
        }
    }

    async fn close(&self, code: u16, reason: &str) {
        if !self.open.swap(false, Ordering::SeqCst) {
            return;
        }
        let command = WriterCommand::Close(code, reason.to_string());
        if timeout(self.send_timeout, self.commands.send(command))
            .await
            .is_err()
        {
            debug!("Writer queue full, close frame dropped");
        }
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst) && !self.commands.is_closed()
    }
}

async fn run_writer(
    mut writer: SplitSink<WebSocket, Message>,
    mut commands: mpsc::Receiver<WriterCommand>,
    open: Arc<AtomicBool>,
) {
    while let Some(command) = commands.recv().await {
        match command {
            WriterCommand::Frame(frame) => {
                if let Err(error) = writer.send(Message::Text(frame)).await {
                    debug!(%error, "Socket write failed, stopping writer");
                    break;
                }
            }
            WriterCommand::Close(code, reason) => {
                let frame = CloseFrame {
                    code,
                    reason: reason.into(),
                };
                if let Err(error) = writer.send(Message::Close(Some(frame))).await {
                    debug!(%error, "Close frame write failed");
                }
                break;
            }
        }
    }
    open.store(false, Ordering::SeqCst);
    let _ = writer.close().await;
}
