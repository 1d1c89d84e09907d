//! WebSocket transport binding.
//!
//! The core only knows the [`MessageSink`] abstraction; this module ties it
//! to tokio-tungstenite. Each accepted socket gets a writer task fed by an
//! unbounded channel, so the core never awaits a slow peer, and a read loop
//! that feeds frames into the server.

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use futures_util::{SinkExt, StreamExt};
use log::{debug, error, info, warn};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_tungstenite::{accept_async, tungstenite::Message};

use crate::client::MessageSink;
use crate::error::RelayError;
use crate::server::{CollabServer, Connection};

/// Outbound half of one WebSocket connection.
pub struct WsSink {
    tx: mpsc::UnboundedSender<Message>,
    open: AtomicBool,
}

impl WsSink {
    fn new(tx: mpsc::UnboundedSender<Message>) -> Arc<Self> {
        Arc::new(Self {
            tx,
            open: AtomicBool::new(true),
        })
    }

    /// Flag the sink closed without emitting a close frame (the socket is
    /// already gone).
    fn mark_closed(&self) {
        self.open.store(false, Ordering::SeqCst);
    }
}

impl MessageSink for WsSink {
    fn send_text(&self, text: String) -> Result<(), RelayError> {
        self.tx
            .send(Message::Text(text.into()))
            .map_err(|e| RelayError::internal("outbound channel closed", e))
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst) && !self.tx.is_closed()
    }

    fn close(&self) {
        if !self.open.swap(false, Ordering::SeqCst) {
            return;
        }
        let _ = self.tx.send(Message::Close(None));
    }
}

/// Accept loop. Runs until the listener fails or the future is dropped.
pub async fn serve(listener: TcpListener, server: Arc<CollabServer>) {
    loop {
        let (stream, addr) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(e) => {
                error!("accept failed: {e}");
                continue;
            }
        };
        let server = server.clone();
        tokio::spawn(async move {
            if let Err(e) = handle_socket(stream, addr, server).await {
                warn!("[conn:{addr}] connection error: {e}");
            }
        });
    }
}

async fn handle_socket(
    stream: TcpStream,
    addr: SocketAddr,
    server: Arc<CollabServer>,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let ws_stream = accept_async(stream).await?;
    info!("[conn:{addr}] connected");

    let (mut ws_tx, mut ws_rx) = ws_stream.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<Message>();

    // Writer task: drains the channel onto the socket; a close frame ends it.
    let send_task = tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            let closing = msg.is_close();
            if ws_tx.send(msg).await.is_err() {
                break;
            }
            if closing {
                break;
            }
        }
    });

    let sink = WsSink::new(tx);
    let conn = Connection::new(sink.clone());
    server.handle_connection(&conn);

    while let Some(frame) = ws_rx.next().await {
        match frame {
            Ok(msg) => {
                if msg.is_close() {
                    break;
                }
                match msg {
                    Message::Text(text) => server.handle_message(&conn, text.as_str()),
                    Message::Ping(_) | Message::Pong(_) => {}
                    _ => debug!("[conn:{addr}] ignoring non-text frame"),
                }
            }
            Err(e) => {
                warn!("[conn:{addr}] websocket error: {e}");
                break;
            }
        }
    }

    sink.mark_closed();
    server.handle_disconnection(&conn);
    send_task.abort();
    info!("[conn:{addr}] closed");
    Ok(())
}
