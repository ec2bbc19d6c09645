// WebSocket server: one task per client, all funnelled into one event channel.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use futures_util::stream::Stream;
use futures_util::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};

/// Frames queued per client before new frames are dropped.
pub const OUTBOUND_BUFFER: usize = 64;

pub type ConnId = u64;

/// Events emitted by the WebSocket server to the application layer.
#[derive(Debug)]
pub enum WsEvent {
    /// A client finished the handshake. Frames sent on `outbound` are
    /// written to it as text.
    Connected {
        conn_id: ConnId,
        addr: String,
        outbound: mpsc::Sender<String>,
    },
    Disconnected { conn_id: ConnId },
    /// A text frame (raw JSON) from a client.
    Message { conn_id: ConnId, text: String },
}

/// Source of raw client connections.
#[async_trait]
pub trait Listener: Send {
    type Stream: AsyncRead + AsyncWrite + Unpin + Send + 'static;

    async fn accept(&mut self) -> std::io::Result<(Self::Stream, SocketAddr)>;
}

/// TCP listener used in production.
pub struct TungsteniteListener {
    inner: TcpListener,
}

impl TungsteniteListener {
    pub async fn bind(addr: &str) -> std::io::Result<Self> {
        let inner = TcpListener::bind(addr).await?;
        Ok(Self { inner })
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.inner.local_addr()
    }
}

#[async_trait]
impl Listener for TungsteniteListener {
    type Stream = TcpStream;

    async fn accept(&mut self) -> std::io::Result<(TcpStream, SocketAddr)> {
        self.inner.accept().await
    }
}

/// Accept clients forever, handing each one its own task.
///
/// Returns once the application side of `tx` is gone.
pub async fn run<L: Listener>(mut listener: L, tx: mpsc::Sender<WsEvent>) -> anyhow::Result<()> {
    let next_id = Arc::new(AtomicU64::new(1));

    loop {
        if tx.is_closed() {
            break;
        }
        let (stream, addr) = listener.accept().await?;
        let conn_id = next_id.fetch_add(1, Ordering::Relaxed);
        let tx = tx.clone();
        tokio::spawn(async move {
            handle_connection(stream, addr.to_string(), conn_id, tx).await;
        });
    }

    Ok(())
}

async fn handle_connection<S>(stream: S, addr: String, conn_id: ConnId, tx: mpsc::Sender<WsEvent>)
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let ws_stream = match tokio_tungstenite::accept_async(stream).await {
        Ok(ws) => ws,
        Err(e) => {
            warn!("WebSocket handshake failed for {addr}: {e}");
            return;
        }
    };
    info!("Client {conn_id} connected from {addr}");

    let (out_tx, mut out_rx) = mpsc::channel::<String>(OUTBOUND_BUFFER);
    let connected = WsEvent::Connected {
        conn_id,
        addr: addr.clone(),
        outbound: out_tx,
    };
    if tx.send(connected).await.is_err() {
        return;
    }

    let (mut write, read) = ws_stream.split();
    let writer = tokio::spawn(async move {
        while let Some(text) = out_rx.recv().await {
            if let Err(e) = write.send(Message::Text(text.into())).await {
                debug!("Write to client {conn_id} failed: {e}");
                break;
            }
        }
        let _ = write.close().await;
    });

    let _ = process_message_stream(read, &tx, conn_id, &addr).await;
    let _ = tx.send(WsEvent::Disconnected { conn_id }).await;
    writer.abort();
    info!("Client {conn_id} ({addr}) disconnected");
}

/// Forward text frames from `stream` as [`WsEvent::Message`] until the
/// client closes, errors, or the stream ends. Returns `Err(())` if the
/// application side has gone away.
pub async fn process_message_stream<St>(
    mut stream: St,
    tx: &mpsc::Sender<WsEvent>,
    conn_id: ConnId,
    addr: &str,
) -> Result<(), ()>
where
    St: Stream<Item = Result<Message, tokio_tungstenite::tungstenite::Error>> + Unpin,
{
    while let Some(msg_result) = stream.next().await {
        match msg_result {
            Ok(Message::Text(text)) => {
                let event = WsEvent::Message {
                    conn_id,
                    text: text.to_string(),
                };
                if tx.send(event).await.is_err() {
                    return Err(());
                }
            }
            Ok(Message::Close(_)) => {
                info!("Client {addr} sent close frame");
                break;
            }
            Err(e) => {
                warn!("WebSocket error from {addr}: {e}");
                break;
            }
            _ => {
                // Binary, Ping, Pong, Frame: nothing to forward.
            }
        }
    }
    Ok(())
}
