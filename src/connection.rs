//! Connection lifecycle: one logical relay connection at a time, manual
//! reconnect only. `connect` always tears the previous socket down first;
//! every socket event carries the connection id it belongs to, so events
//! from a torn-down socket can never touch current state.

use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::pose::PoseFrame;
use crate::protocol;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionStatus {
    Closed,
    Connecting,
    Open,
}

/// Emitted by the per-connection tasks, tagged with their connection id.
#[derive(Debug)]
pub enum SocketEvent {
    Opened { id: u64 },
    Closed { id: u64 },
    Frame { id: u64, frame: PoseFrame },
}

pub struct ConnectionManager {
    status: ConnectionStatus,
    conn_id: u64,
    outbound: Option<mpsc::UnboundedSender<Bytes>>,
    cancel: Option<CancellationToken>,
    events: mpsc::UnboundedSender<SocketEvent>,
    max_frame_length: usize,
}

impl ConnectionManager {
    pub fn new(events: mpsc::UnboundedSender<SocketEvent>) -> Self {
        Self {
            status: ConnectionStatus::Closed,
            conn_id: 0,
            outbound: None,
            cancel: None,
            events,
            max_frame_length: protocol::MAX_FRAME_LENGTH,
        }
    }

    pub fn status(&self) -> ConnectionStatus {
        self.status
    }

    /// Open a connection to `host:port`. Any existing socket is fully torn
    /// down first, which is what keeps the single-socket invariant; calling
    /// this repeatedly is safe.
    pub fn connect(&mut self, host: &str, port: u16) {
        self.disconnect();

        self.conn_id += 1;
        let id = self.conn_id;
        let addr = format!("{host}:{port}");
        let cancel = CancellationToken::new();
        let (tx, rx) = mpsc::unbounded_channel();

        self.outbound = Some(tx);
        self.cancel = Some(cancel.clone());
        self.status = ConnectionStatus::Connecting;

        log::info!("connecting to {addr}");
        tokio::spawn(run_connection(
            addr,
            id,
            rx,
            self.events.clone(),
            cancel,
            self.max_frame_length,
        ));
    }

    /// Close the current socket, if any, and detach its tasks.
    pub fn disconnect(&mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel.cancel();
        }
        self.outbound = None;
        self.status = ConnectionStatus::Closed;
    }

    /// Apply a socket event. Events from a superseded connection are
    /// dropped wholesale. Returns the inbound frame when one should be
    /// delivered to local consumers.
    pub fn handle_event(&mut self, event: SocketEvent) -> Option<PoseFrame> {
        match event {
            SocketEvent::Opened { id } if id == self.conn_id => {
                if self.status == ConnectionStatus::Connecting {
                    self.status = ConnectionStatus::Open;
                    log::info!("connection open");
                }
                None
            }
            SocketEvent::Closed { id } if id == self.conn_id => {
                self.outbound = None;
                self.cancel = None;
                self.status = ConnectionStatus::Closed;
                log::info!("connection closed");
                None
            }
            SocketEvent::Frame { id, frame } if id == self.conn_id => Some(frame),
            // stale socket: its listeners are detached by construction
            _ => None,
        }
    }

    /// Send one pose frame. Only attempted while Open; otherwise silently
    /// skipped. A fresher frame will be produced on the next tick, so
    /// nothing is queued across a disconnected interval.
    pub fn send(&self, frame: &PoseFrame) {
        if self.status != ConnectionStatus::Open {
            return;
        }
        let Some(outbound) = &self.outbound else {
            return;
        };
        match protocol::encode_frame(frame) {
            Ok(bytes) => {
                let _ = outbound.send(bytes);
            }
            Err(e) => log::warn!("failed to encode pose frame: {e}"),
        }
    }
}

/// Connect, then pump the socket until it closes, it errors, or the token
/// is cancelled. Inbound payloads that fail to parse are dropped
/// per-message; the connection stays up.
async fn run_connection(
    addr: String,
    id: u64,
    mut outbound: mpsc::UnboundedReceiver<Bytes>,
    events: mpsc::UnboundedSender<SocketEvent>,
    cancel: CancellationToken,
    max_frame_length: usize,
) {
    let stream = tokio::select! {
        _ = cancel.cancelled() => return,
        result = TcpStream::connect(&addr) => match result {
            Ok(stream) => stream,
            Err(e) => {
                log::warn!("connect to {addr} failed: {e}");
                let _ = events.send(SocketEvent::Closed { id });
                return;
            }
        },
    };
    let _ = stream.set_nodelay(true);

    let framed = protocol::framed_with_max(stream, max_frame_length);
    let (mut sink, mut reader) = framed.split();
    let _ = events.send(SocketEvent::Opened { id });

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break, // dropping the halves closes the socket
            message = outbound.recv() => match message {
                Some(bytes) => {
                    if let Err(e) = sink.send(bytes).await {
                        log::warn!("send failed: {e}");
                        let _ = events.send(SocketEvent::Closed { id });
                        break;
                    }
                }
                None => break,
            },
            incoming = reader.next() => match incoming {
                Some(Ok(bytes)) => match protocol::decode_frame(&bytes) {
                    Ok(frame) => {
                        let _ = events.send(SocketEvent::Frame { id, frame });
                    }
                    Err(e) => log::warn!("dropping malformed message: {e}"),
                },
                Some(Err(e)) => {
                    log::warn!("socket error: {e}");
                    let _ = events.send(SocketEvent::Closed { id });
                    break;
                }
                None => {
                    let _ = events.send(SocketEvent::Closed { id });
                    break;
                }
            },
        }
    }
}
