//! Connection lifecycle: handshake, receive loop, cancellation.
//!
//! `connect` dials the platform, performs the logon handshake, and
//! spawns the receive loop. Every received frame and the terminal
//! disconnect condition are delivered on the caller's event channel;
//! the receive sequence never ends silently.
//!
//! Reconnection is deliberately not handled here: retry and backoff
//! policy belong to the caller (the circuit breaker supplies both).

use crate::codec::WireCodec;
use crate::error::{TransportError, TransportResult};
use crate::heartbeat::{HeartbeatMonitor, HeartbeatStats};
use desk_core::{type_codes, RawMessage};
use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Logon result code meaning success.
const LOGON_SUCCESS: i64 = 1;

/// Outbound queue depth before senders back-pressure.
const OUTBOUND_BUFFER: usize = 64;

/// Transport configuration.
#[derive(Debug, Clone)]
pub struct TransportConfig {
    /// Platform host.
    pub host: String,
    /// Platform port.
    pub port: u16,
    /// TCP dial timeout.
    pub connect_timeout_ms: u64,
    /// Heartbeat emission interval. The server may negotiate a
    /// different value in its logon response.
    pub heartbeat_interval_ms: u64,
    /// Inbound silence beyond this is a connection failure.
    pub heartbeat_timeout_ms: u64,
    /// The logon response must arrive within this bound.
    pub logon_timeout_ms: u64,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 11099,
            connect_timeout_ms: 5000,
            heartbeat_interval_ms: 5000,
            heartbeat_timeout_ms: 20000,
            logon_timeout_ms: 10000,
        }
    }
}

/// Logon credentials.
#[derive(Debug, Clone)]
pub struct Credentials {
    pub username: String,
    pub password: String,
    /// Trade account to scope the session to, when required.
    pub trade_account: Option<String>,
}

/// Why the connection ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DisconnectReason {
    /// The remote side closed the stream.
    RemoteClosed,
    /// No inbound traffic within the heartbeat timeout.
    HeartbeatTimeout,
    /// Socket-level failure.
    Io(String),
    /// Local shutdown request.
    Cancelled,
}

impl fmt::Display for DisconnectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::RemoteClosed => write!(f, "remote closed"),
            Self::HeartbeatTimeout => write!(f, "heartbeat timeout"),
            Self::Io(e) => write!(f, "io error: {e}"),
            Self::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// Events delivered on the receive channel.
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    /// A frame arrived.
    Message(RawMessage),
    /// Terminal: the connection is gone. Always the last event.
    Disconnected(DisconnectReason),
}

/// Handle to a live connection.
///
/// Dropping the handle does not close the connection; call
/// [`TransportHandle::shutdown`] for a bounded-time stop.
#[derive(Debug)]
pub struct TransportHandle {
    outbound_tx: mpsc::Sender<RawMessage>,
    shutdown: CancellationToken,
    heartbeat: Arc<HeartbeatMonitor>,
    negotiated_heartbeat_ms: u64,
    task: JoinHandle<()>,
}

impl TransportHandle {
    /// Queue a message for sending.
    pub async fn send(&self, msg: RawMessage) -> TransportResult<()> {
        self.outbound_tx
            .send(msg)
            .await
            .map_err(|_| TransportError::SendFailed("connection task gone".to_string()))
    }

    /// Request the connection to stop. The receive loop exits within one
    /// select iteration and the socket is released.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    /// Heartbeat interval in effect (server-negotiated when offered).
    pub fn negotiated_heartbeat_ms(&self) -> u64 {
        self.negotiated_heartbeat_ms
    }

    /// Heartbeat health snapshot.
    pub fn heartbeat_stats(&self) -> HeartbeatStats {
        self.heartbeat.stats()
    }

    /// Wait for the receive loop to finish.
    pub async fn join(self) {
        let _ = self.task.await;
    }
}

/// Build the logon request frame.
fn logon_request(credentials: &Credentials, heartbeat_secs: u64) -> RawMessage {
    let mut fields = json!({
        "Username": credentials.username,
        "Password": credentials.password,
        "HeartbeatIntervalInSeconds": heartbeat_secs,
        "ClientName": "desk-gateway",
    });
    if let Some(account) = &credentials.trade_account {
        fields["TradeAccount"] = Value::from(account.as_str());
    }
    RawMessage::new(type_codes::LOGON_REQUEST, fields)
}

/// Dial the platform, perform the logon handshake, and spawn the
/// receive loop. Frames and the terminal disconnect event are sent to
/// `event_tx`.
pub async fn connect<C: WireCodec>(
    config: &TransportConfig,
    credentials: &Credentials,
    codec: C,
    event_tx: mpsc::Sender<TransportEvent>,
) -> TransportResult<TransportHandle> {
    let addr = format!("{}:{}", config.host, config.port);
    info!(%addr, "Connecting to platform");

    let stream = tokio::time::timeout(
        Duration::from_millis(config.connect_timeout_ms),
        TcpStream::connect(&addr),
    )
    .await
    .map_err(|_| TransportError::Connect(format!("timed out dialing {addr}")))?
    .map_err(|e| TransportError::Connect(e.to_string()))?;

    // Heartbeats are latency-sensitive; don't let Nagle batch them.
    let _ = stream.set_nodelay(true);

    let mut framed = Framed::new(stream, codec);

    // Handshake: logon request out, logon response required back before
    // any other traffic is accepted.
    framed
        .send(logon_request(
            credentials,
            (config.heartbeat_interval_ms / 1000).max(1),
        ))
        .await?;

    let response = tokio::time::timeout(
        Duration::from_millis(config.logon_timeout_ms),
        framed.next(),
    )
    .await
    .map_err(|_| TransportError::HandshakeTimeout)?
    .ok_or_else(|| TransportError::Handshake("connection closed during logon".to_string()))??;

    if response.type_code != type_codes::LOGON_RESPONSE {
        return Err(TransportError::Handshake(format!(
            "expected logon response, got type {}",
            response.type_code
        )));
    }

    let result = response
        .field("Result")
        .and_then(Value::as_i64)
        .unwrap_or(0);
    if result != LOGON_SUCCESS {
        let text = response
            .field("ResultText")
            .and_then(Value::as_str)
            .unwrap_or("logon rejected");
        return Err(TransportError::Handshake(text.to_string()));
    }

    let negotiated_heartbeat_ms = response
        .field("HeartbeatIntervalInSeconds")
        .and_then(Value::as_u64)
        .map(|secs| secs * 1000)
        .unwrap_or(config.heartbeat_interval_ms);

    info!(
        heartbeat_ms = negotiated_heartbeat_ms,
        server = response.field("ServerName").and_then(serde_json::Value::as_str),
        "Logon accepted"
    );

    let heartbeat = Arc::new(HeartbeatMonitor::new(
        negotiated_heartbeat_ms,
        config.heartbeat_timeout_ms,
    ));
    heartbeat.reset();

    let (outbound_tx, outbound_rx) = mpsc::channel(OUTBOUND_BUFFER);
    let shutdown = CancellationToken::new();

    let task = tokio::spawn(run_loop(
        framed,
        heartbeat.clone(),
        outbound_rx,
        event_tx,
        shutdown.clone(),
    ));

    Ok(TransportHandle {
        outbound_tx,
        shutdown,
        heartbeat,
        negotiated_heartbeat_ms,
        task,
    })
}

async fn run_loop<C: WireCodec>(
    mut framed: Framed<TcpStream, C>,
    heartbeat: Arc<HeartbeatMonitor>,
    mut outbound_rx: mpsc::Receiver<RawMessage>,
    event_tx: mpsc::Sender<TransportEvent>,
    shutdown: CancellationToken,
) {
    let mut outbound_open = true;

    let reason = loop {
        tokio::select! {
            () = shutdown.cancelled() => {
                info!("Shutdown requested, closing connection");
                break DisconnectReason::Cancelled;
            }

            frame = framed.next() => {
                match frame {
                    Some(Ok(raw)) => {
                        heartbeat.record_received();
                        if event_tx.send(TransportEvent::Message(raw)).await.is_err() {
                            warn!("Event receiver dropped, closing connection");
                            break DisconnectReason::Cancelled;
                        }
                    }
                    Some(Err(e)) => {
                        error!(?e, "Transport read error");
                        break DisconnectReason::Io(e.to_string());
                    }
                    None => {
                        warn!("Stream ended");
                        break DisconnectReason::RemoteClosed;
                    }
                }
            }

            outbound = outbound_rx.recv(), if outbound_open => {
                match outbound {
                    Some(msg) => {
                        if let Err(e) = framed.send(msg).await {
                            error!(?e, "Transport write error");
                            break DisconnectReason::Io(e.to_string());
                        }
                    }
                    // All senders gone; keep receiving.
                    None => outbound_open = false,
                }
            }

            () = heartbeat.wait_for_check() => {
                if heartbeat.is_silent() {
                    error!(silence_ms = heartbeat.silence_ms(), "Heartbeat timeout");
                    break DisconnectReason::HeartbeatTimeout;
                }

                if heartbeat.should_send() {
                    let hb = RawMessage::new(type_codes::HEARTBEAT, json!({}));
                    if let Err(e) = framed.send(hb).await {
                        error!(?e, "Failed to send heartbeat");
                        break DisconnectReason::Io(e.to_string());
                    }
                    heartbeat.record_sent();
                    debug!("Sent heartbeat");
                }
            }
        }
    };

    // Terminal event; the receive sequence never just stops.
    let _ = event_tx
        .send(TransportEvent::Disconnected(reason.clone()))
        .await;
    info!(%reason, "Connection closed");
}
