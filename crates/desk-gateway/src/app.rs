//! Application supervisor.
//!
//! Owns the reconnect loop: every connection attempt goes through the
//! circuit breaker, a live connection is pumped until its terminal
//! disconnect event, and the backoff policy paces retries. The
//! transport itself never retries.

use crate::config::GatewayConfig;
use crate::error::GatewayResult;
use crate::router::MessageRouter;
use desk_breaker::{BackoffPolicy, BreakerError, CircuitBreaker, CircuitState};
use desk_core::{type_codes, RawMessage, TradingMode};
use desk_ledger::{build_ledger, fill_stream, snapshot, write_fills, write_ledger, JsonLinesWriter};
use desk_protocol::{Normalizer, RequestKind};
use desk_state::StateManager;
use desk_telemetry::metrics::{
    self, GATEWAY_CONNECTED, GATEWAY_RECONNECT_TOTAL, GATEWAY_STATE_EVENTS_TOTAL,
};
use desk_transport::{
    DisconnectReason, LengthPrefixedJson, TransportEvent, TransportHandle, TransportResult,
};
use serde_json::json;
use std::path::Path;
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Transport event channel depth.
const EVENT_BUFFER: usize = 1024;

/// Main application.
pub struct Application {
    config: GatewayConfig,
    state: Arc<StateManager>,
    normalizer: Arc<Normalizer>,
    router: Arc<MessageRouter>,
    breaker: CircuitBreaker,
    backoff: BackoffPolicy,
    shutdown: CancellationToken,
    next_request_id: AtomicI32,
}

impl Application {
    pub fn new(config: GatewayConfig) -> Self {
        let state = Arc::new(StateManager::new(
            TradingMode::Sim,
            config.sim_reset.start_balance,
        ));
        let normalizer = Arc::new(Normalizer::new());
        let router = Arc::new(MessageRouter::new(normalizer.clone(), state.clone()));

        let breaker =
            CircuitBreaker::new(config.breaker.breaker_config()).with_transition_hook(|from, to| {
                metrics::set_breaker_state(&to.to_string());
                match to {
                    CircuitState::Open => warn!(%from, "Connection health degraded"),
                    CircuitState::Closed => info!(%from, "Connection health restored"),
                    CircuitState::HalfOpen => info!(%from, "Probing connection recovery"),
                }
            });

        let backoff = config.breaker.backoff_policy();

        Self {
            config,
            state,
            normalizer,
            router,
            breaker,
            backoff,
            shutdown: CancellationToken::new(),
            next_request_id: AtomicI32::new(1),
        }
    }

    /// Token to cancel the application from the outside (ctrl-c).
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    pub fn state(&self) -> Arc<StateManager> {
        self.state.clone()
    }

    pub fn router(&self) -> Arc<MessageRouter> {
        self.router.clone()
    }

    /// Run until shutdown, then export the ledger views.
    pub async fn run(&self) -> GatewayResult<()> {
        self.spawn_state_event_metrics();
        self.spawn_sim_reset();

        let transport_config = self.config.connection.transport_config();
        let credentials = self.config.connection.credentials();

        let mut attempt: u32 = 0;
        while !self.shutdown.is_cancelled() {
            let (event_tx, mut event_rx) = mpsc::channel(EVENT_BUFFER);

            let connected = self
                .breaker
                .call(|| {
                    desk_transport::connect(
                        &transport_config,
                        &credentials,
                        LengthPrefixedJson::default(),
                        event_tx,
                    )
                })
                .await;

            match connected {
                Ok(handle) => {
                    attempt = 0;
                    GATEWAY_CONNECTED.set(1.0);

                    if let Err(e) = self.bootstrap_requests(&handle).await {
                        warn!(?e, "Bootstrap requests failed");
                    }

                    let reason = self.pump(&handle, &mut event_rx).await;
                    GATEWAY_CONNECTED.set(0.0);
                    GATEWAY_RECONNECT_TOTAL
                        .with_label_values(&[reason_label(&reason)])
                        .inc();
                    info!(%reason, "Connection lost");
                }
                Err(BreakerError::Open { retry_after }) => {
                    info!(?retry_after, "Circuit open, holding off");
                    self.sleep_cancellable(retry_after).await;
                    continue;
                }
                Err(BreakerError::Operation(e)) => {
                    warn!(?e, "Connect attempt failed");
                }
            }

            if self.shutdown.is_cancelled() {
                break;
            }

            attempt += 1;
            let delay = self.backoff.delay_for(attempt);
            info!(attempt, delay_ms = delay.as_millis() as u64, "Reconnecting");
            self.sleep_cancellable(delay).await;
        }

        self.export_ledger()?;
        Ok(())
    }

    /// Ask the platform for the session's starting picture: trade
    /// accounts, open orders and current positions. The open-orders and
    /// positions request ids are registered so wrong-typed responses
    /// can be rejected.
    async fn bootstrap_requests(&self, handle: &TransportHandle) -> TransportResult<()> {
        let accounts_id = self.next_request_id.fetch_add(1, Ordering::Relaxed);
        handle
            .send(RawMessage::new(
                type_codes::TRADE_ACCOUNTS_REQUEST,
                json!({"RequestID": accounts_id}),
            ))
            .await?;

        let orders_id = self.next_request_id.fetch_add(1, Ordering::Relaxed);
        self.normalizer
            .register_request(orders_id, RequestKind::OpenOrders);
        handle
            .send(RawMessage::new(
                type_codes::OPEN_ORDERS_REQUEST,
                json!({"RequestID": orders_id, "RequestAllOrders": 1}),
            ))
            .await?;

        let positions_id = self.next_request_id.fetch_add(1, Ordering::Relaxed);
        self.normalizer
            .register_request(positions_id, RequestKind::Positions);
        handle
            .send(RawMessage::new(
                type_codes::CURRENT_POSITIONS_REQUEST,
                json!({"RequestID": positions_id}),
            ))
            .await?;

        Ok(())
    }

    /// Feed transport events to the router until the terminal
    /// disconnect event arrives.
    async fn pump(
        &self,
        handle: &TransportHandle,
        event_rx: &mut mpsc::Receiver<TransportEvent>,
    ) -> DisconnectReason {
        let mut shutdown_requested = false;
        loop {
            tokio::select! {
                () = self.shutdown.cancelled(), if !shutdown_requested => {
                    // Ask the transport to stop, then keep draining
                    // until its terminal event.
                    shutdown_requested = true;
                    handle.shutdown();
                }
                event = event_rx.recv() => match event {
                    Some(TransportEvent::Message(raw)) => self.router.handle_raw(raw),
                    Some(TransportEvent::Disconnected(reason)) => return reason,
                    None => return DisconnectReason::Cancelled,
                }
            }
        }
    }

    fn spawn_state_event_metrics(&self) {
        let mut events = self.state.subscribe();
        let token = self.shutdown.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    () = token.cancelled() => break,
                    event = events.recv() => match event {
                        Some(event) => {
                            GATEWAY_STATE_EVENTS_TOTAL
                                .with_label_values(&[event.kind_name()])
                                .inc();
                        }
                        None => break,
                    }
                }
            }
        });
    }

    fn spawn_sim_reset(&self) {
        if !self.config.sim_reset.enabled {
            return;
        }
        let state = self.state.clone();
        let value = self.config.sim_reset.start_balance;
        let every = Duration::from_secs(self.config.sim_reset.interval_hours * 3600);
        let token = self.shutdown.clone();

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            // The first tick fires immediately; skip it.
            ticker.tick().await;
            loop {
                tokio::select! {
                    () = token.cancelled() => break,
                    _ = ticker.tick() => {
                        info!(%value, "Periodic SIM balance reset");
                        state.reset_mode_balance(TradingMode::Sim, value);
                    }
                }
            }
        });
    }

    async fn sleep_cancellable(&self, delay: Duration) {
        tokio::select! {
            () = self.shutdown.cancelled() => {}
            () = tokio::time::sleep(delay) => {}
        }
    }

    /// Write the three ledger views to the export directory.
    fn export_ledger(&self) -> GatewayResult<()> {
        let updates = self.router.order_updates();
        if updates.is_empty() {
            info!("No order updates recorded, skipping ledger export");
            return Ok(());
        }

        let dir = Path::new(&self.config.ledger.export_dir);
        std::fs::create_dir_all(dir)?;
        let delimiter = self.config.ledger.delimiter;

        let ledger = build_ledger(&updates);
        let latest = snapshot(&updates);
        let fills = fill_stream(&updates);

        let mut out = std::fs::File::create(dir.join("ledger.tsv"))?;
        write_ledger(&mut out, &ledger, delimiter)?;
        let mut out = std::fs::File::create(dir.join("snapshot.tsv"))?;
        write_ledger(&mut out, &latest, delimiter)?;
        let mut out = std::fs::File::create(dir.join("fills.tsv"))?;
        write_fills(&mut out, &fills, delimiter)?;

        let mut jsonl = JsonLinesWriter::open(&dir.join("ledger.jsonl"))?;
        jsonl.write_all(&ledger)?;

        info!(
            orders = ledger.len(),
            fills = fills.len(),
            dir = %dir.display(),
            "Ledger exported"
        );
        Ok(())
    }
}

fn reason_label(reason: &DisconnectReason) -> &'static str {
    match reason {
        DisconnectReason::RemoteClosed => "remote_closed",
        DisconnectReason::HeartbeatTimeout => "heartbeat_timeout",
        DisconnectReason::Io(_) => "io",
        DisconnectReason::Cancelled => "cancelled",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use desk_breaker::BreakerConfig;
    use desk_transport::Credentials;
    use futures_util::{SinkExt, StreamExt};
    use tokio::net::{TcpListener, TcpStream};
    use tokio_util::codec::Framed;

    /// One scripted platform session: accept, answer the logon, serve
    /// the given frames, then close.
    async fn scripted_platform(frames: Vec<RawMessage>) -> u16 {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut framed: Framed<TcpStream, LengthPrefixedJson> =
                Framed::new(stream, LengthPrefixedJson::default());

            let logon = framed.next().await.unwrap().unwrap();
            assert_eq!(logon.type_code, type_codes::LOGON_REQUEST);
            framed
                .send(RawMessage::new(
                    type_codes::LOGON_RESPONSE,
                    json!({"Result": 1}),
                ))
                .await
                .unwrap();

            for frame in frames {
                framed.send(frame).await.unwrap();
            }
            // Give the client time to drain before the socket drops.
            tokio::time::sleep(Duration::from_millis(100)).await;
        });
        port
    }

    fn app_for_port(port: u16) -> Application {
        let mut config = GatewayConfig::default();
        config.connection.port = port;
        config.connection.username = "user".to_string();
        config.connection.password = "pw".to_string();
        config.connection.trade_account = Some("Sim1".to_string());
        config.sim_reset.enabled = false;
        Application::new(config)
    }

    #[tokio::test]
    async fn test_connect_pump_and_route() {
        let port = scripted_platform(vec![
            RawMessage::new(
                type_codes::ACCOUNT_BALANCE_UPDATE,
                json!({"TradeAccount": "Sim1", "CashBalance": 98000.0}),
            ),
            RawMessage::new(
                type_codes::POSITION_UPDATE,
                json!({
                    "TradeAccount": "Sim1",
                    "Symbol": "ESZ5",
                    "Quantity": 1,
                    "AveragePrice": 5000.0,
                }),
            ),
        ])
        .await;

        let app = app_for_port(port);
        let (event_tx, mut event_rx) = mpsc::channel(EVENT_BUFFER);
        let handle = desk_transport::connect(
            &app.config.connection.transport_config(),
            &Credentials {
                username: "user".to_string(),
                password: "pw".to_string(),
                trade_account: Some("Sim1".to_string()),
            },
            LengthPrefixedJson::default(),
            event_tx,
        )
        .await
        .unwrap();

        app.bootstrap_requests(&handle).await.unwrap();
        let reason = app.pump(&handle, &mut event_rx).await;

        assert_eq!(reason, DisconnectReason::RemoteClosed);
        assert_eq!(
            app.state.balance(TradingMode::Sim),
            Some(rust_decimal::Decimal::from(98000))
        );
        assert!(app.state.position().is_some());
    }

    #[tokio::test]
    async fn test_consecutive_connect_failures_trip_breaker() {
        // Grab a port with no listener behind it.
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let mut config = GatewayConfig::default();
        config.connection.port = port;
        config.connection.connect_timeout_ms = 500;
        let transport_config = config.connection.transport_config();
        let credentials = config.connection.credentials();

        let breaker = CircuitBreaker::new(BreakerConfig {
            failure_threshold: 5,
            recovery_timeout: Duration::from_secs(60),
        });

        for _ in 0..5 {
            let (event_tx, _event_rx) = mpsc::channel(8);
            let result = breaker
                .call(|| {
                    desk_transport::connect(
                        &transport_config,
                        &credentials,
                        LengthPrefixedJson::default(),
                        event_tx,
                    )
                })
                .await;
            assert!(matches!(result, Err(BreakerError::Operation(_))));
        }
        assert_eq!(breaker.state(), CircuitState::Open);

        // Sixth call: rejected without a network attempt.
        let (event_tx, _event_rx) = mpsc::channel(8);
        let result = breaker
            .call(|| {
                desk_transport::connect(
                    &transport_config,
                    &credentials,
                    LengthPrefixedJson::default(),
                    event_tx,
                )
            })
            .await;
        assert!(matches!(result, Err(BreakerError::Open { .. })));
    }

    #[tokio::test]
    async fn test_shutdown_ends_pump() {
        // A platform that stays silent after logon.
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut framed: Framed<TcpStream, LengthPrefixedJson> =
                Framed::new(stream, LengthPrefixedJson::default());
            let _ = framed.next().await;
            framed
                .send(RawMessage::new(
                    type_codes::LOGON_RESPONSE,
                    json!({"Result": 1}),
                ))
                .await
                .unwrap();
            while let Some(Ok(_)) = framed.next().await {}
        });

        let app = app_for_port(port);
        let (event_tx, mut event_rx) = mpsc::channel(EVENT_BUFFER);
        let handle = desk_transport::connect(
            &app.config.connection.transport_config(),
            &app.config.connection.credentials(),
            LengthPrefixedJson::default(),
            event_tx,
        )
        .await
        .unwrap();

        let token = app.shutdown_token();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            token.cancel();
        });

        let reason = tokio::time::timeout(
            Duration::from_secs(2),
            app.pump(&handle, &mut event_rx),
        )
        .await
        .expect("pump must end after shutdown");
        assert_eq!(reason, DisconnectReason::Cancelled);
    }
}
