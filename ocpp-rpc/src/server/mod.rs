//! WebSocket transport server
//!
//! Accepts station upgrades, negotiates the OCPP sub-protocol, routes the
//! connection by its path and drives the socket for the connection's lifetime.
//! A background sweep pings idle stations and expires overdue calls.

pub mod route;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch};
use tokio::time::{Instant, MissedTickBehavior};
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::{header, HeaderValue, StatusCode};
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::{CloseFrame, WebSocketConfig};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{accept_hdr_async_with_config, WebSocketStream};
use tracing::{debug, error, info, warn, Instrument};

use crate::client::StationClient;
use crate::config::ServerConfig;
use crate::error::ServerError;
use crate::ocpp::Frame;
use crate::rpc::{
    CloseReason, CommandHandlers, Connection, ConnectionContext, ConnectionRegistry, Liveness,
    Outbound,
};
use route::Route;

type WsStream = WebSocketStream<TcpStream>;

/// How long a rejected socket may take to acknowledge the close
const REJECT_LINGER: Duration = Duration::from_secs(2);

/// Pause after a failed accept (e.g. out of file descriptors)
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

/// What the upgrade callback saw
struct Handshake {
    path: String,
    protocol: Option<String>,
}

/// Sub-protocol decision for one upgrade request
#[derive(Debug, PartialEq, Eq)]
enum Negotiation {
    Selected(String),
    /// The station offered no sub-protocol at all
    NotOffered,
    /// The station offered only protocols this server does not speak
    Unsupported,
}

fn negotiate(config: &ServerConfig, request: &Request) -> Negotiation {
    let offered: Vec<&str> = request
        .headers()
        .get_all(header::SEC_WEBSOCKET_PROTOCOL)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(','))
        .map(str::trim)
        .filter(|offer| !offer.is_empty())
        .collect();

    if offered.is_empty() {
        return Negotiation::NotOffered;
    }
    match config.negotiate_protocol(offered) {
        Some(protocol) => Negotiation::Selected(protocol),
        None => Negotiation::Unsupported,
    }
}

/// HTTP refusal for an upgrade that offered no supported sub-protocol
fn unsupported_protocol_response(config: &ServerConfig) -> ErrorResponse {
    let body = format!(
        "unsupported sub-protocol, expected one of: {}",
        config.protocols.join(", ")
    );
    let mut response = ErrorResponse::new(Some(body));
    *response.status_mut() = StatusCode::BAD_REQUEST;
    response
}

/// Stops a running [`TransportServer`]
#[derive(Debug, Clone)]
pub struct ShutdownHandle {
    tx: watch::Sender<bool>,
}

impl ShutdownHandle {
    pub fn shutdown(&self) {
        self.tx.send_replace(true);
    }
}

/// Outcome of one liveness sweep
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LivenessReport {
    pub pinged: usize,
    pub terminated: usize,
}

pub struct TransportServer {
    config: Arc<ServerConfig>,
    listener: TcpListener,
    registry: Arc<ConnectionRegistry>,
    handlers: Arc<CommandHandlers>,
    shutdown: watch::Sender<bool>,
}

impl TransportServer {
    /// Bind the listen socket
    pub async fn bind(
        config: ServerConfig,
        registry: Arc<ConnectionRegistry>,
        handlers: CommandHandlers,
    ) -> Result<Self, ServerError> {
        let listener = TcpListener::bind(config.bind_addr).await?;
        info!(
            addr = %listener.local_addr()?,
            base_path = %config.base_path,
            protocols = ?config.protocols,
            "OCPP transport listening"
        );

        Ok(Self {
            config: Arc::new(config),
            listener,
            registry,
            handlers: Arc::new(handlers),
            shutdown: watch::Sender::new(false),
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr, ServerError> {
        Ok(self.listener.local_addr()?)
    }

    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.registry
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub fn shutdown_handle(&self) -> ShutdownHandle {
        ShutdownHandle {
            tx: self.shutdown.clone(),
        }
    }

    /// Client for one station that uses the configured call timeout
    pub fn station_client(
        &self,
        tenant_id: impl Into<String>,
        station_identity: impl Into<String>,
    ) -> StationClient {
        StationClient::new(Arc::clone(&self.registry), tenant_id, station_identity)
            .with_timeout(self.config.call_timeout)
    }

    /// Accept stations until shut down, then close every connection with 1001
    pub async fn run(&self) -> Result<(), ServerError> {
        let mut shutdown_rx = self.shutdown.subscribe();
        let sweeper = tokio::spawn(sweep_loop(
            Arc::clone(&self.registry),
            Arc::clone(&self.config),
        ));

        loop {
            if *shutdown_rx.borrow_and_update() {
                break;
            }

            tokio::select! {
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        debug!(%peer, "TCP connection accepted");
                        tokio::spawn(handle_socket(
                            stream,
                            peer,
                            Arc::clone(&self.config),
                            Arc::clone(&self.registry),
                            Arc::clone(&self.handlers),
                            self.shutdown.subscribe(),
                        ));
                    }
                    Err(e) => {
                        error!("Accept error: {}", e);
                        tokio::time::sleep(ACCEPT_BACKOFF).await;
                    }
                },
                _ = shutdown_rx.changed() => {}
            }
        }

        sweeper.abort();
        let closed = self.registry.close_all(CloseReason::GoingAway);
        info!(closed, "OCPP transport stopped");
        Ok(())
    }

    /// Send `frame` to every open connection, returns how many accepted it
    pub fn broadcast(&self, frame: &Frame) -> usize {
        broadcast(&self.registry, frame)
    }
}

/// Send `frame` to every open connection in `registry`
pub fn broadcast(registry: &ConnectionRegistry, frame: &Frame) -> usize {
    let text = match frame.encode() {
        Ok(text) => text,
        Err(e) => {
            warn!(error = %e, "broadcast frame does not encode");
            return 0;
        }
    };

    let mut delivered = 0;
    for connection in registry.connections() {
        if !connection.is_open() {
            continue;
        }
        if connection.send_text(text.clone()) {
            delivered += 1;
        } else {
            warn!(station = %connection.key(), "broadcast to station failed");
        }
    }

    debug!(delivered, "broadcast sent");
    delivered
}

/// Register a freshly upgraded connection unless the server is stopping.
///
/// A socket whose handshake finished after shutdown began is closed with
/// `GoingAway` instead of staying live without sweeps.
fn admit(
    registry: &Arc<ConnectionRegistry>,
    connection: &Arc<Connection>,
    shutdown: &watch::Receiver<bool>,
) -> bool {
    registry.register(Arc::clone(connection));
    if *shutdown.borrow() {
        connection.close(CloseReason::GoingAway);
        return false;
    }
    true
}

/// Ping idle connections and terminate the ones that missed too many intervals
pub fn sweep_liveness(registry: &ConnectionRegistry, now: Instant, config: &ServerConfig) -> LivenessReport {
    let mut report = LivenessReport::default();

    for connection in registry.connections() {
        match connection.check_liveness(now, config.ping_interval, config.max_missed_pings) {
            Liveness::Alive => {}
            Liveness::Idle => {
                if connection.ping() {
                    report.pinged += 1;
                }
            }
            Liveness::Dead => {
                warn!(station = %connection.key(), "station unresponsive, terminating");
                connection.close(CloseReason::Unresponsive);
                report.terminated += 1;
            }
        }
    }
    report
}

/// Settle overdue pending calls on every connection
pub fn sweep_calls(registry: &ConnectionRegistry, now: Instant) -> usize {
    registry
        .connections()
        .iter()
        .map(|connection| connection.expire_calls(now))
        .sum()
}

async fn sweep_loop(registry: Arc<ConnectionRegistry>, config: Arc<ServerConfig>) {
    let mut ping_tick = tokio::time::interval(config.ping_interval);
    let mut call_tick = tokio::time::interval(config.call_sweep_interval);
    ping_tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
    call_tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

    // First tick completes immediately
    ping_tick.tick().await;
    call_tick.tick().await;

    loop {
        tokio::select! {
            _ = ping_tick.tick() => {
                let report = sweep_liveness(&registry, Instant::now(), &config);
                if report != LivenessReport::default() {
                    debug!(pinged = report.pinged, terminated = report.terminated, "liveness sweep");
                }
            }
            _ = call_tick.tick() => {
                let expired = sweep_calls(&registry, Instant::now());
                if expired > 0 {
                    debug!(expired, "expired overdue calls");
                }
            }
        }
    }
}

fn close_frame(reason: CloseReason) -> CloseFrame<'static> {
    CloseFrame {
        code: CloseCode::from(reason.code()),
        reason: reason.description().into(),
    }
}

async fn handle_socket(
    stream: TcpStream,
    peer: SocketAddr,
    config: Arc<ServerConfig>,
    registry: Arc<ConnectionRegistry>,
    handlers: Arc<CommandHandlers>,
    shutdown: watch::Receiver<bool>,
) {
    let mut handshake = None;
    let callback = |request: &Request, mut response: Response| -> Result<Response, ErrorResponse> {
        let protocol = match negotiate(&config, request) {
            Negotiation::Selected(protocol) => Some(protocol),
            Negotiation::NotOffered => None,
            Negotiation::Unsupported => {
                warn!(%peer, path = %request.uri().path(), "no supported sub-protocol offered");
                return Err(unsupported_protocol_response(&config));
            }
        };

        if let Some(value) = protocol.as_deref().and_then(|p| HeaderValue::from_str(p).ok()) {
            response
                .headers_mut()
                .insert(header::SEC_WEBSOCKET_PROTOCOL, value);
        }

        handshake = Some(Handshake {
            path: request.uri().path().to_string(),
            protocol,
        });
        Ok(response)
    };

    let ws_config = WebSocketConfig {
        max_message_size: Some(config.max_message_size),
        max_frame_size: Some(config.max_message_size),
        ..Default::default()
    };

    let accepted = accept_hdr_async_with_config(stream, callback, Some(ws_config)).await;
    let mut ws = match accepted {
        Ok(ws) => ws,
        Err(e) => {
            warn!(%peer, "WebSocket handshake failed: {}", e);
            return;
        }
    };
    let Some(handshake) = handshake else {
        return;
    };

    let Some(protocol) = handshake.protocol else {
        warn!(%peer, path = %handshake.path, "no sub-protocol offered");
        reject(&mut ws, CloseReason::UnsupportedProtocol).await;
        return;
    };

    let route = match Route::parse(&handshake.path, &config.base_path) {
        Ok(route) => route,
        Err(e) => {
            warn!(%peer, path = %handshake.path, "rejecting connection: {}", e);
            reject(&mut ws, CloseReason::InvalidPath).await;
            return;
        }
    };

    let context = ConnectionContext {
        tenant_id: route.tenant_id,
        station_identity: route.station_identity,
        site_area_id: route.site_area_id,
        site_id: route.site_id,
        company_id: route.company_id,
        protocol,
        remote_addr: Some(peer),
    };

    let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
    let connection = Connection::new(context, handlers, outbound_tx);
    let span = connection.span().clone();
    info!(parent: &span, %peer, protocol = %connection.context().protocol, "station connected");

    let (sink, source) = ws.split();
    let writer = tokio::spawn(
        write_loop(Arc::clone(&connection), sink, outbound_rx).instrument(span.clone()),
    );

    if admit(&registry, &connection, &shutdown) {
        read_loop(&connection, source).instrument(span).await;
    }

    connection.close(CloseReason::Remote);
    let _ = writer.await;
}

/// Close a socket that never became a connection
async fn reject(ws: &mut WsStream, reason: CloseReason) {
    if let Err(e) = ws.close(Some(close_frame(reason))).await {
        debug!("close after rejection failed: {}", e);
    }
    // Drain until the peer acknowledges or drops
    let drain = async { while let Some(Ok(_)) = ws.next().await {} };
    let _ = tokio::time::timeout(REJECT_LINGER, drain).await;
}

async fn read_loop(connection: &Arc<Connection>, mut source: SplitStream<WsStream>) {
    loop {
        tokio::select! {
            message = source.next() => match message {
                Some(Ok(Message::Text(text))) => connection.on_message(&text),
                Some(Ok(Message::Ping(_))) | Some(Ok(Message::Pong(_))) => connection.touch(),
                Some(Ok(Message::Binary(_))) => {
                    connection.touch();
                    warn!("ignoring binary frame");
                }
                Some(Ok(Message::Close(frame))) => {
                    info!(?frame, "station closed the connection");
                    break;
                }
                Some(Ok(Message::Frame(_))) => {}
                Some(Err(e)) => {
                    warn!("WebSocket error: {}", e);
                    break;
                }
                None => break,
            },
            _ = connection.closed() => break,
        }
    }
}

async fn write_loop(
    connection: Arc<Connection>,
    mut sink: SplitSink<WsStream, Message>,
    mut outbound: mpsc::UnboundedReceiver<Outbound>,
) {
    loop {
        let next = tokio::select! {
            biased;
            next = outbound.recv() => next,
            _ = connection.closed() => {
                // Flush what was queued before the close, close frame included
                while let Ok(message) = outbound.try_recv() {
                    if !write_one(&mut sink, message).await {
                        break;
                    }
                }
                break;
            }
        };

        match next {
            Some(message) => {
                if !write_one(&mut sink, message).await {
                    break;
                }
            }
            None => break,
        }
    }

    if let Err(e) = sink.close().await {
        debug!("sink close failed: {}", e);
    }
    connection.close(CloseReason::Remote);
}

/// Write one outbound message, false once the socket is done
async fn write_one(sink: &mut SplitSink<WsStream, Message>, message: Outbound) -> bool {
    let (message, last) = match message {
        Outbound::Text(text) => (Message::Text(text), false),
        Outbound::Ping => (Message::Ping(Vec::new()), false),
        Outbound::Close(reason) => (Message::Close(Some(close_frame(reason))), true),
    };

    match sink.send(message).await {
        Ok(()) => !last,
        Err(e) => {
            warn!("WebSocket send failed: {}", e);
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ocpp::Call;
    use serde_json::json;

    fn registered(
        registry: &Arc<ConnectionRegistry>,
        station: &str,
    ) -> (Arc<Connection>, mpsc::UnboundedReceiver<Outbound>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let connection = Connection::new(
            ConnectionContext::new("tenantA", station),
            Arc::new(CommandHandlers::new()),
            tx,
        );
        registry.register(connection.clone());
        (connection, rx)
    }

    #[tokio::test(start_paused = true)]
    async fn test_sweep_pings_then_terminates() {
        let registry = Arc::new(ConnectionRegistry::new());
        let config = ServerConfig::default()
            .with_ping_interval(Duration::from_secs(30))
            .with_max_missed_pings(2);
        let (connection, mut rx) = registered(&registry, "CS-1");

        assert_eq!(sweep_liveness(&registry, Instant::now(), &config), LivenessReport::default());

        tokio::time::advance(Duration::from_secs(30)).await;
        let report = sweep_liveness(&registry, Instant::now(), &config);
        assert_eq!(report.pinged, 1);
        assert_eq!(rx.recv().await, Some(Outbound::Ping));

        tokio::time::advance(Duration::from_secs(30)).await;
        let report = sweep_liveness(&registry, Instant::now(), &config);
        assert_eq!(report.terminated, 1);
        assert_eq!(rx.recv().await, Some(Outbound::Close(CloseReason::Unresponsive)));
        assert!(!connection.is_open());
        assert!(registry.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_pong_keeps_connection_alive() {
        let registry = Arc::new(ConnectionRegistry::new());
        let config = ServerConfig::default().with_max_missed_pings(2);
        let (connection, _rx) = registered(&registry, "CS-1");

        for _ in 0..4 {
            tokio::time::advance(config.ping_interval).await;
            sweep_liveness(&registry, Instant::now(), &config);
            connection.touch();
        }
        assert!(connection.is_open());
    }

    #[tokio::test(start_paused = true)]
    async fn test_sweep_calls_expires_overdue() {
        let registry = Arc::new(ConnectionRegistry::new());
        let (connection, _rx) = registered(&registry, "CS-1");

        let call = tokio::spawn({
            let connection = connection.clone();
            async move {
                connection
                    .send_call("Reset", json!({"type": "Soft"}), Duration::from_secs(5))
                    .await
            }
        });
        tokio::task::yield_now().await;
        assert_eq!(connection.pending_calls(), 1);

        assert_eq!(sweep_calls(&registry, Instant::now()), 0);
        assert_eq!(
            sweep_calls(&registry, Instant::now() + Duration::from_secs(6)),
            1
        );
        assert!(matches!(
            call.await.unwrap(),
            Err(crate::error::RpcError::Timeout)
        ));
    }

    #[tokio::test]
    async fn test_broadcast_skips_closed() {
        let registry = Arc::new(ConnectionRegistry::new());
        let (_a, mut a_rx) = registered(&registry, "CS-1");
        let (b, _b_rx) = registered(&registry, "CS-2");
        b.shutdown(CloseReason::Normal);

        let frame: Frame = Call::new("TriggerMessage", json!({"requestedMessage": "Heartbeat"})).into();
        assert_eq!(broadcast(&registry, &frame), 1);

        match a_rx.recv().await {
            Some(Outbound::Text(text)) => assert!(text.contains("TriggerMessage")),
            other => panic!("expected text frame, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_broadcast_continues_past_failed_send() {
        let registry = Arc::new(ConnectionRegistry::new());
        let (_a, a_rx) = registered(&registry, "CS-1");
        let (b, mut b_rx) = registered(&registry, "CS-2");
        drop(a_rx);

        let frame: Frame = Call::new("ClearCache", json!({})).into();
        assert_eq!(broadcast(&registry, &frame), 1);
        assert!(b.is_open());

        match b_rx.recv().await {
            Some(Outbound::Text(text)) => assert!(text.contains("ClearCache")),
            other => panic!("expected text frame, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_admit_after_shutdown_closes_going_away() {
        let registry = Arc::new(ConnectionRegistry::new());
        let (tx, mut rx) = mpsc::unbounded_channel();
        let connection = Connection::new(
            ConnectionContext::new("tenantA", "CS-1"),
            Arc::new(CommandHandlers::new()),
            tx,
        );
        let (stop, shutdown) = watch::channel(false);
        stop.send_replace(true);

        assert!(!admit(&registry, &connection, &shutdown));
        assert!(!connection.is_open());
        assert!(registry.is_empty());
        assert_eq!(rx.recv().await, Some(Outbound::Close(CloseReason::GoingAway)));
    }

    #[tokio::test]
    async fn test_admit_while_running_registers() {
        let registry = Arc::new(ConnectionRegistry::new());
        let (tx, _rx) = mpsc::unbounded_channel();
        let connection = Connection::new(
            ConnectionContext::new("tenantA", "CS-1"),
            Arc::new(CommandHandlers::new()),
            tx,
        );
        let (_stop, shutdown) = watch::channel(false);

        assert!(admit(&registry, &connection, &shutdown));
        assert!(connection.is_open());
        assert_eq!(registry.len(), 1);
    }

    fn upgrade_request(protocols: Option<&str>) -> Request {
        let mut builder = Request::builder().uri("/ocpp/tenantA/CS-1/a/s/c");
        if let Some(protocols) = protocols {
            builder = builder.header(header::SEC_WEBSOCKET_PROTOCOL, protocols);
        }
        builder.body(()).unwrap()
    }

    #[test]
    fn test_negotiate_outcomes() {
        let config = ServerConfig::default().with_protocols(["ocpp1.6"]);

        assert_eq!(
            negotiate(&config, &upgrade_request(Some("ocpp9.9, ocpp1.6"))),
            Negotiation::Selected("ocpp1.6".to_string())
        );
        assert_eq!(negotiate(&config, &upgrade_request(None)), Negotiation::NotOffered);
        assert_eq!(
            negotiate(&config, &upgrade_request(Some("ocpp9.9"))),
            Negotiation::Unsupported
        );

        let response = unsupported_protocol_response(&config);
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert!(response.body().as_deref().unwrap().contains("ocpp1.6"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_station_client_uses_configured_timeout() {
        let registry = Arc::new(ConnectionRegistry::new());
        let config = ServerConfig::new("127.0.0.1:0".parse().unwrap())
            .with_call_timeout(Duration::from_secs(3));
        let server = TransportServer::bind(config, registry.clone(), CommandHandlers::new())
            .await
            .unwrap();
        let (_connection, _rx) = registered(&registry, "CS-1");

        let client = server.station_client("tenantA", "CS-1");
        assert_eq!(client.timeout(), Duration::from_secs(3));

        let started = Instant::now();
        let result = client.clear_cache().await;
        assert!(matches!(result, Err(crate::error::RpcError::Timeout)));
        let elapsed = started.elapsed();
        assert!(elapsed >= Duration::from_secs(3));
        assert!(elapsed < Duration::from_secs(30));
    }
}
