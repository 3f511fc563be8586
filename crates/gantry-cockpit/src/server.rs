//! [`CockpitServer`] – WebSocket + minimal HTTP edge for the fan-out hub.
//!
//! Listens on `0.0.0.0:4000` (configurable via [`CockpitServer::with_port`]).
//!
//! * WebSocket upgrades → one [`FanoutHub`] client per connection, framed as
//!   `{"event": …, "data": …}` JSON text messages.
//! * Plain HTTP → a handful of JSON endpoints:
//!
//! | Route | Success | Failure |
//! |---|---|---|
//! | `GET /api/read/all` | `200` sensor array | `503` unavailable, `504` timeout, `500` otherwise |
//! | `GET /api/control/<action>` | `200 {message}` | `400` unknown action, `503`, `502` rejected write, `504` |
//! | `GET /api/health` | `200 {state, clients}` | |
//!
//! Anything else is `404`; non-`GET` methods are `405`.

use std::future::Future;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};

use futures_util::{SinkExt, StreamExt};
use gantry_types::{ClientMessage, GantryError};
use serde_json::{Value, json};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::{accept_async, tungstenite::Message};
use tracing::{debug, info, warn};

use crate::hub::{ClientHandle, ClientId, FanoutHub};

/// Default TCP port, matching the original deployment's API port.
pub const DEFAULT_PORT: u16 = 4000;

/// Largest HTTP request head accepted.
const MAX_REQUEST_HEAD: usize = 8 * 1024;

// ---------------------------------------------------------------------------
// CockpitServer
// ---------------------------------------------------------------------------

pub struct CockpitServer {
    hub: FanoutHub,
    host: IpAddr,
    port: u16,
}

impl CockpitServer {
    /// Create a server for `hub` on `0.0.0.0:`[`DEFAULT_PORT`].
    pub fn new(hub: FanoutHub) -> Self {
        Self {
            hub,
            host: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            port: DEFAULT_PORT,
        }
    }

    /// Override the listening port.  `0` picks a free port at bind time.
    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    pub fn with_host(mut self, host: IpAddr) -> Self {
        self.host = host;
        self
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// Bind the listener without accepting yet.
    ///
    /// # Errors
    ///
    /// [`GantryError::Config`] if the address cannot be bound.
    pub async fn bind(self) -> Result<BoundCockpit, GantryError> {
        let addr = SocketAddr::new(self.host, self.port);
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| GantryError::Config(format!("cannot bind {addr}: {e}")))?;
        let local_addr = listener
            .local_addr()
            .map_err(|e| GantryError::Config(format!("cannot read bound address: {e}")))?;
        Ok(BoundCockpit {
            hub: self.hub,
            listener,
            local_addr,
        })
    }

    /// Bind and serve forever.
    pub async fn run(self) -> Result<(), GantryError> {
        self.bind()
            .await?
            .serve_until(std::future::pending())
            .await
    }
}

/// A bound, not yet serving, cockpit listener.
pub struct BoundCockpit {
    hub: FanoutHub,
    listener: TcpListener,
    local_addr: SocketAddr,
}

impl BoundCockpit {
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Accept connections until `shutdown` resolves.  Connections already
    /// accepted keep running on their own tasks.
    pub async fn serve_until<F>(self, shutdown: F) -> Result<(), GantryError>
    where
        F: Future<Output = ()> + Send,
    {
        info!(addr = %self.local_addr, "cockpit listening");
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    info!("cockpit stopped accepting connections");
                    return Ok(());
                }
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        let hub = self.hub.clone();
                        tokio::spawn(async move {
                            if let Err(e) = handle_connection(stream, peer, hub).await {
                                debug!(peer = %peer, error = %e, "connection ended with error");
                            }
                        });
                    }
                    Err(e) => warn!(error = %e, "accept error"),
                }
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Per-connection handler
// ---------------------------------------------------------------------------

async fn handle_connection(
    stream: TcpStream,
    peer: SocketAddr,
    hub: FanoutHub,
) -> Result<(), GantryError> {
    // `peek` leaves the request in the socket for the handshake or the HTTP
    // reader.
    let mut buf = [0u8; 1024];
    let n = stream
        .peek(&mut buf)
        .await
        .map_err(|e| GantryError::Transport(format!("peek error from {peer}: {e}")))?;

    let head = String::from_utf8_lossy(&buf[..n]);
    let is_ws_upgrade = head.lines().any(|line| {
        let line = line.to_ascii_lowercase();
        line.starts_with("upgrade:") && line.contains("websocket")
    });

    if is_ws_upgrade {
        handle_ws(stream, peer, hub).await
    } else {
        serve_http(stream, &hub).await
    }
}

// ---------------------------------------------------------------------------
// WebSocket: one hub client per connection
// ---------------------------------------------------------------------------

async fn handle_ws(stream: TcpStream, peer: SocketAddr, hub: FanoutHub) -> Result<(), GantryError> {
    let ws_stream = accept_async(stream)
        .await
        .map_err(|e| GantryError::Transport(format!("ws handshake from {peer}: {e}")))?;
    let (mut ws_tx, mut ws_rx) = ws_stream.split();

    let ClientHandle { id, mut rx } = hub.on_client_connect().await;
    debug!(client = %id, peer = %peer, "ws client attached");

    loop {
        tokio::select! {
            // ── Downstream: hub → browser ─────────────────────────────────
            outbound = rx.recv() => {
                let Some(message) = outbound else { break };
                match serde_json::to_string(&message) {
                    Ok(json) => {
                        if ws_tx.send(Message::Text(json.into())).await.is_err() {
                            break;
                        }
                    }
                    Err(e) => warn!(client = %id, error = %e, "serialization error"),
                }
            }
            // ── Upstream: browser → hub ───────────────────────────────────
            inbound = ws_rx.next() => {
                match inbound {
                    Some(Ok(Message::Text(text))) => handle_client_frame(text.as_str(), id, &hub),
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Err(e)) => {
                        debug!(client = %id, error = %e, "ws read error");
                        break;
                    }
                    _ => {}
                }
            }
        }
    }

    hub.on_client_disconnect(id);
    Ok(())
}

/// Parse one client frame and hand it to the hub.  Actions run on their own
/// task so the connection keeps draining outbound frames meanwhile.
///
/// A `control` frame always gets a `controlResponse`, even when its payload
/// is malformed.  Any other unparseable frame is ignored.
pub(crate) fn handle_client_frame(text: &str, client: ClientId, hub: &FanoutHub) {
    let message = match serde_json::from_str::<ClientMessage>(text) {
        Ok(message) => message,
        Err(e) => match loose_control_action(text) {
            Some(action) => {
                debug!(client = %client, error = %e, "malformed control frame");
                ClientMessage::Control { action }
            }
            None => {
                debug!(client = %client, error = %e, "ignoring unparseable frame");
                return;
            }
        },
    };

    let hub = hub.clone();
    match message {
        ClientMessage::Control { action } => {
            tokio::spawn(async move {
                hub.on_client_action(client, &action).await;
            });
        }
        ClientMessage::ReadAllSensors => {
            tokio::spawn(async move {
                hub.on_read_request(client).await;
            });
        }
    }
}

/// The action of a `control` frame whose payload does not deserialize: the
/// raw `action` value as text, or empty when absent.  `None` for any other
/// event.
fn loose_control_action(text: &str) -> Option<String> {
    let frame: Value = serde_json::from_str(text).ok()?;
    if frame.get("event")?.as_str()? != "control" {
        return None;
    }
    let action = match frame.get("data").and_then(|d| d.get("action")) {
        Some(Value::String(action)) => action.clone(),
        Some(other) => other.to_string(),
        None => String::new(),
    };
    Some(action)
}

// ---------------------------------------------------------------------------
// Plain HTTP
// ---------------------------------------------------------------------------

#[derive(Debug, PartialEq)]
pub(crate) struct HttpResponse {
    pub status: u16,
    pub body: Value,
}

impl HttpResponse {
    fn new(status: u16, body: Value) -> Self {
        Self { status, body }
    }

    fn error(status: u16, error: &GantryError) -> Self {
        Self::new(status, json!({ "error": error.kind(), "details": error.to_string() }))
    }
}

fn reason(status: u16) -> &'static str {
    match status {
        200 => "OK",
        400 => "Bad Request",
        404 => "Not Found",
        405 => "Method Not Allowed",
        500 => "Internal Server Error",
        502 => "Bad Gateway",
        503 => "Service Unavailable",
        504 => "Gateway Timeout",
        _ => "Unknown",
    }
}

/// HTTP status for a failed core call.
fn status_for(error: &GantryError) -> u16 {
    match error {
        GantryError::InvalidAction(_) => 400,
        GantryError::SessionUnavailable => 503,
        GantryError::WriteRejected { .. } => 502,
        GantryError::Timeout(_) => 504,
        _ => 500,
    }
}

/// `(method, path)` from the request line, with any query string removed.
pub(crate) fn parse_request_line(head: &str) -> Option<(&str, &str)> {
    let mut parts = head.lines().next()?.split_whitespace();
    let method = parts.next()?;
    let target = parts.next()?;
    let path = target.split('?').next().unwrap_or(target);
    Some((method, path))
}

pub(crate) async fn route(method: &str, path: &str, hub: &FanoutHub) -> HttpResponse {
    if method != "GET" {
        return HttpResponse::new(405, json!({ "error": "method not allowed" }));
    }

    if path == "/api/health" {
        return HttpResponse::new(
            200,
            json!({ "state": hub.session_state().to_string(), "clients": hub.client_count() }),
        );
    }

    if path == "/api/read/all" {
        return match hub.snapshot().await {
            Ok(readings) => match serde_json::to_value(readings) {
                Ok(body) => HttpResponse::new(200, body),
                Err(e) => HttpResponse::error(500, &GantryError::Serialization(e.to_string())),
            },
            Err(e) => {
                warn!(error = %e, "sensor read over http failed");
                HttpResponse::error(status_for(&e), &e)
            }
        };
    }

    if let Some(action) = path.strip_prefix("/api/control/") {
        return match hub.execute(action).await {
            Ok(action) => HttpResponse::new(200, json!({ "message": format!("{action} successful") })),
            Err(GantryError::WriteRejected { node_id, status, .. }) => HttpResponse::new(
                502,
                json!({
                    "error": "WriteRejected",
                    "node_id": node_id.to_string(),
                    "status": status.to_string(),
                }),
            ),
            Err(e) => {
                warn!(action, error = %e, "control over http failed");
                HttpResponse::error(status_for(&e), &e)
            }
        };
    }

    HttpResponse::new(404, json!({ "error": "not found" }))
}

async fn read_head(stream: &mut TcpStream) -> Result<String, GantryError> {
    let mut head = Vec::with_capacity(1024);
    let mut chunk = [0u8; 1024];
    while !head.windows(4).any(|w| w == b"\r\n\r\n") && head.len() < MAX_REQUEST_HEAD {
        let n = stream
            .read(&mut chunk)
            .await
            .map_err(|e| GantryError::Transport(format!("HTTP read error: {e}")))?;
        if n == 0 {
            break;
        }
        head.extend_from_slice(&chunk[..n]);
    }
    Ok(String::from_utf8_lossy(&head).into_owned())
}

async fn serve_http(mut stream: TcpStream, hub: &FanoutHub) -> Result<(), GantryError> {
    let head = read_head(&mut stream).await?;
    let response = match parse_request_line(&head) {
        Some((method, path)) => {
            debug!(method, path, "http request");
            route(method, path, hub).await
        }
        None => HttpResponse::new(400, json!({ "error": "malformed request" })),
    };

    let body = response.body.to_string();
    let raw = format!(
        "HTTP/1.1 {} {}\r\n\
         Content-Type: application/json\r\n\
         Content-Length: {}\r\n\
         Access-Control-Allow-Origin: *\r\n\
         Connection: close\r\n\
         \r\n\
         {}",
        response.status,
        reason(response.status),
        body.len(),
        body
    );
    stream
        .write_all(raw.as_bytes())
        .await
        .map_err(|e| GantryError::Transport(format!("HTTP write error: {e}")))?;
    Ok(())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use super::*;
    use crate::hub::tests::FakeControl;
    use gantry_types::{Action, NodeId, SessionState, StatusCode};

    fn hub_with(control: FakeControl) -> (FanoutHub, Arc<FakeControl>) {
        let control = Arc::new(control);
        (FanoutHub::new(control.clone()), control)
    }

    #[test]
    fn default_port_is_4000() {
        let (hub, _) = hub_with(FakeControl::connected());
        assert_eq!(CockpitServer::new(hub).port(), DEFAULT_PORT);
    }

    #[test]
    fn with_port_overrides_default() {
        let (hub, _) = hub_with(FakeControl::connected());
        assert_eq!(CockpitServer::new(hub).with_port(9999).port(), 9999);
    }

    #[test]
    fn request_line_parsing() {
        assert_eq!(
            parse_request_line("GET /api/read/all?x=1 HTTP/1.1\r\nHost: a\r\n\r\n"),
            Some(("GET", "/api/read/all"))
        );
        assert_eq!(parse_request_line(""), None);
        assert_eq!(parse_request_line("GET\r\n"), None);
    }

    #[tokio::test]
    async fn read_all_returns_snapshot() {
        let (hub, _) = hub_with(FakeControl::connected());
        let response = route("GET", "/api/read/all", &hub).await;
        assert_eq!(response.status, 200);
        assert_eq!(response.body.as_array().map(Vec::len), Some(6));
        assert_eq!(response.body[0]["sensor"], "I1");
    }

    #[tokio::test]
    async fn read_all_while_degraded_is_503() {
        let (hub, _) = hub_with(FakeControl::degraded());
        let response = route("GET", "/api/read/all", &hub).await;
        assert_eq!(response.status, 503);
        assert_eq!(response.body["error"], "SessionUnavailable");
    }

    #[tokio::test]
    async fn control_routes() {
        let (hub, control) = hub_with(FakeControl::connected());

        let ok = route("GET", "/api/control/move-down", &hub).await;
        assert_eq!(ok.status, 200);
        assert_eq!(ok.body["message"], "move-down successful");
        assert_eq!(*control.executed.lock().unwrap(), vec![Action::MoveDown]);

        let bad = route("GET", "/api/control/fly", &hub).await;
        assert_eq!(bad.status, 400);
        assert_eq!(bad.body["error"], "InvalidAction");

        *control.fail_with.lock().unwrap() = Some(GantryError::WriteRejected {
            action: Action::MoveDown,
            node_id: NodeId::string(3, "O3"),
            status: StatusCode::BAD_NOT_WRITABLE,
        });
        let rejected = route("GET", "/api/control/move-down", &hub).await;
        assert_eq!(rejected.status, 502);
        assert_eq!(rejected.body["status"], "BadNotWritable (0x803B0000)");

        *control.state.lock().unwrap() = SessionState::Degraded;
        let unavailable = route("GET", "/api/control/move-down", &hub).await;
        assert_eq!(unavailable.status, 503);
    }

    #[tokio::test]
    async fn health_and_fallbacks() {
        let (hub, _) = hub_with(FakeControl::connected());
        let health = route("GET", "/api/health", &hub).await;
        assert_eq!(health.status, 200);
        assert_eq!(health.body["state"], "Connected");
        assert_eq!(health.body["clients"], 0);

        assert_eq!(route("GET", "/", &hub).await.status, 404);
        assert_eq!(route("POST", "/api/control/open-claw", &hub).await.status, 405);
    }

    #[tokio::test]
    async fn unparseable_frames_are_ignored() {
        let (hub, control) = hub_with(FakeControl::connected());
        let mut client = hub.on_client_connect().await;
        client.rx.recv().await.unwrap();

        handle_client_frame("not json at all", client.id, &hub);
        handle_client_frame(r#"{"event":"jump"}"#, client.id, &hub);
        tokio::task::yield_now().await;

        assert!(client.rx.try_recv().is_err());
        assert!(control.executed.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn malformed_control_frames_are_still_acknowledged() {
        let (hub, control) = hub_with(FakeControl::connected());
        let mut client = hub.on_client_connect().await;
        client.rx.recv().await.unwrap();

        let frames = [
            (r#"{"event":"control","data":{}}"#, ""),
            (r#"{"event":"control","data":{"action":7}}"#, "7"),
            (r#"{"event":"control"}"#, ""),
        ];
        for (frame, action) in frames {
            handle_client_frame(frame, client.id, &hub);
            let reply = tokio::time::timeout(Duration::from_secs(1), client.rx.recv())
                .await
                .expect("no acknowledgement")
                .unwrap();
            assert_eq!(
                reply,
                gantry_types::ServerMessage::ControlResponse(gantry_types::ControlAck::failed(
                    action,
                    "InvalidAction"
                ))
            );
        }
        assert!(control.executed.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn control_frame_is_acknowledged() {
        let (hub, _) = hub_with(FakeControl::connected());
        let mut client = hub.on_client_connect().await;
        client.rx.recv().await.unwrap();

        handle_client_frame(
            r#"{"event":"control","data":{"action":"close-claw"}}"#,
            client.id,
            &hub,
        );
        let reply = client.rx.recv().await.unwrap();
        assert_eq!(
            reply,
            gantry_types::ServerMessage::ControlResponse(gantry_types::ControlAck::ok(
                "close-claw"
            ))
        );
    }
}
