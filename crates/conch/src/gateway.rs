//! HTTP and WebSocket surface.
//!
//! Routes:
//! - `GET /api/health`: JSON health report
//! - `GET /` and `GET /ws`: WebSocket upgrade, one [`Session`] per socket
//!
//! Each socket gets two pump tasks around the session: a reader that turns
//! WebSocket messages into text for the session, and a writer that turns
//! [`ServerFrame`]s into WebSocket messages. Once the session is closed the
//! writer drains the remaining frames and closes the socket.

use std::fmt;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::Json;
use axum::Router;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{ConnectInfo, State};
use axum::http::{HeaderMap, HeaderValue, Method, StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tower_http::cors::{AllowOrigin, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{debug, info, warn};

use crate::config::RelaySettings;
use crate::frame::ServerFrame;
use crate::registry::{DEFAULT_MAX_SESSIONS, SessionInfo, SessionRegistry};
use crate::remote::RemoteConnector;
use crate::remote::ssh::SshConnector;
use crate::session::{Session, SessionState};
use crate::{Error, Result};

/// Client messages buffered per session before the reader waits.
const INBOUND_BUFFER: usize = 64;

/// Frames buffered per session before the session stops reading shell output.
const OUTBOUND_BUFFER: usize = 64;

/// Default time sessions get to close after a shutdown signal.
const DEFAULT_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

// -----------------------------------------------------------------------------
// Shared state
// -----------------------------------------------------------------------------

/// State shared by all request handlers.
#[derive(Clone)]
pub struct GatewayState {
    /// Settings every session connects with.
    pub settings: Arc<RelaySettings>,
    /// Opens remote sessions.
    pub connector: Arc<dyn RemoteConnector>,
    /// Live sessions.
    pub registry: Arc<SessionRegistry>,
    /// Required `Origin` header for WebSocket upgrades.
    pub allowed_origin: Option<String>,
}

impl fmt::Debug for GatewayState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GatewayState")
            .field("settings", &self.settings)
            .field("sessions", &self.registry.session_count())
            .field("allowed_origin", &self.allowed_origin)
            .finish_non_exhaustive()
    }
}

// -----------------------------------------------------------------------------
// Health
// -----------------------------------------------------------------------------

/// Body of `GET /api/health`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthReport {
    /// Always `"ok"` while the process serves requests.
    pub status: String,
    /// Upstream services.
    pub services: HealthServices,
    /// Session counters.
    pub sessions: HealthSessions,
}

/// Upstream service availability.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthServices {
    /// True when a remote host and an auth method are configured.
    pub ssh: bool,
}

/// Session counters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthSessions {
    /// Registered channels, whatever their state.
    pub open: usize,
    /// Sessions with a running remote shell.
    pub active: usize,
}

impl HealthSessions {
    fn from_snapshots(sessions: &[SessionInfo]) -> Self {
        Self {
            open: sessions.len(),
            active: sessions
                .iter()
                .filter(|info| info.state == SessionState::Active)
                .count(),
        }
    }
}

impl HealthReport {
    /// Builds the report for the current gateway state.
    pub fn from_state(state: &GatewayState) -> Self {
        Self {
            status: "ok".to_string(),
            services: HealthServices {
                ssh: state.settings.credentials.is_configured(),
            },
            sessions: HealthSessions::from_snapshots(&state.registry.get_sessions()),
        }
    }
}

async fn health(State(state): State<GatewayState>) -> Json<HealthReport> {
    Json(HealthReport::from_state(&state))
}

// -----------------------------------------------------------------------------
// WebSocket
// -----------------------------------------------------------------------------

/// Returns true when `headers` satisfy the configured origin restriction.
fn origin_allowed(allowed: Option<&str>, headers: &HeaderMap) -> bool {
    let Some(allowed) = allowed else {
        return true;
    };
    headers
        .get(header::ORIGIN)
        .and_then(|value| value.to_str().ok())
        .is_some_and(|origin| origin == allowed)
}

async fn ws_handler(
    State(state): State<GatewayState>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> Response {
    if !origin_allowed(state.allowed_origin.as_deref(), &headers) {
        warn!(peer = %peer, origin = ?headers.get(header::ORIGIN), "Rejecting WebSocket origin");
        return (StatusCode::FORBIDDEN, "origin not allowed").into_response();
    }

    ws.on_upgrade(move |socket| serve_socket(socket, peer, state))
}

/// Runs one session over an upgraded socket.
async fn serve_socket(socket: WebSocket, peer: SocketAddr, state: GatewayState) {
    let (mut sink, mut stream) = socket.split();

    let (id, mut shutdown_rx) = match state.registry.register(peer) {
        Ok(admitted) => admitted,
        Err(e) => {
            let _ = sink
                .send(Message::Text(ServerFrame::from(&e).to_json()))
                .await;
            let _ = sink.send(Message::Close(None)).await;
            return;
        }
    };

    let (outbound_tx, mut outbound_rx) = mpsc::channel::<ServerFrame>(OUTBOUND_BUFFER);
    let (inbound_tx, inbound_rx) = mpsc::channel::<String>(INBOUND_BUFFER);

    let writer = tokio::spawn(async move {
        while let Some(frame) = outbound_rx.recv().await {
            if sink.send(Message::Text(frame.to_json())).await.is_err() {
                break;
            }
        }
        let _ = sink.send(Message::Close(None)).await;
    });

    let reader = tokio::spawn(async move {
        loop {
            let message = tokio::select! {
                _ = &mut shutdown_rx => {
                    debug!(session_id = id.0, "Shutdown signalled");
                    break;
                }
                message = stream.next() => message,
            };

            let text = match message {
                Some(Ok(Message::Text(text))) => text,
                Some(Ok(Message::Binary(bytes))) => match String::from_utf8(bytes) {
                    Ok(text) => text,
                    Err(_) => {
                        warn!(session_id = id.0, "Dropping non-UTF-8 binary message");
                        continue;
                    }
                },
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => continue,
                Some(Err(e)) => {
                    debug!(session_id = id.0, error = %e, "WebSocket read failed");
                    break;
                }
            };

            if inbound_tx.send(text).await.is_err() {
                break;
            }
        }
    });

    let mut session = Session::new(
        id,
        Arc::clone(&state.settings),
        Arc::clone(&state.connector),
        outbound_tx,
    );
    state.registry.track_state(id, session.subscribe());

    session.run(inbound_rx).await;

    // Dropping the session closes the outbound channel so the writer can
    // flush and close the socket.
    drop(session);
    reader.abort();
    let _ = writer.await;
    state.registry.remove(id);
}

// -----------------------------------------------------------------------------
// Gateway
// -----------------------------------------------------------------------------

/// The relay gateway.
pub struct Gateway {
    address: String,
    state: GatewayState,
    frontend_url: Option<String>,
    drain_timeout: Duration,
}

impl fmt::Debug for Gateway {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Gateway")
            .field("address", &self.address)
            .field("state", &self.state)
            .field("frontend_url", &self.frontend_url)
            .finish()
    }
}

impl Gateway {
    /// Returns the listen address.
    pub fn address(&self) -> &str {
        &self.address
    }

    /// Returns the shared handler state.
    pub fn state(&self) -> &GatewayState {
        &self.state
    }

    /// Builds the axum router.
    pub fn router(&self) -> Router {
        let cors = match self
            .frontend_url
            .as_deref()
            .and_then(|url| HeaderValue::from_str(url).ok())
        {
            Some(origin) => CorsLayer::new()
                .allow_origin(AllowOrigin::exact(origin))
                .allow_methods([Method::GET, Method::OPTIONS]),
            None => CorsLayer::new(),
        };

        Router::new()
            .route("/api/health", get(health))
            .route("/", get(ws_handler))
            .route("/ws", get(ws_handler))
            .layer(TraceLayer::new_for_http())
            .layer(cors)
            .with_state(self.state.clone())
    }

    /// Binds the configured address and serves until the process ends.
    pub async fn listen(&self) -> Result<()> {
        self.listen_with_shutdown(std::future::pending()).await
    }

    /// Binds the configured address and serves until `signal` resolves.
    ///
    /// After the signal every session is told to close and gets the drain
    /// timeout to do so.
    pub async fn listen_with_shutdown<F>(&self, signal: F) -> Result<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let addr: SocketAddr = self.address.parse()?;
        let listener = TcpListener::bind(addr).await?;
        self.serve(listener, signal).await
    }

    /// Serves on an already bound listener until `signal` resolves.
    pub async fn serve<F>(&self, listener: TcpListener, signal: F) -> Result<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let local = listener.local_addr()?;
        info!(
            address = %local,
            ssh_configured = self.state.settings.credentials.is_configured(),
            max_sessions = self.state.registry.max_sessions(),
            "Gateway listening"
        );

        let registry = Arc::clone(&self.state.registry);
        let drain_timeout = self.drain_timeout;
        axum::serve(
            listener,
            self.router()
                .into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(async move {
            signal.await;
            info!("Shutdown requested, draining sessions");
            let forced = registry.shutdown_graceful(drain_timeout).await;
            if forced > 0 {
                warn!(forced, "Sessions still open after drain timeout");
            }
        })
        .await?;

        info!("Gateway stopped");
        Ok(())
    }
}

// -----------------------------------------------------------------------------
// Builder
// -----------------------------------------------------------------------------

/// Builder for a [`Gateway`].
pub struct GatewayBuilder {
    address: String,
    settings: RelaySettings,
    connector: Option<Arc<dyn RemoteConnector>>,
    max_sessions: usize,
    allowed_origin: Option<String>,
    frontend_url: Option<String>,
    drain_timeout: Duration,
}

impl Default for GatewayBuilder {
    fn default() -> Self {
        Self {
            address: "0.0.0.0:3001".to_string(),
            settings: RelaySettings::default(),
            connector: None,
            max_sessions: DEFAULT_MAX_SESSIONS,
            allowed_origin: None,
            frontend_url: None,
            drain_timeout: DEFAULT_DRAIN_TIMEOUT,
        }
    }
}

impl GatewayBuilder {
    /// Creates a new gateway builder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the listen address.
    pub fn address(mut self, addr: impl Into<String>) -> Self {
        self.address = addr.into();
        self
    }

    /// Sets the relay settings.
    pub fn settings(mut self, settings: RelaySettings) -> Self {
        self.settings = settings;
        self
    }

    /// Sets the remote connector. Defaults to [`SshConnector`].
    pub fn connector<C: RemoteConnector + 'static>(mut self, connector: C) -> Self {
        self.connector = Some(Arc::new(connector));
        self
    }

    /// Sets the maximum number of concurrent sessions.
    pub fn max_sessions(mut self, max: usize) -> Self {
        self.max_sessions = max;
        self
    }

    /// Only accepts WebSocket upgrades with this `Origin` header.
    pub fn allowed_origin(mut self, origin: impl Into<String>) -> Self {
        self.allowed_origin = Some(origin.into());
        self
    }

    /// Allows cross-origin requests from the dashboard frontend.
    pub fn frontend_url(mut self, url: impl Into<String>) -> Self {
        self.frontend_url = Some(url.into());
        self
    }

    /// Sets how long sessions get to close on shutdown.
    pub fn drain_timeout(mut self, timeout: Duration) -> Self {
        self.drain_timeout = timeout;
        self
    }

    /// Builds the gateway.
    ///
    /// # Errors
    ///
    /// - [`Error::AddrParse`] when the address is not a socket address
    /// - [`Error::Configuration`] when the session limit is zero
    pub fn build(self) -> Result<Gateway> {
        self.address.parse::<SocketAddr>()?;
        if self.max_sessions == 0 {
            return Err(Error::Configuration(
                "max sessions must be at least 1".to_string(),
            ));
        }

        let known_hosts_check = self.settings.known_hosts_check;
        let connector = self.connector.unwrap_or_else(|| {
            Arc::new(SshConnector::new().known_hosts_check(known_hosts_check))
        });

        Ok(Gateway {
            address: self.address,
            state: GatewayState {
                settings: Arc::new(self.settings),
                connector,
                registry: Arc::new(SessionRegistry::new(self.max_sessions)),
                allowed_origin: self.allowed_origin,
            },
            frontend_url: self.frontend_url,
            drain_timeout: self.drain_timeout,
        })
    }
}
