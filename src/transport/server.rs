//! Relay listener.
//!
//! One TCP port serves both device/operator WebSocket connections and the
//! plain HTTP health check, routed through axum.
//!
//! # Connection Flow
//!
//! 1. axum accepts the stream and parses the request
//! 2. Requests without a WebSocket upgrade get the health response
//! 3. Upgrades get size limits applied and are handed to the [`Broker`]
//! 4. The connection event loop runs until either side closes
//!
//! # Routes
//!
//! | Route | Upgrade | Response |
//! |-------|---------|----------|
//! | `/health` | - | `200 Relay alive` |
//! | any other | yes | WebSocket session |
//! | any other | no | `200 Relay alive` |

// ============================================================================
// Imports
// ============================================================================

use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use axum::Router;
use axum::extract::ws::rejection::WebSocketUpgradeRejection;
use axum::extract::ws::{WebSocket, WebSocketUpgrade};
use axum::extract::{ConnectInfo, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use tokio::net::TcpListener;
use tokio::sync::{Notify, watch};
use tracing::{debug, error, info};

use crate::broker::Broker;
use crate::config::RelayConfig;
use crate::error::Result;

use super::Connection;
use super::health;

// ============================================================================
// RelayServer
// ============================================================================

/// Bound relay listener.
///
/// # Example
///
/// ```ignore
/// let broker = Arc::new(Broker::new(&config));
/// let server = RelayServer::bind(&config, Arc::clone(&broker)).await?;
/// println!("listening on {}", server.ws_url());
/// ```
pub struct RelayServer {
    /// Address actually bound.
    local_addr: SocketAddr,

    /// Routing and registry.
    broker: Arc<Broker>,

    /// Outbound queue capacity for new connections.
    outbound_buffer: usize,

    /// Message and frame size limit applied on upgrade.
    max_message_size: usize,

    /// Set once new connections must be refused.
    shutdown: AtomicBool,

    /// Tells axum to stop accepting.
    stop_tx: watch::Sender<bool>,

    /// Number of running connection event loops.
    live: AtomicUsize,

    /// Signalled when `live` drops to zero.
    idle: Notify,
}

impl fmt::Debug for RelayServer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RelayServer")
            .field("local_addr", &self.local_addr)
            .field("live", &self.live_connections())
            .field("shutdown", &self.is_stopping())
            .finish_non_exhaustive()
    }
}

// ============================================================================
// RelayServer - Constructor
// ============================================================================

impl RelayServer {
    /// Binds the listener and starts serving.
    ///
    /// # Errors
    ///
    /// Returns [`crate::Error::Io`] if binding fails.
    pub async fn bind(config: &RelayConfig, broker: Arc<Broker>) -> Result<Arc<Self>> {
        let listener = TcpListener::bind(config.socket_addr()).await?;
        let local_addr = listener.local_addr()?;

        debug!(%local_addr, "Relay listener bound");

        let (stop_tx, mut stop_rx) = watch::channel(false);

        let server = Arc::new(Self {
            local_addr,
            broker,
            outbound_buffer: config.outbound_buffer,
            max_message_size: config.max_message_size,
            shutdown: AtomicBool::new(false),
            stop_tx,
            live: AtomicUsize::new(0),
            idle: Notify::new(),
        });

        let app = build_router(Arc::clone(&server))
            .into_make_service_with_connect_info::<SocketAddr>();

        tokio::spawn(async move {
            let stopped = async move {
                if stop_rx.wait_for(|stopped| *stopped).await.is_err() {
                    debug!("Relay server dropped before shutdown");
                }
            };

            if let Err(e) = axum::serve(listener, app)
                .with_graceful_shutdown(stopped)
                .await
            {
                error!(error = %e, "Relay server failed");
            }

            debug!("Relay listener closed");
        });

        info!(%local_addr, "Relay server started");

        Ok(server)
    }
}

// ============================================================================
// RelayServer - Public API
// ============================================================================

impl RelayServer {
    /// Returns the bound address.
    #[inline]
    #[must_use]
    pub const fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Returns the WebSocket URL for this server.
    #[inline]
    #[must_use]
    pub fn ws_url(&self) -> String {
        format!("ws://{}", self.local_addr)
    }

    /// Returns the number of connections whose event loop is running.
    #[inline]
    #[must_use]
    pub fn live_connections(&self) -> usize {
        self.live.load(Ordering::SeqCst)
    }

    /// Returns `true` once [`Self::stop_accepting`] has been called.
    #[inline]
    #[must_use]
    pub fn is_stopping(&self) -> bool {
        self.shutdown.load(Ordering::SeqCst)
    }

    /// Stops accepting new connections. Existing ones are untouched.
    pub fn stop_accepting(&self) {
        if !self.shutdown.swap(true, Ordering::SeqCst) {
            self.stop_tx.send_replace(true);
            info!("Relay server no longer accepting connections");
        }
    }

    /// Completes once every connection event loop has finished.
    pub async fn wait_idle(&self) {
        loop {
            let notified = self.idle.notified();
            if self.live.load(Ordering::SeqCst) == 0 {
                return;
            }
            notified.await;
        }
    }
}

// ============================================================================
// RelayServer - Connection Handling
// ============================================================================

impl RelayServer {
    /// Runs an upgraded socket to completion.
    async fn serve_socket(self: Arc<Self>, socket: WebSocket, addr: SocketAddr) {
        let (connection, outbound_rx) = Connection::new(Some(addr), self.outbound_buffer);
        info!(conn = %connection.id(), ?addr, "WebSocket connection established");

        let _live = LiveGuard::enter(&self);
        self.broker.open(&connection);

        connection
            .run_event_loop(socket, outbound_rx, Arc::clone(&self.broker))
            .await;
    }
}

// ============================================================================
// Routing
// ============================================================================

fn build_router(server: Arc<RelayServer>) -> Router {
    Router::new()
        .route("/health", get(health::health_handler))
        .fallback(relay_entry)
        .with_state(server)
}

/// Upgrades WebSocket requests; everything else is a health check.
async fn relay_entry(
    State(server): State<Arc<RelayServer>>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    upgrade: std::result::Result<WebSocketUpgrade, WebSocketUpgradeRejection>,
) -> Response {
    let Ok(upgrade) = upgrade else {
        debug!(?addr, "Answering health check");
        return health::health_handler().await.into_response();
    };

    if server.is_stopping() {
        debug!(?addr, "Refusing upgrade during shutdown");
        return StatusCode::SERVICE_UNAVAILABLE.into_response();
    }

    upgrade
        .max_message_size(server.max_message_size)
        .max_frame_size(server.max_message_size)
        .on_failed_upgrade(move |e| debug!(?addr, error = %e, "WebSocket upgrade failed"))
        .on_upgrade(move |socket| server.serve_socket(socket, addr))
}

// ============================================================================
// LiveGuard
// ============================================================================

/// Counts a running event loop for the lifetime of the guard.
struct LiveGuard<'a> {
    server: &'a RelayServer,
}

impl<'a> LiveGuard<'a> {
    fn enter(server: &'a RelayServer) -> Self {
        server.live.fetch_add(1, Ordering::SeqCst);
        Self { server }
    }
}

impl Drop for LiveGuard<'_> {
    fn drop(&mut self) {
        if self.server.live.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.server.idle.notify_waiters();
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
