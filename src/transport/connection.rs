//! WebSocket connection handle and event loop.
//!
//! A [`Connection`] is the relay's only way to talk to a peer. It is a
//! cheap, cloneable handle over a bounded outbound queue; the socket itself
//! is owned by the event loop task.
//!
//! # Event Loop
//!
//! The per-connection task handles:
//!
//! - Incoming text frames, handed to the [`Broker`]
//! - `Pong` frames, which mark the connection alive
//! - Outgoing frames drained from the queue
//! - Probe requests, written as `Ping` outside the queue
//! - Close requests from the broker, liveness monitor or shutdown
//!
//! Writes are raced against the close signal, so a peer that stops reading
//! cannot hold its socket open past a close request.
//!
//! When the loop ends for any reason the broker's disconnect cleanup runs
//! before the socket is dropped.

// ============================================================================
// Imports
// ============================================================================

use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use axum::extract::ws::{Message, Utf8Bytes, WebSocket};
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::{Notify, mpsc};
use tokio::time::timeout;
use tracing::{debug, trace, warn};

use crate::broker::Broker;
use crate::error::{Error, Result};
use crate::identifiers::ConnectionId;
use crate::protocol::Outbound;

// ============================================================================
// Constants
// ============================================================================

/// Upper bound on the WebSocket close handshake before the socket is dropped.
const CLOSE_TIMEOUT: Duration = Duration::from_secs(1);

// ============================================================================
// LinkState
// ============================================================================

/// Flags shared between all clones of a handle and the event loop.
struct LinkState {
    /// Cleared by each liveness sweep, set again by a `Pong`.
    alive: AtomicBool,
    /// Set once a close has been requested.
    closing: AtomicBool,
    /// Wakes the event loop on close.
    close_signal: Notify,
    /// Asks the event loop to write a `Ping`, outside the data queue.
    probe_signal: Notify,
}

// ============================================================================
// Connection
// ============================================================================

/// Handle to one live duplex connection.
///
/// Sends never block: a full or closed queue drops the frame.
#[derive(Clone)]
pub struct Connection {
    id: ConnectionId,
    peer: Option<SocketAddr>,
    outbound: mpsc::Sender<Message>,
    state: Arc<LinkState>,
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("peer", &self.peer)
            .field("alive", &self.is_alive())
            .field("closing", &self.is_closing())
            .finish()
    }
}

// ============================================================================
// Connection - Constructor
// ============================================================================

impl Connection {
    /// Creates a handle and the receiving end of its outbound queue.
    ///
    /// The receiver belongs to whoever owns the socket (the event loop in
    /// production, the test itself in unit tests).
    #[must_use]
    pub fn new(peer: Option<SocketAddr>, capacity: usize) -> (Self, mpsc::Receiver<Message>) {
        let (outbound, outbound_rx) = mpsc::channel(capacity.max(1));

        let connection = Self {
            id: ConnectionId::generate(),
            peer,
            outbound,
            state: Arc::new(LinkState {
                alive: AtomicBool::new(true),
                closing: AtomicBool::new(false),
                close_signal: Notify::new(),
                probe_signal: Notify::new(),
            }),
        };

        (connection, outbound_rx)
    }
}

// ============================================================================
// Connection - Public API
// ============================================================================

impl Connection {
    /// Returns the connection ID.
    #[inline]
    #[must_use]
    pub const fn id(&self) -> ConnectionId {
        self.id
    }

    /// Returns the remote address, if known.
    #[inline]
    #[must_use]
    pub const fn peer(&self) -> Option<SocketAddr> {
        self.peer
    }

    /// Queues a frame for delivery.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ConnectionClosed`] if the connection is closing or
    /// its queue is full. The frame is dropped in both cases.
    pub fn send(&self, message: Message) -> Result<()> {
        if self.is_closing() {
            return Err(Error::ConnectionClosed);
        }

        self.outbound.try_send(message).map_err(|e| {
            trace!(conn = %self.id, error = %e, "Outbound frame dropped");
            Error::ConnectionClosed
        })
    }

    /// Queues a relay-generated frame.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Json`] if encoding fails, otherwise as [`Self::send`].
    pub fn send_outbound(&self, message: &Outbound) -> Result<()> {
        self.send(message.to_message()?)
    }

    /// Queues a frame received from another peer, unchanged.
    ///
    /// # Errors
    ///
    /// As [`Self::send`].
    #[inline]
    pub fn forward(&self, text: &Utf8Bytes) -> Result<()> {
        self.send(Message::Text(text.clone()))
    }

    /// Requests a liveness probe (WebSocket `Ping`).
    ///
    /// The probe bypasses the outbound queue, so a connection busy with
    /// forwarded traffic is still probed. Repeated requests before the
    /// event loop gets to them collapse into one `Ping`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ConnectionClosed`] if the connection is closing.
    #[inline]
    pub fn probe(&self) -> Result<()> {
        if self.is_closing() {
            return Err(Error::ConnectionClosed);
        }
        self.state.probe_signal.notify_one();
        Ok(())
    }

    /// Returns the liveness flag.
    #[inline]
    #[must_use]
    pub fn is_alive(&self) -> bool {
        self.state.alive.load(Ordering::Acquire)
    }

    /// Records a probe response.
    #[inline]
    pub fn mark_alive(&self) {
        self.state.alive.store(true, Ordering::Release);
    }

    /// Clears the liveness flag, returning its previous value.
    #[inline]
    pub fn clear_alive(&self) -> bool {
        self.state.alive.swap(false, Ordering::AcqRel)
    }

    /// Requests the connection to close. Idempotent.
    pub fn close(&self) {
        if !self.state.closing.swap(true, Ordering::AcqRel) {
            debug!(conn = %self.id, "Close requested");
            // notify_one keeps a permit if the loop is not waiting yet
            self.state.close_signal.notify_one();
        }
    }

    /// Returns `true` once [`Self::close`] has been called.
    #[inline]
    #[must_use]
    pub fn is_closing(&self) -> bool {
        self.state.closing.load(Ordering::Acquire)
    }

    /// Completes when a close has been requested.
    async fn close_requested(&self) {
        if self.is_closing() {
            return;
        }
        self.state.close_signal.notified().await;
    }

    /// Completes when a probe has been requested.
    pub(crate) async fn probe_requested(&self) {
        self.state.probe_signal.notified().await;
    }
}

// ============================================================================
// Connection - Event Loop
// ============================================================================

impl Connection {
    /// Drives the socket until either side closes it.
    pub(crate) async fn run_event_loop(
        self,
        socket: WebSocket,
        mut outbound_rx: mpsc::Receiver<Message>,
        broker: Arc<Broker>,
    ) {
        let (mut ws_write, mut ws_read) = socket.split();

        loop {
            tokio::select! {
                // Incoming frames from the peer
                message = ws_read.next() => {
                    match message {
                        Some(Ok(Message::Text(text))) => {
                            broker.handle_text(&self, text);
                        }

                        Some(Ok(Message::Pong(_))) => {
                            trace!(conn = %self.id, "Probe answered");
                            self.mark_alive();
                        }

                        Some(Ok(Message::Close(_))) => {
                            debug!(conn = %self.id, "WebSocket closed by remote");
                            break;
                        }

                        Some(Err(e)) => {
                            debug!(conn = %self.id, error = %e, "WebSocket error");
                            break;
                        }

                        None => {
                            debug!(conn = %self.id, "WebSocket stream ended");
                            break;
                        }

                        // Binary framing is not part of the protocol; Ping is auto-answered
                        _ => {}
                    }
                }

                // Frames queued by the broker
                outgoing = outbound_rx.recv() => {
                    let Some(message) = outgoing else {
                        break;
                    };

                    if !self.write_or_close(&mut ws_write, message).await {
                        break;
                    }
                }

                // Liveness probe from the monitor
                () = self.probe_requested() => {
                    trace!(conn = %self.id, "Sending probe");
                    if !self.write_or_close(&mut ws_write, Message::Ping(Default::default())).await {
                        break;
                    }
                }

                () = self.close_requested() => {
                    // Deliver what was queued before the close (e.g. an auth error)
                    let flush = async {
                        while let Ok(message) = outbound_rx.try_recv() {
                            ws_write.send(message).await?;
                        }
                        ws_write.close().await
                    };

                    match timeout(CLOSE_TIMEOUT, flush).await {
                        Ok(Ok(())) => {}
                        Ok(Err(e)) => debug!(conn = %self.id, error = %e, "Close handshake failed"),
                        Err(_) => debug!(conn = %self.id, "Close handshake timed out"),
                    }
                    break;
                }
            }
        }

        // Registry entries go before the socket does
        broker.disconnect(&self);
        self.close();
        drop(ws_write);
        drop(ws_read);

        debug!(conn = %self.id, "Event loop terminated");
    }

    /// Writes one frame, bounded once a close has been requested.
    ///
    /// A peer that stops reading stalls the write; after a close request
    /// the write gets [`CLOSE_TIMEOUT`] to finish so reclamation and
    /// shutdown can still release the socket. Returns `false` when the loop
    /// must end.
    async fn write_or_close(
        &self,
        ws_write: &mut SplitSink<WebSocket, Message>,
        message: Message,
    ) -> bool {
        let write = ws_write.send(message);
        tokio::pin!(write);

        let written = tokio::select! {
            biased;

            written = &mut write => written,

            () = self.close_requested() => match timeout(CLOSE_TIMEOUT, &mut write).await {
                Ok(written) => written,
                Err(_) => {
                    debug!(conn = %self.id, "Write stalled after close request");
                    return false;
                }
            },
        };

        if let Err(e) = written {
            warn!(conn = %self.id, error = %e, "Failed to write frame");
            return false;
        }
        true
    }
}

// ============================================================================
// Tests
// ============================================================================
