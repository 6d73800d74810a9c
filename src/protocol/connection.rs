//! # Connections
//!
//! One live transport plus its inbound accumulator, outbound queue and
//! lifecycle state. Connections are created and destroyed only by their
//! connection manager; application code sees them through handler calls and
//! the manager's accessors.
//!
//! ## Lifecycle
//! ```text
//! Connecting -> Connected -> Disconnecting -> Disconnected
//! ```
//! `Disconnecting` lasts until the outbound queue has flushed or the shutdown
//! timeout elapses, whichever comes first. A connection that fails before it
//! finishes connecting goes straight to `Disconnecting`.

use std::io;
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::{Buf, BytesMut};
use tokio_util::codec::{Decoder, Encoder};
use tracing::{debug, info, warn};

use crate::config::{ClientConfig, ServerConfig};
use crate::core::codec::{Frame, FrameCodec, OutboundFrame};
use crate::core::packet::PacketWriter;
use crate::error::{constants, ProtocolError, Result};
use crate::transport::{is_transient, ByteStream};
use crate::utils::metrics::Metrics;

/// Manager-assigned connection identifier, unique per manager
pub type ConnectionId = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    Connecting,
    Connected,
    Disconnecting,
    Disconnected,
}

/// Why a connection left the `Connected` state
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DisconnectReason {
    /// Disconnect requested by the application or a manager shutdown
    LocalShutdown,
    /// Outbound data discarded on request
    Aborted,
    /// The peer closed its end of the stream; replies already queued are
    /// still flushed
    PeerClosed,
    /// Read, write or connect failure
    TransportError(String),
    /// Invalid length prefix
    MalformedFrame(String),
    /// Opcode with no registered handler, when configured to disconnect
    UnknownOpcode(u32),
}

impl DisconnectReason {
    /// Whether queued outbound bytes are dropped instead of flushed
    fn discards_outbound(&self) -> bool {
        matches!(
            self,
            DisconnectReason::Aborted | DisconnectReason::TransportError(_)
        )
    }
}

/// Per-connection I/O limits
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectionLimits {
    pub shutdown_timeout: Duration,
    pub max_outbound_bytes: usize,
    pub read_chunk_size: usize,
    pub max_read_per_tick: usize,
}

impl From<&ServerConfig> for ConnectionLimits {
    fn from(config: &ServerConfig) -> Self {
        Self {
            shutdown_timeout: config.shutdown_timeout,
            max_outbound_bytes: config.max_outbound_bytes,
            read_chunk_size: config.read_chunk_size,
            max_read_per_tick: config.max_read_per_tick,
        }
    }
}

impl From<&ClientConfig> for ConnectionLimits {
    fn from(config: &ClientConfig) -> Self {
        Self {
            shutdown_timeout: config.shutdown_timeout,
            max_outbound_bytes: config.max_outbound_bytes,
            read_chunk_size: config.read_chunk_size,
            max_read_per_tick: config.max_read_per_tick,
        }
    }
}

/// How a read pass ended
#[derive(Debug, Default)]
pub(crate) struct ReadOutcome {
    pub bytes: usize,
    pub eof: bool,
    pub error: Option<io::Error>,
}

/// A live connection owned by a connection manager
pub struct Connection {
    id: ConnectionId,
    stream: Box<dyn ByteStream>,
    peer: String,
    state: ConnectionState,
    reason: Option<DisconnectReason>,
    tag: u64,
    codec: FrameCodec,
    limits: ConnectionLimits,
    inbound: BytesMut,
    outbound: BytesMut,
    deadline: Option<Instant>,
    metrics: Arc<Metrics>,
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("peer", &self.peer)
            .field("state", &self.state)
            .field("reason", &self.reason)
            .field("tag", &self.tag)
            .field("inbound", &self.inbound.len())
            .field("outbound", &self.outbound.len())
            .finish()
    }
}

impl Connection {
    pub(crate) fn new(
        id: ConnectionId,
        stream: Box<dyn ByteStream>,
        state: ConnectionState,
        codec: FrameCodec,
        limits: ConnectionLimits,
        metrics: Arc<Metrics>,
    ) -> Self {
        let peer = stream.peer_label();
        Self {
            id,
            stream,
            peer,
            state,
            reason: None,
            tag: 0,
            codec,
            limits,
            inbound: BytesMut::with_capacity(limits.read_chunk_size),
            outbound: BytesMut::new(),
            deadline: None,
            metrics,
        }
    }

    #[inline]
    pub fn id(&self) -> ConnectionId {
        self.id
    }

    #[inline]
    pub fn state(&self) -> ConnectionState {
        self.state
    }

    #[inline]
    pub fn is_connected(&self) -> bool {
        self.state == ConnectionState::Connected
    }

    /// Set once the connection starts disconnecting
    pub fn disconnect_reason(&self) -> Option<&DisconnectReason> {
        self.reason.as_ref()
    }

    pub fn peer(&self) -> &str {
        &self.peer
    }

    /// Opaque application value; the manager never interprets it
    #[inline]
    pub fn tag(&self) -> u64 {
        self.tag
    }

    pub fn set_tag(&mut self, tag: u64) {
        self.tag = tag;
    }

    /// Bytes queued for sending
    pub fn pending_outbound(&self) -> usize {
        self.outbound.len()
    }

    /// Bytes received but not yet framed
    pub fn pending_inbound(&self) -> usize {
        self.inbound.len()
    }

    /// Queue a writer's message for sending on the next flush.
    ///
    /// The writer stays with the caller; its bytes are copied into the
    /// outbound queue, so it can be released as soon as this returns.
    pub fn send(&mut self, writer: &PacketWriter) -> Result<()> {
        self.send_frame(writer.as_frame())
    }

    /// Queue a raw payload under `opcode`.
    pub fn send_raw(&mut self, opcode: u32, payload: &[u8]) -> Result<()> {
        self.send_frame(OutboundFrame { opcode, payload })
    }

    fn send_frame(&mut self, frame: OutboundFrame<'_>) -> Result<()> {
        match self.state {
            ConnectionState::Connecting | ConnectionState::Connected => {}
            ConnectionState::Disconnecting | ConnectionState::Disconnected => {
                return Err(ProtocolError::ConnectionClosed)
            }
        }

        let frame_len = self.codec.header_len() + frame.payload.len();
        let queued = self.outbound.len();
        if queued + frame_len > self.limits.max_outbound_bytes {
            return Err(ProtocolError::Backpressure {
                queued,
                limit: self.limits.max_outbound_bytes,
            });
        }

        self.codec.encode(frame, &mut self.outbound)?;
        self.metrics.frame_sent();
        Ok(())
    }

    /// Start a graceful disconnect; queued data is still flushed.
    pub fn disconnect(&mut self) {
        self.begin_disconnect(DisconnectReason::LocalShutdown);
    }

    /// Disconnect and drop everything still queued for sending.
    pub fn abort(&mut self) {
        self.begin_disconnect(DisconnectReason::Aborted);
    }

    pub(crate) fn begin_disconnect(&mut self, reason: DisconnectReason) {
        match self.state {
            ConnectionState::Disconnected => return,
            ConnectionState::Disconnecting => {
                if reason.discards_outbound() && !self.outbound.is_empty() {
                    warn!(
                        connection = self.id,
                        discarded = self.outbound.len(),
                        ?reason,
                        "Discarding outbound data during disconnect"
                    );
                    self.outbound.clear();
                }
                return;
            }
            ConnectionState::Connecting | ConnectionState::Connected => {}
        }

        if reason.discards_outbound() && !self.outbound.is_empty() {
            warn!(
                connection = self.id,
                discarded = self.outbound.len(),
                ?reason,
                "Discarding unflushed outbound data"
            );
            self.outbound.clear();
        }

        info!(connection = self.id, peer = %self.peer, ?reason, "Connection disconnecting");

        self.inbound.clear();
        self.state = ConnectionState::Disconnecting;
        self.deadline = Some(Instant::now() + self.limits.shutdown_timeout);
        self.reason = Some(reason);
    }

    /// Advance `Connecting` once the transport reports ready.
    pub(crate) fn poll_connect(&mut self) {
        if self.state != ConnectionState::Connecting {
            return;
        }
        match self.stream.poll_ready() {
            Ok(true) => {
                self.state = ConnectionState::Connected;
                info!(connection = self.id, peer = %self.peer, "Connection established");
            }
            Ok(false) => {}
            Err(e) => {
                self.metrics.transport_error();
                self.begin_disconnect(DisconnectReason::TransportError(e.to_string()));
            }
        }
    }

    /// Pull available bytes into the accumulator, up to the per-tick limit.
    pub(crate) fn fill_inbound(&mut self, scratch: &mut [u8]) -> ReadOutcome {
        let mut outcome = ReadOutcome::default();
        let chunk = scratch.len().min(self.limits.read_chunk_size).max(1);

        while outcome.bytes < self.limits.max_read_per_tick {
            match self.stream.try_read(&mut scratch[..chunk]) {
                Ok(0) => {
                    debug!(connection = self.id, reason = constants::ERR_PEER_CLOSED);
                    outcome.eof = true;
                    break;
                }
                Ok(n) => {
                    self.inbound.extend_from_slice(&scratch[..n]);
                    outcome.bytes += n;
                }
                Err(e) if is_transient(&e) => break,
                Err(e) => {
                    outcome.error = Some(e);
                    break;
                }
            }
        }

        outcome
    }

    /// Split the next complete frame off the accumulator.
    pub(crate) fn next_frame(&mut self) -> Result<Option<Frame>> {
        self.codec.decode(&mut self.inbound)
    }

    /// Write as much of the outbound queue as the transport accepts.
    pub(crate) fn flush(&mut self) -> io::Result<usize> {
        let mut written = 0;
        while !self.outbound.is_empty() {
            match self.stream.try_write(&self.outbound) {
                Ok(0) => return Err(io::ErrorKind::WriteZero.into()),
                Ok(n) => {
                    self.outbound.advance(n);
                    written += n;
                }
                Err(e) if is_transient(&e) => break,
                Err(e) => return Err(e),
            }
        }
        Ok(written)
    }

    /// Finish a disconnect once flushed or timed out. Returns true when the
    /// connection reached `Disconnected`.
    pub(crate) fn finalize_if_done(&mut self, now: Instant) -> bool {
        if self.state != ConnectionState::Disconnecting {
            return false;
        }

        let timed_out = self.deadline.is_some_and(|deadline| now >= deadline);
        if !self.outbound.is_empty() && !timed_out {
            return false;
        }

        if timed_out && !self.outbound.is_empty() {
            warn!(
                connection = self.id,
                discarded = self.outbound.len(),
                "Shutdown timeout elapsed before outbound data flushed"
            );
            self.outbound.clear();
        }

        if let Err(e) = self.stream.shutdown() {
            debug!(connection = self.id, error = %e, "Transport shutdown failed");
        }
        self.state = ConnectionState::Disconnected;
        true
    }
}
