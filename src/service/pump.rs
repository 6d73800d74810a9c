//! Per-connection servicing shared by the client and server managers.
//!
//! One `service` call performs, for a single connection, the read, dispatch
//! and flush steps of a heartbeat. Finalization and acceptance stay with the
//! managers, which own the connection sets.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{debug, info, trace, warn};

use crate::config::NetworkConfig;
use crate::core::codec::FrameCodec;
use crate::core::packet::{PacketReader, WriterPool};
use crate::error::{ProtocolError, Result};
use crate::protocol::connection::{
    Connection, ConnectionId, ConnectionLimits, ConnectionState, DisconnectReason,
};
use crate::protocol::dispatcher::Dispatcher;
use crate::transport::ByteStream;
use crate::utils::metrics::Metrics;

pub(crate) struct Pump {
    pub codec: FrameCodec,
    pub limits: ConnectionLimits,
    pub dispatcher: Dispatcher,
    pub writers: WriterPool,
    pub metrics: Arc<Metrics>,
    disconnect_on_unknown_opcode: bool,
    scratch: Vec<u8>,
    next_id: ConnectionId,
    sweep_interval: Option<Duration>,
    next_sweep: Instant,
}

impl Pump {
    pub fn new(config: &NetworkConfig, limits: ConnectionLimits) -> Self {
        let sweep_interval = config
            .pool
            .leak_detection
            .then_some(config.pool.leak_sweep_interval);
        Self {
            codec: FrameCodec::from_config(&config.framing),
            limits,
            dispatcher: Dispatcher::new(),
            writers: WriterPool::from_config(&config.pool),
            metrics: Arc::new(Metrics::new()),
            disconnect_on_unknown_opcode: config.framing.disconnect_on_unknown_opcode,
            scratch: vec![0u8; limits.read_chunk_size.max(1)],
            next_id: 1,
            sweep_interval,
            next_sweep: Instant::now() + sweep_interval.unwrap_or_default(),
        }
    }

    /// Wrap a transport in a new connection with a fresh id.
    pub fn open(&mut self, stream: Box<dyn ByteStream>, state: ConnectionState) -> Connection {
        let id = self.next_id;
        self.next_id += 1;
        self.metrics.connection_established();
        Connection::new(id, stream, state, self.codec, self.limits, self.metrics.clone())
    }

    /// Register a handler after checking the opcode fits the wire field.
    pub fn register<F>(&mut self, opcode: u32, handler: F) -> Result<()>
    where
        F: FnMut(&mut Connection, &mut PacketReader<'_>) -> Result<()> + Send + 'static,
    {
        let max = self.codec.opcode_width().max_value();
        if u64::from(opcode) > max {
            return Err(ProtocolError::ValueTooLarge {
                len: opcode as usize,
                max: max as usize,
            });
        }
        self.dispatcher.register(opcode, handler);
        Ok(())
    }

    /// Read, dispatch and flush one connection. Returns frames dispatched.
    pub fn service(&mut self, conn: &mut Connection) -> usize {
        conn.poll_connect();

        let mut dispatched = 0;
        if conn.state() == ConnectionState::Connected {
            let outcome = conn.fill_inbound(&mut self.scratch);
            if outcome.bytes > 0 {
                self.metrics.bytes_read(outcome.bytes as u64);
                trace!(connection = conn.id(), bytes = outcome.bytes, "Read");
            }

            dispatched = self.dispatch_ready(conn);

            if let Some(err) = outcome.error {
                self.metrics.transport_error();
                conn.begin_disconnect(DisconnectReason::TransportError(err.to_string()));
            } else if outcome.eof {
                conn.begin_disconnect(DisconnectReason::PeerClosed);
            }
        }

        if matches!(
            conn.state(),
            ConnectionState::Connected | ConnectionState::Disconnecting
        ) {
            match conn.flush() {
                Ok(0) => {}
                Ok(written) => self.metrics.bytes_written(written as u64),
                Err(e) => {
                    self.metrics.transport_error();
                    conn.begin_disconnect(DisconnectReason::TransportError(e.to_string()));
                }
            }
        }

        dispatched
    }

    /// Dispatch every complete frame in the accumulator, in arrival order.
    fn dispatch_ready(&mut self, conn: &mut Connection) -> usize {
        let mut dispatched = 0;

        while conn.state() == ConnectionState::Connected {
            let frame = match conn.next_frame() {
                Ok(Some(frame)) => frame,
                Ok(None) => break,
                Err(e) => {
                    self.metrics.malformed_frame();
                    warn!(connection = conn.id(), peer = conn.peer(), error = %e, "Malformed frame");
                    conn.begin_disconnect(DisconnectReason::MalformedFrame(e.to_string()));
                    break;
                }
            };

            let mut reader = PacketReader::from(&frame);
            match self.dispatcher.dispatch(conn, &mut reader) {
                Ok(()) => {
                    self.metrics.frame_received();
                    dispatched += 1;
                }
                Err(ProtocolError::UnknownOpcode(opcode)) => {
                    self.metrics.unknown_opcode();
                    if self.disconnect_on_unknown_opcode {
                        warn!(connection = conn.id(), opcode, "Unknown opcode, disconnecting");
                        conn.begin_disconnect(DisconnectReason::UnknownOpcode(opcode));
                    } else {
                        warn!(connection = conn.id(), opcode, "Unknown opcode, frame dropped");
                    }
                }
                Err(e) => {
                    self.metrics.frame_received();
                    self.metrics.handler_error();
                    dispatched += 1;
                    warn!(
                        connection = conn.id(),
                        opcode = frame.opcode,
                        error = %e,
                        "Handler failed"
                    );
                }
            }
        }

        dispatched
    }

    /// Sweep the writer pool for leaks when the interval has elapsed.
    pub fn maybe_sweep(&mut self, now: Instant) -> usize {
        let Some(interval) = self.sweep_interval else {
            return 0;
        };
        if now < self.next_sweep {
            return 0;
        }
        self.next_sweep = now + interval;

        let leaks = self.writers.sweep_leaks();
        if !leaks.is_empty() {
            self.metrics.pool_leaks_reported(leaks.len() as u64);
            debug!(count = leaks.len(), "Leak sweep reported stale writers");
        }
        leaks.len()
    }

    /// Record a finalized connection.
    pub fn closed(&self, conn: &Connection) {
        self.metrics.connection_closed();
        info!(
            connection = conn.id(),
            peer = conn.peer(),
            reason = ?conn.disconnect_reason(),
            "Connection closed"
        );
    }
}
