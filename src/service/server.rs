//! # Server Connection Manager
//!
//! Owns the listening transport and every accepted connection. All work
//! happens inside [`ServerManager::heartbeat`], which the application (or
//! [`crate::service::driver`]) calls once per tick.
//!
//! ## Heartbeat Order
//! 1. Accept pending connections (until shut down)
//! 2. For each connection in accept order: read, dispatch complete frames, flush
//! 3. Finalize connections that finished disconnecting
//! 4. Sweep the writer pool for leaks when due
//!
//! ## Example
//! ```rust
//! use tickwire::config::NetworkConfig;
//! use tickwire::service::server::ServerManager;
//! use tickwire::transport::memory::MemoryListener;
//!
//! let listener = MemoryListener::new();
//! let connector = listener.connector();
//! let mut server = ServerManager::with_acceptor(listener, &NetworkConfig::default());
//! server.register(1, |_conn, _reader| Ok(())).unwrap();
//!
//! let _client_end = connector.connect().unwrap();
//! let report = server.heartbeat();
//! assert_eq!(report.accepted.len(), 1);
//! assert_eq!(server.connection_count(), 1);
//! ```

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{error, info, instrument, warn};

use super::pump::Pump;
use super::TickReport;
use crate::config::NetworkConfig;
use crate::core::packet::{PacketReader, PacketWriter, WriterPool};
use crate::error::{ProtocolError, Result};
use crate::protocol::connection::{Connection, ConnectionId, ConnectionLimits, ConnectionState};
use crate::transport::tcp::TcpAcceptor;
use crate::transport::{Acceptor, ByteStream};
use crate::utils::metrics::Metrics;

/// Upper bound on accepts per heartbeat so a connect storm cannot starve I/O
const MAX_ACCEPTS_PER_TICK: usize = 128;

/// Server-side connection manager
pub struct ServerManager<A: Acceptor> {
    acceptor: A,
    accepting: bool,
    connections: BTreeMap<ConnectionId, Connection>,
    max_connections: usize,
    tick_interval: Duration,
    shutdown_timeout: Duration,
    pump: Pump,
}

impl ServerManager<TcpAcceptor> {
    /// Bind a non-blocking TCP listener on `config.server.address`.
    #[instrument(skip(config), fields(address = %config.server.address))]
    pub fn bind(config: &NetworkConfig) -> Result<Self> {
        let acceptor = TcpAcceptor::bind(&config.server.address)?;
        info!(address = %acceptor.local_addr()?, "Listening");
        Ok(Self::with_acceptor(acceptor, config))
    }

    pub fn local_addr(&self) -> Result<std::net::SocketAddr> {
        self.acceptor.local_addr()
    }
}

impl<A: Acceptor> ServerManager<A> {
    pub fn with_acceptor(acceptor: A, config: &NetworkConfig) -> Self {
        let limits = ConnectionLimits::from(&config.server);
        Self {
            acceptor,
            accepting: true,
            connections: BTreeMap::new(),
            max_connections: config.server.max_connections,
            tick_interval: config.server.tick_interval,
            shutdown_timeout: config.server.shutdown_timeout,
            pump: Pump::new(config, limits),
        }
    }

    /// Register the handler for `opcode`.
    ///
    /// Fails with `ValueTooLarge` if the opcode does not fit the configured
    /// opcode width.
    pub fn register<F>(&mut self, opcode: u32, handler: F) -> Result<()>
    where
        F: FnMut(&mut Connection, &mut PacketReader<'_>) -> Result<()> + Send + 'static,
    {
        self.pump.register(opcode, handler)
    }

    pub fn unregister(&mut self, opcode: u32) -> bool {
        self.pump.dispatcher.unregister(opcode)
    }

    /// Writer pool scoped to this manager; clone it into handlers and workers.
    pub fn writer_pool(&self) -> &WriterPool {
        &self.pump.writers
    }

    /// Check out a writer from this manager's pool.
    pub fn writer(&self, opcode: u32) -> Result<PacketWriter> {
        self.pump.writers.checkout(opcode)
    }

    pub fn metrics(&self) -> Arc<Metrics> {
        self.pump.metrics.clone()
    }

    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    pub fn connection(&self, id: ConnectionId) -> Option<&Connection> {
        self.connections.get(&id)
    }

    pub fn connection_mut(&mut self, id: ConnectionId) -> Option<&mut Connection> {
        self.connections.get_mut(&id)
    }

    /// Live connections in accept order
    pub fn connections(&self) -> impl Iterator<Item = &Connection> {
        self.connections.values()
    }

    pub fn connection_ids(&self) -> Vec<ConnectionId> {
        self.connections.keys().copied().collect()
    }

    /// Queue `writer`'s message on one connection.
    pub fn send_to(&mut self, id: ConnectionId, writer: &PacketWriter) -> Result<()> {
        self.connections
            .get_mut(&id)
            .ok_or(ProtocolError::ConnectionClosed)?
            .send(writer)
    }

    /// Queue `writer`'s message on every connected connection.
    ///
    /// Returns how many connections accepted it; connections that refuse
    /// (backpressure) are skipped and logged.
    pub fn broadcast(&mut self, writer: &PacketWriter) -> usize {
        let mut delivered = 0;
        for conn in self.connections.values_mut().filter(|c| c.is_connected()) {
            match conn.send(writer) {
                Ok(()) => delivered += 1,
                Err(e) => warn!(connection = conn.id(), error = %e, "Broadcast skipped connection"),
            }
        }
        delivered
    }

    /// Gracefully disconnect one connection.
    pub fn disconnect(&mut self, id: ConnectionId) -> bool {
        self.connections
            .get_mut(&id)
            .map(Connection::disconnect)
            .is_some()
    }

    /// Disconnect one connection, discarding its unsent data.
    pub fn abort(&mut self, id: ConnectionId) -> bool {
        self.connections
            .get_mut(&id)
            .map(Connection::abort)
            .is_some()
    }

    /// Stop accepting and move every connection to `Disconnecting`.
    pub fn shutdown(&mut self) {
        if self.accepting {
            info!(connections = self.connections.len(), "Server shutting down");
        }
        self.accepting = false;
        for conn in self.connections.values_mut() {
            conn.disconnect();
        }
    }

    pub fn is_accepting(&self) -> bool {
        self.accepting
    }

    /// Shut down with no connections left
    pub fn is_idle(&self) -> bool {
        !self.accepting && self.connections.is_empty()
    }

    pub fn tick_interval(&self) -> Duration {
        self.tick_interval
    }

    pub fn shutdown_timeout(&self) -> Duration {
        self.shutdown_timeout
    }

    /// Drive one tick of accepts, reads, dispatch, flushes and finalization.
    pub fn heartbeat(&mut self) -> TickReport {
        self.pump.metrics.tick();
        let mut report = TickReport::default();

        if self.accepting {
            self.accept_pending(&mut report);
        }

        for conn in self.connections.values_mut() {
            report.dispatched += self.pump.service(conn);
        }

        let now = Instant::now();
        let finished: Vec<ConnectionId> = self
            .connections
            .iter_mut()
            .filter_map(|(id, conn)| conn.finalize_if_done(now).then_some(*id))
            .collect();
        for id in finished {
            if let Some(conn) = self.connections.remove(&id) {
                self.pump.closed(&conn);
                report.closed.push((id, conn.disconnect_reason().cloned()));
            }
        }

        report.leaks = self.pump.maybe_sweep(now);
        report
    }

    fn accept_pending(&mut self, report: &mut TickReport) {
        for _ in 0..MAX_ACCEPTS_PER_TICK {
            let stream = match self.acceptor.try_accept() {
                Ok(Some(stream)) => stream,
                Ok(None) => break,
                Err(e) => {
                    self.pump.metrics.transport_error();
                    error!(error = %e, "Error accepting connection");
                    break;
                }
            };

            if self.connections.len() >= self.max_connections {
                self.reject(stream);
                continue;
            }

            let conn = self
                .pump
                .open(Box::new(stream), ConnectionState::Connecting);
            info!(connection = conn.id(), peer = conn.peer(), "New connection");
            report.accepted.push(conn.id());
            self.connections.insert(conn.id(), conn);
        }
    }

    fn reject(&self, mut stream: A::Stream) {
        self.pump.metrics.connection_rejected();
        warn!(
            peer = %stream.peer_label(),
            max_connections = self.max_connections,
            "Connection limit reached, rejecting"
        );
        let _ = stream.shutdown();
    }
}
