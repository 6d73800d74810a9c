//! # Client Connection Manager
//!
//! Holds at most one connection to a server. Like the server manager, all I/O
//! and dispatch happen in [`ClientManager::heartbeat`].

use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{info, instrument};

use super::pump::Pump;
use super::TickReport;
use crate::config::NetworkConfig;
use crate::core::packet::{PacketReader, PacketWriter, WriterPool};
use crate::error::{constants, ProtocolError, Result};
use crate::protocol::connection::{Connection, ConnectionId, ConnectionLimits, ConnectionState};
use crate::transport::tcp::TcpTransport;
use crate::transport::ByteStream;
use crate::utils::metrics::Metrics;

/// Client-side connection manager
pub struct ClientManager {
    connection: Option<Connection>,
    address: String,
    connection_timeout: Duration,
    tick_interval: Duration,
    shutdown_timeout: Duration,
    pump: Pump,
}

impl ClientManager {
    pub fn new(config: &NetworkConfig) -> Self {
        let limits = ConnectionLimits::from(&config.client);
        Self {
            connection: None,
            address: config.client.address.clone(),
            connection_timeout: config.client.connection_timeout,
            tick_interval: config.client.tick_interval,
            shutdown_timeout: config.client.shutdown_timeout,
            pump: Pump::new(config, limits),
        }
    }

    /// Open a TCP connection to the configured server address.
    #[instrument(skip(self), fields(address = %self.address))]
    pub fn connect(&mut self) -> Result<ConnectionId> {
        self.ensure_unconnected()?;
        let stream = TcpTransport::connect(&self.address, self.connection_timeout)?;
        info!("Connected to server");
        self.attach(stream)
    }

    /// Adopt an already-created transport.
    ///
    /// The connection starts in `Connecting` and becomes `Connected` once the
    /// transport reports ready during a heartbeat. Fails while the previous
    /// connection has not been finalized by a heartbeat.
    pub fn attach<S: ByteStream + 'static>(&mut self, stream: S) -> Result<ConnectionId> {
        self.ensure_unconnected()?;
        let conn = self.pump.open(Box::new(stream), ConnectionState::Connecting);
        let id = conn.id();
        self.connection = Some(conn);
        Ok(id)
    }

    fn ensure_unconnected(&self) -> Result<()> {
        match self.connection {
            Some(_) => Err(ProtocolError::TransportError(
                constants::ERR_ALREADY_CONNECTED.to_string(),
            )),
            None => Ok(()),
        }
    }

    pub fn register<F>(&mut self, opcode: u32, handler: F) -> Result<()>
    where
        F: FnMut(&mut Connection, &mut PacketReader<'_>) -> Result<()> + Send + 'static,
    {
        self.pump.register(opcode, handler)
    }

    pub fn unregister(&mut self, opcode: u32) -> bool {
        self.pump.dispatcher.unregister(opcode)
    }

    pub fn writer_pool(&self) -> &WriterPool {
        &self.pump.writers
    }

    pub fn writer(&self, opcode: u32) -> Result<PacketWriter> {
        self.pump.writers.checkout(opcode)
    }

    pub fn metrics(&self) -> Arc<Metrics> {
        self.pump.metrics.clone()
    }

    /// State of the current connection; `Disconnected` when there is none
    pub fn state(&self) -> ConnectionState {
        self.connection
            .as_ref()
            .map_or(ConnectionState::Disconnected, Connection::state)
    }

    pub fn connection(&self) -> Option<&Connection> {
        self.connection.as_ref()
    }

    pub fn connection_mut(&mut self) -> Option<&mut Connection> {
        self.connection.as_mut()
    }

    /// Queue `writer`'s message for the server.
    pub fn send(&mut self, writer: &PacketWriter) -> Result<()> {
        self.connection
            .as_mut()
            .ok_or(ProtocolError::ConnectionClosed)?
            .send(writer)
    }

    /// Gracefully disconnect, flushing queued data first.
    pub fn disconnect(&mut self) {
        if let Some(conn) = self.connection.as_mut() {
            conn.disconnect();
        }
    }

    /// Disconnect immediately, discarding queued data.
    pub fn abort(&mut self) {
        if let Some(conn) = self.connection.as_mut() {
            conn.abort();
        }
    }

    pub fn is_idle(&self) -> bool {
        self.connection.is_none()
    }

    pub fn tick_interval(&self) -> Duration {
        self.tick_interval
    }

    pub fn shutdown_timeout(&self) -> Duration {
        self.shutdown_timeout
    }

    /// Drive one tick of reads, dispatch, flushes and finalization.
    pub fn heartbeat(&mut self) -> TickReport {
        self.pump.metrics.tick();
        let mut report = TickReport::default();
        let now = Instant::now();

        if let Some(conn) = self.connection.as_mut() {
            report.dispatched += self.pump.service(conn);
            if conn.finalize_if_done(now) {
                report.closed.push((conn.id(), conn.disconnect_reason().cloned()));
                self.pump.closed(conn);
                self.connection = None;
            }
        }

        report.leaks = self.pump.maybe_sweep(now);
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::bitbuf::{BitRead, BitWrite};
    use crate::protocol::connection::DisconnectReason;
    use crate::transport::memory::{pipe, MemoryListener};
    use std::sync::Mutex;

    #[test]
    fn test_connecting_until_accepted() {
        let mut listener = MemoryListener::new();
        let connector = listener.connector();
        let mut client = ClientManager::new(&NetworkConfig::default());
        assert_eq!(client.state(), ConnectionState::Disconnected);

        client.attach(connector.connect().unwrap()).unwrap();
        client.heartbeat();
        assert_eq!(client.state(), ConnectionState::Connecting);

        let mut writer = client.writer(1).unwrap();
        writer.write_u8(7).unwrap();
        client.send(&writer).unwrap();
        drop(writer);

        let mut server_end = crate::transport::Acceptor::try_accept(&mut listener)
            .unwrap()
            .unwrap();
        client.heartbeat();
        assert_eq!(client.state(), ConnectionState::Connected);

        let mut buf = [0u8; 8];
        let n = server_end.try_read(&mut buf).unwrap();
        assert_eq!(&buf[..n], &[0, 5, 0, 1, 7]);
    }

    #[test]
    fn test_receives_and_dispatches() {
        let (local, mut remote) = pipe();
        let mut client = ClientManager::new(&NetworkConfig::default());
        let seen = Arc::new(Mutex::new(None));
        let sink = seen.clone();
        client
            .register(3, move |_, reader| {
                *sink.lock().unwrap() = Some(reader.read_i16()?);
                Ok(())
            })
            .unwrap();
        client.attach(local).unwrap();

        remote.try_write(&[0, 6, 0, 3, 0xFF, 0xFE]).unwrap();
        let report = client.heartbeat();
        assert_eq!(report.dispatched, 1);
        assert_eq!(*seen.lock().unwrap(), Some(-2));
    }

    #[test]
    fn test_server_close_finalizes() {
        let (local, remote) = pipe();
        let mut client = ClientManager::new(&NetworkConfig::default());
        client.attach(local).unwrap();
        client.heartbeat();
        drop(remote);

        let report = client.heartbeat();
        assert_eq!(report.closed, vec![(1, Some(DisconnectReason::PeerClosed))]);
        assert!(client.is_idle());
        assert!(matches!(
            client.writer(1).and_then(|w| client.send(&w)),
            Err(ProtocolError::ConnectionClosed)
        ));
    }

    #[test]
    fn test_connect_refused_when_connected() {
        let (local, _remote) = pipe();
        let mut client = ClientManager::new(&NetworkConfig::default());
        client.attach(local).unwrap();
        assert!(matches!(
            client.connect(),
            Err(ProtocolError::TransportError(_))
        ));
    }

    #[test]
    fn test_attach_refused_while_previous_connection_live() {
        let (first, mut first_remote) = pipe();
        let (second, _second_remote) = pipe();
        let mut client = ClientManager::new(&NetworkConfig::default());
        client.attach(first).unwrap();
        client.heartbeat();

        client.connection_mut().unwrap().send_raw(1, b"keep").unwrap();
        assert_eq!(client.connection().unwrap().pending_outbound(), 8);

        assert!(matches!(
            client.attach(second),
            Err(ProtocolError::TransportError(_))
        ));
        assert_eq!(client.connection().unwrap().id(), 1);

        // The queued frame still reaches the original peer
        let report = client.heartbeat();
        assert!(report.closed.is_empty());
        let mut buf = [0u8; 16];
        assert_eq!(first_remote.try_read(&mut buf).unwrap(), 8);
        assert_eq!(&buf[4..8], b"keep");
    }

    #[test]
    fn test_attach_after_disconnect_finalizes() {
        let (first, _first_remote) = pipe();
        let (second, _second_remote) = pipe();
        let mut client = ClientManager::new(&NetworkConfig::default());
        client.attach(first).unwrap();
        client.heartbeat();

        client.disconnect();
        assert!(client.attach(second).is_err());

        let report = client.heartbeat();
        assert_eq!(report.closed, vec![(1, Some(DisconnectReason::LocalShutdown))]);
        let second = pipe().0;
        assert_eq!(client.attach(second).unwrap(), 2);
    }
}
