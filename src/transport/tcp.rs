//! Non-blocking TCP transport over `std::net`.
//!
//! Sockets are switched to non-blocking mode as soon as they are wrapped, so
//! reads and writes surface `WouldBlock` instead of parking the tick thread.

use std::io::{self, Read, Write};
use std::net::{Shutdown, SocketAddr, TcpListener, TcpStream, ToSocketAddrs};
use std::time::Duration;

use tracing::{debug, instrument};

use super::{Acceptor, ByteStream};
use crate::error::{ProtocolError, Result};

/// A connected, non-blocking TCP stream
#[derive(Debug)]
pub struct TcpTransport {
    stream: TcpStream,
    peer: Option<SocketAddr>,
}

impl TcpTransport {
    /// Wrap an established stream, switching it to non-blocking mode.
    pub fn from_std(stream: TcpStream) -> io::Result<Self> {
        stream.set_nonblocking(true)?;
        stream.set_nodelay(true)?;
        let peer = stream.peer_addr().ok();
        Ok(Self { stream, peer })
    }

    /// Connect to `address`, trying each resolved address in turn.
    ///
    /// The connect itself blocks for at most `timeout` per address.
    #[instrument(skip(timeout))]
    pub fn connect(address: &str, timeout: Duration) -> Result<Self> {
        let addrs = address.to_socket_addrs().map_err(|e| {
            ProtocolError::TransportError(format!("Failed to resolve {address}: {e}"))
        })?;

        let mut last_err = None;
        for addr in addrs {
            match TcpStream::connect_timeout(&addr, timeout) {
                Ok(stream) => {
                    debug!(peer = %addr, "TCP connection established");
                    return Ok(Self::from_std(stream)?);
                }
                Err(e) => last_err = Some(e),
            }
        }

        Err(match last_err {
            Some(e) => ProtocolError::Io(e),
            None => ProtocolError::TransportError(format!("No addresses for {address}")),
        })
    }

    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.peer
    }
}

impl ByteStream for TcpTransport {
    fn try_read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.stream.read(buf)
    }

    fn try_write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.stream.write(buf)
    }

    fn poll_ready(&mut self) -> io::Result<bool> {
        if let Some(err) = self.stream.take_error()? {
            return Err(err);
        }
        Ok(self.stream.peer_addr().is_ok())
    }

    fn shutdown(&mut self) -> io::Result<()> {
        match self.stream.shutdown(Shutdown::Both) {
            Err(e) if e.kind() != io::ErrorKind::NotConnected => Err(e),
            _ => Ok(()),
        }
    }

    fn peer_label(&self) -> String {
        self.peer
            .map(|addr| addr.to_string())
            .unwrap_or_else(|| String::from("unknown"))
    }
}

/// Non-blocking TCP listener
#[derive(Debug)]
pub struct TcpAcceptor {
    listener: TcpListener,
}

impl TcpAcceptor {
    #[instrument]
    pub fn bind(address: &str) -> Result<Self> {
        let listener = TcpListener::bind(address)?;
        listener.set_nonblocking(true)?;
        Ok(Self { listener })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }
}

impl Acceptor for TcpAcceptor {
    type Stream = TcpTransport;

    fn try_accept(&mut self) -> io::Result<Option<TcpTransport>> {
        match self.listener.accept() {
            Ok((stream, _)) => TcpTransport::from_std(stream).map(Some),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(None),
            Err(e) => Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::is_transient;

    #[test]
    fn test_accept_without_pending_is_none() {
        let mut acceptor = TcpAcceptor::bind("127.0.0.1:0").unwrap();
        assert!(acceptor.try_accept().unwrap().is_none());
    }

    #[test]
    fn test_connect_and_exchange() {
        let mut acceptor = TcpAcceptor::bind("127.0.0.1:0").unwrap();
        let addr = acceptor.local_addr().unwrap().to_string();
        let mut client = TcpTransport::connect(&addr, Duration::from_secs(1)).unwrap();
        assert!(client.poll_ready().unwrap());

        let mut server = loop {
            if let Some(stream) = acceptor.try_accept().unwrap() {
                break stream;
            }
            std::thread::sleep(Duration::from_millis(1));
        };

        let mut buf = [0u8; 8];
        let err = server.try_read(&mut buf).unwrap_err();
        assert!(is_transient(&err));

        assert_eq!(client.try_write(b"ping").unwrap(), 4);
        let read = loop {
            match server.try_read(&mut buf) {
                Ok(n) => break n,
                Err(e) if is_transient(&e) => std::thread::sleep(Duration::from_millis(1)),
                Err(e) => panic!("read failed: {e}"),
            }
        };
        assert_eq!(&buf[..read], b"ping");
    }

    #[test]
    fn test_connect_refused() {
        let acceptor = TcpAcceptor::bind("127.0.0.1:0").unwrap();
        let addr = acceptor.local_addr().unwrap().to_string();
        drop(acceptor);
        assert!(TcpTransport::connect(&addr, Duration::from_millis(200)).is_err());
    }
}
