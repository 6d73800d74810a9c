//! # Transport Layer
//!
//! The byte-stream boundary the connection managers are written against.
//!
//! Managers never block on I/O: every call here either makes progress
//! immediately or reports `io::ErrorKind::WouldBlock`, and the manager moves
//! on to the next connection.
//!
//! ## Implementations
//! - **TCP**: non-blocking `std::net` sockets
//! - **Memory**: in-process pipes for tests and single-process setups

use std::io;

pub mod memory;
pub mod tcp;

/// A reliable, ordered, non-blocking byte stream
pub trait ByteStream: Send {
    /// Read into `buf`.
    ///
    /// `Ok(0)` means the peer closed the stream. `WouldBlock` means no bytes
    /// are available right now.
    fn try_read(&mut self, buf: &mut [u8]) -> io::Result<usize>;

    /// Write from `buf`, returning how many bytes were accepted.
    ///
    /// `WouldBlock` means the stream cannot take any bytes right now.
    fn try_write(&mut self, buf: &[u8]) -> io::Result<usize>;

    /// Whether the transport-level connect has completed.
    fn poll_ready(&mut self) -> io::Result<bool> {
        Ok(true)
    }

    /// Close both directions. Called once when the connection is finalized.
    fn shutdown(&mut self) -> io::Result<()>;

    /// Human-readable peer description for logs
    fn peer_label(&self) -> String {
        String::from("unknown")
    }
}

impl<S: ByteStream + ?Sized> ByteStream for Box<S> {
    fn try_read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        (**self).try_read(buf)
    }

    fn try_write(&mut self, buf: &[u8]) -> io::Result<usize> {
        (**self).try_write(buf)
    }

    fn poll_ready(&mut self) -> io::Result<bool> {
        (**self).poll_ready()
    }

    fn shutdown(&mut self) -> io::Result<()> {
        (**self).shutdown()
    }

    fn peer_label(&self) -> String {
        (**self).peer_label()
    }
}

/// Source of inbound streams for a server
pub trait Acceptor: Send {
    type Stream: ByteStream + 'static;

    /// Accept one pending stream, or `Ok(None)` when none is waiting.
    fn try_accept(&mut self) -> io::Result<Option<Self::Stream>>;
}

/// True for errors that mean "try again next tick"
#[inline]
pub fn is_transient(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted
    )
}
