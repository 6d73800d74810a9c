//! # In-Memory Transport
//!
//! Bidirectional in-process pipes with the same non-blocking contract as a
//! socket. Used by tests and by setups that host client and server in one
//! process.
//!
//! A stream created by [`MemoryConnector::connect`] reports not-ready until
//! the matching [`MemoryListener`] has accepted the other end, which lets the
//! client side observe the `Connecting` state.

use std::collections::VecDeque;
use std::io;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use super::{Acceptor, ByteStream};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Side {
    A,
    B,
}

#[derive(Debug, Default)]
struct Link {
    a_to_b: VecDeque<u8>,
    b_to_a: VecDeque<u8>,
    a_closed: bool,
    b_closed: bool,
    accepted: bool,
    capacity: Option<usize>,
}

impl Link {
    fn incoming(&mut self, side: Side) -> (&mut VecDeque<u8>, bool) {
        match side {
            Side::A => (&mut self.b_to_a, self.b_closed),
            Side::B => (&mut self.a_to_b, self.a_closed),
        }
    }

    fn outgoing(&mut self, side: Side) -> &mut VecDeque<u8> {
        match side {
            Side::A => &mut self.a_to_b,
            Side::B => &mut self.b_to_a,
        }
    }

    fn closed(&self) -> bool {
        self.a_closed || self.b_closed
    }

    fn close(&mut self, side: Side) {
        match side {
            Side::A => self.a_closed = true,
            Side::B => self.b_closed = true,
        }
    }
}

/// One end of an in-memory pipe
#[derive(Debug)]
pub struct MemoryStream {
    link: Arc<Mutex<Link>>,
    side: Side,
    read_limit: Option<usize>,
    label: String,
}

/// Create a connected pair of streams with unbounded buffering.
pub fn pipe() -> (MemoryStream, MemoryStream) {
    pipe_with_capacity(None)
}

/// Create a connected pair where each direction buffers at most `capacity` bytes.
///
/// Writes beyond the capacity report `WouldBlock` until the reader drains.
pub fn pipe_with_capacity(capacity: Option<usize>) -> (MemoryStream, MemoryStream) {
    let link = Arc::new(Mutex::new(Link {
        accepted: true,
        capacity,
        ..Default::default()
    }));
    (
        MemoryStream::new(link.clone(), Side::A, "memory:a"),
        MemoryStream::new(link, Side::B, "memory:b"),
    )
}

impl MemoryStream {
    fn new(link: Arc<Mutex<Link>>, side: Side, label: &str) -> Self {
        Self {
            link,
            side,
            read_limit: None,
            label: label.to_string(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Link> {
        self.link.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Cap the bytes returned by a single `try_read`.
    pub fn set_read_limit(&mut self, limit: Option<usize>) {
        self.read_limit = limit;
    }

    /// Bytes written by the peer and not yet read
    pub fn pending(&self) -> usize {
        let side = self.side;
        let mut link = self.lock();
        link.incoming(side).0.len()
    }
}

impl ByteStream for MemoryStream {
    fn try_read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let side = self.side;
        let limit = self.read_limit.unwrap_or(usize::MAX);
        let mut link = self.lock();
        let (incoming, peer_closed) = link.incoming(side);

        if incoming.is_empty() {
            return if peer_closed {
                Ok(0)
            } else {
                Err(io::ErrorKind::WouldBlock.into())
            };
        }

        let n = incoming.len().min(buf.len()).min(limit);
        for (slot, byte) in buf.iter_mut().zip(incoming.drain(..n)) {
            *slot = byte;
        }
        Ok(n)
    }

    fn try_write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let side = self.side;
        let mut link = self.lock();
        if link.closed() {
            return Err(io::ErrorKind::BrokenPipe.into());
        }

        let capacity = link.capacity;
        let outgoing = link.outgoing(side);
        let room = capacity.map_or(usize::MAX, |cap| cap.saturating_sub(outgoing.len()));
        if room == 0 && !buf.is_empty() {
            return Err(io::ErrorKind::WouldBlock.into());
        }

        let n = buf.len().min(room);
        outgoing.extend(&buf[..n]);
        Ok(n)
    }

    fn poll_ready(&mut self) -> io::Result<bool> {
        let link = self.lock();
        if !link.accepted && link.closed() {
            return Err(io::ErrorKind::ConnectionRefused.into());
        }
        Ok(link.accepted)
    }

    fn shutdown(&mut self) -> io::Result<()> {
        let side = self.side;
        self.lock().close(side);
        Ok(())
    }

    fn peer_label(&self) -> String {
        self.label.clone()
    }
}

impl Drop for MemoryStream {
    fn drop(&mut self) {
        let side = self.side;
        self.lock().close(side);
    }
}

type Backlog = Mutex<VecDeque<MemoryStream>>;

/// In-memory listener; pair it with connectors from [`MemoryListener::connector`]
#[derive(Debug, Default)]
pub struct MemoryListener {
    backlog: Arc<Backlog>,
}

impl MemoryListener {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn connector(&self) -> MemoryConnector {
        MemoryConnector {
            backlog: Arc::downgrade(&self.backlog),
            next: Arc::new(Mutex::new(0)),
        }
    }
}

impl Acceptor for MemoryListener {
    type Stream = MemoryStream;

    fn try_accept(&mut self) -> io::Result<Option<MemoryStream>> {
        let stream = self
            .backlog
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop_front();
        if let Some(ref stream) = stream {
            stream.lock().accepted = true;
        }
        Ok(stream)
    }
}

/// Opens connections to a [`MemoryListener`]
#[derive(Debug, Clone)]
pub struct MemoryConnector {
    backlog: Weak<Backlog>,
    next: Arc<Mutex<u64>>,
}

impl MemoryConnector {
    /// Queue a connection on the listener and return the client end.
    ///
    /// The client end is not ready until the listener accepts.
    pub fn connect(&self) -> io::Result<MemoryStream> {
        let backlog = self
            .backlog
            .upgrade()
            .ok_or(io::ErrorKind::ConnectionRefused)?;

        let n = {
            let mut next = self.next.lock().unwrap_or_else(PoisonError::into_inner);
            *next += 1;
            *next
        };

        let link = Arc::new(Mutex::new(Link::default()));
        let client = MemoryStream::new(link.clone(), Side::A, &format!("memory-client:{n}"));
        let server = MemoryStream::new(link, Side::B, &format!("memory-server:{n}"));
        backlog
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push_back(server);
        Ok(client)
    }
}
