//! # Connection Managers
//!
//! Tick-driven client and server managers built on the protocol layer.
//!
//! ## Components
//! - **Server**: Accepts connections and services all of them per heartbeat
//! - **Client**: Services a single outbound connection per heartbeat
//! - **Driver**: Optional tokio loop that calls `heartbeat()` on an interval
//!
//! ## Scheduling
//! `heartbeat()` is synchronous and never blocks on I/O. Managers are not
//! internally synchronized: drive each one from a single task or thread. The
//! writer pool is the only piece meant to be shared across threads.

pub mod client;
pub mod driver;
pub(crate) mod pump;
pub mod server;

use crate::protocol::connection::{ConnectionId, DisconnectReason};

/// What one heartbeat did
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TickReport {
    /// Connections accepted this tick
    pub accepted: Vec<ConnectionId>,
    /// Frames handed to handlers
    pub dispatched: usize,
    /// Connections finalized this tick, with the reason they disconnected
    pub closed: Vec<(ConnectionId, Option<DisconnectReason>)>,
    /// Pool leaks reported by this tick's sweep
    pub leaks: usize,
}

impl TickReport {
    /// True when nothing happened
    pub fn is_quiet(&self) -> bool {
        self.accepted.is_empty() && self.dispatched == 0 && self.closed.is_empty() && self.leaks == 0
    }
}
