use crate::core::packet::PacketReader;
use crate::error::{ProtocolError, Result};
use crate::protocol::connection::Connection;
use std::collections::HashMap;
use tracing::debug;

type HandlerFn = dyn FnMut(&mut Connection, &mut PacketReader<'_>) -> Result<()> + Send + 'static;

/// Opcode-keyed handler table.
///
/// Owned by a single connection manager and only touched from its tick, so
/// handlers may keep mutable state without locking.
#[derive(Default)]
pub struct Dispatcher {
    handlers: HashMap<u32, Box<HandlerFn>>,
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut opcodes: Vec<_> = self.handlers.keys().copied().collect();
        opcodes.sort_unstable();
        f.debug_struct("Dispatcher")
            .field("opcodes", &opcodes)
            .finish()
    }
}

impl Dispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `handler` for `opcode`, replacing any previous one.
    pub fn register<F>(&mut self, opcode: u32, handler: F)
    where
        F: FnMut(&mut Connection, &mut PacketReader<'_>) -> Result<()> + Send + 'static,
    {
        if self.handlers.insert(opcode, Box::new(handler)).is_some() {
            debug!(opcode, "Replaced existing handler");
        }
    }

    /// Remove the handler for `opcode`, returning whether one was registered.
    pub fn unregister(&mut self, opcode: u32) -> bool {
        self.handlers.remove(&opcode).is_some()
    }

    pub fn is_registered(&self, opcode: u32) -> bool {
        self.handlers.contains_key(&opcode)
    }

    /// Route one frame to its handler.
    ///
    /// Fails with `UnknownOpcode` when nothing is registered; otherwise
    /// returns whatever the handler returned.
    pub fn dispatch(&mut self, conn: &mut Connection, reader: &mut PacketReader<'_>) -> Result<()> {
        let opcode = reader.opcode();
        self.handlers
            .get_mut(&opcode)
            .ok_or(ProtocolError::UnknownOpcode(opcode))
            .and_then(|handler| handler(conn, reader))
    }
}
