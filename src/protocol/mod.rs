//! # Protocol Layer
//!
//! Per-connection state and opcode routing.
//!
//! ## Components
//! - **Connection**: Transport, accumulators and the connection state machine
//! - **Dispatcher**: Opcode-keyed handler table invoked once per inbound frame
//!
//! ## Failure Isolation
//! Every fault detected here (malformed length prefix, unknown opcode,
//! transport failure) is scoped to the one connection it occurred on.

pub mod connection;
pub mod dispatcher;
