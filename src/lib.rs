//! # tickwire
//!
//! Bit-level packet serialization, pooled packet writers and tick-driven
//! connection managers for real-time game networking.
//!
//! ## Layers
//! - [`core`]: `BitBuffer`, packet writers/readers and the frame codec
//! - [`utils`]: generational object pool, logging setup and metrics
//! - [`transport`]: non-blocking byte streams (TCP and in-memory)
//! - [`protocol`]: connections and opcode dispatch
//! - [`service`]: client and server managers plus an optional tokio driver
//!
//! ## Example
//! ```rust
//! use tickwire::prelude::*;
//! use tickwire::transport::memory::MemoryListener;
//!
//! let listener = MemoryListener::new();
//! let connector = listener.connector();
//! let config = NetworkConfig::default();
//! let mut server = ServerManager::with_acceptor(listener, &config);
//! server
//!     .register(1, |_conn, reader| {
//!         assert_eq!(reader.read_string()?, "hello");
//!         assert_eq!(reader.read_i32()?, 42);
//!         Ok(())
//!     })
//!     .unwrap();
//!
//! let mut client = ClientManager::new(&config);
//! client.attach(connector.connect().unwrap()).unwrap();
//!
//! let mut writer = client.writer(1).unwrap();
//! writer.write_string("hello").unwrap();
//! writer.write_i32(42).unwrap();
//! client.send(&writer).unwrap();
//! drop(writer);
//!
//! server.heartbeat();
//! client.heartbeat();
//! assert_eq!(server.heartbeat().dispatched, 1);
//! ```

#![cfg_attr(not(test), warn(clippy::unwrap_used, clippy::expect_used))]

pub mod config;
pub mod core;
pub mod error;
pub mod protocol;
pub mod service;
pub mod transport;
pub mod utils;

pub use error::{ProtocolError, Result};

/// Commonly used types
pub mod prelude {
    pub use crate::config::NetworkConfig;
    pub use crate::core::bitbuf::{BitBuffer, BitRead, BitWrite, BufferMode};
    pub use crate::core::codec::{FieldWidth, Frame, FrameCodec};
    pub use crate::core::packet::{PacketReader, PacketWriter, WriterPool};
    pub use crate::error::{ProtocolError, Result};
    pub use crate::protocol::connection::{Connection, ConnectionId, ConnectionState, DisconnectReason};
    pub use crate::service::client::ClientManager;
    pub use crate::service::server::ServerManager;
    pub use crate::service::TickReport;
    pub use crate::utils::pool::{ObjectPool, PoolHandle, Pooled, Recycle};
}
