//! # Utility Modules
//!
//! Supporting utilities shared by the connection managers.
//!
//! ## Components
//! - **Pool**: Generational object pool with RAII checkouts and leak detection
//! - **Logging**: Structured logging configuration
//! - **Metrics**: Thread-safe observability counters

pub mod logging;
pub mod metrics;
pub mod pool;

pub use pool::{ObjectPool, PoolHandle, PoolSettings, Pooled, Recycle};
