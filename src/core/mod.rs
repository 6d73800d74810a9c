//! # Core Protocol Components
//!
//! Bit-level encoding, pooled packet writers and length-prefixed framing.
//!
//! ## Components
//! - **BitBuffer**: MSB-first bit-addressable buffer with static or growable storage
//! - **Packet**: Pooled writers and borrowed readers over frame payloads
//! - **Codec**: tokio-util codec for framing over byte streams
//!
//! ## Wire Format
//! ```text
//! [Length(L)] [Opcode(O)] [Payload(Length - L - O)]
//! ```
//!
//! ## Limits
//! - Length-prefixed strings and byte blobs: 65535 bytes
//! - Frame size: configurable, bounded by the length field width
//! - Length validated before any payload is buffered

pub mod bitbuf;
pub mod codec;
pub mod packet;
