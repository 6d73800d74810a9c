#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
//! Edge-case tests for connection isolation, resource limits and pool misuse
//! Tests boundary conditions and error scenarios across the manager stack

use std::sync::{Arc, Mutex};
use std::time::Duration;

use tickwire::config::NetworkConfig;
use tickwire::core::bitbuf::{BitBuffer, BitRead, BitWrite, BufferMode};
use tickwire::core::codec::FieldWidth;
use tickwire::core::packet::WriterPool;
use tickwire::error::ProtocolError;
use tickwire::protocol::connection::{ConnectionState, DisconnectReason};
use tickwire::service::server::ServerManager;
use tickwire::transport::memory::{MemoryConnector, MemoryListener, MemoryStream};
use tickwire::transport::ByteStream;
use tickwire::utils::pool::PoolSettings;

fn server_with(config: &NetworkConfig) -> (ServerManager<MemoryListener>, MemoryConnector) {
    let listener = MemoryListener::new();
    let connector = listener.connector();
    (ServerManager::with_acceptor(listener, config), connector)
}

fn counting_handler(
    server: &mut ServerManager<MemoryListener>,
    opcode: u32,
) -> Arc<Mutex<Vec<u64>>> {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = seen.clone();
    server
        .register(opcode, move |conn, _| {
            sink.lock().unwrap().push(conn.id());
            Ok(())
        })
        .unwrap();
    seen
}

fn read_all(stream: &mut MemoryStream) -> Vec<u8> {
    let mut out = Vec::new();
    let mut buf = [0u8; 64];
    while let Ok(n) = stream.try_read(&mut buf) {
        if n == 0 {
            break;
        }
        out.extend_from_slice(&buf[..n]);
    }
    out
}

// ============================================================================
// FRAMING FAULTS
// ============================================================================

#[test]
fn test_malformed_frame_isolates_connection() {
    let (mut server, connector) = server_with(&NetworkConfig::default());
    let seen = counting_handler(&mut server, 1);

    let mut bad = connector.connect().unwrap();
    let mut good = connector.connect().unwrap();
    server.heartbeat();

    // A valid frame followed by a length shorter than the header
    bad.try_write(&[0, 4, 0, 1, 0, 2, 0, 1]).unwrap();
    good.try_write(&[0, 4, 0, 1]).unwrap();
    let report = server.heartbeat();

    assert_eq!(report.dispatched, 2);
    assert_eq!(*seen.lock().unwrap(), vec![1, 2]);
    assert_eq!(report.closed.len(), 1);
    assert!(matches!(
        report.closed[0],
        (1, Some(DisconnectReason::MalformedFrame(_)))
    ));
    assert_eq!(server.connection_count(), 1);
    assert!(server.connection(2).unwrap().is_connected());
    assert_eq!(server.metrics().snapshot().malformed_frames, 1);

    // Further bytes from the healthy peer still flow
    good.try_write(&[0, 4, 0, 1]).unwrap();
    assert_eq!(server.heartbeat().dispatched, 1);
}

#[test]
fn test_oversized_length_prefix_disconnects() {
    let config = NetworkConfig::default_with_overrides(|c| c.framing.max_frame_size = 64);
    let (mut server, connector) = server_with(&config);
    let _seen = counting_handler(&mut server, 1);

    let mut peer = connector.connect().unwrap();
    server.heartbeat();
    peer.try_write(&[0xFF, 0xFF, 0, 1]).unwrap();

    let report = server.heartbeat();
    assert_eq!(report.dispatched, 0);
    assert!(matches!(
        report.closed.as_slice(),
        [(1, Some(DisconnectReason::MalformedFrame(msg)))] if msg.contains("exceeds configured maximum")
    ));
}

#[test]
fn test_partial_frame_waits_for_rest() {
    let (mut server, connector) = server_with(&NetworkConfig::default());
    let seen = counting_handler(&mut server, 1);
    let mut peer = connector.connect().unwrap();
    server.heartbeat();

    peer.try_write(&[0, 6, 0]).unwrap();
    assert_eq!(server.heartbeat().dispatched, 0);
    assert_eq!(server.connection(1).unwrap().pending_inbound(), 3);

    peer.try_write(&[1, 0xAA]).unwrap();
    assert_eq!(server.heartbeat().dispatched, 0);

    peer.try_write(&[0xBB]).unwrap();
    assert_eq!(server.heartbeat().dispatched, 1);
    assert_eq!(server.connection(1).unwrap().pending_inbound(), 0);
    assert_eq!(seen.lock().unwrap().len(), 1);
}

// ============================================================================
// UNKNOWN OPCODES AND HANDLER FAULTS
// ============================================================================

#[test]
fn test_unknown_opcode_drops_frame_by_default() {
    let (mut server, connector) = server_with(&NetworkConfig::default());
    let seen = counting_handler(&mut server, 1);
    let mut peer = connector.connect().unwrap();
    server.heartbeat();

    peer.try_write(&[0, 4, 0, 9, 0, 4, 0, 1]).unwrap();
    let report = server.heartbeat();

    assert_eq!(report.dispatched, 1);
    assert!(report.closed.is_empty());
    assert_eq!(seen.lock().unwrap().len(), 1);
    assert_eq!(server.metrics().snapshot().unknown_opcodes, 1);
}

#[test]
fn test_unknown_opcode_disconnects_when_configured() {
    let config =
        NetworkConfig::default_with_overrides(|c| c.framing.disconnect_on_unknown_opcode = true);
    let (mut server, connector) = server_with(&config);
    let seen = counting_handler(&mut server, 1);
    let mut peer = connector.connect().unwrap();
    server.heartbeat();

    peer.try_write(&[0, 4, 0, 9, 0, 4, 0, 1]).unwrap();
    let report = server.heartbeat();

    assert_eq!(report.dispatched, 0);
    assert!(seen.lock().unwrap().is_empty());
    assert_eq!(
        report.closed,
        vec![(1, Some(DisconnectReason::UnknownOpcode(9)))]
    );
}

#[test]
fn test_handler_error_keeps_connection() {
    let (mut server, connector) = server_with(&NetworkConfig::default());
    server
        .register(1, |_, reader| reader.read_u64().map(|_| ()))
        .unwrap();
    let mut peer = connector.connect().unwrap();
    server.heartbeat();

    peer.try_write(&[0, 5, 0, 1, 0xFF]).unwrap();
    let report = server.heartbeat();

    assert_eq!(report.dispatched, 1);
    assert!(report.closed.is_empty());
    assert_eq!(server.metrics().snapshot().handler_errors, 1);
    assert_eq!(server.connection(1).unwrap().state(), ConnectionState::Connected);
}

#[test]
fn test_handler_disconnect_stops_further_dispatch() {
    let (mut server, connector) = server_with(&NetworkConfig::default());
    let count = Arc::new(Mutex::new(0));
    let counter = count.clone();
    server
        .register(1, move |conn, _| {
            *counter.lock().unwrap() += 1;
            conn.disconnect();
            Ok(())
        })
        .unwrap();
    let mut peer = connector.connect().unwrap();
    server.heartbeat();

    peer.try_write(&[0, 4, 0, 1, 0, 4, 0, 1, 0, 4, 0, 1]).unwrap();
    let report = server.heartbeat();

    assert_eq!(*count.lock().unwrap(), 1);
    assert_eq!(report.dispatched, 1);
    assert_eq!(
        report.closed,
        vec![(1, Some(DisconnectReason::LocalShutdown))]
    );
}

// ============================================================================
// OUTBOUND LIMITS AND DISCONNECT SEMANTICS
// ============================================================================

#[test]
fn test_backpressure_on_slow_peer() {
    let config = NetworkConfig::default_with_overrides(|c| c.server.max_outbound_bytes = 32);
    let (mut server, connector) = server_with(&config);
    let _peer = connector.connect().unwrap();
    server.heartbeat();

    let mut writer = server.writer(1).unwrap();
    writer.write_raw(&[0u8; 20]).unwrap();
    server.send_to(1, &writer).unwrap();
    assert!(matches!(
        server.send_to(1, &writer),
        Err(ProtocolError::Backpressure { queued: 24, limit: 32 })
    ));
    assert_eq!(server.broadcast(&writer), 0);
}

#[test]
fn test_abort_discards_unflushed() {
    let (mut server, connector) = server_with(&NetworkConfig::default());
    let mut peer = connector.connect().unwrap();
    server.heartbeat();

    let mut writer = server.writer(3).unwrap();
    writer.write_u32(0xDEAD_BEEF).unwrap();
    server.send_to(1, &writer).unwrap();
    assert!(server.abort(1));

    let report = server.heartbeat();
    assert_eq!(report.closed, vec![(1, Some(DisconnectReason::Aborted))]);
    assert!(read_all(&mut peer).is_empty());
}

#[test]
fn test_send_after_disconnect_fails() {
    let (mut server, connector) = server_with(&NetworkConfig::default());
    let _peer = connector.connect().unwrap();
    server.heartbeat();
    assert!(server.disconnect(1));

    let writer = server.writer(1).unwrap();
    assert!(matches!(
        server.send_to(1, &writer),
        Err(ProtocolError::ConnectionClosed)
    ));
    server.heartbeat();
    assert!(matches!(
        server.send_to(1, &writer),
        Err(ProtocolError::ConnectionClosed)
    ));
    assert!(!server.disconnect(1));
}

#[test]
fn test_u8_opcode_width_end_to_end() {
    let config = NetworkConfig::default_with_overrides(|c| {
        c.framing.opcode_width = FieldWidth::U8;
        c.framing.length_width = FieldWidth::U8;
        c.framing.max_frame_size = 255;
    });
    let (mut server, connector) = server_with(&config);
    let seen = counting_handler(&mut server, 200);
    let mut peer = connector.connect().unwrap();
    server.heartbeat();

    peer.try_write(&[3, 200, 0x01]).unwrap();
    assert_eq!(server.heartbeat().dispatched, 1);
    assert_eq!(seen.lock().unwrap().len(), 1);
}

// ============================================================================
// BUFFER AND POOL EDGE CASES
// ============================================================================

#[test]
fn test_string_length_limit() {
    let mut buf = BitBuffer::new();
    let exact = "a".repeat(65_535);
    buf.write_string(&exact).unwrap();
    assert_eq!(buf.read_string().unwrap().len(), 65_535);

    let before = buf.written_bits();
    let too_long = "a".repeat(65_536);
    assert!(matches!(
        buf.write_string(&too_long),
        Err(ProtocolError::ValueTooLarge { len: 65_536, max: 65_535 })
    ));
    assert_eq!(buf.written_bits(), before);
}

#[test]
fn test_static_buffer_rejects_partial_string() {
    let mut buf = BitBuffer::with_capacity(4, BufferMode::Static);
    buf.write_u8(1).unwrap();
    assert!(matches!(
        buf.write_string("abcd"),
        Err(ProtocolError::CapacityExceeded { .. })
    ));
    assert_eq!(buf.written_bits(), 8);
    assert_eq!(buf.read_u8().unwrap(), 1);
}

#[test]
fn test_pool_exhaustion_and_recovery() {
    let pool = WriterPool::new(
        PoolSettings {
            initial_size: 1,
            max_size: Some(2),
            leak_threshold: None,
        },
        64,
    );
    let a = pool.checkout(1).unwrap();
    let _b = pool.checkout(1).unwrap();
    assert!(matches!(pool.checkout(1), Err(ProtocolError::PoolExhausted(2))));

    drop(a);
    assert!(pool.checkout(1).is_ok());
}

#[test]
fn test_leak_sweep_through_manager() {
    let config = NetworkConfig::default_with_overrides(|c| {
        c.pool.leak_detection = true;
        c.pool.leak_threshold = Duration::from_millis(10);
        c.pool.leak_sweep_interval = Duration::from_millis(1);
    });
    let (mut server, _connector) = server_with(&config);

    let _leaked = server.writer(1).unwrap();
    std::thread::sleep(Duration::from_millis(30));

    let mut leaks = 0;
    for _ in 0..5 {
        leaks += server.heartbeat().leaks;
        std::thread::sleep(Duration::from_millis(2));
    }
    assert_eq!(leaks, 1);
    assert_eq!(server.metrics().snapshot().pool_leaks, 1);
}
