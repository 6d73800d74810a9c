//! End-to-end tests: client manager -> framing -> server manager -> handlers

#![allow(clippy::unwrap_used, clippy::expect_used)]

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tickwire::prelude::*;
use tickwire::transport::memory::MemoryListener;

fn pump_until<F: FnMut() -> bool>(mut step: F) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while !step() {
        assert!(Instant::now() < deadline, "condition not reached in time");
        std::thread::sleep(Duration::from_millis(1));
    }
}

#[test]
fn test_hello_42_over_memory() {
    let listener = MemoryListener::new();
    let connector = listener.connector();
    let config = NetworkConfig::default();

    let received = Arc::new(Mutex::new(Vec::new()));
    let mut server = ServerManager::with_acceptor(listener, &config);
    let sink = received.clone();
    server
        .register(1, move |_conn, reader| {
            let text = reader.read_string()?;
            let value = reader.read_i32()?;
            sink.lock().unwrap().push((text, value));
            Ok(())
        })
        .unwrap();

    let mut client = ClientManager::new(&config);
    client.attach(connector.connect().unwrap()).unwrap();

    let mut writer = client.writer(1).unwrap();
    writer.write_string("hello").unwrap();
    writer.write_i32(42).unwrap();
    client.send(&writer).unwrap();
    client.writer_pool().release(writer).unwrap();

    let mut dispatched = 0;
    pump_until(|| {
        dispatched += server.heartbeat().dispatched;
        client.heartbeat();
        dispatched > 0
    });

    assert_eq!(dispatched, 1);
    assert_eq!(*received.lock().unwrap(), vec![("hello".to_string(), 42)]);
    assert_eq!(client.writer_pool().stats().checked_out, 0);
}

#[test]
fn test_hello_42_over_tcp() {
    let mut config = NetworkConfig::default();
    config.server.address = "127.0.0.1:0".to_string();

    let received = Arc::new(Mutex::new(Vec::new()));
    let mut server = ServerManager::bind(&config).unwrap();
    config.client.address = server.local_addr().unwrap().to_string();

    let sink = received.clone();
    let replies = server.writer_pool().clone();
    server
        .register(1, move |conn, reader| {
            let text = reader.read_string()?;
            let value = reader.read_i32()?;
            sink.lock().unwrap().push((text, value));

            let mut ack = replies.checkout(2)?;
            ack.write_i32(value)?;
            conn.send(&ack)
        })
        .unwrap();

    let acks = Arc::new(Mutex::new(Vec::new()));
    let mut client = ClientManager::new(&config);
    let ack_sink = acks.clone();
    client
        .register(2, move |_conn, reader| {
            ack_sink.lock().unwrap().push(reader.read_i32()?);
            Ok(())
        })
        .unwrap();
    client.connect().unwrap();

    let mut writer = client.writer(1).unwrap();
    writer.write_string("hello").unwrap();
    writer.write_i32(42).unwrap();
    client.send(&writer).unwrap();
    drop(writer);

    pump_until(|| {
        server.heartbeat();
        client.heartbeat();
        !acks.lock().unwrap().is_empty()
    });

    assert_eq!(*received.lock().unwrap(), vec![("hello".to_string(), 42)]);
    assert_eq!(*acks.lock().unwrap(), vec![42]);
    assert_eq!(server.connection_count(), 1);
    assert_eq!(client.state(), ConnectionState::Connected);

    // Client hangs up; the server notices and finalizes
    client.disconnect();
    let mut closed = Vec::new();
    pump_until(|| {
        client.heartbeat();
        closed.extend(server.heartbeat().closed);
        !closed.is_empty()
    });
    assert_eq!(closed[0].1, Some(DisconnectReason::PeerClosed));
    assert!(client.is_idle());
}

#[test]
fn test_many_clients_ordered_per_connection() {
    let listener = MemoryListener::new();
    let connector = listener.connector();
    let config = NetworkConfig::default();

    let log = Arc::new(Mutex::new(Vec::new()));
    let mut server = ServerManager::with_acceptor(listener, &config);
    let sink = log.clone();
    server
        .register(10, move |conn, reader| {
            sink.lock().unwrap().push((conn.id(), reader.read_u16()?));
            Ok(())
        })
        .unwrap();

    let mut clients: Vec<ClientManager> = (0..5)
        .map(|_| {
            let mut client = ClientManager::new(&config);
            client.attach(connector.connect().unwrap()).unwrap();
            client
        })
        .collect();

    for client in &mut clients {
        for seq in 0..20u16 {
            let mut writer = client.writer(10).unwrap();
            writer.write_u16(seq).unwrap();
            client.send(&writer).unwrap();
        }
    }

    pump_until(|| {
        server.heartbeat();
        for client in &mut clients {
            client.heartbeat();
        }
        log.lock().unwrap().len() == 100
    });

    let log = log.lock().unwrap();
    for id in server.connection_ids() {
        let seqs: Vec<u16> = log.iter().filter(|(c, _)| *c == id).map(|(_, s)| *s).collect();
        assert_eq!(seqs, (0..20).collect::<Vec<_>>());
    }
}

#[test]
fn test_broadcast_reaches_all_clients() {
    let listener = MemoryListener::new();
    let connector = listener.connector();
    let config = NetworkConfig::default();
    let mut server = ServerManager::with_acceptor(listener, &config);

    let hits = Arc::new(Mutex::new(0usize));
    let mut clients: Vec<ClientManager> = (0..3)
        .map(|_| {
            let mut client = ClientManager::new(&config);
            let counter = hits.clone();
            client
                .register(7, move |_, reader| {
                    assert_eq!(reader.read_string()?, "tick");
                    *counter.lock().unwrap() += 1;
                    Ok(())
                })
                .unwrap();
            client.attach(connector.connect().unwrap()).unwrap();
            client
        })
        .collect();

    server.heartbeat();
    assert_eq!(server.connection_count(), 3);

    let mut writer = server.writer(7).unwrap();
    writer.write_string("tick").unwrap();
    assert_eq!(server.broadcast(&writer), 3);
    drop(writer);

    pump_until(|| {
        server.heartbeat();
        for client in &mut clients {
            client.heartbeat();
        }
        *hits.lock().unwrap() == 3
    });
}

#[test]
fn test_reply_survives_peer_half_close_over_tcp() {
    use std::io::{Read, Write};
    use std::net::{Shutdown, TcpStream};

    let mut config = NetworkConfig::default();
    config.server.address = "127.0.0.1:0".to_string();
    let mut server = ServerManager::bind(&config).unwrap();
    let addr = server.local_addr().unwrap();

    let replies = server.writer_pool().clone();
    server
        .register(1, move |conn, reader| {
            let value = reader.read_u8()?;
            let mut ack = replies.checkout(2)?;
            ack.write_u8(value + 1)?;
            conn.send(&ack)
        })
        .unwrap();

    // Request, then close only the write half
    let mut peer = TcpStream::connect(addr).unwrap();
    peer.write_all(&[0, 5, 0, 1, 41]).unwrap();
    peer.shutdown(Shutdown::Write).unwrap();

    let mut closed = Vec::new();
    pump_until(|| {
        closed.extend(server.heartbeat().closed);
        !closed.is_empty()
    });
    assert_eq!(closed[0].1, Some(DisconnectReason::PeerClosed));

    peer.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
    let mut reply = Vec::new();
    peer.read_to_end(&mut reply).unwrap();
    assert_eq!(reply, vec![0, 5, 0, 2, 42]);
}
