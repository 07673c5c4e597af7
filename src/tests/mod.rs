use std::{sync::Arc, time::Duration};

use assert_matches::assert_matches;
use bytes::Bytes;

use super::*;
use crate::connection::ReadError;

mod util;
use util::*;

#[test]
fn version_negotiation_killed_connection() {
    let _guard = subscribe();
    let mut pair = Pair::default();
    let conn = Connection::connect(client_config(), server_addr(), "localhost", pair.time)
        .expect("connect");
    pair.client.conn = Some(conn);
    pair.drive_client();

    // Answer the first flight with a Version Negotiation packet offering nothing we speak
    let first = pair.server.inbound.pop_front().expect("client Initial").1;
    let (decode, _) = PartialDecode::new(first, 8).unwrap();
    let mut buf = Vec::new();
    crate::packet::Header::VersionNegotiate {
        random: 0x23,
        // Copying from the offending packet is the listener's job; here we know them
        dst_cid: decode.dst_cid(),
        src_cid: decode.dst_cid(),
    }
    .encode(&mut buf);
    buf.extend_from_slice(&0xff00_001du32.to_be_bytes());
    pair.client
        .inbound
        .push_back((pair.time, buf.as_slice().into()));
    pair.drive_client();

    let client = pair.client();
    assert!(client.is_drained());
    assert_matches!(
        client.close_reason(),
        Some(ConnectionError::VersionMismatch)
    );
}

#[test]
fn handshake() {
    let _guard = subscribe();
    let mut pair = Pair::default();
    pair.connect();
    assert!(!pair.client().is_handshaking());
    assert!(!pair.server().is_handshaking());
    assert_eq!(pair.client().alpn_protocol().as_deref(), Some(&b"test-proto"[..]));
    // Both sides provisioned each other with spare connection IDs
    assert!(pair.client().stats().frame_tx.new_connection_id > 0);
    assert!(pair.server().stats().frame_tx.new_connection_id > 0);
}

/// The client streams 64 KiB of a fixed pattern over a unidirectional stream; the server
/// must observe exactly those bytes, in order, then EOF
#[test]
fn loopback_echo() {
    let _guard = subscribe();
    let mut pair = Pair::default();
    pair.connect();

    let payload: Vec<u8> = (0..=255u8).cycle().take(65536).collect();

    let id = pair.client().streams().open(Dir::Uni).expect("stream");
    let mut written = 0;
    while written < payload.len() {
        match pair.client().send_stream(id).write(&payload[written..]) {
            Ok(n) => written += n,
            Err(WriteError::Blocked) => pair.drive(),
            Err(e) => panic!("write failed: {e}"),
        }
    }
    pair.client().send_stream(id).finish().unwrap();
    pair.drive();

    let sid = pair.server().streams().accept(Dir::Uni).expect("incoming stream");
    assert_eq!(sid, id);
    let mut received = Vec::new();
    let eof = read_available(pair.server(), sid, &mut received);
    assert!(eof, "expected FIN after the payload");
    assert_eq!(received.len(), 65536);

    let expected = ring::digest::digest(&ring::digest::SHA256, &payload);
    let actual = ring::digest::digest(&ring::digest::SHA256, &received);
    assert_eq!(expected.as_ref(), actual.as_ref());

    pair.drive();
    assert_eq!(pair.client().bytes_in_flight(), 0);
}

/// Periodic datagram loss must be repaired by the reliability engine
#[test]
fn lossy_link_transfer_completes() {
    let _guard = subscribe();
    let mut pair = Pair::default();
    pair.connect();
    pair.server_drop_interval = Some(5);

    let payload: Vec<u8> = (0..=255u8).cycle().take(65536).collect();
    let id = pair.server().streams().open(Dir::Uni).expect("stream");
    let mut written = 0;
    while written < payload.len() {
        match pair.server().send_stream(id).write(&payload[written..]) {
            Ok(n) => written += n,
            Err(WriteError::Blocked) => pair.drive(),
            Err(e) => panic!("write failed: {e}"),
        }
    }
    pair.server().send_stream(id).finish().unwrap();
    pair.drive();

    let sid = pair.client().streams().accept(Dir::Uni).expect("incoming stream");
    let mut received = Vec::new();
    while !read_available(pair.client(), sid, &mut received) {
        pair.drive();
    }
    assert_eq!(received, payload);

    pair.drive();
    assert_eq!(pair.server().bytes_in_flight(), 0);
    let stats = pair.server().stats();
    assert!(stats.path.lost_packets > 0, "loss must have been detected");
    assert!(
        stats.path.retransmitted_packets > 0,
        "stream data must have been retransmitted"
    );
}

/// A writer against a 4096-byte stream window stalls exactly at the window, resumes on
/// MAX_STREAM_DATA, and the full payload arrives
#[test]
fn flow_control_stall_and_resume() {
    let _guard = subscribe();
    let mut transport = TransportConfig::default();
    transport.stream_receive_window(VarInt::from_u32(4096));
    let mut server = server_config();
    server.transport = Arc::new(transport);
    let mut pair = Pair::new(server);
    pair.connect();

    let payload = vec![0xA5u8; 10_000];
    let id = pair.client().streams().open(Dir::Uni).expect("stream");
    assert_eq!(pair.client().send_stream(id).write(&payload).unwrap(), 4096);
    assert_matches!(
        pair.client().send_stream(id).write(&payload[4096..]),
        Err(WriteError::Blocked)
    );
    pair.drive();
    assert!(
        pair.client().stats().frame_tx.stream_data_blocked > 0,
        "the stall must be announced to the peer"
    );

    let sid = pair.server().streams().accept(Dir::Uni).expect("incoming stream");
    let mut received = Vec::new();
    let mut written = 4096;
    let mut became_writable = false;
    while written < payload.len() || !read_available(pair.server(), sid, &mut received) {
        pair.drive();
        while let Some(event) = pair.client().poll() {
            if matches!(event, Event::Stream(StreamEvent::Writable { id: i }) if i == id) {
                became_writable = true;
            }
        }
        while written < payload.len() {
            match pair.client().send_stream(id).write(&payload[written..]) {
                Ok(n) => {
                    written += n;
                    if written == payload.len() {
                        pair.client().send_stream(id).finish().unwrap();
                    }
                }
                Err(WriteError::Blocked) => break,
                Err(e) => panic!("write failed: {e}"),
            }
        }
    }
    assert!(became_writable, "flow control credit must wake the writer");
    assert_eq!(received, payload);
}

/// Idle expiry drains both sides without a CONNECTION_CLOSE on the wire
#[test]
fn idle_timeout() {
    let _guard = subscribe();
    let mut transport = TransportConfig::default();
    transport.max_idle_timeout(Some(Duration::from_secs(5))).unwrap();
    let transport = Arc::new(transport);
    let mut server = server_config();
    server.transport = transport.clone();
    let mut client = client_config();
    client.transport = transport;
    let mut pair = Pair::new(server);
    pair.connect_with(client);

    // Silence for longer than the negotiated 5s
    pair.time += Duration::from_secs(6);
    let now = pair.time;
    pair.client().handle_timeout(now);
    pair.server().handle_timeout(now);

    assert!(pair.client().is_drained());
    assert!(pair.server().is_drained());
    assert_matches!(
        pair.client().close_reason(),
        Some(ConnectionError::TimedOut)
    );
    assert_eq!(pair.client().stats().frame_tx.connection_close, 0);
    assert_eq!(pair.server().stats().frame_tx.connection_close, 0);
}

/// Data keeps flowing in both directions across a key update
#[test]
fn key_update() {
    let _guard = subscribe();
    let mut pair = Pair::default();
    pair.connect();

    // Warm up with a round of data in each direction
    let c2s = pipe(&mut pair, true, b"before update");
    let s2c = pipe(&mut pair, false, b"likewise");
    assert_eq!(c2s, b"before update");
    assert_eq!(s2c, b"likewise");

    let now = pair.time;
    pair.client().initiate_key_update(now);

    // Well over ten datagrams of traffic under the new generation
    let big = vec![0x5au8; 20_000];
    let echoed = pipe(&mut pair, true, &big);
    assert_eq!(echoed, big);
    let back = pipe(&mut pair, false, &big);
    assert_eq!(back, big);

    assert!(pair.client().close_reason().is_none());
    assert!(pair.server().close_reason().is_none());

    // A second update within the grace period is a no-op rather than an error
    let now = pair.time;
    pair.client().initiate_key_update(now);
    let again = pipe(&mut pair, true, b"still fine");
    assert_eq!(again, b"still fine");
}

/// Replaying an old ACK-bearing datagram must not perturb the congestion state
#[test]
fn redundant_ack_is_idempotent() {
    let _guard = subscribe();
    let mut pair = Pair::default();
    pair.connect();
    pair.save_server_datagrams = true;

    let payload = vec![0x77u8; 30_000];
    let sent = pipe(&mut pair, true, &payload);
    assert_eq!(sent, payload);

    let window = pair.client().congestion_window();
    let replay = pair
        .saved_server_datagrams
        .get(2)
        .expect("server sent several datagrams")
        .clone();
    let now = pair.time;
    pair.client.inbound.push_back((now, replay));
    pair.drive();

    assert_eq!(pair.client().congestion_window(), window);
    assert!(pair.client().close_reason().is_none());

    // And the connection still moves data
    let after = pipe(&mut pair, true, b"after replay");
    assert_eq!(after, b"after replay");
}

/// A Retry that shows up after the handshake made progress is ignored outright
#[test]
fn late_retry_ignored() {
    let _guard = subscribe();
    let mut pair = Pair::default();
    pair.save_server_datagrams = true;
    pair.connect();

    // Figure out the client's CID the way an off-path attacker might, then forge a Retry
    let (decode, _) = PartialDecode::new(pair.saved_server_datagrams[0].clone(), 8).unwrap();
    let client_cid = decode.dst_cid();
    let mut buf = Vec::new();
    crate::packet::Header::Retry {
        dst_cid: client_cid,
        src_cid: ConnectionId::new(&[0xba; 8]),
    }
    .encode(&mut buf);
    buf.extend_from_slice(b"bogus-token");
    buf.extend_from_slice(&[0u8; 16]); // not a valid integrity tag either
    let now = pair.time;
    pair.client.inbound.push_back((now, buf.as_slice().into()));
    pair.drive();

    assert!(pair.client().close_reason().is_none());
    let echoed = pipe(&mut pair, true, b"unharmed");
    assert_eq!(echoed, b"unharmed");
}

/// An application close tells the peer why, and both sides drain
#[test]
fn application_close() {
    let _guard = subscribe();
    let mut pair = Pair::default();
    pair.connect();

    let now = pair.time;
    pair.client()
        .close(now, VarInt::from_u32(42), Bytes::from_static(b"goodbye"));
    pair.drive();

    let mut saw_close = false;
    while let Some(event) = pair.server().poll() {
        if let Event::ConnectionLost {
            reason: ConnectionError::ApplicationClosed(close),
        } = event
        {
            assert_eq!(close.error_code, VarInt::from_u32(42));
            assert_eq!(&close.reason[..], b"goodbye");
            saw_close = true;
        }
    }
    assert!(saw_close);
    assert!(pair.client().is_drained());
    assert!(pair.server().is_closed());
}

/// STOP_SENDING surfaces to the writing application and leaves the connection healthy
#[test]
fn stop_sending() {
    let _guard = subscribe();
    let mut pair = Pair::default();
    pair.connect();

    let id = pair.client().streams().open(Dir::Uni).expect("stream");
    pair.client().send_stream(id).write(b"spam").unwrap();
    pair.drive();

    let sid = pair.server().streams().accept(Dir::Uni).expect("incoming stream");
    pair.server()
        .recv_stream(sid)
        .stop(VarInt::from_u32(7))
        .unwrap();
    pair.drive();

    let mut stopped = false;
    while let Some(event) = pair.client().poll() {
        if let Event::Stream(StreamEvent::Stopped { id: i, error_code }) = event {
            assert_eq!(i, id);
            assert_eq!(error_code, VarInt::from_u32(7));
            stopped = true;
        }
    }
    assert!(stopped);
    assert_matches!(
        pair.client().send_stream(id).write(b"more"),
        Err(WriteError::Stopped(code)) if code == VarInt::from_u32(7)
    );
    // The connection itself survives
    let echoed = pipe(&mut pair, false, b"still on");
    assert_eq!(echoed, b"still on");
}

/// A RESET_STREAM cancels a blocked reader with the peer's error code
#[test]
fn reset_stream() {
    let _guard = subscribe();
    let mut pair = Pair::default();
    pair.connect();

    let id = pair.client().streams().open(Dir::Uni).expect("stream");
    pair.client().send_stream(id).write(b"partial").unwrap();
    pair.drive();

    let sid = pair.server().streams().accept(Dir::Uni).expect("incoming stream");
    let mut received = Vec::new();
    assert!(!read_available(pair.server(), sid, &mut received));

    pair.client()
        .send_stream(id)
        .reset(VarInt::from_u32(9))
        .unwrap();
    pair.drive();

    assert_matches!(
        pair.server().recv_stream(sid).read(usize::MAX),
        Err(ReadError::Reset(code)) if code == VarInt::from_u32(9)
    );
}

/// A remembered session ticket seeds the RTT estimate and rides in the first Initial
#[test]
fn session_ticket_reuse() {
    let _guard = subscribe();
    let store = Arc::new(SharedTickets::default());
    store.insert(
        "localhost",
        SessionTicket {
            token: Bytes::from_static(b"remembered-token"),
            rtt: Duration::from_millis(50),
        }
        .encode(),
    );

    let mut config = client_config();
    config.ticket_store = Some(store.clone());
    let mut pair = Pair::default();
    pair.connect_with(config);

    // The single-use ticket is gone, and the connection came up fine
    assert!(store.take("localhost").is_none());
    let echoed = pipe(&mut pair, true, b"resumed");
    assert_eq!(echoed, b"resumed");
}

/// Ship `data` over a fresh unidirectional stream and return what the peer read
fn pipe(pair: &mut Pair, from_client: bool, data: &[u8]) -> Vec<u8> {
    let sender = if from_client {
        pair.client()
    } else {
        pair.server()
    };
    let id = sender.streams().open(Dir::Uni).expect("open stream");
    let mut written = 0;
    loop {
        let sender = if from_client {
            pair.client()
        } else {
            pair.server()
        };
        match sender.send_stream(id).write(&data[written..]) {
            Ok(n) => written += n,
            Err(WriteError::Blocked) => {}
            Err(e) => panic!("write failed: {e}"),
        }
        if written == data.len() {
            break;
        }
        pair.drive();
    }
    let sender = if from_client {
        pair.client()
    } else {
        pair.server()
    };
    sender.send_stream(id).finish().unwrap();
    pair.drive();

    let receiver = if from_client {
        pair.server()
    } else {
        pair.client()
    };
    let sid = loop {
        if let Some(sid) = receiver.streams().accept(Dir::Uni) {
            break sid;
        }
        panic!("peer stream did not arrive");
    };
    let mut received = Vec::new();
    loop {
        let receiver = if from_client {
            pair.server()
        } else {
            pair.client()
        };
        if read_available(receiver, sid, &mut received) {
            break;
        }
        pair.drive();
    }
    received
}

/// Read everything currently available; returns whether EOF was reached
fn read_available(conn: &mut Connection, id: StreamId, out: &mut Vec<u8>) -> bool {
    loop {
        match conn.recv_stream(id).read(usize::MAX) {
            Ok(Some(chunk)) => {
                assert_eq!(chunk.offset as usize, out.len(), "reads must be in order");
                out.extend_from_slice(&chunk.bytes);
            }
            Ok(None) => return true,
            Err(ReadError::Blocked) => return false,
            Err(e) => panic!("read failed: {e}"),
        }
    }
}
