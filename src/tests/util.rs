use std::{
    cmp,
    collections::VecDeque,
    net::{Ipv4Addr, SocketAddr},
    sync::{Arc, Mutex},
    time::{Duration, Instant},
};

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tracing::{info_span, trace};

use crate::*;
use crate::crypto::{
    self,
    ring::{initial_keys, retry_tag, CipherSuite, Secrets},
    KeyPair, Keys, PacketKey,
};

pub(super) fn subscribe() -> tracing::subscriber::DefaultGuard {
    let sub = tracing_subscriber::FmtSubscriber::builder()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(|| TestWriter)
        .finish();
    tracing::subscriber::set_default(sub)
}

struct TestWriter;

impl std::io::Write for TestWriter {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        print!(
            "{}",
            std::str::from_utf8(buf).expect("tried to log invalid UTF-8")
        );
        Ok(buf.len())
    }
    fn flush(&mut self) -> std::io::Result<()> {
        std::io::stdout().flush()
    }
}

pub(super) fn client_addr() -> SocketAddr {
    SocketAddr::new(Ipv4Addr::LOCALHOST.into(), 44433)
}

pub(super) fn server_addr() -> SocketAddr {
    SocketAddr::new(Ipv4Addr::LOCALHOST.into(), 4433)
}

pub(super) fn client_config() -> ClientConfig {
    ClientConfig::new(Arc::new(TestTls))
}

pub(super) fn server_config() -> ServerConfig {
    ServerConfig::new(Arc::new(TestTls))
}

/// A deterministic two-endpoint network, driving time forward only as far as
/// the connections ask
pub(super) struct Pair {
    pub(super) server: TestEndpoint,
    pub(super) client: TestEndpoint,
    pub(super) time: Instant,
    /// Simulated one-way delay
    pub(super) latency: Duration,
    /// Drop every n-th datagram sent by the server, if set
    pub(super) server_drop_interval: Option<u64>,
    server_sent_datagrams: u64,
    /// Copies of every datagram the server put on the wire, when enabled
    pub(super) save_server_datagrams: bool,
    pub(super) saved_server_datagrams: Vec<BytesMut>,
    /// Config used to accept the server-side connection on first contact
    server_config: Option<ServerConfig>,
}

impl Default for Pair {
    fn default() -> Self {
        Self::new(server_config())
    }
}

impl Pair {
    pub(super) fn new(server_config: ServerConfig) -> Self {
        Self {
            server: TestEndpoint::new(server_addr()),
            client: TestEndpoint::new(client_addr()),
            time: Instant::now(),
            latency: Duration::ZERO,
            server_drop_interval: None,
            server_sent_datagrams: 0,
            save_server_datagrams: false,
            saved_server_datagrams: Vec::new(),
            server_config: Some(server_config),
        }
    }

    /// Connect the client and drive the pair until the handshake completes on both sides
    pub(super) fn connect(&mut self) {
        self.connect_with(client_config())
    }

    pub(super) fn connect_with(&mut self, config: ClientConfig) {
        let conn =
            Connection::connect(config, server_addr(), "localhost", self.time).expect("connect");
        self.client.conn = Some(conn);
        self.drive();
        self.client.drain_events_until_connected();
        self.server.drain_events_until_connected();
    }

    /// Advance time and deliver traffic until both sides are quiescent
    pub(super) fn drive(&mut self) {
        let mut steps = 0;
        while self.step() {
            steps += 1;
            assert!(steps < 10_000, "simulation diverged");
        }
    }

    /// Returns whether any progress was made
    pub(super) fn step(&mut self) -> bool {
        self.drive_client();
        self.drive_server();
        if self.client.is_idle() && self.server.is_idle() {
            return false;
        }

        let client_t = self.client.next_wakeup();
        let server_t = self.server.next_wakeup();
        match min_opt(client_t, server_t) {
            Some(t) => {
                if t > self.time {
                    self.time = t;
                    trace!("advancing to {:?}", self.time);
                }
                true
            }
            None => false,
        }
    }

    pub(super) fn drive_client(&mut self) {
        let span = info_span!("client");
        let _guard = span.enter();
        self.client.drive(self.time, server_addr());
        for (payload, _) in self.client.outbound.drain(..) {
            self.server
                .inbound
                .push_back((self.time + self.latency, payload));
        }
    }

    pub(super) fn drive_server(&mut self) {
        let span = info_span!("server");
        let _guard = span.enter();
        // The listener's job: peek the first datagram for its destination CID and build the
        // connection the rest will be routed to
        if self.server.conn.is_none() {
            let first = self.server.inbound.front().map(|(_, data)| data.clone());
            if let Some(first) = first {
                let (decode, _) = PartialDecode::new(first, 8).expect("first datagram");
                assert!(decode.has_long_header(), "first packet must be an Initial");
                let config = self.server_config.take().expect("server config consumed");
                self.server.conn = Some(Connection::accept(
                    config,
                    client_addr(),
                    decode.dst_cid(),
                    self.time,
                ));
            }
        }
        self.server.drive(self.time, client_addr());
        for (payload, _) in self.server.outbound.drain(..) {
            self.server_sent_datagrams += 1;
            if self.save_server_datagrams {
                self.saved_server_datagrams.push(payload.clone());
            }
            if let Some(interval) = self.server_drop_interval {
                if self.server_sent_datagrams % interval == 0 {
                    trace!("dropping server datagram {}", self.server_sent_datagrams);
                    continue;
                }
            }
            self.client
                .inbound
                .push_back((self.time + self.latency, payload));
        }
    }

    pub(super) fn client(&mut self) -> &mut Connection {
        self.client.conn.as_mut().unwrap()
    }

    pub(super) fn server(&mut self) -> &mut Connection {
        self.server.conn.as_mut().unwrap()
    }
}

pub(super) struct TestEndpoint {
    pub(super) conn: Option<Connection>,
    pub(super) inbound: VecDeque<(Instant, BytesMut)>,
    pub(super) outbound: VecDeque<(BytesMut, SocketAddr)>,
}

impl TestEndpoint {
    fn new(_addr: SocketAddr) -> Self {
        Self {
            conn: None,
            inbound: VecDeque::new(),
            outbound: VecDeque::new(),
        }
    }

    pub(super) fn drive(&mut self, now: Instant, remote: SocketAddr) {
        let conn = match self.conn.as_mut() {
            Some(c) => c,
            None => return,
        };

        while self
            .inbound
            .front()
            .is_some_and(|(arrival, _)| *arrival <= now)
        {
            let (_, data) = self.inbound.pop_front().unwrap();
            conn.handle_datagram(now, remote, None, data);
        }

        while let Some(deadline) = conn.poll_timeout() {
            if deadline > now {
                break;
            }
            conn.handle_timeout(now);
        }

        let mut buf = Vec::new();
        while let Some(transmit) = conn.poll_transmit(now, &mut buf) {
            self.outbound
                .push_back((BytesMut::from(&buf[..transmit.size]), transmit.destination));
            buf.clear();
        }
    }

    pub(super) fn next_wakeup(&mut self) -> Option<Instant> {
        let timer = self.conn.as_mut().and_then(|c| c.poll_timeout());
        let inbound = self.inbound.front().map(|(arrival, _)| *arrival);
        min_opt(timer, inbound)
    }

    fn is_idle(&mut self) -> bool {
        let conn_idle = self.conn.as_mut().map_or(true, |c| c.is_idle());
        conn_idle && self.inbound.is_empty() && self.outbound.is_empty()
    }

    pub(super) fn expect_event(&mut self) -> Event {
        self.conn
            .as_mut()
            .unwrap()
            .poll()
            .expect("expected an event")
    }

    pub(super) fn drain_events_until_connected(&mut self) {
        let conn = self.conn.as_mut().unwrap();
        assert!(
            !conn.is_handshaking(),
            "handshake should have completed during drive"
        );
        while let Some(event) = conn.poll() {
            if let Event::ConnectionLost { reason } = event {
                panic!("connection lost during handshake: {reason}");
            }
            if matches!(event, Event::Connected) {
                return;
            }
        }
    }
}

fn min_opt<T: Ord>(x: Option<T>, y: Option<T>) -> Option<T> {
    match (x, y) {
        (Some(x), Some(y)) => Some(cmp::min(x, y)),
        (Some(x), None) => Some(x),
        (None, Some(y)) => Some(y),
        (None, None) => None,
    }
}

//
// A deterministic stand-in for the TLS collaborator. Both sides feed each
// other's handshake messages into a running transcript and derive each epoch's
// traffic secrets from hashes of it, so the derivation is honest about
// directionality and ordering without depending on a full TLS stack.
//

pub(super) struct TestTls;

impl crypto::ClientConfig for TestTls {
    fn start_session(
        &self,
        _server_name: &str,
        params: &TransportParameters,
    ) -> Result<Box<dyn crypto::Session>, ConnectError> {
        Ok(Box::new(TestSession::new(Side::Client, *params)))
    }
}

impl crypto::ServerConfig for TestTls {
    fn start_session(&self, params: &TransportParameters) -> Box<dyn crypto::Session> {
        Box::new(TestSession::new(Side::Server, *params))
    }
}

const MSG_CLIENT_HELLO: u8 = 1;
const MSG_SERVER_HELLO: u8 = 2;
const MSG_EXTENSIONS: u8 = 3;
const MSG_FINISHED: u8 = 4;

const TEST_ALPN: &[u8] = b"test-proto";

struct TestSession {
    side: Side,
    params: TransportParameters,
    peer_params: Option<TransportParameters>,

    /// Undigested incoming handshake bytes; messages may arrive split
    inbox: Vec<u8>,
    /// All handshake messages in order, both directions
    transcript: Vec<u8>,

    client_hello_seen: bool,
    server_hello_seen: bool,
    peer_finished_seen: bool,

    sent_client_hello: bool,
    sent_server_flight: bool,
    sent_client_finished: bool,
    handshake_keys_issued: bool,

    /// 1-RTT secrets, advanced on each key update
    data_secrets: Option<Secrets>,
    complete: bool,
}

impl TestSession {
    fn new(side: Side, params: TransportParameters) -> Self {
        Self {
            side,
            params,
            peer_params: None,
            inbox: Vec::new(),
            transcript: Vec::new(),
            client_hello_seen: false,
            server_hello_seen: false,
            peer_finished_seen: false,
            sent_client_hello: false,
            sent_server_flight: false,
            sent_client_finished: false,
            handshake_keys_issued: false,
            data_secrets: None,
            complete: false,
        }
    }

    fn push_message(buf: &mut Vec<u8>, ty: u8, body: &[u8]) {
        buf.put_u8(ty);
        buf.put_u16(body.len() as u16);
        buf.put_slice(body);
    }

    /// Secrets for an epoch: domain-separated hashes of the transcript so far
    fn secrets(&self, label: &str) -> Secrets {
        let digest = |dir: &str| {
            let mut ctx = ring::digest::Context::new(&ring::digest::SHA256);
            ctx.update(label.as_bytes());
            ctx.update(dir.as_bytes());
            ctx.update(&self.transcript);
            ctx.finish()
        };
        let client_write = digest("client");
        let server_write = digest("server");
        let (local, remote) = match self.side {
            Side::Client => (client_write, server_write),
            Side::Server => (server_write, client_write),
        };
        Secrets::new(CipherSuite::Aes128Gcm, local.as_ref(), remote.as_ref())
    }

    fn handshake_keys(&self) -> Keys {
        self.secrets("hs ").keys()
    }

    fn data_keys(&mut self) -> Keys {
        let secrets = self.secrets("app ");
        let keys = secrets.keys();
        self.data_secrets = Some(secrets);
        keys
    }

    /// Drain `inbox`, handling each complete message
    fn process_inbox(&mut self) -> Result<(), TransportError> {
        loop {
            if self.inbox.len() < 3 {
                return Ok(());
            }
            let mut header = &self.inbox[..3];
            let ty = header.get_u8();
            let len = header.get_u16() as usize;
            if self.inbox.len() < 3 + len {
                return Ok(());
            }
            let rest = self.inbox.split_off(3 + len);
            let message = std::mem::replace(&mut self.inbox, rest);
            let body = &message[3..];

            match (ty, self.side) {
                (MSG_CLIENT_HELLO, Side::Server) if !self.client_hello_seen => {
                    self.peer_params = Some(
                        TransportParameters::read(Side::Server, &mut &body[..])
                            .map_err(TransportError::from)?,
                    );
                    self.client_hello_seen = true;
                }
                (MSG_SERVER_HELLO, Side::Client) if !self.server_hello_seen => {
                    self.server_hello_seen = true;
                }
                (MSG_EXTENSIONS, Side::Client) if self.peer_params.is_none() => {
                    self.peer_params = Some(
                        TransportParameters::read(Side::Client, &mut &body[..])
                            .map_err(TransportError::from)?,
                    );
                }
                (MSG_FINISHED, _) if !self.peer_finished_seen => {
                    self.peer_finished_seen = true;
                    if self.side.is_server() {
                        self.complete = true;
                    }
                }
                _ => {
                    return Err(TransportError::PROTOCOL_VIOLATION(
                        "unexpected handshake message",
                    ));
                }
            }
            self.transcript.extend_from_slice(&message);
        }
    }
}

impl crypto::Session for TestSession {
    fn initial_keys(&self, dst_cid: &ConnectionId, side: Side) -> Keys {
        initial_keys(dst_cid, side)
    }

    fn early_crypto(&self) -> Option<(Box<dyn crypto::HeaderKey>, Box<dyn PacketKey>)> {
        None
    }

    fn early_data_accepted(&self) -> Option<bool> {
        None
    }

    fn is_handshaking(&self) -> bool {
        !self.complete
    }

    fn read_handshake(&mut self, buf: &[u8]) -> Result<bool, TransportError> {
        let had_params = self.peer_params.is_some();
        self.inbox.extend_from_slice(buf);
        self.process_inbox()?;
        Ok(!had_params && self.peer_params.is_some())
    }

    fn transport_parameters(&self) -> Result<Option<TransportParameters>, TransportError> {
        Ok(self.peer_params)
    }

    fn write_handshake(&mut self, buf: &mut Vec<u8>) -> Option<Keys> {
        match self.side {
            Side::Client => {
                if !self.sent_client_hello {
                    let mut body = Vec::new();
                    self.params.write(&mut body);
                    let mut msg = Vec::new();
                    Self::push_message(&mut msg, MSG_CLIENT_HELLO, &body);
                    self.transcript.extend_from_slice(&msg);
                    buf.extend_from_slice(&msg);
                    self.sent_client_hello = true;
                    return None;
                }
                if self.server_hello_seen && !self.handshake_keys_issued {
                    self.handshake_keys_issued = true;
                    return Some(self.handshake_keys());
                }
                if self.peer_finished_seen && !self.sent_client_finished {
                    // The client's own finished is not part of the transcript the 1-RTT
                    // secrets hang off, so both sides can derive them at this point
                    let keys = self.data_keys();
                    let mut msg = Vec::new();
                    Self::push_message(&mut msg, MSG_FINISHED, &[]);
                    buf.extend_from_slice(&msg);
                    self.sent_client_finished = true;
                    self.complete = true;
                    return Some(keys);
                }
                None
            }
            Side::Server => {
                if self.client_hello_seen && !self.handshake_keys_issued {
                    let mut msg = Vec::new();
                    Self::push_message(&mut msg, MSG_SERVER_HELLO, &[]);
                    self.transcript.extend_from_slice(&msg);
                    buf.extend_from_slice(&msg);
                    self.handshake_keys_issued = true;
                    return Some(self.handshake_keys());
                }
                if self.handshake_keys_issued && !self.sent_server_flight {
                    let mut body = Vec::new();
                    self.params.write(&mut body);
                    let mut msg = Vec::new();
                    Self::push_message(&mut msg, MSG_EXTENSIONS, &body);
                    Self::push_message(&mut msg, MSG_FINISHED, &[]);
                    self.transcript.extend_from_slice(&msg);
                    buf.extend_from_slice(&msg);
                    self.sent_server_flight = true;
                    return Some(self.data_keys());
                }
                None
            }
        }
    }

    fn next_1rtt_keys(&mut self) -> Option<KeyPair<Box<dyn PacketKey>>> {
        let secrets = self.data_secrets.as_mut()?;
        secrets.update();
        Some(secrets.packet_keys())
    }

    fn is_valid_retry(&self, orig_dst_cid: &ConnectionId, header: &[u8], payload: &[u8]) -> bool {
        // `header` covers the Retry packet through the token; `payload` is the tag itself
        let tag = retry_tag(orig_dst_cid, header);
        payload == &tag[..]
    }

    fn alpn_protocol(&self) -> Option<Vec<u8>> {
        self.peer_params.as_ref().map(|_| TEST_ALPN.to_vec())
    }
}

/// Shared storage making ticket flow observable across connections in a test
#[derive(Default)]
pub(super) struct SharedTickets(Mutex<Option<Bytes>>);

impl TicketStore for SharedTickets {
    fn insert(&self, _server_name: &str, ticket: Bytes) {
        *self.0.lock().unwrap() = Some(ticket);
    }

    fn take(&self, _server_name: &str) -> Option<Bytes> {
        self.0.lock().unwrap().take()
    }
}
