use std::fmt::{Debug, Formatter};
use std::io;
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use bytes::{Buf, Bytes, BytesMut};
use tokio::net::{TcpStream, UdpSocket};
use tokio::time::Instant;
use tracing::{debug, info, trace, warn};

use crate::config::NetConfig;
use crate::connection::core::ConnectionCore;
use crate::connection::id_pool::IdPool;
use crate::connection::{Connection, ConnectionId};
use crate::error::{Channel, TransportError};
use crate::message::{
    InboundMessage, Message, MessageKindId, SendType, HANDSHAKE_KIND, PING_KIND, PONG_KIND,
};
use crate::wire::{parse_datagram, write_frame, FrameAssembler, HandshakeData, ProbeData};

/// The peer's UDP side, learned from the handshake. Some routers present
///  different public/private ports depending on which side initiated the TCP
///  connection, so an alternate endpoint (derived from the endpoint race's
///  losing candidate) may be recorded as well; inbound datagrams are accepted
///  from either. The workaround is deliberately limited to the two-candidate
///  case.
struct UdpPeer {
    primary: Option<SocketAddr>,
    alternate: Option<SocketAddr>,
    alternate_candidate_ip: Option<IpAddr>,
}

/// A gameplay connection with two channels: TCP for reliable ordered messages
///  (buffered, flushed once per tick) and UDP for best-effort low-latency
///  messages, usable only once the handshake has exchanged UDP endpoints.
///
/// State machine: unhandshaken -> handshaken (the instant the remote UDP
///  endpoint becomes known) -> disposed.
pub struct DuplexConnection {
    core: ConnectionCore,
    config: Arc<NetConfig>,
    /// `None` after disposal: taking the handles is what closes the sockets,
    ///  so the peer reads EOF on its tcp side
    tcp: Mutex<Option<Arc<TcpStream>>>,
    udp: Mutex<Option<Arc<UdpSocket>>>,
    peer_tcp_addr: SocketAddr,
    send_buf: Mutex<BytesMut>,
    udp_peer: Mutex<UdpPeer>,
    udp_frames_sent: AtomicU64,
}

impl Debug for DuplexConnection {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "DuplexConnection({}@{})", self.core.id(), self.peer_tcp_addr)
    }
}

impl DuplexConnection {
    /// Wraps a TCP stream the endpoint race just established. `alternate_candidate`
    ///  is the losing candidate's address when exactly two were raced.
    pub async fn from_outbound(
        stream: TcpStream,
        alternate_candidate: Option<SocketAddr>,
        id_pool: Arc<IdPool>,
        config: Arc<NetConfig>,
    ) -> anyhow::Result<Arc<DuplexConnection>> {
        Self::new(stream, alternate_candidate, id_pool, config, "server").await
    }

    /// Wraps a TCP stream a listener just accepted.
    pub async fn from_accepted(
        stream: TcpStream,
        id_pool: Arc<IdPool>,
        config: Arc<NetConfig>,
    ) -> anyhow::Result<Arc<DuplexConnection>> {
        Self::new(stream, None, id_pool, config, "client").await
    }

    async fn new(
        stream: TcpStream,
        alternate_candidate: Option<SocketAddr>,
        id_pool: Arc<IdPool>,
        config: Arc<NetConfig>,
        role_name: &str,
    ) -> anyhow::Result<Arc<DuplexConnection>> {
        let peer_tcp_addr = stream.peer_addr()?;
        let udp = Arc::new(UdpSocket::bind((stream.local_addr()?.ip(), 0)).await?);
        let tcp = Arc::new(stream);
        let udp_port = udp.local_addr()?.port();

        let core = ConnectionCore::new(
            format!("{}@{}", role_name, peer_tcp_addr),
            id_pool,
            &config,
        )?;

        let conn = Arc::new(DuplexConnection {
            core,
            config,
            tcp: Mutex::new(Some(tcp.clone())),
            udp: Mutex::new(Some(udp.clone())),
            peer_tcp_addr,
            send_buf: Mutex::new(BytesMut::new()),
            udp_peer: Mutex::new(UdpPeer {
                primary: None,
                alternate: None,
                alternate_candidate_ip: alternate_candidate.map(|a| a.ip()),
            }),
            udp_frames_sent: AtomicU64::new(0),
        });

        // tell the peer where our UDP side listens; this is what completes
        // the handshake on their end
        {
            let mut body = BytesMut::new();
            HandshakeData { udp_port }.ser(&mut body);
            let mut send_buf = conn.send_buf.lock().unwrap();
            write_frame(&mut send_buf, HANDSHAKE_KIND, &body);
        }
        conn.flush_tcp();

        conn.core.register_task(tokio::spawn(Self::tcp_recv_loop(conn.clone(), tcp)));
        conn.core.register_task(tokio::spawn(Self::udp_recv_loop(conn.clone(), udp)));

        info!("established {:?} (udp port {})", conn, udp_port);
        Ok(conn)
    }

    pub fn is_handshaken(&self) -> bool {
        self.udp_peer.lock().unwrap().primary.is_some()
    }

    pub fn peer_tcp_addr(&self) -> SocketAddr {
        self.peer_tcp_addr
    }

    pub fn remote_udp_endpoint(&self) -> Option<SocketAddr> {
        self.udp_peer.lock().unwrap().primary
    }

    pub fn alternate_udp_endpoint(&self) -> Option<SocketAddr> {
        self.udp_peer.lock().unwrap().alternate
    }

    pub fn local_udp_addr(&self) -> io::Result<SocketAddr> {
        match self.udp.lock().unwrap().as_ref() {
            Some(udp) => udp.local_addr(),
            None => Err(io::Error::new(io::ErrorKind::NotConnected, "connection is disposed")),
        }
    }

    /// Bytes buffered for the reliable channel but not yet written out.
    pub fn pending_send_bytes(&self) -> usize {
        self.send_buf.lock().unwrap().len()
    }

    /// Number of frames handed to the UDP socket so far.
    pub fn udp_frames_sent(&self) -> u64 {
        self.udp_frames_sent.load(Ordering::Relaxed)
    }

    fn flush_tcp(&self) {
        let tcp = match self.tcp.lock().unwrap().as_ref() {
            Some(tcp) => tcp.clone(),
            None => return,
        };
        let mut send_buf = self.send_buf.lock().unwrap();
        while !send_buf.is_empty() {
            match tcp.try_write(&send_buf) {
                Ok(0) => {
                    self.core.push_error(TransportError::PeerClosed);
                    break;
                }
                Ok(n) => {
                    trace!("{:?}: flushed {} bytes to tcp", self, n);
                    send_buf.advance(n);
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) => {
                    self.core.push_error(TransportError::Io { channel: Channel::Tcp, source: e });
                    break;
                }
            }
        }
    }

    /// Sending unreliable data before the handshake is not a fault: dropping is
    ///  correct best-effort behavior, so the frame is discarded silently.
    fn send_best_effort(&self, kind: MessageKindId, body: &[u8]) {
        let target = match self.udp_peer.lock().unwrap().primary {
            Some(addr) => addr,
            None => {
                trace!("{:?}: dropping best-effort {:?} before handshake", self, kind);
                return;
            }
        };
        let udp = match self.udp.lock().unwrap().as_ref() {
            Some(udp) => udp.clone(),
            None => return,
        };

        let mut frame = BytesMut::new();
        write_frame(&mut frame, kind, body);
        match udp.try_send_to(&frame, target) {
            Ok(_) => {
                self.udp_frames_sent.fetch_add(1, Ordering::Relaxed);
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                trace!("{:?}: udp send buffer full, dropping best-effort frame", self);
            }
            Err(e) => {
                self.core.push_error(TransportError::Io { channel: Channel::Udp, source: e });
            }
        }
    }

    fn maybe_send_probe(&self) {
        if !self.is_handshaken() {
            return;
        }

        let timestamp_nanos = {
            let mut ping = self.core.ping().lock().unwrap();
            if !ping.probe_due(self.config.ping_interval) {
                return;
            }
            ping.on_probe_sent();
            ping.timestamp_nanos_now()
        };

        let mut body = BytesMut::new();
        ProbeData { timestamp_nanos }.ser(&mut body);
        self.send_best_effort(PING_KIND, &body);
    }

    async fn tcp_recv_loop(conn: Arc<DuplexConnection>, tcp: Arc<TcpStream>) {
        let mut assembler = FrameAssembler::new(conn.config.max_message_size);
        let mut chunk = vec![0u8; conn.config.read_chunk_size];
        loop {
            if let Err(e) = tcp.readable().await {
                conn.core.push_error(TransportError::Io { channel: Channel::Tcp, source: e });
                return;
            }
            match tcp.try_read(&mut chunk) {
                Ok(0) => {
                    conn.core.push_error(TransportError::PeerClosed);
                    return;
                }
                Ok(n) => {
                    assembler.feed(&chunk[..n]);
                    loop {
                        match assembler.next_frame() {
                            Ok(Some((kind, body))) => conn.on_frame(kind, body),
                            Ok(None) => break,
                            Err(e) => {
                                // byte alignment is lost: nothing received after
                                // this point is ever dispatched
                                warn!("{:?}: fatal framing error: {}", conn, e);
                                conn.core.push_error(TransportError::InvalidHeader(e.to_string()));
                                return;
                            }
                        }
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => continue,
                Err(e) => {
                    conn.core.push_error(TransportError::Io { channel: Channel::Tcp, source: e });
                    return;
                }
            }
        }
    }

    async fn udp_recv_loop(conn: Arc<DuplexConnection>, udp: Arc<UdpSocket>) {
        let mut buf = vec![0u8; 64 * 1024];
        loop {
            match udp.recv_from(&mut buf).await {
                Ok((n, from)) => {
                    if !conn.accepts_udp_from(from) {
                        trace!("{:?}: dropping datagram from unexpected sender {:?}", conn, from);
                        continue;
                    }
                    match parse_datagram(&buf[..n], conn.config.max_message_size) {
                        Ok((kind, body)) => conn.on_frame(kind, body),
                        Err(e) => warn!("{:?}: dropping malformed datagram: {}", conn, e),
                    }
                }
                Err(e) => {
                    conn.core.push_error(TransportError::Io { channel: Channel::Udp, source: e });
                    return;
                }
            }
        }
    }

    fn accepts_udp_from(&self, from: SocketAddr) -> bool {
        let peer = self.udp_peer.lock().unwrap();
        peer.primary == Some(from) || peer.alternate == Some(from)
    }

    fn on_frame(&self, kind: MessageKindId, body: Bytes) {
        match kind {
            HANDSHAKE_KIND => self.on_handshake(body),
            PING_KIND => self.on_ping(body),
            PONG_KIND => self.on_pong(body),
            kind => self.core.enqueue_message(InboundMessage {
                kind,
                payload: body,
                received_at: Instant::now(),
            }),
        }
    }

    fn on_handshake(&self, mut body: Bytes) {
        let data = match HandshakeData::try_deser(&mut body) {
            Ok(data) => data,
            Err(_) => {
                self.core.push_error(TransportError::MalformedControl("handshake"));
                return;
            }
        };

        let mut peer = self.udp_peer.lock().unwrap();
        let primary = SocketAddr::new(self.peer_tcp_addr.ip(), data.udp_port);
        peer.primary = Some(primary);
        peer.alternate = peer.alternate_candidate_ip
            .map(|ip| SocketAddr::new(ip, data.udp_port));

        debug!("{:?}: handshaken, remote udp {:?} (alternate {:?})", self, primary, peer.alternate);
    }

    fn on_ping(&self, mut body: Bytes) {
        let data = match ProbeData::try_deser(&mut body) {
            Ok(data) => data,
            Err(_) => {
                self.core.push_error(TransportError::MalformedControl("ping"));
                return;
            }
        };

        // echo the peer's timestamp back so it can compute the round trip
        let mut pong_body = BytesMut::new();
        ProbeData { timestamp_nanos: data.timestamp_nanos }.ser(&mut pong_body);
        self.send_best_effort(PONG_KIND, &pong_body);
    }

    fn on_pong(&self, mut body: Bytes) {
        let data = match ProbeData::try_deser(&mut body) {
            Ok(data) => data,
            Err(_) => {
                self.core.push_error(TransportError::MalformedControl("pong"));
                return;
            }
        };

        if !self.is_handshaken() {
            return;
        }
        self.core.ping().lock().unwrap().on_probe_response(data.timestamp_nanos);
    }
}

impl Connection for DuplexConnection {
    fn id(&self) -> ConnectionId {
        self.core.id()
    }

    fn name(&self) -> &str {
        self.core.name()
    }

    fn is_disposed(&self) -> bool {
        self.core.is_disposed()
    }

    fn send(&self, msg: &dyn Message) {
        if self.core.is_disposed() {
            debug!("{:?}: send after disposal, ignoring", self);
            return;
        }

        let mut body = BytesMut::new();
        msg.ser(&mut body);
        if body.len() > self.config.max_message_size as usize {
            warn!("{:?}: message {:?} of {} bytes exceeds max message size {}, dropping",
                self, msg.kind(), body.len(), self.config.max_message_size);
            return;
        }

        match msg.send_type() {
            SendType::Reliable => {
                let mut send_buf = self.send_buf.lock().unwrap();
                write_frame(&mut send_buf, msg.kind(), &body);
            }
            SendType::BestEffort => self.send_best_effort(msg.kind(), &body),
        }
    }

    fn try_dequeue(&self, kind: MessageKindId) -> Option<InboundMessage> {
        self.core.try_dequeue(kind)
    }

    fn update(&self) {
        if self.core.is_disposed() {
            return;
        }
        self.flush_tcp();
        self.maybe_send_probe();
    }

    fn handle_errors(&self) {
        if self.core.take_and_log_errors() {
            self.dispose();
        }
    }

    fn dispose(&self) {
        if !self.core.claim_dispose() {
            return;
        }
        self.send_buf.lock().unwrap().clear();
        // the recv tasks are aborted at this point; dropping the remaining
        // handles closes both sockets and the peer reads EOF
        self.tcp.lock().unwrap().take();
        self.udp.lock().unwrap().take();
    }

    fn rtt_millis(&self) -> Option<f64> {
        self.core.ping().lock().unwrap().rtt_millis()
    }
}

#[cfg(test)]
mod test {
    use std::time::Duration;

    use tokio::io::AsyncWriteExt;
    use tokio::net::TcpListener;

    use crate::test_util::{TestMessage, BULK_KIND, TEST_KIND};

    use super::*;

    async fn tcp_pair(listener: &TcpListener) -> (TcpStream, TcpStream) {
        let addr = listener.local_addr().unwrap();
        let (outbound, accepted) = tokio::join!(TcpStream::connect(addr), listener.accept());
        (outbound.unwrap(), accepted.unwrap().0)
    }

    async fn connected_pair() -> (Arc<DuplexConnection>, Arc<DuplexConnection>, Arc<IdPool>) {
        let pool = Arc::new(IdPool::new(8));
        let config = Arc::new(NetConfig::default_game());

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let (outbound_stream, accepted_stream) = tcp_pair(&listener).await;

        let outbound = DuplexConnection::from_outbound(outbound_stream, None, pool.clone(), config.clone())
            .await.unwrap();
        let accepted = DuplexConnection::from_accepted(accepted_stream, pool.clone(), config.clone())
            .await.unwrap();
        (outbound, accepted, pool)
    }

    async fn wait_for(mut condition: impl FnMut() -> bool) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while !condition() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("condition was not reached within 5s");
    }

    async fn wait_for_handshake(a: &Arc<DuplexConnection>, b: &Arc<DuplexConnection>) {
        wait_for(|| {
            a.update();
            b.update();
            a.is_handshaken() && b.is_handshaken()
        })
        .await;
    }

    #[tokio::test]
    async fn test_handshake_exchanges_udp_endpoints() {
        let (a, b, _pool) = connected_pair().await;
        wait_for_handshake(&a, &b).await;

        assert_eq!(a.remote_udp_endpoint().unwrap(), b.local_udp_addr().unwrap());
        assert_eq!(b.remote_udp_endpoint().unwrap(), a.local_udp_addr().unwrap());
        assert_eq!(a.alternate_udp_endpoint(), None);
    }

    #[tokio::test]
    async fn test_reliable_messages_arrive_in_order() {
        let (a, b, _pool) = connected_pair().await;
        wait_for_handshake(&a, &b).await;

        a.send(&TestMessage::reliable(b"m1"));
        // interleaved best-effort traffic (under its own kind) must not affect
        // reliable ordering
        a.send(&TestMessage::best_effort_bulk(b"state update"));
        a.send(&TestMessage::reliable(b"m2"));
        a.send(&TestMessage::best_effort_bulk(b"state update"));
        a.send(&TestMessage::reliable(b"m3"));

        let mut received = Vec::new();
        wait_for(|| {
            a.update();
            if let Some(msg) = b.try_dequeue(TEST_KIND) {
                received.push(msg.payload);
            }
            received.len() == 3
        })
        .await;

        assert_eq!(&received[0][..], b"m1");
        assert_eq!(&received[1][..], b"m2");
        assert_eq!(&received[2][..], b"m3");
    }

    #[tokio::test]
    async fn test_best_effort_arrives_after_handshake() {
        let (a, b, _pool) = connected_pair().await;
        wait_for_handshake(&a, &b).await;

        // loopback is lossless in practice, but resend anyway until it shows up
        wait_for(|| {
            a.send(&TestMessage::best_effort_bulk(b"pos"));
            b.try_dequeue(BULK_KIND).is_some()
        })
        .await;
        assert!(a.udp_frames_sent() > 0);
    }

    #[tokio::test]
    async fn test_best_effort_before_handshake_is_silently_dropped() {
        let pool = Arc::new(IdPool::new(8));
        let config = Arc::new(NetConfig::default_game());
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let (outbound_stream, _held_peer) = tcp_pair(&listener).await;

        // the peer never sends its handshake, so the connection stays unhandshaken
        let conn = DuplexConnection::from_outbound(outbound_stream, None, pool, config)
            .await.unwrap();
        conn.update();
        assert_eq!(conn.pending_send_bytes(), 0);

        conn.send(&TestMessage::best_effort(b"too early"));

        assert_eq!(conn.pending_send_bytes(), 0, "nothing may be buffered");
        assert_eq!(conn.udp_frames_sent(), 0, "nothing may reach the socket");
        conn.handle_errors();
        assert!(!conn.is_disposed(), "a pre-handshake best-effort send is not an error");
    }

    #[tokio::test]
    async fn test_alternate_endpoint_follows_handshake_port() {
        let pool = Arc::new(IdPool::new(8));
        let config = Arc::new(NetConfig::default_game());
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let (outbound_stream, accepted_stream) = tcp_pair(&listener).await;

        let loser: SocketAddr = "127.0.0.2:7777".parse().unwrap();
        let a = DuplexConnection::from_outbound(outbound_stream, Some(loser), pool.clone(), config.clone())
            .await.unwrap();
        let b = DuplexConnection::from_accepted(accepted_stream, pool, config)
            .await.unwrap();
        wait_for_handshake(&a, &b).await;

        let udp_port = b.local_udp_addr().unwrap().port();
        assert_eq!(a.alternate_udp_endpoint().unwrap(), SocketAddr::new(loser.ip(), udp_port));
        assert!(a.accepts_udp_from(a.remote_udp_endpoint().unwrap()));
        assert!(a.accepts_udp_from(a.alternate_udp_endpoint().unwrap()));
        assert!(!a.accepts_udp_from("127.0.0.3:1234".parse().unwrap()));
    }

    #[tokio::test]
    async fn test_malformed_header_disposes_via_handle_errors() {
        let pool = Arc::new(IdPool::new(8));
        let config = Arc::new(NetConfig::default_game());
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let (mut raw_peer, accepted_stream) = tcp_pair(&listener).await;

        let conn = DuplexConnection::from_accepted(accepted_stream, pool, config)
            .await.unwrap();

        raw_peer.write_all(b"this is not a valid frame header at all").await.unwrap();

        wait_for(|| {
            conn.handle_errors();
            conn.is_disposed()
        })
        .await;
        assert!(conn.try_dequeue(TEST_KIND).is_none());
    }

    #[tokio::test]
    async fn test_peer_close_disposes_via_handle_errors() {
        let (a, b, _pool) = connected_pair().await;
        wait_for_handshake(&a, &b).await;

        b.dispose();
        wait_for(|| {
            a.handle_errors();
            a.is_disposed()
        })
        .await;
    }

    #[tokio::test]
    async fn test_dispose_releases_sockets() {
        let (a, b, _pool) = connected_pair().await;
        wait_for_handshake(&a, &b).await;

        b.dispose();
        assert!(b.local_udp_addr().is_err(), "udp socket must be released on dispose");

        // the peer must observe the closed tcp stream and dispose in turn
        wait_for(|| {
            a.handle_errors();
            a.is_disposed()
        })
        .await;
    }

    #[tokio::test]
    async fn test_double_dispose_releases_id_once() {
        let (a, b, pool) = connected_pair().await;
        assert_eq!(pool.available(), 6);

        a.dispose();
        a.dispose();
        assert_eq!(pool.available(), 7);

        b.dispose();
        assert_eq!(pool.available(), 8);
    }

    #[tokio::test]
    async fn test_operations_after_dispose_are_noops() {
        let (a, b, _pool) = connected_pair().await;
        wait_for_handshake(&a, &b).await;

        a.dispose();
        a.send(&TestMessage::reliable(b"late"));
        assert_eq!(a.pending_send_bytes(), 0);
        a.update();
        a.handle_errors();
        assert!(a.try_dequeue(TEST_KIND).is_none());
    }

    #[tokio::test]
    async fn test_probe_roundtrip_yields_rtt() {
        let (a, b, _pool) = connected_pair().await;
        wait_for_handshake(&a, &b).await;

        wait_for(|| {
            a.update();
            b.update();
            a.rtt_millis().is_some()
        })
        .await;
        assert!(a.rtt_millis().unwrap() >= 0.0);
    }
}
