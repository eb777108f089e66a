use std::fmt::{Debug, Formatter};
use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::{Arc, Mutex};

use bytes::{Bytes, BytesMut};
use num_enum::{IntoPrimitive, TryFromPrimitive};
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, info, trace, warn};

use crate::config::NetConfig;
use crate::connection::core::ConnectionCore;
use crate::connection::id_pool::IdPool;
use crate::connection::{Connection, ConnectionId};
use crate::error::{Channel, TransportError};
use crate::message::{InboundMessage, Message, MessageKindId};
use crate::wire::{parse_datagram, write_frame};

/// Discriminator byte in front of every management datagram.
#[derive(Debug, Clone, Copy, Eq, PartialEq, TryFromPrimitive, IntoPrimitive)]
#[repr(u8)]
enum MgmtFrameKind {
    Ping = 1,
    Pong = 2,
    Payload = 3,
}

/// A lightweight, UDP-only connection to a management server (matchmaking,
///  lobby listing and the like). There is no handshake and no reliable channel:
///  every message goes out as a single datagram regardless of its declared
///  reliability. The server pings periodically; liveness is judged by how
///  recently a ping arrived.
pub struct ManagementConnection {
    core: ConnectionCore,
    config: Arc<NetConfig>,
    /// `None` after disposal; taking the handle is what closes the socket
    socket: Mutex<Option<Arc<UdpSocket>>>,
    /// outbound datagrams are handed to a background task that waits for
    ///  socket writability, so `send` never blocks and never races readiness
    send_tx: mpsc::UnboundedSender<Bytes>,
    server_addr: SocketAddr,
    last_ping_received: Mutex<Instant>,
}

impl Debug for ManagementConnection {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "ManagementConnection({}@{})", self.core.id(), self.server_addr)
    }
}

impl ManagementConnection {
    pub async fn new(
        server_addr: SocketAddr,
        id_pool: Arc<IdPool>,
        config: Arc<NetConfig>,
    ) -> anyhow::Result<Arc<ManagementConnection>> {
        let bind_addr: IpAddr = match server_addr {
            SocketAddr::V4(_) => Ipv4Addr::UNSPECIFIED.into(),
            SocketAddr::V6(_) => Ipv6Addr::UNSPECIFIED.into(),
        };
        let socket = Arc::new(UdpSocket::bind((bind_addr, 0)).await?);

        let core = ConnectionCore::new(format!("management@{}", server_addr), id_pool, &config)?;
        let (send_tx, send_rx) = mpsc::unbounded_channel();
        let conn = Arc::new(ManagementConnection {
            core,
            config,
            socket: Mutex::new(Some(socket.clone())),
            send_tx,
            server_addr,
            last_ping_received: Mutex::new(Instant::now()),
        });

        conn.core.register_task(tokio::spawn(Self::recv_loop(conn.clone(), socket.clone())));
        conn.core.register_task(tokio::spawn(Self::send_loop(conn.clone(), socket, send_rx)));
        info!("established {:?}", conn);
        Ok(conn)
    }

    pub fn local_udp_addr(&self) -> io::Result<SocketAddr> {
        match self.socket.lock().unwrap().as_ref() {
            Some(socket) => socket.local_addr(),
            None => Err(io::Error::new(io::ErrorKind::NotConnected, "connection is disposed")),
        }
    }

    /// `false` once no ping has arrived for the configured timeout. The
    ///  application reacts by disposing and reconnecting.
    pub fn has_received_pings_recently(&self) -> bool {
        self.last_ping_received.lock().unwrap().elapsed() < self.config.management_ping_timeout
    }

    pub fn on_ping_received(&self) {
        *self.last_ping_received.lock().unwrap() = Instant::now();
    }

    async fn recv_loop(conn: Arc<ManagementConnection>, socket: Arc<UdpSocket>) {
        let mut buf = vec![0u8; 64 * 1024];
        loop {
            match socket.recv_from(&mut buf).await {
                Ok((n, from)) => {
                    if from != conn.server_addr {
                        trace!("{:?}: dropping datagram from unexpected sender {:?}", conn, from);
                        continue;
                    }
                    conn.on_datagram(&buf[..n]);
                }
                Err(e) => {
                    conn.core.push_error(TransportError::Io { channel: Channel::Management, source: e });
                    return;
                }
            }
        }
    }

    async fn send_loop(
        conn: Arc<ManagementConnection>,
        socket: Arc<UdpSocket>,
        mut rx: mpsc::UnboundedReceiver<Bytes>,
    ) {
        while let Some(datagram) = rx.recv().await {
            if let Err(e) = socket.send_to(&datagram, conn.server_addr).await {
                conn.core.push_error(TransportError::Io { channel: Channel::Management, source: e });
                return;
            }
        }
    }

    fn on_datagram(&self, data: &[u8]) {
        let Some((&kind_byte, rest)) = data.split_first() else {
            warn!("{:?}: dropping empty datagram", self);
            return;
        };
        match MgmtFrameKind::try_from(kind_byte) {
            Ok(MgmtFrameKind::Ping) => {
                self.on_ping_received();
                self.send_datagram(Bytes::copy_from_slice(&[MgmtFrameKind::Pong.into()]));
            }
            Ok(MgmtFrameKind::Pong) => {
                debug!("{:?}: unsolicited pong, ignoring", self);
            }
            Ok(MgmtFrameKind::Payload) => {
                match parse_datagram(rest, self.config.max_message_size) {
                    Ok((kind, body)) => self.core.enqueue_message(InboundMessage {
                        kind,
                        payload: body,
                        received_at: Instant::now(),
                    }),
                    Err(e) => warn!("{:?}: dropping malformed datagram: {}", self, e),
                }
            }
            Err(_) => warn!("{:?}: dropping datagram with unknown kind {}", self, kind_byte),
        }
    }

    fn send_datagram(&self, datagram: Bytes) {
        // a closed channel means the connection is disposed, nothing to report
        let _ = self.send_tx.send(datagram);
    }
}

impl Connection for ManagementConnection {
    fn id(&self) -> ConnectionId {
        self.core.id()
    }

    fn name(&self) -> &str {
        self.core.name()
    }

    fn is_disposed(&self) -> bool {
        self.core.is_disposed()
    }

    /// Every management message travels as one datagram; the declared
    ///  reliability class is ignored since there is only the one channel.
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

        let mut datagram = BytesMut::new();
        datagram.extend_from_slice(&[MgmtFrameKind::Payload.into()]);
        write_frame(&mut datagram, msg.kind(), &body);
        self.send_datagram(datagram.freeze());
    }

    fn try_dequeue(&self, kind: MessageKindId) -> Option<InboundMessage> {
        self.core.try_dequeue(kind)
    }

    fn update(&self) {
        // datagrams go out unbuffered, there is nothing to flush
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
        self.socket.lock().unwrap().take();
    }

    fn rtt_millis(&self) -> Option<f64> {
        None
    }
}

#[cfg(test)]
mod test {
    use std::time::Duration;

    use tokio::time::{sleep, timeout};

    use crate::test_util::{TestMessage, TEST_KIND};

    use super::*;

    async fn wait_for(mut condition: impl FnMut() -> bool) {
        for _ in 0..500 {
            if condition() {
                return;
            }
            sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not met within timeout");
    }

    /// The connection binds the unspecified address, so tests talk to it via
    ///  loopback at its bound port.
    async fn conn_and_server() -> (Arc<ManagementConnection>, UdpSocket, SocketAddr) {
        let server = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let conn = ManagementConnection::new(
            server.local_addr().unwrap(),
            Arc::new(IdPool::new(4)),
            Arc::new(NetConfig::default_game()),
        )
        .await
        .unwrap();
        let conn_addr = SocketAddr::new(
            Ipv4Addr::LOCALHOST.into(),
            conn.local_udp_addr().unwrap().port(),
        );
        (conn, server, conn_addr)
    }

    #[tokio::test]
    async fn test_ping_is_answered_with_pong() {
        let (conn, server, conn_addr) = conn_and_server().await;

        server.send_to(&[u8::from(MgmtFrameKind::Ping)], conn_addr).await.unwrap();

        let mut buf = [0u8; 16];
        let (n, from) = timeout(Duration::from_secs(5), server.recv_from(&mut buf))
            .await
            .expect("no pong within 5s")
            .unwrap();
        assert_eq!(from, conn_addr);
        assert_eq!(&buf[..n], &[u8::from(MgmtFrameKind::Pong)]);
        assert!(conn.has_received_pings_recently());
    }

    #[tokio::test]
    async fn test_payload_from_server_is_enqueued() {
        let (conn, server, conn_addr) = conn_and_server().await;

        let mut datagram = BytesMut::new();
        datagram.extend_from_slice(&[u8::from(MgmtFrameKind::Payload)]);
        write_frame(&mut datagram, TEST_KIND, b"server list");
        server.send_to(&datagram, conn_addr).await.unwrap();

        let mut msg = None;
        wait_for(|| {
            msg = conn.try_dequeue(TEST_KIND);
            msg.is_some()
        }).await;
        assert_eq!(&msg.unwrap().payload[..], b"server list");
    }

    #[tokio::test]
    async fn test_datagram_from_other_sender_is_dropped() {
        let (conn, _server, conn_addr) = conn_and_server().await;
        let stranger = UdpSocket::bind("127.0.0.1:0").await.unwrap();

        let mut datagram = BytesMut::new();
        datagram.extend_from_slice(&[u8::from(MgmtFrameKind::Payload)]);
        write_frame(&mut datagram, TEST_KIND, b"spoofed");
        stranger.send_to(&datagram, conn_addr).await.unwrap();

        sleep(Duration::from_millis(100)).await;
        assert!(conn.try_dequeue(TEST_KIND).is_none());
    }

    #[tokio::test]
    async fn test_send_frames_payload_datagram() {
        let (conn, server, _conn_addr) = conn_and_server().await;

        conn.send(&TestMessage::reliable(b"register"));

        let mut buf = vec![0u8; 64 * 1024];
        let n = timeout(Duration::from_secs(5), server.recv(&mut buf))
            .await
            .expect("no datagram within 5s")
            .unwrap();
        assert_eq!(buf[0], u8::from(MgmtFrameKind::Payload));

        let (kind, body) = parse_datagram(&buf[1..n], 1024 * 1024).unwrap();
        assert_eq!(kind, TEST_KIND);
        assert_eq!(&body[..], b"register");
    }

    #[tokio::test]
    async fn test_dispose_releases_socket() {
        let (conn, _server, _conn_addr) = conn_and_server().await;

        conn.dispose();
        conn.dispose();

        assert!(conn.is_disposed());
        assert!(conn.local_udp_addr().is_err(), "socket must be released on dispose");
    }

    #[tokio::test(start_paused = true)]
    async fn test_liveness_times_out_and_recovers() {
        let (conn, _server, _conn_addr) = conn_and_server().await;
        assert!(conn.has_received_pings_recently());

        tokio::time::advance(Duration::from_secs(61)).await;
        assert!(!conn.has_received_pings_recently());

        conn.on_ping_received();
        assert!(conn.has_received_pings_recently());
    }
}
