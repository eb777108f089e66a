use std::fmt::{Debug, Formatter};
use std::sync::{Arc, Mutex};

use bytes::BytesMut;
#[cfg(test)] use mockall::automock;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::config::NetConfig;
use crate::connection::core::ConnectionCore;
use crate::connection::id_pool::IdPool;
use crate::connection::{Connection, ConnectionId};
use crate::error::TransportError;
use crate::message::{is_control_kind, InboundMessage, Message, MessageKindId, SendType};
use crate::wire::{parse_datagram, write_frame, FRAME_HEADER_LEN};

/// Reliability flag handed to the platform API, derived from a message's
///  [SendType].
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum SendFlags {
    Reliable,
    Unreliable,
}

/// The seam to a platform networking-sockets API (e.g. a Steam-style SDK):
///  a single handle through which reliable and unreliable messages are
///  multiplexed. Decoupling this behind a trait keeps the connection logic
///  testable without the platform runtime.
#[cfg_attr(test, automock)]
pub trait PlatformSockets: Send + Sync + 'static {
    /// Submits one message on the handle. A platform error code is returned as
    ///  `Err`.
    fn send_message(&self, handle: u64, data: &[u8], flags: SendFlags) -> Result<(), i32>;

    /// Closes the handle, with a human-readable reason for the peer / logs.
    fn close(&self, handle: u64, reason: &str);
}

/// A connection over the platform-sockets API. Satisfies the same
///  [Connection] contract as the duplex transport, so callers are
///  transport-agnostic.
pub struct PlatformConnection {
    core: ConnectionCore,
    config: Arc<NetConfig>,
    sockets: Arc<dyn PlatformSockets>,
    handle: u64,
    /// reusable serialization buffer so sends do not allocate
    scratch: Mutex<BytesMut>,
}

impl Debug for PlatformConnection {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "PlatformConnection({}#{})", self.core.id(), self.handle)
    }
}

impl PlatformConnection {
    pub fn new(
        name: impl Into<String>,
        handle: u64,
        sockets: Arc<dyn PlatformSockets>,
        id_pool: Arc<IdPool>,
        config: Arc<NetConfig>,
    ) -> anyhow::Result<Arc<PlatformConnection>> {
        let core = ConnectionCore::new(name, id_pool, &config)?;
        let scratch = BytesMut::with_capacity(config.max_message_size as usize + FRAME_HEADER_LEN);
        Ok(Arc::new(PlatformConnection {
            core,
            config,
            sockets,
            handle,
            scratch: Mutex::new(scratch),
        }))
    }

    pub fn handle(&self) -> u64 {
        self.handle
    }

    /// Inbound path, invoked by the platform poll with one complete message.
    pub fn on_platform_message(&self, data: &[u8]) {
        if self.core.is_disposed() {
            return;
        }
        match parse_datagram(data, self.config.max_message_size) {
            Ok((kind, _)) if is_control_kind(kind) => {
                debug!("{:?}: ignoring control frame {:?}, the platform handles liveness itself", self, kind);
            }
            Ok((kind, body)) => self.core.enqueue_message(InboundMessage {
                kind,
                payload: body,
                received_at: Instant::now(),
            }),
            Err(e) => {
                // the platform preserves message boundaries, but a corrupt
                // frame still means this peer cannot be trusted
                warn!("{:?}: malformed platform message: {}", self, e);
                self.core.push_error(TransportError::InvalidHeader(e.to_string()));
            }
        }
    }
}

impl Connection for PlatformConnection {
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

        let flags = match msg.send_type() {
            SendType::Reliable => SendFlags::Reliable,
            SendType::BestEffort => SendFlags::Unreliable,
        };

        let mut scratch = self.scratch.lock().unwrap();
        scratch.clear();
        write_frame(&mut scratch, msg.kind(), &body);
        if let Err(code) = self.sockets.send_message(self.handle, &scratch, flags) {
            self.core.push_error(TransportError::Platform(code));
        }
    }

    fn try_dequeue(&self, kind: MessageKindId) -> Option<InboundMessage> {
        self.core.try_dequeue(kind)
    }

    fn update(&self) {
        // single multiplexed channel, nothing is buffered locally
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
        self.sockets.close(self.handle, &format!("disposed: {}", self.core.name()));
    }

    fn rtt_millis(&self) -> Option<f64> {
        // the platform API tracks liveness and latency itself
        None
    }
}
