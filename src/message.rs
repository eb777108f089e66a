use std::fmt::{Debug, Formatter};

use bytes::{Bytes, BytesMut};
use tokio::time::Instant;

/// Tags the message type a frame carries, so the receiving side can dispatch
///  to the right deserializer without ever looking at the body.
///
/// The wire representation is a u64; by convention those eight bytes spell a
///  short NUL-padded ASCII name, which keeps ids collision-free across
///  application modules and legible in packet captures.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct MessageKindId(pub u64);

impl MessageKindId {
    pub const fn new(value: &[u8; 8]) -> MessageKindId {
        Self(u64::from_be_bytes(*value))
    }
}

impl Debug for MessageKindId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let bytes = self.0.to_be_bytes();
        let name_len = bytes.iter().position(|&b| b == 0).unwrap_or(bytes.len());
        match std::str::from_utf8(&bytes[..name_len]) {
            Ok(name) => write!(f, "MessageKindId({:?})", name),
            Err(_) => write!(f, "MessageKindId({:#018x})", self.0),
        }
    }
}

/// Well-known control kinds, consumed by the transports themselves and never
///  surfaced to the application queue.
pub const HANDSHAKE_KIND: MessageKindId = MessageKindId::new(b"CtlHshk\0");
pub const PING_KIND: MessageKindId = MessageKindId::new(b"CtlPing\0");
pub const PONG_KIND: MessageKindId = MessageKindId::new(b"CtlPong\0");

pub fn is_control_kind(kind: MessageKindId) -> bool {
    kind == HANDSHAKE_KIND || kind == PING_KIND || kind == PONG_KIND
}

/// The reliability class of a message. It is a property of the message type,
///  not of the `send` call: control and critical data declare `Reliable` and
///  travel over the ordered channel, frequent state updates declare
///  `BestEffort` and travel over the low-latency unordered channel.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum SendType {
    Reliable,
    BestEffort,
}

/// The opaque unit of data this layer carries. Application message types
///  implement this; the connection layer only ever serializes them and picks a
///  channel from their [SendType].
pub trait Message: Debug + Send + Sync {
    fn kind(&self) -> MessageKindId;
    fn send_type(&self) -> SendType;
    fn ser(&self, buf: &mut BytesMut);
}

/// A received message as stored in a connection's inbound queue. The caller
///  matches on `kind` and deserializes `payload` itself.
#[derive(Debug, Clone)]
pub struct InboundMessage {
    pub kind: MessageKindId,
    pub payload: Bytes,
    pub received_at: Instant,
}
