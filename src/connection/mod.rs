pub mod core;
pub mod id_pool;
pub mod message_queue;

use std::fmt::{Debug, Display, Formatter};

use crate::message::{InboundMessage, Message, MessageKindId};

/// A connection's identity: a small integer, unique among live connections,
///  returned to the pool and reused after disposal.
#[derive(Clone, Copy, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct ConnectionId(pub u32);

impl Debug for ConnectionId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}
impl Display for ConnectionId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// The contract every transport implements. All operations are non-blocking:
///  `send` hands data to a buffer or a non-blocking send primitive and returns,
///  `try_dequeue` returns `None` rather than waiting, and background completion
///  is only ever observed through the message and error queues.
///
/// After `dispose`, every operation is a no-op.
pub trait Connection: Debug + Send + Sync + 'static {
    fn id(&self) -> ConnectionId;

    /// diagnostic name
    fn name(&self) -> &str;

    fn is_disposed(&self) -> bool;

    /// Hands the message to the transport. The reliability class comes from the
    ///  message itself, not from the caller. Failures are reported via the
    ///  error queue, never to the caller.
    fn send(&self, msg: &dyn Message);

    /// Pops the oldest queued message of the requested kind. Returns `None`
    ///  when no such message exists or when the oldest one's lag hold-back has
    ///  not elapsed yet.
    fn try_dequeue(&self, kind: MessageKindId) -> Option<InboundMessage>;

    /// Once-per-tick maintenance on the application thread: flushes buffered
    ///  reliable sends and refreshes RTT probes.
    fn update(&self);

    /// Once-per-tick error promotion on the application thread: drains the
    ///  queued background errors, logs each of them, and disposes this
    ///  connection if any were present. This is the only place connections are
    ///  disposed due to an error.
    fn handle_errors(&self);

    /// Idempotent teardown: reclaims the connection id and releases transport
    ///  resources exactly once, no matter how often (or concurrently) it is
    ///  called.
    fn dispose(&self);

    /// Latest RTT estimate in milliseconds, where the transport tracks one.
    fn rtt_millis(&self) -> Option<f64>;
}
