//! Stub messages and connections for testing code built on the connection
//!  layer. They are used for testing the layer itself, but they are exported as
//!  regular code so application tests can use them as well.

use std::fmt::{Debug, Formatter};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;

use bytes::BytesMut;

use crate::connection::{Connection, ConnectionId};
use crate::message::{InboundMessage, Message, MessageKindId, SendType};

pub const TEST_KIND: MessageKindId = MessageKindId::new(b"TstData\0");
pub const BULK_KIND: MessageKindId = MessageKindId::new(b"TstBulk\0");

/// A message with a fixed payload and a chosen reliability class.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct TestMessage {
    pub kind: MessageKindId,
    pub send_type: SendType,
    pub payload: Vec<u8>,
}

impl TestMessage {
    pub fn reliable(payload: &[u8]) -> TestMessage {
        TestMessage {
            kind: TEST_KIND,
            send_type: SendType::Reliable,
            payload: payload.to_vec(),
        }
    }

    pub fn best_effort(payload: &[u8]) -> TestMessage {
        TestMessage {
            kind: TEST_KIND,
            send_type: SendType::BestEffort,
            payload: payload.to_vec(),
        }
    }

    /// best-effort under a kind of its own, for tests that must tell the two
    ///  channels apart
    pub fn best_effort_bulk(payload: &[u8]) -> TestMessage {
        TestMessage {
            kind: BULK_KIND,
            send_type: SendType::BestEffort,
            payload: payload.to_vec(),
        }
    }
}

impl Message for TestMessage {
    fn kind(&self) -> MessageKindId {
        self.kind
    }

    fn send_type(&self) -> SendType {
        self.send_type
    }

    fn ser(&self, buf: &mut BytesMut) {
        buf.extend_from_slice(&self.payload);
    }
}

/// A [Connection] that records calls instead of doing I/O, for testing the
///  role wrappers.
pub struct RecordingConnection {
    id: ConnectionId,
    name: String,
    disposed: AtomicBool,
    /// kind and reliability of every message that reached `send`
    pub sent: Mutex<Vec<(MessageKindId, SendType)>>,
    pub update_calls: AtomicUsize,
    /// makes the next `handle_errors` call act as if a background error had
    ///  been queued, i.e. dispose the connection
    pub fail_on_handle_errors: AtomicBool,
}

impl RecordingConnection {
    pub fn new(id: u32) -> RecordingConnection {
        RecordingConnection {
            id: ConnectionId(id),
            name: format!("recording-{}", id),
            disposed: AtomicBool::new(false),
            sent: Mutex::new(Vec::new()),
            update_calls: AtomicUsize::new(0),
            fail_on_handle_errors: AtomicBool::new(false),
        }
    }

    pub fn sent_count(&self) -> usize {
        self.sent.lock().unwrap().len()
    }
}

impl Debug for RecordingConnection {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "RecordingConnection({})", self.id)
    }
}

impl Connection for RecordingConnection {
    fn id(&self) -> ConnectionId {
        self.id
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::SeqCst)
    }

    fn send(&self, msg: &dyn Message) {
        self.sent.lock().unwrap().push((msg.kind(), msg.send_type()));
    }

    fn try_dequeue(&self, _kind: MessageKindId) -> Option<InboundMessage> {
        None
    }

    fn update(&self) {
        self.update_calls.fetch_add(1, Ordering::SeqCst);
    }

    fn handle_errors(&self) {
        if self.fail_on_handle_errors.load(Ordering::SeqCst) {
            self.dispose();
        }
    }

    fn dispose(&self) {
        self.disposed.store(true, Ordering::SeqCst);
    }

    fn rtt_millis(&self) -> Option<f64> {
        None
    }
}
