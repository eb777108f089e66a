use std::fmt::{Debug, Formatter};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::mpsc;
use tracing::{debug, trace};

use crate::connection::{Connection, ConnectionId};
use crate::message::{InboundMessage, Message, MessageKindId, SendType};

/// A joining client is `Connecting` until the application has exchanged the
///  initial reliable handshake messages and promotes it to `Active`.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum GameClientStatus {
    Connecting,
    Active,
}

/// The server's per-client wrapper around a transport connection. While the
///  client is still joining, best-effort game state traffic is suppressed so
///  the join protocol sees only the reliable channel. On disposal the client's
///  id is reported to the roster so the slot can be cleaned up.
pub struct GameClientConnection {
    inner: Arc<dyn Connection>,
    status: Mutex<GameClientStatus>,
    roster_tx: mpsc::UnboundedSender<ConnectionId>,
    disposed: AtomicBool,
}

impl Debug for GameClientConnection {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "GameClientConnection({}, {:?})", self.inner.id(), self.status())
    }
}

impl GameClientConnection {
    pub fn new(
        inner: Arc<dyn Connection>,
        roster_tx: mpsc::UnboundedSender<ConnectionId>,
    ) -> GameClientConnection {
        GameClientConnection {
            inner,
            status: Mutex::new(GameClientStatus::Connecting),
            roster_tx,
            disposed: AtomicBool::new(false),
        }
    }

    pub fn status(&self) -> GameClientStatus {
        *self.status.lock().unwrap()
    }

    /// Promotes the client to `Active` once the join protocol has completed.
    pub fn activate(&self) {
        debug!("{}: client is now active", self.inner.id());
        *self.status.lock().unwrap() = GameClientStatus::Active;
    }
}

impl Connection for GameClientConnection {
    fn id(&self) -> ConnectionId {
        self.inner.id()
    }

    fn name(&self) -> &str {
        self.inner.name()
    }

    fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::SeqCst)
    }

    fn send(&self, msg: &dyn Message) {
        if self.status() == GameClientStatus::Connecting && msg.send_type() == SendType::BestEffort {
            trace!("{}: suppressing best-effort {:?} while still connecting", self.inner.id(), msg.kind());
            return;
        }
        self.inner.send(msg);
    }

    fn try_dequeue(&self, kind: MessageKindId) -> Option<InboundMessage> {
        self.inner.try_dequeue(kind)
    }

    fn update(&self) {
        if self.status() != GameClientStatus::Active {
            return;
        }
        self.inner.update();
    }

    fn handle_errors(&self) {
        self.inner.handle_errors();
        if self.inner.is_disposed() {
            self.dispose();
        }
    }

    fn dispose(&self) {
        if self.disposed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.inner.dispose();
        let _ = self.roster_tx.send(self.inner.id());
    }

    fn rtt_millis(&self) -> Option<f64> {
        self.inner.rtt_millis()
    }
}
