use std::fmt::{Debug, Formatter};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::debug;

use crate::connection::{Connection, ConnectionId};
use crate::message::{InboundMessage, Message, MessageKindId};
use crate::roles::NetEvent;

/// The client's wrapper around its one connection to the game server. Losing
///  this connection ends the session, so an unexpected disposal is surfaced as
///  a [NetEvent::ServerConnectionLost] for the application to react to; an
///  intentional disposal (leaving the game) is not.
pub struct GameServerConnection {
    inner: Arc<dyn Connection>,
    events_tx: mpsc::UnboundedSender<NetEvent>,
    disposed: AtomicBool,
}

impl Debug for GameServerConnection {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "GameServerConnection({})", self.inner.id())
    }
}

impl GameServerConnection {
    pub fn new(
        inner: Arc<dyn Connection>,
        events_tx: mpsc::UnboundedSender<NetEvent>,
    ) -> GameServerConnection {
        GameServerConnection {
            inner,
            events_tx,
            disposed: AtomicBool::new(false),
        }
    }

    /// Disposes the connection and reports the loss to the application.
    pub fn dispose_with_error(&self, reason: &str) {
        if self.disposed.swap(true, Ordering::SeqCst) {
            return;
        }
        debug!("{}: connection to server lost: {}", self.inner.id(), reason);
        let _ = self.events_tx.send(NetEvent::ServerConnectionLost {
            reason: reason.to_string(),
        });
        self.inner.dispose();
    }
}

impl Connection for GameServerConnection {
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
        self.inner.send(msg);
    }

    fn try_dequeue(&self, kind: MessageKindId) -> Option<InboundMessage> {
        self.inner.try_dequeue(kind)
    }

    fn update(&self) {
        self.inner.update();
    }

    fn handle_errors(&self) {
        self.inner.handle_errors();
        if self.inner.is_disposed() && !self.is_disposed() {
            self.dispose_with_error("connection to server lost");
        }
    }

    fn dispose(&self) {
        if self.disposed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.inner.dispose();
    }

    fn rtt_millis(&self) -> Option<f64> {
        self.inner.rtt_millis()
    }
}
