use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use tokio::task::JoinHandle;
use tracing::{debug, error};

use crate::config::NetConfig;
use crate::connection::id_pool::IdPool;
use crate::connection::message_queue::MessageQueue;
use crate::connection::ConnectionId;
use crate::error::TransportError;
use crate::message::{InboundMessage, MessageKindId};
use crate::ping::PingInfo;

/// The lifecycle state every transport implementation embeds: id ownership,
///  the thread-safe inbound queue, the background error queue, RTT bookkeeping,
///  and the atomic dispose flag. Shared through composition, not subclassing.
pub struct ConnectionCore {
    id: ConnectionId,
    name: String,
    id_pool: Arc<IdPool>,
    disposed: AtomicBool,
    messages: MessageQueue,
    errors: Mutex<Vec<TransportError>>,
    ping: Mutex<PingInfo>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl ConnectionCore {
    /// Draws an id from the pool; fails when the pool is exhausted, so a
    ///  connection only ever exists with a valid id.
    pub fn new(
        name: impl Into<String>,
        id_pool: Arc<IdPool>,
        config: &NetConfig,
    ) -> Result<ConnectionCore, TransportError> {
        let id = id_pool.acquire()?;
        Ok(ConnectionCore {
            id,
            name: name.into(),
            id_pool,
            disposed: AtomicBool::new(false),
            messages: MessageQueue::new(config.simulated_lag),
            errors: Mutex::new(Vec::new()),
            ping: Mutex::new(PingInfo::new(config.rtt_moving_avg_new_weight)),
            tasks: Mutex::new(Vec::new()),
        })
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::SeqCst)
    }

    pub fn ping(&self) -> &Mutex<PingInfo> {
        &self.ping
    }

    /// Registers a background task for abort-on-dispose. A task registered
    ///  after disposal is aborted immediately.
    pub fn register_task(&self, handle: JoinHandle<()>) {
        let mut tasks = self.tasks.lock().unwrap();
        if self.is_disposed() {
            handle.abort();
            return;
        }
        tasks.push(handle);
    }

    pub fn enqueue_message(&self, msg: InboundMessage) {
        if self.is_disposed() {
            return;
        }
        self.messages.enqueue(msg);
    }

    pub fn try_dequeue(&self, kind: MessageKindId) -> Option<InboundMessage> {
        if self.is_disposed() {
            return None;
        }
        self.messages.try_dequeue(kind)
    }

    /// Appends a background failure for the application thread to pick up in
    ///  its next `handle_errors` call.
    pub fn push_error(&self, error: TransportError) {
        if self.is_disposed() {
            debug!("{} ({}): error after disposal, ignoring: {}", self.id, self.name, error);
            return;
        }
        self.errors.lock().unwrap().push(error);
    }

    pub fn drain_errors(&self) -> Vec<TransportError> {
        std::mem::take(&mut *self.errors.lock().unwrap())
    }

    /// Drains and logs the queued background errors; `true` if there were any.
    ///  The caller (on the application thread) disposes the connection in that
    ///  case.
    pub fn take_and_log_errors(&self) -> bool {
        let errors = self.drain_errors();
        for e in &errors {
            error!("{} ({}): {}", self.id, self.name, e);
        }
        !errors.is_empty()
    }

    /// The dispose claim: exactly one caller gets `true`, no matter how often
    ///  or how concurrently this runs. The winning caller's claim also performs
    ///  the transport-independent teardown: aborting background tasks and
    ///  returning the id to the pool.
    pub fn claim_dispose(&self) -> bool {
        if self.disposed.swap(true, Ordering::SeqCst) {
            return false;
        }

        debug!("disposing {} ({})", self.id, self.name);
        for handle in self.tasks.lock().unwrap().drain(..) {
            handle.abort();
        }
        self.id_pool.release(self.id);
        true
    }
}
