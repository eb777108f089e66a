use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;

use tokio::time::Instant;

use crate::message::{InboundMessage, MessageKindId};

/// A connection's thread-safe inbound queue: background receive tasks append,
///  the application thread dequeues once per game tick. The critical section is
///  a single queue operation, so receive tasks never wait on application work.
pub struct MessageQueue {
    simulated_lag: Duration,
    queue: Mutex<VecDeque<InboundMessage>>,
}

impl MessageQueue {
    pub fn new(simulated_lag: Duration) -> MessageQueue {
        MessageQueue {
            simulated_lag,
            queue: Mutex::new(VecDeque::new()),
        }
    }

    pub fn enqueue(&self, msg: InboundMessage) {
        self.queue.lock().unwrap().push_back(msg);
    }

    /// Removes and returns the oldest queued message of the requested kind.
    ///  Returns `None` while that message's lag hold-back deadline
    ///  (`received_at + simulated_lag`) is still in the future, keeping a
    ///  deterministic minimum delay.
    pub fn try_dequeue(&self, kind: MessageKindId) -> Option<InboundMessage> {
        let mut queue = self.queue.lock().unwrap();
        let pos = queue.iter().position(|m| m.kind == kind)?;
        if queue[pos].received_at + self.simulated_lag > Instant::now() {
            return None;
        }
        queue.remove(pos)
    }

    pub fn len(&self) -> usize {
        self.queue.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.lock().unwrap().is_empty()
    }
}
