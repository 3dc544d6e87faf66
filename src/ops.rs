//! The per-connection operation queue.
//!
//! Everything that mutates connection state funnels through here: API calls,
//! receive flushes, send flushes, timer expirations. Producers on arbitrary
//! threads enqueue under a short-lived lock; exactly one worker at a time
//! drains. The enqueue that transitions the queue from empty to non-empty is
//! the signal to schedule the connection on its worker.

use std::collections::VecDeque;
use std::net::SocketAddrV6;
use std::sync::Mutex;

use crate::timer_table::TimerType;
use crate::StreamId;

/// Application-initiated work routed through the queue so it serializes with
/// everything else.
#[derive(Debug)]
pub enum ApiOp {
    /// The owner dropped its handle; no further events may be emitted.
    CloseHandle,
    /// The owner asked for connection shutdown.
    Shutdown {
        app: bool,
        error_code: u64,
        silent: bool,
    },
}

#[derive(Debug)]
pub enum Operation {
    ApiCall(ApiOp),
    FlushRecv,
    Unreachable { remote: SocketAddrV6 },
    FlushStreamRecv { id: StreamId },
    FlushSend,
    TlsComplete,
    TimerExpired { ty: TimerType },
    TraceRundown,
}

#[derive(Default)]
pub struct OperQueue {
    inner: Mutex<VecDeque<Operation>>,
}

impl OperQueue {
    pub fn new() -> Self {
        Default::default()
    }

    /// Append an operation. Returns true when the queue was empty, in which
    /// case the caller must schedule the connection on its worker.
    pub fn enqueue(&self, op: Operation) -> bool {
        let mut queue = self.inner.lock().unwrap();
        let was_empty = queue.is_empty();
        queue.push_back(op);
        was_empty
    }

    /// Insert ahead of all queued operations; same scheduling contract.
    pub fn enqueue_front(&self, op: Operation) -> bool {
        let mut queue = self.inner.lock().unwrap();
        let was_empty = queue.is_empty();
        queue.push_front(op);
        was_empty
    }

    pub fn dequeue(&self) -> Option<Operation> {
        self.inner.lock().unwrap().pop_front()
    }

    pub fn has_pending(&self) -> bool {
        !self.inner.lock().unwrap().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    #[test]
    fn fifo_with_front_insert() {
        let queue = OperQueue::new();
        assert!(queue.enqueue(Operation::FlushRecv));
        assert!(!queue.enqueue(Operation::FlushSend));
        assert!(!queue.enqueue_front(Operation::ApiCall(ApiOp::CloseHandle)));

        assert_matches!(queue.dequeue(), Some(Operation::ApiCall(ApiOp::CloseHandle)));
        assert_matches!(queue.dequeue(), Some(Operation::FlushRecv));
        assert_matches!(queue.dequeue(), Some(Operation::FlushSend));
        assert_matches!(queue.dequeue(), None);
    }

    #[test]
    fn empty_transition_signals_once() {
        let queue = OperQueue::new();
        assert!(queue.enqueue(Operation::FlushRecv));
        assert!(!queue.enqueue(Operation::FlushRecv));
        while queue.dequeue().is_some() {}
        assert!(queue.enqueue(Operation::FlushRecv));
    }
}
