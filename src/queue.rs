//! Bounded per-function call queue for the client.
//!
//! When a call is issued while another call with the same fully qualified
//! name is still outstanding, the pre-encoded message and its continuation
//! wait here. The queue holds at most `limit` entries per function
//! (`max_calls_in_progress - 1`); beyond that the call fails with
//! `QueueOverflow`. Entries leave head-first when the outstanding call for
//! that name resolves, which preserves per-function call order.

use std::collections::{HashMap, VecDeque};

/// Per-function FIFO of deferred calls. `T` is the continuation payload
/// stored alongside the pre-encoded message.
pub(crate) struct CallQueue<T> {
    queues: HashMap<String, VecDeque<(Vec<u8>, T)>>,
}

impl<T> CallQueue<T> {
    pub(crate) fn new() -> Self {
        Self {
            queues: HashMap::new(),
        }
    }

    /// Whether another call for `func` fits under the per-function bound.
    pub(crate) fn can_enqueue(&self, func: &str, limit: usize) -> bool {
        if limit == 0 {
            return false;
        }
        match self.queues.get(func) {
            None => true,
            Some(q) => q.len() < limit,
        }
    }

    /// Defer a call: the pre-encoded message and its continuation.
    pub(crate) fn enqueue(&mut self, func: String, message: Vec<u8>, continuation: T) {
        self.queues
            .entry(func)
            .or_default()
            .push_back((message, continuation));
    }

    /// Take the head call for `func`, if any.
    pub(crate) fn pop(&mut self, func: &str) -> Option<(Vec<u8>, T)> {
        let queue = self.queues.get_mut(func)?;
        let entry = queue.pop_front();
        if queue.is_empty() {
            self.queues.remove(func);
        }
        entry
    }

    /// Number of deferred calls for `func`.
    #[cfg(test)]
    pub(crate) fn len(&self, func: &str) -> usize {
        self.queues.get(func).map_or(0, |q| q.len())
    }

    /// Drain every deferred call, in per-function order. Used for error
    /// fan-out when the session dies.
    pub(crate) fn drain_all(&mut self) -> Vec<(String, Vec<u8>, T)> {
        let mut drained = Vec::new();
        for (func, queue) in self.queues.drain() {
            for (msg, cont) in queue {
                drained.push((func.clone(), msg, cont));
            }
        }
        drained
    }
}
