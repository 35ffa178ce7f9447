#![forbid(unsafe_code)]

use std::collections::VecDeque;

use parking_lot::Mutex;
use vocare_kernel_contracts::PendingResult;

/// Accepted submissions not yet written to the store, in arrival order.
#[derive(Debug, Default)]
pub struct PendingResultsBuffer {
    queue: Mutex<VecDeque<PendingResult>>,
}

impl PendingResultsBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the queue length after the push.
    pub fn enqueue(&self, result: PendingResult) -> usize {
        let mut queue = self.queue.lock();
        queue.push_back(result);
        queue.len()
    }

    /// Takes everything queued so far. Each item is handed out exactly once.
    pub fn drain_all(&self) -> Vec<PendingResult> {
        let drained = std::mem::take(&mut *self.queue.lock());
        drained.into()
    }

    /// Copies the queue without taking anything.
    pub fn snapshot(&self) -> Vec<PendingResult> {
        self.queue.lock().iter().cloned().collect()
    }

    /// Puts a drained batch back ahead of anything enqueued since.
    pub fn requeue_front(&self, batch: Vec<PendingResult>) {
        if batch.is_empty() {
            return;
        }
        let mut queue = self.queue.lock();
        for result in batch.into_iter().rev() {
            queue.push_front(result);
        }
    }

    pub fn len(&self) -> usize {
        self.queue.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.lock().is_empty()
    }
}
