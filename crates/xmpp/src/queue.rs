//! Holds inbound room messages for one scheduler tick so a burst of history
//! replay and live traffic comes out in timestamp order.

use collab_core::scheduler::{Scheduler, TickHandle};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueuedMessage {
    /// Epoch millis.
    pub timestamp: i64,
    /// Room nick; `None` for informational lines.
    pub sender: Option<String>,
    pub body: String,
}

#[derive(Debug, Default)]
pub struct DelayedMessageQueue {
    buffer: Vec<QueuedMessage>,
    pending: Option<TickHandle>,
}

impl DelayedMessageQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Buffer a message, scheduling a flush unless one is already pending.
    pub fn push<S: Scheduler + ?Sized>(&mut self, message: QueuedMessage, scheduler: &mut S) {
        if self.pending.is_none() {
            self.pending = Some(scheduler.schedule_soon());
        }
        self.buffer.push(message);
    }

    /// Take the buffered batch for a fired tick, sorted by timestamp with
    /// arrival order kept for equal timestamps.
    ///
    /// Returns `None` for a tick that is not the pending one.
    pub fn take_batch(&mut self, tick: TickHandle) -> Option<Vec<QueuedMessage>> {
        if self.pending != Some(tick) {
            return None;
        }

        self.pending = None;
        Some(self.sorted_batch())
    }

    /// Take the buffered batch now instead of waiting for the pending tick,
    /// which is cancelled.
    pub fn flush_now<S: Scheduler + ?Sized>(&mut self, scheduler: &mut S) -> Vec<QueuedMessage> {
        if let Some(tick) = self.pending.take() {
            scheduler.cancel(tick);
        }
        self.sorted_batch()
    }

    /// Cancel the pending tick and drop whatever is buffered. Returns the
    /// number of dropped messages.
    pub fn cancel<S: Scheduler + ?Sized>(&mut self, scheduler: &mut S) -> usize {
        if let Some(tick) = self.pending.take() {
            scheduler.cancel(tick);
        }
        let dropped = self.buffer.len();
        self.buffer.clear();
        dropped
    }

    fn sorted_batch(&mut self) -> Vec<QueuedMessage> {
        let mut batch = std::mem::take(&mut self.buffer);
        batch.sort_by_key(|message| message.timestamp);
        batch
    }

    pub fn is_scheduled(&self) -> bool {
        self.pending.is_some()
    }

    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }
}
