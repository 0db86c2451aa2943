//! "Run soon" scheduling for work that should wait until the current burst of
//! events has been handled.

#[cfg(feature = "native")]
use tokio::{sync::mpsc, task::AbortHandle};

/// Identifies one scheduled tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TickHandle(u64);

impl TickHandle {
    pub fn new(id: u64) -> Self {
        Self(id)
    }

    pub fn id(self) -> u64 {
        self.0
    }
}

pub trait Scheduler {
    /// Request a tick at the next opportunity of the owning event loop.
    fn schedule_soon(&mut self) -> TickHandle;

    /// Withdraw a tick. Cancelling a tick that already fired is a no-op.
    fn cancel(&mut self, handle: TickHandle);
}

/// Records requests; tests decide when ticks fire.
#[derive(Debug, Default)]
pub struct ManualScheduler {
    next_id: u64,
    scheduled: Vec<TickHandle>,
    cancelled: Vec<TickHandle>,
}

impl ManualScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every handle ever scheduled, oldest first.
    pub fn scheduled(&self) -> &[TickHandle] {
        &self.scheduled
    }

    pub fn cancelled(&self) -> &[TickHandle] {
        &self.cancelled
    }

    pub fn last_scheduled(&self) -> Option<TickHandle> {
        self.scheduled.last().copied()
    }
}

impl Scheduler for ManualScheduler {
    fn schedule_soon(&mut self) -> TickHandle {
        self.next_id += 1;
        let handle = TickHandle(self.next_id);
        self.scheduled.push(handle);
        handle
    }

    fn cancel(&mut self, handle: TickHandle) {
        self.cancelled.push(handle);
    }
}

/// Delivers ticks through a channel read by the session loop.
///
/// The tick is sent from a task that yields once first, so every event that is
/// already queued for the loop is handled before the tick arrives.
#[cfg(feature = "native")]
pub struct TokioScheduler {
    next_id: u64,
    ticks: mpsc::UnboundedSender<TickHandle>,
    pending: Option<(TickHandle, AbortHandle)>,
}

#[cfg(feature = "native")]
impl TokioScheduler {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<TickHandle>) {
        let (ticks, receiver) = mpsc::unbounded_channel();
        let scheduler = Self {
            next_id: 0,
            ticks,
            pending: None,
        };
        (scheduler, receiver)
    }
}

#[cfg(feature = "native")]
impl Scheduler for TokioScheduler {
    fn schedule_soon(&mut self) -> TickHandle {
        self.next_id += 1;
        let handle = TickHandle(self.next_id);
        let ticks = self.ticks.clone();
        let task = tokio::spawn(async move {
            tokio::task::yield_now().await;
            let _ = ticks.send(handle);
        });
        self.pending = Some((handle, task.abort_handle()));
        handle
    }

    fn cancel(&mut self, handle: TickHandle) {
        match self.pending.take() {
            Some((pending, task)) if pending == handle => task.abort(),
            other => self.pending = other,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn manual_scheduler_hands_out_distinct_handles() {
        let mut scheduler = ManualScheduler::new();
        let first = scheduler.schedule_soon();
        let second = scheduler.schedule_soon();
        assert_ne!(first, second);
        assert_eq!(scheduler.scheduled(), &[first, second]);
        assert_eq!(scheduler.last_scheduled(), Some(second));

        scheduler.cancel(first);
        assert_eq!(scheduler.cancelled(), &[first]);
    }

    #[cfg(feature = "native")]
    #[tokio::test(flavor = "current_thread")]
    async fn tokio_scheduler_delivers_tick() {
        let (mut scheduler, mut ticks) = TokioScheduler::new();
        let handle = scheduler.schedule_soon();

        let delivered = tokio::time::timeout(std::time::Duration::from_millis(100), ticks.recv())
            .await
            .expect("timed out waiting for tick");
        assert_eq!(delivered, Some(handle));
    }

    #[cfg(feature = "native")]
    #[tokio::test(flavor = "current_thread")]
    async fn cancelled_tick_never_arrives() {
        let (mut scheduler, mut ticks) = TokioScheduler::new();
        let handle = scheduler.schedule_soon();
        scheduler.cancel(handle);

        let result = tokio::time::timeout(std::time::Duration::from_millis(50), ticks.recv()).await;
        assert!(result.is_err(), "cancelled tick should not be delivered");
    }
}
