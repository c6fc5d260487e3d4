use std::future::Future;
use std::sync::Arc;
use std::sync::Mutex as StdMutex;
use std::sync::PoisonError;
use std::time::Duration;

use tokio::sync::oneshot;
use tokio::time::sleep;
use tracing::debug;

/// Single-use slot that several producers race to fill.
///
/// The first producer to claim the slot delivers its value; every later
/// attempt is a no-op that reports `false`. Claiming and delivering are
/// separate steps so the winner can run a side effect before the consumer
/// wakes up.
#[derive(Debug)]
pub(crate) struct CompletionSlot<T> {
    sender: StdMutex<Option<oneshot::Sender<T>>>,
}

impl<T> CompletionSlot<T> {
    pub(crate) fn new() -> (Arc<Self>, oneshot::Receiver<T>) {
        let (tx, rx) = oneshot::channel();
        let slot = Self {
            sender: StdMutex::new(Some(tx)),
        };
        (Arc::new(slot), rx)
    }

    pub(crate) fn fulfill(&self, value: T) -> bool {
        self.fulfill_with(|| value)
    }

    /// Claims the slot, then builds and delivers the value. `make` only runs
    /// for the winning producer.
    pub(crate) fn fulfill_with(&self, make: impl FnOnce() -> T) -> bool {
        let sender = self
            .sender
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        let Some(sender) = sender else {
            return false;
        };
        // The consumer may have gone away; the slot is still spent.
        let _ = sender.send(make());
        true
    }
}

#[derive(Debug)]
pub enum GuardOutcome<T> {
    Completed(T),
    Expired,
}

/// Bounds a pending read with a deadline.
///
/// The read runs in its own task and races a timer for a
/// [`CompletionSlot`]. The read is never cancelled: when the timer wins, the
/// read keeps running and its eventual result is dropped. `on_expire` runs
/// only when the timer wins, and it finishes before the caller is resumed.
#[derive(Debug, Clone, Copy)]
pub struct TimeoutGuard {
    deadline: Duration,
}

impl TimeoutGuard {
    pub fn new(deadline: Duration) -> Self {
        Self { deadline }
    }

    pub fn deadline(&self) -> Duration {
        self.deadline
    }

    pub async fn run<T, F, E>(&self, read: F, on_expire: E) -> GuardOutcome<T>
    where
        T: Send + 'static,
        F: Future<Output = T> + Send + 'static,
        E: FnOnce() + Send + 'static,
    {
        let (slot, completion) = CompletionSlot::new();

        let read_slot = Arc::clone(&slot);
        tokio::spawn(async move {
            let value = read.await;
            if !read_slot.fulfill(GuardOutcome::Completed(value)) {
                debug!("read finished after its deadline; discarding result");
            }
        });

        let deadline = self.deadline;
        let timer = tokio::spawn(async move {
            sleep(deadline).await;
            slot.fulfill_with(|| {
                on_expire();
                GuardOutcome::Expired
            });
        });

        // Both producers hold the slot until they finish, so the receiver
        // only errors if both of them died without delivering.
        let outcome = completion.await.unwrap_or(GuardOutcome::Expired);
        timer.abort();
        outcome
    }
}
