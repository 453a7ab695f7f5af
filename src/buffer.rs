//! Trailing-edge event buffer.
//!
//! Items pushed while the buffer is armed accumulate; every push moves the
//! flush deadline to `now + delay`, so a batch goes out only after a quiet
//! period with no new items.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, Instant};

struct Pending<T> {
    items: Vec<T>,
    deadline: Option<Instant>,
}

struct Shared<T> {
    pending: Mutex<Pending<T>>,
    wake: Notify,
}

/// Collects pushed items and emits them as one batch after `delay` of quiet.
///
/// A zero delay turns the buffer into a pass-through that emits every item
/// as a single-element batch immediately.
pub struct EventBuffer<T> {
    delay: Duration,
    shared: Arc<Shared<T>>,
    tx: mpsc::UnboundedSender<Vec<T>>,
    task: Option<JoinHandle<()>>,
}

impl<T: Send + 'static> EventBuffer<T> {
    /// Create a buffer and the receiver its batches are delivered to.
    ///
    /// Must be called from within a tokio runtime unless `delay` is zero.
    pub fn new(delay: Duration) -> (Self, mpsc::UnboundedReceiver<Vec<T>>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let shared = Arc::new(Shared {
            pending: Mutex::new(Pending {
                items: Vec::new(),
                deadline: None,
            }),
            wake: Notify::new(),
        });

        let task = if delay.is_zero() {
            None
        } else {
            Some(tokio::spawn(run_flusher(shared.clone(), tx.clone())))
        };

        (
            Self {
                delay,
                shared,
                tx,
                task,
            },
            rx,
        )
    }

    pub fn delay(&self) -> Duration {
        self.delay
    }

    /// Append an item and restart the quiet-period timer.
    pub fn push(&self, item: T) {
        if self.task.is_none() {
            let _ = self.tx.send(vec![item]);
            return;
        }

        {
            let mut pending = self.shared.pending.lock();
            pending.items.push(item);
            pending.deadline = Some(Instant::now() + self.delay);
        }
        self.shared.wake.notify_one();
    }

    /// Number of items waiting for the next flush.
    pub fn len(&self) -> usize {
        self.shared.pending.lock().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Emit whatever is pending right now, without waiting for the timer.
    pub fn flush(&self) {
        let batch = {
            let mut pending = self.shared.pending.lock();
            pending.deadline = None;
            std::mem::take(&mut pending.items)
        };
        if !batch.is_empty() {
            let _ = self.tx.send(batch);
        }
    }
}

impl<T> Drop for EventBuffer<T> {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

async fn run_flusher<T>(shared: Arc<Shared<T>>, tx: mpsc::UnboundedSender<Vec<T>>) {
    loop {
        let deadline = shared.pending.lock().deadline;
        let Some(deadline) = deadline else {
            shared.wake.notified().await;
            continue;
        };

        sleep_until(deadline).await;

        let batch = {
            let mut pending = shared.pending.lock();
            match pending.deadline {
                // A push after we went to sleep moved the deadline.
                Some(current) if current > Instant::now() => continue,
                Some(_) => {
                    pending.deadline = None;
                    std::mem::take(&mut pending.items)
                }
                None => continue,
            }
        };

        if tx.send(batch).is_err() {
            return;
        }
    }
}
