use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::task::AbortHandle;

/// How a pending request was released.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Completion {
    Fresh,
    TimedOut,
}

type Callback = Box<dyn FnOnce(Completion) + Send>;

struct Entry {
    id: u64,
    callback: Callback,
    timer: AbortHandle,
}

#[derive(Default)]
struct Queue {
    next_id: u64,
    waiting: VecDeque<Entry>,
}

/// FIFO of callbacks waiting for the next `CURRENT_STATUS` snapshot.
///
/// Every callback runs exactly once: either from [`complete_all`], in
/// registration order, or from its own timer once `limit` elapses. An
/// entry leaves the queue under the lock before its callback runs, so
/// the two paths cannot both fire it.
///
/// [`complete_all`]: PendingRequests::complete_all
#[derive(Default)]
pub struct PendingRequests {
    queue: Arc<Mutex<Queue>>,
}

impl PendingRequests {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queues `callback`. Must be called inside a tokio runtime.
    pub fn register<F>(&self, limit: Duration, callback: F)
    where
        F: FnOnce(Completion) + Send + 'static,
    {
        let mut queue = self.queue.lock().unwrap();
        let id = queue.next_id;
        queue.next_id += 1;

        let shared = self.queue.clone();
        let timer = tokio::spawn(async move {
            tokio::time::sleep(limit).await;
            let expired = {
                let mut queue = shared.lock().unwrap();
                let index = queue.waiting.iter().position(|e| e.id == id);
                index.and_then(|i| queue.waiting.remove(i))
            };
            if let Some(entry) = expired {
                (entry.callback)(Completion::TimedOut);
            }
        });

        queue.waiting.push_back(Entry {
            id,
            callback: Box::new(callback),
            timer: timer.abort_handle(),
        });
    }

    /// Registers a request and waits for its completion.
    pub async fn wait(&self, limit: Duration) -> Completion {
        let (tx, rx) = oneshot::channel();
        self.register(limit, move |completion| {
            let _ = tx.send(completion);
        });
        rx.await.unwrap_or(Completion::TimedOut)
    }

    /// Runs every queued callback in registration order and returns how
    /// many ran.
    pub fn complete_all(&self) -> usize {
        let drained: Vec<Entry> = self.queue.lock().unwrap().waiting.drain(..).collect();
        let count = drained.len();
        for entry in drained {
            entry.timer.abort();
            (entry.callback)(Completion::Fresh);
        }
        count
    }

    pub fn len(&self) -> usize {
        self.queue.lock().unwrap().waiting.len()
    }
}
