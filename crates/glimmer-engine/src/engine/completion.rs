use std::collections::VecDeque;
use std::fmt;
use std::sync::Mutex;

use tokio::sync::Notify;

/// A callback invocation that is ready to run.
pub type Completion = Box<dyn FnOnce() + Send>;

/// Decides on which thread load callbacks of decoded resources run.
///
/// Completions for the same key are dispatched in the order their loads were attached, and
/// implementations must run them in dispatch order.
pub trait CompletionContext: Send + Sync {
    fn dispatch(&self, completion: Completion);
}

/// Runs completions right away, on the decode worker that produced the result.
#[derive(Debug, Clone, Copy, Default)]
pub struct Inline;

impl CompletionContext for Inline {
    fn dispatch(&self, completion: Completion) {
        completion()
    }
}

/// Hands completions to a FIFO queue that its owner drains on a thread of their choosing.
///
/// This is how results get back onto a single "main" thread: that thread either calls
/// [`drain`](Self::drain) periodically, or runs [`run`](Self::run) as a task on a local
/// executor.
#[derive(Default)]
pub struct CompletionQueue {
    queue: Mutex<VecDeque<Completion>>,
    notify: Notify,
}

impl CompletionQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.queue.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.lock().unwrap().is_empty()
    }

    /// Runs every completion that is queued right now, returning how many ran.
    ///
    /// Completions queued by the completions themselves run in the same call.
    pub fn drain(&self) -> usize {
        let mut ran = 0;
        loop {
            // never hold the lock while running a completion
            let next = self.queue.lock().unwrap().pop_front();
            match next {
                Some(completion) => {
                    completion();
                    ran += 1;
                }
                None => return ran,
            }
        }
    }

    /// Waits until at least one completion is queued.
    pub async fn ready(&self) {
        loop {
            let notified = self.notify.notified();
            if !self.is_empty() {
                return;
            }
            notified.await;
        }
    }

    /// Runs completions as they arrive, forever.
    pub async fn run(&self) {
        loop {
            self.ready().await;
            self.drain();
        }
    }
}

impl CompletionContext for CompletionQueue {
    fn dispatch(&self, completion: Completion) {
        self.queue.lock().unwrap().push_back(completion);
        self.notify.notify_waiters();
    }
}

impl fmt::Debug for CompletionQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CompletionQueue")
            .field("queued", &self.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;

    #[test]
    fn test_queue_runs_in_order_on_drain() {
        let queue = CompletionQueue::new();
        let seen = Arc::new(Mutex::new(Vec::new()));

        for i in 0..3 {
            let seen = seen.clone();
            queue.dispatch(Box::new(move || seen.lock().unwrap().push(i)));
        }
        assert!(seen.lock().unwrap().is_empty());
        assert_eq!(queue.len(), 3);

        assert_eq!(queue.drain(), 3);
        assert_eq!(*seen.lock().unwrap(), vec![0, 1, 2]);
        assert_eq!(queue.drain(), 0);
    }

    #[tokio::test]
    async fn test_ready_wakes_up() {
        let queue = Arc::new(CompletionQueue::new());
        let waiter = tokio::spawn({
            let queue = queue.clone();
            async move {
                queue.ready().await;
                queue.drain()
            }
        });
        tokio::task::yield_now().await;

        queue.dispatch(Box::new(|| {}));
        assert_eq!(waiter.await.unwrap(), 1);
    }
}
