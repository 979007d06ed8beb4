use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::fmt;
use std::sync::atomic::{self, AtomicU64, AtomicUsize};
use std::sync::{Arc, Mutex};

use futures::future::BoxFuture;
use tokio::runtime::Handle;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

use crate::utils::defer::defer;

/// The order in which queued decode work is started.
///
/// Work with a higher priority is always started before work with a lower one. Within the same
/// priority, work starts in submission order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub enum Priority {
    Low,
    #[default]
    Normal,
    High,
    Immediate,
}

/// Runs decode work off the caller's thread.
pub trait Executor: Send + Sync {
    fn execute(&self, priority: Priority, task: BoxFuture<'static, ()>) -> TaskHandle;
}

/// A handle to work submitted to an [`Executor`].
///
/// Dropping the handle does not cancel the work. Work that already started is never
/// interrupted through its handle, it has to observe its own cancellation.
#[derive(Debug, Clone, Default)]
pub struct TaskHandle {
    token: CancellationToken,
}

impl TaskHandle {
    pub fn new(token: CancellationToken) -> Self {
        Self { token }
    }

    /// Makes sure the work never starts, if it did not start yet.
    pub fn cancel(&self) {
        self.token.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }
}

struct QueuedTask {
    priority: Priority,
    seq: u64,
    task: BoxFuture<'static, ()>,
    token: CancellationToken,
}

impl PartialEq for QueuedTask {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for QueuedTask {}

impl PartialOrd for QueuedTask {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for QueuedTask {
    fn cmp(&self, other: &Self) -> Ordering {
        // `BinaryHeap` is a max-heap: highest priority first, then lowest sequence number.
        self.priority
            .cmp(&other.priority)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

struct PoolInner {
    queue: Mutex<BinaryHeap<QueuedTask>>,
    notify: Notify,
    shutdown: CancellationToken,
    seq: AtomicU64,
    running: AtomicUsize,
}

impl PoolInner {
    fn pop(&self) -> Option<QueuedTask> {
        let mut queue = self.queue.lock().unwrap();
        let task = queue.pop();
        if task.is_some() && !queue.is_empty() {
            // make sure another idle worker picks up the rest
            self.notify.notify_one();
        }
        task
    }

    async fn next(&self) -> Option<QueuedTask> {
        loop {
            if let Some(task) = self.pop() {
                return Some(task);
            }
            tokio::select! {
                _ = self.shutdown.cancelled() => return None,
                _ = self.notify.notified() => {}
            }
        }
    }
}

/// A fixed number of worker tasks on a tokio runtime, fed from a priority queue.
///
/// The number of workers bounds how many decodes run at the same time, which matters because
/// decoding is CPU heavy. Dropping the pool stops the workers once their current task finishes.
pub struct WorkerPool {
    inner: Arc<PoolInner>,
    workers: usize,
}

impl WorkerPool {
    pub fn new(runtime: &Handle, workers: usize) -> Self {
        let workers = workers.max(1);
        let inner = Arc::new(PoolInner {
            queue: Mutex::new(BinaryHeap::new()),
            notify: Notify::new(),
            shutdown: CancellationToken::new(),
            seq: AtomicU64::new(0),
            running: AtomicUsize::new(0),
        });

        for worker in 0..workers {
            runtime.spawn(worker_loop(worker, inner.clone()));
        }

        Self { inner, workers }
    }

    pub fn workers(&self) -> usize {
        self.workers
    }

    /// The number of tasks that are waiting for a worker.
    pub fn queued(&self) -> usize {
        self.inner.queue.lock().unwrap().len()
    }

    /// The number of tasks that are currently running.
    pub fn running(&self) -> usize {
        self.inner.running.load(atomic::Ordering::Relaxed)
    }
}

async fn worker_loop(worker: usize, inner: Arc<PoolInner>) {
    tracing::trace!(worker, "Decode worker started");
    while let Some(queued) = inner.next().await {
        if queued.token.is_cancelled() {
            continue;
        }

        inner.running.fetch_add(1, atomic::Ordering::Relaxed);
        let _running = defer(|| {
            inner.running.fetch_sub(1, atomic::Ordering::Relaxed);
        });

        queued.task.await;
    }
    tracing::trace!(worker, "Decode worker stopped");
}

impl Executor for WorkerPool {
    fn execute(&self, priority: Priority, task: BoxFuture<'static, ()>) -> TaskHandle {
        let token = CancellationToken::new();
        let seq = self.inner.seq.fetch_add(1, atomic::Ordering::Relaxed);
        self.inner.queue.lock().unwrap().push(QueuedTask {
            priority,
            seq,
            task,
            token: token.clone(),
        });
        self.inner.notify.notify_one();
        TaskHandle::new(token)
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.inner.shutdown.cancel();
    }
}

impl fmt::Debug for WorkerPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkerPool")
            .field("workers", &self.workers)
            .field("queued", &self.queued())
            .field("running", &self.running())
            .finish()
    }
}

/// Spawns every task straight onto a tokio runtime, without any queueing.
#[derive(Debug, Clone)]
pub struct TokioExecutor {
    runtime: Handle,
}

impl TokioExecutor {
    pub fn new(runtime: Handle) -> Self {
        Self { runtime }
    }
}

impl Executor for TokioExecutor {
    fn execute(&self, _priority: Priority, task: BoxFuture<'static, ()>) -> TaskHandle {
        let token = CancellationToken::new();
        let cancelled = token.clone();
        self.runtime.spawn(async move {
            if !cancelled.is_cancelled() {
                task.await;
            }
        });
        TaskHandle::new(token)
    }
}
