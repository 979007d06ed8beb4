use std::fmt;

use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::key::ResourceKey;

use super::ResourceCallback;
use super::executor::TaskHandle;

/// Identifies one callback attached to an [`EngineJob`].
pub(crate) type CallbackId = u64;

pub(crate) type BoxedCallback<T> = Box<dyn ResourceCallback<T>>;

/// The lifecycle of an [`EngineJob`].
///
/// `Complete`, `Failed` and `Cancelled` are terminal: once reached, the status never changes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobStatus {
    Created,
    Running,
    Complete,
    Failed,
    Cancelled,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Complete | Self::Failed | Self::Cancelled)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub(crate) enum AttachError {
    #[error("job already reached status {0:?}")]
    Terminal(JobStatus),
}

/// What happened when a callback was detached from a job.
pub(crate) enum Detached<T> {
    /// The callback was removed, other callbacks remain.
    Removed(BoxedCallback<T>),
    /// The last callback was removed, the job is now cancelled.
    Cancelled(BoxedCallback<T>),
    /// There was no such callback, or the job already finished.
    NotFound,
}

/// The coordinator of all loads of one key that are waiting for the same decode.
///
/// The job only tracks state, it never calls any callback itself. The terminal transitions hand
/// the attached callbacks back to the caller, who is responsible for notifying them outside of
/// any lock.
pub(crate) struct EngineJob<T> {
    key: ResourceKey,
    generation: u64,
    status: JobStatus,
    callbacks: Vec<(CallbackId, BoxedCallback<T>)>,
    next_callback: CallbackId,
    cancel: CancellationToken,
    task: Option<TaskHandle>,
}

impl<T> EngineJob<T> {
    /// Creates a job on behalf of its first callback.
    pub fn new(key: ResourceKey, generation: u64, callback: BoxedCallback<T>) -> (Self, CallbackId) {
        let job = Self {
            key,
            generation,
            status: JobStatus::Created,
            callbacks: vec![(0, callback)],
            next_callback: 1,
            cancel: CancellationToken::new(),
            task: None,
        };
        (job, 0)
    }

    /// Distinguishes this job from earlier and later jobs for the same key.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn callbacks(&self) -> usize {
        self.callbacks.len()
    }

    /// The token the decode of this job observes.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Attaches another callback to the job.
    ///
    /// This fails once the job reached a terminal status, handing the callback back.
    pub fn attach(
        &mut self,
        callback: BoxedCallback<T>,
    ) -> Result<CallbackId, (AttachError, BoxedCallback<T>)> {
        if self.status.is_terminal() {
            return Err((AttachError::Terminal(self.status), callback));
        }
        let id = self.next_callback;
        self.next_callback += 1;
        self.callbacks.push((id, callback));
        Ok(id)
    }

    /// Records that the decode for this job was submitted.
    pub fn start(&mut self, task: TaskHandle) {
        if self.status == JobStatus::Created {
            self.status = JobStatus::Running;
            self.task = Some(task);
        } else {
            // cancelled before it could start
            task.cancel();
        }
    }

    /// Detaches one callback, cancelling the job if it was the last one.
    pub fn remove(&mut self, id: CallbackId) -> Detached<T> {
        if self.status.is_terminal() {
            return Detached::NotFound;
        }
        let Some(index) = self.callbacks.iter().position(|(cid, _)| *cid == id) else {
            return Detached::NotFound;
        };
        let (_, callback) = self.callbacks.remove(index);

        if self.callbacks.is_empty() {
            self.cancel();
            Detached::Cancelled(callback)
        } else {
            Detached::Removed(callback)
        }
    }

    /// Transitions to `Complete`, returning the callbacks to notify in attach order.
    ///
    /// Returns `None` if the job already reached a terminal status.
    pub fn complete(&mut self) -> Option<Vec<BoxedCallback<T>>> {
        self.finish(JobStatus::Complete)
    }

    /// Transitions to `Failed`, returning the callbacks to notify in attach order.
    ///
    /// Returns `None` if the job already reached a terminal status.
    pub fn fail(&mut self) -> Option<Vec<BoxedCallback<T>>> {
        self.finish(JobStatus::Failed)
    }

    /// Cancels the job on behalf of the engine, returning the callbacks that are still attached.
    pub fn shutdown(&mut self) -> Vec<BoxedCallback<T>> {
        if self.status.is_terminal() {
            return Vec::new();
        }
        self.cancel();
        self.callbacks.drain(..).map(|(_, cb)| cb).collect()
    }

    fn cancel(&mut self) {
        self.status = JobStatus::Cancelled;
        self.cancel.cancel();
        if let Some(task) = self.task.take() {
            task.cancel();
        }
    }

    fn finish(&mut self, status: JobStatus) -> Option<Vec<BoxedCallback<T>>> {
        if self.status.is_terminal() {
            tracing::debug!(key = %self.key, ?status, current = ?self.status, "Ignoring duplicate job result");
            return None;
        }
        self.status = status;
        self.task = None;
        Some(self.callbacks.drain(..).map(|(_, cb)| cb).collect())
    }
}

impl<T> fmt::Debug for EngineJob<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EngineJob")
            .field("key", &self.key)
            .field("generation", &self.generation)
            .field("status", &self.status)
            .field("callbacks", &self.callbacks.len())
            .finish()
    }
}
