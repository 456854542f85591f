use std::collections::VecDeque;
use std::fmt;
use std::future::Future;
use std::sync::{Arc, Mutex};

use futures::FutureExt;
use futures::future::BoxFuture;
use sentry::{Hub, SentryFutureExt};
use tokio::runtime::Handle;
use tokio::sync::oneshot;
use tokio::time::Instant;

/// A FIFO queue that limits how many units of work run at the same time.
///
/// The limit is global, a burst of unrelated work competes for the same slots. Work is started
/// strictly in submission order whenever a slot frees up. Once started, a unit of work runs to
/// completion, there is no way to abort it.
#[derive(Clone)]
pub struct AdmissionQueue {
    inner: Arc<QueueInner>,
}

struct QueueInner {
    limit: usize,
    runtime: Handle,
    state: Mutex<QueueState>,
}

#[derive(Default)]
struct QueueState {
    running: usize,
    pending: VecDeque<QueuedJob>,
}

struct QueuedJob {
    job: BoxFuture<'static, ()>,
    enqueued_at: Instant,
}

/// Occupies one slot while a job is running.
///
/// The slot is handed to the next queued job on drop, which also covers jobs that panic.
struct RunningSlot {
    queue: Arc<QueueInner>,
}

impl Drop for RunningSlot {
    fn drop(&mut self) {
        self.queue.state.lock().unwrap().running -= 1;
        QueueInner::dispatch_next(&self.queue);
    }
}

impl AdmissionQueue {
    /// Creates a queue which runs up to `limit` jobs on the given runtime.
    ///
    /// A `limit` of `0` is treated as `1`.
    pub fn new(limit: usize, runtime: Handle) -> Self {
        Self {
            inner: Arc::new(QueueInner {
                limit: limit.max(1),
                runtime,
                state: Mutex::default(),
            }),
        }
    }

    /// Submits `task` to the queue.
    ///
    /// The returned receiver resolves with the output of `task` once it has been run. It errors if
    /// the task panicked or the runtime shut down before the task could finish.
    pub fn enqueue<F>(&self, task: F) -> oneshot::Receiver<F::Output>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        let (result_tx, result_rx) = oneshot::channel();
        let job = async move {
            // the caller might not be interested in the result anymore
            result_tx.send(task.await).ok();
        }
        .boxed();

        self.inner.state.lock().unwrap().pending.push_back(QueuedJob {
            job,
            enqueued_at: Instant::now(),
        });
        QueueInner::dispatch_next(&self.inner);

        result_rx
    }

    /// The number of jobs waiting for a slot.
    pub fn queued(&self) -> usize {
        self.inner.state.lock().unwrap().pending.len()
    }

    /// The number of jobs currently running.
    pub fn running(&self) -> usize {
        self.inner.state.lock().unwrap().running
    }

    pub fn limit(&self) -> usize {
        self.inner.limit
    }
}

impl QueueInner {
    /// Starts queued jobs until all slots are taken.
    ///
    /// Jobs are spawned after the lock is released, as a runtime that is shutting down drops
    /// them right away, which releases their slot.
    fn dispatch_next(this: &Arc<Self>) {
        let ready = {
            let mut state = this.state.lock().unwrap();
            let mut ready = Vec::new();
            while state.running < this.limit {
                let Some(job) = state.pending.pop_front() else {
                    break;
                };
                state.running += 1;
                ready.push(job);
            }
            metric!(gauge("batcher.queue.size") = state.pending.len() as u64);
            ready
        };

        for QueuedJob { job, enqueued_at } in ready {
            metric!(timer("batcher.queue.wait") = enqueued_at.elapsed());

            let slot = RunningSlot {
                queue: Arc::clone(this),
            };
            this.runtime.spawn(
                async move {
                    let _slot = slot;
                    job.await;
                }
                .bind_hub(Hub::new_from_top(Hub::current())),
            );
        }
    }
}

impl fmt::Debug for AdmissionQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.inner.state.lock().unwrap();
        f.debug_struct("AdmissionQueue")
            .field("limit", &self.inner.limit)
            .field("running", &state.running)
            .field("queued", &state.pending.len())
            .finish()
    }
}
