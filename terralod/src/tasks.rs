//! Host-supplied task scheduling.
//!
//! The pipeline crosses threads at exactly two points: network completions
//! feed CPU-bound decode work (worker thread), and renderer finalization
//! runs on the host's main thread inside its per-frame update. The
//! [`TaskProcessor`] trait is how the host lends the pipeline its worker
//! pool; [`TokioTaskProcessor`] is the implementation most hosts want, and
//! [`DeferredTaskProcessor`] gives single-threaded hosts and tests full
//! control over when background work runs.

use parking_lot::Mutex;
use std::collections::VecDeque;

use crate::transport::BoxFuture;

/// A CPU-bound unit of work.
pub type WorkerTask = Box<dyn FnOnce() + Send + 'static>;

/// Scheduling hook supplied by the host.
pub trait TaskProcessor: Send + Sync {
    /// Drives an async task (network plumbing) to completion.
    fn spawn(&self, future: BoxFuture<'static, ()>);

    /// Runs CPU-bound work on a worker thread.
    fn start_task(&self, task: WorkerTask);

    /// Makes forward progress on queued work.
    ///
    /// Called by the tile destructor's bounded drain loop. Processors whose
    /// workers run on independent threads need not do anything here; the
    /// default is a no-op.
    fn pump(&self) {}
}

/// Task processor backed by a tokio runtime.
///
/// Async tasks are spawned on the runtime; CPU-bound work goes to the
/// blocking pool so decode work cannot starve the reactor.
pub struct TokioTaskProcessor {
    handle: tokio::runtime::Handle,
}

impl TokioTaskProcessor {
    /// Creates a processor driving work on the given runtime handle.
    pub fn new(handle: tokio::runtime::Handle) -> Self {
        Self { handle }
    }

    /// Creates a processor for the runtime of the calling context.
    ///
    /// # Panics
    ///
    /// Panics if called outside a tokio runtime.
    pub fn current() -> Self {
        Self::new(tokio::runtime::Handle::current())
    }
}

impl TaskProcessor for TokioTaskProcessor {
    fn spawn(&self, future: BoxFuture<'static, ()>) {
        self.handle.spawn(future);
    }

    fn start_task(&self, task: WorkerTask) {
        self.handle.spawn_blocking(task);
    }
}

enum DeferredWork {
    Future(BoxFuture<'static, ()>),
    Task(WorkerTask),
}

/// Task processor that queues all work until explicitly pumped.
///
/// Intended for single-threaded hosts and deterministic tests: nothing runs
/// until [`TaskProcessor::pump`] (or [`DeferredTaskProcessor::pump_all`]) is
/// called from the host's thread. Queued futures are driven to completion
/// with a blocking executor, so this processor is only suitable for
/// transports whose futures complete without an external reactor (mock
/// transports, in-memory sources).
#[derive(Default)]
pub struct DeferredTaskProcessor {
    queue: Mutex<VecDeque<DeferredWork>>,
}

impl DeferredTaskProcessor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of queued work items.
    pub fn pending(&self) -> usize {
        self.queue.lock().len()
    }

    /// Runs queued work until the queue is empty.
    ///
    /// Work may enqueue further work (a network completion enqueues the
    /// decode task); this keeps going until everything has drained.
    pub fn pump_all(&self) {
        while self.pump_one() {}
    }

    fn pump_one(&self) -> bool {
        let work = self.queue.lock().pop_front();
        match work {
            Some(DeferredWork::Future(future)) => {
                futures::executor::block_on(future);
                true
            }
            Some(DeferredWork::Task(task)) => {
                task();
                true
            }
            None => false,
        }
    }
}

impl TaskProcessor for DeferredTaskProcessor {
    fn spawn(&self, future: BoxFuture<'static, ()>) {
        self.queue.lock().push_back(DeferredWork::Future(future));
    }

    fn start_task(&self, task: WorkerTask) {
        self.queue.lock().push_back(DeferredWork::Task(task));
    }

    fn pump(&self) {
        self.pump_one();
    }
}
