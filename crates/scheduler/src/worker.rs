//! Decode worker pool
//!
//! Worker threads pull requests from a [`RequestScheduler`], run them
//! through an executor callback and release their in-flight slot. Requests
//! cancelled while queued are still passed to the executor with their token
//! set, so the owner of the work can re-issue it or drop it.

use std::io;
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use tracing::{debug, warn};

use crate::cancel::CancellationToken;
use crate::priority::ScheduledRequest;
use crate::scheduler::RequestScheduler;

/// Runs one request. Should check the token between expensive steps.
pub type RequestExecutor = Arc<dyn Fn(&ScheduledRequest, &CancellationToken) + Send + Sync>;

#[derive(Debug, Clone)]
pub struct WorkerPoolConfig {
    /// Defaults to the number of logical cores.
    pub num_workers: usize,
    /// Idle wait between queue polls
    pub poll_interval: Duration,
}

impl Default for WorkerPoolConfig {
    fn default() -> Self {
        Self::new(num_cpus())
    }
}

impl WorkerPoolConfig {
    pub fn new(num_workers: usize) -> Self {
        Self {
            num_workers: num_workers.max(1),
            poll_interval: Duration::from_millis(10),
        }
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }
}

/// Fixed set of threads draining a request scheduler.
///
/// ```
/// use std::sync::Arc;
/// use voxstream_scheduler::{
///     CancellationToken, FrameRequest, RequestScheduler, RequestType, ScheduledRequest,
///     WorkerPool, WorkerPoolConfig,
/// };
///
/// let scheduler = RequestScheduler::default();
/// let executor = Arc::new(|request: &ScheduledRequest, token: &CancellationToken| {
///     if token.is_cancelled() {
///         return;
///     }
///     let _ = request.frame_index();
/// });
///
/// let pool = WorkerPool::new(scheduler.clone(), executor, WorkerPoolConfig::new(2)).unwrap();
/// scheduler.submit(RequestType::Interaction, FrameRequest::new("ct-1", 0));
/// pool.shutdown();
/// ```
pub struct WorkerPool {
    workers: Vec<Worker>,
    shutdown: Arc<AtomicBool>,
}

impl WorkerPool {
    /// Spawn the worker threads.
    pub fn new(
        scheduler: RequestScheduler,
        executor: RequestExecutor,
        config: WorkerPoolConfig,
    ) -> io::Result<Self> {
        let shutdown = Arc::new(AtomicBool::new(false));
        let mut workers = Vec::with_capacity(config.num_workers);

        for id in 0..config.num_workers {
            let spawned = Worker::spawn(
                id,
                scheduler.clone(),
                executor.clone(),
                shutdown.clone(),
                config.poll_interval,
            );
            match spawned {
                Ok(worker) => workers.push(worker),
                Err(err) => {
                    shutdown.store(true, Ordering::Release);
                    workers.into_iter().for_each(Worker::join);
                    return Err(err);
                }
            }
        }

        debug!(workers = workers.len(), "decode worker pool started");
        Ok(Self { workers, shutdown })
    }

    pub fn num_workers(&self) -> usize {
        self.workers.len()
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutdown.load(Ordering::Acquire)
    }

    /// Stop accepting work and wait for every worker to finish its current
    /// request.
    pub fn shutdown(self) {
        self.shutdown.store(true, Ordering::Release);
        for worker in self.workers {
            worker.join();
        }
    }
}

struct Worker {
    id: usize,
    thread: Option<JoinHandle<()>>,
}

impl Worker {
    fn spawn(
        id: usize,
        scheduler: RequestScheduler,
        executor: RequestExecutor,
        shutdown: Arc<AtomicBool>,
        poll_interval: Duration,
    ) -> io::Result<Self> {
        let thread = thread::Builder::new()
            .name(format!("voxstream-decode-{id}"))
            .spawn(move || Self::run(scheduler, executor, shutdown, poll_interval))?;
        Ok(Self {
            id,
            thread: Some(thread),
        })
    }

    fn run(
        scheduler: RequestScheduler,
        executor: RequestExecutor,
        shutdown: Arc<AtomicBool>,
        poll_interval: Duration,
    ) {
        while !shutdown.load(Ordering::Acquire) {
            let Some(request) = scheduler.next_request() else {
                thread::sleep(poll_interval);
                continue;
            };
            let token = scheduler
                .cancellation_token(request.id)
                .unwrap_or_default();
            executor(&request, &token);
            scheduler.complete_request(request.id);
        }
    }

    fn join(mut self) {
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                warn!(worker = self.id, "decode worker panicked");
            }
        }
    }
}

/// Logical core count, used as the default pool size.
fn num_cpus() -> usize {
    thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(4)
}
