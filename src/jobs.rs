//! Cached execution of cell jobs.
//!
//! [`JobCache`] runs each grid cell's worker call at most once per cache
//! key. A submitted job either resolves immediately from the sample cache,
//! attaches to an identical job already running, or invokes the worker:
//! inline for the serial executor, on a bounded thread pool for the
//! parallel one. A successful result is written to the sample cache before
//! its future resolves.
//!
//! ```text
//! SUBMITTED ──► CACHE_HIT ──────────────────────────► DONE
//!      │
//!      └──────► CACHE_MISS ─► RUNNING ─► SUCCESS ─► STORE ─► DONE
//!                                  └───► FAILURE ─► PROPAGATE
//! ```

use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};

use crossbeam_channel::{bounded, Receiver, Sender};
use serde::{Deserialize, Serialize};

use crate::cache::CacheStore;
use crate::config::ExecutorConfig;
use crate::error::{JobError, StorageError, SweepError, WorkerError};
use crate::hash::Digest;
use crate::worker::{Record, Worker};

/// One cell evaluation.
#[derive(Clone)]
pub struct Job {
    pub id: usize,
    pub worker: Arc<dyn Worker>,
    pub input: Record,
    pub cache_key: Digest,
    pub tag: String,
}

impl std::fmt::Debug for Job {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Job")
            .field("id", &self.id)
            .field("cache_key", &self.cache_key)
            .field("tag", &self.tag)
            .finish_non_exhaustive()
    }
}

/// Counters of a [`JobCache`].
///
/// `wrapper_calls == cache_hits + worker_invocations` at all times.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunStats {
    /// Jobs submitted.
    pub wrapper_calls: u64,
    /// Jobs served from the cache or from an identical running job.
    pub cache_hits: u64,
    /// Jobs that invoked the worker.
    pub worker_invocations: u64,
}

#[derive(Debug, Default)]
struct Counters {
    wrapper_calls: AtomicU64,
    cache_hits: AtomicU64,
    worker_invocations: AtomicU64,
}

impl Counters {
    fn hit(&self) {
        self.cache_hits.fetch_add(1, Ordering::SeqCst);
        self.wrapper_calls.fetch_add(1, Ordering::SeqCst);
    }

    fn miss(&self) {
        self.worker_invocations.fetch_add(1, Ordering::SeqCst);
        self.wrapper_calls.fetch_add(1, Ordering::SeqCst);
    }

    fn snapshot(&self) -> RunStats {
        RunStats {
            wrapper_calls: self.wrapper_calls.load(Ordering::SeqCst),
            cache_hits: self.cache_hits.load(Ordering::SeqCst),
            worker_invocations: self.worker_invocations.load(Ordering::SeqCst),
        }
    }
}

type JobOutcome = Result<Record, JobError>;

/// Completion slot shared by a running job and every future waiting on it.
#[derive(Debug, Default)]
struct JobSlot {
    outcome: Mutex<Option<JobOutcome>>,
    ready: Condvar,
}

impl JobSlot {
    fn complete(&self, outcome: JobOutcome) {
        if let Ok(mut guard) = self.outcome.lock() {
            *guard = Some(outcome);
        }
        self.ready.notify_all();
    }

    fn wait(&self) -> JobOutcome {
        let Ok(mut guard) = self.outcome.lock() else {
            return Err(JobError::Disconnected);
        };
        loop {
            if let Some(outcome) = guard.as_ref() {
                return outcome.clone();
            }
            guard = match self.ready.wait(guard) {
                Ok(guard) => guard,
                Err(_) => return Err(JobError::Disconnected),
            };
        }
    }

    fn is_complete(&self) -> bool {
        self.outcome.lock().map_or(true, |guard| guard.is_some())
    }
}

enum FutureState {
    Ready(JobOutcome),
    Pending(Arc<JobSlot>),
}

/// Handle on a submitted job's result.
pub struct JobFuture {
    id: usize,
    state: FutureState,
}

impl JobFuture {
    /// Id of the submitted job.
    pub const fn id(&self) -> usize {
        self.id
    }

    /// Whether the result is available without blocking.
    pub fn is_ready(&self) -> bool {
        match &self.state {
            FutureState::Ready(_) => true,
            FutureState::Pending(slot) => slot.is_complete(),
        }
    }

    /// Blocks until the job finishes. A worker failure is returned unchanged
    /// as [`JobError::Worker`].
    pub fn result(self) -> Result<Record, JobError> {
        match self.state {
            FutureState::Ready(outcome) => outcome,
            FutureState::Pending(slot) => slot.wait(),
        }
    }
}

impl std::fmt::Debug for JobFuture {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobFuture")
            .field("id", &self.id)
            .field("ready", &self.is_ready())
            .finish()
    }
}

/// State shared between the submitting thread and pool threads.
struct Shared {
    store: Option<Arc<CacheStore<Record>>>,
    overwrite: bool,
    counters: Counters,
    in_flight: Mutex<HashMap<Digest, Arc<JobSlot>>>,
}

impl Shared {
    fn run(&self, job: &Job, slot: &JobSlot) {
        let outcome = match catch_unwind(AssertUnwindSafe(|| job.worker.call(&job.input))) {
            Ok(Ok(output)) => self.store_output(job, output),
            Ok(Err(err)) => Err(JobError::Worker(err)),
            Err(payload) => Err(JobError::Worker(WorkerError::new(format!(
                "worker panicked: {}",
                panic_message(payload.as_ref())
            )))),
        };

        if let Err(err) = &outcome {
            tracing::debug!(job = job.id, key = %job.cache_key, error = %err, "Job failed");
        }

        if let Ok(mut in_flight) = self.in_flight.lock() {
            in_flight.remove(&job.cache_key);
        }
        slot.complete(outcome);
    }

    fn store_output(&self, job: &Job, output: Record) -> JobOutcome {
        if let Some(store) = &self.store {
            store
                .put(&job.cache_key.to_hex(), &job.tag, output.clone())
                .map_err(|e| JobError::Store {
                    message: e.to_string(),
                })?;
        }
        Ok(output)
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

struct Task {
    job: Job,
    slot: Arc<JobSlot>,
}

struct WorkerPool {
    tx: Option<Sender<Task>>,
    workers: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    fn start(workers: usize, queue_capacity: usize, shared: &Arc<Shared>) -> std::io::Result<Self> {
        let workers = workers.max(1);
        let (tx, rx) = bounded::<Task>(queue_capacity.max(1));

        let mut handles = Vec::with_capacity(workers);
        for idx in 0..workers {
            let rx: Receiver<Task> = rx.clone();
            let shared = Arc::clone(shared);
            let handle = thread::Builder::new()
                .name(format!("sweepbench-worker-{idx}"))
                .spawn(move || {
                    while let Ok(task) = rx.recv() {
                        shared.run(&task.job, &task.slot);
                    }
                })?;
            handles.push(handle);
        }

        Ok(Self {
            tx: Some(tx),
            workers: handles,
        })
    }

    fn send(&self, task: Task) -> Result<(), Task> {
        match &self.tx {
            Some(tx) => tx.send(task).map_err(|err| err.into_inner()),
            None => Err(task),
        }
    }
}

impl WorkerPool {
    /// Closes the queue and joins every worker; returns how many threads
    /// ended in a panic.
    fn shutdown(&mut self) -> usize {
        // Closing the channel lets workers drain queued tasks and exit.
        self.tx.take();
        let mut panicked = 0;
        for handle in self.workers.drain(..) {
            let name = handle.thread().name().unwrap_or("unnamed").to_string();
            if handle.join().is_err() {
                tracing::warn!(thread = %name, "Worker pool thread panicked");
                panicked += 1;
            }
        }
        panicked
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Per-cell job execution backed by a sample cache.
pub struct JobCache {
    shared: Arc<Shared>,
    pool: Option<WorkerPool>,
}

impl JobCache {
    /// Creates a job cache.
    ///
    /// With `store == None` nothing is cached and every submit invokes the
    /// worker. With `overwrite` cached values are ignored and replaced.
    pub fn new(
        store: Option<Arc<CacheStore<Record>>>,
        executor: ExecutorConfig,
        overwrite: bool,
    ) -> Result<Self, SweepError> {
        let shared = Arc::new(Shared {
            store,
            overwrite,
            counters: Counters::default(),
            in_flight: Mutex::new(HashMap::new()),
        });
        let pool = match executor {
            ExecutorConfig::Serial => None,
            ExecutorConfig::Parallel {
                workers,
                queue_capacity,
            } => Some(
                WorkerPool::start(workers, queue_capacity, &shared)
                    .map_err(|source| SweepError::WorkerPool { source })?,
            ),
        };
        Ok(Self { shared, pool })
    }

    /// Submits a job.
    pub fn submit(&self, job: Job) -> JobFuture {
        let id = job.id;
        let ready = |outcome| JobFuture {
            id,
            state: FutureState::Ready(outcome),
        };

        let slot = {
            let Ok(mut in_flight) = self.shared.in_flight.lock() else {
                return ready(Err(JobError::Disconnected));
            };

            if let Some(running) = in_flight.get(&job.cache_key) {
                self.shared.counters.hit();
                tracing::debug!(job = id, key = %job.cache_key, "Attached to running job");
                return JobFuture {
                    id,
                    state: FutureState::Pending(Arc::clone(running)),
                };
            }

            if let (Some(store), false) = (&self.shared.store, self.shared.overwrite) {
                match store.get(&job.cache_key.to_hex()) {
                    Ok(Some(output)) => {
                        self.shared.counters.hit();
                        tracing::debug!(job = id, key = %job.cache_key, "Sample cache hit");
                        return ready(Ok(output));
                    }
                    Ok(None) => {}
                    Err(e) => {
                        return ready(Err(JobError::Store {
                            message: e.to_string(),
                        }))
                    }
                }
            }

            let slot = Arc::new(JobSlot::default());
            in_flight.insert(job.cache_key, Arc::clone(&slot));
            self.shared.counters.miss();
            slot
        };

        match &self.pool {
            None => self.shared.run(&job, &slot),
            Some(pool) => {
                let task = Task {
                    job,
                    slot: Arc::clone(&slot),
                };
                if let Err(task) = pool.send(task) {
                    if let Ok(mut in_flight) = self.shared.in_flight.lock() {
                        in_flight.remove(&task.job.cache_key);
                    }
                    slot.complete(Err(JobError::Disconnected));
                }
            }
        }

        JobFuture {
            id,
            state: FutureState::Pending(slot),
        }
    }

    /// Snapshot of the counters.
    pub fn stats(&self) -> RunStats {
        self.shared.counters.snapshot()
    }

    /// Evicts every cached entry with `tag`.
    pub fn clear_tag(&self, tag: &str) -> Result<usize, StorageError> {
        match &self.shared.store {
            Some(store) => store.clear_tag(tag),
            None => Ok(0),
        }
    }

    /// Whether a result for `key` is cached.
    pub fn contains(&self, key: &Digest) -> Result<bool, StorageError> {
        match &self.shared.store {
            Some(store) => store.contains(&key.to_hex()),
            None => Ok(false),
        }
    }
}

impl std::fmt::Debug for JobCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobCache")
            .field("caching", &self.shared.store.is_some())
            .field("overwrite", &self.shared.overwrite)
            .field("parallel", &self.pool.is_some())
            .field("stats", &self.stats())
            .finish()
    }
}
