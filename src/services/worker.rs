//! Named worker threads fed through a crossbeam channel
//!
//! Tasks are boxed closures. A panicking task is logged and the worker keeps
//! going. `pending` counts tasks from submission until they finish, which is
//! what `await_completion` waits on.

use crossbeam_channel::{bounded, unbounded, Receiver, Sender, TrySendError};
use parking_lot::Mutex;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, error};

pub type Task = Box<dyn FnOnce() + Send + 'static>;

/// Poll interval of `await_completion`
const COMPLETION_POLL: Duration = Duration::from_millis(2);

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ServiceError {
    #[error("{0} queue is full")]
    QueueFull(String),
    #[error("{0} is shut down")]
    ShutDown(String),
    #[error("failed to spawn {0} worker: {1}")]
    Spawn(String, String),
}

#[derive(Debug, Default)]
struct PoolCounters {
    pending: AtomicUsize,
    active: AtomicUsize,
    completed: AtomicUsize,
    panicked: AtomicUsize,
}

pub struct WorkerPool {
    name: String,
    sender: Mutex<Option<Sender<Task>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    counters: Arc<PoolCounters>,
}

impl WorkerPool {
    /// Spawn `threads` workers. `capacity` bounds the queue; None is unbounded.
    pub fn new(name: &str, threads: usize, capacity: Option<usize>) -> Result<Self, ServiceError> {
        let (sender, receiver) = match capacity {
            Some(cap) => bounded(cap),
            None => unbounded(),
        };
        let counters = Arc::new(PoolCounters::default());

        let mut workers = Vec::with_capacity(threads.max(1));
        for index in 0..threads.max(1) {
            let receiver = receiver.clone();
            let counters = Arc::clone(&counters);
            let thread_name = format!("{}-{}", name, index);
            let handle = std::thread::Builder::new()
                .name(thread_name.clone())
                .spawn(move || run_worker(&thread_name, receiver, counters))
                .map_err(|e| ServiceError::Spawn(name.to_string(), e.to_string()))?;
            workers.push(handle);
        }

        debug!("Started {} with {} worker(s)", name, workers.len());

        Ok(Self {
            name: name.to_string(),
            sender: Mutex::new(Some(sender)),
            workers: Mutex::new(workers),
            counters,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    fn sender(&self) -> Result<Sender<Task>, ServiceError> {
        self.sender
            .lock()
            .clone()
            .ok_or_else(|| ServiceError::ShutDown(self.name.clone()))
    }

    /// Queue a task, failing fast when a bounded queue is full
    pub fn try_submit(&self, task: Task) -> Result<(), ServiceError> {
        let sender = self.sender()?;
        self.counters.pending.fetch_add(1, Ordering::AcqRel);
        match sender.try_send(task) {
            Ok(()) => Ok(()),
            Err(e) => {
                self.counters.pending.fetch_sub(1, Ordering::AcqRel);
                Err(match e {
                    TrySendError::Full(_) => ServiceError::QueueFull(self.name.clone()),
                    TrySendError::Disconnected(_) => ServiceError::ShutDown(self.name.clone()),
                })
            }
        }
    }

    /// Queue a task, blocking while a bounded queue is full
    pub fn submit(&self, task: Task) -> Result<(), ServiceError> {
        let sender = self.sender()?;
        self.counters.pending.fetch_add(1, Ordering::AcqRel);
        sender.send(task).map_err(|_| {
            self.counters.pending.fetch_sub(1, Ordering::AcqRel);
            ServiceError::ShutDown(self.name.clone())
        })
    }

    /// Tasks submitted and not yet finished
    #[inline]
    pub fn pending(&self) -> usize {
        self.counters.pending.load(Ordering::Acquire)
    }

    /// Tasks waiting in the queue
    pub fn queued(&self) -> usize {
        self.sender.lock().as_ref().map_or(0, |s| s.len())
    }

    #[inline]
    pub fn active(&self) -> usize {
        self.counters.active.load(Ordering::Acquire)
    }

    pub fn completed(&self) -> usize {
        self.counters.completed.load(Ordering::Relaxed)
    }

    pub fn panicked(&self) -> usize {
        self.counters.panicked.load(Ordering::Relaxed)
    }

    pub fn is_shut_down(&self) -> bool {
        self.sender.lock().is_none()
    }

    /// Block until every submitted task has finished or `timeout` passes
    pub fn await_completion(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        while self.pending() > 0 {
            if Instant::now() >= deadline {
                return false;
            }
            std::thread::sleep(COMPLETION_POLL);
        }
        true
    }

    /// Stop accepting work, let queued tasks drain and join the workers.
    /// Returns false if the queue did not drain within `timeout`; the workers
    /// are then left to finish on their own.
    pub fn shutdown(&self, timeout: Duration) -> bool {
        let Some(sender) = self.sender.lock().take() else {
            return true;
        };
        drop(sender);

        let drained = self.await_completion(timeout);
        let workers: Vec<JoinHandle<()>> = self.workers.lock().drain(..).collect();
        if drained {
            for handle in workers {
                if handle.join().is_err() {
                    error!("{} worker exited abnormally", self.name);
                }
            }
        } else {
            error!(
                "{} did not drain within {:?} ({} task(s) pending)",
                self.name,
                timeout,
                self.pending()
            );
        }
        drained
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.shutdown(Duration::from_secs(5));
    }
}

fn run_worker(name: &str, receiver: Receiver<Task>, counters: Arc<PoolCounters>) {
    while let Ok(task) = receiver.recv() {
        counters.active.fetch_add(1, Ordering::AcqRel);
        if panic::catch_unwind(AssertUnwindSafe(task)).is_err() {
            counters.panicked.fetch_add(1, Ordering::Relaxed);
            error!("Task panicked on {}", name);
        }
        counters.active.fetch_sub(1, Ordering::AcqRel);
        counters.completed.fetch_add(1, Ordering::Relaxed);
        counters.pending.fetch_sub(1, Ordering::AcqRel);
    }
    debug!("{} exiting", name);
}
