// src/pool.rs
use std::collections::VecDeque;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};

use parking_lot::{Condvar, Mutex};
use tracing::{debug, error};

use crate::error::{Result, StatikError};

/// Counting semaphore: `post` adds a permit, `wait` blocks until it can take one.
pub struct Semaphore {
    permits: Mutex<usize>,
    cond: Condvar,
}

impl Semaphore {
    pub fn new(permits: usize) -> Self {
        Self {
            permits: Mutex::new(permits),
            cond: Condvar::new(),
        }
    }

    pub fn wait(&self) {
        let mut permits = self.permits.lock();
        while *permits == 0 {
            self.cond.wait(&mut permits);
        }
        *permits -= 1;
    }

    pub fn post(&self) {
        *self.permits.lock() += 1;
        self.cond.notify_one();
    }
}

struct Shared<T> {
    queue: Mutex<VecDeque<T>>,
    pending: Semaphore,
    max_requests: usize,
    stop: AtomicBool,
}

/// Fixed set of threads draining a bounded FIFO queue.
///
/// Every task is handed to `handler` by value on some worker thread. The
/// pool never retries: a full queue hands the task back to the caller.
/// A panicking handler is contained; the worker logs it and keeps going.
pub struct WorkerPool<T: Send + 'static> {
    shared: Arc<Shared<T>>,
    workers: Vec<JoinHandle<()>>,
}

impl<T: Send + 'static> WorkerPool<T> {
    pub fn new<F>(threads: usize, max_requests: usize, handler: F) -> Result<Self>
    where
        F: Fn(T) + Send + Sync + 'static,
    {
        if threads == 0 || max_requests == 0 {
            return Err(StatikError::Config(
                "worker pool needs at least one thread and one queue slot".into(),
            ));
        }

        let mut pool = Self {
            shared: Arc::new(Shared {
                queue: Mutex::new(VecDeque::with_capacity(max_requests.min(1024))),
                pending: Semaphore::new(0),
                max_requests,
                stop: AtomicBool::new(false),
            }),
            workers: Vec::with_capacity(threads),
        };

        let handler = Arc::new(handler);
        for id in 0..threads {
            let shared = pool.shared.clone();
            let handler = handler.clone();
            let handle = thread::Builder::new()
                .name(format!("statik-worker-{id}"))
                .spawn(move || run(id, &shared, &*handler))
                .map_err(StatikError::PoolSpawn)?;
            pool.workers.push(handle);
        }
        debug!(threads, max_requests, "worker pool started");
        Ok(pool)
    }

    /// Queue `task`. When the queue already holds `max_requests` tasks the
    /// task comes back as `Err` and the caller decides what to do with it.
    pub fn submit(&self, task: T) -> std::result::Result<(), T> {
        let mut queue = self.shared.queue.lock();
        if queue.len() >= self.shared.max_requests {
            return Err(task);
        }
        queue.push_back(task);
        drop(queue);
        self.shared.pending.post();
        Ok(())
    }

    pub fn queued(&self) -> usize {
        self.shared.queue.lock().len()
    }

    pub fn threads(&self) -> usize {
        self.workers.len()
    }

    /// Stop the workers and wait for them. Tasks still queued are dropped.
    pub fn shutdown(mut self) {
        self.stop_and_join();
    }

    fn stop_and_join(&mut self) {
        self.shared.stop.store(true, Ordering::Release);
        for _ in 0..self.workers.len() {
            self.shared.pending.post();
        }
        for handle in self.workers.drain(..) {
            let _ = handle.join();
        }
        self.shared.queue.lock().clear();
    }
}

impl<T: Send + 'static> Drop for WorkerPool<T> {
    fn drop(&mut self) {
        self.stop_and_join();
    }
}

fn run<T, F: Fn(T)>(id: usize, shared: &Shared<T>, handler: &F) {
    loop {
        shared.pending.wait();
        if shared.stop.load(Ordering::Acquire) {
            break;
        }
        let Some(task) = shared.queue.lock().pop_front() else {
            continue;
        };
        if panic::catch_unwind(AssertUnwindSafe(|| handler(task))).is_err() {
            error!(worker = id, "task panicked; worker continues");
        }
    }
    debug!(worker = id, "worker exiting");
}
