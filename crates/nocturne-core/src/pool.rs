// src/pool.rs
use crate::error::{NocturneError, NocturneResult};
use std::collections::VecDeque;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};

pub type Task = Box<dyn FnOnce() + Send + 'static>;

struct Queue {
    tasks: VecDeque<Task>,
    closed: bool,
}

struct Inner {
    queue: Mutex<Queue>,
    available: Condvar,
}

impl Inner {
    fn lock(&self) -> MutexGuard<'_, Queue> {
        // A panicking task never holds the lock, so a poisoned queue is still consistent.
        self.queue.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Fixed set of long-lived threads draining a shared FIFO of closures.
///
/// The queue is unbounded: [`submit`](WorkerPool::submit) never blocks and
/// never rejects while the pool is open.
pub struct WorkerPool {
    inner: Arc<Inner>,
    handles: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    pub fn new(threads: usize) -> NocturneResult<Self> {
        if threads == 0 {
            return Err(NocturneError::Config(
                "worker pool needs at least one thread".into(),
            ));
        }

        let inner = Arc::new(Inner {
            queue: Mutex::new(Queue {
                tasks: VecDeque::new(),
                closed: false,
            }),
            available: Condvar::new(),
        });

        let mut handles = Vec::with_capacity(threads);
        for i in 0..threads {
            let inner = inner.clone();
            let handle = thread::Builder::new()
                .name(format!("nocturne-worker-{}", i))
                .spawn(move || worker_loop(i, inner))?;
            handles.push(handle);
        }

        tracing::debug!(threads, "worker pool started");
        Ok(Self { inner, handles })
    }

    pub fn threads(&self) -> usize {
        self.handles.len()
    }

    /// Tasks waiting for a worker.
    pub fn queued(&self) -> usize {
        self.inner.lock().tasks.len()
    }

    /// Enqueue `task` and wake one idle worker.
    pub fn submit<F>(&self, task: F) -> NocturneResult<()>
    where
        F: FnOnce() + Send + 'static,
    {
        {
            let mut queue = self.inner.lock();
            if queue.closed {
                return Err(NocturneError::PoolClosed);
            }
            queue.tasks.push_back(Box::new(task));
        }
        self.inner.available.notify_one();
        Ok(())
    }

    /// Close the queue, let workers drain what is already queued, and join them.
    pub fn shutdown(&mut self) {
        self.inner.lock().closed = true;
        self.inner.available.notify_all();
        for handle in self.handles.drain(..) {
            if handle.join().is_err() {
                tracing::error!("worker thread exited abnormally");
            }
        }
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn worker_loop(id: usize, inner: Arc<Inner>) {
    let mut queue = inner.lock();
    loop {
        if let Some(task) = queue.tasks.pop_front() {
            drop(queue);
            if panic::catch_unwind(AssertUnwindSafe(task)).is_err() {
                tracing::error!(worker = id, "task panicked");
            }
            queue = inner.lock();
        } else if queue.closed {
            break;
        } else {
            queue = inner
                .available
                .wait(queue)
                .unwrap_or_else(|e| e.into_inner());
        }
    }
    tracing::trace!(worker = id, "worker exiting");
}
