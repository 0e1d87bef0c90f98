// src/pool.rs
//! Fixed-size pool of reusable handles.
//!
//! Every handle is created up front. [`HandlePool::acquire`] waits at most the
//! given timeout for one to come back; the returned guard puts it back when
//! dropped, so a handle can never leak out of the pool.

use std::ops::{Deref, DerefMut};
use std::sync::{Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant};

pub struct HandlePool<T> {
    idle: Mutex<Vec<T>>,
    returned: Condvar,
    size: usize,
}

impl<T> HandlePool<T> {
    /// Build a pool from already-created handles.
    pub fn new(handles: Vec<T>) -> Self {
        let size = handles.len();
        Self {
            idle: Mutex::new(handles),
            returned: Condvar::new(),
            size,
        }
    }

    /// Build a pool of `size` handles produced by `make`.
    pub fn try_with<E>(size: usize, mut make: impl FnMut() -> Result<T, E>) -> Result<Self, E> {
        let handles = (0..size).map(|_| make()).collect::<Result<Vec<_>, _>>()?;
        Ok(Self::new(handles))
    }

    /// Total number of handles owned by the pool.
    pub fn size(&self) -> usize {
        self.size
    }

    /// Handles not currently checked out.
    pub fn available(&self) -> usize {
        self.lock().len()
    }

    /// Take a handle without waiting.
    pub fn try_acquire(&self) -> Option<PooledHandle<'_, T>> {
        let handle = self.lock().pop()?;
        Some(PooledHandle {
            pool: self,
            handle: Some(handle),
        })
    }

    /// Take a handle, waiting up to `timeout` for one to be returned.
    pub fn acquire(&self, timeout: Duration) -> Option<PooledHandle<'_, T>> {
        let deadline = Instant::now() + timeout;
        let mut idle = self.lock();
        loop {
            if let Some(handle) = idle.pop() {
                return Some(PooledHandle {
                    pool: self,
                    handle: Some(handle),
                });
            }
            let now = Instant::now();
            if now >= deadline {
                return None;
            }
            idle = match self.returned.wait_timeout(idle, deadline - now) {
                Ok((guard, _)) => guard,
                Err(poisoned) => poisoned.into_inner().0,
            };
        }
    }

    fn lock(&self) -> MutexGuard<'_, Vec<T>> {
        // The vector is only pushed to and popped from; a panicking holder
        // cannot leave it half-updated.
        self.idle.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn release(&self, handle: T) {
        self.lock().push(handle);
        self.returned.notify_one();
    }
}

/// A checked-out handle. Returned to its pool on drop.
pub struct PooledHandle<'a, T> {
    pool: &'a HandlePool<T>,
    handle: Option<T>,
}

impl<T> Deref for PooledHandle<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        // Only taken in `drop`.
        match &self.handle {
            Some(h) => h,
            None => unreachable!("pooled handle used after release"),
        }
    }
}

impl<T> DerefMut for PooledHandle<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        match &mut self.handle {
            Some(h) => h,
            None => unreachable!("pooled handle used after release"),
        }
    }
}

impl<T> Drop for PooledHandle<'_, T> {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            self.pool.release(handle);
        }
    }
}
