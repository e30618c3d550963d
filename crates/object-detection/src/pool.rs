//! Fixed-size checkout pool for inference handles
//!
//! ONNX Runtime sessions need `&mut` access to run, so each concurrent
//! inference must hold its own session. The pool hands out one idle handle per
//! caller and blocks further callers until a handle is returned.

use crossbeam_channel::{bounded, Receiver, Sender};
use std::ops::{Deref, DerefMut};

/// Pool of interchangeable handles, checked out one caller at a time
pub struct ResourcePool<T> {
    idle_tx: Sender<T>,
    idle_rx: Receiver<T>,
    size: usize,
}

impl<T> ResourcePool<T> {
    /// Create a pool owning `handles`
    pub fn new(handles: Vec<T>) -> Self {
        let size = handles.len();
        let (idle_tx, idle_rx) = bounded(size.max(1));
        for handle in handles {
            // Capacity equals the handle count, so this never blocks
            let _ = idle_tx.send(handle);
        }
        Self {
            idle_tx,
            idle_rx,
            size,
        }
    }

    /// Total number of handles owned by the pool
    #[must_use]
    pub fn size(&self) -> usize {
        self.size
    }

    /// Number of handles not currently checked out
    #[must_use]
    pub fn idle(&self) -> usize {
        self.idle_rx.len()
    }

    /// Take a handle, blocking until one is free
    ///
    /// Returns `None` only for an empty pool.
    pub fn checkout(&self) -> Option<PoolLease<'_, T>> {
        if self.size == 0 {
            return None;
        }
        // The pool keeps its own sender alive, so recv only fails if it is empty
        let handle = self.idle_rx.recv().ok()?;
        Some(PoolLease {
            handle: Some(handle),
            pool: self,
        })
    }
}

/// A checked-out handle, returned to the pool on drop
pub struct PoolLease<'a, T> {
    handle: Option<T>,
    pool: &'a ResourcePool<T>,
}

impl<T> Deref for PoolLease<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        self.handle.as_ref().expect("lease holds a handle until dropped")
    }
}

impl<T> DerefMut for PoolLease<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        self.handle.as_mut().expect("lease holds a handle until dropped")
    }
}

impl<T> Drop for PoolLease<'_, T> {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            let _ = self.pool.idle_tx.send(handle);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn test_lease_returns_handle_on_drop() {
        let pool = ResourcePool::new(vec![1, 2]);
        assert_eq!(pool.size(), 2);
        {
            let a = pool.checkout().unwrap();
            let b = pool.checkout().unwrap();
            assert_eq!(*a + *b, 3);
            assert_eq!(pool.idle(), 0);
        }
        assert_eq!(pool.idle(), 2);
    }

    #[test]
    fn test_lease_allows_mutation() {
        let pool = ResourcePool::new(vec![String::from("session")]);
        pool.checkout().unwrap().push_str("-used");
        assert_eq!(*pool.checkout().unwrap(), "session-used");
    }

    #[test]
    fn test_empty_pool_has_no_lease() {
        let pool: ResourcePool<u8> = ResourcePool::new(Vec::new());
        assert!(pool.checkout().is_none());
    }

    #[test]
    fn test_single_handle_serializes_callers() {
        let pool = Arc::new(ResourcePool::new(vec![()]));
        let active = Arc::new(AtomicUsize::new(0));
        let max_active = Arc::new(AtomicUsize::new(0));

        let workers: Vec<_> = (0..4)
            .map(|_| {
                let pool = Arc::clone(&pool);
                let active = Arc::clone(&active);
                let max_active = Arc::clone(&max_active);
                thread::spawn(move || {
                    let _lease = pool.checkout().unwrap();
                    let now = active.fetch_add(1, Ordering::SeqCst) + 1;
                    max_active.fetch_max(now, Ordering::SeqCst);
                    thread::sleep(Duration::from_millis(5));
                    active.fetch_sub(1, Ordering::SeqCst);
                })
            })
            .collect();

        for worker in workers {
            worker.join().unwrap();
        }
        assert_eq!(max_active.load(Ordering::SeqCst), 1);
        assert_eq!(pool.idle(), 1);
    }
}
