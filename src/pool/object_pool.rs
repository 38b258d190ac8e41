//! Generic pool of I/O completion state objects.
//!
//! The pool is parameterised by four hooks supplied at construction:
//!
//! - `create`: build a fresh instance when the free list is empty
//! - `reset`: scrub a returned instance before it is stored
//! - `can_reuse`: decide whether a returned instance is storable at all
//! - `destroy`: final teardown for instances that are not kept
//!
//! Return lifecycle: `if !can_reuse { destroy; drop } else { reset; store }`.
//! Idle retention is loosely bounded to twice the peak number of
//! simultaneously rented objects (never below the preallocation count), so
//! the pool shrinks back after load spikes.

use parking_lot::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// The four lifecycle hooks of an [`ObjectPool`].
pub struct PoolHooks<T> {
    create: Box<dyn Fn() -> T + Send + Sync>,
    reset: Box<dyn Fn(&mut T) + Send + Sync>,
    can_reuse: Box<dyn Fn(&mut T) -> bool + Send + Sync>,
    destroy: Box<dyn Fn(T) + Send + Sync>,
}

impl<T> PoolHooks<T> {
    /// Bundle the four hooks.
    pub fn new(
        create: impl Fn() -> T + Send + Sync + 'static,
        reset: impl Fn(&mut T) + Send + Sync + 'static,
        can_reuse: impl Fn(&mut T) -> bool + Send + Sync + 'static,
        destroy: impl Fn(T) + Send + Sync + 'static,
    ) -> Self {
        Self {
            create: Box::new(create),
            reset: Box::new(reset),
            can_reuse: Box::new(can_reuse),
            destroy: Box::new(destroy),
        }
    }
}

/// Concurrent pool of reusable objects.
///
/// Cheaply cloneable; all clones share the same free list.
pub struct ObjectPool<T> {
    inner: Arc<PoolState<T>>,
}

impl<T> Clone for ObjectPool<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

struct PoolState<T> {
    idle: Mutex<Vec<T>>,
    hooks: PoolHooks<T>,
    preallocated: usize,
    /// Objects currently rented out.
    outstanding: AtomicUsize,
    /// High-water mark of `outstanding`.
    peak: AtomicUsize,
}

impl<T: Send + 'static> ObjectPool<T> {
    /// Create a pool, warming it with `preallocate` instances.
    pub fn new(hooks: PoolHooks<T>, preallocate: usize) -> Self {
        let idle = (0..preallocate).map(|_| (hooks.create)()).collect();

        Self {
            inner: Arc::new(PoolState {
                idle: Mutex::new(idle),
                hooks,
                preallocated: preallocate,
                outstanding: AtomicUsize::new(0),
                peak: AtomicUsize::new(0),
            }),
        }
    }

    /// Rent an instance, reusing an idle one when available.
    pub fn rent(&self) -> T {
        let outstanding = self.inner.outstanding.fetch_add(1, Ordering::AcqRel) + 1;
        self.inner.peak.fetch_max(outstanding, Ordering::AcqRel);

        match self.inner.idle.lock().pop() {
            Some(obj) => obj,
            None => (self.inner.hooks.create)(),
        }
    }

    /// Return a rented instance.
    pub fn give_back(&self, mut obj: T) {
        self.inner.outstanding.fetch_sub(1, Ordering::AcqRel);

        if !(self.inner.hooks.can_reuse)(&mut obj) {
            (self.inner.hooks.destroy)(obj);
            return;
        }

        (self.inner.hooks.reset)(&mut obj);

        let cap = self.retention_cap();
        let surplus = {
            let mut idle = self.inner.idle.lock();
            if idle.len() < cap {
                idle.push(obj);
                None
            } else {
                Some(obj)
            }
        };
        if let Some(obj) = surplus {
            (self.inner.hooks.destroy)(obj);
        }
    }

    /// Destroy every idle instance. Later rents still work; they just
    /// start from fresh creates.
    pub fn dispose(&self) {
        let drained: Vec<T> = std::mem::take(&mut *self.inner.idle.lock());
        for obj in drained {
            (self.inner.hooks.destroy)(obj);
        }
    }

    /// Number of idle instances currently stored.
    pub fn idle_count(&self) -> usize {
        self.inner.idle.lock().len()
    }

    /// Number of instances currently rented out.
    pub fn outstanding_count(&self) -> usize {
        self.inner.outstanding.load(Ordering::Acquire)
    }

    fn retention_cap(&self) -> usize {
        let peak = self.inner.peak.load(Ordering::Acquire);
        (peak * 2).max(self.inner.preallocated).max(1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn counting_hooks(
        created: Arc<AtomicUsize>,
        destroyed: Arc<AtomicUsize>,
    ) -> PoolHooks<Vec<u8>> {
        PoolHooks::new(
            move || {
                created.fetch_add(1, Ordering::SeqCst);
                Vec::new()
            },
            |v: &mut Vec<u8>| v.clear(),
            |_: &mut Vec<u8>| true,
            move |_| {
                destroyed.fetch_add(1, Ordering::SeqCst);
            },
        )
    }

    #[test]
    fn test_preallocation() {
        let created = Arc::new(AtomicUsize::new(0));
        let destroyed = Arc::new(AtomicUsize::new(0));
        let pool = ObjectPool::new(counting_hooks(created.clone(), destroyed), 4);

        assert_eq!(created.load(Ordering::SeqCst), 4);
        assert_eq!(pool.idle_count(), 4);
    }

    #[test]
    fn test_rent_reuses_idle_instances() {
        let created = Arc::new(AtomicUsize::new(0));
        let destroyed = Arc::new(AtomicUsize::new(0));
        let pool = ObjectPool::new(counting_hooks(created.clone(), destroyed), 2);

        let a = pool.rent();
        let b = pool.rent();
        assert_eq!(created.load(Ordering::SeqCst), 2);
        assert_eq!(pool.outstanding_count(), 2);

        pool.give_back(a);
        pool.give_back(b);
        let _c = pool.rent();
        // No fresh create for the third rent.
        assert_eq!(created.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_reset_runs_on_return() {
        let pool = ObjectPool::new(
            PoolHooks::new(
                Vec::<u8>::new,
                |v: &mut Vec<u8>| v.clear(),
                |_: &mut Vec<u8>| true,
                drop,
            ),
            0,
        );

        let mut obj = pool.rent();
        obj.extend_from_slice(b"dirty");
        pool.give_back(obj);

        let obj = pool.rent();
        assert!(obj.is_empty(), "reset hook must scrub returned objects");
    }

    #[test]
    fn test_unreusable_objects_are_destroyed() {
        let destroyed = Arc::new(AtomicUsize::new(0));
        let destroyed2 = destroyed.clone();
        let pool = ObjectPool::new(
            PoolHooks::new(
                Vec::<u8>::new,
                |v: &mut Vec<u8>| v.clear(),
                // Reject anything that grew past 16 bytes of capacity.
                |v: &mut Vec<u8>| v.capacity() <= 16,
                move |_| {
                    destroyed2.fetch_add(1, Ordering::SeqCst);
                },
            ),
            0,
        );

        let mut obj = pool.rent();
        obj.reserve(1024);
        pool.give_back(obj);

        assert_eq!(destroyed.load(Ordering::SeqCst), 1);
        assert_eq!(pool.idle_count(), 0);
    }

    #[test]
    fn test_dispose_destroys_idle_set() {
        let created = Arc::new(AtomicUsize::new(0));
        let destroyed = Arc::new(AtomicUsize::new(0));
        let pool = ObjectPool::new(counting_hooks(created, destroyed.clone()), 3);

        pool.dispose();
        assert_eq!(destroyed.load(Ordering::SeqCst), 3);
        assert_eq!(pool.idle_count(), 0);

        // Pool still usable after dispose.
        let obj = pool.rent();
        pool.give_back(obj);
        assert_eq!(pool.idle_count(), 1);
    }

    #[test]
    fn test_retention_bounded_by_peak() {
        let destroyed = Arc::new(AtomicUsize::new(0));
        let destroyed2 = destroyed.clone();
        let pool = ObjectPool::new(
            PoolHooks::new(
                Vec::<u8>::new,
                |v: &mut Vec<u8>| v.clear(),
                |_: &mut Vec<u8>| true,
                move |_| {
                    destroyed2.fetch_add(1, Ordering::SeqCst);
                },
            ),
            0,
        );

        // Peak of 2 simultaneously rented.
        let a = pool.rent();
        let b = pool.rent();
        pool.give_back(a);
        pool.give_back(b);

        // Sequential churn cannot push idle storage past 2x peak.
        for _ in 0..16 {
            let obj = pool.rent();
            pool.give_back(obj);
        }
        assert!(pool.idle_count() <= 4);
    }

    #[test]
    fn test_round_trip_is_idempotent() {
        let pool = ObjectPool::new(
            PoolHooks::new(
                || vec![0u8; 8],
                |v: &mut Vec<u8>| v.iter_mut().for_each(|b| *b = 0),
                |_: &mut Vec<u8>| true,
                drop,
            ),
            1,
        );

        let first = pool.rent();
        let snapshot = first.clone();
        pool.give_back(first);

        for _ in 0..10 {
            let obj = pool.rent();
            pool.give_back(obj);
        }

        let last = pool.rent();
        assert_eq!(last, snapshot);
    }

    #[test]
    fn test_concurrent_rent_give_back() {
        let pool = ObjectPool::new(
            PoolHooks::new(
                Vec::<u8>::new,
                |v: &mut Vec<u8>| v.clear(),
                |_: &mut Vec<u8>| true,
                drop,
            ),
            8,
        );

        let mut handles = Vec::new();
        for _ in 0..8 {
            let pool = pool.clone();
            handles.push(std::thread::spawn(move || {
                for _ in 0..1000 {
                    let mut obj = pool.rent();
                    obj.push(1);
                    pool.give_back(obj);
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }

        assert_eq!(pool.outstanding_count(), 0);
    }
}
