//! Bounded object recyclers.
//!
//! Two fixed-shape object kinds get recycled through free lists owned by
//! the context: path buffers (full-pathname and temp-name generation) and
//! the memory driver's lock records. Each pool keeps a handful of cleared
//! objects ready for reuse and drops the overflow; counters record how the
//! pool is doing. The free lists are guarded by the allocator static mutex.

use std::cell::UnsafeCell;
use std::sync::Arc;

use crate::os::mutex::RawMutex;

/// Fewest slots a pool will run with.
const MIN_POOL_SLOTS: usize = 4;

/// Default slot count when the configuration does not say otherwise.
pub const DEFAULT_POOL_SLOTS: usize = 8;

/// An object kind that can pass through a pool.
///
/// `recycle` must clear every piece of embedded owned state so the next
/// taker can observe nothing of the previous owner.
pub trait Recycle: Default {
    fn recycle(&mut self);
}

#[derive(Debug, Default, Clone, Copy)]
struct Counters {
    allocs: u64,
    frees: u64,
    recycled: u64,
    high_water: usize,
}

/// A bounded free list for one object kind.
///
/// The slot vector and counters are plain cells; every access happens
/// between `enter` and `leave` on the pool mutex handed in at construction.
pub struct ObjectPool<T> {
    name: &'static str,
    capacity: usize,
    mutex: Arc<dyn RawMutex>,
    slots: UnsafeCell<Vec<T>>,
    counters: UnsafeCell<Counters>,
}

// SAFETY: slots and counters are only touched under `mutex`.
unsafe impl<T: Send> Send for ObjectPool<T> {}
unsafe impl<T: Send> Sync for ObjectPool<T> {}

impl<T: Recycle> ObjectPool<T> {
    pub fn new(name: &'static str, mutex: Arc<dyn RawMutex>, capacity: usize) -> Self {
        let capacity = capacity.max(MIN_POOL_SLOTS);
        ObjectPool {
            name,
            capacity,
            mutex,
            slots: UnsafeCell::new(Vec::with_capacity(capacity)),
            counters: UnsafeCell::new(Counters::default()),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Take an object, recycled if one is cached, freshly constructed
    /// otherwise. Construction happens outside the mutex.
    pub fn take(&self) -> T {
        self.mutex.enter();
        let recycled = unsafe {
            let slots = &mut *self.slots.get();
            let counters = &mut *self.counters.get();
            counters.allocs += 1;
            let hit = slots.pop();
            if hit.is_some() {
                counters.recycled += 1;
            }
            hit
        };
        self.mutex.leave();

        recycled.unwrap_or_default()
    }

    /// Hand an object back. It is cleared first, cached if a slot is free,
    /// and dropped otherwise. The drop happens outside the mutex.
    pub fn put(&self, mut obj: T) {
        obj.recycle();

        self.mutex.enter();
        let overflow = unsafe {
            let slots = &mut *self.slots.get();
            let counters = &mut *self.counters.get();
            counters.frees += 1;
            if slots.len() < self.capacity {
                slots.push(obj);
                if slots.len() > counters.high_water {
                    counters.high_water = slots.len();
                }
                None
            } else {
                Some(obj)
            }
        };
        self.mutex.leave();

        drop(overflow);
    }

    /// Snapshot of the pool counters.
    pub fn stats(&self) -> PoolStats {
        self.mutex.enter();
        let (counters, cached) = unsafe {
            let slots = &*self.slots.get();
            (*self.counters.get(), slots.len())
        };
        self.mutex.leave();

        PoolStats {
            capacity: self.capacity,
            cached,
            high_water: counters.high_water,
            allocs: counters.allocs,
            frees: counters.frees,
            recycled: counters.recycled,
        }
    }

    /// Drop every cached object (context shutdown).
    pub fn drain(&self) {
        self.mutex.enter();
        let drained = unsafe { std::mem::take(&mut *self.slots.get()) };
        self.mutex.leave();

        drop(drained);
    }
}

/// Statistics about one pool.
#[derive(Debug, Clone, Copy)]
pub struct PoolStats {
    /// Slot bound
    pub capacity: usize,
    /// Objects currently cached
    pub cached: usize,
    /// Most objects ever cached at once
    pub high_water: usize,
    /// Total take calls
    pub allocs: u64,
    /// Total put calls
    pub frees: u64,
    /// Takes served from the cache
    pub recycled: u64,
}

// ============================================================================
// Path Buffers
// ============================================================================

/// A reusable string buffer sized for full pathnames.
#[derive(Debug, Default)]
pub struct PathBuffer {
    buf: String,
}

impl PathBuffer {
    pub fn as_str(&self) -> &str {
        &self.buf
    }

    pub fn buf_mut(&mut self) -> &mut String {
        &mut self.buf
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }
}

impl Recycle for PathBuffer {
    fn recycle(&mut self) {
        // keep the capacity, forget the contents
        self.buf.clear();
    }
}
