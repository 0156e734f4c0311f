//! Mutex subsystem: one trait, three backends.
//!
//! Mutexes are addressed by [`MutexId`]: `Dynamic` allocations construct a
//! fresh instance, `Static` allocations resolve to one of a fixed set of
//! process-lifetime singletons held by the context. The backend in effect
//! (no-op, checked, native) is chosen once at context initialization.

use std::sync::{Arc, Condvar, Mutex, PoisonError};
use std::thread::ThreadId;

use crate::error::{Error, ErrorCode, Result};

/// Behavior of a dynamically allocated mutex.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MutexKind {
    /// Non-reentrant; re-entry by the owner is a caller bug
    Fast,
    /// Reentrant; each enter needs a matching leave
    Recursive,
}

/// The fixed static mutex singletons, addressed by purpose.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StaticMutex {
    /// Guards the VFS registry and other top-level bookkeeping
    Master = 0,
    /// Guards the allocation pool free lists
    Alloc = 1,
    /// Guards open-file bookkeeping
    Open = 2,
    /// Guards the engine PRNG state
    Prng = 3,
    /// Guards the page-cache LRU (collaborator layer)
    Lru = 4,
    /// Guards page-memory bookkeeping (collaborator layer)
    PageCache = 5,
}

/// Number of static singletons.
pub const STATIC_MUTEX_COUNT: usize = 6;

impl StaticMutex {
    pub const ALL: [StaticMutex; STATIC_MUTEX_COUNT] = [
        StaticMutex::Master,
        StaticMutex::Alloc,
        StaticMutex::Open,
        StaticMutex::Prng,
        StaticMutex::Lru,
        StaticMutex::PageCache,
    ];

    fn index(self) -> usize {
        self as usize
    }
}

/// Identity requested from the mutex factory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MutexId {
    Dynamic(MutexKind),
    Static(StaticMutex),
}

/// Which backend implementation the context installs at initialization.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MutexBackendKind {
    /// Zero-overhead stubs for single-threaded use
    Noop,
    /// Discipline-checking backend; panics on misuse instead of blocking
    Checked,
    /// Blocking OS-backed mutexes
    Native,
}

// ============================================================================
// Mutex Trait
// ============================================================================

/// The operations every backend provides.
///
/// `held`/`not_held` answer for the *calling* thread and exist for debug
/// assertions; the no-op backend answers `true` to both so assertions in
/// either direction pass.
pub trait RawMutex: Send + Sync {
    fn kind(&self) -> MutexKind;

    /// Block until the mutex is acquired
    fn enter(&self);

    /// Non-blocking acquisition attempt; `Busy` if held by another owner
    fn try_enter(&self) -> Result<()>;

    /// Release one level of ownership
    fn leave(&self);

    fn held(&self) -> bool;

    fn not_held(&self) -> bool;
}

/// Continue through lock poisoning.
pub(crate) fn recover<T>(result: std::result::Result<T, PoisonError<T>>) -> T {
    result.unwrap_or_else(PoisonError::into_inner)
}

// ============================================================================
// No-op Backend
// ============================================================================

/// Backend used when core-mutex mode is off: every call succeeds.
pub struct NoopMutex {
    kind: MutexKind,
}

impl NoopMutex {
    pub fn new(kind: MutexKind) -> Self {
        NoopMutex { kind }
    }
}

impl RawMutex for NoopMutex {
    fn kind(&self) -> MutexKind {
        self.kind
    }

    fn enter(&self) {}

    fn try_enter(&self) -> Result<()> {
        Ok(())
    }

    fn leave(&self) {}

    fn held(&self) -> bool {
        true
    }

    fn not_held(&self) -> bool {
        true
    }
}

// ============================================================================
// Checked Backend
// ============================================================================

#[derive(Debug)]
struct CheckState {
    owner: Option<ThreadId>,
    count: u32,
}

/// Discipline-checking backend for debugging single-threaded use.
///
/// Never blocks: a contended `enter`, a fast-mutex re-entry, or an
/// unmatched `leave` is a caller bug and panics on the spot.
pub struct CheckedMutex {
    kind: MutexKind,
    state: Mutex<CheckState>,
}

impl CheckedMutex {
    pub fn new(kind: MutexKind) -> Self {
        CheckedMutex {
            kind,
            state: Mutex::new(CheckState {
                owner: None,
                count: 0,
            }),
        }
    }
}

impl RawMutex for CheckedMutex {
    fn kind(&self) -> MutexKind {
        self.kind
    }

    fn enter(&self) {
        let tid = std::thread::current().id();
        let mut guard = recover(self.state.lock());
        match guard.owner {
            None => {
                guard.owner = Some(tid);
                guard.count = 1;
            }
            Some(owner) if owner == tid => {
                assert!(
                    self.kind == MutexKind::Recursive,
                    "re-entered a fast mutex"
                );
                guard.count += 1;
            }
            Some(_) => panic!("contended enter on a checked mutex"),
        }
    }

    fn try_enter(&self) -> Result<()> {
        let tid = std::thread::current().id();
        let mut guard = recover(self.state.lock());
        match guard.owner {
            None => {
                guard.owner = Some(tid);
                guard.count = 1;
                Ok(())
            }
            Some(owner) if owner == tid && self.kind == MutexKind::Recursive => {
                guard.count += 1;
                Ok(())
            }
            _ => Err(Error::new(ErrorCode::Busy)),
        }
    }

    fn leave(&self) {
        let tid = std::thread::current().id();
        let mut guard = recover(self.state.lock());
        assert!(
            guard.owner == Some(tid) && guard.count > 0,
            "leave without a matching enter"
        );
        guard.count -= 1;
        if guard.count == 0 {
            guard.owner = None;
        }
    }

    fn held(&self) -> bool {
        let guard = recover(self.state.lock());
        guard.count > 0 && guard.owner == Some(std::thread::current().id())
    }

    fn not_held(&self) -> bool {
        !self.held()
    }
}

impl Drop for CheckedMutex {
    fn drop(&mut self) {
        let guard = recover(self.state.lock());
        debug_assert!(guard.count == 0, "mutex dropped while held");
    }
}

// ============================================================================
// Native Backend
// ============================================================================

#[derive(Debug)]
struct NativeState {
    owner: Option<ThreadId>,
    count: u32,
}

/// Blocking backend over the platform mutex and condition variable.
pub struct NativeMutex {
    kind: MutexKind,
    state: Mutex<NativeState>,
    condvar: Condvar,
}

impl NativeMutex {
    pub fn new(kind: MutexKind) -> Self {
        NativeMutex {
            kind,
            state: Mutex::new(NativeState {
                owner: None,
                count: 0,
            }),
            condvar: Condvar::new(),
        }
    }
}

impl RawMutex for NativeMutex {
    fn kind(&self) -> MutexKind {
        self.kind
    }

    fn enter(&self) {
        let tid = std::thread::current().id();
        let mut guard = recover(self.state.lock());
        loop {
            match guard.owner {
                None => {
                    guard.owner = Some(tid);
                    guard.count = 1;
                    return;
                }
                Some(owner) if owner == tid && self.kind == MutexKind::Recursive => {
                    guard.count += 1;
                    return;
                }
                _ => {
                    guard = recover(self.condvar.wait(guard));
                }
            }
        }
    }

    fn try_enter(&self) -> Result<()> {
        let tid = std::thread::current().id();
        let mut guard = recover(self.state.lock());
        match guard.owner {
            None => {
                guard.owner = Some(tid);
                guard.count = 1;
                Ok(())
            }
            Some(owner) if owner == tid && self.kind == MutexKind::Recursive => {
                guard.count += 1;
                Ok(())
            }
            _ => Err(Error::new(ErrorCode::Busy)),
        }
    }

    fn leave(&self) {
        let tid = std::thread::current().id();
        let mut guard = recover(self.state.lock());
        debug_assert!(guard.owner == Some(tid), "leave without a matching enter");
        if guard.owner == Some(tid) {
            guard.count = guard.count.saturating_sub(1);
            if guard.count == 0 {
                guard.owner = None;
                self.condvar.notify_one();
            }
        }
    }

    fn held(&self) -> bool {
        let guard = recover(self.state.lock());
        guard.count > 0 && guard.owner == Some(std::thread::current().id())
    }

    fn not_held(&self) -> bool {
        !self.held()
    }
}

// ============================================================================
// Construction
// ============================================================================

/// Construct a mutex of the given kind on the given backend.
pub fn new_raw_mutex(backend: MutexBackendKind, kind: MutexKind) -> Arc<dyn RawMutex> {
    match backend {
        MutexBackendKind::Noop => Arc::new(NoopMutex::new(kind)),
        MutexBackendKind::Checked => Arc::new(CheckedMutex::new(kind)),
        MutexBackendKind::Native => Arc::new(NativeMutex::new(kind)),
    }
}

/// The fixed table of static singletons, built once per context.
pub struct StaticMutexTable {
    slots: [Arc<dyn RawMutex>; STATIC_MUTEX_COUNT],
    backend: MutexBackendKind,
}

impl StaticMutexTable {
    pub fn new(backend: MutexBackendKind) -> Self {
        StaticMutexTable {
            slots: std::array::from_fn(|_| new_raw_mutex(backend, MutexKind::Fast)),
            backend,
        }
    }

    pub fn backend(&self) -> MutexBackendKind {
        self.backend
    }

    /// The singleton for a purpose. Same purpose, same instance, always.
    pub fn get(&self, which: StaticMutex) -> Arc<dyn RawMutex> {
        self.slots[which.index()].clone()
    }

    /// Resolve a [`MutexId`]: fresh instance or singleton.
    pub fn alloc(&self, id: MutexId) -> Arc<dyn RawMutex> {
        match id {
            MutexId::Dynamic(kind) => new_raw_mutex(self.backend, kind),
            MutexId::Static(which) => self.get(which),
        }
    }
}
