//! Process-wide engine context.
//!
//! An [`Env`] owns everything that used to be process-global state: the
//! static mutex table, the driver registry, the allocation pools and the
//! shared random generator. `initialize` and `shutdown` bracket all use;
//! tests build a fresh context per test instead of sharing the process
//! global, which stays available through [`global`] for embedders that want
//! the classic one-per-process shape.

use std::cell::UnsafeCell;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};

use lazy_static::lazy_static;

use crate::error::{Error, ErrorCode, Result};
use crate::mem::pool::{ObjectPool, PathBuffer, PoolStats, DEFAULT_POOL_SLOTS};
use crate::os::dispatch::FaultInjector;
use crate::os::memory::LockRecord;
use crate::os::mutex::{
    recover, MutexBackendKind, MutexId, RawMutex, StaticMutex, StaticMutexTable,
};
use crate::os::registry::VfsRegistry;
use crate::os::vfs::Vfs;
use crate::random::SharedPrng;

// ============================================================================
// Configuration
// ============================================================================

/// Threading discipline for a context.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ThreadingMode {
    /// Single-threaded use; every mutex is a no-op.
    SingleThread,
    /// Concurrent use; mutexes are real OS primitives.
    #[default]
    MultiThread,
}

/// Settings applied at `initialize`. Changing them afterwards is misuse.
#[derive(Debug, Clone, Copy)]
pub struct EnvConfig {
    pub threading: ThreadingMode,
    /// Explicit mutex backend, overriding what `threading` implies.
    pub mutex_backend: Option<MutexBackendKind>,
    /// Cached slots in the pathname buffer pool.
    pub path_pool_slots: usize,
    /// Cached slots in the lock-record pool.
    pub record_pool_slots: usize,
}

impl Default for EnvConfig {
    fn default() -> Self {
        EnvConfig {
            threading: ThreadingMode::default(),
            mutex_backend: None,
            path_pool_slots: DEFAULT_POOL_SLOTS,
            record_pool_slots: DEFAULT_POOL_SLOTS,
        }
    }
}

impl EnvConfig {
    fn effective_backend(&self) -> MutexBackendKind {
        match self.mutex_backend {
            Some(backend) => backend,
            None => match self.threading {
                ThreadingMode::SingleThread => MutexBackendKind::Noop,
                ThreadingMode::MultiThread => MutexBackendKind::Native,
            },
        }
    }
}

// ============================================================================
// Inner state
// ============================================================================

/// State that exists only between `initialize` and `shutdown`.
pub(crate) struct EnvInner {
    pub(crate) statics: StaticMutexTable,
    registry: UnsafeCell<VfsRegistry>,
    pub(crate) path_pool: Arc<ObjectPool<PathBuffer>>,
    pub(crate) record_pool: Arc<ObjectPool<LockRecord>>,
    pub(crate) prng: SharedPrng,
}

// SAFETY: `registry` is only touched inside `with_registry`, which holds the
// master static mutex for the whole access.
unsafe impl Send for EnvInner {}
unsafe impl Sync for EnvInner {}

impl EnvInner {
    pub(crate) fn with_registry<T>(&self, f: impl FnOnce(&mut VfsRegistry) -> T) -> T {
        let master = self.statics.get(StaticMutex::Master);
        master.enter();
        // SAFETY: all registry access funnels through this mutex.
        let out = f(unsafe { &mut *self.registry.get() });
        master.leave();
        out
    }
}

// ============================================================================
// Env
// ============================================================================

/// The engine context. See the module docs for the lifecycle.
pub struct Env {
    /// Settings consumed by `initialize`.
    config: StdMutex<EnvConfig>,
    /// Bootstrap guard for `initialize`/`shutdown`. A plain OS primitive on
    /// purpose: the engine's own mutexes do not exist yet while it is held.
    boot: StdMutex<()>,
    ready: AtomicBool,
    inner: StdMutex<Option<Arc<EnvInner>>>,
    fault: FaultInjector,
}

impl Default for Env {
    fn default() -> Self {
        Self::new()
    }
}

impl Env {
    pub fn new() -> Env {
        Env {
            config: StdMutex::new(EnvConfig::default()),
            boot: StdMutex::new(()),
            ready: AtomicBool::new(false),
            inner: StdMutex::new(None),
            fault: FaultInjector::new(),
        }
    }

    /// Adjust settings before the first `initialize`. Once the context is
    /// live the configuration is frozen and this reports misuse.
    pub fn configure(&self, f: impl FnOnce(&mut EnvConfig)) -> Result<()> {
        let _boot = recover(self.boot.lock());
        if self.ready.load(Ordering::Acquire) {
            return Err(Error::with_message(
                ErrorCode::Misuse,
                "configure after initialize",
            ));
        }
        f(&mut *recover(self.config.lock()));
        Ok(())
    }

    pub fn config(&self) -> EnvConfig {
        *recover(self.config.lock())
    }

    pub fn is_initialized(&self) -> bool {
        self.ready.load(Ordering::Acquire)
    }

    /// Bring the context up: static mutexes, pools, the random generator,
    /// then the built-in drivers. Safe to call any number of times.
    pub fn initialize(&self) -> Result<()> {
        let _boot = recover(self.boot.lock());
        if self.ready.load(Ordering::Acquire) {
            return Ok(());
        }

        let config = *recover(self.config.lock());
        let statics = StaticMutexTable::new(config.effective_backend());

        // pool bookkeeping shares the allocator static mutex
        let alloc_mutex = statics.get(StaticMutex::Alloc);
        let path_pool = Arc::new(ObjectPool::new(
            "path",
            Arc::clone(&alloc_mutex),
            config.path_pool_slots,
        ));
        let record_pool = Arc::new(ObjectPool::new(
            "lock-record",
            alloc_mutex,
            config.record_pool_slots,
        ));
        let prng = SharedPrng::new(statics.get(StaticMutex::Prng));

        let inner = Arc::new(EnvInner {
            statics,
            registry: UnsafeCell::new(VfsRegistry::new()),
            path_pool,
            record_pool,
            prng,
        });

        crate::os::register_builtin_drivers(&inner)?;

        // seed the generator from driver entropy
        if let Some(vfs) = inner.with_registry(|r| r.default_vfs()) {
            let mut key = [0u8; 256];
            vfs.randomness(&mut key);
            inner.prng.seed(&key);
        }

        *recover(self.inner.lock()) = Some(inner);
        self.ready.store(true, Ordering::Release);
        log::debug!(
            "context initialized ({:?} threading, {:?} mutexes)",
            config.threading,
            config.effective_backend()
        );
        Ok(())
    }

    /// Tear the context down. Live file handles keep their pools alive until
    /// closed; everything else is released here. Safe to call any number of
    /// times, and `initialize` may be called again afterwards.
    pub fn shutdown(&self) {
        let _boot = recover(self.boot.lock());
        self.ready.store(false, Ordering::Release);
        if recover(self.inner.lock()).take().is_some() {
            log::debug!("context shut down");
        }
    }

    fn ensure_init(&self) -> Result<Arc<EnvInner>> {
        if !self.ready.load(Ordering::Acquire) {
            self.initialize()?;
        }
        recover(self.inner.lock())
            .as_ref()
            .cloned()
            .ok_or_else(|| Error::with_message(ErrorCode::Misuse, "context is shut down"))
    }

    // ------------------------------------------------------------------------
    // Mutexes
    // ------------------------------------------------------------------------

    /// Allocate a mutex: dynamic ids yield a fresh instance, static ids one
    /// of the fixed singletons.
    pub fn mutex_alloc(&self, id: MutexId) -> Result<Arc<dyn RawMutex>> {
        let inner = self.ensure_init()?;
        Ok(inner.statics.alloc(id))
    }

    // ------------------------------------------------------------------------
    // Driver registry
    // ------------------------------------------------------------------------

    pub fn register_vfs(&self, vfs: Arc<dyn Vfs>, make_default: bool) -> Result<()> {
        let inner = self.ensure_init()?;
        log::debug!("registering vfs {} (default={})", vfs.name(), make_default);
        inner.with_registry(|r| r.register(vfs, make_default));
        Ok(())
    }

    pub fn unregister_vfs(&self, vfs: &Arc<dyn Vfs>) -> Result<()> {
        let inner = self.ensure_init()?;
        inner.with_registry(|r| r.unregister(vfs));
        Ok(())
    }

    /// Look up a driver by name, or the default for `None`/`""`. Brings the
    /// context up on first use; a context that cannot come up has no drivers,
    /// so that reports not-found.
    pub fn find_vfs(&self, name: Option<&str>) -> Result<Arc<dyn Vfs>> {
        let inner = match self.ensure_init() {
            Ok(inner) => inner,
            Err(_) => {
                return Err(Error::with_message(
                    ErrorCode::NotFound,
                    "no driver available",
                ))
            }
        };
        inner.with_registry(|r| r.find(name))
    }

    /// Registered driver names, default first.
    pub fn vfs_names(&self) -> Result<Vec<String>> {
        let inner = self.ensure_init()?;
        Ok(inner.with_registry(|r| r.names()))
    }

    // ------------------------------------------------------------------------
    // Randomness
    // ------------------------------------------------------------------------

    /// Fill `buf` from the shared generator. An empty `buf` instead resets
    /// the generator so the next draw reseeds itself.
    pub fn randomness(&self, buf: &mut [u8]) -> Result<()> {
        let inner = self.ensure_init()?;
        if buf.is_empty() {
            inner.prng.reset();
        } else {
            inner.prng.fill(buf);
        }
        Ok(())
    }

    // ------------------------------------------------------------------------
    // Pools and fault plumbing
    // ------------------------------------------------------------------------

    pub(crate) fn path_pool(&self) -> Result<Arc<ObjectPool<PathBuffer>>> {
        Ok(Arc::clone(&self.ensure_init()?.path_pool))
    }

    pub(crate) fn record_pool(&self) -> Result<Arc<ObjectPool<LockRecord>>> {
        Ok(Arc::clone(&self.ensure_init()?.record_pool))
    }

    pub fn path_pool_stats(&self) -> Result<PoolStats> {
        Ok(self.ensure_init()?.path_pool.stats())
    }

    pub fn record_pool_stats(&self) -> Result<PoolStats> {
        Ok(self.ensure_init()?.record_pool.stats())
    }

    pub fn fault_injector(&self) -> &FaultInjector {
        &self.fault
    }
}

lazy_static! {
    static ref GLOBAL_ENV: Env = Env::new();
}

/// The classic one-per-process context.
pub fn global() -> &'static Env {
    &GLOBAL_ENV
}

// ============================================================================
// Tests
// ============================================================================
