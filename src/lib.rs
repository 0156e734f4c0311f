//! Plinth - the platform seam of an embedded storage engine
//!
//! Everything above this crate is portable; everything below it is a
//! driver. A [`Vfs`] driver supplies file handles, pathname services,
//! entropy and a clock. The [`Env`] context owns the driver registry, the
//! mutex subsystem and the allocation pools, and dispatches engine calls to
//! whichever driver a database was opened with. All drivers speak one
//! byte-range locking protocol, so the engine reasons about lock state the
//! same way on every platform.

pub mod env;
pub mod error;
pub mod mem;
pub mod os;
pub mod random;

// Re-export main public types
pub use error::{Error, ErrorCode, Result};

pub use env::{global, Env, EnvConfig, ThreadingMode};

pub use os::dispatch::{BusyHandler, FaultInjector, TEMP_FILE_PREFIX};
pub use os::lockproto::{
    RangeKind, RangeLock, PENDING_BYTE, RESERVED_BYTE, SHARED_FIRST, SHARED_SIZE,
};
pub use os::memory::MemVfs;
pub use os::mutex::{MutexBackendKind, MutexId, MutexKind, RawMutex, StaticMutex};
pub use os::vfs::{
    AccessFlags, DeviceCharacteristics, FileControlOp, LockLevel, OpenFlags, SyncFlags, Vfs,
    VfsFile,
};

pub use mem::pool::PoolStats;
