//! Dispatch layer.
//!
//! Thin wrappers over the driver traits, carrying the two jobs that do not
//! belong to any driver: masking caller flags that must never reach the OS
//! layer, and deterministic fault injection at fixed call sites so tests can
//! simulate allocation failure on demand. Pathname resolution draws its
//! scratch buffers from the context's pool, and the busy-handler loop for
//! contended locks lives here too.

use std::ops::Deref;
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicU32, Ordering};
use std::sync::Arc;

use crate::env::Env;
use crate::error::{Error, ErrorCode, Result};
use crate::mem::pool::{ObjectPool, PathBuffer};
use crate::os::vfs::{
    AccessFlags, DeviceCharacteristics, FileControlOp, LockLevel, OpenFlags, SyncFlags, Vfs,
    VfsFile,
};

/// Open flags that may be passed down into a driver. The rest are
/// engine-internal and are stripped before the driver sees them.
const OPEN_FLAG_MASK: u32 = 0x87f3f;

/// Prefix shared by every generated temporary file name.
pub const TEMP_FILE_PREFIX: &str = "etilqs_";

// ============================================================================
// Fault injection
// ============================================================================

/// Deterministic allocation-failure injector.
///
/// Armed with a countdown, it lets that many guarded calls through and then
/// makes the next one fail with `NoMem`, once or repeatedly. A benign window
/// suspends injection for operations whose failure the caller would ignore
/// anyway.
pub struct FaultInjector {
    enabled: AtomicBool,
    countdown: AtomicI32,
    repeat: AtomicBool,
    hits: AtomicU32,
    benign_depth: AtomicI32,
}

impl FaultInjector {
    pub(crate) fn new() -> FaultInjector {
        FaultInjector {
            enabled: AtomicBool::new(false),
            countdown: AtomicI32::new(0),
            repeat: AtomicBool::new(false),
            hits: AtomicU32::new(0),
            benign_depth: AtomicI32::new(0),
        }
    }

    /// Arm the injector: the next `countdown` guarded calls succeed, then
    /// faults fire. With `repeat` the injector stays armed after the first
    /// hit; otherwise it disarms itself.
    pub fn arm(&self, countdown: i32, repeat: bool) {
        self.countdown.store(countdown, Ordering::SeqCst);
        self.repeat.store(repeat, Ordering::SeqCst);
        self.hits.store(0, Ordering::SeqCst);
        self.enabled.store(true, Ordering::SeqCst);
    }

    /// Disarm and report how many faults fired since arming.
    pub fn disarm(&self) -> u32 {
        self.enabled.store(false, Ordering::SeqCst);
        self.hits.load(Ordering::SeqCst)
    }

    pub fn is_armed(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    pub fn hits(&self) -> u32 {
        self.hits.load(Ordering::SeqCst)
    }

    pub fn benign_begin(&self) {
        self.benign_depth.fetch_add(1, Ordering::SeqCst);
    }

    pub fn benign_end(&self) {
        let prev = self.benign_depth.fetch_sub(1, Ordering::SeqCst);
        debug_assert!(prev > 0, "benign_end without benign_begin");
    }

    /// One guarded call. True means the call must fail now.
    fn step(&self) -> bool {
        if !self.enabled.load(Ordering::SeqCst) {
            return false;
        }
        if self.benign_depth.load(Ordering::SeqCst) > 0 {
            return false;
        }
        let remaining = self.countdown.fetch_sub(1, Ordering::SeqCst);
        if remaining > 0 {
            return false;
        }
        self.countdown.store(0, Ordering::SeqCst);
        self.hits.fetch_add(1, Ordering::SeqCst);
        if !self.repeat.load(Ordering::SeqCst) {
            self.enabled.store(false, Ordering::SeqCst);
        }
        true
    }
}

fn injected_fault() -> Error {
    log::trace!("injected allocation failure");
    Error::with_message(ErrorCode::NoMem, "simulated allocation failure")
}

// ============================================================================
// Pooled pathnames
// ============================================================================

/// A resolved pathname borrowed from the context's buffer pool; the buffer
/// goes back to the pool on drop.
pub struct PooledPath {
    pool: Arc<ObjectPool<PathBuffer>>,
    buf: Option<PathBuffer>,
}

impl Deref for PooledPath {
    type Target = str;

    fn deref(&self) -> &str {
        self.buf.as_ref().map(PathBuffer::as_str).unwrap_or("")
    }
}

impl std::fmt::Display for PooledPath {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self)
    }
}

impl std::fmt::Debug for PooledPath {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("PooledPath").field(&&**self).finish()
    }
}

impl Drop for PooledPath {
    fn drop(&mut self) {
        if let Some(buf) = self.buf.take() {
            self.pool.put(buf);
        }
    }
}

// ============================================================================
// Driver-level wrappers
// ============================================================================

impl Env {
    /// Open a file through `vfs` after stripping engine-internal flags.
    pub fn os_open(
        &self,
        vfs: &Arc<dyn Vfs>,
        path: Option<&str>,
        flags: OpenFlags,
    ) -> Result<(Box<dyn VfsFile>, OpenFlags)> {
        if self.fault_injector().step() {
            return Err(injected_fault());
        }
        let masked = OpenFlags::from_bits_truncate(flags.bits() & OPEN_FLAG_MASK);
        vfs.open(path, masked)
    }

    pub fn os_delete(&self, vfs: &Arc<dyn Vfs>, path: &str, sync_dir: bool) -> Result<()> {
        vfs.delete(path, sync_dir)
    }

    pub fn os_access(&self, vfs: &Arc<dyn Vfs>, path: &str, flags: AccessFlags) -> Result<bool> {
        if self.fault_injector().step() {
            return Err(injected_fault());
        }
        vfs.access(path, flags)
    }

    /// Resolve `path` to its absolute form in a pooled buffer.
    pub fn os_full_pathname(&self, vfs: &Arc<dyn Vfs>, path: &str) -> Result<PooledPath> {
        let pool = self.path_pool()?;
        let mut buf = pool.take();
        match vfs.full_pathname(path, buf.buf_mut()) {
            Ok(()) => {
                if buf.len() > vfs.max_pathname() as usize {
                    pool.put(buf);
                    return Err(Error::with_message(ErrorCode::CantOpen, "pathname too long"));
                }
                Ok(PooledPath {
                    pool,
                    buf: Some(buf),
                })
            }
            Err(err) => {
                pool.put(buf);
                Err(err)
            }
        }
    }

    pub fn os_randomness(&self, vfs: &Arc<dyn Vfs>, buf: &mut [u8]) -> i32 {
        vfs.randomness(buf)
    }

    pub fn os_sleep(&self, vfs: &Arc<dyn Vfs>, microseconds: i32) -> i32 {
        vfs.sleep(microseconds)
    }

    pub fn os_current_time(&self, vfs: &Arc<dyn Vfs>) -> f64 {
        vfs.current_time()
    }

    /// Millisecond clock, synthesized from the day-fraction clock for
    /// drivers too old to carry one.
    pub fn os_current_time_i64(&self, vfs: &Arc<dyn Vfs>) -> i64 {
        if vfs.version() >= 2 {
            vfs.current_time_i64()
        } else {
            (vfs.current_time() * 86_400_000.0) as i64
        }
    }

    pub fn os_get_last_error(&self, vfs: &Arc<dyn Vfs>) -> (i32, String) {
        vfs.get_last_error()
    }

    /// A fresh temporary file name: the fixed prefix plus fifteen random
    /// characters. Collisions are possible in principle; drivers open temp
    /// files with the exclusive-create flags to catch them.
    pub fn os_temp_filename(&self) -> Result<String> {
        const CHARS: &[u8] = b"abcdefghijklmnopqrstuvwxyz0123456789";
        let mut raw = [0u8; 15];
        self.randomness(&mut raw)?;
        let mut name = String::with_capacity(TEMP_FILE_PREFIX.len() + raw.len());
        name.push_str(TEMP_FILE_PREFIX);
        for b in raw {
            name.push(CHARS[b as usize % CHARS.len()] as char);
        }
        Ok(name)
    }

    // ------------------------------------------------------------------------
    // File-level wrappers
    // ------------------------------------------------------------------------

    pub fn os_read(&self, file: &dyn VfsFile, buf: &mut [u8], offset: i64) -> Result<usize> {
        if self.fault_injector().step() {
            return Err(injected_fault());
        }
        file.read(buf, offset)
    }

    pub fn os_write(&self, file: &dyn VfsFile, buf: &[u8], offset: i64) -> Result<usize> {
        if self.fault_injector().step() {
            return Err(injected_fault());
        }
        file.write(buf, offset)
    }

    pub fn os_truncate(&self, file: &dyn VfsFile, size: i64) -> Result<()> {
        file.truncate(size)
    }

    pub fn os_sync(&self, file: &dyn VfsFile, flags: SyncFlags) -> Result<()> {
        if self.fault_injector().step() {
            return Err(injected_fault());
        }
        file.sync(flags)
    }

    pub fn os_file_size(&self, file: &dyn VfsFile) -> Result<i64> {
        file.file_size()
    }

    pub fn os_lock(&self, file: &dyn VfsFile, level: LockLevel) -> Result<()> {
        if self.fault_injector().step() {
            return Err(injected_fault());
        }
        file.lock(level)
    }

    pub fn os_unlock(&self, file: &dyn VfsFile, level: LockLevel) -> Result<()> {
        file.unlock(level)
    }

    pub fn os_check_reserved_lock(&self, file: &dyn VfsFile) -> Result<bool> {
        if self.fault_injector().step() {
            return Err(injected_fault());
        }
        file.check_reserved_lock()
    }

    pub fn os_file_control(&self, file: &dyn VfsFile, op: FileControlOp<'_>) -> Result<()> {
        file.file_control(op)
    }

    /// Forward a control operation whose outcome the caller does not care
    /// about. Failures are discarded and fault injection is suspended for
    /// the duration.
    pub fn os_file_control_hint(&self, file: &dyn VfsFile, op: FileControlOp<'_>) {
        self.fault_injector().benign_begin();
        let _ = file.file_control(op);
        self.fault_injector().benign_end();
    }

    pub fn os_sector_size(&self, file: &dyn VfsFile) -> i32 {
        file.sector_size()
    }

    pub fn os_device_characteristics(&self, file: &dyn VfsFile) -> DeviceCharacteristics {
        file.device_characteristics()
    }

    pub fn os_close(&self, file: Box<dyn VfsFile>) -> Result<()> {
        file.close()
    }

    /// Raise a lock level, retrying through `handler` while the file stays
    /// busy. Any other failure aborts the loop immediately.
    pub fn os_lock_with_busy(
        &self,
        file: &dyn VfsFile,
        level: LockLevel,
        handler: &mut BusyHandler,
    ) -> Result<()> {
        loop {
            match self.os_lock(file, level) {
                Err(err) if err.code == ErrorCode::Busy => {
                    if !handler.invoke() {
                        return Err(err);
                    }
                }
                other => return other,
            }
        }
    }
}

// ============================================================================
// Busy handler
// ============================================================================

/// Caller-supplied retry policy for contended locks.
///
/// The callback receives the number of prior retries and decides whether to
/// keep going. Once it gives up, the handler stays given-up until `reset`.
pub struct BusyHandler {
    callback: Box<dyn FnMut(i32) -> bool + Send>,
    n_busy: i32,
}

impl BusyHandler {
    pub fn new(callback: impl FnMut(i32) -> bool + Send + 'static) -> BusyHandler {
        BusyHandler {
            callback: Box::new(callback),
            n_busy: 0,
        }
    }

    /// The stock policy: sleep on a rising schedule through the driver's
    /// clock until roughly `timeout_ms` has been spent waiting, then stop.
    pub fn with_default_backoff(vfs: Arc<dyn Vfs>, timeout_ms: i32) -> BusyHandler {
        const DELAYS: [i32; 12] = [1, 2, 5, 10, 15, 20, 25, 25, 25, 50, 50, 100];
        const TOTALS: [i32; 12] = [0, 1, 3, 8, 18, 33, 53, 78, 103, 128, 178, 228];
        BusyHandler::new(move |count| {
            let last = DELAYS.len() - 1;
            let (mut delay, prior) = if (count as usize) < DELAYS.len() {
                (DELAYS[count as usize], TOTALS[count as usize])
            } else {
                (
                    DELAYS[last],
                    TOTALS[last] + DELAYS[last] * (count - last as i32),
                )
            };
            if prior + delay > timeout_ms {
                delay = timeout_ms - prior;
                if delay <= 0 {
                    return false;
                }
            }
            vfs.sleep(delay * 1000);
            true
        })
    }

    /// One busy notification. False means stop retrying.
    pub fn invoke(&mut self) -> bool {
        if self.n_busy < 0 {
            return false;
        }
        if (self.callback)(self.n_busy) {
            self.n_busy += 1;
            true
        } else {
            self.n_busy = -1;
            false
        }
    }

    pub fn retries(&self) -> i32 {
        self.n_busy.max(0)
    }

    pub fn reset(&mut self) {
        self.n_busy = 0;
    }
}

// ============================================================================
// Tests
// ============================================================================
