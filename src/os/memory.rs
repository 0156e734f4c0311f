//! In-process memory driver.
//!
//! Files live in a node table owned by the driver instance, so every handle
//! opened through the same instance shares file content and the lock table.
//! That makes this the driver of choice for exercising the locking protocol:
//! "processes" are just handles, and contention is deterministic instead of
//! depending on OS advisory-lock quirks. Lock-table entries are drawn from
//! the context's record pool.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::error::{Error, ErrorCode, Result};
use crate::mem::pool::{ObjectPool, Recycle, DEFAULT_POOL_SLOTS};
use crate::os::lockproto::{self, counter_entropy, LockState, RangeKind, RangeLock};
use crate::os::mutex::{new_raw_mutex, recover, MutexBackendKind, MutexKind};
use crate::os::vfs::{
    AccessFlags, DeviceCharacteristics, FileControlOp, LockLevel, OpenFlags, SyncFlags, Vfs,
    VfsFile, UNIX_EPOCH_JULIAN_MS,
};

// ============================================================================
// Lock records
// ============================================================================

/// One held byte range in a node's lock table. Pooled: cleared on the way
/// back so a recycled record carries nothing from its previous owner.
#[derive(Debug, Default)]
pub struct LockRecord {
    owner: u64,
    offset: u64,
    len: u64,
    exclusive: bool,
}

impl Recycle for LockRecord {
    fn recycle(&mut self) {
        self.owner = 0;
        self.offset = 0;
        self.len = 0;
        self.exclusive = false;
    }
}

// ============================================================================
// Nodes
// ============================================================================

/// A file's content and lock table, shared by every open handle.
#[derive(Default)]
struct MemNode {
    data: Mutex<Vec<u8>>,
    locks: Mutex<Vec<LockRecord>>,
}

type NodeTable = Mutex<HashMap<String, Arc<MemNode>>>;

// ============================================================================
// Driver
// ============================================================================

/// The in-process driver. Each instance is its own little filesystem.
pub struct MemVfs {
    nodes: Arc<NodeTable>,
    record_pool: Arc<ObjectPool<LockRecord>>,
    /// When set, new handles take the randomized single-byte reader lock
    /// instead of a shared lock on the whole reader range.
    single_byte_readers: AtomicBool,
    next_handle: AtomicU64,
    next_temp: AtomicU64,
    entropy: Arc<AtomicU32>,
}

impl MemVfs {
    pub(crate) fn new(record_pool: Arc<ObjectPool<LockRecord>>) -> MemVfs {
        let nanos = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default()
            .subsec_nanos();
        MemVfs {
            nodes: Arc::new(Mutex::new(HashMap::new())),
            record_pool,
            single_byte_readers: AtomicBool::new(false),
            next_handle: AtomicU64::new(1),
            next_temp: AtomicU64::new(0),
            entropy: Arc::new(AtomicU32::new(nanos | 1)),
        }
    }

    /// A self-contained instance with its own record pool, for direct use
    /// outside a context.
    pub fn standalone() -> MemVfs {
        let mutex = new_raw_mutex(MutexBackendKind::Native, MutexKind::Fast);
        MemVfs::new(Arc::new(ObjectPool::new(
            "lock-record",
            mutex,
            DEFAULT_POOL_SLOTS,
        )))
    }

    /// Switch new handles between whole-range reader locks and the
    /// randomized single-byte substitute.
    pub fn set_single_byte_readers(&self, on: bool) {
        self.single_byte_readers.store(on, Ordering::Relaxed);
    }
}

impl Vfs for MemVfs {
    fn name(&self) -> &str {
        "memory"
    }

    fn open(&self, path: Option<&str>, flags: OpenFlags) -> Result<(Box<dyn VfsFile>, OpenFlags)> {
        debug_assert!(flags.is_valid_combination());

        let mut delete_on_close = flags.contains(OpenFlags::DELETEONCLOSE);
        let name = match path {
            Some(p) if !p.is_empty() => p.to_owned(),
            _ => {
                // anonymous temp file, cleaned up with its last handle
                delete_on_close = true;
                format!("memtemp-{}", self.next_temp.fetch_add(1, Ordering::Relaxed))
            }
        };

        let node = {
            let mut nodes = recover(self.nodes.lock());
            match nodes.get(&name) {
                Some(node) => {
                    if flags.contains(OpenFlags::EXCLUSIVE) {
                        return Err(Error::with_message(
                            ErrorCode::CantOpen,
                            "file already exists",
                        ));
                    }
                    Arc::clone(node)
                }
                None => {
                    if !flags.contains(OpenFlags::CREATE) {
                        return Err(Error::with_message(ErrorCode::CantOpen, "no such file"));
                    }
                    let node = Arc::new(MemNode::default());
                    nodes.insert(name.clone(), Arc::clone(&node));
                    node
                }
            }
        };

        let file = MemFile {
            node,
            nodes: Arc::clone(&self.nodes),
            record_pool: Arc::clone(&self.record_pool),
            entropy: Arc::clone(&self.entropy),
            path: name,
            handle_id: self.next_handle.fetch_add(1, Ordering::Relaxed),
            readonly: flags.contains(OpenFlags::READONLY),
            delete_on_close,
            shared_ranges: !self.single_byte_readers.load(Ordering::Relaxed),
            state: Mutex::new(LockState::default()),
            chunk_size: AtomicI32::new(0),
            last_errno: AtomicI32::new(0),
        };
        Ok((Box::new(file), flags))
    }

    fn delete(&self, path: &str, _sync_dir: bool) -> Result<()> {
        match recover(self.nodes.lock()).remove(path) {
            Some(_) => Ok(()),
            None => Err(Error::with_message(ErrorCode::NotFound, "no such file")),
        }
    }

    fn access(&self, path: &str, _flags: AccessFlags) -> Result<bool> {
        // every memory node is readable and writable, so all three access
        // questions collapse to existence
        Ok(recover(self.nodes.lock()).contains_key(path))
    }

    fn full_pathname(&self, path: &str, out: &mut String) -> Result<()> {
        out.clear();
        if !path.starts_with('/') {
            out.push('/');
        }
        out.push_str(path);
        Ok(())
    }

    fn randomness(&self, buf: &mut [u8]) -> i32 {
        for chunk in buf.chunks_mut(4) {
            let word = counter_entropy(&self.entropy).to_le_bytes();
            for (dst, src) in chunk.iter_mut().zip(word) {
                *dst = src;
            }
        }
        buf.len() as i32
    }

    fn sleep(&self, microseconds: i32) -> i32 {
        if microseconds > 0 {
            std::thread::sleep(Duration::from_micros(microseconds as u64));
        }
        microseconds
    }

    fn current_time(&self) -> f64 {
        self.current_time_i64() as f64 / 86_400_000.0
    }

    fn current_time_i64(&self) -> i64 {
        chrono::Utc::now().timestamp_millis() + UNIX_EPOCH_JULIAN_MS
    }
}

// ============================================================================
// File handles
// ============================================================================

struct MemFile {
    node: Arc<MemNode>,
    nodes: Arc<NodeTable>,
    record_pool: Arc<ObjectPool<LockRecord>>,
    entropy: Arc<AtomicU32>,
    path: String,
    handle_id: u64,
    readonly: bool,
    delete_on_close: bool,
    shared_ranges: bool,
    state: Mutex<LockState>,
    chunk_size: AtomicI32,
    last_errno: AtomicI32,
}

impl MemFile {
    /// Sizes round up to the configured chunk, like a file grown in chunks.
    fn rounded_size(&self, want: usize) -> usize {
        let chunk = self.chunk_size.load(Ordering::Relaxed);
        if chunk > 0 {
            let chunk = chunk as usize;
            (want + chunk - 1) / chunk * chunk
        } else {
            want
        }
    }
}

impl RangeLock for MemFile {
    fn acquire(&self, offset: u64, len: u64, kind: RangeKind) -> Result<()> {
        let mut locks = recover(self.node.locks.lock());
        let end = offset + len;
        let wants_exclusive = kind == RangeKind::Exclusive;
        for rec in locks.iter() {
            if rec.owner == self.handle_id {
                continue;
            }
            let overlaps = offset < rec.offset + rec.len && rec.offset < end;
            if overlaps && (wants_exclusive || rec.exclusive) {
                return Err(Error::new(ErrorCode::Busy));
            }
        }
        let mut rec = self.record_pool.take();
        rec.owner = self.handle_id;
        rec.offset = offset;
        rec.len = len;
        rec.exclusive = wants_exclusive;
        locks.push(rec);
        Ok(())
    }

    fn release(&self, offset: u64, len: u64) -> Result<()> {
        let mut locks = recover(self.node.locks.lock());
        let held = locks
            .iter()
            .position(|r| r.owner == self.handle_id && r.offset == offset && r.len == len);
        match held {
            Some(idx) => {
                let rec = locks.swap_remove(idx);
                self.record_pool.put(rec);
                Ok(())
            }
            None => Err(Error::with_message(ErrorCode::Misuse, "range not held")),
        }
    }

    fn shared_ranges(&self) -> bool {
        self.shared_ranges
    }

    fn entropy32(&self) -> u32 {
        counter_entropy(&self.entropy)
    }
}

impl VfsFile for MemFile {
    fn read(&self, buf: &mut [u8], offset: i64) -> Result<usize> {
        if offset < 0 {
            return Err(Error::with_message(ErrorCode::Misuse, "negative offset"));
        }
        let data = recover(self.node.data.lock());
        let off = offset as usize;
        if off >= data.len() {
            return Ok(0);
        }
        let n = buf.len().min(data.len() - off);
        buf[..n].copy_from_slice(&data[off..off + n]);
        Ok(n)
    }

    fn write(&self, buf: &[u8], offset: i64) -> Result<usize> {
        if self.readonly {
            return Err(Error::with_message(
                ErrorCode::ReadOnly,
                "write on read-only handle",
            ));
        }
        if offset < 0 {
            return Err(Error::with_message(ErrorCode::Misuse, "negative offset"));
        }
        let mut data = recover(self.node.data.lock());
        let end = offset as usize + buf.len();
        if end > data.len() {
            let target = self.rounded_size(end);
            data.resize(target, 0);
        }
        data[offset as usize..end].copy_from_slice(buf);
        Ok(buf.len())
    }

    fn truncate(&self, size: i64) -> Result<()> {
        if self.readonly {
            return Err(Error::with_message(
                ErrorCode::ReadOnly,
                "truncate on read-only handle",
            ));
        }
        if size < 0 {
            return Err(Error::with_message(ErrorCode::Misuse, "negative size"));
        }
        let target = self.rounded_size(size as usize);
        recover(self.node.data.lock()).resize(target, 0);
        Ok(())
    }

    fn sync(&self, _flags: SyncFlags) -> Result<()> {
        Ok(())
    }

    fn file_size(&self) -> Result<i64> {
        Ok(recover(self.node.data.lock()).len() as i64)
    }

    fn lock(&self, level: LockLevel) -> Result<()> {
        if self.readonly && level >= LockLevel::Reserved {
            return Err(Error::with_message(
                ErrorCode::IoErr,
                "write lock on read-only handle",
            ));
        }
        let mut state = recover(self.state.lock());
        lockproto::lock(self, &mut state, level)
    }

    fn unlock(&self, level: LockLevel) -> Result<()> {
        let mut state = recover(self.state.lock());
        lockproto::unlock(self, &mut state, level)
    }

    fn check_reserved_lock(&self) -> Result<bool> {
        let state = recover(self.state.lock());
        lockproto::check_reserved(self, &state)
    }

    fn file_control(&self, op: FileControlOp<'_>) -> Result<()> {
        match op {
            FileControlOp::LockState(out) => {
                *out = recover(self.state.lock()).level;
                Ok(())
            }
            FileControlOp::LastErrno(out) => {
                *out = self.last_errno.load(Ordering::Relaxed);
                Ok(())
            }
            FileControlOp::ChunkSize(n) => {
                if n < 0 {
                    return Err(Error::with_message(ErrorCode::Misuse, "negative chunk size"));
                }
                self.chunk_size.store(n, Ordering::Relaxed);
                Ok(())
            }
            FileControlOp::SizeHint(n) => {
                if n < 0 {
                    return Err(Error::with_message(ErrorCode::Misuse, "negative size hint"));
                }
                // pre-extend; never shrinks
                let mut data = recover(self.node.data.lock());
                let target = self.rounded_size(n as usize);
                if target > data.len() {
                    data.resize(target, 0);
                }
                Ok(())
            }
            FileControlOp::SyncOmitted => Ok(()),
        }
    }

    fn device_characteristics(&self) -> DeviceCharacteristics {
        DeviceCharacteristics::ATOMIC
            | DeviceCharacteristics::POWERSAFE_OVERWRITE
            | DeviceCharacteristics::SAFE_APPEND
            | DeviceCharacteristics::SEQUENTIAL
    }
}

impl Drop for MemFile {
    fn drop(&mut self) {
        {
            let mut state = recover(self.state.lock());
            if state.level != LockLevel::None {
                let _ = lockproto::unlock(&*self, &mut state, LockLevel::None);
            }
        }
        if self.delete_on_close {
            let mut nodes = recover(self.nodes.lock());
            if let Some(current) = nodes.get(&self.path) {
                if Arc::ptr_eq(current, &self.node) {
                    nodes.remove(&self.path);
                }
            }
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
