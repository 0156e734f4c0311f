//! Unix driver.
//!
//! Byte-range locks map onto POSIX advisory record locks (`fcntl` with
//! `F_SETLK`). POSIX locks are owned by the process, not the descriptor, so
//! two handles opened by one process never contend and a probe from one can
//! clobber a lock held by the other. Cross-handle tests belong to the memory
//! driver; this one coordinates between processes.

use std::ffi::CString;
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicI32, AtomicU32, Ordering};
use std::sync::Mutex;

use crate::error::{Error, ErrorCode, Result};
use crate::os::dispatch::TEMP_FILE_PREFIX;
use crate::os::lockproto::{self, counter_entropy, LockState, RangeKind, RangeLock};
use crate::os::mutex::recover;
use crate::os::vfs::{
    AccessFlags, DeviceCharacteristics, FileControlOp, LockLevel, OpenFlags, SyncFlags, Vfs,
    VfsFile, UNIX_EPOCH_JULIAN_MS,
};

const SECTOR_SIZE: i32 = 4096;
const TEMP_NAME_ATTEMPTS: u32 = 10;

// ============================================================================
// Platform-specific helpers
// ============================================================================

/// Get errno in a cross-platform way (Linux vs macOS/BSD)
#[cfg(target_os = "linux")]
fn get_errno() -> i32 {
    unsafe { *libc::__errno_location() }
}

#[cfg(not(target_os = "linux"))]
fn get_errno() -> i32 {
    unsafe { *libc::__error() }
}

/// fdatasync - use fsync on platforms without fdatasync (macOS)
#[cfg(target_os = "linux")]
unsafe fn platform_fdatasync(fd: RawFd) -> i32 {
    libc::fdatasync(fd)
}

#[cfg(not(target_os = "linux"))]
unsafe fn platform_fdatasync(fd: RawFd) -> i32 {
    libc::fsync(fd)
}

fn errno_error(errno: i32) -> Error {
    let msg = std::io::Error::from_raw_os_error(errno).to_string();

    let code = match errno {
        libc::ENOENT => ErrorCode::CantOpen,
        libc::EACCES | libc::EPERM => ErrorCode::Perm,
        libc::ENOSPC | libc::EDQUOT => ErrorCode::Full,
        libc::EBUSY | libc::EAGAIN => ErrorCode::Busy,
        libc::EINTR => ErrorCode::Interrupt,
        libc::ENOMEM => ErrorCode::NoMem,
        libc::EROFS => ErrorCode::ReadOnly,
        _ => ErrorCode::IoErr,
    };

    Error::with_message(code, msg)
}

// ============================================================================
// Unix VFS
// ============================================================================

/// The POSIX driver, registry name "unix".
pub struct UnixVfs {
    entropy: AtomicU32,
}

impl UnixVfs {
    pub fn new() -> Self {
        let nanos = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default()
            .subsec_nanos();
        Self {
            entropy: AtomicU32::new(nanos | 1),
        }
    }

    fn temp_name(&self) -> String {
        let hi = counter_entropy(&self.entropy) as u64;
        let lo = counter_entropy(&self.entropy) as u64;
        let dir = std::env::temp_dir();
        format!(
            "{}/{}{:016x}",
            dir.to_string_lossy().trim_end_matches('/'),
            TEMP_FILE_PREFIX,
            (hi << 32) | lo
        )
    }
}

impl Default for UnixVfs {
    fn default() -> Self {
        Self::new()
    }
}

impl Vfs for UnixVfs {
    fn name(&self) -> &str {
        "unix"
    }

    fn open(&self, path: Option<&str>, flags: OpenFlags) -> Result<(Box<dyn VfsFile>, OpenFlags)> {
        debug_assert!(flags.is_valid_combination());

        let mut oflags: libc::c_int = 0;
        if flags.contains(OpenFlags::READONLY) {
            oflags |= libc::O_RDONLY;
        } else {
            oflags |= libc::O_RDWR;
        }
        if flags.contains(OpenFlags::CREATE) {
            oflags |= libc::O_CREAT;
        }
        if flags.contains(OpenFlags::EXCLUSIVE) {
            oflags |= libc::O_EXCL;
        }
        if flags.contains(OpenFlags::NOFOLLOW) {
            oflags |= libc::O_NOFOLLOW;
        }

        let (path_str, fd, delete_on_close) = match path {
            Some(p) if !p.is_empty() => {
                let c_path = CString::new(p).map_err(|_| Error::new(ErrorCode::CantOpen))?;
                let fd = unsafe { libc::open(c_path.as_ptr(), oflags, 0o644) };
                if fd < 0 {
                    return Err(errno_error(get_errno()));
                }
                (p.to_string(), fd, flags.contains(OpenFlags::DELETEONCLOSE))
            }
            _ => {
                // name generated here; O_EXCL catches the rare collision
                let mut attempt = 0;
                loop {
                    let candidate = self.temp_name();
                    let c_path = CString::new(candidate.as_str())
                        .map_err(|_| Error::new(ErrorCode::CantOpen))?;
                    let fd = unsafe {
                        libc::open(
                            c_path.as_ptr(),
                            libc::O_RDWR | libc::O_CREAT | libc::O_EXCL,
                            0o600,
                        )
                    };
                    if fd >= 0 {
                        break (candidate, fd, true);
                    }
                    let errno = get_errno();
                    attempt += 1;
                    if errno != libc::EEXIST || attempt >= TEMP_NAME_ATTEMPTS {
                        return Err(errno_error(errno));
                    }
                }
            }
        };

        // Unlink now: the descriptor keeps the storage alive, and the name
        // never outlives a crash.
        if delete_on_close {
            if let Ok(c_path) = CString::new(path_str.as_str()) {
                unsafe { libc::unlink(c_path.as_ptr()) };
            }
        }

        let file = UnixFile {
            fd,
            readonly: flags.contains(OpenFlags::READONLY),
            state: Mutex::new(LockState::default()),
            chunk_size: AtomicI32::new(0),
            last_errno: AtomicI32::new(0),
            entropy: AtomicU32::new(counter_entropy(&self.entropy) | 1),
        };
        Ok((Box::new(file), flags))
    }

    fn delete(&self, path: &str, sync_dir: bool) -> Result<()> {
        let c_path = CString::new(path).map_err(|_| Error::new(ErrorCode::CantOpen))?;
        let rc = unsafe { libc::unlink(c_path.as_ptr()) };

        if rc != 0 {
            let errno = get_errno();
            if errno == libc::ENOENT {
                return Err(Error::with_message(ErrorCode::NotFound, "no such file"));
            }
            return Err(errno_error(errno));
        }

        if sync_dir {
            if let Some(dir_path) = std::path::Path::new(path).parent() {
                let dir_str = dir_path.to_str().unwrap_or(".");
                if let Ok(c_dir) = CString::new(dir_str) {
                    let dir_fd = unsafe { libc::open(c_dir.as_ptr(), libc::O_RDONLY) };
                    if dir_fd >= 0 {
                        unsafe {
                            libc::fsync(dir_fd);
                            libc::close(dir_fd);
                        }
                    }
                }
            }
        }

        Ok(())
    }

    fn access(&self, path: &str, flags: AccessFlags) -> Result<bool> {
        let c_path = CString::new(path).map_err(|_| Error::new(ErrorCode::CantOpen))?;

        let mode = if flags.contains(AccessFlags::READWRITE) {
            libc::R_OK | libc::W_OK
        } else if flags.contains(AccessFlags::READ) {
            libc::R_OK
        } else {
            libc::F_OK
        };

        let rc = unsafe { libc::access(c_path.as_ptr(), mode) };
        Ok(rc == 0)
    }

    fn full_pathname(&self, path: &str, out: &mut String) -> Result<()> {
        out.clear();
        if path.starts_with('/') {
            out.push_str(path);
        } else {
            let cwd = std::env::current_dir().map_err(|_| Error::new(ErrorCode::CantOpen))?;
            out.push_str(&cwd.to_string_lossy());
            if !out.ends_with('/') {
                out.push('/');
            }
            out.push_str(path);
        }
        Ok(())
    }

    fn randomness(&self, buf: &mut [u8]) -> i32 {
        if let Ok(mut file) = std::fs::File::open("/dev/urandom") {
            use std::io::Read;
            if file.read_exact(buf).is_ok() {
                return buf.len() as i32;
            }
        }

        // no urandom; stretch the local counter instead
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
            std::thread::sleep(std::time::Duration::from_micros(microseconds as u64));
        }
        microseconds
    }

    fn current_time(&self) -> f64 {
        self.current_time_i64() as f64 / 86_400_000.0
    }

    fn current_time_i64(&self) -> i64 {
        chrono::Utc::now().timestamp_millis() + UNIX_EPOCH_JULIAN_MS
    }

    fn get_last_error(&self) -> (i32, String) {
        let errno = get_errno();
        let msg = std::io::Error::from_raw_os_error(errno).to_string();
        (errno, msg)
    }
}

// ============================================================================
// Unix File Handle
// ============================================================================

pub struct UnixFile {
    fd: RawFd,
    readonly: bool,
    state: Mutex<LockState>,
    chunk_size: AtomicI32,
    last_errno: AtomicI32,
    entropy: AtomicU32,
}

impl UnixFile {
    fn note_errno(&self, errno: i32) -> Error {
        self.last_errno.store(errno, Ordering::Relaxed);
        errno_error(errno)
    }

    /// One F_SETLK call, retried through signal interrupts.
    fn fcntl_range(&self, l_type: libc::c_short, offset: u64, len: u64) -> Result<()> {
        let flock = libc::flock {
            l_type,
            l_whence: libc::SEEK_SET as libc::c_short,
            l_start: offset as libc::off_t,
            l_len: len as libc::off_t,
            l_pid: 0,
        };

        loop {
            let rc = unsafe { libc::fcntl(self.fd, libc::F_SETLK, &flock) };
            if rc == 0 {
                return Ok(());
            }
            let errno = get_errno();
            if errno == libc::EINTR {
                continue;
            }
            self.last_errno.store(errno, Ordering::Relaxed);
            if errno == libc::EAGAIN || errno == libc::EACCES {
                return Err(Error::new(ErrorCode::Busy));
            }
            return Err(errno_error(errno));
        }
    }

    fn rounded_size(&self, want: i64) -> i64 {
        let chunk = self.chunk_size.load(Ordering::Relaxed);
        if chunk > 0 {
            let chunk = chunk as i64;
            (want + chunk - 1) / chunk * chunk
        } else {
            want
        }
    }

    fn stat_size(&self) -> Result<i64> {
        let mut stat: libc::stat = unsafe { std::mem::zeroed() };
        let rc = unsafe { libc::fstat(self.fd, &mut stat) };
        if rc != 0 {
            return Err(self.note_errno(get_errno()));
        }
        Ok(stat.st_size as i64)
    }
}

impl RangeLock for UnixFile {
    fn acquire(&self, offset: u64, len: u64, kind: RangeKind) -> Result<()> {
        let l_type = match kind {
            RangeKind::Shared => libc::F_RDLCK,
            RangeKind::Exclusive => libc::F_WRLCK,
        };
        self.fcntl_range(l_type as libc::c_short, offset, len)
    }

    fn release(&self, offset: u64, len: u64) -> Result<()> {
        self.fcntl_range(libc::F_UNLCK as libc::c_short, offset, len)
    }

    fn entropy32(&self) -> u32 {
        counter_entropy(&self.entropy)
    }
}

impl VfsFile for UnixFile {
    fn read(&self, buf: &mut [u8], offset: i64) -> Result<usize> {
        let n = loop {
            let n = unsafe {
                libc::pread(
                    self.fd,
                    buf.as_mut_ptr() as *mut libc::c_void,
                    buf.len(),
                    offset as libc::off_t,
                )
            };
            if n >= 0 {
                break n as usize;
            }
            let errno = get_errno();
            if errno == libc::EINTR {
                continue;
            }
            return Err(self.note_errno(errno));
        };

        // short reads leave the tail zeroed
        if n < buf.len() {
            buf[n..].fill(0);
        }
        Ok(n)
    }

    fn write(&self, buf: &[u8], offset: i64) -> Result<usize> {
        if self.readonly {
            return Err(Error::with_message(
                ErrorCode::ReadOnly,
                "write on read-only handle",
            ));
        }

        let mut written = 0usize;
        while written < buf.len() {
            let rest = &buf[written..];
            let n = unsafe {
                libc::pwrite(
                    self.fd,
                    rest.as_ptr() as *const libc::c_void,
                    rest.len(),
                    (offset + written as i64) as libc::off_t,
                )
            };
            if n < 0 {
                let errno = get_errno();
                if errno == libc::EINTR {
                    continue;
                }
                if errno == libc::ENOSPC {
                    self.last_errno.store(errno, Ordering::Relaxed);
                    return Err(Error::with_message(ErrorCode::Full, "disk full"));
                }
                return Err(self.note_errno(errno));
            }
            if n == 0 {
                return Err(Error::with_message(ErrorCode::Full, "short write"));
            }
            written += n as usize;
        }
        Ok(written)
    }

    fn truncate(&self, size: i64) -> Result<()> {
        if self.readonly {
            return Err(Error::with_message(
                ErrorCode::ReadOnly,
                "truncate on read-only handle",
            ));
        }
        let target = self.rounded_size(size);
        let rc = unsafe { libc::ftruncate(self.fd, target as libc::off_t) };
        if rc != 0 {
            return Err(self.note_errno(get_errno()));
        }
        Ok(())
    }

    fn sync(&self, flags: SyncFlags) -> Result<()> {
        let rc = if flags.contains(SyncFlags::DATAONLY) {
            unsafe { platform_fdatasync(self.fd) }
        } else {
            unsafe { libc::fsync(self.fd) }
        };

        if rc != 0 {
            return Err(self.note_errno(get_errno()));
        }
        Ok(())
    }

    fn file_size(&self) -> Result<i64> {
        self.stat_size()
    }

    fn lock(&self, level: LockLevel) -> Result<()> {
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
                let current = self.stat_size()?;
                let target = self.rounded_size(n);
                if target > current {
                    let rc = unsafe { libc::ftruncate(self.fd, target as libc::off_t) };
                    if rc != 0 {
                        return Err(self.note_errno(get_errno()));
                    }
                }
                Ok(())
            }
            FileControlOp::SyncOmitted => Ok(()),
        }
    }

    fn sector_size(&self) -> i32 {
        SECTOR_SIZE
    }

    fn device_characteristics(&self) -> DeviceCharacteristics {
        DeviceCharacteristics::POWERSAFE_OVERWRITE
    }
}

impl Drop for UnixFile {
    fn drop(&mut self) {
        {
            let mut state = recover(self.state.lock());
            if state.level != LockLevel::None {
                let _ = lockproto::unlock(&*self, &mut state, LockLevel::None);
            }
        }
        unsafe { libc::close(self.fd) };
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn rw_create() -> OpenFlags {
        OpenFlags::MAIN_DB | OpenFlags::READWRITE | OpenFlags::CREATE
    }

    #[test]
    fn test_vfs_identity() {
        let vfs = UnixVfs::new();
        assert_eq!(vfs.name(), "unix");
        assert_eq!(vfs.version(), 3);
        assert!(vfs.max_pathname() > 0);
    }

    #[test]
    fn test_open_missing_without_create() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("absent.db");
        let vfs = UnixVfs::new();
        let err = vfs
            .open(
                path.to_str(),
                OpenFlags::MAIN_DB | OpenFlags::READWRITE,
            )
            .unwrap_err();
        assert_eq!(err.code, ErrorCode::CantOpen);
    }

    #[test]
    fn test_read_write_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("rw.db");
        let vfs = UnixVfs::new();
        let (file, _) = vfs.open(path.to_str(), rw_create()).unwrap();

        let data = b"persistent bytes";
        assert_eq!(file.write(data, 0).unwrap(), data.len());
        file.sync(SyncFlags::NORMAL).unwrap();

        let mut buf = [0u8; 16];
        assert_eq!(file.read(&mut buf, 0).unwrap(), 16);
        assert_eq!(&buf, data);

        // read past the end zero-fills the tail
        let mut long = [0xffu8; 32];
        assert_eq!(file.read(&mut long, 0).unwrap(), 16);
        assert_eq!(&long[16..], &[0u8; 16]);
    }

    #[test]
    fn test_truncate_and_chunked_growth() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("t.db");
        let vfs = UnixVfs::new();
        let (file, _) = vfs.open(path.to_str(), rw_create()).unwrap();

        file.write(b"0123456789", 0).unwrap();
        file.truncate(4).unwrap();
        assert_eq!(file.file_size().unwrap(), 4);

        file.file_control(FileControlOp::ChunkSize(4096)).unwrap();
        file.truncate(5).unwrap();
        assert_eq!(file.file_size().unwrap(), 4096);

        file.file_control(FileControlOp::SizeHint(6000)).unwrap();
        assert_eq!(file.file_size().unwrap(), 8192);
    }

    #[test]
    fn test_single_handle_lock_ladder() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("lock.db");
        let vfs = UnixVfs::new();
        let (file, _) = vfs.open(path.to_str(), rw_create()).unwrap();

        let level = |f: &Box<dyn VfsFile>| {
            let mut out = LockLevel::None;
            f.file_control(FileControlOp::LockState(&mut out)).unwrap();
            out
        };

        file.lock(LockLevel::Shared).unwrap();
        assert_eq!(level(&file), LockLevel::Shared);
        assert!(!file.check_reserved_lock().unwrap());

        file.lock(LockLevel::Reserved).unwrap();
        assert!(file.check_reserved_lock().unwrap());

        file.lock(LockLevel::Exclusive).unwrap();
        assert_eq!(level(&file), LockLevel::Exclusive);

        file.unlock(LockLevel::Shared).unwrap();
        assert_eq!(level(&file), LockLevel::Shared);
        file.unlock(LockLevel::None).unwrap();
        assert_eq!(level(&file), LockLevel::None);
    }

    #[test]
    fn test_delete_and_access() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("d.db");
        let vfs = UnixVfs::new();
        let (file, _) = vfs.open(path.to_str(), rw_create()).unwrap();
        file.close().unwrap();

        let p = path.to_str().unwrap();
        assert!(vfs.access(p, AccessFlags::EXISTS).unwrap());
        assert!(vfs.access(p, AccessFlags::READWRITE).unwrap());

        vfs.delete(p, true).unwrap();
        assert!(!vfs.access(p, AccessFlags::EXISTS).unwrap());

        let err = vfs.delete(p, false).unwrap_err();
        assert_eq!(err.code, ErrorCode::NotFound);
    }

    #[test]
    fn test_delete_on_close_hides_the_name() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("gone.db");
        let vfs = UnixVfs::new();
        let flags = rw_create() | OpenFlags::DELETEONCLOSE;
        let (file, _) = vfs.open(path.to_str(), flags).unwrap();

        // unlinked at open; the handle still works
        assert!(!vfs.access(path.to_str().unwrap(), AccessFlags::EXISTS).unwrap());
        file.write(b"scratch", 0).unwrap();
        let mut buf = [0u8; 7];
        file.read(&mut buf, 0).unwrap();
        assert_eq!(&buf, b"scratch");
    }

    #[test]
    fn test_anonymous_temp_file() {
        let vfs = UnixVfs::new();
        let (file, _) = vfs.open(None, rw_create()).unwrap();
        file.write(b"temp data", 0).unwrap();
        let mut buf = [0u8; 9];
        file.read(&mut buf, 0).unwrap();
        assert_eq!(&buf, b"temp data");
    }

    #[test]
    fn test_full_pathname_forms() {
        let vfs = UnixVfs::new();
        let mut out = String::new();

        vfs.full_pathname("/tmp/abs.db", &mut out).unwrap();
        assert_eq!(out, "/tmp/abs.db");

        vfs.full_pathname("rel.db", &mut out).unwrap();
        assert!(out.starts_with('/'));
        assert!(out.ends_with("/rel.db"));
    }

    #[test]
    fn test_randomness_and_clock() {
        let vfs = UnixVfs::new();
        let mut a = [0u8; 16];
        let mut b = [0u8; 16];
        assert_eq!(vfs.randomness(&mut a), 16);
        assert_eq!(vfs.randomness(&mut b), 16);
        assert_ne!(a, b);

        let jd = vfs.current_time();
        assert!(jd > 2_400_000.0 && jd < 2_500_000.0);

        let ms = vfs.current_time_i64();
        assert!((ms as f64 / 86_400_000.0 - jd).abs() < 1.0);
    }

    #[test]
    fn test_sleep_waits() {
        let vfs = UnixVfs::new();
        let start = std::time::Instant::now();
        assert_eq!(vfs.sleep(10_000), 10_000);
        assert!(start.elapsed() >= std::time::Duration::from_micros(10_000));
    }
}
