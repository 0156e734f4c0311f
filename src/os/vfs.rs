//! Virtual File System traits and types
//!
//! This module defines the VFS abstraction that keeps the engine portable:
//! a driver trait for OS services, a file trait for handle operations, and
//! the flag sets both sides speak. Platform drivers and test doubles
//! implement these traits; everything above talks only to the traits.

use crate::error::{Error, ErrorCode, Result};
use bitflags::bitflags;

/// Default sector size reported by drivers that do not know better.
pub const DEFAULT_SECTOR_SIZE: i32 = 512;

/// Default bound on the length of a full pathname, in bytes.
pub const DEFAULT_MAX_PATHNAME: i32 = 512;

/// Milliseconds from the Julian-day zero point to the Unix epoch.
/// Add to a Unix millisecond timestamp to get `current_time_i64` form.
pub const UNIX_EPOCH_JULIAN_MS: i64 = 210_866_760_000_000;

// ============================================================================
// Flags and Enums
// ============================================================================

bitflags! {
    /// Flags for opening files
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct OpenFlags: u32 {
        const READONLY         = 0x00000001;
        const READWRITE        = 0x00000002;
        const CREATE           = 0x00000004;
        const DELETEONCLOSE    = 0x00000008;
        const EXCLUSIVE        = 0x00000010;
        const AUTOPROXY        = 0x00000020;
        const URI              = 0x00000040;
        const MEMORY           = 0x00000080;
        const MAIN_DB          = 0x00000100;
        const TEMP_DB          = 0x00000200;
        const TRANSIENT_DB     = 0x00000400;
        const MAIN_JOURNAL     = 0x00000800;
        const TEMP_JOURNAL     = 0x00001000;
        const SUBJOURNAL       = 0x00002000;
        const SUPER_JOURNAL    = 0x00004000;
        const NOMUTEX          = 0x00008000;
        const FULLMUTEX        = 0x00010000;
        const SHAREDCACHE      = 0x00020000;
        const PRIVATECACHE     = 0x00040000;
        const WAL              = 0x00080000;
        const NOFOLLOW         = 0x01000000;
        const EXRESCODE        = 0x02000000;
    }
}

impl OpenFlags {
    /// Check the flag combinations every driver relies on:
    ///
    /// (a) exactly one of READWRITE and READONLY is set,
    /// (b) CREATE requires READWRITE,
    /// (c) EXCLUSIVE requires CREATE,
    /// (d) DELETEONCLOSE requires CREATE.
    pub fn is_valid_combination(self) -> bool {
        let rw = self.contains(OpenFlags::READWRITE);
        let ro = self.contains(OpenFlags::READONLY);
        if rw == ro {
            return false;
        }
        if self.contains(OpenFlags::CREATE) && !rw {
            return false;
        }
        if self.contains(OpenFlags::EXCLUSIVE) && !self.contains(OpenFlags::CREATE) {
            return false;
        }
        if self.contains(OpenFlags::DELETEONCLOSE) && !self.contains(OpenFlags::CREATE) {
            return false;
        }
        true
    }
}

bitflags! {
    /// Flags for checking file access
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct AccessFlags: u32 {
        /// Check if file exists
        const EXISTS = 0;
        /// Check if file is readable and writable
        const READWRITE = 1;
        /// Check if file is readable
        const READ = 2;
    }
}

bitflags! {
    /// Flags for file sync operations
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct SyncFlags: u32 {
        const NORMAL   = 0x00002;
        const FULL     = 0x00003;
        const DATAONLY = 0x00010;
    }
}

bitflags! {
    /// Device characteristics flags
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct DeviceCharacteristics: u32 {
        const ATOMIC                  = 0x00000001;
        const ATOMIC512               = 0x00000002;
        const ATOMIC1K                = 0x00000004;
        const ATOMIC2K                = 0x00000008;
        const ATOMIC4K                = 0x00000010;
        const ATOMIC8K                = 0x00000020;
        const ATOMIC16K               = 0x00000040;
        const ATOMIC32K               = 0x00000080;
        const ATOMIC64K               = 0x00000100;
        const SAFE_APPEND             = 0x00000200;
        const SEQUENTIAL              = 0x00000400;
        const UNDELETABLE_WHEN_OPEN   = 0x00000800;
        const POWERSAFE_OVERWRITE     = 0x00001000;
        const IMMUTABLE               = 0x00002000;
        const BATCH_ATOMIC            = 0x00004000;
    }
}

/// Logical file lock levels, weakest to strongest.
///
/// `Pending` is never requested by callers; the protocol passes through it
/// on the way to `Exclusive` and may park there when the final step fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
#[repr(i32)]
pub enum LockLevel {
    /// No lock held
    #[default]
    None = 0,
    /// Shared lock (multiple readers)
    Shared = 1,
    /// Reserved lock (intend to write)
    Reserved = 2,
    /// Pending lock (waiting for readers to drain)
    Pending = 3,
    /// Exclusive lock (single writer)
    Exclusive = 4,
}

/// File control operations
#[derive(Debug)]
pub enum FileControlOp<'a> {
    /// Report the current lock level
    LockState(&'a mut LockLevel),
    /// Report the last OS error number seen on this handle
    LastErrno(&'a mut i32),
    /// Set the chunk size for incremental growth
    ChunkSize(i32),
    /// Hint the expected final file size; drivers may pre-extend
    SizeHint(i64),
    /// A sync the upper layer decided to skip
    SyncOmitted,
}

// ============================================================================
// VFS File Trait
// ============================================================================

/// An open file handle as seen by the engine.
///
/// Handle methods take `&self`: drivers keep their mutable lock state in
/// interior cells because at most one in-process thread drives lock
/// transitions for a handle at a time.
pub trait VfsFile: Send + Sync {
    /// Read from the file at the given offset
    fn read(&self, buf: &mut [u8], offset: i64) -> Result<usize>;

    /// Write to the file at the given offset
    fn write(&self, buf: &[u8], offset: i64) -> Result<usize>;

    /// Truncate the file to the given size
    fn truncate(&self, size: i64) -> Result<()>;

    /// Flush file content to stable storage
    fn sync(&self, flags: SyncFlags) -> Result<()>;

    /// Current file size in bytes
    fn file_size(&self) -> Result<i64>;

    /// Raise the lock level on this handle
    fn lock(&self, level: LockLevel) -> Result<()>;

    /// Lower the lock level; `level` must be `None` or `Shared`
    fn unlock(&self, level: LockLevel) -> Result<()>;

    /// True if this or any other handle holds a `Reserved` (or stronger) lock
    fn check_reserved_lock(&self) -> Result<bool>;

    /// Driver-specific control and query of the open handle
    fn file_control(&self, _op: FileControlOp<'_>) -> Result<()> {
        Err(Error::new(ErrorCode::NotFound))
    }

    /// Sector size of the underlying device
    fn sector_size(&self) -> i32 {
        DEFAULT_SECTOR_SIZE
    }

    /// Device characteristics
    fn device_characteristics(&self) -> DeviceCharacteristics {
        DeviceCharacteristics::empty()
    }

    /// Close the handle, releasing any locks still held.
    ///
    /// Consumes the handle: a closed file cannot be used again.
    fn close(self: Box<Self>) -> Result<()> {
        Ok(())
    }
}

impl std::fmt::Debug for dyn VfsFile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VfsFile").finish_non_exhaustive()
    }
}

// ============================================================================
// VFS Trait
// ============================================================================

/// A virtual file system driver.
///
/// One implementation per supported platform, plus in-process doubles for
/// tests. Registered drivers are shared as `Arc<dyn Vfs>`.
pub trait Vfs: Send + Sync {
    /// Driver name, the registry key (e.g. "unix", "win32", "memory")
    fn name(&self) -> &str;

    /// Operation-table version; versions below 2 have no 64-bit clock
    fn version(&self) -> i32 {
        3
    }

    /// Upper bound on the length of a full pathname
    fn max_pathname(&self) -> i32 {
        DEFAULT_MAX_PATHNAME
    }

    /// Open a file. `None` means a private temp file the driver names
    /// itself. Returns the handle and the flags actually granted.
    fn open(&self, path: Option<&str>, flags: OpenFlags) -> Result<(Box<dyn VfsFile>, OpenFlags)>;

    /// Delete the named file
    fn delete(&self, path: &str, sync_dir: bool) -> Result<()>;

    /// Query file accessibility
    fn access(&self, path: &str, flags: AccessFlags) -> Result<bool>;

    /// Write the absolute form of `path` into `out`
    fn full_pathname(&self, path: &str, out: &mut String) -> Result<()>;

    /// Fill `buf` with randomness; returns the number of bytes filled
    fn randomness(&self, buf: &mut [u8]) -> i32;

    /// Sleep at least `microseconds`; returns the time actually slept
    fn sleep(&self, microseconds: i32) -> i32;

    /// Current time as a Julian day number
    fn current_time(&self) -> f64;

    /// Current time in milliseconds since the Julian epoch
    fn current_time_i64(&self) -> i64 {
        (self.current_time() * 86_400_000.0) as i64
    }

    /// Most recent OS error on this driver
    fn get_last_error(&self) -> (i32, String) {
        (0, String::new())
    }
}

impl std::fmt::Debug for dyn Vfs {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Vfs").field("name", &self.name()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct StubFile;

    impl VfsFile for StubFile {
        fn read(&self, _buf: &mut [u8], _offset: i64) -> Result<usize> {
            Ok(0)
        }
        fn write(&self, buf: &[u8], _offset: i64) -> Result<usize> {
            Ok(buf.len())
        }
        fn truncate(&self, _size: i64) -> Result<()> {
            Ok(())
        }
        fn sync(&self, _flags: SyncFlags) -> Result<()> {
            Ok(())
        }
        fn file_size(&self) -> Result<i64> {
            Ok(0)
        }
        fn lock(&self, _level: LockLevel) -> Result<()> {
            Ok(())
        }
        fn unlock(&self, _level: LockLevel) -> Result<()> {
            Ok(())
        }
        fn check_reserved_lock(&self) -> Result<bool> {
            Ok(false)
        }
    }

    #[test]
    fn test_lock_level_ordering() {
        assert!(LockLevel::None < LockLevel::Shared);
        assert!(LockLevel::Shared < LockLevel::Reserved);
        assert!(LockLevel::Reserved < LockLevel::Pending);
        assert!(LockLevel::Pending < LockLevel::Exclusive);
        assert_eq!(LockLevel::default(), LockLevel::None);
    }

    #[test]
    fn test_file_defaults() {
        let f = StubFile;
        assert_eq!(f.sector_size(), DEFAULT_SECTOR_SIZE);
        assert!(f.device_characteristics().is_empty());

        let mut level = LockLevel::Exclusive;
        let err = f
            .file_control(FileControlOp::LockState(&mut level))
            .unwrap_err();
        assert_eq!(err.code, ErrorCode::NotFound);

        let boxed: Box<dyn VfsFile> = Box::new(StubFile);
        assert!(boxed.close().is_ok());
    }

    #[test]
    fn test_open_flag_combinations() {
        let ok = OpenFlags::READWRITE | OpenFlags::CREATE;
        assert!(ok.is_valid_combination());

        assert!((OpenFlags::READONLY).is_valid_combination());

        // both access modes at once
        let both = OpenFlags::READWRITE | OpenFlags::READONLY;
        assert!(!both.is_valid_combination());

        // create without write access
        let ro_create = OpenFlags::READONLY | OpenFlags::CREATE;
        assert!(!ro_create.is_valid_combination());

        // exclusive without create
        let excl = OpenFlags::READWRITE | OpenFlags::EXCLUSIVE;
        assert!(!excl.is_valid_combination());

        // delete-on-close without create
        let doc = OpenFlags::READWRITE | OpenFlags::DELETEONCLOSE;
        assert!(!doc.is_valid_combination());
    }

    #[test]
    fn test_current_time_i64_derives_from_current_time() {
        struct FixedClockVfs;
        impl Vfs for FixedClockVfs {
            fn name(&self) -> &str {
                "fixed"
            }
            fn open(
                &self,
                _path: Option<&str>,
                _flags: OpenFlags,
            ) -> Result<(Box<dyn VfsFile>, OpenFlags)> {
                Err(Error::new(ErrorCode::CantOpen))
            }
            fn delete(&self, _path: &str, _sync_dir: bool) -> Result<()> {
                Ok(())
            }
            fn access(&self, _path: &str, _flags: AccessFlags) -> Result<bool> {
                Ok(false)
            }
            fn full_pathname(&self, path: &str, out: &mut String) -> Result<()> {
                out.push_str(path);
                Ok(())
            }
            fn randomness(&self, _buf: &mut [u8]) -> i32 {
                0
            }
            fn sleep(&self, microseconds: i32) -> i32 {
                microseconds
            }
            fn current_time(&self) -> f64 {
                2_440_587.5
            }
        }

        let v = FixedClockVfs;
        assert_eq!(v.current_time_i64(), (2_440_587.5f64 * 86_400_000.0) as i64);
        assert_eq!(v.version(), 3);
        assert_eq!(v.max_pathname(), DEFAULT_MAX_PATHNAME);
    }
}
