//! Windows driver.
//!
//! Byte-range locks map onto `LockFileEx`/`UnlockFileEx` with
//! `LOCKFILE_FAIL_IMMEDIATELY`, which gives real shared range locks, so the
//! whole reader range is locked shared rather than one randomized byte.
//! Handles are opened without `FILE_FLAG_OVERLAPPED`; positioned reads and
//! writes still go through an `OVERLAPPED` offset, which keeps them atomic
//! across threads sharing the handle.

use std::ffi::OsStr;
use std::os::windows::ffi::OsStrExt;
use std::sync::atomic::{AtomicI32, AtomicU32, Ordering};
use std::sync::Mutex;

use crate::error::{Error, ErrorCode, Result};
use crate::os::dispatch::TEMP_FILE_PREFIX;
use crate::os::lockproto::{self, counter_entropy, LockState, RangeKind, RangeLock};
use crate::os::mutex::recover;
use crate::os::vfs::{
    AccessFlags, DeviceCharacteristics, FileControlOp, LockLevel, OpenFlags, SyncFlags, Vfs,
    VfsFile,
};

use windows_sys::Win32::Foundation::{
    CloseHandle, GetLastError, ERROR_ACCESS_DENIED, ERROR_DISK_FULL, ERROR_FILE_NOT_FOUND,
    ERROR_HANDLE_EOF, ERROR_INVALID_PARAMETER, ERROR_LOCK_VIOLATION, ERROR_PATH_NOT_FOUND,
    ERROR_SHARING_VIOLATION, ERROR_WRITE_PROTECT, FILETIME, GENERIC_READ, GENERIC_WRITE, HANDLE,
    INVALID_HANDLE_VALUE,
};
use windows_sys::Win32::Security::Cryptography::{
    CryptAcquireContextW, CryptGenRandom, CryptReleaseContext, CRYPT_VERIFYCONTEXT, PROV_RSA_FULL,
};
use windows_sys::Win32::Storage::FileSystem::{
    CreateFileW, DeleteFileW, FlushFileBuffers, GetFileAttributesW, GetFileSizeEx,
    GetFullPathNameW, GetTempFileNameW, GetTempPathW, LockFileEx, ReadFile, SetEndOfFile,
    SetFilePointerEx, UnlockFileEx, WriteFile, CREATE_NEW, FILE_ATTRIBUTE_NORMAL,
    FILE_ATTRIBUTE_READONLY, FILE_ATTRIBUTE_TEMPORARY, FILE_BEGIN, FILE_FLAG_DELETE_ON_CLOSE,
    FILE_FLAG_RANDOM_ACCESS, FILE_SHARE_DELETE, FILE_SHARE_READ, FILE_SHARE_WRITE,
    INVALID_FILE_ATTRIBUTES, LOCKFILE_EXCLUSIVE_LOCK, LOCKFILE_FAIL_IMMEDIATELY, OPEN_ALWAYS,
    OPEN_EXISTING,
};
use windows_sys::Win32::System::SystemInformation::{GetSystemTimeAsFileTime, GetTickCount64};
use windows_sys::Win32::System::Threading::Sleep;
use windows_sys::Win32::System::IO::{OVERLAPPED, OVERLAPPED_0, OVERLAPPED_0_0};

const MAX_PATH_LEN: usize = 260;
const FILE_SHARE_FLAGS: u32 = FILE_SHARE_READ | FILE_SHARE_WRITE | FILE_SHARE_DELETE;
const SECTOR_SIZE: i32 = 4096;
const DELETE_ATTEMPTS: u32 = 3;

/// Julian-day milliseconds at the FILETIME epoch, 1601-01-01.
const FILETIME_EPOCH_JULIAN_MS: i64 = 199_222_286_400_000;

fn error_from_win32_code(code: u32) -> Error {
    let msg = std::io::Error::from_raw_os_error(code as i32).to_string();
    let mapped = match code {
        ERROR_ACCESS_DENIED => ErrorCode::Perm,
        ERROR_FILE_NOT_FOUND | ERROR_PATH_NOT_FOUND => ErrorCode::CantOpen,
        ERROR_DISK_FULL => ErrorCode::Full,
        ERROR_WRITE_PROTECT => ErrorCode::ReadOnly,
        ERROR_LOCK_VIOLATION | ERROR_SHARING_VIOLATION => ErrorCode::Busy,
        ERROR_INVALID_PARAMETER => ErrorCode::Misuse,
        _ => ErrorCode::IoErr,
    };

    Error::with_message(mapped, msg)
}

fn error_from_win32() -> Error {
    let code = unsafe { GetLastError() };
    error_from_win32_code(code)
}

fn to_utf16(path: &str) -> Vec<u16> {
    OsStr::new(path)
        .encode_wide()
        .chain(std::iter::once(0))
        .collect()
}

fn overlapped_at(offset: u64) -> OVERLAPPED {
    OVERLAPPED {
        Internal: 0,
        InternalHigh: 0,
        Anonymous: OVERLAPPED_0 {
            Anonymous: OVERLAPPED_0_0 {
                Offset: (offset & 0xffff_ffff) as u32,
                OffsetHigh: (offset >> 32) as u32,
            },
        },
        hEvent: 0,
    }
}

fn filetime_now() -> u64 {
    let mut ft = FILETIME {
        dwLowDateTime: 0,
        dwHighDateTime: 0,
    };
    unsafe { GetSystemTimeAsFileTime(&mut ft) };
    ((ft.dwHighDateTime as u64) << 32) | (ft.dwLowDateTime as u64)
}

// ============================================================================
// Windows VFS
// ============================================================================

/// The Win32 driver, registry name "win32".
pub struct WinVfs {
    entropy: AtomicU32,
}

impl WinVfs {
    pub fn new() -> Self {
        Self {
            entropy: AtomicU32::new((filetime_now() as u32) | 1),
        }
    }

    /// `GetTempFileNameW` both names and creates the file, so the open that
    /// follows uses OPEN_ALWAYS.
    fn create_temp_file(&self) -> Result<String> {
        let mut temp_path = vec![0u16; MAX_PATH_LEN + 1];
        let len = unsafe { GetTempPathW(temp_path.len() as u32, temp_path.as_mut_ptr()) };
        if len == 0 || len as usize >= temp_path.len() {
            return Err(error_from_win32());
        }

        let mut prefix = [0u16; 4];
        for (dst, ch) in prefix.iter_mut().zip(TEMP_FILE_PREFIX.chars()) {
            *dst = ch as u16;
        }
        prefix[3] = 0;

        let mut temp_file = vec![0u16; MAX_PATH_LEN + 1];
        let rc = unsafe {
            GetTempFileNameW(
                temp_path.as_ptr(),
                prefix.as_ptr(),
                0,
                temp_file.as_mut_ptr(),
            )
        };
        if rc == 0 {
            return Err(error_from_win32());
        }

        let end = temp_file.iter().position(|&c| c == 0).unwrap_or(0);
        Ok(String::from_utf16_lossy(&temp_file[..end]))
    }
}

impl Default for WinVfs {
    fn default() -> Self {
        Self::new()
    }
}

impl Vfs for WinVfs {
    fn name(&self) -> &str {
        "win32"
    }

    fn max_pathname(&self) -> i32 {
        MAX_PATH_LEN as i32
    }

    fn open(&self, path: Option<&str>, flags: OpenFlags) -> Result<(Box<dyn VfsFile>, OpenFlags)> {
        debug_assert!(flags.is_valid_combination());

        let desired_access = if flags.contains(OpenFlags::READONLY) {
            GENERIC_READ
        } else {
            GENERIC_READ | GENERIC_WRITE
        };

        let (path_str, delete_on_close) = match path {
            Some(p) if !p.is_empty() => (p.to_string(), flags.contains(OpenFlags::DELETEONCLOSE)),
            _ => (self.create_temp_file()?, true),
        };

        let mut attributes = FILE_FLAG_RANDOM_ACCESS;
        if delete_on_close {
            // the OS drops the file with the last handle
            attributes |= FILE_ATTRIBUTE_TEMPORARY | FILE_FLAG_DELETE_ON_CLOSE;
        } else {
            attributes |= FILE_ATTRIBUTE_NORMAL;
        }

        let creation = if flags.contains(OpenFlags::EXCLUSIVE) {
            CREATE_NEW
        } else if flags.contains(OpenFlags::CREATE) {
            OPEN_ALWAYS
        } else {
            OPEN_EXISTING
        };

        let wide_path = to_utf16(&path_str);
        let handle = unsafe {
            CreateFileW(
                wide_path.as_ptr(),
                desired_access,
                FILE_SHARE_FLAGS,
                std::ptr::null(),
                creation,
                attributes,
                0,
            )
        };

        if handle == INVALID_HANDLE_VALUE {
            return Err(error_from_win32());
        }

        let file = WinFile {
            handle,
            readonly: flags.contains(OpenFlags::READONLY),
            state: Mutex::new(LockState::default()),
            chunk_size: AtomicI32::new(0),
            last_errno: AtomicI32::new(0),
            entropy: AtomicU32::new(counter_entropy(&self.entropy) | 1),
        };
        Ok((Box::new(file), flags))
    }

    fn delete(&self, path: &str, _sync_dir: bool) -> Result<()> {
        let wide_path = to_utf16(path);

        // a handle being closed elsewhere may still pin the name briefly
        for _ in 0..DELETE_ATTEMPTS {
            let rc = unsafe { DeleteFileW(wide_path.as_ptr()) };
            if rc != 0 {
                return Ok(());
            }

            let err = unsafe { GetLastError() };
            if err == ERROR_FILE_NOT_FOUND || err == ERROR_PATH_NOT_FOUND {
                return Err(Error::with_message(ErrorCode::NotFound, "no such file"));
            }
            if err != ERROR_SHARING_VIOLATION {
                return Err(error_from_win32_code(err));
            }

            std::thread::sleep(std::time::Duration::from_millis(100));
        }

        Err(error_from_win32())
    }

    fn access(&self, path: &str, flags: AccessFlags) -> Result<bool> {
        let wide_path = to_utf16(path);
        let attrs = unsafe { GetFileAttributesW(wide_path.as_ptr()) };

        if attrs == INVALID_FILE_ATTRIBUTES {
            let err = unsafe { GetLastError() };
            if err == ERROR_FILE_NOT_FOUND || err == ERROR_PATH_NOT_FOUND {
                return Ok(false);
            }
            return Err(error_from_win32_code(err));
        }

        if flags.contains(AccessFlags::READWRITE) {
            return Ok((attrs & FILE_ATTRIBUTE_READONLY) == 0);
        }

        Ok(true)
    }

    fn full_pathname(&self, path: &str, out: &mut String) -> Result<()> {
        let wide_path = to_utf16(path);
        let mut buf = vec![0u16; self.max_pathname() as usize];

        let mut len = unsafe {
            GetFullPathNameW(
                wide_path.as_ptr(),
                buf.len() as u32,
                buf.as_mut_ptr(),
                std::ptr::null_mut(),
            )
        };

        if len == 0 {
            return Err(error_from_win32());
        }

        if len as usize >= buf.len() {
            buf.resize(len as usize + 1, 0);
            len = unsafe {
                GetFullPathNameW(
                    wide_path.as_ptr(),
                    buf.len() as u32,
                    buf.as_mut_ptr(),
                    std::ptr::null_mut(),
                )
            };
            if len == 0 {
                return Err(error_from_win32());
            }
        }

        out.clear();
        out.push_str(&String::from_utf16_lossy(&buf[..len as usize]));
        Ok(())
    }

    fn randomness(&self, buf: &mut [u8]) -> i32 {
        unsafe {
            let mut prov: usize = 0;
            if CryptAcquireContextW(
                &mut prov as *mut _,
                std::ptr::null(),
                std::ptr::null(),
                PROV_RSA_FULL,
                CRYPT_VERIFYCONTEXT,
            ) != 0
            {
                let rc = CryptGenRandom(prov, buf.len() as u32, buf.as_mut_ptr());
                CryptReleaseContext(prov, 0);
                if rc != 0 {
                    return buf.len() as i32;
                }
            }
        }

        // no crypto provider; stretch the tick counter instead
        let tick = unsafe { GetTickCount64() };
        for (i, byte) in buf.iter_mut().enumerate() {
            *byte = ((tick >> ((i % 8) * 8)) ^ (i as u64)) as u8;
        }
        buf.len() as i32
    }

    fn sleep(&self, microseconds: i32) -> i32 {
        let milliseconds = (microseconds + 999) / 1000;
        unsafe { Sleep(milliseconds as u32) };
        milliseconds * 1000
    }

    fn current_time(&self) -> f64 {
        self.current_time_i64() as f64 / 86_400_000.0
    }

    fn current_time_i64(&self) -> i64 {
        FILETIME_EPOCH_JULIAN_MS + (filetime_now() / 10_000) as i64
    }

    fn get_last_error(&self) -> (i32, String) {
        let err = unsafe { GetLastError() };
        let msg = std::io::Error::from_raw_os_error(err as i32).to_string();
        (err as i32, msg)
    }
}

// ============================================================================
// Windows File Handle
// ============================================================================

pub struct WinFile {
    handle: HANDLE,
    readonly: bool,
    state: Mutex<LockState>,
    chunk_size: AtomicI32,
    last_errno: AtomicI32,
    entropy: AtomicU32,
}

impl WinFile {
    fn note_error(&self, err: u32) -> Error {
        self.last_errno.store(err as i32, Ordering::Relaxed);
        error_from_win32_code(err)
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

    fn raw_size(&self) -> Result<i64> {
        let mut size: i64 = 0;
        let rc = unsafe { GetFileSizeEx(self.handle, &mut size as *mut _ as *mut _) };
        if rc == 0 {
            return Err(self.note_error(unsafe { GetLastError() }));
        }
        Ok(size)
    }

    fn set_end_of_file(&self, size: i64) -> Result<()> {
        let rc = unsafe { SetFilePointerEx(self.handle, size, std::ptr::null_mut(), FILE_BEGIN) };
        if rc == 0 {
            return Err(self.note_error(unsafe { GetLastError() }));
        }
        let rc = unsafe { SetEndOfFile(self.handle) };
        if rc == 0 {
            return Err(self.note_error(unsafe { GetLastError() }));
        }
        Ok(())
    }
}

impl RangeLock for WinFile {
    fn acquire(&self, offset: u64, len: u64, kind: RangeKind) -> Result<()> {
        let mut flags = LOCKFILE_FAIL_IMMEDIATELY;
        if kind == RangeKind::Exclusive {
            flags |= LOCKFILE_EXCLUSIVE_LOCK;
        }

        let mut overlapped = overlapped_at(offset);
        let rc = unsafe {
            LockFileEx(
                self.handle,
                flags,
                0,
                (len & 0xffff_ffff) as u32,
                (len >> 32) as u32,
                &mut overlapped,
            )
        };
        if rc == 0 {
            return Err(self.note_error(unsafe { GetLastError() }));
        }
        Ok(())
    }

    fn release(&self, offset: u64, len: u64) -> Result<()> {
        let mut overlapped = overlapped_at(offset);
        let rc = unsafe {
            UnlockFileEx(
                self.handle,
                0,
                (len & 0xffff_ffff) as u32,
                (len >> 32) as u32,
                &mut overlapped,
            )
        };
        if rc == 0 {
            return Err(self.note_error(unsafe { GetLastError() }));
        }
        Ok(())
    }

    fn entropy32(&self) -> u32 {
        counter_entropy(&self.entropy)
    }
}

impl VfsFile for WinFile {
    fn read(&self, buf: &mut [u8], offset: i64) -> Result<usize> {
        let mut overlapped = overlapped_at(offset as u64);
        let mut bytes_read: u32 = 0;
        let rc = unsafe {
            ReadFile(
                self.handle,
                buf.as_mut_ptr() as *mut _,
                buf.len() as u32,
                &mut bytes_read,
                &mut overlapped,
            )
        };

        if rc == 0 {
            let err = unsafe { GetLastError() };
            if err != ERROR_HANDLE_EOF {
                return Err(self.note_error(err));
            }
        }

        // short reads leave the tail zeroed
        if (bytes_read as usize) < buf.len() {
            buf[bytes_read as usize..].fill(0);
        }
        Ok(bytes_read as usize)
    }

    fn write(&self, buf: &[u8], offset: i64) -> Result<usize> {
        if self.readonly {
            return Err(Error::with_message(
                ErrorCode::ReadOnly,
                "write on read-only handle",
            ));
        }

        let mut overlapped = overlapped_at(offset as u64);
        let mut bytes_written: u32 = 0;
        let rc = unsafe {
            WriteFile(
                self.handle,
                buf.as_ptr() as *const _,
                buf.len() as u32,
                &mut bytes_written,
                &mut overlapped,
            )
        };

        if rc == 0 {
            return Err(self.note_error(unsafe { GetLastError() }));
        }
        if (bytes_written as usize) != buf.len() {
            return Err(Error::with_message(ErrorCode::Full, "short write"));
        }
        Ok(bytes_written as usize)
    }

    fn truncate(&self, size: i64) -> Result<()> {
        if self.readonly {
            return Err(Error::with_message(
                ErrorCode::ReadOnly,
                "truncate on read-only handle",
            ));
        }
        self.set_end_of_file(self.rounded_size(size))
    }

    fn sync(&self, _flags: SyncFlags) -> Result<()> {
        let rc = unsafe { FlushFileBuffers(self.handle) };
        if rc == 0 {
            return Err(self.note_error(unsafe { GetLastError() }));
        }
        Ok(())
    }

    fn file_size(&self) -> Result<i64> {
        self.raw_size()
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
                let current = self.raw_size()?;
                let target = self.rounded_size(n);
                if target > current {
                    self.set_end_of_file(target)?;
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
        DeviceCharacteristics::UNDELETABLE_WHEN_OPEN | DeviceCharacteristics::POWERSAFE_OVERWRITE
    }
}

impl Drop for WinFile {
    fn drop(&mut self) {
        {
            let mut state = recover(self.state.lock());
            if state.level != LockLevel::None {
                let _ = lockproto::unlock(&*self, &mut state, LockLevel::None);
            }
        }
        unsafe {
            if self.handle != 0 {
                CloseHandle(self.handle);
            }
        }
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
        let vfs = WinVfs::new();
        assert_eq!(vfs.name(), "win32");
        assert_eq!(vfs.max_pathname(), MAX_PATH_LEN as i32);
    }

    #[test]
    fn test_read_write_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("rw.db");
        let vfs = WinVfs::new();
        let (file, _) = vfs.open(path.to_str(), rw_create()).unwrap();

        let data = b"persistent bytes";
        assert_eq!(file.write(data, 0).unwrap(), data.len());
        file.sync(SyncFlags::NORMAL).unwrap();

        let mut buf = [0u8; 16];
        assert_eq!(file.read(&mut buf, 0).unwrap(), 16);
        assert_eq!(&buf, data);
    }

    #[test]
    fn test_single_handle_lock_ladder() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("lock.db");
        let vfs = WinVfs::new();
        let (file, _) = vfs.open(path.to_str(), rw_create()).unwrap();

        file.lock(LockLevel::Shared).unwrap();
        file.lock(LockLevel::Reserved).unwrap();
        assert!(file.check_reserved_lock().unwrap());
        file.lock(LockLevel::Exclusive).unwrap();
        file.unlock(LockLevel::Shared).unwrap();
        file.unlock(LockLevel::None).unwrap();
        assert!(!file.check_reserved_lock().unwrap());
    }

    #[test]
    fn test_cross_handle_contention() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("con.db");
        let vfs = WinVfs::new();
        let (a, _) = vfs.open(path.to_str(), rw_create()).unwrap();
        let (b, _) = vfs.open(path.to_str(), rw_create()).unwrap();

        a.lock(LockLevel::Shared).unwrap();
        b.lock(LockLevel::Shared).unwrap();

        let err = a.lock(LockLevel::Exclusive).unwrap_err();
        assert_eq!(err.code, ErrorCode::Busy);

        b.unlock(LockLevel::None).unwrap();
        a.lock(LockLevel::Exclusive).unwrap();
    }

    #[test]
    fn test_delete_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("absent.db");
        let vfs = WinVfs::new();
        let err = vfs.delete(path.to_str().unwrap(), false).unwrap_err();
        assert_eq!(err.code, ErrorCode::NotFound);
    }

    #[test]
    fn test_clock_epoch() {
        let vfs = WinVfs::new();
        let jd = vfs.current_time();
        assert!(jd > 2_400_000.0 && jd < 2_500_000.0);
    }
}
