//! Driver registry.
//!
//! An ordered list of registered drivers whose head is the current default.
//! The container itself is lock-free; the owning context serializes every
//! call through the master static mutex.

use std::sync::Arc;

use crate::error::{Error, ErrorCode, Result};
use crate::os::vfs::Vfs;

/// Registered drivers, default first.
#[derive(Default)]
pub struct VfsRegistry {
    list: Vec<Arc<dyn Vfs>>,
}

impl VfsRegistry {
    pub fn new() -> Self {
        VfsRegistry { list: Vec::new() }
    }

    /// Link a driver, unlinking any previous registration of the same
    /// instance first. The new entry becomes the default when asked to, or
    /// when it is the only entry; otherwise it slots in right behind the
    /// default.
    pub fn register(&mut self, vfs: Arc<dyn Vfs>, make_default: bool) {
        self.unlink(&vfs);
        if make_default || self.list.is_empty() {
            self.list.insert(0, vfs);
        } else {
            self.list.insert(1, vfs);
        }
    }

    /// Unlink a driver by identity. Absent entries are a no-op. If the
    /// default is removed, the next entry becomes the default.
    pub fn unregister(&mut self, vfs: &Arc<dyn Vfs>) {
        self.unlink(vfs);
    }

    fn unlink(&mut self, vfs: &Arc<dyn Vfs>) {
        self.list.retain(|v| !Arc::ptr_eq(v, vfs));
    }

    /// Look up a driver. `None` or an empty name means the current default;
    /// otherwise the name must match exactly, case-sensitively.
    pub fn find(&self, name: Option<&str>) -> Result<Arc<dyn Vfs>> {
        match name {
            None | Some("") => self.list.first().cloned(),
            Some(name) => self.list.iter().find(|v| v.name() == name).cloned(),
        }
        .ok_or_else(|| Error::with_message(ErrorCode::NotFound, "no such vfs"))
    }

    pub fn default_vfs(&self) -> Option<Arc<dyn Vfs>> {
        self.list.first().cloned()
    }

    pub fn len(&self) -> usize {
        self.list.len()
    }

    pub fn is_empty(&self) -> bool {
        self.list.is_empty()
    }

    /// Registered names in list order, for diagnostics.
    pub fn names(&self) -> Vec<String> {
        self.list.iter().map(|v| v.name().to_owned()).collect()
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::os::vfs::{AccessFlags, OpenFlags, VfsFile};

    struct NamedVfs {
        name: String,
    }

    impl NamedVfs {
        fn new(name: &str) -> Arc<dyn Vfs> {
            Arc::new(NamedVfs {
                name: name.to_owned(),
            })
        }
    }

    impl Vfs for NamedVfs {
        fn name(&self) -> &str {
            &self.name
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
            0.0
        }
    }

    #[test]
    fn test_first_registration_is_default() {
        let mut reg = VfsRegistry::new();
        let a = NamedVfs::new("a");
        reg.register(a.clone(), false);
        assert!(Arc::ptr_eq(&reg.find(None).unwrap(), &a));
        assert_eq!(reg.len(), 1);
    }

    #[test]
    fn test_make_default_moves_to_head() {
        let mut reg = VfsRegistry::new();
        let a = NamedVfs::new("a");
        let b = NamedVfs::new("b");
        reg.register(a.clone(), true);
        reg.register(b.clone(), true);
        assert!(Arc::ptr_eq(&reg.find(None).unwrap(), &b));

        // non-default registration keeps the head
        let c = NamedVfs::new("c");
        reg.register(c.clone(), false);
        assert!(Arc::ptr_eq(&reg.find(None).unwrap(), &b));
        assert_eq!(reg.names(), vec!["b", "c", "a"]);
    }

    #[test]
    fn test_reregister_is_idempotent() {
        let mut reg = VfsRegistry::new();
        let a = NamedVfs::new("a");
        let b = NamedVfs::new("b");
        reg.register(a.clone(), true);
        reg.register(b.clone(), false);

        reg.register(a.clone(), true);
        assert_eq!(reg.len(), 2);
        assert!(Arc::ptr_eq(&reg.find(None).unwrap(), &a));

        reg.register(a.clone(), false);
        assert_eq!(reg.len(), 2);
        // re-linked behind the new head
        assert_eq!(reg.names(), vec!["b", "a"]);
    }

    #[test]
    fn test_find_by_name_is_exact() {
        let mut reg = VfsRegistry::new();
        let a = NamedVfs::new("alpha");
        reg.register(a.clone(), true);

        assert!(Arc::ptr_eq(&reg.find(Some("alpha")).unwrap(), &a));
        assert_eq!(
            reg.find(Some("Alpha")).unwrap_err().code,
            ErrorCode::NotFound
        );
        assert!(Arc::ptr_eq(&reg.find(Some("")).unwrap(), &a));
    }

    #[test]
    fn test_unregister_promotes_next() {
        let mut reg = VfsRegistry::new();
        let a = NamedVfs::new("a");
        let b = NamedVfs::new("b");
        reg.register(a.clone(), true);
        reg.register(b.clone(), true);

        reg.unregister(&b);
        assert!(Arc::ptr_eq(&reg.find(None).unwrap(), &a));
        assert_eq!(
            reg.find(Some("b")).unwrap_err().code,
            ErrorCode::NotFound
        );

        // absent entry is a no-op
        reg.unregister(&b);
        assert_eq!(reg.len(), 1);
    }

    #[test]
    fn test_empty_registry_finds_nothing() {
        let reg = VfsRegistry::new();
        assert_eq!(reg.find(None).unwrap_err().code, ErrorCode::NotFound);
        assert_eq!(reg.find(Some("x")).unwrap_err().code, ErrorCode::NotFound);
    }
}
