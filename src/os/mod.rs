//! OS abstraction layer: drivers, locking protocol, and dispatch.
//!
//! The engine never calls the platform directly. It goes through [`Env`]
//! dispatch wrappers, which resolve a [`vfs::Vfs`] driver out of the
//! registry and add the cross-cutting pieces (flag masking, pathname
//! bounds, fault injection). Drivers enforce the shared byte-range locking
//! protocol in [`lockproto`].
//!
//! [`Env`]: crate::env::Env

pub mod dispatch;
pub mod lockproto;
pub mod memory;
pub mod mutex;
pub mod registry;
pub mod vfs;

#[cfg(unix)]
pub mod unix;

#[cfg(windows)]
pub mod windows;

use std::sync::Arc;

use crate::env::EnvInner;
use crate::error::Result;

/// Install the drivers compiled into this build. The platform driver is the
/// default; the memory driver is always present under its own name and
/// becomes the default only when no platform driver exists.
pub(crate) fn register_builtin_drivers(inner: &EnvInner) -> Result<()> {
    inner.with_registry(|registry| {
        #[cfg(unix)]
        registry.register(Arc::new(unix::UnixVfs::new()), true);

        #[cfg(windows)]
        registry.register(Arc::new(windows::WinVfs::new()), true);

        registry.register(
            Arc::new(memory::MemVfs::new(inner.record_pool.clone())),
            false,
        );
    });
    Ok(())
}
