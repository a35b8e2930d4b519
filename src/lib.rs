//! remock: runtime function interception for tests.
//!
//! Patches compiled functions in place so calls land in a replacement, and
//! forges trait-object dispatch tables so individual methods can be mocked
//! without touching the rest of the object. Everything is reversible:
//! guards and the [`mock::Builder`] session restore the original bytes.

pub mod arch;
pub mod code;
pub mod iface;
pub mod mock;
pub mod patch;
pub mod symbol;
pub mod types;

// Re-exports for convenience (flattened imports)
pub use iface::proxy::ProxyHandler;
pub use iface::{IfaceContext, InterfaceDesc, MethodDesc};
pub use mock::{Builder, FuncMocker};
pub use patch::{
    patch, patch_addr, patch_instance_method, patch_symbol, unpatch, unpatch_addr,
    unpatch_all, unpatch_instance_method, unpatch_symbol, PatchGuard,
};
pub use symbol::{resolve_symbol, ResolveScope};
pub use types::{ExportInfo, FnPtr, MockError, ModuleInfo, Result};

use std::sync::atomic::{AtomicBool, Ordering};

static DEBUG: AtomicBool = AtomicBool::new(false);

/// Enable verbose patch tracing for this process.
pub fn open_debug() {
    DEBUG.store(true, Ordering::Relaxed);
}

pub fn close_debug() {
    DEBUG.store(false, Ordering::Relaxed);
}

/// Tracing is on when [`open_debug`] was called or REMOCK_DEBUG is set.
pub(crate) fn debug_enabled() -> bool {
    DEBUG.load(Ordering::Relaxed) || std::env::var_os("REMOCK_DEBUG").is_some()
}

/// Process-global lock for tests that modify executable code.
///
/// All tests that patch functions or rewrite vtable pointers must hold this
/// lock to prevent SIGSEGV from concurrent rewrites of the same bytes.
#[cfg(test)]
pub(crate) fn lock_hook_tests() -> std::sync::MutexGuard<'static, ()> {
    use std::sync::{Mutex, OnceLock};
    static LOCK: OnceLock<Mutex<()>> = OnceLock::new();
    LOCK.get_or_init(|| Mutex::new(())).lock().unwrap_or_else(|e| e.into_inner())
}
