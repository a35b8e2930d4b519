//! Prologue patching: redirect a compiled function to a replacement and
//! restore it later.
//!
//! A patch overwrites the first [`PATCH_SIZE`] bytes of the target with an
//! absolute jump to a small arena stub, which in turn jumps to the
//! replacement. The original bytes are snapshotted in a process-global
//! registry keyed by target address, so a patch can be toggled off and on
//! (to call through to the original) and fully removed. Swapping in a new
//! replacement only rewrites the stub, never the target prologue.

use crate::arch::{self, PATCH_SIZE};
use crate::code::arena::{self, STUB_SLOT};
use crate::code::patcher::patch_code;
use crate::symbol::{self, ResolveScope};
use crate::types::{FnPtr, MockError, Result};
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, OnceLock};

struct PatchRecord {
    original: [u8; PATCH_SIZE],
    stub: usize,
    applied: bool,
    hook_count: u64,
}

fn registry() -> MutexGuard<'static, HashMap<usize, PatchRecord>> {
    static REGISTRY: OnceLock<Mutex<HashMap<usize, PatchRecord>>> = OnceLock::new();
    REGISTRY
        .get_or_init(|| Mutex::new(HashMap::new()))
        .lock()
        .unwrap_or_else(|e| e.into_inner())
}

fn write_redirect(target: usize, dest: usize) -> Result<()> {
    let enc = arch::encoder()?;
    let mut staged = [0u8; PATCH_SIZE];
    unsafe {
        (enc.emit_redirect)(
            staged.as_mut_ptr(),
            staged.len(),
            target as u64,
            dest as u64,
        );
        patch_code(target as *mut u8, PATCH_SIZE, |p| {
            core::ptr::copy_nonoverlapping(staged.as_ptr(), p, PATCH_SIZE);
        })
    }
}

fn emit_stub(stub: usize, dest: usize) -> Result<()> {
    let enc = arch::encoder()?;
    let mut staged = [0u8; STUB_SLOT];
    unsafe {
        let used = (enc.emit_direct_stub)(staged.as_mut_ptr(), staged.len(), stub as u64, dest as u64);
        patch_code(stub as *mut u8, used, |p| {
            core::ptr::copy_nonoverlapping(staged.as_ptr(), p, used);
        })
    }
}

fn write_original(target: usize, original: &[u8; PATCH_SIZE]) -> Result<()> {
    unsafe {
        patch_code(target as *mut u8, PATCH_SIZE, |p| {
            core::ptr::copy_nonoverlapping(original.as_ptr(), p, PATCH_SIZE);
        })
    }
}

/// Redirect `target` to `replacement`.
///
/// Both must be the same function-pointer type, so a signature mismatch is
/// a compile error rather than a crash. Patching an already-patched target
/// swaps in the new replacement; the original prologue snapshot is kept
/// from the first patch.
pub fn patch<F: FnPtr>(target: F, replacement: F) -> Result<PatchGuard> {
    unsafe { patch_addr(target.addr(), replacement.addr()) }
}

/// Redirect the function at `target` to the one at `replacement`, with no
/// signature checking.
///
/// # Safety
/// Both addresses must point at functions with identical signatures and
/// calling conventions, and `target` must begin with at least
/// [`PATCH_SIZE`] bytes of patchable prologue.
pub unsafe fn patch_addr(target: usize, replacement: usize) -> Result<PatchGuard> {
    let target = symbol::resolve_fn_addr(target)?;
    let replacement = symbol::resolve_fn_addr(replacement)?;
    if target == replacement {
        return Err(MockError::InvalidTarget);
    }

    let mut map = registry();
    match map.get_mut(&target) {
        Some(rec) => {
            // Rewriting the stub is enough; the prologue already jumps there
            // unless the patch is parked.
            emit_stub(rec.stub, replacement)?;
            if !rec.applied {
                write_redirect(target, rec.stub)?;
                rec.applied = true;
            }
            rec.hook_count += 1;
        }
        None => {
            let slot = arena::acquire_slot()?;
            emit_stub(slot.addr, replacement)?;
            let original = core::ptr::read_unaligned(target as *const [u8; PATCH_SIZE]);
            write_redirect(target, slot.addr)?;
            map.insert(
                target,
                PatchRecord {
                    original,
                    stub: slot.addr,
                    applied: true,
                    hook_count: 1,
                },
            );
        }
    }
    log::debug!("patched {target:#x} -> {replacement:#x}");
    Ok(PatchGuard { target })
}

/// Resolve `name` and redirect it to `replacement`.
///
/// # Safety
/// The symbol must name a function whose signature and calling convention
/// match `replacement`.
pub unsafe fn patch_symbol<F: FnPtr>(
    name: &str,
    scope: &ResolveScope,
    replacement: F,
) -> Result<PatchGuard> {
    let target = symbol::resolve_symbol(name, scope)?;
    patch_addr(target, replacement.addr())
}

/// Redirect `TypeName::method` to `replacement`. The replacement receives
/// the receiver as its first argument.
///
/// # Safety
/// Same contract as [`patch_symbol`].
pub unsafe fn patch_instance_method<F: FnPtr>(
    type_name: &str,
    method: &str,
    replacement: F,
) -> Result<PatchGuard> {
    let symbol = format!("{type_name}::{method}");
    patch_symbol(&symbol, &ResolveScope::Global, replacement)
}

/// Remove the patch on `target`, restoring the original prologue.
/// Returns false when the target was not patched.
pub fn unpatch<F: FnPtr>(target: F) -> bool {
    unpatch_addr(target.addr())
}

/// Address-based variant of [`unpatch`]. Also false when the restore write
/// fails; the record is kept so the unpatch can be retried.
pub fn unpatch_addr(target: usize) -> bool {
    let Ok(target) = symbol::resolve_fn_addr(target) else {
        return false;
    };
    let mut map = registry();
    let Some(rec) = map.get(&target) else {
        return false;
    };
    // Restore first; dropping the record before the prologue is back would
    // lose the original bytes while the target stays patched.
    if rec.applied {
        if let Err(e) = write_original(target, &rec.original) {
            log::warn!("failed to restore {target:#x}: {e}");
            return false;
        }
    }
    map.remove(&target);
    log::debug!("unpatched {target:#x}");
    true
}

/// Remove the patch on a symbol resolved the same way [`patch_symbol`]
/// resolves it.
pub fn unpatch_symbol(name: &str, scope: &ResolveScope) -> Result<bool> {
    let target = symbol::resolve_symbol(name, scope)?;
    Ok(unpatch_addr(target))
}

/// Remove the patch on `TypeName::method`.
pub fn unpatch_instance_method(type_name: &str, method: &str) -> Result<bool> {
    let symbol = format!("{type_name}::{method}");
    unpatch_symbol(&symbol, &ResolveScope::Global)
}

/// Remove every live patch, restoring all original prologues. Records whose
/// restore write fails stay registered for a retry.
pub fn unpatch_all() {
    let mut map = registry();
    map.retain(|&target, rec| {
        if rec.applied {
            if let Err(e) = write_original(target, &rec.original) {
                log::warn!("failed to restore {target:#x}: {e}");
                return true;
            }
        }
        false
    });
}

/// Handle to one live patch. Copyable; the state lives in the registry.
#[derive(Debug, Clone, Copy)]
pub struct PatchGuard {
    target: usize,
}

impl PatchGuard {
    pub fn target(&self) -> usize {
        self.target
    }

    /// Re-apply the redirect after [`PatchGuard::restore`].
    pub fn apply(&self) -> Result<()> {
        let mut map = registry();
        let rec = map.get_mut(&self.target).ok_or(MockError::InvalidTarget)?;
        if !rec.applied {
            write_redirect(self.target, rec.stub)?;
            rec.applied = true;
            rec.hook_count += 1;
        }
        Ok(())
    }

    /// Put the original prologue back without forgetting the patch, so the
    /// original function can be called through.
    pub fn restore(&self) -> Result<()> {
        let mut map = registry();
        let rec = map.get_mut(&self.target).ok_or(MockError::InvalidTarget)?;
        if rec.applied {
            write_original(self.target, &rec.original)?;
            rec.applied = false;
        }
        Ok(())
    }

    /// Remove the patch entirely. Returns false when already removed.
    pub fn unpatch(&self) -> bool {
        unpatch_addr(self.target)
    }

    /// How many times the redirect has been (re-)applied.
    pub fn hook_count(&self) -> u64 {
        registry().get(&self.target).map_or(0, |r| r.hook_count)
    }
}
