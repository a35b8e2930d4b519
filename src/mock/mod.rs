//! Builder session: one cached mocker per patch target, with a single
//! `reset()` tearing down everything the session created.
//!
//! The builder guarantees at most one live patch per target per session.
//! Asking for an already-cached mocker returns it; asking again after it
//! was canceled creates a fresh one instead of reviving stale state.

use crate::patch::{self, PatchGuard};
use crate::symbol::ResolveScope;
use crate::types::{FnPtr, Result};
use std::collections::HashMap;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum MockKey {
    Addr(usize),
    Symbol(String),
}

/// A cached per-target mocker. Created through [`Builder::func`] or
/// [`Builder::symbol`].
pub struct FuncMocker {
    key: MockKey,
    scope: ResolveScope,
    guard: Option<PatchGuard>,
    canceled: bool,
}

impl FuncMocker {
    fn new(key: MockKey, scope: ResolveScope) -> FuncMocker {
        FuncMocker {
            key,
            scope,
            guard: None,
            canceled: false,
        }
    }

    /// Redirect the target to `replacement`. Applying again swaps the
    /// replacement on the same patch.
    ///
    /// # Safety
    /// For address and symbol targets the replacement signature cannot be
    /// checked; it must match the target's.
    pub unsafe fn apply<F: FnPtr>(&mut self, replacement: F) -> Result<()> {
        let guard = match &self.key {
            MockKey::Addr(addr) => patch::patch_addr(*addr, replacement.addr())?,
            MockKey::Symbol(name) => patch::patch_symbol(name, &self.scope, replacement)?,
        };
        self.guard = Some(guard);
        self.canceled = false;
        Ok(())
    }

    /// Remove the patch, if any. Idempotent.
    pub fn cancel(&mut self) {
        if let Some(guard) = self.guard.take() {
            guard.unpatch();
        }
        self.canceled = true;
    }

    pub fn canceled(&self) -> bool {
        self.canceled
    }

    /// Whether a patch is currently installed.
    pub fn active(&self) -> bool {
        self.guard.is_some() && !self.canceled
    }
}

/// Mock session. Not thread-safe: one builder per test, like one registry
/// transaction.
#[derive(Default)]
pub struct Builder {
    mockers: HashMap<MockKey, FuncMocker>,
}

impl Builder {
    pub fn new() -> Builder {
        Builder::default()
    }

    /// Mocker for a function reference, keyed by its entry address.
    pub fn func<F: FnPtr>(&mut self, target: F) -> &mut FuncMocker {
        self.entry(MockKey::Addr(target.addr()), ResolveScope::Global)
    }

    /// Mocker for a symbol name, resolved at apply time.
    pub fn symbol(&mut self, name: &str) -> &mut FuncMocker {
        self.entry(MockKey::Symbol(name.to_string()), ResolveScope::Global)
    }

    /// Like [`Builder::symbol`], restricted to one module.
    pub fn symbol_in(&mut self, name: &str, module: &str) -> &mut FuncMocker {
        self.entry(
            MockKey::Symbol(name.to_string()),
            ResolveScope::Module(module.to_string()),
        )
    }

    fn entry(&mut self, key: MockKey, scope: ResolveScope) -> &mut FuncMocker {
        let existing_usable = self.mockers.get(&key).is_some_and(|m| !m.canceled());
        if !existing_usable {
            // Canceled mockers are replaced rather than revived.
            self.mockers
                .insert(key.clone(), FuncMocker::new(key.clone(), scope));
            log::debug!("builder created mocker for {key:?}");
        }
        self.mockers.get_mut(&key).unwrap()
    }

    /// Cancel every mocker this session created.
    pub fn reset(&mut self) {
        for mocker in self.mockers.values_mut() {
            if mocker.active() {
                log::debug!("builder reset canceling {:?}", mocker.key);
            }
            mocker.cancel();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::hint::black_box;

    fn lock_hook_tests() -> std::sync::MutexGuard<'static, ()> {
        crate::lock_hook_tests()
    }

    // black_box keeps the arithmetic from folding away, so the compiled
    // bodies stay longer than the prologue overwrite.
    #[inline(never)]
    fn shaped(a: i64) -> i64 {
        let b = black_box(a.wrapping_mul(3));
        let c = black_box(b.wrapping_add(11));
        c.wrapping_sub(a.wrapping_mul(2)) // a + 11
    }

    #[inline(never)]
    fn shaped_mock(a: i64) -> i64 {
        let b = black_box(a.wrapping_mul(5));
        let c = black_box(b.wrapping_add(7000));
        c.wrapping_sub(a.wrapping_mul(4)) // a + 7000
    }

    #[inline(never)]
    fn other(a: i64) -> i64 {
        let b = black_box(a.wrapping_mul(7));
        let c = black_box(b.wrapping_add(23));
        c.wrapping_sub(a.wrapping_mul(6)) // a + 23
    }

    #[test]
    fn apply_and_reset_roundtrip() {
        let _g = lock_hook_tests();
        let mut builder = Builder::new();

        let target: fn(i64) -> i64 = shaped;
        assert_eq!(black_box(target)(1), 12);

        unsafe {
            builder
                .func(target)
                .apply(shaped_mock as fn(i64) -> i64)
                .expect("apply");
        }
        assert_eq!(black_box(target)(1), 7001);

        builder.reset();
        assert_eq!(black_box(target)(1), 12, "reset restores the original");
    }

    #[test]
    fn builder_caches_one_mocker_per_target() {
        let _g = lock_hook_tests();
        let mut builder = Builder::new();

        let target: fn(i64) -> i64 = shaped;
        unsafe {
            builder
                .func(target)
                .apply(shaped_mock as fn(i64) -> i64)
                .expect("apply");
        }

        // Second lookup must return the live mocker, not a fresh one.
        assert!(builder.func(target).active());
        assert_eq!(builder.mockers.len(), 1);

        builder.reset();
    }

    #[test]
    fn canceled_mocker_is_recreated() {
        let _g = lock_hook_tests();
        let mut builder = Builder::new();

        let target: fn(i64) -> i64 = shaped;
        unsafe {
            builder
                .func(target)
                .apply(shaped_mock as fn(i64) -> i64)
                .expect("apply");
        }
        builder.func(target).cancel();
        assert_eq!(black_box(target)(2), 13);

        // The cached mocker is canceled, so this lookup builds a new one.
        let fresh = builder.func(target);
        assert!(!fresh.canceled());
        assert!(!fresh.active());

        unsafe {
            fresh.apply(shaped_mock as fn(i64) -> i64).expect("reapply");
        }
        assert_eq!(black_box(target)(2), 7002);

        builder.reset();
        assert_eq!(black_box(target)(2), 13);
    }

    #[test]
    fn reset_covers_multiple_targets() {
        let _g = lock_hook_tests();
        let mut builder = Builder::new();

        let a: fn(i64) -> i64 = shaped;
        let b: fn(i64) -> i64 = other;

        unsafe {
            builder.func(a).apply(shaped_mock as fn(i64) -> i64).expect("a");
            builder.func(b).apply(shaped_mock as fn(i64) -> i64).expect("b");
        }
        assert_eq!(black_box(a)(0), 7000);
        assert_eq!(black_box(b)(0), 7000);

        builder.reset();
        assert_eq!(black_box(a)(0), 11);
        assert_eq!(black_box(b)(0), 23);
    }

    #[test]
    fn symbol_mocker_reports_resolution_failure() {
        let _g = lock_hook_tests();
        let mut builder = Builder::new();

        let result = unsafe {
            builder
                .symbol("definitely_not_a_symbol_zzz_271828")
                .apply(shaped_mock as fn(i64) -> i64)
        };
        assert!(result.is_err());
        assert!(!builder.symbol("definitely_not_a_symbol_zzz_271828").active());
    }
}
