//! Interface table faking: mock individual trait-object methods by swapping
//! the variable's vtable for a synthetic one.
//!
//! Rust has no runtime method reflection, so the caller describes the trait
//! with an [`InterfaceDesc`] whose method order matches the trait's
//! declaration order. A mocked variable's data word always points at the
//! live [`IfaceContext`] state, so the variable never reads as null.

pub mod layout;
pub mod proxy;

use crate::arch;
use crate::code::arena::{self, STUB_SLOT};
use crate::code::patcher::patch_code;
use crate::types::{FnPtr, MockError, Result};
use layout::{FakeVtable, RawIface, MAX_METHODS};
use proxy::{proxy_shim, ProxyCell, ProxyHandler, StubKind};

/// One method of the described trait. `args` counts declared arguments,
/// excluding the receiver.
#[derive(Debug, Clone, Copy)]
pub struct MethodDesc {
    pub name: &'static str,
    pub args: usize,
}

/// A trait's method set, in declaration order.
#[derive(Debug, Clone, Copy)]
pub struct InterfaceDesc {
    pub name: &'static str,
    pub methods: &'static [MethodDesc],
}

/// Panics for any vtable slot that was never mocked.
fn trap_unimplemented() -> usize {
    panic!("method not implemented")
}

/// Stand-in for drop-in-place: the faked variable does not own the original
/// object, so dropping through the fake table must do nothing.
fn noop_drop(_data: *mut ()) {}

struct Inner {
    desc: InterfaceDesc,
    slot: *mut (),
    snapshot: Option<RawIface>,
    vtable: FakeVtable,
    stubs: [usize; MAX_METHODS],
    proxies: Vec<Box<ProxyCell>>,
    canceled: bool,
}

/// Mocking session for one trait-object variable.
///
/// The state is boxed so the fake vtable and the data word handed to
/// replacements keep a stable address for the session's lifetime.
pub struct IfaceContext {
    inner: Box<Inner>,
}

impl IfaceContext {
    /// Start a session over the trait-object reference stored at `target`.
    ///
    /// # Safety
    /// `target` must point at a live two-word trait-object reference that
    /// outlives this context, and the referenced object must outlive every
    /// dispatch through the variable.
    pub unsafe fn new<T: ?Sized>(desc: InterfaceDesc, target: *mut &T) -> Result<IfaceContext> {
        if !layout::is_fat::<T>() {
            return Err(MockError::IllegalParamType {
                name: "target",
                got: "thin reference",
                want: "trait-object reference",
            });
        }
        if desc.methods.is_empty() || desc.methods.len() > MAX_METHODS {
            return Err(MockError::Unsupported);
        }
        Ok(IfaceContext {
            inner: Box::new(Inner {
                desc,
                slot: target as *mut (),
                snapshot: None,
                vtable: FakeVtable::new(
                    noop_drop as usize,
                    0,
                    0,
                    trap_unimplemented as usize,
                ),
                stubs: [0; MAX_METHODS],
                proxies: Vec::new(),
                canceled: false,
            }),
        })
    }

    /// Mock `method` with a typed replacement.
    ///
    /// A replacement taking the method's argument count plus one leading
    /// context word receives the live context as its first argument; one
    /// taking exactly the argument count has the receiver word dropped
    /// before the jump.
    pub fn make<F: FnPtr>(&mut self, method: &str, replacement: F) -> Result<()> {
        self.install(method, StubKind::Direct, replacement.addr(), Some(F::ARITY))
    }

    /// Mock `method` with an argument-vector handler instead of a typed
    /// replacement.
    pub fn make_proxy(&mut self, method: &str, handler: ProxyHandler) -> Result<()> {
        let cell = Box::new(ProxyCell { handler });
        let cell_addr = &*cell as *const ProxyCell as usize;
        self.inner.proxies.push(cell);
        self.install(method, StubKind::Proxy, cell_addr, None)
    }

    fn install(
        &mut self,
        method: &str,
        kind: StubKind,
        payload: usize,
        arity: Option<usize>,
    ) -> Result<()> {
        let inner = &mut *self.inner;

        let idx = inner
            .desc
            .methods
            .iter()
            .position(|m| m.name == method)
            .ok_or_else(|| MockError::MethodNotFound {
                method: method.to_string(),
            })?;
        let declared = inner.desc.methods[idx].args;

        // A canceled session starts over: stale stubs and the old snapshot
        // must not leak into the fresh table.
        if inner.canceled {
            inner.stubs = [0; MAX_METHODS];
            inner.vtable.fun = [trap_unimplemented as usize; MAX_METHODS];
            inner.snapshot = None;
            inner.canceled = false;
        }

        let drops_receiver = match (kind, arity) {
            (StubKind::Direct, Some(got)) if got == declared => true,
            (StubKind::Direct, Some(got)) if got == declared + 1 => false,
            (StubKind::Direct, got) => {
                return Err(MockError::ArgsNotMatch {
                    got: got.unwrap_or(0),
                    want: declared,
                })
            }
            (StubKind::Proxy, _) => false,
        };

        let enc = arch::encoder()?;
        // The shifting and spilling stubs only carry the register arguments;
        // a call whose receiver plus arguments overflow them would silently
        // truncate, so it is refused. The plain direct stub forwards the
        // frame untouched and has no such limit.
        if (drops_receiver || kind == StubKind::Proxy) && declared + 1 > enc.arg_regs {
            return Err(MockError::Unsupported);
        }
        // Re-mocking a method reuses its stub slot.
        let stub = if inner.stubs[idx] != 0 {
            inner.stubs[idx]
        } else {
            arena::acquire_slot()?.addr
        };
        let mut staged = [0u8; STUB_SLOT];
        let used = unsafe {
            match kind {
                StubKind::Direct if drops_receiver => (enc.emit_drop_ctx_stub)(
                    staged.as_mut_ptr(),
                    staged.len(),
                    stub as u64,
                    payload as u64,
                ),
                StubKind::Direct => (enc.emit_direct_stub)(
                    staged.as_mut_ptr(),
                    staged.len(),
                    stub as u64,
                    payload as u64,
                ),
                StubKind::Proxy => (enc.emit_proxy_stub)(
                    staged.as_mut_ptr(),
                    staged.len(),
                    stub as u64,
                    payload as u64,
                    proxy_shim as usize as u64,
                ),
            }
        };
        unsafe {
            patch_code(stub as *mut u8, used, |p| {
                core::ptr::copy_nonoverlapping(staged.as_ptr(), p, used);
            })?;
        }

        unsafe {
            if inner.snapshot.is_none() {
                let snap = layout::read_raw(inner.slot);
                let (size, align) = layout::vtable_size_align(snap.vtable);
                inner.vtable.size = size;
                inner.vtable.align = align;
                inner.snapshot = Some(snap);
            }

            inner.stubs[idx] = stub;
            inner.vtable.fun[idx] = stub;

            layout::write_raw(
                inner.slot,
                RawIface {
                    data: inner as *const Inner as usize,
                    vtable: &inner.vtable as *const FakeVtable as usize,
                },
            );
        }
        log::debug!(
            "faked {}::{method} (slot {idx}, {kind:?})",
            inner.desc.name
        );
        Ok(())
    }

    /// Restore the variable's original fat pointer. Idempotent; a later
    /// [`IfaceContext::make`] rebuilds the table from scratch.
    pub fn cancel(&mut self) {
        let inner = &mut *self.inner;
        if let Some(snap) = inner.snapshot {
            unsafe { layout::write_raw(inner.slot, snap) };
        }
        inner.canceled = true;
        log::debug!("canceled fake for {}", inner.desc.name);
    }

    pub fn canceled(&self) -> bool {
        self.inner.canceled
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::panic::{catch_unwind, AssertUnwindSafe};

    trait Greeter {
        fn id(&self) -> usize;
        fn add(&self, n: usize) -> usize;
    }

    struct Real;

    impl Greeter for Real {
        fn id(&self) -> usize {
            1
        }
        fn add(&self, n: usize) -> usize {
            n + 1
        }
    }

    const DESC: InterfaceDesc = InterfaceDesc {
        name: "Greeter",
        methods: &[
            MethodDesc {
                name: "id",
                args: 0,
            },
            MethodDesc {
                name: "add",
                args: 1,
            },
        ],
    };

    fn lock_hook_tests() -> std::sync::MutexGuard<'static, ()> {
        crate::lock_hook_tests()
    }

    fn mock_id(_ctx: usize) -> usize {
        42
    }

    fn mock_add_no_ctx(n: usize) -> usize {
        n * 100
    }

    #[test]
    fn mocked_method_dispatches_to_replacement() {
        let _g = lock_hook_tests();

        let real = Real;
        let mut obj: &dyn Greeter = &real;
        let mut ctx =
            unsafe { IfaceContext::new(DESC, &mut obj as *mut &dyn Greeter) }.expect("ctx");

        ctx.make("id", mock_id as fn(usize) -> usize).expect("make");
        assert_eq!(obj.id(), 42);

        ctx.cancel();
        assert_eq!(obj.id(), 1, "cancel restores real dispatch");
        assert_eq!(obj.add(4), 5);
    }

    #[test]
    fn replacement_without_context_gets_receiver_dropped() {
        let _g = lock_hook_tests();

        let real = Real;
        let mut obj: &dyn Greeter = &real;
        let mut ctx =
            unsafe { IfaceContext::new(DESC, &mut obj as *mut &dyn Greeter) }.expect("ctx");

        ctx.make("add", mock_add_no_ctx as fn(usize) -> usize)
            .expect("make");
        assert_eq!(obj.add(7), 700);

        ctx.cancel();
        assert_eq!(obj.add(7), 8);
    }

    #[test]
    fn unmocked_method_traps() {
        let _g = lock_hook_tests();

        let real = Real;
        let mut obj: &dyn Greeter = &real;
        let mut ctx =
            unsafe { IfaceContext::new(DESC, &mut obj as *mut &dyn Greeter) }.expect("ctx");

        ctx.make("id", mock_id as fn(usize) -> usize).expect("make");

        let outcome = catch_unwind(AssertUnwindSafe(|| obj.add(3)));
        assert!(outcome.is_err(), "unmocked method must panic");

        ctx.cancel();
        assert_eq!(obj.add(3), 4);
    }

    #[test]
    fn mocked_variable_is_never_null() {
        let _g = lock_hook_tests();

        let real = Real;
        let mut obj: &dyn Greeter = &real;
        let slot = &mut obj as *mut &dyn Greeter as *mut ();
        let mut ctx =
            unsafe { IfaceContext::new(DESC, &mut obj as *mut &dyn Greeter) }.expect("ctx");

        ctx.make("id", mock_id as fn(usize) -> usize).expect("make");
        let raw = unsafe { layout::read_raw(slot) };
        assert_ne!(raw.data, 0, "data word must stay non-null while mocked");
        assert_ne!(raw.vtable, 0);

        ctx.cancel();
    }

    #[test]
    fn proxy_handler_sees_receiver_and_arguments() {
        let _g = lock_hook_tests();

        fn triple_arg(args: &[usize]) -> usize {
            // args[0] is the receiver word.
            assert_ne!(args[0], 0);
            args[1] * 3
        }

        let real = Real;
        let mut obj: &dyn Greeter = &real;
        let mut ctx =
            unsafe { IfaceContext::new(DESC, &mut obj as *mut &dyn Greeter) }.expect("ctx");

        ctx.make_proxy("add", triple_arg).expect("make_proxy");
        assert_eq!(obj.add(7), 21);

        ctx.cancel();
        assert_eq!(obj.add(7), 8);
    }

    #[test]
    fn make_after_cancel_builds_a_fresh_table() {
        let _g = lock_hook_tests();

        let real = Real;
        let mut obj: &dyn Greeter = &real;
        let mut ctx =
            unsafe { IfaceContext::new(DESC, &mut obj as *mut &dyn Greeter) }.expect("ctx");

        ctx.make("id", mock_id as fn(usize) -> usize).expect("make");
        ctx.cancel();
        assert!(ctx.canceled());

        ctx.make("add", mock_add_no_ctx as fn(usize) -> usize)
            .expect("remake");
        assert!(!ctx.canceled());
        assert_eq!(obj.add(2), 200);

        // "id" was mocked in the previous generation only.
        let outcome = catch_unwind(AssertUnwindSafe(|| obj.id()));
        assert!(outcome.is_err(), "stale mock must not survive cancel");

        ctx.cancel();
        assert_eq!(obj.id(), 1);
    }

    #[test]
    fn unknown_method_and_bad_arity_are_rejected() {
        let _g = lock_hook_tests();

        let real = Real;
        let mut obj: &dyn Greeter = &real;
        let mut ctx =
            unsafe { IfaceContext::new(DESC, &mut obj as *mut &dyn Greeter) }.expect("ctx");

        let err = ctx.make("nope", mock_id as fn(usize) -> usize).unwrap_err();
        assert!(matches!(err, MockError::MethodNotFound { .. }));

        let err = ctx
            .make("id", mock_add_3 as fn(usize, usize, usize) -> usize)
            .unwrap_err();
        assert_eq!(err, MockError::ArgsNotMatch { got: 3, want: 0 });

        // Rejected installs leave the variable untouched.
        assert_eq!(obj.id(), 1);
    }

    fn mock_add_3(_a: usize, _b: usize, _c: usize) -> usize {
        0
    }

    trait Wide {
        fn six(&self, a: usize, b: usize, c: usize, d: usize, e: usize, f: usize) -> usize;
    }

    struct WideReal;

    impl Wide for WideReal {
        fn six(&self, a: usize, b: usize, c: usize, d: usize, e: usize, f: usize) -> usize {
            a + b + c + d + e + f
        }
    }

    const WIDE_DESC: InterfaceDesc = InterfaceDesc {
        name: "Wide",
        methods: &[MethodDesc {
            name: "six",
            args: 6,
        }],
    };

    fn mock_six(a: usize, b: usize, c: usize, d: usize, e: usize, f: usize) -> usize {
        f * 100_000 + e * 10_000 + d * 1_000 + c * 100 + b * 10 + a
    }

    /// A six-argument method needs seven call slots with the receiver. The
    /// shifting stub must either carry every one of them or refuse; losing
    /// the last argument silently is the one unacceptable outcome.
    #[test]
    fn wide_method_never_drops_trailing_arguments() {
        let _g = lock_hook_tests();

        let real = WideReal;
        let mut obj: &dyn Wide = &real;
        let mut ctx =
            unsafe { IfaceContext::new(WIDE_DESC, &mut obj as *mut &dyn Wide) }.expect("ctx");

        let res = ctx.make(
            "six",
            mock_six as fn(usize, usize, usize, usize, usize, usize) -> usize,
        );

        #[cfg(target_arch = "x86_64")]
        {
            // Seven slots overflow the six integer argument registers.
            fn last_slot(args: &[usize]) -> usize {
                args[args.len() - 1]
            }
            assert!(matches!(res.unwrap_err(), MockError::Unsupported));
            assert!(matches!(
                ctx.make_proxy("six", last_slot).unwrap_err(),
                MockError::Unsupported
            ));
            assert_eq!(
                obj.six(1, 2, 3, 4, 5, 6),
                21,
                "refused install must leave real dispatch"
            );
        }

        #[cfg(target_arch = "aarch64")]
        {
            // Seven slots fit in x0..x7, so the install goes through.
            res.expect("make");
            assert_eq!(obj.six(1, 2, 3, 4, 5, 6), 654_321);
            ctx.cancel();
            assert_eq!(obj.six(1, 2, 3, 4, 5, 6), 21);
        }
    }

    #[test]
    fn thin_reference_is_rejected() {
        let value = 5u64;
        // `.err()` rather than `.unwrap_err()`: the context holds raw
        // pointers and a fn-pointer table and implements no Debug.
        let err = unsafe { IfaceContext::new(DESC, &mut (&value) as *mut &u64) }
            .err()
            .expect("thin reference must be rejected");
        assert!(matches!(err, MockError::IllegalParamType { .. }));
    }
}
