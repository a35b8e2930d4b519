//! Argument-vector proxying for mocked methods.
//!
//! Instead of a typed replacement function, a method can be backed by a
//! [`ProxyHandler`] that receives the raw argument registers as a slice.
//! The generated proxy stub spills the registers and calls [`proxy_shim`]
//! with a [`ProxyCell`] baked in at emission time.

/// Handler invoked with the spilled argument registers. `args[0]` is the
/// receiver word (the live context), the method arguments follow.
pub type ProxyHandler = fn(&[usize]) -> usize;

/// Which stub a mocked method slot gets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StubKind {
    Direct,
    Proxy,
}

/// Per-method state a proxy stub points at. Must stay at a stable address
/// for as long as the stub is reachable.
pub struct ProxyCell {
    pub handler: ProxyHandler,
}

/// Entry point called by proxy stubs: `shim(cell, argv, argc)`.
///
/// # Safety
/// `cell` must point at a live [`ProxyCell`] and `argv` at `argc` readable
/// words. Only generated proxy stubs call this.
pub unsafe extern "C" fn proxy_shim(cell: *mut ProxyCell, argv: *const usize, argc: usize) -> usize {
    let cell = &*cell;
    let args = core::slice::from_raw_parts(argv, argc);
    (cell.handler)(args)
}
