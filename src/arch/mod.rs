//! Per-architecture redirect and stub encoders.
//!
//! Each supported architecture contributes one [`Encoder`] describing its
//! prologue patch size and the machine-code emitters the patch engine and
//! interface faker need. Selection is table-driven, keyed by architecture
//! name and word size.

use crate::types::{MockError, Result};

#[cfg(target_arch = "aarch64")]
pub mod arm64;
#[cfg(target_arch = "x86_64")]
pub mod x86_64;

/// Prologue bytes overwritten by a redirect on every supported target.
pub const PATCH_SIZE: usize = 16;

/// Machine-code emitters for one (architecture, word size) pair.
///
/// Emitters write into a caller-provided buffer of at least `len` bytes at
/// the eventual execution address `pc`, and return the number of bytes used.
pub struct Encoder {
    pub arch: &'static str,
    pub word_size: usize,
    /// Bytes overwritten at the target's entry by `emit_redirect`.
    pub patch_size: usize,
    /// Number of integer argument registers the proxy stub captures.
    pub arg_regs: usize,
    /// Absolute jump over a function prologue, exactly `patch_size` bytes.
    pub emit_redirect: unsafe fn(buf: *mut u8, len: usize, pc: u64, target: u64),
    /// Jump-through-scratch stub leaving all argument registers intact.
    pub emit_direct_stub: unsafe fn(buf: *mut u8, len: usize, pc: u64, dest: u64) -> usize,
    /// Stub that drops the leading receiver word before jumping to `dest`.
    pub emit_drop_ctx_stub: unsafe fn(buf: *mut u8, len: usize, pc: u64, dest: u64) -> usize,
    /// Stub that spills the argument registers and calls
    /// `shim(cell, argv, argc)`.
    pub emit_proxy_stub:
        unsafe fn(buf: *mut u8, len: usize, pc: u64, cell: u64, shim: u64) -> usize,
}

static ENCODERS: &[&Encoder] = &[
    #[cfg(target_arch = "x86_64")]
    &x86_64::ENCODER,
    #[cfg(target_arch = "aarch64")]
    &arm64::ENCODER,
];

/// Select the encoder for the running process.
pub fn encoder() -> Result<&'static Encoder> {
    ENCODERS
        .iter()
        .find(|e| e.word_size == core::mem::size_of::<usize>())
        .copied()
        .ok_or(MockError::Unsupported)
}
