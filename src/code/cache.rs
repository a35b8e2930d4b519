//! Instruction-cache maintenance after code writes.
//!
//! ARM64 data and instruction caches are not coherent: written instructions
//! must be pushed out of the data cache and the stale instruction-cache
//! lines discarded before the code runs. x86_64 snoops stores into the
//! instruction stream, so the flush degenerates to a no-op there.

#[cfg(target_os = "macos")]
mod imp {
    extern "C" {
        fn sys_icache_invalidate(addr: *mut core::ffi::c_void, size: usize);
        fn sys_dcache_flush(addr: *mut core::ffi::c_void, size: usize);
    }

    pub unsafe fn flush(addr: *mut u8, size: usize) {
        sys_dcache_flush(addr.cast(), size);
        sys_icache_invalidate(addr.cast(), size);
    }
}

#[cfg(all(target_os = "linux", target_arch = "aarch64"))]
mod imp {
    extern "C" {
        fn __clear_cache(beg: *mut libc::c_void, end: *mut libc::c_void);
    }

    pub unsafe fn flush(addr: *mut u8, size: usize) {
        __clear_cache(addr.cast(), addr.add(size).cast());
    }
}

#[cfg(not(any(target_os = "macos", all(target_os = "linux", target_arch = "aarch64"))))]
mod imp {
    pub unsafe fn flush(_addr: *mut u8, _size: usize) {}
}

/// Make `size` bytes of freshly written code at `addr` fetchable.
///
/// # Safety
/// `addr` must point to at least `size` bytes of memory.
#[inline]
pub unsafe fn invalidate_icache(addr: *mut u8, size: usize) {
    imp::flush(addr, size);
}
