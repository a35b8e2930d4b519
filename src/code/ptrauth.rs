//! Pointer-authentication stripping for arm64e code pointers.

#[cfg(all(target_arch = "aarch64", target_os = "macos"))]
mod imp {
    // XPACI removes the PAC signature without checking it; the result is the
    // plain canonical address.
    pub fn strip(ptr: usize) -> usize {
        let mut x = ptr as u64;
        unsafe {
            core::arch::asm!("xpaci {0}", inout(reg) x, options(nostack, preserves_flags));
        }
        x as usize
    }
}

#[cfg(not(all(target_arch = "aarch64", target_os = "macos")))]
mod imp {
    pub fn strip(ptr: usize) -> usize {
        ptr
    }
}

/// Turn a possibly signed code pointer into a plain address.
#[inline]
pub(crate) fn strip_code_ptr(ptr: usize) -> usize {
    imp::strip(ptr)
}
