use crate::code::cache::invalidate_icache;
use crate::types::{MockError, Result};

#[cfg(target_os = "linux")]
mod linux {
    use super::*;

    pub unsafe fn patch_code(addr: *mut u8, size: usize, apply: impl FnOnce(*mut u8)) -> Result<()> {
        if size == 0 {
            return Ok(());
        }

        let page_sz = libc::sysconf(libc::_SC_PAGESIZE) as usize;
        let page_start = (addr as usize) & !(page_sz - 1);
        let page_end = ((addr as usize) + size + page_sz - 1) & !(page_sz - 1);
        let map_size = page_end - page_start;

        // RWX rather than RW so code elsewhere on the page stays executable
        // while the write is in flight.
        if libc::mprotect(
            page_start as *mut libc::c_void,
            map_size,
            libc::PROT_READ | libc::PROT_WRITE | libc::PROT_EXEC,
        ) != 0
        {
            if crate::debug_enabled() {
                eprintln!(
                    "[remock] patcher: mprotect RWX failed errno={} page=0x{:x} size=0x{:x}",
                    *libc::__errno_location(),
                    page_start,
                    map_size
                );
            }
            return Err(MockError::MemoryProtect);
        }

        apply(addr);

        libc::mprotect(
            page_start as *mut libc::c_void,
            map_size,
            libc::PROT_READ | libc::PROT_EXEC,
        );

        // Flush the whole page after restoring RX so independently patched
        // functions sharing the page never execute stale I-cache lines.
        invalidate_icache(page_start as *mut u8, map_size);
        Ok(())
    }
}

#[cfg(target_os = "macos")]
mod darwin {
    use super::*;

    use mach2::kern_return::KERN_SUCCESS;
    use mach2::message::mach_msg_type_number_t;
    use mach2::traps::mach_task_self;
    use mach2::vm::{mach_vm_protect, mach_vm_write};
    use mach2::vm_prot::{VM_PROT_EXECUTE, VM_PROT_READ, VM_PROT_WRITE};
    use mach2::vm_types::{mach_vm_address_t, mach_vm_size_t, vm_offset_t};

    pub unsafe fn patch_code(addr: *mut u8, size: usize, apply: impl FnOnce(*mut u8)) -> Result<()> {
        if size == 0 {
            return Ok(());
        }

        let page_sz = libc::sysconf(libc::_SC_PAGESIZE) as usize;
        let page_start = (addr as usize) & !(page_sz - 1);
        let page_end = ((addr as usize) + size + page_sz - 1) & !(page_sz - 1);
        let map_size = page_end - page_start;

        // Stage the patched bytes in a buffer so every write path below can
        // reuse them and the result can be verified.
        let mut patched = vec![0u8; size];
        core::ptr::copy_nonoverlapping(addr as *const u8, patched.as_mut_ptr(), size);
        apply(patched.as_mut_ptr());

        let task = mach_task_self();

        // Preferred path: flip the page RW, write, restore RX.
        let kr = mach_vm_protect(
            task,
            page_start as mach_vm_address_t,
            map_size as mach_vm_size_t,
            0,
            VM_PROT_READ | VM_PROT_WRITE,
        );
        if kr == KERN_SUCCESS {
            core::ptr::copy_nonoverlapping(patched.as_ptr(), addr, size);
            let _ = mach_vm_protect(
                task,
                page_start as mach_vm_address_t,
                map_size as mach_vm_size_t,
                0,
                VM_PROT_READ | VM_PROT_EXECUTE,
            );
            invalidate_icache(page_start as *mut u8, map_size);
            return Ok(());
        }
        if crate::debug_enabled() {
            eprintln!(
                "[remock] patcher: mach_vm_protect RW failed kr={} addr=0x{:x}",
                kr, addr as usize
            );
        }

        // Kernel-assisted write for mappings whose max protection excludes WRITE.
        let kr = mach_vm_write(
            task,
            addr as mach_vm_address_t,
            patched.as_ptr() as vm_offset_t,
            patched.len() as mach_msg_type_number_t,
        );
        if kr == KERN_SUCCESS {
            invalidate_icache(addr, size);
            return Ok(());
        }
        if crate::debug_enabled() {
            eprintln!(
                "[remock] patcher: mach_vm_write failed kr={} addr=0x{:x}",
                kr, addr as usize
            );
        }

        // Last resort; usually fails on code-signed mappings.
        if libc::mprotect(
            page_start as *mut libc::c_void,
            map_size,
            libc::PROT_READ | libc::PROT_WRITE | libc::PROT_EXEC,
        ) != 0
        {
            return Err(MockError::MemoryProtect);
        }
        core::ptr::copy_nonoverlapping(patched.as_ptr(), addr, size);
        let _ = libc::mprotect(
            page_start as *mut libc::c_void,
            map_size,
            libc::PROT_READ | libc::PROT_EXEC,
        );
        invalidate_icache(page_start as *mut u8, map_size);
        Ok(())
    }
}

/// Patch `size` bytes of code at `addr` through `apply`.
///
/// The page is made writable for the duration of the write and returned to
/// RX afterwards, with the instruction cache invalidated.
///
/// # Safety
/// `addr` must point to `size` bytes of executable memory and `apply` must
/// write only within that range.
pub unsafe fn patch_code(addr: *mut u8, size: usize, apply: impl FnOnce(*mut u8)) -> Result<()> {
    #[cfg(target_os = "linux")]
    {
        linux::patch_code(addr, size, apply)
    }
    #[cfg(target_os = "macos")]
    {
        darwin::patch_code(addr, size, apply)
    }
    #[cfg(not(any(target_os = "macos", target_os = "linux")))]
    {
        let _ = (addr, size, apply);
        Err(MockError::Unsupported)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::code::arena;

    #[test]
    #[cfg(target_arch = "x86_64")]
    fn patch_code_modifies_executable_slot() {
        let slot = arena::acquire(arena::STUB_SLOT).expect("acquire");
        unsafe {
            // INT3 then RET; flip the INT3 to NOP and run it.
            patch_code(slot.addr as *mut u8, 2, |p| {
                p.write(0xCC);
                p.add(1).write(0xC3);
            })
            .expect("seed");
            patch_code(slot.addr as *mut u8, 1, |p| {
                p.write(0x90);
            })
            .expect("patch");

            let f: extern "C" fn() = core::mem::transmute(slot.addr);
            f();
        }
    }

    #[test]
    #[cfg(target_arch = "aarch64")]
    fn patch_code_modifies_executable_slot() {
        let slot = arena::acquire(arena::STUB_SLOT).expect("acquire");
        unsafe {
            // BRK then RET; flip the BRK to NOP and run it.
            patch_code(slot.addr as *mut u8, 8, |p| {
                (p as *mut u32).write(0xD420_0000);
                (p as *mut u32).add(1).write(0xD65F_03C0);
            })
            .expect("seed");
            patch_code(slot.addr as *mut u8, 4, |p| {
                (p as *mut u32).write(0xD503_201F);
            })
            .expect("patch");

            let f: extern "C" fn() = core::mem::transmute(slot.addr);
            f();
        }
    }

    #[test]
    fn patch_code_writes_are_visible_at_original_address() {
        let slot = arena::acquire(16).expect("acquire");
        unsafe {
            let marker: [u8; 4] = [0xAA, 0xBB, 0xCC, 0xDD];
            patch_code(slot.addr as *mut u8, 4, |p| {
                core::ptr::copy_nonoverlapping(marker.as_ptr(), p, 4);
            })
            .expect("patch");

            let got = core::ptr::read_unaligned(slot.addr as *const [u8; 4]);
            assert_eq!(got, marker);
        }
    }

    #[test]
    fn patch_code_zero_size_is_a_no_op() {
        unsafe {
            patch_code(core::ptr::null_mut(), 0, |_| unreachable!()).expect("zero-size");
        }
    }
}
