use core::sync::atomic::{AtomicUsize, Ordering};
use std::sync::OnceLock;

use crate::types::{MockError, Result};

/// Fixed size of one generated-stub reservation.
pub const STUB_SLOT: usize = 128;

/// Capacity of the process-wide arena, before page rounding.
const DEFAULT_CAPACITY: usize = 256 * 1024;

/// Conservative capacity used when the page size cannot be probed.
const FALLBACK_CAPACITY: usize = 64 * 1024;

/// A reservation inside the arena. Slots are never reclaimed; the region
/// lives for the rest of the process.
#[derive(Debug, Clone, Copy)]
pub struct ArenaSlot {
    pub addr: usize,
    pub len: usize,
}

#[derive(Debug)]
struct Arena {
    base: *mut u8,
    capacity: usize,
    cursor: AtomicUsize,
}

// The base pointer is an anonymous R+X mapping owned for the process
// lifetime; the cursor is the only mutable state.
unsafe impl Send for Arena {}
unsafe impl Sync for Arena {}

impl Arena {
    /// Map an executable region of `capacity` bytes (page-rounded).
    ///
    /// The region starts R+X; stub bytes are written through
    /// [`crate::code::patcher::patch_code`] so pages return to R+X after
    /// every emission.
    fn with_capacity(capacity: usize, page_sz: usize) -> Result<Arena> {
        let capacity = (capacity + page_sz - 1) & !(page_sz - 1);

        #[cfg(target_os = "linux")]
        let base = unsafe {
            let ptr = libc::mmap(
                core::ptr::null_mut(),
                capacity,
                libc::PROT_READ | libc::PROT_EXEC,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                -1,
                0,
            );
            if ptr == libc::MAP_FAILED {
                return Err(MockError::MemoryProtect);
            }
            ptr as *mut u8
        };

        #[cfg(target_os = "macos")]
        let base = unsafe {
            use mach2::kern_return::KERN_SUCCESS;
            use mach2::traps::mach_task_self;
            use mach2::vm::{mach_vm_allocate, mach_vm_protect};
            use mach2::vm_prot::{VM_PROT_EXECUTE, VM_PROT_READ};
            use mach2::vm_statistics::VM_FLAGS_ANYWHERE;

            let task = mach_task_self();
            let mut addr: u64 = 0;
            let kr = mach_vm_allocate(task, &mut addr, capacity as u64, VM_FLAGS_ANYWHERE);
            if kr != KERN_SUCCESS {
                return Err(MockError::MemoryProtect);
            }
            let kr = mach_vm_protect(task, addr, capacity as u64, 0, VM_PROT_READ | VM_PROT_EXECUTE);
            if kr != KERN_SUCCESS {
                return Err(MockError::MemoryProtect);
            }
            addr as *mut u8
        };

        #[cfg(not(any(target_os = "macos", target_os = "linux")))]
        {
            let _ = capacity;
            return Err(MockError::Unsupported);
        }

        #[cfg(any(target_os = "macos", target_os = "linux"))]
        Ok(Arena {
            base,
            capacity,
            cursor: AtomicUsize::new(0),
        })
    }

    /// Reserve `len` bytes by atomically bumping the cursor.
    ///
    /// On overflow the cursor is left untouched so the remaining space stays
    /// available for smaller reservations.
    fn acquire(&self, len: usize) -> Result<ArenaSlot> {
        let off = self
            .cursor
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |cur| {
                cur.checked_add(len).filter(|&end| end <= self.capacity)
            })
            .map_err(|cur| MockError::SpaceOverflow {
                requested: len,
                remaining: self.capacity - cur,
            })?;

        Ok(ArenaSlot {
            addr: self.base as usize + off,
            len,
        })
    }

    fn remaining(&self) -> usize {
        self.capacity - self.cursor.load(Ordering::SeqCst)
    }
}

fn probed_layout() -> (usize, usize) {
    let ps = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    if ps > 0 {
        (ps as usize, DEFAULT_CAPACITY)
    } else {
        (4096, FALLBACK_CAPACITY)
    }
}

fn global() -> &'static std::result::Result<Arena, MockError> {
    static ARENA: OnceLock<std::result::Result<Arena, MockError>> = OnceLock::new();
    ARENA.get_or_init(|| {
        let (page_sz, default_cap) = probed_layout();
        let capacity = std::env::var("REMOCK_ARENA_SIZE")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(default_cap);
        Arena::with_capacity(capacity, page_sz)
    })
}

/// Reserve `len` bytes of executable arena space.
pub fn acquire(len: usize) -> Result<ArenaSlot> {
    match global() {
        Ok(arena) => arena.acquire(len),
        Err(e) => Err(e.clone()),
    }
}

/// Reserve one fixed-size stub slot.
pub fn acquire_slot() -> Result<ArenaSlot> {
    acquire(STUB_SLOT)
}

/// Bytes still unreserved in the process arena.
pub fn remaining() -> usize {
    match global() {
        Ok(arena) => arena.remaining(),
        Err(_) => 0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn acquire_bumps_sequentially() {
        let arena = Arena::with_capacity(4096, 4096).expect("map");
        let a = arena.acquire(64).expect("a");
        let b = arena.acquire(64).expect("b");
        assert_eq!(b.addr, a.addr + 64);
        assert_eq!(arena.remaining(), 4096 - 128);
    }

    #[test]
    fn overflow_leaves_cursor_unchanged() {
        let arena = Arena::with_capacity(4096, 4096).expect("map");
        arena.acquire(4000).expect("fill");

        let before = arena.remaining();
        let err = arena.acquire(STUB_SLOT).unwrap_err();
        assert_eq!(
            err,
            MockError::SpaceOverflow {
                requested: STUB_SLOT,
                remaining: before,
            }
        );
        assert_eq!(arena.remaining(), before);

        // A smaller reservation still fits after the failed one.
        arena.acquire(before).expect("tail fits");
    }

    #[test]
    fn concurrent_acquires_never_overlap() {
        use std::sync::Arc;

        let arena = Arc::new(Arena::with_capacity(64 * 1024, 4096).expect("map"));
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let arena = Arc::clone(&arena);
                std::thread::spawn(move || {
                    (0..32)
                        .map(|_| arena.acquire(STUB_SLOT).expect("acquire").addr)
                        .collect::<Vec<_>>()
                })
            })
            .collect();

        let mut addrs: Vec<usize> = handles
            .into_iter()
            .flat_map(|h| h.join().expect("join"))
            .collect();
        addrs.sort_unstable();
        addrs.dedup();
        assert_eq!(addrs.len(), 4 * 32, "overlapping slots handed out");
    }

    #[test]
    fn global_arena_hands_out_slots() {
        let slot = acquire_slot().expect("global slot");
        assert_ne!(slot.addr, 0);
        assert_eq!(slot.len, STUB_SLOT);
    }
}
