//! Trait-object memory layout.
//!
//! All knowledge about fat-pointer and vtable layout is confined to this
//! module: a `&dyn Trait` is two words (data, vtable) and the vtable starts
//! with drop-in-place, size, and align, followed by the method entries in
//! declaration order. This matches the layout rustc emits on both supported
//! targets; nothing else in the crate does pointer arithmetic on it.

/// Method slots a fake vtable can carry.
pub const MAX_METHODS: usize = 16;

/// The two words of a trait-object reference.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(C)]
pub struct RawIface {
    pub data: usize,
    pub vtable: usize,
}

/// A synthetic dispatch table. Field order mirrors the compiler's vtable
/// header so a pointer to this struct can stand in for a real vtable.
#[repr(C)]
pub struct FakeVtable {
    pub drop_in_place: usize,
    pub size: usize,
    pub align: usize,
    pub fun: [usize; MAX_METHODS],
}

impl FakeVtable {
    pub fn new(drop_in_place: usize, size: usize, align: usize, trap: usize) -> FakeVtable {
        FakeVtable {
            drop_in_place,
            size,
            align,
            fun: [trap; MAX_METHODS],
        }
    }
}

/// Whether `&T` is a two-word fat reference.
pub fn is_fat<T: ?Sized>() -> bool {
    core::mem::size_of::<&T>() == 2 * core::mem::size_of::<usize>()
}

/// Read the fat pointer stored at `slot`.
///
/// # Safety
/// `slot` must point at a live two-word trait-object reference.
pub unsafe fn read_raw(slot: *const ()) -> RawIface {
    core::ptr::read_volatile(slot as *const RawIface)
}

/// Overwrite the fat pointer stored at `slot`.
///
/// Data is written before the vtable word. A reader dispatching between
/// the two writes can observe a mixed pair; the window is two word stores.
///
/// # Safety
/// Same as [`read_raw`], plus no Rust reference to the slot may be live.
pub unsafe fn write_raw(slot: *mut (), raw: RawIface) {
    let words = slot as *mut usize;
    core::ptr::write_volatile(words, raw.data);
    core::ptr::write_volatile(words.add(1), raw.vtable);
}

/// Pull (size, align) out of a real vtable so the fake one stays plausible
/// to code that inspects object layout.
///
/// # Safety
/// `vtable` must be a vtable pointer taken from a live trait object.
pub unsafe fn vtable_size_align(vtable: usize) -> (usize, usize) {
    let words = vtable as *const usize;
    (*words.add(1), *words.add(2))
}

#[cfg(test)]
mod tests {
    use super::*;

    trait Sample {
        fn first(&self) -> usize;
        fn second(&self) -> usize;
    }

    struct Impl(usize);

    impl Sample for Impl {
        fn first(&self) -> usize {
            self.0
        }
        fn second(&self) -> usize {
            self.0 * 2
        }
    }

    #[test]
    fn fatness_check_distinguishes_reference_kinds() {
        assert!(is_fat::<dyn Sample>());
        assert!(is_fat::<str>());
        assert!(!is_fat::<u64>());
        assert!(!is_fat::<Impl>());
    }

    #[test]
    fn raw_roundtrip_preserves_dispatch() {
        let value = Impl(21);
        let mut obj: &dyn Sample = &value;
        let slot = &mut obj as *mut &dyn Sample as *mut ();

        let raw = unsafe { read_raw(slot) };
        assert_ne!(raw.data, 0);
        assert_ne!(raw.vtable, 0);

        unsafe { write_raw(slot, raw) };
        assert_eq!(obj.first(), 21);
        assert_eq!(obj.second(), 42);
    }

    #[test]
    fn real_vtable_reports_size_and_align() {
        let value = Impl(1);
        let obj: &dyn Sample = &value;
        let raw = unsafe { read_raw(&obj as *const &dyn Sample as *const ()) };
        let (size, align) = unsafe { vtable_size_align(raw.vtable) };
        assert_eq!(size, core::mem::size_of::<Impl>());
        assert_eq!(align, core::mem::align_of::<Impl>());
    }

    #[test]
    fn fake_vtable_header_matches_compiler_layout() {
        assert_eq!(core::mem::offset_of!(FakeVtable, drop_in_place), 0);
        assert_eq!(
            core::mem::offset_of!(FakeVtable, size),
            core::mem::size_of::<usize>()
        );
        assert_eq!(
            core::mem::offset_of!(FakeVtable, align),
            2 * core::mem::size_of::<usize>()
        );
        assert_eq!(
            core::mem::offset_of!(FakeVtable, fun),
            3 * core::mem::size_of::<usize>()
        );
    }
}
