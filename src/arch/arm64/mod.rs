pub mod writer;

use writer::{Arm64Writer, Reg};

use super::Encoder;

/// AAPCS64 integer argument registers, in order.
const ARG_REGS: [Reg; 8] = [
    Reg::X0,
    Reg::X1,
    Reg::X2,
    Reg::X3,
    Reg::X4,
    Reg::X5,
    Reg::X6,
    Reg::X7,
];

pub static ENCODER: Encoder = Encoder {
    arch: "aarch64",
    word_size: 8,
    patch_size: 16,
    arg_regs: ARG_REGS.len(),
    emit_redirect,
    emit_direct_stub,
    emit_drop_ctx_stub,
    emit_proxy_stub,
};

/// Absolute redirect written over a function prologue:
/// `LDR X17, #8; BR X17; .quad target`, exactly `patch_size` bytes.
unsafe fn emit_redirect(buf: *mut u8, len: usize, pc: u64, target: u64) {
    let mut w = Arm64Writer::new(buf, len, pc);
    w.put_ldr_br_address(Reg::X17, target);
    debug_assert_eq!(w.offset(), ENCODER.patch_size);
}

/// `MOVZ/MOVK X17, dest; BR X17` — lands at `dest` with all argument
/// registers untouched (x17 is an intra-procedure scratch register).
unsafe fn emit_direct_stub(buf: *mut u8, len: usize, pc: u64, dest: u64) -> usize {
    let mut w = Arm64Writer::new(buf, len, pc);
    w.put_mov_reg_u64(Reg::X17, dest);
    w.put_br_reg(Reg::X17);
    w.offset()
}

/// Shift every argument register down by one (dropping the leading receiver
/// word) and tail-jump to `dest`.
unsafe fn emit_drop_ctx_stub(buf: *mut u8, len: usize, pc: u64, dest: u64) -> usize {
    let mut w = Arm64Writer::new(buf, len, pc);
    for pair in ARG_REGS.windows(2) {
        w.put_mov_reg_reg(pair[0], pair[1]);
    }
    w.put_mov_reg_u64(Reg::X17, dest);
    w.put_br_reg(Reg::X17);
    w.offset()
}

/// Reflective-invoker stub: spill x0..x7 to a stack frame and call
/// `shim(cell, argv, argc)`, returning its result in x0.
unsafe fn emit_proxy_stub(buf: *mut u8, len: usize, pc: u64, cell: u64, shim: u64) -> usize {
    let spill = (ARG_REGS.len() * 8) as u32;

    let mut w = Arm64Writer::new(buf, len, pc);
    w.put_push_reg_reg(Reg::X29, Reg::X30);
    w.put_mov_reg_reg(Reg::X29, Reg::SP);
    w.put_sub_reg_reg_imm(Reg::SP, Reg::SP, spill);
    for (i, reg) in ARG_REGS.iter().enumerate() {
        w.put_str_reg_reg_offset(*reg, Reg::SP, (i * 8) as i64);
    }
    w.put_mov_reg_u64(Reg::X0, cell);
    w.put_mov_reg_reg(Reg::X1, Reg::SP);
    w.put_mov_reg_u64(Reg::X2, ARG_REGS.len() as u64);
    w.put_mov_reg_u64(Reg::X16, shim);
    w.put_blr_reg(Reg::X16);
    w.put_add_reg_reg_imm(Reg::SP, Reg::SP, spill);
    w.put_pop_reg_reg(Reg::X29, Reg::X30);
    w.put_ret();
    w.offset()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::code::arena::STUB_SLOT;

    #[test]
    fn redirect_encodes_ldr_br_with_literal() {
        let mut buf = [0u8; 16];
        unsafe {
            emit_redirect(buf.as_mut_ptr(), buf.len(), 0x1000, 0xDEAD_BEEF);
        }
        let ldr = u32::from_le_bytes(buf[0..4].try_into().unwrap());
        let br = u32::from_le_bytes(buf[4..8].try_into().unwrap());
        assert_eq!(ldr, 0x5800_0000 | (2 << 5) | 17);
        assert_eq!(br, 0xD61F_0000 | (17 << 5));
        assert_eq!(u64::from_le_bytes(buf[8..16].try_into().unwrap()), 0xDEAD_BEEF);
    }

    #[test]
    fn direct_stub_fits_a_slot() {
        let mut buf = [0u8; STUB_SLOT];
        let used = unsafe { emit_direct_stub(buf.as_mut_ptr(), buf.len(), 0x1000, 0x1234) };
        assert_eq!(used, 20); // 4-insn materialize + BR
        let br = u32::from_le_bytes(buf[16..20].try_into().unwrap());
        assert_eq!(br, 0xD61F_0000 | (17 << 5));
    }

    #[test]
    fn drop_ctx_stub_shifts_then_jumps() {
        let mut buf = [0u8; STUB_SLOT];
        let used = unsafe { emit_drop_ctx_stub(buf.as_mut_ptr(), buf.len(), 0x1000, 0x1234) };
        // MOV X0, X1 is the first shifted pair.
        let first = u32::from_le_bytes(buf[0..4].try_into().unwrap());
        assert_eq!(first, 0xAA00_03E0 | (1 << 16));
        assert!(used <= STUB_SLOT);
    }

    #[test]
    fn proxy_stub_fits_a_slot() {
        let mut buf = [0u8; STUB_SLOT];
        let used = unsafe {
            emit_proxy_stub(buf.as_mut_ptr(), buf.len(), 0x1000, 0xAAAA, 0xBBBB)
        };
        assert!(used <= STUB_SLOT, "proxy stub is {used} bytes");
        let first = u32::from_le_bytes(buf[0..4].try_into().unwrap());
        assert_eq!(first, 0xA9BF_7BFD); // stp x29, x30, [sp, #-16]!
        let last = u32::from_le_bytes(buf[used - 4..used].try_into().unwrap());
        assert_eq!(last, 0xD65F_03C0); // ret
    }
}
