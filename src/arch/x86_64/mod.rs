pub mod writer;

use writer::{Reg, X86_64Writer};

use super::Encoder;

/// System V integer argument registers, in order.
const ARG_REGS: [Reg; 6] = [Reg::RDI, Reg::RSI, Reg::RDX, Reg::RCX, Reg::R8, Reg::R9];

pub static ENCODER: Encoder = Encoder {
    arch: "x86_64",
    word_size: 8,
    patch_size: 16,
    arg_regs: ARG_REGS.len(),
    emit_redirect,
    emit_direct_stub,
    emit_drop_ctx_stub,
    emit_proxy_stub,
};

/// Absolute redirect written over a function prologue: the 16-byte
/// RIP-indirect far jump, exactly `patch_size` bytes.
unsafe fn emit_redirect(buf: *mut u8, len: usize, pc: u64, target: u64) {
    let mut w = X86_64Writer::new(buf, len, pc);
    w.put_jmp_far(target);
    debug_assert_eq!(w.offset(), ENCODER.patch_size);
}

/// `mov r11, dest; jmp r11` — lands at `dest` with all argument registers
/// untouched (r11 is caller-saved scratch).
unsafe fn emit_direct_stub(buf: *mut u8, len: usize, pc: u64, dest: u64) -> usize {
    let mut w = X86_64Writer::new(buf, len, pc);
    w.put_mov_reg_imm64(Reg::R11, dest);
    w.put_jmp_reg(Reg::R11);
    w.offset()
}

/// Shift every argument register down by one (dropping the leading receiver
/// word) and tail-jump to `dest`.
unsafe fn emit_drop_ctx_stub(buf: *mut u8, len: usize, pc: u64, dest: u64) -> usize {
    let mut w = X86_64Writer::new(buf, len, pc);
    for pair in ARG_REGS.windows(2) {
        w.put_mov_reg_reg(pair[0], pair[1]);
    }
    w.put_mov_reg_imm64(Reg::R11, dest);
    w.put_jmp_reg(Reg::R11);
    w.offset()
}

/// Reflective-invoker stub: spill the six integer argument registers to a
/// stack frame and call `shim(cell, argv, argc)`, returning its result.
///
/// Frame math: on entry rsp ≡ 8 (mod 16); `push rbp` realigns to 0 and the
/// 0x40-byte spill area keeps the call site 16-byte aligned.
unsafe fn emit_proxy_stub(buf: *mut u8, len: usize, pc: u64, cell: u64, shim: u64) -> usize {
    let mut w = X86_64Writer::new(buf, len, pc);
    w.put_push_reg(Reg::RBP);
    w.put_mov_reg_reg(Reg::RBP, Reg::RSP);
    w.put_sub_reg_imm32(Reg::RSP, 0x40);
    for (i, reg) in ARG_REGS.iter().enumerate() {
        w.put_mov_mem_reg(Reg::RSP, (i * 8) as i32, *reg);
    }
    w.put_mov_reg_imm64(Reg::RDI, cell);
    w.put_lea_reg_mem(Reg::RSI, Reg::RSP, 0);
    w.put_mov_reg_imm64(Reg::RDX, ARG_REGS.len() as u64);
    w.put_mov_reg_imm64(Reg::R11, shim);
    w.put_call_reg(Reg::R11);
    w.put_mov_reg_reg(Reg::RSP, Reg::RBP);
    w.put_pop_reg(Reg::RBP);
    w.put_ret();
    w.offset()
}
