#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Reg {
    X0 = 0,
    X1 = 1,
    X2 = 2,
    X3 = 3,
    X4 = 4,
    X5 = 5,
    X6 = 6,
    X7 = 7,
    X16 = 16,
    X17 = 17,
    X29 = 29,
    X30 = 30,
    SP = 31,
}

/// Minimal AArch64 instruction emitter for redirect and stub generation.
#[derive(Debug)]
pub struct Arm64Writer {
    base: *mut u32,
    code: *mut u32,
    pc: u64,
    size: usize,
}

impl Arm64Writer {
    pub unsafe fn new(buffer: *mut u8, size: usize, pc: u64) -> Self {
        Self {
            base: buffer as *mut u32,
            code: buffer as *mut u32,
            pc,
            size,
        }
    }

    pub fn pc(&self) -> u64 {
        self.pc
    }

    pub fn offset(&self) -> usize {
        (self.code as usize).saturating_sub(self.base as usize)
    }

    fn can_write(&self, bytes: usize) -> bool {
        self.offset() + bytes <= self.size
    }

    unsafe fn put_u32(&mut self, insn: u32) {
        debug_assert!(self.can_write(4));
        self.code.write(insn);
        self.code = self.code.add(1);
        self.pc = self.pc.wrapping_add(4);
    }

    pub unsafe fn put_u32_raw(&mut self, insn: u32) {
        self.put_u32(insn);
    }

    pub unsafe fn put_ret(&mut self) {
        self.put_u32(0xD65F_03C0);
    }

    pub unsafe fn put_br_reg(&mut self, reg: Reg) {
        let n = reg as u32;
        self.put_u32(0xD61F_0000 | (n << 5));
    }

    pub unsafe fn put_blr_reg(&mut self, reg: Reg) {
        let n = reg as u32;
        self.put_u32(0xD63F_0000 | (n << 5));
    }

    /// `STP Xa, Xb, [SP, #-16]!`
    pub unsafe fn put_push_reg_reg(&mut self, a: Reg, b: Reg) {
        let rt = a as u32;
        let rt2 = b as u32;
        let rn = Reg::SP as u32;
        let imm7 = (-2i32 as u32) & 0x7f; // -16 bytes, scaled by 8
        self.put_u32(0xA980_0000 | (imm7 << 15) | (rt2 << 10) | (rn << 5) | rt);
    }

    /// `LDP Xa, Xb, [SP], #16`
    pub unsafe fn put_pop_reg_reg(&mut self, a: Reg, b: Reg) {
        let rt = a as u32;
        let rt2 = b as u32;
        let rn = Reg::SP as u32;
        let imm7 = 2u32;
        self.put_u32(0xA8C0_0000 | (imm7 << 15) | (rt2 << 10) | (rn << 5) | rt);
    }

    /// `ADD Xd, Xn, #imm12` (shift=0)
    pub unsafe fn put_add_reg_reg_imm(&mut self, d: Reg, n: Reg, imm: u32) {
        let rd = d as u32;
        let rn = n as u32;
        let imm12 = imm & 0x0fff;
        self.put_u32(0x9100_0000 | (imm12 << 10) | (rn << 5) | rd);
    }

    /// `SUB Xd, Xn, #imm12` (shift=0)
    pub unsafe fn put_sub_reg_reg_imm(&mut self, d: Reg, n: Reg, imm: u32) {
        let rd = d as u32;
        let rn = n as u32;
        let imm12 = imm & 0x0fff;
        self.put_u32(0xD100_0000 | (imm12 << 10) | (rn << 5) | rd);
    }

    /// `MOV Xd, Xs`.
    ///
    /// SP is not a general register for the ORR alias (encoding 31 would read
    /// as XZR), so SP moves go through `ADD ..., #0`.
    pub unsafe fn put_mov_reg_reg(&mut self, dst: Reg, src: Reg) {
        if src == Reg::SP || dst == Reg::SP {
            self.put_add_reg_reg_imm(dst, src, 0);
            return;
        }
        let rd = dst as u32;
        let rm = src as u32;
        self.put_u32(0xAA00_03E0 | (rm << 16) | rd);
    }

    /// Materialize an absolute 64-bit constant with MOVZ + three MOVK.
    ///
    /// Fixed four-instruction form; no literal pools, no PC-relative
    /// semantics in generated code.
    pub unsafe fn put_mov_reg_u64(&mut self, dst: Reg, value: u64) {
        let rd = dst as u32;
        let mut first = true;
        for (hw, shift) in [(0u32, 0u32), (1, 16), (2, 32), (3, 48)] {
            let imm16 = ((value >> shift) & 0xffff) as u32;
            if first {
                self.put_u32(0xD280_0000 | (hw << 21) | (imm16 << 5) | rd);
                first = false;
            } else {
                self.put_u32(0xF280_0000 | (hw << 21) | (imm16 << 5) | rd);
            }
        }
    }

    /// `LDR Xt, [PC, #8]; BR Xt; .quad addr` — 16-byte absolute jump.
    pub unsafe fn put_ldr_br_address(&mut self, reg: Reg, addr: u64) {
        let rt = reg as u32;
        let imm19 = 2u32; // 2 * 4 = 8 bytes ahead
        self.put_u32(0x5800_0000 | (imm19 << 5) | rt);
        self.put_br_reg(reg);

        debug_assert!(self.can_write(8));
        let p = self.code as *mut u8;
        (p as *mut u64).write_unaligned(addr);
        self.code = (p.add(8)) as *mut u32;
        self.pc = self.pc.wrapping_add(8);
    }

    /// `LDR Xt, [Xn, #imm]` (unsigned, 8-byte scaled)
    pub unsafe fn put_ldr_reg_reg_offset(&mut self, rt: Reg, rn: Reg, offset: i64) {
        assert!(offset >= 0 && (offset & 0x7) == 0, "unsupported LDR offset: {offset}");
        let imm12 = ((offset as u64) >> 3) as u32;
        let rt = rt as u32;
        let rn = rn as u32;
        self.put_u32(0xF940_0000 | (imm12 << 10) | (rn << 5) | rt);
    }

    /// `STR Xt, [Xn, #imm]` (unsigned, 8-byte scaled)
    pub unsafe fn put_str_reg_reg_offset(&mut self, rt: Reg, rn: Reg, offset: i64) {
        assert!(offset >= 0 && (offset & 0x7) == 0, "unsupported STR offset: {offset}");
        let imm12 = ((offset as u64) >> 3) as u32;
        let rt = rt as u32;
        let rn = rn as u32;
        self.put_u32(0xF900_0000 | (imm12 << 10) | (rn << 5) | rt);
    }
}
