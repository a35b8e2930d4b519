#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Reg {
    RAX = 0,
    RCX = 1,
    RDX = 2,
    RBX = 3,
    RSP = 4,
    RBP = 5,
    RSI = 6,
    RDI = 7,
    R8 = 8,
    R9 = 9,
    R10 = 10,
    R11 = 11,
}

impl Reg {
    #[inline]
    fn lo3(self) -> u8 {
        (self as u8) & 7
    }

    #[inline]
    fn is_extended(self) -> bool {
        (self as u8) >= 8
    }
}

/// Minimal x86_64 instruction emitter for redirect and stub generation.
#[derive(Debug)]
pub struct X86_64Writer {
    base: *mut u8,
    code: *mut u8,
    pc: u64,
    size: usize,
}

impl X86_64Writer {
    pub unsafe fn new(buffer: *mut u8, size: usize, pc: u64) -> Self {
        Self {
            base: buffer,
            code: buffer,
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

    unsafe fn emit(&mut self, byte: u8) {
        debug_assert!(self.can_write(1));
        self.code.write(byte);
        self.code = self.code.add(1);
        self.pc = self.pc.wrapping_add(1);
    }

    unsafe fn emit_u32_le(&mut self, val: u32) {
        debug_assert!(self.can_write(4));
        (self.code as *mut u32).write_unaligned(val);
        self.code = self.code.add(4);
        self.pc = self.pc.wrapping_add(4);
    }

    unsafe fn emit_u64_le(&mut self, val: u64) {
        debug_assert!(self.can_write(8));
        (self.code as *mut u64).write_unaligned(val);
        self.code = self.code.add(8);
        self.pc = self.pc.wrapping_add(8);
    }

    /// REX prefix: 0100 W R X B
    #[inline]
    fn rex(w: bool, r: bool, x: bool, b: bool) -> u8 {
        0x40 | ((w as u8) << 3) | ((r as u8) << 2) | ((x as u8) << 1) | (b as u8)
    }

    /// ModRM byte: mod(2) | reg(3) | rm(3)
    #[inline]
    fn modrm(mod_: u8, reg: u8, rm: u8) -> u8 {
        ((mod_ & 3) << 6) | ((reg & 7) << 3) | (rm & 7)
    }

    /// `push reg` — [REX.B?] 50+rd
    pub unsafe fn put_push_reg(&mut self, reg: Reg) {
        if reg.is_extended() {
            self.emit(Self::rex(false, false, false, true));
        }
        self.emit(0x50 + reg.lo3());
    }

    /// `pop reg` — [REX.B?] 58+rd
    pub unsafe fn put_pop_reg(&mut self, reg: Reg) {
        if reg.is_extended() {
            self.emit(Self::rex(false, false, false, true));
        }
        self.emit(0x58 + reg.lo3());
    }

    /// `mov reg, imm64` — REX.W B8+rd io (10 bytes)
    pub unsafe fn put_mov_reg_imm64(&mut self, reg: Reg, imm: u64) {
        self.emit(Self::rex(true, false, false, reg.is_extended()));
        self.emit(0xB8 + reg.lo3());
        self.emit_u64_le(imm);
    }

    /// `mov dst, src` (64-bit) — REX.W 89 ModRM (mod=11)
    pub unsafe fn put_mov_reg_reg(&mut self, dst: Reg, src: Reg) {
        self.emit(Self::rex(true, src.is_extended(), false, dst.is_extended()));
        self.emit(0x89);
        self.emit(Self::modrm(0b11, src.lo3(), dst.lo3()));
    }

    /// Emit ModRM + optional SIB + disp32 for `[base + disp32]`.
    ///
    /// mod=10 (disp32) is used unconditionally so rm=5 never collides with
    /// the RIP-relative form. RSP as base needs the SIB byte 0x24.
    unsafe fn emit_modrm_base_disp32(&mut self, reg_field: u8, base: Reg, offset: i32) {
        let base_lo = base.lo3();
        if base_lo == 4 {
            self.emit(Self::modrm(0b10, reg_field, 0b100));
            self.emit(0x24);
        } else {
            self.emit(Self::modrm(0b10, reg_field, base_lo));
        }
        self.emit_u32_le(offset as u32);
    }

    /// `mov dst, [base + offset]` (64-bit load)
    pub unsafe fn put_mov_reg_mem(&mut self, dst: Reg, base: Reg, offset: i32) {
        self.emit(Self::rex(true, dst.is_extended(), false, base.is_extended()));
        self.emit(0x8B);
        self.emit_modrm_base_disp32(dst.lo3(), base, offset);
    }

    /// `mov [base + offset], src` (64-bit store)
    pub unsafe fn put_mov_mem_reg(&mut self, base: Reg, offset: i32, src: Reg) {
        self.emit(Self::rex(true, src.is_extended(), false, base.is_extended()));
        self.emit(0x89);
        self.emit_modrm_base_disp32(src.lo3(), base, offset);
    }

    /// `lea dst, [base + offset]` (64-bit)
    pub unsafe fn put_lea_reg_mem(&mut self, dst: Reg, base: Reg, offset: i32) {
        self.emit(Self::rex(true, dst.is_extended(), false, base.is_extended()));
        self.emit(0x8D);
        self.emit_modrm_base_disp32(dst.lo3(), base, offset);
    }

    /// `sub reg, imm32` — REX.W 81 /5 id
    pub unsafe fn put_sub_reg_imm32(&mut self, reg: Reg, imm: u32) {
        self.emit(Self::rex(true, false, false, reg.is_extended()));
        self.emit(0x81);
        self.emit(Self::modrm(0b11, 5, reg.lo3()));
        self.emit_u32_le(imm);
    }

    /// `add reg, imm32` — REX.W 81 /0 id
    pub unsafe fn put_add_reg_imm32(&mut self, reg: Reg, imm: u32) {
        self.emit(Self::rex(true, false, false, reg.is_extended()));
        self.emit(0x81);
        self.emit(Self::modrm(0b11, 0, reg.lo3()));
        self.emit_u32_le(imm);
    }

    /// Far absolute jump via `jmp [rip+2]; ud2; .quad addr` (16 bytes).
    ///
    /// Encoding: FF 25 02 00 00 00  0F 0B  <8-byte address>
    pub unsafe fn put_jmp_far(&mut self, target: u64) {
        self.emit(0xFF);
        self.emit(0x25);
        self.emit_u32_le(0x02); // disp32 = 2, skips the UD2
        self.emit(0x0F);
        self.emit(0x0B); // UD2 traps a fall-through
        self.emit_u64_le(target);
    }

    /// `jmp reg` — [REX.B?] FF /4
    pub unsafe fn put_jmp_reg(&mut self, reg: Reg) {
        if reg.is_extended() {
            self.emit(Self::rex(false, false, false, true));
        }
        self.emit(0xFF);
        self.emit(Self::modrm(0b11, 4, reg.lo3()));
    }

    /// `call reg` — [REX.B?] FF /2
    pub unsafe fn put_call_reg(&mut self, reg: Reg) {
        if reg.is_extended() {
            self.emit(Self::rex(false, false, false, true));
        }
        self.emit(0xFF);
        self.emit(Self::modrm(0b11, 2, reg.lo3()));
    }

    /// `ret` — C3
    pub unsafe fn put_ret(&mut self) {
        self.emit(0xC3);
    }

    /// Multi-byte NOP padding using the recommended NOP forms.
    pub unsafe fn put_nop_n(&mut self, n: usize) {
        let mut remaining = n;
        while remaining > 0 {
            match remaining {
                1 => { self.emit(0x90); remaining -= 1; }
                2 => { self.emit(0x66); self.emit(0x90); remaining -= 2; }
                3 => { self.emit(0x0F); self.emit(0x1F); self.emit(0x00); remaining -= 3; }
                4 => { self.emit(0x0F); self.emit(0x1F); self.emit(0x40); self.emit(0x00); remaining -= 4; }
                5 => { self.emit(0x0F); self.emit(0x1F); self.emit(0x44); self.emit(0x00); self.emit(0x00); remaining -= 5; }
                6 => { self.emit(0x66); self.emit(0x0F); self.emit(0x1F); self.emit(0x44); self.emit(0x00); self.emit(0x00); remaining -= 6; }
                7 => { self.emit(0x0F); self.emit(0x1F); self.emit(0x80); self.emit(0x00); self.emit(0x00); self.emit(0x00); self.emit(0x00); remaining -= 7; }
                8 => { self.emit(0x0F); self.emit(0x1F); self.emit(0x84); self.emit(0x00); self.emit(0x00); self.emit(0x00); self.emit(0x00); self.emit(0x00); remaining -= 8; }
                _ => {
                    self.emit(0x66); self.emit(0x0F); self.emit(0x1F); self.emit(0x84);
                    self.emit(0x00); self.emit(0x00); self.emit(0x00); self.emit(0x00); self.emit(0x00);
                    remaining -= 9;
                }
            }
        }
    }
}
