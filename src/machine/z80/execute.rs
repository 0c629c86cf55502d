//! Instruction execution.
//!
//! Opcodes are decoded by bit fields: `x` = bits 7-6, `y` = bits 5-3,
//! `z` = bits 2-0, `p` = y >> 1, `q` = y & 1. Under a DD/FD prefix the
//! HL accessors transparently retarget IX/IY; instructions touching
//! `(HL)` resolve `(IX+d)` through `mem_operand_addr`, which also
//! charges the displacement T-states.

use super::flags::*;
use super::{Bus, IndexMode, InterruptMode, Z80};

impl Z80 {
    // ── Operand helpers ────────────────────────────────────────

    /// 8-bit register by decode index, honoring the index prefix for
    /// H and L. Index 6 is the memory operand and never comes here.
    fn reg8(&self, idx: u8) -> u8 {
        match idx {
            0 => self.b,
            1 => self.c,
            2 => self.d,
            3 => self.e,
            4 => match self.index {
                IndexMode::Hl => self.h,
                IndexMode::Ix => (self.ix >> 8) as u8,
                IndexMode::Iy => (self.iy >> 8) as u8,
            },
            5 => match self.index {
                IndexMode::Hl => self.l,
                IndexMode::Ix => self.ix as u8,
                IndexMode::Iy => self.iy as u8,
            },
            _ => self.a,
        }
    }

    fn set_reg8(&mut self, idx: u8, value: u8) {
        match idx {
            0 => self.b = value,
            1 => self.c = value,
            2 => self.d = value,
            3 => self.e = value,
            4 => match self.index {
                IndexMode::Hl => self.h = value,
                IndexMode::Ix => self.ix = (self.ix & 0x00FF) | (value as u16) << 8,
                IndexMode::Iy => self.iy = (self.iy & 0x00FF) | (value as u16) << 8,
            },
            5 => match self.index {
                IndexMode::Hl => self.l = value,
                IndexMode::Ix => self.ix = (self.ix & 0xFF00) | value as u16,
                IndexMode::Iy => self.iy = (self.iy & 0xFF00) | value as u16,
            },
            _ => self.a = value,
        }
    }

    /// Plain register access: H and L stay H and L even under a
    /// prefix. Used when the other operand is `(IX+d)` and by the CB
    /// groups.
    fn reg8_plain(&self, idx: u8) -> u8 {
        match idx {
            0 => self.b,
            1 => self.c,
            2 => self.d,
            3 => self.e,
            4 => self.h,
            5 => self.l,
            _ => self.a,
        }
    }

    fn set_reg8_plain(&mut self, idx: u8, value: u8) {
        match idx {
            0 => self.b = value,
            1 => self.c = value,
            2 => self.d = value,
            3 => self.e = value,
            4 => self.h = value,
            5 => self.l = value,
            _ => self.a = value,
        }
    }

    /// Register pair table rp: BC, DE, HL-like, SP.
    fn rp(&self, p: u8) -> u16 {
        match p {
            0 => self.bc(),
            1 => self.de(),
            2 => self.hl_like(),
            _ => self.sp,
        }
    }

    fn set_rp(&mut self, p: u8, value: u16) {
        match p {
            0 => self.set_bc(value),
            1 => self.set_de(value),
            2 => self.set_hl_like(value),
            _ => self.sp = value,
        }
    }

    /// Register pair table rp2: BC, DE, HL-like, AF.
    fn rp2(&self, p: u8) -> u16 {
        match p {
            0 => self.bc(),
            1 => self.de(),
            2 => self.hl_like(),
            _ => self.af(),
        }
    }

    fn set_rp2(&mut self, p: u8, value: u16) {
        match p {
            0 => self.set_bc(value),
            1 => self.set_de(value),
            2 => self.set_hl_like(value),
            _ => self.set_af(value),
        }
    }

    /// Condition table: NZ, Z, NC, C, PO, PE, P, M.
    fn cond(&self, y: u8) -> bool {
        match y {
            0 => self.f & FLAG_Z == 0,
            1 => self.f & FLAG_Z != 0,
            2 => self.f & FLAG_C == 0,
            3 => self.f & FLAG_C != 0,
            4 => self.f & FLAG_PV == 0,
            5 => self.f & FLAG_PV != 0,
            6 => self.f & FLAG_S == 0,
            _ => self.f & FLAG_S != 0,
        }
    }

    fn alu(&mut self, y: u8, value: u8) {
        match y {
            0 => self.add8(value, false),
            1 => self.add8(value, true),
            2 => self.sub8(value, false, true),
            3 => self.sub8(value, true, true),
            4 => self.and8(value),
            5 => self.xor8(value),
            6 => self.or8(value),
            _ => self.sub8(value, false, false), // CP
        }
    }

    fn rot(&mut self, y: u8, value: u8) -> u8 {
        match y {
            0 => self.rlc(value),
            1 => self.rrc(value),
            2 => self.rl(value),
            3 => self.rr(value),
            4 => self.sla(value),
            5 => self.sra(value),
            6 => self.sll(value),
            _ => self.srl(value),
        }
    }

    fn bit_test(&mut self, y: u8, value: u8, high53: u8) {
        let tested = value & (1 << y);
        let mut flags = (self.f & FLAG_C) | FLAG_H | (high53 & (FLAG_5 | FLAG_3));
        if tested == 0 {
            flags |= FLAG_Z | FLAG_PV;
        }
        if y == 7 && tested != 0 {
            flags |= FLAG_S;
        }
        self.f = flags;
    }

    // ── Main table ─────────────────────────────────────────────

    pub(crate) fn execute_main(&mut self, bus: &mut impl Bus, op: u8) -> u32 {
        let x = op >> 6;
        let y = (op >> 3) & 0x07;
        let z = op & 0x07;
        let p = y >> 1;
        let q = y & 0x01;

        match x {
            0 => self.execute_x0(bus, y, z, p, q),
            1 => {
                if op == 0x76 {
                    // HALT
                    self.halted = true;
                    4
                } else {
                    self.execute_ld_r_r(bus, y, z)
                }
            }
            2 => {
                // ALU A, r[z]
                let mut cycles = 4;
                let value = if z == 6 {
                    cycles = 7;
                    let addr = self.mem_operand_addr(bus, &mut cycles);
                    bus.read(addr)
                } else {
                    self.reg8(z)
                };
                self.alu(y, value);
                cycles
            }
            _ => self.execute_x3(bus, y, z, p, q),
        }
    }

    fn execute_x0(&mut self, bus: &mut impl Bus, y: u8, z: u8, p: u8, q: u8) -> u32 {
        match z {
            0 => match y {
                0 => 4, // NOP
                1 => {
                    // EX AF, AF'
                    std::mem::swap(&mut self.a, &mut self.a_alt);
                    std::mem::swap(&mut self.f, &mut self.f_alt);
                    4
                }
                2 => {
                    // DJNZ d
                    let d = self.fetch_byte(bus) as i8;
                    self.b = self.b.wrapping_sub(1);
                    if self.b != 0 {
                        self.pc = self.pc.wrapping_add(d as u16);
                        13
                    } else {
                        8
                    }
                }
                3 => {
                    // JR d
                    let d = self.fetch_byte(bus) as i8;
                    self.pc = self.pc.wrapping_add(d as u16);
                    12
                }
                _ => {
                    // JR cc, d
                    let d = self.fetch_byte(bus) as i8;
                    if self.cond(y - 4) {
                        self.pc = self.pc.wrapping_add(d as u16);
                        12
                    } else {
                        7
                    }
                }
            },
            1 => {
                if q == 0 {
                    // LD rp, nn
                    let nn = self.fetch_word(bus);
                    self.set_rp(p, nn);
                    10
                } else {
                    // ADD HL, rp
                    let result = self.add16(self.hl_like(), self.rp(p));
                    self.set_hl_like(result);
                    11
                }
            }
            2 => match (q, p) {
                (0, 0) => {
                    bus.write(self.bc(), self.a);
                    7
                }
                (0, 1) => {
                    bus.write(self.de(), self.a);
                    7
                }
                (0, 2) => {
                    // LD (nn), HL
                    let addr = self.fetch_word(bus);
                    let value = self.hl_like();
                    self.write_word(bus, addr, value);
                    16
                }
                (0, _) => {
                    // LD (nn), A
                    let addr = self.fetch_word(bus);
                    bus.write(addr, self.a);
                    13
                }
                (1, 0) => {
                    self.a = bus.read(self.bc());
                    7
                }
                (1, 1) => {
                    self.a = bus.read(self.de());
                    7
                }
                (1, 2) => {
                    // LD HL, (nn)
                    let addr = self.fetch_word(bus);
                    let value = self.read_word(bus, addr);
                    self.set_hl_like(value);
                    16
                }
                _ => {
                    // LD A, (nn)
                    let addr = self.fetch_word(bus);
                    self.a = bus.read(addr);
                    13
                }
            },
            3 => {
                // INC / DEC rp
                let value = self.rp(p);
                let value = if q == 0 {
                    value.wrapping_add(1)
                } else {
                    value.wrapping_sub(1)
                };
                self.set_rp(p, value);
                6
            }
            4 | 5 => {
                // INC / DEC r[y]
                let dec = z == 5;
                if y == 6 {
                    let mut cycles = 11;
                    let addr = self.mem_operand_addr(bus, &mut cycles);
                    let value = bus.read(addr);
                    let result = if dec { self.dec8(value) } else { self.inc8(value) };
                    bus.write(addr, result);
                    cycles
                } else {
                    let value = self.reg8(y);
                    let result = if dec { self.dec8(value) } else { self.inc8(value) };
                    self.set_reg8(y, result);
                    4
                }
            }
            6 => {
                // LD r[y], n
                if y == 6 {
                    // The displacement precedes the immediate, and the
                    // fetches overlap: 10 T plain, 15 T indexed.
                    let (addr, cycles) = match self.index {
                        IndexMode::Hl => (self.hl(), 10),
                        IndexMode::Ix => {
                            let d = self.fetch_byte(bus) as i8;
                            (self.ix.wrapping_add(d as u16), 15)
                        }
                        IndexMode::Iy => {
                            let d = self.fetch_byte(bus) as i8;
                            (self.iy.wrapping_add(d as u16), 15)
                        }
                    };
                    let value = self.fetch_byte(bus);
                    bus.write(addr, value);
                    cycles
                } else {
                    let value = self.fetch_byte(bus);
                    self.set_reg8(y, value);
                    7
                }
            }
            _ => {
                // Accumulator/flag group
                match y {
                    0 => {
                        // RLCA
                        let carry = self.a >> 7;
                        self.a = self.a.rotate_left(1);
                        self.f = (self.f & (FLAG_S | FLAG_Z | FLAG_PV))
                            | (self.a & (FLAG_5 | FLAG_3))
                            | carry;
                    }
                    1 => {
                        // RRCA
                        let carry = self.a & 0x01;
                        self.a = self.a.rotate_right(1);
                        self.f = (self.f & (FLAG_S | FLAG_Z | FLAG_PV))
                            | (self.a & (FLAG_5 | FLAG_3))
                            | carry;
                    }
                    2 => {
                        // RLA
                        let carry = self.a >> 7;
                        self.a = self.a << 1 | (self.f & FLAG_C);
                        self.f = (self.f & (FLAG_S | FLAG_Z | FLAG_PV))
                            | (self.a & (FLAG_5 | FLAG_3))
                            | carry;
                    }
                    3 => {
                        // RRA
                        let carry = self.a & 0x01;
                        self.a = self.a >> 1 | (self.f & FLAG_C) << 7;
                        self.f = (self.f & (FLAG_S | FLAG_Z | FLAG_PV))
                            | (self.a & (FLAG_5 | FLAG_3))
                            | carry;
                    }
                    4 => self.daa(),
                    5 => {
                        // CPL
                        self.a = !self.a;
                        self.f = (self.f & (FLAG_S | FLAG_Z | FLAG_PV | FLAG_C))
                            | FLAG_H
                            | FLAG_N
                            | (self.a & (FLAG_5 | FLAG_3));
                    }
                    6 => {
                        // SCF
                        self.f = (self.f & (FLAG_S | FLAG_Z | FLAG_PV))
                            | FLAG_C
                            | (self.a & (FLAG_5 | FLAG_3));
                    }
                    _ => {
                        // CCF: H takes the old carry
                        let old_carry = self.f & FLAG_C;
                        self.f = ((self.f & (FLAG_S | FLAG_Z | FLAG_PV)) | (old_carry << 4))
                            | (self.a & (FLAG_5 | FLAG_3))
                            | (old_carry ^ FLAG_C);
                    }
                }
                4
            }
        }
    }

    fn execute_ld_r_r(&mut self, bus: &mut impl Bus, y: u8, z: u8) -> u32 {
        if y == 6 {
            // LD (HL/IX+d), r — the source register is never aliased
            let mut cycles = 7;
            let addr = self.mem_operand_addr(bus, &mut cycles);
            let value = self.reg8_plain(z);
            bus.write(addr, value);
            cycles
        } else if z == 6 {
            // LD r, (HL/IX+d)
            let mut cycles = 7;
            let addr = self.mem_operand_addr(bus, &mut cycles);
            let value = bus.read(addr);
            self.set_reg8_plain(y, value);
            cycles
        } else {
            let value = self.reg8(z);
            self.set_reg8(y, value);
            4
        }
    }

    fn execute_x3(&mut self, bus: &mut impl Bus, y: u8, z: u8, p: u8, q: u8) -> u32 {
        match z {
            0 => {
                // RET cc
                if self.cond(y) {
                    self.pc = self.pop(bus);
                    11
                } else {
                    5
                }
            }
            1 => {
                if q == 0 {
                    // POP rp2
                    let value = self.pop(bus);
                    self.set_rp2(p, value);
                    10
                } else {
                    match p {
                        0 => {
                            // RET
                            self.pc = self.pop(bus);
                            10
                        }
                        1 => {
                            // EXX
                            std::mem::swap(&mut self.b, &mut self.b_alt);
                            std::mem::swap(&mut self.c, &mut self.c_alt);
                            std::mem::swap(&mut self.d, &mut self.d_alt);
                            std::mem::swap(&mut self.e, &mut self.e_alt);
                            std::mem::swap(&mut self.h, &mut self.h_alt);
                            std::mem::swap(&mut self.l, &mut self.l_alt);
                            4
                        }
                        2 => {
                            // JP (HL)
                            self.pc = self.hl_like();
                            4
                        }
                        _ => {
                            // LD SP, HL
                            self.sp = self.hl_like();
                            6
                        }
                    }
                }
            }
            2 => {
                // JP cc, nn
                let addr = self.fetch_word(bus);
                if self.cond(y) {
                    self.pc = addr;
                }
                10
            }
            3 => match y {
                0 => {
                    // JP nn
                    self.pc = self.fetch_word(bus);
                    10
                }
                2 => {
                    // OUT (n), A — A rides the high address lines
                    let low = self.fetch_byte(bus) as u16;
                    let port = (self.a as u16) << 8 | low;
                    bus.io_write(port, self.a);
                    11
                }
                3 => {
                    // IN A, (n)
                    let low = self.fetch_byte(bus) as u16;
                    let port = (self.a as u16) << 8 | low;
                    self.a = bus.io_read(port);
                    11
                }
                4 => {
                    // EX (SP), HL
                    let sp = self.sp;
                    let value = self.read_word(bus, sp);
                    let hl = self.hl_like();
                    self.write_word(bus, sp, hl);
                    self.set_hl_like(value);
                    19
                }
                5 => {
                    // EX DE, HL — never index-aliased
                    std::mem::swap(&mut self.d, &mut self.h);
                    std::mem::swap(&mut self.e, &mut self.l);
                    4
                }
                6 => {
                    // DI
                    self.iff1 = false;
                    self.iff2 = false;
                    4
                }
                _ => {
                    // EI: takes effect after the next instruction
                    self.iff1 = true;
                    self.iff2 = true;
                    self.ei_pending = true;
                    4
                }
            },
            4 => {
                // CALL cc, nn
                let addr = self.fetch_word(bus);
                if self.cond(y) {
                    let pc = self.pc;
                    self.push(bus, pc);
                    self.pc = addr;
                    17
                } else {
                    10
                }
            }
            5 => {
                if q == 0 {
                    // PUSH rp2
                    let value = self.rp2(p);
                    self.push(bus, value);
                    11
                } else {
                    // CALL nn (p=0; other rows are the prefixes)
                    let addr = self.fetch_word(bus);
                    let pc = self.pc;
                    self.push(bus, pc);
                    self.pc = addr;
                    17
                }
            }
            6 => {
                // ALU A, n
                let value = self.fetch_byte(bus);
                self.alu(y, value);
                7
            }
            _ => {
                // RST y*8
                let pc = self.pc;
                self.push(bus, pc);
                self.pc = (y as u16) * 8;
                11
            }
        }
    }

    // ── CB group ───────────────────────────────────────────────

    pub(crate) fn execute_cb(&mut self, bus: &mut impl Bus, op: u8) -> u32 {
        let x = op >> 6;
        let y = (op >> 3) & 0x07;
        let z = op & 0x07;

        match x {
            0 => {
                // Rotates / shifts
                if z == 6 {
                    let addr = self.hl();
                    let value = bus.read(addr);
                    let result = self.rot(y, value);
                    bus.write(addr, result);
                    15
                } else {
                    let value = self.reg8_plain(z);
                    let result = self.rot(y, value);
                    self.set_reg8_plain(z, result);
                    8
                }
            }
            1 => {
                // BIT y, r
                if z == 6 {
                    let addr = self.hl();
                    let value = bus.read(addr);
                    self.bit_test(y, value, (addr >> 8) as u8);
                    12
                } else {
                    let value = self.reg8_plain(z);
                    self.bit_test(y, value, value);
                    8
                }
            }
            2 => {
                // RES y, r
                if z == 6 {
                    let addr = self.hl();
                    let value = bus.read(addr) & !(1 << y);
                    bus.write(addr, value);
                    15
                } else {
                    let value = self.reg8_plain(z) & !(1 << y);
                    self.set_reg8_plain(z, value);
                    8
                }
            }
            _ => {
                // SET y, r
                if z == 6 {
                    let addr = self.hl();
                    let value = bus.read(addr) | 1 << y;
                    bus.write(addr, value);
                    15
                } else {
                    let value = self.reg8_plain(z) | 1 << y;
                    self.set_reg8_plain(z, value);
                    8
                }
            }
        }
    }

    /// DDCB / FDCB: every operation touches `(IX+d)`; all except BIT
    /// also copy the result into the register selected by `z`.
    pub(crate) fn execute_indexed_cb(&mut self, bus: &mut impl Bus, d: i8, op: u8) -> u32 {
        let x = op >> 6;
        let y = (op >> 3) & 0x07;
        let z = op & 0x07;

        let base = match self.index {
            IndexMode::Iy => self.iy,
            _ => self.ix,
        };
        let addr = base.wrapping_add(d as u16);
        let value = bus.read(addr);

        match x {
            1 => {
                self.bit_test(y, value, (addr >> 8) as u8);
                20
            }
            _ => {
                let result = match x {
                    0 => self.rot(y, value),
                    2 => value & !(1 << y),
                    _ => value | 1 << y,
                };
                bus.write(addr, result);
                if z != 6 {
                    self.set_reg8_plain(z, result);
                }
                23
            }
        }
    }

    // ── ED group ───────────────────────────────────────────────

    pub(crate) fn execute_ed(&mut self, bus: &mut impl Bus, op: u8) -> u32 {
        let x = op >> 6;
        let y = (op >> 3) & 0x07;
        let z = op & 0x07;
        let p = y >> 1;
        let q = y & 0x01;

        match x {
            1 => match z {
                0 => {
                    // IN r, (C) — r=6 only sets flags
                    let value = bus.io_read(self.bc());
                    if y != 6 {
                        self.set_reg8_plain(y, value);
                    }
                    self.f = (self.f & FLAG_C) | SZ53P[value as usize];
                    12
                }
                1 => {
                    // OUT (C), r — r=6 outputs zero
                    let value = if y == 6 { 0 } else { self.reg8_plain(y) };
                    bus.io_write(self.bc(), value);
                    12
                }
                2 => {
                    if q == 0 {
                        let value = self.rp_plain(p);
                        self.sbc16(value);
                    } else {
                        let value = self.rp_plain(p);
                        self.adc16(value);
                    }
                    15
                }
                3 => {
                    let addr = self.fetch_word(bus);
                    if q == 0 {
                        // LD (nn), rp
                        let value = self.rp_plain(p);
                        self.write_word(bus, addr, value);
                    } else {
                        // LD rp, (nn)
                        let value = self.read_word(bus, addr);
                        self.set_rp_plain(p, value);
                    }
                    20
                }
                4 => {
                    // NEG (every y slot decodes to it)
                    let value = self.a;
                    self.a = 0;
                    self.sub8(value, false, true);
                    8
                }
                5 => {
                    // RETN / RETI
                    self.pc = self.pop(bus);
                    self.iff1 = self.iff2;
                    14
                }
                6 => {
                    // IM 0/1/2 (with the undocumented duplicates)
                    self.im = match y & 0x03 {
                        2 => InterruptMode::Mode1,
                        3 => InterruptMode::Mode2,
                        _ => InterruptMode::Mode0,
                    };
                    8
                }
                _ => match y {
                    0 => {
                        self.i = self.a;
                        9
                    }
                    1 => {
                        self.r = self.a;
                        9
                    }
                    2 => {
                        // LD A, I
                        self.a = self.i;
                        self.f = (self.f & FLAG_C)
                            | SZ53[self.a as usize]
                            | if self.iff2 { FLAG_PV } else { 0 };
                        9
                    }
                    3 => {
                        // LD A, R
                        self.a = self.r;
                        self.f = (self.f & FLAG_C)
                            | SZ53[self.a as usize]
                            | if self.iff2 { FLAG_PV } else { 0 };
                        9
                    }
                    4 => {
                        // RRD
                        let addr = self.hl();
                        let value = bus.read(addr);
                        let result = (self.a & 0x0F) << 4 | value >> 4;
                        self.a = (self.a & 0xF0) | (value & 0x0F);
                        bus.write(addr, result);
                        self.f = (self.f & FLAG_C) | SZ53P[self.a as usize];
                        18
                    }
                    5 => {
                        // RLD
                        let addr = self.hl();
                        let value = bus.read(addr);
                        let result = value << 4 | (self.a & 0x0F);
                        self.a = (self.a & 0xF0) | value >> 4;
                        bus.write(addr, result);
                        self.f = (self.f & FLAG_C) | SZ53P[self.a as usize];
                        18
                    }
                    _ => 8, // ED 77 / ED 7F are NOPs
                },
            },
            2 if z <= 3 && y >= 4 => self.execute_block(bus, y, z),
            _ => 8, // Undefined ED opcodes behave as 8T NOPs
        }
    }

    /// Plain (never index-aliased) rp table for the ED group.
    fn rp_plain(&self, p: u8) -> u16 {
        match p {
            0 => self.bc(),
            1 => self.de(),
            2 => self.hl(),
            _ => self.sp,
        }
    }

    fn set_rp_plain(&mut self, p: u8, value: u16) {
        match p {
            0 => self.set_bc(value),
            1 => self.set_de(value),
            2 => self.set_hl(value),
            _ => self.sp = value,
        }
    }

    /// Block transfer / compare / IO: LDI..OTDR. `y` 4/5 select the
    /// direction, 6/7 the repeating variants; `z` selects the family.
    fn execute_block(&mut self, bus: &mut impl Bus, y: u8, z: u8) -> u32 {
        let increment = y & 0x01 == 0;
        let repeat = y >= 6;

        match z {
            0 => {
                // LDI / LDD / LDIR / LDDR
                let value = bus.read(self.hl());
                bus.write(self.de(), value);

                let hl = if increment {
                    self.hl().wrapping_add(1)
                } else {
                    self.hl().wrapping_sub(1)
                };
                let de = if increment {
                    self.de().wrapping_add(1)
                } else {
                    self.de().wrapping_sub(1)
                };
                self.set_hl(hl);
                self.set_de(de);
                let bc = self.bc().wrapping_sub(1);
                self.set_bc(bc);

                let n = value.wrapping_add(self.a);
                let mut flags = self.f & (FLAG_S | FLAG_Z | FLAG_C);
                if n & 0x08 != 0 {
                    flags |= FLAG_3;
                }
                if n & 0x02 != 0 {
                    flags |= FLAG_5;
                }
                if bc != 0 {
                    flags |= FLAG_PV;
                }
                self.f = flags;

                if repeat && bc != 0 {
                    self.pc = self.pc.wrapping_sub(2);
                    21
                } else {
                    16
                }
            }
            1 => {
                // CPI / CPD / CPIR / CPDR
                let value = bus.read(self.hl());
                let result = self.a.wrapping_sub(value);
                let half = (self.a & 0x0F) < (value & 0x0F);

                let hl = if increment {
                    self.hl().wrapping_add(1)
                } else {
                    self.hl().wrapping_sub(1)
                };
                self.set_hl(hl);
                let bc = self.bc().wrapping_sub(1);
                self.set_bc(bc);

                let mut flags = (self.f & FLAG_C) | FLAG_N | (SZ53[result as usize] & (FLAG_S | FLAG_Z));
                if half {
                    flags |= FLAG_H;
                }
                let n = result.wrapping_sub(half as u8);
                if n & 0x08 != 0 {
                    flags |= FLAG_3;
                }
                if n & 0x02 != 0 {
                    flags |= FLAG_5;
                }
                if bc != 0 {
                    flags |= FLAG_PV;
                }
                self.f = flags;

                if repeat && bc != 0 && result != 0 {
                    self.pc = self.pc.wrapping_sub(2);
                    21
                } else {
                    16
                }
            }
            2 => {
                // INI / IND / INIR / INDR
                let value = bus.io_read(self.bc());
                bus.write(self.hl(), value);

                let hl = if increment {
                    self.hl().wrapping_add(1)
                } else {
                    self.hl().wrapping_sub(1)
                };
                self.set_hl(hl);
                self.b = self.b.wrapping_sub(1);

                let c_term = if increment {
                    self.c.wrapping_add(1)
                } else {
                    self.c.wrapping_sub(1)
                };
                let k = value as u16 + c_term as u16;
                let mut flags = SZ53[self.b as usize];
                if value & 0x80 != 0 {
                    flags |= FLAG_N;
                }
                if k > 0xFF {
                    flags |= FLAG_H | FLAG_C;
                }
                if SZ53P[((k as u8 & 0x07) ^ self.b) as usize] & FLAG_PV != 0 {
                    flags |= FLAG_PV;
                }
                self.f = flags;

                if repeat && self.b != 0 {
                    self.pc = self.pc.wrapping_sub(2);
                    21
                } else {
                    16
                }
            }
            _ => {
                // OUTI / OUTD / OTIR / OTDR — B decrements before the
                // port address goes out
                let value = bus.read(self.hl());
                self.b = self.b.wrapping_sub(1);
                bus.io_write(self.bc(), value);

                let hl = if increment {
                    self.hl().wrapping_add(1)
                } else {
                    self.hl().wrapping_sub(1)
                };
                self.set_hl(hl);

                let k = value as u16 + self.l as u16;
                let mut flags = SZ53[self.b as usize];
                if value & 0x80 != 0 {
                    flags |= FLAG_N;
                }
                if k > 0xFF {
                    flags |= FLAG_H | FLAG_C;
                }
                if SZ53P[((k as u8 & 0x07) ^ self.b) as usize] & FLAG_PV != 0 {
                    flags |= FLAG_PV;
                }
                self.f = flags;

                if repeat && self.b != 0 {
                    self.pc = self.pc.wrapping_sub(2);
                    21
                } else {
                    16
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::machine::z80::TestBus;

    #[test]
    fn test_add_hl_rp() {
        let mut cpu = Z80::new();
        let mut bus = TestBus::new(&[0x09]); // ADD HL,BC
        cpu.set_hl(0x0FFF);
        cpu.set_bc(0x0001);
        cpu.step(&mut bus);
        assert_eq!(cpu.hl(), 0x1000);
        assert_ne!(cpu.f & FLAG_H, 0);
        assert_eq!(cpu.f & FLAG_C, 0);

        let mut cpu = Z80::new();
        let mut bus = TestBus::new(&[0x09]);
        cpu.set_hl(0xFFFF);
        cpu.set_bc(0x0001);
        cpu.step(&mut bus);
        assert_eq!(cpu.hl(), 0x0000);
        assert_ne!(cpu.f & FLAG_C, 0);
    }

    #[test]
    fn test_sbc_adc_hl() {
        let mut cpu = Z80::new();
        let mut bus = TestBus::new(&[0xED, 0x42]); // SBC HL,BC
        cpu.set_hl(0x1000);
        cpu.set_bc(0x1000);
        cpu.f = 0;
        cpu.step(&mut bus);
        assert_eq!(cpu.hl(), 0);
        assert_ne!(cpu.f & FLAG_Z, 0);
        assert_ne!(cpu.f & FLAG_N, 0);

        let mut cpu = Z80::new();
        let mut bus = TestBus::new(&[0xED, 0x4A]); // ADC HL,BC
        cpu.set_hl(0x7FFF);
        cpu.set_bc(0x0001);
        cpu.f = 0;
        cpu.step(&mut bus);
        assert_eq!(cpu.hl(), 0x8000);
        assert_ne!(cpu.f & FLAG_PV, 0); // signed overflow
        assert_ne!(cpu.f & FLAG_S, 0);
    }

    #[test]
    fn test_ld_nn_rp_ed() {
        let mut cpu = Z80::new();
        let mut bus = TestBus::new(&[0xED, 0x43, 0x00, 0x90]); // LD (0x9000),BC
        cpu.set_bc(0xBEEF);
        cpu.step(&mut bus);
        assert_eq!(bus.mem[0x9000], 0xEF);
        assert_eq!(bus.mem[0x9001], 0xBE);

        let mut cpu = Z80::new();
        let mut bus = TestBus::new(&[0xED, 0x7B, 0x00, 0x90]); // LD SP,(0x9000)
        bus.mem[0x9000] = 0x34;
        bus.mem[0x9001] = 0x12;
        cpu.step(&mut bus);
        assert_eq!(cpu.sp, 0x1234);
    }

    #[test]
    fn test_neg() {
        let mut cpu = Z80::new();
        let mut bus = TestBus::new(&[0xED, 0x44]);
        cpu.a = 0x01;
        cpu.step(&mut bus);
        assert_eq!(cpu.a, 0xFF);
        assert_ne!(cpu.f & FLAG_N, 0);
        assert_ne!(cpu.f & FLAG_C, 0);
    }

    #[test]
    fn test_rrd_rld() {
        let mut cpu = Z80::new();
        let mut bus = TestBus::new(&[0xED, 0x67]); // RRD
        cpu.a = 0x84;
        cpu.set_hl(0x5000);
        bus.mem[0x5000] = 0x20;
        cpu.step(&mut bus);
        assert_eq!(cpu.a, 0x80);
        assert_eq!(bus.mem[0x5000], 0x42);

        let mut cpu = Z80::new();
        let mut bus = TestBus::new(&[0xED, 0x6F]); // RLD
        cpu.a = 0x7A;
        cpu.set_hl(0x5000);
        bus.mem[0x5000] = 0x31;
        cpu.step(&mut bus);
        assert_eq!(cpu.a, 0x73);
        assert_eq!(bus.mem[0x5000], 0x1A);
    }

    #[test]
    fn test_cpir_finds_byte() {
        let mut cpu = Z80::new();
        let mut bus = TestBus::new(&[0xED, 0xB1]); // CPIR
        bus.mem[0x6000..0x6004].copy_from_slice(&[9, 8, 7, 6]);
        cpu.a = 7;
        cpu.set_hl(0x6000);
        cpu.set_bc(4);
        loop {
            cpu.step(&mut bus);
            if cpu.pc == 2 {
                break;
            }
        }
        assert_ne!(cpu.f & FLAG_Z, 0); // found
        assert_eq!(cpu.hl(), 0x6003); // one past the match
        assert_eq!(cpu.bc(), 1);
    }

    #[test]
    fn test_in_r_c_sets_flags() {
        let mut cpu = Z80::new();
        let mut bus = TestBus::new(&[0xED, 0x50]); // IN D,(C)
        bus.io_in = 0x00;
        cpu.set_bc(0x12FE);
        cpu.step(&mut bus);
        assert_eq!(cpu.d, 0x00);
        assert_ne!(cpu.f & FLAG_Z, 0);
        assert_ne!(cpu.f & FLAG_PV, 0); // even parity
    }

    #[test]
    fn test_out_c_r() {
        let mut cpu = Z80::new();
        let mut bus = TestBus::new(&[0xED, 0x79]); // OUT (C),A
        cpu.a = 0x42;
        cpu.set_bc(0x001F);
        cpu.step(&mut bus);
        assert_eq!(bus.io_writes, vec![(0x001F, 0x42)]);
    }

    #[test]
    fn test_undocumented_sll() {
        let mut cpu = Z80::new();
        let mut bus = TestBus::new(&[0xCB, 0x30]); // SLL B
        cpu.b = 0x80;
        cpu.step(&mut bus);
        assert_eq!(cpu.b, 0x01);
        assert_ne!(cpu.f & FLAG_C, 0);
    }

    #[test]
    fn test_ex_sp_hl_and_indexed() {
        let mut cpu = Z80::new();
        let mut bus = TestBus::new(&[0xE3]); // EX (SP),HL
        cpu.sp = 0x8000;
        cpu.set_hl(0x1234);
        bus.mem[0x8000] = 0x78;
        bus.mem[0x8001] = 0x56;
        let cycles = cpu.step(&mut bus);
        assert_eq!(cycles, 19);
        assert_eq!(cpu.hl(), 0x5678);
        assert_eq!(bus.mem[0x8000], 0x34);
        assert_eq!(bus.mem[0x8001], 0x12);

        let mut cpu = Z80::new();
        let mut bus = TestBus::new(&[0xDD, 0xE3]); // EX (SP),IX
        cpu.sp = 0x8000;
        cpu.ix = 0xAAAA;
        bus.mem[0x8000] = 0x01;
        let cycles = cpu.step(&mut bus);
        assert_eq!(cycles, 23);
        assert_eq!(cpu.ix, 0x0001);
    }

    #[test]
    fn test_add_ix_rp_uses_index_pair() {
        let mut cpu = Z80::new();
        let mut bus = TestBus::new(&[0xDD, 0x29]); // ADD IX,IX
        cpu.ix = 0x4000;
        cpu.step(&mut bus);
        assert_eq!(cpu.ix, 0x8000);
    }

    #[test]
    fn test_ld_h_from_ixd_is_plain_h() {
        // LD H,(IX+0): destination is the real H, not IXH
        let mut cpu = Z80::new();
        let mut bus = TestBus::new(&[0xDD, 0x66, 0x00]);
        cpu.ix = 0x9000;
        bus.mem[0x9000] = 0x99;
        cpu.step(&mut bus);
        assert_eq!(cpu.h, 0x99);
        assert_eq!(cpu.ix, 0x9000);
    }

    #[test]
    fn test_scf_ccf() {
        let mut cpu = Z80::new();
        let mut bus = TestBus::new(&[0x37, 0x3F]); // SCF; CCF
        cpu.f = 0;
        cpu.a = 0;
        cpu.step(&mut bus);
        assert_ne!(cpu.f & FLAG_C, 0);
        cpu.step(&mut bus);
        assert_eq!(cpu.f & FLAG_C, 0);
        assert_ne!(cpu.f & FLAG_H, 0); // H takes the old carry
    }

    #[test]
    fn test_rst() {
        let mut cpu = Z80::new();
        let mut bus = TestBus::new(&[0xFF]); // RST 38
        cpu.sp = 0x8000;
        let cycles = cpu.step(&mut bus);
        assert_eq!(cycles, 11);
        assert_eq!(cpu.pc, 0x0038);
        assert_eq!(bus.mem[0x7FFE], 0x01);
    }

    #[test]
    fn test_conditional_ret_timing() {
        let mut cpu = Z80::new();
        let mut bus = TestBus::new(&[0xC0]); // RET NZ
        cpu.sp = 0x8000;
        cpu.f = FLAG_Z;
        assert_eq!(cpu.step(&mut bus), 5); // not taken

        let mut cpu = Z80::new();
        let mut bus = TestBus::new(&[0xC0]);
        cpu.sp = 0x8000;
        bus.mem[0x8000] = 0x21;
        bus.mem[0x8001] = 0x43;
        cpu.f = 0;
        assert_eq!(cpu.step(&mut bus), 11); // taken
        assert_eq!(cpu.pc, 0x4321);
    }
}
