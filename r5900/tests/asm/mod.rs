//! A tiny R5900 assembler and machine setup for the integration tests.
#![allow(dead_code)]

use r5900::coprocessor0::Status;
use r5900::memory::Ram;
use r5900::{Core, CoreConfig};

pub const ZERO: u8 = 0;
pub const T0: u8 = 8;
pub const T1: u8 = 9;
pub const T2: u8 = 10;
pub const T3: u8 = 11;
pub const T4: u8 = 12;
pub const T5: u8 = 13;
pub const K0: u8 = 26;
pub const RA: u8 = 31;

fn i(op: u32, rs: u8, rt: u8, imm: u16) -> u32 {
    op << 26 | (rs as u32) << 21 | (rt as u32) << 16 | imm as u32
}

fn r(rs: u8, rt: u8, rd: u8, sa: u8, funct: u32) -> u32 {
    (rs as u32) << 21 | (rt as u32) << 16 | (rd as u32) << 11 | (sa as u32) << 6 | funct
}

/// Branch offsets are in instructions, relative to the delay slot
pub fn addiu(rt: u8, rs: u8, imm: i16) -> u32 { i(0x09, rs, rt, imm as u16) }
pub fn ori(rt: u8, rs: u8, imm: u16) -> u32 { i(0x0d, rs, rt, imm) }
pub fn lui(rt: u8, imm: u16) -> u32 { i(0x0f, 0, rt, imm) }
pub fn beq(rs: u8, rt: u8, off: i16) -> u32 { i(0x04, rs, rt, off as u16) }
pub fn bne(rs: u8, rt: u8, off: i16) -> u32 { i(0x05, rs, rt, off as u16) }
pub fn beql(rs: u8, rt: u8, off: i16) -> u32 { i(0x14, rs, rt, off as u16) }
pub fn bnel(rs: u8, rt: u8, off: i16) -> u32 { i(0x15, rs, rt, off as u16) }
pub fn lb(rt: u8, off: i16, base: u8) -> u32 { i(0x20, base, rt, off as u16) }
pub fn lw(rt: u8, off: i16, base: u8) -> u32 { i(0x23, base, rt, off as u16) }
pub fn lbu(rt: u8, off: i16, base: u8) -> u32 { i(0x24, base, rt, off as u16) }
pub fn sw(rt: u8, off: i16, base: u8) -> u32 { i(0x2b, base, rt, off as u16) }
pub fn ld(rt: u8, off: i16, base: u8) -> u32 { i(0x37, base, rt, off as u16) }
pub fn sd(rt: u8, off: i16, base: u8) -> u32 { i(0x3f, base, rt, off as u16) }
pub fn lq(rt: u8, off: i16, base: u8) -> u32 { i(0x1e, base, rt, off as u16) }

/// `target` is the full address, only its low 28 bits get encoded
pub fn jal(target: u32) -> u32 { 0x03 << 26 | (target >> 2) & 0x03ff_ffff }

pub fn nop() -> u32 { 0 }
pub fn dsll32(rd: u8, rt: u8, sa: u8) -> u32 { r(0, rt, rd, sa, 0x3c) }
pub fn jr(rs: u8) -> u32 { r(rs, 0, 0, 0, 0x08) }
pub fn syscall() -> u32 { 0x0c }
pub fn mfhi(rd: u8) -> u32 { r(0, 0, rd, 0, 0x10) }
pub fn mflo(rd: u8) -> u32 { r(0, 0, rd, 0, 0x12) }
pub fn mult(rd: u8, rs: u8, rt: u8) -> u32 { r(rs, rt, rd, 0, 0x18) }
pub fn div(rs: u8, rt: u8) -> u32 { r(rs, rt, 0, 0, 0x1a) }
pub fn add(rd: u8, rs: u8, rt: u8) -> u32 { r(rs, rt, rd, 0, 0x20) }
pub fn addu(rd: u8, rs: u8, rt: u8) -> u32 { r(rs, rt, rd, 0, 0x21) }

pub fn mfc0(rt: u8, rd: u8) -> u32 { 0x10 << 26 | (rt as u32) << 16 | (rd as u32) << 11 }
pub fn mtc0(rt: u8, rd: u8) -> u32 { 0x10 << 26 | 4 << 21 | (rt as u32) << 16 | (rd as u32) << 11 }
pub fn tlbwi() -> u32 { 0x4200_0002 }
pub fn eret() -> u32 { 0x4200_0018 }

/// Spins on itself forever
pub fn halt() -> [u32; 2] {
    [beq(ZERO, ZERO, -1), nop()]
}

/// Builds a program image from instruction groups
pub fn program<I: IntoIterator<Item = u32>>(parts: impl IntoIterator<Item = I>) -> Vec<u32> {
    parts.into_iter().flatten().collect()
}

pub struct Machine {
    ram: Ram,
    config: CoreConfig,
}

impl Machine {
    pub fn new() -> Machine {
        Machine {
            ram: Ram::new(0x10_0000),
            config: CoreConfig {
                phys_addr_bits: 20,
                arena_pools: 16,
                ..CoreConfig::default()
            },
        }
    }

    pub fn config(mut self, f: impl FnOnce(&mut CoreConfig)) -> Machine {
        f(&mut self.config);
        self
    }

    /// Places `words` at physical address `paddr`
    pub fn code(mut self, paddr: u32, words: &[u32]) -> Machine {
        self.ram.load_words(paddr, words).unwrap();
        self
    }

    /// A core in kernel mode with exception vectors at 0x8000_0000, starting at `pc`
    pub fn boot(self, pc: u32) -> Core {
        let mut core = Core::new(CoreConfig { reset_pc: pc, ..self.config }, Box::new(self.ram));
        core.state_mut().cop0.status = Status::new();
        core
    }
}
