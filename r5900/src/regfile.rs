use std::fmt;

use super::instructions::MIPS_REG_NAMES;

/// Guest general purpose registers plus the LO/HI pair.
///
/// Every register is 128 bits wide. Integer instructions only see the low doubleword and leave
/// the upper half alone; only quadword loads and stores move the whole thing.
#[derive(Clone, PartialEq, Eq)]
pub struct RegFile {
    pub(crate) gpr: [u128; 32],
    pub lo: u128,
    pub hi: u128,
}

const LOW_MASK: u128 = u64::MAX as u128;

impl RegFile {
    pub fn new() -> RegFile {
        RegFile {
            gpr: [0; 32],
            lo: 0,
            hi: 0,
        }
    }

    pub fn read(&self, reg: u8) -> u128 {
        self.gpr[reg as usize]
    }

    pub fn write(&mut self, reg: u8, val: u128) {
        if reg != 0 {
            self.gpr[reg as usize] = val;
        }
    }

    #[inline(always)]
    pub fn read64(&self, reg: u8) -> u64 {
        self.gpr[reg as usize] as u64
    }

    /// Replaces the low doubleword, keeping the upper half.
    #[inline(always)]
    pub fn write64(&mut self, reg: u8, val: u64) {
        if reg != 0 {
            let r = &mut self.gpr[reg as usize];
            *r = (*r & !LOW_MASK) | val as u128;
        }
    }

    pub fn lo64(&self) -> u64 {
        self.lo as u64
    }

    pub fn hi64(&self) -> u64 {
        self.hi as u64
    }

    pub fn set_lo64(&mut self, val: u64) {
        self.lo = (self.lo & !LOW_MASK) | val as u128;
    }

    pub fn set_hi64(&mut self, val: u64) {
        self.hi = (self.hi & !LOW_MASK) | val as u128;
    }
}

impl Default for RegFile {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for RegFile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut map = f.debug_map();
        for (name, value) in MIPS_REG_NAMES.iter().zip(self.gpr.iter()).skip(1) {
            if *value != 0 {
                map.entry(name, &format_args!("{:#x}", value));
            }
        }
        map.entry(&"lo", &format_args!("{:#x}", self.lo));
        map.entry(&"hi", &format_args!("{:#x}", self.hi));
        map.finish()
    }
}
