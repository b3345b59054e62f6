use common::util::ByteMask8;

use crate::coprocessor0::Exception;
use crate::regfile::RegFile;

#[derive(Debug, thiserror::Error, Copy, Clone, PartialEq, Eq)]
pub enum BusError {
    #[error("no device at physical address {0:#010x}")]
    Unmapped(u32),
}

/// The physical memory bus as seen from the core.
///
/// Addresses passed to `read64`/`write64` are doubleword aligned. Narrower accesses are built on
/// top of them with byte lane masks.
pub trait Bus {
    fn read64(&mut self, addr: u32) -> Result<u64, BusError>;
    fn write64(&mut self, addr: u32, value: u64, mask: ByteMask8) -> Result<(), BusError>;

    /// Word read used for instruction fetch. `addr` is word aligned.
    fn read32(&mut self, addr: u32) -> Result<u32, BusError> {
        let dword = self.read64(addr & !7)?;
        Ok((dword >> ((addr & 4) * 8)) as u32)
    }

    /// `addr` is quadword aligned
    fn read128(&mut self, addr: u32) -> Result<u128, BusError> {
        let lo = self.read64(addr)?;
        let hi = self.read64(addr + 8)?;
        Ok((hi as u128) << 64 | lo as u128)
    }

    fn write128(&mut self, addr: u32, value: u128) -> Result<(), BusError> {
        self.write64(addr, value as u64, ByteMask8::default())?;
        self.write64(addr + 8, (value >> 64) as u64, ByteMask8::default())
    }
}

/// Plain little-endian RAM mapped at physical address 0.
pub struct Ram {
    data: Vec<u64>,
}

impl Ram {
    /// `size` is in bytes and gets rounded up to a whole doubleword
    pub fn new(size: u32) -> Ram {
        Ram {
            data: vec![0; (size as usize + 7) / 8],
        }
    }

    pub fn size(&self) -> u32 {
        (self.data.len() * 8) as u32
    }

    fn index(&self, addr: u32) -> Result<usize, BusError> {
        let index = (addr >> 3) as usize;
        if index < self.data.len() {
            Ok(index)
        } else {
            Err(BusError::Unmapped(addr))
        }
    }

    /// Copies `bytes` in at `addr`, bypassing the core
    pub fn load(&mut self, addr: u32, bytes: &[u8]) -> Result<(), BusError> {
        let end = addr as u64 + bytes.len() as u64;
        if end > self.size() as u64 {
            return Err(BusError::Unmapped(self.size().max(addr)));
        }
        for (i, byte) in bytes.iter().enumerate() {
            let a = addr + i as u32;
            let mask = ByteMask8::new(1u32, a & 7);
            let index = (a >> 3) as usize;
            mask.masked_insert(&mut self.data[index], (*byte as u64) << ((a & 7) * 8));
        }
        Ok(())
    }

    /// Convenience for building guest programs
    pub fn load_words(&mut self, addr: u32, words: &[u32]) -> Result<(), BusError> {
        let bytes: Vec<u8> = words.iter().flat_map(|w| w.to_le_bytes()).collect();
        self.load(addr, &bytes)
    }
}

impl Bus for Ram {
    fn read64(&mut self, addr: u32) -> Result<u64, BusError> {
        let index = self.index(addr)?;
        Ok(self.data[index])
    }

    fn write64(&mut self, addr: u32, value: u64, mask: ByteMask8) -> Result<(), BusError> {
        let index = self.index(addr)?;
        mask.masked_insert(&mut self.data[index], value);
        Ok(())
    }
}

/// Numeric semantics for the opcode classes the compiler doesn't handle itself (MMI, COP1,
/// COP2, unaligned loads/stores, traps).
pub trait LeafOps {
    fn execute(&mut self, word: u32, regs: &mut RegFile) -> Result<(), Exception>;
}

/// Treats every leaf opcode as reserved.
#[derive(Debug, Default, Copy, Clone)]
pub struct ReservedLeaf;

impl LeafOps for ReservedLeaf {
    fn execute(&mut self, _word: u32, _regs: &mut RegFile) -> Result<(), Exception> {
        Err(Exception::ReservedInstruction)
    }
}
