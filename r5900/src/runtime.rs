//! Host side of compiled code: the helpers units call, and instruction fetch for the compiler.

use common::util::ByteMask8;
use tracing::{trace, warn};

use crate::backend::{Helper, Runtime, Site, ThreadedBackend};
use crate::cache::CodeCache;
use crate::compiler::InstructionSource;
use crate::coprocessor0::{Cop0, Exception, PROBE_FAILURE};
use crate::joint_tlb::{Access, Tlb, TlbEntry, TLB_ENTRIES};
use crate::memory::{Bus, LeafOps};
use crate::state::CpuState;

/// Everything a running unit can reach.
pub struct Env<'a> {
    pub state: &'a mut CpuState,
    pub tlb: &'a mut Tlb,
    pub bus: &'a mut dyn Bus,
    pub cache: &'a mut CodeCache,
    pub backend: &'a mut ThreadedBackend,
    pub leaf: &'a mut dyn LeafOps,
}

impl<'a> Env<'a> {
    fn translate(&self, vaddr: u32, access: Access, align: u32) -> Result<u32, Exception> {
        if vaddr & (align - 1) != 0 {
            return Err(Exception::AddressError { vaddr, store: access == Access::Store });
        }
        self.tlb.translate(vaddr, access, &self.state.cop0)
    }

    fn load(&mut self, vaddr: u32, width: u8, signed: bool) -> Result<u64, Exception> {
        let paddr = self.translate(vaddr, Access::Load, width as u32)?;
        let dword = self.bus.read64(paddr & !7).unwrap_or_else(|err| {
            warn!("{} (load from {:#010x}), reading zero", err, vaddr);
            0
        });

        let raw = dword >> ((paddr & 7) * 8);
        Ok(match (width, signed) {
            (1, true) => raw as i8 as i64 as u64,
            (1, false) => raw as u8 as u64,
            (2, true) => raw as i16 as i64 as u64,
            (2, false) => raw as u16 as u64,
            (4, true) => raw as i32 as i64 as u64,
            (4, false) => raw as u32 as u64,
            _ => raw,
        })
    }

    fn store(&mut self, vaddr: u32, value: u64, width: u8) -> Result<(), Exception> {
        let paddr = self.translate(vaddr, Access::Store, width as u32)?;
        let offset = paddr & 7;
        let mask = ByteMask8::new(width as u32, offset);
        if let Err(err) = self.bus.write64(paddr & !7, value << (offset * 8), mask) {
            warn!("{} (store to {:#010x}), dropped", err, vaddr);
        }
        self.cache.notify_write(paddr, width as u32, &mut *self.backend);
        Ok(())
    }

    /// LQ/SQ ignore the low four address bits
    fn load_quad(&mut self, vaddr: u32, rt: u8) -> Result<(), Exception> {
        let paddr = self.translate(vaddr & !0xf, Access::Load, 1)?;
        let value = self.bus.read128(paddr).unwrap_or_else(|err| {
            warn!("{} (quad load from {:#010x}), reading zero", err, vaddr);
            0
        });
        self.state.regs.write(rt, value);
        Ok(())
    }

    fn store_quad(&mut self, vaddr: u32, rt: u8) -> Result<(), Exception> {
        let paddr = self.translate(vaddr & !0xf, Access::Store, 1)?;
        if let Err(err) = self.bus.write128(paddr, self.state.regs.read(rt)) {
            warn!("{} (quad store to {:#010x}), dropped", err, vaddr);
        }
        self.cache.notify_write(paddr, 16, &mut *self.backend);
        Ok(())
    }

    fn tlb_index(cop0: &Cop0, index: u32) -> Option<usize> {
        let index = index as usize;
        if index >= TLB_ENTRIES {
            warn!("TLB index {} out of range (Index = {:#x}), ignored", index, cop0.index);
            return None;
        }
        Some(index)
    }

    fn tlb_op(&mut self, helper: Helper) {
        let cop0 = &mut self.state.cop0;
        match helper {
            Helper::Tlbr => {
                if let Some(index) = Self::tlb_index(cop0, cop0.index) {
                    let entry = self.tlb.entry(index);
                    cop0.page_mask = entry.page_mask;
                    cop0.entry_hi = entry.entry_hi;
                    cop0.entry_lo0 = entry.lo[0];
                    cop0.entry_lo1 = entry.lo[1];
                }
            }
            Helper::Tlbwi => {
                if let Some(index) = Self::tlb_index(cop0, cop0.index) {
                    self.tlb.write(index, TlbEntry::from_cop0(cop0));
                }
            }
            Helper::Tlbwr => {
                let index = cop0.next_random() as usize;
                self.tlb.write(index, TlbEntry::from_cop0(cop0));
            }
            Helper::Tlbp => {
                cop0.index = match self.tlb.probe(cop0.entry_hi) {
                    Some(index) => index as u32,
                    None => PROBE_FAILURE,
                };
            }
            _ => unreachable!(),
        }
    }
}

impl<'a> Runtime for Env<'a> {
    fn state(&mut self) -> &mut CpuState {
        &mut *self.state
    }

    fn call(&mut self, helper: Helper, args: &[u64], site: Site) -> u64 {
        let arg = |n: usize| args.get(n).copied().unwrap_or(0);

        let result = match helper {
            Helper::Load { width, signed } => self.load(arg(0) as u32, width, signed),
            Helper::Store { width } => self.store(arg(0) as u32, arg(1), width).map(|_| 0),
            Helper::LoadQuad { rt } => self.load_quad(arg(0) as u32, rt).map(|_| 0),
            Helper::StoreQuad { rt } => self.store_quad(arg(0) as u32, rt).map(|_| 0),
            Helper::Raise(exception) => Err(exception),
            Helper::Mfc0 { reg } => Ok(self.state.cop0.read(reg) as i32 as i64 as u64),
            Helper::Mtc0 { reg } => {
                self.state.cop0.write(reg, arg(0) as u32);
                Ok(0)
            }
            Helper::Tlbr | Helper::Tlbwi | Helper::Tlbwr | Helper::Tlbp => {
                self.tlb_op(helper);
                Ok(0)
            }
            Helper::Eret => {
                self.state.next_pc = self.state.cop0.eret();
                trace!("ERET to {:#010x}", self.state.next_pc);
                Ok(0)
            }
            Helper::SetEie(enable) => {
                self.state.cop0.status.set_eie(enable);
                Ok(0)
            }
            Helper::Leaf(word) => self.leaf.execute(word, &mut self.state.regs).map(|_| 0),
        };

        match result {
            Ok(value) => value,
            Err(exception) => {
                let pc = self.state.pc.wrapping_add(site.offset);
                self.state.raise(exception, pc, site.delay_slot);
                0
            }
        }
    }
}

/// Instruction fetch through the TLB, for the compiler.
pub struct Fetcher<'a> {
    pub tlb: &'a Tlb,
    pub cop0: &'a Cop0,
    pub bus: &'a mut dyn Bus,
}

impl<'a> InstructionSource for Fetcher<'a> {
    fn fetch(&mut self, vaddr: u32) -> Result<u32, Exception> {
        if vaddr & 3 != 0 {
            return Err(Exception::AddressError { vaddr, store: false });
        }
        let paddr = self.tlb.translate(vaddr, Access::Fetch, self.cop0)?;
        self.bus.read32(paddr).map_err(|err| {
            trace!("{} fetching {:#010x}", err, vaddr);
            Exception::InstructionBusError { vaddr }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::ArenaPolicy;
    use crate::coprocessor0::Status;
    use crate::joint_tlb::{EntryHi, EntryLo};
    use crate::memory::{Ram, ReservedLeaf};

    struct Parts {
        state: CpuState,
        tlb: Tlb,
        ram: Ram,
        cache: CodeCache,
        backend: ThreadedBackend,
        leaf: ReservedLeaf,
    }

    impl Parts {
        fn new() -> Parts {
            let mut state = CpuState::new(0x8000_0000);
            state.cop0.status = Status::new();
            Parts {
                state,
                tlb: Tlb::new(),
                ram: Ram::new(0x10_0000),
                cache: CodeCache::new(20, 16, ArenaPolicy::Fail, 16),
                backend: ThreadedBackend::new(16),
                leaf: ReservedLeaf,
            }
        }

        fn env(&mut self) -> Env<'_> {
            Env {
                state: &mut self.state,
                tlb: &mut self.tlb,
                bus: &mut self.ram,
                cache: &mut self.cache,
                backend: &mut self.backend,
                leaf: &mut self.leaf,
            }
        }
    }

    const SITE: Site = Site { offset: 0x10, delay_slot: false };

    #[test]
    fn loads_extend() {
        let mut parts = Parts::new();
        parts.ram.load(0x100, &[0x80, 0xff, 0x12, 0x34, 0x56, 0x78, 0x9a, 0xbc]).unwrap();
        let mut env = parts.env();
        let load = |env: &mut Env, addr, width, signed| env.call(Helper::Load { width, signed }, &[addr], SITE);
        assert_eq!(load(&mut env, 0x8000_0100, 1, true), 0xffff_ffff_ffff_ff80);
        assert_eq!(load(&mut env, 0x8000_0100, 1, false), 0x80);
        assert_eq!(load(&mut env, 0x8000_0100, 2, true), 0xffff_ffff_ffff_ff80);
        assert_eq!(load(&mut env, 0x8000_0102, 2, false), 0x3412);
        assert_eq!(load(&mut env, 0x8000_0104, 4, true), 0xffff_ffff_bc9a_7856);
        assert_eq!(load(&mut env, 0x8000_0100, 8, false), 0xbc9a_7856_3412_ff80);
        assert!(!env.state.exception);
    }

    #[test]
    fn misaligned_load_raises_address_error() {
        let mut parts = Parts::new();
        let mut env = parts.env();
        env.call(Helper::Load { width: 4, signed: true }, &[0x8000_0102], SITE);
        assert!(env.state.exception);
        assert_eq!(env.state.cop0.cause.exc_code(), 4);
        assert_eq!(env.state.cop0.bad_vaddr, 0x8000_0102);
        assert_eq!(env.state.cop0.epc, 0x8000_0010);
        assert_eq!(env.state.pc, 0x8000_0180);
    }

    #[test]
    fn stores_merge_bytes() {
        let mut parts = Parts::new();
        let mut env = parts.env();
        env.call(Helper::Store { width: 8 }, &[0x8000_0200, 0x1111_1111_1111_1111], SITE);
        env.call(Helper::Store { width: 2 }, &[0x8000_0202, 0xabcd], SITE);
        assert_eq!(parts.ram.read64(0x200).unwrap(), 0x1111_1111_abcd_1111);
    }

    #[test]
    fn quad_access_ignores_low_bits() {
        let mut parts = Parts::new();
        parts.state.regs.write(5, 0x0102_0304_0506_0708_090a_0b0c_0d0e_0f10);
        let mut env = parts.env();
        env.call(Helper::StoreQuad { rt: 5 }, &[0x8000_030c], SITE);
        env.call(Helper::LoadQuad { rt: 6 }, &[0x8000_0300], SITE);
        assert_eq!(parts.state.regs.read(6), 0x0102_0304_0506_0708_090a_0b0c_0d0e_0f10);
    }

    #[test]
    fn unmapped_bus_reads_zero() {
        let mut parts = Parts::new();
        let mut env = parts.env();
        assert_eq!(env.call(Helper::Load { width: 4, signed: false }, &[0x9000_0000], SITE), 0);
        assert!(!env.state.exception);
    }

    #[test]
    fn tlb_write_probe_read() {
        let mut parts = Parts::new();
        {
            let cop0 = &mut parts.state.cop0;
            cop0.index = 7;
            cop0.entry_hi = EntryHi::new().with_vpn2(0x800).with_asid(3);
            cop0.entry_lo0 = EntryLo::new().with_pfn(0x40).with_valid(true);
            cop0.entry_lo1 = EntryLo::new().with_pfn(0x50).with_valid(true).with_dirty(true);
        }
        let mut env = parts.env();
        env.call(Helper::Tlbwi, &[], SITE);

        env.state.cop0.index = 0;
        env.call(Helper::Tlbp, &[], SITE);
        assert_eq!(env.state.cop0.index, 7);

        env.state.cop0.entry_hi = EntryHi::new().with_vpn2(0x801).with_asid(3);
        env.call(Helper::Tlbp, &[], SITE);
        assert_eq!(env.state.cop0.index, PROBE_FAILURE);

        env.state.cop0.index = 7;
        env.call(Helper::Tlbr, &[], SITE);
        assert_eq!(env.state.cop0.entry_hi.vpn2(), 0x800);
        assert_eq!(env.state.cop0.entry_lo1.pfn(), 0x50);

        // Indices past the end are ignored
        env.state.cop0.index = 50;
        env.call(Helper::Tlbwi, &[], SITE);
        assert!(!env.state.exception);
    }

    #[test]
    fn tlbwr_steps_random() {
        let mut parts = Parts::new();
        let mut env = parts.env();
        env.call(Helper::Tlbwr, &[], SITE);
        env.call(Helper::Tlbwr, &[], SITE);
        assert_eq!(env.state.cop0.random, 45);
    }

    #[test]
    fn leaf_ops_default_to_reserved() {
        let mut parts = Parts::new();
        let mut env = parts.env();
        env.call(Helper::Leaf(0x7000_0000), &[], Site { offset: 4, delay_slot: true });
        assert!(env.state.exception);
        assert_eq!(env.state.cop0.cause.exc_code(), 10);
        assert!(env.state.cop0.cause.bd());
        assert_eq!(env.state.cop0.epc, 0x8000_0000);
    }

    #[test]
    fn fetch_checks_alignment_and_bus() {
        let mut parts = Parts::new();
        parts.ram.load_words(0x40, &[0x2408_ffff]).unwrap();
        let mut fetch = Fetcher { tlb: &parts.tlb, cop0: &parts.state.cop0, bus: &mut parts.ram };
        assert_eq!(fetch.fetch(0x8000_0040), Ok(0x2408_ffff));
        assert_eq!(fetch.fetch(0x8000_0042), Err(Exception::AddressError { vaddr: 0x8000_0042, store: false }));
        assert_eq!(fetch.fetch(0xa010_0000), Err(Exception::InstructionBusError { vaddr: 0xa010_0000 }));
    }
}
