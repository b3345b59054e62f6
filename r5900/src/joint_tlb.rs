//! The 48 entry joint TLB.
//!
//! Translation is purely functional: a failed lookup hands back the `Exception` to dispatch and
//! the caller decides what to do with it. Entries map an even/odd pair of pages each.

use modular_bitfield::{bitfield, specifiers::*};
use tracing::{trace, warn};

use super::coprocessor0::{Cop0, Exception};

pub const TLB_ENTRIES: usize = 48;

#[bitfield(bits = 32)]
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct EntryHi {
    pub asid: B8,
    #[skip] __: B5,
    pub vpn2: B19,
}

#[bitfield(bits = 32)]
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct EntryLo {
    pub global: bool,
    pub valid: bool,
    pub dirty: bool,
    pub cache_mode: B3,
    pub pfn: B20,
    #[skip] __: B5,
    pub scratchpad: bool,
}

#[bitfield(bits = 32)]
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct PageMask {
    #[skip] __: B13,
    pub mask: B12,
    #[skip] __: B7,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Access {
    Fetch,
    Load,
    Store,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct TlbEntry {
    pub page_mask: PageMask,
    pub entry_hi: EntryHi,
    pub lo: [EntryLo; 2],
}

impl TlbEntry {
    /// Placeholder for an entry nothing has been written to. It points into kseg0, which
    /// bypasses the TLB, and `Tlb` never matches it.
    fn unused(index: usize) -> TlbEntry {
        TlbEntry {
            page_mask: PageMask::new(),
            entry_hi: EntryHi::new().with_vpn2((0x8000_0000 >> 13) + index as u32),
            lo: [EntryLo::new(), EntryLo::new()],
        }
    }

    /// Builds an entry from EntryHi/EntryLo0/EntryLo1/PageMask, the way TLBWI and TLBWR do.
    pub fn from_cop0(cop0: &Cop0) -> TlbEntry {
        TlbEntry {
            page_mask: cop0.page_mask,
            entry_hi: cop0.entry_hi,
            lo: [cop0.entry_lo0, cop0.entry_lo1],
        }
    }

    /// Bits of a virtual address that index into one page of the pair.
    #[inline(always)]
    pub fn offset_mask(&self) -> u32 {
        ((self.page_mask.mask() as u32) << 12) | 0xfff
    }

    /// Bits of a virtual address compared against VPN2.
    #[inline(always)]
    fn vpn_mask(&self) -> u32 {
        !((self.offset_mask() << 1) | 1)
    }

    #[inline(always)]
    fn vpn2_addr(&self) -> u32 {
        self.entry_hi.vpn2() << 13
    }

    /// Both halves have to be global for the entry to ignore ASIDs
    pub fn global(&self) -> bool {
        self.lo[0].global() && self.lo[1].global()
    }

    fn matches(&self, vaddr: u32, asid: u8) -> bool {
        let mask = self.vpn_mask();
        (vaddr & mask) == (self.vpn2_addr() & mask) && (self.global() || self.entry_hi.asid() == asid)
    }

    fn overlaps(&self, other: &TlbEntry) -> bool {
        let mask = self.vpn_mask() & other.vpn_mask();
        (self.vpn2_addr() & mask) == (other.vpn2_addr() & mask)
    }
}

pub struct Tlb {
    entries: [TlbEntry; TLB_ENTRIES],
    /// Written since reset and not evicted by a conflicting write
    in_use: [bool; TLB_ENTRIES],
}

impl Tlb {
    pub fn new() -> Tlb {
        Tlb {
            entries: std::array::from_fn(TlbEntry::unused),
            in_use: [false; TLB_ENTRIES],
        }
    }

    pub fn reset(&mut self) {
        *self = Tlb::new();
    }

    pub fn entry(&self, index: usize) -> &TlbEntry {
        &self.entries[index]
    }

    /// Stores an entry, evicting any other non-global entry that would match the same addresses
    /// under the same ASID.
    pub fn write(&mut self, index: usize, entry: TlbEntry) {
        for (i, other) in self.entries.iter_mut().enumerate() {
            if i == index || !self.in_use[i] || other.global() || entry.global() {
                continue;
            }
            if other.entry_hi.asid() == entry.entry_hi.asid() && other.overlaps(&entry) {
                warn!(
                    "TLB write to entry {} conflicts with entry {} (VPN2 {:#x}, ASID {}), dropping the old one",
                    index, i, other.entry_hi.vpn2(), other.entry_hi.asid()
                );
                *other = TlbEntry::unused(i);
                self.in_use[i] = false;
            }
        }
        trace!("TLB[{}] = {:x?}", index, entry);
        self.entries[index] = entry;
        self.in_use[index] = true;
    }

    fn live(&self) -> impl Iterator<Item = (usize, &TlbEntry)> + '_ {
        self.entries.iter().enumerate().filter(|(i, _)| self.in_use[*i])
    }

    /// TLBP: index of the entry matching EntryHi, if any
    pub fn probe(&self, entry_hi: EntryHi) -> Option<usize> {
        let vaddr = entry_hi.vpn2() << 13;
        self.live().find(|(_, e)| e.matches(vaddr, entry_hi.asid())).map(|(i, _)| i)
    }

    pub fn lookup(&self, vaddr: u32, asid: u8) -> Option<&TlbEntry> {
        self.live().find(|(_, e)| e.matches(vaddr, asid)).map(|(_, e)| e)
    }

    /// Virtual to physical translation.
    ///
    /// kseg0 and kseg1 bypass the TLB, as does kuseg while Status.ERL is set.
    pub fn translate(&self, vaddr: u32, access: Access, cop0: &Cop0) -> Result<u32, Exception> {
        match vaddr {
            0x8000_0000..=0xbfff_ffff => return Ok(vaddr & 0x1fff_ffff),
            0x0000_0000..=0x7fff_ffff if cop0.status.erl() => return Ok(vaddr),
            _ => {}
        }

        let store = access == Access::Store;
        let Some(entry) = self.lookup(vaddr, cop0.entry_hi.asid()) else {
            return Err(Exception::TlbRefill { vaddr, store });
        };

        let offset_mask = entry.offset_mask();
        let odd = (vaddr & (offset_mask + 1)) != 0;
        let lo = entry.lo[odd as usize];

        if !lo.valid() {
            return Err(Exception::TlbInvalid { vaddr, store });
        }
        if store && !lo.dirty() {
            return Err(Exception::TlbModified { vaddr });
        }
        Ok((lo.pfn() << 12) | (vaddr & offset_mask))
    }
}

impl Default for Tlb {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coprocessor0::Status;

    fn user_cop0(asid: u8) -> Cop0 {
        let mut cop0 = Cop0::new();
        cop0.status = Status::new();
        cop0.entry_hi = EntryHi::new().with_asid(asid);
        cop0
    }

    fn lo(pfn: u32, valid: bool, dirty: bool) -> EntryLo {
        EntryLo::new().with_pfn(pfn).with_valid(valid).with_dirty(dirty)
    }

    fn entry(vpn2: u32, asid: u8, lo0: EntryLo, lo1: EntryLo) -> TlbEntry {
        TlbEntry {
            page_mask: PageMask::new(),
            entry_hi: EntryHi::new().with_vpn2(vpn2).with_asid(asid),
            lo: [lo0, lo1],
        }
    }

    #[test]
    fn unmapped_segments_bypass() {
        let tlb = Tlb::new();
        let cop0 = user_cop0(0);
        assert_eq!(tlb.translate(0x8000_1234, Access::Load, &cop0), Ok(0x1234));
        assert_eq!(tlb.translate(0xbfc0_0000, Access::Fetch, &cop0), Ok(0x1fc0_0000));
        assert_eq!(tlb.translate(0x0000_1000, Access::Load, &cop0),
            Err(Exception::TlbRefill { vaddr: 0x1000, store: false }));

        let mut erl = cop0.clone();
        erl.status.set_erl(true);
        assert_eq!(tlb.translate(0x0000_1000, Access::Store, &erl), Ok(0x1000));
    }

    #[test]
    fn odd_page_store() {
        let mut tlb = Tlb::new();
        // 0x0100_0000 >> 13: the pair covering 0x0100_0000..0x0100_2000
        tlb.write(5, entry(0x800, 3, lo(0x40, true, true), lo(0x50, true, true)));

        let cop0 = user_cop0(3);
        assert_eq!(tlb.translate(0x0100_1000, Access::Store, &cop0), Ok(0x0005_0000));
        assert_eq!(tlb.translate(0x0100_0010, Access::Load, &cop0), Ok(0x0004_0010));

        // Clean page
        tlb.write(5, entry(0x800, 3, lo(0x40, true, true), lo(0x50, true, false)));
        assert_eq!(tlb.translate(0x0100_1000, Access::Store, &cop0),
            Err(Exception::TlbModified { vaddr: 0x0100_1000 }));
        assert_eq!(tlb.translate(0x0100_1000, Access::Load, &cop0), Ok(0x0005_0000));
    }

    #[test]
    fn asid_mismatch_refills() {
        let mut tlb = Tlb::new();
        tlb.write(0, entry(0x800, 3, lo(0x40, true, true), lo(0x50, true, true)));
        let cop0 = user_cop0(4);
        assert_eq!(tlb.translate(0x0100_0000, Access::Load, &cop0),
            Err(Exception::TlbRefill { vaddr: 0x0100_0000, store: false }));
    }

    #[test]
    fn global_needs_both_halves() {
        let mut tlb = Tlb::new();
        let g = |l: EntryLo| l.with_global(true);
        tlb.write(0, entry(0x800, 3, g(lo(0x40, true, true)), lo(0x50, true, true)));
        assert!(tlb.translate(0x0100_0000, Access::Load, &user_cop0(9)).is_err());

        tlb.write(0, entry(0x800, 3, g(lo(0x40, true, true)), g(lo(0x50, true, true))));
        assert_eq!(tlb.translate(0x0100_0000, Access::Load, &user_cop0(9)), Ok(0x0004_0000));
    }

    #[test]
    fn invalid_half() {
        let mut tlb = Tlb::new();
        tlb.write(0, entry(0x800, 0, lo(0x40, true, true), lo(0x50, false, false)));
        assert_eq!(tlb.translate(0x0100_1800, Access::Store, &user_cop0(0)),
            Err(Exception::TlbInvalid { vaddr: 0x0100_1800, store: true }));
    }

    #[test]
    fn large_pages() {
        let mut tlb = Tlb::new();
        // 16K pages, the pair covers 32K
        let mut e = entry(0x0040_0000 >> 13, 0, lo(0x100, true, true), lo(0x200, true, true));
        e.page_mask = PageMask::new().with_mask(0x3);
        tlb.write(0, e);
        let cop0 = user_cop0(0);
        assert_eq!(tlb.translate(0x0040_3ffc, Access::Load, &cop0), Ok(0x0010_3ffc));
        assert_eq!(tlb.translate(0x0040_4000, Access::Load, &cop0), Ok(0x0020_0000));
        assert!(tlb.translate(0x0040_8000, Access::Load, &cop0).is_err());
    }

    #[test]
    fn conflicting_write_evicts_old_entry() {
        let mut tlb = Tlb::new();
        tlb.write(1, entry(0x800, 3, lo(0x40, true, true), lo(0x50, true, true)));
        tlb.write(2, entry(0x800, 3, lo(0x60, true, true), lo(0x70, true, true)));
        assert_eq!(tlb.probe(EntryHi::new().with_vpn2(0x800).with_asid(3)), Some(2));
        assert_eq!(tlb.translate(0x0100_0000, Access::Load, &user_cop0(3)), Ok(0x0006_0000));

        // Different ASIDs can coexist
        tlb.write(3, entry(0x800, 4, lo(0x60, true, true), lo(0x70, true, true)));
        assert_eq!(tlb.probe(EntryHi::new().with_vpn2(0x800).with_asid(3)), Some(2));
        assert_eq!(tlb.probe(EntryHi::new().with_vpn2(0x800).with_asid(4)), Some(3));
        assert_eq!(tlb.probe(EntryHi::new().with_vpn2(0x900).with_asid(4)), None);
    }

    #[test]
    fn empty_entries_never_match() {
        let mut tlb = Tlb::new();
        // VPN2s in kseg0, where fresh entries park
        for vaddr in [0x8000_0000u32, 0x8000_2000, 0x8005_e000] {
            assert_eq!(tlb.probe(EntryHi::new().with_vpn2(vaddr >> 13)), None);
            assert!(tlb.lookup(vaddr, 0).is_none());
        }

        // Nor do entries dropped by a conflicting write
        tlb.write(1, entry(0x800, 3, lo(0x40, true, true), lo(0x50, true, true)));
        tlb.write(2, entry(0x800, 3, lo(0x60, true, true), lo(0x70, true, true)));
        assert_eq!(tlb.probe(EntryHi::new().with_vpn2(0x8000_2000 >> 13)), None);
    }
}
