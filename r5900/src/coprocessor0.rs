use modular_bitfield::{bitfield, specifiers::*};
use tracing::trace;

use super::joint_tlb::{EntryHi, EntryLo, PageMask, TLB_ENTRIES};

pub const COP0_REG_NAMES: [&'static str; 32] = [
    "Index",
    "Random",
    "EntryLo0",
    "EntryLo1",
    "Context",
    "PageMask",
    "Wired",
    "unk7",
    "BadVAddr",
    "Count",
    "EntryHi",
    "Compare",
    "Status",
    "Cause",
    "EPC", // Exception Program Counter
    "PRId", // Processor ID
    "Config",
    "unk17",
    "unk18",
    "unk19",
    "unk20",
    "unk21",
    "unk22",
    "BadPAddr",
    "Debug",
    "Perf",
    "unk26",
    "unk27",
    "TagLo",
    "TagHi",
    "ErrorEPC",
    "unk31"
];

pub const INDEX: u8 = 0;
pub const RANDOM: u8 = 1;
pub const ENTRY_LO0: u8 = 2;
pub const ENTRY_LO1: u8 = 3;
pub const CONTEXT: u8 = 4;
pub const PAGE_MASK: u8 = 5;
pub const WIRED: u8 = 6;
pub const BAD_VADDR: u8 = 8;
pub const COUNT: u8 = 9;
pub const ENTRY_HI: u8 = 10;
pub const COMPARE: u8 = 11;
pub const STATUS: u8 = 12;
pub const CAUSE: u8 = 13;
pub const EPC: u8 = 14;
pub const PRID: u8 = 15;
pub const CONFIG: u8 = 16;
pub const ERROR_EPC: u8 = 30;

/// Set in Index by TLBP when no entry matched
pub const PROBE_FAILURE: u32 = 0x8000_0000;

#[bitfield(bits = 32)]
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct Status {
    pub ie: bool,
    pub exl: bool,
    pub erl: bool,
    pub ksu: B2,
    #[skip] __: B5,
    pub im: B6,
    pub eie: bool,
    pub edi: bool,
    pub ch: bool,
    #[skip] __: B3,
    pub bev: bool,
    pub dev: bool,
    #[skip] __: B4,
    pub cu: B4,
}

#[bitfield(bits = 32)]
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct Cause {
    #[skip] __: B2,
    pub exc_code: B5,
    #[skip] __: B3,
    pub ip: B6,
    #[skip] __: B12,
    pub ce: B2,
    pub bd2: bool,
    pub bd: bool,
}

/// Guest-visible exceptions.
///
/// These never leave the core as errors, they get dispatched to the guest's handler.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Exception {
    TlbModified { vaddr: u32 },
    TlbRefill { vaddr: u32, store: bool },
    TlbInvalid { vaddr: u32, store: bool },
    AddressError { vaddr: u32, store: bool },
    InstructionBusError { vaddr: u32 },
    Syscall,
    Breakpoint,
    ReservedInstruction,
    Overflow,
}

impl Exception {
    /// Value written to Cause.ExcCode
    pub fn code(&self) -> u8 {
        match *self {
            Exception::TlbModified { .. } => 1,
            Exception::TlbRefill { store: false, .. } | Exception::TlbInvalid { store: false, .. } => 2,
            Exception::TlbRefill { store: true, .. } | Exception::TlbInvalid { store: true, .. } => 3,
            Exception::AddressError { store: false, .. } => 4,
            Exception::AddressError { store: true, .. } => 5,
            Exception::InstructionBusError { .. } => 6,
            Exception::Syscall => 8,
            Exception::Breakpoint => 9,
            Exception::ReservedInstruction => 10,
            Exception::Overflow => 12,
        }
    }

    /// The address that gets latched into BadVAddr
    pub fn bad_vaddr(&self) -> Option<u32> {
        match *self {
            Exception::TlbModified { vaddr }
            | Exception::TlbRefill { vaddr, .. }
            | Exception::TlbInvalid { vaddr, .. }
            | Exception::AddressError { vaddr, .. } => Some(vaddr),
            _ => None,
        }
    }

    pub fn is_tlb(&self) -> bool {
        matches!(self, Exception::TlbModified { .. } | Exception::TlbRefill { .. } | Exception::TlbInvalid { .. })
    }
}

/// System control coprocessor
#[derive(Debug, Clone)]
pub struct Cop0 {
    pub index: u32,
    pub random: u32,
    pub entry_lo0: EntryLo,
    pub entry_lo1: EntryLo,
    pub context: u32,
    pub page_mask: PageMask,
    pub wired: u32,
    pub bad_vaddr: u32,
    pub count: u32,
    pub entry_hi: EntryHi,
    pub compare: u32,
    pub status: Status,
    pub cause: Cause,
    pub epc: u32,
    pub prid: u32,
    pub config: u32,
    pub error_epc: u32,
}

const RANDOM_RESET: u32 = TLB_ENTRIES as u32 - 1;

impl Cop0 {
    pub fn new() -> Cop0 {
        Cop0 {
            index: 0,
            random: RANDOM_RESET,
            entry_lo0: EntryLo::new(),
            entry_lo1: EntryLo::new(),
            context: 0,
            page_mask: PageMask::new(),
            wired: 0,
            bad_vaddr: 0,
            count: 0,
            entry_hi: EntryHi::new(),
            compare: 0,
            // Comes out of reset with BEV and ERL set
            status: Status::new().with_bev(true).with_erl(true),
            cause: Cause::new(),
            epc: 0,
            prid: 0x2e20,
            config: 0x440,
            error_epc: 0,
        }
    }

    pub fn read(&self, reg: u8) -> u32 {
        match reg {
            INDEX => self.index,
            RANDOM => self.random,
            ENTRY_LO0 => u32::from_le_bytes(self.entry_lo0.into_bytes()),
            ENTRY_LO1 => u32::from_le_bytes(self.entry_lo1.into_bytes()),
            CONTEXT => self.context,
            PAGE_MASK => u32::from_le_bytes(self.page_mask.into_bytes()),
            WIRED => self.wired,
            BAD_VADDR => self.bad_vaddr,
            COUNT => self.count,
            ENTRY_HI => u32::from_le_bytes(self.entry_hi.into_bytes()),
            COMPARE => self.compare,
            STATUS => u32::from_le_bytes(self.status.into_bytes()),
            CAUSE => u32::from_le_bytes(self.cause.into_bytes()),
            EPC => self.epc,
            PRID => self.prid,
            CONFIG => self.config,
            ERROR_EPC => self.error_epc,
            _ => {
                trace!("read from unmodeled COP0 register {}", COP0_REG_NAMES[reg as usize & 31]);
                0
            }
        }
    }

    pub fn write(&mut self, reg: u8, value: u32) {
        match reg {
            INDEX => self.index = value & 0x3f,
            ENTRY_LO0 => self.entry_lo0 = EntryLo::from_bytes((value & 0x83ff_ffff).to_le_bytes()),
            ENTRY_LO1 => self.entry_lo1 = EntryLo::from_bytes((value & 0x83ff_ffff).to_le_bytes()),
            CONTEXT => self.context = (self.context & 0x007f_fff0) | (value & 0xff80_0000),
            PAGE_MASK => self.page_mask = PageMask::from_bytes((value & 0x01ff_e000).to_le_bytes()),
            WIRED => {
                self.wired = value & 0x3f;
                self.random = RANDOM_RESET;
            }
            COUNT => self.count = value,
            ENTRY_HI => self.entry_hi = EntryHi::from_bytes((value & 0xffff_e0ff).to_le_bytes()),
            COMPARE => self.compare = value,
            STATUS => self.status = Status::from_bytes(value.to_le_bytes()),
            EPC => self.epc = value,
            CONFIG => self.config = value,
            ERROR_EPC => self.error_epc = value,
            // Random, BadVAddr, PRId and Cause are read-only on this core
            _ => {
                trace!("ignored write of {:#010x} to COP0 {}", value, COP0_REG_NAMES[reg as usize & 31]);
            }
        }
    }

    /// Picks the entry for TLBWR and steps Random down towards Wired
    pub fn next_random(&mut self) -> u32 {
        let index = self.random;
        self.random = if self.random <= self.wired { RANDOM_RESET } else { self.random - 1 };
        index
    }

    /// Latches exception state and returns the pc of the handler.
    ///
    /// `pc` is the address of the faulting instruction. When it sits in a delay slot, EPC points
    /// at the branch instead so the handler returns to the branch.
    pub fn raise(&mut self, exception: Exception, pc: u32, in_delay_slot: bool) -> u32 {
        if let Some(vaddr) = exception.bad_vaddr() {
            self.bad_vaddr = vaddr;
            if exception.is_tlb() {
                let vpn2 = vaddr >> 13;
                self.context = (self.context & 0xff80_000f) | (vpn2 << 4);
                self.entry_hi.set_vpn2(vpn2);
            }
        }
        self.cause.set_exc_code(exception.code());

        let offset = if self.status.exl() {
            0x180
        } else {
            self.cause.set_bd(in_delay_slot);
            self.epc = if in_delay_slot { pc.wrapping_sub(4) } else { pc };
            self.status.set_exl(true);
            match exception {
                Exception::TlbRefill { .. } => 0x000,
                _ => 0x180,
            }
        };

        let base = if self.status.bev() { 0xbfc0_0200 } else { 0x8000_0000 };
        base + offset
    }

    /// Leaves exception/error level and returns where execution resumes.
    pub fn eret(&mut self) -> u32 {
        if self.status.erl() {
            self.status.set_erl(false);
            self.error_epc
        } else {
            self.status.set_exl(false);
            self.epc
        }
    }
}

impl Default for Cop0 {
    fn default() -> Self {
        Self::new()
    }
}
