use tracing::trace;

use crate::coprocessor0::{Cop0, Exception};
use crate::regfile::RegFile;

/// Pieces of guest state compiled code can load and store directly.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum GuestSlot {
    /// Low doubleword of a GPR
    Gpr(u8),
    Lo,
    Hi,
    Pc,
    NextPc,
    BranchTaken,
    BranchPending,
}

/// Everything the dispatch loop, compiled units and helpers share about the running guest.
#[derive(Debug, Clone)]
pub struct CpuState {
    pub regs: RegFile,
    /// Virtual address the next unit starts at. Constant while a unit runs.
    pub pc: u32,
    /// Where a branch goes once its delay slot has run
    pub next_pc: u32,
    /// Run-time outcome of the last branch
    pub branch_taken: bool,
    /// A unit ended on a branch whose delay slot is at `pc` and hasn't run yet
    pub branch_pending: bool,
    pub cop0: Cop0,
    /// Shared cycle counter
    pub cycles: u64,
    /// Set when an exception was dispatched. Cleared by the dispatch loop.
    pub exception: bool,
}

impl CpuState {
    pub fn new(reset_pc: u32) -> CpuState {
        CpuState {
            regs: RegFile::new(),
            pc: reset_pc,
            next_pc: reset_pc.wrapping_add(4),
            branch_taken: false,
            branch_pending: false,
            cop0: Cop0::new(),
            cycles: 0,
            exception: false,
        }
    }

    #[inline(always)]
    pub fn load_slot(&self, slot: GuestSlot) -> u64 {
        match slot {
            GuestSlot::Gpr(reg) => self.regs.read64(reg),
            GuestSlot::Lo => self.regs.lo64(),
            GuestSlot::Hi => self.regs.hi64(),
            GuestSlot::Pc => self.pc as u64,
            GuestSlot::NextPc => self.next_pc as u64,
            GuestSlot::BranchTaken => self.branch_taken as u64,
            GuestSlot::BranchPending => self.branch_pending as u64,
        }
    }

    /// Address slots keep the low 32 bits, flags test for non-zero.
    #[inline(always)]
    pub fn store_slot(&mut self, slot: GuestSlot, value: u64) {
        match slot {
            GuestSlot::Gpr(reg) => self.regs.write64(reg, value),
            GuestSlot::Lo => self.regs.set_lo64(value),
            GuestSlot::Hi => self.regs.set_hi64(value),
            GuestSlot::Pc => self.pc = value as u32,
            GuestSlot::NextPc => self.next_pc = value as u32,
            GuestSlot::BranchTaken => self.branch_taken = value != 0,
            GuestSlot::BranchPending => self.branch_pending = value != 0,
        }
    }

    /// Dispatches a guest exception raised by the instruction at `pc`.
    pub fn raise(&mut self, exception: Exception, pc: u32, in_delay_slot: bool) {
        let vector = self.cop0.raise(exception, pc, in_delay_slot);
        trace!("{:?} at {:#010x}{} -> {:#010x}", exception, pc, if in_delay_slot { " (delay slot)" } else { "" }, vector);
        self.pc = vector;
        self.branch_pending = false;
        self.exception = true;
    }
}
