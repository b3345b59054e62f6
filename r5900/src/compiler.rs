//! Block compiler: turns a run of guest instructions into one unit.
//!
//! A unit starts at a pc and runs until its branch has been performed, or until the next
//! instruction would be in the next 256-byte pool. A branch whose delay slot lands in the next
//! pool is left pending; the next pool's boundary entry runs the slot and resolves it.

use tracing::{debug, trace};

use crate::backend::{AluOp, CodeEmitter, Operand, SCRATCH0, SCRATCH1, SCRATCH2};
use crate::branch::{BranchTracker, JumpTarget, Outcome};
use crate::cache::{EntryKind, POOL_SIZE};
use crate::coprocessor0::Exception;
use crate::emit::{EmitCtx, Flow, StubKind};
use crate::instructions::decode;
use crate::state::GuestSlot;

/// Where the compiler reads guest code from
pub trait InstructionSource {
    fn fetch(&mut self, vaddr: u32) -> Result<u32, Exception>;
}

/// Why a unit stopped where it did
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum UnitEnd {
    /// Ran into the next pool with nothing pending
    Boundary,
    /// Ran into the next pool with a branch whose delay slot is over there
    Deferred,
    /// A branch and its delay slot, an ERET, or an instruction that changes translation state
    Perform(JumpTarget),
    /// Fetch, decode or an instruction that always raises
    Trap,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct UnitInfo {
    pub start_pc: u32,
    pub instructions: u32,
    pub end: UnitEnd,
}

#[derive(Debug, Default)]
pub struct Compiler {
    units: u64,
    instructions: u64,
    nested_branches: u64,
}

impl Compiler {
    pub fn new() -> Compiler {
        Compiler::default()
    }

    pub fn units_compiled(&self) -> u64 {
        self.units
    }

    pub fn instructions_compiled(&self) -> u64 {
        self.instructions
    }

    /// Branches dropped because they sat in another branch's delay slot
    pub fn nested_branches(&self) -> u64 {
        self.nested_branches
    }

    /// Compiles the unit starting at virtual address `pc` into `e`.
    ///
    /// `Boundary` units must start at a pool's first instruction. Nothing in the emitted code
    /// depends on `pc` itself, only on its offset within the pool, so the unit works for every
    /// virtual alias of the same physical code.
    pub fn compile(
        &mut self,
        e: &mut dyn CodeEmitter,
        src: &mut dyn InstructionSource,
        pc: u32,
        kind: EntryKind,
    ) -> UnitInfo {
        let mut ctx = EmitCtx::new(e);
        let mut branch = BranchTracker::new();
        let mut offset = 0u32;
        let mut stop = false;

        if kind == EntryKind::Boundary {
            debug_assert_eq!(pc & (POOL_SIZE - 1), 0);
            ctx.e.store_guest(GuestSlot::BranchPending, Operand::Imm(0));

            branch.resume_deferred();
            branch.enter_delay_slot();
            let flow = self.step(&mut ctx, src, pc, 0, true);
            branch.leave_delay_slot();
            offset = 4;

            if flow == Flow::Trap {
                branch.perform(JumpTarget::Static(offset));
            } else {
                let taken = ctx.add_stub(StubKind::TakenBranch);
                ctx.e.load_guest(SCRATCH1, GuestSlot::BranchTaken);
                ctx.e.branch_nonzero(SCRATCH1, taken);
                branch.resolve_deferred();
                stop = flow == Flow::Stop;
                if stop {
                    branch.perform(JumpTarget::Static(offset));
                }
            }
        }

        // Set while a likely branch's slot is being compiled under a run-time guard
        let mut guard = None;
        let mut pending_outcome = Outcome::Runtime;

        let end = loop {
            if stop {
                break UnitEnd::Perform(JumpTarget::Static(offset));
            }
            if let Some(target) = branch.perform_target() {
                break UnitEnd::Perform(target);
            }
            if offset > 0 && pc.wrapping_add(offset) & (POOL_SIZE - 1) == 0 {
                break if branch.pending() { UnitEnd::Deferred } else { UnitEnd::Boundary };
            }

            let in_slot = branch.pending();
            if in_slot {
                if branch.likely() && pending_outcome == Outcome::Runtime {
                    // Everything goes back to the register file so both paths meet with the
                    // same allocator state
                    ctx.alloc.writeback_all(ctx.e);
                    ctx.alloc.set_volatile_only(true);
                    let skip = ctx.e.new_label();
                    ctx.e.load_guest(SCRATCH1, GuestSlot::BranchTaken);
                    ctx.e.branch_zero(SCRATCH1, skip);
                    guard = Some(skip);
                }
                branch.enter_delay_slot();
            }

            let flow = self.step(&mut ctx, src, pc, offset, in_slot);

            if in_slot {
                branch.leave_delay_slot();
                if let Some(skip) = guard.take() {
                    ctx.alloc.writeback_all(ctx.e);
                    ctx.alloc.set_volatile_only(false);
                    ctx.e.bind(skip);
                }
            }

            match flow {
                Flow::Next => {}
                Flow::Branch { outcome, likely } => {
                    branch.on_branch(outcome, likely, offset);
                    pending_outcome = outcome;
                    if likely && outcome == Outcome::Never {
                        branch.nullify();
                    }
                }
                Flow::Return if !in_slot => branch.perform(JumpTarget::Dynamic),
                Flow::Stop if !in_slot => stop = true,
                Flow::Trap if !in_slot => {
                    offset += 4;
                    break UnitEnd::Trap;
                }
                // In a delay slot the branch decides where the unit goes next
                Flow::Return | Flow::Stop | Flow::Trap => {}
            }
            offset += 4;
        };

        self.epilogue(&mut ctx, offset, end, branch.likely() && pending_outcome == Outcome::Runtime);
        ctx.emit_stubs();

        let info = UnitInfo { start_pc: pc, instructions: offset / 4, end };
        debug!("compiled {:#010x}{}: {} instructions, {:?}",
            pc, if kind == EntryKind::Boundary { " (boundary entry)" } else { "" }, info.instructions, end);
        self.units += 1;
        self.instructions += info.instructions as u64;
        info
    }

    /// Fetches, decodes and emits one instruction.
    fn step(&mut self, ctx: &mut EmitCtx, src: &mut dyn InstructionSource, pc: u32, offset: u32, delay_slot: bool) -> Flow {
        ctx.begin(offset, delay_slot);
        let vaddr = pc.wrapping_add(offset);

        let word = match src.fetch(vaddr) {
            Ok(word) => word,
            Err(exception) => {
                trace!("fetch from {:#010x} faults: {:?}", vaddr, exception);
                return ctx.raise(exception);
            }
        };
        let inst = match decode(word) {
            Ok(inst) => inst,
            Err(err) => {
                trace!("{} at {:#010x}", err, vaddr);
                return ctx.raise(Exception::ReservedInstruction);
            }
        };
        trace!("{:#010x}: {}", vaddr, inst.disassemble(vaddr));

        if delay_slot && inst.is_control_transfer() {
            debug!("discarding {} in a delay slot at {:#010x}", inst.name(), vaddr);
            self.nested_branches += 1;
            return Flow::Next;
        }
        ctx.emit(&inst)
    }

    /// Stores the pc the unit continues at, then the normal exit.
    fn epilogue(&mut self, ctx: &mut EmitCtx, offset: u32, end: UnitEnd, likely_runtime: bool) {
        let e = &mut *ctx.e;
        match end {
            UnitEnd::Boundary | UnitEnd::Trap | UnitEnd::Perform(JumpTarget::Static(_)) => {
                let to = match end {
                    UnitEnd::Perform(JumpTarget::Static(to)) => to,
                    _ => offset,
                };
                e.load_guest(SCRATCH1, GuestSlot::Pc);
                e.alu(AluOp::Add32, SCRATCH1, SCRATCH1, Operand::Imm(to as u64));
                e.store_guest(GuestSlot::Pc, Operand::Reg(SCRATCH1));
            }
            UnitEnd::Perform(JumpTarget::Dynamic) => {
                e.load_guest(SCRATCH1, GuestSlot::NextPc);
                e.store_guest(GuestSlot::Pc, Operand::Reg(SCRATCH1));
            }
            UnitEnd::Deferred if likely_runtime => {
                // A likely branch that isn't taken skips its slot here and now. Only a taken one
                // leaves anything for the next unit.
                e.load_guest(SCRATCH1, GuestSlot::BranchTaken);
                e.store_guest(GuestSlot::BranchPending, Operand::Reg(SCRATCH1));
                e.load_guest(SCRATCH0, GuestSlot::Pc);
                e.alu(AluOp::Add32, SCRATCH2, SCRATCH0, Operand::Imm(offset as u64));
                e.alu(AluOp::Add32, SCRATCH0, SCRATCH0, Operand::Imm(offset as u64 + 4));
                e.select(SCRATCH2, SCRATCH1, Operand::Reg(SCRATCH2), Operand::Reg(SCRATCH0));
                e.store_guest(GuestSlot::Pc, Operand::Reg(SCRATCH2));
            }
            UnitEnd::Deferred => {
                e.store_guest(GuestSlot::BranchPending, Operand::Imm(1));
                e.load_guest(SCRATCH1, GuestSlot::Pc);
                e.alu(AluOp::Add32, SCRATCH1, SCRATCH1, Operand::Imm(offset as u64));
                e.store_guest(GuestSlot::Pc, Operand::Reg(SCRATCH1));
            }
        }

        ctx.alloc.flush_and_restore(ctx.e);
        ctx.e.add_cycles(ctx.executed());
        ctx.e.ret();
    }
}
