//! Per-instruction code emission.
//!
//! Emit routines only reach guest registers through the allocator and never assume a host
//! register survives a call into it. `rax`, `rcx` and `rdx` are free for temporaries.

use crate::backend::{
    AluOp, CodeEmitter, Cond, Helper, HostReg, Label, MulDivOp, Operand, Site, TrapOp, RETURN_REG,
    SCRATCH0, SCRATCH1, SCRATCH2,
};
use crate::branch::Outcome;
use crate::coprocessor0::Exception;
use crate::instructions::{AluKind, CmpMode, Exec, Instruction, InternalReg, MulDivKind};
use crate::regalloc::RegAlloc;
use crate::state::GuestSlot;

/// How control leaves an instruction, as far as the compiler cares.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Flow {
    Next,
    /// Branch or jump with a delay slot
    Branch { outcome: Outcome, likely: bool },
    /// ERET: no delay slot, continues at next_pc
    Return,
    /// Changed state that affects translation, the unit ends after this instruction
    Stop,
    /// Always raises, nothing after it runs
    Trap,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum StubKind {
    /// A helper dispatched an exception, pc already points at the vector
    Exception,
    /// A deferred branch turned out taken: continue at next_pc
    TakenBranch,
}

/// Out-of-line unit exit, emitted after the main body.
struct Stub {
    label: Label,
    kind: StubKind,
    /// Allocator state where the stub is branched to
    alloc: RegAlloc,
    cycles: u32,
}

pub struct EmitCtx<'a> {
    pub e: &'a mut dyn CodeEmitter,
    pub alloc: RegAlloc,
    stubs: Vec<Stub>,
    site: Site,
    /// Guest instructions emitted so far, including the current one
    executed: u32,
}

impl<'a> EmitCtx<'a> {
    pub fn new(e: &'a mut dyn CodeEmitter) -> EmitCtx<'a> {
        EmitCtx {
            e,
            alloc: RegAlloc::new(),
            stubs: Vec::new(),
            site: Site { offset: 0, delay_slot: false },
            executed: 0,
        }
    }

    /// Moves on to the instruction at `offset` bytes into the unit.
    pub fn begin(&mut self, offset: u32, delay_slot: bool) {
        self.site = Site { offset, delay_slot };
        self.executed += 1;
    }

    pub fn executed(&self) -> u32 {
        self.executed
    }

    #[inline(always)]
    fn get(&mut self, guest: u8) -> HostReg {
        self.alloc.get(self.e, guest, false)
    }

    /// Destination register. Writes to `$zero` go to a scratch register and get dropped.
    #[inline(always)]
    fn dest(&mut self, guest: u8) -> HostReg {
        if guest == 0 {
            SCRATCH2
        } else {
            self.alloc.get(self.e, guest, true)
        }
    }

    /// Registers an out-of-line exit for the current allocator state.
    pub fn add_stub(&mut self, kind: StubKind) -> Label {
        let label = self.e.new_label();
        self.stubs.push(Stub {
            label,
            kind,
            alloc: self.alloc.clone(),
            cycles: self.executed,
        });
        label
    }

    fn check_exception(&mut self) {
        let stub = self.add_stub(StubKind::Exception);
        self.e.branch_exception(stub);
    }

    fn call(&mut self, helper: Helper, args: &[Operand]) {
        self.e.call(helper, args, self.site);
        if helper.can_raise() {
            self.check_exception();
        }
    }

    /// Unconditionally dispatches `exception` from the current instruction.
    pub fn raise(&mut self, exception: Exception) -> Flow {
        self.alloc.flush_all_volatile(self.e);
        self.call(Helper::Raise(exception), &[]);
        Flow::Trap
    }

    /// rcx = rs + offset, as a 32-bit virtual address
    fn effective_address(&mut self, inst: &Instruction) -> HostReg {
        let base = self.get(inst.i().rs());
        self.e.alu(AluOp::Add32, SCRATCH1, base, Operand::Imm(inst.simm() as u64));
        SCRATCH1
    }

    /// dst = entry pc + offset of this instruction + `delta`
    fn pc_relative(&mut self, dst: HostReg, delta: i64) {
        self.e.load_guest(dst, GuestSlot::Pc);
        self.e.alu(AluOp::Add32, dst, dst, Operand::Imm((self.site.offset as i64 + delta) as u64));
    }

    fn link(&mut self, guest: u8) {
        if guest != 0 {
            let d = self.dest(guest);
            self.pc_relative(d, 8);
        }
    }

    pub fn emit(&mut self, inst: &Instruction) -> Flow {
        let i = inst.i();
        let r = inst.r();

        match inst.exec {
            Exec::Nop => {}
            Exec::AluImm(kind) => {
                let a = self.get(i.rs());
                let d = self.dest(i.rt());
                let simm = Operand::Imm(inst.simm() as u64);
                let uimm = Operand::Imm(i.imm() as u64);
                match kind {
                    AluKind::Add32 => self.trapping(TrapOp::Add32, d, a, simm),
                    AluKind::AddU32 => self.e.alu(AluOp::Add32, d, a, simm),
                    AluKind::Add64 => self.trapping(TrapOp::Add64, d, a, simm),
                    AluKind::AddU64 => self.e.alu(AluOp::Add, d, a, simm),
                    AluKind::SetLess => self.e.set_cond(Cond::Lt, d, a, simm),
                    AluKind::SetLessU => self.e.set_cond(Cond::LtU, d, a, simm),
                    AluKind::And => self.e.alu(AluOp::And, d, a, uimm),
                    AluKind::Or => self.e.alu(AluOp::Or, d, a, uimm),
                    AluKind::Xor => self.e.alu(AluOp::Xor, d, a, uimm),
                    other => unreachable!("{:?} has no immediate form", other),
                }
            }
            Exec::LoadUpper => {
                let d = self.dest(i.rt());
                self.e.mov(d, Operand::Imm((inst.simm() << 16) as u64));
            }
            Exec::Alu(kind) => {
                let a = self.get(r.rs());
                let b = self.get(r.rt());
                let d = self.dest(r.rd());
                let b = Operand::Reg(b);
                match kind {
                    AluKind::Add32 => self.trapping(TrapOp::Add32, d, a, b),
                    AluKind::Sub32 => self.trapping(TrapOp::Sub32, d, a, b),
                    AluKind::Add64 => self.trapping(TrapOp::Add64, d, a, b),
                    AluKind::Sub64 => self.trapping(TrapOp::Sub64, d, a, b),
                    AluKind::SetLess => self.e.set_cond(Cond::Lt, d, a, b),
                    AluKind::SetLessU => self.e.set_cond(Cond::LtU, d, a, b),
                    kind => self.e.alu(alu_op(kind), d, a, b),
                }
            }
            Exec::ShiftImm { kind, plus32 } => {
                let t = self.get(r.rt());
                let d = self.dest(r.rd());
                let amount = r.sa() as u64 + if plus32 { 32 } else { 0 };
                self.e.alu(alu_op(kind), d, t, Operand::Imm(amount));
            }
            Exec::ShiftVar(kind) => {
                let t = self.get(r.rt());
                let s = self.get(r.rs());
                let d = self.dest(r.rd());
                self.e.alu(alu_op(kind), d, t, Operand::Reg(s));
            }
            Exec::CondMove { on_zero } => {
                if r.rd() != 0 {
                    let s = self.get(r.rs());
                    let t = self.get(r.rt());
                    let d = self.dest(r.rd());
                    let cond = if on_zero { Cond::Eq } else { Cond::Ne };
                    self.e.set_cond(cond, SCRATCH1, t, Operand::Imm(0));
                    self.e.select(d, SCRATCH1, Operand::Reg(s), Operand::Reg(d));
                }
            }
            Exec::MoveFrom(reg) => {
                let d = self.dest(r.rd());
                self.e.load_guest(d, internal_slot(reg));
            }
            Exec::MoveTo(reg) => {
                let s = self.get(r.rs());
                self.e.store_guest(internal_slot(reg), Operand::Reg(s));
            }
            Exec::MulDiv(kind) => {
                let s = self.get(r.rs());
                let t = self.get(r.rt());
                let op = match kind {
                    MulDivKind::Mul32 => MulDivOp::Mult,
                    MulDivKind::MulU32 => MulDivOp::MultU,
                    MulDivKind::Div32 => MulDivOp::Div,
                    MulDivKind::DivU32 => MulDivOp::DivU,
                };
                self.e.mul_div(op, s, t);
                // The three operand MULT forms also copy LO to rd
                if matches!(kind, MulDivKind::Mul32 | MulDivKind::MulU32) && r.rd() != 0 {
                    let d = self.dest(r.rd());
                    self.e.load_guest(d, GuestSlot::Lo);
                }
            }
            Exec::Load { width, signed } => {
                let addr = self.effective_address(inst);
                self.alloc.flush_all_volatile(self.e);
                self.call(Helper::Load { width, signed }, &[Operand::Reg(addr)]);
                if i.rt() != 0 {
                    let d = self.dest(i.rt());
                    self.e.mov(d, Operand::Reg(RETURN_REG));
                }
            }
            Exec::Store { width } => {
                let value = self.get(i.rt());
                self.e.mov(SCRATCH2, Operand::Reg(value));
                let addr = self.effective_address(inst);
                self.alloc.flush_all_volatile(self.e);
                self.call(Helper::Store { width }, &[Operand::Reg(addr), Operand::Reg(SCRATCH2)]);
            }
            Exec::LoadQuad => {
                let addr = self.effective_address(inst);
                // The helper writes all 128 bits straight into the register file. The old value
                // has to be there too in case the load faults.
                self.alloc.writeback(self.e, i.rt());
                self.alloc.discard(self.e, i.rt());
                self.alloc.flush_all_volatile(self.e);
                self.call(Helper::LoadQuad { rt: i.rt() }, &[Operand::Reg(addr)]);
            }
            Exec::StoreQuad => {
                let addr = self.effective_address(inst);
                self.alloc.writeback(self.e, i.rt());
                self.alloc.flush_all_volatile(self.e);
                self.call(Helper::StoreQuad { rt: i.rt() }, &[Operand::Reg(addr)]);
            }
            Exec::Syscall => return self.raise(Exception::Syscall),
            Exec::Break => return self.raise(Exception::Breakpoint),
            Exec::Mfc0 => {
                self.alloc.flush_all_volatile(self.e);
                self.call(Helper::Mfc0 { reg: r.rd() }, &[]);
                let d = self.dest(r.rt());
                self.e.mov(d, Operand::Reg(RETURN_REG));
            }
            Exec::Mtc0 => {
                let t = self.get(r.rt());
                self.e.mov(SCRATCH1, Operand::Reg(t));
                self.alloc.flush_all_volatile(self.e);
                self.call(Helper::Mtc0 { reg: r.rd() }, &[Operand::Reg(SCRATCH1)]);
                return Flow::Stop;
            }
            Exec::Tlbr | Exec::Tlbwi | Exec::Tlbwr | Exec::Tlbp => {
                let helper = match inst.exec {
                    Exec::Tlbr => Helper::Tlbr,
                    Exec::Tlbwi => Helper::Tlbwi,
                    Exec::Tlbwr => Helper::Tlbwr,
                    _ => Helper::Tlbp,
                };
                self.alloc.flush_all_volatile(self.e);
                self.call(helper, &[]);
                if matches!(helper, Helper::Tlbwi | Helper::Tlbwr) {
                    return Flow::Stop;
                }
            }
            Exec::Eret => {
                self.alloc.flush_all_volatile(self.e);
                self.call(Helper::Eret, &[]);
                return Flow::Return;
            }
            Exec::Ei | Exec::Di => {
                self.alloc.flush_all_volatile(self.e);
                self.call(Helper::SetEie(inst.exec == Exec::Ei), &[]);
            }
            Exec::Leaf => {
                // Leaf ops see the register file directly, so nothing may stay cached
                self.alloc.writeback_all(self.e);
                self.call(Helper::Leaf(inst.word), &[]);
            }
            Exec::Jump { link } => {
                self.pc_relative(SCRATCH1, 4);
                self.e.alu(AluOp::And, SCRATCH1, SCRATCH1, Operand::Imm(0xf000_0000));
                self.e.alu(AluOp::Or, SCRATCH1, SCRATCH1, Operand::Imm((inst.j().target() as u64) << 2));
                self.e.store_guest(GuestSlot::NextPc, Operand::Reg(SCRATCH1));
                self.e.store_guest(GuestSlot::BranchTaken, Operand::Imm(1));
                if link {
                    self.link(31);
                }
                return Flow::Branch { outcome: Outcome::Always, likely: false };
            }
            Exec::JumpReg { link } => {
                let s = self.get(r.rs());
                self.e.store_guest(GuestSlot::NextPc, Operand::Reg(s));
                self.e.store_guest(GuestSlot::BranchTaken, Operand::Imm(1));
                if link {
                    self.link(r.rd());
                }
                return Flow::Branch { outcome: Outcome::Always, likely: false };
            }
            Exec::Branch { cmp, likely, link } => return self.branch(inst, cmp, likely, link),
        }

        Flow::Next
    }

    fn trapping(&mut self, op: TrapOp, d: HostReg, a: HostReg, b: Operand) {
        self.e.alu_trap(op, d, a, b, self.site);
        self.check_exception();
    }

    fn branch(&mut self, inst: &Instruction, cmp: CmpMode, likely: bool, link: bool) -> Flow {
        let i = inst.i();
        let outcome = static_outcome(cmp, i.rs(), i.rt());

        match outcome {
            Outcome::Runtime => {
                let s = self.get(i.rs());
                let (cond, rhs) = match cmp {
                    CmpMode::Eq => (Cond::Eq, Operand::Reg(self.get(i.rt()))),
                    CmpMode::Ne => (Cond::Ne, Operand::Reg(self.get(i.rt()))),
                    CmpMode::Le => (Cond::Le, Operand::Imm(0)),
                    CmpMode::Ge => (Cond::Ge, Operand::Imm(0)),
                    CmpMode::Lt => (Cond::Lt, Operand::Imm(0)),
                    CmpMode::Gt => (Cond::Gt, Operand::Imm(0)),
                };
                self.e.set_cond(cond, SCRATCH1, s, rhs);
                self.e.store_guest(GuestSlot::BranchTaken, Operand::Reg(SCRATCH1));
            }
            Outcome::Always => self.e.store_guest(GuestSlot::BranchTaken, Operand::Imm(1)),
            Outcome::Never => self.e.store_guest(GuestSlot::BranchTaken, Operand::Imm(0)),
        }

        // Link is written whether or not the branch is taken
        if link {
            self.link(31);
        }

        let target = 4 + (inst.simm() << 2);
        match outcome {
            Outcome::Runtime => {
                self.pc_relative(SCRATCH2, target);
                self.pc_relative(SCRATCH0, 8);
                self.e.select(SCRATCH2, SCRATCH1, Operand::Reg(SCRATCH2), Operand::Reg(SCRATCH0));
            }
            Outcome::Always => self.pc_relative(SCRATCH2, target),
            Outcome::Never => self.pc_relative(SCRATCH2, 8),
        }
        self.e.store_guest(GuestSlot::NextPc, Operand::Reg(SCRATCH2));

        Flow::Branch { outcome, likely }
    }

    /// Emits the out-of-line exits. Call once, after the unit's main exit.
    pub fn emit_stubs(&mut self) {
        for stub in std::mem::take(&mut self.stubs) {
            self.e.bind(stub.label);
            if stub.kind == StubKind::TakenBranch {
                self.e.load_guest(SCRATCH1, GuestSlot::NextPc);
                self.e.store_guest(GuestSlot::Pc, Operand::Reg(SCRATCH1));
            }
            stub.alloc.emit_exit(self.e);
            self.e.add_cycles(stub.cycles);
            self.e.ret();
        }
    }
}

/// Branch outcomes that follow from the encoding alone
pub fn static_outcome(cmp: CmpMode, rs: u8, rt: u8) -> Outcome {
    match cmp {
        CmpMode::Eq if rs == rt => Outcome::Always,
        CmpMode::Ne if rs == rt => Outcome::Never,
        CmpMode::Le | CmpMode::Ge if rs == 0 => Outcome::Always,
        CmpMode::Lt | CmpMode::Gt if rs == 0 => Outcome::Never,
        _ => Outcome::Runtime,
    }
}

fn alu_op(kind: AluKind) -> AluOp {
    match kind {
        AluKind::AddU32 => AluOp::Add32,
        AluKind::SubU32 => AluOp::Sub32,
        AluKind::AddU64 => AluOp::Add,
        AluKind::SubU64 => AluOp::Sub,
        AluKind::And => AluOp::And,
        AluKind::Or => AluOp::Or,
        AluKind::Xor => AluOp::Xor,
        AluKind::Nor => AluOp::Nor,
        AluKind::ShiftLeft32 => AluOp::Shl32,
        AluKind::ShiftRight32 => AluOp::Shr32,
        AluKind::ShiftRightArith32 => AluOp::Sar32,
        AluKind::ShiftLeft64 => AluOp::Shl,
        AluKind::ShiftRight64 => AluOp::Shr,
        AluKind::ShiftRightArith64 => AluOp::Sar,
        other => unreachable!("{:?} needs a trapping or compare op", other),
    }
}

fn internal_slot(reg: InternalReg) -> GuestSlot {
    match reg {
        InternalReg::HI => GuestSlot::Hi,
        InternalReg::LO => GuestSlot::Lo,
    }
}
