//! Portable backend: units are encoded as a flat list of host ops and run by a small interpreter.
//!
//! The interpreter models the host register file and stack closely enough to catch code that
//! would be wrong on real hardware. Volatile registers start out (and end up after every call)
//! holding garbage, and nonvolatile registers hold canaries that have to survive until `Ret`.

use std::sync::Arc;

use tracing::trace;

use super::{
    AluOp, BackendError, BlockId, BlockRelease, CodeEmitter, Cond, Helper, HostReg, Label, MulDivOp,
    Operand, Runtime, Site, TrapOp, RETURN_REG,
};
use crate::coprocessor0::Exception;
use crate::state::GuestSlot;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HostOp {
    LoadGuest { dst: HostReg, slot: GuestSlot },
    StoreGuest { slot: GuestSlot, src: Operand },
    Mov { dst: HostReg, src: Operand },
    Alu { op: AluOp, dst: HostReg, a: HostReg, b: Operand },
    AluTrap { op: TrapOp, dst: HostReg, a: HostReg, b: Operand, site: Site },
    SetCond { cond: Cond, dst: HostReg, a: HostReg, b: Operand },
    Select { dst: HostReg, cond: HostReg, if_true: Operand, if_false: Operand },
    MulDiv { op: MulDivOp, a: HostReg, b: HostReg },
    Call { helper: Helper, args: Vec<Operand>, site: Site },
    Jump(Label),
    BranchZero(HostReg, Label),
    BranchNonZero(HostReg, Label),
    BranchException(Label),
    ReserveStack(u32),
    ReleaseStack(u32),
    Save { slot: u32, src: HostReg },
    Restore { dst: HostReg, slot: u32 },
    AddCycles(u32),
    Ret,
}

#[derive(Debug, Default)]
pub struct ThreadedEmitter {
    ops: Vec<HostOp>,
    labels: Vec<Option<u32>>,
}

impl ThreadedEmitter {
    pub fn new() -> ThreadedEmitter {
        ThreadedEmitter::default()
    }

    pub fn ops(&self) -> &[HostOp] {
        &self.ops
    }

    /// Resolves labels and seals the unit.
    pub fn finish(self, start_pc: u32, guest_instructions: u32) -> Result<HostCode, BackendError> {
        let labels = self.labels.iter().enumerate()
            .map(|(i, target)| target.ok_or(BackendError::UnboundLabel(i as u32)))
            .collect::<Result<Vec<u32>, BackendError>>()?;
        if self.ops.last() != Some(&HostOp::Ret) {
            return Err(BackendError::MissingReturn);
        }
        Ok(HostCode {
            ops: self.ops,
            labels,
            start_pc,
            guest_instructions,
        })
    }

    #[inline(always)]
    fn push(&mut self, op: HostOp) {
        self.ops.push(op);
    }
}

impl CodeEmitter for ThreadedEmitter {
    fn load_guest(&mut self, dst: HostReg, slot: GuestSlot) {
        self.push(HostOp::LoadGuest { dst, slot });
    }

    fn store_guest(&mut self, slot: GuestSlot, src: Operand) {
        self.push(HostOp::StoreGuest { slot, src });
    }

    fn mov(&mut self, dst: HostReg, src: Operand) {
        self.push(HostOp::Mov { dst, src });
    }

    fn alu(&mut self, op: AluOp, dst: HostReg, a: HostReg, b: Operand) {
        self.push(HostOp::Alu { op, dst, a, b });
    }

    fn alu_trap(&mut self, op: TrapOp, dst: HostReg, a: HostReg, b: Operand, site: Site) {
        self.push(HostOp::AluTrap { op, dst, a, b, site });
    }

    fn set_cond(&mut self, cond: Cond, dst: HostReg, a: HostReg, b: Operand) {
        self.push(HostOp::SetCond { cond, dst, a, b });
    }

    fn select(&mut self, dst: HostReg, cond: HostReg, if_true: Operand, if_false: Operand) {
        self.push(HostOp::Select { dst, cond, if_true, if_false });
    }

    fn mul_div(&mut self, op: MulDivOp, a: HostReg, b: HostReg) {
        self.push(HostOp::MulDiv { op, a, b });
    }

    fn call(&mut self, helper: Helper, args: &[Operand], site: Site) {
        self.push(HostOp::Call { helper, args: args.to_vec(), site });
    }

    fn new_label(&mut self) -> Label {
        self.labels.push(None);
        Label(self.labels.len() as u32 - 1)
    }

    fn bind(&mut self, label: Label) {
        let target = &mut self.labels[label.0 as usize];
        assert!(target.is_none(), "label {} bound twice", label.0);
        *target = Some(self.ops.len() as u32);
    }

    fn jump(&mut self, label: Label) {
        self.push(HostOp::Jump(label));
    }

    fn branch_zero(&mut self, reg: HostReg, label: Label) {
        self.push(HostOp::BranchZero(reg, label));
    }

    fn branch_nonzero(&mut self, reg: HostReg, label: Label) {
        self.push(HostOp::BranchNonZero(reg, label));
    }

    fn branch_exception(&mut self, label: Label) {
        self.push(HostOp::BranchException(label));
    }

    fn reserve_stack(&mut self, slots: u32) {
        self.push(HostOp::ReserveStack(slots));
    }

    fn release_stack(&mut self, slots: u32) {
        self.push(HostOp::ReleaseStack(slots));
    }

    fn save(&mut self, slot: u32, src: HostReg) {
        self.push(HostOp::Save { slot, src });
    }

    fn restore(&mut self, dst: HostReg, slot: u32) {
        self.push(HostOp::Restore { dst, slot });
    }

    fn add_cycles(&mut self, cycles: u32) {
        self.push(HostOp::AddCycles(cycles));
    }

    fn ret(&mut self) {
        self.push(HostOp::Ret);
    }
}

/// An installed unit
#[derive(Debug)]
pub struct HostCode {
    ops: Vec<HostOp>,
    labels: Vec<u32>,
    pub start_pc: u32,
    pub guest_instructions: u32,
}

const CANARY: u64 = 0xc0de_c0de_0000_0000;
const POISON: u64 = 0xdead_beef_0000_0000;

struct HostRegs([u64; HostReg::COUNT]);

impl HostRegs {
    fn entry() -> HostRegs {
        let mut regs = HostRegs([0; HostReg::COUNT]);
        for reg in HostReg::ALL {
            regs.0[reg.index()] = if reg.is_volatile() { POISON } else { CANARY } | reg.index() as u64;
        }
        regs
    }

    #[inline(always)]
    fn get(&self, reg: HostReg) -> u64 {
        self.0[reg.index()]
    }

    #[inline(always)]
    fn set(&mut self, reg: HostReg, value: u64) {
        self.0[reg.index()] = value;
    }

    #[inline(always)]
    fn value(&self, operand: Operand) -> u64 {
        match operand {
            Operand::Reg(reg) => self.get(reg),
            Operand::Imm(imm) => imm,
        }
    }

    fn clobber(&mut self, reg: HostReg) {
        self.set(reg, POISON | 0x100 | reg.index() as u64);
    }

    fn clobber_volatile(&mut self) {
        for reg in HostReg::ALL {
            if reg.is_volatile() {
                self.clobber(reg);
            }
        }
    }

    fn check_callee_saved(&self) -> Result<(), BackendError> {
        for reg in HostReg::ALL {
            if !reg.is_volatile() && self.get(reg) != CANARY | reg.index() as u64 {
                return Err(BackendError::CalleeSavedClobbered(reg));
            }
        }
        Ok(())
    }
}

impl HostCode {
    pub fn ops(&self) -> &[HostOp] {
        &self.ops
    }

    #[inline(always)]
    fn target(&self, label: Label) -> usize {
        // finish() guarantees every label resolves
        self.labels[label.0 as usize] as usize
    }

    /// Runs the unit to its `Ret`.
    pub fn run(&self, rt: &mut dyn Runtime) -> Result<(), BackendError> {
        let mut regs = HostRegs::entry();
        let mut stack: Vec<u64> = Vec::new();
        let mut ip = 0;

        loop {
            let op = self.ops.get(ip).ok_or(BackendError::FellOffEnd(ip))?;
            ip += 1;

            match op {
                HostOp::LoadGuest { dst, slot } => {
                    let value = rt.state().load_slot(*slot);
                    regs.set(*dst, value);
                }
                HostOp::StoreGuest { slot, src } => {
                    let value = regs.value(*src);
                    rt.state().store_slot(*slot, value);
                }
                HostOp::Mov { dst, src } => {
                    regs.set(*dst, regs.value(*src));
                }
                HostOp::Alu { op, dst, a, b } => {
                    regs.set(*dst, op.apply(regs.get(*a), regs.value(*b)));
                }
                HostOp::AluTrap { op, dst, a, b, site } => {
                    match op.apply(regs.get(*a), regs.value(*b)) {
                        Some(value) => regs.set(*dst, value),
                        None => {
                            rt.call(Helper::Raise(Exception::Overflow), &[], *site);
                        }
                    }
                }
                HostOp::SetCond { cond, dst, a, b } => {
                    regs.set(*dst, cond.test(regs.get(*a), regs.value(*b)) as u64);
                }
                HostOp::Select { dst, cond, if_true, if_false } => {
                    let value = if regs.get(*cond) != 0 { regs.value(*if_true) } else { regs.value(*if_false) };
                    regs.set(*dst, value);
                }
                HostOp::MulDiv { op, a, b } => {
                    let (lo, hi) = op.apply(regs.get(*a), regs.get(*b));
                    let state = rt.state();
                    state.regs.set_lo64(lo);
                    state.regs.set_hi64(hi);
                    regs.clobber(HostReg::Rax);
                    regs.clobber(HostReg::Rdx);
                }
                HostOp::Call { helper, args, site } => {
                    let values: Vec<u64> = args.iter().map(|arg| regs.value(*arg)).collect();
                    let result = rt.call(*helper, &values, *site);
                    regs.clobber_volatile();
                    regs.set(RETURN_REG, result);
                }
                HostOp::Jump(label) => {
                    ip = self.target(*label);
                }
                HostOp::BranchZero(reg, label) => {
                    if regs.get(*reg) == 0 {
                        ip = self.target(*label);
                    }
                }
                HostOp::BranchNonZero(reg, label) => {
                    if regs.get(*reg) != 0 {
                        ip = self.target(*label);
                    }
                }
                HostOp::BranchException(label) => {
                    if rt.state().exception {
                        ip = self.target(*label);
                    }
                }
                HostOp::ReserveStack(slots) => {
                    stack.resize(stack.len() + *slots as usize, POISON);
                }
                HostOp::ReleaseStack(slots) => {
                    let slots = *slots as usize;
                    if slots > stack.len() {
                        return Err(BackendError::StackUnderflow);
                    }
                    stack.truncate(stack.len() - slots);
                }
                HostOp::Save { slot, src } => {
                    let value = regs.get(*src);
                    *stack.get_mut(*slot as usize).ok_or(BackendError::BadStackSlot(*slot))? = value;
                }
                HostOp::Restore { dst, slot } => {
                    let value = *stack.get(*slot as usize).ok_or(BackendError::BadStackSlot(*slot))?;
                    regs.set(*dst, value);
                }
                HostOp::AddCycles(cycles) => {
                    rt.state().cycles += *cycles as u64;
                }
                HostOp::Ret => break,
            }
        }

        if !stack.is_empty() {
            return Err(BackendError::UnbalancedStack(stack.len()));
        }
        regs.check_callee_saved()
    }
}

struct Slot {
    generation: u32,
    code: Option<Arc<HostCode>>,
}

/// Owns installed units. Released storage goes on a free list and gets reused.
pub struct ThreadedBackend {
    slots: Vec<Slot>,
    free: Vec<u32>,
    live: usize,
    limit: usize,
}

impl ThreadedBackend {
    /// `limit` caps the number of units alive at once
    pub fn new(limit: usize) -> ThreadedBackend {
        ThreadedBackend {
            slots: Vec::new(),
            free: Vec::new(),
            live: 0,
            limit,
        }
    }

    pub fn emitter(&self) -> ThreadedEmitter {
        ThreadedEmitter::new()
    }

    pub fn install(&mut self, code: HostCode) -> Result<BlockId, BackendError> {
        if self.live >= self.limit {
            return Err(BackendError::OutOfCodeSpace { limit: self.limit });
        }
        let code = Some(Arc::new(code));
        let id = match self.free.pop() {
            Some(index) => {
                let slot = &mut self.slots[index as usize];
                slot.code = code;
                BlockId { index, generation: slot.generation }
            }
            None => {
                self.slots.push(Slot { generation: 0, code });
                BlockId { index: self.slots.len() as u32 - 1, generation: 0 }
            }
        };
        self.live += 1;
        Ok(id)
    }

    /// The unit behind `block`. The returned handle keeps it alive even if it's released while
    /// running.
    pub fn code(&self, block: BlockId) -> Result<Arc<HostCode>, BackendError> {
        match self.slots.get(block.index as usize) {
            Some(Slot { generation, code: Some(code) }) if *generation == block.generation => Ok(code.clone()),
            _ => Err(BackendError::StaleBlock(block)),
        }
    }

    pub fn live_units(&self) -> usize {
        self.live
    }
}

impl BlockRelease for ThreadedBackend {
    fn release(&mut self, block: BlockId) {
        let Some(slot) = self.slots.get_mut(block.index as usize) else {
            return;
        };
        if slot.generation != block.generation || slot.code.is_none() {
            trace!("double release of {:?}", block);
            return;
        }
        slot.code = None;
        slot.generation = slot.generation.wrapping_add(1);
        self.free.push(block.index);
        self.live -= 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::CpuState;

    struct TestRuntime {
        state: CpuState,
        calls: Vec<(Helper, Vec<u64>)>,
    }

    impl TestRuntime {
        fn new() -> TestRuntime {
            TestRuntime { state: CpuState::new(0x8000_0000), calls: Vec::new() }
        }
    }

    impl Runtime for TestRuntime {
        fn state(&mut self) -> &mut CpuState {
            &mut self.state
        }

        fn call(&mut self, helper: Helper, args: &[u64], site: Site) -> u64 {
            self.calls.push((helper, args.to_vec()));
            if let Helper::Raise(exception) = helper {
                let pc = self.state.pc + site.offset;
                self.state.raise(exception, pc, site.delay_slot);
            }
            42
        }
    }

    const SITE: Site = Site { offset: 0, delay_slot: false };

    fn run(e: ThreadedEmitter, rt: &mut TestRuntime) -> Result<(), BackendError> {
        e.finish(0x8000_0000, 1)?.run(rt)
    }

    #[test]
    fn guest_arithmetic() {
        let mut e = ThreadedEmitter::new();
        e.load_guest(HostReg::Rsi, GuestSlot::Gpr(4));
        e.alu(AluOp::Add32, HostReg::Rsi, HostReg::Rsi, Operand::Imm(-1i64 as u64));
        e.store_guest(GuestSlot::Gpr(2), Operand::Reg(HostReg::Rsi));
        e.add_cycles(3);
        e.ret();

        let mut rt = TestRuntime::new();
        rt.state.regs.write64(4, 10);
        run(e, &mut rt).unwrap();
        assert_eq!(rt.state.regs.read64(2), 9);
        assert_eq!(rt.state.cycles, 3);
    }

    #[test]
    fn callee_saved_must_survive() {
        let mut e = ThreadedEmitter::new();
        e.mov(HostReg::Rbx, Operand::Imm(1));
        e.ret();
        assert_eq!(run(e, &mut TestRuntime::new()), Err(BackendError::CalleeSavedClobbered(HostReg::Rbx)));

        let mut e = ThreadedEmitter::new();
        e.reserve_stack(1);
        e.save(0, HostReg::Rbx);
        e.mov(HostReg::Rbx, Operand::Imm(1));
        e.restore(HostReg::Rbx, 0);
        e.release_stack(1);
        e.ret();
        assert_eq!(run(e, &mut TestRuntime::new()), Ok(()));
    }

    #[test]
    fn stack_must_balance() {
        let mut e = ThreadedEmitter::new();
        e.reserve_stack(2);
        e.ret();
        assert_eq!(run(e, &mut TestRuntime::new()), Err(BackendError::UnbalancedStack(2)));

        let mut e = ThreadedEmitter::new();
        e.save(0, HostReg::Rbx);
        e.ret();
        assert_eq!(run(e, &mut TestRuntime::new()), Err(BackendError::BadStackSlot(0)));
    }

    #[test]
    fn calls_clobber_volatile_registers() {
        let mut e = ThreadedEmitter::new();
        e.mov(HostReg::Rsi, Operand::Imm(5));
        e.call(Helper::Load { width: 4, signed: true }, &[Operand::Reg(HostReg::Rsi)], SITE);
        e.store_guest(GuestSlot::Gpr(1), Operand::Reg(HostReg::Rsi));
        e.store_guest(GuestSlot::Gpr(2), Operand::Reg(RETURN_REG));
        e.ret();

        let mut rt = TestRuntime::new();
        run(e, &mut rt).unwrap();
        assert_eq!(rt.calls, vec![(Helper::Load { width: 4, signed: true }, vec![5])]);
        assert_ne!(rt.state.regs.read64(1), 5);
        assert_eq!(rt.state.regs.read64(2), 42);
    }

    #[test]
    fn overflow_branches_to_exception_exit() {
        let mut e = ThreadedEmitter::new();
        let exit = e.new_label();
        e.mov(HostReg::Rsi, Operand::Imm(0x7fff_ffff));
        e.alu_trap(TrapOp::Add32, HostReg::Rdi, HostReg::Rsi, Operand::Imm(1), Site { offset: 8, delay_slot: false });
        e.branch_exception(exit);
        e.store_guest(GuestSlot::Gpr(1), Operand::Imm(1));
        e.bind(exit);
        e.ret();

        let mut rt = TestRuntime::new();
        rt.state.cop0.status.set_erl(false);
        rt.state.cop0.status.set_bev(false);
        run(e, &mut rt).unwrap();
        assert!(rt.state.exception);
        assert_eq!(rt.state.cop0.epc, 0x8000_0008);
        assert_eq!(rt.state.regs.read64(1), 0);
    }

    #[test]
    fn labels_must_be_bound() {
        let mut e = ThreadedEmitter::new();
        let label = e.new_label();
        e.jump(label);
        e.ret();
        assert_eq!(e.finish(0, 0).unwrap_err(), BackendError::UnboundLabel(0));

        let mut e = ThreadedEmitter::new();
        e.add_cycles(1);
        assert_eq!(e.finish(0, 0).unwrap_err(), BackendError::MissingReturn);
    }

    #[test]
    fn released_units_finish_and_slots_get_reused() {
        let mut backend = ThreadedBackend::new(2);
        let mut e = backend.emitter();
        e.store_guest(GuestSlot::Gpr(3), Operand::Imm(7));
        e.ret();
        let block = backend.install(e.finish(0, 1).unwrap()).unwrap();

        let code = backend.code(block).unwrap();
        backend.release(block);
        assert_eq!(backend.live_units(), 0);
        assert_eq!(backend.code(block).unwrap_err(), BackendError::StaleBlock(block));

        // Still runnable through the handle taken before the release
        let mut rt = TestRuntime::new();
        code.run(&mut rt).unwrap();
        assert_eq!(rt.state.regs.read64(3), 7);

        let mut e = backend.emitter();
        e.ret();
        let again = backend.install(e.finish(0, 0).unwrap()).unwrap();
        assert_ne!(again, block);
        assert!(backend.code(again).is_ok());

        // Releasing a stale handle is harmless
        backend.release(block);
        assert_eq!(backend.live_units(), 1);
    }

    #[test]
    fn code_space_limit() {
        let mut backend = ThreadedBackend::new(1);
        let unit = || {
            let mut e = ThreadedEmitter::new();
            e.ret();
            e.finish(0, 0).unwrap()
        };
        backend.install(unit()).unwrap();
        assert_eq!(backend.install(unit()).unwrap_err(), BackendError::OutOfCodeSpace { limit: 1 });
    }
}
