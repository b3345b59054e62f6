//! Code-emission backend.
//!
//! The compiler and register allocator only talk to [`CodeEmitter`], which describes a small
//! two-operand host machine modelled on x86-64 System V: sixteen 64-bit registers split into
//! caller-saved (volatile) and callee-saved (nonvolatile) sets, a stack for spills, and calls out
//! to host helpers that clobber every volatile register.

use std::fmt;

use crate::coprocessor0::Exception;
use crate::state::{CpuState, GuestSlot};

pub mod threaded;

pub use threaded::{HostCode, HostOp, ThreadedBackend, ThreadedEmitter};

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(u8)]
pub enum HostReg {
    Rax = 0,
    Rcx,
    Rdx,
    Rbx,
    Rsp,
    Rbp,
    Rsi,
    Rdi,
    R8,
    R9,
    R10,
    R11,
    R12,
    R13,
    R14,
    R15,
}

const HOST_REG_NAMES: [&'static str; 16] = [
    "rax", "rcx", "rdx", "rbx", "rsp", "rbp", "rsi", "rdi",
    "r8", "r9", "r10", "r11", "r12", "r13", "r14", "r15",
];

impl HostReg {
    pub const COUNT: usize = 16;

    pub const ALL: [HostReg; 16] = [
        HostReg::Rax, HostReg::Rcx, HostReg::Rdx, HostReg::Rbx,
        HostReg::Rsp, HostReg::Rbp, HostReg::Rsi, HostReg::Rdi,
        HostReg::R8, HostReg::R9, HostReg::R10, HostReg::R11,
        HostReg::R12, HostReg::R13, HostReg::R14, HostReg::R15,
    ];

    #[inline(always)]
    pub fn index(self) -> usize {
        self as usize
    }

    /// Caller-saved under the host ABI
    pub fn is_volatile(self) -> bool {
        use HostReg::*;
        matches!(self, Rax | Rcx | Rdx | Rsi | Rdi | R8 | R9 | R10 | R11)
    }

    pub fn name(self) -> &'static str {
        HOST_REG_NAMES[self.index()]
    }
}

impl fmt::Display for HostReg {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Scratch registers. Never handed out by the allocator, so emit routines can use them freely
/// between allocator calls. Helper results come back in `SCRATCH0`.
pub const SCRATCH0: HostReg = HostReg::Rax;
pub const SCRATCH1: HostReg = HostReg::Rcx;
pub const SCRATCH2: HostReg = HostReg::Rdx;
pub const RETURN_REG: HostReg = HostReg::Rax;

/// Holds the guest state base pointer in a native backend
pub const STATE_BASE: HostReg = HostReg::Rbp;

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Operand {
    Reg(HostReg),
    Imm(u64),
}

impl From<HostReg> for Operand {
    fn from(reg: HostReg) -> Self {
        Operand::Reg(reg)
    }
}

/// ALU operations. The `*32` forms work on the low word and sign-extend the result, shift
/// amounts are masked to the operand width.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum AluOp {
    Add,
    Sub,
    And,
    Or,
    Xor,
    Nor,
    Shl,
    Shr,
    Sar,
    Add32,
    Sub32,
    Shl32,
    Shr32,
    Sar32,
}

impl AluOp {
    #[inline(always)]
    pub fn apply(self, a: u64, b: u64) -> u64 {
        let sext = |v: u32| v as i32 as i64 as u64;
        match self {
            AluOp::Add => a.wrapping_add(b),
            AluOp::Sub => a.wrapping_sub(b),
            AluOp::And => a & b,
            AluOp::Or => a | b,
            AluOp::Xor => a ^ b,
            AluOp::Nor => !(a | b),
            AluOp::Shl => a << (b & 63),
            AluOp::Shr => a >> (b & 63),
            AluOp::Sar => ((a as i64) >> (b & 63)) as u64,
            AluOp::Add32 => sext((a as u32).wrapping_add(b as u32)),
            AluOp::Sub32 => sext((a as u32).wrapping_sub(b as u32)),
            AluOp::Shl32 => sext((a as u32) << (b & 31)),
            AluOp::Shr32 => sext((a as u32) >> (b & 31)),
            AluOp::Sar32 => ((a as i32) >> (b & 31)) as i64 as u64,
        }
    }
}

/// Signed arithmetic that raises Overflow instead of wrapping
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum TrapOp {
    Add32,
    Sub32,
    Add64,
    Sub64,
}

impl TrapOp {
    #[inline(always)]
    pub fn apply(self, a: u64, b: u64) -> Option<u64> {
        match self {
            TrapOp::Add32 => (a as i32).checked_add(b as i32).map(|v| v as i64 as u64),
            TrapOp::Sub32 => (a as i32).checked_sub(b as i32).map(|v| v as i64 as u64),
            TrapOp::Add64 => (a as i64).checked_add(b as i64).map(|v| v as u64),
            TrapOp::Sub64 => (a as i64).checked_sub(b as i64).map(|v| v as u64),
        }
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Cond {
    Eq,
    Ne,
    Lt,
    Ge,
    Le,
    Gt,
    /// Unsigned less than
    LtU,
}

impl Cond {
    #[inline(always)]
    pub fn test(self, a: u64, b: u64) -> bool {
        match self {
            Cond::Eq => a == b,
            Cond::Ne => a != b,
            Cond::Lt => (a as i64) < (b as i64),
            Cond::Ge => (a as i64) >= (b as i64),
            Cond::Le => (a as i64) <= (b as i64),
            Cond::Gt => (a as i64) > (b as i64),
            Cond::LtU => a < b,
        }
    }
}

/// Multiply/divide into LO/HI. Clobbers `rax` and `rdx`, like the x86 instructions.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum MulDivOp {
    Mult,
    MultU,
    Div,
    DivU,
}

impl MulDivOp {
    /// Returns (LO, HI), both sign-extended from 32 bits
    pub fn apply(self, a: u64, b: u64) -> (u64, u64) {
        let sext = |v: u32| v as i32 as i64 as u64;
        match self {
            MulDivOp::Mult => {
                let product = (a as i32 as i64) * (b as i32 as i64);
                (sext(product as u32), sext((product >> 32) as u32))
            }
            MulDivOp::MultU => {
                let product = (a as u32 as u64) * (b as u32 as u64);
                (sext(product as u32), sext((product >> 32) as u32))
            }
            MulDivOp::Div => {
                let (n, d) = (a as i32, b as i32);
                if d == 0 {
                    (if n < 0 { 1 } else { u64::MAX }, sext(n as u32))
                } else {
                    (sext(n.wrapping_div(d) as u32), sext(n.wrapping_rem(d) as u32))
                }
            }
            MulDivOp::DivU => {
                let (n, d) = (a as u32, b as u32);
                if d == 0 {
                    (u64::MAX, sext(n))
                } else {
                    (sext(n / d), sext(n % d))
                }
            }
        }
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct Label(pub(crate) u32);

/// Where in the unit a helper call or trap comes from, for exception dispatch.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct Site {
    /// Byte offset of the guest instruction from the unit's entry pc
    pub offset: u32,
    pub delay_slot: bool,
}

/// Host helpers reachable from compiled code.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Helper {
    /// args: [vaddr], returns the extended value
    Load { width: u8, signed: bool },
    /// args: [vaddr, value]
    Store { width: u8 },
    /// args: [vaddr], writes all 128 bits of `rt` directly
    LoadQuad { rt: u8 },
    /// args: [vaddr], stores all 128 bits of `rt`
    StoreQuad { rt: u8 },
    Raise(Exception),
    /// returns the sign-extended register
    Mfc0 { reg: u8 },
    /// args: [value]
    Mtc0 { reg: u8 },
    Tlbr,
    Tlbwi,
    Tlbwr,
    Tlbp,
    /// Leaves exception level and writes the return address to next_pc
    Eret,
    /// EI/DI
    SetEie(bool),
    /// Hands the raw word to the leaf collaborator
    Leaf(u32),
}

impl Helper {
    /// Helpers that can dispatch a guest exception
    pub fn can_raise(&self) -> bool {
        matches!(self,
            Helper::Load { .. } | Helper::Store { .. } | Helper::LoadQuad { .. } | Helper::StoreQuad { .. }
            | Helper::Raise(_) | Helper::Leaf(_))
    }
}

/// The instruction set compiled units are written in.
///
/// Emitters don't check register allocation, that's the allocator's job. They do keep track of
/// labels so a unit with a dangling branch can't be installed.
pub trait CodeEmitter {
    fn load_guest(&mut self, dst: HostReg, slot: GuestSlot);
    fn store_guest(&mut self, slot: GuestSlot, src: Operand);
    fn mov(&mut self, dst: HostReg, src: Operand);
    fn alu(&mut self, op: AluOp, dst: HostReg, a: HostReg, b: Operand);
    /// Leaves `dst` untouched and raises Overflow when the result doesn't fit
    fn alu_trap(&mut self, op: TrapOp, dst: HostReg, a: HostReg, b: Operand, site: Site);
    /// dst = cond(a, b) as 0 or 1
    fn set_cond(&mut self, cond: Cond, dst: HostReg, a: HostReg, b: Operand);
    /// dst = if cond != 0 { if_true } else { if_false }
    fn select(&mut self, dst: HostReg, cond: HostReg, if_true: Operand, if_false: Operand);
    fn mul_div(&mut self, op: MulDivOp, a: HostReg, b: HostReg);
    /// Calls a helper. Arguments are evaluated before any register is clobbered; the result
    /// lands in `RETURN_REG` and every other volatile register is garbage afterwards.
    fn call(&mut self, helper: Helper, args: &[Operand], site: Site);

    fn new_label(&mut self) -> Label;
    fn bind(&mut self, label: Label);
    fn jump(&mut self, label: Label);
    fn branch_zero(&mut self, reg: HostReg, label: Label);
    fn branch_nonzero(&mut self, reg: HostReg, label: Label);
    /// Taken when the last helper dispatched a guest exception
    fn branch_exception(&mut self, label: Label);

    fn reserve_stack(&mut self, slots: u32);
    fn release_stack(&mut self, slots: u32);
    fn save(&mut self, slot: u32, src: HostReg);
    fn restore(&mut self, dst: HostReg, slot: u32);

    fn add_cycles(&mut self, cycles: u32);
    fn ret(&mut self);
}

/// What compiled code can reach while running.
pub trait Runtime {
    fn state(&mut self) -> &mut CpuState;
    fn call(&mut self, helper: Helper, args: &[u64], site: Site) -> u64;
}

/// Handle to an installed unit
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct BlockId {
    index: u32,
    generation: u32,
}

/// Somewhere to return units to once the code cache drops them
pub trait BlockRelease {
    fn release(&mut self, block: BlockId);
}

impl BlockRelease for Vec<BlockId> {
    fn release(&mut self, block: BlockId) {
        self.push(block);
    }
}

#[derive(Debug, thiserror::Error, Clone, PartialEq, Eq)]
pub enum BackendError {
    #[error("label {0} was never bound")]
    UnboundLabel(u32),
    #[error("unit doesn't end in a return")]
    MissingReturn,
    #[error("execution ran off the end of the unit at op {0}")]
    FellOffEnd(usize),
    #[error("stack slot {0} is outside the reserved frame")]
    BadStackSlot(u32),
    #[error("released more stack than was reserved")]
    StackUnderflow,
    #[error("unit returned with {0} stack slots still reserved")]
    UnbalancedStack(usize),
    #[error("unit clobbered callee-saved register {0}")]
    CalleeSavedClobbered(HostReg),
    #[error("unit {0:?} has been released")]
    StaleBlock(BlockId),
    #[error("out of code space ({limit} units)")]
    OutOfCodeSpace { limit: usize },
}
