use modular_bitfield::{bitfield, specifiers::*};
use super::coprocessor0::COP0_REG_NAMES;

#[bitfield(bits = 32)]
#[derive(Debug, Copy, Clone)]
pub struct IType {
    pub imm: B16,
    pub rt: B5,
    pub rs: B5,
    #[skip]
    op: B6,
}

#[bitfield(bits = 32)]
#[derive(Debug, Copy, Clone)]
pub struct JType {
    pub target: B26,
    #[skip]
    op: B6,
}

#[bitfield(bits = 32)]
#[derive(Debug, Copy, Clone)]
pub struct RType {
    pub funct: B6,
    pub sa: B5,
    pub rd: B5,
    pub rt: B5,
    pub rs: B5,
    pub op: B6,
}

pub const MIPS_REG_NAMES: [&'static str; 32] = [
    "$zero", // Always 0
    "$at",   // r1 - Reserved for assembler
    "$v0", "$v1", // r2-r3 - Function return values
    "$a0", "$a1", "$a2", "$a3", // r4-r7 - function arguments
    "$t0", "$t1", "$t2", "$t3", "$t4", "$t5", "$t6",
    "$t7", // r8-r15 - Temporaries (Caller saved)
    "$s0", "$s1", "$s2", "$s3", "$s4", "$s5", "$s6", "$s7", // r16-r23 - Saved  (Callee saved)
    "$t8", "$t9", // r24-r25 - Caller-saved temporaries
    "$k0", "$k1", // Reserved for OS kernel
    "$gp", // r28 - Global pointer
    "$sp", // r29 - Stack pointer
    "$fp", // r30 - Frame pointer
    "$ra", // r31 - Return address
];

#[derive(Debug, thiserror::Error, Copy, Clone, PartialEq, Eq)]
pub enum DecodeError {
    #[error("reserved instruction {0:#010x}")]
    Reserved(u32),
}

/// A decoded instruction word plus its table entry.
#[derive(Debug, Copy, Clone)]
pub struct Instruction {
    pub word: u32,
    name: &'static str,
    form: Form,
    pub exec: Exec,
}

/// Operand layout, only used for disassembly.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Form {
    J26,
    RegImm(bool), // true == signed
    LoadUpper,
    BranchReg,
    BranchRegReg,
    LoadBaseImm,
    StoreBaseImm,
    JReg,
    JRegLink,
    ShiftImm,
    ShiftReg,
    MoveFrom,
    MoveTo,
    MulDiv,
    RegRegReg,
    CopReg,
    NoArgs,
}

/// What the compiler has to emit for an instruction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Exec {
    Nop,
    Jump { link: bool },
    JumpReg { link: bool },
    Branch { cmp: CmpMode, likely: bool, link: bool },
    /// rt = rs op imm
    AluImm(AluKind),
    LoadUpper,
    /// rd = rs op rt
    Alu(AluKind),
    /// rd = rt op sa, `plus32` adds 32 to the shift amount
    ShiftImm { kind: AluKind, plus32: bool },
    /// rd = rt op rs
    ShiftVar(AluKind),
    CondMove { on_zero: bool },
    MoveFrom(InternalReg),
    MoveTo(InternalReg),
    MulDiv(MulDivKind),
    Load { width: u8, signed: bool },
    Store { width: u8 },
    LoadQuad,
    StoreQuad,
    Syscall,
    Break,
    Mfc0,
    Mtc0,
    Tlbr,
    Tlbwi,
    Tlbwr,
    Tlbp,
    Eret,
    Ei,
    Di,
    /// Handled by the `LeafOps` collaborator
    Leaf,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AluKind {
    Add32,
    AddU32,
    Add64,
    AddU64,
    Sub32,
    SubU32,
    Sub64,
    SubU64,
    SetLess,
    SetLessU,
    And,
    Or,
    Xor,
    Nor,
    ShiftLeft32,
    ShiftRight32,
    ShiftRightArith32,
    ShiftLeft64,
    ShiftRight64,
    ShiftRightArith64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CmpMode {
    Eq,
    Ne,
    Le,
    Ge,
    Lt,
    Gt,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MulDivKind {
    Mul32,
    MulU32,
    Div32,
    DivU32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InternalReg {
    HI = 0,
    LO = 1,
}

#[derive(Debug, Clone, Copy)]
pub enum InstructionInfo {
    Reserved,
    Special,
    RegImm,
    Cop0,
    Op(&'static str, Form, Exec),
}

impl Instruction {
    #[inline(always)]
    pub fn i(&self) -> IType {
        IType::from_bytes(self.word.to_le_bytes())
    }

    #[inline(always)]
    pub fn r(&self) -> RType {
        RType::from_bytes(self.word.to_le_bytes())
    }

    #[inline(always)]
    pub fn j(&self) -> JType {
        JType::from_bytes(self.word.to_le_bytes())
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Sign-extended 16-bit immediate
    pub fn simm(&self) -> i64 {
        self.i().imm() as i16 as i64
    }

    /// Branches, jumps and ERET. These end a unit and can't be nested in a delay slot.
    pub fn is_control_transfer(&self) -> bool {
        matches!(self.exec, Exec::Jump { .. } | Exec::JumpReg { .. } | Exec::Branch { .. } | Exec::Eret)
    }

    /// Provides a string representation of the instruction (as disassembly)
    pub fn disassemble(&self, address: u32) -> String {
        use Form::*;
        let i = self.i();
        let r = self.r();
        let reg = |n: u8| MIPS_REG_NAMES[n as usize];

        let args: Vec<String> = match self.form {
            J26 => {
                let target = (address.wrapping_add(4) & 0xf000_0000) | (self.j().target() << 2);
                vec![format!("{:#010x}", target)]
            }
            RegImm(signed) => {
                let imm = if signed { signed_hex(self.simm()) } else { format!("{:#x}", i.imm()) };
                vec![reg(i.rt()).to_owned(), reg(i.rs()).to_owned(), imm]
            }
            LoadUpper => vec![reg(i.rt()).to_owned(), format!("{:#x}", i.imm())],
            BranchReg | BranchRegReg => {
                let target = address.wrapping_add(4).wrapping_add((self.simm() << 2) as u32);
                let mut args = vec![reg(i.rs()).to_owned()];
                if self.form == BranchRegReg {
                    args.push(reg(i.rt()).to_owned());
                }
                args.push(format!("{:#010x}", target));
                args
            }
            LoadBaseImm | StoreBaseImm => {
                vec![reg(i.rt()).to_owned(), format!("{}({})", signed_hex(self.simm()), reg(i.rs()))]
            }
            JReg | MoveTo => vec![reg(r.rs()).to_owned()],
            JRegLink => vec![reg(r.rd()).to_owned(), reg(r.rs()).to_owned()],
            ShiftImm => vec![reg(r.rd()).to_owned(), reg(r.rt()).to_owned(), format!("{}", r.sa())],
            ShiftReg => vec![reg(r.rd()).to_owned(), reg(r.rt()).to_owned(), reg(r.rs()).to_owned()],
            MoveFrom => vec![reg(r.rd()).to_owned()],
            MulDiv => {
                let mut args = vec![reg(r.rs()).to_owned(), reg(r.rt()).to_owned()];
                if r.rd() != 0 {
                    args.insert(0, reg(r.rd()).to_owned());
                }
                args
            }
            RegRegReg => vec![reg(r.rd()).to_owned(), reg(r.rs()).to_owned(), reg(r.rt()).to_owned()],
            CopReg => vec![reg(r.rt()).to_owned(), COP0_REG_NAMES[r.rd() as usize].to_owned()],
            NoArgs => vec![],
        };

        if args.is_empty() {
            self.name.to_owned()
        } else {
            format!("{:<7} {}", self.name, args.join(", "))
        }
    }
}

fn signed_hex(value: i64) -> String {
    if value < 0 {
        format!("-{:#x}", value.unsigned_abs())
    } else {
        format!("{:#x}", value)
    }
}

pub fn decode(word: u32) -> Result<Instruction, DecodeError> {
    // we pre-decode to R-Type, as it's the only type decode logic uses
    let inst = RType::from_bytes(word.to_le_bytes());

    let mut info = &PRIMARY_TABLE[inst.op() as usize];
    loop {
        match info {
            InstructionInfo::Special => {
                info = &SPECIAL_TABLE[inst.funct() as usize];
            }
            InstructionInfo::RegImm => {
                info = &REGIMM_TABLE[inst.rt() as usize];
            }
            InstructionInfo::Cop0 => {
                if inst.rs() < 16 {
                    info = &COP0_TABLE[inst.rs() as usize];
                } else {
                    info = &COP0_FN_TABLE[inst.funct() as usize];
                }
            }
            InstructionInfo::Op(name, form, exec) => {
                return Ok(Instruction { word, name: *name, form: *form, exec: *exec });
            }
            InstructionInfo::Reserved => {
                return Err(DecodeError::Reserved(word));
            }
        }
    }
}

const fn build_primary_table() -> [InstructionInfo; 64] {
    use InstructionInfo::*;
    use Exec::*;
    use AluKind::*;
    use CmpMode::*;

    // Almost everything in the primary table is IType.
    // The exceptions are the:
    //  - the two subtables. All RegImm are IType, all Special are RType
    //  - the COP ops, which are a mix of IType and RType
    //  = J and JAL which are JType.

    [
        Special,
        RegImm,
        Op("J", Form::J26, Jump { link: false }),
        Op("JAL", Form::J26, Jump { link: true }),
        Op("BEQ", Form::BranchRegReg, Branch { cmp: Eq, likely: false, link: false }),
        Op("BNE", Form::BranchRegReg, Branch { cmp: Ne, likely: false, link: false }),
        Op("BLEZ", Form::BranchReg, Branch { cmp: Le, likely: false, link: false }),
        Op("BGTZ", Form::BranchReg, Branch { cmp: Gt, likely: false, link: false }),
        // 1
        Op("ADDI", Form::RegImm(true), AluImm(Add32)),
        Op("ADDIU", Form::RegImm(true), AluImm(AddU32)),
        Op("SLTI", Form::RegImm(true), AluImm(SetLess)),
        Op("SLTIU", Form::RegImm(true), AluImm(SetLessU)),
        Op("ANDI", Form::RegImm(false), AluImm(And)),
        Op("ORI", Form::RegImm(false), AluImm(Or)),
        Op("XORI", Form::RegImm(false), AluImm(Xor)),
        Op("LUI", Form::LoadUpper, LoadUpper),
        // 2
        Cop0,
        Op("COP1", Form::NoArgs, Leaf),
        Op("COP2", Form::NoArgs, Leaf),
        Reserved,
        Op("BEQL", Form::BranchRegReg, Branch { cmp: Eq, likely: true, link: false }),
        Op("BNEL", Form::BranchRegReg, Branch { cmp: Ne, likely: true, link: false }),
        Op("BLEZL", Form::BranchReg, Branch { cmp: Le, likely: true, link: false }),
        Op("BGTZL", Form::BranchReg, Branch { cmp: Gt, likely: true, link: false }),
        // 3
        Op("DADDI", Form::RegImm(true), AluImm(Add64)),
        Op("DADDIU", Form::RegImm(true), AluImm(AddU64)),
        Op("LDL", Form::LoadBaseImm, Leaf),
        Op("LDR", Form::LoadBaseImm, Leaf),
        Op("MMI", Form::NoArgs, Leaf),
        Reserved,
        Op("LQ", Form::LoadBaseImm, LoadQuad),
        Op("SQ", Form::StoreBaseImm, StoreQuad),
        // 4
        Op("LB", Form::LoadBaseImm, Load { width: 1, signed: true }),
        Op("LH", Form::LoadBaseImm, Load { width: 2, signed: true }),
        Op("LWL", Form::LoadBaseImm, Leaf),
        Op("LW", Form::LoadBaseImm, Load { width: 4, signed: true }),
        Op("LBU", Form::LoadBaseImm, Load { width: 1, signed: false }),
        Op("LHU", Form::LoadBaseImm, Load { width: 2, signed: false }),
        Op("LWR", Form::LoadBaseImm, Leaf),
        Op("LWU", Form::LoadBaseImm, Load { width: 4, signed: false }),
        // 5
        Op("SB", Form::StoreBaseImm, Store { width: 1 }),
        Op("SH", Form::StoreBaseImm, Store { width: 2 }),
        Op("SWL", Form::StoreBaseImm, Leaf),
        Op("SW", Form::StoreBaseImm, Store { width: 4 }),
        Op("SDL", Form::StoreBaseImm, Leaf),
        Op("SDR", Form::StoreBaseImm, Leaf),
        Op("SWR", Form::StoreBaseImm, Leaf),
        // No cache model, so cache maintenance has nothing to do
        Op("CACHE", Form::NoArgs, Nop),
        // 6
        Reserved,
        Op("LWC1", Form::LoadBaseImm, Leaf),
        Reserved,
        Op("PREF", Form::NoArgs, Nop),
        Reserved,
        Reserved,
        Op("LQC2", Form::LoadBaseImm, Leaf),
        Op("LD", Form::LoadBaseImm, Load { width: 8, signed: false }),
        // 7
        Reserved,
        Op("SWC1", Form::StoreBaseImm, Leaf),
        Reserved,
        Reserved,
        Reserved,
        Reserved,
        Op("SQC2", Form::StoreBaseImm, Leaf),
        Op("SD", Form::StoreBaseImm, Store { width: 8 }),
    ]
}

const fn build_special_table() -> [InstructionInfo; 64] {
    use InstructionInfo::*;
    use Exec::*;
    use AluKind::*;

    [
        // 0
        Op("SLL", Form::ShiftImm, ShiftImm { kind: ShiftLeft32, plus32: false }),
        Reserved,
        Op("SRL", Form::ShiftImm, ShiftImm { kind: ShiftRight32, plus32: false }),
        Op("SRA", Form::ShiftImm, ShiftImm { kind: ShiftRightArith32, plus32: false }),
        Op("SLLV", Form::ShiftReg, ShiftVar(ShiftLeft32)),
        Reserved,
        Op("SRLV", Form::ShiftReg, ShiftVar(ShiftRight32)),
        Op("SRAV", Form::ShiftReg, ShiftVar(ShiftRightArith32)),
        // 1
        Op("JR", Form::JReg, JumpReg { link: false }),
        Op("JALR", Form::JRegLink, JumpReg { link: true }),
        Op("MOVZ", Form::RegRegReg, CondMove { on_zero: true }),
        Op("MOVN", Form::RegRegReg, CondMove { on_zero: false }),
        Op("SYSCALL", Form::NoArgs, Syscall),
        Op("BREAK", Form::NoArgs, Break),
        Reserved,
        // Memory is strongly ordered here, so SYNC has nothing to wait for
        Op("SYNC", Form::NoArgs, Nop),
        // 2
        Op("MFHI", Form::MoveFrom, MoveFrom(InternalReg::HI)),
        Op("MTHI", Form::MoveTo, MoveTo(InternalReg::HI)),
        Op("MFLO", Form::MoveFrom, MoveFrom(InternalReg::LO)),
        Op("MTLO", Form::MoveTo, MoveTo(InternalReg::LO)),
        Op("DSLLV", Form::ShiftReg, ShiftVar(ShiftLeft64)),
        Reserved,
        Op("DSRLV", Form::ShiftReg, ShiftVar(ShiftRight64)),
        Op("DSRAV", Form::ShiftReg, ShiftVar(ShiftRightArith64)),
        // 3
        Op("MULT", Form::MulDiv, MulDiv(MulDivKind::Mul32)),
        Op("MULTU", Form::MulDiv, MulDiv(MulDivKind::MulU32)),
        Op("DIV", Form::MulDiv, MulDiv(MulDivKind::Div32)),
        Op("DIVU", Form::MulDiv, MulDiv(MulDivKind::DivU32)),
        Reserved,
        Reserved,
        Reserved,
        Reserved,
        // 4
        Op("ADD", Form::RegRegReg, Alu(Add32)),
        Op("ADDU", Form::RegRegReg, Alu(AddU32)),
        Op("SUB", Form::RegRegReg, Alu(Sub32)),
        Op("SUBU", Form::RegRegReg, Alu(SubU32)),
        Op("AND", Form::RegRegReg, Alu(And)),
        Op("OR", Form::RegRegReg, Alu(Or)),
        Op("XOR", Form::RegRegReg, Alu(Xor)),
        Op("NOR", Form::RegRegReg, Alu(Nor)),
        // 5
        Op("MFSA", Form::NoArgs, Leaf),
        Op("MTSA", Form::NoArgs, Leaf),
        Op("SLT", Form::RegRegReg, Alu(SetLess)),
        Op("SLTU", Form::RegRegReg, Alu(SetLessU)),
        Op("DADD", Form::RegRegReg, Alu(Add64)),
        Op("DADDU", Form::RegRegReg, Alu(AddU64)),
        Op("DSUB", Form::RegRegReg, Alu(Sub64)),
        Op("DSUBU", Form::RegRegReg, Alu(SubU64)),
        // 6
        Op("TGE", Form::NoArgs, Leaf),
        Op("TGEU", Form::NoArgs, Leaf),
        Op("TLT", Form::NoArgs, Leaf),
        Op("TLTU", Form::NoArgs, Leaf),
        Op("TEQ", Form::NoArgs, Leaf),
        Reserved,
        Op("TNE", Form::NoArgs, Leaf),
        Reserved,
        // 7
        Op("DSLL", Form::ShiftImm, ShiftImm { kind: ShiftLeft64, plus32: false }),
        Reserved,
        Op("DSRL", Form::ShiftImm, ShiftImm { kind: ShiftRight64, plus32: false }),
        Op("DSRA", Form::ShiftImm, ShiftImm { kind: ShiftRightArith64, plus32: false }),
        Op("DSLL32", Form::ShiftImm, ShiftImm { kind: ShiftLeft64, plus32: true }),
        Reserved,
        Op("DSRL32", Form::ShiftImm, ShiftImm { kind: ShiftRight64, plus32: true }),
        Op("DSRA32", Form::ShiftImm, ShiftImm { kind: ShiftRightArith64, plus32: true }),
    ]
}

const fn build_regimm_table() -> [InstructionInfo; 32] {
    use InstructionInfo::*;
    use Exec::*;
    use CmpMode::*;

    let mut table = [Reserved; 32];
    table[0x00] = Op("BLTZ", Form::BranchReg, Branch { cmp: Lt, likely: false, link: false });
    table[0x01] = Op("BGEZ", Form::BranchReg, Branch { cmp: Ge, likely: false, link: false });
    table[0x02] = Op("BLTZL", Form::BranchReg, Branch { cmp: Lt, likely: true, link: false });
    table[0x03] = Op("BGEZL", Form::BranchReg, Branch { cmp: Ge, likely: true, link: false });
    table[0x08] = Op("TGEI", Form::NoArgs, Leaf);
    table[0x09] = Op("TGEIU", Form::NoArgs, Leaf);
    table[0x0a] = Op("TLTI", Form::NoArgs, Leaf);
    table[0x0b] = Op("TLTIU", Form::NoArgs, Leaf);
    table[0x0c] = Op("TEQI", Form::NoArgs, Leaf);
    table[0x0e] = Op("TNEI", Form::NoArgs, Leaf);
    table[0x10] = Op("BLTZAL", Form::BranchReg, Branch { cmp: Lt, likely: false, link: true });
    table[0x11] = Op("BGEZAL", Form::BranchReg, Branch { cmp: Ge, likely: false, link: true });
    table[0x12] = Op("BLTZALL", Form::BranchReg, Branch { cmp: Lt, likely: true, link: true });
    table[0x13] = Op("BGEZALL", Form::BranchReg, Branch { cmp: Ge, likely: true, link: true });
    table[0x18] = Op("MTSAB", Form::NoArgs, Leaf);
    table[0x19] = Op("MTSAH", Form::NoArgs, Leaf);

    return table;
}

const fn build_cop0_table() -> [InstructionInfo; 16] {
    use InstructionInfo::*;

    let mut table = [Reserved; 16];
    table[0x0] = Op("MFC0", Form::CopReg, Exec::Mfc0);
    table[0x4] = Op("MTC0", Form::CopReg, Exec::Mtc0);
    table[0x8] = Op("BC0", Form::NoArgs, Exec::Leaf);

    return table;
}

const fn build_cop0_fn_table() -> [InstructionInfo; 64] {
    use InstructionInfo::*;

    let mut table = [Reserved; 64];
    table[0x01] = Op("TLBR", Form::NoArgs, Exec::Tlbr);
    table[0x02] = Op("TLBWI", Form::NoArgs, Exec::Tlbwi);
    table[0x06] = Op("TLBWR", Form::NoArgs, Exec::Tlbwr);
    table[0x08] = Op("TLBP", Form::NoArgs, Exec::Tlbp);
    table[0x18] = Op("ERET", Form::NoArgs, Exec::Eret);
    table[0x38] = Op("EI", Form::NoArgs, Exec::Ei);
    table[0x39] = Op("DI", Form::NoArgs, Exec::Di);

    return table;
}

static PRIMARY_TABLE: [InstructionInfo; 64] = build_primary_table();
static SPECIAL_TABLE: [InstructionInfo; 64] = build_special_table();
static REGIMM_TABLE: [InstructionInfo; 32] = build_regimm_table();
static COP0_TABLE: [InstructionInfo; 16] = build_cop0_table();
static COP0_FN_TABLE: [InstructionInfo; 64] = build_cop0_fn_table();
