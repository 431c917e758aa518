//! The instruction set.
//!
//! The [`for_each_op!`] macro holds the canonical operation list and invokes
//! a callback macro for code generation, so the opcode enum, the operand
//! class tables and the assembler never drift apart. Opcodes are assigned in
//! table order starting at zero and are stable.
//!
//! The parity of an opcode selects the endianness of its encoded operands:
//! even opcodes encode little-endian, odd opcodes big-endian. Nothing else
//! in the machine depends on it.

#[cfg(test)]
mod tests;

pub mod functions;

use crate::endian::Endianness;
use crate::memory::Space;
use crate::options::Options;
use crate::registers::{Register, Width};
use crate::vm::Vm;
use std::fmt::{self, Display, Formatter};

/// A type alias for results that could be a [`Fault`].
pub type Result<T> = std::result::Result<T, Fault>;

/// The reason the CPU stopped executing.
#[derive(Debug, Clone, PartialEq, Eq, derive_more::Display)]
pub enum FaultKind {
    /// The opcode cell does not name an operation.
    #[display(fmt = "unknown opcode {:#x}", _0)]
    UnknownOpcode(u64),
    /// A memory access fell outside its address space.
    #[display(fmt = "out of bounds access at address {:#x} in {}", addr, space)]
    OutOfBounds { space: Space, addr: u128 },
    /// A write went through the read-only `program` name.
    #[display(fmt = "write to read-only {} space", _0)]
    ReadOnlyWrite(Space),
    #[display(fmt = "stack overflow")]
    StackOverflow,
    #[display(fmt = "stack underflow")]
    StackUnderflow,
    #[display(fmt = "division by zero")]
    DivByZero,
    /// A register operand cell does not name a register.
    #[display(fmt = "invalid register id {}", _0)]
    InvalidRegister(u64),
    /// A host I/O error surfaced through `in`, `out` or `seek`.
    #[display(fmt = "i/o error: {}", _0)]
    Io(String),
}

/// An execution fault: what went wrong and where.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fault {
    pub kind: FaultKind,
    /// Address of the instruction that faulted.
    pub ip: u128,
}

impl Display for Fault {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "fault at {:#010x}: {}", self.ip, self.kind)
    }
}

impl std::error::Error for Fault {}

/// Operand classes and their encoded size.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArgKind {
    /// Register id, one cell.
    Reg,
    /// Immediate byte, one cell.
    ImmByte,
    /// Immediate word, `word_size` cells.
    ImmWord,
    /// Immediate address or label, `addr_size` cells.
    Addr,
}

impl ArgKind {
    /// Encoded size of this operand, in cells.
    #[inline]
    #[must_use]
    pub fn cells(self, options: &Options) -> usize {
        match self {
            ArgKind::Reg | ArgKind::ImmByte => 1,
            ArgKind::ImmWord => options.word_size as usize,
            ArgKind::Addr => options.addr_size as usize,
        }
    }

    /// Bit width of this operand.
    #[inline]
    #[must_use]
    pub fn bits(self, options: &Options) -> u32 {
        match self {
            ArgKind::Reg | ArgKind::ImmByte => options.char_bit,
            ArgKind::ImmWord => options.word_bits(),
            ArgKind::Addr => options.addr_bits(),
        }
    }
}

/// Invokes a callback macro with the complete operation list.
///
/// Entry format: `Variant = "mnemonic", [operand classes] => semantic class`.
/// The position of an entry is its opcode.
#[macro_export]
macro_rules! for_each_op {
    ($callback:ident) => {
        $callback! {
            // Data movement. Addressed moves go through RAM; `lpb` reads
            // from program space for embedded data tables.
            MovwR2r = "movw.r2r", [Reg, Reg] => MovR2r,
            MovbI2r = "movb.i2r", [Reg, ImmByte] => MovI2r(Byte),
            MovbM2r = "movb.m2r", [Reg, Addr] => MovM2r(Byte),
            MovbR2m = "movb.r2m", [Addr, Reg] => MovR2m(Byte),
            MovwI2r = "movw.i2r", [Reg, ImmWord] => MovI2r(Word),
            MovwM2r = "movw.m2r", [Reg, Addr] => MovM2r(Word),
            MovwR2m = "movw.r2m", [Addr, Reg] => MovR2m(Word),
            /// ldb dst, addr ; dst = ram[addr], one cell
            Ldb = "ldb", [Reg, Reg] => Load(Byte),
            /// ldw dst, addr ; dst = ram[addr], one word
            Ldw = "ldw", [Reg, Reg] => Load(Word),
            /// lda dst, addr ; dst = ram[addr], one address
            Lda = "lda", [Reg, Reg] => Load(Addr),
            /// stb addr, src ; ram[addr] = low cell of src
            Stb = "stb", [Reg, Reg] => Store(Byte),
            /// stw addr, src ; ram[addr] = src, one word
            Stw = "stw", [Reg, Reg] => Store(Word),
            /// sta addr, src ; ram[addr] = src, one address
            Sta = "sta", [Reg, Reg] => Store(Addr),
            /// lpb dst, addr ; dst = program[addr], one cell
            Lpb = "lpb", [Reg, Reg] => LoadProgram,
            Push = "push", [Reg] => Push,
            Pop = "pop", [Reg] => Pop,
            // Arithmetic and logic. `.b` is cell-wide, `.w` word-wide,
            // `.r` register-register at word width. All update Z C S O.
            AddB = "add.b", [Reg, ImmByte] => Alu(Add, Imm(Byte)),
            AddW = "add.w", [Reg, ImmWord] => Alu(Add, Imm(Word)),
            AddR = "add.r", [Reg, Reg] => Alu(Add, Reg),
            SubB = "sub.b", [Reg, ImmByte] => Alu(Sub, Imm(Byte)),
            SubW = "sub.w", [Reg, ImmWord] => Alu(Sub, Imm(Word)),
            SubR = "sub.r", [Reg, Reg] => Alu(Sub, Reg),
            MulB = "mul.b", [Reg, ImmByte] => Alu(Mul, Imm(Byte)),
            MulW = "mul.w", [Reg, ImmWord] => Alu(Mul, Imm(Word)),
            MulR = "mul.r", [Reg, Reg] => Alu(Mul, Reg),
            DivB = "div.b", [Reg, ImmByte] => Alu(Div, Imm(Byte)),
            DivW = "div.w", [Reg, ImmWord] => Alu(Div, Imm(Word)),
            DivR = "div.r", [Reg, Reg] => Alu(Div, Reg),
            ModB = "mod.b", [Reg, ImmByte] => Alu(Mod, Imm(Byte)),
            ModW = "mod.w", [Reg, ImmWord] => Alu(Mod, Imm(Word)),
            ModR = "mod.r", [Reg, Reg] => Alu(Mod, Reg),
            AndB = "and.b", [Reg, ImmByte] => Alu(And, Imm(Byte)),
            AndW = "and.w", [Reg, ImmWord] => Alu(And, Imm(Word)),
            AndR = "and.r", [Reg, Reg] => Alu(And, Reg),
            OrB = "or.b", [Reg, ImmByte] => Alu(Or, Imm(Byte)),
            OrW = "or.w", [Reg, ImmWord] => Alu(Or, Imm(Word)),
            OrR = "or.r", [Reg, Reg] => Alu(Or, Reg),
            XorB = "xor.b", [Reg, ImmByte] => Alu(Xor, Imm(Byte)),
            XorW = "xor.w", [Reg, ImmWord] => Alu(Xor, Imm(Word)),
            XorR = "xor.r", [Reg, Reg] => Alu(Xor, Reg),
            ShlB = "shl.b", [Reg, ImmByte] => Alu(Shl, Imm(Byte)),
            ShlW = "shl.w", [Reg, ImmWord] => Alu(Shl, Imm(Word)),
            ShlR = "shl.r", [Reg, Reg] => Alu(Shl, Reg),
            ShrB = "shr.b", [Reg, ImmByte] => Alu(Shr, Imm(Byte)),
            ShrW = "shr.w", [Reg, ImmWord] => Alu(Shr, Imm(Word)),
            ShrR = "shr.r", [Reg, Reg] => Alu(Shr, Reg),
            CmpB = "cmp.b", [Reg, ImmByte] => Alu(Cmp, Imm(Byte)),
            CmpW = "cmp.w", [Reg, ImmWord] => Alu(Cmp, Imm(Word)),
            CmpR = "cmp.r", [Reg, Reg] => Alu(Cmp, Reg),
            NotB = "not.b", [Reg] => Unary(Not, Byte),
            NotW = "not.w", [Reg] => Unary(Not, Word),
            NegB = "neg.b", [Reg] => Unary(Neg, Byte),
            NegW = "neg.w", [Reg] => Unary(Neg, Word),
            // Control flow. Absolute targets are unsigned addresses;
            // `.rel` displacements are signed and based at the address of
            // the next instruction.
            Jmp = "jmp", [Addr] => Jump(Always, Abs),
            JmpRel = "jmp.rel", [Addr] => Jump(Always, Rel),
            Je = "je", [Addr] => Jump(Eq, Abs),
            JeRel = "je.rel", [Addr] => Jump(Eq, Rel),
            Jne = "jne", [Addr] => Jump(Ne, Abs),
            JneRel = "jne.rel", [Addr] => Jump(Ne, Rel),
            Jb = "jb", [Addr] => Jump(Below, Abs),
            JbRel = "jb.rel", [Addr] => Jump(Below, Rel),
            Jbe = "jbe", [Addr] => Jump(BelowEq, Abs),
            JbeRel = "jbe.rel", [Addr] => Jump(BelowEq, Rel),
            Ja = "ja", [Addr] => Jump(Above, Abs),
            JaRel = "ja.rel", [Addr] => Jump(Above, Rel),
            Jae = "jae", [Addr] => Jump(AboveEq, Abs),
            JaeRel = "jae.rel", [Addr] => Jump(AboveEq, Rel),
            Jl = "jl", [Addr] => Jump(Less, Abs),
            JlRel = "jl.rel", [Addr] => Jump(Less, Rel),
            Jle = "jle", [Addr] => Jump(LessEq, Abs),
            JleRel = "jle.rel", [Addr] => Jump(LessEq, Rel),
            Jg = "jg", [Addr] => Jump(Greater, Abs),
            JgRel = "jg.rel", [Addr] => Jump(Greater, Rel),
            Jge = "jge", [Addr] => Jump(GreaterEq, Abs),
            JgeRel = "jge.rel", [Addr] => Jump(GreaterEq, Rel),
            /// loop target ; decrement C, jump while nonzero
            Loop = "loop", [Addr] => Loop(Abs),
            LoopRel = "loop.rel", [Addr] => Loop(Rel),
            Call = "call", [Addr] => Call(Abs),
            CallRel = "call.rel", [Addr] => Call(Rel),
            Ret = "ret", [] => Ret,
            Halt = "halt", [] => Halt,
            /// in ; one cell from the input channel into A, C set at EOF
            In = "in", [] => In,
            /// out ; low byte of A to the output channel
            Out = "out", [] => Out,
            /// seek ; move the terminal cursor to column A, row B
            Seek = "seek", [] => Seek,
        }
    };
}

macro_rules! define_opcodes {
    (
        $(
            $(#[$doc:meta])*
            $name:ident = $mnemonic:literal, [ $( $kind:ident ),* ] => $class:expr
        ),* $(,)?
    ) => {
        /// Every operation the CPU knows, in stable opcode order.
        #[derive(Debug, Clone, Copy, PartialEq, Eq)]
        #[repr(u8)]
        pub enum Opcode {
            $(
                $(#[$doc])*
                $name,
            )*
        }

        impl Opcode {
            /// All opcodes, indexed by their opcode number.
            pub const ALL: &'static [Opcode] = &[ $( Opcode::$name ),* ];

            /// Returns the assembly mnemonic for this operation.
            #[must_use]
            pub fn mnemonic(self) -> &'static str {
                match self {
                    $( Opcode::$name => $mnemonic, )*
                }
            }

            /// Returns the operand classes of this operation, in order.
            #[must_use]
            pub fn args(self) -> &'static [ArgKind] {
                match self {
                    $( Opcode::$name => &[ $( ArgKind::$kind ),* ], )*
                }
            }

            /// Returns the semantic class dispatched over by the executor.
            #[must_use]
            pub fn class(self) -> OpClass {
                #[allow(unused_imports)]
                use {
                    AddrMode::*, AluOp::*, AluSrc::*, Cond::*, OpClass::*, UnaryOp::*, Width::*,
                };
                match self {
                    $( Opcode::$name => $class, )*
                }
            }
        }
    };
}

for_each_op!(define_opcodes);

impl Opcode {
    /// Looks an opcode up by its cell value.
    pub fn from_cell(cell: u64) -> std::result::Result<Self, FaultKind> {
        Self::ALL
            .get(cell as usize)
            .copied()
            .ok_or(FaultKind::UnknownOpcode(cell))
    }

    /// The endianness used for this operation's encoded operands.
    #[inline]
    #[must_use]
    pub fn endianness(self) -> Endianness {
        if self as u8 % 2 == 0 {
            Endianness::Little
        } else {
            Endianness::Big
        }
    }

    /// Size of the encoded instruction including the opcode cell.
    #[must_use]
    pub fn encoded_size(self, options: &Options) -> usize {
        1 + self
            .args()
            .iter()
            .map(|kind| kind.cells(options))
            .sum::<usize>()
    }
}

/// Semantic grouping of operations, matched over by the executor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpClass {
    MovR2r,
    MovI2r(Width),
    MovM2r(Width),
    MovR2m(Width),
    Load(Width),
    Store(Width),
    LoadProgram,
    Push,
    Pop,
    Alu(AluOp, AluSrc),
    Unary(UnaryOp, Width),
    Jump(Cond, AddrMode),
    Loop(AddrMode),
    Call(AddrMode),
    Ret,
    Halt,
    In,
    Out,
    Seek,
}

/// Binary arithmetic and logic operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AluOp {
    Add,
    Sub,
    Mul,
    Div,
    Mod,
    And,
    Or,
    Xor,
    Shl,
    Shr,
    Cmp,
}

/// Where the right-hand operand of an ALU operation comes from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AluSrc {
    Imm(Width),
    Reg,
}

/// Unary operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnaryOp {
    Not,
    Neg,
}

/// Branch conditions over the flag register.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Cond {
    Always,
    Eq,
    Ne,
    Below,
    BelowEq,
    Above,
    AboveEq,
    Less,
    LessEq,
    Greater,
    GreaterEq,
}

/// Absolute or IP-relative addressing for control flow.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddrMode {
    Abs,
    Rel,
}

/// A decoded instruction, ready to execute.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Instruction {
    pub op: Opcode,
    /// Decoded operand values; only the first `op.args().len()` are
    /// meaningful.
    pub args: [u128; 2],
}

#[inline]
fn reg(value: u128) -> std::result::Result<Register, FaultKind> {
    Register::from_id(value as u64).ok_or(FaultKind::InvalidRegister(value as u64))
}

impl Instruction {
    /// The execution of each instruction.
    pub fn execute(&self, vm: &mut Vm) -> std::result::Result<(), FaultKind> {
        let (a, b) = (self.args[0], self.args[1]);

        match self.op.class() {
            OpClass::MovR2r => functions::mov_r2r(vm, reg(a)?, reg(b)?),
            OpClass::MovI2r(width) => functions::mov_i2r(vm, width, reg(a)?, b),
            OpClass::MovM2r(width) => functions::mov_m2r(vm, width, reg(a)?, b),
            OpClass::MovR2m(width) => functions::mov_r2m(vm, width, a, reg(b)?),
            OpClass::Load(width) => functions::load_indirect(vm, width, reg(a)?, reg(b)?),
            OpClass::Store(width) => functions::store_indirect(vm, width, reg(a)?, reg(b)?),
            OpClass::LoadProgram => functions::load_program(vm, reg(a)?, reg(b)?),
            OpClass::Push => functions::push(vm, reg(a)?),
            OpClass::Pop => functions::pop(vm, reg(a)?),
            OpClass::Alu(op, src) => functions::alu(vm, op, src, reg(a)?, b),
            OpClass::Unary(op, width) => functions::unary(vm, op, width, reg(a)?),
            OpClass::Jump(cond, mode) => functions::jump(vm, cond, mode, a),
            OpClass::Loop(mode) => functions::loop_jump(vm, mode, a),
            OpClass::Call(mode) => functions::call(vm, mode, a),
            OpClass::Ret => functions::ret(vm),
            OpClass::Halt => functions::halt(vm),
            OpClass::In => functions::input(vm),
            OpClass::Out => functions::output(vm),
            OpClass::Seek => functions::seek(vm),
        }
    }
}

impl Display for Instruction {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.op.mnemonic())?;
        for (idx, kind) in self.op.args().iter().enumerate() {
            let sep = if idx == 0 { " " } else { ", " };
            match kind {
                ArgKind::Reg => match Register::from_id(self.args[idx] as u64) {
                    Some(reg) => write!(f, "{}{}", sep, reg)?,
                    None => write!(f, "{}r?{}", sep, self.args[idx])?,
                },
                _ => write!(f, "{}{}", sep, self.args[idx])?,
            }
        }
        Ok(())
    }
}
