//! The instruction stream produced for one function.
//!
//! Instructions are written in Plan 9 operand order: `OP source, destination`.
//! Comparisons read naturally, so `CMPQ a, b` followed by `JLT` jumps when
//! `a < b`.

use strum::{Display, EnumIter};

use crate::{
    backend::registers::Register,
    diagnostics::{LoweringError, Result},
    index::{Index as _, IndexVec, simple_index},
    intern::InternedSymbol,
    ty::{MAX_ROUND, align_to},
};

simple_index! {
    pub struct InstructionId;
}

impl core::fmt::Display for InstructionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.index())
    }
}

/// Operand width of an instruction, shown as the opcode suffix
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Display, EnumIter)]
pub enum Width {
    B,
    W,
    L,
    Q,
}

impl Width {
    pub fn bytes(self) -> i64 {
        match self {
            Width::B => 1,
            Width::W => 2,
            Width::L => 4,
            Width::Q => 8,
        }
    }

    pub fn from_size(size: i64) -> Option<Self> {
        match size {
            1 => Some(Width::B),
            2 => Some(Width::W),
            4 => Some(Width::L),
            8 => Some(Width::Q),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, EnumIter)]
pub enum Condition {
    #[strum(serialize = "EQ")]
    Equal,
    #[strum(serialize = "NE")]
    NotEqual,
    #[strum(serialize = "LT")]
    Less,
    #[strum(serialize = "LE")]
    LessOrEqual,
    #[strum(serialize = "GT")]
    Greater,
    #[strum(serialize = "GE")]
    GreaterOrEqual,
    /// Unsigned less than (carry set)
    #[strum(serialize = "CS")]
    Below,
    #[strum(serialize = "LS")]
    BelowOrEqual,
    #[strum(serialize = "HI")]
    Above,
    /// Unsigned greater or equal (carry clear)
    #[strum(serialize = "CC")]
    AboveOrEqual,
}

impl Condition {
    pub fn negate(self) -> Self {
        match self {
            Condition::Equal => Condition::NotEqual,
            Condition::NotEqual => Condition::Equal,
            Condition::Less => Condition::GreaterOrEqual,
            Condition::GreaterOrEqual => Condition::Less,
            Condition::LessOrEqual => Condition::Greater,
            Condition::Greater => Condition::LessOrEqual,
            Condition::Below => Condition::AboveOrEqual,
            Condition::AboveOrEqual => Condition::Below,
            Condition::BelowOrEqual => Condition::Above,
            Condition::Above => Condition::BelowOrEqual,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Opcode {
    /// Function header carrying the packed argument and frame sizes
    Text,
    Ret,
    Jmp,
    Jcc(Condition),
    Call,
    Pushq,
    Popq,
    Mov(Width),
    MovSignExtend { from: Width, to: Width },
    MovZeroExtend { from: Width, to: Width },
    Leaq,
    Add(Width),
    Sub(Width),
    Imul(Width),
    And(Width),
    Or(Width),
    Xor(Width),
    Neg(Width),
    Not(Width),
    Cmp(Width),
    Idiv(Width),
    Div(Width),
    /// Sign extend AX into DX at 32 bits
    Cdq,
    /// Sign extend AX into DX at 64 bits
    Cqo,
    Shl(Width),
    Shr(Width),
    Sar(Width),
    Cld,
    Rep,
    Stosq,
    Stosb,
}

impl Opcode {
    pub fn is_branch(self) -> bool {
        matches!(self, Opcode::Jmp | Opcode::Jcc(_))
    }
}

impl core::fmt::Display for Opcode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Opcode::Text => write!(f, "TEXT"),
            Opcode::Ret => write!(f, "RET"),
            Opcode::Jmp => write!(f, "JMP"),
            Opcode::Jcc(condition) => write!(f, "J{condition}"),
            Opcode::Call => write!(f, "CALL"),
            Opcode::Pushq => write!(f, "PUSHQ"),
            Opcode::Popq => write!(f, "POPQ"),
            Opcode::Mov(width) => write!(f, "MOV{width}"),
            Opcode::MovSignExtend { from, to } => write!(f, "MOV{from}{to}SX"),
            Opcode::MovZeroExtend { from, to } => write!(f, "MOV{from}{to}ZX"),
            Opcode::Leaq => write!(f, "LEAQ"),
            Opcode::Add(width) => write!(f, "ADD{width}"),
            Opcode::Sub(width) => write!(f, "SUB{width}"),
            Opcode::Imul(width) => write!(f, "IMUL{width}"),
            Opcode::And(width) => write!(f, "AND{width}"),
            Opcode::Or(width) => write!(f, "OR{width}"),
            Opcode::Xor(width) => write!(f, "XOR{width}"),
            Opcode::Neg(width) => write!(f, "NEG{width}"),
            Opcode::Not(width) => write!(f, "NOT{width}"),
            Opcode::Cmp(width) => write!(f, "CMP{width}"),
            Opcode::Idiv(width) => write!(f, "IDIV{width}"),
            Opcode::Div(width) => write!(f, "DIV{width}"),
            Opcode::Cdq => write!(f, "CDQ"),
            Opcode::Cqo => write!(f, "CQO"),
            Opcode::Shl(width) => write!(f, "SHL{width}"),
            Opcode::Shr(width) => write!(f, "SHR{width}"),
            Opcode::Sar(width) => write!(f, "SAR{width}"),
            Opcode::Cld => write!(f, "CLD"),
            Opcode::Rep => write!(f, "REP"),
            Opcode::Stosq => write!(f, "STOSQ"),
            Opcode::Stosb => write!(f, "STOSB"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MemoryBase {
    /// Incoming arguments, addressed upward from the caller's frame
    Frame,
    /// Locals, at negative offsets from the top of the frame
    Auto,
    /// Outgoing arguments, addressed from the hardware stack pointer
    Stack,
    /// A global symbol
    Static(InternedSymbol),
    Register(Register),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MemoryOperand {
    pub base: MemoryBase,
    pub offset: i64,
}

impl MemoryOperand {
    pub fn new(base: MemoryBase, offset: i64) -> Self {
        Self { base, offset }
    }

    pub fn offset_by(self, delta: i64) -> Self {
        Self {
            offset: self.offset + delta,
            ..self
        }
    }
}

impl core::fmt::Display for MemoryOperand {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.base {
            MemoryBase::Frame => write!(f, "{}(FP)", self.offset),
            MemoryBase::Auto | MemoryBase::Stack => write!(f, "{}(SP)", self.offset),
            MemoryBase::Static(symbol) if self.offset == 0 => write!(f, "{symbol}(SB)"),
            MemoryBase::Static(symbol) => write!(f, "{symbol}+{}(SB)", self.offset),
            MemoryBase::Register(register) => write!(f, "{}({register})", self.offset),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operand {
    Register(Register),
    Memory(MemoryOperand),
    Constant(i64),
    /// Branch target, None until the branch is patched
    Branch(Option<InstructionId>),
}

impl Operand {
    pub fn memory(base: MemoryBase, offset: i64) -> Self {
        Self::Memory(MemoryOperand::new(base, offset))
    }
}

impl core::fmt::Display for Operand {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Operand::Register(register) => write!(f, "{register}"),
            Operand::Memory(memory) => write!(f, "{memory}"),
            Operand::Constant(value) => write!(f, "${value}"),
            Operand::Branch(Some(target)) => write!(f, "{target}"),
            Operand::Branch(None) => write!(f, "?"),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Instruction {
    pub opcode: Opcode,
    pub from: Option<Operand>,
    pub to: Option<Operand>,
    pub line: u32,
}

impl Instruction {
    pub fn branch_target(&self) -> Option<InstructionId> {
        match self.to {
            Some(Operand::Branch(target)) => target,
            _ => None,
        }
    }
}

/// Packs the argument area width and the frame size into the TEXT
/// directive's constant, rounding both to the stack alignment
pub fn pack_frame_sizes(argument_width: i64, frame_size: i64) -> i64 {
    (align_to(argument_width, MAX_ROUND) << 32) | align_to(frame_size, MAX_ROUND)
}

/// Returns `(argument_width, frame_size)`
pub fn unpack_frame_sizes(packed: i64) -> (i64, i64) {
    (packed >> 32, packed & 0xffff_ffff)
}

/// The instructions of one function in emission order
#[derive(Debug, Clone, Default)]
pub struct Program {
    instructions: IndexVec<InstructionId, Instruction>,
}

impl Program {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn emit(
        &mut self,
        opcode: Opcode,
        from: Option<Operand>,
        to: Option<Operand>,
        line: u32,
    ) -> InstructionId {
        self.instructions.push(Instruction {
            opcode,
            from,
            to,
            line,
        })
    }

    /// The program point of the next instruction to be emitted
    pub fn pc(&self) -> InstructionId {
        self.instructions.next_index()
    }

    pub fn branch(
        &mut self,
        opcode: Opcode,
        target: Option<InstructionId>,
        line: u32,
    ) -> InstructionId {
        self.emit(opcode, None, Some(Operand::Branch(target)), line)
    }

    pub fn patch(&mut self, branch: InstructionId, target: InstructionId) {
        self.instructions[branch].to = Some(Operand::Branch(Some(target)));
    }

    pub fn set_operands(
        &mut self,
        instruction: InstructionId,
        from: Option<Operand>,
        to: Option<Operand>,
    ) {
        let instruction = &mut self.instructions[instruction];
        instruction.from = from;
        instruction.to = to;
    }

    pub fn get(&self, id: InstructionId) -> Option<&Instruction> {
        self.instructions.get(id)
    }

    pub fn len(&self) -> usize {
        self.instructions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.instructions.is_empty()
    }

    pub fn instructions(&self) -> &IndexVec<InstructionId, Instruction> {
        &self.instructions
    }

    pub fn into_instructions(self) -> IndexVec<InstructionId, Instruction> {
        self.instructions
    }

    /// Fails on the first branch that still has no target
    pub fn verify_resolved(&self) -> Result<()> {
        for (id, instruction) in self.instructions.enumerate() {
            if let Some(Operand::Branch(None)) = instruction.to {
                return Err(LoweringError::UnresolvedBranch(id.index()));
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::Index;

    #[test]
    fn frame_sizes_round_trip_through_text_constant() {
        let packed = pack_frame_sizes(20, 37);

        assert_eq!(packed, (24 << 32) | 40);
        assert_eq!(unpack_frame_sizes(packed), (24, 40));
    }

    #[test]
    fn unpatched_branches_are_detected() {
        let mut program = Program::new();

        let jump = program.branch(Opcode::Jmp, None, 1);
        program.emit(Opcode::Ret, None, None, 1);

        assert_eq!(
            program.verify_resolved(),
            Err(LoweringError::UnresolvedBranch(0))
        );

        let end = InstructionId::new(1);
        program.patch(jump, end);
        assert_eq!(program.verify_resolved(), Ok(()));
        assert_eq!(program.get(jump).and_then(|i| i.branch_target()), Some(end));
    }

    #[test]
    fn opcodes_use_assembler_mnemonics() {
        assert_eq!(Opcode::Jcc(Condition::AboveOrEqual).to_string(), "JCC");
        assert_eq!(
            Opcode::MovSignExtend {
                from: Width::B,
                to: Width::Q
            }
            .to_string(),
            "MOVBQSX"
        );
        assert_eq!(Opcode::Idiv(Width::L).to_string(), "IDIVL");
        assert_eq!(
            Operand::memory(MemoryBase::Static(InternedSymbol::new("newproc")), 0).to_string(),
            "newproc(SB)"
        );
    }
}
