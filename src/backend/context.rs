use crate::{
    ast::{FunctionAst, FunctionDefinition, NodeId, NodeKind, StorageClass, VariableId},
    backend::{
        frame::Frame,
        instruction::{InstructionId, MemoryBase, MemoryOperand, Opcode, Operand, Program, Width},
        labels::LabelTable,
        registers::{Allocation, Register, RegisterFile},
        target::{Target, TargetAbi},
    },
    diagnostics::{Diagnostics, LoweringError, Result},
    intern::InternedSymbol,
    ty::{FunctionSignature, Type, UIntKind},
};

/// Where `break` and `continue` jump inside the innermost loop or switch.
/// A switch only provides a break target.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct JumpTargets {
    pub break_target: InstructionId,
    pub continue_target: Option<InstructionId>,
}

/// Everything that changes while one function is being lowered
pub struct LoweringContext<'a> {
    pub(crate) function: &'a FunctionDefinition,
    pub(crate) signature: FunctionSignature,
    /// The function's tree plus any nodes synthesized during lowering
    pub(crate) ast: FunctionAst,
    pub(crate) abi: TargetAbi,
    pub(crate) program: Program,
    pub(crate) registers: RegisterFile,
    pub(crate) frame: Frame,
    pub(crate) labels: LabelTable,
    pub(crate) jump_targets: Vec<JumpTargets>,
    pub(crate) diagnostics: &'a mut Diagnostics,
    pub(crate) line: u32,
    text: InstructionId,
    temporaries: usize,
}

impl<'a> LoweringContext<'a> {
    /// Lays out the frame and emits the function header
    pub fn begin(
        function: &'a FunctionDefinition,
        target: Target,
        diagnostics: &'a mut Diagnostics,
    ) -> Result<Self> {
        let signature = function
            .ty
            .as_function()
            .cloned()
            .ok_or_else(|| LoweringError::NotCallable(function.ty.to_string()))?;

        let frame = Frame::layout(function)?;

        let mut program = Program::new();
        let text = program.emit(
            Opcode::Text,
            Some(Operand::memory(MemoryBase::Static(function.name), 0)),
            Some(Operand::Constant(0)),
            function.line,
        );

        Ok(Self {
            function,
            signature,
            ast: function.ast.clone(),
            abi: target.abi(),
            program,
            registers: RegisterFile::new(),
            frame,
            labels: LabelTable::new(),
            jump_targets: Vec::new(),
            diagnostics,
            line: function.line,
            text,
            temporaries: 0,
        })
    }

    pub(crate) fn text_instruction(&self) -> InstructionId {
        self.text
    }

    pub(crate) fn emit(
        &mut self,
        opcode: Opcode,
        from: Option<Operand>,
        to: Option<Operand>,
    ) -> InstructionId {
        self.program.emit(opcode, from, to, self.line)
    }

    pub(crate) fn emit_bare(&mut self, opcode: Opcode) -> InstructionId {
        self.emit(opcode, None, None)
    }

    pub(crate) fn mov(&mut self, width: Width, from: Operand, to: Operand) -> InstructionId {
        self.emit(Opcode::Mov(width), Some(from), Some(to))
    }

    pub(crate) fn jump(&mut self, opcode: Opcode, target: Option<InstructionId>) -> InstructionId {
        self.program.branch(opcode, target, self.line)
    }

    pub(crate) fn patch(&mut self, branch: InstructionId, target: InstructionId) {
        self.program.patch(branch, target);
    }

    pub(crate) fn pc(&self) -> InstructionId {
        self.program.pc()
    }

    pub(crate) fn allocate(&mut self, hint: Option<Register>) -> Result<Allocation> {
        self.registers.allocate(hint)
    }

    pub(crate) fn free(&mut self, allocation: Allocation) -> Result<()> {
        self.registers.free(allocation)
    }

    pub(crate) fn node_type(&self, node: NodeId) -> Result<Type> {
        self.ast[node]
            .ty
            .clone()
            .ok_or_else(|| LoweringError::UnexpectedNode {
                context: "expression",
                found: self.ast[node].kind.name(),
            })
    }

    /// Memory holding a named variable
    pub(crate) fn variable_memory(&self, variable: VariableId) -> Result<MemoryOperand> {
        let declared = &self.ast[variable];

        let base = match declared.class {
            StorageClass::External => return Ok(MemoryOperand::new(MemoryBase::Static(declared.name), 0)),
            StorageClass::Parameter => MemoryBase::Frame,
            StorageClass::Automatic => MemoryBase::Auto,
        };

        let offset = self
            .frame
            .offset_of(variable)
            .ok_or(LoweringError::MissingFrameSlot(declared.name))?;

        Ok(MemoryOperand::new(base, offset))
    }

    /// Allocates a fresh automatic of type `ty` and returns a name node for it
    pub(crate) fn temporary(&mut self, ty: &Type) -> Result<NodeId> {
        let name = format!("autotmp_{:04}", self.temporaries);
        self.temporaries += 1;

        let variable = self.ast.variable(&name, ty.clone(), StorageClass::Automatic);
        let size = ty.size();
        let offset = self.frame.allocate_automatic(size);
        self.frame.bind(
            variable,
            InternedSymbol::new(&name),
            StorageClass::Automatic,
            offset,
            size,
        );

        Ok(self.synthesize(NodeKind::Name(variable), Some(ty.clone())))
    }

    /// Appends a node created during lowering, attributed to the current line
    pub(crate) fn synthesize(&mut self, kind: NodeKind, ty: Option<Type>) -> NodeId {
        self.ast.at_line(self.line);
        self.ast.push(kind, ty)
    }

    /// Evaluates `node` into a temporary unless it is cheap to evaluate again
    /// later. Nodes that may call are always staged.
    pub(crate) fn stabilize(&mut self, node: NodeId) -> Result<NodeId> {
        if !self.ast[node].is_unbounded() {
            return Ok(node);
        }

        self.evaluate_into_temporary(node)
    }

    /// Evaluates `node` into a temporary if it reads any of `registers`, so
    /// the value survives those registers being handed to another use
    pub(crate) fn isolate(&mut self, node: NodeId, registers: &[Register]) -> Result<NodeId> {
        if !registers.iter().any(|r| self.ast.reads_register(node, *r)) {
            return Ok(node);
        }

        log::trace!("copying node {node:?} out of {registers:?}");
        self.evaluate_into_temporary(node)
    }

    fn evaluate_into_temporary(&mut self, node: NodeId) -> Result<NodeId> {
        let ty = self.node_type(node)?;
        let temporary = self.temporary(&ty)?;
        let memory = self.addressable_operand(temporary)?;
        self.cgen(node, memory)?;

        Ok(temporary)
    }

    /// Runs `inner` with each occupied register in `registers` moved to a
    /// frame slot and marked free, then moves the values back. The
    /// occupancy is restored even when `inner` fails.
    pub(crate) fn evacuate<T>(
        &mut self,
        registers: &[Register],
        inner: impl FnOnce(&mut Self) -> Result<T>,
    ) -> Result<T> {
        let mut saved = Vec::new();

        for &register in registers {
            if !self.registers.is_occupied(register) {
                continue;
            }

            let slot = self.frame.allocate_automatic(self.abi.pointer_width);
            let spill = Operand::memory(MemoryBase::Auto, slot);
            log::trace!("spilling {register} to {spill}");

            self.mov(Width::Q, Operand::Register(register), spill);
            let occupancy = self.registers.vacate(register);
            saved.push((register, spill, occupancy));
        }

        let result = inner(self);

        for (register, spill, occupancy) in saved.into_iter().rev() {
            self.registers.reoccupy(register, occupancy);
            self.mov(Width::Q, spill, Operand::Register(register));
        }

        result
    }

    /// Runs `inner` with `targets` as the innermost break and continue
    /// destinations
    pub(crate) fn with_jump_targets<T>(
        &mut self,
        targets: JumpTargets,
        inner: impl FnOnce(&mut Self) -> Result<T>,
    ) -> Result<T> {
        self.jump_targets.push(targets);
        let result = inner(self);
        self.jump_targets.pop();

        result
    }

    pub(crate) fn break_target(&self) -> Option<InstructionId> {
        self.jump_targets.last().map(|targets| targets.break_target)
    }

    pub(crate) fn continue_target(&self) -> Option<InstructionId> {
        self.jump_targets
            .iter()
            .rev()
            .find_map(|targets| targets.continue_target)
    }

    pub(crate) fn word_type(&self) -> Type {
        Type::uint(UIntKind::U64)
    }
}
