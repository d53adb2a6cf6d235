//! Code generation for expressions.
//!
//! `cgen` computes a value into a register or memory, `agen` computes an
//! address into a register, `igen` produces a memory operand for an lvalue
//! and `bgen` branches on a boolean. Operands are evaluated in Sethi-Ullman
//! order: the operand with the larger complexity number goes first so the
//! other one is computed with fewer registers live. When both operands may
//! call, the right one is staged in a temporary first since a call clobbers
//! every register.

use crate::{
    ast::{BinaryOperator, Literal, NodeId, NodeKind, UnaryOperator},
    backend::{
        context::LoweringContext,
        instruction::{Condition, InstructionId, MemoryBase, MemoryOperand, Opcode, Operand, Width},
        registers::{Allocation, Register},
    },
    diagnostics::{LoweringError, Result},
    ty::{Type, TypeKind},
};

/// Operand width for a scalar type
pub(crate) fn width_of(ty: &Type) -> Result<Width> {
    if ty.is_fat() {
        return Err(LoweringError::UnsupportedType(ty.to_string()));
    }

    Width::from_size(ty.size()).ok_or_else(|| LoweringError::UnsupportedType(ty.to_string()))
}

/// Multiplication, division and shifts of 8 and 16 bit values are carried
/// out at 32 bits
pub(crate) fn arithmetic_width(ty: &Type) -> Result<Width> {
    Ok(width_of(ty)?.max(Width::L))
}

fn unsupported(ty: &Type) -> LoweringError {
    LoweringError::UnsupportedType(ty.to_string())
}

fn comparison_condition(operator: BinaryOperator, signed: bool) -> Option<Condition> {
    let condition = match (operator, signed) {
        (BinaryOperator::Equals, _) => Condition::Equal,
        (BinaryOperator::NotEquals, _) => Condition::NotEqual,
        (BinaryOperator::LessThan, true) => Condition::Less,
        (BinaryOperator::LessThan, false) => Condition::Below,
        (BinaryOperator::LessThanOrEqual, true) => Condition::LessOrEqual,
        (BinaryOperator::LessThanOrEqual, false) => Condition::BelowOrEqual,
        (BinaryOperator::GreaterThan, true) => Condition::Greater,
        (BinaryOperator::GreaterThan, false) => Condition::Above,
        (BinaryOperator::GreaterThanOrEqual, true) => Condition::GreaterOrEqual,
        (BinaryOperator::GreaterThanOrEqual, false) => Condition::AboveOrEqual,
        _ => return None,
    };

    Some(condition)
}

impl LoweringContext<'_> {
    /// The operand naming an addressable node directly
    pub(crate) fn addressable_operand(&self, node: NodeId) -> Result<Operand> {
        let operand = match &self.ast[node].kind {
            NodeKind::Name(variable) => Operand::Memory(self.variable_memory(*variable)?),
            NodeKind::Literal(literal) => Operand::Constant(self.literal_bits(*literal, node)?),
            NodeKind::Register(register) => Operand::Register(*register),
            NodeKind::Indirect { register, offset } => {
                Operand::memory(MemoryBase::Register(*register), *offset)
            }
            kind => {
                return Err(LoweringError::UnexpectedNode {
                    context: "addressable operand",
                    found: kind.name(),
                });
            }
        };

        Ok(operand)
    }

    fn literal_bits(&self, literal: Literal, node: NodeId) -> Result<i64> {
        let bits = match literal {
            Literal::Int(value) => value,
            Literal::Bool(value) => value as i64,
            Literal::Nil => 0,
            Literal::Float(value) => match &*self.node_type(node)? {
                TypeKind::Float(crate::ty::FloatKind::F32) => (value as f32).to_bits() as i64,
                _ => value.to_bits() as i64,
            },
        };

        Ok(bits)
    }

    /// Width aware move between two locations. Narrowing keeps the low bytes
    /// and widening extends according to the source's signedness. Memory to
    /// memory moves go through a scratch register.
    pub(crate) fn gmove(
        &mut self,
        from: Operand,
        from_ty: &Type,
        to: Operand,
        to_ty: &Type,
    ) -> Result<()> {
        let from_width = width_of(from_ty)?;
        let to_width = width_of(to_ty)?;

        if from == to && from_width == to_width {
            return Ok(());
        }

        if let Operand::Constant(_) = from {
            self.mov(to_width, from, to);
            return Ok(());
        }

        if from_width >= to_width {
            if let (Operand::Memory(_), Operand::Memory(_)) = (from, to) {
                let scratch = self.allocate(None)?;
                let register = Operand::Register(scratch.register());
                self.mov(to_width, from, register);
                self.mov(to_width, register, to);
                return self.free(scratch);
            }

            self.mov(to_width, from, to);
            return Ok(());
        }

        let opcode = if from_ty.is_signed() {
            Opcode::MovSignExtend {
                from: from_width,
                to: to_width,
            }
        } else {
            Opcode::MovZeroExtend {
                from: from_width,
                to: to_width,
            }
        };

        if let Operand::Register(_) = to {
            self.emit(opcode, Some(from), Some(to));
            return Ok(());
        }

        let scratch = self.allocate(None)?;
        let register = Operand::Register(scratch.register());
        self.emit(opcode, Some(from), Some(register));
        self.mov(to_width, register, to);
        self.free(scratch)
    }

    /// Copies a multi-word value one word at a time, then byte by byte for
    /// whatever is left
    pub(crate) fn copy_fat(&mut self, from: MemoryOperand, to: MemoryOperand, size: i64) -> Result<()> {
        if from == to {
            return Ok(());
        }

        let scratch = self.allocate(None)?;
        let register = Operand::Register(scratch.register());

        let words = size / 8;
        for word in 0..words {
            self.mov(Width::Q, Operand::Memory(from.offset_by(word * 8)), register);
            self.mov(Width::Q, register, Operand::Memory(to.offset_by(word * 8)));
        }

        for byte in words * 8..size {
            self.mov(Width::B, Operand::Memory(from.offset_by(byte)), register);
            self.mov(Width::B, register, Operand::Memory(to.offset_by(byte)));
        }

        self.free(scratch)
    }

    /// Computes the value of `node` into `destination`
    pub(crate) fn cgen(&mut self, node: NodeId, destination: Operand) -> Result<()> {
        let ty = self.node_type(node)?;

        if ty.is_fat() {
            let Operand::Memory(destination) = destination else {
                return Err(LoweringError::InvalidOperand("multi-word value"));
            };

            return self.cgen_fat(node, destination, &ty);
        }

        if self.ast[node].addressable {
            let source = self.addressable_operand(node)?;
            return self.gmove(source, &ty, destination, &ty);
        }

        if let Operand::Register(register) = destination {
            return self.cgen_register(node, register);
        }

        let scratch = self.allocate(None)?;
        self.cgen_register(node, scratch.register())?;
        self.gmove(Operand::Register(scratch.register()), &ty, destination, &ty)?;
        self.free(scratch)
    }

    /// Computes `node` into a freshly allocated register
    pub(crate) fn cgen_allocated(&mut self, node: NodeId, hint: Option<Register>) -> Result<Allocation> {
        let allocation = self.allocate(hint)?;
        self.cgen(node, Operand::Register(allocation.register()))?;

        Ok(allocation)
    }

    /// Computes `node` into `register`, extending values narrower than 32 bits
    /// to the full 32 bits
    pub(crate) fn cgen_widened(&mut self, node: NodeId, register: Register) -> Result<()> {
        let ty = self.node_type(node)?;
        self.cgen(node, Operand::Register(register))?;

        let width = width_of(&ty)?;
        if width < Width::L {
            let extend = if ty.is_signed() {
                Opcode::MovSignExtend { from: width, to: Width::L }
            } else {
                Opcode::MovZeroExtend { from: width, to: Width::L }
            };
            self.emit(extend, Some(Operand::Register(register)), Some(Operand::Register(register)));
        }

        Ok(())
    }

    fn cgen_fat(&mut self, node: NodeId, destination: MemoryOperand, ty: &Type) -> Result<()> {
        match self.ast[node].kind.clone() {
            NodeKind::Name(_) | NodeKind::Indirect { .. } => {
                let Operand::Memory(source) = self.addressable_operand(node)? else {
                    return Err(LoweringError::InvalidOperand("multi-word value"));
                };
                self.copy_fat(source, destination, ty.size())
            }
            NodeKind::Literal(Literal::Nil) => {
                for word in 0..ty.size() / 8 {
                    self.mov(
                        Width::Q,
                        Operand::Constant(0),
                        Operand::Memory(destination.offset_by(word * 8)),
                    );
                }
                Ok(())
            }
            NodeKind::Unary {
                operator: UnaryOperator::Deref,
                ..
            } => {
                let (source, allocation) = self.igen(node)?;
                self.copy_fat(source, destination, ty.size())?;
                self.free_optional(allocation)
            }
            NodeKind::Call { .. } | NodeKind::MethodCall { .. } | NodeKind::InterfaceCall { .. } => {
                self.call_result(node, Operand::Memory(destination))
            }
            NodeKind::Convert { .. } => {
                let address = self.allocate(None)?;
                self.agen_conversion(node, address.register())?;
                self.copy_fat(
                    MemoryOperand::new(MemoryBase::Register(address.register()), 0),
                    destination,
                    ty.size(),
                )?;
                self.free(address)
            }
            _ => Err(unsupported(ty)),
        }
    }

    pub(crate) fn free_optional(&mut self, allocation: Option<Allocation>) -> Result<()> {
        match allocation {
            Some(allocation) => self.free(allocation),
            None => Ok(()),
        }
    }

    /// Computes a scalar `node` into `register`, which the caller holds
    pub(crate) fn cgen_register(&mut self, node: NodeId, register: Register) -> Result<()> {
        let ty = self.node_type(node)?;
        let target = Operand::Register(register);

        match self.ast[node].kind.clone() {
            NodeKind::Name(_)
            | NodeKind::Literal(_)
            | NodeKind::Register(_)
            | NodeKind::Indirect { .. } => {
                let source = self.addressable_operand(node)?;
                self.gmove(source, &ty, target, &ty)
            }
            NodeKind::Unary { operator, operand } => match operator {
                UnaryOperator::Negate | UnaryOperator::BitwiseNot => {
                    if ty.is_float() {
                        return Err(unsupported(&ty));
                    }

                    self.cgen(operand, target)?;
                    let width = width_of(&ty)?;
                    let opcode = match operator {
                        UnaryOperator::Negate => Opcode::Neg(width),
                        _ => Opcode::Not(width),
                    };
                    self.emit(opcode, None, Some(target));
                    Ok(())
                }
                UnaryOperator::LogicalNot => self.cgen_boolean(node, register),
                UnaryOperator::AddressOf => self.agen(operand, register),
                UnaryOperator::Deref => {
                    self.cgen(operand, target)?;
                    self.mov(
                        width_of(&ty)?,
                        Operand::memory(MemoryBase::Register(register), 0),
                        target,
                    );
                    Ok(())
                }
            },
            NodeKind::Binary {
                operator,
                left,
                right,
            } => match operator {
                _ if operator.is_comparison() || operator.is_logical() => {
                    self.cgen_boolean(node, register)
                }
                BinaryOperator::Divide | BinaryOperator::Modulus => {
                    self.cgen_div(operator, left, right, register)
                }
                BinaryOperator::ShiftLeft | BinaryOperator::ShiftRight => {
                    self.cgen_shift(operator, left, right, register)
                }
                _ => self.cgen_arithmetic(operator, left, right, register, &ty),
            },
            NodeKind::Call { .. } | NodeKind::MethodCall { .. } | NodeKind::InterfaceCall { .. } => {
                self.call_result(node, target)
            }
            NodeKind::Convert { .. } => {
                self.agen_conversion(node, register)?;
                self.mov(
                    width_of(&ty)?,
                    Operand::memory(MemoryBase::Register(register), 0),
                    target,
                );
                Ok(())
            }
            kind => Err(LoweringError::UnexpectedNode {
                context: "expression",
                found: kind.name(),
            }),
        }
    }

    fn cgen_arithmetic(
        &mut self,
        operator: BinaryOperator,
        left: NodeId,
        right: NodeId,
        register: Register,
        ty: &Type,
    ) -> Result<()> {
        if ty.is_float() {
            return Err(unsupported(ty));
        }

        let width = width_of(ty)?;
        let opcode = match operator {
            BinaryOperator::Add => Opcode::Add(width),
            BinaryOperator::Subtract => Opcode::Sub(width),
            BinaryOperator::Multiply => Opcode::Imul(arithmetic_width(ty)?),
            BinaryOperator::BitwiseAnd => Opcode::And(width),
            BinaryOperator::BitwiseOr => Opcode::Or(width),
            BinaryOperator::BitwiseXor => Opcode::Xor(width),
            _ => {
                return Err(LoweringError::UnexpectedNode {
                    context: "arithmetic",
                    found: "Binary",
                });
            }
        };

        // there is no byte or word form of two operand multiply, so the
        // right operand has to be in a register of full width
        let right_in_register = matches!(opcode, Opcode::Imul(_)) && width < Width::L;

        let right = if self.ast[left].is_unbounded() && self.ast[right].is_unbounded() {
            self.stabilize(right)?
        } else {
            right
        };

        let target = Operand::Register(register);

        if self.ast[left].complexity >= self.ast[right].complexity {
            self.cgen(left, target)?;

            if self.ast[right].addressable && !right_in_register {
                let operand = self.addressable_operand(right)?;
                self.emit(opcode, Some(operand), Some(target));
                return Ok(());
            }

            let scratch = self.cgen_allocated(right, None)?;
            self.emit(opcode, Some(Operand::Register(scratch.register())), Some(target));
            return self.free(scratch);
        }

        let scratch = self.cgen_allocated(right, None)?;
        self.cgen(left, target)?;
        self.emit(opcode, Some(Operand::Register(scratch.register())), Some(target));
        self.free(scratch)
    }

    /// Materializes a boolean expression as 1 or 0 in `register`
    fn cgen_boolean(&mut self, node: NodeId, register: Register) -> Result<()> {
        let target = Operand::Register(register);

        let to_test = self.jump(Opcode::Jmp, None);
        let set = self.pc();
        self.mov(Width::B, Operand::Constant(1), target);
        let to_end = self.jump(Opcode::Jmp, None);

        let test = self.pc();
        self.patch(to_test, test);
        self.bgen(node, true, set)?;
        self.mov(Width::B, Operand::Constant(0), target);

        let end = self.pc();
        self.patch(to_end, end);
        Ok(())
    }

    /// Computes the address of `node` into `register`
    pub(crate) fn agen(&mut self, node: NodeId, register: Register) -> Result<()> {
        let target = Operand::Register(register);

        match self.ast[node].kind.clone() {
            NodeKind::Name(variable) => {
                let memory = self.variable_memory(variable)?;
                self.emit(Opcode::Leaq, Some(Operand::Memory(memory)), Some(target));
                Ok(())
            }
            NodeKind::Indirect {
                register: base,
                offset,
            } => {
                self.emit(
                    Opcode::Leaq,
                    Some(Operand::memory(MemoryBase::Register(base), offset)),
                    Some(target),
                );
                Ok(())
            }
            NodeKind::Unary {
                operator: UnaryOperator::Deref,
                operand,
            } => self.cgen(operand, target),
            NodeKind::Call { .. } | NodeKind::MethodCall { .. } | NodeKind::InterfaceCall { .. } => {
                self.call_result_address(node, register)
            }
            NodeKind::Convert { .. } => self.agen_conversion(node, register),
            kind => Err(LoweringError::UnexpectedNode {
                context: "address",
                found: kind.name(),
            }),
        }
    }

    /// Memory operand for an lvalue, plus the register holding its address
    /// when one was needed
    pub(crate) fn igen(&mut self, node: NodeId) -> Result<(MemoryOperand, Option<Allocation>)> {
        match self.ast[node].kind.clone() {
            NodeKind::Name(_) | NodeKind::Indirect { .. } => match self.addressable_operand(node)? {
                Operand::Memory(memory) => Ok((memory, None)),
                _ => Err(LoweringError::InvalidOperand("lvalue")),
            },
            NodeKind::Unary {
                operator: UnaryOperator::Deref,
                operand,
            } => {
                let pointer = self.cgen_allocated(operand, None)?;
                let memory = MemoryOperand::new(MemoryBase::Register(pointer.register()), 0);
                Ok((memory, Some(pointer)))
            }
            kind => Err(LoweringError::UnexpectedNode {
                context: "lvalue",
                found: kind.name(),
            }),
        }
    }

    /// Jumps to `target` when `node` evaluates to `truth` and falls through
    /// otherwise
    pub(crate) fn bgen(&mut self, node: NodeId, truth: bool, target: InstructionId) -> Result<()> {
        match self.ast[node].kind.clone() {
            NodeKind::Literal(Literal::Bool(value)) => {
                if value == truth {
                    self.jump(Opcode::Jmp, Some(target));
                }
                Ok(())
            }
            NodeKind::Unary {
                operator: UnaryOperator::LogicalNot,
                operand,
            } => self.bgen(operand, !truth, target),
            NodeKind::Binary {
                operator: BinaryOperator::LogicalAnd,
                left,
                right,
            } if !truth => {
                self.bgen(left, false, target)?;
                self.bgen(right, false, target)
            }
            NodeKind::Binary {
                operator: BinaryOperator::LogicalOr,
                left,
                right,
            } if truth => {
                self.bgen(left, true, target)?;
                self.bgen(right, true, target)
            }
            NodeKind::Binary {
                operator: BinaryOperator::LogicalAnd | BinaryOperator::LogicalOr,
                left,
                right,
            } => {
                // a && b jumping on true, a || b jumping on false: both operands
                // must agree, so either one failing skips the jump
                let operand_truth = !truth;
                let to_tests = self.jump(Opcode::Jmp, None);
                let skip = self.jump(Opcode::Jmp, None);

                let tests = self.pc();
                self.patch(to_tests, tests);
                self.bgen(left, operand_truth, skip)?;
                self.bgen(right, operand_truth, skip)?;
                self.jump(Opcode::Jmp, Some(target));

                let end = self.pc();
                self.patch(skip, end);
                Ok(())
            }
            NodeKind::Binary {
                operator,
                left,
                right,
            } if operator.is_comparison() => self.compare(operator, left, right, truth, target),
            _ => {
                let ty = self.node_type(node)?;
                if !ty.is_bool() {
                    return Err(unsupported(&ty));
                }

                let condition = if truth {
                    Condition::NotEqual
                } else {
                    Condition::Equal
                };

                if self.ast[node].addressable {
                    let operand = self.addressable_operand(node)?;
                    self.emit(Opcode::Cmp(Width::B), Some(operand), Some(Operand::Constant(0)));
                    self.jump(Opcode::Jcc(condition), Some(target));
                    return Ok(());
                }

                let value = self.cgen_allocated(node, None)?;
                self.emit(
                    Opcode::Cmp(Width::B),
                    Some(Operand::Register(value.register())),
                    Some(Operand::Constant(0)),
                );
                self.jump(Opcode::Jcc(condition), Some(target));
                self.free(value)
            }
        }
    }

    fn compare(
        &mut self,
        operator: BinaryOperator,
        left: NodeId,
        right: NodeId,
        truth: bool,
        target: InstructionId,
    ) -> Result<()> {
        let ty = self.node_type(left)?;
        if ty.is_float() || ty.is_fat() {
            return Err(unsupported(&ty));
        }

        let width = width_of(&ty)?;
        let condition = comparison_condition(operator, ty.is_signed()).ok_or(
            LoweringError::UnexpectedNode {
                context: "comparison",
                found: "Binary",
            },
        )?;
        let condition = if truth { condition } else { condition.negate() };

        let right = if self.ast[left].is_unbounded() && self.ast[right].is_unbounded() {
            self.stabilize(right)?
        } else {
            right
        };

        if self.ast[left].complexity >= self.ast[right].complexity {
            let first = self.cgen_allocated(left, None)?;

            if self.ast[right].addressable {
                let operand = self.addressable_operand(right)?;
                self.emit(
                    Opcode::Cmp(width),
                    Some(Operand::Register(first.register())),
                    Some(operand),
                );
                self.jump(Opcode::Jcc(condition), Some(target));
                return self.free(first);
            }

            let second = self.cgen_allocated(right, None)?;
            self.emit(
                Opcode::Cmp(width),
                Some(Operand::Register(first.register())),
                Some(Operand::Register(second.register())),
            );
            self.jump(Opcode::Jcc(condition), Some(target));
            self.free(second)?;
            return self.free(first);
        }

        let second = self.cgen_allocated(right, None)?;
        let first = self.cgen_allocated(left, None)?;
        self.emit(
            Opcode::Cmp(width),
            Some(Operand::Register(first.register())),
            Some(Operand::Register(second.register())),
        );
        self.jump(Opcode::Jcc(condition), Some(target));
        self.free(first)?;
        self.free(second)
    }
}
