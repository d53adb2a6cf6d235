//! Statement lowering.
//!
//! Control flow is laid out in a single pass. Jumps whose destination is not
//! known yet are emitted with an empty target and patched once the
//! destination is reached. The break target of a loop or switch is itself
//! such a placeholder jump, so `break` statements can be emitted before the
//! end of the construct is known.

use crate::{
    ast::{BinaryOperator, Literal, NodeId, NodeKind},
    backend::{
        context::{JumpTargets, LoweringContext},
        instruction::{InstructionId, MemoryBase, Opcode, Operand, Width},
    },
    diagnostics::{DiagnosticKind, LoweringError, Result, report_error},
    ty::{Type, TypeKind},
};

impl LoweringContext<'_> {
    pub fn lower_statement(&mut self, node: NodeId) -> Result<()> {
        self.line = self.ast[node].line;

        match self.ast[node].kind.clone() {
            NodeKind::List(statements) => {
                for statement in statements {
                    self.lower_statement(statement)?;
                }
            }
            NodeKind::Empty | NodeKind::Case(_) | NodeKind::Fallthrough => {}
            NodeKind::Label(name) => {
                let pc = self.pc();
                if let Err(kind) = self.labels.declare(name, pc, &mut self.program) {
                    report_error!(self, kind);
                }
            }
            NodeKind::Goto(name) => {
                self.labels.goto(name, &mut self.program, self.line);
            }
            NodeKind::Break => match self.break_target() {
                Some(target) => {
                    self.jump(Opcode::Jmp, Some(target));
                }
                None => report_error!(self, DiagnosticKind::BreakOutsideLoop),
            },
            NodeKind::Continue => match self.continue_target() {
                Some(target) => {
                    self.jump(Opcode::Jmp, Some(target));
                }
                None => report_error!(self, DiagnosticKind::ContinueOutsideLoop),
            },
            NodeKind::For {
                init,
                test,
                increment,
                body,
            } => self.lower_for(init, test, increment, body)?,
            NodeKind::If {
                init,
                test,
                then,
                otherwise,
            } => self.lower_if(init, test, then, otherwise)?,
            NodeKind::Switch {
                init,
                subject,
                body,
            } => self.lower_switch(init, subject, body)?,
            NodeKind::Assign { destination, value } => self.cgen_as(destination, value)?,
            NodeKind::CompoundAssign {
                operator,
                destination,
                value,
            } => self.cgen_asop(operator, destination, value)?,
            NodeKind::Call { .. } | NodeKind::MethodCall { .. } | NodeKind::InterfaceCall { .. } => {
                self.lower_call(node, false)?;
            }
            NodeKind::Spawn(call) => {
                self.lower_call(call, true)?;
            }
            NodeKind::Return(values) => self.cgen_ret(&values)?,
            NodeKind::Panic => self.genpanic()?,
            kind @ (NodeKind::Convert { .. }
            | NodeKind::Register(_)
            | NodeKind::Indirect { .. }
            | NodeKind::Literal(_)
            | NodeKind::Name(_)
            | NodeKind::Unary { .. }
            | NodeKind::Binary { .. }) => {
                return Err(LoweringError::UnsupportedStatement(kind.name()));
            }
        }

        Ok(())
    }

    fn lower_optional(&mut self, node: Option<NodeId>) -> Result<()> {
        match node {
            Some(node) => self.lower_statement(node),
            None => Ok(()),
        }
    }

    fn lower_for(
        &mut self,
        init: Option<NodeId>,
        test: Option<NodeId>,
        increment: Option<NodeId>,
        body: NodeId,
    ) -> Result<()> {
        self.lower_optional(init)?;

        let to_test = self.jump(Opcode::Jmp, None);
        let break_target = self.jump(Opcode::Jmp, None);
        let continue_target = self.pc();

        let targets = JumpTargets {
            break_target,
            continue_target: Some(continue_target),
        };

        self.with_jump_targets(targets, |ctx| {
            ctx.lower_optional(increment)?;

            let test_pc = ctx.pc();
            ctx.patch(to_test, test_pc);
            if let Some(test) = test {
                ctx.bgen(test, false, break_target)?;
            }

            ctx.lower_statement(body)?;
            ctx.jump(Opcode::Jmp, Some(continue_target));

            Ok(())
        })?;

        let done = self.pc();
        self.patch(break_target, done);

        Ok(())
    }

    fn lower_if(
        &mut self,
        init: Option<NodeId>,
        test: NodeId,
        then: NodeId,
        otherwise: Option<NodeId>,
    ) -> Result<()> {
        self.lower_optional(init)?;

        let to_test = self.jump(Opcode::Jmp, None);
        let to_else = self.jump(Opcode::Jmp, None);

        let test_pc = self.pc();
        self.patch(to_test, test_pc);
        self.bgen(test, false, to_else)?;
        self.lower_statement(then)?;
        let to_done = self.jump(Opcode::Jmp, None);

        let else_pc = self.pc();
        self.patch(to_else, else_pc);
        self.lower_optional(otherwise)?;

        let done = self.pc();
        self.patch(to_done, done);

        Ok(())
    }

    fn lower_switch(&mut self, init: Option<NodeId>, subject: Option<NodeId>, body: NodeId) -> Result<()> {
        self.lower_optional(init)?;

        let to_test = self.jump(Opcode::Jmp, None);
        let break_target = self.jump(Opcode::Jmp, None);

        let test_pc = self.pc();
        self.patch(to_test, test_pc);

        let targets = JumpTargets {
            break_target,
            continue_target: None,
        };

        self.with_jump_targets(targets, |ctx| ctx.swgen(subject, body, break_target))?;

        let done = self.pc();
        self.patch(break_target, done);

        Ok(())
    }

    /// Lays out the case bodies in source order, then the tests. Every case
    /// value is compared against the subject in turn and the first match
    /// wins.
    fn swgen(&mut self, subject: Option<NodeId>, body: NodeId, break_target: InstructionId) -> Result<()> {
        let to_tests = self.jump(Opcode::Jmp, None);

        let statements = match self.ast[body].kind.clone() {
            NodeKind::List(statements) => statements,
            _ => vec![body],
        };

        let mut cases: Vec<(NodeId, InstructionId)> = Vec::new();
        let mut default = None;
        let mut seen_case = false;
        let mut needs_break = false;

        for statement in statements {
            self.line = self.ast[statement].line;

            let NodeKind::Case(values) = self.ast[statement].kind.clone() else {
                if !seen_case {
                    report_error!(self, DiagnosticKind::UnreachableInSwitch);
                }

                self.lower_statement(statement)?;
                needs_break = !matches!(self.ast[statement].kind, NodeKind::Fallthrough);
                continue;
            };

            // a case with no statements runs on into the next one
            if needs_break {
                self.jump(Opcode::Jmp, Some(break_target));
                needs_break = false;
            }

            seen_case = true;

            let pc = self.pc();
            if values.is_empty() {
                default = Some(pc);
            }

            cases.extend(values.into_iter().map(|value| (value, pc)));
        }

        // the last case never runs on into the tests
        self.jump(Opcode::Jmp, Some(break_target));

        let tests_pc = self.pc();
        self.patch(to_tests, tests_pc);

        match subject {
            Some(subject) => {
                let ty = self.node_type(subject)?;
                let temporary = self.temporary(&ty)?;
                let memory = self.addressable_operand(temporary)?;
                self.cgen(subject, memory)?;

                for (value, target) in cases {
                    self.line = self.ast[value].line;
                    let test = self.synthesize(
                        NodeKind::Binary {
                            operator: BinaryOperator::Equals,
                            left: temporary,
                            right: value,
                        },
                        Some(Type::bool()),
                    );
                    self.bgen(test, true, target)?;
                }
            }
            None => {
                for (value, target) in cases {
                    self.line = self.ast[value].line;
                    self.bgen(value, true, target)?;
                }
            }
        }

        self.jump(Opcode::Jmp, Some(default.unwrap_or(break_target)));

        Ok(())
    }

    /// Assigns `value` to `destination`, or clears it when there is no value
    pub(crate) fn cgen_as(&mut self, destination: NodeId, value: Option<NodeId>) -> Result<()> {
        let ty = self.node_type(destination)?;

        let is_nil = value.is_some_and(|v| matches!(self.ast[v].kind, NodeKind::Literal(Literal::Nil)));
        let value = match value {
            Some(value) if !(is_nil && ty.is_fat()) => value,
            _ if ty.is_fat() => return self.clear_fat(destination, ty.size()),
            _ => {
                let zero = match &*ty {
                    TypeKind::Integer(_) | TypeKind::UnsignedInteger(_) => Literal::Int(0),
                    TypeKind::Float(_) => Literal::Float(0.0),
                    TypeKind::Bool => Literal::Bool(false),
                    TypeKind::Pointer(_) | TypeKind::Function(_) => Literal::Nil,
                    TypeKind::Interface(_) | TypeKind::Struct(_) | TypeKind::Array { .. } => {
                        return Err(LoweringError::UnsupportedType(ty.to_string()));
                    }
                };
                self.synthesize(NodeKind::Literal(zero), Some(ty.clone()))
            }
        };

        if self.ast[destination].addressable {
            let memory = self.addressable_operand(destination)?;
            return self.cgen(value, memory);
        }

        // the destination needs registers to address; a value that calls
        // has to be computed before any of them are live
        let staged = self.ast[value].is_unbounded()
            || (ty.is_fat() && self.ast[value].complexity > self.ast[destination].complexity);
        let value = if staged {
            let temporary = self.temporary(&ty)?;
            let memory = self.addressable_operand(temporary)?;
            self.cgen(value, memory)?;
            temporary
        } else {
            value
        };

        if self.ast[value].complexity > self.ast[destination].complexity {
            let computed = self.cgen_allocated(value, None)?;
            let (memory, address) = self.igen(destination)?;
            self.gmove(
                Operand::Register(computed.register()),
                &ty,
                Operand::Memory(memory),
                &ty,
            )?;
            self.free_optional(address)?;
            return self.free(computed);
        }

        let (memory, address) = self.igen(destination)?;
        self.cgen(value, Operand::Memory(memory))?;
        self.free_optional(address)
    }

    /// `destination op= value`
    fn cgen_asop(&mut self, operator: BinaryOperator, destination: NodeId, value: NodeId) -> Result<()> {
        let ty = self.node_type(destination)?;
        let value_ty = self.node_type(value)?;

        let value = if self.ast[destination].is_unbounded() && self.ast[value].is_unbounded() {
            let temporary = self.temporary(&value_ty)?;
            let memory = self.addressable_operand(temporary)?;
            self.cgen(value, memory)?;
            temporary
        } else {
            value
        };

        let value_first = self.ast[value].complexity > self.ast[destination].complexity;

        let (computed, memory, address) = if value_first {
            let computed = self.cgen_allocated(value, None)?;
            let (memory, address) = self.igen(destination)?;
            (computed, memory, address)
        } else {
            let (memory, address) = self.igen(destination)?;
            let computed = self.cgen_allocated(value, None)?;
            (computed, memory, address)
        };

        let left = match address {
            Some(ref address) => self.synthesize(
                NodeKind::Indirect {
                    register: address.register(),
                    offset: memory.offset,
                },
                Some(ty.clone()),
            ),
            None => destination,
        };
        let right = self.synthesize(NodeKind::Register(computed.register()), Some(value_ty));
        let combined = self.synthesize(
            NodeKind::Binary {
                operator,
                left,
                right,
            },
            Some(ty.clone()),
        );

        let result = self.cgen_allocated(combined, None)?;
        self.gmove(
            Operand::Register(result.register()),
            &ty,
            Operand::Memory(memory),
            &ty,
        )?;
        self.free(result)?;

        if value_first {
            self.free_optional(address)?;
            self.free(computed)
        } else {
            self.free(computed)?;
            self.free_optional(address)
        }
    }

    /// Zeroes `size` bytes at the address of `destination` with string stores
    fn clear_fat(&mut self, destination: NodeId, size: i64) -> Result<()> {
        if size <= 0 {
            return Ok(());
        }

        let (value, pointer, count) = (
            self.abi.fill_value,
            self.abi.fill_destination,
            self.abi.fill_count,
        );

        self.evacuate(&[value, pointer, count], |ctx| {
            let value_claim = ctx.registers.claim(value);
            let pointer_claim = ctx.registers.claim(pointer);
            let count_claim = ctx.registers.claim(count);

            ctx.agen(destination, pointer)?;
            ctx.mov(Width::Q, Operand::Constant(0), Operand::Register(value));
            ctx.emit_bare(Opcode::Cld);

            let words = size / 8;
            if words > 0 {
                ctx.mov(Width::Q, Operand::Constant(words), Operand::Register(count));
                ctx.emit_bare(Opcode::Rep);
                ctx.emit_bare(Opcode::Stosq);
            }

            let bytes = size % 8;
            if bytes > 0 {
                ctx.mov(Width::Q, Operand::Constant(bytes), Operand::Register(count));
                ctx.emit_bare(Opcode::Rep);
                ctx.emit_bare(Opcode::Stosb);
            }

            ctx.free(count_claim)?;
            ctx.free(pointer_claim)?;
            ctx.free(value_claim)
        })
    }

    /// Copies the returned values into the result slots, then returns
    fn cgen_ret(&mut self, values: &[NodeId]) -> Result<()> {
        if !values.is_empty() {
            let slots = self.signature.result_slots();
            if slots.len() != values.len() {
                return Err(LoweringError::ArgumentCountMismatch {
                    expected: slots.len(),
                    actual: values.len(),
                });
            }

            for (slot, value) in slots.iter().zip(values) {
                self.cgen(
                    *value,
                    Operand::memory(MemoryBase::Frame, slot.offset),
                )?;
            }
        }

        self.emit_bare(Opcode::Ret);
        Ok(())
    }

    /// Faults on purpose by storing through a small sentinel address
    fn genpanic(&mut self) -> Result<()> {
        let register = self.abi.panic_register;
        let sentinel = self.abi.panic_sentinel;

        self.evacuate(&[register], |ctx| {
            let claim = ctx.registers.claim(register);
            ctx.mov(Width::L, Operand::Constant(sentinel), Operand::Register(register));
            ctx.mov(
                Width::Q,
                Operand::Register(register),
                Operand::memory(MemoryBase::Register(register), 0),
            );
            ctx.free(claim)
        })
    }
}
