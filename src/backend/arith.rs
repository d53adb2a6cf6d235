//! Division and variable shifts, whose operands live in fixed registers.
//!
//! The dividend sits in AX with its high half in DX, and the quotient and
//! remainder come back in those same registers. A variable shift count has to
//! be in CX. When one of these registers already holds a live value that is
//! not the destination, the value is moved to a frame slot for the duration
//! and put back afterwards.

use crate::{
    ast::{BinaryOperator, Literal, NodeId, NodeKind},
    backend::{
        context::LoweringContext,
        expr::arithmetic_width,
        instruction::{Opcode, Operand, Width},
        registers::Register,
    },
    diagnostics::{LoweringError, Result},
};

impl LoweringContext<'_> {
    /// Computes `left / right` or `left % right` into `destination`
    pub(crate) fn cgen_div(
        &mut self,
        operator: BinaryOperator,
        left: NodeId,
        right: NodeId,
        destination: Register,
    ) -> Result<()> {
        let ty = self.node_type(left)?;
        if !ty.is_integer_like() {
            return Err(LoweringError::UnsupportedType(ty.to_string()));
        }

        // anything that calls has to run before the fixed registers are taken
        let left = self.stabilize(left)?;
        let right = self.stabilize(right)?;

        let (dividend, remainder) = (self.abi.dividend, self.abi.remainder);
        let live = [dividend, remainder]
            .into_iter()
            .filter(|r| self.registers.is_occupied(*r))
            .collect::<Vec<_>>();

        // operands naming a live fixed register are read before it is reassigned
        let left = self.isolate(left, &live)?;
        let right = self.isolate(right, &live)?;

        let occupied = live
            .into_iter()
            .filter(|r| *r != destination)
            .collect::<Vec<_>>();

        self.evacuate(&occupied, |ctx| {
            let width = arithmetic_width(&ty)?;
            let signed = ty.is_signed();

            let quotient = ctx.registers.claim(dividend);
            let high = ctx.registers.claim(remainder);
            let divisor = ctx.allocate(None)?;

            if ctx.ast[left].complexity >= ctx.ast[right].complexity {
                ctx.cgen_widened(left, dividend)?;
                ctx.cgen_widened(right, divisor.register())?;
            } else {
                ctx.cgen_widened(right, divisor.register())?;
                ctx.cgen_widened(left, dividend)?;
            }

            if signed {
                ctx.emit_bare(match width {
                    Width::Q => Opcode::Cqo,
                    _ => Opcode::Cdq,
                });
            } else {
                ctx.mov(width, Operand::Constant(0), Operand::Register(remainder));
            }

            let divide = if signed {
                Opcode::Idiv(width)
            } else {
                Opcode::Div(width)
            };
            ctx.emit(divide, Some(Operand::Register(divisor.register())), None);
            ctx.free(divisor)?;

            let result = match operator {
                BinaryOperator::Divide => dividend,
                _ => remainder,
            };
            if result != destination {
                ctx.mov(Width::Q, Operand::Register(result), Operand::Register(destination));
            }

            ctx.free(high)?;
            ctx.free(quotient)
        })
    }

    /// Computes `left << right` or `left >> right` into `destination`. Right
    /// shifts are arithmetic for signed values and logical otherwise.
    pub(crate) fn cgen_shift(
        &mut self,
        operator: BinaryOperator,
        left: NodeId,
        right: NodeId,
        destination: Register,
    ) -> Result<()> {
        let ty = self.node_type(left)?;
        if !ty.is_integer_like() {
            return Err(LoweringError::UnsupportedType(ty.to_string()));
        }

        let width = arithmetic_width(&ty)?;
        let opcode = match (operator, ty.is_signed()) {
            (BinaryOperator::ShiftLeft, _) => Opcode::Shl(width),
            (_, true) => Opcode::Sar(width),
            (_, false) => Opcode::Shr(width),
        };

        if let NodeKind::Literal(Literal::Int(count)) = self.ast[right].kind {
            self.cgen_widened(left, destination)?;
            self.emit(
                opcode,
                Some(Operand::Constant(count)),
                Some(Operand::Register(destination)),
            );
            return Ok(());
        }

        let left = self.stabilize(left)?;
        let right = self.stabilize(right)?;

        let count_register = self.abi.shift_count;
        let live = [count_register]
            .into_iter()
            .filter(|r| self.registers.is_occupied(*r))
            .collect::<Vec<_>>();

        let left = self.isolate(left, &live)?;
        let right = self.isolate(right, &live)?;

        let occupied = live
            .into_iter()
            .filter(|r| *r != destination)
            .collect::<Vec<_>>();

        self.evacuate(&occupied, |ctx| {
            let count = ctx.registers.claim(count_register);
            let hint = (destination != count_register).then_some(destination);
            let value = ctx.allocate(hint)?;

            if ctx.ast[left].complexity >= ctx.ast[right].complexity {
                ctx.cgen_widened(left, value.register())?;
                ctx.cgen(right, Operand::Register(count_register))?;
            } else {
                ctx.cgen(right, Operand::Register(count_register))?;
                ctx.cgen_widened(left, value.register())?;
            }

            ctx.emit(
                opcode,
                Some(Operand::Register(count_register)),
                Some(Operand::Register(value.register())),
            );

            if value.register() != destination {
                ctx.mov(
                    Width::Q,
                    Operand::Register(value.register()),
                    Operand::Register(destination),
                );
            }

            ctx.free(value)?;
            ctx.free(count)
        })
    }
}
