//! Conversions to and from interface values, lowered to runtime helper
//! calls.
//!
//! | helper     | arguments (word offsets)                  | result at |
//! |------------|-------------------------------------------|-----------|
//! | `ifaces2i` | target sig 0, source sig 1, value 3        | word 2    |
//! | `ifacei2i` | target sig 0, interface 1..2               | word 1    |
//! | `ifacei2s` | target sig 0, interface 1..2               | word 2    |
//!
//! An interface value is a method table pointer followed by a data word.
//! The first two helpers return a whole interface value, the last one only
//! the data word.

use crate::{
    ast::{ConversionKind, NodeId, NodeKind},
    backend::{
        context::LoweringContext,
        instruction::{MemoryBase, Opcode, Operand, Width},
        registers::Register,
    },
    diagnostics::{LoweringError, Result},
    ty::Type,
};

impl LoweringContext<'_> {
    /// Calls the conversion helper for `node` and leaves the address of its
    /// result in `register`
    pub(crate) fn agen_conversion(&mut self, node: NodeId, register: Register) -> Result<()> {
        let NodeKind::Convert { kind, value } = self.ast[node].kind else {
            return Err(LoweringError::UnexpectedNode {
                context: "interface conversion",
                found: self.ast[node].kind.name(),
            });
        };

        let target_ty = self.node_type(node)?;
        let source_ty = self.node_type(value)?;
        let word = self.abi.pointer_width;

        // interface values are copied into the argument area from memory
        let value = if self.ast[value].addressable {
            value
        } else if source_ty.is_fat() {
            self.stabilize_always(value, &source_ty)?
        } else {
            self.stabilize(value)?
        };

        let (helper, words, result) = match kind {
            ConversionKind::ConcreteToInterface => {
                if source_ty.is_fat() || source_ty.size() != word {
                    return Err(LoweringError::UnsupportedType(source_ty.to_string()));
                }

                self.cgen(value, Operand::Register(register))?;
                self.mov(
                    Width::Q,
                    Operand::Register(register),
                    Operand::memory(MemoryBase::Stack, 3 * word),
                );

                self.store_signature(&target_ty, register, 0)?;
                self.store_signature(&source_ty, register, word)?;

                (self.abi.concrete_to_interface, 4, 2 * word)
            }
            ConversionKind::InterfaceToInterface => {
                self.cgen(value, Operand::memory(MemoryBase::Stack, word))?;
                self.store_signature(&target_ty, register, 0)?;

                (self.abi.interface_to_interface, 3, word)
            }
            ConversionKind::InterfaceToConcrete => {
                if target_ty.is_fat() {
                    return Err(LoweringError::UnsupportedType(target_ty.to_string()));
                }

                self.cgen(value, Operand::memory(MemoryBase::Stack, word))?;
                self.store_signature(&target_ty, register, 0)?;

                (self.abi.interface_to_concrete, 3, 2 * word)
            }
        };

        self.frame.raise_outgoing(words * word);
        self.emit(
            Opcode::Call,
            None,
            Some(Operand::memory(MemoryBase::Static(helper), 0)),
        );
        self.emit(
            Opcode::Leaq,
            Some(Operand::memory(MemoryBase::Stack, result)),
            Some(Operand::Register(register)),
        );

        Ok(())
    }

    /// Stores the address of the runtime descriptor of `ty` into the
    /// outgoing slot at `offset`, using `register` as scratch
    fn store_signature(&mut self, ty: &Type, register: Register, offset: i64) -> Result<()> {
        self.emit(
            Opcode::Leaq,
            Some(Operand::memory(MemoryBase::Static(ty.signature_symbol()), 0)),
            Some(Operand::Register(register)),
        );
        self.mov(
            Width::Q,
            Operand::Register(register),
            Operand::memory(MemoryBase::Stack, offset),
        );

        Ok(())
    }

    /// Evaluates `node` into a new temporary regardless of its complexity
    fn stabilize_always(&mut self, node: NodeId, ty: &Type) -> Result<NodeId> {
        let temporary = self.temporary(ty)?;
        let memory = self.addressable_operand(temporary)?;
        self.cgen(node, memory)?;

        Ok(temporary)
    }
}
