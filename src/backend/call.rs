//! Calls: direct, through a function pointer, methods, interface methods
//! and spawned calls.
//!
//! Arguments are stored into the outgoing argument area at the bottom of the
//! frame, where the callee finds them as its incoming arguments. Results come
//! back in the same area, just above the arguments.

use crate::{
    ast::{NodeId, NodeKind, StorageClass},
    backend::{
        context::LoweringContext,
        instruction::{MemoryBase, MemoryOperand, Opcode, Operand, Width},
        registers::{Allocation, Register},
    },
    diagnostics::{LoweringError, Result},
    intern::InternedSymbol,
    ty::{FunctionSignature, Slot, TypeKind},
};

enum CallTarget {
    Symbol(MemoryOperand),
    Register(Allocation),
}

impl LoweringContext<'_> {
    /// Lowers any call node, returning the signature of the callee so the
    /// caller can locate its results
    pub(crate) fn lower_call(&mut self, node: NodeId, spawn: bool) -> Result<FunctionSignature> {
        self.line = self.ast[node].line;

        match self.ast[node].kind.clone() {
            NodeKind::Call { callee, arguments } => self.cgen_call(callee, &arguments, spawn),
            NodeKind::MethodCall {
                function,
                receiver,
                arguments,
            } => {
                let declared = &self.ast[function];
                if declared.class != StorageClass::External {
                    return Err(LoweringError::StorageClassMismatch {
                        name: declared.name,
                        expected: StorageClass::External.into(),
                        actual: declared.class.into(),
                    });
                }

                // (receiver.method)(arguments) becomes method(receiver, arguments)
                let ty = declared.ty.clone();
                let callee = self.synthesize(NodeKind::Name(function), Some(ty));
                let arguments = std::iter::once(receiver).chain(arguments).collect::<Vec<_>>();

                self.cgen_call(callee, &arguments, spawn)
            }
            NodeKind::InterfaceCall {
                receiver,
                method,
                arguments,
            } => self.cgen_callinter(receiver, method, &arguments, spawn),
            kind => Err(LoweringError::UnexpectedNode {
                context: "call",
                found: kind.name(),
            }),
        }
    }

    fn callee_signature(&self, callee: NodeId) -> Result<(FunctionSignature, bool)> {
        let ty = self.node_type(callee)?;

        match &*ty {
            TypeKind::Function(signature) => Ok((signature.clone(), false)),
            TypeKind::Pointer(pointee) => match &**pointee {
                TypeKind::Function(signature) => Ok((signature.clone(), true)),
                _ => Err(LoweringError::NotCallable(ty.to_string())),
            },
            _ => Err(LoweringError::NotCallable(ty.to_string())),
        }
    }

    fn cgen_call(
        &mut self,
        callee: NodeId,
        arguments: &[NodeId],
        spawn: bool,
    ) -> Result<FunctionSignature> {
        let (signature, through_pointer) = self.callee_signature(callee)?;

        // a callee that itself calls is computed before the arguments are
        // stored, since its call would overwrite them
        let staged_callee = if self.ast[callee].is_unbounded() {
            let word = self.word_type();
            let temporary = self.temporary(&word)?;
            let memory = self.addressable_operand(temporary)?;

            if through_pointer {
                self.cgen(callee, memory)?;
            } else {
                let address = self.allocate(None)?;
                self.agen(callee, address.register())?;
                self.mov(Width::Q, Operand::Register(address.register()), memory);
                self.free(address)?;
            }

            Some(memory)
        } else {
            None
        };

        self.store_arguments(&signature.input_slots(), arguments)?;
        self.frame.raise_outgoing(signature.argument_width());

        let symbol = match self.ast[callee].kind {
            NodeKind::Name(variable) if self.ast[variable].class == StorageClass::External => {
                Some(self.ast[variable].name)
            }
            _ => None,
        };

        let target = match (staged_callee, symbol) {
            (Some(memory), _) => {
                let register = self.allocate(None)?;
                self.mov(Width::Q, memory, Operand::Register(register.register()));
                CallTarget::Register(register)
            }
            (None, _) if through_pointer => {
                let register = self.cgen_allocated(callee, None)?;
                CallTarget::Register(register)
            }
            (None, Some(symbol)) => {
                CallTarget::Symbol(MemoryOperand::new(MemoryBase::Static(symbol), 0))
            }
            (None, None) => {
                let register = self.allocate(None)?;
                self.agen(callee, register.register())?;
                CallTarget::Register(register)
            }
        };

        self.ginscall(target, &signature, spawn)?;

        Ok(signature)
    }

    /// Calls through an interface value: the receiver's data word becomes
    /// the first argument and the function pointer comes from the method
    /// table at the method's declared position
    fn cgen_callinter(
        &mut self,
        receiver: NodeId,
        method: InternedSymbol,
        arguments: &[NodeId],
        spawn: bool,
    ) -> Result<FunctionSignature> {
        let receiver_ty = self.node_type(receiver)?;
        let interface = receiver_ty.as_interface().ok_or_else(|| LoweringError::UnexpectedNode {
            context: "interface call receiver",
            found: self.ast[receiver].kind.name(),
        })?;
        let (index, declared) = interface.method(method).ok_or(
            LoweringError::UnknownInterfaceMethod {
                interface: interface.name,
                method,
            },
        )?;
        let signature = declared.signature.clone();

        let receiver = if self.ast[receiver].addressable {
            receiver
        } else {
            let temporary = self.temporary(&receiver_ty)?;
            let memory = self.addressable_operand(temporary)?;
            self.cgen(receiver, memory)?;
            temporary
        };

        let slots = signature.input_slots();
        let Some((receiver_slot, argument_slots)) = slots.split_first() else {
            return Err(LoweringError::ArgumentCountMismatch {
                expected: 1,
                actual: 0,
            });
        };

        self.store_arguments(argument_slots, arguments)?;

        let table = self.allocate(None)?;
        let register = table.register();
        let pointer_width = self.abi.pointer_width;

        // register = &receiver
        self.agen(receiver, register)?;

        // receiver slot = receiver.data
        let word = self.word_type();
        self.gmove(
            Operand::memory(MemoryBase::Register(register), pointer_width),
            &word,
            Operand::memory(MemoryBase::Stack, receiver_slot.offset),
            &word,
        )?;

        // register = receiver.table
        self.mov(
            Width::Q,
            Operand::memory(MemoryBase::Register(register), 0),
            Operand::Register(register),
        );

        // register = receiver.table.functions[index]
        self.mov(
            Width::Q,
            Operand::memory(MemoryBase::Register(register), self.abi.method_offset(index)),
            Operand::Register(register),
        );

        self.ginscall(CallTarget::Register(table), &signature, spawn)?;
        self.frame.raise_outgoing(signature.argument_width());

        Ok(signature)
    }

    /// Stores each argument into its outgoing slot. Arguments that call are
    /// all evaluated into temporaries before the first slot is written.
    fn store_arguments(&mut self, slots: &[Slot], arguments: &[NodeId]) -> Result<()> {
        if slots.len() != arguments.len() {
            return Err(LoweringError::ArgumentCountMismatch {
                expected: slots.len(),
                actual: arguments.len(),
            });
        }

        let staged = arguments
            .iter()
            .map(|argument| self.stabilize(*argument))
            .collect::<Result<Vec<_>>>()?;

        for (slot, argument) in slots.iter().zip(staged) {
            self.cgen(argument, Operand::memory(MemoryBase::Stack, slot.offset))?;
        }

        Ok(())
    }

    /// Emits the call itself. A spawned call pushes the target and the size
    /// of its arguments and hands both to the runtime's spawn entry point.
    fn ginscall(&mut self, target: CallTarget, signature: &FunctionSignature, spawn: bool) -> Result<()> {
        if !spawn {
            return match target {
                CallTarget::Symbol(symbol) => {
                    self.emit(Opcode::Call, None, Some(Operand::Memory(symbol)));
                    Ok(())
                }
                CallTarget::Register(register) => {
                    self.emit(Opcode::Call, None, Some(Operand::Register(register.register())));
                    self.free(register)
                }
            };
        }

        let register = match target {
            CallTarget::Symbol(symbol) => {
                let register = self.allocate(None)?;
                self.emit(
                    Opcode::Leaq,
                    Some(Operand::Memory(symbol)),
                    Some(Operand::Register(register.register())),
                );
                register
            }
            CallTarget::Register(register) => register,
        };

        let scratch = Operand::Register(register.register());
        self.emit(Opcode::Pushq, Some(scratch), None);
        self.emit(
            Opcode::Pushq,
            Some(Operand::Constant(signature.argument_width())),
            None,
        );
        self.emit(
            Opcode::Call,
            None,
            Some(Operand::memory(MemoryBase::Static(self.abi.spawn_helper), 0)),
        );
        self.emit(Opcode::Popq, None, Some(scratch));
        self.emit(Opcode::Popq, None, Some(scratch));

        self.free(register)
    }

    fn first_result(signature: &FunctionSignature) -> Result<Slot> {
        signature
            .result_slots()
            .into_iter()
            .next()
            .ok_or(LoweringError::UnexpectedNode {
                context: "call result",
                found: "call without results",
            })
    }

    /// Lowers a call and moves its first result into `destination`
    pub(crate) fn call_result(&mut self, node: NodeId, destination: Operand) -> Result<()> {
        let signature = self.lower_call(node, false)?;
        let result = Self::first_result(&signature)?;
        let source = MemoryOperand::new(MemoryBase::Stack, result.offset);

        if result.ty.is_fat() {
            let Operand::Memory(destination) = destination else {
                return Err(LoweringError::InvalidOperand("multi-word value"));
            };
            return self.copy_fat(source, destination, result.ty.size());
        }

        let ty = self.node_type(node)?;
        self.gmove(Operand::Memory(source), &result.ty, destination, &ty)
    }

    /// Lowers a call and leaves the address of its first result in `register`
    pub(crate) fn call_result_address(
        &mut self,
        node: NodeId,
        register: Register,
    ) -> Result<()> {
        let signature = self.lower_call(node, false)?;
        let result = Self::first_result(&signature)?;

        self.emit(
            Opcode::Leaq,
            Some(Operand::memory(MemoryBase::Stack, result.offset)),
            Some(Operand::Register(register)),
        );

        Ok(())
    }
}
