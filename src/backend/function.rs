//! Compiling one function definition from start to finish.

use crate::{
    ast::FunctionDefinition,
    backend::{
        context::LoweringContext,
        frame::Frame,
        instruction::{Instruction, InstructionId, MemoryBase, Opcode, Operand, pack_frame_sizes},
        target::Target,
    },
    diagnostics::{DiagnosticKind, Diagnostics, Result, report_error},
    index::IndexVec,
    intern::InternedSymbol,
    ty::{FunctionSignature, MAX_ROUND, align_to},
};

/// The instruction stream of a compiled function along with its final frame
#[derive(Debug, Clone)]
pub struct CompiledFunction {
    pub name: InternedSymbol,
    pub signature: FunctionSignature,
    pub instructions: IndexVec<InstructionId, Instruction>,
    pub argument_width: i64,
    /// Rounded to the stack alignment
    pub frame_size: i64,
    pub frame: Frame,
}

/// Lowers `function` for `target`. Functions without a body produce no code.
///
/// Recoverable problems in the source (misplaced `break`, duplicate labels
/// and so on) are added to `diagnostics` and lowering carries on. Anything
/// that leaves the output unusable is returned as an error.
pub fn compile_function(
    function: &FunctionDefinition,
    target: Target,
    diagnostics: &mut Diagnostics,
) -> Result<Option<CompiledFunction>> {
    let Some(body) = function.body else {
        log::debug!("{} has no body, nothing to compile", function.name);
        return Ok(None);
    };

    let mut ctx = LoweringContext::begin(function, target, diagnostics)?;
    ctx.lower_statement(body)?;

    ctx.finish().map(Some)
}

impl LoweringContext<'_> {
    pub(crate) fn finish(mut self) -> Result<CompiledFunction> {
        // jumps to labels that never showed up land on the final return
        let ret = self.pc();
        for (name, pending) in self.labels.take_undefined() {
            report_error!(self, DiagnosticKind::LabelNotDefined(name));
            for branch in pending {
                self.patch(branch, ret);
            }
        }

        self.emit_bare(Opcode::Ret);

        self.registers.ensure_released()?;
        self.program.verify_resolved()?;

        let argument_width = self.frame.argument_width();
        let frame_size = align_to(self.frame.frame_size(), MAX_ROUND);

        let text = self.text_instruction();
        self.program.set_operands(
            text,
            Some(Operand::memory(MemoryBase::Static(self.function.name), 0)),
            Some(Operand::Constant(pack_frame_sizes(argument_width, frame_size))),
        );

        log::debug!(
            "compiled {}: {} instructions, frame {frame_size}, arguments {argument_width}",
            self.function.name,
            self.program.len()
        );

        Ok(CompiledFunction {
            name: self.function.name,
            signature: self.signature,
            instructions: self.program.into_instructions(),
            argument_width,
            frame_size,
            frame: self.frame,
        })
    }
}
