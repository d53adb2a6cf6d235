use colored::Colorize;
use itertools::Itertools;

use crate::{
    backend::{
        function::CompiledFunction,
        instruction::{Instruction, Opcode, Operand},
    },
    index::Index,
};

impl core::fmt::Display for Instruction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mnemonic = match self.opcode {
            Opcode::Text => self.opcode.to_string().magenta(),
            opcode if opcode.is_branch() || matches!(opcode, Opcode::Call | Opcode::Ret) => {
                self.opcode.to_string().cyan()
            }
            _ => self.opcode.to_string().white(),
        };

        let operands = [self.from, self.to]
            .into_iter()
            .flatten()
            .map(|operand| match operand {
                Operand::Register(_) => operand.to_string().blue().to_string(),
                Operand::Branch(_) => operand.to_string().bright_red().to_string(),
                Operand::Constant(_) => operand.to_string().yellow().to_string(),
                Operand::Memory(_) => operand.to_string(),
            })
            .join(", ");

        if operands.is_empty() {
            write!(f, "{mnemonic}")
        } else {
            write!(f, "{mnemonic} {operands}")
        }
    }
}

impl core::fmt::Display for CompiledFunction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(
            f,
            "{} {} {}",
            self.name.value().blue(),
            self.signature.to_string().white(),
            format!("[frame {}, arguments {}]", self.frame_size, self.argument_width).dimmed()
        )?;

        let width = self.instructions.len().to_string().len();

        for (id, instruction) in self.instructions.enumerate() {
            writeln!(
                f,
                "{} {} {instruction}",
                format!("{:>width$}", id.index()).dimmed(),
                format!("({:>4})", instruction.line).dimmed(),
            )?;
        }

        Ok(())
    }
}

impl CompiledFunction {
    /// The instruction listing without colors or line numbers, one
    /// instruction per line prefixed with its index
    pub fn listing(&self) -> String {
        self.instructions
            .enumerate()
            .map(|(id, instruction)| {
                format!(
                    "{} {}",
                    id.index(),
                    strip_ansi_escapes::strip_str(instruction.to_string())
                )
            })
            .join("\n")
    }
}
