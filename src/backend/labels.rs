use hashbrown::HashMap;

use crate::{
    backend::instruction::{InstructionId, Opcode, Program},
    diagnostics::DiagnosticKind,
    intern::InternedSymbol,
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LabelState {
    /// Jumps emitted before the label was declared, waiting for its position
    Pending(Vec<InstructionId>),
    Resolved(InstructionId),
}

/// Goto labels of the function being lowered
#[derive(Debug, Clone, Default)]
pub struct LabelTable {
    labels: HashMap<InternedSymbol, LabelState>,
}

impl LabelTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Places `name` at program point `pc`, retargeting every jump already
    /// waiting for it. Returns how many jumps were patched.
    pub fn declare(
        &mut self,
        name: InternedSymbol,
        pc: InstructionId,
        program: &mut Program,
    ) -> Result<usize, DiagnosticKind> {
        let state = self
            .labels
            .entry(name)
            .or_insert_with(|| LabelState::Pending(Vec::new()));

        let pending = match state {
            LabelState::Resolved(_) => return Err(DiagnosticKind::LabelRedeclared(name)),
            LabelState::Pending(pending) => std::mem::take(pending),
        };

        for branch in &pending {
            program.patch(*branch, pc);
        }

        log::trace!("label {name} at {pc} resolves {} jumps", pending.len());
        *state = LabelState::Resolved(pc);

        Ok(pending.len())
    }

    /// Emits a jump to `name`, chaining it onto the label's pending jumps
    /// when the label has not been declared yet
    pub fn goto(&mut self, name: InternedSymbol, program: &mut Program, line: u32) -> InstructionId {
        match self.labels.get_mut(&name) {
            Some(LabelState::Resolved(target)) => program.branch(Opcode::Jmp, Some(*target), line),
            Some(LabelState::Pending(pending)) => {
                let branch = program.branch(Opcode::Jmp, None, line);
                pending.push(branch);
                branch
            }
            None => {
                let branch = program.branch(Opcode::Jmp, None, line);
                self.labels.insert(name, LabelState::Pending(vec![branch]));
                branch
            }
        }
    }

    pub fn state(&self, name: InternedSymbol) -> Option<&LabelState> {
        self.labels.get(&name)
    }

    /// Removes every label that still has pending jumps, in a stable order
    pub fn take_undefined(&mut self) -> Vec<(InternedSymbol, Vec<InstructionId>)> {
        let mut undefined = self
            .labels
            .iter_mut()
            .filter_map(|(name, state)| match state {
                LabelState::Pending(pending) if !pending.is_empty() => {
                    Some((*name, std::mem::take(pending)))
                }
                _ => None,
            })
            .collect::<Vec<_>>();

        undefined.sort_by_key(|(_, pending)| pending.first().copied());
        undefined
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::Index;

    #[test]
    fn forward_jumps_are_patched_on_declaration() {
        let mut program = Program::new();
        let mut labels = LabelTable::new();
        let name = InternedSymbol::new("retry");

        let first = labels.goto(name, &mut program, 1);
        let second = labels.goto(name, &mut program, 2);
        let target = program.pc();

        assert_eq!(labels.declare(name, target, &mut program), Ok(2));

        for branch in [first, second] {
            assert_eq!(
                program.get(branch).and_then(|i| i.branch_target()),
                Some(target)
            );
        }

        let backward = labels.goto(name, &mut program, 3);
        assert_eq!(
            program.get(backward).and_then(|i| i.branch_target()),
            Some(target)
        );
        assert_eq!(program.verify_resolved(), Ok(()));
    }

    #[test]
    fn redeclaration_keeps_the_first_position() {
        let mut program = Program::new();
        let mut labels = LabelTable::new();
        let name = InternedSymbol::new("again");

        labels.declare(name, InstructionId::new(0), &mut program).unwrap();

        assert_eq!(
            labels.declare(name, InstructionId::new(4), &mut program),
            Err(DiagnosticKind::LabelRedeclared(name))
        );
        assert_eq!(
            labels.state(name),
            Some(&LabelState::Resolved(InstructionId::new(0)))
        );
    }

    #[test]
    fn undeclared_labels_are_collected() {
        let mut program = Program::new();
        let mut labels = LabelTable::new();

        let missing = InternedSymbol::new("nowhere");
        let branch = labels.goto(missing, &mut program, 7);

        assert_eq!(labels.take_undefined(), vec![(missing, vec![branch])]);
        assert!(labels.take_undefined().is_empty());
    }
}
