use strum::{Display, EnumIter};

use crate::diagnostics::{LoweringError, Result};

/// General purpose register, named the way the Plan 9 assembler names it.
/// The same name covers every operand width; the opcode picks the width.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Display, EnumIter)]
#[strum(serialize_all = "UPPERCASE")]
pub enum Register {
    Ax,
    Cx,
    Dx,
    Bx,
    Sp,
    Bp,
    Si,
    Di,
    R8,
    R9,
    R10,
    R11,
    R12,
    R13,
    R14,
    R15,
}

pub const REGISTER_COUNT: usize = 16;

/// Registers handed out by [`RegisterFile::allocate`], most preferred first.
/// The registers with fixed roles in division, shifts and block stores come
/// last so they are rarely occupied when those instructions need them.
pub const ALLOCATION_ORDER: [Register; 14] = [
    Register::Bx,
    Register::Si,
    Register::Di,
    Register::R8,
    Register::R9,
    Register::R10,
    Register::R11,
    Register::R12,
    Register::R13,
    Register::R14,
    Register::R15,
    Register::Cx,
    Register::Dx,
    Register::Ax,
];

impl Register {
    pub fn index(self) -> usize {
        self as usize
    }

    pub fn is_allocatable(self) -> bool {
        !matches!(self, Register::Sp | Register::Bp)
    }
}

/// Proof that a register was acquired. It has to be handed back to
/// [`RegisterFile::free`], which checks that releases happen in reverse
/// order of acquisition.
#[must_use = "an allocated register has to be released with RegisterFile::free"]
#[derive(Debug, PartialEq, Eq)]
pub struct Allocation {
    register: Register,
}

impl Allocation {
    pub fn register(&self) -> Register {
        self.register
    }
}

/// Occupancy of the hardware registers within one function
#[derive(Debug, Clone, Default)]
pub struct RegisterFile {
    occupancy: [u32; REGISTER_COUNT],
    acquired: Vec<Register>,
}

impl RegisterFile {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_occupied(&self, register: Register) -> bool {
        self.occupancy[register.index()] > 0
    }

    /// Picks a register for a value. A usable hint is always honoured, even
    /// when it is already occupied, so a value can be computed directly into
    /// the register its consumer holds.
    pub fn allocate(&mut self, hint: Option<Register>) -> Result<Allocation> {
        let register = match hint {
            Some(register) if register.is_allocatable() => register,
            _ => ALLOCATION_ORDER
                .into_iter()
                .find(|r| !self.is_occupied(*r))
                .ok_or(LoweringError::RegistersExhausted)?,
        };

        Ok(self.claim(register))
    }

    /// Takes a specific register regardless of its current occupancy
    pub fn claim(&mut self, register: Register) -> Allocation {
        self.occupancy[register.index()] += 1;
        self.acquired.push(register);

        Allocation { register }
    }

    pub fn free(&mut self, allocation: Allocation) -> Result<()> {
        let Allocation { register } = allocation;

        match self.acquired.last() {
            Some(&last) if last == register => {}
            Some(&last) => {
                return Err(LoweringError::RegisterReleaseOrder {
                    freed: register,
                    expected: last,
                });
            }
            None => return Err(LoweringError::InvalidOperand("register release")),
        }

        self.acquired.pop();
        self.occupancy[register.index()] = self.occupancy[register.index()].saturating_sub(1);

        Ok(())
    }

    /// Marks a register free without touching the outstanding allocations,
    /// returning its previous occupancy for [`RegisterFile::reoccupy`]
    pub fn vacate(&mut self, register: Register) -> u32 {
        std::mem::take(&mut self.occupancy[register.index()])
    }

    pub fn reoccupy(&mut self, register: Register, occupancy: u32) {
        self.occupancy[register.index()] = occupancy;
    }

    pub fn ensure_released(&self) -> Result<()> {
        if self.acquired.is_empty() {
            return Ok(());
        }

        let leaked = self
            .acquired
            .iter()
            .map(|r| r.to_string())
            .collect::<Vec<_>>()
            .join(", ");

        Err(LoweringError::RegisterLeak(leaked))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fixed_role_registers_are_allocated_last() {
        let mut registers = RegisterFile::new();
        let mut allocations = Vec::new();

        for _ in 0..11 {
            allocations.push(registers.allocate(None).unwrap());
        }

        assert!(!registers.is_occupied(Register::Ax));
        assert!(!registers.is_occupied(Register::Cx));
        assert!(!registers.is_occupied(Register::Dx));

        let next = registers.allocate(None).unwrap();
        assert_eq!(next.register(), Register::Cx);

        registers.free(next).unwrap();
        while let Some(allocation) = allocations.pop() {
            registers.free(allocation).unwrap();
        }
        registers.ensure_released().unwrap();
    }

    #[test]
    fn exhaustion_is_an_error() {
        let mut registers = RegisterFile::new();
        let mut allocations = Vec::new();

        for _ in 0..ALLOCATION_ORDER.len() {
            allocations.push(registers.allocate(None).unwrap());
        }

        assert_eq!(
            registers.allocate(None),
            Err(LoweringError::RegistersExhausted)
        );
    }

    #[test]
    fn out_of_order_release_is_rejected() {
        let mut registers = RegisterFile::new();

        let first = registers.allocate(None).unwrap();
        let _second = registers.allocate(None).unwrap();

        assert_eq!(
            registers.free(first),
            Err(LoweringError::RegisterReleaseOrder {
                freed: Register::Bx,
                expected: Register::Si,
            })
        );
    }

    #[test]
    fn hints_are_shared() {
        let mut registers = RegisterFile::new();

        let outer = registers.claim(Register::Ax);
        let inner = registers.allocate(Some(Register::Ax)).unwrap();
        assert_eq!(inner.register(), Register::Ax);

        registers.free(inner).unwrap();
        assert!(registers.is_occupied(Register::Ax));
        registers.free(outer).unwrap();
        assert!(!registers.is_occupied(Register::Ax));
    }

    #[test]
    fn leaks_are_reported() {
        let mut registers = RegisterFile::new();
        let _held = registers.claim(Register::Dx);

        assert_eq!(
            registers.ensure_released(),
            Err(LoweringError::RegisterLeak("DX".to_string()))
        );
    }
}
