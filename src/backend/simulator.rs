//! A small interpreter for compiled functions, used by the tests to check
//! what the generated code computes rather than only how it reads.
//!
//! Memory is one flat byte array. Addresses below [`UNMAPPED_LIMIT`] are
//! never mapped, so stores through small sentinel addresses fault. Global
//! symbols get a data block on first use and functions get a code address
//! that `CALL` through a register can resolve.

use hashbrown::HashMap;
use thiserror::Error;

use crate::{
    backend::{
        function::CompiledFunction,
        instruction::{
            Condition, InstructionId, MemoryBase, MemoryOperand, Opcode, Operand, Width,
            unpack_frame_sizes,
        },
        registers::{REGISTER_COUNT, Register},
    },
    index::Index,
    intern::InternedSymbol,
};

const MEMORY_SIZE: usize = 1 << 20;
const UNMAPPED_LIMIT: u64 = 0x1000;
const STATIC_BASE: u64 = 0x2000;
const STATIC_BLOCK: u64 = 0x100;
const STACK_TOP: u64 = 0xf0000;
const CODE_BASE: u64 = 0x8000_0000;
const RETURN_MARKER: u64 = 0xdead_beef;
const STEP_LIMIT: usize = 1_000_000;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Fault {
    #[error("access to unmapped address {0:#x}")]
    Unmapped(u64),
    #[error("division by zero")]
    DivideByZero,
    #[error("call to unknown function {0}")]
    UnknownFunction(InternedSymbol),
    #[error("call to non-code address {0:#x}")]
    BadCallTarget(u64),
    #[error("conditional jump without a preceding comparison")]
    NoComparison,
    #[error("malformed instruction {0}")]
    Malformed(String),
    #[error("interface holds {found:#x}, expected {expected:#x}")]
    TypeAssertion { expected: u64, found: u64 },
    #[error("too few argument words")]
    MissingArgument,
    #[error("step limit exceeded")]
    StepLimit,
}

pub type Native = fn(&mut Machine) -> Result<(), Fault>;

enum Routine {
    Compiled(CompiledFunction),
    Native(Native),
}

#[derive(Debug, Clone, Copy)]
struct Activation {
    routine: usize,
    pc: usize,
    /// Stack pointer on entry, where the return address sits
    base: u64,
}

/// A call handed to the spawn entry point
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Spawned {
    pub function: u64,
    pub argument_width: u64,
    pub arguments: Vec<u64>,
}

pub struct Machine {
    memory: Vec<u8>,
    registers: [u64; REGISTER_COUNT],
    flags: Option<(u64, u64, Width)>,
    repeat: bool,
    routines: Vec<(InternedSymbol, Routine)>,
    statics: HashMap<InternedSymbol, u64>,
    activations: Vec<Activation>,
    steps: usize,
    pub spawned: Vec<Spawned>,
}

fn mask(width: Width) -> u64 {
    match width {
        Width::Q => u64::MAX,
        _ => (1u64 << (width.bytes() * 8)) - 1,
    }
}

fn sign_extend(value: u64, width: Width) -> i64 {
    let shift = 64 - width.bytes() * 8;
    ((value << shift) as i64) >> shift
}

impl Machine {
    pub fn new() -> Self {
        let mut machine = Self {
            memory: vec![0; MEMORY_SIZE],
            registers: [0; REGISTER_COUNT],
            flags: None,
            repeat: false,
            routines: Vec::new(),
            statics: HashMap::new(),
            activations: Vec::new(),
            steps: 0,
            spawned: Vec::new(),
        };

        machine.native("newproc", newproc);
        machine.native("ifaces2i", ifaces2i);
        machine.native("ifacei2i", ifacei2i);
        machine.native("ifacei2s", ifacei2s);

        machine
    }

    pub fn load(&mut self, function: CompiledFunction) {
        let name = function.name;
        self.define(name, Routine::Compiled(function));
    }

    pub fn native(&mut self, name: &str, native: Native) {
        self.define(InternedSymbol::new(name), Routine::Native(native));
    }

    fn define(&mut self, name: InternedSymbol, routine: Routine) {
        match self.routines.iter().position(|(n, _)| *n == name) {
            Some(index) => self.routines[index].1 = routine,
            None => self.routines.push((name, routine)),
        }
    }

    pub fn register(&self, register: Register) -> u64 {
        self.registers[register.index()]
    }

    /// Code address of a loaded function
    pub fn function_address(&self, name: &str) -> Option<u64> {
        let name = InternedSymbol::new(name);
        self.routines
            .iter()
            .position(|(n, _)| *n == name)
            .map(|index| CODE_BASE + index as u64)
    }

    /// Address of the data block of a global symbol
    pub fn static_address(&mut self, name: InternedSymbol) -> u64 {
        let next = STATIC_BASE + self.statics.len() as u64 * STATIC_BLOCK;
        *self.statics.entry(name).or_insert(next)
    }

    pub fn write_static(&mut self, name: &str, offset: u64, value: u64) -> Result<(), Fault> {
        let address = self.static_address(InternedSymbol::new(name)) + offset;
        self.store(address, 8, value)
    }

    pub fn read_static(&mut self, name: &str, offset: u64) -> Result<u64, Fault> {
        let address = self.static_address(InternedSymbol::new(name)) + offset;
        self.fetch(address, 8)
    }

    fn check(&self, address: u64, size: u64) -> Result<usize, Fault> {
        if address < UNMAPPED_LIMIT || address.saturating_add(size) > MEMORY_SIZE as u64 {
            return Err(Fault::Unmapped(address));
        }

        Ok(address as usize)
    }

    pub fn store(&mut self, address: u64, size: u64, value: u64) -> Result<(), Fault> {
        let start = self.check(address, size)?;
        let bytes = value.to_le_bytes();
        self.memory[start..start + size as usize].copy_from_slice(&bytes[..size as usize]);
        Ok(())
    }

    pub fn fetch(&self, address: u64, size: u64) -> Result<u64, Fault> {
        let start = self.check(address, size)?;
        let mut bytes = [0u8; 8];
        bytes[..size as usize].copy_from_slice(&self.memory[start..start + size as usize]);
        Ok(u64::from_le_bytes(bytes))
    }

    fn stack_pointer(&self) -> u64 {
        self.register(Register::Sp)
    }

    fn push(&mut self, value: u64) -> Result<(), Fault> {
        let sp = self.stack_pointer() - 8;
        self.registers[Register::Sp.index()] = sp;
        self.store(sp, 8, value)
    }

    fn pop(&mut self) -> Result<u64, Fault> {
        let sp = self.stack_pointer();
        let value = self.fetch(sp, 8)?;
        self.registers[Register::Sp.index()] = sp + 8;
        Ok(value)
    }

    fn address(&mut self, memory: MemoryOperand) -> Result<u64, Fault> {
        let base = match memory.base {
            MemoryBase::Frame => self.current()?.base + 8,
            MemoryBase::Auto => self.current()?.base,
            MemoryBase::Stack => self.stack_pointer(),
            MemoryBase::Static(symbol) => match self.function_address(symbol.value()) {
                Some(address) => address,
                None => self.static_address(symbol),
            },
            MemoryBase::Register(register) => self.register(register),
        };

        Ok(base.wrapping_add(memory.offset as u64))
    }

    fn current(&self) -> Result<Activation, Fault> {
        self.activations
            .last()
            .copied()
            .ok_or_else(|| Fault::Malformed("no active function".to_string()))
    }

    fn read(&mut self, operand: Operand, width: Width) -> Result<u64, Fault> {
        match operand {
            Operand::Register(register) => Ok(self.register(register) & mask(width)),
            Operand::Constant(value) => Ok(value as u64 & mask(width)),
            Operand::Memory(memory) => {
                let address = self.address(memory)?;
                self.fetch(address, width.bytes() as u64)
            }
            Operand::Branch(_) => Err(Fault::Malformed(format!("read of {operand}"))),
        }
    }

    fn write(&mut self, operand: Operand, width: Width, value: u64) -> Result<(), Fault> {
        match operand {
            Operand::Register(register) => {
                let old = self.registers[register.index()];
                self.registers[register.index()] = match width {
                    Width::Q => value,
                    // 32 bit writes clear the upper half, narrower ones keep it
                    Width::L => value & mask(Width::L),
                    _ => (old & !mask(width)) | (value & mask(width)),
                };
                Ok(())
            }
            Operand::Memory(memory) => {
                let address = self.address(memory)?;
                self.store(address, width.bytes() as u64, value)
            }
            _ => Err(Fault::Malformed(format!("write to {operand}"))),
        }
    }

    fn holds(&self, condition: Condition) -> Result<bool, Fault> {
        let (a, b, width) = self.flags.ok_or(Fault::NoComparison)?;
        let (ua, ub) = (a & mask(width), b & mask(width));
        let (sa, sb) = (sign_extend(a, width), sign_extend(b, width));

        Ok(match condition {
            Condition::Equal => ua == ub,
            Condition::NotEqual => ua != ub,
            Condition::Less => sa < sb,
            Condition::LessOrEqual => sa <= sb,
            Condition::Greater => sa > sb,
            Condition::GreaterOrEqual => sa >= sb,
            Condition::Below => ua < ub,
            Condition::BelowOrEqual => ua <= ub,
            Condition::Above => ua > ub,
            Condition::AboveOrEqual => ua >= ub,
        })
    }

    /// Calls `name` with `arguments` laid out in its input slots, one word
    /// per scalar slot and one word per eight bytes of larger slots. Returns
    /// the first word of each result slot.
    pub fn invoke(&mut self, name: &str, arguments: &[u64]) -> Result<Vec<u64>, Fault> {
        let symbol = InternedSymbol::new(name);
        let index = self
            .routines
            .iter()
            .position(|(n, _)| *n == symbol)
            .ok_or(Fault::UnknownFunction(symbol))?;
        let Routine::Compiled(function) = &self.routines[index].1 else {
            return Err(Fault::Malformed(format!("{name} is native")));
        };
        let signature = function.signature.clone();

        self.registers[Register::Sp.index()] = STACK_TOP;
        let mut words = arguments.iter().copied();

        for slot in signature.input_slots() {
            let size = slot.ty.size() as u64;
            let address = STACK_TOP + slot.offset as u64;

            if size <= 8 {
                let word = words.next().ok_or(Fault::MissingArgument)?;
                self.store(address, size, word)?;
                continue;
            }

            for word in 0..size / 8 {
                let value = words.next().ok_or(Fault::MissingArgument)?;
                self.store(address + word * 8, 8, value)?;
            }
        }

        self.call(index)?;
        self.run()?;

        signature
            .result_slots()
            .iter()
            .map(|slot| self.fetch(STACK_TOP + slot.offset as u64, (slot.ty.size() as u64).min(8)))
            .collect()
    }

    fn call(&mut self, index: usize) -> Result<(), Fault> {
        self.push(RETURN_MARKER)?;

        match self.routines.get(index).map(|(_, routine)| routine) {
            Some(Routine::Native(native)) => {
                let native = *native;
                native(self)?;
                self.pop()?;
            }
            Some(Routine::Compiled(_)) => self.activations.push(Activation {
                routine: index,
                pc: 0,
                base: self.stack_pointer(),
            }),
            None => return Err(Fault::BadCallTarget(CODE_BASE + index as u64)),
        }

        Ok(())
    }

    fn run(&mut self) -> Result<(), Fault> {
        while let Some(activation) = self.activations.last().copied() {
            self.steps += 1;
            if self.steps > STEP_LIMIT {
                return Err(Fault::StepLimit);
            }

            let Routine::Compiled(function) = &self.routines[activation.routine].1 else {
                return Err(Fault::Malformed("native activation".to_string()));
            };
            let instruction = function
                .instructions
                .get(InstructionId::new(activation.pc))
                .cloned()
                .ok_or_else(|| Fault::Malformed(format!("fell off the end of {}", function.name)))?;

            if let Some(top) = self.activations.last_mut() {
                top.pc += 1;
            }

            self.step(instruction.opcode, instruction.from, instruction.to)?;
        }

        Ok(())
    }

    fn operand(operand: Option<Operand>) -> Result<Operand, Fault> {
        operand.ok_or_else(|| Fault::Malformed("missing operand".to_string()))
    }

    fn step(&mut self, opcode: Opcode, from: Option<Operand>, to: Option<Operand>) -> Result<(), Fault> {
        let repeat = std::mem::take(&mut self.repeat);

        match opcode {
            Opcode::Text => {
                let Some(Operand::Constant(packed)) = to else {
                    return Err(Fault::Malformed("TEXT without sizes".to_string()));
                };
                let (_, frame_size) = unpack_frame_sizes(packed);
                let sp = self.stack_pointer() - frame_size as u64;
                self.registers[Register::Sp.index()] = sp;
            }
            Opcode::Ret => {
                let activation = self.current()?;
                self.registers[Register::Sp.index()] = activation.base;
                self.pop()?;
                self.activations.pop();
            }
            Opcode::Jmp | Opcode::Jcc(_) => {
                let Some(Operand::Branch(Some(target))) = to else {
                    return Err(Fault::Malformed("unresolved branch".to_string()));
                };
                let taken = match opcode {
                    Opcode::Jcc(condition) => self.holds(condition)?,
                    _ => true,
                };
                if taken {
                    if let Some(top) = self.activations.last_mut() {
                        top.pc = target.index();
                    }
                }
            }
            Opcode::Call => {
                let index = match Self::operand(to)? {
                    Operand::Memory(MemoryOperand {
                        base: MemoryBase::Static(symbol),
                        ..
                    }) => self
                        .routines
                        .iter()
                        .position(|(n, _)| *n == symbol)
                        .ok_or(Fault::UnknownFunction(symbol))?,
                    operand => {
                        let address = self.read(operand, Width::Q)?;
                        if address < CODE_BASE {
                            return Err(Fault::BadCallTarget(address));
                        }
                        (address - CODE_BASE) as usize
                    }
                };
                self.call(index)?;
            }
            Opcode::Pushq => {
                let value = self.read(Self::operand(from)?, Width::Q)?;
                self.push(value)?;
            }
            Opcode::Popq => {
                let value = self.pop()?;
                self.write(Self::operand(to)?, Width::Q, value)?;
            }
            Opcode::Mov(width) => {
                let value = self.read(Self::operand(from)?, width)?;
                self.write(Self::operand(to)?, width, value)?;
            }
            Opcode::MovSignExtend { from: narrow, to: wide } => {
                let value = self.read(Self::operand(from)?, narrow)?;
                self.write(Self::operand(to)?, wide, sign_extend(value, narrow) as u64)?;
            }
            Opcode::MovZeroExtend { from: narrow, to: wide } => {
                let value = self.read(Self::operand(from)?, narrow)?;
                self.write(Self::operand(to)?, wide, value)?;
            }
            Opcode::Leaq => {
                let Operand::Memory(memory) = Self::operand(from)? else {
                    return Err(Fault::Malformed("LEAQ of a non-memory operand".to_string()));
                };
                let address = self.address(memory)?;
                self.write(Self::operand(to)?, Width::Q, address)?;
            }
            Opcode::Add(width)
            | Opcode::Sub(width)
            | Opcode::Imul(width)
            | Opcode::And(width)
            | Opcode::Or(width)
            | Opcode::Xor(width) => {
                let destination = Self::operand(to)?;
                let a = self.read(destination, width)?;
                let b = self.read(Self::operand(from)?, width)?;
                let value = match opcode {
                    Opcode::Add(_) => a.wrapping_add(b),
                    Opcode::Sub(_) => a.wrapping_sub(b),
                    Opcode::Imul(_) => a.wrapping_mul(b),
                    Opcode::And(_) => a & b,
                    Opcode::Or(_) => a | b,
                    _ => a ^ b,
                };
                self.write(destination, width, value)?;
            }
            Opcode::Neg(width) | Opcode::Not(width) => {
                let destination = Self::operand(to)?;
                let value = self.read(destination, width)?;
                let value = match opcode {
                    Opcode::Neg(_) => value.wrapping_neg(),
                    _ => !value,
                };
                self.write(destination, width, value)?;
            }
            Opcode::Cmp(width) => {
                let a = self.read(Self::operand(from)?, width)?;
                let b = self.read(Self::operand(to)?, width)?;
                self.flags = Some((a, b, width));
            }
            Opcode::Idiv(width) | Opcode::Div(width) => self.divide(opcode, width, Self::operand(from)?)?,
            Opcode::Cdq => {
                let high = if sign_extend(self.register(Register::Ax), Width::L) < 0 { u64::MAX } else { 0 };
                self.write(Operand::Register(Register::Dx), Width::L, high)?;
            }
            Opcode::Cqo => {
                let high = if (self.register(Register::Ax) as i64) < 0 { u64::MAX } else { 0 };
                self.write(Operand::Register(Register::Dx), Width::Q, high)?;
            }
            Opcode::Shl(width) | Opcode::Shr(width) | Opcode::Sar(width) => {
                let limit = if width == Width::Q { 63 } else { 31 };
                let count = (self.read(Self::operand(from)?, Width::B)? & limit) as u32;
                let destination = Self::operand(to)?;
                let value = self.read(destination, width)?;
                let value = match opcode {
                    Opcode::Shl(_) => value << count,
                    Opcode::Shr(_) => value >> count,
                    _ => (sign_extend(value, width) >> count) as u64,
                };
                self.write(destination, width, value)?;
            }
            Opcode::Cld => {}
            Opcode::Rep => self.repeat = true,
            Opcode::Stosq | Opcode::Stosb => {
                let width = if opcode == Opcode::Stosq { Width::Q } else { Width::B };
                let count = if repeat { self.register(Register::Cx) } else { 1 };

                for _ in 0..count {
                    let destination = self.register(Register::Di);
                    let value = self.register(Register::Ax) & mask(width);
                    self.store(destination, width.bytes() as u64, value)?;
                    self.registers[Register::Di.index()] = destination + width.bytes() as u64;
                }

                if repeat {
                    self.registers[Register::Cx.index()] = 0;
                }
            }
        }

        Ok(())
    }

    fn divide(&mut self, opcode: Opcode, width: Width, divisor: Operand) -> Result<(), Fault> {
        let divisor = self.read(divisor, width)?;
        if divisor == 0 {
            return Err(Fault::DivideByZero);
        }

        let bits = width.bytes() as u32 * 8;
        let low = self.register(Register::Ax) & mask(width);
        let high = self.register(Register::Dx) & mask(width);
        let dividend = ((high as u128) << bits) | low as u128;

        let (quotient, remainder) = match opcode {
            Opcode::Idiv(_) => {
                // sign extend the double width dividend from 2 * bits
                let shift = 128 - 2 * bits;
                let dividend = ((dividend << shift) as i128) >> shift;
                let divisor = sign_extend(divisor, width) as i128;
                ((dividend / divisor) as u64, (dividend % divisor) as u64)
            }
            _ => {
                let divisor = divisor as u128;
                ((dividend / divisor) as u64, (dividend % divisor) as u64)
            }
        };

        self.write(Operand::Register(Register::Ax), width, quotient)?;
        self.write(Operand::Register(Register::Dx), width, remainder)
    }

    /// Reads the word at `offset` in the caller's outgoing argument area
    /// from inside a native routine
    pub fn argument(&self, offset: u64) -> Result<u64, Fault> {
        self.fetch(self.stack_pointer() + 8 + offset, 8)
    }

    pub fn set_argument(&mut self, offset: u64, value: u64) -> Result<(), Fault> {
        self.store(self.stack_pointer() + 8 + offset, 8, value)
    }
}

/// Records the spawned call instead of running it: the pushed function and
/// argument size sit above the return address, the arguments above those
fn newproc(machine: &mut Machine) -> Result<(), Fault> {
    let argument_width = machine.argument(0)?;
    let function = machine.argument(8)?;
    let arguments = (0..argument_width.div_ceil(8))
        .map(|word| machine.argument(16 + word * 8))
        .collect::<Result<Vec<_>, _>>()?;

    machine.spawned.push(Spawned {
        function,
        argument_width,
        arguments,
    });

    Ok(())
}

/// Uses the source type descriptor as the method table
fn ifaces2i(machine: &mut Machine) -> Result<(), Fault> {
    let source = machine.argument(8)?;
    machine.set_argument(16, source)
}

fn ifacei2i(_: &mut Machine) -> Result<(), Fault> {
    Ok(())
}

/// Checks that the interface holds the expected concrete type; the data
/// word is already in the result slot
fn ifacei2s(machine: &mut Machine) -> Result<(), Fault> {
    let expected = machine.argument(0)?;
    let found = machine.argument(8)?;

    if expected != found {
        return Err(Fault::TypeAssertion { expected, found });
    }

    Ok(())
}
