//! The backend turns a typed function tree into a linear stream of amd64
//! instructions in a single pass.
//!
//! Lowering a function takes these steps:
//! 1. Lay out the frame, giving every parameter, result and local an offset.
//! 2. Walk the statements in order, emitting instructions as they are
//!    visited. Forward jumps are emitted without a target and patched once
//!    the destination is reached.
//! 3. Terminate the function, resolve what is left of the goto labels and
//!    fill in the final frame size.

mod arith;
mod call;
mod context;
mod expr;
mod frame;
mod function;
mod iface;
mod instruction;
mod labels;
mod pretty_print;
mod registers;
mod stmt;
mod target;

#[cfg(test)]
mod simulator;

pub use context::{JumpTargets, LoweringContext};
pub use frame::Frame;
pub use function::{CompiledFunction, compile_function};
pub use instruction::{
    Condition, Instruction, InstructionId, MemoryBase, MemoryOperand, Opcode, Operand, Program,
    Width, pack_frame_sizes, unpack_frame_sizes,
};
pub use labels::{LabelState, LabelTable};
pub use registers::{ALLOCATION_ORDER, Allocation, Register, RegisterFile};
pub use target::{Target, TargetAbi};
