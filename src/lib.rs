//! A single-pass amd64 code generator for the statement level of a typed,
//! Go-like language: control flow, assignments, calls, task spawns and
//! interface conversions, lowered straight into Plan 9 style instructions.

pub mod ast;
pub mod backend;
pub mod diagnostics;
pub mod index;
pub mod intern;
pub mod samples;
pub mod ty;
