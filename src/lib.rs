#![deny(missing_debug_implementations)]
// #![deny(missing_docs)]
#![warn(
    clippy::cargo,
    clippy::nursery,
    clippy::pedantic,
    clippy::perf,
    clippy::complexity,
    clippy::style,
    clippy::correctness,
    rust_2018_idioms
)]

//! A virtual machine for an invented, parametric architecture.
//!
//! The number of bits per memory cell (`char_bit`), the number of cells per
//! machine word and per address are all chosen at VM construction time, and
//! the byte order used to serialize each instruction operand depends on the
//! parity of its opcode. The crate bundles the CPU, the three-space memory
//! subsystem and a two-pass assembler for the machine's assembly language.

pub mod assembler;
mod dump;
pub mod endian;
pub mod instruction;
pub mod memory;
pub mod options;
pub mod registers;
pub mod vm;

pub use assembler::{assemble, AssemblyError, AssemblyErrorKind};
pub use instruction::*;
pub use memory::{Memory, MemoryMap, Space};
pub use options::{Mapping, OptionBuilder, Options, OptionsError};
pub use registers::{Flag, Register, RegisterFile, Width};
pub use vm::{decode, Vm};
