//! Lox Core: values, heap objects, and bytecode for the Lox interpreter
//!
//! This crate is the foundation shared by the compiler and the virtual
//! machine. It owns every representation decision the two sides have to
//! agree on:
//!
//! - `value`: 64-bit `Value` scalar (NaN-boxed by default, tagged union
//!   behind `--no-default-features`)
//! - `object`: heap object header + the closed set of object bodies
//!   (String, Function, Native, Upvalue, Closure)
//! - `heap`: object ownership, string interning, open upvalues, and the
//!   mark-sweep garbage collector
//! - `chunk`: append-only bytecode buffer with constant pool and
//!   run-length line table
//! - `opcode`: the instruction set
//! - `disasm`: human-readable chunk listings (pinned by tests)
//! - `stats`: heap counters used by diagnostics and the GC tests

pub mod chunk;
pub mod disasm;
pub mod heap;
#[cfg(feature = "nanbox")]
pub mod nanbox;
pub mod object;
pub mod opcode;
pub mod stats;
pub mod value;

pub use chunk::Chunk;
pub use disasm::{disassemble, disassemble_function};
pub use heap::{Heap, Tracer};
pub use object::{Closure, Function, LoxString, Native, NativeFn, Obj, ObjBody, Upvalue};
pub use opcode::OpCode;
pub use stats::HeapStats;
pub use value::Value;
