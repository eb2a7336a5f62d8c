//! Lox Runtime Library
//!
//! The virtual machine half of the interpreter: call frames, the value
//! stack, globals, natives, and the runtime error model. The compiler
//! half lives in `lox-compiler`; [`Vm::interpret`] drives both.
//!
//! The VM writes program output to an injected byte sink and never
//! touches stdout/stderr itself; the `lox` binary wires the sinks up.

pub mod native;
pub mod vm;

pub use vm::{FRAMES_MAX, InterpretResult, STACK_MAX, Vm};

/// Run `source` on a fresh VM and capture everything it writes (program
/// output and any diagnostics, in order). Convenience for embedders and
/// the end-to-end tests.
pub fn run_capture(source: &str) -> (String, InterpretResult) {
    let mut out = Vec::new();
    let mut vm = Vm::new(&mut out);
    let result = vm.interpret(source);
    drop(vm);
    (String::from_utf8_lossy(&out).into_owned(), result)
}

/// Compile `source` on a scratch heap and return its bytecode listing,
/// including every nested function.
pub fn disassemble_source(source: &str) -> Result<String, String> {
    let mut heap = lox_core::Heap::new();
    let function = loxc::compile(source, &mut heap)?;
    Ok(unsafe { lox_core::disassemble_function((*function).as_function()) })
}
