//! Lox Compiler Library
//!
//! Translates Lox source text straight to bytecode: the scanner turns
//! the source into a token vector, and the single-pass Pratt compiler
//! emits a top-level function whose chunk embeds one nested function
//! constant per `fun` declaration. No AST is ever materialized.
//!
//! The compiler allocates its strings and functions on the caller's
//! [`lox_core::Heap`], and keeps every in-progress function visible to
//! the collector, so a collection in the middle of a compile is safe.

pub mod compiler;
pub mod scanner;

pub use compiler::{compile, compile_with_roots};
pub use scanner::{Token, TokenKind, scan};
