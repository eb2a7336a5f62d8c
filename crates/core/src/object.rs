//! Heap object representation
//!
//! Every heap allocation is an [`Obj`]: a small header (intrusive
//! all-objects link + GC mark) followed by one of a closed set of
//! bodies. The set is fixed, so the body is a plain tagged sum rather
//! than open polymorphism.
//!
//! Objects are created and owned exclusively by [`crate::heap::Heap`];
//! everything else refers to them through raw `*mut Obj` pointers whose
//! lifetime is bounded by the collector.

use std::fmt;

use crate::chunk::Chunk;
use crate::value::Value;

/// Host function signature: receives the argument slice, returns a value.
/// Natives must not allocate managed objects unless prepared to root them.
pub type NativeFn = fn(args: &[Value]) -> Value;

/// Header plus body of a heap object.
pub struct Obj {
    /// Intrusive link for the heap's all-objects list.
    pub(crate) next: *mut Obj,
    /// Set during the mark phase, cleared again by sweep.
    pub(crate) marked: bool,
    pub body: ObjBody,
}

/// The closed set of object kinds.
pub enum ObjBody {
    String(LoxString),
    Function(Function),
    Native(Native),
    Upvalue(Upvalue),
    Closure(Closure),
}

/// Immutable interned string: UTF-8 text plus its FNV-1a hash.
pub struct LoxString {
    text: Box<str>,
    hash: u32,
}

impl LoxString {
    pub fn new(text: &str) -> LoxString {
        LoxString {
            hash: fnv1a(text.as_bytes()),
            text: text.into(),
        }
    }

    pub fn text(&self) -> &str {
        &self.text
    }

    pub fn hash(&self) -> u32 {
        self.hash
    }
}

/// 32-bit FNV-1a.
pub fn fnv1a(bytes: &[u8]) -> u32 {
    let mut hash = 2166136261u32;
    for &b in bytes {
        hash ^= u32::from(b);
        hash = hash.wrapping_mul(16777619);
    }
    hash
}

/// Compiled code: a chunk plus its calling contract.
pub struct Function {
    pub arity: usize,
    pub upvalue_count: usize,
    /// Interned name string, or null for the top-level script.
    pub name: *mut Obj,
    chunk: Chunk,
}

impl Function {
    pub fn new() -> Function {
        Function {
            arity: 0,
            upvalue_count: 0,
            name: std::ptr::null_mut(),
            chunk: Chunk::new(),
        }
    }

    pub fn chunk(&self) -> &Chunk {
        &self.chunk
    }

    pub fn chunk_mut(&mut self) -> &mut Chunk {
        &mut self.chunk
    }

    /// `<function: NAME>` or `<script>`.
    pub fn describe(&self) -> String {
        if self.name.is_null() {
            "<script>".to_string()
        } else {
            let name = unsafe { (*self.name).as_string() };
            format!("<function: {}>", name.text())
        }
    }
}

impl Default for Function {
    fn default() -> Function {
        Function::new()
    }
}

/// A callable wrapping a host function pointer.
pub struct Native {
    pub function: NativeFn,
}

/// A cell indirecting one captured variable.
///
/// Open: `location` points at a live VM stack slot and `next_open` links
/// the heap's sorted open-upvalue list. Closed: the value has been
/// copied into `closed` and `location` points at that cell, which never
/// moves because the enclosing `Obj` is a stable heap allocation.
pub struct Upvalue {
    pub location: *mut Value,
    pub closed: Value,
    pub next_open: *mut Obj,
}

/// A function paired with the upvalues it captured. Created fresh each
/// time a `Closure` opcode executes.
pub struct Closure {
    pub function: *mut Obj,
    pub upvalues: Vec<*mut Obj>,
}

impl Obj {
    pub fn is_string(&self) -> bool {
        matches!(self.body, ObjBody::String(_))
    }

    pub fn is_function(&self) -> bool {
        matches!(self.body, ObjBody::Function(_))
    }

    pub fn is_native(&self) -> bool {
        matches!(self.body, ObjBody::Native(_))
    }

    pub fn is_upvalue(&self) -> bool {
        matches!(self.body, ObjBody::Upvalue(_))
    }

    pub fn is_closure(&self) -> bool {
        matches!(self.body, ObjBody::Closure(_))
    }

    pub fn as_string(&self) -> &LoxString {
        match &self.body {
            ObjBody::String(s) => s,
            _ => unreachable!("object is not a string"),
        }
    }

    pub fn as_function(&self) -> &Function {
        match &self.body {
            ObjBody::Function(f) => f,
            _ => unreachable!("object is not a function"),
        }
    }

    pub fn as_function_mut(&mut self) -> &mut Function {
        match &mut self.body {
            ObjBody::Function(f) => f,
            _ => unreachable!("object is not a function"),
        }
    }

    pub fn as_native(&self) -> &Native {
        match &self.body {
            ObjBody::Native(n) => n,
            _ => unreachable!("object is not a native"),
        }
    }

    pub fn as_upvalue(&self) -> &Upvalue {
        match &self.body {
            ObjBody::Upvalue(u) => u,
            _ => unreachable!("object is not an upvalue"),
        }
    }

    pub fn as_upvalue_mut(&mut self) -> &mut Upvalue {
        match &mut self.body {
            ObjBody::Upvalue(u) => u,
            _ => unreachable!("object is not an upvalue"),
        }
    }

    pub fn as_closure(&self) -> &Closure {
        match &self.body {
            ObjBody::Closure(c) => c,
            _ => unreachable!("object is not a closure"),
        }
    }

    pub fn as_closure_mut(&mut self) -> &mut Closure {
        match &mut self.body {
            ObjBody::Closure(c) => c,
            _ => unreachable!("object is not a closure"),
        }
    }

    /// Size charged against the GC trigger. Only counts what is fixed
    /// at allocation time, so the charge and the credit on free agree;
    /// growable interiors (chunks, upvalue vectors) are not tracked.
    pub(crate) fn accounted_size(&self) -> usize {
        let extra = match &self.body {
            ObjBody::String(s) => s.text.len(),
            _ => 0,
        };
        std::mem::size_of::<Obj>() + extra
    }
}

impl fmt::Display for Obj {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.body {
            ObjBody::String(s) => f.write_str(s.text()),
            ObjBody::Function(func) => f.write_str(&func.describe()),
            ObjBody::Native(_) => f.write_str("<native func>"),
            ObjBody::Upvalue(_) => f.write_str("upvalue"),
            ObjBody::Closure(c) => {
                let func = unsafe { (*c.function).as_function() };
                f.write_str(&func.describe())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fnv1a_known_vectors() {
        // Reference values for the 32-bit FNV-1a parameters.
        assert_eq!(fnv1a(b""), 2166136261);
        assert_eq!(fnv1a(b"a"), 0xe40c292c);
        assert_eq!(fnv1a(b"foobar"), 0xbf9cf968);
    }

    #[test]
    fn test_string_hash_is_precomputed() {
        let s = LoxString::new("clock");
        assert_eq!(s.hash(), fnv1a(b"clock"));
        assert_eq!(s.text(), "clock");
    }

    #[test]
    fn test_script_description() {
        let func = Function::new();
        assert_eq!(func.describe(), "<script>");
    }
}
