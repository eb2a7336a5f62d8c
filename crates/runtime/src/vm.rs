//! The virtual machine
//!
//! A stack machine over the bytecode in `lox-core`: a fixed-capacity
//! value stack, a fixed-capacity call-frame stack, a globals table
//! keyed by interned name pointers, and the heap that owns everything.
//!
//! The value stack is preallocated at full capacity and never
//! reallocates; open upvalues hold raw pointers into it, so slot
//! addresses must stay stable for the life of a run. Pushing past
//! capacity is a runtime error, not a reallocation.
//!
//! Runtime errors unwind every call frame, write the message and a
//! per-frame trace to the diagnostics sink, and discard the VM run
//! state. They never become host panics.

use std::fmt::Write as _;
use std::io::Write;

use ahash::AHashMap;

use lox_core::{Chunk, Heap, HeapStats, Obj, ObjBody, OpCode, Value};
use lox_core::opcode::OperandKind;

use crate::native;

/// Maximum call depth.
pub const FRAMES_MAX: usize = 64;
/// Value stack capacity, in slots.
pub const STACK_MAX: usize = FRAMES_MAX * 1024;

/// Outcome of [`Vm::interpret`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InterpretResult {
    Ok,
    CompileError,
    RuntimeError,
}

struct RuntimeError {
    message: String,
}

impl RuntimeError {
    fn new(message: impl Into<String>) -> RuntimeError {
        RuntimeError {
            message: message.into(),
        }
    }
}

struct CallFrame {
    closure: *mut Obj,
    /// Next byte to execute in the closure's function's chunk.
    ip: usize,
    /// Stack index where this frame's slots begin (the callee itself).
    base: usize,
}

/// Globals key: an interned string pointer. Interning makes pointer
/// identity equivalent to content equality, and the precomputed FNV-1a
/// hash rides along on the string object.
#[derive(Clone, Copy)]
struct GlobalKey(*mut Obj);

impl PartialEq for GlobalKey {
    fn eq(&self, other: &GlobalKey) -> bool {
        std::ptr::eq(self.0, other.0)
    }
}

impl Eq for GlobalKey {}

impl std::hash::Hash for GlobalKey {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        state.write_u32(unsafe { (*self.0).as_string().hash() });
    }
}

pub struct Vm<'w> {
    heap: Heap,
    stack: Vec<Value>,
    frames: Vec<CallFrame>,
    globals: AHashMap<GlobalKey, Value>,
    /// Program output (`print`).
    out: &'w mut dyn Write,
    /// Diagnostics; defaults to the output sink.
    err: Option<&'w mut dyn Write>,
    /// Dump the value stack after every instruction.
    trace: bool,
}

impl<'w> Vm<'w> {
    pub fn new(out: &'w mut dyn Write) -> Vm<'w> {
        Vm::with_heap(out, Heap::new())
    }

    /// Build on a caller-configured heap (tests use low GC thresholds).
    pub fn with_heap(out: &'w mut dyn Write, heap: Heap) -> Vm<'w> {
        let mut vm = Vm {
            heap,
            stack: Vec::with_capacity(STACK_MAX),
            frames: Vec::with_capacity(FRAMES_MAX),
            globals: AHashMap::new(),
            out,
            err: None,
            trace: false,
        };
        vm.define_native("clock", native::clock);
        vm
    }

    /// Route diagnostics (compile errors, runtime traces, `--trace`
    /// output) to a separate sink. The CLI points this at stderr.
    pub fn error_sink(mut self, err: &'w mut dyn Write) -> Vm<'w> {
        self.err = Some(err);
        self
    }

    /// Dump the value stack after every instruction.
    pub fn trace_execution(mut self, on: bool) -> Vm<'w> {
        self.trace = on;
        self
    }

    pub fn heap_stats(&self) -> HeapStats {
        self.heap.stats()
    }

    fn define_native(&mut self, name: &str, function: lox_core::NativeFn) {
        let name = self.heap.make_string(name);
        let native = self.heap.make_native(function);
        self.globals.insert(GlobalKey(name), Value::from(native));
    }

    /// Compile and execute `source`. Program output goes to the output
    /// sink; diagnostics go to the error sink (or the output sink when
    /// none is set, which keeps embedded captures in program order).
    pub fn interpret(&mut self, source: &str) -> InterpretResult {
        self.stack.clear();
        self.frames.clear();

        let function = {
            let Vm {
                heap,
                globals,
                stack,
                frames,
                ..
            } = self;
            loxc::compile_with_roots(source, heap, &mut |tracer| {
                for (key, value) in globals.iter() {
                    tracer.mark_object(key.0);
                    tracer.mark_value(*value);
                }
                for value in stack.iter() {
                    tracer.mark_value(*value);
                }
                for frame in frames.iter() {
                    tracer.mark_object(frame.closure);
                }
            })
        };
        let function = match function {
            Ok(function) => function,
            Err(diagnostics) => {
                let sink = self.diagnostics_sink();
                let _ = writeln!(sink, "{diagnostics}");
                return InterpretResult::CompileError;
            }
        };

        // Root the script function on the stack across the closure
        // allocation, then run it as frame 0.
        let _ = self.push(Value::from(function));
        self.gc_safe_point();
        let closure = self.heap.make_closure(function);
        self.pop();
        let _ = self.push(Value::from(closure));
        self.frames.push(CallFrame {
            closure,
            ip: 0,
            base: 0,
        });

        match self.run() {
            Ok(()) => InterpretResult::Ok,
            Err(error) => {
                self.report_runtime_error(&error);
                self.stack.clear();
                self.frames.clear();
                InterpretResult::RuntimeError
            }
        }
    }

    // Dispatch loop.

    fn run(&mut self) -> Result<(), RuntimeError> {
        loop {
            if self.frames.is_empty() {
                return Ok(());
            }
            if self.trace {
                self.trace_stack();
            }

            // Decode one instruction. The chunk reference is derived
            // from a raw closure pointer, so it does not pin `self`.
            let (op, operand) = {
                let frame = self.frames.last_mut().expect("active call frame");
                let chunk: &Chunk = unsafe {
                    (*(*frame.closure).as_closure().function).as_function().chunk()
                };
                let code = chunk.code();
                let ip = frame.ip;
                let byte = code[ip];
                let op = OpCode::try_from(byte)
                    .map_err(|_| RuntimeError::new(format!("Unknown opcode {byte}.")))?;
                let operand = match op.operand_kind() {
                    OperandKind::None => {
                        frame.ip = ip + 1;
                        0
                    }
                    OperandKind::Byte | OperandKind::Constant => {
                        frame.ip = ip + 2;
                        code[ip + 1] as usize
                    }
                    OperandKind::Short => {
                        frame.ip = ip + 3;
                        ((code[ip + 1] as usize) << 8) | code[ip + 2] as usize
                    }
                };
                (op, operand)
            };

            match op {
                OpCode::Constant => {
                    let value = self.read_constant(operand);
                    self.push(value)?;
                }
                OpCode::Nil => self.push(Value::NIL)?,
                OpCode::True => self.push(Value::from(true))?,
                OpCode::False => self.push(Value::from(false))?,
                OpCode::Pop => {
                    self.pop();
                }
                OpCode::GetLocal => {
                    let base = self.frame().base;
                    let value = self.stack[base + operand];
                    self.push(value)?;
                }
                OpCode::SetLocal => {
                    let base = self.frame().base;
                    self.stack[base + operand] = self.peek(0);
                }
                OpCode::GetGlobal => {
                    let name = self.read_constant(operand).as_obj();
                    match self.globals.get(&GlobalKey(name)) {
                        Some(&value) => self.push(value)?,
                        None => return Err(undefined_variable(name)),
                    }
                }
                OpCode::DefineGlobal => {
                    let name = self.read_constant(operand).as_obj();
                    let value = self.peek(0);
                    self.globals.insert(GlobalKey(name), value);
                    self.pop();
                }
                OpCode::SetGlobal => {
                    let name = self.read_constant(operand).as_obj();
                    let key = GlobalKey(name);
                    if !self.globals.contains_key(&key) {
                        return Err(undefined_variable(name));
                    }
                    let value = self.peek(0);
                    self.globals.insert(key, value);
                }
                OpCode::GetUpvalue => {
                    let upvalue = self.current_upvalue(operand);
                    let value = unsafe { *(*upvalue).as_upvalue().location };
                    self.push(value)?;
                }
                OpCode::SetUpvalue => {
                    let upvalue = self.current_upvalue(operand);
                    let value = self.peek(0);
                    unsafe {
                        *(*upvalue).as_upvalue_mut().location = value;
                    }
                }
                OpCode::Equal => {
                    let right = self.pop();
                    let left = self.pop();
                    self.push(Value::from(left == right))?;
                }
                OpCode::Greater => {
                    let (left, right) = self.pop_numbers()?;
                    self.push(Value::from(left > right))?;
                }
                OpCode::Less => {
                    let (left, right) = self.pop_numbers()?;
                    self.push(Value::from(left < right))?;
                }
                OpCode::Add => self.add()?,
                OpCode::Subtract => {
                    let (left, right) = self.pop_numbers()?;
                    self.push(Value::from(left - right))?;
                }
                OpCode::Multiply => {
                    let (left, right) = self.pop_numbers()?;
                    self.push(Value::from(left * right))?;
                }
                OpCode::Divide => {
                    // IEEE division: zero divisors produce inf/nan.
                    let (left, right) = self.pop_numbers()?;
                    self.push(Value::from(left / right))?;
                }
                OpCode::Not => {
                    let value = self.pop();
                    self.push(Value::from(value.is_falsey()))?;
                }
                OpCode::Negate => {
                    if !self.peek(0).is_number() {
                        return Err(RuntimeError::new("Operand must be a number."));
                    }
                    let value = self.pop().as_number();
                    self.push(Value::from(-value))?;
                }
                OpCode::Print => {
                    let value = self.pop();
                    let _ = writeln!(self.out, "{value}");
                }
                OpCode::Jump => {
                    self.frame_mut().ip += operand;
                }
                OpCode::JumpIfFalse => {
                    // The condition stays on the stack for and/or;
                    // other consumers pop it explicitly.
                    if self.peek(0).is_falsey() {
                        self.frame_mut().ip += operand;
                    }
                }
                OpCode::Loop => {
                    self.frame_mut().ip -= operand;
                }
                OpCode::Call => {
                    let callee = self.peek(operand);
                    self.call_value(callee, operand)?;
                }
                OpCode::Closure => self.make_closure(operand)?,
                OpCode::CloseUpvalue => {
                    let top = self.stack.len() - 1;
                    let slot: *mut Value = &mut self.stack[top];
                    self.heap.close_upvalues(slot);
                    self.pop();
                }
                OpCode::Return => {
                    let result = self.pop();
                    let frame = self.frames.pop().expect("active call frame");
                    let base_slot: *mut Value = unsafe { self.stack.as_mut_ptr().add(frame.base) };
                    self.heap.close_upvalues(base_slot);
                    if self.frames.is_empty() {
                        self.pop();
                        return Ok(());
                    }
                    self.stack.truncate(frame.base);
                    self.push(result)?;
                }
            }
        }
    }

    // Instruction helpers.

    fn frame(&self) -> &CallFrame {
        self.frames.last().expect("active call frame")
    }

    fn frame_mut(&mut self) -> &mut CallFrame {
        self.frames.last_mut().expect("active call frame")
    }

    fn current_chunk(&self) -> &Chunk {
        unsafe {
            (*(*self.frame().closure).as_closure().function)
                .as_function()
                .chunk()
        }
    }

    fn read_constant(&self, index: usize) -> Value {
        self.current_chunk().constants()[index]
    }

    fn current_upvalue(&self, index: usize) -> *mut Obj {
        unsafe { (*self.frame().closure).as_closure().upvalues[index] }
    }

    fn push(&mut self, value: Value) -> Result<(), RuntimeError> {
        // Capacity is the invariant, not a growth hint: open upvalues
        // point into this buffer.
        if self.stack.len() == STACK_MAX {
            return Err(RuntimeError::new("Stack overflow."));
        }
        self.stack.push(value);
        Ok(())
    }

    fn pop(&mut self) -> Value {
        self.stack.pop().expect("value stack underflow")
    }

    fn peek(&self, distance: usize) -> Value {
        self.stack[self.stack.len() - 1 - distance]
    }

    fn pop_numbers(&mut self) -> Result<(f64, f64), RuntimeError> {
        if !self.peek(0).is_number() || !self.peek(1).is_number() {
            return Err(RuntimeError::new("Operands must be numbers."));
        }
        let right = self.pop().as_number();
        let left = self.pop().as_number();
        Ok((left, right))
    }

    /// `Add` is numeric addition or interned string concatenation.
    fn add(&mut self) -> Result<(), RuntimeError> {
        let right = self.peek(0);
        let left = self.peek(1);
        if left.is_number() && right.is_number() {
            self.pop();
            self.pop();
            return self.push(Value::from(left.as_number() + right.as_number()));
        }
        let both_strings = left.is_obj()
            && right.is_obj()
            && unsafe { (*left.as_obj()).is_string() && (*right.as_obj()).is_string() };
        if !both_strings {
            return Err(RuntimeError::new(
                "Operands must be two numbers or two strings.",
            ));
        }
        let text = unsafe {
            let mut text =
                String::with_capacity((*left.as_obj()).as_string().text().len()
                    + (*right.as_obj()).as_string().text().len());
            text.push_str((*left.as_obj()).as_string().text());
            text.push_str((*right.as_obj()).as_string().text());
            text
        };
        // Operands are still on the stack, so they survive a collection
        // triggered by the interning allocation.
        self.gc_safe_point();
        let result = self.heap.make_string(&text);
        self.pop();
        self.pop();
        self.push(Value::from(result))
    }

    fn call_value(&mut self, callee: Value, arg_count: usize) -> Result<(), RuntimeError> {
        if !callee.is_obj() {
            return Err(RuntimeError::new("Can only call functions and classes."));
        }
        let obj = callee.as_obj();
        match unsafe { &(*obj).body } {
            ObjBody::Closure(closure) => {
                let arity = unsafe { (*closure.function).as_function().arity };
                if arg_count != arity {
                    return Err(RuntimeError::new(format!(
                        "Expected {arity} arguments but got {arg_count}."
                    )));
                }
                if self.frames.len() == FRAMES_MAX {
                    return Err(RuntimeError::new("Stack overflow."));
                }
                self.frames.push(CallFrame {
                    closure: obj,
                    ip: 0,
                    base: self.stack.len() - arg_count - 1,
                });
                Ok(())
            }
            ObjBody::Native(native) => {
                let function = native.function;
                let args_start = self.stack.len() - arg_count;
                let result = function(&self.stack[args_start..]);
                self.stack.truncate(args_start - 1);
                self.push(result)
            }
            _ => Err(RuntimeError::new("Can only call functions and classes.")),
        }
    }

    /// Execute `Closure`: instantiate the function constant and consume
    /// the inline upvalue descriptors. The closure goes onto the stack
    /// before its upvalues are captured so a collection mid-capture
    /// sees it.
    fn make_closure(&mut self, constant: usize) -> Result<(), RuntimeError> {
        let function = self.read_constant(constant).as_obj();
        self.gc_safe_point();
        let closure = self.heap.make_closure(function);
        self.push(Value::from(closure))?;

        let count = unsafe { (*function).as_function().upvalue_count };
        for _ in 0..count {
            let (is_local, index) = {
                let frame = self.frame_mut();
                let chunk: &Chunk = unsafe {
                    (*(*frame.closure).as_closure().function).as_function().chunk()
                };
                let is_local = chunk.code()[frame.ip] != 0;
                let index = chunk.code()[frame.ip + 1] as usize;
                frame.ip += 2;
                (is_local, index)
            };
            let upvalue = if is_local {
                let base = self.frame().base;
                let slot: *mut Value = unsafe { self.stack.as_mut_ptr().add(base + index) };
                self.heap.capture_upvalue(slot)
            } else {
                self.current_upvalue(index)
            };
            unsafe {
                (*closure).as_closure_mut().upvalues.push(upvalue);
            }
        }
        Ok(())
    }

    // Garbage collection.

    /// Collect if due. Every live value is reachable from the stack,
    /// the frames, or the globals; the heap adds open upvalues itself.
    fn gc_safe_point(&mut self) {
        let Vm {
            heap,
            stack,
            frames,
            globals,
            ..
        } = self;
        heap.maybe_collect(|tracer| {
            for value in stack.iter() {
                tracer.mark_value(*value);
            }
            for frame in frames.iter() {
                tracer.mark_object(frame.closure);
            }
            for (key, value) in globals.iter() {
                tracer.mark_object(key.0);
                tracer.mark_value(*value);
            }
        });
    }

    // Diagnostics.

    fn diagnostics_sink(&mut self) -> &mut dyn Write {
        match &mut self.err {
            Some(err) => &mut **err,
            None => &mut *self.out,
        }
    }

    /// The error message, then one line per frame, innermost first.
    fn report_runtime_error(&mut self, error: &RuntimeError) {
        let mut report = String::new();
        let _ = writeln!(report, "{}", error.message);
        for frame in self.frames.iter().rev() {
            let function = unsafe {
                (*(*frame.closure).as_closure().function).as_function()
            };
            let line = function.chunk().line_at(frame.ip.saturating_sub(1));
            let _ = writeln!(report, "[line {line}] in {}", function.describe());
        }
        let sink = self.diagnostics_sink();
        let _ = write!(sink, "{report}");
    }

    fn trace_stack(&mut self) {
        let mut dump = String::new();
        for value in &self.stack {
            let _ = write!(dump, "{value} ");
        }
        let line = dump.trim_end().to_string();
        let sink = self.diagnostics_sink();
        let _ = writeln!(sink, "{line}");
    }
}

fn undefined_variable(name: *mut Obj) -> RuntimeError {
    let text = unsafe { (*name).as_string().text() };
    RuntimeError::new(format!("Undefined variable: '{text}'."))
}
