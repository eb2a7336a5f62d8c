//! Chunk disassembler
//!
//! Renders a chunk as a stable, test-pinned listing:
//!
//! ```text
//! == <script> ==
//! 0000 0001 OP_CONSTANT         0 '2.000000'
//! 0002    | OP_PRINT
//! ```
//!
//! Four-digit offset; four-digit line, replaced by `   |` when the line
//! repeats; `OP_` names padded to 16 columns; operands right-aligned in
//! four columns. Constant operands also show the constant's display
//! form. `OP_CLOSURE` prints one ` local N,` / ` upvalue N,` line per
//! inline descriptor pair and then the nested function's dump, indented
//! four spaces per nesting level.

use std::fmt::Write as _;

use crate::chunk::Chunk;
use crate::object::Function;
use crate::opcode::{OpCode, OperandKind};

/// Disassemble a function and, inline, every function in its constant
/// pool reachable through `OP_CLOSURE`.
pub fn disassemble_function(function: &Function) -> String {
    dump(function.chunk(), &function.describe(), 0)
}

/// Disassemble one chunk under a heading.
pub fn disassemble(chunk: &Chunk, name: &str) -> String {
    dump(chunk, name, 0)
}

fn dump(chunk: &Chunk, name: &str, level: usize) -> String {
    let indent = "    ".repeat(level);
    let mut out = String::new();
    let _ = writeln!(out, "{indent}== {name} ==");

    let code = chunk.code();
    let mut offset = 0;
    let mut last_line = None;
    while offset < code.len() {
        let line = chunk.line_at(offset);
        let line_col = if last_line == Some(line) {
            "   |".to_string()
        } else {
            format!("{line:04}")
        };
        last_line = Some(line);
        offset = instruction(&mut out, chunk, offset, &line_col, &indent, level);
    }
    out
}

/// Render the instruction at `offset`; returns the next offset.
fn instruction(
    out: &mut String,
    chunk: &Chunk,
    offset: usize,
    line_col: &str,
    indent: &str,
    level: usize,
) -> usize {
    let code = chunk.code();
    let byte = code[offset];
    let Ok(op) = OpCode::try_from(byte) else {
        let _ = writeln!(out, "{indent}{offset:04} {line_col} OP_UNKNOWN({byte})");
        return offset + 1;
    };

    let _ = write!(out, "{indent}{offset:04} {line_col} ");
    match op.operand_kind() {
        OperandKind::None => {
            let _ = writeln!(out, "{}", op.name());
            offset + 1
        }
        OperandKind::Byte => {
            let operand = code[offset + 1];
            let _ = writeln!(out, "{:<16} {operand:4}", op.name());
            offset + 2
        }
        OperandKind::Short => {
            let operand = chunk.read_short(offset) as usize;
            let target = if op == OpCode::Loop {
                offset + 3 - operand
            } else {
                offset + 3 + operand
            };
            let _ = writeln!(out, "{:<16} {operand:4} -> {target}", op.name());
            offset + 3
        }
        OperandKind::Constant if op == OpCode::Closure => {
            closure_instruction(out, chunk, offset, indent, level)
        }
        OperandKind::Constant => {
            let operand = code[offset + 1] as usize;
            let constant = chunk.constants()[operand];
            let _ = writeln!(out, "{:<16} {operand:4} '{constant}'", op.name());
            offset + 2
        }
    }
}

/// `OP_CLOSURE` carries the function constant, the inline upvalue
/// descriptors, and is followed by the nested function's own dump.
fn closure_instruction(
    out: &mut String,
    chunk: &Chunk,
    offset: usize,
    indent: &str,
    level: usize,
) -> usize {
    let operand = chunk.code()[offset + 1] as usize;
    let constant = chunk.constants()[operand];
    let _ = writeln!(out, "{:<16} {operand:4} {constant}", OpCode::Closure.name());

    let function = unsafe { (*constant.as_obj()).as_function() };
    let mut next = offset + 2;
    for _ in 0..function.upvalue_count {
        let is_local = chunk.code()[next] != 0;
        let index = chunk.code()[next + 1];
        let kind = if is_local { "local" } else { "upvalue" };
        let _ = writeln!(out, "{indent}{next:04}    |   {kind} {index},");
        next += 2;
    }

    out.push_str(&dump(
        function.chunk(),
        &function.describe(),
        level + 1,
    ));
    next
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::Value;

    #[test]
    fn test_simple_listing_with_line_repeats() {
        let mut chunk = Chunk::new();
        let constant = chunk.add_constant(Value::from(2.0));
        chunk.write(OpCode::Constant, 1);
        chunk.write_byte(constant as u8, 1);
        chunk.write(OpCode::Print, 1);
        chunk.write(OpCode::Nil, 2);
        chunk.write(OpCode::Return, 2);

        let expected = "\
== <script> ==
0000 0001 OP_CONSTANT         0 '2.000000'
0002    | OP_PRINT
0003 0002 OP_NIL
0004    | OP_RETURN
";
        assert_eq!(disassemble(&chunk, "<script>"), expected);
    }

    #[test]
    fn test_jump_targets() {
        let mut chunk = Chunk::new();
        chunk.write(OpCode::JumpIfFalse, 1);
        chunk.write_short(2, 1);
        chunk.write(OpCode::Pop, 1);
        chunk.write(OpCode::Nil, 1);
        chunk.write(OpCode::Loop, 1);
        chunk.write_short(8, 1);

        let listing = disassemble(&chunk, "jumps");
        assert!(listing.contains("0000 0001 OP_JUMP_IF_FALSE    2 -> 5"));
        assert!(listing.contains("0005    | OP_LOOP             8 -> 0"));
    }

    #[test]
    fn test_byte_operand_alignment() {
        let mut chunk = Chunk::new();
        chunk.write(OpCode::GetLocal, 7);
        chunk.write_byte(1, 7);
        let listing = disassemble(&chunk, "locals");
        assert!(listing.contains("0000 0007 OP_GET_LOCAL        1"));
    }
}
