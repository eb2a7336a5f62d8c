//! Single-pass Pratt compiler
//!
//! Parsing and code emission are interleaved; there is no AST. A parse
//! rule table maps each token kind to an optional prefix action, an
//! optional infix action, and an infix precedence;
//! `parse_precedence` drives the two against the token stream.
//!
//! Function declarations open a nested compilation context with its own
//! locals, upvalues, and scope depth; the enclosing chunk receives a
//! `Closure` opcode followed by the inline upvalue descriptors. Every
//! in-progress function object is reported to the collector at each
//! allocation point, so compiling under GC pressure is safe.
//!
//! Errors never unwind. The first error per statement flips panic mode,
//! which suppresses the cascade until the parser re-synchronizes at a
//! statement boundary. `compile` returns no function if any error was
//! recorded.

use lox_core::{Chunk, Heap, Obj, OpCode, Tracer, Value};

use crate::scanner::{self, TokenKind, Token};

const MAX_LOCALS: usize = 256;
const MAX_UPVALUES: usize = 256;
const MAX_CONSTANTS: usize = 256;
const MAX_ARITY: usize = 255;
const MAX_JUMP: usize = u16::MAX as usize;

/// Compile `source` to a top-level script function allocated on `heap`.
/// On any error the diagnostics are returned joined with newlines and
/// no function is produced.
pub fn compile(source: &str, heap: &mut Heap) -> Result<*mut Obj, String> {
    compile_with_roots(source, heap, &mut |_| {})
}

/// Like [`compile`], with extra GC roots. An embedder whose heap
/// already holds reachable objects (the VM's globals, say) must mark
/// them here or a mid-compile collection could sweep them.
pub fn compile_with_roots(
    source: &str,
    heap: &mut Heap,
    extra_roots: &mut dyn FnMut(&mut Tracer),
) -> Result<*mut Obj, String> {
    let tokens = scanner::scan(source);
    let mut compiler = Compiler {
        heap,
        extra_roots,
        tokens,
        prev: 0,
        cur: 0,
        had_error: false,
        panic_mode: false,
        errors: Vec::new(),
        contexts: Vec::new(),
    };
    compiler.begin_context(FunctionKind::Script);
    compiler.skip_error_tokens();
    while !compiler.match_token(TokenKind::Eof) {
        compiler.declaration();
    }
    let (function, _) = compiler.end_context();
    if compiler.had_error {
        Err(compiler.errors.join("\n"))
    } else {
        Ok(function)
    }
}

/// Infix binding power, weakest first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum Precedence {
    None,
    Assignment, // =
    Or,         // or
    And,        // and
    Equality,   // == !=
    Comparison, // < > <= >=
    Term,       // + -
    Factor,     // * /
    Unary,      // ! -
    Call,       // ()
    Primary,
}

impl Precedence {
    fn next(self) -> Precedence {
        match self {
            Precedence::None => Precedence::Assignment,
            Precedence::Assignment => Precedence::Or,
            Precedence::Or => Precedence::And,
            Precedence::And => Precedence::Equality,
            Precedence::Equality => Precedence::Comparison,
            Precedence::Comparison => Precedence::Term,
            Precedence::Term => Precedence::Factor,
            Precedence::Factor => Precedence::Unary,
            Precedence::Unary => Precedence::Call,
            Precedence::Call | Precedence::Primary => Precedence::Primary,
        }
    }
}

type ParseFn = for<'a, 'c> fn(&'a mut Compiler<'c>, bool);

struct ParseRule {
    prefix: Option<ParseFn>,
    infix: Option<ParseFn>,
    precedence: Precedence,
}

/// The Pratt table. Tokens without rules (keywords, punctuation) parse
/// as "Expect expression." when they show up in prefix position.
fn rule(kind: TokenKind) -> ParseRule {
    let (prefix, infix, precedence): (Option<ParseFn>, Option<ParseFn>, Precedence) = match kind {
        TokenKind::LeftParen => (Some(grouping), Some(call), Precedence::Call),
        TokenKind::Minus => (Some(unary), Some(binary), Precedence::Term),
        TokenKind::Plus => (None, Some(binary), Precedence::Term),
        TokenKind::Slash | TokenKind::Star => (None, Some(binary), Precedence::Factor),
        TokenKind::Bang => (Some(unary), None, Precedence::None),
        TokenKind::BangEqual | TokenKind::EqualEqual => {
            (None, Some(binary), Precedence::Equality)
        }
        TokenKind::Greater
        | TokenKind::GreaterEqual
        | TokenKind::Less
        | TokenKind::LessEqual => (None, Some(binary), Precedence::Comparison),
        TokenKind::Identifier => (Some(variable), None, Precedence::None),
        TokenKind::Number => (Some(number), None, Precedence::None),
        TokenKind::String => (Some(string_literal), None, Precedence::None),
        TokenKind::Nil | TokenKind::True | TokenKind::False => {
            (Some(literal), None, Precedence::None)
        }
        TokenKind::And => (None, Some(and_op), Precedence::And),
        TokenKind::Or => (None, Some(or_op), Precedence::Or),
        _ => (None, None, Precedence::None),
    };
    ParseRule {
        prefix,
        infix,
        precedence,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FunctionKind {
    Script,
    Function,
}

struct Local {
    name: String,
    /// Block nesting depth, or -1 while declared but uninitialized.
    depth: i32,
    is_captured: bool,
}

#[derive(Clone, Copy, PartialEq, Eq)]
struct UpvalueDesc {
    index: u8,
    is_local: bool,
}

/// One function being compiled. The outermost context is the script.
struct FunctionContext {
    function: *mut Obj,
    kind: FunctionKind,
    locals: Vec<Local>,
    upvalues: Vec<UpvalueDesc>,
    scope_depth: i32,
}

pub struct Compiler<'c> {
    heap: &'c mut Heap,
    extra_roots: &'c mut dyn FnMut(&mut Tracer),
    tokens: Vec<Token>,
    prev: usize,
    cur: usize,
    had_error: bool,
    panic_mode: bool,
    errors: Vec<String>,
    contexts: Vec<FunctionContext>,
}

// Parse rule actions. Free functions so they coerce to `ParseFn`.

fn grouping(c: &mut Compiler, _can_assign: bool) {
    c.expression();
    c.consume(TokenKind::RightParen, "Expect ')' after expression.");
}

fn number(c: &mut Compiler, _can_assign: bool) {
    match c.tokens[c.prev].lexeme.parse::<f64>() {
        Ok(value) => c.emit_constant(Value::from(value)),
        Err(_) => c.error("Invalid number."),
    }
}

fn string_literal(c: &mut Compiler, _can_assign: bool) {
    let text = c.tokens[c.prev].lexeme.clone();
    let string = c.intern(&text);
    c.emit_constant(Value::from(string));
}

fn literal(c: &mut Compiler, _can_assign: bool) {
    match c.tokens[c.prev].kind {
        TokenKind::Nil => c.emit(OpCode::Nil),
        TokenKind::True => c.emit(OpCode::True),
        TokenKind::False => c.emit(OpCode::False),
        _ => unreachable!("literal rule on non-literal token"),
    }
}

fn variable(c: &mut Compiler, can_assign: bool) {
    let name = c.tokens[c.prev].lexeme.clone();
    c.named_variable(&name, can_assign);
}

fn unary(c: &mut Compiler, _can_assign: bool) {
    let operator = c.tokens[c.prev].kind;
    c.parse_precedence(Precedence::Unary);
    match operator {
        TokenKind::Minus => c.emit(OpCode::Negate),
        TokenKind::Bang => c.emit(OpCode::Not),
        _ => unreachable!("unary rule on non-unary token"),
    }
}

fn binary(c: &mut Compiler, _can_assign: bool) {
    let operator = c.tokens[c.prev].kind;
    c.parse_precedence(rule(operator).precedence.next());
    match operator {
        TokenKind::Plus => c.emit(OpCode::Add),
        TokenKind::Minus => c.emit(OpCode::Subtract),
        TokenKind::Star => c.emit(OpCode::Multiply),
        TokenKind::Slash => c.emit(OpCode::Divide),
        TokenKind::EqualEqual => c.emit(OpCode::Equal),
        TokenKind::BangEqual => {
            c.emit(OpCode::Equal);
            c.emit(OpCode::Not);
        }
        TokenKind::Greater => c.emit(OpCode::Greater),
        TokenKind::GreaterEqual => {
            c.emit(OpCode::Less);
            c.emit(OpCode::Not);
        }
        TokenKind::Less => c.emit(OpCode::Less),
        TokenKind::LessEqual => {
            c.emit(OpCode::Greater);
            c.emit(OpCode::Not);
        }
        _ => unreachable!("binary rule on non-binary token"),
    }
}

/// `and` short-circuits through the condition left on the stack by
/// `JumpIfFalse`; only the taken path pops it.
fn and_op(c: &mut Compiler, _can_assign: bool) {
    let end_jump = c.emit_jump(OpCode::JumpIfFalse);
    c.emit(OpCode::Pop);
    c.parse_precedence(Precedence::And);
    c.patch_jump(end_jump);
}

fn or_op(c: &mut Compiler, _can_assign: bool) {
    let else_jump = c.emit_jump(OpCode::JumpIfFalse);
    let end_jump = c.emit_jump(OpCode::Jump);
    c.patch_jump(else_jump);
    c.emit(OpCode::Pop);
    c.parse_precedence(Precedence::Or);
    c.patch_jump(end_jump);
}

fn call(c: &mut Compiler, _can_assign: bool) {
    let arg_count = c.argument_list();
    c.emit_with_byte(OpCode::Call, arg_count);
}

impl<'c> Compiler<'c> {
    // Token plumbing.

    fn cur_kind(&self) -> TokenKind {
        self.tokens[self.cur].kind
    }

    fn advance(&mut self) {
        self.prev = self.cur;
        if self.cur + 1 < self.tokens.len() {
            self.cur += 1;
        }
        self.skip_error_tokens();
    }

    /// Scan error tokens surface as diagnostics the moment the parser
    /// reaches them, then are skipped.
    fn skip_error_tokens(&mut self) {
        while self.cur_kind() == TokenKind::Error {
            let message = self.tokens[self.cur].lexeme.clone();
            self.error_at(self.cur, &message);
            if self.cur + 1 < self.tokens.len() {
                self.cur += 1;
            } else {
                break;
            }
        }
    }

    fn check(&self, kind: TokenKind) -> bool {
        self.cur_kind() == kind
    }

    fn match_token(&mut self, kind: TokenKind) -> bool {
        if !self.check(kind) {
            return false;
        }
        self.advance();
        true
    }

    fn consume(&mut self, kind: TokenKind, message: &str) {
        if self.check(kind) {
            self.advance();
        } else {
            self.error_at_current(message);
        }
    }

    // Error reporting.

    fn error(&mut self, message: &str) {
        self.error_at(self.prev, message);
    }

    fn error_at_current(&mut self, message: &str) {
        self.error_at(self.cur, message);
    }

    fn error_at(&mut self, index: usize, message: &str) {
        if self.panic_mode {
            return;
        }
        self.panic_mode = true;
        self.had_error = true;
        let token = &self.tokens[index];
        let diagnostic = match token.kind {
            TokenKind::Eof => format!("[line {}] Error at end: {message}", token.line),
            TokenKind::Error => format!("[line {}] Error: {message}", token.line),
            _ => format!(
                "[line {}] Error at '{}': {message}",
                token.line, token.lexeme
            ),
        };
        self.errors.push(diagnostic);
    }

    /// Discard tokens until a statement boundary, then resume clean.
    fn synchronize(&mut self) {
        self.panic_mode = false;
        while self.cur_kind() != TokenKind::Eof {
            if self.tokens[self.prev].kind == TokenKind::Semicolon {
                return;
            }
            match self.cur_kind() {
                TokenKind::Class
                | TokenKind::Fun
                | TokenKind::Var
                | TokenKind::For
                | TokenKind::If
                | TokenKind::While
                | TokenKind::Print
                | TokenKind::Return => return,
                _ => {}
            }
            self.advance();
        }
    }

    // Contexts and the heap.

    fn ctx(&self) -> &FunctionContext {
        self.contexts.last().expect("active function context")
    }

    fn ctx_mut(&mut self) -> &mut FunctionContext {
        self.contexts.last_mut().expect("active function context")
    }

    fn current_chunk(&mut self) -> &mut Chunk {
        let function = self.ctx().function;
        unsafe { (*function).as_function_mut().chunk_mut() }
    }

    /// GC-safe interning: collection may run here, rooted in every
    /// in-progress function plus the embedder's extra roots.
    fn intern(&mut self, text: &str) -> *mut Obj {
        self.gc_safe_point();
        self.heap.make_string(text)
    }

    fn gc_safe_point(&mut self) {
        let Compiler {
            heap,
            contexts,
            extra_roots,
            ..
        } = self;
        heap.maybe_collect(|tracer| {
            for context in contexts.iter() {
                tracer.mark_object(context.function);
            }
            (extra_roots)(tracer);
        });
    }

    /// Open a compilation context. Slot 0 of every function is reserved
    /// with an empty name. Named functions pick up the identifier just
    /// consumed.
    fn begin_context(&mut self, kind: FunctionKind) {
        self.gc_safe_point();
        let function = self.heap.make_function();
        self.contexts.push(FunctionContext {
            function,
            kind,
            locals: vec![Local {
                name: String::new(),
                depth: 0,
                is_captured: false,
            }],
            upvalues: Vec::new(),
            scope_depth: 0,
        });
        if kind != FunctionKind::Script {
            let name = self.tokens[self.prev].lexeme.clone();
            let name_obj = self.intern(&name);
            unsafe {
                (*function).as_function_mut().name = name_obj;
            }
        }
    }

    /// Seal the current function (implicit `nil` return) and pop its
    /// context, handing back the function and its upvalue descriptors.
    fn end_context(&mut self) -> (*mut Obj, Vec<UpvalueDesc>) {
        self.emit_return();
        let context = self.contexts.pop().expect("active function context");
        (context.function, context.upvalues)
    }

    // Emission helpers. Bytecode is attributed to the line of the token
    // just consumed.

    fn emit(&mut self, op: OpCode) {
        let line = self.tokens[self.prev].line;
        self.current_chunk().write(op, line);
    }

    fn emit_with_byte(&mut self, op: OpCode, operand: u8) {
        let line = self.tokens[self.prev].line;
        let chunk = self.current_chunk();
        chunk.write(op, line);
        chunk.write_byte(operand, line);
    }

    fn emit_return(&mut self) {
        self.emit(OpCode::Nil);
        self.emit(OpCode::Return);
    }

    fn emit_constant(&mut self, value: Value) {
        let constant = self.make_constant(value);
        self.emit_with_byte(OpCode::Constant, constant);
    }

    fn make_constant(&mut self, value: Value) -> u8 {
        if self.current_chunk().constants().len() >= MAX_CONSTANTS {
            self.error("Too many constants in one chunk.");
            return 0;
        }
        self.current_chunk().add_constant(value) as u8
    }

    /// Emit a jump with a placeholder operand; returns the opcode
    /// position for `patch_jump`.
    fn emit_jump(&mut self, op: OpCode) -> usize {
        let line = self.tokens[self.prev].line;
        let chunk = self.current_chunk();
        let pos = chunk.write(op, line);
        chunk.write_short(0xffff, line);
        pos
    }

    /// Point the jump at `pos` to the current end of code.
    fn patch_jump(&mut self, pos: usize) {
        let jump = self.current_chunk().code().len() - pos - 3;
        if jump > MAX_JUMP {
            self.error("Too much code to jump over.");
            return;
        }
        self.current_chunk().patch(pos, jump as u16);
    }

    /// Emit a backwards jump to `start`.
    fn emit_loop(&mut self, start: usize) {
        let offset = self.current_chunk().code().len() + 3 - start;
        if offset > MAX_JUMP {
            self.error("Loop body too large.");
            return;
        }
        let line = self.tokens[self.prev].line;
        let chunk = self.current_chunk();
        chunk.write(OpCode::Loop, line);
        chunk.write_short(offset as u16, line);
    }

    // Declarations and statements.

    fn declaration(&mut self) {
        if self.match_token(TokenKind::Fun) {
            self.fun_declaration();
        } else if self.match_token(TokenKind::Var) {
            self.var_declaration();
        } else {
            self.statement();
        }
        if self.panic_mode {
            self.synchronize();
        }
    }

    fn statement(&mut self) {
        if self.match_token(TokenKind::Print) {
            self.print_statement();
        } else if self.match_token(TokenKind::If) {
            self.if_statement();
        } else if self.match_token(TokenKind::While) {
            self.while_statement();
        } else if self.match_token(TokenKind::For) {
            self.for_statement();
        } else if self.match_token(TokenKind::Return) {
            self.return_statement();
        } else if self.match_token(TokenKind::LeftBrace) {
            self.begin_scope();
            self.block();
            self.end_scope();
        } else {
            self.expression_statement();
        }
    }

    fn block(&mut self) {
        while !self.check(TokenKind::RightBrace) && !self.check(TokenKind::Eof) {
            self.declaration();
        }
        self.consume(TokenKind::RightBrace, "Expect '}' after block.");
    }

    fn var_declaration(&mut self) {
        let global = self.parse_variable("Expect variable name.");
        if self.match_token(TokenKind::Equal) {
            self.expression();
        } else {
            self.emit(OpCode::Nil);
        }
        self.consume(
            TokenKind::Semicolon,
            "Expect ';' after variable declaration.",
        );
        self.define_variable(global);
    }

    fn fun_declaration(&mut self) {
        let global = self.parse_variable("Expect function name.");
        // A function may refer to itself; it is initialized before its
        // body compiles.
        self.mark_initialized();
        self.function(FunctionKind::Function);
        self.define_variable(global);
    }

    fn function(&mut self, kind: FunctionKind) {
        self.begin_context(kind);
        self.begin_scope();
        self.consume(TokenKind::LeftParen, "Expect '(' after function name.");
        if !self.check(TokenKind::RightParen) {
            loop {
                let arity = unsafe { (*self.ctx().function).as_function().arity };
                if arity >= MAX_ARITY {
                    self.error_at_current("Cannot have more than 255 parameters.");
                }
                unsafe {
                    (*self.ctx().function).as_function_mut().arity += 1;
                }
                let constant = self.parse_variable("Expect parameter name.");
                self.define_variable(constant);
                if !self.match_token(TokenKind::Comma) {
                    break;
                }
            }
        }
        self.consume(TokenKind::RightParen, "Expect ')' after parameters.");
        self.consume(TokenKind::LeftBrace, "Expect '{' before function body.");
        self.block();

        // No end_scope: the context ends wholesale, and Return closes
        // any captured locals at runtime.
        let (function, upvalues) = self.end_context();
        let constant = self.make_constant(Value::from(function));
        self.emit_with_byte(OpCode::Closure, constant);
        let line = self.tokens[self.prev].line;
        for upvalue in upvalues {
            let chunk = self.current_chunk();
            chunk.write_byte(u8::from(upvalue.is_local), line);
            chunk.write_byte(upvalue.index, line);
        }
    }

    fn print_statement(&mut self) {
        self.expression();
        self.consume(TokenKind::Semicolon, "Expect ';' after value.");
        self.emit(OpCode::Print);
    }

    fn expression_statement(&mut self) {
        self.expression();
        self.consume(TokenKind::Semicolon, "Expect ';' after expression.");
        self.emit(OpCode::Pop);
    }

    fn if_statement(&mut self) {
        self.consume(TokenKind::LeftParen, "Expect '(' after 'if'.");
        self.expression();
        self.consume(TokenKind::RightParen, "Expect ')' after condition.");

        // JumpIfFalse leaves the condition on the stack; both arms pop
        // it explicitly.
        let then_jump = self.emit_jump(OpCode::JumpIfFalse);
        self.emit(OpCode::Pop);
        self.statement();
        let else_jump = self.emit_jump(OpCode::Jump);
        self.patch_jump(then_jump);
        self.emit(OpCode::Pop);
        if self.match_token(TokenKind::Else) {
            self.statement();
        }
        self.patch_jump(else_jump);
    }

    fn while_statement(&mut self) {
        let loop_start = self.current_chunk().code().len();
        self.consume(TokenKind::LeftParen, "Expect '(' after 'while'.");
        self.expression();
        self.consume(TokenKind::RightParen, "Expect ')' after condition.");

        let exit_jump = self.emit_jump(OpCode::JumpIfFalse);
        self.emit(OpCode::Pop);
        self.statement();
        self.emit_loop(loop_start);
        self.patch_jump(exit_jump);
        self.emit(OpCode::Pop);
    }

    /// `for` desugars at emit time: initializer, condition at loop
    /// start, body, increment, jump back.
    fn for_statement(&mut self) {
        self.begin_scope();
        self.consume(TokenKind::LeftParen, "Expect '(' after 'for'.");
        if self.match_token(TokenKind::Semicolon) {
            // No initializer.
        } else if self.match_token(TokenKind::Var) {
            self.var_declaration();
        } else {
            self.expression_statement();
        }

        let mut loop_start = self.current_chunk().code().len();
        let mut exit_jump = None;
        if !self.match_token(TokenKind::Semicolon) {
            self.expression();
            self.consume(TokenKind::Semicolon, "Expect ';' after loop condition.");
            exit_jump = Some(self.emit_jump(OpCode::JumpIfFalse));
            self.emit(OpCode::Pop);
        }

        if !self.match_token(TokenKind::RightParen) {
            let body_jump = self.emit_jump(OpCode::Jump);
            let increment_start = self.current_chunk().code().len();
            self.expression();
            self.emit(OpCode::Pop);
            self.consume(TokenKind::RightParen, "Expect ')' after for clauses.");
            self.emit_loop(loop_start);
            loop_start = increment_start;
            self.patch_jump(body_jump);
        }

        self.statement();
        self.emit_loop(loop_start);
        if let Some(exit) = exit_jump {
            self.patch_jump(exit);
            self.emit(OpCode::Pop);
        }
        self.end_scope();
    }

    fn return_statement(&mut self) {
        if self.ctx().kind == FunctionKind::Script {
            self.error("Cannot return from top-level code.");
        }
        if self.match_token(TokenKind::Semicolon) {
            self.emit_return();
        } else {
            self.expression();
            self.consume(TokenKind::Semicolon, "Expect ';' after return value.");
            self.emit(OpCode::Return);
        }
    }

    // Expressions.

    fn expression(&mut self) {
        self.parse_precedence(Precedence::Assignment);
    }

    fn parse_precedence(&mut self, precedence: Precedence) {
        self.advance();
        let Some(prefix) = rule(self.tokens[self.prev].kind).prefix else {
            self.error("Expect expression.");
            return;
        };
        let can_assign = precedence <= Precedence::Assignment;
        prefix(self, can_assign);

        while precedence <= rule(self.cur_kind()).precedence {
            self.advance();
            if let Some(infix) = rule(self.tokens[self.prev].kind).infix {
                infix(self, can_assign);
            }
        }

        if can_assign && self.match_token(TokenKind::Equal) {
            self.error("Invalid assignment target.");
        }
    }

    fn argument_list(&mut self) -> u8 {
        let mut count: usize = 0;
        if !self.check(TokenKind::RightParen) {
            loop {
                self.expression();
                if count == MAX_ARITY {
                    self.error("Cannot have more than 255 arguments.");
                }
                count += 1;
                if !self.match_token(TokenKind::Comma) {
                    break;
                }
            }
        }
        self.consume(TokenKind::RightParen, "Expect ')' after arguments.");
        count.min(MAX_ARITY) as u8
    }

    // Variables, scopes, and upvalues.

    fn begin_scope(&mut self) {
        self.ctx_mut().scope_depth += 1;
    }

    /// Leaving a scope pops its locals; a captured local is closed into
    /// its upvalue instead.
    fn end_scope(&mut self) {
        self.ctx_mut().scope_depth -= 1;
        loop {
            let context = self.ctx();
            let Some(local) = context.locals.last() else {
                break;
            };
            if local.depth <= context.scope_depth {
                break;
            }
            let captured = local.is_captured;
            if captured {
                self.emit(OpCode::CloseUpvalue);
            } else {
                self.emit(OpCode::Pop);
            }
            self.ctx_mut().locals.pop();
        }
    }

    /// Consume a variable name; locals are declared here, globals get a
    /// name constant.
    fn parse_variable(&mut self, message: &str) -> u8 {
        self.consume(TokenKind::Identifier, message);
        self.declare_variable();
        if self.ctx().scope_depth > 0 {
            return 0;
        }
        let name = self.tokens[self.prev].lexeme.clone();
        self.identifier_constant(&name)
    }

    fn identifier_constant(&mut self, name: &str) -> u8 {
        let string = self.intern(name);
        self.make_constant(Value::from(string))
    }

    fn declare_variable(&mut self) {
        if self.ctx().scope_depth == 0 {
            return;
        }
        let name = self.tokens[self.prev].lexeme.clone();
        let context = self.ctx();
        let mut duplicate = false;
        for local in context.locals.iter().rev() {
            if local.depth != -1 && local.depth < context.scope_depth {
                break;
            }
            if local.name == name {
                duplicate = true;
                break;
            }
        }
        if duplicate {
            self.error("Already a variable with this name in this scope.");
        }
        self.add_local(name);
    }

    fn add_local(&mut self, name: String) {
        if self.ctx().locals.len() >= MAX_LOCALS {
            self.error("Too many local variables in function.");
            return;
        }
        self.ctx_mut().locals.push(Local {
            name,
            depth: -1,
            is_captured: false,
        });
    }

    fn mark_initialized(&mut self) {
        let context = self.ctx_mut();
        if context.scope_depth == 0 {
            return;
        }
        let depth = context.scope_depth;
        if let Some(local) = context.locals.last_mut() {
            local.depth = depth;
        }
    }

    fn define_variable(&mut self, global: u8) {
        if self.ctx().scope_depth > 0 {
            self.mark_initialized();
            return;
        }
        self.emit_with_byte(OpCode::DefineGlobal, global);
    }

    fn named_variable(&mut self, name: &str, can_assign: bool) {
        let context = self.contexts.len() - 1;
        let (get_op, set_op, arg) = if let Some(slot) = self.resolve_local(context, name) {
            (OpCode::GetLocal, OpCode::SetLocal, slot)
        } else if let Some(index) = self.resolve_upvalue(context, name) {
            (OpCode::GetUpvalue, OpCode::SetUpvalue, index)
        } else {
            let constant = self.identifier_constant(name);
            (OpCode::GetGlobal, OpCode::SetGlobal, constant)
        };

        if can_assign && self.match_token(TokenKind::Equal) {
            self.expression();
            self.emit_with_byte(set_op, arg);
        } else {
            self.emit_with_byte(get_op, arg);
        }
    }

    fn resolve_local(&mut self, context: usize, name: &str) -> Option<u8> {
        let found = self.contexts[context]
            .locals
            .iter()
            .rposition(|local| local.name == name)?;
        if self.contexts[context].locals[found].depth == -1 {
            self.error("Cannot read local variable in its own initializer.");
        }
        Some(found as u8)
    }

    /// Resolve `name` against enclosing functions. A hit in the direct
    /// parent captures that local; anything deeper threads an upvalue
    /// through each intermediate function.
    fn resolve_upvalue(&mut self, context: usize, name: &str) -> Option<u8> {
        if context == 0 {
            return None;
        }
        if let Some(local) = self.resolve_local(context - 1, name) {
            self.contexts[context - 1].locals[local as usize].is_captured = true;
            return self.add_upvalue(context, local, true);
        }
        if let Some(upvalue) = self.resolve_upvalue(context - 1, name) {
            return self.add_upvalue(context, upvalue, false);
        }
        None
    }

    fn add_upvalue(&mut self, context: usize, index: u8, is_local: bool) -> Option<u8> {
        let descriptor = UpvalueDesc { index, is_local };
        if let Some(existing) = self.contexts[context]
            .upvalues
            .iter()
            .position(|u| *u == descriptor)
        {
            return Some(existing as u8);
        }
        if self.contexts[context].upvalues.len() >= MAX_UPVALUES {
            self.error("Too many closure variables in function.");
            return Some(0);
        }
        self.contexts[context].upvalues.push(descriptor);
        let count = self.contexts[context].upvalues.len();
        unsafe {
            (*self.contexts[context].function)
                .as_function_mut()
                .upvalue_count = count;
        }
        Some((count - 1) as u8)
    }
}
