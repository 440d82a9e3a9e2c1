//! Single-pass compiler: scans, parses with Pratt precedence climbing, and
//! emits bytecode as it goes. There is no AST; locals, upvalues, class
//! scopes, and `break` targets are all resolved during the one pass.
//!
//! Errors never abort the pass. The parser enters panic mode, synchronizes
//! at the next statement boundary, and keeps going so one run can report
//! several diagnostics; compilation fails iff any error was recorded.

use std::mem;

use ahash::AHashSet;
use smallvec::SmallVec;

use super::{builder::ChunkBuilder, op::Opcode};
use crate::{
    error::{CompileError, ErrorAt},
    function::{Function, FunctionId, Functions},
    heap::Heap,
    scanner::{Scanner, Token, TokenKind, unescape_string},
    value::Value,
};

/// Compiles `source` into a top-level script function.
pub(crate) fn compile(
    source: &str,
    heap: &mut Heap,
    functions: &mut Functions,
) -> Result<FunctionId, Vec<CompileError>> {
    let mut compiler = Compiler::new(source, heap, functions);
    compiler.advance();
    while !compiler.match_token(TokenKind::Eof) {
        compiler.declaration();
    }
    let (id, _) = compiler.end_function();
    if compiler.errors.is_empty() {
        Ok(id)
    } else {
        Err(compiler.errors)
    }
}

/// Operator precedence, lowest first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum Precedence {
    None,
    Assignment, // =
    Or,         // or
    And,        // and
    Equality,   // == !=
    Comparison, // < > <= >=
    Term,       // + -
    Factor,     // * / %
    Unary,      // ! -
    Call,       // . () []
    Primary,
}

impl Precedence {
    /// The next-tighter level, used for left-associative binary operators.
    fn next(self) -> Self {
        match self {
            Self::None => Self::Assignment,
            Self::Assignment => Self::Or,
            Self::Or => Self::And,
            Self::And => Self::Equality,
            Self::Equality => Self::Comparison,
            Self::Comparison => Self::Term,
            Self::Term => Self::Factor,
            Self::Factor => Self::Unary,
            Self::Unary => Self::Call,
            Self::Call | Self::Primary => Self::Primary,
        }
    }
}

type ParseFn<'src, 'ctx> = fn(&mut Compiler<'src, 'ctx>, bool);

struct ParseRule<'src, 'ctx> {
    prefix: Option<ParseFn<'src, 'ctx>>,
    infix: Option<ParseFn<'src, 'ctx>>,
    precedence: Precedence,
}

/// What kind of function body is being compiled; drives `this`/`return`
/// validation and the implicit return value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FunctionKind {
    Script,
    Function,
    Method,
    Initializer,
}

#[derive(Debug)]
struct Local<'src> {
    name: &'src str,
    /// Scope depth, or -1 while declared but not yet defined. The gap is
    /// what makes `var x = x;` an error.
    depth: i32,
    is_const: bool,
    is_captured: bool,
}

#[derive(Debug, Clone, Copy)]
struct CompilerUpvalue {
    index: u8,
    is_local: bool,
    is_const: bool,
}

#[derive(Debug)]
struct LoopFrame {
    start: usize,
    scope_depth: i32,
    /// Jump operands emitted by `break`, patched when the loop ends.
    breaks: Vec<usize>,
}

const MAX_LOCALS: usize = 256;
const MAX_UPVALUES: usize = 256;

/// Per-function compilation state. Nested function declarations push a new
/// one and link back through `enclosing`.
struct FuncCompiler<'src> {
    enclosing: Option<Box<FuncCompiler<'src>>>,
    builder: ChunkBuilder,
    kind: FunctionKind,
    name: Option<&'src str>,
    arity: u8,
    locals: Vec<Local<'src>>,
    scope_depth: i32,
    upvalues: SmallVec<[CompilerUpvalue; 8]>,
    loops: Vec<LoopFrame>,
}

impl<'src> FuncCompiler<'src> {
    fn new(kind: FunctionKind, name: Option<&'src str>) -> Self {
        // Slot 0 belongs to the callee; methods use it for `this`.
        let slot_zero = Local {
            name: if matches!(kind, FunctionKind::Method | FunctionKind::Initializer) {
                "this"
            } else {
                ""
            },
            depth: 0,
            is_const: false,
            is_captured: false,
        };
        Self {
            enclosing: None,
            builder: ChunkBuilder::new(),
            kind,
            name,
            arity: 0,
            locals: vec![slot_zero],
            scope_depth: 0,
            upvalues: SmallVec::new(),
            loops: Vec::new(),
        }
    }

    /// Resolves `name` in this function's locals. `Err` carries the message
    /// for a read inside the variable's own initializer.
    fn resolve_local(&self, name: &str) -> Result<Option<(u8, bool)>, &'static str> {
        for (i, local) in self.locals.iter().enumerate().rev() {
            if local.name == name {
                if local.depth == -1 {
                    return Err("Can't read local variable in its own initializer.");
                }
                return Ok(Some((i as u8, local.is_const)));
            }
        }
        Ok(None)
    }

    /// Resolves `name` in enclosing functions, threading an upvalue through
    /// every function in between.
    fn resolve_upvalue(&mut self, name: &str) -> Result<Option<(u8, bool)>, &'static str> {
        let captured = {
            let Some(enclosing) = self.enclosing.as_deref_mut() else {
                return Ok(None);
            };
            if let Some((index, is_const)) = enclosing.resolve_local(name)? {
                enclosing.locals[index as usize].is_captured = true;
                Some((index, true, is_const))
            } else {
                enclosing
                    .resolve_upvalue(name)?
                    .map(|(index, is_const)| (index, false, is_const))
            }
        };
        match captured {
            Some((index, is_local, is_const)) => {
                let slot = self.add_upvalue(index, is_local, is_const)?;
                Ok(Some((slot, is_const)))
            }
            None => Ok(None),
        }
    }

    fn add_upvalue(&mut self, index: u8, is_local: bool, is_const: bool) -> Result<u8, &'static str> {
        for (i, upvalue) in self.upvalues.iter().enumerate() {
            if upvalue.index == index && upvalue.is_local == is_local {
                return Ok(i as u8);
            }
        }
        if self.upvalues.len() >= MAX_UPVALUES {
            return Err("Too many closure variables in function.");
        }
        self.upvalues.push(CompilerUpvalue {
            index,
            is_local,
            is_const,
        });
        Ok((self.upvalues.len() - 1) as u8)
    }
}

/// Tracks whether the class being compiled has a superclass, for
/// `this`/`super` validation.
struct ClassCompiler {
    has_superclass: bool,
}

pub(crate) struct Compiler<'src, 'ctx> {
    scanner: Scanner<'src>,
    current_token: Token<'src>,
    previous_token: Token<'src>,
    panic_mode: bool,
    errors: Vec<CompileError>,

    heap: &'ctx mut Heap,
    functions: &'ctx mut Functions,
    current: Box<FuncCompiler<'src>>,
    classes: Vec<ClassCompiler>,
    /// Globals declared `const` in this compilation unit; assignment to one
    /// is rejected at compile time.
    const_globals: AHashSet<&'src str>,
}

impl<'src, 'ctx> Compiler<'src, 'ctx> {
    fn new(source: &'src str, heap: &'ctx mut Heap, functions: &'ctx mut Functions) -> Self {
        Self {
            scanner: Scanner::new(source),
            current_token: Token::synthetic(""),
            previous_token: Token::synthetic(""),
            panic_mode: false,
            errors: Vec::new(),
            heap,
            functions,
            current: Box::new(FuncCompiler::new(FunctionKind::Script, None)),
            classes: Vec::new(),
            const_globals: AHashSet::new(),
        }
    }

    // --- token plumbing ---------------------------------------------------

    fn advance(&mut self) {
        self.previous_token = self.current_token;
        loop {
            self.current_token = self.scanner.next_token();
            if self.current_token.kind != TokenKind::Error {
                break;
            }
            let message = self.current_token.lexeme.to_owned();
            self.error_at_current(&message);
        }
    }

    fn consume(&mut self, kind: TokenKind, message: &str) {
        if self.current_token.kind == kind {
            self.advance();
        } else {
            self.error_at_current(message);
        }
    }

    fn check(&self, kind: TokenKind) -> bool {
        self.current_token.kind == kind
    }

    fn match_token(&mut self, kind: TokenKind) -> bool {
        if self.check(kind) {
            self.advance();
            true
        } else {
            false
        }
    }

    // --- error reporting --------------------------------------------------

    fn error(&mut self, message: &str) {
        self.error_at(self.previous_token, message);
    }

    fn error_at_current(&mut self, message: &str) {
        self.error_at(self.current_token, message);
    }

    fn error_at(&mut self, token: Token<'src>, message: &str) {
        if self.panic_mode {
            return;
        }
        self.panic_mode = true;
        let at = match token.kind {
            TokenKind::Eof => ErrorAt::End,
            TokenKind::Error => ErrorAt::Nowhere,
            _ => ErrorAt::Token(token.lexeme.to_owned()),
        };
        self.errors.push(CompileError {
            line: token.line,
            at,
            message: message.to_owned(),
        });
    }

    /// Skips forward to the next statement boundary after a parse error.
    fn synchronize(&mut self) {
        self.panic_mode = false;
        while self.current_token.kind != TokenKind::Eof {
            if self.previous_token.kind == TokenKind::Semicolon {
                return;
            }
            match self.current_token.kind {
                TokenKind::Class
                | TokenKind::Fun
                | TokenKind::Var
                | TokenKind::Const
                | TokenKind::For
                | TokenKind::If
                | TokenKind::While
                | TokenKind::Print
                | TokenKind::Return
                | TokenKind::Import
                | TokenKind::Export => return,
                _ => self.advance(),
            }
        }
    }

    // --- emission helpers -------------------------------------------------

    fn emit(&mut self, op: Opcode) {
        let line = self.previous_token.line;
        self.current.builder.set_line(line);
        self.current.builder.emit(op);
    }

    fn emit_u8(&mut self, op: Opcode, operand: u8) {
        let line = self.previous_token.line;
        self.current.builder.set_line(line);
        self.current.builder.emit_u8(op, operand);
    }

    fn emit_u8_u8(&mut self, op: Opcode, a: u8, b: u8) {
        let line = self.previous_token.line;
        self.current.builder.set_line(line);
        self.current.builder.emit_u8_u8(op, a, b);
    }

    fn emit_byte(&mut self, byte: u8) {
        self.current.builder.emit_byte(byte);
    }

    fn emit_constant(&mut self, value: Value) {
        let line = self.previous_token.line;
        self.current.builder.set_line(line);
        if let Err(message) = self.current.builder.emit_constant(value) {
            self.error(message);
        }
    }

    fn emit_jump(&mut self, op: Opcode) -> usize {
        let line = self.previous_token.line;
        self.current.builder.set_line(line);
        self.current.builder.emit_jump(op)
    }

    fn patch_jump(&mut self, operand_at: usize) {
        if let Err(message) = self.current.builder.patch_jump(operand_at) {
            self.error(message);
        }
    }

    fn emit_loop(&mut self, target: usize) {
        let line = self.previous_token.line;
        self.current.builder.set_line(line);
        if let Err(message) = self.current.builder.emit_loop(target) {
            self.error(message);
        }
    }

    fn emit_return(&mut self) {
        if self.current.kind == FunctionKind::Initializer {
            self.emit_u8(Opcode::GetLocal, 0);
        } else {
            self.emit(Opcode::Nil);
        }
        self.emit(Opcode::Return);
    }

    /// Adds a constant that must fit the 8-bit short form (names and
    /// functions); reports and returns 0 on overflow.
    fn make_constant_u8(&mut self, value: Value) -> u8 {
        match self.current.builder.add_constant(value) {
            Ok(index) => match u8::try_from(index) {
                Ok(short) => short,
                Err(_) => {
                    self.error("Too many constants in one chunk.");
                    0
                }
            },
            Err(message) => {
                self.error(message);
                0
            }
        }
    }

    /// Interns an identifier and stores it in the constant pool.
    fn identifier_constant(&mut self, name: &str) -> u8 {
        let id = self.heap.intern(name);
        self.make_constant_u8(Value::Ref(id))
    }

    // --- scopes and variables ---------------------------------------------

    fn begin_scope(&mut self) {
        self.current.scope_depth += 1;
    }

    fn end_scope(&mut self) {
        self.current.scope_depth -= 1;
        while let Some(local) = self.current.locals.last() {
            if local.depth <= self.current.scope_depth {
                break;
            }
            let op = if local.is_captured {
                Opcode::CloseUpvalue
            } else {
                Opcode::Pop
            };
            self.emit(op);
            self.current.locals.pop();
        }
    }

    fn declare_variable(&mut self, is_const: bool) {
        if self.current.scope_depth == 0 {
            return;
        }
        let name = self.previous_token.lexeme;
        for local in self.current.locals.iter().rev() {
            if local.depth != -1 && local.depth < self.current.scope_depth {
                break;
            }
            if local.name == name {
                self.error("Already a variable with this name in this scope.");
                break;
            }
        }
        if self.current.locals.len() >= MAX_LOCALS {
            self.error("Too many local variables in function.");
            return;
        }
        self.current.locals.push(Local {
            name,
            depth: -1,
            is_const,
            is_captured: false,
        });
    }

    /// Parses a variable name; returns its global name constant (0 for
    /// locals).
    fn parse_variable(&mut self, message: &str, is_const: bool) -> u8 {
        self.consume(TokenKind::Identifier, message);
        self.declare_variable(is_const);
        if self.current.scope_depth > 0 {
            return 0;
        }
        self.identifier_constant(self.previous_token.lexeme)
    }

    fn mark_initialized(&mut self) {
        if self.current.scope_depth == 0 {
            return;
        }
        if let Some(local) = self.current.locals.last_mut() {
            local.depth = self.current.scope_depth;
        }
    }

    fn define_variable(&mut self, global: u8) {
        if self.current.scope_depth > 0 {
            self.mark_initialized();
            return;
        }
        self.emit_u8(Opcode::DefineGlobal, global);
    }

    // --- declarations -----------------------------------------------------

    fn declaration(&mut self) {
        if self.match_token(TokenKind::Export) {
            self.export_declaration();
        } else if self.match_token(TokenKind::Class) {
            self.class_declaration(false);
        } else if self.match_token(TokenKind::Fun) {
            self.fun_declaration(false);
        } else if self.match_token(TokenKind::Var) {
            self.var_declaration(false, false);
        } else if self.match_token(TokenKind::Const) {
            self.var_declaration(true, false);
        } else {
            self.statement();
        }
        if self.panic_mode {
            self.synchronize();
        }
    }

    fn export_declaration(&mut self) {
        if self.current.scope_depth > 0 {
            self.error("Can't export from a local scope.");
        }
        if self.match_token(TokenKind::Class) {
            self.class_declaration(true);
        } else if self.match_token(TokenKind::Fun) {
            self.fun_declaration(true);
        } else if self.match_token(TokenKind::Var) {
            self.var_declaration(false, true);
        } else if self.match_token(TokenKind::Const) {
            self.var_declaration(true, true);
        } else {
            self.error_at_current("Expect declaration after 'export'.");
        }
    }

    fn var_declaration(&mut self, is_const: bool, exported: bool) {
        let global = self.parse_variable("Expect variable name.", is_const);
        let name = self.previous_token.lexeme;
        if self.match_token(TokenKind::Equal) {
            self.expression();
        } else if is_const {
            self.error("Const variable must be initialized.");
        } else {
            self.emit(Opcode::Nil);
        }
        self.consume(TokenKind::Semicolon, "Expect ';' after variable declaration.");
        if is_const && self.current.scope_depth == 0 {
            self.const_globals.insert(name);
        }
        self.define_variable(global);
        if exported {
            self.emit_u8(Opcode::Export, global);
        }
    }

    fn fun_declaration(&mut self, exported: bool) {
        let global = self.parse_variable("Expect function name.", false);
        let name = self.previous_token.lexeme;
        // Defined eagerly so the body can refer to itself for recursion.
        self.mark_initialized();
        self.function(FunctionKind::Function, Some(name));
        self.define_variable(global);
        if exported {
            self.emit_u8(Opcode::Export, global);
        }
    }

    fn function(&mut self, kind: FunctionKind, name: Option<&'src str>) {
        let enclosing = mem::replace(&mut self.current, Box::new(FuncCompiler::new(kind, name)));
        self.current.enclosing = Some(enclosing);
        self.begin_scope();

        let open_message = if name.is_some() {
            "Expect '(' after function name."
        } else {
            "Expect '(' after 'fun'."
        };
        self.consume(TokenKind::LeftParen, open_message);
        if !self.check(TokenKind::RightParen) {
            loop {
                if self.current.arity == u8::MAX {
                    self.error_at_current("Can't have more than 255 parameters.");
                } else {
                    self.current.arity += 1;
                }
                let constant = self.parse_variable("Expect parameter name.", false);
                self.define_variable(constant);
                if !self.match_token(TokenKind::Comma) {
                    break;
                }
            }
        }
        self.consume(TokenKind::RightParen, "Expect ')' after parameters.");
        self.consume(TokenKind::LeftBrace, "Expect '{' before function body.");
        self.block();

        let (id, upvalues) = self.end_function();
        let constant = self.make_constant_u8(Value::Function(id));
        self.emit_u8(Opcode::Closure, constant);
        for upvalue in upvalues {
            self.emit_byte(u8::from(upvalue.is_local));
            self.emit_byte(upvalue.index);
        }
    }

    /// Finishes the current function: emits the implicit return, registers
    /// the function, and pops back to the enclosing compiler.
    fn end_function(&mut self) -> (FunctionId, SmallVec<[CompilerUpvalue; 8]>) {
        self.emit_return();
        let mut finished = mem::replace(
            &mut self.current,
            Box::new(FuncCompiler::new(FunctionKind::Script, None)),
        );
        if let Some(enclosing) = finished.enclosing.take() {
            self.current = enclosing;
        }
        let name = finished.name.map(|n| self.heap.intern(n));
        let function = Function {
            arity: finished.arity,
            upvalue_count: finished.upvalues.len() as u8,
            name,
            chunk: finished.builder.build(),
        };
        (self.functions.add(function), finished.upvalues)
    }

    fn class_declaration(&mut self, exported: bool) {
        self.consume(TokenKind::Identifier, "Expect class name.");
        let class_name = self.previous_token;
        let name_constant = self.identifier_constant(class_name.lexeme);
        self.declare_variable(false);
        self.emit_u8(Opcode::Class, name_constant);
        self.define_variable(name_constant);

        self.classes.push(ClassCompiler { has_superclass: false });

        if self.match_token(TokenKind::Less) {
            self.consume(TokenKind::Identifier, "Expect superclass name.");
            self.variable(false);
            if class_name.lexeme == self.previous_token.lexeme {
                self.error("A class can't inherit from itself.");
            }
            // `super` lives in a scope wrapped around the methods so every
            // method closure captures it as an upvalue.
            self.begin_scope();
            self.add_synthetic_local("super");
            self.named_variable(class_name, false);
            self.emit(Opcode::Inherit);
            if let Some(class) = self.classes.last_mut() {
                class.has_superclass = true;
            }
        }

        self.named_variable(class_name, false);
        self.consume(TokenKind::LeftBrace, "Expect '{' before class body.");
        while !self.check(TokenKind::RightBrace) && !self.check(TokenKind::Eof) {
            self.method();
        }
        self.consume(TokenKind::RightBrace, "Expect '}' after class body.");
        self.emit(Opcode::Pop);

        let had_superclass = self.classes.pop().is_some_and(|c| c.has_superclass);
        if had_superclass {
            self.end_scope();
        }
        if exported {
            self.emit_u8(Opcode::Export, name_constant);
        }
    }

    /// Declares and immediately defines a local that has no source token
    /// (`super` in subclass scopes).
    fn add_synthetic_local(&mut self, name: &'src str) {
        if self.current.locals.len() >= MAX_LOCALS {
            self.error("Too many local variables in function.");
            return;
        }
        self.current.locals.push(Local {
            name,
            depth: self.current.scope_depth,
            is_const: false,
            is_captured: false,
        });
    }

    fn method(&mut self) {
        self.consume(TokenKind::Identifier, "Expect method name.");
        let name = self.previous_token.lexeme;
        let constant = self.identifier_constant(name);
        let kind = if name == "init" {
            FunctionKind::Initializer
        } else {
            FunctionKind::Method
        };
        self.function(kind, Some(name));
        self.emit_u8(Opcode::Method, constant);
    }

    // --- statements -------------------------------------------------------

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
        } else if self.match_token(TokenKind::Break) {
            self.break_statement();
        } else if self.match_token(TokenKind::Import) {
            self.import_statement();
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

    fn print_statement(&mut self) {
        self.expression();
        self.consume(TokenKind::Semicolon, "Expect ';' after value.");
        self.emit(Opcode::Print);
    }

    fn expression_statement(&mut self) {
        self.expression();
        self.consume(TokenKind::Semicolon, "Expect ';' after expression.");
        self.emit(Opcode::Pop);
    }

    fn if_statement(&mut self) {
        self.consume(TokenKind::LeftParen, "Expect '(' after 'if'.");
        self.expression();
        self.consume(TokenKind::RightParen, "Expect ')' after condition.");

        let then_jump = self.emit_jump(Opcode::JumpIfFalse);
        self.emit(Opcode::Pop);
        self.statement();
        let else_jump = self.emit_jump(Opcode::Jump);
        self.patch_jump(then_jump);
        self.emit(Opcode::Pop);
        if self.match_token(TokenKind::Else) {
            self.statement();
        }
        self.patch_jump(else_jump);
    }

    fn while_statement(&mut self) {
        let loop_start = self.current.builder.offset();
        self.consume(TokenKind::LeftParen, "Expect '(' after 'while'.");
        self.expression();
        self.consume(TokenKind::RightParen, "Expect ')' after condition.");

        let exit_jump = self.emit_jump(Opcode::JumpIfFalse);
        self.emit(Opcode::Pop);
        self.push_loop(loop_start);
        self.statement();
        self.emit_loop(loop_start);
        self.patch_jump(exit_jump);
        self.emit(Opcode::Pop);
        self.pop_loop();
    }

    fn for_statement(&mut self) {
        self.begin_scope();
        self.consume(TokenKind::LeftParen, "Expect '(' after 'for'.");
        if self.match_token(TokenKind::Semicolon) {
            // No initializer.
        } else if self.match_token(TokenKind::Var) {
            self.var_declaration(false, false);
        } else {
            self.expression_statement();
        }

        let mut loop_start = self.current.builder.offset();
        let mut exit_jump = None;
        if !self.match_token(TokenKind::Semicolon) {
            self.expression();
            self.consume(TokenKind::Semicolon, "Expect ';' after loop condition.");
            exit_jump = Some(self.emit_jump(Opcode::JumpIfFalse));
            self.emit(Opcode::Pop);
        }

        if !self.match_token(TokenKind::RightParen) {
            let body_jump = self.emit_jump(Opcode::Jump);
            let increment_start = self.current.builder.offset();
            self.expression();
            self.emit(Opcode::Pop);
            self.consume(TokenKind::RightParen, "Expect ')' after for clauses.");
            self.emit_loop(loop_start);
            loop_start = increment_start;
            self.patch_jump(body_jump);
        }

        self.push_loop(loop_start);
        self.statement();
        self.emit_loop(loop_start);
        if let Some(exit_jump) = exit_jump {
            self.patch_jump(exit_jump);
            self.emit(Opcode::Pop);
        }
        self.pop_loop();
        self.end_scope();
    }

    fn push_loop(&mut self, start: usize) {
        let scope_depth = self.current.scope_depth;
        self.current.loops.push(LoopFrame {
            start,
            scope_depth,
            breaks: Vec::new(),
        });
    }

    /// Ends the innermost loop, patching every pending `break` to land just
    /// past the loop's cleanup code.
    fn pop_loop(&mut self) {
        if let Some(frame) = self.current.loops.pop() {
            for operand_at in frame.breaks {
                self.patch_jump(operand_at);
            }
        }
    }

    fn break_statement(&mut self) {
        self.consume(TokenKind::Semicolon, "Expect ';' after 'break'.");
        let Some(frame) = self.current.loops.last() else {
            self.error("Can't use 'break' outside of a loop.");
            return;
        };
        let loop_depth = frame.scope_depth;
        // Discard locals declared inside the loop body without forgetting
        // them; the slow path back around the loop still owns them.
        let mut ops: SmallVec<[Opcode; 8]> = SmallVec::new();
        for local in self.current.locals.iter().rev() {
            if local.depth <= loop_depth {
                break;
            }
            ops.push(if local.is_captured {
                Opcode::CloseUpvalue
            } else {
                Opcode::Pop
            });
        }
        for op in ops {
            self.emit(op);
        }
        let jump = self.emit_jump(Opcode::Jump);
        if let Some(frame) = self.current.loops.last_mut() {
            frame.breaks.push(jump);
        }
    }

    fn return_statement(&mut self) {
        if self.current.kind == FunctionKind::Script {
            self.error("Can't return from top-level code.");
        }
        if self.match_token(TokenKind::Semicolon) {
            self.emit_return();
        } else {
            if self.current.kind == FunctionKind::Initializer {
                self.error("Can't return a value from an initializer.");
            }
            self.expression();
            self.consume(TokenKind::Semicolon, "Expect ';' after return value.");
            self.emit(Opcode::Return);
        }
    }

    fn import_statement(&mut self) {
        if self.check(TokenKind::String) {
            self.advance();
            let path = self.string_constant();
            self.consume(TokenKind::Semicolon, "Expect ';' after module path.");
            self.emit_u8(Opcode::Import, path);
            return;
        }

        let mut names: SmallVec<[u8; 8]> = SmallVec::new();
        loop {
            self.consume(TokenKind::Identifier, "Expect import name.");
            let constant = self.identifier_constant(self.previous_token.lexeme);
            names.push(constant);
            if !self.match_token(TokenKind::Comma) {
                break;
            }
        }
        self.consume(TokenKind::From, "Expect 'from' after import names.");
        self.consume(TokenKind::String, "Expect module path.");
        let path = self.string_constant();
        self.consume(TokenKind::Semicolon, "Expect ';' after module path.");
        for name in names {
            self.emit_u8_u8(Opcode::ImportFrom, path, name);
        }
    }

    /// Interns the just-consumed string literal and adds it as a short-form
    /// constant.
    fn string_constant(&mut self) -> u8 {
        let content = unescape_string(self.previous_token.lexeme);
        let id = self.heap.intern(&content);
        self.make_constant_u8(Value::Ref(id))
    }

    // --- expressions ------------------------------------------------------

    fn expression(&mut self) {
        self.parse_precedence(Precedence::Assignment);
    }

    fn parse_precedence(&mut self, precedence: Precedence) {
        self.advance();
        let Some(prefix) = rule(self.previous_token.kind).prefix else {
            self.error("Expect expression.");
            return;
        };
        let can_assign = precedence <= Precedence::Assignment;
        prefix(self, can_assign);

        while precedence <= rule(self.current_token.kind).precedence {
            self.advance();
            if let Some(infix) = rule(self.previous_token.kind).infix {
                infix(self, can_assign);
            }
        }

        if can_assign && self.match_token(TokenKind::Equal) {
            self.error("Invalid assignment target.");
        }
    }

    fn number(&mut self, _can_assign: bool) {
        match self.previous_token.lexeme.parse::<f64>() {
            Ok(n) => self.emit_constant(Value::Number(n)),
            Err(_) => self.error("Invalid number literal."),
        }
    }

    fn string(&mut self, _can_assign: bool) {
        let content = unescape_string(self.previous_token.lexeme);
        let id = self.heap.intern(&content);
        self.emit_constant(Value::Ref(id));
    }

    fn literal(&mut self, _can_assign: bool) {
        match self.previous_token.kind {
            TokenKind::Nil => self.emit(Opcode::Nil),
            TokenKind::True => self.emit(Opcode::True),
            TokenKind::False => self.emit(Opcode::False),
            _ => unreachable!("literal rule on non-literal token"),
        }
    }

    fn grouping(&mut self, _can_assign: bool) {
        self.expression();
        self.consume(TokenKind::RightParen, "Expect ')' after expression.");
    }

    fn unary(&mut self, _can_assign: bool) {
        let operator = self.previous_token.kind;
        self.parse_precedence(Precedence::Unary);
        match operator {
            TokenKind::Minus => self.emit(Opcode::Negate),
            TokenKind::Bang => self.emit(Opcode::Not),
            _ => unreachable!("unary rule on non-unary token"),
        }
    }

    fn binary(&mut self, _can_assign: bool) {
        let operator = self.previous_token.kind;
        self.parse_precedence(rule(operator).precedence.next());
        match operator {
            TokenKind::Plus => self.emit(Opcode::Add),
            TokenKind::Minus => self.emit(Opcode::Subtract),
            TokenKind::Star => self.emit(Opcode::Multiply),
            TokenKind::Slash => self.emit(Opcode::Divide),
            TokenKind::Percent => self.emit(Opcode::Modulo),
            TokenKind::EqualEqual => self.emit(Opcode::Equal),
            TokenKind::Greater => self.emit(Opcode::Greater),
            TokenKind::Less => self.emit(Opcode::Less),
            TokenKind::BangEqual => {
                self.emit(Opcode::Equal);
                self.emit(Opcode::Not);
            }
            // a <= b compiles as !(a > b); NaN operands therefore compare
            // "less or equal" here, unlike IEEE. Deliberate.
            TokenKind::LessEqual => {
                self.emit(Opcode::Greater);
                self.emit(Opcode::Not);
            }
            TokenKind::GreaterEqual => {
                self.emit(Opcode::Less);
                self.emit(Opcode::Not);
            }
            _ => unreachable!("binary rule on non-binary token"),
        }
    }

    fn and(&mut self, _can_assign: bool) {
        let end_jump = self.emit_jump(Opcode::JumpIfFalse);
        self.emit(Opcode::Pop);
        self.parse_precedence(Precedence::And);
        self.patch_jump(end_jump);
    }

    fn or(&mut self, _can_assign: bool) {
        let else_jump = self.emit_jump(Opcode::JumpIfFalse);
        let end_jump = self.emit_jump(Opcode::Jump);
        self.patch_jump(else_jump);
        self.emit(Opcode::Pop);
        self.parse_precedence(Precedence::Or);
        self.patch_jump(end_jump);
    }

    fn call(&mut self, _can_assign: bool) {
        let argc = self.argument_list();
        self.emit_u8(Opcode::Call, argc);
    }

    fn argument_list(&mut self) -> u8 {
        let mut argc: u8 = 0;
        if !self.check(TokenKind::RightParen) {
            loop {
                self.expression();
                if argc == u8::MAX {
                    self.error("Can't have more than 255 arguments.");
                } else {
                    argc += 1;
                }
                if !self.match_token(TokenKind::Comma) {
                    break;
                }
            }
        }
        self.consume(TokenKind::RightParen, "Expect ')' after arguments.");
        argc
    }

    fn dot(&mut self, can_assign: bool) {
        self.consume(TokenKind::Identifier, "Expect property name after '.'.");
        let name = self.identifier_constant(self.previous_token.lexeme);
        if can_assign && self.match_token(TokenKind::Equal) {
            self.expression();
            self.emit_u8(Opcode::SetProperty, name);
        } else if self.match_token(TokenKind::LeftParen) {
            let argc = self.argument_list();
            self.emit_u8_u8(Opcode::Invoke, name, argc);
        } else {
            self.emit_u8(Opcode::GetProperty, name);
        }
    }

    fn subscript(&mut self, can_assign: bool) {
        self.expression();
        self.consume(TokenKind::RightBracket, "Expect ']' after index.");
        if can_assign && self.match_token(TokenKind::Equal) {
            self.expression();
            self.emit(Opcode::StoreIndex);
        } else {
            self.emit(Opcode::Index);
        }
    }

    fn list(&mut self, _can_assign: bool) {
        let mut count: u8 = 0;
        if !self.check(TokenKind::RightBracket) {
            loop {
                self.expression();
                if count == u8::MAX {
                    self.error("Can't have more than 255 elements in a list literal.");
                } else {
                    count += 1;
                }
                if !self.match_token(TokenKind::Comma) {
                    break;
                }
            }
        }
        self.consume(TokenKind::RightBracket, "Expect ']' after list elements.");
        self.emit_u8(Opcode::BuildList, count);
    }

    fn map(&mut self, _can_assign: bool) {
        let mut count: u8 = 0;
        if !self.check(TokenKind::RightBrace) {
            loop {
                self.expression();
                self.consume(TokenKind::Colon, "Expect ':' after map key.");
                self.expression();
                if count == u8::MAX {
                    self.error("Can't have more than 255 entries in a map literal.");
                } else {
                    count += 1;
                }
                if !self.match_token(TokenKind::Comma) {
                    break;
                }
            }
        }
        self.consume(TokenKind::RightBrace, "Expect '}' after map entries.");
        self.emit_u8(Opcode::BuildMap, count);
    }

    fn lambda(&mut self, _can_assign: bool) {
        self.function(FunctionKind::Function, None);
    }

    fn variable(&mut self, can_assign: bool) {
        self.named_variable(self.previous_token, can_assign);
    }

    fn this(&mut self, _can_assign: bool) {
        if self.classes.is_empty() {
            self.error("Can't use 'this' outside of a class.");
            return;
        }
        self.variable(false);
    }

    fn super_(&mut self, _can_assign: bool) {
        match self.classes.last() {
            None => self.error("Can't use 'super' outside of a class."),
            Some(class) if !class.has_superclass => {
                self.error("Can't use 'super' in a class with no superclass.");
            }
            Some(_) => {}
        }
        let keyword = self.previous_token;
        self.consume(TokenKind::Dot, "Expect '.' after 'super'.");
        self.consume(TokenKind::Identifier, "Expect superclass method name.");
        let name = self.identifier_constant(self.previous_token.lexeme);

        self.named_variable(Token { lexeme: "this", ..keyword }, false);
        if self.match_token(TokenKind::LeftParen) {
            let argc = self.argument_list();
            self.named_variable(Token { lexeme: "super", ..keyword }, false);
            self.emit_u8_u8(Opcode::SuperInvoke, name, argc);
        } else {
            self.named_variable(Token { lexeme: "super", ..keyword }, false);
            self.emit_u8(Opcode::GetSuper, name);
        }
    }

    fn named_variable(&mut self, token: Token<'src>, can_assign: bool) {
        let name = token.lexeme;
        let (get_op, set_op, arg, is_const) = match self.current.resolve_local(name) {
            Err(message) => {
                self.error_at(token, message);
                return;
            }
            Ok(Some((slot, is_const))) => (Opcode::GetLocal, Opcode::SetLocal, slot, is_const),
            Ok(None) => match self.current.resolve_upvalue(name) {
                Err(message) => {
                    self.error_at(token, message);
                    return;
                }
                Ok(Some((slot, is_const))) => (Opcode::GetUpvalue, Opcode::SetUpvalue, slot, is_const),
                Ok(None) => {
                    let constant = self.identifier_constant(name);
                    let is_const = self.const_globals.contains(name);
                    (Opcode::GetGlobal, Opcode::SetGlobal, constant, is_const)
                }
            },
        };

        if can_assign && self.match_token(TokenKind::Equal) {
            if is_const {
                self.error_at(token, "Can't assign to a const variable.");
            }
            self.expression();
            self.emit_u8(set_op, arg);
        } else {
            self.emit_u8(get_op, arg);
        }
    }
}

/// The Pratt rule table, as a match instead of a static array so the
/// compiler enforces it is total over token kinds.
fn rule<'src, 'ctx>(kind: TokenKind) -> ParseRule<'src, 'ctx> {
    use TokenKind as T;
    let (prefix, infix, precedence): (
        Option<ParseFn<'src, 'ctx>>,
        Option<ParseFn<'src, 'ctx>>,
        Precedence,
    ) = match kind {
        T::LeftParen => (Some(Compiler::grouping), Some(Compiler::call), Precedence::Call),
        T::LeftBracket => (Some(Compiler::list), Some(Compiler::subscript), Precedence::Call),
        T::LeftBrace => (Some(Compiler::map), None, Precedence::None),
        T::Dot => (None, Some(Compiler::dot), Precedence::Call),
        T::Minus => (Some(Compiler::unary), Some(Compiler::binary), Precedence::Term),
        T::Plus => (None, Some(Compiler::binary), Precedence::Term),
        T::Slash | T::Star | T::Percent => (None, Some(Compiler::binary), Precedence::Factor),
        T::Bang => (Some(Compiler::unary), None, Precedence::None),
        T::BangEqual | T::EqualEqual => (None, Some(Compiler::binary), Precedence::Equality),
        T::Greater | T::GreaterEqual | T::Less | T::LessEqual => {
            (None, Some(Compiler::binary), Precedence::Comparison)
        }
        T::Identifier => (Some(Compiler::variable), None, Precedence::None),
        T::String => (Some(Compiler::string), None, Precedence::None),
        T::Number => (Some(Compiler::number), None, Precedence::None),
        T::And => (None, Some(Compiler::and), Precedence::And),
        T::Or => (None, Some(Compiler::or), Precedence::Or),
        T::Nil | T::True | T::False => (Some(Compiler::literal), None, Precedence::None),
        T::Fun => (Some(Compiler::lambda), None, Precedence::None),
        T::This => (Some(Compiler::this), None, Precedence::None),
        T::Super => (Some(Compiler::super_), None, Precedence::None),
        _ => (None, None, Precedence::None),
    };
    ParseRule {
        prefix,
        infix,
        precedence,
    }
}
