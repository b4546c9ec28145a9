//! Single-pass compilation of Lua source to [`Proto`] bytecode.
//!
//! There is no syntax tree: the recursive-descent parser calls straight
//! into the code generator while it reads tokens, the way PUC-Lua's
//! front end works. Expressions travel as [`expr::ExpDesc`] descriptors
//! until an operator or statement forces them into registers.

mod code;
pub mod expr;
pub mod scope;

use std::fmt;

use indexmap::IndexMap;

use crate::compiler::code::{ConstKey, FIELDS_PER_FLUSH, MULTRET};
use crate::compiler::expr::{BinOp, ExpDesc, ExpKind, UnOp, NO_JUMP, UNARY_PRIORITY};
use crate::compiler::scope::{ActiveVar, BlockCnt, GotoDesc, LabelDesc};
use crate::lexer::{LexError, Lexer};
use crate::opcode::{Instruction, OpCode, MAX_BX};
use crate::proto::{Proto, UpvalDesc};
use crate::token::Token;
use lunar_core::string::{StringId, StringInterner};

/// Hard limit on active local variables per function.
const MAX_VARS: usize = 200;
/// Hard limit on upvalues per function (they index an 8-bit field).
const MAX_UPVALUES: usize = 255;
/// Guard against runaway recursion in the parser itself.
const MAX_NESTING: u32 = 200;

/// What kind of problem a [`CompileError`] reports.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ErrorKind {
    /// Malformed token (bad number, unfinished string, stray symbol).
    Lexical,
    /// Grammar violation or structural limit.
    Syntax,
    /// Well-formed source with an impossible meaning (undefined goto,
    /// repeated label, misused `undef`).
    Semantic,
}

/// A compilation failure, formatted like PUC-Lua's messages:
/// `chunk:line: message near 'token'`.
#[derive(Clone, Debug)]
pub struct CompileError {
    pub kind: ErrorKind,
    pub message: String,
    /// Text of the token the error was detected at.
    pub near: Option<String>,
    pub line: u32,
    pub chunk: String,
}

impl CompileError {
    fn new(kind: ErrorKind, message: impl Into<String>, line: u32) -> Self {
        CompileError {
            kind,
            message: message.into(),
            near: None,
            line,
            chunk: String::new(),
        }
    }
}

impl fmt::Display for CompileError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}: {}", self.chunk, self.line, self.message)?;
        if let Some(near) = &self.near {
            write!(f, " near '{near}'")?;
        }
        Ok(())
    }
}

impl std::error::Error for CompileError {}

impl From<LexError> for CompileError {
    fn from(e: LexError) -> Self {
        CompileError {
            kind: ErrorKind::Lexical,
            message: e.message,
            near: Some(e.near),
            line: e.line,
            chunk: String::new(),
        }
    }
}

/// Knobs for a compilation run.
#[derive(Clone, Copy, Debug)]
pub struct CompileOptions {
    /// Record local-variable ranges, upvalue names and per-instruction
    /// lines in the output.
    pub emit_debug_info: bool,
}

impl Default for CompileOptions {
    fn default() -> Self {
        CompileOptions {
            emit_debug_info: true,
        }
    }
}

/// Per-function compilation state. One of these is live for every
/// function lexically enclosing the current parse position.
pub struct FuncState {
    pub proto: Proto,
    /// Index of the enclosing function on the compiler's stack.
    pub(crate) parent: Option<usize>,
    /// pc of the last jump target; instructions before it cannot be
    /// peephole-merged.
    pub(crate) last_target: i32,
    /// Number of active locals; also the first free register, since a
    /// local's register equals its position.
    pub(crate) nactvar: u8,
    pub(crate) freereg: u8,
    /// Some local of this function is captured; returns must close.
    pub(crate) needclose: bool,
    pub(crate) actvar: Vec<ActiveVar>,
    pub(crate) blocks: Vec<BlockCnt>,
    /// Labels visible at the current position.
    pub(crate) labels: Vec<LabelDesc>,
    /// Gotos still waiting for a label.
    pub(crate) gotos: Vec<GotoDesc>,
    pub(crate) upvalues: Vec<UpvalDesc>,
    /// Constant-pool index, keyed so that 1 and 1.0 stay distinct.
    pub(crate) constants: IndexMap<ConstKey, u32>,
}

impl FuncState {
    pub fn new(parent: Option<usize>, line_defined: u32) -> Self {
        let mut proto = Proto::new();
        proto.line_defined = line_defined;
        FuncState {
            proto,
            parent,
            last_target: 0,
            nactvar: 0,
            freereg: 0,
            needclose: false,
            actvar: Vec::new(),
            blocks: Vec::new(),
            labels: Vec::new(),
            gotos: Vec::new(),
            upvalues: Vec::new(),
            constants: IndexMap::new(),
        }
    }
}

/// Compile a chunk with default options. Returns the main prototype and
/// the interner holding every string the chunk mentions.
pub fn compile(
    source: &[u8],
    chunk_name: &str,
) -> Result<(Proto, StringInterner), CompileError> {
    compile_with(source, chunk_name, &CompileOptions::default())
}

pub fn compile_with(
    source: &[u8],
    chunk_name: &str,
    options: &CompileOptions,
) -> Result<(Proto, StringInterner), CompileError> {
    let lexer = Lexer::new(source).map_err(|e| {
        let mut ce = CompileError::from(e);
        ce.chunk = chunk_name.to_string();
        ce
    })?;
    let mut c = Compiler {
        lexer,
        funcs: Vec::new(),
        options: *options,
        nesting: 0,
        env_name: StringId(0),
    };
    c.env_name = c.lexer.strings.intern(b"_ENV");
    match c.mainfunc() {
        Ok(proto) => Ok((proto, c.lexer.into_strings())),
        Err(mut e) => {
            e.chunk = chunk_name.to_string();
            if e.near.is_none() {
                e.near = Some(c.lexer.token_text().to_string());
            }
            Err(e)
        }
    }
}

struct Compiler<'a> {
    lexer: Lexer<'a>,
    /// Enclosing functions, innermost last. Never empty while parsing.
    funcs: Vec<FuncState>,
    options: CompileOptions,
    nesting: u32,
    env_name: StringId,
}

impl<'a> Compiler<'a> {
    fn fs(&mut self) -> &mut FuncState {
        self.funcs.last_mut().unwrap()
    }

    // ---- Token plumbing ----

    fn check_next(&mut self, t: Token) -> Result<bool, CompileError> {
        if *self.lexer.current() == t {
            self.lexer.next()?;
            Ok(true)
        } else {
            Ok(false)
        }
    }

    fn error_expected(&self, t: Token) -> CompileError {
        CompileError::new(
            ErrorKind::Syntax,
            format!("'{t}' expected"),
            self.lexer.current_line(),
        )
    }

    fn expect(&mut self, t: Token) -> Result<(), CompileError> {
        if self.check_next(t)? {
            Ok(())
        } else {
            Err(self.error_expected(t))
        }
    }

    /// Like [`expect`], but names the opening token when it sits on an
    /// earlier line.
    fn expect_match(&mut self, what: Token, who: Token, line: u32) -> Result<(), CompileError> {
        if self.check_next(what)? {
            return Ok(());
        }
        if self.lexer.current_line() == line {
            Err(self.error_expected(what))
        } else {
            Err(CompileError::new(
                ErrorKind::Syntax,
                format!("'{what}' expected (to close '{who}' at line {line})"),
                self.lexer.current_line(),
            ))
        }
    }

    fn check_name(&mut self) -> Result<StringId, CompileError> {
        if let Token::Name(id) = *self.lexer.current() {
            self.lexer.next()?;
            Ok(id)
        } else {
            Err(CompileError::new(
                ErrorKind::Syntax,
                "<name> expected",
                self.lexer.current_line(),
            ))
        }
    }

    fn enter_level(&mut self) -> Result<(), CompileError> {
        self.nesting += 1;
        if self.nesting >= MAX_NESTING {
            return Err(CompileError::new(
                ErrorKind::Syntax,
                "chunk has too many syntax levels",
                self.lexer.current_line(),
            ));
        }
        Ok(())
    }

    fn leave_level(&mut self) {
        self.nesting -= 1;
    }

    // ---- Local variables ----

    /// Declare a local. It is not in scope until [`adjust_local_vars`]
    /// activates it, so `local x = x` still reads the outer `x`.
    fn new_local(&mut self, name: StringId) -> Result<(), CompileError> {
        let line = self.lexer.current_line();
        let fs = self.fs();
        fs.check_limit(fs.actvar.len() + 1, MAX_VARS, "local variables", line)?;
        fs.actvar.push(ActiveVar { name, start_pc: 0 });
        Ok(())
    }

    fn new_local_literal(&mut self, name: &str) -> Result<(), CompileError> {
        let id = self.lexer.strings.intern(name.as_bytes());
        self.new_local(id)
    }

    /// Bring the last `n` declared locals into scope.
    fn adjust_local_vars(&mut self, n: usize) {
        let fs = self.fs();
        let pc = fs.pc() as u32;
        let base = fs.nactvar as usize;
        for var in &mut fs.actvar[base..base + n] {
            var.start_pc = pc;
        }
        fs.nactvar += n as u8;
    }

    /// Deactivate locals down to `to_level`, recording their debug ranges.
    fn remove_vars(&mut self, to_level: u8) {
        let emit_debug = self.options.emit_debug_info;
        let fs = self.fs();
        let pc = fs.pc() as u32;
        while fs.nactvar > to_level {
            fs.nactvar -= 1;
            if let Some(var) = fs.actvar.pop() {
                if emit_debug {
                    fs.proto.local_vars.push(crate::proto::LocalVar {
                        name: var.name,
                        start_pc: var.start_pc,
                        end_pc: pc,
                    });
                }
            }
        }
    }

    /// Balance `nvars` targets against `nexps` produced values, widening
    /// a trailing call/vararg or padding with nils.
    fn adjust_assign(
        &mut self,
        nvars: usize,
        nexps: usize,
        e: &mut ExpDesc,
        line: u32,
    ) -> Result<(), CompileError> {
        let fs = self.fs();
        let needed = nvars as i32 - nexps as i32;
        if e.is_multret() {
            let extra = (needed + 1).max(0);
            fs.set_returns(e, extra, line)?;
        } else {
            if !matches!(e.kind, ExpKind::Void) {
                fs.exp2next_reg(e, line)?;
            }
            if needed > 0 {
                let from = fs.freereg;
                fs.code_nil(from, needed as u8, line);
            }
        }
        if needed > 0 {
            fs.reserve_regs(needed as u8, line)?;
        } else {
            // surplus values were already materialized; drop them
            fs.freereg = (fs.freereg as i32 + needed) as u8;
        }
        Ok(())
    }

    // ---- Name resolution ----

    fn search_local(&self, fidx: usize, name: StringId) -> Option<u8> {
        let fs = &self.funcs[fidx];
        (0..fs.nactvar as usize)
            .rev()
            .find(|&i| fs.actvar[i].name == name)
            .map(|i| i as u8)
    }

    fn search_upvalue(&self, fidx: usize, name: StringId) -> Option<u8> {
        self.funcs[fidx]
            .upvalues
            .iter()
            .position(|u| u.name == Some(name))
            .map(|i| i as u8)
    }

    fn new_upvalue(
        &mut self,
        fidx: usize,
        name: StringId,
        in_stack: bool,
        index: u8,
    ) -> Result<u8, CompileError> {
        let line = self.lexer.current_line();
        let fs = &mut self.funcs[fidx];
        if fs.upvalues.len() >= MAX_UPVALUES {
            return Err(fs.limit_error("upvalues", MAX_UPVALUES, line));
        }
        fs.upvalues.push(UpvalDesc {
            name: Some(name),
            in_stack,
            index,
        });
        Ok((fs.upvalues.len() - 1) as u8)
    }

    /// Resolve `name` in function `fidx`, capturing through enclosing
    /// functions as needed. Leaves `Void` when the name is global.
    fn single_var_aux(
        &mut self,
        fidx: usize,
        name: StringId,
        e: &mut ExpDesc,
        base: bool,
    ) -> Result<(), CompileError> {
        if let Some(reg) = self.search_local(fidx, name) {
            e.kind = ExpKind::Local(reg);
            if !base {
                // captured by a nested function
                self.funcs[fidx].mark_upval(reg);
            }
            return Ok(());
        }
        if let Some(idx) = self.search_upvalue(fidx, name) {
            e.kind = ExpKind::Upval(idx);
            return Ok(());
        }
        let parent = match self.funcs[fidx].parent {
            Some(p) => p,
            None => {
                e.kind = ExpKind::Void;
                return Ok(());
            }
        };
        self.single_var_aux(parent, name, e, false)?;
        match e.kind {
            ExpKind::Local(r) => {
                let idx = self.new_upvalue(fidx, name, true, r)?;
                e.kind = ExpKind::Upval(idx);
            }
            ExpKind::Upval(i) => {
                let idx = self.new_upvalue(fidx, name, false, i)?;
                e.kind = ExpKind::Upval(idx);
            }
            _ => {}
        }
        Ok(())
    }

    fn single_var(&mut self, e: &mut ExpDesc) -> Result<(), CompileError> {
        let line = self.lexer.current_line();
        let name = self.check_name()?;
        let top = self.funcs.len() - 1;
        self.single_var_aux(top, name, e, true)?;
        if matches!(e.kind, ExpKind::Void) {
            // global: rewritten as _ENV[name]
            let env = self.env_name;
            self.single_var_aux(top, env, e, true)?;
            debug_assert!(e.is_var(), "_ENV must always resolve");
            let mut key = ExpDesc::new(ExpKind::KStr(name));
            self.fs().indexed(e, &mut key, line)?;
        }
        Ok(())
    }

    // ---- Blocks, labels and gotos ----

    fn enter_block(&mut self, is_loop: bool) {
        let fs = self.fs();
        debug_assert!(fs.freereg == fs.nactvar);
        let bl = BlockCnt::new(is_loop, fs.nactvar, fs.labels.len(), fs.gotos.len());
        fs.blocks.push(bl);
    }

    fn leave_block(&mut self, line: u32) -> Result<BlockCnt, CompileError> {
        let (bl, has_previous) = {
            let fs = self.fs();
            (fs.blocks.last().unwrap().clone(), fs.blocks.len() > 1)
        };
        let stklevel = bl.nactvar;
        self.remove_vars(bl.nactvar);
        let mut hasclose = false;
        if bl.is_loop {
            hasclose = self.fix_breaks(&bl, line)?;
        }
        let fs = self.fs();
        if !hasclose && has_previous && bl.upval {
            fs.code(Instruction::abc(OpCode::Close, stklevel, 0, 0, false), line);
        }
        fs.freereg = stklevel;
        fs.labels.truncate(bl.first_label);
        fs.blocks.pop();
        if has_previous {
            self.move_gotos_out(&bl, line)?;
        } else if bl.first_goto < self.fs().gotos.len() {
            let gt = self.fs().gotos[bl.first_goto];
            return Err(self.undef_goto_error(&gt));
        }
        Ok(bl)
    }

    /// Resolve the loop's pending breaks to the current position,
    /// closing upvalues first when any exited scope captured a local.
    fn fix_breaks(&mut self, bl: &BlockCnt, line: u32) -> Result<bool, CompileError> {
        if bl.breaks == NO_JUMP {
            return Ok(false);
        }
        let fs = self.fs();
        let target = fs.get_label();
        let need_close = bl.break_close || bl.upval;
        if need_close {
            fs.code(
                Instruction::abc(OpCode::Close, bl.nactvar, 0, 0, false),
                line,
            );
        }
        fs.patch_list(bl.breaks, target, line)?;
        Ok(need_close)
    }

    /// Hand this block's unresolved breaks and gotos to the enclosing
    /// block, noting when they now leave a captured local's scope.
    fn move_gotos_out(&mut self, bl: &BlockCnt, line: u32) -> Result<(), CompileError> {
        let fs = self.fs();
        if bl.breaks != NO_JUMP || bl.break_close {
            let mut pbreaks = fs.blocks.last().unwrap().breaks;
            fs.concat_jumps(&mut pbreaks, bl.breaks, line)?;
            let parent = fs.blocks.last_mut().unwrap();
            parent.breaks = pbreaks;
            parent.break_close |= bl.break_close || (bl.upval && bl.breaks != NO_JUMP);
        }
        let fs = self.fs();
        for i in bl.first_goto..fs.gotos.len() {
            let gt = &mut fs.gotos[i];
            if gt.nactvar > bl.nactvar {
                gt.close |= bl.upval;
                gt.nactvar = bl.nactvar;
            }
        }
        Ok(())
    }

    fn undef_goto_error(&self, gt: &GotoDesc) -> CompileError {
        let name = self.lexer.strings.display(gt.name).into_owned();
        CompileError::new(
            ErrorKind::Semantic,
            format!("no visible label '{name}' for <goto> at line {}", gt.line),
            self.lexer.current_line(),
        )
    }

    fn jump_scope_error(&self, gt: &GotoDesc) -> CompileError {
        let fs = self.funcs.last().unwrap();
        let label = self.lexer.strings.display(gt.name).into_owned();
        let var = self
            .lexer
            .strings
            .display(fs.actvar[gt.nactvar as usize].name)
            .into_owned();
        CompileError::new(
            ErrorKind::Semantic,
            format!(
                "<goto {label}> at line {} jumps into the scope of local '{var}'",
                gt.line
            ),
            self.lexer.current_line(),
        )
    }

    fn check_repeated(&self, name: StringId) -> Result<(), CompileError> {
        let fs = self.funcs.last().unwrap();
        let first = fs.blocks.last().unwrap().first_label;
        if let Some(lb) = fs.labels[first..].iter().find(|l| l.name == name) {
            let text = self.lexer.strings.display(name).into_owned();
            return Err(CompileError::new(
                ErrorKind::Semantic,
                format!("label '{text}' already defined on line {}", lb.line),
                self.lexer.current_line(),
            ));
        }
        Ok(())
    }

    fn solve_gotos(&mut self, label: &LabelDesc) -> Result<bool, CompileError> {
        let mut needsclose = false;
        let mut i = self.fs().blocks.last().unwrap().first_goto;
        while i < self.fs().gotos.len() {
            let gt = self.fs().gotos[i];
            if gt.name == label.name {
                if gt.nactvar < label.nactvar {
                    return Err(self.jump_scope_error(&gt));
                }
                needsclose |= gt.close;
                self.fs().patch_list(gt.pc, label.pc, label.line)?;
                self.fs().gotos.remove(i);
            } else {
                i += 1;
            }
        }
        Ok(needsclose)
    }

    // ---- Expressions ----

    fn expr(&mut self, e: &mut ExpDesc) -> Result<(), CompileError> {
        self.subexpr(e, 0)?;
        Ok(())
    }

    /// Precedence-climbing expression parser; returns the operator that
    /// bound too loosely to consume.
    fn subexpr(&mut self, e: &mut ExpDesc, limit: u8) -> Result<Option<BinOp>, CompileError> {
        self.enter_level()?;
        if let Some(uop) = UnOp::from_token(self.lexer.current()) {
            let line = self.lexer.current_line();
            self.lexer.next()?;
            self.subexpr(e, UNARY_PRIORITY)?;
            self.fs().prefix(uop, e, line)?;
        } else {
            self.simple_exp(e)?;
        }
        let mut op = BinOp::from_token(self.lexer.current());
        while let Some(binop) = op {
            let (left, right) = binop.priority();
            if left <= limit {
                break;
            }
            let line = self.lexer.current_line();
            self.lexer.next()?;
            let rhs_is_undef = matches!(self.lexer.current(), Token::Undef);
            self.fs().infix(binop, e, rhs_is_undef, line)?;
            let mut e2 = ExpDesc::void();
            let next_op = self.subexpr(&mut e2, right)?;
            self.fs().posfix(binop, e, &mut e2, line)?;
            op = next_op;
        }
        self.leave_level();
        Ok(op)
    }

    fn simple_exp(&mut self, v: &mut ExpDesc) -> Result<(), CompileError> {
        let line = self.lexer.current_line();
        match *self.lexer.current() {
            Token::Integer(i) => *v = ExpDesc::new(ExpKind::KInt(i)),
            Token::Float(x) => *v = ExpDesc::new(ExpKind::KFloat(x)),
            Token::String(id) => *v = ExpDesc::new(ExpKind::KStr(id)),
            Token::Nil => *v = ExpDesc::new(ExpKind::Nil),
            Token::True => *v = ExpDesc::new(ExpKind::True),
            Token::False => *v = ExpDesc::new(ExpKind::False),
            Token::Undef => *v = ExpDesc::new(ExpKind::Undef),
            Token::DotDotDot => {
                let fs = self.fs();
                if !fs.proto.is_vararg {
                    return Err(
                        fs.syntax_error("cannot use '...' outside a vararg function", line)
                    );
                }
                let pc = fs.code(Instruction::abc(OpCode::VarArg, 0, 0, 1, false), line);
                *v = ExpDesc::new(ExpKind::Vararg(pc));
            }
            Token::LBrace => return self.constructor(v),
            Token::Function => {
                self.lexer.next()?;
                let line = self.lexer.current_line();
                return self.body(v, false, line);
            }
            _ => return self.suffixed_exp(v),
        }
        self.lexer.next()?;
        Ok(())
    }

    fn primary_exp(&mut self, v: &mut ExpDesc) -> Result<(), CompileError> {
        match *self.lexer.current() {
            Token::Name(_) => self.single_var(v),
            Token::LParen => {
                let line = self.lexer.current_line();
                self.lexer.next()?;
                self.expr(v)?;
                self.expect_match(Token::RParen, Token::LParen, line)?;
                // parentheses truncate to a single value
                self.fs().discharge_vars(v, line)?;
                Ok(())
            }
            _ => Err(CompileError::new(
                ErrorKind::Syntax,
                "unexpected symbol",
                self.lexer.current_line(),
            )),
        }
    }

    fn suffixed_exp(&mut self, v: &mut ExpDesc) -> Result<(), CompileError> {
        let call_line = self.lexer.current_line();
        self.primary_exp(v)?;
        loop {
            match *self.lexer.current() {
                Token::Dot => self.fieldsel(v)?,
                Token::LBracket => {
                    let line = self.lexer.current_line();
                    self.fs().exp2any_regup(v, line)?;
                    let mut key = ExpDesc::void();
                    self.yindex(&mut key)?;
                    self.fs().indexed(v, &mut key, line)?;
                }
                Token::Colon => {
                    let line = self.lexer.current_line();
                    self.lexer.next()?;
                    let name = self.check_name()?;
                    let key = ExpDesc::new(ExpKind::KStr(name));
                    self.fs().self_op(v, key, line)?;
                    self.funcargs(v, line)?;
                }
                Token::LParen | Token::String(_) | Token::LBrace => {
                    self.fs().exp2next_reg(v, call_line)?;
                    self.funcargs(v, call_line)?;
                }
                _ => return Ok(()),
            }
        }
    }

    fn fieldsel(&mut self, v: &mut ExpDesc) -> Result<(), CompileError> {
        let line = self.lexer.current_line();
        self.fs().exp2any_regup(v, line)?;
        self.lexer.next()?; // skip '.' or ':'
        let name = self.check_name()?;
        let mut key = ExpDesc::new(ExpKind::KStr(name));
        self.fs().indexed(v, &mut key, line)
    }

    fn yindex(&mut self, v: &mut ExpDesc) -> Result<(), CompileError> {
        let line = self.lexer.current_line();
        self.lexer.next()?; // skip '['
        self.expr(v)?;
        self.fs().exp2val(v, line)?;
        self.expect(Token::RBracket)
    }

    fn funcargs(&mut self, f: &mut ExpDesc, line: u32) -> Result<(), CompileError> {
        let mut args = ExpDesc::void();
        match *self.lexer.current() {
            Token::LParen => {
                let open_line = self.lexer.current_line();
                self.lexer.next()?;
                if !matches!(self.lexer.current(), Token::RParen) {
                    self.explist(&mut args)?;
                    if args.is_multret() {
                        self.fs().set_returns(&mut args, MULTRET, line)?;
                    }
                }
                self.expect_match(Token::RParen, Token::LParen, open_line)?;
            }
            Token::LBrace => self.constructor(&mut args)?,
            Token::String(id) => {
                args = ExpDesc::new(ExpKind::KStr(id));
                self.lexer.next()?;
            }
            _ => {
                return Err(CompileError::new(
                    ErrorKind::Syntax,
                    "function arguments expected",
                    self.lexer.current_line(),
                ))
            }
        }
        let fs = self.fs();
        let base = match f.kind {
            ExpKind::NonReloc(r) => r,
            _ => {
                debug_assert!(false, "callee not on the stack");
                0
            }
        };
        let nparams = if args.is_multret() {
            MULTRET
        } else {
            if !matches!(args.kind, ExpKind::Void) {
                fs.exp2next_reg(&mut args, line)?;
            }
            (fs.freereg - (base + 1)) as i32
        };
        let pc = fs.code(
            Instruction::abc(OpCode::Call, base, (nparams + 1) as u8, 2, false),
            line,
        );
        *f = ExpDesc::new(ExpKind::Call(pc));
        // the call consumes function and arguments, producing one slot
        fs.freereg = base + 1;
        Ok(())
    }

    fn explist(&mut self, e: &mut ExpDesc) -> Result<usize, CompileError> {
        let mut n = 1;
        self.expr(e)?;
        while *self.lexer.current() == Token::Comma {
            let line = self.lexer.current_line();
            self.lexer.next()?;
            self.fs().exp2next_reg(e, line)?;
            self.expr(e)?;
            n += 1;
        }
        Ok(n)
    }

    // ---- Table constructors ----

    fn constructor(&mut self, t: &mut ExpDesc) -> Result<(), CompileError> {
        let line = self.lexer.current_line();
        let fs = self.fs();
        let pc = fs.code(Instruction::abc(OpCode::NewTable, 0, 0, 0, false), line) as usize;
        fs.code(Instruction::ax(OpCode::ExtraArg, 0), line); // size-hint slot
        let table_reg = fs.freereg;
        *t = ExpDesc::new(ExpKind::NonReloc(table_reg));
        fs.reserve_regs(1, line)?;
        let mut na: i32 = 0;
        let mut nh: i32 = 0;
        let mut tostore: i32 = 0;
        let mut v = ExpDesc::void();
        self.expect(Token::LBrace)?;
        loop {
            debug_assert!(matches!(v.kind, ExpKind::Void) || tostore > 0);
            if matches!(self.lexer.current(), Token::RBrace) {
                break;
            }
            if !matches!(v.kind, ExpKind::Void) {
                // close the previous list item
                let l = self.lexer.current_line();
                self.fs().exp2next_reg(&mut v, l)?;
                v = ExpDesc::void();
                if tostore == FIELDS_PER_FLUSH {
                    self.fs().set_list(table_reg, na, tostore, l)?;
                    na += tostore;
                    tostore = 0;
                }
            }
            match *self.lexer.current() {
                Token::Name(_) => {
                    if matches!(self.lexer.peek_ahead()?, Token::Assign) {
                        self.recfield(table_reg, &mut nh)?;
                    } else {
                        self.expr(&mut v)?;
                        tostore += 1;
                    }
                }
                Token::LBracket => self.recfield(table_reg, &mut nh)?,
                _ => {
                    self.expr(&mut v)?;
                    tostore += 1;
                }
            }
            if !(self.check_next(Token::Comma)? || self.check_next(Token::Semi)?) {
                break;
            }
        }
        self.expect_match(Token::RBrace, Token::LBrace, line)?;
        if tostore != 0 {
            let l = self.lexer.current_line();
            if v.is_multret() {
                self.fs().set_returns(&mut v, MULTRET, l)?;
                self.fs().set_list(table_reg, na, MULTRET, l)?;
                na -= 1; // last expression provides an unknown count
            } else {
                if !matches!(v.kind, ExpKind::Void) {
                    self.fs().exp2next_reg(&mut v, l)?;
                }
                self.fs().set_list(table_reg, na, tostore, l)?;
            }
            na += tostore;
        }
        self.fs().set_table_size(pc, table_reg, na as u32, nh as u32);
        Ok(())
    }

    fn recfield(&mut self, table_reg: u8, nh: &mut i32) -> Result<(), CompileError> {
        let line = self.lexer.current_line();
        let reg = self.fs().freereg;
        let mut key = ExpDesc::void();
        if let Token::Name(id) = *self.lexer.current() {
            self.lexer.next()?;
            key = ExpDesc::new(ExpKind::KStr(id));
        } else {
            self.yindex(&mut key)?;
        }
        *nh += 1;
        self.expect(Token::Assign)?;
        let mut tab = ExpDesc::new(ExpKind::NonReloc(table_reg));
        self.fs().indexed(&mut tab, &mut key, line)?;
        let mut val = ExpDesc::void();
        self.expr(&mut val)?;
        self.fs().store_var(&tab, &mut val, line)?;
        self.fs().freereg = reg;
        Ok(())
    }

    // ---- Function bodies ----

    fn parlist(&mut self) -> Result<(), CompileError> {
        let line = self.lexer.current_line();
        let mut nparams = 0;
        let mut is_vararg = false;
        if !matches!(self.lexer.current(), Token::RParen) {
            loop {
                match *self.lexer.current() {
                    Token::Name(_) => {
                        let name = self.check_name()?;
                        self.new_local(name)?;
                        nparams += 1;
                    }
                    Token::DotDotDot => {
                        self.lexer.next()?;
                        is_vararg = true;
                    }
                    _ => {
                        return Err(CompileError::new(
                            ErrorKind::Syntax,
                            "<name> expected",
                            self.lexer.current_line(),
                        ))
                    }
                }
                if is_vararg || !self.check_next(Token::Comma)? {
                    break;
                }
            }
        }
        self.adjust_local_vars(nparams);
        let fs = self.fs();
        fs.proto.num_params = fs.nactvar;
        if is_vararg {
            fs.proto.is_vararg = true;
            fs.code(
                Instruction::abc(OpCode::VarArgPrep, fs.proto.num_params, 0, 0, false),
                line,
            );
        }
        fs.reserve_regs(fs.nactvar, line)?;
        Ok(())
    }

    fn body(&mut self, e: &mut ExpDesc, is_method: bool, line: u32) -> Result<(), CompileError> {
        let parent = self.funcs.len() - 1;
        self.funcs.push(FuncState::new(Some(parent), line));
        self.enter_block(false);
        self.expect(Token::LParen)?;
        if is_method {
            self.new_local_literal("self")?;
            self.adjust_local_vars(1);
        }
        self.parlist()?;
        self.expect(Token::RParen)?;
        self.statlist()?;
        self.fs().proto.last_line_defined = self.lexer.current_line();
        self.expect_match(Token::End, Token::Function, line)?;
        let proto = self.close_func()?;
        // emit the closure in the enclosing function
        let nprotos = self.fs().proto.protos.len();
        self.fs()
            .check_limit(nprotos + 1, MAX_BX as usize, "functions", line)?;
        let fs = self.fs();
        fs.proto.protos.push(proto);
        let pc = fs.code(Instruction::abx(OpCode::Closure, 0, nprotos as u32), line);
        *e = ExpDesc::new(ExpKind::Reloc(pc));
        fs.exp2next_reg(e, line)?;
        Ok(())
    }

    fn close_func(&mut self) -> Result<Proto, CompileError> {
        let line = self.lexer.current_line();
        let fs = self.fs();
        let level = fs.nactvar;
        fs.ret(level, 0, line); // implicit final return
        self.leave_block(line)?;
        let fs = self.fs();
        debug_assert!(fs.blocks.is_empty());
        fs.finish(line)?;
        let mut fs = self.funcs.pop().unwrap();
        if !self.options.emit_debug_info {
            for u in &mut fs.upvalues {
                u.name = None;
            }
            fs.proto.local_vars.clear();
            fs.proto.line_info.clear();
        }
        fs.proto.upvalues = std::mem::take(&mut fs.upvalues);
        Ok(fs.proto)
    }

    fn mainfunc(&mut self) -> Result<Proto, CompileError> {
        let mut fs = FuncState::new(None, 0);
        fs.proto.is_vararg = true;
        // the main chunk's single upvalue is the globals table
        fs.upvalues.push(UpvalDesc {
            name: Some(self.env_name),
            in_stack: true,
            index: 0,
        });
        self.funcs.push(fs);
        self.enter_block(false);
        let line = self.lexer.current_line();
        self.fs()
            .code(Instruction::abc(OpCode::VarArgPrep, 0, 0, 0, false), line);
        self.statlist()?;
        if !matches!(self.lexer.current(), Token::Eof) {
            return Err(self.error_expected(Token::Eof));
        }
        self.fs().proto.last_line_defined = self.lexer.current_line();
        self.close_func()
    }

    // ---- Statements ----

    fn block_follow(&self, with_until: bool) -> bool {
        match self.lexer.current() {
            Token::Else | Token::ElseIf | Token::End | Token::Eof => true,
            Token::Until => with_until,
            _ => false,
        }
    }

    fn statlist(&mut self) -> Result<(), CompileError> {
        while !self.block_follow(true) {
            let is_return = matches!(self.lexer.current(), Token::Return);
            self.statement()?;
            if is_return {
                return Ok(()); // 'return' must be the last statement
            }
        }
        Ok(())
    }

    fn block(&mut self) -> Result<(), CompileError> {
        let line = self.lexer.current_line();
        self.enter_block(false);
        self.statlist()?;
        self.leave_block(line)?;
        Ok(())
    }

    fn statement(&mut self) -> Result<(), CompileError> {
        let line = self.lexer.current_line();
        self.enter_level()?;
        match *self.lexer.current() {
            Token::Semi => self.lexer.next()?,
            Token::If => self.ifstat(line)?,
            Token::While => self.whilestat(line)?,
            Token::Do => {
                self.lexer.next()?;
                self.block()?;
                self.expect_match(Token::End, Token::Do, line)?;
            }
            Token::For => self.forstat(line)?,
            Token::Repeat => self.repeatstat(line)?,
            Token::Function => self.funcstat(line)?,
            Token::Local => {
                self.lexer.next()?;
                if self.check_next(Token::Function)? {
                    self.localfunc()?;
                } else {
                    self.localstat(line)?;
                }
            }
            Token::DoubleColon => {
                self.lexer.next()?;
                let name = self.check_name()?;
                self.labelstat(name, line)?;
            }
            Token::Return => self.retstat()?,
            Token::Break => self.breakstat(line)?,
            Token::Goto => self.gotostat(line)?,
            _ => self.exprstat(line)?,
        }
        self.leave_level();
        let fs = self.fs();
        debug_assert!(fs.proto.max_stack_size >= fs.freereg && fs.freereg >= fs.nactvar);
        fs.freereg = fs.nactvar; // statements leave no temporaries
        Ok(())
    }

    /// Parse a condition, returning its false list. A literal `nil`
    /// becomes `false` so the jump logic can treat it uniformly.
    fn cond(&mut self) -> Result<i32, CompileError> {
        let line = self.lexer.current_line();
        let mut v = ExpDesc::void();
        self.expr(&mut v)?;
        if matches!(v.kind, ExpKind::Nil) {
            v.kind = ExpKind::False;
        }
        self.fs().go_if_true(&mut v, line)?;
        Ok(v.f)
    }

    fn test_then_block(&mut self, escapes: &mut i32) -> Result<(), CompileError> {
        self.lexer.next()?; // skip 'if' or 'elseif'
        let line = self.lexer.current_line();
        let mut v = ExpDesc::void();
        self.expr(&mut v)?;
        self.expect(Token::Then)?;
        self.fs().go_if_true(&mut v, line)?;
        let false_list = v.f;
        self.block()?;
        if matches!(self.lexer.current(), Token::ElseIf | Token::Else) {
            let fs = self.fs();
            let j = fs.jump(line);
            fs.concat_jumps(escapes, j, line)?;
        }
        self.fs().patch_to_here(false_list, line)?;
        Ok(())
    }

    fn ifstat(&mut self, line: u32) -> Result<(), CompileError> {
        let mut escapes = NO_JUMP;
        self.test_then_block(&mut escapes)?;
        while matches!(self.lexer.current(), Token::ElseIf) {
            self.test_then_block(&mut escapes)?;
        }
        if self.check_next(Token::Else)? {
            self.block()?;
        }
        self.expect_match(Token::End, Token::If, line)?;
        self.fs().patch_to_here(escapes, line)
    }

    fn whilestat(&mut self, line: u32) -> Result<(), CompileError> {
        self.lexer.next()?; // skip 'while'
        let while_init = self.fs().get_label();
        let cond_exit = self.cond()?;
        self.enter_block(true);
        self.expect(Token::Do)?;
        self.block()?;
        self.fs().jump_to(while_init, line)?;
        self.expect_match(Token::End, Token::While, line)?;
        self.leave_block(line)?;
        self.fs().patch_to_here(cond_exit, line)
    }

    fn repeatstat(&mut self, line: u32) -> Result<(), CompileError> {
        let repeat_init = self.fs().get_label();
        self.enter_block(true); // loop block
        self.enter_block(false); // scope block
        self.lexer.next()?; // skip 'repeat'
        self.statlist()?;
        self.expect_match(Token::Until, Token::Repeat, line)?;
        // the condition still sees the body's locals
        let mut cond_exit = self.cond()?;
        let bl = self.leave_block(line)?;
        if bl.upval {
            // looping back must close the body's captured locals first
            let fs = self.fs();
            let exit = fs.jump(line);
            fs.patch_to_here(cond_exit, line)?;
            fs.code(
                Instruction::abc(OpCode::Close, bl.nactvar, 0, 0, false),
                line,
            );
            cond_exit = fs.jump(line);
            fs.patch_to_here(exit, line)?;
        }
        self.fs().patch_list(cond_exit, repeat_init, line)?;
        self.leave_block(line)?;
        Ok(())
    }

    /// A single expression forced into the next register (for loop
    /// control values).
    fn exp1(&mut self) -> Result<(), CompileError> {
        let line = self.lexer.current_line();
        let mut e = ExpDesc::void();
        self.expr(&mut e)?;
        self.fs().exp2next_reg(&mut e, line)?;
        Ok(())
    }

    fn fix_for_jump(&mut self, pc: i32, dest: i32, back: bool) -> Result<(), CompileError> {
        let line = self.lexer.current_line();
        let fs = self.fs();
        let mut offset = dest - (pc + 1);
        if back {
            offset = -offset;
        }
        if offset < 0 || offset > MAX_BX as i32 {
            return Err(fs.syntax_error("control structure too long", line));
        }
        fs.proto.code[pc as usize].set_bx(offset as u32);
        Ok(())
    }

    fn forbody(&mut self, base: u8, line: u32, nvars: u8, isnum: bool) -> Result<(), CompileError> {
        self.expect(Token::Do)?;
        let prep = if isnum {
            self.fs().code(Instruction::abx(OpCode::ForPrep, base, 0), line)
        } else {
            self.fs().code(Instruction::abx(OpCode::TForPrep, base, 0), line)
        };
        self.enter_block(false); // scope for the declared variables
        self.adjust_local_vars(nvars as usize);
        self.fs().reserve_regs(nvars, line)?;
        self.block()?;
        self.leave_block(line)?;
        let here = self.fs().get_label();
        self.fix_for_jump(prep, here, false)?;
        let endfor = if isnum {
            self.fs().code(Instruction::abx(OpCode::ForLoop, base, 0), line)
        } else {
            let fs = self.fs();
            fs.code(Instruction::abc(OpCode::TForCall, base, 0, nvars, false), line);
            fs.fix_line(line);
            fs.code(Instruction::abx(OpCode::TForLoop, base + 2, 0), line)
        };
        self.fix_for_jump(endfor, prep + 1, true)?;
        self.fs().fix_line(line);
        Ok(())
    }

    fn fornum(&mut self, varname: StringId, line: u32) -> Result<(), CompileError> {
        let base = self.fs().freereg;
        self.new_local_literal("(for state)")?;
        self.new_local_literal("(for state)")?;
        self.new_local_literal("(for state)")?;
        self.new_local(varname)?;
        self.expect(Token::Assign)?;
        self.exp1()?; // initial value
        self.expect(Token::Comma)?;
        self.exp1()?; // limit
        if self.check_next(Token::Comma)? {
            self.exp1()?; // step
        } else {
            // default step of 1
            let l = self.lexer.current_line();
            let fs = self.fs();
            fs.reserve_regs(1, l)?;
            fs.code(Instruction::asbx(OpCode::LoadI, fs.freereg - 1, 1), l);
        }
        self.adjust_local_vars(3);
        self.forbody(base, line, 1, true)
    }

    fn forlist(&mut self, indexname: StringId) -> Result<(), CompileError> {
        let line = self.lexer.current_line();
        let base = self.fs().freereg;
        // control slots: iterator, state, control, reserved
        self.new_local_literal("(for state)")?;
        self.new_local_literal("(for state)")?;
        self.new_local_literal("(for state)")?;
        self.new_local_literal("(for state)")?;
        let mut nvars: u8 = 1;
        self.new_local(indexname)?;
        while self.check_next(Token::Comma)? {
            let name = self.check_name()?;
            self.new_local(name)?;
            nvars += 1;
        }
        self.expect(Token::In)?;
        let mut e = ExpDesc::void();
        let nexps = self.explist(&mut e)?;
        self.adjust_assign(4, nexps, &mut e, line)?;
        self.adjust_local_vars(4);
        self.fs().check_stack(3, line)?; // room for the iterator call
        self.forbody(base, line, nvars, false)
    }

    fn forstat(&mut self, line: u32) -> Result<(), CompileError> {
        self.enter_block(true); // loop block
        self.lexer.next()?; // skip 'for'
        let varname = self.check_name()?;
        match *self.lexer.current() {
            Token::Assign => self.fornum(varname, line)?,
            Token::Comma | Token::In => self.forlist(varname)?,
            _ => {
                return Err(CompileError::new(
                    ErrorKind::Syntax,
                    "'=' or 'in' expected",
                    self.lexer.current_line(),
                ))
            }
        }
        self.expect_match(Token::End, Token::For, line)?;
        self.leave_block(line)?;
        Ok(())
    }

    fn funcname(&mut self, v: &mut ExpDesc) -> Result<bool, CompileError> {
        self.single_var(v)?;
        while matches!(self.lexer.current(), Token::Dot) {
            self.fieldsel(v)?;
        }
        if matches!(self.lexer.current(), Token::Colon) {
            self.fieldsel(v)?;
            return Ok(true);
        }
        Ok(false)
    }

    fn funcstat(&mut self, line: u32) -> Result<(), CompileError> {
        self.lexer.next()?; // skip 'function'
        let mut v = ExpDesc::void();
        let mut b = ExpDesc::void();
        let is_method = self.funcname(&mut v)?;
        self.body(&mut b, is_method, line)?;
        let fs = self.fs();
        fs.store_var(&v, &mut b, line)?;
        fs.fix_line(line); // definition happens on the first line
        Ok(())
    }

    fn localfunc(&mut self) -> Result<(), CompileError> {
        let line = self.lexer.current_line();
        let name = self.check_name()?;
        self.new_local(name)?;
        self.adjust_local_vars(1); // in scope for recursive calls
        let mut b = ExpDesc::void();
        self.body(&mut b, false, line)?;
        // debug information only sees the variable after the closure
        let fs = self.fs();
        let pc = fs.pc() as u32;
        fs.actvar.last_mut().unwrap().start_pc = pc;
        Ok(())
    }

    fn localstat(&mut self, line: u32) -> Result<(), CompileError> {
        let mut nvars = 0;
        loop {
            let name = self.check_name()?;
            self.new_local(name)?;
            nvars += 1;
            if !self.check_next(Token::Comma)? {
                break;
            }
        }
        let mut e = ExpDesc::void();
        let nexps = if self.check_next(Token::Assign)? {
            self.explist(&mut e)?
        } else {
            0
        };
        self.adjust_assign(nvars, nexps, &mut e, line)?;
        self.adjust_local_vars(nvars);
        Ok(())
    }

    fn labelstat(&mut self, name: StringId, line: u32) -> Result<(), CompileError> {
        self.check_repeated(name)?;
        self.expect(Token::DoubleColon)?;
        // the entry goes in before the skip loop so a nested label
        // statement sees this one as already defined
        let fs = self.fs();
        let pc = fs.get_label();
        let nactvar = fs.nactvar;
        let idx = fs.labels.len();
        fs.labels.push(LabelDesc {
            name,
            pc,
            line,
            nactvar,
        });
        // skip no-op statements so a trailing label still counts as last
        while matches!(self.lexer.current(), Token::Semi | Token::DoubleColon) {
            self.statement()?;
        }
        if self.block_follow(false) {
            // the label closes its block, so block locals are already
            // out of scope for jumps to it
            let fs = self.fs();
            fs.labels[idx].nactvar = fs.blocks.last().unwrap().nactvar;
        }
        let label = self.fs().labels[idx];
        let needsclose = self.solve_gotos(&label)?;
        if needsclose {
            let fs = self.fs();
            let level = fs.nactvar;
            fs.code(Instruction::abc(OpCode::Close, level, 0, 0, false), line);
        }
        Ok(())
    }

    fn gotostat(&mut self, line: u32) -> Result<(), CompileError> {
        self.lexer.next()?; // skip 'goto'
        let name = self.check_name()?;
        let fs = self.fs();
        if let Some(lb) = fs.labels.iter().find(|l| l.name == name).copied() {
            // backward jump, resolved now
            if fs.nactvar > lb.nactvar {
                // leaving local scopes: close their upvalues
                fs.code(
                    Instruction::abc(OpCode::Close, lb.nactvar, 0, 0, false),
                    line,
                );
            }
            let j = fs.jump(line);
            fs.patch_list(j, lb.pc, line)?;
        } else {
            // forward jump, resolved when the label appears
            let j = fs.jump(line);
            let nactvar = fs.nactvar;
            fs.gotos.push(GotoDesc {
                name,
                pc: j,
                line,
                nactvar,
                close: false,
            });
        }
        Ok(())
    }

    fn breakstat(&mut self, line: u32) -> Result<(), CompileError> {
        self.lexer.next()?; // skip 'break'
        let fs = self.fs();
        if !fs.blocks.iter().any(|b| b.is_loop) {
            return Err(fs.syntax_error("break outside a loop", line));
        }
        let j = fs.jump(line);
        let mut breaks = fs.blocks.last().unwrap().breaks;
        fs.concat_jumps(&mut breaks, j, line)?;
        fs.blocks.last_mut().unwrap().breaks = breaks;
        Ok(())
    }

    fn retstat(&mut self) -> Result<(), CompileError> {
        self.lexer.next()?; // skip 'return'
        let line = self.lexer.current_line();
        let mut first = self.fs().nactvar;
        let mut nret: i32;
        if self.block_follow(true) || matches!(self.lexer.current(), Token::Semi) {
            nret = 0;
        } else {
            let mut e = ExpDesc::void();
            nret = self.explist(&mut e)? as i32;
            if e.is_multret() {
                self.fs().set_returns(&mut e, MULTRET, line)?;
                if let ExpKind::Call(pc) = e.kind {
                    if nret == 1 {
                        // a lone call in tail position
                        self.fs().proto.code[pc as usize].set_opcode(OpCode::TailCall);
                    }
                }
                nret = MULTRET;
            } else if nret == 1 {
                // a single value can be returned from wherever it is
                first = self.fs().exp2any_reg(&mut e, line)?;
            } else {
                self.fs().exp2next_reg(&mut e, line)?;
                debug_assert_eq!(nret, (self.fs().freereg - first) as i32);
            }
        }
        self.fs().ret(first, nret, line);
        self.check_next(Token::Semi)?;
        Ok(())
    }

    /// Multiple-assignment tail: collect further targets, then emit the
    /// stores innermost-first.
    fn restassign(&mut self, lhs: &mut Vec<ExpDesc>, line: u32) -> Result<(), CompileError> {
        self.enter_level()?;
        if !lhs.last().unwrap().is_var() {
            self.leave_level();
            return Err(CompileError::new(
                ErrorKind::Syntax,
                "syntax error",
                self.lexer.current_line(),
            ));
        }
        if self.check_next(Token::Comma)? {
            let mut nv = ExpDesc::void();
            self.suffixed_exp(&mut nv)?;
            if !nv.is_indexed() {
                self.check_conflict(lhs, &nv, line)?;
            }
            lhs.push(nv);
            self.restassign(lhs, line)?;
            lhs.pop();
        } else {
            self.expect(Token::Assign)?;
            let mut e = ExpDesc::void();
            let nexps = self.explist(&mut e)?;
            if nexps != lhs.len() {
                self.adjust_assign(lhs.len(), nexps, &mut e, line)?;
            } else {
                let fs = self.fs();
                fs.set_one_ret(&mut e);
                let var = *lhs.last().unwrap();
                fs.store_var(&var, &mut e, line)?;
                self.leave_level();
                return Ok(());
            }
        }
        // the value for this target is now on top of the stack
        let fs = self.fs();
        let mut e = ExpDesc::new(ExpKind::NonReloc(fs.freereg - 1));
        let var = *lhs.last().unwrap();
        fs.store_var(&var, &mut e, line)?;
        self.leave_level();
        Ok(())
    }

    /// A later assignment target may alias the local or upvalue holding
    /// an earlier target's table or key; copy the value to a safe
    /// register and rewrite the earlier targets to use the copy.
    fn check_conflict(
        &mut self,
        lhs: &mut [ExpDesc],
        v: &ExpDesc,
        line: u32,
    ) -> Result<(), CompileError> {
        let fs = self.fs();
        let extra = fs.freereg;
        let mut conflict = false;
        for lh in lhs.iter_mut() {
            match lh.kind {
                ExpKind::IndexedUp { table, key } => {
                    if let ExpKind::Upval(u) = v.kind {
                        if table == u {
                            conflict = true;
                            lh.kind = ExpKind::IndexedStr { table: extra, key };
                        }
                    }
                }
                ExpKind::IndexedStr { table, key } => {
                    if let ExpKind::Local(r) = v.kind {
                        if table == r {
                            conflict = true;
                            lh.kind = ExpKind::IndexedStr { table: extra, key };
                        }
                    }
                }
                ExpKind::IndexedI { table, key } => {
                    if let ExpKind::Local(r) = v.kind {
                        if table == r {
                            conflict = true;
                            lh.kind = ExpKind::IndexedI { table: extra, key };
                        }
                    }
                }
                ExpKind::Indexed { table, key } => {
                    if let ExpKind::Local(r) = v.kind {
                        let mut table = table;
                        let mut key = key;
                        if table == r {
                            conflict = true;
                            table = extra;
                        }
                        if key == r {
                            conflict = true;
                            key = extra;
                        }
                        lh.kind = ExpKind::Indexed { table, key };
                    }
                }
                _ => {}
            }
        }
        if conflict {
            match v.kind {
                ExpKind::Local(r) => {
                    fs.code(Instruction::abc(OpCode::Move, extra, r, 0, false), line);
                }
                ExpKind::Upval(u) => {
                    fs.code(Instruction::abc(OpCode::GetUpval, extra, u, 0, false), line);
                }
                _ => {}
            }
            fs.reserve_regs(1, line)?;
        }
        Ok(())
    }

    fn exprstat(&mut self, line: u32) -> Result<(), CompileError> {
        let mut v = ExpDesc::void();
        self.suffixed_exp(&mut v)?;
        if matches!(self.lexer.current(), Token::Assign | Token::Comma) {
            let mut lhs = vec![v];
            self.restassign(&mut lhs, line)?;
        } else {
            // only calls can stand alone as statements
            match v.kind {
                ExpKind::Call(pc) => {
                    // a statement call discards its results
                    self.fs().proto.code[pc as usize].set_c(1);
                }
                _ => {
                    return Err(CompileError::new(
                        ErrorKind::Syntax,
                        "syntax error",
                        self.lexer.current_line(),
                    ))
                }
            }
        }
        Ok(())
    }
}
