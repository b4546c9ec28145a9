/// Expression descriptors and operator tables.
///
/// A descriptor is the compiler's deferred value: it says where an
/// expression's result currently lives (a literal, a constant slot, a
/// register, a pending indexing operation, an instruction awaiting its
/// destination register) without forcing it anywhere yet. The code
/// generator turns descriptors into registers or instruction operands as
/// late as possible.
use crate::token::Token;
use lunar_core::string::StringId;

/// Empty jump-list sentinel.
pub const NO_JUMP: i32 = -1;

/// The payload of an [`ExpDesc`].
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum ExpKind {
    /// No value (empty expression list, unresolved name during lookup).
    Void,
    Nil,
    True,
    False,
    /// Integer literal not yet materialized.
    KInt(i64),
    /// Float literal not yet materialized.
    KFloat(f64),
    /// String literal not yet materialized.
    KStr(StringId),
    /// Value already in the constant pool.
    Const(u32),
    /// Value fixed in a register that holds a temporary.
    NonReloc(u8),
    /// An active local variable (register == variable slot).
    Local(u8),
    /// An upvalue of the current function.
    Upval(u8),
    /// `up[k]` where `up` is an upvalue and `k` a string constant.
    IndexedUp { table: u8, key: u32 },
    /// `t[i]` with a small integer key, table in a register.
    IndexedI { table: u8, key: u8 },
    /// `t.k` with a string-constant key, table in a register.
    IndexedStr { table: u8, key: u32 },
    /// `t[k]` with both table and key in registers.
    Indexed { table: u8, key: u8 },
    /// Instruction at pc whose destination register is still open.
    Reloc(i32),
    /// A test: the pc of the jump that follows the condition.
    Jump(i32),
    /// A CALL instruction whose result count is still open.
    Call(i32),
    /// A VARARG instruction whose result count is still open.
    Vararg(i32),
    /// The `undef` keyword; only meaningful under `==`/`~=`.
    Undef,
}

/// A deferred expression value plus its pending true/false jump lists.
#[derive(Clone, Copy, Debug)]
pub struct ExpDesc {
    pub kind: ExpKind,
    /// Patch list of jumps taken when the expression is true.
    pub t: i32,
    /// Patch list of jumps taken when the expression is false.
    pub f: i32,
}

impl ExpDesc {
    pub fn new(kind: ExpKind) -> Self {
        ExpDesc {
            kind,
            t: NO_JUMP,
            f: NO_JUMP,
        }
    }

    pub fn void() -> Self {
        ExpDesc::new(ExpKind::Void)
    }

    /// An expression "has jumps" when its control paths diverge.
    pub fn has_jumps(&self) -> bool {
        self.t != self.f
    }

    /// Numeric literal with no pending jumps (a constant-folding operand).
    pub fn is_numeral(&self) -> bool {
        matches!(self.kind, ExpKind::KInt(_) | ExpKind::KFloat(_)) && !self.has_jumps()
    }

    /// Any of the four pending-indexing shapes.
    pub fn is_indexed(&self) -> bool {
        matches!(
            self.kind,
            ExpKind::IndexedUp { .. }
                | ExpKind::IndexedI { .. }
                | ExpKind::IndexedStr { .. }
                | ExpKind::Indexed { .. }
        )
    }

    /// Assignable: a variable or an indexing expression.
    pub fn is_var(&self) -> bool {
        matches!(self.kind, ExpKind::Local(_) | ExpKind::Upval(_)) || self.is_indexed()
    }

    /// Can still produce an open number of results.
    pub fn is_multret(&self) -> bool {
        matches!(self.kind, ExpKind::Call(_) | ExpKind::Vararg(_))
    }
}

/// Binary operators, in precedence-table order.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BinOp {
    Add,
    Sub,
    Mul,
    Mod,
    Pow,
    Div,
    IDiv,
    BAnd,
    BOr,
    BXor,
    Shl,
    Shr,
    Concat,
    Eq,
    Lt,
    Le,
    Ne,
    Gt,
    Ge,
    And,
    Or,
}

impl BinOp {
    pub fn from_token(t: &Token) -> Option<BinOp> {
        match t {
            Token::Plus => Some(BinOp::Add),
            Token::Minus => Some(BinOp::Sub),
            Token::Star => Some(BinOp::Mul),
            Token::Percent => Some(BinOp::Mod),
            Token::Caret => Some(BinOp::Pow),
            Token::Slash => Some(BinOp::Div),
            Token::FloorDiv => Some(BinOp::IDiv),
            Token::Ampersand => Some(BinOp::BAnd),
            Token::Pipe => Some(BinOp::BOr),
            Token::Tilde => Some(BinOp::BXor),
            Token::ShiftLeft => Some(BinOp::Shl),
            Token::ShiftRight => Some(BinOp::Shr),
            Token::DotDot => Some(BinOp::Concat),
            Token::Equal => Some(BinOp::Eq),
            Token::Less => Some(BinOp::Lt),
            Token::LessEq => Some(BinOp::Le),
            Token::NotEqual => Some(BinOp::Ne),
            Token::Greater => Some(BinOp::Gt),
            Token::GreaterEq => Some(BinOp::Ge),
            Token::And => Some(BinOp::And),
            Token::Or => Some(BinOp::Or),
            _ => None,
        }
    }

    /// (left, right) binding powers from the Lua 5.4 grammar. `..` and
    /// `^` bind tighter on the left than the right, making them
    /// right-associative.
    pub fn priority(self) -> (u8, u8) {
        match self {
            BinOp::Or => (1, 1),
            BinOp::And => (2, 2),
            BinOp::Eq | BinOp::Lt | BinOp::Le | BinOp::Ne | BinOp::Gt | BinOp::Ge => (3, 3),
            BinOp::BOr => (4, 4),
            BinOp::BXor => (5, 5),
            BinOp::BAnd => (6, 6),
            BinOp::Shl | BinOp::Shr => (7, 7),
            BinOp::Concat => (9, 8),
            BinOp::Add | BinOp::Sub => (10, 10),
            BinOp::Mul | BinOp::Div | BinOp::IDiv | BinOp::Mod => (11, 11),
            BinOp::Pow => (14, 13),
        }
    }
}

/// Unary operators.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum UnOp {
    Minus,
    BNot,
    Not,
    Len,
}

/// All unary operators bind with this priority (tighter than any binary
/// operator except `^`).
pub const UNARY_PRIORITY: u8 = 12;

impl UnOp {
    pub fn from_token(t: &Token) -> Option<UnOp> {
        match t {
            Token::Minus => Some(UnOp::Minus),
            Token::Tilde => Some(UnOp::BNot),
            Token::Not => Some(UnOp::Not),
            Token::Hash => Some(UnOp::Len),
            _ => None,
        }
    }
}
