//! Single-pass Lua 5.4 compiler front end.
//!
//! The parser drives the lexer directly and emits bytecode while parsing;
//! there is no AST. Expression values are deferred through descriptors
//! ([`compiler::expr::ExpDesc`]) until the grammar forces them into a
//! register or a constant. The output is a tree of [`proto::Proto`] values
//! plus the string interner that owns every name and literal.
//!
//! ```
//! let (proto, strings) = lunar_compiler::compiler::compile(b"return 1 + 2", "demo").unwrap();
//! assert!(proto.constants.is_empty()); // 1 + 2 folds at compile time
//! let _ = lunar_compiler::disasm::disassemble(&proto, &strings);
//! ```

pub mod compiler;
pub mod disasm;
pub mod lexer;
pub mod opcode;
pub mod proto;
pub mod token;
