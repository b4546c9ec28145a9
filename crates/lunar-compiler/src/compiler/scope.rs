/// Lexical blocks, active variables, labels and gotos.
use crate::compiler::expr::NO_JUMP;
use lunar_core::string::StringId;

/// One lexical block (a `do` block, loop body, if arm, function body).
#[derive(Clone, Debug)]
pub struct BlockCnt {
    /// Loops are the targets of `break`.
    pub is_loop: bool,
    /// Number of active locals outside the block; also the register level
    /// to restore on exit.
    pub nactvar: u8,
    /// First entry in the function's label vector belonging to this block.
    pub first_label: usize,
    /// First entry in the function's goto vector belonging to this block.
    pub first_goto: usize,
    /// Some local declared in this block was captured as an upvalue.
    pub upval: bool,
    /// Patch list of pending `break` jumps.
    pub breaks: i32,
    /// Some pending break leaves the scope of a captured local, so the
    /// break target must close upvalues.
    pub break_close: bool,
}

impl BlockCnt {
    pub fn new(is_loop: bool, nactvar: u8, first_label: usize, first_goto: usize) -> Self {
        BlockCnt {
            is_loop,
            nactvar,
            first_label,
            first_goto,
            upval: false,
            breaks: NO_JUMP,
            break_close: false,
        }
    }
}

/// A `::label::` visible for resolution.
#[derive(Clone, Copy, Debug)]
pub struct LabelDesc {
    pub name: StringId,
    /// Position jumps to this label land on.
    pub pc: i32,
    pub line: u32,
    /// Active locals at the label; a goto may not jump into a scope with
    /// more locals than it had.
    pub nactvar: u8,
}

/// A `goto` still waiting for its label.
#[derive(Clone, Copy, Debug)]
pub struct GotoDesc {
    pub name: StringId,
    /// The pending jump instruction.
    pub pc: i32,
    pub line: u32,
    pub nactvar: u8,
    /// The jump leaves the scope of a captured local; the resolving label
    /// must close upvalues.
    pub close: bool,
}

/// A declared local. The first `nactvar` entries of the vector are in
/// scope; entries past that are declared but not yet activated (the
/// initializer of `local x = x` still sees the outer `x`).
#[derive(Clone, Copy, Debug)]
pub struct ActiveVar {
    pub name: StringId,
    /// First pc where the variable is live (for debug records).
    pub start_pc: u32,
}
