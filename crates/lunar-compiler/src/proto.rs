/// Function prototypes: the compiler's output.
use crate::opcode::Instruction;
use lunar_core::string::StringId;

/// A compile-time constant in a prototype's pool.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum Constant {
    Nil,
    Boolean(bool),
    Integer(i64),
    Float(f64),
    String(StringId),
}

/// Where an upvalue of a closure lives: a register of the directly
/// enclosing function (`in_stack`) or one of its own upvalues.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct UpvalDesc {
    pub name: Option<StringId>,
    pub in_stack: bool,
    pub index: u8,
}

/// Debug record for a local variable's live range.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct LocalVar {
    pub name: StringId,
    pub start_pc: u32,
    pub end_pc: u32,
}

/// A compiled function.
#[derive(Clone, Debug, Default)]
pub struct Proto {
    pub code: Vec<Instruction>,
    pub constants: Vec<Constant>,
    pub protos: Vec<Proto>,
    pub upvalues: Vec<UpvalDesc>,
    pub num_params: u8,
    pub is_vararg: bool,
    pub max_stack_size: u8,
    /// Line of the `function` keyword; 0 for the main chunk.
    pub line_defined: u32,
    pub last_line_defined: u32,
    /// One source line per instruction.
    pub line_info: Vec<u32>,
    /// Local-variable debug records, in order of activation.
    pub local_vars: Vec<LocalVar>,
}

impl Proto {
    pub fn new() -> Self {
        Proto {
            // Registers 0 and 1 are always addressable (PUC reserves them
            // for the call frame even in empty functions).
            max_stack_size: 2,
            ..Proto::default()
        }
    }

    /// Append an instruction with its source line; returns its pc.
    pub fn emit(&mut self, inst: Instruction, line: u32) -> usize {
        self.code.push(inst);
        self.line_info.push(line);
        self.code.len() - 1
    }

    /// Append a constant without deduplication; returns its index.
    /// Deduplication is the code generator's job (it keeps a map keyed by
    /// value identity, where 1 and 1.0 stay distinct).
    pub fn add_constant(&mut self, k: Constant) -> u32 {
        self.constants.push(k);
        (self.constants.len() - 1) as u32
    }

    /// Source line of the instruction at `pc`, 0 when unknown.
    pub fn get_line(&self, pc: usize) -> u32 {
        self.line_info.get(pc).copied().unwrap_or(0)
    }
}
