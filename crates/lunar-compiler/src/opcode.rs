/// Opcodes and instruction encoding.
///
/// Instruction format (32 bits):
/// - Bits 0-6: OpCode (7 bits)
/// - Bit 7: k flag (1 bit)
/// - Bits 8-15: A (8 bits)
/// - For iABC format:
///   - Bits 16-23: B (8 bits)
///   - Bits 24-31: C (8 bits)
///   Note: PUC Lua 5.4 packs C below B; here the layout is simply
///   opcode(7) | k(1) | A(8) | B(8) | C(8).
/// - For iABx: Bx = bits 16-31 (unsigned 16 bits)
/// - For iAsBx: sBx = Bx - offset (signed interpretation)
/// - For iAx: Ax = bits 8-31 (24 bits, unsigned)
/// - For isJ: sJ = bits 8-31 (24 bits, signed with offset)
///
/// Immediate operands in B or C (ADDI, EQI, GETI, ...) are biased by
/// [`OFFSET_SC`] so small negative numbers fit the unsigned field.
use std::fmt;

/// Size constants for instruction fields.
const SIZE_OP: u32 = 7;
const SIZE_K: u32 = 1;
const SIZE_A: u32 = 8;
const SIZE_B: u32 = 8;
const SIZE_C: u32 = 8;
const SIZE_BX: u32 = SIZE_B + SIZE_C; // 16
const SIZE_AX: u32 = SIZE_A + SIZE_B + SIZE_C; // 24
const SIZE_SJ: u32 = SIZE_A + SIZE_B + SIZE_C; // 24

/// Position constants.
const POS_OP: u32 = 0;
const POS_K: u32 = POS_OP + SIZE_OP; // 7
const POS_A: u32 = POS_K + SIZE_K; // 8
const POS_B: u32 = POS_A + SIZE_A; // 16
const POS_C: u32 = POS_B + SIZE_B; // 24

const fn mask(n: u32) -> u32 {
    (1 << n) - 1
}

pub const MAX_A: u32 = mask(SIZE_A); // 255
pub const MAX_B: u32 = mask(SIZE_B); // 255
pub const MAX_C: u32 = mask(SIZE_C); // 255
pub const MAX_BX: u32 = mask(SIZE_BX); // 65535
pub const MAX_SBX: i32 = (MAX_BX >> 1) as i32; // 32767
pub const MIN_SBX: i32 = -MAX_SBX; // -32767
pub const MAX_AX: u32 = mask(SIZE_AX); // 16777215
pub const MAX_SJ: i32 = (mask(SIZE_SJ) >> 1) as i32; // 8388607
pub const MIN_SJ: i32 = -MAX_SJ; // -8388607

const OFFSET_SBX: i32 = MAX_SBX;
const OFFSET_SJ: i32 = MAX_SJ;

/// Bias for signed immediates packed into an 8-bit B or C field.
pub const OFFSET_SC: i32 = (MAX_C >> 1) as i32; // 127

/// Register sentinel for "no register" (TESTSET placeholder).
pub const NO_REG: u8 = MAX_A as u8;

/// True if `i` fits a biased 8-bit immediate field.
pub fn fits_sc(i: i64) -> bool {
    (-OFFSET_SC as i64..=(MAX_C as i64 - OFFSET_SC as i64)).contains(&i)
}

/// Encode a signed immediate into an 8-bit field.
pub fn int2sc(i: i64) -> u8 {
    debug_assert!(fits_sc(i));
    (i + OFFSET_SC as i64) as u8
}

/// Decode an 8-bit field back to a signed immediate.
pub fn sc2int(raw: u8) -> i32 {
    raw as i32 - OFFSET_SC
}

/// The Lua 5.4 opcode set (final numbering), minus the metamethod-hint
/// and to-be-closed instructions this front end never emits, plus ISDEF
/// from the 5.4-work `undef` experiment.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum OpCode {
    Move = 0,
    LoadI,
    LoadF,
    LoadK,
    LoadKX,
    LoadFalse,
    LFalseSkip,
    LoadTrue,
    LoadNil,
    GetUpval,
    SetUpval,
    GetTabUp,
    GetTable,
    GetI,
    GetField,
    SetTabUp,
    SetTable,
    SetI,
    SetField,
    NewTable,
    Self_,
    AddI,
    AddK,
    SubK,
    MulK,
    ModK,
    PowK,
    DivK,
    IDivK,
    BAndK,
    BOrK,
    BXorK,
    ShrI,
    ShlI,
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
    Unm,
    BNot,
    Not,
    Len,
    Concat,
    Close,
    Jmp,
    Eq,
    Lt,
    Le,
    EqK,
    EqI,
    LtI,
    LeI,
    GtI,
    GeI,
    Test,
    TestSet,
    IsDef,
    Call,
    TailCall,
    Return,
    Return0,
    Return1,
    ForLoop,
    ForPrep,
    TForPrep,
    TForCall,
    TForLoop,
    SetList,
    Closure,
    VarArg,
    VarArgPrep,
    ExtraArg,
}

impl OpCode {
    /// Number of opcodes.
    pub const COUNT: usize = OpCode::ExtraArg as usize + 1;

    /// Get the opcode from a u8 value.
    pub fn from_u8(val: u8) -> Option<OpCode> {
        if (val as usize) < Self::COUNT {
            // Safety: OpCode is repr(u8) and the range was checked
            Some(unsafe { std::mem::transmute::<u8, OpCode>(val) })
        } else {
            None
        }
    }

    /// Get the instruction format for this opcode.
    pub fn format(&self) -> InstructionFormat {
        use InstructionFormat::*;
        use OpCode::*;
        match self {
            ExtraArg => IAx,
            Jmp => IsJ,
            LoadI | LoadF => IAsBx,
            LoadK | LoadKX | Closure | ForLoop | ForPrep | TForPrep | TForLoop => IABx,
            _ => IABC,
        }
    }

    /// Get the name of this opcode.
    pub fn name(&self) -> &'static str {
        use OpCode::*;
        match self {
            Move => "MOVE",
            LoadI => "LOADI",
            LoadF => "LOADF",
            LoadK => "LOADK",
            LoadKX => "LOADKX",
            LoadFalse => "LOADFALSE",
            LFalseSkip => "LFALSESKIP",
            LoadTrue => "LOADTRUE",
            LoadNil => "LOADNIL",
            GetUpval => "GETUPVAL",
            SetUpval => "SETUPVAL",
            GetTabUp => "GETTABUP",
            GetTable => "GETTABLE",
            GetI => "GETI",
            GetField => "GETFIELD",
            SetTabUp => "SETTABUP",
            SetTable => "SETTABLE",
            SetI => "SETI",
            SetField => "SETFIELD",
            NewTable => "NEWTABLE",
            Self_ => "SELF",
            AddI => "ADDI",
            AddK => "ADDK",
            SubK => "SUBK",
            MulK => "MULK",
            ModK => "MODK",
            PowK => "POWK",
            DivK => "DIVK",
            IDivK => "IDIVK",
            BAndK => "BANDK",
            BOrK => "BORK",
            BXorK => "BXORK",
            ShrI => "SHRI",
            ShlI => "SHLI",
            Add => "ADD",
            Sub => "SUB",
            Mul => "MUL",
            Mod => "MOD",
            Pow => "POW",
            Div => "DIV",
            IDiv => "IDIV",
            BAnd => "BAND",
            BOr => "BOR",
            BXor => "BXOR",
            Shl => "SHL",
            Shr => "SHR",
            Unm => "UNM",
            BNot => "BNOT",
            Not => "NOT",
            Len => "LEN",
            Concat => "CONCAT",
            Close => "CLOSE",
            Jmp => "JMP",
            Eq => "EQ",
            Lt => "LT",
            Le => "LE",
            EqK => "EQK",
            EqI => "EQI",
            LtI => "LTI",
            LeI => "LEI",
            GtI => "GTI",
            GeI => "GEI",
            Test => "TEST",
            TestSet => "TESTSET",
            IsDef => "ISDEF",
            Call => "CALL",
            TailCall => "TAILCALL",
            Return => "RETURN",
            Return0 => "RETURN0",
            Return1 => "RETURN1",
            ForLoop => "FORLOOP",
            ForPrep => "FORPREP",
            TForPrep => "TFORPREP",
            TForCall => "TFORCALL",
            TForLoop => "TFORLOOP",
            SetList => "SETLIST",
            Closure => "CLOSURE",
            VarArg => "VARARG",
            VarArgPrep => "VARARGPREP",
            ExtraArg => "EXTRAARG",
        }
    }

    /// True for instructions in test mode: they conditionally skip the
    /// jump that must follow them.
    pub fn is_test(&self) -> bool {
        use OpCode::*;
        matches!(
            self,
            Eq | Lt | Le | EqK | EqI | LtI | LeI | GtI | GeI | Test | TestSet
        )
    }
}

/// Instruction format types.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum InstructionFormat {
    IABC,
    IABx,
    IAsBx, // signed Bx, same bits as ABx
    IAx,
    IsJ,
}

/// A 32-bit bytecode instruction.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct Instruction(pub u32);

impl Instruction {
    // ---- Constructors ----

    /// Create an iABC instruction.
    pub fn abc(op: OpCode, a: u8, b: u8, c: u8, k: bool) -> Self {
        let mut i = (op as u32) << POS_OP;
        i |= (k as u32) << POS_K;
        i |= (a as u32) << POS_A;
        i |= (b as u32) << POS_B;
        i |= (c as u32) << POS_C;
        Instruction(i)
    }

    /// Create an iABx instruction.
    pub fn abx(op: OpCode, a: u8, bx: u32) -> Self {
        debug_assert!(bx <= MAX_BX, "Bx out of range: {bx}");
        let mut i = (op as u32) << POS_OP;
        i |= (a as u32) << POS_A;
        i |= bx << POS_B;
        Instruction(i)
    }

    /// Create an iAsBx instruction (signed Bx).
    pub fn asbx(op: OpCode, a: u8, sbx: i32) -> Self {
        debug_assert!(sbx >= MIN_SBX && sbx <= MAX_SBX, "sBx out of range: {sbx}");
        let bx = (sbx + OFFSET_SBX) as u32;
        Self::abx(op, a, bx)
    }

    /// Create an iAx instruction.
    pub fn ax(op: OpCode, ax: u32) -> Self {
        debug_assert!(ax <= MAX_AX, "Ax out of range: {ax}");
        let mut i = (op as u32) << POS_OP;
        i |= ax << POS_A;
        Instruction(i)
    }

    /// Create an isJ instruction (signed jump).
    pub fn sj(op: OpCode, sj: i32) -> Self {
        debug_assert!(sj >= MIN_SJ && sj <= MAX_SJ, "sJ out of range: {sj}");
        let val = (sj + OFFSET_SJ) as u32;
        let mut i = (op as u32) << POS_OP;
        i |= val << POS_A;
        Instruction(i)
    }

    // ---- Decoders ----

    /// Get the opcode.
    pub fn opcode(&self) -> OpCode {
        let val = (self.0 >> POS_OP) & mask(SIZE_OP);
        OpCode::from_u8(val as u8).unwrap_or(OpCode::Move)
    }

    /// Get the k flag.
    pub fn k(&self) -> bool {
        ((self.0 >> POS_K) & 1) != 0
    }

    /// Get field A.
    pub fn a(&self) -> u8 {
        ((self.0 >> POS_A) & mask(SIZE_A)) as u8
    }

    /// Get field B.
    pub fn b(&self) -> u8 {
        ((self.0 >> POS_B) & mask(SIZE_B)) as u8
    }

    /// Get field C.
    pub fn c(&self) -> u8 {
        ((self.0 >> POS_C) & mask(SIZE_C)) as u8
    }

    /// Get field Bx (unsigned).
    pub fn bx(&self) -> u32 {
        (self.0 >> POS_B) & mask(SIZE_BX)
    }

    /// Get field sBx (signed).
    pub fn sbx(&self) -> i32 {
        self.bx() as i32 - OFFSET_SBX
    }

    /// Get field Ax (unsigned).
    pub fn ax_field(&self) -> u32 {
        (self.0 >> POS_A) & mask(SIZE_AX)
    }

    /// Get field sJ (signed jump).
    pub fn get_sj(&self) -> i32 {
        let val = (self.0 >> POS_A) & mask(SIZE_SJ);
        val as i32 - OFFSET_SJ
    }

    // ---- Mutators (for backpatching) ----

    /// Set the opcode, keeping all operand bits.
    pub fn set_opcode(&mut self, op: OpCode) {
        self.0 = (self.0 & !(mask(SIZE_OP) << POS_OP)) | ((op as u32) << POS_OP);
    }

    /// Set field A.
    pub fn set_a(&mut self, a: u8) {
        self.0 = (self.0 & !(mask(SIZE_A) << POS_A)) | ((a as u32) << POS_A);
    }

    /// Set field B.
    pub fn set_b(&mut self, b: u8) {
        self.0 = (self.0 & !(mask(SIZE_B) << POS_B)) | ((b as u32) << POS_B);
    }

    /// Set field C.
    pub fn set_c(&mut self, c: u8) {
        self.0 = (self.0 & !(mask(SIZE_C) << POS_C)) | ((c as u32) << POS_C);
    }

    /// Set field Bx.
    pub fn set_bx(&mut self, bx: u32) {
        debug_assert!(bx <= MAX_BX);
        self.0 = (self.0 & !(mask(SIZE_BX) << POS_B)) | (bx << POS_B);
    }

    /// Set field sBx.
    pub fn set_sbx(&mut self, sbx: i32) {
        debug_assert!(sbx >= MIN_SBX && sbx <= MAX_SBX);
        self.set_bx((sbx + OFFSET_SBX) as u32);
    }

    /// Set field sJ.
    pub fn set_sj(&mut self, sj: i32) {
        debug_assert!(sj >= MIN_SJ && sj <= MAX_SJ);
        let val = (sj + OFFSET_SJ) as u32;
        self.0 = (self.0 & !(mask(SIZE_SJ) << POS_A)) | (val << POS_A);
    }

    /// Set the k flag.
    pub fn set_k(&mut self, k: bool) {
        self.0 = (self.0 & !(1 << POS_K)) | ((k as u32) << POS_K);
    }
}

impl fmt::Debug for Instruction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let op = self.opcode();
        write!(f, "{}", op.name())?;
        match op.format() {
            InstructionFormat::IABC => {
                write!(f, " {} {} {}", self.a(), self.b(), self.c())?;
                if self.k() {
                    write!(f, " k")?;
                }
            }
            InstructionFormat::IABx => write!(f, " {} {}", self.a(), self.bx())?,
            InstructionFormat::IAsBx => write!(f, " {} {}", self.a(), self.sbx())?,
            InstructionFormat::IAx => write!(f, " {}", self.ax_field())?,
            InstructionFormat::IsJ => write!(f, " {}", self.get_sj())?,
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_abc_roundtrip() {
        let i = Instruction::abc(OpCode::GetField, 3, 7, 200, true);
        assert_eq!(i.opcode(), OpCode::GetField);
        assert_eq!(i.a(), 3);
        assert_eq!(i.b(), 7);
        assert_eq!(i.c(), 200);
        assert!(i.k());
    }

    #[test]
    fn test_abx_roundtrip() {
        let i = Instruction::abx(OpCode::LoadK, 5, MAX_BX);
        assert_eq!(i.opcode(), OpCode::LoadK);
        assert_eq!(i.a(), 5);
        assert_eq!(i.bx(), MAX_BX);
    }

    #[test]
    fn test_asbx_roundtrip() {
        for sbx in [MIN_SBX, -1, 0, 1, MAX_SBX] {
            let i = Instruction::asbx(OpCode::LoadI, 0, sbx);
            assert_eq!(i.sbx(), sbx, "sbx {sbx}");
        }
    }

    #[test]
    fn test_ax_roundtrip() {
        let i = Instruction::ax(OpCode::ExtraArg, MAX_AX);
        assert_eq!(i.ax_field(), MAX_AX);
    }

    #[test]
    fn test_sj_roundtrip() {
        for sj in [MIN_SJ, -1, 0, 42, MAX_SJ] {
            let i = Instruction::sj(OpCode::Jmp, sj);
            assert_eq!(i.get_sj(), sj, "sj {sj}");
        }
    }

    #[test]
    fn test_mutators() {
        let mut i = Instruction::abc(OpCode::TestSet, 1, 2, 0, false);
        i.set_a(9);
        i.set_b(11);
        i.set_c(13);
        i.set_k(true);
        assert_eq!((i.a(), i.b(), i.c(), i.k()), (9, 11, 13, true));
        i.set_opcode(OpCode::Test);
        assert_eq!(i.opcode(), OpCode::Test);
        assert_eq!(i.a(), 9);
    }

    #[test]
    fn test_sj_mutation() {
        let mut i = Instruction::sj(OpCode::Jmp, -1);
        assert_eq!(i.get_sj(), -1);
        i.set_sj(1000);
        assert_eq!(i.get_sj(), 1000);
        assert_eq!(i.opcode(), OpCode::Jmp);
    }

    #[test]
    fn test_from_u8() {
        assert_eq!(OpCode::from_u8(0), Some(OpCode::Move));
        assert_eq!(
            OpCode::from_u8(OpCode::ExtraArg as u8),
            Some(OpCode::ExtraArg)
        );
        assert_eq!(OpCode::from_u8(OpCode::COUNT as u8), None);
        assert_eq!(OpCode::from_u8(255), None);
    }

    #[test]
    fn test_formats() {
        assert_eq!(OpCode::Move.format(), InstructionFormat::IABC);
        assert_eq!(OpCode::LoadK.format(), InstructionFormat::IABx);
        assert_eq!(OpCode::LoadI.format(), InstructionFormat::IAsBx);
        assert_eq!(OpCode::ForPrep.format(), InstructionFormat::IABx);
        assert_eq!(OpCode::ExtraArg.format(), InstructionFormat::IAx);
        assert_eq!(OpCode::Jmp.format(), InstructionFormat::IsJ);
    }

    #[test]
    fn test_is_test() {
        assert!(OpCode::Eq.is_test());
        assert!(OpCode::LtI.is_test());
        assert!(OpCode::Test.is_test());
        assert!(OpCode::TestSet.is_test());
        assert!(!OpCode::IsDef.is_test());
        assert!(!OpCode::Jmp.is_test());
        assert!(!OpCode::Add.is_test());
    }

    #[test]
    fn test_signed_immediates() {
        assert!(fits_sc(0));
        assert!(fits_sc(-127));
        assert!(fits_sc(128));
        assert!(!fits_sc(-128));
        assert!(!fits_sc(129));
        assert_eq!(sc2int(int2sc(-127)), -127);
        assert_eq!(sc2int(int2sc(0)), 0);
        assert_eq!(sc2int(int2sc(128)), 128);
    }

    #[test]
    fn test_opcode_names_unique() {
        let mut names = std::collections::HashSet::new();
        for v in 0..OpCode::COUNT as u8 {
            let op = OpCode::from_u8(v).unwrap();
            assert!(names.insert(op.name()), "duplicate name {}", op.name());
        }
    }
}
