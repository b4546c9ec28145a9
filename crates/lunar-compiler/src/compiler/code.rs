/// The code generator: everything that turns expression descriptors into
/// instructions. The parser owns the grammar; register discipline, jump
/// patch lists, constant folding and operand selection all live here as
/// methods on [`FuncState`].
use crate::compiler::expr::{BinOp, ExpDesc, ExpKind, UnOp, NO_JUMP};
use crate::compiler::{CompileError, ErrorKind, FuncState};
use crate::opcode::{
    fits_sc, int2sc, Instruction, OpCode, MAX_AX, MAX_BX, MAX_C, MAX_SBX, MAX_SJ, MIN_SBX, NO_REG,
};
use crate::proto::Constant;
use lunar_core::string::StringId;

/// Marker for "as many results as produced" in calls, returns and vararg.
pub const MULTRET: i32 = -1;

/// Registers stop here; one is reserved as the NO_REG sentinel.
pub const MAX_REGS: u32 = 254;

/// Array items accumulated before a SETLIST flush.
pub const FIELDS_PER_FLUSH: i32 = 50;

/// Key for constant-pool deduplication. Integers and floats never unify
/// (1 and 1.0 get distinct slots); floats are keyed by their bits.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub enum ConstKey {
    Nil,
    Bool(bool),
    Int(i64),
    Float(u64),
    Str(StringId),
}

impl FuncState {
    // ---- Errors ----

    pub(crate) fn syntax_error(&self, message: impl Into<String>, line: u32) -> CompileError {
        CompileError::new(ErrorKind::Syntax, message, line)
    }

    pub(crate) fn semantic_error(&self, message: impl Into<String>, line: u32) -> CompileError {
        CompileError::new(ErrorKind::Semantic, message, line)
    }

    /// Resource-limit error naming the offending function.
    pub(crate) fn limit_error(&self, what: &str, limit: usize, line: u32) -> CompileError {
        let where_ = if self.proto.line_defined == 0 {
            "main function".to_string()
        } else {
            format!("function at line {}", self.proto.line_defined)
        };
        self.syntax_error(
            format!("too many {what} (limit is {limit}) in {where_}"),
            line,
        )
    }

    pub(crate) fn check_limit(
        &self,
        value: usize,
        limit: usize,
        what: &str,
        line: u32,
    ) -> Result<(), CompileError> {
        if value > limit {
            Err(self.limit_error(what, limit, line))
        } else {
            Ok(())
        }
    }

    // ---- Raw emission ----

    pub(crate) fn pc(&self) -> i32 {
        self.proto.code.len() as i32
    }

    pub(crate) fn code(&mut self, inst: Instruction, line: u32) -> i32 {
        self.proto.emit(inst, line) as i32
    }

    /// Re-attribute the last emitted instruction to `line`.
    pub(crate) fn fix_line(&mut self, line: u32) {
        if let Some(l) = self.proto.line_info.last_mut() {
            *l = line;
        }
    }

    fn remove_last_instruction(&mut self) {
        self.proto.code.pop();
        self.proto.line_info.pop();
    }

    // ---- Registers ----

    pub(crate) fn check_stack(&mut self, n: u8, line: u32) -> Result<(), CompileError> {
        let new = self.freereg as u32 + n as u32;
        if new > self.proto.max_stack_size as u32 {
            if new > MAX_REGS {
                return Err(self.syntax_error(
                    "function or expression needs too many registers",
                    line,
                ));
            }
            self.proto.max_stack_size = new as u8;
        }
        Ok(())
    }

    pub(crate) fn reserve_regs(&mut self, n: u8, line: u32) -> Result<(), CompileError> {
        self.check_stack(n, line)?;
        self.freereg += n;
        Ok(())
    }

    /// Free a register if it holds a temporary. Temporaries are only ever
    /// freed from the top of the stack.
    fn free_reg(&mut self, r: i32) {
        if r >= self.nactvar as i32 {
            self.freereg -= 1;
            debug_assert_eq!(r, self.freereg as i32);
        }
    }

    pub(crate) fn free_exp(&mut self, e: &ExpDesc) {
        if let ExpKind::NonReloc(r) = e.kind {
            self.free_reg(r as i32);
        }
    }

    /// Free both operand registers, higher one first.
    fn free_exps(&mut self, e1: &ExpDesc, e2: &ExpDesc) {
        let r1 = match e1.kind {
            ExpKind::NonReloc(r) => r as i32,
            _ => -1,
        };
        let r2 = match e2.kind {
            ExpKind::NonReloc(r) => r as i32,
            _ => -1,
        };
        if r1 > r2 {
            self.free_reg(r1);
            self.free_reg(r2);
        } else {
            self.free_reg(r2);
            self.free_reg(r1);
        }
    }

    // ---- Jumps and patch lists ----

    /// Emit a forward jump with an empty offset (it becomes the head of a
    /// patch list until fixed).
    pub(crate) fn jump(&mut self, line: u32) -> i32 {
        self.code(Instruction::sj(OpCode::Jmp, NO_JUMP), line)
    }

    pub(crate) fn jump_to(&mut self, target: i32, line: u32) -> Result<(), CompileError> {
        let j = self.jump(line);
        self.patch_list(j, target, line)
    }

    /// Next element of a patch list threaded through jump offsets.
    fn get_jump(&self, pc: i32) -> i32 {
        let offset = self.proto.code[pc as usize].get_sj();
        if offset == NO_JUMP {
            NO_JUMP
        } else {
            pc + 1 + offset
        }
    }

    fn fix_jump(&mut self, pc: i32, dest: i32, line: u32) -> Result<(), CompileError> {
        debug_assert!(dest != NO_JUMP);
        let offset = dest - (pc + 1);
        if !(-MAX_SJ..=MAX_SJ).contains(&offset) {
            return Err(self.syntax_error("control structure too long", line));
        }
        self.proto.code[pc as usize].set_sj(offset);
        Ok(())
    }

    /// Splice list `l2` onto the end of `*l1`.
    pub(crate) fn concat_jumps(
        &mut self,
        l1: &mut i32,
        l2: i32,
        line: u32,
    ) -> Result<(), CompileError> {
        if l2 == NO_JUMP {
            return Ok(());
        }
        if *l1 == NO_JUMP {
            *l1 = l2;
            return Ok(());
        }
        let mut list = *l1;
        loop {
            let next = self.get_jump(list);
            if next == NO_JUMP {
                break;
            }
            list = next;
        }
        self.fix_jump(list, l2, line)
    }

    /// Mark the current position as a jump target, blocking peephole
    /// optimizations across it.
    pub(crate) fn get_label(&mut self) -> i32 {
        self.last_target = self.pc();
        self.last_target
    }

    /// pc of the instruction controlling the jump at `pc` (the preceding
    /// one when it is in test mode).
    fn jump_control_pc(&self, pc: i32) -> i32 {
        if pc >= 1 && self.proto.code[(pc - 1) as usize].opcode().is_test() {
            pc - 1
        } else {
            pc
        }
    }

    /// Give the TESTSET controlling `node` its destination register, or
    /// demote it to TEST when no value is wanted. Returns false when the
    /// node produces no value (not a TESTSET).
    fn patch_test_reg(&mut self, node: i32, reg: u8) -> bool {
        let ctrl = self.jump_control_pc(node) as usize;
        let i = self.proto.code[ctrl];
        if i.opcode() != OpCode::TestSet {
            return false;
        }
        if reg != NO_REG && reg != i.b() {
            self.proto.code[ctrl].set_a(reg);
        } else {
            self.proto.code[ctrl] = Instruction::abc(OpCode::Test, i.b(), 0, 0, i.k());
        }
        true
    }

    /// Drop the values produced by a list (conditions used only for
    /// control flow).
    fn remove_values(&mut self, mut list: i32) {
        while list != NO_JUMP {
            self.patch_test_reg(list, NO_REG);
            list = self.get_jump(list);
        }
    }

    fn patch_list_aux(
        &mut self,
        mut list: i32,
        vtarget: i32,
        reg: u8,
        dtarget: i32,
        line: u32,
    ) -> Result<(), CompileError> {
        while list != NO_JUMP {
            let next = self.get_jump(list);
            if self.patch_test_reg(list, reg) {
                self.fix_jump(list, vtarget, line)?;
            } else {
                self.fix_jump(list, dtarget, line)?;
            }
            list = next;
        }
        Ok(())
    }

    pub(crate) fn patch_list(
        &mut self,
        list: i32,
        target: i32,
        line: u32,
    ) -> Result<(), CompileError> {
        if target == self.pc() {
            self.patch_to_here(list, line)
        } else {
            debug_assert!(target < self.pc());
            self.patch_list_aux(list, target, NO_REG, target, line)
        }
    }

    pub(crate) fn patch_to_here(&mut self, list: i32, line: u32) -> Result<(), CompileError> {
        let here = self.get_label();
        self.patch_list_aux(list, here, NO_REG, here, line)
    }

    /// Does some node of the list need an actual value (anything but a
    /// bare TESTSET)?
    fn need_value(&self, mut list: i32) -> bool {
        while list != NO_JUMP {
            let ctrl = self.jump_control_pc(list) as usize;
            if self.proto.code[ctrl].opcode() != OpCode::TestSet {
                return true;
            }
            list = self.get_jump(list);
        }
        false
    }

    // ---- Constants ----

    fn add_k(&mut self, key: ConstKey, value: Constant, line: u32) -> Result<u32, CompileError> {
        if let Some(&idx) = self.constants.get(&key) {
            return Ok(idx);
        }
        if self.proto.constants.len() as u32 >= MAX_AX {
            return Err(self.limit_error("constants", MAX_AX as usize, line));
        }
        let idx = self.proto.add_constant(value);
        self.constants.insert(key, idx);
        Ok(idx)
    }

    pub(crate) fn string_k(&mut self, id: StringId, line: u32) -> Result<u32, CompileError> {
        self.add_k(ConstKey::Str(id), Constant::String(id), line)
    }

    pub(crate) fn int_k(&mut self, i: i64, line: u32) -> Result<u32, CompileError> {
        self.add_k(ConstKey::Int(i), Constant::Integer(i), line)
    }

    fn float_k(&mut self, f: f64, line: u32) -> Result<u32, CompileError> {
        self.add_k(ConstKey::Float(f.to_bits()), Constant::Float(f), line)
    }

    fn bool_k(&mut self, b: bool, line: u32) -> Result<u32, CompileError> {
        self.add_k(ConstKey::Bool(b), Constant::Boolean(b), line)
    }

    fn nil_k(&mut self, line: u32) -> Result<u32, CompileError> {
        self.add_k(ConstKey::Nil, Constant::Nil, line)
    }

    // ---- Loading values into registers ----

    /// LOADNIL, merging with an adjacent previous LOADNIL when no jump
    /// target separates them.
    pub(crate) fn code_nil(&mut self, from: u8, n: u8, line: u32) {
        let last = from as i32 + n as i32 - 1;
        if self.pc() > self.last_target {
            if let Some(prev) = self.proto.code.last().copied() {
                if prev.opcode() == OpCode::LoadNil {
                    let pfrom = prev.a() as i32;
                    let plast = pfrom + prev.b() as i32;
                    if (pfrom <= from as i32 && from as i32 <= plast + 1)
                        || (from as i32 <= pfrom && pfrom <= last + 1)
                    {
                        let nfrom = pfrom.min(from as i32);
                        let nlast = plast.max(last);
                        let prev = self.proto.code.last_mut().unwrap();
                        prev.set_a(nfrom as u8);
                        prev.set_b((nlast - nfrom) as u8);
                        return;
                    }
                }
            }
        }
        self.code(Instruction::abc(OpCode::LoadNil, from, n - 1, 0, false), line);
    }

    /// Load an integer: immediate when it fits sBx, else the pool.
    fn code_int(&mut self, reg: u8, i: i64, line: u32) -> Result<(), CompileError> {
        if (MIN_SBX as i64..=MAX_SBX as i64).contains(&i) {
            self.code(Instruction::asbx(OpCode::LoadI, reg, i as i32), line);
            Ok(())
        } else {
            let k = self.int_k(i, line)?;
            self.code_k(reg, k, line)
        }
    }

    /// Load a float: LOADF for exact small integral values, else the pool.
    fn code_float(&mut self, reg: u8, f: f64, line: u32) -> Result<(), CompileError> {
        let i = f as i64;
        if i as f64 == f
            && f.to_bits() != (-0.0f64).to_bits()
            && (MIN_SBX as i64..=MAX_SBX as i64).contains(&i)
        {
            self.code(Instruction::asbx(OpCode::LoadF, reg, i as i32), line);
            Ok(())
        } else {
            let k = self.float_k(f, line)?;
            self.code_k(reg, k, line)
        }
    }

    fn code_k(&mut self, reg: u8, k: u32, line: u32) -> Result<(), CompileError> {
        if k <= MAX_BX {
            self.code(Instruction::abx(OpCode::LoadK, reg, k), line);
        } else {
            self.code(Instruction::abx(OpCode::LoadKX, reg, 0), line);
            self.code(Instruction::ax(OpCode::ExtraArg, k), line);
        }
        Ok(())
    }

    // ---- The discharge family ----

    /// Resolve variable reads and pending indexings into concrete
    /// instructions; the result no longer depends on other code.
    pub(crate) fn discharge_vars(
        &mut self,
        e: &mut ExpDesc,
        line: u32,
    ) -> Result<(), CompileError> {
        match e.kind {
            ExpKind::Local(r) => e.kind = ExpKind::NonReloc(r),
            ExpKind::Upval(up) => {
                let pc = self.code(Instruction::abc(OpCode::GetUpval, 0, up, 0, false), line);
                e.kind = ExpKind::Reloc(pc);
            }
            ExpKind::IndexedUp { table, key } => {
                let pc = self.code(
                    Instruction::abc(OpCode::GetTabUp, 0, table, key as u8, false),
                    line,
                );
                e.kind = ExpKind::Reloc(pc);
            }
            ExpKind::IndexedI { table, key } => {
                self.free_reg(table as i32);
                let pc = self.code(Instruction::abc(OpCode::GetI, 0, table, key, false), line);
                e.kind = ExpKind::Reloc(pc);
            }
            ExpKind::IndexedStr { table, key } => {
                self.free_reg(table as i32);
                let pc = self.code(
                    Instruction::abc(OpCode::GetField, 0, table, key as u8, false),
                    line,
                );
                e.kind = ExpKind::Reloc(pc);
            }
            ExpKind::Indexed { table, key } => {
                // key sits above the table; free both
                self.free_reg(key as i32);
                self.free_reg(table as i32);
                let pc = self.code(
                    Instruction::abc(OpCode::GetTable, 0, table, key, false),
                    line,
                );
                e.kind = ExpKind::Reloc(pc);
            }
            ExpKind::Call(_) => self.set_one_ret(e),
            ExpKind::Vararg(pc) => {
                self.proto.code[pc as usize].set_c(2);
                e.kind = ExpKind::Reloc(pc);
            }
            ExpKind::Undef => {
                return Err(self.semantic_error("'undef' is not a value", line));
            }
            _ => {}
        }
        Ok(())
    }

    /// Put the expression's value in `reg`, except for bare tests (the
    /// caller folds those into the jump lists).
    fn discharge_to_reg(
        &mut self,
        e: &mut ExpDesc,
        reg: u8,
        line: u32,
    ) -> Result<(), CompileError> {
        self.discharge_vars(e, line)?;
        match e.kind {
            ExpKind::Nil => self.code_nil(reg, 1, line),
            ExpKind::False => {
                self.code(Instruction::abc(OpCode::LoadFalse, reg, 0, 0, false), line);
            }
            ExpKind::True => {
                self.code(Instruction::abc(OpCode::LoadTrue, reg, 0, 0, false), line);
            }
            ExpKind::KStr(id) => {
                let k = self.string_k(id, line)?;
                self.code_k(reg, k, line)?;
            }
            ExpKind::KInt(i) => self.code_int(reg, i, line)?,
            ExpKind::KFloat(f) => self.code_float(reg, f, line)?,
            ExpKind::Const(k) => self.code_k(reg, k, line)?,
            ExpKind::Reloc(pc) => self.proto.code[pc as usize].set_a(reg),
            ExpKind::NonReloc(r) => {
                if r != reg {
                    self.code(Instruction::abc(OpCode::Move, reg, r, 0, false), line);
                }
            }
            ExpKind::Jump(_) => return Ok(()),
            _ => {
                debug_assert!(false, "cannot discharge {:?}", e.kind);
                return Ok(());
            }
        }
        e.kind = ExpKind::NonReloc(reg);
        Ok(())
    }

    fn discharge_to_any_reg(&mut self, e: &mut ExpDesc, line: u32) -> Result<(), CompileError> {
        if !matches!(e.kind, ExpKind::NonReloc(_)) {
            self.reserve_regs(1, line)?;
            let reg = self.freereg - 1;
            self.discharge_to_reg(e, reg, line)?;
        }
        Ok(())
    }

    fn code_loadbool(&mut self, reg: u8, op: OpCode, line: u32) -> i32 {
        self.get_label(); // these instructions may be jump targets
        self.code(Instruction::abc(op, reg, 0, 0, false), line)
    }

    /// Force the value into `reg`, collapsing the true/false lists. The
    /// LFALSESKIP/LOADTRUE pair is emitted only when some jump actually
    /// needs a materialized boolean.
    fn exp2reg(&mut self, e: &mut ExpDesc, reg: u8, line: u32) -> Result<(), CompileError> {
        self.discharge_to_reg(e, reg, line)?;
        if let ExpKind::Jump(pc) = e.kind {
            let mut t = e.t;
            self.concat_jumps(&mut t, pc, line)?;
            e.t = t;
        }
        if e.has_jumps() {
            let mut p_f = NO_JUMP;
            let mut p_t = NO_JUMP;
            if self.need_value(e.t) || self.need_value(e.f) {
                let fj = if matches!(e.kind, ExpKind::Jump(_)) {
                    NO_JUMP
                } else {
                    self.jump(line)
                };
                p_f = self.code_loadbool(reg, OpCode::LFalseSkip, line);
                p_t = self.code_loadbool(reg, OpCode::LoadTrue, line);
                // jump over the booleans when the value arrived normally
                self.patch_to_here(fj, line)?;
            }
            let end = self.get_label();
            self.patch_list_aux(e.f, end, reg, p_f, line)?;
            self.patch_list_aux(e.t, end, reg, p_t, line)?;
        }
        e.t = NO_JUMP;
        e.f = NO_JUMP;
        e.kind = ExpKind::NonReloc(reg);
        Ok(())
    }

    pub(crate) fn exp2next_reg(&mut self, e: &mut ExpDesc, line: u32) -> Result<u8, CompileError> {
        self.discharge_vars(e, line)?;
        self.free_exp(e);
        self.reserve_regs(1, line)?;
        let reg = self.freereg - 1;
        self.exp2reg(e, reg, line)?;
        Ok(reg)
    }

    pub(crate) fn exp2any_reg(&mut self, e: &mut ExpDesc, line: u32) -> Result<u8, CompileError> {
        self.discharge_vars(e, line)?;
        if let ExpKind::NonReloc(r) = e.kind {
            if !e.has_jumps() {
                return Ok(r);
            }
            if r >= self.nactvar {
                // temporary: can collapse the jumps onto it in place
                self.exp2reg(e, r, line)?;
                return Ok(r);
            }
        }
        self.exp2next_reg(e, line)
    }

    /// Register or upvalue, whichever the value already is.
    pub(crate) fn exp2any_regup(&mut self, e: &mut ExpDesc, line: u32) -> Result<(), CompileError> {
        if !matches!(e.kind, ExpKind::Upval(_)) || e.has_jumps() {
            self.exp2any_reg(e, line)?;
        }
        Ok(())
    }

    /// Any shape with a definite value (register or literal/constant).
    pub(crate) fn exp2val(&mut self, e: &mut ExpDesc, line: u32) -> Result<(), CompileError> {
        if e.has_jumps() {
            self.exp2any_reg(e, line)?;
        } else {
            self.discharge_vars(e, line)?;
        }
        Ok(())
    }

    /// Try to turn the expression into a constant-pool operand (index must
    /// fit the C field).
    fn exp2k(&mut self, e: &mut ExpDesc, line: u32) -> Result<bool, CompileError> {
        if !e.has_jumps() {
            let info = match e.kind {
                ExpKind::True => self.bool_k(true, line)?,
                ExpKind::False => self.bool_k(false, line)?,
                ExpKind::Nil => self.nil_k(line)?,
                ExpKind::KInt(i) => self.int_k(i, line)?,
                ExpKind::KFloat(f) => self.float_k(f, line)?,
                ExpKind::KStr(s) => self.string_k(s, line)?,
                ExpKind::Const(k) => k,
                _ => return Ok(false),
            };
            if info <= MAX_C {
                e.kind = ExpKind::Const(info);
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// Constant operand (true) or register operand (false).
    pub(crate) fn exp2rk(&mut self, e: &mut ExpDesc, line: u32) -> Result<bool, CompileError> {
        if self.exp2k(e, line)? {
            Ok(true)
        } else {
            self.exp2any_reg(e, line)?;
            Ok(false)
        }
    }

    /// Operand byte after exp2rk: constant index or register.
    fn rk_operand(e: &ExpDesc) -> u8 {
        match e.kind {
            ExpKind::Const(k) => k as u8,
            ExpKind::NonReloc(r) => r,
            _ => {
                debug_assert!(false, "not an RK operand: {:?}", e.kind);
                0
            }
        }
    }

    // ---- Multiple results ----

    /// Fix a call or vararg to produce exactly `nresults` values
    /// ([`MULTRET`] keeps it open).
    pub(crate) fn set_returns(
        &mut self,
        e: &mut ExpDesc,
        nresults: i32,
        line: u32,
    ) -> Result<(), CompileError> {
        match e.kind {
            ExpKind::Call(pc) => {
                self.proto.code[pc as usize].set_c((nresults + 1) as u8);
            }
            ExpKind::Vararg(pc) => {
                let a = self.freereg;
                let inst = &mut self.proto.code[pc as usize];
                inst.set_c((nresults + 1) as u8);
                inst.set_a(a);
                self.reserve_regs(1, line)?;
            }
            _ => debug_assert!(false, "set_returns on {:?}", e.kind),
        }
        Ok(())
    }

    /// Close a multi-result expression down to one value.
    pub(crate) fn set_one_ret(&mut self, e: &mut ExpDesc) {
        match e.kind {
            ExpKind::Call(pc) => {
                // calls default to one result; the value is at the base
                let a = self.proto.code[pc as usize].a();
                e.kind = ExpKind::NonReloc(a);
            }
            ExpKind::Vararg(pc) => {
                self.proto.code[pc as usize].set_c(2);
                e.kind = ExpKind::Reloc(pc);
            }
            _ => {}
        }
    }

    // ---- Variables and indexing ----

    /// Turn `t` + key `k` into one of the four pending-indexing shapes,
    /// choosing the specialized instruction form when the key allows it.
    pub(crate) fn indexed(
        &mut self,
        t: &mut ExpDesc,
        k: &mut ExpDesc,
        line: u32,
    ) -> Result<(), CompileError> {
        debug_assert!(!t.has_jumps());
        let mut str_key = None;
        if let ExpKind::KStr(id) = k.kind {
            let idx = self.string_k(id, line)?;
            k.kind = ExpKind::Const(idx);
            if idx <= MAX_C {
                str_key = Some(idx);
            }
        }
        if matches!(t.kind, ExpKind::Upval(_)) && str_key.is_none() {
            // upvalues can only be indexed directly by short constants
            self.exp2any_reg(t, line)?;
        }
        if let ExpKind::Upval(up) = t.kind {
            if let Some(key) = str_key {
                t.kind = ExpKind::IndexedUp { table: up, key };
                return Ok(());
            }
        }
        let table = match t.kind {
            ExpKind::Local(r) | ExpKind::NonReloc(r) => r,
            _ => {
                debug_assert!(false, "cannot index {:?}", t.kind);
                0
            }
        };
        if let Some(key) = str_key {
            t.kind = ExpKind::IndexedStr { table, key };
        } else if let ExpKind::KInt(i) = k.kind {
            if !k.has_jumps() && (0..=MAX_C as i64).contains(&i) {
                t.kind = ExpKind::IndexedI {
                    table,
                    key: i as u8,
                };
            } else {
                let key = self.exp2any_reg(k, line)?;
                t.kind = ExpKind::Indexed { table, key };
            }
        } else {
            let key = self.exp2any_reg(k, line)?;
            t.kind = ExpKind::Indexed { table, key };
        }
        Ok(())
    }

    /// Store `e` into the variable described by `var`.
    pub(crate) fn store_var(
        &mut self,
        var: &ExpDesc,
        e: &mut ExpDesc,
        line: u32,
    ) -> Result<(), CompileError> {
        match var.kind {
            ExpKind::Local(reg) => {
                self.free_exp(e);
                return self.exp2reg(e, reg, line);
            }
            ExpKind::Upval(up) => {
                let r = self.exp2any_reg(e, line)?;
                self.code(Instruction::abc(OpCode::SetUpval, r, up, 0, false), line);
            }
            ExpKind::IndexedUp { table, key } => {
                let is_k = self.exp2rk(e, line)?;
                let v = Self::rk_operand(e);
                self.code(
                    Instruction::abc(OpCode::SetTabUp, table, key as u8, v, is_k),
                    line,
                );
            }
            ExpKind::IndexedI { table, key } => {
                let is_k = self.exp2rk(e, line)?;
                let v = Self::rk_operand(e);
                self.code(Instruction::abc(OpCode::SetI, table, key, v, is_k), line);
            }
            ExpKind::IndexedStr { table, key } => {
                let is_k = self.exp2rk(e, line)?;
                let v = Self::rk_operand(e);
                self.code(
                    Instruction::abc(OpCode::SetField, table, key as u8, v, is_k),
                    line,
                );
            }
            ExpKind::Indexed { table, key } => {
                let is_k = self.exp2rk(e, line)?;
                let v = Self::rk_operand(e);
                self.code(
                    Instruction::abc(OpCode::SetTable, table, key, v, is_k),
                    line,
                );
            }
            _ => debug_assert!(false, "store into {:?}", var.kind),
        }
        self.free_exp(e);
        Ok(())
    }

    /// `e:key(...)`: emit SELF, leaving function + receiver in two fresh
    /// registers.
    pub(crate) fn self_op(
        &mut self,
        e: &mut ExpDesc,
        mut key: ExpDesc,
        line: u32,
    ) -> Result<(), CompileError> {
        let ereg = self.exp2any_reg(e, line)?;
        self.free_exp(e);
        let base = self.freereg;
        e.kind = ExpKind::NonReloc(base);
        e.t = NO_JUMP;
        e.f = NO_JUMP;
        self.reserve_regs(2, line)?;
        let is_k = self.exp2rk(&mut key, line)?;
        let c = Self::rk_operand(&key);
        self.code(Instruction::abc(OpCode::Self_, base, ereg, c, is_k), line);
        self.free_exp(&key);
        Ok(())
    }

    // ---- Boolean control ----

    /// Flip the sense of the comparison controlling the jump at `pc`.
    fn negate_condition(&mut self, pc: i32) {
        let ctrl = self.jump_control_pc(pc) as usize;
        let i = &mut self.proto.code[ctrl];
        debug_assert!(i.opcode().is_test());
        let k = i.k();
        i.set_k(!k);
    }

    fn cond_jump(
        &mut self,
        op: OpCode,
        a: u8,
        b: u8,
        c: u8,
        k: bool,
        line: u32,
    ) -> Result<i32, CompileError> {
        self.code(Instruction::abc(op, a, b, c, k), line);
        Ok(self.jump(line))
    }

    /// Jump when the expression's truth value equals `cond`, reusing a
    /// preceding NOT when possible.
    fn jump_on_cond(&mut self, e: &mut ExpDesc, cond: bool, line: u32) -> Result<i32, CompileError> {
        if let ExpKind::Reloc(pc) = e.kind {
            let i = self.proto.code[pc as usize];
            if i.opcode() == OpCode::Not {
                self.remove_last_instruction();
                return self.cond_jump(OpCode::Test, i.b(), 0, 0, !cond, line);
            }
        }
        self.discharge_to_any_reg(e, line)?;
        self.free_exp(e);
        let r = match e.kind {
            ExpKind::NonReloc(r) => r,
            _ => 0,
        };
        self.cond_jump(OpCode::TestSet, NO_REG, r, 0, cond, line)
    }

    /// Fall through when true; jumps go to the false list.
    pub(crate) fn go_if_true(&mut self, e: &mut ExpDesc, line: u32) -> Result<(), CompileError> {
        self.discharge_vars(e, line)?;
        let pc = match e.kind {
            ExpKind::Jump(j) => {
                self.negate_condition(j);
                j
            }
            ExpKind::Const(_)
            | ExpKind::KInt(_)
            | ExpKind::KFloat(_)
            | ExpKind::KStr(_)
            | ExpKind::True => NO_JUMP, // always true: no jump
            _ => self.jump_on_cond(e, false, line)?,
        };
        let mut f = e.f;
        self.concat_jumps(&mut f, pc, line)?;
        e.f = f;
        let t = e.t;
        self.patch_to_here(t, line)?;
        e.t = NO_JUMP;
        Ok(())
    }

    /// Fall through when false; jumps go to the true list.
    pub(crate) fn go_if_false(&mut self, e: &mut ExpDesc, line: u32) -> Result<(), CompileError> {
        self.discharge_vars(e, line)?;
        let pc = match e.kind {
            ExpKind::Jump(j) => j,
            ExpKind::Nil | ExpKind::False => NO_JUMP, // always false: no jump
            _ => self.jump_on_cond(e, true, line)?,
        };
        let mut t = e.t;
        self.concat_jumps(&mut t, pc, line)?;
        e.t = t;
        let f = e.f;
        self.patch_to_here(f, line)?;
        e.f = NO_JUMP;
        Ok(())
    }

    fn code_not(&mut self, e: &mut ExpDesc, line: u32) -> Result<(), CompileError> {
        self.discharge_vars(e, line)?;
        match e.kind {
            ExpKind::Nil | ExpKind::False => e.kind = ExpKind::True,
            ExpKind::KInt(_)
            | ExpKind::KFloat(_)
            | ExpKind::KStr(_)
            | ExpKind::Const(_)
            | ExpKind::True => e.kind = ExpKind::False,
            ExpKind::Jump(pc) => self.negate_condition(pc),
            ExpKind::Reloc(_) | ExpKind::NonReloc(_) => {
                self.discharge_to_any_reg(e, line)?;
                self.free_exp(e);
                let r = match e.kind {
                    ExpKind::NonReloc(r) => r,
                    _ => 0,
                };
                let pc = self.code(Instruction::abc(OpCode::Not, 0, r, 0, false), line);
                e.kind = ExpKind::Reloc(pc);
            }
            _ => debug_assert!(false, "cannot negate {:?}", e.kind),
        }
        // interchange true and false lists; values in them are now wrong
        std::mem::swap(&mut e.t, &mut e.f);
        self.remove_values(e.f);
        self.remove_values(e.t);
        Ok(())
    }

    // ---- Operators ----

    pub(crate) fn prefix(
        &mut self,
        op: UnOp,
        e: &mut ExpDesc,
        line: u32,
    ) -> Result<(), CompileError> {
        match op {
            UnOp::Minus => {
                if !Self::fold_unary(op, e) {
                    self.code_unary(OpCode::Unm, e, line)?;
                }
            }
            UnOp::BNot => {
                if !Self::fold_unary(op, e) {
                    self.code_unary(OpCode::BNot, e, line)?;
                }
            }
            UnOp::Not => self.code_not(e, line)?,
            UnOp::Len => self.code_unary(OpCode::Len, e, line)?,
        }
        Ok(())
    }

    fn fold_unary(op: UnOp, e: &mut ExpDesc) -> bool {
        if !e.is_numeral() {
            return false;
        }
        match (op, e.kind) {
            (UnOp::Minus, ExpKind::KInt(i)) => {
                e.kind = ExpKind::KInt(i.wrapping_neg());
                true
            }
            (UnOp::Minus, ExpKind::KFloat(f)) => {
                let r = -f;
                // keep 0.0/NaN results for the runtime (sign of zero)
                if r == 0.0 || r.is_nan() {
                    false
                } else {
                    e.kind = ExpKind::KFloat(r);
                    true
                }
            }
            (UnOp::BNot, _) => match exact_int(e) {
                Some(i) => {
                    e.kind = ExpKind::KInt(!i);
                    true
                }
                None => false,
            },
            _ => false,
        }
    }

    fn code_unary(&mut self, op: OpCode, e: &mut ExpDesc, line: u32) -> Result<(), CompileError> {
        let r = self.exp2any_reg(e, line)?;
        self.free_exp(e);
        let pc = self.code(Instruction::abc(op, 0, r, 0, false), line);
        e.kind = ExpKind::Reloc(pc);
        Ok(())
    }

    /// Prepare the left operand before the right one is parsed.
    /// `rhs_is_undef` keeps indexed shapes intact for ISDEF.
    pub(crate) fn infix(
        &mut self,
        op: BinOp,
        e: &mut ExpDesc,
        rhs_is_undef: bool,
        line: u32,
    ) -> Result<(), CompileError> {
        if matches!(op, BinOp::Eq | BinOp::Ne)
            && (rhs_is_undef || matches!(e.kind, ExpKind::Undef))
        {
            return Ok(());
        }
        match op {
            BinOp::And => self.go_if_true(e, line),
            BinOp::Or => self.go_if_false(e, line),
            BinOp::Concat => {
                self.exp2next_reg(e, line)?;
                Ok(())
            }
            BinOp::Add
            | BinOp::Sub
            | BinOp::Mul
            | BinOp::Mod
            | BinOp::Pow
            | BinOp::Div
            | BinOp::IDiv
            | BinOp::BAnd
            | BinOp::BOr
            | BinOp::BXor
            | BinOp::Shl
            | BinOp::Shr => {
                if !e.is_numeral() {
                    self.exp2any_reg(e, line)?;
                }
                Ok(())
            }
            BinOp::Eq | BinOp::Ne => {
                if !e.is_numeral() {
                    self.exp2rk(e, line)?;
                }
                Ok(())
            }
            BinOp::Lt | BinOp::Le | BinOp::Gt | BinOp::Ge => {
                if sc_number(e).is_none() {
                    self.exp2any_reg(e, line)?;
                }
                Ok(())
            }
        }
    }

    /// Combine the operands once both are parsed.
    pub(crate) fn posfix(
        &mut self,
        op: BinOp,
        e1: &mut ExpDesc,
        e2: &mut ExpDesc,
        line: u32,
    ) -> Result<(), CompileError> {
        match op {
            BinOp::And => {
                debug_assert!(e1.t == NO_JUMP); // closed by go_if_true
                self.discharge_vars(e2, line)?;
                let mut f = e2.f;
                self.concat_jumps(&mut f, e1.f, line)?;
                e2.f = f;
                *e1 = *e2;
            }
            BinOp::Or => {
                debug_assert!(e1.f == NO_JUMP); // closed by go_if_false
                self.discharge_vars(e2, line)?;
                let mut t = e2.t;
                self.concat_jumps(&mut t, e1.t, line)?;
                e2.t = t;
                *e1 = *e2;
            }
            BinOp::Concat => {
                self.exp2val(e2, line)?;
                self.code_concat(e1, e2, line)?;
            }
            BinOp::Add | BinOp::Mul => {
                if !self.const_fold(op, e1, e2) {
                    self.code_commutative(op, e1, e2, line)?;
                }
            }
            BinOp::Sub | BinOp::Div | BinOp::IDiv | BinOp::Mod | BinOp::Pow => {
                if !self.const_fold(op, e1, e2) {
                    self.code_arith(op, e1, e2, false, line)?;
                }
            }
            BinOp::BAnd | BinOp::BOr | BinOp::BXor => {
                if !self.const_fold(op, e1, e2) {
                    self.code_bitwise(op, e1, e2, line)?;
                }
            }
            BinOp::Shl => {
                if !self.const_fold(op, e1, e2) {
                    if sc_int(e1).is_some() {
                        // I << r2 keeps the constant on the left
                        std::mem::swap(e1, e2);
                        self.code_bin_i(OpCode::ShlI, e1, e2, true, line)?;
                    } else if !self.finish_shift_neg(e1, e2, line)? {
                        self.code_bin_expval(OpCode::Shl, e1, e2, line)?;
                    }
                }
            }
            BinOp::Shr => {
                if !self.const_fold(op, e1, e2) {
                    if sc_int(e2).is_some() {
                        self.code_bin_i(OpCode::ShrI, e1, e2, false, line)?;
                    } else {
                        self.code_bin_expval(OpCode::Shr, e1, e2, line)?;
                    }
                }
            }
            BinOp::Eq | BinOp::Ne => self.code_eq(op, e1, e2, line)?,
            BinOp::Lt | BinOp::Le => self.code_order(op, e1, e2, line)?,
            BinOp::Gt | BinOp::Ge => {
                // a > b  <=>  b < a
                std::mem::swap(e1, e2);
                let flipped = if op == BinOp::Gt { BinOp::Lt } else { BinOp::Le };
                self.code_order(flipped, e1, e2, line)?;
            }
        }
        Ok(())
    }

    // ---- Constant folding ----

    /// Fold two numeric literals when no runtime error or metamethod
    /// could be observed. Returns true when folded into `e1`.
    fn const_fold(&mut self, op: BinOp, e1: &mut ExpDesc, e2: &ExpDesc) -> bool {
        if !e1.is_numeral() || !e2.is_numeral() {
            return false;
        }
        match op {
            BinOp::BAnd | BinOp::BOr | BinOp::BXor | BinOp::Shl | BinOp::Shr => {
                // bitwise needs exactly integer-convertible operands
                let (a, b) = match (exact_int(e1), exact_int(e2)) {
                    (Some(a), Some(b)) => (a, b),
                    _ => return false,
                };
                let r = match op {
                    BinOp::BAnd => a & b,
                    BinOp::BOr => a | b,
                    BinOp::BXor => a ^ b,
                    BinOp::Shl => lua_shift_left(a, b),
                    _ => lua_shift_left(a, b.wrapping_neg()),
                };
                e1.kind = ExpKind::KInt(r);
                true
            }
            BinOp::Div | BinOp::Pow => {
                // always float
                let (a, b) = (as_float(e1), as_float(e2));
                let r = if op == BinOp::Div { a / b } else { a.powf(b) };
                self.fold_float_result(e1, r)
            }
            _ => {
                if let (ExpKind::KInt(a), ExpKind::KInt(b)) = (e1.kind, e2.kind) {
                    let r = match op {
                        BinOp::Add => a.wrapping_add(b),
                        BinOp::Sub => a.wrapping_sub(b),
                        BinOp::Mul => a.wrapping_mul(b),
                        BinOp::IDiv => {
                            if b == 0 {
                                return false; // division by zero errors at runtime
                            }
                            lua_ifloordiv(a, b)
                        }
                        BinOp::Mod => {
                            if b == 0 {
                                return false;
                            }
                            lua_imod(a, b)
                        }
                        _ => return false,
                    };
                    e1.kind = ExpKind::KInt(r);
                    true
                } else {
                    let (a, b) = (as_float(e1), as_float(e2));
                    let r = match op {
                        BinOp::Add => a + b,
                        BinOp::Sub => a - b,
                        BinOp::Mul => a * b,
                        BinOp::IDiv => (a / b).floor(),
                        BinOp::Mod => lua_fmod(a, b),
                        _ => return false,
                    };
                    self.fold_float_result(e1, r)
                }
            }
        }
    }

    /// NaN and 0.0 results are not folded: NaN marks an error-ish site
    /// and 0.0 could be a signed zero.
    fn fold_float_result(&self, e1: &mut ExpDesc, r: f64) -> bool {
        if r.is_nan() || r == 0.0 {
            false
        } else {
            e1.kind = ExpKind::KFloat(r);
            true
        }
    }

    // ---- Arithmetic emission ----

    fn arith_opcode(op: BinOp, k_form: bool) -> OpCode {
        match (op, k_form) {
            (BinOp::Add, false) => OpCode::Add,
            (BinOp::Sub, false) => OpCode::Sub,
            (BinOp::Mul, false) => OpCode::Mul,
            (BinOp::Mod, false) => OpCode::Mod,
            (BinOp::Pow, false) => OpCode::Pow,
            (BinOp::Div, false) => OpCode::Div,
            (BinOp::IDiv, false) => OpCode::IDiv,
            (BinOp::BAnd, false) => OpCode::BAnd,
            (BinOp::BOr, false) => OpCode::BOr,
            (BinOp::BXor, false) => OpCode::BXor,
            (BinOp::Shl, false) => OpCode::Shl,
            (BinOp::Shr, false) => OpCode::Shr,
            (BinOp::Add, true) => OpCode::AddK,
            (BinOp::Sub, true) => OpCode::SubK,
            (BinOp::Mul, true) => OpCode::MulK,
            (BinOp::Mod, true) => OpCode::ModK,
            (BinOp::Pow, true) => OpCode::PowK,
            (BinOp::Div, true) => OpCode::DivK,
            (BinOp::IDiv, true) => OpCode::IDivK,
            (BinOp::BAnd, true) => OpCode::BAndK,
            (BinOp::BOr, true) => OpCode::BOrK,
            (BinOp::BXor, true) => OpCode::BXorK,
            _ => {
                debug_assert!(false, "no opcode for {op:?}");
                OpCode::Add
            }
        }
    }

    /// Both operands in registers.
    fn code_bin_expval(
        &mut self,
        op: OpCode,
        e1: &mut ExpDesc,
        e2: &mut ExpDesc,
        line: u32,
    ) -> Result<(), CompileError> {
        let v2 = self.exp2any_reg(e2, line)?;
        let v1 = self.exp2any_reg(e1, line)?;
        self.free_exps(e1, e2);
        let pc = self.code(Instruction::abc(op, 0, v1, v2, false), line);
        e1.kind = ExpKind::Reloc(pc);
        e1.t = NO_JUMP;
        e1.f = NO_JUMP;
        Ok(())
    }

    /// Second operand in the constant pool; `flip` records swapped
    /// operands in the k flag.
    fn code_bin_k(
        &mut self,
        op: BinOp,
        e1: &mut ExpDesc,
        e2: &ExpDesc,
        flip: bool,
        line: u32,
    ) -> Result<(), CompileError> {
        let v2 = Self::rk_operand(e2);
        let v1 = self.exp2any_reg(e1, line)?;
        self.free_exp(e1);
        let opc = Self::arith_opcode(op, true);
        let pc = self.code(Instruction::abc(opc, 0, v1, v2, flip), line);
        e1.kind = ExpKind::Reloc(pc);
        e1.t = NO_JUMP;
        e1.f = NO_JUMP;
        Ok(())
    }

    /// Second operand as a signed immediate in C.
    fn code_bin_i(
        &mut self,
        opc: OpCode,
        e1: &mut ExpDesc,
        e2: &ExpDesc,
        flip: bool,
        line: u32,
    ) -> Result<(), CompileError> {
        let imm = match e2.kind {
            ExpKind::KInt(i) => int2sc(i),
            _ => {
                debug_assert!(false, "immediate operand expected");
                0
            }
        };
        let v1 = self.exp2any_reg(e1, line)?;
        self.free_exp(e1);
        let pc = self.code(Instruction::abc(opc, 0, v1, imm, flip), line);
        e1.kind = ExpKind::Reloc(pc);
        e1.t = NO_JUMP;
        e1.f = NO_JUMP;
        Ok(())
    }

    fn code_arith(
        &mut self,
        op: BinOp,
        e1: &mut ExpDesc,
        e2: &mut ExpDesc,
        flip: bool,
        line: u32,
    ) -> Result<(), CompileError> {
        if e2.is_numeral() && self.exp2k(e2, line)? {
            self.code_bin_k(op, e1, e2, flip, line)
        } else {
            self.code_bin_expval(Self::arith_opcode(op, false), e1, e2, line)
        }
    }

    /// ADD and MUL may put a constant first; swap so the constant becomes
    /// the K/immediate operand.
    fn code_commutative(
        &mut self,
        op: BinOp,
        e1: &mut ExpDesc,
        e2: &mut ExpDesc,
        line: u32,
    ) -> Result<(), CompileError> {
        let mut flip = false;
        if e1.is_numeral() {
            std::mem::swap(e1, e2);
            flip = true;
        }
        if op == BinOp::Add && sc_int(e2).is_some() {
            self.code_bin_i(OpCode::AddI, e1, e2, flip, line)
        } else {
            self.code_arith(op, e1, e2, flip, line)
        }
    }

    fn code_bitwise(
        &mut self,
        op: BinOp,
        e1: &mut ExpDesc,
        e2: &mut ExpDesc,
        line: u32,
    ) -> Result<(), CompileError> {
        let mut flip = false;
        if matches!(e1.kind, ExpKind::KInt(_)) && !e1.has_jumps() {
            std::mem::swap(e1, e2);
            flip = true;
        }
        self.code_arith(op, e1, e2, flip, line)
    }

    /// `r1 << I` is coded as `r1 >> -I` when the negated immediate fits.
    fn finish_shift_neg(
        &mut self,
        e1: &mut ExpDesc,
        e2: &ExpDesc,
        line: u32,
    ) -> Result<bool, CompileError> {
        if let ExpKind::KInt(i) = e2.kind {
            if !e2.has_jumps() && fits_sc(i) && fits_sc(i.wrapping_neg()) {
                let v1 = self.exp2any_reg(e1, line)?;
                self.free_exp(e1);
                let pc = self.code(
                    Instruction::abc(OpCode::ShrI, 0, v1, int2sc(-i), false),
                    line,
                );
                e1.kind = ExpKind::Reloc(pc);
                e1.t = NO_JUMP;
                e1.f = NO_JUMP;
                return Ok(true);
            }
        }
        Ok(false)
    }

    // ---- Comparisons ----

    fn code_eq(
        &mut self,
        op: BinOp,
        e1: &mut ExpDesc,
        e2: &mut ExpDesc,
        line: u32,
    ) -> Result<(), CompileError> {
        let eq = op == BinOp::Eq;
        // undef comparisons become existence tests over the indexed form
        if matches!(e1.kind, ExpKind::Undef) || matches!(e2.kind, ExpKind::Undef) {
            if matches!(e1.kind, ExpKind::Undef) {
                std::mem::swap(e1, e2);
            }
            return self.code_is_def(e1, eq, line);
        }
        if !matches!(e1.kind, ExpKind::NonReloc(_)) {
            // constant must be the second operand
            std::mem::swap(e1, e2);
        }
        let r1 = self.exp2any_reg(e1, line)?;
        let (opc, r2) = if let Some((im, _isfloat)) = sc_number(e2) {
            (OpCode::EqI, int2sc(im as i64))
        } else if self.exp2rk(e2, line)? {
            (OpCode::EqK, Self::rk_operand(e2))
        } else {
            (OpCode::Eq, self.exp2any_reg(e2, line)?)
        };
        self.free_exps(e1, e2);
        let pc = self.cond_jump(opc, r1, r2, 0, eq, line)?;
        e1.kind = ExpKind::Jump(pc);
        Ok(())
    }

    fn code_order(
        &mut self,
        op: BinOp,
        e1: &mut ExpDesc,
        e2: &mut ExpDesc,
        line: u32,
    ) -> Result<(), CompileError> {
        let lt = op == BinOp::Lt;
        let (opc, r1, r2);
        if let Some((im, _)) = sc_number(e2) {
            r1 = self.exp2any_reg(e1, line)?;
            r2 = int2sc(im as i64);
            opc = if lt { OpCode::LtI } else { OpCode::LeI };
        } else if let Some((im, _)) = sc_number(e1) {
            // K < r2 becomes r2 > K, swapping the comparison direction
            r1 = self.exp2any_reg(e2, line)?;
            r2 = int2sc(im as i64);
            opc = if lt { OpCode::GtI } else { OpCode::GeI };
        } else {
            r1 = self.exp2any_reg(e1, line)?;
            r2 = self.exp2any_reg(e2, line)?;
            opc = if lt { OpCode::Lt } else { OpCode::Le };
        }
        self.free_exps(e1, e2);
        let pc = self.cond_jump(opc, r1, r2, 0, true, line)?;
        e1.kind = ExpKind::Jump(pc);
        Ok(())
    }

    /// `t[k] == undef` existence test: ISDEF over the normalized table
    /// and key registers; k flag carries the polarity.
    fn code_is_def(&mut self, e: &mut ExpDesc, eq: bool, line: u32) -> Result<(), CompileError> {
        let (table, key) = self.normalize_indexed(e, line)?;
        if key as i32 > table as i32 {
            self.free_reg(key as i32);
            self.free_reg(table as i32);
        } else {
            self.free_reg(table as i32);
            self.free_reg(key as i32);
        }
        let pc = self.code(Instruction::abc(OpCode::IsDef, 0, table, key, eq), line);
        e.kind = ExpKind::Reloc(pc);
        e.t = NO_JUMP;
        e.f = NO_JUMP;
        Ok(())
    }

    /// Reduce any pending-indexing shape to table and key registers.
    /// Anything else cannot be undefined.
    fn normalize_indexed(
        &mut self,
        e: &mut ExpDesc,
        line: u32,
    ) -> Result<(u8, u8), CompileError> {
        match e.kind {
            ExpKind::Indexed { table, key } => Ok((table, key)),
            ExpKind::IndexedStr { table, key } => {
                self.reserve_regs(1, line)?;
                let r = self.freereg - 1;
                self.code_k(r, key, line)?;
                Ok((table, r))
            }
            ExpKind::IndexedI { table, key } => {
                self.reserve_regs(1, line)?;
                let r = self.freereg - 1;
                self.code(Instruction::asbx(OpCode::LoadI, r, key as i32), line);
                Ok((table, r))
            }
            ExpKind::IndexedUp { table, key } => {
                self.reserve_regs(2, line)?;
                let rt = self.freereg - 2;
                let rk = self.freereg - 1;
                self.code(Instruction::abc(OpCode::GetUpval, rt, table, 0, false), line);
                self.code_k(rk, key, line)?;
                Ok((rt, rk))
            }
            _ => Err(self.semantic_error("'undef' is not a value", line)),
        }
    }

    // ---- Concatenation ----

    fn code_concat(
        &mut self,
        e1: &mut ExpDesc,
        e2: &mut ExpDesc,
        line: u32,
    ) -> Result<(), CompileError> {
        self.exp2next_reg(e2, line)?;
        let e1reg = match e1.kind {
            ExpKind::NonReloc(r) => r,
            _ => {
                debug_assert!(false, "concat operand not on the stack");
                0
            }
        };
        // grow an immediately preceding CONCAT instead of stacking them
        let prev = self.proto.code.last().copied();
        if let Some(p) = prev {
            if p.opcode() == OpCode::Concat && p.a() == e1reg + 1 {
                let last = self.proto.code.last_mut().unwrap();
                last.set_a(e1reg);
                let b = last.b();
                last.set_b(b + 1);
                self.free_exp(e2);
                return Ok(());
            }
        }
        self.code(Instruction::abc(OpCode::Concat, e1reg, 2, 0, false), line);
        self.free_exp(e2);
        self.fix_line(line);
        Ok(())
    }

    // ---- Table constructors ----

    /// Flush up to [`FIELDS_PER_FLUSH`] pending array items.
    pub(crate) fn set_list(
        &mut self,
        base: u8,
        nelems: i32,
        tostore: i32,
        line: u32,
    ) -> Result<(), CompileError> {
        debug_assert!(tostore != 0 && tostore <= FIELDS_PER_FLUSH || tostore == MULTRET);
        let b = if tostore == MULTRET { 0 } else { tostore as u8 };
        if nelems <= MAX_C as i32 {
            self.code(Instruction::abc(OpCode::SetList, base, b, nelems as u8, false), line);
        } else if nelems <= MAX_AX as i32 {
            self.code(Instruction::abc(OpCode::SetList, base, b, 0, true), line);
            self.code(Instruction::ax(OpCode::ExtraArg, nelems as u32), line);
        } else {
            return Err(self.syntax_error("constructor too long", line));
        }
        // the flushed values are consumed; only the table stays
        self.freereg = base + 1;
        Ok(())
    }

    /// Patch a NEWTABLE (and its reserved EXTRAARG slot) with final size
    /// hints.
    pub(crate) fn set_table_size(&mut self, pc: usize, ra: u8, asize: u32, hsize: u32) {
        let rb = if hsize != 0 { ceil_log2(hsize) + 1 } else { 0 };
        let extra = asize / (MAX_C + 1);
        let rc = asize % (MAX_C + 1);
        self.proto.code[pc] = Instruction::abc(OpCode::NewTable, ra, rb as u8, rc as u8, extra > 0);
        self.proto.code[pc + 1] = Instruction::ax(OpCode::ExtraArg, extra);
    }

    // ---- Returns and the finishing pass ----

    pub(crate) fn ret(&mut self, first: u8, nret: i32, line: u32) {
        let op = match nret {
            0 => OpCode::Return0,
            1 => OpCode::Return1,
            _ => OpCode::Return,
        };
        self.code(Instruction::abc(op, first, (nret + 1) as u8, 0, false), line);
    }

    /// Final pass over a closed function: route jump-to-jump chains to
    /// their ultimate target and upgrade returns that need extra work.
    pub(crate) fn finish(&mut self, line: u32) -> Result<(), CompileError> {
        let needs_extra =
            self.needclose || self.proto.is_vararg || !self.proto.protos.is_empty();
        for i in 0..self.proto.code.len() {
            let inst = self.proto.code[i];
            match inst.opcode() {
                OpCode::Return0 | OpCode::Return1 => {
                    if needs_extra {
                        let mut inst = inst;
                        inst.set_opcode(OpCode::Return);
                        self.fix_return_extras(&mut inst);
                        self.proto.code[i] = inst;
                    }
                }
                OpCode::Return | OpCode::TailCall => {
                    let mut inst = inst;
                    self.fix_return_extras(&mut inst);
                    self.proto.code[i] = inst;
                }
                OpCode::Jmp => {
                    let target = self.final_target(i);
                    self.fix_jump(i as i32, target, line)?;
                }
                _ => {}
            }
        }
        Ok(())
    }

    fn fix_return_extras(&self, inst: &mut Instruction) {
        if self.needclose {
            inst.set_k(true);
        }
        if self.proto.is_vararg {
            inst.set_c(self.proto.num_params + 1);
        }
    }

    /// Follow a chain of jumps to its end, with a bound against cycles.
    fn final_target(&self, jump_pc: usize) -> i32 {
        let mut i = jump_pc as i32;
        for _ in 0..100 {
            let inst = self.proto.code[i as usize];
            if inst.opcode() != OpCode::Jmp {
                break;
            }
            i += 1 + inst.get_sj();
        }
        i
    }

    // ---- Upvalue capture bookkeeping ----

    /// A local at `level` was captured: its block must close upvalues on
    /// exit, and returns from this function must close as well.
    pub(crate) fn mark_upval(&mut self, level: u8) {
        for bl in self.blocks.iter_mut().rev() {
            if bl.nactvar <= level {
                bl.upval = true;
                break;
            }
        }
        self.needclose = true;
    }
}

/// Exact integer view of a numeral (floats only when the conversion is
/// lossless), for folding and bitwise operands.
fn exact_int(e: &ExpDesc) -> Option<i64> {
    match e.kind {
        ExpKind::KInt(i) => Some(i),
        ExpKind::KFloat(f) => {
            let i = f as i64;
            if i as f64 == f {
                Some(i)
            } else {
                None
            }
        }
        _ => None,
    }
}

fn as_float(e: &ExpDesc) -> f64 {
    match e.kind {
        ExpKind::KInt(i) => i as f64,
        ExpKind::KFloat(f) => f,
        _ => {
            debug_assert!(false, "not a numeral");
            0.0
        }
    }
}

/// Small number usable as a signed immediate: (value, was-float).
fn sc_number(e: &ExpDesc) -> Option<(i32, bool)> {
    if e.has_jumps() {
        return None;
    }
    match e.kind {
        ExpKind::KInt(i) if fits_sc(i) => Some((i as i32, false)),
        ExpKind::KFloat(f) => {
            let i = f as i64;
            if i as f64 == f && fits_sc(i) {
                Some((i as i32, true))
            } else {
                None
            }
        }
        _ => None,
    }
}

/// Small integer immediate only (shifts do not accept float immediates).
fn sc_int(e: &ExpDesc) -> Option<i64> {
    if e.has_jumps() {
        return None;
    }
    match e.kind {
        ExpKind::KInt(i) if fits_sc(i) => Some(i),
        _ => None,
    }
}

/// Lua shift semantics: negative amounts shift the other way, and any
/// amount >= 64 produces zero.
fn lua_shift_left(a: i64, b: i64) -> i64 {
    if b < 0 {
        if b <= -64 {
            0
        } else {
            ((a as u64) >> (-b) as u32) as i64
        }
    } else if b >= 64 {
        0
    } else {
        ((a as u64) << b as u32) as i64
    }
}

/// Integer floor division (quotient rounds toward minus infinity).
fn lua_ifloordiv(a: i64, b: i64) -> i64 {
    if b == -1 {
        return a.wrapping_neg(); // avoids overflow on i64::MIN / -1
    }
    let q = a / b;
    if a % b != 0 && (a < 0) != (b < 0) {
        q - 1
    } else {
        q
    }
}

/// Integer modulo with the sign of the divisor.
fn lua_imod(a: i64, b: i64) -> i64 {
    if b == -1 {
        return 0;
    }
    let r = a % b;
    if r != 0 && (r < 0) != (b < 0) {
        r + b
    } else {
        r
    }
}

/// Float modulo with the sign of the divisor.
fn lua_fmod(a: f64, b: f64) -> f64 {
    let r = a % b;
    if r != 0.0 && (r < 0.0) != (b < 0.0) {
        r + b
    } else {
        r
    }
}

fn ceil_log2(x: u32) -> u32 {
    debug_assert!(x > 0);
    32 - (x - 1).leading_zeros()
}
