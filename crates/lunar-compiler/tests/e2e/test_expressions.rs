use super::helpers::*;
use lunar_compiler::opcode::OpCode;

#[test]
fn e2e_return_nil() {
    let (proto, _) = compile_str("return nil");
    assert!(has_opcode(&proto, OpCode::LoadNil));
}

#[test]
fn e2e_return_true() {
    let (proto, _) = compile_str("return true");
    assert!(has_opcode(&proto, OpCode::LoadTrue));
}

#[test]
fn e2e_return_false() {
    let (proto, _) = compile_str("return false");
    assert!(has_opcode(&proto, OpCode::LoadFalse));
}

#[test]
fn e2e_small_integer_is_immediate() {
    let (proto, _) = compile_str("return 42");
    assert!(has_opcode(&proto, OpCode::LoadI));
    assert!(proto.constants.is_empty());
}

#[test]
fn e2e_large_integer_goes_to_pool() {
    let (proto, _) = compile_str("return 1000000");
    assert!(has_opcode(&proto, OpCode::LoadK));
    assert_eq!(get_int_constant(&proto, 0), 1000000);
}

#[test]
fn e2e_integral_float_is_immediate() {
    // 2.0 fits the sBx field as an exact integer
    let (proto, _) = compile_str("return 2.0");
    assert!(has_opcode(&proto, OpCode::LoadF));
    assert!(proto.constants.is_empty());
}

#[test]
fn e2e_string_literal() {
    let (proto, strings) = compile_str(r#"return "hello""#);
    assert!(has_opcode(&proto, OpCode::LoadK));
    assert_eq!(get_string_constant(&proto, 0, &strings), "hello");
}

#[test]
fn e2e_arith_register_operands() {
    let (proto, _) = compile_str("local a, b return a + b");
    assert!(has_opcode(&proto, OpCode::Add));
}

#[test]
fn e2e_arith_immediate_operand() {
    let (proto, _) = compile_str("local a return a + 1");
    assert!(has_opcode(&proto, OpCode::AddI));
}

#[test]
fn e2e_arith_constant_operand() {
    let (proto, _) = compile_str("local a return a + 1000000");
    assert!(has_opcode(&proto, OpCode::AddK));
}

#[test]
fn e2e_commutative_swaps_constant_left() {
    // multiplication has no immediate form, so the swapped constant
    // lands in the pool
    let (proto, _) = compile_str("local a return 2 * a");
    assert!(has_opcode(&proto, OpCode::MulK));
    assert_eq!(get_int_constant(&proto, 0), 2);
}

#[test]
fn e2e_subtraction_by_constant() {
    let (proto, _) = compile_str("local a return a - 1");
    assert!(has_opcode(&proto, OpCode::SubK));
    assert_eq!(get_int_constant(&proto, 0), 1);
}

#[test]
fn e2e_power_is_right_associative() {
    // 2 ^ 3 ^ 2 folds as 2 ^ (3 ^ 2) = 512.0, an exact-integer float
    let (proto, _) = compile_str("return 2 ^ 3 ^ 2");
    assert!(!has_opcode(&proto, OpCode::Pow));
    assert_eq!(first_instruction(&proto, OpCode::LoadF).sbx(), 512);
}

#[test]
fn e2e_unary_minus_folds() {
    let (proto, _) = compile_str("return -3");
    assert!(!has_opcode(&proto, OpCode::Unm));
    assert!(has_opcode(&proto, OpCode::LoadI));
}

#[test]
fn e2e_unary_operators_on_locals() {
    let (proto, _) = compile_str("local a return -a, ~a, not a, #a");
    assert!(has_opcode(&proto, OpCode::Unm));
    assert!(has_opcode(&proto, OpCode::BNot));
    assert!(has_opcode(&proto, OpCode::Not));
    assert!(has_opcode(&proto, OpCode::Len));
}

#[test]
fn e2e_comparison_register_form() {
    let (proto, _) = compile_str("local a, b return a < b");
    assert!(has_opcode(&proto, OpCode::Lt));
}

#[test]
fn e2e_equality_immediate() {
    let (proto, _) = compile_str("local a return a == 3");
    assert!(has_opcode(&proto, OpCode::EqI));
}

#[test]
fn e2e_comparison_result_materializes_bools() {
    // used as a value, the comparison produces LFALSESKIP/LOADTRUE
    let (proto, _) = compile_str("local a, b local c = a < b");
    assert!(has_opcode(&proto, OpCode::LFalseSkip));
    assert!(has_opcode(&proto, OpCode::LoadTrue));
}

#[test]
fn e2e_and_or_short_circuit() {
    let (proto, _) = compile_str("local a, b, c return a and b or c");
    assert!(has_opcode(&proto, OpCode::TestSet));
    assert!(has_opcode(&proto, OpCode::Jmp));
}

#[test]
fn e2e_concat_merges_chain() {
    let (proto, _) = compile_str("local a, b, c, d return a .. b .. c .. d");
    assert_eq!(count_opcode(&proto, OpCode::Concat), 1);
    assert_eq!(first_instruction(&proto, OpCode::Concat).b(), 4);
}

#[test]
fn e2e_index_by_string() {
    let (proto, _) = compile_str("local t return t.field");
    assert!(has_opcode(&proto, OpCode::GetField));
}

#[test]
fn e2e_index_by_small_int() {
    let (proto, _) = compile_str("local t return t[3]");
    assert!(has_opcode(&proto, OpCode::GetI));
}

#[test]
fn e2e_index_by_register() {
    let (proto, _) = compile_str("local t, k return t[k]");
    assert!(has_opcode(&proto, OpCode::GetTable));
}

#[test]
fn e2e_global_index_through_env() {
    let (proto, _) = compile_str("return math.pi");
    assert!(has_opcode(&proto, OpCode::GetTabUp));
    assert!(has_opcode(&proto, OpCode::GetField));
}

#[test]
fn e2e_bitwise_folding() {
    let (proto, _) = compile_str("return 0xF0 | 0x0F");
    assert!(!has_opcode(&proto, OpCode::BOr));
    assert!(has_opcode(&proto, OpCode::LoadI));
}

#[test]
fn e2e_shift_by_register() {
    let (proto, _) = compile_str("local a, b return a << b");
    assert!(has_opcode(&proto, OpCode::Shl));
}

#[test]
fn e2e_string_coercion_never_folds() {
    // "1" + 1 must stay a runtime operation
    let (proto, _) = compile_str(r#"return "1" + 1"#);
    assert!(has_opcode(&proto, OpCode::AddI) || has_opcode(&proto, OpCode::Add));
}

#[test]
fn e2e_undef_equality_uses_isdef() {
    let (proto, _) = compile_str("local t return t[1] == undef");
    let inst = first_instruction(&proto, OpCode::IsDef);
    assert!(inst.k());
    let (proto, _) = compile_str("local t return t.x ~= undef");
    assert!(!first_instruction(&proto, OpCode::IsDef).k());
}

#[test]
fn e2e_undef_with_upvalue_table() {
    let src = "local t\nlocal function f() return t.key == undef end";
    let (proto, _) = compile_str(src);
    // the upvalue table is loaded into a register before the test
    assert!(has_opcode(&proto.protos[0], OpCode::GetUpval));
    assert!(has_opcode(&proto.protos[0], OpCode::IsDef));
}
