use super::helpers::*;
use lunar_compiler::opcode::OpCode;

#[test]
fn e2e_local_declaration() {
    let (proto, _) = compile_str("local x = 42");
    assert!(has_opcode(&proto, OpCode::LoadI));
}

#[test]
fn e2e_local_nil_default() {
    // one LOADNIL covers all three targets
    let (proto, _) = compile_str("local x, y, z");
    let inst = first_instruction(&proto, OpCode::LoadNil);
    assert_eq!(inst.b(), 2);
}

#[test]
fn e2e_local_fewer_values_pads_with_nil() {
    let (proto, _) = compile_str("local a, b, c = 1");
    assert!(has_opcode(&proto, OpCode::LoadI));
    assert_eq!(first_instruction(&proto, OpCode::LoadNil).b(), 1);
}

#[test]
fn e2e_local_extra_values_discarded() {
    let (proto, _) = compile_str("local a = 1, 2, 3");
    assert_eq!(count_opcode(&proto, OpCode::LoadI), 3);
}

#[test]
fn e2e_global_assign() {
    let (proto, _) = compile_str("x = 42");
    assert!(has_opcode(&proto, OpCode::SetTabUp));
}

#[test]
fn e2e_global_read() {
    let (proto, _) = compile_str("return x");
    assert!(has_opcode(&proto, OpCode::GetTabUp));
}

#[test]
fn e2e_if_simple() {
    let (proto, _) = compile_str("local y\nif y then local x = 1 end");
    assert!(has_opcode(&proto, OpCode::Test));
    assert!(has_opcode(&proto, OpCode::Jmp));
}

#[test]
fn e2e_if_elseif_else_chain() {
    let src = "local a, b\nif a then local x = 1 elseif b then local x = 2 else local x = 3 end";
    let (proto, _) = compile_str(src);
    assert_eq!(count_opcode(&proto, OpCode::Test), 2);
    // each taken arm jumps over the rest
    assert!(count_opcode(&proto, OpCode::Jmp) >= 4);
}

#[test]
fn e2e_while_loop() {
    let (proto, _) = compile_str("local i = 10\nwhile i do i = nil end");
    assert!(has_opcode(&proto, OpCode::Test));
    assert!(count_opcode(&proto, OpCode::Jmp) >= 2);
}

#[test]
fn e2e_repeat_until() {
    let (proto, _) = compile_str("local y\nrepeat local x = 1 until y");
    assert!(has_opcode(&proto, OpCode::Test));
}

#[test]
fn e2e_repeat_condition_sees_body_locals() {
    // x in the until clause is the body's local, so no global access
    let (proto, _) = compile_str("repeat local x until x");
    assert!(!has_opcode(&proto, OpCode::GetTabUp));
}

#[test]
fn e2e_numeric_for() {
    let (proto, _) = compile_str("for i = 1, 10 do local x = i end");
    assert!(has_opcode(&proto, OpCode::ForPrep));
    assert!(has_opcode(&proto, OpCode::ForLoop));
}

#[test]
fn e2e_numeric_for_default_step() {
    // the missing step materializes as a constant 1
    let (proto, _) = compile_str("for i = 5, 9 do end");
    assert_eq!(count_opcode(&proto, OpCode::LoadI), 3);
}

#[test]
fn e2e_numeric_for_with_step() {
    let (proto, _) = compile_str("for i = 10, 1, -1 do local x = i end");
    assert!(has_opcode(&proto, OpCode::ForPrep));
    assert!(has_opcode(&proto, OpCode::ForLoop));
}

#[test]
fn e2e_generic_for() {
    let (proto, _) = compile_str("for k, v in pairs, t do end");
    assert!(has_opcode(&proto, OpCode::TForPrep));
    assert!(has_opcode(&proto, OpCode::TForCall));
    assert!(has_opcode(&proto, OpCode::TForLoop));
    assert_eq!(first_instruction(&proto, OpCode::TForCall).c(), 2);
}

#[test]
fn e2e_do_end() {
    let (proto, _) = compile_str("do local x = 1 end\nlocal y = 2");
    assert_eq!(count_opcode(&proto, OpCode::LoadI), 2);
    // y reuses the register x vacated
    let loads: Vec<_> = proto
        .code
        .iter()
        .filter(|i| i.opcode() == OpCode::LoadI)
        .collect();
    assert_eq!(loads[0].a(), loads[1].a());
}

#[test]
fn e2e_break() {
    let (proto, _) = compile_str("while true do break end");
    assert!(has_opcode(&proto, OpCode::Jmp));
}

#[test]
fn e2e_break_leaves_captured_scope() {
    let src = r#"
while true do
    local x
    local function f() return x end
    break
end
"#;
    let (proto, _) = compile_str(src);
    assert!(has_opcode(&proto, OpCode::Close));
}

#[test]
fn e2e_loop_body_capture_closes_each_iteration() {
    let src = r#"
local y
while y do
    local x
    local function f() return x end
end
"#;
    let (proto, _) = compile_str(src);
    assert!(has_opcode(&proto, OpCode::Close));
}

#[test]
fn e2e_repeat_capture_closes_before_looping() {
    let src = r#"
local y
repeat
    local x
    local function f() return x end
until y
"#;
    let (proto, _) = compile_str(src);
    assert!(has_opcode(&proto, OpCode::Close));
}

#[test]
fn e2e_goto_forward() {
    let (proto, _) = compile_str("goto done\nlocal x = 1\n::done::");
    assert!(has_opcode(&proto, OpCode::Jmp));
}

#[test]
fn e2e_goto_backward() {
    let (proto, _) = compile_str("::start::\ngoto start");
    assert!(has_opcode(&proto, OpCode::Jmp));
}

#[test]
fn e2e_goto_out_of_captured_scope_closes() {
    let src = r#"
::top::
do
    local x
    local function f() return x end
    goto top
end
"#;
    let (proto, _) = compile_str(src);
    assert!(has_opcode(&proto, OpCode::Close));
}

#[test]
fn e2e_return_empty() {
    let (proto, _) = compile_str("local function f() return end");
    assert!(has_opcode(&proto.protos[0], OpCode::Return0));
}

#[test]
fn e2e_return_single() {
    let (proto, _) = compile_str("local function f() return 1 end");
    assert!(has_opcode(&proto.protos[0], OpCode::Return1));
}

#[test]
fn e2e_return_multiple() {
    let (proto, _) = compile_str("local function f() return 1, 2, 3 end");
    let ret = first_instruction(&proto.protos[0], OpCode::Return);
    assert_eq!(ret.b(), 4); // three results
}

#[test]
fn e2e_semicolons() {
    let (proto, _) = compile_str(";;;local x = 1;;;");
    assert!(has_opcode(&proto, OpCode::LoadI));
}

#[test]
fn e2e_function_call_statement_drops_results() {
    let (proto, _) = compile_str("print(42)");
    assert_eq!(first_instruction(&proto, OpCode::Call).c(), 1);
}

#[test]
fn e2e_multiple_assignment() {
    let (proto, _) = compile_str("local a, b\na, b = 1, 2");
    assert!(count_opcode(&proto, OpCode::LoadI) >= 2);
}

#[test]
fn e2e_swap_assignment() {
    let (proto, _) = compile_str("local a, b = 1, 2\na, b = b, a");
    assert!(count_opcode(&proto, OpCode::Move) >= 2);
}

#[test]
fn e2e_assignment_through_table() {
    let (proto, _) = compile_str("local t = {}\nt.x = 1\nt[2] = 2\nlocal k t[k] = 3");
    assert!(has_opcode(&proto, OpCode::SetField));
    assert!(has_opcode(&proto, OpCode::SetI));
    assert!(has_opcode(&proto, OpCode::SetTable));
}

#[test]
fn e2e_nested_blocks() {
    let (proto, _) = compile_str("do\n  do\n    local x = 1\n  end\n  local y = 2\nend");
    assert!(count_opcode(&proto, OpCode::LoadI) >= 2);
}

#[test]
fn e2e_constructor_array_and_hash() {
    let (proto, _) = compile_str("local t = {1, 2, x = 3, [5] = 4}");
    let nt = first_instruction(&proto, OpCode::NewTable);
    assert_eq!(nt.c(), 2); // array hint
    assert!(nt.b() > 0); // hash hint
    assert!(has_opcode(&proto, OpCode::SetList));
}

#[test]
fn e2e_constructor_flushes_every_fifty() {
    let items = vec!["true"; 120].join(", ");
    let (proto, _) = compile_str(&format!("local t = {{{items}}}"));
    assert_eq!(count_opcode(&proto, OpCode::SetList), 3);
}
