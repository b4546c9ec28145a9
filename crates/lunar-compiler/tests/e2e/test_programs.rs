use super::helpers::*;
use lunar_compiler::opcode::OpCode;

#[test]
fn e2e_fibonacci() {
    let src = r#"
local function fib(n)
    if n < 2 then
        return n
    end
    return fib(n - 1) + fib(n - 2)
end
return fib(10)
"#;
    let (proto, _) = compile_str(src);
    let fib = &proto.protos[0];
    assert!(has_opcode(fib, OpCode::LtI));
    assert!(has_opcode(fib, OpCode::Add));
    assert!(has_opcode(fib, OpCode::GetUpval)); // recursive reference
}

#[test]
fn e2e_counter_closure() {
    let src = r#"
local function make_counter()
    local count = 0
    return function()
        count = count + 1
        return count
    end
end
local c = make_counter()
return c()
"#;
    let (proto, _) = compile_str(src);
    let maker = &proto.protos[0];
    let counter = &maker.protos[0];
    assert!(counter.upvalues[0].in_stack);
    assert!(has_opcode(counter, OpCode::SetUpval));
    // returning past a captured local closes it
    assert!(first_instruction(maker, OpCode::Return).k());
}

#[test]
fn e2e_sieve() {
    let src = r#"
local N = 100
local is_prime = {}
for i = 2, N do
    is_prime[i] = true
end
for i = 2, N do
    if is_prime[i] then
        for j = i + i, N, i do
            is_prime[j] = false
        end
    end
end
"#;
    let (proto, _) = compile_str(src);
    assert_eq!(count_opcode(&proto, OpCode::ForPrep), 3);
    assert_eq!(count_opcode(&proto, OpCode::ForLoop), 3);
    assert!(has_opcode(&proto, OpCode::SetTable));
}

#[test]
fn e2e_generic_for_over_pairs() {
    let src = r#"
local t = {a = 1, b = 2}
local sum = 0
for k, v in pairs(t) do
    sum = sum + v
end
return sum
"#;
    let (proto, _) = compile_str(src);
    assert!(has_opcode(&proto, OpCode::TForCall));
    assert!(has_opcode(&proto, OpCode::Add));
}

#[test]
fn e2e_string_building() {
    let src = r#"
local parts = {"a", "b", "c"}
local sep = ","
return parts[1] .. sep .. parts[2] .. sep .. parts[3]
"#;
    let (proto, _) = compile_str(src);
    assert_eq!(count_opcode(&proto, OpCode::Concat), 1);
    assert_eq!(first_instruction(&proto, OpCode::Concat).b(), 5);
}

#[test]
fn e2e_undef_membership_probe() {
    let src = r#"
local cache = {}
local function probe(key)
    if cache[key] == undef then
        cache[key] = 0
    end
    return cache[key]
end
return probe
"#;
    let (proto, _) = compile_str(src);
    let probe = &proto.protos[0];
    assert!(has_opcode(probe, OpCode::IsDef));
    assert!(has_opcode(probe, OpCode::SetTable));
}

#[test]
fn e2e_state_machine_with_gotos() {
    let src = r#"
local state = 1
::dispatch::
if state == 1 then
    state = 2
    goto dispatch
end
if state == 2 then
    state = 3
    goto dispatch
end
return state
"#;
    let (proto, _) = compile_str(src);
    assert!(has_opcode(&proto, OpCode::EqI));
    // two backward jumps to the dispatch label
    let backward = proto
        .code
        .iter()
        .filter(|i| i.opcode() == OpCode::Jmp && i.get_sj() < 0)
        .count();
    assert_eq!(backward, 2);
}

#[test]
fn e2e_deep_method_chain() {
    let src = "local obj\nreturn obj:first():second():third()";
    let (proto, _) = compile_str(src);
    assert_eq!(count_opcode(&proto, OpCode::Self_), 3);
    // the last call sits in return position and becomes a tail call
    assert_eq!(count_opcode(&proto, OpCode::Call), 2);
    assert_eq!(count_opcode(&proto, OpCode::TailCall), 1);
}

#[test]
fn e2e_varargs_forwarding() {
    let src = r#"
local function pack(...)
    return {n = 3, ...}
end
return pack(1, 2, 3)
"#;
    let (proto, _) = compile_str(src);
    let pack = &proto.protos[0];
    assert!(has_opcode(pack, OpCode::VarArg));
    // trailing vararg flushes with an open count
    assert_eq!(first_instruction(pack, OpCode::SetList).b(), 0);
}

#[test]
fn e2e_mutual_recursion_through_upvalue() {
    let src = r#"
local is_even, is_odd
function is_even(n)
    if n == 0 then return true end
    return is_odd(n - 1)
end
function is_odd(n)
    if n == 0 then return false end
    return is_even(n - 1)
end
return is_even(10)
"#;
    let (proto, _) = compile_str(src);
    assert_eq!(proto.protos.len(), 2);
    for f in &proto.protos {
        assert!(has_opcode(f, OpCode::GetUpval));
        assert!(has_opcode(f, OpCode::TailCall));
    }
}

#[test]
fn e2e_nested_constructors() {
    let src = r#"
local config = {
    name = "demo",
    limits = {min = 1, max = 99},
    flags = {true, false, true},
}
return config.limits.max
"#;
    let (proto, _) = compile_str(src);
    assert_eq!(count_opcode(&proto, OpCode::NewTable), 3);
    assert!(has_opcode(&proto, OpCode::GetField));
}

#[test]
fn e2e_numeric_algorithms_fold() {
    // every operand is constant, so the whole expression folds
    let (proto, _) = compile_str("return (3 * 4 + 2) % 5");
    assert!(!has_opcode(&proto, OpCode::Mul));
    assert!(!has_opcode(&proto, OpCode::Add));
    assert!(!has_opcode(&proto, OpCode::Mod));
    assert_eq!(first_instruction(&proto, OpCode::LoadI).sbx(), 4);
}

#[test]
fn e2e_line_info_tracks_source() {
    let src = "local a = 1\nlocal b = 2\n\n\nlocal c = 3";
    let (proto, _) = compile_str(src);
    assert_eq!(proto.line_info.len(), proto.code.len());
    let last_load = proto
        .code
        .iter()
        .enumerate()
        .filter(|(_, i)| i.opcode() == OpCode::LoadI)
        .map(|(pc, _)| pc)
        .next_back()
        .unwrap();
    assert_eq!(proto.get_line(last_load), 5);
}
