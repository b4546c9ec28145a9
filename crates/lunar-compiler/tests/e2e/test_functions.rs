use super::helpers::*;
use lunar_compiler::opcode::OpCode;

#[test]
fn e2e_function_no_params() {
    let (proto, _) = compile_str("function f() end");
    assert!(has_opcode(&proto, OpCode::Closure));
    assert_eq!(proto.protos.len(), 1);
    assert_eq!(proto.protos[0].num_params, 0);
}

#[test]
fn e2e_function_with_params() {
    let (proto, _) = compile_str("function f(a, b, c) return a end");
    assert_eq!(proto.protos[0].num_params, 3);
}

#[test]
fn e2e_function_vararg() {
    let (proto, _) = compile_str("function f(...) return ... end");
    let f = &proto.protos[0];
    assert!(f.is_vararg);
    assert!(has_opcode(f, OpCode::VarArgPrep));
    assert!(has_opcode(f, OpCode::VarArg));
}

#[test]
fn e2e_function_mixed_params_vararg() {
    let (proto, _) = compile_str("function f(a, b, ...) end");
    let f = &proto.protos[0];
    assert_eq!(f.num_params, 2);
    assert!(f.is_vararg);
    assert_eq!(first_instruction(f, OpCode::VarArgPrep).a(), 2);
}

#[test]
fn e2e_fixed_arity_function_has_no_prep() {
    let (proto, _) = compile_str("function f(a) end");
    assert!(!has_opcode(&proto.protos[0], OpCode::VarArgPrep));
}

#[test]
fn e2e_method_definition() {
    let (proto, _) = compile_str("function t:m(x) return self, x end");
    // self + x
    assert_eq!(proto.protos[0].num_params, 2);
}

#[test]
fn e2e_dotted_function_name() {
    let (proto, _) = compile_str("local t = {}\nfunction t.a.b() end");
    assert!(has_opcode(&proto, OpCode::GetField));
    assert!(has_opcode(&proto, OpCode::SetField));
}

#[test]
fn e2e_closure_upvalue_capture() {
    let (proto, _) = compile_str("local x = 1\nfunction f() return x end");
    let f = &proto.protos[0];
    assert_eq!(f.upvalues.len(), 1);
    assert!(f.upvalues[0].in_stack);
    assert!(has_opcode(f, OpCode::GetUpval));
}

#[test]
fn e2e_upvalue_store() {
    let (proto, _) = compile_str("local x\nlocal function f() x = 1 end");
    assert!(has_opcode(&proto.protos[0], OpCode::SetUpval));
}

#[test]
fn e2e_nested_closure_chain() {
    let src = "local x = 1\nfunction outer()\n  return function() return x end\nend";
    let (proto, _) = compile_str(src);
    let outer = &proto.protos[0];
    let inner = &outer.protos[0];
    assert!(outer.upvalues[0].in_stack);
    assert!(!inner.upvalues[0].in_stack);
}

#[test]
fn e2e_local_function_recursive() {
    // the name is active inside its own body, so the call goes through
    // an upvalue rather than a global
    let (proto, _) = compile_str("local function f() return f() end");
    let f = &proto.protos[0];
    assert!(has_opcode(f, OpCode::GetUpval));
    assert!(!has_opcode(f, OpCode::GetTabUp));
}

#[test]
fn e2e_function_expression() {
    let (proto, _) = compile_str("local f = function(x) return x end");
    assert!(has_opcode(&proto, OpCode::Closure));
    assert_eq!(proto.protos.len(), 1);
}

#[test]
fn e2e_function_call_with_args() {
    let (proto, _) = compile_str("f(1, 2, 3)");
    let call = first_instruction(&proto, OpCode::Call);
    assert_eq!(call.b(), 4); // three fixed arguments
}

#[test]
fn e2e_function_call_with_string_arg() {
    let (proto, _) = compile_str("f \"hello\"");
    assert!(has_opcode(&proto, OpCode::Call));
    assert_eq!(first_instruction(&proto, OpCode::Call).b(), 2);
}

#[test]
fn e2e_function_call_with_table_arg() {
    let (proto, _) = compile_str("f {1, 2}");
    assert!(has_opcode(&proto, OpCode::Call));
    assert!(has_opcode(&proto, OpCode::NewTable));
}

#[test]
fn e2e_call_forwards_multret() {
    // inner call feeds an open number of arguments to the outer one
    let (proto, _) = compile_str("f(g())");
    let calls: Vec<_> = proto
        .code
        .iter()
        .filter(|i| i.opcode() == OpCode::Call)
        .collect();
    assert_eq!(calls.len(), 2);
    assert_eq!(calls[0].c(), 0); // g yields all its results
    assert_eq!(calls[1].b(), 0); // f takes however many arrived
}

#[test]
fn e2e_tail_call() {
    let (proto, _) = compile_str("function f(x) return g(x) end");
    assert!(has_opcode(&proto.protos[0], OpCode::TailCall));
}

#[test]
fn e2e_no_tail_call_for_multiple_returns() {
    let (proto, _) = compile_str("function f(x) return g(x), 1 end");
    assert!(!has_opcode(&proto.protos[0], OpCode::TailCall));
}

#[test]
fn e2e_method_call() {
    let (proto, _) = compile_str("local t\nt:method(1)");
    let s = first_instruction(&proto, OpCode::Self_);
    assert!(s.k()); // method name comes from the constant pool
    assert!(has_opcode(&proto, OpCode::Call));
}

#[test]
fn e2e_capturing_function_closes_on_return() {
    let (proto, _) = compile_str("local x\nlocal function f() return x end");
    let ret = first_instruction(&proto, OpCode::Return);
    assert!(ret.k());
}

#[test]
fn e2e_vararg_return_c_encodes_params() {
    let (proto, _) = compile_str("local function f(a, ...) return end");
    let f = &proto.protos[0];
    // vararg functions record num_params + 1 in C for the return
    let ret = f
        .code
        .iter()
        .find(|i| matches!(i.opcode(), OpCode::Return))
        .copied()
        .unwrap();
    assert_eq!(ret.c(), 2);
}
