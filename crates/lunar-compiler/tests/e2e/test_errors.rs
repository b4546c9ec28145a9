use super::helpers::*;
use lunar_compiler::compiler::{compile, ErrorKind};

#[test]
fn e2e_error_unterminated_string() {
    let err = compile_str_err("local x = \"hello");
    assert!(err.contains("unfinished string"));
}

#[test]
fn e2e_error_unfinished_long_comment() {
    let err = compile_str_err("--[[ never closed");
    assert!(err.contains("unfinished"));
}

#[test]
fn e2e_error_break_outside_loop() {
    let err = compile_str_err("break");
    assert!(err.contains("break outside a loop"));
}

#[test]
fn e2e_error_duplicate_label() {
    let err = compile_str_err("::x:: ::x::");
    assert!(err.contains("label 'x' already defined"));
}

#[test]
fn e2e_error_goto_undefined() {
    let err = compile_str_err("do goto nowhere end");
    assert!(err.contains("no visible label 'nowhere'"));
}

#[test]
fn e2e_error_goto_into_scope() {
    let err = compile_str_err("goto inside\nlocal v\n::inside::\nreturn v");
    assert!(err.contains("jumps into the scope of local 'v'"));
}

#[test]
fn e2e_error_unexpected_symbol() {
    let err = compile_str_err("return )");
    assert!(err.contains("unexpected symbol"));
}

#[test]
fn e2e_error_malformed_number() {
    let err = compile_str_err("local x = 1e");
    assert!(err.contains("malformed number"));
}

#[test]
fn e2e_error_expected_end() {
    let err = compile_str_err("if true then");
    assert!(err.contains("'end' expected"));
}

#[test]
fn e2e_error_expected_then() {
    let err = compile_str_err("if true do end");
    assert!(err.contains("'then' expected"));
}

#[test]
fn e2e_error_vararg_outside() {
    let err = compile_str_err("function f() return ... end");
    assert!(err.contains("cannot use '...' outside a vararg function"));
}

#[test]
fn e2e_error_expression_not_statement() {
    let err = compile_str_err("42");
    assert!(err.contains("unexpected symbol") || err.contains("syntax error"));
}

#[test]
fn e2e_error_undef_as_value() {
    let err = compile_str_err("return undef");
    assert!(err.contains("'undef' is not a value"));
    let err = compile_str_err("local t t.x = undef");
    assert!(err.contains("'undef' is not a value"));
}

#[test]
fn e2e_error_undef_against_non_indexed() {
    let err = compile_str_err("local x return x == undef");
    assert!(err.contains("'undef' is not a value"));
}

#[test]
fn e2e_error_assignment_to_constant() {
    let err = compile_str_err("1 = 2");
    assert!(err.contains("syntax error") || err.contains("unexpected"));
}

#[test]
fn e2e_error_kind_classification() {
    let lexical = compile(b"local x = \"oops", "t").unwrap_err();
    assert_eq!(lexical.kind, ErrorKind::Lexical);
    let syntax = compile(b"if true", "t").unwrap_err();
    assert_eq!(syntax.kind, ErrorKind::Syntax);
    let semantic = compile(b"goto gone", "t").unwrap_err();
    assert_eq!(semantic.kind, ErrorKind::Semantic);
}

#[test]
fn e2e_error_message_format() {
    let e = compile(b"\n\nlocal = 1", "chunk.lua").unwrap_err();
    assert_eq!(e.line, 3);
    assert_eq!(format!("{e}"), "chunk.lua:3: <name> expected near '='");
}

#[test]
fn e2e_error_limits_name_the_function() {
    let body = (0..201)
        .map(|i| format!("local v{i}"))
        .collect::<Vec<_>>()
        .join(" ");
    let err = compile_str_err(&format!("function f() {body} end"));
    assert!(err.contains("too many local variables"));
    assert!(err.contains("function at line 1"));
    let err = compile_str_err(&body);
    assert!(err.contains("in main function"));
}

#[test]
fn e2e_error_too_deep_nesting() {
    let src = format!("return {}x{}", "(".repeat(300), ")".repeat(300));
    let err = compile_str_err(&src);
    assert!(err.contains("too many syntax levels"));
}
