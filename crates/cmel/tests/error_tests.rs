//! Diagnostics: compile error rendering, runtime errors, and stack traces.

use cmel::{CmelError, CollectStringPrint, Runner};
use pretty_assertions::assert_eq;

fn run_err(source: &str) -> (String, CmelError) {
    let mut out = CollectStringPrint::new();
    let mut runner = Runner::new();
    match runner.run(source, &mut out) {
        Ok(()) => panic!("expected an error\noutput:\n{}", out.output()),
        Err(error) => (out.into_output(), error),
    }
}

fn runtime_message(source: &str) -> String {
    match run_err(source).1 {
        CmelError::Runtime(error) => error.message,
        CmelError::Compile(errors) => panic!("expected runtime error, got compile errors: {errors:?}"),
    }
}

#[test]
fn compile_error_rendering() {
    let (_, error) = run_err("var;");
    let CmelError::Compile(errors) = error else {
        panic!("expected compile error");
    };
    assert_eq!(errors.len(), 1);
    assert_eq!(errors[0].to_string(), "[line 1] Error at ';': Expect variable name.");
}

#[test]
fn compile_errors_report_per_statement() {
    let (_, error) = run_err("var 1 = 2;\nprint this;\nbreak;\n");
    let CmelError::Compile(errors) = error else {
        panic!("expected compile errors");
    };
    assert_eq!(errors.len(), 3);
    assert_eq!(errors[0].line, 1);
    assert_eq!(errors[1].line, 2);
    assert_eq!(errors[2].line, 3);
}

#[test]
fn scanner_errors_have_no_location_token() {
    let (_, error) = run_err("print \"unterminated;");
    let CmelError::Compile(errors) = error else {
        panic!("expected compile error");
    };
    assert!(errors[0].to_string().contains("Error: Unterminated string."));
}

#[test]
fn arity_mismatch_produces_four_frame_trace() {
    let source = "fun c() { return c(1); }
fun b() { c(); }
fun a() { b(); }
a();";
    let (_, error) = run_err(source);
    let CmelError::Runtime(error) = error else {
        panic!("expected runtime error");
    };
    assert_eq!(error.message, "Expected 0 arguments but got 1.");
    assert_eq!(error.trace.len(), 4);
    assert_eq!(error.trace[0].function.as_deref(), Some("c"));
    assert_eq!(error.trace[1].function.as_deref(), Some("b"));
    assert_eq!(error.trace[2].function.as_deref(), Some("a"));
    assert_eq!(error.trace[3].function, None);
    assert_eq!(error.trace[0].line, 1);
    assert_eq!(error.trace[3].line, 4);

    let rendered = error.to_string();
    assert!(rendered.starts_with("Expected 0 arguments but got 1.\n"));
    assert!(rendered.ends_with("in script"));
}

#[test]
fn output_before_a_runtime_error_is_preserved() {
    let (output, error) = run_err("print \"before\"; print missing;");
    assert_eq!(output, "before\n");
    assert!(matches!(error, CmelError::Runtime(_)));
}

#[test]
fn runtime_error_messages() {
    assert_eq!(runtime_message("print x;"), "Undefined variable 'x'.");
    assert_eq!(runtime_message("x = 1;"), "Undefined variable 'x'.");
    assert_eq!(runtime_message("var a = 1 + nil;"), "Operands must be numbers or strings.");
    assert_eq!(runtime_message("var a = nil - 1;"), "Operands must be numbers.");
    assert_eq!(runtime_message("var a = -\"s\";"), "Operand must be a number.");
    assert_eq!(runtime_message("nil();"), "Can only call functions and classes.");
    assert_eq!(runtime_message("true.field;"), "Only instances have properties.");
    assert_eq!(runtime_message("nil.m();"), "Only instances have methods.");
    assert_eq!(
        runtime_message("class A {} A().missing;"),
        "Undefined property 'missing'."
    );
    assert_eq!(runtime_message("[1, 2][5];"), "List index out of bounds.");
    assert_eq!(runtime_message("[1, 2][\"k\"];"), "List index must be a number.");
    assert_eq!(runtime_message("var m = {}; m[1];"), "Map keys must be strings.");
    assert_eq!(runtime_message("nil[0];"), "Can only index lists and maps.");
    assert_eq!(runtime_message("\"s\".charAt(99);"), "String index out of bounds.");
    assert_eq!(runtime_message("[1, \"x\"].sum();"), "Can only sum numbers.");
    assert_eq!(runtime_message("assert(false);"), "Assertion failed.");
    assert_eq!(runtime_message("assertEqual(1, 2);"), "Expected 1 but got 2.");
    assert_eq!(runtime_message("number(\"abc\");"), "Could not convert string to number.");
    assert_eq!(runtime_message("export var v = 1;"), "Can't export outside of a module.");
}

#[test]
fn class_without_initializer_rejects_arguments() {
    assert_eq!(runtime_message("class A {} A(1);"), "Expected 0 arguments but got 1.");
}

#[test]
fn deep_recursion_overflows_the_frame_stack() {
    assert_eq!(runtime_message("fun f() { f(); } f();"), "Stack overflow.");
}

#[test]
fn superclass_must_be_a_class() {
    assert_eq!(
        runtime_message("var NotAClass = 1; class B < NotAClass {}"),
        "Superclass must be a class."
    );
}

#[test]
fn wrong_native_arity() {
    assert_eq!(runtime_message("clock(1);"), "Expected 0 arguments but got 1.");
    assert_eq!(runtime_message("assert();"), "Expected at least 1 arguments but got 0.");
}

#[test]
fn the_stack_is_reset_after_a_runtime_error() {
    let mut out = CollectStringPrint::new();
    let mut runner = Runner::new();
    assert!(runner.run("print missing;", &mut out).is_err());
    // The same runner keeps working afterwards.
    runner.run("print \"recovered\";", &mut out).unwrap();
    assert_eq!(out.output(), "recovered\n");
}
