//! Module loading: embedded stdlib, filesystem modules, isolation, export
//! semantics, cycles.

use std::fs;

use cmel::{CmelError, CollectStringPrint, Runner};
use pretty_assertions::assert_eq;
use tempfile::TempDir;

fn run(source: &str) -> String {
    let mut out = CollectStringPrint::new();
    let mut runner = Runner::new();
    match runner.run(source, &mut out) {
        Ok(()) => out.into_output(),
        Err(error) => panic!("script failed: {error}\noutput:\n{}", out.output()),
    }
}

fn run_err(source: &str) -> String {
    let mut out = CollectStringPrint::new();
    let mut runner = Runner::new();
    match runner.run(source, &mut out) {
        Ok(()) => panic!("expected an error\noutput:\n{}", out.output()),
        Err(CmelError::Runtime(error)) => error.message,
        Err(CmelError::Compile(errors)) => panic!("expected runtime error, got: {errors:?}"),
    }
}

/// Writes module files into a temp dir and returns it; import paths embed
/// the absolute directory.
fn module_dir(files: &[(&str, &str)]) -> TempDir {
    let dir = TempDir::new().expect("temp dir");
    for (name, source) in files {
        fs::write(dir.path().join(name), source).expect("write module");
    }
    dir
}

fn dir_path(dir: &TempDir) -> String {
    dir.path().display().to_string()
}

#[test]
fn embedded_math_module_selective_import() {
    let output = run("import abs, clamp from \"math\"; print abs(-5); print clamp(10, 0, 3);");
    assert_eq!(output, "5\n3\n");
}

#[test]
fn embedded_math_module_import_all() {
    let output = run("import \"math\"; print max(2, 9); print min(2, 9);");
    assert_eq!(output, "9\n2\n");
}

#[test]
fn modules_are_isolated_from_importers() {
    let dir = module_dir(&[("lib.cmel", "export var V = 1;\nfun hidden() { return V; }\n")]);
    let path = dir_path(&dir);

    let output = run(&format!("import V from \"{path}/lib\"; print V;"));
    assert_eq!(output, "1\n");

    let message = run_err(&format!("import V from \"{path}/lib\"; hidden();"));
    assert_eq!(message, "Undefined variable 'hidden'.");
}

#[test]
fn module_functions_read_their_own_globals() {
    let dir = module_dir(&[(
        "counter.cmel",
        "var count = 0;\nexport fun bump() { count = count + 1; return count; }\n",
    )]);
    let path = dir_path(&dir);
    let output = run(&format!(
        "import bump from \"{path}/counter\"; print bump(); print bump();"
    ));
    assert_eq!(output, "1\n2\n");
}

#[test]
fn module_bodies_execute_exactly_once() {
    let dir = module_dir(&[("noisy.cmel", "print \"loaded\";\nexport var ok = true;\n")]);
    let path = dir_path(&dir);
    let output = run(&format!(
        "import \"{path}/noisy\";
         import ok from \"{path}/noisy\";
         print ok;"
    ));
    assert_eq!(output, "loaded\ntrue\n");
}

#[test]
fn modules_can_import_modules_mid_load() {
    let dir = module_dir(&[("inner.cmel", "export fun answer() { return 41; }\n")]);
    let path = dir_path(&dir);
    let outer = format!(
        "import answer from \"{path}/inner\";\nexport fun plusOne() {{ return answer() + 1; }}\n"
    );
    let dir2 = module_dir(&[("outer.cmel", &outer)]);
    let path2 = dir_path(&dir2);
    let output = run(&format!("import plusOne from \"{path2}/outer\"; print plusOne();"));
    assert_eq!(output, "42\n");
}

#[test]
fn circular_imports_are_detected() {
    let dir = module_dir(&[("placeholder.cmel", "")]);
    let path = dir_path(&dir);
    fs::write(
        dir.path().join("a.cmel"),
        format!("import \"{path}/b\";\nexport var A = 1;\n"),
    )
    .unwrap();
    fs::write(
        dir.path().join("b.cmel"),
        format!("import \"{path}/a\";\nexport var B = 2;\n"),
    )
    .unwrap();
    let message = run_err(&format!("import \"{path}/a\";"));
    assert!(
        message.contains(&format!("Circular import of module '{path}/a'.")),
        "unexpected message: {message}"
    );
}

#[test]
fn missing_module_and_missing_export() {
    let message = run_err("import \"no_such_module_at_all\";");
    assert_eq!(message, "Could not open module 'no_such_module_at_all'.");

    let dir = module_dir(&[("lib.cmel", "export var V = 1;\n")]);
    let path = dir_path(&dir);
    let message = run_err(&format!("import nope from \"{path}/lib\";"));
    assert_eq!(message, format!("Module '{path}/lib.cmel' does not export 'nope'."));
}

#[test]
fn export_reads_the_global_at_export_time() {
    // The export opcode runs right after the binding, so a later mutation
    // of the module global is not re-exported.
    let dir = module_dir(&[(
        "lib.cmel",
        "export var V = 1;\nV = 2;\nexport fun get() { return V; }\n",
    )]);
    let path = dir_path(&dir);
    let output = run(&format!(
        "import V, get from \"{path}/lib\"; print V; print get();"
    ));
    assert_eq!(output, "1\n2\n");
}

#[test]
fn compile_errors_inside_modules_surface_as_runtime_errors() {
    let dir = module_dir(&[("broken.cmel", "var = 1;\n")]);
    let path = dir_path(&dir);
    let message = run_err(&format!("import \"{path}/broken\";"));
    assert!(message.starts_with(&format!("Could not compile module '{path}/broken'.")));
    assert!(message.contains("Expect variable name."));
}

#[test]
fn embedded_test_framework_reports_pass_and_fail() {
    let output = run(
        "import testCase, runTests from \"test\";
         var tests = [
           testCase(\"passes\", fun() { assertEqual(1, 1); }),
           testCase(\"fails\", fun() { assertEqual(1, 2); })
         ];
         runTests(tests);",
    );
    assert_eq!(
        output,
        "PASS passes\nFAIL: fails: Expected 1 but got 2.\n2 tests, 1 failures\n"
    );
}

#[test]
fn imports_resolve_against_the_module_cache_across_runs() {
    let dir = module_dir(&[("noisy.cmel", "print \"loaded\";\nexport var ok = true;\n")]);
    let path = dir_path(&dir);
    let mut out = CollectStringPrint::new();
    let mut runner = Runner::new();
    runner.run(&format!("import \"{path}/noisy\";"), &mut out).unwrap();
    runner.run(&format!("import \"{path}/noisy\";"), &mut out).unwrap();
    assert_eq!(out.output(), "loaded\n");
}
