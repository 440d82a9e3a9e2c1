//! Expect-comment harness: every `tests/cases/*.cmel` file carries its
//! expectations inline.
//!
//! - `// expect: <text>` — the next line of stdout, in order.
//! - `// expect error: <text>` — must appear in the rendered error.
//!
//! A file with error expectations must fail; stdout produced before the
//! error is still compared.

use std::{fs, path::Path};

use cmel::{CollectStringPrint, Runner};

fn run_case(path: &Path) -> datatest_stable::Result<()> {
    let source = fs::read_to_string(path)?;

    let mut expected_output = String::new();
    let mut expected_errors: Vec<String> = Vec::new();
    for line in source.lines() {
        if let Some((_, text)) = line.split_once("// expect error: ") {
            expected_errors.push(text.to_owned());
        } else if let Some((_, text)) = line.split_once("// expect: ") {
            expected_output.push_str(text);
            expected_output.push('\n');
        }
    }

    let mut out = CollectStringPrint::new();
    let mut runner = Runner::new();
    match runner.run(&source, &mut out) {
        Ok(()) => {
            if !expected_errors.is_empty() {
                return Err(format!("expected an error, none occurred: {expected_errors:?}").into());
            }
        }
        Err(error) => {
            if expected_errors.is_empty() {
                return Err(format!("unexpected error:\n{error}").into());
            }
            let rendered = error.to_string();
            for expected in &expected_errors {
                if !rendered.contains(expected) {
                    return Err(format!("error did not mention '{expected}':\n{rendered}").into());
                }
            }
        }
    }

    if out.output() != expected_output {
        return Err(format!(
            "output mismatch\n--- expected ---\n{expected_output}--- actual ---\n{}",
            out.output()
        )
        .into());
    }
    Ok(())
}

datatest_stable::harness!(run_case, "tests/cases", r"^.*\.cmel$");
