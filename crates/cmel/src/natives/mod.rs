//! Built-in native functions.
//!
//! Natives are immediate values: a fieldless enum dispatched by `match`, so
//! calling one never allocates. [`native_bindings`] builds the globals table
//! they are installed into, both for the top-level script and for every
//! module namespace.

mod methods;

pub(crate) use methods::{NativeMethod, PrimitiveKind};

use std::{
    fs,
    io::{self, BufRead as _},
    time::{SystemTime, UNIX_EPOCH},
};

use strum::{EnumIter, IntoEnumIterator as _, IntoStaticStr};

use crate::{
    bytecode::{TestState, Vm},
    error::{RunResult, raise},
    heap::{Heap, HeapData, Table},
    io::PrintWriter,
    value::{Value, display_value},
};

/// Longest line `input()` accepts, excluding the newline.
const INPUT_LIMIT: usize = 255;

/// The global native functions, always installed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, EnumIter, IntoStaticStr)]
#[strum(serialize_all = "camelCase")]
pub(crate) enum NativeFn {
    Clock,
    Input,
    ReadFile,
    Number,
    Assert,
    AssertEqual,
    // Test-mode protocol, used by the embedded test framework.
    #[strum(serialize = "__enterTestMode")]
    EnterTestMode,
    #[strum(serialize = "__exitTestMode")]
    ExitTestMode,
    #[strum(serialize = "__setCurrentTest")]
    SetCurrentTest,
    #[strum(serialize = "__testFailed")]
    TestFailed,
    #[strum(serialize = "__getLastFailure")]
    GetLastFailure,
    #[strum(serialize = "__clearLastFailure")]
    ClearLastFailure,
}

/// Builds a fresh globals table with every native bound under its name.
pub(crate) fn native_bindings(heap: &mut Heap) -> Table {
    let mut table = Table::new();
    for native in NativeFn::iter() {
        let name: &'static str = native.into();
        let id = heap.intern(name);
        table.insert(id, Value::Native(native));
    }
    table
}

impl NativeFn {
    /// Negative arity means variadic with minimum `|arity|` arguments.
    pub fn arity(self) -> i8 {
        match self {
            Self::Clock
            | Self::Input
            | Self::EnterTestMode
            | Self::ExitTestMode
            | Self::TestFailed
            | Self::GetLastFailure
            | Self::ClearLastFailure => 0,
            Self::ReadFile | Self::Number | Self::SetCurrentTest => 1,
            Self::AssertEqual => 2,
            // assert(cond, message?)
            Self::Assert => -1,
        }
    }

    /// Runs the native. Arguments are the top `argc` stack values; the
    /// caller replaces the call window with the returned value.
    pub fn call(self, vm: &mut Vm, argc: usize, _writer: &mut dyn PrintWriter) -> RunResult<Value> {
        match self {
            Self::Clock => {
                let seconds = SystemTime::now()
                    .duration_since(UNIX_EPOCH)
                    .unwrap_or_default()
                    .as_secs_f64();
                Ok(Value::Number(seconds))
            }
            Self::Input => {
                let mut line = String::new();
                if io::stdin().lock().read_line(&mut line).is_err() {
                    return raise("Could not read input.");
                }
                if line.ends_with('\n') {
                    line.pop();
                    if line.ends_with('\r') {
                        line.pop();
                    }
                }
                if line.len() > INPUT_LIMIT {
                    return raise("Input too long.");
                }
                let id = vm.intern(&line);
                Ok(Value::Ref(id))
            }
            Self::ReadFile => {
                let path = expect_str_arg(vm, argc, 0, "Argument to 'readFile' must be a string.")?;
                let Ok(contents) = fs::read_to_string(&path) else {
                    return raise(format!("Could not read file '{path}'."));
                };
                let id = vm.intern(&contents);
                Ok(Value::Ref(id))
            }
            Self::Number => match vm.arg(argc, 0) {
                value @ Value::Number(_) => Ok(value),
                Value::Ref(id) if matches!(vm.heap.get(id), HeapData::Str(_)) => {
                    let content = vm.heap.str_content(id);
                    match content.parse::<f64>() {
                        Ok(n) => Ok(Value::Number(n)),
                        Err(_) => raise("Could not convert string to number."),
                    }
                }
                _ => raise("Argument to 'number' must be a string or a number."),
            },
            Self::Assert => {
                if argc > 2 {
                    return raise(format!("Expected 1 or 2 arguments but got {argc}."));
                }
                if !vm.arg(argc, 0).is_falsy() {
                    return Ok(Value::Nil);
                }
                let message = if argc == 2 {
                    let value = vm.arg(argc, 1);
                    display_value(value, &vm.heap, &vm.functions)
                } else {
                    "Assertion failed.".to_owned()
                };
                raise(message)
            }
            Self::AssertEqual => {
                let expected = vm.arg(argc, 0);
                let actual = vm.arg(argc, 1);
                if expected == actual {
                    Ok(Value::Nil)
                } else {
                    let expected = display_value(expected, &vm.heap, &vm.functions);
                    let actual = display_value(actual, &vm.heap, &vm.functions);
                    raise(format!("Expected {expected} but got {actual}."))
                }
            }
            Self::EnterTestMode => {
                vm.test_state = Some(TestState::default());
                Ok(Value::Nil)
            }
            Self::ExitTestMode => {
                vm.test_state = None;
                Ok(Value::Nil)
            }
            Self::SetCurrentTest => {
                let name = expect_str_arg(vm, argc, 0, "Argument to '__setCurrentTest' must be a string.")?;
                if let Some(state) = vm.test_state.as_mut() {
                    state.current_test = Some(name);
                }
                Ok(Value::Nil)
            }
            Self::TestFailed => {
                let failed = vm.test_state.as_ref().is_some_and(|s| !s.failures.is_empty());
                Ok(Value::Bool(failed))
            }
            Self::GetLastFailure => {
                let last = vm.test_state.as_ref().and_then(|s| s.failures.last().cloned());
                match last {
                    Some(message) => {
                        let id = vm.intern(&message);
                        Ok(Value::Ref(id))
                    }
                    None => Ok(Value::Nil),
                }
            }
            Self::ClearLastFailure => {
                if let Some(state) = vm.test_state.as_mut() {
                    state.failures.pop();
                }
                Ok(Value::Nil)
            }
        }
    }
}

/// Copies out a string argument or raises `message`.
pub(super) fn expect_str_arg(vm: &Vm, argc: usize, index: usize, message: &str) -> RunResult<String> {
    match vm.arg(argc, index) {
        Value::Ref(id) if matches!(vm.heap.get(id), HeapData::Str(_)) => {
            Ok(vm.heap.str_content(id).to_owned())
        }
        _ => raise(message),
    }
}

/// Reads a number argument or raises `message`.
pub(super) fn expect_number_arg(vm: &Vm, argc: usize, index: usize, message: &str) -> RunResult<f64> {
    match vm.arg(argc, index) {
        Value::Number(n) => Ok(n),
        _ => raise(message),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn binding_names_match_the_language_surface() {
        let clock: &'static str = NativeFn::Clock.into();
        let read_file: &'static str = NativeFn::ReadFile.into();
        let enter: &'static str = NativeFn::EnterTestMode.into();
        assert_eq!(clock, "clock");
        assert_eq!(read_file, "readFile");
        assert_eq!(enter, "__enterTestMode");
    }

    #[test]
    fn bindings_table_contains_every_native() {
        let mut heap = Heap::new(false);
        let table = native_bindings(&mut heap);
        assert_eq!(table.len(), NativeFn::iter().count());
        let assert_equal = heap.intern("assertEqual");
        assert_eq!(table.get(&assert_equal), Some(&Value::Native(NativeFn::AssertEqual)));
    }
}
