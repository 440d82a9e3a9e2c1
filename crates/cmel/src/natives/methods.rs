//! Built-in methods on primitive receivers: strings, numbers, lists, and
//! maps. Resolved by name with `strum`'s `EnumString` (camelCase matches the
//! language surface) and dispatched by `match`, like the global natives.
//!
//! String operations are byte-oriented: `length` counts bytes, `charAt`
//! addresses bytes, `slice` cuts at byte offsets. Pieces that land inside a
//! multi-byte sequence come back lossily re-decoded.

use std::str::FromStr as _;

use strum::EnumString;

use super::{expect_number_arg, expect_str_arg};
use crate::{
    bytecode::Vm,
    error::{RunResult, VmError, raise},
    heap::{HeapData, HeapId},
    io::PrintWriter,
    value::Value,
};

/// Which primitive method table a receiver dispatches into.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum PrimitiveKind {
    Str,
    Number,
    List,
    Map,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, EnumString)]
#[strum(serialize_all = "camelCase")]
pub(crate) enum StrMethod {
    Length,
    Split,
    CharAt,
    Slice,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, EnumString)]
#[strum(serialize_all = "camelCase")]
pub(crate) enum NumberMethod {
    Add,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, EnumString)]
#[strum(serialize_all = "camelCase")]
pub(crate) enum ListMethod {
    Add,
    Remove,
    Length,
    Map,
    Filter,
    Find,
    Contains,
    Reverse,
    Sum,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, EnumString)]
#[strum(serialize_all = "camelCase")]
pub(crate) enum MapMethod {
    Keys,
    Values,
    Has,
    Remove,
    Length,
}

/// A primitive method paired with its receiver kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum NativeMethod {
    Str(StrMethod),
    Number(NumberMethod),
    List(ListMethod),
    Map(MapMethod),
}

impl NativeMethod {
    /// Looks `name` up in the method table for `kind`.
    pub fn resolve(kind: PrimitiveKind, name: &str) -> Option<Self> {
        match kind {
            PrimitiveKind::Str => StrMethod::from_str(name).ok().map(Self::Str),
            PrimitiveKind::Number => NumberMethod::from_str(name).ok().map(Self::Number),
            PrimitiveKind::List => ListMethod::from_str(name).ok().map(Self::List),
            PrimitiveKind::Map => MapMethod::from_str(name).ok().map(Self::Map),
        }
    }

    /// Negative arity means variadic with minimum `|arity|` arguments.
    pub fn arity(self) -> i8 {
        match self {
            Self::Str(StrMethod::Length) => 0,
            Self::Str(StrMethod::Split | StrMethod::CharAt) => 1,
            // slice(start, end?)
            Self::Str(StrMethod::Slice) => -1,
            Self::Number(NumberMethod::Add) => 1,
            Self::List(ListMethod::Length | ListMethod::Reverse | ListMethod::Sum) => 0,
            Self::List(
                ListMethod::Add
                | ListMethod::Remove
                | ListMethod::Map
                | ListMethod::Filter
                | ListMethod::Find
                | ListMethod::Contains,
            ) => 1,
            Self::Map(MapMethod::Keys | MapMethod::Values | MapMethod::Length) => 0,
            Self::Map(MapMethod::Has | MapMethod::Remove) => 1,
        }
    }

    /// Runs the method. The receiver still sits beneath the arguments on
    /// the stack, which keeps it (and everything it holds) rooted.
    pub fn call(
        self,
        vm: &mut Vm,
        argc: usize,
        receiver: Value,
        writer: &mut dyn PrintWriter,
    ) -> RunResult<Value> {
        match self {
            Self::Str(method) => str_method(method, vm, argc, receiver),
            Self::Number(method) => number_method(method, vm, argc, receiver),
            Self::List(method) => list_method(method, vm, argc, receiver, writer),
            Self::Map(method) => map_method(method, vm, argc, receiver),
        }
    }
}

fn receiver_id(receiver: Value) -> HeapId {
    match receiver {
        Value::Ref(id) => id,
        other => panic!("primitive method receiver is not a heap value: {other:?}"),
    }
}

fn str_method(method: StrMethod, vm: &mut Vm, argc: usize, receiver: Value) -> RunResult<Value> {
    let content = vm.heap.str_content(receiver_id(receiver)).to_owned();
    match method {
        StrMethod::Length => Ok(Value::Number(content.len() as f64)),
        StrMethod::Split => {
            let separator = expect_str_arg(vm, argc, 0, "Argument to 'split' must be a string.")?;
            let result = vm.alloc(HeapData::List(Vec::new()));
            vm.heap.push_temp_root(Value::Ref(result));
            if separator.is_empty() {
                // Empty separator splits into individual bytes.
                for i in 0..content.len() {
                    let piece = String::from_utf8_lossy(&content.as_bytes()[i..=i]).into_owned();
                    let id = vm.intern(&piece);
                    vm.heap.list_mut(result).push(Value::Ref(id));
                }
            } else {
                for piece in content.split(separator.as_str()) {
                    let id = vm.intern(piece);
                    vm.heap.list_mut(result).push(Value::Ref(id));
                }
            }
            vm.heap.pop_temp_root();
            Ok(Value::Ref(result))
        }
        StrMethod::CharAt => {
            let n = expect_number_arg(vm, argc, 0, "String index must be a number.")?;
            let len = content.len() as i64;
            if n.fract() != 0.0 {
                return raise("String index out of bounds.");
            }
            let mut index = n as i64;
            if index < 0 {
                index += len;
            }
            if index < 0 || index >= len {
                return raise("String index out of bounds.");
            }
            let byte = content.as_bytes()[index as usize];
            let piece = String::from_utf8_lossy(&[byte]).into_owned();
            let id = vm.intern(&piece);
            Ok(Value::Ref(id))
        }
        StrMethod::Slice => {
            if argc > 2 {
                return raise(format!("Expected 1 or 2 arguments but got {argc}."));
            }
            let len = content.len();
            let start = expect_number_arg(vm, argc, 0, "Argument to 'slice' must be a number.")?;
            let end = if argc == 2 {
                expect_number_arg(vm, argc, 1, "Argument to 'slice' must be a number.")?
            } else {
                len as f64
            };
            let start = clamp_index(start, len);
            let end = clamp_index(end, len);
            let piece = if start >= end {
                String::new()
            } else {
                String::from_utf8_lossy(&content.as_bytes()[start..end]).into_owned()
            };
            let id = vm.intern(&piece);
            Ok(Value::Ref(id))
        }
    }
}

/// Slice bounds: negatives count from the end, everything clamps into
/// `[0, len]`.
fn clamp_index(n: f64, len: usize) -> usize {
    let mut index = n as i64;
    if index < 0 {
        index += len as i64;
    }
    index.clamp(0, len as i64) as usize
}

fn number_method(method: NumberMethod, vm: &mut Vm, argc: usize, receiver: Value) -> RunResult<Value> {
    let Value::Number(base) = receiver else {
        panic!("number method receiver is not a number: {receiver:?}");
    };
    match method {
        NumberMethod::Add => {
            let n = expect_number_arg(vm, argc, 0, "Argument to 'add' must be a number.")?;
            Ok(Value::Number(base + n))
        }
    }
}

fn list_method(
    method: ListMethod,
    vm: &mut Vm,
    argc: usize,
    receiver: Value,
    writer: &mut dyn PrintWriter,
) -> RunResult<Value> {
    let id = receiver_id(receiver);
    match method {
        ListMethod::Add => {
            let value = vm.arg(argc, 0);
            vm.heap.list_mut(id).push(value);
            Ok(Value::Nil)
        }
        ListMethod::Remove => {
            let n = expect_number_arg(vm, argc, 0, "List index must be a number.")?;
            let len = vm.heap.list(id).len();
            if n.fract() != 0.0 || n < 0.0 || (n as usize) >= len {
                return raise("List index out of bounds.");
            }
            Ok(vm.heap.list_mut(id).remove(n as usize))
        }
        ListMethod::Length => Ok(Value::Number(vm.heap.list(id).len() as f64)),
        ListMethod::Contains => {
            let needle = vm.arg(argc, 0);
            Ok(Value::Bool(vm.heap.list(id).contains(&needle)))
        }
        ListMethod::Reverse => {
            let mut items = vm.heap.list(id).clone();
            items.reverse();
            // The originals stay rooted through the receiver while the new
            // list is allocated.
            let reversed = vm.alloc(HeapData::List(items));
            Ok(Value::Ref(reversed))
        }
        ListMethod::Sum => {
            let mut total = 0.0;
            for value in vm.heap.list(id) {
                let Value::Number(n) = *value else {
                    return raise("Can only sum numbers.");
                };
                total += n;
            }
            Ok(Value::Number(total))
        }
        ListMethod::Map | ListMethod::Filter | ListMethod::Find => {
            let callback = vm.arg(argc, 0);
            let items = vm.heap.list(id).clone();
            // Root the snapshot: the callback may mutate the receiver list,
            // and collection can run between calls.
            let roots = vm.heap.temp_roots_len();
            for &item in &items {
                vm.heap.push_temp_root(item);
            }
            let outcome = list_iterate(method, vm, callback, &items, writer);
            vm.heap.truncate_temp_roots(roots);
            outcome
        }
    }
}

/// The callback-driven list methods share one loop; results accumulate in a
/// temp-rooted heap list so a mid-iteration collection cannot free them.
fn list_iterate(
    method: ListMethod,
    vm: &mut Vm,
    callback: Value,
    items: &[Value],
    writer: &mut dyn PrintWriter,
) -> RunResult<Value> {
    let result = vm.alloc(HeapData::List(Vec::new()));
    vm.heap.push_temp_root(Value::Ref(result));
    let mut error: Option<VmError> = None;
    let mut found: Option<Value> = None;
    for &item in items {
        match vm.call_callable(callback, &[item], writer) {
            Ok(produced) => match method {
                ListMethod::Map => vm.heap.list_mut(result).push(produced),
                ListMethod::Filter => {
                    if !produced.is_falsy() {
                        vm.heap.list_mut(result).push(item);
                    }
                }
                ListMethod::Find => {
                    if !produced.is_falsy() {
                        found = Some(item);
                        break;
                    }
                }
                _ => unreachable!("list_iterate on non-callback method"),
            },
            Err(err) => {
                error = Some(err);
                break;
            }
        }
    }
    vm.heap.pop_temp_root();
    if let Some(err) = error {
        return Err(err);
    }
    match method {
        ListMethod::Find => Ok(found.unwrap_or(Value::Nil)),
        _ => Ok(Value::Ref(result)),
    }
}

fn map_method(method: MapMethod, vm: &mut Vm, argc: usize, receiver: Value) -> RunResult<Value> {
    let id = receiver_id(receiver);
    match method {
        MapMethod::Keys => {
            let keys: Vec<Value> = vm.heap.map(id).keys().map(|&k| Value::Ref(k)).collect();
            let list = vm.alloc(HeapData::List(keys));
            Ok(Value::Ref(list))
        }
        MapMethod::Values => {
            let values: Vec<Value> = vm.heap.map(id).values().copied().collect();
            let list = vm.alloc(HeapData::List(values));
            Ok(Value::Ref(list))
        }
        MapMethod::Has => {
            let key = string_key(vm, argc, 0)?;
            Ok(Value::Bool(vm.heap.map(id).contains_key(&key)))
        }
        MapMethod::Remove => {
            let key = string_key(vm, argc, 0)?;
            Ok(vm.heap.map_mut(id).shift_remove(&key).unwrap_or(Value::Nil))
        }
        MapMethod::Length => Ok(Value::Number(vm.heap.map(id).len() as f64)),
    }
}

fn string_key(vm: &Vm, argc: usize, index: usize) -> RunResult<HeapId> {
    match vm.arg(argc, index) {
        Value::Ref(id) if matches!(vm.heap.get(id), HeapData::Str(_)) => Ok(id),
        _ => raise("Map keys must be strings."),
    }
}
