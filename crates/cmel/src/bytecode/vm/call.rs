//! Call and property dispatch: closures, bound methods, class construction,
//! native functions, and the fused invoke paths.

use super::{FRAMES_MAX, CallFrame, Vm};
use crate::{
    error::{RunResult, raise},
    heap::{BoundMethod, BoundNative, HeapData, HeapId, Instance, Table},
    io::PrintWriter,
    natives::{NativeFn, NativeMethod, PrimitiveKind},
    value::Value,
};

/// What an invoke receiver resolved to, extracted up front so heap borrows
/// do not outlive the dispatch.
enum InvokeTarget {
    /// A callable field on an instance shadows any method of the same name.
    Field(Value),
    Methods(HeapId),
    Export(Option<Value>),
    Primitive(PrimitiveKind),
    NotSupported,
}

impl Vm {
    /// Dispatches a call to whatever sits beneath the arguments.
    pub(super) fn call_value(&mut self, callee: Value, argc: usize, writer: &mut dyn PrintWriter) -> RunResult<()> {
        match callee {
            Value::Ref(id) => match self.heap.get(id) {
                HeapData::Closure(_) => self.call_closure(id, argc),
                HeapData::BoundMethod(bound) => {
                    let receiver = bound.receiver;
                    let method = bound.method;
                    let slot = self.stack.len() - argc - 1;
                    self.stack[slot] = receiver;
                    self.call_closure(method, argc)
                }
                HeapData::BoundNative(bound) => {
                    let receiver = bound.receiver;
                    let method = bound.method;
                    check_method_arity(method, argc)?;
                    let result = method.call(self, argc, receiver, writer)?;
                    self.finish_native_call(argc, result);
                    Ok(())
                }
                HeapData::Class(_) => self.call_class(id, argc),
                _ => raise("Can only call functions and classes."),
            },
            Value::Native(native) => {
                check_native_arity(native, argc)?;
                let result = native.call(self, argc, writer)?;
                self.finish_native_call(argc, result);
                Ok(())
            }
            _ => raise("Can only call functions and classes."),
        }
    }

    /// Constructs an instance and runs `init` when the class declares one.
    fn call_class(&mut self, class: HeapId, argc: usize) -> RunResult<()> {
        // The class value is still on the stack, so allocating here is safe.
        let instance = self.alloc(HeapData::Instance(Instance {
            class,
            fields: Table::new(),
        }));
        let slot = self.stack.len() - argc - 1;
        self.stack[slot] = Value::Ref(instance);
        let initializer = self.heap.class(class).methods.get(&self.init_string).copied();
        match initializer {
            Some(Value::Ref(init)) => self.call_closure(init, argc),
            Some(_) => raise("Class initializer is not a closure."),
            None if argc != 0 => raise(format!("Expected 0 arguments but got {argc}.")),
            None => Ok(()),
        }
    }

    /// Pushes a frame for `closure`. The callee value must already sit
    /// beneath its `argc` arguments.
    pub(crate) fn call_closure(&mut self, closure: HeapId, argc: usize) -> RunResult<()> {
        let function = self.heap.closure(closure).function;
        let module = self.heap.closure(closure).module;
        let arity = self.functions.get(function).arity as usize;
        if argc != arity {
            return raise(format!("Expected {arity} arguments but got {argc}."));
        }
        if self.frames.len() == FRAMES_MAX {
            return raise("Stack overflow.");
        }
        if self.tracer.is_some() {
            let name = match self.functions.get(function).name {
                Some(id) => self.heap.str_content(id).to_owned(),
                None => "script".to_owned(),
            };
            let depth = self.frames.len();
            if let Some(tracer) = self.tracer.as_mut() {
                tracer.on_call(&name, depth);
            }
        }
        self.frames.push(CallFrame {
            closure,
            function,
            module,
            ip: 0,
            slot_base: self.stack.len() - argc - 1,
        });
        Ok(())
    }

    /// Fused property access plus call. Instance fields shadow methods;
    /// primitive receivers dispatch into their built-in method tables.
    pub(super) fn invoke(&mut self, name: HeapId, argc: usize, writer: &mut dyn PrintWriter) -> RunResult<()> {
        let receiver = self.peek(argc);
        let target = match receiver {
            Value::Number(_) => InvokeTarget::Primitive(PrimitiveKind::Number),
            Value::Ref(id) => match self.heap.get(id) {
                HeapData::Instance(instance) => match instance.fields.get(&name) {
                    Some(&field) => InvokeTarget::Field(field),
                    None => InvokeTarget::Methods(instance.class),
                },
                HeapData::Module(module) => InvokeTarget::Export(module.exports.get(&name).copied()),
                HeapData::Str(_) => InvokeTarget::Primitive(PrimitiveKind::Str),
                HeapData::List(_) => InvokeTarget::Primitive(PrimitiveKind::List),
                HeapData::Map(_) => InvokeTarget::Primitive(PrimitiveKind::Map),
                _ => InvokeTarget::NotSupported,
            },
            _ => InvokeTarget::NotSupported,
        };

        match target {
            InvokeTarget::Field(field) => {
                let slot = self.stack.len() - argc - 1;
                self.stack[slot] = field;
                self.call_value(field, argc, writer)
            }
            InvokeTarget::Methods(class) => self.invoke_from_class(class, name, argc),
            InvokeTarget::Export(Some(value)) => {
                let slot = self.stack.len() - argc - 1;
                self.stack[slot] = value;
                self.call_value(value, argc, writer)
            }
            InvokeTarget::Export(None) => {
                let name = self.heap.str_content(name);
                raise(format!("Undefined property '{name}'."))
            }
            InvokeTarget::Primitive(kind) => self.invoke_primitive(kind, name, argc, writer),
            InvokeTarget::NotSupported => raise("Only instances have methods."),
        }
    }

    pub(super) fn super_invoke(&mut self, superclass: Value, name: HeapId, argc: usize) -> RunResult<()> {
        let Value::Ref(class) = superclass else {
            return raise("Superclass must be a class.");
        };
        self.invoke_from_class(class, name, argc)
    }

    fn invoke_from_class(&mut self, class: HeapId, name: HeapId, argc: usize) -> RunResult<()> {
        let method = self.heap.class(class).methods.get(&name).copied();
        match method {
            Some(Value::Ref(closure)) => self.call_closure(closure, argc),
            _ => {
                let name = self.heap.str_content(name);
                raise(format!("Undefined property '{name}'."))
            }
        }
    }

    /// Resolves and calls a built-in method on a primitive receiver. The
    /// receiver sits beneath the arguments exactly like a callee.
    fn invoke_primitive(
        &mut self,
        kind: PrimitiveKind,
        name: HeapId,
        argc: usize,
        writer: &mut dyn PrintWriter,
    ) -> RunResult<()> {
        let method_name = self.heap.str_content(name);
        let Some(method) = NativeMethod::resolve(kind, method_name) else {
            return raise(format!("Undefined property '{method_name}'."));
        };
        check_method_arity(method, argc)?;
        let receiver = self.peek(argc);
        let result = method.call(self, argc, receiver, writer)?;
        self.finish_native_call(argc, result);
        Ok(())
    }

    /// Property access: instance fields, then class methods (bound); module
    /// exports; primitive methods as bound natives.
    pub(super) fn get_property(&mut self, name: HeapId) -> RunResult<()> {
        let receiver = self.peek(0);
        let kind = match receiver {
            Value::Number(_) => Some(PrimitiveKind::Number),
            Value::Ref(id) => match self.heap.get(id) {
                HeapData::Instance(instance) => {
                    if let Some(&field) = instance.fields.get(&name) {
                        self.pop();
                        self.push(field);
                        return Ok(());
                    }
                    let class = instance.class;
                    let method = self.heap.class(class).methods.get(&name).copied();
                    let Some(Value::Ref(method)) = method else {
                        let name = self.heap.str_content(name);
                        return raise(format!("Undefined property '{name}'."));
                    };
                    // Receiver stays on the stack while the bound method is
                    // allocated.
                    let bound = self.alloc(HeapData::BoundMethod(BoundMethod { receiver, method }));
                    self.pop();
                    self.push(Value::Ref(bound));
                    return Ok(());
                }
                HeapData::Module(module) => {
                    let Some(&value) = module.exports.get(&name) else {
                        let name = self.heap.str_content(name);
                        return raise(format!("Undefined property '{name}'."));
                    };
                    self.pop();
                    self.push(value);
                    return Ok(());
                }
                HeapData::Str(_) => Some(PrimitiveKind::Str),
                HeapData::List(_) => Some(PrimitiveKind::List),
                HeapData::Map(_) => Some(PrimitiveKind::Map),
                _ => None,
            },
            _ => None,
        };

        let Some(kind) = kind else {
            return raise("Only instances have properties.");
        };
        let method_name = self.heap.str_content(name);
        let Some(method) = NativeMethod::resolve(kind, method_name) else {
            return raise(format!("Undefined property '{method_name}'."));
        };
        let bound = self.alloc(HeapData::BoundNative(BoundNative { receiver, method }));
        self.pop();
        self.push(Value::Ref(bound));
        Ok(())
    }

    pub(super) fn set_property(&mut self, name: HeapId) -> RunResult<()> {
        let receiver = self.peek(1);
        let Value::Ref(id) = receiver else {
            return raise("Only instances have fields.");
        };
        if !matches!(self.heap.get(id), HeapData::Instance(_)) {
            return raise("Only instances have fields.");
        }
        let value = self.peek(0);
        self.heap.instance_mut(id).fields.insert(name, value);
        // Assignment leaves the assigned value on the stack.
        self.pop();
        self.pop();
        self.push(value);
        Ok(())
    }

    /// `super.name`: pops the superclass and binds its method to the
    /// receiver left on the stack top.
    pub(super) fn get_super(&mut self, name: HeapId) -> RunResult<()> {
        let Value::Ref(class) = self.pop() else {
            return raise("Superclass must be a class.");
        };
        let receiver = self.peek(0);
        let method = self.heap.class(class).methods.get(&name).copied();
        let Some(Value::Ref(method)) = method else {
            let name = self.heap.str_content(name);
            return raise(format!("Undefined property '{name}'."));
        };
        let bound = self.alloc(HeapData::BoundMethod(BoundMethod { receiver, method }));
        self.pop();
        self.push(Value::Ref(bound));
        Ok(())
    }

    /// Replaces the callee window (`argc` args plus the callee slot) with a
    /// native call's result.
    fn finish_native_call(&mut self, argc: usize, result: Value) {
        let new_len = self.stack.len() - argc - 1;
        self.stack.truncate(new_len);
        self.push(result);
    }

    /// Calls `callee` with `args` from native code (list callbacks, the
    /// module loader), running nested frames to completion and returning
    /// the result. The stack is restored on every path.
    pub(crate) fn call_callable(
        &mut self,
        callee: Value,
        args: &[Value],
        writer: &mut dyn PrintWriter,
    ) -> RunResult<Value> {
        let start = self.stack.len();
        self.push(callee);
        for &arg in args {
            self.push(arg);
        }
        let floor = self.frames.len();
        if let Err(err) = self.call_value(callee, args.len(), writer) {
            self.stack.truncate(start);
            return Err(err);
        }
        if self.frames.len() > floor {
            let result = self.run_until(floor, writer);
            if result.is_err() {
                self.stack.truncate(start.min(self.stack.len()));
            }
            result
        } else {
            Ok(self.pop())
        }
    }
}

/// Checks a global native's arity: non-negative means exact, negative means
/// variadic with minimum `|arity|`.
fn check_native_arity(native: NativeFn, argc: usize) -> RunResult<()> {
    let arity = native.arity();
    if arity >= 0 {
        let expected = arity as usize;
        if argc != expected {
            return raise(format!("Expected {expected} arguments but got {argc}."));
        }
    } else {
        let minimum = arity.unsigned_abs() as usize;
        if argc < minimum {
            return raise(format!("Expected at least {minimum} arguments but got {argc}."));
        }
    }
    Ok(())
}

/// Same arity rule for primitive-type methods.
fn check_method_arity(method: NativeMethod, argc: usize) -> RunResult<()> {
    let arity = method.arity();
    if arity >= 0 {
        let expected = arity as usize;
        if argc != expected {
            return raise(format!("Expected {expected} arguments but got {argc}."));
        }
    } else {
        let minimum = arity.unsigned_abs() as usize;
        if argc < minimum {
            return raise(format!("Expected at least {minimum} arguments but got {argc}."));
        }
    }
    Ok(())
}
