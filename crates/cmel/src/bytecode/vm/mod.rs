//! The virtual machine: a stack interpreter over call frames.
//!
//! The dispatch loop caches the active frame in a local and fetches operands
//! through macros; anything that pushes or pops a frame (calls, returns,
//! error recovery) reloads the cache. Errors raised while executing are
//! either converted into a traced [`RuntimeError`] or, under test mode,
//! recorded and unwound one frame so the caller resumes with `nil`.
//!
//! The VM owns every GC root, so collection is triggered here: allocation
//! helpers collect first, while operands are still on the stack, then
//! allocate.

mod call;

use ahash::AHashMap;
use smallvec::SmallVec;

use crate::{
    bytecode::{Opcode, compile},
    error::{CmelError, RunResult, RuntimeError, TraceFrame, VmError, raise},
    function::{FunctionId, Functions},
    heap::{Closure, Heap, HeapData, HeapId, MapEntries, Table, Upvalue},
    io::PrintWriter,
    natives::native_bindings,
    tracer::VmTracer,
    value::{Value, display_value},
};

/// Maximum call depth.
pub(crate) const FRAMES_MAX: usize = 64;
/// Value stack is reserved up front; open upvalues hold slot indices, so
/// growth past this would be harmless, but reserving avoids rehoming.
pub(crate) const STACK_MAX: usize = FRAMES_MAX * 256;

/// One activation record. `slot_base` is the stack index of the callee
/// value; locals sit above it.
#[derive(Debug, Clone, Copy)]
pub(crate) struct CallFrame {
    pub closure: HeapId,
    pub function: FunctionId,
    /// Module namespace for global accesses, carried from the closure.
    pub module: Option<HeapId>,
    pub ip: usize,
    pub slot_base: usize,
}

/// Copy of the active frame the dispatch loop works on; synced back on any
/// frame change.
#[derive(Debug, Clone, Copy)]
struct Cached {
    index: usize,
    closure: HeapId,
    function: FunctionId,
    module: Option<HeapId>,
    ip: usize,
    slot_base: usize,
}

/// Runtime-error diversion state while test mode is active.
#[derive(Debug, Default)]
pub(crate) struct TestState {
    pub current_test: Option<String>,
    pub failures: Vec<String>,
}

/// What error recovery decided the dispatch loop should do.
enum Unwound {
    /// Test mode absorbed the error; the cached frame must be reloaded.
    Resume,
    /// The error unwound past this run's frame floor.
    Finished(Value),
}

macro_rules! fetch_byte {
    ($self:expr, $frame:ident) => {{
        let byte = $self.functions.get($frame.function).chunk.code[$frame.ip];
        $frame.ip += 1;
        byte
    }};
}

macro_rules! fetch_u16 {
    ($self:expr, $frame:ident) => {{
        let code = &$self.functions.get($frame.function).chunk.code;
        let value = u16::from_le_bytes([code[$frame.ip], code[$frame.ip + 1]]);
        $frame.ip += 2;
        value
    }};
}

/// Evaluates a fallible operation inside the run loop. On error, syncs the
/// cached ip, routes through [`Vm::recover`], and either resumes (test
/// mode), finishes the run, or propagates a fatal error.
macro_rules! vm_try {
    ($self:expr, $frame:ident, $floor:expr, $expr:expr) => {
        match $expr {
            Ok(value) => value,
            Err(err) => {
                $self.sync_ip(&$frame);
                match $self.recover(err, $floor)? {
                    Unwound::Resume => {
                        $frame = $self.cached_frame();
                        continue;
                    }
                    Unwound::Finished(value) => return Ok(value),
                }
            }
        }
    };
}

pub(crate) struct Vm {
    pub(crate) heap: Heap,
    pub(crate) functions: Functions,
    pub(crate) stack: Vec<Value>,
    pub(crate) frames: Vec<CallFrame>,
    /// Top-level script globals; module code resolves globals in its own
    /// module's table instead.
    pub(crate) globals: Table,
    /// Open upvalues ordered by descending stack slot.
    open_upvalues: Vec<HeapId>,
    /// Module cache: canonical path string to module, permanent.
    pub(crate) modules: AHashMap<HeapId, HeapId>,
    /// Paths currently executing their module body; used to detect import
    /// cycles.
    pub(crate) loading: Vec<HeapId>,
    pub(crate) current_module: Option<HeapId>,
    /// Interned `"init"`, looked up on every class call.
    pub(crate) init_string: HeapId,
    pub(crate) test_state: Option<TestState>,
    pub(crate) tracer: Option<Box<dyn VmTracer>>,
}

impl Vm {
    pub fn new(gc_stress: bool) -> Self {
        let mut heap = Heap::new(gc_stress);
        let init_string = heap.intern("init");
        let globals = native_bindings(&mut heap);
        Self {
            heap,
            functions: Functions::default(),
            stack: Vec::with_capacity(STACK_MAX),
            frames: Vec::with_capacity(FRAMES_MAX),
            globals,
            open_upvalues: Vec::new(),
            modules: AHashMap::new(),
            loading: Vec::new(),
            current_module: None,
            init_string,
            test_state: None,
            tracer: None,
        }
    }

    /// Compiles and runs `source` as a top-level script.
    pub fn interpret(&mut self, source: &str, writer: &mut dyn PrintWriter) -> Result<(), CmelError> {
        let function = compile(source, &mut self.heap, &mut self.functions).map_err(CmelError::Compile)?;
        let closure = self.heap.allocate(HeapData::Closure(Closure {
            function,
            upvalues: SmallVec::new(),
            module: None,
        }));
        self.push(Value::Ref(closure));
        let result = self
            .call_closure(closure, 0)
            .and_then(|()| self.run_until(0, writer).map(|_| ()));
        match result {
            Ok(()) => Ok(()),
            Err(VmError::Fatal(error)) => {
                self.reset_stack();
                Err(CmelError::Runtime(*error))
            }
            Err(VmError::Raise(message)) => {
                let error = self.build_runtime_error(message);
                self.reset_stack();
                Err(CmelError::Runtime(error))
            }
        }
    }

    // --- stack ------------------------------------------------------------

    pub(crate) fn push(&mut self, value: Value) {
        self.stack.push(value);
    }

    pub(crate) fn pop(&mut self) -> Value {
        match self.stack.pop() {
            Some(value) => value,
            None => panic!("value stack underflow"),
        }
    }

    pub(crate) fn peek(&self, distance: usize) -> Value {
        self.stack[self.stack.len() - 1 - distance]
    }

    /// Argument `index` of a native call with `argc` arguments on the stack.
    pub(crate) fn arg(&self, argc: usize, index: usize) -> Value {
        self.stack[self.stack.len() - argc + index]
    }

    fn reset_stack(&mut self) {
        self.stack.clear();
        self.frames.clear();
        self.open_upvalues.clear();
        self.current_module = None;
        self.loading.clear();
    }

    // --- allocation and collection ----------------------------------------

    /// Allocates after collecting if due. Callers must keep every
    /// collectible operand reachable (on the stack or temp-rooted) across
    /// this call.
    pub(crate) fn alloc(&mut self, data: HeapData) -> HeapId {
        self.collect_if_needed();
        self.heap.allocate(data)
    }

    /// Interns after collecting if due; same rooting contract as [`alloc`].
    ///
    /// [`alloc`]: Self::alloc
    pub(crate) fn intern(&mut self, content: &str) -> HeapId {
        self.collect_if_needed();
        self.heap.intern(content)
    }

    pub(crate) fn collect_if_needed(&mut self) {
        if self.heap.should_collect() {
            self.collect_garbage();
        }
    }

    /// Stop-the-world mark-and-sweep over every root the VM owns.
    pub(crate) fn collect_garbage(&mut self) {
        for i in 0..self.stack.len() {
            self.heap.mark_value(self.stack[i]);
        }
        for i in 0..self.frames.len() {
            self.heap.mark_object(self.frames[i].closure);
        }
        for i in 0..self.open_upvalues.len() {
            self.heap.mark_object(self.open_upvalues[i]);
        }
        for (&name, &value) in &self.globals {
            self.heap.mark_object(name);
            self.heap.mark_value(value);
        }
        for (&path, &module) in &self.modules {
            self.heap.mark_object(path);
            self.heap.mark_object(module);
        }
        for i in 0..self.loading.len() {
            self.heap.mark_object(self.loading[i]);
        }
        if let Some(module) = self.current_module {
            self.heap.mark_object(module);
        }
        self.heap.mark_object(self.init_string);
        // Registered functions are permanent; their constants (notably
        // string literals) root through here.
        for function in self.functions.iter() {
            if let Some(name) = function.name {
                self.heap.mark_object(name);
            }
            for &constant in &function.chunk.constants {
                self.heap.mark_value(constant);
            }
        }
        self.heap.mark_temp_roots();
        self.heap.trace_references();
        self.heap.sweep();
    }

    // --- frames and errors ------------------------------------------------

    fn cached_frame(&self) -> Cached {
        let index = self.frames.len() - 1;
        let frame = self.frames[index];
        Cached {
            index,
            closure: frame.closure,
            function: frame.function,
            module: frame.module,
            ip: frame.ip,
            slot_base: frame.slot_base,
        }
    }

    fn sync_ip(&mut self, frame: &Cached) {
        self.frames[frame.index].ip = frame.ip;
    }

    /// Builds the traced error for `message` from the live frame stack.
    fn build_runtime_error(&self, message: String) -> RuntimeError {
        let trace = self
            .frames
            .iter()
            .rev()
            .map(|frame| {
                let function = self.functions.get(frame.function);
                TraceFrame {
                    line: function.chunk.line_at(frame.ip.saturating_sub(1)),
                    function: function.name.map(|n| self.heap.str_content(n).to_owned()),
                }
            })
            .collect();
        RuntimeError { message, trace }
    }

    /// Handles an error raised by the dispatch loop.
    ///
    /// Outside test mode every raise becomes a fatal, traced error. In test
    /// mode the message is recorded and the erroring frame is popped, so the
    /// caller resumes as if the call had returned `nil`; the stack is not
    /// reset.
    fn recover(&mut self, err: VmError, floor: usize) -> Result<Unwound, VmError> {
        let message = match err {
            VmError::Fatal(error) => return Err(VmError::Fatal(error)),
            VmError::Raise(message) => message,
        };
        let Some(state) = self.test_state.as_mut() else {
            return Err(VmError::Fatal(Box::new(self.build_runtime_error(message))));
        };
        let recorded = match &state.current_test {
            Some(test) => format!("{test}: {message}"),
            None => message,
        };
        state.failures.push(recorded);

        if self.frames.len() <= floor {
            return Ok(Unwound::Finished(Value::Nil));
        }
        let frame = self.frames[self.frames.len() - 1];
        self.close_upvalues(frame.slot_base);
        self.stack.truncate(frame.slot_base);
        self.frames.pop();
        if self.frames.len() == floor {
            return Ok(Unwound::Finished(Value::Nil));
        }
        self.push(Value::Nil);
        Ok(Unwound::Resume)
    }

    // --- upvalues ---------------------------------------------------------

    /// Returns the open upvalue for `slot`, creating and threading a new one
    /// if no capture exists yet.
    pub(crate) fn capture_upvalue(&mut self, slot: usize) -> HeapId {
        let mut insert_at = self.open_upvalues.len();
        for (i, &upvalue) in self.open_upvalues.iter().enumerate() {
            match *self.heap.upvalue(upvalue) {
                Upvalue::Open(s) if s == slot => return upvalue,
                Upvalue::Open(s) if s < slot => {
                    insert_at = i;
                    break;
                }
                _ => {}
            }
        }
        let created = self.alloc(HeapData::Upvalue(Upvalue::Open(slot)));
        self.open_upvalues.insert(insert_at, created);
        created
    }

    /// Closes every open upvalue at or above `from`: the stack slot's value
    /// moves into the upvalue's own cell. Must run before those slots are
    /// discarded.
    pub(crate) fn close_upvalues(&mut self, from: usize) {
        while let Some(&upvalue) = self.open_upvalues.first() {
            let Upvalue::Open(slot) = *self.heap.upvalue(upvalue) else {
                break;
            };
            if slot < from {
                break;
            }
            let value = self.stack[slot];
            *self.heap.upvalue_mut(upvalue) = Upvalue::Closed(value);
            self.open_upvalues.remove(0);
        }
    }

    /// True iff no open upvalue points at or above `top`; holds after every
    /// return.
    #[cfg(test)]
    pub(crate) fn no_open_upvalue_above(&self, top: usize) -> bool {
        self.open_upvalues
            .iter()
            .all(|&u| !matches!(*self.heap.upvalue(u), Upvalue::Open(slot) if slot >= top))
    }

    /// Number of currently open upvalues; zero whenever no frame is live.
    pub(crate) fn open_upvalue_count(&self) -> usize {
        self.open_upvalues.len()
    }

    // --- dispatch ---------------------------------------------------------

    /// Executes until the frame stack returns to `floor` frames, yielding
    /// the value returned by the frame that closed the run.
    pub(crate) fn run_until(&mut self, floor: usize, writer: &mut dyn PrintWriter) -> RunResult<Value> {
        let mut frame = self.cached_frame();
        loop {
            let byte = fetch_byte!(self, frame);
            let Some(op) = Opcode::from_repr(byte) else {
                return raise(format!("Unknown opcode {byte}."));
            };
            if self.tracer.is_some() {
                let line = self.functions.get(frame.function).chunk.line_at(frame.ip - 1);
                if let Some(tracer) = self.tracer.as_mut() {
                    tracer.on_instruction(frame.ip - 1, op.name(), line);
                }
            }

            match op {
                Opcode::Constant => {
                    let index = fetch_byte!(self, frame) as usize;
                    let value = self.functions.get(frame.function).chunk.constants[index];
                    self.push(value);
                }
                Opcode::ConstantLong => {
                    let a = fetch_byte!(self, frame);
                    let b = fetch_byte!(self, frame);
                    let c = fetch_byte!(self, frame);
                    let index = u32::from_le_bytes([a, b, c, 0]) as usize;
                    let value = self.functions.get(frame.function).chunk.constants[index];
                    self.push(value);
                }
                Opcode::Nil => self.push(Value::Nil),
                Opcode::True => self.push(Value::Bool(true)),
                Opcode::False => self.push(Value::Bool(false)),
                Opcode::Pop => {
                    self.pop();
                }

                Opcode::GetLocal => {
                    let slot = fetch_byte!(self, frame) as usize;
                    self.push(self.stack[frame.slot_base + slot]);
                }
                Opcode::SetLocal => {
                    let slot = fetch_byte!(self, frame) as usize;
                    self.stack[frame.slot_base + slot] = self.peek(0);
                }
                Opcode::GetGlobal => {
                    let name = self.read_name(&mut frame);
                    let resolved = self.global_table(frame.module).get(&name).copied();
                    match resolved {
                        Some(value) => self.push(value),
                        None => {
                            let message = format!("Undefined variable '{}'.", self.heap.str_content(name));
                            vm_try!(self, frame, floor, raise::<(), _>(message));
                        }
                    }
                }
                Opcode::DefineGlobal => {
                    let name = self.read_name(&mut frame);
                    let value = self.peek(0);
                    self.global_table_mut(frame.module).insert(name, value);
                    self.pop();
                }
                Opcode::SetGlobal => {
                    let name = self.read_name(&mut frame);
                    let value = self.peek(0);
                    let table = self.global_table_mut(frame.module);
                    if table.contains_key(&name) {
                        table.insert(name, value);
                    } else {
                        let message = format!("Undefined variable '{}'.", self.heap.str_content(name));
                        vm_try!(self, frame, floor, raise::<(), _>(message));
                    }
                }
                Opcode::GetUpvalue => {
                    let slot = fetch_byte!(self, frame) as usize;
                    let upvalue = self.heap.closure(frame.closure).upvalues[slot];
                    let value = match *self.heap.upvalue(upvalue) {
                        Upvalue::Open(stack_slot) => self.stack[stack_slot],
                        Upvalue::Closed(value) => value,
                    };
                    self.push(value);
                }
                Opcode::SetUpvalue => {
                    let slot = fetch_byte!(self, frame) as usize;
                    let upvalue = self.heap.closure(frame.closure).upvalues[slot];
                    let value = self.peek(0);
                    match self.heap.upvalue_mut(upvalue) {
                        Upvalue::Open(stack_slot) => {
                            let stack_slot = *stack_slot;
                            self.stack[stack_slot] = value;
                        }
                        closed => *closed = Upvalue::Closed(value),
                    }
                }

                Opcode::GetProperty => {
                    let name = self.read_name(&mut frame);
                    vm_try!(self, frame, floor, self.get_property(name));
                }
                Opcode::SetProperty => {
                    let name = self.read_name(&mut frame);
                    vm_try!(self, frame, floor, self.set_property(name));
                }
                Opcode::GetSuper => {
                    let name = self.read_name(&mut frame);
                    vm_try!(self, frame, floor, self.get_super(name));
                }

                Opcode::Equal => {
                    let b = self.pop();
                    let a = self.pop();
                    self.push(Value::Bool(a == b));
                }
                Opcode::Greater => {
                    let (a, b) = vm_try!(self, frame, floor, self.numeric_operands());
                    self.push(Value::Bool(a > b));
                }
                Opcode::Less => {
                    let (a, b) = vm_try!(self, frame, floor, self.numeric_operands());
                    self.push(Value::Bool(a < b));
                }
                Opcode::Add => {
                    let b = self.peek(0);
                    let a = self.peek(1);
                    if let (Value::Number(x), Value::Number(y)) = (a, b) {
                        self.pop();
                        self.pop();
                        self.push(Value::Number(x + y));
                    } else if self.is_string(a) || self.is_string(b) {
                        self.concatenate();
                    } else {
                        vm_try!(
                            self,
                            frame,
                            floor,
                            raise::<(), _>("Operands must be numbers or strings.".to_owned())
                        );
                    }
                }
                Opcode::Subtract => {
                    let (a, b) = vm_try!(self, frame, floor, self.numeric_operands());
                    self.push(Value::Number(a - b));
                }
                Opcode::Multiply => {
                    let (a, b) = vm_try!(self, frame, floor, self.numeric_operands());
                    self.push(Value::Number(a * b));
                }
                Opcode::Divide => {
                    // Division by zero follows IEEE: inf or nan, not an error.
                    let (a, b) = vm_try!(self, frame, floor, self.numeric_operands());
                    self.push(Value::Number(a / b));
                }
                Opcode::Modulo => {
                    let (a, b) = vm_try!(self, frame, floor, self.numeric_operands());
                    self.push(Value::Number(a % b));
                }
                Opcode::Not => {
                    let value = self.pop();
                    self.push(Value::Bool(value.is_falsy()));
                }
                Opcode::Negate => {
                    match self.peek(0) {
                        Value::Number(n) => {
                            self.pop();
                            self.push(Value::Number(-n));
                        }
                        _ => {
                            vm_try!(self, frame, floor, raise::<(), _>("Operand must be a number.".to_owned()));
                        }
                    };
                }

                Opcode::Print => {
                    let value = self.pop();
                    let rendered = display_value(value, &self.heap, &self.functions);
                    writer.write(rendered.into());
                    writer.push_newline();
                }
                Opcode::Jump => {
                    let offset = fetch_u16!(self, frame) as usize;
                    frame.ip += offset;
                }
                Opcode::JumpIfFalse => {
                    let offset = fetch_u16!(self, frame) as usize;
                    if self.peek(0).is_falsy() {
                        frame.ip += offset;
                    }
                }
                Opcode::Loop => {
                    let offset = fetch_u16!(self, frame) as usize;
                    frame.ip -= offset;
                }
                Opcode::Call => {
                    let argc = fetch_byte!(self, frame) as usize;
                    self.sync_ip(&frame);
                    let callee = self.peek(argc);
                    vm_try!(self, frame, floor, self.call_value(callee, argc, writer));
                    frame = self.cached_frame();
                }
                Opcode::Invoke => {
                    let name = self.read_name(&mut frame);
                    let argc = fetch_byte!(self, frame) as usize;
                    self.sync_ip(&frame);
                    vm_try!(self, frame, floor, self.invoke(name, argc, writer));
                    frame = self.cached_frame();
                }
                Opcode::SuperInvoke => {
                    let name = self.read_name(&mut frame);
                    let argc = fetch_byte!(self, frame) as usize;
                    self.sync_ip(&frame);
                    let superclass = self.pop();
                    vm_try!(self, frame, floor, self.super_invoke(superclass, name, argc));
                    frame = self.cached_frame();
                }

                Opcode::Closure => {
                    let index = fetch_byte!(self, frame) as usize;
                    let constant = self.functions.get(frame.function).chunk.constants[index];
                    let Value::Function(function) = constant else {
                        return raise("Closure operand is not a function.".to_owned());
                    };
                    let closure = self.alloc(HeapData::Closure(Closure {
                        function,
                        upvalues: SmallVec::new(),
                        module: frame.module,
                    }));
                    self.push(Value::Ref(closure));
                    let upvalue_count = self.functions.get(function).upvalue_count as usize;
                    for _ in 0..upvalue_count {
                        let is_local = fetch_byte!(self, frame) != 0;
                        let index = fetch_byte!(self, frame) as usize;
                        let upvalue = if is_local {
                            self.capture_upvalue(frame.slot_base + index)
                        } else {
                            self.heap.closure(frame.closure).upvalues[index]
                        };
                        self.heap.closure_mut(closure).upvalues.push(upvalue);
                    }
                }
                Opcode::CloseUpvalue => {
                    self.close_upvalues(self.stack.len() - 1);
                    self.pop();
                }
                Opcode::Return => {
                    let result = self.pop();
                    self.close_upvalues(frame.slot_base);
                    self.frames.pop();
                    if let Some(tracer) = self.tracer.as_mut() {
                        tracer.on_return(self.frames.len());
                    }
                    self.stack.truncate(frame.slot_base);
                    if self.frames.len() == floor {
                        return Ok(result);
                    }
                    self.push(result);
                    frame = self.cached_frame();
                }

                Opcode::Class => {
                    let name = self.read_name(&mut frame);
                    let class = self.alloc(HeapData::Class(crate::heap::Class {
                        name,
                        methods: Table::new(),
                    }));
                    self.push(Value::Ref(class));
                }
                Opcode::Inherit => {
                    vm_try!(self, frame, floor, self.inherit());
                }
                Opcode::Method => {
                    let name = self.read_name(&mut frame);
                    let method = self.peek(0);
                    let Value::Ref(class) = self.peek(1) else {
                        return raise("Method target is not a class.".to_owned());
                    };
                    self.heap.class_mut(class).methods.insert(name, method);
                    self.pop();
                }

                Opcode::BuildList => {
                    let count = fetch_byte!(self, frame) as usize;
                    self.collect_if_needed();
                    let start = self.stack.len() - count;
                    let items = self.stack[start..].to_vec();
                    let list = self.heap.allocate(HeapData::List(items));
                    self.stack.truncate(start);
                    self.push(Value::Ref(list));
                }
                Opcode::BuildMap => {
                    let count = fetch_byte!(self, frame) as usize;
                    self.collect_if_needed();
                    let start = self.stack.len() - count * 2;
                    let mut entries = MapEntries::with_capacity(count);
                    let mut ok = true;
                    for pair in 0..count {
                        let key = self.stack[start + pair * 2];
                        let value = self.stack[start + pair * 2 + 1];
                        if let Value::Ref(id) = key {
                            if matches!(self.heap.get(id), HeapData::Str(_)) {
                                entries.insert(id, value);
                                continue;
                            }
                        }
                        ok = false;
                        break;
                    }
                    if !ok {
                        vm_try!(self, frame, floor, raise::<(), _>("Map keys must be strings.".to_owned()));
                    }
                    let map = self.heap.allocate(HeapData::Map(entries));
                    self.stack.truncate(start);
                    self.push(Value::Ref(map));
                }
                Opcode::Index => {
                    vm_try!(self, frame, floor, self.index_get());
                }
                Opcode::StoreIndex => {
                    vm_try!(self, frame, floor, self.index_store());
                }

                Opcode::Import => {
                    let path = self.read_name(&mut frame);
                    self.sync_ip(&frame);
                    let module = vm_try!(self, frame, floor, self.load_module(path, writer));
                    vm_try!(self, frame, floor, self.import_all(module, frame.module));
                    frame = self.cached_frame();
                }
                Opcode::ImportFrom => {
                    let path = self.read_name(&mut frame);
                    let name = self.read_name(&mut frame);
                    self.sync_ip(&frame);
                    let module = vm_try!(self, frame, floor, self.load_module(path, writer));
                    vm_try!(self, frame, floor, self.import_one(module, name, frame.module));
                    frame = self.cached_frame();
                }
                Opcode::Export => {
                    let name = self.read_name(&mut frame);
                    vm_try!(self, frame, floor, self.export_name(name));
                }
            }
        }
    }

    /// Reads a u8 constant operand that names an interned string.
    fn read_name(&self, frame: &mut Cached) -> HeapId {
        let index = fetch_byte!(self, frame) as usize;
        match self.functions.get(frame.function).chunk.constants[index] {
            Value::Ref(id) => id,
            other => panic!("name operand is not a string constant: {other:?}"),
        }
    }

    /// Globals table a frame resolves names in: its module's namespace, or
    /// the VM globals for top-level script code.
    fn global_table(&self, module: Option<HeapId>) -> &Table {
        match module {
            Some(id) => &self.heap.module(id).globals,
            None => &self.globals,
        }
    }

    fn global_table_mut(&mut self, module: Option<HeapId>) -> &mut Table {
        match module {
            Some(id) => &mut self.heap.module_mut(id).globals,
            None => &mut self.globals,
        }
    }

    fn numeric_operands(&mut self) -> RunResult<(f64, f64)> {
        let b = self.peek(0);
        let a = self.peek(1);
        match (a, b) {
            (Value::Number(a), Value::Number(b)) => {
                self.pop();
                self.pop();
                Ok((a, b))
            }
            _ => raise("Operands must be numbers."),
        }
    }

    pub(crate) fn is_string(&self, value: Value) -> bool {
        matches!(value, Value::Ref(id) if matches!(self.heap.get(id), HeapData::Str(_)))
    }

    /// String concatenation for `+`: both operands are rendered and joined.
    /// Operands stay on the stack until after interning so a collection
    /// cannot free them mid-flight.
    fn concatenate(&mut self) {
        let b = self.peek(0);
        let a = self.peek(1);
        let mut joined = display_value(a, &self.heap, &self.functions);
        joined.push_str(&display_value(b, &self.heap, &self.functions));
        let id = self.intern(&joined);
        self.pop();
        self.pop();
        self.push(Value::Ref(id));
    }

    fn inherit(&mut self) -> RunResult<()> {
        let superclass = self.peek(1);
        let Value::Ref(super_id) = superclass else {
            return raise("Superclass must be a class.");
        };
        if !matches!(self.heap.get(super_id), HeapData::Class(_)) {
            return raise("Superclass must be a class.");
        }
        let Value::Ref(sub_id) = self.peek(0) else {
            return raise("Inherit target is not a class.");
        };
        // Copy-down inheritance: the subclass method table starts as a copy
        // of the superclass's, so later lookup never walks a parent chain.
        let methods: Vec<(HeapId, Value)> = self
            .heap
            .class(super_id)
            .methods
            .iter()
            .map(|(&k, &v)| (k, v))
            .collect();
        self.heap.class_mut(sub_id).methods.extend(methods);
        self.pop();
        Ok(())
    }

    fn index_get(&mut self) -> RunResult<()> {
        let index = self.peek(0);
        let target = self.peek(1);
        let Value::Ref(id) = target else {
            return raise("Can only index lists and maps.");
        };
        let value = match self.heap.get(id) {
            HeapData::List(items) => {
                let slot = list_index(index, items.len())?;
                items[slot]
            }
            HeapData::Map(entries) => {
                let key = map_key(index, &self.heap)?;
                // Missing keys read as nil rather than erroring.
                entries.get(&key).copied().unwrap_or(Value::Nil)
            }
            _ => return raise("Can only index lists and maps."),
        };
        self.pop();
        self.pop();
        self.push(value);
        Ok(())
    }

    fn index_store(&mut self) -> RunResult<()> {
        let value = self.peek(0);
        let index = self.peek(1);
        let target = self.peek(2);
        let Value::Ref(id) = target else {
            return raise("Can only index lists and maps.");
        };
        match self.heap.get(id) {
            HeapData::List(items) => {
                let slot = list_index(index, items.len())?;
                self.heap.list_mut(id)[slot] = value;
            }
            HeapData::Map(_) => {
                let key = map_key(index, &self.heap)?;
                self.heap.map_mut(id).insert(key, value);
            }
            _ => return raise("Can only index lists and maps."),
        }
        self.pop();
        self.pop();
        self.pop();
        self.push(value);
        Ok(())
    }
}

/// Validates a list subscript: a whole number within bounds.
fn list_index(index: Value, len: usize) -> RunResult<usize> {
    let Value::Number(n) = index else {
        return raise("List index must be a number.");
    };
    if n.fract() != 0.0 || n < 0.0 || (n as usize) >= len {
        return raise("List index out of bounds.");
    }
    Ok(n as usize)
}

/// Validates a map subscript: an interned string key.
fn map_key(index: Value, heap: &Heap) -> RunResult<HeapId> {
    if let Value::Ref(id) = index {
        if matches!(heap.get(id), HeapData::Str(_)) {
            return Ok(id);
        }
    }
    raise("Map keys must be strings.")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::CollectStringPrint;

    #[test]
    fn returns_close_every_open_upvalue() {
        let mut vm = Vm::new(false);
        let mut out = CollectStringPrint::new();
        vm.interpret(
            "fun outer() { var x = 1; fun inner() { x = x + 1; return x; } return inner; }
             var f = outer();
             print f();
             print f();",
            &mut out,
        )
        .unwrap();
        assert_eq!(out.output(), "2\n3\n");
        assert!(vm.no_open_upvalue_above(0));
        assert_eq!(vm.open_upvalue_count(), 0);
    }

    #[test]
    fn collection_after_a_run_leaves_marks_clear() {
        let mut vm = Vm::new(true);
        let mut out = CollectStringPrint::new();
        vm.interpret("var keep = [1, 2, 3]; var s = \"x\" + \"y\";", &mut out).unwrap();
        vm.collect_garbage();
        assert!(vm.heap.all_marks_clear());
    }

    #[test]
    fn test_mode_records_instead_of_failing() {
        let mut vm = Vm::new(false);
        let mut out = CollectStringPrint::new();
        vm.interpret(
            "__enterTestMode();
             __setCurrentTest(\"sample\");
             fun t() { assert(false, \"nope\"); }
             t();
             print \"still here\";",
            &mut out,
        )
        .unwrap();
        assert_eq!(out.output(), "still here\n");
        let failures = &vm.test_state.as_ref().unwrap().failures;
        assert_eq!(failures.as_slice(), &["sample: nope".to_owned()]);
    }
}
