//! The public entry point: a [`Runner`] owns one VM for the life of a
//! session. Running several sources against the same runner shares globals
//! and the module cache, which is what the REPL relies on.

use crate::{
    bytecode::Vm,
    error::CmelError,
    heap::HeapStats,
    io::PrintWriter,
    tracer::VmTracer,
};

pub struct Runner {
    vm: Vm,
}

impl Default for Runner {
    fn default() -> Self {
        Self::new()
    }
}

impl Runner {
    #[must_use]
    pub fn new() -> Self {
        Self { vm: Vm::new(false) }
    }

    /// A runner whose collector runs at every allocation point. Execution
    /// is slow; the GC test suite uses this to surface rooting mistakes
    /// immediately.
    #[must_use]
    pub fn with_gc_stress() -> Self {
        Self { vm: Vm::new(true) }
    }

    /// Compiles and executes `source` as a top-level script, sending
    /// `print` output to `writer`.
    pub fn run(&mut self, source: &str, writer: &mut dyn PrintWriter) -> Result<(), CmelError> {
        self.vm.interpret(source, writer)
    }

    /// Snapshot of heap state: live objects by type, intern count, bytes.
    #[must_use]
    pub fn heap_stats(&self) -> HeapStats {
        self.vm.heap.stats()
    }

    /// Forces a full mark-and-sweep collection.
    pub fn collect_garbage(&mut self) {
        self.vm.collect_garbage();
    }

    /// Number of open upvalues; zero between runs.
    #[must_use]
    pub fn open_upvalue_count(&self) -> usize {
        self.vm.open_upvalue_count()
    }

    /// Messages recorded by test mode, if it is (still) active.
    #[must_use]
    pub fn test_failures(&self) -> Option<&[String]> {
        self.vm.test_state.as_ref().map(|s| s.failures.as_slice())
    }

    /// Installs an execution tracer observing every instruction and call.
    pub fn set_tracer(&mut self, tracer: Box<dyn VmTracer>) {
        self.vm.tracer = Some(tracer);
    }

    pub fn clear_tracer(&mut self) {
        self.vm.tracer = None;
    }
}
