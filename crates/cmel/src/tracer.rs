//! Execution tracing hooks.
//!
//! A [`VmTracer`] observes the dispatch loop without participating in it.
//! There is no tracer by default; [`StderrTracer`] is the debugging
//! implementation the CLI can enable.

/// Observer for VM execution events.
pub trait VmTracer {
    /// Called before each instruction is dispatched.
    fn on_instruction(&mut self, ip: usize, opcode: &'static str, line: u32);

    /// Called when a new call frame is pushed. `function` is `"script"` for
    /// the top-level frame.
    fn on_call(&mut self, function: &str, depth: usize);

    /// Called when a call frame returns.
    fn on_return(&mut self, depth: usize);
}

/// Tracer that logs every event to stderr.
///
/// Output is one line per event, prefixed so it interleaves recognizably with
/// program output when stdout and stderr share a terminal.
#[derive(Debug, Default)]
pub struct StderrTracer;

impl VmTracer for StderrTracer {
    fn on_instruction(&mut self, ip: usize, opcode: &'static str, line: u32) {
        eprintln!("trace: {ip:04} {opcode} (line {line})");
    }

    fn on_call(&mut self, function: &str, depth: usize) {
        eprintln!("trace: {:width$}-> {function}", "", width = depth * 2);
    }

    fn on_return(&mut self, depth: usize) {
        eprintln!("trace: {:width$}<- return", "", width = depth * 2);
    }
}
