//! Compiled functions and their registry.
//!
//! The compiler produces [`Function`]s and registers them permanently; the
//! VM addresses them through [`FunctionId`]. Registered functions (and the
//! constants they carry) are GC roots for the life of the session, which is
//! what keeps compile-time string constants alive.

use crate::{bytecode::Chunk, heap::HeapId};

/// Index into the function registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) struct FunctionId(u32);

impl FunctionId {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

#[derive(Debug)]
pub(crate) struct Function {
    pub arity: u8,
    pub upvalue_count: u8,
    /// Interned name, `None` for the top-level script and lambdas.
    pub name: Option<HeapId>,
    pub chunk: Chunk,
}

/// Permanent registry of compiled functions.
#[derive(Debug, Default)]
pub(crate) struct Functions {
    funcs: Vec<Function>,
}

impl Functions {
    pub fn add(&mut self, function: Function) -> FunctionId {
        let id = FunctionId(self.funcs.len() as u32);
        self.funcs.push(function);
        id
    }

    pub fn get(&self, id: FunctionId) -> &Function {
        &self.funcs[id.index()]
    }

    pub fn iter(&self) -> impl Iterator<Item = &Function> {
        self.funcs.iter()
    }
}
