//! Module loading and the embedded standard library.
//!
//! A module is a `.cmel` file executed once in its own namespace. The
//! loader canonicalizes the path (appending `.cmel`), consults the
//! permanent cache, reads from the filesystem or the embedded table, and
//! runs the body with the module's globals as the live namespace. Exports
//! are recorded by the `Export` opcode as the body executes; importers copy
//! them out of the module's export table.

use std::fs;

use smallvec::SmallVec;

use crate::{
    bytecode::{Vm, compile},
    error::{RunResult, raise},
    heap::{Closure, HeapData, HeapId, MapEntries, Module},
    io::PrintWriter,
    natives::native_bindings,
    value::Value,
};

/// Baked-in modules, looked up when no file of the same name exists.
static EMBEDDED_MODULES: &[(&str, &str)] = &[
    ("test.cmel", include_str!("../stdlib/test.cmel")),
    ("math.cmel", include_str!("../stdlib/math.cmel")),
];

impl Vm {
    /// Loads (or returns the cached) module for `path`, executing its body
    /// on first load. The body runs synchronously to completion before the
    /// importing code resumes.
    pub(crate) fn load_module(&mut self, path: HeapId, writer: &mut dyn PrintWriter) -> RunResult<HeapId> {
        let logical = self.heap.str_content(path).to_owned();
        let file_name = if logical.ends_with(".cmel") {
            logical.clone()
        } else {
            format!("{logical}.cmel")
        };
        let key = self.intern(&file_name);
        if let Some(&module) = self.modules.get(&key) {
            return Ok(module);
        }
        if self.loading.contains(&key) {
            return raise(format!("Circular import of module '{logical}'."));
        }

        let source = match fs::read_to_string(&file_name) {
            Ok(source) => source,
            Err(_) => match EMBEDDED_MODULES.iter().find(|(name, _)| *name == file_name.as_str()) {
                Some((_, source)) => (*source).to_owned(),
                None => return raise(format!("Could not open module '{logical}'.")),
            },
        };

        let function = match compile(&source, &mut self.heap, &mut self.functions) {
            Ok(function) => function,
            Err(errors) => {
                let mut message = format!("Could not compile module '{logical}'.");
                for error in errors {
                    message.push('\n');
                    message.push_str(&error.to_string());
                }
                return raise(message);
            }
        };

        // The module's globals table is its live namespace from the first
        // instruction; natives are preloaded so the body can call them.
        let globals = native_bindings(&mut self.heap);
        let module = self.alloc(HeapData::Module(Module {
            name: key,
            globals,
            exports: MapEntries::new(),
        }));
        self.heap.push_temp_root(Value::Ref(module));
        let closure = self.alloc(HeapData::Closure(Closure {
            function,
            upvalues: SmallVec::new(),
            module: Some(module),
        }));
        self.heap.pop_temp_root();
        self.push(Value::Ref(closure));

        self.loading.push(key);
        let previous_module = self.current_module.replace(module);
        let floor = self.frames.len();
        let result = self
            .call_closure(closure, 0)
            .and_then(|()| self.run_until(floor, writer));
        self.current_module = previous_module;
        self.loading.pop();

        result?;
        self.modules.insert(key, module);
        Ok(module)
    }

    /// `import "path";` — copies every export into the importer's
    /// namespace.
    pub(crate) fn import_all(&mut self, module: HeapId, target: Option<HeapId>) -> RunResult<()> {
        let exports: Vec<(HeapId, Value)> = self
            .heap
            .module(module)
            .exports
            .iter()
            .map(|(&name, &value)| (name, value))
            .collect();
        match target {
            Some(importer) => self.heap.module_mut(importer).globals.extend(exports),
            None => self.globals.extend(exports),
        }
        Ok(())
    }

    /// `import name from "path";` — copies a single export.
    pub(crate) fn import_one(&mut self, module: HeapId, name: HeapId, target: Option<HeapId>) -> RunResult<()> {
        let value = self.heap.module(module).exports.get(&name).copied();
        let Some(value) = value else {
            let module_name = self.heap.str_content(self.heap.module(module).name);
            let name = self.heap.str_content(name);
            return raise(format!("Module '{module_name}' does not export '{name}'."));
        };
        match target {
            Some(importer) => {
                self.heap.module_mut(importer).globals.insert(name, value);
            }
            None => {
                self.globals.insert(name, value);
            }
        }
        Ok(())
    }

    /// The `Export` opcode: promotes a bound global into the current
    /// module's export table. The value is read from globals by name at
    /// this point, so a mutation between binding and export exports the
    /// newer value.
    pub(crate) fn export_name(&mut self, name: HeapId) -> RunResult<()> {
        let Some(module) = self.current_module else {
            return raise("Can't export outside of a module.");
        };
        let value = self.heap.module(module).globals.get(&name).copied();
        let Some(value) = value else {
            return raise(format!("Undefined variable '{}'.", self.heap.str_content(name)));
        };
        self.heap.module_mut(module).exports.insert(name, value);
        Ok(())
    }
}
