//! The heap arena and garbage collector.
//!
//! All heap objects live in one slot vector owned by [`Heap`]; references
//! between them are [`HeapId`] indices, never pointers, so objects stay put
//! for their whole lifetime and freed slots are recycled through a free
//! list. Collection is precise stop-the-world mark-and-sweep: the VM marks
//! the roots it owns (stack, frames, globals, module cache), the heap marks
//! its own temp roots and drains the gray stack, and sweep frees exactly the
//! unmarked slots.
//!
//! Strings are interned here: every string creation routes through
//! [`Heap::intern`], so two live strings never share content and equality is
//! identity. The intern table is weak; sweep drops entries whose string
//! died.

use std::{collections::BTreeMap, mem};

use ahash::AHashMap;
use indexmap::IndexMap;
use smallvec::SmallVec;

use crate::{function::FunctionId, natives::NativeMethod, value::Value};

/// Index into the heap arena. Object identity is id equality.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) struct HeapId(u32);

impl HeapId {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

/// Identity-keyed table over interned strings; used for globals, fields,
/// and method tables.
pub(crate) type Table = AHashMap<HeapId, Value>;

/// Entries of a user-visible map; insertion-ordered so `keys()` and
/// `values()` iterate deterministically.
pub(crate) type MapEntries = IndexMap<HeapId, Value>;

/// A function plus its captured upvalues. `module` is set for closures
/// created while a module body runs; their global accesses resolve in that
/// module's namespace.
#[derive(Debug)]
pub(crate) struct Closure {
    pub function: FunctionId,
    pub upvalues: SmallVec<[HeapId; 4]>,
    pub module: Option<HeapId>,
}

/// A captured variable: open while its slot is still on the VM stack,
/// closed (owning the value) after the slot is discarded.
#[derive(Debug)]
pub(crate) enum Upvalue {
    Open(usize),
    Closed(Value),
}

#[derive(Debug)]
pub(crate) struct Class {
    pub name: HeapId,
    /// Method values are always closures. Inheritance copies the
    /// superclass's entries in, so lookup never walks a parent chain.
    pub methods: Table,
}

#[derive(Debug)]
pub(crate) struct Instance {
    pub class: HeapId,
    pub fields: Table,
}

/// A closure bound to the instance it was accessed on.
#[derive(Debug)]
pub(crate) struct BoundMethod {
    pub receiver: Value,
    /// Always a closure.
    pub method: HeapId,
}

/// A primitive-type method bound to its receiver, produced by property
/// access on strings, numbers, lists, and maps.
#[derive(Debug)]
pub(crate) struct BoundNative {
    pub receiver: Value,
    pub method: NativeMethod,
}

#[derive(Debug)]
pub(crate) struct Module {
    pub name: HeapId,
    /// The module's live namespace: preloaded with the native bindings,
    /// then populated by the module body as it executes.
    pub globals: Table,
    pub exports: MapEntries,
}

#[derive(Debug)]
pub(crate) enum HeapData {
    Str(Box<str>),
    Closure(Closure),
    Upvalue(Upvalue),
    Class(Class),
    Instance(Instance),
    BoundMethod(BoundMethod),
    BoundNative(BoundNative),
    List(Vec<Value>),
    Map(MapEntries),
    Module(Module),
}

impl HeapData {
    fn variant_name(&self) -> &'static str {
        match self {
            Self::Str(_) => "Str",
            Self::Closure(_) => "Closure",
            Self::Upvalue(_) => "Upvalue",
            Self::Class(_) => "Class",
            Self::Instance(_) => "Instance",
            Self::BoundMethod(_) => "BoundMethod",
            Self::BoundNative(_) => "BoundNative",
            Self::List(_) => "List",
            Self::Map(_) => "Map",
            Self::Module(_) => "Module",
        }
    }

    /// Rough byte footprint used for collection scheduling. Growth after
    /// allocation is not re-measured; the estimate only has to keep the
    /// next-GC threshold honest, not account exactly.
    fn size_estimate(&self) -> usize {
        let payload = match self {
            Self::Str(s) => s.len(),
            Self::Closure(c) => c.upvalues.len() * mem::size_of::<HeapId>(),
            Self::Upvalue(_) | Self::BoundMethod(_) | Self::BoundNative(_) => 0,
            Self::Class(c) => c.methods.len() * entry_size(),
            Self::Instance(i) => i.fields.len() * entry_size(),
            Self::List(items) => items.capacity() * mem::size_of::<Value>(),
            Self::Map(entries) => entries.len() * entry_size(),
            Self::Module(m) => (m.globals.len() + m.exports.len()) * entry_size(),
        };
        mem::size_of::<Self>() + payload
    }
}

const fn entry_size() -> usize {
    mem::size_of::<HeapId>() + mem::size_of::<Value>()
}

/// Snapshot of heap state, used by the GC tests and diagnostics.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeapStats {
    /// Number of live objects.
    pub live_objects: usize,
    /// Recycled slots available for reuse.
    pub free_slots: usize,
    /// Total arena capacity (live + free).
    pub total_slots: usize,
    /// Live object counts keyed by variant name; `BTreeMap` for
    /// deterministic iteration.
    pub objects_by_type: BTreeMap<&'static str, usize>,
    /// Entries in the string intern table.
    pub interned_strings: usize,
    /// Estimated live bytes.
    pub bytes_allocated: usize,
    /// Collections run so far.
    pub collections: usize,
}

#[derive(Debug)]
struct Slot {
    data: Option<HeapData>,
    marked: bool,
}

/// Collection starts once this many bytes are estimated live.
const FIRST_GC_THRESHOLD: usize = 1024 * 1024;
/// After each collection the threshold doubles from the surviving size.
const GC_GROWTH_FACTOR: usize = 2;

#[derive(Debug)]
pub(crate) struct Heap {
    slots: Vec<Slot>,
    free_list: Vec<HeapId>,
    /// String interner: content to the canonical heap string.
    strings: AHashMap<Box<str>, HeapId>,
    /// Worklist for the mark phase; kept allocated between collections.
    gray: Vec<HeapId>,
    /// LIFO roots protecting transient objects natives and the module
    /// loader hold across allocation points.
    temp_roots: Vec<Value>,
    bytes_allocated: usize,
    next_gc: usize,
    /// Collect at every allocation point; used by the GC test suite.
    stress: bool,
    collections: usize,
}

impl Heap {
    pub fn new(stress: bool) -> Self {
        Self {
            slots: Vec::new(),
            free_list: Vec::new(),
            strings: AHashMap::new(),
            gray: Vec::new(),
            temp_roots: Vec::new(),
            bytes_allocated: 0,
            next_gc: FIRST_GC_THRESHOLD,
            stress,
            collections: 0,
        }
    }

    /// Stores `data` in a fresh or recycled slot. Never collects; the VM
    /// decides when to collect because only it can see all roots.
    pub fn allocate(&mut self, data: HeapData) -> HeapId {
        self.bytes_allocated += data.size_estimate();
        let slot = Slot {
            data: Some(data),
            marked: false,
        };
        if let Some(id) = self.free_list.pop() {
            self.slots[id.index()] = slot;
            id
        } else {
            let id = HeapId(self.slots.len() as u32);
            self.slots.push(slot);
            id
        }
    }

    /// Returns the canonical heap string for `content`, allocating and
    /// interning it on first sight.
    pub fn intern(&mut self, content: &str) -> HeapId {
        if let Some(&id) = self.strings.get(content) {
            return id;
        }
        let id = self.allocate(HeapData::Str(content.into()));
        self.strings.insert(content.into(), id);
        id
    }

    /// True once enough has been allocated that the owner should collect.
    pub fn should_collect(&self) -> bool {
        self.stress || self.bytes_allocated > self.next_gc
    }

    pub fn get(&self, id: HeapId) -> &HeapData {
        match &self.slots[id.index()].data {
            Some(data) => data,
            None => panic!("access to freed heap slot {}", id.index()),
        }
    }

    pub fn get_mut(&mut self, id: HeapId) -> &mut HeapData {
        match &mut self.slots[id.index()].data {
            Some(data) => data,
            None => panic!("access to freed heap slot {}", id.index()),
        }
    }

    pub fn str_content(&self, id: HeapId) -> &str {
        match self.get(id) {
            HeapData::Str(s) => s,
            other => panic!("expected string, found {}", other.variant_name()),
        }
    }

    pub fn closure(&self, id: HeapId) -> &Closure {
        match self.get(id) {
            HeapData::Closure(c) => c,
            other => panic!("expected closure, found {}", other.variant_name()),
        }
    }

    pub fn closure_mut(&mut self, id: HeapId) -> &mut Closure {
        match self.get_mut(id) {
            HeapData::Closure(c) => c,
            other => panic!("expected closure, found {}", other.variant_name()),
        }
    }

    pub fn upvalue(&self, id: HeapId) -> &Upvalue {
        match self.get(id) {
            HeapData::Upvalue(u) => u,
            other => panic!("expected upvalue, found {}", other.variant_name()),
        }
    }

    pub fn upvalue_mut(&mut self, id: HeapId) -> &mut Upvalue {
        match self.get_mut(id) {
            HeapData::Upvalue(u) => u,
            other => panic!("expected upvalue, found {}", other.variant_name()),
        }
    }

    pub fn class(&self, id: HeapId) -> &Class {
        match self.get(id) {
            HeapData::Class(c) => c,
            other => panic!("expected class, found {}", other.variant_name()),
        }
    }

    pub fn class_mut(&mut self, id: HeapId) -> &mut Class {
        match self.get_mut(id) {
            HeapData::Class(c) => c,
            other => panic!("expected class, found {}", other.variant_name()),
        }
    }

    pub fn instance(&self, id: HeapId) -> &Instance {
        match self.get(id) {
            HeapData::Instance(i) => i,
            other => panic!("expected instance, found {}", other.variant_name()),
        }
    }

    pub fn instance_mut(&mut self, id: HeapId) -> &mut Instance {
        match self.get_mut(id) {
            HeapData::Instance(i) => i,
            other => panic!("expected instance, found {}", other.variant_name()),
        }
    }

    pub fn list(&self, id: HeapId) -> &Vec<Value> {
        match self.get(id) {
            HeapData::List(items) => items,
            other => panic!("expected list, found {}", other.variant_name()),
        }
    }

    pub fn list_mut(&mut self, id: HeapId) -> &mut Vec<Value> {
        match self.get_mut(id) {
            HeapData::List(items) => items,
            other => panic!("expected list, found {}", other.variant_name()),
        }
    }

    pub fn map(&self, id: HeapId) -> &MapEntries {
        match self.get(id) {
            HeapData::Map(entries) => entries,
            other => panic!("expected map, found {}", other.variant_name()),
        }
    }

    pub fn map_mut(&mut self, id: HeapId) -> &mut MapEntries {
        match self.get_mut(id) {
            HeapData::Map(entries) => entries,
            other => panic!("expected map, found {}", other.variant_name()),
        }
    }

    pub fn module(&self, id: HeapId) -> &Module {
        match self.get(id) {
            HeapData::Module(m) => m,
            other => panic!("expected module, found {}", other.variant_name()),
        }
    }

    pub fn module_mut(&mut self, id: HeapId) -> &mut Module {
        match self.get_mut(id) {
            HeapData::Module(m) => m,
            other => panic!("expected module, found {}", other.variant_name()),
        }
    }

    // --- temp roots -------------------------------------------------------

    /// Protects `value` from collection until the matching pop. Pushes and
    /// pops must stay LIFO.
    pub fn push_temp_root(&mut self, value: Value) {
        self.temp_roots.push(value);
    }

    pub fn pop_temp_root(&mut self) {
        let popped = self.temp_roots.pop();
        debug_assert!(popped.is_some(), "temp root stack underflow");
    }

    /// Current temp-root depth; pair with [`truncate_temp_roots`] to release
    /// a batch on every exit path.
    ///
    /// [`truncate_temp_roots`]: Self::truncate_temp_roots
    pub fn temp_roots_len(&self) -> usize {
        self.temp_roots.len()
    }

    pub fn truncate_temp_roots(&mut self, len: usize) {
        debug_assert!(len <= self.temp_roots.len(), "temp root stack underflow");
        self.temp_roots.truncate(len);
    }

    // --- collection -------------------------------------------------------

    /// Marks a root value gray.
    pub fn mark_value(&mut self, value: Value) {
        if let Value::Ref(id) = value {
            self.mark_object(id);
        }
    }

    /// Marks a root object gray.
    pub fn mark_object(&mut self, id: HeapId) {
        let slot = &mut self.slots[id.index()];
        if slot.data.is_none() || slot.marked {
            return;
        }
        slot.marked = true;
        self.gray.push(id);
    }

    pub fn mark_temp_roots(&mut self) {
        for i in 0..self.temp_roots.len() {
            let value = self.temp_roots[i];
            self.mark_value(value);
        }
    }

    /// Drains the gray stack, marking every object reachable from the roots
    /// marked so far.
    pub fn trace_references(&mut self) {
        while let Some(id) = self.gray.pop() {
            self.blacken(id);
        }
    }

    /// Marks the outgoing references of one gray object.
    fn blacken(&mut self, id: HeapId) {
        let mut refs: SmallVec<[Value; 16]> = SmallVec::new();
        match self.get(id) {
            HeapData::Str(_) => {}
            HeapData::Closure(closure) => {
                refs.extend(closure.upvalues.iter().map(|&u| Value::Ref(u)));
                if let Some(module) = closure.module {
                    refs.push(Value::Ref(module));
                }
            }
            HeapData::Upvalue(upvalue) => {
                if let Upvalue::Closed(value) = upvalue {
                    refs.push(*value);
                }
            }
            HeapData::Class(class) => {
                refs.push(Value::Ref(class.name));
                for (&name, &method) in &class.methods {
                    refs.push(Value::Ref(name));
                    refs.push(method);
                }
            }
            HeapData::Instance(instance) => {
                refs.push(Value::Ref(instance.class));
                for (&name, &field) in &instance.fields {
                    refs.push(Value::Ref(name));
                    refs.push(field);
                }
            }
            HeapData::BoundMethod(bound) => {
                refs.push(bound.receiver);
                refs.push(Value::Ref(bound.method));
            }
            HeapData::BoundNative(bound) => refs.push(bound.receiver),
            HeapData::List(items) => refs.extend(items.iter().copied()),
            HeapData::Map(entries) => {
                for (&key, &value) in entries {
                    refs.push(Value::Ref(key));
                    refs.push(value);
                }
            }
            HeapData::Module(module) => {
                refs.push(Value::Ref(module.name));
                for (&name, &value) in &module.globals {
                    refs.push(Value::Ref(name));
                    refs.push(value);
                }
                for (&name, &value) in &module.exports {
                    refs.push(Value::Ref(name));
                    refs.push(value);
                }
            }
        }
        for value in refs {
            self.mark_value(value);
        }
    }

    /// Frees every unmarked object, clears marks on the survivors, drops
    /// dead intern entries, and rearms the collection threshold.
    pub fn sweep(&mut self) {
        for (index, slot) in self.slots.iter_mut().enumerate() {
            if slot.data.is_none() {
                continue;
            }
            if slot.marked {
                slot.marked = false;
            } else {
                let data = slot.data.take();
                if let Some(data) = data {
                    self.bytes_allocated = self.bytes_allocated.saturating_sub(data.size_estimate());
                }
                self.free_list.push(HeapId(index as u32));
            }
        }
        let slots = &self.slots;
        self.strings.retain(|_, id| slots[id.index()].data.is_some());
        self.next_gc = (self.bytes_allocated * GC_GROWTH_FACTOR).max(FIRST_GC_THRESHOLD);
        self.collections += 1;
    }

    pub fn stats(&self) -> HeapStats {
        let mut objects_by_type = BTreeMap::new();
        let mut live_objects = 0;
        for slot in &self.slots {
            if let Some(data) = &slot.data {
                live_objects += 1;
                *objects_by_type.entry(data.variant_name()).or_insert(0) += 1;
            }
        }
        HeapStats {
            live_objects,
            free_slots: self.free_list.len(),
            total_slots: self.slots.len(),
            objects_by_type,
            interned_strings: self.strings.len(),
            bytes_allocated: self.bytes_allocated,
            collections: self.collections,
        }
    }

    /// True when no live object is marked; every collection must leave the
    /// heap in this state.
    #[cfg(test)]
    pub fn all_marks_clear(&self) -> bool {
        self.slots.iter().all(|slot| slot.data.is_none() || !slot.marked)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn interning_collapses_equal_content() {
        let mut heap = Heap::new(false);
        let a = heap.intern("hello");
        let b = heap.intern("hello");
        let c = heap.intern("world");
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(heap.str_content(a), "hello");
    }

    #[test]
    fn collect_frees_unreachable_and_clears_marks() {
        let mut heap = Heap::new(false);
        let live = heap.intern("live");
        let _dead = heap.intern("dead");
        let list = heap.allocate(HeapData::List(vec![Value::Ref(live)]));

        heap.mark_object(list);
        heap.mark_temp_roots();
        heap.trace_references();
        heap.sweep();

        assert!(heap.all_marks_clear());
        let stats = heap.stats();
        assert_eq!(stats.live_objects, 2);
        assert_eq!(stats.interned_strings, 1);
        assert_eq!(stats.free_slots, 1);
        // The surviving string is still the canonical intern entry.
        assert_eq!(heap.intern("live"), live);
    }

    #[test]
    fn temp_roots_survive_collection() {
        let mut heap = Heap::new(false);
        let id = heap.intern("transient");
        heap.push_temp_root(Value::Ref(id));

        heap.mark_temp_roots();
        heap.trace_references();
        heap.sweep();
        assert_eq!(heap.stats().live_objects, 1);

        heap.pop_temp_root();
        heap.mark_temp_roots();
        heap.trace_references();
        heap.sweep();
        assert_eq!(heap.stats().live_objects, 0);
        assert_eq!(heap.stats().interned_strings, 0);
    }

    #[test]
    fn freed_slots_are_recycled() {
        let mut heap = Heap::new(false);
        let dead = heap.allocate(HeapData::List(Vec::new()));
        heap.trace_references();
        heap.sweep();
        let recycled = heap.allocate(HeapData::Map(MapEntries::new()));
        assert_eq!(dead, recycled);
    }
}
