//! Object arena and tracing mark-sweep collector.
//!
//! Objects are addressed by [`ObjRef`] rather than a pointer, so the
//! collector never touches raw memory: sweeping a slot just sets its
//! `Option<Obj>` to `None` and pushes the index onto a free list for reuse.
//! This is the arena redesign of the intrusive `next`-pointer object list —
//! see `DESIGN.md` for why.

use std::collections::HashMap;

use ahash::RandomState;

use crate::object::{Obj, ObjRef};
use crate::table::Table;
use crate::value::Value;

struct Slot {
    generation: u32,
    marked: bool,
    size: usize,
    obj: Option<Obj>,
}

/// Tunables for the collector, set via a builder on `VmOptions` rather than
/// exposed as CLI flags or language features.
#[derive(Clone, Debug)]
pub struct GcOptions {
    /// Bytes allocated before the first collection is considered.
    pub initial_threshold: usize,
    /// Multiplier applied to live bytes after a collection to pick the next
    /// threshold.
    pub growth_factor: usize,
    /// Collect before every single allocation; used by GC-stress tests.
    pub stress: bool,
}

impl Default for GcOptions {
    fn default() -> Self {
        Self { initial_threshold: 1024 * 1024, growth_factor: 2, stress: false }
    }
}

/// Borrowed view of everything the collector must trace from. Built fresh
/// for each collection from split borrows of the VM's fields (`&self.stack`,
/// `&self.globals`, ...) so the VM can pass "its own roots" in without also
/// needing `&mut self.heap` and `&self` to alias.
pub struct RootSet<'a> {
    pub stack: &'a [Value],
    /// One `ObjRef` (a `Closure`) per live call frame.
    pub frame_closures: &'a [ObjRef],
    pub globals: &'a Table,
    pub open_upvalues: &'a [ObjRef],
}

/// Object arena with a generational free list and a tracing mark-sweep
/// collector.
pub struct Heap {
    slots: Vec<Slot>,
    free: Vec<u32>,
    strings: HashMap<Box<str>, ObjRef, RandomState>,
    bytes_allocated: usize,
    next_gc: usize,
    options: GcOptions,
}

impl Default for Heap {
    fn default() -> Self {
        Self::new()
    }
}

impl Heap {
    pub fn new() -> Self {
        Self::with_options(GcOptions::default())
    }

    pub fn with_options(options: GcOptions) -> Self {
        Self {
            slots: Vec::new(),
            free: Vec::new(),
            strings: HashMap::default(),
            bytes_allocated: 0,
            next_gc: options.initial_threshold,
            options,
        }
    }

    pub fn bytes_allocated(&self) -> usize {
        self.bytes_allocated
    }

    pub fn live_object_count(&self) -> usize {
        self.slots.iter().filter(|s| s.obj.is_some()).count()
    }

    fn is_live(&self, r: ObjRef) -> bool {
        self.slots
            .get(r.index() as usize)
            .is_some_and(|s| s.generation == r.generation() && s.obj.is_some())
    }

    pub fn get(&self, r: ObjRef) -> &Obj {
        let slot = &self.slots[r.index() as usize];
        debug_assert_eq!(slot.generation, r.generation(), "dangling ObjRef (stale generation)");
        slot.obj.as_ref().expect("dangling ObjRef (slot freed)")
    }

    pub fn get_mut(&mut self, r: ObjRef) -> &mut Obj {
        let slot = &mut self.slots[r.index() as usize];
        debug_assert_eq!(slot.generation, r.generation(), "dangling ObjRef (stale generation)");
        slot.obj.as_mut().expect("dangling ObjRef (slot freed)")
    }

    /// Allocates `obj` as a new handle. Never triggers a collection itself —
    /// callers that want allocation-triggered GC call [`Heap::maybe_collect`]
    /// around allocation sites that can afford to pass a [`RootSet`].
    pub fn allocate(&mut self, obj: Obj) -> ObjRef {
        let size = Self::approx_size(&obj);
        self.bytes_allocated += size;
        if let Some(idx) = self.free.pop() {
            let slot = &mut self.slots[idx as usize];
            slot.generation = slot.generation.wrapping_add(1);
            slot.marked = false;
            slot.size = size;
            slot.obj = Some(obj);
            ObjRef::new(idx, slot.generation)
        } else {
            let idx = self.slots.len() as u32;
            self.slots.push(Slot { generation: 0, marked: false, size, obj: Some(obj) });
            ObjRef::new(idx, 0)
        }
    }

    fn approx_size(obj: &Obj) -> usize {
        match obj {
            Obj::Str(s) => std::mem::size_of::<Obj>() + s.len(),
            Obj::List(items) => std::mem::size_of::<Obj>() + items.len() * std::mem::size_of::<Value>(),
            _ => std::mem::size_of::<Obj>(),
        }
    }

    /// Interns `s`, returning the same handle for equal content every time a
    /// live interned string with that content exists. A stale map entry
    /// (content whose object was collected) is replaced transparently.
    pub fn intern(&mut self, s: &str) -> ObjRef {
        if let Some(&existing) = self.strings.get(s) {
            if self.is_live(existing) {
                return existing;
            }
        }
        let r = self.allocate(Obj::Str(s.into()));
        self.strings.insert(s.into(), r);
        r
    }

    /// Collects if in stress mode or past the threshold; otherwise a no-op.
    /// Call this at allocation sites that can supply a [`RootSet`] — the VM
    /// calls it between instructions — rather than inside `allocate` itself,
    /// which has no roots to offer. The compiler never calls this: it only
    /// ever allocates objects that are immediately wired into the chunk it's
    /// assembling (a constant, a nested function), so nothing it builds is
    /// ever unreachable from a root for long enough to need pausing.
    pub fn maybe_collect(&mut self, roots: RootSet<'_>) {
        if self.options.stress || self.bytes_allocated > self.next_gc {
            self.collect(roots);
        }
    }

    pub fn collect(&mut self, roots: RootSet<'_>) {
        tracing::debug!(bytes_allocated = self.bytes_allocated, objects = self.slots.len(), "gc: begin collection");
        for slot in &mut self.slots {
            slot.marked = false;
        }

        let mut gray = Vec::new();
        for v in roots.stack {
            if let Some(r) = v.obj_ref() {
                self.mark(r, &mut gray);
            }
        }
        for r in roots.frame_closures {
            self.mark(*r, &mut gray);
        }
        for (k, v) in roots.globals.iter() {
            self.mark(k, &mut gray);
            if let Some(r) = v.obj_ref() {
                self.mark(r, &mut gray);
            }
        }
        for r in roots.open_upvalues {
            self.mark(*r, &mut gray);
        }

        while let Some(r) = gray.pop() {
            let mut children = Vec::new();
            if let Some(obj) = self.slots[r.index() as usize].obj.as_ref() {
                obj.trace_refs(|child| children.push(child));
            }
            for child in children {
                self.mark(child, &mut gray);
            }
        }

        let slots = &self.slots;
        self.strings.retain(|_, r| {
            let slot = &slots[r.index() as usize];
            slot.generation == r.generation() && slot.marked
        });

        let mut freed = 0usize;
        for (idx, slot) in self.slots.iter_mut().enumerate() {
            if slot.obj.is_some() && !slot.marked {
                slot.obj = None;
                self.bytes_allocated -= slot.size;
                slot.size = 0;
                self.free.push(idx as u32);
                freed += 1;
            }
        }

        self.next_gc = self.bytes_allocated.max(self.options.initial_threshold) * self.options.growth_factor;
        tracing::debug!(freed, bytes_allocated = self.bytes_allocated, next_gc = self.next_gc, "gc: end collection");
    }

    fn mark(&mut self, r: ObjRef, gray: &mut Vec<ObjRef>) {
        if let Some(slot) = self.slots.get_mut(r.index() as usize) {
            if slot.generation == r.generation() && slot.obj.is_some() && !slot.marked {
                slot.marked = true;
                gray.push(r);
            }
        }
    }

    /// Falsiness of container values, which `Value::is_falsey` can't answer
    /// on its own since it has no heap access.
    pub fn is_falsey(&self, v: &Value) -> bool {
        if v.is_falsey() {
            return true;
        }
        match v.obj_ref() {
            Some(r) => match self.get(r) {
                Obj::Str(s) => s.is_empty(),
                Obj::List(items) => items.is_empty(),
                Obj::Map(t) => t.is_empty(),
                _ => false,
            },
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn intern_dedups_equal_content() {
        let mut heap = Heap::new();
        let a = heap.intern("hello");
        let b = heap.intern("hello");
        assert_eq!(a, b);
        let c = heap.intern("world");
        assert_ne!(a, c);
    }

    #[test]
    fn collect_reclaims_unreachable_strings() {
        let mut heap = Heap::new();
        let kept = heap.intern("kept");
        let _garbage = heap.allocate(Obj::Str("garbage".into()));
        let stack = [Value::Obj(kept)];
        let roots = RootSet { stack: &stack, frame_closures: &[], globals: &Table::new(), open_upvalues: &[] };
        heap.collect(roots);
        assert!(heap.get(kept).as_str() == Some("kept"));
        assert_eq!(heap.live_object_count(), 1);
    }

    proptest::proptest! {
        /// Interning the same content twice, anywhere in a mixed sequence of
        /// other interns, always yields the same handle — the dedup
        /// guarantee the constant pool leans on for string/literal sharing.
        #[test]
        fn intern_is_stable_under_interleaving(
            needle in "[a-z]{1,8}",
            others in proptest::collection::vec("[a-z]{1,8}", 0..20),
        ) {
            let mut heap = Heap::new();
            let first = heap.intern(&needle);
            for o in &others {
                heap.intern(o);
            }
            let second = heap.intern(&needle);
            proptest::prop_assert_eq!(first, second);
        }

        /// Distinct content never collides onto the same handle.
        #[test]
        fn intern_distinguishes_distinct_content(a in "[a-z]{1,8}", b in "[a-z]{1,8}") {
            proptest::prop_assume!(a != b);
            let mut heap = Heap::new();
            let ra = heap.intern(&a);
            let rb = heap.intern(&b);
            proptest::prop_assert_ne!(ra, rb);
        }
    }
}
