//! Object heap and mark-sweep garbage collector
//!
//! The heap owns every [`Obj`] the interpreter ever creates. Ownership
//! is expressed through an intrusive all-objects list threaded through
//! the object headers; values and other objects only ever hold raw
//! pointers, and the collector decides lifetime.
//!
//! Three concerns live here because they all need the object graph:
//!
//! - **Interning.** `make_string` canonicalizes string content so that
//!   equal text is always the same pointer. The intern table is weak:
//!   sweep removes an entry before freeing its string.
//! - **Open upvalues.** A list of upvalues still pointing into the VM
//!   value stack, sorted by decreasing slot address so capture and
//!   close-on-return are O(live upvalues).
//! - **Collection.** Stop-the-world mark-sweep. The heap does not know
//!   what the VM or compiler consider live, so `collect` takes a
//!   closure that marks the caller's roots through a [`Tracer`]; open
//!   upvalues are marked by the heap itself.
//!
//! Any mutator allocation site calls `maybe_collect` with its roots
//! first, so a collection can never observe an object that exists but
//! is not yet reachable from the supplied roots.

use std::ptr;

use ahash::AHashMap;

use crate::object::{Closure, Function, LoxString, Native, NativeFn, Obj, ObjBody, Upvalue};
use crate::stats::HeapStats;
use crate::value::Value;

/// First collection fires once this many bytes are live.
pub const DEFAULT_GC_THRESHOLD: usize = 1024 * 1024;

/// Marks objects gray during the root walk. Handed to the roots closure
/// by [`Heap::collect`].
pub struct Tracer<'a> {
    gray: &'a mut Vec<*mut Obj>,
}

impl Tracer<'_> {
    pub fn mark_value(&mut self, value: Value) {
        if value.is_obj() {
            self.mark_object(value.as_obj());
        }
    }

    pub fn mark_object(&mut self, obj: *mut Obj) {
        if obj.is_null() {
            return;
        }
        unsafe {
            if (*obj).marked {
                return;
            }
            (*obj).marked = true;
        }
        self.gray.push(obj);
    }
}

pub struct Heap {
    /// Head of the intrusive all-objects list.
    objects: *mut Obj,
    /// Weak intern table: content -> the canonical string object.
    strings: AHashMap<String, *mut Obj>,
    /// Head of the open-upvalue list, sorted by decreasing stack slot.
    open_upvalues: *mut Obj,
    bytes_allocated: usize,
    next_gc: usize,
    gray: Vec<*mut Obj>,
    stats: HeapStats,
}

impl Heap {
    pub fn new() -> Heap {
        Heap::with_threshold(DEFAULT_GC_THRESHOLD)
    }

    /// A heap whose first collection fires at `threshold` live bytes.
    /// Tests use small thresholds to force collection pressure.
    pub fn with_threshold(threshold: usize) -> Heap {
        Heap {
            objects: ptr::null_mut(),
            strings: AHashMap::new(),
            open_upvalues: ptr::null_mut(),
            bytes_allocated: 0,
            next_gc: threshold,
            gray: Vec::new(),
            stats: HeapStats::default(),
        }
    }

    pub fn stats(&self) -> HeapStats {
        let mut stats = self.stats;
        stats.bytes_allocated = self.bytes_allocated;
        stats
    }

    pub fn bytes_allocated(&self) -> usize {
        self.bytes_allocated
    }

    /// Number of live objects, by walking the all-objects list.
    pub fn object_count(&self) -> usize {
        let mut count = 0;
        let mut obj = self.objects;
        while !obj.is_null() {
            count += 1;
            obj = unsafe { (*obj).next };
        }
        count
    }

    fn allocate(&mut self, body: ObjBody) -> *mut Obj {
        let obj = Box::into_raw(Box::new(Obj {
            next: self.objects,
            marked: false,
            body,
        }));
        self.objects = obj;
        self.bytes_allocated += unsafe { (*obj).accounted_size() };
        self.stats.objects_allocated += 1;
        obj
    }

    /// Intern `text`, returning the canonical string object.
    pub fn make_string(&mut self, text: &str) -> *mut Obj {
        if let Some(&interned) = self.strings.get(text) {
            return interned;
        }
        let obj = self.allocate(ObjBody::String(LoxString::new(text)));
        self.strings.insert(text.to_string(), obj);
        obj
    }

    /// A blank function; the compiler fills in arity, name, and chunk.
    pub fn make_function(&mut self) -> *mut Obj {
        self.allocate(ObjBody::Function(Function::new()))
    }

    pub fn make_native(&mut self, function: NativeFn) -> *mut Obj {
        self.allocate(ObjBody::Native(Native { function }))
    }

    /// A closure over `function` with room for its upvalues; the VM
    /// fills the vector while consuming the inline descriptors.
    pub fn make_closure(&mut self, function: *mut Obj) -> *mut Obj {
        let count = unsafe { (*function).as_function().upvalue_count };
        self.allocate(ObjBody::Closure(Closure {
            function,
            upvalues: Vec::with_capacity(count),
        }))
    }

    /// Find or create the open upvalue for the stack slot at `location`.
    ///
    /// The open list is sorted by decreasing slot address; every capture
    /// of the same slot shares one upvalue object, which is what makes
    /// captured variables behave as shared cells.
    pub fn capture_upvalue(&mut self, location: *mut Value) -> *mut Obj {
        let mut prev: *mut Obj = ptr::null_mut();
        let mut current = self.open_upvalues;
        unsafe {
            while !current.is_null() && (*current).as_upvalue().location > location {
                prev = current;
                current = (*current).as_upvalue().next_open;
            }
            if !current.is_null() && (*current).as_upvalue().location == location {
                return current;
            }
            let created = self.allocate(ObjBody::Upvalue(Upvalue {
                location,
                closed: Value::NIL,
                next_open: current,
            }));
            if prev.is_null() {
                self.open_upvalues = created;
            } else {
                (*prev).as_upvalue_mut().next_open = created;
            }
            created
        }
    }

    /// Close every open upvalue whose slot is at or above `from`: copy
    /// the stack value into the upvalue and redirect its location to
    /// the internal cell. Closures already holding the upvalue keep
    /// observing the same cell.
    pub fn close_upvalues(&mut self, from: *mut Value) {
        unsafe {
            while !self.open_upvalues.is_null()
                && (*self.open_upvalues).as_upvalue().location >= from
            {
                let upvalue = (*self.open_upvalues).as_upvalue_mut();
                upvalue.closed = *upvalue.location;
                upvalue.location = &mut upvalue.closed;
                self.open_upvalues = upvalue.next_open;
                upvalue.next_open = ptr::null_mut();
            }
        }
    }

    /// Whether live bytes have crossed the collection threshold.
    pub fn should_collect(&self) -> bool {
        self.bytes_allocated > self.next_gc
    }

    /// Collect if the threshold has been crossed. Call this before
    /// allocating, with everything live reachable from `roots`.
    pub fn maybe_collect<F: FnOnce(&mut Tracer)>(&mut self, roots: F) {
        if self.should_collect() {
            self.collect(roots);
        }
    }

    /// Stop-the-world mark-sweep collection. `roots` must mark every
    /// value and object the caller considers live; the heap adds its
    /// own open upvalues. Afterwards every surviving object is unmarked
    /// and the threshold doubles from the surviving byte count.
    pub fn collect<F: FnOnce(&mut Tracer)>(&mut self, roots: F) {
        let mut gray = std::mem::take(&mut self.gray);
        gray.clear();

        {
            let mut tracer = Tracer { gray: &mut gray };
            roots(&mut tracer);
            let mut upvalue = self.open_upvalues;
            while !upvalue.is_null() {
                tracer.mark_object(upvalue);
                upvalue = unsafe { (*upvalue).as_upvalue().next_open };
            }
        }

        while let Some(obj) = gray.pop() {
            let mut tracer = Tracer { gray: &mut gray };
            blacken(obj, &mut tracer);
        }

        self.sweep();
        self.gray = gray;
        self.next_gc = self.bytes_allocated.saturating_mul(2).max(1);
        self.stats.collections += 1;
    }

    fn sweep(&mut self) {
        let mut prev: *mut Obj = ptr::null_mut();
        let mut obj = self.objects;
        while !obj.is_null() {
            unsafe {
                let next = (*obj).next;
                if (*obj).marked {
                    (*obj).marked = false;
                    prev = obj;
                } else {
                    if prev.is_null() {
                        self.objects = next;
                    } else {
                        (*prev).next = next;
                    }
                    self.free(obj);
                }
                obj = next;
            }
        }
    }

    fn free(&mut self, obj: *mut Obj) {
        unsafe {
            self.bytes_allocated = self
                .bytes_allocated
                .saturating_sub((*obj).accounted_size());
            if let ObjBody::String(s) = &(*obj).body {
                self.strings.remove(s.text());
            }
            drop(Box::from_raw(obj));
        }
        self.stats.objects_freed += 1;
    }
}

/// Mark everything `obj` references. Strings and natives have no
/// outgoing references; an open upvalue's `closed` cell is nil, so
/// marking it unconditionally is harmless.
fn blacken(obj: *mut Obj, tracer: &mut Tracer) {
    let obj = unsafe { &*obj };
    match &obj.body {
        ObjBody::String(_) | ObjBody::Native(_) => {}
        ObjBody::Upvalue(upvalue) => tracer.mark_value(upvalue.closed),
        ObjBody::Function(function) => {
            tracer.mark_object(function.name);
            for &constant in function.chunk().constants() {
                tracer.mark_value(constant);
            }
        }
        ObjBody::Closure(closure) => {
            tracer.mark_object(closure.function);
            for &upvalue in &closure.upvalues {
                tracer.mark_object(upvalue);
            }
        }
    }
}

impl Drop for Heap {
    fn drop(&mut self) {
        let mut obj = self.objects;
        while !obj.is_null() {
            unsafe {
                let next = (*obj).next;
                drop(Box::from_raw(obj));
                obj = next;
            }
        }
    }
}

impl Default for Heap {
    fn default() -> Heap {
        Heap::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_interning_canonicalizes_equal_content() {
        let mut heap = Heap::new();
        let a = heap.make_string("hello");
        let b = heap.make_string("hello");
        let c = heap.make_string("world");
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(heap.object_count(), 2);
    }

    #[test]
    fn test_collect_frees_unreachable_objects() {
        let mut heap = Heap::new();
        heap.make_string("garbage");
        heap.make_string("more garbage");
        assert_eq!(heap.object_count(), 2);
        heap.collect(|_| {});
        assert_eq!(heap.object_count(), 0);
        assert_eq!(heap.stats().objects_freed, 2);
    }

    #[test]
    fn test_collect_keeps_roots_and_clears_marks() {
        let mut heap = Heap::new();
        let keep = heap.make_string("keep");
        heap.make_string("drop");
        heap.collect(|tracer| tracer.mark_object(keep));
        assert_eq!(heap.object_count(), 1);
        assert!(unsafe { !(*keep).marked });
        // The survivor is still the interned canonical object.
        assert_eq!(heap.make_string("keep"), keep);
    }

    #[test]
    fn test_intern_table_is_weak() {
        let mut heap = Heap::new();
        heap.make_string("transient");
        heap.collect(|_| {});
        // A fresh object is created; the stale entry must be gone.
        let again = heap.make_string("transient");
        assert_eq!(heap.object_count(), 1);
        heap.collect(|tracer| tracer.mark_object(again));
        assert_eq!(heap.object_count(), 1);
    }

    #[test]
    fn test_function_constants_are_traced() {
        let mut heap = Heap::new();
        let name = heap.make_string("f");
        let constant = heap.make_string("a literal");
        let function = heap.make_function();
        unsafe {
            let f = (*function).as_function_mut();
            f.name = name;
            f.chunk_mut().add_constant(Value::from(constant));
        }
        heap.collect(|tracer| tracer.mark_object(function));
        assert_eq!(heap.object_count(), 3);
    }

    #[test]
    fn test_capture_shares_one_upvalue_per_slot() {
        let mut heap = Heap::new();
        let mut stack = vec![Value::from(1.0), Value::from(2.0)];
        let slot0: *mut Value = &mut stack[0];
        let slot1: *mut Value = &mut stack[1];
        let a = heap.capture_upvalue(slot1);
        let b = heap.capture_upvalue(slot0);
        let again = heap.capture_upvalue(slot1);
        assert_eq!(a, again);
        assert_ne!(a, b);
    }

    #[test]
    fn test_close_upvalues_moves_value_into_cell() {
        let mut heap = Heap::new();
        let mut stack = vec![Value::from(1.0), Value::from(2.0)];
        let slot0: *mut Value = &mut stack[0];
        let slot1: *mut Value = &mut stack[1];
        let low = heap.capture_upvalue(slot0);
        let high = heap.capture_upvalue(slot1);

        // Close everything at or above slot 1.
        heap.close_upvalues(slot1);
        unsafe {
            let closed = (*high).as_upvalue();
            assert_eq!(*closed.location, Value::from(2.0));
            assert!(std::ptr::eq(closed.location, &closed.closed));
            // Slot 0 stays open, still pointing into the stack.
            assert!(std::ptr::eq((*low).as_upvalue().location, slot0));
        }

        // Closed cells survive independent of the stack contents.
        stack[1] = Value::NIL;
        unsafe {
            assert_eq!(*(*high).as_upvalue().location, Value::from(2.0));
        }
    }

    #[test]
    fn test_threshold_triggers_and_doubles() {
        let mut heap = Heap::with_threshold(64);
        let root = heap.make_string("a root string that outlives collection");
        let mut n = 0;
        while !heap.should_collect() {
            heap.make_string(&format!("filler {n}"));
            n += 1;
        }
        heap.maybe_collect(|tracer| tracer.mark_object(root));
        let stats = heap.stats();
        assert_eq!(stats.collections, 1);
        assert!(!heap.should_collect());
        assert_eq!(heap.object_count(), 1);
    }
}
