//! A minimal object model exercising every cell kind in the data model.
//!
//! This is deliberately not a real language runtime: there is no parser,
//! no bytecode interpreter, and no hidden-class transition chains (that
//! belongs to the shape system this design explicitly excludes). It
//! exists so the collector, weak-reference invalidation, and the
//! snapshot writer have real cycles, real closures, and a real weak map
//! to operate on in tests.

use std::alloc::Layout;
use std::cell::{Cell, RefCell};
use std::ptr::NonNull;
use std::rc::Rc;

use rustc_hash::FxHashMap;

use crate::alloc::{Allocator, Gc};
use crate::header::{CellKind, GcHeader};
use crate::registry::Registry;
use crate::trace::{GcObject, Tracer};
use crate::weak::{push_weak, WeakBacklink};

/// A dynamically typed value. Not itself heap-allocated — it only ever
/// appears embedded in the payload of some other cell (an object's
/// property slot, a function's constant pool entry, ...).
#[derive(Clone)]
pub enum Value {
    Undefined,
    Null,
    Bool(bool),
    Number(f64),
    Str(Rc<str>),
    Object(Gc<Object>),
    VarRef(Gc<VarRef>),
}

impl Value {
    /// Report this value's outgoing edge, if it has one.
    pub fn trace_into(&self, tracer: &mut Tracer<'_>) {
        match self {
            Value::Object(o) => tracer.edge(o),
            Value::VarRef(v) => tracer.edge(v),
            _ => {}
        }
    }
}

/// A hidden-class-free shape: just a prototype edge and a flat property
/// name table, enough to give `Object` cells a traceable, shareable
/// structure description.
pub struct Shape {
    pub prototype: Option<Gc<Shape>>,
    pub property_names: Vec<Rc<str>>,
}

impl GcObject for Shape {
    fn trace(&self, tracer: &mut Tracer<'_>) {
        tracer.edge_opt(&self.prototype);
    }

    fn self_size(&self) -> usize {
        std::mem::size_of::<Self>() + self.property_names.len() * std::mem::size_of::<Rc<str>>()
    }
}

/// One property slot: a plain value, or an accessor pair.
pub enum PropertySlot {
    Data(Value),
    Accessor {
        get: Option<Gc<Function>>,
        set: Option<Gc<Function>>,
    },
}

impl PropertySlot {
    fn trace_into(&self, tracer: &mut Tracer<'_>) {
        match self {
            PropertySlot::Data(v) => v.trace_into(tracer),
            PropertySlot::Accessor { get, set } => {
                tracer.edge_opt(get);
                tracer.edge_opt(set);
            }
        }
    }
}

/// The class-specific payload carried by an [`Object`] cell, covering
/// the cases the tracer and snapshot walker must special-case.
pub enum ClassPayload {
    Plain,
    FastArray(RefCell<Vec<Value>>),
    /// An array-buffer's raw backing bytes — a leaf for tracing
    /// purposes, but its `byte_length` is what the snapshot writer and
    /// memory walker report as this cell's size.
    ArrayBuffer(RefCell<Vec<u8>>),
    WeakMap(RefCell<EphemeronTable>),
    BoundFunction {
        target: Gc<Function>,
        bound_args: Vec<Value>,
    },
    /// A host-defined ("C function") record: a native callback with no
    /// further GC edges, identified only by its display name.
    NativeFunction(Rc<str>),
}

impl ClassPayload {
    fn trace_into(&self, tracer: &mut Tracer<'_>) {
        match self {
            ClassPayload::Plain => {}
            ClassPayload::FastArray(items) => {
                for v in items.borrow().iter() {
                    v.trace_into(tracer);
                }
            }
            // Leaf payloads: nothing to trace.
            ClassPayload::ArrayBuffer(_) | ClassPayload::NativeFunction(_) => {}
            // A WeakMap's key->value edges are weak by definition and
            // must never be traced — tracing them would keep otherwise
            // dead keys (and the values keyed on them) alive forever.
            ClassPayload::WeakMap(_) => {}
            ClassPayload::BoundFunction { target, bound_args } => {
                tracer.edge(target);
                for v in bound_args {
                    v.trace_into(tracer);
                }
            }
        }
    }

    /// Bytes owned by this payload beyond the enum's own tag, used by
    /// [`Object::self_size`] and by the memory-usage walker's per-payload
    /// breakdown.
    pub fn extra_size(&self) -> usize {
        match self {
            ClassPayload::Plain => 0,
            ClassPayload::FastArray(items) => items.borrow().len() * std::mem::size_of::<Value>(),
            ClassPayload::ArrayBuffer(bytes) => bytes.borrow().len(),
            ClassPayload::WeakMap(table) => table.borrow().estimated_bytes(),
            ClassPayload::BoundFunction { bound_args, .. } => {
                bound_args.len() * std::mem::size_of::<Value>()
            }
            ClassPayload::NativeFunction(name) => name.len(),
        }
    }

    /// Push `value` onto a `FastArray` payload, crediting any growth of
    /// the backing `Vec`'s capacity to `registry`'s allocator so
    /// `should_trigger_gc` sees it — a `Vec`-backed array otherwise
    /// grows entirely outside the allocator's view. The credit tracks
    /// capacity growth, not element count, matching spec.md's allowance
    /// for approximate rather than byte-exact accounting.
    ///
    /// # Panics
    /// If `self` is not a `FastArray` payload.
    pub fn push_array_element(&self, registry: &Registry, value: Value) {
        let ClassPayload::FastArray(items) = self else {
            panic!("push_array_element called on a non-FastArray payload");
        };
        let mut items = items.borrow_mut();
        let cap_before = items.capacity();
        items.push(value);
        let grown = items.capacity() - cap_before;
        if grown > 0 {
            registry
                .allocator()
                .note_external_alloc(grown * std::mem::size_of::<Value>());
        }
    }

    /// Append `bytes` to an `ArrayBuffer` payload, crediting backing-
    /// buffer growth the same way as [`Self::push_array_element`].
    ///
    /// # Panics
    /// If `self` is not an `ArrayBuffer` payload.
    pub fn extend_array_buffer(&self, registry: &Registry, bytes: &[u8]) {
        let ClassPayload::ArrayBuffer(buf) = self else {
            panic!("extend_array_buffer called on a non-ArrayBuffer payload");
        };
        let mut buf = buf.borrow_mut();
        let cap_before = buf.capacity();
        buf.extend_from_slice(bytes);
        let grown = buf.capacity() - cap_before;
        if grown > 0 {
            registry.allocator().note_external_alloc(grown);
        }
    }
}

/// A property-bearing object. Properties are stored behind a `RefCell`
/// because a `Gc<Object>` only ever hands out shared references — like
/// `Rc<T>`, mutation has to go through interior mutability, which is
/// also what lets an object's own property table come to hold a
/// `Gc<Object>` pointing back at itself after construction — the
/// simplest possible collectible cycle, an object whose own slot holds
/// a strong reference to itself.
pub struct Object {
    pub shape: Gc<Shape>,
    pub slots: RefCell<Vec<PropertySlot>>,
    pub payload: ClassPayload,
}

impl Object {
    pub fn push_slot(&self, slot: PropertySlot) {
        self.slots.borrow_mut().push(slot);
    }

    /// The property name for slot `index`: a slot has no name of its
    /// own, only the position it shares with the parallel
    /// `shape.property_names` table.
    pub fn property_name(&self, index: usize) -> Option<Rc<str>> {
        self.shape.property_names.get(index).cloned()
    }

    /// The value of an own "name" string property, if any — the first
    /// rung of the snapshot writer's display-name ladder.
    pub fn own_name_property(&self) -> Option<Rc<str>> {
        let slots = self.slots.borrow();
        for (i, slot) in slots.iter().enumerate() {
            if self.shape.property_names.get(i).map(|n| &**n) == Some("name") {
                if let PropertySlot::Data(Value::Str(s)) = slot {
                    return Some(s.clone());
                }
            }
        }
        None
    }
}

impl GcObject for Object {
    fn trace(&self, tracer: &mut Tracer<'_>) {
        tracer.edge(&self.shape);
        for slot in self.slots.borrow().iter() {
            slot.trace_into(tracer);
        }
        self.payload.trace_into(tracer);
    }

    fn self_size(&self) -> usize {
        std::mem::size_of::<Self>()
            + self.slots.borrow().len() * std::mem::size_of::<PropertySlot>()
            + self.payload.extra_size()
    }
}

/// A captured-variable cell. `Attached` aliases a stack slot and is
/// never itself cycle-eligible (no `Gc` field to trace); `Detached`
/// holds its own value after the enclosing frame has returned, and is
/// cycle-eligible like any other cell. The detached value sits
/// behind a `RefCell` so a closure can still assign to a variable it
/// captured after the frame that declared it is gone.
pub enum VarRef {
    Attached,
    Detached(RefCell<Value>),
}

impl VarRef {
    /// Overwrite a detached cell's value. A no-op on an attached cell —
    /// those alias a live stack slot the interpreter owns directly.
    pub fn set(&self, value: Value) {
        if let VarRef::Detached(cell) = self {
            *cell.borrow_mut() = value;
        }
    }

    pub fn get(&self) -> Option<Value> {
        match self {
            VarRef::Detached(cell) => Some(cell.borrow().clone()),
            VarRef::Attached => None,
        }
    }
}

impl GcObject for VarRef {
    fn trace(&self, tracer: &mut Tracer<'_>) {
        if let VarRef::Detached(v) = self {
            v.borrow().trace_into(tracer);
        }
    }
}

/// A bytecode function: constant pool, captured-variable cells, and an
/// opaque realm identifier. The realm is intentionally not a traced
/// `Gc<Context>` edge and not a weak-invalidated backlink either — it
/// is a plain identifying token a host can use to look the realm back
/// up through its own table, since a function's realm is conventionally
/// guaranteed to outlive the function itself and does not need GC
/// lifecycle tracking of its own.
pub struct Function {
    pub constants: RefCell<Vec<Value>>,
    pub captures: Vec<Gc<VarRef>>,
    pub realm_id: u64,
    /// The function's own "name" property, consulted by the snapshot
    /// writer's display-name ladder ahead of the class-canonical
    /// fallback.
    pub name: Option<Rc<str>>,
    /// Raw opcodes, reported separately from structural size by the
    /// memory-usage walker.
    pub code: Vec<u8>,
    pub debug_info: Option<DebugInfo>,
}

/// Optional debug metadata carried by a [`Function`] cell.
pub struct DebugInfo {
    pub filename: Rc<str>,
    pub source: Option<Rc<str>>,
    /// Program-counter-to-source-line entries, `(pc, line)`.
    pub pc_to_line: Vec<(u32, u32)>,
}

impl Function {
    /// Append a constant after construction — e.g. a template object
    /// that closes back over the function emitting it, forming a
    /// function/object/function cycle.
    pub fn push_constant(&self, value: Value) {
        self.constants.borrow_mut().push(value);
    }

    /// Bytes of the `pc_to_line` table, if debug info is attached —
    /// reported as its own category by the memory-usage walker.
    pub fn pc_to_line_bytes(&self) -> usize {
        self.debug_info
            .as_ref()
            .map(|d| d.pc_to_line.len() * std::mem::size_of::<(u32, u32)>())
            .unwrap_or(0)
    }
}

impl GcObject for Function {
    fn trace(&self, tracer: &mut Tracer<'_>) {
        for v in self.constants.borrow().iter() {
            v.trace_into(tracer);
        }
        tracer.edges(&self.captures);
    }

    fn self_size(&self) -> usize {
        std::mem::size_of::<Self>()
            + self.constants.borrow().len() * std::mem::size_of::<Value>()
            + self.captures.len() * std::mem::size_of::<Gc<VarRef>>()
            + self.code.len()
            + self.pc_to_line_bytes()
    }
}

/// A suspended async-function frame.
pub struct AsyncFunctionState {
    pub frame_slot: Value,
    pub resolve: Value,
    pub reject: Value,
}

impl GcObject for AsyncFunctionState {
    fn trace(&self, tracer: &mut Tracer<'_>) {
        self.frame_slot.trace_into(tracer);
        self.resolve.trace_into(tracer);
        self.reject.trace_into(tracer);
    }
}

/// One loaded module: its exported bindings and its namespace object.
pub struct Module {
    pub exports: Vec<(Rc<str>, Gc<VarRef>)>,
    pub namespace: Gc<Object>,
}

/// An execution realm: the global object, a small fixed prototype
/// table, and the modules loaded into it.
pub struct Context {
    pub global: Gc<Object>,
    pub prototypes: Vec<Gc<Shape>>,
    pub modules: Vec<Module>,
}

impl GcObject for Context {
    fn trace(&self, tracer: &mut Tracer<'_>) {
        tracer.edge(&self.global);
        tracer.edges(&self.prototypes);
        for module in &self.modules {
            for (_, export) in &module.exports {
                tracer.edge(export);
            }
            tracer.edge(&module.namespace);
        }
    }

    fn self_size(&self) -> usize {
        let modules_overhead: usize = self
            .modules
            .iter()
            .map(|m| m.exports.len() * std::mem::size_of::<(Rc<str>, Gc<VarRef>)>())
            .sum();
        std::mem::size_of::<Self>()
            + self.prototypes.len() * std::mem::size_of::<Gc<Shape>>()
            + modules_overhead
    }
}

/// One key/value entry in a [`EphemeronTable`]. Allocated through the
/// owning [`Registry`]'s [`Allocator`] (not a bare `Box`) so the table's
/// growth counts toward `bytes_in_use` like any other cell, and kept
/// alive by the table's map independent of GC — what dies with the key
/// is the *value*, not this bookkeeping record, so there is no
/// self-free step: [`EphemeronTable::sweep`] reclaims dead entries in
/// bulk instead of each one freeing itself mid-invalidation.
struct EphemeronEntry {
    key: Cell<Option<NonNull<GcHeader>>>,
    value: RefCell<Value>,
    next_weak: Cell<Option<NonNull<dyn WeakBacklink>>>,
    /// Captured at construction so [`free_entry`] can deallocate without
    /// needing a `&Registry` threaded back in from the sweep/drop path.
    allocator: NonNull<Allocator>,
}

/// Drop and deallocate an entry allocated by [`EphemeronTable::set`].
///
/// # Safety
/// `entry` must not be read or written again after this call.
unsafe fn free_entry(entry: NonNull<EphemeronEntry>) {
    unsafe {
        let allocator = entry.as_ref().allocator;
        std::ptr::drop_in_place(entry.as_ptr());
        allocator
            .as_ref()
            .raw_dealloc(entry.as_ptr() as *mut u8, Layout::new::<EphemeronEntry>());
    }
}

impl WeakBacklink for EphemeronEntry {
    fn next_weak(&self) -> Option<NonNull<dyn WeakBacklink>> {
        self.next_weak.get()
    }

    fn set_next_weak(&self, next: Option<NonNull<dyn WeakBacklink>>) {
        self.next_weak.set(next);
    }

    unsafe fn unlink_from_owner(&self) {
        // The table's map still indexes this entry by its (now dying)
        // key address; clearing `key` here makes every further lookup
        // treat it as absent without touching `value` yet.
        self.key.set(None);
    }

    unsafe fn release_value_and_free(&self) {
        *self.value.borrow_mut() = Value::Undefined;
    }
}

/// WeakMap/WeakSet-style key/value storage: keys are weak (do not keep
/// the key cell alive), values are strong only while their key is.
#[derive(Default)]
pub struct EphemeronTable {
    entries: FxHashMap<usize, NonNull<EphemeronEntry>>,
}

impl EphemeronTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace the value keyed on `key`, registering a weak
    /// backlink on `key`'s header. Allocates the bookkeeping record
    /// through `registry`'s allocator, so repeated `set` calls are
    /// visible to `should_trigger_gc` the same way any other cell
    /// allocation is.
    pub fn set(
        &mut self,
        registry: &Registry,
        key: &Gc<Object>,
        value: Value,
    ) -> crate::error::GcResult<()> {
        let key_header = unsafe { NonNull::new_unchecked(key.header_ptr() as *mut GcHeader) };
        let addr = key_header.as_ptr() as usize;

        let allocator: NonNull<Allocator> = NonNull::from(registry.allocator());
        let raw = unsafe { registry.allocator().raw_alloc(Layout::new::<EphemeronEntry>())? };
        let entry_ptr = raw.as_ptr() as *mut EphemeronEntry;
        unsafe {
            std::ptr::write(
                entry_ptr,
                EphemeronEntry {
                    key: Cell::new(Some(key_header)),
                    value: RefCell::new(value),
                    next_weak: Cell::new(None),
                    allocator,
                },
            );
        }
        let entry_ptr = unsafe { NonNull::new_unchecked(entry_ptr) };
        let weak_ptr: NonNull<dyn WeakBacklink> = entry_ptr;

        let header = unsafe { key_header.as_ref() };
        let new_head = push_weak(header.weak_head(), weak_ptr);
        header.set_weak_head(new_head);

        if let Some(old) = self.entries.insert(addr, entry_ptr) {
            unsafe { free_entry(old) };
        }
        Ok(())
    }

    /// Look up the value for `key`, or `None` if absent or the key has
    /// already been invalidated.
    pub fn get(&self, key: &Gc<Object>) -> Option<Value> {
        let addr = key.as_ptr() as usize;
        let entry = unsafe { self.entries.get(&addr)?.as_ref() };
        if entry.key.get().is_none() {
            return None;
        }
        Some(entry.value.borrow().clone())
    }

    pub fn has(&self, key: &Gc<Object>) -> bool {
        self.get(key).is_some()
    }

    /// Same as [`Self::has`], but keyed on a raw cell address instead of
    /// a live `Gc<Object>` — for a caller checking whether an entry has
    /// been invalidated after its key has already been dropped.
    pub fn has_addr(&self, addr: usize) -> bool {
        self.entries
            .get(&addr)
            .is_some_and(|entry| unsafe { entry.as_ref() }.key.get().is_some())
    }

    /// Reclaim bookkeeping for every entry whose key has died. Call
    /// periodically (e.g. alongside [`crate::collector::collect_cycles`])
    /// — dead entries otherwise sit harmlessly in the map forever.
    pub fn sweep(&mut self) {
        let dead: Vec<usize> = self
            .entries
            .iter()
            .filter(|(_, entry)| unsafe { entry.as_ref() }.key.get().is_none())
            .map(|(&addr, _)| addr)
            .collect();
        for addr in dead {
            if let Some(entry) = self.entries.remove(&addr) {
                unsafe { free_entry(entry) };
            }
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Best-effort byte estimate for the memory-usage walker and the
    /// snapshot writer's `self_size` computation — never an exact byte
    /// count.
    pub fn estimated_bytes(&self) -> usize {
        self.entries.len() * std::mem::size_of::<EphemeronEntry>()
    }
}

impl Drop for EphemeronTable {
    fn drop(&mut self) {
        for (_, entry) in self.entries.drain() {
            unsafe { free_entry(entry) };
        }
    }
}

/// Allocate a new object cell on `registry`.
pub fn alloc_object(
    registry: &Registry,
    class_id: u32,
    shape: Gc<Shape>,
    payload: ClassPayload,
) -> crate::error::GcResult<Gc<Object>> {
    Gc::new(
        registry,
        CellKind::Object,
        class_id,
        Object {
            shape,
            slots: RefCell::new(Vec::new()),
            payload,
        },
    )
}

/// Allocate a new shape cell on `registry`.
pub fn alloc_shape(
    registry: &Registry,
    class_id: u32,
    prototype: Option<Gc<Shape>>,
) -> crate::error::GcResult<Gc<Shape>> {
    Gc::new(
        registry,
        CellKind::Shape,
        class_id,
        Shape {
            prototype,
            property_names: Vec::new(),
        },
    )
}

/// Allocate a new detached `VarRef` cell on `registry`.
pub fn alloc_var_ref(
    registry: &Registry,
    class_id: u32,
    value: Value,
) -> crate::error::GcResult<Gc<VarRef>> {
    Gc::new(
        registry,
        CellKind::VarRef,
        class_id,
        VarRef::Detached(RefCell::new(value)),
    )
}

/// Allocate a new function cell on `registry`.
pub fn alloc_function(
    registry: &Registry,
    class_id: u32,
    function: Function,
) -> crate::error::GcResult<Gc<Function>> {
    Gc::new(registry, CellKind::Function, class_id, function)
}

/// Allocate a new suspended async-function-state cell on `registry`.
pub fn alloc_async_state(
    registry: &Registry,
    class_id: u32,
    state: AsyncFunctionState,
) -> crate::error::GcResult<Gc<AsyncFunctionState>> {
    Gc::new(registry, CellKind::AsyncState, class_id, state)
}

/// Allocate a new execution-realm cell on `registry`. A host typically
/// allocates exactly one of these per realm and hands it to
/// [`crate::runtime::Runtime::set_root`].
pub fn alloc_context(
    registry: &Registry,
    class_id: u32,
    context: Context,
) -> crate::error::GcResult<Gc<Context>> {
    Gc::new(registry, CellKind::Context, class_id, context)
}
