//! The heap-snapshot writer: traverses every registered cell and
//! serializes a browser-inspector-compatible `.heapsnapshot` JSON
//! document — flat `nodes`/`edges` integer arrays plus an interned
//! string table.
//!
//! This walks the registry's live + tentative lists directly
//! ([`heap_rt_gc::walk_heap`]) rather than recursing from roots: every
//! registered cell gets a node whether or not anything still points at
//! it.

use std::io::Write;
use std::path::{Path, PathBuf};
use std::rc::Rc;

use rustc_hash::FxHashMap;
use serde::Serialize;

use heap_rt_gc::objmodel::{
    AsyncFunctionState, ClassPayload, Context, Function, Object, PropertySlot, Shape, Value, VarRef,
};
use heap_rt_gc::{CellHandle, CellKind, ClassTable, Runtime};

use crate::error::{SnapshotError, SnapshotResult};

/// Node type enumeration, in the exact order the `node_types` meta
/// field declares them.
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum NodeType {
    Hidden = 0,
    Array = 1,
    String = 2,
    Object = 3,
    Code = 4,
    Closure = 5,
    Native = 8,
    Synthetic = 9,
}

const NODE_TYPE_NAMES: [&str; 14] = [
    "hidden",
    "array",
    "string",
    "object",
    "code",
    "closure",
    "regexp",
    "number",
    "native",
    "synthetic",
    "concatenated string",
    "sliced string",
    "symbol",
    "bigint",
];

/// Edge type enumeration, in `edge_types` meta-field order.
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum EdgeType {
    Context = 0,
    Element = 1,
    Property = 2,
    Internal = 3,
    Weak = 6,
}

const EDGE_TYPE_NAMES: [&str; 7] = [
    "context", "element", "property", "internal", "hidden", "shortcut", "weak",
];

/// Either a string property name or a numeric array index, matching
/// the `name_or_index` edge field's dual meaning.
enum EdgeName {
    Atom(Rc<str>),
    Index(usize),
}

impl From<&str> for EdgeName {
    fn from(s: &str) -> Self {
        EdgeName::Atom(Rc::from(s))
    }
}

struct NodeEntry {
    node_type: NodeType,
    name: u32,
    id: u64,
    self_size: u64,
    edges: Vec<EdgeEntry>,
}

struct EdgeEntry {
    edge_type: EdgeType,
    name_or_index: u32,
    to_node: usize,
}

/// A length-prefixed string table shared by node/edge names and
/// string-node contents.
struct StringInterner {
    index: FxHashMap<String, u32>,
    values: Vec<String>,
}

impl StringInterner {
    fn new() -> Self {
        Self {
            index: FxHashMap::default(),
            values: Vec::new(),
        }
    }

    fn intern(&mut self, s: &str) -> u32 {
        if let Some(&i) = self.index.get(s) {
            return i;
        }
        let i = self.values.len() as u32;
        self.values.push(s.to_owned());
        self.index.insert(s.to_owned(), i);
        i
    }
}

/// Accumulates nodes, edges, and strings as the heap is walked. Nodes
/// are keyed by pointer identity so the same cell is never emitted
/// twice, whether reached through the registry walk or as an edge
/// target.
struct DumpContext {
    nodes: Vec<NodeEntry>,
    node_index: FxHashMap<usize, usize>,
    strings: StringInterner,
}

impl DumpContext {
    fn new() -> Self {
        Self {
            nodes: Vec::new(),
            node_index: FxHashMap::default(),
            strings: StringInterner::new(),
        }
    }

    fn ensure_node(
        &mut self,
        key: usize,
        make: impl FnOnce(&mut StringInterner) -> (NodeType, String, u64),
    ) -> usize {
        if let Some(&idx) = self.node_index.get(&key) {
            return idx;
        }
        let (node_type, name, self_size) = make(&mut self.strings);
        let name_idx = self.strings.intern(&name);
        let idx = self.nodes.len();
        self.nodes.push(NodeEntry {
            node_type,
            name: name_idx,
            id: key as u64,
            self_size,
            edges: Vec::new(),
        });
        self.node_index.insert(key, idx);
        idx
    }

    fn add_edge(&mut self, from: usize, edge_type: EdgeType, name: EdgeName, to_node: usize) {
        let name_or_index = match name {
            EdgeName::Atom(s) => self.strings.intern(&s),
            EdgeName::Index(i) => i as u32,
        };
        self.nodes[from].edges.push(EdgeEntry {
            edge_type,
            name_or_index,
            to_node,
        });
    }
}

/// The finished document: flat `nodes`/`edges` integer arrays plus a
/// `strings` table, matching the browser-inspector heap-snapshot
/// format.
#[derive(Serialize)]
pub struct HeapSnapshotDocument {
    snapshot: SnapshotMeta,
    nodes: Vec<u64>,
    edges: Vec<u64>,
    strings: Vec<String>,
}

#[derive(Serialize)]
struct SnapshotMeta {
    meta: MetaBlock,
    node_count: usize,
    edge_count: usize,
}

#[derive(Serialize)]
struct MetaBlock {
    node_fields: [&'static str; 5],
    node_types: (Vec<&'static str>, &'static str, &'static str, &'static str, &'static str),
    edge_fields: [&'static str; 3],
    edge_types: (Vec<&'static str>, &'static str, &'static str),
}

impl HeapSnapshotDocument {
    /// Total node count, `nodes.len() / 5`.
    pub fn node_count(&self) -> usize {
        self.nodes.len() / 5
    }

    /// Total edge count, `edges.len() / 3`.
    pub fn edge_count(&self) -> usize {
        self.edges.len() / 3
    }
}

fn finalize(ctx: DumpContext) -> HeapSnapshotDocument {
    let node_count = ctx.nodes.len();
    let mut nodes = Vec::with_capacity(node_count * 5);
    let mut edges = Vec::new();
    for node in &ctx.nodes {
        nodes.push(node.node_type as u64);
        nodes.push(node.name as u64);
        nodes.push(node.id);
        nodes.push(node.self_size);
        nodes.push(node.edges.len() as u64);
        for edge in &node.edges {
            edges.push(edge.edge_type as u64);
            edges.push(edge.name_or_index as u64);
            // `to_node` is a node-array index scaled by the node-field
            // count, per the inspector format's convention.
            edges.push((edge.to_node * 5) as u64);
        }
    }
    let edge_count = edges.len() / 3;
    HeapSnapshotDocument {
        snapshot: SnapshotMeta {
            meta: MetaBlock {
                node_fields: ["type", "name", "id", "self_size", "edge_count"],
                node_types: (NODE_TYPE_NAMES.to_vec(), "string", "number", "number", "number"),
                edge_fields: ["type", "name_or_index", "to_node"],
                edge_types: (EDGE_TYPE_NAMES.to_vec(), "string", "number"),
            },
            node_count,
            edge_count,
        },
        nodes,
        edges,
        strings: ctx.strings.values,
    }
}

fn object_node_kind(obj: &Object) -> NodeType {
    match &obj.payload {
        ClassPayload::FastArray(_) => NodeType::Array,
        ClassPayload::BoundFunction { .. } => NodeType::Closure,
        ClassPayload::NativeFunction(_) | ClassPayload::ArrayBuffer(_) => NodeType::Native,
        ClassPayload::WeakMap(_) | ClassPayload::Plain => NodeType::Object,
    }
}

/// Display-name resolution: an object's own "name" string property if
/// it has one, else its class's registered name. This object model has
/// no prototype-chain constructor lookup, so the ladder stops there.
fn object_display_name(obj: &Object, classes: &ClassTable, class_id: u32) -> String {
    obj.own_name_property()
        .map(|s| s.to_string())
        .unwrap_or_else(|| classes.name_of(class_id).to_string())
}

/// Resolve the `(type, name, self_size)` triple for any registered
/// cell, dispatching on its [`CellKind`]. Used both for cells reached
/// directly through [`heap_rt_gc::walk_heap`] and for cells first seen
/// as an edge target.
fn describe(handle: CellHandle, classes: &ClassTable) -> (NodeType, String, u64) {
    let size = handle.self_size() as u64;
    match handle.kind() {
        CellKind::Object => {
            let obj = unsafe { &*(handle.payload_ptr() as *const Object) };
            let name = object_display_name(obj, classes, handle.class_id());
            (object_node_kind(obj), name, size)
        }
        CellKind::Shape => (NodeType::Hidden, "Shape".to_string(), size),
        CellKind::Function => {
            let f = unsafe { &*(handle.payload_ptr() as *const Function) };
            let node_type = if f.captures.is_empty() { NodeType::Code } else { NodeType::Closure };
            let name = f.name.as_deref().unwrap_or("").to_string();
            (node_type, name, size)
        }
        CellKind::VarRef => (NodeType::Hidden, "VarRef".to_string(), size),
        CellKind::AsyncState => (NodeType::Hidden, "AsyncFunctionState".to_string(), size),
        CellKind::Context => (NodeType::Object, "global".to_string(), size),
    }
}

fn ensure_node_for(ctx: &mut DumpContext, classes: &ClassTable, handle: CellHandle) -> usize {
    ctx.ensure_node(handle.id(), |_| describe(handle, classes))
}

/// Emit an edge to the node identifying `value`'s referent, if it has
/// one. Primitive values (numbers, booleans, `undefined`/`null`) have
/// no independent identity and are skipped — their bytes are already
/// counted in the owning cell's `self_size`.
fn value_edge(
    ctx: &mut DumpContext,
    classes: &ClassTable,
    from: usize,
    edge_type: EdgeType,
    name: EdgeName,
    value: &Value,
) {
    let to = match value {
        Value::Object(o) => {
            Some(ensure_node_for(ctx, classes, CellHandle::from_header(o.header())))
        }
        Value::VarRef(v) => {
            Some(ensure_node_for(ctx, classes, CellHandle::from_header(v.header())))
        }
        Value::Str(s) => {
            let key = s.as_ptr() as usize;
            Some(ctx.ensure_node(key, |_| (NodeType::String, s.to_string(), s.len() as u64)))
        }
        Value::Undefined | Value::Null | Value::Bool(_) | Value::Number(_) => None,
    };
    if let Some(to) = to {
        ctx.add_edge(from, edge_type, name, to);
    }
}

/// Walk `obj`'s shape, payload, and own properties, emitting every
/// outgoing edge: shape first, then indexed elements or bound-function
/// state (if any), then named properties in slot order.
fn emit_object_edges(ctx: &mut DumpContext, classes: &ClassTable, node: usize, obj: &Object) {
    let shape_idx = ensure_node_for(ctx, classes, CellHandle::from_header(obj.shape.header()));
    ctx.add_edge(node, EdgeType::Internal, "shape".into(), shape_idx);

    match &obj.payload {
        ClassPayload::FastArray(items) => {
            for (i, v) in items.borrow().iter().enumerate() {
                value_edge(ctx, classes, node, EdgeType::Element, EdgeName::Index(i), v);
            }
        }
        ClassPayload::BoundFunction { target, bound_args } => {
            let target_idx = ensure_node_for(ctx, classes, CellHandle::from_header(target.header()));
            ctx.add_edge(node, EdgeType::Internal, "target".into(), target_idx);
            for (i, v) in bound_args.iter().enumerate() {
                value_edge(
                    ctx,
                    classes,
                    node,
                    EdgeType::Internal,
                    EdgeName::Atom(format!("bound_arg[{i}]").into()),
                    v,
                );
            }
        }
        // A weak map's key/value pairs carry no strong edges by
        // definition; its bytes are already folded into self_size via
        // `ClassPayload::extra_size`, and the table exposes no key
        // iteration beyond membership testing, so there is nothing
        // further to emit here.
        ClassPayload::WeakMap(_)
        | ClassPayload::ArrayBuffer(_)
        | ClassPayload::NativeFunction(_)
        | ClassPayload::Plain => {}
    }

    for (i, slot) in obj.slots.borrow().iter().enumerate() {
        let name = match obj.property_name(i) {
            Some(n) => EdgeName::Atom(n),
            None => EdgeName::Index(i),
        };
        match slot {
            PropertySlot::Data(v) => value_edge(ctx, classes, node, EdgeType::Property, name, v),
            PropertySlot::Accessor { get, set } => {
                if let Some(g) = get {
                    let idx = ensure_node_for(ctx, classes, CellHandle::from_header(g.header()));
                    ctx.add_edge(node, EdgeType::Internal, "get".into(), idx);
                }
                if let Some(s) = set {
                    let idx = ensure_node_for(ctx, classes, CellHandle::from_header(s.header()));
                    ctx.add_edge(node, EdgeType::Internal, "set".into(), idx);
                }
            }
        }
    }
}

fn emit_shape_edges(ctx: &mut DumpContext, classes: &ClassTable, node: usize, shape: &Shape) {
    if let Some(proto) = &shape.prototype {
        let idx = ensure_node_for(ctx, classes, CellHandle::from_header(proto.header()));
        ctx.add_edge(node, EdgeType::Internal, "prototype".into(), idx);
    }
}

fn emit_function_edges(ctx: &mut DumpContext, classes: &ClassTable, node: usize, f: &Function) {
    for (i, v) in f.constants.borrow().iter().enumerate() {
        value_edge(
            ctx,
            classes,
            node,
            EdgeType::Internal,
            EdgeName::Atom(format!("const[{i}]").into()),
            v,
        );
    }
    for (i, capture) in f.captures.iter().enumerate() {
        let idx = ensure_node_for(ctx, classes, CellHandle::from_header(capture.header()));
        ctx.add_edge(
            node,
            EdgeType::Context,
            EdgeName::Atom(format!("capture[{i}]").into()),
            idx,
        );
    }
}

fn emit_var_ref_edges(ctx: &mut DumpContext, classes: &ClassTable, node: usize, var_ref: &VarRef) {
    if let Some(value) = var_ref.get() {
        value_edge(ctx, classes, node, EdgeType::Internal, "value".into(), &value);
    }
}

fn emit_async_state_edges(
    ctx: &mut DumpContext,
    classes: &ClassTable,
    node: usize,
    state: &AsyncFunctionState,
) {
    value_edge(ctx, classes, node, EdgeType::Internal, "frame".into(), &state.frame_slot);
    value_edge(ctx, classes, node, EdgeType::Internal, "resolve".into(), &state.resolve);
    value_edge(ctx, classes, node, EdgeType::Internal, "reject".into(), &state.reject);
}

fn emit_context_edges(ctx: &mut DumpContext, classes: &ClassTable, node: usize, context: &Context) {
    let global_idx = ensure_node_for(ctx, classes, CellHandle::from_header(context.global.header()));
    ctx.add_edge(node, EdgeType::Property, "global".into(), global_idx);

    if !context.prototypes.is_empty() {
        // Synthetic grouping node so the fixed per-class prototype
        // table renders as its own array rather than a flat fan-out of
        // same-named edges off the context.
        let group_key = context as *const Context as usize ^ 0x5052_4f54; // "PROT" salt
        let group_idx = ctx.ensure_node(group_key, |_| (NodeType::Synthetic, "Array".to_string(), 0));
        ctx.add_edge(node, EdgeType::Property, "prototypes".into(), group_idx);
        for (i, proto) in context.prototypes.iter().enumerate() {
            let proto_idx = ensure_node_for(ctx, classes, CellHandle::from_header(proto.header()));
            ctx.add_edge(group_idx, EdgeType::Element, EdgeName::Index(i), proto_idx);
        }
    }

    for (m, module) in context.modules.iter().enumerate() {
        for (name, export) in &module.exports {
            let idx = ensure_node_for(ctx, classes, CellHandle::from_header(export.header()));
            ctx.add_edge(node, EdgeType::Context, EdgeName::Atom(name.clone()), idx);
        }
        let ns_idx = ensure_node_for(ctx, classes, CellHandle::from_header(module.namespace.header()));
        ctx.add_edge(
            node,
            EdgeType::Property,
            EdgeName::Atom(format!("module[{m}].namespace").into()),
            ns_idx,
        );
    }
}

/// Build the full snapshot document from a [`Runtime`]'s current live
/// heap. Returns `None` if no root context has been set — there is
/// nothing to anchor node 0 to.
pub fn build_snapshot(runtime: &Runtime) -> Option<HeapSnapshotDocument> {
    let root = runtime.root()?;
    let classes = runtime.classes();
    let mut ctx = DumpContext::new();

    // Node 0 anchors the snapshot: the root context, created first so
    // its index is always 0 regardless of registry iteration order.
    let root_idx = ensure_node_for(&mut ctx, &classes, CellHandle::from_header(root.header()));
    debug_assert_eq!(root_idx, 0, "context must be the first node allocated");

    heap_rt_gc::walk_heap(runtime.registry(), |handle| {
        let node_idx = ensure_node_for(&mut ctx, &classes, handle);
        match handle.kind() {
            CellKind::Object => {
                let obj = unsafe { &*(handle.payload_ptr() as *const Object) };
                emit_object_edges(&mut ctx, &classes, node_idx, obj);
            }
            CellKind::Shape => {
                let shape = unsafe { &*(handle.payload_ptr() as *const Shape) };
                emit_shape_edges(&mut ctx, &classes, node_idx, shape);
            }
            CellKind::Function => {
                let f = unsafe { &*(handle.payload_ptr() as *const Function) };
                emit_function_edges(&mut ctx, &classes, node_idx, f);
            }
            CellKind::VarRef => {
                let v = unsafe { &*(handle.payload_ptr() as *const VarRef) };
                emit_var_ref_edges(&mut ctx, &classes, node_idx, v);
            }
            CellKind::AsyncState => {
                let s = unsafe { &*(handle.payload_ptr() as *const AsyncFunctionState) };
                emit_async_state_edges(&mut ctx, &classes, node_idx, s);
            }
            CellKind::Context => {
                let c = unsafe { &*(handle.payload_ptr() as *const Context) };
                emit_context_edges(&mut ctx, &classes, node_idx, c);
            }
        }
    });

    #[cfg(feature = "gc_logging")]
    tracing::info!(target: "heap::snapshot", nodes = ctx.nodes.len(), "heap snapshot built");

    Some(finalize(ctx))
}

/// Serialize `runtime`'s current heap to `writer` as heap-snapshot
/// JSON. Returns the document alongside writing it, so a caller can
/// inspect node/edge counts without re-parsing its own output.
pub fn write_heap_snapshot(
    runtime: &Runtime,
    mut writer: impl Write,
) -> SnapshotResult<HeapSnapshotDocument> {
    let doc = build_snapshot(runtime).ok_or(SnapshotError::NoRootContext)?;
    serde_json::to_writer(&mut writer, &doc)?;
    writer.flush()?;
    Ok(doc)
}

/// Write `runtime`'s current heap to a timestamped file in `dir`,
/// named `Heap.YYYYMMDD.HHMMSS.mmm.heapsnapshot`. Returns the path
/// written to.
pub fn dump_heap_snapshot(runtime: &Runtime, dir: &Path) -> SnapshotResult<PathBuf> {
    let now = chrono::Local::now();
    let filename = format!("Heap.{}.heapsnapshot", now.format("%Y%m%d.%H%M%S.%3f"));
    let path = dir.join(filename);
    let file = std::fs::File::create(&path)?;
    write_heap_snapshot(runtime, std::io::BufWriter::new(file))?;
    Ok(path)
}

/// Thin convenience wrapper bundling a runtime reference for repeated
/// snapshot writes.
pub struct HeapSnapshotWriter<'a> {
    runtime: &'a Runtime,
}

impl<'a> HeapSnapshotWriter<'a> {
    pub fn new(runtime: &'a Runtime) -> Self {
        Self { runtime }
    }

    pub fn build(&self) -> Option<HeapSnapshotDocument> {
        build_snapshot(self.runtime)
    }

    pub fn dump_to(&self, dir: &Path) -> SnapshotResult<PathBuf> {
        dump_heap_snapshot(self.runtime, dir)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use heap_rt_gc::objmodel::{alloc_context, alloc_object, alloc_shape, Context, PropertySlot};
    use heap_rt_gc::Runtime;

    #[test]
    fn no_root_context_is_reported_as_an_error() {
        let rt = Runtime::new();
        let mut buf = Vec::new();
        let err = write_heap_snapshot(&rt, &mut buf).unwrap_err();
        assert!(matches!(err, SnapshotError::NoRootContext));
    }

    #[test]
    fn chain_of_objects_is_reachable_from_node_zero() {
        let rt = Runtime::new();
        let shape = alloc_shape(rt.registry(), 1, None).unwrap();
        let c = alloc_object(rt.registry(), 2, shape.clone(), ClassPayload::Plain).unwrap();
        let b = alloc_object(rt.registry(), 2, shape.clone(), ClassPayload::Plain).unwrap();
        let a = alloc_object(rt.registry(), 2, shape.clone(), ClassPayload::Plain).unwrap();
        b.push_slot(PropertySlot::Data(Value::Object(c.clone())));
        a.push_slot(PropertySlot::Data(Value::Object(b.clone())));

        let global = alloc_object(rt.registry(), 2, shape, ClassPayload::Plain).unwrap();
        global.push_slot(PropertySlot::Data(Value::Object(a.clone())));

        let context = alloc_context(
            rt.registry(),
            100,
            Context {
                global,
                prototypes: Vec::new(),
                modules: Vec::new(),
            },
        )
        .unwrap();
        rt.set_root(context);

        let doc = build_snapshot(&rt).expect("root context is set");

        // node 0 is the Context; at least context + global + a + b + c.
        assert!(doc.node_count() >= 5);
        assert_eq!(doc.nodes[0], NodeType::Object as u64);

        for edge_chunk in doc.edges.chunks(3) {
            let to_node = edge_chunk[2];
            assert_eq!(to_node % 5, 0, "to_node must be a node-field-scaled index");
            assert!((to_node as usize) < doc.nodes.len(), "to_node must index a real node");
        }

        // Round-trips through serde_json without error.
        let json = serde_json::to_string(&doc).unwrap();
        assert!(json.contains("\"nodes\""));
        assert!(json.contains("\"edges\""));
        assert!(json.contains("\"strings\""));
    }

    #[test]
    fn dump_heap_snapshot_writes_a_parseable_file() {
        let rt = Runtime::new();
        let shape = alloc_shape(rt.registry(), 1, None).unwrap();
        let global = alloc_object(rt.registry(), 2, shape, ClassPayload::Plain).unwrap();
        let context = alloc_context(
            rt.registry(),
            100,
            Context {
                global,
                prototypes: Vec::new(),
                modules: Vec::new(),
            },
        )
        .unwrap();
        rt.set_root(context);

        let dir = std::env::temp_dir();
        let path = dump_heap_snapshot(&rt, &dir).unwrap();
        let contents = std::fs::read_to_string(&path).unwrap();
        let parsed: serde_json::Value = serde_json::from_str(&contents).unwrap();
        assert!(parsed.get("nodes").is_some());
        std::fs::remove_file(&path).ok();
    }
}
