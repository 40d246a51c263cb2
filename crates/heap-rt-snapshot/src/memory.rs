//! The memory-usage walker: a read-only pass over the live heap that
//! estimates per-category counts and byte totals.
//!
//! This never mutates heap state — it rides the same `walk_heap`/
//! `CellHandle` contract [`crate::snapshot`] uses, and visits every
//! registered cell exactly once. Strings and shape atoms that are
//! reachable from more than one place are not separately allocated per
//! reference, so their bytes are attributed by fractional share
//! `1/ref_count` rather than counted once per occurrence; every other
//! category counts each cell once at its own self size.

use std::collections::HashMap;
use std::io::{self, Write};
use std::rc::Rc;

use heap_rt_gc::objmodel::{ClassPayload, Function, Object, PropertySlot, Shape, Value};
use heap_rt_gc::{CellKind, Runtime};

/// Count and byte total for one category or one class.
#[derive(Debug, Clone, Copy, Default)]
pub struct CategoryStats {
    /// Number of cells (or, for atoms/strings, distinct references seen)
    /// in this category.
    pub count: usize,
    /// Estimated bytes attributed to this category.
    pub size: usize,
}

impl CategoryStats {
    fn add(&mut self, size: usize) {
        self.count += 1;
        self.size += size;
    }
}

/// A fractional byte accumulator for values whose ownership is shared
/// (atoms, strings): each occurrence contributes `size as f64 /
/// ref_count`, and the running total is only rounded to an integer
/// once every occurrence has been folded in.
#[derive(Debug, Clone, Copy, Default)]
struct FractionalCategory {
    count: usize,
    size: f64,
}

impl FractionalCategory {
    fn add(&mut self, size: usize, ref_count: usize) {
        self.count += 1;
        self.size += size as f64 / ref_count.max(1) as f64;
    }

    fn finish(self) -> CategoryStats {
        CategoryStats {
            count: self.count,
            size: self.size.round() as usize,
        }
    }
}

/// Estimated counts and byte totals across the live heap, broken down
/// per the categories below. A best-effort estimator, not a precise
/// byte-for-byte accounting.
#[derive(Debug, Clone, Default)]
pub struct MemoryUsage {
    /// Bytes the allocator reports as currently in use (from its own
    /// counters, not re-derived by walking).
    pub malloc_size: usize,
    /// Live + tentative cell count, from the registry's own counters.
    pub malloc_count: usize,
    /// Atoms: distinct property-name strings reachable from a live
    /// [`Shape`], attributed fractionally across the shapes that share
    /// them.
    pub atoms: CategoryStats,
    /// Strings: distinct string values reachable from object properties
    /// or function constant pools, attributed fractionally across every
    /// value slot that references them.
    pub strings: CategoryStats,
    /// Object cells (header + shape pointer only — properties and
    /// class payload are broken out below).
    pub objects: CategoryStats,
    /// Shape cells.
    pub shapes: CategoryStats,
    /// Property slots across every live object.
    pub properties: CategoryStats,
    /// Bytecode function cells' structural size: constant-pool and
    /// closure-variable storage, excluding raw opcodes and line tables.
    pub functions: CategoryStats,
    /// Raw opcode bytes across every live function.
    pub function_code: CategoryStats,
    /// Program-counter-to-source-line table bytes across every live
    /// function with attached debug info.
    pub function_line_tables: CategoryStats,
    /// Host-defined ("C function") records.
    pub c_functions: CategoryStats,
    /// Fast-array-backed objects and their element storage.
    pub fast_arrays: CategoryStats,
    /// Array-buffer-backed objects and their raw byte storage.
    pub binary_objects: CategoryStats,
    /// Per-class-id tallies, keyed by the class's registered display
    /// name.
    pub per_class: HashMap<String, CategoryStats>,
}

struct Walker {
    atoms: FractionalCategory,
    strings: FractionalCategory,
    usage: MemoryUsage,
}

fn trace_value_strings(value: &Value, strings: &mut FractionalCategory) {
    if let Value::Str(s) = value {
        let ref_count = Rc::strong_count(s);
        strings.add(s.len(), ref_count);
    }
}

impl Walker {
    fn visit_object(&mut self, obj: &Object, class_name: &str) {
        self.usage.objects.add(std::mem::size_of::<Object>());
        self.usage
            .per_class
            .entry(class_name.to_string())
            .or_default()
            .add(std::mem::size_of::<Object>());

        let slots = obj.slots.borrow();
        self.usage.properties.count += slots.len();
        self.usage.properties.size += slots.len() * std::mem::size_of::<PropertySlot>();
        for slot in slots.iter() {
            if let PropertySlot::Data(v) = slot {
                trace_value_strings(v, &mut self.strings);
            }
        }
        drop(slots);

        match &obj.payload {
            ClassPayload::FastArray(items) => {
                let items = items.borrow();
                self.usage
                    .fast_arrays
                    .add(items.len() * std::mem::size_of::<Value>());
                for v in items.iter() {
                    trace_value_strings(v, &mut self.strings);
                }
            }
            ClassPayload::ArrayBuffer(bytes) => {
                self.usage.binary_objects.add(bytes.borrow().len());
            }
            ClassPayload::NativeFunction(name) => {
                self.usage.c_functions.add(name.len());
            }
            ClassPayload::BoundFunction { bound_args, .. } => {
                for v in bound_args {
                    trace_value_strings(v, &mut self.strings);
                }
            }
            ClassPayload::WeakMap(table) => {
                // Ephemeron bookkeeping is not itself a GC cell; fold
                // its best-effort estimate into the owning object's
                // per-class tally rather than inventing a new category.
                let extra = table.borrow().estimated_bytes();
                self.usage
                    .per_class
                    .entry(class_name.to_string())
                    .or_default()
                    .size += extra;
            }
            ClassPayload::Plain => {}
        }
    }

    fn visit_shape(&mut self, shape: &Shape) {
        self.usage.shapes.add(std::mem::size_of::<Shape>());
        for name in &shape.property_names {
            let ref_count = Rc::strong_count(name);
            self.atoms.add(name.len(), ref_count);
        }
    }

    fn visit_function(&mut self, f: &Function) {
        let structural = std::mem::size_of::<Function>()
            + f.constants.borrow().len() * std::mem::size_of::<Value>()
            + f.captures.len() * std::mem::size_of::<heap_rt_gc::alloc::Gc<heap_rt_gc::objmodel::VarRef>>();
        self.usage.functions.add(structural);
        self.usage.function_code.add(f.code.len());
        self.usage
            .function_line_tables
            .add(f.pc_to_line_bytes());
        for v in f.constants.borrow().iter() {
            trace_value_strings(v, &mut self.strings);
        }
    }
}

/// Walk `runtime`'s current live heap and estimate per-category counts
/// and byte totals. Never mutates heap state: every field read here is
/// shared (`&self`), and no ref count, mark bit, or list membership
/// changes as a result of calling this.
pub fn compute_memory_usage(runtime: &Runtime) -> MemoryUsage {
    let registry_stats = runtime.registry_stats();
    let classes = runtime.classes();

    let mut walker = Walker {
        atoms: FractionalCategory::default(),
        strings: FractionalCategory::default(),
        usage: MemoryUsage {
            malloc_size: registry_stats.bytes_in_use,
            malloc_count: registry_stats.live_count + registry_stats.tentative_count,
            ..MemoryUsage::default()
        },
    };

    heap_rt_gc::walk_heap(runtime.registry(), |handle| match handle.kind() {
        CellKind::Object => {
            let obj = unsafe { &*(handle.payload_ptr() as *const Object) };
            let class_name = classes.name_of(handle.class_id());
            walker.visit_object(obj, class_name);
        }
        CellKind::Shape => {
            let shape = unsafe { &*(handle.payload_ptr() as *const Shape) };
            walker.visit_shape(shape);
        }
        CellKind::Function => {
            let f = unsafe { &*(handle.payload_ptr() as *const Function) };
            walker.visit_function(f);
        }
        // Var-refs, async-function state, and the context itself are
        // structural glue with no category of their own in the table
        // above; their bytes are still counted in `malloc_size` via the
        // registry's own accounting.
        CellKind::VarRef | CellKind::AsyncState | CellKind::Context => {}
    });

    let mut usage = walker.usage;
    usage.atoms = walker.atoms.finish();
    usage.strings = walker.strings.finish();
    usage
}

/// Write a human-readable memory-usage report to `writer`, in the
/// spirit of a host's `--memory` diagnostic dump: one line per
/// category, plus a per-class breakdown.
pub fn dump_memory_usage(mut writer: impl Write, stats: &MemoryUsage, runtime: &Runtime) -> io::Result<()> {
    let _ = runtime;
    writeln!(writer, "Memory usage:")?;
    writeln!(
        writer,
        "{:<24}{:>10} {:>12}",
        "malloc", stats.malloc_count, stats.malloc_size
    )?;
    let rows: [(&str, &CategoryStats); 9] = [
        ("atoms", &stats.atoms),
        ("strings", &stats.strings),
        ("objects", &stats.objects),
        ("shapes", &stats.shapes),
        ("properties", &stats.properties),
        ("functions", &stats.functions),
        ("function code", &stats.function_code),
        ("function line tables", &stats.function_line_tables),
        ("c functions", &stats.c_functions),
    ];
    for (label, row) in rows {
        writeln!(writer, "{label:<24}{:>10} {:>12}", row.count, row.size)?;
    }
    writeln!(
        writer,
        "{:<24}{:>10} {:>12}",
        "fast arrays", stats.fast_arrays.count, stats.fast_arrays.size
    )?;
    writeln!(
        writer,
        "{:<24}{:>10} {:>12}",
        "binary objects", stats.binary_objects.count, stats.binary_objects.size
    )?;

    if !stats.per_class.is_empty() {
        writeln!(writer, "\nPer-class object tallies:")?;
        let mut classes: Vec<_> = stats.per_class.iter().collect();
        classes.sort_by(|a, b| b.1.size.cmp(&a.1.size).then_with(|| a.0.cmp(b.0)));
        for (name, row) in classes {
            writeln!(writer, "{name:<24}{:>10} {:>12}", row.count, row.size)?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use heap_rt_gc::objmodel::{alloc_object, alloc_shape, ClassPayload};
    use heap_rt_gc::Runtime;

    #[test]
    fn empty_heap_reports_zero_categories() {
        let rt = Runtime::new();
        let stats = compute_memory_usage(&rt);
        assert_eq!(stats.functions.count, 0);
        assert_eq!(stats.function_code.count, 0);
    }

    #[test]
    fn objects_and_shapes_are_tallied() {
        let rt = Runtime::new();
        let shape = alloc_shape(rt.registry(), 7, None).unwrap();
        let obj = alloc_object(rt.registry(), 7, shape.clone(), ClassPayload::Plain).unwrap();
        let before = compute_memory_usage(&rt);
        assert!(before.objects.count >= 1);
        assert!(before.shapes.count >= 1);
        drop(obj);
        drop(shape);
    }

    #[test]
    fn dump_memory_usage_writes_every_section() {
        let rt = Runtime::new();
        let stats = compute_memory_usage(&rt);
        let mut buf = Vec::new();
        dump_memory_usage(&mut buf, &stats, &rt).unwrap();
        let text = String::from_utf8(buf).unwrap();
        assert!(text.contains("Memory usage:"));
        assert!(text.contains("malloc"));
    }
}
