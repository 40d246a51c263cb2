//! End-to-end cycle-collector tests, covering: an acyclic drop, a
//! self-cycle, a closure retaining its own emitter, a survivor pulled
//! back to life mid-scan, weak-map cleanup, and the registry's stats
//! staying consistent across a collection.

use std::cell::RefCell;

use heap_rt_gc::objmodel::{
    alloc_function, alloc_object, alloc_shape, alloc_var_ref, ClassPayload, EphemeronTable,
    Function, PropertySlot, Value,
};
use heap_rt_gc::Runtime;

#[test]
fn acyclic_drop_reaches_zero_live_cells() {
    let rt = Runtime::new();
    let shape = alloc_shape(rt.registry(), 1, None).unwrap();
    let inner = alloc_object(rt.registry(), 2, shape.clone(), ClassPayload::Plain).unwrap();
    let outer = alloc_object(rt.registry(), 2, shape, ClassPayload::Plain).unwrap();
    outer.push_slot(PropertySlot::Data(Value::Object(inner.clone())));

    assert_eq!(rt.registry_stats().live_count, 3); // outer, inner, shape

    drop(inner);
    drop(outer);

    let stats = rt.registry_stats();
    assert_eq!(
        stats.live_count, 0,
        "acyclic graph must free without a GC pass"
    );
    assert_eq!(stats.tentative_count, 0);
}

#[test]
fn self_referencing_object_is_collected_as_a_cycle() {
    let rt = Runtime::new();
    let shape = alloc_shape(rt.registry(), 1, None).unwrap();
    let obj = alloc_object(rt.registry(), 2, shape, ClassPayload::Plain).unwrap();
    // obj now points at itself.
    obj.push_slot(PropertySlot::Data(Value::Object(obj.clone())));

    drop(obj);

    // The external handle is gone but the self-edge keeps refcount at
    // 1 — only cycle collection can free it.
    assert_eq!(rt.registry_stats().tentative_count, 1);

    let stats = rt.collect();
    // obj and its own shape (reachable only through obj) both die.
    assert_eq!(stats.cells_freed, 2);
    assert_eq!(rt.registry_stats().live_count, 0);
    assert_eq!(rt.registry_stats().tentative_count, 0);
}

#[test]
fn two_object_cycle_is_collected() {
    let rt = Runtime::new();
    let shape = alloc_shape(rt.registry(), 1, None).unwrap();
    let a = alloc_object(rt.registry(), 2, shape.clone(), ClassPayload::Plain).unwrap();
    let b = alloc_object(rt.registry(), 2, shape, ClassPayload::Plain).unwrap();
    a.push_slot(PropertySlot::Data(Value::Object(b.clone())));
    b.push_slot(PropertySlot::Data(Value::Object(a.clone())));

    drop(a);
    drop(b);

    assert_eq!(rt.registry_stats().tentative_count, 2);
    let stats = rt.collect();
    // a, b, and their shared shape (reachable only through the cycle).
    assert_eq!(stats.cells_freed, 3);
    assert_eq!(rt.registry_stats().live_count, 0);
}

#[test]
fn closure_retaining_its_own_emitter_is_a_collectible_cycle() {
    // A function's constant pool holds an object, and that object's
    // bound-function payload targets the very function holding it —
    // the classic "closure captures the thing that created it" cycle.
    let rt = Runtime::new();
    let shape = alloc_shape(rt.registry(), 1, None).unwrap();

    let emitter = alloc_function(
        rt.registry(),
        10,
        Function {
            constants: RefCell::new(Vec::new()),
            captures: Vec::new(),
            realm_id: 0,
            name: None,
            code: Vec::new(),
            debug_info: None,
        },
    )
    .unwrap();

    let listener = alloc_object(
        rt.registry(),
        11,
        shape,
        ClassPayload::BoundFunction {
            target: emitter.clone(),
            bound_args: Vec::new(),
        },
    )
    .unwrap();

    // The emitter's constant pool captures the listener that binds
    // back to it, forming a cycle with no external reachability.
    emitter.push_constant(Value::Object(listener.clone()));

    drop(emitter);
    drop(listener);

    assert_eq!(rt.registry_stats().tentative_count, 2);
    let stats = rt.collect();
    assert_eq!(stats.cells_freed, 3); // emitter, listener, listener's shape
    assert_eq!(rt.registry_stats().tentative_count, 0);
}

#[test]
fn externally_reachable_candidate_survives_scan() {
    let rt = Runtime::new();
    let shape = alloc_shape(rt.registry(), 1, None).unwrap();
    let a = alloc_object(rt.registry(), 2, shape.clone(), ClassPayload::Plain).unwrap();
    let b = alloc_object(rt.registry(), 2, shape, ClassPayload::Plain).unwrap();
    a.push_slot(PropertySlot::Data(Value::Object(b.clone())));
    b.push_slot(PropertySlot::Data(Value::Object(a.clone())));

    // Drop `a`'s external handle — the pair becomes a tentative
    // candidate — but keep `b` reachable from the test itself.
    drop(a);
    assert_eq!(rt.registry_stats().tentative_count, 1);

    let stats = rt.collect();
    assert_eq!(stats.cells_freed, 0, "b is still externally reachable");
    assert_eq!(
        rt.registry_stats().live_count,
        3,
        "a, b, and their shared shape all survive, via b"
    );
    assert_eq!(rt.registry_stats().tentative_count, 0);

    drop(b);
    let stats = rt.collect();
    assert_eq!(stats.cells_freed, 3);
}

#[test]
fn weak_map_entry_is_invalidated_when_key_dies() {
    let rt = Runtime::new();
    let shape = alloc_shape(rt.registry(), 1, None).unwrap();
    let map_obj = alloc_object(
        rt.registry(),
        3,
        shape.clone(),
        ClassPayload::WeakMap(RefCell::new(EphemeronTable::new())),
    )
    .unwrap();
    let key = alloc_object(rt.registry(), 2, shape, ClassPayload::Plain).unwrap();
    let key_addr = key.as_ptr() as usize;

    if let ClassPayload::WeakMap(table) = &map_obj.payload {
        table
            .borrow_mut()
            .set(rt.registry(), &key, Value::Number(42.0))
            .unwrap();
        assert!(table.borrow().has(&key));
    }

    drop(key);

    if let ClassPayload::WeakMap(table) = &map_obj.payload {
        assert!(
            !table.borrow().has_addr(key_addr),
            "entry must be unreachable once its key is gone"
        );
        table.borrow_mut().sweep();
        assert_eq!(table.borrow().len(), 0);
    }

    drop(map_obj);
    assert_eq!(rt.registry_stats().live_count, 0);
}

#[test]
fn var_ref_detached_cycle_through_an_object() {
    let rt = Runtime::new();
    let shape = alloc_shape(rt.registry(), 1, None).unwrap();
    let var = alloc_var_ref(rt.registry(), 4, Value::Undefined).unwrap();
    let obj = alloc_object(rt.registry(), 2, shape, ClassPayload::Plain).unwrap();
    obj.push_slot(PropertySlot::Data(Value::VarRef(var.clone())));
    var.set(Value::Object(obj.clone()));

    drop(var);
    drop(obj);

    assert_eq!(rt.registry_stats().tentative_count, 2);
    let stats = rt.collect();
    assert_eq!(stats.cells_freed, 3); // var, obj, obj's shape
}

#[test]
fn collect_on_an_empty_tentative_list_is_a_cheap_no_op() {
    let rt = Runtime::new();
    let stats = rt.collect();
    assert_eq!(stats.candidates_examined, 0);
    assert_eq!(stats.cells_freed, 0);
}

#[test]
fn gc_threshold_sentinel_disables_automatic_triggering() {
    let rt = Runtime::new();
    rt.set_gc_threshold(usize::MAX);
    let shape = alloc_shape(rt.registry(), 1, None).unwrap();

    for _ in 0..64 {
        let obj =
            alloc_object(rt.registry(), 2, shape.clone(), ClassPayload::Plain).unwrap();
        std::mem::forget(obj);
    }

    assert!(!rt.registry().allocator().should_trigger_gc());
}

#[test]
fn memory_limit_rejects_allocation_that_would_cross_it() {
    let rt = Runtime::new();
    let shape = alloc_shape(rt.registry(), 1, None).unwrap();
    rt.set_memory_limit(rt.registry_stats().bytes_in_use);

    match alloc_object(rt.registry(), 2, shape, ClassPayload::Plain) {
        Err(heap_rt_gc::GcError::OutOfMemory { .. }) => {}
        other => panic!("expected OutOfMemory, got {}", other.is_ok()),
    }
}

#[test]
fn fast_array_growth_is_credited_to_the_allocator() {
    let rt = Runtime::new();
    let shape = alloc_shape(rt.registry(), 1, None).unwrap();
    let array = alloc_object(
        rt.registry(),
        2,
        shape,
        ClassPayload::FastArray(RefCell::new(Vec::new())),
    )
    .unwrap();

    let before = rt.registry_stats().bytes_in_use;
    for i in 0..256 {
        array.payload.push_array_element(rt.registry(), Value::Number(i as f64));
    }
    assert!(
        rt.registry_stats().bytes_in_use > before,
        "pushing into a FastArray must grow bytes_in_use"
    );
}
