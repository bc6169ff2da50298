//! Upvalue planner: pack ordering, empty packs, and the stack-versus-heap
//! classification of captured cells.

mod common;

use wrenc::ir::{IRFn, VarRef};
use wrenc::scope::ScopeAnalyzer;
use wrenc::upvalues;

#[test]
fn pack_indices_follow_insertion_order() {
    let (mut module, main_id) = common::main_module();
    let mut closure = IRFn::new("closure");
    closure.parent = Some(main_id);
    let closure_id = module.add_fn(closure);

    let mut analyzer = ScopeAnalyzer::new(&mut module);
    analyzer.begin_function(main_id);
    analyzer.declare_local("a").unwrap();
    analyzer.declare_local("b").unwrap();
    analyzer.begin_function(closure_id);
    // Capture b first: it must take index 0.
    let VarRef::Upvalue(upvalue_b) = analyzer.lookup("b", 1) else { panic!() };
    let VarRef::Upvalue(upvalue_a) = analyzer.lookup("a", 2) else { panic!() };
    analyzer.end_function();
    analyzer.end_function();

    let plan = upvalues::plan(&module);
    let pack = plan.pack(closure_id).unwrap();
    assert_eq!(pack.variables, vec![upvalue_b, upvalue_a]);
    assert_eq!(pack.index_of(upvalue_b), Some(0));
    assert_eq!(pack.index_of(upvalue_a), Some(1));
}

#[test]
fn capture_free_closures_still_get_a_pack() {
    let (mut module, main_id) = common::main_module();
    let mut closure = IRFn::new("plain");
    closure.parent = Some(main_id);
    let closure_id = module.add_fn(closure);

    let plan = upvalues::plan(&module);
    let pack = plan.pack(closure_id).expect("every closure gets a pack");
    assert!(pack.is_empty());
    assert!(plan.pack(main_id).is_none(), "main is not a closure");
}

#[test]
fn directly_captured_locals_stay_on_the_stack() {
    let (mut module, main_id) = common::main_module();
    let mut closure = IRFn::new("reader");
    closure.parent = Some(main_id);
    let closure_id = module.add_fn(closure);

    let mut analyzer = ScopeAnalyzer::new(&mut module);
    analyzer.begin_function(main_id);
    let local = analyzer.declare_local("x").unwrap();
    analyzer.begin_function(closure_id);
    analyzer.lookup("x", 1);
    analyzer.end_function();
    analyzer.end_function();

    let plan = upvalues::plan(&module);
    assert!(plan.is_stack_closable(&module, local));
    assert!(!plan.is_heap_promoted(local));
}

#[test]
fn transitively_captured_locals_are_heap_promoted() {
    let (mut module, main_id) = common::main_module();
    let mut middle = IRFn::new("middle");
    middle.parent = Some(main_id);
    let middle_id = module.add_fn(middle);
    let mut inner = IRFn::new("inner");
    inner.parent = Some(middle_id);
    let inner_id = module.add_fn(inner);

    let mut analyzer = ScopeAnalyzer::new(&mut module);
    analyzer.begin_function(main_id);
    let shared = analyzer.declare_local("shared").unwrap();
    let direct = analyzer.declare_local("direct").unwrap();
    analyzer.begin_function(middle_id);
    // `direct` is only captured one level deep.
    analyzer.lookup("direct", 1);
    analyzer.begin_function(inner_id);
    // `shared` is reached through the middle closure's pack.
    analyzer.lookup("shared", 2);
    analyzer.end_function();
    analyzer.end_function();
    analyzer.end_function();

    let plan = upvalues::plan(&module);
    assert!(plan.is_heap_promoted(shared));
    assert!(!plan.is_stack_closable(&module, shared));
    assert!(plan.is_stack_closable(&module, direct));

    // Uncaptured locals are neither.
    let plain = module.add_local(main_id, "plain");
    assert!(!plan.is_stack_closable(&module, plain));
    assert!(!plan.is_heap_promoted(plain));
}
