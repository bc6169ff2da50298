//! Scope analyzer behaviour: frame discipline, upvalue chain
//! construction, and module-global resolution.

mod common;

use wrenc::diagnostics;
use wrenc::ir::{IRFn, Module, VarRef};
use wrenc::scope::ScopeAnalyzer;

#[test]
fn duplicate_in_same_frame_is_an_error_but_shadowing_is_legal() {
    let (mut module, main_id) = common::main_module();
    let mut analyzer = ScopeAnalyzer::new(&mut module);
    analyzer.begin_function(main_id);

    analyzer.declare_local("x").unwrap();
    let _guard = diagnostics::suppress();
    assert!(analyzer.declare_local("x").is_err());

    analyzer.push_scope();
    let shadow = analyzer.declare_local("x").unwrap();
    assert_eq!(analyzer.lookup("x", 1), VarRef::Local(shadow));
    analyzer.pop_scope();

    analyzer.end_function();
}

#[test]
fn lookup_prefers_inner_frames() {
    let (mut module, main_id) = common::main_module();
    let mut analyzer = ScopeAnalyzer::new(&mut module);
    analyzer.begin_function(main_id);

    let outer = analyzer.declare_local("value").unwrap();
    assert_eq!(analyzer.lookup("value", 1), VarRef::Local(outer));

    analyzer.push_scope();
    assert_eq!(analyzer.lookup("value", 2), VarRef::Local(outer));
    analyzer.pop_scope();
    analyzer.end_function();
}

#[test]
fn capture_creates_upvalue_and_back_edge() {
    let (mut module, main_id) = common::main_module();
    let mut closure = IRFn::new("closure");
    closure.parent = Some(main_id);
    let closure_id = module.add_fn(closure);

    let mut analyzer = ScopeAnalyzer::new(&mut module);
    analyzer.begin_function(main_id);
    let local = analyzer.declare_local("captured").unwrap();

    analyzer.begin_function(closure_id);
    let resolved = analyzer.lookup("captured", 3);
    let VarRef::Upvalue(upvalue) = resolved else {
        panic!("expected an upvalue, got {resolved:?}");
    };
    // Resolving again reuses the import.
    assert_eq!(analyzer.lookup("captured", 4), VarRef::Upvalue(upvalue));
    analyzer.end_function();
    analyzer.end_function();

    assert_eq!(module.upvalue(upvalue).parent, VarRef::Local(local));
    assert_eq!(module.upvalue(upvalue).owner, closure_id);
    assert_eq!(module.local(local).upvalues, vec![upvalue]);
    assert_eq!(module.func(closure_id).upvalues, vec![upvalue]);
}

#[test]
fn deep_capture_chains_through_every_intermediate_function() {
    let (mut module, main_id) = common::main_module();
    let mut middle = IRFn::new("middle");
    middle.parent = Some(main_id);
    let middle_id = module.add_fn(middle);
    let mut inner = IRFn::new("inner");
    inner.parent = Some(middle_id);
    let inner_id = module.add_fn(inner);

    let mut analyzer = ScopeAnalyzer::new(&mut module);
    analyzer.begin_function(main_id);
    let local = analyzer.declare_local("shared").unwrap();
    analyzer.begin_function(middle_id);
    analyzer.begin_function(inner_id);

    let VarRef::Upvalue(inner_upvalue) = analyzer.lookup("shared", 5) else {
        panic!("expected an upvalue");
    };
    analyzer.end_function();
    analyzer.end_function();
    analyzer.end_function();

    // The chain flattens through the middle function and terminates at
    // the local in the outermost one.
    assert_eq!(module.func(middle_id).upvalues.len(), 1);
    let middle_upvalue = module.func(middle_id).upvalues[0];
    assert_eq!(module.upvalue(inner_upvalue).parent, VarRef::Upvalue(middle_upvalue));
    assert_eq!(module.upvalue(middle_upvalue).parent, VarRef::Local(local));
    assert_eq!(module.final_target(inner_upvalue), local);
    assert_eq!(module.final_target(middle_upvalue), local);
}

#[test]
fn unknown_names_become_tentative_globals_validated_at_module_end() {
    let mut module = Module::new(None);
    let mut main = IRFn::new("main");
    main.is_main = true;
    let main_id = module.add_fn(main);

    let mut analyzer = ScopeAnalyzer::new(&mut module);
    analyzer.begin_function(main_id);

    let VarRef::Global(global) = analyzer.lookup("Later", 7) else {
        panic!("expected a global");
    };
    assert_eq!(analyzer.module.global(global).undeclared_line_used, Some(7));

    // Declaring it afterwards completes the tentative global.
    let declared = analyzer.declare_module_var("Later", 9).unwrap();
    assert_eq!(declared, global);
    assert_eq!(analyzer.module.global(global).undeclared_line_used, None);
    assert!(analyzer.finish_module().is_empty());
    analyzer.end_function();
}

#[test]
fn lowercase_forward_references_are_rejected() {
    let (mut module, main_id) = common::main_module();
    let mut analyzer = ScopeAnalyzer::new(&mut module);
    analyzer.begin_function(main_id);

    analyzer.lookup("later", 2);
    let _guard = diagnostics::suppress();
    assert!(analyzer.declare_module_var("later", 5).is_err());
    analyzer.end_function();
}

#[test]
fn never_defined_globals_are_reported() {
    let (mut module, main_id) = common::main_module();
    let mut analyzer = ScopeAnalyzer::new(&mut module);
    analyzer.begin_function(main_id);
    analyzer.lookup("Missing", 12);
    analyzer.end_function();

    let errors = analyzer.finish_module();
    assert_eq!(errors.len(), 1);
    assert!(errors[0].message.contains("Missing"));
    assert_eq!(errors[0].line, Some(12));
}

#[test]
fn frames_since_returns_the_scopes_a_break_must_relocate() {
    let (mut module, main_id) = common::main_module();
    let mut analyzer = ScopeAnalyzer::new(&mut module);
    analyzer.begin_function(main_id);

    let loop_depth = analyzer.top_frame();
    let body_scope = analyzer.push_scope();
    let inner_scope = analyzer.push_scope();
    let frames = analyzer.frames_since(loop_depth + 1);
    assert_eq!(frames, vec![inner_scope, body_scope]);

    analyzer.pop_scope();
    analyzer.pop_scope();
    analyzer.end_function();
}
