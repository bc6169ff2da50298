//! Relocation inserter: every control-flow exit of a capturing scope gets
//! exactly one `RelocateUpvalues`, and evaluation order around returns and
//! conditional exits stays sound.

mod common;

use wrenc::ir::{Expr, FnId, IRFn, IRPrinter, Literal, LocalId, Module, ScopeId, Stmt, VarRef};
use wrenc::relocate;
use wrenc::scope::ScopeAnalyzer;
use wrenc::upvalues;

/// A main function with a nested scope declaring captured local `x`, plus
/// a closure that captures it. Returns the module, the main id, the two
/// scope markers, the local, and the closure id.
fn captured_setup() -> (Module, FnId, ScopeId, ScopeId, LocalId, FnId) {
    let (mut module, main_id) = common::main_module();
    let mut closure = IRFn::new("block_fn");
    closure.parent = Some(main_id);
    let closure_id = module.add_fn(closure);

    let mut analyzer = ScopeAnalyzer::new(&mut module);
    let root_scope = analyzer.begin_function(main_id);
    let inner_scope = analyzer.push_scope();
    let local = analyzer.declare_local("x").unwrap();
    analyzer.begin_function(closure_id);
    analyzer.lookup("x", 1);
    analyzer.end_function();
    analyzer.pop_scope();
    analyzer.end_function();

    (module, main_id, root_scope, inner_scope, local, closure_id)
}

fn run_pass(module: &mut Module) {
    let plan = upvalues::plan(module);
    relocate::insert_relocations(module, &plan);
}

fn printed_main(module: &Module, main_id: FnId) -> String {
    IRPrinter::new(module).print_fn(main_id)
}

#[test]
fn fall_through_scope_end_relocates_once() {
    let (mut module, main_id, root, inner, local, closure_id) = captured_setup();
    module.func_mut(main_id).body = Stmt::Block(vec![
        Stmt::BeginUpvalues(root),
        Stmt::Block(vec![
            Stmt::BeginUpvalues(inner),
            Stmt::Assign { var: VarRef::Local(local), value: common::num(1.0) },
            Stmt::EvalAndIgnore(Expr::Closure(closure_id)),
        ]),
        Stmt::Return(Expr::Const(Literal::Null)),
    ]);

    run_pass(&mut module);
    let printed = printed_main(&module, main_id);
    assert_eq!(common::count_occurrences(&printed, "relocate-upvalues [x]"), 1);
    // The relocation sits at the end of the inner block, before the return.
    let relocate_at = printed.find("relocate-upvalues").unwrap();
    let return_at = printed.find("return").unwrap();
    assert!(relocate_at < return_at);
}

#[test]
fn return_inside_scope_evaluates_first_then_relocates() {
    let (mut module, main_id, root, inner, local, closure_id) = captured_setup();
    module.func_mut(main_id).body = Stmt::Block(vec![
        Stmt::BeginUpvalues(root),
        Stmt::Block(vec![
            Stmt::BeginUpvalues(inner),
            Stmt::Assign { var: VarRef::Local(local), value: common::num(1.0) },
            Stmt::Return(Expr::Closure(closure_id)),
        ]),
    ]);

    run_pass(&mut module);
    let printed = printed_main(&module, main_id);
    // Exactly one relocation: the scope-end one is dead after the return
    // and must not be added.
    assert_eq!(common::count_occurrences(&printed, "relocate-upvalues [x]"), 1);
    // The returned closure is built before the relocation sweeps, so it
    // gets rewritten too: the return value moves through a temporary.
    let assign_at = printed.find("assign return-value").unwrap();
    let relocate_at = printed.find("relocate-upvalues").unwrap();
    let return_at = printed.find("return").unwrap();
    assert!(assign_at < relocate_at && relocate_at < return_at);
}

#[test]
fn outward_jump_relocates_the_scopes_it_exits() {
    let (mut module, main_id, root, inner, local, closure_id) = captured_setup();
    let exit_label = module.add_label("after");
    module.func_mut(main_id).body = Stmt::Block(vec![
        Stmt::BeginUpvalues(root),
        Stmt::Block(vec![
            Stmt::BeginUpvalues(inner),
            Stmt::Assign { var: VarRef::Local(local), value: common::num(1.0) },
            Stmt::EvalAndIgnore(Expr::Closure(closure_id)),
            Stmt::Jump { target: exit_label, condition: None, looping: false, jump_on_false: false },
        ]),
        Stmt::Label(exit_label),
        Stmt::Return(Expr::Const(Literal::Null)),
    ]);

    run_pass(&mut module);
    let printed = printed_main(&module, main_id);
    assert_eq!(common::count_occurrences(&printed, "relocate-upvalues [x]"), 1);
    let relocate_at = printed.find("relocate-upvalues").unwrap();
    let jump_at = printed.find("jump after").unwrap();
    assert!(relocate_at < jump_at);
}

#[test]
fn conditional_exit_branches_over_the_relocation() {
    let (mut module, main_id, root, inner, local, closure_id) = captured_setup();
    let exit_label = module.add_label("after");
    module.func_mut(main_id).body = Stmt::Block(vec![
        Stmt::BeginUpvalues(root),
        Stmt::Block(vec![
            Stmt::BeginUpvalues(inner),
            Stmt::Assign { var: VarRef::Local(local), value: common::num(1.0) },
            Stmt::EvalAndIgnore(Expr::Closure(closure_id)),
            Stmt::Jump {
                target: exit_label,
                condition: Some(Expr::Load(VarRef::Local(local))),
                looping: false,
                jump_on_false: false,
            },
            Stmt::Assign { var: VarRef::Local(local), value: common::num(2.0) },
        ]),
        Stmt::Label(exit_label),
        Stmt::Return(Expr::Const(Literal::Null)),
    ]);

    run_pass(&mut module);
    let printed = printed_main(&module, main_id);
    // Taken path: relocate then jump out. Untaken path: skip to the
    // relocate-skip label, scope stays live, and the scope end relocates.
    assert!(printed.contains("jump relocate-skip"));
    assert_eq!(common::count_occurrences(&printed, "relocate-upvalues [x]"), 2);
    assert!(printed.contains("label relocate-skip"));
}

#[test]
fn loop_back_edges_relocate_each_iterations_captures() {
    let (mut module, main_id, root, inner, local, closure_id) = captured_setup();
    let loop_top = module.add_label("loop_top");
    module.func_mut(main_id).body = Stmt::Block(vec![
        Stmt::BeginUpvalues(root),
        Stmt::Label(loop_top),
        Stmt::Block(vec![
            Stmt::BeginUpvalues(inner),
            Stmt::Assign { var: VarRef::Local(local), value: common::num(1.0) },
            Stmt::EvalAndIgnore(Expr::Closure(closure_id)),
            Stmt::Jump { target: loop_top, condition: None, looping: true, jump_on_false: false },
        ]),
        Stmt::Return(Expr::Const(Literal::Null)),
    ]);

    run_pass(&mut module);
    let printed = printed_main(&module, main_id);
    // The back-edge leaves the body scope, so each iteration relocates
    // before jumping; the fall-through path after the block is dead.
    assert_eq!(common::count_occurrences(&printed, "relocate-upvalues [x]"), 1);
    let relocate_at = printed.find("relocate-upvalues").unwrap();
    let jump_at = printed.find("jump loop_top looping").unwrap();
    assert!(relocate_at < jump_at);
}

#[test]
fn scopes_without_captures_insert_nothing() {
    let (mut module, main_id) = common::main_module();
    let mut analyzer = ScopeAnalyzer::new(&mut module);
    let root = analyzer.begin_function(main_id);
    let inner = analyzer.push_scope();
    let local = analyzer.declare_local("plain").unwrap();
    analyzer.pop_scope();
    analyzer.end_function();

    module.func_mut(main_id).body = Stmt::Block(vec![
        Stmt::BeginUpvalues(root),
        Stmt::Block(vec![
            Stmt::BeginUpvalues(inner),
            Stmt::Assign { var: VarRef::Local(local), value: common::num(3.0) },
        ]),
        Stmt::Return(Expr::Const(Literal::Null)),
    ]);

    run_pass(&mut module);
    let printed = printed_main(&module, main_id);
    assert!(!printed.contains("relocate-upvalues"));
}
