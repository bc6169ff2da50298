//! Code generation: the emitted LLVM IR carries the expected runtime ABI
//! calls and always passes LLVM verification.

mod common;

use wrenc::ir::{Expr, FieldRef, IRClass, IRFn, Literal, MethodDef, Stmt, VarRef};
use wrenc::scope::ScopeAnalyzer;
use wrenc::signature::Signature;

#[test]
fn main_module_emits_init_and_standalone_entry() {
    let (mut module, main_id) = common::main_module();
    module.func_mut(main_id).body = Stmt::Block(vec![common::ret(common::num(0.0))]);

    let ir = common::lower(&mut module).unwrap();
    assert!(ir.contains("define private void @module_init"));
    assert!(ir.contains("call void @module_init"));
    assert!(ir.contains("wrenStandaloneMainFunc"));
    assert!(ir.contains("signatures_table"));
}

#[test]
fn number_dispatch_goes_through_the_lookup_function() {
    let (mut module, main_id) = common::main_module();
    let sum = common::call(Signature::method("+", 1), common::num(1.0), vec![common::num(2.0)]);
    module.func_mut(main_id).body = Stmt::Block(vec![
        common::eval(common::system_print(sum)),
        common::ret(Expr::Const(Literal::Null)),
    ]);

    let ir = common::lower(&mut module).unwrap();
    assert!(ir.contains("wren_virtual_method_lookup"));
    assert!(ir.contains("wren_get_core_class_value"));
    assert!(ir.contains("wren_sys_var_System"));
    // Both canonical strings land in the signatures table.
    assert!(ir.contains("+(_)"));
    assert!(ir.contains("print(_)"));
    // Numeric constants are the raw IEEE bit patterns.
    let two_bits = format!("{}", 2.0f64.to_bits());
    assert!(ir.contains(&two_bits));
}

#[test]
fn string_literals_are_constructed_once_by_the_initializer() {
    let (mut module, main_id) = common::main_module();
    module.func_mut(main_id).body = Stmt::Block(vec![
        common::eval(common::system_print(common::str_lit("hi"))),
        common::eval(common::system_print(common::str_lit("hi"))),
        common::ret(Expr::Const(Literal::Null)),
    ]);

    let ir = common::lower(&mut module).unwrap();
    assert!(ir.contains("wren_init_string_literal"));
    // One managed-string global per unique literal.
    assert_eq!(common::count_occurrences(&ir, "@strobj_hi ="), 1);
    assert_eq!(common::count_occurrences(&ir, "call i64 @wren_init_string_literal"), 1);
}

#[test]
fn classes_emit_description_blocks_and_metaclass_dispatch() {
    let (mut module, main_id) = common::main_module();

    let class_global = module.add_global("A");
    let class_id = module.add_class(IRClass {
        name: "A".to_string(),
        fields: vec!["_v".to_string()],
        methods: Vec::new(),
        parent: None,
        output: Some(class_global),
    });

    let mut foo = IRFn::new("A.foo");
    foo.enclosing_class = Some(class_id);
    foo.body = Stmt::Block(vec![common::ret(common::num(42.0))]);
    let foo_id = module.add_fn(foo);

    let mut getter = IRFn::new("A.g");
    getter.enclosing_class = Some(class_id);
    getter.is_static_method = true;
    getter.body = Stmt::Block(vec![common::ret(common::num(7.0))]);
    let getter_id = module.add_fn(getter);

    let mut ctor = IRFn::new("A.new");
    ctor.enclosing_class = Some(class_id);
    ctor.is_static_method = true;
    ctor.body = Stmt::Block(vec![common::ret(Expr::AllocateInstance(class_id))]);
    let ctor_id = module.add_fn(ctor);

    module.classes[class_id.index()].methods = vec![
        MethodDef { signature: Signature::method("foo", 0), func: foo_id, is_static: false },
        MethodDef { signature: Signature::getter("g"), func: getter_id, is_static: true },
        MethodDef { signature: Signature::method("new", 0), func: ctor_id, is_static: true },
    ];

    // System.print(A.new().foo()) and System.print(A.g)
    let instance = common::call(
        Signature::method("new", 0),
        Expr::GetClassVar(class_id),
        vec![],
    );
    let foo_result = common::call(Signature::method("foo", 0), instance, vec![]);
    let g_result = common::call(Signature::getter("g"), Expr::GetClassVar(class_id), vec![]);
    module.func_mut(main_id).body = Stmt::Block(vec![
        common::eval(common::system_print(foo_result)),
        common::eval(common::system_print(g_result)),
        common::ret(Expr::Const(Literal::Null)),
    ]);

    let ir = common::lower(&mut module).unwrap();
    assert!(ir.contains("class_data_A"));
    assert!(ir.contains("class_obj_A"));
    assert!(ir.contains("class_field_offset_A"));
    assert!(ir.contains("wren_init_class"));
    assert!(ir.contains("wren_class_get_field_offset"));
    assert!(ir.contains("wren_alloc_obj"));
    // The class object lands in its module variable.
    assert!(ir.contains("@gbl_A"));
    // Method signatures registered for dispatch.
    assert!(ir.contains("foo()"));
    assert!(ir.contains("new()"));
}

#[test]
fn method_bodies_address_fields_through_the_class_offset() {
    let (mut module, main_id) = common::main_module();
    let class_id = module.add_class(IRClass {
        name: "Box".to_string(),
        fields: vec!["_v".to_string()],
        methods: Vec::new(),
        parent: None,
        output: None,
    });

    let mut setter = IRFn::new("Box.store");
    setter.enclosing_class = Some(class_id);
    let setter_id = module.add_fn(setter);
    let param = module.add_local(setter_id, "value");
    module.func_mut(setter_id).parameters.push(param);
    module.func_mut(setter_id).body = Stmt::Block(vec![
        Stmt::FieldAssign {
            field: FieldRef { name: "_v".to_string(), index: 0 },
            object: Expr::LoadReceiver,
            value: Expr::Load(VarRef::Local(param)),
        },
        common::ret(Expr::FieldLoad {
            field: FieldRef { name: "_v".to_string(), index: 0 },
            object: Box::new(Expr::LoadReceiver),
        }),
    ]);
    module.classes[class_id.index()].methods = vec![MethodDef {
        signature: Signature::method("store", 1),
        func: setter_id,
        is_static: false,
    }];
    module.func_mut(main_id).body = Stmt::Block(vec![common::ret(Expr::Const(Literal::Null))]);

    let ir = common::lower(&mut module).unwrap();
    assert!(ir.contains("this_field_offset"));
    assert!(ir.contains("fields_ptr"));
    assert!(ir.contains("field_ptr__v"));
}

#[test]
fn super_calls_use_the_static_class_lookup() {
    let (mut module, main_id) = common::main_module();
    let parent_id = module.add_class(IRClass {
        name: "Base".to_string(),
        fields: Vec::new(),
        methods: Vec::new(),
        parent: None,
        output: None,
    });
    let child_id = module.add_class(IRClass {
        name: "Derived".to_string(),
        fields: Vec::new(),
        methods: Vec::new(),
        parent: Some(parent_id),
        output: None,
    });

    let mut method = IRFn::new("Derived.describe");
    method.enclosing_class = Some(child_id);
    method.body = Stmt::Block(vec![common::ret(Expr::Call {
        signature: Signature::method("describe", 0),
        receiver: Box::new(Expr::LoadReceiver),
        args: vec![],
        super_call: true,
    })]);
    let method_id = module.add_fn(method);
    module.classes[child_id.index()].methods = vec![MethodDef {
        signature: Signature::method("describe", 0),
        func: method_id,
        is_static: false,
    }];
    module.func_mut(main_id).body = Stmt::Block(vec![common::ret(Expr::Const(Literal::Null))]);

    let ir = common::lower(&mut module).unwrap();
    assert!(ir.contains("wren_super_method_lookup"));
    // Derived's description block names Base's value slot as supertype.
    assert!(ir.contains("class_data_Derived"));
    assert!(ir.contains("@class_obj_Base"));
}

#[test]
fn capture_free_closures_pass_null_closables_and_no_list_head() {
    let (mut module, main_id) = common::main_module();
    let mut plain = IRFn::new("plain_fn");
    plain.parent = Some(main_id);
    plain.body = Stmt::Block(vec![common::ret(common::num(5.0))]);
    let plain_id = module.add_fn(plain);

    module.func_mut(main_id).body = Stmt::Block(vec![
        common::eval(Expr::Closure(plain_id)),
        common::ret(Expr::Const(Literal::Null)),
    ]);

    let ir = common::lower(&mut module).unwrap();
    assert!(ir.contains("wren_create_closure"));
    assert!(ir.contains("wren_register_closure"));
    assert!(ir.contains("spec_plain_fn"));
    // No captures: no closable array, no instance list, and the entry
    // function takes no pack parameter.
    assert!(!ir.contains("closure_list_head"));
    assert!(!ir.contains("%closables"));
    assert!(ir.contains("define i64 @plain_fn()"));
}

/// The scenario-2 shape: a scope-local captured by a closure that is
/// created, stored in a module variable, and called after the scope ends.
fn capturing_module() -> (wrenc::ir::Module, wrenc::ir::FnId) {
    let (mut module, main_id) = common::main_module();
    let f_global = module.add_global("f");

    let mut closure = IRFn::new("block_fn");
    closure.parent = Some(main_id);
    let closure_id = module.add_fn(closure);

    let mut analyzer = ScopeAnalyzer::new(&mut module);
    let root = analyzer.begin_function(main_id);
    let inner = analyzer.push_scope();
    let local = analyzer.declare_local("x").unwrap();
    analyzer.begin_function(closure_id);
    let VarRef::Upvalue(upvalue) = analyzer.lookup("x", 2) else { panic!() };
    analyzer.end_function();
    analyzer.pop_scope();
    analyzer.end_function();

    // block_fn: x = x + 10; return x
    module.func_mut(closure_id).body = Stmt::Block(vec![
        Stmt::Assign {
            var: VarRef::Upvalue(upvalue),
            value: common::call(
                Signature::method("+", 1),
                Expr::Load(VarRef::Upvalue(upvalue)),
                vec![common::num(10.0)],
            ),
        },
        common::ret(Expr::Load(VarRef::Upvalue(upvalue))),
    ]);

    // main: { var x = 1; f = block_fn } then f.call()
    module.func_mut(main_id).body = Stmt::Block(vec![
        Stmt::BeginUpvalues(root),
        Stmt::Block(vec![
            Stmt::BeginUpvalues(inner),
            Stmt::Assign { var: VarRef::Local(local), value: common::num(1.0) },
            Stmt::Assign { var: VarRef::Global(f_global), value: Expr::Closure(closure_id) },
        ]),
        common::eval(common::system_print(common::call(
            Signature::method("call", 0),
            Expr::Load(VarRef::Global(f_global)),
            vec![],
        ))),
        common::ret(Expr::Const(Literal::Null)),
    ]);

    (module, main_id)
}

#[test]
fn captured_locals_emit_the_full_relocation_protocol() {
    let (mut module, _) = capturing_module();
    let ir = common::lower(&mut module).unwrap();

    // Creation side: closable array, instance list head, spec global.
    assert!(ir.contains("%closables"));
    assert!(ir.contains("closure_list_head_block_fn"));
    assert!(ir.contains("wren_create_closure"));

    // Relocation side: the whole state machine.
    assert!(ir.contains("wren_alloc_upvalue_storage"));
    assert!(ir.contains("wren_get_closure_upvalue_pack"));
    assert!(ir.contains("wren_get_closure_chain_next"));
    assert!(ir.contains("relocate_done"));
    assert!(ir.contains("sweep_loop_block_fn"));
    assert!(ir.contains("phi ptr"));

    // The closure reads its capture through the pack argument.
    assert!(ir.contains("define i64 @block_fn(ptr %upvalue_pack)"));
    assert!(ir.contains("uv_pptr_x"));
}

#[test]
fn closure_spec_records_the_planned_pack_indices() {
    let (mut module, _) = capturing_module();
    let ir = common::lower(&mut module).unwrap();

    // One capture at closable position 0: { fn, name, arity 0, 1 upvalue,
    // index 0 }.
    assert!(ir.contains("@closure_spec_block_fn"));
    assert!(ir.contains("ptr @block_fn"));
    assert!(ir.contains("i32 0, i32 1, i32 0"));
}

#[test]
fn transitive_captures_heap_promote_and_creator_fill() {
    let (mut module, main_id) = common::main_module();
    let mut middle = IRFn::new("middle_fn");
    middle.parent = Some(main_id);
    let middle_id = module.add_fn(middle);
    let mut inner = IRFn::new("inner_fn");
    inner.parent = Some(middle_id);
    let inner_id = module.add_fn(inner);

    let mut analyzer = ScopeAnalyzer::new(&mut module);
    let root = analyzer.begin_function(main_id);
    let local = analyzer.declare_local("shared").unwrap();
    analyzer.begin_function(middle_id);
    analyzer.begin_function(inner_id);
    let VarRef::Upvalue(inner_upvalue) = analyzer.lookup("shared", 1) else { panic!() };
    analyzer.end_function();
    analyzer.end_function();
    analyzer.end_function();
    let middle_upvalue = module.func(middle_id).upvalues[0];

    module.func_mut(inner_id).body =
        Stmt::Block(vec![common::ret(Expr::Load(VarRef::Upvalue(inner_upvalue)))]);
    module.func_mut(middle_id).body = Stmt::Block(vec![
        common::eval(Expr::Load(VarRef::Upvalue(middle_upvalue))),
        common::ret(Expr::Closure(inner_id)),
    ]);
    module.func_mut(main_id).body = Stmt::Block(vec![
        Stmt::BeginUpvalues(root),
        Stmt::Assign { var: VarRef::Local(local), value: common::num(3.0) },
        common::eval(Expr::Closure(middle_id)),
        common::ret(Expr::Const(Literal::Null)),
    ]);

    let ir = common::lower(&mut module).unwrap();
    // The shared cell is allocated when its scope begins, not relocated at
    // its end.
    assert!(ir.contains("%cell_shared"));
    assert!(ir.contains("wren_alloc_upvalue_storage"));
    assert!(!ir.contains("relocate_done"));
    // Creator-filled spec entries carry bit 31.
    let flag = wren_abi::SPEC_INDEX_CREATOR_FILLED as i32;
    assert!(ir.contains(&format!("i32 {flag}")));
    // The middle closure stores cell pointers into the packs it creates.
    assert!(ir.contains("wren_get_closure_upvalue_pack"));
}

#[test]
fn lowering_always_passes_llvm_verification() {
    // The IR → LLVM → verify round trip across every shape above.
    let (mut simple, simple_main) = common::main_module();
    simple.func_mut(simple_main).body = Stmt::Block(vec![common::ret(common::num(0.0))]);
    common::lower(&mut simple).unwrap();

    let (mut capturing, _) = capturing_module();
    common::lower(&mut capturing).unwrap();
}

#[test]
fn compile_module_writes_an_object_file() {
    let (mut module, main_id) = common::main_module();
    module.func_mut(main_id).body = Stmt::Block(vec![common::ret(common::num(0.0))]);

    let result = wrenc::compile_module(&mut module).unwrap();
    assert_eq!(result.format, wrenc::OutputFormat::Object);
    let metadata = std::fs::metadata(&result.path).unwrap();
    assert!(metadata.len() > 0);
    let _ = std::fs::remove_file(&result.path);
}
