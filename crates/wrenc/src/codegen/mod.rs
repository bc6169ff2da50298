//! LLVM lowering.
//!
//! `CodeGen` holds the LLVM `Context`/`Module`/`Builder` triple, cached
//! types, and the caches for string constants, managed strings, module
//! globals and system variables. The pipeline is organised across
//! submodules:
//! - `emit`: module- and function-level emission (stack slots, closable
//!   array, chain heads, parameters)
//! - `expr`: expression lowering
//! - `stmt`: statement lowering, including the relocation state machine
//! - `init`: the `module_init` function (system variables, string
//!   literals, closure specs, classes, the signatures table)
//!
//! Runtime helpers are declared lazily through getters so the ABI types
//! are defined in exactly one place each.

use std::cell::RefCell;
use std::collections::{BTreeSet, HashMap};

use inkwell::AddressSpace;
use inkwell::basic_block::BasicBlock;
use inkwell::builder::Builder;
use inkwell::context::Context;
use inkwell::module::{Linkage, Module};
use inkwell::types::{IntType, PointerType};
use inkwell::values::{FunctionValue, GlobalValue, IntValue, PointerValue};

use crate::diagnostics::internal_error;
use crate::ir::{self, ClassId, FnId, GlobalId, LabelId, LocalId};
use crate::signature::SignatureRegistry;
use crate::upvalues::UpvaluePlan;

pub mod emit;
pub mod expr;
pub mod init;
pub mod stmt;

pub use emit::generate;

/// Unwrap a builder result; a failure here is a compiler bug.
pub(crate) fn build_ok<T, E: std::fmt::Debug>(result: Result<T, E>, what: &str) -> T {
    result.unwrap_or_else(|e| internal_error(&format!("{what}: {e:?}")))
}

/// Per-function emission state.
pub(crate) struct FnCtx<'ctx> {
    pub fn_id: FnId,
    pub function: FunctionValue<'ctx>,
    /// Stack slots of uncaptured locals and temporaries.
    pub local_addrs: HashMap<LocalId, PointerValue<'ctx>>,
    /// The contiguous stack array holding captured (stack-closable) locals.
    pub closable_array: Option<PointerValue<'ctx>>,
    /// Slots holding the heap cell pointer of each heap-promoted local.
    pub heap_cell_slots: HashMap<LocalId, PointerValue<'ctx>>,
    /// Heads of the per-closure instance lists threaded by
    /// `wren_create_closure`.
    pub chain_heads: HashMap<FnId, PointerValue<'ctx>>,
    pub receiver: Option<IntValue<'ctx>>,
    /// Pointer to the receiver's field block, methods only.
    pub field_pointer: Option<PointerValue<'ctx>>,
    /// The incoming upvalue pack argument, closures with captures only.
    pub pack_ptr: Option<PointerValue<'ctx>>,
    pub label_blocks: HashMap<LabelId, BasicBlock<'ctx>>,
}

pub struct CodeGen<'ctx, 'm> {
    pub context: &'ctx Context,
    pub module: Module<'ctx>,
    pub builder: Builder<'ctx>,
    pub ir: &'m ir::Module,
    pub plan: &'m UpvaluePlan,

    /// All runtime values are this: a NaN-tagged i64 word.
    pub value_t: IntType<'ctx>,
    pub i8_t: IntType<'ctx>,
    pub i32_t: IntType<'ctx>,
    pub i64_t: IntType<'ctx>,
    pub bool_t: IntType<'ctx>,
    pub ptr_t: PointerType<'ctx>,
    pub null_value: IntValue<'ctx>,

    /// The private per-module initializer, called at main entry.
    pub init_fn: FunctionValue<'ctx>,
    pub true_global: GlobalValue<'ctx>,
    pub false_global: GlobalValue<'ctx>,

    /// LLVM function per IR function.
    pub fn_values: HashMap<FnId, FunctionValue<'ctx>>,
    /// Closable-array position of every stack-closable local, per owner.
    pub closed_positions: HashMap<FnId, HashMap<LocalId, usize>>,
    /// `spec_<name>` globals holding each closure's `ClosureSpec*`.
    pub spec_globals: HashMap<FnId, GlobalValue<'ctx>>,
    pub class_objects: HashMap<ClassId, GlobalValue<'ctx>>,
    pub class_field_offsets: HashMap<ClassId, GlobalValue<'ctx>>,

    /// Raw C-string constants, keyed by contents.
    string_constants: RefCell<HashMap<String, PointerValue<'ctx>>>,
    /// String-literal object globals, filled by the initializer.
    managed_strings: RefCell<HashMap<String, GlobalValue<'ctx>>>,
    managed_string_order: RefCell<Vec<String>>,
    /// Module variable globals, created lazily.
    global_vars: RefCell<HashMap<GlobalId, GlobalValue<'ctx>>>,
    /// System-variable globals actually referenced by the emitted code.
    system_vars: RefCell<HashMap<String, GlobalValue<'ctx>>>,
    system_var_order: RefCell<Vec<String>>,

    pub registry: RefCell<SignatureRegistry>,
    /// Canonical strings of every signature used, for the signatures table.
    pub signatures_used: RefCell<BTreeSet<String>>,
}

impl<'ctx, 'm> CodeGen<'ctx, 'm> {
    pub fn new(
        context: &'ctx Context,
        ir: &'m ir::Module,
        plan: &'m UpvaluePlan,
    ) -> CodeGen<'ctx, 'm> {
        let module = context.create_module(ir.name.as_deref().unwrap_or("wren_module"));
        let builder = context.create_builder();

        let value_t = context.i64_type();
        let null_value = value_t.const_int(wren_abi::NULL_VAL, false);
        let ptr_t = context.ptr_type(AddressSpace::default());

        let init_type = context.void_type().fn_type(&[], false);
        let init_fn = module.add_function("module_init", init_type, Some(Linkage::Private));

        let true_global = module.add_global(value_t, None, "gbl_trueValue");
        true_global.set_linkage(Linkage::Internal);
        true_global.set_initializer(&null_value);
        let false_global = module.add_global(value_t, None, "gbl_falseValue");
        false_global.set_linkage(Linkage::Internal);
        false_global.set_initializer(&null_value);

        CodeGen {
            context,
            module,
            builder,
            ir,
            plan,
            value_t,
            i8_t: context.i8_type(),
            i32_t: context.i32_type(),
            i64_t: context.i64_type(),
            bool_t: context.bool_type(),
            ptr_t,
            null_value,
            init_fn,
            true_global,
            false_global,
            fn_values: HashMap::new(),
            closed_positions: HashMap::new(),
            spec_globals: HashMap::new(),
            class_objects: HashMap::new(),
            class_field_offsets: HashMap::new(),
            string_constants: RefCell::new(HashMap::new()),
            managed_strings: RefCell::new(HashMap::new()),
            managed_string_order: RefCell::new(Vec::new()),
            global_vars: RefCell::new(HashMap::new()),
            system_vars: RefCell::new(HashMap::new()),
            system_var_order: RefCell::new(Vec::new()),
            registry: RefCell::new(SignatureRegistry::new()),
            signatures_used: RefCell::new(BTreeSet::new()),
        }
    }

    // --- Runtime helper declarations ---

    fn declare(
        &self,
        name: &str,
        fn_type: inkwell::types::FunctionType<'ctx>,
    ) -> FunctionValue<'ctx> {
        self.module
            .get_function(name)
            .unwrap_or_else(|| self.module.add_function(name, fn_type, None))
    }

    pub fn get_virtual_method_lookup(&self) -> FunctionValue<'ctx> {
        let ty = self
            .ptr_t
            .fn_type(&[self.value_t.into(), self.value_t.into()], false);
        self.declare(wren_abi::names::VIRTUAL_METHOD_LOOKUP, ty)
    }

    pub fn get_super_method_lookup(&self) -> FunctionValue<'ctx> {
        let ty = self.ptr_t.fn_type(
            &[
                self.value_t.into(),
                self.value_t.into(),
                self.value_t.into(),
                self.i8_t.into(),
            ],
            false,
        );
        self.declare(wren_abi::names::SUPER_METHOD_LOOKUP, ty)
    }

    pub fn get_create_closure(&self) -> FunctionValue<'ctx> {
        let ty = self.value_t.fn_type(
            &[self.ptr_t.into(), self.ptr_t.into(), self.ptr_t.into()],
            false,
        );
        self.declare(wren_abi::names::CREATE_CLOSURE, ty)
    }

    pub fn get_register_closure(&self) -> FunctionValue<'ctx> {
        let ty = self.ptr_t.fn_type(&[self.ptr_t.into()], false);
        self.declare(wren_abi::names::REGISTER_CLOSURE, ty)
    }

    pub fn get_closure_upvalue_pack(&self) -> FunctionValue<'ctx> {
        let ty = self.ptr_t.fn_type(&[self.ptr_t.into()], false);
        self.declare(wren_abi::names::GET_CLOSURE_UPVALUE_PACK, ty)
    }

    pub fn get_closure_chain_next(&self) -> FunctionValue<'ctx> {
        let ty = self.ptr_t.fn_type(&[self.ptr_t.into()], false);
        self.declare(wren_abi::names::GET_CLOSURE_CHAIN_NEXT, ty)
    }

    pub fn get_alloc_upvalue_storage(&self) -> FunctionValue<'ctx> {
        let ty = self.ptr_t.fn_type(&[self.i32_t.into()], false);
        self.declare(wren_abi::names::ALLOC_UPVALUE_STORAGE, ty)
    }

    pub fn get_alloc_obj(&self) -> FunctionValue<'ctx> {
        let ty = self.value_t.fn_type(&[self.value_t.into()], false);
        self.declare(wren_abi::names::ALLOC_OBJ, ty)
    }

    pub fn get_init_class(&self) -> FunctionValue<'ctx> {
        let ty = self
            .value_t
            .fn_type(&[self.ptr_t.into(), self.ptr_t.into()], false);
        self.declare(wren_abi::names::INIT_CLASS, ty)
    }

    pub fn get_class_field_offset(&self) -> FunctionValue<'ctx> {
        let ty = self.i32_t.fn_type(&[self.value_t.into()], false);
        self.declare(wren_abi::names::CLASS_GET_FIELD_OFFSET, ty)
    }

    pub fn get_init_string_literal(&self) -> FunctionValue<'ctx> {
        let ty = self
            .value_t
            .fn_type(&[self.ptr_t.into(), self.i32_t.into()], false);
        self.declare(wren_abi::names::INIT_STRING_LITERAL, ty)
    }

    pub fn get_register_signatures_table(&self) -> FunctionValue<'ctx> {
        let ty = self.context.void_type().fn_type(&[self.ptr_t.into()], false);
        self.declare(wren_abi::names::REGISTER_SIGNATURES_TABLE, ty)
    }

    pub fn get_core_class_value(&self) -> FunctionValue<'ctx> {
        let ty = self.value_t.fn_type(&[self.ptr_t.into()], false);
        self.declare(wren_abi::names::GET_CORE_CLASS_VALUE, ty)
    }

    pub fn get_bool_value_fn(&self) -> FunctionValue<'ctx> {
        let ty = self.value_t.fn_type(&[self.i8_t.into()], false);
        self.declare(wren_abi::names::GET_BOOL_VALUE, ty)
    }

    // --- Constant and global caches ---

    /// Trim and de-null a string so it can serve as a symbol suffix.
    pub(crate) fn filter_literal(literal: &str) -> String {
        literal
            .bytes()
            .filter(|&b| b != 0)
            .take(30)
            .map(|b| if b.is_ascii_graphic() { b as char } else { '_' })
            .collect()
    }

    /// A NUL-terminated C string constant; identical contents share one
    /// global.
    pub fn string_const(&self, contents: &str) -> PointerValue<'ctx> {
        if let Some(ptr) = self.string_constants.borrow().get(contents) {
            return *ptr;
        }
        let name = format!("str_{}", Self::filter_literal(contents));
        let constant = self.context.const_string(contents.as_bytes(), true);
        let global = self.module.add_global(constant.get_type(), None, &name);
        global.set_linkage(Linkage::Private);
        global.set_constant(true);
        global.set_initializer(&constant);
        let ptr = global.as_pointer_value();
        self.string_constants
            .borrow_mut()
            .insert(contents.to_string(), ptr);
        ptr
    }

    /// The global holding the string *object* for a literal; constructed by
    /// the initializer, one per unique literal.
    pub fn managed_string_global(&self, contents: &str) -> GlobalValue<'ctx> {
        if let Some(global) = self.managed_strings.borrow().get(contents) {
            return *global;
        }
        let name = format!("strobj_{}", Self::filter_literal(contents));
        let global = self.module.add_global(self.value_t, None, &name);
        global.set_linkage(Linkage::Private);
        global.set_initializer(&self.null_value);
        self.managed_strings
            .borrow_mut()
            .insert(contents.to_string(), global);
        self.managed_string_order
            .borrow_mut()
            .push(contents.to_string());
        global
    }

    pub(crate) fn managed_string_names(&self) -> Vec<String> {
        self.managed_string_order.borrow().clone()
    }

    /// The module-level global backing a module variable.
    pub fn global_var(&self, id: GlobalId) -> GlobalValue<'ctx> {
        if let Some(global) = self.global_vars.borrow().get(&id) {
            return *global;
        }
        let name = format!("gbl_{}", self.ir.global(id).name);
        let global = self.module.add_global(self.value_t, None, &name);
        global.set_linkage(Linkage::Private);
        global.set_initializer(&self.null_value);
        self.global_vars.borrow_mut().insert(id, global);
        global
    }

    /// The internal global for a system variable, created on first use and
    /// populated by the initializer.
    pub fn system_var(&self, name: &str) -> GlobalValue<'ctx> {
        if !wren_abi::SYSTEM_VAR_NAMES.contains(&name) {
            internal_error(&format!("unknown system variable '{name}'"));
        }
        if let Some(global) = self.system_vars.borrow().get(name) {
            return *global;
        }
        let symbol = format!("{}{}", wren_abi::names::SYS_VAR_PREFIX, name);
        let global = self.module.add_global(self.value_t, None, &symbol);
        global.set_linkage(Linkage::Internal);
        global.set_initializer(&self.null_value);
        self.system_vars
            .borrow_mut()
            .insert(name.to_string(), global);
        self.system_var_order.borrow_mut().push(name.to_string());
        global
    }

    pub(crate) fn system_var_names_used(&self) -> Vec<String> {
        self.system_var_order.borrow().clone()
    }

    /// Emit an unconditional branch to `block` unless the current block is
    /// already terminated.
    pub(crate) fn ensure_branch(&self, block: BasicBlock<'ctx>) {
        if let Some(current) = self.builder.get_insert_block()
            && current.get_terminator().is_none()
        {
            build_ok(self.builder.build_unconditional_branch(block), "branch");
        }
    }
}
