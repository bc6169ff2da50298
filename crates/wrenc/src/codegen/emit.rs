//! Module- and function-level emission.
//!
//! `generate` runs the whole lowering: it precomputes closable-array
//! positions, creates the globals every later phase references (closure
//! specs, class objects, field offsets), creates an LLVM function per IR
//! function, emits every body, and finally emits the module initializer.
//!
//! A function's LLVM parameter list is `[upvalue_pack?, receiver?, arg0…]`:
//! the pack pointer appears iff the function is a closure with a non-empty
//! pack, the receiver iff it is a method.

use std::collections::HashMap;

use inkwell::context::Context;
use inkwell::module::Linkage;
use inkwell::types::BasicMetadataTypeEnum;
use inkwell::values::FunctionValue;

use crate::diagnostics::internal_error;
use crate::ir::{self, FnId, LocalId, UpvalueId, VarRef};
use crate::upvalues::UpvaluePlan;

use super::{CodeGen, FnCtx, build_ok};

/// Lower a whole module to LLVM IR. The caller owns verification and
/// object emission.
pub fn generate<'ctx, 'm>(
    context: &'ctx Context,
    ir: &'m ir::Module,
    plan: &'m UpvaluePlan,
) -> CodeGen<'ctx, 'm> {
    let mut gen = CodeGen::new(context, ir, plan);

    // Closable positions first: closure specs and bodies both need them.
    for (index, func) in ir.fns.iter().enumerate() {
        let fn_id = FnId(index as u32);
        let mut positions = HashMap::new();
        for &local in &func.locals {
            if plan.is_stack_closable(ir, local) {
                positions.insert(local, positions.len());
            }
        }
        gen.closed_positions.insert(fn_id, positions);
    }

    // A `spec_<name>` pointer global per closure; the initializer fills
    // them with the runtime's ClosureSpec handles.
    for fn_id in ir.closure_fns() {
        let name = format!("spec_{}", ir.func(fn_id).debug_name);
        let global = gen.module.add_global(gen.ptr_t, None, &name);
        global.set_linkage(Linkage::Internal);
        global.set_initializer(&gen.ptr_t.const_null());
        gen.spec_globals.insert(fn_id, global);
    }

    // Class object and field-offset globals. The offset is only known once
    // the runtime has laid the class out, so it's loaded at startup and
    // added to the object pointer on every field access.
    for (index, class) in ir.classes.iter().enumerate() {
        let class_id = ir::ClassId(index as u32);
        let object = gen
            .module
            .add_global(gen.value_t, None, &format!("class_obj_{}", class.name));
        object.set_linkage(Linkage::Internal);
        object.set_initializer(&gen.null_value);
        gen.class_objects.insert(class_id, object);

        let offset = gen.module.add_global(
            gen.i32_t,
            None,
            &format!("class_field_offset_{}", class.name),
        );
        offset.set_linkage(Linkage::Internal);
        offset.set_initializer(&gen.i32_t.const_zero());
        gen.class_field_offsets.insert(class_id, offset);
    }

    for (index, _) in ir.fns.iter().enumerate() {
        let fn_id = FnId(index as u32);
        let function = create_function(&gen, fn_id);
        gen.fn_values.insert(fn_id, function);
    }

    for (index, _) in ir.fns.iter().enumerate() {
        emit_function(&gen, FnId(index as u32));
    }

    gen.emit_initializer();

    // The standalone stub links against this pointer to find the module's
    // entry function.
    if let Some(main_fn) = ir.main_fn {
        let main_value = gen.fn_values[&main_fn];
        let global = gen
            .module
            .add_global(gen.ptr_t, None, wren_abi::names::STANDALONE_MAIN_FUNC);
        global.set_linkage(Linkage::External);
        global.set_constant(true);
        global.set_initializer(&main_value.as_global_value().as_pointer_value());
    }

    gen
}

fn create_function<'ctx>(gen: &CodeGen<'ctx, '_>, fn_id: FnId) -> FunctionValue<'ctx> {
    let func = gen.ir.func(fn_id);
    let takes_pack = gen
        .plan
        .pack(fn_id)
        .is_some_and(|pack| !pack.is_empty());

    let mut params: Vec<BasicMetadataTypeEnum> = Vec::new();
    if takes_pack {
        params.push(gen.ptr_t.into());
    }
    if func.enclosing_class.is_some() {
        params.push(gen.value_t.into());
    }
    params.extend(std::iter::repeat_n(
        BasicMetadataTypeEnum::from(gen.value_t),
        func.arity(),
    ));

    let fn_type = gen.value_t.fn_type(&params, false);
    gen.module.add_function(&func.debug_name, fn_type, None)
}

fn emit_function(gen: &CodeGen<'_, '_>, fn_id: FnId) {
    let func = gen.ir.func(fn_id);
    let function = gen.fn_values[&fn_id];
    let pack = gen.plan.pack(fn_id);
    let takes_pack = pack.is_some_and(|p| !p.is_empty());

    let entry = gen.context.append_basic_block(function, "entry");
    gen.builder.position_at_end(entry);

    if func.is_main {
        build_ok(
            gen.builder.build_call(gen.init_fn, &[], "init"),
            "call module_init",
        );
    }

    let mut ctx = FnCtx {
        fn_id,
        function,
        local_addrs: HashMap::new(),
        closable_array: None,
        heap_cell_slots: HashMap::new(),
        chain_heads: HashMap::new(),
        receiver: None,
        field_pointer: None,
        pack_ptr: None,
        label_blocks: HashMap::new(),
    };

    // Slot allocation. Uncaptured locals and temporaries get allocas;
    // stack-closable captures share the closable array; heap-promoted
    // captures get a slot holding their (scope-entry-allocated) cell
    // pointer.
    let closable_count = gen.closed_positions[&fn_id].len();
    if closable_count > 0 {
        let array = build_ok(
            gen.builder.build_array_alloca(
                gen.value_t,
                gen.i32_t.const_int(closable_count as u64, false),
                "closables",
            ),
            "alloca closables",
        );
        ctx.closable_array = Some(array);
    }

    for &local in &func.locals {
        let name = &gen.ir.local(local).name;
        if gen.plan.is_heap_promoted(local) {
            let slot = build_ok(
                gen.builder.build_alloca(gen.ptr_t, &format!("cell_{name}")),
                "alloca cell slot",
            );
            build_ok(
                gen.builder.build_store(slot, gen.ptr_t.const_null()),
                "init cell slot",
            );
            ctx.heap_cell_slots.insert(local, slot);
        } else if !gen.plan.is_stack_closable(gen.ir, local) {
            let slot = build_ok(gen.builder.build_alloca(gen.value_t, name), "alloca local");
            ctx.local_addrs.insert(local, slot);
        }
    }
    for &temp in &func.temporaries {
        let name = &gen.ir.local(temp).name;
        let slot = build_ok(gen.builder.build_alloca(gen.value_t, name), "alloca temp");
        ctx.local_addrs.insert(temp, slot);
    }

    // A list head per closure whose instances must be swept at relocation:
    // those directly capturing a stack-closable local of this frame.
    for &closure in &func.closures {
        if !closure_sweeps_frame(gen, fn_id, closure) {
            continue;
        }
        let name = format!("closure_list_head_{}", gen.ir.func(closure).debug_name);
        let slot = build_ok(gen.builder.build_alloca(gen.ptr_t, &name), "alloca list head");
        build_ok(
            gen.builder.build_store(slot, gen.ptr_t.const_null()),
            "init list head",
        );
        ctx.chain_heads.insert(closure, slot);
    }

    // Bind the implicit arguments, then spill the real ones into their
    // slots so parameters behave like any other local.
    let mut next_arg = 0u32;
    if takes_pack {
        let pack_arg = function
            .get_nth_param(next_arg)
            .unwrap_or_else(|| internal_error("missing upvalue pack argument"))
            .into_pointer_value();
        pack_arg.set_name("upvalue_pack");
        ctx.pack_ptr = Some(pack_arg);
        next_arg += 1;
    }
    if let Some(class_id) = func.enclosing_class {
        let receiver = function
            .get_nth_param(next_arg)
            .unwrap_or_else(|| internal_error("missing receiver argument"))
            .into_int_value();
        receiver.set_name("this");
        next_arg += 1;
        ctx.receiver = Some(receiver);

        // The field block sits at a per-class offset from the object
        // pointer, loaded at startup.
        let content_mask = gen.value_t.const_int(wren_abi::CONTENT_MASK, false);
        let this_ptr = build_ok(
            gen.builder.build_and(receiver, content_mask, "this_ptr"),
            "mask receiver",
        );
        let offset_global = gen.class_field_offsets[&class_id];
        let offset = build_ok(
            gen.builder.build_load(
                gen.i32_t,
                offset_global.as_pointer_value(),
                "this_field_offset",
            ),
            "load field offset",
        )
        .into_int_value();
        let offset_wide = build_ok(
            gen.builder
                .build_int_z_extend(offset, gen.value_t, "this_field_offset_64"),
            "widen field offset",
        );
        let fields_int = build_ok(
            gen.builder.build_int_add(this_ptr, offset_wide, "fields_ptr_int"),
            "add field offset",
        );
        let fields_ptr = build_ok(
            gen.builder.build_int_to_ptr(fields_int, gen.ptr_t, "fields_ptr"),
            "fields pointer",
        );
        ctx.field_pointer = Some(fields_ptr);
    }
    for &param in &func.parameters {
        let value = function
            .get_nth_param(next_arg)
            .unwrap_or_else(|| internal_error("missing function argument"));
        value.set_name(&gen.ir.local(param).name);
        next_arg += 1;
        let slot = gen.local_pointer(&mut ctx, param);
        build_ok(gen.builder.build_store(slot, value), "store parameter");
    }

    gen.lower_stmt(&mut ctx, &func.body);

    // Functions without an explicit trailing return yield null.
    if let Some(block) = gen.builder.get_insert_block()
        && block.get_terminator().is_none()
    {
        build_ok(gen.builder.build_return(Some(&gen.null_value)), "implicit return");
    }
}

/// Does `closure` capture a stack-closable local declared by `frame_fn`?
pub(crate) fn closure_sweeps_frame(gen: &CodeGen<'_, '_>, frame_fn: FnId, closure: FnId) -> bool {
    gen.ir.func(closure).upvalues.iter().any(|&uv| {
        matches!(
            gen.ir.upvalue(uv).parent,
            VarRef::Local(local)
                if gen.ir.local(local).owner == frame_fn
                    && gen.plan.is_stack_closable(gen.ir, local)
        )
    })
}

impl<'ctx> CodeGen<'ctx, '_> {
    /// A pointer to a local's current cell: its alloca, its closable-array
    /// slot, or (heap-promoted) the cell its slot points at.
    pub(crate) fn local_pointer(
        &self,
        ctx: &mut FnCtx<'ctx>,
        local: LocalId,
    ) -> inkwell::values::PointerValue<'ctx> {
        if let Some(&slot) = ctx.local_addrs.get(&local) {
            return slot;
        }
        if let Some(&slot) = ctx.heap_cell_slots.get(&local) {
            let name = &self.ir.local(local).name;
            return build_ok(
                self.builder
                    .build_load(self.ptr_t, slot, &format!("cell_ptr_{name}")),
                "load heap cell",
            )
            .into_pointer_value();
        }
        if let Some(&position) = self.closed_positions[&ctx.fn_id].get(&local) {
            let array = ctx
                .closable_array
                .unwrap_or_else(|| internal_error("closable array missing"));
            let name = &self.ir.local(local).name;
            return unsafe {
                build_ok(
                    self.builder.build_gep(
                        self.value_t,
                        array,
                        &[self.i32_t.const_int(position as u64, false)],
                        &format!("lv_ptr_{name}"),
                    ),
                    "closable slot",
                )
            };
        }
        internal_error(&format!(
            "unallocated local variable '{}'",
            self.ir.local(local).name
        ));
    }

    /// A pointer to the cell an upvalue references: the pack stores cell
    /// pointers, so this indexes the pack and loads one.
    pub(crate) fn upvalue_pointer(
        &self,
        ctx: &mut FnCtx<'ctx>,
        upvalue: UpvalueId,
    ) -> inkwell::values::PointerValue<'ctx> {
        let pack = self
            .plan
            .pack(ctx.fn_id)
            .unwrap_or_else(|| internal_error("upvalue reference outside a closure"));
        let position = pack
            .index_of(upvalue)
            .unwrap_or_else(|| {
                internal_error(&format!(
                    "upvalue '{}' missing from the current pack",
                    self.ir.upvalue(upvalue).name
                ))
            });
        let pack_ptr = ctx
            .pack_ptr
            .unwrap_or_else(|| internal_error("upvalue reference without a pack argument"));
        let name = &self.ir.upvalue(upvalue).name;
        let slot = unsafe {
            build_ok(
                self.builder.build_gep(
                    self.ptr_t,
                    pack_ptr,
                    &[self.i32_t.const_int(position as u64, false)],
                    &format!("uv_pptr_{name}"),
                ),
                "pack slot",
            )
        };
        build_ok(
            self.builder
                .build_load(self.ptr_t, slot, &format!("uv_ptr_{name}")),
            "load pack entry",
        )
        .into_pointer_value()
    }
}
