//! Expression lowering. Every expression produces an `i64` value word.

use inkwell::values::{BasicMetadataValueEnum, IntValue};

use crate::diagnostics::internal_error;
use crate::ir::{Expr, Literal, VarRef};

use super::{CodeGen, FnCtx, build_ok};

impl<'ctx> CodeGen<'ctx, '_> {
    pub(crate) fn lower_expr(&self, ctx: &mut FnCtx<'ctx>, expr: &Expr) -> IntValue<'ctx> {
        match expr {
            Expr::Const(literal) => self.lower_const(literal),
            Expr::Load(var) => self.lower_load(ctx, *var),
            Expr::FieldLoad { field, object } => {
                self.expect_receiver_object(ctx, object);
                let base = ctx
                    .field_pointer
                    .unwrap_or_else(|| internal_error("field load outside a method"));
                let slot = unsafe {
                    build_ok(
                        self.builder.build_gep(
                            self.value_t,
                            base,
                            &[self.i32_t.const_int(field.index as u64, false)],
                            &format!("field_ptr_{}", field.name),
                        ),
                        "field slot",
                    )
                };
                build_ok(
                    self.builder
                        .build_load(self.value_t, slot, &format!("field_{}", field.name)),
                    "load field",
                )
                .into_int_value()
            }
            Expr::Call { signature, receiver, args, super_call } => {
                self.lower_call(ctx, signature, receiver, args, *super_call)
            }
            Expr::Closure(func) => self.lower_closure(ctx, *func),
            Expr::LoadReceiver => ctx
                .receiver
                .unwrap_or_else(|| internal_error("receiver load outside a method")),
            Expr::RunStatements { body, temporary } => {
                self.lower_stmt(ctx, body);
                let slot = self.local_pointer(ctx, *temporary);
                build_ok(
                    self.builder.build_load(self.value_t, slot, "temp_value"),
                    "load run-statements temp",
                )
                .into_int_value()
            }
            Expr::LogicalNot(inner) => {
                let value = self.lower_expr(ctx, inner);
                let falsy = self.is_falsy(value);
                let true_value = build_ok(
                    self.builder.build_load(
                        self.value_t,
                        self.true_global.as_pointer_value(),
                        "true_value",
                    ),
                    "load true",
                )
                .into_int_value();
                let false_value = build_ok(
                    self.builder.build_load(
                        self.value_t,
                        self.false_global.as_pointer_value(),
                        "false_value",
                    ),
                    "load false",
                )
                .into_int_value();
                build_ok(
                    self.builder.build_select(falsy, true_value, false_value, "not"),
                    "select not",
                )
                .into_int_value()
            }
            Expr::AllocateInstance(class) => {
                let class_value = build_ok(
                    self.builder.build_load(
                        self.value_t,
                        self.class_objects[class].as_pointer_value(),
                        &format!("cls_{}", self.ir.class(*class).name),
                    ),
                    "load class",
                )
                .into_int_value();
                let call = build_ok(
                    self.builder.build_call(
                        self.get_alloc_obj(),
                        &[class_value.into()],
                        &format!("new_obj_{}", self.ir.class(*class).name),
                    ),
                    "alloc obj",
                );
                call.try_as_basic_value().left().unwrap().into_int_value()
            }
            Expr::SystemVar(name) => {
                let global = self.system_var(name);
                build_ok(
                    self.builder.build_load(
                        self.value_t,
                        global.as_pointer_value(),
                        &format!("gbl_{name}"),
                    ),
                    "load system var",
                )
                .into_int_value()
            }
            Expr::GetClassVar(class) => build_ok(
                self.builder.build_load(
                    self.value_t,
                    self.class_objects[class].as_pointer_value(),
                    &format!("cls_{}", self.ir.class(*class).name),
                ),
                "load class var",
            )
            .into_int_value(),
        }
    }

    fn lower_const(&self, literal: &Literal) -> IntValue<'ctx> {
        match literal {
            Literal::Null => self.null_value,
            Literal::Bool(value) => {
                let global = if *value { self.true_global } else { self.false_global };
                let name = if *value { "const_true" } else { "const_false" };
                build_ok(
                    self.builder
                        .build_load(self.value_t, global.as_pointer_value(), name),
                    "load bool singleton",
                )
                .into_int_value()
            }
            Literal::Num(value) => self
                .value_t
                .const_int(wren_abi::encode_number(*value), false),
            Literal::Str(contents) => {
                let global = self.managed_string_global(contents);
                let name = format!("strobj_{}", Self::filter_literal(contents));
                build_ok(
                    self.builder
                        .build_load(self.value_t, global.as_pointer_value(), &name),
                    "load string object",
                )
                .into_int_value()
            }
        }
    }

    fn lower_load(&self, ctx: &mut FnCtx<'ctx>, var: VarRef) -> IntValue<'ctx> {
        let name = self.ir.var_name(var).to_string();
        let ptr = match var {
            VarRef::Local(local) => self.local_pointer(ctx, local),
            VarRef::Upvalue(upvalue) => self.upvalue_pointer(ctx, upvalue),
            VarRef::Global(global) => self.global_var(global).as_pointer_value(),
        };
        build_ok(
            self.builder
                .build_load(self.value_t, ptr, &format!("{name}_value")),
            "load variable",
        )
        .into_int_value()
    }

    fn lower_call(
        &self,
        ctx: &mut FnCtx<'ctx>,
        signature: &crate::signature::Signature,
        receiver: &Expr,
        args: &[Expr],
        super_call: bool,
    ) -> IntValue<'ctx> {
        let receiver_value = self.lower_expr(ctx, receiver);
        let mut call_args: Vec<BasicMetadataValueEnum> = vec![receiver_value.into()];
        for arg in args {
            call_args.push(self.lower_expr(ctx, arg).into());
        }

        let canonical = signature.canonical();
        let id = self.registry.borrow_mut().find(&canonical);
        self.signatures_used.borrow_mut().insert(canonical.clone());
        let sig_value = self.value_t.const_int(id, false);

        let target = if !super_call {
            build_ok(
                self.builder.build_call(
                    self.get_virtual_method_lookup(),
                    &[receiver_value.into(), sig_value.into()],
                    &format!("vptr_{canonical}"),
                ),
                "method lookup",
            )
        } else {
            // Super dispatch starts above the statically known class of
            // the method this call appears in.
            let func = self.ir.func(ctx.fn_id);
            let class_id = func
                .enclosing_class
                .unwrap_or_else(|| internal_error("super call outside a method"));
            let class_value = build_ok(
                self.builder.build_load(
                    self.value_t,
                    self.class_objects[&class_id].as_pointer_value(),
                    &format!("super_cls_{}", self.ir.class(class_id).name),
                ),
                "load super class",
            )
            .into_int_value();
            let is_static = self
                .i8_t
                .const_int(func.is_static_method as u64, false);
            build_ok(
                self.builder.build_call(
                    self.get_super_method_lookup(),
                    &[
                        receiver_value.into(),
                        class_value.into(),
                        sig_value.into(),
                        is_static.into(),
                    ],
                    &format!("vptr_{canonical}"),
                ),
                "super lookup",
            )
        };
        let fn_ptr = target
            .try_as_basic_value()
            .left()
            .unwrap()
            .into_pointer_value();

        // The callee ABI is `(receiver, args…) -> Value`, all words.
        let param_types = vec![self.value_t.into(); call_args.len()];
        let fn_type = self.value_t.fn_type(&param_types, false);
        let result = build_ok(
            self.builder
                .build_indirect_call(fn_type, fn_ptr, &call_args, "call"),
            "indirect call",
        );
        result.try_as_basic_value().left().unwrap().into_int_value()
    }

    fn lower_closure(&self, ctx: &mut FnCtx<'ctx>, func: crate::ir::FnId) -> IntValue<'ctx> {
        let debug_name = &self.ir.func(func).debug_name;
        let spec_global = self
            .spec_globals
            .get(&func)
            .unwrap_or_else(|| internal_error(&format!("no closure spec for '{debug_name}'")));
        let spec = build_ok(
            self.builder.build_load(
                self.ptr_t,
                spec_global.as_pointer_value(),
                &format!("closure_spec_{debug_name}"),
            ),
            "load closure spec",
        )
        .into_pointer_value();

        // Pass the closable array iff the closure binds to cells in it.
        let captures_frame = super::emit::closure_sweeps_frame(self, ctx.fn_id, func);
        let closables = if captures_frame {
            ctx.closable_array
                .unwrap_or_else(|| internal_error("closure captures but frame has no closables"))
        } else {
            self.ptr_t.const_null()
        };
        let list_head = match ctx.chain_heads.get(&func) {
            Some(&slot) => slot,
            None => self.ptr_t.const_null(),
        };

        let call = build_ok(
            self.builder.build_call(
                self.get_create_closure(),
                &[spec.into(), closables.into(), list_head.into()],
                &format!("closure_{debug_name}"),
            ),
            "create closure",
        );
        let closure_value = call.try_as_basic_value().left().unwrap().into_int_value();

        // Creator-filled pack entries: cells that are already on the heap,
        // reached through our own pack or through a heap-promoted local.
        let pack = self.plan.pack(func);
        let mut patches = Vec::new();
        if let Some(pack) = pack {
            for (index, &upvalue) in pack.variables.iter().enumerate() {
                match self.ir.upvalue(upvalue).parent {
                    VarRef::Upvalue(parent_upvalue) => {
                        let cell = self.upvalue_pointer(ctx, parent_upvalue);
                        patches.push((index, cell));
                    }
                    VarRef::Local(local) if self.plan.is_heap_promoted(local) => {
                        let slot = ctx.heap_cell_slots.get(&local).copied().unwrap_or_else(|| {
                            internal_error(&format!(
                                "heap cell slot missing for '{}'",
                                self.ir.local(local).name
                            ))
                        });
                        let cell = build_ok(
                            self.builder.build_load(self.ptr_t, slot, "cell_ptr"),
                            "load heap cell",
                        )
                        .into_pointer_value();
                        patches.push((index, cell));
                    }
                    VarRef::Local(_) => {}
                    VarRef::Global(_) => internal_error("upvalue with a global parent"),
                }
            }
        }
        if !patches.is_empty() {
            let content_mask = self.value_t.const_int(wren_abi::CONTENT_MASK, false);
            let obj_int = build_ok(
                self.builder
                    .build_and(closure_value, content_mask, "closure_obj_int"),
                "mask closure",
            );
            let obj_ptr = build_ok(
                self.builder
                    .build_int_to_ptr(obj_int, self.ptr_t, "closure_obj"),
                "closure pointer",
            );
            let pack_base = build_ok(
                self.builder.build_call(
                    self.get_closure_upvalue_pack(),
                    &[obj_ptr.into()],
                    "pack_base",
                ),
                "get pack",
            )
            .try_as_basic_value()
            .left()
            .unwrap()
            .into_pointer_value();
            for (index, cell) in patches {
                let slot = unsafe {
                    build_ok(
                        self.builder.build_gep(
                            self.ptr_t,
                            pack_base,
                            &[self.i32_t.const_int(index as u64, false)],
                            "pack_slot",
                        ),
                        "pack slot",
                    )
                };
                build_ok(self.builder.build_store(slot, cell), "fill pack entry");
            }
        }

        closure_value
    }

    /// Truthiness: everything but null and the false singleton is truthy.
    pub(crate) fn is_falsy(&self, value: IntValue<'ctx>) -> IntValue<'ctx> {
        let is_null = build_ok(
            self.builder.build_int_compare(
                inkwell::IntPredicate::EQ,
                value,
                self.null_value,
                "is_null",
            ),
            "null test",
        );
        let false_value = build_ok(
            self.builder.build_load(
                self.value_t,
                self.false_global.as_pointer_value(),
                "false_value",
            ),
            "load false",
        )
        .into_int_value();
        let is_false = build_ok(
            self.builder.build_int_compare(
                inkwell::IntPredicate::EQ,
                value,
                false_value,
                "is_false",
            ),
            "false test",
        );
        build_ok(self.builder.build_or(is_null, is_false, "is_falsy"), "falsy or")
    }

    /// Field access is only defined on the current method's receiver.
    fn expect_receiver_object(&self, _ctx: &FnCtx<'ctx>, object: &Expr) {
        if !matches!(object, Expr::LoadReceiver) {
            internal_error("field access on a non-receiver object");
        }
    }
}
