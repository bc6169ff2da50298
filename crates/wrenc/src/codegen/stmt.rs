//! Statement lowering, including the upvalue relocation state machine.

use inkwell::IntPredicate;
use inkwell::basic_block::BasicBlock;
use inkwell::values::IntValue;

use crate::diagnostics::internal_error;
use crate::ir::{FnId, LabelId, LocalId, Stmt, VarRef};

use super::{CodeGen, FnCtx, build_ok};

impl<'ctx> CodeGen<'ctx, '_> {
    pub(crate) fn lower_stmt(&self, ctx: &mut FnCtx<'ctx>, stmt: &Stmt) {
        match stmt {
            Stmt::Assign { var, value } => {
                let value = self.lower_expr(ctx, value);
                let ptr = match *var {
                    VarRef::Local(local) => self.local_pointer(ctx, local),
                    VarRef::Upvalue(upvalue) => self.upvalue_pointer(ctx, upvalue),
                    VarRef::Global(global) => self.global_var(global).as_pointer_value(),
                };
                build_ok(self.builder.build_store(ptr, value), "store variable");
            }
            Stmt::FieldAssign { field, object, value } => {
                if !matches!(object, crate::ir::Expr::LoadReceiver) {
                    internal_error("field assignment on a non-receiver object");
                }
                let value = self.lower_expr(ctx, value);
                let base = ctx
                    .field_pointer
                    .unwrap_or_else(|| internal_error("field assignment outside a method"));
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
                build_ok(self.builder.build_store(slot, value), "store field");
            }
            Stmt::EvalAndIgnore(expr) => {
                self.lower_expr(ctx, expr);
            }
            Stmt::Block(stmts) => {
                for s in stmts {
                    self.lower_stmt(ctx, s);
                }
            }
            Stmt::Label(label) => {
                let block = self.label_block(ctx, *label);
                // Fall through into the labelled block unless the previous
                // statement already branched away.
                self.ensure_branch(block);
                self.builder.position_at_end(block);
            }
            Stmt::Jump { target, condition, jump_on_false, .. } => {
                self.lower_jump(ctx, *target, condition.as_ref(), *jump_on_false);
            }
            Stmt::Return(expr) => {
                let value = self.lower_expr(ctx, expr);
                build_ok(self.builder.build_return(Some(&value)), "return");
                self.start_dead_block(ctx);
            }
            Stmt::LoadModule { module, .. } => {
                internal_error(&format!(
                    "module loading is not lowered by this backend (import of '{module}')"
                ));
            }
            Stmt::BeginUpvalues(scope) => {
                // Heap-promoted locals get a fresh cell each time their
                // scope is entered; loop iterations must not share cells.
                for &local in &self.ir.scope(*scope).locals {
                    if !self.plan.is_heap_promoted(local) {
                        continue;
                    }
                    let slot = ctx.heap_cell_slots.get(&local).copied().unwrap_or_else(|| {
                        internal_error(&format!(
                            "heap cell slot missing for '{}'",
                            self.ir.local(local).name
                        ))
                    });
                    let cell = build_ok(
                        self.builder.build_call(
                            self.get_alloc_upvalue_storage(),
                            &[self.i32_t.const_int(1, false).into()],
                            &format!("cell_{}", self.ir.local(local).name),
                        ),
                        "alloc cell",
                    )
                    .try_as_basic_value()
                    .left()
                    .unwrap()
                    .into_pointer_value();
                    build_ok(self.builder.build_store(slot, cell), "store cell pointer");
                }
            }
            Stmt::RelocateUpvalues(locals) => self.lower_relocate(ctx, locals),
            Stmt::UpvalueImport(_) => {}
        }
    }

    fn label_block(&self, ctx: &mut FnCtx<'ctx>, label: LabelId) -> BasicBlock<'ctx> {
        if let Some(&block) = ctx.label_blocks.get(&label) {
            return block;
        }
        let name = format!("lbl_{}", self.ir.label(label).debug_name);
        let block = self.context.append_basic_block(ctx.function, &name);
        ctx.label_blocks.insert(label, block);
        block
    }

    /// Park the builder in a fresh block after a terminator; any trailing
    /// statements land there, and the next label (or the implicit return)
    /// terminates it.
    fn start_dead_block(&self, ctx: &mut FnCtx<'ctx>) {
        let block = self.context.append_basic_block(ctx.function, "post");
        self.builder.position_at_end(block);
    }

    fn lower_jump(
        &self,
        ctx: &mut FnCtx<'ctx>,
        target: LabelId,
        condition: Option<&crate::ir::Expr>,
        jump_on_false: bool,
    ) {
        let target_block = self.label_block(ctx, target);
        let Some(condition) = condition else {
            build_ok(
                self.builder.build_unconditional_branch(target_block),
                "jump",
            );
            self.start_dead_block(ctx);
            return;
        };

        let value = self.lower_expr(ctx, condition);
        let falsy = self.is_falsy(value);
        let fallthrough = self.context.append_basic_block(ctx.function, "fallthrough");

        // Truthy takes the jump; `jump_on_false` inverts that. The branch
        // condition is the falsy bit, so the operands read swapped.
        let (on_falsy, on_truthy) = if jump_on_false {
            (target_block, fallthrough)
        } else {
            (fallthrough, target_block)
        };
        build_ok(
            self.builder.build_conditional_branch(falsy, on_falsy, on_truthy),
            "conditional jump",
        );
        self.builder.position_at_end(fallthrough);
    }

    /// The relocation state machine:
    ///
    /// ```text
    /// check -> allocate -> sweep_fn[0] -> … -> sweep_fn[k-1] -> done
    /// ```
    ///
    /// `check` skips everything when no instance of any relevant closure
    /// exists. `allocate` grabs heap storage and copies the current cell
    /// values. Each `sweep_fn[i]` walks one closure's instance list and
    /// rewrites pack entries that point into the frame's closable array —
    /// instances from earlier scope entries fail the address compare and
    /// keep their own (already relocated) cells.
    fn lower_relocate(&self, ctx: &mut FnCtx<'ctx>, locals: &[LocalId]) {
        let positions = &self.closed_positions[&ctx.fn_id];
        let relocated: Vec<LocalId> = locals
            .iter()
            .copied()
            .filter(|l| positions.contains_key(l))
            .collect();
        if relocated.is_empty() {
            return;
        }

        // Closures whose instances can point at these cells.
        let sweep_fns: Vec<FnId> = self
            .ir
            .func(ctx.fn_id)
            .closures
            .iter()
            .copied()
            .filter(|closure| {
                ctx.chain_heads.contains_key(closure)
                    && self.ir.func(*closure).upvalues.iter().any(|&uv| {
                        matches!(
                            self.ir.upvalue(uv).parent,
                            VarRef::Local(l) if relocated.contains(&l)
                        )
                    })
            })
            .collect();
        if sweep_fns.is_empty() {
            return;
        }

        let array = ctx
            .closable_array
            .unwrap_or_else(|| internal_error("relocation without a closable array"));

        let allocate_block = self.context.append_basic_block(ctx.function, "relocate");
        let done_block = self.context.append_basic_block(ctx.function, "relocate_done");

        // Fast path: all list heads null means no closure instance was
        // ever created, so the cells can die with the stack frame.
        let mut any_live: Option<IntValue> = None;
        for &closure in &sweep_fns {
            let head = build_ok(
                self.builder
                    .build_load(self.ptr_t, ctx.chain_heads[&closure], "head"),
                "load list head",
            )
            .into_pointer_value();
            let live = build_ok(
                self.builder.build_int_compare(
                    IntPredicate::NE,
                    build_ok(
                        self.builder.build_ptr_to_int(head, self.i64_t, "head_int"),
                        "head to int",
                    ),
                    self.i64_t.const_zero(),
                    "head_live",
                ),
                "head test",
            );
            any_live = Some(match any_live {
                None => live,
                Some(acc) => build_ok(self.builder.build_or(acc, live, "any_live"), "or heads"),
            });
        }
        build_ok(
            self.builder
                .build_conditional_branch(any_live.unwrap(), allocate_block, done_block),
            "fast path",
        );

        // Allocate the heap cells and copy the current values across.
        self.builder.position_at_end(allocate_block);
        let storage = build_ok(
            self.builder.build_call(
                self.get_alloc_upvalue_storage(),
                &[self.i32_t.const_int(relocated.len() as u64, false).into()],
                "upvalue_storage",
            ),
            "alloc storage",
        )
        .try_as_basic_value()
        .left()
        .unwrap()
        .into_pointer_value();
        for (heap_index, &local) in relocated.iter().enumerate() {
            let name = &self.ir.local(local).name;
            let src = unsafe {
                build_ok(
                    self.builder.build_gep(
                        self.value_t,
                        array,
                        &[self.i32_t.const_int(positions[&local] as u64, false)],
                        &format!("stack_{name}"),
                    ),
                    "stack slot",
                )
            };
            let value = build_ok(
                self.builder.build_load(self.value_t, src, &format!("val_{name}")),
                "load cell value",
            );
            let dst = unsafe {
                build_ok(
                    self.builder.build_gep(
                        self.value_t,
                        storage,
                        &[self.i32_t.const_int(heap_index as u64, false)],
                        &format!("heap_{name}"),
                    ),
                    "heap slot",
                )
            };
            build_ok(self.builder.build_store(dst, value), "copy cell value");
        }

        // Sweep each closure's instance list.
        for &closure in &sweep_fns {
            let debug_name = &self.ir.func(closure).debug_name;
            let setup_block = self
                .context
                .append_basic_block(ctx.function, &format!("sweep_setup_{debug_name}"));
            let loop_block = self
                .context
                .append_basic_block(ctx.function, &format!("sweep_loop_{debug_name}"));
            let next_block = self
                .context
                .append_basic_block(ctx.function, &format!("sweep_next_{debug_name}"));

            self.ensure_branch(setup_block);
            self.builder.position_at_end(setup_block);
            let head = build_ok(
                self.builder
                    .build_load(self.ptr_t, ctx.chain_heads[&closure], "head"),
                "load list head",
            )
            .into_pointer_value();
            let head_null = build_ok(self.builder.build_is_null(head, "head_null"), "null test");
            build_ok(
                self.builder
                    .build_conditional_branch(head_null, next_block, loop_block),
                "setup branch",
            );

            self.builder.position_at_end(loop_block);
            let current = build_ok(self.builder.build_phi(self.ptr_t, "instance"), "phi");
            current.add_incoming(&[(&head, setup_block)]);
            let current_ptr = current.as_basic_value().into_pointer_value();

            let pack_base = build_ok(
                self.builder.build_call(
                    self.get_closure_upvalue_pack(),
                    &[current_ptr.into()],
                    "pack",
                ),
                "get pack",
            )
            .try_as_basic_value()
            .left()
            .unwrap()
            .into_pointer_value();

            let pack = self
                .plan
                .pack(closure)
                .unwrap_or_else(|| internal_error("sweeping a closure with no pack"));
            for (entry_index, &upvalue) in pack.variables.iter().enumerate() {
                let VarRef::Local(local) = self.ir.upvalue(upvalue).parent else {
                    continue;
                };
                let Some(heap_index) = relocated.iter().position(|&l| l == local) else {
                    continue;
                };
                let slot = unsafe {
                    build_ok(
                        self.builder.build_gep(
                            self.ptr_t,
                            pack_base,
                            &[self.i32_t.const_int(entry_index as u64, false)],
                            "entry_slot",
                        ),
                        "pack entry slot",
                    )
                };
                let old = build_ok(
                    self.builder.build_load(self.ptr_t, slot, "entry"),
                    "load pack entry",
                )
                .into_pointer_value();
                let expected = unsafe {
                    build_ok(
                        self.builder.build_gep(
                            self.value_t,
                            array,
                            &[self.i32_t.const_int(positions[&local] as u64, false)],
                            "expected",
                        ),
                        "expected slot",
                    )
                };
                let old_int = build_ok(
                    self.builder.build_ptr_to_int(old, self.i64_t, "entry_int"),
                    "entry to int",
                );
                let expected_int = build_ok(
                    self.builder
                        .build_ptr_to_int(expected, self.i64_t, "expected_int"),
                    "expected to int",
                );
                let matches = build_ok(
                    self.builder
                        .build_int_compare(IntPredicate::EQ, old_int, expected_int, "points_here"),
                    "entry compare",
                );
                let replacement = unsafe {
                    build_ok(
                        self.builder.build_gep(
                            self.value_t,
                            storage,
                            &[self.i32_t.const_int(heap_index as u64, false)],
                            "heap_cell",
                        ),
                        "heap cell",
                    )
                };
                let updated = build_ok(
                    self.builder
                        .build_select(matches, replacement, old, "entry_new"),
                    "select entry",
                )
                .into_pointer_value();
                build_ok(self.builder.build_store(slot, updated), "rewrite pack entry");
            }

            let next = build_ok(
                self.builder.build_call(
                    self.get_closure_chain_next(),
                    &[current_ptr.into()],
                    "next",
                ),
                "chain next",
            )
            .try_as_basic_value()
            .left()
            .unwrap()
            .into_pointer_value();
            current.add_incoming(&[(&next, loop_block)]);
            let next_null = build_ok(self.builder.build_is_null(next, "next_null"), "null test");
            build_ok(
                self.builder
                    .build_conditional_branch(next_null, next_block, loop_block),
                "loop branch",
            );

            self.builder.position_at_end(next_block);
        }

        self.ensure_branch(done_block);
        self.builder.position_at_end(done_block);
    }
}
