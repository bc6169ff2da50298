//! The per-module initializer.
//!
//! `module_init` is private to the module and runs before the main
//! function's body. It: populates the system-variable globals and the
//! boolean singletons, constructs one string object per unique literal,
//! registers every closure's spec with the runtime, initialises the
//! module's classes (loading each one's field offset), and registers the
//! signatures table. Named modules also emit a `<name>_get_globals`
//! function returning their variable table for the import machinery.

use inkwell::module::Linkage;
use inkwell::values::{BasicValueEnum, IntValue, PointerValue};

use crate::diagnostics::internal_error;
use crate::ir::{ClassId, VarRef};
use wren_abi::class_desc;

use super::{CodeGen, build_ok};

impl<'ctx> CodeGen<'ctx, '_> {
    pub(crate) fn emit_initializer(&self) {
        let entry = self.context.append_basic_block(self.init_fn, "entry");
        self.builder.position_at_end(entry);

        // System variables, by string lookup.
        let get_core = self.get_core_class_value();
        for name in self.system_var_names_used() {
            let global = self.system_var(&name);
            let value = build_ok(
                self.builder.build_call(
                    get_core,
                    &[self.string_const(&name).into()],
                    &format!("var_{name}"),
                ),
                "core class lookup",
            )
            .try_as_basic_value()
            .left()
            .unwrap();
            build_ok(
                self.builder.build_store(global.as_pointer_value(), value),
                "store system var",
            );
        }

        // The boolean singletons.
        let get_bool = self.get_bool_value_fn();
        let true_value = build_ok(
            self.builder
                .build_call(get_bool, &[self.i8_t.const_int(1, false).into()], "true_value"),
            "get true",
        )
        .try_as_basic_value()
        .left()
        .unwrap();
        build_ok(
            self.builder
                .build_store(self.true_global.as_pointer_value(), true_value),
            "store true",
        );
        let false_value = build_ok(
            self.builder
                .build_call(get_bool, &[self.i8_t.const_int(0, false).into()], "false_value"),
            "get false",
        )
        .try_as_basic_value()
        .left()
        .unwrap();
        build_ok(
            self.builder
                .build_store(self.false_global.as_pointer_value(), false_value),
            "store false",
        );

        // String literal objects, one per unique literal.
        let init_string = self.get_init_string_literal();
        for contents in self.managed_string_names() {
            let global = self.managed_string_global(&contents);
            let value = build_ok(
                self.builder.build_call(
                    init_string,
                    &[
                        self.string_const(&contents).into(),
                        self.i32_t.const_int(contents.len() as u64, false).into(),
                    ],
                    "strlit",
                ),
                "init string literal",
            )
            .try_as_basic_value()
            .left()
            .unwrap();
            build_ok(
                self.builder.build_store(global.as_pointer_value(), value),
                "store string literal",
            );
        }

        self.register_closure_specs();
        self.init_classes();
        self.register_signatures_table();

        build_ok(self.builder.build_return(None), "initializer return");

        self.emit_get_globals();
    }

    /// Build each closure's constant spec block and register it, storing
    /// the runtime handle into the closure's `spec_` global.
    fn register_closure_specs(&self) {
        let register = self.get_register_closure();
        for fn_id in self.ir.closure_fns() {
            let func = self.ir.func(fn_id);
            let pack = self
                .plan
                .pack(fn_id)
                .unwrap_or_else(|| internal_error("closure without a planned pack"));

            let mut indices: Vec<IntValue> = Vec::with_capacity(pack.variables.len());
            for &upvalue in &pack.variables {
                let index = match self.ir.upvalue(upvalue).parent {
                    VarRef::Local(local) => {
                        if self.plan.is_heap_promoted(local) {
                            wren_abi::SPEC_INDEX_CREATOR_FILLED
                        } else {
                            let owner = self.ir.local(local).owner;
                            let position =
                                self.closed_positions[&owner].get(&local).copied().unwrap_or_else(
                                    || {
                                        internal_error(&format!(
                                            "function '{}' doesn't have closeable local '{}', used by closure '{}'",
                                            self.ir.func(owner).debug_name,
                                            self.ir.local(local).name,
                                            func.debug_name,
                                        ))
                                    },
                                );
                            position as u32
                        }
                    }
                    VarRef::Upvalue(parent_upvalue) => {
                        // The cell arrives through our parent's pack; the
                        // creating function fills the entry. The payload
                        // records the parent position for diagnostics.
                        let parent_fn = func
                            .parent
                            .unwrap_or_else(|| internal_error("closure without a parent"));
                        let parent_pack = self
                            .plan
                            .pack(parent_fn)
                            .and_then(|p| p.index_of(parent_upvalue))
                            .unwrap_or(0);
                        parent_pack as u32 | wren_abi::SPEC_INDEX_CREATOR_FILLED
                    }
                    VarRef::Global(_) => internal_error("upvalue with a global parent"),
                };
                indices.push(self.i32_t.const_int(index as u64, false));
            }

            let fn_ptr = self.fn_values[&fn_id].as_global_value().as_pointer_value();
            let name_ptr = self.string_const(&func.debug_name);
            let mut members: Vec<BasicValueEnum> = vec![
                fn_ptr.into(),
                name_ptr.into(),
                self.i32_t.const_int(func.arity() as u64, false).into(),
                self.i32_t
                    .const_int(pack.variables.len() as u64, false)
                    .into(),
            ];
            members.extend(indices.iter().map(|&i| BasicValueEnum::from(i)));
            let spec_const = self.context.const_struct(&members, false);

            let data = self.module.add_global(
                spec_const.get_type(),
                None,
                &format!("closure_spec_{}", func.debug_name),
            );
            data.set_linkage(Linkage::Private);
            data.set_constant(true);
            data.set_initializer(&spec_const);

            let handle = build_ok(
                self.builder.build_call(
                    register,
                    &[data.as_pointer_value().into()],
                    &func.debug_name,
                ),
                "register closure",
            )
            .try_as_basic_value()
            .left()
            .unwrap();
            build_ok(
                self.builder
                    .build_store(self.spec_globals[&fn_id].as_pointer_value(), handle),
                "store closure spec",
            );
        }
    }

    /// Initialise every class: build its description block, construct the
    /// class object (superclasses come first in declaration order, so the
    /// block's supertype slot is already populated), and load the field
    /// offset.
    fn init_classes(&self) {
        if self.ir.classes.is_empty() {
            return;
        }
        let init_class = self.get_init_class();
        let field_offset = self.get_class_field_offset();

        for (index, class) in self.ir.classes.iter().enumerate() {
            let class_id = ClassId(index as u32);

            let mut words: Vec<IntValue> = Vec::new();
            if let Some(parent) = class.parent {
                words.push(
                    self.i64_t
                        .const_int(class_desc::command_word(class_desc::SUPERTYPE, 0), false),
                );
                words.push(
                    self.class_objects[&parent]
                        .as_pointer_value()
                        .const_to_int(self.i64_t),
                );
            }
            for method in &class.methods {
                let flags = if method.is_static { class_desc::FLAG_STATIC } else { 0 };
                words.push(
                    self.i64_t
                        .const_int(class_desc::command_word(class_desc::ADD_METHOD, flags), false),
                );
                words.push(
                    self.string_const(&method.signature.canonical())
                        .const_to_int(self.i64_t),
                );
                words.push(
                    self.fn_values[&method.func]
                        .as_global_value()
                        .as_pointer_value()
                        .const_to_int(self.i64_t),
                );
                // Method bodies dispatch through the table like any call
                // site; their signatures belong in the table too.
                let canonical = method.signature.canonical();
                self.registry.borrow_mut().find(&canonical);
                self.signatures_used.borrow_mut().insert(canonical);
            }
            for field in &class.fields {
                words.push(
                    self.i64_t
                        .const_int(class_desc::command_word(class_desc::ADD_FIELD, 0), false),
                );
                words.push(self.string_const(field).const_to_int(self.i64_t));
            }
            words.push(
                self.i64_t
                    .const_int(class_desc::command_word(class_desc::END, 0), false),
            );

            let block_const = self.i64_t.const_array(&words);
            let block = self.module.add_global(
                block_const.get_type(),
                None,
                &format!("class_data_{}", class.name),
            );
            block.set_linkage(Linkage::Private);
            block.set_constant(true);
            block.set_initializer(&block_const);

            let class_value = build_ok(
                self.builder.build_call(
                    init_class,
                    &[
                        self.string_const(&class.name).into(),
                        block.as_pointer_value().into(),
                    ],
                    &format!("class_{}", class.name),
                ),
                "init class",
            )
            .try_as_basic_value()
            .left()
            .unwrap();
            build_ok(
                self.builder
                    .build_store(self.class_objects[&class_id].as_pointer_value(), class_value),
                "store class object",
            );

            let offset = build_ok(
                self.builder.build_call(
                    field_offset,
                    &[class_value.into_int_value().into()],
                    &format!("field_offset_{}", class.name),
                ),
                "field offset",
            )
            .try_as_basic_value()
            .left()
            .unwrap();
            build_ok(
                self.builder.build_store(
                    self.class_field_offsets[&class_id].as_pointer_value(),
                    offset,
                ),
                "store field offset",
            );

            if let Some(output) = class.output {
                build_ok(
                    self.builder
                        .build_store(self.global_var(output).as_pointer_value(), class_value),
                    "store class variable",
                );
            }
        }
    }

    /// A concatenated list of NUL-terminated canonical strings, with one
    /// final NUL; the runtime pre-interns them so diagnostics can name
    /// methods by ID.
    fn register_signatures_table(&self) {
        let mut bytes: Vec<u8> = Vec::new();
        for canonical in self.signatures_used.borrow().iter() {
            bytes.extend_from_slice(canonical.as_bytes());
            bytes.push(0);
        }
        bytes.push(0);

        let table_const = self.context.const_string(&bytes, false);
        let table = self
            .module
            .add_global(table_const.get_type(), None, "signatures_table");
        table.set_linkage(Linkage::Private);
        table.set_constant(true);
        table.set_initializer(&table_const);

        build_ok(
            self.builder.build_call(
                self.get_register_signatures_table(),
                &[table.as_pointer_value().into()],
                "",
            ),
            "register signatures",
        );
    }

    /// `<name>_get_globals`: a null-terminated table of (name, slot)
    /// pointer pairs. Only named modules can be imported, so only they
    /// emit one. The name is part of the ABI.
    fn emit_get_globals(&self) {
        let Some(module_name) = &self.ir.name else {
            return;
        };
        let fn_type = self.ptr_t.fn_type(&[], false);
        let function = self
            .module
            .add_function(&format!("{module_name}_get_globals"), fn_type, None);
        let entry = self.context.append_basic_block(function, "entry");
        self.builder.position_at_end(entry);

        let mut components: Vec<PointerValue> = Vec::new();
        for (index, global) in self.ir.globals.iter().enumerate() {
            components.push(self.string_const(&global.name));
            components.push(
                self.global_var(crate::ir::GlobalId(index as u32))
                    .as_pointer_value(),
            );
        }
        components.push(self.ptr_t.const_null());

        let table_const = self.ptr_t.const_array(&components);
        let table = self
            .module
            .add_global(table_const.get_type(), None, "globals_table");
        table.set_linkage(Linkage::Private);
        table.set_constant(true);
        table.set_initializer(&table_const);

        build_ok(
            self.builder.build_return(Some(&table.as_pointer_value())),
            "get_globals return",
        );
    }
}
