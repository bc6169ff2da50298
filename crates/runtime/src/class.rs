//! Managed classes: the ones compiled modules declare.
//!
//! `wren_init_class` parses the class-description block a module bakes
//! into its constants (see `wren_abi::class_desc` for the command words),
//! builds the class and its metaclass, and registers methods on the right
//! side of that pair. Instances are a class pointer followed by a
//! contiguous field block; a subclass's fields sit after all inherited
//! ones, which is why field access in emitted code goes through the
//! per-class field offset loaded at startup.

use std::ffi::{CStr, c_char};
use std::io::Write;

use wren_abi::class_desc;

use crate::core::runtime;
use crate::dispatch::find_signature_id;
use crate::object::{ManagedLayout, NativeFn, Obj, ObjClass};
use crate::value::{NULL_VAL, Value};

fn runtime_abort(message: &str) -> ! {
    let _ = writeln!(std::io::stderr(), "{message}");
    std::process::abort();
}

struct ParsedMethod {
    canonical: String,
    func: NativeFn,
    is_static: bool,
}

struct ParsedDescription {
    methods: Vec<ParsedMethod>,
    fields: Vec<String>,
    /// Slot holding the superclass object, read at parse time. Absent
    /// means the class extends Object.
    supertype_slot: Option<*const Value>,
}

/// Walk the 64-bit command words of a description block.
fn parse_description(mut cursor: *const u64) -> ParsedDescription {
    let mut parsed = ParsedDescription {
        methods: Vec::new(),
        fields: Vec::new(),
        supertype_slot: None,
    };
    unsafe {
        loop {
            let (command, flags) = class_desc::split_word(*cursor);
            cursor = cursor.add(1);
            match command {
                class_desc::END => break,
                class_desc::ADD_METHOD => {
                    let name = *cursor as *const c_char;
                    cursor = cursor.add(1);
                    let func = *cursor as NativeFn;
                    cursor = cursor.add(1);
                    parsed.methods.push(ParsedMethod {
                        canonical: CStr::from_ptr(name).to_string_lossy().into_owned(),
                        func,
                        is_static: flags & class_desc::FLAG_STATIC != 0,
                    });
                }
                class_desc::ADD_FIELD => {
                    let name = *cursor as *const c_char;
                    cursor = cursor.add(1);
                    parsed
                        .fields
                        .push(CStr::from_ptr(name).to_string_lossy().into_owned());
                }
                class_desc::SUPERTYPE => {
                    parsed.supertype_slot = Some(*cursor as *const Value);
                    cursor = cursor.add(1);
                }
                other => runtime_abort(&format!(
                    "Unknown command {other} in class description block"
                )),
            }
        }
    }
    parsed
}

/// Build a class from its description block.
#[unsafe(no_mangle)]
pub extern "C" fn wren_init_class(name: *const c_char, description: *mut u8) -> Value {
    let rt = runtime();
    let name = unsafe { CStr::from_ptr(name) }.to_string_lossy().into_owned();
    let ParsedDescription { methods, fields, supertype_slot } =
        parse_description(description as *const u64);

    let parent = match supertype_slot {
        None => rt.object_class,
        Some(slot) => {
            let supertype = unsafe { *slot };
            if !supertype.is_object() || supertype.is_null() {
                runtime_abort(&format!("Supertype of class {name} is not a class"));
            }
            supertype.as_object() as *mut ObjClass
        }
    };

    // Fields start where the parent's instance layout ends.
    let parent_size = unsafe {
        match &(*parent).managed {
            Some(layout) => layout.size,
            None => std::mem::size_of::<Obj>(),
        }
    };
    let size = parent_size + fields.len() * std::mem::size_of::<Value>();

    let mut meta = ObjClass::new(format!("{name} metaclass"));
    meta.is_metaclass = true;
    meta.parent = rt.class_class;
    meta.obj.class = rt.class_class;
    let meta = meta.boxed();

    let mut class = ObjClass::new(name);
    class.parent = parent;
    class.obj.class = meta;
    class.managed = Some(ManagedLayout {
        field_names: fields,
        field_offset: parent_size as u32,
        size,
    });
    let class = class.boxed();

    for method in methods {
        let signature = find_signature_id(&method.canonical);
        let target = if method.is_static { meta } else { class };
        unsafe { (*target).methods.add(signature, method.func) };
    }

    ObjClass::to_value(class)
}

/// Allocate a zeroed instance of a managed class; every field starts null.
#[unsafe(no_mangle)]
pub extern "C" fn wren_alloc_obj(class_value: Value) -> Value {
    if !class_value.is_object() || class_value.is_null() {
        runtime_abort("Cannot call wren_alloc_obj with a non-class argument");
    }
    let class = class_value.as_object() as *mut ObjClass;
    let layout = unsafe {
        match &(*class).managed {
            Some(layout) => layout,
            None => runtime_abort(&format!(
                "Cannot allocate an instance of non-managed class {}",
                (*class).name
            )),
        }
    };

    unsafe {
        let memory = libc::malloc(layout.size) as *mut u8;
        if memory.is_null() {
            runtime_abort("Out of memory allocating an instance");
        }
        let obj = memory as *mut Obj;
        (*obj).class = class;
        // Null-initialise the whole field area, inherited fields included.
        let mut slot = memory.add(std::mem::size_of::<Obj>()) as *mut Value;
        let end = memory.add(layout.size) as *mut Value;
        while slot < end {
            *slot = NULL_VAL;
            slot = slot.add(1);
        }
        Value::object(obj)
    }
}

#[unsafe(no_mangle)]
pub extern "C" fn wren_class_get_field_offset(class_value: Value) -> i32 {
    if !class_value.is_object() || class_value.is_null() {
        runtime_abort("Cannot call wren_class_get_field_offset with a non-class argument");
    }
    let class = class_value.as_object() as *mut ObjClass;
    unsafe {
        match &(*class).managed {
            Some(layout) => layout.field_offset as i32,
            None => runtime_abort(&format!(
                "Class {} has no managed field layout",
                (*class).name
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::ffi::CString;

    extern "C" fn stub_method(receiver: Value) -> Value {
        receiver
    }

    fn build_description(
        methods: &[(&CString, bool)],
        fields: &[&CString],
    ) -> Vec<u64> {
        let mut words = Vec::new();
        for (name, is_static) in methods {
            let flags = if *is_static { class_desc::FLAG_STATIC } else { 0 };
            words.push(class_desc::command_word(class_desc::ADD_METHOD, flags));
            words.push(name.as_ptr() as u64);
            words.push(stub_method as usize as u64);
        }
        for name in fields {
            words.push(class_desc::command_word(class_desc::ADD_FIELD, 0));
            words.push(name.as_ptr() as u64);
        }
        words.push(class_desc::command_word(class_desc::END, 0));
        words
    }

    #[test]
    fn init_class_registers_methods_and_layout() {
        let getter = CString::new("width").unwrap();
        let maker = CString::new("new()").unwrap();
        let field_w = CString::new("_width").unwrap();
        let field_h = CString::new("_height").unwrap();
        let mut block = build_description(
            &[(&getter, false), (&maker, true)],
            &[&field_w, &field_h],
        );

        let name = CString::new("Rect").unwrap();
        let value = wren_init_class(name.as_ptr(), block.as_mut_ptr() as *mut u8);

        let class = value.as_object() as *mut ObjClass;
        unsafe {
            assert_eq!((*class).name, "Rect");
            let layout = (*class).managed.as_ref().unwrap();
            assert_eq!(layout.field_names.len(), 2);
            assert_eq!(layout.field_offset, std::mem::size_of::<Obj>() as u32);

            // Instance method on the class, static on the metaclass.
            assert!((*class).lookup_method(wren_abi::signature_id("width")).is_some());
            assert!((*class).lookup_method(wren_abi::signature_id("new()")).is_none());
            let meta = (*class).obj.class;
            assert!((*meta).lookup_method(wren_abi::signature_id("new()")).is_some());
        }
        assert_eq!(wren_class_get_field_offset(value), std::mem::size_of::<Obj>() as i32);
    }

    #[test]
    fn subclasses_stack_their_fields_after_inherited_ones() {
        let field_base = CString::new("_base").unwrap();
        let mut base_block = build_description(&[], &[&field_base]);
        let base_name = CString::new("Base").unwrap();
        // The supertype slot a module would store the base class into.
        let base_value = wren_init_class(base_name.as_ptr(), base_block.as_mut_ptr() as *mut u8);

        let field_extra = CString::new("_extra").unwrap();
        let mut child_block = Vec::new();
        child_block.push(class_desc::command_word(class_desc::SUPERTYPE, 0));
        child_block.push(&base_value as *const Value as u64);
        child_block.push(class_desc::command_word(class_desc::ADD_FIELD, 0));
        child_block.push(field_extra.as_ptr() as u64);
        child_block.push(class_desc::command_word(class_desc::END, 0));

        let child_name = CString::new("Child").unwrap();
        let child_value = wren_init_class(child_name.as_ptr(), child_block.as_mut_ptr() as *mut u8);

        let base_offset = wren_class_get_field_offset(base_value);
        let child_offset = wren_class_get_field_offset(child_value);
        assert_eq!(
            child_offset as usize,
            base_offset as usize + std::mem::size_of::<Value>()
        );
        unsafe {
            let child = child_value.as_object() as *mut ObjClass;
            assert_eq!((*child).parent, base_value.as_object() as *mut ObjClass);
        }
    }

    #[test]
    fn alloc_obj_null_initialises_fields() {
        let field = CString::new("_x").unwrap();
        let mut block = build_description(&[], &[&field]);
        let name = CString::new("Holder").unwrap();
        let class_value = wren_init_class(name.as_ptr(), block.as_mut_ptr() as *mut u8);

        let instance = wren_alloc_obj(class_value);
        unsafe {
            let obj = instance.as_object();
            let field_ptr = (obj as *mut u8).add(wren_class_get_field_offset(class_value) as usize)
                as *mut Value;
            assert!((*field_ptr).is_null());
        }
    }
}
