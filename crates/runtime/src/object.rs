//! Heap objects and classes.
//!
//! Every heap object starts with an [`Obj`] header: a single class
//! pointer. Classes are objects themselves; a class's class is its
//! metaclass, and the root `Class` class is its own metaclass. Method
//! tables live on the class, keyed by signature ID; representation
//! variants exist only where layout actually differs (strings, lists,
//! ranges, closures, managed instances).
//!
//! Objects are allocated once and never reclaimed: the language has no
//! collector (reference-counted upvalue cells are the one carve-out, in
//! `closure.rs`).

use std::collections::HashMap;
use std::ffi::c_void;

use crate::value::Value;

/// The common header. `#[repr(C)]` because emitted code reads the class
/// word through a raw pointer.
#[repr(C)]
pub struct Obj {
    pub class: *mut ObjClass,
}

/// A native method entry point, cast to its true signature at call time.
pub type NativeFn = *const c_void;

/// Method table: signature ID to function pointer. ID 0 is never a valid
/// key.
#[derive(Default)]
pub struct FunctionTable {
    entries: HashMap<u64, NativeFn>,
}

impl FunctionTable {
    pub fn add(&mut self, signature: u64, func: NativeFn) {
        self.entries.insert(signature, func);
    }

    pub fn get(&self, signature: u64) -> Option<NativeFn> {
        self.entries.get(&signature).copied()
    }
}

/// Extra layout data for classes whose instances are field blocks
/// allocated by `wren_alloc_obj`.
pub struct ManagedLayout {
    pub field_names: Vec<String>,
    /// Byte offset of this class's first field from the object pointer.
    pub field_offset: u32,
    /// Total instance size in bytes, all inherited fields included.
    pub size: usize,
}

#[repr(C)]
pub struct ObjClass {
    pub obj: Obj,
    pub name: String,
    pub parent: *mut ObjClass,
    pub methods: FunctionTable,
    /// Whether method lookup continues into `parent`. False for Num:
    /// numbers are not real objects and their pseudo-class stands alone.
    pub inherits_methods: bool,
    pub is_metaclass: bool,
    /// Present on classes created by `wren_init_class`.
    pub managed: Option<ManagedLayout>,
}

impl ObjClass {
    pub fn new(name: impl Into<String>) -> ObjClass {
        ObjClass {
            obj: Obj { class: std::ptr::null_mut() },
            name: name.into(),
            parent: std::ptr::null_mut(),
            methods: FunctionTable::default(),
            inherits_methods: true,
            is_metaclass: false,
            managed: None,
        }
    }

    /// Allocate a class on the heap; class objects live for the process.
    pub fn boxed(self) -> *mut ObjClass {
        Box::into_raw(Box::new(self))
    }

    /// Walk the inheritance chain for a method, stopping where a class
    /// declines to inherit.
    pub fn lookup_method(&self, signature: u64) -> Option<NativeFn> {
        let mut class: *const ObjClass = self;
        loop {
            let current = unsafe { &*class };
            if let Some(func) = current.methods.get(signature) {
                return Some(func);
            }
            if !current.inherits_methods || current.parent.is_null() {
                return None;
            }
            class = current.parent;
        }
    }

    pub fn to_value(class: *mut ObjClass) -> Value {
        Value::object(class as *mut Obj)
    }
}

/// A heap string. Subscripting is byte-indexed, not codepoint-indexed; a
/// byte that is not valid UTF-8 on its own comes back as the replacement
/// character.
#[repr(C)]
pub struct ObjString {
    pub obj: Obj,
    pub value: String,
}

#[repr(C)]
pub struct ObjList {
    pub obj: Obj,
    pub items: Vec<Value>,
}

#[repr(C)]
pub struct ObjRange {
    pub obj: Obj,
    pub from: f64,
    pub to: f64,
    pub inclusive: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lookup_walks_parents_unless_disinherited() {
        let sig = wren_abi::signature_id("size");
        let mut parent = ObjClass::new("Parent");
        parent.methods.add(sig, 0x1 as NativeFn);
        let parent = parent.boxed();

        let mut child = ObjClass::new("Child");
        child.parent = parent;
        let child_ref = unsafe { &mut *child.boxed() };
        assert!(child_ref.lookup_method(sig).is_some());

        child_ref.inherits_methods = false;
        assert!(child_ref.lookup_method(sig).is_none());
    }
}
