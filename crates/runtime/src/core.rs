//! The runtime context and the intrinsic classes.
//!
//! Everything global lives in one `WrenRuntime` built on first use: the
//! core classes (with their metaclass cycle), the boolean singletons, and
//! the name table `wren_get_core_class_value` answers from. The root
//! `Class` class is its own metaclass; every other class points at a
//! dedicated metaclass whose class is `Class`. Back-references are patched
//! after construction rather than modelled as ownership.
//!
//! The intrinsic surface here is deliberately small: enough of Num, Bool,
//! String, List, Range, System, Fn and Object for compiled programs to
//! print, do arithmetic, build lists, iterate ranges and call functions.
//! Broader library coverage belongs to a standard library, not the
//! runtime.

use std::collections::HashMap;
use std::io::Write;
use std::sync::OnceLock;

use crate::closure::{self, ObjClosure};
use crate::dispatch::find_signature_id;
use crate::object::{NativeFn, Obj, ObjClass, ObjList, ObjRange, ObjString};
use crate::value::{NULL_VAL, Value};

#[repr(C)]
pub struct ObjBool {
    pub obj: Obj,
    pub value: bool,
}

pub struct WrenRuntime {
    core: HashMap<&'static str, Value>,
    pub true_value: Value,
    pub false_value: Value,
    pub object_class: *mut ObjClass,
    pub class_class: *mut ObjClass,
    pub num_class: *mut ObjClass,
    pub bool_class: *mut ObjClass,
    pub string_class: *mut ObjClass,
    pub list_class: *mut ObjClass,
    pub range_class: *mut ObjClass,
    pub fn_class: *mut ObjClass,
    pub system_class: *mut ObjClass,
}

// The runtime assumes a single execution context; the markers exist only
// so the context can sit in a OnceLock.
unsafe impl Send for WrenRuntime {}
unsafe impl Sync for WrenRuntime {}

static RUNTIME: OnceLock<WrenRuntime> = OnceLock::new();

pub fn runtime() -> &'static WrenRuntime {
    RUNTIME.get_or_init(build_runtime)
}

impl WrenRuntime {
    pub fn core_value(&self, name: &str) -> Option<Value> {
        self.core.get(name).copied()
    }
}

fn runtime_abort(message: &str) -> ! {
    let _ = writeln!(std::io::stderr(), "{message}");
    std::process::abort();
}

fn add_method(class: *mut ObjClass, canonical: &str, func: NativeFn) {
    let signature = find_signature_id(canonical);
    unsafe { (*class).methods.add(signature, func) };
}

fn metaclass_of(class: *mut ObjClass) -> *mut ObjClass {
    unsafe { (*class).obj.class }
}

/// Create a class plus its metaclass, wired into the core hierarchy.
fn make_core_class(
    name: &'static str,
    object_class: *mut ObjClass,
    class_class: *mut ObjClass,
) -> *mut ObjClass {
    let mut meta = ObjClass::new(format!("{name} metaclass"));
    meta.is_metaclass = true;
    meta.parent = class_class;
    meta.obj.class = class_class;
    let meta = meta.boxed();

    let mut class = ObjClass::new(name);
    class.parent = object_class;
    class.obj.class = meta;
    class.boxed()
}

fn build_runtime() -> WrenRuntime {
    // The root of the metaclass cycle: Class is its own metaclass.
    let class_class = ObjClass::new("Class").boxed();
    unsafe { (*class_class).obj.class = class_class };

    let object_class = {
        let mut meta = ObjClass::new("Object metaclass");
        meta.is_metaclass = true;
        meta.parent = class_class;
        meta.obj.class = class_class;
        let meta = meta.boxed();
        let mut class = ObjClass::new("Object");
        class.obj.class = meta;
        class.boxed()
    };
    unsafe { (*class_class).parent = object_class };

    let num_class = make_core_class("Num", object_class, class_class);
    // Numbers are not real objects; their pseudo-class stands alone so a
    // stray Object method never answers for a double.
    unsafe { (*num_class).inherits_methods = false };

    let bool_class = make_core_class("Bool", object_class, class_class);
    let string_class = make_core_class("String", object_class, class_class);
    let list_class = make_core_class("List", object_class, class_class);
    let range_class = make_core_class("Range", object_class, class_class);
    let fn_class = make_core_class("Fn", object_class, class_class);
    let system_class = make_core_class("System", object_class, class_class);

    let true_obj = Box::into_raw(Box::new(ObjBool {
        obj: Obj { class: bool_class },
        value: true,
    }));
    let false_obj = Box::into_raw(Box::new(ObjBool {
        obj: Obj { class: bool_class },
        value: false,
    }));

    // Object
    add_method(object_class, "==(_)", object_eq as NativeFn);
    add_method(object_class, "!=(_)", object_neq as NativeFn);
    add_method(object_class, "toString", object_to_string as NativeFn);

    // Num
    add_method(num_class, "+(_)", num_plus as NativeFn);
    add_method(num_class, "-(_)", num_minus as NativeFn);
    add_method(num_class, "*(_)", num_times as NativeFn);
    add_method(num_class, "/(_)", num_divide as NativeFn);
    add_method(num_class, "<(_)", num_lt as NativeFn);
    add_method(num_class, ">(_)", num_gt as NativeFn);
    add_method(num_class, "<=(_)", num_lte as NativeFn);
    add_method(num_class, ">=(_)", num_gte as NativeFn);
    add_method(num_class, "==(_)", object_eq as NativeFn);
    add_method(num_class, "!=(_)", object_neq as NativeFn);
    add_method(num_class, "..(_)", num_range_inclusive as NativeFn);
    add_method(num_class, "...(_)", num_range_exclusive as NativeFn);
    add_method(num_class, "toString", object_to_string as NativeFn);

    // Bool
    add_method(bool_class, "toString", object_to_string as NativeFn);

    // String
    add_method(string_class, "+(_)", string_plus as NativeFn);
    add_method(string_class, "[_]", string_subscript as NativeFn);
    add_method(string_class, "count", string_count as NativeFn);
    add_method(string_class, "toString", object_to_string as NativeFn);

    // List
    add_method(metaclass_of(list_class), "new()", list_new as NativeFn);
    add_method(list_class, "add(_)", list_add as NativeFn);
    add_method(list_class, "[_]", list_subscript as NativeFn);
    add_method(list_class, "[_]=(_)", list_subscript_set as NativeFn);
    add_method(list_class, "count", list_count as NativeFn);

    // Range
    add_method(range_class, "from", range_from as NativeFn);
    add_method(range_class, "to", range_to as NativeFn);
    add_method(range_class, "iterate(_)", range_iterate as NativeFn);
    add_method(range_class, "iteratorValue(_)", range_iterator_value as NativeFn);

    // Fn
    add_method(metaclass_of(fn_class), "new(_)", closure::fn_new as NativeFn);
    add_method(fn_class, "call()", closure::fn_call0 as NativeFn);
    add_method(fn_class, "call(_)", closure::fn_call1 as NativeFn);
    add_method(fn_class, "call(_,_)", closure::fn_call2 as NativeFn);
    add_method(fn_class, "call(_,_,_)", closure::fn_call3 as NativeFn);

    // System
    add_method(metaclass_of(system_class), "print()", system_print_blank as NativeFn);
    add_method(metaclass_of(system_class), "print(_)", system_print as NativeFn);

    let mut core: HashMap<&'static str, Value> = HashMap::new();
    core.insert("Object", ObjClass::to_value(object_class));
    core.insert("Class", ObjClass::to_value(class_class));
    core.insert("Num", ObjClass::to_value(num_class));
    core.insert("Bool", ObjClass::to_value(bool_class));
    core.insert("String", ObjClass::to_value(string_class));
    core.insert("List", ObjClass::to_value(list_class));
    core.insert("Range", ObjClass::to_value(range_class));
    core.insert("Fn", ObjClass::to_value(fn_class));
    core.insert("System", ObjClass::to_value(system_class));

    WrenRuntime {
        core,
        true_value: Value::object(true_obj as *mut Obj),
        false_value: Value::object(false_obj as *mut Obj),
        object_class,
        class_class,
        num_class,
        bool_class,
        string_class,
        list_class,
        range_class,
        fn_class,
        system_class,
    }
}

pub fn bool_value(value: bool) -> Value {
    let rt = runtime();
    if value { rt.true_value } else { rt.false_value }
}

pub fn new_string(contents: String) -> Value {
    let obj = Box::into_raw(Box::new(ObjString {
        obj: Obj { class: runtime().string_class },
        value: contents,
    }));
    Value::object(obj as *mut Obj)
}

/// Render a value the way `System.print` and `toString` do. Integral
/// numbers print without a decimal point.
pub fn display_string(value: Value) -> String {
    if value.is_num() {
        return format!("{}", value.as_num());
    }
    if value.is_null() {
        return "null".to_string();
    }
    let obj = value.as_object();
    let rt = runtime();
    let class = unsafe { (*obj).class };
    if class == rt.bool_class {
        let b = unsafe { &*(obj as *mut ObjBool) };
        return if b.value { "true" } else { "false" }.to_string();
    }
    if class == rt.string_class {
        return unsafe { (*(obj as *mut ObjString)).value.clone() };
    }
    if class == rt.range_class {
        let range = unsafe { &*(obj as *mut ObjRange) };
        let dots = if range.inclusive { ".." } else { "..." };
        return format!("{}{}{}", range.from, dots, range.to);
    }
    if class == rt.fn_class {
        let closure = unsafe { &*(obj as *mut ObjClosure) };
        return format!("<fn {}>", unsafe { &(*closure.spec).name });
    }
    if class == rt.list_class {
        let list = unsafe { &*(obj as *mut ObjList) };
        let items: Vec<String> = list.items.iter().map(|&v| display_string(v)).collect();
        return format!("[{}]", items.join(", "));
    }
    let class_ref = unsafe { &*class };
    if class_ref.is_metaclass || class == rt.class_class {
        // The object is itself a class; classes display as their name.
        let as_class = unsafe { &*(obj as *mut ObjClass) };
        return as_class.name.clone();
    }
    format!("instance of {}", class_ref.name)
}

// --- Object ---

extern "C" fn object_eq(receiver: Value, other: Value) -> Value {
    bool_value(receiver.0 == other.0)
}

extern "C" fn object_neq(receiver: Value, other: Value) -> Value {
    bool_value(receiver.0 != other.0)
}

extern "C" fn object_to_string(receiver: Value) -> Value {
    new_string(display_string(receiver))
}

// --- Num ---

fn num_operand(value: Value, operation: &str) -> f64 {
    if !value.is_num() {
        runtime_abort(&format!("Right operand of '{operation}' must be a number"));
    }
    value.as_num()
}

extern "C" fn num_plus(receiver: Value, rhs: Value) -> Value {
    Value::num(receiver.as_num() + num_operand(rhs, "+"))
}

extern "C" fn num_minus(receiver: Value, rhs: Value) -> Value {
    Value::num(receiver.as_num() - num_operand(rhs, "-"))
}

extern "C" fn num_times(receiver: Value, rhs: Value) -> Value {
    Value::num(receiver.as_num() * num_operand(rhs, "*"))
}

extern "C" fn num_divide(receiver: Value, rhs: Value) -> Value {
    Value::num(receiver.as_num() / num_operand(rhs, "/"))
}

extern "C" fn num_lt(receiver: Value, rhs: Value) -> Value {
    bool_value(receiver.as_num() < num_operand(rhs, "<"))
}

extern "C" fn num_gt(receiver: Value, rhs: Value) -> Value {
    bool_value(receiver.as_num() > num_operand(rhs, ">"))
}

extern "C" fn num_lte(receiver: Value, rhs: Value) -> Value {
    bool_value(receiver.as_num() <= num_operand(rhs, "<="))
}

extern "C" fn num_gte(receiver: Value, rhs: Value) -> Value {
    bool_value(receiver.as_num() >= num_operand(rhs, ">="))
}

fn new_range(from: f64, to: f64, inclusive: bool) -> Value {
    let obj = Box::into_raw(Box::new(ObjRange {
        obj: Obj { class: runtime().range_class },
        from,
        to,
        inclusive,
    }));
    Value::object(obj as *mut Obj)
}

extern "C" fn num_range_inclusive(receiver: Value, rhs: Value) -> Value {
    new_range(receiver.as_num(), num_operand(rhs, ".."), true)
}

extern "C" fn num_range_exclusive(receiver: Value, rhs: Value) -> Value {
    new_range(receiver.as_num(), num_operand(rhs, "..."), false)
}

// --- String ---

fn as_string<'a>(value: Value, what: &str) -> &'a ObjString {
    if !value.is_object() || value.is_null() {
        runtime_abort(&format!("{what} must be a string"));
    }
    let obj = value.as_object();
    if unsafe { (*obj).class } != runtime().string_class {
        runtime_abort(&format!("{what} must be a string"));
    }
    unsafe { &*(obj as *mut ObjString) }
}

extern "C" fn string_plus(receiver: Value, rhs: Value) -> Value {
    let left = as_string(receiver, "Receiver");
    let right = as_string(rhs, "Right operand of '+'");
    new_string(format!("{}{}", left.value, right.value))
}

extern "C" fn string_subscript(receiver: Value, index: Value) -> Value {
    let string = as_string(receiver, "Receiver");
    if !index.is_num() {
        runtime_abort("Subscript must be a number");
    }
    let index = index.as_num() as usize;
    let bytes = string.value.as_bytes();
    if index >= bytes.len() {
        runtime_abort(&format!(
            "Subscript {index} out of bounds for string of {} bytes",
            bytes.len()
        ));
    }
    // Byte-indexed: the subscript selects a byte, not a codepoint. Strings
    // store validated text, so a byte that is not valid UTF-8 on its own
    // surfaces as the replacement character rather than a widened Latin-1
    // codepoint.
    new_string(String::from_utf8_lossy(&bytes[index..index + 1]).into_owned())
}

extern "C" fn string_count(receiver: Value) -> Value {
    Value::num(as_string(receiver, "Receiver").value.len() as f64)
}

// --- List ---

fn as_list<'a>(value: Value) -> &'a mut ObjList {
    let obj = value.as_object();
    if obj.is_null() || unsafe { (*obj).class } != runtime().list_class {
        runtime_abort("Receiver must be a list");
    }
    unsafe { &mut *(obj as *mut ObjList) }
}

extern "C" fn list_new(_receiver: Value) -> Value {
    let obj = Box::into_raw(Box::new(ObjList {
        obj: Obj { class: runtime().list_class },
        items: Vec::new(),
    }));
    Value::object(obj as *mut Obj)
}

extern "C" fn list_add(receiver: Value, item: Value) -> Value {
    as_list(receiver).items.push(item);
    item
}

fn list_index(list: &ObjList, index: Value) -> usize {
    if !index.is_num() {
        runtime_abort("Subscript must be a number");
    }
    let index = index.as_num();
    if index < 0.0 || index as usize >= list.items.len() {
        runtime_abort(&format!(
            "Subscript {} out of bounds for list of count {}",
            index,
            list.items.len()
        ));
    }
    index as usize
}

extern "C" fn list_subscript(receiver: Value, index: Value) -> Value {
    let list = as_list(receiver);
    let index = list_index(list, index);
    list.items[index]
}

extern "C" fn list_subscript_set(receiver: Value, index: Value, item: Value) -> Value {
    let list = as_list(receiver);
    let index = list_index(list, index);
    list.items[index] = item;
    item
}

extern "C" fn list_count(receiver: Value) -> Value {
    Value::num(as_list(receiver).items.len() as f64)
}

// --- Range ---

fn as_range<'a>(value: Value) -> &'a ObjRange {
    let obj = value.as_object();
    if obj.is_null() || unsafe { (*obj).class } != runtime().range_class {
        runtime_abort("Receiver must be a range");
    }
    unsafe { &*(obj as *mut ObjRange) }
}

extern "C" fn range_from(receiver: Value) -> Value {
    Value::num(as_range(receiver).from)
}

extern "C" fn range_to(receiver: Value) -> Value {
    Value::num(as_range(receiver).to)
}

/// The iterator protocol: `iterate(null)` yields the first position,
/// `iterate(prev)` the next, and false when exhausted.
extern "C" fn range_iterate(receiver: Value, iterator: Value) -> Value {
    let range = as_range(receiver);
    let ascending = range.from <= range.to;

    let next = if iterator.is_null() {
        if range.from == range.to && !range.inclusive {
            return runtime().false_value;
        }
        range.from
    } else {
        if !iterator.is_num() {
            runtime_abort("Iterator must be a number");
        }
        let current = iterator.as_num();
        if ascending { current + 1.0 } else { current - 1.0 }
    };

    let in_bounds = match (ascending, range.inclusive) {
        (true, true) => next <= range.to,
        (true, false) => next < range.to,
        (false, true) => next >= range.to,
        (false, false) => next > range.to,
    };
    if in_bounds { Value::num(next) } else { runtime().false_value }
}

extern "C" fn range_iterator_value(_receiver: Value, iterator: Value) -> Value {
    iterator
}

// --- System ---

extern "C" fn system_print_blank(_receiver: Value) -> Value {
    println!();
    NULL_VAL
}

extern "C" fn system_print(_receiver: Value, value: Value) -> Value {
    println!("{}", display_string(value));
    value
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn class_is_its_own_metaclass() {
        let rt = runtime();
        unsafe {
            assert_eq!((*rt.class_class).obj.class, rt.class_class);
            assert_eq!((*(*rt.num_class).obj.class).parent, rt.class_class);
        }
    }

    #[test]
    fn num_does_not_inherit_methods() {
        let rt = runtime();
        unsafe { assert!(!(*rt.num_class).inherits_methods) };
    }

    #[test]
    fn display_trims_integral_numbers() {
        assert_eq!(display_string(Value::num(42.0)), "42");
        assert_eq!(display_string(Value::num(0.5)), "0.5");
        assert_eq!(display_string(NULL_VAL), "null");
    }

    #[test]
    fn range_iteration_visits_inclusive_bounds() {
        let range = new_range(0.0, 2.0, true);
        let mut seen = Vec::new();
        let mut iterator = NULL_VAL;
        loop {
            iterator = range_iterate(range, iterator);
            if iterator.0 == runtime().false_value.0 {
                break;
            }
            seen.push(range_iterator_value(range, iterator).as_num());
        }
        assert_eq!(seen, vec![0.0, 1.0, 2.0]);
    }

    #[test]
    fn string_subscript_is_byte_indexed() {
        let s = new_string("hi".to_string());
        let c = string_subscript(s, Value::num(1.0));
        assert_eq!(display_string(c), "i");
    }

    #[test]
    fn string_subscript_on_multibyte_sequences_yields_replacement() {
        // "é" is the two bytes C3 A9; count sees both, and neither byte is
        // valid text on its own.
        let accented = new_string("é".to_string());
        assert_eq!(string_count(accented).as_num(), 2.0);
        let first = string_subscript(accented, Value::num(0.0));
        assert_eq!(display_string(first), "\u{fffd}");
        let second = string_subscript(accented, Value::num(1.0));
        assert_eq!(display_string(second), "\u{fffd}");
    }
}
