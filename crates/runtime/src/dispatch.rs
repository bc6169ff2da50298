//! Signature interning and virtual dispatch.
//!
//! The runtime keeps its own ID-to-string table, fed by the signature
//! tables compiled modules register at startup. IDs come from the shared
//! hash, so modules compiled separately agree without coordination; the
//! table exists so diagnostics can name methods instead of printing raw
//! IDs.

use std::collections::BTreeMap;
use std::ffi::{CStr, c_char};
use std::io::Write;
use std::sync::Mutex;

use crate::core::runtime;
use crate::object::{NativeFn, ObjClass};
use crate::value::Value;

static SIGNATURES: Mutex<BTreeMap<u64, String>> = Mutex::new(BTreeMap::new());

/// Intern a canonical signature string, returning its ID.
pub fn find_signature_id(canonical: &str) -> u64 {
    let id = wren_abi::signature_id(canonical);
    SIGNATURES
        .lock()
        .unwrap()
        .entry(id)
        .or_insert_with(|| canonical.to_string());
    id
}

/// The canonical string for an ID, or a placeholder naming the raw ID.
pub fn signature_name(id: u64) -> String {
    SIGNATURES
        .lock()
        .unwrap()
        .get(&id)
        .cloned()
        .unwrap_or_else(|| format!("<signature {id:#x}>"))
}

fn runtime_abort(message: &str) -> ! {
    let mut stderr = std::io::stderr();
    let _ = writeln!(stderr, "{message}");
    std::process::abort();
}

/// The class dispatch starts at for a receiver value. Numbers have no
/// object header, so they borrow the Num pseudo-class.
fn receiver_class(receiver: Value, signature: u64) -> *mut ObjClass {
    if receiver.is_num() {
        return runtime().num_class;
    }
    let obj = receiver.as_object();
    if obj.is_null() {
        runtime_abort(&format!(
            "Cannot call method '{}' on null receiver",
            signature_name(signature)
        ));
    }
    unsafe { (*obj).class }
}

/// Registers a module's signatures: a NUL-delimited sequence terminated by
/// an empty string.
#[unsafe(no_mangle)]
pub extern "C" fn wren_register_signatures_table(table: *const c_char) {
    if table.is_null() {
        return;
    }
    let mut cursor = table;
    loop {
        let entry = unsafe { CStr::from_ptr(cursor) };
        let bytes = entry.to_bytes();
        if bytes.is_empty() {
            break;
        }
        find_signature_id(&String::from_utf8_lossy(bytes));
        cursor = unsafe { cursor.add(bytes.len() + 1) };
    }
}

/// Look up a method on a receiver. Aborts if the receiver is null or the
/// method doesn't exist; the returned pointer is callable as
/// `(receiver, args…) -> Value`.
#[unsafe(no_mangle)]
pub extern "C" fn wren_virtual_method_lookup(receiver: Value, signature: u64) -> NativeFn {
    let class = receiver_class(receiver, signature);
    let class = unsafe { &*class };
    match class.lookup_method(signature) {
        Some(func) => func,
        None => runtime_abort(&format!(
            "On receiver of type {}, could not find method {}",
            class.name,
            signature_name(signature)
        )),
    }
}

/// Super dispatch: lookup starts above the class the calling method was
/// statically declared on. For static methods the chain runs through the
/// metaclasses.
#[unsafe(no_mangle)]
pub extern "C" fn wren_super_method_lookup(
    _receiver: Value,
    class_value: Value,
    signature: u64,
    is_static: u8,
) -> NativeFn {
    if !class_value.is_object() || class_value.is_null() {
        runtime_abort("Super call with a non-class static context");
    }
    let declared = class_value.as_object() as *mut ObjClass;
    let parent = unsafe { (*declared).parent };
    if parent.is_null() {
        runtime_abort(&format!(
            "Super call to {} has no superclass",
            signature_name(signature)
        ));
    }
    let start = if is_static != 0 {
        // The static method lives on the metaclass; so does its super.
        unsafe { (*parent).obj.class }
    } else {
        parent
    };
    let start = unsafe { &*start };
    match start.lookup_method(signature) {
        Some(func) => func,
        None => runtime_abort(&format!(
            "On supertype {}, could not find method {}",
            start.name,
            signature_name(signature)
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn signature_table_registration_interns_names() {
        let table = b"alpha()\0beta(_)\0\0";
        wren_register_signatures_table(table.as_ptr() as *const c_char);
        let id = wren_abi::signature_id("alpha()");
        assert_eq!(signature_name(id), "alpha()");
    }

    #[test]
    fn find_is_idempotent() {
        let a = find_signature_id("gamma(_,_)");
        let b = find_signature_id("gamma(_,_)");
        assert_eq!(a, b);
        assert_eq!(signature_name(a), "gamma(_,_)");
    }
}
