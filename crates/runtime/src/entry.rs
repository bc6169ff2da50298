//! Remaining entry points consumed by compiled modules and the standalone
//! stub: runtime initialisation, core-class lookup, the boolean
//! singletons, and string-literal construction.

use std::ffi::{CStr, c_char};
use std::io::Write;

use crate::core::{self, runtime};
use crate::value::Value;

/// Initialise the runtime. Idempotent; the standalone stub calls it before
/// jumping to the module's main function.
#[unsafe(no_mangle)]
pub extern "C" fn wren_runtime_init() {
    let _ = runtime();
}

/// Look up a core class or singleton by name; the module initializer
/// populates its system-variable globals with this.
#[unsafe(no_mangle)]
pub extern "C" fn wren_get_core_class_value(name: *const c_char) -> Value {
    let name = unsafe { CStr::from_ptr(name) }.to_string_lossy();
    match runtime().core_value(&name) {
        Some(value) => value,
        None => {
            let _ = writeln!(std::io::stderr(), "Unknown core class '{name}'");
            std::process::abort();
        }
    }
}

#[unsafe(no_mangle)]
pub extern "C" fn wren_get_bool_value(value: u8) -> Value {
    core::bool_value(value != 0)
}

/// Construct the string object for a literal. Length is explicit so
/// literals may contain NUL bytes.
#[unsafe(no_mangle)]
pub extern "C" fn wren_init_string_literal(literal: *const c_char, length: i32) -> Value {
    let bytes = unsafe { std::slice::from_raw_parts(literal as *const u8, length.max(0) as usize) };
    core::new_string(String::from_utf8_lossy(bytes).into_owned())
}
