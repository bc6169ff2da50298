//! The standalone `main` stub.
//!
//! A compiled main module exports `wrenStandaloneMainFunc`, a pointer to
//! its entry function. Linking this staticlib in front of the module
//! object and the runtime produces a working executable: `main` below
//! initialises the runtime, then calls through the pointer.

#![cfg_attr(test, no_main)]

use runtime::Value;
use runtime::entry::wren_runtime_init;

unsafe extern "C" {
    /// Emitted by the main module with external linkage.
    #[allow(non_upper_case_globals)]
    static wrenStandaloneMainFunc: extern "C" fn() -> Value;
}

#[unsafe(no_mangle)]
pub extern "C" fn main(_argc: i32, _argv: *const *const u8) -> i32 {
    wren_runtime_init();
    unsafe {
        wrenStandaloneMainFunc();
    }
    0
}
