//! Closures, upvalue packs and the instance chain.
//!
//! A *closure spec* is the constant table a compiled module registers per
//! closure function: entry point, name, arity, and the ordered mapping
//! from pack index to closable-array slot. Creating a closure builds its
//! *upvalue pack* — a vector of pointers to the cells of its captures —
//! and threads the instance onto the creating frame's intrusive list so
//! scope-exit relocation can rewrite the pack when cells move to the
//! heap.
//!
//! Pack entries whose spec index carries the creator-filled bit are left
//! null here; the creating function stores those cell pointers itself
//! (they are already heap cells, reached through its own pack or a
//! heap-promoted local).
//!
//! Heap cells allocated by `wren_alloc_upvalue_storage` are owned
//! collectively by every closure that points at them and are intentionally
//! never freed: the language has no collector, and a counted scheme can be
//! swapped in behind this entry point without touching emitted code.

use std::ffi::{CStr, c_char, c_void};
use std::io::Write;

use crate::core::runtime;
use crate::object::Obj;
use crate::value::{NULL_VAL, Value};

/// Parsed spec, owned by the runtime for the process lifetime.
pub struct ClosureSpec {
    pub fn_ptr: *const c_void,
    pub name: String,
    pub arity: u32,
    pub upvalue_indices: Vec<u32>,
}

/// The raw constant block layout emitted by the compiler; see
/// `wren_abi::SPEC_INDEX_CREATOR_FILLED` for the index encoding.
#[repr(C)]
struct RawSpecHeader {
    fn_ptr: *const c_void,
    name: *const c_char,
    arity: i32,
    n_upvalues: i32,
}

#[repr(C)]
pub struct ObjClosure {
    pub obj: Obj,
    pub spec: *const ClosureSpec,
    /// Intrusive list linking all instances sharing one frame's captures.
    pub chain_next: *mut ObjClosure,
    pub pack: Vec<*mut Value>,
}

#[unsafe(no_mangle)]
pub extern "C" fn wren_register_closure(spec_data: *mut c_void) -> *mut ClosureSpec {
    if spec_data.is_null() {
        let _ = writeln!(std::io::stderr(), "Cannot register a null closure spec");
        std::process::abort();
    }
    let header = spec_data as *const RawSpecHeader;
    let spec = unsafe {
        let header = &*header;
        let indices_base = (spec_data as *const u8).add(std::mem::size_of::<RawSpecHeader>())
            as *const u32;
        let indices =
            std::slice::from_raw_parts(indices_base, header.n_upvalues as usize).to_vec();
        ClosureSpec {
            fn_ptr: header.fn_ptr,
            name: CStr::from_ptr(header.name).to_string_lossy().into_owned(),
            arity: header.arity as u32,
            upvalue_indices: indices,
        }
    };
    // Specs land in module globals and live as long as the module does.
    Box::into_raw(Box::new(spec))
}

/// Create a closure instance over `spec`, binding pack entries to cells in
/// `closables` and threading the instance onto `list_head` when given.
#[unsafe(no_mangle)]
pub extern "C" fn wren_create_closure(
    spec: *const ClosureSpec,
    closables: *mut Value,
    list_head: *mut *mut ObjClosure,
) -> Value {
    if spec.is_null() {
        let _ = writeln!(std::io::stderr(), "Cannot pass null spec to wren_create_closure");
        std::process::abort();
    }
    let spec_ref = unsafe { &*spec };

    let mut pack: Vec<*mut Value> = Vec::with_capacity(spec_ref.upvalue_indices.len());
    for &index in &spec_ref.upvalue_indices {
        if index & wren_abi::SPEC_INDEX_CREATOR_FILLED != 0 {
            pack.push(std::ptr::null_mut());
            continue;
        }
        if closables.is_null() {
            let _ = writeln!(
                std::io::stderr(),
                "Closure '{}' binds stack cells but no closable array was passed",
                spec_ref.name
            );
            std::process::abort();
        }
        pack.push(unsafe { closables.add((index & wren_abi::SPEC_INDEX_MASK) as usize) });
    }

    let closure = Box::into_raw(Box::new(ObjClosure {
        obj: Obj { class: runtime().fn_class },
        spec,
        chain_next: std::ptr::null_mut(),
        pack,
    }));

    if !list_head.is_null() {
        unsafe {
            (*closure).chain_next = *list_head;
            *list_head = closure;
        }
    }

    Value::object(closure as *mut Obj)
}

#[unsafe(no_mangle)]
pub extern "C" fn wren_get_closure_upvalue_pack(closure: *mut ObjClosure) -> *mut *mut Value {
    unsafe { (*closure).pack.as_mut_ptr() }
}

#[unsafe(no_mangle)]
pub extern "C" fn wren_get_closure_chain_next(closure: *mut ObjClosure) -> *mut ObjClosure {
    unsafe { (*closure).chain_next }
}

/// Zero-initialised heap storage for `count` upvalue cells. See the module
/// docs for the ownership story.
#[unsafe(no_mangle)]
pub extern "C" fn wren_alloc_upvalue_storage(count: i32) -> *mut Value {
    let cells = count.max(0) as usize;
    let bytes = cells.max(1) * std::mem::size_of::<Value>();
    let storage = unsafe { libc::calloc(1, bytes) } as *mut Value;
    if storage.is_null() {
        let _ = writeln!(std::io::stderr(), "Out of memory allocating upvalue storage");
        std::process::abort();
    }
    storage
}

// --- Fn.call ---

fn call_arity_abort(spec: &ClosureSpec, given: usize) -> ! {
    let _ = writeln!(
        std::io::stderr(),
        "Function '{}' expects {} arguments, got {}",
        spec.name,
        spec.arity,
        given
    );
    std::process::abort();
}

/// Invoke a closure with already-evaluated arguments. The compiled entry
/// point takes the pack pointer first iff the closure captures anything.
pub fn invoke_closure(closure: *mut ObjClosure, args: &[Value]) -> Value {
    let spec = unsafe { &*(*closure).spec };
    if args.len() != spec.arity as usize {
        call_arity_abort(spec, args.len());
    }
    let has_pack = !spec.upvalue_indices.is_empty();
    let pack = unsafe { (*closure).pack.as_mut_ptr() };
    let f = spec.fn_ptr;

    type P = *mut *mut Value;
    unsafe {
        match (has_pack, args.len()) {
            (false, 0) => {
                let f: extern "C" fn() -> Value = std::mem::transmute(f);
                f()
            }
            (false, 1) => {
                let f: extern "C" fn(Value) -> Value = std::mem::transmute(f);
                f(args[0])
            }
            (false, 2) => {
                let f: extern "C" fn(Value, Value) -> Value = std::mem::transmute(f);
                f(args[0], args[1])
            }
            (false, 3) => {
                let f: extern "C" fn(Value, Value, Value) -> Value = std::mem::transmute(f);
                f(args[0], args[1], args[2])
            }
            (false, 4) => {
                let f: extern "C" fn(Value, Value, Value, Value) -> Value =
                    std::mem::transmute(f);
                f(args[0], args[1], args[2], args[3])
            }
            (true, 0) => {
                let f: extern "C" fn(P) -> Value = std::mem::transmute(f);
                f(pack)
            }
            (true, 1) => {
                let f: extern "C" fn(P, Value) -> Value = std::mem::transmute(f);
                f(pack, args[0])
            }
            (true, 2) => {
                let f: extern "C" fn(P, Value, Value) -> Value = std::mem::transmute(f);
                f(pack, args[0], args[1])
            }
            (true, 3) => {
                let f: extern "C" fn(P, Value, Value, Value) -> Value = std::mem::transmute(f);
                f(pack, args[0], args[1], args[2])
            }
            (true, 4) => {
                let f: extern "C" fn(P, Value, Value, Value, Value) -> Value =
                    std::mem::transmute(f);
                f(pack, args[0], args[1], args[2], args[3])
            }
            _ => {
                let _ = writeln!(
                    std::io::stderr(),
                    "Function '{}' has unsupported arity {}",
                    spec.name,
                    spec.arity
                );
                std::process::abort();
            }
        }
    }
}

pub extern "C" fn fn_call0(receiver: Value) -> Value {
    let closure = receiver.as_object() as *mut ObjClosure;
    invoke_closure(closure, &[])
}

pub extern "C" fn fn_call1(receiver: Value, a: Value) -> Value {
    let closure = receiver.as_object() as *mut ObjClosure;
    invoke_closure(closure, &[a])
}

pub extern "C" fn fn_call2(receiver: Value, a: Value, b: Value) -> Value {
    let closure = receiver.as_object() as *mut ObjClosure;
    invoke_closure(closure, &[a, b])
}

pub extern "C" fn fn_call3(receiver: Value, a: Value, b: Value, c: Value) -> Value {
    let closure = receiver.as_object() as *mut ObjClosure;
    invoke_closure(closure, &[a, b, c])
}

/// `Fn.new(_)`: the argument is already a closure object; hand it back.
pub extern "C" fn fn_new(_receiver: Value, closure: Value) -> Value {
    if !closure.is_object() || closure.is_null() {
        let _ = writeln!(std::io::stderr(), "Fn.new requires a function argument");
        std::process::abort();
    }
    closure
}

/// The cell value a pack entry currently sees; test helper for the
/// relocation protocol.
pub fn read_through_pack(closure: *mut ObjClosure, index: usize) -> Value {
    unsafe {
        let cell = (&(*closure).pack)[index];
        if cell.is_null() { NULL_VAL } else { *cell }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::ffi::CString;

    fn make_spec(name: &str, arity: i32, indices: &[u32]) -> *mut ClosureSpec {
        // Build a raw block the way a compiled module lays it out.
        let name = CString::new(name).unwrap();
        #[repr(C)]
        struct Block {
            header: RawSpecHeader,
            indices: [u32; 4],
        }
        let mut block = Block {
            header: RawSpecHeader {
                fn_ptr: std::ptr::null(),
                name: name.as_ptr(),
                arity,
                n_upvalues: indices.len() as i32,
            },
            indices: [0; 4],
        };
        block.indices[..indices.len()].copy_from_slice(indices);
        wren_register_closure(&mut block as *mut Block as *mut c_void)
    }

    #[test]
    fn spec_registration_parses_the_block() {
        let spec = make_spec("inner", 2, &[1, wren_abi::SPEC_INDEX_CREATOR_FILLED]);
        let spec = unsafe { &*spec };
        assert_eq!(spec.name, "inner");
        assert_eq!(spec.arity, 2);
        assert_eq!(spec.upvalue_indices.len(), 2);
    }

    #[test]
    fn create_closure_binds_stack_cells_and_threads_the_chain() {
        let spec = make_spec("capturing", 0, &[0, 1]);
        let mut closables = [Value::num(10.0), Value::num(20.0)];
        let mut head: *mut ObjClosure = std::ptr::null_mut();

        let first = wren_create_closure(spec, closables.as_mut_ptr(), &mut head);
        let second = wren_create_closure(spec, closables.as_mut_ptr(), &mut head);

        let first = first.as_object() as *mut ObjClosure;
        let second = second.as_object() as *mut ObjClosure;
        // Newest instance leads the chain.
        assert_eq!(head, second);
        assert_eq!(wren_get_closure_chain_next(second), first);
        assert!(wren_get_closure_chain_next(first).is_null());

        assert_eq!(read_through_pack(first, 0).as_num(), 10.0);
        assert_eq!(read_through_pack(second, 1).as_num(), 20.0);

        // Writing through the shared cell is visible to both instances.
        closables[0] = Value::num(77.0);
        assert_eq!(read_through_pack(first, 0).as_num(), 77.0);
        assert_eq!(read_through_pack(second, 0).as_num(), 77.0);
    }

    #[test]
    fn creator_filled_entries_start_null() {
        let spec = make_spec("nested", 0, &[wren_abi::SPEC_INDEX_CREATOR_FILLED]);
        let closure = wren_create_closure(spec, std::ptr::null_mut(), std::ptr::null_mut());
        let closure = closure.as_object() as *mut ObjClosure;
        unsafe {
            assert!((&(*closure).pack)[0].is_null());
        }
    }

    #[test]
    fn relocation_sweep_moves_reads_to_the_heap_cell() {
        // Simulates the emitted relocation sequence: allocate heap
        // storage, copy, rewrite matching pack entries, then check that
        // reads and writes through the closure observe the heap cell.
        let spec = make_spec("escaper", 0, &[0]);
        let mut closables = [Value::num(1.0)];
        let mut head: *mut ObjClosure = std::ptr::null_mut();
        let closure = wren_create_closure(spec, closables.as_mut_ptr(), &mut head);
        let closure = closure.as_object() as *mut ObjClosure;

        let heap = wren_alloc_upvalue_storage(1);
        unsafe {
            *heap = closables[0];
            let pack = wren_get_closure_upvalue_pack(closure);
            assert_eq!(*pack, closables.as_mut_ptr());
            *pack = heap;
        }

        // The stack slot is dead now; writes there must not be observed.
        closables[0] = Value::num(999.0);
        assert_eq!(read_through_pack(closure, 0).as_num(), 1.0);

        unsafe { *heap = Value::num(2.0) };
        assert_eq!(read_through_pack(closure, 0).as_num(), 2.0);
    }
}
