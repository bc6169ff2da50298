//! Shared ABI between the compiler and the runtime.
//!
//! Everything in this crate is load-bearing on both sides of the object-file
//! boundary: the code generator bakes these constants into emitted modules,
//! and the runtime decodes them. Keeping the two in one crate means they
//! cannot drift.
//!
//! The pieces:
//! - NaN-boxed value encoding (`NAN_MASK`, `CONTENT_MASK`, `NULL_VAL`)
//! - the signature-ID hash (FNV-1a-64, with 0 reserved for "unused")
//! - the runtime symbol names emitted code calls
//! - the closure-spec table layout
//! - the class-description command words

// ---------------------------------------------------------------------------
// Value encoding
// ---------------------------------------------------------------------------

/// A NaN-tagged 64-bit value word.
///
/// An IEEE 754 double is a 64-bit word. Quiet NaNs leave 51 mantissa bits
/// free, which is more than enough for a 48-bit pointer. A word is a double
/// unless all the quiet-NaN bits are set; otherwise the low 48 bits are an
/// `Obj` pointer. Null is the bare tag pattern (a null pointer). Numbers are
/// therefore never heap-allocated, and arithmetic needs no unmasking.
pub type RawValue = u64;

/// Quiet-NaN tag: exponent bits plus the mantissa MSB.
pub const NAN_MASK: u64 = 0x7ff8_0000_0000_0000;

/// The pointer payload bits of an object value.
pub const CONTENT_MASK: u64 = 0x0007_ffff_ffff_ffff;

/// The encoding of `null`: an object value with a null pointer.
pub const NULL_VAL: u64 = NAN_MASK;

/// True iff the word decodes as a double rather than an object.
#[inline]
pub fn is_number(value: RawValue) -> bool {
    (value & NAN_MASK) != NAN_MASK
}

/// True iff the word carries an object pointer (possibly null).
#[inline]
pub fn is_object(value: RawValue) -> bool {
    (value & NAN_MASK) == NAN_MASK
}

/// Encode a double. The compiler encodes numeric constants with this exact
/// function so compile-time and runtime words are bit-identical.
#[inline]
pub fn encode_number(num: f64) -> RawValue {
    num.to_bits()
}

#[inline]
pub fn decode_number(value: RawValue) -> f64 {
    f64::from_bits(value)
}

/// Encode a pointer as an object value. The pointer must fit in 48 bits,
/// which holds for user-space addresses on every supported target.
#[inline]
pub fn encode_pointer(ptr: usize) -> RawValue {
    NAN_MASK | (ptr as u64 & CONTENT_MASK)
}

/// Extract the pointer payload of an object value.
#[inline]
pub fn decode_pointer(value: RawValue) -> usize {
    (value & CONTENT_MASK) as usize
}

// ---------------------------------------------------------------------------
// Signature IDs
// ---------------------------------------------------------------------------

const FNV_OFFSET_BASIS: u64 = 0xcbf2_9ce4_8422_2325;
const FNV_PRIME: u64 = 0x0000_0100_0000_01b3;

/// Hash a canonical signature string to its 64-bit ID.
///
/// FNV-1a-64. Hashing (rather than a shared intern table) lets separately
/// compiled modules agree on IDs without a linking step; a collision between
/// two signatures actually used on the same receiver is treated as a
/// compiler bug. ID 0 is reserved for "unused", so the vanishingly unlikely
/// zero hash is remapped to the offset basis.
pub fn signature_id(canonical: &str) -> u64 {
    let mut hash = FNV_OFFSET_BASIS;
    for byte in canonical.bytes() {
        hash ^= byte as u64;
        hash = hash.wrapping_mul(FNV_PRIME);
    }
    if hash == 0 { FNV_OFFSET_BASIS } else { hash }
}

// ---------------------------------------------------------------------------
// Runtime symbol names
// ---------------------------------------------------------------------------

/// Names of the runtime functions and globals the emitted code references.
/// Each must exist in `crates/runtime` with a matching signature.
pub mod names {
    /// `wren_virtual_method_lookup(Value receiver, u64 sig) -> fn ptr`
    pub const VIRTUAL_METHOD_LOOKUP: &str = "wren_virtual_method_lookup";

    /// `wren_super_method_lookup(Value receiver, Value cls, u64 sig, u8 is_static) -> fn ptr`
    pub const SUPER_METHOD_LOOKUP: &str = "wren_super_method_lookup";

    /// `wren_init_string_literal(char* ptr, i32 len) -> Value`
    pub const INIT_STRING_LITERAL: &str = "wren_init_string_literal";

    /// `wren_register_signatures_table(char*)`
    pub const REGISTER_SIGNATURES_TABLE: &str = "wren_register_signatures_table";

    /// `wren_init_class(char* name, u8* desc) -> Value`
    pub const INIT_CLASS: &str = "wren_init_class";

    /// `wren_alloc_obj(Value cls) -> Value`
    pub const ALLOC_OBJ: &str = "wren_alloc_obj";

    /// `wren_class_get_field_offset(Value cls) -> i32`
    pub const CLASS_GET_FIELD_OFFSET: &str = "wren_class_get_field_offset";

    /// `wren_register_closure(void* spec_data) -> ClosureSpec*`
    pub const REGISTER_CLOSURE: &str = "wren_register_closure";

    /// `wren_create_closure(ClosureSpec*, Value* closables, ObjClosure** list_head) -> Value`
    pub const CREATE_CLOSURE: &str = "wren_create_closure";

    /// `wren_get_closure_upvalue_pack(ObjClosure*) -> Value**`
    pub const GET_CLOSURE_UPVALUE_PACK: &str = "wren_get_closure_upvalue_pack";

    /// `wren_get_closure_chain_next(ObjClosure*) -> ObjClosure*`
    pub const GET_CLOSURE_CHAIN_NEXT: &str = "wren_get_closure_chain_next";

    /// `wren_alloc_upvalue_storage(i32 n) -> Value*`
    pub const ALLOC_UPVALUE_STORAGE: &str = "wren_alloc_upvalue_storage";

    /// `wren_get_core_class_value(char* name) -> Value`
    pub const GET_CORE_CLASS_VALUE: &str = "wren_get_core_class_value";

    /// `wren_get_bool_value(u8) -> Value`
    pub const GET_BOOL_VALUE: &str = "wren_get_bool_value";

    /// The external-linkage pointer to the main module function, consumed by
    /// the standalone stub's `main`.
    pub const STANDALONE_MAIN_FUNC: &str = "wrenStandaloneMainFunc";

    /// Prefix of the per-module internal system-variable globals.
    pub const SYS_VAR_PREFIX: &str = "wren_sys_var_";
}

/// The system variables the module initializer populates, in registration
/// order. The set is the superset of the two variants of the source table:
/// both `Bool` and `Fn` are included.
pub const SYSTEM_VAR_NAMES: &[&str] = &[
    "Bool", "Class", "Fn", "List", "Num", "Object", "Range", "String", "System",
];

// ---------------------------------------------------------------------------
// Closure specs
// ---------------------------------------------------------------------------

/// Layout of the constant closure-spec block emitted per closure:
///
/// ```text
/// { fn_ptr: ptr, name: ptr (C string), arity: i32, n_upvalues: i32,
///   idx_0: i32, ..., idx_{n-1}: i32 }
/// ```
///
/// Each index names the slot in the creating function's closable array that
/// the corresponding pack entry points at. An index with
/// [`SPEC_INDEX_CREATOR_FILLED`] set is not resolved by the runtime: the
/// creating function stores the cell pointer into the pack itself, which is
/// how captures of already-heap cells (transitive captures and heap-promoted
/// locals) are bound.
pub const SPEC_INDEX_CREATOR_FILLED: u32 = 1 << 31;

/// Mask selecting the index payload of a spec entry.
pub const SPEC_INDEX_MASK: u32 = !SPEC_INDEX_CREATOR_FILLED;

// ---------------------------------------------------------------------------
// Class descriptions
// ---------------------------------------------------------------------------

/// Commands of the class-description block consumed by `wren_init_class`.
///
/// The block is a sequence of 64-bit words. Each command word carries the
/// command in its low 32 bits and flags in the high 32 bits, followed by the
/// command's operands (pointers stored as full words). The block ends with
/// `END`.
pub mod class_desc {
    /// End of block. No operands.
    pub const END: u32 = 0;

    /// Add a method: operands are a name C-string pointer and a function
    /// pointer.
    pub const ADD_METHOD: u32 = 1;

    /// Add an instance field: operand is a name C-string pointer.
    pub const ADD_FIELD: u32 = 2;

    /// Set the superclass: operand is a pointer to the value slot holding
    /// the superclass object, read when the block is parsed. Absent means
    /// the class extends Object.
    pub const SUPERTYPE: u32 = 3;

    /// The method is static (registered on the metaclass).
    pub const FLAG_STATIC: u32 = 1 << 0;

    /// Pack a command and its flags into one block word.
    pub fn command_word(command: u32, flags: u32) -> u64 {
        command as u64 | ((flags as u64) << 32)
    }

    /// Split a block word into (command, flags).
    pub fn split_word(word: u64) -> (u32, u32) {
        (word as u32, (word >> 32) as u32)
    }
}
