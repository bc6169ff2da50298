//! wrenc: an ahead-of-time compiler for a small class-based scripting
//! language.
//!
//! The front end (out of tree) hands this crate a [`ir::Module`]; the
//! pipeline here analyses scopes, plans upvalue packs, inserts upvalue
//! relocations, and lowers the result to LLVM IR, emitting a native object
//! file that links against the `runtime` crate.
//!
//! The interesting machinery is the closure protocol: locals captured by
//! closures live in a per-frame *closable array*, and every exit from the
//! scope that declared them runs a *relocation* that moves the cells to
//! the heap and rewrites the upvalue packs of all live closure instances.
//! See `upvalues` and `codegen::stmt` for the two halves of that story.

pub mod builder;
pub mod codegen;
pub mod diagnostics;
pub mod ir;
pub mod relocate;
pub mod scope;
pub mod signature;
pub mod upvalues;

pub use builder::{CompilationResult, OutputFormat, compile_module};
