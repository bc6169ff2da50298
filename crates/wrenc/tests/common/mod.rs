//! Shared helpers for integration tests: small IR builders standing in
//! for the front end, and a lowering entry point that returns the printed
//! LLVM IR after verification.

#![allow(dead_code)]

use anyhow::Result;

use wrenc::ir::{Expr, FnId, IRFn, Literal, Module, Stmt, VarRef};
use wrenc::signature::Signature;

/// A module with an empty arity-0 main function.
pub fn main_module() -> (Module, FnId) {
    let mut module = Module::new(Some("test_module".to_string()));
    let mut main = IRFn::new("test_module_main");
    main.is_main = true;
    let main_id = module.add_fn(main);
    (module, main_id)
}

/// Run the pass pipeline and codegen, returning the LLVM IR text. Fails
/// if LLVM verification rejects the module.
pub fn lower(module: &mut Module) -> Result<String> {
    wrenc::builder::lower_to_ir_string(module)
}

pub fn num(value: f64) -> Expr {
    Expr::Const(Literal::Num(value))
}

pub fn str_lit(value: &str) -> Expr {
    Expr::Const(Literal::Str(value.to_string()))
}

pub fn call(signature: Signature, receiver: Expr, args: Vec<Expr>) -> Expr {
    Expr::Call { signature, receiver: Box::new(receiver), args, super_call: false }
}

pub fn eval(expr: Expr) -> Stmt {
    Stmt::EvalAndIgnore(expr)
}

pub fn ret(expr: Expr) -> Stmt {
    Stmt::Return(expr)
}

pub fn load(var: VarRef) -> Expr {
    Expr::Load(var)
}

/// `System.print(<expr>)`.
pub fn system_print(expr: Expr) -> Expr {
    call(
        Signature::method("print", 1),
        Expr::SystemVar("System".to_string()),
        vec![expr],
    )
}

/// Count non-overlapping occurrences of a needle in a haystack.
pub fn count_occurrences(haystack: &str, needle: &str) -> usize {
    haystack.matches(needle).count()
}
