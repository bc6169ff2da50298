//! The relocation inserter.
//!
//! Every `BeginUpvalues` marker opens a scope that may declare captured
//! locals. This pass places a `RelocateUpvalues` statement on every
//! control-flow exit from such a scope, so captured cells are moved to the
//! heap before the stack slots become invalid for the closures that retain
//! them:
//!
//! - fall-through off the end of the block that opened the scope;
//! - `return` anywhere inside it (relocates every open scope of the
//!   function);
//! - a jump whose target label lies outside the scope, including loop
//!   back-edges (each loop iteration relocates the body's captures
//!   independently).
//!
//! On each path a single statement carries the union of the exited scopes'
//! captured locals, so a relocation executes at most once per scope entry.
//!
//! Two rewrites keep evaluation order sound:
//! - `return e` becomes `tmp = e; relocate; return tmp` — closures created
//!   while evaluating `e` must be swept too;
//! - a *conditional* outward jump branches over the relocation when not
//!   taken, so a scope that stays live is never relocated early.

use std::collections::HashMap;

use crate::diagnostics::internal_error;
use crate::ir::{Expr, FnId, LabelId, LocalId, Module, ScopeId, Stmt, VarRef};
use crate::upvalues::UpvaluePlan;

pub fn insert_relocations(module: &mut Module, plan: &UpvaluePlan) {
    for index in 0..module.fns.len() {
        let fn_id = FnId(index as u32);
        let body = std::mem::replace(&mut module.func_mut(fn_id).body, Stmt::Block(Vec::new()));
        let mut label_depths = HashMap::new();
        scan_labels(&body, 0, &mut label_depths);
        let mut rewriter = Rewriter {
            module: &mut *module,
            plan,
            fn_id,
            label_depths,
            scope_stack: Vec::new(),
        };
        let body = rewriter.rewrite_stmt(body);
        module.func_mut(fn_id).body = body;
    }
}

/// Record, for every label, how many scopes are open where it is declared.
fn scan_labels(stmt: &Stmt, depth: usize, out: &mut HashMap<LabelId, usize>) {
    match stmt {
        Stmt::Block(stmts) => {
            let mut open = depth;
            for s in stmts {
                if let Stmt::BeginUpvalues(_) = s {
                    open += 1;
                }
                scan_labels(s, open, out);
            }
        }
        Stmt::Label(label) => {
            out.insert(*label, depth);
        }
        Stmt::Assign { value, .. } => scan_labels_expr(value, depth, out),
        Stmt::FieldAssign { object, value, .. } => {
            scan_labels_expr(object, depth, out);
            scan_labels_expr(value, depth, out);
        }
        Stmt::EvalAndIgnore(expr) | Stmt::Return(expr) => scan_labels_expr(expr, depth, out),
        Stmt::Jump { condition, .. } => {
            if let Some(cond) = condition {
                scan_labels_expr(cond, depth, out);
            }
        }
        _ => {}
    }
}

fn scan_labels_expr(expr: &Expr, depth: usize, out: &mut HashMap<LabelId, usize>) {
    match expr {
        Expr::RunStatements { body, .. } => scan_labels(body, depth, out),
        Expr::FieldLoad { object, .. } => scan_labels_expr(object, depth, out),
        Expr::Call { receiver, args, .. } => {
            scan_labels_expr(receiver, depth, out);
            for arg in args {
                scan_labels_expr(arg, depth, out);
            }
        }
        Expr::LogicalNot(inner) => scan_labels_expr(inner, depth, out),
        _ => {}
    }
}

struct OpenScope {
    captured: Vec<LocalId>,
}

struct Rewriter<'m, 'p> {
    module: &'m mut Module,
    plan: &'p UpvaluePlan,
    fn_id: FnId,
    label_depths: HashMap<LabelId, usize>,
    scope_stack: Vec<OpenScope>,
}

impl Rewriter<'_, '_> {
    /// The captured, stack-closable locals a scope must relocate.
    fn captured_of(&self, scope: ScopeId) -> Vec<LocalId> {
        self.module
            .scope(scope)
            .locals
            .iter()
            .copied()
            .filter(|&l| self.plan.is_stack_closable(self.module, l))
            .collect()
    }

    /// Union of captured locals of the open scopes at depth `from` and
    /// deeper, innermost first.
    fn captured_since(&self, from: usize) -> Vec<LocalId> {
        self.scope_stack[from..]
            .iter()
            .rev()
            .flat_map(|s| s.captured.iter().copied())
            .collect()
    }

    fn rewrite_stmt(&mut self, stmt: Stmt) -> Stmt {
        match stmt {
            Stmt::Block(stmts) => Stmt::Block(self.rewrite_block(stmts)),
            Stmt::Return(expr) => {
                let expr = self.rewrite_expr(expr);
                let captured = self.captured_since(0);
                if captured.is_empty() {
                    return Stmt::Return(expr);
                }
                // Evaluate the result first: it may create closures over
                // the very cells being relocated.
                let temp = self.module.add_temporary(self.fn_id, "return-value");
                Stmt::Block(vec![
                    Stmt::Assign { var: VarRef::Local(temp), value: expr },
                    Stmt::RelocateUpvalues(captured),
                    Stmt::Return(Expr::Load(VarRef::Local(temp))),
                ])
            }
            Stmt::Jump { target, condition, looping, jump_on_false } => {
                let condition = condition.map(|c| self.rewrite_expr(c));
                let Some(&target_depth) = self.label_depths.get(&target) else {
                    internal_error(&format!(
                        "jump target '{}' is not declared in function '{}'",
                        self.module.label(target).debug_name,
                        self.module.func(self.fn_id).debug_name
                    ));
                };
                let exit_from = target_depth.min(self.scope_stack.len());
                let captured = self.captured_since(exit_from);
                if captured.is_empty() {
                    return Stmt::Jump { target, condition, looping, jump_on_false };
                }
                match condition {
                    None => Stmt::Block(vec![
                        Stmt::RelocateUpvalues(captured),
                        Stmt::Jump { target, condition: None, looping, jump_on_false },
                    ]),
                    Some(cond) => {
                        // Branch over the relocation when the jump isn't
                        // taken; the scope stays live on that path.
                        let skip = self.module.add_label("relocate-skip");
                        Stmt::Block(vec![
                            Stmt::Jump {
                                target: skip,
                                condition: Some(cond),
                                looping: false,
                                jump_on_false: !jump_on_false,
                            },
                            Stmt::RelocateUpvalues(captured),
                            Stmt::Jump { target, condition: None, looping, jump_on_false: false },
                            Stmt::Label(skip),
                        ])
                    }
                }
            }
            Stmt::Assign { var, value } => Stmt::Assign { var, value: self.rewrite_expr(value) },
            Stmt::FieldAssign { field, object, value } => Stmt::FieldAssign {
                field,
                object: self.rewrite_expr(object),
                value: self.rewrite_expr(value),
            },
            Stmt::EvalAndIgnore(expr) => Stmt::EvalAndIgnore(self.rewrite_expr(expr)),
            other => other,
        }
    }

    fn rewrite_block(&mut self, stmts: Vec<Stmt>) -> Vec<Stmt> {
        let base_depth = self.scope_stack.len();
        let mut out = Vec::with_capacity(stmts.len());
        for stmt in stmts {
            if let Stmt::BeginUpvalues(scope) = &stmt {
                let captured = self.captured_of(*scope);
                self.scope_stack.push(OpenScope { captured });
                out.push(stmt);
                continue;
            }
            out.push(self.rewrite_stmt(stmt));
        }

        // Close the scopes this block opened. If control can fall off the
        // end, their captures relocate here.
        let captured = self.captured_since(base_depth);
        self.scope_stack.truncate(base_depth);
        if !captured.is_empty() {
            let terminated = out.last().is_some_and(Stmt::is_unconditional_branch);
            if !terminated {
                out.push(Stmt::RelocateUpvalues(captured));
            }
        }
        out
    }

    fn rewrite_expr(&mut self, expr: Expr) -> Expr {
        match expr {
            Expr::RunStatements { body, temporary } => {
                // Statements in here cannot return or jump out, but they
                // can open and close scopes of their own.
                let body = Box::new(self.rewrite_stmt(*body));
                Expr::RunStatements { body, temporary }
            }
            Expr::FieldLoad { field, object } => {
                Expr::FieldLoad { field, object: Box::new(self.rewrite_expr(*object)) }
            }
            Expr::Call { signature, receiver, args, super_call } => Expr::Call {
                signature,
                receiver: Box::new(self.rewrite_expr(*receiver)),
                args: args.into_iter().map(|a| self.rewrite_expr(a)).collect(),
                super_call,
            },
            Expr::LogicalNot(inner) => Expr::LogicalNot(Box::new(self.rewrite_expr(*inner))),
            other => other,
        }
    }
}
