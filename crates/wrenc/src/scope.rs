//! Lexical scope analysis: name resolution and upvalue chain construction.
//!
//! The analyzer keeps a stack of function contexts, each holding a stack of
//! frames mapping names to locals. Resolution order for a name:
//!
//! 1. the current function's frames, innermost first — a hit is a Local;
//! 2. enclosing functions — a hit creates (or reuses) an Upvalue in every
//!    intermediate function, flattening the closure chain, and records the
//!    back-edge on the captured Local;
//! 3. module globals — a miss tentatively creates a Global marked with the
//!    line of first use, validated when the module ends.
//!
//! Shadowing across frames is legal; redeclaring a name within one frame is
//! a user error. Methods are a capture boundary: name lookup does not cross
//! into a method's locals, with the single exception of the receiver slot
//! (`this`), which closures inside methods import as an upvalue.

use std::collections::HashMap;

use crate::diagnostics::{Diagnostic, DiagnosticResult};
use crate::ir::{FnId, GlobalId, LocalId, Module, ScopeId, UpvalueId, VarRef};

struct Frame {
    locals: HashMap<String, LocalId>,
    scope: ScopeId,
}

struct FnContext {
    fn_id: FnId,
    frames: Vec<Frame>,
}

/// Names starting with a lowercase letter are local-style names; using one
/// at module level before its declaration is an error rather than a
/// forward reference.
fn is_local_name(name: &str) -> bool {
    name.chars().next().is_some_and(|c| c.is_ascii_lowercase())
}

pub struct ScopeAnalyzer<'m> {
    pub module: &'m mut Module,
    fn_stack: Vec<FnContext>,
}

impl<'m> ScopeAnalyzer<'m> {
    pub fn new(module: &'m mut Module) -> ScopeAnalyzer<'m> {
        ScopeAnalyzer { module, fn_stack: Vec::new() }
    }

    fn current(&self) -> &FnContext {
        self.fn_stack.last().expect("no function context")
    }

    fn current_mut(&mut self) -> &mut FnContext {
        self.fn_stack.last_mut().expect("no function context")
    }

    /// Enter a function, pushing its root frame. Returns the root frame's
    /// scope marker, which the caller embeds as `Stmt::BeginUpvalues` at
    /// the start of the body.
    pub fn begin_function(&mut self, fn_id: FnId) -> ScopeId {
        let scope = self.module.add_scope();
        self.fn_stack.push(FnContext {
            fn_id,
            frames: vec![Frame { locals: HashMap::new(), scope }],
        });
        scope
    }

    pub fn end_function(&mut self) {
        let ctx = self.fn_stack.pop().expect("unbalanced end_function");
        debug_assert_eq!(ctx.frames.len(), 1, "scopes left open at function end");
    }

    /// Open a nested block scope. Returns its `BeginUpvalues` marker.
    pub fn push_scope(&mut self) -> ScopeId {
        let scope = self.module.add_scope();
        self.current_mut().frames.push(Frame { locals: HashMap::new(), scope });
        scope
    }

    pub fn pop_scope(&mut self) {
        let ctx = self.current_mut();
        assert!(ctx.frames.len() > 1, "cannot pop the root frame");
        ctx.frames.pop();
    }

    /// Index of the innermost frame of the current function.
    pub fn top_frame(&self) -> usize {
        self.current().frames.len() - 1
    }

    /// Scope markers of the frames from `since` to the top, innermost
    /// first. `break` and `return` use this to learn which scopes'
    /// relocations must run.
    pub fn frames_since(&self, since: usize) -> Vec<ScopeId> {
        self.current().frames[since..]
            .iter()
            .rev()
            .map(|f| f.scope)
            .collect()
    }

    /// Declare a local in the innermost frame of the current function.
    /// Fails if the name already exists in that frame; shadowing an outer
    /// frame is fine.
    pub fn declare_local(&mut self, name: &str) -> DiagnosticResult<LocalId> {
        let fn_id = self.current().fn_id;
        if self.current().frames.last().unwrap().locals.contains_key(name) {
            return Err(Diagnostic::simple(format!(
                "variable '{name}' is already declared in this scope"
            )));
        }
        let local = self.module.add_local(fn_id, name);
        let frame = self.current_mut().frames.last_mut().unwrap();
        let scope = frame.scope;
        frame.locals.insert(name.to_string(), local);
        self.module.local_mut(local).begin_upvalues = Some(scope);
        self.module.scopes[scope.index()].locals.push(local);
        Ok(local)
    }

    /// Declare (or complete the declaration of) a module-level variable.
    pub fn declare_module_var(&mut self, name: &str, line: u32) -> DiagnosticResult<GlobalId> {
        if let Some(existing) = self.module.find_global(name) {
            let decl = &mut self.module.globals[existing.index()];
            return match decl.undeclared_line_used.take() {
                Some(first_use) if is_local_name(name) => Err(Diagnostic::with_line(
                    format!(
                        "variable '{name}' referenced before this definition (first use at line {first_use})"
                    ),
                    line,
                )),
                Some(_) => Ok(existing),
                None => Err(Diagnostic::with_line(
                    format!("module variable '{name}' is already defined"),
                    line,
                )),
            };
        }
        Ok(self.module.add_global(name))
    }

    /// Resolve a name without falling back to module scope.
    pub fn resolve_nonmodule(&mut self, name: &str) -> Option<VarRef> {
        let depth = self.fn_stack.len() - 1;
        for frame in self.fn_stack[depth].frames.iter().rev() {
            if let Some(&local) = frame.locals.get(name) {
                return Some(VarRef::Local(local));
            }
        }
        self.find_upvalue(depth, name).map(VarRef::Upvalue)
    }

    /// Full resolution. A module-scope miss tentatively creates a Global
    /// recording `line` as the first use.
    pub fn lookup(&mut self, name: &str, line: u32) -> VarRef {
        if let Some(var) = self.resolve_nonmodule(name) {
            return var;
        }
        if let Some(global) = self.module.find_global(name) {
            return VarRef::Global(global);
        }
        let global = self.module.add_global(name);
        self.module.globals[global.index()].undeclared_line_used = Some(line);
        VarRef::Global(global)
    }

    /// Look for `name` in the functions enclosing the one at `depth` on
    /// the function stack. On a hit this adds an upvalue to every
    /// intermediate function, so deeply nested closures chain through
    /// their parents.
    fn find_upvalue(&mut self, depth: usize, name: &str) -> Option<UpvalueId> {
        // The outermost function has no parent to capture from: at module
        // level everything is a module variable.
        if depth == 0 {
            return None;
        }

        let fn_id = self.fn_stack[depth].fn_id;

        // Methods do not close over locals of their callers; only the
        // receiver slot crosses the boundary.
        let parent_fn = self.fn_stack[depth - 1].fn_id;
        if self.module.func(parent_fn).enclosing_class.is_some() && name != "this" {
            return None;
        }

        // Already imported?
        for &upvalue in &self.module.func(fn_id).upvalues {
            if self.module.upvalue(upvalue).name == name {
                return Some(upvalue);
            }
        }

        // A local of the immediately enclosing function?
        for frame in self.fn_stack[depth - 1].frames.iter().rev() {
            if let Some(&local) = frame.locals.get(name) {
                let upvalue = self.module.add_upvalue(fn_id, name, VarRef::Local(local));
                // Record the back-edge so scope exit knows to relocate it.
                self.module.local_mut(local).upvalues.push(upvalue);
                return Some(upvalue);
            }
        }

        // Otherwise recurse: a hit in an outer function materialises an
        // upvalue in the parent, which we then import from.
        let parent_upvalue = self.find_upvalue(depth - 1, name)?;
        Some(self.module.add_upvalue(fn_id, name, VarRef::Upvalue(parent_upvalue)))
    }

    /// Validate the module after the front end is done: every global still
    /// marked as used-but-undeclared is an error.
    pub fn finish_module(&self) -> Vec<Diagnostic> {
        self.module
            .globals
            .iter()
            .filter_map(|g| {
                g.undeclared_line_used.map(|line| {
                    Diagnostic::with_line(format!("variable '{}' is used but never defined", g.name), line)
                })
            })
            .collect()
    }
}
