//! The typed tree IR the backend consumes.
//!
//! The IR is a tree, not a graph: statements and expressions are owned enum
//! trees, and the only shared nodes are variable declarations and jump
//! labels, which live in arenas on [`Module`] and are referenced by typed
//! indices. This sidesteps ownership cycles (a closure's upvalue points at
//! a local of an enclosing function, which points back at the upvalue) and
//! lets the backend dispatch with exhaustive `match`es.
//!
//! Variable declarations come in three kinds, mirroring where storage
//! lives at runtime:
//! - [`LocalDecl`] — a slot in the current function (stack, closable array,
//!   or a heap-promoted cell),
//! - [`UpvalueDecl`] — an import of a variable from an enclosing function,
//! - [`GlobalDecl`] — a module-level variable.

use std::fmt;

use crate::signature::Signature;

macro_rules! arena_id {
    ($(#[$doc:meta])* $name:ident) => {
        $(#[$doc])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
        pub struct $name(pub u32);

        impl $name {
            pub fn index(self) -> usize {
                self.0 as usize
            }
        }
    };
}

arena_id!(
    /// Index of a function in [`Module::fns`].
    FnId
);
arena_id!(
    /// Index of a class in [`Module::classes`].
    ClassId
);
arena_id!(
    /// Index of a local variable in [`Module::locals`].
    LocalId
);
arena_id!(
    /// Index of an upvalue in [`Module::upvalues`].
    UpvalueId
);
arena_id!(
    /// Index of a module-level variable in [`Module::globals`].
    GlobalId
);
arena_id!(
    /// Index of a jump label in [`Module::labels`].
    LabelId
);
arena_id!(
    /// Index of a `BeginUpvalues` scope marker in [`Module::scopes`].
    ScopeId
);

/// A reference to a variable declaration of any kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum VarRef {
    Local(LocalId),
    Upvalue(UpvalueId),
    Global(GlobalId),
}

/// A local variable in some function.
#[derive(Debug)]
pub struct LocalDecl {
    pub name: String,
    /// The function this local belongs to.
    pub owner: FnId,
    /// The upvalues bound to this variable, if closures capture it.
    pub upvalues: Vec<UpvalueId>,
    /// The scope marker under which this local came into scope. Set for
    /// every local declared through the scope analyzer; the relocation
    /// inserter and the backend only consult it for captured locals.
    pub begin_upvalues: Option<ScopeId>,
}

/// An import of a variable from an enclosing function.
#[derive(Debug)]
pub struct UpvalueDecl {
    pub name: String,
    /// Either a Local of the immediately enclosing function or another
    /// Upvalue of it. Chasing `parent` always terminates at a Local in a
    /// strictly outer function.
    pub parent: VarRef,
    /// The function that imports this upvalue.
    pub owner: FnId,
}

/// A module-level variable.
#[derive(Debug)]
pub struct GlobalDecl {
    pub name: String,
    /// If the variable was used before being declared, the line of first
    /// use. Still being set when the module ends is a user error.
    pub undeclared_line_used: Option<u32>,
}

/// A `BeginUpvalues` marker: the set of locals declared in one lexical
/// scope. The relocation inserter filters these to the captured ones.
#[derive(Debug, Default)]
pub struct ScopeDecl {
    pub locals: Vec<LocalId>,
}

#[derive(Debug)]
pub struct LabelDecl {
    pub debug_name: String,
}

/// A compiled function: the main function, a method, or a closure.
#[derive(Debug)]
pub struct IRFn {
    pub debug_name: String,
    /// Set iff this function is a closure; the function lexically
    /// containing it.
    pub parent: Option<FnId>,
    /// Set iff this function is a method (including static methods, which
    /// are instance methods of the metaclass).
    pub enclosing_class: Option<ClassId>,
    /// For methods: whether this is a static method. Super dispatch needs
    /// it.
    pub is_static_method: bool,
    /// The distinguished module entry function. Arity 0.
    pub is_main: bool,
    /// Parameters, in order. These also appear in `locals`.
    pub parameters: Vec<LocalId>,
    /// Every named local of this function, parameters included.
    pub locals: Vec<LocalId>,
    /// Compiler-introduced temporaries; not subject to name-conflict
    /// checks and never captured.
    pub temporaries: Vec<LocalId>,
    /// Upvalues imported from the parent function, in insertion order.
    /// Deduplicated by the variable they import.
    pub upvalues: Vec<UpvalueId>,
    /// Closures declared directly inside this function.
    pub closures: Vec<FnId>,
    pub body: Stmt,
}

impl IRFn {
    pub fn new(debug_name: impl Into<String>) -> IRFn {
        IRFn {
            debug_name: debug_name.into(),
            parent: None,
            enclosing_class: None,
            is_static_method: false,
            is_main: false,
            parameters: Vec::new(),
            locals: Vec::new(),
            temporaries: Vec::new(),
            upvalues: Vec::new(),
            closures: Vec::new(),
            body: Stmt::Block(Vec::new()),
        }
    }

    pub fn arity(&self) -> usize {
        self.parameters.len()
    }
}

#[derive(Debug)]
pub struct MethodDef {
    pub signature: Signature,
    pub func: FnId,
    pub is_static: bool,
}

/// A class declaration. The parent must be a class in the same module;
/// absent means the class extends Object.
#[derive(Debug)]
pub struct IRClass {
    pub name: String,
    pub fields: Vec<String>,
    pub methods: Vec<MethodDef>,
    pub parent: Option<ClassId>,
    /// The module variable the class object is stored into when the module
    /// initializer constructs it.
    pub output: Option<GlobalId>,
}

/// A reference to an instance field of the enclosing class.
#[derive(Debug, Clone)]
pub struct FieldRef {
    pub name: String,
    pub index: u32,
}

#[derive(Debug, Clone)]
pub enum Literal {
    Null,
    Bool(bool),
    Num(f64),
    Str(String),
}

#[derive(Debug)]
pub enum Expr {
    Const(Literal),
    Load(VarRef),
    FieldLoad {
        field: FieldRef,
        object: Box<Expr>,
    },
    /// A method call, or a function call when dispatched on a callable.
    /// `super_call` routes dispatch through the enclosing method's class.
    Call {
        signature: Signature,
        receiver: Box<Expr>,
        args: Vec<Expr>,
        super_call: bool,
    },
    /// Create a closure over `func`, binding its upvalues. Used even when
    /// the pack is empty.
    Closure(FnId),
    LoadReceiver,
    /// Run statements to initialise `temporary`, then yield its value.
    /// The statements must not return or jump outside of themselves.
    RunStatements {
        body: Box<Stmt>,
        temporary: LocalId,
    },
    LogicalNot(Box<Expr>),
    /// Allocate the memory for a new instance of the class.
    AllocateInstance(ClassId),
    /// A built-in variable, e.g. the Object class.
    SystemVar(String),
    /// The class object of a class declared in this module.
    GetClassVar(ClassId),
}

#[derive(Debug)]
pub enum Stmt {
    Assign {
        var: VarRef,
        value: Expr,
    },
    FieldAssign {
        field: FieldRef,
        object: Expr,
        value: Expr,
    },
    EvalAndIgnore(Expr),
    Block(Vec<Stmt>),
    Label(LabelId),
    /// Jump to a label. Conditional when `condition` is set: the jump is
    /// taken when the condition is truthy (or falsy if `jump_on_false`).
    /// `looping` marks loop back-edges; non-looping jumps only go forward.
    Jump {
        target: LabelId,
        condition: Option<Expr>,
        looping: bool,
        jump_on_false: bool,
    },
    Return(Expr),
    /// Force an imported module's main function to run and bind proxies.
    LoadModule {
        module: String,
        bindings: Vec<(String, VarRef)>,
    },
    /// Marks the point where one lexical scope's locals come into scope.
    BeginUpvalues(ScopeId),
    /// Move the listed captured locals from stack to heap storage and
    /// rewrite every live closure's pack entries. Placed by the relocation
    /// inserter on every exit of a capturing scope.
    RelocateUpvalues(Vec<LocalId>),
    /// Marker for where an upvalue import was materialised. No runtime
    /// effect.
    UpvalueImport(UpvalueId),
}

impl Stmt {
    /// True for statements after which control never falls through.
    pub fn is_unconditional_branch(&self) -> bool {
        match self {
            Stmt::Return(_) => true,
            Stmt::Jump { condition, .. } => condition.is_none(),
            Stmt::Block(stmts) => stmts.last().is_some_and(Stmt::is_unconditional_branch),
            _ => false,
        }
    }
}

/// An ordered collection of functions, classes and module variables, plus
/// the arenas every id type indexes. The front end constructs one of
/// these; the passes and the backend transform and consume it.
#[derive(Debug, Default)]
pub struct Module {
    pub name: Option<String>,
    pub fns: Vec<IRFn>,
    pub classes: Vec<IRClass>,
    pub locals: Vec<LocalDecl>,
    pub upvalues: Vec<UpvalueDecl>,
    pub globals: Vec<GlobalDecl>,
    pub scopes: Vec<ScopeDecl>,
    pub labels: Vec<LabelDecl>,
    pub main_fn: Option<FnId>,
}

impl Module {
    pub fn new(name: Option<String>) -> Module {
        Module { name, ..Module::default() }
    }

    pub fn add_fn(&mut self, func: IRFn) -> FnId {
        let id = FnId(self.fns.len() as u32);
        if let Some(parent) = func.parent {
            self.fns[parent.index()].closures.push(id);
        }
        if func.is_main {
            self.main_fn = Some(id);
        }
        self.fns.push(func);
        id
    }

    pub fn add_class(&mut self, class: IRClass) -> ClassId {
        let id = ClassId(self.classes.len() as u32);
        self.classes.push(class);
        id
    }

    pub fn add_local(&mut self, owner: FnId, name: impl Into<String>) -> LocalId {
        let id = LocalId(self.locals.len() as u32);
        self.locals.push(LocalDecl {
            name: name.into(),
            owner,
            upvalues: Vec::new(),
            begin_upvalues: None,
        });
        self.fns[owner.index()].locals.push(id);
        id
    }

    pub fn add_temporary(&mut self, owner: FnId, name: impl Into<String>) -> LocalId {
        let id = LocalId(self.locals.len() as u32);
        self.locals.push(LocalDecl {
            name: name.into(),
            owner,
            upvalues: Vec::new(),
            begin_upvalues: None,
        });
        self.fns[owner.index()].temporaries.push(id);
        id
    }

    pub fn add_upvalue(&mut self, owner: FnId, name: impl Into<String>, parent: VarRef) -> UpvalueId {
        debug_assert!(matches!(parent, VarRef::Local(_) | VarRef::Upvalue(_)));
        let id = UpvalueId(self.upvalues.len() as u32);
        self.upvalues.push(UpvalueDecl { name: name.into(), parent, owner });
        self.fns[owner.index()].upvalues.push(id);
        id
    }

    pub fn add_global(&mut self, name: impl Into<String>) -> GlobalId {
        let id = GlobalId(self.globals.len() as u32);
        self.globals.push(GlobalDecl { name: name.into(), undeclared_line_used: None });
        id
    }

    pub fn add_scope(&mut self) -> ScopeId {
        let id = ScopeId(self.scopes.len() as u32);
        self.scopes.push(ScopeDecl::default());
        id
    }

    pub fn add_label(&mut self, debug_name: impl Into<String>) -> LabelId {
        let id = LabelId(self.labels.len() as u32);
        self.labels.push(LabelDecl { debug_name: debug_name.into() });
        id
    }

    pub fn func(&self, id: FnId) -> &IRFn {
        &self.fns[id.index()]
    }

    pub fn func_mut(&mut self, id: FnId) -> &mut IRFn {
        &mut self.fns[id.index()]
    }

    pub fn class(&self, id: ClassId) -> &IRClass {
        &self.classes[id.index()]
    }

    pub fn local(&self, id: LocalId) -> &LocalDecl {
        &self.locals[id.index()]
    }

    pub fn local_mut(&mut self, id: LocalId) -> &mut LocalDecl {
        &mut self.locals[id.index()]
    }

    pub fn upvalue(&self, id: UpvalueId) -> &UpvalueDecl {
        &self.upvalues[id.index()]
    }

    pub fn global(&self, id: GlobalId) -> &GlobalDecl {
        &self.globals[id.index()]
    }

    pub fn scope(&self, id: ScopeId) -> &ScopeDecl {
        &self.scopes[id.index()]
    }

    pub fn label(&self, id: LabelId) -> &LabelDecl {
        &self.labels[id.index()]
    }

    pub fn find_global(&self, name: &str) -> Option<GlobalId> {
        self.globals
            .iter()
            .position(|g| g.name == name)
            .map(|i| GlobalId(i as u32))
    }

    /// Functions that are closures (have a lexical parent).
    pub fn closure_fns(&self) -> impl Iterator<Item = FnId> + '_ {
        self.fns
            .iter()
            .enumerate()
            .filter(|(_, f)| f.parent.is_some())
            .map(|(i, _)| FnId(i as u32))
    }

    /// Chase an upvalue's parent chain to the Local it ultimately
    /// captures. The chain is guaranteed to terminate at a Local in a
    /// strictly outer function; a malformed chain is a compiler bug.
    pub fn final_target(&self, upvalue: UpvalueId) -> LocalId {
        let mut current = upvalue;
        loop {
            match self.upvalue(current).parent {
                VarRef::Local(local) => return local,
                VarRef::Upvalue(next) => current = next,
                VarRef::Global(_) => {
                    eprintln!(
                        "upvalue '{}' has a global parent; chain must end at a local",
                        self.upvalue(current).name
                    );
                    std::process::abort();
                }
            }
        }
    }

    pub fn var_name(&self, var: VarRef) -> &str {
        match var {
            VarRef::Local(id) => &self.local(id).name,
            VarRef::Upvalue(id) => &self.upvalue(id).name,
            VarRef::Global(id) => &self.global(id).name,
        }
    }
}

// ---------------------------------------------------------------------------
// Debug printing
// ---------------------------------------------------------------------------

/// Renders a function body as an indented tree, for tests and debugging.
pub struct IRPrinter<'m> {
    module: &'m Module,
}

impl<'m> IRPrinter<'m> {
    pub fn new(module: &'m Module) -> IRPrinter<'m> {
        IRPrinter { module }
    }

    pub fn print_fn(&self, id: FnId) -> String {
        let func = self.module.func(id);
        let mut out = String::new();
        let _ = writeln!(
            out,
            "fn {} arity={}{}",
            func.debug_name,
            func.arity(),
            if func.is_main { " main" } else { "" }
        );
        self.print_stmt(&func.body, 1, &mut out);
        out
    }

    fn print_stmt(&self, stmt: &Stmt, depth: usize, out: &mut String) {
        let pad = "  ".repeat(depth);
        match stmt {
            Stmt::Assign { var, value } => {
                let _ = writeln!(out, "{pad}assign {} =", self.module.var_name(*var));
                self.print_expr(value, depth + 1, out);
            }
            Stmt::FieldAssign { field, value, .. } => {
                let _ = writeln!(out, "{pad}field-assign {} =", field.name);
                self.print_expr(value, depth + 1, out);
            }
            Stmt::EvalAndIgnore(expr) => {
                let _ = writeln!(out, "{pad}eval");
                self.print_expr(expr, depth + 1, out);
            }
            Stmt::Block(stmts) => {
                let _ = writeln!(out, "{pad}block");
                for s in stmts {
                    self.print_stmt(s, depth + 1, out);
                }
            }
            Stmt::Label(label) => {
                let _ = writeln!(out, "{pad}label {}", self.module.label(*label).debug_name);
            }
            Stmt::Jump { target, condition, looping, jump_on_false } => {
                let _ = writeln!(
                    out,
                    "{pad}jump {}{}{}",
                    self.module.label(*target).debug_name,
                    if *looping { " looping" } else { "" },
                    if *jump_on_false { " on-false" } else { "" }
                );
                if let Some(cond) = condition {
                    self.print_expr(cond, depth + 1, out);
                }
            }
            Stmt::Return(expr) => {
                let _ = writeln!(out, "{pad}return");
                self.print_expr(expr, depth + 1, out);
            }
            Stmt::LoadModule { module, .. } => {
                let _ = writeln!(out, "{pad}load-module {module}");
            }
            Stmt::BeginUpvalues(scope) => {
                let names: Vec<&str> = self
                    .module
                    .scope(*scope)
                    .locals
                    .iter()
                    .map(|l| self.module.local(*l).name.as_str())
                    .collect();
                let _ = writeln!(out, "{pad}begin-upvalues [{}]", names.join(", "));
            }
            Stmt::RelocateUpvalues(locals) => {
                let names: Vec<&str> =
                    locals.iter().map(|l| self.module.local(*l).name.as_str()).collect();
                let _ = writeln!(out, "{pad}relocate-upvalues [{}]", names.join(", "));
            }
            Stmt::UpvalueImport(upvalue) => {
                let _ = writeln!(out, "{pad}upvalue-import {}", self.module.upvalue(*upvalue).name);
            }
        }
    }

    fn print_expr(&self, expr: &Expr, depth: usize, out: &mut String) {
        let pad = "  ".repeat(depth);
        match expr {
            Expr::Const(lit) => {
                let _ = match lit {
                    Literal::Null => writeln!(out, "{pad}const null"),
                    Literal::Bool(b) => writeln!(out, "{pad}const {b}"),
                    Literal::Num(n) => writeln!(out, "{pad}const {n}"),
                    Literal::Str(s) => writeln!(out, "{pad}const {s:?}"),
                };
            }
            Expr::Load(var) => {
                let kind = match var {
                    VarRef::Local(_) => "local",
                    VarRef::Upvalue(_) => "upvalue",
                    VarRef::Global(_) => "global",
                };
                let _ = writeln!(out, "{pad}load {kind} {}", self.module.var_name(*var));
            }
            Expr::FieldLoad { field, .. } => {
                let _ = writeln!(out, "{pad}field-load {}", field.name);
            }
            Expr::Call { signature, receiver, args, super_call } => {
                let _ = writeln!(
                    out,
                    "{pad}call {}{}",
                    signature.canonical(),
                    if *super_call { " super" } else { "" }
                );
                self.print_expr(receiver, depth + 1, out);
                for arg in args {
                    self.print_expr(arg, depth + 1, out);
                }
            }
            Expr::Closure(func) => {
                let _ = writeln!(out, "{pad}closure {}", self.module.func(*func).debug_name);
            }
            Expr::LoadReceiver => {
                let _ = writeln!(out, "{pad}load-receiver");
            }
            Expr::RunStatements { body, temporary } => {
                let _ = writeln!(out, "{pad}run-statements -> {}", self.module.local(*temporary).name);
                self.print_stmt(body, depth + 1, out);
            }
            Expr::LogicalNot(inner) => {
                let _ = writeln!(out, "{pad}not");
                self.print_expr(inner, depth + 1, out);
            }
            Expr::AllocateInstance(class) => {
                let _ = writeln!(out, "{pad}allocate {}", self.module.class(*class).name);
            }
            Expr::SystemVar(name) => {
                let _ = writeln!(out, "{pad}system-var {name}");
            }
            Expr::GetClassVar(class) => {
                let _ = writeln!(out, "{pad}class-var {}", self.module.class(*class).name);
            }
        }
    }
}

use std::fmt::Write as _;

impl fmt::Display for Module {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let printer = IRPrinter::new(self);
        for (i, _) in self.fns.iter().enumerate() {
            f.write_str(&printer.print_fn(FnId(i as u32)))?;
        }
        Ok(())
    }
}
