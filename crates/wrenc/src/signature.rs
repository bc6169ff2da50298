//! Method signatures and the process-wide signature registry.
//!
//! A signature identifies a method by name, arity and call syntax. Two
//! signatures are the same method iff their canonical strings are equal;
//! the canonical string hashes to the 64-bit signature ID used for
//! dispatch (see `wren_abi::signature_id`). Static-ness is deliberately
//! not part of the signature: static methods are ordinary methods on the
//! metaclass.

use std::collections::HashMap;
use std::fmt;

/// The different signature syntaxes for different kinds of methods.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SignatureKind {
    /// A name followed by a (possibly empty) parenthesized parameter list.
    /// Also used for binary operators.
    Method,
    /// Just a name. Also used for unary operators.
    Getter,
    /// A name followed by `=`.
    Setter,
    /// A square-bracketed parameter list.
    Subscript,
    /// A square-bracketed parameter list followed by `=`.
    SubscriptSetter,
    /// A constructor initializer. Has a distinct canonical form so it can't
    /// be invoked directly on the metaclass.
    Initializer,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Signature {
    pub name: String,
    pub kind: SignatureKind,
    pub arity: usize,
}

fn parameter_list(count: usize, open: char, close: char) -> String {
    let mut out = String::new();
    out.push(open);
    for i in 0..count {
        if i > 0 {
            out.push(',');
        }
        out.push('_');
    }
    out.push(close);
    out
}

impl Signature {
    pub fn method(name: impl Into<String>, arity: usize) -> Signature {
        Signature { name: name.into(), kind: SignatureKind::Method, arity }
    }

    pub fn getter(name: impl Into<String>) -> Signature {
        Signature { name: name.into(), kind: SignatureKind::Getter, arity: 0 }
    }

    pub fn setter(name: impl Into<String>) -> Signature {
        Signature { name: name.into(), kind: SignatureKind::Setter, arity: 1 }
    }

    pub fn subscript(arity: usize) -> Signature {
        Signature { name: String::new(), kind: SignatureKind::Subscript, arity }
    }

    pub fn subscript_setter(arity: usize) -> Signature {
        Signature { name: String::new(), kind: SignatureKind::SubscriptSetter, arity }
    }

    pub fn initializer(name: impl Into<String>, arity: usize) -> Signature {
        Signature { name: name.into(), kind: SignatureKind::Initializer, arity }
    }

    /// The canonical string form, e.g. `add(_)`, `count`, `name=(_)`,
    /// `[_,_]`, `[_]=(_)`, `init new(_)`.
    pub fn canonical(&self) -> String {
        match self.kind {
            SignatureKind::Method => {
                format!("{}{}", self.name, parameter_list(self.arity, '(', ')'))
            }
            SignatureKind::Getter => self.name.clone(),
            SignatureKind::Setter => format!("{}={}", self.name, parameter_list(1, '(', ')')),
            SignatureKind::Subscript => {
                format!("{}{}", self.name, parameter_list(self.arity, '[', ']'))
            }
            SignatureKind::SubscriptSetter => format!(
                "{}{}={}",
                self.name,
                parameter_list(self.arity - 1, '[', ']'),
                parameter_list(1, '(', ')')
            ),
            SignatureKind::Initializer => {
                format!("init {}{}", self.name, parameter_list(self.arity, '(', ')'))
            }
        }
    }

    /// The 64-bit dispatch ID of this signature.
    pub fn id(&self) -> u64 {
        wren_abi::signature_id(&self.canonical())
    }
}

impl fmt::Display for Signature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.canonical())
    }
}

/// Bidirectional intern table between canonical strings and IDs.
///
/// `find` is idempotent and referentially transparent within a process.
/// IDs come from the ABI hash, so two modules compiled in the same process
/// (or different processes) agree without sharing this table; the table
/// exists to map IDs back to strings and to detect collisions, which are
/// treated as compiler bugs.
#[derive(Debug, Default)]
pub struct SignatureRegistry {
    by_id: HashMap<u64, String>,
}

impl SignatureRegistry {
    pub fn new() -> SignatureRegistry {
        SignatureRegistry::default()
    }

    /// Intern a canonical signature string, returning its ID.
    pub fn find(&mut self, canonical: &str) -> u64 {
        let id = wren_abi::signature_id(canonical);
        match self.by_id.get(&id) {
            Some(existing) if existing != canonical => {
                eprintln!(
                    "signature hash collision: '{}' and '{}' both map to {:#x}",
                    existing, canonical, id
                );
                std::process::abort();
            }
            Some(_) => {}
            None => {
                self.by_id.insert(id, canonical.to_string());
            }
        }
        id
    }

    /// The canonical string for an interned ID, if any.
    pub fn lookup(&self, id: u64) -> Option<&str> {
        self.by_id.get(&id).map(String::as_str)
    }

    /// All interned canonical strings, sorted, for the signatures table.
    pub fn canonical_strings(&self) -> Vec<&str> {
        let mut out: Vec<&str> = self.by_id.values().map(String::as_str).collect();
        out.sort_unstable();
        out
    }
}
