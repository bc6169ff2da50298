//! Diagnostic reporting.
//!
//! Two taxonomies flow through here:
//! - compile-time *user* errors (duplicate local, undeclared module
//!   variable) are collected as [`Diagnostic`] values and returned up to
//!   the driver, which formats them;
//! - compile-time *internal* errors (unresolved variable, missing closable
//!   position, unknown node) indicate a compiler bug and abort the process
//!   after printing, via [`internal_error`].

use std::sync::atomic::{AtomicBool, Ordering};

/// A structured compile-time diagnostic.
#[derive(Debug, Clone)]
pub struct Diagnostic {
    pub message: String,
    /// Optional extra context or suggestion.
    pub note: Option<String>,
    /// Source line the error refers to, when known.
    pub line: Option<u32>,
}

impl Diagnostic {
    pub fn simple(message: impl Into<String>) -> Diagnostic {
        Diagnostic { message: message.into(), note: None, line: None }
    }

    pub fn with_line(message: impl Into<String>, line: u32) -> Diagnostic {
        Diagnostic { message: message.into(), note: None, line: Some(line) }
    }

    pub fn note(mut self, note: impl Into<String>) -> Diagnostic {
        self.note = Some(note.into());
        self
    }
}

impl std::fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.line {
            Some(line) => write!(f, "line {}: {}", line, self.message),
            None => f.write_str(&self.message),
        }
    }
}

impl std::error::Error for Diagnostic {}

pub type DiagnosticResult<T> = Result<T, Diagnostic>;

static DIAGNOSTICS_ENABLED: AtomicBool = AtomicBool::new(true);

/// Print a diagnostic to stderr, rustc-style.
pub fn emit_diagnostic(d: &Diagnostic) {
    if !DIAGNOSTICS_ENABLED.load(Ordering::SeqCst) {
        return;
    }
    let red = "\x1b[31m";
    let reset = "\x1b[0m";
    match d.line {
        Some(line) => eprintln!("{red}error{reset}: {} (line {})", d.message, line),
        None => eprintln!("{red}error{reset}: {}", d.message),
    }
    if let Some(note) = &d.note {
        let blue = "\x1b[34m";
        eprintln!("{blue}note{reset}: {note}");
    }
}

/// Print an internal-error diagnostic and abort. Internal errors mean the
/// compiler itself is wrong; any further emission would be nonsense.
pub fn internal_error(message: &str) -> ! {
    eprintln!("internal compiler error: {message}");
    std::process::abort();
}

/// Temporarily silence diagnostic printing; used by tests that exercise
/// error paths. The returned guard restores the previous state on drop.
pub fn suppress() -> SuppressGuard {
    let prev = DIAGNOSTICS_ENABLED.swap(false, Ordering::SeqCst);
    SuppressGuard { prev }
}

pub struct SuppressGuard {
    prev: bool,
}

impl Drop for SuppressGuard {
    fn drop(&mut self) {
        DIAGNOSTICS_ENABLED.store(self.prev, Ordering::SeqCst);
    }
}
