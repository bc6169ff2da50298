//! The compilation driver: runs the pass pipeline over an IR module and
//! emits a native object file.
//!
//! Passes run in a fixed sequence: the front end hands over a
//! scope-analysed module, then upvalue planning, relocation insertion and
//! code generation. The emitted LLVM module is verified (a failure is a
//! compiler bug and aborts) and compiled in-process through a
//! `TargetMachine` — no external toolchain for the IR → object step.

use std::path::PathBuf;

use anyhow::{Context as _, Result, anyhow};
use inkwell::OptimizationLevel;
use inkwell::context::Context;
use inkwell::targets::{
    CodeModel, FileType, InitializationConfig, RelocMode, Target, TargetMachine,
};

use crate::ir;
use crate::relocate;
use crate::upvalues;

/// What the driver gets back from a compile.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputFormat {
    Object,
}

#[derive(Debug)]
pub struct CompilationResult {
    /// Temporary path the object file was written to.
    pub path: PathBuf,
    pub format: OutputFormat,
}

/// Compile a module to a native object file at a temporary path.
pub fn compile_module(module: &mut ir::Module) -> Result<CompilationResult> {
    let plan = upvalues::plan(module);
    relocate::insert_relocations(module, &plan);

    let context = Context::create();
    let gen = crate::codegen::generate(&context, module, &plan);

    // Verification failing means we emitted nonsense; nothing downstream
    // is worth running.
    if let Err(message) = gen.module.verify() {
        eprintln!("LLVM IR validation failed:\n{}", message.to_string());
        std::process::exit(1);
    }

    Target::initialize_native(&InitializationConfig::default())
        .map_err(|e| anyhow!("failed to initialize native target: {e}"))?;
    let triple = TargetMachine::get_default_triple();
    gen.module.set_triple(&triple);

    let target = Target::from_triple(&triple).map_err(|e| anyhow!("{e}"))?;
    // Prefer a generic CPU; "native" is misread as a subtarget on some
    // LLVM targets.
    let machine = ["", "native"]
        .iter()
        .find_map(|cpu| {
            target.create_target_machine(
                &triple,
                cpu,
                "",
                OptimizationLevel::Default,
                RelocMode::Default,
                CodeModel::Default,
            )
        })
        .ok_or_else(|| {
            anyhow!(
                "failed to create a TargetMachine for {}",
                triple.as_str().to_string_lossy()
            )
        })?;

    let path = tempfile::Builder::new()
        .prefix("wren-output")
        .suffix(".o")
        .tempfile()
        .context("failed to create object file")?
        .into_temp_path()
        .keep()
        .context("failed to persist object file")?;

    machine
        .write_to_file(&gen.module, FileType::Object, &path)
        .map_err(|e| anyhow!("TargetMachine failed to emit {}: {e}", path.display()))?;

    Ok(CompilationResult { path, format: OutputFormat::Object })
}

/// Run the IR-to-IR passes and return the printed LLVM IR without touching
/// a target machine. Test and debugging entry point.
pub fn lower_to_ir_string(module: &mut ir::Module) -> Result<String> {
    let plan = upvalues::plan(module);
    relocate::insert_relocations(module, &plan);

    let context = Context::create();
    let gen = crate::codegen::generate(&context, module, &plan);
    gen.module
        .verify()
        .map_err(|message| anyhow!("LLVM IR validation failed:\n{}", message.to_string()))?;
    Ok(gen.module.print_to_string().to_string())
}
