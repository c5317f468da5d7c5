//! A compiler and x86-64 JIT for a small dataflow expression language.
//! Statements are scheduled by their data dependencies rather than their
//! source order, type checked, constant folded, flattened into a
//! stack-machine IR, peephole optimised, and emitted as native code that
//! runs against an arena-based runtime library.

pub mod backend;
pub mod diagnostics;
pub mod frontend;
pub mod middle;
pub mod printer;
pub mod runtime;

pub use middle::optimization::OptimizationFlags;

use frontend::{Parser, SourceFile, ast::Program};

/// Runs the front and middle end: parse, dependency-sort, type check, fold,
/// lower to IR, peephole. Each stage only runs while no errors have been
/// recorded; the caller decides whether to hand the result to the backend.
pub fn compile(source: &SourceFile, flags: OptimizationFlags) -> Program {
    let mut program = match Parser::parse_module(source) {
        Ok(statements) => Program::new(statements),
        Err(message) => {
            let mut program = Program::default();
            program.messages.push(message);
            return program;
        }
    };

    middle::dependency::sort_statements(&mut program);
    middle::type_check::check(&mut program);

    if program.any_errors() {
        return program;
    }

    middle::fold::run(&mut program);

    if !program.any_errors() {
        middle::lir::ast_lowering::lower_to_ir(&mut program, flags);
        middle::optimization::peephole::run(&mut program.instructions, flags);
    }

    program
}
