use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser as ClapParser;

use dgeval::{
    OptimizationFlags, backend, compile,
    diagnostics::Message,
    frontend::{SourceFile, SourceFileOrigin},
    middle::lir::pretty_print::render_ic,
    printer,
};

#[derive(Debug, ClapParser)]
#[command(version, about = "A dataflow expression compiler and JIT", long_about = None)]
struct Args {
    /// Enabled optimisations as a 4-bit set: dead statements, dead comma
    /// parts, peephole store/load, peephole constant sink.
    #[arg(short = 'p', value_parser = clap::value_parser!(u8).range(0..=15))]
    optimizations: Option<u8>,

    /// Module name; the source is read from `<module>.txt`.
    module: String,
}

fn main() -> ExitCode {
    let args = match Args::try_parse() {
        Ok(args) => args,
        Err(error) => {
            eprint!("{error}");
            return ExitCode::FAILURE;
        }
    };

    let flags = args
        .optimizations
        .map(OptimizationFlags::from_bits)
        .unwrap_or_default();

    /* Read the module source */

    let source_path = PathBuf::from(format!("{}.txt", args.module));
    let contents = match std::fs::read_to_string(&source_path) {
        Ok(contents) => contents,
        Err(_) => {
            eprintln!("File not found!");
            return ExitCode::FAILURE;
        }
    };

    let source = SourceFile {
        contents,
        origin: SourceFileOrigin::File(source_path),
    };

    /* Front and middle end */

    let mut program = compile(&source, flags);

    if !program.any_errors() && !program.instructions.is_empty() {
        let ic_path = format!("{}-IC.txt", args.module);
        if let Err(error) = std::fs::write(&ic_path, render_ic(&program.instructions) + "\n") {
            eprintln!("Failed to write {ic_path}: {error}");
            return ExitCode::FAILURE;
        }
    }

    program.messages.push(Message::info("Completed compilation"));
    program.sort_messages();

    /* Dump and echo the diagnostics */

    let json_path = format!("{}.json", args.module);
    let dump = serde_json::to_string_pretty(&printer::program_to_json(&program))
        .expect("the dump is valid JSON");
    if let Err(error) = std::fs::write(&json_path, dump + "\n") {
        eprintln!("Failed to write {json_path}: {error}");
        return ExitCode::FAILURE;
    }

    for message in &program.messages {
        message.print();
    }

    /* Back end */

    if !program.any_errors() {
        let mut compiled =
            backend::generate(&mut program).expect("failed to map executable memory");
        compiled.run();
    }

    ExitCode::SUCCESS
}
