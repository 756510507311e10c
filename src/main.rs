//! # ir3c
//!
//! A compiler back end that lowers IR3, a function-structured
//! three-address representation, into the register-oriented IR2
//! language.
//!
//! The pipeline runs in fixed stages, each completing before the next:
//! parsing, arity validation, basic-block formation, computation-tree
//! construction, liveness analysis, tree merging, and tile-based
//! instruction selection with IR2 emission.

use std::fs;
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;

use commandline::{Operation, Options};
use error::CompileError;
use ir::Program;

mod analysis;
mod codegen;
mod commandline;
mod error;
mod ir;
mod parser;
mod prelude;

fn main() -> Result<()> {
    env_logger::init();
    let options = Options::parse();

    match options.operation {
        Operation::Check { file } => {
            let source = read_source(&file)?;
            check(&source)?;
            Ok(())
        }
        Operation::Compile { file, output } => {
            let source = read_source(&file)?;
            let ir2 = compile(&source)?;
            let target = output
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from(&file).with_extension("L2"));
            fs::write(&target, ir2)
                .with_context(|| format!("Could not write '{}'", target.display()))?;
            Ok(())
        }
    }
}

fn read_source(file: &str) -> Result<String> {
    fs::read_to_string(file).with_context(|| format!("Could not read '{file}'"))
}

/// Parses and validates a program without generating code.
pub fn check(source: &str) -> Result<Program, CompileError> {
    let program = parser::parse(source)?;
    program.validate_arities()?;
    Ok(program)
}

/// Runs the full pipeline and returns the IR2 text.
pub fn compile(source: &str) -> Result<String, CompileError> {
    let mut program = check(source)?;
    analysis::generate_data_flow(&mut program)?;
    analysis::merge_trees(&mut program);
    codegen::generate_program_code(&program)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identity_function_end_to_end() {
        let ir2 = compile("define @main (%x) {\nreturn %x\n}").unwrap();
        assert_eq!("(@main\n(@main 1\n%x <- rdi\nrax <- %x\nreturn\n)\n)\n", ir2);
    }

    #[test]
    fn arity_errors_abort_compilation() {
        let result = compile("define @main () {\ncall print (1, 2)\nreturn\n}");
        assert!(matches!(
            result,
            Err(CompileError::ArityMismatch { callee, count })
                if callee == "print" && count == 2
        ));
    }

    #[test]
    fn user_function_arity_is_validated() {
        let result = compile(
            "define @main () {\n%v <- call @f (1)\nreturn\n}\n\
             define @f (%a, %b) {\nreturn %a\n}",
        );
        assert!(matches!(
            result,
            Err(CompileError::ArityMismatch { callee, count })
                if callee == "@f" && count == 1
        ));
    }

    #[test]
    fn unknown_branch_targets_abort_compilation() {
        let result = compile("define @main () {\nbr :nowhere\n}");
        assert!(matches!(
            result,
            Err(CompileError::UnknownBranchTarget { label, function })
                if label == "nowhere" && function == "main"
        ));
    }

    #[test]
    fn a_small_loop_compiles() {
        let ir2 = compile(
            "define @main (%n) {\n%i <- 0\n:loop\n%c <- %i < %n\nbr %c :body\nreturn %i\n\
             :body\n%i <- %i + 1\nbr :loop\n}",
        )
        .unwrap();

        for line in [
            "(@main 1",
            "%n <- rdi",
            ":_mainloop",
            "cjump 0 < %c :_mainbody",
            ":_mainbody",
            "goto :_mainloop",
            "rax <- %i",
        ] {
            assert!(ir2.contains(line), "missing '{line}' in:\n{ir2}");
        }
    }

    #[test]
    fn every_branch_reference_has_a_defined_label() {
        let ir2 = compile(
            "define @main (%n) {\nbr %n :a\nreturn\n:a\nbr :b\n:b\nreturn\n}\n\
             define @f (%n) {\nbr %n :a\nreturn\n:a\nreturn\n}",
        )
        .unwrap();

        let defined: Vec<&str> = ir2
            .lines()
            .filter(|line| line.starts_with(':'))
            .collect();
        for line in ir2.lines() {
            for reference in ["goto :", "cjump 0 < %n :"] {
                if let Some(label) = line.strip_prefix(reference) {
                    assert!(defined.contains(&&*format!(":{label}")), "undefined {label}");
                }
            }
        }
        // Same label name in two functions stays distinct.
        assert!(ir2.contains(":_maina"));
        assert!(ir2.contains(":_fa"));
    }
}
