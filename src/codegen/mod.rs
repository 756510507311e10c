//! IR2 code generation.
//!
//! Walks the analysed program function by function, block by block, and
//! renders the selected tiles as IR2 text. The calling-convention glue
//! (parameter loads, argument prepping, return labels) lives in
//! [`target`]; tile selection lives in [`tiles`].

mod target;
mod tiles;

use crate::error::CompileError;
use crate::ir::{BlockId, FunctionRef, Ir3Function, Program, Tree, VarId};
use crate::prelude::*;

/// Per-function emission state: name lookups and the reserved scratch
/// variable.
pub(crate) struct FunctionContext<'a> {
    pub program: &'a Program,
    pub function: &'a Ir3Function,
    /// Rendered name of the scratch variable the arithmetic tile routes
    /// through. Extended with underscores until it collides with no
    /// variable of this function.
    pub scratch: String,
}

impl<'a> FunctionContext<'a> {
    fn new(program: &'a Program, function: &'a Ir3Function) -> Self {
        let mut name = String::from("_");
        while function.vars.iter().any(|var| var.name == name) {
            name.push('_');
        }
        Self {
            program,
            function,
            scratch: format!("%{name}"),
        }
    }

    pub fn var(&self, id: VarId) -> String {
        format!("%{}", self.function.var_name(id))
    }

    /// The mangled IR2 reference for a block's label.
    pub fn block_label(&self, id: BlockId) -> Result<String, CompileError> {
        let label = self.function.block_label(id).ok_or_else(|| {
            CompileError::internal(format!(
                "block without a label referenced in function '@{}'",
                self.function.name
            ))
        })?;
        Ok(format!(
            ":{}",
            target::mangle_label(&self.function.name, label)
        ))
    }

    /// Renders a tree in operand position: atoms directly, delegated
    /// nodes through their destination variable.
    pub fn atom(&self, tree: &Tree) -> Result<String, CompileError> {
        match tree {
            Tree::Var(id) => Ok(self.var(*id)),
            Tree::Num(value) => Ok(value.to_string()),
            Tree::Block(id) => self.block_label(*id),
            Tree::Function(FunctionRef::Ir3(id)) => {
                Ok(format!("@{}", self.program.function(*id).name))
            }
            Tree::Function(FunctionRef::External(id)) => {
                Ok(self.program.external(*id).name.clone())
            }
            Tree::Node(node) => node.destination.map(|dest| self.var(dest)).ok_or_else(|| {
                CompileError::internal(format!(
                    "operand tree without a destination in function '@{}'",
                    self.function.name
                ))
            }),
        }
    }
}

/// Renders the whole program as IR2 text. Trees must be built, liveness
/// solved and merging done.
pub fn generate_program_code(program: &Program) -> Result<String, CompileError> {
    let mut output = String::new();
    let mut ret_labels = 0;

    output.push_str(&format!("(@{}\n", program.main_name));
    for function in &program.functions {
        generate_function_code(program, function, &mut ret_labels, &mut output)?;
    }
    output.push_str(")\n");
    Ok(output)
}

fn generate_function_code(
    program: &Program,
    function: &Ir3Function,
    ret_labels: &mut usize,
    output: &mut String,
) -> Result<(), CompileError> {
    debug!(
        "generating IR2 for @{} ({} blocks)",
        function.name,
        function.blocks.len()
    );
    let context = FunctionContext::new(program, function);

    output.push_str(&format!("(@{} {}\n", function.name, function.params.len()));
    for (index, param) in function.params.iter().enumerate() {
        output.push_str(&target::argument_loading_instruction(
            &context.var(*param),
            index,
            function.params.len(),
        ));
        output.push('\n');
    }

    for block in &function.blocks {
        if let Some(label) = &block.label {
            output.push_str(&format!(
                ":{}\n",
                target::mangle_label(&function.name, label)
            ));
        }
        for line in tiles::tile_block(&block.trees, &context, ret_labels)? {
            output.push_str(&line);
            output.push('\n');
        }
    }

    output.push_str(")\n");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analysis::{generate_data_flow, merge_trees};
    use crate::parser::parse;

    fn compile(source: &str) -> String {
        let mut program = parse(source).unwrap();
        program.validate_arities().unwrap();
        generate_data_flow(&mut program).unwrap();
        merge_trees(&mut program);
        generate_program_code(&program).unwrap()
    }

    #[test]
    fn identity_function() {
        let ir2 = compile("define @main (%x) {\nreturn %x\n}");
        assert_eq!("(@main\n(@main 1\n%x <- rdi\nrax <- %x\nreturn\n)\n)\n", ir2);
    }

    #[test]
    fn program_wrapper_uses_the_entry_name() {
        let ir2 = compile("define @f (%x) {\nreturn %x\n}");
        assert_eq!("(@main\n(@f 1\n%x <- rdi\nrax <- %x\nreturn\n)\n)\n", ir2);
    }

    #[test]
    fn two_argument_add_goes_through_the_scratch_variable() {
        let ir2 = compile("define @f (%a, %b) {\n%c <- %a + %b\nreturn %c\n}");
        assert_eq!(
            "(@main\n(@f 2\n%a <- rdi\n%b <- rsi\n\
             %_ <- %a\n%_ += %b\n%c <- %_\n\
             rax <- %c\nreturn\n)\n)\n",
            ir2
        );
    }

    #[test]
    fn call_with_overflow_arguments() {
        let ir2 = compile(
            "define @main (%a1, %a2, %a3, %a4, %a5, %a6, %a7) {\
             \ncall @g (%a1, %a2, %a3, %a4, %a5, %a6, %a7)\nreturn\n}\n\
             define @g (%b1, %b2, %b3, %b4, %b5, %b6, %b7) {\nreturn %b7\n}",
        );

        for line in [
            "rdi <- %a1",
            "rsi <- %a2",
            "rdx <- %a3",
            "rcx <- %a4",
            "r8 <- %a5",
            "r9 <- %a6",
            "mem rsp -16 <- %a7",
            "mem rsp -8 <- :ret0",
            "call @g 7",
            ":ret0",
        ] {
            assert!(ir2.contains(line), "missing '{line}' in:\n{ir2}");
        }
        // The callee reads its seventh parameter from the stack.
        assert!(ir2.contains("%b7 <- stack-arg 0"));
    }

    #[test]
    fn conditional_branches_become_cjumps_with_mangled_labels() {
        let ir2 = compile(
            "define @f (%c) {\nbr %c :L\nreturn\n:L\nreturn\n}\n\
             define @main () {\nreturn\n}",
        );
        assert!(ir2.contains("cjump 0 < %c :_fL"), "in:\n{ir2}");
        assert!(ir2.contains("\n:_fL\n"), "in:\n{ir2}");
    }

    #[test]
    fn unconditional_branches_become_gotos() {
        let ir2 = compile("define @main () {\nbr :done\n:done\nreturn\n}");
        assert!(ir2.contains("goto :_maindone"));
        assert!(ir2.contains("\n:_maindone\n"));
    }

    #[test]
    fn store_load_round_trip() {
        let ir2 = compile(
            "define @main (%p, %v) {\nstore %p <- %v\n%w <- load %p\nreturn %w\n}",
        );
        let store = ir2.find("mem %p 0 <- %v").expect("store line");
        let load = ir2.find("%w <- mem %p 0").expect("load line");
        assert!(store < load);
    }

    #[test]
    fn comparison_operands_mirror_for_greater_than() {
        let ir2 = compile("define @main (%a, %b) {\n%c <- %a > %b\nreturn %c\n}");
        assert!(ir2.contains("%c <- %b < %a"), "in:\n{ir2}");

        let ir2 = compile("define @main (%a, %b) {\n%c <- %a >= %b\nreturn %c\n}");
        assert!(ir2.contains("%c <- %b <= %a"), "in:\n{ir2}");
    }

    #[test]
    fn external_calls_have_no_return_label() {
        let ir2 = compile("define @main (%v) {\ncall print (%v)\nreturn\n}");
        assert!(ir2.contains("rdi <- %v"));
        assert!(ir2.contains("call print 1"));
        assert!(!ir2.contains("ret0"));
    }

    #[test]
    fn call_results_are_read_from_rax() {
        let ir2 = compile("define @main () {\n%v <- call input ()\nreturn %v\n}");
        assert!(ir2.contains("call input 0\n%v <- rax"));
    }

    #[test]
    fn return_labels_count_across_functions() {
        let ir2 = compile(
            "define @main () {\n%a <- call @g ()\n%b <- call @g ()\nreturn %a\n}\n\
             define @g () {\n%c <- call @main ()\nreturn %c\n}",
        );
        for label in [":ret0", ":ret1", ":ret2"] {
            assert!(ir2.contains(label), "missing {label} in:\n{ir2}");
        }
        assert!(!ir2.contains(":ret3"));
    }

    #[test]
    fn scratch_variable_avoids_user_names() {
        let ir2 = compile("define @main (%_) {\n%c <- %_ + 1\nreturn %c\n}");
        assert!(ir2.contains("%__ <- %_\n%__ += 1\n%c <- %__"), "in:\n{ir2}");
    }

    #[test]
    fn merged_chains_emit_children_before_parents() {
        // store's value is a merged load; the load's line must come out
        // first even though the store tile is selected first.
        let ir2 = compile(
            "define @main (%p, %q) {\n%a <- load %p\nstore %q <- %a\nreturn\n}",
        );
        let load = ir2.find("%a <- mem %p 0").expect("load line");
        let store = ir2.find("mem %q 0 <- %a").expect("store line");
        assert!(load < store, "in:\n{ir2}");
    }

    #[test]
    fn labels_as_values_render_mangled() {
        let ir2 = compile("define @main () {\n%v <- :target\nbr :target\n:target\nreturn\n}");
        assert!(ir2.contains("%v <- :_maintarget"), "in:\n{ir2}");
    }
}
