//! The top-level program aggregate and its owned items.

use std::collections::HashMap;

use crate::error::CompileError;

use super::block::BasicBlock;
use super::instruction::{Expr, FunctionRef, Instruction};

/// Index of a variable within its owning function.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct VarId(pub usize);

/// Index of a basic block within its owning function.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BlockId(pub usize);

/// Index of a function within the program.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FnId(pub usize);

/// Index of an external function within the runtime table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ExtId(pub usize);

/// A named variable. Identity is the `VarId` handle; two variables with
/// the same name in different functions are distinct.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Variable {
    pub name: String,
}

impl Variable {
    pub fn new<S: Into<String>>(name: S) -> Self {
        Self { name: name.into() }
    }
}

/// A runtime-provided callable. Its body is never compiled; only the
/// argument count is validated.
#[derive(Debug, Clone)]
pub struct ExternalFunction {
    pub name: String,
    valid_arg_counts: Vec<usize>,
}

impl ExternalFunction {
    pub fn new<S: Into<String>>(name: S, valid_arg_counts: Vec<usize>) -> Self {
        Self {
            name: name.into(),
            valid_arg_counts,
        }
    }

    pub fn accepts(&self, arg_count: usize) -> bool {
        self.valid_arg_counts.contains(&arg_count)
    }
}

/// The fixed set of external functions every program may call.
pub fn runtime_table() -> Vec<ExternalFunction> {
    vec![
        ExternalFunction::new("input", vec![0]),
        ExternalFunction::new("print", vec![1]),
        ExternalFunction::new("allocate", vec![2]),
        ExternalFunction::new("tuple-error", vec![3]),
        ExternalFunction::new("tensor-error", vec![1, 3, 4]),
    ]
}

/// A function defined in IR3 source. Owns its variables and basic blocks;
/// the first block is the entry.
#[derive(Debug)]
pub struct Ir3Function {
    pub name: String,
    pub vars: Vec<Variable>,
    pub params: Vec<VarId>,
    pub blocks: Vec<BasicBlock>,
    /// Labels defined in this function, mapped to the block they open.
    pub labels: HashMap<String, BlockId>,
}

impl Ir3Function {
    /// Builds a function from the flat instruction stream the parser
    /// produces, splitting it into basic blocks.
    pub fn new(
        name: String,
        vars: Vec<Variable>,
        params: Vec<VarId>,
        instructions: Vec<Instruction>,
    ) -> Result<Self, CompileError> {
        let (blocks, labels) = super::block::build_blocks(&name, instructions)?;
        Ok(Self {
            name,
            vars,
            params,
            blocks,
            labels,
        })
    }

    pub fn var_name(&self, id: VarId) -> &str {
        &self.vars[id.0].name
    }

    /// The label opening the given block. Blocks that are branch targets
    /// always carry one.
    pub fn block_label(&self, id: BlockId) -> Option<&str> {
        self.blocks[id.0].label.as_deref()
    }
}

/// A whole IR3 program: user functions, the runtime table, and the entry
/// reference (conventionally named `main`).
#[derive(Debug)]
pub struct Program {
    pub functions: Vec<Ir3Function>,
    pub externals: Vec<ExternalFunction>,
    pub main_fn: FnId,
    /// The name the entry reference was written with; the emitted IR2
    /// program is wrapped in it.
    pub main_name: String,
}

impl Program {
    pub fn function(&self, id: FnId) -> &Ir3Function {
        &self.functions[id.0]
    }

    pub fn external(&self, id: ExtId) -> &ExternalFunction {
        &self.externals[id.0]
    }

    pub fn function_name(&self, fref: FunctionRef) -> &str {
        match fref {
            FunctionRef::Ir3(id) => &self.function(id).name,
            FunctionRef::External(id) => &self.external(id).name,
        }
    }

    /// The function the entry reference resolves to. The reference keeps
    /// its written name (`main_name`) even when it binds to a function
    /// defined under another name.
    pub fn entry_function(&self) -> Result<&Ir3Function, CompileError> {
        self.functions.get(self.main_fn.0).ok_or_else(|| {
            CompileError::internal(format!(
                "entry reference '@{}' does not resolve to a defined function",
                self.main_name
            ))
        })
    }

    /// Checks every call in the program against the callee's permitted
    /// argument counts. Indirect calls through a variable cannot be
    /// checked statically and are skipped. Also asserts that the entry
    /// reference resolves.
    pub fn validate_arities(&self) -> Result<(), CompileError> {
        self.entry_function()?;
        for function in &self.functions {
            for block in &function.blocks {
                for instruction in &block.instructions {
                    match instruction {
                        Instruction::Assign { source, .. } => self.check_expr(source)?,
                        Instruction::Branch {
                            condition: Some(condition),
                            ..
                        } => self.check_expr(condition)?,
                        Instruction::Return(Some(value)) => self.check_expr(value)?,
                        _ => (),
                    }
                }
            }
        }
        Ok(())
    }

    fn check_expr(&self, expr: &Expr) -> Result<(), CompileError> {
        match expr {
            Expr::Binary { lhs, rhs, .. } => {
                self.check_expr(lhs)?;
                self.check_expr(rhs)
            }
            Expr::Call { callee, args } => {
                for arg in args {
                    self.check_expr(arg)?;
                }
                self.check_expr(callee)?;
                match &**callee {
                    Expr::Function(FunctionRef::Ir3(id)) => {
                        let function = self.function(*id);
                        if function.params.len() != args.len() {
                            return Err(CompileError::ArityMismatch {
                                callee: format!("@{}", function.name),
                                count: args.len(),
                            });
                        }
                    }
                    Expr::Function(FunctionRef::External(id)) => {
                        let external = self.external(*id);
                        if !external.accepts(args.len()) {
                            return Err(CompileError::ArityMismatch {
                                callee: external.name.clone(),
                                count: args.len(),
                            });
                        }
                    }
                    _ => (),
                }
                Ok(())
            }
            _ => Ok(()),
        }
    }
}
