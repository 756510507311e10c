//! The IR3 program model.
//!
//! IR3 is a function-structured three-address representation: named
//! variables, labels, arithmetic and comparison expressions, memory loads
//! and stores, branches, returns and calls. The model here is fully
//! name-resolved; references are index handles into the owning function
//! or program rather than strings.

mod block;
mod instruction;
mod program;
mod tree;

pub use block::{build_blocks, BasicBlock, Liveness};
pub use instruction::{Expr, FunctionRef, Instruction, Operator};
pub use program::{
    runtime_table, BlockId, ExtId, ExternalFunction, FnId, Ir3Function, Program, VarId, Variable,
};
pub use tree::{build_tree_boxes, Node, NodeKind, Tree, TreeBox};
