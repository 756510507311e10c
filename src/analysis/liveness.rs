//! Computation-tree construction and variable liveness.
//!
//! For each block the trees are built first, then gen/kill are
//! accumulated by walking the trees backwards: a write removes the
//! variable from gen before its reads are added, so a read that only
//! happens after a later write in the same block is correctly excluded.
//! The in/out sets then iterate to a fixed point over the successor
//! edges; convergence is guaranteed because the sets only ever grow.

use std::collections::HashSet;

use crate::error::CompileError;
use crate::ir::{build_tree_boxes, Ir3Function, Program, VarId};
use crate::prelude::*;

/// Attaches computation trees to every block of the program and solves
/// the liveness equations.
pub fn generate_data_flow(program: &mut Program) -> Result<(), CompileError> {
    for function in &mut program.functions {
        attach_trees(function)?;
        solve_function(function);
    }
    Ok(())
}

fn attach_trees(function: &mut Ir3Function) -> Result<(), CompileError> {
    let boxes: Vec<_> = function
        .blocks
        .iter()
        .map(|block| build_tree_boxes(&block.instructions, &function.labels, &function.name))
        .collect::<Result<_, _>>()?;
    for (block, trees) in function.blocks.iter_mut().zip(boxes) {
        block.trees = trees;
    }
    Ok(())
}

fn solve_function(function: &mut Ir3Function) {
    for block in &mut function.blocks {
        let liveness = &mut block.liveness;
        liveness.gen_set.clear();
        liveness.kill_set.clear();
        for tree_box in block.trees.iter().rev() {
            if let Some(written) = tree_box.var_written {
                liveness.kill_set.insert(written);
                liveness.gen_set.remove(&written);
            }
            liveness.gen_set.extend(tree_box.vars_read.iter().copied());
        }
        liveness.in_set = liveness.gen_set.clone();
        liveness.out_set.clear();
    }

    let mut rounds = 0;
    loop {
        rounds += 1;
        let mut changed = false;
        for index in 0..function.blocks.len() {
            let new_out: HashSet<VarId> = function.blocks[index]
                .successors
                .iter()
                .flat_map(|successor| {
                    function.blocks[successor.0].liveness.in_set.iter().copied()
                })
                .collect();

            let liveness = &mut function.blocks[index].liveness;
            if liveness.out_set != new_out {
                changed = true;
                liveness.out_set = new_out;
            }

            let mut new_in = liveness.gen_set.clone();
            new_in.extend(liveness.out_set.difference(&liveness.kill_set).copied());
            if liveness.in_set != new_in {
                changed = true;
                liveness.in_set = new_in;
            }
        }
        if !changed {
            break;
        }
    }
    debug!(
        "liveness for @{} converged after {} round(s)",
        function.name, rounds
    );
}
