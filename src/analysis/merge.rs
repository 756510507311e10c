//! Tree merging.
//!
//! A producer tree that writes a variable can be folded into the single
//! later tree that reads it, shrinking the number of roots to tile and
//! letting one tile span what used to be several instructions. Liveness
//! is the correctness oracle: a variable that is still live on block
//! exit keeps its assignment.
//!
//! The block is scanned in reverse, keeping a map from each variable to
//! the most recently seen tree that could consume it. An entry is
//! poisoned as soon as a second pending reader shows up, so a fold never
//! skips over another read of the same variable.

use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::collections::HashSet;

use crate::ir::{BasicBlock, Ir3Function, NodeKind, Program, Tree, TreeBox, VarId, Variable};
use crate::prelude::*;

/// Folds eligible producer trees into their consumers, in every block of
/// every function. Liveness must already be solved.
pub fn merge_trees(program: &mut Program) {
    for function in &mut program.functions {
        let Ir3Function {
            name,
            vars,
            blocks,
            ..
        } = function;
        for block in blocks.iter_mut() {
            merge_block(block, vars, name);
        }
    }
}

fn merge_block(block: &mut BasicBlock, vars: &[Variable], function_name: &str) {
    let live_out = block.liveness.out_set.clone();
    let mut boxes: Vec<Option<TreeBox>> = block.trees.drain(..).map(Some).collect();

    // var -> pending consumer index; None marks a poisoned entry.
    let mut candidates: HashMap<VarId, Option<usize>> = HashMap::new();

    for index in (0..boxes.len()).rev() {
        let written = boxes[index]
            .as_ref()
            .expect("only later boxes are merged away")
            .var_written;

        if let Some(var) = written {
            let consumer = candidates.get(&var).copied().flatten();
            candidates.remove(&var);
            if let Some(consumer) = consumer {
                if !live_out.contains(&var) && merge_allowed(&boxes, index, consumer, var) {
                    let producer_reads = fold(&mut boxes, index, consumer, var);
                    trace!(
                        "@{function_name}: folded %{} into a later tree",
                        vars[var.0].name
                    );
                    // The producer's reads now happen at the consumer.
                    for read in producer_reads {
                        register_reader(&mut candidates, &boxes, consumer, read);
                    }
                    continue;
                }
            }
        }

        let reads: Vec<VarId> = boxes[index]
            .as_ref()
            .expect("current box is alive")
            .vars_read
            .iter()
            .copied()
            .collect();
        for read in reads {
            register_reader(&mut candidates, &boxes, index, read);
        }
    }

    block.trees = boxes.into_iter().flatten().collect();
}

fn register_reader(
    candidates: &mut HashMap<VarId, Option<usize>>,
    boxes: &[Option<TreeBox>],
    reader: usize,
    var: VarId,
) {
    match candidates.entry(var) {
        // A second pending reader: neither may absorb the producer.
        Entry::Occupied(mut entry) => {
            *entry.get_mut() = None;
        }
        Entry::Vacant(entry) => {
            let single_read = boxes[reader]
                .as_ref()
                .expect("reader is alive")
                .root
                .count_reads(var)
                == 1;
            entry.insert(if single_read { Some(reader) } else { None });
        }
    }
}

fn merge_allowed(boxes: &[Option<TreeBox>], producer: usize, consumer: usize, var: VarId) -> bool {
    let producer_box = boxes[producer].as_ref().expect("producer is alive");
    let consumer_box = boxes[consumer].as_ref().expect("consumer is alive");

    if consumer_box.root.count_reads(var) != 1 {
        return false;
    }

    // A call must not be hoisted into a branch condition.
    let consumer_is_branch = matches!(
        consumer_box.root.as_node().map(|n| &n.kind),
        Some(NodeKind::Branch { .. })
    );
    if consumer_is_branch && producer_box.root.contains_call() {
        return false;
    }

    let between = boxes[producer + 1..consumer].iter().flatten();
    if producer_box.has_side_effects() {
        // Moving a load, store or call across another memory access,
        // call, branch or return would reorder observable effects.
        for other in between.clone() {
            if other.has_side_effects() || other.is_branch_or_return() {
                return false;
            }
        }
    }
    // The producer's operands must still hold their values at the
    // consumer: nothing in between may overwrite what it reads.
    for other in between {
        if let Some(written) = other.var_written {
            if producer_box.vars_read.contains(&written) {
                return false;
            }
        }
    }

    true
}

/// Grafts the producer's tree into the consumer's single read of `var`
/// and drops the producer. Returns the variables the producer read.
fn fold(
    boxes: &mut [Option<TreeBox>],
    producer: usize,
    consumer: usize,
    var: VarId,
) -> HashSet<VarId> {
    let producer_box = boxes[producer].take().expect("producer is alive");
    let subtree = match producer_box.root {
        // A move contributes its source directly, not the wrapper.
        Tree::Node(node) if matches!(node.kind, NodeKind::Move { .. }) => match node.kind {
            NodeKind::Move { source } => source,
            _ => unreachable!(),
        },
        root => root,
    };

    let consumer_box = boxes[consumer].as_mut().expect("consumer is alive");
    let replaced = consumer_box.root.replace_read_once(var, subtree);
    debug_assert!(replaced, "consumer no longer reads the merged variable");

    consumer_box.vars_read.remove(&var);
    consumer_box
        .vars_read
        .extend(producer_box.vars_read.iter().copied());
    consumer_box.has_load |= producer_box.has_load;
    consumer_box.has_store |= producer_box.has_store;

    producer_box.vars_read
}
