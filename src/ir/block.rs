//! Basic blocks and the block builder.
//!
//! The builder consumes the flat instruction stream of one function and
//! chops it into blocks: a label always opens a new block, and any
//! instruction that leaves the block (return, branch) or yields control
//! (a call) closes it. Successor edges are wired afterwards, once every
//! label has a block.

use std::collections::{HashMap, HashSet};
use std::mem;

use crate::error::CompileError;

use super::instruction::Instruction;
use super::program::{BlockId, VarId};
use super::tree::TreeBox;

/// Per-block variable liveness, populated by the data-flow pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Liveness {
    pub gen_set: HashSet<VarId>,
    pub kill_set: HashSet<VarId>,
    pub in_set: HashSet<VarId>,
    pub out_set: HashSet<VarId>,
}

/// A straight-line run of instructions. Labels only ever appear as the
/// first instruction; every instruction except the last falls through.
#[derive(Debug)]
pub struct BasicBlock {
    /// Set when the block's first raw instruction is a label.
    pub label: Option<String>,
    pub instructions: Vec<Instruction>,
    pub successors: Vec<BlockId>,
    pub liveness: Liveness,
    /// One computation tree per raw instruction, attached by the
    /// data-flow pass and thinned out by the merger.
    pub trees: Vec<TreeBox>,
}

impl BasicBlock {
    fn from_instructions(instructions: Vec<Instruction>) -> Self {
        let label = match instructions.first() {
            Some(Instruction::Label(name)) => Some(name.clone()),
            _ => None,
        };
        Self {
            label,
            instructions,
            successors: Vec::new(),
            liveness: Liveness::default(),
            trees: Vec::new(),
        }
    }
}

/// Splits a function body into basic blocks and wires successor edges.
/// Also returns the map from label names to the blocks they open.
pub fn build_blocks(
    function_name: &str,
    instructions: Vec<Instruction>,
) -> Result<(Vec<BasicBlock>, HashMap<String, BlockId>), CompileError> {
    let mut blocks: Vec<BasicBlock> = Vec::new();
    let mut current: Vec<Instruction> = Vec::new();

    let store = |current: &mut Vec<Instruction>, blocks: &mut Vec<BasicBlock>| {
        if !current.is_empty() {
            blocks.push(BasicBlock::from_instructions(mem::take(current)));
        }
    };

    for instruction in instructions {
        if matches!(instruction, Instruction::Label(_)) {
            store(&mut current, &mut blocks);
        }
        let closes_block = !instruction.falls_through()
            || instruction.yields_control()
            || instruction.jump_target().is_some();
        current.push(instruction);
        if closes_block {
            store(&mut current, &mut blocks);
        }
    }
    store(&mut current, &mut blocks);

    let mut labels = HashMap::new();
    for (index, block) in blocks.iter().enumerate() {
        if let Some(label) = &block.label {
            let previous = labels.insert(label.clone(), BlockId(index));
            if previous.is_some() {
                return Err(CompileError::internal(format!(
                    "label ':{label}' defined twice in function '@{function_name}'"
                )));
            }
        }
    }

    for index in 0..blocks.len() {
        let last = blocks[index]
            .instructions
            .last()
            .expect("blocks are never empty");
        let mut successors = Vec::new();
        if let Some(target) = last.jump_target() {
            let id = labels
                .get(target)
                .ok_or_else(|| CompileError::UnknownBranchTarget {
                    label: target.to_string(),
                    function: function_name.to_string(),
                })?;
            successors.push(*id);
        }
        if last.falls_through() && index + 1 < blocks.len() {
            let next = BlockId(index + 1);
            if !successors.contains(&next) {
                successors.push(next);
            }
        }
        blocks[index].successors = successors;
    }

    Ok((blocks, labels))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::instruction::{Expr, FunctionRef, Operator};
    use crate::ir::program::FnId;

    fn assign(dest: usize, source: Expr) -> Instruction {
        Instruction::Assign {
            dest: Some(VarId(dest)),
            source,
        }
    }

    fn number_move(dest: usize, value: i64) -> Instruction {
        assign(dest, Expr::Number(value))
    }

    fn call(dest: usize) -> Instruction {
        assign(
            dest,
            Expr::Call {
                callee: Box::new(Expr::Function(FunctionRef::Ir3(FnId(0)))),
                args: vec![],
            },
        )
    }

    fn label(name: &str) -> Instruction {
        Instruction::Label(name.to_string())
    }

    fn branch(target: &str, condition: Option<Expr>) -> Instruction {
        Instruction::Branch {
            target: target.to_string(),
            condition,
        }
    }

    #[test]
    fn labels_open_blocks_and_sit_at_position_zero() {
        let (blocks, labels) = build_blocks(
            "f",
            vec![
                number_move(0, 1),
                label("mid"),
                number_move(1, 2),
                Instruction::Return(None),
            ],
        )
        .unwrap();

        assert_eq!(2, blocks.len());
        assert_eq!(None, blocks[0].label);
        assert_eq!(Some("mid".to_string()), blocks[1].label);
        assert_eq!(Some(&BlockId(1)), labels.get("mid"));
        for block in &blocks {
            for (position, instruction) in block.instructions.iter().enumerate() {
                if matches!(instruction, Instruction::Label(_)) {
                    assert_eq!(0, position);
                }
            }
        }
    }

    #[test]
    fn fall_through_blocks_gain_the_next_block_as_successor() {
        let (blocks, _) = build_blocks(
            "f",
            vec![number_move(0, 1), label("next"), Instruction::Return(None)],
        )
        .unwrap();

        assert_eq!(vec![BlockId(1)], blocks[0].successors);
        assert!(blocks[1].successors.is_empty());
    }

    #[test]
    fn conditional_branches_have_two_successors() {
        let (blocks, _) = build_blocks(
            "f",
            vec![
                branch("then", Some(Expr::Var(VarId(0)))),
                number_move(1, 0),
                Instruction::Return(None),
                label("then"),
                Instruction::Return(None),
            ],
        )
        .unwrap();

        assert_eq!(vec![BlockId(2), BlockId(1)], blocks[0].successors);
    }

    #[test]
    fn unconditional_branches_have_only_their_target() {
        let (blocks, _) = build_blocks(
            "f",
            vec![
                branch("exit", None),
                label("exit"),
                Instruction::Return(None),
            ],
        )
        .unwrap();

        assert_eq!(vec![BlockId(1)], blocks[0].successors);
    }

    #[test]
    fn calls_close_the_block_but_fall_through() {
        let (blocks, _) = build_blocks("f", vec![call(0), Instruction::Return(None)]).unwrap();

        assert_eq!(2, blocks.len());
        assert_eq!(vec![BlockId(1)], blocks[0].successors);
    }

    #[test]
    fn every_non_final_instruction_falls_through() {
        let (blocks, _) = build_blocks(
            "f",
            vec![
                number_move(0, 1),
                number_move(1, 2),
                call(2),
                label("l"),
                branch("l", None),
            ],
        )
        .unwrap();

        for block in &blocks {
            for instruction in &block.instructions[..block.instructions.len() - 1] {
                assert!(instruction.falls_through());
                assert!(!instruction.yields_control());
            }
        }
    }

    #[test]
    fn branching_to_an_undefined_label_is_an_error() {
        let result = build_blocks("f", vec![branch("nowhere", None)]);
        assert!(matches!(
            result,
            Err(CompileError::UnknownBranchTarget { label, function })
                if label == "nowhere" && function == "f"
        ));
    }

    #[test]
    fn trailing_fall_through_has_no_successor() {
        let (blocks, _) = build_blocks("f", vec![call(0), number_move(1, 2)]).unwrap();

        assert_eq!(2, blocks.len());
        assert!(blocks[1].successors.is_empty());
    }

    #[test]
    fn binary_assignment_does_not_close_a_block() {
        let (blocks, _) = build_blocks(
            "f",
            vec![
                assign(
                    0,
                    Expr::Binary {
                        op: Operator::Plus,
                        lhs: Box::new(Expr::Var(VarId(1))),
                        rhs: Box::new(Expr::Number(1)),
                    },
                ),
                Instruction::Return(None),
            ],
        )
        .unwrap();

        assert_eq!(1, blocks.len());
    }
}
