//! Tile-based instruction selection.
//!
//! A tile covers a computation tree from its root downward and knows how
//! to render itself as IR2 instructions. Operand subtrees a tile does
//! not cover are delegated: they are returned as new roots, tiled on
//! their own, and their result reaches the parent through the
//! destination variable they carry.
//!
//! For every root each candidate pattern is tried; the winner is the
//! match with the largest munch (tree nodes covered), ties broken by the
//! smallest cost (instructions emitted).

use crate::error::CompileError;
use crate::ir::{BlockId, FunctionRef, Node, NodeKind, Operator, Tree, TreeBox, VarId};
use crate::prelude::*;

use super::target;
use super::FunctionContext;

/// A selected tile: its selection weights plus the captures its pattern
/// extracted from the tree.
pub struct Tile<'t> {
    pub munch: i32,
    pub cost: i32,
    kind: TileKind<'t>,
}

enum TileKind<'t> {
    Nop,
    Move {
        dest: VarId,
        source: &'t Tree,
    },
    BinaryArithmetic {
        dest: VarId,
        op: Operator,
        lhs: &'t Tree,
        rhs: &'t Tree,
    },
    BinaryCompare {
        dest: VarId,
        op: Operator,
        lhs: &'t Tree,
        rhs: &'t Tree,
    },
    Load {
        dest: VarId,
        address: &'t Tree,
    },
    Store {
        address: &'t Tree,
        value: &'t Tree,
    },
    Branch {
        target: BlockId,
        condition: Option<&'t Tree>,
    },
    Return {
        value: Option<&'t Tree>,
    },
    Call {
        dest: Option<VarId>,
        callee: &'t Tree,
        args: Vec<&'t Tree>,
    },
}

/// Whether a tree can stand in an IR2 operand position: either an atom,
/// or a delegated node whose destination variable carries its result.
fn is_operand(tree: &Tree) -> bool {
    match tree {
        Tree::Node(node) => node.destination.is_some(),
        _ => true,
    }
}

/// Like [`is_operand`], but the value must live in a variable, as IR2
/// memory operands require.
fn is_variable_operand(tree: &Tree) -> bool {
    match tree {
        Tree::Var(_) => true,
        Tree::Node(node) => node.destination.is_some(),
        _ => false,
    }
}

fn dest_node(tree: &Tree) -> Option<(&Node, VarId)> {
    let node = tree.as_node()?;
    Some((node, node.destination?))
}

type Matcher = for<'t> fn(&'t Tree) -> Option<Tile<'t>>;

const MATCHERS: &[Matcher] = &[
    match_nop,
    match_pure_assignment,
    match_move_general,
    match_binary_arithmetic,
    match_binary_arithmetic_general,
    match_binary_compare,
    match_binary_compare_general,
    match_load_memory,
    match_load_general,
    match_store_memory,
    match_store_general,
    match_branch,
    match_branch_conditional,
    match_branch_conditional_general,
    match_return_nothing,
    match_return_value,
    match_return_value_general,
    match_call,
];

/// Labels and bare leaves: nothing to emit.
fn match_nop(tree: &Tree) -> Option<Tile> {
    let is_nop = match tree {
        Tree::Node(node) => matches!(node.kind, NodeKind::Nop),
        _ => true,
    };
    is_nop.then_some(Tile {
        munch: 0,
        cost: 0,
        kind: TileKind::Nop,
    })
}

fn match_pure_assignment(tree: &Tree) -> Option<Tile> {
    let (node, dest) = dest_node(tree)?;
    match &node.kind {
        NodeKind::Move { source } if source.is_atom() => Some(Tile {
            munch: 2,
            cost: 1,
            kind: TileKind::Move { dest, source },
        }),
        _ => None,
    }
}

fn match_move_general(tree: &Tree) -> Option<Tile> {
    let (node, dest) = dest_node(tree)?;
    match &node.kind {
        NodeKind::Move { source } if !source.is_atom() && is_operand(source) => Some(Tile {
            munch: 1,
            cost: 1,
            kind: TileKind::Move { dest, source },
        }),
        _ => None,
    }
}

fn match_binary_arithmetic(tree: &Tree) -> Option<Tile> {
    let (node, dest) = dest_node(tree)?;
    match &node.kind {
        NodeKind::Binary { op, lhs, rhs }
            if !op.is_comparison() && lhs.is_atom() && rhs.is_atom() =>
        {
            Some(Tile {
                munch: 3,
                cost: 3,
                kind: TileKind::BinaryArithmetic {
                    dest,
                    op: *op,
                    lhs,
                    rhs,
                },
            })
        }
        _ => None,
    }
}

fn match_binary_arithmetic_general(tree: &Tree) -> Option<Tile> {
    let (node, dest) = dest_node(tree)?;
    match &node.kind {
        NodeKind::Binary { op, lhs, rhs }
            if !op.is_comparison()
                && is_operand(lhs)
                && is_operand(rhs)
                && !(lhs.is_atom() && rhs.is_atom()) =>
        {
            Some(Tile {
                munch: 1,
                cost: 3,
                kind: TileKind::BinaryArithmetic {
                    dest,
                    op: *op,
                    lhs,
                    rhs,
                },
            })
        }
        _ => None,
    }
}

fn match_binary_compare(tree: &Tree) -> Option<Tile> {
    let (node, dest) = dest_node(tree)?;
    match &node.kind {
        NodeKind::Binary { op, lhs, rhs }
            if op.is_comparison() && lhs.is_atom() && rhs.is_atom() =>
        {
            Some(Tile {
                munch: 3,
                cost: 1,
                kind: TileKind::BinaryCompare {
                    dest,
                    op: *op,
                    lhs,
                    rhs,
                },
            })
        }
        _ => None,
    }
}

fn match_binary_compare_general(tree: &Tree) -> Option<Tile> {
    let (node, dest) = dest_node(tree)?;
    match &node.kind {
        NodeKind::Binary { op, lhs, rhs }
            if op.is_comparison()
                && is_operand(lhs)
                && is_operand(rhs)
                && !(lhs.is_atom() && rhs.is_atom()) =>
        {
            Some(Tile {
                munch: 1,
                cost: 1,
                kind: TileKind::BinaryCompare {
                    dest,
                    op: *op,
                    lhs,
                    rhs,
                },
            })
        }
        _ => None,
    }
}

fn match_load_memory(tree: &Tree) -> Option<Tile> {
    let (node, dest) = dest_node(tree)?;
    match &node.kind {
        NodeKind::Load { address } if matches!(address, Tree::Var(_)) => Some(Tile {
            munch: 2,
            cost: 1,
            kind: TileKind::Load { dest, address },
        }),
        _ => None,
    }
}

fn match_load_general(tree: &Tree) -> Option<Tile> {
    let (node, dest) = dest_node(tree)?;
    match &node.kind {
        NodeKind::Load { address }
            if !matches!(address, Tree::Var(_)) && is_variable_operand(address) =>
        {
            Some(Tile {
                munch: 1,
                cost: 1,
                kind: TileKind::Load { dest, address },
            })
        }
        _ => None,
    }
}

fn match_store_memory(tree: &Tree) -> Option<Tile> {
    let node = tree.as_node()?;
    match &node.kind {
        NodeKind::Store { address, value }
            if matches!(address, Tree::Var(_)) && matches!(value, Tree::Var(_)) =>
        {
            Some(Tile {
                munch: 3,
                cost: 1,
                kind: TileKind::Store { address, value },
            })
        }
        _ => None,
    }
}

fn match_store_general(tree: &Tree) -> Option<Tile> {
    let node = tree.as_node()?;
    match &node.kind {
        NodeKind::Store { address, value }
            if is_variable_operand(address)
                && is_operand(value)
                && !(matches!(address, Tree::Var(_)) && matches!(value, Tree::Var(_))) =>
        {
            Some(Tile {
                munch: 1,
                cost: 1,
                kind: TileKind::Store { address, value },
            })
        }
        _ => None,
    }
}

fn match_branch(tree: &Tree) -> Option<Tile> {
    let node = tree.as_node()?;
    match &node.kind {
        NodeKind::Branch {
            target,
            condition: None,
        } => Some(Tile {
            munch: 1,
            cost: 1,
            kind: TileKind::Branch {
                target: *target,
                condition: None,
            },
        }),
        _ => None,
    }
}

fn match_branch_conditional(tree: &Tree) -> Option<Tile> {
    let node = tree.as_node()?;
    match &node.kind {
        NodeKind::Branch {
            target,
            condition: Some(condition),
        } if condition.is_atom() => Some(Tile {
            munch: 2,
            cost: 1,
            kind: TileKind::Branch {
                target: *target,
                condition: Some(condition),
            },
        }),
        _ => None,
    }
}

fn match_branch_conditional_general(tree: &Tree) -> Option<Tile> {
    let node = tree.as_node()?;
    match &node.kind {
        NodeKind::Branch {
            target,
            condition: Some(condition),
        } if !condition.is_atom() && is_operand(condition) => Some(Tile {
            munch: 1,
            cost: 1,
            kind: TileKind::Branch {
                target: *target,
                condition: Some(condition),
            },
        }),
        _ => None,
    }
}

fn match_return_nothing(tree: &Tree) -> Option<Tile> {
    let node = tree.as_node()?;
    match &node.kind {
        NodeKind::Return { value: None } => Some(Tile {
            munch: 1,
            cost: 1,
            kind: TileKind::Return { value: None },
        }),
        _ => None,
    }
}

fn match_return_value(tree: &Tree) -> Option<Tile> {
    let node = tree.as_node()?;
    match &node.kind {
        NodeKind::Return { value: Some(value) } if value.is_atom() => Some(Tile {
            munch: 2,
            cost: 2,
            kind: TileKind::Return { value: Some(value) },
        }),
        _ => None,
    }
}

fn match_return_value_general(tree: &Tree) -> Option<Tile> {
    let node = tree.as_node()?;
    match &node.kind {
        NodeKind::Return { value: Some(value) } if !value.is_atom() && is_operand(value) => {
            Some(Tile {
                munch: 1,
                cost: 2,
                kind: TileKind::Return { value: Some(value) },
            })
        }
        _ => None,
    }
}

fn match_call(tree: &Tree) -> Option<Tile> {
    let node = tree.as_node()?;
    match &node.kind {
        NodeKind::Call { callee, args }
            if is_operand(callee) && args.iter().all(is_operand) =>
        {
            let external = matches!(callee, Tree::Function(FunctionRef::External(_)));
            let mut cost = args.len() as i32 + 1;
            if !external {
                cost += 2;
            }
            if node.destination.is_some() {
                cost += 1;
            }
            Some(Tile {
                munch: 1,
                cost,
                kind: TileKind::Call {
                    dest: node.destination,
                    callee,
                    args: args.iter().collect(),
                },
            })
        }
        _ => None,
    }
}

/// Picks the best-matching tile for one root, by maximal munch with ties
/// broken by minimum cost.
pub fn select_tile(tree: &Tree) -> Option<Tile> {
    let mut best: Option<Tile> = None;
    for matcher in MATCHERS {
        let Some(tile) = matcher(tree) else { continue };
        best = match best {
            None => Some(tile),
            Some(current)
                if tile.munch > current.munch
                    || (tile.munch == current.munch && tile.cost < current.cost) =>
            {
                Some(tile)
            }
            current => current,
        };
    }
    best
}

impl<'t> Tile<'t> {
    /// The operand subtrees this tile delegated instead of covering.
    /// Each becomes a root of its own; its instructions run before this
    /// tile's.
    pub fn unmatched(&self) -> Vec<&'t Tree> {
        let operands: Vec<&'t Tree> = match &self.kind {
            TileKind::Nop => vec![],
            TileKind::Move { source, .. } => vec![*source],
            TileKind::BinaryArithmetic { lhs, rhs, .. }
            | TileKind::BinaryCompare { lhs, rhs, .. } => vec![*lhs, *rhs],
            TileKind::Load { address, .. } => vec![*address],
            TileKind::Store { address, value } => vec![*address, *value],
            TileKind::Branch { condition, .. } => condition.iter().copied().collect(),
            TileKind::Return { value } => value.iter().copied().collect(),
            TileKind::Call { callee, args, .. } => {
                // Arguments are always handed back, as are indirect
                // callees that need computing; atoms re-match the nop
                // tile and emit nothing.
                let mut operands = args.clone();
                operands.push(*callee);
                operands
            }
        };
        operands.into_iter().filter(|tree| !tree.is_atom()).collect()
    }

    /// Renders this tile as IR2 instructions.
    pub fn emit(
        &self,
        context: &FunctionContext,
        ret_labels: &mut usize,
    ) -> Result<Vec<String>, CompileError> {
        let lines = match &self.kind {
            TileKind::Nop => vec![],
            TileKind::Move { dest, source } => {
                vec![format!(
                    "{} <- {}",
                    context.var(*dest),
                    context.atom(source)?
                )]
            }
            TileKind::BinaryArithmetic { dest, op, lhs, rhs } => {
                // Route through the reserved scratch variable so the
                // destination may alias either operand.
                let scratch = &context.scratch;
                vec![
                    format!("{scratch} <- {}", context.atom(lhs)?),
                    format!("{scratch} {} {}", target::op_assign_token(*op), context.atom(rhs)?),
                    format!("{} <- {scratch}", context.var(*dest)),
                ]
            }
            TileKind::BinaryCompare { dest, op, lhs, rhs } => {
                // IR2 only knows <, <= and =; the remaining comparisons
                // swap their operands.
                let (op, lhs, rhs) = match op {
                    Operator::Gt | Operator::Ge => (op.mirrored(), rhs, lhs),
                    _ => (*op, lhs, rhs),
                };
                vec![format!(
                    "{} <- {} {op} {}",
                    context.var(*dest),
                    context.atom(lhs)?,
                    context.atom(rhs)?
                )]
            }
            TileKind::Load { dest, address } => {
                vec![format!(
                    "{} <- mem {} 0",
                    context.var(*dest),
                    context.atom(address)?
                )]
            }
            TileKind::Store { address, value } => {
                vec![format!(
                    "mem {} 0 <- {}",
                    context.atom(address)?,
                    context.atom(value)?
                )]
            }
            TileKind::Branch {
                target,
                condition: None,
            } => {
                vec![format!("goto {}", context.block_label(*target)?)]
            }
            TileKind::Branch {
                target,
                condition: Some(condition),
            } => {
                // The condition is a truthy test against zero.
                vec![format!(
                    "cjump 0 < {} {}",
                    context.atom(condition)?,
                    context.block_label(*target)?
                )]
            }
            TileKind::Return { value } => {
                let mut lines = Vec::new();
                if let Some(value) = value {
                    lines.push(format!("rax <- {}", context.atom(value)?));
                }
                lines.push("return".to_string());
                lines
            }
            TileKind::Call { dest, callee, args } => {
                let mut lines = Vec::new();
                for (index, arg) in args.iter().enumerate() {
                    lines.push(target::argument_prepping_instruction(
                        &context.atom(arg)?,
                        index,
                    ));
                }
                // Runtime functions return without touching the return
                // slot; everything else needs a label to come back to.
                let external = matches!(callee, Tree::Function(FunctionRef::External(_)));
                let return_label = if external {
                    None
                } else {
                    let label = format!(":ret{}", *ret_labels);
                    *ret_labels += 1;
                    lines.push(format!("mem rsp -8 <- {label}"));
                    Some(label)
                };
                lines.push(format!(
                    "call {} {}",
                    context.atom(callee)?,
                    args.len()
                ));
                if let Some(label) = return_label {
                    lines.push(label);
                }
                if let Some(dest) = dest {
                    lines.push(format!("{} <- rax", context.var(*dest)));
                }
                lines
            }
        };
        Ok(lines)
    }
}

/// Tiles every tree of a block and returns the emitted instructions in
/// execution order. Roots are processed through an explicit stack;
/// delegated children surface before the tile that consumes them, so the
/// emitted list is built in reverse and flipped once at the end.
pub fn tile_block(
    trees: &[TreeBox],
    context: &FunctionContext,
    ret_labels: &mut usize,
) -> Result<Vec<String>, CompileError> {
    let mut stack: Vec<&Tree> = trees.iter().map(|tree_box| &tree_box.root).collect();
    let mut emitted: Vec<Vec<String>> = Vec::new();

    while let Some(tree) = stack.pop() {
        let tile = select_tile(tree).ok_or_else(|| CompileError::NoMatchingTile {
            function: context.function.name.clone(),
            tree: tree.text(context.function, context.program),
        })?;
        trace!(
            "@{}: tile munch {} cost {}",
            context.function.name,
            tile.munch,
            tile.cost
        );
        for child in tile.unmatched() {
            stack.push(child);
        }
        emitted.push(tile.emit(context, ret_labels)?);
    }

    Ok(emitted.into_iter().rev().flatten().collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn binary(dest: usize, op: Operator, lhs: Tree, rhs: Tree) -> Tree {
        Tree::node(Some(VarId(dest)), NodeKind::Binary { op, lhs, rhs })
    }

    #[test]
    fn leaf_comparison_wins_over_the_delegating_variant() {
        let tree = binary(0, Operator::Lt, Tree::Var(VarId(1)), Tree::Num(4));
        let tile = select_tile(&tree).unwrap();

        assert_eq!(3, tile.munch);
        assert_eq!(1, tile.cost);
        assert!(tile.unmatched().is_empty());
    }

    #[test]
    fn no_unchosen_tile_has_a_larger_munch() {
        let trees = [
            binary(0, Operator::Plus, Tree::Var(VarId(1)), Tree::Num(1)),
            Tree::node(
                Some(VarId(0)),
                NodeKind::Move {
                    source: Tree::Var(VarId(1)),
                },
            ),
            Tree::node(None, NodeKind::Return { value: None }),
        ];
        for tree in &trees {
            let chosen = select_tile(tree).unwrap();
            for matcher in MATCHERS {
                if let Some(other) = matcher(tree) {
                    assert!(other.munch <= chosen.munch);
                    if other.munch == chosen.munch {
                        assert!(chosen.cost <= other.cost);
                    }
                }
            }
        }
    }

    #[test]
    fn merged_operands_are_delegated() {
        let inner = binary(2, Operator::Plus, Tree::Var(VarId(3)), Tree::Num(1));
        let tree = binary(0, Operator::Times, inner, Tree::Var(VarId(1)));

        let tile = select_tile(&tree).unwrap();
        assert_eq!(1, tile.munch);
        let unmatched = tile.unmatched();
        assert_eq!(1, unmatched.len());
        assert!(!unmatched[0].is_atom());
    }

    #[test]
    fn atoms_match_the_nop_tile() {
        for tree in [Tree::Var(VarId(0)), Tree::Num(12)] {
            let tile = select_tile(&tree).unwrap();
            assert_eq!(0, tile.munch);
            assert_eq!(0, tile.cost);
        }
    }

    #[test]
    fn binary_without_destination_has_no_tile() {
        let tree = Tree::node(
            None,
            NodeKind::Binary {
                op: Operator::Plus,
                lhs: Tree::Var(VarId(0)),
                rhs: Tree::Num(1),
            },
        );
        assert!(select_tile(&tree).is_none());
    }

    #[test]
    fn every_node_is_covered_exactly_once() {
        // A merged tree: return ((a + 1) * b). The root tile delegates
        // the product's left operand; the product delegates the sum.
        let sum = binary(2, Operator::Plus, Tree::Var(VarId(0)), Tree::Num(1));
        let product = binary(3, Operator::Times, sum, Tree::Var(VarId(1)));
        let root = Tree::node(
            None,
            NodeKind::Return {
                value: Some(product),
            },
        );

        let mut covered = 0;
        let mut stack = vec![&root];
        while let Some(tree) = stack.pop() {
            let tile = select_tile(tree).unwrap();
            covered += 1;
            stack.extend(tile.unmatched());
        }
        // Return, product and sum each get exactly one tile.
        assert_eq!(3, covered);
    }
}
