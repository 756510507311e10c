//! Computation trees.
//!
//! Each raw instruction becomes one tree rooted at a [`Node`]. Leaves are
//! atoms: variables, integers, labels (as block handles) and function
//! references. The merger later grafts producer trees into consumer trees
//! so that one root can cover the work of several instructions.

use std::collections::{HashMap, HashSet};

use crate::error::CompileError;

use super::instruction::{Expr, FunctionRef, Instruction};
use super::program::{BlockId, Ir3Function, Program, VarId};

/// A computation tree: either an atom or an operation node.
#[derive(Debug, Clone, PartialEq)]
pub enum Tree {
    Var(VarId),
    Num(i64),
    /// A label leaf, resolved to the block it opens.
    Block(BlockId),
    Function(FunctionRef),
    Node(Box<Node>),
}

/// An operation node with an optional destination variable.
#[derive(Debug, Clone, PartialEq)]
pub struct Node {
    pub destination: Option<VarId>,
    pub kind: NodeKind,
}

#[derive(Debug, Clone, PartialEq)]
pub enum NodeKind {
    /// Labels and other instructions with no runtime effect.
    Nop,
    /// A pure copy of an atom into the destination.
    Move { source: Tree },
    Binary {
        op: super::instruction::Operator,
        lhs: Tree,
        rhs: Tree,
    },
    Call {
        callee: Tree,
        args: Vec<Tree>,
    },
    Load {
        address: Tree,
    },
    Store {
        address: Tree,
        value: Tree,
    },
    Branch {
        target: BlockId,
        condition: Option<Tree>,
    },
    Return {
        value: Option<Tree>,
    },
}

impl Node {
    /// The operand subtrees of this node, in evaluation order.
    pub fn children(&self) -> Vec<&Tree> {
        match &self.kind {
            NodeKind::Nop => vec![],
            NodeKind::Move { source } => vec![source],
            NodeKind::Binary { lhs, rhs, .. } => vec![lhs, rhs],
            NodeKind::Call { callee, args } => {
                let mut children: Vec<&Tree> = args.iter().collect();
                children.push(callee);
                children
            }
            NodeKind::Load { address } => vec![address],
            NodeKind::Store { address, value } => vec![address, value],
            NodeKind::Branch { condition, .. } => condition.iter().collect(),
            NodeKind::Return { value } => value.iter().collect(),
        }
    }

    fn children_mut(&mut self) -> Vec<&mut Tree> {
        match &mut self.kind {
            NodeKind::Nop => vec![],
            NodeKind::Move { source } => vec![source],
            NodeKind::Binary { lhs, rhs, .. } => vec![lhs, rhs],
            NodeKind::Call { callee, args } => {
                let mut children: Vec<&mut Tree> = args.iter_mut().collect();
                children.push(callee);
                children
            }
            NodeKind::Load { address } => vec![address],
            NodeKind::Store { address, value } => vec![address, value],
            NodeKind::Branch { condition, .. } => condition.iter_mut().collect(),
            NodeKind::Return { value } => value.iter_mut().collect(),
        }
    }
}

impl Tree {
    pub fn node(destination: Option<VarId>, kind: NodeKind) -> Tree {
        Tree::Node(Box::new(Node { destination, kind }))
    }

    /// Whether this tree is a bare atom.
    pub fn is_atom(&self) -> bool {
        !matches!(self, Tree::Node(_))
    }

    pub fn as_node(&self) -> Option<&Node> {
        match self {
            Tree::Node(node) => Some(node),
            _ => None,
        }
    }

    /// Collects every variable read by this tree. Destinations are not
    /// reads; labels and function references are not variables.
    pub fn collect_reads(&self, reads: &mut HashSet<VarId>) {
        match self {
            Tree::Var(var) => {
                reads.insert(*var);
            }
            Tree::Node(node) => {
                for child in node.children() {
                    child.collect_reads(reads);
                }
            }
            _ => (),
        }
    }

    /// Counts the read occurrences of one variable in this tree.
    pub fn count_reads(&self, var: VarId) -> usize {
        match self {
            Tree::Var(v) if *v == var => 1,
            Tree::Node(node) => node.children().iter().map(|c| c.count_reads(var)).sum(),
            _ => 0,
        }
    }

    pub fn contains_load(&self) -> bool {
        self.any_node(&|node| matches!(node.kind, NodeKind::Load { .. }))
    }

    pub fn contains_store(&self) -> bool {
        self.any_node(&|node| matches!(node.kind, NodeKind::Store { .. }))
    }

    pub fn contains_call(&self) -> bool {
        self.any_node(&|node| matches!(node.kind, NodeKind::Call { .. }))
    }

    fn any_node(&self, predicate: &dyn Fn(&Node) -> bool) -> bool {
        match self {
            Tree::Node(node) => {
                predicate(node) || node.children().iter().any(|c| c.any_node(predicate))
            }
            _ => false,
        }
    }

    /// Replaces the first read occurrence of `var` with `replacement`.
    /// Returns whether a replacement happened.
    pub fn replace_read_once(&mut self, var: VarId, replacement: Tree) -> bool {
        let mut replacement = Some(replacement);
        self.replace_read_inner(var, &mut replacement)
    }

    fn replace_read_inner(&mut self, var: VarId, replacement: &mut Option<Tree>) -> bool {
        match self {
            Tree::Var(v) if *v == var => {
                *self = replacement.take().expect("replacement consumed twice");
                true
            }
            Tree::Node(node) => {
                for child in node.children_mut() {
                    if child.replace_read_inner(var, replacement) {
                        return true;
                    }
                }
                false
            }
            _ => false,
        }
    }

    /// Renders the tree in IR3 surface syntax, for diagnostics.
    pub fn text(&self, function: &Ir3Function, program: &Program) -> String {
        match self {
            Tree::Var(v) => format!("%{}", function.var_name(*v)),
            Tree::Num(n) => n.to_string(),
            Tree::Block(b) => match function.block_label(*b) {
                Some(label) => format!(":{label}"),
                None => ":<unnamed>".to_string(),
            },
            Tree::Function(FunctionRef::Ir3(_)) => {
                format!("@{}", program.function_name(self.function_ref()))
            }
            Tree::Function(FunctionRef::External(_)) => {
                program.function_name(self.function_ref()).to_string()
            }
            Tree::Node(node) => {
                let dest = node
                    .destination
                    .map(|d| format!("%{} <- ", function.var_name(d)))
                    .unwrap_or_default();
                let body = match &node.kind {
                    NodeKind::Nop => "nop".to_string(),
                    NodeKind::Move { source } => source.text(function, program),
                    NodeKind::Binary { op, lhs, rhs } => format!(
                        "{} {op} {}",
                        lhs.text(function, program),
                        rhs.text(function, program)
                    ),
                    NodeKind::Call { callee, args } => {
                        let args: Vec<_> =
                            args.iter().map(|a| a.text(function, program)).collect();
                        format!("call {} ({})", callee.text(function, program), args.join(", "))
                    }
                    NodeKind::Load { address } => {
                        format!("load {}", address.text(function, program))
                    }
                    NodeKind::Store { address, value } => format!(
                        "store {} <- {}",
                        address.text(function, program),
                        value.text(function, program)
                    ),
                    NodeKind::Branch { target, condition } => {
                        let target = function
                            .block_label(*target)
                            .map(|l| format!(":{l}"))
                            .unwrap_or_else(|| ":<unnamed>".to_string());
                        match condition {
                            Some(condition) => {
                                format!("br {} {target}", condition.text(function, program))
                            }
                            None => format!("br {target}"),
                        }
                    }
                    NodeKind::Return { value } => match value {
                        Some(value) => format!("return {}", value.text(function, program)),
                        None => "return".to_string(),
                    },
                };
                format!("{dest}{body}")
            }
        }
    }

    fn function_ref(&self) -> FunctionRef {
        match self {
            Tree::Function(fref) => *fref,
            _ => unreachable!("not a function leaf"),
        }
    }
}

/// Owns one computation tree and caches the facts the analyses need:
/// the variables it reads, the single variable it writes, and whether a
/// load or store occurs anywhere inside. The flags stay set when trees
/// are merged.
#[derive(Debug, Clone, PartialEq)]
pub struct TreeBox {
    pub root: Tree,
    pub vars_read: HashSet<VarId>,
    pub var_written: Option<VarId>,
    pub has_load: bool,
    pub has_store: bool,
}

impl TreeBox {
    pub fn new(root: Tree) -> Self {
        let mut vars_read = HashSet::new();
        root.collect_reads(&mut vars_read);
        let var_written = root.as_node().and_then(|n| n.destination);
        let has_load = root.contains_load();
        let has_store = root.contains_store();
        Self {
            root,
            vars_read,
            var_written,
            has_load,
            has_store,
        }
    }

    /// Translates one raw instruction into its computation tree.
    pub fn from_instruction(
        instruction: &Instruction,
        labels: &HashMap<String, BlockId>,
        function_name: &str,
    ) -> Result<Self, CompileError> {
        let root = match instruction {
            Instruction::Assign { dest, source } => {
                if source.is_leaf() {
                    let dest = (*dest).ok_or_else(|| {
                        CompileError::internal(format!(
                            "assignment without destination in function '@{function_name}'"
                        ))
                    })?;
                    Tree::node(
                        Some(dest),
                        NodeKind::Move {
                            source: expr_to_tree(source, labels, function_name)?,
                        },
                    )
                } else {
                    let tree = expr_to_tree(source, labels, function_name)?;
                    match tree {
                        Tree::Node(mut node) => {
                            node.destination = *dest;
                            Tree::Node(node)
                        }
                        _ => unreachable!("compound expressions become nodes"),
                    }
                }
            }
            Instruction::Store { address, source } => Tree::node(
                None,
                NodeKind::Store {
                    address: Tree::Var(*address),
                    value: Tree::Var(*source),
                },
            ),
            Instruction::Label(_) => Tree::node(None, NodeKind::Nop),
            Instruction::Branch { target, condition } => {
                let target = resolve_label(target, labels, function_name)?;
                let condition = condition
                    .as_ref()
                    .map(|c| expr_to_tree(c, labels, function_name))
                    .transpose()?;
                Tree::node(None, NodeKind::Branch { target, condition })
            }
            Instruction::Return(value) => {
                let value = value
                    .as_ref()
                    .map(|v| expr_to_tree(v, labels, function_name))
                    .transpose()?;
                Tree::node(None, NodeKind::Return { value })
            }
        };
        Ok(Self::new(root))
    }

    /// Whether the root performs a call, a load or a store; such boxes
    /// pin the ordering of their neighbours during merging.
    pub fn has_side_effects(&self) -> bool {
        self.has_load || self.has_store || self.root.contains_call()
    }

    pub fn is_branch_or_return(&self) -> bool {
        matches!(
            self.root.as_node().map(|n| &n.kind),
            Some(NodeKind::Branch { .. }) | Some(NodeKind::Return { .. })
        )
    }
}

fn resolve_label(
    label: &str,
    labels: &HashMap<String, BlockId>,
    function_name: &str,
) -> Result<BlockId, CompileError> {
    labels
        .get(label)
        .copied()
        .ok_or_else(|| CompileError::UnknownBranchTarget {
            label: label.to_string(),
            function: function_name.to_string(),
        })
}

fn expr_to_tree(
    expr: &Expr,
    labels: &HashMap<String, BlockId>,
    function_name: &str,
) -> Result<Tree, CompileError> {
    Ok(match expr {
        Expr::Var(v) => Tree::Var(*v),
        Expr::Number(n) => Tree::Num(*n),
        Expr::Label(name) => {
            let block = labels.get(name).copied().ok_or_else(|| {
                CompileError::UnresolvedReference {
                    name: format!(":{name}"),
                    function: function_name.to_string(),
                }
            })?;
            Tree::Block(block)
        }
        Expr::Function(fref) => Tree::Function(*fref),
        Expr::Load(address) => Tree::node(
            None,
            NodeKind::Load {
                address: Tree::Var(*address),
            },
        ),
        Expr::Binary { op, lhs, rhs } => Tree::node(
            None,
            NodeKind::Binary {
                op: *op,
                lhs: expr_to_tree(lhs, labels, function_name)?,
                rhs: expr_to_tree(rhs, labels, function_name)?,
            },
        ),
        Expr::Call { callee, args } => Tree::node(
            None,
            NodeKind::Call {
                callee: expr_to_tree(callee, labels, function_name)?,
                args: args
                    .iter()
                    .map(|a| expr_to_tree(a, labels, function_name))
                    .collect::<Result<_, _>>()?,
            },
        ),
    })
}

/// Builds the tree boxes for every instruction of one block.
pub fn build_tree_boxes(
    instructions: &[Instruction],
    labels: &HashMap<String, BlockId>,
    function_name: &str,
) -> Result<Vec<TreeBox>, CompileError> {
    instructions
        .iter()
        .map(|i| TreeBox::from_instruction(i, labels, function_name))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::instruction::Operator;

    fn no_labels() -> HashMap<String, BlockId> {
        HashMap::new()
    }

    fn build(instruction: Instruction) -> TreeBox {
        TreeBox::from_instruction(&instruction, &no_labels(), "f").unwrap()
    }

    #[test]
    fn leaf_assignments_become_moves() {
        let tree_box = build(Instruction::Assign {
            dest: Some(VarId(0)),
            source: Expr::Var(VarId(1)),
        });

        let node = tree_box.root.as_node().unwrap();
        assert_eq!(Some(VarId(0)), node.destination);
        assert!(matches!(
            &node.kind,
            NodeKind::Move {
                source: Tree::Var(VarId(1))
            }
        ));
        assert_eq!(Some(VarId(0)), tree_box.var_written);
        assert_eq!(HashSet::from([VarId(1)]), tree_box.vars_read);
    }

    #[test]
    fn compound_assignments_keep_their_own_root() {
        let tree_box = build(Instruction::Assign {
            dest: Some(VarId(2)),
            source: Expr::Binary {
                op: Operator::Plus,
                lhs: Box::new(Expr::Var(VarId(0))),
                rhs: Box::new(Expr::Var(VarId(1))),
            },
        });

        let node = tree_box.root.as_node().unwrap();
        assert_eq!(Some(VarId(2)), node.destination);
        assert!(matches!(&node.kind, NodeKind::Binary { .. }));
        assert_eq!(HashSet::from([VarId(0), VarId(1)]), tree_box.vars_read);
    }

    #[test]
    fn loads_and_stores_set_their_flags() {
        let load = build(Instruction::Assign {
            dest: Some(VarId(0)),
            source: Expr::Load(VarId(1)),
        });
        assert!(load.has_load);
        assert!(!load.has_store);
        assert_eq!(Some(VarId(0)), load.var_written);

        let store = build(Instruction::Store {
            address: VarId(0),
            source: VarId(1),
        });
        assert!(store.has_store);
        assert!(!store.has_load);
        assert_eq!(None, store.var_written);
        assert_eq!(HashSet::from([VarId(0), VarId(1)]), store.vars_read);
    }

    #[test]
    fn labels_become_nops() {
        let tree_box = build(Instruction::Label("l".to_string()));
        assert!(matches!(
            tree_box.root.as_node().unwrap().kind,
            NodeKind::Nop
        ));
        assert!(tree_box.vars_read.is_empty());
        assert_eq!(None, tree_box.var_written);
    }

    #[test]
    fn branches_resolve_their_target_block() {
        let labels = HashMap::from([("next".to_string(), BlockId(3))]);
        let tree_box = TreeBox::from_instruction(
            &Instruction::Branch {
                target: "next".to_string(),
                condition: Some(Expr::Var(VarId(0))),
            },
            &labels,
            "f",
        )
        .unwrap();

        match &tree_box.root.as_node().unwrap().kind {
            NodeKind::Branch { target, condition } => {
                assert_eq!(BlockId(3), *target);
                assert!(condition.is_some());
            }
            other => panic!("expected a branch node, got {other:?}"),
        }
        assert_eq!(HashSet::from([VarId(0)]), tree_box.vars_read);
    }

    #[test]
    fn branch_to_missing_label_fails() {
        let result = TreeBox::from_instruction(
            &Instruction::Branch {
                target: "gone".to_string(),
                condition: None,
            },
            &no_labels(),
            "f",
        );
        assert!(matches!(
            result,
            Err(CompileError::UnknownBranchTarget { .. })
        ));
    }

    #[test]
    fn returns_carry_their_value() {
        let tree_box = build(Instruction::Return(Some(Expr::Var(VarId(4)))));
        assert!(matches!(
            &tree_box.root.as_node().unwrap().kind,
            NodeKind::Return { value: Some(_) }
        ));
        assert_eq!(HashSet::from([VarId(4)]), tree_box.vars_read);
    }

    #[test]
    fn count_and_replace_reads() {
        let mut tree = Tree::node(
            Some(VarId(0)),
            NodeKind::Binary {
                op: Operator::Plus,
                lhs: Tree::Var(VarId(1)),
                rhs: Tree::Var(VarId(1)),
            },
        );
        assert_eq!(2, tree.count_reads(VarId(1)));

        assert!(tree.replace_read_once(VarId(1), Tree::Num(7)));
        assert_eq!(1, tree.count_reads(VarId(1)));
        match &tree.as_node().unwrap().kind {
            NodeKind::Binary { lhs, .. } => assert_eq!(&Tree::Num(7), lhs),
            _ => unreachable!(),
        }
    }

    #[test]
    fn call_trees_read_their_argument_variables() {
        let tree_box = build(Instruction::Assign {
            dest: None,
            source: Expr::Call {
                callee: Box::new(Expr::Var(VarId(0))),
                args: vec![Expr::Var(VarId(1)), Expr::Number(3)],
            },
        });

        assert!(tree_box.root.contains_call());
        assert_eq!(None, tree_box.var_written);
        assert_eq!(HashSet::from([VarId(0), VarId(1)]), tree_box.vars_read);
    }
}
