//! Basic blocks and the control-flow graph over a flat instruction list.

use hashbrown::HashMap;

use crate::{
    error::{CompileError, CompileResult},
    index::{Index, IndexVec, simple_index},
    middle::tac::{Statement, StatementKind},
};

simple_index! {
    /// Identifies a basic block within one function's CFG
    pub struct BlockIndex;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BasicBlock {
    pub name: String,
    pub instructions: Vec<Statement>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Edge {
    pub from: BlockIndex,
    pub to: BlockIndex,
}

#[derive(Debug, Clone)]
pub struct ControlFlowGraph {
    pub blocks: IndexVec<BlockIndex, BasicBlock>,
    pub label_to_index: HashMap<String, BlockIndex>,
    pub edges: Vec<Edge>,
    /// Blocks ending in a return
    pub exits: Vec<BlockIndex>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BlockBehaviour {
    Begin,
    End,
    Midblock,
}

fn block_behaviour(kind: &StatementKind) -> BlockBehaviour {
    match kind {
        StatementKind::Label { .. } | StatementKind::FunctionLabel { .. } => BlockBehaviour::Begin,
        StatementKind::Goto { .. }
        | StatementKind::GotoIfEqual { .. }
        | StatementKind::GotoIfNotEqual { .. }
        | StatementKind::GotoIfZero { .. }
        | StatementKind::GotoIfGreater { .. }
        | StatementKind::Return { .. } => BlockBehaviour::End,
        _ => BlockBehaviour::Midblock,
    }
}

fn leading_label(instructions: &[Statement]) -> Option<&str> {
    match instructions.first().map(|s| &s.kind) {
        Some(StatementKind::Label { name } | StatementKind::FunctionLabel { name }) => Some(name),
        _ => None,
    }
}

impl ControlFlowGraph {
    /// Splits `instructions` into maximal straight-line blocks and links them.
    /// There is always at least one block, even for an empty list.
    pub fn build(instructions: &[Statement]) -> CompileResult<Self> {
        let mut raw_blocks: Vec<Vec<Statement>> = Vec::new();
        let mut current = Vec::new();

        for instruction in instructions {
            match block_behaviour(&instruction.kind) {
                BlockBehaviour::Begin => {
                    if !current.is_empty() {
                        raw_blocks.push(std::mem::take(&mut current));
                    }
                    current.push(instruction.clone());
                }
                BlockBehaviour::End => {
                    current.push(instruction.clone());
                    raw_blocks.push(std::mem::take(&mut current));
                }
                BlockBehaviour::Midblock => current.push(instruction.clone()),
            }
        }

        if !current.is_empty() || raw_blocks.is_empty() {
            raw_blocks.push(current);
        }

        let mut blocks = IndexVec::new();
        let mut label_to_index = HashMap::new();

        for (position, instructions) in raw_blocks.into_iter().enumerate() {
            let name = leading_label(&instructions)
                .map(str::to_owned)
                .unwrap_or_else(|| format!("block_{position}"));

            let index = blocks.next_index();

            if let Some(label) = leading_label(&instructions) {
                if label_to_index.insert(label.to_owned(), index).is_some() {
                    return Err(CompileError::internal(format!("label '{label}' defined twice")));
                }
            }

            blocks.push(BasicBlock { name, instructions });
        }

        let mut graph = Self {
            blocks,
            label_to_index,
            edges: vec![],
            exits: vec![],
        };

        graph.link()?;

        Ok(graph)
    }

    fn target(&self, label: &str) -> CompileResult<BlockIndex> {
        self.label_to_index
            .get(label)
            .copied()
            .ok_or_else(|| CompileError::internal(format!("jump to undefined label '{label}'")))
    }

    fn link(&mut self) -> CompileResult<()> {
        let mut edges = Vec::new();
        let mut exits = Vec::new();

        for (index, block) in self.blocks.enumerate() {
            let next = index.plus(1);
            let fallthrough = (next.index() < self.blocks.len()).then_some(next);

            let mut successors = Vec::with_capacity(2);

            match block.instructions.last().map(|s| &s.kind) {
                Some(StatementKind::Return { .. }) => exits.push(index),
                Some(StatementKind::Goto { label }) => successors.push(self.target(label)?),
                Some(kind) if kind.jump_target().is_some() => {
                    if let Some(label) = kind.jump_target() {
                        successors.push(self.target(label)?);
                    }
                    successors.extend(fallthrough);
                }
                _ => successors.extend(fallthrough),
            }

            for to in successors {
                let edge = Edge { from: index, to };

                if !edges.contains(&edge) {
                    edges.push(edge);
                }
            }
        }

        self.edges = edges;
        self.exits = exits;

        Ok(())
    }

    pub fn successors(&self, block: BlockIndex) -> impl Iterator<Item = BlockIndex> + '_ {
        self.edges.iter().filter(move |e| e.from == block).map(|e| e.to)
    }

    pub fn predecessors(&self, block: BlockIndex) -> impl Iterator<Item = BlockIndex> + '_ {
        self.edges.iter().filter(move |e| e.to == block).map(|e| e.from)
    }

    /// Renders the graph in Graphviz dot syntax
    pub fn to_dot(&self, function_name: &str) -> String {
        let mut dot = format!("digraph \"{function_name}\" {{\n    node [shape=box];\n");

        for (index, block) in self.blocks.enumerate() {
            let body = block
                .instructions
                .iter()
                .map(|s| crate::middle::tac::pretty_print::to_plain_text(&s.kind))
                .map(|line| line.replace('\\', "\\\\").replace('"', "\\\""))
                .collect::<Vec<_>>()
                .join("\\l");

            dot.push_str(&format!(
                "    b{index} [label=\"{}:\\l{body}\\l\"];\n",
                block.name
            ));
        }

        for edge in &self.edges {
            dot.push_str(&format!("    b{} -> b{};\n", edge.from, edge.to));
        }

        dot.push_str("}\n");
        dot
    }
}

#[cfg(test)]
mod tests {
    use indoc::indoc;
    use proptest::prelude::*;

    use super::*;
    use crate::middle::tac::{Register, parser::parse_functions};

    fn graph(source: &str) -> ControlFlowGraph {
        let functions = parse_functions(source).unwrap();
        ControlFlowGraph::build(&functions[0].instructions).unwrap()
    }

    #[test]
    fn label_and_return_form_one_block() {
        let cfg = graph("(function) f():\n    f_start:\n    return\n");

        assert_eq!(cfg.blocks.len(), 1);
        assert!(cfg.edges.is_empty());
        assert_eq!(cfg.exits, vec![BlockIndex::new(0)]);
    }

    #[test]
    fn conditional_branch_has_two_successors() {
        let cfg = graph(indoc! {"
            (function) f(r:x):
                goto f_else if r:x == 0
                r:y = 1
                return r:y
                f_else:
                r:y = 2
                return r:y
        "});

        assert_eq!(cfg.blocks.len(), 3);
        assert_eq!(cfg.label_to_index["f_else"], BlockIndex::new(2));

        let mut successors: Vec<_> = cfg.successors(BlockIndex::new(0)).collect();
        successors.sort();
        assert_eq!(successors, vec![BlockIndex::new(1), BlockIndex::new(2)]);
        assert_eq!(cfg.exits.len(), 2);
        assert_eq!(cfg.predecessors(BlockIndex::new(2)).count(), 1);
    }

    #[test]
    fn loops_link_back_to_their_header() {
        let cfg = graph(indoc! {"
            (function) f(r:n):
                f_loop:
                goto f_done if r:n == 0
                r:n += -1
                goto f_loop
                f_done:
                return r:n
        "});

        assert!(cfg.edges.contains(&Edge {
            from: BlockIndex::new(1),
            to: BlockIndex::new(0),
        }));
        assert!(cfg.to_dot("f").contains("b1 -> b0;"));
    }

    #[test]
    fn undefined_labels_are_internal_errors() {
        let functions = parse_functions("(function) f():\n    goto nowhere\n").unwrap();

        assert!(matches!(
            ControlFlowGraph::build(&functions[0].instructions),
            Err(CompileError::InternalInvariant(_))
        ));
    }

    #[test]
    fn empty_function_has_one_empty_block() {
        let cfg = ControlFlowGraph::build(&[]).unwrap();

        assert_eq!(cfg.blocks.len(), 1);
        assert!(cfg.blocks[BlockIndex::new(0)].instructions.is_empty());
    }

    /// Random straight-line code with labels, branches and returns that
    /// always ends in a return
    fn arb_instructions() -> impl Strategy<Value = Vec<Statement>> {
        let r = Register::new("x");

        let piece = prop_oneof![
            3 => Just(StatementKind::Increment { register: r.clone() }),
            1 => (0..4usize).prop_map(|n| StatementKind::Label { name: format!("l{n}") }),
            1 => (0..4usize).prop_map(|n| StatementKind::Goto { label: format!("l{n}") }),
            1 => (0..4usize).prop_map({
                let r = r.clone();
                move |n| StatementKind::GotoIfZero { register: r.clone(), label: format!("l{n}") }
            }),
            1 => Just(StatementKind::Return { register: None }),
        ];

        prop::collection::vec(piece, 0..40).prop_map(|kinds| {
            let mut seen = std::collections::HashSet::new();
            let mut statements: Vec<Statement> = kinds
                .into_iter()
                .filter(|kind| match kind {
                    StatementKind::Label { name } => seen.insert(name.clone()),
                    _ => true,
                })
                .map(|kind| Statement::new(kind, ""))
                .collect();

            // Every jump target must exist
            for n in 0..4 {
                let name = format!("l{n}");
                if !seen.contains(&name) {
                    statements.push(Statement::new(StatementKind::Label { name }, ""));
                }
            }

            statements.push(Statement::new(StatementKind::Return { register: None }, ""));
            statements
        })
    }

    proptest! {
        #[test]
        fn cfg_is_well_formed(instructions in arb_instructions()) {
            let cfg = ControlFlowGraph::build(&instructions).unwrap();

            prop_assert!(!cfg.blocks.is_empty());

            let returns = instructions
                .iter()
                .filter(|s| matches!(s.kind, StatementKind::Return { .. }))
                .count();
            prop_assert_eq!(cfg.exits.len(), returns);

            for index in cfg.blocks.indices() {
                if !cfg.exits.contains(&index) {
                    prop_assert!(cfg.successors(index).count() >= 1, "block {} has no successor", index);
                }
            }

            for (index, block) in cfg.blocks.enumerate().skip(1) {
                prop_assert!(!block.instructions.is_empty(), "block {} is empty", index);
            }

            let total: usize = cfg.blocks.iter().map(|b| b.instructions.len()).sum();
            prop_assert_eq!(total, instructions.len());
        }
    }
}
