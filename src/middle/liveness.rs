//! Backward liveness over straight-line blocks and whole functions.

use std::collections::{BTreeSet, VecDeque};

use crate::{
    error::CompileResult,
    index::{Index, IndexVec},
    middle::{
        cfg::{BlockIndex, ControlFlowGraph},
        tac::{Function, Register, Statement, StatementKind},
    },
};

pub type LivenessSet = BTreeSet<Register>;

/// Registers live before `kind`, given those live after it
pub fn transfer(kind: &StatementKind, live_after: &LivenessSet) -> LivenessSet {
    let mut live = live_after.clone();

    for written in kind.writes() {
        live.remove(&written);
    }

    live.extend(kind.reads());
    live
}

/// Liveness for a single block. Entry `i` holds the registers live before
/// instruction `i`, and the final entry equals `live_at_exit`.
pub fn block_liveness(instructions: &[Statement], live_at_exit: &LivenessSet) -> Vec<LivenessSet> {
    let mut sets = vec![LivenessSet::new(); instructions.len() + 1];
    sets[instructions.len()] = live_at_exit.clone();

    for (i, instruction) in instructions.iter().enumerate().rev() {
        sets[i] = transfer(&instruction.kind, &sets[i + 1]);
    }

    sets
}

/// Liveness for every program point of `function`, following jumps. The
/// result has one more entry than the function has instructions.
///
/// Blocks that return or run off the end of the function see the
/// function's `live_at_exit` registers as live out.
pub fn function_liveness(function: &Function) -> CompileResult<Vec<LivenessSet>> {
    let cfg = ControlFlowGraph::build(&function.instructions)?;
    let live_at_exit: LivenessSet = function.live_at_exit.iter().cloned().collect();

    let successors: IndexVec<BlockIndex, Vec<BlockIndex>> =
        IndexVec::from_raw(cfg.blocks.indices().map(|b| cfg.successors(b).collect()).collect());
    let predecessors: IndexVec<BlockIndex, Vec<BlockIndex>> =
        IndexVec::from_raw(cfg.blocks.indices().map(|b| cfg.predecessors(b).collect()).collect());

    let is_exit = |block: BlockIndex| cfg.exits.contains(&block) || successors[block].is_empty();

    let mut live_in: Vec<LivenessSet> = vec![LivenessSet::new(); cfg.blocks.len()];
    let mut worklist: VecDeque<BlockIndex> = cfg.blocks.indices().collect();

    let live_out = |live_in: &[LivenessSet], block: BlockIndex| {
        let mut out = if is_exit(block) {
            live_at_exit.clone()
        } else {
            LivenessSet::new()
        };

        for successor in &successors[block] {
            out.extend(live_in[successor.index()].iter().cloned());
        }

        out
    };

    while let Some(block) = worklist.pop_back() {
        let out = live_out(&live_in, block);
        let new_in = cfg.blocks[block]
            .instructions
            .iter()
            .rev()
            .fold(out, |live, s| transfer(&s.kind, &live));

        if new_in != live_in[block.index()] {
            live_in[block.index()] = new_in;

            for &predecessor in &predecessors[block] {
                if !worklist.contains(&predecessor) {
                    worklist.push_front(predecessor);
                }
            }
        }
    }

    let mut sets = Vec::with_capacity(function.instructions.len() + 1);

    for block in cfg.blocks.indices() {
        let mut block_sets = block_liveness(&cfg.blocks[block].instructions, &live_out(&live_in, block));
        let last = block_sets.pop();

        sets.extend(block_sets);

        if cfg.blocks.last_index() == Some(block) {
            sets.extend(last);
        }
    }

    Ok(sets)
}
