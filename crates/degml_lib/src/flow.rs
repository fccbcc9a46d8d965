//! Blocks live in an arena indexed by [`BlockId`]. Besides the blocks holding
//! code there is an entry placeholder (no address) and a final block at
//! `code_length`.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};
use tracing::trace;

use crate::ast::{Expression, Statement, TempRef};
use crate::instruction::Instruction;
use crate::tables::Opcode;
use crate::DecompileError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct BlockId(pub usize);

#[derive(Debug, Clone, Default)]
pub struct Block {
    /// `None` only for the entry placeholder.
    pub address: Option<u32>,
    pub instructions: Vec<Instruction>,
    /// Set once by the stack simulator.
    pub statements: Option<Vec<Statement>>,
    pub condition: Option<Expression>,
    pub next_true: Option<BlockId>,
    pub next_false: Option<BlockId>,
    pub conditional: bool,
    /// Ends in `pushenv`/`popenv`, whose instance switch is not modelled.
    pub context_switch: bool,
    pub predecessors: Vec<BlockId>,
    /// Temp references live on entry, recorded when first simulated.
    pub entry_temps: Option<Vec<TempRef>>,
}

impl Block {
    fn new(address: Option<u32>) -> Self {
        Self { address, ..Default::default() }
    }

    pub fn is_simulated(&self) -> bool {
        self.statements.is_some()
    }

    pub fn is_terminal(&self) -> bool {
        self.next_true.is_none() && self.next_false.is_none()
    }

    pub fn successors(&self) -> Vec<BlockId> {
        let mut out = Vec::with_capacity(2);
        for s in [self.next_true, self.next_false].into_iter().flatten() {
            if !out.contains(&s) {
                out.push(s);
            }
        }
        out
    }

    pub fn end_address(&self) -> Option<u32> {
        match self.instructions.last() {
            Some(last) => Some(last.address + last.size()),
            None => self.address,
        }
    }
}

#[derive(Debug, Clone)]
pub struct FlowGraph {
    blocks: Vec<Block>,
    by_address: BTreeMap<u32, BlockId>,
    entry: BlockId,
    final_block: BlockId,
    code_length: u32,
}

impl FlowGraph {
    pub fn build(instructions: &[Instruction]) -> Result<Self, DecompileError> {
        let code_length = instructions.last().map(|i| i.address + i.size()).unwrap_or(0);
        validate_jumps(instructions, code_length)?;

        let mut graph = FlowGraph {
            blocks: vec![Block::new(None)],
            by_address: BTreeMap::new(),
            entry: BlockId(0),
            final_block: BlockId(0),
            code_length,
        };
        graph.final_block = graph.insert_block(code_length);

        let first = match instructions.first() {
            Some(first) => first.address,
            None => {
                graph.set_exits(graph.entry, graph.final_block, graph.final_block, false);
                return Ok(graph);
            }
        };
        let first_block = graph.insert_block(first);
        graph.set_exits(graph.entry, first_block, first_block, false);

        let mut current: Option<BlockId> = None;
        for ins in instructions {
            if let Some(&start) = graph.by_address.get(&ins.address) {
                if let Some(cur) = current {
                    graph.set_exits(cur, start, start, false);
                }
                current = Some(start);
            }
            let cur = match current {
                Some(cur) => cur,
                None => {
                    let id = graph.insert_block(ins.address);
                    current = Some(id);
                    id
                }
            };
            graph.blocks[cur.0].instructions.push(ins.clone());

            let next_address = ins.address + ins.size();
            match ins.opcode {
                Opcode::B => {
                    let target = graph.block_for_target(jump_address(ins), &mut current)?;
                    let cur = current.unwrap_or(cur);
                    graph.set_exits(cur, target, target, false);
                    current = None;
                }
                Opcode::Bt | Opcode::Bf => {
                    let jump = graph.block_for_target(jump_address(ins), &mut current)?;
                    let next = graph.block_for_target(next_address, &mut current)?;
                    let cur = current.unwrap_or(cur);
                    if ins.opcode == Opcode::Bt {
                        graph.set_exits(cur, jump, next, true);
                    } else {
                        graph.set_exits(cur, next, jump, true);
                    }
                    current = None;
                }
                Opcode::Pushenv | Opcode::Popenv => {
                    let next = graph.block_for_target(next_address, &mut current)?;
                    graph.blocks[cur.0].context_switch = true;
                    graph.set_exits(cur, next, next, false);
                    current = None;
                }
                _ if ins.is_terminal() => {
                    // Registers the following address so unreachable code
                    // after a return still gets its own block.
                    graph.block_for_target(next_address, &mut current)?;
                    let final_block = graph.final_block;
                    graph.set_exits(cur, final_block, final_block, false);
                    current = None;
                }
                _ => {}
            }
        }
        if let Some(cur) = current {
            let final_block = graph.final_block;
            graph.set_exits(cur, final_block, final_block, false);
        }

        trace!(blocks = graph.blocks.len(), code_length, "flow graph complete");
        Ok(graph)
    }

    pub fn entry(&self) -> BlockId {
        self.entry
    }

    pub fn final_block(&self) -> BlockId {
        self.final_block
    }

    pub fn code_length(&self) -> u32 {
        self.code_length
    }

    pub fn len(&self) -> usize {
        self.blocks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }

    pub fn block(&self, id: BlockId) -> &Block {
        &self.blocks[id.0]
    }

    pub fn block_mut(&mut self, id: BlockId) -> &mut Block {
        &mut self.blocks[id.0]
    }

    pub fn ids(&self) -> impl Iterator<Item = BlockId> + '_ {
        (0..self.blocks.len()).map(BlockId)
    }

    pub fn blocks(&self) -> impl Iterator<Item = (BlockId, &Block)> {
        self.blocks.iter().enumerate().map(|(i, b)| (BlockId(i), b))
    }

    /// Blocks in address order, excluding the entry placeholder.
    pub fn blocks_by_address(&self) -> impl Iterator<Item = (u32, BlockId)> + '_ {
        self.by_address.iter().map(|(&a, &id)| (a, id))
    }

    pub fn block_at(&self, address: u32) -> Option<BlockId> {
        self.by_address.get(&address).copied()
    }

    pub fn predecessors(&self, id: BlockId) -> &[BlockId] {
        &self.blocks[id.0].predecessors
    }

    pub fn successors(&self, id: BlockId) -> Vec<BlockId> {
        self.blocks[id.0].successors()
    }

    pub fn reachable(&self) -> BTreeSet<BlockId> {
        let mut seen = BTreeSet::new();
        let mut work = vec![self.entry];
        while let Some(b) = work.pop() {
            if seen.insert(b) {
                work.extend(self.successors(b));
            }
        }
        seen
    }

    /// Splits the block containing `address` so that a block starts there.
    pub fn split_at(&mut self, address: u32) -> Result<BlockId, DecompileError> {
        if let Some(&id) = self.by_address.get(&address) {
            return Ok(id);
        }
        let old = self
            .by_address
            .range(..address)
            .next_back()
            .map(|(_, &id)| id)
            .filter(|id| self.blocks[id.0].instructions.iter().any(|i| i.address == address))
            .ok_or(DecompileError::MisalignedJump { address, target: address })?;

        let pos = self.blocks[old.0]
            .instructions
            .iter()
            .position(|i| i.address == address)
            .ok_or(DecompileError::MisalignedJump { address, target: address })?;
        let tail = self.blocks[old.0].instructions.split_off(pos);

        let new = BlockId(self.blocks.len());
        let old_block = &mut self.blocks[old.0];
        let moved = Block {
            address: Some(address),
            instructions: tail,
            statements: None,
            condition: old_block.condition.take(),
            next_true: old_block.next_true.take(),
            next_false: old_block.next_false.take(),
            conditional: old_block.conditional,
            context_switch: old_block.context_switch,
            predecessors: vec![old],
            entry_temps: None,
        };
        old_block.conditional = false;
        old_block.context_switch = false;
        old_block.next_true = Some(new);
        old_block.next_false = Some(new);

        for succ in moved.successors() {
            for p in &mut self.blocks[succ.0].predecessors {
                if *p == old {
                    *p = new;
                }
            }
        }
        self.blocks.push(moved);
        self.by_address.insert(address, new);
        trace!(address, from = old.0, to = new.0, "split block");
        Ok(new)
    }

    fn insert_block(&mut self, address: u32) -> BlockId {
        let id = BlockId(self.blocks.len());
        self.blocks.push(Block::new(Some(address)));
        self.by_address.insert(address, id);
        id
    }

    fn block_for_target(&mut self, address: u32, current: &mut Option<BlockId>) -> Result<BlockId, DecompileError> {
        if let Some(&id) = self.by_address.get(&address) {
            return Ok(id);
        }
        let inside_existing = self
            .by_address
            .range(..address)
            .next_back()
            .is_some_and(|(_, id)| self.blocks[id.0].end_address().is_some_and(|end| address < end));
        if !inside_existing {
            return Ok(self.insert_block(address));
        }
        let containing = self.by_address.range(..address).next_back().map(|(_, &id)| id);
        let new = self.split_at(address)?;
        if current.is_some() && *current == containing {
            *current = Some(new);
        }
        Ok(new)
    }

    fn set_exits(&mut self, id: BlockId, next_true: BlockId, next_false: BlockId, conditional: bool) {
        for old in self.blocks[id.0].successors() {
            self.blocks[old.0].predecessors.retain(|p| *p != id);
        }
        let block = &mut self.blocks[id.0];
        block.next_true = Some(next_true);
        block.next_false = Some(next_false);
        block.conditional = conditional && next_true != next_false;
        for succ in block.successors() {
            let preds = &mut self.blocks[succ.0].predecessors;
            if !preds.contains(&id) {
                preds.push(id);
            }
        }
    }
}

fn jump_address(ins: &Instruction) -> u32 {
    // Range checked by validate_jumps.
    ins.jump_target().unwrap_or(0) as u32
}

fn validate_jumps(instructions: &[Instruction], code_length: u32) -> Result<(), DecompileError> {
    let addresses: BTreeSet<u32> = instructions.iter().map(|i| i.address).collect();
    for ins in instructions {
        let target = match ins.jump_target() {
            Some(t) => t,
            None => continue,
        };
        if target < 0 || target > code_length as i64 {
            return Err(DecompileError::JumpOutOfRange {
                address: ins.address,
                target,
                length: code_length,
            });
        }
        let target = target as u32;
        if target != code_length && !addresses.contains(&target) {
            return Err(DecompileError::MisalignedJump { address: ins.address, target });
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::instruction::asm::Asm;
    use crate::instruction::{ComparisonKind, DataType, VariableMode};

    fn assert_partition(graph: &FlowGraph, instrs: &[Instruction]) {
        let mut seen: Vec<u32> = Vec::new();
        for (addr, id) in graph.blocks_by_address() {
            let b = graph.block(id);
            if let Some(first) = b.instructions.first() {
                assert_eq!(first.address, addr);
            }
            seen.extend(b.instructions.iter().map(|i| i.address));
        }
        seen.sort_unstable();
        let all: Vec<u32> = instrs.iter().map(|i| i.address).collect();
        assert_eq!(seen, all);
    }

    #[test]
    fn linear_code_is_one_block() {
        let mut a = Asm::new();
        a.pushi(1).pushi(2).binary(Opcode::Add, DataType::Int16);
        let instrs = a.instructions();
        let g = FlowGraph::build(&instrs).unwrap();

        let code_blocks: Vec<_> = g.blocks().filter(|(_, b)| !b.instructions.is_empty()).collect();
        assert_eq!(code_blocks.len(), 1);
        let (id, b) = code_blocks[0];
        assert_eq!(b.next_true, Some(g.final_block()));
        assert_eq!(g.successors(g.entry()), vec![id]);
        assert_eq!(g.block(g.final_block()).address, Some(3));
        assert_partition(&g, &instrs);
    }

    #[test]
    fn conditional_edges_follow_polarity() {
        let mut a = Asm::new();
        let else_ = a.label();
        let end = a.label();
        a.pushi(1).pushi(2).cmp(ComparisonKind::Less).jump(Opcode::Bf, else_);
        a.pushi(3).pop_var(-1, VariableMode::Normal, 0).jump(Opcode::B, end);
        a.bind(else_).pushi(4).pop_var(-1, VariableMode::Normal, 0);
        a.bind(end).simple(Opcode::Exit, DataType::Int32);
        let instrs = a.instructions();
        let g = FlowGraph::build(&instrs).unwrap();

        let head = g.block_at(0).unwrap();
        let then_ = g.block_at(4).unwrap();
        let else_ = g.block_at(8).unwrap();
        let join = g.block_at(11).unwrap();
        let hb = g.block(head);
        assert!(hb.conditional);
        assert_eq!(hb.next_true, Some(then_));
        assert_eq!(hb.next_false, Some(else_));
        assert_eq!(g.successors(then_), vec![join]);
        let mut join_preds = g.predecessors(join).to_vec();
        join_preds.sort();
        let mut expected = vec![then_, else_];
        expected.sort();
        assert_eq!(join_preds, expected);
        assert_eq!(g.successors(join), vec![g.final_block()]);
        assert_partition(&g, &instrs);
    }

    #[test]
    fn backward_jump_splits_current_block() {
        // 0: pushi, 1: pushi, 2: popz, 3: popz, 4: b -> 2
        let mut a = Asm::new();
        a.pushi(1).pushi(2);
        a.simple(Opcode::Popz, DataType::Int16).simple(Opcode::Popz, DataType::Int16);
        a.jump_raw(Opcode::B, -2);
        let instrs = a.instructions();
        let g = FlowGraph::build(&instrs).unwrap();

        let head = g.block_at(0).unwrap();
        let tail = g.block_at(2).unwrap();
        assert_eq!(g.block(head).instructions.len(), 2);
        assert_eq!(g.block(tail).instructions.len(), 3);
        assert_eq!(g.successors(head), vec![tail]);
        assert_eq!(g.successors(tail), vec![tail]);
        let mut preds = g.predecessors(tail).to_vec();
        preds.sort();
        assert_eq!(preds, vec![head, tail]);
        assert_partition(&g, &instrs);
    }

    #[test]
    fn split_preserves_edges_and_is_idempotent() {
        // A prefix branching forward to a block spanning [10, 20).
        let mut a = Asm::new();
        let start = a.label();
        for _ in 0..4 {
            a.pushi(0).simple(Opcode::Popz, DataType::Int16);
        }
        a.pushi(0).jump(Opcode::B, start);
        a.bind(start);
        for _ in 0..4 {
            a.pushi(7).simple(Opcode::Popz, DataType::Int16);
        }
        a.pushi(1).simple(Opcode::Ret, DataType::Variable);
        let instrs = a.instructions();
        let mut g = FlowGraph::build(&instrs).unwrap();

        let original = g.block_at(10).unwrap();
        assert_eq!(g.block(original).end_address(), Some(20));
        let before: Vec<u32> = g.block(original).instructions.iter().map(|i| i.address).collect();
        let succ_before = g.successors(original);
        let pred_before = g.predecessors(original).to_vec();

        let new = g.split_at(15).unwrap();
        assert_eq!(g.split_at(15).unwrap(), new);
        assert_eq!(g.split_at(10).unwrap(), original);

        let head: Vec<u32> = g.block(original).instructions.iter().map(|i| i.address).collect();
        let tail: Vec<u32> = g.block(new).instructions.iter().map(|i| i.address).collect();
        assert_eq!(head, (10..15).collect::<Vec<u32>>());
        assert_eq!(tail, (15..20).collect::<Vec<u32>>());
        assert_eq!([head, tail].concat(), before);
        assert_eq!(g.successors(original), vec![new]);
        assert_eq!(g.successors(new), succ_before);
        assert_eq!(g.predecessors(original), pred_before.as_slice());
        assert_eq!(g.predecessors(new), &[original]);
        for s in succ_before {
            assert!(g.predecessors(s).contains(&new));
            assert!(!g.predecessors(s).contains(&original));
        }
        assert_partition(&g, &instrs);
    }

    #[test]
    fn unreachable_code_after_return_gets_its_own_block() {
        let mut a = Asm::new();
        a.pushi(1).simple(Opcode::Ret, DataType::Variable);
        a.pushi(2).simple(Opcode::Popz, DataType::Int16);
        let instrs = a.instructions();
        let g = FlowGraph::build(&instrs).unwrap();
        let dead = g.block_at(2).unwrap();
        assert!(g.predecessors(dead).is_empty());
        assert!(!g.reachable().contains(&dead));
        assert_eq!(g.successors(g.block_at(0).unwrap()), vec![g.final_block()]);
    }

    #[test]
    fn rejects_out_of_range_and_misaligned_jumps() {
        let mut a = Asm::new();
        a.pushi(1).jump_raw(Opcode::Bt, 5);
        let err = FlowGraph::build(&a.instructions()).unwrap_err();
        assert!(matches!(err, DecompileError::JumpOutOfRange { address: 1, target: 6, length: 2 }));

        let mut a = Asm::new();
        a.jump_raw(Opcode::B, -1);
        assert!(matches!(
            FlowGraph::build(&a.instructions()),
            Err(DecompileError::JumpOutOfRange { target: -1, .. })
        ));

        let mut a = Asm::new();
        a.jump_raw(Opcode::B, 2).push_int(5).simple(Opcode::Popz, DataType::Int32);
        assert!(matches!(
            FlowGraph::build(&a.instructions()),
            Err(DecompileError::MisalignedJump { address: 0, target: 2 })
        ));
    }

    #[test]
    fn context_switch_blocks_fall_through() {
        let mut a = Asm::new();
        a.pushi(5).jump_raw(Opcode::Pushenv, 3);
        a.pushi(1).simple(Opcode::Popz, DataType::Int16);
        a.jump_raw(Opcode::Popenv, -2);
        a.simple(Opcode::Exit, DataType::Int32);
        let instrs = a.instructions();
        let g = FlowGraph::build(&instrs).unwrap();
        let head = g.block_at(0).unwrap();
        assert!(g.block(head).context_switch);
        assert_eq!(g.successors(head), vec![g.block_at(2).unwrap()]);
        let body = g.block_at(2).unwrap();
        assert!(g.block(body).context_switch);
        assert_eq!(g.successors(body), vec![g.block_at(5).unwrap()]);
        assert_partition(&g, &instrs);
    }
}
