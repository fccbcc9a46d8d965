use std::collections::{BTreeMap, BTreeSet};

use tracing::trace;

use crate::flow::{BlockId, FlowGraph};

#[derive(Debug, Clone, PartialEq, Eq)]
struct BitSet {
    words: Vec<u64>,
    len: usize,
}

impl BitSet {
    fn empty(len: usize) -> Self {
        Self { words: vec![0; len.div_ceil(64)], len }
    }

    fn full(len: usize) -> Self {
        let mut set = Self::empty(len);
        for i in 0..len {
            set.insert(i);
        }
        set
    }

    fn insert(&mut self, i: usize) {
        self.words[i / 64] |= 1u64 << (i % 64);
    }

    fn contains(&self, i: usize) -> bool {
        i < self.len && self.words[i / 64] & (1u64 << (i % 64)) != 0
    }

    fn intersect_with(&mut self, other: &BitSet) {
        for (a, b) in self.words.iter_mut().zip(&other.words) {
            *a &= *b;
        }
    }

    fn count(&self) -> usize {
        self.words.iter().map(|w| w.count_ones() as usize).sum()
    }

    fn iter(&self) -> impl Iterator<Item = usize> + '_ {
        (0..self.len).filter(|&i| self.contains(i))
    }
}

/// `dom(b)`: the blocks on every path from the root to `b`.
#[derive(Debug, Clone)]
pub struct Dominators {
    root: BlockId,
    sets: Vec<BitSet>,
    reachable: Vec<bool>,
}

impl Dominators {
    pub fn compute(graph: &FlowGraph) -> Self {
        Self::solve(graph.len(), graph.entry(), |b| graph.successors(b), |b| graph.predecessors(b).to_vec())
    }

    /// Post-dominators: dominators of the reversed graph rooted at the final
    /// block.
    pub fn post_dominators(graph: &FlowGraph) -> Self {
        Self::solve(graph.len(), graph.final_block(), |b| graph.predecessors(b).to_vec(), |b| graph.successors(b))
    }

    fn solve(
        len: usize,
        root: BlockId,
        forward: impl Fn(BlockId) -> Vec<BlockId>,
        backward: impl Fn(BlockId) -> Vec<BlockId>,
    ) -> Self {
        let order = reverse_postorder(len, root, &forward);
        let mut reachable = vec![false; len];
        for b in &order {
            reachable[b.0] = true;
        }

        let mut sets: Vec<BitSet> = (0..len)
            .map(|i| {
                if i == root.0 || !reachable[i] {
                    let mut own = BitSet::empty(len);
                    own.insert(i);
                    own
                } else {
                    BitSet::full(len)
                }
            })
            .collect();

        let mut rounds = 0usize;
        let mut changed = true;
        while changed {
            changed = false;
            rounds += 1;
            for &b in order.iter().filter(|b| **b != root) {
                let mut next = BitSet::full(len);
                for p in backward(b).into_iter().filter(|p| reachable[p.0]) {
                    next.intersect_with(&sets[p.0]);
                }
                next.insert(b.0);
                if next != sets[b.0] {
                    sets[b.0] = next;
                    changed = true;
                }
            }
        }
        trace!(root = root.0, blocks = len, rounds, "dominators converged");

        Self { root, sets, reachable }
    }

    pub fn root(&self) -> BlockId {
        self.root
    }

    pub fn is_reachable(&self, b: BlockId) -> bool {
        self.reachable.get(b.0).copied().unwrap_or(false)
    }

    /// `a ∈ dom(b)`.
    pub fn dominates(&self, a: BlockId, b: BlockId) -> bool {
        self.sets.get(b.0).is_some_and(|set| set.contains(a.0))
    }

    pub fn dominators_of(&self, b: BlockId) -> BTreeSet<BlockId> {
        self.sets
            .get(b.0)
            .map(|set| set.iter().map(BlockId).collect())
            .unwrap_or_default()
    }

    pub fn immediate_dominator(&self, b: BlockId) -> Option<BlockId> {
        let set = self.sets.get(b.0)?;
        set.iter()
            .filter(|&d| d != b.0)
            .max_by_key(|&d| self.sets[d].count())
            .map(BlockId)
    }
}

fn reverse_postorder(len: usize, root: BlockId, forward: &impl Fn(BlockId) -> Vec<BlockId>) -> Vec<BlockId> {
    let mut visited = vec![false; len];
    let mut post = Vec::with_capacity(len);
    let mut stack: Vec<(BlockId, Vec<BlockId>)> = vec![(root, forward(root))];
    visited[root.0] = true;
    while let Some((b, pending)) = stack.last_mut() {
        let b = *b;
        match pending.pop() {
            Some(next) if !visited[next.0] => {
                visited[next.0] = true;
                let succs = forward(next);
                stack.push((next, succs));
            }
            Some(_) => {}
            None => {
                post.push(b);
                stack.pop();
            }
        }
    }
    post.reverse();
    post
}

/// Loop bodies keyed by header. Every back-edge `b -> h` (where `h`
/// dominates `b`) contributes the blocks that reach `b` without passing
/// through `h`; bodies of back-edges sharing a header are merged.
#[derive(Debug, Clone, Default)]
pub struct NaturalLoops {
    loops: BTreeMap<BlockId, BTreeSet<BlockId>>,
    back_edges: BTreeSet<(BlockId, BlockId)>,
}

impl NaturalLoops {
    pub fn compute(graph: &FlowGraph, dominators: &Dominators) -> Self {
        let mut out = NaturalLoops::default();
        for (b, block) in graph.blocks() {
            if !dominators.is_reachable(b) {
                continue;
            }
            for s in block.successors() {
                if !dominators.dominates(s, b) {
                    continue;
                }
                out.back_edges.insert((b, s));
                let body = out.loops.entry(s).or_default();
                body.insert(s);
                let mut work = vec![b];
                while let Some(m) = work.pop() {
                    if !body.insert(m) {
                        continue;
                    }
                    work.extend(
                        graph
                            .predecessors(m)
                            .iter()
                            .copied()
                            .filter(|p| dominators.is_reachable(*p) && !body.contains(p)),
                    );
                }
                trace!(header = s.0, latch = b.0, size = body.len(), "natural loop");
            }
        }
        out
    }

    pub fn len(&self) -> usize {
        self.loops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.loops.is_empty()
    }

    pub fn headers(&self) -> impl Iterator<Item = BlockId> + '_ {
        self.loops.keys().copied()
    }

    pub fn members(&self, header: BlockId) -> Option<&BTreeSet<BlockId>> {
        self.loops.get(&header)
    }

    pub fn is_back_edge(&self, from: BlockId, to: BlockId) -> bool {
        self.back_edges.contains(&(from, to))
    }

    pub fn iter(&self) -> impl Iterator<Item = (BlockId, &BTreeSet<BlockId>)> {
        self.loops.iter().map(|(h, m)| (*h, m))
    }
}
