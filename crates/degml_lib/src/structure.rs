use std::collections::{BTreeSet, HashMap, VecDeque};

use tracing::{debug, warn};

use crate::ast::{Expression, Statement};
use crate::dominators::{Dominators, NaturalLoops};
use crate::flow::{BlockId, FlowGraph};
use crate::instruction::DataType;

pub fn synthesize(graph: &FlowGraph, dominators: &Dominators, loops: &NaturalLoops) -> Vec<Statement> {
    let mut s = Synthesizer {
        graph,
        loops,
        emitted: vec![false; graph.len()],
    };
    let out = s.run();
    let skipped = graph
        .ids()
        .filter(|id| *id != graph.final_block() && !s.emitted[id.0] && dominators.is_reachable(*id))
        .count();
    if skipped > 0 {
        debug!(skipped, "reachable blocks left out of the tree");
    }
    strip_unused_labels(out)
}

struct Fork {
    condition: Expression,
    then_start: BlockId,
    else_start: BlockId,
    bound: Option<BlockId>,
}

enum FrameKind {
    Root,
    ThenBranch { condition: Expression, else_start: BlockId },
    ElseBranch { condition: Expression, then_block: Vec<Statement> },
}

struct Frame {
    out: Vec<Statement>,
    next: Option<BlockId>,
    /// Block where this walk hands control back to the enclosing one.
    stop: Option<BlockId>,
    kind: FrameKind,
}

impl Frame {
    fn new(next: BlockId, stop: Option<BlockId>, kind: FrameKind) -> Self {
        Self { out: Vec::new(), next: Some(next), stop, kind }
    }
}

struct Synthesizer<'a> {
    graph: &'a FlowGraph,
    loops: &'a NaturalLoops,
    emitted: Vec<bool>,
}

impl Synthesizer<'_> {
    fn run(&mut self) -> Vec<Statement> {
        let mut stack = vec![Frame::new(self.graph.entry(), None, FrameKind::Root)];
        loop {
            let Some(top) = stack.last_mut() else {
                return Vec::new();
            };
            if let Some(fork) = self.advance(top) {
                let kind = FrameKind::ThenBranch { condition: fork.condition, else_start: fork.else_start };
                stack.push(Frame::new(fork.then_start, fork.bound, kind));
                continue;
            }
            let Some(done) = stack.pop() else {
                return Vec::new();
            };
            match done.kind {
                FrameKind::Root => return done.out,
                FrameKind::ThenBranch { condition, else_start } => {
                    let kind = FrameKind::ElseBranch { condition, then_block: done.out };
                    stack.push(Frame::new(else_start, done.stop, kind));
                }
                FrameKind::ElseBranch { condition, then_block } => {
                    let stmt = structured_if(condition, then_block, done.out);
                    if let Some(parent) = stack.last_mut() {
                        parent.out.push(stmt);
                    }
                }
            }
        }
    }

    fn advance(&mut self, frame: &mut Frame) -> Option<Fork> {
        let final_block = self.graph.final_block();
        while let Some(cur) = frame.next.take() {
            if Some(cur) == frame.stop {
                return None;
            }
            if cur == final_block {
                // Only the enclosing walk continues past `stop`.
                if frame.stop.is_some() && !frame.out.last().is_some_and(ends_control) {
                    frame.out.push(Statement::Return(None));
                }
                return None;
            }
            let block = self.graph.block(cur);
            if self.emitted[cur.0] {
                if let Some(address) = block.address {
                    frame.out.push(Statement::Goto(address));
                }
                return None;
            }
            self.emitted[cur.0] = true;
            if let Some(address) = block.address {
                frame.out.push(Statement::Label(address));
            }
            if let Some(stmts) = &block.statements {
                frame.out.extend(stmts.iter().cloned());
            }

            let (Some(next_true), Some(next_false)) = (block.next_true, block.next_false) else {
                return None;
            };
            if !block.conditional {
                // `bt`/`bf` to the next instruction still evaluates its condition.
                if let Some(condition) = block.condition.as_ref().filter(|c| !c.is_inert()) {
                    frame.out.push(Statement::Expr(condition.clone()));
                }
                if self.loops.is_back_edge(cur, next_true) {
                    frame.out.push(self.goto(next_true));
                    return None;
                }
                frame.next = Some(next_true);
                continue;
            }

            let condition = match &block.condition {
                Some(c) => c.clone(),
                None => {
                    warn!(block = ?block.address, "conditional block without a condition");
                    frame.out.push(Statement::diagnostic("branch condition was not recovered"));
                    Expression::int(1, DataType::Boolean)
                }
            };
            if self.loops.is_back_edge(cur, next_true) {
                frame.out.push(Statement::If {
                    condition,
                    then_block: vec![self.goto(next_true)],
                    else_block: Vec::new(),
                });
                frame.next = Some(next_false);
                continue;
            }
            if self.loops.is_back_edge(cur, next_false) {
                frame.out.push(Statement::If {
                    condition: condition.negate(),
                    then_block: vec![self.goto(next_false)],
                    else_block: Vec::new(),
                });
                frame.next = Some(next_true);
                continue;
            }

            let meet = self.meet_point(next_true, next_false, frame.stop);
            frame.next = meet;
            return Some(Fork {
                condition,
                then_start: next_true,
                else_start: next_false,
                bound: meet.or(frame.stop),
            });
        }
        None
    }

    fn goto(&self, target: BlockId) -> Statement {
        match self.graph.block(target).address {
            Some(address) => Statement::Goto(address),
            None => Statement::diagnostic("jump to the unit entry"),
        }
    }

    /// First block common to the shortest paths from `a` and from `b`
    /// towards `stop` (or the end of the unit).
    fn meet_point(&self, a: BlockId, b: BlockId, stop: Option<BlockId>) -> Option<BlockId> {
        let final_block = self.graph.final_block();
        let roots = stop.into_iter().chain((stop != Some(final_block)).then_some(final_block));
        for root in roots {
            let parents = self.exit_tree(root);
            if let Some(meet) = lowest_common_ancestor(&parents, root, a, b) {
                return (meet != final_block).then_some(meet);
            }
        }
        None
    }

    /// Breadth-first tree over predecessor edges: each block maps to its
    /// next hop on a shortest path to `root`.
    fn exit_tree(&self, root: BlockId) -> HashMap<BlockId, BlockId> {
        let mut parents = HashMap::new();
        let mut seen = BTreeSet::from([root]);
        let mut queue = VecDeque::from([root]);
        while let Some(b) = queue.pop_front() {
            for &p in self.graph.predecessors(b) {
                if seen.insert(p) {
                    parents.insert(p, b);
                    queue.push_back(p);
                }
            }
        }
        parents
    }
}

fn lowest_common_ancestor(
    parents: &HashMap<BlockId, BlockId>,
    root: BlockId,
    a: BlockId,
    b: BlockId,
) -> Option<BlockId> {
    let in_tree = |x: BlockId| x == root || parents.contains_key(&x);
    if !in_tree(a) || !in_tree(b) {
        return None;
    }
    let mut ancestors = BTreeSet::new();
    let mut cur = a;
    loop {
        ancestors.insert(cur);
        match parents.get(&cur) {
            Some(&p) => cur = p,
            None => break,
        }
    }
    let mut cur = b;
    loop {
        if ancestors.contains(&cur) {
            return Some(cur);
        }
        cur = *parents.get(&cur)?;
    }
}

fn ends_control(stmt: &Statement) -> bool {
    matches!(stmt, Statement::Return(_) | Statement::Signal(_) | Statement::Goto(_))
}

fn structured_if(condition: Expression, then_block: Vec<Statement>, else_block: Vec<Statement>) -> Statement {
    if then_block.is_empty() && !else_block.is_empty() {
        Statement::If { condition: condition.negate(), then_block: else_block, else_block: then_block }
    } else {
        Statement::If { condition, then_block, else_block }
    }
}

fn collect_gotos(stmts: &[Statement], out: &mut BTreeSet<u32>) {
    for s in stmts {
        match s {
            Statement::Goto(address) => {
                out.insert(*address);
            }
            Statement::If { then_block, else_block, .. } => {
                collect_gotos(then_block, out);
                collect_gotos(else_block, out);
            }
            Statement::Block(inner) => collect_gotos(inner, out),
            _ => {}
        }
    }
}

fn retain_labels(stmts: Vec<Statement>, used: &BTreeSet<u32>) -> Vec<Statement> {
    stmts
        .into_iter()
        .filter(|s| !matches!(s, Statement::Label(address) if !used.contains(address)))
        .map(|s| match s {
            Statement::If { condition, then_block, else_block } => Statement::If {
                condition,
                then_block: retain_labels(then_block, used),
                else_block: retain_labels(else_block, used),
            },
            Statement::Block(inner) => Statement::Block(retain_labels(inner, used)),
            other => other,
        })
        .collect()
}

pub fn strip_unused_labels(stmts: Vec<Statement>) -> Vec<Statement> {
    let mut used = BTreeSet::new();
    collect_gotos(&stmts, &mut used);
    retain_labels(stmts, &used)
}
