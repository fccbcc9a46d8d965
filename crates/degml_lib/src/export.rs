use serde::{Deserialize, Serialize};

use crate::flow::{BlockId, FlowGraph};
use crate::tables::Opcode;
use crate::DecompileError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EdgeKind {
    Fallthrough,
    Jump,
    True,
    False,
    /// Return, exit or signal into the final block.
    Exit,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EdgeExport {
    pub from: usize,
    pub to: usize,
    pub kind: EdgeKind,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockExport {
    pub id: usize,
    /// `None` for the entry placeholder.
    pub address: Option<u32>,
    pub instructions: Vec<String>,
    /// Net stack height change across the block.
    pub stack_delta: i64,
    pub context_switch: bool,
    pub predecessors: Vec<usize>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlowGraphExport {
    pub code_length: u32,
    pub entry: usize,
    pub final_block: usize,
    pub blocks: Vec<BlockExport>,
    pub edges: Vec<EdgeExport>,
}

impl FlowGraphExport {
    pub fn from_graph(graph: &FlowGraph) -> Self {
        let order: Vec<BlockId> = std::iter::once(graph.entry())
            .chain(graph.blocks_by_address().map(|(_, id)| id))
            .collect();

        let mut blocks = Vec::with_capacity(order.len());
        let mut edges = Vec::new();
        for id in order {
            let block = graph.block(id);
            let stack_delta = block
                .instructions
                .iter()
                .map(|i| {
                    let (pops, pushes) = i.stack_effect();
                    pushes as i64 - pops as i64
                })
                .sum();
            blocks.push(BlockExport {
                id: id.0,
                address: block.address,
                instructions: block.instructions.iter().map(ToString::to_string).collect(),
                stack_delta,
                context_switch: block.context_switch,
                predecessors: block.predecessors.iter().map(|p| p.0).collect(),
            });

            if block.conditional {
                for (to, kind) in [(block.next_true, EdgeKind::True), (block.next_false, EdgeKind::False)] {
                    if let Some(to) = to {
                        edges.push(EdgeExport { from: id.0, to: to.0, kind });
                    }
                }
            } else if let Some(to) = block.next_true {
                let kind = match block.instructions.last() {
                    Some(last) if last.opcode == Opcode::B => EdgeKind::Jump,
                    Some(last) if last.is_terminal() => EdgeKind::Exit,
                    _ => EdgeKind::Fallthrough,
                };
                edges.push(EdgeExport { from: id.0, to: to.0, kind });
            }
        }

        Self {
            code_length: graph.code_length(),
            entry: graph.entry().0,
            final_block: graph.final_block().0,
            blocks,
            edges,
        }
    }

    pub fn to_json(&self) -> Result<String, DecompileError> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    pub fn to_dot(&self, name: &str) -> String {
        let mut dot = format!("digraph \"{}\" {{\n", escape(name));
        dot.push_str("  node [shape=box, fontname=\"monospace\"];\n");
        for block in &self.blocks {
            let title = if block.id == self.entry {
                "entry".to_string()
            } else if block.id == self.final_block {
                format!("final @{}", self.code_length)
            } else {
                match block.address {
                    Some(address) => format!("L{address} (stack {:+})", block.stack_delta),
                    None => format!("B{}", block.id),
                }
            };
            let mut label = escape(&title);
            label.push_str("\\l");
            for ins in &block.instructions {
                label.push_str(&escape(ins));
                label.push_str("\\l");
            }
            dot.push_str(&format!("  B{} [label=\"{}\"];\n", block.id, label));
        }
        for edge in &self.edges {
            let attrs = match edge.kind {
                EdgeKind::True => " [label=\"true\", color=green]",
                EdgeKind::False => " [label=\"false\", color=red]",
                EdgeKind::Exit => " [style=dashed]",
                EdgeKind::Jump | EdgeKind::Fallthrough => "",
            };
            dot.push_str(&format!("  B{} -> B{}{};\n", edge.from, edge.to, attrs));
        }
        dot.push_str("}\n");
        dot
    }
}

fn escape(s: &str) -> String {
    s.replace('\\', "\\\\").replace('"', "\\\"")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::instruction::asm::Asm;
    use crate::instruction::DataType;

    fn diamond() -> FlowGraph {
        let mut a = Asm::new();
        let other = a.label();
        let join = a.label();
        a.pushi(1).jump(Opcode::Bf, other);
        a.pushi(2).jump(Opcode::B, join);
        a.bind(other);
        a.pushi(3);
        a.bind(join);
        a.simple(Opcode::Popz, DataType::Int16).simple(Opcode::Exit, DataType::Int32);
        FlowGraph::build(&a.instructions()).unwrap()
    }

    #[test]
    fn blocks_and_edges() {
        let g = diamond();
        let export = FlowGraphExport::from_graph(&g);
        let id = |addr: u32| g.block_at(addr).unwrap().0;

        let addresses: Vec<Option<u32>> = export.blocks.iter().map(|b| b.address).collect();
        assert_eq!(addresses, vec![None, Some(0), Some(2), Some(4), Some(5), Some(7)]);
        assert_eq!(export.blocks[1].stack_delta, 0);
        assert_eq!(export.blocks[2].stack_delta, 1);
        assert_eq!(export.blocks[4].stack_delta, -1);

        let edge = |from: usize, to: usize| export.edges.iter().find(|e| e.from == from && e.to == to).map(|e| e.kind);
        assert_eq!(edge(export.entry, id(0)), Some(EdgeKind::Fallthrough));
        assert_eq!(edge(id(0), id(2)), Some(EdgeKind::True));
        assert_eq!(edge(id(0), id(4)), Some(EdgeKind::False));
        assert_eq!(edge(id(2), id(5)), Some(EdgeKind::Jump));
        assert_eq!(edge(id(4), id(5)), Some(EdgeKind::Fallthrough));
        assert_eq!(edge(id(5), export.final_block), Some(EdgeKind::Exit));
        assert_eq!(export.edges.len(), 6);
    }

    #[test]
    fn dot_and_json_output() {
        let export = FlowGraphExport::from_graph(&diamond());
        let dot = export.to_dot("obj_player \"Step\"");
        assert!(dot.starts_with("digraph \"obj_player \\\"Step\\\"\" {\n"));
        assert!(dot.contains("[label=\"true\", color=green]"));
        assert!(dot.contains("00000 pushi.e 1\\l"));
        assert!(dot.ends_with("}\n"));

        let json: serde_json::Value = serde_json::from_str(&export.to_json().unwrap()).unwrap();
        assert_eq!(json["code_length"], 7);
        assert_eq!(json["blocks"][1]["address"], 0);
        assert_eq!(json["edges"][1]["kind"], "true");
    }
}
