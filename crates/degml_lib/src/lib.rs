use std::collections::BTreeSet;

use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info_span};

mod tables {
    use serde::{Deserialize, Serialize};

    include!(concat!(env!("OUT_DIR"), "/gml_tables.rs"));
}

pub mod ast;
pub mod dominators;
pub mod export;
pub mod flow;
pub mod instruction;
pub mod names;
pub mod simulate;
pub mod structure;

pub use ast::{Expression, Statement};
pub use dominators::{Dominators, NaturalLoops};
pub use export::FlowGraphExport;
pub use flow::{Block, BlockId, FlowGraph};
pub use instruction::{decode_bytes, decode_words, DataType, Instruction, Operand};
pub use names::{EnumRegistry, NameResolver, SymbolTable, UNKNOWN_ENUM};
pub use tables::{OpFmt, Opcode};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DecompileMode {
    Pseudo,
    Tree,
    Graph,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum GraphFormat {
    Dot,
    Json,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DecompileOptions {
    pub mode: DecompileMode,
    pub graph_format: GraphFormat,
    pub indent: usize,
    /// Render 64-bit constants that fit in 32 bits as `UnknownEnum.Value_N`.
    pub unknown_enums: bool,
    /// Prepend the `enum UnknownEnum { .. }` declaration to each rendered unit.
    pub declare_enums: bool,
}

impl Default for DecompileOptions {
    fn default() -> Self {
        Self {
            mode: DecompileMode::Pseudo,
            graph_format: GraphFormat::Dot,
            indent: 4,
            unknown_enums: true,
            declare_enums: true,
        }
    }
}

#[derive(Debug, Error)]
pub enum DecompileError {
    #[error("code length {0} is not a multiple of the 4-byte instruction word")]
    UnalignedCode(usize),

    #[error("invalid opcode: 0x{0:02x}")]
    InvalidOpcode(u8),

    #[error("truncated instruction at address {address} (needs {size} words, {remaining} remaining)")]
    TruncatedInstruction { address: u32, size: u32, remaining: u32 },

    #[error("invalid data type 0x{value:x} at address {address}")]
    InvalidDataType { address: u32, value: u8 },

    #[error("invalid comparison kind {value} at address {address}")]
    InvalidComparison { address: u32, value: u8 },

    #[error("invalid variable addressing mode 0x{value:02x} at address {address}")]
    InvalidVariableMode { address: u32, value: u8 },

    #[error("jump at address {address} targets {target}, outside of code length {length}")]
    JumpOutOfRange { address: u32, target: i64, length: u32 },

    #[error("jump at address {address} targets {target}, which is not an instruction boundary")]
    MisalignedJump { address: u32, target: u32 },

    #[error("stack underflow at address {address} ({opcode})")]
    StackUnderflow { address: u32, opcode: &'static str },

    #[error("unsupported pop form at address {address} (pop.{type1})")]
    UnsupportedPop { address: u32, type1: char },

    #[error("unsupported operand for {opcode} at address {address}")]
    UnsupportedOperand { address: u32, opcode: &'static str },

    #[error("unresolved function reference {0}")]
    UnresolvedFunction(u32),

    #[error("unresolved variable reference {0}")]
    UnresolvedVariable(u32),

    #[error("unresolved string reference {0}")]
    UnresolvedString(u32),

    #[error("json: {0}")]
    Json(#[from] serde_json::Error),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CodeUnit {
    pub name: String,
    pub instructions: Vec<Instruction>,
}

impl CodeUnit {
    pub fn from_bytes(name: impl Into<String>, bytes: &[u8]) -> Result<Self, DecompileError> {
        Ok(Self {
            name: name.into(),
            instructions: decode_bytes(bytes)?,
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DecompiledUnit {
    pub name: String,
    pub statements: Vec<Statement>,
    /// Number of diagnostic statements embedded in `statements`.
    pub diagnostics: usize,
    pub temp_vars: usize,
    pub enum_values: BTreeSet<i64>,
}

impl DecompiledUnit {
    pub fn has_diagnostics(&self) -> bool {
        self.diagnostics > 0
    }

    pub fn render(&self, options: &DecompileOptions) -> String {
        let mut out = String::new();
        if options.declare_enums && !self.enum_values.is_empty() {
            out.push_str(&ast::render_enum_declaration(UNKNOWN_ENUM, &self.enum_values, options.indent));
            out.push('\n');
        }
        out.push_str(&ast::Renderer::new(options.indent).render(&self.statements));
        out
    }
}

pub struct Decompiler<'a> {
    resolver: &'a dyn NameResolver,
    enums: &'a EnumRegistry,
    options: DecompileOptions,
}

impl<'a> Decompiler<'a> {
    pub fn new(resolver: &'a dyn NameResolver, enums: &'a EnumRegistry, options: DecompileOptions) -> Self {
        Self { resolver, enums, options }
    }

    pub fn options(&self) -> &DecompileOptions {
        &self.options
    }

    pub fn decompile_unit(&self, unit: &CodeUnit) -> Result<DecompiledUnit, DecompileError> {
        let _span = info_span!("decompile", unit = %unit.name).entered();

        let mut graph = FlowGraph::build(&unit.instructions)?;
        debug!(blocks = graph.len(), "built flow graph");

        let mut sim = simulate::Simulator::new(self.resolver, self.enums, self.options.unknown_enums);
        sim.run(&mut graph)?;

        let dominators = Dominators::compute(&graph);
        let loops = NaturalLoops::compute(&graph, &dominators);
        debug!(loops = loops.len(), "analyzed loops");

        let mut statements = structure::synthesize(&graph, &dominators, &loops);
        let (temps, enum_values) = sim.finish();
        let temp_vars = temps.canonicalize(&mut statements);
        let diagnostics = ast::count_diagnostics(&statements);
        debug!(temp_vars, diagnostics, "decompiled");

        Ok(DecompiledUnit {
            name: unit.name.clone(),
            statements,
            diagnostics,
            temp_vars,
            enum_values,
        })
    }

    /// Decompiles independent units in parallel. Results keep the input order.
    pub fn decompile_all(&self, units: &[CodeUnit]) -> Vec<Result<DecompiledUnit, DecompileError>> {
        units.par_iter().map(|unit| self.decompile_unit(unit)).collect()
    }

    pub fn flow_graph(&self, unit: &CodeUnit) -> Result<FlowGraphExport, DecompileError> {
        let graph = FlowGraph::build(&unit.instructions)?;
        Ok(FlowGraphExport::from_graph(&graph))
    }

    pub fn render_unit(&self, unit: &CodeUnit) -> Result<String, DecompileError> {
        match self.options.mode {
            DecompileMode::Pseudo => Ok(self.decompile_unit(unit)?.render(&self.options)),
            DecompileMode::Tree => {
                let decompiled = self.decompile_unit(unit)?;
                Ok(serde_json::to_string_pretty(&decompiled)?)
            }
            DecompileMode::Graph => {
                let export = self.flow_graph(unit)?;
                match self.options.graph_format {
                    GraphFormat::Dot => Ok(export.to_dot(&unit.name)),
                    GraphFormat::Json => export.to_json(),
                }
            }
        }
    }
}

pub fn decompile_with_options(
    bytecode: &[u8],
    symbols: &SymbolTable,
    options: DecompileOptions,
) -> Result<String, DecompileError> {
    let enums = EnumRegistry::new();
    let unit = CodeUnit::from_bytes("main", bytecode)?;
    Decompiler::new(symbols, &enums, options).render_unit(&unit)
}

pub fn decompile(bytecode: &[u8], symbols: &SymbolTable) -> Result<String, DecompileError> {
    decompile_with_options(bytecode, symbols, DecompileOptions::default())
}
