use std::path::{Path, PathBuf};

use clap::{CommandFactory, Parser};
use serde::Deserialize;
use tracing::{debug, warn};
use tracing_subscriber::EnvFilter;

use degml_lib::{CodeUnit, Decompiler, EnumRegistry, SymbolTable, UNKNOWN_ENUM};

use crate::cli::{Cli, DecompileCommand, DecompileModeCli, GraphFormatCli, LogLevelCli, OutputArgs, TopLevel};

mod cli;

#[derive(Debug, Deserialize)]
struct Manifest {
    #[serde(default)]
    symbols: Option<PathBuf>,
    units: Vec<ManifestUnit>,
}

#[derive(Debug, Deserialize)]
struct ManifestUnit {
    name: String,
    path: PathBuf,
}

fn init_logging(level: Option<LogLevelCli>) {
    let filter = match level {
        Some(level) => EnvFilter::new(level.as_filter()),
        None => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_ansi(false)
        .with_writer(std::io::stderr)
        .init();
}

fn options(output: &OutputArgs) -> degml_lib::DecompileOptions {
    let mode = match output.mode {
        DecompileModeCli::Pseudo => degml_lib::DecompileMode::Pseudo,
        DecompileModeCli::Tree => degml_lib::DecompileMode::Tree,
        DecompileModeCli::Graph => degml_lib::DecompileMode::Graph,
    };
    let graph_format = match output.graph_format {
        GraphFormatCli::Dot => degml_lib::GraphFormat::Dot,
        GraphFormatCli::Json => degml_lib::GraphFormat::Json,
    };
    degml_lib::DecompileOptions {
        mode,
        graph_format,
        indent: output.indent,
        unknown_enums: !output.no_unknown_enums,
        declare_enums: !output.no_enum_declaration,
    }
}

fn fail(message: String) -> ! {
    eprintln!("error: {message}");
    std::process::exit(1);
}

fn load_symbols(path: Option<&Path>) -> SymbolTable {
    let Some(path) = path else {
        return SymbolTable::default();
    };
    let text = std::fs::read_to_string(path).unwrap_or_else(|e| fail(format!("failed to read {path:?}: {e}")));
    serde_json::from_str(&text).unwrap_or_else(|e| fail(format!("invalid symbol table {path:?}: {e}")))
}

fn load_unit(name: String, path: &Path) -> CodeUnit {
    let bytes = std::fs::read(path).unwrap_or_else(|e| fail(format!("failed to read {path:?}: {e}")));
    CodeUnit::from_bytes(name, &bytes).unwrap_or_else(|e| fail(format!("decode error in {path:?}: {e}")))
}

fn decompile_file(path: PathBuf, symbols: Option<PathBuf>, output: &OutputArgs) {
    let symbols = load_symbols(symbols.as_deref());
    let enums = EnumRegistry::new();
    let name = path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "main".to_string());
    let unit = load_unit(name, &path);
    let decompiler = Decompiler::new(&symbols, &enums, options(output));
    match decompiler.render_unit(&unit) {
        Ok(out) => print!("{out}"),
        Err(e) => fail(format!("decompile error: {e}")),
    }
}

fn decompile_batch(manifest_path: PathBuf, output: &OutputArgs) {
    let text = std::fs::read_to_string(&manifest_path)
        .unwrap_or_else(|e| fail(format!("failed to read {manifest_path:?}: {e}")));
    let manifest: Manifest =
        serde_json::from_str(&text).unwrap_or_else(|e| fail(format!("invalid manifest {manifest_path:?}: {e}")));
    let base = manifest_path.parent().map(Path::to_path_buf).unwrap_or_default();

    let symbols = load_symbols(manifest.symbols.map(|p| base.join(p)).as_deref());
    let units: Vec<CodeUnit> = manifest
        .units
        .into_iter()
        .map(|u| {
            let path = base.join(&u.path);
            load_unit(u.name, &path)
        })
        .collect();
    debug!(units = units.len(), "loaded manifest");

    // One shared declaration for the whole batch instead of one per unit.
    let mut opts = options(output);
    let declare = opts.declare_enums && opts.mode == degml_lib::DecompileMode::Pseudo;
    opts.declare_enums = false;

    let enums = EnumRegistry::new();
    let decompiler = Decompiler::new(&symbols, &enums, opts);
    let mut failed = 0usize;
    let mut rendered = Vec::with_capacity(units.len());
    for (unit, result) in units.iter().zip(decompiler.decompile_all(&units)) {
        match result {
            Ok(decompiled) => {
                if decompiled.has_diagnostics() {
                    warn!(unit = %unit.name, diagnostics = decompiled.diagnostics, "unit has decompiler warnings");
                }
                let text = match opts.mode {
                    degml_lib::DecompileMode::Pseudo => Ok(decompiled.render(&opts)),
                    degml_lib::DecompileMode::Tree => {
                        serde_json::to_string_pretty(&decompiled).map_err(degml_lib::DecompileError::from)
                    }
                    degml_lib::DecompileMode::Graph => decompiler.render_unit(unit),
                };
                match text {
                    Ok(text) => rendered.push((unit.name.as_str(), text)),
                    Err(e) => {
                        eprintln!("error: {}: {e}", unit.name);
                        failed += 1;
                    }
                }
            }
            Err(e) => {
                eprintln!("error: {}: {e}", unit.name);
                failed += 1;
            }
        }
    }

    let values = enums.values(UNKNOWN_ENUM);
    if declare && !values.is_empty() {
        println!("{}", degml_lib::ast::render_enum_declaration(UNKNOWN_ENUM, &values, opts.indent));
    }
    for (name, text) in rendered {
        println!("// ===== {name} =====");
        print!("{text}");
    }
    if failed > 0 {
        fail(format!("{failed} of {} units failed", units.len()));
    }
}

fn main() {
    let cli = Cli::parse();
    init_logging(cli.log_level);

    match cli.command {
        Some(TopLevel::Decompile { command }) => match command {
            DecompileCommand::File { path, symbols, output } => decompile_file(path, symbols, &output),
            DecompileCommand::Batch { manifest, output } => decompile_batch(manifest, &output),
        },
        Some(TopLevel::Completion { shell }) => {
            let mut cmd = Cli::command();
            let bin_name = cmd.get_name().to_string();
            clap_complete::generate(shell, &mut cmd, bin_name, &mut std::io::stdout());
        }
        None => {
            if let Err(e) = Cli::command().print_help() {
                fail(format!("failed to print help: {e}"));
            }
        }
    }
}
