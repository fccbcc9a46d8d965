use std::path::PathBuf;

use clap::{Parser, Subcommand, ValueEnum, builder::{Styles, styling::{AnsiColor, Effects}}, crate_description, crate_version};
use clap_complete::Shell;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum DecompileModeCli {
    Pseudo,
    Tree,
    Graph,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum GraphFormatCli {
    Dot,
    Json,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum LogLevelCli {
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

impl LogLevelCli {
    pub fn as_filter(self) -> &'static str {
        match self {
            LogLevelCli::Error => "error",
            LogLevelCli::Warn => "warn",
            LogLevelCli::Info => "info",
            LogLevelCli::Debug => "debug",
            LogLevelCli::Trace => "trace",
        }
    }
}

#[derive(Parser)]
#[command(name = "degml",
    version = crate_version!(),
    about = crate_description!(),
    styles = Styles::styled()
        .header(AnsiColor::BrightGreen.on_default() | Effects::BOLD | Effects::UNDERLINE)
        .usage(AnsiColor::Cyan.on_default() | Effects::BOLD)
        .literal(AnsiColor::BrightCyan.on_default() | Effects::BOLD)
        .placeholder(AnsiColor::Cyan.on_default()))]
pub struct Cli {
    /// Log verbosity on stderr (overrides RUST_LOG)
    #[arg(long, global = true, value_enum)]
    pub log_level: Option<LogLevelCli>,

    #[command(subcommand)]
    pub command: Option<TopLevel>,
}

#[derive(Subcommand)]
pub enum TopLevel {
    /// Decompiles GameMaker bytecode
    Decompile {
        #[command(subcommand)]
        command: DecompileCommand,
    },
    /// Generate shell completion
    Completion {
        #[arg(value_enum)]
        shell: Shell,
    },
}

#[derive(clap::Args, Debug, Clone)]
pub struct OutputArgs {
    /// Output mode
    #[arg(long, value_enum, default_value_t = DecompileModeCli::Pseudo)]
    pub mode: DecompileModeCli,

    /// Flow graph format used by `--mode graph`
    #[arg(long, value_enum, default_value_t = GraphFormatCli::Dot)]
    pub graph_format: GraphFormatCli,

    /// Spaces per indentation level
    #[arg(long, default_value_t = 4)]
    pub indent: usize,

    /// Render 64-bit constants as plain numbers instead of UnknownEnum members
    #[arg(long, default_value_t = false)]
    pub no_unknown_enums: bool,

    /// Do not prepend the UnknownEnum declaration
    #[arg(long, default_value_t = false)]
    pub no_enum_declaration: bool,
}

#[derive(Subcommand)]
pub enum DecompileCommand {
    /// Decompiles one code unit (raw little-endian instruction words)
    File {
        /// Path to the code unit
        path: PathBuf,

        /// JSON symbol table with `functions`, `variables` and `strings` arrays
        #[arg(long)]
        symbols: Option<PathBuf>,

        #[command(flatten)]
        output: OutputArgs,
    },
    /// Decompiles every unit listed in a JSON manifest, in parallel
    Batch {
        /// Manifest with an optional `symbols` path and a `units` list of
        /// `{ "name", "path" }` entries; paths are relative to the manifest
        manifest: PathBuf,

        #[command(flatten)]
        output: OutputArgs,
    },
}

#[cfg(test)]
mod tests {
    use clap::CommandFactory;

    use super::*;

    #[test]
    fn command_is_named_after_the_binary() {
        let cmd = Cli::command();
        cmd.clone().debug_assert();
        assert_eq!(cmd.get_name(), "degml");
    }

    #[test]
    fn parses_nested_decompile_file() {
        let cli = Cli::try_parse_from(["degml", "decompile", "file", "scr.bin", "--mode", "graph"]).unwrap();
        match cli.command {
            Some(TopLevel::Decompile { command: DecompileCommand::File { path, output, .. } }) => {
                assert_eq!(path, PathBuf::from("scr.bin"));
                assert_eq!(output.mode, DecompileModeCli::Graph);
            }
            _ => panic!("expected decompile file"),
        }
    }
}
