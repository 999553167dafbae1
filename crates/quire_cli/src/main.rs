//! Quire CLI: the command-line front end of the Quire build engine.
//!
//! Provides `quire run` to build every document in a project, `quire history`
//! to inspect the run ledger, `quire filters` to list the available filters,
//! and `quire gc` / `quire reset` to maintain the working directory.

#![warn(missing_docs)]

mod filters;
mod history;
mod housekeeping;
mod pipeline;
mod run;

use std::process;

use clap::{Parser, Subcommand, ValueEnum};
use quire_config::RunMode;

/// Quire, a content-addressed document build engine.
#[derive(Parser, Debug)]
#[command(name = "quire", version, about = "Quire document build engine")]
pub struct Cli {
    /// Suppress all output except errors.
    #[arg(short, long, global = true)]
    pub quiet: bool,

    /// Enable verbose (debug-level) output.
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Path to a custom `quire.toml` configuration file.
    #[arg(long, global = true)]
    pub config: Option<String>,

    /// The subcommand to run.
    #[command(subcommand)]
    pub command: Command,
}

/// Available CLI commands.
#[derive(Subcommand, Debug)]
pub enum Command {
    /// Build every document in the project.
    Run(RunArgs),
    /// Show the ledger records of a batch.
    History {
        /// Batch id to show (default: the latest batch).
        #[arg(short, long)]
        batch: Option<u64>,
    },
    /// List the registered filters.
    Filters,
    /// Remove stored artifacts the latest batch did not use.
    Gc,
    /// Delete the working directory and everything cached in it.
    Reset,
}

/// Arguments for the `quire run` subcommand.
#[derive(Parser, Debug)]
pub struct RunArgs {
    /// Number of worker threads (0 uses every available core).
    #[arg(short = 'j', long)]
    pub workers: Option<usize>,

    /// How the run reacts to a failing document.
    #[arg(short, long, value_enum)]
    pub mode: Option<ModeArg>,

    /// Build only these documents and their inputs.
    #[arg(short, long = "target", num_args = 1..)]
    pub targets: Vec<String>,
}

/// Failure handling selected on the command line.
#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
pub enum ModeArg {
    /// Stop at the first failure.
    FailFast,
    /// Skip dependents of failed documents, keep building the rest.
    Continue,
    /// Treat filter failures as warnings.
    IgnoreErrors,
}

impl From<ModeArg> for RunMode {
    fn from(mode: ModeArg) -> Self {
        match mode {
            ModeArg::FailFast => RunMode::FailFast,
            ModeArg::Continue => RunMode::Continue,
            ModeArg::IgnoreErrors => RunMode::IgnoreErrors,
        }
    }
}

/// Global settings derived from CLI flags.
pub struct GlobalArgs {
    /// Whether to suppress non-error output.
    pub quiet: bool,
    /// Whether to print verbose/debug information.
    pub verbose: bool,
    /// Optional path to a custom config file.
    pub config: Option<String>,
}

fn main() {
    let cli = Cli::parse();

    let global = GlobalArgs {
        quiet: cli.quiet,
        verbose: cli.verbose,
        config: cli.config,
    };
    pipeline::init_logging(&global);

    let result = match cli.command {
        Command::Run(ref args) => run::run(args, &global),
        Command::History { batch } => history::run(batch, &global),
        Command::Filters => filters::run(&global),
        Command::Gc => housekeeping::gc(&global),
        Command::Reset => housekeeping::reset(&global),
    };

    match result {
        Ok(code) => process::exit(code),
        Err(e) => {
            eprintln!("error: {e}");
            process::exit(1);
        }
    }
}
