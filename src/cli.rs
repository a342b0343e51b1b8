use std::path::PathBuf;

use clap::{Parser, Subcommand, ValueEnum};

#[derive(Parser, Debug)]
#[command(
    name = "crew",
    about = "Parallel agent scheduling for shared task boards",
    version
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,

    /// Verbosity level (-v, -vv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Repository root (or any path inside it)
    #[arg(long, global = true)]
    pub repo: Option<PathBuf>,

    /// State directory override
    #[arg(long, global = true)]
    pub state_dir: Option<String>,

    /// Config file override
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Partition TODO tasks into READY and EXCLUDED
    Ready {
        /// Audit label recorded in the output
        #[arg(long, default_value = "manual")]
        trigger: String,

        /// Maximum tasks to mark ready (0 = unlimited)
        #[arg(long)]
        max_start: Option<usize>,

        #[arg(long, value_enum, default_value = "json")]
        format: DataFormat,
    },

    /// Reconcile liveness and lock files into worker records
    Inventory {
        #[arg(long, value_enum, default_value = "json")]
        format: DataFormat,
    },

    /// Unified snapshot: scheduler, runtime, coordination, board, updates
    Status {
        /// Audit label recorded in the output
        #[arg(long, default_value = "manual")]
        trigger: String,

        /// Maximum tasks to mark ready (0 = unlimited)
        #[arg(long)]
        max_start: Option<usize>,

        #[arg(long, value_enum, default_value = "text")]
        format: StatusFormat,
    },

    /// Select worker records for teardown tooling
    #[command(subcommand)]
    Select(SelectCommand),

    /// Normalize an agent session's event log or terminal capture
    Session {
        /// JSONL event log (authoritative when parseable)
        #[arg(long)]
        log: Option<PathBuf>,

        /// Raw terminal capture (fallback)
        #[arg(long)]
        capture: Option<PathBuf>,

        /// Maximum blocks in the rendered view
        #[arg(long, default_value_t = 12)]
        max_blocks: usize,

        /// Maximum transcript lines in the fallback view
        #[arg(long, default_value_t = 260)]
        max_lines: usize,

        #[arg(long, value_enum, default_value = "markdown")]
        format: SessionFormat,
    },

    /// Print the resolved invocation context
    Paths {
        #[arg(long, value_enum, default_value = "json")]
        format: PathsFormat,
    },

    /// Generate shell completions
    Completions {
        #[arg(value_enum)]
        shell: CompletionShell,
    },
}

#[derive(Subcommand, Debug)]
pub enum SelectCommand {
    /// Workers matching a stop selector (exactly one of --task/--owner/--all)
    Stop {
        /// Select by task id
        #[arg(long)]
        task: Option<String>,

        /// Select by owner display name
        #[arg(long)]
        owner: Option<String>,

        /// Select every worker
        #[arg(long)]
        all: bool,

        #[arg(long, value_enum, default_value = "json")]
        format: DataFormat,
    },

    /// Workers whose on-disk evidence has gone stale
    Stale {
        #[arg(long, value_enum, default_value = "json")]
        format: DataFormat,
    },
}

#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataFormat {
    Json,
    Tsv,
}

#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusFormat {
    Text,
    Json,
}

#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionFormat {
    Markdown,
    Json,
}

#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum PathsFormat {
    Json,
    Env,
}

#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompletionShell {
    Bash,
    Zsh,
    Fish,
}
