//! # Hierarchy Manager CLI (`hmgr`)
//!
//! ## Usage
//!
//! ```bash
//! hmgr --config ./config/hmgr.toml <command>
//! ```
//!
//! | Command | Description |
//! |---------|-------------|
//! | `hmgr init` | Create the queue database and run schema migrations |
//! | `hmgr check <file> --type <t>` | Resolve and validate staged places |
//! | `hmgr schedule <action> --type <t>` | Enqueue a move, merge or delete |
//! | `hmgr worker` | Consume the mutation queue |
//! | `hmgr jobs` | List jobs, or show one job's log |
//! | `hmgr completions <shell>` | Print a shell completion script |
//!
//! Log verbosity follows `RUST_LOG` (default `info,hierarchy_manager=debug`).

use std::io;
use std::path::PathBuf;

use clap::{CommandFactory, Parser, Subcommand, ValueEnum};
use clap_complete::Shell;
use tracing_subscriber::EnvFilter;

use hierarchy_core::manage::{HierarchyAction, MUTATION_QUEUE};
use hierarchy_manager::{check, config, jobs, migrate, schedule, worker};

/// Hierarchy Manager: check, move, merge and delete places on a
/// community health platform instance.
///
/// All commands accept a `--config` flag pointing to a TOML configuration
/// file. See `config/hmgr.example.toml` for a full example.
#[derive(Parser)]
#[command(name = "hmgr", version, about = "Manage the place hierarchy of a health platform instance")]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/hmgr.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize the queue database.
    ///
    /// Idempotent; running it again is safe.
    Init,

    /// Resolve, validate and scan a JSON file of staged places.
    ///
    /// Logs in to the configured instance and prints, per place, how each
    /// hierarchy input resolved plus any errors and warnings.
    Check {
        /// JSON array of place objects.
        file: PathBuf,

        /// Contact type of the staged places.
        #[arg(long = "type")]
        contact_type: String,
    },

    /// Validate a hierarchy change and enqueue it for the worker.
    Schedule {
        action: ActionArg,

        /// Contact type of the place being changed.
        #[arg(long = "type")]
        contact_type: String,

        /// Source hierarchy input, e.g. `replacement=Kitui East` or `SUBCOUNTY=Kitui`.
        #[arg(long = "source", value_parser = parse_key_val)]
        source: Vec<(String, String)>,

        /// Destination hierarchy input (move and merge only).
        #[arg(long = "destination", value_parser = parse_key_val)]
        destination: Vec<(String, String)>,
    },

    /// Run the mutation worker.
    ///
    /// Stops after the current job on Ctrl-C.
    Worker {
        #[arg(long, default_value = MUTATION_QUEUE)]
        queue: String,

        /// Handle every due job, then exit.
        #[arg(long)]
        once: bool,
    },

    /// List the jobs of a queue.
    Jobs {
        #[arg(long, default_value = MUTATION_QUEUE)]
        queue: String,

        /// Print the log of this job instead.
        #[arg(long)]
        logs: Option<String>,
    },

    /// Print a shell completion script.
    Completions { shell: Shell },
}

#[derive(Clone, Copy, ValueEnum)]
enum ActionArg {
    Move,
    Merge,
    Delete,
}

impl From<ActionArg> for HierarchyAction {
    fn from(action: ActionArg) -> Self {
        match action {
            ActionArg::Move => HierarchyAction::Move,
            ActionArg::Merge => HierarchyAction::Merge,
            ActionArg::Delete => HierarchyAction::Delete,
        }
    }
}

/// Parse a `key=value` pair for `--source` and `--destination`.
fn parse_key_val(s: &str) -> Result<(String, String), String> {
    let pos = s
        .find('=')
        .ok_or_else(|| format!("invalid KEY=VALUE: no '=' found in '{}'", s))?;
    Ok((s[..pos].to_string(), s[pos + 1..].to_string()))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,hierarchy_manager=debug")),
        )
        .with_writer(io::stderr)
        .init();

    let load = || config::load_config(&cli.config);

    match cli.command {
        Commands::Init => {
            migrate::run_migrations(&load()?).await?;
            println!("Database initialized successfully.");
        }
        Commands::Check { file, contact_type } => {
            check::run_check(&load()?, &file, &contact_type).await?;
        }
        Commands::Schedule {
            action,
            contact_type,
            source,
            destination,
        } => {
            schedule::run_schedule(&load()?, action.into(), &contact_type, source, destination)
                .await?;
        }
        Commands::Worker { queue, once } => {
            worker::run_worker(&load()?, &queue, once).await?;
        }
        Commands::Jobs { queue, logs } => {
            jobs::run_jobs(&load()?, &queue, logs.as_deref()).await?;
        }
        // needs no config file
        Commands::Completions { shell } => {
            clap_complete::generate(shell, &mut Cli::command(), "hmgr", &mut io::stdout());
        }
    }

    Ok(())
}
