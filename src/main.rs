//! PM Hub CLI - runs and inspects the coordination hub.
//!
//! This is the main binary entry point. See the `pm_hub` library for the
//! core functionality.

use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};
use pm_hub::commands::{self, serve::ServeOptions, VERSION};

// CLI
#[derive(Parser)]
#[command(name = "pm-hub")]
#[command(version = VERSION)]
#[command(about = "Coordination hub for coding-agent workers")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the hub in the foreground
    Serve {
        /// First port to try (0 picks a free port)
        #[arg(long)]
        port: Option<u16>,
        /// Project root holding .pm-hub/
        #[arg(long, default_value = ".")]
        project_root: PathBuf,
        /// Directory of session records
        #[arg(long)]
        sessions_dir: Option<PathBuf>,
        /// Durable bus log (JSON lines)
        #[arg(long)]
        bus: Option<PathBuf>,
        /// Task-graph tool binary (empty disables task routes)
        #[arg(long)]
        task_tool: Option<String>,
    },
    /// Show the status of a running hub
    Status {
        /// Project root holding .pm-hub/
        #[arg(long, default_value = ".")]
        project_root: PathBuf,
    },
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .format_timestamp_secs()
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Serve {
            port,
            project_root,
            sessions_dir,
            bus,
            task_tool,
        } => commands::serve::run(ServeOptions {
            project_root,
            port,
            sessions_dir,
            bus,
            task_tool,
        }),
        Commands::Status { project_root } => commands::status::run(&project_root),
    }
}
