//! Command-line surface: `echonet serve` starts the HTTP surface and ASR
//! worker (the default when no subcommand is given); the rest are
//! maintenance commands against the same database the server uses, for use
//! while the server is stopped.

use std::path::PathBuf;

use clap::{Parser, Subcommand};

#[derive(Debug, Parser)]
#[command(name = "echonet", about = "Voice-activated text event router and session manager")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Start the HTTP surface and ASR worker (default if omitted).
    Serve,
    /// Print the current listen mode, audio device, and full settings table.
    InspectState,
    /// Print all registered targets and their phrases.
    InspectRegistry,
    /// Copy the registry (targets table) out to a standalone SQLite file.
    BackupRegistry {
        /// Destination path for the backup file.
        dest: PathBuf,
    },
    /// Inspect or apply pending schema migrations without starting the server.
    MigrateDb {
        #[arg(long, conflicts_with = "migrate")]
        status: bool,
        #[arg(long, conflicts_with = "status")]
        migrate: bool,
    },
}
