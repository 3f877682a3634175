// CLI subcommand dispatch.

use clap::Subcommand;

pub mod config;
pub mod index;

#[derive(Subcommand)]
pub enum Command {
    /// Inspect or clear the local annotation index
    #[command(subcommand)]
    Index(index::IndexCommand),
    /// Show or create the client configuration
    #[command(subcommand)]
    Config(config::ConfigCommand),
}

impl Command {
    /// Whether `--json` was passed, for formatting errors.
    pub fn json_requested(&self) -> bool {
        match self {
            Self::Index(cmd) => cmd.json_requested(),
            Self::Config(cmd) => cmd.json_requested(),
        }
    }
}

pub fn run(cmd: Command) -> anyhow::Result<()> {
    match cmd {
        Command::Index(cmd) => index::run(cmd),
        Command::Config(cmd) => config::run(cmd),
    }
}
