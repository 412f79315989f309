use clap::{Parser, Subcommand};

/// mdukuzi: AI chat backend with a provider fallback chain
#[derive(Parser)]
#[command(name = "mdukuzi", version, about)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Start the HTTP server
    Serve {
        /// Port to bind (defaults to PORT)
        #[arg(short, long)]
        port: Option<u16>,
    },

    /// Apply pending database migrations and exit
    Migrate,

    /// Inspect provider usage records
    Usage {
        #[command(subcommand)]
        command: UsageCommands,
    },
}

#[derive(Subcommand)]
pub enum UsageCommands {
    /// Per-provider totals over the last N days
    Summary {
        #[arg(long, default_value = "30")]
        days: i64,
    },
    /// Most recent attempts, newest first
    Recent {
        #[arg(long, default_value = "20")]
        limit: i64,
    },
}
