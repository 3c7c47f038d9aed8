use std::path::PathBuf;

use clap::{Parser, Subcommand};

#[derive(Debug, Parser)]
#[command(name = "tether", version, about = "Bridge a local CLI agent to a remote operator")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Run the bridge around the wrapped agent
    Run {
        /// Config file (defaults to ./tether.toml, then ~/.config/tether/)
        #[arg(long)]
        config: Option<PathBuf>,
        /// Command injected into the agent once it starts
        initial_command: Option<String>,
    },
    /// Write a starter config file
    InitConfig {
        #[arg(long, default_value = "tether.toml")]
        path: PathBuf,
    },
    /// Verify the integrity of an audit log
    VerifyAudit {
        path: PathBuf,
        /// Hex HMAC key (defaults to TETHER_AUDIT_KEY)
        #[arg(long)]
        key: Option<String>,
    },
    /// Generate a hex-encoded signing key
    SignKey,
}
