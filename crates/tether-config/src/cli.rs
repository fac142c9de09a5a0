//! Command-line overrides shared by every tether node.

use std::path::PathBuf;

use clap::Parser;

use crate::Config;

/// Tether node command-line arguments.
///
/// CLI values override settings loaded from `config.ron`.
#[derive(Parser, Debug, Default, Clone)]
#[command(name = "tether", about = "Tether replication node")]
pub struct CliArgs {
    /// Server address to connect to.
    #[arg(long)]
    pub server: Option<String>,

    /// Server port.
    #[arg(long)]
    pub port: Option<u16>,

    /// Maximum concurrent connections (server only).
    #[arg(long)]
    pub max_connections: Option<u32>,

    /// Session ticks per second.
    #[arg(long)]
    pub tick_rate: Option<u32>,

    /// Log level (error, warn, info, debug, trace) or a full filter directive.
    #[arg(long)]
    pub log_level: Option<String>,

    /// Path to config directory (overrides default location).
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Seal reliable packets to the recipient's public key.
    #[arg(long)]
    pub encrypt: bool,
}

impl Config {
    /// Apply CLI overrides to a loaded config.
    pub fn apply_cli_overrides(&mut self, args: &CliArgs) {
        if let Some(ref addr) = args.server {
            self.network.server_address = addr.clone();
        }
        if let Some(port) = args.port {
            self.network.server_port = port;
        }
        if let Some(max) = args.max_connections {
            self.network.max_connections = max;
        }
        if let Some(rate) = args.tick_rate {
            self.network.tick_rate = rate.max(1);
        }
        if let Some(ref level) = args.log_level {
            self.debug.log_level = level.clone();
        }
        if args.encrypt {
            self.network.encrypt_reliable = true;
        }
    }
}
