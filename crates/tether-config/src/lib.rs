//! Runtime configuration for tether nodes.
//!
//! Settings persist to disk as `config.ron`. Command-line flags parsed with clap
//! override whatever was loaded, and missing or unknown fields are tolerated so
//! files written by older or newer builds still load.

mod cli;
mod config;
mod error;

pub use cli::CliArgs;
pub use config::{Config, DebugConfig, NetworkConfig, default_config_dir};
pub use error::ConfigError;
