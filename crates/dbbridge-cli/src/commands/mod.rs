pub mod backends;
pub mod connection;
pub mod credentials;
pub mod env_check;

pub use backends::{BackendsCommand, RequirementsCommand};
pub use connection::{QueryCommand, SchemaCommand, TestCommand};
pub use env_check::EnvCheckCommand;

/// Output format shared by every command
#[derive(Debug, Clone, Copy, Default, clap::ValueEnum)]
pub enum OutputFormat {
    /// Human-readable output with colors
    #[default]
    Text,
    /// JSON output for scripting
    Json,
}
