//! DbBridge CLI
//!
//! Resolves a backend, tests it, dumps its schema or runs one query, all
//! through the same connector contract the library exposes.

mod commands;

use clap::{Parser, Subcommand};
use commands::{
    BackendsCommand, EnvCheckCommand, QueryCommand, RequirementsCommand, SchemaCommand,
    TestCommand,
};
use tracing_subscriber::{layer::SubscriberExt, Layer};

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info", env = "DBBRIDGE_LOG_LEVEL", global = true)]
    log_level: String,

    /// Log format: compact, full
    #[arg(
        long,
        default_value = "compact",
        env = "DBBRIDGE_LOG_FORMAT",
        global = true
    )]
    log_format: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List every known backend and whether it is available in this build
    Backends(BackendsCommand),
    /// Show the credential fields a backend expects
    Requirements(RequirementsCommand),
    /// Open and close a connection to check the credentials
    Test(TestCommand),
    /// Print the backend's schema
    Schema(SchemaCommand),
    /// Run one query or JSON operation
    Query(QueryCommand),
    /// Connect to PostgreSQL using only DATABASE_URL or the PG* variables
    EnvCheck(EnvCheckCommand),
}

fn log_filter(level: &str) -> anyhow::Result<tracing_subscriber::EnvFilter> {
    // RUST_LOG gives full control when set
    if std::env::var("RUST_LOG").is_ok() {
        return tracing_subscriber::EnvFilter::try_from_default_env()
            .map_err(|e| anyhow::anyhow!("Invalid RUST_LOG environment variable: {}", e));
    }

    Ok(tracing_subscriber::EnvFilter::new(format!(
        "dbbridge={level},\
         dbbridge_cli={level},\
         dbbridge_core={level},\
         dbbridge_connectors={level},\
         dbbridge_relational={level},\
         dbbridge_nosql={level},\
         dbbridge_graph={level},\
         dbbridge_warehouse={level},\
         dbbridge_cloud={level},\
         dbbridge_timeseries={level},\
         sqlx=warn,\
         tokio_postgres=warn,\
         tiberius=warn,\
         mongodb=warn,\
         scylla=warn,\
         neo4rs=warn,\
         aws_config=warn,\
         aws_smithy_runtime=warn,\
         h2=warn,\
         tower=warn,\
         hyper=warn,\
         reqwest=warn,\
         rustls=warn",
        level = level
    )))
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let filter = log_filter(&cli.log_level)?;

    let fmt_layer = match cli.log_format.as_str() {
        "full" => tracing_subscriber::fmt::layer()
            .with_writer(std::io::stderr)
            .with_target(true)
            .with_thread_ids(false)
            .with_thread_names(false)
            .boxed(),
        _ => tracing_subscriber::fmt::layer()
            .with_writer(std::io::stderr)
            .compact()
            .with_target(false)
            .with_thread_ids(false)
            .with_thread_names(false)
            .boxed(),
    };

    let subscriber = tracing_subscriber::registry().with(filter).with(fmt_layer);
    tracing::subscriber::set_global_default(subscriber)
        .map_err(|e| anyhow::anyhow!("Failed to set global default subscriber: {}", e))?;

    match cli.command {
        Commands::Backends(cmd) => cmd.execute(),
        Commands::Requirements(cmd) => cmd.execute(),
        Commands::Test(cmd) => cmd.execute(),
        Commands::Schema(cmd) => cmd.execute(),
        Commands::Query(cmd) => cmd.execute(),
        Commands::EnvCheck(cmd) => cmd.execute(),
    }
}
