//! PostgreSQL connectivity check driven only by the environment
//!
//! Reads `DATABASE_URL`, or `PGHOST`/`PGPORT`/`PGUSER`/`PGPASSWORD`/`PGDATABASE`
//! when no URL is set.

use clap::Args;
use colored::Colorize;
use dbbridge_connectors::{default_registry, BackendType, Connector, Credentials};
use tracing::info;

const IDENTITY_SQL: &str = "SELECT current_database(), current_user";

#[derive(Args)]
pub struct EnvCheckCommand {}

impl EnvCheckCommand {
    pub fn execute(self) -> anyhow::Result<()> {
        let mut connector =
            default_registry().get_connector_for(BackendType::PostgreSql, Credentials::new())?;

        let rt = tokio::runtime::Runtime::new()?;
        let result = rt.block_on(connector.execute_query(IDENTITY_SQL));

        if !result.success {
            println!(
                "{} {}",
                "✗".red().bold(),
                result.error.unwrap_or_default()
            );
            std::process::exit(1);
        }

        let row = result
            .data
            .as_ref()
            .and_then(|data| data.get(0))
            .ok_or_else(|| anyhow::anyhow!("Identity query returned no rows"))?;
        let database = row["current_database"].as_str().unwrap_or("?");
        let user = row["current_user"].as_str().unwrap_or("?");
        info!("Environment connection verified");
        println!(
            "{} Connected to database {} as {}",
            "✓".green().bold(),
            database.bold(),
            user.bold()
        );
        Ok(())
    }
}
