//! Commands that resolve a connector and talk to the backend

use super::credentials::CredentialArgs;
use super::OutputFormat;
use anyhow::Context;
use clap::Args;
use colored::Colorize;
use dbbridge_connectors::{default_registry, normalize, Connector};
use serde_json::json;
use std::path::PathBuf;
use tracing::debug;

fn resolve(backend: &str, credentials: &CredentialArgs) -> anyhow::Result<Box<dyn Connector>> {
    let credentials = credentials.load()?;
    debug!("Resolving connector for {} ({:?})", backend, credentials);
    Ok(default_registry().get_connector(backend, credentials)?)
}

#[derive(Args)]
pub struct TestCommand {
    /// Backend identifier, e.g. postgresql, mongodb, "Azure Cosmos DB"
    pub backend: String,

    #[command(flatten)]
    pub credentials: CredentialArgs,

    /// Output format: text or json
    #[arg(long, value_enum, default_value = "text")]
    pub output_format: OutputFormat,
}

impl TestCommand {
    pub fn execute(self) -> anyhow::Result<()> {
        let rt = tokio::runtime::Runtime::new()?;
        let (ok, message) = match resolve(&self.backend, &self.credentials) {
            Ok(mut connector) => rt.block_on(connector.test_connection()),
            Err(e) => (false, format!("Error connecting to {}: {}", self.backend, e)),
        };

        match self.output_format {
            OutputFormat::Json => {
                println!(
                    "{}",
                    serde_json::to_string_pretty(&json!({ "success": ok, "message": message }))?
                );
            }
            OutputFormat::Text if ok => println!("{} {}", "✓".green().bold(), message),
            OutputFormat::Text => println!("{} {}", "✗".red().bold(), message),
        }

        if !ok {
            std::process::exit(1);
        }
        Ok(())
    }
}

#[derive(Args)]
pub struct SchemaCommand {
    /// Backend identifier
    pub backend: String,

    #[command(flatten)]
    pub credentials: CredentialArgs,

    /// Print the explorer tree instead of the backend's raw schema
    #[arg(long)]
    pub normalized: bool,
}

impl SchemaCommand {
    pub fn execute(self) -> anyhow::Result<()> {
        let mut connector = resolve(&self.backend, &self.credentials)?;
        let rt = tokio::runtime::Runtime::new()?;
        let raw = rt.block_on(connector.get_schema());

        let output = if self.normalized {
            serde_json::to_value(normalize(&self.backend, &raw))?
        } else {
            raw
        };
        println!("{}", serde_json::to_string_pretty(&output)?);

        if output.get("error").is_some_and(|e| !e.is_null()) {
            std::process::exit(1);
        }
        Ok(())
    }
}

#[derive(Args)]
pub struct QueryCommand {
    /// Backend identifier
    pub backend: String,

    #[command(flatten)]
    pub credentials: CredentialArgs,

    /// SQL text, or a JSON operation for document, graph and HTTP backends
    #[arg(long, conflicts_with = "query_file")]
    pub query: Option<String>,

    /// Read the query from a file
    #[arg(long)]
    pub query_file: Option<PathBuf>,
}

impl QueryCommand {
    fn query_text(&self) -> anyhow::Result<String> {
        match (&self.query, &self.query_file) {
            (Some(query), _) => Ok(query.clone()),
            (None, Some(path)) => std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read query file {}", path.display())),
            (None, None) => anyhow::bail!("One of --query or --query-file is required"),
        }
    }

    pub fn execute(self) -> anyhow::Result<()> {
        let query = self.query_text()?;
        let mut connector = resolve(&self.backend, &self.credentials)?;

        let rt = tokio::runtime::Runtime::new()?;
        let result = rt.block_on(connector.execute_query(&query));
        println!("{}", serde_json::to_string_pretty(&result)?);

        if !result.success {
            std::process::exit(1);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn query_command(query: Option<&str>, query_file: Option<PathBuf>) -> QueryCommand {
        QueryCommand {
            backend: "sqlite".to_string(),
            credentials: CredentialArgs::default(),
            query: query.map(str::to_string),
            query_file,
        }
    }

    #[test]
    fn test_query_text_sources() {
        assert_eq!(
            query_command(Some("SELECT 1"), None).query_text().unwrap(),
            "SELECT 1"
        );

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("op.json");
        std::fs::write(&path, r#"{"operation": "find", "collection": "users"}"#).unwrap();
        assert!(query_command(None, Some(path))
            .query_text()
            .unwrap()
            .contains("\"find\""));

        assert!(query_command(None, None).query_text().is_err());
    }

    #[test]
    fn test_unknown_backend_is_reported() {
        let err = resolve("nosuchdb", &CredentialArgs::default())
            .err()
            .unwrap();
        assert_eq!(err.to_string(), "Unsupported database type: nosuchdb");
    }
}
