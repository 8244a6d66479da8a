//! Backend catalogue commands

use super::OutputFormat;
use clap::Args;
use colored::Colorize;
use dbbridge_connectors::{default_registry, BackendType};
use serde_json::json;

#[derive(Args)]
pub struct BackendsCommand {
    /// Output format: text or json
    #[arg(long, value_enum, default_value = "text")]
    pub output_format: OutputFormat,
}

impl BackendsCommand {
    pub fn execute(self) -> anyhow::Result<()> {
        let registry = default_registry();
        let backends = registry.backends();

        match self.output_format {
            OutputFormat::Json => {
                let entries: Vec<_> = backends
                    .iter()
                    .map(|backend| {
                        let availability = registry.availability(*backend);
                        json!({
                            "backend": backend.as_str(),
                            "name": backend.display_name(),
                            "family": backend.family(),
                            "available": availability.is_ok(),
                            "reason": availability.err(),
                        })
                    })
                    .collect();
                println!("{}", serde_json::to_string_pretty(&entries)?);
            }
            OutputFormat::Text => {
                for backend in backends {
                    let status = match registry.availability(backend) {
                        Ok(()) => "available".green().to_string(),
                        Err(reason) => format!("{} ({})", "unavailable".red(), reason),
                    };
                    println!(
                        "{} {:<22} {} {}",
                        format!("{:<16}", backend.as_str()).bold(),
                        backend.display_name(),
                        format!("{:<11}", backend.family()).dimmed(),
                        status
                    );
                }
            }
        }
        Ok(())
    }
}

#[derive(Args)]
pub struct RequirementsCommand {
    /// Backend identifier, e.g. postgresql or "Azure Cosmos DB"
    pub backend: String,

    /// Output format: text or json
    #[arg(long, value_enum, default_value = "text")]
    pub output_format: OutputFormat,
}

impl RequirementsCommand {
    pub fn execute(self) -> anyhow::Result<()> {
        let backend: BackendType = self.backend.parse()?;
        let requirements = backend.requirements();

        match self.output_format {
            OutputFormat::Json => {
                println!("{}", serde_json::to_string_pretty(&requirements)?);
            }
            OutputFormat::Text => {
                println!("{}", backend.display_name().bold());
                println!("  fields:  {}", requirements.fields.join(", "));
                if requirements.url_option {
                    if let Some(field) = requirements.url_field {
                        println!("  url:     {}", field.cyan());
                    }
                    if let Some(example) = requirements.url_example {
                        println!("  example: {}", example.dimmed());
                    }
                }
                println!("  shell:   {}", requirements.terminal_command);
            }
        }
        Ok(())
    }
}
