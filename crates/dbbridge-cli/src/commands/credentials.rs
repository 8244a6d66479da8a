//! Credential flags shared by the connection commands

use anyhow::Context;
use clap::Args;
use dbbridge_connectors::Credentials;
use serde_json::Value;
use std::path::PathBuf;

#[derive(Args, Debug, Default)]
pub struct CredentialArgs {
    /// Credentials as a JSON object
    #[arg(long)]
    pub credentials: Option<String>,

    /// Path to a JSON file holding the credentials object
    #[arg(long)]
    pub credentials_file: Option<PathBuf>,

    /// Single credential as key=value; repeatable and applied last
    #[arg(long = "set", value_name = "KEY=VALUE")]
    pub set: Vec<String>,
}

impl CredentialArgs {
    /// File first, then inline JSON, then `--set` pairs; later sources win per key
    pub fn load(&self) -> anyhow::Result<Credentials> {
        let mut credentials = Credentials::new();

        if let Some(path) = &self.credentials_file {
            let text = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read credentials file {}", path.display()))?;
            merge(&mut credentials, parse_json(&text)?);
        }
        if let Some(text) = &self.credentials {
            merge(&mut credentials, parse_json(text)?);
        }
        for pair in &self.set {
            let (key, value) = parse_set(pair)?;
            credentials.insert(key, value);
        }
        Ok(credentials)
    }
}

fn parse_json(text: &str) -> anyhow::Result<Credentials> {
    let value: Value = serde_json::from_str(text).context("Credentials are not valid JSON")?;
    Ok(Credentials::from_value(value)?)
}

fn merge(into: &mut Credentials, from: Credentials) {
    for key in from.keys() {
        if let Some(value) = from.raw(key) {
            into.insert(key.clone(), value.clone());
        }
    }
}

fn parse_set(pair: &str) -> anyhow::Result<(String, String)> {
    let (key, value) = pair
        .split_once('=')
        .ok_or_else(|| anyhow::anyhow!("Expected KEY=VALUE, got '{}'", pair))?;
    let key = key.trim();
    if key.is_empty() {
        anyhow::bail!("Empty credential key in '{}'", pair);
    }
    Ok((key.to_string(), value.to_string()))
}
