//! Credential resolution
//!
//! Connection parameters come from three places, in this order:
//!
//! 1. A full connection string in the credentials map (`connection_string` or a
//!    backend-specific alias). When present it bypasses field resolution entirely.
//! 2. Individual fields in the credentials map (first matching alias wins).
//! 3. A fixed per-field environment variable, then a documented default.
//!
//! When the caller supplies none of a backend's fields, a connection-string
//! environment variable such as `DATABASE_URL` is consulted before the per-field
//! variables. Every fallback is logged; values never are.

use crate::backend::BackendType;
use crate::error::{ConnectorError, Result};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::str::FromStr;
use tracing::info;

/// Source of environment variables
///
/// Connectors never read `std::env` directly so tests can supply a map instead.
pub trait EnvSource: Send + Sync {
    fn var(&self, key: &str) -> Option<String>;
}

/// The real process environment
#[derive(Debug, Default, Clone, Copy)]
pub struct ProcessEnv;

impl EnvSource for ProcessEnv {
    fn var(&self, key: &str) -> Option<String> {
        std::env::var(key).ok().filter(|v| !v.trim().is_empty())
    }
}

impl EnvSource for HashMap<String, String> {
    fn var(&self, key: &str) -> Option<String> {
        self.get(key).filter(|v| !v.trim().is_empty()).cloned()
    }
}

/// Caller-supplied credentials for one connection attempt
///
/// Values may be strings, numbers or booleans. They are always read back in
/// their string form; empty strings and nulls count as absent.
#[derive(Clone, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Credentials(Map<String, Value>);

impl Credentials {
    pub fn new() -> Self {
        Self(Map::new())
    }

    /// Build credentials from a JSON value. `null` yields an empty map.
    pub fn from_value(value: Value) -> Result<Self> {
        match value {
            Value::Object(map) => Ok(Self(map)),
            Value::Null => Ok(Self::new()),
            other => Err(ConnectorError::invalid_request(format!(
                "Credentials must be a JSON object, got {}",
                json_type_name(&other)
            ))),
        }
    }

    pub fn with(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.insert(key, value);
        self
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<Value>) {
        self.0.insert(key.into(), value.into());
    }

    /// Raw JSON value for a key
    pub fn raw(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    /// String form of a value, `None` for missing, null, empty or structured values
    pub fn get(&self, key: &str) -> Option<String> {
        match self.0.get(key)? {
            Value::String(s) if s.trim().is_empty() => None,
            Value::String(s) => Some(s.clone()),
            Value::Number(n) => Some(n.to_string()),
            Value::Bool(b) => Some(b.to_string()),
            _ => None,
        }
    }

    /// First present key among `keys`, with its value
    pub fn first_of(&self, keys: &[&'static str]) -> Option<(&'static str, String)> {
        keys.iter()
            .find_map(|key| self.get(key).map(|value| (*key, value)))
    }

    pub fn connection_string(&self) -> Option<String> {
        self.get("connection_string")
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn keys(&self) -> impl Iterator<Item = &String> {
        self.0.keys()
    }
}

impl From<Map<String, Value>> for Credentials {
    fn from(map: Map<String, Value>) -> Self {
        Self(map)
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut map = f.debug_map();
        for (key, value) in &self.0 {
            if is_secret_key(key) {
                map.entry(key, &"***");
            } else {
                map.entry(key, value);
            }
        }
        map.finish()
    }
}

/// How a connection-string option feeds into resolution
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UrlTarget {
    /// The string is a complete connection URL/DSN; fields are ignored
    Complete,
    /// The string only supplies the named field (e.g. an endpoint)
    Field(&'static str),
}

/// Connection-string option of a backend
#[derive(Debug, Clone, Copy)]
pub struct UrlSpec {
    pub keys: &'static [&'static str],
    pub env: Option<&'static str>,
    pub target: UrlTarget,
}

impl UrlSpec {
    pub const fn complete(keys: &'static [&'static str]) -> Self {
        Self {
            keys,
            env: None,
            target: UrlTarget::Complete,
        }
    }

    pub const fn field(field: &'static str, keys: &'static [&'static str]) -> Self {
        Self {
            keys,
            env: None,
            target: UrlTarget::Field(field),
        }
    }

    pub const fn env(self, var: &'static str) -> Self {
        Self {
            env: Some(var),
            ..self
        }
    }
}

/// One credential field with its fallbacks
#[derive(Debug, Clone, Copy)]
pub struct FieldSpec {
    pub name: &'static str,
    pub aliases: &'static [&'static str],
    pub env: Option<&'static str>,
    pub default: Option<&'static str>,
    pub required: bool,
    pub secret: bool,
}

impl FieldSpec {
    pub const fn optional(name: &'static str) -> Self {
        Self {
            name,
            aliases: &[],
            env: None,
            default: None,
            required: false,
            secret: false,
        }
    }

    pub const fn required(name: &'static str) -> Self {
        Self {
            required: true,
            ..Self::optional(name)
        }
    }

    pub const fn aliases(self, aliases: &'static [&'static str]) -> Self {
        Self { aliases, ..self }
    }

    pub const fn env(self, var: &'static str) -> Self {
        Self {
            env: Some(var),
            ..self
        }
    }

    pub const fn default_value(self, value: &'static str) -> Self {
        Self {
            default: Some(value),
            ..self
        }
    }

    pub const fn secret(self) -> Self {
        Self {
            secret: true,
            ..self
        }
    }

    fn explicit(&self, credentials: &Credentials) -> Option<String> {
        credentials
            .get(self.name)
            .or_else(|| credentials.first_of(self.aliases).map(|(_, v)| v))
    }
}

/// Credential contract of one backend
#[derive(Debug, Clone, Copy)]
pub struct CredentialSpec {
    pub backend: BackendType,
    pub url: Option<UrlSpec>,
    pub fields: &'static [FieldSpec],
}

impl CredentialSpec {
    /// Resolve final connection parameters
    pub fn resolve(&self, credentials: &Credentials, env: &dyn EnvSource) -> Result<ResolvedParams> {
        let backend = self.backend.display_name();
        let secrets: Vec<&'static str> = self
            .fields
            .iter()
            .filter(|f| f.secret)
            .map(|f| f.name)
            .collect();
        let mut params = ResolvedParams::new(self.backend, secrets);

        let explicit_fields = self
            .fields
            .iter()
            .any(|field| field.explicit(credentials).is_some());

        if let Some(url) = &self.url {
            match (url.target, credentials.first_of(url.keys)) {
                (UrlTarget::Complete, Some((key, value))) => {
                    if explicit_fields {
                        info!(
                            "Using provided {} for {}; individual credential fields are ignored",
                            key, backend
                        );
                    } else {
                        info!("Using provided connection string for {}", backend);
                    }
                    params.url = Some(value);
                    return Ok(params);
                }
                (UrlTarget::Field(field), Some((key, value))) => {
                    info!("Using provided {} as {} for {}", key, field, backend);
                    params.values.insert(field, value);
                }
                (target, None) if !explicit_fields => {
                    if let Some((var, value)) = url.env.and_then(|var| env.var(var).map(|v| (var, v)))
                    {
                        info!("Using {} from environment variables", var);
                        match target {
                            UrlTarget::Complete => {
                                params.url = Some(value);
                                return Ok(params);
                            }
                            UrlTarget::Field(field) => {
                                params.values.insert(field, value);
                            }
                        }
                    }
                }
                _ => {}
            }
        }

        let mut missing = Vec::new();
        for field in self.fields {
            if params.values.contains_key(field.name) {
                continue;
            }

            if let Some(value) = field.explicit(credentials) {
                params.values.insert(field.name, value);
                continue;
            }

            if let Some(var) = field.env {
                if let Some(value) = env.var(var) {
                    info!("Using {} environment variable for {}", var, field.name);
                    params.values.insert(field.name, value);
                    continue;
                }
            }

            if let Some(default) = field.default {
                info!("Using default {} for {}", field.name, backend);
                params.values.insert(field.name, default.to_string());
                continue;
            }

            if field.required {
                missing.push(field.name.to_string());
            }
        }

        if !missing.is_empty() {
            return Err(ConnectorError::missing_credential(backend, missing));
        }

        Ok(params)
    }
}

/// Final connection parameters for one attempt
#[derive(Clone)]
pub struct ResolvedParams {
    backend: BackendType,
    url: Option<String>,
    values: BTreeMap<&'static str, String>,
    secrets: Vec<&'static str>,
}

impl ResolvedParams {
    fn new(backend: BackendType, secrets: Vec<&'static str>) -> Self {
        Self {
            backend,
            url: None,
            values: BTreeMap::new(),
            secrets,
        }
    }

    pub fn backend(&self) -> BackendType {
        self.backend
    }

    /// Complete connection string, when one was resolved
    pub fn url(&self) -> Option<&str> {
        self.url.as_deref()
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.values.get(name).map(String::as_str)
    }

    /// Value that the backend cannot work without
    pub fn require(&self, name: &str) -> Result<&str> {
        self.get(name).ok_or_else(|| {
            ConnectorError::missing_credential(self.backend.display_name(), vec![name.to_string()])
        })
    }

    /// Parse a value, reporting malformed input as a caller error
    pub fn parse<T: FromStr>(&self, name: &str) -> Result<Option<T>> {
        match self.get(name) {
            None => Ok(None),
            Some(raw) => raw.trim().parse::<T>().map(Some).map_err(|_| {
                ConnectorError::invalid_request(format!(
                    "Invalid value for {} credential '{}'",
                    self.backend.display_name(),
                    name
                ))
            }),
        }
    }

    pub fn port(&self, name: &str, default: u16) -> Result<u16> {
        Ok(self.parse::<u16>(name)?.unwrap_or(default))
    }

    pub fn flag(&self, name: &str) -> bool {
        matches!(
            self.get(name).map(|v| v.to_ascii_lowercase()).as_deref(),
            Some("true" | "1" | "yes" | "on")
        )
    }
}

impl fmt::Debug for ResolvedParams {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let values: BTreeMap<&str, String> = self
            .values
            .iter()
            .map(|(k, v)| {
                if self.secrets.contains(k) || is_secret_key(k) {
                    (*k, "***".to_string())
                } else {
                    (*k, v.clone())
                }
            })
            .collect();

        f.debug_struct("ResolvedParams")
            .field("backend", &self.backend)
            .field("url", &self.url.as_deref().map(mask_secret))
            .field("values", &values)
            .finish()
    }
}

/// Whole-DSN keys count as secrets since they may embed a password
const SECRET_NAMES: &[&str] = &[
    "password",
    "passwd",
    "secret",
    "token",
    "key",
    "apikey",
    "connection_string",
    "url",
    "uri",
    "database_url",
    "db_url",
];

const SECRET_SUFFIXES: &[&str] = &["_password", "_secret", "_token", "_key", "_connection_string"];

fn is_secret_key(key: &str) -> bool {
    let key = key.to_ascii_lowercase();
    SECRET_NAMES.contains(&key.as_str())
        || SECRET_SUFFIXES.iter().any(|suffix| key.ends_with(suffix))
}

/// Mask a secret, showing only the first and last 4 characters of long values
pub fn mask_secret(s: &str) -> String {
    let chars: Vec<char> = s.chars().collect();
    if chars.len() <= 12 {
        "***".to_string()
    } else {
        let head: String = chars[..4].iter().collect();
        let tail: String = chars[chars.len() - 4..].iter().collect();
        format!("{}...{}", head, tail)
    }
}

fn json_type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
