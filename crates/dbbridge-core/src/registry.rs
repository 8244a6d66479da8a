use crate::backend::BackendType;
use crate::connector::{Connector, ConnectorContext};
use crate::credentials::{Credentials, EnvSource, ProcessEnv};
use crate::error::{ConnectorError, Result};
use dashmap::DashMap;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, warn};

/// Builds a fresh connector for one call
pub type Constructor = fn(ConnectorContext) -> Box<dyn Connector>;

/// Produces the constructor, or the reason the backend is unavailable in this build
pub type BindFn = fn() -> std::result::Result<Constructor, String>;

/// Registration of one backend's connector
#[derive(Clone, Copy)]
pub struct ConnectorBinding {
    pub backend: BackendType,
    pub bind: BindFn,
}

impl ConnectorBinding {
    pub const fn new(backend: BackendType, bind: BindFn) -> Self {
        Self { backend, bind }
    }
}

impl std::fmt::Debug for ConnectorBinding {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let (module, connector) = self.backend.binding_key();
        f.debug_struct("ConnectorBinding")
            .field("backend", &self.backend)
            .field("module", &module)
            .field("connector", &connector)
            .finish()
    }
}

/// Cause reported for a backend compiled out of the build
pub fn feature_disabled(feature: &str) -> String {
    format!(
        "connector was built without the `{}` feature; rebuild with it enabled",
        feature
    )
}

/// Declare a [`ConnectorBinding`] gated on a cargo feature of the calling crate
///
/// ```ignore
/// connector_binding!("postgresql", BackendType::PostgreSql, |ctx| PostgresConnector::new(ctx))
/// ```
#[macro_export]
macro_rules! connector_binding {
    ($feature:literal, $backend:expr, |$ctx:ident| $make:expr) => {{
        #[cfg(feature = $feature)]
        fn bind() -> ::std::result::Result<$crate::registry::Constructor, String> {
            fn construct(
                $ctx: $crate::connector::ConnectorContext,
            ) -> ::std::boxed::Box<dyn $crate::connector::Connector> {
                ::std::boxed::Box::new($make)
            }
            Ok(construct)
        }

        #[cfg(not(feature = $feature))]
        fn bind() -> ::std::result::Result<$crate::registry::Constructor, String> {
            Err($crate::registry::feature_disabled($feature))
        }

        $crate::registry::ConnectorBinding::new($backend, bind)
    }};
}

type CacheKey = (&'static str, &'static str);

/// Maps backend identifiers to connector constructors
///
/// Bindings are resolved on first use and cached per `(module, connector)`
/// key, failures included, for the life of the registry. Concurrent first
/// uses may both run the bind function; the first stored outcome wins.
pub struct ConnectorRegistry {
    bindings: HashMap<BackendType, BindFn>,
    cache: DashMap<CacheKey, std::result::Result<Constructor, String>>,
    env: Arc<dyn EnvSource>,
}

impl ConnectorRegistry {
    pub fn new() -> Self {
        Self::with_env(Arc::new(ProcessEnv))
    }

    /// Registry whose connectors read fallbacks from `env`
    pub fn with_env(env: Arc<dyn EnvSource>) -> Self {
        Self {
            bindings: HashMap::new(),
            cache: DashMap::new(),
            env,
        }
    }

    pub fn register(&mut self, binding: ConnectorBinding) {
        if self.bindings.insert(binding.backend, binding.bind).is_some() {
            debug!("Replacing connector binding for {}", binding.backend);
        }
    }

    pub fn with_bindings(mut self, bindings: impl IntoIterator<Item = ConnectorBinding>) -> Self {
        for binding in bindings {
            self.register(binding);
        }
        self
    }

    /// Registered backends in declaration order of [`BackendType`]
    pub fn backends(&self) -> Vec<BackendType> {
        let mut backends: Vec<_> = self.bindings.keys().copied().collect();
        backends.sort();
        backends
    }

    /// Resolve a backend identifier to a fresh connector
    pub fn get_connector(
        &self,
        backend: &str,
        credentials: Credentials,
    ) -> Result<Box<dyn Connector>> {
        let backend: BackendType = backend.parse()?;
        self.get_connector_for(backend, credentials)
    }

    pub fn get_connector_for(
        &self,
        backend: BackendType,
        credentials: Credentials,
    ) -> Result<Box<dyn Connector>> {
        let construct = self.constructor(backend)?;
        Ok(construct(ConnectorContext::with_env(
            credentials,
            Arc::clone(&self.env),
        )))
    }

    /// Whether the backend's connector can be bound, with the cause when it can't
    pub fn availability(&self, backend: BackendType) -> std::result::Result<(), String> {
        self.constructor(backend).map(|_| ()).map_err(|e| match e {
            ConnectorError::DependencyUnavailable { cause, .. } => cause,
            other => other.to_string(),
        })
    }

    fn constructor(&self, backend: BackendType) -> Result<Constructor> {
        let key = backend.binding_key();
        let cached = self.cache.get(&key).map(|entry| entry.value().clone());

        let outcome = match cached {
            Some(outcome) => outcome,
            None => {
                // Bind outside of any map guard; a racing bind is harmless.
                let fresh = match self.bindings.get(&backend) {
                    Some(bind) => bind(),
                    None => Err(format!("no connector registered for {}", backend)),
                };
                match &fresh {
                    Ok(_) => debug!("Bound connector {}::{}", key.0, key.1),
                    Err(cause) => warn!("Connector {}::{} unavailable: {}", key.0, key.1, cause),
                }
                self.cache.entry(key).or_insert(fresh).value().clone()
            }
        };

        outcome.map_err(|cause| ConnectorError::DependencyUnavailable {
            backend: backend.to_string(),
            cause,
        })
    }
}

impl Default for ConnectorRegistry {
    fn default() -> Self {
        Self::new()
    }
}
