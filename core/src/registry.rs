//! Process-wide table of transports keyed by client configuration.
//!
//! Structurally equal `ClientConfig` values share one transport instance, so
//! proxy and agent setup happens once per configuration. Insertion happens
//! inside a single lock scope; no caller ever sees a half-built entry.

use std::collections::HashMap;
use std::sync::Arc;

use once_cell::sync::Lazy;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::FetchError;
use crate::transport::{CurlTransport, SocketTransport, Transport};

/// Which backend a client configuration uses.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    /// In-process sockets (`ureq`).
    #[default]
    Socket,
    /// The external `curl` executable.
    Curl,
    /// A transport bound with `Registry::register`.
    Custom(String),
}

/// Immutable description of a transport and its connection settings.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    pub backend: BackendKind,
    pub user_agent: Option<String>,
    pub proxy: Option<String>,
    /// Additional backend arguments (passed to curl verbatim).
    pub extra_args: Vec<String>,
}

impl ClientConfig {
    pub fn socket() -> Self {
        Self::default()
    }

    pub fn curl() -> Self {
        Self {
            backend: BackendKind::Curl,
            ..Self::default()
        }
    }

    pub fn custom(name: impl Into<String>) -> Self {
        Self {
            backend: BackendKind::Custom(name.into()),
            ..Self::default()
        }
    }

    pub fn with_user_agent(mut self, user_agent: impl Into<String>) -> Self {
        self.user_agent = Some(user_agent.into());
        self
    }

    pub fn with_proxy(mut self, proxy: impl Into<String>) -> Self {
        self.proxy = Some(proxy.into());
        self
    }

    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.extra_args = args.into_iter().map(Into::into).collect();
        self
    }
}

static GLOBAL: Lazy<Arc<Registry>> = Lazy::new(|| Arc::new(Registry::new()));

/// Memoizing map from `ClientConfig` to a shared transport.
#[derive(Debug, Default)]
pub struct Registry {
    clients: Mutex<HashMap<ClientConfig, Arc<dyn Transport>>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// The process-wide registry used by clients that are not given one.
    pub fn global() -> Arc<Registry> {
        Arc::clone(&GLOBAL)
    }

    /// The transport for `config`, built on first use.
    pub fn get_or_create(&self, config: &ClientConfig) -> Result<Arc<dyn Transport>, FetchError> {
        let mut clients = self.clients.lock();
        if let Some(transport) = clients.get(config) {
            return Ok(Arc::clone(transport));
        }
        let transport: Arc<dyn Transport> = match &config.backend {
            BackendKind::Socket => Arc::new(SocketTransport::new(config)?),
            BackendKind::Curl => Arc::new(CurlTransport::new(config)),
            BackendKind::Custom(name) => {
                return Err(FetchError::TransportUnavailable {
                    backend: name.clone(),
                    reason: "no transport registered under this name".to_string(),
                })
            }
        };
        debug!(backend = transport.name(), "registered transport for new client configuration");
        clients.insert(config.clone(), Arc::clone(&transport));
        Ok(transport)
    }

    /// Bind `config` to a caller-provided transport, replacing any previous
    /// binding.
    pub fn register(&self, config: ClientConfig, transport: Arc<dyn Transport>) {
        self.clients.lock().insert(config, transport);
    }

    pub fn len(&self) -> usize {
        self.clients.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.clients.lock().is_empty()
    }
}
