//! Client-wide defaults and their TOML form.

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;

use crate::cache::{CachePolicy, DirStore, MemoryStore, Selector, Ttl};
use crate::error::FetchError;
use crate::http::HttpMethod;
use crate::registry::ClientConfig;

/// Receives failures of asynchronous calls that have no fail callback.
pub type ErrorHandler = Arc<dyn Fn(&FetchError) + Send + Sync>;

/// What a client selector sees when picking a configuration.
#[derive(Debug, Clone, Copy)]
pub struct SelectContext<'a> {
    pub url: &'a str,
    pub method: HttpMethod,
}

/// Picks the client configuration for requests that do not name one.
#[derive(Clone)]
pub enum ClientSelector {
    Fixed(ClientConfig),
    Select(Arc<dyn Fn(&SelectContext<'_>) -> ClientConfig + Send + Sync>),
}

impl ClientSelector {
    pub fn select(f: impl Fn(&SelectContext<'_>) -> ClientConfig + Send + Sync + 'static) -> Self {
        ClientSelector::Select(Arc::new(f))
    }
}

impl Default for ClientSelector {
    fn default() -> Self {
        ClientSelector::Fixed(ClientConfig::default())
    }
}

impl fmt::Debug for ClientSelector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ClientSelector::Fixed(config) => f.debug_tuple("Fixed").field(config).finish(),
            ClientSelector::Select(_) => f.write_str("Select(<fn>)"),
        }
    }
}

/// Defaults applied to every request of a `Client`.
#[derive(Clone)]
pub struct Settings {
    /// Extra attempts after a timeout-class failure.
    pub retry: u32,
    /// `None` makes a call synchronous unless it has a done callback.
    pub sync: Option<bool>,
    pub timeout: Option<Duration>,
    /// Upper bound on one blocking wait for transport events.
    pub poll_interval: Duration,
    pub client: ClientSelector,
    /// Policy used by requests that do not configure caching themselves.
    pub cache: Option<CachePolicy>,
    pub error_handler: Option<ErrorHandler>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            retry: 1,
            sync: None,
            timeout: None,
            poll_interval: Duration::from_millis(50),
            client: ClientSelector::default(),
            cache: None,
            error_handler: None,
        }
    }
}

impl fmt::Debug for Settings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Settings")
            .field("retry", &self.retry)
            .field("sync", &self.sync)
            .field("timeout", &self.timeout)
            .field("poll_interval", &self.poll_interval)
            .field("client", &self.client)
            .field("cache", &self.cache)
            .field("error_handler", &self.error_handler.is_some())
            .finish()
    }
}

impl Settings {
    pub fn resolve_client(&self, url: &str, method: HttpMethod) -> ClientConfig {
        match &self.client {
            ClientSelector::Fixed(config) => config.clone(),
            ClientSelector::Select(f) => f(&SelectContext { url, method }),
        }
    }

    pub fn with_error_handler(mut self, handler: impl Fn(&FetchError) + Send + Sync + 'static) -> Self {
        self.error_handler = Some(Arc::new(handler));
        self
    }

    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let file: SettingsFile = toml::from_str(content)?;
        file.into_settings()
    }

    /// Read settings from a TOML file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Parse error: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// On-disk shape of `Settings`.
#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SettingsFile {
    pub retry: Option<u32>,
    pub sync: Option<bool>,
    pub timeout_ms: Option<u64>,
    pub poll_interval_ms: Option<u64>,
    pub client: Option<ClientConfig>,
    pub cache: Option<CacheFile>,
}

/// The `[cache]` table.
#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CacheFile {
    /// Entries never expire when absent.
    pub ttl_secs: Option<u64>,
    pub keys: Option<Vec<String>>,
    /// Persist entries as files under this directory.
    pub dir: Option<PathBuf>,
    /// Use the process-wide memory table registered under this name.
    pub shared: Option<String>,
}

impl SettingsFile {
    pub fn into_settings(self) -> Result<Settings, ConfigError> {
        let defaults = Settings::default();
        let poll_interval = match self.poll_interval_ms {
            Some(0) => return Err(ConfigError::Invalid("poll_interval_ms must be positive".into())),
            Some(ms) => Duration::from_millis(ms),
            None => defaults.poll_interval,
        };
        Ok(Settings {
            retry: self.retry.unwrap_or(defaults.retry),
            sync: self.sync,
            timeout: self.timeout_ms.map(Duration::from_millis),
            poll_interval,
            client: self.client.map(ClientSelector::Fixed).unwrap_or_default(),
            cache: self.cache.map(CacheFile::into_policy).transpose()?,
            error_handler: None,
        })
    }
}

impl CacheFile {
    pub fn into_policy(self) -> Result<CachePolicy, ConfigError> {
        let ttl = self.ttl_secs.map_or(Ttl::Forever, |secs| Ttl::For(Duration::from_secs(secs)));
        let mut policy = CachePolicy::new(ttl);
        if let Some(keys) = self.keys {
            let selectors = keys
                .iter()
                .map(|k| Selector::from_str(k))
                .collect::<Result<Vec<_>, _>>()
                .map_err(|e| ConfigError::Invalid(e.to_string()))?;
            policy = policy.keys(selectors);
        }
        policy = match (self.dir, self.shared) {
            (Some(_), Some(_)) => {
                return Err(ConfigError::Invalid("cache.dir and cache.shared are mutually exclusive".into()))
            }
            (Some(dir), None) => policy.store(DirStore::new(dir)),
            (None, Some(name)) => policy.store(MemoryStore::named(&name)),
            (None, None) => policy,
        };
        Ok(policy)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::{Field, KeySpec};
    use crate::registry::BackendKind;

    #[test]
    fn defaults() {
        let settings = Settings::default();
        assert_eq!(settings.retry, 1);
        assert_eq!(settings.sync, None);
        assert_eq!(settings.timeout, None);
        assert_eq!(settings.poll_interval, Duration::from_millis(50));
        assert!(settings.cache.is_none());
        assert_eq!(settings.resolve_client("http://x/", HttpMethod::Get), ClientConfig::socket());
    }

    #[test]
    fn selector_sees_url_and_method() {
        let settings = Settings {
            client: ClientSelector::select(|ctx| {
                if ctx.url.starts_with("https://slow.") || ctx.method == HttpMethod::Post {
                    ClientConfig::curl()
                } else {
                    ClientConfig::socket()
                }
            }),
            ..Settings::default()
        };
        assert_eq!(settings.resolve_client("http://a/", HttpMethod::Get).backend, BackendKind::Socket);
        assert_eq!(settings.resolve_client("http://a/", HttpMethod::Post).backend, BackendKind::Curl);
        assert_eq!(
            settings.resolve_client("https://slow.example/", HttpMethod::Get).backend,
            BackendKind::Curl
        );
    }

    #[test]
    fn parses_full_file() {
        let settings = Settings::from_toml_str(
            r#"
            retry = 3
            sync = false
            timeout_ms = 1500
            poll_interval_ms = 10

            [client]
            backend = "curl"
            proxy = "http://127.0.0.1:3128"

            [cache]
            ttl_secs = 60
            keys = ["url", "headers.accept"]
            shared = "config-tests"
            "#,
        )
        .unwrap();
        assert_eq!(settings.retry, 3);
        assert_eq!(settings.sync, Some(false));
        assert_eq!(settings.timeout, Some(Duration::from_millis(1500)));
        assert_eq!(settings.poll_interval, Duration::from_millis(10));
        assert_eq!(
            settings.resolve_client("http://x/", HttpMethod::Get),
            ClientConfig::curl().with_proxy("http://127.0.0.1:3128")
        );
        let cache = settings.cache.unwrap();
        assert!(matches!(cache.ttl, Ttl::For(d) if d == Duration::from_secs(60)));
        assert!(matches!(
            cache.key,
            KeySpec::Selectors(ref s) if s == &vec![Selector::Field(Field::Url), Selector::entry(Field::Headers, "accept")]
        ));
    }

    #[test]
    fn empty_file_gives_defaults() {
        let settings = Settings::from_toml_str("").unwrap();
        assert_eq!(settings.retry, 1);
        assert!(settings.cache.is_none());
    }

    #[test]
    fn rejects_bad_values() {
        assert!(matches!(Settings::from_toml_str("retry = \"x\""), Err(ConfigError::Parse(_))));
        assert!(matches!(Settings::from_toml_str("unknown = 1"), Err(ConfigError::Parse(_))));
        assert!(matches!(Settings::from_toml_str("poll_interval_ms = 0"), Err(ConfigError::Invalid(_))));
        assert!(matches!(
            Settings::from_toml_str("[cache]\nkeys = [\"cookies\"]"),
            Err(ConfigError::Invalid(_))
        ));
        assert!(matches!(
            Settings::from_toml_str("[cache]\ndir = \"/tmp/x\"\nshared = \"y\""),
            Err(ConfigError::Invalid(_))
        ));
    }

    #[test]
    fn loads_from_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("facade.toml");
        let cache_dir = dir.path().join("cache");
        std::fs::write(
            &path,
            format!("retry = 0\n[cache]\ndir = {:?}\n", cache_dir.display().to_string()),
        )
        .unwrap();
        let settings = Settings::load(&path).unwrap();
        assert_eq!(settings.retry, 0);
        assert!(settings.cache.is_some());

        assert!(matches!(Settings::load(&dir.path().join("missing.toml")), Err(ConfigError::Io(_))));
    }
}
