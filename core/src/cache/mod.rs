//! Response caching: key derivation, policies, and lookup/store.
//!
//! # Design
//! A `CachePolicy` is read-only configuration: a time-to-live rule, a key
//! specification, and a store handle. Keys are built from selected request
//! fields into a `serde_json::Value` and compared by its canonical text, so
//! structurally equal requests always map to the same entry. Expired entries
//! are detected on lookup and left in place until overwritten.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use serde_json::{json, Value};
use sha2::{Digest, Sha256};
use tracing::warn;

use crate::codec::{Body, FormValue};
use crate::error::FetchError;
use crate::http::{Headers, HttpMethod};
use crate::types::Reply;

pub mod store;

pub use store::{CacheEntry, CacheError, CacheStore, DirStore, MemoryStore};

/// How long an entry stays valid.
#[derive(Clone)]
pub enum Ttl {
    Forever,
    For(Duration),
    /// Valid while the predicate returns `true` at lookup time.
    While(Arc<dyn Fn() -> bool + Send + Sync>),
}

impl Ttl {
    pub fn while_fn(predicate: impl Fn() -> bool + Send + Sync + 'static) -> Self {
        Ttl::While(Arc::new(predicate))
    }

    pub fn is_fresh(&self, created_at: SystemTime, now: SystemTime) -> bool {
        match self {
            Ttl::Forever => true,
            Ttl::For(ttl) => now
                .duration_since(created_at)
                .map(|age| age < *ttl)
                // Entries from the future (clock went backwards) count as fresh.
                .unwrap_or(true),
            Ttl::While(predicate) => predicate(),
        }
    }
}

impl fmt::Debug for Ttl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Ttl::Forever => f.write_str("Forever"),
            Ttl::For(ttl) => f.debug_tuple("For").field(ttl).finish(),
            Ttl::While(_) => f.write_str("While(..)"),
        }
    }
}

/// A request field usable in a cache key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Field {
    Url,
    Method,
    Params,
    Headers,
    Body,
}

impl FromStr for Field {
    type Err = FetchError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "url" => Ok(Field::Url),
            "method" => Ok(Field::Method),
            "params" => Ok(Field::Params),
            "headers" => Ok(Field::Headers),
            "body" | "data" => Ok(Field::Body),
            other => Err(FetchError::InvalidRequest(format!("unknown cache key field `{other}`"))),
        }
    }
}

/// A whole field, or one named entry inside it (a header, a param, or a
/// form body entry).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Selector {
    Field(Field),
    Entry(Field, String),
}

impl Selector {
    pub fn entry(field: Field, name: impl Into<String>) -> Self {
        Selector::Entry(field, name.into())
    }
}

impl From<Field> for Selector {
    fn from(field: Field) -> Self {
        Selector::Field(field)
    }
}

/// `"url"` selects a field, `"headers.accept"` an entry inside it.
impl FromStr for Selector {
    type Err = FetchError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.split_once('.') {
            Some((field, name)) => Ok(Selector::Entry(field.parse()?, name.to_string())),
            None => Ok(Selector::Field(s.parse()?)),
        }
    }
}

pub type KeyFn = Arc<dyn Fn(&CacheRequest<'_>) -> CacheKey + Send + Sync>;

/// How to derive a key from a request.
#[derive(Clone)]
pub enum KeySpec {
    Selectors(Vec<Selector>),
    Custom(KeyFn),
}

impl Default for KeySpec {
    fn default() -> Self {
        KeySpec::Selectors(vec![
            Selector::Field(Field::Url),
            Selector::Field(Field::Method),
            Selector::Field(Field::Headers),
            Selector::Field(Field::Body),
        ])
    }
}

impl fmt::Debug for KeySpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KeySpec::Selectors(selectors) => f.debug_tuple("Selectors").field(selectors).finish(),
            KeySpec::Custom(_) => f.write_str("Custom(..)"),
        }
    }
}

/// A derived cache key. Equality is structural.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey(String);

impl CacheKey {
    pub fn from_value(value: &Value) -> Self {
        // serde_json maps are ordered by key, so the text is canonical.
        CacheKey(value.to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Hex SHA-256 of the key, used for file names.
    pub fn digest(&self) -> String {
        hex::encode(Sha256::digest(self.0.as_bytes()))
    }
}

/// The request fields visible to key derivation.
#[derive(Debug, Clone, Copy)]
pub struct CacheRequest<'a> {
    pub url: &'a str,
    pub method: HttpMethod,
    pub params: &'a [(String, String)],
    pub headers: &'a Headers,
    pub body: Option<&'a Body>,
}

impl CacheRequest<'_> {
    fn field_value(&self, field: Field) -> Value {
        match field {
            Field::Url => json!(self.url),
            Field::Method => json!(self.method.as_str()),
            Field::Params => {
                let mut pairs: Vec<&(String, String)> = self.params.iter().collect();
                pairs.sort();
                json!(pairs)
            }
            Field::Headers => Value::Array(
                self.headers
                    .iter()
                    .map(|(k, v)| json!([k.to_ascii_lowercase(), v]))
                    .collect(),
            ),
            Field::Body => match self.body {
                None => Value::Null,
                Some(Body::Text(text)) => json!(text),
                Some(Body::Bytes(bytes)) => json!(hex::encode(bytes)),
                Some(Body::Form(pairs)) => Value::Array(
                    pairs
                        .iter()
                        .map(|(k, v)| json!([k, form_value_json(v)]))
                        .collect(),
                ),
            },
        }
    }

    fn entry_value(&self, field: Field, name: &str) -> Value {
        match field {
            Field::Headers => self.headers.get(name).map_or(Value::Null, |v| json!(v)),
            Field::Params => self
                .params
                .iter()
                .find(|(k, _)| k == name)
                .map_or(Value::Null, |(_, v)| json!(v)),
            Field::Body => self
                .body
                .and_then(|body| body.entry(name))
                .map_or(Value::Null, form_value_json),
            Field::Url | Field::Method => Value::Null,
        }
    }

    fn select(&self, selector: &Selector) -> Value {
        match selector {
            Selector::Field(field) => self.field_value(*field),
            Selector::Entry(field, name) => self.entry_value(*field, name),
        }
    }
}

fn form_value_json(value: &FormValue) -> Value {
    match value {
        FormValue::Text(text) => json!(text),
        FormValue::File { path, mime } => json!({"file": path.display().to_string(), "mime": mime}),
    }
}

/// TTL, key selection, and store for cached replies.
#[derive(Debug, Clone)]
pub struct CachePolicy {
    pub ttl: Ttl,
    pub key: KeySpec,
    pub store: Arc<dyn CacheStore>,
}

impl CachePolicy {
    /// Default key selectors and the process-wide default memory table.
    pub fn new(ttl: Ttl) -> Self {
        Self {
            ttl,
            key: KeySpec::default(),
            store: Arc::new(MemoryStore::global()),
        }
    }

    pub fn for_duration(ttl: Duration) -> Self {
        Self::new(Ttl::For(ttl))
    }

    pub fn keys<I, S>(mut self, selectors: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<Selector>,
    {
        self.key = KeySpec::Selectors(selectors.into_iter().map(Into::into).collect());
        self
    }

    pub fn key_fn(mut self, f: impl Fn(&CacheRequest<'_>) -> CacheKey + Send + Sync + 'static) -> Self {
        self.key = KeySpec::Custom(Arc::new(f));
        self
    }

    pub fn store(mut self, store: impl CacheStore + 'static) -> Self {
        self.store = Arc::new(store);
        self
    }

    pub fn shared_store(mut self, store: Arc<dyn CacheStore>) -> Self {
        self.store = store;
        self
    }
}

/// Per-request cache setting, including the shorthand forms.
#[derive(Debug, Clone)]
pub enum CacheSpec {
    /// TTL only; default keys and store.
    Ttl(Duration),
    Policy(CachePolicy),
    /// TTL plus key selectors, optionally with a store override.
    Tuple {
        ttl: Duration,
        keys: Vec<Selector>,
        store: Option<Arc<dyn CacheStore>>,
    },
    /// Skip caching even when a fallback policy is configured.
    Disabled,
}

impl CacheSpec {
    /// Normalize to a policy; `None` for `Disabled`.
    pub fn into_policy(self) -> Option<CachePolicy> {
        match self {
            CacheSpec::Ttl(ttl) => Some(CachePolicy::for_duration(ttl)),
            CacheSpec::Policy(policy) => Some(policy),
            CacheSpec::Tuple { ttl, keys, store } => {
                let policy = CachePolicy::for_duration(ttl).keys(keys);
                Some(match store {
                    Some(store) => policy.shared_store(store),
                    None => policy,
                })
            }
            CacheSpec::Disabled => None,
        }
    }
}

impl From<Duration> for CacheSpec {
    fn from(ttl: Duration) -> Self {
        CacheSpec::Ttl(ttl)
    }
}

impl From<CachePolicy> for CacheSpec {
    fn from(policy: CachePolicy) -> Self {
        CacheSpec::Policy(policy)
    }
}

/// Derive the key for `request` under `policy`.
///
/// A key spec with exactly one whole-field selector yields that field's value
/// alone; otherwise the key is the ordered list of selected values.
pub fn cache_key(request: &CacheRequest<'_>, policy: &CachePolicy) -> CacheKey {
    match &policy.key {
        KeySpec::Custom(f) => f(request),
        KeySpec::Selectors(selectors) => match selectors.as_slice() {
            [single @ Selector::Field(_)] => CacheKey::from_value(&request.select(single)),
            selectors => CacheKey::from_value(&Value::Array(
                selectors.iter().map(|s| request.select(s)).collect(),
            )),
        },
    }
}

/// A fresh entry for `key`, if any. Store failures are logged and count as a
/// miss.
pub fn lookup(policy: &CachePolicy, key: &CacheKey) -> Option<CacheEntry> {
    match policy.store.load(key) {
        Ok(Some(entry)) if policy.ttl.is_fresh(entry.created_at, SystemTime::now()) => Some(entry),
        Ok(_) => None,
        Err(e) => {
            warn!(error = %e, "cache lookup failed; treating as miss");
            None
        }
    }
}

/// Write `value` under `key` with a fresh timestamp.
pub fn store(policy: &CachePolicy, key: &CacheKey, value: &Reply) {
    let mut value = value.clone();
    value.from_cache = false;
    if let Err(e) = policy.store.save(key, CacheEntry::new(key, value)) {
        warn!(error = %e, "cache store failed; reply not cached");
    }
}
