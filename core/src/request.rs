//! Caller-facing request options and their normalization.
//!
//! `RequestOptions` is the single description of a logical call. `prepare`
//! turns its data half into a `PreparedRequest` (URL with query, expanded
//! headers, encoded body, resolved method/sync/timeout/retry); the callback
//! half becomes the call's `Hooks`.

use std::str::FromStr;
use std::time::Duration;

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};

use crate::cache::{CacheRequest, CacheSpec};
use crate::callbacks::{
    CallbackError, Decoder, DoneCallback, FailCallback, FinallyCallback, Hooks, StreamChunk, StreamFilter,
};
use crate::codec::{encode_body, Body};
use crate::config::Settings;
use crate::error::FetchError;
use crate::http::{Headers, HttpMethod, HttpRequest, HttpResponse};
use crate::registry::ClientConfig;
use crate::types::{Payload, Reply};

/// Named header shortcuts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HeaderShorthand {
    /// `Content-Type: application/json`
    Json,
    /// `Content-Type: application/x-www-form-urlencoded`
    Form,
    /// `Content-Type: text/plain`
    Text,
    /// `Content-Type: text/html`
    Html,
    /// `Content-Type: application/xml`
    Xml,
    /// `Authorization: Bearer <token>`
    Bearer(String),
    /// `Authorization: Basic <base64 of user:password>`
    Basic { user: String, password: String },
    /// `User-Agent: <value>`
    UserAgent(String),
}

impl HeaderShorthand {
    pub fn expand(&self) -> (&'static str, String) {
        match self {
            HeaderShorthand::Json => ("Content-Type", "application/json".to_string()),
            HeaderShorthand::Form => ("Content-Type", "application/x-www-form-urlencoded".to_string()),
            HeaderShorthand::Text => ("Content-Type", "text/plain".to_string()),
            HeaderShorthand::Html => ("Content-Type", "text/html".to_string()),
            HeaderShorthand::Xml => ("Content-Type", "application/xml".to_string()),
            HeaderShorthand::Bearer(token) => ("Authorization", format!("Bearer {token}")),
            HeaderShorthand::Basic { user, password } => {
                ("Authorization", format!("Basic {}", BASE64.encode(format!("{user}:{password}"))))
            }
            HeaderShorthand::UserAgent(ua) => ("User-Agent", ua.clone()),
        }
    }
}

impl FromStr for HeaderShorthand {
    type Err = FetchError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "json" => Ok(HeaderShorthand::Json),
            "form" => Ok(HeaderShorthand::Form),
            "text" | "plain" => Ok(HeaderShorthand::Text),
            "html" => Ok(HeaderShorthand::Html),
            "xml" => Ok(HeaderShorthand::Xml),
            other => Err(FetchError::InvalidRequest(format!("unknown header shorthand `{other}`"))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum HeaderEntry {
    Pair(String, String),
    Shorthand(HeaderShorthand),
}

/// Everything a caller can say about one request.
#[derive(Default)]
pub struct RequestOptions {
    method: Option<HttpMethod>,
    params: Vec<(String, String)>,
    headers: Vec<HeaderEntry>,
    data: Option<Body>,
    sync: Option<bool>,
    timeout: Option<Duration>,
    retry: Option<u32>,
    cache: Option<CacheSpec>,
    client: Option<ClientConfig>,
    hooks: Hooks,
}

impl RequestOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn method(mut self, method: HttpMethod) -> Self {
        self.method = Some(method);
        self
    }

    pub fn param(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.params.push((key.into(), value.into()));
        self
    }

    pub fn params<I, K, V>(mut self, pairs: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        self.params.extend(pairs.into_iter().map(|(k, v)| (k.into(), v.into())));
        self
    }

    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push(HeaderEntry::Pair(name.into(), value.into()));
        self
    }

    pub fn shorthand(mut self, shorthand: HeaderShorthand) -> Self {
        self.headers.push(HeaderEntry::Shorthand(shorthand));
        self
    }

    pub fn data(mut self, body: impl Into<Body>) -> Self {
        self.data = Some(body.into());
        self
    }

    /// Replace content-type inference with a custom decoder.
    pub fn decode(mut self, decoder: impl Fn(&HttpResponse) -> Result<Payload, FetchError> + 'static) -> Self {
        self.hooks.decoder = Some(Box::new(decoder) as Decoder);
        self
    }

    pub fn filter(mut self, filter: impl FnMut(&StreamChunk<'_>) -> Result<(), CallbackError> + 'static) -> Self {
        self.hooks.filter = Some(Box::new(filter) as StreamFilter);
        self
    }

    pub fn on_done(mut self, done: impl FnOnce(&Reply) -> Result<(), CallbackError> + 'static) -> Self {
        self.hooks.done = Some(Box::new(done) as DoneCallback);
        self
    }

    pub fn on_fail(mut self, fail: impl FnOnce(&FetchError) + 'static) -> Self {
        self.hooks.fail = Some(Box::new(fail) as FailCallback);
        self
    }

    pub fn on_finally(mut self, finally: impl FnOnce() + 'static) -> Self {
        self.hooks.finally = Some(Box::new(finally) as FinallyCallback);
        self
    }

    pub fn sync(mut self, sync: bool) -> Self {
        self.sync = Some(sync);
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn retry(mut self, budget: u32) -> Self {
        self.retry = Some(budget);
        self
    }

    pub fn cache(mut self, spec: impl Into<CacheSpec>) -> Self {
        self.cache = Some(spec.into());
        self
    }

    /// Use this client configuration instead of the settings' selector.
    pub fn client(mut self, config: ClientConfig) -> Self {
        self.client = Some(config);
        self
    }

    pub(crate) fn into_parts(self) -> (RequestSpec, Hooks) {
        let spec = RequestSpec {
            method: self.method,
            params: self.params,
            headers: self.headers,
            data: self.data,
            sync: self.sync,
            timeout: self.timeout,
            retry: self.retry,
            cache: self.cache,
            client: self.client,
        };
        (spec, self.hooks)
    }
}

/// The data half of `RequestOptions`.
pub(crate) struct RequestSpec {
    method: Option<HttpMethod>,
    params: Vec<(String, String)>,
    headers: Vec<HeaderEntry>,
    data: Option<Body>,
    sync: Option<bool>,
    timeout: Option<Duration>,
    retry: Option<u32>,
    pub cache: Option<CacheSpec>,
    pub client: Option<ClientConfig>,
}

/// A normalized request plus the per-call settings resolved for it.
#[derive(Debug, Clone)]
pub struct PreparedRequest {
    pub http: HttpRequest,
    /// Query parameters as given, kept for cache keys.
    pub params: Vec<(String, String)>,
    /// The body before encoding, kept for cache keys.
    pub data: Option<Body>,
    pub timeout: Option<Duration>,
    pub retry: u32,
    pub sync: bool,
}

impl PreparedRequest {
    pub fn cache_request(&self) -> CacheRequest<'_> {
        CacheRequest {
            url: &self.http.url,
            method: self.http.method,
            params: &self.params,
            headers: &self.http.headers,
            body: self.data.as_ref(),
        }
    }
}

impl RequestSpec {
    /// Normalize into a `PreparedRequest`. `has_done` tells whether a success
    /// callback was supplied, which decides the sync flag when neither the
    /// caller nor the settings do.
    pub(crate) fn prepare(&self, url: &str, settings: &Settings, has_done: bool) -> Result<PreparedRequest, FetchError> {
        let mut parsed =
            url::Url::parse(url).map_err(|e| FetchError::InvalidRequest(format!("invalid url `{url}`: {e}")))?;
        if !self.params.is_empty() {
            parsed.query_pairs_mut().extend_pairs(self.params.iter());
        }

        let mut headers = Headers::new();
        for entry in &self.headers {
            match entry {
                HeaderEntry::Pair(name, value) => headers.append(name.clone(), value.clone()),
                HeaderEntry::Shorthand(shorthand) => {
                    let (name, value) = shorthand.expand();
                    headers.set(name, value);
                }
            }
        }

        let (body, headers) = match &self.data {
            Some(data) => {
                let encoded = encode_body(data, &headers)?;
                (Some(encoded.bytes), encoded.headers)
            }
            None => (None, headers),
        };

        let method = self.method.unwrap_or_else(|| HttpMethod::infer(body.is_some()));
        let sync = self.sync.or(settings.sync).unwrap_or(!has_done);

        Ok(PreparedRequest {
            http: HttpRequest {
                method,
                url: parsed.to_string(),
                headers,
                body,
            },
            params: self.params.clone(),
            data: self.data.clone(),
            timeout: self.timeout.or(settings.timeout),
            retry: self.retry.unwrap_or(settings.retry),
            sync,
        })
    }
}
