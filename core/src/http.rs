//! HTTP request and response types shared by the dispatcher and transports.
//!
//! # Design
//! These types describe an HTTP exchange as plain data. The dispatcher builds
//! an `HttpRequest` once per logical call and hands the same value to every
//! attempt; transports report a `ResponseHead` plus body bytes, which the
//! dispatcher assembles into an `HttpResponse`.
//!
//! All fields use owned types (`String`, `Vec`) so values can move to
//! transport worker threads and into cache stores without lifetime concerns.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::FetchError;

/// HTTP method for a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum HttpMethod {
    Get,
    Post,
    Put,
    Patch,
    Delete,
    Head,
    Options,
    Trace,
    Connect,
}

impl HttpMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            HttpMethod::Get => "GET",
            HttpMethod::Post => "POST",
            HttpMethod::Put => "PUT",
            HttpMethod::Patch => "PATCH",
            HttpMethod::Delete => "DELETE",
            HttpMethod::Head => "HEAD",
            HttpMethod::Options => "OPTIONS",
            HttpMethod::Trace => "TRACE",
            HttpMethod::Connect => "CONNECT",
        }
    }

    /// The method used when the caller did not name one: POST when a body is
    /// present, GET otherwise.
    pub fn infer(has_body: bool) -> Self {
        if has_body {
            HttpMethod::Post
        } else {
            HttpMethod::Get
        }
    }
}

impl fmt::Display for HttpMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for HttpMethod {
    type Err = FetchError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let method = match s.to_ascii_uppercase().as_str() {
            "GET" => HttpMethod::Get,
            "POST" => HttpMethod::Post,
            "PUT" => HttpMethod::Put,
            "PATCH" => HttpMethod::Patch,
            "DELETE" => HttpMethod::Delete,
            "HEAD" => HttpMethod::Head,
            "OPTIONS" => HttpMethod::Options,
            "TRACE" => HttpMethod::Trace,
            "CONNECT" => HttpMethod::Connect,
            other => return Err(FetchError::InvalidRequest(format!("unknown method `{other}`"))),
        };
        Ok(method)
    }
}

/// Ordered header list with case-insensitive names.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Headers(Vec<(String, String)>);

impl Headers {
    pub fn new() -> Self {
        Self(Vec::new())
    }

    /// First value stored under `name`, compared case-insensitively.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.0
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    /// Replace every value of `name` with a single `value`, keeping the
    /// position of the first occurrence.
    pub fn set(&mut self, name: impl Into<String>, value: impl Into<String>) {
        let name = name.into();
        let value = value.into();
        match self.0.iter().position(|(k, _)| k.eq_ignore_ascii_case(&name)) {
            Some(pos) => {
                self.0[pos] = (name.clone(), value);
                let mut index = 0;
                self.0.retain(|(k, _)| {
                    let keep = index <= pos || !k.eq_ignore_ascii_case(&name);
                    index += 1;
                    keep
                });
            }
            None => self.0.push((name, value)),
        }
    }

    pub fn append(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.0.push((name.into(), value.into()));
    }

    pub fn remove(&mut self, name: &str) {
        self.0.retain(|(k, _)| !k.eq_ignore_ascii_case(name));
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn into_vec(self) -> Vec<(String, String)> {
        self.0
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for Headers {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self(iter.into_iter().map(|(k, v)| (k.into(), v.into())).collect())
    }
}

/// A normalized HTTP request, ready to hand to a transport.
///
/// Built once per logical call by `RequestOptions` normalization and reused
/// unchanged by every retry attempt of that call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpRequest {
    pub method: HttpMethod,
    pub url: String,
    pub headers: Headers,
    /// Sent byte-for-byte by every backend.
    pub body: Option<Vec<u8>>,
}

/// Status line and headers of a response, reported by a transport before
/// any body bytes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResponseHead {
    pub status: u16,
    pub reason: Option<String>,
    /// Protocol version without the `HTTP/` prefix, e.g. `1.1` or `2`.
    pub version: String,
    pub headers: Headers,
}

impl ResponseHead {
    pub fn content_type(&self) -> Option<&str> {
        self.headers.get("content-type")
    }

    pub fn is_success(&self) -> bool {
        (200..400).contains(&self.status)
    }
}

/// A complete response assembled by the dispatcher.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpResponse {
    pub head: ResponseHead,
    pub body: Vec<u8>,
}

impl HttpResponse {
    pub fn status(&self) -> u16 {
        self.head.status
    }

    pub fn content_type(&self) -> Option<&str> {
        self.head.content_type()
    }
}
