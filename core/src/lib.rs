//! Uniform HTTP client over interchangeable transport backends.
//!
//! # Overview
//! A caller describes one logical request with `RequestOptions` (method,
//! params, headers, body, callbacks, timeout, retry budget, cache policy)
//! and hands it to a `Client`. The client normalizes it, consults the cache,
//! and runs it through a `Transport`: in-process sockets (`ureq`) or the
//! external `curl` executable. Both report progress the same way, so
//! streaming, timeouts, retries and error shapes look identical to the
//! caller whichever backend ran the exchange.
//!
//! # Design
//! - Backends do their blocking I/O on worker threads and report events over
//!   a channel; the `Client` turns events into callbacks on the caller's
//!   thread only, so callbacks need not be `Send`.
//! - Synchronous calls pump the same event loop as asynchronous ones, in
//!   short slices, so pending async calls keep progressing.
//! - Done/fail/finally run at most once per call; a failing done callback is
//!   rerouted into the failure path, and panics never unwind into the
//!   dispatcher.
//! - Transports are memoized per `ClientConfig` in a `Registry`; cached
//!   replies live in pluggable `CacheStore`s.

pub mod cache;
pub mod callbacks;
pub mod client;
pub mod codec;
pub mod config;
pub mod error;
pub mod http;
pub mod registry;
pub mod request;
pub mod transport;
pub mod types;

pub use cache::{CachePolicy, CacheSpec, DirStore, Field, MemoryStore, Selector, Ttl};
pub use callbacks::{CallbackError, StreamChunk};
pub use client::{Client, Fetched, Handle};
pub use codec::{Body, FormValue};
pub use config::{ClientSelector, ConfigError, Settings};
pub use error::{ErrorKind, FetchError};
pub use http::{Headers, HttpMethod, HttpRequest, HttpResponse, ResponseHead};
pub use registry::{BackendKind, ClientConfig, Registry};
pub use request::{HeaderShorthand, RequestOptions};
pub use types::{Payload, Reply};
