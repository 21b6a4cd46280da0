//! In-process transport built on a `ureq` agent.
//!
//! Each exchange runs on its own worker thread and streams the body back
//! through the sink in fixed-size reads. Status codes are returned as data
//! (`http_status_as_error(false)`), so 4xx/5xx classification stays with the
//! dispatcher.

use std::fmt;
use std::io::{self, Read};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use tracing::debug;
use ureq::typestate::{WithBody, WithoutBody};
use ureq::RequestBuilder;

use crate::error::{mentions_timeout, FetchError};
use crate::http::{Headers, HttpMethod, HttpRequest, ResponseHead};
use crate::registry::ClientConfig;
use crate::transport::{EventSink, ExchangeOptions, InFlight, Transport, TransportEvent, MAX_REDIRECTS};

const READ_CHUNK: usize = 16 * 1024;

type UreqResponse = ureq::http::Response<ureq::Body>;

/// Transport running exchanges on a shared `ureq::Agent`.
#[derive(Clone)]
pub struct SocketTransport {
    agent: ureq::Agent,
}

impl fmt::Debug for SocketTransport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SocketTransport").finish_non_exhaustive()
    }
}

impl SocketTransport {
    pub fn new(config: &ClientConfig) -> Result<Self, FetchError> {
        let mut builder = ureq::Agent::config_builder()
            .http_status_as_error(false)
            .max_redirects(MAX_REDIRECTS);
        if let Some(user_agent) = config.user_agent.as_deref() {
            builder = builder.user_agent(user_agent);
        }
        if let Some(proxy) = config.proxy.as_deref() {
            let proxy = ureq::Proxy::new(proxy)
                .map_err(|e| FetchError::InvalidRequest(format!("invalid proxy `{proxy}`: {e}")))?;
            builder = builder.proxy(Some(proxy));
        }
        Ok(Self {
            agent: builder.build().new_agent(),
        })
    }
}

impl Transport for SocketTransport {
    fn name(&self) -> &str {
        "socket"
    }

    fn execute(
        &self,
        request: &HttpRequest,
        options: &ExchangeOptions,
        sink: EventSink,
    ) -> Result<Box<dyn InFlight>, FetchError> {
        let agent = self.agent.clone();
        let request = request.clone();
        let timeout = options.timeout;
        let worker_sink = sink.clone();
        let worker = thread::Builder::new()
            .name(format!("facade-socket-{}", sink.id()))
            .spawn(move || run_exchange(&agent, &request, timeout, &worker_sink))
            .map_err(|e| FetchError::Connection(format!("cannot start socket worker: {e}")))?;
        Ok(Box::new(SocketExchange { sink, worker }))
    }
}

#[derive(Debug)]
struct SocketExchange {
    sink: EventSink,
    worker: JoinHandle<()>,
}

impl InFlight for SocketExchange {
    fn cancel(&self) {
        // The worker finishes on its own (bounded by the agent timeout); its
        // output is discarded by the closed sink.
        self.sink.close();
    }

    fn is_alive(&self) -> bool {
        !self.worker.is_finished()
    }
}

fn run_exchange(agent: &ureq::Agent, request: &HttpRequest, timeout: Option<Duration>, sink: &EventSink) {
    debug!(exchange = sink.id(), method = %request.method, url = %request.url, "socket exchange started");
    let mut response = match send(agent, request, timeout) {
        Ok(response) => response,
        Err(e) => {
            sink.emit(TransportEvent::Failed(map_ureq_error(e)));
            return;
        }
    };

    let head = ResponseHead {
        status: response.status().as_u16(),
        reason: response.status().canonical_reason().map(str::to_string),
        version: format!("{:?}", response.version()).trim_start_matches("HTTP/").to_string(),
        headers: response
            .headers()
            .iter()
            .map(|(name, value)| (name.as_str(), String::from_utf8_lossy(value.as_bytes()).into_owned()))
            .collect::<Headers>(),
    };
    if !sink.emit(TransportEvent::Head(head)) {
        return;
    }

    let mut reader = response.body_mut().as_reader();
    let mut buf = vec![0u8; READ_CHUNK];
    loop {
        match reader.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => {
                if !sink.emit(TransportEvent::Data(buf[..n].to_vec())) {
                    return;
                }
            }
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => {
                sink.emit(TransportEvent::Failed(map_io_error(&e)));
                return;
            }
        }
    }
    sink.emit(TransportEvent::End);
}

fn send(agent: &ureq::Agent, request: &HttpRequest, timeout: Option<Duration>) -> Result<UreqResponse, ureq::Error> {
    let url = request.url.as_str();
    let body = request.body.as_deref();
    match request.method {
        HttpMethod::Post => with_body(prepare(agent.post(url), request, timeout), body),
        HttpMethod::Put => with_body(prepare(agent.put(url), request, timeout), body),
        HttpMethod::Patch => with_body(prepare(agent.patch(url), request, timeout), body),
        HttpMethod::Get => without_body(prepare(agent.get(url), request, timeout), body),
        HttpMethod::Delete => without_body(prepare(agent.delete(url), request, timeout), body),
        HttpMethod::Head => without_body(prepare(agent.head(url), request, timeout), body),
        HttpMethod::Options => without_body(prepare(agent.options(url), request, timeout), body),
        HttpMethod::Trace => without_body(prepare(agent.trace(url), request, timeout), body),
        HttpMethod::Connect => without_body(prepare(agent.connect(url), request, timeout), body),
    }
}

fn prepare<B>(mut builder: RequestBuilder<B>, request: &HttpRequest, timeout: Option<Duration>) -> RequestBuilder<B> {
    for (name, value) in request.headers.iter() {
        builder = builder.header(name, value);
    }
    builder.config().timeout_global(timeout).build()
}

fn with_body(builder: RequestBuilder<WithBody>, body: Option<&[u8]>) -> Result<UreqResponse, ureq::Error> {
    match body {
        Some(bytes) => builder.send(bytes),
        None => builder.send_empty(),
    }
}

fn without_body(builder: RequestBuilder<WithoutBody>, body: Option<&[u8]>) -> Result<UreqResponse, ureq::Error> {
    match body {
        Some(bytes) => builder.force_send_body().send(bytes),
        None => builder.call(),
    }
}

fn map_ureq_error(error: ureq::Error) -> FetchError {
    let message = error.to_string();
    match error {
        ureq::Error::Timeout(_) => FetchError::Timeout(message),
        ureq::Error::Io(e) => map_io_error(&e),
        ureq::Error::BadUri(_) | ureq::Error::Http(_) => FetchError::InvalidRequest(message),
        _ => FetchError::Connection(message),
    }
}

fn map_io_error(error: &io::Error) -> FetchError {
    let message = error.to_string();
    if error.kind() == io::ErrorKind::TimedOut || mentions_timeout(&message) {
        FetchError::Timeout(message)
    } else {
        FetchError::Connection(message)
    }
}
