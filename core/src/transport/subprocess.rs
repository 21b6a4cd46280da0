//! Out-of-process transport that shells out to the `curl` executable.
//!
//! # Design
//! curl writes the status line, headers, and body to stdout (`--include`).
//! `HeadParser` accumulates stdout into an append-only buffer and advances a
//! scan cursor, so bytes already searched for the header terminator are never
//! scanned again. Interim header blocks (`1xx`, proxy `Connection
//! established`, and followed `3xx` hops) are skipped; everything after the
//! final block is forwarded as body data as it arrives. The exit status
//! decides the terminal event.

use std::io::{Read, Write};
use std::path::PathBuf;
use std::process::{Child, ChildStderr, ChildStdout, Command, ExitStatus, Stdio};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::error::FetchError;
use crate::http::{Headers, HttpMethod, HttpRequest, ResponseHead};
use crate::registry::ClientConfig;
use crate::transport::{EventSink, ExchangeOptions, InFlight, Transport, TransportEvent, MAX_REDIRECTS};

const READ_CHUNK: usize = 16 * 1024;
const DEFAULT_PROGRAM: &str = "curl";
const EXIT_POLL: Duration = Duration::from_millis(5);

/// Transport spawning one `curl` process per exchange.
#[derive(Debug, Clone)]
pub struct CurlTransport {
    program: PathBuf,
    user_agent: Option<String>,
    proxy: Option<String>,
    extra_args: Vec<String>,
}

impl CurlTransport {
    pub fn new(config: &ClientConfig) -> Self {
        Self {
            program: PathBuf::from(DEFAULT_PROGRAM),
            user_agent: config.user_agent.clone(),
            proxy: config.proxy.clone(),
            extra_args: config.extra_args.clone(),
        }
    }

    /// Use a different executable than `curl` from `PATH`.
    pub fn with_program(mut self, program: impl Into<PathBuf>) -> Self {
        self.program = program.into();
        self
    }

    fn resolve_program(&self) -> Result<PathBuf, FetchError> {
        which::which(&self.program).map_err(|e| FetchError::TransportUnavailable {
            backend: self.name().to_string(),
            reason: format!("cannot find `{}`: {e}", self.program.display()),
        })
    }

    fn command(&self, program: PathBuf, request: &HttpRequest, options: &ExchangeOptions) -> Command {
        let mut cmd = Command::new(program);
        cmd.args(["--silent", "--show-error", "--include", "--no-buffer", "--location"]);
        cmd.arg("--max-redirs").arg(MAX_REDIRECTS.to_string());
        // An explicit `--request` would also be replayed on every redirect hop,
        // so the method curl picks by itself is left implicit.
        let implied = if request.body.is_some() { HttpMethod::Post } else { HttpMethod::Get };
        if request.method == HttpMethod::Head {
            cmd.arg("--head");
        } else if request.method != implied {
            cmd.args(["--request", request.method.as_str()]);
        }
        if let Some(timeout) = options.timeout {
            cmd.arg("--max-time").arg(format!("{:.3}", timeout.as_secs_f64()));
        }
        if let Some(user_agent) = &self.user_agent {
            cmd.arg("--user-agent").arg(user_agent);
        }
        if let Some(proxy) = &self.proxy {
            cmd.arg("--proxy").arg(proxy);
        }
        for (name, value) in request.headers.iter() {
            // `Name;` is curl's syntax for a header with an empty value.
            let header = if value.is_empty() {
                format!("{name};")
            } else {
                format!("{name}: {value}")
            };
            cmd.arg("--header").arg(header);
        }
        if request.body.is_some() {
            cmd.args(["--header", "Expect:", "--data-binary", "@-"]);
        }
        cmd.args(&self.extra_args);
        cmd.arg("--url").arg(&request.url);
        cmd.stdin(if request.body.is_some() { Stdio::piped() } else { Stdio::null() })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        cmd
    }
}

impl Transport for CurlTransport {
    fn name(&self) -> &str {
        "curl"
    }

    fn check_available(&self) -> Result<(), FetchError> {
        self.resolve_program().map(|_| ())
    }

    fn execute(
        &self,
        request: &HttpRequest,
        options: &ExchangeOptions,
        sink: EventSink,
    ) -> Result<Box<dyn InFlight>, FetchError> {
        let program = self.resolve_program()?;
        let mut child = self.command(program, request, options).spawn().map_err(|e| {
            FetchError::TransportUnavailable {
                backend: self.name().to_string(),
                reason: format!("cannot spawn curl: {e}"),
            }
        })?;
        debug!(exchange = sink.id(), pid = child.id(), url = %request.url, "curl exchange started");

        if let (Some(mut stdin), Some(body)) = (child.stdin.take(), request.body.clone()) {
            thread::spawn(move || {
                if let Err(e) = stdin.write_all(&body) {
                    warn!(error = %e, "failed to write request body to curl");
                }
            });
        }

        let (Some(stdout), Some(stderr)) = (child.stdout.take(), child.stderr.take()) else {
            return Err(FetchError::Connection("curl output pipes are unavailable".to_string()));
        };
        let child = Arc::new(Mutex::new(child));
        let worker_child = Arc::clone(&child);
        let worker_sink = sink.clone();
        let url = request.url.clone();
        let reader = thread::Builder::new()
            .name(format!("facade-curl-{}", sink.id()))
            .spawn(move || read_exchange(stdout, stderr, &worker_child, &worker_sink, &url))
            .map_err(|e| FetchError::Connection(format!("cannot start curl reader: {e}")))?;

        Ok(Box::new(CurlExchange { sink, child, reader }))
    }
}

#[derive(Debug)]
struct CurlExchange {
    sink: EventSink,
    child: Arc<Mutex<Child>>,
    /// Emits the terminal event, so it outlives the process itself.
    reader: JoinHandle<()>,
}

impl InFlight for CurlExchange {
    fn cancel(&self) {
        self.sink.close();
        let mut child = self.child.lock();
        if let Err(e) = child.kill() {
            debug!(error = %e, "curl process already exited");
        }
    }

    fn is_alive(&self) -> bool {
        !self.reader.is_finished()
    }
}

fn read_exchange(
    mut stdout: ChildStdout,
    mut stderr: ChildStderr,
    child: &Mutex<Child>,
    sink: &EventSink,
    url: &str,
) {
    let mut parser = HeadParser::default();
    let mut head_sent = false;
    let mut buf = vec![0u8; READ_CHUNK];
    let mut malformed = None;

    loop {
        let n = match stdout.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) => {
                sink.emit(TransportEvent::Failed(FetchError::Connection(e.to_string())));
                return;
            }
        };
        if sink.is_closed() {
            return;
        }
        if head_sent {
            sink.emit(TransportEvent::Data(buf[..n].to_vec()));
            continue;
        }
        match parser.push(&buf[..n]) {
            Ok(Some((head, rest))) => {
                head_sent = true;
                sink.emit(TransportEvent::Head(head));
                if !rest.is_empty() {
                    sink.emit(TransportEvent::Data(rest));
                }
            }
            Ok(None) => {}
            Err(e) => {
                malformed = Some(e);
                if let Err(e) = child.lock().kill() {
                    debug!(error = %e, "curl process already exited");
                }
                break;
            }
        }
    }

    if !head_sent && malformed.is_none() && !sink.is_closed() {
        if let Some((head, rest)) = parser.finish() {
            sink.emit(TransportEvent::Head(head));
            if !rest.is_empty() {
                sink.emit(TransportEvent::Data(rest));
            }
        }
    }

    let mut diagnostics = String::new();
    if let Err(e) = stderr.read_to_string(&mut diagnostics) {
        debug!(error = %e, "failed to read curl stderr");
    }
    let code = match wait_exit(child) {
        Ok(status) => status.code(),
        Err(e) => {
            sink.emit(TransportEvent::Failed(FetchError::Connection(e.to_string())));
            return;
        }
    };

    let event = match (code, malformed) {
        (_, Some(e)) => TransportEvent::Failed(e),
        (Some(0), None) => TransportEvent::End,
        (code, None) => TransportEvent::Failed(exit_error(code, diagnostics.trim(), url)),
    };
    sink.emit(event);
}

/// Wait for the process without holding the lock across the wait, so
/// `cancel` and `is_alive` never block on it.
fn wait_exit(child: &Mutex<Child>) -> std::io::Result<ExitStatus> {
    loop {
        if let Some(status) = child.lock().try_wait()? {
            return Ok(status);
        }
        thread::sleep(EXIT_POLL);
    }
}

/// Map a non-zero curl exit code onto the error taxonomy.
fn exit_error(code: Option<i32>, diagnostics: &str, url: &str) -> FetchError {
    let message = if diagnostics.is_empty() {
        match code {
            Some(code) => format!("curl exited with status {code}"),
            None => "curl was terminated by a signal".to_string(),
        }
    } else {
        diagnostics.to_string()
    };
    match code {
        Some(28) => FetchError::Timeout(message),
        Some(52) => FetchError::EmptyResponse { url: url.to_string() },
        Some(3) => FetchError::InvalidRequest(message),
        _ => FetchError::Connection(message),
    }
}

/// Incremental parser for the header blocks curl prints before the body.
#[derive(Debug, Default)]
pub(crate) struct HeadParser {
    buf: Vec<u8>,
    /// Bytes of `buf` already searched for the block terminator.
    scanned: usize,
    /// A `3xx` head with a `Location`, final only if no further block follows.
    redirect: Option<ResponseHead>,
}

impl HeadParser {
    /// Append `bytes`. Returns the final response head together with any
    /// body bytes that followed it once the head is complete.
    pub(crate) fn push(&mut self, bytes: &[u8]) -> Result<Option<(ResponseHead, Vec<u8>)>, FetchError> {
        self.buf.extend_from_slice(bytes);
        loop {
            if let Some(head) = self.redirect.take() {
                if !self.buf.starts_with(STATUS_PREFIX) {
                    if STATUS_PREFIX.starts_with(&self.buf) {
                        self.redirect = Some(head);
                        return Ok(None);
                    }
                    return Ok(Some((head, std::mem::take(&mut self.buf))));
                }
            }
            let start = self.scanned.saturating_sub(3);
            let Some(end) = find_terminator(&self.buf[start..]).map(|pos| pos + start) else {
                self.scanned = self.buf.len();
                return Ok(None);
            };
            let rest = self.buf.split_off(end + 4);
            let head = parse_head(&self.buf[..end])?;
            self.buf = rest;
            self.scanned = 0;
            if is_interim(&head) {
                continue;
            }
            if is_followed_redirect(&head) {
                self.redirect = Some(head);
                continue;
            }
            return Ok(Some((head, std::mem::take(&mut self.buf))));
        }
    }

    /// End of output: a redirect still waiting for its successor is final.
    pub(crate) fn finish(&mut self) -> Option<(ResponseHead, Vec<u8>)> {
        let head = self.redirect.take()?;
        Some((head, std::mem::take(&mut self.buf)))
    }
}

const STATUS_PREFIX: &[u8] = b"HTTP/";

fn find_terminator(haystack: &[u8]) -> Option<usize> {
    haystack.windows(4).position(|w| w == b"\r\n\r\n")
}

fn is_interim(head: &ResponseHead) -> bool {
    (100..200).contains(&head.status)
        || head
            .reason
            .as_deref()
            .is_some_and(|r| r.eq_ignore_ascii_case("connection established"))
}

fn is_followed_redirect(head: &ResponseHead) -> bool {
    (300..400).contains(&head.status) && head.headers.get("location").is_some()
}

fn parse_head(block: &[u8]) -> Result<ResponseHead, FetchError> {
    let text = String::from_utf8_lossy(block);
    let mut lines = text.split("\r\n");
    let status_line = lines.next().unwrap_or_default();
    let mut parts = status_line.splitn(3, ' ');
    let version = parts
        .next()
        .and_then(|v| v.strip_prefix("HTTP/"))
        .ok_or_else(|| FetchError::Connection(format!("malformed status line `{status_line}`")))?;
    let status = parts
        .next()
        .and_then(|s| s.parse::<u16>().ok())
        .ok_or_else(|| FetchError::Connection(format!("malformed status line `{status_line}`")))?;
    let reason = parts.next().map(str::trim).filter(|r| !r.is_empty()).map(str::to_string);
    let headers: Headers = lines
        .filter_map(|line| line.split_once(':'))
        .map(|(name, value)| (name.trim(), value.trim()))
        .collect();
    Ok(ResponseHead {
        status,
        reason,
        version: version.to_string(),
        headers,
    })
}
