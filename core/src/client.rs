//! The request dispatcher.
//!
//! # Design
//! A `Client` is single-threaded: it owns the receiving end of the channel
//! every transport reports through, plus the table of calls still in flight.
//! Nothing happens in the background on the caller's side. Events are turned
//! into callbacks only while the owner drives the client, either inside a
//! synchronous call (which pumps in `poll_interval` slices so other calls keep
//! progressing) or through `poll`, `pump`, `wait` and `run`.
//!
//! Each logical call runs one attempt at a time. An attempt is identified by
//! its exchange id; retries start a new exchange and events still queued for
//! an abandoned one are dropped because their id no longer maps to a call.
//! A call leaves the table before any of its completion callbacks run, which
//! is what makes done/fail/finally fire at most once.

use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::rc::Rc;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, Sender};
use tracing::{debug, error, info};

use crate::cache::{self, CacheKey, CachePolicy};
use crate::callbacks::{guarded, Hooks, StreamChunk};
use crate::config::Settings;
use crate::error::FetchError;
use crate::http::{HttpResponse, ResponseHead};
use crate::registry::Registry;
use crate::request::{PreparedRequest, RequestOptions};
use crate::transport::{ExchangeId, ExchangeOptions, InFlight, Transport, TransportEvent};
use crate::types::{Payload, Reply};

/// Identifies one logical call of a `Client`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Handle(u64);

impl Handle {
    pub fn id(&self) -> u64 {
        self.0
    }
}

/// What `Client::fetch` returns.
#[derive(Debug)]
pub enum Fetched {
    /// Outcome of a synchronous call.
    Reply(Reply),
    /// An asynchronous call; its outcome goes to the callbacks.
    Pending(Handle),
}

impl Fetched {
    pub fn into_reply(self) -> Option<Reply> {
        match self {
            Fetched::Reply(reply) => Some(reply),
            Fetched::Pending(_) => None,
        }
    }

    pub fn handle(&self) -> Option<Handle> {
        match self {
            Fetched::Pending(handle) => Some(*handle),
            Fetched::Reply(_) => None,
        }
    }
}

/// Why a call stopped before a normal completion.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Abort {
    Connection,
    Filter,
    Decode,
    Timeout,
    Cancelled,
}

impl Abort {
    fn of(err: &FetchError) -> Self {
        match err {
            FetchError::Filter(_) => Abort::Filter,
            FetchError::Decode(_) => Abort::Decode,
            FetchError::Cancelled => Abort::Cancelled,
            e if e.is_timeout_class() => Abort::Timeout,
            _ => Abort::Connection,
        }
    }
}

struct Attempt {
    exchange: ExchangeId,
    inflight: Box<dyn InFlight>,
    deadline: Option<Instant>,
    head: Option<ResponseHead>,
    body: Vec<u8>,
}

struct Call {
    request: PreparedRequest,
    transport: Arc<dyn Transport>,
    cache: Option<(CachePolicy, CacheKey)>,
    retries_left: u32,
    attempt: Option<Attempt>,
    abort: Option<Abort>,
    hooks: Hooks,
}

struct Engine {
    settings: Settings,
    registry: Arc<Registry>,
    tx: Sender<(ExchangeId, TransportEvent)>,
    rx: Receiver<(ExchangeId, TransportEvent)>,
    next_call: Cell<u64>,
    next_exchange: Cell<ExchangeId>,
    calls: RefCell<HashMap<u64, Call>>,
    exchanges: RefCell<HashMap<ExchangeId, u64>>,
    /// Outcomes of synchronous calls, collected by the waiting caller.
    results: RefCell<HashMap<u64, Result<Reply, FetchError>>>,
}

/// Entry point for issuing requests. Cheap to clone; clones share the same
/// calls and event channel. Not `Send`.
#[derive(Clone)]
pub struct Client {
    inner: Rc<Engine>,
}

impl Default for Client {
    fn default() -> Self {
        Self::new(Settings::default())
    }
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client")
            .field("settings", &self.inner.settings)
            .field("pending", &self.pending())
            .finish()
    }
}

impl Client {
    /// A client using the process-wide registry.
    pub fn new(settings: Settings) -> Self {
        Self::with_registry(settings, Registry::global())
    }

    pub fn with_registry(settings: Settings, registry: Arc<Registry>) -> Self {
        let (tx, rx) = crossbeam_channel::unbounded();
        Self {
            inner: Rc::new(Engine {
                settings,
                registry,
                tx,
                rx,
                next_call: Cell::new(1),
                next_exchange: Cell::new(1),
                calls: RefCell::new(HashMap::new()),
                exchanges: RefCell::new(HashMap::new()),
                results: RefCell::new(HashMap::new()),
            }),
        }
    }

    pub fn settings(&self) -> &Settings {
        &self.inner.settings
    }

    /// Issue a request.
    ///
    /// Synchronous calls block until the outcome is known and return it;
    /// asynchronous calls return a handle at once. Errors found before
    /// anything is dispatched (bad URL, unreadable upload, unavailable
    /// backend) are returned directly in both modes.
    pub fn fetch(&self, url: &str, options: RequestOptions) -> Result<Fetched, FetchError> {
        let settings = &self.inner.settings;
        let (spec, hooks) = options.into_parts();
        let request = spec.prepare(url, settings, hooks.done.is_some())?;
        let id = self.next_call_id();
        let sync = request.sync;

        let policy = match spec.cache {
            Some(cache_spec) => cache_spec.into_policy(),
            None => settings.cache.clone(),
        };
        let cache = policy.map(|policy| {
            let key = cache::cache_key(&request.cache_request(), &policy);
            (policy, key)
        });
        if let Some((policy, key)) = &cache {
            if let Some(entry) = cache::lookup(policy, key) {
                debug!(url = %request.http.url, "cache hit");
                let mut reply = entry.value;
                reply.from_cache = true;
                let outcome = self.conclude(hooks, sync, Ok(reply));
                return if sync {
                    outcome.map(Fetched::Reply)
                } else {
                    Ok(Fetched::Pending(Handle(id)))
                };
            }
        }

        let config = spec
            .client
            .unwrap_or_else(|| settings.resolve_client(&request.http.url, request.http.method));
        let transport = self.inner.registry.get_or_create(&config)?;
        transport.check_available()?;

        debug!(
            url = %request.http.url,
            method = %request.http.method,
            backend = transport.name(),
            sync,
            "dispatching request"
        );
        let retries_left = request.retry;
        self.inner.calls.borrow_mut().insert(
            id,
            Call {
                request,
                transport,
                cache,
                retries_left,
                attempt: None,
                abort: None,
                hooks,
            },
        );
        if let Err(e) = self.start_attempt(id) {
            self.attempt_failed(id, e);
        }

        if sync {
            self.wait_result(id).map(Fetched::Reply)
        } else {
            Ok(Fetched::Pending(Handle(id)))
        }
    }

    /// Issue a synchronous request.
    pub fn send(&self, url: &str, options: RequestOptions) -> Result<Reply, FetchError> {
        match self.fetch(url, options.sync(true))? {
            Fetched::Reply(reply) => Ok(reply),
            Fetched::Pending(_) => Err(FetchError::InvalidRequest("synchronous call returned a handle".into())),
        }
    }

    /// Issue an asynchronous request.
    pub fn spawn(&self, url: &str, options: RequestOptions) -> Result<Handle, FetchError> {
        match self.fetch(url, options.sync(false))? {
            Fetched::Pending(handle) => Ok(handle),
            Fetched::Reply(_) => Err(FetchError::InvalidRequest("asynchronous call returned a reply".into())),
        }
    }

    pub fn get(&self, url: &str) -> Result<Reply, FetchError> {
        self.send(url, RequestOptions::new())
    }

    /// Number of calls that have not reached a terminal outcome.
    pub fn pending(&self) -> usize {
        self.inner.calls.borrow().len()
    }

    pub fn is_pending(&self, handle: Handle) -> bool {
        self.inner.calls.borrow().contains_key(&handle.0)
    }

    /// Handle whatever events are ready without blocking.
    pub fn poll(&self) -> usize {
        self.pump(Duration::ZERO)
    }

    /// Wait up to `wait` for transport events, then handle everything that
    /// has arrived and enforce deadlines. Returns the number of events
    /// handled.
    pub fn pump(&self, wait: Duration) -> usize {
        let wait = match self.next_deadline() {
            Some(deadline) => wait.min(deadline.saturating_duration_since(Instant::now())),
            None => wait,
        };
        let mut handled = 0;
        if let Ok(message) = self.inner.rx.recv_timeout(wait) {
            self.handle_event(message);
            handled += 1;
        }
        handled += self.drain();
        handled + self.check_attempts()
    }

    /// Drive the client until `handle` is finished.
    pub fn wait(&self, handle: Handle) {
        while self.is_pending(handle) {
            self.pump(self.inner.settings.poll_interval);
        }
    }

    /// Drive the client until no call is pending.
    pub fn run(&self) {
        while self.pending() > 0 {
            self.pump(self.inner.settings.poll_interval);
        }
    }

    /// Abort a pending call. Its fail and finally callbacks run with
    /// `FetchError::Cancelled`. Returns `false` if the call already finished.
    pub fn cancel(&self, handle: Handle) -> bool {
        if !self.is_pending(handle) {
            return false;
        }
        self.abort(handle.0, FetchError::Cancelled);
        true
    }

    fn next_call_id(&self) -> u64 {
        let id = self.inner.next_call.get();
        self.inner.next_call.set(id + 1);
        id
    }

    fn wait_result(&self, id: u64) -> Result<Reply, FetchError> {
        loop {
            if let Some(outcome) = self.inner.results.borrow_mut().remove(&id) {
                return outcome;
            }
            if !self.inner.calls.borrow().contains_key(&id) {
                return Err(FetchError::Cancelled);
            }
            self.pump(self.inner.settings.poll_interval);
        }
    }

    fn next_deadline(&self) -> Option<Instant> {
        self.inner
            .calls
            .borrow()
            .values()
            .filter_map(|call| call.attempt.as_ref().and_then(|a| a.deadline))
            .min()
    }

    fn current_exchange(&self, id: u64) -> Option<ExchangeId> {
        self.inner
            .calls
            .borrow()
            .get(&id)
            .and_then(|call| call.attempt.as_ref().map(|a| a.exchange))
    }

    fn start_attempt(&self, id: u64) -> Result<(), FetchError> {
        let (request, transport) = match self.inner.calls.borrow().get(&id) {
            Some(call) => (call.request.clone(), Arc::clone(&call.transport)),
            None => return Ok(()),
        };
        let exchange = self.inner.next_exchange.get();
        self.inner.next_exchange.set(exchange + 1);
        self.inner.exchanges.borrow_mut().insert(exchange, id);

        let options = ExchangeOptions {
            timeout: request.timeout,
            sync: request.sync,
        };
        let sink = crate::transport::EventSink::new(exchange, self.inner.tx.clone());
        let inflight = match transport.execute(&request.http, &options, sink) {
            Ok(inflight) => inflight,
            Err(e) => {
                self.inner.exchanges.borrow_mut().remove(&exchange);
                return Err(e);
            }
        };

        let mut calls = self.inner.calls.borrow_mut();
        match calls.get_mut(&id) {
            Some(call) => {
                call.attempt = Some(Attempt {
                    exchange,
                    inflight,
                    deadline: request.timeout.map(|t| Instant::now() + t),
                    head: None,
                    body: Vec::new(),
                });
            }
            None => {
                inflight.cancel();
                self.inner.exchanges.borrow_mut().remove(&exchange);
            }
        }
        Ok(())
    }

    /// Drop the current attempt of `call`, cancelling it if it may still run.
    fn clear_attempt(&self, call: &mut Call, cancel: bool) -> Option<Attempt> {
        let attempt = call.attempt.take()?;
        self.inner.exchanges.borrow_mut().remove(&attempt.exchange);
        if cancel {
            attempt.inflight.cancel();
        }
        Some(attempt)
    }

    fn drain(&self) -> usize {
        let mut handled = 0;
        while let Ok(message) = self.inner.rx.try_recv() {
            self.handle_event(message);
            handled += 1;
        }
        handled
    }

    fn handle_event(&self, (exchange, event): (ExchangeId, TransportEvent)) {
        let Some(id) = self.inner.exchanges.borrow().get(&exchange).copied() else {
            return;
        };
        match event {
            TransportEvent::Head(head) => {
                if let Some(attempt) = self
                    .inner
                    .calls
                    .borrow_mut()
                    .get_mut(&id)
                    .and_then(|call| call.attempt.as_mut())
                {
                    attempt.head = Some(head);
                }
            }
            TransportEvent::Data(data) => self.on_data(id, exchange, data),
            TransportEvent::End => self.on_end(id),
            TransportEvent::Failed(err) => {
                if let Some(call) = self.inner.calls.borrow_mut().get_mut(&id) {
                    self.clear_attempt(call, false);
                }
                self.attempt_failed(id, err);
            }
        }
    }

    fn on_data(&self, id: u64, exchange: ExchangeId, data: Vec<u8>) {
        let (mut filter, head, received) = {
            let mut calls = self.inner.calls.borrow_mut();
            let Some(call) = calls.get_mut(&id) else {
                return;
            };
            let Some(attempt) = call.attempt.as_mut() else {
                return;
            };
            attempt.body.extend_from_slice(&data);
            if call.abort.is_some() {
                return;
            }
            if call.hooks.filter.is_none() {
                return;
            }
            let Some(head) = attempt.head.clone() else {
                return;
            };
            let Some(filter) = call.hooks.filter.take() else {
                return;
            };
            (filter, head, attempt.body.len())
        };

        let chunk = StreamChunk {
            head: &head,
            data: &data,
            received,
        };
        let verdict = match guarded(|| filter(&chunk)) {
            Ok(Ok(())) => None,
            Ok(Err(e)) => Some(e.to_string()),
            Err(panic) => Some(panic),
        };

        if let Some(call) = self.inner.calls.borrow_mut().get_mut(&id) {
            call.hooks.filter = Some(filter);
        }
        if let Some(reason) = verdict {
            if self.current_exchange(id) == Some(exchange) {
                debug!(call = id, %reason, "stream filter aborted the exchange");
                self.abort(id, FetchError::Filter(reason));
            }
        }
    }

    fn on_end(&self, id: u64) {
        let (attempt, url) = {
            let mut calls = self.inner.calls.borrow_mut();
            let Some(call) = calls.get_mut(&id) else {
                return;
            };
            let Some(attempt) = self.clear_attempt(call, false) else {
                return;
            };
            if call.abort.is_some() {
                return;
            }
            (attempt, call.request.http.url.clone())
        };

        let Some(head) = attempt.head else {
            self.attempt_failed(id, FetchError::EmptyResponse { url });
            return;
        };
        if !head.is_success() {
            let err = FetchError::Http {
                status: head.status,
                reason: head.reason.clone().filter(|r| !r.is_empty()),
                body: String::from_utf8_lossy(&attempt.body).into_owned(),
            };
            self.attempt_failed(id, err);
            return;
        }

        let response = HttpResponse {
            head,
            body: attempt.body,
        };
        // Failed attempts above may still retry, so the decoder stays with
        // the call until a response is actually decoded.
        let decoder = self
            .inner
            .calls
            .borrow_mut()
            .get_mut(&id)
            .and_then(|call| call.hooks.decoder.take());
        let decoded = match decoder {
            Some(decoder) => guarded(|| decoder(&response)).unwrap_or_else(|panic| Err(FetchError::Decode(panic))),
            None => Payload::infer(&response),
        };
        let payload = match decoded {
            Ok(payload) => payload,
            Err(e) => {
                let err = match e {
                    FetchError::Decode(_) => e,
                    other => FetchError::Decode(other.to_string()),
                };
                self.abort(id, err);
                return;
            }
        };

        let reply = Reply {
            payload,
            head: response.head,
            from_cache: false,
        };
        let cache = self
            .inner
            .calls
            .borrow_mut()
            .get_mut(&id)
            .and_then(|call| call.cache.take());
        if let Some((policy, key)) = cache {
            cache::store(&policy, &key, &reply);
        }
        self.finish(id, Ok(reply));
    }

    /// Retry a timeout-class failure while budget remains, otherwise finish
    /// the call with `err`.
    fn attempt_failed(&self, id: u64, err: FetchError) {
        let retry = {
            let mut calls = self.inner.calls.borrow_mut();
            let Some(call) = calls.get_mut(&id) else {
                return;
            };
            self.clear_attempt(call, true);
            if err.is_timeout_class() && call.retries_left > 0 && call.abort.is_none() {
                call.retries_left -= 1;
                info!(
                    call = id,
                    url = %call.request.http.url,
                    retries_left = call.retries_left,
                    error = %err,
                    "retrying after timeout-class failure"
                );
                true
            } else {
                call.abort.get_or_insert(Abort::of(&err));
                false
            }
        };
        if !retry {
            self.finish(id, Err(err));
        } else if let Err(e) = self.start_attempt(id) {
            self.attempt_failed(id, e);
        }
    }

    /// Stop a call for good, whatever its retry budget.
    fn abort(&self, id: u64, err: FetchError) {
        if let Some(call) = self.inner.calls.borrow_mut().get_mut(&id) {
            call.abort = Some(Abort::of(&err));
            self.clear_attempt(call, true);
        }
        self.finish(id, Err(err));
    }

    /// Enforce deadlines and detect backends that stopped without a terminal
    /// event. Returns the number of events handled along the way.
    fn check_attempts(&self) -> usize {
        let now = Instant::now();
        let mut expired = Vec::new();
        let mut stopped = Vec::new();
        for (id, call) in self.inner.calls.borrow().iter() {
            let Some(attempt) = &call.attempt else {
                continue;
            };
            if attempt.deadline.is_some_and(|d| d <= now) {
                expired.push((*id, attempt.exchange));
            } else if !attempt.inflight.is_alive() {
                stopped.push((*id, attempt.exchange));
            }
        }

        for (id, exchange) in expired {
            if self.current_exchange(id) != Some(exchange) {
                continue;
            }
            let message = match self.inner.calls.borrow().get(&id) {
                Some(call) => format!(
                    "{} did not complete within {:?}",
                    call.request.http.url,
                    call.request.timeout.unwrap_or_default()
                ),
                None => continue,
            };
            self.attempt_failed(id, FetchError::Timeout(message));
        }

        if stopped.is_empty() {
            return 0;
        }
        // The backend may have finished between the last drain and the check.
        let handled = self.drain();
        for (id, exchange) in stopped {
            if self.current_exchange(id) == Some(exchange) {
                self.attempt_failed(id, FetchError::Connection("transport stopped without a result".into()));
            }
        }
        handled
    }

    fn finish(&self, id: u64, outcome: Result<Reply, FetchError>) {
        let Some(mut call) = self.inner.calls.borrow_mut().remove(&id) else {
            return;
        };
        self.clear_attempt(&mut call, true);
        if let Some(abort) = call.abort {
            debug!(call = id, ?abort, "call aborted");
        }
        let sync = call.request.sync;
        let outcome = self.conclude(call.hooks, sync, outcome);
        if sync {
            self.inner.results.borrow_mut().insert(id, outcome);
        }
    }

    /// Run the completion callbacks for a terminal outcome and return the
    /// outcome as the caller should see it.
    fn conclude(&self, hooks: Hooks, sync: bool, outcome: Result<Reply, FetchError>) -> Result<Reply, FetchError> {
        let Hooks { done, fail, finally, .. } = hooks;
        let outcome = match (outcome, done) {
            (Ok(reply), Some(done)) => match guarded(|| done(&reply)) {
                Ok(Ok(())) => Ok(reply),
                Ok(Err(e)) => Err(FetchError::Callback(e.to_string())),
                Err(panic) => Err(FetchError::Callback(panic)),
            },
            (outcome, _) => outcome,
        };

        if let Err(err) = &outcome {
            match fail {
                Some(fail) => {
                    if let Err(panic) = guarded(|| fail(err)) {
                        error!(error = %err, panic = %panic, "fail callback panicked");
                    }
                }
                None if !sync => self.report_unhandled(err),
                None => {}
            }
        }
        if let Some(finally) = finally {
            if let Err(panic) = guarded(finally) {
                error!(panic = %panic, "finally callback panicked");
            }
        }
        outcome
    }

    fn report_unhandled(&self, err: &FetchError) {
        match &self.inner.settings.error_handler {
            Some(handler) => {
                if let Err(panic) = guarded(|| handler(err)) {
                    error!(error = %err, panic = %panic, "error handler panicked");
                }
            }
            None => error!(error = %err, kind = ?err.kind(), "unhandled request failure"),
        }
    }
}
