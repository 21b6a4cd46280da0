//! Dispatcher semantics against a scripted in-process transport.
//!
//! # Design
//! `Scripted` replays a queue of canned exchanges (falling back to a fixed
//! one when the queue is empty) and records every request it receives, so
//! each test can assert both on callback order and on how many times the
//! backend was invoked.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::rc::Rc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use facade_core::transport::{EventSink, ExchangeOptions, InFlight, Transport, TransportEvent};
use facade_core::{
    Body, CachePolicy, Client, ClientConfig, ClientSelector, ErrorKind, Fetched, FetchError, Field, Headers,
    HeaderShorthand, HttpMethod, HttpRequest, MemoryStore, Payload, Registry, RequestOptions, ResponseHead,
    Settings,
};
use parking_lot::Mutex;

#[derive(Debug, Clone)]
enum Script {
    Reply {
        status: u16,
        reason: Option<&'static str>,
        content_type: &'static str,
        chunks: Vec<&'static [u8]>,
    },
    Fail(FetchError),
    /// Never produces an event.
    Hang,
    /// Terminates without a head.
    Silent,
    /// Stops without any event.
    Die,
}

fn ok_json(body: &'static [u8]) -> Script {
    Script::Reply {
        status: 200,
        reason: Some("OK"),
        content_type: "application/json",
        chunks: vec![body],
    }
}

fn status(code: u16, reason: &'static str) -> Script {
    Script::Reply {
        status: code,
        reason: Some(reason),
        content_type: "text/plain",
        chunks: vec![&b"nope"[..]],
    }
}

#[derive(Debug)]
struct Scripted {
    queue: Mutex<VecDeque<Script>>,
    fallback: Script,
    seen: Mutex<Vec<(HttpRequest, ExchangeOptions)>>,
    invocations: AtomicUsize,
}

impl Scripted {
    fn new(queue: impl IntoIterator<Item = Script>, fallback: Script) -> Arc<Self> {
        Arc::new(Self {
            queue: Mutex::new(queue.into_iter().collect()),
            fallback,
            seen: Mutex::new(Vec::new()),
            invocations: AtomicUsize::new(0),
        })
    }

    fn always(script: Script) -> Arc<Self> {
        Self::new([], script)
    }

    fn invocations(&self) -> usize {
        self.invocations.load(Ordering::SeqCst)
    }

    fn last_request(&self) -> HttpRequest {
        self.seen.lock().last().map(|(req, _)| req.clone()).unwrap()
    }
}

#[derive(Debug)]
struct ScriptedExchange {
    sink: EventSink,
    alive: Arc<AtomicBool>,
}

impl InFlight for ScriptedExchange {
    fn cancel(&self) {
        self.sink.close();
        self.alive.store(false, Ordering::SeqCst);
    }

    fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }
}

impl Transport for Scripted {
    fn name(&self) -> &str {
        "scripted"
    }

    fn execute(
        &self,
        request: &HttpRequest,
        options: &ExchangeOptions,
        sink: EventSink,
    ) -> Result<Box<dyn InFlight>, FetchError> {
        self.invocations.fetch_add(1, Ordering::SeqCst);
        self.seen.lock().push((request.clone(), *options));
        let script = self.queue.lock().pop_front().unwrap_or_else(|| self.fallback.clone());
        let alive = Arc::new(AtomicBool::new(true));
        match script {
            Script::Reply {
                status,
                reason,
                content_type,
                chunks,
            } => {
                let headers: Headers = [("Content-Type", content_type)].into_iter().collect();
                sink.emit(TransportEvent::Head(ResponseHead {
                    status,
                    reason: reason.map(str::to_string),
                    version: "1.1".to_string(),
                    headers,
                }));
                for chunk in chunks {
                    sink.emit(TransportEvent::Data(chunk.to_vec()));
                }
                sink.emit(TransportEvent::End);
            }
            Script::Fail(err) => {
                sink.emit(TransportEvent::Failed(err));
            }
            Script::Hang => {}
            Script::Silent => {
                sink.emit(TransportEvent::End);
            }
            Script::Die => alive.store(false, Ordering::SeqCst),
        }
        Ok(Box::new(ScriptedExchange { sink, alive }))
    }
}

fn client_with(transport: Arc<Scripted>, settings: Settings) -> Client {
    let registry = Arc::new(Registry::new());
    registry.register(ClientConfig::custom("scripted"), transport);
    Client::with_registry(
        Settings {
            client: ClientSelector::Fixed(ClientConfig::custom("scripted")),
            ..settings
        },
        registry,
    )
}

fn client(transport: Arc<Scripted>) -> Client {
    client_with(transport, Settings::default())
}

/// Ordered record of callback invocations.
#[derive(Debug, Clone, Default)]
struct Log(Rc<RefCell<Vec<String>>>);

impl Log {
    fn push(&self, entry: impl Into<String>) {
        self.0.borrow_mut().push(entry.into());
    }

    fn entries(&self) -> Vec<String> {
        self.0.borrow().clone()
    }
}

/// Options with done/fail/finally callbacks that record into `log`.
fn logged(log: &Log) -> RequestOptions {
    let (done, fail, finally) = (log.clone(), log.clone(), log.clone());
    RequestOptions::new()
        .on_done(move |_| {
            done.push("done");
            Ok(())
        })
        .on_fail(move |err| fail.push(format!("fail:{:?}", err.kind())))
        .on_finally(move || finally.push("finally"))
}

// --- success paths ---

#[test]
fn sync_call_returns_decoded_reply() {
    let transport = Scripted::always(ok_json(br#"{"origin":"10.0.0.1"}"#));
    let reply = client(transport.clone()).get("http://example/ip").unwrap();
    assert_eq!(reply.status(), 200);
    assert_eq!(reply.payload.as_json().unwrap()["origin"], "10.0.0.1");
    assert!(!reply.from_cache);
    assert_eq!(transport.invocations(), 1);

    let seen = transport.last_request();
    assert_eq!(seen.method, HttpMethod::Get);
    assert_eq!(seen.url, "http://example/ip");
}

#[test]
fn done_callback_makes_call_async() {
    let transport = Scripted::always(ok_json(b"{}"));
    let client = client(transport.clone());
    let log = Log::default();

    let fetched = client.fetch("http://example/ip", logged(&log)).unwrap();
    let handle = fetched.handle().unwrap();
    assert!(log.entries().is_empty());
    assert!(client.is_pending(handle));
    assert!(!transport.seen.lock()[0].1.sync);

    client.wait(handle);
    assert!(!client.is_pending(handle));
    assert_eq!(log.entries(), ["done", "finally"]);
}

#[test]
fn sync_call_with_callbacks_runs_them_once() {
    let transport = Scripted::always(ok_json(b"[1,2]"));
    let log = Log::default();
    let reply = client(transport).send("http://example/list", logged(&log)).unwrap();
    assert_eq!(reply.payload, Payload::Json(serde_json::json!([1, 2])));
    assert_eq!(log.entries(), ["done", "finally"]);
}

#[test]
fn run_drives_many_async_calls() {
    let transport = Scripted::always(ok_json(b"{}"));
    let client = client(transport.clone());
    let log = Log::default();
    for i in 0..5 {
        client.spawn(&format!("http://example/{i}"), logged(&log)).unwrap();
    }
    assert_eq!(client.pending(), 5);
    client.run();
    assert_eq!(client.pending(), 0);
    assert_eq!(log.entries().iter().filter(|e| *e == "done").count(), 5);
    assert_eq!(log.entries().iter().filter(|e| *e == "finally").count(), 5);
}

#[test]
fn request_is_normalized_before_dispatch() {
    let transport = Scripted::always(ok_json(b"{}"));
    client(transport.clone())
        .send(
            "http://example/submit",
            RequestOptions::new()
                .param("page", "2")
                .shorthand(HeaderShorthand::Bearer("t".into()))
                .data(Body::form([("k", "v")]))
                .timeout(Duration::from_secs(3)),
        )
        .unwrap();

    let (request, options) = transport.seen.lock()[0].clone();
    assert_eq!(request.method, HttpMethod::Post);
    assert_eq!(request.url, "http://example/submit?page=2");
    assert_eq!(request.headers.get("authorization"), Some("Bearer t"));
    assert!(request.headers.get("content-type").is_none());
    assert_eq!(request.body.as_deref(), Some(&b"k=v"[..]));
    assert_eq!(options.timeout, Some(Duration::from_secs(3)));
    assert!(options.sync);
}

#[test]
fn custom_decoder_replaces_inference() {
    let transport = Scripted::always(ok_json(b"not json at all"));
    let reply = client(transport)
        .send(
            "http://example/raw",
            RequestOptions::new().decode(|resp| Ok(Payload::Bytes(resp.body.clone()))),
        )
        .unwrap();
    assert_eq!(reply.payload.as_bytes(), Some(&b"not json at all"[..]));
}

// --- failure paths ---

#[test]
fn http_error_carries_status_and_reason() {
    let transport = Scripted::always(status(404, "Not Found"));
    let log = Log::default();
    let err = client(transport.clone())
        .send("http://example/missing", logged(&log).retry(3))
        .unwrap_err();
    assert_eq!(
        err,
        FetchError::Http {
            status: 404,
            reason: Some("Not Found".into()),
            body: "nope".into(),
        }
    );
    assert_eq!(transport.invocations(), 1);
    assert_eq!(log.entries(), ["fail:Http", "finally"]);
}

#[test]
fn empty_response_is_distinguished() {
    let transport = Scripted::always(Script::Silent);
    let err = client(transport).get("http://example/empty").unwrap_err();
    assert_eq!(err.kind(), ErrorKind::EmptyResponse);
}

#[test]
fn connection_failure_is_not_retried() {
    let transport = Scripted::always(Script::Fail(FetchError::Connection("connection refused".into())));
    let err = client(transport.clone())
        .send("http://example/", RequestOptions::new().retry(3))
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Connection);
    assert_eq!(transport.invocations(), 1);
}

#[test]
fn backend_that_stops_silently_fails_the_call() {
    let transport = Scripted::always(Script::Die);
    let err = client(transport).send("http://example/", RequestOptions::new().retry(0)).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Connection);
}

#[test]
fn undecodable_body_is_a_decode_error() {
    let transport = Scripted::always(ok_json(b"{broken"));
    let log = Log::default();
    let err = client(transport).send("http://example/", logged(&log)).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Decode);
    assert_eq!(log.entries(), ["fail:Decode", "finally"]);
}

#[test]
fn unavailable_backend_fails_before_dispatch() {
    let transport = Scripted::always(ok_json(b"{}"));
    let client = client(transport.clone());
    let log = Log::default();
    let err = client
        .fetch("http://example/", logged(&log).client(ClientConfig::custom("missing")))
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::TransportUnavailable);
    assert!(log.entries().is_empty());
    assert_eq!(transport.invocations(), 0);
}

#[test]
fn invalid_url_fails_before_dispatch() {
    let transport = Scripted::always(ok_json(b"{}"));
    let err = client(transport.clone()).get("::not a url::").unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidRequest);
    assert_eq!(transport.invocations(), 0);
}

// --- retry ---

#[test]
fn timeout_class_failures_use_the_whole_budget() {
    let transport = Scripted::always(Script::Fail(FetchError::Timeout("slow".into())));
    let log = Log::default();
    let client = client(transport.clone());
    let handle = client.spawn("http://example/", logged(&log).retry(3)).unwrap();
    client.wait(handle);
    assert_eq!(transport.invocations(), 4);
    assert_eq!(log.entries(), ["fail:Timeout", "finally"]);
}

#[test]
fn zero_budget_fails_after_one_attempt() {
    let transport = Scripted::always(Script::Fail(FetchError::Timeout("slow".into())));
    let err = client(transport.clone())
        .send("http://example/", RequestOptions::new().retry(0))
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Timeout);
    assert_eq!(transport.invocations(), 1);
}

#[test]
fn retry_budget_defaults_from_settings() {
    let transport = Scripted::always(Script::Fail(FetchError::Connection("operation timed out".into())));
    let settings = Settings {
        retry: 2,
        ..Settings::default()
    };
    let err = client_with(transport.clone(), settings).get("http://example/").unwrap_err();
    assert!(err.is_timeout_class());
    assert_eq!(transport.invocations(), 3);
}

#[test]
fn gateway_timeout_is_retried_until_success() {
    let transport = Scripted::new([status(504, "Gateway Timeout")], ok_json(br#"{"ok":true}"#));
    let log = Log::default();
    let reply = client(transport.clone())
        .send("http://example/", logged(&log).retry(1))
        .unwrap();
    assert_eq!(reply.payload.as_json().unwrap()["ok"], true);
    assert_eq!(transport.invocations(), 2);
    assert_eq!(log.entries(), ["done", "finally"]);
}

#[test]
fn custom_decoder_survives_a_retried_attempt() {
    let transport = Scripted::new([status(504, "Gateway Timeout")], ok_json(b"not json at all"));
    let reply = client(transport.clone())
        .send(
            "http://example/raw",
            RequestOptions::new()
                .retry(1)
                .decode(|resp| Ok(Payload::Bytes(resp.body.clone()))),
        )
        .unwrap();
    assert_eq!(transport.invocations(), 2);
    assert_eq!(reply.payload.as_bytes(), Some(&b"not json at all"[..]));
}

#[test]
fn deadline_cancels_a_hanging_backend() {
    let transport = Scripted::always(Script::Hang);
    let started = Instant::now();
    let err = client(transport.clone())
        .send(
            "http://example/slow",
            RequestOptions::new().timeout(Duration::from_millis(10)).retry(1),
        )
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Timeout);
    assert_eq!(transport.invocations(), 2);
    assert!(started.elapsed() >= Duration::from_millis(20));
    assert!(started.elapsed() < Duration::from_secs(5));
}

// --- streaming filter ---

fn chunked() -> Script {
    Script::Reply {
        status: 200,
        reason: Some("OK"),
        content_type: "text/plain",
        chunks: vec![&b"ab"[..], &b"cd"[..], &b"ef"[..]],
    }
}

#[test]
fn filter_sees_every_chunk_in_order() {
    let transport = Scripted::always(chunked());
    let seen = Rc::new(RefCell::new(Vec::new()));
    let sink = Rc::clone(&seen);
    let reply = client(transport)
        .send(
            "http://example/lines",
            RequestOptions::new().filter(move |chunk| {
                assert_eq!(chunk.head.status, 200);
                sink.borrow_mut().push((chunk.data.to_vec(), chunk.received));
                Ok(())
            }),
        )
        .unwrap();
    assert_eq!(reply.payload.as_text(), Some("abcdef"));
    assert_eq!(
        *seen.borrow(),
        vec![(b"ab".to_vec(), 2), (b"cd".to_vec(), 4), (b"ef".to_vec(), 6)]
    );
}

#[test]
fn filter_error_aborts_without_success_or_retry() {
    let transport = Scripted::always(chunked());
    let calls = Rc::new(RefCell::new(0));
    let counter = Rc::clone(&calls);
    let log = Log::default();
    let client = client(transport.clone());
    let handle = client
        .spawn(
            "http://example/lines",
            logged(&log).retry(3).filter(move |chunk| {
                *counter.borrow_mut() += 1;
                if chunk.received >= 4 {
                    return Err("too much".into());
                }
                Ok(())
            }),
        )
        .unwrap();
    client.wait(handle);
    assert_eq!(*calls.borrow(), 2);
    assert_eq!(transport.invocations(), 1);
    assert_eq!(log.entries(), ["fail:Filter", "finally"]);
}

#[test]
fn filter_panic_is_a_filter_error() {
    let transport = Scripted::always(chunked());
    let err = client(transport)
        .send(
            "http://example/lines",
            RequestOptions::new().filter(|_| panic!("filter exploded")),
        )
        .unwrap_err();
    assert_eq!(err, FetchError::Filter("filter exploded".into()));
}

// --- decorated callbacks ---

#[test]
fn done_error_is_rerouted_to_fail() {
    let transport = Scripted::always(ok_json(b"{}"));
    let log = Log::default();
    let (fail, finally) = (log.clone(), log.clone());
    let client = client(transport);
    let handle = client
        .spawn(
            "http://example/",
            RequestOptions::new()
                .on_done(|_| Err("rejected".into()))
                .on_fail(move |err| fail.push(format!("fail:{err}")))
                .on_finally(move || finally.push("finally")),
        )
        .unwrap();
    client.wait(handle);
    assert_eq!(
        log.entries(),
        ["fail:completion callback failed: rejected", "finally"]
    );
}

#[test]
fn done_panic_surfaces_to_sync_caller() {
    let transport = Scripted::always(ok_json(b"{}"));
    let log = Log::default();
    let finally = log.clone();
    let err = client(transport)
        .send(
            "http://example/",
            RequestOptions::new()
                .on_done(|_| panic!("boom"))
                .on_finally(move || finally.push("finally")),
        )
        .unwrap_err();
    assert_eq!(err, FetchError::Callback("boom".into()));
    assert_eq!(log.entries(), ["finally"]);
}

#[test]
fn fail_panic_still_runs_finally() {
    let transport = Scripted::always(status(500, "Internal Server Error"));
    let log = Log::default();
    let finally = log.clone();
    let client = client(transport);
    let handle = client
        .spawn(
            "http://example/",
            RequestOptions::new()
                .on_done(|_| Ok(()))
                .on_fail(|_| panic!("fail callback broke"))
                .on_finally(move || finally.push("finally")),
        )
        .unwrap();
    client.wait(handle);
    assert_eq!(log.entries(), ["finally"]);
}

#[test]
fn unhandled_async_failure_reaches_error_handler() {
    let transport = Scripted::always(status(503, "Service Unavailable"));
    let reported = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&reported);
    let settings = Settings::default().with_error_handler(move |err| sink.lock().push(err.status()));
    let client = client_with(transport, settings);
    let handle = client
        .spawn("http://example/", RequestOptions::new().on_done(|_| Ok(())))
        .unwrap();
    client.wait(handle);
    assert_eq!(*reported.lock(), vec![Some(503)]);
}

#[test]
fn cancel_routes_through_fail_and_finally() {
    let transport = Scripted::always(Script::Hang);
    let log = Log::default();
    let client = client(transport);
    let handle = client.spawn("http://example/", logged(&log)).unwrap();
    client.poll();
    assert!(client.cancel(handle));
    assert!(!client.cancel(handle));
    assert_eq!(log.entries(), ["fail:Cancelled", "finally"]);
    assert_eq!(client.pending(), 0);
}

#[test]
fn callbacks_may_issue_nested_requests() {
    let transport = Scripted::always(ok_json(br#"{"n":1}"#));
    let client = client(transport.clone());
    let nested = client.clone();
    let inner = Rc::new(RefCell::new(None));
    let slot = Rc::clone(&inner);
    let handle = client
        .spawn(
            "http://example/outer",
            RequestOptions::new().on_done(move |_| {
                *slot.borrow_mut() = Some(nested.get("http://example/inner")?.status());
                Ok(())
            }),
        )
        .unwrap();
    client.wait(handle);
    assert_eq!(*inner.borrow(), Some(200));
    assert_eq!(transport.invocations(), 2);
}

// --- cache ---

fn private_cache(ttl: Duration) -> (CachePolicy, MemoryStore) {
    let table = MemoryStore::new();
    (CachePolicy::for_duration(ttl).store(table.clone()), table)
}

#[test]
fn cached_reply_skips_the_backend() {
    let transport = Scripted::new([ok_json(br#"{"v":1}"#)], ok_json(br#"{"v":2}"#));
    let client = client(transport.clone());
    let (policy, table) = private_cache(Duration::from_secs(5));

    let first = client
        .send("http://example/ip", RequestOptions::new().cache(policy.clone()))
        .unwrap();
    let log = Log::default();
    let second = client
        .send("http://example/ip", logged(&log).cache(policy))
        .unwrap();

    assert_eq!(transport.invocations(), 1);
    assert_eq!(first.payload, second.payload);
    assert!(!first.from_cache);
    assert!(second.from_cache);
    assert_eq!(log.entries(), ["done", "finally"]);
    assert_eq!(table.len(), 1);
}

#[test]
fn async_cache_hit_completes_immediately() {
    let transport = Scripted::always(ok_json(b"{}"));
    let client = client(transport.clone());
    let (policy, _) = private_cache(Duration::from_secs(5));
    client
        .send("http://example/ip", RequestOptions::new().cache(policy.clone()))
        .unwrap();

    let log = Log::default();
    let fetched = client.fetch("http://example/ip", logged(&log).cache(policy)).unwrap();
    assert!(matches!(fetched, Fetched::Pending(handle) if !client.is_pending(handle)));
    assert_eq!(log.entries(), ["done", "finally"]);
    assert_eq!(transport.invocations(), 1);
}

#[test]
fn headers_outside_the_key_still_hit() {
    let transport = Scripted::always(ok_json(b"{}"));
    let client = client(transport.clone());
    let (policy, _) = private_cache(Duration::from_secs(5));
    let policy = policy.keys([Field::Url]);

    client
        .send("http://example/ip", RequestOptions::new().header("Accept", "a/b").cache(policy.clone()))
        .unwrap();
    let second = client
        .send("http://example/ip", RequestOptions::new().header("Accept", "c/d").cache(policy))
        .unwrap();
    assert!(second.from_cache);
    assert_eq!(transport.invocations(), 1);
}

#[test]
fn selected_header_change_misses() {
    let transport = Scripted::always(ok_json(b"{}"));
    let client = client(transport.clone());
    let (policy, _) = private_cache(Duration::from_secs(5));

    client
        .send("http://example/ip", RequestOptions::new().header("Accept", "a/b").cache(policy.clone()))
        .unwrap();
    let second = client
        .send("http://example/ip", RequestOptions::new().header("Accept", "c/d").cache(policy))
        .unwrap();
    assert!(!second.from_cache);
    assert_eq!(transport.invocations(), 2);
}

#[test]
fn expired_entry_is_refreshed() {
    let transport = Scripted::always(ok_json(b"{}"));
    let client = client(transport.clone());
    let (policy, table) = private_cache(Duration::ZERO);
    for _ in 0..2 {
        client
            .send("http://example/ip", RequestOptions::new().cache(policy.clone()))
            .unwrap();
    }
    assert_eq!(transport.invocations(), 2);
    assert_eq!(table.len(), 1);
}

#[test]
fn failures_are_not_cached() {
    let transport = Scripted::new([status(500, "Internal Server Error")], ok_json(b"{}"));
    let client = client(transport.clone());
    let (policy, table) = private_cache(Duration::from_secs(5));
    assert!(client
        .send("http://example/ip", RequestOptions::new().retry(0).cache(policy.clone()))
        .is_err());
    assert!(table.is_empty());
    assert!(client
        .send("http://example/ip", RequestOptions::new().cache(policy))
        .is_ok());
    assert_eq!(table.len(), 1);
}

#[test]
fn settings_cache_is_the_fallback_policy() {
    let transport = Scripted::always(ok_json(b"{}"));
    let (policy, table) = private_cache(Duration::from_secs(5));
    let settings = Settings {
        cache: Some(policy),
        ..Settings::default()
    };
    let client = client_with(transport.clone(), settings);
    client.get("http://example/ip").unwrap();
    assert!(client.get("http://example/ip").unwrap().from_cache);
    assert_eq!(transport.invocations(), 1);
    assert_eq!(table.len(), 1);

    let fresh = client
        .send("http://example/ip", RequestOptions::new().cache(facade_core::CacheSpec::Disabled))
        .unwrap();
    assert!(!fresh.from_cache);
    assert_eq!(transport.invocations(), 2);
}

#[test]
fn named_tables_are_shared_between_policies() {
    let transport = Scripted::always(ok_json(b"{}"));
    let client = client(transport.clone());
    let writer = CachePolicy::for_duration(Duration::from_secs(5)).store(MemoryStore::named("dispatch-shared"));
    let reader = CachePolicy::for_duration(Duration::from_secs(60)).store(MemoryStore::named("dispatch-shared"));

    client.send("http://example/shared", RequestOptions::new().cache(writer)).unwrap();
    let reply = client.send("http://example/shared", RequestOptions::new().cache(reader)).unwrap();
    assert!(reply.from_cache);
    assert_eq!(transport.invocations(), 1);
    assert_eq!(MemoryStore::named("dispatch-shared").len(), 1);
}
