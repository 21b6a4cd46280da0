//! httpbin-style test server.
//!
//! Routes return deterministic bodies so client tests can assert on status
//! codes, content types, echoed requests, redirects, slow responses and
//! binary data.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use axum::{
    body::Bytes,
    extract::{Path, Query, State},
    http::{header, HeaderMap, Method, StatusCode, Uri},
    response::IntoResponse,
    routing::{any, get},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::net::TcpListener;
use tracing::debug;
use uuid::Uuid;

/// Longest delay `/delay/{ms}` will honor.
pub const MAX_DELAY_MS: u64 = 10_000;

/// Largest body `/bytes/{n}` and `/lines/{n}` will produce.
pub const MAX_BODY_LEN: usize = 1 << 20;

/// What `/anything` sends back.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct Echo {
    pub method: String,
    pub path: String,
    pub args: BTreeMap<String, String>,
    pub headers: BTreeMap<String, String>,
    pub data: String,
    /// The body parsed as JSON, when it is JSON.
    pub json: Option<Value>,
}

#[derive(Clone, Default)]
pub struct Counter(Arc<AtomicU64>);

pub fn app() -> Router {
    Router::new()
        .route("/ip", get(ip))
        .route("/uuid", get(uuid))
        .route("/counter", get(counter))
        .route("/anything", any(anything))
        .route("/anything/{*rest}", any(anything))
        .route("/status/{code}", any(status))
        .route("/delay/{ms}", get(delay))
        .route("/bytes/{n}", get(bytes))
        .route("/lines/{n}", get(lines))
        .route("/redirect/{n}", any(redirect))
        .with_state(Counter::default())
}

pub async fn run(listener: TcpListener) -> Result<(), std::io::Error> {
    axum::serve(listener, app()).await
}

async fn ip(headers: HeaderMap) -> Json<Value> {
    let origin = headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("127.0.0.1");
    Json(json!({ "origin": origin }))
}

async fn uuid() -> Json<Value> {
    Json(json!({ "uuid": Uuid::new_v4() }))
}

async fn counter(State(Counter(count)): State<Counter>) -> Json<Value> {
    let count = count.fetch_add(1, Ordering::SeqCst) + 1;
    Json(json!({ "count": count }))
}

async fn anything(
    method: Method,
    uri: Uri,
    Query(args): Query<BTreeMap<String, String>>,
    headers: HeaderMap,
    body: Bytes,
) -> Json<Echo> {
    debug!(%method, %uri, "echo");
    let headers = headers
        .iter()
        .map(|(name, value)| (name.as_str().to_string(), String::from_utf8_lossy(value.as_bytes()).into_owned()))
        .collect();
    Json(Echo {
        method: method.to_string(),
        path: uri.path().to_string(),
        args,
        headers,
        data: String::from_utf8_lossy(&body).into_owned(),
        json: serde_json::from_slice(&body).ok(),
    })
}

async fn status(Path(code): Path<u16>) -> Result<(StatusCode, String), StatusCode> {
    let status = StatusCode::from_u16(code).map_err(|_| StatusCode::BAD_REQUEST)?;
    Ok((status, format!("status {code}")))
}

async fn delay(Path(ms): Path<u64>) -> Json<Value> {
    let ms = ms.min(MAX_DELAY_MS);
    tokio::time::sleep(Duration::from_millis(ms)).await;
    Json(json!({ "delay": ms }))
}

async fn bytes(Path(n): Path<usize>) -> impl IntoResponse {
    let body: Vec<u8> = (0..n.min(MAX_BODY_LEN)).map(|i| (i % 256) as u8).collect();
    ([(header::CONTENT_TYPE, "application/octet-stream")], body)
}

async fn lines(Path(n): Path<usize>) -> impl IntoResponse {
    let mut body = String::new();
    for i in 0..n {
        if body.len() >= MAX_BODY_LEN {
            break;
        }
        body.push_str(&format!("line {i}\n"));
    }
    ([(header::CONTENT_TYPE, "text/plain; charset=utf-8")], body)
}

/// `302 Found` chain of `n` hops ending at `/ip`.
async fn redirect(Path(n): Path<u32>) -> impl IntoResponse {
    let target = if n <= 1 {
        "/ip".to_string()
    } else {
        format!("/redirect/{}", n - 1)
    };
    (StatusCode::FOUND, [(header::LOCATION, target)], format!("redirecting to hop {n}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn echo_serializes_missing_json_as_null() {
        let echo = Echo {
            method: "GET".to_string(),
            path: "/anything".to_string(),
            args: BTreeMap::new(),
            headers: BTreeMap::new(),
            data: "not json".to_string(),
            json: None,
        };
        let value = serde_json::to_value(&echo).unwrap();
        assert_eq!(value["json"], Value::Null);
        assert_eq!(value["data"], "not json");
    }

    #[test]
    fn echo_roundtrips_through_json() {
        let echo = Echo {
            method: "POST".to_string(),
            path: "/anything/x".to_string(),
            args: [("a".to_string(), "1".to_string())].into_iter().collect(),
            headers: [("accept".to_string(), "*/*".to_string())].into_iter().collect(),
            data: r#"{"k":"v"}"#.to_string(),
            json: Some(json!({"k": "v"})),
        };
        let text = serde_json::to_string(&echo).unwrap();
        let back: Echo = serde_json::from_str(&text).unwrap();
        assert_eq!(back, echo);
    }

    #[tokio::test]
    async fn counter_increments_per_request() {
        let state = Counter::default();
        let Json(first) = counter(State(state.clone())).await;
        let Json(second) = counter(State(state)).await;
        assert_eq!(first["count"], 1);
        assert_eq!(second["count"], 2);
    }
}
