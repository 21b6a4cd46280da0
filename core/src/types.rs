//! Decoded response values handed to success callbacks and cache stores.
//!
//! # Design
//! `Reply` bundles the decoded payload with the status line and headers so
//! callbacks take one statically-typed argument and ignore what they do not
//! need. Both types are serializable because the filesystem cache persists
//! them as JSON.

use serde::{Deserialize, Serialize};

use crate::codec::{classify_binary, is_json_type};
use crate::error::FetchError;
use crate::http::{HttpResponse, ResponseHead};

/// A decoded response body.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "lowercase")]
pub enum Payload {
    Json(serde_json::Value),
    Text(String),
    Bytes(Vec<u8>),
}

impl Payload {
    /// Decode `response` according to its content type.
    ///
    /// JSON types are parsed (an empty body decodes to `null`), text types
    /// become lossy UTF-8, and a missing content type falls back to text when
    /// the bytes are valid UTF-8.
    pub fn infer(response: &HttpResponse) -> Result<Self, FetchError> {
        match response.content_type() {
            Some(ct) if is_json_type(ct) => {
                if response.body.iter().all(u8::is_ascii_whitespace) {
                    return Ok(Payload::Json(serde_json::Value::Null));
                }
                serde_json::from_slice(&response.body)
                    .map(Payload::Json)
                    .map_err(|e| FetchError::Decode(e.to_string()))
            }
            Some(ct) if !classify_binary(ct) => {
                Ok(Payload::Text(String::from_utf8_lossy(&response.body).into_owned()))
            }
            Some(_) => Ok(Payload::Bytes(response.body.clone())),
            None => match String::from_utf8(response.body.clone()) {
                Ok(text) => Ok(Payload::Text(text)),
                Err(e) => Ok(Payload::Bytes(e.into_bytes())),
            },
        }
    }

    pub fn as_json(&self) -> Option<&serde_json::Value> {
        match self {
            Payload::Json(value) => Some(value),
            _ => None,
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            Payload::Text(text) => Some(text),
            _ => None,
        }
    }

    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Payload::Bytes(bytes) => Some(bytes),
            _ => None,
        }
    }
}

/// The success value of a request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Reply {
    pub payload: Payload,
    pub head: ResponseHead,
    /// Served from a cache store without contacting the transport.
    #[serde(skip)]
    pub from_cache: bool,
}

impl Reply {
    pub fn status(&self) -> u16 {
        self.head.status
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::Headers;

    fn response(content_type: Option<&str>, body: &[u8]) -> HttpResponse {
        let headers: Headers = content_type.map(|ct| ("Content-Type", ct)).into_iter().collect();
        HttpResponse {
            head: ResponseHead {
                status: 200,
                reason: Some("OK".into()),
                version: "1.1".into(),
                headers,
            },
            body: body.to_vec(),
        }
    }

    #[test]
    fn json_content_is_parsed() {
        let payload = Payload::infer(&response(Some("application/json"), br#"{"origin":"1.2.3.4"}"#)).unwrap();
        assert_eq!(payload.as_json().unwrap()["origin"], "1.2.3.4");
    }

    #[test]
    fn empty_json_body_is_null() {
        let payload = Payload::infer(&response(Some("application/json"), b"")).unwrap();
        assert_eq!(payload, Payload::Json(serde_json::Value::Null));
    }

    #[test]
    fn malformed_json_is_a_decode_error() {
        let err = Payload::infer(&response(Some("application/json"), b"not json")).unwrap_err();
        assert!(matches!(err, FetchError::Decode(_)));
    }

    #[test]
    fn text_and_binary_types() {
        let text = Payload::infer(&response(Some("text/plain; charset=utf-8"), b"hello")).unwrap();
        assert_eq!(text.as_text(), Some("hello"));

        let png = Payload::infer(&response(Some("image/png"), &[0x89, b'P', b'N', b'G'])).unwrap();
        assert_eq!(png.as_bytes(), Some(&[0x89, b'P', b'N', b'G'][..]));
    }

    #[test]
    fn untyped_body_falls_back_on_utf8_validity() {
        assert_eq!(Payload::infer(&response(None, b"plain")).unwrap().as_text(), Some("plain"));
        assert!(Payload::infer(&response(None, &[0xff, 0xfe])).unwrap().as_bytes().is_some());
    }

    #[test]
    fn reply_serializes_without_cache_flag() {
        let reply = Reply {
            payload: Payload::Text("x".into()),
            head: response(None, b"").head,
            from_cache: true,
        };
        let json = serde_json::to_value(&reply).unwrap();
        assert!(json.get("from_cache").is_none());
        assert_eq!(json["payload"], serde_json::json!({"kind": "text", "value": "x"}));
        let back: Reply = serde_json::from_value(json).unwrap();
        assert!(!back.from_cache);
    }
}
