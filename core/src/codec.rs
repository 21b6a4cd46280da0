//! Body and query encoding, and text/binary classification.
//!
//! Everything here is a pure function of its input apart from reading the
//! files named by multipart uploads.

use std::path::{Path, PathBuf};

use crate::error::FetchError;
use crate::http::Headers;

/// Boundary token separating multipart/form-data parts.
pub const MULTIPART_BOUNDARY: &str = "facade-form-boundary-a7c3e91f0b2d";

/// A request body as supplied by the caller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Body {
    Text(String),
    Bytes(Vec<u8>),
    Form(Vec<(String, FormValue)>),
}

impl Body {
    pub fn form<K, V, I>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<FormValue>,
    {
        Body::Form(pairs.into_iter().map(|(k, v)| (k.into(), v.into())).collect())
    }

    /// Value of the first form entry named `name`.
    pub fn entry(&self, name: &str) -> Option<&FormValue> {
        match self {
            Body::Form(pairs) => pairs.iter().find(|(k, _)| k == name).map(|(_, v)| v),
            _ => None,
        }
    }

    fn has_file(&self) -> bool {
        matches!(self, Body::Form(pairs) if pairs.iter().any(|(_, v)| matches!(v, FormValue::File { .. })))
    }
}

impl From<&str> for Body {
    fn from(s: &str) -> Self {
        Body::Text(s.to_string())
    }
}

impl From<String> for Body {
    fn from(s: String) -> Self {
        Body::Text(s)
    }
}

impl From<Vec<u8>> for Body {
    fn from(bytes: Vec<u8>) -> Self {
        Body::Bytes(bytes)
    }
}

/// One value of a form body: plain text or a file reference.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FormValue {
    Text(String),
    File { path: PathBuf, mime: Option<String> },
}

impl FormValue {
    pub fn file(path: impl Into<PathBuf>) -> Self {
        FormValue::File { path: path.into(), mime: None }
    }

    pub fn file_with_mime(path: impl Into<PathBuf>, mime: impl Into<String>) -> Self {
        FormValue::File {
            path: path.into(),
            mime: Some(mime.into()),
        }
    }
}

impl From<&str> for FormValue {
    fn from(s: &str) -> Self {
        FormValue::Text(s.to_string())
    }
}

impl From<String> for FormValue {
    fn from(s: String) -> Self {
        FormValue::Text(s)
    }
}

/// Result of `encode_body`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncodedBody {
    pub bytes: Vec<u8>,
    /// Request headers, possibly with `Content-Type` updated.
    pub headers: Headers,
    pub binary: bool,
}

/// `k=v&k2=v2` with form percent-encoding of keys and values.
pub fn encode_query<I, K, V>(pairs: I) -> String
where
    I: IntoIterator<Item = (K, V)>,
    K: AsRef<str>,
    V: AsRef<str>,
{
    let mut serializer = url::form_urlencoded::Serializer::new(String::new());
    for (k, v) in pairs {
        serializer.append_pair(k.as_ref(), v.as_ref());
    }
    serializer.finish()
}

/// Serialize `body` for the wire.
///
/// Decision table, first match wins:
/// - text: sent as-is
/// - bytes: sent as-is, binary
/// - form with a file entry: multipart/form-data, binary
/// - form with a `*/json` content type: JSON object, binary
/// - form otherwise: urlencoded
pub fn encode_body(body: &Body, headers: &Headers) -> Result<EncodedBody, FetchError> {
    let mut headers = headers.clone();
    let (bytes, binary) = match body {
        Body::Text(text) => (text.as_bytes().to_vec(), false),
        Body::Bytes(bytes) => (bytes.clone(), true),
        Body::Form(pairs) if body.has_file() => {
            headers.set(
                "Content-Type",
                format!("multipart/form-data; boundary={MULTIPART_BOUNDARY}"),
            );
            (encode_multipart(pairs)?, true)
        }
        Body::Form(pairs) if headers.get("content-type").is_some_and(is_json_type) => {
            let object: serde_json::Map<String, serde_json::Value> = pairs
                .iter()
                .map(|(k, v)| (k.clone(), form_value_json(v)))
                .collect();
            let bytes = serde_json::to_vec(&object)
                .map_err(|e| FetchError::InvalidRequest(format!("cannot encode JSON body: {e}")))?;
            (bytes, true)
        }
        Body::Form(pairs) => {
            let text = encode_query(pairs.iter().map(|(k, v)| (k.as_str(), form_value_text(v))));
            (text.into_bytes(), false)
        }
    };
    Ok(EncodedBody { bytes, headers, binary })
}

/// Whether a response with this content type must be handled as raw bytes.
pub fn classify_binary(content_type: &str) -> bool {
    let essence = content_type
        .split(';')
        .next()
        .unwrap_or_default()
        .trim()
        .to_ascii_lowercase();
    let Some((kind, subtype)) = essence.split_once('/') else {
        return true;
    };
    match kind {
        "text" => false,
        "application" => !["json", "xml", "javascript", "php", "x-www-form-urlencoded"]
            .iter()
            .any(|marker| subtype.contains(marker)),
        _ => true,
    }
}

pub(crate) fn is_json_type(content_type: &str) -> bool {
    let essence = content_type.split(';').next().unwrap_or_default().trim();
    essence
        .split_once('/')
        .is_some_and(|(_, subtype)| subtype.eq_ignore_ascii_case("json") || subtype.to_ascii_lowercase().ends_with("+json"))
}

/// Content type for an upload, from its file extension.
pub fn guess_mime(path: &Path) -> &'static str {
    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase())
        .unwrap_or_default();
    match ext.as_str() {
        "txt" | "text" | "log" => "text/plain",
        "html" | "htm" => "text/html",
        "css" => "text/css",
        "csv" => "text/csv",
        "js" => "application/javascript",
        "json" => "application/json",
        "xml" => "application/xml",
        "png" => "image/png",
        "jpg" | "jpeg" => "image/jpeg",
        "gif" => "image/gif",
        "svg" => "image/svg+xml",
        "webp" => "image/webp",
        "pdf" => "application/pdf",
        "zip" => "application/zip",
        "gz" => "application/gzip",
        "mp3" => "audio/mpeg",
        "mp4" => "video/mp4",
        _ => "application/octet-stream",
    }
}

fn form_value_text(value: &FormValue) -> String {
    match value {
        FormValue::Text(text) => text.clone(),
        FormValue::File { path, .. } => path.display().to_string(),
    }
}

fn form_value_json(value: &FormValue) -> serde_json::Value {
    match value {
        FormValue::Text(text) => serde_json::Value::String(text.clone()),
        FormValue::File { path, .. } => serde_json::Value::String(path.display().to_string()),
    }
}

/// Quoted `Content-Disposition` parameter value, with `"`, CR and LF
/// percent-encoded the way browsers submit forms.
fn disposition_param(value: &str) -> String {
    value.replace('"', "%22").replace('\r', "%0D").replace('\n', "%0A")
}

fn encode_multipart(pairs: &[(String, FormValue)]) -> Result<Vec<u8>, FetchError> {
    let mut out = Vec::new();
    for (name, value) in pairs {
        out.extend_from_slice(format!("--{MULTIPART_BOUNDARY}\r\n").as_bytes());
        match value {
            FormValue::Text(text) => {
                out.extend_from_slice(
                    format!(
                        "Content-Disposition: form-data; name=\"{}\"\r\n\r\n",
                        disposition_param(name)
                    )
                    .as_bytes(),
                );
                out.extend_from_slice(text.as_bytes());
            }
            FormValue::File { path, mime } => {
                let content = std::fs::read(path).map_err(|e| {
                    FetchError::InvalidRequest(format!("cannot read upload {}: {e}", path.display()))
                })?;
                let filename = path
                    .file_name()
                    .map(|n| n.to_string_lossy().into_owned())
                    .unwrap_or_default();
                let mime = mime.as_deref().unwrap_or_else(|| guess_mime(path));
                out.extend_from_slice(
                    format!(
                        "Content-Disposition: form-data; name=\"{}\"; filename=\"{}\"\r\nContent-Type: {mime}\r\n\r\n",
                        disposition_param(name),
                        disposition_param(&filename)
                    )
                    .as_bytes(),
                );
                out.extend_from_slice(&content);
            }
        }
        out.extend_from_slice(b"\r\n");
    }
    out.extend_from_slice(format!("--{MULTIPART_BOUNDARY}--\r\n").as_bytes());
    Ok(out)
}
