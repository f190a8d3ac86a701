use axum::body::Body;
use axum::http::{HeaderName, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use serde_json::Value;

/// Hop-by-hop headers never stored or replayed.
const HOP_BY_HOP: &[&str] = &["connection", "keep-alive", "transfer-encoding", "upgrade"];

/// Offline page served when the app shell itself is not cached.
const OFFLINE_PAGE: &str = "<!DOCTYPE html><html><head><meta charset=\"utf-8\"><title>Offline</title></head>\
<body><h1>You are offline</h1><p>This page is not available without a connection.</p></body></html>";

/// A fully buffered HTTP response, as stored in and served from the cache.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredResponse {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

impl StoredResponse {
    pub fn new(status: u16, headers: Vec<(String, String)>, body: Vec<u8>) -> Self {
        let headers = headers
            .into_iter()
            .map(|(k, v)| (k.to_ascii_lowercase(), v))
            .filter(|(k, _)| !HOP_BY_HOP.contains(&k.as_str()))
            .collect();
        Self {
            status,
            headers,
            body,
        }
        .with_content_length()
    }

    /// A JSON body with the matching content type.
    pub fn json(status: u16, value: &Value) -> Self {
        let body = serde_json::to_vec(value).unwrap_or_else(|_| b"null".to_vec());
        Self::new(
            status,
            vec![("content-type".into(), "application/json".into())],
            body,
        )
    }

    pub fn html(status: u16, body: impl Into<String>) -> Self {
        Self::new(
            status,
            vec![("content-type".into(), "text/html; charset=utf-8".into())],
            body.into().into_bytes(),
        )
    }

    pub fn empty(status: u16) -> Self {
        Self::new(status, Vec::new(), Vec::new())
    }

    pub fn offline_page() -> Self {
        Self::html(503, OFFLINE_PAGE)
    }

    pub fn bad_gateway(reason: &str) -> Self {
        Self::new(
            502,
            vec![("content-type".into(), "text/plain; charset=utf-8".into())],
            format!("upstream error: {reason}").into_bytes(),
        )
    }

    /// Wrap raw data handed over by the page layer: objects and arrays become
    /// JSON, strings are taken as HTML, other scalars are rendered as text.
    pub fn from_payload(payload: &Value) -> Self {
        match payload {
            Value::Object(_) | Value::Array(_) => Self::json(200, payload),
            Value::String(s) => Self::html(200, s.as_str()),
            other => Self::html(200, other.to_string()),
        }
    }

    /// Case-insensitive header lookup.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn set_header(&mut self, name: &str, value: impl Into<String>) {
        let name = name.to_ascii_lowercase();
        self.headers.retain(|(k, _)| *k != name);
        self.headers.push((name, value.into()));
    }

    /// Overwrite `Content-Length` with the real body length.
    pub fn with_content_length(mut self) -> Self {
        let len = self.body.len().to_string();
        self.set_header("content-length", len);
        self
    }

    pub fn is_ok(&self) -> bool {
        self.status == 200
    }

    #[cfg(test)]
    pub fn is_json(&self) -> bool {
        self.header("content-type")
            .is_some_and(|ct| ct.contains("json"))
    }

    pub fn is_html(&self) -> bool {
        self.header("content-type")
            .is_none_or(|ct| ct.contains("html"))
    }

    pub fn body_text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }
}

impl IntoResponse for StoredResponse {
    fn into_response(self) -> Response {
        let status = StatusCode::from_u16(self.status).unwrap_or(StatusCode::BAD_GATEWAY);
        let mut builder = Response::builder().status(status);
        for (name, value) in &self.headers {
            if let (Ok(n), Ok(v)) = (
                HeaderName::from_bytes(name.as_bytes()),
                HeaderValue::from_str(value),
            ) {
                builder = builder.header(n, v);
            }
        }
        builder.body(Body::from(self.body)).unwrap_or_else(|e| {
            tracing::error!("failed to build response: {e}");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        })
    }
}
