use async_trait::async_trait;
use axum::http::{HeaderMap, HeaderName, HeaderValue, Method};
use std::time::Duration;
use tokio::sync::watch;
use url::Url;

use crate::response::StoredResponse;

/// Failure to obtain any response from the origin.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum FetchError {
    /// The fetch was cancelled through its token.
    #[error("fetch aborted")]
    Aborted,
    #[error("network error: {0}")]
    Network(String),
}

/// An outgoing request, relative to the origin.
#[derive(Debug, Clone)]
pub struct FetchRequest {
    pub method: Method,
    /// Path plus query, always starting with `/`.
    pub path: String,
    pub headers: HeaderMap,
    pub body: Vec<u8>,
}

impl FetchRequest {
    pub fn get(path: impl Into<String>) -> Self {
        Self {
            method: Method::GET,
            path: path.into(),
            headers: HeaderMap::new(),
            body: Vec::new(),
        }
    }

    pub fn with_header(mut self, name: &'static str, value: &str) -> Self {
        if let Ok(v) = HeaderValue::from_str(value) {
            self.headers.insert(HeaderName::from_static(name), v);
        }
        self
    }
}

/// The network as seen by the runtime: one request in, one response out.
#[async_trait]
pub trait Network: Send + Sync {
    async fn fetch(&self, req: FetchRequest) -> Result<StoredResponse, FetchError>;
}

/// Run a fetch until it settles or the cancellation token is signalled.
/// A token whose sender is gone never fires.
pub async fn fetch_with_cancel(
    network: &dyn Network,
    req: FetchRequest,
    cancel: &mut watch::Receiver<bool>,
) -> Result<StoredResponse, FetchError> {
    let cancelled = async {
        let closed = cancel.wait_for(|c| *c).await.is_err();
        if closed {
            std::future::pending::<()>().await;
        }
    };
    tokio::select! {
        biased;
        _ = cancelled => Err(FetchError::Aborted),
        result = network.fetch(req) => result,
    }
}

// ── Origin client ────────────────────────────────────────────────

/// `reqwest`-backed client for the configured origin.
pub struct OriginClient {
    http: reqwest::Client,
    origin: Url,
}

impl OriginClient {
    pub fn new(origin: Url) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder()
            // Redirects belong to the page, not to the proxy.
            .redirect(reqwest::redirect::Policy::none())
            .connect_timeout(Duration::from_secs(10))
            .build()?;
        Ok(Self { http, origin })
    }
}

#[async_trait]
impl Network for OriginClient {
    async fn fetch(&self, req: FetchRequest) -> Result<StoredResponse, FetchError> {
        let url = self
            .origin
            .join(&req.path)
            .map_err(|e| FetchError::Network(format!("invalid path {}: {e}", req.path)))?;

        let mut builder = self.http.request(req.method.clone(), url);
        for (name, value) in &req.headers {
            if matches!(
                name.as_str(),
                "host" | "connection" | "transfer-encoding" | "content-length"
            ) {
                continue;
            }
            builder = builder.header(name, value);
        }
        if !req.body.is_empty() {
            builder = builder.body(req.body);
        }

        let resp = builder
            .send()
            .await
            .map_err(|e| FetchError::Network(e.to_string()))?;

        let status = resp.status().as_u16();
        let headers = resp
            .headers()
            .iter()
            .filter_map(|(k, v)| {
                v.to_str()
                    .ok()
                    .map(|v| (k.as_str().to_string(), v.to_string()))
            })
            .collect();
        let body = resp
            .bytes()
            .await
            .map_err(|e| FetchError::Network(format!("reading body: {e}")))?;

        Ok(StoredResponse::new(status, headers, body.to_vec()))
    }
}
