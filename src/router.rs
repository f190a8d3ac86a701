use anyhow::Result;
use axum::http::{HeaderMap, Method, header};
use std::sync::Arc;
use swcache_protocol::{API_VERSION_HEADER, CACHE_DIRECTIVE_HEADER, CACHE_PROBE_HEADER};
use url::Url;

use crate::links;
use crate::network::{FetchRequest, Network};
use crate::offline::OfflineResponder;
use crate::prefetch::{PrefetchController, PrefetchTask};
use crate::response::StoredResponse;
use crate::store::CacheStore;

#[derive(Debug, Clone)]
pub struct RouterOptions {
    pub api_prefix: String,
    pub static_prefixes: Vec<String>,
    pub video_extensions: Vec<String>,
    pub lightweight_suffix: String,
    pub cache_query_param: String,
    /// Consult the cache for every SSR navigation.
    pub cache_ssr: bool,
    pub default_api_version: Option<String>,
    /// Serve everything network-only.
    pub disabled: bool,
}

/// How an intercepted request is served. Classification is first-match-wins
/// in declaration order.
#[derive(Debug, Clone, PartialEq)]
pub enum RequestClass {
    /// Neither TLS nor loopback: the origin handles the redirect.
    Insecure,
    StaticAsset,
    VideoAsset,
    CacheProbe,
    ApiResource,
    SsrNavigation {
        cacheable: bool,
        /// Canonical page of the lightweight variant that linked here.
        lightweight_referrer: Option<String>,
    },
    Passthrough,
}

/// Per-request strategy selection over cache, network and offline fallback.
pub struct RuntimeRouter {
    store: Arc<CacheStore>,
    network: Arc<dyn Network>,
    prefetch: Arc<PrefetchController>,
    offline: OfflineResponder,
    options: RouterOptions,
}

impl RuntimeRouter {
    pub fn new(
        store: Arc<CacheStore>,
        network: Arc<dyn Network>,
        prefetch: Arc<PrefetchController>,
        offline: OfflineResponder,
        options: RouterOptions,
    ) -> Self {
        Self {
            store,
            network,
            prefetch,
            offline,
            options,
        }
    }

    pub fn classify(&self, req: &FetchRequest) -> RequestClass {
        if !is_secure(&req.headers) {
            return RequestClass::Insecure;
        }
        let path = req.path.split(['?', '#']).next().unwrap_or("");
        if self
            .options
            .static_prefixes
            .iter()
            .any(|p| path.starts_with(p.as_str()))
        {
            return RequestClass::StaticAsset;
        }
        if has_extension(path, &self.options.video_extensions) {
            return RequestClass::VideoAsset;
        }
        if req.method != Method::GET {
            return RequestClass::Passthrough;
        }
        if req.headers.contains_key(CACHE_PROBE_HEADER) {
            return RequestClass::CacheProbe;
        }
        if path.starts_with(&self.options.api_prefix) {
            return RequestClass::ApiResource;
        }
        if is_navigation(&req.headers) {
            let lightweight_referrer = req
                .headers
                .get(header::REFERER)
                .and_then(|v| v.to_str().ok())
                .and_then(|r| Url::parse(r).ok())
                .and_then(|u| {
                    links::canonical_of_lightweight(
                        &links::path_and_query(&u),
                        &self.options.lightweight_suffix,
                    )
                });
            let cacheable = self.options.cache_ssr
                || lightweight_referrer.is_some()
                || links::has_query_param(&req.path, &self.options.cache_query_param);
            return RequestClass::SsrNavigation {
                cacheable,
                lightweight_referrer,
            };
        }
        RequestClass::Passthrough
    }

    /// Serve one intercepted request. Always resolves to a response: any
    /// failure inside a caching strategy degrades to network-only.
    pub async fn handle(&self, req: FetchRequest) -> StoredResponse {
        if self.options.disabled {
            return self.network_only(&req).await;
        }
        let class = self.classify(&req);
        tracing::debug!(method = %req.method, path = %req.path, class = ?class, "intercepted");

        match self.respond(&class, &req).await {
            Ok(resp) => resp,
            Err(e) => {
                tracing::warn!(path = %req.path, "caching strategy failed, going network-only: {e:#}");
                self.network_only(&req).await
            }
        }
    }

    async fn respond(&self, class: &RequestClass, req: &FetchRequest) -> Result<StoredResponse> {
        match class {
            RequestClass::Insecure | RequestClass::VideoAsset | RequestClass::Passthrough => {
                Ok(self.network_only(req).await)
            }
            RequestClass::StaticAsset => self.precache_first(req).await,
            RequestClass::CacheProbe => self.cache_only(req),
            RequestClass::ApiResource => self.cache_first(req, true, None).await,
            RequestClass::SsrNavigation {
                cacheable: true,
                lightweight_referrer,
            } => {
                self.cache_first(req, false, lightweight_referrer.as_deref())
                    .await
            }
            RequestClass::SsrNavigation {
                cacheable: false, ..
            } => Ok(self.network_or_offline(req).await),
        }
    }

    fn api_version(&self, req: &FetchRequest) -> Option<String> {
        req.headers
            .get(API_VERSION_HEADER)
            .and_then(|v| v.to_str().ok())
            .filter(|v| !v.is_empty())
            .map(str::to_string)
            .or_else(|| self.options.default_api_version.clone())
    }

    fn cache_only(&self, req: &FetchRequest) -> Result<StoredResponse> {
        let key = links::cache_key(&req.path, &self.options.cache_query_param);
        let version = self.api_version(req);
        let handle = self
            .store
            .open(&self.store.naming().for_version(version.as_deref()))?;
        match self.store.lookup(&handle, &key)? {
            Some(hit) => Ok(hit),
            None => {
                tracing::debug!(path = %key, "cache probe miss");
                Ok(StoredResponse::empty(204))
            }
        }
    }

    /// On a hit, `warm_on_hit` names a canonical page to prefetch in the background.
    async fn cache_first(
        &self,
        req: &FetchRequest,
        is_api: bool,
        warm_on_hit: Option<&str>,
    ) -> Result<StoredResponse> {
        let key = links::cache_key(&req.path, &self.options.cache_query_param);
        let version = self.api_version(req);
        let handle = self
            .store
            .open(&self.store.naming().for_version(version.as_deref()))?;

        if let Some(hit) = self.store.lookup(&handle, &key)? {
            tracing::debug!(path = %key, cache = handle.name(), "cache hit");
            if let Some(canonical) = warm_on_hit {
                self.warm(canonical, version);
            }
            return Ok(hit);
        }

        let resp = match self.network.fetch(req.clone()).await {
            Ok(resp) => resp,
            Err(e) => {
                tracing::info!(path = %key, "network failed, serving offline response: {e}");
                return Ok(self.offline.respond(version.as_deref(), &req.path));
            }
        };

        // API entries need a version so they land in a build-scoped cache.
        let storable = resp.is_ok()
            && resp.header(CACHE_DIRECTIVE_HEADER).is_some()
            && (version.is_some() || !is_api);
        if storable && let Err(e) = self.store.put(&handle, &key, resp.clone()) {
            tracing::warn!(path = %key, cache = handle.name(), "failed to store response: {e:#}");
        }
        Ok(resp)
    }

    async fn precache_first(&self, req: &FetchRequest) -> Result<StoredResponse> {
        let handle = self.store.open(&self.store.naming().precache)?;
        let key = req.path.split('#').next().unwrap_or("");
        if let Some(hit) = self.store.lookup(&handle, key)? {
            return Ok(hit);
        }
        Ok(self.network_only(req).await)
    }

    async fn network_or_offline(&self, req: &FetchRequest) -> StoredResponse {
        match self.network.fetch(req.clone()).await {
            Ok(resp) => resp,
            Err(e) => {
                tracing::info!(path = %req.path, "network failed, serving offline response: {e}");
                self.offline
                    .respond(self.api_version(req).as_deref(), &req.path)
            }
        }
    }

    async fn network_only(&self, req: &FetchRequest) -> StoredResponse {
        match self.network.fetch(req.clone()).await {
            Ok(resp) => resp,
            Err(e) => {
                tracing::warn!(path = %req.path, "origin unreachable: {e}");
                StoredResponse::bad_gateway(&e.to_string())
            }
        }
    }

    /// Background prefetch of a full page, links included.
    fn warm(&self, path: &str, api_version: Option<String>) {
        tracing::debug!(path, "warming canonical page of lightweight referrer");
        let task = PrefetchTask::new(path, api_version, true);
        tokio::spawn(self.prefetch.prefetch(task));
    }
}

/// TLS as reported by a fronting proxy, or a loopback host.
fn is_secure(headers: &HeaderMap) -> bool {
    let forwarded_https = headers
        .get("x-forwarded-proto")
        .and_then(|v| v.to_str().ok())
        .is_some_and(|p| p.trim().eq_ignore_ascii_case("https"));
    if forwarded_https {
        return true;
    }
    let Some(host) = headers.get(header::HOST).and_then(|v| v.to_str().ok()) else {
        return false;
    };
    let hostname = match host.strip_prefix('[') {
        Some(rest) => rest.split(']').next().unwrap_or(""),
        None => host.split(':').next().unwrap_or(""),
    };
    matches!(hostname, "localhost" | "127.0.0.1" | "::1")
}

fn is_navigation(headers: &HeaderMap) -> bool {
    let mode = headers.get("sec-fetch-mode").and_then(|v| v.to_str().ok());
    let accept = headers.get(header::ACCEPT).and_then(|v| v.to_str().ok());
    mode == Some("navigate") || accept.is_some_and(|a| a.contains("text/html"))
}

fn has_extension(path: &str, extensions: &[String]) -> bool {
    let file = path.rsplit('/').next().unwrap_or("");
    file.rsplit_once('.')
        .is_some_and(|(_, ext)| extensions.iter().any(|e| e.eq_ignore_ascii_case(ext)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::prefetch::{PrefetchOptions, RampUpClock};
    use crate::testutil::{MockNetwork, json, memory_store};

    fn options() -> RouterOptions {
        RouterOptions {
            api_prefix: "/api/".into(),
            static_prefixes: vec!["/pwa/".into()],
            video_extensions: vec!["mp4".into(), "webm".into()],
            lightweight_suffix: ".amp".into(),
            cache_query_param: "sw_cache".into(),
            cache_ssr: false,
            default_api_version: None,
            disabled: false,
        }
    }

    fn router_with(
        net: &Arc<MockNetwork>,
        options: RouterOptions,
    ) -> (RuntimeRouter, Arc<CacheStore>) {
        let store = memory_store();
        let network = net.clone() as Arc<dyn Network>;
        let prefetch = Arc::new(PrefetchController::new(
            store.clone(),
            network.clone(),
            PrefetchOptions {
                origin: Url::parse("http://localhost:3000").unwrap(),
                clock: RampUpClock::open(),
                max_link_depth: 1,
                max_links_per_page: 20,
                default_api_version: None,
                cache_query_param: "sw_cache".into(),
            },
        ));
        let offline = OfflineResponder::new(store.clone(), "/api/".into(), "/.app-shell".into());
        let router = RuntimeRouter::new(store.clone(), network, prefetch, offline, options);
        (router, store)
    }

    fn router(net: &Arc<MockNetwork>) -> (RuntimeRouter, Arc<CacheStore>) {
        router_with(net, options())
    }

    fn get(path: &str) -> FetchRequest {
        FetchRequest::get(path).with_header("host", "localhost:8421")
    }

    fn navigate(path: &str) -> FetchRequest {
        get(path).with_header("accept", "text/html,application/xhtml+xml")
    }

    fn api(path: &str, version: &str) -> FetchRequest {
        get(path).with_header(API_VERSION_HEADER, version)
    }

    fn cacheable_json(body: &str) -> StoredResponse {
        let mut resp = json(body);
        resp.set_header(CACHE_DIRECTIVE_HEADER, "max-age=300");
        resp
    }

    fn cached(store: &CacheStore, cache: &str, path: &str) -> Option<StoredResponse> {
        let h = store.open(cache).unwrap();
        store.lookup(&h, path).unwrap()
    }

    // ── Classification ──────────────────────────────────────────

    #[test]
    fn test_classify_order() {
        let net = MockNetwork::new();
        let (r, _) = router(&net);

        let insecure = FetchRequest::get("/api/p/1").with_header("host", "shop.example.com");
        assert_eq!(r.classify(&insecure), RequestClass::Insecure);

        let forwarded = FetchRequest::get("/api/p/1")
            .with_header("host", "shop.example.com")
            .with_header("x-forwarded-proto", "https");
        assert_eq!(r.classify(&forwarded), RequestClass::ApiResource);

        assert_eq!(r.classify(&get("/pwa/main.js")), RequestClass::StaticAsset);
        assert_eq!(r.classify(&get("/media/intro.MP4")), RequestClass::VideoAsset);
        assert_eq!(
            r.classify(&api("/api/p/1", "v1").with_header(CACHE_PROBE_HEADER, "1")),
            RequestClass::CacheProbe
        );
        assert_eq!(r.classify(&api("/api/p/1", "v1")), RequestClass::ApiResource);
        assert_eq!(r.classify(&get("/favicon.ico")), RequestClass::Passthrough);
    }

    #[test]
    fn test_classify_static_before_probe() {
        let net = MockNetwork::new();
        let (r, _) = router(&net);
        let req = get("/pwa/app.js").with_header(CACHE_PROBE_HEADER, "1");
        assert_eq!(r.classify(&req), RequestClass::StaticAsset);
    }

    #[test]
    fn test_classify_post_passes_through() {
        let net = MockNetwork::new();
        let (r, _) = router(&net);
        let mut req = api("/api/cart", "v1");
        req.method = Method::POST;
        assert_eq!(r.classify(&req), RequestClass::Passthrough);
    }

    #[test]
    fn test_classify_loopback_hosts_secure() {
        let net = MockNetwork::new();
        let (r, _) = router(&net);
        for host in ["localhost", "127.0.0.1:8421", "[::1]:8421"] {
            let req = FetchRequest::get("/api/p/1").with_header("host", host);
            assert_eq!(r.classify(&req), RequestClass::ApiResource, "{host}");
        }
    }

    #[test]
    fn test_classify_ssr_navigation_signals() {
        let net = MockNetwork::new();
        let (r, _) = router(&net);

        assert_eq!(
            r.classify(&navigate("/p/1")),
            RequestClass::SsrNavigation {
                cacheable: false,
                lightweight_referrer: None
            }
        );
        assert_eq!(
            r.classify(&navigate("/p/1?sw_cache=1")),
            RequestClass::SsrNavigation {
                cacheable: true,
                lightweight_referrer: None
            }
        );
        let from_amp =
            navigate("/p/1").with_header("referer", "https://shop.example.com/c/shoes.amp?page=2");
        assert_eq!(
            r.classify(&from_amp),
            RequestClass::SsrNavigation {
                cacheable: true,
                lightweight_referrer: Some("/c/shoes?page=2".into())
            }
        );
        let nav_mode = get("/p/1").with_header("sec-fetch-mode", "navigate");
        assert!(matches!(
            r.classify(&nav_mode),
            RequestClass::SsrNavigation { .. }
        ));
    }

    #[test]
    fn test_classify_ssr_override() {
        let net = MockNetwork::new();
        let mut opts = options();
        opts.cache_ssr = true;
        let (r, _) = router_with(&net, opts);
        assert_eq!(
            r.classify(&navigate("/p/1")),
            RequestClass::SsrNavigation {
                cacheable: true,
                lightweight_referrer: None
            }
        );
    }

    // ── Cache probe ─────────────────────────────────────────────

    #[tokio::test]
    async fn test_cache_probe_miss_is_204_without_network() {
        let net = MockNetwork::new();
        net.route("/api/p/1", json("{}"));
        let (r, _) = router(&net);

        let resp = r
            .handle(api("/api/p/1", "v1").with_header(CACHE_PROBE_HEADER, "1"))
            .await;

        assert_eq!(resp.status, 204);
        assert!(resp.body.is_empty());
        assert!(net.calls().is_empty());
    }

    #[tokio::test]
    async fn test_cache_probe_hit() {
        let net = MockNetwork::new();
        let (r, store) = router(&net);
        let h = store.open("runtime-v1").unwrap();
        store.put(&h, "/api/p/1", json(r#"{"id":1}"#)).unwrap();

        let resp = r
            .handle(api("/api/p/1", "v1").with_header(CACHE_PROBE_HEADER, "1"))
            .await;

        assert_eq!(resp.status, 200);
        assert_eq!(resp.body, br#"{"id":1}"#);
        assert!(net.calls().is_empty());
    }

    // ── API resources ───────────────────────────────────────────

    #[tokio::test]
    async fn test_api_hit_skips_network() {
        let net = MockNetwork::new();
        let (r, store) = router(&net);
        let h = store.open("runtime-v1").unwrap();
        store.put(&h, "/api/p/1", json(r#"{"id":1}"#)).unwrap();

        let resp = r.handle(api("/api/p/1", "v1")).await;
        assert_eq!(resp.body, br#"{"id":1}"#);
        assert!(net.calls().is_empty());
    }

    #[tokio::test]
    async fn test_api_miss_stores_with_directive() {
        let net = MockNetwork::new();
        net.route("/api/p/1", cacheable_json(r#"{"id":1}"#));
        let (r, store) = router(&net);

        let resp = r.handle(api("/api/p/1", "v1")).await;
        assert_eq!(resp.status, 200);
        assert!(cached(&store, "runtime-v1", "/api/p/1").is_some());

        // Second request is served from cache
        r.handle(api("/api/p/1", "v1")).await;
        assert_eq!(net.call_count("/api/p/1"), 1);
    }

    #[tokio::test]
    async fn test_api_miss_without_directive_not_stored() {
        let net = MockNetwork::new();
        net.route("/api/p/1", json(r#"{"id":1}"#));
        let (r, store) = router(&net);

        let resp = r.handle(api("/api/p/1", "v1")).await;
        assert_eq!(resp.status, 200);
        assert!(cached(&store, "runtime-v1", "/api/p/1").is_none());
    }

    #[tokio::test]
    async fn test_api_without_version_not_stored() {
        let net = MockNetwork::new();
        net.route("/api/p/1", cacheable_json(r#"{"id":1}"#));
        let (r, store) = router(&net);

        r.handle(get("/api/p/1")).await;
        assert_eq!(store.entry_count("ssr-pages").unwrap(), 0);
    }

    #[tokio::test]
    async fn test_api_default_version_used() {
        let net = MockNetwork::new();
        net.route("/api/p/1", cacheable_json(r#"{"id":1}"#));
        let mut opts = options();
        opts.default_api_version = Some("v9".into());
        let (r, store) = router_with(&net, opts);

        r.handle(get("/api/p/1")).await;
        assert!(cached(&store, "runtime-v9", "/api/p/1").is_some());
    }

    #[tokio::test]
    async fn test_api_offline_fallback() {
        let net = MockNetwork::new();
        net.fail("/api/p/9");
        let (r, _) = router(&net);

        let resp = r.handle(api("/api/p/9", "v1")).await;
        assert_eq!(resp.status, 200);
        let body: serde_json::Value = serde_json::from_slice(&resp.body).unwrap();
        assert_eq!(body, serde_json::json!({"page": "Offline"}));
    }

    #[tokio::test]
    async fn test_api_error_status_returned_as_is() {
        let net = MockNetwork::new();
        net.route("/api/p/404", StoredResponse::empty(404));
        let (r, store) = router(&net);

        let resp = r.handle(api("/api/p/404", "v1")).await;
        assert_eq!(resp.status, 404);
        assert_eq!(store.entry_count("runtime-v1").unwrap(), 0);
    }

    // ── SSR navigations ─────────────────────────────────────────

    #[tokio::test]
    async fn test_ssr_not_cacheable_is_network_only() {
        let net = MockNetwork::new();
        let (r, store) = router(&net);
        let h = store.open("ssr-pages").unwrap();
        store
            .put(&h, "/p/1", StoredResponse::html(200, "stale"))
            .unwrap();
        let mut page = StoredResponse::html(200, "fresh");
        page.set_header(CACHE_DIRECTIVE_HEADER, "1");
        net.route("/p/1", page);

        let resp = r.handle(navigate("/p/1")).await;
        assert_eq!(resp.body_text(), "fresh");
        assert_eq!(net.call_count("/p/1"), 1);
    }

    #[tokio::test]
    async fn test_ssr_offline_serves_app_shell() {
        let net = MockNetwork::new();
        net.fail("/p/1");
        let (r, store) = router(&net);
        let h = store.open("ssr-pages").unwrap();
        store
            .put(&h, "/.app-shell", StoredResponse::html(200, "<div id=app></div>"))
            .unwrap();

        let resp = r.handle(navigate("/p/1")).await;
        assert_eq!(resp.status, 200);
        assert_eq!(resp.body_text(), "<div id=app></div>");
    }

    #[tokio::test]
    async fn test_ssr_offline_without_shell_is_503() {
        let net = MockNetwork::new();
        net.fail("/p/1");
        let (r, _) = router(&net);

        let resp = r.handle(navigate("/p/1")).await;
        assert_eq!(resp.status, 503);
    }

    #[tokio::test]
    async fn test_ssr_marker_caches_without_marker_key() {
        let net = MockNetwork::new();
        let mut page = StoredResponse::html(200, "<p>1</p>");
        page.set_header(CACHE_DIRECTIVE_HEADER, "1");
        net.route("/p/1?sw_cache=1", page);
        let (r, store) = router(&net);

        r.handle(navigate("/p/1?sw_cache=1")).await;
        assert!(cached(&store, "ssr-pages", "/p/1").is_some());

        let hit = r.handle(navigate("/p/1?sw_cache=1")).await;
        assert_eq!(hit.body_text(), "<p>1</p>");
        assert_eq!(net.calls().len(), 1);
    }

    #[tokio::test]
    async fn test_lightweight_referrer_warms_canonical_page() {
        let net = MockNetwork::new();
        net.route(
            "/c/shoes",
            StoredResponse::html(200, r#"<a href="/p/1" data-prefetch>1</a>"#),
        );
        net.route("/p/1", StoredResponse::html(200, "<p>1</p>"));
        let (r, store) = router(&net);
        let h = store.open("ssr-pages").unwrap();
        store
            .put(&h, "/p/1", StoredResponse::html(200, "<p>cached</p>"))
            .unwrap();

        let req = navigate("/p/1").with_header("referer", "http://localhost:8421/c/shoes.amp");
        let resp = r.handle(req).await;
        assert_eq!(resp.body_text(), "<p>cached</p>");

        net.wait_for_calls(1).await;
        tokio::time::timeout(std::time::Duration::from_secs(5), async {
            while cached(&store, "ssr-pages", "/c/shoes").is_none() {
                tokio::time::sleep(std::time::Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
        assert_eq!(net.call_count("/c/shoes"), 1);
        // /p/1 was already cached, so the link prefetch skips it
        assert_eq!(net.call_count("/p/1"), 0);
    }

    #[tokio::test]
    async fn test_lightweight_referrer_miss_does_not_warm() {
        let net = MockNetwork::new();
        net.route("/c/shoes", StoredResponse::html(200, "<p>shoes</p>"));
        net.route("/p/1", StoredResponse::html(200, "<p>1</p>"));
        let (r, _) = router(&net);

        let req = navigate("/p/1").with_header("referer", "http://localhost:8421/c/shoes.amp");
        let resp = r.handle(req).await;
        assert_eq!(resp.body_text(), "<p>1</p>");

        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        assert_eq!(net.call_paths(), vec!["/p/1"]);
    }

    // ── Other routes ────────────────────────────────────────────

    #[tokio::test]
    async fn test_static_asset_from_precache() {
        let net = MockNetwork::new();
        net.route("/pwa/other.js", StoredResponse::new(200, Vec::new(), b"net".to_vec()));
        let (r, store) = router(&net);
        let pre = store.open("precache").unwrap();
        store
            .put(&pre, "/pwa/main.js", StoredResponse::new(200, Vec::new(), b"pre".to_vec()))
            .unwrap();

        assert_eq!(r.handle(get("/pwa/main.js")).await.body, b"pre");
        assert_eq!(r.handle(get("/pwa/other.js")).await.body, b"net");
        assert_eq!(net.call_paths(), vec!["/pwa/other.js"]);
    }

    #[tokio::test]
    async fn test_insecure_goes_to_origin_even_when_cached() {
        let net = MockNetwork::new();
        net.route("/api/p/1", StoredResponse::empty(301));
        let (r, store) = router(&net);
        let h = store.open("runtime-v1").unwrap();
        store.put(&h, "/api/p/1", json("{}")).unwrap();

        let req = FetchRequest::get("/api/p/1")
            .with_header("host", "shop.example.com")
            .with_header(API_VERSION_HEADER, "v1");
        assert_eq!(r.handle(req).await.status, 301);
    }

    #[tokio::test]
    async fn test_video_never_cached() {
        let net = MockNetwork::new();
        net.fail("/media/intro.mp4");
        let (r, _) = router(&net);
        let resp = r.handle(get("/media/intro.mp4")).await;
        assert_eq!(resp.status, 502);
    }

    #[tokio::test]
    async fn test_disabled_is_network_only() {
        let net = MockNetwork::new();
        net.route("/api/p/1", json(r#"{"fresh":true}"#));
        let mut opts = options();
        opts.disabled = true;
        let (r, store) = router_with(&net, opts);
        let h = store.open("runtime-v1").unwrap();
        store.put(&h, "/api/p/1", json(r#"{"fresh":false}"#)).unwrap();

        let resp = r
            .handle(api("/api/p/1", "v1").with_header(CACHE_PROBE_HEADER, "1"))
            .await;
        assert_eq!(resp.body, br#"{"fresh":true}"#);
    }

    #[tokio::test]
    async fn test_broken_store_degrades_to_network() {
        let net = MockNetwork::new();
        net.route("/api/p/1", json(r#"{"id":1}"#));
        let (r, store) = router(&net);
        store
            .with_conn(|c| {
                c.execute_batch("DROP TABLE entries")?;
                Ok(())
            })
            .unwrap();

        let resp = r.handle(api("/api/p/1", "v1")).await;
        assert_eq!(resp.status, 200);
        assert_eq!(resp.body, br#"{"id":1}"#);
    }

    #[tokio::test]
    async fn test_failed_store_write_serves_fetched_response_once() {
        let net = MockNetwork::new();
        net.route("/api/p/1", cacheable_json(r#"{"id":1}"#));
        let (r, store) = router(&net);
        store
            .with_conn(|c| {
                c.execute_batch(
                    "CREATE TRIGGER reject_writes BEFORE INSERT ON entries
                     BEGIN SELECT RAISE(ABORT, 'disk full'); END;",
                )?;
                Ok(())
            })
            .unwrap();

        let resp = r.handle(api("/api/p/1", "v1")).await;
        assert_eq!(resp.status, 200);
        assert_eq!(resp.body, br#"{"id":1}"#);
        assert_eq!(net.call_count("/api/p/1"), 1);
        assert!(cached(&store, "runtime-v1", "/api/p/1").is_none());
    }
}
