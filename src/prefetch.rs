use chrono::{DateTime, Utc};
use futures::future::{BoxFuture, join_all};
use rand::Rng;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use swcache_protocol::{API_VERSION_HEADER, EDGE_CACHE_MISS_STATUS, PREFETCH_HEADER};
use tokio::sync::watch;
use url::Url;

use crate::links;
use crate::network::{FetchError, FetchRequest, Network, fetch_with_cancel};
use crate::store::CacheStore;

/// Arguments of one speculative fetch. Captured verbatim for resumption.
#[derive(Debug, Clone, PartialEq)]
pub struct PrefetchTask {
    pub path: String,
    pub api_version: Option<String>,
    pub cache_links: bool,
    /// Link-recursion depth; 0 for tasks requested from outside.
    pub depth: u32,
}

impl PrefetchTask {
    pub fn new(path: impl Into<String>, api_version: Option<String>, cache_links: bool) -> Self {
        Self {
            path: path.into(),
            api_version,
            cache_links,
            depth: 0,
        }
    }
}

// ── Ramp-up gate ────────────────────────────────────────────────

/// Progressive enablement of prefetching after a deploy.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RampUpClock {
    pub deploy_time: Option<DateTime<Utc>>,
    pub window: Duration,
}

impl RampUpClock {
    /// A gate that always admits.
    #[cfg(test)]
    pub fn open() -> Self {
        Self {
            deploy_time: None,
            window: Duration::ZERO,
        }
    }

    /// `min(1, elapsed / window)`. A deploy time in the future counts as zero elapsed.
    pub fn probability_at(&self, now: DateTime<Utc>) -> f64 {
        let Some(deployed) = self.deploy_time else {
            return 1.0;
        };
        if self.window.is_zero() {
            return 1.0;
        }
        let elapsed = (now - deployed).to_std().unwrap_or(Duration::ZERO);
        (elapsed.as_secs_f64() / self.window.as_secs_f64()).min(1.0)
    }

    /// `roll` is uniform in `[0, 1)`; admitted when it falls below the probability.
    pub fn admits(&self, now: DateTime<Utc>, roll: f64) -> bool {
        roll < self.probability_at(now)
    }
}

fn roll() -> f64 {
    rand::thread_rng().r#gen::<f64>()
}

// ── Outcomes ────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    CrossOrigin,
    RampUp,
    AlreadyCached,
}

#[derive(Debug, Clone, PartialEq)]
pub enum PrefetchOutcome {
    Skipped(SkipReason),
    /// Stored; `links` counts the child prefetches issued.
    Cached { links: usize },
    EdgeCacheMiss,
    Failed(String),
    Aborted,
}

// ── Controller ──────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct PrefetchOptions {
    pub origin: Url,
    pub clock: RampUpClock,
    pub max_link_depth: u32,
    pub max_links_per_page: usize,
    /// Used when a task carries no version of its own.
    pub default_api_version: Option<String>,
    pub cache_query_param: String,
}

struct InFlight {
    task: PrefetchTask,
    cancel: watch::Sender<bool>,
}

/// Issues, tracks, cancels and resumes speculative fetches.
///
/// The abort registry holds one cancellation token per outstanding fetch; the
/// resume registry holds the arguments of fetches cut short by [`abort_all`].
/// Neither is persisted. Resumption order is unspecified.
///
/// [`abort_all`]: PrefetchController::abort_all
pub struct PrefetchController {
    store: Arc<CacheStore>,
    network: Arc<dyn Network>,
    options: PrefetchOptions,
    next_id: AtomicU64,
    in_flight: Mutex<HashMap<u64, InFlight>>,
    resumable: Mutex<Vec<PrefetchTask>>,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

impl PrefetchController {
    pub fn new(store: Arc<CacheStore>, network: Arc<dyn Network>, options: PrefetchOptions) -> Self {
        Self {
            store,
            network,
            options,
            next_id: AtomicU64::new(1),
            in_flight: Mutex::new(HashMap::new()),
            resumable: Mutex::new(Vec::new()),
        }
    }

    pub fn in_flight_count(&self) -> usize {
        lock(&self.in_flight).len()
    }

    pub fn resumable_count(&self) -> usize {
        lock(&self.resumable).len()
    }

    /// Prefetch one path and, when asked, the prefetch-marked links of its body.
    /// Resolves once the fetch and any child prefetches have settled.
    pub fn prefetch(self: &Arc<Self>, task: PrefetchTask) -> BoxFuture<'static, PrefetchOutcome> {
        let this = Arc::clone(self);
        Box::pin(async move { this.run(task).await })
    }

    async fn run(self: Arc<Self>, task: PrefetchTask) -> PrefetchOutcome {
        let Some(path) = links::same_origin_path(&task.path, &self.options.origin) else {
            tracing::debug!(path = %task.path, "prefetch: not same-origin, skipping");
            return PrefetchOutcome::Skipped(SkipReason::CrossOrigin);
        };
        let key = links::cache_key(&path, &self.options.cache_query_param);

        if !self.options.clock.admits(Utc::now(), roll()) {
            tracing::debug!(path = %key, "prefetch: held back by ramp-up window");
            return PrefetchOutcome::Skipped(SkipReason::RampUp);
        }

        let api_version = task
            .api_version
            .clone()
            .or_else(|| self.options.default_api_version.clone());
        let cache_name = self.store.naming().for_version(api_version.as_deref());
        let handle = match self.store.open(&cache_name) {
            Ok(h) => h,
            Err(e) => {
                tracing::warn!(cache = %cache_name, "prefetch: cache unavailable: {e:#}");
                return PrefetchOutcome::Failed(e.to_string());
            }
        };
        match self.store.contains(&handle, &key) {
            Ok(true) => {
                tracing::debug!(path = %key, "prefetch: already cached");
                return PrefetchOutcome::Skipped(SkipReason::AlreadyCached);
            }
            Ok(false) => {}
            Err(e) => tracing::warn!(path = %key, "prefetch: cache lookup failed: {e:#}"),
        }

        let (cancel, mut cancel_rx) = watch::channel(false);
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        lock(&self.in_flight).insert(
            id,
            InFlight {
                task: task.clone(),
                cancel,
            },
        );

        let mut req = FetchRequest::get(key.clone()).with_header(PREFETCH_HEADER, "true");
        if let Some(v) = &api_version {
            req = req.with_header(API_VERSION_HEADER, v);
        }
        let result = fetch_with_cancel(self.network.as_ref(), req, &mut cancel_rx).await;
        lock(&self.in_flight).remove(&id);

        let mut response = match result {
            Ok(resp) => resp,
            Err(FetchError::Aborted) => {
                tracing::debug!(path = %key, "prefetch: aborted");
                return PrefetchOutcome::Aborted;
            }
            Err(FetchError::Network(e)) => {
                tracing::warn!(path = %key, "prefetch: network error: {e}");
                return PrefetchOutcome::Failed(e);
            }
        };

        if response.status == EDGE_CACHE_MISS_STATUS {
            tracing::info!(path = %key, "prefetch: edge cache miss, not retrying");
            return PrefetchOutcome::EdgeCacheMiss;
        }
        if !response.is_ok() {
            tracing::warn!(path = %key, status = response.status, "prefetch: unexpected status");
            return PrefetchOutcome::Failed(format!("status {}", response.status));
        }

        response.set_header("date", http_date(Utc::now()));
        let body = response.body_text();
        let is_html = response.is_html();
        if let Err(e) = self.store.put(&handle, &key, response) {
            tracing::warn!(path = %key, cache = %cache_name, "prefetch: store failed: {e:#}");
            return PrefetchOutcome::Failed(e.to_string());
        }
        tracing::info!(path = %key, cache = %cache_name, "prefetched");

        if !task.cache_links || !is_html || task.depth >= self.options.max_link_depth {
            return PrefetchOutcome::Cached { links: 0 };
        }

        let mut found: Vec<String> = Vec::new();
        for link in links::prefetch_links(&body, &self.options.origin) {
            let link = links::cache_key(&link, &self.options.cache_query_param);
            if link != key && !found.contains(&link) {
                found.push(link);
            }
        }
        if found.len() > self.options.max_links_per_page {
            tracing::debug!(
                path = %key,
                found = found.len(),
                limit = self.options.max_links_per_page,
                "prefetch: truncating link fan-out"
            );
            found.truncate(self.options.max_links_per_page);
        }

        let count = found.len();
        let children = found.into_iter().map(|link| {
            self.prefetch(PrefetchTask {
                path: link,
                api_version: task.api_version.clone(),
                cache_links: true,
                depth: task.depth + 1,
            })
        });
        join_all(children).await;
        PrefetchOutcome::Cached { links: count }
    }

    /// Cancel every outstanding prefetch, capturing its arguments for
    /// [`resume_all`](Self::resume_all). Returns how many were cancelled.
    pub fn abort_all(&self) -> usize {
        let drained: Vec<InFlight> = lock(&self.in_flight).drain().map(|(_, f)| f).collect();
        let count = drained.len();
        {
            let mut resumable = lock(&self.resumable);
            resumable.extend(drained.iter().map(|f| f.task.clone()));
        }
        for f in drained {
            let _ = f.cancel.send(true);
        }
        if count > 0 {
            tracing::info!(count, "aborted in-flight prefetches");
        }
        count
    }

    /// Re-issue every captured task once. The registry is emptied before any
    /// task runs, so tasks aborted again during the replay are kept for the next resume.
    pub async fn resume_all(self: &Arc<Self>) -> Vec<PrefetchOutcome> {
        let tasks = std::mem::take(&mut *lock(&self.resumable));
        if tasks.is_empty() {
            return Vec::new();
        }
        tracing::info!(count = tasks.len(), "resuming prefetches");
        join_all(tasks.into_iter().map(|t| self.prefetch(t))).await
    }
}

/// IMF-fixdate, as used by the HTTP `Date` header.
fn http_date(t: DateTime<Utc>) -> String {
    t.format("%a, %d %b %Y %H:%M:%S GMT").to_string()
}
