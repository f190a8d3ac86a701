use anyhow::{Context, Result};
use std::sync::Arc;
use std::time::Duration;
use swcache_protocol::{
    CachePathRequest, CacheStateRequest, CacheSummary, Command, ConfigureRuntimeCachingRequest,
    StatusResponse,
};
use url::Url;

use crate::links;
use crate::network::{FetchRequest, Network};
use crate::prefetch::{PrefetchController, PrefetchTask};
use crate::store::{CacheStore, ExpirationPolicy};

/// A control message that could not be accepted.
#[derive(Debug, thiserror::Error)]
pub enum CommandError {
    #[error("malformed message: {0}")]
    Malformed(String),
    #[error("invalid {action} message: {reason}")]
    Invalid {
        action: &'static str,
        reason: String,
    },
}

/// Decode and validate one control message. Unknown actions are rejected.
pub fn parse_command(raw: &[u8]) -> Result<Command, CommandError> {
    let cmd: Command =
        serde_json::from_slice(raw).map_err(|e| CommandError::Malformed(e.to_string()))?;
    validate(&cmd).map_err(|reason| CommandError::Invalid {
        action: cmd.action(),
        reason: reason.to_string(),
    })?;
    Ok(cmd)
}

fn validate(cmd: &Command) -> Result<(), &'static str> {
    match cmd {
        Command::CachePath(CachePathRequest { path, .. })
        | Command::CacheState(CacheStateRequest { path, .. }) => {
            if path.trim().is_empty() {
                return Err("path must not be empty");
            }
        }
        Command::ConfigureRuntimeCaching(ConfigureRuntimeCachingRequest { options }) => {
            if options.cache_name.as_deref().is_some_and(str::is_empty) {
                return Err("cacheName must not be empty");
            }
            if options.max_entries == Some(0) {
                return Err("maxEntries must be positive");
            }
        }
        Command::RemoveOldCaches(req) => {
            if req.api_version.is_empty() {
                return Err("apiVersion must not be empty");
            }
        }
        Command::ClearCache
        | Command::AbortPrefetches
        | Command::ResumePrefetches
        | Command::Install(_) => {}
    }
    Ok(())
}

#[derive(Debug, Clone)]
pub struct LifecycleOptions {
    /// Version of the deployed build, when known at startup.
    pub api_version: Option<String>,
    pub precache_paths: Vec<String>,
    pub lightweight_suffix: String,
    /// Deadline for each precache fetch during install.
    pub precache_timeout: Duration,
}

impl Default for LifecycleOptions {
    fn default() -> Self {
        Self {
            api_version: None,
            precache_paths: Vec::new(),
            lightweight_suffix: String::new(),
            precache_timeout: Duration::from_secs(30),
        }
    }
}

/// Install-time garbage collection and control-message dispatch.
pub struct LifecycleManager {
    store: Arc<CacheStore>,
    network: Arc<dyn Network>,
    prefetch: Arc<PrefetchController>,
    options: LifecycleOptions,
}

impl LifecycleManager {
    pub fn new(
        store: Arc<CacheStore>,
        network: Arc<dyn Network>,
        prefetch: Arc<PrefetchController>,
        options: LifecycleOptions,
    ) -> Self {
        Self {
            store,
            network,
            prefetch,
            options,
        }
    }

    /// Drop caches of earlier builds, fill the precache, then warm the
    /// canonical page of every client open on a lightweight variant.
    /// Returns the number of warm-up prefetches started.
    pub async fn install(&self, clients: &[String]) -> Result<usize> {
        match &self.options.api_version {
            Some(version) => {
                let naming = self.store.naming().clone();
                self.store
                    .evict_except(|name| naming.is_current(name, version))
                    .context("removing stale caches")?;
            }
            None => tracing::info!("no api version configured, keeping existing caches"),
        }

        self.populate_precache().await?;

        let mut started = 0;
        for client in clients {
            let Some(path) = client_path(client) else {
                tracing::debug!(client = %client, "ignoring unparseable client url");
                continue;
            };
            let Some(canonical) =
                links::canonical_of_lightweight(&path, &self.options.lightweight_suffix)
            else {
                continue;
            };
            tracing::debug!(client = %client, canonical = %canonical, "warming canonical page for open client");
            let task = PrefetchTask::new(canonical, self.options.api_version.clone(), true);
            tokio::spawn(self.prefetch.prefetch(task));
            started += 1;
        }
        tracing::info!(clients = clients.len(), warming = started, "install complete");
        Ok(started)
    }

    async fn populate_precache(&self) -> Result<()> {
        if self.options.precache_paths.is_empty() {
            return Ok(());
        }
        let handle = self.store.open(&self.store.naming().precache)?;
        let fetches = self
            .options
            .precache_paths
            .iter()
            .map(|p| {
                let fetch = self.network.fetch(FetchRequest::get(p.clone()));
                tokio::time::timeout(self.options.precache_timeout, fetch)
            });
        let results = futures::future::join_all(fetches).await;

        let mut stored = 0;
        for (path, result) in self.options.precache_paths.iter().zip(results) {
            match result {
                Ok(Ok(resp)) if resp.is_ok() => {
                    self.store.put(&handle, path, resp)?;
                    stored += 1;
                }
                Ok(Ok(resp)) => {
                    tracing::warn!(path = %path, status = resp.status, "precache fetch returned non-200")
                }
                Ok(Err(e)) => tracing::warn!(path = %path, "precache fetch failed: {e}"),
                Err(_) => tracing::warn!(
                    path = %path,
                    timeout = ?self.options.precache_timeout,
                    "precache fetch timed out"
                ),
            }
        }
        tracing::info!(
            stored,
            total = self.options.precache_paths.len(),
            "precache populated"
        );
        Ok(())
    }

    /// Execute one decoded control message.
    pub async fn handle(&self, cmd: Command) -> Result<()> {
        let action = cmd.action();
        tracing::debug!(action, "handling control message");

        match cmd {
            Command::CachePath(req) => {
                let task = PrefetchTask::new(req.path, req.api_version, req.cache_links);
                let outcome = self.prefetch.prefetch(task).await;
                tracing::debug!(?outcome, "cache-path settled");
            }
            Command::CacheState(req) => {
                let version = req.api_version.or_else(|| self.options.api_version.clone());
                let name = self.store.naming().for_version(version.as_deref());
                let handle = self.store.open(&name)?;
                self.store
                    .put_payload(&handle, &req.path, &req.cache_data)
                    .with_context(|| format!("caching state for {}", req.path))?;
            }
            Command::ConfigureRuntimeCaching(req) => {
                let policy = ExpirationPolicy {
                    max_entries: req.options.max_entries,
                    max_age_seconds: req.options.max_age_seconds,
                };
                let scope = req.options.cache_name.as_deref();
                self.store.set_policy(scope, policy);
                let removed = match scope {
                    Some(name) => self.store.expire(&self.store.open(name)?)?,
                    None => self.store.expire_all()?,
                };
                tracing::info!(cache = ?scope, ?policy, removed, "runtime caching configured");
            }
            Command::RemoveOldCaches(req) => {
                let naming = self.store.naming().clone();
                self.store
                    .evict_except(|name| naming.is_current(name, &req.api_version))?;
            }
            Command::ClearCache => {
                self.store.evict_except(|_| false)?;
            }
            Command::AbortPrefetches => {
                self.prefetch.abort_all();
            }
            Command::ResumePrefetches => {
                self.prefetch.resume_all().await;
            }
            Command::Install(req) => {
                self.install(&req.clients).await?;
            }
        }
        Ok(())
    }

    pub fn status(&self) -> Result<StatusResponse> {
        let caches = self
            .store
            .summaries()?
            .into_iter()
            .map(|(name, entries, bytes)| CacheSummary {
                name,
                entries,
                bytes,
            })
            .collect();
        Ok(StatusResponse {
            version: crate::VERSION.to_string(),
            api_version: self.options.api_version.clone(),
            in_flight_prefetches: self.prefetch.in_flight_count(),
            resumable_prefetches: self.prefetch.resumable_count(),
            caches,
        })
    }
}

/// Path and query of a client URL; bare paths are accepted as-is.
fn client_path(client: &str) -> Option<String> {
    if client.starts_with('/') {
        return Some(client.to_string());
    }
    Url::parse(client).ok().map(|u| links::path_and_query(&u))
}
