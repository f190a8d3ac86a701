use serde::{Deserialize, Serialize};

// ── Headers and statuses ────────────────────────────────

/// API build-version identifier sent by the page layer.
pub const API_VERSION_HEADER: &str = "x-api-version";
/// Marks speculative traffic so the origin can tell it apart.
pub const PREFETCH_HEADER: &str = "x-sw-prefetch";
/// Requests CacheOnly semantics with a 204 on miss.
pub const CACHE_PROBE_HEADER: &str = "x-sw-cache-only";
/// Set by the origin on responses that may be stored in the runtime cache.
pub const CACHE_DIRECTIVE_HEADER: &str = "x-sw-cache-control";
/// Edge throttled a prefetch: never cache, never retry.
pub const EDGE_CACHE_MISS_STATUS: u16 = 412;

// ── Control endpoints ───────────────────────────────────

pub const MESSAGE_PATH: &str = "/_swcache/message";
pub const STATUS_PATH: &str = "/_swcache/status";

// ── Commands (POST _swcache/message body) ───────────────

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "action", rename_all = "kebab-case")]
pub enum Command {
    CachePath(CachePathRequest),
    CacheState(CacheStateRequest),
    ConfigureRuntimeCaching(ConfigureRuntimeCachingRequest),
    RemoveOldCaches(RemoveOldCachesRequest),
    ClearCache,
    AbortPrefetches,
    ResumePrefetches,
    /// Open page clients, reported by the host since a proxy cannot enumerate tabs.
    Install(InstallRequest),
}

impl Command {
    /// The wire tag, for logging.
    pub fn action(&self) -> &'static str {
        match self {
            Command::CachePath(_) => "cache-path",
            Command::CacheState(_) => "cache-state",
            Command::ConfigureRuntimeCaching(_) => "configure-runtime-caching",
            Command::RemoveOldCaches(_) => "remove-old-caches",
            Command::ClearCache => "clear-cache",
            Command::AbortPrefetches => "abort-prefetches",
            Command::ResumePrefetches => "resume-prefetches",
            Command::Install(_) => "install",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CachePathRequest {
    pub path: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_version: Option<String>,
    #[serde(default)]
    pub cache_links: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CacheStateRequest {
    pub path: String,
    /// Objects are stored as JSON, anything else as HTML.
    pub cache_data: serde_json::Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_version: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RuntimeCachingOptions {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cache_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_entries: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_age_seconds: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ConfigureRuntimeCachingRequest {
    pub options: RuntimeCachingOptions,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RemoveOldCachesRequest {
    pub api_version: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct InstallRequest {
    #[serde(default)]
    pub clients: Vec<String>,
}

// ── Acknowledgement ─────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Ack {
    pub ok: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub action: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl Ack {
    pub fn accepted(action: &str) -> Self {
        Self {
            ok: true,
            action: Some(action.to_string()),
            error: None,
        }
    }

    pub fn rejected(msg: impl Into<String>) -> Self {
        Self {
            ok: false,
            action: None,
            error: Some(msg.into()),
        }
    }
}

// ── Status (GET _swcache/status response) ───────────────

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StatusResponse {
    pub version: String,
    #[serde(default)]
    pub api_version: Option<String>,
    pub in_flight_prefetches: usize,
    pub resumable_prefetches: usize,
    pub caches: Vec<CacheSummary>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CacheSummary {
    pub name: String,
    pub entries: u64,
    pub bytes: u64,
}
