use anyhow::{Context, Result, bail};
use bytesize::ByteSize;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;
use url::Url;

use crate::lifecycle::LifecycleOptions;
use crate::prefetch::{PrefetchOptions, RampUpClock};
use crate::router::RouterOptions;
use crate::store::{CacheNaming, ExpirationPolicy};

const DEFAULT_LISTEN: &str = "127.0.0.1:8421";
const DEFAULT_ORIGIN: &str = "http://127.0.0.1:3000";

#[derive(Debug, Clone)]
pub struct Config {
    pub listen: SocketAddr,
    pub origin: Url,
    pub max_body_size: u64,
    /// Serve every request network-only.
    pub disabled: bool,
    pub cache_dir: PathBuf,
    pub api_version: Option<String>,
    pub precache_name: String,
    pub ssr_cache_name: String,
    pub max_entries: Option<u32>,
    pub max_age_seconds: Option<u64>,
    pub precache_paths: Vec<String>,
    pub precache_timeout: Duration,
    pub api_prefix: String,
    pub static_prefixes: Vec<String>,
    pub video_extensions: Vec<String>,
    pub lightweight_suffix: String,
    pub cache_query_param: String,
    pub cache_ssr: bool,
    pub app_shell_path: String,
    pub deploy_time: Option<DateTime<Utc>>,
    pub ramp_up: Duration,
    pub max_link_depth: u32,
    pub max_links_per_page: usize,
    pub install_clients: Vec<String>,
}

#[derive(Debug, Deserialize, Serialize, Default, Clone)]
pub(crate) struct FileConfig {
    pub(crate) proxy: Option<ProxyFileConfig>,
    pub(crate) cache: Option<CacheFileConfig>,
    pub(crate) routing: Option<RoutingFileConfig>,
    pub(crate) prefetch: Option<PrefetchFileConfig>,
}

#[derive(Debug, Deserialize, Serialize, Default, Clone)]
pub(crate) struct ProxyFileConfig {
    pub(crate) listen: Option<String>,
    pub(crate) origin: Option<String>,
    pub(crate) max_body_size: Option<String>,
    pub(crate) disabled: Option<bool>,
}

#[derive(Debug, Deserialize, Serialize, Default, Clone)]
pub(crate) struct CacheFileConfig {
    pub(crate) dir: Option<String>,
    pub(crate) api_version: Option<String>,
    pub(crate) precache_name: Option<String>,
    pub(crate) ssr_cache_name: Option<String>,
    /// 0 disables the limit.
    pub(crate) max_entries: Option<u32>,
    /// 0 disables the limit.
    pub(crate) max_age_seconds: Option<u64>,
    pub(crate) precache_paths: Option<Vec<String>>,
    pub(crate) precache_timeout_seconds: Option<u64>,
}

#[derive(Debug, Deserialize, Serialize, Default, Clone)]
pub(crate) struct RoutingFileConfig {
    pub(crate) api_prefix: Option<String>,
    pub(crate) static_prefixes: Option<Vec<String>>,
    pub(crate) video_extensions: Option<Vec<String>>,
    pub(crate) lightweight_suffix: Option<String>,
    pub(crate) cache_query_param: Option<String>,
    pub(crate) cache_ssr: Option<bool>,
    pub(crate) app_shell_path: Option<String>,
}

#[derive(Debug, Deserialize, Serialize, Default, Clone)]
pub(crate) struct PrefetchFileConfig {
    /// RFC 3339.
    pub(crate) deploy_time: Option<String>,
    pub(crate) ramp_up_seconds: Option<u64>,
    pub(crate) max_link_depth: Option<u32>,
    pub(crate) max_links_per_page: Option<usize>,
    pub(crate) install_clients: Option<Vec<String>>,
}

impl Config {
    /// Environment first, then the config file, then defaults.
    pub fn load() -> Result<Self> {
        let file = Self::load_file_config()?;
        Self::from_sources(&file, |key| std::env::var(key).ok())
    }

    fn load_file_config() -> Result<FileConfig> {
        let config_path = config_file_path();
        if !config_path.exists() {
            return Ok(FileConfig::default());
        }
        let content = std::fs::read_to_string(&config_path)
            .with_context(|| format!("reading {}", config_path.display()))?;
        toml::from_str(&content).with_context(|| format!("parsing {}", config_path.display()))
    }

    pub(crate) fn from_sources<F>(file: &FileConfig, env: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let proxy = file.proxy.clone().unwrap_or_default();
        let cache = file.cache.clone().unwrap_or_default();
        let routing = file.routing.clone().unwrap_or_default();
        let prefetch = file.prefetch.clone().unwrap_or_default();

        let listen = env("SWCACHE_LISTEN")
            .or(proxy.listen)
            .unwrap_or_else(|| DEFAULT_LISTEN.to_string());
        let listen: SocketAddr = listen
            .parse()
            .with_context(|| format!("invalid listen address {listen:?}"))?;

        let origin = env("SWCACHE_ORIGIN")
            .or(proxy.origin)
            .unwrap_or_else(|| DEFAULT_ORIGIN.to_string());
        let origin = Url::parse(&origin).with_context(|| format!("invalid origin {origin:?}"))?;
        if !matches!(origin.scheme(), "http" | "https") {
            bail!("origin must be http or https, got {origin}");
        }

        let max_body_size = match env("SWCACHE_MAX_BODY_SIZE").or(proxy.max_body_size) {
            Some(s) => parse_size(&s).with_context(|| format!("invalid max body size {s:?}"))?,
            None => 64 * 1024 * 1024, // 64 MiB
        };

        let disabled = env("SWCACHE_DISABLED")
            .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
            .or(proxy.disabled)
            .unwrap_or(false);

        let cache_dir = env("SWCACHE_CACHE_DIR")
            .map(PathBuf::from)
            .or_else(|| cache.dir.as_deref().map(shellexpand))
            .unwrap_or_else(default_cache_dir);

        let api_version = env("SWCACHE_API_VERSION")
            .or(cache.api_version)
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty());

        let deploy_time = match env("SWCACHE_DEPLOY_TIME").or(prefetch.deploy_time) {
            Some(s) => Some(
                DateTime::parse_from_rfc3339(s.trim())
                    .with_context(|| format!("invalid deploy time {s:?}"))?
                    .with_timezone(&Utc),
            ),
            None => None,
        };

        let ramp_up_seconds = match env("SWCACHE_RAMP_UP_SECS") {
            Some(s) => s
                .trim()
                .parse::<u64>()
                .with_context(|| format!("invalid SWCACHE_RAMP_UP_SECS {s:?}"))?,
            None => prefetch.ramp_up_seconds.unwrap_or(900),
        };

        Ok(Config {
            listen,
            origin,
            max_body_size,
            disabled,
            cache_dir,
            api_version,
            precache_name: cache.precache_name.unwrap_or_else(|| "precache".into()),
            ssr_cache_name: cache.ssr_cache_name.unwrap_or_else(|| "ssr-pages".into()),
            max_entries: Some(cache.max_entries.unwrap_or(200)).filter(|n| *n > 0),
            max_age_seconds: Some(cache.max_age_seconds.unwrap_or(86_400)).filter(|n| *n > 0),
            precache_paths: cache.precache_paths.unwrap_or_default(),
            precache_timeout: Duration::from_secs(cache.precache_timeout_seconds.unwrap_or(30)),
            api_prefix: routing.api_prefix.unwrap_or_else(|| "/api/".into()),
            static_prefixes: routing
                .static_prefixes
                .unwrap_or_else(|| vec!["/pwa/".into()]),
            video_extensions: routing.video_extensions.unwrap_or_else(|| {
                ["mp4", "webm", "ogv", "mov", "m4v"]
                    .map(String::from)
                    .to_vec()
            }),
            lightweight_suffix: routing.lightweight_suffix.unwrap_or_else(|| ".amp".into()),
            cache_query_param: routing
                .cache_query_param
                .unwrap_or_else(|| "sw_cache".into()),
            cache_ssr: routing.cache_ssr.unwrap_or(false),
            app_shell_path: routing
                .app_shell_path
                .unwrap_or_else(|| "/.app-shell".into()),
            deploy_time,
            ramp_up: Duration::from_secs(ramp_up_seconds),
            max_link_depth: prefetch.max_link_depth.unwrap_or(1),
            max_links_per_page: prefetch.max_links_per_page.unwrap_or(20),
            install_clients: prefetch.install_clients.unwrap_or_default(),
        })
    }

    pub fn db_path(&self) -> PathBuf {
        self.cache_dir.join("caches.db")
    }

    pub fn naming(&self) -> CacheNaming {
        CacheNaming {
            precache: self.precache_name.clone(),
            ssr: self.ssr_cache_name.clone(),
        }
    }

    pub fn default_policy(&self) -> ExpirationPolicy {
        ExpirationPolicy {
            max_entries: self.max_entries,
            max_age_seconds: self.max_age_seconds,
        }
    }

    pub fn prefetch_options(&self) -> PrefetchOptions {
        PrefetchOptions {
            origin: self.origin.clone(),
            clock: RampUpClock {
                deploy_time: self.deploy_time,
                window: self.ramp_up,
            },
            max_link_depth: self.max_link_depth,
            max_links_per_page: self.max_links_per_page,
            default_api_version: self.api_version.clone(),
            cache_query_param: self.cache_query_param.clone(),
        }
    }

    pub fn router_options(&self) -> RouterOptions {
        RouterOptions {
            api_prefix: self.api_prefix.clone(),
            static_prefixes: self.static_prefixes.clone(),
            video_extensions: self.video_extensions.clone(),
            lightweight_suffix: self.lightweight_suffix.clone(),
            cache_query_param: self.cache_query_param.clone(),
            cache_ssr: self.cache_ssr,
            default_api_version: self.api_version.clone(),
            disabled: self.disabled,
        }
    }

    pub fn lifecycle_options(&self) -> LifecycleOptions {
        LifecycleOptions {
            api_version: self.api_version.clone(),
            precache_paths: self.precache_paths.clone(),
            lightweight_suffix: self.lightweight_suffix.clone(),
            precache_timeout: self.precache_timeout,
        }
    }
}

pub(crate) fn default_cache_dir() -> PathBuf {
    dirs::cache_dir()
        .unwrap_or_else(|| PathBuf::from("/tmp"))
        .join("swcache")
}

pub(crate) fn config_file_path() -> PathBuf {
    if let Ok(path) = std::env::var("SWCACHE_CONFIG") {
        return PathBuf::from(path);
    }
    // XDG convention (~/.config) on all platforms
    let config_base = std::env::var("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| {
            dirs::home_dir()
                .unwrap_or_else(|| PathBuf::from("/tmp"))
                .join(".config")
        });
    config_base.join("swcache").join("config.toml")
}

fn shellexpand(s: &str) -> PathBuf {
    if let Some(rest) = s.strip_prefix("~/")
        && let Some(home) = dirs::home_dir()
    {
        return home.join(rest);
    }
    PathBuf::from(s)
}

pub(crate) fn parse_size(s: &str) -> Option<u64> {
    s.trim().parse::<ByteSize>().ok().map(|b| b.as_u64())
}
