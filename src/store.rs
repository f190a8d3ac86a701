use anyhow::{Context, Result, anyhow, bail};
use rusqlite::{Connection, OptionalExtension, params};
use std::collections::HashMap;
use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use crate::response::StoredResponse;

/// Prefix of every versioned runtime cache.
pub const RUNTIME_PREFIX: &str = "runtime-";

/// How cache names are derived for a deployed build.
#[derive(Debug, Clone, PartialEq)]
pub struct CacheNaming {
    /// Always survives garbage collection.
    pub precache: String,
    /// Long-lived HTML cache, used when no API version is resolvable.
    pub ssr: String,
}

impl CacheNaming {
    /// `runtime-<apiVersion>`, or the SSR cache when there is no version.
    pub fn for_version(&self, api_version: Option<&str>) -> String {
        match api_version {
            Some(v) if !v.is_empty() => format!("{RUNTIME_PREFIX}{v}"),
            _ => self.ssr.clone(),
        }
    }

    /// True for the caches that belong to the current deploy.
    pub fn is_current(&self, name: &str, api_version: &str) -> bool {
        name == self.ssr || name == self.for_version(Some(api_version))
    }
}

/// Eviction policy applied to a cache after each write and on periodic sweeps.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct ExpirationPolicy {
    pub max_entries: Option<u32>,
    pub max_age_seconds: Option<u64>,
}

/// Handle to one named cache. Cheap to clone; equal handles name the same cache.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheHandle {
    name: String,
}

impl CacheHandle {
    pub fn name(&self) -> &str {
        &self.name
    }
}

#[derive(Debug, Default)]
struct Policies {
    default: ExpirationPolicy,
    by_cache: HashMap<String, ExpirationPolicy>,
}

impl Policies {
    fn for_cache(&self, name: &str) -> ExpirationPolicy {
        self.by_cache.get(name).copied().unwrap_or(self.default)
    }
}

/// Versioned request/response store backed by SQLite in WAL mode.
pub struct CacheStore {
    conn: Mutex<Connection>,
    naming: CacheNaming,
    policies: Mutex<Policies>,
}

impl CacheStore {
    pub fn open_path(path: &Path, naming: CacheNaming) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).context("creating cache directory")?;
        }
        let conn = Connection::open(path).context("opening cache database")?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "synchronous", "NORMAL")?;
        conn.pragma_update(None, "busy_timeout", "5000")?;
        Self::from_connection(conn, naming)
    }

    #[cfg(test)]
    pub fn open_in_memory(naming: CacheNaming) -> Result<Self> {
        let conn = Connection::open_in_memory().context("opening in-memory cache database")?;
        Self::from_connection(conn, naming)
    }

    fn from_connection(conn: Connection, naming: CacheNaming) -> Result<Self> {
        conn.execute_batch(SCHEMA).context("creating cache tables")?;
        let store = Self {
            conn: Mutex::new(conn),
            naming,
            policies: Mutex::new(Policies::default()),
        };
        // The precache store exists from the start so it can never be "missing".
        store.open(&store.naming.precache.clone())?;
        Ok(store)
    }

    pub fn naming(&self) -> &CacheNaming {
        &self.naming
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| anyhow!("cache database lock poisoned"))
    }

    /// Open (creating if absent) the named cache. Idempotent.
    pub fn open(&self, name: &str) -> Result<CacheHandle> {
        if name.is_empty() {
            bail!("cache name must not be empty");
        }
        self.conn()?
            .execute("INSERT OR IGNORE INTO caches (name) VALUES (?1)", [name])
            .with_context(|| format!("opening cache {name}"))?;
        Ok(CacheHandle {
            name: name.to_string(),
        })
    }

    /// Look up a stored response. Read-only.
    pub fn lookup(&self, handle: &CacheHandle, path: &str) -> Result<Option<StoredResponse>> {
        let conn = self.conn()?;
        let row: Option<(i64, String, Vec<u8>)> = conn
            .query_row(
                "SELECT status, headers, body FROM entries WHERE cache_name = ?1 AND path = ?2",
                params![handle.name, path],
                |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?)),
            )
            .optional()
            .context("reading cache entry")?;
        drop(conn);

        let Some((status, headers, body)) = row else {
            return Ok(None);
        };
        let headers: Vec<(String, String)> =
            serde_json::from_str(&headers).context("parsing stored headers")?;
        Ok(Some(StoredResponse::new(status as u16, headers, body)))
    }

    pub fn contains(&self, handle: &CacheHandle, path: &str) -> Result<bool> {
        let count: i64 = self.conn()?.query_row(
            "SELECT COUNT(*) FROM entries WHERE cache_name = ?1 AND path = ?2",
            params![handle.name, path],
            |r| r.get(0),
        )?;
        Ok(count > 0)
    }

    /// Store a response under `path`, replacing any previous entry.
    /// Only status 200 is accepted; `Content-Length` is recomputed from the body.
    pub fn put(&self, handle: &CacheHandle, path: &str, response: StoredResponse) -> Result<()> {
        if !response.is_ok() {
            bail!(
                "refusing to cache {path} with status {}",
                response.status
            );
        }
        let response = response.with_content_length();
        let headers = serde_json::to_string(&response.headers).context("serializing headers")?;
        let now = chrono::Utc::now().timestamp();

        self.conn()?
            .execute(
                "INSERT OR REPLACE INTO entries (cache_name, path, status, headers, body, stored_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    handle.name,
                    path,
                    response.status as i64,
                    headers,
                    response.body,
                    now
                ],
            )
            .with_context(|| format!("writing {path} to cache {}", handle.name))?;

        tracing::debug!(cache = %handle.name, path, "stored response");
        self.expire(handle)?;
        Ok(())
    }

    /// Store raw page data: objects as JSON, everything else as HTML.
    pub fn put_payload(
        &self,
        handle: &CacheHandle,
        path: &str,
        payload: &serde_json::Value,
    ) -> Result<()> {
        self.put(handle, path, StoredResponse::from_payload(payload))
    }

    pub fn cache_names(&self) -> Result<Vec<String>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare("SELECT name FROM caches ORDER BY name")?;
        let names = stmt
            .query_map([], |r| r.get(0))?
            .collect::<Result<Vec<String>, _>>()?;
        Ok(names)
    }

    /// Delete one cache and all of its entries.
    pub fn delete(&self, name: &str) -> Result<bool> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        tx.execute("DELETE FROM entries WHERE cache_name = ?1", [name])?;
        let removed = tx.execute("DELETE FROM caches WHERE name = ?1", [name])?;
        tx.commit()?;
        Ok(removed > 0)
    }

    /// Delete every cache for which `keep` is false. The precache store is
    /// always preserved. Returns the names that were removed.
    pub fn evict_except<F>(&self, keep: F) -> Result<Vec<String>>
    where
        F: Fn(&str) -> bool,
    {
        let mut removed = Vec::new();
        for name in self.cache_names()? {
            if name == self.naming.precache || keep(&name) {
                continue;
            }
            if self.delete(&name)? {
                removed.push(name);
            }
        }
        if !removed.is_empty() {
            tracing::info!(removed = ?removed, "deleted caches");
        }
        Ok(removed)
    }

    /// Replace the policy of one cache, or the default policy when `cache_name` is None.
    pub fn set_policy(&self, cache_name: Option<&str>, policy: ExpirationPolicy) {
        let mut policies = self.policies.lock().unwrap_or_else(|e| e.into_inner());
        match cache_name {
            Some(name) => {
                policies.by_cache.insert(name.to_string(), policy);
            }
            None => policies.default = policy,
        }
    }

    pub fn policy(&self, cache_name: &str) -> ExpirationPolicy {
        self.policies
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .for_cache(cache_name)
    }

    /// Apply the cache's policy: drop entries older than max-age, then trim
    /// the oldest writes beyond max-entries. Returns the number removed.
    pub fn expire(&self, handle: &CacheHandle) -> Result<usize> {
        // The precache store is populated once per install and never expires.
        if handle.name == self.naming.precache {
            return Ok(0);
        }
        let policy = self.policy(&handle.name);
        let conn = self.conn()?;
        let mut removed = 0;

        // A max-age beyond the representable past keeps everything.
        let cutoff = policy.max_age_seconds.and_then(|max_age| {
            let max_age = i64::try_from(max_age).ok()?;
            chrono::Utc::now().timestamp().checked_sub(max_age)
        });
        if let Some(cutoff) = cutoff {
            removed += conn.execute(
                "DELETE FROM entries WHERE cache_name = ?1 AND stored_at < ?2",
                params![handle.name, cutoff],
            )?;
        }

        if let Some(max_entries) = policy.max_entries {
            removed += conn.execute(
                "DELETE FROM entries WHERE cache_name = ?1 AND rowid NOT IN (
                    SELECT rowid FROM entries WHERE cache_name = ?1
                    ORDER BY stored_at DESC, rowid DESC LIMIT ?2
                 )",
                params![handle.name, max_entries as i64],
            )?;
        }

        if removed > 0 {
            tracing::debug!(cache = %handle.name, removed, "expired entries");
        }
        Ok(removed)
    }

    /// Sweep every cache with its policy.
    pub fn expire_all(&self) -> Result<usize> {
        let mut removed = 0;
        for name in self.cache_names()? {
            removed += self.expire(&CacheHandle { name })?;
        }
        Ok(removed)
    }

    #[cfg(test)]
    pub fn entry_count(&self, name: &str) -> Result<u64> {
        let count: i64 = self.conn()?.query_row(
            "SELECT COUNT(*) FROM entries WHERE cache_name = ?1",
            [name],
            |r| r.get(0),
        )?;
        Ok(count as u64)
    }

    /// (name, entries, body bytes) for every cache.
    pub fn summaries(&self) -> Result<Vec<(String, u64, u64)>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT c.name, COUNT(e.path), COALESCE(SUM(LENGTH(e.body)), 0)
             FROM caches c LEFT JOIN entries e ON e.cache_name = c.name
             GROUP BY c.name ORDER BY c.name",
        )?;
        let rows = stmt
            .query_map([], |r| {
                Ok((
                    r.get::<_, String>(0)?,
                    r.get::<_, i64>(1)? as u64,
                    r.get::<_, i64>(2)? as u64,
                ))
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    #[cfg(test)]
    pub(crate) fn with_conn<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&Connection) -> Result<T>,
    {
        let conn = self.conn()?;
        f(&conn)
    }
}

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS caches (
    name       TEXT PRIMARY KEY,
    created_at TEXT NOT NULL DEFAULT (datetime('now'))
);

CREATE TABLE IF NOT EXISTS entries (
    cache_name TEXT NOT NULL,
    path       TEXT NOT NULL,
    status     INTEGER NOT NULL,
    headers    TEXT NOT NULL DEFAULT '[]',
    body       BLOB NOT NULL,
    stored_at  INTEGER NOT NULL,
    PRIMARY KEY (cache_name, path)
);

CREATE INDEX IF NOT EXISTS idx_entries_age ON entries(cache_name, stored_at);
"#;
