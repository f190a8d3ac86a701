use serde_json::json;
use std::sync::Arc;

use crate::response::StoredResponse;
use crate::store::CacheStore;

/// Synthesizes responses when neither cache nor network can answer.
pub struct OfflineResponder {
    store: Arc<CacheStore>,
    api_prefix: String,
    app_shell_path: String,
}

impl OfflineResponder {
    pub fn new(store: Arc<CacheStore>, api_prefix: String, app_shell_path: String) -> Self {
        Self {
            store,
            api_prefix,
            app_shell_path,
        }
    }

    /// API requests get `{"page":"Offline"}` with status 200 so the page layer
    /// can render its offline state. Everything else gets the cached app shell,
    /// or the built-in offline page (503) when the shell is not cached.
    pub fn respond(&self, api_version: Option<&str>, path: &str) -> StoredResponse {
        if path.starts_with(&self.api_prefix) {
            return StoredResponse::json(200, &json!({ "page": "Offline" }));
        }

        let cache_name = self.store.naming().for_version(api_version);
        let shell = self
            .store
            .open(&cache_name)
            .and_then(|h| self.store.lookup(&h, &self.app_shell_path));
        match shell {
            Ok(Some(resp)) => resp,
            Ok(None) => {
                tracing::warn!(cache = %cache_name, path, "app shell not cached, serving offline page");
                StoredResponse::offline_page()
            }
            Err(e) => {
                tracing::warn!(cache = %cache_name, "app shell lookup failed: {e:#}");
                StoredResponse::offline_page()
            }
        }
    }
}
