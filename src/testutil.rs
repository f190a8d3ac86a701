//! Shared doubles for unit tests.

use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::network::{FetchError, FetchRequest, Network};
use crate::response::StoredResponse;
use crate::store::{CacheNaming, CacheStore};

pub fn naming() -> CacheNaming {
    CacheNaming {
        precache: "precache".into(),
        ssr: "ssr-pages".into(),
    }
}

pub fn memory_store() -> Arc<CacheStore> {
    Arc::new(CacheStore::open_in_memory(naming()).unwrap())
}

pub fn json(body: &str) -> StoredResponse {
    StoredResponse::new(
        200,
        vec![("content-type".into(), "application/json".into())],
        body.as_bytes().to_vec(),
    )
}

/// In-memory origin: canned responses per path, a call log, and paths that
/// never answer until released.
#[derive(Default)]
pub struct MockNetwork {
    routes: Mutex<HashMap<String, Result<StoredResponse, FetchError>>>,
    stalled: Mutex<HashSet<String>>,
    calls: Mutex<Vec<FetchRequest>>,
}

impl MockNetwork {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn route(&self, path: &str, response: StoredResponse) {
        self.routes
            .lock()
            .unwrap()
            .insert(path.to_string(), Ok(response));
    }

    pub fn fail(&self, path: &str) {
        self.routes.lock().unwrap().insert(
            path.to_string(),
            Err(FetchError::Network("connection refused".into())),
        );
    }

    pub fn stall(&self, path: &str) {
        self.stalled.lock().unwrap().insert(path.to_string());
    }

    pub fn release_all(&self) {
        self.stalled.lock().unwrap().clear();
    }

    pub fn calls(&self) -> Vec<FetchRequest> {
        self.calls.lock().unwrap().clone()
    }

    pub fn call_paths(&self) -> Vec<String> {
        self.calls().into_iter().map(|c| c.path).collect()
    }

    pub fn call_count(&self, path: &str) -> usize {
        self.call_paths().iter().filter(|p| *p == path).count()
    }

    /// Poll until at least `n` calls were observed.
    pub async fn wait_for_calls(&self, n: usize) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while self.calls.lock().unwrap().len() < n {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
    }
}

#[async_trait]
impl Network for MockNetwork {
    async fn fetch(&self, req: FetchRequest) -> Result<StoredResponse, FetchError> {
        let path = req.path.clone();
        self.calls.lock().unwrap().push(req);

        let stalled = self.stalled.lock().unwrap().contains(&path);
        if stalled {
            std::future::pending::<()>().await;
        }
        self.routes
            .lock()
            .unwrap()
            .get(&path)
            .cloned()
            .unwrap_or_else(|| Ok(StoredResponse::new(404, Vec::new(), b"not found".to_vec())))
    }
}
