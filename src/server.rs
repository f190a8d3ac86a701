use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use axum::body::Bytes;
use axum::extract::{Request, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use swcache_protocol::{Ack, Command, MESSAGE_PATH, STATUS_PATH};

use crate::config::Config;
use crate::lifecycle::{LifecycleManager, parse_command};
use crate::network::{FetchRequest, Network, OriginClient};
use crate::offline::OfflineResponder;
use crate::prefetch::PrefetchController;
use crate::router::RuntimeRouter;
use crate::store::CacheStore;

/// Interval of the background expiration sweep.
const SWEEP_INTERVAL: Duration = Duration::from_secs(300);

// ── Runtime wiring ──────────────────────────────────────────────

/// The five components, constructed once and shared by every handler.
pub struct Runtime {
    pub store: Arc<CacheStore>,
    pub router: RuntimeRouter,
    pub lifecycle: LifecycleManager,
}

impl Runtime {
    pub fn new(config: &Config, store: Arc<CacheStore>, network: Arc<dyn Network>) -> Self {
        store.set_policy(None, config.default_policy());
        let prefetch = Arc::new(PrefetchController::new(
            store.clone(),
            network.clone(),
            config.prefetch_options(),
        ));
        let offline = OfflineResponder::new(
            store.clone(),
            config.api_prefix.clone(),
            config.app_shell_path.clone(),
        );
        let router = RuntimeRouter::new(
            store.clone(),
            network.clone(),
            prefetch.clone(),
            offline,
            config.router_options(),
        );
        let lifecycle = LifecycleManager::new(
            store.clone(),
            network,
            prefetch,
            config.lifecycle_options(),
        );
        Self {
            store,
            router,
            lifecycle,
        }
    }
}

// ── Shared state ────────────────────────────────────────────────

#[derive(Clone)]
pub struct AppState {
    runtime: Arc<Runtime>,
    max_body_size: usize,
}

impl AppState {
    pub fn new(runtime: Arc<Runtime>, max_body_size: u64) -> Self {
        Self {
            runtime,
            max_body_size: usize::try_from(max_body_size).unwrap_or(usize::MAX),
        }
    }
}

// ── Router ──────────────────────────────────────────────────────

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route(MESSAGE_PATH, post(message))
        .route(STATUS_PATH, get(status))
        // Catch-all: every other request is intercepted
        .fallback(intercept)
        .with_state(state)
}

async fn health() -> &'static str {
    "ok"
}

// ── Control channel ─────────────────────────────────────────────

/// Prefetch-driven commands may take a while; they are acknowledged
/// immediately and run in the background.
fn runs_in_background(cmd: &Command) -> bool {
    matches!(
        cmd,
        Command::CachePath(_) | Command::ResumePrefetches | Command::Install(_)
    )
}

async fn message(State(state): State<AppState>, body: Bytes) -> Response {
    let cmd = match parse_command(&body) {
        Ok(cmd) => cmd,
        Err(e) => {
            tracing::warn!("ignoring control message: {e}");
            return (StatusCode::BAD_REQUEST, Json(Ack::rejected(e.to_string()))).into_response();
        }
    };
    let action = cmd.action();

    if runs_in_background(&cmd) {
        let runtime = state.runtime.clone();
        tokio::spawn(async move {
            if let Err(e) = runtime.lifecycle.handle(cmd).await {
                tracing::warn!(action, "control message failed: {e:#}");
            }
        });
        return (StatusCode::ACCEPTED, Json(Ack::accepted(action))).into_response();
    }

    match state.runtime.lifecycle.handle(cmd).await {
        Ok(()) => (StatusCode::OK, Json(Ack::accepted(action))).into_response(),
        Err(e) => {
            tracing::warn!(action, "control message failed: {e:#}");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(Ack::rejected(format!("{e:#}"))),
            )
                .into_response()
        }
    }
}

async fn status(State(state): State<AppState>) -> Response {
    match state.runtime.lifecycle.status() {
        Ok(status) => Json(status).into_response(),
        Err(e) => (StatusCode::INTERNAL_SERVER_ERROR, format!("{e:#}")).into_response(),
    }
}

// ── Intercept (catch-all) ───────────────────────────────────────

async fn intercept(State(state): State<AppState>, req: Request) -> Response {
    let method = req.method().clone();
    let path = req
        .uri()
        .path_and_query()
        .map(|pq| pq.as_str().to_string())
        .unwrap_or_else(|| "/".to_string());
    let headers = req.headers().clone();

    let body = match axum::body::to_bytes(req.into_body(), state.max_body_size).await {
        Ok(b) => b,
        Err(e) => {
            return (StatusCode::BAD_REQUEST, format!("failed to read body: {e}")).into_response();
        }
    };

    let fetch = FetchRequest {
        method,
        path,
        headers,
        body: body.to_vec(),
    };
    state.runtime.router.handle(fetch).await.into_response()
}

// ── Serve ───────────────────────────────────────────────────────

pub async fn serve(config: Config) -> Result<()> {
    use tracing::info;

    let store = Arc::new(CacheStore::open_path(&config.db_path(), config.naming())?);
    info!("cache database opened at {}", config.db_path().display());

    let network: Arc<dyn Network> = Arc::new(OriginClient::new(config.origin.clone())?);
    let runtime = Arc::new(Runtime::new(&config, store, network));

    let listener = tokio::net::TcpListener::bind(config.listen)
        .await
        .with_context(|| format!("binding {}", config.listen))?;
    info!("swcache listening on http://{}", config.listen);
    info!("origin is {}", config.origin);

    // Startup must not wait on the origin.
    if config.disabled {
        info!("caching disabled, serving network-only");
    } else {
        let runtime = runtime.clone();
        let clients = config.install_clients.clone();
        tokio::spawn(async move {
            if let Err(e) = runtime.lifecycle.install(&clients).await {
                tracing::warn!("install failed, continuing with existing caches: {e:#}");
            }
        });
    }

    let sweeper = tokio::spawn(sweep_loop(runtime.store.clone()));

    let app = router(AppState::new(runtime, config.max_body_size));

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    sweeper.abort();
    info!("server stopped");
    Ok(())
}

async fn sweep_loop(store: Arc<CacheStore>) {
    let mut interval = tokio::time::interval(SWEEP_INTERVAL);
    loop {
        interval.tick().await;
        match store.expire_all() {
            Ok(0) => {}
            Ok(removed) => tracing::info!(removed, "expiration sweep"),
            Err(e) => tracing::warn!("expiration sweep failed: {e:#}"),
        }
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("failed to listen for ctrl+c: {e}");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                tracing::error!("failed to listen for SIGTERM: {e}");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
    tracing::info!("shutdown signal received");
}
