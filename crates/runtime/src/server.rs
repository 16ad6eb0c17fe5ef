//! Operator HTTP surface: localhost-bound, shared-secret header auth, plus
//! whatever routes registered modules contribute.

use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{Path, Request, State},
    http::StatusCode,
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{get, post},
};
use tokio::net::TcpListener;
use tokio::sync::{RwLock, mpsc, watch};
use tracing::{info, warn};

use vigil_modules::ModuleRoute;
use vigil_store::Store;

use crate::drivers::LoopStatus;

const SECRET_HEADER: &str = "x-vigil-secret";

#[derive(Clone)]
pub struct AppState {
    pub store: Arc<Store>,
    pub status: Arc<RwLock<LoopStatus>>,
    pub trigger_tx: mpsc::Sender<()>,
    pub secret: String,
    pub module_routes: Arc<Vec<(String, ModuleRoute)>>,
}

pub async fn serve_operator(
    state: AppState,
    bind: &str,
    mut shutdown: watch::Receiver<bool>,
) -> anyhow::Result<()> {
    if !bind.starts_with("127.0.0.1") && !bind.starts_with("localhost") {
        warn!(bind, "operator surface binding beyond loopback — keep the secret strong");
    }

    let mut app = Router::new()
        .route("/agent-loop", get(agent_loop_status))
        .route("/agent-loop/trigger", post(trigger_cycle))
        .route("/errors", get(list_errors))
        .route("/errors/:id/resolve", post(resolve_error))
        .route("/memory", get(memory_snapshot));

    for (module, route) in state.module_routes.iter() {
        let full_path = format!("/modules/{module}/{}", route.path.trim_start_matches('/'));
        let handler = route.handler.clone();
        let method_router = if route.method.eq_ignore_ascii_case("post") {
            let handler = handler.clone();
            post(move |Json(body): Json<serde_json::Value>| {
                let handler = handler.clone();
                async move { run_module_handler(&handler, body) }
            })
        } else {
            get(move || {
                let handler = handler.clone();
                async move { run_module_handler(&handler, serde_json::Value::Null) }
            })
        };
        info!(path = %full_path, "module route mounted");
        app = app.route(&full_path, method_router);
    }

    let app = app
        .layer(middleware::from_fn_with_state(state.clone(), require_secret))
        .with_state(state);

    let listener = TcpListener::bind(bind).await?;
    info!(bind, "operator surface listening");
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            loop {
                if shutdown.changed().await.is_err() || *shutdown.borrow() {
                    return;
                }
            }
        })
        .await?;
    Ok(())
}

async fn require_secret(
    State(state): State<AppState>,
    request: Request,
    next: Next,
) -> Response {
    let provided = request
        .headers()
        .get(SECRET_HEADER)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("");
    if state.secret.is_empty() || provided != state.secret {
        return StatusCode::UNAUTHORIZED.into_response();
    }
    next.run(request).await
}

async fn agent_loop_status(State(state): State<AppState>) -> Response {
    let status = state.status.read().await.clone();
    Json(status).into_response()
}

/// Run-now.  Ignored (with a say-so) while a cycle is already running.
async fn trigger_cycle(State(state): State<AppState>) -> Response {
    if state.status.read().await.running {
        return Json(serde_json::json!({ "triggered": false, "reason": "cycle running" }))
            .into_response();
    }
    let triggered = state.trigger_tx.try_send(()).is_ok();
    Json(serde_json::json!({ "triggered": triggered })).into_response()
}

async fn list_errors(State(state): State<AppState>) -> Response {
    match state.store.recent_errors(50) {
        Ok(errors) => Json(errors).into_response(),
        Err(err) => store_failure(err),
    }
}

async fn resolve_error(State(state): State<AppState>, Path(id): Path<i64>) -> Response {
    match state.store.mark_error_resolved(id) {
        Ok(true) => Json(serde_json::json!({ "resolved": id })).into_response(),
        Ok(false) => StatusCode::NOT_FOUND.into_response(),
        Err(err) => store_failure(err),
    }
}

async fn memory_snapshot(State(state): State<AppState>) -> Response {
    let ring: Option<vigil_guard::SnapshotRing> = state
        .store
        .kv_get(vigil_guard::SNAPSHOTS_KEY)
        .ok()
        .flatten();
    match ring {
        Some(ring) => {
            let trend = ring.trend();
            Json(serde_json::json!({
                "latest": ring.latest(),
                "trend": trend,
                "snapshots": ring.len(),
            }))
            .into_response()
        }
        None => Json(serde_json::json!({ "latest": null, "snapshots": 0 })).into_response(),
    }
}

type ModuleHandler =
    Arc<dyn Fn(serde_json::Value) -> anyhow::Result<serde_json::Value> + Send + Sync>;

fn run_module_handler(handler: &ModuleHandler, body: serde_json::Value) -> Response {
    match handler(body) {
        Ok(value) => Json(value).into_response(),
        Err(err) => (StatusCode::INTERNAL_SERVER_ERROR, err.to_string()).into_response(),
    }
}

fn store_failure(err: vigil_store::StoreError) -> Response {
    warn!(%err, "operator query failed");
    (StatusCode::INTERNAL_SERVER_ERROR, err.to_string()).into_response()
}
