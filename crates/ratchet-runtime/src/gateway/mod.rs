mod processes;
mod response;
mod settings;
mod ws;

pub use processes::list_etag;
pub use response::{ApiError, ApiResult};

use std::sync::Arc;

use axum::http::HeaderMap;
use axum::routing::{get, post, put};
use axum::Router;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use ratchet_core::workflow::UserClaims;

use crate::engine::Engine;

/// Resolves the caller identity from request headers. The engine only
/// consumes the resulting claims through the workflow authorization
/// predicates; token verification itself lives outside the core.
pub type AuthHook = Arc<dyn Fn(&HeaderMap) -> Option<UserClaims> + Send + Sync>;

/// Validates websocket bearer tokens.
pub type WsAuthHook = Arc<dyn Fn(&str) -> bool + Send + Sync>;

/// Shared state of all gateway handlers.
#[derive(Clone)]
pub struct AppState {
    pub engine: Engine,
    pub auth: AuthHook,
    pub ws_auth: WsAuthHook,
}

/// Build the process API router with anonymous authentication hooks.
pub fn router(engine: Engine) -> Router {
    router_with_auth(engine, Arc::new(|_| None), Arc::new(|_| true))
}

/// Build the process API router with custom authentication hooks.
pub fn router_with_auth(engine: Engine, auth: AuthHook, ws_auth: WsAuthHook) -> Router {
    let websockets_enabled = engine.config().broadcast.enable_websockets;
    let state = AppState {
        engine,
        auth,
        ws_auth,
    };

    let mut router = Router::new()
        .route("/api/processes", get(processes::list))
        .route("/api/processes/status-counts", get(processes::status_counts))
        .route("/api/processes/resume-all", put(processes::resume_all))
        .route(
            "/api/processes/{key}",
            post(processes::new_process)
                .get(processes::show)
                .delete(processes::delete),
        )
        .route("/api/processes/{key}/resume", put(processes::resume))
        .route("/api/processes/{key}/abort", put(processes::abort))
        .route(
            "/api/processes/{key}/callback/{token}",
            post(processes::callback),
        )
        .route(
            "/api/processes/{key}/callback/{token}/progress",
            post(processes::callback_progress),
        )
        .route(
            "/api/settings/status",
            get(settings::get_status).put(settings::set_status),
        )
        .route("/api/settings/worker-status", get(settings::worker_status));

    if websockets_enabled {
        router = router.route("/api/ws/{channel}", get(ws::channel_ws));
    }

    router
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}
