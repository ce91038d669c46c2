/**
 * HTTP API - Axum router of the orchestrator
 *
 * ROUTES :
 * - POST /api/upswake                 conditional wake (rules decide)
 * - GET  /api/upswake                 configured NUT sources, passwords redacted
 * - POST /api/servers/wake            unconditional wake to an explicit broadcast
 * - POST /api/servers/broadcastwake   unconditional wake to every local broadcast
 * - GET  /health                      liveness plus config counts
 *
 * Every failure answers `{"message": "..."}`. Handlers read the config
 * through a snapshot so a concurrent reload never tears a request.
 */

use crate::config::NutSource;
use crate::models::{BroadcastWakeIn, HealthView, Message, UpsWakeIn, WakeIn};
use crate::service::{UpsWakeOutcome, WakeService, MSG_NOT_ALLOWED, MSG_NOT_FOUND, MSG_WOKEN};
use crate::state::SharedConfig;
use crate::wol::{WakeError, DEFAULT_WOL_PORT};
use axum::extract::rejection::JsonRejection;
use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use tracing::{error, warn};

#[derive(Clone)]
pub struct AppState {
    pub config: SharedConfig,
    pub service: WakeService,
}

type Reply = (StatusCode, Json<Message>);

pub fn build_router(app_state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/api/upswake", get(list_sources).post(upswake))
        .route("/api/servers/wake", post(wake))
        .route("/api/servers/broadcastwake", post(broadcast_wake))
        .with_state(app_state)
}

fn reply(code: StatusCode, msg: Message) -> Reply {
    (code, Json(msg))
}

fn bad_request(rejection: JsonRejection) -> Reply {
    warn!(error = %rejection.body_text(), "malformed request body");
    reply(StatusCode::BAD_REQUEST, Message::new(rejection.body_text()))
}

/// Defaults to 9. Port 0 cannot be sent to.
fn wol_port(port: Option<u16>) -> Result<u16, Reply> {
    match port {
        Some(0) => {
            warn!("wake requested on port 0");
            Err(reply(StatusCode::BAD_REQUEST, Message::new("port must be between 1 and 65535")))
        }
        Some(port) => Ok(port),
        None => Ok(DEFAULT_WOL_PORT),
    }
}

fn wake_failed(err: WakeError) -> Reply {
    let code = match err {
        WakeError::InvalidMac(_) | WakeError::InvalidBroadcast(_) => StatusCode::BAD_REQUEST,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    if code.is_server_error() {
        error!(error = %err, "wake failed");
    }
    reply(code, Message::new(err.to_string()))
}

// GET /health
async fn health(State(app): State<AppState>) -> Json<HealthView> {
    let cfg = app.config.snapshot();
    Json(HealthView {
        status: "ok".into(),
        sources: cfg.nut_servers.len(),
        targets: cfg.target_count(),
    })
}

// GET /api/upswake
async fn list_sources(State(app): State<AppState>) -> Json<Vec<NutSource>> {
    Json(app.config.snapshot().redacted())
}

// POST /api/upswake
async fn upswake(
    State(app): State<AppState>,
    body: Result<Json<UpsWakeIn>, JsonRejection>,
) -> Reply {
    let Json(req) = match body {
        Ok(b) => b,
        Err(rejection) => return bad_request(rejection),
    };

    let cfg = app.config.snapshot();
    match app.service.upswake(&cfg, &req.mac).await {
        Ok(UpsWakeOutcome::Woken(_)) => reply(StatusCode::OK, Message::woken(MSG_WOKEN, true)),
        Ok(UpsWakeOutcome::NotAllowed) => {
            reply(StatusCode::OK, Message::woken(MSG_NOT_ALLOWED, false))
        }
        Ok(UpsWakeOutcome::NotFound) => {
            reply(StatusCode::CONFLICT, Message::new(MSG_NOT_FOUND))
        }
        Err(e) => {
            error!(mac = %req.mac, error = %e, "upswake failed");
            reply(StatusCode::INTERNAL_SERVER_ERROR, Message::new(e.to_string()))
        }
    }
}

// POST /api/servers/wake
async fn wake(State(app): State<AppState>, body: Result<Json<WakeIn>, JsonRejection>) -> Reply {
    let Json(req) = match body {
        Ok(b) => b,
        Err(rejection) => return bad_request(rejection),
    };
    let port = match wol_port(req.port) {
        Ok(port) => port,
        Err(rejected) => return rejected,
    };
    let dispatcher = app.service.dispatcher();
    match dispatcher.wake_to(&req.mac, &req.broadcast, port).await {
        Ok(()) => reply(StatusCode::OK, Message::woken(MSG_WOKEN, true)),
        Err(e) => wake_failed(e),
    }
}

// POST /api/servers/broadcastwake
async fn broadcast_wake(
    State(app): State<AppState>,
    body: Result<Json<BroadcastWakeIn>, JsonRejection>,
) -> Reply {
    let Json(req) = match body {
        Ok(b) => b,
        Err(rejection) => return bad_request(rejection),
    };
    let port = match wol_port(req.port) {
        Ok(port) => port,
        Err(rejected) => return rejected,
    };
    match app.service.dispatcher().broadcast_wake(&req.mac, port).await {
        Ok(()) => reply(StatusCode::OK, Message::woken(MSG_WOKEN, true)),
        Err(e) => wake_failed(e),
    }
}
