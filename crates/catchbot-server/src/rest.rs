//! HTTP control surface.
//!
//! Every endpoint answers with a JSON envelope: `{"success": true, ...}` on
//! success, `{"success": false, "error": "..."}` on failure. Failures are
//! reported in the body with status 200.

use axum::extract::{Query, State};
use axum::routing::{get, post};
use axum::{Json, Router};
use catchbot::SessionCoordinator;
use serde::Deserialize;
use serde_json::{json, Value};
use std::fmt::Display;
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};

/// Build the router with all endpoints.
pub fn router(session: Arc<SessionCoordinator>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/", get(hello))
        .route("/health", get(health))
        .route("/start", post(start))
        .route("/stop", post(stop))
        .route("/crash/connect", get(connect))
        .route("/crash/last-result", get(last_result))
        .route("/crash/all-results", get(all_results))
        .route("/crash/balance", get(balance))
        .route("/crash/monitor", post(start_monitor))
        .route("/crash/monitor/stop", post(stop_monitor))
        .layer(cors)
        .with_state(session)
}

// ── Helpers ─────────────────────────────────────────────────────

fn failure(error: impl Display) -> Json<Value> {
    Json(json!({ "success": false, "error": error.to_string() }))
}

/// `?save=true` enables persistence; any other value does not.
#[derive(Deserialize, Default)]
struct SaveParams {
    save: Option<String>,
}

impl SaveParams {
    fn enabled(&self) -> bool {
        self.save.as_deref() == Some("true")
    }
}

// ── Handlers ────────────────────────────────────────────────────

async fn hello(State(session): State<Arc<SessionCoordinator>>) -> String {
    format!("Hello CatchBot! on port {}", session.config().debug_port)
}

async fn health(State(session): State<Arc<SessionCoordinator>>) -> Json<Value> {
    Json(json!({
        "status": "ok",
        "state": session.state(),
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

async fn start(State(session): State<Arc<SessionCoordinator>>) -> Json<Value> {
    match session.start().await {
        Ok(()) => Json(json!({ "success": true, "message": "Crash result monitoring started" })),
        Err(e) => failure(e),
    }
}

async fn stop(State(session): State<Arc<SessionCoordinator>>) -> Json<Value> {
    session.stop().await;
    Json(json!({ "success": true, "message": "Crash result monitoring stopped" }))
}

async fn connect(State(session): State<Arc<SessionCoordinator>>) -> Json<Value> {
    match session.connect_only().await {
        Ok(()) => Json(json!({ "success": true, "message": "Connected to Chrome browser" })),
        Err(e) => failure(e),
    }
}

async fn last_result(
    State(session): State<Arc<SessionCoordinator>>,
    Query(params): Query<SaveParams>,
) -> Json<Value> {
    match session.last_result(params.enabled()).await {
        Ok(outcome) => {
            let mut body = json!({ "success": true, "data": outcome.result });
            if let Some(saved) = outcome.saved {
                body["saved"] = json!(saved);
            }
            if let Some(err) = outcome.save_error {
                body["saveError"] = json!(err);
            }
            Json(body)
        }
        Err(e) => failure(e),
    }
}

async fn all_results(State(session): State<Arc<SessionCoordinator>>) -> Json<Value> {
    match session.all_results().await {
        Ok(results) => Json(json!({ "success": true, "data": results })),
        Err(e) => failure(e),
    }
}

async fn balance(State(session): State<Arc<SessionCoordinator>>) -> Json<Value> {
    match session.balance().await {
        Ok(balance) => Json(json!({ "success": true, "balance": balance })),
        Err(e) => failure(e),
    }
}

async fn start_monitor(
    State(session): State<Arc<SessionCoordinator>>,
    Query(params): Query<SaveParams>,
) -> Json<Value> {
    let save = params.enabled();
    session.start_monitor(save).await;
    let message = if save {
        "Monitoring started. Results will be saved to CSV."
    } else {
        "Monitoring started. Check the log for results."
    };
    Json(json!({
        "success": true,
        "message": message,
        "csvSaving": save,
        "stopEndpoint": "POST /crash/monitor/stop",
    }))
}

async fn stop_monitor(State(session): State<Arc<SessionCoordinator>>) -> Json<Value> {
    if session.stop_monitor().await {
        Json(json!({ "success": true, "message": "Monitoring stopped" }))
    } else {
        Json(json!({ "success": false, "message": "No active monitoring to stop" }))
    }
}
