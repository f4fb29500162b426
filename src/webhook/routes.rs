use std::collections::HashMap;

use axum::{
    Json, Router,
    body::Bytes,
    extract::{Path, Query, State},
    http::{Method, StatusCode},
    response::{IntoResponse, Response},
    routing::post,
};
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use crate::orchestrator::WeakOrchestrator;
use crate::util::valid_app_name;

/// Router for `POST /webhook/{app}?secret=<token>`.
///
/// The router only holds a weak handle: the orchestrator owns the listener
/// serving it.
pub fn router(orchestrator: WeakOrchestrator) -> Router {
    Router::new()
        .route("/webhook/{app_name}", post(handle_push))
        .fallback(fallback)
        .layer(TraceLayer::new_for_http())
        .with_state(orchestrator)
}

async fn fallback(method: Method) -> Response {
    if method != Method::POST {
        return (StatusCode::METHOD_NOT_ALLOWED, "Method Not Allowed").into_response();
    }
    (StatusCode::NOT_FOUND, "Not Found").into_response()
}

/// Branch named by a push payload's `ref`, if the body is JSON and has one.
pub fn pushed_branch(body: &[u8]) -> Option<String> {
    let payload: serde_json::Value = serde_json::from_slice(body).ok()?;
    let git_ref = payload.get("ref")?.as_str()?;
    Some(git_ref.strip_prefix("refs/heads/").unwrap_or(git_ref).to_string())
}

async fn handle_push(
    State(orchestrator): State<WeakOrchestrator>,
    Path(app_name): Path<String>,
    Query(query): Query<HashMap<String, String>>,
    body: Bytes,
) -> Response {
    if !valid_app_name(&app_name) {
        return (StatusCode::NOT_FOUND, "Not Found").into_response();
    }
    let Some(orchestrator) = orchestrator.upgrade() else {
        return (StatusCode::SERVICE_UNAVAILABLE, "Shutting down").into_response();
    };

    let app = match orchestrator.get_app(&app_name).await {
        Ok(Some(app)) => app,
        Ok(None) => return (StatusCode::NOT_FOUND, "App not found").into_response(),
        Err(e) => {
            warn!(app = %app_name, error = %e, "webhook could not read registry");
            return (StatusCode::INTERNAL_SERVER_ERROR, "Registry unavailable").into_response();
        }
    };

    let expected = app.webhook_secret.as_deref().filter(|s| !s.is_empty());
    let given = query.get("secret").map(String::as_str);
    if expected.is_none() || expected != given {
        warn!(app = %app_name, "webhook rejected: bad secret");
        return (StatusCode::FORBIDDEN, "Invalid secret").into_response();
    }

    match pushed_branch(&body) {
        Some(branch) if branch != app.branch => {
            info!(app = %app_name, pushed = %branch, configured = %app.branch, "ignoring push to other branch");
        }
        _ => {
            info!(app = %app_name, "webhook accepted, deploy triggered");
            tokio::spawn(async move { orchestrator.webhook_deploy(&app_name).await });
        }
    }

    (
        StatusCode::OK,
        Json(serde_json::json!({"ok": true, "message": "Deploy triggered"})),
    )
        .into_response()
}
