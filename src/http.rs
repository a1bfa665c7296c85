//! HTTP ingestion endpoint.
//!
//! `POST /notify` accepts form-encoded `event`, `token`, `message` and
//! optional `subject` / `html_message`. Once a request passes validation the
//! enqueue is fire-and-forget: internal failures are logged, never surfaced.

use axum::extract::State;
use axum::http::{Method, StatusCode};
use axum::routing::any;
use axum::{Form, Json, Router};
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::error;

use crate::config::Config;
use crate::db;
use crate::notify::{notify, NotifyRequest};
use crate::template::TemplateEngine;

#[derive(Clone)]
pub struct AppState {
    pub pool: db::Pool,
    pub templates: Arc<dyn TemplateEngine>,
    pub cfg: Arc<Config>,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/notify", any(handle_notify))
        .with_state(state)
}

#[derive(Debug, Default, Deserialize)]
struct NotifyForm {
    event: Option<String>,
    token: Option<String>,
    message: Option<String>,
    subject: Option<String>,
    html_message: Option<String>,
}

async fn handle_notify(
    State(state): State<AppState>,
    method: Method,
    Form(form): Form<NotifyForm>,
) -> (StatusCode, Json<Value>) {
    if method != Method::POST {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({"error": "invalid method"})),
        );
    }

    let Some(event_name) = form.event else {
        return (
            StatusCode::NOT_FOUND,
            Json(json!({"error": "event not found"})),
        );
    };
    let event = match db::event_by_name(&state.pool, &event_name).await {
        Ok(Some(event)) => event,
        Ok(None) => {
            return (
                StatusCode::NOT_FOUND,
                Json(json!({"error": "event not found"})),
            )
        }
        Err(err) => {
            error!(?err, event = %event_name, "event lookup failed");
            return (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({"error": "internal error"})),
            );
        }
    };

    // An event with no external token is never postable from outside.
    let token_ok = matches!(
        (&event.external_token, &form.token),
        (Some(expected), Some(given)) if expected == given
    );
    if !token_ok {
        return (
            StatusCode::FORBIDDEN,
            Json(json!({"error": "invalid token"})),
        );
    }

    let Some(message) = form.message.filter(|m| !m.is_empty()) else {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({"error": "missing message"})),
        );
    };

    let mut request = NotifyRequest::new(event.name, message);
    request.subject = form.subject;
    request.html_message = form.html_message;

    let count = match notify(&state.pool, state.templates.as_ref(), &state.cfg, request).await {
        Ok(count) => count,
        Err(err) => {
            // Accepted requests are fire-and-forget; log and report zero.
            error!(?err, "enqueue failed after acceptance");
            0
        }
    };

    (StatusCode::OK, Json(json!({"notifications": count})))
}
