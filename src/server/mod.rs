//! HTTP surface: start an orchestration, poll its status.
//!
//! | Route | Response |
//! |---|---|
//! | `GET/POST /api/start` | `202` + `{id, statusQueryGetUri}` |
//! | `GET /api/statuses/:instance_id` | `202` while Pending/Running, `200` once terminal, `404` if unknown |

use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::{Path, State};
use axum::http::{header, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::runtime::{Runtime, RuntimeError};
use crate::{samples, ActivityPlan, PlanStep};

/// Optional body of a start request. An absent or empty body starts the
/// sample plan.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct StartRequest {
    #[serde(default)]
    pub plan: Vec<PlanStep>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StartResponse {
    pub id: String,
    pub status_query_get_uri: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorBody {
    pub code: String,
    pub message: String,
}

/// Error returned by handlers, rendered as a JSON [`ErrorBody`].
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    code: &'static str,
    message: String,
}

impl ApiError {
    fn bad_request(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            code: "invalid_argument",
            message: message.into(),
        }
    }
}

impl From<RuntimeError> for ApiError {
    fn from(err: RuntimeError) -> Self {
        let (status, code) = match &err {
            RuntimeError::InstanceNotFound(_) => (StatusCode::NOT_FOUND, "not_found"),
            RuntimeError::InvalidPlan(_) => (StatusCode::BAD_REQUEST, "invalid_argument"),
            RuntimeError::Provider(_) => (StatusCode::INTERNAL_SERVER_ERROR, "internal"),
        };
        Self {
            status,
            code,
            message: err.to_string(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        if self.status.is_server_error() {
            warn!(code = self.code, error = %self.message, "request failed");
        }
        (
            self.status,
            Json(ErrorBody {
                code: self.code.to_string(),
                message: self.message,
            }),
        )
            .into_response()
    }
}

/// Relative URI at which an instance's status can be polled.
pub fn status_uri(instance_id: &str) -> String {
    format!("/api/statuses/{instance_id}")
}

/// Build the API router over a running [`Runtime`].
pub fn router(runtime: Arc<Runtime>) -> Router {
    Router::new()
        .route("/api/start", get(start).post(start))
        .route("/api/statuses/:instance_id", get(status))
        .with_state(runtime)
}

fn location(uri: &str) -> [(header::HeaderName, HeaderValue); 1] {
    let value = HeaderValue::from_str(uri).unwrap_or_else(|_| HeaderValue::from_static("/api/statuses"));
    [(header::LOCATION, value)]
}

async fn start(State(runtime): State<Arc<Runtime>>, body: Bytes) -> Result<Response, ApiError> {
    let plan = parse_plan(&body)?;
    let id = runtime.start_orchestration(plan).await?;
    info!(instance_id = %id, "Started orchestration with ID = '{id}'.");

    let uri = status_uri(&id);
    let response = StartResponse {
        id,
        status_query_get_uri: uri.clone(),
    };
    Ok((StatusCode::ACCEPTED, location(&uri), Json(response)).into_response())
}

fn parse_plan(body: &[u8]) -> Result<ActivityPlan, ApiError> {
    if body.iter().all(u8::is_ascii_whitespace) {
        return Ok(samples::hello_cities_plan());
    }
    let request: StartRequest =
        serde_json::from_slice(body).map_err(|e| ApiError::bad_request(format!("malformed start request: {e}")))?;
    if request.plan.is_empty() {
        return Ok(samples::hello_cities_plan());
    }
    Ok(ActivityPlan::from(request.plan))
}

async fn status(State(runtime): State<Arc<Runtime>>, Path(instance_id): Path<String>) -> Result<Response, ApiError> {
    let view = runtime.get_orchestration_status(&instance_id).await?;
    if view.running {
        let uri = status_uri(&instance_id);
        Ok((StatusCode::ACCEPTED, location(&uri), Json(view)).into_response())
    } else {
        Ok((StatusCode::OK, Json(view)).into_response())
    }
}
