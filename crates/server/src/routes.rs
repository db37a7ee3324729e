//! Function endpoints: a thin transport adapter over the orchestrator.
//! Validation failures map to 400; everything else that fails maps to
//! 500 with the wrapped stage error in the body.

use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use tracing::info;

use plinth_core::ProvisionError;
use plinth_provision::Provisioner;

#[derive(Clone)]
pub struct AppState {
    pub provisioner: Arc<Provisioner>,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/function", post(post_function))
        .route("/function/:id/status", get(get_function_status))
        .with_state(state)
}

#[derive(Debug, Deserialize)]
pub struct PostFunctionBody {
    pub name: String,
    pub script: String,
}

#[derive(Debug, Serialize)]
pub struct PostFunctionResponse {
    pub url: String,
}

#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub stage: &'static str,
}

/// 400 for bad input, 500 for a failed provisioning stage. No finer
/// classification here.
pub fn error_status(err: &ProvisionError) -> StatusCode {
    if err.is_bad_input() {
        StatusCode::BAD_REQUEST
    } else {
        StatusCode::INTERNAL_SERVER_ERROR
    }
}

async fn post_function(
    State(state): State<AppState>,
    Json(body): Json<PostFunctionBody>,
) -> Result<(StatusCode, Json<PostFunctionResponse>), (StatusCode, Json<ErrorResponse>)> {
    info!(name = %body.name, "deploy request");
    match state.provisioner.provision(&body.name, &body.script).await {
        Ok(url) => Ok((StatusCode::ACCEPTED, Json(PostFunctionResponse { url }))),
        Err(err) => Err((
            error_status(&err),
            Json(ErrorResponse { error: err.to_string(), stage: err.stage() }),
        )),
    }
}

#[derive(Debug, Serialize)]
pub struct FunctionStatus {
    pub id: String,
    pub status: &'static str,
}

/// Status tracking is not implemented; every known id reports pending.
async fn get_function_status(Path(id): Path<String>) -> Json<FunctionStatus> {
    Json(FunctionStatus { id, status: "pending" })
}
