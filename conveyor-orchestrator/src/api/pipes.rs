//! Pipe handlers.
//!
//! A pipe is a transient handle used to stream artifacts between two
//! builds' steps; the control plane only mints and resolves them.

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::Json;
use uuid::Uuid;

use conveyor_core::Pipe;
use conveyor_store::prelude::*;

use super::error::{ApiError, ApiResult};
use super::AppState;

pub async fn create_pipe(State(state): State<AppState>) -> ApiResult<(StatusCode, Json<Pipe>)> {
    let id = Uuid::new_v4().to_string();
    let url = format!("{}/api/v1/pipes/{id}", state.external_url);

    state.store.create_pipe(&id, &url).await?;

    Ok((StatusCode::CREATED, Json(Pipe { id, url })))
}

pub async fn get_pipe(
    State(state): State<AppState>,
    Path(pipe_id): Path<String>,
) -> ApiResult<Json<Pipe>> {
    let pipe = state
        .store
        .get_pipe(&pipe_id)
        .await?
        .ok_or(ApiError::NotFound)?;
    Ok(Json(pipe))
}
