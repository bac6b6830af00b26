//! HTTP API.
//!
//! Only the handlers the control plane itself consumes: triggering job
//! builds, listing them with cursor pagination, one-off builds, and
//! aborts.

pub mod builds;
pub mod error;
pub mod pipes;
pub mod present;

use axum::routing::{get, post, put};
use axum::Router;
use std::sync::Arc;

use conveyor_engine::Engine;
use conveyor_store::Store;

use crate::scheduler::BuildTriggerer;

#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn Store>,
    pub engine: Arc<dyn Engine>,
    pub triggerer: Arc<dyn BuildTriggerer>,
    pub external_url: String,
}

pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/api/v1/builds", post(builds::create_one_off_build))
        .route("/api/v1/builds/:build_id", get(builds::get_build))
        .route("/api/v1/builds/:build_id/abort", put(builds::abort_build))
        .route(
            "/api/v1/teams/:team/pipelines/:pipeline/jobs/:job/builds",
            post(builds::create_job_build).get(builds::list_job_builds),
        )
        .route("/api/v1/pipes", post(pipes::create_pipe))
        .route("/api/v1/pipes/:pipe_id", get(pipes::get_pipe))
        .layer(tower_http::trace::TraceLayer::new_for_http())
        .with_state(state)
}
