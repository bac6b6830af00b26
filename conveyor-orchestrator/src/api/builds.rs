//! Build handlers.

use axum::extract::{Path, Query, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::Json;
use serde::Deserialize;

use conveyor_core::{Plan, DEFAULT_TEAM_NAME};
use conveyor_store::prelude::*;
use conveyor_store::{Page, Pagination};

use super::error::{ApiError, ApiResult};
use super::present::{self, BuildResponse};
use super::AppState;

const DEFAULT_PAGE_LIMIT: usize = 100;

/// Trigger a new build of a job right now.
pub async fn create_job_build(
    State(state): State<AppState>,
    Path((team, pipeline, job)): Path<(String, String, String)>,
) -> ApiResult<(StatusCode, Json<BuildResponse>)> {
    let pipeline = state
        .store
        .get_pipeline_by_team_and_name(&team, &pipeline)
        .await?
        .ok_or(ApiError::NotFound)?;

    let (config, _) = state
        .store
        .get_config(pipeline.id)
        .await?
        .ok_or(ApiError::NotFound)?;

    let job = config.job(&job).ok_or(ApiError::NotFound)?.clone();

    let build = state
        .triggerer
        .trigger_immediately(&pipeline, &job, &config)
        .await
        .map_err(|err| ApiError::Internal(err.to_string()))?;

    Ok((
        StatusCode::CREATED,
        Json(present::build(&state.external_url, &build)),
    ))
}

#[derive(Debug, Default, Deserialize)]
pub struct PageQuery {
    pub since: Option<i64>,
    pub until: Option<i64>,
    pub limit: Option<usize>,
}

/// List a job's builds, newest first, with cursor pagination.
pub async fn list_job_builds(
    State(state): State<AppState>,
    Path((team, pipeline, job)): Path<(String, String, String)>,
    Query(query): Query<PageQuery>,
) -> ApiResult<(HeaderMap, Json<Vec<BuildResponse>>)> {
    let pipeline = state
        .store
        .get_pipeline_by_team_and_name(&team, &pipeline)
        .await?
        .ok_or(ApiError::NotFound)?;

    let (config, _) = state
        .store
        .get_config(pipeline.id)
        .await?
        .ok_or(ApiError::NotFound)?;
    config.job(&job).ok_or(ApiError::NotFound)?;

    let limit = query.limit.unwrap_or(DEFAULT_PAGE_LIMIT);
    let page = Page {
        since: query.since,
        until: query.until,
        limit,
    };

    let (builds, pagination) = state.store.job_builds_page(pipeline.id, &job, &page).await?;

    let mut responses = Vec::with_capacity(builds.len());
    for build in &builds {
        let mut response = present::build(&state.external_url, build);
        let inputs = state.store.get_build_inputs(build.id).await?;
        let outputs = state.store.get_build_outputs(build.id).await?;
        response.inputs = (!inputs.is_empty()).then_some(inputs);
        response.outputs = (!outputs.is_empty()).then_some(outputs);
        responses.push(response);
    }

    let mut headers = HeaderMap::new();
    let base = format!(
        "{}/api/v1/teams/{}/pipelines/{}/jobs/{}/builds",
        state.external_url, team, pipeline.name, job
    );
    if let Some(link) = link_header(&base, &pagination, limit) {
        headers.insert(
            header::LINK,
            link.parse()
                .map_err(|_| ApiError::Internal("invalid link header".to_string()))?,
        );
    }

    Ok((headers, Json(responses)))
}

fn link_header(base: &str, pagination: &Pagination, limit: usize) -> Option<String> {
    let mut links = Vec::new();

    if let Some(Page {
        until: Some(until), ..
    }) = pagination.previous
    {
        links.push(format!("<{base}?until={until}&limit={limit}>; rel=\"previous\""));
    }
    if let Some(Page {
        since: Some(since), ..
    }) = pagination.next
    {
        links.push(format!("<{base}?since={since}&limit={limit}>; rel=\"next\""));
    }

    (!links.is_empty()).then(|| links.join(", "))
}

pub async fn get_build(
    State(state): State<AppState>,
    Path(build_id): Path<i64>,
) -> ApiResult<Json<BuildResponse>> {
    let build = state
        .store
        .get_build(build_id)
        .await?
        .ok_or(ApiError::NotFound)?;

    Ok(Json(present::build(&state.external_url, &build)))
}

/// Create and immediately run a one-off build of a posted plan.
pub async fn create_one_off_build(
    State(state): State<AppState>,
    Json(plan): Json<Plan>,
) -> ApiResult<(StatusCode, Json<BuildResponse>)> {
    let team = state
        .store
        .get_team_by_name(DEFAULT_TEAM_NAME)
        .await?
        .ok_or_else(|| ApiError::Internal("default team is missing".to_string()))?;

    let build = state.store.create_one_off_build(team.id).await?;

    let handle = state
        .engine
        .create_build(&build, &plan)
        .await
        .map_err(|err| ApiError::Internal(err.to_string()))?;
    tokio::spawn(async move {
        handle.resume().await;
    });

    let build = state
        .store
        .get_build(build.id)
        .await?
        .ok_or(ApiError::NotFound)?;

    Ok((
        StatusCode::CREATED,
        Json(present::build(&state.external_url, &build)),
    ))
}

pub async fn abort_build(
    State(state): State<AppState>,
    Path(build_id): Path<i64>,
) -> ApiResult<StatusCode> {
    state
        .store
        .get_build(build_id)
        .await?
        .ok_or(ApiError::NotFound)?;

    state.store.abort_build(build_id).await?;
    Ok(StatusCode::NO_CONTENT)
}
