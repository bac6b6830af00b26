//! JSON presentation of domain records.

use serde::{Deserialize, Serialize};

use conveyor_core::{Build, BuildInput, BuildOutput};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BuildResponse {
    pub id: i64,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub job_name: Option<String>,
    pub status: String,
    pub url: String,
    pub api_url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pipeline_name: Option<String>,
    pub team_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_time: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_time: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub inputs: Option<Vec<BuildInput>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub outputs: Option<Vec<BuildOutput>>,
}

pub fn build(external_url: &str, build: &Build) -> BuildResponse {
    let url = match (&build.pipeline_name, &build.job_name) {
        (Some(pipeline), Some(job)) => format!(
            "{external_url}/teams/{}/pipelines/{pipeline}/jobs/{job}/builds/{}",
            build.team_name, build.name
        ),
        _ => format!("{external_url}/builds/{}", build.id),
    };

    BuildResponse {
        id: build.id,
        name: build.name.clone(),
        job_name: build.job_name.clone(),
        status: build.status.to_string(),
        url,
        api_url: format!("/api/v1/builds/{}", build.id),
        pipeline_name: build.pipeline_name.clone(),
        team_name: build.team_name.clone(),
        start_time: build.start_time.map(|t| t.timestamp()),
        end_time: build.end_time.map(|t| t.timestamp()),
        inputs: None,
        outputs: None,
    }
}
