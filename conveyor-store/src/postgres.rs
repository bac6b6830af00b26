//! Postgres store.
//!
//! Mirrors the in-memory store's semantics over sqlx. The schema is
//! created by idempotent migrations at startup; leases are rows updated by
//! conditional writes, which is what makes them safe across controllers;
//! event readers wake on `NOTIFY` rather than polling hot.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgListener, PgPool, PgPoolOptions};
use sqlx::Row;
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::watch;

use conveyor_core::{
    Build, BuildInput, BuildOutput, BuildPreparation, BuildStatus, Config, Container,
    ContainerIdentifier, ContainerMetadata, Event, IdentifierError, MetadataField, Pipe,
    PreparationStatus, ResourceConfig, SavedPipeline, SavedVersion, Team, Version, Volume,
};

use crate::algorithm::{BuildVersion, ResourceVersion, VersionsDb};
use crate::error::{Result, StoreError};
use crate::page::{paginate, Page, Pagination};
use crate::store::{
    AbortNotifier, BoxLease, BuildStore, ContainerStore, EventCursor, EventStore,
    EventStreamError, Lease, LeaseStore, PausedState, PipeStore, PipelineStore, TeamStore,
    VersionStore, VolumeStore,
};

#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

pub async fn create_pool(database_url: &str) -> Result<PgPool> {
    Ok(PgPoolOptions::new()
        .max_connections(10)
        .acquire_timeout(Duration::from_secs(5))
        .connect(database_url)
        .await?)
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        PgStore { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub async fn run_migrations(&self) -> Result<()> {
        let statements = [
            r#"
            CREATE TABLE IF NOT EXISTS teams (
                id BIGSERIAL PRIMARY KEY,
                name TEXT NOT NULL UNIQUE
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS pipelines (
                id BIGSERIAL PRIMARY KEY,
                name TEXT NOT NULL,
                team_id BIGINT NOT NULL REFERENCES teams(id),
                team_name TEXT NOT NULL,
                paused BOOLEAN NOT NULL DEFAULT FALSE,
                config JSONB NOT NULL,
                version BIGINT NOT NULL DEFAULT 1,
                UNIQUE (team_id, name)
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS resources (
                id BIGSERIAL PRIMARY KEY,
                pipeline_id BIGINT NOT NULL,
                name TEXT NOT NULL,
                UNIQUE (pipeline_id, name)
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS jobs (
                id BIGSERIAL PRIMARY KEY,
                pipeline_id BIGINT NOT NULL,
                name TEXT NOT NULL,
                UNIQUE (pipeline_id, name)
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS builds (
                id BIGSERIAL PRIMARY KEY,
                name TEXT NOT NULL,
                pipeline_id BIGINT,
                job_name TEXT,
                pipeline_name TEXT,
                team_name TEXT NOT NULL,
                status TEXT NOT NULL,
                engine TEXT NOT NULL DEFAULT '',
                engine_metadata TEXT NOT NULL DEFAULT '',
                aborted BOOLEAN NOT NULL DEFAULT FALSE,
                start_time TIMESTAMPTZ,
                end_time TIMESTAMPTZ
            )
            "#,
            "CREATE INDEX IF NOT EXISTS idx_builds_status ON builds(status)",
            "CREATE INDEX IF NOT EXISTS idx_builds_job ON builds(pipeline_id, job_name)",
            r#"
            CREATE TABLE IF NOT EXISTS build_events (
                build_id BIGINT NOT NULL,
                event_id BIGINT NOT NULL,
                payload JSONB NOT NULL,
                PRIMARY KEY (build_id, event_id)
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS build_preparations (
                build_id BIGINT PRIMARY KEY,
                prep JSONB NOT NULL
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS versioned_resources (
                id BIGSERIAL PRIMARY KEY,
                pipeline_id BIGINT NOT NULL,
                resource_name TEXT NOT NULL,
                version JSONB NOT NULL,
                metadata JSONB NOT NULL DEFAULT '[]',
                enabled BOOLEAN NOT NULL DEFAULT TRUE,
                check_order BIGINT NOT NULL DEFAULT 0,
                UNIQUE (pipeline_id, resource_name, version)
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS build_inputs (
                build_id BIGINT NOT NULL,
                name TEXT NOT NULL,
                version_id BIGINT NOT NULL,
                first_occurrence BOOLEAN NOT NULL DEFAULT FALSE,
                PRIMARY KEY (build_id, name)
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS build_outputs (
                build_id BIGINT NOT NULL,
                version_id BIGINT NOT NULL,
                resource_name TEXT NOT NULL,
                PRIMARY KEY (build_id, version_id, resource_name)
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS containers (
                handle TEXT PRIMARY KEY,
                identifier JSONB NOT NULL,
                metadata JSONB NOT NULL,
                expires_at TIMESTAMPTZ
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS volumes (
                worker_name TEXT NOT NULL,
                handle TEXT NOT NULL,
                resource_hash TEXT NOT NULL,
                resource_version JSONB NOT NULL,
                ttl_seconds BIGINT NOT NULL DEFAULT 0,
                expires_at TIMESTAMPTZ,
                PRIMARY KEY (worker_name, handle)
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS pipes (
                id TEXT PRIMARY KEY,
                url TEXT NOT NULL
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS leases (
                subject TEXT PRIMARY KEY,
                held BOOLEAN NOT NULL DEFAULT FALSE,
                last_invalidated TIMESTAMPTZ NOT NULL DEFAULT now()
            )
            "#,
        ];

        for statement in statements {
            sqlx::query(statement).execute(&self.pool).await?;
        }

        tracing::info!("database migrations completed");
        Ok(())
    }

    async fn append_event(&self, build_id: i64, event: &Event) -> Result<()> {
        let payload = serde_json::to_value(event)?;
        let mut tx = self.pool.begin().await?;
        sqlx::query(
            r#"
            INSERT INTO build_events (build_id, event_id, payload)
            VALUES ($1, (SELECT COALESCE(MAX(event_id), -1) + 1 FROM build_events WHERE build_id = $1), $2)
            "#,
        )
        .bind(build_id)
        .bind(payload)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;

        sqlx::query("SELECT pg_notify($1, '')")
            .bind(event_channel(build_id))
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn ensure_job(&self, pipeline_id: i64, job: &str) -> Result<()> {
        sqlx::query("INSERT INTO jobs (pipeline_id, name) VALUES ($1, $2) ON CONFLICT DO NOTHING")
            .bind(pipeline_id)
            .bind(job)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn ensure_resource(&self, pipeline_id: i64, resource: &str) -> Result<()> {
        sqlx::query(
            "INSERT INTO resources (pipeline_id, name) VALUES ($1, $2) ON CONFLICT DO NOTHING",
        )
        .bind(pipeline_id)
        .bind(resource)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Finds or creates the version row, optionally moving it to the head
    /// of the resource's check order.
    async fn upsert_version(
        &self,
        pipeline_id: i64,
        resource: &str,
        version: &Version,
        metadata: &[MetadataField],
        bump_order: bool,
    ) -> Result<SavedVersion> {
        self.ensure_resource(pipeline_id, resource).await?;

        let version_json = serde_json::to_value(version)?;
        let metadata_json = serde_json::to_value(metadata)?;

        let row = sqlx::query_as::<_, VersionRow>(
            r#"
            INSERT INTO versioned_resources (pipeline_id, resource_name, version, metadata, check_order)
            VALUES ($1, $2, $3, $4,
                    (SELECT COALESCE(MAX(check_order), 0) + 1 FROM versioned_resources
                      WHERE pipeline_id = $1 AND resource_name = $2))
            ON CONFLICT (pipeline_id, resource_name, version) DO UPDATE SET
                metadata = CASE WHEN $5 THEN EXCLUDED.metadata ELSE versioned_resources.metadata END,
                check_order = CASE WHEN $6
                    THEN (SELECT COALESCE(MAX(check_order), 0) + 1 FROM versioned_resources vr
                           WHERE vr.pipeline_id = $1 AND vr.resource_name = $2)
                    ELSE versioned_resources.check_order END
            RETURNING id, resource_name, version, metadata, enabled, check_order
            "#,
        )
        .bind(pipeline_id)
        .bind(resource)
        .bind(version_json)
        .bind(metadata_json)
        .bind(!metadata.is_empty())
        .bind(bump_order)
        .fetch_one(&self.pool)
        .await?;

        row.into_saved()
    }
}

fn event_channel(build_id: i64) -> String {
    format!("build_events_{build_id}")
}

const TERMINAL_STATUSES: &str = "('succeeded', 'failed', 'errored', 'aborted')";

// ---------------------------------------------------------------------------
// row types
// ---------------------------------------------------------------------------

#[derive(sqlx::FromRow)]
struct BuildRow {
    id: i64,
    name: String,
    pipeline_id: Option<i64>,
    job_name: Option<String>,
    pipeline_name: Option<String>,
    team_name: String,
    status: String,
    engine: String,
    engine_metadata: String,
    start_time: Option<DateTime<Utc>>,
    end_time: Option<DateTime<Utc>>,
}

impl BuildRow {
    fn into_build(self) -> Result<Build> {
        let status = self
            .status
            .parse::<BuildStatus>()
            .map_err(|_| StoreError::NotFound)?;
        Ok(Build {
            id: self.id,
            name: self.name,
            job_name: self.job_name,
            pipeline_id: self.pipeline_id,
            pipeline_name: self.pipeline_name,
            team_name: self.team_name,
            status,
            engine: self.engine,
            engine_metadata: self.engine_metadata,
            start_time: self.start_time,
            end_time: self.end_time,
        })
    }
}

const SELECT_BUILD: &str = r#"
    SELECT id, name, pipeline_id, job_name, pipeline_name, team_name, status,
           engine, engine_metadata, start_time, end_time
    FROM builds
"#;

#[derive(sqlx::FromRow)]
struct VersionRow {
    id: i64,
    resource_name: String,
    version: serde_json::Value,
    metadata: serde_json::Value,
    enabled: bool,
    check_order: i64,
}

impl VersionRow {
    fn into_saved(self) -> Result<SavedVersion> {
        Ok(SavedVersion {
            id: self.id,
            resource_name: self.resource_name,
            version: serde_json::from_value(self.version)?,
            metadata: serde_json::from_value(self.metadata)?,
            enabled: self.enabled,
            check_order: self.check_order,
        })
    }
}

#[derive(sqlx::FromRow)]
struct PipelineRow {
    id: i64,
    name: String,
    team_id: i64,
    team_name: String,
    paused: bool,
    version: i64,
}

impl From<PipelineRow> for SavedPipeline {
    fn from(row: PipelineRow) -> Self {
        SavedPipeline {
            id: row.id,
            name: row.name,
            team_id: row.team_id,
            team_name: row.team_name,
            paused: row.paused,
            config_version: row.version,
        }
    }
}

const SELECT_PIPELINE: &str = "SELECT id, name, team_id, team_name, paused, version FROM pipelines";

#[derive(sqlx::FromRow)]
struct ContainerRow {
    handle: String,
    identifier: serde_json::Value,
    metadata: serde_json::Value,
    expires_at: Option<DateTime<Utc>>,
}

impl ContainerRow {
    fn into_container(self) -> Result<Container> {
        Ok(Container {
            handle: self.handle,
            identifier: serde_json::from_value(self.identifier)?,
            metadata: serde_json::from_value(self.metadata)?,
            expires_at: self.expires_at,
        })
    }
}

#[derive(sqlx::FromRow)]
struct VolumeRow {
    worker_name: String,
    handle: String,
    resource_hash: String,
    resource_version: serde_json::Value,
    ttl_seconds: i64,
    expires_at: Option<DateTime<Utc>>,
}

impl VolumeRow {
    fn into_volume(self) -> Result<Volume> {
        Ok(Volume {
            worker_name: self.worker_name,
            handle: self.handle,
            resource_hash: self.resource_hash,
            resource_version: serde_json::from_value(self.resource_version)?,
            ttl: Duration::from_secs(self.ttl_seconds.max(0) as u64),
            expires_at: self.expires_at,
        })
    }
}

// ---------------------------------------------------------------------------
// trait implementations
// ---------------------------------------------------------------------------

#[async_trait]
impl TeamStore for PgStore {
    async fn save_team(&self, name: &str) -> Result<Team> {
        let row = sqlx::query(
            r#"
            INSERT INTO teams (name) VALUES ($1)
            ON CONFLICT (name) DO UPDATE SET name = EXCLUDED.name
            RETURNING id, name
            "#,
        )
        .bind(name)
        .fetch_one(&self.pool)
        .await?;

        Ok(Team {
            id: row.get("id"),
            name: row.get("name"),
        })
    }

    async fn get_team_by_name(&self, name: &str) -> Result<Option<Team>> {
        let row = sqlx::query("SELECT id, name FROM teams WHERE name = $1")
            .bind(name)
            .fetch_optional(&self.pool)
            .await?;

        Ok(row.map(|r| Team {
            id: r.get("id"),
            name: r.get("name"),
        }))
    }
}

#[async_trait]
impl PipelineStore for PgStore {
    async fn get_all_pipelines(&self) -> Result<Vec<SavedPipeline>> {
        let rows = sqlx::query_as::<_, PipelineRow>(&format!("{SELECT_PIPELINE} ORDER BY id"))
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.into_iter().map(Into::into).collect())
    }

    async fn get_pipeline_by_team_and_name(
        &self,
        team: &str,
        name: &str,
    ) -> Result<Option<SavedPipeline>> {
        let row = sqlx::query_as::<_, PipelineRow>(&format!(
            "{SELECT_PIPELINE} WHERE team_name = $1 AND name = $2"
        ))
        .bind(team)
        .bind(name)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(Into::into))
    }

    async fn save_config(
        &self,
        team: &str,
        name: &str,
        config: &Config,
        from_version: i64,
        initially_paused: PausedState,
    ) -> Result<(SavedPipeline, bool)> {
        config.validate()?;

        let team = self
            .get_team_by_name(team)
            .await?
            .ok_or(StoreError::NotFound)?;
        let config_json = serde_json::to_value(config)?;

        let existing = sqlx::query_as::<_, PipelineRow>(&format!(
            "{SELECT_PIPELINE} WHERE team_id = $1 AND name = $2"
        ))
        .bind(team.id)
        .bind(name)
        .fetch_optional(&self.pool)
        .await?;

        let (saved, created) = match existing {
            Some(row) => {
                if row.version != from_version {
                    return Err(StoreError::ConfigComparisonFailed);
                }
                let paused_sql = match initially_paused {
                    PausedState::Paused => "TRUE",
                    PausedState::Unpaused => "FALSE",
                    PausedState::NoChange => "paused",
                };
                let updated = sqlx::query_as::<_, PipelineRow>(&format!(
                    r#"
                    UPDATE pipelines SET config = $1, version = version + 1, paused = {paused_sql}
                    WHERE id = $2
                    RETURNING id, name, team_id, team_name, paused, version
                    "#
                ))
                .bind(config_json)
                .bind(row.id)
                .fetch_one(&self.pool)
                .await?;
                (SavedPipeline::from(updated), false)
            }
            None => {
                let inserted = sqlx::query_as::<_, PipelineRow>(
                    r#"
                    INSERT INTO pipelines (name, team_id, team_name, paused, config)
                    VALUES ($1, $2, $3, $4, $5)
                    RETURNING id, name, team_id, team_name, paused, version
                    "#,
                )
                .bind(name)
                .bind(team.id)
                .bind(&team.name)
                .bind(initially_paused == PausedState::Paused)
                .bind(config_json)
                .fetch_one(&self.pool)
                .await?;
                (SavedPipeline::from(inserted), true)
            }
        };

        for resource in &config.resources {
            self.ensure_resource(saved.id, &resource.name).await?;
        }
        for job in &config.jobs {
            self.ensure_job(saved.id, &job.name).await?;
        }

        Ok((saved, created))
    }

    async fn get_config(&self, pipeline_id: i64) -> Result<Option<(Config, i64)>> {
        let row = sqlx::query("SELECT config, version FROM pipelines WHERE id = $1")
            .bind(pipeline_id)
            .fetch_optional(&self.pool)
            .await?;

        match row {
            Some(row) => {
                let config: Config = serde_json::from_value(row.get("config"))?;
                Ok(Some((config, row.get("version"))))
            }
            None => Ok(None),
        }
    }

    async fn set_pipeline_paused(&self, pipeline_id: i64, paused: bool) -> Result<()> {
        sqlx::query("UPDATE pipelines SET paused = $1 WHERE id = $2")
            .bind(paused)
            .bind(pipeline_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn reset_build_preparations_with_pipeline_paused(&self, pipeline_id: i64) -> Result<()> {
        let builds = sqlx::query(
            "SELECT id FROM builds WHERE pipeline_id = $1 AND status = 'pending'",
        )
        .bind(pipeline_id)
        .fetch_all(&self.pool)
        .await?;

        for row in builds {
            let build_id: i64 = row.get("id");
            let mut prep = BuildPreparation::new(build_id);
            prep.paused_pipeline = PreparationStatus::Blocking;
            self.update_build_preparation(&prep).await?;
        }
        Ok(())
    }
}

#[async_trait]
impl BuildStore for PgStore {
    async fn create_job_build(&self, pipeline_id: i64, job: &str) -> Result<Build> {
        self.ensure_job(pipeline_id, job).await?;

        let pipeline = sqlx::query_as::<_, PipelineRow>(&format!(
            "{SELECT_PIPELINE} WHERE id = $1"
        ))
        .bind(pipeline_id)
        .fetch_optional(&self.pool)
        .await?
        .ok_or(StoreError::NotFound)?;

        let row = sqlx::query_as::<_, BuildRow>(
            r#"
            INSERT INTO builds (name, pipeline_id, job_name, pipeline_name, team_name, status)
            VALUES ((SELECT (COUNT(*) + 1)::TEXT FROM builds WHERE pipeline_id = $1 AND job_name = $2),
                    $1, $2, $3, $4, 'pending')
            RETURNING id, name, pipeline_id, job_name, pipeline_name, team_name, status,
                      engine, engine_metadata, start_time, end_time
            "#,
        )
        .bind(pipeline_id)
        .bind(job)
        .bind(&pipeline.name)
        .bind(&pipeline.team_name)
        .fetch_one(&self.pool)
        .await?;

        row.into_build()
    }

    async fn create_job_build_for_candidate_inputs(
        &self,
        pipeline_id: i64,
        job: &str,
    ) -> Result<(Build, bool)> {
        let pending = sqlx::query_as::<_, BuildRow>(&format!(
            "{SELECT_BUILD} WHERE pipeline_id = $1 AND job_name = $2 AND status = 'pending' ORDER BY id LIMIT 1"
        ))
        .bind(pipeline_id)
        .bind(job)
        .fetch_optional(&self.pool)
        .await?;

        if let Some(row) = pending {
            return Ok((row.into_build()?, false));
        }

        let build = self.create_job_build(pipeline_id, job).await?;
        Ok((build, true))
    }

    async fn create_one_off_build(&self, team_id: i64) -> Result<Build> {
        let team = sqlx::query("SELECT name FROM teams WHERE id = $1")
            .bind(team_id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or(StoreError::NotFound)?;
        let team_name: String = team.get("name");

        let row = sqlx::query_as::<_, BuildRow>(
            r#"
            INSERT INTO builds (name, team_name, status)
            VALUES ((SELECT (COUNT(*) + 1)::TEXT FROM builds WHERE job_name IS NULL), $1, 'pending')
            RETURNING id, name, pipeline_id, job_name, pipeline_name, team_name, status,
                      engine, engine_metadata, start_time, end_time
            "#,
        )
        .bind(team_name)
        .fetch_one(&self.pool)
        .await?;

        row.into_build()
    }

    async fn get_build(&self, build_id: i64) -> Result<Option<Build>> {
        let row = sqlx::query_as::<_, BuildRow>(&format!("{SELECT_BUILD} WHERE id = $1"))
            .bind(build_id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(BuildRow::into_build).transpose()
    }

    async fn get_all_started_builds(&self) -> Result<Vec<Build>> {
        let rows = sqlx::query_as::<_, BuildRow>(&format!(
            "{SELECT_BUILD} WHERE status = 'started' ORDER BY id"
        ))
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(BuildRow::into_build).collect()
    }

    async fn get_next_pending_build(&self, pipeline_id: i64, job: &str) -> Result<Option<Build>> {
        let row = sqlx::query_as::<_, BuildRow>(&format!(
            "{SELECT_BUILD} WHERE pipeline_id = $1 AND job_name = $2 AND status = 'pending' ORDER BY id LIMIT 1"
        ))
        .bind(pipeline_id)
        .bind(job)
        .fetch_optional(&self.pool)
        .await?;
        row.map(BuildRow::into_build).transpose()
    }

    async fn get_job_build_for_inputs(
        &self,
        pipeline_id: i64,
        job: &str,
        inputs: &[BuildInput],
    ) -> Result<Option<Build>> {
        if inputs.is_empty() {
            return Ok(None);
        }

        let builds = sqlx::query_as::<_, BuildRow>(&format!(
            "{SELECT_BUILD} WHERE pipeline_id = $1 AND job_name = $2 ORDER BY id DESC"
        ))
        .bind(pipeline_id)
        .bind(job)
        .fetch_all(&self.pool)
        .await?;

        for row in builds {
            let build = row.into_build()?;
            let recorded = self.get_build_inputs(build.id).await?;
            let all_match = inputs.iter().all(|input| {
                recorded.iter().any(|r| {
                    r.name == input.name
                        && r.resource == input.resource
                        && r.version == input.version
                })
            });
            if all_match && recorded.len() >= inputs.len() {
                return Ok(Some(build));
            }
        }
        Ok(None)
    }

    async fn get_running_builds_of_job(&self, pipeline_id: i64, job: &str) -> Result<Vec<Build>> {
        let rows = sqlx::query_as::<_, BuildRow>(&format!(
            "{SELECT_BUILD} WHERE pipeline_id = $1 AND job_name = $2 AND status IN ('scheduled', 'started')"
        ))
        .bind(pipeline_id)
        .bind(job)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(BuildRow::into_build).collect()
    }

    async fn start_build(
        &self,
        build_id: i64,
        engine: &str,
        engine_metadata: &str,
    ) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE builds SET status = 'started', engine = $2, engine_metadata = $3, start_time = now()
            WHERE id = $1 AND status IN ('pending', 'scheduled') AND NOT aborted
            "#,
        )
        .bind(build_id)
        .bind(engine)
        .bind(engine_metadata)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Ok(false);
        }

        self.append_event(
            build_id,
            &Event::Status {
                status: BuildStatus::Started,
                time: Utc::now().timestamp(),
            },
        )
        .await?;
        Ok(true)
    }

    async fn finish_build(&self, build_id: i64, status: BuildStatus) -> Result<()> {
        if !status.is_terminal() {
            let from = self
                .get_build(build_id)
                .await?
                .map(|b| b.status)
                .unwrap_or(BuildStatus::Started);
            return Err(StoreError::IllegalTransition { from, to: status });
        }

        let result = sqlx::query(&format!(
            "UPDATE builds SET status = $2, end_time = now() WHERE id = $1 AND status NOT IN {TERMINAL_STATUSES}"
        ))
        .bind(build_id)
        .bind(status.as_str())
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Ok(());
        }

        self.append_event(
            build_id,
            &Event::Status {
                status,
                time: Utc::now().timestamp(),
            },
        )
        .await?;
        Ok(())
    }

    async fn error_build(&self, build_id: i64, message: &str) -> Result<()> {
        self.append_event(
            build_id,
            &Event::Error {
                message: message.to_string(),
                origin: None,
            },
        )
        .await?;
        self.finish_build(build_id, BuildStatus::Errored).await
    }

    async fn abort_build(&self, build_id: i64) -> Result<()> {
        let build = self.get_build(build_id).await?.ok_or(StoreError::NotFound)?;

        match build.status {
            status if status.is_terminal() => Ok(()),
            BuildStatus::Pending | BuildStatus::Scheduled => {
                self.finish_build(build_id, BuildStatus::Aborted).await
            }
            _ => {
                sqlx::query("UPDATE builds SET aborted = TRUE WHERE id = $1")
                    .bind(build_id)
                    .execute(&self.pool)
                    .await?;
                Ok(())
            }
        }
    }

    async fn abort_notifier(&self, build_id: i64) -> Result<AbortNotifier> {
        let (tx, rx) = watch::channel(false);
        let pool = self.pool.clone();

        // NOTIFY would need a dedicated connection per build; a slow poll
        // is enough for the abort path.
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(Duration::from_secs(1)).await;
                if tx.is_closed() {
                    return;
                }
                let row = sqlx::query("SELECT aborted, status FROM builds WHERE id = $1")
                    .bind(build_id)
                    .fetch_optional(&pool)
                    .await;
                match row {
                    Ok(Some(row)) => {
                        let aborted: bool = row.get("aborted");
                        let status: String = row.get("status");
                        if aborted {
                            let _ = tx.send(true);
                            return;
                        }
                        if status
                            .parse::<BuildStatus>()
                            .map(BuildStatus::is_terminal)
                            .unwrap_or(true)
                        {
                            return;
                        }
                    }
                    Ok(None) => return,
                    Err(err) => {
                        tracing::warn!(build_id, error = %err, "abort poll failed");
                    }
                }
            }
        });

        Ok(AbortNotifier::new(rx))
    }

    async fn update_build_to_scheduled(&self, build_id: i64) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE builds SET status = 'scheduled' WHERE id = $1 AND status = 'pending'",
        )
        .bind(build_id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn save_build_input(&self, build_id: i64, input: &BuildInput) -> Result<SavedVersion> {
        let build = self.get_build(build_id).await?.ok_or(StoreError::NotFound)?;
        let pipeline_id = build.pipeline_id.unwrap_or(0);

        let saved = self
            .upsert_version(pipeline_id, &input.resource, &input.version, &input.metadata, false)
            .await?;

        let first_occurrence = match &build.job_name {
            Some(job) => {
                let row = sqlx::query(
                    r#"
                    SELECT COUNT(*) AS n FROM build_inputs bi
                    JOIN builds b ON b.id = bi.build_id
                    WHERE b.pipeline_id = $1 AND b.job_name = $2 AND b.id != $3 AND bi.version_id = $4
                    "#,
                )
                .bind(pipeline_id)
                .bind(job)
                .bind(build_id)
                .bind(saved.id)
                .fetch_one(&self.pool)
                .await?;
                let n: i64 = row.get("n");
                n == 0
            }
            None => true,
        };

        sqlx::query(
            r#"
            INSERT INTO build_inputs (build_id, name, version_id, first_occurrence)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (build_id, name) DO UPDATE SET
                version_id = EXCLUDED.version_id,
                first_occurrence = EXCLUDED.first_occurrence
            "#,
        )
        .bind(build_id)
        .bind(&input.name)
        .bind(saved.id)
        .bind(first_occurrence)
        .execute(&self.pool)
        .await?;

        Ok(saved)
    }

    async fn save_build_output(
        &self,
        build_id: i64,
        resource: &str,
        version: &Version,
    ) -> Result<SavedVersion> {
        let build = self.get_build(build_id).await?.ok_or(StoreError::NotFound)?;
        let pipeline_id = build.pipeline_id.unwrap_or(0);

        let saved = self
            .upsert_version(pipeline_id, resource, version, &[], false)
            .await?;

        sqlx::query(
            r#"
            INSERT INTO build_outputs (build_id, version_id, resource_name)
            VALUES ($1, $2, $3) ON CONFLICT DO NOTHING
            "#,
        )
        .bind(build_id)
        .bind(saved.id)
        .bind(resource)
        .execute(&self.pool)
        .await?;

        Ok(saved)
    }

    async fn get_build_inputs(&self, build_id: i64) -> Result<Vec<BuildInput>> {
        let rows = sqlx::query(
            r#"
            SELECT bi.name, bi.first_occurrence, vr.resource_name, vr.version, vr.metadata
            FROM build_inputs bi
            JOIN versioned_resources vr ON vr.id = bi.version_id
            WHERE bi.build_id = $1
            ORDER BY bi.name
            "#,
        )
        .bind(build_id)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(|row| {
                Ok(BuildInput {
                    name: row.get("name"),
                    resource: row.get("resource_name"),
                    version: serde_json::from_value(row.get("version"))?,
                    metadata: serde_json::from_value(row.get("metadata"))?,
                    first_occurrence: row.get("first_occurrence"),
                })
            })
            .collect()
    }

    async fn get_build_outputs(&self, build_id: i64) -> Result<Vec<BuildOutput>> {
        let rows = sqlx::query(
            r#"
            SELECT bo.resource_name, vr.version
            FROM build_outputs bo
            JOIN versioned_resources vr ON vr.id = bo.version_id
            WHERE bo.build_id = $1
            ORDER BY bo.resource_name
            "#,
        )
        .bind(build_id)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(|row| {
                Ok(BuildOutput {
                    resource: row.get("resource_name"),
                    version: serde_json::from_value(row.get("version"))?,
                })
            })
            .collect()
    }

    async fn get_build_preparation(&self, build_id: i64) -> Result<Option<BuildPreparation>> {
        if self.get_build(build_id).await?.is_none() {
            return Ok(None);
        }

        let row = sqlx::query("SELECT prep FROM build_preparations WHERE build_id = $1")
            .bind(build_id)
            .fetch_optional(&self.pool)
            .await?;

        match row {
            Some(row) => Ok(Some(serde_json::from_value(row.get("prep"))?)),
            None => Ok(Some(BuildPreparation::new(build_id))),
        }
    }

    async fn update_build_preparation(&self, prep: &BuildPreparation) -> Result<()> {
        let prep_json = serde_json::to_value(prep)?;
        sqlx::query(
            r#"
            INSERT INTO build_preparations (build_id, prep) VALUES ($1, $2)
            ON CONFLICT (build_id) DO UPDATE SET prep = EXCLUDED.prep
            "#,
        )
        .bind(prep.build_id)
        .bind(prep_json)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn job_builds_page(
        &self,
        pipeline_id: i64,
        job: &str,
        page: &Page,
    ) -> Result<(Vec<Build>, Pagination)> {
        let rows = sqlx::query_as::<_, BuildRow>(&format!(
            "{SELECT_BUILD} WHERE pipeline_id = $1 AND job_name = $2 ORDER BY id DESC"
        ))
        .bind(pipeline_id)
        .bind(job)
        .fetch_all(&self.pool)
        .await?;

        let builds: Vec<Build> = rows
            .into_iter()
            .map(BuildRow::into_build)
            .collect::<Result<_>>()?;
        Ok(paginate(builds, page, |b| b.id))
    }
}

struct PgEventCursor {
    pool: PgPool,
    build_id: i64,
    offset: i64,
    listener: Option<PgListener>,
    closed: bool,
}

#[async_trait]
impl EventCursor for PgEventCursor {
    async fn next(&mut self) -> std::result::Result<Event, EventStreamError> {
        loop {
            if self.closed {
                return Err(EventStreamError::Closed);
            }

            let row = sqlx::query(
                "SELECT payload FROM build_events WHERE build_id = $1 AND event_id = $2",
            )
            .bind(self.build_id)
            .bind(self.offset)
            .fetch_optional(&self.pool)
            .await
            .map_err(|_| EventStreamError::Closed)?;

            if let Some(row) = row {
                let event: Event = serde_json::from_value(row.get("payload"))
                    .map_err(|_| EventStreamError::Closed)?;
                self.offset += 1;
                return Ok(event);
            }

            let status: Option<String> =
                sqlx::query("SELECT status FROM builds WHERE id = $1")
                    .bind(self.build_id)
                    .fetch_optional(&self.pool)
                    .await
                    .map_err(|_| EventStreamError::Closed)?
                    .map(|r| r.get("status"));

            if let Some(status) = status {
                if status
                    .parse::<BuildStatus>()
                    .map(BuildStatus::is_terminal)
                    .unwrap_or(false)
                {
                    return Err(EventStreamError::EndOfStream);
                }
            }

            if self.listener.is_none() {
                if let Ok(mut listener) = PgListener::connect_with(&self.pool).await {
                    if listener.listen(&event_channel(self.build_id)).await.is_ok() {
                        self.listener = Some(listener);
                    }
                }
            }

            match &mut self.listener {
                Some(listener) => {
                    let _ = tokio::time::timeout(Duration::from_secs(5), listener.recv()).await;
                }
                None => tokio::time::sleep(Duration::from_millis(500)).await,
            }
        }
    }

    async fn close(&mut self) {
        self.closed = true;
        self.listener = None;
    }
}

#[async_trait]
impl EventStore for PgStore {
    async fn save_build_event(&self, build_id: i64, event: &Event) -> Result<()> {
        self.append_event(build_id, event).await
    }

    async fn get_build_events(&self, build_id: i64, from: usize) -> Result<Box<dyn EventCursor>> {
        Ok(Box::new(PgEventCursor {
            pool: self.pool.clone(),
            build_id,
            offset: from as i64,
            listener: None,
            closed: false,
        }))
    }
}

#[async_trait]
impl VersionStore for PgStore {
    async fn save_resource_versions(
        &self,
        pipeline_id: i64,
        resource: &ResourceConfig,
        versions: &[(Version, Vec<MetadataField>)],
    ) -> Result<()> {
        for (version, metadata) in versions {
            self.upsert_version(pipeline_id, &resource.name, version, metadata, true)
                .await?;
        }
        Ok(())
    }

    async fn get_latest_versioned_resource(
        &self,
        pipeline_id: i64,
        resource: &str,
    ) -> Result<Option<SavedVersion>> {
        let row = sqlx::query_as::<_, VersionRow>(
            r#"
            SELECT id, resource_name, version, metadata, enabled, check_order
            FROM versioned_resources
            WHERE pipeline_id = $1 AND resource_name = $2
            ORDER BY check_order DESC LIMIT 1
            "#,
        )
        .bind(pipeline_id)
        .bind(resource)
        .fetch_optional(&self.pool)
        .await?;

        row.map(VersionRow::into_saved).transpose()
    }

    async fn get_resource_versions(
        &self,
        pipeline_id: i64,
        resource: &str,
        page: &Page,
    ) -> Result<(Vec<SavedVersion>, Pagination)> {
        let rows = sqlx::query_as::<_, VersionRow>(
            r#"
            SELECT id, resource_name, version, metadata, enabled, check_order
            FROM versioned_resources
            WHERE pipeline_id = $1 AND resource_name = $2
            ORDER BY id DESC
            "#,
        )
        .bind(pipeline_id)
        .bind(resource)
        .fetch_all(&self.pool)
        .await?;

        let versions: Vec<SavedVersion> = rows
            .into_iter()
            .map(VersionRow::into_saved)
            .collect::<Result<_>>()?;
        Ok(paginate(versions, page, |v| v.id))
    }

    async fn get_version_by_id(&self, version_id: i64) -> Result<Option<SavedVersion>> {
        let row = sqlx::query_as::<_, VersionRow>(
            r#"
            SELECT id, resource_name, version, metadata, enabled, check_order
            FROM versioned_resources WHERE id = $1
            "#,
        )
        .bind(version_id)
        .fetch_optional(&self.pool)
        .await?;
        row.map(VersionRow::into_saved).transpose()
    }

    async fn enable_versioned_resource(&self, version_id: i64) -> Result<()> {
        sqlx::query("UPDATE versioned_resources SET enabled = TRUE WHERE id = $1")
            .bind(version_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn disable_versioned_resource(&self, version_id: i64) -> Result<()> {
        sqlx::query("UPDATE versioned_resources SET enabled = FALSE WHERE id = $1")
            .bind(version_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn load_versions_db(&self, pipeline_id: i64) -> Result<VersionsDb> {
        let mut tx = self.pool.begin().await?;

        let resource_rows = sqlx::query("SELECT id, name FROM resources WHERE pipeline_id = $1")
            .bind(pipeline_id)
            .fetch_all(&mut *tx)
            .await?;
        let resource_ids: HashMap<String, i64> = resource_rows
            .into_iter()
            .map(|r| (r.get("name"), r.get("id")))
            .collect();

        let job_rows = sqlx::query("SELECT id, name FROM jobs WHERE pipeline_id = $1")
            .bind(pipeline_id)
            .fetch_all(&mut *tx)
            .await?;
        let job_ids: HashMap<String, i64> = job_rows
            .into_iter()
            .map(|r| (r.get("name"), r.get("id")))
            .collect();

        let version_rows = sqlx::query(
            r#"
            SELECT vr.id AS version_id, r.id AS resource_id, vr.check_order
            FROM versioned_resources vr
            JOIN resources r ON r.pipeline_id = vr.pipeline_id AND r.name = vr.resource_name
            WHERE vr.pipeline_id = $1 AND vr.enabled
            "#,
        )
        .bind(pipeline_id)
        .fetch_all(&mut *tx)
        .await?;
        let resource_versions = version_rows
            .into_iter()
            .map(|r| ResourceVersion {
                version_id: r.get("version_id"),
                resource_id: r.get("resource_id"),
                check_order: r.get("check_order"),
            })
            .collect();

        let output_rows = sqlx::query(
            r#"
            SELECT bo.version_id, r.id AS resource_id, b.id AS build_id, j.id AS job_id
            FROM build_outputs bo
            JOIN builds b ON b.id = bo.build_id
            JOIN jobs j ON j.pipeline_id = b.pipeline_id AND j.name = b.job_name
            JOIN versioned_resources vr ON vr.id = bo.version_id
            JOIN resources r ON r.pipeline_id = vr.pipeline_id AND r.name = vr.resource_name
            WHERE b.pipeline_id = $1 AND b.status = 'succeeded'
            "#,
        )
        .bind(pipeline_id)
        .fetch_all(&mut *tx)
        .await?;
        let build_outputs = output_rows
            .into_iter()
            .map(|r| BuildVersion {
                version_id: r.get("version_id"),
                resource_id: r.get("resource_id"),
                build_id: r.get("build_id"),
                job_id: r.get("job_id"),
            })
            .collect();

        let input_rows = sqlx::query(
            r#"
            SELECT bi.version_id, r.id AS resource_id, b.id AS build_id, j.id AS job_id
            FROM build_inputs bi
            JOIN builds b ON b.id = bi.build_id
            JOIN jobs j ON j.pipeline_id = b.pipeline_id AND j.name = b.job_name
            JOIN versioned_resources vr ON vr.id = bi.version_id
            JOIN resources r ON r.pipeline_id = vr.pipeline_id AND r.name = vr.resource_name
            WHERE b.pipeline_id = $1 AND b.status = 'succeeded'
            "#,
        )
        .bind(pipeline_id)
        .fetch_all(&mut *tx)
        .await?;
        let build_inputs = input_rows
            .into_iter()
            .map(|r| BuildVersion {
                version_id: r.get("version_id"),
                resource_id: r.get("resource_id"),
                build_id: r.get("build_id"),
                job_id: r.get("job_id"),
            })
            .collect();

        tx.commit().await?;

        Ok(VersionsDb {
            resource_versions,
            build_outputs,
            build_inputs,
            job_ids,
            resource_ids,
        })
    }
}

#[async_trait]
impl ContainerStore for PgStore {
    async fn create_container(&self, container: &Container, ttl: Duration) -> Result<Container> {
        container.identifier.validate().map_err(StoreError::Identifier)?;

        let expires_at = if ttl.is_zero() {
            None
        } else {
            Some(Utc::now() + chrono::Duration::from_std(ttl).unwrap_or_default())
        };

        sqlx::query(
            r#"
            INSERT INTO containers (handle, identifier, metadata, expires_at)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (handle) DO UPDATE SET
                identifier = EXCLUDED.identifier,
                metadata = EXCLUDED.metadata,
                expires_at = EXCLUDED.expires_at
            "#,
        )
        .bind(&container.handle)
        .bind(serde_json::to_value(&container.identifier)?)
        .bind(serde_json::to_value(&container.metadata)?)
        .bind(expires_at)
        .execute(&self.pool)
        .await?;

        let mut saved = container.clone();
        saved.expires_at = expires_at;
        Ok(saved)
    }

    async fn get_container(&self, handle: &str) -> Result<Option<Container>> {
        let row = sqlx::query_as::<_, ContainerRow>(
            "SELECT handle, identifier, metadata, expires_at FROM containers WHERE handle = $1",
        )
        .bind(handle)
        .fetch_optional(&self.pool)
        .await?;
        row.map(ContainerRow::into_container).transpose()
    }

    async fn find_container_by_identifier(
        &self,
        identifier: &ContainerIdentifier,
    ) -> Result<Option<Container>> {
        identifier.validate().map_err(StoreError::Identifier)?;

        let rows = sqlx::query_as::<_, ContainerRow>(
            r#"
            SELECT handle, identifier, metadata, expires_at FROM containers
            WHERE expires_at IS NULL OR expires_at > now()
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        let mut matches = rows
            .into_iter()
            .map(ContainerRow::into_container)
            .collect::<Result<Vec<_>>>()?
            .into_iter()
            .filter(|c| identifier.matches(&c.identifier));

        let first = matches.next();
        if matches.next().is_some() {
            return Err(StoreError::Identifier(IdentifierError::Multiple));
        }
        Ok(first)
    }

    async fn find_containers_by_descriptors(
        &self,
        metadata: &ContainerMetadata,
    ) -> Result<Vec<Container>> {
        let rows = sqlx::query_as::<_, ContainerRow>(
            r#"
            SELECT handle, identifier, metadata, expires_at FROM containers
            WHERE expires_at IS NULL OR expires_at > now()
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(ContainerRow::into_container)
            .collect::<Result<Vec<_>>>()?
            .into_iter()
            .filter(|c| {
                (metadata.pipeline_name.is_empty()
                    || c.metadata.pipeline_name == metadata.pipeline_name)
                    && (metadata.job_name.is_empty() || c.metadata.job_name == metadata.job_name)
                    && (metadata.step_name.is_empty()
                        || c.metadata.step_name == metadata.step_name)
                    && (metadata.worker_name.is_empty()
                        || c.metadata.worker_name == metadata.worker_name)
                    && metadata
                        .container_type
                        .is_none_or(|t| c.metadata.container_type == Some(t))
            })
            .collect())
    }

    async fn update_expires_at_on_container(&self, handle: &str, ttl: Duration) -> Result<()> {
        let expires_at = if ttl.is_zero() {
            None
        } else {
            Some(Utc::now() + chrono::Duration::from_std(ttl).unwrap_or_default())
        };
        sqlx::query("UPDATE containers SET expires_at = $2 WHERE handle = $1")
            .bind(handle)
            .bind(expires_at)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn reap_container(&self, handle: &str) -> Result<()> {
        sqlx::query("DELETE FROM containers WHERE handle = $1")
            .bind(handle)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn get_expired_containers(&self) -> Result<Vec<Container>> {
        let rows = sqlx::query_as::<_, ContainerRow>(
            "SELECT handle, identifier, metadata, expires_at FROM containers WHERE expires_at <= now()",
        )
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(ContainerRow::into_container).collect()
    }
}

// ---------------------------------------------------------------------------
// Leases
// ---------------------------------------------------------------------------

struct PgLease {
    pool: PgPool,
    subject: String,
    refresher: tokio::task::JoinHandle<()>,
    broken: bool,
}

#[async_trait]
impl Lease for PgLease {
    async fn break_lease(&mut self) {
        if self.broken {
            return;
        }
        self.broken = true;
        self.refresher.abort();

        let result = sqlx::query(
            "UPDATE leases SET held = FALSE, last_invalidated = now() WHERE subject = $1",
        )
        .bind(&self.subject)
        .execute(&self.pool)
        .await;
        if let Err(err) = result {
            tracing::warn!(subject = %self.subject, error = %err, "failed to break lease");
        }
    }
}

impl Drop for PgLease {
    fn drop(&mut self) {
        if self.broken {
            return;
        }
        self.refresher.abort();
        let pool = self.pool.clone();
        let subject = self.subject.clone();
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            handle.spawn(async move {
                let _ = sqlx::query(
                    "UPDATE leases SET held = FALSE, last_invalidated = now() WHERE subject = $1",
                )
                .bind(subject)
                .execute(&pool)
                .await;
            });
        }
    }
}

impl PgStore {
    async fn try_acquire(
        &self,
        subject: String,
        interval: Duration,
        immediate: bool,
    ) -> Result<Option<BoxLease>> {
        let secs = interval.as_secs_f64();

        let result = sqlx::query(
            r#"
            INSERT INTO leases (subject, held, last_invalidated) VALUES ($1, TRUE, now())
            ON CONFLICT (subject) DO UPDATE SET held = TRUE, last_invalidated = now()
            WHERE leases.held = FALSE
              AND ($3 OR now() - leases.last_invalidated > make_interval(secs => $2))
            "#,
        )
        .bind(&subject)
        .bind(secs)
        .bind(immediate)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Ok(None);
        }

        let pool = self.pool.clone();
        let refresh_subject = subject.clone();
        let refresh_every = (interval / 4).max(Duration::from_millis(100));
        let refresher = tokio::spawn(async move {
            loop {
                tokio::time::sleep(refresh_every).await;
                let result = sqlx::query(
                    "UPDATE leases SET last_invalidated = now() WHERE subject = $1 AND held",
                )
                .bind(&refresh_subject)
                .execute(&pool)
                .await;
                match result {
                    Ok(done) if done.rows_affected() == 0 => return,
                    Ok(_) => {}
                    Err(err) => {
                        tracing::warn!(subject = %refresh_subject, error = %err, "lease refresh failed");
                    }
                }
            }
        });

        Ok(Some(Box::new(PgLease {
            pool: self.pool.clone(),
            subject,
            refresher,
            broken: false,
        })))
    }
}

#[async_trait]
impl LeaseStore for PgStore {
    async fn lease_scheduling(
        &self,
        pipeline_id: i64,
        interval: Duration,
    ) -> Result<Option<BoxLease>> {
        self.try_acquire(format!("pipeline:{pipeline_id}:schedule"), interval, false)
            .await
    }

    async fn lease_resource_checking(
        &self,
        pipeline_id: i64,
        resource: &str,
        interval: Duration,
        immediate: bool,
    ) -> Result<Option<BoxLease>> {
        self.try_acquire(
            format!("resource:{pipeline_id}/{resource}:check"),
            interval,
            immediate,
        )
        .await
    }

    async fn lease_build_scheduling(
        &self,
        build_id: i64,
        interval: Duration,
    ) -> Result<Option<BoxLease>> {
        self.try_acquire(format!("build:{build_id}:schedule"), interval, false)
            .await
    }

    async fn lease_build_tracking(
        &self,
        build_id: i64,
        interval: Duration,
    ) -> Result<Option<BoxLease>> {
        self.try_acquire(format!("build:{build_id}:track"), interval, false)
            .await
    }

    async fn lease_cache_invalidation(&self, interval: Duration) -> Result<Option<BoxLease>> {
        self.try_acquire("cache:invalidate".to_string(), interval, false)
            .await
    }
}

#[async_trait]
impl VolumeStore for PgStore {
    async fn insert_volume(&self, volume: &Volume) -> Result<()> {
        let expires_at = if volume.ttl.is_zero() {
            None
        } else {
            Some(Utc::now() + chrono::Duration::from_std(volume.ttl).unwrap_or_default())
        };

        sqlx::query(
            r#"
            INSERT INTO volumes (worker_name, handle, resource_hash, resource_version, ttl_seconds, expires_at)
            VALUES ($1, $2, $3, $4, $5, $6)
            ON CONFLICT (worker_name, handle) DO UPDATE SET
                resource_hash = EXCLUDED.resource_hash,
                resource_version = EXCLUDED.resource_version,
                ttl_seconds = EXCLUDED.ttl_seconds,
                expires_at = EXCLUDED.expires_at
            "#,
        )
        .bind(&volume.worker_name)
        .bind(&volume.handle)
        .bind(&volume.resource_hash)
        .bind(serde_json::to_value(&volume.resource_version)?)
        .bind(volume.ttl.as_secs() as i64)
        .bind(expires_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_volumes(&self) -> Result<Vec<Volume>> {
        let rows = sqlx::query_as::<_, VolumeRow>(
            r#"
            SELECT worker_name, handle, resource_hash, resource_version, ttl_seconds, expires_at
            FROM volumes
            "#,
        )
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(VolumeRow::into_volume).collect()
    }

    async fn set_volume_ttl(&self, worker_name: &str, handle: &str, ttl: Duration) -> Result<()> {
        let expires_at = if ttl.is_zero() {
            None
        } else {
            Some(Utc::now() + chrono::Duration::from_std(ttl).unwrap_or_default())
        };
        sqlx::query(
            r#"
            UPDATE volumes SET ttl_seconds = $3, expires_at = $4
            WHERE worker_name = $1 AND handle = $2
            "#,
        )
        .bind(worker_name)
        .bind(handle)
        .bind(ttl.as_secs() as i64)
        .bind(expires_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

#[async_trait]
impl PipeStore for PgStore {
    async fn create_pipe(&self, id: &str, url: &str) -> Result<()> {
        sqlx::query("INSERT INTO pipes (id, url) VALUES ($1, $2) ON CONFLICT DO NOTHING")
            .bind(id)
            .bind(url)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn get_pipe(&self, id: &str) -> Result<Option<Pipe>> {
        let row = sqlx::query("SELECT id, url FROM pipes WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|r| Pipe {
            id: r.get("id"),
            url: r.get("url"),
        }))
    }
}
