//! Resource version discovery.
//!
//! One check loop per configured resource, all serialized through the
//! store's check lease so exactly one controller in the fleet checks a
//! resource per interval. The per-pipeline runner mirrors the config's
//! resource set onto the loops, restarting exited ones and tearing down
//! removed ones at their next safe point; an in-flight check always
//! completes.

use rand::Rng;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

use anyhow::{anyhow, Context};
use conveyor_core::parse_duration;
use conveyor_engine::worker::Client;
use conveyor_store::prelude::*;

#[derive(Clone)]
pub struct ResourceScanner {
    store: Arc<dyn Store>,
    workers: Arc<dyn Client>,
    default_interval: Duration,
}

impl ResourceScanner {
    pub fn new(store: Arc<dyn Store>, workers: Arc<dyn Client>, default_interval: Duration) -> Self {
        ResourceScanner {
            store,
            workers,
            default_interval,
        }
    }

    /// Check interval for a resource: its `check_every` or the default.
    pub fn check_interval(
        &self,
        check_every: Option<&str>,
    ) -> Duration {
        check_every
            .and_then(|s| parse_duration(s).ok())
            .unwrap_or(self.default_interval)
    }

    /// Periodic check under the interval lease; a no-op when the resource
    /// was checked recently or another check is in flight.
    pub async fn scan(&self, pipeline_id: i64, resource_name: &str) -> anyhow::Result<()> {
        self.scan_with_mode(pipeline_id, resource_name, false).await
    }

    /// On-demand check under the immediate lease; refused only while
    /// another check of the same resource is in flight, which counts as
    /// done.
    pub async fn scan_now(&self, pipeline_id: i64, resource_name: &str) -> anyhow::Result<()> {
        self.scan_with_mode(pipeline_id, resource_name, true).await
    }

    async fn scan_with_mode(
        &self,
        pipeline_id: i64,
        resource_name: &str,
        immediate: bool,
    ) -> anyhow::Result<()> {
        let (config, _) = self
            .store
            .get_config(pipeline_id)
            .await?
            .ok_or_else(|| anyhow!("pipeline {pipeline_id} has no config"))?;

        let resource = config
            .resource(resource_name)
            .ok_or_else(|| anyhow!("resource '{resource_name}' is not configured"))?
            .clone();

        let interval = self.check_interval(resource.check_every.as_deref());

        let Some(mut lease) = self
            .store
            .lease_resource_checking(pipeline_id, resource_name, interval, immediate)
            .await?
        else {
            tracing::debug!(pipeline_id, resource = resource_name, "check lease not held");
            return Ok(());
        };

        let from = self
            .store
            .get_latest_versioned_resource(pipeline_id, resource_name)
            .await?
            .map(|v| v.version);

        let result = self
            .workers
            .check(&resource.resource_type, &resource.source, from)
            .await
            .context("resource check failed");

        match result {
            Ok(versions) => {
                tracing::debug!(
                    pipeline_id,
                    resource = resource_name,
                    count = versions.len(),
                    "found new versions"
                );
                let versions: Vec<_> = versions.into_iter().map(|v| (v, Vec::new())).collect();
                self.store
                    .save_resource_versions(pipeline_id, &resource, &versions)
                    .await?;
                lease.break_lease().await;
                Ok(())
            }
            Err(err) => {
                lease.break_lease().await;
                Err(err)
            }
        }
    }
}

struct ResourceLoop {
    stop: watch::Sender<bool>,
    handle: tokio::task::JoinHandle<()>,
}

/// Keeps one check loop per resource of one pipeline, reconciling against
/// the config on a sync interval.
pub struct ScanRunner {
    scanner: ResourceScanner,
    store: Arc<dyn Store>,
    pipeline_id: i64,
    sync_interval: Duration,
}

impl ScanRunner {
    pub fn new(
        scanner: ResourceScanner,
        store: Arc<dyn Store>,
        pipeline_id: i64,
        sync_interval: Duration,
    ) -> Self {
        ScanRunner {
            scanner,
            store,
            pipeline_id,
            sync_interval,
        }
    }

    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let mut loops: HashMap<String, ResourceLoop> = HashMap::new();

        loop {
            match self.store.get_config(self.pipeline_id).await {
                Ok(Some((config, _))) => {
                    // drop loops for removed resources and crashed loops
                    let configured: Vec<String> =
                        config.resources.iter().map(|r| r.name.clone()).collect();
                    let stale: Vec<String> = loops
                        .keys()
                        .filter(|name| !configured.contains(name))
                        .cloned()
                        .collect();
                    for name in stale {
                        if let Some(resource_loop) = loops.remove(&name) {
                            let _ = resource_loop.stop.send(true);
                        }
                    }
                    loops.retain(|_, resource_loop| !resource_loop.handle.is_finished());

                    for resource in &config.resources {
                        if !loops.contains_key(&resource.name) {
                            loops.insert(
                                resource.name.clone(),
                                self.spawn_resource_loop(resource.name.clone(), resource.check_every.clone()),
                            );
                        }
                    }
                }
                Ok(None) => {
                    tracing::debug!(pipeline_id = self.pipeline_id, "pipeline gone; stopping scans");
                    break;
                }
                Err(err) => {
                    tracing::error!(pipeline_id = self.pipeline_id, error = %err, "failed to load config");
                }
            }

            tokio::select! {
                _ = tokio::time::sleep(self.sync_interval) => {}
                _ = shutdown.changed() => break,
            }
        }

        for (_, resource_loop) in loops {
            let _ = resource_loop.stop.send(true);
        }
    }

    fn spawn_resource_loop(&self, name: String, check_every: Option<String>) -> ResourceLoop {
        let (stop, mut stop_rx) = watch::channel(false);
        let scanner = self.scanner.clone();
        let pipeline_id = self.pipeline_id;

        let interval = scanner.check_interval(check_every.as_deref());

        let handle = tokio::spawn(async move {
            loop {
                // jitter so a fleet of loops doesn't tick in lockstep
                let jitter_max = (interval.as_millis() as u64 / 10).max(1);
                let jitter = rand::thread_rng().gen_range(0..=jitter_max);
                let tick = interval + Duration::from_millis(jitter);

                tokio::select! {
                    _ = tokio::time::sleep(tick) => {}
                    _ = stop_rx.changed() => return,
                }

                // run the check to completion even if a stop arrives
                if let Err(err) = scanner.scan(pipeline_id, &name).await {
                    tracing::error!(pipeline_id, resource = %name, error = %err, "check failed");
                }

                if *stop_rx.borrow() {
                    return;
                }
            }
        });

        ResourceLoop { stop, handle }
    }
}
