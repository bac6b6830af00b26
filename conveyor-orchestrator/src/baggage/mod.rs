//! Volume cache expiry.
//!
//! Cached resource volumes live forever while they hold the latest
//! enabled version of a configured resource; everything else gets the
//! old-resource grace period, including volumes for resources no pipeline
//! references anymore. Runs under the cache-invalidation lease so one
//! controller sweeps at a time.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use conveyor_core::{resource_hash, Version};
use conveyor_store::prelude::*;
use conveyor_store::Page;

pub struct BaggageCollector {
    store: Arc<dyn Store>,
    old_resource_grace_period: Duration,
}

impl BaggageCollector {
    pub fn new(store: Arc<dyn Store>, old_resource_grace_period: Duration) -> Self {
        BaggageCollector {
            store,
            old_resource_grace_period,
        }
    }

    pub async fn collect(&self) -> anyhow::Result<()> {
        let Some(mut lease) = self
            .store
            .lease_cache_invalidation(self.old_resource_grace_period)
            .await?
        else {
            return Ok(());
        };

        let result = self.sweep().await;
        lease.break_lease().await;
        result
    }

    async fn sweep(&self) -> anyhow::Result<()> {
        let latest = self.latest_versions().await?;

        for volume in self.store.get_volumes().await? {
            let keep = latest.get(&volume.resource_hash) == Some(&volume.resource_version);
            let ttl = if keep {
                Duration::ZERO
            } else {
                self.old_resource_grace_period
            };

            if volume.ttl != ttl {
                tracing::debug!(
                    worker = %volume.worker_name,
                    handle = %volume.handle,
                    ttl_secs = ttl.as_secs(),
                    "updating volume ttl"
                );
                self.store
                    .set_volume_ttl(&volume.worker_name, &volume.handle, ttl)
                    .await?;
            }
        }

        Ok(())
    }

    /// The latest enabled version of every resource configured in any
    /// pipeline, keyed by the resource's cache hash.
    async fn latest_versions(&self) -> anyhow::Result<HashMap<String, Version>> {
        let mut latest = HashMap::new();

        for pipeline in self.store.get_all_pipelines().await? {
            let Some((config, _)) = self.store.get_config(pipeline.id).await? else {
                continue;
            };

            for resource in &config.resources {
                let (versions, _) = self
                    .store
                    .get_resource_versions(pipeline.id, &resource.name, &Page::default())
                    .await?;

                let newest = versions
                    .iter()
                    .filter(|v| v.enabled)
                    .max_by_key(|v| v.check_order);

                if let Some(newest) = newest {
                    latest.insert(
                        resource_hash(&resource.resource_type, &resource.source),
                        newest.version.clone(),
                    );
                }
            }
        }

        Ok(latest)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use conveyor_core::{Config, ResourceConfig, Source, Volume};
    use conveyor_store::memory::MemoryStore;
    use conveyor_store::PausedState;

    const GRACE: Duration = Duration::from_secs(240);

    fn version(r: &str) -> Version {
        Version::from([("ref".to_string(), r.to_string())])
    }

    fn volume(handle: &str, hash: &str, version: Version) -> Volume {
        Volume {
            worker_name: "worker-a".to_string(),
            handle: handle.to_string(),
            resource_hash: hash.to_string(),
            resource_version: version,
            ttl: Duration::from_secs(999),
            expires_at: None,
        }
    }

    #[tokio::test]
    async fn latest_version_volumes_are_immortal_and_older_ones_expire() {
        let store = Arc::new(MemoryStore::new());
        store.save_team("some-team").await.unwrap();

        let resource = ResourceConfig {
            name: "some-resource".to_string(),
            resource_type: "git".to_string(),
            source: Source::from([("uri".to_string(), "http://example.com".into())]),
            ..Default::default()
        };
        let config = Config {
            resources: vec![resource.clone()],
            ..Default::default()
        };
        let (pipeline, _) = store
            .save_config("some-team", "some-pipeline", &config, 0, PausedState::Unpaused)
            .await
            .unwrap();

        store
            .save_resource_versions(
                pipeline.id,
                &resource,
                &[(version("older"), vec![]), (version("latest"), vec![])],
            )
            .await
            .unwrap();

        let hash = resource_hash("git", &resource.source);
        for v in [
            volume("older-1", &hash, version("older")),
            volume("older-2", &hash, version("older")),
            volume("latest-1", &hash, version("latest")),
            volume("latest-2", &hash, version("latest")),
        ] {
            store.insert_volume(&v).await.unwrap();
        }
        // a volume for a resource no pipeline references
        store
            .insert_volume(&volume("orphan", "s3{}", version("whatever")))
            .await
            .unwrap();

        let collector = BaggageCollector::new(store.clone(), GRACE);
        collector.collect().await.unwrap();

        let volumes = store.get_volumes().await.unwrap();
        for v in volumes {
            match v.handle.as_str() {
                "latest-1" | "latest-2" => assert_eq!(v.ttl, Duration::ZERO, "{}", v.handle),
                _ => assert_eq!(v.ttl, GRACE, "{}", v.handle),
            }
        }
    }

    #[tokio::test]
    async fn disabled_latest_versions_do_not_pin_volumes() {
        let store = Arc::new(MemoryStore::new());
        store.save_team("some-team").await.unwrap();

        let resource = ResourceConfig {
            name: "some-resource".to_string(),
            resource_type: "git".to_string(),
            ..Default::default()
        };
        let config = Config {
            resources: vec![resource.clone()],
            ..Default::default()
        };
        let (pipeline, _) = store
            .save_config("some-team", "some-pipeline", &config, 0, PausedState::Unpaused)
            .await
            .unwrap();

        store
            .save_resource_versions(
                pipeline.id,
                &resource,
                &[(version("older"), vec![]), (version("latest"), vec![])],
            )
            .await
            .unwrap();

        // disable the newest; the older one becomes the pinned version
        let latest = store
            .get_latest_versioned_resource(pipeline.id, "some-resource")
            .await
            .unwrap()
            .unwrap();
        store.disable_versioned_resource(latest.id).await.unwrap();

        let hash = resource_hash("git", &resource.source);
        store
            .insert_volume(&volume("older-1", &hash, version("older")))
            .await
            .unwrap();
        store
            .insert_volume(&volume("latest-1", &hash, version("latest")))
            .await
            .unwrap();

        let collector = BaggageCollector::new(store.clone(), GRACE);
        collector.collect().await.unwrap();

        let volumes = store.get_volumes().await.unwrap();
        for v in volumes {
            match v.handle.as_str() {
                "older-1" => assert_eq!(v.ttl, Duration::ZERO),
                _ => assert_eq!(v.ttl, GRACE),
            }
        }
    }
}
