//! In-process fake driver.
//!
//! Backs lifecycle tests with the same observable semantics as the Docker
//! driver: distinct error kinds, label-based discovery, and status
//! transitions. Also counts create calls so tests can assert how many
//! recreates a reconciliation pass performed.

use std::sync::atomic::{AtomicUsize, Ordering};

use dashmap::DashMap;

use crate::{
    ContainerDriver, ContainerError, ContainerInspect, ContainerResult, ContainerSpec,
    ContainerStats, ContainerStatus,
};

#[derive(Debug, Clone)]
struct FakeContainer {
    spec: ContainerSpec,
    status: ContainerStatus,
}

/// Table-backed [`ContainerDriver`] for tests.
#[derive(Default)]
pub struct FakeDriver {
    containers: DashMap<String, FakeContainer>,
    creates: AtomicUsize,
    /// Images the fake engine "has". Empty means every image exists.
    known_images: Vec<String>,
}

impl FakeDriver {
    /// Create an empty fake engine that accepts any image.
    pub fn new() -> Self {
        Self::default()
    }

    /// Restrict the fake engine to a set of known images.
    pub fn with_images(images: &[&str]) -> Self {
        Self { known_images: images.iter().map(|i| i.to_string()).collect(), ..Self::default() }
    }

    /// How many create calls the driver has served.
    pub fn create_count(&self) -> usize {
        self.creates.load(Ordering::SeqCst)
    }

    /// Whether a container exists, regardless of status.
    pub fn exists(&self, name: &str) -> bool {
        self.containers.contains_key(name)
    }
}

#[async_trait::async_trait]
impl ContainerDriver for FakeDriver {
    async fn create(&self, spec: &ContainerSpec) -> ContainerResult<()> {
        if self.containers.contains_key(&spec.name) {
            return Err(ContainerError::AlreadyExists(spec.name.clone()));
        }
        if !self.known_images.is_empty() && !self.known_images.contains(&spec.image) {
            return Err(ContainerError::ImageMissing(spec.image.clone()));
        }
        self.creates.fetch_add(1, Ordering::SeqCst);
        self.containers.insert(
            spec.name.clone(),
            FakeContainer { spec: spec.clone(), status: ContainerStatus::Created },
        );
        Ok(())
    }

    async fn start(&self, name: &str) -> ContainerResult<()> {
        let mut entry = self
            .containers
            .get_mut(name)
            .ok_or_else(|| ContainerError::NotFound(name.to_string()))?;
        entry.status = ContainerStatus::Running;
        Ok(())
    }

    async fn stop(&self, name: &str) -> ContainerResult<()> {
        let mut entry = self
            .containers
            .get_mut(name)
            .ok_or_else(|| ContainerError::NotFound(name.to_string()))?;
        entry.status = ContainerStatus::Exited;
        Ok(())
    }

    async fn remove(&self, name: &str) -> ContainerResult<()> {
        self.containers
            .remove(name)
            .map(|_| ())
            .ok_or_else(|| ContainerError::NotFound(name.to_string()))
    }

    async fn inspect(&self, name: &str) -> ContainerResult<ContainerInspect> {
        let entry = self
            .containers
            .get(name)
            .ok_or_else(|| ContainerError::NotFound(name.to_string()))?;
        Ok(ContainerInspect {
            name: name.to_string(),
            labels: entry.spec.labels.clone(),
            env: entry.spec.env.clone(),
            mounts: entry.spec.mounts.clone(),
            resources: entry.spec.resources,
            status: entry.status,
        })
    }

    async fn list_by_label(&self, label_key: &str) -> ContainerResult<Vec<ContainerInspect>> {
        let mut out = Vec::new();
        for entry in self.containers.iter() {
            if entry.spec.labels.contains_key(label_key) {
                out.push(ContainerInspect {
                    name: entry.key().clone(),
                    labels: entry.spec.labels.clone(),
                    env: entry.spec.env.clone(),
                    mounts: entry.spec.mounts.clone(),
                    resources: entry.spec.resources,
                    status: entry.status,
                });
            }
        }
        out.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(out)
    }

    async fn exec(&self, name: &str, _argv: &[String]) -> ContainerResult<i64> {
        if !self.containers.contains_key(name) {
            return Err(ContainerError::NotFound(name.to_string()));
        }
        Ok(0)
    }

    async fn logs(&self, name: &str, _tail: usize) -> ContainerResult<Vec<String>> {
        if !self.containers.contains_key(name) {
            return Err(ContainerError::NotFound(name.to_string()));
        }
        Ok(Vec::new())
    }

    async fn stats(&self, name: &str) -> ContainerResult<ContainerStats> {
        if !self.containers.contains_key(name) {
            return Err(ContainerError::NotFound(name.to_string()));
        }
        Ok(ContainerStats {
            cpu_percent: 0.0,
            memory_bytes: 0,
            net_rx_bytes: 0,
            net_tx_bytes: 0,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hive_types::{CapabilityProfile, ResourceSpec};
    use std::collections::HashMap;

    fn spec(name: &str, image: &str) -> ContainerSpec {
        ContainerSpec {
            name: name.to_string(),
            image: image.to_string(),
            env: vec![],
            mounts: vec![],
            labels: HashMap::from([("orch.agent.name".to_string(), name.to_string())]),
            capability_profile: CapabilityProfile::Restricted,
            resources: ResourceSpec::default(),
        }
    }

    #[tokio::test]
    async fn lifecycle_and_errors() {
        let driver = FakeDriver::with_images(&["agent:latest"]);

        assert!(matches!(
            driver.create(&spec("a", "missing:img")).await,
            Err(ContainerError::ImageMissing(_))
        ));

        driver.create(&spec("a", "agent:latest")).await.unwrap();
        assert!(matches!(
            driver.create(&spec("a", "agent:latest")).await,
            Err(ContainerError::AlreadyExists(_))
        ));

        driver.start("a").await.unwrap();
        assert_eq!(driver.inspect("a").await.unwrap().status, ContainerStatus::Running);
        driver.stop("a").await.unwrap();
        driver.remove("a").await.unwrap();
        assert!(matches!(driver.inspect("a").await, Err(ContainerError::NotFound(_))));
    }

    #[tokio::test]
    async fn discovery_by_label() {
        let driver = FakeDriver::new();
        driver.create(&spec("a", "agent:latest")).await.unwrap();
        driver.create(&spec("b", "agent:latest")).await.unwrap();

        let found = driver.list_by_label("orch.agent.name").await.unwrap();
        assert_eq!(found.len(), 2);
        assert_eq!(found[0].name, "a");
    }
}
