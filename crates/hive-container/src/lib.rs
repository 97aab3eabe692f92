#![forbid(unsafe_code)]
#![deny(missing_docs)]

//! **hive-container** – Thin adapter over the container engine.
//!
//! The [`ContainerDriver`] trait covers exactly what the lifecycle manager
//! needs: create, start, stop, remove, inspect, exec, logs, stats, and
//! label-based discovery. Container labels are the authoritative store of
//! agent identity; everything the lifecycle manager reconciles against lives
//! in them.
//!
//! Capability sets are two named presets – `restricted` and `full` – and
//! every creation path routes through one of them. Ad-hoc capability lists
//! cannot be expressed.
//!
//! The driver never retries; retries are policy and belong to callers.

use std::collections::HashMap;

use async_trait::async_trait;
use hive_types::{CapabilityProfile, HiveError, ResourceSpec};
use serde::{Deserialize, Serialize};

mod docker;
mod fake;

pub use docker::DockerDriver;
pub use fake::FakeDriver;

/// Capabilities dropped on every container.
pub const CAP_DROP: &[&str] = &["ALL"];

/// Tmpfs mount options applied to every container's scratch space.
pub const TMPFS_OPTS: &str = "rw,noexec,nosuid,size=256m";

/// Capabilities added back for a preset.
pub fn cap_add(profile: CapabilityProfile) -> &'static [&'static str] {
    match profile {
        CapabilityProfile::Restricted => &["NET_BIND_SERVICE"],
        CapabilityProfile::Full => &[
            "NET_BIND_SERVICE",
            "SETGID",
            "SETUID",
            "CHOWN",
            "SYS_CHROOT",
            "AUDIT_WRITE",
        ],
    }
}

//─────────────────────────────
//  Driver error taxonomy
//─────────────────────────────

/// Failure kinds surfaced to the lifecycle manager, each distinct so policy
/// can react per kind.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ContainerError {
    /// No container with that name.
    #[error("container not found: {0}")]
    NotFound(String),
    /// A container with that name already exists.
    #[error("container already exists: {0}")]
    AlreadyExists(String),
    /// The requested image is not present on the engine.
    #[error("image missing: {0}")]
    ImageMissing(String),
    /// The engine itself is unreachable or errored.
    #[error("container engine unavailable: {0}")]
    EngineUnavailable(String),
}

impl From<ContainerError> for HiveError {
    fn from(err: ContainerError) -> Self {
        match err {
            ContainerError::NotFound(name) => HiveError::NotFound(format!("container {name}")),
            ContainerError::AlreadyExists(name) => {
                HiveError::Conflict(format!("container {name} already exists"))
            }
            ContainerError::ImageMissing(image) => {
                HiveError::Validation(format!("image {image} is not available"))
            }
            ContainerError::EngineUnavailable(msg) => HiveError::DependencyUnavailable(msg),
        }
    }
}

/// Driver result alias.
pub type ContainerResult<T> = std::result::Result<T, ContainerError>;

//─────────────────────────────
//  Wire shapes
//─────────────────────────────

/// A bind mount.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct MountSpec {
    /// Host path or named volume.
    pub source: String,
    /// Path inside the container.
    pub target: String,
    /// Whether the mount is read-only.
    pub read_only: bool,
}

/// Everything needed to create a container.
#[derive(Debug, Clone, PartialEq)]
pub struct ContainerSpec {
    /// Container name.
    pub name: String,
    /// Image reference.
    pub image: String,
    /// Environment, `KEY=value` pairs.
    pub env: Vec<String>,
    /// Bind mounts.
    pub mounts: Vec<MountSpec>,
    /// Labels; the authoritative identity lives here.
    pub labels: HashMap<String, String>,
    /// Capability preset.
    pub capability_profile: CapabilityProfile,
    /// Resource limits.
    pub resources: ResourceSpec,
}

/// Observed runtime status of a container.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContainerStatus {
    /// Created but not started.
    Created,
    /// Running.
    Running,
    /// Exited or stopped.
    Exited,
}

/// Snapshot returned by `inspect`.
#[derive(Debug, Clone, PartialEq)]
pub struct ContainerInspect {
    /// Container name.
    pub name: String,
    /// Labels as stored on the engine.
    pub labels: HashMap<String, String>,
    /// Environment, `KEY=value` pairs.
    pub env: Vec<String>,
    /// Bind mounts.
    pub mounts: Vec<MountSpec>,
    /// Resource limits as configured on the engine.
    pub resources: ResourceSpec,
    /// Runtime status.
    pub status: ContainerStatus,
}

/// Point-in-time resource usage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContainerStats {
    /// CPU usage in percent of one core.
    pub cpu_percent: f64,
    /// Resident memory, bytes.
    pub memory_bytes: u64,
    /// Network bytes received.
    pub net_rx_bytes: u64,
    /// Network bytes transmitted.
    pub net_tx_bytes: u64,
}

//─────────────────────────────
//  Driver trait
//─────────────────────────────

/// Adapter over the container engine. Mutated only by the lifecycle manager;
/// all other components treat the engine as read-only.
#[async_trait]
pub trait ContainerDriver: Send + Sync {
    /// Create a container from `spec`. Fails with `already-exists` or
    /// `image-missing`; never pulls.
    async fn create(&self, spec: &ContainerSpec) -> ContainerResult<()>;

    /// Start a created or stopped container.
    async fn start(&self, name: &str) -> ContainerResult<()>;

    /// Stop a running container. Stopping a stopped container succeeds.
    async fn stop(&self, name: &str) -> ContainerResult<()>;

    /// Remove a container. The container must be stopped.
    async fn remove(&self, name: &str) -> ContainerResult<()>;

    /// Inspect name, labels, env, mounts, resources, and status.
    async fn inspect(&self, name: &str) -> ContainerResult<ContainerInspect>;

    /// All containers carrying `label_key`, running or not. Used by startup
    /// reconciliation to discover the fleet.
    async fn list_by_label(&self, label_key: &str) -> ContainerResult<Vec<ContainerInspect>>;

    /// Run `argv` inside the container and return the exit code.
    async fn exec(&self, name: &str, argv: &[String]) -> ContainerResult<i64>;

    /// Last `tail` log lines.
    async fn logs(&self, name: &str, tail: usize) -> ContainerResult<Vec<String>>;

    /// One-shot resource usage sample.
    async fn stats(&self, name: &str) -> ContainerResult<ContainerStats>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn full_preset_is_superset_of_restricted() {
        let restricted = cap_add(CapabilityProfile::Restricted);
        let full = cap_add(CapabilityProfile::Full);
        for cap in restricted {
            assert!(full.contains(cap));
        }
        assert!(full.contains(&"SYS_CHROOT"));
        assert!(!restricted.contains(&"SETUID"));
    }

    #[test]
    fn driver_errors_map_onto_taxonomy() {
        assert_eq!(HiveError::from(ContainerError::NotFound("x".into())).kind(), "not_found");
        assert_eq!(HiveError::from(ContainerError::AlreadyExists("x".into())).kind(), "conflict");
        assert_eq!(HiveError::from(ContainerError::ImageMissing("img".into())).kind(),
            "validation");
        assert_eq!(
            HiveError::from(ContainerError::EngineUnavailable("down".into())).kind(),
            "dependency_unavailable"
        );
    }
}
