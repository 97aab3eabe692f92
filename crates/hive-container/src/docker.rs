//! Docker engine driver (bollard).

use std::collections::HashMap;

use bollard::container::{
    Config, CreateContainerOptions, ListContainersOptions, LogsOptions, RemoveContainerOptions,
    StartContainerOptions, StatsOptions, StopContainerOptions,
};
use bollard::exec::{CreateExecOptions, StartExecResults};
use bollard::models::{ContainerStateStatusEnum, HostConfig};
use bollard::Docker;
use futures::StreamExt;
use hive_types::ResourceSpec;
use tracing::debug;

use crate::{
    cap_add, ContainerDriver, ContainerError, ContainerInspect, ContainerResult, ContainerSpec,
    ContainerStats, ContainerStatus, MountSpec, CAP_DROP, TMPFS_OPTS,
};

/// Seconds the engine waits before killing on stop.
const STOP_GRACE_SECS: i64 = 10;

/// [`ContainerDriver`] over a local Docker engine.
#[derive(Clone)]
pub struct DockerDriver {
    docker: Docker,
}

impl DockerDriver {
    /// Connect using the environment's default socket.
    pub fn connect() -> ContainerResult<Self> {
        let docker = Docker::connect_with_local_defaults()
            .map_err(|e| ContainerError::EngineUnavailable(e.to_string()))?;
        Ok(Self { docker })
    }

    fn map_err(name: &str, err: bollard::errors::Error) -> ContainerError {
        match err {
            bollard::errors::Error::DockerResponseServerError { status_code, message } => {
                match status_code {
                    404 if message.contains("No such image") => {
                        ContainerError::ImageMissing(message)
                    }
                    404 => ContainerError::NotFound(name.to_string()),
                    409 => ContainerError::AlreadyExists(name.to_string()),
                    _ => ContainerError::EngineUnavailable(format!("{status_code}: {message}")),
                }
            }
            other => ContainerError::EngineUnavailable(other.to_string()),
        }
    }

    fn host_config(spec: &ContainerSpec) -> HostConfig {
        let binds = spec
            .mounts
            .iter()
            .map(|m| {
                if m.read_only {
                    format!("{}:{}:ro", m.source, m.target)
                } else {
                    format!("{}:{}", m.source, m.target)
                }
            })
            .collect::<Vec<_>>();
        HostConfig {
            memory: Some((spec.resources.memory_mb * 1024 * 1024) as i64),
            nano_cpus: Some((spec.resources.cpus * 1_000_000_000.0) as i64),
            cap_drop: Some(CAP_DROP.iter().map(|c| c.to_string()).collect()),
            cap_add: Some(
                cap_add(spec.capability_profile).iter().map(|c| c.to_string()).collect(),
            ),
            binds: (!binds.is_empty()).then_some(binds),
            tmpfs: Some(HashMap::from([("/tmp".to_string(), TMPFS_OPTS.to_string())])),
            ..Default::default()
        }
    }
}

#[async_trait::async_trait]
impl ContainerDriver for DockerDriver {
    async fn create(&self, spec: &ContainerSpec) -> ContainerResult<()> {
        let options = CreateContainerOptions { name: spec.name.clone(), platform: None };
        let config = Config {
            image: Some(spec.image.clone()),
            env: Some(spec.env.clone()),
            labels: Some(spec.labels.clone()),
            host_config: Some(Self::host_config(spec)),
            ..Default::default()
        };
        self.docker
            .create_container(Some(options), config)
            .await
            .map_err(|e| Self::map_err(&spec.name, e))?;
        debug!(container = %spec.name, image = %spec.image, "container created");
        Ok(())
    }

    async fn start(&self, name: &str) -> ContainerResult<()> {
        self.docker
            .start_container(name, None::<StartContainerOptions<String>>)
            .await
            .map_err(|e| Self::map_err(name, e))
    }

    async fn stop(&self, name: &str) -> ContainerResult<()> {
        match self
            .docker
            .stop_container(name, Some(StopContainerOptions { t: STOP_GRACE_SECS }))
            .await
        {
            Ok(()) => Ok(()),
            // 304: already stopped. Stop is idempotent.
            Err(bollard::errors::Error::DockerResponseServerError { status_code: 304, .. }) => {
                Ok(())
            }
            Err(e) => Err(Self::map_err(name, e)),
        }
    }

    async fn remove(&self, name: &str) -> ContainerResult<()> {
        self.docker
            .remove_container(
                name,
                Some(RemoveContainerOptions { force: false, ..Default::default() }),
            )
            .await
            .map_err(|e| Self::map_err(name, e))
    }

    async fn inspect(&self, name: &str) -> ContainerResult<ContainerInspect> {
        let response = self
            .docker
            .inspect_container(name, None)
            .await
            .map_err(|e| Self::map_err(name, e))?;

        let config = response.config.unwrap_or_default();
        let host_config = response.host_config.unwrap_or_default();
        let status = match response.state.and_then(|s| s.status) {
            Some(ContainerStateStatusEnum::RUNNING) => ContainerStatus::Running,
            Some(ContainerStateStatusEnum::CREATED) => ContainerStatus::Created,
            _ => ContainerStatus::Exited,
        };
        let mounts = response
            .mounts
            .unwrap_or_default()
            .into_iter()
            .map(|m| MountSpec {
                source: m.source.unwrap_or_default(),
                target: m.destination.unwrap_or_default(),
                read_only: !m.rw.unwrap_or(true),
            })
            .collect();
        Ok(ContainerInspect {
            name: response
                .name
                .map(|n| n.trim_start_matches('/').to_string())
                .unwrap_or_else(|| name.to_string()),
            labels: config.labels.unwrap_or_default(),
            env: config.env.unwrap_or_default(),
            mounts,
            resources: ResourceSpec {
                cpus: host_config.nano_cpus.unwrap_or(0) as f64 / 1_000_000_000.0,
                memory_mb: (host_config.memory.unwrap_or(0) / (1024 * 1024)).max(0) as u64,
            },
            status,
        })
    }

    async fn list_by_label(&self, label_key: &str) -> ContainerResult<Vec<ContainerInspect>> {
        let options = ListContainersOptions {
            all: true,
            filters: HashMap::from([("label".to_string(), vec![label_key.to_string()])]),
            ..Default::default()
        };
        let summaries = self
            .docker
            .list_containers(Some(options))
            .await
            .map_err(|e| Self::map_err("<list>", e))?;

        let mut inspected = Vec::with_capacity(summaries.len());
        for summary in summaries {
            let Some(name) = summary
                .names
                .as_ref()
                .and_then(|n| n.first())
                .map(|n| n.trim_start_matches('/').to_string())
            else {
                continue;
            };
            inspected.push(self.inspect(&name).await?);
        }
        Ok(inspected)
    }

    async fn exec(&self, name: &str, argv: &[String]) -> ContainerResult<i64> {
        let exec = self
            .docker
            .create_exec(
                name,
                CreateExecOptions {
                    cmd: Some(argv.to_vec()),
                    attach_stdout: Some(true),
                    attach_stderr: Some(true),
                    ..Default::default()
                },
            )
            .await
            .map_err(|e| Self::map_err(name, e))?;

        if let StartExecResults::Attached { mut output, .. } = self
            .docker
            .start_exec(&exec.id, None)
            .await
            .map_err(|e| Self::map_err(name, e))?
        {
            while output.next().await.is_some() {}
        }

        let inspect = self
            .docker
            .inspect_exec(&exec.id)
            .await
            .map_err(|e| Self::map_err(name, e))?;
        Ok(inspect.exit_code.unwrap_or(-1))
    }

    async fn logs(&self, name: &str, tail: usize) -> ContainerResult<Vec<String>> {
        let options = LogsOptions::<String> {
            stdout: true,
            stderr: true,
            tail: tail.to_string(),
            ..Default::default()
        };
        let mut stream = self.docker.logs(name, Some(options));
        let mut lines = Vec::new();
        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(|e| Self::map_err(name, e))?;
            lines.push(chunk.to_string());
        }
        Ok(lines)
    }

    async fn stats(&self, name: &str) -> ContainerResult<ContainerStats> {
        let options = StatsOptions { stream: false, one_shot: true };
        let mut stream = self.docker.stats(name, Some(options));
        let Some(sample) = stream.next().await else {
            return Err(ContainerError::EngineUnavailable(format!(
                "no stats sample for {name}"
            )));
        };
        let sample = sample.map_err(|e| Self::map_err(name, e))?;

        let cpu_delta = sample.cpu_stats.cpu_usage.total_usage as f64
            - sample.precpu_stats.cpu_usage.total_usage as f64;
        let system_delta = sample.cpu_stats.system_cpu_usage.unwrap_or(0) as f64
            - sample.precpu_stats.system_cpu_usage.unwrap_or(0) as f64;
        let online = sample.cpu_stats.online_cpus.unwrap_or(1) as f64;
        let cpu_percent = if system_delta > 0.0 {
            (cpu_delta / system_delta) * online * 100.0
        } else {
            0.0
        };

        let (net_rx_bytes, net_tx_bytes) = sample
            .networks
            .unwrap_or_default()
            .values()
            .fold((0u64, 0u64), |(rx, tx), net| (rx + net.rx_bytes, tx + net.tx_bytes));

        Ok(ContainerStats {
            cpu_percent,
            memory_bytes: sample.memory_stats.usage.unwrap_or(0),
            net_rx_bytes,
            net_tx_bytes,
        })
    }
}
