//! The engine seam: every engine API call the reconciler makes goes through
//! [`ContainerEngine`], so the state machine can be exercised against an
//! in-memory fake. [`DockerEngine`] is the production implementation.

use std::collections::HashMap;

use async_trait::async_trait;
use bollard::container::{
    Config, CreateContainerOptions, KillContainerOptions, ListContainersOptions,
    RemoveContainerOptions, StartContainerOptions, StopContainerOptions,
};
use bollard::errors::Error as BollardError;
use bollard::image::{CreateImageOptions, RemoveImageOptions, TagImageOptions};
use bollard::models::{ContainerInspectResponse, ContainerSummary, ImageInspect};
use bollard::volume::{CreateVolumeOptions, RemoveVolumeOptions};
use bollard::Docker;
use futures::TryStreamExt;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("not found: {0}")]
    NotFound(String),
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("engine api error: {0}")]
    Api(String),
}

impl EngineError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, EngineError::NotFound(_))
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, EngineError::Conflict(_))
    }
}

impl From<BollardError> for EngineError {
    fn from(err: BollardError) -> Self {
        match err {
            BollardError::DockerResponseServerError { status_code: 404, message } => {
                EngineError::NotFound(message)
            }
            BollardError::DockerResponseServerError { status_code: 409, message } => {
                EngineError::Conflict(message)
            }
            other => EngineError::Api(other.to_string()),
        }
    }
}

pub type EngineResult<T> = Result<T, EngineError>;

/// What the reconciler needs to know about an engine volume.
#[derive(Debug, Clone, Default)]
pub struct VolumeInfo {
    pub name: String,
    pub mountpoint: String,
}

#[async_trait]
pub trait ContainerEngine: Send + Sync {
    async fn list_containers(
        &self,
        filters: HashMap<String, Vec<String>>,
    ) -> EngineResult<Vec<ContainerSummary>>;
    async fn inspect_container(&self, id: &str) -> EngineResult<ContainerInspectResponse>;
    async fn create_container(&self, name: &str, config: Config<String>) -> EngineResult<String>;
    async fn start_container(&self, id: &str) -> EngineResult<()>;
    async fn stop_container(&self, id: &str, timeout_secs: i64) -> EngineResult<()>;
    async fn kill_container(&self, id: &str) -> EngineResult<()>;
    async fn remove_container(&self, id: &str) -> EngineResult<()>;

    async fn pull_image(&self, image: &str) -> EngineResult<()>;
    async fn inspect_image(&self, image: &str) -> EngineResult<ImageInspect>;
    async fn remove_image(&self, image: &str) -> EngineResult<()>;
    async fn tag_image(&self, image: &str, repo: &str, tag: &str) -> EngineResult<()>;

    async fn inspect_volume(&self, name: &str) -> EngineResult<VolumeInfo>;
    async fn create_volume(
        &self,
        name: &str,
        driver: &str,
        driver_opts: HashMap<String, String>,
    ) -> EngineResult<()>;
    async fn remove_volume(&self, name: &str, force: bool) -> EngineResult<()>;
}

/// Production engine backed by bollard over the local daemon socket.
#[derive(Clone)]
pub struct DockerEngine {
    docker: Docker,
}

impl DockerEngine {
    pub fn new(docker: Docker) -> Self {
        Self { docker }
    }

    pub fn connect() -> EngineResult<Self> {
        let docker = Docker::connect_with_local_defaults().map_err(EngineError::from)?;
        Ok(Self { docker })
    }
}

#[async_trait]
impl ContainerEngine for DockerEngine {
    async fn list_containers(
        &self,
        filters: HashMap<String, Vec<String>>,
    ) -> EngineResult<Vec<ContainerSummary>> {
        let options = ListContainersOptions::<String> {
            all: true,
            filters,
            ..Default::default()
        };
        Ok(self.docker.list_containers(Some(options)).await?)
    }

    async fn inspect_container(&self, id: &str) -> EngineResult<ContainerInspectResponse> {
        Ok(self.docker.inspect_container(id, None).await?)
    }

    async fn create_container(&self, name: &str, config: Config<String>) -> EngineResult<String> {
        let options = CreateContainerOptions {
            name: name.to_string(),
            ..Default::default()
        };
        let response = self.docker.create_container(Some(options), config).await?;
        Ok(response.id)
    }

    async fn start_container(&self, id: &str) -> EngineResult<()> {
        self.docker
            .start_container(id, None::<StartContainerOptions<String>>)
            .await?;
        Ok(())
    }

    async fn stop_container(&self, id: &str, timeout_secs: i64) -> EngineResult<()> {
        self.docker
            .stop_container(id, Some(StopContainerOptions { t: timeout_secs }))
            .await?;
        Ok(())
    }

    async fn kill_container(&self, id: &str) -> EngineResult<()> {
        self.docker
            .kill_container(id, Some(KillContainerOptions { signal: "SIGKILL" }))
            .await?;
        Ok(())
    }

    async fn remove_container(&self, id: &str) -> EngineResult<()> {
        self.docker
            .remove_container(id, Some(RemoveContainerOptions::default()))
            .await?;
        Ok(())
    }

    async fn pull_image(&self, image: &str) -> EngineResult<()> {
        let options = CreateImageOptions::<String> {
            from_image: image.to_string(),
            ..Default::default()
        };
        self.docker
            .create_image(Some(options), None, None)
            .try_collect::<Vec<_>>()
            .await?;
        Ok(())
    }

    async fn inspect_image(&self, image: &str) -> EngineResult<ImageInspect> {
        Ok(self.docker.inspect_image(image).await?)
    }

    async fn remove_image(&self, image: &str) -> EngineResult<()> {
        self.docker
            .remove_image(
                image,
                Some(RemoveImageOptions { force: true, ..Default::default() }),
                None,
            )
            .await?;
        Ok(())
    }

    async fn tag_image(&self, image: &str, repo: &str, tag: &str) -> EngineResult<()> {
        let options = TagImageOptions {
            repo: repo.to_string(),
            tag: tag.to_string(),
        };
        self.docker.tag_image(image, Some(options)).await?;
        Ok(())
    }

    async fn inspect_volume(&self, name: &str) -> EngineResult<VolumeInfo> {
        let volume = self.docker.inspect_volume(name).await?;
        Ok(VolumeInfo { name: volume.name, mountpoint: volume.mountpoint })
    }

    async fn create_volume(
        &self,
        name: &str,
        driver: &str,
        driver_opts: HashMap<String, String>,
    ) -> EngineResult<()> {
        let options = CreateVolumeOptions {
            name: name.to_string(),
            driver: driver.to_string(),
            driver_opts,
            ..Default::default()
        };
        self.docker.create_volume(options).await?;
        Ok(())
    }

    async fn remove_volume(&self, name: &str, force: bool) -> EngineResult<()> {
        self.docker
            .remove_volume(name, Some(RemoveVolumeOptions { force }))
            .await?;
        Ok(())
    }
}
