//! Docker engine gateway
//!
//! A thin capability layer over the Docker engine API. The [`DockerBridge`]
//! trait mirrors the engine calls one-to-one so tests can substitute an
//! in-memory implementation; [`EngineClient`] is the typed surface the
//! update engine programs against.

use async_trait::async_trait;
use bollard::container::{
    Config, CreateContainerOptions, InspectContainerOptions, ListContainersOptions,
    RemoveContainerOptions, StartContainerOptions, StopContainerOptions,
};
use bollard::errors::Error as DockerError;
use bollard::image::{CreateImageOptions, ListImagesOptions, RemoveImageOptions, TagImageOptions};
use bollard::models::{
    ContainerCreateResponse, ContainerInspectResponse, ContainerSummary, CreateImageInfo,
    EndpointSettings, HostConfig, ImageInspect, ImageSummary,
};
use bollard::Docker;
use futures::{Stream, StreamExt};
use std::collections::HashMap;
use std::pin::Pin;
use std::sync::Arc;
use tracing::debug;

type ImageStream = Pin<Box<dyn Stream<Item = Result<CreateImageInfo, DockerError>> + Send>>;

/// Engine failures, grouped by how the update engine reacts to them.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("not found: {0}")]
    NotFound(String),
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("authentication rejected: {0}")]
    Auth(String),
    #[error("engine transport error: {0}")]
    Transport(String),
    #[error("{0}")]
    Other(String),
}

impl From<DockerError> for EngineError {
    fn from(err: DockerError) -> Self {
        match err {
            DockerError::DockerResponseServerError {
                status_code,
                message,
            } => match status_code {
                404 => EngineError::NotFound(message),
                409 => EngineError::Conflict(message),
                401 | 403 => EngineError::Auth(message),
                _ => EngineError::Other(message),
            },
            DockerError::IOError { .. } | DockerError::RequestTimeoutError => {
                EngineError::Transport(err.to_string())
            }
            other => EngineError::Other(other.to_string()),
        }
    }
}

impl EngineError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, EngineError::NotFound(_))
    }
}

/// One engine call per method, so a fake bridge can stand in for the
/// daemon in tests.
#[async_trait]
pub trait DockerBridge: Send + Sync {
    async fn ping(&self) -> Result<(), DockerError>;
    async fn list_containers(
        &self,
        options: Option<ListContainersOptions<String>>,
    ) -> Result<Vec<ContainerSummary>, DockerError>;
    async fn inspect_container(
        &self,
        id: &str,
        options: Option<InspectContainerOptions>,
    ) -> Result<ContainerInspectResponse, DockerError>;
    async fn stop_container(
        &self,
        id: &str,
        options: Option<StopContainerOptions>,
    ) -> Result<(), DockerError>;
    async fn remove_container(
        &self,
        id: &str,
        options: Option<RemoveContainerOptions>,
    ) -> Result<(), DockerError>;
    async fn create_container(
        &self,
        options: Option<CreateContainerOptions<String>>,
        config: Config<String>,
    ) -> Result<ContainerCreateResponse, DockerError>;
    async fn start_container(
        &self,
        id: &str,
        options: Option<StartContainerOptions<String>>,
    ) -> Result<(), DockerError>;
    async fn list_images(
        &self,
        options: Option<ListImagesOptions<String>>,
    ) -> Result<Vec<ImageSummary>, DockerError>;
    async fn inspect_image(&self, name: &str) -> Result<ImageInspect, DockerError>;
    fn create_image_stream(&self, options: Option<CreateImageOptions<String>>) -> ImageStream;
    async fn tag_image(
        &self,
        name: &str,
        options: Option<TagImageOptions<String>>,
    ) -> Result<(), DockerError>;
    async fn remove_image(
        &self,
        name: &str,
        options: Option<RemoveImageOptions>,
    ) -> Result<(), DockerError>;
}

struct BollardBridge {
    docker: Docker,
}

#[async_trait]
impl DockerBridge for BollardBridge {
    async fn ping(&self) -> Result<(), DockerError> {
        self.docker.ping().await.map(|_| ())
    }

    async fn list_containers(
        &self,
        options: Option<ListContainersOptions<String>>,
    ) -> Result<Vec<ContainerSummary>, DockerError> {
        self.docker.list_containers(options).await
    }

    async fn inspect_container(
        &self,
        id: &str,
        options: Option<InspectContainerOptions>,
    ) -> Result<ContainerInspectResponse, DockerError> {
        self.docker.inspect_container(id, options).await
    }

    async fn stop_container(
        &self,
        id: &str,
        options: Option<StopContainerOptions>,
    ) -> Result<(), DockerError> {
        self.docker.stop_container(id, options).await
    }

    async fn remove_container(
        &self,
        id: &str,
        options: Option<RemoveContainerOptions>,
    ) -> Result<(), DockerError> {
        self.docker.remove_container(id, options).await
    }

    async fn create_container(
        &self,
        options: Option<CreateContainerOptions<String>>,
        config: Config<String>,
    ) -> Result<ContainerCreateResponse, DockerError> {
        self.docker.create_container(options, config).await
    }

    async fn start_container(
        &self,
        id: &str,
        options: Option<StartContainerOptions<String>>,
    ) -> Result<(), DockerError> {
        self.docker.start_container(id, options).await
    }

    async fn list_images(
        &self,
        options: Option<ListImagesOptions<String>>,
    ) -> Result<Vec<ImageSummary>, DockerError> {
        self.docker.list_images(options).await
    }

    async fn inspect_image(&self, name: &str) -> Result<ImageInspect, DockerError> {
        self.docker.inspect_image(name).await
    }

    fn create_image_stream(&self, options: Option<CreateImageOptions<String>>) -> ImageStream {
        Box::pin(self.docker.create_image(options, None, None))
    }

    async fn tag_image(
        &self,
        name: &str,
        options: Option<TagImageOptions<String>>,
    ) -> Result<(), DockerError> {
        self.docker.tag_image(name, options).await
    }

    async fn remove_image(
        &self,
        name: &str,
        options: Option<RemoveImageOptions>,
    ) -> Result<(), DockerError> {
        self.docker
            .remove_image(name, options, None)
            .await
            .map(|_| ())
    }
}

/// What a pull told us beyond its success: whether the engine reported
/// downloading any layer. Used as a secondary freshness signal.
#[derive(Debug, Default, Clone, Copy)]
pub struct PullOutcome {
    pub newer_layers: bool,
}

const PULL_ACTIVITY_MARKERS: [&str; 4] = [
    "Downloaded newer image",
    "Pulling fs layer",
    "Downloading",
    "Extracting",
];

/// Typed engine operations used by the update engine.
#[derive(Clone)]
pub struct EngineClient {
    bridge: Arc<dyn DockerBridge>,
}

impl EngineClient {
    /// Connect to the local engine, honoring `DOCKER_HOST`, and verify it
    /// answers a ping. Startup fails hard when the engine is unreachable.
    pub async fn connect() -> Result<Self, EngineError> {
        let docker = match std::env::var("DOCKER_HOST") {
            Ok(host) if host.starts_with("tcp://") || host.starts_with("http") => {
                Docker::connect_with_http(&host, 120, bollard::API_DEFAULT_VERSION)?
            }
            Ok(host) if !host.is_empty() => {
                Docker::connect_with_socket(&host, 120, bollard::API_DEFAULT_VERSION)?
            }
            _ => Docker::connect_with_local_defaults()?,
        };
        let bridge = Arc::new(BollardBridge { docker });
        bridge.ping().await?;
        Ok(Self { bridge })
    }

    pub fn with_bridge(bridge: impl DockerBridge + 'static) -> Self {
        Self {
            bridge: Arc::new(bridge),
        }
    }

    pub async fn list_containers(&self, all: bool) -> Result<Vec<ContainerSummary>, EngineError> {
        let options = ListContainersOptions::<String> {
            all,
            ..Default::default()
        };
        Ok(self.bridge.list_containers(Some(options)).await?)
    }

    pub async fn list_containers_by_label(
        &self,
        key: &str,
        value: &str,
    ) -> Result<Vec<ContainerSummary>, EngineError> {
        let mut filters = HashMap::new();
        filters.insert("label".to_string(), vec![format!("{key}={value}")]);
        let options = ListContainersOptions::<String> {
            all: true,
            filters,
            ..Default::default()
        };
        Ok(self.bridge.list_containers(Some(options)).await?)
    }

    pub async fn inspect_container(
        &self,
        id: &str,
    ) -> Result<ContainerInspectResponse, EngineError> {
        Ok(self.bridge.inspect_container(id, None).await?)
    }

    pub async fn stop(&self, id: &str) -> Result<(), EngineError> {
        let options = StopContainerOptions { t: 30 };
        Ok(self.bridge.stop_container(id, Some(options)).await?)
    }

    pub async fn remove(&self, id: &str, force: bool) -> Result<(), EngineError> {
        let options = RemoveContainerOptions {
            force,
            ..Default::default()
        };
        Ok(self.bridge.remove_container(id, Some(options)).await?)
    }

    pub async fn create(&self, name: &str, config: Config<String>) -> Result<String, EngineError> {
        let options = CreateContainerOptions {
            name: name.to_string(),
            platform: None,
        };
        let response = self.bridge.create_container(Some(options), config).await?;
        Ok(response.id)
    }

    pub async fn start(&self, id: &str) -> Result<(), EngineError> {
        Ok(self
            .bridge
            .start_container(id, None::<StartContainerOptions<String>>)
            .await?)
    }

    pub async fn list_images(&self, all: bool) -> Result<Vec<ImageSummary>, EngineError> {
        let options = ListImagesOptions::<String> {
            all,
            ..Default::default()
        };
        Ok(self.bridge.list_images(Some(options)).await?)
    }

    pub async fn inspect_image(&self, name: &str) -> Result<ImageInspect, EngineError> {
        Ok(self.bridge.inspect_image(name).await?)
    }

    /// Pull `repo:tag`, reporting whether the engine downloaded anything.
    pub async fn pull(&self, repo: &str, tag: &str) -> Result<PullOutcome, EngineError> {
        let options = CreateImageOptions {
            from_image: repo.to_string(),
            tag: tag.to_string(),
            ..Default::default()
        };

        let mut outcome = PullOutcome::default();
        let mut stream = self.bridge.create_image_stream(Some(options));
        while let Some(event) = stream.next().await {
            let info = event?;
            if let Some(status) = info.status.as_deref() {
                debug!(repo, tag, status, "pull progress");
                if PULL_ACTIVITY_MARKERS.iter().any(|m| status.contains(m)) {
                    outcome.newer_layers = true;
                }
            }
        }
        Ok(outcome)
    }

    pub async fn tag_image(&self, name: &str, repo: &str, tag: &str) -> Result<(), EngineError> {
        let options = TagImageOptions {
            repo: repo.to_string(),
            tag: tag.to_string(),
        };
        Ok(self.bridge.tag_image(name, Some(options)).await?)
    }

    pub async fn delete_image(&self, name: &str, force: bool) -> Result<(), EngineError> {
        let options = RemoveImageOptions {
            force,
            ..Default::default()
        };
        Ok(self.bridge.remove_image(name, Some(options)).await?)
    }
}

/// Everything needed to recreate a container under a different image.
///
/// Captured from an inspect immediately before the old container is
/// stopped; every preserved field is carried over verbatim.
#[derive(Clone)]
pub struct ContainerSnapshot {
    pub name: String,
    pub image: String,
    config: bollard::models::ContainerConfig,
    host_config: Option<HostConfig>,
    endpoints: Option<HashMap<String, EndpointSettings>>,
}

impl ContainerSnapshot {
    pub fn capture(inspect: &ContainerInspectResponse) -> Result<Self, EngineError> {
        let name = inspect
            .name
            .as_deref()
            .map(|n| n.trim_start_matches('/').to_string())
            .ok_or_else(|| EngineError::Other("container inspect without a name".into()))?;
        let config = inspect
            .config
            .clone()
            .ok_or_else(|| EngineError::Other(format!("container {name} has no config")))?;
        let image = config
            .image
            .clone()
            .ok_or_else(|| EngineError::Other(format!("container {name} has no image")))?;

        Ok(Self {
            name,
            image,
            config,
            host_config: inspect.host_config.clone(),
            endpoints: inspect
                .network_settings
                .as_ref()
                .and_then(|ns| ns.networks.clone()),
        })
    }

    /// Rebuild the create request, substituting only the image.
    pub fn as_create_config(&self, image: &str) -> Config<String> {
        let c = &self.config;
        Config {
            hostname: c.hostname.clone(),
            domainname: c.domainname.clone(),
            user: c.user.clone(),
            attach_stdin: c.attach_stdin,
            attach_stdout: c.attach_stdout,
            attach_stderr: c.attach_stderr,
            exposed_ports: c.exposed_ports.clone(),
            tty: c.tty,
            open_stdin: c.open_stdin,
            stdin_once: c.stdin_once,
            env: c.env.clone(),
            cmd: c.cmd.clone(),
            healthcheck: c.healthcheck.clone(),
            args_escaped: c.args_escaped,
            image: Some(image.to_string()),
            volumes: c.volumes.clone(),
            working_dir: c.working_dir.clone(),
            entrypoint: c.entrypoint.clone(),
            network_disabled: c.network_disabled,
            mac_address: c.mac_address.clone(),
            on_build: c.on_build.clone(),
            labels: c.labels.clone(),
            stop_signal: c.stop_signal.clone(),
            stop_timeout: c.stop_timeout,
            shell: c.shell.clone(),
            host_config: self.host_config.clone(),
            networking_config: self
                .endpoints
                .clone()
                .map(|endpoints_config| bollard::container::NetworkingConfig { endpoints_config }),
            ..Default::default()
        }
    }
}
