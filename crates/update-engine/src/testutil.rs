//! In-memory Docker bridge for tests.
//!
//! Holds containers and images behind a mutex, records every mutating
//! call, and lets tests script pull results, created-container behavior
//! and failure injection.

use crate::docker::DockerBridge;
use async_trait::async_trait;
use bollard::container::{
    Config, CreateContainerOptions, InspectContainerOptions, ListContainersOptions,
    RemoveContainerOptions, StartContainerOptions, StopContainerOptions,
};
use bollard::errors::Error as DockerError;
use bollard::image::{CreateImageOptions, ListImagesOptions, RemoveImageOptions, TagImageOptions};
use bollard::models::{
    ContainerConfig, ContainerCreateResponse, ContainerInspectResponse, ContainerState,
    ContainerSummary, CreateImageInfo, ImageInspect, ImageSummary,
};
use futures::stream::{self, Stream, StreamExt};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::pin::Pin;
use std::sync::Arc;

type ImageStream = Pin<Box<dyn Stream<Item = Result<CreateImageInfo, DockerError>> + Send>>;

#[derive(Debug, Clone)]
pub struct LocalImage {
    pub id: String,
    pub digest: Option<String>,
}

impl LocalImage {
    pub fn new(id: &str) -> Self {
        Self {
            id: id.to_string(),
            digest: None,
        }
    }

    pub fn with_digest(mut self, digest: &str) -> Self {
        self.digest = Some(digest.to_string());
        self
    }
}

#[derive(Debug, Clone)]
pub struct FakeContainer {
    pub id: String,
    pub name: String,
    pub image: String,
    pub image_id: String,
    pub labels: HashMap<String, String>,
    pub running: bool,
    pub exit_code: i64,
}

impl FakeContainer {
    pub fn running(name: &str, image: &str, image_id: &str) -> Self {
        Self {
            id: format!("id-{name}"),
            name: name.to_string(),
            image: image.to_string(),
            image_id: image_id.to_string(),
            labels: HashMap::new(),
            running: true,
            exit_code: 0,
        }
    }

    pub fn with_label(mut self, key: &str, value: &str) -> Self {
        self.labels.insert(key.to_string(), value.to_string());
        self
    }
}

/// How containers created during the test behave when inspected.
#[derive(Debug, Clone, Copy, Default)]
pub enum CreatedBehavior {
    #[default]
    RunsHealthy,
    ExitsWith(i64),
}

#[derive(Default)]
struct FakeState {
    containers: Vec<FakeContainer>,
    images: HashMap<String, LocalImage>,
    image_list: Vec<ImageSummary>,
    after_pull: HashMap<String, LocalImage>,
    drop_on_pull: Vec<String>,
    pull_reports_layers: bool,
    fail_pull: bool,
    fail_tag: bool,
    fail_create: bool,
    fail_start: bool,
    created_behavior: CreatedBehavior,
    // recorded calls
    tagged: Vec<(String, String, String)>,
    created: Vec<(String, Config<String>)>,
    started: Vec<String>,
    stopped: Vec<String>,
    removed_containers: Vec<String>,
    removed_images: Vec<String>,
    pulled: Vec<String>,
}

#[derive(Default, Clone)]
pub struct FakeDocker {
    state: Arc<Mutex<FakeState>>,
}

fn server_error(status_code: u16, message: &str) -> DockerError {
    DockerError::DockerResponseServerError {
        status_code,
        message: message.to_string(),
    }
}

impl FakeDocker {
    pub fn add_container(&self, container: FakeContainer) {
        self.state.lock().containers.push(container);
    }

    pub fn insert_image(&self, alias: &str, image: LocalImage) {
        self.state.lock().images.insert(alias.to_string(), image);
    }

    pub fn add_image_summary(&self, id: &str, repo_tags: &[&str], repo_digests: &[&str]) {
        self.state.lock().image_list.push(ImageSummary {
            id: id.to_string(),
            repo_tags: repo_tags.iter().map(|s| s.to_string()).collect(),
            repo_digests: repo_digests.iter().map(|s| s.to_string()).collect(),
            ..Default::default()
        });
    }

    /// Images that appear locally once anything is pulled.
    pub fn install_after_pull(&self, alias: &str, image: LocalImage) {
        self.state
            .lock()
            .after_pull
            .insert(alias.to_string(), image);
    }

    /// Images that vanish once anything is pulled, as if another client
    /// deleted them mid-cycle.
    pub fn drop_on_pull(&self, alias: &str) {
        self.state.lock().drop_on_pull.push(alias.to_string());
    }

    pub fn set_pull_reports_layers(&self, yes: bool) {
        self.state.lock().pull_reports_layers = yes;
    }

    pub fn fail_pulls(&self) {
        self.state.lock().fail_pull = true;
    }

    pub fn fail_tagging(&self) {
        self.state.lock().fail_tag = true;
    }

    pub fn fail_creates(&self) {
        self.state.lock().fail_create = true;
    }

    pub fn fail_starts(&self) {
        self.state.lock().fail_start = true;
    }

    pub fn set_created_behavior(&self, behavior: CreatedBehavior) {
        self.state.lock().created_behavior = behavior;
    }

    pub fn tagged(&self) -> Vec<(String, String, String)> {
        self.state.lock().tagged.clone()
    }

    pub fn created(&self) -> Vec<(String, Config<String>)> {
        self.state.lock().created.clone()
    }

    pub fn started(&self) -> Vec<String> {
        self.state.lock().started.clone()
    }

    pub fn stopped(&self) -> Vec<String> {
        self.state.lock().stopped.clone()
    }

    pub fn removed_containers(&self) -> Vec<String> {
        self.state.lock().removed_containers.clone()
    }

    pub fn removed_images(&self) -> Vec<String> {
        self.state.lock().removed_images.clone()
    }

    pub fn pulled(&self) -> Vec<String> {
        self.state.lock().pulled.clone()
    }

    pub fn containers(&self) -> Vec<FakeContainer> {
        self.state.lock().containers.clone()
    }

    fn inspect_response(container: &FakeContainer) -> ContainerInspectResponse {
        ContainerInspectResponse {
            id: Some(container.id.clone()),
            name: Some(format!("/{}", container.name)),
            image: Some(container.image_id.clone()),
            config: Some(ContainerConfig {
                image: Some(container.image.clone()),
                labels: Some(container.labels.clone()),
                ..Default::default()
            }),
            state: Some(ContainerState {
                running: Some(container.running),
                exit_code: Some(container.exit_code),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    fn summary(container: &FakeContainer) -> ContainerSummary {
        ContainerSummary {
            id: Some(container.id.clone()),
            names: Some(vec![format!("/{}", container.name)]),
            image: Some(container.image.clone()),
            image_id: Some(container.image_id.clone()),
            labels: Some(container.labels.clone()),
            state: Some(if container.running {
                "running".to_string()
            } else {
                "exited".to_string()
            }),
            ..Default::default()
        }
    }
}

#[async_trait]
impl DockerBridge for FakeDocker {
    async fn ping(&self) -> Result<(), DockerError> {
        Ok(())
    }

    async fn list_containers(
        &self,
        options: Option<ListContainersOptions<String>>,
    ) -> Result<Vec<ContainerSummary>, DockerError> {
        let state = self.state.lock();
        let label_filter = options
            .as_ref()
            .and_then(|o| o.filters.get("label"))
            .and_then(|labels| labels.first())
            .and_then(|l| l.split_once('='))
            .map(|(k, v)| (k.to_string(), v.to_string()));
        Ok(state
            .containers
            .iter()
            .filter(|c| match &label_filter {
                Some((k, v)) => c.labels.get(k) == Some(v),
                None => true,
            })
            .map(Self::summary)
            .collect())
    }

    async fn inspect_container(
        &self,
        id: &str,
        _options: Option<InspectContainerOptions>,
    ) -> Result<ContainerInspectResponse, DockerError> {
        let state = self.state.lock();
        state
            .containers
            .iter()
            .find(|c| c.id == id || c.name == id)
            .map(Self::inspect_response)
            .ok_or_else(|| server_error(404, "no such container"))
    }

    async fn stop_container(
        &self,
        id: &str,
        _options: Option<StopContainerOptions>,
    ) -> Result<(), DockerError> {
        let mut state = self.state.lock();
        state.stopped.push(id.to_string());
        if let Some(c) = state
            .containers
            .iter_mut()
            .find(|c| c.id == id || c.name == id)
        {
            c.running = false;
        }
        Ok(())
    }

    async fn remove_container(
        &self,
        id: &str,
        _options: Option<RemoveContainerOptions>,
    ) -> Result<(), DockerError> {
        let mut state = self.state.lock();
        state.removed_containers.push(id.to_string());
        state.containers.retain(|c| c.id != id && c.name != id);
        Ok(())
    }

    async fn create_container(
        &self,
        options: Option<CreateContainerOptions<String>>,
        config: Config<String>,
    ) -> Result<ContainerCreateResponse, DockerError> {
        let mut state = self.state.lock();
        if state.fail_create {
            return Err(server_error(500, "create failed"));
        }
        let name = options.map(|o| o.name).unwrap_or_default();
        let id = format!("created-{name}-{}", state.created.len());
        let (running, exit_code) = match state.created_behavior {
            CreatedBehavior::RunsHealthy => (true, 0),
            CreatedBehavior::ExitsWith(code) => (false, code),
        };
        state.containers.push(FakeContainer {
            id: id.clone(),
            name: name.clone(),
            image: config.image.clone().unwrap_or_default(),
            image_id: "sha256:created".to_string(),
            labels: config.labels.clone().unwrap_or_default(),
            running,
            exit_code,
        });
        state.created.push((name, config));
        Ok(ContainerCreateResponse {
            id,
            warnings: Vec::new(),
        })
    }

    async fn start_container(
        &self,
        id: &str,
        _options: Option<StartContainerOptions<String>>,
    ) -> Result<(), DockerError> {
        let mut state = self.state.lock();
        if state.fail_start {
            return Err(server_error(500, "start failed"));
        }
        state.started.push(id.to_string());
        Ok(())
    }

    async fn list_images(
        &self,
        _options: Option<ListImagesOptions<String>>,
    ) -> Result<Vec<ImageSummary>, DockerError> {
        Ok(self.state.lock().image_list.clone())
    }

    async fn inspect_image(&self, name: &str) -> Result<ImageInspect, DockerError> {
        let state = self.state.lock();
        let image = state
            .images
            .get(name)
            .ok_or_else(|| server_error(404, "no such image"))?;
        let repo = name.split(&[':', '@'][..]).next().unwrap_or(name);
        Ok(ImageInspect {
            id: Some(image.id.clone()),
            repo_digests: image
                .digest
                .as_ref()
                .map(|d| vec![format!("{repo}@{d}")]),
            ..Default::default()
        })
    }

    fn create_image_stream(&self, options: Option<CreateImageOptions<String>>) -> ImageStream {
        let mut state = self.state.lock();
        if let Some(options) = options {
            state
                .pulled
                .push(format!("{}:{}", options.from_image, options.tag));
        }
        if state.fail_pull {
            return stream::iter(vec![Err(server_error(500, "pull failed"))]).boxed();
        }
        let dropped = std::mem::take(&mut state.drop_on_pull);
        for alias in dropped {
            state.images.remove(&alias);
        }
        let installed: Vec<_> = state.after_pull.drain().collect();
        for (alias, image) in installed {
            state.images.insert(alias, image);
        }
        let status = if state.pull_reports_layers {
            "Downloading"
        } else {
            "Status: Image is up to date"
        };
        stream::iter(vec![Ok(CreateImageInfo {
            status: Some(status.to_string()),
            ..Default::default()
        })])
        .boxed()
    }

    async fn tag_image(
        &self,
        name: &str,
        options: Option<TagImageOptions<String>>,
    ) -> Result<(), DockerError> {
        let mut state = self.state.lock();
        if state.fail_tag {
            return Err(server_error(500, "tag failed"));
        }
        if let Some(options) = options {
            state
                .tagged
                .push((name.to_string(), options.repo, options.tag));
        }
        Ok(())
    }

    async fn remove_image(
        &self,
        name: &str,
        _options: Option<RemoveImageOptions>,
    ) -> Result<(), DockerError> {
        self.state.lock().removed_images.push(name.to_string());
        Ok(())
    }
}
