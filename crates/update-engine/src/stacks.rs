//! Stack phase
//!
//! Walks every stack the orchestrator manages, redeploys the ones whose
//! images have newer versions, and records which containers and
//! repositories the container phase must leave alone this cycle. Stacks
//! own their containers; updating one of them behind the orchestrator's
//! back would fork the deployment state.

use crate::docker::EngineClient;
use crate::freshness::FreshnessOracle;
use crate::portainer::{PortainerClient, PortainerError, Stack};
use crate::reference::Reference;
use crate::CycleState;
use tracing::{debug, error, info, warn};

/// Engine-side label joining a container to its compose project.
pub const COMPOSE_PROJECT_LABEL: &str = "com.docker.compose.project";

pub struct StackPhase<'a> {
    pub engine: &'a EngineClient,
    pub portainer: &'a PortainerClient,
    pub oracle: &'a FreshnessOracle,
    pub exclude_patterns: &'a [String],
}

impl StackPhase<'_> {
    pub async fn run(&self, cycle: &mut CycleState) {
        let stacks = match self.portainer.list_stacks().await {
            Ok(stacks) => stacks,
            Err(PortainerError::Auth(reason)) => {
                warn!(%reason, "orchestrator rejected authentication, skipping stacks this cycle");
                return;
            }
            Err(err) => {
                warn!(error = %err, "cannot list stacks, skipping stacks this cycle");
                return;
            }
        };

        for stack in stacks {
            if !stack.is_supported() {
                debug!(stack = %stack.name, stack_type = stack.stack_type, "unsupported stack type");
                continue;
            }
            self.process_stack(&stack, cycle).await;
        }
    }

    async fn process_stack(&self, stack: &Stack, cycle: &mut CycleState) {
        let stack_file = match self.portainer.stack_file(stack.id).await {
            Ok(yaml) => yaml,
            Err(PortainerError::StackFileMissing) => {
                warn!(stack = %stack.name, "stack has no stored compose file, skipping");
                return;
            }
            Err(err) => {
                warn!(stack = %stack.name, error = %err, "cannot fetch stack file, skipping");
                return;
            }
        };

        let mut images = self.images_in_use(stack).await;
        if images.is_empty() {
            // No containers carry the project label (stack scaled to zero
            // or not yet deployed); fall back to what the manifest names.
            images = scan_manifest_images(&stack_file);
        }

        let mut needs_update = false;
        for image in &images {
            let reference = match Reference::parse(image) {
                Ok(r) => r,
                Err(err) => {
                    warn!(stack = %stack.name, %image, error = %err, "unparseable image in stack");
                    continue;
                }
            };
            // Recorded regardless of filters: the container phase must not
            // second-guess this stack's images either way.
            cycle.stack_repos.insert(reference.repository());

            if self.is_excluded(image) {
                debug!(stack = %stack.name, %image, "image excluded by pattern");
                continue;
            }
            if reference.is_pinned() {
                debug!(stack = %stack.name, %image, "digest-pinned image is immutable");
                continue;
            }
            if !needs_update && self.oracle.has_newer(&reference).await {
                info!(stack = %stack.name, %image, "stack image has a newer version");
                needs_update = true;
            }
        }

        if !needs_update {
            debug!(stack = %stack.name, "stack is current");
            return;
        }

        let env = match self.portainer.stack_env(stack.id).await {
            Ok(env) => env,
            Err(err) => {
                warn!(stack = %stack.name, error = %err, "cannot fetch stack env, skipping redeploy");
                return;
            }
        };

        if let Err(err) = self
            .portainer
            .redeploy(stack.id, stack.endpoint_id, &stack_file, &env)
            .await
        {
            // stack_repos is already populated, so the container phase
            // still keeps its hands off these images.
            error!(stack = %stack.name, error = %err, "stack redeploy failed");
            return;
        }
        info!(stack = %stack.name, "stack redeployed");

        match self
            .engine
            .list_containers_by_label(COMPOSE_PROJECT_LABEL, &stack.name)
            .await
        {
            Ok(containers) => {
                for container in containers {
                    for name in container.names.unwrap_or_default() {
                        cycle
                            .ignored_containers
                            .insert(name.trim_start_matches('/').to_string());
                    }
                }
            }
            Err(err) => {
                warn!(stack = %stack.name, error = %err, "cannot list stack containers after redeploy");
            }
        }
    }

    async fn images_in_use(&self, stack: &Stack) -> Vec<String> {
        match self
            .engine
            .list_containers_by_label(COMPOSE_PROJECT_LABEL, &stack.name)
            .await
        {
            Ok(containers) => containers.into_iter().filter_map(|c| c.image).collect(),
            Err(err) => {
                warn!(stack = %stack.name, error = %err, "cannot list stack containers");
                Vec::new()
            }
        }
    }

    fn is_excluded(&self, image: &str) -> bool {
        self.exclude_patterns.iter().any(|p| image.contains(p))
    }
}

/// Image references named by a compose manifest. Parsed properly when the
/// YAML is well formed; otherwise degrades to scanning for `image:` lines,
/// which over-matches inside block scalars but never misses a service.
pub fn scan_manifest_images(manifest: &str) -> Vec<String> {
    if let Ok(value) = serde_yaml::from_str::<serde_yaml::Value>(manifest) {
        if let Some(services) = value.get("services").and_then(|s| s.as_mapping()) {
            let images: Vec<String> = services
                .values()
                .filter_map(|service| service.get("image"))
                .filter_map(|image| image.as_str())
                .map(str::to_string)
                .collect();
            if !images.is_empty() {
                return images;
            }
        }
    }

    manifest
        .lines()
        .filter_map(|line| line.trim().strip_prefix("image:"))
        .map(|rest| rest.trim().trim_matches('"').trim_matches('\'').to_string())
        .filter(|image| !image.is_empty())
        .collect()
}
