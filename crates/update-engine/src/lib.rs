//! Update engine
//!
//! Keeps a single Docker host's workloads on fresh images. One cycle runs
//! three ordered phases:
//! - **Prune**: drop backup tags that aged out of retention
//! - **Stacks**: redeploy outdated orchestrator-managed stacks
//! - **Containers**: recreate outdated standalone containers, with a
//!   tagged backup image and rollback on failed health
//!
//! Phases never overlap and iterate sequentially; concurrent mutation of
//! engine state from one process would race the Docker daemon. A failing
//! phase (or item) logs and the cycle moves on. Only an unreachable
//! engine at startup or invalid configuration is fatal to the process.

pub mod config;
pub mod docker;
pub mod freshness;
pub mod portainer;
pub mod prune;
pub mod reference;
pub mod registry;
pub mod schedule;
pub mod stacks;
pub mod updater;

#[cfg(test)]
mod testutil;

pub use config::{EngineSettings, PortainerAuth, PortainerConfig};
pub use docker::{EngineClient, EngineError};
pub use portainer::PortainerClient;
pub use reference::Reference;
pub use schedule::{ScheduleError, UpdateMode};

use freshness::FreshnessOracle;
use prune::ImagePruner;
use stacks::StackPhase;
use std::collections::HashSet;
use tracing::{debug, error, info, warn};
use updater::{ContainerUpdater, UpdateOutcome};

/// Book-keeping for one cycle. Rebuilt at the start of every cycle; only
/// quarantine entries (rollback victims) outlive it, via [`UpdateEngine`].
#[derive(Debug, Default)]
pub struct CycleState {
    /// Containers the container phase must not touch: members of stacks
    /// redeployed earlier this cycle plus quarantined rollback victims.
    pub ignored_containers: HashSet<String>,
    /// Repositories seen inside any stack's compose file this cycle.
    pub stack_repos: HashSet<String>,
}

pub struct UpdateEngine {
    engine: EngineClient,
    portainer: Option<PortainerClient>,
    oracle: FreshnessOracle,
    updater: ContainerUpdater,
    pruner: ImagePruner,
    settings: EngineSettings,
    /// Containers rolled back in some earlier cycle. They stay ignored
    /// until an operator intervenes (or the process restarts).
    quarantined: HashSet<String>,
}

impl UpdateEngine {
    pub fn new(
        engine: EngineClient,
        portainer: Option<PortainerClient>,
        settings: EngineSettings,
    ) -> Self {
        let oracle = FreshnessOracle::new(engine.clone(), settings.registry_check);
        let updater = ContainerUpdater::new(engine.clone(), settings.health_window);
        let pruner = ImagePruner::new(engine.clone(), settings.backup_retention);
        Self {
            engine,
            portainer,
            oracle,
            updater,
            pruner,
            settings,
            quarantined: HashSet::new(),
        }
    }

    pub fn quarantined(&self) -> &HashSet<String> {
        &self.quarantined
    }

    /// One full Prune → Stacks → Containers pass.
    pub async fn run_cycle(&mut self) {
        let mut cycle = CycleState {
            ignored_containers: self.quarantined.clone(),
            stack_repos: HashSet::new(),
        };

        match self.pruner.run().await {
            Ok(report) => {
                if !report.deleted.is_empty() {
                    info!(
                        deleted = report.deleted.len(),
                        kept = report.kept,
                        "prune phase finished"
                    );
                }
            }
            Err(err) => error!(error = %err, "prune phase failed"),
        }

        if let Some(portainer) = &self.portainer {
            StackPhase {
                engine: &self.engine,
                portainer,
                oracle: &self.oracle,
                exclude_patterns: &self.settings.exclude_patterns,
            }
            .run(&mut cycle)
            .await;
        }

        self.container_phase(&mut cycle).await;
    }

    async fn container_phase(&mut self, cycle: &mut CycleState) {
        let containers = match self.engine.list_containers(true).await {
            Ok(containers) => containers,
            Err(err) => {
                error!(error = %err, "cannot list containers, skipping container phase");
                return;
            }
        };

        for container in containers {
            let Some(image) = container.image.clone() else {
                continue;
            };
            let name = container
                .names
                .as_deref()
                .and_then(|names| names.first())
                .map(|n| n.trim_start_matches('/').to_string())
                .unwrap_or_default();

            // Skip rules, in order. First match wins.
            if image.starts_with("sha256:") {
                debug!(container = %name, "created from a bare digest, skipping");
                continue;
            }
            if self.is_excluded(&image, &name) {
                debug!(container = %name, image = %image, "excluded by pattern");
                continue;
            }
            if cycle.ignored_containers.contains(&name) {
                debug!(container = %name, "ignored this cycle");
                continue;
            }
            let reference = match Reference::parse(&image) {
                Ok(r) => r,
                Err(err) => {
                    warn!(container = %name, image = %image, error = %err, "unparseable image reference");
                    continue;
                }
            };
            if cycle.stack_repos.contains(&reference.repository()) {
                debug!(container = %name, image = %image, "repository belongs to a stack");
                continue;
            }
            if reference.is_pinned() {
                debug!(container = %name, image = %image, "digest-pinned, immutable");
                continue;
            }

            if !self.oracle.has_newer(&reference).await {
                debug!(container = %name, image = %image, "no update available");
                continue;
            }

            let id = container.id.clone().unwrap_or_else(|| name.clone());
            info!(container = %name, image = %image, "updating container");
            match self.updater.update(&id, &reference).await {
                UpdateOutcome::Committed => {}
                UpdateOutcome::RolledBack => {
                    self.quarantined.insert(name.clone());
                    cycle.ignored_containers.insert(name);
                }
                UpdateOutcome::Abandoned => {}
            }
        }
    }

    fn is_excluded(&self, image: &str, name: &str) -> bool {
        self.settings
            .exclude_patterns
            .iter()
            .any(|p| image.contains(p) || name.contains(p))
    }
}
