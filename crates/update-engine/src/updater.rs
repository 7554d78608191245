//! Per-container update state machine
//!
//! Idle → BackupTagging → Replacing → HealthProbing → Committed,
//! RolledBack or Abandoned. The previous image is tagged
//! `<repo>:backup-<UTC stamp>` before anything is touched; that tag is
//! the only rollback artifact and survives process restarts.

use crate::docker::{ContainerSnapshot, EngineClient, EngineError};
use crate::reference::Reference;
use chrono::Utc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{error, info, warn};

const HEALTH_POLL_INTERVAL: Duration = Duration::from_secs(2);

/// Terminal states of one update attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateOutcome {
    /// The container now runs the new image.
    Committed,
    /// The new image failed; the container was recreated from the backup
    /// tag and must be left alone until an operator intervenes.
    RolledBack,
    /// Nothing was changed on the container.
    Abandoned,
}

pub struct ContainerUpdater {
    engine: EngineClient,
    health_window: Duration,
}

impl ContainerUpdater {
    pub fn new(engine: EngineClient, health_window: Duration) -> Self {
        Self {
            engine,
            health_window,
        }
    }

    /// Replace `container_id` with a container running the freshly pulled
    /// image for `reference`, rolling back to the backup tag when the new
    /// container fails its health window.
    pub async fn update(&self, container_id: &str, reference: &Reference) -> UpdateOutcome {
        let repo = reference.repository();

        let inspect = match self.engine.inspect_container(container_id).await {
            Ok(i) => i,
            Err(err) => {
                warn!(container_id, error = %err, "container vanished before update");
                return UpdateOutcome::Abandoned;
            }
        };
        let old_image_id = match inspect.image.as_deref() {
            Some(id) => id.to_string(),
            None => {
                warn!(container_id, "inspect returned no image id");
                return UpdateOutcome::Abandoned;
            }
        };
        let snapshot = match ContainerSnapshot::capture(&inspect) {
            Ok(s) => s,
            Err(err) => {
                warn!(container_id, error = %err, "cannot snapshot container");
                return UpdateOutcome::Abandoned;
            }
        };

        // BackupTagging: without the rollback artifact no replacement
        // happens at all.
        let backup_tag = format!("backup-{}", Utc::now().format("%Y%m%d%H%M%S"));
        if let Err(err) = self.engine.tag_image(&old_image_id, &repo, &backup_tag).await {
            warn!(
                container = %snapshot.name,
                error = %err,
                "backup tagging failed, leaving container untouched"
            );
            return UpdateOutcome::Abandoned;
        }

        // Replacing. Stop and remove are best-effort so a create can be
        // attempted even when the old container is already gone.
        if let Err(err) = self.engine.stop(container_id).await {
            warn!(container = %snapshot.name, error = %err, "stop failed");
        }
        if let Err(err) = self.engine.remove(container_id, true).await {
            warn!(container = %snapshot.name, error = %err, "remove failed");
        }

        let new_image = format!("{repo}:{}", reference.tag());
        let new_id = match self.replace(&snapshot, &new_image).await {
            Ok(id) => id,
            Err(err) => {
                error!(
                    container = %snapshot.name,
                    image = %new_image,
                    error = %err,
                    "create or start failed, rolling back"
                );
                self.rollback(&snapshot, &repo, &backup_tag, None).await;
                return UpdateOutcome::RolledBack;
            }
        };

        // HealthProbing: watch the replacement for the configured window.
        match self.probe_health(&new_id).await {
            HealthVerdict::Healthy => {
                info!(
                    container = %snapshot.name,
                    image = %new_image,
                    backup = %format!("{repo}:{backup_tag}"),
                    "update committed"
                );
                UpdateOutcome::Committed
            }
            HealthVerdict::Failed(reason) => {
                error!(
                    container = %snapshot.name,
                    image = %new_image,
                    %reason, "new container unhealthy, rolling back"
                );
                self.rollback(&snapshot, &repo, &backup_tag, Some(&new_id)).await;
                UpdateOutcome::RolledBack
            }
        }
    }

    async fn replace(
        &self,
        snapshot: &ContainerSnapshot,
        image: &str,
    ) -> Result<String, EngineError> {
        let config = snapshot.as_create_config(image);
        let id = self.engine.create(&snapshot.name, config).await?;
        self.engine.start(&id).await?;
        Ok(id)
    }

    async fn probe_health(&self, container_id: &str) -> HealthVerdict {
        let deadline = Instant::now() + self.health_window;
        loop {
            match self.engine.inspect_container(container_id).await {
                Ok(inspect) => {
                    let state = inspect.state.unwrap_or_default();
                    if !state.running.unwrap_or(false) {
                        let exit_code = state.exit_code.unwrap_or(-1);
                        // A clean exit is a legitimate short-lived workload.
                        return if exit_code == 0 {
                            HealthVerdict::Healthy
                        } else {
                            HealthVerdict::Failed(format!("exited with code {exit_code}"))
                        };
                    }
                }
                Err(err) => {
                    return HealthVerdict::Failed(format!("inspect failed: {err}"));
                }
            }
            if Instant::now() >= deadline {
                return HealthVerdict::Healthy;
            }
            tokio::time::sleep(HEALTH_POLL_INTERVAL).await;
        }
    }

    /// Recreate from the snapshot under the backup tag. Attempted at most
    /// once per update; failures here are logged and left for the
    /// operator, the backup tag itself is still in place.
    async fn rollback(
        &self,
        snapshot: &ContainerSnapshot,
        repo: &str,
        backup_tag: &str,
        failed_id: Option<&str>,
    ) {
        if let Some(id) = failed_id {
            if let Err(err) = self.engine.stop(id).await {
                warn!(container = %snapshot.name, error = %err, "stopping failed container");
            }
            if let Err(err) = self.engine.remove(id, true).await {
                warn!(container = %snapshot.name, error = %err, "removing failed container");
            }
        }
        let backup_image = format!("{repo}:{backup_tag}");
        match self.replace(snapshot, &backup_image).await {
            Ok(_) => info!(
                container = %snapshot.name,
                image = %backup_image,
                "rolled back to backup image"
            ),
            Err(err) => error!(
                container = %snapshot.name,
                image = %backup_image,
                error = %err,
                "rollback failed, container is down"
            ),
        }
    }
}

enum HealthVerdict {
    Healthy,
    Failed(String),
}
