//! Image freshness decisions
//!
//! Answers one question: does this reference have a newer image available
//! than what the host currently runs? The default path pulls through the
//! engine and compares local identity before and after; the optional
//! registry-direct path compares manifest digests without pulling.

use crate::docker::EngineClient;
use crate::reference::Reference;
use crate::registry::RegistryProbe;
use tracing::debug;

/// Locally resolved image identity under any canonical alias.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
struct LocalIdentity {
    id: Option<String>,
    digest: Option<String>,
}

pub struct FreshnessOracle {
    engine: EngineClient,
    registry: Option<RegistryProbe>,
}

impl FreshnessOracle {
    pub fn new(engine: EngineClient, registry_check: bool) -> Self {
        Self {
            engine,
            registry: registry_check.then(RegistryProbe::new),
        }
    }

    /// Whether a newer image than the local one exists for `reference`.
    ///
    /// Digest-pinned references are immutable and answer `false` without
    /// touching the network. A reference that was never pulled locally
    /// answers `true` once the pull lands it, which redeploys workloads
    /// whose images were merely absent; that matches operator intent.
    pub async fn has_newer(&self, reference: &Reference) -> bool {
        if reference.is_pinned() {
            return false;
        }

        let before = self.resolve_local(reference).await;

        // Registry mode: digest comparison replaces the pull when it is
        // conclusive. The update path pulls regardless.
        if let Some(probe) = &self.registry {
            if let Some(local_digest) = &before.digest {
                match probe.remote_digest(reference).await {
                    Ok(Some(remote)) => return &remote != local_digest,
                    Ok(None) => {}
                    Err(err) => {
                        debug!(reference = %reference, error = %err, "registry probe failed, falling back to pull");
                    }
                }
            }
        }

        let pulled_newer = match self
            .engine
            .pull(&reference.repository(), reference.tag())
            .await
        {
            Ok(outcome) => outcome.newer_layers,
            Err(err) => {
                debug!(reference = %reference, error = %err, "pull failed, comparing local state only");
                false
            }
        };

        let after = self.resolve_local(reference).await;

        if before.id.is_none() {
            return after.id.is_some();
        }
        // Any change of identity counts, including the image disappearing
        // under us (another client may prune between the two resolutions).
        if before.id != after.id {
            return true;
        }
        if before.digest.is_some() && after.digest.is_some() && before.digest != after.digest {
            return true;
        }
        pulled_newer
    }

    /// Walk the canonical aliases and take the first image the engine
    /// knows. The digest is read from the repo digest recorded for this
    /// repository.
    async fn resolve_local(&self, reference: &Reference) -> LocalIdentity {
        for alias in reference.canonical_aliases() {
            match self.engine.inspect_image(&alias).await {
                Ok(inspect) => {
                    let digest = inspect.repo_digests.as_deref().and_then(|digests| {
                        digests
                            .iter()
                            .find(|d| {
                                d.split('@').next() == Some(reference.repository().as_str())
                            })
                            .or_else(|| digests.first())
                            .and_then(|d| d.split('@').nth(1))
                            .map(str::to_string)
                    });
                    return LocalIdentity {
                        id: inspect.id,
                        digest,
                    };
                }
                Err(err) if err.is_not_found() => continue,
                Err(err) => {
                    debug!(alias = %alias, error = %err, "image inspect failed");
                    continue;
                }
            }
        }
        LocalIdentity::default()
    }
}
