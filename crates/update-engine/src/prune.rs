//! Backup-tag garbage collection
//!
//! Runs first in every cycle, so a backup tag is never deleted in the
//! cycle that created it. Only repositories that currently have an image
//! in use by some container are touched; anything the operator pre-pulled
//! but has not deployed yet is left alone.

use crate::docker::{EngineClient, EngineError};
use chrono::{NaiveDateTime, TimeZone, Utc};
use regex::Regex;
use std::collections::{HashMap, HashSet};
use std::time::Duration;
use tracing::{debug, info, warn};

#[derive(Debug, Default)]
pub struct PruneReport {
    pub deleted: Vec<String>,
    pub kept: usize,
}

pub struct ImagePruner {
    engine: EngineClient,
    retention: Duration,
    backup_stamp: Regex,
}

struct TagEntry {
    image_id: String,
    repo: String,
    tag: String,
}

/// One repository's prune candidates. Membership (and the in-use bit) is
/// derived from repo digests, so images the engine only knows by digest
/// still count; tags are only what can actually be deleted.
#[derive(Default)]
struct RepoGroup {
    in_use: bool,
    entries: Vec<TagEntry>,
}

impl ImagePruner {
    pub fn new(engine: EngineClient, retention: Duration) -> Self {
        Self {
            engine,
            retention,
            backup_stamp: Regex::new(r"^backup-(\d{14})$").expect("static regex"),
        }
    }

    pub async fn run(&self) -> Result<PruneReport, EngineError> {
        let used_ids: HashSet<String> = self
            .engine
            .list_containers(true)
            .await?
            .into_iter()
            .filter_map(|c| c.image_id)
            .collect();

        let mut by_repo: HashMap<String, RepoGroup> = HashMap::new();
        for image in self.engine.list_images(false).await? {
            // An image's repositories come from its repo digests; images
            // that were never pushed or pulled carry none and fall back to
            // their tags.
            let mut repos: Vec<String> = image
                .repo_digests
                .iter()
                .filter_map(|d| d.split('@').next())
                .map(str::to_string)
                .collect();
            if repos.is_empty() {
                repos = image
                    .repo_tags
                    .iter()
                    .filter_map(|t| t.rsplit_once(':'))
                    .map(|(repo, _)| repo.to_string())
                    .collect();
            }
            repos.sort();
            repos.dedup();

            let in_use = used_ids.contains(&image.id);
            for repo in &repos {
                let group = by_repo.entry(repo.clone()).or_default();
                group.in_use |= in_use;
            }

            for repo_tag in &image.repo_tags {
                let Some((repo, tag)) = repo_tag.rsplit_once(':') else {
                    continue;
                };
                by_repo
                    .entry(repo.to_string())
                    .or_default()
                    .entries
                    .push(TagEntry {
                        image_id: image.id.clone(),
                        repo: repo.to_string(),
                        tag: tag.to_string(),
                    });
            }
        }

        let now = Utc::now();
        let mut report = PruneReport::default();
        for (repo, group) in by_repo {
            if !group.in_use {
                debug!(%repo, "no image of this repository is in use, leaving it alone");
                report.kept += group.entries.len();
                continue;
            }
            for entry in group.entries {
                if used_ids.contains(&entry.image_id) {
                    report.kept += 1;
                    continue;
                }
                if self.expendable(&entry, now) {
                    let name = format!("{}:{}", entry.repo, entry.tag);
                    match self.engine.delete_image(&name, false).await {
                        Ok(()) => {
                            info!(image = %name, "pruned");
                            report.deleted.push(name);
                        }
                        Err(err) => warn!(image = %name, error = %err, "prune delete failed"),
                    }
                } else {
                    report.kept += 1;
                }
            }
        }
        Ok(report)
    }

    /// An unused entry survives only as a backup tag still inside the
    /// retention window. Unused non-backup tags of an in-use repository
    /// and backup tags with unreadable stamps go.
    fn expendable(&self, entry: &TagEntry, now: chrono::DateTime<Utc>) -> bool {
        let Some(captures) = self.backup_stamp.captures(&entry.tag) else {
            return true;
        };
        let stamp = &captures[1];
        match NaiveDateTime::parse_from_str(stamp, "%Y%m%d%H%M%S") {
            Ok(naive) => {
                let tagged_at = Utc.from_utc_datetime(&naive);
                let age = (now - tagged_at).to_std().unwrap_or_default();
                age > self.retention
            }
            Err(_) => {
                warn!(tag = %entry.tag, "backup tag with malformed stamp");
                true
            }
        }
    }
}
